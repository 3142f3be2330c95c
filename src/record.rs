//! Records and the write graph
//!
//! A nested write is flattened into a [`WriteGraph`]: an arena of [`Record`]s
//! that reference each other through [`Link`] placeholders. Each record is
//! turned into its primitive column form right before its own statement runs
//! ([`WriteGraph::prepare_data`]), receives the row the store returned
//! ([`WriteGraph::merge_data`]) and, once every statement has run, the graph is
//! collapsed back into the nested response shape ([`WriteGraph::materialize`]).

use crate::links::{GenericLink, Link, RecordId, Slot, GENERIC_OBJECT_KEY};
use crate::meta::{FieldType, Meta, Method};
use crate::types::{Value, ValueMap};
use chrono::{SecondsFormat, Utc};
use std::collections::HashMap;
use std::sync::Arc;

/// One row of application data for a meta
#[derive(Debug, Clone)]
pub struct Record {
    pub meta: Arc<Meta>,
    pub data: ValueMap,
    /// Primitive projection sent to the store
    pub raw_data: ValueMap,
    /// Position inside a parent's array field, for children of a nested write
    pub slot: Option<Slot>,
}

impl Record {
    pub fn new(meta: Arc<Meta>, data: ValueMap) -> Self {
        Record {
            meta,
            data,
            raw_data: ValueMap::new(),
            slot: None,
        }
    }

    pub fn with_slot(mut self, slot: Slot) -> Self {
        self.slot = Some(slot);
        self
    }

    /// Primary key value, `Null` when absent
    pub fn pk(&self) -> Value {
        match self.data.get(&self.meta.key) {
            Some(Value::Link(Link::Key(v))) => (**v).clone(),
            Some(Value::Link(_)) | None => Value::Null,
            Some(v) => v.clone(),
        }
    }

    /// A record without a key has not been stored yet
    pub fn is_phantom(&self) -> bool {
        self.pk().is_null()
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }
}

/// Arena of the records touched by one nested write
#[derive(Debug, Default)]
pub struct WriteGraph {
    records: Vec<Record>,
}

impl WriteGraph {
    pub fn new() -> Self {
        WriteGraph { records: Vec::new() }
    }

    pub fn add(&mut self, record: Record) -> RecordId {
        self.records.push(record);
        RecordId(self.records.len() - 1)
    }

    pub fn get(&self, id: RecordId) -> &Record {
        &self.records[id.0]
    }

    pub fn get_mut(&mut self, id: RecordId) -> &mut Record {
        &mut self.records[id.0]
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn pk(&self, id: RecordId) -> Value {
        self.get(id).pk()
    }

    /// Project a record onto its table columns, resolving placeholders.
    ///
    /// Auto-valued time fields are filled according to `method`. The result is
    /// also kept as the record's `raw_data`.
    pub fn prepare_data(&mut self, id: RecordId, method: Method) -> ValueMap {
        let record = self.get(id);
        let meta = record.meta.clone();
        let mut raw = ValueMap::new();
        for field in meta.table_fields() {
            let value = match record.data.get(&field.name) {
                Some(Value::Link(link)) => self.link_to_primitive(link),
                Some(value) => value.clone(),
                None => {
                    let auto = match method {
                        Method::Create => field.now_on_create,
                        Method::Update => field.now_on_update,
                        Method::Remove => false,
                    };
                    match auto.then(|| now_for(field.field_type)).flatten() {
                        Some(now) => now,
                        None => continue,
                    }
                }
            };
            raw.insert(field.name.clone(), value);
        }
        self.get_mut(id).raw_data = raw.clone();
        raw
    }

    fn link_to_primitive(&self, link: &Link) -> Value {
        match link {
            Link::Key(value) => (**value).clone(),
            Link::Nested(other) | Link::Owner(other) => self.pk(*other),
            Link::Generic(generic) => generic.as_value(),
            Link::NestedGeneric { object, record } | Link::GenericOwner { object, record } => {
                let other = self.get(*record);
                GenericLink::new(object.clone(), other.meta.key.clone(), other.pk()).as_value()
            }
        }
    }

    /// Take over the row returned by the store, keeping nested placeholders
    pub fn merge_data(&mut self, id: RecordId, row: ValueMap) {
        let record = self.get_mut(id);
        for (name, value) in row {
            let keep = matches!(record.data.get(&name), Some(Value::Link(link)) if link.is_nested());
            if !keep {
                record.data.insert(name, value);
            }
        }
    }

    /// Data of `id` with placeholders replaced by primitive values
    pub fn flat_data(&self, id: RecordId) -> ValueMap {
        self.get(id)
            .data
            .iter()
            .map(|(name, value)| {
                let flat = match value {
                    Value::Link(link) => self.link_to_primitive(link),
                    other => other.clone(),
                };
                (name.clone(), flat)
            })
            .collect()
    }

    /// Collapse the graph below `id` into the nested response shape
    pub fn materialize(&self, id: RecordId) -> ValueMap {
        let mut children: HashMap<usize, Vec<RecordId>> = HashMap::new();
        for (index, record) in self.records.iter().enumerate() {
            if let Some(slot) = &record.slot {
                children.entry(slot.parent.0).or_default().push(RecordId(index));
            }
        }
        self.materialize_with(id, &children)
    }

    fn materialize_with(&self, id: RecordId, children: &HashMap<usize, Vec<RecordId>>) -> ValueMap {
        let record = self.get(id);
        let mut data = ValueMap::new();
        for (name, value) in &record.data {
            let collapsed = match value {
                Value::Link(Link::Nested(other)) => Value::Map(self.materialize_with(*other, children)),
                Value::Link(Link::NestedGeneric { object, record }) => {
                    let mut nested = self.materialize_with(*record, children);
                    nested.insert(GENERIC_OBJECT_KEY.to_string(), Value::String(object.clone()));
                    Value::Map(nested)
                }
                Value::Link(link) => self.link_to_primitive(link),
                other => other.clone(),
            };
            data.insert(name.clone(), collapsed);
        }
        for child in children.get(&id.0).into_iter().flatten() {
            let Some(slot) = &self.get(*child).slot else {
                continue;
            };
            let child_data = Value::Map(self.materialize_with(*child, children));
            let entry = data
                .entry(slot.field.clone())
                .or_insert_with(|| Value::List(Vec::new()));
            if !matches!(entry, Value::List(_)) {
                *entry = Value::List(Vec::new());
            }
            if let Value::List(items) = entry {
                if items.len() < slot.neighbours {
                    items.resize(slot.neighbours, Value::Null);
                }
                if slot.index < items.len() {
                    items[slot.index] = child_data;
                } else {
                    items.push(child_data);
                }
            }
        }
        data
    }
}

/// Current UTC time rendered for a time-like field type
fn now_for(field_type: FieldType) -> Option<Value> {
    let now = Utc::now();
    let rendered = match field_type {
        FieldType::DateTime => now.to_rfc3339_opts(SecondsFormat::Secs, true),
        FieldType::Date => now.format("%Y-%m-%d").to_string(),
        FieldType::Time => now.format("%H:%M:%S").to_string(),
        _ => return None,
    };
    Some(Value::String(rendered))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{FieldSpec, MetaDescription, MetaRegistry, MetaStore};

    fn metas() -> (Arc<Meta>, Arc<Meta>) {
        let registry = MetaRegistry::new();
        registry
            .create(
                MetaDescription::new("a", "id")
                    .with_field(FieldSpec::key("id"))
                    .with_field(FieldSpec::new("name", FieldType::String))
                    .with_field(FieldSpec::new("created", FieldType::DateTime).optional().now_on_create()),
            )
            .unwrap();
        registry
            .create(
                MetaDescription::new("b", "id")
                    .with_field(FieldSpec::key("id"))
                    .with_field(FieldSpec::object("a", "a")),
            )
            .unwrap();
        (registry.require_meta("a").unwrap(), registry.require_meta("b").unwrap())
    }

    fn map(pairs: &[(&str, Value)]) -> ValueMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_prepare_resolves_nested_keys() {
        let (a, b) = metas();
        let mut graph = WriteGraph::new();
        let parent = graph.add(Record::new(a, map(&[("id", Value::Int(7)), ("name", "x".into())])));
        let child = graph.add(Record::new(b, map(&[("a", Value::Link(Link::Nested(parent)))])));

        let raw = graph.prepare_data(child, Method::Create);
        assert_eq!(raw.get("a"), Some(&Value::Int(7)));
        assert!(!raw.contains_key("id"));
        assert!(!raw.contains_key("a_set"));

        let raw = graph.prepare_data(parent, Method::Create);
        assert!(matches!(raw.get("created"), Some(Value::String(_))));
    }

    #[test]
    fn test_merge_and_materialize() {
        let (a, b) = metas();
        let mut graph = WriteGraph::new();
        let parent = graph.add(Record::new(
            a,
            map(&[("name", "x".into()), ("b_set", Value::List(vec![Value::Null, Value::Null]))]),
        ));
        for index in [1, 0] {
            let slot = Slot {
                parent,
                field: "b_set".to_string(),
                index,
                neighbours: 2,
            };
            let child = graph.add(
                Record::new(b.clone(), map(&[("a", Value::Link(Link::Owner(parent)))])).with_slot(slot),
            );
            graph.merge_data(child, map(&[("id", Value::Int(index as i64 + 10))]));
        }
        graph.merge_data(parent, map(&[("id", Value::Int(3)), ("name", "x".into())]));

        let data = graph.materialize(parent);
        let items = data["b_set"].as_list().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_map().unwrap()["id"], Value::Int(10));
        assert_eq!(items[1].as_map().unwrap()["a"], Value::Int(3));
    }

    #[test]
    fn test_merge_keeps_nested_links() {
        let (a, b) = metas();
        let mut graph = WriteGraph::new();
        let parent = graph.add(Record::new(a, map(&[("id", Value::Int(1)), ("name", "p".into())])));
        let child = graph.add(Record::new(b, map(&[("a", Value::Link(Link::Nested(parent)))])));
        graph.merge_data(child, map(&[("id", Value::Int(2)), ("a", Value::Int(1))]));

        let data = graph.materialize(child);
        assert_eq!(data["a"].as_map().unwrap()["name"], Value::String("p".into()));
        assert!(graph.get(child).raw_data.is_empty());
    }
}
