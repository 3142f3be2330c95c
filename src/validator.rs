//! Record validation and write-graph building
//!
//! [`Validator::validate`] checks the data of one record of a [`WriteGraph`]
//! against its meta and splits every relational field into child records of the
//! graph, partitioned by when they have to be handled relative to the record's
//! own statement (see [`Partition`]). Children are validated when they are
//! processed themselves.

use crate::error::{EngineError, Result};
use crate::generic_validator::{GenericLinkError, GenericValidator};
use crate::links::{GenericLink, Link, RecordId, Slot, GENERIC_OBJECT_KEY};
use crate::meta::{FieldDescription, FieldType, LinkType, Meta, OnDeleteStrategy};
use crate::query::{eq, in_keys, TxScope};
use crate::record::{Record, WriteGraph};
use crate::rql_ast::{RqlArg, RqlNode};
use crate::types::{Value, ValueMap};
use std::sync::Arc;

/// Child records of one validated record
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Partition {
    /// Existing records whose stored state is loaded into the response
    pub retrieve_before: Vec<RecordId>,
    /// Records the validated record references; written first
    pub process_before: Vec<RecordId>,
    /// Records referencing the validated record; written after it
    pub process_after: Vec<RecordId>,
    /// Stored records no longer linked; removed last
    pub remove_before: Vec<RecordId>,
}

pub struct Validator<'a> {
    scope: TxScope<'a>,
}

impl<'a> Validator<'a> {
    pub fn new(scope: TxScope<'a>) -> Self {
        Validator { scope }
    }

    pub fn validate(&self, graph: &mut WriteGraph, id: RecordId) -> Result<Partition> {
        let meta = graph.get(id).meta.clone();
        let phantom = graph.get(id).is_phantom();
        // stored key, read before the data is moved out for validation
        let parent_key = (!phantom).then(|| graph.pk(id));
        let data = std::mem::take(&mut graph.get_mut(id).data);

        if phantom {
            for field in &meta.fields {
                let has_default = field.default.is_some() || field.now_on_create;
                if !field.optional && !has_default && !data.contains_key(&field.name) {
                    return Err(EngineError::MandatoryFieldAbsent {
                        meta: meta.name.clone(),
                        field: field.name.clone(),
                    });
                }
            }
        }

        let mut partition = Partition::default();
        let mut validated = ValueMap::new();
        for (name, value) in data {
            let Some(field) = meta.find_field(&name) else {
                continue;
            };
            // links already resolved by the parent record
            if let Value::Link(_) = value {
                validated.insert(name, value);
                continue;
            }
            match (field.field_type, field.link_type) {
                (FieldType::Object, LinkType::Inner) => {
                    let link = self.inner_object(graph, field, value, &mut partition)?;
                    validated.insert(name, link);
                }
                (FieldType::Array, LinkType::Outer) | (FieldType::Generic, LinkType::Outer) => {
                    if !field.retrieve_mode || value.is_null() {
                        continue;
                    }
                    let entries = expect_list(field, value)?;
                    self.outer_entries(graph, id, &meta, field, entries, parent_key.as_ref(), &mut partition)?;
                    validated.insert(name, Value::List(Vec::new()));
                }
                (FieldType::Objects, _) => {
                    if value.is_null() {
                        continue;
                    }
                    let entries = expect_list(field, value)?;
                    self.objects_entries(graph, id, &meta, field, entries, parent_key.as_ref(), &mut partition)?;
                    validated.insert(name, Value::List(Vec::new()));
                }
                (FieldType::Generic, LinkType::Inner) => {
                    let link = self.generic_inner(graph, field, value, &mut partition)?;
                    validated.insert(name, link);
                }
                (field_type, _) if field_type.is_scalar() => {
                    validated.insert(name, scalar(field, value)?);
                }
                _ => {
                    if !value.is_null() {
                        return Err(EngineError::wrong_type(&name, "value does not match the field"));
                    }
                }
            }
        }

        graph.get_mut(id).data = validated;
        Ok(partition)
    }

    fn inner_object(
        &self,
        graph: &mut WriteGraph,
        field: &FieldDescription,
        value: Value,
        partition: &mut Partition,
    ) -> Result<Value> {
        match value {
            Value::Null => Ok(Value::Null),
            Value::Map(nested) => {
                let target = self.link_meta(field)?;
                let child = graph.add(Record::new(target, nested));
                partition.process_before.push(child);
                Ok(Value::Link(Link::Nested(child)))
            }
            other => Ok(Value::Link(Link::key(link_key(field, other)?))),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn outer_entries(
        &self,
        graph: &mut WriteGraph,
        id: RecordId,
        meta: &Meta,
        field: &FieldDescription,
        entries: Vec<Value>,
        parent_key: Option<&Value>,
        partition: &mut Partition,
    ) -> Result<()> {
        let target = self.link_meta(field)?;
        let outer = field.outer_link_field.clone().unwrap_or_default();
        let back_link = if field.field_type == FieldType::Generic {
            Link::GenericOwner {
                object: meta.name.clone(),
                record: id,
            }
        } else {
            Link::Owner(id)
        };

        let neighbours = entries.len();
        let mut kept_keys = Vec::new();
        for (index, entry) in entries.into_iter().enumerate() {
            let mut data = self.entry_data(field, &target, entry)?;
            if let Some(pk) = data.get(&target.key).filter(|pk| !pk.is_null()) {
                kept_keys.push(pk.clone());
            }
            data.insert(outer.clone(), Value::Link(back_link.clone()));
            let slot = Slot {
                parent: id,
                field: field.name.clone(),
                index,
                neighbours,
            };
            partition
                .process_after
                .push(graph.add(Record::new(target.clone(), data).with_slot(slot)));
        }

        let Some(parent_key) = parent_key else {
            return Ok(());
        };
        let path = if field.field_type == FieldType::Generic {
            format!("{}.{}.{}", outer, meta.name, meta.key)
        } else {
            outer.clone()
        };
        let filter = without_keys(eq(path, parent_key), &target.key, &kept_keys);
        let stale = self.scope.run(|ctx| ctx.select(&target, filter))?;
        let strategy = target
            .find_field(&outer)
            .map(FieldDescription::on_delete_strategy)
            .unwrap_or(OnDeleteStrategy::Cascade);
        self.unlink(graph, field, &target, &outer, strategy, stale, partition)
    }

    #[allow(clippy::too_many_arguments)]
    fn objects_entries(
        &self,
        graph: &mut WriteGraph,
        id: RecordId,
        meta: &Meta,
        field: &FieldDescription,
        entries: Vec<Value>,
        parent_key: Option<&Value>,
        partition: &mut Partition,
    ) -> Result<()> {
        let target = self.link_meta(field)?;
        let through = self
            .scope
            .metas
            .require_meta(field.link_through.as_deref().unwrap_or_default())?;
        let owner_field = meta.name.clone();
        let target_field = target.name.clone();

        let neighbours = entries.len();
        let mut links: Vec<(RecordId, Option<Value>)> = Vec::new();
        for (index, entry) in entries.into_iter().enumerate() {
            let slot = Slot {
                parent: id,
                field: field.name.clone(),
                index,
                neighbours,
            };
            let data = self.entry_data(field, &target, entry)?;
            let pk = data.get(&target.key).filter(|pk| !pk.is_null()).cloned();
            let is_reference = pk.is_some() && data.len() == 1;

            let mut link_data = ValueMap::new();
            link_data.insert(owner_field.clone(), Value::Link(Link::Owner(id)));
            if is_reference {
                let pk = pk.clone().unwrap_or_default();
                let target_record = graph.add(Record::new(target.clone(), data).with_slot(slot));
                partition.retrieve_before.push(target_record);
                link_data.insert(target_field.clone(), Value::Link(Link::key(pk)));
            } else {
                let target_record = graph.add(Record::new(target.clone(), data).with_slot(slot));
                partition.process_after.push(target_record);
                link_data.insert(target_field.clone(), Value::Link(Link::Owner(target_record)));
            }
            let link_record = graph.add(Record::new(through.clone(), link_data));
            partition.process_after.push(link_record);
            links.push((link_record, pk));
        }

        let Some(parent_key) = parent_key else {
            return Ok(());
        };
        let existing = self.scope.run(|ctx| ctx.select(&through, eq(owner_field.as_str(), parent_key)))?;

        let mut stale = Vec::new();
        for row in existing {
            let linked = row.get(&target_field).cloned().unwrap_or(Value::Null);
            let kept: Vec<RecordId> = links
                .iter()
                .filter(|(_, pk)| pk.as_ref().map(|pk| pk.loose_eq(&linked)).unwrap_or(false))
                .map(|(record, _)| *record)
                .collect();
            if kept.is_empty() {
                stale.push(row);
            } else {
                partition.process_after.retain(|r| !kept.contains(r));
            }
        }
        let strategy = through
            .find_field(&owner_field)
            .map(FieldDescription::on_delete_strategy)
            .unwrap_or(OnDeleteStrategy::Cascade);
        self.unlink(graph, field, &through, &owner_field, strategy, stale, partition)
    }

    /// Handle stored records which are no longer linked to the parent
    #[allow(clippy::too_many_arguments)]
    fn unlink(
        &self,
        graph: &mut WriteGraph,
        field: &FieldDescription,
        target: &Arc<Meta>,
        outer: &str,
        strategy: OnDeleteStrategy,
        stale: Vec<ValueMap>,
        partition: &mut Partition,
    ) -> Result<()> {
        if stale.is_empty() {
            return Ok(());
        }
        match strategy {
            OnDeleteStrategy::Restrict => Err(EngineError::RestrictConstraintViolation {
                field: field.name.clone(),
            }),
            OnDeleteStrategy::Cascade => {
                for row in stale {
                    partition.remove_before.push(graph.add(Record::new(target.clone(), row)));
                }
                Ok(())
            }
            OnDeleteStrategy::SetNull | OnDeleteStrategy::SetDefault => {
                let replacement = match strategy {
                    OnDeleteStrategy::SetDefault => target
                        .find_field(outer)
                        .map(FieldDescription::default_value)
                        .unwrap_or(Value::Null),
                    _ => Value::Null,
                };
                for row in stale {
                    let mut data = ValueMap::new();
                    data.insert(target.key.clone(), row.get(&target.key).cloned().unwrap_or(Value::Null));
                    data.insert(outer.to_string(), replacement.clone());
                    partition.process_after.push(graph.add(Record::new(target.clone(), data)));
                }
                Ok(())
            }
        }
    }

    fn generic_inner(
        &self,
        graph: &mut WriteGraph,
        field: &FieldDescription,
        value: Value,
        partition: &mut Partition,
    ) -> Result<Value> {
        let nested = match value {
            Value::Null => return Ok(Value::Link(Link::Generic(Box::new(GenericLink::empty())))),
            Value::Map(nested) => nested,
            _ => return Err(EngineError::wrong_type(&field.name, "generic value must be an object")),
        };
        match GenericValidator::new(self.scope).validate(field, &nested) {
            Ok(link) => Ok(Value::Link(Link::Generic(Box::new(link)))),
            Err(GenericLinkError::PkIsNull) => {
                let object = nested
                    .get(GENERIC_OBJECT_KEY)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let target = self.scope.metas.require_meta(&object)?;
                let mut data = nested;
                data.remove(GENERIC_OBJECT_KEY);
                let child = graph.add(Record::new(target, data));
                partition.process_before.push(child);
                Ok(Value::Link(Link::NestedGeneric { object, record: child }))
            }
            Err(GenericLinkError::Invalid(e)) => Err(e),
        }
    }

    /// Data of one array entry: a nested object or a bare key
    fn entry_data(&self, field: &FieldDescription, target: &Meta, entry: Value) -> Result<ValueMap> {
        match entry {
            Value::Map(data) => Ok(data),
            Value::Null | Value::List(_) | Value::Link(_) => Err(EngineError::wrong_type(
                &field.name,
                "entries must be objects or keys",
            )),
            key => {
                let key = coerce(target.key_field(), key)
                    .ok_or_else(|| EngineError::wrong_type(&field.name, "entry key has a wrong type"))?;
                let mut data = ValueMap::new();
                data.insert(target.key.clone(), key);
                Ok(data)
            }
        }
    }

    fn link_meta(&self, field: &FieldDescription) -> Result<Arc<Meta>> {
        self.scope
            .metas
            .require_meta(field.link_meta.as_deref().unwrap_or_default())
    }
}

fn expect_list(field: &FieldDescription, value: Value) -> Result<Vec<Value>> {
    match value {
        Value::List(entries) => Ok(entries),
        _ => Err(EngineError::wrong_type(&field.name, "value must be an array")),
    }
}

/// Type check of a scalar value; numbers are accepted for string fields
fn scalar(field: &FieldDescription, value: Value) -> Result<Value> {
    if value.is_null() {
        return Ok(value);
    }
    let value = if field.field_type.assert_type(&value) {
        value
    } else if field.field_type == FieldType::String && value.is_number() {
        Value::String(value.to_key_string())
    } else {
        return Err(EngineError::wrong_type(
            &field.name,
            format!("expected {}, got '{}'", field.field_type, value),
        ));
    };
    if field.field_type == FieldType::Enum {
        let text = value.as_str().unwrap_or_default();
        if !field.choices.iter().any(|c| c == text) {
            return Err(EngineError::EnumViolation {
                field: field.name.clone(),
                value: text.to_string(),
                choices: field.choices.clone(),
            });
        }
    }
    Ok(value)
}

fn link_key(field: &FieldDescription, value: Value) -> Result<Value> {
    coerce(field, value.clone())
        .ok_or_else(|| EngineError::wrong_type(&field.name, format!("'{}' is not a valid key", value)))
}

/// Value typed for `field`, parsing strings when needed
fn coerce(field: &FieldDescription, value: Value) -> Option<Value> {
    if field.is_value_type_valid(&value) {
        return Some(value);
    }
    match &value {
        Value::String(raw) => field.value_from_str(raw),
        _ => None,
    }
}

/// `filter` restricted to records whose key is not in `keys`
fn without_keys(filter: RqlNode, key: &str, keys: &[Value]) -> RqlNode {
    if keys.is_empty() {
        return filter;
    }
    let excluded = RqlNode::new("not", vec![RqlArg::Node(in_keys(key, keys))]);
    RqlNode::new("and", vec![RqlArg::Node(filter), RqlArg::Node(excluded)])
}
