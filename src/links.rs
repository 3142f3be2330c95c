//! Link placeholders
//!
//! While a nested write is being executed, fields that reference other records
//! of the same write cannot hold primitive values yet: the referenced record may
//! not have a key until its own insert has returned. Those fields hold a
//! [`Link`] which is turned into a primitive by `Record::prepare_data` and into
//! the final nested shape once the whole write graph has been executed.

use crate::types::{Value, ValueMap};

/// Key under which a generic value names its concrete object type
pub const GENERIC_OBJECT_KEY: &str = "_object";

/// Index of a record inside a write graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(pub usize);

/// Placeholder stored in a record field until the write graph is collapsed
#[derive(Debug, Clone, PartialEq)]
pub enum Link {
    /// Foreign key of an already existing record
    Key(Box<Value>),
    /// Inner link to a nested record created earlier in the same write
    Nested(RecordId),
    /// Key of another record of the write graph (back-reference to a parent,
    /// or one side of a many-to-many through record)
    Owner(RecordId),
    /// Resolved polymorphic value
    Generic(Box<GenericLink>),
    /// Polymorphic inner link to a nested record created earlier in the same write
    NestedGeneric { object: String, record: RecordId },
    /// Polymorphic back-reference to the parent owning a generic outer array
    GenericOwner { object: String, record: RecordId },
}

impl Link {
    pub fn key(value: Value) -> Self {
        Link::Key(Box::new(value))
    }

    /// True for placeholders whose collapsed form is a nested object
    pub fn is_nested(&self) -> bool {
        matches!(self, Link::Nested(_) | Link::NestedGeneric { .. })
    }
}

/// A polymorphic reference: object type name plus key
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GenericLink {
    /// `None` for an empty generic value
    pub object: Option<String>,
    pub pk_name: String,
    pub pk: Value,
}

impl GenericLink {
    pub fn new(object: impl Into<String>, pk_name: impl Into<String>, pk: Value) -> Self {
        GenericLink {
            object: Some(object.into()),
            pk_name: pk_name.into(),
            pk,
        }
    }

    pub fn empty() -> Self {
        GenericLink::default()
    }

    pub fn is_empty(&self) -> bool {
        self.object.is_none()
    }

    /// Map form `{ "_object": <name>, <pk_name>: <pk> }`, `null` when empty
    pub fn as_value(&self) -> Value {
        match &self.object {
            Some(object) => {
                let mut map = ValueMap::new();
                map.insert(GENERIC_OBJECT_KEY.to_string(), Value::String(object.clone()));
                map.insert(self.pk_name.clone(), self.pk.clone());
                Value::Map(map)
            }
            None => Value::Null,
        }
    }

    /// Read a stored generic value; `key_of` maps an object name to its key field
    pub fn from_value(value: &Value, key_of: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let map = value.as_map()?;
        let object = map.get(GENERIC_OBJECT_KEY)?.as_str()?.to_string();
        let pk_name = key_of(&object)?;
        let pk = map.get(&pk_name).cloned().unwrap_or(Value::Null);
        Some(GenericLink {
            object: Some(object),
            pk_name,
            pk,
        })
    }
}

/// Position a child record occupies inside one of its parent's array fields
#[derive(Debug, Clone, PartialEq)]
pub struct Slot {
    pub parent: RecordId,
    pub field: String,
    pub index: usize,
    pub neighbours: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generic_link_map_form() {
        let link = GenericLink::new("b", "id", Value::Int(3));
        let value = link.as_value();
        let map = value.as_map().unwrap();
        assert_eq!(map[GENERIC_OBJECT_KEY], Value::String("b".into()));
        assert_eq!(map["id"], Value::Int(3));

        let parsed = GenericLink::from_value(&value, |_| Some("id".to_string())).unwrap();
        assert_eq!(parsed, link);
        assert_eq!(GenericLink::empty().as_value(), Value::Null);
    }

    #[test]
    fn test_generic_link_inside_value() {
        let link = GenericLink::new("b", "id", Value::Int(7));
        let value = Value::Link(Link::Generic(Box::new(link.clone())));
        let expected = serde_json::json!({"_object": "b", "id": 7});
        assert_eq!(value.to_json(), expected);
        assert!(!Link::Generic(Box::new(link)).is_nested());
    }
}
