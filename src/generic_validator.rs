//! Validation of generic inner values
//!
//! A submitted generic value is a `{ "_object": <meta>, <key>: <pk> }` map.
//! A missing or null key is reported as [`GenericLinkError::PkIsNull`] so the
//! caller can treat the map as a new nested record instead of a reference.

use crate::error::EngineError;
use crate::links::{GenericLink, GENERIC_OBJECT_KEY};
use crate::meta::FieldDescription;
use crate::query::TxScope;
use crate::storage::Condition;
use crate::types::{Value, ValueMap};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GenericLinkError {
    #[error("primary key of the generic value is null")]
    PkIsNull,
    #[error(transparent)]
    Invalid(#[from] EngineError),
}

pub struct GenericValidator<'a> {
    scope: TxScope<'a>,
}

impl<'a> GenericValidator<'a> {
    pub fn new(scope: TxScope<'a>) -> Self {
        GenericValidator { scope }
    }

    /// Resolve a submitted generic value to an existing record
    pub fn validate(&self, field: &FieldDescription, value: &ValueMap) -> Result<GenericLink, GenericLinkError> {
        let object = value
            .get(GENERIC_OBJECT_KEY)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                EngineError::wrong_type(&field.name, format!("'{}' must be a string", GENERIC_OBJECT_KEY))
            })?;
        if !field.link_meta_list.iter().any(|m| m == object) {
            return Err(EngineError::wrong_type(
                &field.name,
                format!("'{}' is not among the objects the field links to", object),
            )
            .into());
        }
        let meta = self.scope.metas.require_meta(object)?;
        let key_field = meta.key_field();

        let pk = match value.get(&meta.key) {
            None | Some(Value::Null) => return Err(GenericLinkError::PkIsNull),
            Some(pk) if key_field.is_value_type_valid(pk) => pk.clone(),
            Some(Value::String(raw)) => key_field
                .value_from_str(raw)
                .ok_or_else(|| EngineError::wrong_type(&field.name, format!("key '{}' has a wrong type", raw)))?,
            Some(other) => {
                return Err(EngineError::wrong_type(&field.name, format!("key '{}' has a wrong type", other)).into())
            }
        };

        let rows = self.scope.run(|ctx| {
            ctx.select_where(&meta, &[Condition::Equals(meta.key.clone(), pk.clone())])
        })?;
        if rows.is_empty() {
            return Err(EngineError::ValueDoesNotExist {
                meta: object.to_string(),
                pk: pk.to_key_string(),
                field: field.name.clone(),
            }
            .into());
        }
        Ok(GenericLink::new(object, meta.key.clone(), pk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{FieldSpec, FieldType, MetaDescription, MetaRegistry, MetaStore};
    use crate::storage::{DataStore, MemoryStore};
    use crate::transaction::TransactionManager;
    use crate::types::map_from_json;
    use serde_json::json;
    use std::sync::Arc;

    fn setup() -> (Arc<MetaRegistry>, TransactionManager) {
        let registry = Arc::new(MetaRegistry::new());
        registry
            .create_many(vec![
                MetaDescription::new("a", "id")
                    .with_field(FieldSpec::key("id"))
                    .with_field(FieldSpec::new("name", FieldType::String).optional()),
                MetaDescription::new("b", "id")
                    .with_field(FieldSpec::key("id"))
                    .with_field(FieldSpec::generic("target", &["a"]).optional()),
            ])
            .unwrap();
        let store = Arc::new(MemoryStore::new(registry.clone()));
        store
            .insert(&registry.require_meta("a").unwrap(), vec![ValueMap::new()], 0)
            .unwrap();
        (registry.clone(), TransactionManager::new(store))
    }

    #[test]
    fn test_resolves_existing_record() {
        let (registry, transactions) = setup();
        let scope = TxScope::new(registry.as_ref(), &transactions, "o_");
        let b = registry.require_meta("b").unwrap();
        let field = b.find_field("target").unwrap();

        let link = GenericValidator::new(scope)
            .validate(field, &map_from_json(json!({"_object": "a", "id": "1"})))
            .unwrap();
        assert_eq!(link, GenericLink::new("a", "id", Value::Int(1)));
    }

    #[test]
    fn test_error_variants() {
        let (registry, transactions) = setup();
        let scope = TxScope::new(registry.as_ref(), &transactions, "o_");
        let b = registry.require_meta("b").unwrap();
        let field = b.find_field("target").unwrap();
        let validator = GenericValidator::new(scope);

        let err = validator.validate(field, &map_from_json(json!({"_object": "a"}))).unwrap_err();
        assert!(matches!(err, GenericLinkError::PkIsNull));

        let err = validator
            .validate(field, &map_from_json(json!({"_object": "a", "id": 42})))
            .unwrap_err();
        match err {
            GenericLinkError::Invalid(e) => assert_eq!(e.code(), "value_does_not_exist"),
            other => panic!("unexpected {:?}", other),
        }

        let err = validator
            .validate(field, &map_from_json(json!({"_object": "b", "id": 1})))
            .unwrap_err();
        assert!(matches!(err, GenericLinkError::Invalid(EngineError::WrongFieldType { .. })));
    }
}
