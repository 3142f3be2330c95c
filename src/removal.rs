//! Removal trees
//!
//! Before a record is deleted, every record depending on it through an outer
//! (array or generic) field is collected into a [`RemovalNode`] tree, tagged
//! with the on-delete strategy of the link. Cascade children are expanded
//! recursively, set-null and set-default children are leaves, and a restrict
//! link with dependents aborts the whole extraction.

use crate::error::{EngineError, Result};
use crate::meta::{FieldDescription, FieldType, LinkType, Meta, OnDeleteStrategy};
use crate::query::TxScope;
use crate::storage::Condition;
use crate::types::{Value, ValueMap};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct RemovalNode {
    pub meta: Arc<Meta>,
    /// Stored row of the record
    pub record: ValueMap,
    pub strategy: OnDeleteStrategy,
    /// Inner field of `meta` pointing at the parent record, `None` at the root
    pub link_field: Option<FieldDescription>,
    /// Dependents per outer field name of the parent
    pub children: BTreeMap<String, Vec<RemovalNode>>,
}

impl RemovalNode {
    pub fn pk(&self) -> Value {
        self.record.get(&self.meta.key).cloned().unwrap_or(Value::Null)
    }

    /// Whether the record is deleted rather than updated
    pub fn is_removed(&self) -> bool {
        matches!(self.strategy, OnDeleteStrategy::Cascade | OnDeleteStrategy::Restrict)
    }

    /// Record data with removed dependents nested under their field names
    pub fn data(&self) -> ValueMap {
        let mut data = self.record.clone();
        for (name, children) in &self.children {
            let removed: Vec<Value> = children
                .iter()
                .filter(|c| c.is_removed())
                .map(|c| Value::Map(c.data()))
                .collect();
            if !removed.is_empty() {
                data.insert(name.clone(), Value::List(removed));
            }
        }
        data
    }

    /// Number of records deleted by this tree
    pub fn removed_count(&self) -> usize {
        let own = usize::from(self.is_removed());
        own + self
            .children
            .values()
            .flatten()
            .map(RemovalNode::removed_count)
            .sum::<usize>()
    }
}

pub struct RemovalTreeBuilder<'a> {
    scope: TxScope<'a>,
}

impl<'a> RemovalTreeBuilder<'a> {
    pub fn new(scope: TxScope<'a>) -> Self {
        RemovalTreeBuilder { scope }
    }

    pub fn extract(&self, meta: Arc<Meta>, record: ValueMap) -> Result<RemovalNode> {
        let mut root = RemovalNode {
            meta,
            record,
            strategy: OnDeleteStrategy::Cascade,
            link_field: None,
            children: BTreeMap::new(),
        };
        let mut path = HashSet::new();
        self.fill(&mut root, &mut path)?;
        Ok(root)
    }

    fn fill(&self, node: &mut RemovalNode, path: &mut HashSet<(String, String)>) -> Result<()> {
        let identity = (node.meta.name.clone(), node.pk().to_key_string());
        if !path.insert(identity.clone()) {
            return Ok(());
        }
        let meta = node.meta.clone();
        let pk = node.pk();
        for field in &meta.fields {
            let generic = match (field.field_type, field.link_type) {
                (FieldType::Array, LinkType::Outer) => false,
                (FieldType::Generic, LinkType::Outer) => true,
                _ => continue,
            };
            let target = self
                .scope
                .metas
                .require_meta(field.link_meta.as_deref().unwrap_or_default())?;
            let Some(link_field) = field
                .outer_link_field
                .as_deref()
                .and_then(|name| target.find_field(name))
                .cloned()
            else {
                continue;
            };
            let condition = if generic {
                Condition::GenericRef {
                    field: link_field.name.clone(),
                    object: meta.name.clone(),
                    key: pk.clone(),
                }
            } else {
                Condition::Equals(link_field.name.clone(), pk.clone())
            };
            let rows = self.scope.run(|ctx| ctx.select_where(&target, &[condition]))?;
            if rows.is_empty() {
                continue;
            }

            let strategy = link_field.on_delete_strategy();
            if strategy == OnDeleteStrategy::Restrict {
                let keys: Vec<String> = rows
                    .iter()
                    .map(|r| r.get(&target.key).map(Value::to_key_string).unwrap_or_default())
                    .collect();
                return Err(EngineError::Removal {
                    meta: target.name.clone(),
                    message: format!(
                        "record(s) [{}] of '{}' reference '{}' {} with `Restrict` strategy on field '{}'",
                        keys.join(", "),
                        target.name,
                        meta.name,
                        pk,
                        link_field.name
                    ),
                });
            }

            let mut children = Vec::with_capacity(rows.len());
            for row in rows {
                let mut child = RemovalNode {
                    meta: target.clone(),
                    record: row,
                    strategy,
                    link_field: Some(link_field.clone()),
                    children: BTreeMap::new(),
                };
                if strategy == OnDeleteStrategy::Cascade {
                    self.fill(&mut child, path)?;
                }
                children.push(child);
            }
            node.children.insert(field.name.clone(), children);
        }
        path.remove(&identity);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{FieldSpec, MetaDescription, MetaRegistry, MetaStore};
    use crate::storage::{DataStore, MemoryStore};
    use crate::transaction::TransactionManager;
    use crate::types::map_from_json;
    use serde_json::json;

    fn setup(b_strategy: &str) -> (Arc<MetaRegistry>, TransactionManager) {
        let registry = Arc::new(MetaRegistry::new());
        registry
            .create_many(vec![
                MetaDescription::new("a", "id").with_field(FieldSpec::key("id")),
                MetaDescription::new("b", "id")
                    .with_field(FieldSpec::key("id"))
                    .with_field(FieldSpec::object("a", "a").optional().on_delete(b_strategy)),
                MetaDescription::new("c", "id")
                    .with_field(FieldSpec::key("id"))
                    .with_field(FieldSpec::object("b", "b").on_delete("cascade")),
                MetaDescription::new("d", "id")
                    .with_field(FieldSpec::key("id"))
                    .with_field(FieldSpec::generic("owner", &["a"]).optional().on_delete("setNull")),
            ])
            .unwrap();
        let store = Arc::new(MemoryStore::new(registry.clone()));
        let insert = |meta: &str, row: serde_json::Value| {
            let meta = registry.require_meta(meta).unwrap();
            store.insert(&meta, vec![map_from_json(row)], 0).unwrap();
        };
        insert("a", json!({}));
        insert("b", json!({"a": 1}));
        insert("c", json!({"b": 1}));
        insert("d", json!({"owner": {"_object": "a", "id": 1}}));
        (registry.clone(), TransactionManager::new(store))
    }

    fn extract(registry: &Arc<MetaRegistry>, transactions: &TransactionManager) -> Result<RemovalNode> {
        let scope = TxScope::new(registry.as_ref(), transactions, "o_");
        let a = registry.require_meta("a").unwrap();
        RemovalTreeBuilder::new(scope).extract(a, map_from_json(json!({"id": 1})))
    }

    #[test]
    fn test_cascade_tree() {
        let (registry, transactions) = setup("cascade");
        let tree = extract(&registry, &transactions).unwrap();
        let bs = &tree.children["b_set"];
        assert_eq!(bs.len(), 1);
        assert_eq!(bs[0].children["c_set"].len(), 1);
        let ds = &tree.children["d_set"];
        assert_eq!(ds[0].strategy, OnDeleteStrategy::SetNull);
        assert!(ds[0].children.is_empty());

        assert_eq!(tree.removed_count(), 3);
        let data = tree.data();
        assert!(data.contains_key("b_set"));
        assert!(!data.contains_key("d_set"));
    }

    #[test]
    fn test_restrict_aborts() {
        let (registry, transactions) = setup("restrict");
        let err = extract(&registry, &transactions).unwrap_err();
        assert_eq!(err.code(), "removal_error");
        assert!(err.to_string().contains("'b'"));
    }
}
