//! Read path
//!
//! [`QueryContext`] runs reads inside one transaction: single records by key,
//! RQL queries, and the depth-first filling of a retrieval [`Node`] tree where
//! every child node issues its own query against the parent row.

use crate::error::Result;
use crate::links::{GenericLink, GENERIC_OBJECT_KEY};
use crate::meta::{FieldType, LinkType, Meta, MetaStore};
use crate::node::Node;
use crate::retrieve_policy::RetrievePolicy;
use crate::rql::SqlTranslator;
use crate::rql_ast::{RqlArg, RqlNode, RqlQuery};
use crate::storage::{Condition, DataStore, RqlRequest};
use crate::transaction::{TransactionId, TransactionManager};
use crate::types::{Value, ValueMap};
use std::collections::HashMap;
use std::sync::Arc;

/// Instantiated generic nodes of one fill pass, keyed by field and object
type GenericNodes = HashMap<(String, String), Node>;

pub struct QueryContext<'a> {
    metas: &'a dyn MetaStore,
    store: &'a dyn DataStore,
    tx: TransactionId,
    table_prefix: &'a str,
}

impl<'a> QueryContext<'a> {
    pub fn new(
        metas: &'a dyn MetaStore,
        store: &'a dyn DataStore,
        tx: TransactionId,
        table_prefix: &'a str,
    ) -> Self {
        QueryContext {
            metas,
            store,
            tx,
            table_prefix,
        }
    }

    pub fn metas(&self) -> &'a dyn MetaStore {
        self.metas
    }

    pub fn tx(&self) -> TransactionId {
        self.tx
    }

    pub fn store(&self) -> &'a dyn DataStore {
        self.store
    }

    /// One record by key, resolved down to `depth`
    pub fn get(
        &self,
        meta: &Arc<Meta>,
        key: &Value,
        depth: usize,
        policy: RetrievePolicy,
        omit_outers: bool,
    ) -> Result<Option<ValueMap>> {
        let node = Node::root(meta.clone(), depth, policy, omit_outers, self.metas)?;
        let rows = self.store.get_all(
            meta,
            &node.columns(),
            &[Condition::Equals(meta.key.clone(), key.clone())],
            self.tx,
        )?;
        Ok(self.fill_rows(&node, rows)?.into_iter().next())
    }

    /// Records matching `query`, resolved down to `depth`, plus the total count
    pub fn get_bulk(
        &self,
        meta: &Arc<Meta>,
        query: &RqlQuery,
        depth: usize,
        policy: RetrievePolicy,
        omit_outers: bool,
    ) -> Result<(Vec<ValueMap>, usize)> {
        let node = Node::root(meta.clone(), depth, policy, omit_outers, self.metas)?;
        let (rows, total) = self.run_rql(meta, query, &node.columns())?;
        Ok((self.fill_rows(&node, rows)?, total))
    }

    /// Records with the given keys at `depth`, in key order
    pub fn get_by_keys(&self, meta: &Arc<Meta>, keys: &[Value], depth: usize, omit_outers: bool) -> Result<Vec<ValueMap>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let query = RqlQuery {
            node: Some(in_keys(&meta.key, keys)),
            ..RqlQuery::default()
        };
        let (rows, _) = self.get_bulk(meta, &query, depth, RetrievePolicy::empty(), omit_outers)?;
        Ok(rows)
    }

    /// Plain table rows matching a filter tree, no relation resolution
    pub fn select(&self, meta: &Arc<Meta>, filter: RqlNode) -> Result<Vec<ValueMap>> {
        let query = RqlQuery {
            node: Some(filter),
            ..RqlQuery::default()
        };
        let (rows, _) = self.run_rql(meta, &query, &[])?;
        Ok(rows)
    }

    /// Plain table rows matching equality conditions
    pub fn select_where(&self, meta: &Meta, conditions: &[Condition]) -> Result<Vec<ValueMap>> {
        self.store.get_all(meta, &[], conditions, self.tx)
    }

    fn run_rql(&self, meta: &Arc<Meta>, query: &RqlQuery, fields: &[String]) -> Result<(Vec<ValueMap>, usize)> {
        let query_node = Node::query_root(meta.clone());
        let sql = SqlTranslator::new(self.metas, self.table_prefix).translate(query, &query_node)?;
        tracing::trace!(meta = %meta.name, filter = %sql.where_clause, "rql query");
        let request = RqlRequest {
            meta,
            fields,
            query,
            sql: &sql,
        };
        self.store.get_rql(&request, self.tx)
    }

    fn fill_rows(&self, node: &Node, rows: Vec<ValueMap>) -> Result<Vec<ValueMap>> {
        let mut generics = GenericNodes::new();
        rows.into_iter()
            .map(|row| self.fill_record(node, row, &mut generics))
            .collect()
    }

    fn fill_record(&self, node: &Node, mut row: ValueMap, generics: &mut GenericNodes) -> Result<ValueMap> {
        for child in &node.children {
            let value = self.fill_child(child, &row, generics)?;
            row.insert(child.name().to_string(), value);
        }
        Ok(row)
    }

    fn fill_child(&self, child: &Node, row: &ValueMap, generics: &mut GenericNodes) -> Result<Value> {
        let Some(field) = &child.link_field else {
            return Ok(Value::Null);
        };
        let parent_key = child
            .parent_meta
            .as_ref()
            .and_then(|m| row.get(&m.key))
            .cloned()
            .unwrap_or(Value::Null);

        match (field.field_type, field.link_type) {
            (FieldType::Object, LinkType::Inner) => {
                let stored = row.get(&field.name).cloned().unwrap_or(Value::Null);
                if stored.is_null() || child.only_link {
                    return Ok(stored);
                }
                let Some(target) = &child.meta else {
                    return Ok(stored);
                };
                let rows = self.store.get_all(
                    target,
                    &child.columns(),
                    &[Condition::Equals(target.key.clone(), stored)],
                    self.tx,
                )?;
                Ok(self
                    .fill_rows(child, rows)?
                    .into_iter()
                    .next()
                    .map(Value::Map)
                    .unwrap_or(Value::Null))
            }
            (FieldType::Array, LinkType::Outer) => {
                let Some(target) = &child.meta else {
                    return Ok(Value::Null);
                };
                let outer = field.outer_link_field.clone().unwrap_or_default();
                let rows = self.store.get_all(
                    target,
                    &child.columns(),
                    &[Condition::Equals(outer, parent_key)],
                    self.tx,
                )?;
                self.plural_value(child, target, rows)
            }
            (FieldType::Objects, _) => {
                let Some(target) = &child.meta else {
                    return Ok(Value::Null);
                };
                let through = self.metas.require_meta(field.link_through.as_deref().unwrap_or_default())?;
                let owner = child.parent_meta.as_ref().map(|m| m.name.clone()).unwrap_or_default();
                if child.only_link {
                    let links = self
                        .store
                        .get_all(&through, &[], &[Condition::Equals(owner, parent_key)], self.tx)?;
                    let mut keys: Vec<Value> = links
                        .into_iter()
                        .filter_map(|mut l| l.remove(&target.name))
                        .collect();
                    keys.sort_by(|a, b| a.compare(b).unwrap_or(std::cmp::Ordering::Equal));
                    return Ok(Value::List(keys));
                }
                let reverse = through
                    .find_field(&target.name)
                    .and_then(|f| f.reverse_outer_field(target))
                    .map(|f| f.name.clone())
                    .unwrap_or_default();
                let filter = RqlNode::new(
                    "eq",
                    vec![
                        RqlArg::Value(format!("{}.{}", reverse, owner)),
                        RqlArg::Value(parent_key.to_key_string()),
                    ],
                );
                let query = RqlQuery {
                    node: Some(filter),
                    ..RqlQuery::default()
                };
                let (rows, _) = self.run_rql(target, &query, &child.columns())?;
                self.plural_value(child, target, rows)
            }
            (FieldType::Generic, LinkType::Inner) => {
                let stored = row.get(&field.name).cloned().unwrap_or(Value::Null);
                let key_of = |object: &str| self.metas.get_meta(object).ok().flatten().map(|m| m.key.clone());
                let Some(link) = GenericLink::from_value(&stored, key_of) else {
                    return Ok(Value::Null);
                };
                let Some(object) = link.object.clone() else {
                    return Ok(Value::Null);
                };
                let cache_key = (field.name.clone(), object.clone());
                if !generics.contains_key(&cache_key) {
                    let instantiated = child.instantiate_generic(&object, self.metas)?;
                    generics.insert(cache_key.clone(), instantiated);
                }
                let Some(concrete) = generics.get(&cache_key).cloned() else {
                    return Ok(Value::Null);
                };
                if concrete.only_link {
                    return Ok(link.as_value());
                }
                let Some(target) = &concrete.meta else {
                    return Ok(Value::Null);
                };
                let rows = self.store.get_all(
                    target,
                    &concrete.columns(),
                    &[Condition::Equals(target.key.clone(), link.pk.clone())],
                    self.tx,
                )?;
                let filled = self.fill_rows(&concrete, rows)?.into_iter().next();
                Ok(match filled {
                    Some(mut data) => {
                        data.insert(GENERIC_OBJECT_KEY.to_string(), Value::String(object));
                        Value::Map(data)
                    }
                    None => Value::Null,
                })
            }
            (FieldType::Generic, LinkType::Outer) => {
                let Some(target) = &child.meta else {
                    return Ok(Value::Null);
                };
                let owner = child.parent_meta.as_ref().map(|m| m.name.clone()).unwrap_or_default();
                let condition = Condition::GenericRef {
                    field: field.outer_link_field.clone().unwrap_or_default(),
                    object: owner,
                    key: parent_key,
                };
                let rows = self.store.get_all(target, &child.columns(), &[condition], self.tx)?;
                self.plural_value(child, target, rows)
            }
            _ => Ok(row.get(&field.name).cloned().unwrap_or(Value::Null)),
        }
    }

    fn plural_value(&self, child: &Node, target: &Meta, rows: Vec<ValueMap>) -> Result<Value> {
        if child.only_link {
            let keys = rows.into_iter().filter_map(|mut r| r.remove(&target.key)).collect();
            return Ok(Value::List(keys));
        }
        Ok(Value::List(
            self.fill_rows(child, rows)?.into_iter().map(Value::Map).collect(),
        ))
    }
}

/// Runs each unit of work in its own transaction
#[derive(Clone, Copy)]
pub struct TxScope<'a> {
    pub metas: &'a dyn MetaStore,
    pub transactions: &'a TransactionManager,
    pub table_prefix: &'a str,
}

impl<'a> TxScope<'a> {
    pub fn new(metas: &'a dyn MetaStore, transactions: &'a TransactionManager, table_prefix: &'a str) -> Self {
        TxScope {
            metas,
            transactions,
            table_prefix,
        }
    }

    /// Run `work` in a fresh transaction, committed on success and rolled
    /// back on failure
    pub fn run<T>(&self, work: impl FnOnce(&QueryContext<'_>) -> Result<T>) -> Result<T> {
        let tx = self.transactions.begin()?;
        let store = self.transactions.store().clone();
        let ctx = QueryContext::new(self.metas, store.as_ref(), tx.id(), self.table_prefix);
        match work(&ctx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                let txn_id = tx.id();
                if let Err(rollback) = tx.rollback() {
                    tracing::error!(txn_id, error = %rollback, "rollback failed");
                }
                Err(e)
            }
        }
    }
}

/// `in(<key>,(<k1>,<k2>,...))`
pub fn in_keys(key: &str, keys: &[Value]) -> RqlNode {
    let items = keys.iter().map(|k| RqlArg::Value(k.to_key_string())).collect();
    RqlNode::new("in", vec![RqlArg::Value(key.to_string()), RqlArg::List(items)])
}

/// `eq(<path>,<value>)`
pub fn eq(path: impl Into<String>, value: &Value) -> RqlNode {
    RqlNode::new(
        "eq",
        vec![RqlArg::Value(path.into()), RqlArg::Value(value.to_key_string())],
    )
}
