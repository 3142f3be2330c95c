//! Storage layer
//!
//! [`DataStore`] is the narrow interface the engine drives. [`MemoryStore`]
//! implements it over DashMap tables keyed by primary key: sequence-backed
//! keys, column defaults, not-null and foreign-key checks, duplicate detection,
//! a per-transaction undo log, and an RQL evaluator with the same path
//! semantics as the SQL translator.
//!
//! Generic inner values are stored as `{ "_object": <meta>, <key>: <pk> }` maps.

use crate::error::{DmlCode, EngineError, Result, RqlError, RqlErrorCode};
use crate::links::GENERIC_OBJECT_KEY;
use crate::meta::{DefaultValue, FieldDescription, FieldType, LinkType, Meta, MetaStore};
use crate::rql::{glob_to_like, literal_value, SqlQuery};
use crate::rql_ast::{RqlArg, RqlNode, RqlQuery};
use crate::transaction::TransactionId;
use crate::types::{Value, ValueMap};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

/// Row filter of [`DataStore::get_all`]
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Equals(String, Value),
    /// Generic inner `field` references `object` with key `key`
    GenericRef { field: String, object: String, key: Value },
}

/// A filter-language query, both as parsed tree and translated SQL
#[derive(Debug, Clone, Copy)]
pub struct RqlRequest<'a> {
    pub meta: &'a Meta,
    /// Columns to return, all table columns when empty
    pub fields: &'a [String],
    pub query: &'a RqlQuery,
    pub sql: &'a SqlQuery,
}

/// Storage driver interface
pub trait DataStore: Send + Sync {
    fn begin(&self, tx: TransactionId) -> Result<()>;
    fn commit(&self, tx: TransactionId) -> Result<()>;
    fn rollback(&self, tx: TransactionId) -> Result<()>;

    fn get_all(
        &self,
        meta: &Meta,
        fields: &[String],
        conditions: &[Condition],
        tx: TransactionId,
    ) -> Result<Vec<ValueMap>>;

    /// Rows matching the request and the total count before paging
    fn get_rql(&self, request: &RqlRequest<'_>, tx: TransactionId) -> Result<(Vec<ValueMap>, usize)>;

    /// Insert rows, returning them as stored (defaults and keys filled)
    fn insert(&self, meta: &Meta, rows: Vec<ValueMap>, tx: TransactionId) -> Result<Vec<ValueMap>>;

    /// Update rows by key, returning the full updated rows
    fn update(&self, meta: &Meta, rows: Vec<ValueMap>, tx: TransactionId) -> Result<Vec<ValueMap>>;

    fn delete(&self, meta: &Meta, keys: &[Value], tx: TransactionId) -> Result<()>;
}

type Table = HashMap<String, ValueMap>;

#[derive(Debug, Clone)]
enum UndoEntry {
    Inserted { table: String, key: String },
    Replaced { table: String, key: String, row: ValueMap },
    Deleted { table: String, key: String, row: ValueMap },
}

/// In-memory [`DataStore`]
pub struct MemoryStore {
    metas: Arc<dyn MetaStore>,
    tables: DashMap<String, Table>,
    sequences: DashMap<String, i64>,
    undo: DashMap<TransactionId, Vec<UndoEntry>>,
    write_lock: Mutex<()>,
}

impl MemoryStore {
    pub fn new(metas: Arc<dyn MetaStore>) -> Self {
        MemoryStore {
            metas,
            tables: DashMap::new(),
            sequences: DashMap::new(),
            undo: DashMap::new(),
            write_lock: Mutex::new(()),
        }
    }

    /// Number of stored rows of a meta
    pub fn row_count(&self, meta: &str) -> usize {
        self.tables.get(meta).map(|t| t.len()).unwrap_or(0)
    }

    pub fn get_row(&self, meta: &str, key: &Value) -> Option<ValueMap> {
        self.tables.get(meta)?.get(&key.to_key_string()).cloned()
    }

    fn rows_of(&self, meta: &Meta) -> Vec<ValueMap> {
        let mut rows: Vec<ValueMap> = self
            .tables
            .get(&meta.name)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default();
        sort_by_key(&mut rows, &meta.key);
        rows
    }

    fn log_undo(&self, tx: TransactionId, entry: UndoEntry) {
        self.undo.entry(tx).or_default().push(entry);
    }

    fn next_sequence(&self, meta: &Meta, field: &str) -> i64 {
        let mut seq = self.sequences.entry(format!("{}.{}", meta.name, field)).or_insert(0);
        *seq += 1;
        *seq
    }

    fn bump_sequence(&self, meta: &Meta, field: &str, value: &Value) {
        if let Some(v) = value.as_i64() {
            let mut seq = self.sequences.entry(format!("{}.{}", meta.name, field)).or_insert(0);
            if *seq < v {
                *seq = v;
            }
        }
    }

    fn check_column(&self, meta: &Meta, field: &FieldDescription, value: &Value) -> Result<()> {
        if value.is_null() {
            if !field.optional {
                return Err(EngineError::Dml {
                    code: DmlCode::NotNullViolation,
                    message: format!(
                        "null value in column \"{}\" of \"{}\" violates not-null constraint",
                        field.name, meta.name
                    ),
                    column: Some(field.name.clone()),
                    value: None,
                });
            }
            return Ok(());
        }
        if field.field_type == FieldType::Object && field.link_type == LinkType::Inner {
            let target = field.link_meta.as_deref().unwrap_or_default();
            if self.get_row(target, value).is_none() {
                return Err(fk_violation(meta, field, value));
            }
        }
        Ok(())
    }

    /// Rows of other tables still pointing at `key` of `meta`
    fn referencing_rows(&self, meta: &Meta, key: &Value) -> Result<Option<(String, String)>> {
        for entry in self.tables.iter() {
            let Some(other) = self.metas.get_meta(entry.key())? else {
                continue;
            };
            for field in &other.fields {
                let refers = field.field_type == FieldType::Object
                    && field.link_type == LinkType::Inner
                    && field.link_meta.as_deref() == Some(meta.name.as_str());
                if !refers {
                    continue;
                }
                let hit = entry.value().values().any(|row| {
                    row.get(&field.name).map(|v| v.loose_eq(key)).unwrap_or(false)
                        && !(other.name == meta.name && row.get(&meta.key).map(|v| v.loose_eq(key)).unwrap_or(false))
                });
                if hit {
                    return Ok(Some((other.name.clone(), field.name.clone())));
                }
            }
        }
        Ok(None)
    }

    fn key_name_of(&self, object: &str) -> Option<String> {
        self.metas.get_meta(object).ok().flatten().map(|m| m.key.clone())
    }

    fn generic_matches(&self, stored: Option<&Value>, object: &str, key: &Value) -> bool {
        let Some(map) = stored.and_then(Value::as_map) else {
            return false;
        };
        if map.get(GENERIC_OBJECT_KEY).and_then(Value::as_str) != Some(object) {
            return false;
        }
        match self.key_name_of(object) {
            Some(pk_name) => map.get(&pk_name).map(|v| v.loose_eq(key)).unwrap_or(false),
            None => false,
        }
    }

    fn evaluate(&self, meta: &Meta, row: &ValueMap, node: &RqlNode) -> Result<bool> {
        match node.op.to_lowercase().as_str() {
            "and" => {
                for arg in &node.args {
                    if !self.evaluate(meta, row, expect_node(arg)?)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            "or" => {
                for arg in &node.args {
                    if self.evaluate(meta, row, expect_node(arg)?)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            "not" => {
                let inner = node.args.first().ok_or_else(|| wrong("'not' requires an argument"))?;
                Ok(!self.evaluate(meta, row, expect_node(inner)?)?)
            }
            op @ ("eq" | "ne" | "lt" | "le" | "gt" | "ge" | "like" | "in" | "is_null") => {
                if node.args.len() != 2 {
                    return Err(wrong(format!("'{}' requires a field and a value", op)));
                }
                let path = node.args[0].as_value().ok_or_else(|| {
                    rql(RqlErrorCode::WrongFieldName, format!("First argument of '{}' must be a field", op))
                })?;
                let segments: Vec<&str> = path.split('.').collect();
                self.evaluate_path(meta, row, &segments, &mut |field: &FieldDescription, stored: &Value| {
                    matches_predicate(op, field, stored, &node.args[1])
                })
            }
            other => Err(rql(
                RqlErrorCode::UnknownOperator,
                format!("RQL operator '{}' is unknown", other),
            )),
        }
    }

    /// Existential evaluation of a predicate along a field path
    fn evaluate_path(
        &self,
        meta: &Meta,
        row: &ValueMap,
        path: &[&str],
        predicate: &mut dyn FnMut(&FieldDescription, &Value) -> Result<bool>,
    ) -> Result<bool> {
        let name = path[0];
        let field = meta.find_field(name).ok_or_else(|| {
            rql(
                RqlErrorCode::WrongFieldName,
                format!("Field '{}' not found in '{}'", name, meta.name),
            )
        })?;
        let rest = &path[1..];
        let stored = row.get(name).cloned().unwrap_or(Value::Null);

        if rest.is_empty() {
            return match (field.field_type, field.link_type) {
                (FieldType::Generic, LinkType::Inner) => predicate(field, &generic_object(&stored)),
                (FieldType::Array | FieldType::Objects, _) | (FieldType::Generic, LinkType::Outer) => Err(rql(
                    RqlErrorCode::WrongFieldName,
                    format!("Field '{}' of '{}' is a relation and cannot be compared", name, meta.name),
                )),
                _ => predicate(field, &stored),
            };
        }

        match (field.field_type, field.link_type) {
            (FieldType::Objects, _) => {
                let through_name = field.link_through.as_deref().unwrap_or_default();
                let through = self.metas.require_meta(through_name)?;
                let reverse = through
                    .find_field(&meta.name)
                    .and_then(|f| f.reverse_outer_field(meta))
                    .ok_or_else(|| rql(RqlErrorCode::Internal, format!("Reverse field of '{}' not found", through_name)))?;
                let target = field.link_meta.as_deref().unwrap_or_default();
                let mut rewritten: Vec<&str> = vec![reverse.name.as_str(), target];
                rewritten.extend_from_slice(rest);
                self.evaluate_path(meta, row, &rewritten, predicate)
            }
            (FieldType::Object, LinkType::Inner) => {
                if stored.is_null() {
                    return Ok(false);
                }
                let target = self.metas.require_meta(field.link_meta.as_deref().unwrap_or_default())?;
                match self.get_row(&target.name, &stored) {
                    Some(target_row) => self.evaluate_path(&target, &target_row, rest, predicate),
                    None => Ok(false),
                }
            }
            (FieldType::Array, LinkType::Outer) | (FieldType::Generic, LinkType::Outer) => {
                let target = self.metas.require_meta(field.link_meta.as_deref().unwrap_or_default())?;
                let outer = field.outer_link_field.as_deref().unwrap_or_default();
                let key = row.get(&meta.key).cloned().unwrap_or(Value::Null);
                for target_row in self.rows_of(&target) {
                    let linked = if field.field_type == FieldType::Generic {
                        self.generic_matches(target_row.get(outer), &meta.name, &key)
                    } else {
                        target_row.get(outer).map(|v| v.loose_eq(&key)).unwrap_or(false)
                    };
                    if linked && self.evaluate_path(&target, &target_row, rest, predicate)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            (FieldType::Generic, LinkType::Inner) => {
                let object = rest[0];
                if object == GENERIC_OBJECT_KEY && rest.len() == 1 {
                    return predicate(field, &generic_object(&stored));
                }
                if !field.link_meta_list.iter().any(|m| m == object) || rest.len() < 2 {
                    return Err(rql(
                        RqlErrorCode::WrongFieldName,
                        format!("Path '{}' does not resolve through generic field '{}'", path.join("."), name),
                    ));
                }
                let target = self.metas.require_meta(object)?;
                let Some(map) = stored.as_map() else {
                    return Ok(false);
                };
                if map.get(GENERIC_OBJECT_KEY).and_then(Value::as_str) != Some(object) {
                    return Ok(false);
                }
                let key = map.get(&target.key).cloned().unwrap_or(Value::Null);
                match self.get_row(&target.name, &key) {
                    Some(target_row) => self.evaluate_path(&target, &target_row, &rest[1..], predicate),
                    None => Ok(false),
                }
            }
            _ => Err(rql(
                RqlErrorCode::WrongFieldName,
                format!("Field '{}' of '{}' is not a relation", name, meta.name),
            )),
        }
    }
}

impl DataStore for MemoryStore {
    fn begin(&self, tx: TransactionId) -> Result<()> {
        self.undo.insert(tx, Vec::new());
        Ok(())
    }

    fn commit(&self, tx: TransactionId) -> Result<()> {
        self.undo.remove(&tx);
        Ok(())
    }

    fn rollback(&self, tx: TransactionId) -> Result<()> {
        let Some((_, entries)) = self.undo.remove(&tx) else {
            return Ok(());
        };
        let _guard = self.write_lock.lock();
        for entry in entries.into_iter().rev() {
            match entry {
                UndoEntry::Inserted { table, key } => {
                    if let Some(mut t) = self.tables.get_mut(&table) {
                        t.remove(&key);
                    }
                }
                UndoEntry::Replaced { table, key, row } | UndoEntry::Deleted { table, key, row } => {
                    self.tables.entry(table).or_default().insert(key, row);
                }
            }
        }
        tracing::debug!(tx, "memory store rolled back");
        Ok(())
    }

    fn get_all(
        &self,
        meta: &Meta,
        fields: &[String],
        conditions: &[Condition],
        _tx: TransactionId,
    ) -> Result<Vec<ValueMap>> {
        let rows = self
            .rows_of(meta)
            .into_iter()
            .filter(|row| {
                conditions.iter().all(|condition| match condition {
                    Condition::Equals(field, value) => row.get(field).map(|v| v.loose_eq(value)).unwrap_or(false),
                    Condition::GenericRef { field, object, key } => self.generic_matches(row.get(field), object, key),
                })
            })
            .map(|row| project(row, fields))
            .collect();
        Ok(rows)
    }

    fn get_rql(&self, request: &RqlRequest<'_>, _tx: TransactionId) -> Result<(Vec<ValueMap>, usize)> {
        let meta = request.meta;
        let mut rows = Vec::new();
        for row in self.rows_of(meta) {
            let keep = match &request.query.node {
                Some(node) => self.evaluate(meta, &row, node)?,
                None => true,
            };
            if keep {
                rows.push(row);
            }
        }
        let total = rows.len();

        let mut terms: Vec<(String, bool)> = request
            .query
            .sort
            .iter()
            .map(|t| (t.by.clone(), t.desc))
            .collect();
        if !terms.iter().any(|(by, _)| *by == meta.key) {
            terms.push((meta.key.clone(), false));
        }
        rows.sort_by(|a, b| {
            for (by, desc) in &terms {
                let left = a.get(by).unwrap_or(&Value::Null);
                let right = b.get(by).unwrap_or(&Value::Null);
                let ordering = left.compare(right).unwrap_or(Ordering::Equal);
                let ordering = if *desc { ordering.reverse() } else { ordering };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });

        let offset = request.query.offset.unwrap_or(0);
        let limit = request.query.limit.unwrap_or(usize::MAX);
        let page = rows
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|row| project(row, request.fields))
            .collect();
        Ok((page, total))
    }

    fn insert(&self, meta: &Meta, rows: Vec<ValueMap>, tx: TransactionId) -> Result<Vec<ValueMap>> {
        let _guard = self.write_lock.lock();
        let mut inserted = Vec::with_capacity(rows.len());
        for mut row in rows {
            row.retain(|name, _| meta.find_field(name).map(|f| f.is_table_column()).unwrap_or(false));
            for field in meta.table_fields() {
                let provided = row.get(&field.name).cloned();
                let value = match (provided, &field.default) {
                    (Some(v), Some(DefaultValue::NextVal)) if !v.is_null() => {
                        self.bump_sequence(meta, &field.name, &v);
                        v
                    }
                    (None | Some(Value::Null), Some(DefaultValue::NextVal)) => {
                        Value::Int(self.next_sequence(meta, &field.name))
                    }
                    (None, Some(DefaultValue::Literal(v))) => v.clone(),
                    (Some(v), _) => v,
                    (None, _) => Value::Null,
                };
                row.insert(field.name.clone(), value);
                if let Some(value) = row.get(&field.name) {
                    self.check_column(meta, field, value)?;
                }
            }

            let key_value = row.get(&meta.key).cloned().unwrap_or(Value::Null);
            let key = key_value.to_key_string();
            if let Some(existing) = self.get_row(&meta.name, &key_value) {
                return Err(EngineError::Duplicated {
                    column: meta.key.clone(),
                    value: key_value,
                    duplicates: vec![Value::Map(existing)],
                });
            }
            self.tables.entry(meta.name.clone()).or_default().insert(key.clone(), row.clone());
            self.log_undo(
                tx,
                UndoEntry::Inserted {
                    table: meta.name.clone(),
                    key,
                },
            );
            inserted.push(row);
        }
        Ok(inserted)
    }

    fn update(&self, meta: &Meta, rows: Vec<ValueMap>, tx: TransactionId) -> Result<Vec<ValueMap>> {
        let _guard = self.write_lock.lock();
        let mut updated = Vec::with_capacity(rows.len());
        for row in rows {
            let key_value = row.get(&meta.key).cloned().unwrap_or(Value::Null);
            let key = key_value.to_key_string();
            let existing = self.get_row(&meta.name, &key_value).ok_or_else(|| EngineError::RecordNotFound {
                meta: meta.name.clone(),
                pk: key.clone(),
            })?;
            let mut merged = existing.clone();
            for (name, value) in row {
                let Some(field) = meta.find_field(&name) else {
                    continue;
                };
                if !field.is_table_column() {
                    continue;
                }
                self.check_column(meta, field, &value)?;
                merged.insert(name, value);
            }
            self.tables.entry(meta.name.clone()).or_default().insert(key.clone(), merged.clone());
            self.log_undo(
                tx,
                UndoEntry::Replaced {
                    table: meta.name.clone(),
                    key,
                    row: existing,
                },
            );
            updated.push(merged);
        }
        Ok(updated)
    }

    fn delete(&self, meta: &Meta, keys: &[Value], tx: TransactionId) -> Result<()> {
        let _guard = self.write_lock.lock();
        for key_value in keys {
            if let Some((other, field)) = self.referencing_rows(meta, key_value)? {
                return Err(EngineError::Dml {
                    code: DmlCode::ForeignKeyViolation,
                    message: format!(
                        "record '{}' of \"{}\" is still referenced from \"{}\".\"{}\"",
                        key_value, meta.name, other, field
                    ),
                    column: Some(field),
                    value: Some(key_value.clone()),
                });
            }
            let key = key_value.to_key_string();
            let removed = self.tables.get_mut(&meta.name).and_then(|mut t| t.remove(&key));
            if let Some(row) = removed {
                self.log_undo(
                    tx,
                    UndoEntry::Deleted {
                        table: meta.name.clone(),
                        key,
                        row,
                    },
                );
            }
        }
        Ok(())
    }
}

fn project(row: ValueMap, fields: &[String]) -> ValueMap {
    if fields.is_empty() {
        return row;
    }
    row.into_iter().filter(|(k, _)| fields.iter().any(|f| f == k)).collect()
}

fn sort_by_key(rows: &mut [ValueMap], key: &str) {
    rows.sort_by(|a, b| {
        let left = a.get(key).unwrap_or(&Value::Null);
        let right = b.get(key).unwrap_or(&Value::Null);
        left.compare(right).unwrap_or(Ordering::Equal)
    });
}

fn generic_object(stored: &Value) -> Value {
    stored
        .as_map()
        .and_then(|m| m.get(GENERIC_OBJECT_KEY))
        .cloned()
        .unwrap_or(Value::Null)
}

fn matches_predicate(op: &str, field: &FieldDescription, stored: &Value, arg: &RqlArg) -> Result<bool> {
    match op {
        "is_null" => {
            let flag = match arg {
                RqlArg::Value(v) => v.parse::<bool>().ok(),
                RqlArg::Node(n) if n.args.is_empty() => match n.op.as_str() {
                    "true" => Some(true),
                    "false" => Some(false),
                    _ => None,
                },
                _ => None,
            };
            let flag = flag.ok_or_else(|| wrong(format!("Second argument of 'is_null' must be a boolean, got '{}'", arg)))?;
            Ok(stored.is_null() == flag)
        }
        "in" => {
            let items: Vec<&RqlArg> = match arg {
                RqlArg::List(items) => items.iter().collect(),
                single => vec![single],
            };
            for item in items {
                if let Some(value) = non_null_literal(field, item)? {
                    if stored.loose_eq(&value) {
                        return Ok(true);
                    }
                }
            }
            Ok(false)
        }
        "like" => {
            let pattern = arg
                .as_value()
                .ok_or_else(|| rql(RqlErrorCode::WrongValue, format!("'like' expects a pattern, got '{}'", arg)))?;
            Ok(match stored.as_str() {
                Some(text) => like_matches(&glob_to_like(pattern), text),
                None => false,
            })
        }
        _ => {
            let Some(value) = non_null_literal(field, arg)? else {
                return Ok(false);
            };
            if stored.is_null() {
                return Ok(false);
            }
            Ok(match op {
                "eq" => stored.loose_eq(&value),
                "ne" => !stored.loose_eq(&value),
                _ => match stored.compare(&value) {
                    Some(ordering) => match op {
                        "lt" => ordering == Ordering::Less,
                        "le" => ordering != Ordering::Greater,
                        "gt" => ordering == Ordering::Greater,
                        _ => ordering != Ordering::Less,
                    },
                    None => false,
                },
            })
        }
    }
}

fn non_null_literal(field: &FieldDescription, arg: &RqlArg) -> Result<Option<Value>> {
    match literal_value(field, arg)? {
        Some(value) => Ok(Some(value)),
        None => Err(rql(
            RqlErrorCode::WrongValue,
            format!("Field '{}' cannot be compared with NULL, use is_null", field.name),
        )),
    }
}

/// Case-insensitive SQL `LIKE` with `%` wildcards
fn like_matches(pattern: &str, text: &str) -> bool {
    let pattern = pattern.to_lowercase();
    let text = text.to_lowercase();
    let parts: Vec<&str> = pattern.split('%').collect();
    if parts.len() == 1 {
        return pattern == text;
    }
    let mut rest = text.as_str();
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}

fn fk_violation(meta: &Meta, field: &FieldDescription, value: &Value) -> EngineError {
    EngineError::Dml {
        code: DmlCode::ForeignKeyViolation,
        message: format!(
            "insert or update on \"{}\" violates foreign key \"{}\": key '{}' is not present",
            meta.name, field.name, value
        ),
        column: Some(field.name.clone()),
        value: Some(value.clone()),
    }
}

fn expect_node(arg: &RqlArg) -> Result<&RqlNode> {
    match arg {
        RqlArg::Node(node) => Ok(node),
        other => Err(wrong(format!("Expected an expression, got '{}'", other))),
    }
}

fn wrong(message: impl Into<String>) -> EngineError {
    rql(RqlErrorCode::Wrong, message)
}

fn rql(code: RqlErrorCode, message: impl Into<String>) -> EngineError {
    EngineError::Rql(RqlError::new(code, message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{FieldSpec, MetaDescription, MetaRegistry};
    use crate::rql_parser::Parser;
    use serde_json::json;

    fn setup() -> (Arc<MetaRegistry>, MemoryStore) {
        let registry = Arc::new(MetaRegistry::new());
        registry
            .create(
                MetaDescription::new("a", "id")
                    .with_field(FieldSpec::key("id"))
                    .with_field(FieldSpec::new("name", FieldType::String))
                    .with_field(FieldSpec::new("score", FieldType::Number).optional().with_default(json!(5))),
            )
            .unwrap();
        registry
            .create(
                MetaDescription::new("b", "id")
                    .with_field(FieldSpec::key("id"))
                    .with_field(FieldSpec::object("a", "a")),
            )
            .unwrap();
        let store = MemoryStore::new(registry.clone());
        (registry, store)
    }

    fn row(json: serde_json::Value) -> ValueMap {
        crate::types::map_from_json(json)
    }

    #[test]
    fn test_insert_applies_sequence_and_defaults() {
        let (registry, store) = setup();
        let a = registry.require_meta("a").unwrap();
        let rows = store.insert(&a, vec![row(json!({"name": "x"})), row(json!({"name": "y"}))], 1).unwrap();
        assert_eq!(rows[0]["id"], Value::Int(1));
        assert_eq!(rows[1]["id"], Value::Int(2));
        assert_eq!(rows[0]["score"], Value::Int(5));

        let err = store.insert(&a, vec![row(json!({"id": 1, "name": "z"}))], 1).unwrap_err();
        assert_eq!(err.code(), "duplicated_value_error");
        let err = store.insert(&a, vec![row(json!({"score": 1}))], 1).unwrap_err();
        assert!(matches!(err, EngineError::Dml { code: DmlCode::NotNullViolation, .. }));
    }

    #[test]
    fn test_foreign_keys() {
        let (registry, store) = setup();
        let a = registry.require_meta("a").unwrap();
        let b = registry.require_meta("b").unwrap();
        let err = store.insert(&b, vec![row(json!({"a": 9}))], 1).unwrap_err();
        assert!(matches!(err, EngineError::Dml { code: DmlCode::ForeignKeyViolation, .. }));
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);

        let parent = store.insert(&a, vec![row(json!({"name": "x"}))], 1).unwrap();
        let parent_key = parent[0]["id"].clone();
        let child_row = ValueMap::from([("a".to_string(), parent_key.clone())]);
        let child = store.insert(&b, vec![child_row], 1).unwrap();
        let child_key = child[0]["id"].clone();
        assert!(store.delete(&a, &[parent_key.clone()], 1).is_err());
        store.delete(&b, &[child_key], 1).unwrap();
        store.delete(&a, &[parent_key], 1).unwrap();
        assert_eq!(store.row_count("a"), 0);
    }

    #[test]
    fn test_rollback_restores_rows() {
        let (registry, store) = setup();
        let a = registry.require_meta("a").unwrap();
        store.begin(1).unwrap();
        store.insert(&a, vec![row(json!({"name": "x"}))], 1).unwrap();
        store.commit(1).unwrap();

        store.begin(2).unwrap();
        store.update(&a, vec![row(json!({"id": 1, "name": "changed"}))], 2).unwrap();
        store.insert(&a, vec![row(json!({"name": "y"}))], 2).unwrap();
        store.rollback(2).unwrap();

        assert_eq!(store.row_count("a"), 1);
        assert_eq!(store.get_row("a", &Value::Int(1)).unwrap()["name"], Value::String("x".into()));
    }

    #[test]
    fn test_rql_evaluation() {
        let (registry, store) = setup();
        let a = registry.require_meta("a").unwrap();
        let b = registry.require_meta("b").unwrap();
        store
            .insert(&a, vec![row(json!({"name": "Alpha"})), row(json!({"name": "beta", "score": 9}))], 1)
            .unwrap();
        store.insert(&b, vec![row(json!({"a": 2})), row(json!({"a": 2}))], 1).unwrap();

        let run = |meta: &Meta, rql: &str| {
            let query = Parser::parse(rql).unwrap();
            let sql = SqlQuery::default();
            let request = RqlRequest {
                meta,
                fields: &[],
                query: &query,
                sql: &sql,
            };
            store.get_rql(&request, 1).unwrap()
        };

        let (rows, total) = run(&a, "like(name,*ALP*)");
        assert_eq!((rows.len(), total), (1, 1));
        let (rows, _) = run(&a, "eq(b_set.id,2)");
        assert_eq!(rows[0]["name"], Value::String("beta".into()));
        let (rows, _) = run(&b, "gt(a.score,6),sort(-id),limit(1)");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], Value::Int(2));
        let (rows, total) = run(&a, "sort(-score),limit(1,1)");
        assert_eq!(total, 2);
        assert_eq!(rows[0]["name"], Value::String("Alpha".into()));
    }

    #[test]
    fn test_like_matcher() {
        assert!(like_matches("%bc%", "abcd"));
        assert!(like_matches("ab%", "abcd"));
        assert!(like_matches("%cd", "abcd"));
        assert!(!like_matches("%x%", "abcd"));
        assert!(like_matches("abcd", "ABCD"));
    }
}
