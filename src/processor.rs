//! Processor
//!
//! Entry point of the engine: reads with [`Processor::get`] and
//! [`Processor::get_bulk`], nested writes with the create/update/remove
//! families. Every write operation collects its notifications in one pool
//! which is completed once the operation has finished.

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::meta::{Meta, MetaStore, Method};
use crate::notification::{NotificationPool, User};
use crate::processing::Execution;
use crate::query::TxScope;
use crate::record::{Record, WriteGraph};
use crate::removal::RemovalTreeBuilder;
use crate::retrieve_policy::RetrievePolicy;
use crate::rql_parser::Parser;
use crate::storage::DataStore;
use crate::transaction::TransactionManager;
use crate::types::{Value, ValueMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Read options of [`Processor::get`] and [`Processor::get_bulk`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GetOptions {
    /// Resolution depth, the configured default when `None`
    pub depth: Option<usize>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub omit_outers: bool,
}

impl GetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = Some(depth);
        self
    }

    pub fn include(mut self, path: &str) -> Self {
        self.include.push(path.to_string());
        self
    }

    pub fn exclude(mut self, path: &str) -> Self {
        self.exclude.push(path.to_string());
        self
    }

    pub fn omit_outers(mut self) -> Self {
        self.omit_outers = true;
        self
    }
}

pub struct Processor {
    metas: Arc<dyn MetaStore>,
    transactions: TransactionManager,
    config: EngineConfig,
    shut_down: AtomicBool,
}

impl Processor {
    pub fn new(metas: Arc<dyn MetaStore>, store: Arc<dyn DataStore>, config: EngineConfig) -> Self {
        tracing::info!(table_prefix = %config.table_prefix, "processor started");
        Processor {
            metas,
            transactions: TransactionManager::new(store),
            config,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    /// One record by key
    pub fn get(&self, object: &str, key: impl Into<Value>, options: &GetOptions) -> Result<Option<ValueMap>> {
        self.ensure_running()?;
        let meta = self.metas.require_meta(object)?;
        let key = typed_key(&meta, key.into())?;
        tracing::debug!(object, key = %key, "get record");
        let policy = RetrievePolicy::new(&options.include[..], &options.exclude[..]);
        let depth = options.depth.unwrap_or(self.config.default_depth);
        self.scope()
            .run(|ctx| ctx.get(&meta, &key, depth, policy, options.omit_outers))
            .map_err(|e| log_failure("get", object, e))
    }

    /// Records matching an RQL filter, with the total count before paging
    pub fn get_bulk(&self, object: &str, filter: &str, options: &GetOptions) -> Result<(Vec<ValueMap>, usize)> {
        self.ensure_running()?;
        let meta = self.metas.require_meta(object)?;
        tracing::debug!(object, filter, "get bulk");
        let query = Parser::parse(filter).map_err(EngineError::from)?;
        let policy = RetrievePolicy::new(&options.include[..], &options.exclude[..]);
        let depth = options.depth.unwrap_or(self.config.default_depth);
        self.scope()
            .run(|ctx| ctx.get_bulk(&meta, &query, depth, policy, options.omit_outers))
            .map_err(|e| log_failure("get_bulk", object, e))
    }

    pub fn create_record(&self, object: &str, data: ValueMap, user: Option<&User>) -> Result<ValueMap> {
        let mut results = self.bulk_create_records(object, vec![data], user)?;
        results
            .pop()
            .ok_or_else(|| EngineError::Internal("create returned no record".to_string()))
    }

    pub fn bulk_create_records(&self, object: &str, records: Vec<ValueMap>, user: Option<&User>) -> Result<Vec<ValueMap>> {
        self.ensure_running()?;
        tracing::debug!(object, count = records.len(), "create records");
        self.with_pool(|processor, pool| {
            let meta = processor.metas.require_meta(object)?;
            let mut results = Vec::with_capacity(records.len());
            for data in records {
                results.push(processor.write_one(&meta, data, Method::Create, pool, user)?);
            }
            Ok(results)
        })
        .map_err(|e| log_failure("create", object, e))
    }

    pub fn update_record(&self, object: &str, key: impl Into<Value>, mut data: ValueMap, user: Option<&User>) -> Result<ValueMap> {
        let meta = self.metas.require_meta(object)?;
        data.insert(meta.key.clone(), key.into());
        let mut results = self.bulk_update_records(object, vec![data], user)?;
        results
            .pop()
            .ok_or_else(|| EngineError::Internal("update returned no record".to_string()))
    }

    /// Update records identified by the key each of them carries
    pub fn bulk_update_records(&self, object: &str, records: Vec<ValueMap>, user: Option<&User>) -> Result<Vec<ValueMap>> {
        self.ensure_running()?;
        tracing::debug!(object, count = records.len(), "update records");
        self.with_pool(|processor, pool| {
            let meta = processor.metas.require_meta(object)?;
            let mut results = Vec::with_capacity(records.len());
            for mut data in records {
                let key = data.get(&meta.key).cloned().ok_or(EngineError::KeyValueNotFound)?;
                data.insert(meta.key.clone(), typed_key(&meta, key)?);
                results.push(processor.write_one(&meta, data, Method::Update, pool, user)?);
            }
            Ok(results)
        })
        .map_err(|e| log_failure("update", object, e))
    }

    /// Remove a record and its dependents; returns the removed tree
    pub fn remove_record(&self, object: &str, key: impl Into<Value>, user: Option<&User>) -> Result<ValueMap> {
        let meta = self.metas.require_meta(object)?;
        let mut data = ValueMap::new();
        data.insert(meta.key.clone(), key.into());
        let mut results = self.bulk_delete_records(object, vec![data], user)?;
        results
            .pop()
            .ok_or_else(|| EngineError::Internal("remove returned no record".to_string()))
    }

    pub fn bulk_delete_records(&self, object: &str, records: Vec<ValueMap>, user: Option<&User>) -> Result<Vec<ValueMap>> {
        self.ensure_running()?;
        tracing::debug!(object, count = records.len(), "remove records");
        self.with_pool(|processor, pool| {
            let meta = processor.metas.require_meta(object)?;
            let mut results = Vec::with_capacity(records.len());
            for data in records {
                let key = data.get(&meta.key).cloned().ok_or(EngineError::KeyValueNotFound)?;
                let key = typed_key(&meta, key)?;
                results.push(processor.remove_one(&meta, key, pool, user)?);
            }
            Ok(results)
        })
        .map_err(|e| log_failure("remove", object, e))
    }

    /// Stop accepting operations; pools of running operations still complete
    pub fn shutdown(&self) {
        if !self.shut_down.swap(true, Ordering::SeqCst) {
            let stats = self.transactions.stats();
            tracing::info!(
                committed = stats.committed,
                aborted = stats.aborted,
                "processor shut down"
            );
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn scope(&self) -> TxScope<'_> {
        TxScope::new(self.metas.as_ref(), &self.transactions, &self.config.table_prefix)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(EngineError::Internal("processor is shut down".to_string()));
        }
        Ok(())
    }

    /// Run `operation` with a notification pool completed afterwards
    fn with_pool<T>(&self, operation: impl FnOnce(&Self, &mut NotificationPool) -> Result<T>) -> Result<T> {
        let mut pool = NotificationPool::new(self.config.notification_buffer);
        let result = operation(self, &mut pool);
        pool.complete(result.as_ref().map(|_| ()));
        result
    }

    fn write_one(
        &self,
        meta: &Arc<Meta>,
        data: ValueMap,
        method: Method,
        pool: &mut NotificationPool,
        user: Option<&User>,
    ) -> Result<ValueMap> {
        let mut graph = WriteGraph::new();
        let root = graph.add(Record::new(meta.clone(), data));
        Execution::new(self.scope(), pool, user.cloned()).process(&mut graph, root, Some(method), true)?;
        Ok(graph.materialize(root))
    }

    fn remove_one(&self, meta: &Arc<Meta>, key: Value, pool: &mut NotificationPool, user: Option<&User>) -> Result<ValueMap> {
        let scope = self.scope();
        let record = scope
            .run(|ctx| ctx.get(meta, &key, 1, RetrievePolicy::empty(), true))?
            .ok_or_else(|| EngineError::RecordNotFound {
                meta: meta.name.clone(),
                pk: key.to_key_string(),
            })?;
        let tree = RemovalTreeBuilder::new(scope).extract(meta.clone(), record)?;
        Execution::new(scope, pool, user.cloned()).perform_remove(&tree, true)?;
        tracing::debug!(object = %meta.name, removed = tree.removed_count(), "record removed");
        Ok(tree.data())
    }
}

impl Drop for Processor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Key value typed for the meta's key field
fn typed_key(meta: &Meta, key: Value) -> Result<Value> {
    let field = meta.key_field();
    if key.is_null() {
        return Err(EngineError::KeyValueNotFound);
    }
    if field.is_value_type_valid(&key) {
        return Ok(key);
    }
    match &key {
        Value::String(raw) => field.value_from_str(raw).ok_or(EngineError::KeyValueNotFound),
        _ => Err(EngineError::KeyValueNotFound),
    }
}

fn log_failure(operation: &str, object: &str, error: EngineError) -> EngineError {
    match error.kind() {
        crate::error::ErrorKind::Internal | crate::error::ErrorKind::Dml => {
            tracing::error!(operation, object, code = error.code(), error = %error, "operation failed")
        }
        _ => tracing::warn!(operation, object, code = error.code(), error = %error, "operation rejected"),
    }
    error
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{FieldSpec, FieldType, MetaDescription, MetaRegistry};
    use crate::storage::MemoryStore;
    use crate::types::map_from_json;
    use serde_json::json;

    fn processor() -> Processor {
        let registry = Arc::new(MetaRegistry::new());
        registry
            .create(
                MetaDescription::new("a", "id")
                    .with_field(FieldSpec::key("id"))
                    .with_field(FieldSpec::new("name", FieldType::String)),
            )
            .unwrap();
        let store = Arc::new(MemoryStore::new(registry.clone()));
        Processor::new(registry, store, EngineConfig::default())
    }

    #[test]
    fn test_create_get_update_remove() {
        let processor = processor();
        let created = processor
            .create_record("a", map_from_json(json!({"name": "x"})), None)
            .unwrap();
        assert_eq!(created["id"], Value::Int(1));

        let updated = processor
            .update_record("a", "1", map_from_json(json!({"name": "y"})), None)
            .unwrap();
        assert_eq!(updated["name"], Value::String("y".into()));

        let fetched = processor.get("a", 1i64, &GetOptions::new()).unwrap().unwrap();
        assert_eq!(fetched["name"], Value::String("y".into()));

        processor.remove_record("a", 1i64, None).unwrap();
        assert!(processor.get("a", 1i64, &GetOptions::new()).unwrap().is_none());
    }

    #[test]
    fn test_key_errors() {
        let processor = processor();
        let err = processor
            .bulk_update_records("a", vec![map_from_json(json!({"name": "n"}))], None)
            .unwrap_err();
        assert_eq!(err.code(), "key_value_not_found");
        let err = processor.get("a", "abc", &GetOptions::new()).unwrap_err();
        assert_eq!(err.code(), "key_value_not_found");
        let err = processor.remove_record("a", 5i64, None).unwrap_err();
        assert_eq!(err.code(), "record_not_found");
        let err = processor.get("missing", 1i64, &GetOptions::new()).unwrap_err();
        assert_eq!(err.code(), "object_class_not_found");
    }

    #[test]
    fn test_shutdown_rejects_operations() {
        let processor = processor();
        processor.shutdown();
        assert!(processor.is_shut_down());
        assert!(processor.get("a", 1i64, &GetOptions::new()).is_err());
    }
}
