//! Execution of write graphs and removal trees
//!
//! [`Execution`] walks a [`WriteGraph`] depth-first: retrieve-before children,
//! process-before children, the record's own statement, process-after
//! children, and finally the stored records which are no longer linked. Every
//! statement runs in its own transaction; a failure aborts the walk but leaves
//! earlier statements committed.

use crate::error::{EngineError, Result};
use crate::links::RecordId;
use crate::meta::{Meta, Method, OnDeleteStrategy};
use crate::notification::{NotificationPool, RecordSetNotification, User};
use crate::query::TxScope;
use crate::record::WriteGraph;
use crate::removal::{RemovalNode, RemovalTreeBuilder};
use crate::retrieve_policy::RetrievePolicy;
use crate::types::{Value, ValueMap};
use crate::validator::Validator;
use std::sync::Arc;

pub struct Execution<'a, 'p> {
    scope: TxScope<'a>,
    pool: &'p mut NotificationPool,
    user: Option<User>,
}

impl<'a, 'p> Execution<'a, 'p> {
    pub fn new(scope: TxScope<'a>, pool: &'p mut NotificationPool, user: Option<User>) -> Self {
        Execution { scope, pool, user }
    }

    /// Write the record `id` and everything nested in it. `method` forces the
    /// statement of the record itself; nested records are created when they
    /// have no key and updated otherwise.
    pub fn process(&mut self, graph: &mut WriteGraph, id: RecordId, method: Option<Method>, is_root: bool) -> Result<()> {
        let partition = Validator::new(self.scope).validate(graph, id)?;
        let method = method.unwrap_or(if graph.get(id).is_phantom() {
            Method::Create
        } else {
            Method::Update
        });

        for child in partition.retrieve_before {
            self.retrieve(graph, child)?;
        }
        for child in partition.process_before {
            self.process(graph, child, None, false)?;
        }
        self.write(graph, id, method, is_root)?;
        for child in partition.process_after {
            self.process(graph, child, None, false)?;
        }
        for child in partition.remove_before {
            let record = graph.get(child);
            let tree = RemovalTreeBuilder::new(self.scope).extract(record.meta.clone(), record.data.clone())?;
            self.perform_remove(&tree, false)?;
        }
        Ok(())
    }

    /// Replace the data of `id` by its stored state
    fn retrieve(&mut self, graph: &mut WriteGraph, id: RecordId) -> Result<()> {
        let meta = graph.get(id).meta.clone();
        let key = graph.pk(id);
        let stored = self
            .scope
            .run(|ctx| ctx.get(&meta, &key, 1, RetrievePolicy::empty(), true))?
            .ok_or_else(|| EngineError::RecordNotFound {
                meta: meta.name.clone(),
                pk: key.to_key_string(),
            })?;
        graph.get_mut(id).data = stored;
        Ok(())
    }

    fn write(&mut self, graph: &mut WriteGraph, id: RecordId, method: Method, is_root: bool) -> Result<()> {
        let meta = graph.get(id).meta.clone();
        let raw = graph.prepare_data(id, method);
        tracing::debug!(meta = %meta.name, method = method.as_str(), is_root, "write record");

        let mut notification = RecordSetNotification::new(meta.clone(), method, is_root, self.user.clone());
        let notify = notification.should_be_processed();
        if notify {
            match method {
                Method::Create => notification.capture_empty(1, true),
                _ => self.scope.run(|ctx| notification.capture_previous(ctx, &[raw.clone()]))?,
            }
        }

        let rows = self.scope.run(|ctx| match method {
            Method::Create => ctx.store().insert(&meta, vec![raw], ctx.tx()),
            _ => ctx.store().update(&meta, vec![raw], ctx.tx()),
        })?;
        if let Some(row) = rows.into_iter().next() {
            graph.merge_data(id, row);
        }

        if notify {
            let current = graph.flat_data(id);
            self.scope.run(|ctx| notification.capture_current(ctx, &[current]))?;
            self.pool.add(notification);
        }
        Ok(())
    }

    /// Execute a removal tree bottom-up
    pub fn perform_remove(&mut self, node: &RemovalNode, is_root: bool) -> Result<()> {
        for children in node.children.values() {
            let mut unlinked: Vec<&RemovalNode> = Vec::new();
            for child in children {
                match child.strategy {
                    OnDeleteStrategy::SetNull | OnDeleteStrategy::SetDefault => unlinked.push(child),
                    OnDeleteStrategy::Cascade | OnDeleteStrategy::Restrict => self.perform_remove(child, false)?,
                }
            }
            if let Some(first) = unlinked.first() {
                self.unlink(&first.meta.clone(), &unlinked)?;
            }
        }
        self.delete(&node.meta, &node.record, is_root)
    }

    /// Update dependents of a removed record to null or their default
    fn unlink(&mut self, meta: &Arc<Meta>, nodes: &[&RemovalNode]) -> Result<()> {
        let rows: Vec<ValueMap> = nodes
            .iter()
            .filter_map(|node| {
                let field = node.link_field.as_ref()?;
                let replacement = match node.strategy {
                    OnDeleteStrategy::SetDefault => field.default_value(),
                    _ => Value::Null,
                };
                let mut row = ValueMap::new();
                row.insert(meta.key.clone(), node.pk());
                row.insert(field.name.clone(), replacement);
                Some(row)
            })
            .collect();
        tracing::debug!(meta = %meta.name, count = rows.len(), "unlink dependents");

        let mut notification = RecordSetNotification::new(meta.clone(), Method::Update, false, self.user.clone());
        let notify = notification.should_be_processed();
        if notify {
            self.scope.run(|ctx| notification.capture_previous(ctx, &rows))?;
        }
        self.scope.run(|ctx| ctx.store().update(meta, rows.clone(), ctx.tx()))?;
        if notify {
            self.scope.run(|ctx| notification.capture_current(ctx, &rows))?;
            self.pool.add(notification);
        }
        Ok(())
    }

    fn delete(&mut self, meta: &Arc<Meta>, record: &ValueMap, is_root: bool) -> Result<()> {
        let key = record.get(&meta.key).cloned().unwrap_or(Value::Null);
        tracing::debug!(meta = %meta.name, key = %key, is_root, "remove record");

        let mut notification = RecordSetNotification::new(meta.clone(), Method::Remove, is_root, self.user.clone());
        let notify = notification.should_be_processed();
        if notify {
            let records = [record.clone()];
            self.scope.run(|ctx| notification.capture_previous(ctx, &records))?;
            notification.capture_empty(1, false);
        }
        self.scope.run(|ctx| ctx.store().delete(meta, &[key], ctx.tx()))?;
        if notify {
            self.pool.add(notification);
        }
        Ok(())
    }
}
