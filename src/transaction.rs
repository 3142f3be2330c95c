//! Transaction Management
//!
//! Every statement (or small batch) of the engine runs inside its own
//! transaction obtained from the [`TransactionManager`]. Handles forward
//! commit/rollback to the data store; a handle dropped without being finished
//! is rolled back.

use crate::error::{EngineError, Result};
use crate::storage::DataStore;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Unique transaction identifier
pub type TransactionId = u64;

/// Transaction state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionState {
    /// Transaction is currently active
    Active,
    /// Transaction has been committed
    Committed,
    /// Transaction has been rolled back
    Aborted,
}

/// Transaction metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub state: TransactionState,
    /// When transaction started (milliseconds since epoch)
    pub start_time: u64,
}

impl Transaction {
    pub fn new(id: TransactionId) -> Self {
        let start_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Transaction {
            id,
            state: TransactionState::Active,
            start_time,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }
}

/// Counters over the lifetime of a manager
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionStats {
    pub begun: u64,
    pub committed: u64,
    pub aborted: u64,
}

struct ManagerState {
    next_txn_id: AtomicU64,
    store: Arc<dyn DataStore>,
    active_transactions: RwLock<HashMap<TransactionId, Transaction>>,
    stats: RwLock<TransactionStats>,
}

impl ManagerState {
    fn finish(&self, txn_id: TransactionId, commit: bool) -> Result<()> {
        let transaction = self
            .active_transactions
            .write()
            .remove(&txn_id)
            .ok_or_else(|| EngineError::Transaction(format!("Transaction {} not found", txn_id)))?;
        if !transaction.is_active() {
            return Err(EngineError::Transaction(format!("Transaction {} is not active", txn_id)));
        }
        if commit {
            match self.store.commit(txn_id) {
                Ok(()) => {
                    self.stats.write().committed += 1;
                    Ok(())
                }
                Err(e) => {
                    if let Err(rollback) = self.store.rollback(txn_id) {
                        tracing::error!(txn_id, error = %rollback, "rollback failed");
                    }
                    self.stats.write().aborted += 1;
                    Err(e)
                }
            }
        } else {
            self.stats.write().aborted += 1;
            self.store.rollback(txn_id)
        }
    }
}

/// Transaction manager - hands out transactions over one data store
#[derive(Clone)]
pub struct TransactionManager {
    state: Arc<ManagerState>,
}

impl TransactionManager {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        TransactionManager {
            state: Arc::new(ManagerState {
                next_txn_id: AtomicU64::new(1),
                store,
                active_transactions: RwLock::new(HashMap::new()),
                stats: RwLock::new(TransactionStats::default()),
            }),
        }
    }

    /// Begin a new transaction
    pub fn begin(&self) -> Result<DbTransaction> {
        let txn_id = self.state.next_txn_id.fetch_add(1, Ordering::SeqCst);
        self.state.store.begin(txn_id)?;
        self.state
            .active_transactions
            .write()
            .insert(txn_id, Transaction::new(txn_id));
        self.state.stats.write().begun += 1;
        tracing::trace!(txn_id, "transaction begun");
        Ok(DbTransaction {
            id: txn_id,
            state: self.state.clone(),
            finished: false,
        })
    }

    pub fn store(&self) -> &Arc<dyn DataStore> {
        &self.state.store
    }

    pub fn get_transaction(&self, txn_id: TransactionId) -> Option<Transaction> {
        self.state.active_transactions.read().get(&txn_id).cloned()
    }

    pub fn get_active_txn_ids(&self) -> Vec<TransactionId> {
        self.state.active_transactions.read().keys().copied().collect()
    }

    pub fn stats(&self) -> TransactionStats {
        *self.state.stats.read()
    }
}

/// Handle of an active transaction
pub struct DbTransaction {
    id: TransactionId,
    state: Arc<ManagerState>,
    finished: bool,
}

impl DbTransaction {
    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        tracing::trace!(txn_id = self.id, "transaction commit");
        self.state.finish(self.id, true)
    }

    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        tracing::trace!(txn_id = self.id, "transaction rollback");
        self.state.finish(self.id, false)
    }
}

impl Drop for DbTransaction {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.state.finish(self.id, false) {
                tracing::warn!(txn_id = self.id, error = %e, "rollback of dropped transaction failed");
            }
        }
    }
}

impl std::fmt::Debug for DbTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbTransaction")
            .field("id", &self.id)
            .field("finished", &self.finished)
            .finish()
    }
}
