//! Custodian - Rust Core Engine
//!
//! Schema-driven engine resolving and mutating graphs of records.
//!
//! # Architecture
//!
//! - Schema Layer: metas, fields, link kinds and notification actions
//! - Query Layer: RQL parsing, SQL translation and depth-limited resolution
//! - Storage Layer: a `DataStore` trait with an in-memory implementation
//! - Write Layer: validation, nested create/update and cascading removal
//! - Notification Layer: per-operation pools delivering record set events

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

// Schema modules
pub mod links;
pub mod meta;

// Query modules
pub mod node;
pub mod query;
pub mod retrieve_policy;
pub mod rql;
pub mod rql_ast;
pub mod rql_lexer;
pub mod rql_parser;

// Storage modules
pub mod storage;
pub mod transaction;

// Write modules
pub mod generic_validator;
pub mod processing;
pub mod processor;
pub mod record;
pub mod removal;
pub mod validator;

pub mod notification;

pub use config::EngineConfig;
pub use error::{DmlCode, EngineError, ErrorKind, QueryError, Result, RqlError, RqlErrorCode};
pub use types::{map_from_json, map_to_json, Value, ValueMap};

// Schema exports
pub use links::{GenericLink, Link, GENERIC_OBJECT_KEY};
pub use meta::{
    ActionSpec, FieldSpec, FieldType, LinkType, Meta, MetaDescription, MetaRegistry, MetaStore, Method,
    OnDeleteStrategy, Protocol,
};

// Query exports
pub use retrieve_policy::RetrievePolicy;
pub use rql::{SqlQuery, SqlTranslator};
pub use rql_ast::{RqlNode, RqlQuery};
pub use rql_parser::Parser as RqlParser;

// Storage exports
pub use storage::{DataStore, MemoryStore};
pub use transaction::{TransactionId, TransactionManager, TransactionStats};

// Processor exports
pub use notification::{Event, Notifier, TestNotifier, User};
pub use processor::{GetOptions, Processor};
pub use removal::RemovalNode;
