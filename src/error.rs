//! Engine error taxonomy
//!
//! Every failure surfaced by the engine is an [`EngineError`]. Variants map onto
//! five kinds (validation, not found, removal, DML, internal) and carry a stable
//! machine code so callers can build field-level messages.

use crate::types::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, EngineError>;

/// Coarse error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Removal,
    Dml,
    Internal,
}

/// RQL translation error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RqlErrorCode {
    Internal,
    Wrong,
    UnknownOperator,
    UnknownValueFunction,
    WrongFieldName,
    WrongValue,
}

impl RqlErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RqlErrorCode::Internal => "internal",
            RqlErrorCode::Wrong => "wrong",
            RqlErrorCode::UnknownOperator => "unknown_operator",
            RqlErrorCode::UnknownValueFunction => "unknown_value_function",
            RqlErrorCode::WrongFieldName => "wrong_field_name",
            RqlErrorCode::WrongValue => "wrong_value",
        }
    }
}

/// Error produced while lexing, parsing or translating a filter expression
#[derive(Debug, Clone, PartialEq, Error)]
#[error("RQL error: code='{}' msg='{message}'", .code.as_str())]
pub struct RqlError {
    pub code: RqlErrorCode,
    pub message: String,
}

impl RqlError {
    pub fn new(code: RqlErrorCode, message: impl Into<String>) -> Self {
        RqlError {
            code,
            message: message.into(),
        }
    }
}

/// Error produced while applying retrieve policies to a query graph
#[derive(Debug, Clone, PartialEq, Error)]
#[error("Query error: {message}")]
pub struct QueryError {
    pub code: &'static str,
    pub message: String,
}

impl QueryError {
    pub const FIELD_NOT_FOUND: &'static str = "field_not_found";
    pub const SELECT_MODE_CONFLICT: &'static str = "select_mode_conflict";

    pub fn field_not_found(message: impl Into<String>) -> Self {
        QueryError {
            code: Self::FIELD_NOT_FOUND,
            message: message.into(),
        }
    }

    pub fn select_mode_conflict(message: impl Into<String>) -> Self {
        QueryError {
            code: Self::SELECT_MODE_CONFLICT,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Not optional field '{field}' of '{meta}' is absent")]
    MandatoryFieldAbsent { meta: String, field: String },

    #[error("Field '{field}' has a wrong type: {message}")]
    WrongFieldType { field: String, message: String },

    #[error("Value '{value}' of field '{field}' is not in enum choices {choices:?}")]
    EnumViolation {
        field: String,
        value: String,
        choices: Vec<String>,
    },

    #[error("Record of object '{meta}' with PK '{pk}' referenced in '{field}' does not exist")]
    ValueDoesNotExist { meta: String, pk: String, field: String },

    #[error("Field '{field}' contains records which could not be removed due to `Restrict` strategy")]
    RestrictConstraintViolation { field: String },

    #[error("Key value not found or has a wrong type")]
    KeyValueNotFound,

    #[error(transparent)]
    Rql(#[from] RqlError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("Object class '{0}' not found")]
    ObjectClassNotFound(String),

    #[error("Record of '{meta}' with PK '{pk}' not found")]
    RecordNotFound { meta: String, pk: String },

    #[error("Removal error on '{meta}': {message}")]
    Removal { meta: String, message: String },

    #[error("Duplicated value '{value}' of column '{column}'")]
    Duplicated {
        column: String,
        value: Value,
        duplicates: Vec<Value>,
    },

    #[error("DML error [{code}]: {message}")]
    Dml {
        code: DmlCode,
        message: String,
        column: Option<String>,
        value: Option<Value>,
    },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Meta error on '{meta}': {message}")]
    Meta { meta: String, message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Driver-level integrity failure class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DmlCode {
    NotNullViolation,
    ForeignKeyViolation,
    Failed,
}

impl fmt::Display for DmlCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DmlCode::NotNullViolation => write!(f, "not_null_violation"),
            DmlCode::ForeignKeyViolation => write!(f, "foreign_key_violation"),
            DmlCode::Failed => write!(f, "dml_failed"),
        }
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::MandatoryFieldAbsent { .. }
            | EngineError::WrongFieldType { .. }
            | EngineError::EnumViolation { .. }
            | EngineError::ValueDoesNotExist { .. }
            | EngineError::RestrictConstraintViolation { .. }
            | EngineError::KeyValueNotFound
            | EngineError::Rql(_)
            | EngineError::Query(_)
            | EngineError::Duplicated { .. } => ErrorKind::Validation,
            EngineError::Dml { code, .. } => match code {
                DmlCode::Failed => ErrorKind::Dml,
                _ => ErrorKind::Validation,
            },
            EngineError::ObjectClassNotFound(_) | EngineError::RecordNotFound { .. } => {
                ErrorKind::NotFound
            }
            EngineError::Removal { .. } => ErrorKind::Removal,
            EngineError::Transaction(_)
            | EngineError::Storage(_)
            | EngineError::Notification(_)
            | EngineError::Meta { .. }
            | EngineError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::MandatoryFieldAbsent { .. } => "mandatory_field_absent",
            EngineError::WrongFieldType { .. } => "wrong_field_type",
            EngineError::EnumViolation { .. } => "enum_violation",
            EngineError::ValueDoesNotExist { .. } => "value_does_not_exist",
            EngineError::RestrictConstraintViolation { .. } => "restrict_constraint_violation",
            EngineError::KeyValueNotFound => "key_value_not_found",
            EngineError::Rql(_) => "wrong_rql",
            EngineError::Query(e) => e.code,
            EngineError::ObjectClassNotFound(_) => "object_class_not_found",
            EngineError::RecordNotFound { .. } => "record_not_found",
            EngineError::Removal { .. } => "removal_error",
            EngineError::Duplicated { .. } => "duplicated_value_error",
            EngineError::Dml { code, .. } => match code {
                DmlCode::NotNullViolation | DmlCode::ForeignKeyViolation => "validation_error",
                DmlCode::Failed => "dml_failed",
            },
            EngineError::Transaction(_) => "transaction_error",
            EngineError::Storage(_) => "internal_data_error",
            EngineError::Notification(_) => "notification_error",
            EngineError::Meta { .. } => "meta_error",
            EngineError::Internal(_) => "internal_data_error",
        }
    }

    pub fn wrong_type(field: &str, message: impl Into<String>) -> Self {
        EngineError::WrongFieldType {
            field: field.to_string(),
            message: message.into(),
        }
    }

    pub fn meta(meta: &str, message: impl Into<String>) -> Self {
        EngineError::Meta {
            meta: meta.to_string(),
            message: message.into(),
        }
    }
}
