//! Error types shared by every layer of the crate.
//!
//! Registry and tracker errors are programmer errors and surface immediately.
//! `ConnectionError`, `CommitFailed` and `Storage` carry the underlying
//! storage cause; nothing here is retried internally.

use std::fmt;
use thiserror::Error;

use crate::value::FieldType;

pub type Result<T> = std::result::Result<T, OrmError>;

/// Coarse classification of a storage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// The store could not be reached or the connection was lost.
    Connection,
    /// A NOT NULL, UNIQUE or FOREIGN KEY constraint rejected the write.
    Constraint,
    /// The statement itself failed.
    Query,
    /// DDL or introspection failed.
    Schema,
    /// Adapter-internal failure (poisoned lock, injected fault, ...).
    Internal,
}

/// A failure reported by a storage adapter, with the underlying cause attached.
#[derive(Debug, Error)]
#[error("{kind:?} storage error: {message}")]
pub struct StorageError {
    pub kind: StorageErrorKind,
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl StorageError {
    pub fn new(kind: StorageErrorKind, message: impl Into<String>) -> Self {
        StorageError {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn constraint(message: impl Into<String>) -> Self {
        Self::new(StorageErrorKind::Constraint, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StorageErrorKind::Internal, message)
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        let kind = match &err {
            sqlx::Error::Database(db) => match db.kind() {
                sqlx::error::ErrorKind::Other => StorageErrorKind::Query,
                _ => StorageErrorKind::Constraint,
            },
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Configuration(_) => StorageErrorKind::Connection,
            _ => StorageErrorKind::Query,
        };
        StorageError {
            kind,
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

/// One way in which the physical schema differs from the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaDifference {
    MissingTable {
        table: String,
    },
    MissingColumn {
        table: String,
        column: String,
        nullable: bool,
    },
    UnexpectedColumn {
        table: String,
        column: String,
    },
    ColumnTypeMismatch {
        table: String,
        column: String,
        expected: FieldType,
        found: String,
    },
    NullabilityMismatch {
        table: String,
        column: String,
        expected_nullable: bool,
    },
    KeyMismatch {
        table: String,
        column: String,
    },
}

impl SchemaDifference {
    pub fn table(&self) -> &str {
        match self {
            SchemaDifference::MissingTable { table }
            | SchemaDifference::MissingColumn { table, .. }
            | SchemaDifference::UnexpectedColumn { table, .. }
            | SchemaDifference::ColumnTypeMismatch { table, .. }
            | SchemaDifference::NullabilityMismatch { table, .. }
            | SchemaDifference::KeyMismatch { table, .. } => table,
        }
    }
}

impl fmt::Display for SchemaDifference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaDifference::MissingTable { table } => write!(f, "table `{}` is missing", table),
            SchemaDifference::MissingColumn { table, column, .. } => {
                write!(f, "column `{}.{}` is missing", table, column)
            }
            SchemaDifference::UnexpectedColumn { table, column } => {
                write!(f, "column `{}.{}` is not declared", table, column)
            }
            SchemaDifference::ColumnTypeMismatch {
                table,
                column,
                expected,
                found,
            } => write!(
                f,
                "column `{}.{}` has type `{}`, expected `{}`",
                table,
                column,
                found,
                expected.sql_type()
            ),
            SchemaDifference::NullabilityMismatch {
                table,
                column,
                expected_nullable,
            } => write!(
                f,
                "column `{}.{}` should be {}",
                table,
                column,
                if *expected_nullable { "NULL" } else { "NOT NULL" }
            ),
            SchemaDifference::KeyMismatch { table, column } => {
                write!(f, "primary key of `{}` differs at `{}`", table, column)
            }
        }
    }
}

fn join_differences(diffs: &[SchemaDifference]) -> String {
    diffs
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum OrmError {
    #[error("entity `{0}` is already registered")]
    DuplicateEntity(String),

    #[error("unknown entity `{0}`")]
    UnknownEntity(String),

    #[error("invalid definition for entity `{entity}`: {reason}")]
    InvalidDescriptor { entity: String, reason: String },

    #[error("entity `{entity}` with key {key} is already tracked")]
    AlreadyTracked { entity: String, key: String },

    #[error("entity handle is not tracked by this session")]
    NotTracked,

    #[error("operation not allowed on `{entity}` while it is {state}")]
    InvalidState { entity: String, state: String },

    #[error("cyclic required dependency between entities: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),

    #[error("unsupported query: {0}")]
    UnsupportedQuery(String),

    #[error("entity `{entity}` has no navigation `{navigation}`")]
    UnknownNavigation { entity: String, navigation: String },

    #[error("invalid value for `{entity}.{field}`: {reason}")]
    InvalidValue {
        entity: String,
        field: String,
        reason: String,
    },

    #[error("could not open a storage connection: {0}")]
    ConnectionError(#[source] StorageError),

    #[error("commit failed and was rolled back: {0}")]
    CommitFailed(#[source] StorageError),

    #[error("session is closed")]
    DetachedAccess,

    #[error("physical schema does not match the registry: {}", join_differences(.0))]
    SchemaMismatch(Vec<SchemaDifference>),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("entity serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}
