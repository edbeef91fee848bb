//! The storage adapter boundary.
//!
//! The core only ever emits the abstract operations below. Each adapter maps
//! them onto a concrete store and reports failures as [`StorageError`].

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::query::FetchPlan;
use crate::schema::{EntityDescriptor, FieldDescriptor};
use crate::value::{Row, Value};

pub use memory::{MemoryBackend, StorageOp};
pub use sqlite::SqliteBackend;

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// A column as it exists in the physical store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    /// Declared type, as reported by the store.
    pub declared_type: String,
    pub nullable: bool,
    pub primary_key: bool,
}

/// Hands out connections. Shared by every session of a database.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn connect(&self) -> StorageResult<Box<dyn StorageConnection>>;

    /// Short adapter name for logs.
    fn name(&self) -> &'static str;
}

/// One exclusively-owned connection. Never shared between sessions.
#[async_trait]
pub trait StorageConnection: Send {
    async fn create_table(&mut self, entity: &EntityDescriptor) -> StorageResult<()>;

    async fn drop_table(&mut self, table: &str) -> StorageResult<()>;

    async fn add_column(&mut self, table: &str, field: &FieldDescriptor) -> StorageResult<()>;

    async fn table_names(&mut self) -> StorageResult<Vec<String>>;

    /// `None` when the table does not exist.
    async fn table_columns(&mut self, table: &str) -> StorageResult<Option<Vec<ColumnInfo>>>;

    /// Insert a full row. An identity key left `Null` is generated by the
    /// store; the stored key is returned either way.
    async fn insert(&mut self, entity: &EntityDescriptor, row: &Row) -> StorageResult<Value>;

    /// Write `fields` (name, value) of the row identified by `key`.
    async fn update(
        &mut self,
        entity: &EntityDescriptor,
        key: &Value,
        fields: &[(String, Value)],
    ) -> StorageResult<u64>;

    async fn delete(&mut self, entity: &EntityDescriptor, key: &Value) -> StorageResult<u64>;

    async fn fetch(&mut self, plan: &FetchPlan) -> StorageResult<Vec<Row>>;

    async fn begin(&mut self) -> StorageResult<()>;

    async fn commit(&mut self) -> StorageResult<()>;

    async fn rollback(&mut self) -> StorageResult<()>;

    /// Release the connection. Called at most once.
    async fn close(&mut self) -> StorageResult<()>;
}
