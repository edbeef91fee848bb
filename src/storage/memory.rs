//! In-process storage adapter.
//!
//! Tables live behind one shared mutex. A transaction snapshots the whole
//! database on `begin` and restores it on `rollback`, so concurrent writers
//! are not isolated from each other. NOT NULL and foreign-key constraints
//! are enforced on every write, including cascades on delete.
//!
//! The adapter counts DDL statements and can be told to fail a given
//! operation, which is what the tests use it for.

use async_trait::async_trait;
use log::{debug, info};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{ColumnInfo, StorageBackend, StorageConnection, StorageResult};
use crate::error::{StorageError, StorageErrorKind};
use crate::query::FetchPlan;
use crate::schema::{EntityDescriptor, FieldDescriptor, RelationshipDescriptor};
use crate::value::{KeyValue, Row, Value};

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageOp {
    Connect,
    Insert,
    Update,
    Delete,
    Fetch,
    Commit,
    Close,
}

#[derive(Debug, Clone)]
struct MemoryTable {
    columns: Vec<ColumnInfo>,
    /// Foreign keys declared when the table was created.
    relationships: Vec<RelationshipDescriptor>,
    key_column: String,
    identity: bool,
    rows: BTreeMap<KeyValue, Row>,
    next_id: i64,
}

impl MemoryTable {
    fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    fn key_index(&self) -> usize {
        self.column_index(&self.key_column).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default)]
struct MemoryDatabase {
    tables: BTreeMap<String, MemoryTable>,
}

#[derive(Debug, Default)]
struct MemoryState {
    db: MemoryDatabase,
    ddl_operations: usize,
    op_counts: HashMap<StorageOp, usize>,
    /// op -> number of further successful calls before one fails
    faults: HashMap<StorageOp, usize>,
    open_connections: usize,
}

/// Shared in-memory store. Clones share the same tables.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

fn lock(state: &Mutex<MemoryState>) -> StorageResult<MutexGuard<'_, MemoryState>> {
    state
        .lock()
        .map_err(|_| StorageError::internal("memory store lock poisoned"))
}

impl MemoryState {
    /// Count an operation and apply any pending fault for it.
    fn record(&mut self, op: StorageOp) -> StorageResult<()> {
        *self.op_counts.entry(op).or_default() += 1;
        if let Some(remaining) = self.faults.get_mut(&op) {
            if *remaining == 0 {
                self.faults.remove(&op);
                return Err(StorageError::internal(format!("injected {:?} failure", op)));
            }
            *remaining -= 1;
        }
        Ok(())
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let `successes` more `op` calls succeed, then fail the next one.
    pub fn fail_after(&self, op: StorageOp, successes: usize) {
        if let Ok(mut state) = self.state.lock() {
            state.faults.insert(op, successes);
        }
    }

    pub fn clear_faults(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.faults.clear();
        }
    }

    /// DDL statements executed so far (create, drop, alter).
    pub fn ddl_operations(&self) -> usize {
        self.state.lock().map(|s| s.ddl_operations).unwrap_or(0)
    }

    /// How many times `op` was attempted.
    pub fn operation_count(&self, op: StorageOp) -> usize {
        self.state
            .lock()
            .map(|s| s.op_counts.get(&op).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.db.tables.get(table).map(|t| t.rows.len()))
            .unwrap_or(0)
    }

    pub fn open_connections(&self) -> usize {
        self.state.lock().map(|s| s.open_connections).unwrap_or(0)
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn connect(&self) -> StorageResult<Box<dyn StorageConnection>> {
        let mut state = lock(&self.state)?;
        state.record(StorageOp::Connect).map_err(|mut e| {
            e.kind = StorageErrorKind::Connection;
            e
        })?;
        state.open_connections += 1;
        Ok(Box::new(MemoryConnection {
            state: self.state.clone(),
            snapshot: None,
            closed: false,
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

pub struct MemoryConnection {
    state: Arc<Mutex<MemoryState>>,
    snapshot: Option<MemoryDatabase>,
    closed: bool,
}

impl MemoryConnection {
    fn state(&self) -> StorageResult<MutexGuard<'_, MemoryState>> {
        if self.closed {
            return Err(StorageError::new(
                StorageErrorKind::Connection,
                "connection already closed",
            ));
        }
        lock(&self.state)
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Ok(mut state) = self.state.lock() {
            if let Some(snapshot) = self.snapshot.take() {
                state.db = snapshot;
            }
            state.open_connections = state.open_connections.saturating_sub(1);
        }
    }
}

fn no_table(table: &str) -> StorageError {
    StorageError::new(StorageErrorKind::Query, format!("no such table: {}", table))
}

fn row_key(table: &MemoryTable, row: &Row) -> StorageResult<KeyValue> {
    row[table.key_index()]
        .as_key()
        .ok_or_else(|| StorageError::constraint(format!("NOT NULL constraint failed: {}", table.key_column)))
}

impl MemoryDatabase {
    fn check_row(&self, name: &str, table: &MemoryTable, row: &Row) -> StorageResult<()> {
        for (column, value) in table.columns.iter().zip(row.iter()) {
            if value.is_null() && !column.nullable {
                return Err(StorageError::constraint(format!(
                    "NOT NULL constraint failed: {}.{}",
                    name, column.name
                )));
            }
        }
        for rel in &table.relationships {
            let Some(index) = table.column_index(&rel.foreign_key) else {
                continue;
            };
            let Some(fk) = row[index].as_key() else {
                continue;
            };
            let exists = self
                .tables
                .get(&rel.principal_table)
                .is_some_and(|p| p.rows.contains_key(&fk));
            if !exists {
                return Err(StorageError::constraint(format!(
                    "FOREIGN KEY constraint failed: {}.{} = {}",
                    name, rel.foreign_key, fk
                )));
            }
        }
        Ok(())
    }

    /// Delete a row and apply ON DELETE actions of every referencing table.
    fn delete_cascading(&mut self, table_name: &str, key: &KeyValue) -> usize {
        let Some(table) = self.tables.get_mut(table_name) else {
            return 0;
        };
        if table.rows.remove(key).is_none() {
            return 0;
        }
        let mut referencing: Vec<(String, RelationshipDescriptor)> = Vec::new();
        for (name, t) in &self.tables {
            for rel in &t.relationships {
                if rel.principal_table == table_name {
                    referencing.push((name.clone(), rel.clone()));
                }
            }
        }
        let mut removed = 1;
        for (dependent, rel) in referencing {
            let Some(t) = self.tables.get_mut(&dependent) else {
                continue;
            };
            let Some(index) = t.column_index(&rel.foreign_key) else {
                continue;
            };
            let matching: Vec<KeyValue> = t
                .rows
                .iter()
                .filter(|(_, row)| row[index].as_key().as_ref() == Some(key))
                .map(|(k, _)| k.clone())
                .collect();
            if rel.optional {
                for k in matching {
                    if let Some(row) = t.rows.get_mut(&k) {
                        row[index] = Value::Null;
                    }
                }
            } else {
                for k in matching {
                    removed += self.delete_cascading(&dependent, &k);
                }
            }
        }
        removed
    }
}

#[async_trait]
impl StorageConnection for MemoryConnection {
    async fn create_table(&mut self, entity: &EntityDescriptor) -> StorageResult<()> {
        let mut state = self.state()?;
        state.ddl_operations += 1;
        if state.db.tables.contains_key(&entity.table) {
            return Err(StorageError::new(
                StorageErrorKind::Schema,
                format!("table {} already exists", entity.table),
            ));
        }
        let columns = entity
            .fields
            .iter()
            .map(|f| {
                let key = f.name == entity.primary_key;
                ColumnInfo {
                    name: f.name.clone(),
                    declared_type: f.field_type.sql_type().to_string(),
                    nullable: f.nullable && !key,
                    primary_key: key,
                }
            })
            .collect();
        state.db.tables.insert(
            entity.table.clone(),
            MemoryTable {
                columns,
                relationships: entity.relationships.clone(),
                key_column: entity.primary_key.clone(),
                identity: entity.identity,
                rows: BTreeMap::new(),
                next_id: 1,
            },
        );
        info!("Created table `{}`", entity.table);
        Ok(())
    }

    async fn drop_table(&mut self, table: &str) -> StorageResult<()> {
        let mut state = self.state()?;
        state.ddl_operations += 1;
        state.db.tables.remove(table);
        info!("Dropped table `{}`", table);
        Ok(())
    }

    async fn add_column(&mut self, table: &str, field: &FieldDescriptor) -> StorageResult<()> {
        let mut state = self.state()?;
        state.ddl_operations += 1;
        if !field.nullable {
            return Err(StorageError::new(
                StorageErrorKind::Schema,
                format!("cannot add NOT NULL column `{}` to existing rows", field.name),
            ));
        }
        let t = state.db.tables.get_mut(table).ok_or_else(|| no_table(table))?;
        t.columns.push(ColumnInfo {
            name: field.name.clone(),
            declared_type: field.field_type.sql_type().to_string(),
            nullable: true,
            primary_key: false,
        });
        for row in t.rows.values_mut() {
            row.push(Value::Null);
        }
        info!("Added column `{}.{}`", table, field.name);
        Ok(())
    }

    async fn table_names(&mut self) -> StorageResult<Vec<String>> {
        Ok(self.state()?.db.tables.keys().cloned().collect())
    }

    async fn table_columns(&mut self, table: &str) -> StorageResult<Option<Vec<ColumnInfo>>> {
        Ok(self.state()?.db.tables.get(table).map(|t| t.columns.clone()))
    }

    async fn insert(&mut self, entity: &EntityDescriptor, row: &Row) -> StorageResult<Value> {
        let mut state = self.state()?;
        state.record(StorageOp::Insert)?;
        let db = &mut state.db;
        let table = db.tables.get(&entity.table).ok_or_else(|| no_table(&entity.table))?;
        if table.columns.len() != row.len() {
            return Err(StorageError::new(
                StorageErrorKind::Query,
                format!("{} has {} columns but {} values were supplied", entity.table, table.columns.len(), row.len()),
            ));
        }
        let mut row = row.clone();
        let key_index = table.key_index();
        if table.identity && row[key_index].is_null() {
            row[key_index] = Value::Integer(table.next_id);
        }
        let key = row_key(table, &row)?;
        if table.rows.contains_key(&key) {
            return Err(StorageError::constraint(format!(
                "UNIQUE constraint failed: {}.{}",
                entity.table, table.key_column
            )));
        }
        db.check_row(&entity.table, table, &row)?;

        let table = db.tables.get_mut(&entity.table).ok_or_else(|| no_table(&entity.table))?;
        if let KeyValue::Integer(id) = key {
            table.next_id = table.next_id.max(id + 1);
        }
        table.rows.insert(key.clone(), row);
        debug!("Inserted into `{}` key {}", entity.table, key);
        Ok(key.to_value())
    }

    async fn update(
        &mut self,
        entity: &EntityDescriptor,
        key: &Value,
        fields: &[(String, Value)],
    ) -> StorageResult<u64> {
        let mut state = self.state()?;
        state.record(StorageOp::Update)?;
        let db = &mut state.db;
        let table = db.tables.get(&entity.table).ok_or_else(|| no_table(&entity.table))?;
        let Some(key) = key.as_key() else {
            return Ok(0);
        };
        let Some(current) = table.rows.get(&key) else {
            return Ok(0);
        };
        let mut updated = current.clone();
        for (name, value) in fields {
            let index = table.column_index(name).ok_or_else(|| {
                StorageError::new(StorageErrorKind::Query, format!("no such column: {}", name))
            })?;
            updated[index] = value.clone();
        }
        db.check_row(&entity.table, table, &updated)?;
        if let Some(table) = db.tables.get_mut(&entity.table) {
            table.rows.insert(key.clone(), updated);
        }
        debug!("Updated `{}` key {}", entity.table, key);
        Ok(1)
    }

    async fn delete(&mut self, entity: &EntityDescriptor, key: &Value) -> StorageResult<u64> {
        let mut state = self.state()?;
        state.record(StorageOp::Delete)?;
        if !state.db.tables.contains_key(&entity.table) {
            return Err(no_table(&entity.table));
        }
        let Some(key) = key.as_key() else {
            return Ok(0);
        };
        let removed = state.db.delete_cascading(&entity.table, &key);
        debug!("Deleted from `{}` key {} ({} rows)", entity.table, key, removed);
        Ok(removed.min(1) as u64)
    }

    async fn fetch(&mut self, plan: &FetchPlan) -> StorageResult<Vec<Row>> {
        let mut state = self.state()?;
        state.record(StorageOp::Fetch)?;
        let table = state.db.tables.get(&plan.table).ok_or_else(|| no_table(&plan.table))?;
        let mut indices = Vec::with_capacity(plan.columns.len());
        for column in &plan.columns {
            let index = table.column_index(column).ok_or_else(|| {
                StorageError::new(StorageErrorKind::Query, format!("no such column: {}", column))
            })?;
            indices.push(index);
        }
        let projected = table
            .rows
            .values()
            .map(|row| indices.iter().map(|&i| row[i].clone()).collect::<Row>());
        let rows = plan.apply(projected);
        debug!("Fetched {} rows from `{}`", rows.len(), plan.table);
        Ok(rows)
    }

    async fn begin(&mut self) -> StorageResult<()> {
        let snapshot = self.state()?.db.clone();
        self.snapshot = Some(snapshot);
        Ok(())
    }

    async fn commit(&mut self) -> StorageResult<()> {
        self.state()?.record(StorageOp::Commit)?;
        self.snapshot = None;
        Ok(())
    }

    async fn rollback(&mut self) -> StorageResult<()> {
        if let Some(snapshot) = self.snapshot.take() {
            self.state()?.db = snapshot;
        }
        Ok(())
    }

    async fn close(&mut self) -> StorageResult<()> {
        if self.closed {
            return Ok(());
        }
        self.state()?.record(StorageOp::Close)?;
        self.rollback().await?;
        let mut state = lock(&self.state)?;
        state.open_connections = state.open_connections.saturating_sub(1);
        drop(state);
        self.closed = true;
        Ok(())
    }
}
