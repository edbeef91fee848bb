//! sqlite adapter on top of an sqlx pool.
//!
//! Usage:
//! let backend = SqliteBackend::open("sqlite://college.db", 4).await?;
//! let mut conn = backend.connect().await?;
//! conn.create_table(&descriptor).await?;

use async_trait::async_trait;
use futures::TryStreamExt;
use log::{debug, error, info};
use sqlx::pool::PoolConnection;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row as _, Sqlite, SqlitePool};
use std::str::FromStr;

use super::{ColumnInfo, StorageBackend, StorageConnection, StorageResult};
use crate::error::{StorageError, StorageErrorKind};
use crate::query::{FetchPlan, Filter};
use crate::schema::{EntityDescriptor, FieldDescriptor};
use crate::value::{FieldType, Row, Value};

/// An async sqlite pool wrapper.
#[derive(Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Connect (or create) a sqlite database at the given URI.
    /// Foreign keys are enforced on every pooled connection.
    pub async fn open(uri: &str, max_connections: u32) -> StorageResult<Self> {
        info!("Connecting to SQLite database at URI: {}", uri);
        let options = SqliteConnectOptions::from_str(uri)
            .map_err(connection_error)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(connection_error)?;
        info!("Connected to SQLite database: {}", uri);
        Ok(SqliteBackend { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        SqliteBackend { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn connection_error(err: sqlx::Error) -> StorageError {
    let mut err = StorageError::from(err);
    err.kind = StorageErrorKind::Connection;
    err
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    async fn connect(&self) -> StorageResult<Box<dyn StorageConnection>> {
        let conn = self.pool.acquire().await.map_err(connection_error)?;
        debug!("Acquired pooled SQLite connection");
        Ok(Box::new(PooledSqlite {
            conn: Some(conn),
            in_transaction: false,
        }))
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

/// One pooled connection, returned to the pool on drop. A connection that is
/// dropped inside a transaction is closed instead.
pub struct PooledSqlite {
    conn: Option<PoolConnection<Sqlite>>,
    in_transaction: bool,
}

impl Drop for PooledSqlite {
    fn drop(&mut self) {
        if self.in_transaction {
            if let Some(conn) = self.conn.as_mut() {
                conn.close_on_drop();
            }
        }
    }
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<i64>),
        Value::Integer(i) => query.bind(*i),
        Value::Real(r) => query.bind(*r),
        Value::Text(s) => query.bind(s.clone()),
        Value::Boolean(b) => query.bind(*b),
    }
}

fn column_sql(field: &FieldDescriptor, entity: &EntityDescriptor) -> String {
    if field.name == entity.primary_key {
        if entity.identity {
            return format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", quote(&field.name));
        }
        return format!("{} {} PRIMARY KEY NOT NULL", quote(&field.name), field.field_type.sql_type());
    }
    let mut sql = format!("{} {}", quote(&field.name), field.field_type.sql_type());
    if !field.nullable {
        sql.push_str(" NOT NULL");
    }
    sql
}

/// DDL for an entity's table, including foreign keys.
pub fn create_table_sql(entity: &EntityDescriptor) -> String {
    let mut parts: Vec<String> = entity.fields.iter().map(|f| column_sql(f, entity)).collect();
    for rel in &entity.relationships {
        let on_delete = if rel.optional { "SET NULL" } else { "CASCADE" };
        parts.push(format!(
            "FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE {}",
            quote(&rel.foreign_key),
            quote(&rel.principal_table),
            quote(&rel.principal_key),
            on_delete
        ));
    }
    format!("CREATE TABLE {} (\n    {}\n)", quote(&entity.table), parts.join(",\n    "))
}

fn filter_sql(filter: &Filter, sql: &mut String, params: &mut Vec<Value>) {
    match filter {
        Filter::Compare {
            column, op, value, ..
        } => {
            sql.push_str(&format!("{} {} ?", quote(column), op.sql()));
            params.push(value.clone());
        }
        Filter::IsNull { column, .. } => sql.push_str(&format!("{} IS NULL", quote(column))),
        Filter::IsNotNull { column, .. } => sql.push_str(&format!("{} IS NOT NULL", quote(column))),
        // instr keeps matching case-sensitive, unlike LIKE
        Filter::Contains { column, text, .. } => {
            sql.push_str(&format!("instr({}, ?) > 0", quote(column)));
            params.push(Value::Text(text.clone()));
        }
        Filter::StartsWith { column, text, .. } => {
            sql.push_str(&format!("instr({}, ?) = 1", quote(column)));
            params.push(Value::Text(text.clone()));
        }
        Filter::And(parts) | Filter::Or(parts) => {
            if parts.is_empty() {
                sql.push_str("1 = 1");
                return;
            }
            let joiner = if matches!(filter, Filter::And(_)) { " AND " } else { " OR " };
            sql.push('(');
            for (i, part) in parts.iter().enumerate() {
                if i > 0 {
                    sql.push_str(joiner);
                }
                filter_sql(part, sql, params);
            }
            sql.push(')');
        }
        Filter::Not(inner) => {
            sql.push_str("NOT (");
            filter_sql(inner, sql, params);
            sql.push(')');
        }
    }
}

/// Render a fetch plan as a parameterised SELECT.
pub fn select_sql(plan: &FetchPlan) -> (String, Vec<Value>) {
    let columns: Vec<String> = plan.columns.iter().map(|c| quote(c)).collect();
    let mut sql = format!("SELECT {} FROM {}", columns.join(", "), quote(&plan.table));
    let mut params = Vec::new();
    if let Some(filter) = &plan.filter {
        sql.push_str(" WHERE ");
        filter_sql(filter, &mut sql, &mut params);
    }
    if !plan.order.is_empty() {
        let order: Vec<String> = plan
            .order
            .iter()
            .map(|k| format!("{} {}", quote(&k.column), if k.ascending { "ASC" } else { "DESC" }))
            .collect();
        sql.push_str(&format!(" ORDER BY {}", order.join(", ")));
    }
    if plan.limit.is_some() || plan.offset > 0 {
        // sqlite requires LIMIT before OFFSET; -1 means unbounded
        let limit = plan.limit.map(|l| l as i64).unwrap_or(-1);
        sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, plan.offset));
    }
    (sql, params)
}

fn decode(row: &SqliteRow, index: usize, ty: FieldType) -> StorageResult<Value> {
    let value = match ty {
        FieldType::Integer => row.try_get::<Option<i64>, _>(index)?.map(Value::Integer),
        FieldType::Real => row.try_get::<Option<f64>, _>(index)?.map(Value::Real),
        FieldType::Text => row.try_get::<Option<String>, _>(index)?.map(Value::Text),
        FieldType::Boolean => row.try_get::<Option<bool>, _>(index)?.map(Value::Boolean),
    };
    Ok(value.unwrap_or(Value::Null))
}

impl PooledSqlite {
    fn conn(&mut self) -> StorageResult<&mut PoolConnection<Sqlite>> {
        self.conn.as_mut().ok_or_else(|| {
            StorageError::new(StorageErrorKind::Connection, "connection already closed")
        })
    }

    /// Execute a statement with bound parameters; returns (rows affected, last rowid).
    async fn execute(&mut self, sql: &str, params: &[Value]) -> StorageResult<(u64, i64)> {
        debug!("Executing SQL: {}", sql);
        let conn = self.conn()?;
        let mut query = sqlx::query(sql);
        for value in params {
            query = bind_value(query, value);
        }
        match query.execute(&mut **conn).await {
            Ok(done) => Ok((done.rows_affected(), done.last_insert_rowid())),
            Err(e) => {
                error!("SQL execution failed: {}", e);
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl StorageConnection for PooledSqlite {
    async fn create_table(&mut self, entity: &EntityDescriptor) -> StorageResult<()> {
        let sql = create_table_sql(entity);
        self.execute(&sql, &[]).await.map_err(schema_error)?;
        info!("Created table `{}`", entity.table);
        Ok(())
    }

    async fn drop_table(&mut self, table: &str) -> StorageResult<()> {
        let sql = format!("DROP TABLE IF EXISTS {}", quote(table));
        self.execute(&sql, &[]).await.map_err(schema_error)?;
        info!("Dropped table `{}`", table);
        Ok(())
    }

    async fn add_column(&mut self, table: &str, field: &FieldDescriptor) -> StorageResult<()> {
        if !field.nullable {
            return Err(StorageError::new(
                StorageErrorKind::Schema,
                format!("cannot add NOT NULL column `{}` to existing rows", field.name),
            ));
        }
        let sql = format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            quote(table),
            quote(&field.name),
            field.field_type.sql_type()
        );
        self.execute(&sql, &[]).await.map_err(schema_error)?;
        info!("Added column `{}.{}`", table, field.name);
        Ok(())
    }

    async fn table_names(&mut self) -> StorageResult<Vec<String>> {
        let sql = "SELECT name FROM sqlite_master \
                   WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name";
        debug!("Fetching rows with SQL: {}", sql);
        let conn = self.conn()?;
        let rows: Vec<(String,)> = sqlx::query_as(sql).fetch_all(&mut **conn).await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    async fn table_columns(&mut self, table: &str) -> StorageResult<Option<Vec<ColumnInfo>>> {
        let sql = format!("PRAGMA table_info({})", quote(table));
        debug!("Fetching rows with SQL: {}", sql);
        let conn = self.conn()?;
        let rows = sqlx::query(&sql).fetch_all(&mut **conn).await?;
        if rows.is_empty() {
            return Ok(None);
        }
        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let not_null: i64 = row.try_get("notnull")?;
            let pk: i64 = row.try_get("pk")?;
            columns.push(ColumnInfo {
                name: row.try_get("name")?,
                declared_type: row.try_get("type")?,
                nullable: not_null == 0 && pk == 0,
                primary_key: pk > 0,
            });
        }
        Ok(Some(columns))
    }

    async fn insert(&mut self, entity: &EntityDescriptor, row: &Row) -> StorageResult<Value> {
        let key_index = entity.key_index();
        let generate = entity.identity && row[key_index].is_null();
        let mut columns = Vec::with_capacity(row.len());
        let mut params = Vec::with_capacity(row.len());
        for (i, (field, value)) in entity.fields.iter().zip(row.iter()).enumerate() {
            if generate && i == key_index {
                continue;
            }
            columns.push(quote(&field.name));
            params.push(value.clone());
        }
        let placeholders = vec!["?"; params.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote(&entity.table),
            columns.join(", "),
            placeholders
        );
        let (_, rowid) = self.execute(&sql, &params).await?;
        if generate {
            Ok(Value::Integer(rowid))
        } else {
            Ok(row[key_index].clone())
        }
    }

    async fn update(
        &mut self,
        entity: &EntityDescriptor,
        key: &Value,
        fields: &[(String, Value)],
    ) -> StorageResult<u64> {
        if fields.is_empty() {
            return Ok(0);
        }
        let assignments: Vec<String> = fields
            .iter()
            .map(|(name, _)| format!("{} = ?", quote(name)))
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?",
            quote(&entity.table),
            assignments.join(", "),
            quote(&entity.primary_key)
        );
        let mut params: Vec<Value> = fields.iter().map(|(_, v)| v.clone()).collect();
        params.push(key.clone());
        let (affected, _) = self.execute(&sql, &params).await?;
        Ok(affected)
    }

    async fn delete(&mut self, entity: &EntityDescriptor, key: &Value) -> StorageResult<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?",
            quote(&entity.table),
            quote(&entity.primary_key)
        );
        let (affected, _) = self.execute(&sql, std::slice::from_ref(key)).await?;
        Ok(affected)
    }

    async fn fetch(&mut self, plan: &FetchPlan) -> StorageResult<Vec<Row>> {
        let (sql, params) = select_sql(plan);
        debug!("Fetching rows with SQL: {}", sql);
        let conn = self.conn()?;
        let mut query = sqlx::query(&sql);
        for value in &params {
            query = bind_value(query, value);
        }
        let mut rows = Vec::new();
        let mut stream = query.fetch(&mut **conn);
        while let Some(row) = stream.try_next().await? {
            let mut decoded = Vec::with_capacity(plan.column_types.len());
            for (index, ty) in plan.column_types.iter().enumerate() {
                decoded.push(decode(&row, index, *ty)?);
            }
            rows.push(decoded);
        }
        debug!("Fetched {} rows successfully", rows.len());
        Ok(rows)
    }

    async fn begin(&mut self) -> StorageResult<()> {
        self.execute("BEGIN IMMEDIATE", &[]).await?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> StorageResult<()> {
        self.execute("COMMIT", &[]).await?;
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> StorageResult<()> {
        // on failure the flag stays set so Drop discards the connection
        self.execute("ROLLBACK", &[]).await?;
        self.in_transaction = false;
        Ok(())
    }

    async fn close(&mut self) -> StorageResult<()> {
        if self.in_transaction {
            self.rollback().await?;
        }
        if self.conn.take().is_some() {
            debug!("Released pooled SQLite connection");
        }
        Ok(())
    }
}

fn schema_error(mut err: StorageError) -> StorageError {
    if err.kind == StorageErrorKind::Query {
        err.kind = StorageErrorKind::Schema;
    }
    err
}
