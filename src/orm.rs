//! Database handle: a storage backend paired with a sealed schema registry.
//!
//! Usage:
//! let registry = SchemaRegistry::global()?;
//! let db = Database::initialize(&settings.database, registry).await?;
//! let mut session = db.open_session().await?;
use log::{error, info, warn};
use std::sync::Arc;

use crate::error::{OrmError, Result, SchemaDifference};
use crate::schema::SchemaRegistry;
use crate::session::Session;
use crate::settings::DatabaseSettings;
use crate::storage::{SqliteBackend, StorageBackend, StorageConnection};
use crate::sync::{SchemaSynchronizer, SyncPolicy, SyncReport};

/// Cloneable entry point; every session opened from it shares the backend.
#[derive(Clone)]
pub struct Database {
    backend: Arc<dyn StorageBackend>,
    registry: Arc<SchemaRegistry>,
}

impl Database {
    /// Open the sqlite backend described by `settings`.
    pub async fn connect(settings: &DatabaseSettings, registry: Arc<SchemaRegistry>) -> Result<Self> {
        let backend = SqliteBackend::open(&settings.url, settings.max_connections)
            .await
            .map_err(|e| {
                error!("Database connection failed: {}", e);
                OrmError::ConnectionError(e)
            })?;
        Ok(Database::with_backend(Arc::new(backend), registry))
    }

    pub fn with_backend(backend: Arc<dyn StorageBackend>, registry: Arc<SchemaRegistry>) -> Self {
        Database { backend, registry }
    }

    /// Connect, then synchronize the schema with the configured policy.
    pub async fn initialize(settings: &DatabaseSettings, registry: Arc<SchemaRegistry>) -> Result<Self> {
        let db = Database::connect(settings, registry).await?;
        db.synchronize(settings.sync_policy).await?;
        Ok(db)
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub async fn open_session(&self) -> Result<Session> {
        Session::open(self.backend.as_ref(), self.registry.clone()).await
    }

    /// Run the synchronizer on a dedicated connection.
    pub async fn synchronize(&self, policy: SyncPolicy) -> Result<SyncReport> {
        let mut conn = self.backend.connect().await.map_err(OrmError::ConnectionError)?;
        let result = SchemaSynchronizer::new(self.registry.clone())
            .synchronize(conn.as_mut(), policy)
            .await;
        close_quietly(conn).await;
        let report = result?;
        info!(
            "Schema {} synchronized with {} DDL operations",
            report.fingerprint, report.ddl_operations
        );
        Ok(report)
    }

    /// Differences between the registry and the store, without changing either.
    pub async fn schema_diff(&self) -> Result<Vec<SchemaDifference>> {
        let mut conn = self.backend.connect().await.map_err(OrmError::ConnectionError)?;
        let result = SchemaSynchronizer::new(self.registry.clone())
            .diff(conn.as_mut())
            .await;
        close_quietly(conn).await;
        result
    }
}

/// Close a dedicated connection. A failure is logged, not returned.
async fn close_quietly(mut conn: Box<dyn StorageConnection>) {
    if let Err(e) = conn.close().await {
        warn!("Failed to close schema connection: {}", e);
    }
}
