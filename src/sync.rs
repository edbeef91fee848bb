//! Schema synchronization: bring the physical store in line with the registry.
//!
//! Usage:
//! let sync = SchemaSynchronizer::new(registry.clone());
//! let report = sync.synchronize(conn.as_mut(), SyncPolicy::CreateIfAbsent).await?;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use crate::error::{OrmError, Result, SchemaDifference};
use crate::schema::{EntityDescriptor, SchemaRegistry};
use crate::storage::{ColumnInfo, StorageConnection};
use crate::value::FieldType;

/// How `synchronize` reconciles differences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// Drop and recreate every registered table. All data is lost.
    RecreateAlways,
    /// Recreate every registered table, but only when the schema differs.
    RecreateIfChanged,
    /// Create missing tables; leave existing ones alone.
    #[default]
    CreateIfAbsent,
    /// Create missing tables and add missing nullable columns.
    AddMissingColumns,
    /// Never mutate; fail with `SchemaMismatch` on any difference.
    FailIfMismatch,
}

/// What a synchronization run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub policy: SyncPolicy,
    pub created: Vec<String>,
    pub dropped: Vec<String>,
    /// Added columns, as `table.column`.
    pub altered: Vec<String>,
    pub ddl_operations: usize,
    pub fingerprint: String,
}

impl SyncReport {
    fn new(policy: SyncPolicy, fingerprint: String) -> Self {
        SyncReport {
            policy,
            created: Vec::new(),
            dropped: Vec::new(),
            altered: Vec::new(),
            ddl_operations: 0,
            fingerprint,
        }
    }
}

pub struct SchemaSynchronizer {
    registry: Arc<SchemaRegistry>,
}

/// Differences between one entity and the columns found for its table.
pub fn compare(entity: &EntityDescriptor, columns: Option<&[ColumnInfo]>) -> Vec<SchemaDifference> {
    let table = &entity.table;
    let Some(columns) = columns else {
        return vec![SchemaDifference::MissingTable {
            table: table.clone(),
        }];
    };
    let mut differences = Vec::new();
    for field in &entity.fields {
        let is_key = field.name == entity.primary_key;
        let Some(column) = columns.iter().find(|c| c.name.eq_ignore_ascii_case(&field.name)) else {
            differences.push(SchemaDifference::MissingColumn {
                table: table.clone(),
                column: field.name.clone(),
                nullable: field.nullable && !is_key,
            });
            continue;
        };
        if FieldType::from_sql_type(&column.declared_type) != Some(field.field_type) {
            differences.push(SchemaDifference::ColumnTypeMismatch {
                table: table.clone(),
                column: field.name.clone(),
                expected: field.field_type,
                found: column.declared_type.clone(),
            });
        }
        if column.primary_key != is_key {
            differences.push(SchemaDifference::KeyMismatch {
                table: table.clone(),
                column: field.name.clone(),
            });
        } else if column.nullable != (field.nullable && !is_key) {
            differences.push(SchemaDifference::NullabilityMismatch {
                table: table.clone(),
                column: field.name.clone(),
                expected_nullable: field.nullable && !is_key,
            });
        }
    }
    for column in columns {
        if !entity.fields.iter().any(|f| f.name.eq_ignore_ascii_case(&column.name)) {
            differences.push(SchemaDifference::UnexpectedColumn {
                table: table.clone(),
                column: column.name.clone(),
            });
        }
    }
    differences
}

impl SchemaSynchronizer {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        SchemaSynchronizer { registry }
    }

    /// Entities in creation order: principals first.
    fn creation_order(&self) -> Result<Vec<Arc<EntityDescriptor>>> {
        let names: BTreeSet<String> = self.registry.entities().map(|e| e.name.clone()).collect();
        self.registry
            .dependency_order(&names)?
            .iter()
            .map(|name| self.registry.describe(name))
            .collect()
    }

    /// Every difference between the registry and the store. Read-only.
    pub async fn diff(&self, conn: &mut dyn StorageConnection) -> Result<Vec<SchemaDifference>> {
        let mut differences = Vec::new();
        for entity in self.creation_order()? {
            let columns = conn.table_columns(&entity.table).await?;
            differences.extend(compare(&entity, columns.as_deref()));
        }
        debug!("Schema diff found {} differences", differences.len());
        Ok(differences)
    }

    /// Apply `policy`. Any DDL runs inside one transaction.
    pub async fn synchronize(
        &self,
        conn: &mut dyn StorageConnection,
        policy: SyncPolicy,
    ) -> Result<SyncReport> {
        info!("Starting schema synchronization ({:?})...", policy);
        let order = self.creation_order()?;
        let mut report = SyncReport::new(policy, self.registry.fingerprint());

        let recreate = match policy {
            SyncPolicy::RecreateAlways => true,
            SyncPolicy::RecreateIfChanged => !self.diff(conn).await?.is_empty(),
            SyncPolicy::FailIfMismatch => {
                let differences = self.diff(conn).await?;
                if !differences.is_empty() {
                    return Err(mismatch(differences));
                }
                false
            }
            SyncPolicy::AddMissingColumns => {
                let differences = self.diff(conn).await?;
                let blocking: Vec<SchemaDifference> = differences
                    .iter()
                    .filter(|d| {
                        !matches!(
                            d,
                            SchemaDifference::MissingTable { .. }
                                | SchemaDifference::MissingColumn { nullable: true, .. }
                        )
                    })
                    .cloned()
                    .collect();
                if !blocking.is_empty() {
                    return Err(mismatch(blocking));
                }
                if differences.is_empty() {
                    info!("No schema changes detected.");
                    return Ok(report);
                }
                false
            }
            SyncPolicy::CreateIfAbsent => false,
        };

        let existing: HashSet<String> = conn.table_names().await?.into_iter().collect();
        let missing = order.iter().any(|e| !existing.contains(&e.table));
        let needs_ddl = recreate || missing || policy == SyncPolicy::AddMissingColumns;
        if !needs_ddl {
            info!("No schema changes detected.");
            return Ok(report);
        }

        conn.begin().await?;
        let outcome = match self
            .apply(conn, &order, &existing, recreate, policy, &mut report)
            .await
        {
            Ok(()) => conn.commit().await.map_err(OrmError::from),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(()) => {
                info!(
                    "Schema synchronization completed: {} created, {} dropped, {} columns added.",
                    report.created.len(),
                    report.dropped.len(),
                    report.altered.len()
                );
                Ok(report)
            }
            Err(e) => {
                error!("Schema synchronization failed: {}", e);
                let rolled_back = conn.rollback().await;
                if let Err(rollback) = rolled_back {
                    warn!("Rollback after failed synchronization also failed: {}", rollback);
                }
                Err(e)
            }
        }
    }

    async fn apply(
        &self,
        conn: &mut dyn StorageConnection,
        order: &[Arc<EntityDescriptor>],
        existing: &HashSet<String>,
        recreate: bool,
        policy: SyncPolicy,
        report: &mut SyncReport,
    ) -> Result<()> {
        let mut present = existing.clone();
        if recreate {
            warn!("Recreating {} tables; existing rows are discarded", order.len());
            for entity in order.iter().rev() {
                if present.remove(&entity.table) {
                    conn.drop_table(&entity.table).await?;
                    report.dropped.push(entity.table.clone());
                    report.ddl_operations += 1;
                }
            }
        }
        for entity in order {
            if !present.contains(&entity.table) {
                conn.create_table(entity).await?;
                report.created.push(entity.table.clone());
                report.ddl_operations += 1;
                continue;
            }
            if policy != SyncPolicy::AddMissingColumns {
                continue;
            }
            let columns = conn.table_columns(&entity.table).await?;
            for difference in compare(entity, columns.as_deref()) {
                if let SchemaDifference::MissingColumn { column, .. } = difference {
                    let Some(field) = entity.field(&column) else {
                        continue;
                    };
                    conn.add_column(&entity.table, field).await?;
                    info!("  - {}.{} {}", entity.table, column, field.field_type.sql_type());
                    report.altered.push(format!("{}.{}", entity.table, column));
                    report.ddl_operations += 1;
                }
            }
        }
        Ok(())
    }
}

fn mismatch(differences: Vec<SchemaDifference>) -> OrmError {
    for difference in &differences {
        warn!("Schema mismatch: {}", difference);
    }
    OrmError::SchemaMismatch(differences)
}
