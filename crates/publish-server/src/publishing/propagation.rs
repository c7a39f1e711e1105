//! Identifier propagation
//!
//! Right after a bulk load, foreign-key columns hold the referenced rows'
//! harvest ids. Propagation joins each column against the target table's
//! `harv_db_id` and replaces it with the target's production `id`.
//!
//! Updates run in windows of production ids so no single statement locks a
//! whole table; each window commits on its own. Every statement is filtered by
//! resource on both sides of the join.
//!
//! Only rows from the load being propagated are rewritten. Older rows already
//! hold production ids, and mapping them again would point them at whichever
//! row happens to have that number as its harvest id.

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::import_log::ImportLog;
use super::relationships::{EntityType, RelationshipGraph, REFERENCE_PARENT_TYPES};
use crate::error::PublishError;

/// Inclusive `(low, high)` id windows covering `min..=max`.
pub fn id_windows(min: i64, max: i64, size: i64) -> Vec<(i64, i64)> {
    let size = size.max(1);
    let mut windows = Vec::new();
    let mut low = min;
    while low <= max {
        let high = low.saturating_add(size - 1).min(max);
        windows.push((low, high));
        if high == i64::MAX {
            break;
        }
        low = high + 1;
    }
    windows
}

/// `UPDATE` rewriting `table.field` from harvest ids to `target`'s production
/// ids for one resource (`$1`) and one id window (`$2..=$3`).
///
/// `type_filter` is `(column, class name)` for polymorphic columns whose rows
/// say which table they point at.
pub fn propagation_sql(table: &str, field: &str, target: &str, type_filter: Option<(&str, &str)>) -> String {
    let mut sql = format!(
        r#"UPDATE "{table}" AS t SET "{field}" = o.id FROM "{target}" AS o WHERE t.resource_id = $1 AND o.resource_id = $1 AND t."{field}" = o.harv_db_id AND t.id BETWEEN $2 AND $3"#
    );
    if let Some((column, class_name)) = type_filter {
        sql.push_str(&format!(r#" AND t."{}" = '{}'"#, column, class_name));
    }
    sql
}

/// Chained referent update for references of one parent type. Rows whose
/// `referent_id` already names one of the resource's referents were resolved
/// when references were loaded and are left alone.
fn referent_sql(parent_type: &str) -> String {
    format!(
        r#"UPDATE "references" AS t SET "referent_id" = o.id FROM "referents" AS o WHERE t.resource_id = $1 AND o.resource_id = $1 AND t.parent_type = '{parent_type}' AND t."referent_id" = o.harv_db_id AND t.id BETWEEN $2 AND $3 AND NOT EXISTS (SELECT 1 FROM "referents" AS r WHERE r.resource_id = $1 AND r.id = t."referent_id")"#
    )
}

#[derive(Debug, Clone)]
pub struct PropagationEngine {
    pool: PgPool,
    log: ImportLog,
    graph: RelationshipGraph,
    window: i64,
    cancel: CancellationToken,
}

impl PropagationEngine {
    pub fn new(pool: PgPool, log: ImportLog, graph: RelationshipGraph, window: i64, cancel: CancellationToken) -> Self {
        Self {
            pool,
            log,
            graph,
            window,
            cancel,
        }
    }

    /// Rewrite every declared foreign key of the `entity` rows with ids above
    /// `after_id` (the table's highest id before they were loaded).
    /// Returns the number of rows updated.
    pub async fn propagate(&self, resource_id: i64, entity: EntityType, after_id: i64) -> Result<u64> {
        let keys = self.graph.foreign_keys(entity);
        if keys.is_empty() {
            return Ok(0);
        }

        self.log
            .start(&format!("Propagating ids for {}", entity.table_name()))
            .await?;

        let table = entity.table_name();
        let Some((min, max)) = self.id_range(table, resource_id, None, after_id).await? else {
            return Ok(0);
        };
        let windows = id_windows(min, max, self.window);

        let mut updated = 0;
        for key in keys {
            for candidate in key.target.candidates() {
                let type_filter = key
                    .target
                    .type_column()
                    .map(|column| (column, candidate.class_name()));
                let sql = propagation_sql(table, key.field, candidate.table_name(), type_filter);

                for (number, (low, high)) in windows.iter().enumerate() {
                    self.check_cancelled(table)?;
                    let rows = self.execute_window(&sql, resource_id, *low, *high).await?;
                    updated += rows;

                    if windows.len() > 1 {
                        self.log
                            .append_or_merge_update(&format!(
                                "{}.{} -> {}: window {}/{}",
                                table,
                                key.field,
                                candidate.table_name(),
                                number + 1,
                                windows.len()
                            ))
                            .await?;
                    }
                }

                debug!(
                    resource_id,
                    table,
                    field = key.field,
                    target = candidate.table_name(),
                    "Propagated foreign key"
                );
            }
        }

        Ok(updated)
    }

    /// Resolve the polymorphic `references.parent_id` for each parent type,
    /// then the referent pointer of the same rows, window by window.
    pub async fn propagate_reference_ids(&self, resource_id: i64) -> Result<u64> {
        let mut updated = 0;
        let mut started = false;

        for parent in REFERENCE_PARENT_TYPES {
            if self.graph.decl(parent).is_none() {
                continue;
            }
            let filter = ("parent_type", parent.class_name());
            let Some((min, max)) = self.id_range("references", resource_id, Some(filter), 0).await? else {
                continue;
            };

            if !started {
                self.log.start("Propagating reference ids").await?;
                started = true;
            }

            let parent_sql = propagation_sql("references", "parent_id", parent.table_name(), Some(filter));
            let referent_sql = referent_sql(parent.class_name());

            for (low, high) in id_windows(min, max, self.window) {
                self.check_cancelled("references")?;
                updated += self.execute_window(&parent_sql, resource_id, low, high).await?;
                updated += self.execute_window(&referent_sql, resource_id, low, high).await?;
            }

            debug!(resource_id, parent_type = parent.class_name(), "Propagated reference parents");
        }

        Ok(updated)
    }

    async fn id_range(
        &self,
        table: &str,
        resource_id: i64,
        type_filter: Option<(&str, &str)>,
        after_id: i64,
    ) -> Result<Option<(i64, i64)>> {
        let mut sql = format!(
            r#"SELECT MIN(id), MAX(id) FROM "{}" WHERE resource_id = $1 AND id > $2"#,
            table
        );
        if let Some((column, class_name)) = type_filter {
            sql.push_str(&format!(r#" AND "{}" = '{}'"#, column, class_name));
        }

        let (min, max): (Option<i64>, Option<i64>) = sqlx::query_as(sqlx::AssertSqlSafe(sql.as_str()))
            .bind(resource_id)
            .bind(after_id)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("Failed to read id range of {}", table))?;

        Ok(min.zip(max))
    }

    async fn execute_window(&self, sql: &str, resource_id: i64, low: i64, high: i64) -> Result<u64> {
        let result = sqlx::query(sqlx::AssertSqlSafe(sql))
            .bind(resource_id)
            .bind(low)
            .bind(high)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Propagation failed for ids {}..={}", low, high))?;
        Ok(result.rows_affected())
    }

    fn check_cancelled(&self, table: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(PublishError::Cancelled(format!("propagation of {}", table)).into());
        }
        Ok(())
    }
}
