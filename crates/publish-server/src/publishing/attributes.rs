//! Attribute-only updates
//!
//! Rewrites a few columns of already-published rows from a fresh export,
//! matching file lines to rows by a natural key instead of reloading and
//! propagating the whole table.

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tokio_util::sync::CancellationToken;

use super::import_log::ImportLog;
use super::loader::{ColumnInfo, StagedFile};
use crate::error::PublishError;

/// Candidate match keys, in order of preference.
pub const KEY_COLUMNS: [&str; 3] = ["harv_db_id", "resource_pk", "node_resource_pk"];

/// Columns being updated and where they sit in each export line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributePlan {
    pub table: String,
    pub key: ColumnInfo,
    pub key_position: usize,
    /// `(column, position in the line)`
    pub fields: Vec<(ColumnInfo, usize)>,
}

impl AttributePlan {
    /// Resolve `fields` against the table's columns. Line positions equal
    /// column positions because the export omits only the production id.
    pub fn resolve(table: &str, columns: &[ColumnInfo], fields: &[String]) -> Result<Self, PublishError> {
        let position = |name: &str| columns.iter().position(|c| c.column_name == name);

        let (key_position, key) = KEY_COLUMNS
            .iter()
            .find_map(|name| position(name).map(|p| (p, columns[p].clone())))
            .ok_or_else(|| PublishError::UnknownColumn {
                table: table.to_string(),
                column: KEY_COLUMNS.join("|"),
            })?;

        let fields = fields
            .iter()
            .map(|field| {
                position(field)
                    .map(|p| (columns[p].clone(), p))
                    .ok_or_else(|| PublishError::UnknownColumn {
                        table: table.to_string(),
                        column: field.clone(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            table: table.to_string(),
            key,
            key_position,
            fields,
        })
    }

    /// Key and field values of one export line; `\N` and missing trailing
    /// values become NULL.
    pub fn extract(&self, record: &csv::StringRecord) -> Option<Vec<Option<String>>> {
        let value = |position: usize| {
            record
                .get(position)
                .filter(|v| *v != "\\N")
                .map(str::to_string)
        };

        let key = value(self.key_position)?;
        let mut values = vec![Some(key)];
        values.extend(self.fields.iter().map(|(_, position)| value(*position)));
        Some(values)
    }

    /// `UPDATE ... FROM (VALUES ...)` for one group of lines, writing only
    /// rows whose values actually change.
    pub fn update_query(&self, resource_id: i64, rows: &[Vec<Option<String>>]) -> QueryBuilder<Postgres> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!(r#"UPDATE "{}" AS t SET "#, self.table));

        let assignments = self
            .fields
            .iter()
            .enumerate()
            .map(|(i, (column, _))| format!(r#""{}" = v.f{}::{}"#, column.column_name, i, column.data_type))
            .collect::<Vec<_>>()
            .join(", ");
        builder.push(assignments);
        builder.push(" FROM (");

        builder.push_values(rows.iter().cloned(), |mut b, row| {
            for value in row {
                b.push_bind(value).push_unseparated("::TEXT");
            }
        });

        let aliases = (0..self.fields.len())
            .map(|i| format!("f{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        builder.push(format!(") AS v(key, {}) WHERE t.resource_id = ", aliases));
        builder.push_bind(resource_id);
        builder.push(format!(
            r#" AND t."{}" = v.key::{} AND ("#,
            self.key.column_name, self.key.data_type
        ));

        let changed = self
            .fields
            .iter()
            .enumerate()
            .map(|(i, (column, _))| {
                format!(
                    r#"t."{}" IS DISTINCT FROM v.f{}::{}"#,
                    column.column_name, i, column.data_type
                )
            })
            .collect::<Vec<_>>()
            .join(" OR ");
        builder.push(changed);
        builder.push(")");

        builder
    }
}

/// Totals from one attribute update
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct UpdateReport {
    pub lines: u64,
    pub matched: u64,
    pub changed: u64,
}

/// Apply `plan` to the rows of `resource_id` from `file`, `group_size` lines
/// per statement.
pub async fn apply(
    pool: &PgPool,
    log: &ImportLog,
    resource_id: i64,
    plan: &AttributePlan,
    file: &StagedFile,
    group_size: usize,
    cancel: &CancellationToken,
) -> Result<UpdateReport> {
    let bytes = tokio::fs::read(&file.path)
        .await
        .with_context(|| format!("Failed to read {}", file.path.display()))?;

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes.as_slice());

    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record.map_err(|e| PublishError::InvalidSourceRow {
            file: file.path.display().to_string(),
            line: line as u64 + 1,
            reason: e.to_string(),
        })?;
        if let Some(values) = plan.extract(&record) {
            rows.push(values);
        }
    }

    let mut report = UpdateReport {
        lines: rows.len() as u64,
        ..UpdateReport::default()
    };

    for group in rows.chunks(group_size.max(1)) {
        if cancel.is_cancelled() {
            return Err(PublishError::Cancelled(format!("attribute update of {}", plan.table)).into());
        }

        let keys: Vec<String> = group.iter().filter_map(|row| row[0].clone()).collect();
        let matched: i64 = sqlx::query_scalar(sqlx::AssertSqlSafe(format!(
            r#"SELECT COUNT(*) FROM "{}" WHERE resource_id = $1 AND "{}"::TEXT = ANY($2)"#,
            plan.table, plan.key.column_name
        )))
        .bind(resource_id)
        .bind(&keys)
        .fetch_one(pool)
        .await
        .context("Failed to match export lines to rows")?;
        log.warn(&format!("{} instances by {}", matched, plan.key.column_name))
            .await?;

        let changed = plan
            .update_query(resource_id, group)
            .build()
            .execute(pool)
            .await
            .with_context(|| format!("Failed to update {}", plan.table))?
            .rows_affected();
        log.warn(&format!("{} changes...", changed)).await?;

        report.matched += matched as u64;
        report.changed += changed;
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, data_type: &str) -> ColumnInfo {
        ColumnInfo {
            column_name: name.to_string(),
            data_type: data_type.to_string(),
        }
    }

    fn scientific_name_columns() -> Vec<ColumnInfo> {
        vec![
            column("resource_id", "bigint"),
            column("harv_db_id", "bigint"),
            column("node_id", "bigint"),
            column("page_id", "bigint"),
            column("italicized", "text"),
            column("canonical_form", "text"),
            column("taxonomic_status", "text"),
            column("is_preferred", "boolean"),
            column("dataset_name", "text"),
        ]
    }

    #[test]
    fn test_resolve_prefers_harvest_id() {
        let plan = AttributePlan::resolve(
            "scientific_names",
            &scientific_name_columns(),
            &["dataset_name".to_string()],
        )
        .unwrap();
        assert_eq!(plan.key.column_name, "harv_db_id");
        assert_eq!(plan.key_position, 1);
        assert_eq!(plan.fields[0].1, 8);
    }

    #[test]
    fn test_resolve_falls_back_to_resource_pk() {
        let columns = vec![
            column("resource_id", "bigint"),
            column("node_resource_pk", "text"),
            column("identifier", "text"),
        ];
        let plan = AttributePlan::resolve("identifiers", &columns, &["identifier".to_string()]).unwrap();
        assert_eq!(plan.key.column_name, "node_resource_pk");
    }

    #[test]
    fn test_resolve_rejects_unknown_field() {
        let err = AttributePlan::resolve("scientific_names", &scientific_name_columns(), &["colour".to_string()])
            .unwrap_err();
        assert!(matches!(err, PublishError::UnknownColumn { column, .. } if column == "colour"));
    }

    #[test]
    fn test_extract_maps_null_marker() {
        let plan = AttributePlan::resolve(
            "scientific_names",
            &scientific_name_columns(),
            &["taxonomic_status".to_string(), "dataset_name".to_string()],
        )
        .unwrap();
        let record = csv::StringRecord::from(vec!["1", "55", "3", "4", "<i>Gadus</i>", "Gadus", "\\N", "1", "WoRMS"]);

        assert_eq!(
            plan.extract(&record),
            Some(vec![Some("55".to_string()), None, Some("WoRMS".to_string())])
        );
    }

    #[test]
    fn test_update_query_only_touches_changed_rows() {
        let plan = AttributePlan::resolve(
            "scientific_names",
            &scientific_name_columns(),
            &["dataset_name".to_string()],
        )
        .unwrap();
        let rows = vec![vec![Some("55".to_string()), Some("WoRMS".to_string())]];
        let query = plan.update_query(9, &rows);

        assert_eq!(
            query.sql(),
            r#"UPDATE "scientific_names" AS t SET "dataset_name" = v.f0::text FROM (VALUES ($1::TEXT, $2::TEXT)) AS v(key, f0) WHERE t.resource_id = $3 AND t."harv_db_id" = v.key::bigint AND (t."dataset_name" IS DISTINCT FROM v.f0::text)"#
        );
    }
}
