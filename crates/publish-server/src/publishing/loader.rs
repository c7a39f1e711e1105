//! Bulk loader
//!
//! Streams one staged TSV export into one table with `COPY ... FROM STDIN`.
//! The export has one value per table column except the production `id`,
//! in ordinal order, `\N` for NULL, backslash escapes and optional
//! double-quote enclosure. Each record is rewritten into `COPY` text format
//! on the way through (see [`encode_record`]).

use anyhow::{Context, Result};
use publish_common::text::count_lines;
use serde::Serialize;
use sqlx::postgres::PgPoolCopyExt;
use sqlx::{FromRow, PgPool};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tracing::{debug, info};

use super::import_log::ImportLog;
use super::relationships::EntityType;
use super::repo::ResourceRepo;
use super::resource::Resource;
use crate::error::PublishError;

/// Bytes buffered before each `COPY` send.
const COPY_BUFFER_BYTES: usize = 1 << 20;

const READ_CHUNK_BYTES: usize = 64 * 1024;

/// A file waiting to be loaded
#[derive(Debug, Clone)]
pub struct StagedFile {
    pub path: PathBuf,
    /// Newline count, as `wc -l` reports it.
    pub line_count: u64,
    /// Files supplied by an operator are never deleted.
    owned: bool,
}

impl StagedFile {
    /// Download `file` from the repository into `tmp_dir`. `None` when the
    /// repository has no such file.
    pub async fn fetch(
        repo: &dyn ResourceRepo,
        resource: &Resource,
        file: &str,
        tmp_dir: &Path,
    ) -> Result<Option<Self>> {
        tokio::fs::create_dir_all(tmp_dir)
            .await
            .with_context(|| format!("Failed to create {}", tmp_dir.display()))?;

        let path = tmp_dir.join(format!("{}_{}", resource.path, file));
        let Some(bytes) = repo.download(file, &path).await? else {
            return Ok(None);
        };
        let line_count = count_file_lines(&path).await?;

        debug!(path = %path.display(), bytes, line_count, "Staged export");

        Ok(Some(Self {
            path,
            line_count,
            owned: true,
        }))
    }

    /// Wrap a file an operator already placed on disk.
    pub async fn existing(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        Ok(Self {
            line_count: count_file_lines(&path).await?,
            path,
            owned: false,
        })
    }

    pub fn is_owned(&self) -> bool {
        self.owned
    }

    /// Delete the staged copy. Operator files are left alone.
    pub async fn remove(&self) -> Result<()> {
        if !self.owned {
            return Ok(());
        }
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", self.path.display())),
        }
    }
}

/// Newline count of a file, read in chunks.
async fn count_file_lines(path: &Path) -> Result<u64> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let mut buffer = vec![0u8; READ_CHUNK_BYTES];
    let mut lines = 0;
    loop {
        let read = file
            .read(&mut buffer)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if read == 0 {
            return Ok(lines);
        }
        lines += count_lines(&buffer[..read]);
    }
}

/// Rewrite one export record as a `COPY` text-format row.
///
/// Backslash escapes already match `COPY` text and pass through. A field that
/// starts with `"` is enclosed: the enclosing quotes are dropped and raw tabs
/// or newlines inside it are escaped. A `"` anywhere else is plain data.
///
/// Returns `None` while the record is incomplete (inside an enclosed field or
/// right after a backslash at the end of the line); the caller appends the
/// next line and tries again.
pub fn encode_record(record: &str) -> Option<String> {
    let mut out = String::with_capacity(record.len() + 8);
    let mut chars = record.chars().peekable();
    let mut field_start = true;
    let mut enclosed = false;

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                match chars.next()? {
                    '\n' => out.push_str("\\n"),
                    '\t' => out.push_str("\\t"),
                    escaped => {
                        out.push('\\');
                        out.push(escaped);
                    },
                }
                field_start = false;
            },
            '"' if field_start => {
                enclosed = true;
                field_start = false;
            },
            '"' if enclosed && matches!(chars.peek(), None | Some(&'\t')) => enclosed = false,
            '\t' if enclosed => out.push_str("\\t"),
            '\n' if enclosed => out.push_str("\\n"),
            '\t' => {
                out.push('\t');
                field_start = true;
            },
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => {
                out.push(other);
                field_start = false;
            },
        }
    }

    if enclosed {
        None
    } else {
        Some(out)
    }
}

#[derive(Debug, Clone, FromRow, PartialEq, Eq)]
pub struct ColumnInfo {
    pub column_name: String,
    pub data_type: String,
}

/// Columns of `table` after the production id, in ordinal order.
pub async fn table_columns(pool: &PgPool, table: &str) -> Result<Vec<ColumnInfo>> {
    let columns = sqlx::query_as::<_, ColumnInfo>(
        r#"
        SELECT column_name::TEXT AS column_name, data_type::TEXT AS data_type
        FROM information_schema.columns
        WHERE table_schema = current_schema() AND table_name = $1 AND column_name <> 'id'
        ORDER BY ordinal_position
        "#,
    )
    .bind(table)
    .fetch_all(pool)
    .await
    .with_context(|| format!("Failed to read columns of {}", table))?;

    if columns.is_empty() {
        anyhow::bail!("Table {} has no loadable columns", table);
    }
    Ok(columns)
}

/// Build the `COPY` statement for a TSV export.
pub fn copy_statement(table: &str, columns: &[ColumnInfo]) -> String {
    let columns = columns
        .iter()
        .map(|c| format!(r#""{}""#, c.column_name))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        r#"COPY "{}" ({}) FROM STDIN WITH (FORMAT text, NULL '\N')"#,
        table, columns
    )
}

/// Whether a load's row delta is acceptably close to the file's line count.
/// One row of slack absorbs a missing final newline or a trailing blank line.
pub fn counts_agree(rows_loaded: i64, line_count: u64) -> bool {
    (rows_loaded - line_count as i64).abs() <= 1
}

/// Outcome of one table load
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LoadReport {
    pub table: String,
    pub line_count: u64,
    pub rows_loaded: i64,
    /// Highest id in the table before the load; every loaded row is above it.
    pub previous_max_id: i64,
}

impl LoadReport {
    pub fn counts_agree(&self) -> bool {
        counts_agree(self.rows_loaded, self.line_count)
    }
}

#[derive(Debug, Clone)]
pub struct BulkLoader {
    pool: PgPool,
    log: ImportLog,
}

impl BulkLoader {
    pub fn new(pool: PgPool, log: ImportLog) -> Self {
        Self { pool, log }
    }

    pub async fn load_entity(&self, resource_id: i64, entity: EntityType, file: &StagedFile) -> Result<LoadReport> {
        self.load(resource_id, entity.table_name(), file).await
    }

    /// Load every row of `file` into `table`.
    ///
    /// A row count that disagrees with the file is logged as a warning; the
    /// load still counts as successful.
    pub async fn load(&self, resource_id: i64, table: &str, file: &StagedFile) -> Result<LoadReport> {
        self.log
            .start(&format!(
                "Loading {} ({} lines) into {}",
                file.path.display(),
                file.line_count,
                table
            ))
            .await?;

        let before = self.count(resource_id, table).await?;
        let previous_max_id = self.max_id(table).await?;

        let columns = table_columns(&self.pool, table).await?;
        let statement = copy_statement(table, &columns);
        let copied = self.copy_file(&statement, &file.path).await?;

        let after = self.count(resource_id, table).await?;
        let report = LoadReport {
            table: table.to_string(),
            line_count: file.line_count,
            rows_loaded: after - before,
            previous_max_id,
        };

        info!(
            resource_id,
            table,
            copied,
            rows_loaded = report.rows_loaded,
            line_count = report.line_count,
            "Bulk load finished"
        );

        if !report.counts_agree() {
            self.log
                .warn(&format!(
                    "INCORRECT NUMBER OF ROWS for {}: file has {} lines but {} rows were added for this resource",
                    table, report.line_count, report.rows_loaded
                ))
                .await?;
        }

        Ok(report)
    }

    async fn count(&self, resource_id: i64, table: &str) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(sqlx::AssertSqlSafe(format!(
            r#"SELECT COUNT(*) FROM "{}" WHERE resource_id = $1"#,
            table
        )))
        .bind(resource_id)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("Failed to count rows in {}", table))
    }

    async fn max_id(&self, table: &str) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(sqlx::AssertSqlSafe(format!(r#"SELECT COALESCE(MAX(id), 0) FROM "{}""#, table)))
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("Failed to read max id of {}", table))
    }

    /// Stream the file through `COPY`, holding back blank lines until a
    /// non-blank one follows so trailing blanks never reach the server.
    async fn copy_file(&self, statement: &str, path: &Path) -> Result<u64> {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let mut lines = BufReader::new(file).lines();

        let mut copy = self
            .pool
            .copy_in_raw(statement)
            .await
            .context("Failed to start COPY")?;

        let mut buffer: Vec<u8> = Vec::with_capacity(COPY_BUFFER_BYTES);
        let mut pending_blank_lines = 0usize;
        let mut record = String::new();
        let mut line_number = 0u64;
        let mut record_start = 0u64;

        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    copy.abort(e.to_string()).await.ok();
                    return Err(e).with_context(|| format!("Failed to read {}", path.display()));
                },
            };
            line_number += 1;

            if record.is_empty() {
                if line.trim().is_empty() {
                    pending_blank_lines += 1;
                    continue;
                }
                record_start = line_number;
                record = line;
            } else {
                record.push('\n');
                record.push_str(&line);
            }

            let Some(row) = encode_record(&record) else {
                continue;
            };
            record.clear();

            for _ in 0..pending_blank_lines {
                buffer.push(b'\n');
            }
            pending_blank_lines = 0;

            buffer.extend_from_slice(row.as_bytes());
            buffer.push(b'\n');

            if buffer.len() >= COPY_BUFFER_BYTES {
                let chunk = std::mem::replace(&mut buffer, Vec::with_capacity(COPY_BUFFER_BYTES));
                copy.send(chunk).await.context("COPY failed")?;
            }
        }

        if !record.is_empty() {
            copy.abort("unterminated record").await.ok();
            return Err(PublishError::InvalidSourceRow {
                file: path.display().to_string(),
                line: record_start,
                reason: "quoted field is never closed".to_string(),
            }
            .into());
        }

        if !buffer.is_empty() {
            copy.send(buffer).await.context("COPY failed")?;
        }

        copy.finish().await.context("COPY failed")
    }
}
