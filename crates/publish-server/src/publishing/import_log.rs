//! Import log
//!
//! One log per resource run, holding a status line, timestamps and an ordered
//! list of events. This is the only record an operator sees: runs execute on
//! a queue, so nothing is ever returned to the caller that asked for them.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use publish_common::text::{chunk_chars, truncate_chars};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use std::fmt;
use std::str::FromStr;
use tracing::{error, info, warn};

use super::trace;
use crate::error::PublishError;

/// Largest body stored in one event, in characters.
pub const EVENT_BODY_LIMIT: usize = 65_500;

/// Longest status line kept when a run fails.
pub const STATUS_LIMIT: usize = 250;

pub const STATUS_IDLE: &str = "idle";
pub const STATUS_RUNNING: &str = "running";
pub const STATUS_COMPLETED: &str = "completed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    Starts,
    Infos,
    Warns,
    Errors,
    Updates,
    Ends,
}

impl EventCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            EventCategory::Starts => "starts",
            EventCategory::Infos => "infos",
            EventCategory::Warns => "warns",
            EventCategory::Errors => "errors",
            EventCategory::Updates => "updates",
            EventCategory::Ends => "ends",
        }
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventCategory {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "starts" => Ok(EventCategory::Starts),
            "infos" => Ok(EventCategory::Infos),
            "warns" => Ok(EventCategory::Warns),
            "errors" => Ok(EventCategory::Errors),
            "updates" => Ok(EventCategory::Updates),
            "ends" => Ok(EventCategory::Ends),
            other => anyhow::bail!("Unknown event category: {}", other),
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ImportEvent {
    pub id: i64,
    pub cat: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl ImportEvent {
    pub fn category(&self) -> Option<EventCategory> {
        self.cat.parse().ok()
    }
}

/// Persisted state of a log, as an operator would read it
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct LogStatus {
    pub id: i64,
    pub resource_id: i64,
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl LogStatus {
    pub fn is_open(&self) -> bool {
        self.completed_at.is_none() && self.failed_at.is_none()
    }
}

/// Handle on one resource's import log
#[derive(Debug, Clone)]
pub struct ImportLog {
    pool: PgPool,
    id: i64,
    resource_id: i64,
}

impl ImportLog {
    /// Start a fresh log for `resource_id`. It is created closed (`idle` with
    /// a completion time) so it does not count as a running publish until
    /// [`ImportLog::begin`] is called.
    pub async fn create(pool: &PgPool, resource_id: i64) -> Result<Self> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO import_logs (resource_id, status, completed_at)
            VALUES ($1, $2, NOW())
            RETURNING id
            "#,
        )
        .bind(resource_id)
        .bind(STATUS_IDLE)
        .fetch_one(pool)
        .await
        .context("Failed to create import log")?;

        Ok(Self {
            pool: pool.clone(),
            id,
            resource_id,
        })
    }

    /// Most recent log for the resource, if any.
    pub async fn latest(pool: &PgPool, resource_id: i64) -> Result<Option<Self>> {
        let id: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM import_logs WHERE resource_id = $1 ORDER BY id DESC LIMIT 1",
        )
        .bind(resource_id)
        .fetch_optional(pool)
        .await
        .context("Failed to look up import log")?;

        Ok(id.map(|id| Self {
            pool: pool.clone(),
            id,
            resource_id,
        }))
    }

    pub async fn latest_or_create(pool: &PgPool, resource_id: i64) -> Result<Self> {
        match Self::latest(pool, resource_id).await? {
            Some(log) => Ok(log),
            None => Self::create(pool, resource_id).await,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn resource_id(&self) -> i64 {
        self.resource_id
    }

    /// Mark the log as running and touch the resource.
    pub async fn begin(&self) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE import_logs
            SET status = $2, started_at = NOW(), completed_at = NULL, failed_at = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(self.id)
        .bind(STATUS_RUNNING)
        .execute(&self.pool)
        .await
        .context("Failed to mark import log running")?;

        self.touch_resource().await?;
        self.append("Running", EventCategory::Starts).await
    }

    /// Store `message` as one or more events, splitting at
    /// [`EVENT_BODY_LIMIT`] characters.
    pub async fn append(&self, message: &str, cat: EventCategory) -> Result<()> {
        self.mirror(message, cat);

        let chunks = chunk_chars(message, EVENT_BODY_LIMIT);
        if chunks.len() == 1 {
            return self.insert_event(chunks[0], cat).await;
        }

        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        for chunk in chunks {
            sqlx::query("INSERT INTO import_events (import_log_id, cat, body) VALUES ($1, $2, $3)")
                .bind(self.id)
                .bind(cat.as_str())
                .bind(chunk)
                .execute(&mut *tx)
                .await
                .context("Failed to store import event")?;
        }
        tx.commit().await.context("Failed to commit import events")?;

        Ok(())
    }

    pub async fn start(&self, message: &str) -> Result<()> {
        self.append(message, EventCategory::Starts).await
    }

    pub async fn info(&self, message: &str) -> Result<()> {
        self.append(message, EventCategory::Infos).await
    }

    pub async fn warn(&self, message: &str) -> Result<()> {
        self.append(message, EventCategory::Warns).await
    }

    /// Progress-style update: overwrites the latest event when it is already
    /// an update, otherwise adds one.
    pub async fn append_or_merge_update(&self, message: &str) -> Result<()> {
        let size = message.chars().count();
        if size > EVENT_BODY_LIMIT {
            return Err(PublishError::UpdateTooLarge {
                size,
                limit: EVENT_BODY_LIMIT,
            }
            .into());
        }

        self.mirror(message, EventCategory::Updates);

        let last: Option<(i64, String)> = sqlx::query_as(
            "SELECT id, cat FROM import_events WHERE import_log_id = $1 ORDER BY id DESC LIMIT 1",
        )
        .bind(self.id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to read latest import event")?;

        match last {
            Some((event_id, cat)) if cat == EventCategory::Updates.as_str() => {
                sqlx::query("UPDATE import_events SET body = $2, updated_at = NOW() WHERE id = $1")
                    .bind(event_id)
                    .bind(message)
                    .execute(&self.pool)
                    .await
                    .context("Failed to merge update event")?;
                Ok(())
            },
            _ => self.insert_event(message, EventCategory::Updates).await,
        }
    }

    /// Close the log successfully. A log that already failed stays failed.
    pub async fn complete(&self) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE import_logs
            SET status = $2, completed_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND failed_at IS NULL
            "#,
        )
        .bind(self.id)
        .bind(STATUS_COMPLETED)
        .execute(&self.pool)
        .await
        .context("Failed to complete import log")?
        .rows_affected();

        if updated > 0 {
            self.touch_resource().await?;
            self.append("Complete", EventCategory::Ends).await?;
        }
        Ok(())
    }

    /// Close the log as failed; the status becomes the first
    /// [`STATUS_LIMIT`] characters of `message`.
    pub async fn fail(&self, message: &str) -> Result<()> {
        let status = truncate_chars(message, STATUS_LIMIT);
        self.append(&format!("Failed: {}", status), EventCategory::Errors)
            .await?;

        sqlx::query(
            r#"
            UPDATE import_logs
            SET status = $2, failed_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND completed_at IS NULL
            "#,
        )
        .bind(self.id)
        .bind(status)
        .execute(&self.pool)
        .await
        .context("Failed to mark import log failed")?;

        Ok(())
    }

    /// Record a curated trace of `err` (one "errors" event per frame) and
    /// fail the log with its address-free summary.
    pub async fn fail_from_error(&self, err: &anyhow::Error) -> Result<()> {
        let curated = trace::curate(err);
        for frame in &curated.frames {
            self.append(frame, EventCategory::Errors).await?;
        }
        self.fail(&curated.summary).await
    }

    pub async fn status(&self) -> Result<LogStatus> {
        sqlx::query_as::<_, LogStatus>(
            r#"
            SELECT id, resource_id, status, started_at, completed_at, failed_at
            FROM import_logs WHERE id = $1
            "#,
        )
        .bind(self.id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to read import log")
    }

    pub async fn events(&self) -> Result<Vec<ImportEvent>> {
        sqlx::query_as::<_, ImportEvent>(
            r#"
            SELECT id, cat, body, created_at
            FROM import_events WHERE import_log_id = $1
            ORDER BY id
            "#,
        )
        .bind(self.id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to read import events")
    }

    async fn insert_event(&self, body: &str, cat: EventCategory) -> Result<()> {
        sqlx::query("INSERT INTO import_events (import_log_id, cat, body) VALUES ($1, $2, $3)")
            .bind(self.id)
            .bind(cat.as_str())
            .bind(body)
            .execute(&self.pool)
            .await
            .context("Failed to store import event")?;
        Ok(())
    }

    async fn touch_resource(&self) -> Result<()> {
        sqlx::query("UPDATE resources SET updated_at = NOW() WHERE id = $1")
            .bind(self.resource_id)
            .execute(&self.pool)
            .await
            .context("Failed to touch resource")?;
        Ok(())
    }

    fn mirror(&self, message: &str, cat: EventCategory) {
        let body = truncate_chars(message, 1_000);
        match cat {
            EventCategory::Warns => {
                warn!(resource_id = self.resource_id, import_log_id = self.id, "{}", body)
            },
            EventCategory::Errors => {
                error!(resource_id = self.resource_id, import_log_id = self.id, "{}", body)
            },
            _ => info!(
                resource_id = self.resource_id,
                import_log_id = self.id,
                cat = cat.as_str(),
                "{}",
                body
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publishing::resource::Resource;

    async fn setup(pool: &PgPool) -> ImportLog {
        let resource = Resource::create(pool, "Fishbase", "fishbase", false).await.unwrap();
        ImportLog::create(pool, resource.id).await.unwrap()
    }

    #[test]
    fn test_event_category_round_trip() {
        for cat in [
            EventCategory::Starts,
            EventCategory::Infos,
            EventCategory::Warns,
            EventCategory::Errors,
            EventCategory::Updates,
            EventCategory::Ends,
        ] {
            assert_eq!(cat.as_str().parse::<EventCategory>().unwrap(), cat);
        }
        assert!("debug".parse::<EventCategory>().is_err());
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_begin_then_complete(pool: PgPool) {
        let log = setup(&pool).await;
        assert!(!log.status().await.unwrap().is_open());

        log.begin().await.unwrap();
        let status = log.status().await.unwrap();
        assert_eq!(status.status, STATUS_RUNNING);
        assert!(status.is_open());

        log.complete().await.unwrap();
        let status = log.status().await.unwrap();
        assert_eq!(status.status, STATUS_COMPLETED);
        assert!(status.completed_at.is_some());

        let cats: Vec<_> = log.events().await.unwrap().into_iter().map(|e| e.cat).collect();
        assert_eq!(cats, vec!["starts", "ends"]);
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_large_message_is_chunked(pool: PgPool) {
        let log = setup(&pool).await;
        let message: String = (0..150_000).map(|i| char::from(b'a' + (i % 26) as u8)).collect();

        log.append(&message, EventCategory::Infos).await.unwrap();

        let events = log.events().await.unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.body.chars().count() <= EVENT_BODY_LIMIT));
        let rebuilt: String = events.iter().map(|e| e.body.as_str()).collect();
        assert_eq!(rebuilt, message);
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_updates_overwrite_latest_update(pool: PgPool) {
        let log = setup(&pool).await;

        log.info("Loading nodes").await.unwrap();
        log.append_or_merge_update("10% done").await.unwrap();
        log.append_or_merge_update("20% done").await.unwrap();
        log.info("Loading media").await.unwrap();
        log.append_or_merge_update("5% done").await.unwrap();

        let bodies: Vec<_> = log.events().await.unwrap().into_iter().map(|e| e.body).collect();
        assert_eq!(bodies, vec!["Loading nodes", "20% done", "Loading media", "5% done"]);
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_oversized_update_is_rejected(pool: PgPool) {
        let log = setup(&pool).await;
        let err = log
            .append_or_merge_update(&"x".repeat(EVENT_BODY_LIMIT + 1))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PublishError>(),
            Some(PublishError::UpdateTooLarge { .. })
        ));
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_fail_truncates_status_and_blocks_completion(pool: PgPool) {
        let log = setup(&pool).await;
        log.begin().await.unwrap();

        log.fail(&"e".repeat(1_000)).await.unwrap();
        log.complete().await.unwrap();

        let status = log.status().await.unwrap();
        assert_eq!(status.status.chars().count(), STATUS_LIMIT);
        assert!(status.failed_at.is_some());
        assert!(status.completed_at.is_none());
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_fail_from_error_logs_frames(pool: PgPool) {
        let log = setup(&pool).await;
        log.begin().await.unwrap();

        let err = anyhow::anyhow!("relation \"nodes\" does not exist").context("Failed to load nodes");
        log.fail_from_error(&err).await.unwrap();

        let events = log.events().await.unwrap();
        let errors = events.iter().filter(|e| e.cat == "errors").count();
        assert!(errors >= 2);
        assert!(log.status().await.unwrap().status.starts_with("Failed to load nodes"));
    }
}
