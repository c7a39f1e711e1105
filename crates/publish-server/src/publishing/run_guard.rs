//! Run guard
//!
//! Only one publish may run at a time across every worker. A session-level
//! advisory lock makes acquisition atomic; the persisted run and log rows
//! catch runs that died without cleaning up, which an operator clears with
//! [`RunGuard::all_clear`].

use anyhow::{Context, Result};
use sqlx::{Connection, PgConnection, PgPool};
use tracing::{info, warn};

use crate::error::PublishError;

/// First half of the advisory lock key ("PUBL"); the second half is derived
/// from the database name.
const LOCK_NAMESPACE: i32 = 0x5055_424C;

const TRY_LOCK_SQL: &str = "SELECT pg_try_advisory_lock($1, hashtext(current_database()))";
const UNLOCK_SQL: &str = "SELECT pg_advisory_unlock($1, hashtext(current_database()))";

const CLEAR_HINT: &str = "Run `publish all-clear` if you are SURE these are in an acceptable state.";

/// Counts from an all-clear sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllClearReport {
    pub logs_closed: u64,
    pub runs_closed: u64,
}

#[derive(Debug, Clone)]
pub struct RunGuard {
    pool: PgPool,
}

impl RunGuard {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Why a new run may not start, or `None` when the way is clear.
    pub async fn running_detail(&self) -> Result<Option<String>> {
        let mut conn = self.pool.acquire().await.context("Failed to acquire connection")?;
        persisted_detail(&mut conn).await
    }

    /// Take the publishing lock for `resource_id`.
    ///
    /// Fails with [`PublishError::AlreadyRunning`] without writing anything
    /// when another session holds the lock or a run/log is still open.
    pub async fn acquire(&self, resource_id: i64) -> Result<RunLease> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("Failed to acquire connection")?
            .detach();

        let locked: bool = sqlx::query_scalar(TRY_LOCK_SQL)
            .bind(LOCK_NAMESPACE)
            .fetch_one(&mut conn)
            .await
            .context("Failed to take publishing lock")?;

        if !locked {
            conn.close().await.ok();
            return Err(PublishError::AlreadyRunning(format!(
                "Another worker holds the publishing lock. {}",
                CLEAR_HINT
            ))
            .into());
        }

        let detail = match persisted_detail(&mut conn).await {
            Ok(detail) => detail,
            Err(e) => {
                unlock(&mut conn).await.ok();
                conn.close().await.ok();
                return Err(e);
            },
        };

        if let Some(detail) = detail {
            unlock(&mut conn).await?;
            conn.close().await.ok();
            return Err(PublishError::AlreadyRunning(detail).into());
        }

        let hostname = hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok());

        let run_id: i64 = match sqlx::query_scalar(
            "INSERT INTO import_runs (resource_id, hostname) VALUES ($1, $2) RETURNING id",
        )
        .bind(resource_id)
        .bind(&hostname)
        .fetch_one(&mut conn)
        .await
        {
            Ok(id) => id,
            Err(e) => {
                unlock(&mut conn).await.ok();
                conn.close().await.ok();
                return Err(e).context("Failed to record import run");
            },
        };

        info!(resource_id, run_id, hostname = ?hostname, "Publishing lock acquired");

        Ok(RunLease {
            conn,
            run_id,
            resource_id,
        })
    }

    /// Force-close every dangling log and run. For manual recovery after a
    /// crash an operator has confirmed.
    pub async fn all_clear(&self) -> Result<AllClearReport> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let logs_closed = sqlx::query(
            r#"
            UPDATE import_logs SET completed_at = NOW(), failed_at = NOW(), updated_at = NOW()
            WHERE completed_at IS NULL AND failed_at IS NULL
            "#,
        )
        .execute(&mut *tx)
        .await
        .context("Failed to close open import logs")?
        .rows_affected();

        sqlx::query(
            "UPDATE import_logs SET status = 'stopped' WHERE status IN ('currently running', 'running')",
        )
        .execute(&mut *tx)
        .await
        .context("Failed to mark running logs stopped")?;

        let runs_closed =
            sqlx::query("UPDATE import_runs SET completed_at = NOW() WHERE completed_at IS NULL")
                .execute(&mut *tx)
                .await
                .context("Failed to close open import runs")?
                .rows_affected();

        tx.commit().await.context("Failed to commit all-clear")?;

        warn!(logs_closed, runs_closed, "All-clear: dangling publishing state closed");

        Ok(AllClearReport {
            logs_closed,
            runs_closed,
        })
    }
}

/// Ownership of the publishing lock for one run. Dropping it without
/// [`RunLease::release`] frees the lock when the connection closes but leaves
/// the run row open.
#[derive(Debug)]
pub struct RunLease {
    conn: PgConnection,
    run_id: i64,
    resource_id: i64,
}

impl RunLease {
    pub fn run_id(&self) -> i64 {
        self.run_id
    }

    pub fn resource_id(&self) -> i64 {
        self.resource_id
    }

    /// Close the run row and give the lock back.
    pub async fn release(mut self) -> Result<()> {
        sqlx::query("UPDATE import_runs SET completed_at = NOW() WHERE id = $1")
            .bind(self.run_id)
            .execute(&mut self.conn)
            .await
            .context("Failed to close import run")?;

        unlock(&mut self.conn).await?;
        self.conn.close().await.ok();

        info!(resource_id = self.resource_id, run_id = self.run_id, "Publishing lock released");
        Ok(())
    }
}

async fn unlock(conn: &mut PgConnection) -> Result<()> {
    sqlx::query_scalar::<_, bool>(UNLOCK_SQL)
        .bind(LOCK_NAMESPACE)
        .fetch_one(conn)
        .await
        .context("Failed to release publishing lock")?;
    Ok(())
}

async fn persisted_detail(conn: &mut PgConnection) -> Result<Option<String>> {
    let open_runs: Vec<(i64, Option<i64>)> =
        sqlx::query_as("SELECT id, resource_id FROM import_runs WHERE completed_at IS NULL ORDER BY id")
            .fetch_all(&mut *conn)
            .await
            .context("Failed to check import runs")?;

    if !open_runs.is_empty() {
        let runs = open_runs
            .iter()
            .map(|(id, resource_id)| match resource_id {
                Some(resource_id) => format!("ImportRun#{} (Resource#{})", id, resource_id),
                None => format!("ImportRun#{}", id),
            })
            .collect::<Vec<_>>()
            .join(" ; ");
        return Ok(Some(format!(
            "A publishing run appears to be active: {}. {}",
            runs, CLEAR_HINT
        )));
    }

    let open_logs: Vec<(i64, i64, Option<String>)> = sqlx::query_as(
        r#"
        SELECT l.id, l.resource_id, r.name
        FROM import_logs l
        LEFT JOIN resources r ON r.id = l.resource_id
        WHERE l.completed_at IS NULL AND l.failed_at IS NULL
        ORDER BY l.id
        "#,
    )
    .fetch_all(&mut *conn)
    .await
    .context("Failed to check import logs")?;

    if open_logs.is_empty() {
        return Ok(None);
    }

    let logs = open_logs
        .iter()
        .map(|(id, resource_id, name)| match name {
            Some(name) => format!("ImportLog#{}: {} (Resource#{})", id, name, resource_id),
            None => format!("ImportLog#{}: Missing Resource#{}", id, resource_id),
        })
        .collect::<Vec<_>>()
        .join(" ; ");

    Ok(Some(format!("Currently publishing: {}. {}", logs, CLEAR_HINT)))
}
