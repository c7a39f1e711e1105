//! Job scheduler
//!
//! Sets up the apalis queue with PostgreSQL storage and runs the worker that
//! drains it. One job runs at a time; publishing is serialized system-wide
//! anyway by the run guard.

use anyhow::{Context, Result};
use apalis::prelude::*;
use apalis_postgres::PostgresStorage;
use sqlx::PgPool;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::config::PublishConfig;
use super::jobs::{PublishJob, PublishKind};
use super::publisher::Publisher;
use super::repo::harvest_repo_for;
use super::resource::Resource;
use crate::error::{find_publish_error, PublishError};

const WORKER_NAME: &str = "publish-worker";

/// How long a cancelled job gets to finalize before it is dropped.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(60);

/// Shared state handed to every job
#[derive(Clone)]
pub struct WorkerContext {
    pub pool: PgPool,
    pub config: Arc<PublishConfig>,
    /// Cancelled on shutdown
    pub shutdown: CancellationToken,
}

/// Job scheduler
pub struct JobScheduler {
    config: PublishConfig,
    db: PgPool,
}

impl JobScheduler {
    pub fn new(config: PublishConfig, db: PgPool) -> Self {
        Self { config, db }
    }

    /// Queue a publish. The caller watches the import log for progress.
    pub async fn enqueue(&self, job: PublishJob) -> Result<()> {
        let mut storage = self.setup_storage().await?;
        storage
            .push(job.clone())
            .await
            .context("Failed to enqueue publish job")?;
        info!(resource_id = job.resource_id, kind = ?job.kind, "Publish job queued");
        Ok(())
    }

    /// Start the worker. It stops taking jobs once `shutdown` is cancelled;
    /// a job in progress winds down at its next stage or chunk boundary.
    pub async fn start(self, shutdown: CancellationToken) -> Result<JoinHandle<()>> {
        info!("Starting job scheduler");

        let storage = self.setup_storage().await?;
        let ctx = WorkerContext {
            pool: self.db.clone(),
            config: Arc::new(self.config),
            shutdown: shutdown.clone(),
        };

        let handle = tokio::spawn(async move {
            info!("Job worker started");
            let monitor = Monitor::new().register(move |_index| {
                WorkerBuilder::new(WORKER_NAME)
                    .backend(storage.clone())
                    .data(ctx.clone())
                    .build(process_publish_job)
            });
            let run = monitor.run();
            tokio::pin!(run);

            tokio::select! {
                result = &mut run => {
                    if let Err(e) = result {
                        error!("Job worker error: {:?}", e);
                    }
                }
                _ = shutdown.cancelled() => {
                    info!(grace_secs = SHUTDOWN_GRACE.as_secs(), "Waiting for the current job to wind down");
                    if let Ok(Err(e)) = tokio::time::timeout(SHUTDOWN_GRACE, &mut run).await {
                        error!("Job worker error: {:?}", e);
                    }
                }
            }
            info!("Job worker stopped");
        });

        Ok(handle)
    }

    async fn setup_storage(&self) -> Result<PostgresStorage<PublishJob>> {
        PostgresStorage::setup(&self.db)
            .await
            .context("Failed to set up job storage")?;
        Ok(PostgresStorage::new(&self.db))
    }
}

async fn process_publish_job(job: PublishJob, ctx: Data<WorkerContext>) -> std::result::Result<(), BoxDynError> {
    run_job(&ctx, &job)
        .await
        .map_err(|err| handoff(err, ctx.shutdown.is_cancelled()))
}

/// How a failed job goes back to apalis. A run cut short by shutdown is
/// deferred so it stays queued for the next worker; any other failure has
/// used up its attempts and is aborted.
fn handoff(err: anyhow::Error, shutting_down: bool) -> BoxDynError {
    let cancelled = matches!(find_publish_error(&err), Some(PublishError::Cancelled(_)));
    if shutting_down && cancelled {
        info!("Handing the interrupted publish job back to the queue");
        Box::new(DeferredError::new(err))
    } else {
        Box::new(AbortError::new(err))
    }
}

/// Run `job`, trying again after a retryable failure up to the configured
/// number of attempts. Each attempt restarts from the guard and relies on the
/// purge to undo whatever the previous one left. Attempts stopped by shutdown
/// or by the time limit are not retried.
pub async fn run_job(ctx: &WorkerContext, job: &PublishJob) -> Result<()> {
    let max_attempts = ctx.config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        info!(resource_id = job.resource_id, kind = ?job.kind, attempt, max_attempts, "Processing publish job");

        let cancel = ctx.shutdown.child_token();
        let err = match run_attempt(ctx, job, &cancel).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        let retryable = find_publish_error(&err).map_or(true, |e| e.is_retryable());
        if !retryable || attempt >= max_attempts || cancel.is_cancelled() {
            error!(
                resource_id = job.resource_id,
                attempt,
                error = %format!("{:#}", err),
                "Publish job failed"
            );
            return Err(err);
        }

        warn!(
            resource_id = job.resource_id,
            attempt,
            error = %format!("{:#}", err),
            "Publish attempt failed, retrying"
        );
        attempt += 1;
    }
}

async fn run_attempt(ctx: &WorkerContext, job: &PublishJob, cancel: &CancellationToken) -> Result<()> {
    let publisher = Publisher::new(ctx.pool.clone(), (*ctx.config).clone()).with_cancellation(cancel.clone());
    let work = execute(&ctx.pool, &publisher, job);
    bounded(work, cancel, ctx.config.job_timeout(), SHUTDOWN_GRACE).await
}

/// Drive `work` under the wall-clock `limit`. Hitting it cancels the run,
/// which then finalizes its log and lease on its own; work still going
/// `grace` later is dropped, leaving its run row for `publish all-clear`.
async fn bounded<F>(work: F, cancel: &CancellationToken, limit: Duration, grace: Duration) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    tokio::pin!(work);
    if let Ok(result) = tokio::time::timeout(limit, &mut work).await {
        return result;
    }

    warn!(timeout_secs = limit.as_secs(), "Publish job hit its time limit, cancelling");
    cancel.cancel();

    match tokio::time::timeout(grace, &mut work).await {
        Ok(result) => result,
        Err(_) => {
            error!(
                grace_secs = grace.as_secs(),
                "Publish job ignored cancellation and was abandoned"
            );
            Err(PublishError::Cancelled(format!("time limit of {}s exceeded", limit.as_secs())).into())
        },
    }
}

async fn execute(pool: &PgPool, publisher: &Publisher, job: &PublishJob) -> Result<()> {
    let resource = Resource::find(pool, job.resource_id).await?;
    let repo = harvest_repo_for(publisher.config(), &resource)?;

    match job.kind {
        PublishKind::Full => publisher.publish(&resource, &repo).await,
        PublishKind::TraitsOnly => publisher.traits_by_resource(&resource, &repo).await,
    }
}

/// Cancel `token` on SIGINT or SIGTERM.
pub fn cancel_on_signal(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                },
                Err(e) => {
                    error!(error = %e, "Failed to listen for SIGTERM");
                    std::future::pending::<()>().await;
                },
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received ctrl-c, shutting down"),
            _ = terminate => info!("Received SIGTERM, shutting down"),
        }
        token.cancel();
    })
}
