//! Publish worker - drains the publishing queue

use anyhow::Result;
use publish_common::logging::{init_logging, LogConfig};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use publish_server::{config::Config, db, publishing};

#[tokio::main]
async fn main() -> Result<()> {
    let log_config = LogConfig::builder()
        .log_file_prefix("publish-worker".to_string())
        .filter_directives("publish_server=debug,apalis=info,sqlx=warn".to_string())
        .build();

    // Environment variables take precedence
    let log_config = LogConfig::from_env().unwrap_or(log_config);

    init_logging(&log_config)?;

    info!("Starting publish worker");

    let config = Config::load()?;
    info!(
        tmp_dir = %config.publish.tmp_dir.display(),
        harvest_url = ?config.publish.harvest_url,
        max_attempts = config.publish.max_attempts,
        job_timeout_secs = config.publish.job_timeout_secs,
        "Configuration loaded"
    );
    if config.publish.harvest_url.is_none() {
        warn!("PUBLISH_HARVEST_URL is not set; every queued publish will fail");
    }

    let pool = db::create_pool(&config.database).await?;
    db::migrate(&pool).await?;

    let shutdown = CancellationToken::new();
    let _signals = publishing::cancel_on_signal(shutdown.clone());

    let scheduler = publishing::JobScheduler::new(config.publish, pool.clone());
    let worker = scheduler.start(shutdown).await?;

    if let Err(e) = worker.await {
        warn!(error = %e, "Worker task ended abnormally");
    }

    pool.close().await;
    info!("Publish worker shut down");

    Ok(())
}
