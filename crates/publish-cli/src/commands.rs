//! Command implementations

use anyhow::{Context, Result};
use comfy_table::{presets::UTF8_FULL, Table};
use publish_server::config::Config;
use publish_server::db;
use publish_server::publishing::{
    harvest_repo_for, EntityType, ImportLog, JobScheduler, LocalRepo, PublishJob, PublishKind, Publisher, Resource,
    ResourceRepo, RunGuard,
};
use serde_json::json;
use sqlx::PgPool;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::RunArgs;

async fn connect(config: &Config) -> Result<PgPool> {
    let pool = db::create_pool(&config.database).await?;
    db::migrate(&pool).await?;
    Ok(pool)
}

fn repo_for(config: &Config, resource: &Resource, from_dir: Option<&Path>) -> Result<Box<dyn ResourceRepo>> {
    Ok(match from_dir {
        Some(dir) => Box::new(LocalRepo::new(dir)),
        None => Box::new(harvest_repo_for(&config.publish, resource)?),
    })
}

/// Queue a publish, or run it here and now.
pub async fn publish(config: &Config, resource_id: i64, kind: PublishKind, run: &RunArgs) -> Result<()> {
    let pool = connect(config).await?;
    let resource = Resource::find(&pool, resource_id).await?;

    if !run.now {
        let job = match kind {
            PublishKind::Full => PublishJob::full(resource.id),
            PublishKind::TraitsOnly => PublishJob::traits_only(resource.id),
        };
        let job = match std::env::var("USER") {
            Ok(user) => job.with_requested_by(user),
            Err(_) => job,
        };
        JobScheduler::new(config.publish.clone(), pool).enqueue(job).await?;
        println!(
            "Queued {} publish of {} (Resource#{}). Follow it with `publish status {}`.",
            kind_label(kind),
            resource.name,
            resource.id,
            resource.id
        );
        return Ok(());
    }

    let repo = repo_for(config, &resource, run.from_dir.as_deref())?;
    let publisher = Publisher::new(pool, config.publish.clone());
    info!(resource_id, kind = kind_label(kind), "Publishing in the foreground");

    match kind {
        PublishKind::Full => publisher.publish(&resource, repo.as_ref()).await?,
        PublishKind::TraitsOnly => publisher.traits_by_resource(&resource, repo.as_ref()).await?,
    }
    println!("Published {} (Resource#{})", resource.name, resource.id);
    Ok(())
}

fn kind_label(kind: PublishKind) -> &'static str {
    match kind {
        PublishKind::Full => "full",
        PublishKind::TraitsOnly => "trait",
    }
}

pub async fn load_file(config: &Config, resource_id: i64, entity: EntityType, path: &Path) -> Result<()> {
    let path = path
        .canonicalize()
        .with_context(|| format!("{} does not exist", path.display()))?;

    let pool = connect(config).await?;
    let resource = Resource::find(&pool, resource_id).await?;
    let report = Publisher::new(pool, config.publish.clone())
        .load_local_file(&resource, entity, &path)
        .await?;

    println!(
        "Loaded {} rows into {} from {} ({} lines)",
        report.rows_loaded,
        report.table,
        path.display(),
        report.line_count
    );
    Ok(())
}

pub async fn update_attributes(
    config: &Config,
    resource_id: i64,
    entity: EntityType,
    fields: &[String],
    from_dir: Option<PathBuf>,
) -> Result<()> {
    let pool = connect(config).await?;
    let resource = Resource::find(&pool, resource_id).await?;
    let repo = repo_for(config, &resource, from_dir.as_deref())?;

    let report = Publisher::new(pool, config.publish.clone())
        .update_attributes(&resource, repo.as_ref(), entity, fields)
        .await?;

    println!(
        "{}: {} lines, {} rows matched, {} rows changed",
        entity.table_name(),
        report.lines,
        report.matched,
        report.changed
    );
    Ok(())
}

pub async fn all_clear(config: &Config, yes: bool) -> Result<()> {
    let pool = connect(config).await?;
    let guard = RunGuard::new(pool);

    if !yes {
        match guard.running_detail().await? {
            Some(detail) => {
                println!("{}", detail);
                println!("Only clear these if the worker is really gone. Re-run with --yes to close them.");
            },
            None => println!("Nothing is running."),
        }
        return Ok(());
    }

    let report = guard.all_clear().await?;
    println!(
        "Closed {} import logs and {} runs",
        report.logs_closed, report.runs_closed
    );
    Ok(())
}

pub async fn status(config: &Config, resource_id: i64, events: usize, as_json: bool) -> Result<()> {
    let pool = db::create_pool(&config.database).await?;
    let resource = Resource::find(&pool, resource_id).await?;

    let Some(log) = ImportLog::latest(&pool, resource.id).await? else {
        println!("{} (Resource#{}) has never been published", resource.name, resource.id);
        return Ok(());
    };

    let status = log.status().await?;
    let all_events = log.events().await?;
    let recent = &all_events[all_events.len().saturating_sub(events)..];

    if as_json {
        let value = json!({
            "resource": { "id": resource.id, "name": resource.name },
            "log": status,
            "events": recent,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("{} (Resource#{}) ImportLog#{}", resource.name, resource.id, status.id);
    println!("  status:    {}", status.status);
    println!("  started:   {}", format_time(status.started_at));
    println!("  completed: {}", format_time(status.completed_at));
    println!("  failed:    {}", format_time(status.failed_at));

    if !recent.is_empty() {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["At", "Category", "Message"]);
        for event in recent {
            table.add_row(vec![
                event.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                event.cat.clone(),
                publish_common::text::truncate_chars(&event.body, 200).to_string(),
            ]);
        }
        println!("{table}");
    }

    Ok(())
}

fn format_time(at: Option<chrono::DateTime<chrono::Utc>>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "-".to_string())
}
