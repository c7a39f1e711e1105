//! Stage orchestrator
//!
//! Drives one resource through the publishing stages:
//!
//! ```text
//! Guarding -> Purging -> LoadingAndPropagating -> RestoringDerivedState
//!   -> CreatingPages -> AggregatingContent -> PublishingTraits
//!   -> FixingDenormalizedState -> PropagatingReferenceIds -> CleaningUp
//!   -> UpdatingClassification -> Completed | Failed
//! ```
//!
//! Inner stages return errors freely; only this module catches them. A failed
//! trait load is recorded and the run carries on, but the log is finalized as
//! failed and staged files are kept for inspection. Any other failure ends the
//! run: staged files are removed, the curated trace goes to the import log,
//! and the error is handed back to the caller (the queue, usually).
//!
//! Every entry point holds a [`RunLease`] for its whole duration and closes
//! its import log with the elapsed time before giving the lease back.

use anyhow::{Context, Result};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::aggregator::ContentAggregator;
use super::attributes::{self, AttributePlan, UpdateReport};
use super::config::PublishConfig;
use super::hooks::{PgStageHooks, StageHooks, TraitSource};
use super::import_log::{EventCategory, ImportLog};
use super::loader::{table_columns, BulkLoader, LoadReport, StagedFile};
use super::propagation::PropagationEngine;
use super::relationships::{EntityDecl, EntityType, RelationshipGraph};
use super::repo::ResourceRepo;
use super::resource::Resource;
use super::run_guard::{RunGuard, RunLease};
use super::trace;
use crate::error::{find_publish_error, PublishError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PublishStage {
    Guarding,
    Purging,
    LoadingAndPropagating,
    RestoringDerivedState,
    CreatingPages,
    AggregatingContent,
    PublishingTraits,
    FixingDenormalizedState,
    PropagatingReferenceIds,
    CleaningUp,
    UpdatingClassification,
    Completed,
    Failed,
}

impl PublishStage {
    pub fn as_str(self) -> &'static str {
        match self {
            PublishStage::Guarding => "guarding",
            PublishStage::Purging => "purging",
            PublishStage::LoadingAndPropagating => "loading_and_propagating",
            PublishStage::RestoringDerivedState => "restoring_derived_state",
            PublishStage::CreatingPages => "creating_pages",
            PublishStage::AggregatingContent => "aggregating_content",
            PublishStage::PublishingTraits => "publishing_traits",
            PublishStage::FixingDenormalizedState => "fixing_denormalized_state",
            PublishStage::PropagatingReferenceIds => "propagating_reference_ids",
            PublishStage::CleaningUp => "cleaning_up",
            PublishStage::UpdatingClassification => "updating_classification",
            PublishStage::Completed => "completed",
            PublishStage::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PublishStage::Completed | PublishStage::Failed)
    }
}

impl fmt::Display for PublishStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `h:mm:ss`, hours unbounded.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Entry point for every kind of publish
#[derive(Clone)]
pub struct Publisher {
    pool: sqlx::PgPool,
    config: PublishConfig,
    graph: RelationshipGraph,
    hooks: Arc<dyn StageHooks>,
    cancel: CancellationToken,
}

impl Publisher {
    pub fn new(pool: sqlx::PgPool, config: PublishConfig) -> Self {
        Self {
            hooks: Arc::new(PgStageHooks::new(pool.clone())),
            graph: RelationshipGraph::standard(),
            cancel: CancellationToken::new(),
            pool,
            config,
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn StageHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_graph(mut self, graph: RelationshipGraph) -> Self {
        self.graph = graph;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &PublishConfig {
        &self.config
    }

    /// Purge, reload and rebuild everything `resource` contributes.
    pub async fn publish(&self, resource: &Resource, repo: &dyn ResourceRepo) -> Result<()> {
        let mut run = self.start(resource).await?;
        let outcome = run.full_publish(repo).await;
        run.finish(outcome).await
    }

    /// Replace only the traits of `resource`.
    pub async fn traits_by_resource(&self, resource: &Resource, repo: &dyn ResourceRepo) -> Result<()> {
        let mut run = self.start(resource).await?;
        let outcome: Result<()> = async {
            run.publish_traits(repo).await?;
            run.enter(PublishStage::CleaningUp)?;
            run.clean_up().await
        }
        .await;
        run.finish(outcome).await
    }

    /// Load one table from a file an operator placed on disk, then propagate
    /// its ids. Nothing is purged and the file is left where it was.
    pub async fn load_local_file(&self, resource: &Resource, entity: EntityType, path: &Path) -> Result<LoadReport> {
        let mut run = self.start(resource).await?;
        let mut report = None;
        let outcome: Result<()> = async {
            run.enter(PublishStage::LoadingAndPropagating)?;
            let file = StagedFile::existing(path).await?;
            report = Some(run.load_and_propagate(entity, file).await?);
            Ok(())
        }
        .await;
        run.finish(outcome).await?;
        report.context("Load finished without a report")
    }

    /// Rewrite `fields` of `entity` rows from the repository's export,
    /// matching lines to rows by the table's natural key.
    pub async fn update_attributes(
        &self,
        resource: &Resource,
        repo: &dyn ResourceRepo,
        entity: EntityType,
        fields: &[String],
    ) -> Result<UpdateReport> {
        let mut run = self.start(resource).await?;
        let mut report = UpdateReport::default();
        let outcome: Result<()> = async {
            report = run.update_attributes(repo, entity, fields).await?;
            run.enter(PublishStage::CleaningUp)?;
            run.clean_up().await
        }
        .await;
        run.finish(outcome).await?;
        Ok(report)
    }

    /// Take the lease and open the log. Refusals happen before any write.
    async fn start<'a>(&'a self, resource: &'a Resource) -> Result<Run<'a>> {
        debug!(resource_id = resource.id, stage = %PublishStage::Guarding, "Entering stage");
        let lease = RunGuard::new(self.pool.clone()).acquire(resource.id).await?;

        let log = match open_log(&self.pool, resource.id).await {
            Ok(log) => log,
            Err(e) => {
                if let Err(release_err) = lease.release().await {
                    error!(error = %release_err, "Failed to release publishing lock");
                }
                return Err(e);
            },
        };

        info!(resource_id = resource.id, name = %resource.name, log_id = log.id(), "Publishing started");

        Ok(Run {
            publisher: self,
            resource,
            loader: BulkLoader::new(self.pool.clone(), log.clone()),
            propagation: PropagationEngine::new(
                self.pool.clone(),
                log.clone(),
                self.graph.clone(),
                self.config.propagation_window,
                self.cancel.clone(),
            ),
            aggregator: ContentAggregator::new(
                self.pool.clone(),
                log.clone(),
                self.config.content_batch_size,
                self.cancel.clone(),
            ),
            log,
            lease: Some(lease),
            files: Vec::new(),
            can_clean_up: true,
            trait_failure: None,
            stage: PublishStage::Guarding,
            started: Instant::now(),
        })
    }
}

async fn open_log(pool: &sqlx::PgPool, resource_id: i64) -> Result<ImportLog> {
    let log = ImportLog::latest_or_create(pool, resource_id).await?;
    log.begin().await?;
    Ok(log)
}

/// State of one guarded run
struct Run<'a> {
    publisher: &'a Publisher,
    resource: &'a Resource,
    log: ImportLog,
    lease: Option<RunLease>,
    loader: BulkLoader,
    propagation: PropagationEngine,
    aggregator: ContentAggregator,
    files: Vec<StagedFile>,
    can_clean_up: bool,
    trait_failure: Option<String>,
    stage: PublishStage,
    started: Instant,
}

impl Run<'_> {
    fn pool(&self) -> &sqlx::PgPool {
        &self.publisher.pool
    }

    fn config(&self) -> &PublishConfig {
        &self.publisher.config
    }

    /// Move to `stage`, unless cancellation was requested.
    fn enter(&mut self, stage: PublishStage) -> Result<()> {
        if self.publisher.cancel.is_cancelled() {
            return Err(PublishError::Cancelled(stage.to_string()).into());
        }
        debug!(resource_id = self.resource.id, %stage, "Entering stage");
        self.stage = stage;
        Ok(())
    }

    async fn full_publish(&mut self, repo: &dyn ResourceRepo) -> Result<()> {
        let pool = self.pool().clone();
        let graph = self.publisher.graph.clone();
        let hooks = self.publisher.hooks.clone();

        self.enter(PublishStage::Purging)?;
        if self.resource.has_nodes(&pool).await? {
            self.resource.remove_non_trait_content(&pool, &graph).await?;
            self.log
                .warn("All existing content has been destroyed for the resource.")
                .await?;
        }

        for decl in graph.entities().filter(|d| d.required) {
            let file = decl.entity.file_name();
            if !repo.exists(&file).await? {
                return Err(PublishError::MissingSourceFile {
                    location: repo.describe(&file),
                    file,
                }
                .into());
            }
        }

        self.enter(PublishStage::LoadingAndPropagating)?;
        for decl in graph.entities() {
            self.import_and_propagate(repo, decl).await?;
        }

        self.enter(PublishStage::RestoringDerivedState)?;
        hooks.restore_vernacular_preferences(self.resource, &self.log).await?;

        self.enter(PublishStage::CreatingPages)?;
        hooks.create_pages(self.resource, &self.log).await?;

        let has_content = self.resource.has_page_content(&pool).await?;
        if has_content {
            self.enter(PublishStage::AggregatingContent)?;
            self.aggregator.aggregate_resource(self.resource.id).await?;
        }

        self.publish_traits(repo).await?;

        self.enter(PublishStage::FixingDenormalizedState)?;
        hooks.fix_native_nodes(self.resource, &self.log).await?;

        self.enter(PublishStage::PropagatingReferenceIds)?;
        if self.resource.count_rows(&pool, EntityType::Reference).await? > 0 {
            self.propagation.propagate_reference_ids(self.resource.id).await?;
        }

        self.enter(PublishStage::CleaningUp)?;
        self.clean_up().await?;

        if has_content {
            self.log.start("Fixing missing icons").await?;
            let fixed = self.aggregator.fix_missing_icons().await?;
            self.log.info(&format!("{} pages given an icon", fixed)).await?;
        }

        if self.resource.classification {
            self.enter(PublishStage::UpdatingClassification)?;
            hooks.update_classification(self.resource, &self.log).await?;
        }

        Ok(())
    }

    /// Fetch, load and propagate one declared entity.
    async fn import_and_propagate(&mut self, repo: &dyn ResourceRepo, decl: &EntityDecl) -> Result<()> {
        let entity = decl.entity;
        let file_name = entity.file_name();

        let staged = StagedFile::fetch(repo, self.resource, &file_name, &self.config().tmp_dir).await?;
        let Some(staged) = staged else {
            if decl.required {
                return Err(PublishError::MissingSourceFile {
                    location: repo.describe(&file_name),
                    file: file_name,
                }
                .into());
            }
            self.log
                .info(&format!(
                    "{} not found; skipping {}",
                    repo.describe(&file_name),
                    entity.table_name()
                ))
                .await?;
            return Ok(());
        };

        self.load_and_propagate(entity, staged).await?;
        Ok(())
    }

    async fn load_and_propagate(&mut self, entity: EntityType, file: StagedFile) -> Result<LoadReport> {
        self.files.push(file.clone());
        let report = self.loader.load_entity(self.resource.id, entity, &file).await?;
        self.propagation
            .propagate(self.resource.id, entity, report.previous_max_id)
            .await?;
        Ok(report)
    }

    /// Trait loading failures are recorded and the run continues; staged
    /// files are kept so the export can be inspected.
    async fn publish_traits(&mut self, repo: &dyn ResourceRepo) -> Result<()> {
        self.enter(PublishStage::PublishingTraits)?;

        let source = TraitSource {
            repo,
            loader: &self.loader,
            tmp_dir: &self.publisher.config.tmp_dir,
        };
        let result = self.publisher.hooks.publish_traits(self.resource, &self.log, source).await;
        match result {
            Ok(files) => {
                self.files.extend(files);
                Ok(())
            },
            Err(e) if matches!(find_publish_error(&e), Some(PublishError::Cancelled(_))) => Err(e),
            Err(e) => {
                let curated = trace::curate(&e);
                warn!(resource_id = self.resource.id, error = %curated.summary, "Trait publishing failed");
                let mut message = format!("Trait publishing failed: {}", curated.summary);
                if !curated.frames.is_empty() {
                    message.push_str(" FROM ");
                    message.push_str(&curated.frames.join(" << "));
                }
                self.log.warn(&message).await?;
                self.can_clean_up = false;
                self.trait_failure = Some(curated.summary);
                Ok(())
            },
        }
    }

    async fn update_attributes(
        &mut self,
        repo: &dyn ResourceRepo,
        entity: EntityType,
        fields: &[String],
    ) -> Result<UpdateReport> {
        self.enter(PublishStage::LoadingAndPropagating)?;

        let table = entity.table_name();
        let columns = table_columns(self.pool(), table).await?;
        let plan = AttributePlan::resolve(table, &columns, fields)?;

        let file_name = entity.file_name();
        self.log
            .start(&format!("Updating {} of {} from {}", fields.join(", "), table, file_name))
            .await?;

        if !repo.exists(&file_name).await? {
            return Err(PublishError::MissingSourceFile {
                location: repo.describe(&file_name),
                file: file_name,
            }
            .into());
        }
        let Some(file) = StagedFile::fetch(repo, self.resource, &file_name, &self.config().tmp_dir).await? else {
            self.log.warn(&format!("COULDN'T FIND {} !", file_name)).await?;
            return Ok(UpdateReport::default());
        };
        self.files.push(file.clone());

        let report = attributes::apply(
            self.pool(),
            &self.log,
            self.resource.id,
            &plan,
            &file,
            self.config().update_batch_size,
            &self.publisher.cancel,
        )
        .await?;

        self.log
            .info(&format!(
                "{} lines, {} rows matched, {} rows changed",
                report.lines, report.matched, report.changed
            ))
            .await?;
        Ok(report)
    }

    /// Delete the files this run staged, unless a trait failure asked to
    /// keep them.
    async fn clean_up(&mut self) -> Result<()> {
        if !self.can_clean_up || self.config().keep_files {
            return Ok(());
        }
        for file in std::mem::take(&mut self.files) {
            if !file.is_owned() {
                continue;
            }
            if tokio::fs::try_exists(&file.path).await.unwrap_or(false) {
                self.log
                    .info(&format!("Removing {}", file.path.display()))
                    .await?;
                file.remove().await?;
            } else {
                self.log
                    .info(&format!(
                        "Skipping removal of {}; it does not exist",
                        file.path.display()
                    ))
                    .await?;
            }
        }
        Ok(())
    }

    /// Close the log, record the elapsed time and give the lease back. The
    /// run's own error wins over any raised while finishing.
    async fn finish(mut self, outcome: Result<()>) -> Result<()> {
        let outcome = match outcome {
            Ok(()) => match self.trait_failure.take() {
                None => self.log.complete().await.map(|()| PublishStage::Completed),
                Some(summary) => {
                    let err = PublishError::TraitLoadFailure(summary);
                    match self.log.fail(&err.to_string()).await {
                        Ok(()) => Err(err.into()),
                        Err(log_err) => Err(log_err),
                    }
                },
            },
            Err(e) => {
                error!(
                    resource_id = self.resource.id,
                    stage = %self.stage,
                    error = %format!("{:#}", e),
                    "Publishing failed"
                );
                if let Err(clean_err) = self.clean_up().await {
                    warn!(error = %clean_err, "Failed to remove staged files");
                }
                if let Err(log_err) = self.log.fail_from_error(&e).await {
                    error!(error = %log_err, "Failed to record failure in import log");
                }
                Err(e)
            },
        };

        self.stage = match outcome {
            Ok(stage) => stage,
            Err(_) => PublishStage::Failed,
        };

        let elapsed = format_elapsed(self.started.elapsed());
        if let Err(e) = self
            .log
            .append(&format!("TOTAL TIME: {}", elapsed), EventCategory::Infos)
            .await
        {
            warn!(error = %e, "Failed to record total time");
        }

        if let Some(lease) = self.lease.take() {
            if let Err(e) = lease.release().await {
                error!(error = %e, "Failed to release publishing lock");
            }
        }

        info!(
            resource_id = self.resource.id,
            stage = %self.stage,
            elapsed = %elapsed,
            "Publishing finished"
        );

        outcome.map(|_| ())
    }
}
