//! Publishing pipeline
//!
//! # Architecture
//!
//! - **relationships**: which columns reference which tables (plain data)
//! - **resource**: the resource record and purge of its published content
//! - **repo**: where exports come from (harvester over HTTP, or a directory)
//! - **import_log**: per-run progress and failure record
//! - **trace**: curated failure excerpts for the import log
//! - **run_guard**: advisory lock plus persisted run records
//! - **loader**: `COPY` of staged TSV files
//! - **propagation**: windowed harvest id to production id rewrites
//! - **aggregator**: page contents, positions and hero images
//! - **attributes**: attribute-only updates keyed by natural key
//! - **hooks**: derived-state stages (pages, traits, vernaculars...)
//! - **publisher**: the stage orchestrator and operator entry points
//! - **jobs** / **scheduler**: apalis queue integration

pub mod aggregator;
pub mod attributes;
pub mod config;
pub mod hooks;
pub mod import_log;
pub mod jobs;
pub mod loader;
pub mod propagation;
pub mod publisher;
pub mod relationships;
pub mod repo;
pub mod resource;
pub mod run_guard;
pub mod scheduler;
pub mod trace;

pub use aggregator::{ContentAggregator, ContentKind, PositionAccumulator};
pub use attributes::UpdateReport;
pub use config::PublishConfig;
pub use hooks::{PgStageHooks, StageHooks};
pub use import_log::{EventCategory, ImportEvent, ImportLog, LogStatus};
pub use jobs::{PublishJob, PublishKind};
pub use loader::{BulkLoader, LoadReport, StagedFile};
pub use propagation::PropagationEngine;
pub use publisher::{PublishStage, Publisher};
pub use relationships::{EntityType, RelationshipGraph};
pub use repo::{harvest_repo_for, HarvestRepo, LocalRepo, ResourceRepo};
pub use resource::Resource;
pub use run_guard::{RunGuard, RunLease};
pub use scheduler::{cancel_on_signal, JobScheduler, WorkerContext};
