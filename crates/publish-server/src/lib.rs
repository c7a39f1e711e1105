//! Bulk publishing pipeline
//!
//! Merges the flat-file exports a harvester produces for one resource into the
//! production store:
//!
//! - **Run Guard**: one publish at a time, system-wide
//! - **Import Log**: the persisted, user-visible record of every run
//! - **Bulk Loader**: `COPY` of one TSV export into one entity table
//! - **Identifier Propagation**: harvest ids rewritten to production ids
//! - **Content Aggregator**: media and articles attached to pages
//! - **Publisher**: the stage orchestrator tying the above together
//!
//! Runs are submitted to a durable apalis queue and drained by the
//! `publish-worker` binary; the `publish` CLI is the operator surface.

pub mod config;
pub mod db;
pub mod error;
pub mod publishing;

pub use error::PublishError;
