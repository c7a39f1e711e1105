//! Publishing operator CLI
//!
//! - **publish** / **traits**: queue a full or trait-only publish, or run it
//!   in the foreground with `--now`
//! - **load-file**: load and propagate one table from a file on disk
//! - **update-attributes**: rewrite a few columns of already published rows
//! - **all-clear**: force-close runs left open by a crashed worker
//! - **status**: the latest import log of a resource

pub mod commands;

use clap::{Parser, Subcommand};
use publish_server::publishing::EntityType;
use std::path::PathBuf;

/// Publish harvested resources into the production store
#[derive(Parser, Debug)]
#[command(name = "publish")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Purge and republish everything a resource contributes
    Publish {
        resource_id: i64,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Republish a resource's traits only
    Traits {
        resource_id: i64,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Load one table from a local file and propagate its ids
    LoadFile {
        resource_id: i64,

        /// Entity class or table name (e.g. `Medium` or `media`)
        entity: EntityType,

        /// TSV export; it is never deleted
        path: PathBuf,
    },

    /// Rewrite selected columns of a published table from a fresh export
    UpdateAttributes {
        resource_id: i64,

        /// Entity class or table name
        entity: EntityType,

        /// Columns to update
        #[arg(required = true, num_args = 1..)]
        fields: Vec<String>,

        /// Read the export from this directory instead of the harvester
        #[arg(long)]
        from_dir: Option<PathBuf>,
    },

    /// Force-close every open run and import log
    AllClear {
        /// Skip the confirmation check
        #[arg(short, long)]
        yes: bool,
    },

    /// Show the latest import log of a resource
    Status {
        resource_id: i64,

        /// Number of most recent events to show
        #[arg(short, long, default_value_t = 20)]
        events: usize,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[derive(clap::Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Run in the foreground instead of queueing
    #[arg(long)]
    pub now: bool,

    /// Read exports from this directory instead of the harvester
    #[arg(long, requires = "now")]
    pub from_dir: Option<PathBuf>,
}
