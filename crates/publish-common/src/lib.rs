//! Publishing Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared utilities for the publishing workspace members:
//!
//! - **Logging**: `tracing` subscriber setup shared by the worker and the CLI
//! - **Text**: character-bounded chunking and line counting used by the
//!   import log and the bulk loader
//!
//! # Example
//!
//! ```no_run
//! use publish_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     init_logging(&LogConfig::from_env()?)?;
//!     tracing::info!("ready");
//!     Ok(())
//! }
//! ```

pub mod logging;
pub mod text;
