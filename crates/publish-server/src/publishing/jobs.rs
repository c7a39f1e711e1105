//! Job definitions for the publishing queue

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishKind {
    /// Purge, reload and rebuild everything the resource contributes
    Full,
    /// Reload the resource's traits only
    TraitsOnly,
}

/// Publish job payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishJob {
    pub resource_id: i64,
    pub kind: PublishKind,
    /// Operator or system that asked for the run
    pub requested_by: Option<String>,
    pub requested_at: DateTime<Utc>,
}

impl PublishJob {
    pub fn full(resource_id: i64) -> Self {
        Self {
            resource_id,
            kind: PublishKind::Full,
            requested_by: None,
            requested_at: Utc::now(),
        }
    }

    pub fn traits_only(resource_id: i64) -> Self {
        Self {
            kind: PublishKind::TraitsOnly,
            ..Self::full(resource_id)
        }
    }

    pub fn with_requested_by(mut self, who: impl Into<String>) -> Self {
        self.requested_by = Some(who.into());
        self
    }
}
