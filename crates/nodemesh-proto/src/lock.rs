/// Cluster-wide lock identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Category used for the locks that serialize scheduled jobs.
pub const CRON_LOCK_CATEGORY: &str = "cron";

/// An opaque named resource used for cluster-wide mutual exclusion.
///
/// Two locks are the same lock exactly when category and resource match.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lock {
    pub category: String,
    pub resource: String,
}

impl Lock {
    pub fn new(category: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            resource: resource.into(),
        }
    }

    /// The lock guarding one scheduled job.
    pub fn cron(job_name: &str) -> Self {
        Self::new(CRON_LOCK_CATEGORY, job_name)
    }
}

impl fmt::Display for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.category, self.resource)
    }
}

/// What a lock negotiation is trying to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockIntent {
    Acquire,
    Release,
}

impl fmt::Display for LockIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockIntent::Acquire => f.write_str("acquire"),
            LockIntent::Release => f.write_str("release"),
        }
    }
}

/// Whether `a` wins a dispute with `b` over the same lock.
///
/// The lexicographically smaller node name always has priority.
pub fn has_priority(a: &str, b: &str) -> bool {
    a < b
}
