//! Store/cluster divergences left behind by failed compensating actions.

use std::fmt;

use chrono::{DateTime, Utc};
use ufleet_core::TenancyKey;

/// What went wrong, and the store content needed to put it right.
#[derive(Debug, Clone, PartialEq)]
pub enum Divergence {
    /// Create: the record was written, the cluster create failed, the record could not be removed.
    OrphanRecord,
    /// Update: the new record was written, the cluster update failed, the old record could not be restored.
    StaleRecord { previous: String },
    /// Delete: the record was removed, the cluster delete failed, the record could not be restored.
    MissingRecord { previous: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Inconsistency {
    pub tenancy: TenancyKey,
    pub name: String,
    pub divergence: Divergence,
    pub detected: DateTime<Utc>,
    pub attempts: u32,
}

impl Inconsistency {
    pub fn new(tenancy: TenancyKey, name: &str, divergence: Divergence) -> Self {
        Self { tenancy, name: name.to_string(), divergence, detected: Utc::now(), attempts: 0 }
    }
}

impl fmt::Display for Inconsistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.divergence {
            Divergence::OrphanRecord => "orphan record",
            Divergence::StaleRecord { .. } => "stale record",
            Divergence::MissingRecord { .. } => "missing record",
        };
        write!(f, "{} {}/{}", what, self.tenancy, self.name)
    }
}

/// Outcome of one repair pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairReport {
    pub repaired: usize,
    pub remaining: usize,
}
