//! Shared types for the VmGroup CRD

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Format used for `status.lastUpdated`
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Reconciliation phase of a VmGroup
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum VmGroupPhase {
    /// Group is being converged toward its desired replica count
    #[default]
    Pending,
    /// Backend replica count matches the spec
    Ready,
    /// Group needs a spec change before it is retried
    Error,
}

impl std::fmt::Display for VmGroupPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Ready => write!(f, "READY"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// Render a status timestamp
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Current UTC time rendered as a status timestamp
pub fn timestamp_now() -> String {
    format_timestamp(Utc::now())
}
