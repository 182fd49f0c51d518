//! Custom Resource Definitions for the VmGroup operator

mod types;
mod vmgroup;

pub use types::{format_timestamp, timestamp_now, VmGroupPhase, TIMESTAMP_FORMAT};
pub use vmgroup::{VmGroup, VmGroupSpec, VmGroupStatus};
