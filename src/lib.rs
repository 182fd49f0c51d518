//! vmgroup-operator - CRD-driven Kubernetes operator for vSphere VM groups
//!
//! A `VmGroup` declares "N virtual machines cloned from template T with this
//! sizing". The operator watches those declarations and drives vCenter toward
//! them: one VM folder per group, one VM per replica.
//!
//! # Architecture
//!
//! Leaves first:
//! - [`vsphere`] - Backend client for vCenter (lookups, clone, power-off, destroy)
//! - [`replicas`] - Single-step replica synchronization toward a target count
//! - [`group`] - Group lifecycle (exists, create, delete, observed count)
//! - [`controller`] - PENDING / READY / ERROR state machine and kube-rs glue
//!
//! Supporting modules:
//! - [`crd`] - The `VmGroup` Custom Resource Definition
//! - [`names`] - Unique instance name generation
//! - [`retry`] - Exponential backoff for startup calls
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod controller;
pub mod crd;
pub mod error;
pub mod group;
pub mod names;
pub mod replicas;
pub mod retry;
pub mod vsphere;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Field manager name used for server-side apply and status patches
pub const FIELD_MANAGER: &str = "vmgroup-controller";

/// Finalizer that holds a VmGroup until its vCenter folder has been cleaned up
pub const VMGROUP_FINALIZER: &str = "vsphere.vmware.com/vmgroup-cleanup";

/// Default delay before acting on an event
///
/// vCenter's inventory view can lag behind very recent mutations. Waiting a
/// few seconds reduces the odds of acting on stale inventory; it does not
/// eliminate them.
pub const DEFAULT_THROTTLE_SECS: u64 = 3;

/// Default timeout for a single vCenter HTTP request
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Default VI/JSON API release used for folder operations
pub const DEFAULT_VI_JSON_RELEASE: &str = "8.0.1.0";
