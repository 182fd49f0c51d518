//! Integration tests for the VmGroup CRD
//!
//! - `crd_operations`: creating, reading, scaling and deleting VmGroup
//!   resources through the Kubernetes API, including the status subresource
//!   and the cleanup finalizer

mod crd_operations;
mod helpers;
