//! VmGroup controller
//!
//! [`Reconciler`] is the PENDING / READY / ERROR state machine and has no
//! Kubernetes dependency. [`reconcile`] and [`error_policy`] plug it into a
//! kube-rs `Controller`.

mod reconciler;
mod vmgroup;

pub use reconciler::{EventKind, Outcome, ReconcileEvent, Reconciler};
pub use vmgroup::{
    error_policy, reconcile, Context, ContextBuilder, KubeClient, KubeClientImpl, PENDING_REQUEUE,
    READY_REQUEUE,
};
