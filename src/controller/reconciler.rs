//! VmGroup state machine
//!
//! Pure decision logic: given one event (desired spec plus the last status
//! this controller wrote), drive the group one step toward the spec and say
//! what the new status is. Knows nothing about Kubernetes; the kube-rs glue
//! in the sibling module builds events and applies outcomes.
//!
//! ```text
//! (no status) ──▶ PENDING ──▶ READY
//!                   │  ▲        │
//!                   │  └─drift──┘
//!                   ▼
//!                 ERROR ──(spec generation changes)──▶ PENDING logic
//! ```

use tracing::{debug, info, warn};

use crate::crd::{VmGroupPhase, VmGroupSpec, VmGroupStatus};
use crate::group::{CreateOutcome, GroupManager};
use crate::vsphere::BackendError;
use crate::Error;

/// Kind of change that triggered a reconcile
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// The resource was created or its spec changed, or a periodic requeue
    Upsert,
    /// The resource is being deleted
    Delete,
}

/// Everything the state machine needs to know about one resource
#[derive(Clone, Debug)]
pub struct ReconcileEvent {
    /// What happened
    pub kind: EventKind,
    /// Group name, also the vCenter folder name
    pub name: String,
    /// Desired state
    pub spec: VmGroupSpec,
    /// Status written by the previous reconcile, if any
    pub status: Option<VmGroupStatus>,
    /// `metadata.generation` of `spec`
    pub generation: Option<i64>,
}

impl ReconcileEvent {
    /// An UPSERT event
    pub fn upsert(name: impl Into<String>, spec: VmGroupSpec) -> Self {
        Self {
            kind: EventKind::Upsert,
            name: name.into(),
            spec,
            status: None,
            generation: None,
        }
    }

    /// A DELETE event
    pub fn delete(name: impl Into<String>, spec: VmGroupSpec) -> Self {
        Self {
            kind: EventKind::Delete,
            ..Self::upsert(name, spec)
        }
    }

    /// Attach the last written status
    pub fn with_status(mut self, status: Option<VmGroupStatus>) -> Self {
        self.status = status;
        self
    }

    /// Attach the spec generation
    pub fn with_generation(mut self, generation: Option<i64>) -> Self {
        self.generation = generation;
        self
    }

    fn phase(&self) -> VmGroupPhase {
        self.status
            .as_ref()
            .map(|s| s.phase)
            .unwrap_or(VmGroupPhase::Pending)
    }

    /// Returns true if the spec moved on since the last status was written
    fn spec_changed(&self) -> bool {
        let observed = self.status.as_ref().and_then(|s| s.observed_generation);
        match (self.generation, observed) {
            (Some(generation), Some(observed)) => generation != observed,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

/// What to do with the resource's status after a reconcile
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    /// Write this status
    Status(VmGroupStatus),
    /// Keep the last status as is
    Unchanged,
    /// The resource is gone; there is nowhere to write a status
    Deleted,
}

impl Outcome {
    /// The status to write, if any
    pub fn status(&self) -> Option<&VmGroupStatus> {
        match self {
            Self::Status(status) => Some(status),
            _ => None,
        }
    }
}

/// The VmGroup state machine
pub struct Reconciler {
    groups: GroupManager,
}

impl Reconciler {
    /// Create a reconciler over the given group manager
    pub fn new(groups: GroupManager) -> Self {
        Self { groups }
    }

    /// Group manager used by this reconciler
    pub fn groups(&self) -> &GroupManager {
        &self.groups
    }

    /// Handle one event
    ///
    /// Never fails: backend problems become ERROR or PENDING statuses, and
    /// deletion problems go to the orphan registry.
    pub async fn reconcile(&self, event: &ReconcileEvent) -> Outcome {
        if event.kind == EventKind::Delete {
            info!(group = %event.name, "deleting vm group");
            self.groups.delete(&event.name).await;
            return Outcome::Deleted;
        }

        match event.phase() {
            VmGroupPhase::Pending => self.converge(event).await,
            VmGroupPhase::Ready => self.check_drift(event).await,
            VmGroupPhase::Error if event.spec_changed() => {
                info!(group = %event.name, "spec changed, retrying errored vm group");
                self.converge(event).await
            }
            VmGroupPhase::Error => {
                debug!(group = %event.name, "vm group in error, waiting for a spec change");
                Outcome::Unchanged
            }
        }
    }

    /// PENDING: create the group or move its replica count toward the spec
    async fn converge(&self, event: &ReconcileEvent) -> Outcome {
        let name = event.name.as_str();
        let spec = &event.spec;
        let desired = spec.replicas;

        if self.groups.is_reserved(name) {
            return failed(
                event,
                format!("vm group \"{}\" collides with the template folder", name),
            );
        }

        if let Err(e) = spec.validate() {
            let message = match e {
                Error::Validation(message) => message,
                other => other.to_string(),
            };
            return failed(event, message);
        }

        match self.groups.template_valid(&spec.template).await {
            Ok(true) => {}
            Ok(false) => {
                return failed(
                    event,
                    format!("invalid template \"{}\" specified", spec.template),
                )
            }
            Err(e) => {
                return lookup_failed(
                    event,
                    format!("could not look up template \"{}\"", spec.template),
                    e,
                )
            }
        }

        let exists = match self.groups.exists(name).await {
            Ok(exists) => exists,
            Err(e) => return group_lookup_failed(event, e),
        };

        if exists {
            let current = match self.groups.observed_count(name).await {
                Ok(current) => current,
                Err(e) => return group_lookup_failed(event, e),
            };
            let count = self.groups.sync(name, spec, current).await;
            let phase = if count == desired {
                VmGroupPhase::Ready
            } else {
                VmGroupPhase::Pending
            };
            info!(group = name, current = count, desired, %phase, "synced replica count");
            return Outcome::Status(
                status(event, phase)
                    .replicas(count, desired)
                    .message("synced replica count"),
            );
        }

        match self.groups.create(name, spec).await {
            CreateOutcome::Failed(reason) => {
                failed(event, format!("error creating vm group instances: {}", reason))
            }
            CreateOutcome::Created(count) if count == desired => {
                info!(group = name, replicas = count, "vm group deployed");
                Outcome::Status(
                    status(event, VmGroupPhase::Ready)
                        .replicas(count, desired)
                        .message(format!("successfully deployed vm group \"{}\"", name)),
                )
            }
            CreateOutcome::Created(count) => Outcome::Status(
                status(event, VmGroupPhase::Pending)
                    .replicas(count, desired)
                    .message(format!(
                        "created vm group \"{}\" and waiting for VMs to become ready",
                        name
                    )),
            ),
        }
    }

    /// READY: verify the group still matches the spec
    async fn check_drift(&self, event: &ReconcileEvent) -> Outcome {
        let name = event.name.as_str();
        let desired = event.spec.replicas;

        match self.groups.exists(name).await {
            Ok(true) => {}
            Ok(false) => {
                return failed(
                    event,
                    format!(
                        "custom resource exists but vm group \"{}\" not found in vcenter",
                        name
                    ),
                )
            }
            Err(e) => return group_lookup_failed(event, e),
        }

        let current = match self.groups.observed_count(name).await {
            Ok(current) => current,
            Err(e) => return group_lookup_failed(event, e),
        };

        if current != desired {
            info!(group = name, current, desired, "drift detected");
            return Outcome::Status(
                status(event, VmGroupPhase::Pending)
                    .replicas(current, desired)
                    .message(format!(
                        "vm group \"{}\" out of sync, submitting for resync",
                        name
                    )),
            );
        }

        if event.spec_changed() {
            // In sync, but record the generation the status now reflects
            return Outcome::Status(
                status(event, VmGroupPhase::Ready)
                    .replicas(current, desired)
                    .message("synced replica count"),
            );
        }

        Outcome::Unchanged
    }
}

fn status(event: &ReconcileEvent, phase: VmGroupPhase) -> VmGroupStatus {
    VmGroupStatus::with_phase(phase).observed_generation(event.generation)
}

fn failed(event: &ReconcileEvent, message: String) -> Outcome {
    warn!(group = %event.name, %message, "vm group failed");
    Outcome::Status(
        status(event, VmGroupPhase::Error)
            .replicas(0, event.spec.replicas)
            .message(message),
    )
}

/// A vCenter query failed
///
/// Outages leave the group PENDING with its last known counts so the next
/// pass tries again; anything else needs a fix and is an ERROR.
fn lookup_failed(event: &ReconcileEvent, what: String, error: BackendError) -> Outcome {
    let message = format!("{}: {}", what, error);
    if !error.is_transient() {
        return failed(event, message);
    }

    warn!(group = %event.name, %message, "vcenter unavailable, will retry");
    let previous = event.status.as_ref();
    Outcome::Status(
        VmGroupStatus::with_phase(VmGroupPhase::Pending)
            .replicas(
                previous.map_or(0, |s| s.current_replicas),
                event.spec.replicas,
            )
            .message(message)
            .observed_generation(previous.and_then(|s| s.observed_generation)),
    )
}

fn group_lookup_failed(event: &ReconcileEvent, error: BackendError) -> Outcome {
    lookup_failed(
        event,
        format!("could not look up vm group \"{}\"", event.name),
        error,
    )
}
