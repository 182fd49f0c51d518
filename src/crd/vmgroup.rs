//! VmGroup Custom Resource Definition
//!
//! A VmGroup declares a named set of virtual machines cloned from one vCenter
//! template. The resource name doubles as the vCenter folder name, so the
//! resource is cluster-scoped: one name, one folder.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{timestamp_now, VmGroupPhase};
use crate::vsphere::Sizing;

/// Specification for a VmGroup
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "vsphere.vmware.com",
    version = "v1alpha1",
    kind = "VmGroup",
    plural = "vmgroups",
    shortname = "vmg",
    status = "VmGroupStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Current","type":"integer","jsonPath":".status.currentReplicas"}"#,
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Template","type":"string","jsonPath":".spec.template"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VmGroupSpec {
    /// Name of the vCenter VM to clone
    ///
    /// Must be a plain (powered-off) VM, not one marked as a vSphere
    /// template: the lookup only sees regular VMs.
    #[serde(default)]
    pub template: String,

    /// Desired number of VM instances
    #[serde(default)]
    pub replicas: u32,

    /// vCPUs per instance
    pub cpu: u32,

    /// Memory per instance in MiB
    pub memory_mb: u32,
}

impl VmGroupSpec {
    /// CPU/memory override applied to every clone
    pub fn sizing(&self) -> Sizing {
        Sizing {
            cpu: self.cpu,
            memory_mb: self.memory_mb,
        }
    }

    /// Validate the group specification
    ///
    /// Only checks what can be decided without talking to vCenter; whether
    /// the template actually exists is checked by the reconciler.
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.template.trim().is_empty() {
            return Err(crate::Error::validation(
                "no template specified, check your deployment spec",
            ));
        }
        if self.cpu == 0 {
            return Err(crate::Error::validation("cpu must be at least 1"));
        }
        if self.memory_mb == 0 {
            return Err(crate::Error::validation("memoryMb must be at least 1"));
        }
        Ok(())
    }
}

/// Status for a VmGroup
///
/// Written only by the reconciler and read back by it on the next event.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VmGroupStatus {
    /// Current reconciliation phase
    #[serde(default)]
    pub phase: VmGroupPhase,

    /// UTC time of the last status write (`%Y-%m-%d %H:%M:%S`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,

    /// Instances observed in the vCenter folder at the last reconcile
    #[serde(default)]
    pub current_replicas: u32,

    /// Desired replica count mirrored from the spec at the last reconcile
    #[serde(default)]
    pub desired_replicas: u32,

    /// Human-readable explanation of the last action or error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,

    /// `metadata.generation` of the spec this status was computed against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl VmGroupStatus {
    /// Create a new status with the given phase, stamped with the current time
    pub fn with_phase(phase: VmGroupPhase) -> Self {
        Self {
            phase,
            last_updated: Some(timestamp_now()),
            ..Default::default()
        }
    }

    /// Set current and desired replica counts
    pub fn replicas(mut self, current: u32, desired: u32) -> Self {
        self.current_replicas = current;
        self.desired_replicas = desired;
        self
    }

    /// Set the message and return self for chaining
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.last_message = Some(msg.into());
        self
    }

    /// Record the spec generation this status reflects
    pub fn observed_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }
}
