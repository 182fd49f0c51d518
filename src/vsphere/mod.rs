//! vCenter backend client
//!
//! The narrow set of primitives the reconciler needs from the virtualization
//! plane: lookups by name, folder create/destroy, clone, power-off, destroy.
//!
//! Every operation re-resolves names to live objects instead of holding on to
//! references. vCenter inventory can change underneath the operator at any
//! time, so a cached handle may already point at a deleted object.

mod rest;

#[cfg(test)]
pub(crate) mod fake;

use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;

pub use rest::RestClient;

/// CPU/memory override applied to each clone
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sizing {
    /// Number of vCPUs
    pub cpu: u32,
    /// Memory size in MiB
    pub memory_mb: u32,
}

/// Errors returned by backend primitives
#[derive(Clone, Debug, Error, PartialEq)]
pub enum BackendError {
    /// The named object does not exist
    #[error("{kind} \"{name}\" not found")]
    NotFound {
        /// Object kind (vm, folder, datacenter, ...)
        kind: &'static str,
        /// Object name
        name: String,
    },

    /// A folder with this name already exists
    #[error("folder \"{0}\" already exists")]
    AlreadyExists(String),

    /// A clone batch stopped early
    #[error("cloning \"{template}\" failed after {created} instance(s): {message}")]
    CloneFailed {
        /// Template being cloned
        template: String,
        /// Instances created before the failure
        created: u32,
        /// Underlying failure
        message: String,
    },

    /// A destroy batch stopped early
    #[error("destroying instances in \"{container}\" failed after {destroyed} instance(s): {message}")]
    DestroyFailed {
        /// Folder being drained
        container: String,
        /// Instances destroyed before the failure
        destroyed: u32,
        /// Underlying failure
        message: String,
    },

    /// vCenter answered with a non-success status
    #[error("vcenter returned {status} for {operation}: {message}")]
    Api {
        /// Operation that was attempted
        operation: String,
        /// HTTP status code
        status: u16,
        /// Error detail extracted from the response body
        message: String,
    },

    /// The request never produced a response
    #[error("transport error during {operation}: {message}")]
    Transport {
        /// Operation that was attempted
        operation: String,
        /// Underlying failure
        message: String,
    },

    /// Login or session handling failed
    #[error("session error: {0}")]
    Session(String),
}

impl BackendError {
    /// Create a not-found error
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Instances created or destroyed before a batch failed
    pub fn partial_progress(&self) -> u32 {
        match self {
            Self::CloneFailed { created, .. } => *created,
            Self::DestroyFailed { destroyed, .. } => *destroyed,
            _ => 0,
        }
    }

    /// Returns true if this error means the object is absent
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if the same call may succeed later without any change
    ///
    /// Lost connections, session trouble and vCenter-side failures (5xx,
    /// timeouts, throttling) are transient. Absent objects and rejected
    /// requests are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::Session(_) => true,
            Self::Api { status, .. } => *status >= 500 || matches!(status, 401 | 408 | 429),
            _ => false,
        }
    }
}

/// Trait abstracting vCenter operations
///
/// All operations are scoped to the datacenter, cluster and datastore the
/// client was configured with. Implementations hold their own session handle;
/// callers never share mutable state with them.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VsphereClient: Send + Sync {
    /// Check whether a VM (template) with this name exists
    ///
    /// Absence is `Ok(false)`, not an error.
    async fn find_template(&self, name: &str) -> Result<bool, BackendError>;

    /// Check whether a VM folder with this name exists
    async fn group_exists(&self, name: &str) -> Result<bool, BackendError>;

    /// Create a VM folder under the datacenter's VM folder
    ///
    /// Fails with [`BackendError::AlreadyExists`] if it is already present;
    /// callers that want "ensure exists" semantics must tolerate that.
    async fn create_container(&self, name: &str) -> Result<(), BackendError>;

    /// Clone `template` into `container` `count` times, one at a time
    ///
    /// Each clone is powered on and gets a freshly generated name. Returns the
    /// number created. The first failure stops the batch with
    /// [`BackendError::CloneFailed`] carrying the count created so far.
    async fn clone_vms(
        &self,
        template: &str,
        container: &str,
        sizing: &Sizing,
        count: u32,
    ) -> Result<u32, BackendError>;

    /// Count the VMs currently inside `container`
    async fn current_count(&self, container: &str) -> Result<u32, BackendError>;

    /// Power off and destroy `count` VMs from `container`, newest first
    ///
    /// The first failure stops the batch with [`BackendError::DestroyFailed`]
    /// carrying the count destroyed so far.
    async fn power_off_and_destroy(&self, container: &str, count: u32)
        -> Result<u32, BackendError>;

    /// Destroy every VM in `container`, then the folder itself
    ///
    /// A folder that is already gone counts as success.
    async fn destroy_container(&self, name: &str) -> Result<(), BackendError>;
}

/// Power state of a VM as reported by vCenter
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PowerState {
    /// Running
    PoweredOn,
    /// Stopped
    PoweredOff,
    /// Suspended to disk
    Suspended,
}

/// Minimal view of a VM inside a group folder
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmSummary {
    /// Managed object id, e.g. `vm-1042`
    pub id: String,
    /// Display name
    pub name: String,
    /// Current power state
    pub power_state: PowerState,
}

impl VmSummary {
    /// Numeric part of the managed object id, if it has one
    fn sequence(&self) -> Option<u64> {
        self.id.rsplit('-').next().and_then(|n| n.parse().ok())
    }
}

/// Pick which VMs to remove on scale-down
///
/// Newest first: vCenter hands out `vm-N` ids in increasing order, so the
/// highest id is the most recently created VM. Ids without a numeric suffix
/// sort after every numbered one; ties fall back to the id string so the
/// choice is deterministic.
pub fn select_for_removal(vms: &[VmSummary], count: usize) -> Vec<&VmSummary> {
    let mut ordered: Vec<&VmSummary> = vms.iter().collect();
    ordered.sort_by(|a, b| {
        b.sequence()
            .cmp(&a.sequence())
            .then_with(|| b.id.cmp(&a.id))
    });
    ordered.truncate(count);
    ordered
}

/// Connection and scope settings for the vCenter client
#[derive(Clone, Debug)]
pub struct VsphereConfig {
    /// vCenter hostname or IP
    pub host: String,
    /// HTTPS port
    pub port: u16,
    /// Login user
    pub username: String,
    /// Login password
    pub password: String,
    /// Skip TLS certificate verification
    pub insecure: bool,
    /// Datacenter that scopes every lookup
    pub datacenter: String,
    /// Cluster whose resource pool receives clones
    pub cluster: String,
    /// Datastore that receives clones
    pub datastore: String,
    /// Folder holding the templates; never treated as a VM group
    pub template_folder: Option<String>,
    /// VI/JSON API release used for folder operations
    pub api_release: String,
    /// Timeout applied to every HTTP request
    pub request_timeout: Duration,
}

impl VsphereConfig {
    /// Base URL of the vCenter endpoint
    pub fn base_url(&self) -> String {
        if self.port == 443 {
            format!("https://{}", self.host)
        } else {
            format!("https://{}:{}", self.host, self.port)
        }
    }
}
