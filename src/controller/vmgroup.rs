//! kube-rs glue for the VmGroup state machine
//!
//! Turns a watched `VmGroup` into a [`ReconcileEvent`], writes the resulting
//! status back through the status subresource, and picks the requeue interval.
//! A finalizer holds deleted resources until their vCenter folder has been
//! cleaned up (or recorded as an orphan).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument};

#[cfg(test)]
use mockall::automock;

use super::reconciler::{Outcome, ReconcileEvent, Reconciler};
use crate::crd::{VmGroup, VmGroupPhase, VmGroupStatus};
use crate::group::{GroupManager, OrphanRegistry};
use crate::vsphere::VsphereClient;
use crate::{Error, DEFAULT_THROTTLE_SECS, FIELD_MANAGER, VMGROUP_FINALIZER};

/// Requeue interval while a group is still converging
pub const PENDING_REQUEUE: Duration = Duration::from_secs(10);

/// Requeue interval for READY groups; each pass is a drift check
pub const READY_REQUEUE: Duration = Duration::from_secs(60);

const FINALIZER_REQUEUE: Duration = Duration::from_secs(1);
const ERROR_POLICY_REQUEUE: Duration = Duration::from_secs(5);

/// Trait abstracting the Kubernetes writes the controller makes
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Patch the status of a VmGroup
    async fn patch_status(&self, name: &str, status: &VmGroupStatus) -> Result<(), Error>;

    /// Add the cleanup finalizer to a VmGroup
    async fn add_finalizer(&self, name: &str) -> Result<(), Error>;

    /// Remove the cleanup finalizer from a VmGroup
    async fn remove_finalizer(&self, name: &str) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self) -> Api<VmGroup> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn patch_status(&self, name: &str, status: &VmGroupStatus) -> Result<(), Error> {
        let status_patch = serde_json::json!({
            "status": status
        });

        self.api()
            .patch_status(
                name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&status_patch),
            )
            .await?;

        Ok(())
    }

    async fn add_finalizer(&self, name: &str) -> Result<(), Error> {
        let api = self.api();
        let group = api.get(name).await?;
        let mut finalizers = group.metadata.finalizers.unwrap_or_default();

        if finalizers.iter().any(|f| f == VMGROUP_FINALIZER) {
            return Ok(());
        }
        finalizers.push(VMGROUP_FINALIZER.to_string());

        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;

        Ok(())
    }

    async fn remove_finalizer(&self, name: &str) -> Result<(), Error> {
        let api = self.api();
        let group = match api.get(name).await {
            Ok(group) => group,
            Err(kube::Error::Api(resp)) if resp.code == 404 => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let finalizers: Vec<String> = group
            .metadata
            .finalizers
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != VMGROUP_FINALIZER)
            .collect();

        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;

        Ok(())
    }
}

/// Controller context shared across all reconciles
pub struct Context {
    /// Kubernetes writes (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// The VmGroup state machine
    pub reconciler: Reconciler,
    /// Best-effort delay before acting on an UPSERT
    ///
    /// vCenter inventory can lag behind very recent changes; waiting a little
    /// makes acting on a stale view less likely. It is not a guarantee.
    pub throttle: Duration,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client, backend: Arc<dyn VsphereClient>) -> ContextBuilder {
        ContextBuilder::new(client, backend)
    }

    /// Groups whose vCenter cleanup failed
    pub fn orphans(&self) -> &OrphanRegistry {
        self.reconciler.groups().orphans()
    }

    /// Create a context for testing with mock clients and no throttle
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn KubeClient>, backend: Arc<dyn VsphereClient>) -> Self {
        Self {
            kube,
            reconciler: Reconciler::new(GroupManager::new(backend)),
            throttle: Duration::ZERO,
        }
    }
}

/// Builder for constructing [`Context`] instances
///
/// ```ignore
/// let ctx = Context::builder(client, Arc::new(vcenter))
///     .throttle(Duration::from_secs(3))
///     .reserved_folder(Some("templates".into()))
///     .build();
/// ```
pub struct ContextBuilder {
    client: Client,
    backend: Arc<dyn VsphereClient>,
    kube: Option<Arc<dyn KubeClient>>,
    throttle: Duration,
    reserved_folder: Option<String>,
    orphans: Option<OrphanRegistry>,
}

impl ContextBuilder {
    fn new(client: Client, backend: Arc<dyn VsphereClient>) -> Self {
        Self {
            client,
            backend,
            kube: None,
            throttle: Duration::from_secs(DEFAULT_THROTTLE_SECS),
            reserved_folder: None,
            orphans: None,
        }
    }

    /// Set the delay before acting on an UPSERT
    pub fn throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    /// Folder holding templates; never managed as a group
    pub fn reserved_folder(mut self, folder: Option<String>) -> Self {
        self.reserved_folder = folder;
        self
    }

    /// Share an orphan registry with the embedder
    pub fn orphans(mut self, orphans: OrphanRegistry) -> Self {
        self.orphans = Some(orphans);
        self
    }

    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let mut groups =
            GroupManager::new(self.backend).with_reserved_folder(self.reserved_folder);
        if let Some(orphans) = self.orphans {
            groups = groups.with_orphans(orphans);
        }

        Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client))),
            reconciler: Reconciler::new(groups),
            throttle: self.throttle,
        }
    }
}

/// Reconcile a VmGroup resource
///
/// Only Kubernetes API failures are returned as errors; everything vCenter
/// does wrong ends up in the status.
#[instrument(skip(group, ctx), fields(vmgroup = %group.name_any()))]
pub async fn reconcile(group: Arc<VmGroup>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = group.name_any();

    if group.metadata.deletion_timestamp.is_some() {
        if has_finalizer(&group) {
            let event = ReconcileEvent::delete(&name, group.spec.clone())
                .with_status(group.status.clone());
            ctx.reconciler.reconcile(&event).await;
            ctx.kube.remove_finalizer(&name).await?;
            info!("cleanup finalizer removed");
        }
        return Ok(Action::await_change());
    }

    if !has_finalizer(&group) {
        info!("adding cleanup finalizer");
        ctx.kube.add_finalizer(&name).await?;
        return Ok(Action::requeue(FINALIZER_REQUEUE));
    }

    if !ctx.throttle.is_zero() {
        tokio::time::sleep(ctx.throttle).await;
    }

    let event = ReconcileEvent::upsert(&name, group.spec.clone())
        .with_status(group.status.clone())
        .with_generation(group.metadata.generation);

    let phase = match ctx.reconciler.reconcile(&event).await {
        Outcome::Status(status) => {
            ctx.kube.patch_status(&name, &status).await?;
            debug!(phase = %status.phase, "status updated");
            status.phase
        }
        Outcome::Unchanged => group
            .status
            .as_ref()
            .map(|s| s.phase)
            .unwrap_or_default(),
        Outcome::Deleted => return Ok(Action::await_change()),
    };

    Ok(requeue_for(phase))
}

/// Error policy for the controller
///
/// Called when reconcile returns an error, which only happens when a
/// Kubernetes API call fails.
pub fn error_policy(group: Arc<VmGroup>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        vmgroup = %group.name_any(),
        "reconciliation failed"
    );
    Action::requeue(ERROR_POLICY_REQUEUE)
}

fn requeue_for(phase: VmGroupPhase) -> Action {
    match phase {
        VmGroupPhase::Pending => Action::requeue(PENDING_REQUEUE),
        VmGroupPhase::Ready => Action::requeue(READY_REQUEUE),
        VmGroupPhase::Error => Action::await_change(),
    }
}

fn has_finalizer(group: &VmGroup) -> bool {
    group
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|s| s == VMGROUP_FINALIZER))
}
