//! VM group lifecycle
//!
//! A VM group is one vCenter folder in the datacenter's VM folder plus the VMs
//! directly inside it. [`GroupManager`] creates, deletes and counts groups on
//! top of the backend client; replica convergence is delegated to
//! [`crate::replicas::sync`].

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};

use crate::crd::VmGroupSpec;
use crate::replicas;
use crate::vsphere::{BackendError, VsphereClient};

/// Result of creating a group
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    /// Folder exists and this many instances were created
    ///
    /// May be short of the requested count if cloning stopped early.
    Created(u32),
    /// The group could not be set up at all
    Failed(String),
}

/// Groups whose vCenter cleanup failed after their resource went away
///
/// Keyed by group name, holding the last failure. Cheap to clone; all clones
/// share the same entries.
#[derive(Clone, Debug, Default)]
pub struct OrphanRegistry {
    entries: Arc<DashMap<String, String>>,
}

impl OrphanRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failed cleanup
    pub fn record(&self, group: &str, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(group, orphan = true, error = %reason, "vm group left behind in vcenter");
        self.entries.insert(group.to_string(), reason);
    }

    /// Forget a group, returning true if it was recorded
    pub fn clear(&self, group: &str) -> bool {
        self.entries.remove(group).is_some()
    }

    /// Last recorded failure for a group
    pub fn get(&self, group: &str) -> Option<String> {
        self.entries.get(group).map(|e| e.value().clone())
    }

    /// Names of all orphaned groups, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Number of orphaned groups
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is orphaned
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Group operations over a shared backend client
pub struct GroupManager {
    client: Arc<dyn VsphereClient>,
    orphans: OrphanRegistry,
    reserved_folder: Option<String>,
}

impl GroupManager {
    /// Create a manager over the given backend client
    pub fn new(client: Arc<dyn VsphereClient>) -> Self {
        Self {
            client,
            orphans: OrphanRegistry::new(),
            reserved_folder: None,
        }
    }

    /// Folder that holds templates and must never be managed as a group
    pub fn with_reserved_folder(mut self, folder: Option<String>) -> Self {
        self.reserved_folder = folder.filter(|f| !f.is_empty());
        self
    }

    /// Share an existing orphan registry
    pub fn with_orphans(mut self, orphans: OrphanRegistry) -> Self {
        self.orphans = orphans;
        self
    }

    /// Registry of groups whose cleanup failed
    pub fn orphans(&self) -> &OrphanRegistry {
        &self.orphans
    }

    /// Returns true if `name` is the reserved template folder
    pub fn is_reserved(&self, name: &str) -> bool {
        self.reserved_folder.as_deref() == Some(name)
    }

    /// Check whether the group's folder exists
    pub async fn exists(&self, name: &str) -> Result<bool, BackendError> {
        self.client.group_exists(name).await
    }

    /// Check whether a template VM with this name exists
    pub async fn template_valid(&self, template: &str) -> Result<bool, BackendError> {
        self.client.find_template(template).await
    }

    /// Instances currently in the group's folder
    pub async fn observed_count(&self, name: &str) -> Result<u32, BackendError> {
        self.client.current_count(name).await
    }

    /// Create the group's folder and clone the initial instances
    ///
    /// A folder that already exists is adopted: its instances are counted and
    /// only the missing ones are cloned.
    pub async fn create(&self, name: &str, spec: &VmGroupSpec) -> CreateOutcome {
        let current = match self.client.create_container(name).await {
            Ok(()) => 0,
            Err(BackendError::AlreadyExists(_)) => {
                info!(group = name, "folder already exists, adopting it");
                match self.client.current_count(name).await {
                    Ok(n) => n,
                    Err(e) => return CreateOutcome::Failed(e.to_string()),
                }
            }
            Err(e) => {
                return CreateOutcome::Failed(format!("could not create folder \"{}\": {}", name, e))
            }
        };

        match self.client.find_template(&spec.template).await {
            Ok(true) => {}
            Ok(false) => {
                return CreateOutcome::Failed(format!(
                    "invalid template \"{}\" specified",
                    spec.template
                ))
            }
            Err(e) => return CreateOutcome::Failed(e.to_string()),
        }

        let count = self.sync(name, spec, current).await;
        info!(group = name, replicas = count, desired = spec.replicas, "vm group created");
        CreateOutcome::Created(count)
    }

    /// Converge an existing group from `current` toward `spec.replicas`
    pub async fn sync(&self, name: &str, spec: &VmGroupSpec, current: u32) -> u32 {
        replicas::sync(
            self.client.as_ref(),
            name,
            &spec.template,
            &spec.sizing(),
            current,
            spec.replicas,
        )
        .await
    }

    /// Destroy the group's instances and folder, best-effort
    ///
    /// Failures never propagate; they land in the orphan registry.
    pub async fn delete(&self, name: &str) {
        if self.is_reserved(name) {
            warn!(group = name, "refusing to delete the template folder");
            return;
        }

        match self.client.destroy_container(name).await {
            Ok(()) => {
                if self.orphans.clear(name) {
                    info!(group = name, "previously orphaned vm group cleaned up");
                }
                info!(group = name, "vm group deleted");
            }
            Err(e) => self.orphans.record(name, e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vsphere::fake::FakeVsphere;

    fn spec(replicas: u32) -> VmGroupSpec {
        VmGroupSpec {
            template: "base".to_string(),
            replicas,
            cpu: 1,
            memory_mb: 1024,
        }
    }

    fn manager(fake: FakeVsphere) -> (GroupManager, Arc<FakeVsphere>) {
        let fake = Arc::new(fake);
        (GroupManager::new(fake.clone()), fake)
    }

    // =========================================================================
    // Creation Stories
    // =========================================================================

    /// Story: creating a group makes the folder and clones every replica
    #[tokio::test]
    async fn story_create_builds_folder_and_replicas() {
        let (groups, fake) = manager(FakeVsphere::new().with_template("base"));

        let outcome = groups.create("web", &spec(3)).await;

        assert_eq!(outcome, CreateOutcome::Created(3));
        assert_eq!(fake.count("web"), Some(3));
    }

    /// Story: a partial clone failure still yields Created, with the short count
    #[tokio::test]
    async fn story_partial_create_reports_short_count() {
        let (groups, fake) = manager(FakeVsphere::new().with_template("base"));
        fake.fail_clones_after(1);

        let outcome = groups.create("web", &spec(3)).await;
        assert_eq!(outcome, CreateOutcome::Created(1));
    }

    /// Story: a folder left over from an earlier attempt is reused, and only
    /// the missing replicas are cloned
    #[tokio::test]
    async fn story_existing_folder_is_adopted() {
        let (groups, fake) = manager(
            FakeVsphere::new()
                .with_template("base")
                .with_group("web", 2),
        );

        let outcome = groups.create("web", &spec(3)).await;

        assert_eq!(outcome, CreateOutcome::Created(3));
        assert_eq!(fake.count("web"), Some(3));
    }

    /// Story: an unknown template fails creation with a message naming it
    #[tokio::test]
    async fn story_unknown_template_fails_creation() {
        let (groups, fake) = manager(FakeVsphere::new());

        match groups.create("web", &spec(2)).await {
            CreateOutcome::Failed(msg) => assert_eq!(msg, "invalid template \"base\" specified"),
            other => panic!("expected Failed, got {:?}", other),
        }
        assert!(!fake.calls().contains(&"clone_vms"));
    }

    #[tokio::test]
    async fn test_zero_replica_group_creates_empty_folder() {
        let (groups, fake) = manager(FakeVsphere::new().with_template("base"));

        assert_eq!(groups.create("web", &spec(0)).await, CreateOutcome::Created(0));
        assert_eq!(fake.count("web"), Some(0));
        assert!(!fake.calls().contains(&"clone_vms"));
    }

    // =========================================================================
    // Deletion Stories
    // =========================================================================

    /// Story: deleting a group removes the folder and leaves no orphan behind
    #[tokio::test]
    async fn story_delete_removes_folder() {
        let (groups, fake) = manager(FakeVsphere::new().with_group("web", 2));

        groups.delete("web").await;

        assert_eq!(fake.count("web"), None);
        assert!(groups.orphans().is_empty());
    }

    /// Story: a failed delete is recorded as an orphan instead of vanishing
    #[tokio::test]
    async fn story_failed_delete_is_recorded_as_orphan() {
        let (groups, fake) = manager(FakeVsphere::new().with_group("web", 2));
        fake.fail_container_destroy();

        groups.delete("web").await;

        assert_eq!(groups.orphans().names(), vec!["web".to_string()]);
        assert!(groups
            .orphans()
            .get("web")
            .is_some_and(|msg| msg.contains("folder is locked")));
    }

    /// Story: a later successful delete clears the orphan record
    #[tokio::test]
    async fn story_successful_retry_clears_orphan() {
        let (groups, fake) = manager(FakeVsphere::new().with_group("web", 2));
        fake.fail_container_destroy();
        groups.delete("web").await;
        assert_eq!(groups.orphans().len(), 1);

        fake.heal();
        groups.delete("web").await;
        assert!(groups.orphans().is_empty());
    }

    /// Story: the template folder is never deleted, even if a group shares its name
    #[tokio::test]
    async fn story_template_folder_is_never_deleted() {
        let fake = Arc::new(FakeVsphere::new().with_group("templates", 4));
        let groups =
            GroupManager::new(fake.clone()).with_reserved_folder(Some("templates".to_string()));

        groups.delete("templates").await;

        assert_eq!(fake.count("templates"), Some(4));
        assert!(fake.calls().is_empty());
    }

    #[test]
    fn test_empty_reserved_folder_is_ignored() {
        let groups = GroupManager::new(Arc::new(FakeVsphere::new()))
            .with_reserved_folder(Some(String::new()));
        assert!(!groups.is_reserved(""));
    }

    #[test]
    fn test_orphan_registry_is_shared_between_clones() {
        let registry = OrphanRegistry::new();
        let view = registry.clone();

        registry.record("db", "timeout");
        assert_eq!(view.get("db").as_deref(), Some("timeout"));
        assert!(view.clear("db"));
        assert!(registry.is_empty());
    }
}
