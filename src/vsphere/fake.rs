//! In-memory vCenter used by reconciler and synchronizer tests

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{BackendError, Sizing, VsphereClient};

#[derive(Default)]
struct State {
    templates: HashSet<String>,
    folders: HashMap<String, u32>,
    clone_budget: Option<u32>,
    destroy_budget: Option<u32>,
    lookup_error: Option<BackendError>,
    container_destroy_fails: bool,
    calls: Vec<&'static str>,
    last_sizing: Option<Sizing>,
}

/// Folder name -> VM count, plus failure injection
#[derive(Default)]
pub(crate) struct FakeVsphere {
    state: Mutex<State>,
}

impl FakeVsphere {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_template(self, name: &str) -> Self {
        self.state.lock().unwrap().templates.insert(name.to_string());
        self
    }

    pub(crate) fn with_group(self, name: &str, vms: u32) -> Self {
        self.state
            .lock()
            .unwrap()
            .folders
            .insert(name.to_string(), vms);
        self
    }

    /// Each clone batch succeeds `n` times, then fails
    pub(crate) fn fail_clones_after(&self, n: u32) {
        self.state.lock().unwrap().clone_budget = Some(n);
    }

    /// Each destroy batch succeeds `n` times, then fails
    pub(crate) fn fail_destroys_after(&self, n: u32) {
        self.state.lock().unwrap().destroy_budget = Some(n);
    }

    /// Every lookup returns a transport error
    pub(crate) fn fail_lookups(&self) {
        self.fail_lookups_with(BackendError::Transport {
            operation: "lookup".to_string(),
            message: "connection reset by peer".to_string(),
        });
    }

    /// Every lookup returns `error`
    pub(crate) fn fail_lookups_with(&self, error: BackendError) {
        self.state.lock().unwrap().lookup_error = Some(error);
    }

    pub(crate) fn fail_container_destroy(&self) {
        self.state.lock().unwrap().container_destroy_fails = true;
    }

    /// Clear all injected failures
    pub(crate) fn heal(&self) {
        let mut state = self.state.lock().unwrap();
        state.clone_budget = None;
        state.destroy_budget = None;
        state.lookup_error = None;
        state.container_destroy_fails = false;
    }

    /// Out-of-band change, as if someone edited vCenter by hand
    pub(crate) fn set_count(&self, name: &str, vms: u32) {
        self.state
            .lock()
            .unwrap()
            .folders
            .insert(name.to_string(), vms);
    }

    pub(crate) fn remove_group(&self, name: &str) {
        self.state.lock().unwrap().folders.remove(name);
    }

    pub(crate) fn count(&self, name: &str) -> Option<u32> {
        self.state.lock().unwrap().folders.get(name).copied()
    }

    pub(crate) fn calls(&self) -> Vec<&'static str> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Calls that change vCenter state
    pub(crate) fn mutations(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| {
                matches!(
                    **c,
                    "create_container" | "clone_vms" | "power_off_and_destroy" | "destroy_container"
                )
            })
            .count()
    }

    pub(crate) fn last_sizing(&self) -> Option<Sizing> {
        self.state.lock().unwrap().last_sizing
    }
}

#[async_trait]
impl VsphereClient for FakeVsphere {
    async fn find_template(&self, name: &str) -> Result<bool, BackendError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("find_template");
        if let Some(error) = &state.lookup_error {
            return Err(error.clone());
        }
        Ok(state.templates.contains(name))
    }

    async fn group_exists(&self, name: &str) -> Result<bool, BackendError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("group_exists");
        if let Some(error) = &state.lookup_error {
            return Err(error.clone());
        }
        Ok(state.folders.contains_key(name))
    }

    async fn create_container(&self, name: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("create_container");
        if state.folders.contains_key(name) {
            return Err(BackendError::AlreadyExists(name.to_string()));
        }
        state.folders.insert(name.to_string(), 0);
        Ok(())
    }

    async fn clone_vms(
        &self,
        template: &str,
        container: &str,
        sizing: &Sizing,
        count: u32,
    ) -> Result<u32, BackendError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("clone_vms");
        state.last_sizing = Some(*sizing);
        if !state.templates.contains(template) {
            return Err(BackendError::not_found("template", template));
        }
        let budget = state.clone_budget;
        let Some(vms) = state.folders.get_mut(container) else {
            return Err(BackendError::not_found("folder", container));
        };

        let created = budget.map_or(count, |b| b.min(count));
        *vms += created;
        if created < count {
            return Err(BackendError::CloneFailed {
                template: template.to_string(),
                created,
                message: "insufficient resources".to_string(),
            });
        }
        Ok(created)
    }

    async fn current_count(&self, container: &str) -> Result<u32, BackendError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("current_count");
        if let Some(error) = &state.lookup_error {
            return Err(error.clone());
        }
        state
            .folders
            .get(container)
            .copied()
            .ok_or_else(|| BackendError::not_found("folder", container))
    }

    async fn power_off_and_destroy(
        &self,
        container: &str,
        count: u32,
    ) -> Result<u32, BackendError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("power_off_and_destroy");
        let budget = state.destroy_budget;
        let Some(vms) = state.folders.get_mut(container) else {
            return Err(BackendError::not_found("folder", container));
        };

        let wanted = count.min(*vms);
        let destroyed = budget.map_or(wanted, |b| b.min(wanted));
        *vms -= destroyed;
        if destroyed < wanted {
            return Err(BackendError::DestroyFailed {
                container: container.to_string(),
                destroyed,
                message: "vm is locked".to_string(),
            });
        }
        Ok(destroyed)
    }

    async fn destroy_container(&self, name: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("destroy_container");
        if state.container_destroy_fails {
            return Err(BackendError::DestroyFailed {
                container: name.to_string(),
                destroyed: 0,
                message: "folder is locked".to_string(),
            });
        }
        state.folders.remove(name);
        Ok(())
    }
}
