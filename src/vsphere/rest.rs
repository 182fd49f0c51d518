//! vCenter client over HTTP
//!
//! Inventory lookups and VM lifecycle go through the vSphere Automation REST
//! API (`/api/...`). Folder create/destroy has no REST equivalent, so those
//! two calls use the VI/JSON API (`/sdk/vim25/{release}/...`), which accepts
//! the same session token.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use super::{
    select_for_removal, BackendError, PowerState, Sizing, VmSummary, VsphereClient, VsphereConfig,
};
use crate::names::{NameGenerator, RandomNames};

const SESSION_HEADER: &str = "vmware-api-session-id";
const TASK_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Deserialize)]
struct DatacenterSummary {
    datacenter: String,
}

#[derive(Deserialize)]
struct ClusterSummary {
    cluster: String,
}

#[derive(Deserialize)]
struct DatastoreSummary {
    datastore: String,
}

#[derive(Deserialize)]
struct FolderSummary {
    folder: String,
    name: String,
}

#[derive(Deserialize)]
struct VmListEntry {
    vm: String,
    name: String,
    power_state: String,
}

impl From<VmListEntry> for VmSummary {
    fn from(entry: VmListEntry) -> Self {
        let power_state = match entry.power_state.as_str() {
            "POWERED_OFF" => PowerState::PoweredOff,
            "SUSPENDED" => PowerState::Suspended,
            _ => PowerState::PoweredOn,
        };
        Self {
            id: entry.vm,
            name: entry.name,
            power_state,
        }
    }
}

/// VI/JSON managed object reference
#[derive(Deserialize)]
struct ManagedObjectReference {
    value: String,
}

#[derive(Deserialize)]
struct TaskInfo {
    state: String,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct CloneSpec<'a> {
    source: &'a str,
    name: &'a str,
    placement: Placement<'a>,
    power_on: bool,
    hardware_customization: HardwareCustomization,
}

#[derive(Serialize)]
struct Placement<'a> {
    folder: &'a str,
    cluster: &'a str,
    datastore: &'a str,
}

#[derive(Serialize)]
struct HardwareCustomization {
    cpu_update: CpuUpdate,
    memory_update: MemoryUpdate,
}

#[derive(Serialize)]
struct CpuUpdate {
    num_cpus: u32,
}

/// Memory override, in MiB
#[derive(Serialize)]
struct MemoryUpdate {
    memory: u32,
}

/// Error body shared by both APIs
///
/// REST faults carry `error_type` + `messages`, VI/JSON faults carry
/// `_typeName` + `faultMessage`.
#[derive(Default, Deserialize)]
struct FaultBody {
    #[serde(default)]
    error_type: Option<String>,
    #[serde(default)]
    messages: Vec<LocalizableMessage>,
    #[serde(rename = "_typeName", default)]
    type_name: Option<String>,
    #[serde(rename = "faultMessage", default)]
    fault_message: Vec<LocalizableMessage>,
}

#[derive(Deserialize)]
struct LocalizableMessage {
    #[serde(default, alias = "message")]
    default_message: String,
}

/// A non-success response, decoded
struct Fault {
    status: StatusCode,
    kind: Option<String>,
    message: String,
}

impl Fault {
    async fn from_response(response: Response) -> Self {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let parsed: FaultBody = serde_json::from_str(&body).unwrap_or_default();

        let kind = parsed.error_type.or(parsed.type_name);
        let message = parsed
            .messages
            .iter()
            .chain(parsed.fault_message.iter())
            .map(|m| m.default_message.as_str())
            .find(|m| !m.is_empty())
            .map(str::to_string)
            .or_else(|| kind.clone())
            .unwrap_or(body);

        Self {
            status,
            kind,
            message,
        }
    }

    fn is(&self, kind: &str) -> bool {
        self.kind.as_deref() == Some(kind)
    }

    fn into_error(self, operation: &str) -> BackendError {
        BackendError::Api {
            operation: operation.to_string(),
            status: self.status.as_u16(),
            message: self.message,
        }
    }
}

/// Object ids every call is scoped to, resolved once at connect time
#[derive(Clone, Debug, Default)]
struct Scope {
    datacenter: String,
    cluster: String,
    datastore: String,
}

struct Credentials {
    username: String,
    password: String,
}

/// vCenter client holding one authenticated session
///
/// The session is renewed transparently when vCenter stops accepting it
/// (idle timeout, vCenter restart).
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    api_release: String,
    credentials: Credentials,
    session: RwLock<String>,
    scope: Scope,
    task_timeout: Duration,
    names: Arc<dyn NameGenerator>,
}

impl RestClient {
    /// Log in to the configured vCenter and resolve the datacenter, cluster
    /// and datastore names
    pub async fn connect(config: &VsphereConfig) -> Result<Self, BackendError> {
        Self::connect_at(&config.base_url(), config).await
    }

    /// Like [`RestClient::connect`], against an explicit base URL
    pub async fn connect_at(base_url: &str, config: &VsphereConfig) -> Result<Self, BackendError> {
        if config.insecure {
            warn!("TLS certificate verification disabled for vCenter connection");
        }

        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.insecure)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| BackendError::Session(format!("failed to build HTTP client: {}", e)))?;

        let base_url = base_url.trim_end_matches('/').to_string();
        let credentials = Credentials {
            username: config.username.clone(),
            password: config.password.clone(),
        };
        let session = login(&http, &base_url, &credentials).await?;

        let mut client = Self {
            http,
            base_url,
            api_release: config.api_release.clone(),
            credentials,
            session: RwLock::new(session),
            scope: Scope::default(),
            task_timeout: config.request_timeout,
            names: Arc::new(RandomNames),
        };
        client.scope = client.resolve_scope(config).await?;

        info!(
            datacenter = %config.datacenter,
            cluster = %config.cluster,
            datastore = %config.datastore,
            "connected to vCenter"
        );
        Ok(client)
    }

    /// Replace the instance name generator
    pub fn with_name_generator(mut self, names: Arc<dyn NameGenerator>) -> Self {
        self.names = names;
        self
    }

    /// End the session
    pub async fn logout(&self) {
        let result = self.send("logout", self.request(Method::DELETE, "/api/session")).await;
        if let Err(e) = result {
            warn!(error = %e, "failed to close vCenter session");
        }
    }

    async fn resolve_scope(&self, config: &VsphereConfig) -> Result<Scope, BackendError> {
        let datacenter = self
            .get_json::<Vec<DatacenterSummary>>(
                "list datacenters",
                "/api/vcenter/datacenter",
                &[("names", config.datacenter.as_str())],
            )
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::not_found("datacenter", &config.datacenter))?
            .datacenter;

        let cluster = self
            .get_json::<Vec<ClusterSummary>>(
                "list clusters",
                "/api/vcenter/cluster",
                &[
                    ("names", config.cluster.as_str()),
                    ("datacenters", datacenter.as_str()),
                ],
            )
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::not_found("cluster", &config.cluster))?
            .cluster;

        let datastore = self
            .get_json::<Vec<DatastoreSummary>>(
                "list datastores",
                "/api/vcenter/datastore",
                &[
                    ("names", config.datastore.as_str()),
                    ("datacenters", datacenter.as_str()),
                ],
            )
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::not_found("datastore", &config.datastore))?
            .datastore;

        Ok(Scope {
            datacenter,
            cluster,
            datastore,
        })
    }

    // =========================================================================
    // Request plumbing
    // =========================================================================

    /// Start a request; the session header is added when it is sent
    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
    }

    fn vi_json_path(&self, object_type: &str, id: &str, member: &str) -> String {
        format!(
            "/sdk/vim25/{}/{}/{}/{}",
            self.api_release, object_type, id, member
        )
    }

    /// Send a request, mapping only transport failures
    ///
    /// A 401 means the session expired: log in again once and replay the
    /// request with the new token.
    async fn send_raw(
        &self,
        operation: &str,
        request: RequestBuilder,
    ) -> Result<Response, BackendError> {
        let replay = request.try_clone();
        let token = self.session.read().await.clone();
        let response = self.dispatch(operation, request, &token).await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }
        let Some(replay) = replay else {
            return Ok(response);
        };

        info!(operation, "vCenter session expired, logging in again");
        let token = self.renew_session(&token).await?;
        self.dispatch(operation, replay, &token).await
    }

    async fn dispatch(
        &self,
        operation: &str,
        request: RequestBuilder,
        token: &str,
    ) -> Result<Response, BackendError> {
        request
            .header(SESSION_HEADER, token)
            .send()
            .await
            .map_err(|e| BackendError::Transport {
                operation: operation.to_string(),
                message: e.to_string(),
            })
    }

    /// Replace `stale` with a fresh session, unless a concurrent request
    /// already did
    async fn renew_session(&self, stale: &str) -> Result<String, BackendError> {
        let mut session = self.session.write().await;
        if *session == stale {
            *session = login(&self.http, &self.base_url, &self.credentials).await?;
        }
        Ok(session.clone())
    }

    /// Send a request and fail on any non-success status
    async fn send(&self, operation: &str, request: RequestBuilder) -> Result<Response, BackendError> {
        let response = self.send_raw(operation, request).await?;
        check(response)
            .await
            .map_err(|fault| fault.into_error(operation))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, BackendError> {
        let response = self
            .send(operation, self.request(Method::GET, path).query(query))
            .await?;
        decode(operation, response).await
    }

    // =========================================================================
    // Inventory lookups
    // =========================================================================

    async fn find_vms_named(&self, name: &str) -> Result<Vec<VmListEntry>, BackendError> {
        self.get_json(
            "find vm",
            "/api/vcenter/vm",
            &[("names", name), ("datacenters", self.scope.datacenter.as_str())],
        )
        .await
    }

    async fn find_folder(&self, name: &str) -> Result<Option<String>, BackendError> {
        let folders: Vec<FolderSummary> = self
            .get_json(
                "find folder",
                "/api/vcenter/folder",
                &[
                    ("names", name),
                    ("type", "VIRTUAL_MACHINE"),
                    ("datacenters", self.scope.datacenter.as_str()),
                ],
            )
            .await?;

        Ok(folders
            .into_iter()
            .find(|f| f.name == name)
            .map(|f| f.folder))
    }

    async fn require_folder(&self, name: &str) -> Result<String, BackendError> {
        self.find_folder(name)
            .await?
            .ok_or_else(|| BackendError::not_found("folder", name))
    }

    async fn list_folder_vms(&self, folder: &str) -> Result<Vec<VmSummary>, BackendError> {
        let entries: Vec<VmListEntry> = self
            .get_json("list folder vms", "/api/vcenter/vm", &[("folders", folder)])
            .await?;
        Ok(entries.into_iter().map(VmSummary::from).collect())
    }

    // =========================================================================
    // VM lifecycle
    // =========================================================================

    async fn power_off(&self, vm: &VmSummary) -> Result<(), BackendError> {
        if vm.power_state == PowerState::PoweredOff {
            return Ok(());
        }

        info!(vm = %vm.name, "powering off VM");
        let operation = "power off vm";
        let path = format!("/api/vcenter/vm/{}/power", vm.id);
        let request = self
            .request(Method::POST, &path)
            .query(&[("action", "stop")]);

        match check(self.send_raw(operation, request).await?).await {
            Ok(_) => Ok(()),
            Err(fault) if fault.is("ALREADY_IN_DESIRED_STATE") => Ok(()),
            Err(fault) => Err(fault.into_error(operation)),
        }
    }

    async fn delete_vm(&self, vm: &VmSummary) -> Result<(), BackendError> {
        info!(vm = %vm.name, "deleting VM");
        let operation = "delete vm";
        let path = format!("/api/vcenter/vm/{}", vm.id);

        match check(self.send_raw(operation, self.request(Method::DELETE, &path)).await?).await {
            Ok(_) => Ok(()),
            Err(fault) if fault.status == StatusCode::NOT_FOUND => {
                debug!(vm = %vm.name, "VM already gone");
                Ok(())
            }
            Err(fault) => Err(fault.into_error(operation)),
        }
    }

    /// Power off and delete one VM, describing the failing step
    async fn retire_vm(&self, vm: &VmSummary) -> Result<(), String> {
        self.power_off(vm)
            .await
            .map_err(|e| format!("could not power off virtual machine \"{}\": {}", vm.name, e))?;
        self.delete_vm(vm)
            .await
            .map_err(|e| format!("could not delete virtual machine \"{}\": {}", vm.name, e))
    }

    async fn wait_for_task(&self, task: &str) -> Result<(), BackendError> {
        let operation = "wait for task";
        let deadline = tokio::time::Instant::now() + self.task_timeout;
        let path = self.vi_json_path("Task", task, "info");

        loop {
            let info: TaskInfo = self.get_json(operation, &path, &[]).await?;
            match info.state.as_str() {
                "success" => return Ok(()),
                "error" => {
                    let message = info
                        .error
                        .as_ref()
                        .and_then(|e| e.get("localizedMessage"))
                        .and_then(|m| m.as_str())
                        .unwrap_or("task failed")
                        .to_string();
                    return Err(BackendError::Api {
                        operation: operation.to_string(),
                        status: StatusCode::OK.as_u16(),
                        message,
                    });
                }
                _ => {}
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(BackendError::Transport {
                    operation: operation.to_string(),
                    message: format!("task {} did not finish in {:?}", task, self.task_timeout),
                });
            }
            tokio::time::sleep(TASK_POLL_INTERVAL).await;
        }
    }
}

async fn login(
    http: &reqwest::Client,
    base_url: &str,
    credentials: &Credentials,
) -> Result<String, BackendError> {
    let response = http
        .post(format!("{}/api/session", base_url))
        .basic_auth(&credentials.username, Some(&credentials.password))
        .send()
        .await
        .map_err(|e| BackendError::Session(format!("login request failed: {}", e)))?;

    if !response.status().is_success() {
        return Err(BackendError::Session(format!(
            "login rejected with status {}",
            response.status()
        )));
    }

    response
        .json::<String>()
        .await
        .map_err(|e| BackendError::Session(format!("invalid session token: {}", e)))
}

async fn check(response: Response) -> Result<Response, Fault> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(Fault::from_response(response).await)
    }
}

async fn decode<T: DeserializeOwned>(operation: &str, response: Response) -> Result<T, BackendError> {
    response.json::<T>().await.map_err(|e| BackendError::Transport {
        operation: operation.to_string(),
        message: format!("invalid response body: {}", e),
    })
}

#[async_trait]
impl VsphereClient for RestClient {
    #[instrument(skip(self))]
    async fn find_template(&self, name: &str) -> Result<bool, BackendError> {
        Ok(!self.find_vms_named(name).await?.is_empty())
    }

    #[instrument(skip(self))]
    async fn group_exists(&self, name: &str) -> Result<bool, BackendError> {
        Ok(self.find_folder(name).await?.is_some())
    }

    #[instrument(skip(self))]
    async fn create_container(&self, name: &str) -> Result<(), BackendError> {
        if self.find_folder(name).await?.is_some() {
            return Err(BackendError::AlreadyExists(name.to_string()));
        }

        let parent: ManagedObjectReference = self
            .get_json(
                "find vm root folder",
                &self.vi_json_path("Datacenter", &self.scope.datacenter, "vmFolder"),
                &[],
            )
            .await?;

        let operation = "create folder";
        let path = self.vi_json_path("Folder", &parent.value, "CreateFolder");
        let request = self
            .request(Method::POST, &path)
            .json(&serde_json::json!({ "name": name }));

        match check(self.send_raw(operation, request).await?).await {
            Ok(_) => {
                info!(folder = %name, "created VM folder");
                Ok(())
            }
            Err(fault) if fault.is("DuplicateName") => {
                Err(BackendError::AlreadyExists(name.to_string()))
            }
            Err(fault) => Err(fault.into_error(operation)),
        }
    }

    #[instrument(skip(self, sizing))]
    async fn clone_vms(
        &self,
        template: &str,
        container: &str,
        sizing: &Sizing,
        count: u32,
    ) -> Result<u32, BackendError> {
        let source = self
            .find_vms_named(template)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::not_found("template", template))?
            .vm;
        let folder = self.require_folder(container).await?;

        let mut created = 0;
        while created < count {
            let name = self.names.generate();
            info!(vm = %name, template, "creating VM from template");

            let spec = CloneSpec {
                source: &source,
                name: &name,
                placement: Placement {
                    folder: &folder,
                    cluster: &self.scope.cluster,
                    datastore: &self.scope.datastore,
                },
                power_on: true,
                hardware_customization: HardwareCustomization {
                    cpu_update: CpuUpdate {
                        num_cpus: sizing.cpu,
                    },
                    memory_update: MemoryUpdate {
                        memory: sizing.memory_mb,
                    },
                },
            };
            let request = self
                .request(Method::POST, "/api/vcenter/vm")
                .query(&[("action", "clone")])
                .json(&spec);

            if let Err(e) = self.send("clone vm", request).await {
                return Err(BackendError::CloneFailed {
                    template: template.to_string(),
                    created,
                    message: e.to_string(),
                });
            }
            created += 1;
        }

        Ok(created)
    }

    #[instrument(skip(self))]
    async fn current_count(&self, container: &str) -> Result<u32, BackendError> {
        let folder = self.require_folder(container).await?;
        let vms = self.list_folder_vms(&folder).await?;
        Ok(vms.len() as u32)
    }

    #[instrument(skip(self))]
    async fn power_off_and_destroy(
        &self,
        container: &str,
        count: u32,
    ) -> Result<u32, BackendError> {
        let folder = self.require_folder(container).await?;
        let vms = self.list_folder_vms(&folder).await?;

        let mut destroyed = 0;
        for vm in select_for_removal(&vms, count as usize) {
            if let Err(message) = self.retire_vm(vm).await {
                return Err(BackendError::DestroyFailed {
                    container: container.to_string(),
                    destroyed,
                    message,
                });
            }
            destroyed += 1;
        }

        Ok(destroyed)
    }

    #[instrument(skip(self))]
    async fn destroy_container(&self, name: &str) -> Result<(), BackendError> {
        let Some(folder) = self.find_folder(name).await? else {
            debug!(folder = %name, "folder already gone");
            return Ok(());
        };

        let vms = self.list_folder_vms(&folder).await?;
        for (destroyed, vm) in vms.iter().enumerate() {
            if let Err(message) = self.retire_vm(vm).await {
                return Err(BackendError::DestroyFailed {
                    container: name.to_string(),
                    destroyed: destroyed as u32,
                    message,
                });
            }
        }

        let operation = "destroy folder";
        let path = self.vi_json_path("Folder", &folder, "Destroy_Task");
        let task: ManagedObjectReference =
            match check(self.send_raw(operation, self.request(Method::POST, &path)).await?).await {
                Ok(response) => decode(operation, response).await?,
                Err(fault) if fault.is("ManagedObjectNotFound") => {
                    debug!(folder = %name, "folder vanished before destroy");
                    return Ok(());
                }
                Err(fault) => {
                    return Err(BackendError::DestroyFailed {
                        container: name.to_string(),
                        destroyed: vms.len() as u32,
                        message: format!("could not delete folder \"{}\": {}", name, fault.message),
                    })
                }
            };

        self.wait_for_task(&task.value)
            .await
            .map_err(|e| BackendError::DestroyFailed {
                container: name.to_string(),
                destroyed: vms.len() as u32,
                message: format!("could not delete folder \"{}\": {}", name, e),
            })?;

        info!(folder = %name, instances = vms.len(), "destroyed VM folder");
        Ok(())
    }
}
