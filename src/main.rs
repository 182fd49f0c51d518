//! vmgroup-operator - keeps vCenter VM groups in sync with VmGroup resources

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vmgroup_operator::controller::{error_policy, reconcile, Context};
use vmgroup_operator::crd::VmGroup;
use vmgroup_operator::retry::{retry_with_backoff, retry_with_backoff_if, RetryConfig};
use vmgroup_operator::vsphere::{BackendError, RestClient, VsphereConfig};
use vmgroup_operator::{
    DEFAULT_REQUEST_TIMEOUT_SECS, DEFAULT_THROTTLE_SECS, DEFAULT_VI_JSON_RELEASE, FIELD_MANAGER,
};

/// vmgroup-operator - CRD-driven operator for vSphere VM groups
#[derive(Parser, Debug)]
#[command(name = "vmgroup-operator", version, about, long_about = None)]
struct Cli {
    /// Print the VmGroup CRD manifest and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller (default mode)
    ///
    /// Installs the VmGroup CRD, logs in to vCenter, then watches VmGroup
    /// resources and reconciles them until SIGTERM.
    Controller(ControllerArgs),
}

/// Controller mode arguments
#[derive(Parser, Debug)]
struct ControllerArgs {
    /// vCenter hostname or IP
    #[arg(long, env = "VC_HOST")]
    vc_host: String,

    /// vCenter HTTPS port
    #[arg(long, env = "VC_PORT", default_value_t = 443)]
    vc_port: u16,

    /// vCenter login user
    #[arg(long, env = "VC_USER")]
    vc_user: String,

    /// vCenter login password
    #[arg(long, env = "VC_PASS", hide_env_values = true)]
    vc_pass: String,

    /// Skip TLS certificate verification for vCenter
    #[arg(long, env = "VC_INSECURE", default_value_t = false)]
    vc_insecure: bool,

    /// Datacenter that holds the VM groups
    #[arg(long, env = "VC_DATACENTER")]
    vc_datacenter: String,

    /// Cluster whose resources run the clones
    #[arg(long, env = "VC_CLUSTER")]
    vc_cluster: String,

    /// Datastore that holds the clones
    #[arg(long, env = "VC_DATASTORE")]
    vc_datastore: String,

    /// Folder holding the templates; never managed as a VM group
    #[arg(long, env = "VC_TEMPLATE_FOLDER")]
    vc_template_folder: Option<String>,

    /// VI/JSON API release used for folder operations
    #[arg(long, env = "VC_API_RELEASE", default_value = DEFAULT_VI_JSON_RELEASE)]
    vc_api_release: String,

    /// Timeout for each vCenter request in seconds
    #[arg(long, env = "VC_REQUEST_TIMEOUT_SECS", default_value_t = DEFAULT_REQUEST_TIMEOUT_SECS)]
    vc_request_timeout_secs: u64,

    /// Delay before acting on each event, in seconds
    #[arg(long, env = "VMGROUP_THROTTLE_SECS", default_value_t = DEFAULT_THROTTLE_SECS)]
    throttle_secs: u64,
}

impl ControllerArgs {
    fn vsphere_config(&self) -> VsphereConfig {
        VsphereConfig {
            host: self.vc_host.clone(),
            port: self.vc_port,
            username: self.vc_user.clone(),
            password: self.vc_pass.clone(),
            insecure: self.vc_insecure,
            datacenter: self.vc_datacenter.clone(),
            cluster: self.vc_cluster.clone(),
            datastore: self.vc_datastore.clone(),
            template_folder: self.vc_template_folder.clone(),
            api_release: self.vc_api_release.clone(),
            request_timeout: Duration::from_secs(self.vc_request_timeout_secs),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&VmGroup::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    match cli.command {
        Some(Commands::Controller(args)) => run_controller(args).await,
        None => {
            // Bare invocation runs the controller with everything from the environment
            let args = ControllerArgs::try_parse_from(["vmgroup-operator"])?;
            run_controller(args).await
        }
    }
}

/// Ensure the VmGroup CRD is installed
///
/// Server-side apply keeps the installed CRD in step with the operator version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();
    let crd = VmGroup::crd();
    let patch = Patch::Apply(&crd);

    tracing::info!("Installing VmGroup CRD...");
    retry_with_backoff(&RetryConfig::startup(), "install VmGroup CRD", || {
        crds.patch("vmgroups.vsphere.vmware.com", &params, &patch)
    })
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install VmGroup CRD: {}", e))?;

    tracing::info!("VmGroup CRD installed/updated");
    Ok(())
}

/// Log in to vCenter, retrying while it is unreachable
async fn connect_vcenter(config: &VsphereConfig) -> anyhow::Result<RestClient> {
    let client = retry_with_backoff_if(
        &RetryConfig::startup(),
        "vcenter login",
        || RestClient::connect(config),
        // A missing datacenter/cluster/datastore is a config error, not an outage
        |e: &BackendError| !e.is_not_found(),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to connect to vCenter {}: {}", config.host, e))?;
    Ok(client)
}

/// Run the VmGroup controller until shutdown
async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    tracing::info!("Starting vmgroup-operator controller...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let config = args.vsphere_config();
    let vcenter = Arc::new(connect_vcenter(&config).await?);

    let ctx = Arc::new(
        Context::builder(client.clone(), vcenter.clone())
            .throttle(Duration::from_secs(args.throttle_secs))
            .reserved_folder(config.template_folder.clone())
            .build(),
    );

    let groups: Api<VmGroup> = Api::all(client.clone());

    tracing::info!(
        throttle_secs = args.throttle_secs,
        "Starting VmGroup controller"
    );

    Controller::new(groups, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx.clone())
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "VmGroup reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "VmGroup reconciliation error");
                }
            }
        })
        .await;

    let orphans = ctx.orphans().names();
    if !orphans.is_empty() {
        tracing::warn!(?orphans, "shutting down with vm groups left behind in vcenter");
    }

    vcenter.logout().await;
    tracing::info!("VmGroup controller stopped");
    Ok(())
}
