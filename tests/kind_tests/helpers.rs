//! Shared setup for the kind integration tests

use std::time::Duration;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use vmgroup_operator::crd::VmGroup;
use vmgroup_operator::FIELD_MANAGER;

const CRD_NAME: &str = "vmgroups.vsphere.vmware.com";

/// Connect to the cluster and make sure the VmGroup CRD is installed and
/// established
pub async fn ensure_test_cluster() -> Result<Client, String> {
    let client = Client::try_default()
        .await
        .map_err(|e| format!("no usable kubeconfig: {}", e))?;

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    crds.patch(
        CRD_NAME,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(&VmGroup::crd()),
    )
    .await
    .map_err(|e| format!("failed to install CRD: {}", e))?;

    for _ in 0..30 {
        let crd = crds
            .get(CRD_NAME)
            .await
            .map_err(|e| format!("failed to read CRD: {}", e))?;
        let established = crd
            .status
            .and_then(|s| s.conditions)
            .unwrap_or_default()
            .iter()
            .any(|c| c.type_ == "Established" && c.status == "True");
        if established {
            return Ok(client);
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    Err("VmGroup CRD never became established".to_string())
}

/// Delete a VmGroup, stripping finalizers first so no controller is needed
pub async fn cleanup_group(client: &Client, name: &str) {
    let api: Api<VmGroup> = Api::all(client.clone());
    let strip = serde_json::json!({ "metadata": { "finalizers": null } });
    let _ = api
        .patch(name, &PatchParams::default(), &Patch::Merge(&strip))
        .await;
    let _ = api.delete(name, &DeleteParams::default()).await;

    for _ in 0..20 {
        if matches!(api.get_opt(name).await, Ok(None)) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}
