//! Integration tests for VmGroup CRD operations
//!
//! These tests tell the story of how users and the controller interact with
//! VmGroup resources through the Kubernetes API. The controller's own
//! Kubernetes writes go through `KubeClientImpl`, the same code the operator
//! runs in production.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};

use vmgroup_operator::controller::{KubeClient, KubeClientImpl};
use vmgroup_operator::crd::{VmGroup, VmGroupPhase, VmGroupSpec, VmGroupStatus};
use vmgroup_operator::VMGROUP_FINALIZER;

use super::helpers::{cleanup_group, ensure_test_cluster};

// =============================================================================
// Test Fixtures
// =============================================================================

fn sample_group(name: &str, replicas: u32) -> VmGroup {
    VmGroup {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: VmGroupSpec {
            template: "ubuntu-22.04-template".to_string(),
            replicas,
            cpu: 2,
            memory_mb: 4096,
        },
        status: None,
    }
}

// =============================================================================
// User Stories
// =============================================================================

/// Story: a user declares a VM group and reads it back unchanged
///
/// Expected behavior:
/// - The VmGroup is accepted by the API server's schema validation
/// - Every spec field survives the round trip in camelCase form
/// - No status exists until the controller writes one
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_user_declares_vm_group() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let api: Api<VmGroup> = Api::all(client.clone());
    let name = "test-declare";
    cleanup_group(&client, name).await;

    let created = api
        .create(&PostParams::default(), &sample_group(name, 3))
        .await
        .expect("failed to create vm group");
    assert_eq!(created.metadata.generation, Some(1));

    let fetched = api.get(name).await.expect("failed to get vm group");
    assert_eq!(fetched.spec.template, "ubuntu-22.04-template");
    assert_eq!(fetched.spec.replicas, 3);
    assert_eq!(fetched.spec.memory_mb, 4096);
    assert!(fetched.status.is_none());

    cleanup_group(&client, name).await;
}

/// Story: a user scales a group by patching replicas, which bumps the
/// generation the controller compares against
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_user_scales_vm_group() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let api: Api<VmGroup> = Api::all(client.clone());
    let name = "test-scale";
    cleanup_group(&client, name).await;

    api.create(&PostParams::default(), &sample_group(name, 2))
        .await
        .expect("failed to create vm group");

    let patch = serde_json::json!({ "spec": { "replicas": 5 } });
    let scaled = api
        .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .expect("failed to scale vm group");

    assert_eq!(scaled.spec.replicas, 5);
    assert_eq!(scaled.metadata.generation, Some(2));

    cleanup_group(&client, name).await;
}

// =============================================================================
// Controller Write Stories
// =============================================================================

/// Story: the controller's status write lands on the status subresource
/// without touching the spec or the generation
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_controller_writes_status() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let api: Api<VmGroup> = Api::all(client.clone());
    let kube = KubeClientImpl::new(client.clone());
    let name = "test-status";
    cleanup_group(&client, name).await;

    api.create(&PostParams::default(), &sample_group(name, 3))
        .await
        .expect("failed to create vm group");

    let status = VmGroupStatus::with_phase(VmGroupPhase::Ready)
        .replicas(3, 3)
        .message("successfully deployed vm group \"test-status\"")
        .observed_generation(Some(1));
    kube.patch_status(name, &status)
        .await
        .expect("failed to patch status");

    let fetched = api.get(name).await.expect("failed to get vm group");
    let written = fetched.status.expect("status should be set");
    assert_eq!(written.phase, VmGroupPhase::Ready);
    assert_eq!(written.current_replicas, 3);
    assert_eq!(written.observed_generation, Some(1));
    assert_eq!(fetched.metadata.generation, Some(1));

    cleanup_group(&client, name).await;
}

/// Story: the cleanup finalizer holds a deleted group until the controller
/// releases it
///
/// Expected behavior:
/// - Adding the finalizer twice leaves exactly one entry
/// - Deleting the resource only sets the deletion timestamp
/// - Removing the finalizer lets the API server finish the delete
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_finalizer_holds_deleted_group() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let api: Api<VmGroup> = Api::all(client.clone());
    let kube = KubeClientImpl::new(client.clone());
    let name = "test-finalizer";
    cleanup_group(&client, name).await;

    api.create(&PostParams::default(), &sample_group(name, 1))
        .await
        .expect("failed to create vm group");

    kube.add_finalizer(name)
        .await
        .expect("failed to add finalizer");
    kube.add_finalizer(name)
        .await
        .expect("second add should be a no-op");

    let fetched = api.get(name).await.expect("failed to get vm group");
    assert_eq!(
        fetched.metadata.finalizers,
        Some(vec![VMGROUP_FINALIZER.to_string()])
    );

    api.delete(name, &DeleteParams::default())
        .await
        .expect("failed to delete vm group");
    let terminating = api.get(name).await.expect("group should still exist");
    assert!(terminating.metadata.deletion_timestamp.is_some());

    kube.remove_finalizer(name)
        .await
        .expect("failed to remove finalizer");

    let mut gone = false;
    for _ in 0..20 {
        if api.get_opt(name).await.expect("get should succeed").is_none() {
            gone = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    }
    assert!(gone, "group should be deleted once the finalizer is removed");

    // Removing from a group that no longer exists is not an error
    kube.remove_finalizer(name)
        .await
        .expect("remove on a missing group should succeed");
}
