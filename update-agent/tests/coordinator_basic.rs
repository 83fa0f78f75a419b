// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end coordinator tests over simulated modules: the basic FSM
//! transitions, version gating, and image verification.

mod common;

use std::sync::atomic::Ordering;

use common::{Harness, SimComponent};
use update_agent::errors::Error;
use update_agent_common::{ComponentState, UpdateState};

#[tokio::test(flavor = "multi_thread")]
async fn happy_path_single_component() {
    let harness = Harness::new();
    let m1 = SimComponent::new("m1");
    let coordinator = harness.coordinator(std::slice::from_ref(&m1)).await;

    let status = coordinator.status().await;
    assert_eq!(status.state, UpdateState::Idle);
    assert_eq!(status.components.len(), 1);
    assert_eq!(status.components[0].status, ComponentState::Installed);
    assert_eq!(status.components[0].vendor_version, "1.0");

    // prepare: Idle -> Prepared, component Installing.
    let request = harness.image_request("m1", "2.0", 5);
    coordinator.prepare(vec![request]).await.unwrap();
    coordinator.wait_settled().await;

    let status = coordinator.status().await;
    assert_eq!(status.state, UpdateState::Prepared);
    assert_eq!(status.error, "");
    assert_eq!(status.components[0].status, ComponentState::Installing);
    assert_eq!(m1.counters.prepare.load(Ordering::SeqCst), 1);

    // update: Prepared -> Updated, no reboot demanded.
    coordinator.update().await.unwrap();
    coordinator.wait_settled().await;

    let status = coordinator.status().await;
    assert_eq!(status.state, UpdateState::Updated);
    assert_eq!(status.components[0].status, ComponentState::InstalledUpdated);
    assert_eq!(m1.counters.update.load(Ordering::SeqCst), 1);
    assert_eq!(harness.platform.reboot_count(), 0);

    // apply: Updated -> Idle, versions committed.
    coordinator.apply().await.unwrap();
    coordinator.wait_settled().await;

    let status = coordinator.status().await;
    assert_eq!(status.state, UpdateState::Idle);
    assert_eq!(status.error, "");
    let m1_status = &status.components[0];
    assert_eq!(m1_status.status, ComponentState::Installed);
    assert_eq!(m1_status.aos_version, 5);
    assert_eq!(m1_status.vendor_version, "2.0");

    let store = harness.store();
    assert_eq!(store.aos_version("m1").unwrap(), 5);
    assert_eq!(store.vendor_version("m1").unwrap(), "2.0");

    // The download directory is recreated empty on Idle entry.
    let entries: Vec<_> = std::fs::read_dir(harness.download_dir())
        .unwrap()
        .collect();
    assert!(entries.is_empty());

    coordinator.shutdown().await;
    assert_eq!(m1.counters.close.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn events_rejected_in_wrong_state() {
    let harness = Harness::new();
    let m1 = SimComponent::new("m1");
    let coordinator = harness.coordinator(std::slice::from_ref(&m1)).await;

    // Everything but prepare is illegal in Idle.
    for err in [
        coordinator.update().await.unwrap_err(),
        coordinator.apply().await.unwrap_err(),
        coordinator.revert().await.unwrap_err(),
    ] {
        assert!(matches!(err, Error::WrongState { .. }), "{err}");
    }

    let request = harness.image_request("m1", "2.0", 5);
    coordinator.prepare(vec![request.clone()]).await.unwrap();
    coordinator.wait_settled().await;

    // prepare and apply are illegal in Prepared.
    let err = coordinator.prepare(vec![request]).await.unwrap_err();
    assert!(matches!(err, Error::WrongState { .. }), "{err}");
    let err = coordinator.apply().await.unwrap_err();
    assert!(matches!(err, Error::WrongState { .. }), "{err}");
}

#[tokio::test(flavor = "multi_thread")]
async fn prepare_then_revert_is_a_noop() {
    let harness = Harness::new();
    let m1 = SimComponent::new("m1");
    let coordinator = harness.coordinator(std::slice::from_ref(&m1)).await;

    let store = harness.store();
    let aos_before = store.aos_version("m1").unwrap();

    let request = harness.image_request("m1", "2.0", 5);
    coordinator.prepare(vec![request]).await.unwrap();
    coordinator.wait_settled().await;
    assert_eq!(coordinator.status().await.state, UpdateState::Prepared);

    coordinator.revert().await.unwrap();
    coordinator.wait_settled().await;

    let status = coordinator.status().await;
    assert_eq!(status.state, UpdateState::Idle);
    assert_eq!(status.error, "");
    assert_eq!(status.components[0].vendor_version, "1.0");

    // Persisted versions are back to their pre-prepare values.
    assert_eq!(store.aos_version("m1").unwrap(), aos_before);
    assert_eq!(store.vendor_version("m1").unwrap(), "1.0");
    assert_eq!(m1.counters.revert.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn downgrade_is_refused() {
    let harness = Harness::new();
    harness.store().set_aos_version("m1", 7).unwrap();

    let m1 = SimComponent::new("m1");
    let coordinator = harness.coordinator(std::slice::from_ref(&m1)).await;

    let request = harness.image_request("m1", "2.0", 5);
    coordinator.prepare(vec![request]).await.unwrap();
    coordinator.wait_settled().await;

    let status = coordinator.status().await;
    assert_eq!(status.state, UpdateState::Failed);
    assert!(status.error.contains("wrong Aos version"), "{}", status.error);
    assert_eq!(status.components[0].status, ComponentState::Error);

    // The module was never asked to stage anything.
    assert_eq!(m1.counters.prepare.load(Ordering::SeqCst), 0);

    // Only revert gets the coordinator out of Failed.
    let err = coordinator.update().await.unwrap_err();
    assert!(matches!(err, Error::WrongState { .. }), "{err}");

    coordinator.revert().await.unwrap();
    coordinator.wait_settled().await;
    let status = coordinator.status().await;
    assert_eq!(status.state, UpdateState::Idle);
    assert_eq!(status.error, "");
    assert_eq!(harness.store().aos_version("m1").unwrap(), 7);
}

#[tokio::test(flavor = "multi_thread")]
async fn repeated_version_is_refused() {
    let harness = Harness::new();
    let m1 = SimComponent::new("m1");
    let coordinator = harness.coordinator(std::slice::from_ref(&m1)).await;

    // The sim module reports vendor version 1.0 out of the box.
    let request = harness.image_request("m1", "1.0", 5);
    coordinator.prepare(vec![request]).await.unwrap();
    coordinator.wait_settled().await;

    let status = coordinator.status().await;
    assert_eq!(status.state, UpdateState::Failed);
    assert!(status.error.contains("already at version"), "{}", status.error);
    assert_eq!(m1.counters.prepare.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn integrity_failure_aborts_prepare() {
    let harness = Harness::new();
    let m1 = SimComponent::new("m1");
    let coordinator = harness.coordinator(std::slice::from_ref(&m1)).await;

    // A marker proves the download dir is left alone until Idle entry.
    let download_dir = harness.download_dir();
    std::fs::create_dir_all(&download_dir).unwrap();
    std::fs::write(download_dir.join("marker"), b"staged").unwrap();

    let mut request = harness.image_request("m1", "2.0", 5);
    request.sha256 = "0".repeat(64);
    coordinator.prepare(vec![request]).await.unwrap();
    coordinator.wait_settled().await;

    let status = coordinator.status().await;
    assert_eq!(status.state, UpdateState::Failed);
    assert!(status.error.contains("sha256 mismatch"), "{}", status.error);
    assert_eq!(m1.counters.prepare.load(Ordering::SeqCst), 0);
    assert!(download_dir.join("marker").exists());

    coordinator.revert().await.unwrap();
    coordinator.wait_settled().await;
    assert!(!download_dir.join("marker").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_component_fails_the_transition() {
    let harness = Harness::new();
    let m1 = SimComponent::new("m1");
    let coordinator = harness.coordinator(std::slice::from_ref(&m1)).await;

    let request = harness.image_request("ghost", "2.0", 5);
    coordinator.prepare(vec![request]).await.unwrap();
    coordinator.wait_settled().await;

    let status = coordinator.status().await;
    assert_eq!(status.state, UpdateState::Failed);
    assert!(status.error.contains("unknown component"), "{}", status.error);
    assert_eq!(m1.counters.prepare.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn error_statuses_survive_idle_until_next_prepare() {
    let harness = Harness::new();
    let mut m1 = SimComponent::new("m1");
    m1.behavior.fail_prepare = true;
    let coordinator = harness.coordinator(std::slice::from_ref(&m1)).await;

    let request = harness.image_request("m1", "2.0", 5);
    coordinator.prepare(vec![request]).await.unwrap();
    coordinator.wait_settled().await;
    assert_eq!(coordinator.status().await.state, UpdateState::Failed);

    // Idle re-entry purges everything except Error entries.
    coordinator.revert().await.unwrap();
    coordinator.wait_settled().await;

    let status = coordinator.status().await;
    assert_eq!(status.state, UpdateState::Idle);
    assert_eq!(status.components[0].status, ComponentState::Error);
    assert!(
        status.components[0].error.contains("injected prepare failure"),
        "{}",
        status.components[0].error
    );
    coordinator.shutdown().await;
    drop(coordinator);

    // The next prepare replaces the map, clearing the stale Error entry.
    let m1 = SimComponent::new("m1");
    let coordinator = harness.coordinator(std::slice::from_ref(&m1)).await;
    let request = harness.image_request("m1", "2.0", 5);
    coordinator.prepare(vec![request]).await.unwrap();
    coordinator.wait_settled().await;

    let status = coordinator.status().await;
    assert_eq!(status.state, UpdateState::Prepared);
    assert_eq!(status.components[0].status, ComponentState::Installing);
    assert_eq!(status.components[0].error, "");
}

#[tokio::test(flavor = "multi_thread")]
async fn init_failure_marks_component_error() {
    let harness = Harness::new();
    let mut m1 = SimComponent::new("m1");
    m1.behavior.fail_init = true;
    let coordinator = harness.coordinator(std::slice::from_ref(&m1)).await;

    // The coordinator still comes up; the component reports the failure.
    let status = coordinator.status().await;
    assert_eq!(status.state, UpdateState::Idle);
    let m1_status = &status.components[0];
    assert_eq!(m1_status.status, ComponentState::Error);
    assert!(m1_status.error.contains("init failed"), "{}", m1_status.error);
}
