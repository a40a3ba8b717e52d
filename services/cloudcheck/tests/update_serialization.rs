//! Resolutions on one instance never overlap.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{problem_message, World};
use keel_cloudcheck::fakes::AgentBehavior;

#[tokio::test(start_paused = true)]
async fn test_resolution_waits_for_held_lease() {
    let world = World::new();
    let cloudcheck = Arc::new(world.cloudcheck());
    let lease = world.update_locks.acquire(world.instance.uuid).await;

    let mut instance = world.instance.clone();
    let handle = tokio::spawn({
        let cloudcheck = cloudcheck.clone();
        async move {
            cloudcheck.delete_vm_reference(&mut instance).await.unwrap();
            instance
        }
    });

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(!handle.is_finished());
    assert!(world.store.vm("vm-1").is_some());

    drop(lease);
    let instance = handle.await.unwrap();

    assert!(instance.active_vm.is_none());
    assert!(world.store.vm("vm-1").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_other_instances_are_not_blocked() {
    let world = World::new();
    let mut sibling = world.sibling("vm-2");
    let _lease = world.update_locks.acquire(world.instance.uuid).await;

    tokio::time::timeout(
        Duration::from_secs(1),
        world.cloudcheck().delete_vm_reference(&mut sibling),
    )
    .await
    .expect("sibling resolution was blocked")
    .unwrap();

    assert!(sibling.active_vm.is_none());
    assert!(world.store.vm("vm-1").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_lease_released_after_failure() {
    let mut world = World::new();
    world
        .agent
        .set_behavior(AgentBehavior::default().disks(&["disk-1"]));

    let cloudcheck = world.cloudcheck();
    assert!(cloudcheck.delete_vm(&mut world.instance).await.is_err());
    assert_eq!(world.update_locks.tracked(), 0);

    cloudcheck.delete_vm_reference(&mut world.instance).await.unwrap();
    assert!(world.instance.active_vm.is_none());
    assert_eq!(world.update_locks.tracked(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_queued_resolution_sees_finished_recreate() {
    let world = World::new();
    let uuid = world.instance.uuid;
    let cloudcheck = Arc::new(world.cloudcheck());
    let lease = world.update_locks.acquire(uuid).await;

    let recreate = tokio::spawn({
        let cloudcheck = cloudcheck.clone();
        let mut instance = world.instance.clone();
        async move {
            cloudcheck.recreate_vm(&mut instance, true).await.unwrap();
            instance
        }
    });
    let reboot = tokio::spawn({
        let cloudcheck = cloudcheck.clone();
        let stale = world.instance.clone();
        async move { cloudcheck.reboot_vm(&stale).await.unwrap() }
    });

    // Both are queued on the lease, in spawn order.
    tokio::time::sleep(Duration::from_secs(1)).await;
    drop(lease);

    let recreated = recreate.await.unwrap();
    reboot.await.unwrap();

    assert_eq!(recreated.vm_cid(), Some("vm-new-1"));
    assert_eq!(world.cloud.reboots(), vec!["vm-new-1"]);
    assert_eq!(world.cloud.deletes(), vec!["vm-1"]);
    assert_eq!(world.store.instance(uuid).unwrap().vm_cid(), Some("vm-new-1"));
    assert_eq!(world.update_locks.tracked(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stale_copy_acts_on_stored_vm() {
    let mut world = World::new();
    let uuid = world.instance.uuid;
    let mut stale = world.instance.clone();
    let cloudcheck = world.cloudcheck();

    cloudcheck.recreate_vm(&mut world.instance, true).await.unwrap();
    cloudcheck.delete_vm_from_cloud(&mut stale).await.unwrap();

    assert_eq!(world.cloud.deletes(), vec!["vm-1", "vm-new-1"]);
    assert!(!world.cloud.has("vm-new-1"));
    assert!(stale.active_vm.is_none());
    assert!(world.store.vm_cids().is_empty());
    assert!(world.store.instance(uuid).unwrap().active_vm.is_none());
}

#[tokio::test]
async fn test_instance_missing_from_store() {
    let world = World::new();
    let cloudcheck = world.cloudcheck();
    let mut stranger = keel_cloudcheck::fakes::instance_record();

    let err = cloudcheck
        .delete_vm_reference(&mut stranger)
        .await
        .unwrap_err();

    assert!(problem_message(&err).contains("no longer exists"));
    assert!(stranger.active_vm.is_some());
}
