mod support;

use std::collections::BTreeSet;
use std::time::Duration;

use stowage_core::GroupAck;
use stowage_core::model::{
    FileEventKind, GroupEvent, LifecycleEvent, RequestKind, RequestStatus,
};
use stowage_core::orchestration::{
    CAUSE_DELETION_CANCELLED, CAUSE_SUPERSEDED_BY_DELETION,
};
use support::*;

#[tokio::test]
async fn duplicate_store_requests_share_one_row() {
    let disk = ScriptedBackend::online("disk");
    let mut h = Harness::new(&[("disk", disk.clone())]).await;

    let first = h.submit_store("g1", vec![store_item("c1", "disk", "o1")]).await;
    let second = h.submit_store("g2", vec![store_item("c1", "disk", "o1")]).await;
    assert_eq!(first, GroupAck::Granted { count: 1 });
    assert_eq!(second, GroupAck::Granted { count: 1 });

    assert_eq!(
        h.counts(RequestKind::Storage).await.get(&RequestStatus::ToDo),
        Some(&1)
    );
    let request = h
        .request(RequestKind::Storage, "c1", "disk")
        .await
        .expect("merged request");
    assert_eq!(request.group_ids, BTreeSet::from([group("g1"), group("g2")]));

    h.cycle().await;
    let (ok, errors) = h.next_done("g1", RequestKind::Storage).await;
    assert_eq!((ok.len(), errors.len()), (1, 0));
    let (ok, errors) = h.next_done("g2", RequestKind::Storage).await;
    assert_eq!((ok.len(), errors.len()), (1, 0));
    assert_eq!(disk.jobs_run(), 1);
}

#[tokio::test]
async fn storing_a_referenced_file_only_adds_the_owner() {
    let disk = ScriptedBackend::online("disk");
    let mut h = Harness::new(&[("disk", disk.clone())]).await;
    h.seed("c1", "disk", "o1").await;

    let ack = h.submit_store("g2", vec![store_item("c1", "disk", "o2")]).await;
    assert_eq!(ack, GroupAck::Granted { count: 1 });

    let event = h.next_file_event(FileEventKind::StoreSuccess, "c1").await;
    assert_eq!(event.url, Some(disk.url_for(&checksum("c1"))));
    let (ok, errors) = h.next_done("g2", RequestKind::Storage).await;
    assert_eq!((ok.len(), errors.len()), (1, 0));
    assert!(ok[0].reference.is_some());

    assert!(h.counts(RequestKind::Storage).await.is_empty());
    let references = h.engine.references_of(&checksum("c1")).await.unwrap();
    assert_eq!(references.len(), 1);
    assert_eq!(
        references[0].owners,
        BTreeSet::from([owner("o1"), owner("o2")])
    );
    assert_eq!(disk.jobs_run(), 1);
}

#[tokio::test]
async fn store_behind_pending_deletion_waits_for_it() {
    let disk = ScriptedBackend::online("disk");
    let mut h = Harness::parked(&[("disk", disk.clone())]).await;
    h.seed("c1", "disk", "o1").await;

    h.submit_delete("del", vec![deletion_item("c1", "disk", "o1", false)])
        .await;
    h.engine.run_dispatch_cycle().await;
    let parked = h.parked.clone().expect("parked executor");
    assert_eq!(parked.parked().await, 1);
    assert_eq!(
        h.request(RequestKind::Deletion, "c1", "disk")
            .await
            .map(|r| r.status),
        Some(RequestStatus::Pending)
    );

    h.submit_store("again", vec![store_item("c1", "disk", "o2")])
        .await;
    assert_eq!(
        h.counts(RequestKind::Storage).await.get(&RequestStatus::Delayed),
        Some(&1)
    );

    // Delayed requests are invisible to dispatch.
    h.engine.run_dispatch_cycle().await;
    assert_eq!(parked.parked().await, 1);

    parked.run_all().await;
    let (ok, errors) = h.next_done("del", RequestKind::Deletion).await;
    assert_eq!((ok.len(), errors.len()), (1, 0));
    h.wait_for_status(RequestKind::Storage, RequestStatus::ToDo, 1)
        .await;
    assert!(h.engine.references_of(&checksum("c1")).await.unwrap().is_empty());

    h.cycle().await;
    let (ok, errors) = h.next_done("again", RequestKind::Storage).await;
    assert_eq!((ok.len(), errors.len()), (1, 0));
    let references = h.engine.references_of(&checksum("c1")).await.unwrap();
    assert_eq!(references[0].owners, BTreeSet::from([owner("o2")]));
}

#[tokio::test]
async fn deletion_supersedes_store_that_has_not_started() {
    let disk = ScriptedBackend::online("disk");
    let mut h = Harness::new(&[("disk", disk.clone())]).await;

    h.submit_store("store", vec![store_item("c2", "disk", "o1")]).await;
    h.submit_delete("delete", vec![deletion_item("c2", "disk", "o1", false)])
        .await;

    let event = h.next_file_event(FileEventKind::StoreError, "c2").await;
    assert_eq!(event.cause.as_deref(), Some(CAUSE_SUPERSEDED_BY_DELETION));
    let (ok, errors) = h.next_done("store", RequestKind::Storage).await;
    assert!(ok.is_empty());
    assert_eq!(
        errors[0].error_cause.as_deref(),
        Some(CAUSE_SUPERSEDED_BY_DELETION)
    );
    let (ok, errors) = h.next_done("delete", RequestKind::Deletion).await;
    assert_eq!((ok.len(), errors.len()), (1, 0));

    assert!(h.counts(RequestKind::Storage).await.is_empty());
    h.cycle().await;
    assert_eq!(disk.jobs_run(), 0);
}

#[tokio::test]
async fn new_owner_cancels_idle_deletion() {
    let disk = ScriptedBackend::online("disk");
    let mut h = Harness::new(&[("disk", disk.clone())]).await;
    h.seed("c3", "disk", "o1").await;

    h.submit_delete("delete", vec![deletion_item("c3", "disk", "o1", false)])
        .await;
    assert_eq!(
        h.counts(RequestKind::Deletion).await.get(&RequestStatus::ToDo),
        Some(&1)
    );

    h.submit_store("store", vec![store_item("c3", "disk", "o2")]).await;
    let (ok, errors) = h.next_done("delete", RequestKind::Deletion).await;
    assert!(ok.is_empty());
    assert_eq!(
        errors[0].error_cause.as_deref(),
        Some(CAUSE_DELETION_CANCELLED)
    );
    let (ok, errors) = h.next_done("store", RequestKind::Storage).await;
    assert_eq!((ok.len(), errors.len()), (1, 0));

    assert!(h.counts(RequestKind::Deletion).await.is_empty());
    let references = h.engine.references_of(&checksum("c3")).await.unwrap();
    assert_eq!(references[0].owners, BTreeSet::from([owner("o2")]));
}

#[tokio::test]
async fn deleting_one_of_several_owners_keeps_the_file() {
    let disk = ScriptedBackend::online("disk");
    let mut h = Harness::new(&[("disk", disk.clone())]).await;
    h.seed("c4", "disk", "o1").await;
    h.seed("c4", "disk", "o2").await;

    h.submit_delete("delete", vec![deletion_item("c4", "disk", "o1", false)])
        .await;
    let (ok, errors) = h.next_done("delete", RequestKind::Deletion).await;
    assert_eq!((ok.len(), errors.len()), (1, 0));

    assert!(h.counts(RequestKind::Deletion).await.is_empty());
    let references = h.engine.references_of(&checksum("c4")).await.unwrap();
    assert_eq!(references[0].owners, BTreeSet::from([owner("o2")]));
}

#[tokio::test]
async fn invalid_storage_item_denies_the_batch() {
    let mut h = Harness::new(&[]).await;
    let mut item = store_item("c5", "disk", "o1");
    item.file_name = "  ".into();

    let ack = h.submit_store("bad", vec![item]).await;
    let GroupAck::Denied { cause } = &ack else {
        panic!("expected denial, got {ack:?}");
    };
    assert!(cause.contains("file name missing"));
    assert!(h.counts(RequestKind::Storage).await.is_empty());
    let events = h.drain_for(Duration::from_millis(50)).await;
    assert!(events.iter().any(|event| matches!(
        event,
        LifecycleEvent::Group(GroupEvent::Denied { .. })
    )));
    assert!(!events.iter().any(|event| matches!(
        event,
        LifecycleEvent::Group(GroupEvent::Done { .. })
    )));
}
