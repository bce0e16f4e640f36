//! Peers syncing through a shared cloud directory.

use ensembles_engine::{
    Ensemble, EnsembleConfig, EnsembleDelegate, MemoryCloudFileSystem, MemoryRecordStore,
    ObjectId, RebaseConfig, Record, RetryConfig,
};
use ensembles_model::{AttributeType, AttributeValue, EntityDescriptor, ModelSchema};
use std::sync::Arc;

type Peer = Ensemble<MemoryRecordStore, MemoryCloudFileSystem>;

fn schema() -> Arc<ModelSchema> {
    Arc::new(
        ModelSchema::new("v1").with_entity(
            EntityDescriptor::new("Note")
                .with_attribute("text", AttributeType::Text)
                .with_attribute("priority", AttributeType::Integer),
        ),
    )
}

fn config() -> EnsembleConfig {
    EnsembleConfig::new("notes").with_retry(RetryConfig::no_retry())
}

async fn peer(cloud: &Arc<MemoryCloudFileSystem>, config: EnsembleConfig) -> Peer {
    let schema = schema();
    let records = Arc::new(MemoryRecordStore::new(schema.clone()));
    let peer = Ensemble::new(config, schema, records, cloud.clone()).unwrap();
    peer.start_synchronization().await.unwrap();
    peer
}

fn texts(peer: &Peer) -> Vec<AttributeValue> {
    let mut texts: Vec<_> = peer
        .records()
        .objects_of_entity("Note")
        .into_iter()
        .filter_map(|(_, record)| record.attribute("text").cloned())
        .collect();
    texts.sort_by_key(|t| format!("{t:?}"));
    texts
}

fn only_note(peer: &Peer) -> (ObjectId, Record) {
    let mut notes = peer.records().objects_of_entity("Note");
    assert_eq!(notes.len(), 1, "expected exactly one note");
    notes.remove(0)
}

/// Gives every inserted note the same global identifier.
struct SharedIdentifiers;

impl EnsembleDelegate for SharedIdentifiers {
    fn global_identifiers_for_objects(
        &self,
        objects: &[(ObjectId, &Record)],
    ) -> Vec<Option<String>> {
        objects
            .iter()
            .map(|(_, record)| (record.entity_name == "Note").then(|| "g1".to_string()))
            .collect()
    }
}

#[tokio::test]
async fn two_peers_converge() {
    let cloud = Arc::new(MemoryCloudFileSystem::new());
    let a = peer(&cloud, config()).await;
    let b = peer(&cloud, config()).await;

    let (_, batch) = a
        .records()
        .insert(Record::new("Note").with_attribute("text", "hello"))
        .unwrap();
    a.capture_local_changes(&batch).unwrap();
    a.merge().await.unwrap();

    let report = b.merge().await.unwrap();
    assert_eq!(report.events_imported, 1);
    assert_eq!(report.integration.events_integrated, 1);
    assert_eq!(texts(&b), vec![AttributeValue::from("hello")]);

    let (object_id, note) = only_note(&b);
    let batch = b
        .records()
        .update(
            object_id,
            note.with_attribute("text", "hello again")
                .with_attribute("priority", 2i64),
        )
        .unwrap();
    b.capture_local_changes(&batch).unwrap();
    b.merge().await.unwrap();

    a.merge().await.unwrap();
    let (a_id, a_note) = only_note(&a);
    let (b_id, b_note) = only_note(&b);
    assert_eq!(a_note, b_note);
    assert_eq!(a_note.attribute("priority"), Some(&AttributeValue::Integer(2)));
    assert_eq!(
        a.event_store().global_identifier_for_object(a_id),
        b.event_store().global_identifier_for_object(b_id)
    );

    // Nothing left to exchange.
    let report = a.merge().await.unwrap();
    assert_eq!(report.events_imported, 0);
    assert!(report.integration.is_empty());
}

#[tokio::test]
async fn offline_inserts_with_one_identifier_collapse() {
    let cloud = Arc::new(MemoryCloudFileSystem::new());
    let a = peer(&cloud, config())
        .await
        .with_delegate(Arc::new(SharedIdentifiers));
    let b = peer(&cloud, config())
        .await
        .with_delegate(Arc::new(SharedIdentifiers));

    for (peer, text) in [(&a, "from a"), (&b, "from b")] {
        let (_, batch) = peer
            .records()
            .insert(Record::new("Note").with_attribute("text", text))
            .unwrap();
        peer.capture_local_changes(&batch).unwrap();
    }

    a.merge().await.unwrap();
    b.merge().await.unwrap();
    a.merge().await.unwrap();

    // Equal global counts tie-break on store identifier.
    let a_store = a.local_store_id().unwrap();
    let b_store = b.local_store_id().unwrap();
    let winner = if a_store > b_store { "from a" } else { "from b" };

    for peer in [&a, &b] {
        let (object_id, note) = only_note(peer);
        assert_eq!(note.attribute("text"), Some(&AttributeValue::from(winner)));
        assert_eq!(
            peer.event_store()
                .global_identifier_for_object(object_id)
                .map(|gid| gid.global_id),
            Some("g1".to_string())
        );
    }
}

#[tokio::test]
async fn rebase_hands_baseline_to_late_peer() {
    let cloud = Arc::new(MemoryCloudFileSystem::new());
    let rebasing = || {
        config().with_rebase(RebaseConfig::default().with_min_events_without_baseline(2))
    };
    let a = peer(&cloud, rebasing()).await;
    let b = peer(&cloud, rebasing()).await;

    let (_, batch) = a
        .records()
        .insert(Record::new("Note").with_attribute("text", "kept"))
        .unwrap();
    a.capture_local_changes(&batch).unwrap();
    let report = a.merge().await.unwrap();
    assert!(report.rebase.is_none());
    let a_store = a.local_store_id().unwrap();
    let a_event_file = format!("/notes/events/1_{a_store}_1.cbor");
    assert!(cloud.file_paths().contains(&a_event_file));

    // B has seen everything A wrote, so A's save can be folded.
    let report = b.merge().await.unwrap();
    let rebase = report.rebase.expect("expected a rebase");
    assert_eq!(rebase.events_removed, 1);
    assert!(b.event_store().current_baseline().is_some());
    assert!(!cloud.file_paths().contains(&a_event_file));
    assert!(cloud
        .file_paths()
        .iter()
        .any(|path| path.starts_with("/notes/baselines/")));

    let c = peer(&cloud, config()).await;
    c.merge().await.unwrap();
    assert_eq!(texts(&c), vec![AttributeValue::from("kept")]);

    a.merge().await.unwrap();
    assert_eq!(texts(&a), vec![AttributeValue::from("kept")]);
    assert_eq!(texts(&b), vec![AttributeValue::from("kept")]);
}
