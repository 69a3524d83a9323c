//! Integration tests for the file-backed store

use lanekeeper::{
    Coordinator, Document, Error, FileStore, GlobalPartition, QueueConfig, ResourceKey, Store,
    StoreError,
};
use serde_json::json;
use std::fs;
use tempfile::TempDir;

fn store() -> (TempDir, FileStore) {
    let dir = TempDir::new().unwrap();
    let store = FileStore::new(dir.path().join("data")).unwrap();
    (dir, store)
}

#[tokio::test]
async fn test_missing_document_loads_as_empty_object() {
    let (_dir, store) = store();
    let key = ResourceKey::guild("9").unwrap();

    assert!(store.fetch(&key).await.unwrap().is_none());
    assert_eq!(store.load(&key).await.unwrap().as_value(), &json!({}));
    assert!(!store.path_for(&key).exists());
}

#[tokio::test]
async fn test_save_replaces_whole_document() {
    let (_dir, store) = store();
    let key = ResourceKey::user("42").unwrap();

    store
        .save(&key, &Document::new(json!({ "bucks": 5, "items": { "gift": 1 } })))
        .await
        .unwrap();
    store.save(&key, &Document::new(json!({ "bucks": 6 }))).await.unwrap();

    let doc = store.load(&key).await.unwrap();
    assert_eq!(doc.as_value(), &json!({ "bucks": 6 }));

    // No staging files are left next to the document
    let siblings: Vec<_> = fs::read_dir(store.path_for(&key).parent().unwrap())
        .unwrap()
        .map(|entry| entry.unwrap().file_name())
        .collect();
    assert_eq!(siblings, vec!["42.json"]);
}

#[tokio::test]
async fn test_corrupt_document_is_a_codec_error() {
    let (_dir, store) = store();
    let key = ResourceKey::user("1").unwrap();
    let path = store.path_for(&key);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, b"{ not json").unwrap();

    let err = store.fetch(&key).await.unwrap_err();
    assert!(matches!(err, StoreError::Codec { .. }), "got {err:?}");
}

#[tokio::test]
async fn test_list_by_prefix_and_remove() {
    let (_dir, store) = store();
    let gift = ResourceKey::market("gift").unwrap();
    let bomb = ResourceKey::market("bomb").unwrap();
    let bans = ResourceKey::global(GlobalPartition::BannedUsers);
    let user = ResourceKey::user("1").unwrap();
    for key in [&gift, &bomb, &bans, &user] {
        store.save(key, &Document::default()).await.unwrap();
    }
    // Leftovers from an interrupted save are ignored
    fs::write(store.root().join("global").join(".tmpXYZ"), b"partial").unwrap();

    assert_eq!(
        store.list(&["global", "market"]).await.unwrap(),
        vec![bomb.clone(), gift.clone()]
    );
    assert_eq!(
        store.list(&["global"]).await.unwrap(),
        vec![bans.clone(), bomb.clone(), gift.clone()]
    );
    assert_eq!(store.list(&["global", "bans"]).await.unwrap(), vec![bans]);
    assert!(store.list(&["guild"]).await.unwrap().is_empty());

    store.remove(&gift).await.unwrap();
    store.remove(&gift).await.unwrap();
    assert_eq!(store.list(&["global", "market"]).await.unwrap(), vec![bomb]);
}

#[tokio::test]
async fn test_coordinated_commit_lands_on_disk() {
    let (dir, store) = store();
    let coord = Coordinator::new(store, QueueConfig::default());
    let a = ResourceKey::user("a").unwrap();
    let b = ResourceKey::user("b").unwrap();

    coord
        .run([a.clone(), b.clone()], |txn| async move {
            let a = ResourceKey::user("a").unwrap();
            let b = ResourceKey::user("b").unwrap();
            txn.stage(&a, Document::new(json!({ "bucks": 1 })))?;
            txn.stage(&b, Document::new(json!({ "bucks": 2 })))?;
            Ok::<_, Error>(())
        })
        .await
        .unwrap();

    // A fresh store over the same directory sees the commit
    let reopened = FileStore::new(dir.path().join("data")).unwrap();
    assert_eq!(reopened.load(&a).await.unwrap().as_value(), &json!({ "bucks": 1 }));
    assert_eq!(reopened.load(&b).await.unwrap().as_value(), &json!({ "bucks": 2 }));
}
