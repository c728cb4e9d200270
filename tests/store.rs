use std::sync::Arc;
use std::time::{Duration, Instant};

use prompt_cluster::tasks::RebuildCompletion;
use prompt_cluster::{
    ClusterError, ClusterOptions, ClusterSession, ClusterStore, ImageRecord, RebuildManager,
    ScanMode, SqliteStore, StoreKey,
};
use tempfile::tempdir;

fn library() -> Vec<ImageRecord> {
    vec![
        ImageRecord::new("1", Some("a cat sitting on a mat"), 10),
        ImageRecord::new("2", Some("a cat sitting on the mat"), 20),
        ImageRecord::new("3", Some("cyberpunk alley in the rain"), 30),
        ImageRecord::new("4", None, 40),
    ]
}

fn wait_for(manager: &mut RebuildManager) -> RebuildCompletion {
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        if let Some(done) = manager.poll_updates().into_iter().next() {
            return done;
        }
        assert!(Instant::now() < deadline, "rebuild did not finish");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn background_rebuild_persists_to_sqlite() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("clusters.db");
    let key = StoreKey::new("/library", ScanMode::Recursive);

    {
        let store: Arc<dyn ClusterStore> = Arc::new(SqliteStore::open(&db_path).unwrap());
        let session = ClusterSession::new(store, key.clone(), ClusterOptions::default());
        let mut manager = RebuildManager::new();
        manager.start_rebuild(session, library()).unwrap();
        let done = wait_for(&mut manager);
        assert!(done.success(), "{}", done.message);
        assert_eq!(done.key, key);
    }

    // A fresh handle on the same file sees the saved set.
    let store: Arc<dyn ClusterStore> = Arc::new(SqliteStore::open(&db_path).unwrap());
    let session = ClusterSession::new(store, key, ClusterOptions::default());
    let set = session.load_valid().unwrap().unwrap();
    assert_eq!(set.clusters.len(), 2);
    assert_eq!(set.image_count(), 3);
}

#[test]
fn incremental_updates_survive_reopen() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("clusters.db");
    let key = StoreKey::new("/library", ScanMode::Flat);
    let open = || {
        let store: Arc<dyn ClusterStore> = Arc::new(SqliteStore::open(&db_path).unwrap());
        ClusterSession::new(store, key.clone(), ClusterOptions::default())
    };

    open().load_or_rebuild(&library()).unwrap();

    let added = open()
        .add_image(&ImageRecord::new("5", Some("Cyberpunk alley, in the rain"), 50))
        .unwrap();
    assert!(!added.is_new_cluster);

    let removed = open().remove_images(["1", "2"]).unwrap();
    assert_eq!(removed.removed_images, 2);
    assert_eq!(removed.removed_clusters, 1);

    let set = open().load_valid().unwrap().unwrap();
    assert_eq!(set.clusters.len(), 1);
    assert_eq!(set.clusters[0].image_ids(), ["3", "5"]);
    assert_eq!(set.clusters[0].cover_image_id(), "3");
}

#[test]
fn changed_threshold_requires_rebuild() {
    let store: Arc<dyn ClusterStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let key = StoreKey::new("/library", ScanMode::Recursive);

    ClusterSession::new(store.clone(), key.clone(), ClusterOptions::with_threshold(0.85))
        .load_or_rebuild(&library())
        .unwrap();

    let stricter = ClusterSession::new(store, key, ClusterOptions::with_threshold(0.95));
    assert!(stricter.load_valid().unwrap().is_none());
    let err = stricter
        .add_image(&ImageRecord::new("9", Some("a cat"), 1))
        .unwrap_err();
    assert!(matches!(err, ClusterError::MissingClusterSet(_)));

    let set = stricter.load_or_rebuild(&library()).unwrap();
    assert_eq!(set.similarity_threshold, 0.95);
}
