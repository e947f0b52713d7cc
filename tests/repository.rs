//! End-to-end scenarios over in-memory and filesystem backends.

use std::sync::Arc;

use coffer::backend::mem::MemoryBackend;
use coffer::{Backend, CacheProvider, Error, Mac, Repository, RepositoryConfig, ResourceType};

fn state_id(tag: u8) -> Mac {
    Mac::from_bytes([tag; 32])
}

async fn mem_repository() -> (Arc<MemoryBackend>, Repository) {
    let backend = Arc::new(MemoryBackend::new());
    Repository::create(backend.clone(), RepositoryConfig::new(), None)
        .await
        .unwrap();
    let repository = Repository::open(backend.clone(), CacheProvider::Memory, None)
        .await
        .unwrap();
    (backend, repository)
}

#[tokio::test]
async fn single_blob_roundtrip() {
    let (backend, repository) = mem_repository().await;

    let data = b"hello dummy";
    let mac = repository.compute_mac(data);

    let tx = repository.start_transaction().await.unwrap();
    tx.put_blob(ResourceType::Chunk, mac, data).await.unwrap();
    tx.commit(state_id(1)).await.unwrap();

    // a fresh reader rebuilds the state and finds the blob
    let reader = Repository::open(backend.clone(), CacheProvider::Memory, None)
        .await
        .unwrap();
    assert_eq!(
        reader.get_blob(ResourceType::Chunk, mac).await.unwrap(),
        data
    );
    assert!(reader.blob_exists(ResourceType::Chunk, mac).await.unwrap());

    // exactly one packfile, keyed by the MAC of its own bytes
    let packfiles = backend.get_packfiles().await.unwrap();
    assert_eq!(packfiles.len(), 1);
    let raw = backend.get_packfile(packfiles[0]).await.unwrap();
    assert_eq!(reader.compute_mac(&raw), packfiles[0]);

    // and the packfile itself verifies end to end
    let pack = reader.get_packfile(packfiles[0]).await.unwrap();
    let chunks: Vec<_> = pack
        .entries()
        .iter()
        .filter(|e| e.resource == ResourceType::Chunk)
        .collect();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].mac, mac);
}

#[tokio::test]
async fn repeated_reads_return_identical_bytes() {
    let (_backend, repository) = mem_repository().await;

    let data = vec![0x5A; 186];
    let mac = repository.compute_mac(&data);
    let tx = repository.start_transaction().await.unwrap();
    tx.put_blob(ResourceType::Chunk, mac, &data).await.unwrap();
    tx.commit(state_id(1)).await.unwrap();

    // the read path jitters its range requests; the data must not
    for _ in 0..50 {
        assert_eq!(
            repository.get_blob(ResourceType::Chunk, mac).await.unwrap(),
            data
        );
    }
}

#[tokio::test]
async fn concurrent_duplicate_puts_store_one_copy() {
    let (backend, repository) = mem_repository().await;

    let data = b"foo";
    let mac = repository.compute_mac(data);

    let tx = repository.start_transaction().await.unwrap();
    futures::future::join_all(
        (0..1000).map(|_| tx.put_blob(ResourceType::Chunk, mac, data)),
    )
    .await
    .into_iter()
    .collect::<Result<Vec<_>, _>>()
    .unwrap();
    tx.commit(state_id(1)).await.unwrap();

    // one delta entry for the blob
    let objects = repository
        .state()
        .list_objects_of_type(ResourceType::Chunk)
        .await
        .unwrap();
    assert_eq!(objects.len(), 1);
    assert_eq!(objects[0].mac, mac);

    // one packfile holding one real blob plus leading and trailing padding
    let packfiles = backend.get_packfiles().await.unwrap();
    assert_eq!(packfiles.len(), 1);
    let pack = repository.get_packfile(packfiles[0]).await.unwrap();
    let real = pack
        .entries()
        .iter()
        .filter(|e| e.resource == ResourceType::Chunk)
        .count();
    let padding = pack
        .entries()
        .iter()
        .filter(|e| e.resource == ResourceType::Random)
        .count();
    assert_eq!(real, 1);
    assert_eq!(padding, 2);
}

#[tokio::test]
async fn duplicate_put_in_later_session_writes_nothing() {
    let (backend, repository) = mem_repository().await;

    let data = b"stable payload";
    let mac = repository.compute_mac(data);

    let tx = repository.start_transaction().await.unwrap();
    tx.put_blob(ResourceType::Object, mac, data).await.unwrap();
    tx.commit(state_id(1)).await.unwrap();
    assert_eq!(backend.get_packfiles().await.unwrap().len(), 1);

    let tx = repository.start_transaction().await.unwrap();
    tx.put_blob_if_not_exists(ResourceType::Object, mac, data)
        .await
        .unwrap();
    tx.commit(state_id(2)).await.unwrap();

    assert_eq!(backend.get_packfiles().await.unwrap().len(), 1);
}

#[tokio::test]
async fn independent_writers_merge() {
    let backend = Arc::new(MemoryBackend::new());
    Repository::create(backend.clone(), RepositoryConfig::new(), None)
        .await
        .unwrap();

    // both writers open before either commits
    let writer_a = Repository::open(backend.clone(), CacheProvider::Memory, None)
        .await
        .unwrap();
    let writer_b = Repository::open(backend.clone(), CacheProvider::Memory, None)
        .await
        .unwrap();

    let data_a = b"written by A";
    let mac_a = writer_a.compute_mac(data_a);
    let tx = writer_a.start_transaction().await.unwrap();
    tx.put_blob(ResourceType::Object, mac_a, data_a).await.unwrap();
    tx.commit(state_id(0xA1)).await.unwrap();

    let data_b = b"written by B";
    let mac_b = writer_b.compute_mac(data_b);
    let tx = writer_b.start_transaction().await.unwrap();
    tx.put_blob(ResourceType::Object, mac_b, data_b).await.unwrap();
    tx.commit(state_id(0xB1)).await.unwrap();

    let observer = Repository::open(backend.clone(), CacheProvider::Memory, None)
        .await
        .unwrap();
    assert!(observer.blob_exists(ResourceType::Object, mac_a).await.unwrap());
    assert!(observer.blob_exists(ResourceType::Object, mac_b).await.unwrap());
    assert_eq!(
        observer.get_blob(ResourceType::Object, mac_a).await.unwrap(),
        data_a
    );
    assert_eq!(
        observer.get_blob(ResourceType::Object, mac_b).await.unwrap(),
        data_b
    );
}

#[tokio::test]
async fn deleted_snapshot_is_shadowed() {
    let (backend, repository) = mem_repository().await;

    let snapshot = b"snapshot manifest bytes";
    let mac = repository.compute_mac(snapshot);

    let tx = repository.start_transaction().await.unwrap();
    tx.put_blob(ResourceType::Snapshot, mac, snapshot).await.unwrap();
    tx.commit(state_id(1)).await.unwrap();
    assert_eq!(repository.state().list_snapshots().await.unwrap(), vec![mac]);

    repository.delete_snapshot(mac).await.unwrap();

    let reader = Repository::open(backend.clone(), CacheProvider::Memory, None)
        .await
        .unwrap();
    assert!(reader.state().list_snapshots().await.unwrap().is_empty());
    let deleted = reader
        .state()
        .list_deleted_resources(ResourceType::Snapshot)
        .await
        .unwrap();
    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted[0].0, mac);
    assert!(deleted[0].1 > 0);

    assert!(!reader.blob_exists(ResourceType::Snapshot, mac).await.unwrap());
    match reader.get_blob(ResourceType::Snapshot, mac).await {
        Err(e) if e.is_not_found() => {}
        other => panic!("expected not-found, got {other:?}"),
    }
}

#[tokio::test]
async fn flush_checkpoints_and_session_continues() {
    let (backend, repository) = mem_repository().await;

    let first = b"first checkpointed blob";
    let second = b"second blob after checkpoint";
    let mac_first = repository.compute_mac(first);
    let mac_second = repository.compute_mac(second);

    let mut tx = repository.start_transaction().await.unwrap();
    tx.put_blob(ResourceType::Chunk, mac_first, first).await.unwrap();
    tx.flush(state_id(1)).await.unwrap();
    tx.put_blob(ResourceType::Chunk, mac_second, second).await.unwrap();
    tx.commit(state_id(2)).await.unwrap();

    assert_eq!(backend.get_states().await.unwrap().len(), 2);

    let reader = Repository::open(backend.clone(), CacheProvider::Memory, None)
        .await
        .unwrap();
    assert_eq!(
        reader.get_blob(ResourceType::Chunk, mac_first).await.unwrap(),
        first
    );
    assert_eq!(
        reader.get_blob(ResourceType::Chunk, mac_second).await.unwrap(),
        second
    );
}

#[tokio::test]
async fn chunked_stream_roundtrips() {
    let backend = Arc::new(MemoryBackend::new());
    let mut config = RepositoryConfig::new();
    config.chunking.min_size = 1024;
    config.chunking.normal_size = 4096;
    config.chunking.max_size = 16384;
    Repository::create(backend.clone(), config, None).await.unwrap();
    let repository = Repository::open(backend, CacheProvider::Memory, None)
        .await
        .unwrap();

    let source: Vec<u8> = (0..200_000u32).map(|i| (i * 31 % 251) as u8).collect();

    let tx = repository.start_transaction().await.unwrap();
    let chunks = tx.put_chunked(&source[..]).await.unwrap();
    tx.commit(state_id(1)).await.unwrap();
    assert!(chunks.len() > 1);

    let mut reassembled = Vec::new();
    for (mac, length) in &chunks {
        let data = repository.get_blob(ResourceType::Chunk, *mac).await.unwrap();
        assert_eq!(data.len() as u64, *length);
        reassembled.extend_from_slice(&data);
    }
    assert_eq!(reassembled, source);

    // an empty source stores nothing and is not an error
    let tx = repository.start_transaction().await.unwrap();
    assert!(tx.put_chunked(&[][..]).await.unwrap().is_empty());
    tx.commit(state_id(2)).await.unwrap();
}

#[tokio::test]
async fn empty_commit_publishes_state_without_packfiles() {
    let (backend, repository) = mem_repository().await;

    let tx = repository.start_transaction().await.unwrap();
    tx.commit(state_id(9)).await.unwrap();

    assert_eq!(backend.get_states().await.unwrap().len(), 1);
    assert!(backend.get_packfiles().await.unwrap().is_empty());
}

#[tokio::test]
async fn open_no_rebuild_tolerates_stale_index() {
    let (backend, repository) = mem_repository().await;

    let data = b"published after the stale open";
    let mac = repository.compute_mac(data);
    let tx = repository.start_transaction().await.unwrap();
    tx.put_blob(ResourceType::Chunk, mac, data).await.unwrap();
    tx.commit(state_id(1)).await.unwrap();

    let stale = Repository::open_no_rebuild(backend.clone(), CacheProvider::Memory, None)
        .await
        .unwrap();
    assert!(!stale.blob_exists(ResourceType::Chunk, mac).await.unwrap());

    // an explicit rebuild catches the reader up
    stale.rebuild_state().await.unwrap();
    assert_eq!(stale.get_blob(ResourceType::Chunk, mac).await.unwrap(), data);
}

#[tokio::test]
async fn zero_packfile_size_cannot_create() {
    let backend = Arc::new(MemoryBackend::new());
    let mut config = RepositoryConfig::new();
    config.packfile.max_size = 0;
    assert!(matches!(
        Repository::create(backend, config, None).await,
        Err(Error::ConfigInvalid(_))
    ));
}

#[tokio::test]
async fn locks_wrap_and_roundtrip() {
    let (backend, repository) = mem_repository().await;

    let lock = Mac::from_bytes([0x10; 32]);
    repository.put_lock(lock, b"owner=host-1").await.unwrap();
    assert_eq!(repository.get_locks().await.unwrap(), vec![lock]);
    assert_eq!(repository.get_lock(lock).await.unwrap(), b"owner=host-1");

    // the stored object is enveloped, not the raw payload
    let raw = backend.get_lock(lock).await.unwrap();
    assert_ne!(raw, b"owner=host-1");
    assert!(raw.starts_with(b"_PLAKAR_"));

    repository.delete_lock(lock).await.unwrap();
    assert!(repository.get_locks().await.unwrap().is_empty());
}

#[tokio::test]
async fn abort_publishes_nothing() {
    let (backend, repository) = mem_repository().await;

    let data = b"doomed";
    let mac = repository.compute_mac(data);
    let tx = repository.start_transaction().await.unwrap();
    tx.put_blob(ResourceType::Chunk, mac, data).await.unwrap();
    tx.abort().await;

    assert!(backend.get_states().await.unwrap().is_empty());
    let reader = Repository::open(backend.clone(), CacheProvider::Memory, None)
        .await
        .unwrap();
    assert!(!reader.blob_exists(ResourceType::Chunk, mac).await.unwrap());
}

#[tokio::test]
async fn filesystem_backend_end_to_end() {
    use coffer::backend::fs::FsBackend;

    let store_dir = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(FsBackend::new(store_dir.path()));
    let caches = CacheProvider::Directory(cache_dir.path().to_path_buf());

    Repository::create(backend.clone(), RepositoryConfig::new(), None)
        .await
        .unwrap();
    let repository = Repository::open(backend.clone(), caches.clone(), None)
        .await
        .unwrap();

    let data = b"bytes on a real filesystem";
    let mac = repository.compute_mac(data);
    let tx = repository.start_transaction().await.unwrap();
    tx.put_blob(ResourceType::Chunk, mac, data).await.unwrap();
    tx.commit(state_id(1)).await.unwrap();
    drop(repository);

    // reopening with the same cache directory skips already-merged states
    let reopened = Repository::open(backend.clone(), caches, None).await.unwrap();
    assert_eq!(
        reopened.get_blob(ResourceType::Chunk, mac).await.unwrap(),
        data
    );
    assert!(reopened.size().await.unwrap() > 0);
}

#[tokio::test]
async fn encrypted_repository_roundtrip() {
    let backend = Arc::new(MemoryBackend::new());
    let mut config = RepositoryConfig::new();
    config.enable_compression(3);
    config.enable_encryption(coffer::hashing::generate_salt().unwrap());

    let secret = [0x42u8; 32];
    Repository::create(backend.clone(), config, Some(&secret))
        .await
        .unwrap();

    let repository =
        Repository::open(backend.clone(), CacheProvider::Memory, Some(&secret))
            .await
            .unwrap();
    let data = b"sealed payload";
    let mac = repository.compute_mac(data);
    let tx = repository.start_transaction().await.unwrap();
    tx.put_blob(ResourceType::Chunk, mac, data).await.unwrap();
    tx.commit(state_id(1)).await.unwrap();

    let reader = Repository::open(backend.clone(), CacheProvider::Memory, Some(&secret))
        .await
        .unwrap();
    assert_eq!(reader.get_blob(ResourceType::Chunk, mac).await.unwrap(), data);

    // a wrong secret is rejected by the configuration canary
    let wrong = [0x43u8; 32];
    assert!(matches!(
        Repository::open(backend.clone(), CacheProvider::Memory, Some(&wrong)).await,
        Err(Error::IntegrityFailure)
    ));

    // and no secret at all is a configuration error
    assert!(Repository::open(backend, CacheProvider::Memory, None)
        .await
        .is_err());
}

#[tokio::test]
async fn remove_packfile_unregisters_it() {
    let (backend, repository) = mem_repository().await;

    let data = b"to be collected";
    let mac = repository.compute_mac(data);
    let tx = repository.start_transaction().await.unwrap();
    tx.put_blob(ResourceType::Chunk, mac, data).await.unwrap();
    tx.commit(state_id(1)).await.unwrap();

    let packfiles = repository.state().list_packfiles().await.unwrap();
    assert_eq!(packfiles.len(), 1);

    repository.remove_packfile(packfiles[0]).await.unwrap();
    assert!(repository.state().list_packfiles().await.unwrap().is_empty());
    assert!(backend.get_packfiles().await.unwrap().is_empty());

    // the delta is now an orphan, visible to consistency checks
    let orphans = repository.state().list_orphan_deltas().await.unwrap();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].mac, mac);
}
