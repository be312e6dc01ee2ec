use std::sync::Arc;

use bytes::Bytes;
use fsx::blob::{BlobStorage, ListOptions, MemoryBackend};
use fsx::errors::FsxError;
use fsx::sql::SqliteExecutor;
use fsx::storage::{Compression, ExtentStorage, StorageConfig};

const PAGE_SIZE: u32 = 4096;

fn page_of(byte: u8) -> Vec<u8> {
    vec![byte; PAGE_SIZE as usize]
}

struct Fixture {
    backend: Arc<MemoryBackend>,
    storage: ExtentStorage,
}

async fn fixture(config: StorageConfig) -> Fixture {
    let backend = Arc::new(MemoryBackend::new());
    let sql = Arc::new(SqliteExecutor::open_in_memory().unwrap());
    let storage = ExtentStorage::new(config, backend.clone(), sql).unwrap();
    storage.init().await.unwrap();
    Fixture { backend, storage }
}

fn default_config() -> StorageConfig {
    StorageConfig { page_size: PAGE_SIZE, ..StorageConfig::default() }
}

async fn extent_keys(backend: &MemoryBackend) -> Vec<String> {
    backend
        .list(ListOptions { prefix: Some("extent/".into()), ..ListOptions::default() })
        .await
        .unwrap()
        .objects
        .into_iter()
        .map(|m| m.key)
        .collect()
}

#[tokio::test]
async fn operations_fail_before_init() {
    let backend = Arc::new(MemoryBackend::new());
    let sql = Arc::new(SqliteExecutor::open_in_memory().unwrap());
    let storage = ExtentStorage::new(default_config(), backend, sql).unwrap();
    assert!(matches!(
        storage.write_page("f", 0, &page_of(1)).await,
        Err(FsxError::NotInitialized)
    ));
    assert!(matches!(storage.read_page("f", 0).await, Err(FsxError::NotInitialized)));
    assert!(matches!(storage.flush().await, Err(FsxError::NotInitialized)));
}

#[tokio::test]
async fn pack_three_pages_and_read_back() {
    let fx = fixture(default_config()).await;
    for (n, b) in [(0u64, 0x01u8), (1, 0x02), (2, 0x03)] {
        fx.storage.write_page("db.sq3", n, &page_of(b)).await.unwrap();
    }
    fx.storage.flush().await.unwrap();

    assert_eq!(extent_keys(&fx.backend).await.len(), 1);
    let page = fx.storage.read_page("db.sq3", 1).await.unwrap().unwrap();
    assert_eq!(page[0], 0x02);

    let stats = fx.storage.get_stats().await.unwrap();
    assert_eq!(stats.dirty_pages, 0);
    assert_eq!(stats.extents, 1);
    assert_eq!(stats.files, 1);
}

#[tokio::test]
async fn sparse_pages_resolve_and_gaps_read_none() {
    let fx = fixture(default_config()).await;
    for (n, b) in [(0u64, 0x10u8), (5, 0x50), (10, 0xa0)] {
        fx.storage.write_page("f", n, &page_of(b)).await.unwrap();
    }
    fx.storage.flush().await.unwrap();

    for (n, b) in [(0u64, 0x10u8), (5, 0x50), (10, 0xa0)] {
        assert_eq!(fx.storage.read_page("f", n).await.unwrap().unwrap(), page_of(b), "page {n}");
    }
    for n in [1u64, 2, 3, 4, 6, 7, 8, 9] {
        assert_eq!(fx.storage.read_page("f", n).await.unwrap(), None, "page {n}");
    }
}

#[tokio::test]
async fn pages_span_two_extents() {
    // 2 MiB / 4 KiB = 512 pages per extent.
    let fx = fixture(default_config()).await;
    for (n, b) in [(0u64, 1u8), (510, 2), (520, 3)] {
        fx.storage.write_page("f", n, &page_of(b)).await.unwrap();
    }
    fx.storage.flush().await.unwrap();

    let stats = fx.storage.get_stats().await.unwrap();
    assert_eq!(stats.extents, 2);
    for (n, b) in [(0u64, 1u8), (510, 2), (520, 3)] {
        assert_eq!(fx.storage.read_page("f", n).await.unwrap().unwrap(), page_of(b), "page {n}");
    }
}

#[tokio::test]
async fn overwrite_wins_regardless_of_flush() {
    let fx = fixture(default_config()).await;
    fx.storage.write_page("f", 3, &page_of(0x01)).await.unwrap();
    fx.storage.write_page("f", 3, &page_of(0x02)).await.unwrap();
    assert_eq!(fx.storage.read_page("f", 3).await.unwrap().unwrap(), page_of(0x02));

    fx.storage.flush().await.unwrap();
    fx.storage.write_page("f", 3, &page_of(0x03)).await.unwrap();
    assert_eq!(fx.storage.read_page("f", 3).await.unwrap().unwrap(), page_of(0x03));
    fx.storage.flush().await.unwrap();
    assert_eq!(fx.storage.read_page("f", 3).await.unwrap().unwrap(), page_of(0x03));
}

#[tokio::test]
async fn second_flush_writes_no_new_blobs() {
    let fx = fixture(default_config()).await;
    fx.storage.write_page("f", 0, &page_of(0xaa)).await.unwrap();
    fx.storage.flush().await.unwrap();
    let before = extent_keys(&fx.backend).await;

    fx.storage.flush().await.unwrap();
    assert_eq!(extent_keys(&fx.backend).await, before);
}

#[tokio::test]
async fn partial_rewrite_preserves_untouched_pages() {
    let fx = fixture(default_config()).await;
    for (n, b) in [(0u64, 1u8), (1, 2), (2, 3)] {
        fx.storage.write_page("f", n, &page_of(b)).await.unwrap();
    }
    fx.storage.flush().await.unwrap();

    fx.storage.write_page("f", 1, &page_of(0x22)).await.unwrap();
    fx.storage.flush().await.unwrap();

    assert_eq!(fx.storage.read_page("f", 0).await.unwrap().unwrap(), page_of(1));
    assert_eq!(fx.storage.read_page("f", 1).await.unwrap().unwrap(), page_of(0x22));
    assert_eq!(fx.storage.read_page("f", 2).await.unwrap().unwrap(), page_of(3));

    // Still one live extent; the replaced blob is unreferenced garbage.
    let stats = fx.storage.get_stats().await.unwrap();
    assert_eq!(stats.extents, 1);
}

#[tokio::test]
async fn truncate_drops_dirty_pages_past_boundary() {
    let fx = fixture(default_config()).await;
    for (n, b) in [(0u64, 1u8), (5, 2), (10, 3)] {
        fx.storage.write_page("f", n, &page_of(b)).await.unwrap();
    }
    fx.storage.truncate("f", 3 * u64::from(PAGE_SIZE)).await.unwrap();

    assert!(fx.storage.read_page("f", 0).await.unwrap().is_some());
    assert_eq!(fx.storage.read_page("f", 5).await.unwrap(), None);
    assert_eq!(fx.storage.read_page("f", 10).await.unwrap(), None);
    assert_eq!(fx.storage.get_file_size("f").await.unwrap(), 3 * u64::from(PAGE_SIZE));
}

#[tokio::test]
async fn truncate_drops_flushed_extents_past_boundary() {
    let fx = fixture(default_config()).await;
    for (n, b) in [(0u64, 1u8), (5, 2), (520, 3)] {
        fx.storage.write_page("f", n, &page_of(b)).await.unwrap();
    }
    fx.storage.flush().await.unwrap();
    assert_eq!(extent_keys(&fx.backend).await.len(), 2);

    fx.storage.truncate("f", 3 * u64::from(PAGE_SIZE)).await.unwrap();

    // The extent wholly past the boundary is gone from blob store and
    // catalog; the straddler stays but its tail is gated by file size.
    assert_eq!(extent_keys(&fx.backend).await.len(), 1);
    assert_eq!(fx.storage.get_stats().await.unwrap().extents, 1);
    assert!(fx.storage.read_page("f", 0).await.unwrap().is_some());
    assert_eq!(fx.storage.read_page("f", 5).await.unwrap(), None);
    assert_eq!(fx.storage.read_page("f", 520).await.unwrap(), None);
}

#[tokio::test]
async fn truncate_grow_only_extends_recorded_size() {
    let fx = fixture(default_config()).await;
    fx.storage.write_page("f", 0, &page_of(1)).await.unwrap();
    fx.storage.truncate("f", 100 * u64::from(PAGE_SIZE)).await.unwrap();
    assert_eq!(fx.storage.get_file_size("f").await.unwrap(), 100 * u64::from(PAGE_SIZE));
    assert!(fx.storage.read_page("f", 0).await.unwrap().is_some());
}

#[tokio::test]
async fn file_size_tracks_highest_written_page() {
    let fx = fixture(default_config()).await;
    assert_eq!(fx.storage.get_file_size("f").await.unwrap(), 0);

    fx.storage.write_page("f", 9, &page_of(1)).await.unwrap();
    assert_eq!(fx.storage.get_file_size("f").await.unwrap(), 10 * u64::from(PAGE_SIZE));

    // Lower writes never shrink the size.
    fx.storage.write_page("f", 0, &page_of(1)).await.unwrap();
    assert_eq!(fx.storage.get_file_size("f").await.unwrap(), 10 * u64::from(PAGE_SIZE));
}

#[tokio::test]
async fn delete_file_removes_blobs_and_rows() {
    let fx = fixture(default_config()).await;
    fx.storage.write_page("f", 0, &page_of(1)).await.unwrap();
    fx.storage.write_page("g", 0, &page_of(2)).await.unwrap();
    fx.storage.flush().await.unwrap();

    fx.storage.delete_file("f").await.unwrap();
    assert_eq!(fx.storage.read_page("f", 0).await.unwrap(), None);
    assert_eq!(fx.storage.list_files().await.unwrap(), vec!["g".to_string()]);
    assert_eq!(extent_keys(&fx.backend).await.len(), 1);
    assert_eq!(fx.storage.get_file_size("f").await.unwrap(), 0);

    // Idempotent.
    fx.storage.delete_file("f").await.unwrap();
}

#[tokio::test]
async fn list_files_is_lex_ordered() {
    let fx = fixture(default_config()).await;
    for name in ["zeta", "alpha", "mid"] {
        fx.storage.write_page(name, 0, &page_of(1)).await.unwrap();
    }
    assert_eq!(
        fx.storage.list_files().await.unwrap(),
        vec!["alpha".to_string(), "mid".to_string(), "zeta".to_string()]
    );
}

#[tokio::test]
async fn auto_flush_triggers_at_threshold() {
    let config = StorageConfig { flush_threshold: Some(3), ..default_config() };
    let fx = fixture(config).await;
    fx.storage.write_page("f", 0, &page_of(1)).await.unwrap();
    fx.storage.write_page("f", 1, &page_of(2)).await.unwrap();
    assert_eq!(fx.storage.get_stats().await.unwrap().dirty_pages, 2);

    fx.storage.write_page("f", 2, &page_of(3)).await.unwrap();
    let stats = fx.storage.get_stats().await.unwrap();
    assert_eq!(stats.dirty_pages, 0);
    assert_eq!(stats.extents, 1);
}

#[tokio::test]
async fn auto_flush_disabled_keeps_buffering() {
    let config =
        StorageConfig { auto_flush: false, flush_threshold: Some(1), ..default_config() };
    let fx = fixture(config).await;
    fx.storage.write_page("f", 0, &page_of(1)).await.unwrap();
    fx.storage.write_page("f", 1, &page_of(2)).await.unwrap();
    assert_eq!(fx.storage.get_stats().await.unwrap().dirty_pages, 2);
    assert!(extent_keys(&fx.backend).await.is_empty());
}

#[tokio::test]
async fn sync_write_is_immediately_visible_and_flushable() {
    let fx = fixture(default_config()).await;
    fx.storage.write_page_sync("f", 2, &page_of(0x66)).unwrap();
    assert_eq!(fx.storage.read_page_sync("f", 2).unwrap().unwrap(), page_of(0x66));

    // The next awaited operation mirrors and flushes it.
    fx.storage.flush().await.unwrap();
    assert_eq!(fx.storage.get_stats().await.unwrap().dirty_pages, 0);
    assert_eq!(fx.storage.read_page("f", 2).await.unwrap().unwrap(), page_of(0x66));
    assert_eq!(fx.storage.get_file_size("f").await.unwrap(), 3 * u64::from(PAGE_SIZE));
}

#[tokio::test]
async fn sync_read_never_does_io() {
    let fx = fixture(default_config()).await;
    fx.storage.write_page("f", 0, &page_of(0x11)).await.unwrap();
    fx.storage.flush().await.unwrap();
    fx.storage.clear_cache();

    // The extent is only in the blob store now; a sync read must miss.
    assert_eq!(fx.storage.read_page_sync("f", 0).unwrap(), None);

    fx.storage.preload_extents("f").await.unwrap();
    assert_eq!(fx.storage.read_page_sync("f", 0).unwrap().unwrap(), page_of(0x11));
}

#[tokio::test]
async fn rejects_wrong_payload_size() {
    let fx = fixture(default_config()).await;
    assert!(matches!(
        fx.storage.write_page("f", 0, &[0u8; 100]).await,
        Err(FsxError::Invalid(_))
    ));
    assert!(matches!(fx.storage.write_page_sync("f", 0, &[0u8; 100]), Err(FsxError::Invalid(_))));
}

#[tokio::test]
async fn dirty_pages_survive_engine_restart() {
    let backend = Arc::new(MemoryBackend::new());
    let sql = Arc::new(SqliteExecutor::open_in_memory().unwrap());

    {
        let storage =
            ExtentStorage::new(default_config(), backend.clone(), sql.clone()).unwrap();
        storage.init().await.unwrap();
        storage.write_page("f", 0, &page_of(0x42)).await.unwrap();
        storage.write_page("f", 7, &page_of(0x43)).await.unwrap();
        // No flush: the dirty rows stay in the catalog.
    }

    let storage = ExtentStorage::new(default_config(), backend, sql).unwrap();
    storage.init().await.unwrap();
    assert_eq!(storage.get_stats().await.unwrap().dirty_pages, 2);
    assert_eq!(storage.read_page("f", 0).await.unwrap().unwrap(), page_of(0x42));

    storage.flush().await.unwrap();
    assert_eq!(storage.read_page("f", 7).await.unwrap().unwrap(), page_of(0x43));
}

#[tokio::test]
async fn gzip_compression_round_trips_through_engine() {
    let config = StorageConfig { compression: Compression::Gzip, ..default_config() };
    let fx = fixture(config).await;
    for (n, b) in [(0u64, 0x01u8), (5, 0x02)] {
        fx.storage.write_page("f", n, &page_of(b)).await.unwrap();
    }
    fx.storage.flush().await.unwrap();
    fx.storage.clear_cache();

    assert_eq!(fx.storage.read_page("f", 0).await.unwrap().unwrap(), page_of(0x01));
    assert_eq!(fx.storage.read_page("f", 5).await.unwrap().unwrap(), page_of(0x02));

    // Constant-filled pages compress well below their raw size.
    let stats = fx.storage.get_stats().await.unwrap();
    assert!(stats.stored_bytes < 2 * u64::from(PAGE_SIZE));
}

#[tokio::test]
async fn corrupted_extent_surfaces_checksum_error() {
    let fx = fixture(default_config()).await;
    fx.storage.write_page("f", 0, &page_of(0x01)).await.unwrap();
    fx.storage.flush().await.unwrap();
    fx.storage.clear_cache();

    // Corrupt the stored extent behind the engine's back.
    let key = extent_keys(&fx.backend).await.remove(0);
    let mut bytes = fx.backend.get(&key).await.unwrap().unwrap().bytes.to_vec();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    fx.backend.put(&key, bytes.into(), Default::default()).await.unwrap();

    assert!(matches!(
        fx.storage.read_page("f", 0).await,
        Err(FsxError::ChecksumMismatch(_))
    ));
}

#[tokio::test]
async fn cache_hit_rate_reported() {
    let fx = fixture(default_config()).await;
    fx.storage.write_page("f", 0, &page_of(1)).await.unwrap();
    fx.storage.flush().await.unwrap();
    fx.storage.clear_cache();

    fx.storage.read_page("f", 0).await.unwrap(); // miss, then fill
    fx.storage.read_page("f", 0).await.unwrap(); // hit
    let stats = fx.storage.get_stats().await.unwrap();
    assert_eq!(stats.cache_size, 1);
    assert!(stats.cache_hit_rate > 0.0);
}

#[tokio::test]
async fn custom_extent_prefix_scopes_blob_keys() {
    let config = StorageConfig { extent_prefix: "tier/a/".into(), ..default_config() };
    let fx = fixture(config).await;
    fx.storage.write_page("f", 0, &page_of(1)).await.unwrap();
    fx.storage.flush().await.unwrap();

    assert!(extent_keys(&fx.backend).await.is_empty());
    let scoped = fx
        .backend
        .list(ListOptions { prefix: Some("tier/a/".into()), ..ListOptions::default() })
        .await
        .unwrap();
    assert_eq!(scoped.objects.len(), 1);
}
