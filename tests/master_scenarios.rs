use std::sync::Arc;

use imagevault::backend::{MemoryObjectStore, ObjectStoreClient, RealImageBackend};
use imagevault::{Config, Master};

fn test_config(cache_dir: std::path::PathBuf) -> Config {
    Config {
        bind_addr: "127.0.0.1:0".to_string(),
        port: 0,
        log_filter: "info".to_string(),
        cache_dir,
        local_initialise: false,
        memory_size_max: 10 * 1024 * 1024,
        memory_count_max: 100,
        local_size_max: 50 * 1024 * 1024,
        local_count_max: 1000,
        remote_credentials: String::new(),
        initialise_store: false,
        remote_cache_container: "image-cache".to_string(),
        remote_cache_size_max: 0,
        remote_cache_count_max: 0,
        remote_store_container: "image-store".to_string(),
        url_lifetime_secs: 300,
        url_lifetime_slack_secs: 60,
        url_key: "lifetime".to_string(),
        url_method: "GET".to_string(),
        hysteresis: 0.8,
        eager_writeback: false,
        max_upload_bytes: 20 * 1024 * 1024,
        default_thumbnail_w: 200,
        default_thumbnail_h: 200,
        default_format: "jpg".to_string(),
        equalise: false,
        liquid_resize: false,
        sharpen: false,
        liquid_cutin_ratio: 2.0,
        canonical_format_used: false,
        canonical_format: "jpg".to_string(),
        error_threshold: 1_000,
    }
}

fn tiny_png() -> Vec<u8> {
    // 1x1 transparent PNG.
    base64_decode(
        "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAQAAAC1HAwCAAAAC0lEQVR42mNk+A8AAQUBAScY42YAAAAASUVORK5CYII=",
    )
}

fn base64_decode(s: &str) -> Vec<u8> {
    const TABLE: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut rev = [255u8; 256];
    for (i, &c) in TABLE.iter().enumerate() {
        rev[c as usize] = i as u8;
    }
    let mut out = Vec::new();
    let mut buf = 0u32;
    let mut bits = 0u32;
    for &b in s.as_bytes() {
        if b == b'=' {
            break;
        }
        let v = rev[b as usize];
        if v == 255 {
            continue;
        }
        buf = (buf << 6) | v as u32;
        bits += 6;
        if bits >= 8 {
            bits -= 8;
            out.push((buf >> bits) as u8);
        }
    }
    out
}

async fn new_master(dir: &tempfile::TempDir) -> Arc<Master> {
    let config = test_config(dir.path().to_path_buf());
    let backend = Arc::new(RealImageBackend::new());
    let store: Arc<dyn ObjectStoreClient> = Arc::new(MemoryObjectStore::new());
    Master::new(&config, backend, store).await.unwrap()
}

#[tokio::test]
async fn upload_then_fetch_original() {
    let dir = tempfile::tempdir().unwrap();
    let master = new_master(&dir).await;

    let name = master
        .add_original(tiny_png(), "photo.png", "png")
        .await
        .unwrap();
    assert!(name.is_original());

    let handle = master.get(&name.render()).await.unwrap();
    let bytes = handle.bytes().await.unwrap();
    assert_eq!(bytes, tiny_png());
}

#[tokio::test]
async fn derive_a_resize_and_refetch_from_cache() {
    let dir = tempfile::tempdir().unwrap();
    let master = new_master(&dir).await;

    let name = master
        .add_original(tiny_png(), "photo.png", "png")
        .await
        .unwrap();

    let mut derived = name.clone();
    derived.apply_resize(4, 4, None);

    let first = master.get(&derived.render()).await.unwrap();
    let first_bytes = first.bytes().await.unwrap();
    assert!(!first_bytes.is_empty());

    // Second fetch should be served from a tier, not re-derived, and return
    // byte-identical content.
    let second = master.get(&derived.render()).await.unwrap();
    let second_bytes = second.bytes().await.unwrap();
    assert_eq!(first_bytes, second_bytes);
}

#[tokio::test]
async fn unknown_base_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let master = new_master(&dir).await;

    let err = master
        .get("deadbeef+size(10,10).jpg")
        .await
        .expect_err("base was never uploaded");
    assert!(matches!(err, imagevault::AppError::UnknownBase(_)));
}

#[tokio::test]
async fn make_persistent_survives_gc() {
    let dir = tempfile::tempdir().unwrap();
    let master = new_master(&dir).await;

    let name = master
        .add_original(tiny_png(), "photo.png", "png")
        .await
        .unwrap();

    master.make_persistent(&name.render()).await.unwrap();
    master.gc().await.unwrap();

    // Still resolvable after gc, because it was promoted to the permanent
    // remote store tier before eviction ran.
    let handle = master.get(&name.render()).await.unwrap();
    assert_eq!(handle.bytes().await.unwrap(), tiny_png());
}

#[tokio::test]
async fn signed_url_requires_persistence_first() {
    let dir = tempfile::tempdir().unwrap();
    let master = new_master(&dir).await;

    let name = master
        .add_original(tiny_png(), "photo.png", "png")
        .await
        .unwrap();

    let url = master.signed_url(&name.render()).await.unwrap();
    assert!(url.contains(&name.render()));
}

#[tokio::test]
async fn upload_list_and_thumbnail_have_expected_pixel_size() {
    let dir = tempfile::tempdir().unwrap();
    let master = new_master(&dir).await;

    let name = master
        .add_original(tiny_png(), "photo.png", "png")
        .await
        .unwrap();

    let bases = master.known_bases();
    assert!(bases.iter().any(|b| b == name.base_name()));

    let mut thumb = name.clone();
    thumb.apply_thumbnail(8, 8, imagevault::name::ThumbnailFlags::default(), "png");
    let handle = master.get(&thumb.render()).await.unwrap();
    let bytes = handle.bytes().await.unwrap();
    let decoded = image::load_from_memory(&bytes).unwrap();
    use image::GenericImageView;
    let (w, h) = decoded.dimensions();
    assert!(w <= 8 && h <= 8);
}

#[tokio::test]
async fn concurrent_get_coalesces_into_a_single_derivation() {
    let dir = tempfile::tempdir().unwrap();
    let master = new_master(&dir).await;

    let name = master
        .add_original(tiny_png(), "photo.png", "png")
        .await
        .unwrap();
    let mut derived = name.clone();
    derived.apply_resize(4, 4, None);
    let target = derived.render();

    let (a, b) = tokio::join!(master.get(&target), master.get(&target));
    let a = a.unwrap();
    let b = b.unwrap();
    assert_eq!(a.bytes().await.unwrap(), b.bytes().await.unwrap());
}

#[tokio::test]
async fn restart_is_consistent_with_a_prepopulated_local_directory() {
    use imagevault::tier::local_file::LocalFileMedium;
    use imagevault::tier::{CacheTier, Tier, TierConfig};

    let dir = tempfile::tempdir().unwrap();
    let cfg = || TierConfig {
        name: "local_file",
        size_max: 1024 * 1024,
        count_max: 100,
        hysteresis: 0.8,
        base_cost: 10,
        eager_writeback: false,
    };

    {
        let medium = LocalFileMedium::new(dir.path().to_path_buf(), false).await.unwrap();
        let tier = Tier::new(medium, cfg());
        tier.add("photo.png", imagevault::Handle::from_bytes(tiny_png(), "png"), false, false)
            .await
            .unwrap();
    }

    // Restarting against the same directory without initialising should
    // find the file still on disk.
    let medium = LocalFileMedium::new(dir.path().to_path_buf(), false).await.unwrap();
    let tier = Tier::new(medium, cfg());
    tier.restore_from_medium().await.unwrap();
    assert!(tier.contains("photo.png").await);
    assert_eq!(tier.stats().await.size_used as usize, tiny_png().len());
}

#[tokio::test]
async fn delete_removes_from_every_tier() {
    let dir = tempfile::tempdir().unwrap();
    let master = new_master(&dir).await;

    let name = master
        .add_original(tiny_png(), "photo.png", "png")
        .await
        .unwrap();
    master.make_persistent(&name.render()).await.unwrap();
    master.delete(&name.render()).await.unwrap();

    let err = master
        .get(&name.render())
        .await
        .expect_err("deleted base should no longer resolve");
    assert!(matches!(err, imagevault::AppError::UnknownBase(_)));
}
