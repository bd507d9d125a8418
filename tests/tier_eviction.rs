use imagevault::handle::Handle;
use imagevault::tier::memory::MemoryMedium;
use imagevault::tier::{CacheTier, Tier, TierConfig};

fn bytes_of(n: usize) -> Vec<u8> {
    vec![b'x'; n]
}

#[tokio::test]
async fn evicts_least_recently_used_first() {
    let tier = Tier::new(
        MemoryMedium,
        TierConfig {
            name: "memory",
            size_max: 30,
            count_max: 0,
            hysteresis: 0.5,
            base_cost: 1,
            eager_writeback: false,
        },
    );

    for i in 0..3 {
        let handle = Handle::from_bytes(bytes_of(10), "bin");
        tier.add(&format!("item-{i}"), handle, false, false)
            .await
            .unwrap();
    }
    // Touch item-1 and item-2 so item-0 is the least recently used.
    tier.get("item-1").await;
    tier.get("item-2").await;

    tier.clean().await.unwrap();

    assert!(!tier.contains("item-0").await);
}

#[tokio::test]
async fn must_retain_entries_are_never_silently_dropped() {
    let tier = Tier::new(
        MemoryMedium,
        TierConfig {
            name: "memory",
            size_max: 10,
            count_max: 0,
            hysteresis: 0.5,
            base_cost: 1,
            eager_writeback: false,
        },
    );

    let handle = Handle::from_bytes(bytes_of(5), "bin");
    // No next_retained tier wired, so a must_retain entry has no persistence
    // path; clean should leave it in place rather than evict it.
    tier.add("precious", handle, true, true).await.unwrap();
    tier.clean().await.unwrap();

    assert!(tier.contains("precious").await);
}

#[tokio::test]
async fn oversize_entries_are_rejected() {
    let tier = Tier::new(
        MemoryMedium,
        TierConfig {
            name: "memory",
            size_max: 100,
            count_max: 0,
            hysteresis: 0.8,
            base_cost: 1,
            eager_writeback: false,
        },
    );

    let handle = Handle::from_bytes(bytes_of(50), "bin");
    let err = tier
        .add("too-big", handle, false, false)
        .await
        .expect_err("entry exceeds 10% of tier capacity");
    assert!(matches!(err, imagevault::AppError::OversizeRejected));
}

#[tokio::test]
async fn hysteresis_partitions_kill_unsafe_and_retain() {
    let tier = Tier::new(
        MemoryMedium,
        TierConfig {
            name: "memory",
            size_max: 0,
            count_max: 4,
            hysteresis: 0.5,
            base_cost: 1,
            eager_writeback: false,
        },
    );

    // E1, E2: ordinary ephemeral entries, evicted first.
    for name in ["e1", "e2"] {
        tier.add(name, Handle::from_bytes(bytes_of(4), "bin"), false, false)
            .await
            .unwrap();
    }
    // E3, E4: prefer_retain entries, kept unless the kill set alone can't
    // satisfy the hysteresis target.
    for name in ["e3", "e4"] {
        tier.add(name, Handle::from_bytes(bytes_of(4), "bin"), true, false)
            .await
            .unwrap();
    }
    // E5 pushes the tier over count_max=4, triggering an automatic clean.
    tier.add("e5", Handle::from_bytes(bytes_of(4), "bin"), false, false)
        .await
        .unwrap();

    assert!(!tier.contains("e1").await);
    assert!(!tier.contains("e2").await);
    assert!(tier.contains("e3").await);
    assert!(tier.contains("e4").await);
    assert!(tier.contains("e5").await);
}

#[tokio::test]
async fn idempotent_add_returns_existing_handle() {
    let tier = Tier::new(
        MemoryMedium,
        TierConfig {
            name: "memory",
            size_max: 0,
            count_max: 0,
            hysteresis: 0.8,
            base_cost: 1,
            eager_writeback: false,
        },
    );

    let handle = Handle::from_bytes(bytes_of(4), "bin");
    tier.add("dup", handle.clone(), false, false).await.unwrap();
    let other = Handle::from_bytes(bytes_of(4), "bin");
    let returned = tier.add("dup", other, false, false).await.unwrap();

    assert_eq!(returned.bytes().await.unwrap(), handle.bytes().await.unwrap());
    assert_eq!(tier.stats().await.count, 1);
}
