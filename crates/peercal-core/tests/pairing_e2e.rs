//! Pairing End-to-End Tests
//!
//! Two managers on localhost pair through an invite token and
//! replicate calendar writes in both directions. These tests bind real
//! endpoints and exchange gossip over the loopback interface.
//!
//! ## Test Scenarios
//!
//! - Host creates a room, candidate joins via token, writer sets
//!   converge, schedule writes flow both ways, late joiner catches up
//! - A redeemed invite token cannot be redeemed again by a third node

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use peercal_core::{Room, RoomEvent, RoomManager, RoomOptions, ScheduleMap};

const SYNC_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Test Utilities
// ============================================================================

/// Create a manager in a temporary directory
async fn create_test_manager() -> (RoomManager, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let manager = RoomManager::new(temp_dir.path()).await.unwrap();
    (manager, temp_dir)
}

/// Wait until the room's writer set reaches `count` members
async fn wait_for_writers(room: &Room, count: usize, timeout: Duration) -> anyhow::Result<()> {
    let start = std::time::Instant::now();
    loop {
        if room.writers().await.len() >= count {
            return Ok(());
        }
        if start.elapsed() > timeout {
            anyhow::bail!(
                "Timeout waiting for {} writers in {} (have {})",
                count,
                room.id(),
                room.writers().await.len()
            );
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Wait until the room's schedule contains `date`
async fn wait_for_date(room: &Room, date: &str, timeout: Duration) -> anyhow::Result<()> {
    let start = std::time::Instant::now();
    loop {
        if room.schedule().await?.contains_key(date) {
            return Ok(());
        }
        if start.elapsed() > timeout {
            anyhow::bail!("Timeout waiting for {} in {}", date, room.id());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn one_change(date: &str, value: serde_json::Value) -> ScheduleMap {
    let mut changes = ScheduleMap::new();
    changes.insert(date.to_string(), value);
    changes
}

// ============================================================================
// Pairing and Replication
// ============================================================================

/// The full pairing arc between two live nodes.
///
/// ## Test Flow:
///
/// 1. Host creates a room, seeds a schedule entry, and mints a token
/// 2. Candidate joins via the token and is admitted
/// 3. Both writer sets converge to two members
/// 4. The candidate catches up on the pre-join schedule entry
/// 5. Writes made on either side appear on the other
#[tokio::test]
async fn test_pair_and_sync_schedules() {
    let _ = tracing_subscriber::fmt::try_init();

    let (manager_a, _temp_a) = create_test_manager().await;
    let (manager_b, _temp_b) = create_test_manager().await;

    println!("\n=== Phase 1: Host creates the room ===\n");

    let (room_a, token) = manager_a
        .init_ready_room(RoomOptions::named("Family"))
        .await
        .unwrap();
    let token = token.expect("host gets an invite");
    // Seed data before anyone joins; the joiner must catch up on it
    room_a
        .adjust_schedule(&one_change("2026-08-01", json!({"note": "pool day"})))
        .await
        .unwrap();

    let mut events_a = manager_a.subscribe();

    println!("\n=== Phase 2: Candidate joins via the token ===\n");

    let room_b = tokio::time::timeout(SYNC_TIMEOUT, manager_b.join_room(token))
        .await
        .expect("join within deadline")
        .unwrap();
    assert_eq!(room_b.name().await.as_deref(), Some("Family"));
    assert_eq!(room_b.info().await.host_key, Some(room_a.writer_key()));

    println!("\n=== Phase 3: Writer sets converge ===\n");

    wait_for_writers(&room_a, 2, SYNC_TIMEOUT).await.unwrap();
    wait_for_writers(&room_b, 2, SYNC_TIMEOUT).await.unwrap();
    assert!(room_a.writers().await.contains(&room_b.writer_key()));
    assert!(room_b.writers().await.contains(&room_a.writer_key()));
    assert!(room_b.is_writable().await);

    let mut saw_admission = false;
    while let Ok(event) = events_a.try_recv() {
        if let RoomEvent::WriterAdmitted { writer, .. } = event {
            if writer == room_b.writer_key() {
                saw_admission = true;
            }
        }
    }
    assert!(saw_admission, "host should report the admission");

    println!("\n=== Phase 4: Late joiner catches up ===\n");

    wait_for_date(&room_b, "2026-08-01", SYNC_TIMEOUT).await.unwrap();

    println!("\n=== Phase 5: Writes flow both ways ===\n");

    room_b
        .adjust_schedule(&one_change("2026-08-02", json!({"note": "b cooks"})))
        .await
        .unwrap();
    wait_for_date(&room_a, "2026-08-02", SYNC_TIMEOUT).await.unwrap();

    room_a
        .adjust_schedule(&one_change("2026-08-03", json!({"note": "a cooks"})))
        .await
        .unwrap();
    wait_for_date(&room_b, "2026-08-03", SYNC_TIMEOUT).await.unwrap();

    let schedule_a = room_a.schedule().await.unwrap();
    let schedule_b = room_b.schedule().await.unwrap();
    assert_eq!(schedule_a, schedule_b);
    assert_eq!(schedule_a.len(), 3);

    let mut events = manager_a.subscribe();
    manager_b.cleanup().await.unwrap();
    manager_a.cleanup().await.unwrap();

    let mut saw_drained = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, RoomEvent::Drained) {
            saw_drained = true;
        }
    }
    assert!(saw_drained, "cleanup should drain the manager");
}

// ============================================================================
// Single-Use Invites
// ============================================================================

/// A token already redeemed by one candidate must not admit another.
#[tokio::test]
async fn test_invite_is_single_use() {
    let _ = tracing_subscriber::fmt::try_init();

    let (manager_a, _temp_a) = create_test_manager().await;
    let (manager_b, _temp_b) = create_test_manager().await;
    let (manager_c, _temp_c) = create_test_manager().await;
    let manager_c = Arc::new(manager_c);

    let (room_a, token) = manager_a
        .init_ready_room(RoomOptions::named("Private"))
        .await
        .unwrap();
    let token = token.unwrap();

    let _room_b = tokio::time::timeout(SYNC_TIMEOUT, manager_b.join_room(token.clone()))
        .await
        .expect("first join within deadline")
        .unwrap();
    wait_for_writers(&room_a, 2, SYNC_TIMEOUT).await.unwrap();

    // Third node knocks with the redeemed token; the host must refuse,
    // so the join never resolves
    let join_c = {
        let manager_c = manager_c.clone();
        let token = token.clone();
        tokio::spawn(async move { manager_c.join_room(token).await })
    };
    let outcome = tokio::time::timeout(Duration::from_secs(8), join_c).await;
    assert!(outcome.is_err(), "second redemption must not be admitted");
    assert_eq!(room_a.writers().await.len(), 2);

    // Cleanup unblocks the still-pending join
    let results = futures::future::join_all([
        manager_a.cleanup(),
        manager_b.cleanup(),
        manager_c.cleanup(),
    ])
    .await;
    for result in results {
        result.unwrap();
    }
}
