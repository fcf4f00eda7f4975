//! Restart recovery against the RocksDB ledger
//!
//! A round interrupted by a process restart is failed and refunded when its
//! room is hydrated again, and members come back offline.

mod common;

use common::{display_name, standard_room, units, Harness};
use stakeroom::{
    common::types::{RoundStatus, TransactionType, UserProfile},
    Phase, RocksStore, Store,
};
use std::{sync::Arc, time::Duration};
use tempfile::TempDir;

const PLAYERS: [&str; 3] = ["p1", "p2", "p3"];

#[tokio::test]
async fn test_interrupted_round_refunded_after_restart() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("ledger");

    println!("📝 Phase 1: collect stakes, then stop mid-round");
    let round_id = {
        let store = Arc::new(RocksStore::open(&db_path).unwrap());
        let harness = Harness::with_store(store);
        harness
            .registry
            .create_room(standard_room("table-r", 1, 4))
            .await
            .unwrap();

        for user in PLAYERS {
            harness.fund(user, units(30)).await;
            let room = harness
                .registry
                .join_room("table-r", UserProfile::new(user, display_name(user)))
                .await
                .unwrap();
            room.set_auto_ready(user, true).await.unwrap();
        }

        let room = harness.registry.get_room("table-r").unwrap();
        assert_eq!(room.tick().await, Phase::Betting);
        for user in PLAYERS {
            assert_eq!(harness.available(user).await, units(20));
        }
        let round_id = room.snapshot().await.round_id.unwrap();
        drop(room);

        harness.registry.shutdown();
        round_id
    };

    // let the aborted timer tasks release their handles on the database
    tokio::time::sleep(Duration::from_millis(200)).await;

    println!("🔄 Phase 2: reopen and hydrate");
    let store = Arc::new(RocksStore::open(&db_path).unwrap());
    let harness = Harness::with_store(store);

    let stored = harness.store.get_round(&round_id).await.unwrap().unwrap();
    assert_eq!(stored.status, RoundStatus::Betting);

    let room = harness.registry.get_or_create_room("table-r").await.unwrap();

    let round = harness.store.get_round(&round_id).await.unwrap().unwrap();
    assert_eq!(round.status, RoundStatus::Failed);
    assert_eq!(round.failure_reason.as_deref(), Some("interrupted"));
    assert!(round.settled_at.is_some());

    for user in PLAYERS {
        assert_eq!(harness.available(user).await, units(30), "balance of {}", user);
        let refunds = harness
            .store
            .transactions_for(user)
            .await
            .unwrap()
            .into_iter()
            .filter(|t| t.tx_type == TransactionType::Refund)
            .count();
        assert_eq!(refunds, 1);
    }

    let snapshot = room.snapshot().await;
    assert_eq!(snapshot.phase, Phase::Waiting);
    assert_eq!(snapshot.round_number, 1);
    assert_eq!(snapshot.players.len(), 3);
    for player in &snapshot.players {
        assert!(!player.online);
        assert!(player.auto_ready);
        assert_eq!(player.display_name, display_name(&player.user_id));
    }
    // offline players do not count towards the ready minimum
    assert_eq!(room.tick().await, Phase::Waiting);

    println!("🧹 Offline sweep clears stale memberships");
    let evicted = room.sweep_offline().await;
    assert_eq!(evicted.len(), 3);
    assert!(harness
        .store
        .list_memberships("table-r")
        .await
        .unwrap()
        .is_empty());

    harness.registry.shutdown();
    println!("✅ Interrupted round recovered");
}

#[tokio::test]
async fn test_round_numbers_continue_after_restart() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("ledger");

    {
        let harness = Harness::with_store(Arc::new(RocksStore::open(&db_path).unwrap()));
        harness
            .registry
            .create_room(standard_room("table-n", 1, 2))
            .await
            .unwrap();
        for user in ["p1", "p2"] {
            harness.fund(user, units(100)).await;
            let room = harness
                .registry
                .join_room("table-n", UserProfile::new(user, display_name(user)))
                .await
                .unwrap();
            room.set_auto_ready(user, true).await.unwrap();
        }
        let room = harness.registry.get_room("table-n").unwrap();
        for expected in [Phase::Betting, Phase::InGame, Phase::Settlement, Phase::Reset, Phase::Waiting] {
            assert_eq!(room.tick().await, expected);
        }
        drop(room);
        harness.registry.shutdown();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let harness = Harness::with_store(Arc::new(RocksStore::open(&db_path).unwrap()));
    let room = harness.registry.get_or_create_room("table-n").await.unwrap();
    assert_eq!(room.snapshot().await.round_number, 1);

    for user in ["p1", "p2"] {
        room.set_player_online(user, true).await.unwrap();
    }
    assert_eq!(room.snapshot().await.phase, Phase::Countdown);
    assert_eq!(room.tick().await, Phase::Betting);
    assert_eq!(room.snapshot().await.round_number, 2);
    for _ in 0..4 {
        room.tick().await;
    }

    let rounds = harness.store.rounds_for_room("table-n").await.unwrap();
    let numbers: Vec<u64> = rounds.iter().map(|r| r.round_number).collect();
    assert_eq!(numbers, vec![1, 2]);
    assert!(rounds.iter().all(|r| r.status == RoundStatus::Settled));

    harness.registry.shutdown();
}
