//! RocksDB-backed store
//!
//! Key layout (values are JSON):
//! - `account:{user_id}`
//! - `tx:{id:020}` and the per-user index `txuser:{user}:{id:020}`
//! - `round:{round_id}` and the per-room index `roundnum:{room}:{number:020}`
//! - `room:{room_id}`
//! - `member:{room}:{user_id}`
//! - `meta:last_tx_id`
//!
//! `{user}` and `{room}` are length-prefixed (`{len}:{id}`) wherever a scan
//! prefix ends, so one id can never be a prefix of another's range.

use super::{
    batch::{Batch, Changes, Snapshot},
    BalanceUpdate, SettlementPlan, StakeCollection, Store,
};
use crate::{
    common::types::{
        Account, BalanceTransaction, Membership, RoomConfig, RoundRecord, TxContext, UserId,
    },
    errors::{StoreError, StoreResult},
    money::Amount,
};
use async_trait::async_trait;
use chrono::Utc;
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use serde::{de::DeserializeOwned, Serialize};
use std::{path::Path, sync::Mutex};

const LAST_TX_KEY: &[u8] = b"meta:last_tx_id";

fn account_key(user_id: &str) -> String {
    format!("account:{}", user_id)
}

fn tx_key(id: u64) -> String {
    format!("tx:{:020}", id)
}

/// `{len}:{id}`; unambiguous even when ids contain `:`
fn segment(id: &str) -> String {
    format!("{}:{}", id.len(), id)
}

fn user_tx_prefix(user_id: &str) -> String {
    format!("txuser:{}:", segment(user_id))
}

fn user_tx_key(user_id: &str, id: u64) -> String {
    format!("{}{:020}", user_tx_prefix(user_id), id)
}

fn round_key(round_id: &str) -> String {
    format!("round:{}", round_id)
}

fn round_number_prefix(room_id: &str) -> String {
    format!("roundnum:{}:", segment(room_id))
}

fn round_number_key(room_id: &str, number: u64) -> String {
    format!("{}{:020}", round_number_prefix(room_id), number)
}

fn room_key(room_id: &str) -> String {
    format!("room:{}", room_id)
}

fn member_prefix(room_id: &str) -> String {
    format!("member:{}:", segment(room_id))
}

fn member_key(room_id: &str, user_id: &str) -> String {
    format!("{}{}", member_prefix(room_id), user_id)
}

pub struct RocksStore {
    db: DB,
    /// Serialises read-modify-write units; plain reads bypass it
    commit_lock: Mutex<()>,
}

impl RocksStore {
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = DB::open(&opts, path)?;
        tracing::info!("opened ledger database at {:?}", db.path());
        Ok(Self {
            db,
            commit_lock: Mutex::new(()),
        })
    }

    /// Remove any existing database at `path` before opening
    pub fn open_fresh<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        if path.as_ref().exists() {
            DB::destroy(&Options::default(), path.as_ref())?;
            tracing::warn!("cleared ledger database at {:?}", path.as_ref());
        }
        Self::open(path)
    }

    fn read<T: DeserializeOwned>(&self, key: &[u8]) -> StoreResult<Option<T>> {
        read_json(&self.db, key)
    }

    fn write<T: Serialize>(&self, key: &str, value: &T) -> StoreResult<()> {
        self.db.put(key.as_bytes(), serde_json::to_vec(value)?)?;
        Ok(())
    }

    fn scan<T: DeserializeOwned>(&self, prefix: &str) -> StoreResult<Vec<(Box<[u8]>, T)>> {
        let mut rows = Vec::new();
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            rows.push((key, serde_json::from_slice(&value)?));
        }
        Ok(rows)
    }

    fn transact<T>(&self, op: impl FnOnce(&mut Batch<'_, RocksView<'_>>) -> StoreResult<T>) -> StoreResult<T> {
        let _guard = self
            .commit_lock
            .lock()
            .map_err(|_| StoreError::Backend("commit lock poisoned".to_string()))?;
        let view = RocksView { db: &self.db };
        let (value, changes) = {
            let mut batch = Batch::new(&view);
            let value = op(&mut batch)?;
            (value, batch.into_changes())
        };
        self.commit(&view, changes)?;
        Ok(value)
    }

    fn commit(&self, view: &RocksView<'_>, changes: Changes) -> StoreResult<()> {
        let mut batch = WriteBatch::default();
        for account in &changes.accounts {
            batch.put(account_key(&account.user_id), serde_json::to_vec(account)?);
        }
        for round in &changes.rounds {
            batch.put(round_key(&round.round_id), serde_json::to_vec(round)?);
            batch.put(
                round_number_key(&round.room_id, round.round_number),
                round.round_id.as_bytes(),
            );
        }
        let mut last_tx_id = view.last_tx_id()?;
        for tx in &changes.transactions {
            batch.put(tx_key(tx.id), serde_json::to_vec(tx)?);
            batch.put(user_tx_key(&tx.user_id, tx.id), tx.id.to_be_bytes());
            last_tx_id = last_tx_id.max(tx.id);
        }
        batch.put(LAST_TX_KEY, last_tx_id.to_be_bytes());
        self.db.write(batch)?;
        Ok(())
    }
}

fn read_json<T: DeserializeOwned>(db: &DB, key: &[u8]) -> StoreResult<Option<T>> {
    match db.get(key)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

fn decode_u64(bytes: &[u8]) -> StoreResult<u64> {
    let word: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::Corrupted(format!("expected 8-byte counter, got {}", bytes.len())))?;
    Ok(u64::from_be_bytes(word))
}

struct RocksView<'a> {
    db: &'a DB,
}

impl Snapshot for RocksView<'_> {
    fn load_account(&self, user_id: &str) -> StoreResult<Option<Account>> {
        read_json(self.db, account_key(user_id).as_bytes())
    }

    fn load_round(&self, round_id: &str) -> StoreResult<Option<RoundRecord>> {
        read_json(self.db, round_key(round_id).as_bytes())
    }

    fn last_tx_id(&self) -> StoreResult<u64> {
        match self.db.get(LAST_TX_KEY)? {
            Some(bytes) => decode_u64(&bytes),
            None => Ok(0),
        }
    }
}

#[async_trait]
impl Store for RocksStore {
    async fn open_account(&self, user_id: &str) -> StoreResult<Account> {
        self.transact(|batch| batch.open_account(user_id))
    }

    async fn get_account(&self, user_id: &str) -> StoreResult<Option<Account>> {
        self.read(account_key(user_id).as_bytes())
    }

    async fn list_accounts(&self) -> StoreResult<Vec<Account>> {
        Ok(self
            .scan::<Account>("account:")?
            .into_iter()
            .map(|(_, account)| account)
            .collect())
    }

    async fn apply_delta(&self, update: BalanceUpdate) -> StoreResult<(Account, BalanceTransaction)> {
        self.transact(|batch| batch.apply_delta(&update))
    }

    async fn margin_deposit(&self, user_id: &str, amount: Amount, context: TxContext) -> StoreResult<Account> {
        self.transact(|batch| batch.margin_deposit(user_id, amount, &context))
    }

    async fn transfer_earnings(&self, user_id: &str, amount: Amount, context: TxContext) -> StoreResult<Account> {
        self.transact(|batch| batch.transfer_earnings(user_id, amount, &context))
    }

    async fn transactions_for(&self, user_id: &str) -> StoreResult<Vec<BalanceTransaction>> {
        let prefix = user_tx_prefix(user_id);
        let mut rows = Vec::new();
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            let id = decode_u64(&value)?;
            let tx = self
                .read(tx_key(id).as_bytes())?
                .ok_or_else(|| StoreError::Corrupted(format!("dangling tx index {}", id)))?;
            rows.push(tx);
        }
        Ok(rows)
    }

    async fn all_transactions(&self) -> StoreResult<Vec<BalanceTransaction>> {
        Ok(self
            .scan::<BalanceTransaction>("tx:")?
            .into_iter()
            .map(|(_, tx)| tx)
            .collect())
    }

    async fn collect_stakes(&self, collection: &StakeCollection) -> StoreResult<Vec<UserId>> {
        self.transact(|batch| batch.collect_stakes(collection))
    }

    async fn refund_stakes(&self, collection: &StakeCollection) -> StoreResult<()> {
        self.transact(|batch| batch.refund_stakes(collection, "round cancelled"))
    }

    async fn create_round(&self, round: &RoundRecord) -> StoreResult<()> {
        self.transact(|batch| batch.insert_round(round))
    }

    async fn mark_round_playing(&self, round_id: &str) -> StoreResult<RoundRecord> {
        self.transact(|batch| batch.mark_round_playing(round_id))
    }

    async fn settle_round(&self, plan: &SettlementPlan) -> StoreResult<RoundRecord> {
        self.transact(|batch| batch.settle_round(plan))
    }

    async fn fail_round(&self, round_id: &str, reason: &str) -> StoreResult<RoundRecord> {
        self.transact(|batch| batch.fail_round(round_id, reason))
    }

    async fn get_round(&self, round_id: &str) -> StoreResult<Option<RoundRecord>> {
        self.read(round_key(round_id).as_bytes())
    }

    async fn rounds_for_room(&self, room_id: &str) -> StoreResult<Vec<RoundRecord>> {
        let prefix = round_number_prefix(room_id);
        let mut rounds = Vec::new();
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            let round_id = String::from_utf8(value.to_vec())
                .map_err(|e| StoreError::Corrupted(e.to_string()))?;
            let round: RoundRecord = self
                .read(round_key(&round_id).as_bytes())?
                .ok_or_else(|| StoreError::Corrupted(format!("dangling round index {}", round_id)))?;
            rounds.push(round);
        }
        Ok(rounds)
    }

    async fn put_room(&self, room: &RoomConfig) -> StoreResult<()> {
        self.write(&room_key(&room.room_id), room)
    }

    async fn get_room(&self, room_id: &str) -> StoreResult<Option<RoomConfig>> {
        self.read(room_key(room_id).as_bytes())
    }

    async fn upsert_membership(&self, membership: &Membership) -> StoreResult<()> {
        self.write(&member_key(&membership.room_id, &membership.user_id), membership)
    }

    async fn remove_membership(&self, room_id: &str, user_id: &str) -> StoreResult<()> {
        let key = member_key(room_id, user_id);
        if let Some(mut row) = self.read::<Membership>(key.as_bytes())? {
            row.left_at = Some(Utc::now());
            row.online = false;
            self.write(&key, &row)?;
        }
        Ok(())
    }

    async fn list_memberships(&self, room_id: &str) -> StoreResult<Vec<Membership>> {
        Ok(self
            .scan::<Membership>(&member_prefix(room_id))?
            .into_iter()
            .map(|(_, row)| row)
            .filter(|row| row.left_at.is_none())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::{RoundStatus, TransactionType};
    use tempfile::TempDir;

    fn deposit(user: &str, units: i64) -> BalanceUpdate {
        BalanceUpdate {
            user_id: user.to_string(),
            amount: Amount::from_units(units),
            expected_version: None,
            tx_type: TransactionType::Deposit,
            context: TxContext::remark("opening deposit"),
        }
    }

    #[tokio::test]
    async fn test_ledger_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = RocksStore::open(dir.path()).unwrap();
            store.apply_delta(deposit("alice", 30)).await.unwrap();
            store.apply_delta(deposit("bob", 30)).await.unwrap();
            store
                .collect_stakes(&StakeCollection {
                    room_id: "room-1".into(),
                    round_id: "round-1".into(),
                    stake: Amount::from_units(10),
                    users: vec!["alice".into(), "bob".into()],
                })
                .await
                .unwrap();
            let round = RoundRecord::open(
                "round-1".into(),
                "room-1".into(),
                1,
                vec!["alice".into(), "bob".into()],
                vec![],
                Amount::from_units(10),
                "hash".into(),
            );
            store.create_round(&round).await.unwrap();
        }

        let store = RocksStore::open(dir.path()).unwrap();
        let alice = store.get_account("alice").await.unwrap().unwrap();
        assert_eq!(alice.available, Amount::from_units(20));
        assert_eq!(alice.version, 2);

        let log = store.all_transactions().await.unwrap();
        assert_eq!(log.iter().map(|tx| tx.id).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert_eq!(store.transactions_for("bob").await.unwrap().len(), 2);

        let (_, tx) = store.apply_delta(deposit("carol", 1)).await.unwrap();
        assert_eq!(tx.id, 5);

        let rounds = store.rounds_for_room("room-1").await.unwrap();
        assert_eq!(rounds.len(), 1);
        assert_eq!(rounds[0].status, RoundStatus::Betting);

        let failed = store.fail_round("round-1", "interrupted").await.unwrap();
        assert_eq!(failed.status, RoundStatus::Failed);
        assert_eq!(
            store.get_account("alice").await.unwrap().unwrap().available,
            Amount::from_units(30)
        );
    }

    #[tokio::test]
    async fn test_rounds_ordered_by_number() {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        for (id, number) in [("r-b", 2u64), ("r-a", 10), ("r-c", 1)] {
            let round = RoundRecord::open(
                id.into(),
                "room-1".into(),
                number,
                vec![],
                vec![],
                Amount::from_units(1),
                "hash".into(),
            );
            store.create_round(&round).await.unwrap();
        }
        let numbers: Vec<u64> = store
            .rounds_for_room("room-1")
            .await
            .unwrap()
            .iter()
            .map(|r| r.round_number)
            .collect();
        assert_eq!(numbers, vec![1, 2, 10]);
        assert!(store.rounds_for_room("room-10").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_membership_and_room_rows() {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        let room = RoomConfig {
            room_id: "room-1".into(),
            operator_id: "op".into(),
            stake: Amount::from_units(10),
            winner_count: 1,
            max_participants: 4,
            operator_rate: crate::money::Rate::from_bps(300),
            platform_rate: crate::money::Rate::from_bps(200),
        };
        store.put_room(&room).await.unwrap();
        assert_eq!(store.get_room("room-1").await.unwrap(), Some(room));

        for user in ["a", "b"] {
            store
                .upsert_membership(&Membership {
                    room_id: "room-1".into(),
                    user_id: user.into(),
                    ready: false,
                    online: true,
                    joined_at: Utc::now(),
                    left_at: None,
                })
                .await
                .unwrap();
        }
        store.remove_membership("room-1", "a").await.unwrap();
        let active = store.list_memberships("room-1").await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].user_id, "b");
    }

    #[tokio::test]
    async fn test_open_fresh_clears_data() {
        let dir = TempDir::new().unwrap();
        {
            let store = RocksStore::open(dir.path()).unwrap();
            store.apply_delta(deposit("alice", 5)).await.unwrap();
        }
        let store = RocksStore::open_fresh(dir.path()).unwrap();
        assert!(store.get_account("alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_scans_do_not_leak_across_colon_ids() {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();

        store.apply_delta(deposit("alice", 10)).await.unwrap();
        store.apply_delta(deposit("alice:vip", 20)).await.unwrap();
        store.apply_delta(deposit("alice:vip", 5)).await.unwrap();
        assert_eq!(store.transactions_for("alice").await.unwrap().len(), 1);
        assert_eq!(store.transactions_for("alice:vip").await.unwrap().len(), 2);

        for (room, user) in [("room-1", "u1"), ("room-1:vip", "u9")] {
            store
                .upsert_membership(&Membership {
                    room_id: room.into(),
                    user_id: user.into(),
                    ready: false,
                    online: true,
                    joined_at: Utc::now(),
                    left_at: None,
                })
                .await
                .unwrap();
        }
        let members: Vec<UserId> = store
            .list_memberships("room-1")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.user_id)
            .collect();
        assert_eq!(members, vec!["u1"]);

        for (round_id, room) in [("r-a", "room-1"), ("r-b", "room-1:vip")] {
            store
                .create_round(&RoundRecord::open(
                    round_id.into(),
                    room.into(),
                    1,
                    vec![],
                    vec![],
                    Amount::from_units(10),
                    "hash".into(),
                ))
                .await
                .unwrap();
        }
        let rounds = store.rounds_for_room("room-1").await.unwrap();
        assert_eq!(rounds.len(), 1);
        assert_eq!(rounds[0].round_id, "r-a");
    }
}
