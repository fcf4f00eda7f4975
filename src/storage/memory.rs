//! In-process store used by tests and ephemeral deployments

use super::{
    batch::{Batch, Changes, Snapshot},
    BalanceUpdate, SettlementPlan, StakeCollection, Store,
};
use crate::{
    common::types::{
        Account, BalanceTransaction, Membership, RoomConfig, RoomId, RoundRecord, TxContext, UserId,
    },
    errors::{StoreError, StoreResult},
    money::Amount,
};
use async_trait::async_trait;
use chrono::Utc;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Mutex,
};

#[derive(Debug, Default)]
struct Tables {
    accounts: HashMap<UserId, Account>,
    transactions: BTreeMap<u64, BalanceTransaction>,
    rounds: HashMap<String, RoundRecord>,
    rooms: HashMap<RoomId, RoomConfig>,
    memberships: BTreeMap<(RoomId, UserId), Membership>,
}

impl Snapshot for Tables {
    fn load_account(&self, user_id: &str) -> StoreResult<Option<Account>> {
        Ok(self.accounts.get(user_id).cloned())
    }

    fn load_round(&self, round_id: &str) -> StoreResult<Option<RoundRecord>> {
        Ok(self.rounds.get(round_id).cloned())
    }

    fn last_tx_id(&self) -> StoreResult<u64> {
        Ok(self.transactions.keys().next_back().copied().unwrap_or(0))
    }
}

impl Tables {
    fn apply(&mut self, changes: Changes) {
        for account in changes.accounts {
            self.accounts.insert(account.user_id.clone(), account);
        }
        for round in changes.rounds {
            self.rounds.insert(round.round_id.clone(), round);
        }
        for tx in changes.transactions {
            self.transactions.insert(tx.id, tx);
        }
    }
}

/// Mutex-guarded tables; every operation stages into a `Batch` and commits
/// only on success.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }

    fn transact<T>(&self, op: impl FnOnce(&mut Batch<'_, Tables>) -> StoreResult<T>) -> StoreResult<T> {
        let mut tables = self.lock()?;
        let (value, changes) = {
            let mut batch = Batch::new(&*tables);
            let value = op(&mut batch)?;
            (value, batch.into_changes())
        };
        tables.apply(changes);
        Ok(value)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn open_account(&self, user_id: &str) -> StoreResult<Account> {
        self.transact(|batch| batch.open_account(user_id))
    }

    async fn get_account(&self, user_id: &str) -> StoreResult<Option<Account>> {
        Ok(self.lock()?.accounts.get(user_id).cloned())
    }

    async fn list_accounts(&self) -> StoreResult<Vec<Account>> {
        let mut accounts: Vec<Account> = self.lock()?.accounts.values().cloned().collect();
        accounts.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(accounts)
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
        Ok(self
            .lock()?
            .transactions
            .values()
            .filter(|tx| tx.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn all_transactions(&self) -> StoreResult<Vec<BalanceTransaction>> {
        Ok(self.lock()?.transactions.values().cloned().collect())
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
        Ok(self.lock()?.rounds.get(round_id).cloned())
    }

    async fn rounds_for_room(&self, room_id: &str) -> StoreResult<Vec<RoundRecord>> {
        let mut rounds: Vec<RoundRecord> = self
            .lock()?
            .rounds
            .values()
            .filter(|r| r.room_id == room_id)
            .cloned()
            .collect();
        rounds.sort_by_key(|r| r.round_number);
        Ok(rounds)
    }

    async fn put_room(&self, room: &RoomConfig) -> StoreResult<()> {
        self.lock()?.rooms.insert(room.room_id.clone(), room.clone());
        Ok(())
    }

    async fn get_room(&self, room_id: &str) -> StoreResult<Option<RoomConfig>> {
        Ok(self.lock()?.rooms.get(room_id).cloned())
    }

    async fn upsert_membership(&self, membership: &Membership) -> StoreResult<()> {
        self.lock()?.memberships.insert(
            (membership.room_id.clone(), membership.user_id.clone()),
            membership.clone(),
        );
        Ok(())
    }

    async fn remove_membership(&self, room_id: &str, user_id: &str) -> StoreResult<()> {
        let mut tables = self.lock()?;
        if let Some(row) = tables
            .memberships
            .get_mut(&(room_id.to_string(), user_id.to_string()))
        {
            row.left_at = Some(Utc::now());
            row.online = false;
        }
        Ok(())
    }

    async fn list_memberships(&self, room_id: &str) -> StoreResult<Vec<Membership>> {
        Ok(self
            .lock()?
            .memberships
            .values()
            .filter(|m| m.room_id == room_id && m.left_at.is_none())
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::{Bucket, RoundStatus, TransactionType};

    fn deposit(user: &str, units: i64) -> BalanceUpdate {
        BalanceUpdate {
            user_id: user.to_string(),
            amount: Amount::from_units(units),
            expected_version: None,
            tx_type: TransactionType::Deposit,
            context: TxContext::remark("opening deposit"),
        }
    }

    async fn funded(users: &[(&str, i64)]) -> MemoryStore {
        let store = MemoryStore::new();
        for (user, units) in users {
            store.apply_delta(deposit(user, *units)).await.unwrap();
        }
        store
    }

    fn collection(users: &[&str]) -> StakeCollection {
        StakeCollection {
            room_id: "room-1".into(),
            round_id: "round-1".into(),
            stake: Amount::from_units(10),
            users: users.iter().map(|u| u.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_versions_and_tx_log() {
        let store = funded(&[("alice", 50)]).await;
        let account = store.get_account("alice").await.unwrap().unwrap();
        assert_eq!(account.version, 1);

        let (account, tx) = store
            .apply_delta(BalanceUpdate {
                amount: Amount::from_units(-20),
                expected_version: Some(1),
                tx_type: TransactionType::Withdraw,
                ..deposit("alice", 0)
            })
            .await
            .unwrap();
        assert_eq!(account.available, Amount::from_units(30));
        assert_eq!(account.version, 2);
        assert_eq!(tx.balance_before, Amount::from_units(50));
        assert_eq!(tx.balance_after, Amount::from_units(30));
        assert_eq!(tx.id, 2);

        let stale = store
            .apply_delta(BalanceUpdate {
                amount: Amount::from_units(-1),
                expected_version: Some(1),
                tx_type: TransactionType::Withdraw,
                ..deposit("alice", 0)
            })
            .await;
        assert!(matches!(stale, Err(StoreError::VersionConflict { expected: 1, actual: 2, .. })));
    }

    #[tokio::test]
    async fn test_debit_never_goes_negative() {
        let store = funded(&[("bob", 5)]).await;
        let result = store
            .apply_delta(BalanceUpdate {
                amount: Amount::from_units(-6),
                tx_type: TransactionType::Withdraw,
                ..deposit("bob", 0)
            })
            .await;
        assert!(matches!(result, Err(StoreError::InsufficientBalance { .. })));
        let account = store.get_account("bob").await.unwrap().unwrap();
        assert_eq!(account.available, Amount::from_units(5));
        assert_eq!(store.all_transactions().await.unwrap().len(), 1);

        let missing = store
            .apply_delta(BalanceUpdate {
                amount: Amount::from_units(-1),
                tx_type: TransactionType::Withdraw,
                ..deposit("nobody", 0)
            })
            .await;
        assert!(matches!(missing, Err(StoreError::AccountNotFound(_))));
    }

    #[tokio::test]
    async fn test_collect_skips_unaffordable() {
        let store = funded(&[("a", 10), ("b", 9), ("c", 30)]).await;
        let collected = store
            .collect_stakes(&collection(&["a", "b", "c", "ghost"]))
            .await
            .unwrap();
        assert_eq!(collected, vec!["a", "c"]);
        assert_eq!(store.get_account("a").await.unwrap().unwrap().available, Amount::ZERO);
        assert_eq!(store.get_account("b").await.unwrap().unwrap().available, Amount::from_units(9));
        assert!(store.get_account("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_settle_and_fail_are_terminal() {
        let store = funded(&[("a", 10), ("b", 10)]).await;
        store.collect_stakes(&collection(&["a", "b"])).await.unwrap();
        let round = RoundRecord::open(
            "round-1".into(),
            "room-1".into(),
            1,
            vec!["a".into(), "b".into()],
            vec![],
            Amount::from_units(10),
            "hash".into(),
        );
        store.create_round(&round).await.unwrap();
        assert!(store.create_round(&round).await.is_err());

        let plan = SettlementPlan {
            round_id: "round-1".into(),
            operator_id: "op".into(),
            platform_account: "platform".into(),
            winners: vec!["a".into()],
            prize_per_winner: Amount::from_units(19),
            operator_earning: Amount::from_minor(60),
            platform_earning: Amount::from_minor(40),
            residual: Amount::ZERO,
            reveal_seed: "seed".into(),
        };
        let settled = store.settle_round(&plan).await.unwrap();
        assert_eq!(settled.status, RoundStatus::Settled);
        assert_eq!(store.get_account("a").await.unwrap().unwrap().available, Amount::from_units(19));
        assert_eq!(store.get_account("op").await.unwrap().unwrap().earnings, Amount::from_minor(60));
        assert_eq!(
            store.get_account("platform").await.unwrap().unwrap().available,
            Amount::from_minor(40)
        );

        assert!(matches!(
            store.fail_round("round-1", "late").await,
            Err(StoreError::InvalidRoundTransition { .. })
        ));
        assert!(matches!(
            store.settle_round(&plan).await,
            Err(StoreError::InvalidRoundTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_unbalanced_plan_changes_nothing() {
        let store = funded(&[("a", 10), ("b", 10)]).await;
        store.collect_stakes(&collection(&["a", "b"])).await.unwrap();
        let round = RoundRecord::open(
            "round-1".into(),
            "room-1".into(),
            1,
            vec!["a".into(), "b".into()],
            vec![],
            Amount::from_units(10),
            "hash".into(),
        );
        store.create_round(&round).await.unwrap();
        let before = store.all_transactions().await.unwrap().len();

        let plan = SettlementPlan {
            round_id: "round-1".into(),
            operator_id: "op".into(),
            platform_account: "platform".into(),
            winners: vec!["a".into()],
            prize_per_winner: Amount::from_units(25),
            operator_earning: Amount::ZERO,
            platform_earning: Amount::ZERO,
            residual: Amount::ZERO,
            reveal_seed: "seed".into(),
        };
        assert!(store.settle_round(&plan).await.is_err());
        assert_eq!(store.all_transactions().await.unwrap().len(), before);
        assert_eq!(store.get_round("round-1").await.unwrap().unwrap().status, RoundStatus::Betting);
    }

    #[tokio::test]
    async fn test_fail_round_refunds_participants() {
        let store = funded(&[("a", 10), ("b", 15)]).await;
        store.collect_stakes(&collection(&["a", "b"])).await.unwrap();
        let round = RoundRecord::open(
            "round-1".into(),
            "room-1".into(),
            1,
            vec!["a".into(), "b".into()],
            vec![],
            Amount::from_units(10),
            "hash".into(),
        );
        store.create_round(&round).await.unwrap();
        store.mark_round_playing("round-1").await.unwrap();

        let failed = store.fail_round("round-1", "settlement failed").await.unwrap();
        assert_eq!(failed.status, RoundStatus::Failed);
        assert_eq!(failed.failure_reason.as_deref(), Some("settlement failed"));
        assert_eq!(store.get_account("a").await.unwrap().unwrap().available, Amount::from_units(10));
        assert_eq!(store.get_account("b").await.unwrap().unwrap().available, Amount::from_units(15));

        let refunds = store
            .transactions_for("a")
            .await
            .unwrap()
            .into_iter()
            .filter(|tx| tx.tx_type == TransactionType::Refund)
            .count();
        assert_eq!(refunds, 1);
    }

    /// Sum of a user's log amounts must equal the sum of their buckets
    async fn assert_log_matches_buckets(store: &MemoryStore, user: &str) {
        let logged: Amount = store
            .transactions_for(user)
            .await
            .unwrap()
            .iter()
            .map(|tx| tx.amount)
            .sum();
        let account = store.get_account(user).await.unwrap().unwrap();
        assert_eq!(logged, account.total(), "log vs buckets for {}", user);
    }

    #[tokio::test]
    async fn test_margin_deposit_logs_both_buckets() {
        let store = funded(&[("op", 100)]).await;
        let account = store
            .margin_deposit("op", Amount::from_units(40), TxContext::remark("room margin"))
            .await
            .unwrap();
        assert_eq!(account.available, Amount::from_units(60));
        assert_eq!(account.frozen, Amount::from_units(40));
        assert_eq!(account.total(), Amount::from_units(100));
        assert_eq!(account.version, 2);
        assert_log_matches_buckets(&store, "op").await;

        let rows = store.transactions_for("op").await.unwrap();
        let margin: Vec<(Bucket, Amount)> = rows
            .iter()
            .filter(|tx| tx.tx_type == TransactionType::MarginDeposit)
            .map(|tx| (tx.bucket, tx.amount))
            .collect();
        assert_eq!(
            margin,
            vec![
                (Bucket::Available, Amount::from_units(-40)),
                (Bucket::Frozen, Amount::from_units(40)),
            ]
        );

        let before = store.all_transactions().await.unwrap().len();
        assert!(store
            .margin_deposit("op", Amount::from_units(61), TxContext::remark("too much"))
            .await
            .is_err());
        assert_eq!(store.all_transactions().await.unwrap().len(), before);
    }

    #[tokio::test]
    async fn test_commission_earnings_transfer_to_available() {
        let store = funded(&[("a", 10), ("b", 10)]).await;
        store.collect_stakes(&collection(&["a", "b"])).await.unwrap();
        let round = RoundRecord::open(
            "round-1".into(),
            "room-1".into(),
            1,
            vec!["a".into(), "b".into()],
            vec![],
            Amount::from_units(10),
            "hash".into(),
        );
        store.create_round(&round).await.unwrap();
        store
            .settle_round(&SettlementPlan {
                round_id: "round-1".into(),
                operator_id: "op".into(),
                platform_account: "platform".into(),
                winners: vec!["a".into()],
                prize_per_winner: Amount::from_minor(1850),
                operator_earning: Amount::from_units(1),
                platform_earning: Amount::from_minor(50),
                residual: Amount::ZERO,
                reveal_seed: "seed".into(),
            })
            .await
            .unwrap();

        let op = store.get_account("op").await.unwrap().unwrap();
        assert_eq!(op.earnings, Amount::from_units(1));
        assert_eq!(op.available, Amount::ZERO);
        assert_log_matches_buckets(&store, "op").await;

        let op = store
            .transfer_earnings("op", Amount::from_minor(60), TxContext::remark("payout"))
            .await
            .unwrap();
        assert_eq!(op.earnings, Amount::from_minor(40));
        assert_eq!(op.available, Amount::from_minor(60));
        assert_eq!(op.version, 2);
        assert_log_matches_buckets(&store, "op").await;

        assert!(matches!(
            store
                .transfer_earnings("op", Amount::from_units(1), TxContext::remark("overdraw"))
                .await,
            Err(StoreError::InsufficientBalance { .. })
        ));
        for user in ["a", "b", "op", "platform"] {
            assert_log_matches_buckets(&store, user).await;
        }
    }

    #[tokio::test]
    async fn test_membership_soft_delete() {
        let store = MemoryStore::new();
        let row = Membership {
            room_id: "room-1".into(),
            user_id: "alice".into(),
            ready: true,
            online: true,
            joined_at: Utc::now(),
            left_at: None,
        };
        store.upsert_membership(&row).await.unwrap();
        assert_eq!(store.list_memberships("room-1").await.unwrap().len(), 1);
        store.remove_membership("room-1", "alice").await.unwrap();
        assert!(store.list_memberships("room-1").await.unwrap().is_empty());
    }
}
