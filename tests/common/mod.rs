//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use stakeroom::{
    common::types::{
        Account, BalanceTransaction, Membership, RoomConfig, RoundRecord, TransactionType, TxContext,
        UserId, UserProfile,
    },
    errors::{StoreError, StoreResult},
    money::{Amount, Rate},
    room::events::{RoomEvent, RoomMessage},
    storage::{BalanceUpdate, MemoryStore, SettlementPlan, StakeCollection, Store},
    Broadcaster, NoopRiskChecker, RoomRegistry, ServiceConfig, StaticUserDirectory,
};
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};

/// Captures every outbound message in order
#[derive(Default)]
pub struct RecordingBroadcaster {
    messages: Mutex<Vec<RoomMessage>>,
}

impl RecordingBroadcaster {
    pub fn messages(&self) -> Vec<RoomMessage> {
        self.messages.lock().unwrap().clone()
    }

    pub fn events_of(&self, kind: &str) -> Vec<RoomMessage> {
        self.messages()
            .into_iter()
            .filter(|m| m.event.kind() == kind)
            .collect()
    }

    pub fn clear(&self) {
        self.messages.lock().unwrap().clear();
    }
}

impl Broadcaster for RecordingBroadcaster {
    fn broadcast(&self, room_id: &str, event: RoomEvent) {
        self.messages.lock().unwrap().push(RoomMessage::to_room(room_id, event));
    }

    fn send_to_user(&self, room_id: &str, user_id: &str, event: RoomEvent) {
        self.messages
            .lock()
            .unwrap()
            .push(RoomMessage::to_user(room_id, user_id, event));
    }
}

/// Store wrapper that can be told to fail specific ledger and roster writes
pub struct FaultyStore {
    inner: Arc<dyn Store>,
    pub fail_settle: AtomicBool,
    pub fail_create_round: AtomicBool,
    /// Fail only the next N round creations
    pub create_round_failures: AtomicUsize,
    pub fail_refund: AtomicBool,
    pub fail_remove_membership: AtomicBool,
}

impl FaultyStore {
    pub fn new(inner: Arc<dyn Store>) -> Self {
        Self {
            inner,
            fail_settle: AtomicBool::new(false),
            fail_create_round: AtomicBool::new(false),
            create_round_failures: AtomicUsize::new(0),
            fail_refund: AtomicBool::new(false),
            fail_remove_membership: AtomicBool::new(false),
        }
    }

    fn injected(flag: &AtomicBool, what: &str) -> StoreResult<()> {
        if flag.load(Ordering::SeqCst) {
            Err(StoreError::Backend(format!("injected {} failure", what)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Store for FaultyStore {
    async fn open_account(&self, user_id: &str) -> StoreResult<Account> {
        self.inner.open_account(user_id).await
    }
    async fn get_account(&self, user_id: &str) -> StoreResult<Option<Account>> {
        self.inner.get_account(user_id).await
    }
    async fn list_accounts(&self) -> StoreResult<Vec<Account>> {
        self.inner.list_accounts().await
    }
    async fn apply_delta(&self, update: BalanceUpdate) -> StoreResult<(Account, BalanceTransaction)> {
        self.inner.apply_delta(update).await
    }
    async fn margin_deposit(&self, user_id: &str, amount: Amount, context: TxContext) -> StoreResult<Account> {
        self.inner.margin_deposit(user_id, amount, context).await
    }
    async fn transfer_earnings(&self, user_id: &str, amount: Amount, context: TxContext) -> StoreResult<Account> {
        self.inner.transfer_earnings(user_id, amount, context).await
    }
    async fn transactions_for(&self, user_id: &str) -> StoreResult<Vec<BalanceTransaction>> {
        self.inner.transactions_for(user_id).await
    }
    async fn all_transactions(&self) -> StoreResult<Vec<BalanceTransaction>> {
        self.inner.all_transactions().await
    }
    async fn collect_stakes(&self, collection: &StakeCollection) -> StoreResult<Vec<UserId>> {
        self.inner.collect_stakes(collection).await
    }
    async fn refund_stakes(&self, collection: &StakeCollection) -> StoreResult<()> {
        Self::injected(&self.fail_refund, "refund")?;
        self.inner.refund_stakes(collection).await
    }
    async fn create_round(&self, round: &RoundRecord) -> StoreResult<()> {
        Self::injected(&self.fail_create_round, "round creation")?;
        if self
            .create_round_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Backend("injected round creation failure".to_string()));
        }
        self.inner.create_round(round).await
    }
    async fn mark_round_playing(&self, round_id: &str) -> StoreResult<RoundRecord> {
        self.inner.mark_round_playing(round_id).await
    }
    async fn settle_round(&self, plan: &SettlementPlan) -> StoreResult<RoundRecord> {
        Self::injected(&self.fail_settle, "settlement")?;
        self.inner.settle_round(plan).await
    }
    async fn fail_round(&self, round_id: &str, reason: &str) -> StoreResult<RoundRecord> {
        self.inner.fail_round(round_id, reason).await
    }
    async fn get_round(&self, round_id: &str) -> StoreResult<Option<RoundRecord>> {
        self.inner.get_round(round_id).await
    }
    async fn rounds_for_room(&self, room_id: &str) -> StoreResult<Vec<RoundRecord>> {
        self.inner.rounds_for_room(room_id).await
    }
    async fn put_room(&self, room: &RoomConfig) -> StoreResult<()> {
        self.inner.put_room(room).await
    }
    async fn get_room(&self, room_id: &str) -> StoreResult<Option<RoomConfig>> {
        self.inner.get_room(room_id).await
    }
    async fn upsert_membership(&self, membership: &Membership) -> StoreResult<()> {
        self.inner.upsert_membership(membership).await
    }
    async fn remove_membership(&self, room_id: &str, user_id: &str) -> StoreResult<()> {
        Self::injected(&self.fail_remove_membership, "membership removal")?;
        self.inner.remove_membership(room_id, user_id).await
    }
    async fn list_memberships(&self, room_id: &str) -> StoreResult<Vec<Membership>> {
        self.inner.list_memberships(room_id).await
    }
}

pub struct Harness {
    pub registry: RoomRegistry,
    pub store: Arc<FaultyStore>,
    pub events: Arc<RecordingBroadcaster>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    pub fn with_store(inner: Arc<dyn Store>) -> Self {
        let store = Arc::new(FaultyStore::new(inner));
        let events = Arc::new(RecordingBroadcaster::default());
        let registry = RoomRegistry::from_config(
            &ServiceConfig::testing(),
            store.clone(),
            events.clone(),
            Arc::new(NoopRiskChecker),
            Arc::new(StaticUserDirectory::with_profiles(
                ["p1", "p2", "p3", "p4", "p5"]
                    .iter()
                    .map(|id| UserProfile::new(*id, display_name(id))),
            )),
        )
        .unwrap();
        Self { registry, store, events }
    }

    pub async fn fund(&self, user_id: &str, amount: Amount) {
        self.store
            .apply_delta(BalanceUpdate {
                user_id: user_id.to_string(),
                amount,
                expected_version: None,
                tx_type: TransactionType::Deposit,
                context: TxContext::remark("test deposit"),
            })
            .await
            .unwrap();
    }

    pub async fn available(&self, user_id: &str) -> Amount {
        self.store
            .get_account(user_id)
            .await
            .unwrap()
            .map(|a| a.available)
            .unwrap_or(Amount::ZERO)
    }

    /// Sum of every bucket of every account
    pub async fn total_funds(&self) -> Amount {
        self.store
            .list_accounts()
            .await
            .unwrap()
            .iter()
            .map(|a| a.total())
            .sum()
    }
}

pub fn display_name(user_id: &str) -> String {
    format!("Player {}", user_id.trim_start_matches('p'))
}

/// Stake 10.00, operator 3%, platform 2%
pub fn standard_room(room_id: &str, winner_count: usize, max_participants: usize) -> RoomConfig {
    RoomConfig {
        room_id: room_id.to_string(),
        operator_id: "operator".to_string(),
        stake: Amount::from_units(10),
        winner_count,
        max_participants,
        operator_rate: Rate::from_bps(300),
        platform_rate: Rate::from_bps(200),
    }
}

pub fn units(n: i64) -> Amount {
    Amount::from_units(n)
}
