//! Ledger store and durable room tables.
//!
//! One `Store` covers the account table, the append-only transaction log, room
//! configs, room membership and game rounds. Every multi-row operation
//! (stake collection, settlement, refund) is applied as a single atomic unit:
//! either all rows change or none do.

mod batch;
pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::RocksStore;

use crate::{
    common::types::{
        Account, BalanceTransaction, Membership, RoomConfig, RoomId, RoundId, RoundRecord,
        TransactionType, TxContext, UserId,
    },
    errors::StoreResult,
    money::Amount,
};
use async_trait::async_trait;

/// Single-account conditional mutation of the available balance
#[derive(Debug, Clone)]
pub struct BalanceUpdate {
    pub user_id: UserId,
    /// Signed delta; negative debits
    pub amount: Amount,
    /// Apply only if the account is still at this version
    pub expected_version: Option<u64>,
    pub tx_type: TransactionType,
    pub context: TxContext,
}

/// Batch stake debit (or its reversal) for one round
#[derive(Debug, Clone)]
pub struct StakeCollection {
    pub room_id: RoomId,
    pub round_id: RoundId,
    pub stake: Amount,
    pub users: Vec<UserId>,
}

/// Everything needed to settle a round in one transaction
#[derive(Debug, Clone)]
pub struct SettlementPlan {
    pub round_id: RoundId,
    pub operator_id: UserId,
    pub platform_account: UserId,
    pub winners: Vec<UserId>,
    pub prize_per_winner: Amount,
    pub operator_earning: Amount,
    /// Platform commission before the rounding residual is added
    pub platform_earning: Amount,
    pub residual: Amount,
    pub reveal_seed: String,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Create the account if missing and return its current row
    async fn open_account(&self, user_id: &str) -> StoreResult<Account>;

    async fn get_account(&self, user_id: &str) -> StoreResult<Option<Account>>;

    async fn list_accounts(&self) -> StoreResult<Vec<Account>>;

    /// Conditional single-row update; fails with `VersionConflict` when
    /// `expected_version` is stale and `InsufficientBalance` when the result
    /// would be negative.
    async fn apply_delta(&self, update: BalanceUpdate) -> StoreResult<(Account, BalanceTransaction)>;

    /// Move funds from available to frozen
    async fn margin_deposit(&self, user_id: &str, amount: Amount, context: TxContext) -> StoreResult<Account>;

    /// Move operator commission earnings into the available balance
    async fn transfer_earnings(&self, user_id: &str, amount: Amount, context: TxContext) -> StoreResult<Account>;

    async fn transactions_for(&self, user_id: &str) -> StoreResult<Vec<BalanceTransaction>>;

    /// Full log in id order
    async fn all_transactions(&self) -> StoreResult<Vec<BalanceTransaction>>;

    /// Debit `stake` from every user who can afford it. Unaffordable or
    /// unknown accounts are left out of the result rather than failing.
    async fn collect_stakes(&self, collection: &StakeCollection) -> StoreResult<Vec<UserId>>;

    /// Credit `stake` back to every listed user
    async fn refund_stakes(&self, collection: &StakeCollection) -> StoreResult<()>;

    async fn create_round(&self, round: &RoundRecord) -> StoreResult<()>;

    async fn mark_round_playing(&self, round_id: &str) -> StoreResult<RoundRecord>;

    /// Credit winners and commission accounts and mark the round settled
    async fn settle_round(&self, plan: &SettlementPlan) -> StoreResult<RoundRecord>;

    /// Refund every participant and mark the round failed
    async fn fail_round(&self, round_id: &str, reason: &str) -> StoreResult<RoundRecord>;

    async fn get_round(&self, round_id: &str) -> StoreResult<Option<RoundRecord>>;

    /// Rounds of a room ordered by round number
    async fn rounds_for_room(&self, room_id: &str) -> StoreResult<Vec<RoundRecord>>;

    async fn put_room(&self, room: &RoomConfig) -> StoreResult<()>;

    async fn get_room(&self, room_id: &str) -> StoreResult<Option<RoomConfig>>;

    async fn upsert_membership(&self, membership: &Membership) -> StoreResult<()>;

    /// Stamp `left_at`; the row no longer appears in `list_memberships`
    async fn remove_membership(&self, room_id: &str, user_id: &str) -> StoreResult<()>;

    /// Active (not left) memberships of a room
    async fn list_memberships(&self, room_id: &str) -> StoreResult<Vec<Membership>>;
}
