//! Staged unit of work shared by every store backend.
//!
//! A `Batch` reads committed rows through a `Snapshot`, stages all writes in
//! memory and hands them back as a `Changes` set. Backends commit `Changes`
//! in one step (a map swap or a RocksDB `WriteBatch`) while holding their
//! commit lock, so a failed operation leaves nothing behind.

use super::{BalanceUpdate, SettlementPlan, StakeCollection};
use crate::{
    common::types::{
        Account, BalanceTransaction, Bucket, RoundRecord, RoundStatus, TransactionType, TxContext,
        UserId,
    },
    errors::{StoreError, StoreResult},
    money::Amount,
};
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};

/// Read access to committed rows
pub(crate) trait Snapshot {
    fn load_account(&self, user_id: &str) -> StoreResult<Option<Account>>;
    fn load_round(&self, round_id: &str) -> StoreResult<Option<RoundRecord>>;
    fn last_tx_id(&self) -> StoreResult<u64>;
}

/// Rows written by one unit of work
#[derive(Debug, Default)]
pub(crate) struct Changes {
    pub accounts: Vec<Account>,
    pub rounds: Vec<RoundRecord>,
    pub transactions: Vec<BalanceTransaction>,
}

pub(crate) struct Batch<'a, S: Snapshot> {
    base: &'a S,
    accounts: BTreeMap<UserId, Account>,
    rounds: BTreeMap<String, RoundRecord>,
    transactions: Vec<BalanceTransaction>,
    next_tx_id: Option<u64>,
}

impl<'a, S: Snapshot> Batch<'a, S> {
    pub fn new(base: &'a S) -> Self {
        Self {
            base,
            accounts: BTreeMap::new(),
            rounds: BTreeMap::new(),
            transactions: Vec::new(),
            next_tx_id: None,
        }
    }

    pub fn into_changes(self) -> Changes {
        Changes {
            accounts: self.accounts.into_values().collect(),
            rounds: self.rounds.into_values().collect(),
            transactions: self.transactions,
        }
    }

    pub fn account(&mut self, user_id: &str) -> StoreResult<Option<Account>> {
        if let Some(account) = self.accounts.get(user_id) {
            return Ok(Some(account.clone()));
        }
        self.base.load_account(user_id)
    }

    fn account_or_open(&mut self, user_id: &str) -> StoreResult<Account> {
        Ok(self
            .account(user_id)?
            .unwrap_or_else(|| Account::new(user_id)))
    }

    fn require_account(&mut self, user_id: &str) -> StoreResult<Account> {
        self.account(user_id)?
            .ok_or_else(|| StoreError::AccountNotFound(user_id.to_string()))
    }

    pub fn open_account(&mut self, user_id: &str) -> StoreResult<Account> {
        if let Some(existing) = self.account(user_id)? {
            return Ok(existing);
        }
        let account = Account::new(user_id);
        self.accounts.insert(user_id.to_string(), account.clone());
        Ok(account)
    }

    pub fn round(&mut self, round_id: &str) -> StoreResult<RoundRecord> {
        if let Some(round) = self.rounds.get(round_id) {
            return Ok(round.clone());
        }
        self.base
            .load_round(round_id)?
            .ok_or_else(|| StoreError::RoundNotFound(round_id.to_string()))
    }

    pub fn insert_round(&mut self, round: &RoundRecord) -> StoreResult<()> {
        if self.rounds.contains_key(&round.round_id) || self.base.load_round(&round.round_id)?.is_some() {
            return Err(StoreError::Backend(format!("round {} already exists", round.round_id)));
        }
        self.rounds.insert(round.round_id.clone(), round.clone());
        Ok(())
    }

    fn put_round(&mut self, round: RoundRecord) {
        self.rounds.insert(round.round_id.clone(), round);
    }

    fn allocate_tx_id(&mut self) -> StoreResult<u64> {
        let next = match self.next_tx_id {
            Some(id) => id,
            None => self.base.last_tx_id()? + 1,
        };
        self.next_tx_id = Some(next + 1);
        Ok(next)
    }

    /// Apply a signed delta to one bucket and append the matching log row.
    /// Rejects, never clamps, a negative result. The account is not staged.
    fn post(
        &mut self,
        account: &mut Account,
        bucket: Bucket,
        amount: Amount,
        tx_type: TransactionType,
        context: &TxContext,
    ) -> StoreResult<BalanceTransaction> {
        let slot = match bucket {
            Bucket::Available => &mut account.available,
            Bucket::Frozen => &mut account.frozen,
            Bucket::Earnings => &mut account.earnings,
        };
        let before = *slot;
        let after = before
            .checked_add(amount)
            .ok_or_else(|| StoreError::InvalidAmount(format!("overflow applying {}", amount)))?;
        if after.is_negative() {
            return Err(StoreError::InsufficientBalance {
                user_id: account.user_id.clone(),
                required: -amount,
                available: before,
            });
        }
        *slot = after;

        let tx = BalanceTransaction {
            id: self.allocate_tx_id()?,
            user_id: account.user_id.clone(),
            bucket,
            room_id: context.room_id.clone(),
            round_id: context.round_id.clone(),
            tx_type,
            amount,
            balance_before: before,
            balance_after: after,
            remark: context.remark.clone(),
            created_at: Utc::now(),
        };
        self.transactions.push(tx.clone());
        Ok(tx)
    }

    /// Bump the version once and stage the account row
    fn stage(&mut self, mut account: Account) -> Account {
        account.version += 1;
        account.updated_at = Utc::now();
        self.accounts.insert(account.user_id.clone(), account.clone());
        account
    }

    /// Single-row mutation: one log row, one version bump
    fn mutate(
        &mut self,
        mut account: Account,
        bucket: Bucket,
        amount: Amount,
        tx_type: TransactionType,
        context: &TxContext,
    ) -> StoreResult<(Account, BalanceTransaction)> {
        let tx = self.post(&mut account, bucket, amount, tx_type, context)?;
        Ok((self.stage(account), tx))
    }

    pub fn apply_delta(&mut self, update: &BalanceUpdate) -> StoreResult<(Account, BalanceTransaction)> {
        if update.amount == Amount::ZERO {
            return Err(StoreError::InvalidAmount("delta must be non-zero".to_string()));
        }
        let account = if update.amount.is_negative() {
            self.require_account(&update.user_id)?
        } else {
            self.account_or_open(&update.user_id)?
        };
        if let Some(expected) = update.expected_version {
            if account.version != expected {
                return Err(StoreError::VersionConflict {
                    user_id: update.user_id.clone(),
                    expected,
                    actual: account.version,
                });
            }
        }
        self.mutate(account, Bucket::Available, update.amount, update.tx_type, &update.context)
    }

    /// available -> frozen, one row per side under a single version bump
    pub fn margin_deposit(&mut self, user_id: &str, amount: Amount, context: &TxContext) -> StoreResult<Account> {
        require_positive(amount)?;
        let mut account = self.require_account(user_id)?;
        self.post(&mut account, Bucket::Available, -amount, TransactionType::MarginDeposit, context)?;
        self.post(&mut account, Bucket::Frozen, amount, TransactionType::MarginDeposit, context)?;
        Ok(self.stage(account))
    }

    /// earnings -> available, one row per side under a single version bump
    pub fn transfer_earnings(&mut self, user_id: &str, amount: Amount, context: &TxContext) -> StoreResult<Account> {
        require_positive(amount)?;
        let mut account = self.require_account(user_id)?;
        self.post(&mut account, Bucket::Earnings, -amount, TransactionType::EarningsTransfer, context)?;
        self.post(&mut account, Bucket::Available, amount, TransactionType::EarningsTransfer, context)?;
        Ok(self.stage(account))
    }

    pub fn collect_stakes(&mut self, collection: &StakeCollection) -> StoreResult<Vec<UserId>> {
        require_positive(collection.stake)?;
        let context = TxContext::round(&collection.room_id, &collection.round_id, "round stake");
        let mut seen = BTreeSet::new();
        let mut collected = Vec::new();
        for user_id in &collection.users {
            if !seen.insert(user_id.clone()) {
                continue;
            }
            let Some(account) = self.account(user_id)? else {
                continue;
            };
            if account.available < collection.stake {
                continue;
            }
            self.mutate(account, Bucket::Available, -collection.stake, TransactionType::Bet, &context)?;
            collected.push(user_id.clone());
        }
        Ok(collected)
    }

    pub fn refund_stakes(&mut self, collection: &StakeCollection, remark: &str) -> StoreResult<()> {
        require_positive(collection.stake)?;
        let context = TxContext::round(&collection.room_id, &collection.round_id, remark);
        for user_id in &collection.users {
            let account = self.account_or_open(user_id)?;
            self.mutate(account, Bucket::Available, collection.stake, TransactionType::Refund, &context)?;
        }
        Ok(())
    }

    fn advance_round(&mut self, round_id: &str, next: RoundStatus) -> StoreResult<RoundRecord> {
        let round = self.round(round_id)?;
        if !round.status.can_advance_to(next) {
            return Err(StoreError::InvalidRoundTransition {
                round_id: round_id.to_string(),
                from: round.status.to_string(),
                to: next.to_string(),
            });
        }
        Ok(round)
    }

    pub fn mark_round_playing(&mut self, round_id: &str) -> StoreResult<RoundRecord> {
        let mut round = self.advance_round(round_id, RoundStatus::Playing)?;
        round.status = RoundStatus::Playing;
        self.put_round(round.clone());
        Ok(round)
    }

    pub fn settle_round(&mut self, plan: &SettlementPlan) -> StoreResult<RoundRecord> {
        let mut round = self.advance_round(&plan.round_id, RoundStatus::Settled)?;
        if plan.winners.is_empty() {
            return Err(StoreError::InvalidAmount("settlement without winners".to_string()));
        }
        if let Some(stranger) = plan.winners.iter().find(|w| !round.participants.contains(w)) {
            return Err(StoreError::InvalidAmount(format!(
                "winner {} did not participate in round {}",
                stranger, round.round_id
            )));
        }
        let distributed = plan.prize_per_winner.times(plan.winners.len())
            + plan.operator_earning
            + plan.platform_earning
            + plan.residual;
        if distributed != round.pool {
            return Err(StoreError::InvalidAmount(format!(
                "settlement moves {} but pool is {}",
                distributed, round.pool
            )));
        }

        let context = TxContext::round(&round.room_id, &round.round_id, "round prize");
        if plan.prize_per_winner.is_positive() {
            for winner in &plan.winners {
                let account = self.account_or_open(winner)?;
                self.mutate(account, Bucket::Available, plan.prize_per_winner, TransactionType::Win, &context)?;
            }
        }

        if plan.operator_earning.is_positive() {
            let context = TxContext::round(&round.room_id, &round.round_id, "operator commission");
            let account = self.account_or_open(&plan.operator_id)?;
            self.mutate(account, Bucket::Earnings, plan.operator_earning, TransactionType::Commission, &context)?;
        }

        let platform_total = plan.platform_earning + plan.residual;
        if platform_total != Amount::ZERO {
            let remark = if plan.residual == Amount::ZERO {
                "platform commission".to_string()
            } else {
                format!("platform commission incl. residual {}", plan.residual)
            };
            let context = TxContext::round(&round.room_id, &round.round_id, remark);
            let account = self.account_or_open(&plan.platform_account)?;
            self.mutate(account, Bucket::Available, platform_total, TransactionType::PlatformShare, &context)?;
        }

        round.status = RoundStatus::Settled;
        round.winners = Some(plan.winners.clone());
        round.prize_per_winner = plan.prize_per_winner;
        round.operator_earning = plan.operator_earning;
        round.platform_earning = plan.platform_earning;
        round.residual = plan.residual;
        round.reveal_seed = Some(plan.reveal_seed.clone());
        round.settled_at = Some(Utc::now());
        self.put_round(round.clone());
        Ok(round)
    }

    pub fn fail_round(&mut self, round_id: &str, reason: &str) -> StoreResult<RoundRecord> {
        let mut round = self.advance_round(round_id, RoundStatus::Failed)?;
        let collection = StakeCollection {
            room_id: round.room_id.clone(),
            round_id: round.round_id.clone(),
            stake: round.stake,
            users: round.participants.clone(),
        };
        self.refund_stakes(&collection, &format!("round failed: {}", reason))?;

        round.status = RoundStatus::Failed;
        round.failure_reason = Some(reason.to_string());
        round.settled_at = Some(Utc::now());
        self.put_round(round.clone());
        Ok(round)
    }
}

fn require_positive(amount: Amount) -> StoreResult<()> {
    if amount.is_positive() {
        Ok(())
    } else {
        Err(StoreError::InvalidAmount(format!("{} must be positive", amount)))
    }
}
