//! Round settlement
//!
//! Split computation plus the round-level ledger steps the room processor
//! drives: collect stakes, open the round row, settle, or fail and refund.
//! Each step is one atomic store call; a step that fails after money moved is
//! always followed by a compensating refund.

use crate::{
    cache::RetryPolicy,
    common::types::{RoomConfig, RoundRecord, UserId},
    errors::SettlementError,
    fairness::SeedCommitment,
    money::{Amount, Rate},
    storage::{SettlementPlan, StakeCollection, Store},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Commission and prize breakdown of one pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Split {
    pub pool: Amount,
    pub operator_earning: Amount,
    pub platform_earning: Amount,
    pub prize_pool: Amount,
    pub prize_per_winner: Amount,
    /// `prize_pool - prize_per_winner * winners`; credited to the platform
    pub residual: Amount,
}

impl Split {
    /// Total the ledger moves out of the pool; always equals `pool`
    pub fn distributed(&self, winner_count: usize) -> Amount {
        self.prize_per_winner.times(winner_count)
            + self.operator_earning
            + self.platform_earning
            + self.residual
    }
}

/// Exact split of `pool` between operator, platform and `winner_count` winners.
///
/// Commissions and the per-winner prize round half away from zero to cents. If
/// rounding the prize up would overdraw the prize pool, the prize is truncated
/// instead so the residual is never negative.
pub fn compute_split(pool: Amount, winner_count: usize, operator_rate: Rate, platform_rate: Rate) -> Split {
    let operator_earning = pool.apply_rate(operator_rate);
    let platform_earning = pool.apply_rate(platform_rate);
    let prize_pool = pool - operator_earning - platform_earning;

    let mut prize_per_winner = prize_pool.split_rounded(winner_count);
    if prize_per_winner.times(winner_count) > prize_pool {
        prize_per_winner = prize_pool.split_floor(winner_count);
    }
    let residual = prize_pool - prize_per_winner.times(winner_count);

    Split {
        pool,
        operator_earning,
        platform_earning,
        prize_pool,
        prize_per_winner,
        residual,
    }
}

/// Outcome of a settled round
#[derive(Debug, Clone)]
pub struct RoundOutcome {
    pub record: RoundRecord,
    pub split: Split,
    pub winners: Vec<UserId>,
}

/// How collected stakes were returned after a round could not go ahead
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundOutcome {
    Refunded,
    /// Refund kept failing; the stakes sit on an open round row that the
    /// next hydrate fails and refunds
    Parked,
}

/// Round-level ledger driver shared by every room
pub struct RoundSettler {
    store: Arc<dyn Store>,
    platform_account: UserId,
    retry: RetryPolicy,
}

impl RoundSettler {
    pub fn new(store: Arc<dyn Store>, platform_account: impl Into<String>) -> Self {
        Self {
            store,
            platform_account: platform_account.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Debit the stake from every affordable candidate; returns who paid
    pub async fn collect(
        &self,
        room: &RoomConfig,
        round_id: &str,
        candidates: &[UserId],
    ) -> Result<Vec<UserId>, SettlementError> {
        let collection = StakeCollection {
            room_id: room.room_id.clone(),
            round_id: round_id.to_string(),
            stake: room.stake,
            users: candidates.to_vec(),
        };
        self.store
            .collect_stakes(&collection)
            .await
            .map_err(SettlementError::Collection)
    }

    /// Return a collected stake to `users` outside any round row
    pub async fn refund(&self, room: &RoomConfig, round_id: &str, users: &[UserId]) -> Result<(), SettlementError> {
        if users.is_empty() {
            return Ok(());
        }
        let collection = StakeCollection {
            room_id: room.room_id.clone(),
            round_id: round_id.to_string(),
            stake: room.stake,
            users: users.to_vec(),
        };
        self.store
            .refund_stakes(&collection)
            .await
            .map_err(SettlementError::Refund)
    }

    /// Return the stakes collected for `record`, retrying with backoff.
    ///
    /// When every attempt fails the record is persisted as an open round so
    /// the stakes stay recoverable. Only if that write fails too are they
    /// stranded, which is returned as `SettlementError::Refund`.
    pub async fn refund_or_park(&self, room: &RoomConfig, record: &RoundRecord) -> Result<RefundOutcome, SettlementError> {
        let mut attempt = 0;
        let refund_err = loop {
            match self.refund(room, &record.round_id, &record.participants).await {
                Ok(()) => return Ok(RefundOutcome::Refunded),
                Err(e) if attempt < self.retry.max_retries => {
                    attempt += 1;
                    tracing::warn!(round_id = %record.round_id, attempt, error = %e, "refund failed, retrying");
                    tokio::time::sleep(self.retry.backoff.saturating_mul(attempt)).await;
                }
                Err(e) => break e,
            }
        };

        match self.store.create_round(record).await {
            Ok(()) => {
                tracing::error!(
                    room_id = %room.room_id,
                    round_id = %record.round_id,
                    error = %refund_err,
                    "refund failed, stakes parked on open round for recovery"
                );
                Ok(RefundOutcome::Parked)
            }
            Err(e) => {
                tracing::error!(
                    room_id = %room.room_id,
                    round_id = %record.round_id,
                    participants = ?record.participants,
                    error = %e,
                    "refund failed and stakes could not be parked"
                );
                Err(refund_err)
            }
        }
    }

    /// Persist the round row; on failure the collected stakes go back.
    ///
    /// Returns `RoundCreation` once refunded, `RefundDeferred` if the stakes
    /// were parked instead.
    pub async fn open_round(&self, room: &RoomConfig, record: &RoundRecord) -> Result<(), SettlementError> {
        if let Err(e) = self.store.create_round(record).await {
            tracing::error!(
                room_id = %room.room_id,
                round_id = %record.round_id,
                error = %e,
                "round creation failed, refunding stakes"
            );
            return match self.refund_or_park(room, record).await? {
                RefundOutcome::Refunded => Err(SettlementError::RoundCreation(e)),
                RefundOutcome::Parked => Err(SettlementError::RefundDeferred(e)),
            };
        }
        Ok(())
    }

    pub async fn start_play(&self, round_id: &str) -> Result<RoundRecord, SettlementError> {
        self.store
            .mark_round_playing(round_id)
            .await
            .map_err(SettlementError::Settlement)
    }

    /// Reveal, pick winners and distribute the pool in one transaction.
    ///
    /// On failure the round is marked failed and every participant refunded
    /// before the error is returned.
    pub async fn settle(
        &self,
        room: &RoomConfig,
        round_id: &str,
        participants: &[UserId],
        pool: Amount,
        commitment: &SeedCommitment,
    ) -> Result<RoundOutcome, SettlementError> {
        let winners = commitment.select_winners(participants, room.winner_count);
        let split = compute_split(pool, winners.len(), room.operator_rate, room.platform_rate);
        let plan = SettlementPlan {
            round_id: round_id.to_string(),
            operator_id: room.operator_id.clone(),
            platform_account: self.platform_account.clone(),
            winners: winners.clone(),
            prize_per_winner: split.prize_per_winner,
            operator_earning: split.operator_earning,
            platform_earning: split.platform_earning,
            residual: split.residual,
            reveal_seed: commitment.reveal(),
        };

        match self.store.settle_round(&plan).await {
            Ok(record) => Ok(RoundOutcome { record, split, winners }),
            Err(e) => {
                tracing::error!(room_id = %room.room_id, round_id, error = %e, "settlement failed");
                self.fail(round_id, &format!("settlement failed: {}", e)).await?;
                Err(SettlementError::Settlement(e))
            }
        }
    }

    /// Mark the round failed and refund its participants
    pub async fn fail(&self, round_id: &str, reason: &str) -> Result<RoundRecord, SettlementError> {
        self.store.fail_round(round_id, reason).await.map_err(|e| {
            tracing::error!(round_id, error = %e, "failing round and refunding stakes failed");
            SettlementError::Refund(e)
        })
    }
}
