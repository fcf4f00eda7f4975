//! Shared record types for accounts, rooms and rounds
//!
//! These are the durable shapes persisted by every `Store` implementation and
//! consumed by the room processor and settlement layer.

use crate::{
    errors::ConfigError,
    money::{Amount, Rate},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type UserId = String;
pub type RoomId = String;
pub type RoundId = String;

/// Identity of a user as seen by a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: UserId,
    pub display_name: String,
}

impl UserProfile {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Ledger account. Every successful mutation bumps `version` by exactly one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub user_id: UserId,
    pub available: Amount,
    pub frozen: Amount,
    /// Operator commission-earning sub-balance
    #[serde(default)]
    pub earnings: Amount,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            available: Amount::ZERO,
            frozen: Amount::ZERO,
            earnings: Amount::ZERO,
            version: 0,
            updated_at: Utc::now(),
        }
    }

    /// Sum of all buckets, used by conservation checks
    pub fn total(&self) -> Amount {
        self.available + self.frozen + self.earnings
    }
}

/// Kind of balance mutation recorded in the transaction log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransactionType {
    Bet,
    Win,
    Refund,
    Deposit,
    Withdraw,
    Commission,
    PlatformShare,
    MarginDeposit,
    EarningsTransfer,
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionType::Bet => "bet",
            TransactionType::Win => "win",
            TransactionType::Refund => "refund",
            TransactionType::Deposit => "deposit",
            TransactionType::Withdraw => "withdraw",
            TransactionType::Commission => "commission",
            TransactionType::PlatformShare => "platform-share",
            TransactionType::MarginDeposit => "margin-deposit",
            TransactionType::EarningsTransfer => "earnings-transfer",
        };
        write!(f, "{}", name)
    }
}

/// Account sub-balance a log row moved
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    #[default]
    Available,
    Frozen,
    Earnings,
}

/// Append-only transaction log row.
///
/// `balance_before`/`balance_after` describe `bucket` only. A transfer
/// between buckets writes one row per side, so summing `amount` over a
/// user's rows always gives `Account::total`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceTransaction {
    pub id: u64,
    pub user_id: UserId,
    #[serde(default)]
    pub bucket: Bucket,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub room_id: Option<RoomId>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub round_id: Option<RoundId>,
    pub tx_type: TransactionType,
    pub amount: Amount,
    pub balance_before: Amount,
    pub balance_after: Amount,
    pub remark: String,
    pub created_at: DateTime<Utc>,
}

/// Room/round the mutation belongs to, if any
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxContext {
    pub room_id: Option<RoomId>,
    pub round_id: Option<RoundId>,
    pub remark: String,
}

impl TxContext {
    pub fn remark(remark: impl Into<String>) -> Self {
        Self {
            remark: remark.into(),
            ..Default::default()
        }
    }

    pub fn round(room_id: &str, round_id: &str, remark: impl Into<String>) -> Self {
        Self {
            room_id: Some(room_id.to_string()),
            round_id: Some(round_id.to_string()),
            remark: remark.into(),
        }
    }
}

/// Durable room configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomConfig {
    pub room_id: RoomId,
    pub operator_id: UserId,
    pub stake: Amount,
    pub winner_count: usize,
    pub max_participants: usize,
    pub operator_rate: Rate,
    pub platform_rate: Rate,
}

impl RoomConfig {
    /// Structural minimum of eligible players: at least one loser must exist
    pub fn min_players(&self) -> usize {
        (self.winner_count + 1).max(2)
    }

    /// Reject structurally invalid rooms before they reach a state machine
    pub fn validate(&self, max_commission: Rate) -> Result<(), ConfigError> {
        if self.room_id.trim().is_empty() {
            return Err(ConfigError::InvalidValue("room_id must not be empty".to_string()));
        }
        if !self.stake.is_positive() {
            return Err(ConfigError::InvalidValue(format!(
                "stake must be > 0 (room {})",
                self.room_id
            )));
        }
        if self.winner_count == 0 {
            return Err(ConfigError::InvalidValue(format!(
                "winner_count must be > 0 (room {})",
                self.room_id
            )));
        }
        if self.winner_count >= self.max_participants {
            return Err(ConfigError::LogicalInconsistency(format!(
                "winner_count {} must be below max_participants {} (room {})",
                self.winner_count, self.max_participants, self.room_id
            )));
        }
        let combined = self
            .operator_rate
            .checked_add(self.platform_rate)
            .ok_or_else(|| ConfigError::InvalidValue("commission rate overflow".to_string()))?;
        if combined > max_commission {
            return Err(ConfigError::LogicalInconsistency(format!(
                "commission {} exceeds ceiling {} (room {})",
                combined, max_commission, self.room_id
            )));
        }
        Ok(())
    }
}

/// Durable room membership row; survives process restart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub ready: bool,
    pub online: bool,
    pub joined_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub left_at: Option<DateTime<Utc>>,
}

/// Round lifecycle; only ever advances forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundStatus {
    Betting,
    Playing,
    Settled,
    Failed,
}

impl RoundStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RoundStatus::Settled | RoundStatus::Failed)
    }

    pub fn can_advance_to(self, next: RoundStatus) -> bool {
        match (self, next) {
            (RoundStatus::Betting, RoundStatus::Playing) => true,
            (RoundStatus::Betting | RoundStatus::Playing, RoundStatus::Settled) => true,
            (RoundStatus::Betting | RoundStatus::Playing, RoundStatus::Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RoundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoundStatus::Betting => "betting",
            RoundStatus::Playing => "playing",
            RoundStatus::Settled => "settled",
            RoundStatus::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Durable round row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub round_id: RoundId,
    pub room_id: RoomId,
    pub round_number: u64,
    pub participants: Vec<UserId>,
    pub skipped: Vec<UserId>,
    pub stake: Amount,
    pub pool: Amount,
    #[serde(default)]
    pub winners: Option<Vec<UserId>>,
    pub prize_per_winner: Amount,
    pub operator_earning: Amount,
    pub platform_earning: Amount,
    pub residual: Amount,
    pub commit_hash: String,
    #[serde(default)]
    pub reveal_seed: Option<String>,
    pub status: RoundStatus,
    #[serde(default)]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub settled_at: Option<DateTime<Utc>>,
}

impl RoundRecord {
    /// New round in `betting` status with stakes already collected
    pub fn open(
        round_id: RoundId,
        room_id: RoomId,
        round_number: u64,
        participants: Vec<UserId>,
        skipped: Vec<UserId>,
        stake: Amount,
        commit_hash: String,
    ) -> Self {
        let pool = stake.times(participants.len());
        Self {
            round_id,
            room_id,
            round_number,
            participants,
            skipped,
            stake,
            pool,
            winners: None,
            prize_per_winner: Amount::ZERO,
            operator_earning: Amount::ZERO,
            platform_earning: Amount::ZERO,
            residual: Amount::ZERO,
            commit_hash,
            reveal_seed: None,
            status: RoundStatus::Betting,
            failure_reason: None,
            created_at: Utc::now(),
            settled_at: None,
        }
    }
}
