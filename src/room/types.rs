//! Per-room runtime state: phases, roster entries and snapshot views
//!
//! Everything here lives behind the processor's lock and is rebuilt from
//! durable rows on hydration.

use crate::{
    common::types::{RoundId, UserId},
    fairness::SeedCommitment,
    money::Amount,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, time::Duration};
use tokio::time::Instant;

/// Room phase, in cyclic order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Waiting,
    Countdown,
    Betting,
    InGame,
    Settlement,
    Reset,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Waiting => "waiting",
            Phase::Countdown => "countdown",
            Phase::Betting => "betting",
            Phase::InGame => "in_game",
            Phase::Settlement => "settlement",
            Phase::Reset => "reset",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a player was excluded from the current round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisqualifyReason {
    InsufficientBalance,
}

impl DisqualifyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisqualifyReason::InsufficientBalance => "insufficient_balance",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlayerRuntime {
    pub user_id: UserId,
    pub display_name: String,
    /// Last known available balance, reconciled on reconnect
    pub balance: Amount,
    pub auto_ready: bool,
    pub online: bool,
    pub offline_since: Option<Instant>,
    pub disqualified: Option<DisqualifyReason>,
    pub joined_at: DateTime<Utc>,
}

impl PlayerRuntime {
    pub fn new(user_id: UserId, display_name: String, balance: Amount) -> Self {
        Self {
            user_id,
            display_name,
            balance,
            auto_ready: false,
            online: true,
            offline_since: None,
            disqualified: None,
            joined_at: Utc::now(),
        }
    }

    /// Rehydrated from a membership row: always offline until reconnect
    pub fn rehydrated(
        user_id: UserId,
        display_name: String,
        auto_ready: bool,
        joined_at: DateTime<Utc>,
        now: Instant,
    ) -> Self {
        Self {
            user_id,
            display_name,
            balance: Amount::ZERO,
            auto_ready,
            online: false,
            offline_since: Some(now),
            disqualified: None,
            joined_at,
        }
    }

    /// `offline_since` is stamped only on the online -> offline edge, so a
    /// repeated disconnect does not postpone eviction
    pub fn set_online(&mut self, online: bool, now: Instant) {
        if online {
            self.offline_since = None;
        } else if self.online || self.offline_since.is_none() {
            self.offline_since = Some(now);
        }
        self.online = online;
    }

    pub fn is_ready(&self) -> bool {
        self.online && self.auto_ready
    }
}

#[derive(Debug, Clone)]
pub struct SpectatorRuntime {
    pub user_id: UserId,
    pub display_name: String,
    pub joined_at: Instant,
}

/// In-memory room state; owned by exactly one processor, guarded by its lock
#[derive(Debug)]
pub struct RoomState {
    pub phase: Phase,
    pub phase_deadline: Option<Instant>,
    pub round_number: u64,
    pub players: BTreeMap<UserId, PlayerRuntime>,
    pub spectators: BTreeMap<UserId, SpectatorRuntime>,
    pub pool: Amount,
    pub round_id: Option<RoundId>,
    pub participants: Vec<UserId>,
    pub skipped: Vec<UserId>,
    /// Seed stays in memory until reveal
    pub commitment: Option<SeedCommitment>,
    pub last_tick: Option<TickFingerprint>,
}

impl RoomState {
    pub fn new(round_number: u64) -> Self {
        Self {
            phase: Phase::Waiting,
            phase_deadline: None,
            round_number,
            players: BTreeMap::new(),
            spectators: BTreeMap::new(),
            pool: Amount::ZERO,
            round_id: None,
            participants: Vec::new(),
            skipped: Vec::new(),
            commitment: None,
            last_tick: None,
        }
    }

    pub fn ready_count(&self) -> usize {
        self.players.values().filter(|p| p.is_ready()).count()
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.phase_deadline
            .map(|deadline| deadline.saturating_duration_since(now))
            .unwrap_or_default()
    }

    /// Drop every round-scoped field and clear disqualification flags
    pub fn clear_round(&mut self) {
        self.pool = Amount::ZERO;
        self.round_id = None;
        self.participants.clear();
        self.skipped.clear();
        self.commitment = None;
        for player in self.players.values_mut() {
            player.disqualified = None;
        }
    }

    pub fn fingerprint(&self) -> TickFingerprint {
        TickFingerprint {
            phase: self.phase,
            pool: self.pool,
            players: self.players.len(),
            spectators: self.spectators.len(),
        }
    }
}

/// The fields whose change triggers an incremental tick payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickFingerprint {
    pub phase: Phase,
    pub pool: Amount,
    pub players: usize,
    pub spectators: usize,
}

/// Point-in-time view of a room for (re)joining clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub room_id: String,
    pub phase: Phase,
    pub remaining_ms: u64,
    pub round_number: u64,
    pub pool: Amount,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub round_id: Option<RoundId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commitment: Option<String>,
    pub players: Vec<PlayerView>,
    pub spectator_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerView {
    pub user_id: UserId,
    pub display_name: String,
    pub online: bool,
    pub auto_ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disqualified: Option<DisqualifyReason>,
}

impl From<&PlayerRuntime> for PlayerView {
    fn from(player: &PlayerRuntime) -> Self {
        Self {
            user_id: player.user_id.clone(),
            display_name: player.display_name.clone(),
            online: player.online,
            auto_ready: player.auto_ready,
            disqualified: player.disqualified,
        }
    }
}
