//! Outbound room notifications

use super::types::{DisqualifyReason, Phase};
use crate::{
    common::types::{RoundId, UserId},
    money::Amount,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WinnerView {
    pub user_id: UserId,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoomEvent {
    PhaseChanged {
        phase: Phase,
        round_number: u64,
        /// Zero for the unbounded waiting phase
        remaining_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        commitment: Option<String>,
    },
    /// Periodic resync. Phase and remaining time are always present; the
    /// other fields only when they changed since the previous tick.
    Tick {
        phase: Phase,
        remaining_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        pool: Option<Amount>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        player_count: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        spectator_count: Option<usize>,
    },
    BettingComplete {
        round_id: RoundId,
        round_number: u64,
        pool: Amount,
        participants: Vec<UserId>,
        skipped: Vec<UserId>,
        commitment: String,
    },
    RoundResult {
        round_id: RoundId,
        round_number: u64,
        pool: Amount,
        winners: Vec<WinnerView>,
        prize_per_winner: Amount,
        operator_earning: Amount,
        platform_earning: Amount,
        residual: Amount,
        reveal_seed: String,
        commitment: String,
    },
    RoundFailed {
        round_id: RoundId,
        round_number: u64,
        reason: String,
        refunded: Vec<UserId>,
    },
    /// Round abandoned before any stake was kept
    RoundCancelled {
        round_number: u64,
        reason: String,
        disqualified: Vec<UserId>,
    },
    Disqualified {
        round_number: u64,
        reason: DisqualifyReason,
    },
    BalanceUpdate {
        balance: Amount,
    },
    PlayerJoined {
        user_id: UserId,
        display_name: String,
    },
    PlayerLeft {
        user_id: UserId,
        reason: String,
    },
    PlayerStatus {
        user_id: UserId,
        online: bool,
        auto_ready: bool,
    },
    SpectatorJoined {
        user_id: UserId,
        display_name: String,
    },
    SpectatorLeft {
        user_id: UserId,
    },
}

impl RoomEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            RoomEvent::PhaseChanged { .. } => "phase_changed",
            RoomEvent::Tick { .. } => "tick",
            RoomEvent::BettingComplete { .. } => "betting_complete",
            RoomEvent::RoundResult { .. } => "round_result",
            RoomEvent::RoundFailed { .. } => "round_failed",
            RoomEvent::RoundCancelled { .. } => "round_cancelled",
            RoomEvent::Disqualified { .. } => "disqualified",
            RoomEvent::BalanceUpdate { .. } => "balance_update",
            RoomEvent::PlayerJoined { .. } => "player_joined",
            RoomEvent::PlayerLeft { .. } => "player_left",
            RoomEvent::PlayerStatus { .. } => "player_status",
            RoomEvent::SpectatorJoined { .. } => "spectator_joined",
            RoomEvent::SpectatorLeft { .. } => "spectator_left",
        }
    }
}

/// Addressed event as handed to the transport layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMessage {
    pub room_id: String,
    /// `None` for room-wide events
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub recipient: Option<UserId>,
    pub event: RoomEvent,
}

impl RoomMessage {
    pub fn to_room(room_id: &str, event: RoomEvent) -> Self {
        Self {
            room_id: room_id.to_string(),
            recipient: None,
            event,
        }
    }

    pub fn to_user(room_id: &str, user_id: &str, event: RoomEvent) -> Self {
        Self {
            room_id: room_id.to_string(),
            recipient: Some(user_id.to_string()),
            event,
        }
    }
}
