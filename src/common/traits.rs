//! Collaborator capabilities consumed by the room core
//!
//! Transport, risk control and user lookup live outside this crate; rooms see
//! them only through these traits.

use crate::{
    common::types::{UserId, UserProfile},
    room::events::{RoomEvent, RoomMessage},
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::broadcast;

/// Outbound notifications. Implementations must not block: a slow or dead
/// subscriber is logged and skipped.
pub trait Broadcaster: Send + Sync {
    fn broadcast(&self, room_id: &str, event: RoomEvent);

    fn send_to_user(&self, room_id: &str, user_id: &str, event: RoomEvent);
}

/// Fan-out over a tokio broadcast channel; the transport layer subscribes and
/// filters by `RoomMessage::recipient`.
pub struct ChannelBroadcaster {
    sender: broadcast::Sender<RoomMessage>,
}

impl ChannelBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomMessage> {
        self.sender.subscribe()
    }

    fn publish(&self, message: RoomMessage) {
        if self.sender.receiver_count() == 0 {
            return;
        }
        if let Err(e) = self.sender.send(message) {
            tracing::debug!(error = %e, "no subscriber accepted room message");
        }
    }
}

impl Broadcaster for ChannelBroadcaster {
    fn broadcast(&self, room_id: &str, event: RoomEvent) {
        self.publish(RoomMessage::to_room(room_id, event));
    }

    fn send_to_user(&self, room_id: &str, user_id: &str, event: RoomEvent) {
        self.publish(RoomMessage::to_user(room_id, user_id, event));
    }
}

/// Receives every settled round; called off the room lock
#[async_trait]
pub trait RiskChecker: Send + Sync {
    async fn on_round_settled(&self, room_id: &str, participants: &[UserId], winners: &[UserId]);
}

pub struct NoopRiskChecker;

#[async_trait]
impl RiskChecker for NoopRiskChecker {
    async fn on_round_settled(&self, _room_id: &str, _participants: &[UserId], _winners: &[UserId]) {}
}

/// Writes each outcome to the log
pub struct LoggingRiskChecker;

#[async_trait]
impl RiskChecker for LoggingRiskChecker {
    async fn on_round_settled(&self, room_id: &str, participants: &[UserId], winners: &[UserId]) {
        tracing::info!(
            room_id,
            participants = participants.len(),
            winners = ?winners,
            "risk check: round settled"
        );
    }
}

/// Display-name lookup used when rehydrating rosters
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn display_name(&self, user_id: &str) -> Option<String>;
}

/// Fixed profile table, filled from bootstrap config
#[derive(Default)]
pub struct StaticUserDirectory {
    names: RwLock<HashMap<UserId, String>>,
}

impl StaticUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profiles(profiles: impl IntoIterator<Item = UserProfile>) -> Self {
        let directory = Self::new();
        for profile in profiles {
            directory.insert(profile);
        }
        directory
    }

    pub fn insert(&self, profile: UserProfile) {
        if let Ok(mut names) = self.names.write() {
            names.insert(profile.user_id, profile.display_name);
        }
    }
}

#[async_trait]
impl UserDirectory for StaticUserDirectory {
    async fn display_name(&self, user_id: &str) -> Option<String> {
        self.names.read().ok()?.get(user_id).cloned()
    }
}
