//! Error types for the room, ledger and settlement layers
//!
//! Public room operations return enumerable errors so the transport layer can
//! map them to user-facing codes without parsing messages.

use crate::money::Amount;

/// Ledger and durable-table failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Insufficient balance for {user_id}: required {required}, available {available}")]
    InsufficientBalance {
        user_id: String,
        required: Amount,
        available: Amount,
    },

    #[error("Version conflict for {user_id}: expected {expected}, found {actual}")]
    VersionConflict {
        user_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Round not found: {0}")]
    RoundNotFound(String),

    #[error("Round {round_id} cannot move from {from} to {to}")]
    InvalidRoundTransition {
        round_id: String,
        from: String,
        to: String,
    },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Storage backend failure: {0}")]
    Backend(String),

    #[error("Corrupted record: {0}")]
    Corrupted(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Corrupted(e.to_string())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Balance cache backend failures; never surfaced past the cache layer
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("Cache unavailable: {0}")]
    Unavailable(String),
}

/// Errors returned by public roster operations on a room
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomError {
    #[error("User is already a participant")]
    AlreadyParticipant,

    #[error("User is already a spectator")]
    AlreadySpectator,

    #[error("Spectator limit reached")]
    SpectatorLimitReached,

    #[error("User is not a spectator")]
    NotSpectator,

    #[error("Room is full")]
    RoomFull,

    #[error("User is not in this room")]
    NotInRoom,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RoomError {
    /// Stable code for transport-level mapping
    pub fn code(&self) -> &'static str {
        match self {
            RoomError::AlreadyParticipant => "ALREADY_PARTICIPANT",
            RoomError::AlreadySpectator => "ALREADY_SPECTATOR",
            RoomError::SpectatorLimitReached => "SPECTATOR_LIMIT_REACHED",
            RoomError::NotSpectator => "NOT_SPECTATOR",
            RoomError::RoomFull => "ROOM_FULL",
            RoomError::NotInRoom => "NOT_IN_ROOM",
            RoomError::Store(_) => "INTERNAL_ERROR",
        }
    }
}

/// Configuration and validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("Configuration logical inconsistency: {0}")]
    LogicalInconsistency(String),

    #[error("Failed to load configuration: {0}")]
    LoadFailed(String),
}

/// Registry-level failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    #[error("Invalid room configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Round-level failures; always resolved by refunding and returning to Waiting
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettlementError {
    #[error("Stake collection failed: {0}")]
    Collection(StoreError),

    #[error("Round creation failed: {0}")]
    RoundCreation(StoreError),

    #[error("Round settlement failed: {0}")]
    Settlement(StoreError),

    #[error("Refund failed: {0}")]
    Refund(StoreError),

    #[error("Refund deferred to recovery after: {0}")]
    RefundDeferred(StoreError),

    #[error("Round state missing: {0}")]
    MissingState(&'static str),
}

/// Root error type for service-level code
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Room error: {0}")]
    Room(#[from] RoomError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Settlement error: {0}")]
    Settlement(#[from] SettlementError),
}

pub type Result<T> = std::result::Result<T, Error>;
