//! Stakeroom - multiplayer betting rooms with verifiable winner selection
//!
//! Players join a room, a round cycles through timed phases, winners are
//! drawn with a commit-reveal protocol and the pool is redistributed between
//! winners, the room operator and the platform in one ledger transaction.
//!
//! Layers, leaves first:
//! - `money`: exact fixed-point amounts and commission rates
//! - `storage`: ledger accounts, transaction log and durable room tables
//! - `cache`: read-through balance cache with optimistic retry
//! - `fairness`: commitment, reveal and deterministic winner selection
//! - `settlement`: split computation and round-level ledger steps
//! - `room`: per-room phase state machine and roster
//! - `registry`: lazy room lifecycle and event routing

pub mod cache;
pub mod common;
pub mod config;
pub mod errors;
pub mod fairness;
pub mod metrics;
pub mod money;
pub mod registry;
pub mod room;
pub mod settlement;
pub mod storage;

pub use cache::{BalanceCache, CacheBackend, LruCacheBackend, RetryPolicy};
pub use common::traits::{
    Broadcaster, ChannelBroadcaster, LoggingRiskChecker, NoopRiskChecker, RiskChecker,
    StaticUserDirectory, UserDirectory,
};
pub use common::types::{
    Account, BalanceTransaction, Bucket, Membership, RoomConfig, RoundRecord, RoundStatus,
    TransactionType, TxContext, UserProfile,
};
pub use config::ServiceConfig;
pub use errors::{Error, Result};
pub use fairness::SeedCommitment;
pub use metrics::RoomMetrics;
pub use money::{Amount, Rate};
pub use registry::RoomRegistry;
pub use room::{Phase, RoomEvent, RoomMessage, RoomProcessor, RoomSnapshot};
pub use settlement::{compute_split, RefundOutcome, RoundSettler, Split};
pub use storage::{MemoryStore, RocksStore, Store};
