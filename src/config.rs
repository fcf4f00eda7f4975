//! Service configuration with validation and defaults
//!
//! Loaded from TOML; every field has a default so a partial file is enough.

use crate::{
    common::types::{RoomConfig, UserId},
    errors::ConfigError,
    money::{Amount, Rate},
    room::types::Phase,
};
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub room: RoomTimingConfig,
    pub ledger: LedgerConfig,
    pub cache: CacheConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
    pub bootstrap: BootstrapConfig,
}

/// Phase durations and background timer periods, in milliseconds
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomTimingConfig {
    pub countdown_ms: u64,
    pub betting_ms: u64,
    pub in_game_ms: u64,
    pub settlement_ms: u64,
    pub reset_ms: u64,
    pub tick_ms: u64,
    pub broadcast_ms: u64,
    pub offline_sweep_ms: u64,
    pub offline_timeout_ms: u64,
    pub max_spectators: usize,
}

impl Default for RoomTimingConfig {
    fn default() -> Self {
        Self {
            countdown_ms: 5_000,
            betting_ms: 5_000,
            in_game_ms: 5_000,
            settlement_ms: 5_000,
            reset_ms: 5_000,
            tick_ms: 200,
            broadcast_ms: 1_000,
            offline_sweep_ms: 5_000,
            offline_timeout_ms: 120_000,
            max_spectators: 50,
        }
    }
}

impl RoomTimingConfig {
    /// `None` for the unbounded waiting phase
    pub fn phase_duration(&self, phase: Phase) -> Option<Duration> {
        let ms = match phase {
            Phase::Waiting => return None,
            Phase::Countdown => self.countdown_ms,
            Phase::Betting => self.betting_ms,
            Phase::InGame => self.in_game_ms,
            Phase::Settlement => self.settlement_ms,
            Phase::Reset => self.reset_ms,
        };
        Some(Duration::from_millis(ms))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_ms)
    }

    pub fn offline_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.offline_sweep_ms)
    }

    pub fn offline_timeout(&self) -> Duration {
        Duration::from_millis(self.offline_timeout_ms)
    }

    /// Background timer periods feed `tokio::time::interval` and must be
    /// non-zero; phase lengths may be zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_ms == 0 || self.broadcast_ms == 0 || self.offline_sweep_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "tick_ms, broadcast_ms and offline_sweep_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Conditional-update retries before a version conflict is surfaced
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub platform_account: UserId,
    /// Ceiling on operator + platform commission
    pub max_commission_rate: Rate,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff_ms: 25,
            platform_account: "platform".to_string(),
            max_commission_rate: Rate::from_bps(1_000),
        }
    }
}

impl LedgerConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: usize,
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            ttl_secs: 300,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_directory: String,
    pub clear_on_start: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_directory: "./DB/stakeroom_data".to_string(),
            clear_on_start: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` wins when set
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Rooms and funded accounts created at startup if missing
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    pub rooms: Vec<RoomConfig>,
    pub accounts: Vec<BootstrapAccount>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BootstrapAccount {
    pub user_id: UserId,
    pub display_name: String,
    #[serde(default)]
    pub deposit: Amount,
}

impl ServiceConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::LoadFailed(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw).map_err(|e| ConfigError::LoadFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Short phases for local play
    pub fn development() -> Self {
        Self {
            room: RoomTimingConfig {
                countdown_ms: 2_000,
                betting_ms: 2_000,
                in_game_ms: 3_000,
                settlement_ms: 2_000,
                reset_ms: 1_000,
                offline_timeout_ms: 30_000,
                ..Default::default()
            },
            storage: StorageConfig {
                clear_on_start: true,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: "debug".to_string(),
            },
            ..Default::default()
        }
    }

    /// Zero-length phases and slow timers so tests drive every transition
    /// explicitly
    pub fn testing() -> Self {
        Self {
            room: RoomTimingConfig {
                countdown_ms: 0,
                betting_ms: 0,
                in_game_ms: 0,
                settlement_ms: 0,
                reset_ms: 0,
                tick_ms: 3_600_000,
                broadcast_ms: 3_600_000,
                offline_sweep_ms: 3_600_000,
                offline_timeout_ms: 0,
                max_spectators: 2,
            },
            ledger: LedgerConfig {
                retry_backoff_ms: 1,
                ..Default::default()
            },
            storage: StorageConfig {
                clear_on_start: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.room.validate()?;

        if self.cache.capacity == 0 {
            return Err(ConfigError::InvalidValue("cache capacity must be > 0".to_string()));
        }

        if self.ledger.platform_account.trim().is_empty() {
            return Err(ConfigError::InvalidValue("platform_account must not be empty".to_string()));
        }

        if self.ledger.max_commission_rate > Rate::from_bps(10_000) {
            return Err(ConfigError::LogicalInconsistency(format!(
                "max_commission_rate {} exceeds 100%",
                self.ledger.max_commission_rate
            )));
        }

        for room in &self.bootstrap.rooms {
            room.validate(self.ledger.max_commission_rate)?;
        }

        if let Some(account) = self.bootstrap.accounts.iter().find(|a| a.deposit.is_negative()) {
            return Err(ConfigError::InvalidValue(format!(
                "bootstrap deposit for {} must not be negative",
                account.user_id
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ServiceConfig::default().validate().is_ok());
        assert!(ServiceConfig::development().validate().is_ok());
        assert!(ServiceConfig::testing().validate().is_ok());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut config = ServiceConfig::default();
        config.room.tick_ms = 0;
        assert!(config.validate().is_err());
        assert!(config.room.validate().is_err());

        let mut timing = RoomTimingConfig::default();
        timing.broadcast_ms = 0;
        assert!(matches!(timing.validate(), Err(ConfigError::InvalidValue(_))));
        timing.broadcast_ms = 1;
        timing.countdown_ms = 0;
        assert!(timing.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = ServiceConfig::from_toml(
            r#"
            [room]
            betting_ms = 7000

            [ledger]
            max_commission_rate = "0.0800"

            [[bootstrap.rooms]]
            room_id = "lobby"
            operator_id = "op"
            stake = "10.00"
            winner_count = 1
            max_participants = 4
            operator_rate = "0.0300"
            platform_rate = "0.0200"

            [[bootstrap.accounts]]
            user_id = "alice"
            display_name = "Alice"
            deposit = "100.00"
            "#,
        )
        .unwrap();
        assert_eq!(config.room.betting_ms, 7_000);
        assert_eq!(config.room.countdown_ms, 5_000);
        assert_eq!(config.ledger.max_commission_rate, Rate::from_bps(800));
        assert_eq!(config.bootstrap.rooms[0].stake, Amount::from_units(10));
        assert_eq!(config.bootstrap.accounts[0].deposit, Amount::from_units(100));
    }

    #[test]
    fn test_bootstrap_room_over_ceiling_rejected() {
        let result = ServiceConfig::from_toml(
            r#"
            [[bootstrap.rooms]]
            room_id = "greedy"
            operator_id = "op"
            stake = "10.00"
            winner_count = 1
            max_participants = 4
            operator_rate = "0.0900"
            platform_rate = "0.0200"
            "#,
        );
        assert!(matches!(result, Err(ConfigError::LogicalInconsistency(_))));
    }

    #[test]
    fn test_duration_conversions() {
        let config = ServiceConfig::default();
        assert_eq!(config.room.phase_duration(Phase::Waiting), None);
        assert_eq!(config.room.phase_duration(Phase::Betting), Some(Duration::from_millis(5_000)));
        assert_eq!(config.room.offline_timeout(), Duration::from_secs(120));
        assert_eq!(config.ledger.retry_backoff(), Duration::from_millis(25));
    }
}
