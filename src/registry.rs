//! Room registry
//!
//! Constructed once at startup and handed to the transport layer. Lazily
//! hydrates a `RoomProcessor` per room on first use, routes connection events
//! to every room a user is in, and tears rooms down.

use crate::{
    cache::{BalanceCache, LruCacheBackend, RetryPolicy},
    common::{
        traits::{Broadcaster, RiskChecker, UserDirectory},
        types::{RoomConfig, RoomId, UserProfile},
    },
    config::{RoomTimingConfig, ServiceConfig},
    errors::{ConfigError, Error, RegistryError, RoomError},
    metrics::RoomMetrics,
    money::Rate,
    room::processor::{RoomDeps, RoomProcessor},
    settlement::RoundSettler,
    storage::Store,
};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct RoomRegistry {
    rooms: DashMap<RoomId, Arc<RoomProcessor>>,
    deps: RoomDeps,
    timing: RoomTimingConfig,
    max_commission: Rate,
    /// Serialises hydration so a room is never built twice
    creation_lock: Mutex<()>,
}

impl RoomRegistry {
    /// Rejects timing with a zero timer period before any room can start
    pub fn new(deps: RoomDeps, timing: RoomTimingConfig, max_commission: Rate) -> Result<Self, ConfigError> {
        timing.validate()?;
        Ok(Self {
            rooms: DashMap::new(),
            deps,
            timing,
            max_commission,
            creation_lock: Mutex::new(()),
        })
    }

    /// Wire the shared ledger, cache and settlement layers from config
    pub fn from_config(
        config: &ServiceConfig,
        store: Arc<dyn Store>,
        broadcaster: Arc<dyn Broadcaster>,
        risk: Arc<dyn RiskChecker>,
        directory: Arc<dyn UserDirectory>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let retry = RetryPolicy {
            max_retries: config.ledger.max_retries,
            backoff: config.ledger.retry_backoff(),
        };
        let cache = BalanceCache::new(
            store.clone(),
            Arc::new(LruCacheBackend::new(config.cache.capacity, config.cache.ttl())),
            retry,
        );
        let deps = RoomDeps {
            settler: Arc::new(RoundSettler::new(store, config.ledger.platform_account.clone()).with_retry(retry)),
            cache: Arc::new(cache),
            broadcaster,
            risk,
            directory,
            metrics: Arc::new(RoomMetrics::new()),
        };
        Self::new(deps, config.room.clone(), config.ledger.max_commission_rate)
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        self.deps.settler.store()
    }

    pub fn cache(&self) -> &Arc<BalanceCache> {
        &self.deps.cache
    }

    pub fn metrics(&self) -> &Arc<RoomMetrics> {
        &self.deps.metrics
    }

    /// Validate and persist a room config; does not start the room
    pub async fn create_room(&self, room: RoomConfig) -> Result<(), RegistryError> {
        room.validate(self.max_commission)?;
        self.store().put_room(&room).await?;
        tracing::info!(room_id = %room.room_id, stake = %room.stake, "room created");
        Ok(())
    }

    pub fn get_room(&self, room_id: &str) -> Option<Arc<RoomProcessor>> {
        self.rooms.get(room_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Running processor for `room_id`, hydrating and starting it on first use
    pub async fn get_or_create_room(&self, room_id: &str) -> Result<Arc<RoomProcessor>, RegistryError> {
        if let Some(room) = self.get_room(room_id) {
            return Ok(room);
        }

        let _guard = self.creation_lock.lock().await;
        if let Some(room) = self.get_room(room_id) {
            return Ok(room);
        }

        let config = self
            .store()
            .get_room(room_id)
            .await?
            .ok_or_else(|| RegistryError::RoomNotFound(room_id.to_string()))?;
        config.validate(self.max_commission)?;

        let room = RoomProcessor::hydrate(config, self.timing.clone(), self.deps.clone()).await?;
        room.start();
        self.rooms.insert(room_id.to_string(), Arc::clone(&room));
        Ok(room)
    }

    /// Resolve the room and join it as a participant
    pub async fn join_room(&self, room_id: &str, profile: UserProfile) -> Result<Arc<RoomProcessor>, Error> {
        let room = self.get_or_create_room(room_id).await?;
        room.add_player(profile).await?;
        Ok(room)
    }

    /// Transport lost `user_id`: participants go offline, spectators leave
    pub async fn handle_disconnect(&self, user_id: &str) {
        let rooms: Vec<Arc<RoomProcessor>> = self.rooms.iter().map(|entry| Arc::clone(entry.value())).collect();
        for room in rooms {
            match room.set_player_online(user_id, false).await {
                Ok(()) => continue,
                Err(RoomError::NotInRoom) => {}
                Err(e) => {
                    tracing::warn!(room_id = %room.room_id(), user_id, error = %e, "failed to mark player offline");
                    continue;
                }
            }
            if let Err(e) = room.remove_spectator(user_id).await {
                if e != RoomError::NotSpectator {
                    tracing::warn!(room_id = %room.room_id(), user_id, error = %e, "failed to drop spectator");
                }
            }
        }
    }

    pub fn active_rooms(&self) -> Vec<RoomId> {
        let mut ids: Vec<RoomId> = self.rooms.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Stop timers and forget the processor; returns false if not active
    pub fn stop_room(&self, room_id: &str) -> bool {
        match self.rooms.remove(room_id) {
            Some((_, room)) => {
                room.stop();
                true
            }
            None => false,
        }
    }

    pub fn shutdown(&self) {
        for room_id in self.active_rooms() {
            self.stop_room(&room_id);
        }
        tracing::info!("all rooms stopped");
    }
}
