//! Per-room phase state machine
//!
//! A `RoomProcessor` owns one room's runtime state behind a single async lock.
//! Three background timers share that lock:
//! - phase tick: advances the phase once its deadline has passed
//! - broadcast: pushes an incremental `Tick` so clients can resync
//! - offline sweep: evicts players offline longer than the timeout
//!
//! Every roster operation and every transition runs under the same lock, so
//! within a room nothing overlaps. Errors inside a transition are logged and
//! the room falls back to `Waiting`; they never escape a timer.

use super::{
    events::{RoomEvent, WinnerView},
    types::{DisqualifyReason, Phase, PlayerRuntime, PlayerView, RoomSnapshot, RoomState, SpectatorRuntime},
};
use crate::{
    cache::BalanceCache,
    common::{
        traits::{Broadcaster, RiskChecker, UserDirectory},
        types::{Membership, RoomConfig, RoundRecord, UserId, UserProfile},
    },
    config::RoomTimingConfig,
    errors::{RoomError, SettlementError, StoreError},
    fairness::SeedCommitment,
    metrics::RoomMetrics,
    money::Amount,
    settlement::{RefundOutcome, RoundSettler},
};
use futures::future::join_all;
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use uuid::Uuid;

/// Collaborators shared by every room
#[derive(Clone)]
pub struct RoomDeps {
    pub settler: Arc<RoundSettler>,
    pub cache: Arc<BalanceCache>,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub risk: Arc<dyn RiskChecker>,
    pub directory: Arc<dyn UserDirectory>,
    pub metrics: Arc<RoomMetrics>,
}

pub struct RoomProcessor {
    config: RoomConfig,
    timing: RoomTimingConfig,
    deps: RoomDeps,
    state: Mutex<RoomState>,
    running: AtomicBool,
    timers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl RoomProcessor {
    /// Build a processor from durable rows.
    ///
    /// Members come back offline. Rounds left in `betting` or `playing` by a
    /// previous process are failed and refunded before the room accepts work.
    pub async fn hydrate(
        config: RoomConfig,
        timing: RoomTimingConfig,
        deps: RoomDeps,
    ) -> Result<Arc<Self>, StoreError> {
        let store = deps.settler.store().clone();
        let room_id = config.room_id.clone();

        let rounds = store.rounds_for_room(&room_id).await?;
        let round_number = rounds.last().map(|r| r.round_number).unwrap_or(0);
        for round in rounds.iter().filter(|r| !r.status.is_terminal()) {
            match deps.settler.fail(&round.round_id, "interrupted").await {
                Ok(failed) => {
                    tracing::warn!(
                        room_id = %room_id,
                        round_id = %failed.round_id,
                        refunded = failed.participants.len(),
                        "refunded round interrupted by restart"
                    );
                    for user_id in &failed.participants {
                        deps.cache.invalidate(user_id);
                    }
                    deps.metrics.record_round_failed(failed.pool);
                }
                Err(e) => {
                    tracing::error!(room_id = %room_id, round_id = %round.round_id, error = %e, "could not recover interrupted round");
                }
            }
        }

        let now = Instant::now();
        let mut state = RoomState::new(round_number);
        for membership in store.list_memberships(&room_id).await? {
            let name = deps
                .directory
                .display_name(&membership.user_id)
                .await
                .unwrap_or_else(|| membership.user_id.clone());
            state.players.insert(
                membership.user_id.clone(),
                PlayerRuntime::rehydrated(membership.user_id, name, membership.ready, membership.joined_at, now),
            );
        }

        tracing::info!(
            room_id = %room_id,
            round_number,
            players = state.players.len(),
            "room hydrated"
        );

        Ok(Arc::new(Self {
            config,
            timing,
            deps,
            state: Mutex::new(state),
            running: AtomicBool::new(false),
            timers: std::sync::Mutex::new(Vec::new()),
        }))
    }

    pub fn room_id(&self) -> &str {
        &self.config.room_id
    }

    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ---- timers ----

    /// Spawn the three room timers; a second call is a no-op
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let handles = vec![
            self.spawn_timer(self.timing.tick_interval(), |room| async move {
                room.tick().await;
            }),
            self.spawn_timer(self.timing.broadcast_interval(), |room| async move {
                room.emit_tick().await;
            }),
            self.spawn_timer(self.timing.offline_sweep_interval(), |room| async move {
                room.sweep_offline().await;
            }),
        ];
        match self.timers.lock() {
            Ok(mut timers) => timers.extend(handles),
            Err(_) => {
                tracing::error!(room_id = %self.config.room_id, "timer registry poisoned, aborting timers");
                for handle in handles {
                    handle.abort();
                }
            }
        }
        tracing::info!(room_id = %self.config.room_id, "room timers started");
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Ok(mut timers) = self.timers.lock() {
            for handle in timers.drain(..) {
                handle.abort();
            }
        }
        tracing::info!(room_id = %self.config.room_id, "room stopped");
    }

    fn spawn_timer<F, Fut>(self: &Arc<Self>, period: Duration, job: F) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let room = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            while room.running.load(Ordering::SeqCst) {
                interval.tick().await;
                if !room.running.load(Ordering::SeqCst) {
                    break;
                }
                job(room.clone()).await;
            }
        })
    }

    // ---- state machine ----

    /// Advance one phase if its deadline has passed; `Waiting` advances once
    /// enough players are ready. Returns the phase after the call.
    pub async fn tick(&self) -> Phase {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        match state.phase {
            Phase::Waiting => self.try_start_countdown(&mut state),
            _ if state.phase_deadline.map_or(false, |deadline| deadline <= now) => {
                self.advance(&mut state).await
            }
            _ => {}
        }
        state.phase
    }

    async fn advance(&self, state: &mut RoomState) {
        match state.phase {
            Phase::Waiting => self.try_start_countdown(state),
            Phase::Countdown => self.begin_betting(state).await,
            Phase::Betting => self.begin_game(state).await,
            Phase::InGame => self.settle(state).await,
            Phase::Settlement => self.enter_phase(state, Phase::Reset),
            Phase::Reset => self.return_to_waiting(state),
        }
    }

    fn try_start_countdown(&self, state: &mut RoomState) {
        if state.phase == Phase::Waiting && state.ready_count() >= self.config.min_players() {
            self.enter_phase(state, Phase::Countdown);
        }
    }

    fn enter_phase(&self, state: &mut RoomState, phase: Phase) {
        let now = Instant::now();
        state.phase = phase;
        state.phase_deadline = self.timing.phase_duration(phase).map(|d| now + d);
        tracing::info!(
            room_id = %self.config.room_id,
            phase = %phase,
            round_number = state.round_number,
            "phase changed"
        );
        self.deps.broadcaster.broadcast(
            &self.config.room_id,
            RoomEvent::PhaseChanged {
                phase,
                round_number: state.round_number,
                remaining_ms: state.remaining(now).as_millis() as u64,
                commitment: state.commitment.as_ref().map(|c| c.commitment_hash().to_string()),
            },
        );
    }

    fn return_to_waiting(&self, state: &mut RoomState) {
        state.clear_round();
        self.enter_phase(state, Phase::Waiting);
    }

    /// Countdown expiry: commit, partition, collect, open the round
    async fn begin_betting(&self, state: &mut RoomState) {
        let room_id = self.config.room_id.clone();
        let round_number = state.round_number + 1;
        let stake = self.config.stake;
        let min_players = self.config.min_players();
        let commitment = SeedCommitment::generate();

        let roster: Vec<(UserId, bool)> = state
            .players
            .values()
            .map(|p| (p.user_id.clone(), p.is_ready()))
            .collect();

        let mut eligible = Vec::new();
        let mut skipped = Vec::new();
        let mut disqualified = Vec::new();
        for (user_id, ready) in roster {
            if !ready {
                skipped.push(user_id);
                continue;
            }
            let balance = match self.deps.cache.get_balance(&user_id).await {
                Ok(balance) => balance,
                Err(e) => {
                    tracing::warn!(room_id = %room_id, user_id = %user_id, error = %e, "balance lookup failed, skipping player");
                    skipped.push(user_id);
                    continue;
                }
            };
            if let Some(player) = state.players.get_mut(&user_id) {
                player.balance = balance;
            }
            if balance < stake {
                disqualified.push(user_id.clone());
                skipped.push(user_id);
            } else {
                eligible.push(user_id);
            }
        }
        self.disqualify(state, round_number, &disqualified);

        if eligible.len() < min_players {
            self.cancel(state, round_number, "not enough eligible players", Amount::ZERO);
            return;
        }

        let round_id = Uuid::new_v4().to_string();
        let paid = match self.deps.settler.collect(&self.config, &round_id, &eligible).await {
            Ok(paid) => paid,
            Err(e) => {
                tracing::error!(room_id = %room_id, round_id = %round_id, error = %e, "stake collection failed");
                self.cancel(state, round_number, "stake collection failed", Amount::ZERO);
                return;
            }
        };

        let excluded: Vec<UserId> = eligible.iter().filter(|u| !paid.contains(u)).cloned().collect();
        if !excluded.is_empty() {
            tracing::warn!(room_id = %room_id, round_id = %round_id, excluded = ?excluded, "ledger rejected stakes");
            for user_id in &excluded {
                self.deps.cache.invalidate(user_id);
            }
            self.disqualify(state, round_number, &excluded);
            skipped.extend(excluded);
        }

        let record = RoundRecord::open(
            round_id.clone(),
            room_id.clone(),
            round_number,
            paid.clone(),
            skipped.clone(),
            stake,
            commitment.commitment_hash().to_string(),
        );

        if paid.len() < min_players {
            let refunded = match self.deps.settler.refund_or_park(&self.config, &record).await {
                Ok(RefundOutcome::Refunded) => record.pool,
                Ok(RefundOutcome::Parked) => {
                    state.round_number = round_number;
                    Amount::ZERO
                }
                Err(_) => Amount::ZERO,
            };
            self.refresh_balances(state, &paid).await;
            self.cancel(state, round_number, "not enough eligible players", refunded);
            return;
        }

        if let Err(e) = self.deps.settler.open_round(&self.config, &record).await {
            let refunded = match e {
                SettlementError::RoundCreation(_) => paid.clone(),
                SettlementError::RefundDeferred(_) => {
                    state.round_number = round_number;
                    Vec::new()
                }
                _ => Vec::new(),
            };
            self.refresh_balances(state, &paid).await;
            self.round_failed(state, &round_id, round_number, &e.to_string(), &refunded, record.pool);
            return;
        }

        state.round_number = round_number;
        state.round_id = Some(round_id.clone());
        state.participants = paid.clone();
        state.skipped = skipped.clone();
        state.pool = record.pool;
        state.commitment = Some(commitment);

        self.deps.metrics.record_round_started(record.pool);
        self.refresh_balances(state, &paid).await;
        self.enter_phase(state, Phase::Betting);
        self.deps.broadcaster.broadcast(
            &room_id,
            RoomEvent::BettingComplete {
                round_id,
                round_number,
                pool: record.pool,
                participants: paid,
                skipped,
                commitment: record.commit_hash,
            },
        );
    }

    async fn begin_game(&self, state: &mut RoomState) {
        let Some(round_id) = state.round_id.clone() else {
            tracing::error!(room_id = %self.config.room_id, "betting ended without a round");
            self.return_to_waiting(state);
            return;
        };
        match self.deps.settler.start_play(&round_id).await {
            Ok(_) => self.enter_phase(state, Phase::InGame),
            Err(e) => {
                tracing::error!(room_id = %self.config.room_id, round_id = %round_id, error = %e, "could not start round");
                self.fail_active_round(state, &round_id, &e.to_string()).await;
            }
        }
    }

    /// Fail the current round row (refunding its participants) and go back
    /// to waiting
    async fn fail_active_round(&self, state: &mut RoomState, round_id: &str, reason: &str) {
        let participants = state.participants.clone();
        let refunded = match self.deps.settler.fail(round_id, reason).await {
            Ok(record) => {
                self.deps.metrics.record_round_failed(record.pool);
                record.participants
            }
            Err(_) => Vec::new(),
        };
        self.refresh_balances(state, &participants).await;
        self.announce_failure(state, round_id, reason, refunded);
        self.return_to_waiting(state);
    }

    /// In-game expiry: reveal, pick winners, distribute
    async fn settle(&self, state: &mut RoomState) {
        let room_id = self.config.room_id.clone();
        let (Some(round_id), Some(commitment)) = (state.round_id.clone(), state.commitment.clone()) else {
            let err = SettlementError::MissingState("round id or commitment");
            tracing::error!(room_id = %room_id, error = %err, "cannot settle");
            match state.round_id.clone() {
                Some(round_id) => self.fail_active_round(state, &round_id, &err.to_string()).await,
                None => self.return_to_waiting(state),
            }
            return;
        };
        let participants = state.participants.clone();

        match self
            .deps
            .settler
            .settle(&self.config, &round_id, &participants, state.pool, &commitment)
            .await
        {
            Ok(outcome) => {
                let winners: Vec<WinnerView> = outcome
                    .winners
                    .iter()
                    .map(|user_id| WinnerView {
                        user_id: user_id.clone(),
                        display_name: state
                            .players
                            .get(user_id)
                            .map(|p| p.display_name.clone())
                            .unwrap_or_else(|| user_id.clone()),
                    })
                    .collect();
                let split = outcome.split;
                self.deps.metrics.record_round_settled(
                    split.prize_per_winner.times(outcome.winners.len()),
                    split.operator_earning + split.platform_earning + split.residual,
                );

                tracing::info!(
                    room_id = %room_id,
                    round_id = %round_id,
                    winners = ?outcome.winners,
                    prize = %split.prize_per_winner,
                    "round settled"
                );

                self.deps.cache.invalidate(&self.config.operator_id);
                self.refresh_balances(state, &participants).await;
                self.enter_phase(state, Phase::Settlement);
                self.deps.broadcaster.broadcast(
                    &room_id,
                    RoomEvent::RoundResult {
                        round_id: round_id.clone(),
                        round_number: state.round_number,
                        pool: split.pool,
                        winners,
                        prize_per_winner: split.prize_per_winner,
                        operator_earning: split.operator_earning,
                        platform_earning: split.platform_earning,
                        residual: split.residual,
                        reveal_seed: commitment.reveal(),
                        commitment: commitment.commitment_hash().to_string(),
                    },
                );

                let risk = Arc::clone(&self.deps.risk);
                let winner_ids = outcome.winners;
                tokio::spawn(async move {
                    risk.on_round_settled(&room_id, &participants, &winner_ids).await;
                });
            }
            Err(e) => {
                // settle() has already failed and refunded the round unless
                // the refund itself was what failed
                let refunded = match e {
                    SettlementError::Refund(_) => Vec::new(),
                    _ => participants.clone(),
                };
                let refunded_total = self.config.stake.times(refunded.len());
                self.deps.metrics.record_round_failed(refunded_total);
                self.refresh_balances(state, &participants).await;
                self.announce_failure(state, &round_id, &e.to_string(), refunded);
                self.return_to_waiting(state);
            }
        }
    }

    fn disqualify(&self, state: &mut RoomState, round_number: u64, users: &[UserId]) {
        if users.is_empty() {
            return;
        }
        let reason = DisqualifyReason::InsufficientBalance;
        for user_id in users {
            if let Some(player) = state.players.get_mut(user_id) {
                player.disqualified = Some(reason);
            }
            tracing::warn!(
                room_id = %self.config.room_id,
                user_id = %user_id,
                reason = reason.as_str(),
                "player disqualified"
            );
            self.deps.broadcaster.send_to_user(
                &self.config.room_id,
                user_id,
                RoomEvent::Disqualified { round_number, reason },
            );
        }
        self.deps.metrics.record_disqualifications(users.len());
    }

    fn cancel(&self, state: &mut RoomState, round_number: u64, reason: &str, refunded: Amount) {
        let disqualified: Vec<UserId> = state
            .players
            .values()
            .filter(|p| p.disqualified.is_some())
            .map(|p| p.user_id.clone())
            .collect();
        tracing::info!(room_id = %self.config.room_id, round_number, reason, "round cancelled");
        self.deps.metrics.record_round_cancelled(refunded);
        self.deps.broadcaster.broadcast(
            &self.config.room_id,
            RoomEvent::RoundCancelled {
                round_number,
                reason: reason.to_string(),
                disqualified,
            },
        );
        self.return_to_waiting(state);
    }

    /// Round creation failed after collection; `refunded` lists whose stakes
    /// already went back
    fn round_failed(
        &self,
        state: &mut RoomState,
        round_id: &str,
        round_number: u64,
        reason: &str,
        refunded: &[UserId],
        pool: Amount,
    ) {
        self.deps.metrics.record_round_failed(pool);
        self.deps.broadcaster.broadcast(
            &self.config.room_id,
            RoomEvent::RoundFailed {
                round_id: round_id.to_string(),
                round_number,
                reason: reason.to_string(),
                refunded: refunded.to_vec(),
            },
        );
        self.return_to_waiting(state);
    }

    fn announce_failure(&self, state: &RoomState, round_id: &str, reason: &str, refunded: Vec<UserId>) {
        tracing::error!(room_id = %self.config.room_id, round_id, reason, "round failed");
        self.deps.broadcaster.broadcast(
            &self.config.room_id,
            RoomEvent::RoundFailed {
                round_id: round_id.to_string(),
                round_number: state.round_number,
                reason: reason.to_string(),
                refunded,
            },
        );
    }

    /// Invalidate, reload and push the balance of each user still in the room
    async fn refresh_balances(&self, state: &mut RoomState, users: &[UserId]) {
        for user_id in users {
            self.deps.cache.invalidate(user_id);
        }
        let loads = users.iter().map(|user_id| self.deps.cache.get_balance(user_id));
        let balances = join_all(loads).await;

        for (user_id, loaded) in users.iter().zip(balances) {
            let balance = match loaded {
                Ok(balance) => balance,
                Err(e) => {
                    tracing::warn!(room_id = %self.config.room_id, user_id = %user_id, error = %e, "balance refresh failed");
                    continue;
                }
            };
            if let Some(player) = state.players.get_mut(user_id) {
                player.balance = balance;
            }
            self.deps.broadcaster.send_to_user(
                &self.config.room_id,
                user_id,
                RoomEvent::BalanceUpdate { balance },
            );
        }
    }

    // ---- periodic jobs ----

    /// Push phase and remaining time, plus whichever of pool, player count and
    /// spectator count changed since the last push
    pub async fn emit_tick(&self) {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let current = state.fingerprint();
        let previous = state.last_tick;
        let event = RoomEvent::Tick {
            phase: current.phase,
            remaining_ms: state.remaining(now).as_millis() as u64,
            pool: match previous {
                Some(p) if p.pool == current.pool => None,
                _ => Some(current.pool),
            },
            player_count: match previous {
                Some(p) if p.players == current.players => None,
                _ => Some(current.players),
            },
            spectator_count: match previous {
                Some(p) if p.spectators == current.spectators => None,
                _ => Some(current.spectators),
            },
        };
        state.last_tick = Some(current);
        self.deps.broadcaster.broadcast(&self.config.room_id, event);
    }

    /// Remove players offline longer than the timeout; returns who was removed
    pub async fn sweep_offline(&self) -> Vec<UserId> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let timeout = self.timing.offline_timeout();
        let expired: Vec<UserId> = state
            .players
            .values()
            .filter(|p| {
                !p.online && p.offline_since.map_or(false, |since| now.saturating_duration_since(since) >= timeout)
            })
            .map(|p| p.user_id.clone())
            .collect();

        for user_id in &expired {
            state.players.remove(user_id);
            if let Err(e) = self
                .deps
                .settler
                .store()
                .remove_membership(&self.config.room_id, user_id)
                .await
            {
                tracing::warn!(room_id = %self.config.room_id, user_id = %user_id, error = %e, "failed to remove membership");
            }
            tracing::debug!(room_id = %self.config.room_id, user_id = %user_id, "offline player evicted");
            self.deps.broadcaster.broadcast(
                &self.config.room_id,
                RoomEvent::PlayerLeft {
                    user_id: user_id.clone(),
                    reason: "offline_timeout".to_string(),
                },
            );
        }
        expired
    }

    // ---- roster operations ----

    /// Join as a participant, or reconnect if already one
    pub async fn add_player(&self, profile: UserProfile) -> Result<(), RoomError> {
        let balance = self.deps.cache.get_balance(&profile.user_id).await?;
        let mut state = self.state.lock().await;

        if state.spectators.contains_key(&profile.user_id) {
            return Err(RoomError::AlreadySpectator);
        }
        if let Some(player) = state.players.get_mut(&profile.user_id) {
            player.set_online(true, Instant::now());
            player.balance = balance;
            let row = membership_row(&self.config.room_id, player);
            self.deps.settler.store().upsert_membership(&row).await?;
            self.announce_status(&state, &profile.user_id, balance);
            return Ok(());
        }
        if state.players.len() >= self.config.max_participants {
            return Err(RoomError::RoomFull);
        }

        self.insert_player(&mut state, profile, balance).await
    }

    async fn insert_player(&self, state: &mut RoomState, profile: UserProfile, balance: Amount) -> Result<(), RoomError> {
        let player = PlayerRuntime::new(profile.user_id.clone(), profile.display_name.clone(), balance);
        let row = membership_row(&self.config.room_id, &player);
        self.deps.settler.store().upsert_membership(&row).await?;
        state.players.insert(profile.user_id.clone(), player);

        tracing::debug!(room_id = %self.config.room_id, user_id = %profile.user_id, "player joined");
        self.deps.broadcaster.broadcast(
            &self.config.room_id,
            RoomEvent::PlayerJoined {
                user_id: profile.user_id.clone(),
                display_name: profile.display_name,
            },
        );
        self.deps.broadcaster.send_to_user(
            &self.config.room_id,
            &profile.user_id,
            RoomEvent::BalanceUpdate { balance },
        );
        Ok(())
    }

    /// Explicit leave; membership is closed
    pub async fn remove_player(&self, user_id: &str) -> Result<(), RoomError> {
        let mut state = self.state.lock().await;
        if !state.players.contains_key(user_id) {
            return Err(RoomError::NotInRoom);
        }
        self.deps
            .settler
            .store()
            .remove_membership(&self.config.room_id, user_id)
            .await?;
        state.players.remove(user_id);
        tracing::debug!(room_id = %self.config.room_id, user_id, "player left");
        self.deps.broadcaster.broadcast(
            &self.config.room_id,
            RoomEvent::PlayerLeft {
                user_id: user_id.to_string(),
                reason: "left".to_string(),
            },
        );
        Ok(())
    }

    /// Toggle connectivity without dropping the player's state
    pub async fn set_player_online(&self, user_id: &str, online: bool) -> Result<(), RoomError> {
        let balance = if online {
            Some(self.deps.cache.get_balance(user_id).await?)
        } else {
            None
        };
        let mut state = self.state.lock().await;
        let player = state.players.get_mut(user_id).ok_or(RoomError::NotInRoom)?;
        player.set_online(online, Instant::now());
        if let Some(balance) = balance {
            player.balance = balance;
        }
        let current = player.balance;
        let row = membership_row(&self.config.room_id, player);
        self.deps.settler.store().upsert_membership(&row).await?;
        tracing::debug!(room_id = %self.config.room_id, user_id, online, "player connectivity changed");
        self.announce_status(&state, user_id, current);
        if online {
            self.try_start_countdown(&mut state);
        }
        Ok(())
    }

    pub async fn set_auto_ready(&self, user_id: &str, ready: bool) -> Result<(), RoomError> {
        let mut state = self.state.lock().await;
        let player = state.players.get_mut(user_id).ok_or(RoomError::NotInRoom)?;
        player.auto_ready = ready;
        let balance = player.balance;
        let row = membership_row(&self.config.room_id, player);
        self.deps.settler.store().upsert_membership(&row).await?;
        self.announce_status(&state, user_id, balance);
        self.try_start_countdown(&mut state);
        Ok(())
    }

    fn announce_status(&self, state: &RoomState, user_id: &str, balance: Amount) {
        if let Some(player) = state.players.get(user_id) {
            self.deps.broadcaster.broadcast(
                &self.config.room_id,
                RoomEvent::PlayerStatus {
                    user_id: user_id.to_string(),
                    online: player.online,
                    auto_ready: player.auto_ready,
                },
            );
            if player.online {
                self.deps.broadcaster.send_to_user(
                    &self.config.room_id,
                    user_id,
                    RoomEvent::BalanceUpdate { balance },
                );
            }
        }
    }

    pub async fn add_spectator(&self, profile: UserProfile) -> Result<(), RoomError> {
        let mut state = self.state.lock().await;
        if state.players.contains_key(&profile.user_id) {
            return Err(RoomError::AlreadyParticipant);
        }
        if state.spectators.contains_key(&profile.user_id) {
            return Err(RoomError::AlreadySpectator);
        }
        if state.spectators.len() >= self.timing.max_spectators {
            return Err(RoomError::SpectatorLimitReached);
        }
        state.spectators.insert(
            profile.user_id.clone(),
            SpectatorRuntime {
                user_id: profile.user_id.clone(),
                display_name: profile.display_name.clone(),
                joined_at: Instant::now(),
            },
        );
        tracing::debug!(room_id = %self.config.room_id, user_id = %profile.user_id, "spectator joined");
        self.deps.broadcaster.broadcast(
            &self.config.room_id,
            RoomEvent::SpectatorJoined {
                user_id: profile.user_id,
                display_name: profile.display_name,
            },
        );
        Ok(())
    }

    pub async fn remove_spectator(&self, user_id: &str) -> Result<(), RoomError> {
        let mut state = self.state.lock().await;
        if state.spectators.remove(user_id).is_none() {
            return Err(RoomError::NotSpectator);
        }
        self.deps.broadcaster.broadcast(
            &self.config.room_id,
            RoomEvent::SpectatorLeft {
                user_id: user_id.to_string(),
            },
        );
        Ok(())
    }

    pub async fn spectator_to_participant(&self, profile: UserProfile) -> Result<(), RoomError> {
        let balance = self.deps.cache.get_balance(&profile.user_id).await?;
        let mut state = self.state.lock().await;
        if !state.spectators.contains_key(&profile.user_id) {
            return Err(RoomError::NotSpectator);
        }
        if state.players.len() >= self.config.max_participants {
            return Err(RoomError::RoomFull);
        }
        state.spectators.remove(&profile.user_id);
        self.deps.broadcaster.broadcast(
            &self.config.room_id,
            RoomEvent::SpectatorLeft {
                user_id: profile.user_id.clone(),
            },
        );
        self.insert_player(&mut state, profile, balance).await
    }

    /// Whether `user_id` is currently a participant or spectator here
    pub async fn contains(&self, user_id: &str) -> bool {
        let state = self.state.lock().await;
        state.players.contains_key(user_id) || state.spectators.contains_key(user_id)
    }

    pub async fn snapshot(&self) -> RoomSnapshot {
        let state = self.state.lock().await;
        RoomSnapshot {
            room_id: self.config.room_id.clone(),
            phase: state.phase,
            remaining_ms: state.remaining(Instant::now()).as_millis() as u64,
            round_number: state.round_number,
            pool: state.pool,
            round_id: state.round_id.clone(),
            commitment: state.commitment.as_ref().map(|c| c.commitment_hash().to_string()),
            players: state.players.values().map(PlayerView::from).collect(),
            spectator_count: state.spectators.len(),
        }
    }
}

fn membership_row(room_id: &str, player: &PlayerRuntime) -> Membership {
    Membership {
        room_id: room_id.to_string(),
        user_id: player.user_id.clone(),
        ready: player.auto_ready,
        online: player.online,
        joined_at: player.joined_at,
        left_at: None,
    }
}
