//! Round and money-flow counters shared by every room

use crate::money::Amount;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub struct RoomMetrics {
    start_time: Instant,
    rounds_started: AtomicU64,
    rounds_settled: AtomicU64,
    rounds_failed: AtomicU64,
    rounds_cancelled: AtomicU64,
    disqualifications: AtomicU64,
    stakes_collected: AtomicI64,
    prizes_paid: AtomicI64,
    commission_earned: AtomicI64,
    refunded: AtomicI64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub rounds_started: u64,
    pub rounds_settled: u64,
    pub rounds_failed: u64,
    pub rounds_cancelled: u64,
    pub disqualifications: u64,
    pub stakes_collected: Amount,
    pub prizes_paid: Amount,
    pub commission_earned: Amount,
    pub refunded: Amount,
}

impl Default for RoomMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            rounds_started: AtomicU64::new(0),
            rounds_settled: AtomicU64::new(0),
            rounds_failed: AtomicU64::new(0),
            rounds_cancelled: AtomicU64::new(0),
            disqualifications: AtomicU64::new(0),
            stakes_collected: AtomicI64::new(0),
            prizes_paid: AtomicI64::new(0),
            commission_earned: AtomicI64::new(0),
            refunded: AtomicI64::new(0),
        }
    }

    pub fn record_round_started(&self, stakes: Amount) {
        self.rounds_started.fetch_add(1, Ordering::Relaxed);
        self.stakes_collected.fetch_add(stakes.minor(), Ordering::Relaxed);
    }

    pub fn record_round_settled(&self, prizes: Amount, commission: Amount) {
        self.rounds_settled.fetch_add(1, Ordering::Relaxed);
        self.prizes_paid.fetch_add(prizes.minor(), Ordering::Relaxed);
        self.commission_earned.fetch_add(commission.minor(), Ordering::Relaxed);
    }

    pub fn record_round_failed(&self, refunded: Amount) {
        self.rounds_failed.fetch_add(1, Ordering::Relaxed);
        self.refunded.fetch_add(refunded.minor(), Ordering::Relaxed);
    }

    pub fn record_round_cancelled(&self, refunded: Amount) {
        self.rounds_cancelled.fetch_add(1, Ordering::Relaxed);
        self.refunded.fetch_add(refunded.minor(), Ordering::Relaxed);
    }

    pub fn record_disqualifications(&self, count: usize) {
        self.disqualifications.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime().as_secs(),
            rounds_started: self.rounds_started.load(Ordering::Relaxed),
            rounds_settled: self.rounds_settled.load(Ordering::Relaxed),
            rounds_failed: self.rounds_failed.load(Ordering::Relaxed),
            rounds_cancelled: self.rounds_cancelled.load(Ordering::Relaxed),
            disqualifications: self.disqualifications.load(Ordering::Relaxed),
            stakes_collected: Amount::from_minor(self.stakes_collected.load(Ordering::Relaxed)),
            prizes_paid: Amount::from_minor(self.prizes_paid.load(Ordering::Relaxed)),
            commission_earned: Amount::from_minor(self.commission_earned.load(Ordering::Relaxed)),
            refunded: Amount::from_minor(self.refunded.load(Ordering::Relaxed)),
        }
    }
}
