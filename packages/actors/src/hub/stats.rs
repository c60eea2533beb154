//! Introspection snapshots and the zombie ledger.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::client::{ClientId, ZombieReason};

const ZOMBIE_HISTORY: usize = 100;

/// Health of one connected observer.
#[derive(Debug, Clone, Serialize)]
pub struct ClientSnapshot {
    pub client_id: ClientId,
    pub connected_at: DateTime<Utc>,
    pub subscriptions: Vec<String>,
    pub consecutive_write_errors: u32,
    pub missed_pings: u32,
    pub consecutive_full_queue_count: u32,
    pub idle_secs: f64,
    pub pong_received: bool,
    pub ping_count: u64,
    pub events_written: u64,
    pub events_dropped: u64,
    pub queued: usize,
}

/// Hub-wide statistics.
#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub connected_clients: usize,
    pub events_published: u64,
    /// Evicted zombies whose connection task has not finished yet.
    pub current_zombie_count: usize,
    pub total_zombies_detected: u64,
    pub zombie_reasons: BTreeMap<String, u64>,
    pub last_cleanup_at: Option<DateTime<Utc>>,
    pub clients: Vec<ClientSnapshot>,
}

/// One detected zombie.
#[derive(Debug, Clone, Serialize)]
pub struct ZombieDetail {
    pub client_id: ClientId,
    pub reason: ZombieReason,
    pub detected_at: DateTime<Utc>,
    pub connected_at: DateTime<Utc>,
    pub consecutive_write_errors: u32,
    pub missed_pings: u32,
    pub consecutive_full_queue_count: u32,
    /// Whether the connection task still holds its stream.
    pub attached: bool,
}

/// Zombie-focused view for operators.
#[derive(Debug, Clone, Serialize)]
pub struct ZombieStats {
    pub current_zombie_count: usize,
    pub total_zombies_detected: u64,
    pub zombie_reasons: BTreeMap<String, u64>,
    pub last_cleanup_at: Option<DateTime<Utc>>,
    pub recent: Vec<ZombieDetail>,
}

/// An observer removed by a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Eviction {
    pub client_id: ClientId,
    pub reason: ZombieReason,
}

/// Result of a sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub evicted: Vec<Eviction>,
    pub remaining_clients: usize,
}

pub(crate) struct ZombieEntry {
    pub detail: ZombieDetail,
    pub attached: Arc<AtomicBool>,
}

impl ZombieEntry {
    fn view(&self) -> ZombieDetail {
        ZombieDetail {
            attached: self.attached.load(Ordering::SeqCst),
            ..self.detail.clone()
        }
    }
}

#[derive(Default)]
pub(crate) struct ZombieLedger {
    recent: VecDeque<ZombieEntry>,
    total: u64,
    reasons: BTreeMap<String, u64>,
    pub last_cleanup_at: Option<DateTime<Utc>>,
}

impl ZombieLedger {
    pub fn record(&mut self, entry: ZombieEntry) {
        self.total += 1;
        *self
            .reasons
            .entry(entry.detail.reason.as_str().to_string())
            .or_default() += 1;
        if self.recent.len() == ZOMBIE_HISTORY {
            self.recent.pop_front();
        }
        self.recent.push_back(entry);
    }

    pub fn current(&self) -> usize {
        self.recent
            .iter()
            .filter(|e| e.attached.load(Ordering::SeqCst))
            .count()
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn reasons(&self) -> BTreeMap<String, u64> {
        self.reasons.clone()
    }

    pub fn stats(&self) -> ZombieStats {
        ZombieStats {
            current_zombie_count: self.current(),
            total_zombies_detected: self.total,
            zombie_reasons: self.reasons.clone(),
            last_cleanup_at: self.last_cleanup_at,
            recent: self.recent.iter().map(ZombieEntry::view).collect(),
        }
    }
}
