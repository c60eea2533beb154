//! Event hub: fans events out to observer connections and evicts observers
//! whose connections silently died.
//!
//! Each observer owns a bounded queue drained by its own writer task
//! ([`writer::drive`]). Publishing never blocks: a full queue drops the event
//! for that observer and counts against it. Liveness is driven from outside
//! by [`EventHub::ping_all`] and [`EventHub::sweep`], normally on the timers
//! of a [`HubMonitor`].
//!
//! # Eviction rules
//!
//! An observer is a zombie when any of these hold:
//! - more than `max_write_errors` consecutive write failures
//! - more than `max_missed_pings` pings without a pong
//! - `max_full_queue_count` consecutive publishes found its queue full
//! - no pong within `pong_timeout` of the first unanswered ping
//! - no activity for `inactivity_timeout`
//!
//! Eviction closes the observer's queue and signals its writer.

mod client;
mod monitor;
mod stats;
pub mod writer;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, RwLock};

use chrono::{DateTime, Utc};
use lineage_core::{CoreError, CoreResult, Event, EventBody, EventKind};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};

pub use client::{ClientId, ClientStream, CloseReason, ZombieReason};
pub use monitor::{HubMonitor, start_hub_monitor};
pub use stats::{
    CleanupReport, ClientSnapshot, Eviction, HubStats, ZombieDetail, ZombieStats,
};
pub use writer::{FrameSink, SinkError, SinkFuture, drive};

use client::{Attachment, ClientHealth};
use stats::{ZombieEntry, ZombieLedger};

/// Tuning for queues, liveness pings and eviction thresholds.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Bounded queue size per observer.
    pub client_queue_capacity: usize,
    pub ping_interval: Duration,
    pub zombie_check_interval: Duration,
    pub pong_timeout: Duration,
    pub inactivity_timeout: Duration,
    /// Idle time after which a writer emits a heartbeat.
    pub heartbeat_interval: Duration,
    /// Longest a single frame write may take before it counts as failed.
    pub write_timeout: Duration,
    pub max_write_errors: u32,
    pub max_missed_pings: u32,
    pub max_full_queue_count: u32,
    /// Recent events kept for replay to new observers.
    pub history_size: usize,
    /// Events replayed on registration.
    pub replay_on_connect: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            client_queue_capacity: 100,
            ping_interval: Duration::from_secs(30),
            zombie_check_interval: Duration::from_secs(60),
            pong_timeout: Duration::from_secs(90),
            inactivity_timeout: Duration::from_secs(120),
            heartbeat_interval: Duration::from_secs(15),
            write_timeout: Duration::from_secs(5),
            max_write_errors: 3,
            max_missed_pings: 3,
            max_full_queue_count: 10,
            history_size: 1000,
            replay_on_connect: 50,
        }
    }
}

impl HubConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.client_queue_capacity = capacity.max(1);
        self
    }

    pub fn with_replay(mut self, replay_on_connect: usize) -> Self {
        self.replay_on_connect = replay_on_connect;
        self
    }
}

/// Result of one publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PublishOutcome {
    /// Stream sequence stamped on the event.
    pub sequence_id: u64,
    pub delivered: usize,
    /// Observers whose queue was full.
    pub dropped: usize,
}

struct ClientSlot {
    id: ClientId,
    subscriptions: HashSet<EventKind>,
    tx: mpsc::Sender<Event>,
    health: StdMutex<ClientHealth>,
    close_tx: StdMutex<Option<oneshot::Sender<CloseReason>>>,
    attached: Arc<AtomicBool>,
    connected_at: DateTime<Utc>,
}

impl ClientSlot {
    fn wants(&self, kind: EventKind) -> bool {
        kind.is_control() || self.subscriptions.is_empty() || self.subscriptions.contains(&kind)
    }

    fn health(&self) -> MutexGuard<'_, ClientHealth> {
        self.health.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshot(&self, capacity: usize, now: Instant) -> ClientSnapshot {
        let health = self.health();
        let mut subscriptions: Vec<String> = self
            .subscriptions
            .iter()
            .map(|k| k.as_str().to_string())
            .collect();
        subscriptions.sort();

        ClientSnapshot {
            client_id: self.id,
            connected_at: self.connected_at,
            subscriptions,
            consecutive_write_errors: health.consecutive_write_errors,
            missed_pings: health.missed_pings,
            consecutive_full_queue_count: health.consecutive_full_queue_count,
            idle_secs: health.idle_for(now).as_secs_f64(),
            pong_received: health.pong_received,
            ping_count: health.ping_count,
            events_written: health.events_written,
            events_dropped: health.events_dropped,
            queued: capacity.saturating_sub(self.tx.capacity()),
        }
    }
}

/// Registry of observer connections.
pub struct EventHub {
    config: HubConfig,
    clients: RwLock<HashMap<ClientId, Arc<ClientSlot>>>,
    sequence: AtomicU64,
    pings: AtomicU64,
    published: AtomicU64,
    history: StdMutex<VecDeque<Event>>,
    zombies: StdMutex<ZombieLedger>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

impl EventHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            clients: RwLock::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            pings: AtomicU64::new(0),
            published: AtomicU64::new(0),
            history: StdMutex::new(VecDeque::new()),
            zombies: StdMutex::new(ZombieLedger::default()),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    fn read_clients(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<ClientId, Arc<ClientSlot>>> {
        self.clients.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_clients(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<ClientId, Arc<ClientSlot>>> {
        self.clients.write().unwrap_or_else(|e| e.into_inner())
    }

    fn slot(&self, client_id: ClientId) -> Option<Arc<ClientSlot>> {
        self.read_clients().get(&client_id).cloned()
    }

    fn ledger(&self) -> MutexGuard<'_, ZombieLedger> {
        self.zombies.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stamp the next stream sequence onto an event.
    pub fn stamp(&self, event: Event) -> Event {
        let sequence_id = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        event.with_sequence(sequence_id)
    }

    pub fn client_count(&self) -> usize {
        self.read_clients().len()
    }

    /// Register an observer. An empty subscription set receives everything.
    pub fn register(&self, subscriptions: impl IntoIterator<Item = EventKind>) -> ClientStream {
        let client_id = ClientId::new();
        let subscriptions: HashSet<EventKind> = subscriptions.into_iter().collect();
        let capacity = self.config.client_queue_capacity;
        let (tx, events) = mpsc::channel(capacity);
        let (close_tx, closed) = oneshot::channel();
        let attached = Arc::new(AtomicBool::new(true));

        let slot = Arc::new(ClientSlot {
            id: client_id,
            subscriptions,
            tx,
            health: StdMutex::new(ClientHealth::new(Instant::now())),
            close_tx: StdMutex::new(Some(close_tx)),
            attached: attached.clone(),
            connected_at: Utc::now(),
        });

        let replayed = self.replay_into(&slot);
        self.write_clients().insert(client_id, slot);

        tracing::info!(
            client = %client_id,
            replayed,
            "Observer connected ({} total)",
            self.client_count()
        );

        ClientStream {
            client_id,
            events,
            closed,
            _attachment: Attachment(attached),
        }
    }

    fn replay_into(&self, slot: &ClientSlot) -> usize {
        let limit = self
            .config
            .replay_on_connect
            .min(self.config.client_queue_capacity / 2);
        if limit == 0 {
            return 0;
        }

        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let mut recent: Vec<&Event> = history
            .iter()
            .rev()
            .filter(|event| slot.wants(event.kind()))
            .take(limit)
            .collect();
        recent.reverse();

        recent
            .into_iter()
            .filter(|event| slot.tx.try_send((*event).clone()).is_ok())
            .count()
    }

    fn remember(&self, event: &Event) {
        if event.kind().is_control() || self.config.history_size == 0 {
            return;
        }
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        if history.len() == self.config.history_size {
            history.pop_front();
        }
        history.push_back(event.clone());
    }

    /// Fan an event out to every interested observer without blocking.
    pub fn publish(&self, event: Event) -> PublishOutcome {
        self.publish_to(event, None)
    }

    /// Like [`publish`](Self::publish), limited to `targets` when given.
    pub fn publish_to(&self, event: Event, targets: Option<&HashSet<ClientId>>) -> PublishOutcome {
        let event = self.stamp(event);
        self.published.fetch_add(1, Ordering::Relaxed);
        if targets.is_none() {
            self.remember(&event);
        }

        let kind = event.kind();
        let mut outcome = PublishOutcome {
            sequence_id: event.sequence_id,
            ..Default::default()
        };

        let clients = self.read_clients();
        for slot in clients.values() {
            if targets.is_some_and(|t| !t.contains(&slot.id)) || !slot.wants(kind) {
                continue;
            }
            match slot.tx.try_send(event.clone()) {
                Ok(()) => {
                    outcome.delivered += 1;
                    slot.health().consecutive_full_queue_count = 0;
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    outcome.dropped += 1;
                    let mut health = slot.health();
                    health.consecutive_full_queue_count += 1;
                    health.events_dropped += 1;
                    tracing::debug!(
                        client = %slot.id,
                        full_count = health.consecutive_full_queue_count,
                        "Observer queue full, dropping {}",
                        kind
                    );
                }
                // Writer already gone; the slot is removed on disconnect.
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }

        outcome
    }

    /// Send a ping to every observer and count it as missed until a pong.
    pub fn ping_all(&self) -> usize {
        let now = Instant::now();
        let clients = self.read_clients();
        for slot in clients.values() {
            let ping_id = self.pings.fetch_add(1, Ordering::SeqCst) + 1;
            let ping = self.stamp(Event::new(EventBody::Ping { ping_id }));
            let _ = slot.tx.try_send(ping);

            let mut health = slot.health();
            health.missed_pings += 1;
            health.ping_count += 1;
            health.pong_received = false;
            health.last_ping_sent_at = Some(now);
            health.first_unanswered_ping_at.get_or_insert(now);
        }
        clients.len()
    }

    /// Record a pong from an observer.
    pub fn pong(&self, client_id: ClientId) -> CoreResult<()> {
        let slot = self
            .slot(client_id)
            .ok_or_else(|| CoreError::NotFound(format!("Client not found: {}", client_id)))?;

        let mut health = slot.health();
        health.missed_pings = 0;
        health.pong_received = true;
        health.first_unanswered_ping_at = None;
        health.last_activity_at = Instant::now();
        Ok(())
    }

    /// Record a successful frame write.
    pub fn record_write(&self, client_id: ClientId) {
        if let Some(slot) = self.slot(client_id) {
            let mut health = slot.health();
            health.consecutive_write_errors = 0;
            health.events_written += 1;
            health.last_activity_at = Instant::now();
        }
    }

    /// Record a failed frame write, evicting the observer once it has failed
    /// more than `max_write_errors` times in a row.
    pub fn report_write_error(&self, client_id: ClientId) -> Option<ZombieReason> {
        let slot = self.slot(client_id)?;
        let errors = {
            let mut health = slot.health();
            health.consecutive_write_errors += 1;
            health.consecutive_write_errors
        };

        if errors > self.config.max_write_errors {
            self.evict(client_id, CloseReason::Zombie(ZombieReason::WriteErrors));
            return Some(ZombieReason::WriteErrors);
        }
        None
    }

    /// Evict every observer that breaks an eviction rule.
    pub fn sweep(&self) -> CleanupReport {
        let now = Instant::now();
        let candidates: Vec<Eviction> = self
            .read_clients()
            .values()
            .filter_map(|slot| {
                slot.health()
                    .zombie_reason(now, &self.config)
                    .map(|reason| Eviction {
                        client_id: slot.id,
                        reason,
                    })
            })
            .collect();

        let evicted: Vec<Eviction> = candidates
            .into_iter()
            .filter(|e| self.evict(e.client_id, CloseReason::Zombie(e.reason)))
            .collect();

        self.ledger().last_cleanup_at = Some(Utc::now());
        let remaining_clients = self.client_count();

        if !evicted.is_empty() {
            tracing::info!(
                evicted = evicted.len(),
                remaining = remaining_clients,
                "Zombie sweep finished"
            );
        }

        CleanupReport {
            evicted,
            remaining_clients,
        }
    }

    /// Run a sweep immediately.
    pub fn force_cleanup(&self) -> CleanupReport {
        self.sweep()
    }

    /// Remove an observer on request.
    pub fn disconnect(&self, client_id: ClientId) -> CoreResult<()> {
        if self.evict(client_id, CloseReason::Disconnected) {
            Ok(())
        } else {
            Err(CoreError::NotFound(format!("Client not found: {}", client_id)))
        }
    }

    /// Disconnect everyone.
    pub fn shutdown(&self) {
        let ids: Vec<ClientId> = self.read_clients().keys().copied().collect();
        for id in ids {
            self.evict(id, CloseReason::Shutdown);
        }
    }

    fn evict(&self, client_id: ClientId, reason: CloseReason) -> bool {
        let Some(slot) = self.write_clients().remove(&client_id) else {
            return false;
        };

        if let CloseReason::Zombie(zombie) = reason {
            let health = slot.health().clone();
            tracing::warn!(
                client = %client_id,
                reason = %zombie,
                write_errors = health.consecutive_write_errors,
                missed_pings = health.missed_pings,
                full_queue = health.consecutive_full_queue_count,
                "Evicting zombie observer"
            );
            self.ledger().record(ZombieEntry {
                detail: ZombieDetail {
                    client_id,
                    reason: zombie,
                    detected_at: Utc::now(),
                    connected_at: slot.connected_at,
                    consecutive_write_errors: health.consecutive_write_errors,
                    missed_pings: health.missed_pings,
                    consecutive_full_queue_count: health.consecutive_full_queue_count,
                    attached: true,
                },
                attached: slot.attached.clone(),
            });
        } else {
            tracing::info!(client = %client_id, ?reason, "Observer disconnected");
        }

        let close_tx = slot
            .close_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(close_tx) = close_tx {
            let _ = close_tx.send(reason);
        }
        true
    }

    pub fn stats(&self) -> HubStats {
        let now = Instant::now();
        let capacity = self.config.client_queue_capacity;
        let mut clients: Vec<ClientSnapshot> = self
            .read_clients()
            .values()
            .map(|slot| slot.snapshot(capacity, now))
            .collect();
        clients.sort_by_key(|c| c.client_id);

        let ledger = self.ledger();
        HubStats {
            connected_clients: clients.len(),
            events_published: self.published.load(Ordering::Relaxed),
            current_zombie_count: ledger.current(),
            total_zombies_detected: ledger.total(),
            zombie_reasons: ledger.reasons(),
            last_cleanup_at: ledger.last_cleanup_at,
            clients,
        }
    }

    pub fn zombie_stats(&self) -> ZombieStats {
        self.ledger().stats()
    }

    /// Health snapshot for one observer.
    pub fn client(&self, client_id: ClientId) -> Option<ClientSnapshot> {
        self.slot(client_id)
            .map(|slot| slot.snapshot(self.config.client_queue_capacity, Instant::now()))
    }
}
