//! Durable FIFO event queue with leases, redelivery and a dead-letter table.
//!
//! Messages live in `queue_message` until acknowledged. A dequeue leases a
//! message: it becomes invisible for the visibility timeout, its attempt
//! count goes up and it gets a fresh lease token. Ack and nack must present
//! the current token; a lease that was superseded by a later dequeue is
//! stale and rejected with `Conflict`.
//!
//! Once a message has been delivered `max_delivery_attempts` times, the next
//! failure (or the next dequeue after its final lease expired) moves it to
//! `dead_letter`. The move is a single transaction, so it happens once.
//!
//! Mutations are serialized through one async lock per queue instance,
//! which assumes a single process owns the queue.

use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lineage_core::{CoreResult, DeadLetter, Event, QueueConfig, QueueStats, codec};
use serde::{Deserialize, Serialize};
use surrealdb::sql::Thing;
use tokio::sync::Mutex;
use tokio::time::Instant;
use ulid::Ulid;

use crate::{Database, DbError};

const THROUGHPUT_WINDOW: Duration = Duration::from_secs(60);

/// Proof of a lease, required to ack or nack a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseHandle {
    pub sequence_id: u64,
    pub lease_token: String,
    /// Delivery attempt this lease represents, starting at 1.
    pub attempt: u32,
}

/// A message handed out by [`DurableQueue::dequeue`].
#[derive(Debug, Clone)]
pub struct LeasedMessage {
    pub handle: LeaseHandle,
    pub payload: String,
    pub enqueued_at: DateTime<Utc>,
}

impl LeasedMessage {
    /// Decode the payload. The queue sequence is authoritative.
    pub fn decode(&self) -> CoreResult<Event> {
        let event = codec::decode_json(&self.payload)?;
        Ok(event.with_sequence(self.handle.sequence_id))
    }
}

/// What a nack did with the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    Requeued,
    DeadLettered,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MessageRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Thing>,
    queue: String,
    sequence_id: u64,
    payload: String,
    attempts: u32,
    visible_at_ms: i64,
    #[serde(default)]
    leased: bool,
    #[serde(default)]
    lease_token: Option<String>,
    #[serde(default)]
    last_error: Option<String>,
    enqueued_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DeadLetterRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Thing>,
    queue: String,
    sequence_id: u64,
    payload: String,
    failure_reason: String,
    attempt_count: u32,
    enqueued_at_ms: i64,
    dead_lettered_at_ms: i64,
}

impl DeadLetterRecord {
    fn into_dead_letter(self) -> DeadLetter {
        DeadLetter {
            queue_name: self.queue,
            sequence_id: self.sequence_id,
            payload: self.payload,
            failure_reason: self.failure_reason,
            attempt_count: self.attempt_count,
            enqueued_at: from_millis(self.enqueued_at_ms),
            dead_lettered_at: from_millis(self.dead_lettered_at_ms),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SequenceRecord {
    value: u64,
}

#[derive(Debug, Deserialize)]
struct CountRow {
    count: u64,
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// A named durable queue backed by SurrealDB.
pub struct DurableQueue {
    db: Database,
    config: QueueConfig,
    guard: Mutex<()>,
    acks: StdMutex<VecDeque<Instant>>,
}

impl DurableQueue {
    pub fn new(db: Database, config: QueueConfig) -> Self {
        Self {
            db,
            config,
            guard: Mutex::new(()),
            acks: StdMutex::new(VecDeque::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn key(&self, sequence_id: u64) -> String {
        format!("{}-{:020}", self.config.name, sequence_id)
    }

    /// Append an event and return its sequence id.
    pub async fn enqueue(&self, event: &Event) -> Result<u64, DbError> {
        let _guard = self.guard.lock().await;
        let sequence_id = self.next_sequence().await?;
        let payload = codec::encode_json(&event.clone().with_sequence(sequence_id))
            .map_err(|e| DbError::Serialization(e.to_string()))?;
        self.insert(sequence_id, payload, now_millis()).await?;

        tracing::debug!(
            queue = %self.config.name,
            sequence_id,
            "Enqueued {}",
            event.body.description()
        );
        Ok(sequence_id)
    }

    /// Append a pre-encoded payload without validating it.
    pub async fn enqueue_raw(&self, payload: impl Into<String>) -> Result<u64, DbError> {
        let _guard = self.guard.lock().await;
        let sequence_id = self.next_sequence().await?;
        self.insert(sequence_id, payload.into(), now_millis()).await?;
        Ok(sequence_id)
    }

    async fn next_sequence(&self) -> Result<u64, DbError> {
        let current: Option<SequenceRecord> = self
            .db
            .select(("queue_sequence", self.config.name.as_str()))
            .await?;
        Ok(current.map_or(1, |r| r.value + 1))
    }

    fn fresh_record(&self, sequence_id: u64, payload: String, enqueued_at_ms: i64) -> MessageRecord {
        MessageRecord {
            id: None,
            queue: self.config.name.clone(),
            sequence_id,
            payload,
            attempts: 0,
            visible_at_ms: enqueued_at_ms,
            leased: false,
            lease_token: None,
            last_error: None,
            enqueued_at_ms,
        }
    }

    async fn insert(&self, sequence_id: u64, payload: String, enqueued_at_ms: i64) -> Result<(), DbError> {
        let record = self.fresh_record(sequence_id, payload, enqueued_at_ms);

        self.db
            .query(
                r#"
                BEGIN TRANSACTION;
                UPSERT type::thing('queue_sequence', $queue) CONTENT { value: $sequence_id };
                CREATE type::thing('queue_message', $key) CONTENT $record;
                COMMIT TRANSACTION;
                "#,
            )
            .bind(("queue", self.config.name.clone()))
            .bind(("sequence_id", sequence_id))
            .bind(("key", self.key(sequence_id)))
            .bind(("record", record))
            .await?
            .check()?;

        Ok(())
    }

    /// Lease up to `batch_size` visible messages in sequence order.
    pub async fn dequeue(
        &self,
        batch_size: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<LeasedMessage>, DbError> {
        let _guard = self.guard.lock().await;
        let now = now_millis();

        let mut response = self
            .db
            .query(
                r#"
                SELECT * FROM queue_message
                WHERE queue = $queue AND visible_at_ms <= $now
                ORDER BY sequence_id ASC
                LIMIT $limit
                "#,
            )
            .bind(("queue", self.config.name.clone()))
            .bind(("now", now))
            .bind(("limit", batch_size as i64))
            .await?;
        let records: Vec<MessageRecord> = response.take(0)?;

        let mut leased = Vec::with_capacity(records.len());
        for record in records {
            if record.attempts >= self.config.max_delivery_attempts {
                let reason = record.last_error.clone().unwrap_or_else(|| {
                    format!(
                        "lease expired after {} delivery attempts",
                        record.attempts
                    )
                });
                self.move_to_dead_letter(&record, &reason).await?;
                continue;
            }

            let lease_token = Ulid::new().to_string();
            let attempts = record.attempts + 1;
            let _: Option<MessageRecord> = self
                .db
                .update(("queue_message", self.key(record.sequence_id)))
                .merge(serde_json::json!({
                    "attempts": attempts,
                    "leased": true,
                    "lease_token": lease_token,
                    "visible_at_ms": now.saturating_add(duration_millis(visibility_timeout)),
                }))
                .await?;

            leased.push(LeasedMessage {
                handle: LeaseHandle {
                    sequence_id: record.sequence_id,
                    lease_token,
                    attempt: attempts,
                },
                payload: record.payload,
                enqueued_at: from_millis(record.enqueued_at_ms),
            });
        }

        Ok(leased)
    }

    async fn load_leased(&self, handle: &LeaseHandle) -> Result<MessageRecord, DbError> {
        let record: Option<MessageRecord> = self
            .db
            .select(("queue_message", self.key(handle.sequence_id)))
            .await?;
        let record = record
            .ok_or_else(|| DbError::NotFound(format!("Message not found: {}", handle.sequence_id)))?;

        if record.lease_token.as_deref() != Some(handle.lease_token.as_str()) {
            return Err(DbError::Conflict(format!(
                "Stale lease for message {}",
                handle.sequence_id
            )));
        }
        Ok(record)
    }

    /// Acknowledge and remove a leased message.
    pub async fn ack(&self, handle: &LeaseHandle) -> Result<(), DbError> {
        let _guard = self.guard.lock().await;
        self.load_leased(handle).await?;

        let _: Option<MessageRecord> = self
            .db
            .delete(("queue_message", self.key(handle.sequence_id)))
            .await?;

        let mut acks = self.acks.lock().unwrap_or_else(|e| e.into_inner());
        acks.push_back(Instant::now());
        Ok(())
    }

    /// Release a lease for immediate redelivery.
    pub async fn nack(&self, handle: &LeaseHandle) -> Result<NackOutcome, DbError> {
        self.nack_with_error(handle, Duration::ZERO, None).await
    }

    /// Release a lease, redelivering after `delay`.
    pub async fn nack_with_delay(
        &self,
        handle: &LeaseHandle,
        delay: Duration,
    ) -> Result<NackOutcome, DbError> {
        self.nack_with_error(handle, delay, None).await
    }

    /// Release a lease after a failed attempt, recording the failure.
    ///
    /// Dead-letters the message instead when its attempts are exhausted.
    pub async fn nack_with_error(
        &self,
        handle: &LeaseHandle,
        delay: Duration,
        reason: Option<String>,
    ) -> Result<NackOutcome, DbError> {
        let _guard = self.guard.lock().await;
        let record = self.load_leased(handle).await?;

        if record.attempts >= self.config.max_delivery_attempts {
            let reason = reason.unwrap_or_else(|| {
                format!(
                    "exceeded {} delivery attempts",
                    self.config.max_delivery_attempts
                )
            });
            self.move_to_dead_letter(&record, &reason).await?;
            return Ok(NackOutcome::DeadLettered);
        }

        let _: Option<MessageRecord> = self
            .db
            .update(("queue_message", self.key(handle.sequence_id)))
            .merge(serde_json::json!({
                "leased": false,
                "lease_token": null,
                "last_error": reason,
                "visible_at_ms": now_millis().saturating_add(duration_millis(delay)),
            }))
            .await?;

        Ok(NackOutcome::Requeued)
    }

    /// Move a leased message straight to the dead-letter queue.
    pub async fn dead_letter(&self, handle: &LeaseHandle, reason: &str) -> Result<(), DbError> {
        let _guard = self.guard.lock().await;
        let record = self.load_leased(handle).await?;
        self.move_to_dead_letter(&record, reason).await
    }

    async fn move_to_dead_letter(&self, record: &MessageRecord, reason: &str) -> Result<(), DbError> {
        let key = self.key(record.sequence_id);
        let letter = DeadLetterRecord {
            id: None,
            queue: record.queue.clone(),
            sequence_id: record.sequence_id,
            payload: record.payload.clone(),
            failure_reason: reason.to_string(),
            attempt_count: record.attempts,
            enqueued_at_ms: record.enqueued_at_ms,
            dead_lettered_at_ms: now_millis(),
        };

        self.db
            .query(
                r#"
                BEGIN TRANSACTION;
                CREATE type::thing('dead_letter', $key) CONTENT $letter;
                DELETE type::thing('queue_message', $key);
                COMMIT TRANSACTION;
                "#,
            )
            .bind(("key", key))
            .bind(("letter", letter))
            .await?
            .check()?;

        tracing::warn!(
            queue = %self.config.name,
            sequence_id = record.sequence_id,
            attempts = record.attempts,
            "Message dead-lettered: {}",
            reason
        );
        Ok(())
    }

    /// Re-enqueue a dead letter under a new sequence id.
    ///
    /// The new message and the removal of the dead letter commit together.
    pub async fn redrive(&self, sequence_id: u64) -> Result<u64, DbError> {
        let _guard = self.guard.lock().await;
        let key = self.key(sequence_id);

        let letter: Option<DeadLetterRecord> = self.db.select(("dead_letter", key.as_str())).await?;
        let letter =
            letter.ok_or_else(|| DbError::NotFound(format!("Dead letter not found: {}", sequence_id)))?;

        let new_sequence = self.next_sequence().await?;
        let record = self.fresh_record(new_sequence, letter.payload, now_millis());

        self.db
            .query(
                r#"
                BEGIN TRANSACTION;
                UPSERT type::thing('queue_sequence', $queue) CONTENT { value: $sequence_id };
                CREATE type::thing('queue_message', $new_key) CONTENT $record;
                DELETE type::thing('dead_letter', $old_key);
                COMMIT TRANSACTION;
                "#,
            )
            .bind(("queue", self.config.name.clone()))
            .bind(("sequence_id", new_sequence))
            .bind(("new_key", self.key(new_sequence)))
            .bind(("record", record))
            .bind(("old_key", key))
            .await?
            .check()?;

        tracing::info!(
            queue = %self.config.name,
            from = sequence_id,
            to = new_sequence,
            "Dead letter redriven"
        );
        Ok(new_sequence)
    }

    /// Dead letters of this queue, oldest sequence first.
    pub async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, DbError> {
        let mut response = self
            .db
            .query(
                "SELECT * FROM dead_letter WHERE queue = $queue ORDER BY sequence_id ASC LIMIT $limit",
            )
            .bind(("queue", self.config.name.clone()))
            .bind(("limit", limit as i64))
            .await?;
        let records: Vec<DeadLetterRecord> = response.take(0)?;

        Ok(records
            .into_iter()
            .map(DeadLetterRecord::into_dead_letter)
            .collect())
    }

    async fn count(&self, query: &'static str) -> Result<u64, DbError> {
        let mut response = self
            .db
            .query(query)
            .bind(("queue", self.config.name.clone()))
            .bind(("now", now_millis()))
            .await?;
        let rows: Vec<CountRow> = response.take(0)?;
        Ok(rows.first().map_or(0, |r| r.count))
    }

    /// Messages not yet acknowledged, leased or not.
    pub async fn depth(&self) -> Result<u64, DbError> {
        self.count("SELECT count() AS count FROM queue_message WHERE queue = $queue GROUP ALL")
            .await
    }

    /// Messages under an unexpired lease.
    pub async fn in_flight(&self) -> Result<u64, DbError> {
        self.count(
            "SELECT count() AS count FROM queue_message WHERE queue = $queue AND leased = true AND visible_at_ms > $now GROUP ALL",
        )
        .await
    }

    pub async fn dead_letter_depth(&self) -> Result<u64, DbError> {
        self.count("SELECT count() AS count FROM dead_letter WHERE queue = $queue GROUP ALL")
            .await
    }

    /// Acks over the last minute.
    pub fn throughput_per_min(&self) -> f64 {
        let mut acks = self.acks.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        while let Some(oldest) = acks.front() {
            if now.duration_since(*oldest) > THROUGHPUT_WINDOW {
                acks.pop_front();
            } else {
                break;
            }
        }
        acks.len() as f64
    }

    pub async fn stats(&self) -> Result<QueueStats, DbError> {
        Ok(QueueStats {
            queue_name: self.config.name.clone(),
            depth: self.depth().await?,
            in_flight: self.in_flight().await?,
            dead_letter_depth: self.dead_letter_depth().await?,
            throughput_per_min: self.throughput_per_min(),
        })
    }
}
