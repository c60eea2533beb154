#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use actors::{BackoffPolicy, EventHub, EventProcessor, HubConfig, RunProducer, RunStateMachine};
use db::{Database, DbConfig, DbError, DurableQueue};
use lineage_core::{QueueConfig, SseFrame};
use tokio::sync::mpsc;

use actors::hub::{FrameSink, SinkError, SinkFuture};

/// A coordinator assembled without any actors running.
pub struct Harness {
    pub db: Database,
    pub machine: Arc<RunStateMachine>,
    pub queue: Arc<DurableQueue>,
    pub hub: Arc<EventHub>,
    pub producer: RunProducer,
    pub processor: EventProcessor,
}

pub async fn setup(max_attempts: u32) -> Result<Harness, DbError> {
    let db = db::init(&DbConfig::memory()).await?;
    let machine = Arc::new(RunStateMachine::new(db.clone()));
    let queue = Arc::new(DurableQueue::new(
        db.clone(),
        QueueConfig::new("test_events").with_max_delivery_attempts(max_attempts),
    ));
    let hub = Arc::new(EventHub::new(HubConfig::default()));
    let producer = RunProducer::new(machine.clone(), queue.clone());
    let processor = EventProcessor::new(queue.clone(), machine.clone(), hub.clone())
        .with_backoff(BackoffPolicy {
            first: Duration::from_millis(10),
            max: Duration::from_millis(50),
            factor: 2.0,
            jitter: Duration::ZERO,
        });

    Ok(Harness {
        db,
        machine,
        queue,
        hub,
        producer,
        processor,
    })
}

/// Sink that forwards frames into a channel.
pub struct ChannelSink(pub mpsc::Sender<SseFrame>);

impl FrameSink for ChannelSink {
    fn send(&mut self, frame: SseFrame) -> SinkFuture<'_> {
        Box::pin(async move { self.0.send(frame).await.map_err(|_| SinkError::Closed) })
    }
}

/// Sink whose every write fails.
pub struct BrokenSink;

impl FrameSink for BrokenSink {
    fn send(&mut self, _frame: SseFrame) -> SinkFuture<'_> {
        Box::pin(async { Err(SinkError::Io("broken pipe".into())) })
    }
}
