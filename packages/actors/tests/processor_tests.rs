#![allow(clippy::disallowed_methods)]

mod common;

use std::error::Error;
use std::time::Duration;

use actors::{ClientStream, ProcessOutcome};
use lineage_core::{
    Artifact, CoreError, Event, EventBody, EventKind, LineagePhase, RunChange, RunId, RunState,
};
use serde_json::json;

use common::Harness;

const LEASE: Duration = Duration::from_secs(30);

/// Lease everything visible and process it in order.
async fn drain(h: &Harness) -> Result<Vec<ProcessOutcome>, Box<dyn Error>> {
    let mut outcomes = Vec::new();
    for message in h.queue.dequeue(100, LEASE).await? {
        outcomes.push(h.processor.process(message).await?);
    }
    Ok(outcomes)
}

fn received(stream: &mut ClientStream) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = stream.events.try_recv() {
        events.push(event);
    }
    events
}

fn kinds(events: &[Event]) -> Vec<EventKind> {
    events.iter().map(Event::kind).collect()
}

#[tokio::test]
async fn test_run_lifecycle() -> Result<(), Box<dyn Error>> {
    let h = common::setup(3).await?;
    let mut observer = h.hub.register([]);
    h.machine.register_job("orders", json!({"owner": "data"})).await?;

    let started = h.producer.start_run("orders", json!({"inputs": ["raw.orders"]}), None).await?;
    assert_eq!(started.run.state, RunState::Pending);
    assert_eq!(started.sequence_id, 1);

    assert_eq!(drain(&h).await?, vec![ProcessOutcome::Applied(RunState::Running)]);
    let run = h.machine.get_run(started.run.run_id).await?;
    assert_eq!(run.state, RunState::Running);

    let change = RunChange::new()
        .with_artifacts(vec![Artifact::new("table", "mart.orders")])
        .with_metadata(json!({"rows": 42}));
    let queued = h
        .producer
        .complete_run(run.run_id, RunState::Completed, change)
        .await?;
    // Not applied until the worker gets to it.
    assert_eq!(queued.run.state, RunState::Running);

    assert_eq!(drain(&h).await?, vec![ProcessOutcome::Applied(RunState::Completed)]);
    let run = h.machine.get_run(run.run_id).await?;
    assert_eq!(run.state, RunState::Completed);
    assert!(run.ended_at.is_some());
    assert_eq!(run.artifacts.len(), 1);
    assert_eq!(run.metadata["rows"], 42);
    assert_eq!(run.metadata["inputs"][0], "raw.orders");

    let events = received(&mut observer);
    assert_eq!(
        kinds(&events),
        vec![
            EventKind::LineageEvent,
            EventKind::JobStatus,
            EventKind::LineageEvent,
            EventKind::JobStatus,
        ]
    );
    assert!(events.windows(2).all(|w| w[0].sequence_id < w[1].sequence_id));
    match &events[3].body {
        EventBody::JobStatus { status, progress, .. } => {
            assert_eq!(status, "COMPLETED");
            assert_eq!(*progress, Some(1.0));
        }
        other => panic!("unexpected event {:?}", other),
    }

    assert_eq!(h.queue.depth().await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_repeated_terminal_state_is_unchanged() -> Result<(), Box<dyn Error>> {
    let h = common::setup(3).await?;
    h.machine.register_job("orders", json!({})).await?;
    let run = h.producer.start_run("orders", json!({}), None).await?.run;
    drain(&h).await?;

    h.producer.complete_run(run.run_id, RunState::Completed, RunChange::new()).await?;
    h.producer.complete_run(run.run_id, RunState::Completed, RunChange::new()).await?;

    let mut observer = h.hub.register([EventKind::LineageEvent]);
    let outcomes = drain(&h).await?;
    assert_eq!(
        outcomes,
        vec![ProcessOutcome::Applied(RunState::Completed), ProcessOutcome::Unchanged]
    );
    // Replay of the START plus one COMPLETE.
    assert_eq!(received(&mut observer).len(), 2);

    // Once finished, the producer accepts the same state again.
    let again = h
        .producer
        .complete_run(run.run_id, RunState::Completed, RunChange::new())
        .await?;
    assert_eq!(again.run.state, RunState::Completed);
    Ok(())
}

#[tokio::test]
async fn test_conflicting_terminal_state_publishes_error() -> Result<(), Box<dyn Error>> {
    let h = common::setup(3).await?;
    h.machine.register_job("orders", json!({})).await?;
    let run = h.producer.start_run("orders", json!({}), None).await?.run;
    drain(&h).await?;

    h.producer.complete_run(run.run_id, RunState::Completed, RunChange::new()).await?;
    h.producer
        .complete_run(run.run_id, RunState::Failed, RunChange::new().with_error("late failure"))
        .await?;

    let mut errors = h.hub.register([EventKind::Error]);
    let outcomes = drain(&h).await?;
    assert_eq!(
        outcomes,
        vec![ProcessOutcome::Applied(RunState::Completed), ProcessOutcome::Rejected]
    );

    let events = received(&mut errors);
    assert_eq!(events.len(), 1);
    match &events[0].body {
        EventBody::Error { error_type, details, .. } => {
            assert_eq!(error_type, "conflict");
            assert_eq!(details["run_id"], run.run_id.to_string());
        }
        other => panic!("unexpected event {:?}", other),
    }

    assert_eq!(h.machine.get_run(run.run_id).await?.state, RunState::Completed);
    assert_eq!(h.queue.depth().await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_stale_start_is_acked_silently() -> Result<(), Box<dyn Error>> {
    let h = common::setup(3).await?;
    h.machine.register_job("orders", json!({})).await?;
    let run = h.producer.start_run("orders", json!({}), None).await?.run;
    h.producer
        .complete_run(run.run_id, RunState::Failed, RunChange::new().with_error("boom"))
        .await?;
    drain(&h).await?;
    assert_eq!(h.machine.get_run(run.run_id).await?.state, RunState::Failed);

    h.queue
        .enqueue(&Event::lineage(run.run_id, "orders", LineagePhase::Running, RunChange::new()))
        .await?;
    let mut errors = h.hub.register([EventKind::Error]);
    assert_eq!(drain(&h).await?, vec![ProcessOutcome::Rejected]);
    assert!(received(&mut errors).is_empty());
    assert_eq!(h.queue.depth().await?, 0);

    Ok(())
}

#[tokio::test]
async fn test_unknown_run_publishes_error() -> Result<(), Box<dyn Error>> {
    let h = common::setup(3).await?;
    let mut errors = h.hub.register([EventKind::Error]);

    h.queue
        .enqueue(&Event::lineage(RunId::new(), "ghost", LineagePhase::Complete, RunChange::new()))
        .await?;
    assert_eq!(drain(&h).await?, vec![ProcessOutcome::Rejected]);

    let events = received(&mut errors);
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0].body, EventBody::Error { error_type, .. } if error_type == "not_found"));
    assert_eq!(h.queue.dead_letter_depth().await?, 0);

    Ok(())
}

#[tokio::test]
async fn test_malformed_payload_is_dead_lettered() -> Result<(), Box<dyn Error>> {
    let h = common::setup(3).await?;
    let mut errors = h.hub.register([EventKind::Error]);

    h.queue.enqueue_raw("{not json").await?;
    assert_eq!(drain(&h).await?, vec![ProcessOutcome::DeadLettered]);
    assert_eq!(h.queue.dead_letter_depth().await?, 1);
    assert_eq!(h.queue.depth().await?, 0);

    let events = received(&mut errors);
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0].body, EventBody::Error { error_type, .. } if error_type == "permanent"));

    Ok(())
}

#[tokio::test]
async fn test_non_lineage_events_are_forwarded() -> Result<(), Box<dyn Error>> {
    let h = common::setup(3).await?;
    let mut observer = h.hub.register([EventKind::SystemMetric]);

    h.queue
        .enqueue(&Event::new(EventBody::SystemMetric {
            metric_type: "cpu".into(),
            value: 0.5,
            metadata: json!({}),
        }))
        .await?;
    assert_eq!(drain(&h).await?, vec![ProcessOutcome::Forwarded]);
    assert_eq!(kinds(&received(&mut observer)), vec![EventKind::SystemMetric]);

    Ok(())
}

#[tokio::test]
async fn test_producer_rejects_invalid_requests() -> Result<(), Box<dyn Error>> {
    let h = common::setup(3).await?;
    h.machine.register_job("orders", json!({})).await?;

    let missing_job = h.producer.start_run("nope", json!({}), None).await;
    assert!(matches!(missing_job, Err(CoreError::NotFound(_))));

    let missing_run = h
        .producer
        .complete_run(RunId::new(), RunState::Completed, RunChange::new())
        .await;
    assert!(matches!(missing_run, Err(CoreError::NotFound(_))));

    let run = h
        .producer
        .start_run("orders", json!({}), Some("nightly-2024-01-01".into()))
        .await?
        .run;
    let duplicate = h
        .producer
        .start_run("orders", json!({}), Some("nightly-2024-01-01".into()))
        .await;
    assert!(matches!(duplicate, Err(CoreError::Conflict(_))));

    let not_terminal = h
        .producer
        .complete_run(run.run_id, RunState::Running, RunChange::new())
        .await;
    assert!(matches!(not_terminal, Err(CoreError::InvalidTransition(_))));

    let no_message = h
        .producer
        .complete_run(run.run_id, RunState::Failed, RunChange::new())
        .await;
    assert!(matches!(no_message, Err(CoreError::InvalidTransition(_))));

    // Only the START was queued.
    assert_eq!(h.queue.depth().await?, 1);
    Ok(())
}

#[tokio::test]
async fn test_failed_run_keeps_error_message() -> Result<(), Box<dyn Error>> {
    let h = common::setup(3).await?;
    h.machine.register_job("orders", json!({})).await?;
    let run = h.producer.start_run("orders", json!({}), None).await?.run;
    h.producer.report_running(run.run_id, RunChange::new()).await?;
    h.producer
        .complete_run(run.run_id, RunState::Failed, RunChange::new().with_error("disk full"))
        .await?;

    let outcomes = drain(&h).await?;
    assert_eq!(
        outcomes,
        vec![
            ProcessOutcome::Applied(RunState::Running),
            ProcessOutcome::Unchanged,
            ProcessOutcome::Applied(RunState::Failed),
        ]
    );

    let run = h.machine.get_run(run.run_id).await?;
    assert_eq!(run.error_message.as_deref(), Some("disk full"));
    assert_eq!(h.machine.list_runs_for_job("orders").await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_transient_failure_backs_off_then_dead_letters() -> Result<(), Box<dyn Error>> {
    let h = common::setup(3).await?;
    h.machine.register_job("orders", json!({})).await?;
    let run = h.producer.start_run("orders", json!({}), None).await?.run;
    drain(&h).await?;
    h.producer.complete_run(run.run_id, RunState::Completed, RunChange::new()).await?;

    // Every write of a run now fails at the storage layer.
    h.db
        .query("DEFINE FIELD OVERWRITE state ON run ASSERT false")
        .await?
        .check()?;
    let mut errors = h.hub.register([EventKind::Error]);

    assert_eq!(drain(&h).await?, vec![ProcessOutcome::Retried(Duration::from_millis(10))]);
    assert_eq!(h.queue.in_flight().await?, 0);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(drain(&h).await?, vec![ProcessOutcome::Retried(Duration::from_millis(20))]);
    assert!(received(&mut errors).is_empty());

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(drain(&h).await?, vec![ProcessOutcome::DeadLettered]);
    assert_eq!(h.queue.dead_letter_depth().await?, 1);
    assert_eq!(h.queue.depth().await?, 0);

    let events = received(&mut errors);
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0].body, EventBody::Error { error_type, .. } if error_type == "transient"));
    assert_eq!(h.machine.get_run(run.run_id).await?.state, RunState::Running);

    Ok(())
}

#[tokio::test]
async fn test_start_run_is_undone_when_enqueue_fails() -> Result<(), Box<dyn Error>> {
    let h = common::setup(3).await?;
    h.machine.register_job("orders", json!({})).await?;

    h.db
        .query("DEFINE FIELD OVERWRITE payload ON queue_message ASSERT false")
        .await?
        .check()?;
    let failed = h.producer.start_run("orders", json!({}), Some("nightly".into())).await;
    assert!(failed.is_err_and(|e| e.is_retryable()));
    assert!(h.machine.list_runs_for_job("orders").await?.is_empty());
    assert_eq!(h.queue.depth().await?, 0);

    // The idempotency key is free again.
    h.db
        .query("REMOVE FIELD payload ON queue_message")
        .await?
        .check()?;
    let started = h.producer.start_run("orders", json!({}), Some("nightly".into())).await?;
    assert_eq!(started.run.state, RunState::Pending);
    assert_eq!(h.machine.list_runs_for_job("orders").await?.len(), 1);
    assert_eq!(h.queue.depth().await?, 1);

    Ok(())
}
