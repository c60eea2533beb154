#![allow(clippy::disallowed_methods)]

mod common;

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use actors::hub::drive;
use actors::{CloseReason, EventHub, HubConfig, ZombieReason};
use lineage_core::{Event, EventBody, EventKind, LineagePhase, RunChange, RunId};
use tokio::sync::mpsc;

use common::{BrokenSink, ChannelSink};

fn job_status(job: &str) -> Event {
    Event::new(EventBody::JobStatus {
        job_name: job.to_string(),
        run_id: None,
        status: "RUNNING".to_string(),
        progress: None,
    })
}

fn lineage() -> Event {
    Event::lineage(RunId::new(), "orders", LineagePhase::Start, RunChange::new())
}

#[tokio::test]
async fn test_subscription_filtering() -> Result<(), Box<dyn Error>> {
    let hub = EventHub::default();
    let mut jobs_only = hub.register([EventKind::JobStatus]);
    let mut everything = hub.register([]);

    let outcome = hub.publish(lineage());
    assert_eq!(outcome.delivered, 1);
    hub.publish(job_status("orders"));

    let received = jobs_only.events.recv().await.ok_or("stream closed")?;
    assert_eq!(received.kind(), EventKind::JobStatus);
    assert!(jobs_only.events.try_recv().is_err());

    assert_eq!(everything.events.recv().await.ok_or("stream closed")?.kind(), EventKind::LineageEvent);
    assert_eq!(everything.events.recv().await.ok_or("stream closed")?.kind(), EventKind::JobStatus);

    Ok(())
}

#[tokio::test]
async fn test_full_queue_drops_then_evicts() -> Result<(), Box<dyn Error>> {
    let hub = EventHub::new(HubConfig::default().with_capacity(2));
    let stream = hub.register([]);

    assert_eq!(hub.publish(job_status("a")).delivered, 1);
    assert_eq!(hub.publish(job_status("b")).delivered, 1);
    let third = hub.publish(job_status("c"));
    assert_eq!((third.delivered, third.dropped), (0, 1));

    let snapshot = hub.client(stream.client_id).ok_or("client missing")?;
    assert_eq!(snapshot.events_dropped, 1);
    assert_eq!(snapshot.consecutive_full_queue_count, 1);
    assert_eq!(snapshot.queued, 2);

    // Still below the threshold.
    assert!(hub.sweep().evicted.is_empty());

    for _ in 0..9 {
        hub.publish(job_status("d"));
    }
    let report = hub.sweep();
    assert_eq!(report.evicted.len(), 1);
    assert_eq!(report.evicted[0].reason, ZombieReason::QueueFull);
    assert_eq!(report.remaining_clients, 0);
    assert_eq!(stream.closed.await?, CloseReason::Zombie(ZombieReason::QueueFull));

    Ok(())
}

#[tokio::test]
async fn test_write_errors_evict_after_threshold() -> Result<(), Box<dyn Error>> {
    let hub = Arc::new(EventHub::default());
    let stream = hub.register([]);
    let client_id = stream.client_id;

    for i in 0..4 {
        hub.publish(job_status(&format!("job-{}", i)));
    }

    let reason = drive(hub.clone(), stream, BrokenSink).await;
    assert_eq!(reason, CloseReason::Zombie(ZombieReason::WriteErrors));
    assert!(hub.client(client_id).is_none());

    let zombies = hub.zombie_stats();
    assert_eq!(zombies.total_zombies_detected, 1);
    assert_eq!(zombies.zombie_reasons.get("write_errors"), Some(&1));
    // The writer returned, so nothing is left attached.
    assert_eq!(zombies.current_zombie_count, 0);
    assert_eq!(zombies.recent[0].consecutive_write_errors, 4);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_pong_timeout() -> Result<(), Box<dyn Error>> {
    let hub = EventHub::default();
    let stream = hub.register([]);

    assert_eq!(hub.ping_all(), 1);
    tokio::time::advance(Duration::from_secs(60)).await;
    assert!(hub.sweep().evicted.is_empty());

    tokio::time::advance(Duration::from_secs(31)).await;
    let report = hub.sweep();
    assert_eq!(report.evicted.len(), 1);
    assert_eq!(report.evicted[0].reason, ZombieReason::PongTimeout);

    // Evicted while the connection still holds its stream.
    assert_eq!(hub.zombie_stats().current_zombie_count, 1);
    drop(stream);
    assert_eq!(hub.zombie_stats().current_zombie_count, 0);
    assert_eq!(hub.stats().total_zombies_detected, 1);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_pong_keeps_client_alive() -> Result<(), Box<dyn Error>> {
    let hub = EventHub::default();
    let mut stream = hub.register([]);

    hub.ping_all();
    let ping = stream.events.recv().await.ok_or("stream closed")?;
    assert_eq!(ping.kind(), EventKind::Ping);

    tokio::time::advance(Duration::from_secs(30)).await;
    hub.pong(stream.client_id)?;
    tokio::time::advance(Duration::from_secs(80)).await;

    assert!(hub.sweep().evicted.is_empty());
    let snapshot = hub.client(stream.client_id).ok_or("client missing")?;
    assert!(snapshot.pong_received);
    assert_eq!(snapshot.missed_pings, 0);
    assert_eq!(snapshot.ping_count, 1);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_missed_pings() -> Result<(), Box<dyn Error>> {
    let mut config = HubConfig::default();
    config.pong_timeout = Duration::from_secs(3600);
    let hub = EventHub::new(config);
    let _stream = hub.register([]);

    for _ in 0..3 {
        hub.ping_all();
    }
    assert!(hub.sweep().evicted.is_empty());

    hub.ping_all();
    let report = hub.sweep();
    assert_eq!(report.evicted[0].reason, ZombieReason::MissedPings);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_inactivity() -> Result<(), Box<dyn Error>> {
    let hub = EventHub::default();
    let stream = hub.register([]);

    tokio::time::advance(Duration::from_secs(121)).await;
    let report = hub.force_cleanup();
    assert_eq!(report.evicted.len(), 1);
    assert_eq!(report.evicted[0].reason, ZombieReason::Inactive);
    assert_eq!(stream.closed.await?, CloseReason::Zombie(ZombieReason::Inactive));
    assert!(hub.zombie_stats().last_cleanup_at.is_some());

    Ok(())
}

#[tokio::test]
async fn test_unknown_client_pong() -> Result<(), Box<dyn Error>> {
    let hub = EventHub::default();
    let stream = hub.register([]);
    hub.disconnect(stream.client_id)?;

    assert!(hub.pong(stream.client_id).is_err());
    assert_eq!(hub.zombie_stats().total_zombies_detected, 0);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_writer_frames_and_heartbeat() -> Result<(), Box<dyn Error>> {
    let hub = Arc::new(EventHub::default());
    let stream = hub.register([EventKind::JobStatus]);
    let client_id = stream.client_id;
    let (tx, mut frames) = mpsc::channel(8);

    let writer = tokio::spawn(drive(hub.clone(), stream, ChannelSink(tx)));

    let published = hub.publish(job_status("orders"));
    let frame = frames.recv().await.ok_or("writer stopped")?;
    assert_eq!(frame.event, "job_status");
    assert_eq!(frame.id, Some(published.sequence_id.to_string()));
    assert!(frame.data.contains("\"job_name\":\"orders\""));

    // Nothing else queued: the writer falls back to a heartbeat.
    let frame = frames.recv().await.ok_or("writer stopped")?;
    assert_eq!(frame.event, "heartbeat");
    assert!(frame.to_event()?.sequence_id > published.sequence_id);

    let snapshot = hub.client(client_id).ok_or("client missing")?;
    assert_eq!(snapshot.events_written, 2);

    hub.disconnect(client_id)?;
    assert_eq!(writer.await?, CloseReason::Disconnected);

    Ok(())
}

#[tokio::test]
async fn test_shutdown_closes_everyone() -> Result<(), Box<dyn Error>> {
    let hub = EventHub::default();
    let a = hub.register([]);
    let b = hub.register([EventKind::Error]);

    hub.shutdown();
    assert_eq!(hub.client_count(), 0);
    assert_eq!(a.closed.await?, CloseReason::Shutdown);
    assert_eq!(b.closed.await?, CloseReason::Shutdown);

    Ok(())
}
