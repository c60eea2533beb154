#![allow(clippy::disallowed_methods)]

use std::error::Error;
use std::time::Duration;

use actors::{Coordinator, CoordinatorConfig, WorkerConfig};
use lineage_core::{EventBody, EventKind, RunChange, RunId, RunState};
use serde_json::json;

fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig {
        worker: WorkerConfig {
            concurrency: 2,
            batch_size: 5,
            poll_interval: Duration::from_millis(20),
            metrics_interval: Duration::from_millis(50),
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn wait_for_state(
    coordinator: &Coordinator,
    run_id: RunId,
    state: RunState,
) -> Result<(), Box<dyn Error>> {
    for _ in 0..250 {
        if coordinator.machine.get_run(run_id).await?.state == state {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Err(format!("run {} never reached {}", run_id, state).into())
}

#[tokio::test]
async fn test_worker_drives_runs_to_completion() -> Result<(), Box<dyn Error>> {
    let coordinator = Coordinator::start(fast_config()).await?;
    coordinator.machine.register_job("orders", json!({})).await?;

    let mut run_ids = Vec::new();
    for i in 0..4 {
        let queued = coordinator
            .producer
            .start_run("orders", json!({"batch": i}), None)
            .await?;
        run_ids.push(queued.run.run_id);
    }
    for run_id in &run_ids {
        wait_for_state(&coordinator, *run_id, RunState::Running).await?;
        coordinator
            .producer
            .complete_run(*run_id, RunState::Completed, RunChange::new())
            .await?;
    }
    for run_id in &run_ids {
        wait_for_state(&coordinator, *run_id, RunState::Completed).await?;
    }

    let stats = coordinator.worker_stats().await?;
    assert_eq!(stats.pollers, 2);
    assert_eq!(stats.applied, 8);
    assert_eq!(stats.failed, 0);

    coordinator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_worker_publishes_queue_status() -> Result<(), Box<dyn Error>> {
    let coordinator = Coordinator::start(fast_config()).await?;
    let mut observer = coordinator.hub.register([EventKind::QueueStatus]);

    let event = tokio::time::timeout(Duration::from_secs(5), observer.events.recv())
        .await?
        .ok_or("stream closed")?;
    match event.body {
        EventBody::QueueStatus { queue_name, depth, .. } => {
            assert_eq!(queue_name, "lineage_events");
            assert_eq!(depth, 0);
        }
        other => return Err(format!("unexpected event {:?}", other).into()),
    }

    coordinator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_shutdown_disconnects_observers() -> Result<(), Box<dyn Error>> {
    let coordinator = Coordinator::start(fast_config()).await?;
    let hub = coordinator.hub.clone();
    let observer = hub.register([]);

    coordinator.shutdown().await;
    assert_eq!(hub.client_count(), 0);
    assert_eq!(observer.closed.await?, actors::CloseReason::Shutdown);
    Ok(())
}
