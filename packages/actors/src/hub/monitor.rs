//! Actor that drives hub liveness on timers.

use std::sync::Arc;
use std::time::Duration;

use ractor::{Actor, ActorProcessingErr, ActorRef};

use super::EventHub;
use crate::messages::MonitorMessage;

/// Periodically pings observers and sweeps zombies.
pub struct HubMonitor;

fn every(myself: ActorRef<MonitorMessage>, period: Duration, message: fn() -> MonitorMessage) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            if myself.send_message(message()).is_err() {
                break;
            }
        }
    });
}

impl Actor for HubMonitor {
    type Msg = MonitorMessage;
    type State = Arc<EventHub>;
    type Arguments = Arc<EventHub>;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        hub: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let config = hub.config();
        tracing::info!(
            ping_secs = config.ping_interval.as_secs(),
            sweep_secs = config.zombie_check_interval.as_secs(),
            "Starting hub monitor"
        );

        every(myself.clone(), config.ping_interval, || MonitorMessage::Ping);
        every(myself, config.zombie_check_interval, || MonitorMessage::Sweep);

        Ok(hub)
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        hub: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            MonitorMessage::Ping => {
                let pinged = hub.ping_all();
                tracing::debug!(pinged, "Pinged observers");
            }

            MonitorMessage::Sweep => {
                hub.sweep();
            }

            MonitorMessage::Shutdown => {
                tracing::info!("Shutting down hub monitor");
                hub.shutdown();
                myself.stop(None);
            }
        }

        Ok(())
    }
}

/// Spawn a [`HubMonitor`] for `hub`.
pub async fn start_hub_monitor(
    hub: Arc<EventHub>,
) -> Result<(ActorRef<MonitorMessage>, tokio::task::JoinHandle<()>), ractor::SpawnErr> {
    Actor::spawn(None, HubMonitor, hub).await
}
