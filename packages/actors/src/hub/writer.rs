//! The per-observer writer loop.
//!
//! [`drive`] drains one observer's queue into a transport, emitting a
//! heartbeat whenever the queue stays quiet for `heartbeat_interval`.
//! Write outcomes are reported back to the hub, which decides eviction.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use lineage_core::{Event, SseFrame};

use super::{ClientStream, CloseReason, EventHub};

/// Transport errors seen by the writer.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The peer went away; no retry makes sense.
    #[error("connection closed by peer")]
    Closed,

    #[error("write timed out")]
    Timeout,

    #[error("write failed: {0}")]
    Io(String),
}

/// Future returned by [`FrameSink::send`].
pub type SinkFuture<'a> = Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>>;

/// Destination for one observer's frames.
pub trait FrameSink: Send {
    fn send(&mut self, frame: SseFrame) -> SinkFuture<'_>;
}

/// Pump events from `stream` into `sink` until the observer is closed.
pub async fn drive<S: FrameSink>(
    hub: Arc<EventHub>,
    mut stream: ClientStream,
    mut sink: S,
) -> CloseReason {
    let client_id = stream.client_id;
    let heartbeat_interval = hub.config().heartbeat_interval;
    let write_timeout = hub.config().write_timeout;

    loop {
        let event = tokio::select! {
            biased;

            reason = &mut stream.closed => {
                return reason.unwrap_or(CloseReason::Disconnected);
            }

            next = tokio::time::timeout(heartbeat_interval, stream.events.recv()) => match next {
                Ok(Some(event)) => event,
                Ok(None) => return stream.closed.try_recv().unwrap_or(CloseReason::Disconnected),
                Err(_) => hub.stamp(Event::heartbeat()),
            },
        };

        let frame = match SseFrame::from_event(&event) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(client = %client_id, "Failed to encode {}: {}", event.kind(), e);
                continue;
            }
        };

        let result = match tokio::time::timeout(write_timeout, sink.send(frame)).await {
            Ok(result) => result,
            Err(_) => Err(SinkError::Timeout),
        };

        match result {
            Ok(()) => hub.record_write(client_id),
            Err(SinkError::Closed) => {
                let _ = hub.disconnect(client_id);
                return CloseReason::Disconnected;
            }
            Err(e) => {
                tracing::warn!(client = %client_id, "Write to observer failed: {}", e);
                if let Some(reason) = hub.report_write_error(client_id) {
                    return CloseReason::Zombie(reason);
                }
            }
        }
    }
}
