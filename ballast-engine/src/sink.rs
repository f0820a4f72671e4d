//! Broadcast of computed results to downstream consumers.
//!
//! Publishing is fire-and-forget. Delivery and retries are the sink's
//! concern; the engine never waits on a consumer.

use crate::types::AllocationOutcome;
use ballast_core::types::StrategyId;
use ballast_risk::{BreakerStatus, RiskAlert, RiskSnapshot};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{instrument, trace};

/// An update pushed to consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// `compute_weights` finished.
    Allocation(AllocationOutcome),
    /// A risk snapshot was computed.
    Risk(RiskSnapshot),
    /// A rule fired.
    Alert(RiskAlert),
    /// A breaker changed state.
    Breaker {
        /// Strategy key.
        strategy: StrategyId,
        /// New status.
        status: BreakerStatus,
    },
}

impl EngineEvent {
    /// Stable event name.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Allocation(_) => "allocation",
            Self::Risk(_) => "risk",
            Self::Alert(_) => "alert",
            Self::Breaker { .. } => "breaker",
        }
    }
}

/// Receives engine events.
pub trait BroadcastSink: Send + Sync {
    /// Pushes an event without waiting for delivery.
    fn publish(&self, event: EngineEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl BroadcastSink for NullSink {
    fn publish(&self, _event: EngineEvent) {}
}

/// Fans events out over a `tokio::sync::broadcast` channel.
///
/// Events published with no subscriber, and events a lagging subscriber
/// misses, are dropped.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: broadcast::Sender<EngineEvent>,
}

impl ChannelSink {
    /// Creates a sink buffering up to `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribes to subsequent events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscribers(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl BroadcastSink for ChannelSink {
    #[instrument(skip(self, event), fields(kind = event.kind()))]
    fn publish(&self, event: EngineEvent) {
        if self.sender.send(event).is_err() {
            trace!("no subscribers, event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker_event() -> EngineEvent {
        EngineEvent::Breaker {
            strategy: "carry".into(),
            status: BreakerStatus::Ok,
        }
    }

    #[tokio::test]
    async fn test_channel_delivers_to_subscriber() {
        let sink = ChannelSink::new(8);
        let mut rx = sink.subscribe();
        sink.publish(breaker_event());
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), "breaker");
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let sink = ChannelSink::new(8);
        assert_eq!(sink.subscribers(), 0);
        sink.publish(breaker_event());
        NullSink.publish(breaker_event());
    }

    #[test]
    fn test_event_serializes_tagged() {
        let json = serde_json::to_value(breaker_event()).unwrap();
        assert_eq!(json["event"], "breaker");
        assert_eq!(json["status"]["status"], "ok");
    }
}
