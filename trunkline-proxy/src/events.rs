//! Fire-and-forget routing events.

use metrics::counter;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

use trunkline_core::circuit_breaker::StateListener;
use trunkline_core::CircuitState;

/// A health or breaker state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingEvent {
    /// An element answered probes again.
    ElementUp {
        /// Owning server group.
        group: String,
        /// Element key.
        element: String,
    },
    /// An element stopped answering probes.
    ElementDown {
        /// Owning server group.
        group: String,
        /// Element key.
        element: String,
    },
    /// A server group has at least one live element again.
    ServerGroupUp {
        /// Group name.
        group: String,
    },
    /// Every probed element of a server group failed.
    ServerGroupDown {
        /// Group name.
        group: String,
    },
    /// A circuit breaker changed state.
    CircuitBreakerStateChanged {
        /// Endpoint key.
        endpoint: String,
        /// Previous state.
        from: CircuitState,
        /// New state.
        to: CircuitState,
    },
}

impl RoutingEvent {
    /// Short event name used as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            RoutingEvent::ElementUp { .. } => "element_up",
            RoutingEvent::ElementDown { .. } => "element_down",
            RoutingEvent::ServerGroupUp { .. } => "server_group_up",
            RoutingEvent::ServerGroupDown { .. } => "server_group_down",
            RoutingEvent::CircuitBreakerStateChanged { .. } => "circuit_breaker_state_changed",
        }
    }
}

impl fmt::Display for RoutingEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingEvent::ElementUp { group, element } => write!(f, "element {element} in {group} is up"),
            RoutingEvent::ElementDown { group, element } => {
                write!(f, "element {element} in {group} is down")
            }
            RoutingEvent::ServerGroupUp { group } => write!(f, "server group {group} is up"),
            RoutingEvent::ServerGroupDown { group } => write!(f, "server group {group} is down"),
            RoutingEvent::CircuitBreakerStateChanged { endpoint, from, to } => {
                write!(f, "circuit for {endpoint} moved {from} -> {to}")
            }
        }
    }
}

/// Broadcast sink for [`RoutingEvent`]s.
///
/// Publishing never blocks and never fails: with no subscribers the event is
/// only counted, and slow subscribers lag instead of applying back-pressure.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RoutingEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RoutingEvent> {
        self.tx.subscribe()
    }

    /// Publish an event.
    pub fn publish(&self, event: RoutingEvent) {
        info!(event = event.kind(), "{event}");
        counter!("trunkline_routing_events_total", "event" => event.kind()).increment(1);
        let _ = self.tx.send(event);
    }

    /// Circuit breaker listener forwarding state changes to this bus.
    pub fn breaker_listener(&self) -> StateListener {
        let bus = self.clone();
        Arc::new(move |endpoint: &str, from: CircuitState, to: CircuitState| {
            bus.publish(RoutingEvent::CircuitBreakerStateChanged {
                endpoint: endpoint.to_string(),
                from,
                to,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publishing_without_subscribers_is_harmless() {
        let bus = EventBus::new(4);
        bus.publish(RoutingEvent::ServerGroupDown { group: "SG1".into() });
    }

    #[tokio::test]
    async fn breaker_listener_publishes_state_changes() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        let listener = bus.breaker_listener();

        listener("1.1.1.1|5060|udp", CircuitState::Closed, CircuitState::Open);

        assert_eq!(
            rx.recv().await.unwrap(),
            RoutingEvent::CircuitBreakerStateChanged {
                endpoint: "1.1.1.1|5060|udp".into(),
                from: CircuitState::Closed,
                to: CircuitState::Open,
            }
        );
    }
}
