//! Event Publisher Adapters
//!
//! Implements the `EventPublisher` port: structured log lines, an in-memory
//! collector for tests and the simulator, and a fan-out composite.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::domain::events::PlacementEvent;
use crate::domain::ports::EventPublisher;
use crate::error::Result;

/// Publishes placement events to the tracing subscriber.
///
/// Anomalies are logged at warn level, everything else at debug level.
#[derive(Debug, Clone, Default)]
pub struct LoggingEventPublisher;

impl LoggingEventPublisher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EventPublisher for LoggingEventPublisher {
    async fn publish(&self, event: PlacementEvent) -> Result<()> {
        let event_type = event.event_type();
        let json = serde_json::to_string(&event).unwrap_or_else(|_| format!("{:?}", event));

        if event.is_anomaly() {
            warn!(event_type, event = %json, "Placement anomaly");
        } else {
            debug!(event_type, event = %json, "Placement event");
        }
        Ok(())
    }
}

/// Collects events in memory for later inspection.
#[derive(Debug, Default)]
pub struct InMemoryEventCollector {
    events: parking_lot::RwLock<Vec<PlacementEvent>>,
}

impl InMemoryEventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PlacementEvent> {
        self.events.read().clone()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Events whose serialized `type` tag is `event_type`.
    pub fn events_of_type(&self, event_type: &str) -> Vec<PlacementEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }

    pub fn count_of_type(&self, event_type: &str) -> usize {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .count()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventCollector {
    async fn publish(&self, event: PlacementEvent) -> Result<()> {
        self.events.write().push(event);
        Ok(())
    }

    async fn publish_all(&self, events: Vec<PlacementEvent>) -> Result<()> {
        self.events.write().extend(events);
        Ok(())
    }
}

/// Publishes every event to each of its backends in turn. A failing backend
/// does not keep the event from the others.
#[derive(Default)]
pub struct CompositeEventPublisher {
    publishers: Vec<std::sync::Arc<dyn EventPublisher>>,
}

impl CompositeEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_publisher(mut self, publisher: std::sync::Arc<dyn EventPublisher>) -> Self {
        self.publishers.push(publisher);
        self
    }
}

impl std::fmt::Debug for CompositeEventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeEventPublisher")
            .field("publisher_count", &self.publishers.len())
            .finish()
    }
}

#[async_trait]
impl EventPublisher for CompositeEventPublisher {
    async fn publish(&self, event: PlacementEvent) -> Result<()> {
        let mut first_err = None;
        for publisher in &self.publishers {
            if let Err(e) = publisher.publish(event.clone()).await {
                warn!(error = %e, event_type = event.event_type(), "Event backend failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    async fn publish_all(&self, events: Vec<PlacementEvent>) -> Result<()> {
        let mut first_err = None;
        for publisher in &self.publishers {
            if let Err(e) = publisher.publish_all(events.clone()).await {
                warn!(error = %e, events = events.len(), "Event backend failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
