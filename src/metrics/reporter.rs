//! Map Reporter
//!
//! Counts mapping events (allocation passes, room checks, chunk moves) with
//! the bytes and time they involved. Owns its registry so several placement
//! contexts can live in one process.

use std::time::Duration;

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use tracing::trace;

use crate::error::{Error, Result};

const NAMESPACE: &str = "chunkmap";

#[derive(Clone)]
pub struct MapReporter {
    registry: Registry,
    events: IntCounterVec,
    sizes: IntCounterVec,
    durations: HistogramVec,
}

impl std::fmt::Debug for MapReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapReporter").finish_non_exhaustive()
    }
}

impl MapReporter {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let events = IntCounterVec::new(
            Opts::new("map_events_total", "Mapping events by name").namespace(NAMESPACE),
            &["event"],
        )?;
        let sizes = IntCounterVec::new(
            Opts::new("map_event_bytes_total", "Bytes involved in mapping events")
                .namespace(NAMESPACE),
            &["event"],
        )?;
        let durations = HistogramVec::new(
            HistogramOpts::new("map_event_duration_seconds", "Duration of mapping events")
                .namespace(NAMESPACE)
                .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
            &["event"],
        )?;

        registry.register(Box::new(events.clone()))?;
        registry.register(Box::new(sizes.clone()))?;
        registry.register(Box::new(durations.clone()))?;

        Ok(Self {
            registry,
            events,
            sizes,
            durations,
        })
    }

    /// Record one occurrence of `event`.
    pub fn add_event(&self, event: &str, size: u64, duration: Duration) {
        trace!(event, size, ?duration, "map event");
        self.events.with_label_values(&[event]).inc();
        self.sizes.with_label_values(&[event]).inc_by(size);
        self.durations
            .with_label_values(&[event])
            .observe(duration.as_secs_f64());
    }

    pub fn event_count(&self, event: &str) -> u64 {
        self.events.with_label_values(&[event]).get()
    }

    pub fn event_bytes(&self, event: &str) -> u64 {
        self.sizes.with_label_values(&[event]).get()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition of every metric in the registry.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("metrics not utf8: {}", e)))
    }
}
