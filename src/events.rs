//! Change signals for projection consistency operations
//!
//! The engine does not deliver notifications or run background jobs. It
//! emits signals on a broadcast bus and collaborators act on them:
//! - Cache invalidation (per-partition markers)
//! - Notification fan-out
//! - Repair scheduling after a stale best-effort sync

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::model::CounterField;

/// Signals emitted by the synchronizer, counter updater, and coordinator
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChangeSignal {
    // Projection events
    PointerSynced {
        partition: String,
        entity_id: String,
        version: u64,
        reason: String,
    },
    /// A best-effort sync gave up; the projection may lag its canonical record
    PointerStale {
        partition: String,
        entity_id: String,
        attempts: usize,
        reason: String,
    },
    PointerResynced {
        partition: String,
        entity_id: String,
    },
    CounterAdjusted {
        partition: String,
        entity_id: String,
        field: CounterField,
        delta: i64,
    },

    // Structural events
    SeriesCreated {
        series_id: String,
        hangout_ids: Vec<String>,
    },
    SeriesUpdated {
        series_id: String,
    },
    SeriesDeleted {
        series_id: String,
    },
    HangoutDeleted {
        hangout_id: String,
    },

    // Reservation events
    ReservationCompleted {
        hangout_id: String,
        offer_id: String,
        converted: usize,
    },

    /// Anything cached for this partition is out of date
    PartitionChanged {
        partition: String,
    },
}

impl ChangeSignal {
    /// Partition this signal invalidates, if any
    pub fn partition(&self) -> Option<&str> {
        match self {
            ChangeSignal::PointerSynced { partition, .. }
            | ChangeSignal::PointerStale { partition, .. }
            | ChangeSignal::PointerResynced { partition, .. }
            | ChangeSignal::CounterAdjusted { partition, .. }
            | ChangeSignal::PartitionChanged { partition } => Some(partition),
            _ => None,
        }
    }
}

/// Trait for signal listeners
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &ChangeSignal);
}

/// Broadcast bus for change signals
pub struct EventBus {
    sender: broadcast::Sender<ChangeSignal>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Emit a signal to all subscribers
    pub fn emit(&self, event: ChangeSignal) {
        trace!(event = ?event, "Emitting change signal");
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    /// Emit `PartitionChanged` for each partition, once per distinct key
    pub fn emit_partitions<'a>(&self, partitions: impl IntoIterator<Item = &'a str>) {
        let mut seen: Vec<&str> = Vec::new();
        for partition in partitions {
            if !seen.contains(&partition) {
                seen.push(partition);
                self.emit(ChangeSignal::PartitionChanged {
                    partition: partition.to_string(),
                });
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeSignal> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Logs every signal
pub struct LoggingListener;

impl EventListener for LoggingListener {
    fn on_event(&self, event: &ChangeSignal) {
        match event {
            ChangeSignal::PointerStale {
                partition,
                entity_id,
                attempts,
                reason,
            } => {
                warn!(partition = %partition, entity = %entity_id, attempts, reason = %reason, "Projection left stale");
            }
            ChangeSignal::SeriesCreated { series_id, hangout_ids } => {
                debug!(series = %series_id, members = hangout_ids.len(), "Series created");
            }
            ChangeSignal::SeriesDeleted { series_id } => {
                debug!(series = %series_id, "Series deleted");
            }
            ChangeSignal::ReservationCompleted {
                hangout_id,
                offer_id,
                converted,
            } => {
                debug!(hangout = %hangout_id, offer = %offer_id, converted, "Reservation completed");
            }
            _ => {
                trace!(event = ?event, "Change signal");
            }
        }
    }
}

/// Latest change marker per partition, for read-side cache invalidation
#[derive(Default)]
pub struct InvalidationMarkers {
    markers: DashMap<String, u64>,
}

impl InvalidationMarkers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of changes observed for `partition` (0 if never changed)
    pub fn marker(&self, partition: &str) -> u64 {
        self.markers.get(partition).map(|m| *m).unwrap_or(0)
    }

    pub fn partitions(&self) -> Vec<String> {
        self.markers.iter().map(|e| e.key().clone()).collect()
    }
}

impl EventListener for InvalidationMarkers {
    fn on_event(&self, event: &ChangeSignal) {
        if let ChangeSignal::PartitionChanged { partition } = event {
            *self.markers.entry(partition.clone()).or_insert(0) += 1;
        }
    }
}

/// Drive `listener` from a bus subscription until the bus closes
pub fn spawn_listener<L>(event_bus: &EventBus, listener: Arc<L>) -> tokio::task::JoinHandle<()>
where
    L: EventListener + 'static,
{
    let mut receiver = event_bus.subscribe();

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => listener.on_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Change listener lagged, skipped signals");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping listener");
                    break;
                }
            }
        }
    })
}

/// Spawn a background task that logs all signals
pub fn spawn_logging_listener(event_bus: &EventBus) -> tokio::task::JoinHandle<()> {
    spawn_listener(event_bus, Arc::new(LoggingListener))
}
