//! Post-commit pipeline events
//!
//! Side effects that must not block the write path (cache invalidation after a
//! verdict, a release or a challenger provisioning) are published to a bounded
//! in-process queue and drained by an [`EventWorker`]. Publishing never waits;
//! a full or closed queue is logged and counted so failures stay visible.

use crate::services::cache::MetricsCache;
use crate::types::{EndpointId, RecordId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Event type discriminant
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// A record received a verdict
    RecordEvaluated {
        endpoint_id: EndpointId,
        record_id: RecordId,
        correct: bool,
        timestamp: DateTime<Utc>,
    },
    /// A prompt version was released
    PromptReleased {
        endpoint_id: EndpointId,
        version: u32,
        timestamp: DateTime<Utc>,
    },
    /// The optimizer created or updated a challenger
    ChallengerProvisioned {
        base_id: EndpointId,
        challenger_id: EndpointId,
        timestamp: DateTime<Utc>,
    },
}

impl PipelineEvent {
    pub fn record_evaluated(endpoint_id: EndpointId, record_id: RecordId, correct: bool) -> Self {
        PipelineEvent::RecordEvaluated {
            endpoint_id,
            record_id,
            correct,
            timestamp: Utc::now(),
        }
    }

    pub fn prompt_released(endpoint_id: EndpointId, version: u32) -> Self {
        PipelineEvent::PromptReleased {
            endpoint_id,
            version,
            timestamp: Utc::now(),
        }
    }

    pub fn challenger_provisioned(base_id: EndpointId, challenger_id: EndpointId) -> Self {
        PipelineEvent::ChallengerProvisioned {
            base_id,
            challenger_id,
            timestamp: Utc::now(),
        }
    }

    /// Endpoints whose cached aggregates this event makes stale
    pub fn affected_endpoints(&self) -> Vec<EndpointId> {
        match self {
            PipelineEvent::RecordEvaluated { endpoint_id, .. } => vec![*endpoint_id],
            PipelineEvent::PromptReleased { endpoint_id, .. } => vec![*endpoint_id],
            PipelineEvent::ChallengerProvisioned {
                base_id,
                challenger_id,
                ..
            } => vec![*base_id, *challenger_id],
        }
    }
}

/// Publishing half of the event queue
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: mpsc::Sender<PipelineEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventBus {
    /// Create a bus and the worker that drains it
    pub fn channel(capacity: usize, cache: Arc<dyn MetricsCache>) -> (Self, EventWorker) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let bus = Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        let worker = EventWorker {
            rx,
            cache,
            failures: 0,
            handled: 0,
        };
        (bus, worker)
    }

    /// Enqueue an event without waiting
    pub fn publish(&self, event: PipelineEvent) {
        if let Err(e) = self.tx.try_send(event) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("Dropped pipeline event: {}", e);
        }
    }

    /// Events that could not be enqueued
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Summary of a drained worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub handled: u64,
    pub failures: u64,
}

/// Consuming half of the event queue
pub struct EventWorker {
    rx: mpsc::Receiver<PipelineEvent>,
    cache: Arc<dyn MetricsCache>,
    failures: u64,
    handled: u64,
}

impl EventWorker {
    /// Handle events until every bus handle is dropped
    pub async fn run(mut self) -> WorkerReport {
        while let Some(event) = self.rx.recv().await {
            self.handle(event).await;
        }
        WorkerReport {
            handled: self.handled,
            failures: self.failures,
        }
    }

    /// Handle events until `shutdown` resolves, then drain what is still queued
    pub async fn run_until<F>(mut self, shutdown: F) -> WorkerReport
    where
        F: std::future::Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                event = self.rx.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
            }
        }
        self.drain().await
    }

    /// Handle whatever is queued right now, then return
    pub async fn drain(&mut self) -> WorkerReport {
        while let Ok(event) = self.rx.try_recv() {
            self.handle(event).await;
        }
        WorkerReport {
            handled: self.handled,
            failures: self.failures,
        }
    }

    async fn handle(&mut self, event: PipelineEvent) {
        debug!("Handling pipeline event: {:?}", event);
        self.handled += 1;
        for endpoint_id in event.affected_endpoints() {
            if let Err(e) = self.cache.invalidate(endpoint_id).await {
                self.failures += 1;
                warn!("Cache invalidation failed for endpoint {}: {}", endpoint_id, e);
            }
        }
    }
}
