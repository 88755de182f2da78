//! Metrics cache boundary
//!
//! The cache only memoizes dashboard aggregates keyed by endpoint; it is never
//! the source of truth for evaluation state.

use crate::error::Result;
use crate::types::EndpointId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[async_trait]
pub trait MetricsCache: Send + Sync {
    async fn get(&self, endpoint_id: EndpointId) -> Result<Option<serde_json::Value>>;

    async fn put(&self, endpoint_id: EndpointId, value: serde_json::Value) -> Result<()>;

    /// Drop every aggregate memoized for the endpoint
    async fn invalidate(&self, endpoint_id: EndpointId) -> Result<()>;
}

/// Cache that stores nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsCache;

#[async_trait]
impl MetricsCache for NoopMetricsCache {
    async fn get(&self, _endpoint_id: EndpointId) -> Result<Option<serde_json::Value>> {
        Ok(None)
    }

    async fn put(&self, _endpoint_id: EndpointId, _value: serde_json::Value) -> Result<()> {
        Ok(())
    }

    async fn invalidate(&self, _endpoint_id: EndpointId) -> Result<()> {
        Ok(())
    }
}

/// In-process cache with a fixed TTL
pub struct InMemoryMetricsCache {
    ttl: Duration,
    entries: RwLock<HashMap<EndpointId, (serde_json::Value, Instant)>>,
}

impl InMemoryMetricsCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl MetricsCache for InMemoryMetricsCache {
    async fn get(&self, endpoint_id: EndpointId) -> Result<Option<serde_json::Value>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(&endpoint_id)
            .filter(|(_, stored_at)| stored_at.elapsed() < self.ttl)
            .map(|(value, _)| value.clone()))
    }

    async fn put(&self, endpoint_id: EndpointId, value: serde_json::Value) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(endpoint_id, (value, Instant::now()));
        Ok(())
    }

    async fn invalidate(&self, endpoint_id: EndpointId) -> Result<()> {
        self.entries.write().await.remove(&endpoint_id);
        Ok(())
    }
}
