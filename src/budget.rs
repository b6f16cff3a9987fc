use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::errors::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Search,
    Travel,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Search => "search",
            RequestKind::Travel => "travel",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
struct KindCounters {
    network: AtomicU64,
    cache_hits: AtomicU64,
    dedup_skips: AtomicU64,
}

/// Shared per-category counters. Cache hits and dedup skips are reporting only.
#[derive(Debug, Default)]
pub struct RequestMetrics {
    search: KindCounters,
    travel: KindCounters,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub search_requests: u64,
    pub travel_requests: u64,
    pub search_cache_hits: u64,
    pub travel_cache_hits: u64,
    pub search_dedup_skips: u64,
    pub travel_dedup_skips: u64,
}

impl RequestMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn counters(&self, kind: RequestKind) -> &KindCounters {
        match kind {
            RequestKind::Search => &self.search,
            RequestKind::Travel => &self.travel,
        }
    }

    pub fn network(&self, kind: RequestKind) -> u64 {
        self.counters(kind).network.load(Ordering::SeqCst)
    }

    pub fn cache_hits(&self, kind: RequestKind) -> u64 {
        self.counters(kind).cache_hits.load(Ordering::SeqCst)
    }

    pub fn dedup_skips(&self, kind: RequestKind) -> u64 {
        self.counters(kind).dedup_skips.load(Ordering::SeqCst)
    }

    pub fn record_cache_hit(&self, kind: RequestKind) {
        self.counters(kind).cache_hits.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_dedup_skip(&self, kind: RequestKind) {
        self.counters(kind)
            .dedup_skips
            .fetch_add(1, Ordering::SeqCst);
    }

    fn record_network(&self, kind: RequestKind) -> u64 {
        self.counters(kind).network.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            search_requests: self.network(RequestKind::Search),
            travel_requests: self.network(RequestKind::Travel),
            search_cache_hits: self.cache_hits(RequestKind::Search),
            travel_cache_hits: self.cache_hits(RequestKind::Travel),
            search_dedup_skips: self.dedup_skips(RequestKind::Search),
            travel_dedup_skips: self.dedup_skips(RequestKind::Travel),
        }
    }
}

/// Hard caps on paid requests. Network counts live in the shared metrics so
/// observers never need the budget itself.
#[derive(Debug)]
pub struct RequestBudget {
    max_search: u64,
    max_travel: u64,
    metrics: Arc<RequestMetrics>,
    gate: Mutex<()>,
}

impl RequestBudget {
    pub fn new(max_search: u64, max_travel: u64) -> Self {
        Self::with_metrics(max_search, max_travel, RequestMetrics::new())
    }

    pub fn with_metrics(max_search: u64, max_travel: u64, metrics: Arc<RequestMetrics>) -> Self {
        Self {
            max_search,
            max_travel,
            metrics,
            gate: Mutex::new(()),
        }
    }

    pub fn cap(&self, kind: RequestKind) -> u64 {
        match kind {
            RequestKind::Search => self.max_search,
            RequestKind::Travel => self.max_travel,
        }
    }

    pub fn used(&self, kind: RequestKind) -> u64 {
        self.metrics.network(kind)
    }

    pub fn remaining(&self, kind: RequestKind) -> u64 {
        self.cap(kind).saturating_sub(self.used(kind))
    }

    pub fn metrics(&self) -> Arc<RequestMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Reserves one network call. Fails without counting when the cap is reached.
    pub fn consume(&self, kind: RequestKind) -> AppResult<u64> {
        let _gate = self.gate.lock();
        let used = self.used(kind);
        let cap = self.cap(kind);
        if used >= cap {
            return Err(AppError::BudgetExceeded { kind, used, cap });
        }
        let used = self.metrics.record_network(kind);
        debug!(kind = kind.as_str(), used, cap, "request budget consumed");
        Ok(used)
    }
}
