//! Audit Log - append-only record of every pipeline state transition
//!
//! One `AuditLog` is shared by `Arc` across the pipeline. Appends serialize
//! on a single lock that covers sequence assignment, storage and broadcast,
//! so sequence numbers are gap-free and subscribers see events in order.
//!
//! ## Reading
//!
//! - `query(filter)` returns a lazy iterator bounded at the current tail
//! - `subscribe()` returns a broadcast receiver for live consumers
//! - `kpi()` rolls the whole log up into a [`KpiSummary`]

mod kpi;
mod query;
mod store;

pub use kpi::{ActionCounts, KpiSummary};
pub use query::{AuditFilter, AuditQuery};
pub use store::{AuditStore, MemoryAuditStore, SledAuditStore};

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, error};

use crate::metrics::Metrics;
use crate::types::{AuditDraft, AuditEvent};

// ============================================================================
// Errors
// ============================================================================

/// Audit failures. Every variant is fatal to the process.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuditError {
    #[error("audit storage exhausted (capacity {capacity} events)")]
    StorageExhausted { capacity: u64 },
    #[error("audit storage error: {0}")]
    Storage(String),
    #[error("audit serialization error: {0}")]
    Serialization(String),
}

// ============================================================================
// Audit Log
// ============================================================================

struct LogInner {
    store: Box<dyn AuditStore>,
    last_seq: u64,
}

pub struct AuditLog {
    inner: Mutex<LogInner>,
    capacity: u64,
    events_tx: broadcast::Sender<AuditEvent>,
    metrics: Arc<Metrics>,
}

impl AuditLog {
    /// Wrap a store. Numbering continues after whatever the store holds.
    pub fn new(
        store: Box<dyn AuditStore>,
        capacity: u64,
        channel_capacity: usize,
        metrics: Arc<Metrics>,
    ) -> Result<Self, AuditError> {
        let last_seq = store.last_seq()?;
        let (events_tx, _) = broadcast::channel(channel_capacity.max(1));
        Ok(Self {
            inner: Mutex::new(LogInner { store, last_seq }),
            capacity,
            events_tx,
            metrics,
        })
    }

    /// Unbounded-enough in-memory log for tests and demos.
    pub fn in_memory(metrics: Arc<Metrics>) -> Self {
        Self {
            inner: Mutex::new(LogInner {
                store: Box::new(MemoryAuditStore::new()),
                last_seq: 0,
            }),
            capacity: u64::MAX,
            events_tx: broadcast::channel(1_024).0,
            metrics,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, LogInner>, AuditError> {
        self.inner
            .lock()
            .map_err(|_| AuditError::Storage("audit lock poisoned".to_string()))
    }

    /// Append one event and return its sequence number.
    pub fn append(&self, draft: AuditDraft) -> Result<u64, AuditError> {
        let mut inner = self.lock()?;

        if inner.last_seq >= self.capacity {
            error!(capacity = self.capacity, "Audit storage exhausted");
            return Err(AuditError::StorageExhausted {
                capacity: self.capacity,
            });
        }

        let event = AuditEvent {
            seq: inner.last_seq + 1,
            timestamp: Utc::now(),
            kind: draft.kind,
            clip_id: draft.clip_id,
            stage: draft.stage,
            payload: draft.payload,
        };

        if let Err(e) = inner.store.insert(&event) {
            error!(seq = event.seq, error = %e, "Audit append failed");
            return Err(e);
        }
        inner.last_seq = event.seq;

        self.metrics
            .incr("audit_events_total", &[("kind", event.kind.as_str())]);
        debug!(
            seq = event.seq,
            kind = %event.kind,
            clip_id = event.clip_id.as_deref().unwrap_or("-"),
            "Audit event"
        );

        // no receivers is fine
        let _ = self.events_tx.send(event.clone());
        Ok(event.seq)
    }

    /// Highest sequence number appended so far.
    pub fn last_seq(&self) -> Result<u64, AuditError> {
        Ok(self.lock()?.last_seq)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuditEvent> {
        self.events_tx.subscribe()
    }

    /// Lazy iterator over matching events up to the current tail.
    pub fn query(&self, filter: AuditFilter) -> Result<AuditQuery<'_>, AuditError> {
        let upper = self.last_seq()?;
        Ok(AuditQuery::new(self, filter, upper))
    }

    /// Collect a query into a vector.
    pub fn events(&self, filter: AuditFilter) -> Result<Vec<AuditEvent>, AuditError> {
        self.query(filter)?.collect()
    }

    pub fn kpi(&self) -> Result<KpiSummary, AuditError> {
        let events = self.events(AuditFilter::default())?;
        Ok(KpiSummary::from_events(&events))
    }

    pub(crate) fn scan(&self, after: u64, upto: u64, limit: usize) -> Result<Vec<AuditEvent>, AuditError> {
        self.lock()?.store.scan(after, upto, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AuditKind, Stage};
    use serde_json::json;

    fn log_with_capacity(capacity: u64) -> AuditLog {
        AuditLog::new(
            Box::new(MemoryAuditStore::new()),
            capacity,
            16,
            Arc::new(Metrics::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_sequence_is_gap_free() {
        let log = log_with_capacity(100);
        for i in 0..5 {
            let seq = log
                .append(AuditDraft::new(AuditKind::StageStart).clip(format!("c{i}")))
                .unwrap();
            assert_eq!(seq, i + 1);
        }
        assert_eq!(log.last_seq().unwrap(), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_stay_gap_free() {
        let log = Arc::new(log_with_capacity(10_000));
        let mut writers = tokio::task::JoinSet::new();
        for w in 0..8 {
            let log = Arc::clone(&log);
            writers.spawn(async move {
                let mut seqs = Vec::with_capacity(50);
                for i in 0..50 {
                    let draft = AuditDraft::new(AuditKind::StageStart).clip(format!("w{w}-c{i}"));
                    seqs.push(log.append(draft).unwrap());
                    tokio::task::yield_now().await;
                }
                seqs
            });
        }

        let mut all = Vec::new();
        while let Some(res) = writers.join_next().await {
            let seqs = res.unwrap();
            // each writer sees its own appends in increasing order
            assert!(seqs.windows(2).all(|w| w[0] < w[1]));
            all.extend(seqs);
        }
        all.sort_unstable();
        assert_eq!(all, (1..=400).collect::<Vec<u64>>());

        let stored = log.events(AuditFilter::default()).unwrap();
        assert_eq!(stored.len(), 400);
        assert!(stored.windows(2).all(|w| w[1].seq == w[0].seq + 1 && w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn test_exhaustion_is_reported() {
        let log = log_with_capacity(2);
        log.append(AuditDraft::new(AuditKind::StageStart)).unwrap();
        log.append(AuditDraft::new(AuditKind::StageStart)).unwrap();
        let err = log.append(AuditDraft::new(AuditKind::StageStart)).unwrap_err();
        assert_eq!(err, AuditError::StorageExhausted { capacity: 2 });
        assert_eq!(log.last_seq().unwrap(), 2);
    }

    #[test]
    fn test_append_counts_metric_per_kind() {
        let metrics = Arc::new(Metrics::new());
        let log = AuditLog::in_memory(Arc::clone(&metrics));
        log.append(AuditDraft::new(AuditKind::ParseFail)).unwrap();
        log.append(AuditDraft::new(AuditKind::ParseFail)).unwrap();
        assert_eq!(metrics.counter("audit_events_total", &[("kind", "parse_fail")]), 2);
    }

    #[test]
    fn test_query_filters_and_limits() {
        let log = log_with_capacity(1_000);
        for i in 0..600u64 {
            let kind = if i % 3 == 0 { AuditKind::StageTimeout } else { AuditKind::StageStart };
            log.append(
                AuditDraft::new(kind)
                    .clip(format!("clip-{}", i % 2))
                    .stage(Stage::Observer)
                    .payload(json!({ "i": i })),
            )
            .unwrap();
        }

        let timeouts = log
            .events(AuditFilter::default().kinds([AuditKind::StageTimeout]))
            .unwrap();
        assert_eq!(timeouts.len(), 200);
        assert!(timeouts.windows(2).all(|w| w[0].seq < w[1].seq));

        let limited = log
            .events(AuditFilter {
                clip_id: Some("clip-1".to_string()),
                limit: Some(10),
                ..AuditFilter::default()
            })
            .unwrap();
        assert_eq!(limited.len(), 10);
        assert!(limited.iter().all(|e| e.clip_id.as_deref() == Some("clip-1")));

        let tail = log.events(AuditFilter::default().after(590)).unwrap();
        assert_eq!(tail.len(), 10);
        assert_eq!(tail[0].seq, 591);
    }

    #[test]
    fn test_query_is_restartable_and_bounded() {
        let log = log_with_capacity(1_000);
        for _ in 0..300 {
            log.append(AuditDraft::new(AuditKind::StageStart)).unwrap();
        }
        let mut query = log.query(AuditFilter::default()).unwrap();
        let first: Vec<u64> = query.by_ref().map(|e| e.unwrap().seq).collect();

        // appends after creation stay invisible to this query
        log.append(AuditDraft::new(AuditKind::StageStart)).unwrap();

        query.restart();
        let second: Vec<u64> = query.map(|e| e.unwrap().seq).collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 300);
    }

    #[tokio::test]
    async fn test_subscribers_see_appends_in_order() {
        let log = log_with_capacity(100);
        let mut rx = log.subscribe();
        for _ in 0..3 {
            log.append(AuditDraft::new(AuditKind::StageStart)).unwrap();
        }
        for expected in 1..=3 {
            assert_eq!(rx.recv().await.unwrap().seq, expected);
        }
    }
}
