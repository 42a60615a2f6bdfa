//! Clip intake queue and the worker pool that drains it.
//!
//! [`ClipIntake`] is the producer half: a bounded queue that rejects clips
//! when full rather than waiting. [`WorkerPool`] owns the consumer half and
//! runs up to `pool_size` clips at once, each on its own task.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::orchestrator::{ClipState, Orchestrator};
use crate::audit::AuditError;
use crate::config::WorkerConfig;
use crate::health::Readiness;
use crate::metrics::Metrics;
use crate::types::Clip;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IntakeError {
    #[error("intake queue is full")]
    QueueFull,
    #[error("intake queue is closed")]
    Closed,
}

// ============================================================================
// Intake
// ============================================================================

#[derive(Clone)]
pub struct ClipIntake {
    tx: mpsc::Sender<Clip>,
    metrics: Arc<Metrics>,
}

impl ClipIntake {
    /// Queue a clip without waiting.
    pub fn submit(&self, clip: Clip) -> Result<(), IntakeError> {
        match self.tx.try_send(clip) {
            Ok(()) => {
                self.metrics.set_gauge("intake_queue_depth", &[], self.depth() as f64);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(clip)) => {
                self.metrics.incr("clips_rejected_total", &[]);
                warn!(clip_id = %clip.id, source_id = %clip.source_id, "Intake queue full, clip rejected");
                Err(IntakeError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(IntakeError::Closed),
        }
    }

    /// Clips queued and not yet picked up by a worker.
    ///
    /// Read from the channel itself, so it can never drift from what the
    /// workers have actually received.
    pub fn depth(&self) -> usize {
        queued(&self.tx)
    }
}

// ============================================================================
// Worker Pool
// ============================================================================

pub struct WorkerPool {
    rx: mpsc::Receiver<Clip>,
    /// Observes queue depth without keeping the intake open
    tx: mpsc::WeakSender<Clip>,
    orchestrator: Arc<Orchestrator>,
    metrics: Arc<Metrics>,
    size: usize,
}

/// Build the intake queue and the pool that consumes it.
pub fn worker_pool(
    config: &WorkerConfig,
    orchestrator: Arc<Orchestrator>,
    metrics: Arc<Metrics>,
) -> (ClipIntake, WorkerPool) {
    let (tx, rx) = mpsc::channel(config.intake_capacity.max(1));
    metrics.set_gauge("intake_queue_depth", &[], 0.0);
    let pool = WorkerPool {
        rx,
        tx: tx.downgrade(),
        orchestrator,
        metrics,
        size: config.pool_size.max(1),
    };
    let intake = ClipIntake {
        tx,
        metrics: Arc::clone(&pool.metrics),
    };
    (intake, pool)
}

impl WorkerPool {
    /// Process clips until cancelled or every intake handle is dropped.
    ///
    /// In-flight clips are drained before returning. Returns the number of
    /// clips processed, or the first fatal audit error.
    pub async fn run(mut self, cancel: CancellationToken, readiness: Arc<Readiness>) -> Result<u64, AuditError> {
        let permits = Arc::new(Semaphore::new(self.size));
        let mut workers: JoinSet<Result<ClipState, AuditError>> = JoinSet::new();
        let mut processed = 0u64;

        readiness.mark_workers_ready();
        info!(pool_size = self.size, "[WorkerPool] Ready");

        loop {
            let permit = tokio::select! {
                () = cancel.cancelled() => break,
                Some(res) = workers.join_next(), if !workers.is_empty() => {
                    processed += reap(res)?;
                    continue;
                }
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            let clip = tokio::select! {
                () = cancel.cancelled() => break,
                Some(res) = workers.join_next(), if !workers.is_empty() => {
                    processed += reap(res)?;
                    continue;
                }
                clip = self.rx.recv() => match clip {
                    Some(clip) => clip,
                    None => {
                        info!("[WorkerPool] Intake closed");
                        break;
                    }
                },
            };

            self.metrics.set_gauge("intake_queue_depth", &[], self.depth() as f64);

            let orchestrator = Arc::clone(&self.orchestrator);
            workers.spawn(async move {
                let _permit = permit;
                orchestrator.run_clip(&clip).await.map(|outcome| outcome.state)
            });
        }

        let queued = self.depth();
        self.metrics.set_gauge("intake_queue_depth", &[], queued as f64);
        info!(in_flight = workers.len(), queued, "[WorkerPool] Draining");
        while let Some(res) = workers.join_next().await {
            processed += reap(res)?;
        }
        info!(processed, "[WorkerPool] Stopped");
        Ok(processed)
    }
}

impl WorkerPool {
    fn depth(&self) -> usize {
        self.tx.upgrade().map_or(0, |tx| queued(&tx))
    }
}

fn queued<T>(tx: &mpsc::Sender<T>) -> usize {
    tx.max_capacity().saturating_sub(tx.capacity())
}

fn reap(res: Result<Result<ClipState, AuditError>, JoinError>) -> Result<u64, AuditError> {
    match res {
        Ok(Ok(_)) => Ok(1),
        Ok(Err(e)) => {
            error!(error = %e, "[WorkerPool] Fatal audit error, stopping");
            Err(e)
        }
        Err(e) => {
            error!(error = %e, "[WorkerPool] Worker task panicked");
            Ok(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::capabilities::Capabilities;
    use crate::config::PipelineConfig;
    use crate::faults::FaultInjector;
    use chrono::Utc;
    use tokio_test::{assert_err, assert_ok};

    fn pool(capacity: usize) -> (ClipIntake, WorkerPool, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new());
        let audit = Arc::new(AuditLog::in_memory(Arc::clone(&metrics)));
        let faults = Arc::new(FaultInjector::new(Arc::clone(&metrics)));
        let orch = Orchestrator::new(
            PipelineConfig::default(),
            Capabilities::stub(),
            audit,
            Arc::clone(&metrics),
            faults,
        )
        .unwrap();
        let config = WorkerConfig {
            pool_size: 2,
            intake_capacity: capacity,
        };
        let (intake, pool) = worker_pool(&config, Arc::new(orch), Arc::clone(&metrics));
        (intake, pool, metrics)
    }

    fn clip(i: u64) -> Clip {
        Clip::new("cam-1", i, Utc::now(), Utc::now())
    }

    #[tokio::test]
    async fn test_full_queue_rejects_and_counts() {
        let (intake, _pool, metrics) = pool(2);
        assert_ok!(intake.submit(clip(1)));
        assert_ok!(intake.submit(clip(2)));
        assert_eq!(assert_err!(intake.submit(clip(3))), IntakeError::QueueFull);
        assert_eq!(metrics.counter("clips_rejected_total", &[]), 1);
        assert_eq!(intake.depth(), 2);
        assert_eq!(metrics.gauge("intake_queue_depth", &[]), Some(2.0));
    }

    #[tokio::test]
    async fn test_pool_drains_and_marks_ready() {
        let (intake, pool, metrics) = pool(8);
        for i in 0..5 {
            intake.submit(clip(i)).unwrap();
        }
        drop(intake);

        let readiness = Arc::new(Readiness::new());
        let processed = pool
            .run(CancellationToken::new(), Arc::clone(&readiness))
            .await
            .unwrap();
        assert_eq!(processed, 5);
        assert!(readiness.workers_ready());
        assert_eq!(metrics.counter("clips_total", &[("state", "skipped")]), 5);
        assert_eq!(metrics.gauge("intake_queue_depth", &[]), Some(0.0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_depth_stays_bounded_while_workers_drain() {
        let (intake, pool, metrics) = pool(4);
        let readiness = Arc::new(Readiness::new());
        let runner = tokio::spawn(pool.run(CancellationToken::new(), readiness));

        let mut accepted = 0u64;
        for i in 0..500 {
            if intake.submit(clip(i)).is_ok() {
                accepted += 1;
            }
            assert!(intake.depth() <= 4, "depth {} exceeds capacity", intake.depth());
            if i % 16 == 0 {
                tokio::task::yield_now().await;
            }
        }
        drop(intake);

        let processed = runner.await.unwrap().unwrap();
        assert_eq!(processed, accepted);
        assert_eq!(metrics.gauge("intake_queue_depth", &[]), Some(0.0));
    }

    #[tokio::test]
    async fn test_closed_once_pool_dropped() {
        let (intake, pool, _) = pool(4);
        drop(pool);
        assert_eq!(assert_err!(intake.submit(clip(1))), IntakeError::Closed);
    }
}
