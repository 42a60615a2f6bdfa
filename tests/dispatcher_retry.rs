//! Dispatcher Retry Tests
//!
//! Bounded retry with exponential backoff against scripted executors.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stagewarden::audit::{AuditFilter, AuditLog};
use stagewarden::capabilities::{ActionExecutor, ExecOutcome};
use stagewarden::config::DispatcherConfig;
use stagewarden::faults::FaultInjector;
use stagewarden::metrics::Metrics;
use stagewarden::pipeline::{DispatchResult, Dispatcher};
use stagewarden::types::{Action, ActionType, AuditKind, Priority};

/// Returns the scripted outcomes in order, then repeats the last one.
struct Scripted {
    outcomes: Vec<ExecOutcome>,
    calls: AtomicU32,
}

impl Scripted {
    fn new(outcomes: Vec<ExecOutcome>) -> Arc<Self> {
        Arc::new(Self {
            outcomes,
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ActionExecutor for Scripted {
    async fn execute(&self, _: &Action) -> ExecOutcome {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
        self.outcomes[n.min(self.outcomes.len() - 1)].clone()
    }
}

fn action() -> Action {
    Action {
        action_type: ActionType::Page,
        target: "cam-yard-03".to_string(),
        operator_message: "restricted_area_entry detected on cam-yard-03".to_string(),
        steps: vec!["Page the on-call safety lead".to_string()],
        priority: Priority::P1,
        notes: vec![],
    }
}

fn dispatcher(config: DispatcherConfig, executor: Arc<Scripted>) -> (Dispatcher, Arc<AuditLog>, Arc<Metrics>) {
    let metrics = Arc::new(Metrics::new());
    let audit = Arc::new(AuditLog::in_memory(Arc::clone(&metrics)));
    let faults = Arc::new(FaultInjector::new(Arc::clone(&metrics)));
    let d = Dispatcher::new(
        config,
        Duration::from_millis(1_200),
        executor as Arc<dyn ActionExecutor>,
        Arc::clone(&audit),
        Arc::clone(&metrics),
        faults,
    );
    (d, audit, metrics)
}

#[tokio::test(start_paused = true)]
async fn always_transient_fails_after_one_plus_max_retries() {
    for max_retries in [0_u32, 1, 3] {
        let exec = Scripted::new(vec![ExecOutcome::Transient("503".to_string())]);
        let config = DispatcherConfig {
            max_retries,
            ..DispatcherConfig::default()
        };
        let (d, audit, metrics) = dispatcher(config, Arc::clone(&exec));

        let res = d.deliver("clip-1", &action(), "cam-yard-03:r:page").await.unwrap();
        assert!(matches!(res, DispatchResult::Failed { attempts, .. } if attempts == max_retries + 1));
        assert_eq!(exec.calls(), max_retries + 1);

        let failed = audit
            .events(AuditFilter::default().kinds([AuditKind::ActionFailed]))
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].is_terminal());
        assert_eq!(audit.last_seq().unwrap(), 1);
        assert_eq!(metrics.counter("dispatch_retries_total", &[]), u64::from(max_retries));
    }
}

#[tokio::test(start_paused = true)]
async fn transient_then_ok_is_sent_on_retry() {
    let exec = Scripted::new(vec![
        ExecOutcome::Transient("timeout".to_string()),
        ExecOutcome::Ok(Some("ack-77".to_string())),
    ]);
    let (d, audit, _) = dispatcher(DispatcherConfig::default(), Arc::clone(&exec));

    let res = d.deliver("clip-2", &action(), "k").await.unwrap();
    assert_eq!(
        res,
        DispatchResult::Sent {
            attempts: 2,
            reference: Some("ack-77".to_string())
        }
    );
    let events = audit.events(AuditFilter::default()).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, AuditKind::ActionSent);
    assert_eq!(events[0].payload_u64("attempts"), Some(2));
}

#[tokio::test(start_paused = true)]
async fn backoff_waits_between_attempts() {
    let exec = Scripted::new(vec![ExecOutcome::Transient("503".to_string())]);
    let config = DispatcherConfig {
        max_retries: 2,
        base_backoff_ms: 100,
        max_backoff_ms: 1_000,
        ..DispatcherConfig::default()
    };
    let (d, _, _) = dispatcher(config, exec);

    let started = tokio::time::Instant::now();
    d.deliver("clip-3", &action(), "k").await.unwrap();
    let waited = started.elapsed();
    // 100ms then 200ms, each plus up to 25% jitter
    assert!(waited >= Duration::from_millis(300), "waited {waited:?}");
    assert!(waited <= Duration::from_millis(375), "waited {waited:?}");
}
