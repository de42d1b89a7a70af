//! Shutdown coordination for the process.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinError;

use crate::config::ShutdownConfig;
use crate::lifecycle::types::{
    ExitOutcome, ExitReport, ExitState, HookError, HookStatus, ProcessExit, Terminator,
};
use crate::observability::metrics;

type Hook = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), HookError>> + Send>;

struct Registry {
    state: ExitState,
    hooks: Vec<Hook>,
}

/// Coordinator for process termination.
///
/// Hooks registered before the first trigger are run concurrently, once, under
/// a single aggregate deadline. The outcome is handed to a [`Terminator`],
/// which in production ends the process.
pub struct ExitCoordinator {
    registry: Mutex<Registry>,
    /// Applies to all hooks together, not to each one.
    deadline: Duration,
    terminator: Arc<dyn Terminator>,
    listeners_attached: AtomicBool,
    /// Flips to `true` when hooks are left running past the deadline.
    abandoned: watch::Sender<bool>,
    report: watch::Sender<Option<ExitReport>>,
}

impl ExitCoordinator {
    pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(10);

    /// Create a coordinator that exits the process when cleanup ends.
    pub fn new(deadline: Duration) -> Self {
        let (abandoned, _) = watch::channel(false);
        let (report, _) = watch::channel(None);
        Self {
            registry: Mutex::new(Registry {
                state: ExitState::Idle,
                hooks: Vec::new(),
            }),
            deadline,
            terminator: Arc::new(ProcessExit),
            listeners_attached: AtomicBool::new(false),
            abandoned,
            report,
        }
    }

    pub fn from_config(config: &ShutdownConfig) -> Self {
        Self::new(Duration::from_millis(config.deadline_ms))
    }

    /// Replace the final action taken with the exit code.
    pub fn with_terminator(mut self, terminator: Arc<dyn Terminator>) -> Self {
        self.terminator = terminator;
        self
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a cleanup hook.
    ///
    /// Returns `false` and drops the hook once cleanup has started.
    pub fn register<F, Fut>(&self, hook: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), HookError>> + Send + 'static,
    {
        let mut registry = self.registry();
        if registry.state != ExitState::Idle {
            tracing::debug!(state = ?registry.state, "Shutdown in progress, ignoring exit hook");
            return false;
        }
        registry.hooks.push(Box::new(move || hook().boxed()));
        true
    }

    pub fn state(&self) -> ExitState {
        self.registry().state
    }

    /// Number of hooks waiting to run.
    pub fn hook_count(&self) -> usize {
        self.registry().hooks.len()
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Mark external termination listeners as installed.
    pub fn attach_listeners(&self) {
        self.listeners_attached.store(true, Ordering::SeqCst);
    }

    /// Whether external listeners may still deliver triggers.
    pub fn listeners_attached(&self) -> bool {
        self.listeners_attached.load(Ordering::SeqCst)
    }

    /// Receiver that turns `true` when running hooks are abandoned at the deadline.
    ///
    /// Hooks are never cancelled; long-running ones may watch this to stop early.
    pub fn abandoned(&self) -> watch::Receiver<bool> {
        self.abandoned.subscribe()
    }

    /// Explicit "the process is exiting" notification.
    pub async fn request_exit(&self) -> Option<ExitReport> {
        self.trigger("process.exit caught").await
    }

    /// Run every registered hook and terminate.
    ///
    /// Only the first call does anything; it returns the report after handing
    /// the exit code to the terminator. Later calls return `None` immediately.
    pub async fn trigger(&self, reason: impl Into<String>) -> Option<ExitReport> {
        let reason = reason.into();
        let hooks = {
            let mut registry = self.registry();
            if registry.state != ExitState::Idle {
                tracing::debug!(
                    reason = %reason,
                    "Termination already in progress, ignoring trigger"
                );
                return None;
            }
            registry.state = ExitState::Cleaning;
            std::mem::take(&mut registry.hooks)
        };
        self.listeners_attached.store(false, Ordering::SeqCst);

        tracing::error!(fatal = true, "Terminating the process (reason: {})", reason);
        tracing::info!(hooks = hooks.len(), "Starting to clean up...");

        let started = Instant::now();
        let (hooks, timed_out) = self.run_hooks(hooks).await;
        let elapsed = started.elapsed();

        let outcome = if timed_out {
            self.abandoned.send_replace(true);
            tracing::info!(
                elapsed_ms = elapsed.as_millis() as u64,
                "The cleaning process took too long. Aborting"
            );
            ExitOutcome::TimedOut
        } else if hooks.iter().any(|status| matches!(status, HookStatus::Failed(_))) {
            for status in &hooks {
                if let HookStatus::Failed(e) = status {
                    tracing::info!("An error occurred while cleaning the process: {}", e);
                }
            }
            ExitOutcome::HookFailed
        } else {
            tracing::info!("Successfully terminated the process");
            ExitOutcome::Success
        };

        for status in &hooks {
            metrics::record_hook_status(status);
        }

        let report = ExitReport {
            reason,
            outcome,
            hooks,
            elapsed,
        };

        self.registry().state = ExitState::Terminated;
        self.report.send_replace(Some(report.clone()));
        self.terminator.terminate(outcome.code());
        Some(report)
    }

    /// Spawn every hook and settle them all, or stop waiting at the deadline.
    async fn run_hooks(&self, hooks: Vec<Hook>) -> (Vec<HookStatus>, bool) {
        let mut statuses = vec![HookStatus::Abandoned; hooks.len()];
        let mut running: FuturesUnordered<_> = hooks
            .into_iter()
            .enumerate()
            .map(|(index, hook)| {
                let handle = tokio::spawn(hook());
                async move { (index, handle.await) }
            })
            .collect();

        let settle = async {
            while let Some((index, result)) = running.next().await {
                statuses[index] = settle_status(result);
            }
        };
        let timed_out = tokio::time::timeout(self.deadline, settle).await.is_err();

        (statuses, timed_out)
    }

    /// Wait until a trigger has finished cleaning up.
    pub async fn wait(&self) -> ExitReport {
        let mut rx = self.report.subscribe();
        loop {
            if let Some(report) = rx.borrow_and_update().clone() {
                return report;
            }
            if rx.changed().await.is_err() {
                // Sender lives in `self`; only reachable if it is being torn down.
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for ExitCoordinator {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DEADLINE)
    }
}

impl std::fmt::Debug for ExitCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry();
        f.debug_struct("ExitCoordinator")
            .field("state", &registry.state)
            .field("hooks", &registry.hooks.len())
            .field("deadline", &self.deadline)
            .field("listeners_attached", &self.listeners_attached())
            .finish()
    }
}

fn settle_status(result: Result<Result<(), HookError>, JoinError>) -> HookStatus {
    match result {
        Ok(Ok(())) => HookStatus::Succeeded,
        Ok(Err(e)) => HookStatus::Failed(e),
        Err(e) => HookStatus::Failed(HookError::Panicked(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<i32>>);

    impl Terminator for Recorder {
        fn terminate(&self, code: i32) {
            self.0.lock().unwrap().push(code);
        }
    }

    fn coordinator(deadline: Duration) -> (ExitCoordinator, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let coordinator = ExitCoordinator::new(deadline).with_terminator(recorder.clone());
        (coordinator, recorder)
    }

    #[tokio::test]
    async fn empty_registry_succeeds() {
        let (coordinator, recorder) = coordinator(Duration::from_secs(1));
        let report = coordinator.trigger("test").await.unwrap();

        assert_eq!(report.outcome, ExitOutcome::Success);
        assert!(report.hooks.is_empty());
        assert_eq!(*recorder.0.lock().unwrap(), vec![0]);
        assert_eq!(coordinator.state(), ExitState::Terminated);
    }

    #[tokio::test]
    async fn registration_closes_on_trigger() {
        let (coordinator, _) = coordinator(Duration::from_secs(1));
        assert!(coordinator.register(|| async { Ok(()) }));
        assert_eq!(coordinator.hook_count(), 1);

        coordinator.trigger("test").await.unwrap();

        assert!(!coordinator.register(|| async { Ok(()) }));
        assert_eq!(coordinator.hook_count(), 0);
    }

    #[tokio::test]
    async fn recursive_trigger_is_ignored() {
        let (coordinator, recorder) = coordinator(Duration::from_secs(1));
        let coordinator = Arc::new(coordinator);
        let inner = coordinator.clone();
        let nested = Arc::new(AtomicUsize::new(0));
        let seen = nested.clone();

        coordinator.register(move || async move {
            if inner.trigger("from hook").await.is_none() {
                seen.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        });

        let report = coordinator.trigger("outer").await.unwrap();
        assert_eq!(report.reason, "outer");
        assert_eq!(nested.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn panicking_hook_counts_as_failure() {
        let (coordinator, recorder) = coordinator(Duration::from_secs(1));
        coordinator.register(|| async { panic!("hook exploded") });
        coordinator.register(|| async { Ok(()) });

        let report = coordinator.trigger("test").await.unwrap();

        assert_eq!(report.outcome, ExitOutcome::HookFailed);
        assert!(matches!(report.hooks[0], HookStatus::Failed(HookError::Panicked(_))));
        assert_eq!(report.hooks[1], HookStatus::Succeeded);
        assert_eq!(*recorder.0.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn wait_returns_report_after_trigger() {
        let (coordinator, _) = coordinator(Duration::from_secs(1));
        let coordinator = Arc::new(coordinator);

        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.wait().await })
        };
        coordinator.request_exit().await.unwrap();

        let report = waiter.await.unwrap();
        assert_eq!(report.reason, "process.exit caught");
        assert_eq!(report.outcome, ExitOutcome::Success);
    }
}
