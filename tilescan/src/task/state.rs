//! Run-state machine shared between a task worker and its handle.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Lifecycle of an acquisition task.
///
/// Transitions are monotonic: `Pending -> Running -> Finished`, with
/// `Cancelled` reachable from the two non-terminal states. A task never
/// leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Created but the worker has not started yet.
    Pending,
    /// The worker is acquiring.
    Running,
    /// Cancellation was requested before the task finished.
    Cancelled,
    /// The worker ran to completion (successfully or with an error).
    Finished,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Finished)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Cancelled => "cancelled",
            Self::Finished => "finished",
        };
        f.write_str(s)
    }
}

/// Mutable task state plus the cancellation token of whatever sub-operation
/// is currently in flight.
///
/// Cancellation is cooperative: `request_cancel` flips the state exactly
/// once and fires the registered token, so the worker's current await
/// returns promptly instead of running the hardware operation to its end.
pub(crate) struct RunState {
    state: TaskState,
    running_sub: CancellationToken,
    state_tx: watch::Sender<TaskState>,
}

pub(crate) type SharedRunState = Arc<Mutex<RunState>>;

impl RunState {
    /// Creates a fresh shared state in `Pending`, plus the receiver handles
    /// observe state changes through.
    pub fn new_shared() -> (SharedRunState, watch::Receiver<TaskState>) {
        let (state_tx, state_rx) = watch::channel(TaskState::Pending);
        let shared = Arc::new(Mutex::new(Self {
            state: TaskState::Pending,
            running_sub: CancellationToken::new(),
            state_tx,
        }));
        (shared, state_rx)
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn is_cancelled(&self) -> bool {
        self.state == TaskState::Cancelled
    }

    /// `Pending -> Running`. Returns false if cancellation already won.
    pub fn start_running(&mut self) -> bool {
        if self.state != TaskState::Pending {
            return false;
        }
        self.state = TaskState::Running;
        let _ = self.state_tx.send(TaskState::Running);
        true
    }

    /// `Running -> Finished`. A cancelled task stays cancelled.
    pub fn finish(&mut self) {
        if self.state == TaskState::Running {
            self.state = TaskState::Finished;
            let _ = self.state_tx.send(TaskState::Finished);
        }
    }

    /// Requests cancellation. Returns true exactly once, on the call that
    /// actually performed the transition; later calls (and calls after the
    /// task finished) return false.
    pub fn request_cancel(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = TaskState::Cancelled;
        let _ = self.state_tx.send(TaskState::Cancelled);
        self.running_sub.cancel();
        true
    }

    /// Installs a fresh token for the next sub-operation and returns it.
    ///
    /// If cancellation has already been requested the returned token is
    /// pre-fired, so the caller's select resolves immediately.
    pub fn register_sub(&mut self) -> CancellationToken {
        let token = CancellationToken::new();
        if self.state == TaskState::Cancelled {
            token.cancel();
            return token;
        }
        self.running_sub = token.clone();
        token
    }
}

/// Locks the shared state, recovering from a poisoned mutex: the state data
/// stays valid even if a worker panicked while holding the lock.
pub(crate) fn lock(shared: &SharedRunState) -> MutexGuard<'_, RunState> {
    shared.lock().unwrap_or_else(|e| e.into_inner())
}

/// Runs `fut` under the task's cancellation: returns `None` if the task is
/// cancelled before the future resolves, dropping the future.
pub(crate) async fn with_cancel<F: Future>(shared: &SharedRunState, fut: F) -> Option<F::Output> {
    let token = lock(shared).register_sub();
    tokio::select! {
        _ = token.cancelled() => None,
        out = fut => Some(out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        let (shared, rx) = RunState::new_shared();
        assert_eq!(*rx.borrow(), TaskState::Pending);

        assert!(lock(&shared).start_running());
        assert_eq!(*rx.borrow(), TaskState::Running);
        assert!(!lock(&shared).start_running(), "running twice is rejected");

        lock(&shared).finish();
        assert_eq!(*rx.borrow(), TaskState::Finished);
    }

    #[test]
    fn test_cancel_returns_true_exactly_once() {
        let (shared, rx) = RunState::new_shared();
        lock(&shared).start_running();
        assert!(lock(&shared).request_cancel());
        assert!(!lock(&shared).request_cancel());
        assert_eq!(*rx.borrow(), TaskState::Cancelled);

        // Cancelled is terminal; finish must not overwrite it
        lock(&shared).finish();
        assert_eq!(*rx.borrow(), TaskState::Cancelled);
    }

    #[test]
    fn test_cancel_after_finish_is_rejected() {
        let (shared, _rx) = RunState::new_shared();
        lock(&shared).start_running();
        lock(&shared).finish();
        assert!(!lock(&shared).request_cancel());
        assert_eq!(lock(&shared).state(), TaskState::Finished);
    }

    #[test]
    fn test_cancel_before_start_wins() {
        let (shared, _rx) = RunState::new_shared();
        assert!(lock(&shared).request_cancel());
        assert!(!lock(&shared).start_running());
    }

    #[tokio::test]
    async fn test_with_cancel_forwards_to_running_sub() {
        let (shared, _rx) = RunState::new_shared();
        lock(&shared).start_running();

        let worker_shared = shared.clone();
        let worker = tokio::spawn(async move {
            with_cancel(&worker_shared, std::future::pending::<()>()).await
        });

        // Give the worker a chance to register its sub-operation
        tokio::task::yield_now().await;
        lock(&shared).request_cancel();
        assert_eq!(worker.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_with_cancel_after_cancel_resolves_immediately() {
        let (shared, _rx) = RunState::new_shared();
        lock(&shared).request_cancel();
        let out = with_cancel(&shared, std::future::pending::<()>()).await;
        assert_eq!(out, None);
    }

    #[tokio::test]
    async fn test_with_cancel_passes_result_through() {
        let (shared, _rx) = RunState::new_shared();
        lock(&shared).start_running();
        let out = with_cancel(&shared, async { 7 }).await;
        assert_eq!(out, Some(7));
    }
}
