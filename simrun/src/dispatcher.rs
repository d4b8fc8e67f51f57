use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};

use crate::config::DispatcherConfig;
use crate::error::DispatchError;
use crate::run::RunId;

/// Token for signaling cancellation to one dispatched task.
#[derive(Clone, Debug)]
pub struct CancellationToken {
    inner: Arc<CancellationTokenInner>,
}

#[derive(Debug)]
struct CancellationTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationToken {
    /// Create a token that is not cancelled.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancellationTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Whether cancellation was signalled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register interest before checking the flag so a concurrent cancel is not missed.
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Terminal outcome of a dispatched task.
#[derive(Clone, Debug, PartialEq)]
pub enum DispatchOutcome<T> {
    /// The task ran to completion and produced a value.
    Completed(T),
    /// The task panicked; the panic message is kept.
    Failed(String),
}

struct TaskSlot<T> {
    outcome: Mutex<Option<DispatchOutcome<T>>>,
    cancel: CancellationToken,
}

/// Bounded pool executing at most one task per run id.
///
/// Each task holds a worker permit for its whole lifetime, so long-running
/// tasks occupy the pool while they wait between polls. Tasks beyond the
/// pool size wait for a permit before starting.
pub struct Dispatcher<T> {
    permits: Arc<Semaphore>,
    capacity: usize,
    slots: Mutex<HashMap<RunId, Arc<TaskSlot<T>>>>,
}

impl<T> fmt::Debug for Dispatcher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("capacity", &self.capacity)
            .field("available_workers", &self.permits.available_permits())
            .field("slots", &self.slots.lock().len())
            .finish()
    }
}

impl<T> Dispatcher<T>
where
    T: Clone + Send + 'static,
{
    /// Create a pool with `config.workers` permits (at least one).
    pub fn new(config: &DispatcherConfig) -> Self {
        let capacity = config.workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Begin executing the task built by `task` under `run_id`.
    ///
    /// The task receives the cancellation token bound to this run. Fails with
    /// `DuplicateSubmission` while a task for the id is running or its outcome
    /// has not been taken yet.
    pub fn submit<F, Fut>(&self, run_id: RunId, task: F) -> Result<CancellationToken, DispatchError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let mut slots = self.slots.lock();
        if slots.contains_key(&run_id) {
            return Err(DispatchError::DuplicateSubmission(run_id));
        }

        let cancel = CancellationToken::new();
        let slot = Arc::new(TaskSlot {
            outcome: Mutex::new(None),
            cancel: cancel.clone(),
        });
        slots.insert(run_id, Arc::clone(&slot));
        drop(slots);

        let future = task(cancel.clone());
        let permits = Arc::clone(&self.permits);
        tokio::spawn(async move {
            let outcome = match permits.acquire_owned().await {
                Ok(_permit) => {
                    crate::telemetry::record_worker_acquired(run_id);
                    let outcome = match AssertUnwindSafe(future).catch_unwind().await {
                        Ok(value) => DispatchOutcome::Completed(value),
                        Err(panic) => {
                            let message = panic_message(panic.as_ref());
                            tracing::error!(
                                run_id = %run_id,
                                "dispatched task panicked: {message}"
                            );
                            DispatchOutcome::Failed(message)
                        }
                    };
                    crate::telemetry::record_worker_released(run_id);
                    outcome
                }
                Err(_) => DispatchOutcome::Failed("worker pool closed".to_string()),
            };
            *slot.outcome.lock() = Some(outcome);
        });

        Ok(cancel)
    }

    /// Whether the task for `run_id` has produced an outcome.
    ///
    /// False while running and for ids with no slot.
    pub fn is_done(&self, run_id: RunId) -> bool {
        self.slots
            .lock()
            .get(&run_id)
            .map(|slot| slot.outcome.lock().is_some())
            .unwrap_or(false)
    }

    /// Read the outcome without consuming it.
    pub fn peek(&self, run_id: RunId) -> Result<DispatchOutcome<T>, DispatchError> {
        let slots = self.slots.lock();
        let slot = slots.get(&run_id).ok_or(DispatchError::NotFound(run_id))?;
        let outcome = slot.outcome.lock();
        outcome.clone().ok_or(DispatchError::NotDone(run_id))
    }

    /// Consume the outcome. A second call fails with `NotFound`.
    pub fn take(&self, run_id: RunId) -> Result<DispatchOutcome<T>, DispatchError> {
        let mut slots = self.slots.lock();
        let slot = slots.get(&run_id).ok_or(DispatchError::NotFound(run_id))?;
        let outcome = slot
            .outcome
            .lock()
            .take()
            .ok_or(DispatchError::NotDone(run_id))?;
        slots.remove(&run_id);
        Ok(outcome)
    }

    /// Signal the task to stop and forget its slot.
    ///
    /// Returns whether a slot existed. A task that ignores the signal keeps its
    /// worker until it returns; its outcome is discarded.
    pub fn cancel(&self, run_id: RunId) -> bool {
        match self.slots.lock().remove(&run_id) {
            Some(slot) => {
                slot.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of slots whose task has not finished.
    pub fn in_flight(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| slot.outcome.lock().is_none())
            .count()
    }

    /// Maximum number of concurrently running tasks.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "task panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    fn dispatcher(workers: usize) -> Dispatcher<u32> {
        Dispatcher::new(&DispatcherConfig { workers })
    }

    async fn wait_done<T: Clone + Send + 'static>(dispatcher: &Dispatcher<T>, run_id: RunId) {
        timeout(Duration::from_secs(5), async {
            while !dispatcher.is_done(run_id) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("task did not finish");
    }

    #[tokio::test]
    async fn take_consumes_outcome_exactly_once() {
        let dispatcher = dispatcher(2);
        let id = RunId::new();
        dispatcher.submit(id, |_| async { 7 }).unwrap();
        wait_done(&dispatcher, id).await;

        assert_eq!(dispatcher.peek(id).unwrap(), DispatchOutcome::Completed(7));
        assert_eq!(dispatcher.peek(id).unwrap(), DispatchOutcome::Completed(7));
        assert_eq!(dispatcher.take(id).unwrap(), DispatchOutcome::Completed(7));
        assert_eq!(dispatcher.take(id).unwrap_err(), DispatchError::NotFound(id));
        assert_eq!(dispatcher.peek(id).unwrap_err(), DispatchError::NotFound(id));
        assert!(!dispatcher.is_done(id));
    }

    #[tokio::test]
    async fn running_task_is_not_done() {
        let dispatcher = dispatcher(1);
        let id = RunId::new();
        let (tx, rx) = oneshot::channel::<()>();
        dispatcher
            .submit(id, |_| async move {
                let _ = rx.await;
                1
            })
            .unwrap();

        assert!(!dispatcher.is_done(id));
        assert_eq!(dispatcher.peek(id).unwrap_err(), DispatchError::NotDone(id));
        assert_eq!(dispatcher.take(id).unwrap_err(), DispatchError::NotDone(id));
        assert_eq!(dispatcher.in_flight(), 1);

        tx.send(()).unwrap();
        wait_done(&dispatcher, id).await;
        assert_eq!(dispatcher.take(id).unwrap(), DispatchOutcome::Completed(1));
    }

    #[tokio::test]
    async fn duplicate_submission_is_rejected() {
        let dispatcher = dispatcher(1);
        let id = RunId::new();
        dispatcher.submit(id, |_| async { 1 }).unwrap();
        let err = dispatcher.submit(id, |_| async { 2 }).unwrap_err();
        assert_eq!(err, DispatchError::DuplicateSubmission(id));

        wait_done(&dispatcher, id).await;
        assert_eq!(dispatcher.take(id).unwrap(), DispatchOutcome::Completed(1));
        dispatcher.submit(id, |_| async { 3 }).unwrap();
    }

    #[tokio::test]
    async fn pool_bounds_concurrent_tasks() {
        let dispatcher = dispatcher(2);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let ids: Vec<RunId> = (0..6).map(|_| RunId::new()).collect();

        for id in &ids {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            dispatcher
                .submit(*id, move |_| async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    0
                })
                .unwrap();
        }
        for id in &ids {
            wait_done(&dispatcher, *id).await;
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(dispatcher.capacity(), 2);
    }

    #[tokio::test]
    async fn panicking_task_is_done_with_failure() {
        let dispatcher = dispatcher(1);
        let id = RunId::new();
        dispatcher
            .submit(id, |_| async {
                if true {
                    panic!("driver exploded");
                }
                0
            })
            .unwrap();
        wait_done(&dispatcher, id).await;
        assert_eq!(
            dispatcher.take(id).unwrap(),
            DispatchOutcome::Failed("driver exploded".to_string())
        );
    }

    #[tokio::test]
    async fn cancel_signals_task_and_forgets_slot() {
        let dispatcher = dispatcher(1);
        let id = RunId::new();
        let (seen_tx, seen_rx) = oneshot::channel();
        dispatcher
            .submit(id, |cancel| async move {
                cancel.cancelled().await;
                let _ = seen_tx.send(());
                0
            })
            .unwrap();

        assert!(dispatcher.cancel(id));
        timeout(Duration::from_secs(5), seen_rx)
            .await
            .expect("task did not observe cancellation")
            .unwrap();
        assert!(!dispatcher.cancel(id));
        assert_eq!(dispatcher.peek(id).unwrap_err(), DispatchError::NotFound(id));
    }

    #[tokio::test]
    async fn cancellation_token_wakes_clones() {
        let token = CancellationToken::new();
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let token = token.clone();
                tokio::spawn(async move { token.cancelled().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        let results = timeout(Duration::from_secs(5), futures::future::join_all(handles))
            .await
            .expect("clones did not observe cancellation");
        for result in results {
            result.expect("waiter panicked");
        }
        assert!(token.is_cancelled());
    }
}
