//! The bounded worker pool that executes actions.
//!
//! Virtual users never execute actions themselves. They queue a [`Task`] into a bounded
//! [`flume`](https://docs.rs/flume) channel and wait for it to be handed back. A fixed
//! number of workers drain the channel, so no more than `concurrency` actions are ever in
//! flight no matter how many users are simulated. When the queue is full, users wait to
//! enqueue.
//!
//! A [`CompletionBarrier`] tracks every queued task until it has been fully processed, so
//! the load test can wait for all submitted work to finish before reporting.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::action::{Action, ActionContext};
use crate::metrics::ResultsMessage;
use crate::session::SessionState;
use crate::throttle::Throttle;
use crate::StampedeError;

/// A request to execute one action with the session of one virtual user.
///
/// The session moves into the task and is sent back over `reply` once the action has
/// executed. A task is executed exactly once and never retried.
pub struct Task {
    pub action: Arc<Action>,
    pub session: SessionState,
    pub user: usize,
    pub iteration: usize,
    pub reply: flume::Sender<SessionState>,
    pub completion: PendingTask,
}

#[derive(Debug, Default)]
struct BarrierState {
    pending: AtomicUsize,
    notify: Notify,
}

/// Counts tasks that have been submitted but not yet fully processed.
#[derive(Clone, Debug, Default)]
pub struct CompletionBarrier {
    state: Arc<BarrierState>,
}
impl CompletionBarrier {
    pub fn new() -> Self {
        CompletionBarrier::default()
    }

    /// Register one pending task. The task is complete when the guard is dropped.
    pub fn register(&self) -> PendingTask {
        self.state.pending.fetch_add(1, Ordering::SeqCst);
        PendingTask {
            state: self.state.clone(),
        }
    }

    pub fn pending(&self) -> usize {
        self.state.pending.load(Ordering::SeqCst)
    }

    /// Wait until no task is pending.
    pub async fn wait(&self) {
        loop {
            // Subscribe before checking so a completion in between isn't missed.
            let notified = self.state.notify.notified();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Completion guard of one task, see [`CompletionBarrier::register`].
#[derive(Debug)]
pub struct PendingTask {
    state: Arc<BarrierState>,
}
impl Drop for PendingTask {
    fn drop(&mut self) {
        if self.state.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.state.notify.notify_waiters();
        }
    }
}

/// Everything the workers share.
pub struct WorkerShared {
    throttle: Throttle,
    context: Arc<ActionContext>,
    results: flume::Sender<ResultsMessage>,
    fatal: flume::Sender<StampedeError>,
    active: AtomicUsize,
    peak: AtomicUsize,
}
impl WorkerShared {
    pub fn new(
        throttle: Throttle,
        context: Arc<ActionContext>,
        results: flume::Sender<ResultsMessage>,
        fatal: flume::Sender<StampedeError>,
    ) -> Self {
        WorkerShared {
            throttle,
            context,
            results,
            fatal,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

/// A fixed number of workers draining a bounded task queue.
pub struct WorkerPool {
    tasks: flume::Sender<Task>,
    stop: flume::Sender<()>,
    workers: Vec<JoinHandle<()>>,
    shared: Arc<WorkerShared>,
}
impl WorkerPool {
    /// Start `concurrency` workers draining a queue holding up to `queue_size` tasks.
    pub fn start(concurrency: usize, queue_size: usize, shared: WorkerShared) -> WorkerPool {
        let (tasks, task_receiver) = flume::bounded(queue_size);
        let (stop, stop_receiver) = flume::unbounded();
        let shared = Arc::new(shared);
        let workers = (1..=concurrency)
            .map(|index| {
                tokio::spawn(worker_main(
                    index,
                    task_receiver.clone(),
                    stop_receiver.clone(),
                    shared.clone(),
                ))
            })
            .collect();
        info!(
            "started {} workers with a queue of {} tasks",
            concurrency, queue_size
        );
        WorkerPool {
            tasks,
            stop,
            workers,
            shared,
        }
    }

    /// A handle to queue tasks with.
    pub fn sender(&self) -> flume::Sender<Task> {
        self.tasks.clone()
    }

    pub fn concurrency(&self) -> usize {
        self.workers.len()
    }

    /// Stop every worker and wait for them to exit, returning the peak concurrency.
    ///
    /// Tasks already queued are executed before the workers honor the stop.
    pub async fn stop(self) -> usize {
        for _ in 0..self.workers.len() {
            if self.stop.send(()).is_err() {
                break;
            }
        }
        for result in futures::future::join_all(self.workers).await {
            if let Err(e) = result {
                warn!("worker failed to exit cleanly: {}", e);
            }
        }
        let peak = self.shared.peak.load(Ordering::SeqCst);
        info!("workers stopped, peak concurrency {}", peak);
        peak
    }
}

async fn worker_main(
    index: usize,
    tasks: flume::Receiver<Task>,
    stop: flume::Receiver<()>,
    shared: Arc<WorkerShared>,
) {
    debug!("worker {} started", index);
    let mut executed: usize = 0;
    loop {
        // Queued tasks are always drained before a stop is honored.
        let task = tokio::select! {
            biased;
            task = tasks.recv_async() => match task {
                Ok(task) => task,
                Err(_) => break,
            },
            _ = stop.recv_async() => break,
        };
        let Task {
            action,
            mut session,
            user,
            iteration,
            reply,
            completion,
        } = task;

        shared.throttle.take().await;
        let active = shared.active.fetch_add(1, Ordering::SeqCst) + 1;
        shared.peak.fetch_max(active, Ordering::SeqCst);
        let result = action
            .execute(&mut session, &shared.context, user, iteration)
            .await;
        shared.active.fetch_sub(1, Ordering::SeqCst);
        executed += 1;

        match result {
            Ok(record) => {
                trace!("worker {} executed {}", index, action);
                if shared
                    .results
                    .send_async(ResultsMessage::Outcome(record))
                    .await
                    .is_err()
                {
                    warn!("results consumer closed, outcome lost");
                }
                if reply.send(session).is_err() {
                    debug!("user {} no longer waiting for its session", user);
                }
            }
            Err(e) => {
                // The user never gets its session back and stops.
                error!("worker {}: {} failed: {}", index, action.title(), e);
                let _ = shared.fatal.send(e);
            }
        }
        drop(completion);
    }
    debug!("worker {} exiting after {} tasks", index, executed);
}
