//! Deferred and background work.
//!
//! Jobs are futures queued with an optional delay. A driver task owns a
//! [`DelayQueue`] and spawns each job on the runtime once its deadline passes.
//! Jobs can be cancelled while they wait and aborted while they run.

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::time::{delay_queue, DelayQueue};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler is already running")]
    AlreadyStarted,
    #[error("scheduler has been shut down")]
    ShutDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

type Job = BoxFuture<'static, ()>;

enum Command {
    Schedule { id: TaskId, delay: Duration, job: Job },
    Cancel(TaskId),
}

#[derive(Default)]
struct Tasks {
    waiting: Mutex<HashSet<TaskId>>,
    running: Mutex<HashMap<TaskId, AbortHandle>>,
}

impl Tasks {
    fn launch(self: &Arc<Self>, id: TaskId, job: Job) {
        let tasks = Arc::clone(self);
        let mut running = lock(&self.running);
        let handle = tokio::spawn(async move {
            job.await;
            lock(&tasks.running).remove(&id);
        });
        running.insert(id, handle.abort_handle());
    }
}

pub struct Scheduler {
    tasks: Arc<Tasks>,
    commands: mpsc::UnboundedSender<Command>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("waiting", &lock(&self.tasks.waiting).len())
            .field("running", &lock(&self.tasks.running).len())
            .field("shut_down", &self.shut_down.load(Ordering::SeqCst))
            .finish()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Jobs may be queued right away; they run once [`Scheduler::start`] is called.
    pub fn new() -> Self {
        let (commands, inbox) = mpsc::unbounded_channel();
        Self {
            tasks: Arc::new(Tasks::default()),
            commands,
            inbox: Mutex::new(Some(inbox)),
            driver: Mutex::new(None),
            next_id: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn start(&self, runtime: &Handle) -> Result<(), SchedulerError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(SchedulerError::ShutDown);
        }
        let inbox = lock(&self.inbox)
            .take()
            .ok_or(SchedulerError::AlreadyStarted)?;
        let driver = runtime.spawn(drive(Arc::clone(&self.tasks), inbox));
        *lock(&self.driver) = Some(driver);
        tracing::debug!("scheduler started");
        Ok(())
    }

    pub fn schedule_now<F>(&self, job: F) -> Result<TaskId, SchedulerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.schedule_after(Duration::ZERO, job)
    }

    pub fn schedule_after<F>(&self, delay: Duration, job: F) -> Result<TaskId, SchedulerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(SchedulerError::ShutDown);
        }
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.tasks.waiting).insert(id);
        let command = Command::Schedule {
            id,
            delay,
            job: job.boxed(),
        };
        if self.commands.send(command).is_err() {
            lock(&self.tasks.waiting).remove(&id);
            return Err(SchedulerError::ShutDown);
        }
        Ok(id)
    }

    /// Cancel a waiting job or abort a running one. Returns `false` when the
    /// job already finished or was cancelled before.
    pub fn cancel(&self, id: TaskId) -> bool {
        if lock(&self.tasks.waiting).remove(&id) {
            let _ = self.commands.send(Command::Cancel(id));
            return true;
        }
        match lock(&self.tasks.running).remove(&id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Number of jobs waiting for their deadline or still running.
    pub fn pending(&self) -> usize {
        lock(&self.tasks.waiting).len() + lock(&self.tasks.running).len()
    }

    /// Drop waiting jobs, abort running ones and stop the driver.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        lock(&self.tasks.waiting).clear();
        for (_, handle) in lock(&self.tasks.running).drain() {
            handle.abort();
        }
        if let Some(driver) = lock(&self.driver).take() {
            driver.abort();
        }
        tracing::debug!("scheduler shut down");
    }
}

async fn drive(tasks: Arc<Tasks>, mut inbox: mpsc::UnboundedReceiver<Command>) {
    let mut timers: DelayQueue<TaskId> = DelayQueue::new();
    let mut keys: HashMap<TaskId, delay_queue::Key> = HashMap::new();
    let mut jobs: HashMap<TaskId, Job> = HashMap::new();

    loop {
        tokio::select! {
            command = inbox.recv() => match command {
                Some(Command::Schedule { id, delay, job }) => {
                    keys.insert(id, timers.insert(id, delay));
                    jobs.insert(id, job);
                }
                Some(Command::Cancel(id)) => {
                    if let Some(key) = keys.remove(&id) {
                        timers.remove(&key);
                    }
                    jobs.remove(&id);
                }
                None => break,
            },
            Some(expired) = timers.next(), if !timers.is_empty() => {
                let id = expired.into_inner();
                keys.remove(&id);
                let Some(job) = jobs.remove(&id) else { continue };
                if lock(&tasks.waiting).remove(&id) {
                    tasks.launch(id, job);
                }
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;
    use tokio::time::Instant;

    fn started() -> Scheduler {
        let scheduler = Scheduler::new();
        scheduler.start(&Handle::current()).unwrap();
        scheduler
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_job_runs_after_its_deadline() {
        let scheduler = started();
        let begin = Instant::now();
        let (tx, rx) = oneshot::channel();
        scheduler
            .schedule_after(Duration::from_secs(10), async move {
                let _ = tx.send(Instant::now());
            })
            .unwrap();

        let ran_at = rx.await.unwrap();
        assert!(ran_at - begin >= Duration::from_secs(10));
    }

    #[tokio::test]
    async fn jobs_queued_before_start_run_once_started() {
        let scheduler = Scheduler::new();
        let (tx, rx) = oneshot::channel();
        scheduler
            .schedule_now(async move {
                let _ = tx.send(());
            })
            .unwrap();
        scheduler.start(&Handle::current()).unwrap();
        rx.await.unwrap();
        assert!(matches!(
            scheduler.start(&Handle::current()),
            Err(SchedulerError::AlreadyStarted)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_job_never_runs() {
        let scheduler = started();
        let (tx, mut rx) = oneshot::channel::<()>();
        let id = scheduler
            .schedule_after(Duration::from_secs(5), async move {
                let _ = tx.send(());
            })
            .unwrap();
        assert_eq!(scheduler.pending(), 1);
        assert!(scheduler.cancel(id));
        assert!(!scheduler.cancel(id));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn running_job_can_be_aborted() {
        let scheduler = started();
        let (started_tx, started_rx) = oneshot::channel();
        let id = scheduler
            .schedule_now(async move {
                let _ = started_tx.send(());
                std::future::pending::<()>().await;
            })
            .unwrap();
        started_rx.await.unwrap();
        assert!(scheduler.cancel(id));
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_work() {
        let scheduler = started();
        scheduler
            .schedule_after(Duration::from_secs(60), async {})
            .unwrap();
        scheduler.shutdown();
        scheduler.shutdown();
        assert_eq!(scheduler.pending(), 0);
        assert!(matches!(
            scheduler.schedule_now(async {}),
            Err(SchedulerError::ShutDown)
        ));
    }
}
