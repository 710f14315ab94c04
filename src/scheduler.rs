//! Periodic task execution.
//!
//! A single driver loop keeps a min-heap of next fire times and hands ticks to
//! one worker per task over a capacity-1 channel. A task therefore never runs
//! concurrently with itself: while it is busy, at most one further tick is
//! queued and any others are coalesced. Different tasks run independently.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn, Instrument};

use crate::errors::SchedulerError;
use crate::sender::ItemSender;
use crate::tasks::TrapperTask;

/// Identifier assigned to a task when it is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Tasks may be added or removed.
    Idle,
    Running,
    /// Terminal.
    Stopped,
}

struct Registration {
    task: Arc<dyn TrapperTask>,
    interval: Duration,
}

struct Slot {
    name: String,
    interval: Duration,
    ticks: mpsc::Sender<()>,
}

struct Running {
    shutdown: watch::Sender<bool>,
    driver: JoinHandle<()>,
}

/// Runs registered tasks at their intervals and forwards produced items.
pub struct Scheduler {
    sender: Arc<dyn ItemSender>,
    tasks: BTreeMap<TaskId, Registration>,
    next_id: u64,
    state: SchedulerState,
    cancelled: Arc<AtomicBool>,
    running: Option<Running>,
}

impl Scheduler {
    pub fn new(sender: Arc<dyn ItemSender>) -> Self {
        Self {
            sender,
            tasks: BTreeMap::new(),
            next_id: 0,
            state: SchedulerState::Idle,
            cancelled: Arc::new(AtomicBool::new(false)),
            running: None,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn add_task(
        &mut self,
        task: Arc<dyn TrapperTask>,
        interval: Duration,
    ) -> Result<TaskId, SchedulerError> {
        self.ensure_idle()?;
        if interval.is_zero() {
            return Err(SchedulerError::InvalidInterval);
        }

        let id = TaskId(self.next_id);
        self.next_id += 1;
        debug!(%id, task = task.name(), ?interval, "task registered");
        self.tasks.insert(id, Registration { task, interval });
        Ok(id)
    }

    /// Returns whether a task with `id` was registered.
    pub fn remove_task(&mut self, id: TaskId) -> Result<bool, SchedulerError> {
        self.ensure_idle()?;
        Ok(self.tasks.remove(&id).is_some())
    }

    /// Spawn the workers and the driver loop. Every task fires immediately,
    /// then once per interval. Must be called within a Tokio runtime.
    pub fn start(&mut self) -> Result<(), SchedulerError> {
        self.ensure_idle()?;

        let now = Instant::now();
        let mut queue = BinaryHeap::with_capacity(self.tasks.len());
        let mut slots = HashMap::with_capacity(self.tasks.len());

        for (&id, registration) in &self.tasks {
            let (ticks, receiver) = mpsc::channel(1);
            tokio::spawn(run_worker(
                Arc::clone(&registration.task),
                Arc::clone(&self.sender),
                receiver,
                Arc::clone(&self.cancelled),
            )
            .in_current_span());
            slots.insert(
                id,
                Slot {
                    name: registration.task.name().to_string(),
                    interval: registration.interval,
                    ticks,
                },
            );
            queue.push(Reverse((now, id)));
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let driver = tokio::spawn(drive(queue, slots, shutdown_rx).in_current_span());
        self.running = Some(Running { shutdown, driver });
        self.state = SchedulerState::Running;
        info!(tasks = self.tasks.len(), "scheduler started");
        Ok(())
    }

    /// Cancel all timers and clear the registry. Executions already in
    /// flight finish, but no new execution starts once this returns.
    pub async fn stop(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);

        if let Some(running) = self.running.take() {
            let _ = running.shutdown.send(true);
            if let Err(e) = running.driver.await {
                error!(error = %e, "scheduler driver terminated abnormally");
            }
        }

        if self.state != SchedulerState::Stopped {
            info!("scheduler stopped");
        }
        self.tasks.clear();
        self.state = SchedulerState::Stopped;
    }

    fn ensure_idle(&self) -> Result<(), SchedulerError> {
        match self.state {
            SchedulerState::Idle => Ok(()),
            state => Err(SchedulerError::NotIdle(state)),
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(running) = self.running.take() {
            let _ = running.shutdown.send(true);
            running.driver.abort();
        }
    }
}

async fn drive(
    mut queue: BinaryHeap<Reverse<(Instant, TaskId)>>,
    slots: HashMap<TaskId, Slot>,
    mut shutdown: watch::Receiver<bool>,
) {
    while let Some(&Reverse((deadline, id))) = queue.peek() {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = sleep_until(deadline) => {}
        }
        queue.pop();

        let Some(slot) = slots.get(&id) else {
            continue;
        };
        match slot.ticks.try_send(()) {
            Ok(()) => {}
            Err(TrySendError::Full(())) => {
                debug!(task = %slot.name, "previous run still pending; tick coalesced");
            }
            Err(TrySendError::Closed(())) => {
                warn!(task = %slot.name, "task worker exited; no longer scheduling it");
                continue;
            }
        }

        let now = Instant::now();
        let mut next = deadline + slot.interval;
        if next <= now {
            next = now + slot.interval;
        }
        queue.push(Reverse((next, id)));
    }
}

async fn run_worker(
    task: Arc<dyn TrapperTask>,
    sender: Arc<dyn ItemSender>,
    mut ticks: mpsc::Receiver<()>,
    cancelled: Arc<AtomicBool>,
) {
    while ticks.recv().await.is_some() {
        if cancelled.load(Ordering::SeqCst) {
            break;
        }

        // Run each tick in its own task so a panicking task is reported
        // instead of taking the worker down with it.
        let run = tokio::spawn(run_tick(Arc::clone(&task), Arc::clone(&sender)).in_current_span());
        if let Err(e) = run.await {
            error!(task = task.name(), error = %e, "task run aborted");
        }
    }
    debug!(task = task.name(), "task worker finished");
}

async fn run_tick(task: Arc<dyn TrapperTask>, sender: Arc<dyn ItemSender>) {
    let items = match task.execute().await {
        Ok(items) => items,
        Err(e) => {
            error!(task = task.name(), error = %e, "task execution failed");
            return;
        }
    };
    if items.is_empty() {
        return;
    }

    if let Err(e) = sender.send_items(&items).await {
        for item in &items {
            error!(
                task = task.name(),
                key = item.key(),
                value = item.value(),
                error = %e,
                "Error sending item"
            );
        }
    }
}
