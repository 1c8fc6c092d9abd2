//! The client's six recurring tasks and their scheduling policies
//!
//! | Task | Initial delay | Timeout | Backoff |
//! |---|---|---|---|
//! | AcquireToken | 0 | network timeout | from network timeout |
//! | RegSyncHeartbeat | network timeout | network timeout | from network timeout |
//! | PersistentWrite | 0 | write retry delay | from write retry delay |
//! | Heartbeat | heartbeat interval | 0 | none |
//! | Batching | batching delay | 0 | none |
//! | InitialPersistentHeartbeat | computed at startup | 0 | none |
//!
//! The task bodies live with the session, which owns the state they read.

use core::time::Duration;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::backoff::ExponentialBackoffGenerator;
use crate::config::ClientConfig;
use crate::recurring_task::{RecurringTask, RecurringTaskState, TaskContext, TaskName};
use crate::resources::Scheduler;
use crate::smearer::Smearer;
use crate::types::Timestamp;

/// Marshalled state of every task, keyed by name
pub type TaskStates = BTreeMap<TaskName, RecurringTaskState>;

/// Delay before the one-off heartbeat sent after restarting from persisted state
///
/// With offline delivery the server may still hold messages for this client,
/// so the client waits out the rest of the heartbeat interval that was
/// running when it last sent, but never less than the configured minimum.
pub fn initial_persistent_heartbeat_delay(
    config: &ClientConfig,
    now: Timestamp,
    last_send_time: Timestamp,
) -> Duration {
    let minimum = config.initial_persistent_heartbeat_delay();
    if !config.channel_supports_offline_delivery {
        return minimum;
    }
    let heartbeat = config.heartbeat_interval();
    if last_send_time > now {
        warn!(
            "Last message send time {} is in the future (now {})",
            last_send_time, now
        );
        return minimum;
    }
    let elapsed = now.duration_since(last_send_time);
    if elapsed >= heartbeat {
        return minimum;
    }
    (heartbeat - elapsed).max(minimum)
}

/// Owner of the six [`RecurringTask`]s and the collaborators that arm them
pub struct TaskSet {
    acquire_token: RecurringTask,
    reg_sync_heartbeat: RecurringTask,
    persistent_write: RecurringTask,
    heartbeat: RecurringTask,
    batching: RecurringTask,
    initial_persistent_heartbeat: RecurringTask,
    scheduler: Arc<dyn Scheduler>,
    smearer: Smearer,
}

impl TaskSet {
    /// Build the tasks from `config`, resuming backoff and initial delays
    /// from `saved` where a task was marshalled. Nothing is armed.
    pub fn new(
        config: &ClientConfig,
        scheduler: Arc<dyn Scheduler>,
        smearer: Smearer,
        saved: Option<&TaskStates>,
    ) -> Self {
        let state = |name: TaskName| saved.and_then(|states| states.get(&name));
        let backoff = |name: TaskName, initial: Duration| {
            Some(ExponentialBackoffGenerator::new(
                initial,
                config.max_exponential_backoff_factor,
                state(name).and_then(|s| s.backoff),
            ))
        };
        let network_timeout = config.network_timeout_delay();
        let initial_heartbeat_delay = state(TaskName::InitialPersistentHeartbeat)
            .map(|s| Duration::from_millis(s.initial_delay_ms))
            .unwrap_or_else(|| config.initial_persistent_heartbeat_delay());

        let mut tasks = Self {
            acquire_token: RecurringTask::new(
                TaskName::AcquireToken,
                Duration::ZERO,
                network_timeout,
                backoff(TaskName::AcquireToken, network_timeout),
            ),
            reg_sync_heartbeat: RecurringTask::new(
                TaskName::RegSyncHeartbeat,
                network_timeout,
                network_timeout,
                backoff(TaskName::RegSyncHeartbeat, network_timeout),
            ),
            persistent_write: RecurringTask::new(
                TaskName::PersistentWrite,
                Duration::ZERO,
                config.write_retry_delay(),
                backoff(TaskName::PersistentWrite, config.write_retry_delay()),
            ),
            heartbeat: RecurringTask::new(
                TaskName::Heartbeat,
                config.heartbeat_interval(),
                Duration::ZERO,
                None,
            ),
            batching: RecurringTask::new(
                TaskName::Batching,
                config.protocol_handler.batching_delay(),
                Duration::ZERO,
                None,
            ),
            initial_persistent_heartbeat: RecurringTask::new(
                TaskName::InitialPersistentHeartbeat,
                initial_heartbeat_delay,
                Duration::ZERO,
                None,
            ),
            scheduler,
            smearer,
        };

        if let Some(states) = saved {
            for (name, state) in states {
                tasks.get_mut(*name).restore_schedule(state);
            }
        }
        tasks
    }

    pub fn get(&self, name: TaskName) -> &RecurringTask {
        match name {
            TaskName::AcquireToken => &self.acquire_token,
            TaskName::RegSyncHeartbeat => &self.reg_sync_heartbeat,
            TaskName::PersistentWrite => &self.persistent_write,
            TaskName::Heartbeat => &self.heartbeat,
            TaskName::Batching => &self.batching,
            TaskName::InitialPersistentHeartbeat => &self.initial_persistent_heartbeat,
        }
    }

    pub fn get_mut(&mut self, name: TaskName) -> &mut RecurringTask {
        match name {
            TaskName::AcquireToken => &mut self.acquire_token,
            TaskName::RegSyncHeartbeat => &mut self.reg_sync_heartbeat,
            TaskName::PersistentWrite => &mut self.persistent_write,
            TaskName::Heartbeat => &mut self.heartbeat,
            TaskName::Batching => &mut self.batching,
            TaskName::InitialPersistentHeartbeat => &mut self.initial_persistent_heartbeat,
        }
    }

    pub fn is_scheduled(&self, name: TaskName) -> bool {
        self.get(name).is_scheduled()
    }

    pub fn ensure_scheduled(&mut self, name: TaskName, reason: &str) -> bool {
        let (task, mut ctx) = self.split(name);
        task.ensure_scheduled(&mut ctx, reason)
    }

    /// Claim a [`crate::ClientEvent::TaskFired`] for `name`
    pub fn begin_run(&mut self, name: TaskName) -> bool {
        self.get_mut(name).begin_run()
    }

    pub fn finish_run(&mut self, name: TaskName, reschedule: bool) {
        let (task, mut ctx) = self.split(name);
        task.finish_run(&mut ctx, reschedule);
    }

    /// Re-arm every task restored as scheduled, with the time left until its
    /// original deadline
    pub fn rearm_restored(&mut self) {
        let now = self.scheduler.now();
        for name in TaskName::ALL {
            let task = self.get(name);
            if task.is_scheduled() {
                let delay = task.remaining_delay(now);
                debug!("[{}] Re-arming restored task in {:?}", name, delay);
                let scheduler = Arc::clone(&self.scheduler);
                self.get_mut(name).rearm(scheduler.as_ref(), delay);
            }
        }
    }

    /// Random perturbation for delays computed outside a task
    pub fn smeared(&mut self, delay: Duration) -> Duration {
        self.smearer.smeared(delay)
    }

    pub fn marshal(&self) -> TaskStates {
        TaskName::ALL
            .iter()
            .map(|name| (*name, self.get(*name).marshal()))
            .collect()
    }

    fn split(&mut self, name: TaskName) -> (&mut RecurringTask, TaskContext<'_>) {
        let task = match name {
            TaskName::AcquireToken => &mut self.acquire_token,
            TaskName::RegSyncHeartbeat => &mut self.reg_sync_heartbeat,
            TaskName::PersistentWrite => &mut self.persistent_write,
            TaskName::Heartbeat => &mut self.heartbeat,
            TaskName::Batching => &mut self.batching,
            TaskName::InitialPersistentHeartbeat => &mut self.initial_persistent_heartbeat,
        };
        let ctx = TaskContext {
            scheduler: self.scheduler.as_ref(),
            smearer: &mut self.smearer,
        };
        (task, ctx)
    }
}

/// Handle through which the protocol handler requests a batch flush
///
/// Each call coalesces into the single pending run of the Batching task.
pub struct BatchingTrigger<'a> {
    tasks: &'a mut TaskSet,
}

impl<'a> BatchingTrigger<'a> {
    pub fn new(tasks: &'a mut TaskSet) -> Self {
        Self { tasks }
    }

    pub fn ensure_scheduled(&mut self, reason: &str) {
        self.tasks.ensure_scheduled(TaskName::Batching, reason);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
