//! Reschedulable deferred work bound to the internal scheduler
//!
//! A [`RecurringTask`] only tracks *when* a task runs. What the task does is
//! selected by its [`TaskName`] in the session, so every task shares one
//! scheduling implementation and keeps its own timer and backoff state.
//!
//! A task is either idle or scheduled. [`RecurringTask::ensure_scheduled`]
//! coalesces triggers: while a run is pending further triggers are no-ops.
//! After the policy runs, [`RecurringTask::finish_run`] either re-arms the
//! task with its retry delay or returns it to idle and resets its backoff.

use core::fmt;
use core::time::Duration;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backoff::{BackoffState, ExponentialBackoffGenerator};
use crate::resources::Scheduler;
use crate::smearer::Smearer;
use crate::types::Timestamp;

/// Identity of each recurring task the client runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TaskName {
    AcquireToken,
    RegSyncHeartbeat,
    PersistentWrite,
    Heartbeat,
    Batching,
    InitialPersistentHeartbeat,
}

impl TaskName {
    pub const ALL: [TaskName; 6] = [
        TaskName::AcquireToken,
        TaskName::RegSyncHeartbeat,
        TaskName::PersistentWrite,
        TaskName::Heartbeat,
        TaskName::Batching,
        TaskName::InitialPersistentHeartbeat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskName::AcquireToken => "AcquireToken",
            TaskName::RegSyncHeartbeat => "RegSyncHeartbeat",
            TaskName::PersistentWrite => "PersistentWrite",
            TaskName::Heartbeat => "Heartbeat",
            TaskName::Batching => "Batching",
            TaskName::InitialPersistentHeartbeat => "InitialPersistentHeartbeat",
        }
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling collaborators a task needs to arm itself
pub struct TaskContext<'a> {
    pub scheduler: &'a dyn Scheduler,
    pub smearer: &'a mut Smearer,
}

/// Marshalled form of a [`RecurringTask`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringTaskState {
    pub is_scheduled: bool,
    /// Time the pending run was armed
    pub scheduled_at_ms: u64,
    /// Delay the pending run was armed with
    pub last_delay_ms: u64,
    pub initial_delay_ms: u64,
    pub backoff: Option<BackoffState>,
}

/// Descriptor and idle/scheduled state of one named task
#[derive(Debug, Clone)]
pub struct RecurringTask {
    name: TaskName,
    initial_delay: Duration,
    timeout_delay: Duration,
    backoff: Option<ExponentialBackoffGenerator>,
    is_scheduled: bool,
    scheduled_at: Timestamp,
    last_delay: Duration,
}

impl RecurringTask {
    pub fn new(
        name: TaskName,
        initial_delay: Duration,
        timeout_delay: Duration,
        backoff: Option<ExponentialBackoffGenerator>,
    ) -> Self {
        Self {
            name,
            initial_delay,
            timeout_delay,
            backoff,
            is_scheduled: false,
            scheduled_at: Timestamp::default(),
            last_delay: Duration::ZERO,
        }
    }

    pub fn name(&self) -> TaskName {
        self.name
    }

    pub fn is_scheduled(&self) -> bool {
        self.is_scheduled
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn set_initial_delay(&mut self, delay: Duration) {
        self.initial_delay = delay;
    }

    pub fn backoff(&self) -> Option<&ExponentialBackoffGenerator> {
        self.backoff.as_ref()
    }

    /// Arm the task with its (smeared) initial delay unless a run is already pending.
    /// Returns whether a new run was armed.
    pub fn ensure_scheduled(&mut self, ctx: &mut TaskContext<'_>, reason: &str) -> bool {
        if self.is_scheduled {
            return false;
        }
        let delay = ctx.smearer.smeared(self.initial_delay);
        debug!("[{}] Scheduling in {:?}: {}", self.name, delay, reason);
        self.arm(ctx.scheduler, delay);
        true
    }

    /// Arm the task for a policy retry: timeout plus the next backoff delay,
    /// or plus the smeared initial delay when the task has no backoff
    pub fn ensure_retry(&mut self, ctx: &mut TaskContext<'_>) -> bool {
        if self.is_scheduled {
            return false;
        }
        let extra = match self.backoff.as_mut() {
            Some(backoff) => backoff.next_delay(ctx.smearer),
            None => ctx.smearer.smeared(self.initial_delay),
        };
        let delay = self.timeout_delay + extra;
        debug!("[{}] Retrying in {:?}", self.name, delay);
        self.arm(ctx.scheduler, delay);
        true
    }

    /// Arm the task with an exact delay, as when re-arming a restored task
    pub fn rearm(&mut self, scheduler: &dyn Scheduler, delay: Duration) {
        self.arm(scheduler, delay);
    }

    /// Claim a fired timer. Returns false for a firing that no pending run
    /// accounts for, which must be ignored.
    pub fn begin_run(&mut self) -> bool {
        if !self.is_scheduled {
            return false;
        }
        self.is_scheduled = false;
        true
    }

    /// Apply the policy's reschedule decision
    pub fn finish_run(&mut self, ctx: &mut TaskContext<'_>, reschedule: bool) {
        if reschedule {
            self.ensure_retry(ctx);
        } else if let Some(backoff) = self.backoff.as_mut() {
            backoff.reset();
        }
    }

    /// Time left until the pending run is due, zero if the deadline passed
    pub fn remaining_delay(&self, now: Timestamp) -> Duration {
        let deadline = self.scheduled_at + self.last_delay;
        deadline.duration_since(now)
    }

    pub fn marshal(&self) -> RecurringTaskState {
        RecurringTaskState {
            is_scheduled: self.is_scheduled,
            scheduled_at_ms: self.scheduled_at.as_millis(),
            last_delay_ms: self.last_delay.as_millis() as u64,
            initial_delay_ms: self.initial_delay.as_millis() as u64,
            backoff: self.backoff.as_ref().map(ExponentialBackoffGenerator::marshal),
        }
    }

    /// Adopt the pending-run bookkeeping of a marshalled task. The task is
    /// not armed; the caller re-arms it with [`Self::remaining_delay`].
    pub fn restore_schedule(&mut self, state: &RecurringTaskState) {
        self.is_scheduled = state.is_scheduled;
        self.scheduled_at = Timestamp::new(state.scheduled_at_ms);
        self.last_delay = Duration::from_millis(state.last_delay_ms);
    }

    fn arm(&mut self, scheduler: &dyn Scheduler, delay: Duration) {
        self.is_scheduled = true;
        self.scheduled_at = scheduler.now();
        self.last_delay = delay;
        scheduler.schedule(delay, self.name);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;
    use std::sync::Mutex;

    struct FakeScheduler {
        now: u64,
        scheduled: Mutex<Vec<(Duration, TaskName)>>,
    }

    impl FakeScheduler {
        fn at(now: u64) -> Self {
            Self {
                now,
                scheduled: Mutex::new(Vec::new()),
            }
        }

        fn scheduled(&self) -> Vec<(Duration, TaskName)> {
            self.scheduled.lock().unwrap().clone()
        }
    }

    impl Scheduler for FakeScheduler {
        fn schedule(&self, delay: Duration, task: TaskName) {
            self.scheduled.lock().unwrap().push((delay, task));
        }

        fn now(&self) -> Timestamp {
            Timestamp::new(self.now)
        }

        fn is_running_on_thread(&self) -> bool {
            true
        }
    }

    fn smearer() -> Smearer {
        Smearer::new(Box::new(ChaCha8Rng::seed_from_u64(3)), 0)
    }

    fn backoff_task() -> RecurringTask {
        RecurringTask::new(
            TaskName::AcquireToken,
            Duration::ZERO,
            Duration::from_millis(1_000),
            Some(ExponentialBackoffGenerator::new(Duration::from_millis(1_000), 4, None)),
        )
    }

    #[test]
    fn test_ensure_scheduled_is_idempotent() {
        let scheduler = FakeScheduler::at(0);
        let mut smearer = smearer();
        let mut ctx = TaskContext {
            scheduler: &scheduler,
            smearer: &mut smearer,
        };
        let mut task = RecurringTask::new(
            TaskName::Heartbeat,
            Duration::from_millis(5_000),
            Duration::ZERO,
            None,
        );

        assert!(task.ensure_scheduled(&mut ctx, "first"));
        assert!(!task.ensure_scheduled(&mut ctx, "second"));
        assert_eq!(
            scheduler.scheduled(),
            vec![(Duration::from_millis(5_000), TaskName::Heartbeat)]
        );
    }

    #[test]
    fn test_retry_uses_timeout_plus_backoff() {
        let scheduler = FakeScheduler::at(0);
        let mut smearer = smearer();
        let mut ctx = TaskContext {
            scheduler: &scheduler,
            smearer: &mut smearer,
        };
        let mut task = backoff_task();

        task.ensure_scheduled(&mut ctx, "start");
        for _ in 0..3 {
            assert!(task.begin_run());
            task.finish_run(&mut ctx, true);
        }

        let delays: Vec<u64> = scheduler
            .scheduled()
            .iter()
            .map(|(delay, _)| delay.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![0, 2_000, 3_000, 5_000]);
    }

    #[test]
    fn test_false_return_resets_backoff() {
        let scheduler = FakeScheduler::at(0);
        let mut smearer = smearer();
        let mut ctx = TaskContext {
            scheduler: &scheduler,
            smearer: &mut smearer,
        };
        let mut task = backoff_task();

        task.ensure_scheduled(&mut ctx, "start");
        task.begin_run();
        task.finish_run(&mut ctx, true);
        task.begin_run();
        task.finish_run(&mut ctx, false);

        assert!(!task.is_scheduled());
        assert_eq!(
            task.backoff().map(|b| b.base_delay()),
            Some(Duration::from_millis(1_000))
        );
    }

    #[test]
    fn test_unexpected_firing_is_rejected() {
        let mut task = backoff_task();
        assert!(!task.begin_run());
    }

    #[test]
    fn test_remaining_delay_after_restore() {
        let scheduler = FakeScheduler::at(10_000);
        let mut smearer = smearer();
        let mut ctx = TaskContext {
            scheduler: &scheduler,
            smearer: &mut smearer,
        };
        let mut task = RecurringTask::new(
            TaskName::Heartbeat,
            Duration::from_millis(5_000),
            Duration::ZERO,
            None,
        );
        task.ensure_scheduled(&mut ctx, "start");
        let state = task.marshal();

        let mut restored = RecurringTask::new(
            TaskName::Heartbeat,
            Duration::from_millis(5_000),
            Duration::ZERO,
            None,
        );
        restored.restore_schedule(&state);
        assert!(restored.is_scheduled());
        assert_eq!(
            restored.remaining_delay(Timestamp::new(12_000)),
            Duration::from_millis(3_000)
        );
        assert_eq!(restored.remaining_delay(Timestamp::new(20_000)), Duration::ZERO);
    }
}
