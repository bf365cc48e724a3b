//! Scheduler background loop.
//!
//! [`TaskScheduler`] is the process-wide registry of live [`TimedTask`]s.
//! It runs in one of two modes:
//!
//! - **fixed**: wake every lateness threshold and fire everything due;
//! - **dynamic**: sleep until the soonest expiry, re-arming whenever a task
//!   is scheduled, unscheduled, or rescheduled.
//!
//! Due tasks are claimed synchronously and then fired on their own tokio
//! tasks, so a slow callback never delays other timers.

use crate::config::{CheckingType, TimedTaskConfig};
use crate::error::Result;
use crate::scheduler::task::{DEFAULT_FAILURE_DELAY, TaskId, TaskState, TimedTask, instant_after};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long the dynamic loop sleeps when no task is registered.
const IDLE_WAKE_SECS: u64 = 3600;

/// Lower bound for the fixed polling interval.
const MIN_POLL_INTERVAL_MS: u64 = 10;

/// Result of one firing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    /// The task was already firing or gravestoned; nothing ran.
    Skipped,
    /// The task fired and was re-armed for the given instant.
    Rescheduled(DateTime<Utc>),
    /// The task fired and was removed.
    Completed,
    /// The callback failed and the task was removed.
    Dropped,
    /// The task was cancelled while firing and has been removed.
    Cancelled,
}

struct SchedulerInner {
    tasks: Mutex<HashMap<TaskId, Arc<TimedTask>>>,
    changed: Notify,
    checking_type: CheckingType,
    lateness_threshold: Duration,
}

/// Shared handle to the timed task registry and dispatch loop.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("checking_type", &self.inner.checking_type)
            .field("lateness_threshold", &self.inner.lateness_threshold)
            .field("tasks", &self.len())
            .finish()
    }
}

impl TaskScheduler {
    /// Create a scheduler with the given checking strategy.
    pub fn new(checking_type: CheckingType, lateness_threshold: Duration) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                tasks: Mutex::new(HashMap::new()),
                changed: Notify::new(),
                checking_type,
                lateness_threshold,
            }),
        }
    }

    pub fn from_config(config: &TimedTaskConfig) -> Self {
        Self::new(
            config.checking_type,
            Duration::from_secs(config.lateness_threshold_secs),
        )
    }

    pub fn checking_type(&self) -> CheckingType {
        self.inner.checking_type
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, Arc<TimedTask>>> {
        self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify_changed(&self) {
        self.inner.changed.notify_one();
    }

    /// Register a task. Gravestoned tasks are ignored.
    pub fn schedule(&self, task: Arc<TimedTask>) {
        if task.is_gravestoned() {
            warn!(task = task.label(), "refusing to schedule a gravestoned task");
            return;
        }
        debug!(task = task.label(), expiry = %task.expiry_time(), "task scheduled");
        self.registry().insert(task.id(), task);
        self.notify_changed();
    }

    /// Cancel and deregister a task. After this returns the task cannot fire.
    ///
    /// Returns `true` if the task was registered.
    pub fn unschedule(&self, task: &TimedTask) -> bool {
        let previous = task.mark_cancelled();
        let removed = self.registry().remove(&task.id()).is_some();
        if removed {
            debug!(task = task.label(), ?previous, "task unscheduled");
            self.notify_changed();
        }
        removed
    }

    pub fn contains(&self, task: &TimedTask) -> bool {
        self.registry().contains_key(&task.id())
    }

    /// Number of registered tasks (including ones currently firing).
    pub fn len(&self) -> usize {
        self.registry().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Soonest expiry among tasks that are waiting to fire.
    pub fn next_expiry(&self) -> Option<DateTime<Utc>> {
        self.registry()
            .values()
            .filter(|t| t.state() == TaskState::Scheduled)
            .map(|t| t.expiry_time())
            .min()
    }

    /// Claim every task due at `now`. Claimed tasks must then be fired.
    fn claim_due(&self, now: DateTime<Utc>) -> Vec<Arc<TimedTask>> {
        self.registry()
            .values()
            .filter(|t| t.expiry_time() <= now)
            .filter(|t| t.claim())
            .cloned()
            .collect()
    }

    /// Fire every task due at `now` concurrently and wait for all of them.
    ///
    /// Returns how many tasks were fired.
    pub async fn check_due_at(&self, now: DateTime<Utc>) -> usize {
        let due = self.claim_due(now);
        let fired = due.len();
        futures_util::future::join_all(due.iter().map(|task| self.fire_claimed(task, true))).await;
        fired
    }

    /// Spawn a firing for every task due at `now` without waiting.
    fn dispatch_due(&self, now: DateTime<Utc>) {
        for task in self.claim_due(now) {
            let scheduler = self.clone();
            tokio::spawn(async move {
                scheduler.fire_claimed(&task, true).await;
            });
        }
    }

    /// Immediately treat `task` as expired.
    ///
    /// With `call_expiry_fn == false` the callback is skipped but the normal
    /// reschedule-or-remove step still runs.
    pub async fn force_expire(&self, task: &Arc<TimedTask>, call_expiry_fn: bool) -> FireOutcome {
        if !task.claim() {
            debug!(task = task.label(), state = ?task.state(), "force expire skipped");
            return FireOutcome::Skipped;
        }
        self.fire_claimed(task, call_expiry_fn).await
    }

    async fn fire_claimed(&self, task: &Arc<TimedTask>, call_expiry_fn: bool) -> FireOutcome {
        let result = if call_expiry_fn {
            task.invoke().await
        } else {
            Ok(false)
        };

        let outcome = match result {
            Ok(_) if task.auto_reschedules() => self.rearm(task, false),
            Ok(_) => {
                self.retire(task);
                FireOutcome::Completed
            }
            Err(e) if e.is_terminal() => {
                info!(task = task.label(), reason = %e, "task owner is gone, retiring task");
                self.retire(task);
                FireOutcome::Dropped
            }
            Err(e) if task.reschedules_on_failure() => {
                warn!(task = task.label(), error = %e, "expiry callback failed, rescheduling");
                self.rearm(task, true)
            }
            Err(e) => {
                error!(task = task.label(), error = %e, "expiry callback failed, dropping task");
                self.retire(task);
                FireOutcome::Dropped
            }
        };
        self.notify_changed();
        outcome
    }

    fn rearm(&self, task: &Arc<TimedTask>, after_failure: bool) -> FireOutcome {
        let failure_delay = task.failure_delay();
        let delay = match (after_failure, failure_delay) {
            (true, Some(delay)) => delay,
            _ => match task.next_delay() {
                Ok(delay) => delay,
                Err(e) if after_failure || task.reschedules_on_failure() => {
                    warn!(task = task.label(), error = %e, "delay generator failed, using failure delay");
                    failure_delay.unwrap_or(DEFAULT_FAILURE_DELAY)
                }
                Err(e) => {
                    error!(task = task.label(), error = %e, "delay generator failed, dropping task");
                    self.retire(task);
                    return FireOutcome::Dropped;
                }
            },
        };

        let expiry = match next_instant(delay) {
            Ok(expiry) => expiry,
            Err(e) => {
                error!(task = task.label(), error = %e, "cannot compute next expiry, dropping task");
                self.retire(task);
                return FireOutcome::Dropped;
            }
        };

        if task.release_to(expiry) {
            debug!(task = task.label(), %expiry, "task rescheduled");
            FireOutcome::Rescheduled(expiry)
        } else {
            self.registry().remove(&task.id());
            debug!(task = task.label(), "task cancelled while firing");
            FireOutcome::Cancelled
        }
    }

    fn retire(&self, task: &TimedTask) {
        task.mark_expired();
        self.registry().remove(&task.id());
    }

    /// Start the scheduler background loop.
    pub fn run(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                checking_type = ?self.inner.checking_type,
                tasks = self.len(),
                "task scheduler started"
            );
            match self.inner.checking_type {
                CheckingType::Fixed => self.run_fixed(cancel).await,
                CheckingType::Dynamic => self.run_dynamic(cancel).await,
            }
            info!("task scheduler stopped");
        })
    }

    async fn run_fixed(&self, cancel: CancellationToken) {
        let period = self
            .inner
            .lateness_threshold
            .max(Duration::from_millis(MIN_POLL_INTERVAL_MS));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => self.dispatch_due(Utc::now()),
            }
        }
    }

    async fn run_dynamic(&self, cancel: CancellationToken) {
        loop {
            let sleep_for = match self.next_expiry() {
                Some(expiry) => (expiry - Utc::now()).to_std().unwrap_or(Duration::ZERO),
                None => Duration::from_secs(IDLE_WAKE_SECS),
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.inner.changed.notified() => {}
                _ = tokio::time::sleep(sleep_for) => self.dispatch_due(Utc::now()),
            }
        }
    }
}

fn next_instant(delay: Duration) -> Result<DateTime<Utc>> {
    instant_after(Utc::now(), delay)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::error::BountyError;
    use crate::scheduler::task::{delay_generator, expiry_fn};
    use chrono::TimeDelta;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn make_scheduler() -> TaskScheduler {
        TaskScheduler::new(CheckingType::Dynamic, Duration::from_millis(50))
    }

    fn counting_task(
        calls: &Arc<AtomicUsize>,
        delay: Duration,
        auto_reschedule: bool,
    ) -> Arc<TimedTask> {
        let counter = Arc::clone(calls);
        TimedTask::builder("counting")
            .expires_in(delay)
            .auto_reschedule(auto_reschedule)
            .callback(expiry_fn(move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }))
            .build()
            .unwrap()
    }

    fn later(secs: i64) -> DateTime<Utc> {
        Utc::now() + TimeDelta::seconds(secs)
    }

    #[tokio::test]
    async fn one_shot_task_fires_once_and_is_removed() {
        let scheduler = make_scheduler();
        let calls = Arc::new(AtomicUsize::new(0));
        let task = counting_task(&calls, Duration::ZERO, false);
        scheduler.schedule(Arc::clone(&task));

        assert_eq!(scheduler.check_due_at(later(1)).await, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!scheduler.contains(&task));
        assert_eq!(task.state(), TaskState::Expired);

        assert_eq!(scheduler.check_due_at(later(1)).await, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tasks_never_fire_early() {
        let scheduler = make_scheduler();
        let calls = Arc::new(AtomicUsize::new(0));
        scheduler.schedule(counting_task(&calls, Duration::from_secs(60), false));

        assert_eq!(scheduler.check_due_at(Utc::now()).await, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.check_due_at(later(61)).await, 1);
    }

    #[tokio::test]
    async fn auto_reschedule_rearms_in_the_future() {
        let scheduler = make_scheduler();
        let calls = Arc::new(AtomicUsize::new(0));
        let task = counting_task(&calls, Duration::from_secs(30), true);
        scheduler.schedule(Arc::clone(&task));

        assert_eq!(scheduler.check_due_at(later(31)).await, 1);
        assert!(scheduler.contains(&task));
        assert_eq!(task.state(), TaskState::Scheduled);
        assert!(task.expiry_time() > Utc::now() + TimeDelta::seconds(25));
    }

    #[tokio::test]
    async fn gravestone_suppresses_fire_check() {
        let scheduler = make_scheduler();
        let calls = Arc::new(AtomicUsize::new(0));
        let task = counting_task(&calls, Duration::ZERO, false);
        scheduler.schedule(Arc::clone(&task));

        let outcome = scheduler.force_expire(&task, false).await;
        assert_eq!(outcome, FireOutcome::Completed);
        assert_eq!(scheduler.check_due_at(later(5)).await, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unschedule_prevents_firing() {
        let scheduler = make_scheduler();
        let calls = Arc::new(AtomicUsize::new(0));
        let task = counting_task(&calls, Duration::ZERO, true);
        scheduler.schedule(Arc::clone(&task));

        assert!(scheduler.unschedule(&task));
        assert!(task.is_gravestoned());
        assert_eq!(scheduler.check_due_at(later(5)).await, 0);
        assert_eq!(scheduler.force_expire(&task, true).await, FireOutcome::Skipped);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failure_with_reschedule_keeps_task_alive() {
        let scheduler = make_scheduler();
        let task = TimedTask::builder("flaky")
            .expires_in(Duration::ZERO)
            .reschedule_on_failure(true)
            .failure_delay(Duration::from_secs(45))
            .callback(expiry_fn(|| async {
                Err(BountyError::Callback("gateway timeout".to_owned()))
            }))
            .build()
            .unwrap();
        scheduler.schedule(Arc::clone(&task));

        assert_eq!(scheduler.check_due_at(later(1)).await, 1);
        assert!(scheduler.contains(&task));
        assert_eq!(task.state(), TaskState::Scheduled);
    }

    #[tokio::test]
    async fn failure_retries_after_failure_delay_not_regular_delay() {
        let scheduler = make_scheduler();
        let task = TimedTask::builder("full division")
            .expires_in(Duration::from_secs(600))
            .auto_reschedule(true)
            .reschedule_on_failure(true)
            .failure_delay(Duration::from_secs(20))
            .callback(expiry_fn(|| async {
                Err(BountyError::Capacity("division is full".to_owned()))
            }))
            .build()
            .unwrap();
        scheduler.schedule(Arc::clone(&task));

        let before = Utc::now();
        let outcome = scheduler.force_expire(&task, true).await;
        let FireOutcome::Rescheduled(at) = outcome else {
            panic!("expected reschedule, got {outcome:?}");
        };
        assert!(at >= before + TimeDelta::seconds(20));
        assert!(at <= Utc::now() + TimeDelta::seconds(21));
    }

    #[tokio::test]
    async fn success_after_failure_returns_to_regular_delay() {
        let scheduler = make_scheduler();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let task = TimedTask::builder("recovering")
            .expires_in(Duration::from_secs(600))
            .auto_reschedule(true)
            .reschedule_on_failure(true)
            .failure_delay(Duration::from_secs(20))
            .callback(expiry_fn(move || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(BountyError::Callback("first attempt fails".to_owned()))
                    } else {
                        Ok(())
                    }
                }
            }))
            .build()
            .unwrap();
        scheduler.schedule(Arc::clone(&task));

        scheduler.force_expire(&task, true).await;
        let outcome = scheduler.force_expire(&task, true).await;
        let FireOutcome::Rescheduled(at) = outcome else {
            panic!("expected reschedule, got {outcome:?}");
        };
        assert!(at > Utc::now() + TimeDelta::seconds(590));
    }

    #[tokio::test]
    async fn failure_without_reschedule_drops_task() {
        let scheduler = make_scheduler();
        let task = TimedTask::builder("fatal")
            .expires_in(Duration::ZERO)
            .auto_reschedule(true)
            .callback(expiry_fn(|| async {
                Err(BountyError::Callback("boom".to_owned()))
            }))
            .build()
            .unwrap();
        scheduler.schedule(Arc::clone(&task));

        let outcome = scheduler.force_expire(&task, true).await;
        assert_eq!(outcome, FireOutcome::Dropped);
        assert!(!scheduler.contains(&task));
        assert!(task.is_gravestoned());
    }

    #[tokio::test]
    async fn terminal_failure_retires_even_retrying_task() {
        let scheduler = make_scheduler();
        let task = TimedTask::builder("orphaned spawner")
            .expires_in(Duration::from_secs(5))
            .auto_reschedule(true)
            .reschedule_on_failure(true)
            .failure_delay(Duration::from_secs(5))
            .callback(expiry_fn(|| async { Err(BountyError::Disabled("guild 1".to_owned())) }))
            .build()
            .unwrap();
        scheduler.schedule(Arc::clone(&task));

        assert_eq!(scheduler.force_expire(&task, true).await, FireOutcome::Dropped);
        assert!(scheduler.is_empty());
        assert!(task.is_gravestoned());
    }

    #[tokio::test]
    async fn failing_generator_falls_back_when_allowed() {
        let scheduler = make_scheduler();
        let task = TimedTask::builder("dynamic")
            .expires_in(Duration::ZERO)
            .delay_generator(delay_generator(|| {
                Err(BountyError::Callback("no route data".to_owned()))
            }))
            .auto_reschedule(true)
            .reschedule_on_failure(true)
            .failure_delay(Duration::from_secs(90))
            .callback(expiry_fn(|| async { Ok(()) }))
            .build()
            .unwrap();
        scheduler.schedule(Arc::clone(&task));

        let outcome = scheduler.force_expire(&task, true).await;
        let FireOutcome::Rescheduled(at) = outcome else {
            panic!("expected reschedule, got {outcome:?}");
        };
        assert!(at > Utc::now() + TimeDelta::seconds(80));
    }

    #[tokio::test]
    async fn failing_generator_drops_strict_task() {
        let scheduler = make_scheduler();
        let task = TimedTask::builder("dynamic")
            .expires_in(Duration::ZERO)
            .delay_generator(delay_generator(|| {
                Err(BountyError::Callback("no route data".to_owned()))
            }))
            .auto_reschedule(true)
            .callback(expiry_fn(|| async { Ok(()) }))
            .build()
            .unwrap();
        scheduler.schedule(Arc::clone(&task));

        assert_eq!(scheduler.force_expire(&task, true).await, FireOutcome::Dropped);
        assert!(scheduler.is_empty());
    }

    #[tokio::test]
    async fn callback_can_cancel_its_own_task() {
        let scheduler = make_scheduler();
        let slot: Arc<Mutex<Option<Arc<TimedTask>>>> = Arc::new(Mutex::new(None));
        let inner_scheduler = scheduler.clone();
        let inner_slot = Arc::clone(&slot);
        let task = TimedTask::builder("self-cancelling")
            .expires_in(Duration::ZERO)
            .auto_reschedule(true)
            .callback(expiry_fn(move || {
                let scheduler = inner_scheduler.clone();
                let slot = Arc::clone(&inner_slot);
                async move {
                    let me = slot.lock().unwrap().clone();
                    if let Some(me) = me {
                        scheduler.unschedule(&me);
                    }
                    Ok(())
                }
            }))
            .build()
            .unwrap();
        *slot.lock().unwrap() = Some(Arc::clone(&task));
        scheduler.schedule(Arc::clone(&task));

        assert_eq!(scheduler.force_expire(&task, true).await, FireOutcome::Cancelled);
        assert!(scheduler.is_empty());
        assert_eq!(task.state(), TaskState::Cancelled);
    }

    #[tokio::test]
    async fn next_expiry_ignores_firing_tasks() {
        let scheduler = make_scheduler();
        let soon = TimedTask::builder("soon").expires_in(Duration::ZERO).build().unwrap();
        let late = TimedTask::builder("late")
            .expires_in(Duration::from_secs(600))
            .build()
            .unwrap();
        scheduler.schedule(Arc::clone(&soon));
        scheduler.schedule(Arc::clone(&late));

        assert_eq!(scheduler.next_expiry(), Some(soon.expiry_time()));
        assert!(soon.claim());
        assert_eq!(scheduler.next_expiry(), Some(late.expiry_time()));
    }

    #[tokio::test]
    async fn dynamic_loop_fires_newly_added_task() {
        let scheduler = make_scheduler();
        let cancel = CancellationToken::new();
        let handle = scheduler.clone().run(cancel.clone());

        // Give the loop time to go idle before the task appears.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let calls = Arc::new(AtomicUsize::new(0));
        scheduler.schedule(counting_task(&calls, Duration::from_millis(30), false));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while calls.load(Ordering::SeqCst) == 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(2), handle).await;
        assert!(result.is_ok(), "scheduler loop should stop on cancel");
    }

    #[tokio::test]
    async fn fixed_loop_fires_recurring_task() {
        let scheduler = TaskScheduler::new(CheckingType::Fixed, Duration::from_millis(20));
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        scheduler.schedule(counting_task(&calls, Duration::from_millis(10), true));
        let handle = scheduler.clone().run(cancel.clone());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while calls.load(Ordering::SeqCst) < 2 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(calls.load(Ordering::SeqCst) >= 2);

        cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }
}
