//! Timed task definitions.
//!
//! A [`TimedTask`] is one deferred unit of work: an absolute expiry instant,
//! an async expiry callback, and a reschedule policy. Tasks with a
//! [`Reschedule::Dynamic`] policy ask a [`DelayGenerator`] for every new
//! delay instead of reusing a fixed interval.
//!
//! Tasks are shared as `Arc<TimedTask>` between their owner (a division, an
//! escaped bounty) and the [`TaskScheduler`](super::TaskScheduler). Their
//! lifecycle is an atomic [`TaskState`]; firing must first claim the task
//! by moving it from `Scheduled` to `Firing`, so a cancelled task can never
//! run its callback and a task can never fire twice at once.

use crate::error::{BountyError, Result};
use chrono::{DateTime, TimeDelta, Utc};
use futures_util::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Unique identifier of a timed task within the process.
pub type TaskId = u64;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Retry delay for a failed generator when the task names none.
pub(crate) const DEFAULT_FAILURE_DELAY: Duration = Duration::from_secs(60);

/// Async expiry callback. Returns `Err` to report failure to the scheduler.
pub type ExpiryFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Produces the delay until a dynamic task's next expiry.
pub type DelayGenerator = Arc<dyn Fn() -> Result<Duration> + Send + Sync>;

/// Wrap an async closure as an [`ExpiryFn`].
pub fn expiry_fn<F, Fut>(f: F) -> ExpiryFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move || -> BoxFuture<'static, Result<()>> { Box::pin(f()) })
}

/// Wrap a closure as a [`DelayGenerator`].
pub fn delay_generator<F>(f: F) -> DelayGenerator
where
    F: Fn() -> Result<Duration> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Add a std duration to an instant, failing on overflow.
pub fn instant_after(start: DateTime<Utc>, delay: Duration) -> Result<DateTime<Utc>> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| start.checked_add_signed(delta))
        .ok_or_else(|| BountyError::InvalidTask(format!("delay {delay:?} is out of range")))
}

/// Lifecycle state of a timed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Waiting for its expiry instant.
    Scheduled = 0,
    /// Claimed by the scheduler; the callback may be running.
    Firing = 1,
    /// Cancelled. The callback must never run again.
    Cancelled = 2,
    /// Fired and not rescheduled.
    Expired = 3,
}

impl TaskState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Scheduled,
            1 => Self::Firing,
            2 => Self::Cancelled,
            _ => Self::Expired,
        }
    }

    /// Returns `true` for states the task can never leave.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Expired)
    }
}

/// How a task computes its next expiry after firing.
#[derive(Clone)]
pub enum Reschedule {
    /// Reuse the same delay every time.
    Fixed(Duration),
    /// Ask the generator for each new delay.
    Dynamic(DelayGenerator),
}

impl fmt::Debug for Reschedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(d) => f.debug_tuple("Fixed").field(d).finish(),
            Self::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// A deferred, optionally recurring callback.
pub struct TimedTask {
    id: TaskId,
    label: String,
    expiry: Mutex<DateTime<Utc>>,
    state: AtomicU8,
    reschedule: Option<Reschedule>,
    auto_reschedule: bool,
    reschedule_on_failure: bool,
    failure_delay: Option<Duration>,
    callback: Option<ExpiryFn>,
}

impl fmt::Debug for TimedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimedTask")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("expiry", &self.expiry_time())
            .field("state", &self.state())
            .field("reschedule", &self.reschedule)
            .field("auto_reschedule", &self.auto_reschedule)
            .finish_non_exhaustive()
    }
}

impl TimedTask {
    /// Start building a task. `label` is used in logs only.
    pub fn builder(label: impl Into<String>) -> TimedTaskBuilder {
        TimedTaskBuilder::new(label)
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Current absolute expiry instant.
    pub fn expiry_time(&self) -> DateTime<Utc> {
        *self.expiry.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Returns `true` once the task has been cancelled or has expired for good.
    pub fn is_gravestoned(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn auto_reschedules(&self) -> bool {
        self.auto_reschedule
    }

    pub fn reschedules_on_failure(&self) -> bool {
        self.reschedule_on_failure
    }

    /// Retry delay after a failure, if one was configured.
    pub fn failure_delay(&self) -> Option<Duration> {
        self.failure_delay
    }

    /// Returns `true` if the task is waiting and its expiry has passed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state() == TaskState::Scheduled && self.expiry_time() <= now
    }

    /// Time remaining until expiry, saturating at zero.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expiry_time() - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Claim the task for firing. Fails if it is already firing or gravestoned.
    pub(crate) fn claim(&self) -> bool {
        self.state
            .compare_exchange(
                TaskState::Scheduled as u8,
                TaskState::Firing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Store a new expiry and return the task to `Scheduled`.
    ///
    /// Returns `false` if the task was cancelled while firing.
    pub(crate) fn release_to(&self, expiry: DateTime<Utc>) -> bool {
        *self.expiry.lock().unwrap_or_else(|e| e.into_inner()) = expiry;
        self.state
            .compare_exchange(
                TaskState::Firing as u8,
                TaskState::Scheduled as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Set the gravestone. Returns the state the task was in.
    pub(crate) fn mark_cancelled(&self) -> TaskState {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if TaskState::from_u8(current).is_terminal() {
                return TaskState::from_u8(current);
            }
            match self.state.compare_exchange_weak(
                current,
                TaskState::Cancelled as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(prev) => return TaskState::from_u8(prev),
                Err(actual) => current = actual,
            }
        }
    }

    /// Mark a fired task as finished. A concurrent cancellation wins.
    pub(crate) fn mark_expired(&self) {
        let _ = self.state.compare_exchange(
            TaskState::Firing as u8,
            TaskState::Expired as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Delay until the next expiry according to the reschedule policy.
    pub(crate) fn next_delay(&self) -> Result<Duration> {
        match &self.reschedule {
            Some(Reschedule::Fixed(delay)) => Ok(*delay),
            Some(Reschedule::Dynamic(generator)) => generator(),
            None => Err(BountyError::InvalidTask(format!(
                "task '{}' has no reschedule delay",
                self.label
            ))),
        }
    }

    /// Run the expiry callback if the task is still claimed.
    ///
    /// The gravestone is checked immediately before the call, so a task
    /// cancelled after being selected for firing never runs. Returns whether
    /// the callback ran.
    pub(crate) async fn invoke(&self) -> Result<bool> {
        let Some(callback) = self.callback.clone() else {
            return Ok(false);
        };
        if self.state() != TaskState::Firing {
            return Ok(false);
        }
        callback().await?;
        Ok(true)
    }
}

/// Builder for [`TimedTask`].
pub struct TimedTaskBuilder {
    label: String,
    expires_at: Option<DateTime<Utc>>,
    expires_in: Option<Duration>,
    delay_generator: Option<DelayGenerator>,
    auto_reschedule: bool,
    reschedule_on_failure: bool,
    failure_delay: Option<Duration>,
    callback: Option<ExpiryFn>,
}

impl TimedTaskBuilder {
    fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            expires_at: None,
            expires_in: None,
            delay_generator: None,
            auto_reschedule: false,
            reschedule_on_failure: false,
            failure_delay: None,
            callback: None,
        }
    }

    /// Expire at an absolute instant. Instants in the past expire on the next check.
    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    /// Expire `delay` from now. Fixed-interval tasks reuse this delay.
    pub fn expires_in(mut self, delay: Duration) -> Self {
        self.expires_in = Some(delay);
        self
    }

    /// Compute every reschedule delay with `generator`.
    pub fn delay_generator(mut self, generator: DelayGenerator) -> Self {
        self.delay_generator = Some(generator);
        self
    }

    /// Re-arm after every successful firing.
    pub fn auto_reschedule(mut self, enabled: bool) -> Self {
        self.auto_reschedule = enabled;
        self
    }

    /// Re-arm after a failed callback instead of dropping the task.
    pub fn reschedule_on_failure(mut self, enabled: bool) -> Self {
        self.reschedule_on_failure = enabled;
        self
    }

    /// Delay used after any failure instead of the regular delay.
    pub fn failure_delay(mut self, delay: Duration) -> Self {
        self.failure_delay = Some(delay);
        self
    }

    pub fn callback(mut self, callback: ExpiryFn) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Build the task.
    ///
    /// # Errors
    ///
    /// [`BountyError::InvalidTask`] unless exactly one of `expires_at` /
    /// `expires_in` was given, or when an auto-rescheduling task has neither
    /// a relative delay nor a delay generator.
    pub fn build(self) -> Result<Arc<TimedTask>> {
        let now = Utc::now();
        let expiry = match (self.expires_at, self.expires_in) {
            (Some(_), Some(_)) => {
                return Err(BountyError::InvalidTask(format!(
                    "task '{}' given both an expiry instant and a delay",
                    self.label
                )));
            }
            (None, None) => {
                return Err(BountyError::InvalidTask(format!(
                    "task '{}' needs an expiry instant or a delay",
                    self.label
                )));
            }
            (Some(at), None) => at.max(now),
            (None, Some(delay)) => instant_after(now, delay)?,
        };

        let reschedule = match (self.delay_generator, self.expires_in) {
            (Some(generator), _) => Some(Reschedule::Dynamic(generator)),
            (None, Some(delay)) => Some(Reschedule::Fixed(delay)),
            (None, None) => None,
        };
        if self.auto_reschedule && reschedule.is_none() {
            return Err(BountyError::InvalidTask(format!(
                "auto-rescheduling task '{}' needs a delay or a delay generator",
                self.label
            )));
        }

        Ok(Arc::new(TimedTask {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            label: self.label,
            expiry: Mutex::new(expiry),
            state: AtomicU8::new(TaskState::Scheduled as u8),
            reschedule,
            auto_reschedule: self.auto_reschedule,
            reschedule_on_failure: self.reschedule_on_failure,
            failure_delay: self.failure_delay,
            callback: self.callback,
        }))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn build_requires_exactly_one_expiry() {
        let neither = TimedTask::builder("t").build();
        assert!(matches!(neither, Err(BountyError::InvalidTask(_))));

        let both = TimedTask::builder("t")
            .expires_at(Utc::now())
            .expires_in(Duration::from_secs(1))
            .build();
        assert!(matches!(both, Err(BountyError::InvalidTask(_))));

        assert!(TimedTask::builder("t").expires_in(Duration::from_secs(1)).build().is_ok());
    }

    #[test]
    fn auto_reschedule_needs_a_delay_source() {
        let result = TimedTask::builder("t")
            .expires_at(Utc::now() + TimeDelta::seconds(5))
            .auto_reschedule(true)
            .build();
        assert!(result.is_err());

        let task = TimedTask::builder("t")
            .expires_at(Utc::now() + TimeDelta::seconds(5))
            .delay_generator(delay_generator(|| Ok(Duration::from_secs(3))))
            .auto_reschedule(true)
            .build()
            .unwrap();
        assert_eq!(task.next_delay().unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn relative_expiry_becomes_fixed_reschedule() {
        let before = Utc::now();
        let task = TimedTask::builder("t")
            .expires_in(Duration::from_secs(30))
            .build()
            .unwrap();
        assert!(task.expiry_time() >= before + TimeDelta::seconds(30));
        assert_eq!(task.next_delay().unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn past_instants_are_clamped_to_now() {
        let task = TimedTask::builder("t")
            .expires_at(Utc::now() - TimeDelta::hours(3))
            .build()
            .unwrap();
        assert!(task.expiry_time() > Utc::now() - TimeDelta::minutes(1));
        assert!(task.is_due(Utc::now() + TimeDelta::seconds(1)));
    }

    #[test]
    fn claim_is_single_flight() {
        let task = TimedTask::builder("t").expires_in(Duration::ZERO).build().unwrap();
        assert!(task.claim());
        assert!(!task.claim());
        assert_eq!(task.state(), TaskState::Firing);
        assert!(task.release_to(Utc::now()));
        assert_eq!(task.state(), TaskState::Scheduled);
    }

    #[test]
    fn cancel_while_firing_blocks_release() {
        let task = TimedTask::builder("t").expires_in(Duration::ZERO).build().unwrap();
        assert!(task.claim());
        assert_eq!(task.mark_cancelled(), TaskState::Firing);
        assert!(!task.release_to(Utc::now()));
        assert!(task.is_gravestoned());
        assert!(!task.claim());
    }

    #[test]
    fn expired_tasks_stay_expired() {
        let task = TimedTask::builder("t").expires_in(Duration::ZERO).build().unwrap();
        assert!(task.claim());
        task.mark_expired();
        assert_eq!(task.state(), TaskState::Expired);
        assert_eq!(task.mark_cancelled(), TaskState::Expired);
        assert_eq!(task.state(), TaskState::Expired);
    }

    #[tokio::test]
    async fn invoke_checks_gravestone_last() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let task = TimedTask::builder("t")
            .expires_in(Duration::ZERO)
            .callback(expiry_fn(move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }))
            .build()
            .unwrap();

        assert!(task.claim());
        task.mark_cancelled();
        assert!(!task.invoke().await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invoke_propagates_callback_error() {
        let task = TimedTask::builder("t")
            .expires_in(Duration::ZERO)
            .callback(expiry_fn(|| async {
                Err(BountyError::Callback("discord unavailable".to_owned()))
            }))
            .build()
            .unwrap();
        assert!(task.claim());
        assert!(matches!(task.invoke().await, Err(BountyError::Callback(_))));
    }

    #[test]
    fn generator_errors_surface_from_next_delay() {
        let task = TimedTask::builder("t")
            .expires_in(Duration::from_secs(1))
            .delay_generator(delay_generator(|| {
                Err(BountyError::Callback("no cadence".to_owned()))
            }))
            .auto_reschedule(true)
            .build()
            .unwrap();
        assert!(task.next_delay().is_err());
    }

    #[test]
    fn ids_are_unique() {
        let a = TimedTask::builder("a").expires_in(Duration::ZERO).build().unwrap();
        let b = TimedTask::builder("b").expires_in(Duration::ZERO).build().unwrap();
        assert_ne!(a.id(), b.id());
    }
}
