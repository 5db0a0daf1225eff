//! Clock abstraction so message lifecycles can be driven by tests.

use std::fmt::Debug;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::oneshot;

/// Source of the current time and of sleeps.
#[async_trait]
pub trait Clock: Send + Sync + Debug {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;

    /// Sleep for `duration` as measured by this clock.
    async fn sleep(&self, duration: Duration);
}

/// Wall clock backed by tokio timers.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Manually advanced clock for tests.
///
/// Sleeps park until [`MockClock::advance`] moves the clock past their deadline.
#[derive(Debug)]
pub struct MockClock {
    state: Mutex<MockClockState>,
}

#[derive(Debug)]
struct MockClockState {
    now: DateTime<Utc>,
    timers: Vec<(DateTime<Utc>, oneshot::Sender<()>)>,
}

impl MockClock {
    /// Create a clock frozen at `now`, truncated to whole milliseconds.
    pub fn new(now: DateTime<Utc>) -> Self {
        let now = from_millis(now.timestamp_millis());
        Self {
            state: Mutex::new(MockClockState {
                now,
                timers: Vec::new(),
            }),
        }
    }

    /// Move the clock forward and wake every sleeper whose deadline passed.
    pub fn advance(&self, duration: Duration) {
        let due = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.now = add_duration(state.now, duration);
            let now = state.now;
            let (due, pending): (Vec<_>, Vec<_>) = state
                .timers
                .drain(..)
                .partition(|(deadline, _)| *deadline <= now);
            state.timers = pending;
            due
        };
        for (_, tx) in due {
            let _ = tx.send(());
        }
    }

    /// Number of tasks currently parked in [`Clock::sleep`].
    pub fn pending_sleepers(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.timers.iter().filter(|(_, tx)| !tx.is_closed()).count()
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

#[async_trait]
impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).now
    }

    async fn sleep(&self, duration: Duration) {
        let rx = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if duration.is_zero() {
                return;
            }
            let deadline = add_duration(state.now, duration);
            let (tx, rx) = oneshot::channel();
            state.timers.retain(|(_, tx)| !tx.is_closed());
            state.timers.push((deadline, tx));
            rx
        };
        let _ = rx.await;
    }
}

/// Convert stored epoch milliseconds to a timestamp.
pub fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Add a millisecond duration to a timestamp, saturating at
/// [`DateTime::<Utc>::MAX_UTC`].
pub fn add_millis(at: DateTime<Utc>, millis: u64) -> DateTime<Utc> {
    i64::try_from(millis)
        .ok()
        .and_then(chrono::Duration::try_milliseconds)
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// [`add_millis`] for a std duration.
pub fn add_duration(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    add_millis(at, u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}
