//! Time sources for the scheduler.
//!
//! Everything in the scheduling path reads time through the [`Clock`] trait so
//! tests can substitute [`ManualClock`] and advance virtual time explicitly.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::oneshot;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// Source of "now" and of one-shot timer signals.
pub trait Clock: Send + Sync + 'static {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;

    /// A future that resolves once `duration` has elapsed on this clock.
    fn after(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// Real time backed by `chrono::Utc::now` and `tokio::time::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn after(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

struct Waiter {
    deadline: DateTime<Utc>,
    tx: oneshot::Sender<()>,
}

struct ManualState {
    now: DateTime<Utc>,
    waiters: Vec<Waiter>,
}

/// Virtual clock that only moves when [`ManualClock::advance`] or
/// [`ManualClock::set`] is called.
///
/// Cloning shares the underlying time, so a test can keep one handle while the
/// scheduler owns another.
#[derive(Clone)]
pub struct ManualClock {
    state: Arc<Mutex<ManualState>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ManualState {
                now: start,
                waiters: Vec::new(),
            })),
        }
    }

    /// Move time forward by `by` and fire every timer whose deadline passed.
    pub fn advance(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
        let target = {
            let state = self.state.lock();
            state.now.checked_add_signed(by).unwrap_or(state.now)
        };
        self.set(target);
    }

    /// Jump to `to`. Moving backwards is ignored.
    pub fn set(&self, to: DateTime<Utc>) {
        let fired = {
            let mut state = self.state.lock();
            if to > state.now {
                state.now = to;
            }
            let now = state.now;
            let (due, pending): (Vec<_>, Vec<_>) =
                state.waiters.drain(..).partition(|w| w.deadline <= now);
            state.waiters = pending;
            due
        };
        // Fire outside the lock so woken tasks can read the clock immediately.
        for waiter in fired {
            let _ = waiter.tx.send(());
        }
    }

    /// Number of timers still waiting for their deadline.
    pub fn pending_timers(&self) -> usize {
        let mut state = self.state.lock();
        state.waiters.retain(|w| !w.tx.is_closed());
        state.waiters.len()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.state.lock().now
    }

    fn after(&self, duration: Duration) -> BoxFuture<'static, ()> {
        let by = chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX);
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock();
            let deadline = state.now.checked_add_signed(by).unwrap_or(DateTime::<Utc>::MAX_UTC);
            if deadline <= state.now {
                let _ = tx.send(());
            } else {
                state.waiters.retain(|w| !w.tx.is_closed());
                state.waiters.push(Waiter { deadline, tx });
            }
        }
        Box::pin(async move {
            let _ = rx.await;
        })
    }
}

impl std::fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ManualClock")
            .field("now", &state.now)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}
