//! Time sources and timers for update-tracking deadlines.

use crate::types::Timestamp;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::warn;

/// Work to run once a deadline is reached.
pub type TimerTask = Box<dyn FnOnce() + Send>;

/// Source of the current engine time.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;

    /// Run `task` once, at or after `at`. A deadline already reached may run
    /// before this call returns.
    fn schedule(&self, at: Timestamp, task: TimerTask);
}

/// Pending timers ordered by deadline, then by insertion.
#[derive(Default)]
struct TimerQueue {
    next_seq: u64,
    timers: BTreeMap<(Timestamp, u64), TimerTask>,
}

impl TimerQueue {
    fn push(&mut self, at: Timestamp, task: TimerTask) {
        self.timers.insert((at, self.next_seq), task);
        self.next_seq += 1;
    }

    fn next_deadline(&self) -> Option<Timestamp> {
        self.timers.keys().next().map(|(at, _)| *at)
    }

    fn pop_due(&mut self, now: Timestamp) -> Option<TimerTask> {
        let entry = self.timers.first_entry()?;
        if entry.key().0 > now {
            return None;
        }
        Some(entry.remove())
    }
}

/// Monotonic wall clock, measured from construction.
///
/// Timers run on a background thread started by the first `schedule`, so
/// their tasks must not assume the caller's thread.
pub struct SystemClock {
    origin: Instant,
    timers: Mutex<Option<Sender<(Timestamp, TimerTask)>>>,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            timers: Mutex::new(None),
        }
    }

    fn timer_sender(&self) -> Option<Sender<(Timestamp, TimerTask)>> {
        let mut slot = self.timers.lock();
        if slot.is_none() {
            let (tx, rx) = unbounded();
            let origin = self.origin;
            let spawned = thread::Builder::new()
                .name("live-hydrate-timers".to_string())
                .spawn(move || run_timers(origin, rx));
            match spawned {
                Ok(_) => *slot = Some(tx),
                Err(e) => {
                    warn!(error = %e, "could not start timer thread");
                    return None;
                }
            }
        }
        slot.clone()
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.origin.elapsed().as_millis() as u64)
    }

    fn schedule(&self, at: Timestamp, task: TimerTask) {
        if let Some(tx) = self.timer_sender() {
            // The worker only exits once every sender is gone.
            let _ = tx.send((at, task));
        }
    }
}

/// Timer loop. Exits when the clock is dropped.
fn run_timers(origin: Instant, rx: Receiver<(Timestamp, TimerTask)>) {
    let mut queue = TimerQueue::default();
    loop {
        let deadline = queue
            .next_deadline()
            .and_then(|at| origin.checked_add(Duration::from_millis(at.0)));
        let received = match deadline {
            Some(deadline) => {
                rx.recv_timeout(deadline.saturating_duration_since(Instant::now()))
            }
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok((at, task)) => queue.push(at, task),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
        let now = Timestamp(origin.elapsed().as_millis() as u64);
        while let Some(task) = queue.pop_due(now) {
            task();
        }
    }
}

/// Hand-driven clock for deterministic tests.
///
/// Timers fire on the thread that moves the clock past their deadline.
#[derive(Default)]
pub struct ManualClock {
    now: AtomicU64,
    timers: Mutex<TimerQueue>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward by `millis`, running every timer that falls due.
    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
        self.fire_due();
    }

    /// Jump to an absolute time. Never moves backwards.
    pub fn set(&self, at: Timestamp) {
        self.now.fetch_max(at.0, Ordering::SeqCst);
        self.fire_due();
    }

    /// Number of timers not yet fired.
    pub fn pending_timers(&self) -> usize {
        self.timers.lock().timers.len()
    }

    fn fire_due(&self) {
        loop {
            // Tasks run without the lock; they may schedule more timers.
            let task = self.timers.lock().pop_due(self.now());
            match task {
                Some(task) => task(),
                None => break,
            }
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.now.load(Ordering::SeqCst))
    }

    fn schedule(&self, at: Timestamp, task: TimerTask) {
        self.timers.lock().push(at, task);
        self.fire_due();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new();
        assert_eq!(clock.now(), Timestamp(0));
        clock.advance(200);
        assert_eq!(clock.now(), Timestamp(200));
        clock.set(Timestamp(100));
        assert_eq!(clock.now(), Timestamp(200));
        clock.set(Timestamp(5000));
        assert_eq!(clock.now(), Timestamp(5000));
    }

    #[test]
    fn test_manual_timers_fire_in_deadline_order() {
        let clock = ManualClock::new();
        let fired = Arc::new(Mutex::new(Vec::new()));
        for (at, name) in [(300, "c"), (100, "a"), (200, "b")] {
            let sink = fired.clone();
            clock.schedule(Timestamp(at), Box::new(move || sink.lock().push(name)));
        }
        assert_eq!(clock.pending_timers(), 3);

        clock.advance(150);
        assert_eq!(*fired.lock(), vec!["a"]);
        clock.advance(1000);
        assert_eq!(*fired.lock(), vec!["a", "b", "c"]);
        assert_eq!(clock.pending_timers(), 0);
    }

    #[test]
    fn test_manual_timer_already_due_runs_now() {
        let clock = ManualClock::new();
        clock.advance(500);
        let fired = Arc::new(AtomicU64::new(0));
        let counter = fired.clone();
        clock.schedule(
            Timestamp(500),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_system_clock_timer_fires() {
        let clock = SystemClock::new();
        let (tx, rx) = unbounded();
        let at = clock.now().after(20);
        clock.schedule(
            at,
            Box::new(move || {
                let _ = tx.send(());
            }),
        );
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        assert!(clock.now() >= at);
    }
}
