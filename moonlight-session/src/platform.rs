//! Platform primitives: a manual-reset event, cooperative thread cancellation
//! and an interruptible sleep, grounded in `Platform.c` / `PlatformThreads.h`.
//!
//! The engine never kills a thread asynchronously. Every blocking wait site
//! must be unblockable by at least one of: an event signal, a queue shutdown,
//! or socket shutdown (see `queue.rs` and `net.rs`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// A manual-reset event: `set` wakes every waiter and stays signalled until `clear`.
#[derive(Clone)]
pub struct ManualResetEvent {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ManualResetEvent {
    pub fn new() -> Self {
        Self {
            inner: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    pub fn set(&self) {
        let (lock, cvar) = &*self.inner;
        let mut signalled = lock.lock().expect("event mutex poisoned");
        *signalled = true;
        cvar.notify_all();
    }

    pub fn clear(&self) {
        let (lock, _) = &*self.inner;
        *lock.lock().expect("event mutex poisoned") = false;
    }

    /// Blocks until signalled. Never returns spuriously.
    pub fn wait(&self) {
        let (lock, cvar) = &*self.inner;
        let mut signalled = lock.lock().expect("event mutex poisoned");
        while !*signalled {
            signalled = cvar.wait(signalled).expect("event mutex poisoned");
        }
    }

    /// Blocks until signalled or `timeout` elapses. Returns whether it was signalled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let signalled = lock.lock().expect("event mutex poisoned");
        let (guard, result) = cvar
            .wait_timeout_while(signalled, timeout, |s| !*s)
            .expect("event mutex poisoned");
        drop(guard);
        !result.timed_out()
    }
}

impl Default for ManualResetEvent {
    fn default() -> Self {
        Self::new()
    }
}

/// Cooperative cancellation flag shared between a long-running thread and whoever tears it down.
#[derive(Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn interrupt(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Sleeps for `duration` but wakes early if `flag` is interrupted, polling at a short interval.
///
/// Mirrors `PltSleep` plus an interruption check; real platform primitives usually have a
/// sleepable-event variant instead, but polling keeps this free of an extra `Condvar` per thread.
pub fn interruptible_sleep(duration: Duration, flag: &InterruptFlag) {
    const POLL: Duration = Duration::from_millis(20);
    let deadline = Instant::now() + duration;
    loop {
        if flag.is_interrupted() {
            return;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return;
        }
        std::thread::sleep(remaining.min(POLL));
    }
}

/// Monotonic milliseconds since an arbitrary epoch, matching `PltGetMillis`.
pub fn now_ms() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn event_wakes_waiter() {
        let event = ManualResetEvent::new();
        let waiter = event.clone();
        let handle = thread::spawn(move || {
            waiter.wait();
        });
        thread::sleep(Duration::from_millis(10));
        event.set();
        handle.join().unwrap();
    }

    #[test]
    fn interrupt_short_circuits_sleep() {
        let flag = InterruptFlag::new();
        let signal = flag.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            signal.interrupt();
        });
        let start = Instant::now();
        interruptible_sleep(Duration::from_secs(5), &flag);
        assert!(start.elapsed() < Duration::from_secs(1));
        handle.join().unwrap();
    }
}
