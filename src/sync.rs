//! Event fabric used by the engine threads.
//!
//! Models Win32-style auto-reset and manual-reset events on top of one
//! shared `Mutex` + `Condvar` hub per engine, so that a thread can block
//! on an arbitrary subset of events (`wait_any`), in the manner of
//! `WaitForMultipleObjects`. When several events are set at once, the one
//! with the lowest index in the waited slice wins; the others stay set
//! and are observed by a later wait.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Shared wakeup hub. Every event of one engine is attached to the same
/// hub so that one condvar wait can cover all of them.
#[derive(Debug, Default)]
pub(crate) struct SignalHub {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl SignalHub {
    pub(crate) fn new() -> Arc<SignalHub> {
        Arc::new(SignalHub::default())
    }

    fn pulse(&self) {
        let mut generation = self.generation.lock().expect("signal hub poisoned");
        *generation = generation.wrapping_add(1);
        self.cond.notify_all();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResetMode {
    /// Consumed by the waiter that observes it.
    Auto,
    /// Stays set until explicitly reset.
    Manual,
}

/// A single settable event. Cheap to share by reference; all waiting goes
/// through the owning hub.
#[derive(Debug)]
pub(crate) struct Event {
    hub: Arc<SignalHub>,
    set: AtomicBool,
    mode: ResetMode,
}

/// Outcome of [`wait_any`]: the index of the first set event, or timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wait {
    Event(usize),
    Timeout,
}

impl Event {
    pub(crate) fn new(hub: &Arc<SignalHub>, mode: ResetMode) -> Event {
        Event {
            hub: hub.clone(),
            set: AtomicBool::new(false),
            mode,
        }
    }

    pub(crate) fn set(&self) {
        self.set.store(true, Ordering::Release);
        self.hub.pulse();
    }

    pub(crate) fn reset(&self) {
        self.set.store(false, Ordering::Release);
    }

    pub(crate) fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    /// Non-blocking check. Auto-reset events are consumed when observed.
    pub(crate) fn try_consume(&self) -> bool {
        match self.mode {
            ResetMode::Manual => self.set.load(Ordering::Acquire),
            ResetMode::Auto => self.set.swap(false, Ordering::AcqRel),
        }
    }

    /// Blocks until this event is set (and consumes it if auto-reset).
    pub(crate) fn wait(&self) {
        let _ = wait_any(&[self], None);
    }
}

/// Blocks until one of `events` is set, or until `timeout` elapses.
///
/// Events are checked in slice order on every wakeup; the first set event
/// is consumed (if auto-reset) and its index returned. All events must
/// belong to the same hub.
pub(crate) fn wait_any(events: &[&Event], timeout: Option<Duration>) -> Wait {
    let hub = &events[0].hub;
    debug_assert!(events.iter().all(|e| Arc::ptr_eq(&e.hub, hub)));

    let deadline = timeout.map(|t| Instant::now() + t);
    let mut generation = hub.generation.lock().expect("signal hub poisoned");
    loop {
        for (index, event) in events.iter().enumerate() {
            if event.try_consume() {
                return Wait::Event(index);
            }
        }
        let seen = *generation;
        match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Wait::Timeout;
                }
                let (guard, result) = hub
                    .cond
                    .wait_timeout(generation, deadline - now)
                    .expect("signal hub poisoned");
                generation = guard;
                if result.timed_out() && *generation == seen {
                    // One more pass over the events below; if none is set
                    // the deadline check above returns Timeout.
                }
            }
            None => {
                generation = hub.cond.wait(generation).expect("signal hub poisoned");
            }
        }
    }
}
