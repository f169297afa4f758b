use std::{
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use tracing::{trace, warn};

#[derive(Debug, Default)]
struct TokenState {
    owner: Option<ThreadId>,
    /// Number of live exclusive guards held by `owner`.
    depth: u32,
    /// Number of live shared guards held by other threads.
    in_flight: u32,
}

/// Read-many / write-one token guarding multi-device traversals of the store.
///
/// Single-device callers hold a [`SharedGuard`] for the duration of one operation. A
/// traversal takes an [`ExclusiveGuard`], which stops new shared acquisitions by other threads
/// and then waits up to the quiescence interval for in-flight ones to drain. The owning thread
/// may re-enter in either mode.
#[derive(Debug)]
pub struct CrossDeviceLock {
    state: Mutex<TokenState>,
    cond: Condvar,
    quiescence: Duration,
}

impl CrossDeviceLock {
    pub fn new(quiescence: Duration) -> Self {
        Self { state: Mutex::new(TokenState::default()), cond: Condvar::new(), quiescence }
    }

    pub fn exclusive(&self) -> ExclusiveGuard<'_> {
        let me = thread::current().id();
        let mut state = self.state.lock();

        if state.owner == Some(me) {
            state.depth += 1;
            return ExclusiveGuard { lock: self };
        }

        while state.owner.is_some() {
            self.cond.wait(&mut state);
        }
        state.owner = Some(me);
        state.depth = 1;

        let deadline = Instant::now() + self.quiescence;
        while state.in_flight > 0 {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                if state.in_flight > 0 {
                    warn!(in_flight = state.in_flight, "proceeding before quiescence");
                }
                break;
            }
        }

        trace!("cross-device token acquired");
        ExclusiveGuard { lock: self }
    }

    pub fn shared(&self) -> SharedGuard<'_> {
        let me = thread::current().id();
        let mut state = self.state.lock();

        if state.owner == Some(me) {
            return SharedGuard { lock: self, counted: false };
        }

        while state.owner.is_some() {
            self.cond.wait(&mut state);
        }
        state.in_flight += 1;
        SharedGuard { lock: self, counted: true }
    }

    /// Whether the calling thread holds the token.
    pub fn is_held_by_current(&self) -> bool {
        self.state.lock().owner == Some(thread::current().id())
    }

    /// `(exclusive depth, shared in flight)`
    pub fn counts(&self) -> (u32, u32) {
        let state = self.state.lock();
        (state.depth, state.in_flight)
    }
}

#[derive(Debug)]
pub struct ExclusiveGuard<'a> {
    lock: &'a CrossDeviceLock,
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock();
        state.depth = state.depth.saturating_sub(1);
        if state.depth == 0 {
            state.owner = None;
            self.lock.cond.notify_all();
        }
    }
}

#[derive(Debug)]
pub struct SharedGuard<'a> {
    lock: &'a CrossDeviceLock,
    counted: bool,
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        if !self.counted {
            return;
        }
        let mut state = self.lock.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.in_flight == 0 {
            self.lock.cond.notify_all();
        }
    }
}
