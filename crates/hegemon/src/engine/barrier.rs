//! Cyclic end-of-frame barrier with a dynamic participant count.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

struct BarrierState {
    participants: usize,
    arrived: usize,
    cancelled: bool,
}

/// A cyclic barrier synchronizing the main thread, the worker pool's
/// synthetic arrival, and every dedicated-thread system at end-of-frame.
///
/// Release is keyed on the *epoch*, not on a flag: a waiter only returns once
/// the epoch has advanced past the value it captured on entry. A fast
/// participant re-entering for the next frame therefore cannot be released by
/// the previous frame's wakeup, and a slow waker cannot miss its release.
pub struct FrameBarrier {
    state: Mutex<BarrierState>,
    condvar: Condvar,
    epoch: AtomicU64,
    frame_ready: AtomicBool,
}

impl FrameBarrier {
    pub fn new(participants: usize) -> Self {
        Self {
            state: Mutex::new(BarrierState {
                participants,
                arrived: 0,
                cancelled: false,
            }),
            condvar: Condvar::new(),
            epoch: AtomicU64::new(0),
            frame_ready: AtomicBool::new(false),
        }
    }

    /// Current frame epoch; advances exactly once per completed frame.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn participants(&self) -> usize {
        self.state.lock().participants
    }

    /// True once every participant of the current frame has arrived.
    pub fn is_frame_ready(&self) -> bool {
        self.frame_ready.load(Ordering::Acquire)
    }

    /// Reconfigures the participant count. Legal only between frames; if the
    /// arrivals already queued satisfy the new count, the frame completes
    /// immediately.
    pub fn set_participants(&self, participants: usize) {
        let mut state = self.state.lock();
        state.participants = participants;
        self.complete_if_full(&mut state);
    }

    /// Marks the start of a new frame by clearing the ready flag.
    pub fn begin_frame(&self) {
        self.frame_ready.store(false, Ordering::Release);
    }

    /// Records one arrival without waiting for the rest. Used for the
    /// synthetic worker-pool arrival, which the main thread performs after
    /// all pool tasks have finished.
    pub fn arrive(&self) {
        let mut state = self.state.lock();
        if state.cancelled {
            return;
        }
        state.arrived += 1;
        self.complete_if_full(&mut state);
    }

    /// Records one arrival and blocks until the epoch advances past the one
    /// captured on entry (i.e. until every participant of this frame has
    /// arrived).
    pub fn arrive_and_wait(&self) {
        let mut state = self.state.lock();
        if state.cancelled {
            return;
        }

        let entry_epoch = self.epoch.load(Ordering::Acquire);
        state.arrived += 1;
        if self.complete_if_full(&mut state) {
            return;
        }

        while self.epoch.load(Ordering::Acquire) == entry_epoch && !state.cancelled {
            self.condvar.wait(&mut state);
        }
    }

    /// Cancels the barrier for shutdown: wakes every waiter and turns all
    /// subsequent arrivals into no-ops until [`FrameBarrier::reset`].
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        state.cancelled = true;
        state.arrived = 0;
        self.condvar.notify_all();
    }

    /// Clears a cancellation and any stale arrivals so the barrier can be
    /// reused after a stop/start cycle.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.cancelled = false;
        state.arrived = 0;
    }

    /// Completes the frame if all participants have arrived. Must be called
    /// with the state lock held; returns whether the epoch advanced.
    fn complete_if_full(&self, state: &mut BarrierState) -> bool {
        if state.participants > 0 && state.arrived >= state.participants {
            state.arrived = 0;
            self.epoch.fetch_add(1, Ordering::AcqRel);
            self.frame_ready.store(true, Ordering::Release);
            self.condvar.notify_all();
            true
        } else {
            false
        }
    }
}
