//! Long-lived worker threads for dedicated-placement systems.

use super::scheduler::{SchedShared, SystemCell};
use log::*;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Lifecycle state of a dedicated worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Starting = 0,
    Idle = 1,
    Running = 2,
    Arriving = 3,
    Stopping = 4,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Starting,
            1 => Self::Idle,
            2 => Self::Running,
            3 => Self::Arriving,
            _ => Self::Stopping,
        }
    }
}

/// Frame-start gate for dedicated workers.
///
/// The scheduler opens the gate once per frame; workers sleep here between
/// frames. Pacing through the gate (instead of free-running straight out of
/// the barrier) means a worker is always parked between frames, which is
/// what makes stop-and-join safe at any frame boundary.
pub(crate) struct FrameGate {
    counter: Mutex<u64>,
    condvar: Condvar,
}

impl FrameGate {
    pub fn new() -> Self {
        Self {
            counter: Mutex::new(0),
            condvar: Condvar::new(),
        }
    }

    /// Opens the gate for the next frame, waking every parked worker.
    pub fn open(&self) {
        *self.counter.lock() += 1;
        self.condvar.notify_all();
    }

    pub fn current(&self) -> u64 {
        *self.counter.lock()
    }

    /// Wakes parked workers without opening a frame (stop path).
    pub fn wake_all(&self) {
        self.condvar.notify_all();
    }

    /// Parks until the gate advances past `seen`, or `should_stop` turns
    /// true. The wait re-checks the stop condition on a short cadence so a
    /// missed wakeup can never strand a stopping worker.
    fn wait_past(&self, seen: u64, should_stop: impl Fn() -> bool) -> Option<u64> {
        let mut counter = self.counter.lock();
        while *counter <= seen {
            if should_stop() {
                return None;
            }
            let _ = self
                .condvar
                .wait_for(&mut counter, Duration::from_millis(25));
        }
        Some(*counter)
    }
}

/// Owner of one dedicated system thread. Joined on stop and on drop.
pub(crate) struct DedicatedWorker {
    thread: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    shared: Arc<SchedShared>,
}

impl DedicatedWorker {
    pub fn spawn(
        name: String,
        cell: SystemCell,
        shared: Arc<SchedShared>,
        target_interval_ms: f64,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let state = Arc::new(AtomicU8::new(WorkerState::Starting as u8));

        // The gate baseline must be captured before the thread exists: were
        // the thread to read it itself, a gate opened in the meantime would
        // count as already seen and the worker would sit out a frame the
        // barrier expects it in.
        let gate_baseline = shared.gate.current();

        let thread = {
            let stop = stop.clone();
            let state = state.clone();
            let shared = shared.clone();
            thread::Builder::new()
                .name(format!("hegemon-{name}"))
                .spawn(move || {
                    worker_loop(
                        &name,
                        &cell,
                        &shared,
                        &stop,
                        &state,
                        target_interval_ms,
                        gate_baseline,
                    )
                })
                .expect("couldn't spawn dedicated system thread")
        };

        Self {
            thread: Some(thread),
            stop,
            state,
            shared,
        }
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn signal_stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.shared.gate.wake_all();
    }

    /// Signals the loop to stop and joins the thread. Safe at any frame
    /// boundary: the worker's final barrier arrival has already completed by
    /// the time it parks at the gate.
    pub fn stop(mut self) {
        self.signal_stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for DedicatedWorker {
    fn drop(&mut self) {
        self.signal_stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn worker_loop(
    name: &str,
    cell: &SystemCell,
    shared: &Arc<SchedShared>,
    stop: &AtomicBool,
    state: &AtomicU8,
    target_interval_ms: f64,
    gate_baseline: u64,
) {
    trace!("Dedicated thread for `{name}` up");
    state.store(WorkerState::Idle as u8, Ordering::Release);

    let target = Duration::from_secs_f64(target_interval_ms.max(0.0) / 1_000.0);
    let mut seen = gate_baseline;

    loop {
        let should_stop =
            || stop.load(Ordering::Acquire) || !shared.running.load(Ordering::Acquire);
        match shared.gate.wait_past(seen, should_stop) {
            Some(counter) => seen = counter,
            None => break,
        }

        let frame_start = Instant::now();
        state.store(WorkerState::Running as u8, Ordering::Release);

        let dt = shared.clock.delta_seconds() as f32;
        shared.run_system(name, cell, dt);

        // Arrive whether the update succeeded or not; the frame must close.
        state.store(WorkerState::Arriving as u8, Ordering::Release);
        shared.barrier.arrive_and_wait();
        state.store(WorkerState::Idle as u8, Ordering::Release);

        let elapsed = frame_start.elapsed();
        if elapsed < target {
            thread::sleep(target - elapsed);
        }
    }

    state.store(WorkerState::Stopping as u8, Ordering::Release);
    trace!("Dedicated thread for `{name}` down");
}
