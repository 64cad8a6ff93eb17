//! The concurrent system scheduler.
//!
//! Every top-level simulation module implements the [`System`] trait and is
//! registered with the [`Scheduler`] under a threading [`Placement`]. Each
//! frame the scheduler classifies systems by placement, runs main-thread
//! systems inline, fans worker-pool systems out over a shared [`WorkerPool`],
//! lets dedicated-thread systems run their own loops, and finally meets all
//! of them at a cyclic [`FrameBarrier`] before the next frame may begin.
//!
//! Placement is adaptive: systems registered as [`Placement::Hybrid`] are
//! re-resolved every frame from observed cost (and optional name rules), and
//! chronically slow pool systems are promoted to dedicated threads while
//! systems that quiet down are demoted back. Systems that keep failing are
//! disabled by the [`Supervisor`] and dropped from scheduling entirely.
//!
//! ## Notes for implementing systems
//!  * `update` runs on a different thread depending on placement; don't
//!    assume thread identity. Main-thread placement is the only exception.
//!  * An `Err` from `update` counts against the system's error budget. Five
//!    errors inside a minute disable the system until it is re-registered.

use hegemon_utils::AnyResult;
use serde::{Deserialize, Serialize};
use std::any::Any;
use thiserror::Error;

#[doc(inline)]
pub use barrier::*;
mod barrier;

#[doc(inline)]
pub use clock::*;
mod clock;

#[doc(inline)]
pub use monitor::*;
mod monitor;

#[doc(inline)]
pub use pool::*;
mod pool;

#[doc(inline)]
pub use supervisor::*;
mod supervisor;

#[doc(inline)]
pub use scheduler::*;
mod scheduler;

pub(crate) mod dedicated;
pub use dedicated::WorkerState;

/// Threading placement of a registered system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Placement {
    /// Run sequentially on the thread that calls [`Scheduler::update`].
    MainThread,
    /// Run as a task on the shared worker pool.
    WorkerPool,
    /// Run on a long-lived thread owned by this system alone.
    DedicatedThread,
    /// Re-derive the effective placement every frame from observed cost.
    Hybrid,
}

/// Trait implemented by engine systems, see module docs for details.
pub trait System: Any + Send {
    /// The system's name. Must be unique within a scheduler and constant.
    fn name(&self) -> &'static str;

    /// Called exactly once, before the first update. A failure marks the
    /// system disabled; it will never be scheduled.
    fn init(&mut self) -> AnyResult {
        Ok(())
    }

    /// Runs one frame of this system. `dt` is the frame delta in seconds.
    fn update(&mut self, dt: f32) -> AnyResult;

    /// Called exactly once, after the last update. Must not fail.
    fn shutdown(&mut self) {}

    /// Placement hint used by [`Scheduler::add_preferred`]. The scheduler may
    /// override it through rebalancing.
    fn preferred_placement(&self) -> Placement {
        Placement::Hybrid
    }
}

/// Errors surfaced by the scheduler's own API. Failures *inside* systems
/// never take this path; they are routed to the [`Supervisor`].
#[derive(Debug, Error)]
pub enum SchedError {
    #[error("a system named `{0}` is already registered")]
    DuplicateName(String),

    #[error("no system named `{0}` is registered")]
    UnknownSystem(String),

    #[error("the worker pool is shutting down")]
    ShutdownInProgress,

    #[error("worker task failed: {0}")]
    TaskFailed(String),
}

/// Scheduler tuning knobs. Everything that used to be a global constant in
/// older engines lives here and is provided at construction time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedConfig {
    /// Worker pool size. `0` means "use the machine's available parallelism".
    pub max_threads: usize,
    /// Target frame interval for dedicated-thread pacing, in milliseconds.
    pub target_interval_ms: f64,
    /// EMA window for per-system execution time, in samples.
    pub sample_window: u64,
    /// EMA window for the frames-per-second average, in frames.
    pub frame_window: u64,
    /// Average execution time above which a system counts as slow.
    pub slow_system_ms: f64,
    /// One full frame at the target rate; promotion threshold on the average.
    pub frame_budget_ms: f64,
    /// Promotion threshold on the peak execution time.
    pub promotion_peak_ms: f64,
    /// Demotion threshold on the average execution time.
    pub demotion_avg_ms: f64,
    /// Frames of sustained slowness required before promotion.
    pub promotion_streak: u64,
    /// Frames of sustained quiet required before demotion.
    pub demotion_streak: u64,
    /// Executions required before cost-based decisions kick in.
    pub min_executions: u64,
    /// How often (in frames) the rebalance pass applies placement changes.
    pub rebalance_interval: u64,
    /// Errors inside the window that get a system disabled.
    pub max_errors: usize,
    /// Supervision window, in seconds.
    pub error_window_secs: u64,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            max_threads: 0,
            target_interval_ms: 16.67,
            sample_window: 100,
            frame_window: 60,
            slow_system_ms: 5.0,
            frame_budget_ms: 16.67,
            promotion_peak_ms: 20.0,
            demotion_avg_ms: 1.0,
            promotion_streak: 180,
            demotion_streak: 600,
            min_executions: 60,
            rebalance_interval: 300,
            max_errors: 5,
            error_window_secs: 60,
        }
    }
}

impl SchedConfig {
    /// Resolves `max_threads`, falling back to the machine's parallelism.
    pub fn worker_count(&self) -> usize {
        if self.max_threads > 0 {
            self.max_threads
        } else {
            std::thread::available_parallelism().map_or(4, usize::from)
        }
    }
}
