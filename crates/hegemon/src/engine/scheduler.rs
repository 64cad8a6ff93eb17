//! The per-frame orchestrator.

use super::dedicated::{DedicatedWorker, FrameGate};
use super::{
    FrameBarrier, GameClock, PerfMonitor, Placement, SchedConfig, SchedError, Supervisor, System,
    WorkerPool, WorkerState,
};
use crate::bus::MessageBus;
use crate::world::World;
use ahash::AHashMap;
use anyhow::anyhow;
use hegemon_utils::{AtomicF64, Ema};
use log::*;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub(crate) type SystemCell = Arc<Mutex<Box<dyn System>>>;

/// Per-system bookkeeping owned by the scheduler.
pub(crate) struct SystemSlot {
    pub system: SystemCell,
    /// Declared placement; `Hybrid` is re-resolved every frame.
    pub placement: Placement,
    /// Placement the system actually ran under last frame.
    pub effective: Placement,
    pub initialized: bool,
    pub avg: Ema,
    pub peak_ms: f64,
    pub promotion_streak: u64,
    pub demotion_streak: u64,
    pub performance_critical: bool,
    pub target_interval_ms: f64,
    pub last_update: Instant,
}

impl SystemSlot {
    fn record_execution(&mut self, elapsed_ms: f64) {
        self.avg.record(elapsed_ms);
        self.peak_ms = self.peak_ms.max(elapsed_ms);
        self.last_update = Instant::now();
    }

    fn executions(&self) -> u64 {
        self.avg.samples()
    }
}

#[derive(Default)]
pub(crate) struct Registry {
    pub slots: AHashMap<String, SystemSlot>,
    /// Registration order; main-thread systems run in this order.
    pub order: Vec<String>,
}

/// State shared between the scheduler, pool tasks, and dedicated workers.
pub(crate) struct SchedShared {
    pub config: SchedConfig,
    pub registry: Mutex<Registry>,
    pub barrier: FrameBarrier,
    pub gate: FrameGate,
    pub clock: GameClock,
    pub monitor: PerfMonitor,
    pub supervisor: Supervisor,
    pub bus: Arc<MessageBus>,
    pub running: AtomicBool,
    pub paused: AtomicBool,
    pub monitoring: AtomicBool,
    pub frame_time_ms: AtomicF64,
}

impl SchedShared {
    /// Drives one `update` of one system, from whatever thread the placement
    /// dictates. Returns whether the update succeeded; metrics are recorded
    /// only for successful samples, failures go to the supervisor.
    pub(crate) fn run_system(&self, name: &str, cell: &SystemCell, dt: f32) -> bool {
        let started = Instant::now();
        let outcome = {
            let mut system = cell.lock();
            panic::catch_unwind(AssertUnwindSafe(|| system.update(dt)))
                .unwrap_or_else(|payload| Err(anyhow!(super::pool::panic_message(payload.as_ref()))))
        };

        match outcome {
            Ok(()) => {
                let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
                {
                    let mut registry = self.registry.lock();
                    if let Some(slot) = registry.slots.get_mut(name) {
                        slot.record_execution(elapsed_ms);
                    }
                }
                if self.monitoring.load(Ordering::Acquire) {
                    self.monitor.record_system(name, elapsed_ms);
                }
                true
            }
            Err(error) => {
                if let Some(notice) = self.supervisor.record_failure(name, &error) {
                    self.bus.publish(notice);
                }
                false
            }
        }
    }
}

/// Read-only snapshot of one system's scheduling state.
#[derive(Debug, Clone)]
pub struct SystemInfo {
    pub placement: Placement,
    pub effective: Placement,
    pub avg_ms: f64,
    pub peak_ms: f64,
    pub executions: u64,
    pub performance_critical: bool,
    pub target_interval_ms: f64,
    pub last_update: Instant,
}

/// Read-only snapshot of the worker pool.
#[derive(Debug, Clone)]
pub struct PoolInfo {
    pub worker_count: usize,
    pub queued_tasks: usize,
    pub active_tasks: usize,
    pub avg_task_ms: f64,
}

/// Systems classified for one frame.
#[derive(Default)]
struct FramePlan {
    main: SmallVec<[(String, SystemCell); 8]>,
    pool: SmallVec<[(String, SystemCell); 8]>,
    dedicated_active: usize,
}

/// The concurrent system scheduler. See the [module docs](crate::engine).
pub struct Scheduler {
    shared: Arc<SchedShared>,
    world: Arc<World>,
    pool: WorkerPool,
    dedicated: AHashMap<String, DedicatedWorker>,
    default_placement: Placement,
    frame_counter: u64,
}

impl Scheduler {
    pub fn new(world: Arc<World>, bus: Arc<MessageBus>, config: SchedConfig) -> Self {
        let pool = WorkerPool::new(config.worker_count());
        let shared = Arc::new(SchedShared {
            barrier: FrameBarrier::new(1),
            gate: FrameGate::new(),
            clock: GameClock::new(),
            monitor: PerfMonitor::new(config.sample_window, config.frame_window),
            supervisor: Supervisor::new(
                config.max_errors,
                Duration::from_secs(config.error_window_secs),
            ),
            registry: Mutex::new(Registry::default()),
            bus,
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            monitoring: AtomicBool::new(true),
            frame_time_ms: AtomicF64::new(0.0),
            config,
        });

        Self {
            shared,
            world,
            pool,
            dedicated: AHashMap::new(),
            default_placement: Placement::Hybrid,
            frame_counter: 0,
        }
    }

    pub fn world(&self) -> &Arc<World> {
        &self.world
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.shared.bus
    }

    // ------------------------------------------------------------------
    // System management
    // ------------------------------------------------------------------

    /// Registers a system under an explicit placement. Fails on a duplicate
    /// name; systems added while the scheduler runs are initialized
    /// immediately and scheduled from the next frame.
    pub fn add(&mut self, system: Box<dyn System>, placement: Placement) -> Result<(), SchedError> {
        let name = system.name().to_string();
        {
            let mut registry = self.shared.registry.lock();
            if registry.slots.contains_key(&name) {
                return Err(SchedError::DuplicateName(name));
            }

            registry.slots.insert(
                name.clone(),
                SystemSlot {
                    system: Arc::new(Mutex::new(system)),
                    placement,
                    effective: placement,
                    initialized: false,
                    avg: Ema::new(self.shared.config.sample_window.max(1)),
                    peak_ms: 0.0,
                    promotion_streak: 0,
                    demotion_streak: 0,
                    performance_critical: false,
                    target_interval_ms: self.shared.config.target_interval_ms,
                    last_update: Instant::now(),
                },
            );
            registry.order.push(name.clone());
        }

        info!("Registered system `{name}` ({placement:?})");
        if self.shared.running.load(Ordering::Acquire) {
            self.init_system(&name);
        }
        Ok(())
    }

    /// Registers a system under its own [`System::preferred_placement`] hint
    /// (falling back to the scheduler default for `Hybrid`-preferring ones).
    pub fn add_preferred(&mut self, system: Box<dyn System>) -> Result<(), SchedError> {
        let placement = match system.preferred_placement() {
            Placement::Hybrid => self.default_placement,
            placement => placement,
        };
        self.add(system, placement)
    }

    /// Unregisters a system, stopping its dedicated thread first. This is
    /// also the only way to revive a name disabled by supervision.
    pub fn remove(&mut self, name: &str) -> Result<(), SchedError> {
        if let Some(worker) = self.dedicated.remove(name) {
            worker.stop();
        }

        let slot = {
            let mut registry = self.shared.registry.lock();
            let slot = registry
                .slots
                .remove(name)
                .ok_or_else(|| SchedError::UnknownSystem(name.to_string()))?;
            registry.order.retain(|entry| entry != name);
            slot
        };

        if slot.initialized {
            slot.system.lock().shutdown();
        }
        self.shared.supervisor.forget(name);
        info!("Removed system `{name}`");
        Ok(())
    }

    /// Re-places a system. Takes effect on the next frame; leaving
    /// dedicated placement stops the owned thread right away.
    pub fn set_placement(&mut self, name: &str, placement: Placement) -> Result<(), SchedError> {
        {
            let mut registry = self.shared.registry.lock();
            let slot = registry
                .slots
                .get_mut(name)
                .ok_or_else(|| SchedError::UnknownSystem(name.to_string()))?;
            slot.placement = placement;
            slot.effective = placement;
            slot.promotion_streak = 0;
            slot.demotion_streak = 0;
            slot.peak_ms = 0.0;
        }

        if !matches!(placement, Placement::DedicatedThread | Placement::Hybrid) {
            if let Some(worker) = self.dedicated.remove(name) {
                worker.stop();
            }
        }

        info!("Placement of `{name}` changed to {placement:?}");
        Ok(())
    }

    /// Pins a system: while critical, it is never demoted off its dedicated
    /// thread. Setting it on a pool system promotes it immediately.
    pub fn set_performance_critical(
        &mut self,
        name: &str,
        critical: bool,
    ) -> Result<(), SchedError> {
        let promote = {
            let mut registry = self.shared.registry.lock();
            let slot = registry
                .slots
                .get_mut(name)
                .ok_or_else(|| SchedError::UnknownSystem(name.to_string()))?;
            slot.performance_critical = critical;
            critical && slot.placement == Placement::WorkerPool
        };

        if promote {
            self.set_placement(name, Placement::DedicatedThread)?;
        }
        Ok(())
    }

    /// Default placement applied by [`Scheduler::add_preferred`] when a
    /// system doesn't care.
    pub fn set_default_placement(&mut self, placement: Placement) {
        self.default_placement = placement;
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Initializes every pending system and begins scheduling frames.
    pub fn start(&mut self) {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.paused.store(false, Ordering::Release);
        self.shared.barrier.reset();

        let pending: Vec<String> = {
            let registry = self.shared.registry.lock();
            registry
                .order
                .iter()
                .filter(|name| !registry.slots[*name].initialized)
                .cloned()
                .collect()
        };
        for name in pending {
            self.init_system(&name);
        }

        info!("Scheduler started ({} systems)", self.system_count());
    }

    /// Stops scheduling: signals and joins every dedicated thread and
    /// releases anything parked on the frame barrier.
    pub fn stop(&mut self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }

        for worker in self.dedicated.values() {
            worker.signal_stop();
        }
        self.shared.gate.wake_all();
        self.shared.barrier.cancel();
        for (_, worker) in self.dedicated.drain() {
            worker.stop();
        }
        self.shared.barrier.reset();
        info!("Scheduler stopped");
    }

    /// Full teardown: stops systems, drains and joins the pool, runs every
    /// system's `shutdown`, and clears all registrations.
    pub fn shutdown(&mut self) {
        self.stop();
        self.pool.shutdown();

        let registry = {
            let mut registry = self.shared.registry.lock();
            std::mem::take(&mut *registry)
        };
        for name in &registry.order {
            let slot = &registry.slots[name];
            if slot.initialized {
                slot.system.lock().shutdown();
            }
        }
        self.shared.supervisor.reset();
        info!("Scheduler shutdown complete");
    }

    /// Rebuilds the worker pool with exactly `n` workers (minimum 1). Legal
    /// only between frames.
    pub fn set_max_threads(&mut self, n: usize) {
        self.pool = WorkerPool::new(n.max(1));
        info!("Worker pool resized to {} workers", self.pool.worker_count());
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.shared.paused.store(paused, Ordering::Release);
    }

    pub fn set_monitoring_enabled(&mut self, enabled: bool) {
        self.shared.monitoring.store(enabled, Ordering::Release);
        if !enabled {
            self.shared.monitor.reset();
        }
    }

    // ------------------------------------------------------------------
    // The frame
    // ------------------------------------------------------------------

    /// Runs one frame. No-op while stopped or paused.
    pub fn update(&mut self, dt: f32) {
        if !self.shared.running.load(Ordering::Acquire) || self.is_paused() {
            return;
        }

        let frame_start = Instant::now();
        let plan = self.classify();

        // One arrival for the main thread, one per dedicated system, one on
        // behalf of the whole pool.
        let participants = 1 + plan.dedicated_active + usize::from(!plan.pool.is_empty());
        self.shared.barrier.set_participants(participants);
        self.shared.barrier.begin_frame();
        self.shared.clock.tick();
        self.shared.gate.open();

        for (name, cell) in &plan.main {
            self.shared.run_system(name, cell, dt);
        }

        let mut handles = Vec::with_capacity(plan.pool.len());
        for (name, cell) in &plan.pool {
            let shared = self.shared.clone();
            let name = name.clone();
            let cell = cell.clone();
            match self.pool.submit(move || {
                shared.run_system(&name, &cell, dt);
            }) {
                Ok(handle) => handles.push(handle),
                Err(error) => warn!("Couldn't submit pool system: {error}"),
            }
        }

        // Synthetic pool arrival: wait until every pool task finished, then
        // arrive once for all of them.
        for handle in handles {
            let _ = handle.join();
        }
        if !plan.pool.is_empty() {
            self.shared.barrier.arrive();
        }

        self.shared.barrier.arrive_and_wait();

        let frame_ms = frame_start.elapsed().as_secs_f64() * 1_000.0;
        self.shared.frame_time_ms.store(frame_ms, Ordering::Release);
        if self.shared.monitoring.load(Ordering::Acquire) {
            self.shared.monitor.record_frame(frame_ms);
        }

        self.update_streaks();
        self.frame_counter += 1;
        if self.frame_counter % self.shared.config.rebalance_interval.max(1) == 0 {
            self.rebalance();
        }
    }

    /// Resolves every enabled system to a concrete placement for this frame,
    /// reconciling dedicated workers (spawn newly-needed ones, stop ones
    /// whose system got disabled or re-resolved elsewhere).
    fn classify(&mut self) -> FramePlan {
        let mut plan = FramePlan::default();
        let mut to_start: Vec<(String, SystemCell, f64)> = Vec::new();
        let mut to_stop: Vec<String> = Vec::new();

        {
            let mut registry = self.shared.registry.lock();
            let order = registry.order.clone();
            for name in &order {
                let slot = registry.slots.get_mut(name).expect("registry order desync");

                if self.shared.supervisor.is_disabled(name) {
                    if self.dedicated.contains_key(name) {
                        to_stop.push(name.clone());
                    }
                    continue;
                }

                let effective = match slot.placement {
                    Placement::Hybrid => resolve_hybrid(name, slot, &self.shared.config),
                    placement => placement,
                };
                slot.effective = effective;

                match effective {
                    Placement::MainThread => plan.main.push((name.clone(), slot.system.clone())),
                    Placement::WorkerPool => {
                        if self.dedicated.contains_key(name) {
                            to_stop.push(name.clone());
                        }
                        plan.pool.push((name.clone(), slot.system.clone()));
                    }
                    Placement::DedicatedThread => {
                        plan.dedicated_active += 1;
                        if !self.dedicated.contains_key(name) {
                            to_start.push((
                                name.clone(),
                                slot.system.clone(),
                                slot.target_interval_ms,
                            ));
                        }
                    }
                    Placement::Hybrid => unreachable!("hybrid resolves to a concrete placement"),
                }
            }
        }

        for name in to_stop {
            if let Some(worker) = self.dedicated.remove(&name) {
                worker.stop();
            }
        }
        for (name, cell, target_ms) in to_start {
            let worker =
                DedicatedWorker::spawn(name.clone(), cell, self.shared.clone(), target_ms);
            self.dedicated.insert(name, worker);
        }

        plan
    }

    /// Accumulates per-frame promotion/demotion evidence. Transitions are
    /// applied by [`Scheduler::rebalance`] on its own cadence.
    fn update_streaks(&self) {
        let config = &self.shared.config;
        let mut registry = self.shared.registry.lock();
        for (name, slot) in registry.slots.iter_mut() {
            if self.shared.supervisor.is_disabled(name)
                || slot.executions() < config.min_executions
            {
                continue;
            }

            match slot.placement {
                Placement::WorkerPool => {
                    if slot.avg.value() > config.frame_budget_ms
                        && slot.peak_ms > config.promotion_peak_ms
                    {
                        slot.promotion_streak += 1;
                    } else {
                        slot.promotion_streak = 0;
                    }
                }
                Placement::DedicatedThread if !slot.performance_critical => {
                    if slot.avg.value() < config.demotion_avg_ms
                        && slot.peak_ms < config.slow_system_ms
                    {
                        slot.demotion_streak += 1;
                    } else {
                        slot.demotion_streak = 0;
                    }
                }
                _ => {}
            }
        }
    }

    /// Applies placement transitions earned by sustained streaks. Promotion
    /// spawns the dedicated loop at the top of the next frame; demotion
    /// stops it here, after its final barrier arrival has completed.
    fn rebalance(&mut self) {
        let config = &self.shared.config;
        let mut promotions: Vec<(String, f64)> = Vec::new();
        let mut demotions: Vec<(String, f64)> = Vec::new();

        {
            let mut registry = self.shared.registry.lock();
            for (name, slot) in registry.slots.iter_mut() {
                if slot.placement == Placement::WorkerPool
                    && slot.promotion_streak > config.promotion_streak
                {
                    slot.placement = Placement::DedicatedThread;
                    slot.promotion_streak = 0;
                    slot.demotion_streak = 0;
                    slot.peak_ms = 0.0;
                    promotions.push((name.clone(), slot.avg.value()));
                } else if slot.placement == Placement::DedicatedThread
                    && !slot.performance_critical
                    && slot.demotion_streak > config.demotion_streak
                {
                    slot.placement = Placement::WorkerPool;
                    slot.promotion_streak = 0;
                    slot.demotion_streak = 0;
                    slot.peak_ms = 0.0;
                    demotions.push((name.clone(), slot.avg.value()));
                }
            }
        }

        for (name, avg_ms) in promotions {
            info!("Promoted `{name}` to a dedicated thread (avg {avg_ms:.2} ms)");
        }
        for (name, avg_ms) in demotions {
            if let Some(worker) = self.dedicated.remove(&name) {
                worker.stop();
            }
            info!("Demoted `{name}` back to the worker pool (avg {avg_ms:.2} ms)");
        }
    }

    fn init_system(&self, name: &str) {
        let cell = {
            let registry = self.shared.registry.lock();
            match registry.slots.get(name) {
                Some(slot) => slot.system.clone(),
                None => return,
            }
        };

        let outcome = {
            let mut system = cell.lock();
            panic::catch_unwind(AssertUnwindSafe(|| system.init()))
                .unwrap_or_else(|payload| Err(anyhow!(super::pool::panic_message(payload.as_ref()))))
        };

        match outcome {
            Ok(()) => {
                let mut registry = self.shared.registry.lock();
                if let Some(slot) = registry.slots.get_mut(name) {
                    slot.initialized = true;
                }
                debug!("Initialized system `{name}`");
            }
            Err(error) => {
                let notice = self.shared.supervisor.record_init_failure(name, &error);
                self.shared.bus.publish(notice);
            }
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn system_names(&self) -> Vec<String> {
        self.shared.registry.lock().order.clone()
    }

    pub fn system_count(&self) -> usize {
        self.shared.registry.lock().slots.len()
    }

    pub fn system_info(&self, name: &str) -> Option<SystemInfo> {
        self.shared
            .registry
            .lock()
            .slots
            .get(name)
            .map(|slot| SystemInfo {
                placement: slot.placement,
                effective: slot.effective,
                avg_ms: slot.avg.value(),
                peak_ms: slot.peak_ms,
                executions: slot.executions(),
                performance_critical: slot.performance_critical,
                target_interval_ms: slot.target_interval_ms,
                last_update: slot.last_update,
            })
    }

    pub fn pool_info(&self) -> PoolInfo {
        PoolInfo {
            worker_count: self.pool.worker_count(),
            queued_tasks: self.pool.queued_count(),
            active_tasks: self.pool.active_count(),
            avg_task_ms: self.pool.avg_task_ms(),
        }
    }

    /// True when the named system is registered, enabled, and the scheduler
    /// is actually scheduling frames.
    pub fn is_system_active(&self, name: &str) -> bool {
        self.is_running()
            && !self.is_paused()
            && !self.shared.supervisor.is_disabled(name)
            && self.shared.registry.lock().slots.contains_key(name)
    }

    /// True when no system is mid-update anywhere.
    pub fn all_idle(&self) -> bool {
        if !self.is_running() || self.is_paused() {
            return true;
        }
        self.pool.active_count() == 0
            && self
                .dedicated
                .values()
                .all(|worker| worker.state() != WorkerState::Running)
    }

    pub fn frame_time_ms(&self) -> f64 {
        self.shared.frame_time_ms.load(Ordering::Acquire)
    }

    pub fn fps(&self) -> f64 {
        let smoothed = self.shared.monitor.avg_fps();
        if smoothed > 0.0 {
            smoothed
        } else {
            self.shared.clock.fps()
        }
    }

    pub fn clock(&self) -> &GameClock {
        &self.shared.clock
    }

    pub fn monitor(&self) -> &PerfMonitor {
        &self.shared.monitor
    }

    pub fn error_snapshot(&self, name: &str) -> Option<super::ErrorSnapshot> {
        self.shared.supervisor.snapshot(name)
    }

    pub fn barrier_participants(&self) -> usize {
        self.shared.barrier.participants()
    }

    pub fn barrier_epoch(&self) -> u64 {
        self.shared.barrier.epoch()
    }

    /// Human-readable performance summary, one line per subject.
    pub fn performance_report(&self) -> Vec<String> {
        let mut report = Vec::new();
        report.push(format!(
            "Frame: {:.2} ms ({:.1} FPS)",
            self.frame_time_ms(),
            self.fps()
        ));

        let pool = self.pool_info();
        report.push(format!(
            "Pool: {} workers, {} queued, {} active, avg task {:.2} ms",
            pool.worker_count, pool.queued_tasks, pool.active_tasks, pool.avg_task_ms
        ));

        for name in self.shared.monitor.monitored_systems() {
            let mut line = format!(
                "{name}: avg {:.2} ms, peak {:.2} ms, {} updates",
                self.shared.monitor.system_avg_ms(&name),
                self.shared.monitor.system_peak_ms(&name),
                self.shared.monitor.system_sample_count(&name)
            );
            if let Some(errors) = self.shared.supervisor.snapshot(&name) {
                if errors.count > 0 {
                    line.push_str(&format!(", {} errors", errors.count));
                    if errors.disabled {
                        line.push_str(" (DISABLED)");
                    }
                }
            }
            report.push(line);
        }

        report
    }

    /// Zeroes performance and supervision counters without touching
    /// registrations.
    pub fn reset_performance_counters(&mut self) {
        self.shared.monitor.reset();
        self.shared.supervisor.reset();

        let mut registry = self.shared.registry.lock();
        for slot in registry.slots.values_mut() {
            slot.avg.reset();
            slot.peak_ms = 0.0;
            slot.promotion_streak = 0;
            slot.demotion_streak = 0;
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// First-match-wins placement rules for `Hybrid` systems.
fn resolve_hybrid(name: &str, slot: &SystemSlot, config: &SchedConfig) -> Placement {
    #[cfg(feature = "name-heuristics")]
    {
        if ["Render", "Physics", "Audio"].iter().any(|tag| name.contains(tag)) {
            return Placement::DedicatedThread;
        }
        if ["UI", "Input", "Event"].iter().any(|tag| name.contains(tag)) {
            return Placement::MainThread;
        }
    }
    #[cfg(not(feature = "name-heuristics"))]
    let _ = name;

    if slot.avg.value() > config.slow_system_ms && slot.executions() > config.min_executions {
        return Placement::DedicatedThread;
    }
    Placement::WorkerPool
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ErrorSnapshot, SystemDisabled};
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn fixture(config: SchedConfig) -> Scheduler {
        let _ = pretty_env_logger::formatted_builder().is_test(true).try_init();
        Scheduler::new(Arc::new(World::new()), Arc::new(MessageBus::new()), config)
    }

    /// Config scaled down so promotion/demotion happen within a test run.
    fn snappy_config() -> SchedConfig {
        SchedConfig {
            max_threads: 2,
            target_interval_ms: 0.5,
            sample_window: 5,
            frame_window: 10,
            slow_system_ms: 2.0,
            frame_budget_ms: 2.0,
            promotion_peak_ms: 2.5,
            demotion_avg_ms: 1.0,
            promotion_streak: 5,
            demotion_streak: 5,
            min_executions: 3,
            rebalance_interval: 10,
            ..SchedConfig::default()
        }
    }

    struct SleepySystem {
        name: &'static str,
        delay: Arc<AtomicU64>,
        runs: Arc<AtomicUsize>,
    }

    impl SleepySystem {
        fn boxed(name: &'static str, delay_ms: u64) -> (Box<dyn System>, Arc<AtomicUsize>, Arc<AtomicU64>) {
            let runs = Arc::new(AtomicUsize::new(0));
            let delay = Arc::new(AtomicU64::new(delay_ms));
            let system = Box::new(SleepySystem {
                name,
                delay: delay.clone(),
                runs: runs.clone(),
            });
            (system, runs, delay)
        }
    }

    impl System for SleepySystem {
        fn name(&self) -> &'static str {
            self.name
        }

        fn update(&mut self, _dt: f32) -> hegemon_utils::AnyResult {
            let delay = self.delay.load(Ordering::Acquire);
            if delay > 0 {
                thread::sleep(Duration::from_millis(delay));
            }
            self.runs.fetch_add(1, Ordering::AcqRel);
            Ok(())
        }
    }

    struct FailingSystem {
        attempts: Arc<AtomicUsize>,
    }

    impl System for FailingSystem {
        fn name(&self) -> &'static str {
            "BrokenLevySystem"
        }

        fn update(&mut self, _dt: f32) -> hegemon_utils::AnyResult {
            self.attempts.fetch_add(1, Ordering::AcqRel);
            Err(anyhow!("levies refuse to muster"))
        }
    }

    struct LifecycleProbe {
        inits: Arc<AtomicUsize>,
        shutdowns: Arc<AtomicUsize>,
        fail_init: bool,
        runs: Arc<AtomicUsize>,
    }

    impl System for LifecycleProbe {
        fn name(&self) -> &'static str {
            "LifecycleProbe"
        }

        fn init(&mut self) -> hegemon_utils::AnyResult {
            self.inits.fetch_add(1, Ordering::AcqRel);
            if self.fail_init {
                return Err(anyhow!("missing census data"));
            }
            Ok(())
        }

        fn update(&mut self, _dt: f32) -> hegemon_utils::AnyResult {
            self.runs.fetch_add(1, Ordering::AcqRel);
            Ok(())
        }

        fn shutdown(&mut self) {
            self.shutdowns.fetch_add(1, Ordering::AcqRel);
        }
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut sched = fixture(snappy_config());
        let (first, _, _) = SleepySystem::boxed("Economy", 0);
        let (second, _, _) = SleepySystem::boxed("Economy", 0);

        sched.add(first, Placement::MainThread).unwrap();
        assert!(matches!(
            sched.add(second, Placement::MainThread),
            Err(SchedError::DuplicateName(name)) if name == "Economy"
        ));

        assert!(matches!(
            sched.remove("Nonexistent"),
            Err(SchedError::UnknownSystem(_))
        ));
    }

    #[test]
    fn update_is_a_noop_while_stopped_or_paused() {
        let mut sched = fixture(snappy_config());
        let (system, runs, _) = SleepySystem::boxed("Economy", 0);
        sched.add(system, Placement::MainThread).unwrap();

        sched.update(0.016);
        assert_eq!(runs.load(Ordering::Acquire), 0);

        sched.start();
        sched.set_paused(true);
        sched.update(0.016);
        assert_eq!(runs.load(Ordering::Acquire), 0);

        sched.set_paused(false);
        sched.update(0.016);
        assert_eq!(runs.load(Ordering::Acquire), 1);
        assert_eq!(sched.clock().frame_number(), 1);
    }

    // Scenario: four 5 ms pool systems on four workers finish well inside
    // the time a serial run would need, and the barrier advances once.
    #[test]
    fn pool_systems_run_in_parallel() {
        let config = SchedConfig {
            max_threads: 4,
            ..snappy_config()
        };
        let mut sched = fixture(config);

        let mut all_runs = Vec::new();
        for name in ["FiefA", "FiefB", "FiefC", "FiefD"] {
            let (system, runs, _) = SleepySystem::boxed(name, 5);
            sched.add(system, Placement::WorkerPool).unwrap();
            all_runs.push(runs);
        }

        sched.start();
        sched.update(0.016);

        for runs in &all_runs {
            assert_eq!(runs.load(Ordering::Acquire), 1);
        }
        // Serial execution would take at least 20 ms.
        assert!(
            sched.frame_time_ms() < 15.0,
            "frame took {:.2} ms",
            sched.frame_time_ms()
        );
        for name in ["FiefA", "FiefB", "FiefC", "FiefD"] {
            let avg = sched.monitor().system_avg_ms(name);
            assert!((5.0..12.0).contains(&avg), "{name} averaged {avg:.2} ms");
        }
        assert_eq!(sched.pool_info().worker_count, 4);
        assert_eq!(sched.barrier_epoch(), 1);
        assert_eq!(sched.barrier_participants(), 2); // main + pool
    }

    // Scenario: a chronically slow pool system is promoted to a dedicated
    // thread, keeps executing there, and is demoted once it quiets down.
    #[test]
    fn slow_pool_systems_are_promoted_then_demoted() {
        let mut sched = fixture(snappy_config());
        let (system, runs, delay) = SleepySystem::boxed("Pathfinding", 4);
        sched.add(system, Placement::WorkerPool).unwrap();
        sched.start();

        for _ in 0..12 {
            sched.update(0.016);
        }

        let info = sched.system_info("Pathfinding").unwrap();
        assert_eq!(info.placement, Placement::DedicatedThread);
        assert!(info.executions >= 10);

        // Dedicated participant replaces the pool's synthetic arrival.
        let runs_before = runs.load(Ordering::Acquire);
        sched.update(0.016);
        assert_eq!(sched.barrier_participants(), 2); // main + dedicated
        for _ in 0..4 {
            sched.update(0.016);
        }
        assert!(runs.load(Ordering::Acquire) > runs_before);

        // Quiet down and wait out the demotion streak.
        delay.store(0, Ordering::Release);
        for _ in 0..25 {
            sched.update(0.016);
        }

        let info = sched.system_info("Pathfinding").unwrap();
        assert_eq!(info.placement, Placement::WorkerPool);
        sched.shutdown();
    }

    // Scenario: a main-thread system that fails every frame is disabled
    // after five errors; the rest of the realm keeps simulating.
    #[test]
    fn chronically_failing_systems_are_disabled() {
        let mut sched = fixture(snappy_config());
        let notices: Arc<Mutex<Vec<SystemDisabled>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let notices = notices.clone();
            sched.bus().subscribe::<SystemDisabled, _>(move |notice| {
                notices.lock().push(notice.clone());
            });
        }

        let attempts = Arc::new(AtomicUsize::new(0));
        sched
            .add(
                Box::new(FailingSystem {
                    attempts: attempts.clone(),
                }),
                Placement::MainThread,
            )
            .unwrap();
        let (healthy, healthy_runs, _) = SleepySystem::boxed("Taxation", 0);
        sched.add(healthy, Placement::MainThread).unwrap();

        sched.start();
        for _ in 0..10 {
            sched.update(0.016);
        }

        // Five attempts, then never scheduled again.
        assert_eq!(attempts.load(Ordering::Acquire), 5);
        assert_eq!(healthy_runs.load(Ordering::Acquire), 10);
        assert!(!sched.is_system_active("BrokenLevySystem"));

        let notices = notices.lock();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].name, "BrokenLevySystem");
        assert_eq!(notices[0].error_count, 5);
        assert!(notices[0].last_error.contains("levies refuse to muster"));

        let snapshot: ErrorSnapshot = sched.error_snapshot("BrokenLevySystem").unwrap();
        assert!(snapshot.disabled);

        // Only remove + add can revive the name.
        sched.remove("BrokenLevySystem").unwrap();
        let (revived, revived_runs, _) = SleepySystem::boxed("BrokenLevySystem", 0);
        sched.add(revived, Placement::MainThread).unwrap();
        sched.update(0.016);
        assert_eq!(revived_runs.load(Ordering::Acquire), 1);
    }

    // Scenario: mixed placements over many frames; the barrier epoch
    // advances exactly once per frame and a jittery dedicated system
    // stretches its frame without desynchronizing anything.
    #[test]
    fn barrier_epochs_stay_in_lockstep_across_placements() {
        struct JitterSystem {
            iterations: AtomicUsize,
            runs: Arc<AtomicUsize>,
        }

        impl System for JitterSystem {
            fn name(&self) -> &'static str {
                "WeatherFront"
            }

            fn update(&mut self, _dt: f32) -> hegemon_utils::AnyResult {
                if self.iterations.fetch_add(1, Ordering::AcqRel) == 24 {
                    thread::sleep(Duration::from_millis(30));
                }
                self.runs.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
        }

        // Rebalancing is out of scope here; park it beyond the test length.
        let config = SchedConfig {
            rebalance_interval: 100_000,
            ..snappy_config()
        };
        let mut sched = fixture(config);
        let (main_system, main_runs, _) = SleepySystem::boxed("CourtIntrigue", 0);
        sched.add(main_system, Placement::MainThread).unwrap();

        let mut pool_runs = Vec::new();
        for name in ["Harvest", "Herding"] {
            let (system, runs, _) = SleepySystem::boxed(name, 1);
            sched.add(system, Placement::WorkerPool).unwrap();
            pool_runs.push(runs);
        }

        let jitter_runs = Arc::new(AtomicUsize::new(0));
        sched
            .add(
                Box::new(JitterSystem {
                    iterations: AtomicUsize::new(0),
                    runs: jitter_runs.clone(),
                }),
                Placement::DedicatedThread,
            )
            .unwrap();

        sched.start();
        let mut frame_times = Vec::new();
        for _ in 0..50 {
            sched.update(0.016);
            frame_times.push(sched.frame_time_ms());
        }

        assert_eq!(sched.barrier_epoch(), 50);
        assert_eq!(sched.barrier_participants(), 3); // main + pool + dedicated
        assert_eq!(main_runs.load(Ordering::Acquire), 50);
        for runs in &pool_runs {
            assert_eq!(runs.load(Ordering::Acquire), 50);
        }
        assert_eq!(jitter_runs.load(Ordering::Acquire), 50);

        // The jitter frame stretched, and the frames around it did not
        // start early.
        assert!(frame_times[24] >= 25.0, "jitter frame was {:.2} ms", frame_times[24]);

        sched.shutdown();
    }

    #[test]
    fn explicit_placement_changes_take_effect_next_frame() {
        let mut sched = fixture(snappy_config());
        let (system, runs, _) = SleepySystem::boxed("Minting", 0);
        sched.add(system, Placement::WorkerPool).unwrap();
        sched.start();
        sched.update(0.016);
        assert_eq!(runs.load(Ordering::Acquire), 1);

        sched.set_placement("Minting", Placement::DedicatedThread).unwrap();
        for _ in 0..3 {
            sched.update(0.016);
        }
        assert_eq!(runs.load(Ordering::Acquire), 4);
        assert_eq!(
            sched.system_info("Minting").unwrap().effective,
            Placement::DedicatedThread
        );

        sched.set_placement("Minting", Placement::MainThread).unwrap();
        sched.update(0.016);
        assert_eq!(runs.load(Ordering::Acquire), 5);
        sched.shutdown();
    }

    #[test]
    fn performance_critical_systems_resist_demotion() {
        let mut sched = fixture(snappy_config());
        let (system, _, _) = SleepySystem::boxed("Minstrels", 0);
        sched.add(system, Placement::WorkerPool).unwrap();
        sched.set_performance_critical("Minstrels", true).unwrap();

        // The pin itself promotes pool systems.
        assert_eq!(
            sched.system_info("Minstrels").unwrap().placement,
            Placement::DedicatedThread
        );

        sched.start();
        // Fast updates forever, yet no demotion while pinned.
        for _ in 0..25 {
            sched.update(0.016);
        }
        assert_eq!(
            sched.system_info("Minstrels").unwrap().placement,
            Placement::DedicatedThread
        );
        sched.shutdown();
    }

    #[cfg(feature = "name-heuristics")]
    #[test]
    fn hybrid_resolution_honors_name_rules() {
        let mut sched = fixture(snappy_config());
        let (render, _, _) = SleepySystem::boxed("RenderScene", 0);
        let (ui, ui_runs, _) = SleepySystem::boxed("UIOverlay", 0);
        let (plain, _, _) = SleepySystem::boxed("Fishing", 0);
        sched.add(render, Placement::Hybrid).unwrap();
        sched.add(ui, Placement::Hybrid).unwrap();
        sched.add(plain, Placement::Hybrid).unwrap();

        sched.start();
        sched.update(0.016);

        assert_eq!(
            sched.system_info("RenderScene").unwrap().effective,
            Placement::DedicatedThread
        );
        assert_eq!(
            sched.system_info("UIOverlay").unwrap().effective,
            Placement::MainThread
        );
        assert_eq!(
            sched.system_info("Fishing").unwrap().effective,
            Placement::WorkerPool
        );
        assert_eq!(ui_runs.load(Ordering::Acquire), 1);
        sched.shutdown();
    }

    #[test]
    fn init_failure_disables_before_the_first_update() {
        let mut sched = fixture(snappy_config());
        let inits = Arc::new(AtomicUsize::new(0));
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));
        sched
            .add(
                Box::new(LifecycleProbe {
                    inits: inits.clone(),
                    shutdowns: shutdowns.clone(),
                    fail_init: true,
                    runs: runs.clone(),
                }),
                Placement::MainThread,
            )
            .unwrap();

        sched.start();
        for _ in 0..3 {
            sched.update(0.016);
        }

        assert_eq!(inits.load(Ordering::Acquire), 1);
        assert_eq!(runs.load(Ordering::Acquire), 0);
        assert!(sched.error_snapshot("LifecycleProbe").unwrap().disabled);
    }

    #[test]
    fn shutdown_runs_system_shutdown_exactly_once() {
        let mut sched = fixture(snappy_config());
        let inits = Arc::new(AtomicUsize::new(0));
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));
        sched
            .add(
                Box::new(LifecycleProbe {
                    inits: inits.clone(),
                    shutdowns: shutdowns.clone(),
                    fail_init: false,
                    runs: runs.clone(),
                }),
                Placement::MainThread,
            )
            .unwrap();

        sched.start();
        sched.update(0.016);
        sched.shutdown();
        sched.shutdown();

        assert_eq!(inits.load(Ordering::Acquire), 1);
        assert_eq!(runs.load(Ordering::Acquire), 1);
        assert_eq!(shutdowns.load(Ordering::Acquire), 1);
        assert_eq!(sched.system_count(), 0);

        // The pool is drained and closed.
        assert_eq!(sched.pool_info().active_tasks, 0);
        assert_eq!(sched.pool_info().queued_tasks, 0);
    }

    #[test]
    fn performance_report_mentions_every_monitored_system() {
        let mut sched = fixture(snappy_config());
        let (system, _, _) = SleepySystem::boxed("Economy", 1);
        sched.add(system, Placement::MainThread).unwrap();
        sched.start();
        sched.update(0.016);

        let report = sched.performance_report();
        assert!(report[0].starts_with("Frame:"));
        assert!(report[1].starts_with("Pool:"));
        assert!(report.iter().any(|line| line.starts_with("Economy:")));

        sched.reset_performance_counters();
        assert_eq!(sched.monitor().system_sample_count("Economy"), 0);
        assert_eq!(sched.system_info("Economy").unwrap().executions, 0);
    }

    #[test]
    fn set_max_threads_rebuilds_the_pool() {
        let mut sched = fixture(snappy_config());
        assert_eq!(sched.pool_info().worker_count, 2);
        sched.set_max_threads(5);
        assert_eq!(sched.pool_info().worker_count, 5);

        let (system, runs, _) = SleepySystem::boxed("Logging", 0);
        sched.add(system, Placement::WorkerPool).unwrap();
        sched.start();
        sched.update(0.016);
        assert_eq!(runs.load(Ordering::Acquire), 1);
    }
}
