//! The simulated time engine.
//!
//! A logical clock advances the game calendar in whole hours and fans
//! boundary ticks out to subscribers in a fixed order: HOURLY, then DAILY,
//! MONTHLY, and YEARLY as each larger boundary is crossed. Scheduled events
//! and in-transit messages ride on the same ticks; both are stored as
//! entities in the [`World`](crate::world::World) and destroyed exactly once
//! when they execute, arrive, or are cancelled.
//!
//! The engine itself runs as a main-thread [`System`] inside the scheduler;
//! everything else talks to it through a cloneable [`TimeHandle`].

use crate::bus::MessageBus;
use crate::engine::{Placement, System};
use crate::world::{Entity, World};
use ahash::AHashMap;
use hegemon_utils::AnyResult;
use log::*;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

#[doc(inline)]
pub use date::*;
mod date;

#[doc(inline)]
pub use routes::*;
mod routes;

#[doc(inline)]
pub use save::*;
mod save;

#[doc(inline)]
pub use transit::*;
mod transit;

// ----------------------------------------------------------------------
// Messages published on the bus
// ----------------------------------------------------------------------

/// One tick boundary fired this frame.
#[derive(Debug, Clone)]
pub struct TickOccurred {
    pub class: TickClass,
    pub date: GameDate,
    pub processing_ms: f64,
}

/// The calendar moved for a reason other than normal ticking.
#[derive(Debug, Clone)]
pub struct DateChanged {
    pub old: GameDate,
    pub new: GameDate,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct TimeScaleChanged {
    pub old: TimeScale,
    pub new: TimeScale,
    pub date: GameDate,
}

#[derive(Debug, Clone)]
pub struct EventScheduled {
    pub event_id: String,
    pub when: GameDate,
    pub class: TickClass,
}

#[derive(Debug, Clone)]
pub struct EventExecuted {
    pub event_id: String,
    pub date: GameDate,
    pub payload: String,
}

#[derive(Debug, Clone)]
pub struct MessageDelivered {
    pub message_id: String,
    pub date: GameDate,
    pub from_location: String,
    pub to_location: String,
}

// ----------------------------------------------------------------------
// Configuration and errors
// ----------------------------------------------------------------------

/// Time engine tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeConfig {
    pub start_date: GameDate,
    /// Logical hours that pass per real second at normal speed.
    pub hours_per_second: f64,
    /// Courier speeds, in km/h. The historical figures: a rider with relay
    /// horses against a man on foot.
    pub urgent_speed_kmh: f64,
    pub routine_speed_kmh: f64,
    /// Flat delivery delays used when no route connects two locations.
    pub urgent_fallback_days: i64,
    pub routine_fallback_days: i64,
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            start_date: GameDate::new(1066, 10, 14, 0),
            hours_per_second: 1.0,
            urgent_speed_kmh: 4.0,
            routine_speed_kmh: 2.0,
            urgent_fallback_days: 1,
            routine_fallback_days: 3,
        }
    }
}

#[derive(Debug, Error)]
pub enum TimeError {
    #[error("invalid game date {year:04}-{month:02}-{day:02} {hour:02}:00")]
    InvalidDate {
        year: i32,
        month: u8,
        day: u8,
        hour: u8,
    },

    #[error("unknown time scale ordinal {0}")]
    InvalidScale(u8),

    #[error("no route between `{from}` and `{to}`")]
    InvalidRoute { from: String, to: String },

    #[error("malformed time save state: {0}")]
    MalformedSave(String),

    #[error("the time engine has been shut down")]
    EngineStopped,
}

// ----------------------------------------------------------------------
// Components
// ----------------------------------------------------------------------

/// Attached to entities whose age in game years should be kept current.
/// Recomputed on every DAILY tick.
#[derive(Debug, Clone, Copy)]
pub struct Age {
    pub born: GameDate,
    pub years: u32,
}

fn years_between(born: GameDate, now: GameDate) -> u32 {
    let mut years = now.year - born.year;
    if (now.month, now.day, now.hour) < (born.month, born.day, born.hour) {
        years -= 1;
    }
    years.max(0) as u32
}

// ----------------------------------------------------------------------
// The engine core
// ----------------------------------------------------------------------

/// Callbacks receive the post-tick date and the class that fired. They run
/// on the scheduler's main thread and must not block.
pub type TickCallback = Box<dyn FnMut(GameDate, TickClass) + Send>;

enum PendingOp {
    Subscribe(TickClass, String, TickCallback),
    Unsubscribe(TickClass, String),
}

/// Per-class processing costs and queue depths, for diagnostics panels.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub hourly_ms: f64,
    pub daily_ms: f64,
    pub monthly_ms: f64,
    pub yearly_ms: f64,
    pub active_events: usize,
    pub messages_in_transit: usize,
    pub tracked_entities: usize,
}

struct TimeCore {
    config: TimeConfig,
    date: GameDate,
    scale: TimeScale,
    paused: bool,
    stopped: bool,
    /// Fractional hours carried between frames.
    hour_accumulator: f64,
    routes: RouteNetwork,
    /// Callback bindings per tick class, in insertion order.
    callbacks: [Vec<(String, TickCallback)>; 4],
    callback_failures: AHashMap<String, u64>,
    /// Subscription changes made from inside a fan-out; applied after it.
    pending_ops: Vec<PendingOp>,
    fanout_depth: u32,
    tick_costs_ms: [f64; 4],
}

impl TimeCore {
    fn apply_subscribe(&mut self, class: TickClass, name: String, callback: TickCallback) {
        let bindings = &mut self.callbacks[class.index()];
        match bindings.iter_mut().find(|(existing, _)| *existing == name) {
            // Replacing keeps the original position in the firing order.
            Some((_, slot)) => *slot = callback,
            None => bindings.push((name, callback)),
        }
    }

    fn apply_unsubscribe(&mut self, class: TickClass, name: &str) {
        self.callbacks[class.index()].retain(|(existing, _)| existing != name);
    }
}

/// Cloneable handle to the time engine. All operations are safe from any
/// thread; tick fan-out itself only ever runs on the scheduler's main
/// thread via [`TimeSystem::update`].
#[derive(Clone)]
pub struct TimeHandle {
    core: Arc<Mutex<TimeCore>>,
    world: Arc<World>,
    bus: Arc<MessageBus>,
}

impl TimeHandle {
    // ------------------------------------------------------------------
    // Clock control
    // ------------------------------------------------------------------

    pub fn current_date(&self) -> GameDate {
        self.core.lock().date
    }

    pub fn scale(&self) -> TimeScale {
        self.core.lock().scale
    }

    pub fn is_paused(&self) -> bool {
        self.core.lock().paused
    }

    pub fn pause(&self) {
        let date = {
            let mut core = self.core.lock();
            core.paused = true;
            core.date
        };
        self.bus.publish(DateChanged {
            old: date,
            new: date,
            reason: String::from("Game paused"),
        });
    }

    pub fn resume(&self) {
        let date = {
            let mut core = self.core.lock();
            core.paused = false;
            core.date
        };
        self.bus.publish(DateChanged {
            old: date,
            new: date,
            reason: String::from("Game resumed"),
        });
    }

    /// Changes the simulation speed. The fractional-hour accumulator is
    /// cleared so a speed change never releases a clump of stale ticks.
    pub fn set_scale(&self, scale: TimeScale) {
        let (old, date) = {
            let mut core = self.core.lock();
            let old = core.scale;
            core.scale = scale;
            core.hour_accumulator = 0.0;
            (old, core.date)
        };
        self.bus.publish(TimeScaleChanged {
            old,
            new: scale,
            date,
        });
    }

    /// Jumps the calendar to an arbitrary date.
    pub fn set_date(&self, date: GameDate) {
        let old = {
            let mut core = self.core.lock();
            let old = core.date;
            core.date = date;
            old
        };
        self.bus.publish(DateChanged {
            old,
            new: date,
            reason: String::from("Manual date change"),
        });
    }

    /// Convenience for "this much later than now".
    pub fn future_date(&self, hours: i64, days: i64, months: i64, years: i32) -> GameDate {
        self.current_date()
            .add_years(years)
            .add_months(months)
            .add_days(days)
            .add_hours(hours)
    }

    // ------------------------------------------------------------------
    // Scheduled events
    // ------------------------------------------------------------------

    /// Arms an event. A date in the past is accepted and fires on the next
    /// qualifying tick. Returns the entity handle; cancel through it or by
    /// id.
    pub fn schedule_event(
        &self,
        event_id: &str,
        when: GameDate,
        class: TickClass,
        payload: &str,
        repeat_hours: Option<u32>,
    ) -> Result<Entity, TimeError> {
        if self.core.lock().stopped {
            return Err(TimeError::EngineStopped);
        }

        let entity = self.world.spawn();
        self.world.insert(
            entity,
            ScheduledEvent {
                event_id: event_id.to_string(),
                when,
                class,
                payload: payload.to_string(),
                repeat_hours,
            },
        );

        debug!("Scheduled event `{event_id}` for {when} ({class:?})");
        self.bus.publish(EventScheduled {
            event_id: event_id.to_string(),
            when,
            class,
        });
        Ok(entity)
    }

    /// Cancels through the handle returned by `schedule_event`.
    pub fn cancel_event(&self, entity: Entity) -> bool {
        if self.world.get::<ScheduledEvent>(entity).is_some() {
            self.world.despawn(entity)
        } else {
            false
        }
    }

    /// Cancels the first event with a matching id.
    pub fn cancel_event_by_id(&self, event_id: &str) -> bool {
        for entity in self.world.entities_with::<ScheduledEvent>() {
            let matches = self
                .world
                .with::<ScheduledEvent, _>(entity, |event| event.event_id == event_id)
                .unwrap_or(false);
            if matches {
                self.world.despawn(entity);
                debug!("Cancelled scheduled event `{event_id}`");
                return true;
            }
        }
        false
    }

    pub fn scheduled_event_count(&self) -> usize {
        self.world.count::<ScheduledEvent>()
    }

    // ------------------------------------------------------------------
    // Messages in transit
    // ------------------------------------------------------------------

    /// Dispatches a courier. Delivery is automatic once the expected
    /// arrival date is reached.
    pub fn send_message(
        &self,
        message_id: &str,
        from: &str,
        to: &str,
        payload: &str,
        class: CourierClass,
        urgent: bool,
    ) -> Result<Entity, TimeError> {
        let (sent, plan) = {
            let core = self.core.lock();
            if core.stopped {
                return Err(TimeError::EngineStopped);
            }
            let plan = plan_travel(&core.routes, &core.config, from, to, urgent, core.date);
            (core.date, plan)
        };

        let entity = self.world.spawn();
        self.world.insert(
            entity,
            TransitMessage {
                message_id: message_id.to_string(),
                from_location: from.to_string(),
                to_location: to.to_string(),
                payload: payload.to_string(),
                class,
                urgent,
                sent,
                expected_arrival: plan.expected_arrival,
                distance_km: plan.distance_km,
                speed_kmh: plan.speed_kmh,
            },
        );

        debug!(
            "Message `{message_id}` {from} -> {to}, expected {}",
            plan.expected_arrival
        );
        Ok(entity)
    }

    pub fn messages_in_transit(&self) -> usize {
        self.world.count::<TransitMessage>()
    }

    // ------------------------------------------------------------------
    // Routes
    // ------------------------------------------------------------------

    pub fn add_route(&self, from: &str, to: &str, distance_km: f64) {
        self.core.lock().routes.add_route(from, to, distance_km);
    }

    pub fn remove_route(&self, from: &str, to: &str) -> bool {
        self.core.lock().routes.remove_route(from, to)
    }

    /// Distance in km; infinity when the locations are disconnected.
    pub fn distance(&self, from: &str, to: &str) -> f64 {
        self.core.lock().routes.distance(from, to)
    }

    /// Like [`TimeHandle::distance`] but unreachable is a hard error.
    pub fn distance_checked(&self, from: &str, to: &str) -> Result<f64, TimeError> {
        let distance = self.distance(from, to);
        if distance.is_finite() {
            Ok(distance)
        } else {
            Err(TimeError::InvalidRoute {
                from: from.to_string(),
                to: to.to_string(),
            })
        }
    }

    pub fn set_route_quality(&self, from: &str, to: &str, quality: f64) -> bool {
        self.core.lock().routes.set_quality(from, to, quality)
    }

    pub fn set_seasonal_modifier(&self, modifier: f64) {
        self.core.lock().routes.set_seasonal_modifier(modifier);
    }

    // ------------------------------------------------------------------
    // Tick subscriptions
    // ------------------------------------------------------------------

    /// Registers `callback` for a tick class. A duplicate name replaces the
    /// existing binding in place, keeping its position in the firing order.
    pub fn on_tick(
        &self,
        class: TickClass,
        name: &str,
        callback: impl FnMut(GameDate, TickClass) + Send + 'static,
    ) {
        let mut core = self.core.lock();
        let callback: TickCallback = Box::new(callback);
        if core.fanout_depth > 0 {
            core.pending_ops
                .push(PendingOp::Subscribe(class, name.to_string(), callback));
        } else {
            core.apply_subscribe(class, name.to_string(), callback);
        }
    }

    pub fn off_tick(&self, class: TickClass, name: &str) {
        let mut core = self.core.lock();
        if core.fanout_depth > 0 {
            core.pending_ops
                .push(PendingOp::Unsubscribe(class, name.to_string()));
        } else {
            core.apply_unsubscribe(class, name);
        }
    }

    /// How many times the named callback has panicked during fan-out.
    pub fn callback_failures(&self, name: &str) -> u64 {
        self.core
            .lock()
            .callback_failures
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // Age tracking
    // ------------------------------------------------------------------

    /// Starts keeping the entity's [`Age`] current on DAILY ticks.
    pub fn track_age(&self, entity: Entity, born: GameDate) {
        let years = years_between(born, self.current_date());
        self.world.insert(entity, Age { born, years });
    }

    pub fn untrack_age(&self, entity: Entity) -> bool {
        self.world.remove::<Age>(entity)
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    pub fn save(&self) -> SaveState {
        let core = self.core.lock();
        SaveState::new(core.date, core.scale, core.paused)
    }

    pub fn save_toml(&self) -> String {
        self.save().to_toml()
    }

    pub fn load(&self, state: &SaveState) -> Result<(), TimeError> {
        let (date, scale, paused) = state.unpack()?;
        let (old_date, old_scale) = {
            let mut core = self.core.lock();
            let previous = (core.date, core.scale);
            core.date = date;
            core.scale = scale;
            core.paused = paused;
            core.hour_accumulator = 0.0;
            previous
        };

        self.bus.publish(DateChanged {
            old: old_date,
            new: date,
            reason: String::from("State loaded"),
        });
        if old_scale != scale {
            self.bus.publish(TimeScaleChanged {
                old: old_scale,
                new: scale,
                date,
            });
        }
        info!("Time state loaded: {date}, {scale:?}, paused={paused}");
        Ok(())
    }

    pub fn load_toml(&self, blob: &str) -> Result<(), TimeError> {
        self.load(&SaveState::from_toml(blob)?)
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    pub fn tick_report(&self) -> TickReport {
        let costs = self.core.lock().tick_costs_ms;
        TickReport {
            hourly_ms: costs[0],
            daily_ms: costs[1],
            monthly_ms: costs[2],
            yearly_ms: costs[3],
            active_events: self.scheduled_event_count(),
            messages_in_transit: self.messages_in_transit(),
            tracked_entities: self.world.count::<Age>(),
        }
    }

    // ------------------------------------------------------------------
    // Advancing
    // ------------------------------------------------------------------

    /// Advances the logical clock by `dt_seconds` of real time, stepping the
    /// calendar one hour at a time and firing every boundary tick crossed.
    /// Called once per frame from [`TimeSystem::update`].
    pub fn advance(&self, dt_seconds: f32) {
        let mut core = self.core.lock();
        if core.paused || core.stopped {
            return;
        }

        let gained_hours =
            dt_seconds as f64 * core.config.hours_per_second * core.scale.multiplier();
        core.hour_accumulator += gained_hours;

        while core.hour_accumulator >= 1.0 {
            core.hour_accumulator -= 1.0;

            let old = core.date;
            core.date = core.date.add_hours(1);
            let new = core.date;

            core = self.fire(core, TickClass::Hourly, new);
            if new.hour == 0 && old.hour != 0 {
                core = self.fire(core, TickClass::Daily, new);
                if new.day == 1 && old.day != 1 {
                    core = self.fire(core, TickClass::Monthly, new);
                    if new.month == 1 && old.month != 1 {
                        core = self.fire(core, TickClass::Yearly, new);
                    }
                }
            }
        }
    }

    /// Fires one tick class: drains ready events and arrived messages,
    /// refreshes ages on DAILY, then invokes subscribed callbacks in
    /// insertion order. The core lock is released around all user code;
    /// subscription changes made meanwhile are queued and applied at the
    /// end.
    fn fire<'a>(
        &'a self,
        mut core: MutexGuard<'a, TimeCore>,
        class: TickClass,
        date: GameDate,
    ) -> MutexGuard<'a, TimeCore> {
        let started = Instant::now();
        core.fanout_depth += 1;
        let mut bindings = mem::take(&mut core.callbacks[class.index()]);
        drop(core);

        self.drain_events(class, date);
        self.drain_messages(date);
        if class == TickClass::Daily {
            self.refresh_ages(date);
        }

        let mut failures: Vec<String> = Vec::new();
        for (name, callback) in bindings.iter_mut() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(date, class)));
            if outcome.is_err() {
                warn!("Tick callback `{name}` panicked during {class:?} fan-out");
                failures.push(name.clone());
            }
        }

        let processing_ms = started.elapsed().as_secs_f64() * 1_000.0;
        self.bus.publish(TickOccurred {
            class,
            date,
            processing_ms,
        });

        let mut core = self.core.lock();
        core.fanout_depth -= 1;
        core.callbacks[class.index()] = bindings;
        core.tick_costs_ms[class.index()] = processing_ms;
        for name in failures {
            *core.callback_failures.entry(name).or_default() += 1;
        }
        if core.fanout_depth == 0 && !core.pending_ops.is_empty() {
            let pending = mem::take(&mut core.pending_ops);
            for op in pending {
                match op {
                    PendingOp::Subscribe(class, name, callback) => {
                        core.apply_subscribe(class, name, callback)
                    }
                    PendingOp::Unsubscribe(class, name) => core.apply_unsubscribe(class, &name),
                }
            }
        }
        core
    }

    /// Executes every ready event whose class is at or below the fired one.
    /// Repeating events are re-armed relative to their own schedule, so a
    /// repeat interval of `r` hours fires at `when`, `when + r`, `when + 2r`.
    fn drain_events(&self, class: TickClass, date: GameDate) {
        for entity in self.world.entities_with::<ScheduledEvent>() {
            let Some(event) = self.world.get::<ScheduledEvent>(entity) else {
                continue;
            };
            if event.class > class || !event.is_ready(date) {
                continue;
            }

            debug!("Executing event `{}`", event.event_id);
            self.bus.publish(EventExecuted {
                event_id: event.event_id.clone(),
                date,
                payload: event.payload.clone(),
            });

            match event.repeat_hours {
                Some(repeat) if repeat > 0 => {
                    self.world.with_mut::<ScheduledEvent, _>(entity, |event| {
                        event.when = event.when.add_hours(repeat as i64);
                    });
                }
                _ => {
                    self.world.despawn(entity);
                }
            }
        }
    }

    /// Delivers every message whose expected arrival has been reached.
    fn drain_messages(&self, date: GameDate) {
        for entity in self.world.entities_with::<TransitMessage>() {
            let Some(message) = self.world.get::<TransitMessage>(entity) else {
                continue;
            };
            if !message.is_delivered(date) {
                continue;
            }

            debug!("Delivering message `{}`", message.message_id);
            self.bus.publish(MessageDelivered {
                message_id: message.message_id,
                date,
                from_location: message.from_location,
                to_location: message.to_location,
            });
            self.world.despawn(entity);
        }
    }

    fn refresh_ages(&self, date: GameDate) {
        for entity in self.world.entities_with::<Age>() {
            self.world.with_mut::<Age, _>(entity, |age| {
                age.years = years_between(age.born, date);
            });
        }
    }

    fn shutdown(&self) {
        let mut core = self.core.lock();
        core.stopped = true;
        for bindings in core.callbacks.iter_mut() {
            bindings.clear();
        }
        drop(core);

        for entity in self.world.entities_with::<ScheduledEvent>() {
            self.world.despawn(entity);
        }
        for entity in self.world.entities_with::<TransitMessage>() {
            self.world.despawn(entity);
        }
        info!("Time engine shut down");
    }
}

/// The time engine packaged as a main-thread scheduler system.
pub struct TimeSystem {
    handle: TimeHandle,
}

impl TimeSystem {
    pub fn new(world: Arc<World>, bus: Arc<MessageBus>, config: TimeConfig) -> Self {
        let core = TimeCore {
            date: config.start_date,
            scale: TimeScale::Normal,
            paused: false,
            stopped: false,
            hour_accumulator: 0.0,
            routes: RouteNetwork::new(),
            callbacks: [Vec::new(), Vec::new(), Vec::new(), Vec::new()],
            callback_failures: AHashMap::new(),
            pending_ops: Vec::new(),
            fanout_depth: 0,
            tick_costs_ms: [0.0; 4],
            config,
        };

        Self {
            handle: TimeHandle {
                core: Arc::new(Mutex::new(core)),
                world,
                bus,
            },
        }
    }

    /// A cloneable handle for other systems to schedule against.
    pub fn handle(&self) -> TimeHandle {
        self.handle.clone()
    }
}

impl System for TimeSystem {
    fn name(&self) -> &'static str {
        "TimeSystem"
    }

    fn init(&mut self) -> AnyResult {
        // The realm's initial road net; campaigns replace it from map data.
        self.handle.add_route("London", "Winchester", 100.0);
        self.handle.add_route("London", "Canterbury", 80.0);
        self.handle.add_route("Winchester", "Canterbury", 120.0);
        self.handle.add_route("London", "York", 300.0);
        self.handle.add_route("Winchester", "Exeter", 150.0);
        Ok(())
    }

    fn update(&mut self, dt: f32) -> AnyResult {
        self.handle.advance(dt);
        Ok(())
    }

    fn shutdown(&mut self) {
        self.handle.shutdown();
    }

    fn preferred_placement(&self) -> Placement {
        // Ticking must be strictly sequenced against everything downstream.
        Placement::MainThread
    }
}
