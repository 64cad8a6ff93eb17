//! Wall-clock driven frame clock.

use hegemon_utils::AtomicF64;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

struct ClockTimestamps {
    start: Instant,
    last_frame: Instant,
}

/// Monotonic game clock advanced once per frame by the scheduler.
///
/// Accumulated game time, the last frame's delta, and the frame number are
/// atomics, so dedicated-thread systems can read them without taking the
/// frame lock. Only the scheduler's main thread calls [`GameClock::tick`].
pub struct GameClock {
    game_time: AtomicF64,
    delta_time: AtomicF64,
    frame_number: AtomicU64,
    timestamps: Mutex<ClockTimestamps>,
}

impl GameClock {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            game_time: AtomicF64::new(0.0),
            delta_time: AtomicF64::new(0.0),
            frame_number: AtomicU64::new(0),
            timestamps: Mutex::new(ClockTimestamps {
                start: now,
                last_frame: now,
            }),
        }
    }

    /// Advances the clock by one frame.
    pub fn tick(&self) {
        let now = Instant::now();
        let mut timestamps = self.timestamps.lock();

        let delta_seconds = now.duration_since(timestamps.last_frame).as_secs_f64();
        timestamps.last_frame = now;

        self.delta_time.store(delta_seconds, Ordering::Release);
        self.game_time.fetch_add(delta_seconds, Ordering::AcqRel);
        self.frame_number.fetch_add(1, Ordering::AcqRel);
    }

    pub fn reset(&self) {
        let now = Instant::now();
        let mut timestamps = self.timestamps.lock();
        timestamps.start = now;
        timestamps.last_frame = now;
        self.game_time.store(0.0, Ordering::Release);
        self.delta_time.store(0.0, Ordering::Release);
        self.frame_number.store(0, Ordering::Release);
    }

    /// Accumulated game time in seconds.
    pub fn game_time(&self) -> f64 {
        self.game_time.load(Ordering::Acquire)
    }

    /// Last frame's delta in seconds.
    pub fn delta_seconds(&self) -> f64 {
        self.delta_time.load(Ordering::Acquire)
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number.load(Ordering::Acquire)
    }

    /// Instantaneous FPS derived from the last delta.
    pub fn fps(&self) -> f64 {
        let delta = self.delta_seconds();
        if delta > 0.0 {
            1.0 / delta
        } else {
            0.0
        }
    }
}

impl Default for GameClock {
    fn default() -> Self {
        Self::new()
    }
}
