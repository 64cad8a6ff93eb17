//! Lock-light performance counters for systems and frames.

use ahash::AHashMap;
use hegemon_utils::AtomicF64;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct SystemRecord {
    last_ms: AtomicF64,
    avg_ms: AtomicF64,
    peak_ms: AtomicF64,
    samples: AtomicU64,
}

/// Aggregates per-system execution times and global frame statistics.
///
/// Reads are plain atomic loads; the only lock is a narrow mutex around the
/// name → record map, taken long enough to clone out an `Arc`.
pub struct PerfMonitor {
    records: Mutex<AHashMap<String, Arc<SystemRecord>>>,
    last_frame_ms: AtomicF64,
    avg_fps: AtomicF64,
    total_frames: AtomicU64,
    sample_window: u64,
    frame_window: u64,
}

impl PerfMonitor {
    pub fn new(sample_window: u64, frame_window: u64) -> Self {
        Self {
            records: Mutex::new(AHashMap::new()),
            last_frame_ms: AtomicF64::new(0.0),
            avg_fps: AtomicF64::new(0.0),
            total_frames: AtomicU64::new(0),
            sample_window: sample_window.max(1),
            frame_window: frame_window.max(1),
        }
    }

    /// Records one successful execution of `name`.
    pub fn record_system(&self, name: &str, elapsed_ms: f64) {
        let record = self.record_for(name);

        record.last_ms.store(elapsed_ms, Ordering::Release);
        record.peak_ms.fetch_max(elapsed_ms, Ordering::AcqRel);

        // A single writer updates each record per frame, so the EMA can be a
        // load/store pair rather than a compare-exchange loop.
        let samples = record.samples.fetch_add(1, Ordering::AcqRel) + 1;
        let alpha = 1.0 / samples.min(self.sample_window) as f64;
        let average = record.avg_ms.load(Ordering::Acquire);
        record
            .avg_ms
            .store(alpha * elapsed_ms + (1.0 - alpha) * average, Ordering::Release);
    }

    /// Records the wall-clock duration of one completed frame.
    pub fn record_frame(&self, frame_ms: f64) {
        self.last_frame_ms.store(frame_ms, Ordering::Release);
        let frames = self.total_frames.fetch_add(1, Ordering::AcqRel) + 1;

        if frame_ms > 0.0 {
            let fps = 1_000.0 / frame_ms;
            let alpha = 1.0 / frames.min(self.frame_window) as f64;
            let average = self.avg_fps.load(Ordering::Acquire);
            self.avg_fps
                .store(alpha * fps + (1.0 - alpha) * average, Ordering::Release);
        }
    }

    pub fn system_avg_ms(&self, name: &str) -> f64 {
        self.lookup(name)
            .map_or(0.0, |record| record.avg_ms.load(Ordering::Acquire))
    }

    pub fn system_peak_ms(&self, name: &str) -> f64 {
        self.lookup(name)
            .map_or(0.0, |record| record.peak_ms.load(Ordering::Acquire))
    }

    pub fn system_last_ms(&self, name: &str) -> f64 {
        self.lookup(name)
            .map_or(0.0, |record| record.last_ms.load(Ordering::Acquire))
    }

    pub fn system_sample_count(&self, name: &str) -> u64 {
        self.lookup(name)
            .map_or(0, |record| record.samples.load(Ordering::Acquire))
    }

    pub fn last_frame_ms(&self) -> f64 {
        self.last_frame_ms.load(Ordering::Acquire)
    }

    pub fn avg_fps(&self) -> f64 {
        self.avg_fps.load(Ordering::Acquire)
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames.load(Ordering::Acquire)
    }

    pub fn monitored_systems(&self) -> Vec<String> {
        let mut names: Vec<String> = self.records.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Zeroes every counter without dropping the monitored names.
    pub fn reset(&self) {
        for record in self.records.lock().values() {
            record.last_ms.store(0.0, Ordering::Release);
            record.avg_ms.store(0.0, Ordering::Release);
            record.peak_ms.store(0.0, Ordering::Release);
            record.samples.store(0, Ordering::Release);
        }
        self.last_frame_ms.store(0.0, Ordering::Release);
        self.avg_fps.store(0.0, Ordering::Release);
        self.total_frames.store(0, Ordering::Release);
    }

    fn record_for(&self, name: &str) -> Arc<SystemRecord> {
        let mut records = self.records.lock();
        if let Some(record) = records.get(name) {
            return record.clone();
        }
        let record = Arc::new(SystemRecord::default());
        records.insert(name.to_string(), record.clone());
        record
    }

    fn lookup(&self, name: &str) -> Option<Arc<SystemRecord>> {
        self.records.lock().get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::PerfMonitor;

    #[test]
    fn peak_never_drops_below_the_average() {
        let monitor = PerfMonitor::new(100, 60);
        for sample in [2.0, 9.0, 1.0, 4.0, 3.0] {
            monitor.record_system("Economy", sample);
        }

        let average = monitor.system_avg_ms("Economy");
        let peak = monitor.system_peak_ms("Economy");
        assert!(peak >= average);
        assert!(average >= 0.0);
        assert_eq!(peak, 9.0);
        assert_eq!(monitor.system_sample_count("Economy"), 5);
    }

    #[test]
    fn average_matches_mean_inside_the_window() {
        let monitor = PerfMonitor::new(100, 60);
        monitor.record_system("Trade", 2.0);
        monitor.record_system("Trade", 4.0);
        assert!((monitor.system_avg_ms("Trade") - 3.0).abs() < 1e-9);
    }

    #[test]
    fn reset_clears_counters_but_keeps_names() {
        let monitor = PerfMonitor::new(100, 60);
        monitor.record_system("Levy", 5.0);
        monitor.record_frame(16.0);

        monitor.reset();
        assert_eq!(monitor.system_sample_count("Levy"), 0);
        assert_eq!(monitor.system_peak_ms("Levy"), 0.0);
        assert_eq!(monitor.total_frames(), 0);
        assert_eq!(monitor.monitored_systems(), vec!["Levy".to_string()]);
    }

    #[test]
    fn fps_average_tracks_frame_times() {
        let monitor = PerfMonitor::new(100, 60);
        for _ in 0..10 {
            monitor.record_frame(10.0);
        }
        assert!((monitor.avg_fps() - 100.0).abs() < 1e-6);
    }
}
