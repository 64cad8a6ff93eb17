//! Error supervision: counts failures per system and disables chronic
//! offenders.

use ahash::AHashMap;
use log::*;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Published on the bus when supervision takes a system out of rotation.
#[derive(Debug, Clone)]
pub struct SystemDisabled {
    pub name: String,
    pub error_count: usize,
    pub last_error: String,
    pub window_secs: u64,
}

struct ErrorRecord {
    count: usize,
    disabled: bool,
    last_error: String,
    first_at: Instant,
    last_at: Instant,
}

/// Read-only snapshot of a system's error record.
#[derive(Debug, Clone)]
pub struct ErrorSnapshot {
    pub count: usize,
    pub disabled: bool,
    pub last_error: String,
}

/// Tracks per-system failures. A system accumulating `max_errors` failures
/// inside the rolling window is disabled; failures spread wider than the
/// window roll the counter over instead. Disabled systems stay disabled
/// until they are removed and re-registered.
pub struct Supervisor {
    records: Mutex<AHashMap<String, ErrorRecord>>,
    max_errors: usize,
    window: Duration,
}

impl Supervisor {
    pub fn new(max_errors: usize, window: Duration) -> Self {
        Self {
            records: Mutex::new(AHashMap::new()),
            max_errors: max_errors.max(1),
            window,
        }
    }

    /// Records one update failure. Returns a [`SystemDisabled`] notice when
    /// this failure is the one that trips the limit.
    pub fn record_failure(&self, name: &str, error: &anyhow::Error) -> Option<SystemDisabled> {
        let now = Instant::now();
        let mut records = self.records.lock();
        let record = records.entry(name.to_string()).or_insert(ErrorRecord {
            count: 0,
            disabled: false,
            last_error: String::new(),
            first_at: now,
            last_at: now,
        });

        record.count += 1;
        record.last_error = format!("{error:#}");
        record.last_at = now;
        if record.count == 1 {
            record.first_at = now;
        }

        warn!(
            "System `{name}` failed ({} so far): {:#}",
            record.count, error
        );

        if record.count >= self.max_errors && !record.disabled {
            let spread = record.last_at.duration_since(record.first_at);
            if spread <= self.window {
                record.disabled = true;
                error!(
                    "DISABLED system `{name}` after {} errors in {:.1}s; last: {}",
                    record.count,
                    spread.as_secs_f64(),
                    record.last_error
                );
                return Some(SystemDisabled {
                    name: name.to_string(),
                    error_count: record.count,
                    last_error: record.last_error.clone(),
                    window_secs: self.window.as_secs(),
                });
            }
            // Errors spread over more than the window: start a fresh count.
            record.count = 1;
            record.first_at = record.last_at;
        }

        None
    }

    /// Records a failed `init` and disables the system outright.
    pub fn record_init_failure(&self, name: &str, error: &anyhow::Error) -> SystemDisabled {
        let now = Instant::now();
        let mut records = self.records.lock();
        let message = format!("{error:#}");
        error!("System `{name}` failed to initialize, disabling: {message}");

        let record = records.entry(name.to_string()).or_insert(ErrorRecord {
            count: 0,
            disabled: false,
            last_error: String::new(),
            first_at: now,
            last_at: now,
        });
        record.count += 1;
        record.disabled = true;
        record.last_error = message.clone();
        record.last_at = now;

        SystemDisabled {
            name: name.to_string(),
            error_count: record.count,
            last_error: message,
            window_secs: self.window.as_secs(),
        }
    }

    pub fn is_disabled(&self, name: &str) -> bool {
        self.records
            .lock()
            .get(name)
            .is_some_and(|record| record.disabled)
    }

    pub fn snapshot(&self, name: &str) -> Option<ErrorSnapshot> {
        self.records.lock().get(name).map(|record| ErrorSnapshot {
            count: record.count,
            disabled: record.disabled,
            last_error: record.last_error.clone(),
        })
    }

    /// Drops a system's record entirely (used by system removal; the only
    /// path that can revive a disabled name).
    pub fn forget(&self, name: &str) {
        self.records.lock().remove(name);
    }

    /// Clears counts and disabled flags without forgetting names.
    pub fn reset(&self) {
        for record in self.records.lock().values_mut() {
            record.count = 0;
            record.disabled = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Supervisor;
    use anyhow::anyhow;
    use std::time::Duration;

    #[test]
    fn disables_after_max_errors_inside_window() {
        let supervisor = Supervisor::new(3, Duration::from_secs(60));
        let error = anyhow!("levy mutiny");

        assert!(supervisor.record_failure("Military", &error).is_none());
        assert!(supervisor.record_failure("Military", &error).is_none());
        let notice = supervisor.record_failure("Military", &error).unwrap();

        assert_eq!(notice.error_count, 3);
        assert!(notice.last_error.contains("levy mutiny"));
        assert!(supervisor.is_disabled("Military"));
    }

    #[test]
    fn errors_outside_the_window_roll_over() {
        let supervisor = Supervisor::new(2, Duration::ZERO);
        let error = anyhow!("slow leak");

        supervisor.record_failure("Trade", &error);
        std::thread::sleep(Duration::from_millis(5));
        // Second failure exceeds the (zero-length) window, so the count
        // restarts instead of disabling.
        assert!(supervisor.record_failure("Trade", &error).is_none());
        assert!(!supervisor.is_disabled("Trade"));
        assert_eq!(supervisor.snapshot("Trade").unwrap().count, 1);
    }

    #[test]
    fn init_failure_disables_immediately() {
        let supervisor = Supervisor::new(5, Duration::from_secs(60));
        let notice = supervisor.record_init_failure("Diplomacy", &anyhow!("no court"));
        assert_eq!(notice.error_count, 1);
        assert!(supervisor.is_disabled("Diplomacy"));

        supervisor.forget("Diplomacy");
        assert!(!supervisor.is_disabled("Diplomacy"));
    }
}
