use std::sync::atomic::{AtomicU64, Ordering};

/// A lock-free `f64` cell built on top of [`AtomicU64`] bit casting.
///
/// Loads and stores are plain atomic operations; [`AtomicF64::fetch_add`]
/// retries a compare-exchange loop until it wins, so the cell can serve as a
/// monotonically growing accumulator readable as a snapshot from any thread.
#[derive(Debug, Default)]
pub struct AtomicF64 {
    bits: AtomicU64,
}

impl AtomicF64 {
    pub fn new(value: f64) -> Self {
        Self {
            bits: AtomicU64::new(value.to_bits()),
        }
    }

    pub fn load(&self, order: Ordering) -> f64 {
        f64::from_bits(self.bits.load(order))
    }

    pub fn store(&self, value: f64, order: Ordering) {
        self.bits.store(value.to_bits(), order);
    }

    /// Adds `value` and returns the previous value.
    pub fn fetch_add(&self, value: f64, order: Ordering) -> f64 {
        let mut current = self.bits.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + value).to_bits();
            match self
                .bits
                .compare_exchange_weak(current, next, order, Ordering::Relaxed)
            {
                Ok(previous) => return f64::from_bits(previous),
                Err(observed) => current = observed,
            }
        }
    }

    /// Raises the stored value to `value` if it is larger than the current one.
    pub fn fetch_max(&self, value: f64, order: Ordering) -> f64 {
        let mut current = self.bits.load(Ordering::Relaxed);
        loop {
            let previous = f64::from_bits(current);
            if previous >= value {
                return previous;
            }
            match self.bits.compare_exchange_weak(
                current,
                value.to_bits(),
                order,
                Ordering::Relaxed,
            ) {
                Ok(_) => return previous,
                Err(observed) => current = observed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::AtomicF64;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn accumulates_across_threads() {
        let total = Arc::new(AtomicF64::new(0.0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let total = total.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        total.fetch_add(0.5, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(total.load(Ordering::Relaxed), 2000.0);
    }

    #[test]
    fn fetch_max_keeps_largest() {
        let peak = AtomicF64::new(1.0);
        peak.fetch_max(5.0, Ordering::Relaxed);
        peak.fetch_max(3.0, Ordering::Relaxed);
        assert_eq!(peak.load(Ordering::Relaxed), 5.0);
    }
}
