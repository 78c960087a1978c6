use serde::{Deserialize, Serialize};

/// Latency percentiles in milliseconds
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Percentiles {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    /// Observations seen, not just retained
    pub count: u64,
}

/// Fixed-size uniform sample of a stream (Algorithm R)
#[derive(Debug, Clone)]
pub struct Reservoir {
    samples: Vec<f64>,
    capacity: usize,
    seen: u64,
}

impl Reservoir {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: Vec::with_capacity(capacity),
            capacity,
            seen: 0,
        }
    }

    pub fn record(&mut self, value: f64) {
        self.seen += 1;
        if self.samples.len() < self.capacity {
            self.samples.push(value);
            return;
        }

        let slot = rand::random_range(0..self.seen);
        if (slot as usize) < self.capacity {
            self.samples[slot as usize] = value;
        }
    }

    pub fn seen(&self) -> u64 {
        self.seen
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Nearest-rank percentiles over the retained sample
    pub fn percentiles(&self) -> Percentiles {
        if self.samples.is_empty() {
            return Percentiles::default();
        }

        let mut sorted = self.samples.clone();
        sorted.sort_by(f64::total_cmp);

        let rank = |p: f64| {
            let idx = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
            sorted[idx.clamp(1, sorted.len()) - 1]
        };

        Percentiles {
            p50: rank(50.0),
            p95: rank(95.0),
            p99: rank(99.0),
            count: self.seen,
        }
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.seen = 0;
    }
}
