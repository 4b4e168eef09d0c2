//! Request-size statistics for the pool allocator.
//!
//! `RunningStats` keeps a count, mean, and variance over a stream of
//! samples using Welford's online update. `Histogram` buckets samples
//! into fixed-width bins with optional overflow tracking. Both are
//! observability aids only; nothing here feeds back into allocation
//! decisions.

/// Online mean/variance accumulator.
#[derive(Debug, Default, Clone)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sample(&mut self, sample: f64) {
        self.count += 1;
        let delta = sample - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (sample - self.mean);
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    #[must_use]
    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Population variance; 0 until two samples have been added.
    #[must_use]
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / self.count as f64
        }
    }

    #[must_use]
    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }
}

/// Fixed-bin histogram over a closed value range.
#[derive(Debug, Clone)]
pub struct Histogram {
    bins: Vec<u32>,
    low: i64,
    high: i64,
    track_overflow: bool,
    underflow: u32,
    overflow: u32,
}

impl Histogram {
    /// Create a histogram with `num_bins` bins spanning `[low, high)`.
    #[must_use]
    pub fn new(num_bins: usize, low: i64, high: i64, track_overflow: bool) -> Self {
        Self {
            bins: vec![0; num_bins.max(1)],
            low,
            high: high.max(low + 1),
            track_overflow,
            underflow: 0,
            overflow: 0,
        }
    }

    /// Grow the bounds, discarding previous samples.
    pub fn set_bounds(&mut self, low: i64, high: i64) {
        self.low = low;
        self.high = high.max(low + 1);
        self.bins.iter_mut().for_each(|b| *b = 0);
        self.underflow = 0;
        self.overflow = 0;
    }

    pub fn add_sample(&mut self, sample: i64) {
        if sample < self.low {
            if self.track_overflow {
                self.underflow += 1;
            }
            return;
        }
        if sample >= self.high {
            if self.track_overflow {
                self.overflow += 1;
            }
            return;
        }
        let span = (self.high - self.low) as u64;
        let ix = ((sample - self.low) as u64 * self.bins.len() as u64 / span) as usize;
        let len = self.bins.len();
        self.bins[ix.min(len - 1)] += 1;
    }

    #[must_use]
    pub fn bin_count(&self, ix: usize) -> u32 {
        self.bins.get(ix).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn num_bins(&self) -> usize {
        self.bins.len()
    }

    #[must_use]
    pub fn max_bin(&self) -> u32 {
        self.bins.iter().copied().max().unwrap_or(0)
    }

    #[must_use]
    pub fn total_samples(&self) -> u64 {
        self.bins.iter().map(|&b| u64::from(b)).sum::<u64>()
            + u64::from(self.underflow)
            + u64::from(self.overflow)
    }

    #[must_use]
    pub fn overflow_count(&self) -> u32 {
        self.overflow
    }

    #[must_use]
    pub fn high_bound(&self) -> i64 {
        self.high
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_stats_mean_variance() {
        let mut st = RunningStats::new();
        for s in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            st.add_sample(s);
        }
        assert_eq!(st.count(), 8);
        assert!((st.mean() - 5.0).abs() < 1e-9);
        assert!((st.variance() - 4.0).abs() < 1e-9);
        assert!((st.std_dev() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_histogram_binning() {
        let mut h = Histogram::new(10, 0, 100, true);
        h.add_sample(0);
        h.add_sample(9);
        h.add_sample(10);
        h.add_sample(99);
        h.add_sample(100); // overflow
        h.add_sample(-1); // underflow
        assert_eq!(h.bin_count(0), 2);
        assert_eq!(h.bin_count(1), 1);
        assert_eq!(h.bin_count(9), 1);
        assert_eq!(h.overflow_count(), 1);
        assert_eq!(h.total_samples(), 6);
    }
}
