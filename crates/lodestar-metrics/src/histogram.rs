use std::sync::atomic::{AtomicU64, Ordering};

const NUM_BINS: usize = 100;

/// Logarithmic latency histogram.
///
/// Each decade of microseconds is split into ten bins by leading digit, so
/// bin `d * 10 + k` holds samples in `[k * 10^d, (k + 1) * 10^d)`. The
/// hundred bins cover 1µs up to roughly 16 minutes; slower samples land in
/// the last bin.
#[derive(Debug)]
pub(crate) struct LatencyHistogram {
    bins: [AtomicU64; NUM_BINS],
    total_us: AtomicU64,
    samples: AtomicU64,
}

impl LatencyHistogram {
    pub(crate) fn new() -> Self {
        Self {
            bins: std::array::from_fn(|_| AtomicU64::new(0)),
            total_us: AtomicU64::new(0),
            samples: AtomicU64::new(0),
        }
    }

    pub(crate) fn record(&self, latency_us: u64) {
        self.bins[Self::bin_for(latency_us)].fetch_add(1, Ordering::Relaxed);
        self.total_us.fetch_add(latency_us, Ordering::Relaxed);
        self.samples.fetch_add(1, Ordering::Relaxed);
    }

    fn bin_for(latency_us: u64) -> usize {
        if latency_us == 0 {
            return 0;
        }
        let decade = latency_us.ilog10();
        let leading = latency_us / 10u64.pow(decade);
        (decade as usize * 10 + leading as usize).min(NUM_BINS - 1)
    }

    /// Lower bound of a bin.
    fn bin_floor(bin: usize) -> u64 {
        let decade = (bin / 10) as u32;
        let leading = (bin % 10).max(1) as u64;
        10u64.pow(decade) * leading
    }

    fn percentile(&self, percentile: u64) -> u64 {
        let total = self.samples.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }

        let target = ((total * percentile).div_ceil(100)).max(1);
        let mut seen = 0;
        for (bin, count) in self.bins.iter().enumerate() {
            let count = count.load(Ordering::Relaxed);
            if count > 0 && seen + count >= target {
                let start = Self::bin_floor(bin);
                let end = Self::bin_floor(bin + 1);
                let fraction = (target - seen) as f64 / count as f64;
                return start + (fraction * (end - start) as f64) as u64;
            }
            seen += count;
        }
        Self::bin_floor(NUM_BINS)
    }

    /// Returns `(avg, p50, p95, p99)` in microseconds.
    pub(crate) fn summary(&self) -> (u64, u64, u64, u64) {
        let total = self.samples.load(Ordering::Relaxed);
        if total == 0 {
            return (0, 0, 0, 0);
        }
        let avg = self.total_us.load(Ordering::Relaxed) / total;
        (avg, self.percentile(50), self.percentile(95), self.percentile(99))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bins_follow_leading_digit() {
        assert_eq!(LatencyHistogram::bin_for(0), 0);
        assert_eq!(LatencyHistogram::bin_for(7), 7);
        assert_eq!(LatencyHistogram::bin_for(10), 11);
        assert_eq!(LatencyHistogram::bin_for(99), 19);
        assert_eq!(LatencyHistogram::bin_for(4_500), 34);
        assert_eq!(LatencyHistogram::bin_for(u64::MAX), NUM_BINS - 1);
    }

    #[test]
    fn test_percentiles_are_ordered() {
        let histogram = LatencyHistogram::new();
        for latency in 1..=1000 {
            histogram.record(latency);
        }
        let (avg, p50, p95, p99) = histogram.summary();
        assert_eq!(avg, 500);
        assert!(p50 <= p95 && p95 <= p99);
        assert!((400..=600).contains(&p50), "p50 = {}", p50);
    }

    #[test]
    fn test_empty_histogram() {
        assert_eq!(LatencyHistogram::new().summary(), (0, 0, 0, 0));
    }
}
