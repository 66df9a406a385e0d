/// An exponential moving average accumulator.
///
/// Applies the first few samples directly to converge faster, after that new
/// samples are weighted by the inverted gain. This is the sampler behind the
/// per-second service time averages reported by the cache info query.
#[derive(Debug)]
pub struct SlidingAvg {
    /// The current running average, in the sample's unit.
    mean: i64,
    /// Average deviation from the mean, used by callers that want to detect
    /// outliers (a request that took much longer than usual).
    deviation: i64,
    /// The number of samples received so far, saturating at `inverted_gain`.
    num_samples: usize,
    /// The weight of a new sample is `1 / inverted_gain` once warmed up.
    inverted_gain: usize,
}

impl Default for SlidingAvg {
    fn default() -> Self {
        Self::new(10)
    }
}

impl SlidingAvg {
    pub fn new(inverted_gain: usize) -> Self {
        assert!(inverted_gain > 0);
        Self {
            mean: 0,
            deviation: 0,
            num_samples: 0,
            inverted_gain,
        }
    }

    pub fn add_sample(&mut self, sample: i64) {
        if self.num_samples < self.inverted_gain {
            self.num_samples += 1;
        }
        let deviation = (sample - self.mean).abs();
        self.mean += (sample - self.mean) / self.num_samples as i64;
        if self.num_samples > 1 {
            self.deviation +=
                (deviation - self.deviation) / (self.num_samples - 1) as i64;
        }
    }

    pub fn mean(&self) -> i64 {
        if self.num_samples > 0 {
            self.mean
        } else {
            0
        }
    }

    pub fn deviation(&self) -> i64 {
        self.deviation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_converges_on_constant_input() {
        let mut avg = SlidingAvg::default();
        for _ in 0..100 {
            avg.add_sample(500);
        }
        assert_eq!(avg.mean(), 500);
        assert_eq!(avg.deviation(), 0);
    }

    #[test]
    fn test_first_sample_applied_directly() {
        let mut avg = SlidingAvg::default();
        avg.add_sample(1000);
        assert_eq!(avg.mean(), 1000);
    }

    #[test]
    fn test_tracks_shift_in_input() {
        let mut avg = SlidingAvg::default();
        for _ in 0..50 {
            avg.add_sample(100);
        }
        for _ in 0..200 {
            avg.add_sample(1100);
        }
        // after enough samples the average should be close to the new level
        assert!(avg.mean() > 1000);
        assert!(avg.mean() <= 1100);
    }
}
