const WINDOW: usize = 1000;

/// Rolling average over a fixed window of request durations. `store`
/// returns the average once per full window, for occasional timing logs
/// without per-request noise.
pub struct TimingAvg {
    samples: [f64; WINDOW],
    count: usize,
}

impl TimingAvg {
    pub fn new() -> Self {
        Self {
            samples: [0.0; WINDOW],
            count: 0,
        }
    }

    pub fn store(&mut self, secs: f64) -> Option<f64> {
        self.samples[self.count] = secs;
        self.count += 1;
        if self.count == WINDOW {
            let sum: f64 = self.samples.iter().sum();
            self.samples = [0.0; WINDOW];
            self.count = 0;
            Some(sum / WINDOW as f64)
        } else {
            None
        }
    }
}

impl Default for TimingAvg {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_once_per_window() {
        let mut avg = TimingAvg::new();
        for _ in 0..999 {
            assert!(avg.store(2.0).is_none());
        }
        let result = avg.store(2.0).expect("window full");
        assert!((result - 2.0).abs() < f64::EPSILON);
        // window resets
        assert!(avg.store(1.0).is_none());
    }
}
