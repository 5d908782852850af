//! Smoothed wait-time estimation per model family.

const ALPHA_HISTORICAL: f64 = 0.2;
const ALPHA_CURRENT: f64 = 0.3;

/// Two EMAs blended into one estimate: the historical one follows completed
/// waits, the current one follows the longest wait still in the queue.
#[derive(Debug, Clone, Copy, Default)]
pub struct Estimator {
    historical_ema: f64,
    current_ema: f64,
    estimate: f64,
}

impl Estimator {
    /// One estimator tick. `recent_average_ms` is the mean of completed wait
    /// samples inside the window (absent when there were none);
    /// `longest_current_wait_ms` is zero when the partition is empty.
    pub fn tick(&mut self, recent_average_ms: Option<f64>, longest_current_wait_ms: f64) {
        if let Some(recent) = recent_average_ms {
            self.historical_ema =
                ALPHA_HISTORICAL * recent + (1.0 - ALPHA_HISTORICAL) * self.historical_ema;
        }
        self.current_ema = ALPHA_CURRENT * longest_current_wait_ms
            + (1.0 - ALPHA_CURRENT) * self.current_ema;
        self.estimate = (self.historical_ema + self.current_ema) / 2.0;
    }

    pub fn estimate_ms(&self) -> u64 {
        self.estimate.max(0.0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_tracks_completed_waits() {
        let mut estimator = Estimator::default();
        for _ in 0..50 {
            estimator.tick(Some(10_000.0), 10_000.0);
        }
        let settled = estimator.estimate_ms();
        assert!((9_000..=10_000).contains(&settled), "settled={settled}");
    }

    #[test]
    fn estimate_is_non_increasing_after_drain() {
        let mut estimator = Estimator::default();
        for _ in 0..20 {
            estimator.tick(Some(8_000.0), 8_000.0);
        }
        // Queue drains: no new samples, nothing waiting.
        let mut previous = estimator.estimate_ms();
        for _ in 0..30 {
            estimator.tick(None, 0.0);
            let now = estimator.estimate_ms();
            assert!(now <= previous);
            previous = now;
        }
    }

    #[test]
    fn fresh_estimator_reports_zero() {
        let estimator = Estimator::default();
        assert_eq!(estimator.estimate_ms(), 0);
    }
}
