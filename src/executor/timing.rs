use std::time::Duration;

/// Per-action duration samples and their running mean.
///
/// Samples are append-only for the lifetime of a run. The mean is kept incrementally so
/// recording stays O(1); an empty sample set reports zero.
#[derive(Debug, Clone, Default)]
pub struct EtaEstimator {
    samples: Vec<Duration>,
    total: Duration,
}

impl EtaEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, sample: Duration) {
        self.samples.push(sample);
        self.total += sample;
    }

    pub fn samples(&self) -> &[Duration] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Unweighted mean of all samples, zero before the first one.
    pub fn average(&self) -> Duration {
        average_of(self.total, self.samples.len())
    }
}

pub(crate) fn average_of(total: Duration, count: usize) -> Duration {
    match u32::try_from(count) {
        Ok(0) => Duration::ZERO,
        Ok(n) => total / n,
        Err(_) => Duration::from_secs_f64(total.as_secs_f64() / count as f64),
    }
}

pub(crate) fn estimate_remaining(average: Duration, remaining_actions: usize) -> Duration {
    match u32::try_from(remaining_actions) {
        Ok(n) => average.saturating_mul(n),
        Err(_) => Duration::MAX,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_estimator_reports_zero() {
        let eta = EtaEstimator::new();
        assert!(eta.is_empty());
        assert_eq!(eta.average(), Duration::ZERO);
        assert_eq!(estimate_remaining(eta.average(), 10), Duration::ZERO);
    }

    #[test]
    fn test_running_mean() {
        let mut eta = EtaEstimator::new();
        eta.record(Duration::from_millis(100));
        eta.record(Duration::from_millis(300));
        assert_eq!(eta.len(), 2);
        assert_eq!(eta.average(), Duration::from_millis(200));
        assert_eq!(eta.samples(), &[Duration::from_millis(100), Duration::from_millis(300)]);
        assert_eq!(estimate_remaining(eta.average(), 3), Duration::from_millis(600));
        assert_eq!(estimate_remaining(eta.average(), 0), Duration::ZERO);
    }
}
