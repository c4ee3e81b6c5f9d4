// Copyright © 2024, Embark Studios, all rights reserved.
// Created: 21 February 2024
use std::time::Duration;

/// Execution time statistics for one batch size.
#[derive(Clone, Debug)]
pub(crate) struct TimingBucket {
    pub size: usize,
    state: WelfordState,
}

impl TimingBucket {
    pub(crate) fn new(size: usize, elapsed: Duration) -> TimingBucket {
        Self {
            size,
            state: WelfordState::new(elapsed),
        }
    }

    pub(crate) fn add(&mut self, elapsed: Duration) {
        self.state.update(elapsed);
    }

    pub(crate) fn mean(&self) -> Duration {
        self.state.mean()
    }
}

/// Latency of every batch a worker has run, overall and per batch size.
#[derive(Clone, Debug, Default)]
pub(crate) struct WorkerTimings {
    overall: WelfordState,
    max: Duration,
    buckets: Vec<TimingBucket>,
}

impl WorkerTimings {
    pub(crate) fn record(&mut self, batch_size: usize, elapsed: Duration) {
        self.overall.update(elapsed);
        self.max = self.max.max(elapsed);

        match self.buckets.iter_mut().find(|b| b.size == batch_size) {
            Some(bucket) => bucket.add(elapsed),
            None => {
                self.buckets.push(TimingBucket::new(batch_size, elapsed));
                self.buckets.sort_by_key(|b| b.size);
            }
        }
    }

    pub(crate) fn mean(&self) -> Option<Duration> {
        (self.overall.count > 0).then(|| self.overall.mean())
    }

    pub(crate) fn std_dev(&self) -> Option<Duration> {
        (self.overall.count > 1).then(|| self.overall.std_dev())
    }

    pub(crate) fn max(&self) -> Option<Duration> {
        (self.overall.count > 0).then_some(self.max)
    }

    /// Mean latency per observed batch size, smallest size first.
    pub(crate) fn by_batch_size(&self) -> Vec<(usize, Duration)> {
        self.buckets.iter().map(|b| (b.size, b.mean())).collect()
    }
}

/// Welford's online mean and variance, in milliseconds.
#[derive(Clone, Debug, Default)]
struct WelfordState {
    mean: f64,
    mean2: f64,

    count: usize,
}

impl WelfordState {
    fn new(elapsed: Duration) -> Self {
        let mut this = Self::default();
        this.update(elapsed);
        this
    }

    fn update(&mut self, value: Duration) {
        let value = value.as_secs_f64() * 1000.0;

        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / (self.count as f64);

        let delta2 = value - self.mean;
        self.mean2 += delta * delta2;
    }

    fn mean(&self) -> Duration {
        Duration::from_secs_f64(self.mean.max(0.0) / 1000.0)
    }

    /// Sample standard deviation.
    fn std_dev(&self) -> Duration {
        if self.count < 2 {
            return Duration::ZERO;
        }

        let variance = self.mean2 / (self.count - 1) as f64;
        Duration::from_secs_f64(variance.max(0.0).sqrt() / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::{WelfordState, WorkerTimings};
    use std::time::Duration;

    fn is_close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1.0e-6
    }

    #[test]
    fn initial_mean_initial_value() {
        let state = WelfordState::new(Duration::from_secs_f64(1.0));
        assert!(is_close(state.mean().as_secs_f64(), 1.0));
        assert_eq!(state.std_dev(), Duration::ZERO);
    }

    #[test]
    fn mean_converge() {
        let mut state = WelfordState::new(Duration::from_secs_f64(0.0));

        for v in 1..10 {
            state.update(Duration::from_secs_f64(v as f64));
        }

        assert!(is_close(state.mean().as_secs_f64(), 4.5));
    }

    #[test]
    fn std_dev_of_constant_is_zero() {
        let mut state = WelfordState::new(Duration::from_millis(5));
        for _ in 0..10 {
            state.update(Duration::from_millis(5));
        }

        assert!(is_close(state.std_dev().as_secs_f64(), 0.0));
    }

    #[test]
    fn sample_std_dev() {
        let mut state = WelfordState::default();
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            state.update(Duration::from_secs_f64(v));
        }

        // Sample variance of the set above is 32 / 7.
        assert!(is_close(
            state.std_dev().as_secs_f64(),
            (32.0f64 / 7.0).sqrt()
        ));
    }

    #[test]
    fn buckets_sorted_by_size() {
        let mut timings = WorkerTimings::default();
        assert_eq!(timings.mean(), None);

        timings.record(4, Duration::from_millis(40));
        timings.record(1, Duration::from_millis(10));
        timings.record(4, Duration::from_millis(20));

        let sizes: Vec<_> = timings.by_batch_size().iter().map(|(s, _)| *s).collect();
        assert_eq!(sizes, vec![1, 4]);
        assert!(is_close(
            timings.by_batch_size()[1].1.as_secs_f64(),
            0.030
        ));
        assert_eq!(timings.max(), Some(Duration::from_millis(40)));
        assert!(timings.std_dev().is_some());
    }
}
