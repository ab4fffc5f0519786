use std::collections::VecDeque;

/// Outcome of one observed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sample {
    Success,
    Failure,
}

/// Fixed-capacity ring of the most recent call outcomes.
#[derive(Clone, Debug)]
pub struct RollingWindow {
    max_samples: usize,
    samples: VecDeque<Sample>,
    failures: usize,
    total_sample_count: u64,
}

impl RollingWindow {
    /// A window holding at least one sample.
    pub fn new(max_samples: usize) -> Self {
        let max_samples = max_samples.max(1);
        RollingWindow {
            max_samples,
            samples: VecDeque::with_capacity(max_samples),
            failures: 0,
            total_sample_count: 0,
        }
    }

    pub fn record(&mut self, sample: Sample) {
        self.total_sample_count += 1;
        if self.samples.len() == self.max_samples {
            if let Some(Sample::Failure) = self.samples.pop_front() {
                self.failures -= 1;
            }
        }
        if sample == Sample::Failure {
            self.failures += 1;
        }
        self.samples.push_back(sample);
    }

    pub fn volume(&self) -> usize {
        self.samples.len()
    }

    pub fn failures(&self) -> usize {
        self.failures
    }

    pub fn capacity(&self) -> usize {
        self.max_samples
    }

    /// Samples ever recorded, including evicted and cleared ones.
    pub fn total_sample_count(&self) -> u64 {
        self.total_sample_count
    }

    /// Failure share of the window in percent; 0 for an empty window.
    pub fn failure_percentage(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.failures as f64 * 100.0 / self.samples.len() as f64
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.failures = 0;
    }
}
