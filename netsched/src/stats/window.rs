use std::collections::VecDeque;

/// Fixed-size window of the most recent samples.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    samples: VecDeque<f64>,
    size: usize,
    sum: f64,
}

impl RollingWindow {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            samples: VecDeque::with_capacity(size),
            size,
            sum: 0.0,
        }
    }

    /// Add a sample, evicting the oldest one when full.
    pub fn push(&mut self, value: f64) {
        if self.samples.len() == self.size
            && let Some(oldest) = self.samples.pop_front()
        {
            self.sum -= oldest;
        }
        self.samples.push_back(value);
        self.sum += value;
    }

    /// Mean of the samples held, `0.0` when empty.
    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.sum / self.samples.len() as f64
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.size
    }
}
