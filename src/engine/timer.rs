use std::time::{Duration, Instant};

/// Average wall time of a repeated section.
///
/// `resume` marks the start of a section and `step` its end. Reset at epoch
/// boundaries to get the per-batch time of one epoch.
#[derive(Debug, Clone, Default)]
pub struct Timer {
    started: Option<Instant>,
    total: Duration,
    steps: u32,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resume(&mut self) {
        self.started = Some(Instant::now());
    }

    pub fn step(&mut self) {
        if let Some(started) = self.started.take() {
            self.record(started.elapsed());
        }
    }

    fn record(&mut self, elapsed: Duration) {
        self.total += elapsed;
        self.steps += 1;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Mean seconds per completed section, 0 before the first one.
    pub fn value(&self) -> f64 {
        if self.steps == 0 {
            0.0
        } else {
            self.total.as_secs_f64() / self.steps as f64
        }
    }
}
