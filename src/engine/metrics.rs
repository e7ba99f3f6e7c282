use super::Event;

/// Accumulates values from step outputs and reports one number.
pub trait Metric<O> {
    /// Called at every epoch start.
    fn reset(&mut self);

    /// Called with each iteration's output.
    fn update(&mut self, output: &O);

    fn compute(&self) -> Option<f64>;

    /// Event after which the value is written into the engine state
    fn publish_on(&self) -> Event;
}

type Extractor<O> = Box<dyn Fn(&O) -> Vec<f32>>;

/// Exponential moving average of the batch mean.
///
/// The first update seeds the average; later ones blend with `alpha` weight on
/// the previous value. Published after every iteration.
pub struct RunningAverage<O> {
    alpha: f64,
    value: Option<f64>,
    extract: Extractor<O>,
}

impl<O> RunningAverage<O> {
    pub fn new(alpha: f64, extract: impl Fn(&O) -> Vec<f32> + 'static) -> Self {
        Self {
            alpha,
            value: None,
            extract: Box::new(extract),
        }
    }
}

impl<O> Metric<O> for RunningAverage<O> {
    fn reset(&mut self) {
        self.value = None;
    }

    fn update(&mut self, output: &O) {
        let Some(batch) = mean(&(self.extract)(output)) else {
            return;
        };
        self.value = Some(match self.value {
            Some(prev) => prev * self.alpha + (1.0 - self.alpha) * batch,
            None => batch,
        });
    }

    fn compute(&self) -> Option<f64> {
        self.value
    }

    fn publish_on(&self) -> Event {
        Event::IterationCompleted
    }
}

/// Mean over every sample seen in the epoch. Published at epoch completion.
pub struct Average<O> {
    sum: f64,
    count: usize,
    extract: Extractor<O>,
}

impl<O> Average<O> {
    pub fn new(extract: impl Fn(&O) -> Vec<f32> + 'static) -> Self {
        Self {
            sum: 0.0,
            count: 0,
            extract: Box::new(extract),
        }
    }
}

impl<O> Metric<O> for Average<O> {
    fn reset(&mut self) {
        self.sum = 0.0;
        self.count = 0;
    }

    fn update(&mut self, output: &O) {
        let values = (self.extract)(output);
        self.sum += values.iter().map(|&v| v as f64).sum::<f64>();
        self.count += values.len();
    }

    fn compute(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    fn publish_on(&self) -> Event {
        Event::EpochCompleted
    }
}

fn mean(values: &[f32]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().map(|&v| v as f64).sum::<f64>() / values.len() as f64)
    }
}
