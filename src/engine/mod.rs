//! Event-driven epoch/iteration loop.
//!
//! An [`Engine`] runs a step function over a data source for a number of
//! epochs and fires lifecycle events around it. Handlers get mutable access
//! to a caller-owned context (model, optimizer, writers) and to the loop
//! [`State`], so they can checkpoint, evaluate, or move the counters on
//! resume.

pub mod metrics;
pub mod timer;

use std::collections::BTreeMap;

use anyhow::Result;

pub use metrics::{Average, Metric, RunningAverage};
pub use timer::Timer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Started,
    EpochStarted,
    IterationStarted,
    IterationCompleted,
    EpochCompleted,
    Completed,
}

impl Event {
    /// Fire only on every `n`-th occurrence.
    ///
    /// Iteration events count global iterations, epoch events count epochs.
    pub fn every(self, n: usize) -> EventFilter {
        EventFilter {
            event: self,
            every: n.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventFilter {
    event: Event,
    every: usize,
}

impl From<Event> for EventFilter {
    fn from(event: Event) -> Self {
        event.every(1)
    }
}

impl EventFilter {
    fn fires<O>(&self, event: Event, state: &State<O>) -> bool {
        if self.event != event {
            return false;
        }
        let counter = match event {
            Event::IterationStarted | Event::IterationCompleted => state.iteration,
            Event::EpochStarted | Event::EpochCompleted => state.epoch,
            Event::Started | Event::Completed => return true,
        };
        counter % self.every == 0
    }
}

/// Loop counters and the latest step output
#[derive(Debug, Clone)]
pub struct State<O> {
    /// Epochs started so far (1-based while an epoch runs)
    pub epoch: usize,
    /// Iterations run so far across all epochs
    pub iteration: usize,
    pub max_epochs: usize,
    /// Batches per epoch
    pub epoch_length: usize,
    pub output: Option<O>,
    pub metrics: BTreeMap<String, f64>,
}

impl<O> State<O> {
    pub fn new(max_epochs: usize, epoch_length: usize) -> Self {
        Self {
            epoch: 0,
            iteration: 0,
            max_epochs,
            epoch_length,
            output: None,
            metrics: BTreeMap::new(),
        }
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }
}

/// Something that can be iterated once per epoch.
///
/// Items are fallible so a batch that fails to load stops the run instead of
/// silently shortening the epoch.
pub trait DataSource<I> {
    /// Batches one pass yields
    fn len(&self) -> usize;

    fn iter(&self) -> Box<dyn Iterator<Item = Result<I>> + '_>;
}

type StepFn<C, I, O> = Box<dyn FnMut(&mut C, &State<O>, I) -> Result<O>>;
type HandlerFn<C, O> = Box<dyn FnMut(&mut C, &mut State<O>) -> Result<()>>;

/// Attached metric with the name it is published under
struct NamedMetric<O> {
    name: String,
    metric: Box<dyn Metric<O>>,
}

pub struct Engine<C, I, O> {
    step: StepFn<C, I, O>,
    handlers: Vec<(EventFilter, HandlerFn<C, O>)>,
    metrics: Vec<NamedMetric<O>>,
}

impl<C, I, O> Engine<C, I, O> {
    pub fn new(step: impl FnMut(&mut C, &State<O>, I) -> Result<O> + 'static) -> Self {
        Self {
            step: Box::new(step),
            handlers: Vec::new(),
            metrics: Vec::new(),
        }
    }

    /// Register a handler. Handlers for the same event run in registration order.
    pub fn on(
        &mut self,
        filter: impl Into<EventFilter>,
        handler: impl FnMut(&mut C, &mut State<O>) -> Result<()> + 'static,
    ) -> &mut Self {
        self.handlers.push((filter.into(), Box::new(handler)));
        self
    }

    /// Attach a metric; its value appears in `State::metrics` under `name`.
    pub fn attach(&mut self, name: &str, metric: impl Metric<O> + 'static) -> &mut Self {
        self.metrics.push(NamedMetric {
            name: name.to_string(),
            metric: Box::new(metric),
        });
        self
    }

    /// Names of attached metrics in attach order.
    pub fn metric_names(&self) -> Vec<String> {
        self.metrics.iter().map(|m| m.name.clone()).collect()
    }

    fn update_metrics(&mut self, event: Event, state: &mut State<O>) {
        for NamedMetric { name, metric } in &mut self.metrics {
            match event {
                Event::EpochStarted => metric.reset(),
                Event::IterationCompleted => {
                    if let Some(output) = &state.output {
                        metric.update(output);
                    }
                }
                _ => {}
            }
            if event == metric.publish_on() {
                match metric.compute() {
                    Some(value) => {
                        state.metrics.insert(name.clone(), value);
                    }
                    None => {
                        state.metrics.remove(name.as_str());
                    }
                }
            }
        }
    }

    fn fire(&mut self, event: Event, ctx: &mut C, state: &mut State<O>) -> Result<()> {
        self.update_metrics(event, state);
        for (filter, handler) in &mut self.handlers {
            if filter.fires(event, state) {
                handler(ctx, state)?;
            }
        }
        Ok(())
    }

    /// Run until `max_epochs` epochs are done. Any handler or step error aborts the run.
    pub fn run(
        &mut self,
        ctx: &mut C,
        data: &dyn DataSource<I>,
        max_epochs: usize,
    ) -> Result<State<O>> {
        let mut state = State::new(max_epochs, data.len());

        self.fire(Event::Started, ctx, &mut state)?;

        while state.epoch < state.max_epochs {
            state.epoch += 1;
            self.fire(Event::EpochStarted, ctx, &mut state)?;

            for batch in data.iter() {
                let batch = batch?;
                state.iteration += 1;
                self.fire(Event::IterationStarted, ctx, &mut state)?;
                let output = (self.step)(ctx, &state, batch)?;
                state.output = Some(output);
                self.fire(Event::IterationCompleted, ctx, &mut state)?;
            }

            self.fire(Event::EpochCompleted, ctx, &mut state)?;
        }

        self.fire(Event::Completed, ctx, &mut state)?;
        Ok(state)
    }
}
