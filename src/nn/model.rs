use anyhow::{ensure, Result};
use burn::{
    module::Module,
    tensor::{backend::Backend, Distribution, Tensor},
};
use rand::Rng;

use crate::config::{self, FlowCoupling, FlowPermutation, Options};
use crate::nn::flow::{
    gaussian_likelihood, gaussian_sample, split_channels, squeeze2d, unsqueeze2d, FlowStep,
    Split2d, StepSpec,
};
use crate::nn::layers::{Conv2dZeros, LinearZeros};

/// One resolution level: K flow steps and, except on the last level, a split.
#[derive(Module, Debug)]
pub struct FlowLevel<B: Backend> {
    steps: Vec<FlowStep<B>>,
    split: Option<Split2d<B>>,
}

/// Multi-scale Glow flow with a (optionally class-conditional) Gaussian prior
///
/// Architecture per level: squeeze -> K x (ActNorm -> 1x1 permutation -> coupling) -> split
#[derive(Module, Debug)]
pub struct GlowModel<B: Backend> {
    levels: Vec<FlowLevel<B>>,
    learn_top: Option<Conv2dZeros<B>>,
    project_ycond: Option<LinearZeros<B>>,
    project_class: Option<LinearZeros<B>>,
    top_channels: usize,
    top_height: usize,
    top_width: usize,
    num_classes: usize,
}

/// Configuration for the model
#[derive(burn::config::Config)]
pub struct GlowConfig {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
    pub hidden_channels: usize,
    pub k: usize,
    pub l: usize,
    pub actnorm_scale: f64,
    pub flow_permutation: FlowPermutation,
    pub flow_coupling: FlowCoupling,
    pub lu_decomposed: bool,
    pub num_classes: usize,
    pub learn_top: bool,
    pub y_condition: bool,
}

impl GlowConfig {
    /// `image_shape` is `(height, width, channels)`.
    pub fn from_options(options: &Options, image_shape: (usize, usize, usize), num_classes: usize) -> Self {
        let (height, width, channels) = image_shape;
        Self {
            height,
            width,
            channels,
            hidden_channels: options.hidden_channels,
            k: options.k,
            l: options.l,
            actnorm_scale: options.actnorm_scale,
            flow_permutation: options.flow_permutation,
            flow_coupling: options.flow_coupling,
            lu_decomposed: options.lu_decomposed,
            num_classes,
            learn_top: options.learn_top,
            y_condition: options.y_condition,
        }
    }

    /// Build the model. `rng` drives the CPU-side init (orthogonal weights, shuffles).
    pub fn init<B: Backend, R: Rng>(&self, device: &B::Device, rng: &mut R) -> GlowModel<B> {
        let spec = StepSpec {
            hidden_channels: self.hidden_channels,
            actnorm_scale: self.actnorm_scale,
            permutation: self.flow_permutation,
            coupling: self.flow_coupling,
            lu_decomposed: self.lu_decomposed,
        };

        let (mut c, mut h, mut w) = (self.channels, self.height, self.width);
        let mut levels = Vec::with_capacity(self.l);
        for level in 0..self.l {
            c *= 4;
            h /= 2;
            w /= 2;
            let steps = (0..self.k)
                .map(|_| FlowStep::new(c, &spec, device, rng))
                .collect();
            let split = if level + 1 < self.l {
                let split = Split2d::new(c, device);
                c /= 2;
                Some(split)
            } else {
                None
            };
            levels.push(FlowLevel { steps, split });
        }

        GlowModel {
            levels,
            learn_top: self
                .learn_top
                .then(|| Conv2dZeros::new([2 * c, 2 * c], 3, device)),
            project_ycond: self
                .y_condition
                .then(|| LinearZeros::new(self.num_classes, 2 * c, device)),
            project_class: self
                .y_condition
                .then(|| LinearZeros::new(c, self.num_classes, device)),
            top_channels: c,
            top_height: h,
            top_width: w,
            num_classes: self.num_classes,
        }
    }
}

/// Result of encoding a batch
#[derive(Debug, Clone)]
pub struct GlowOutput<B: Backend> {
    pub z: Tensor<B, 4>,
    /// Negative log-likelihood in bits per dimension, one per sample
    pub nll: Tensor<B, 1>,
    pub y_logits: Option<Tensor<B, 2>>,
}

impl<B: Backend> GlowModel<B> {
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn is_conditional(&self) -> bool {
        self.project_class.is_some()
    }

    fn encode(&self, x: Tensor<B, 4>, logdet: Tensor<B, 1>) -> (Tensor<B, 4>, Tensor<B, 1>) {
        let (mut z, mut logdet) = (x, logdet);
        for level in &self.levels {
            z = squeeze2d(z);
            for step in &level.steps {
                (z, logdet) = step.forward(z, logdet);
            }
            if let Some(split) = &level.split {
                (z, logdet) = split.forward(z, logdet);
            }
        }
        (z, logdet)
    }

    fn decode(&self, z: Tensor<B, 4>, temperature: f64) -> Result<Tensor<B, 4>> {
        let [b, ..] = z.dims();
        let mut logdet = Tensor::zeros([b], &z.device());
        let mut x = z;
        for level in self.levels.iter().rev() {
            if let Some(split) = &level.split {
                x = split.reverse(x, temperature);
            }
            for step in level.steps.iter().rev() {
                (x, logdet) = step.reverse(x, logdet)?;
            }
            x = unsqueeze2d(x);
        }
        Ok(x)
    }

    /// Mean and log-std of the top-level Gaussian.
    fn prior(
        &self,
        batch_size: usize,
        y_onehot: Option<Tensor<B, 2>>,
        device: &B::Device,
    ) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let c2 = 2 * self.top_channels;
        let mut h = Tensor::zeros([batch_size, c2, self.top_height, self.top_width], device);
        if let Some(top) = &self.learn_top {
            h = top.forward(h);
        }
        if let (Some(project), Some(y)) = (&self.project_ycond, y_onehot) {
            h = h + project.forward(y).reshape([batch_size, c2, 1, 1]);
        }
        split_channels(h)
    }

    /// Encode `x` (preprocessed to `[-0.5, 0.5]`) and score it.
    pub fn forward(&self, x: Tensor<B, 4>, y_onehot: Option<Tensor<B, 2>>) -> GlowOutput<B> {
        let [b, c, h, w] = x.dims();
        let device = x.device();
        let pixels = (c * h * w) as f64;
        let n_bins = 2f64.powi(config::N_BITS as i32);

        // Uniform dequantization of the 8-bit input
        let noise = Tensor::random([b, c, h, w], Distribution::Uniform(0.0, 1.0 / n_bins), &device);
        let logdet = Tensor::full([b], -n_bins.ln() * pixels, &device);

        let (z, objective) = self.encode(x + noise, logdet);
        let (mean, logs) = self.prior(b, y_onehot, &device);
        let objective = objective + gaussian_likelihood(mean, logs, z.clone());

        let y_logits = self.project_class.as_ref().map(|project| {
            let pooled = z
                .clone()
                .mean_dim(2)
                .mean_dim(3)
                .reshape([b, self.top_channels]);
            project.forward(pooled)
        });

        let nll = objective.neg().div_scalar(std::f64::consts::LN_2 * pixels);

        GlowOutput { z, nll, y_logits }
    }

    /// Draw images from the prior. Uses one sample per row of `y_onehot`,
    /// or `num_samples` when unconditional.
    pub fn reverse(
        &self,
        y_onehot: Option<Tensor<B, 2>>,
        temperature: f64,
        num_samples: usize,
        device: &B::Device,
    ) -> Result<Tensor<B, 4>> {
        let batch_size = y_onehot.as_ref().map(|y| y.dims()[0]).unwrap_or(num_samples);
        ensure!(batch_size > 0, "cannot sample an empty batch");
        let (mean, logs) = self.prior(batch_size, y_onehot, device);
        let z = gaussian_sample(mean, logs, temperature);
        self.decode(z, temperature)
    }

    /// Data-dependent actnorm initialisation on a batch of training data.
    pub fn initialize(self, x: Tensor<B, 4>) -> Self {
        let [b, c, h, w] = x.dims();
        let n_bins = 2f64.powi(config::N_BITS as i32);
        let noise = Tensor::random([b, c, h, w], Distribution::Uniform(0.0, 1.0 / n_bins), &x.device());

        let mut z = (x + noise).detach();
        let mut levels = Vec::with_capacity(self.levels.len());
        for level in self.levels {
            z = squeeze2d(z);
            let mut steps = Vec::with_capacity(level.steps.len());
            for step in level.steps {
                let (step, out) = step.initialize(z);
                steps.push(step);
                z = out;
            }
            if let Some(split) = &level.split {
                let (z1, _) = split.forward(z.clone(), Tensor::zeros([b], &z.device()));
                z = z1.detach();
            }
            levels.push(FlowLevel {
                steps,
                split: level.split,
            });
        }

        Self { levels, ..self }
    }
}
