use anyhow::{anyhow, Result};
use burn::tensor::{
    activation::log_softmax,
    backend::Backend,
    Tensor,
};

/// How per-sample losses are reduced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    /// Mean over the batch, shape `[1]`
    Mean,
    /// One value per sample, shape `[B]`
    None,
}

impl Reduction {
    fn apply<B: Backend>(self, t: Tensor<B, 1>) -> Tensor<B, 1> {
        match self {
            Reduction::Mean => t.mean(),
            Reduction::None => t,
        }
    }
}

/// Loss terms of one batch
#[derive(Debug, Clone)]
pub struct Losses<B: Backend> {
    pub total_loss: Tensor<B, 1>,
    pub nll: Tensor<B, 1>,
    pub loss_classes: Option<Tensor<B, 1>>,
}

/// Host copy of [`Losses`], what the engine passes to handlers and metrics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LossValues {
    pub total_loss: Vec<f32>,
    pub nll: Vec<f32>,
    pub loss_classes: Option<Vec<f32>>,
}

impl<B: Backend> Losses<B> {
    pub fn values(&self) -> Result<LossValues> {
        Ok(LossValues {
            total_loss: to_vec(self.total_loss.clone())?,
            nll: to_vec(self.nll.clone())?,
            loss_classes: self.loss_classes.clone().map(to_vec).transpose()?,
        })
    }
}

fn to_vec<B: Backend>(t: Tensor<B, 1>) -> Result<Vec<f32>> {
    t.into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| anyhow!("Failed to read loss values: {:?}", e))
}

/// Unconditional objective: the flow NLL alone.
pub fn compute_loss<B: Backend>(nll: Tensor<B, 1>, reduction: Reduction) -> Losses<B> {
    let nll = reduction.apply(nll);
    Losses {
        total_loss: nll.clone(),
        nll,
        loss_classes: None,
    }
}

/// Class-conditional objective: `nll + y_weight * classification loss`.
///
/// `y` is one-hot (single label) or multi-hot (`multi_class`).
pub fn compute_loss_y<B: Backend>(
    nll: Tensor<B, 1>,
    y_logits: Tensor<B, 2>,
    y_weight: f64,
    y: Tensor<B, 2>,
    multi_class: bool,
    reduction: Reduction,
) -> Losses<B> {
    let nll = reduction.apply(nll);
    let per_sample = if multi_class {
        binary_cross_entropy_with_logits(y_logits, y)
    } else {
        cross_entropy(y_logits, y)
    };
    let loss_classes = reduction.apply(per_sample);

    Losses {
        total_loss: nll.clone() + loss_classes.clone().mul_scalar(y_weight),
        nll,
        loss_classes: Some(loss_classes),
    }
}

/// Cross entropy against `argmax(y)`, one value per sample.
fn cross_entropy<B: Backend>(logits: Tensor<B, 2>, y: Tensor<B, 2>) -> Tensor<B, 1> {
    let [b, _] = logits.dims();
    let target = y.argmax(1);
    log_softmax(logits, 1).gather(1, target).reshape([b]).neg()
}

/// Numerically stable BCE on logits, averaged over classes.
fn binary_cross_entropy_with_logits<B: Backend>(logits: Tensor<B, 2>, y: Tensor<B, 2>) -> Tensor<B, 1> {
    let [b, _] = logits.dims();
    let loss = logits.clone().clamp_min(0.0) - logits.clone() * y
        + logits.abs().neg().exp().add_scalar(1.0).log();
    loss.mean_dim(1).reshape([b])
}
