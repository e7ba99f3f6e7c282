use std::marker::PhantomData;

use burn::{
    module::{AutodiffModule, ModuleVisitor, ParamId},
    optim::{adaptor::OptimizerAdaptor, GradientsParams, SimpleOptimizer},
    record::Record,
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Tensor,
    },
};

/// Adamax optimizer settings (Adam with an infinity-norm second moment)
#[derive(burn::config::Config)]
pub struct AdamaxConfig {
    #[config(default = 0.9)]
    pub beta_1: f64,
    #[config(default = 0.999)]
    pub beta_2: f64,
    #[config(default = 1e-8)]
    pub epsilon: f64,
    #[config(default = 0.0)]
    pub weight_decay: f64,
}

impl AdamaxConfig {
    pub fn init<B: AutodiffBackend, M: AutodiffModule<B>>(&self) -> OptimizerAdaptor<Adamax, M, B> {
        OptimizerAdaptor::from(Adamax {
            beta_1: self.beta_1,
            beta_2: self.beta_2,
            epsilon: self.epsilon,
            weight_decay: self.weight_decay,
        })
    }
}

#[derive(Clone, Debug)]
pub struct Adamax {
    beta_1: f64,
    beta_2: f64,
    epsilon: f64,
    weight_decay: f64,
}

/// Per-parameter Adamax moments
#[derive(Record, Clone)]
pub struct AdamaxState<B: Backend, const D: usize> {
    pub time: usize,
    pub exp_avg: Tensor<B, D>,
    pub exp_inf: Tensor<B, D>,
}

impl<B: Backend> SimpleOptimizer<B> for Adamax {
    type State<const D: usize> = AdamaxState<B, D>;

    fn step<const D: usize>(
        &self,
        lr: f64,
        tensor: Tensor<B, D>,
        grad: Tensor<B, D>,
        state: Option<Self::State<D>>,
    ) -> (Tensor<B, D>, Option<Self::State<D>>) {
        let grad = if self.weight_decay > 0.0 {
            grad + tensor.clone().mul_scalar(self.weight_decay)
        } else {
            grad
        };
        let bound = grad.clone().abs().add_scalar(self.epsilon);
        let first = grad.mul_scalar(1.0 - self.beta_1);

        let (time, exp_avg, exp_inf) = match state {
            Some(state) => (
                state.time + 1,
                state.exp_avg.mul_scalar(self.beta_1) + first,
                state.exp_inf.mul_scalar(self.beta_2).max_pair(bound),
            ),
            None => (1, first, bound),
        };

        let bias_correction = 1.0 - self.beta_1.powi(time as i32);
        let step_size = lr / bias_correction;
        let update = (exp_avg.clone() / exp_inf.clone()).mul_scalar(step_size);

        (
            tensor - update,
            Some(AdamaxState {
                time,
                exp_avg,
                exp_inf,
            }),
        )
    }

    fn to_device<const D: usize>(mut state: Self::State<D>, device: &B::Device) -> Self::State<D> {
        state.exp_avg = state.exp_avg.to_device(device);
        state.exp_inf = state.exp_inf.to_device(device);
        state
    }
}

struct GradNormVisitor<'a, B: AutodiffBackend> {
    grads: &'a GradientsParams,
    sum_sq: f64,
    _backend: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradNormVisitor<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if let Some(grad) = self.grads.get::<B::InnerBackend, D>(id) {
            self.sum_sq += grad.powf_scalar(2.0).sum().into_scalar().elem::<f64>();
        }
    }
}

#[derive(Clone, Copy)]
enum GradEdit {
    Clamp(f64),
    Scale(f64),
}

struct GradEditVisitor<'a, B: AutodiffBackend> {
    grads: &'a mut GradientsParams,
    edit: GradEdit,
    _backend: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradEditVisitor<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id) {
            let grad = match self.edit {
                GradEdit::Clamp(max) => grad.clamp(-max, max),
                GradEdit::Scale(factor) => grad.mul_scalar(factor),
            };
            self.grads.register::<B::InnerBackend, D>(id, grad);
        }
    }
}

fn edit_grads<B: AutodiffBackend, M: AutodiffModule<B>>(
    module: &M,
    mut grads: GradientsParams,
    edit: GradEdit,
) -> GradientsParams {
    let mut visitor = GradEditVisitor::<B> {
        grads: &mut grads,
        edit,
        _backend: PhantomData,
    };
    module.visit(&mut visitor);
    grads
}

/// Global L2 norm over every parameter gradient of `module`.
pub fn grad_norm<B: AutodiffBackend, M: AutodiffModule<B>>(module: &M, grads: &GradientsParams) -> f64 {
    let mut visitor = GradNormVisitor::<B> {
        grads,
        sum_sq: 0.0,
        _backend: PhantomData,
    };
    module.visit(&mut visitor);
    visitor.sum_sq.sqrt()
}

/// Clamp every gradient element into `[-max_value, max_value]`.
pub fn clip_grad_value<B: AutodiffBackend, M: AutodiffModule<B>>(
    module: &M,
    grads: GradientsParams,
    max_value: f64,
) -> GradientsParams {
    edit_grads::<B, M>(module, grads, GradEdit::Clamp(max_value))
}

/// Rescale all gradients so their global norm is at most `max_norm`.
///
/// Returns the clipped gradients and the norm measured before clipping.
pub fn clip_grad_norm<B: AutodiffBackend, M: AutodiffModule<B>>(
    module: &M,
    grads: GradientsParams,
    max_norm: f64,
) -> (GradientsParams, f64) {
    let total = grad_norm::<B, M>(module, &grads);
    let coef = max_norm / (total + 1e-6);
    if coef < 1.0 {
        (edit_grads::<B, M>(module, grads, GradEdit::Scale(coef)), total)
    } else {
        (grads, total)
    }
}

/// Linear learning-rate warmup stepped once per epoch.
///
/// `lr = base * min(1, (epoch + 1) / warmup)`; `warmup <= 0` disables it.
#[derive(Debug, Clone)]
pub struct WarmupSchedule {
    base_lr: f64,
    warmup: f64,
    epoch: usize,
}

impl WarmupSchedule {
    pub fn new(base_lr: f64, warmup: f64) -> Self {
        Self {
            base_lr,
            warmup,
            epoch: 0,
        }
    }

    /// Continue from `epoch` completed scheduler steps (checkpoint resume).
    pub fn at_epoch(mut self, epoch: usize) -> Self {
        self.epoch = epoch;
        self
    }

    pub fn lr(&self) -> f64 {
        if self.warmup <= 0.0 {
            return self.base_lr;
        }
        let factor = ((self.epoch + 1) as f64 / self.warmup).min(1.0);
        self.base_lr * factor
    }

    pub fn step(&mut self) -> f64 {
        self.epoch += 1;
        self.lr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::module::Module;
    use burn::nn::{Linear, LinearConfig};

    type TestBackend = NdArray;
    type TestAutodiff = Autodiff<NdArray>;

    fn linear_grads() -> (Linear<TestAutodiff>, GradientsParams) {
        let device = Default::default();
        let linear: Linear<TestAutodiff> = LinearConfig::new(2, 1).init(&device);
        let x = Tensor::<TestAutodiff, 2>::from_floats([[3.0, 4.0]], &device);
        let loss = linear.forward(x).sum();
        let grads = GradientsParams::from_grads(loss.backward(), &linear);
        (linear, grads)
    }

    #[test]
    fn test_adamax_first_step_moves_by_lr() {
        let device = Default::default();
        let adamax = Adamax {
            beta_1: 0.9,
            beta_2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
        };
        let param = Tensor::<TestBackend, 1>::from_floats([1.0, 1.0], &device);
        let grad = Tensor::<TestBackend, 1>::from_floats([0.5, -2.0], &device);

        let (updated, state) = SimpleOptimizer::<TestBackend>::step(&adamax, 0.1, param, grad, None);
        let v = updated.into_data().to_vec::<f32>().unwrap();
        assert!((v[0] - 0.9).abs() < 1e-5);
        assert!((v[1] - 1.1).abs() < 1e-5);
        assert_eq!(state.unwrap().time, 1);
    }

    #[test]
    fn test_grad_norm_of_linear_layer() {
        let (linear, grads) = linear_grads();
        // d/dW = x = [3, 4], d/db = 1
        let norm = grad_norm::<TestAutodiff, _>(&linear, &grads);
        assert!((norm - 26f64.sqrt()).abs() < 1e-4);
    }

    #[test]
    fn test_clip_grad_norm_rescales_to_max() {
        let (linear, grads) = linear_grads();
        let (clipped, before) = clip_grad_norm::<TestAutodiff, _>(&linear, grads, 1.0);
        assert!((before - 26f64.sqrt()).abs() < 1e-4);
        let after = grad_norm::<TestAutodiff, _>(&linear, &clipped);
        assert!((after - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_clip_grad_norm_leaves_small_grads() {
        let (linear, grads) = linear_grads();
        let (clipped, _) = clip_grad_norm::<TestAutodiff, _>(&linear, grads, 100.0);
        let after = grad_norm::<TestAutodiff, _>(&linear, &clipped);
        assert!((after - 26f64.sqrt()).abs() < 1e-4);
    }

    #[test]
    fn test_clip_grad_value_clamps_elements() {
        let (linear, grads) = linear_grads();
        let clipped = clip_grad_value::<TestAutodiff, _>(&linear, grads, 2.0);
        // [2, 2] and 1 after clamping
        let after = grad_norm::<TestAutodiff, _>(&linear, &clipped);
        assert!((after - 3.0).abs() < 1e-4);
        assert_eq!(linear.num_params(), 3);
    }

    #[test]
    fn test_warmup_schedule() {
        let mut schedule = WarmupSchedule::new(1.0, 4.0);
        assert!((schedule.lr() - 0.25).abs() < 1e-12);
        assert!((schedule.step() - 0.5).abs() < 1e-12);
        schedule.step();
        schedule.step();
        assert!((schedule.lr() - 1.0).abs() < 1e-12);
        assert!((schedule.step() - 1.0).abs() < 1e-12);

        assert!((WarmupSchedule::new(0.1, 5.0).at_epoch(2).lr() - 0.06).abs() < 1e-12);
        assert_eq!(WarmupSchedule::new(0.3, 0.0).lr(), 0.3);
    }
}
