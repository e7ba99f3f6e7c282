//! Invertible building blocks of the Glow flow.
//!
//! Every layer maps `(x, logdet) -> (z, logdet)` in the encoding direction
//! and has a `reverse` for sampling. `logdet` holds one value per sample.

use anyhow::{anyhow, Result};
use burn::{
    module::{Module, Param},
    tensor::{
        activation::{relu, sigmoid},
        backend::Backend,
        module::conv2d,
        ops::ConvOptions,
        Distribution, Tensor, TensorData,
    },
};
use nalgebra::DMatrix;
use rand::{seq::SliceRandom, Rng};

use super::layers::{ActNorm, Conv2dNorm, Conv2dZeros};
use super::linalg;
use crate::config::{FlowCoupling, FlowPermutation};

const LOG_2PI: f64 = 1.837_877_066_409_345_3;

/// Sum over channel and spatial dims, one value per sample.
pub fn sum_chw<B: Backend>(t: Tensor<B, 4>) -> Tensor<B, 1> {
    let [b, c, h, w] = t.dims();
    t.reshape([b, c * h * w]).sum_dim(1).reshape([b])
}

/// Trade spatial resolution for channels: `[B, C, H, W] -> [B, 4C, H/2, W/2]`.
pub fn squeeze2d<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let [b, c, h, w] = x.dims();
    x.reshape([b, c, h / 2, 2, w / 2, 2])
        .permute([0, 1, 3, 5, 2, 4])
        .reshape([b, c * 4, h / 2, w / 2])
}

pub fn unsqueeze2d<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let [b, c, h, w] = x.dims();
    x.reshape([b, c / 4, 2, 2, h, w])
        .permute([0, 1, 4, 2, 5, 3])
        .reshape([b, c / 4, h * 2, w * 2])
}

/// First half / second half of the channels.
pub fn split_channels<B: Backend>(x: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>) {
    let c = x.dims()[1];
    let half = c / 2;
    (x.clone().narrow(1, 0, half), x.narrow(1, half, c - half))
}

/// Even channels / odd channels.
pub fn split_cross<B: Backend>(x: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>) {
    let [b, c, h, w] = x.dims();
    let pairs = x.reshape([b, c / 2, 2, h, w]);
    let even = pairs.clone().narrow(2, 0, 1).reshape([b, c / 2, h, w]);
    let odd = pairs.narrow(2, 1, 1).reshape([b, c / 2, h, w]);
    (even, odd)
}

/// Per-sample log density of `x` under a diagonal Gaussian.
pub fn gaussian_likelihood<B: Backend>(
    mean: Tensor<B, 4>,
    logs: Tensor<B, 4>,
    x: Tensor<B, 4>,
) -> Tensor<B, 1> {
    let sq = (x - mean).powf_scalar(2.0) * logs.clone().mul_scalar(-2.0).exp();
    let logp = (logs.mul_scalar(2.0) + sq).add_scalar(LOG_2PI).mul_scalar(-0.5);
    sum_chw(logp)
}

pub fn gaussian_sample<B: Backend>(
    mean: Tensor<B, 4>,
    logs: Tensor<B, 4>,
    temperature: f64,
) -> Tensor<B, 4> {
    let eps = Tensor::random(mean.shape(), Distribution::Normal(0.0, 1.0), &mean.device());
    mean + logs.exp() * eps.mul_scalar(temperature)
}

fn tensor_to_matrix<B: Backend>(t: Tensor<B, 2>) -> Result<DMatrix<f64>> {
    let [rows, cols] = t.dims();
    let values = t
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| anyhow!("Failed to read tensor: {:?}", e))?;
    Ok(DMatrix::from_row_iterator(rows, cols, values.into_iter().map(f64::from)))
}

fn matrix_tensor<B: Backend>(m: &DMatrix<f64>, device: &B::Device) -> Tensor<B, 2> {
    // nalgebra stores columns first; the tensor wants rows
    let data: Vec<f32> = m.transpose().iter().map(|v| *v as f32).collect();
    Tensor::from_data(TensorData::new(data, [m.nrows(), m.ncols()]), device)
}

fn vector_tensor<B: Backend>(values: &[f64], device: &B::Device) -> Tensor<B, 1> {
    let data: Vec<f32> = values.iter().map(|v| *v as f32).collect();
    Tensor::from_data(TensorData::new(data, [values.len()]), device)
}

fn conv1x1<B: Backend>(x: Tensor<B, 4>, weight: Tensor<B, 2>) -> Tensor<B, 4> {
    let [c_out, c_in] = weight.dims();
    conv2d(
        x,
        weight.reshape([c_out, c_in, 1, 1]),
        None,
        ConvOptions::new([1, 1], [0, 0], [1, 1], 1),
    )
}

/// Inverse of a weight matrix, computed off the autodiff graph.
fn inverse_weight<B: Backend>(weight: Tensor<B, 2>) -> Result<Tensor<B, 2>> {
    let device = weight.device();
    let w = tensor_to_matrix(weight.detach())?;
    let inv = linalg::invert(&w).ok_or_else(|| anyhow!("1x1 conv weight is singular"))?;
    Ok(matrix_tensor(&inv, &device))
}

/// Invertible 1x1 convolution with an unconstrained weight.
#[derive(Module, Debug)]
pub struct InvConv<B: Backend> {
    weight: Param<Tensor<B, 2>>,
}

impl<B: Backend> InvConv<B> {
    pub fn new<R: Rng>(channels: usize, device: &B::Device, rng: &mut R) -> Self {
        let w = linalg::random_orthogonal(channels, rng);
        Self {
            weight: Param::from_tensor(matrix_tensor(&w, device)),
        }
    }

    fn dlogdet(&self, h: usize, w: usize) -> Tensor<B, 1> {
        linalg::log_abs_det_tensor(self.weight.val()).mul_scalar((h * w) as f64)
    }

    pub fn forward(&self, x: Tensor<B, 4>, logdet: Tensor<B, 1>) -> (Tensor<B, 4>, Tensor<B, 1>) {
        let [_, _, h, w] = x.dims();
        let dlogdet = self.dlogdet(h, w);
        (conv1x1(x, self.weight.val()), logdet + dlogdet)
    }

    pub fn reverse(&self, z: Tensor<B, 4>, logdet: Tensor<B, 1>) -> Result<(Tensor<B, 4>, Tensor<B, 1>)> {
        let [_, _, h, w] = z.dims();
        let dlogdet = self.dlogdet(h, w);
        let inv = inverse_weight(self.weight.val())?;
        Ok((conv1x1(z, inv), logdet - dlogdet))
    }
}

/// Invertible 1x1 convolution parametrised as `W = P L (U + diag(s))`.
///
/// `p` and `sign_s` are fixed at init and never receive gradients.
#[derive(Module, Debug)]
pub struct InvConvLU<B: Backend> {
    p: Param<Tensor<B, 2>>,
    sign_s: Param<Tensor<B, 1>>,
    lower: Param<Tensor<B, 2>>,
    upper: Param<Tensor<B, 2>>,
    log_s: Param<Tensor<B, 1>>,
    channels: usize,
}

impl<B: Backend> InvConvLU<B> {
    pub fn new<R: Rng>(channels: usize, device: &B::Device, rng: &mut R) -> Self {
        let n = channels;
        let w = linalg::random_orthogonal(n, rng);
        let lu = linalg::lu_decompose(&w);

        let s: Vec<f64> = lu.u.diagonal().iter().copied().collect();
        let sign_s: Vec<f64> = s.iter().map(|v| if *v < 0.0 { -1.0 } else { 1.0 }).collect();
        let log_s: Vec<f64> = s.iter().map(|v| v.abs().ln()).collect();
        let mut upper = lu.u.clone();
        upper.fill_diagonal(0.0);

        Self {
            p: Param::from_tensor(matrix_tensor(&lu.p, device)),
            sign_s: Param::from_tensor(vector_tensor(&sign_s, device)),
            lower: Param::from_tensor(matrix_tensor(&lu.l, device)),
            upper: Param::from_tensor(matrix_tensor(&upper, device)),
            log_s: Param::from_tensor(vector_tensor(&log_s, device)),
            channels,
        }
    }

    fn weight(&self) -> Tensor<B, 2> {
        let n = self.channels;
        let device = self.lower.val().device();

        let strict_lower = DMatrix::from_fn(n, n, |i, j| if j < i { 1.0 } else { 0.0 });
        let l_mask = matrix_tensor::<B>(&strict_lower, &device);
        let eye = matrix_tensor::<B>(&DMatrix::identity(n, n), &device);

        let l = self.lower.val() * l_mask.clone() + eye.clone();
        let s = self.sign_s.val().detach() * self.log_s.val().exp();
        let u = self.upper.val() * l_mask.transpose() + eye * s.unsqueeze_dim::<2>(0);

        self.p.val().detach().matmul(l).matmul(u)
    }

    fn dlogdet(&self, h: usize, w: usize) -> Tensor<B, 1> {
        self.log_s.val().sum().mul_scalar((h * w) as f64)
    }

    pub fn forward(&self, x: Tensor<B, 4>, logdet: Tensor<B, 1>) -> (Tensor<B, 4>, Tensor<B, 1>) {
        let [_, _, h, w] = x.dims();
        (conv1x1(x, self.weight()), logdet + self.dlogdet(h, w))
    }

    pub fn reverse(&self, z: Tensor<B, 4>, logdet: Tensor<B, 1>) -> Result<(Tensor<B, 4>, Tensor<B, 1>)> {
        let [_, _, h, w] = z.dims();
        let inv = inverse_weight(self.weight())?;
        Ok((conv1x1(z, inv), logdet - self.dlogdet(h, w)))
    }
}

/// Fixed random channel permutation, stored so it survives checkpoints.
#[derive(Module, Debug)]
pub struct Shuffle<B: Backend> {
    indices: Param<Tensor<B, 1>>,
    inverse: Param<Tensor<B, 1>>,
}

impl<B: Backend> Shuffle<B> {
    pub fn new<R: Rng>(channels: usize, device: &B::Device, rng: &mut R) -> Self {
        let mut perm: Vec<usize> = (0..channels).collect();
        perm.shuffle(rng);
        let mut inverse = vec![0usize; channels];
        for (i, &p) in perm.iter().enumerate() {
            inverse[p] = i;
        }
        let as_f64 = |v: &[usize]| v.iter().map(|i| *i as f64).collect::<Vec<_>>();

        Self {
            indices: Param::from_tensor(vector_tensor(&as_f64(&perm), device)),
            inverse: Param::from_tensor(vector_tensor(&as_f64(&inverse), device)),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        x.select(1, self.indices.val().detach().int())
    }

    pub fn reverse(&self, z: Tensor<B, 4>) -> Tensor<B, 4> {
        z.select(1, self.inverse.val().detach().int())
    }
}

/// Channel permutation of a flow step. `reverse` flips the channel order
/// and is the variant with no fields set.
#[derive(Module, Debug)]
pub struct Permute<B: Backend> {
    invconv: Option<InvConv<B>>,
    invconv_lu: Option<InvConvLU<B>>,
    shuffle: Option<Shuffle<B>>,
}

impl<B: Backend> Permute<B> {
    pub fn new<R: Rng>(
        kind: FlowPermutation,
        channels: usize,
        lu_decomposed: bool,
        device: &B::Device,
        rng: &mut R,
    ) -> Self {
        let mut permute = Self {
            invconv: None,
            invconv_lu: None,
            shuffle: None,
        };
        match kind {
            FlowPermutation::Invconv if lu_decomposed => {
                permute.invconv_lu = Some(InvConvLU::new(channels, device, rng))
            }
            FlowPermutation::Invconv => permute.invconv = Some(InvConv::new(channels, device, rng)),
            FlowPermutation::Shuffle => permute.shuffle = Some(Shuffle::new(channels, device, rng)),
            FlowPermutation::Reverse => {}
        }
        permute
    }

    pub fn forward(&self, x: Tensor<B, 4>, logdet: Tensor<B, 1>) -> (Tensor<B, 4>, Tensor<B, 1>) {
        if let Some(conv) = &self.invconv_lu {
            conv.forward(x, logdet)
        } else if let Some(conv) = &self.invconv {
            conv.forward(x, logdet)
        } else if let Some(shuffle) = &self.shuffle {
            (shuffle.forward(x), logdet)
        } else {
            (x.flip([1]), logdet)
        }
    }

    pub fn reverse(&self, z: Tensor<B, 4>, logdet: Tensor<B, 1>) -> Result<(Tensor<B, 4>, Tensor<B, 1>)> {
        if let Some(conv) = &self.invconv_lu {
            conv.reverse(z, logdet)
        } else if let Some(conv) = &self.invconv {
            conv.reverse(z, logdet)
        } else if let Some(shuffle) = &self.shuffle {
            Ok((shuffle.reverse(z), logdet))
        } else {
            Ok((z.flip([1]), logdet))
        }
    }
}

/// `conv3x3 -> relu -> conv1x1 -> relu -> zero conv3x3`
#[derive(Module, Debug)]
pub struct CouplingBlock<B: Backend> {
    conv_in: Conv2dNorm<B>,
    conv_hidden: Conv2dNorm<B>,
    conv_out: Conv2dZeros<B>,
}

impl<B: Backend> CouplingBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, hidden: usize, device: &B::Device) -> Self {
        Self {
            conv_in: Conv2dNorm::new([in_channels, hidden], 3, device),
            conv_hidden: Conv2dNorm::new([hidden, hidden], 1, device),
            conv_out: Conv2dZeros::new([hidden, out_channels], 3, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let h = relu(self.conv_in.forward(x));
        let h = relu(self.conv_hidden.forward(h));
        self.conv_out.forward(h)
    }

    pub fn initialize(self, x: Tensor<B, 4>) -> Self {
        let (conv_in, h) = self.conv_in.initialize(x);
        let (conv_hidden, _) = self.conv_hidden.initialize(relu(h));
        Self {
            conv_in,
            conv_hidden,
            conv_out: self.conv_out,
        }
    }
}

/// Additive or affine coupling over the two channel halves.
#[derive(Module, Debug)]
pub struct Coupling<B: Backend> {
    block: CouplingBlock<B>,
    affine: bool,
}

impl<B: Backend> Coupling<B> {
    pub fn new(kind: FlowCoupling, channels: usize, hidden: usize, device: &B::Device) -> Self {
        let c1 = channels / 2;
        let c2 = channels - c1;
        let affine = kind == FlowCoupling::Affine;
        let out = if affine { 2 * c2 } else { c2 };
        Self {
            block: CouplingBlock::new(c1, out, hidden, device),
            affine,
        }
    }

    fn shift_scale(&self, z1: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let (shift, scale) = split_cross(self.block.forward(z1));
        (shift, sigmoid(scale.add_scalar(2.0)))
    }

    pub fn forward(&self, z: Tensor<B, 4>, logdet: Tensor<B, 1>) -> (Tensor<B, 4>, Tensor<B, 1>) {
        let (z1, z2) = split_channels(z);
        if self.affine {
            let (shift, scale) = self.shift_scale(z1.clone());
            let z2 = (z2 + shift) * scale.clone();
            let logdet = logdet + sum_chw(scale.log());
            (Tensor::cat(vec![z1, z2], 1), logdet)
        } else {
            let z2 = z2 + self.block.forward(z1.clone());
            (Tensor::cat(vec![z1, z2], 1), logdet)
        }
    }

    pub fn reverse(&self, z: Tensor<B, 4>, logdet: Tensor<B, 1>) -> (Tensor<B, 4>, Tensor<B, 1>) {
        let (z1, z2) = split_channels(z);
        if self.affine {
            let (shift, scale) = self.shift_scale(z1.clone());
            let z2 = z2 / scale.clone() - shift;
            let logdet = logdet - sum_chw(scale.log());
            (Tensor::cat(vec![z1, z2], 1), logdet)
        } else {
            let z2 = z2 - self.block.forward(z1.clone());
            (Tensor::cat(vec![z1, z2], 1), logdet)
        }
    }

    pub fn initialize(self, z: Tensor<B, 4>) -> Self {
        let (z1, _) = split_channels(z);
        Self {
            block: self.block.initialize(z1),
            affine: self.affine,
        }
    }
}

/// `ActNorm -> Permute -> Coupling`
#[derive(Module, Debug)]
pub struct FlowStep<B: Backend> {
    actnorm: ActNorm<B>,
    permute: Permute<B>,
    coupling: Coupling<B>,
}

/// Layer choices shared by all flow steps.
#[derive(Debug, Clone, Copy)]
pub struct StepSpec {
    pub hidden_channels: usize,
    pub actnorm_scale: f64,
    pub permutation: FlowPermutation,
    pub coupling: FlowCoupling,
    pub lu_decomposed: bool,
}

impl<B: Backend> FlowStep<B> {
    pub fn new<R: Rng>(channels: usize, spec: &StepSpec, device: &B::Device, rng: &mut R) -> Self {
        Self {
            actnorm: ActNorm::new(channels, spec.actnorm_scale, device),
            permute: Permute::new(spec.permutation, channels, spec.lu_decomposed, device, rng),
            coupling: Coupling::new(spec.coupling, channels, spec.hidden_channels, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>, logdet: Tensor<B, 1>) -> (Tensor<B, 4>, Tensor<B, 1>) {
        let (z, logdet) = self.actnorm.forward(x, logdet);
        let (z, logdet) = self.permute.forward(z, logdet);
        self.coupling.forward(z, logdet)
    }

    pub fn reverse(&self, z: Tensor<B, 4>, logdet: Tensor<B, 1>) -> Result<(Tensor<B, 4>, Tensor<B, 1>)> {
        let (x, logdet) = self.coupling.reverse(z, logdet);
        let (x, logdet) = self.permute.reverse(x, logdet)?;
        Ok(self.actnorm.reverse(x, logdet))
    }

    /// Data-dependent init of every actnorm in the step; returns the step output too.
    pub fn initialize(self, x: Tensor<B, 4>) -> (Self, Tensor<B, 4>) {
        let [b, ..] = x.dims();
        let logdet = Tensor::zeros([b], &x.device());

        let actnorm = self.actnorm.initialize(&x);
        let (z, logdet) = actnorm.forward(x, logdet);
        let (z, logdet) = self.permute.forward(z, logdet);
        let coupling = self.coupling.initialize(z.clone());
        let (out, _) = coupling.forward(z, logdet);

        (
            Self {
                actnorm,
                permute: self.permute,
                coupling,
            },
            out.detach(),
        )
    }
}

/// Factors out half of the channels under a learned conditional Gaussian.
#[derive(Module, Debug)]
pub struct Split2d<B: Backend> {
    conv: Conv2dZeros<B>,
}

impl<B: Backend> Split2d<B> {
    pub fn new(channels: usize, device: &B::Device) -> Self {
        Self {
            conv: Conv2dZeros::new([channels / 2, channels], 3, device),
        }
    }

    fn prior(&self, z1: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>) {
        split_cross(self.conv.forward(z1))
    }

    pub fn forward(&self, x: Tensor<B, 4>, logdet: Tensor<B, 1>) -> (Tensor<B, 4>, Tensor<B, 1>) {
        let (z1, z2) = split_channels(x);
        let (mean, logs) = self.prior(z1.clone());
        (z1, logdet + gaussian_likelihood(mean, logs, z2))
    }

    pub fn reverse(&self, z1: Tensor<B, 4>, temperature: f64) -> Tensor<B, 4> {
        let (mean, logs) = self.prior(z1.clone());
        let z2 = gaussian_sample(mean, logs, temperature);
        Tensor::cat(vec![z1, z2], 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    type TestBackend = NdArray;

    fn max_abs_diff(a: Tensor<TestBackend, 4>, b: Tensor<TestBackend, 4>) -> f32 {
        (a - b).abs().max().into_scalar()
    }

    #[test]
    fn test_squeeze_roundtrip_and_shape() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::random([2, 3, 4, 6], Distribution::Default, &device);
        let s = squeeze2d(x.clone());
        assert_eq!(s.dims(), [2, 12, 2, 3]);
        assert_eq!(max_abs_diff(unsqueeze2d(s), x), 0.0);
    }

    #[test]
    fn test_split_cross_takes_alternating_channels() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 1>::from_floats([0.0, 1.0, 2.0, 3.0], &device).reshape([1, 4, 1, 1]);
        let (even, odd) = split_cross(x);
        assert_eq!(even.into_data().to_vec::<f32>().unwrap(), vec![0.0, 2.0]);
        assert_eq!(odd.into_data().to_vec::<f32>().unwrap(), vec![1.0, 3.0]);
    }

    #[test]
    fn test_gaussian_likelihood_standard_normal_at_zero() {
        let device = Default::default();
        let zeros = Tensor::<TestBackend, 4>::zeros([1, 2, 1, 1], &device);
        let logp = gaussian_likelihood(zeros.clone(), zeros.clone(), zeros);
        let expected = -LOG_2PI as f32; // two dims at -0.5 ln(2 pi) each
        assert!((logp.into_scalar() - expected).abs() < 1e-5);
    }

    #[test]
    fn test_permutations_invert_with_matching_logdet() {
        let device = Default::default();
        let mut rng = StdRng::seed_from_u64(11);
        let x = Tensor::<TestBackend, 4>::random([2, 4, 3, 3], Distribution::Default, &device);

        for (kind, lu) in [
            (FlowPermutation::Invconv, true),
            (FlowPermutation::Invconv, false),
            (FlowPermutation::Shuffle, false),
            (FlowPermutation::Reverse, false),
        ] {
            let permute = Permute::<TestBackend>::new(kind, 4, lu, &device, &mut rng);
            let zero = Tensor::zeros([2], &device);
            let (z, logdet) = permute.forward(x.clone(), zero);
            let (back, restored) = permute.reverse(z, logdet).unwrap();
            assert!(max_abs_diff(back, x.clone()) < 1e-4, "{kind:?} lu={lu}");
            let restored = restored.into_data().to_vec::<f32>().unwrap();
            assert!(restored.iter().all(|v| v.abs() < 1e-3), "{kind:?} lu={lu}");
        }
    }

    #[test]
    fn test_flow_step_inverts_after_init() {
        let device = Default::default();
        let mut rng = StdRng::seed_from_u64(5);
        let spec = StepSpec {
            hidden_channels: 8,
            actnorm_scale: 1.0,
            permutation: FlowPermutation::Invconv,
            coupling: FlowCoupling::Affine,
            lu_decomposed: true,
        };
        let x = Tensor::<TestBackend, 4>::random([4, 4, 4, 4], Distribution::Normal(0.0, 1.0), &device);
        let (step, _) = FlowStep::<TestBackend>::new(4, &spec, &device, &mut rng).initialize(x.clone());

        let (z, logdet) = step.forward(x.clone(), Tensor::zeros([4], &device));
        let (back, _) = step.reverse(z, logdet).unwrap();
        assert!(max_abs_diff(back, x) < 1e-3);
    }

    #[test]
    fn test_split_keeps_first_half() {
        let device = Default::default();
        let split = Split2d::<TestBackend>::new(4, &device);
        let x = Tensor::<TestBackend, 4>::random([2, 4, 2, 2], Distribution::Default, &device);
        let (z1, logdet) = split.forward(x.clone(), Tensor::zeros([2], &device));
        assert_eq!(z1.dims(), [2, 2, 2, 2]);
        assert_eq!(logdet.dims(), [2]);
        assert_eq!(split.reverse(z1, 1.0).dims(), [2, 4, 2, 2]);
    }
}
