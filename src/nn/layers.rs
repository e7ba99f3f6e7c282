use burn::{
    module::{Module, Param},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        Initializer, Linear, LinearConfig, PaddingConfig2d,
    },
    tensor::{backend::Backend, Tensor},
};

/// Multiplier applied to the learned log-scale of zero-initialised layers
const LOGSCALE_FACTOR: f64 = 3.0;

/// Std of the normal init used for convolutions followed by actnorm
const CONV_INIT_STD: f64 = 0.05;

/// Activation normalization with data-dependent init.
///
/// `y = (x + bias) * exp(logs)` per channel.
#[derive(Module, Debug)]
pub struct ActNorm<B: Backend> {
    bias: Param<Tensor<B, 4>>,
    logs: Param<Tensor<B, 4>>,
    scale: f64,
}

impl<B: Backend> ActNorm<B> {
    pub fn new(channels: usize, scale: f64, device: &B::Device) -> Self {
        Self {
            bias: Param::from_tensor(Tensor::zeros([1, channels, 1, 1], device)),
            logs: Param::from_tensor(Tensor::zeros([1, channels, 1, 1], device)),
            scale,
        }
    }

    /// Normalize without tracking the log-determinant.
    pub fn apply(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        (x + self.bias.val()) * self.logs.val().exp()
    }

    pub fn forward(&self, x: Tensor<B, 4>, logdet: Tensor<B, 1>) -> (Tensor<B, 4>, Tensor<B, 1>) {
        let [_, _, h, w] = x.dims();
        let dlogdet = self.logs.val().sum().mul_scalar((h * w) as f64);
        (self.apply(x), logdet + dlogdet)
    }

    pub fn reverse(&self, y: Tensor<B, 4>, logdet: Tensor<B, 1>) -> (Tensor<B, 4>, Tensor<B, 1>) {
        let [_, _, h, w] = y.dims();
        let logs = self.logs.val();
        let dlogdet = logs.clone().sum().mul_scalar((h * w) as f64);
        (y * logs.neg().exp() - self.bias.val(), logdet - dlogdet)
    }

    /// Set bias and log-scale so `x` comes out with zero mean and `scale` std per channel.
    pub fn initialize(self, x: &Tensor<B, 4>) -> Self {
        let x = x.clone().detach();
        let bias = x.clone().mean_dim(0).mean_dim(2).mean_dim(3).neg();
        let vars = (x + bias.clone())
            .powf_scalar(2.0)
            .mean_dim(0)
            .mean_dim(2)
            .mean_dim(3);
        let logs = vars
            .sqrt()
            .add_scalar(1e-6)
            .recip()
            .mul_scalar(self.scale)
            .log();

        Self {
            bias: Param::initialized(self.bias.id, bias.require_grad()),
            logs: Param::initialized(self.logs.id, logs.require_grad()),
            scale: self.scale,
        }
    }
}

/// Convolution without bias followed by actnorm.
#[derive(Module, Debug)]
pub struct Conv2dNorm<B: Backend> {
    conv: Conv2d<B>,
    actnorm: ActNorm<B>,
}

impl<B: Backend> Conv2dNorm<B> {
    pub fn new(channels: [usize; 2], kernel: usize, device: &B::Device) -> Self {
        let conv = Conv2dConfig::new(channels, [kernel, kernel])
            .with_padding(PaddingConfig2d::Same)
            .with_bias(false)
            .with_initializer(Initializer::Normal {
                mean: 0.0,
                std: CONV_INIT_STD,
            })
            .init(device);

        Self {
            conv,
            actnorm: ActNorm::new(channels[1], 1.0, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.actnorm.apply(self.conv.forward(x))
    }

    pub fn initialize(self, x: Tensor<B, 4>) -> (Self, Tensor<B, 4>) {
        let h = self.conv.forward(x);
        let actnorm = self.actnorm.initialize(&h);
        let out = actnorm.apply(h);
        (
            Self {
                conv: self.conv,
                actnorm,
            },
            out,
        )
    }
}

/// Zero-initialised convolution with a learned output log-scale.
///
/// Starts out as the zero map, so the flow begins as an identity.
#[derive(Module, Debug)]
pub struct Conv2dZeros<B: Backend> {
    conv: Conv2d<B>,
    logs: Param<Tensor<B, 4>>,
}

impl<B: Backend> Conv2dZeros<B> {
    pub fn new(channels: [usize; 2], kernel: usize, device: &B::Device) -> Self {
        let conv = Conv2dConfig::new(channels, [kernel, kernel])
            .with_padding(PaddingConfig2d::Same)
            .with_initializer(Initializer::Zeros)
            .init(device);

        Self {
            conv,
            logs: Param::from_tensor(Tensor::zeros([1, channels[1], 1, 1], device)),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.conv.forward(x) * self.logs.val().mul_scalar(LOGSCALE_FACTOR).exp()
    }
}

/// Zero-initialised linear layer with a learned output log-scale.
#[derive(Module, Debug)]
pub struct LinearZeros<B: Backend> {
    linear: Linear<B>,
    logs: Param<Tensor<B, 2>>,
}

impl<B: Backend> LinearZeros<B> {
    pub fn new(d_input: usize, d_output: usize, device: &B::Device) -> Self {
        let linear = LinearConfig::new(d_input, d_output)
            .with_initializer(Initializer::Zeros)
            .init(device);

        Self {
            linear,
            logs: Param::from_tensor(Tensor::zeros([1, d_output], device)),
        }
    }

    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        self.linear.forward(x) * self.logs.val().mul_scalar(LOGSCALE_FACTOR).exp()
    }
}
