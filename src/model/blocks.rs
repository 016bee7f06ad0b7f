use burn::{
    nn::{
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Initializer, PaddingConfig2d, Relu,
        conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig},
    },
    prelude::*,
};

/// ReLU capped at 6, as used throughout MobileNetV2.
pub fn relu6<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    x.clamp(0.0, 6.0)
}

/// Padding and output padding that make a stride-2 transposed convolution
/// exactly double the spatial size ("same" padding).
pub fn same_transposed_padding(kernel_size: usize) -> (usize, usize) {
    let padding = kernel_size.saturating_sub(1) / 2;
    let padding_out = (2 * padding + 2).saturating_sub(kernel_size);

    (padding, padding_out)
}

/// Zero padding ahead of a strided convolution without padding of its own.
///
/// Each side gets `kernel_size / 2` zeros after the data and one fewer
/// before it when its length is even, so the first window starts on the
/// first pixel (Keras' `correct_pad`).
pub fn correct_pad<B: Backend>(x: Tensor<B, 4>, kernel_size: usize) -> Tensor<B, 4> {
    let [_, _, height, width] = x.dims();
    let after = kernel_size / 2;
    let before = |side: usize| {
        if side % 2 == 0 {
            after.saturating_sub(1)
        } else {
            after
        }
    };

    x.pad((before(width), after, before(height), after), 0.0)
}

/// Convolution, batch norm and optional ReLU6.
#[derive(Module, Debug)]
pub struct ConvNormBlock<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B, 2>,
    activation: bool,
    kernel_size: usize,
    stride: usize,
}

impl<B: Backend> ConvNormBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = if self.stride > 1 {
            correct_pad(x, self.kernel_size)
        } else {
            x
        };
        let x = self.conv.forward(x);
        let x = self.norm.forward(x);

        if self.activation { relu6(x) } else { x }
    }
}

#[derive(Config, Debug)]
pub struct ConvNormBlockConfig {
    input_channels: usize,
    num_filters: usize,
    #[config(default = "3")]
    kernel_size: usize,
    #[config(default = "1")]
    stride: usize,
    #[config(default = "1")]
    groups: usize,
    #[config(default = "true")]
    activation: bool,
}

impl ConvNormBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvNormBlock<B> {
        // Strided layers pad asymmetrically in `forward`.
        let padding = if self.stride > 1 {
            PaddingConfig2d::Valid
        } else {
            let pad = self.kernel_size / 2;
            PaddingConfig2d::Explicit(pad, pad)
        };

        ConvNormBlock {
            conv: Conv2dConfig::new(
                [self.input_channels, self.num_filters],
                [self.kernel_size, self.kernel_size],
            )
            .with_stride([self.stride, self.stride])
            .with_padding(padding)
            .with_groups(self.groups)
            .with_bias(false)
            .init(device),
            norm: BatchNormConfig::new(self.num_filters)
                .with_epsilon(1e-3)
                .with_momentum(0.001)
                .init(device),
            activation: self.activation,
            kernel_size: self.kernel_size,
            stride: self.stride,
        }
    }
}

/// Intermediate activations of an [InvertedResidual] block.
pub struct InvertedResidualOutput<B: Backend> {
    /// Block output (after projection, batch norm and the residual add).
    pub output: Tensor<B, 4>,
    /// Activation fed to the depthwise convolution: the 1x1 expansion output,
    /// or the block input itself when the expansion ratio is 1.
    pub expanded: Tensor<B, 4>,
    /// Raw 1x1 projection before its batch norm.
    pub projected: Tensor<B, 4>,
}

/// MobileNetV2 inverted residual: expand (1x1) -> depthwise (3x3) -> project (1x1).
#[derive(Module, Debug)]
pub struct InvertedResidual<B: Backend> {
    expand: Option<ConvNormBlock<B>>,
    depthwise: ConvNormBlock<B>,
    project_conv: Conv2d<B>,
    project_norm: BatchNorm<B, 2>,
    use_residual: bool,
}

impl<B: Backend> InvertedResidual<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.forward_with_taps(x).output
    }

    pub fn forward_with_taps(&self, input: Tensor<B, 4>) -> InvertedResidualOutput<B> {
        let expanded = match &self.expand {
            Some(expand) => expand.forward(input.clone()),
            None => input.clone(),
        };

        let x = self.depthwise.forward(expanded.clone());

        let projected = self.project_conv.forward(x);
        let x = self.project_norm.forward(projected.clone());

        let output = if self.use_residual { x + input } else { x };

        InvertedResidualOutput {
            output,
            expanded,
            projected,
        }
    }
}

#[derive(Config, Debug)]
pub struct InvertedResidualConfig {
    input_channels: usize,
    output_channels: usize,
    stride: usize,
    expand_ratio: usize,
}

impl InvertedResidualConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> InvertedResidual<B> {
        let hidden = self.input_channels * self.expand_ratio;

        let expand = (self.expand_ratio != 1).then(|| {
            ConvNormBlockConfig::new(self.input_channels, hidden)
                .with_kernel_size(1)
                .init(device)
        });

        InvertedResidual {
            expand,
            depthwise: ConvNormBlockConfig::new(hidden, hidden)
                .with_stride(self.stride)
                .with_groups(hidden)
                .init(device),
            project_conv: Conv2dConfig::new([hidden, self.output_channels], [1, 1])
                .with_bias(false)
                .init(device),
            project_norm: BatchNormConfig::new(self.output_channels)
                .with_epsilon(1e-3)
                .with_momentum(0.001)
                .init(device),
            use_residual: self.stride == 1 && self.input_channels == self.output_channels,
        }
    }
}

/// Decoder stage doubling the spatial size: transposed conv -> batch norm ->
/// optional dropout -> ReLU.
#[derive(Module, Debug)]
pub struct UpsampleBlock<B: Backend> {
    conv_transpose: ConvTranspose2d<B>,
    norm: BatchNorm<B, 2>,
    dropout: Option<Dropout>,
    activation: Relu,
}

impl<B: Backend> UpsampleBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv_transpose.forward(x);
        let x = self.norm.forward(x);
        let x = match &self.dropout {
            Some(dropout) => dropout.forward(x),
            None => x,
        };

        self.activation.forward(x)
    }

    /// Upsample `x` and concatenate the skip connection along the channel axis.
    pub fn forward_skip(&self, x: Tensor<B, 4>, skip_features: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.forward(x);

        Tensor::cat(vec![x, skip_features], 1)
    }
}

#[derive(Config, Debug)]
pub struct UpsampleBlockConfig {
    input_channels: usize,
    num_filters: usize,
    #[config(default = "3")]
    kernel_size: usize,
    /// Dropout probability; no dropout layer when unset.
    pub dropout: Option<f64>,
}

impl UpsampleBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> UpsampleBlock<B> {
        let (padding, padding_out) = same_transposed_padding(self.kernel_size);

        UpsampleBlock {
            conv_transpose: ConvTranspose2dConfig::new(
                [self.input_channels, self.num_filters],
                [self.kernel_size, self.kernel_size],
            )
            .with_stride([2, 2])
            .with_padding([padding, padding])
            .with_padding_out([padding_out, padding_out])
            .with_bias(false)
            .with_initializer(Initializer::Normal {
                mean: 0.0,
                std: 0.02,
            })
            .init(device),
            norm: BatchNormConfig::new(self.num_filters).init(device),
            dropout: self.dropout.map(|prob| DropoutConfig::new(prob).init()),
            activation: Relu::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn same_transposed_padding_doubles_size() {
        for kernel in 2..=5 {
            let (padding, padding_out) = same_transposed_padding(kernel);
            let input = 7;
            let output = (input - 1) * 2 + kernel + padding_out - 2 * padding;
            assert_eq!(output, 2 * input, "kernel {kernel}");
        }
    }

    #[test]
    fn upsample_block_doubles_spatial_size() {
        let device = Default::default();
        let block = UpsampleBlockConfig::new(8, 4).init::<TestBackend>(&device);

        let x = Tensor::<TestBackend, 4>::ones([2, 8, 4, 4], &device);
        let skip = Tensor::<TestBackend, 4>::zeros([2, 6, 8, 8], &device);

        assert_eq!(block.forward(x.clone()).dims(), [2, 4, 8, 8]);
        assert_eq!(block.forward_skip(x, skip).dims(), [2, 10, 8, 8]);
    }

    #[test]
    fn inverted_residual_taps() {
        let device = Default::default();
        let block = InvertedResidualConfig::new(8, 16, 2, 6).init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 4>::ones([1, 8, 8, 8], &device);

        let out = block.forward_with_taps(x);

        assert_eq!(out.expanded.dims(), [1, 48, 8, 8]);
        assert_eq!(out.projected.dims(), [1, 16, 4, 4]);
        assert_eq!(out.output.dims(), [1, 16, 4, 4]);
    }

    #[test]
    fn correct_pad_adds_the_extra_row_after_even_sides() {
        let device = Default::default();

        let even = correct_pad(Tensor::<TestBackend, 4>::ones([1, 1, 4, 4], &device), 3);
        assert_eq!(even.dims(), [1, 1, 5, 5]);
        let even = even.into_data().to_vec::<f32>().unwrap();
        assert_eq!(even[0], 1.0, "no padding before an even side");
        assert_eq!(&even[20..25], &[0.0; 5], "last row is padding");
        assert!((0..5).all(|row| even[row * 5 + 4] == 0.0), "last column is padding");

        let odd = correct_pad(Tensor::<TestBackend, 4>::ones([1, 1, 5, 5], &device), 3);
        assert_eq!(odd.dims(), [1, 1, 7, 7]);
        let odd = odd.into_data().to_vec::<f32>().unwrap();
        assert_eq!(&odd[0..7], &[0.0; 7]);
        assert_eq!(odd[8], 1.0);
    }

    #[test]
    fn strided_block_halves_even_and_odd_inputs() {
        let device = Default::default();
        let block = ConvNormBlockConfig::new(3, 4)
            .with_stride(2)
            .init::<TestBackend>(&device);

        let even = Tensor::<TestBackend, 4>::ones([1, 3, 32, 32], &device);
        let odd = Tensor::<TestBackend, 4>::ones([1, 3, 33, 33], &device);

        assert_eq!(block.forward(even).dims(), [1, 4, 16, 16]);
        assert_eq!(block.forward(odd).dims(), [1, 4, 17, 17]);
    }

    #[test]
    fn relu6_clamps_both_ends() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 1>::from_floats([-1.0, 3.0, 9.0], &device);
        let values = relu6(x).into_data().to_vec::<f32>().unwrap();

        assert_eq!(values, vec![0.0, 3.0, 6.0]);
    }
}
