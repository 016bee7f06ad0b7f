use std::ops::Range;
use std::path::Path;

use burn::{
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
};

use super::ModelError;
use super::blocks::{ConvNormBlock, ConvNormBlockConfig, InvertedResidual, InvertedResidualConfig};

/// Names of the encoder activations used as skip connections, fine to coarse.
pub const FEATURE_LAYERS: [&str; 5] = [
    "block_1_expand_relu",
    "block_3_expand_relu",
    "block_6_expand_relu",
    "block_13_expand_relu",
    "block_16_project",
];

/// Downsampling factor of the coarsest feature map.
pub const OUTPUT_STRIDE: usize = 32;

/// Inverted residual schedule: (expand ratio, channels, repeats, first stride).
const SCHEDULE: [(usize, usize, usize, usize); 7] = [
    (1, 16, 1, 1),
    (6, 24, 2, 2),
    (6, 32, 3, 2),
    (6, 64, 4, 2),
    (6, 96, 3, 1),
    (6, 160, 3, 2),
    (6, 320, 1, 1),
];

/// Multi-resolution activations produced by [MobileNetV2::forward_features].
#[derive(Debug, Clone)]
pub struct EncoderFeatures<B: Backend> {
    /// `[batch, 96·α, H/2, W/2]`
    pub block_1_expand: Tensor<B, 4>,
    /// `[batch, 144·α, H/4, W/4]`
    pub block_3_expand: Tensor<B, 4>,
    /// `[batch, 192·α, H/8, W/8]`
    pub block_6_expand: Tensor<B, 4>,
    /// `[batch, 576·α, H/16, W/16]`
    pub block_13_expand: Tensor<B, 4>,
    /// `[batch, 320·α, H/32, W/32]`
    pub block_16_project: Tensor<B, 4>,
}

impl<B: Backend> EncoderFeatures<B> {
    /// Split into the decoder's starting point (coarsest map) and the skip
    /// connections ordered coarse to fine.
    pub fn into_decoder_inputs(self) -> (Tensor<B, 4>, [Tensor<B, 4>; 4]) {
        (
            self.block_16_project,
            [
                self.block_13_expand,
                self.block_6_expand,
                self.block_3_expand,
                self.block_1_expand,
            ],
        )
    }

    pub fn map<B2: Backend>(self, f: impl Fn(Tensor<B, 4>) -> Tensor<B2, 4>) -> EncoderFeatures<B2> {
        EncoderFeatures {
            block_1_expand: f(self.block_1_expand),
            block_3_expand: f(self.block_3_expand),
            block_6_expand: f(self.block_6_expand),
            block_13_expand: f(self.block_13_expand),
            block_16_project: f(self.block_16_project),
        }
    }
}

/// MobileNetV2 backbone without its classification head, used as a frozen
/// feature extractor.
#[derive(Module, Debug)]
pub struct MobileNetV2<B: Backend> {
    stem: ConvNormBlock<B>,
    blocks: Vec<InvertedResidual<B>>,
}

#[derive(Config, Debug)]
pub struct MobileNetV2Config {
    #[config(default = "3")]
    pub input_channels: usize,
    /// Width multiplier applied to every layer.
    #[config(default = "1.0")]
    pub alpha: f64,
}

impl MobileNetV2Config {
    pub fn init<B: Backend>(&self, device: &B::Device) -> MobileNetV2<B> {
        let mut channels = make_divisible(32.0 * self.alpha, 8);
        let stem = ConvNormBlockConfig::new(self.input_channels, channels)
            .with_stride(2)
            .init(device);

        let mut blocks = Vec::with_capacity(17);
        for (expand_ratio, filters, repeats, stride) in SCHEDULE {
            let output_channels = make_divisible(filters as f64 * self.alpha, 8);
            for i in 0..repeats {
                let stride = if i == 0 { stride } else { 1 };
                blocks.push(
                    InvertedResidualConfig::new(channels, output_channels, stride, expand_ratio)
                        .init(device),
                );
                channels = output_channels;
            }
        }

        MobileNetV2 { stem, blocks }
    }

    /// Channel counts of the five feature maps, fine to coarse.
    pub fn feature_channels(&self) -> [usize; 5] {
        let channels = |filters: usize| make_divisible(filters as f64 * self.alpha, 8);

        [
            channels(16) * 6,
            channels(24) * 6,
            channels(32) * 6,
            channels(96) * 6,
            channels(320),
        ]
    }
}

impl<B: Backend> MobileNetV2<B> {
    pub fn forward_features(&self, images: Tensor<B, 4>) -> EncoderFeatures<B> {
        let x = self.stem.forward(images);
        let x = self.run(0..1, x);
        let (block_1_expand, x) = self.tap(1, x);
        let x = self.run(2..3, x);
        let (block_3_expand, x) = self.tap(3, x);
        let x = self.run(4..6, x);
        let (block_6_expand, x) = self.tap(6, x);
        let x = self.run(7..13, x);
        let (block_13_expand, x) = self.tap(13, x);
        let x = self.run(14..16, x);
        let block_16_project = self.blocks[16].forward_with_taps(x).projected;

        EncoderFeatures {
            block_1_expand,
            block_3_expand,
            block_6_expand,
            block_13_expand,
            block_16_project,
        }
    }

    /// Load pretrained weights from a named MessagePack record.
    pub fn load_pretrained<P: AsRef<Path>>(
        self,
        path: P,
        device: &B::Device,
    ) -> Result<Self, ModelError> {
        let path = path.as_ref();
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();

        self.load_file(path.to_path_buf(), &recorder, device)
            .map_err(|err| ModelError::Weights {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })
    }

    fn run(&self, range: Range<usize>, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.blocks[range]
            .iter()
            .fold(x, |x, block| block.forward(x))
    }

    fn tap(&self, index: usize, x: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let out = self.blocks[index].forward_with_taps(x);

        (out.expanded, out.output)
    }
}

/// Round a channel count to the nearest multiple of `divisor`, never going
/// more than 10% below the requested value.
pub fn make_divisible(value: f64, divisor: usize) -> usize {
    let divisor = divisor as f64;
    let mut rounded = (((value + divisor / 2.0) / divisor).floor() * divisor).max(divisor);
    if rounded < 0.9 * value {
        rounded += divisor;
    }

    rounded as usize
}
