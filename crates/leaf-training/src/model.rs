//! Classifier backbone and head adaptation.
//!
//! Implements:
//! - MobileNetV3-Small (ImageNet layout, 1000-class head by default)
//! - `Classifier` / `BackboneProvider` capabilities used by the training loop
//! - Head replacement for a custom class set
//!
//! Every layer is a public field so the exporter can walk the network.

use std::path::PathBuf;

use burn::{
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d,
    },
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::{activation, backend::Backend, Tensor},
};
use leaf_core::{Error, ModelConfig, Result};
use tracing::info;

/// Number of ImageNet classes of the pretrained network
pub const IMAGENET_CLASSES: usize = 1000;
/// Batch-norm epsilon of the reference MobileNetV3 weights
pub const BN_EPSILON: f64 = 1e-3;

/// `HardSigmoid` slope; the offset is 0.5
pub const HARD_SIGMOID_ALPHA: f64 = 1.0 / 6.0;
pub const HARD_SIGMOID_BETA: f64 = 0.5;

/// A network whose last layer is a replaceable linear projection.
pub trait Classifier<B: Backend>: Module<B> + Sized {
    /// `[batch, 3, S, S]` images to `[batch, num_classes]` logits
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;

    /// The final projection
    fn head(&self) -> &Linear<B>;

    /// Swaps the final projection, leaving every other layer untouched.
    fn replace_head(self, head: Linear<B>) -> Self;

    fn num_classes(&self) -> usize {
        self.head().weight.val().dims()[1]
    }
}

/// Builds a backbone network, optionally with pretrained weights.
pub trait BackboneProvider<B: Backend> {
    type Network: Classifier<B>;

    fn provide(&self, device: &B::Device) -> Result<Self::Network>;
}

/// Replaces the head of `network` with a fresh `Linear(in_features, num_classes)`.
pub fn adapt_classifier<B: Backend, C: Classifier<B>>(
    network: C,
    num_classes: usize,
    device: &B::Device,
) -> C {
    let in_features = network.head().weight.val().dims()[0];
    let head = LinearConfig::new(in_features, num_classes).init(device);
    network.replace_head(head)
}

/// Provides [`MobileNetV3Small`] with the ImageNet head.
#[derive(Debug, Clone)]
pub struct MobileNetV3Provider {
    pub pretrained: bool,
    pub weights: Option<PathBuf>,
    pub dropout: f64,
}

impl MobileNetV3Provider {
    pub fn from_config(config: &ModelConfig) -> Self {
        Self {
            pretrained: config.pretrained,
            weights: config.pretrained_weights.clone(),
            dropout: config.dropout,
        }
    }
}

impl<B: Backend> BackboneProvider<B> for MobileNetV3Provider {
    type Network = MobileNetV3Small<B>;

    fn provide(&self, device: &B::Device) -> Result<Self::Network> {
        let network = MobileNetV3Small::new(IMAGENET_CLASSES, self.dropout, device);
        if !self.pretrained {
            return Ok(network);
        }

        let path = self.weights.as_ref().ok_or_else(|| {
            Error::Config("pretrained weights requested but no weights file configured".into())
        })?;
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        let network = network
            .load_file(path.clone(), &recorder, device)
            .map_err(|e| {
                Error::Model(format!(
                    "Failed to load pretrained weights {}: {e:?}",
                    path.display()
                ))
            })?;
        info!("Loaded pretrained backbone from {}", path.display());
        Ok(network)
    }
}

/// Builds the backbone and adapts its head to `num_classes`.
pub fn create_model<B: Backend>(
    config: &ModelConfig,
    num_classes: usize,
    device: &B::Device,
) -> Result<MobileNetV3Small<B>> {
    let backbone = MobileNetV3Provider::from_config(config).provide(device)?;
    Ok(adapt_classifier(backbone, num_classes, device))
}

/// `x * HardSigmoid(x)`
pub fn hard_swish<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    x.clone() * activation::hard_sigmoid(x, HARD_SIGMOID_ALPHA, HARD_SIGMOID_BETA)
}

/// Bias-free convolution followed by batch norm
#[derive(Module, Debug)]
pub struct ConvBn<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B, 2>,
}

impl<B: Backend> ConvBn<B> {
    pub fn new(
        channels: [usize; 2],
        kernel: usize,
        stride: usize,
        groups: usize,
        device: &B::Device,
    ) -> Self {
        let padding = (kernel - 1) / 2;
        let conv = Conv2dConfig::new(channels, [kernel, kernel])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .with_groups(groups)
            .with_bias(false)
            .init(device);
        let bn = BatchNormConfig::new(channels[1])
            .with_epsilon(BN_EPSILON)
            .init(device);
        Self { conv, bn }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.bn.forward(self.conv.forward(x))
    }
}

/// Channel attention: global pool, squeeze, ReLU, excite, hard sigmoid, rescale
#[derive(Module, Debug)]
pub struct SqueezeExcitation<B: Backend> {
    pub pool: AdaptiveAvgPool2d,
    pub reduce: Conv2d<B>,
    pub expand: Conv2d<B>,
}

impl<B: Backend> SqueezeExcitation<B> {
    pub fn new(channels: usize, squeeze: usize, device: &B::Device) -> Self {
        Self {
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            reduce: Conv2dConfig::new([channels, squeeze], [1, 1]).init(device),
            expand: Conv2dConfig::new([squeeze, channels], [1, 1]).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let scale = self.pool.forward(x.clone());
        let scale = activation::relu(self.reduce.forward(scale));
        let scale = activation::hard_sigmoid(
            self.expand.forward(scale),
            HARD_SIGMOID_ALPHA,
            HARD_SIGMOID_BETA,
        );
        x * scale
    }
}

/// One MobileNetV3 bottleneck
#[derive(Module, Debug)]
pub struct InvertedResidual<B: Backend> {
    /// 1x1 expansion, absent when the expanded width equals the input width
    pub expand: Option<ConvBn<B>>,
    pub depthwise: ConvBn<B>,
    pub se: Option<SqueezeExcitation<B>>,
    pub project: ConvBn<B>,
    /// Hard-swish instead of ReLU after expansion and depthwise convolutions
    pub hard_swish: bool,
    pub use_residual: bool,
}

impl<B: Backend> InvertedResidual<B> {
    fn new(in_channels: usize, spec: &BlockSpec, device: &B::Device) -> Self {
        let expand = (spec.expanded != in_channels)
            .then(|| ConvBn::new([in_channels, spec.expanded], 1, 1, 1, device));
        let depthwise = ConvBn::new(
            [spec.expanded, spec.expanded],
            spec.kernel,
            spec.stride,
            spec.expanded,
            device,
        );
        let se = spec.squeeze_excite.then(|| {
            SqueezeExcitation::new(spec.expanded, make_divisible(spec.expanded / 4, 8), device)
        });
        let project = ConvBn::new([spec.expanded, spec.out_channels], 1, 1, 1, device);

        Self {
            expand,
            depthwise,
            se,
            project,
            hard_swish: spec.hard_swish,
            use_residual: spec.stride == 1 && in_channels == spec.out_channels,
        }
    }

    fn activate(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        if self.hard_swish {
            hard_swish(x)
        } else {
            activation::relu(x)
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = input.clone();
        if let Some(expand) = &self.expand {
            x = self.activate(expand.forward(x));
        }
        x = self.activate(self.depthwise.forward(x));
        if let Some(se) = &self.se {
            x = se.forward(x);
        }
        x = self.project.forward(x);

        if self.use_residual {
            x + input
        } else {
            x
        }
    }
}

/// Static description of one bottleneck
#[derive(Debug, Clone, Copy)]
pub struct BlockSpec {
    pub kernel: usize,
    pub expanded: usize,
    pub out_channels: usize,
    pub squeeze_excite: bool,
    pub hard_swish: bool,
    pub stride: usize,
}

const fn block(
    kernel: usize,
    expanded: usize,
    out_channels: usize,
    squeeze_excite: bool,
    hard_swish: bool,
    stride: usize,
) -> BlockSpec {
    BlockSpec {
        kernel,
        expanded,
        out_channels,
        squeeze_excite,
        hard_swish,
        stride,
    }
}

/// MobileNetV3-Small bottleneck table
pub const MOBILENET_V3_SMALL_BLOCKS: [BlockSpec; 11] = [
    block(3, 16, 16, true, false, 2),
    block(3, 72, 24, false, false, 2),
    block(3, 88, 24, false, false, 1),
    block(5, 96, 40, true, true, 2),
    block(5, 240, 40, true, true, 1),
    block(5, 240, 40, true, true, 1),
    block(5, 120, 48, true, true, 1),
    block(5, 144, 48, true, true, 1),
    block(5, 288, 96, true, true, 2),
    block(5, 576, 96, true, true, 1),
    block(5, 576, 96, true, true, 1),
];

const STEM_CHANNELS: usize = 16;
const LAST_CONV_CHANNELS: usize = 576;
const HIDDEN_FEATURES: usize = 1024;

/// Rounds `value` to a multiple of `divisor`, never dropping more than 10%.
pub fn make_divisible(value: usize, divisor: usize) -> usize {
    let rounded = ((value + divisor / 2) / divisor * divisor).max(divisor);
    if (rounded as f64) < 0.9 * value as f64 {
        rounded + divisor
    } else {
        rounded
    }
}

/// MobileNetV3-Small
///
/// Lightweight architecture suitable for embedded deployment.
/// - Input: `3 x S x S`
/// - Stem: Conv 3x3 stride 2, hard-swish
/// - 11 inverted residual blocks, some with squeeze-excitation
/// - 1x1 conv to 576, global average pooling
/// - Classifier: 576 -> 1024 (hard-swish, dropout) -> num_classes
#[derive(Module, Debug)]
pub struct MobileNetV3Small<B: Backend> {
    pub stem: ConvBn<B>,
    pub blocks: Vec<InvertedResidual<B>>,
    pub last_conv: ConvBn<B>,
    pub pool: AdaptiveAvgPool2d,
    pub pre_classifier: Linear<B>,
    pub dropout: Dropout,
    pub classifier: Linear<B>,
}

impl<B: Backend> MobileNetV3Small<B> {
    pub fn new(num_classes: usize, dropout: f64, device: &B::Device) -> Self {
        let stem = ConvBn::new([3, STEM_CHANNELS], 3, 2, 1, device);

        let mut in_channels = STEM_CHANNELS;
        let mut blocks = Vec::with_capacity(MOBILENET_V3_SMALL_BLOCKS.len());
        for spec in &MOBILENET_V3_SMALL_BLOCKS {
            blocks.push(InvertedResidual::new(in_channels, spec, device));
            in_channels = spec.out_channels;
        }

        let last_conv = ConvBn::new([in_channels, LAST_CONV_CHANNELS], 1, 1, 1, device);

        Self {
            stem,
            blocks,
            last_conv,
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            pre_classifier: LinearConfig::new(LAST_CONV_CHANNELS, HIDDEN_FEATURES).init(device),
            dropout: DropoutConfig::new(dropout).init(),
            classifier: LinearConfig::new(HIDDEN_FEATURES, num_classes).init(device),
        }
    }

    /// Pooled `[batch, 576]` features
    pub fn features(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = hard_swish(self.stem.forward(input));
        for block in &self.blocks {
            x = block.forward(x);
        }
        let x = hard_swish(self.last_conv.forward(x));
        let x = self.pool.forward(x);
        let [batch, channels, _, _] = x.dims();
        x.reshape([batch, channels])
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = hard_swish(self.pre_classifier.forward(self.features(input)));
        let x = self.dropout.forward(x);
        self.classifier.forward(x)
    }
}

impl<B: Backend> Classifier<B> for MobileNetV3Small<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        MobileNetV3Small::forward(self, images)
    }

    fn head(&self) -> &Linear<B> {
        &self.classifier
    }

    fn replace_head(mut self, head: Linear<B>) -> Self {
        self.classifier = head;
        self
    }
}
