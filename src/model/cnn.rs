//! CNN architecture for food classification
//!
//! Four Conv-BatchNorm-ReLU-MaxPool blocks, global average pooling and a
//! two-layer classifier head with dropout.

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d,
        Relu,
    },
    tensor::{backend::Backend, Tensor},
};

/// Smallest input side the four pooling stages can reduce to 1x1
pub const MIN_INPUT_SIZE: usize = 16;

/// Configuration for the FoodClassifier CNN
#[derive(Config, Debug)]
pub struct FoodClassifierConfig {
    /// Number of output classes
    pub num_classes: usize,

    /// Input image size (square)
    #[config(default = "224")]
    pub input_size: usize,

    /// Dropout rate in the classifier head
    #[config(default = "0.3")]
    pub dropout_rate: f64,

    /// Filters in the first block; doubled by each following block
    #[config(default = "16")]
    pub base_filters: usize,

    /// Width of the hidden linear layer
    #[config(default = "128")]
    pub hidden_size: usize,
}

impl FoodClassifierConfig {
    /// Build the model on `device`
    pub fn init<B: Backend>(&self, device: &B::Device) -> FoodClassifier<B> {
        FoodClassifier::new(self, device)
    }
}

/// Conv2d + BatchNorm + ReLU + 2x2 MaxPool
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
    relu: Relu,
    pool: MaxPool2d,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        let conv = Conv2dConfig::new([in_channels, out_channels], [3, 3])
            .with_padding(PaddingConfig2d::Same)
            .init(device);

        Self {
            conv,
            bn: BatchNormConfig::new(out_channels).init(device),
            relu: Relu::new(),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.bn.forward(x);
        let x = self.relu.forward(x);
        self.pool.forward(x)
    }
}

/// Food category classifier
#[derive(Module, Debug)]
pub struct FoodClassifier<B: Backend> {
    blocks: Vec<ConvBlock<B>>,
    global_pool: AdaptiveAvgPool2d,
    fc1: Linear<B>,
    relu: Relu,
    dropout: Dropout,
    fc2: Linear<B>,
}

impl<B: Backend> FoodClassifier<B> {
    pub fn new(config: &FoodClassifierConfig, device: &B::Device) -> Self {
        let base = config.base_filters.max(1);

        // 3 -> b -> 2b -> 4b -> 8b, each block halves the spatial size
        let channels = [3, base, base * 2, base * 4, base * 8];
        let blocks = channels
            .windows(2)
            .map(|pair| ConvBlock::new(pair[0], pair[1], device))
            .collect();

        Self {
            blocks,
            global_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc1: LinearConfig::new(base * 8, config.hidden_size).init(device),
            relu: Relu::new(),
            dropout: DropoutConfig::new(config.dropout_rate).init(),
            fc2: LinearConfig::new(config.hidden_size, config.num_classes).init(device),
        }
    }

    /// Logits of shape `[batch, num_classes]` for input `[batch, 3, h, w]`
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.blocks.iter().fold(x, |x, block| block.forward(x));

        let x = self.global_pool.forward(x);
        let x = x.flatten::<2>(1, 3);

        let x = self.fc1.forward(x);
        let x = self.relu.forward(x);
        let x = self.dropout.forward(x);
        self.fc2.forward(x)
    }

    /// Class probabilities
    pub fn forward_softmax(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        burn::tensor::activation::softmax(self.forward(x), 1)
    }
}
