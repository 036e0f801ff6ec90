use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d, ReLU,
    },
    tensor::{
        activation::{sigmoid, softmax},
        backend::Backend,
        Tensor,
    },
};

/// Two 3x3 convolutions, each followed by batch norm and ReLU.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv1: Conv2d<B>,
    batch_norm1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    batch_norm2: BatchNorm<B, 2>,
    activation: ReLU,
}

impl<B: Backend> ConvBlock<B> {
    fn new(channels_in: usize, channels_out: usize, device: &B::Device) -> Self {
        Self {
            conv1: Conv2dConfig::new([channels_in, channels_out], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device),
            batch_norm1: BatchNormConfig::new(channels_out).init(device),
            conv2: Conv2dConfig::new([channels_out, channels_out], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device),
            batch_norm2: BatchNormConfig::new(channels_out).init(device),
            activation: ReLU::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv1.forward(x);
        let x = self.batch_norm1.forward(x);
        let x = self.activation.forward(x);

        let x = self.conv2.forward(x);
        let x = self.batch_norm2.forward(x);
        self.activation.forward(x)
    }
}

/// Upsamples by two, concatenates the encoder skip and convolves.
#[derive(Module, Debug)]
pub struct UpBlock<B: Backend> {
    up: ConvTranspose2d<B>,
    block: ConvBlock<B>,
}

impl<B: Backend> UpBlock<B> {
    fn new(channels_in: usize, channels_out: usize, device: &B::Device) -> Self {
        Self {
            up: ConvTranspose2dConfig::new([channels_in, channels_out], [2, 2])
                .with_stride([2, 2])
                .init(device),
            block: ConvBlock::new(channels_out * 2, channels_out, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>, skip: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.up.forward(x);
        self.block.forward(Tensor::cat(vec![x, skip], 1))
    }
}

/// Four-level encoder/decoder with skip connections.
///
/// Input height and width must be multiples of 16.
#[derive(Module, Debug)]
pub struct UNet<B: Backend> {
    down1: ConvBlock<B>,
    down2: ConvBlock<B>,
    down3: ConvBlock<B>,
    down4: ConvBlock<B>,
    pool: MaxPool2d,
    bottleneck: ConvBlock<B>,
    up4: UpBlock<B>,
    up3: UpBlock<B>,
    up2: UpBlock<B>,
    up1: UpBlock<B>,
    head: Conv2d<B>,
}

#[derive(Config, Debug)]
pub struct UNetConfig {
    pub num_classes: usize,
    #[config(default = 3)]
    pub in_channels: usize,
    #[config(default = 16)]
    pub base_channels: usize,
}

impl UNetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> UNet<B> {
        let c = self.base_channels;
        UNet {
            down1: ConvBlock::new(self.in_channels, c, device),
            down2: ConvBlock::new(c, c * 2, device),
            down3: ConvBlock::new(c * 2, c * 4, device),
            down4: ConvBlock::new(c * 4, c * 8, device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            bottleneck: ConvBlock::new(c * 8, c * 16, device),
            up4: UpBlock::new(c * 16, c * 8, device),
            up3: UpBlock::new(c * 8, c * 4, device),
            up2: UpBlock::new(c * 4, c * 2, device),
            up1: UpBlock::new(c * 2, c, device),
            head: Conv2dConfig::new([c, self.num_classes], [1, 1]).init(device),
        }
    }

    pub fn init_with<B: Backend>(&self, record: UNetRecord<B>, device: &B::Device) -> UNet<B> {
        self.init(device).load_record(record)
    }
}

impl<B: Backend> UNet<B> {
    /// `[batch, channels, height, width]` images to per-class logits of the
    /// same spatial size.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        // encoder
        let d1 = self.down1.forward(images);
        let d2 = self.down2.forward(self.pool.forward(d1.clone()));
        let d3 = self.down3.forward(self.pool.forward(d2.clone()));
        let d4 = self.down4.forward(self.pool.forward(d3.clone()));

        let x = self.bottleneck.forward(self.pool.forward(d4.clone()));

        // decoder
        let x = self.up4.forward(x, d4);
        let x = self.up3.forward(x, d3);
        let x = self.up2.forward(x, d2);
        let x = self.up1.forward(x, d1);

        self.head.forward(x)
    }

    /// Class probabilities: sigmoid for a single class, softmax across
    /// classes otherwise.
    pub fn forward_probabilities(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        activate(self.forward(images))
    }
}

pub fn activate<B: Backend>(logits: Tensor<B, 4>) -> Tensor<B, 4> {
    let [_, classes, _, _] = logits.dims();
    if classes == 1 {
        sigmoid(logits)
    } else {
        softmax(logits, 1)
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;

    use super::*;

    type TestBackend = NdArray;

    #[test]
    fn output_keeps_spatial_size() {
        let device = Default::default();
        let model = UNetConfig::new(2).with_base_channels(4).init::<TestBackend>(&device);

        let images = Tensor::<TestBackend, 4>::zeros([2, 3, 32, 48], &device);
        assert_eq!(model.forward(images).dims(), [2, 2, 32, 48]);
    }

    #[test]
    fn single_class_probabilities_are_in_unit_range() {
        let device = Default::default();
        let model = UNetConfig::new(1).with_base_channels(4).init::<TestBackend>(&device);

        let images = Tensor::<TestBackend, 4>::ones([1, 3, 16, 16], &device);
        let values = model.forward_probabilities(images).into_data().convert::<f32>().value;
        assert_eq!(values.len(), 16 * 16);
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn softmax_sums_to_one_across_classes() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 4>::from_floats([[[[1.0, -2.0]], [[0.5, 3.0]], [[0.0, 0.0]]]], &device);

        let sums = activate(logits).sum_dim(1).into_data().convert::<f32>().value;
        for sum in sums {
            assert!((sum - 1.0).abs() < 1e-5);
        }
    }
}
