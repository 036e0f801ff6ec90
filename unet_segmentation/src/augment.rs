//! Augmentations and preprocessing for image/mask pairs.
//!
//! Images hold raw 0-255 values in `(height, width, 3)` layout until
//! [`Normalize`] runs. Geometric and filtering transforms round-trip through
//! 8-bit `image` buffers; the mask moves with the image one plane at a time,
//! sampled with nearest neighbour so class planes stay binary.
//! Photometric transforms only touch the image.

use derive_new::new;
use image::{imageops, GrayImage, Luma, Rgb, RgbImage};
use imageproc::{
    filter::filter3x3,
    geometric_transformations::{warp, Interpolation, Projection},
};
use ndarray::{s, Array3};
use rand::{rngs::ThreadRng, thread_rng, Rng};
use rand_distr::{Distribution, Normal};

use crate::{
    data::{array_to_image, image_to_array, SegmentationItem},
    error::{Result, SegmentationError},
    transform::{Compose, OneOf, Transform},
};

const MAX_PIXEL: f32 = 255.0;

fn coin(rng: &mut ThreadRng, p: f64) -> bool {
    rng.gen::<f64>() < p
}

fn uniform(rng: &mut ThreadRng, limit: f32) -> f32 {
    rng.gen_range(-limit..=limit)
}

fn clip_pixels(image: &mut Array3<f32>) {
    image.mapv_inplace(|v| v.clamp(0.0, MAX_PIXEL));
}

fn mask_planes(mask: &Array3<f32>) -> Vec<GrayImage> {
    let (height, width, channels) = mask.dim();
    (0..channels)
        .map(|c| {
            GrayImage::from_fn(width as u32, height as u32, |x, y| {
                Luma([mask[[y as usize, x as usize, c]].round().clamp(0.0, 1.0) as u8])
            })
        })
        .collect()
}

fn stack_planes(planes: &[GrayImage], height: usize, width: usize) -> Array3<f32> {
    Array3::from_shape_fn((height, width, planes.len()), |(y, x, c)| {
        planes[c].get_pixel(x as u32, y as u32).0[0] as f32
    })
}

/// Runs `image_op` on the 8-bit image and `plane_op` on every mask plane.
fn remap<F, G>(item: &SegmentationItem, image_op: F, plane_op: G) -> SegmentationItem
where
    F: Fn(&RgbImage) -> RgbImage,
    G: Fn(&GrayImage) -> GrayImage,
{
    let image = image_op(&array_to_image(&item.image));
    let planes: Vec<GrayImage> = mask_planes(&item.mask).iter().map(plane_op).collect();
    let (width, height) = image.dimensions();
    SegmentationItem::new(
        image_to_array(&image),
        stack_planes(&planes, height as usize, width as usize),
    )
}

/// Warps the image bilinearly and the mask with nearest neighbour. Pixels
/// mapped from outside the source are zero.
fn warp_item(item: &SegmentationItem, projection: &Projection) -> SegmentationItem {
    remap(
        item,
        |image| warp(image, projection, Interpolation::Bilinear, Rgb([0, 0, 0])),
        |plane| warp(plane, projection, Interpolation::Nearest, Luma([0])),
    )
}

/// Filters the image with a 3x3 kernel, replicating its borders.
fn filter_image(item: &mut SegmentationItem, kernel: &[f32; 9]) {
    let filtered: RgbImage = filter3x3::<_, f32, u8>(&array_to_image(&item.image), &kernel[..]);
    item.image = image_to_array(&filtered);
}

fn odd_kernel_size(rng: &mut ThreadRng, limit: usize) -> usize {
    let limit = limit.max(3);
    rng.gen_range(0..=(limit - 3) / 2) * 2 + 3
}

fn pad(array: &Array3<f32>, top: usize, bottom: usize, left: usize, right: usize) -> Array3<f32> {
    let (height, width, channels) = array.dim();
    let mut out = Array3::<f32>::zeros((height + top + bottom, width + left + right, channels));
    out.slice_mut(s![top..top + height, left..left + width, ..])
        .assign(array);
    out
}

#[derive(Debug, Clone, new)]
pub struct HorizontalFlip {
    p: f64,
}

impl Transform for HorizontalFlip {
    fn apply(&self, item: SegmentationItem) -> Result<SegmentationItem> {
        if !coin(&mut thread_rng(), self.p) {
            return Ok(item);
        }
        Ok(remap(&item, |image| imageops::flip_horizontal(image), |plane| imageops::flip_horizontal(plane)))
    }
}

/// Random zoom around the centre followed by a random translation, keeping
/// the output size. Uncovered pixels are zero.
#[derive(Debug, Clone, new)]
pub struct ShiftScale {
    scale_limit: f32,
    shift_limit: f32,
    p: f64,
}

impl Transform for ShiftScale {
    fn apply(&self, item: SegmentationItem) -> Result<SegmentationItem> {
        let mut rng = thread_rng();
        if !coin(&mut rng, self.p) {
            return Ok(item);
        }
        let (height, width, _) = item.image.dim();
        let scale = 1.0 + uniform(&mut rng, self.scale_limit);
        let dy = uniform(&mut rng, self.shift_limit) * height as f32;
        let dx = uniform(&mut rng, self.shift_limit) * width as f32;
        let (cy, cx) = ((height as f32 - 1.0) / 2.0, (width as f32 - 1.0) / 2.0);

        let projection = Projection::translate(-cx, -cy)
            .and_then(Projection::scale(scale, scale))
            .and_then(Projection::translate(cx + dx, cy + dy));
        Ok(warp_item(&item, &projection))
    }
}

/// Moves each corner inwards by a random fraction of the image size, drawn
/// from a normal distribution with a deviation in `scale`, then stretches
/// that quadrilateral back over the whole frame.
#[derive(Debug, Clone, new)]
pub struct Perspective {
    scale: (f32, f32),
    p: f64,
}

impl Transform for Perspective {
    fn apply(&self, item: SegmentationItem) -> Result<SegmentationItem> {
        let mut rng = thread_rng();
        if !coin(&mut rng, self.p) {
            return Ok(item);
        }
        let (height, width, _) = item.image.dim();
        let (w, h) = ((width as f32 - 1.0).max(0.0), (height as f32 - 1.0).max(0.0));
        let sigma = rng.gen_range(self.scale.0..=self.scale.1);
        let jitter = Normal::new(0.0, sigma).map_err(|err| SegmentationError::InvalidConfig(err.to_string()))?;
        let mut inset = |extent: f32| jitter.sample(&mut rng).abs().min(0.45) * extent;

        let corners = [(0.0, 0.0), (w, 0.0), (w, h), (0.0, h)];
        let quad = [
            (inset(w), inset(h)),
            (w - inset(w), inset(h)),
            (w - inset(w), h - inset(h)),
            (inset(w), h - inset(h)),
        ];
        match Projection::from_control_points(quad, corners) {
            Some(projection) => Ok(warp_item(&item, &projection)),
            None => Ok(item),
        }
    }
}

/// Zero-pads both arrays, centred, up to at least the given size.
#[derive(Debug, Clone, new)]
pub struct PadIfNeeded {
    min_height: usize,
    min_width: usize,
}

impl Transform for PadIfNeeded {
    fn apply(&self, item: SegmentationItem) -> Result<SegmentationItem> {
        let (height, width, _) = item.image.dim();
        if height >= self.min_height && width >= self.min_width {
            return Ok(item);
        }
        let pad_h = self.min_height.saturating_sub(height);
        let pad_w = self.min_width.saturating_sub(width);
        let (top, left) = (pad_h / 2, pad_w / 2);
        let (bottom, right) = (pad_h - top, pad_w - left);

        Ok(SegmentationItem::new(
            pad(&item.image, top, bottom, left, right),
            pad(&item.mask, top, bottom, left, right),
        ))
    }
}

#[derive(Debug, Clone, new)]
pub struct RandomCrop {
    height: usize,
    width: usize,
}

impl Transform for RandomCrop {
    fn apply(&self, item: SegmentationItem) -> Result<SegmentationItem> {
        let (height, width, _) = item.image.dim();
        if height < self.height || width < self.width {
            return Err(SegmentationError::ShapeMismatch(format!(
                "cannot crop {}x{} out of {}x{}",
                self.height, self.width, height, width
            )));
        }
        let mut rng = thread_rng();
        let y0 = rng.gen_range(0..=height - self.height);
        let x0 = rng.gen_range(0..=width - self.width);
        let (y1, x1) = (y0 + self.height, x0 + self.width);

        Ok(SegmentationItem::new(
            item.image.slice(s![y0..y1, x0..x1, ..]).to_owned(),
            item.mask.slice(s![y0..y1, x0..x1, ..]).to_owned(),
        ))
    }
}

/// Additive gaussian noise with a variance drawn from `var_limit`.
#[derive(Debug, Clone, new)]
pub struct GaussianNoise {
    var_limit: (f32, f32),
    p: f64,
}

impl Transform for GaussianNoise {
    fn apply(&self, mut item: SegmentationItem) -> Result<SegmentationItem> {
        let mut rng = thread_rng();
        if !coin(&mut rng, self.p) {
            return Ok(item);
        }
        let sigma = rng.gen_range(self.var_limit.0..=self.var_limit.1).sqrt();
        let noise = Normal::new(0.0, sigma).map_err(|err| SegmentationError::InvalidConfig(err.to_string()))?;
        item.image.mapv_inplace(|v| v + noise.sample(&mut rng));
        clip_pixels(&mut item.image);
        Ok(item)
    }
}

#[derive(Debug, Clone, new)]
pub struct RandomBrightness {
    limit: f32,
}

impl Transform for RandomBrightness {
    fn apply(&self, mut item: SegmentationItem) -> Result<SegmentationItem> {
        let beta = uniform(&mut thread_rng(), self.limit) * MAX_PIXEL;
        item.image.mapv_inplace(|v| v + beta);
        clip_pixels(&mut item.image);
        Ok(item)
    }
}

#[derive(Debug, Clone, new)]
pub struct RandomContrast {
    limit: f32,
}

impl Transform for RandomContrast {
    fn apply(&self, mut item: SegmentationItem) -> Result<SegmentationItem> {
        let alpha = 1.0 + uniform(&mut thread_rng(), self.limit);
        item.image.mapv_inplace(|v| v * alpha);
        clip_pixels(&mut item.image);
        Ok(item)
    }
}

/// Gamma correction with gamma drawn from `gamma_limit / 100`.
#[derive(Debug, Clone, new)]
pub struct RandomGamma {
    gamma_limit: (f32, f32),
}

impl Transform for RandomGamma {
    fn apply(&self, mut item: SegmentationItem) -> Result<SegmentationItem> {
        let gamma = thread_rng().gen_range(self.gamma_limit.0..=self.gamma_limit.1) / 100.0;
        item.image
            .mapv_inplace(|v| MAX_PIXEL * (v.max(0.0) / MAX_PIXEL).powf(gamma));
        Ok(item)
    }
}

/// Stretches each channel to the full 0-255 range.
#[derive(Debug, Clone, Default)]
pub struct AutoContrast;

impl Transform for AutoContrast {
    fn apply(&self, mut item: SegmentationItem) -> Result<SegmentationItem> {
        let channels = item.image.dim().2;
        for c in 0..channels {
            let mut plane = item.image.slice_mut(s![.., .., c]);
            let lo = plane.fold(f32::INFINITY, |acc, v| acc.min(*v));
            let hi = plane.fold(f32::NEG_INFINITY, |acc, v| acc.max(*v));
            if hi - lo <= f32::EPSILON {
                continue;
            }
            plane.mapv_inplace(|v| (v - lo) / (hi - lo) * MAX_PIXEL);
        }
        Ok(item)
    }
}

/// Gaussian blur whose sigma matches a random odd kernel size up to
/// `blur_limit`.
#[derive(Debug, Clone, new)]
pub struct Blur {
    blur_limit: usize,
}

impl Transform for Blur {
    fn apply(&self, mut item: SegmentationItem) -> Result<SegmentationItem> {
        let size = odd_kernel_size(&mut thread_rng(), self.blur_limit);
        // OpenCV's sigma for a kernel of this size
        let sigma = 0.3 * ((size as f32 - 1.0) * 0.5 - 1.0) + 0.8;
        let blurred = imageops::blur(&array_to_image(&item.image), sigma);
        item.image = image_to_array(&blurred);
        Ok(item)
    }
}

/// Averages along a random 3-pixel line: horizontal, vertical or diagonal.
#[derive(Debug, Clone, Default)]
pub struct MotionBlur;

impl Transform for MotionBlur {
    fn apply(&self, mut item: SegmentationItem) -> Result<SegmentationItem> {
        const W: f32 = 1.0 / 3.0;
        let lines: [[f32; 9]; 4] = [
            [0.0, 0.0, 0.0, W, W, W, 0.0, 0.0, 0.0],
            [0.0, W, 0.0, 0.0, W, 0.0, 0.0, W, 0.0],
            [W, 0.0, 0.0, 0.0, W, 0.0, 0.0, 0.0, W],
            [0.0, 0.0, W, 0.0, W, 0.0, W, 0.0, 0.0],
        ];
        let kernel = lines[thread_rng().gen_range(0..lines.len())];
        filter_image(&mut item, &kernel);
        Ok(item)
    }
}

/// Blends the identity kernel with a sharpening one, `alpha` drawn from the
/// range.
#[derive(Debug, Clone, new)]
pub struct Sharpen {
    alpha: (f32, f32),
}

impl Transform for Sharpen {
    fn apply(&self, mut item: SegmentationItem) -> Result<SegmentationItem> {
        let alpha = thread_rng().gen_range(self.alpha.0..=self.alpha.1);
        let mut kernel = [-alpha; 9];
        kernel[4] = 1.0 + 8.0 * alpha;
        filter_image(&mut item, &kernel);
        Ok(item)
    }
}

/// Random hue rotation in degrees, with saturation and value shifts in 0-255
/// units.
#[derive(Debug, Clone, new)]
pub struct HueSaturationValue {
    hue_shift: f32,
    sat_shift: f32,
    val_shift: f32,
}

impl Transform for HueSaturationValue {
    fn apply(&self, mut item: SegmentationItem) -> Result<SegmentationItem> {
        let mut rng = thread_rng();
        let hue = uniform(&mut rng, self.hue_shift).round() as i32;
        let saturation = 1.0 + uniform(&mut rng, self.sat_shift) / MAX_PIXEL;
        let value = uniform(&mut rng, self.val_shift).round() as i32;

        let rotated = imageops::huerotate(&array_to_image(&item.image), hue);
        let gray = imageops::grayscale(&rotated);
        let saturated = RgbImage::from_fn(rotated.width(), rotated.height(), |x, y| {
            let luma = gray.get_pixel(x, y).0[0] as f32;
            let Rgb(channels) = *rotated.get_pixel(x, y);
            Rgb(channels.map(|v| (luma + (v as f32 - luma) * saturation).round().clamp(0.0, MAX_PIXEL) as u8))
        });
        item.image = image_to_array(&imageops::brighten(&saturated, value));
        Ok(item)
    }
}

/// Rounds mask values and clips them to `[0, 1]`.
#[derive(Debug, Clone, Default)]
pub struct RoundClipMask;

impl Transform for RoundClipMask {
    fn apply(&self, mut item: SegmentationItem) -> Result<SegmentationItem> {
        item.mask.mapv_inplace(|v| v.round().clamp(0.0, 1.0));
        Ok(item)
    }
}

/// Scales pixels to `[0, 1]` then standardises each channel.
#[derive(Debug, Clone, new)]
pub struct Normalize {
    mean: [f32; 3],
    std: [f32; 3],
}

impl Normalize {
    /// ImageNet statistics used by the pretrained encoders.
    pub fn imagenet() -> Self {
        Self::new([0.485, 0.456, 0.406], [0.229, 0.224, 0.225])
    }
}

impl Transform for Normalize {
    fn apply(&self, mut item: SegmentationItem) -> Result<SegmentationItem> {
        for ((_, _, c), v) in item.image.indexed_iter_mut() {
            let c = c.min(2);
            *v = (*v / MAX_PIXEL - self.mean[c]) / self.std[c];
        }
        Ok(item)
    }
}

/// Heavy augmentation for training; every output is `min_size` square.
pub fn training_augmentation(min_size: usize) -> Compose {
    Compose::default()
        .then(HorizontalFlip::new(0.5))
        .then(ShiftScale::new(0.5, 0.1, 1.0))
        .then(PadIfNeeded::new(min_size, min_size))
        .then(RandomCrop::new(min_size, min_size))
        .then(GaussianNoise::new((10.0, 50.0), 0.2))
        .then(Perspective::new((0.05, 0.1), 0.5))
        .then(OneOf::new(
            vec![
                Box::new(AutoContrast),
                Box::new(RandomBrightness::new(0.2)),
                Box::new(RandomGamma::new((80.0, 120.0))),
            ],
            0.9,
        ))
        .then(OneOf::new(
            vec![
                Box::new(Sharpen::new((0.2, 0.5))),
                Box::new(Blur::new(3)),
                Box::new(MotionBlur),
            ],
            0.9,
        ))
        .then(OneOf::new(
            vec![
                Box::new(RandomContrast::new(0.2)),
                Box::new(HueSaturationValue::new(20.0, 30.0, 20.0)),
            ],
            0.9,
        ))
        .then(RoundClipMask)
}

/// Pads both sides up to the next multiple of 32, as the encoder downsamples
/// five times.
pub fn validation_augmentation(width: usize, height: usize) -> Compose {
    let round_up = |v: usize| v.div_ceil(32) * 32;
    Compose::default().then(PadIfNeeded::new(round_up(height), round_up(width)))
}

pub fn preprocessing() -> Compose {
    Compose::default().then(Normalize::imagenet())
}
