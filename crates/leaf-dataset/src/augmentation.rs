//! Train and eval transform policies for leaf images.
//!
//! A policy maps a decoded image to a normalized `3 x S x S` tensor in CHW
//! order. The train policy is stochastic and draws all randomness from the
//! generator it is given; the eval policy is a fixed resize + normalize.

use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageBuffer, Rgb, RgbImage};
use rand::Rng;

/// ImageNet channel means used by the pretrained backbone
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNet channel standard deviations
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Parameters of the train-time augmentation
#[derive(Debug, Clone, PartialEq)]
pub struct AugmentationConfig {
    /// Output side length S
    pub image_size: u32,
    /// Images are resized to `S + resize_margin` before the random crop
    pub resize_margin: u32,
    pub horizontal_flip_p: f64,
    pub vertical_flip_p: f64,
    /// Maximum absolute rotation in degrees
    pub rotation_degrees: f32,
    pub brightness_range: (f32, f32),
    pub contrast_range: (f32, f32),
    pub saturation_range: (f32, f32),
    /// Maximum absolute hue shift, as a fraction of a full turn
    pub hue_shift: f32,
    /// Maximum translation, as a fraction of the image extent per axis
    pub translate_fraction: f32,
    pub scale_range: (f32, f32),
}

impl AugmentationConfig {
    pub fn new(image_size: u32) -> Self {
        Self {
            image_size,
            resize_margin: 32,
            horizontal_flip_p: 0.5,
            vertical_flip_p: 0.5,
            rotation_degrees: 30.0,
            brightness_range: (0.7, 1.3),
            contrast_range: (0.7, 1.3),
            saturation_range: (0.7, 1.3),
            hue_shift: 0.1,
            translate_fraction: 0.1,
            scale_range: (0.9, 1.1),
        }
    }
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self::new(224)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformMode {
    Train,
    Eval,
}

/// Image to tensor transform
#[derive(Debug, Clone)]
pub struct AugmentationPolicy {
    config: AugmentationConfig,
    mode: TransformMode,
}

impl AugmentationPolicy {
    pub fn train(config: AugmentationConfig) -> Self {
        Self {
            config,
            mode: TransformMode::Train,
        }
    }

    pub fn eval(config: AugmentationConfig) -> Self {
        Self {
            config,
            mode: TransformMode::Eval,
        }
    }

    /// Builds the train and eval policies for a target size.
    pub fn transforms(image_size: u32) -> (Self, Self) {
        let config = AugmentationConfig::new(image_size);
        (Self::train(config.clone()), Self::eval(config))
    }

    pub fn mode(&self) -> TransformMode {
        self.mode
    }

    pub fn image_size(&self) -> usize {
        self.config.image_size as usize
    }

    /// Shape of every tensor produced by [`apply`](Self::apply)
    pub fn output_shape(&self) -> [usize; 3] {
        let size = self.image_size();
        [3, size, size]
    }

    /// Transforms `image` into normalized CHW values.
    ///
    /// `rng` is only consulted in train mode.
    pub fn apply<R: Rng + ?Sized>(&self, image: &DynamicImage, rng: &mut R) -> Vec<f32> {
        let rgb = image.to_rgb8();
        let prepared = match self.mode {
            TransformMode::Eval => {
                let size = self.config.image_size;
                imageops::resize(&rgb, size, size, FilterType::Triangle)
            }
            TransformMode::Train => self.augment(&rgb, rng),
        };
        to_normalized_chw(&prepared)
    }

    fn augment<R: Rng + ?Sized>(&self, rgb: &RgbImage, rng: &mut R) -> RgbImage {
        let cfg = &self.config;
        let size = cfg.image_size;
        let resized_side = size + cfg.resize_margin;
        let resized = imageops::resize(rgb, resized_side, resized_side, FilterType::Triangle);

        let x = rng.gen_range(0..=cfg.resize_margin);
        let y = rng.gen_range(0..=cfg.resize_margin);
        let mut img = imageops::crop_imm(&resized, x, y, size, size).to_image();

        if rng.gen_bool(cfg.horizontal_flip_p) {
            imageops::flip_horizontal_in_place(&mut img);
        }
        if rng.gen_bool(cfg.vertical_flip_p) {
            imageops::flip_vertical_in_place(&mut img);
        }

        let angle = rng.gen_range(-cfg.rotation_degrees..=cfg.rotation_degrees);
        img = rotate(&img, angle);

        let brightness = sample_factor(rng, cfg.brightness_range);
        let contrast = sample_factor(rng, cfg.contrast_range);
        let saturation = sample_factor(rng, cfg.saturation_range);
        let hue = rng.gen_range(-cfg.hue_shift..=cfg.hue_shift);
        adjust_brightness(&mut img, brightness);
        adjust_contrast(&mut img, contrast);
        adjust_saturation(&mut img, saturation);
        shift_hue(&mut img, hue);

        let max_dx = cfg.translate_fraction * size as f32;
        let max_dy = cfg.translate_fraction * size as f32;
        let dx = rng.gen_range(-max_dx..=max_dx).round();
        let dy = rng.gen_range(-max_dy..=max_dy).round();
        let scale = sample_factor(rng, cfg.scale_range);
        translate_and_scale(&img, dx, dy, scale)
    }
}

fn sample_factor<R: Rng + ?Sized>(rng: &mut R, (lo, hi): (f32, f32)) -> f32 {
    if lo >= hi {
        lo
    } else {
        rng.gen_range(lo..=hi)
    }
}

/// Converts to `[C, H, W]` floats in `[0, 1]`, then applies ImageNet normalization.
pub fn to_normalized_chw(img: &RgbImage) -> Vec<f32> {
    let (width, height) = img.dimensions();
    let plane = (width * height) as usize;
    let mut data = vec![0.0f32; 3 * plane];

    for (x, y, pixel) in img.enumerate_pixels() {
        let offset = (y * width + x) as usize;
        for c in 0..3 {
            let value = pixel[c] as f32 / 255.0;
            data[c * plane + offset] = (value - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
        }
    }

    data
}

/// Resamples `img` through an inverse mapping from output to source coordinates.
/// Source positions outside the image become black.
fn warp<F>(img: &RgbImage, inverse: F) -> RgbImage
where
    F: Fn(f32, f32) -> (f32, f32),
{
    let (width, height) = img.dimensions();
    ImageBuffer::from_fn(width, height, |x, y| {
        let (sx, sy) = inverse(x as f32, y as f32);
        sample_bilinear(img, sx, sy)
    })
}

fn sample_bilinear(img: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (width, height) = img.dimensions();
    let max_x = (width - 1) as f32;
    let max_y = (height - 1) as f32;
    if !(x >= 0.0 && y >= 0.0 && x <= max_x && y <= max_y) {
        return Rgb([0, 0, 0]);
    }

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = img.get_pixel(x0, y0);
    let p10 = img.get_pixel(x1, y0);
    let p01 = img.get_pixel(x0, y1);
    let p11 = img.get_pixel(x1, y1);

    let mut out = [0u8; 3];
    for c in 0..3 {
        let top = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
        let bottom = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
        out[c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

/// Rotates counter-clockwise by `degrees` around the image centre.
fn rotate(img: &RgbImage, degrees: f32) -> RgbImage {
    if degrees == 0.0 {
        return img.clone();
    }
    let (width, height) = img.dimensions();
    let cx = (width as f32 - 1.0) / 2.0;
    let cy = (height as f32 - 1.0) / 2.0;
    let (sin, cos) = degrees.to_radians().sin_cos();

    warp(img, |x, y| {
        let dx = x - cx;
        let dy = y - cy;
        (cx + cos * dx - sin * dy, cy + sin * dx + cos * dy)
    })
}

/// Scales around the centre, then shifts by `(dx, dy)` pixels.
fn translate_and_scale(img: &RgbImage, dx: f32, dy: f32, scale: f32) -> RgbImage {
    if dx == 0.0 && dy == 0.0 && scale == 1.0 {
        return img.clone();
    }
    let (width, height) = img.dimensions();
    let cx = (width as f32 - 1.0) / 2.0;
    let cy = (height as f32 - 1.0) / 2.0;

    warp(img, |x, y| {
        ((x - dx - cx) / scale + cx, (y - dy - cy) / scale + cy)
    })
}

fn luminance(pixel: &Rgb<u8>) -> f32 {
    0.299 * pixel[0] as f32 + 0.587 * pixel[1] as f32 + 0.114 * pixel[2] as f32
}

/// Adjusts image brightness
fn adjust_brightness(img: &mut RgbImage, factor: f32) {
    for pixel in img.pixels_mut() {
        for c in 0..3 {
            pixel[c] = (pixel[c] as f32 * factor).round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// Blends each pixel with the mean grey level of the whole image
fn adjust_contrast(img: &mut RgbImage, factor: f32) {
    let count = (img.width() * img.height()).max(1) as f32;
    let mean = img.pixels().map(luminance).sum::<f32>() / count;

    for pixel in img.pixels_mut() {
        for c in 0..3 {
            pixel[c] = (mean + factor * (pixel[c] as f32 - mean))
                .round()
                .clamp(0.0, 255.0) as u8;
        }
    }
}

/// Blends each pixel with its own grey level
fn adjust_saturation(img: &mut RgbImage, factor: f32) {
    for pixel in img.pixels_mut() {
        let gray = luminance(pixel);
        for c in 0..3 {
            pixel[c] = (gray + factor * (pixel[c] as f32 - gray))
                .round()
                .clamp(0.0, 255.0) as u8;
        }
    }
}

/// Rotates the hue of every pixel by `shift` of a full turn
fn shift_hue(img: &mut RgbImage, shift: f32) {
    if shift == 0.0 {
        return;
    }
    for pixel in img.pixels_mut() {
        let (h, s, v) = rgb_to_hsv(pixel);
        *pixel = hsv_to_rgb((h + shift).rem_euclid(1.0), s, v);
    }
}

/// Hue in `[0, 1)`, saturation and value in `[0, 1]`
fn rgb_to_hsv(pixel: &Rgb<u8>) -> (f32, f32, f32) {
    let r = pixel[0] as f32 / 255.0;
    let g = pixel[1] as f32 / 255.0;
    let b = pixel[2] as f32 / 255.0;
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let hue = if delta == 0.0 {
        0.0
    } else if max == r {
        ((g - b) / delta).rem_euclid(6.0) / 6.0
    } else if max == g {
        ((b - r) / delta + 2.0) / 6.0
    } else {
        ((r - g) / delta + 4.0) / 6.0
    };
    let saturation = if max == 0.0 { 0.0 } else { delta / max };

    (hue, saturation, max)
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> Rgb<u8> {
    let sector = h * 6.0;
    let i = sector.floor();
    let f = sector - i;
    let p = v * (1.0 - s);
    let q = v * (1.0 - s * f);
    let t = v * (1.0 - s * (1.0 - f));

    let (r, g, b) = match (i as i32).rem_euclid(6) {
        0 => (v, t, p),
        1 => (q, v, p),
        2 => (p, v, t),
        3 => (p, q, v),
        4 => (t, p, v),
        _ => (v, p, q),
    };

    let to_u8 = |x: f32| (x * 255.0).round().clamp(0.0, 255.0) as u8;
    Rgb([to_u8(r), to_u8(g), to_u8(b)])
}
