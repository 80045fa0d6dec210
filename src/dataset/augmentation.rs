//! Data Augmentation Module
//!
//! Random affine and photometric transforms applied on the fly to training
//! images. Validation, test and calibration images are never augmented.
//!
//! # Transform order
//!
//! 1. One affine map (rotation, shift, shear, zoom) around the image centre,
//!    inverse-sampled bilinearly with nearest (edge) fill
//! 2. Channel shift, clipped to each channel's original range
//! 3. Horizontal flip
//! 4. Multiplicative brightness

use image::{Rgb, RgbImage};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Configuration for data augmentation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AugmentationConfig {
    /// Maximum rotation angle in degrees (uniform in ±rotation_degrees)
    pub rotation_degrees: f32,
    /// Horizontal shift as a fraction of the width (uniform in ±width_shift)
    pub width_shift: f32,
    /// Vertical shift as a fraction of the height
    pub height_shift: f32,
    /// Zoom range: zx and zy drawn independently from [1 - zoom, 1 + zoom]
    pub zoom: f32,
    /// Shear angle in degrees (uniform in ±shear_degrees)
    pub shear_degrees: f32,
    /// Flip horizontally with probability 0.5
    pub horizontal_flip: bool,
    /// Multiplicative brightness factor range, `None` to disable
    pub brightness_range: Option<(f32, f32)>,
    /// Channel shift intensity added to all channels (uniform in ±channel_shift)
    pub channel_shift: f32,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            rotation_degrees: 25.0,
            width_shift: 0.15,
            height_shift: 0.15,
            zoom: 0.25,
            shear_degrees: 0.12,
            horizontal_flip: true,
            brightness_range: Some((0.75, 1.25)),
            channel_shift: 10.0,
        }
    }
}

impl AugmentationConfig {
    /// Disable all augmentations (for validation/inference)
    pub fn none() -> Self {
        Self {
            rotation_degrees: 0.0,
            width_shift: 0.0,
            height_shift: 0.0,
            zoom: 0.0,
            shear_degrees: 0.0,
            horizontal_flip: false,
            brightness_range: None,
            channel_shift: 0.0,
        }
    }

    /// True when no transform can change an image
    pub fn is_identity(&self) -> bool {
        !self.has_affine()
            && !self.horizontal_flip
            && self.brightness_range.is_none()
            && self.channel_shift == 0.0
    }

    fn has_affine(&self) -> bool {
        self.rotation_degrees != 0.0
            || self.width_shift != 0.0
            || self.height_shift != 0.0
            || self.zoom != 0.0
            || self.shear_degrees != 0.0
    }
}

/// A sampled affine transform, mapping output offsets from the centre to input offsets
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AffineParams {
    pub theta: f32,
    pub shift_x: f32,
    pub shift_y: f32,
    pub shear: f32,
    pub zoom_x: f32,
    pub zoom_y: f32,
}

impl AffineParams {
    pub fn identity() -> Self {
        Self {
            theta: 0.0,
            shift_x: 0.0,
            shift_y: 0.0,
            shear: 0.0,
            zoom_x: 1.0,
            zoom_y: 1.0,
        }
    }

    /// 2x2 matrix `R(theta) * Shear(shear) * Zoom(zx, zy)`, row-major
    pub fn matrix(&self) -> [f32; 4] {
        let (sin_t, cos_t) = self.theta.sin_cos();
        let (sin_s, cos_s) = self.shear.sin_cos();

        // rotation * shear
        let a = cos_t;
        let b = -sin_t * cos_s - cos_t * sin_s;
        let c = sin_t;
        let d = -sin_t * sin_s + cos_t * cos_s;

        [a * self.zoom_x, b * self.zoom_y, c * self.zoom_x, d * self.zoom_y]
    }
}

/// Image augmenter that applies random transformations
#[derive(Clone, Debug)]
pub struct Augmenter {
    config: AugmentationConfig,
}

impl Augmenter {
    pub fn new(config: AugmentationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AugmentationConfig {
        &self.config
    }

    /// Apply all configured augmentations to an image of any size
    pub fn augment(&self, img: &RgbImage, rng: &mut ChaCha8Rng) -> RgbImage {
        if self.config.is_identity() {
            return img.clone();
        }

        let mut result = if self.config.has_affine() {
            let params = self.sample_affine(img.width(), img.height(), rng);
            apply_affine(img, &params)
        } else {
            img.clone()
        };

        if self.config.channel_shift > 0.0 {
            let shift = rng.gen_range(-self.config.channel_shift..=self.config.channel_shift);
            channel_shift(&mut result, shift);
        }

        if self.config.horizontal_flip && rng.gen::<f32>() < 0.5 {
            image::imageops::flip_horizontal_in_place(&mut result);
        }

        if let Some((low, high)) = self.config.brightness_range {
            let factor = if high > low { rng.gen_range(low..=high) } else { low };
            adjust_brightness(&mut result, factor);
        }

        result
    }

    /// Draw the affine parameters for an image of the given size
    pub fn sample_affine(&self, width: u32, height: u32, rng: &mut ChaCha8Rng) -> AffineParams {
        let c = &self.config;
        let symmetric = |rng: &mut ChaCha8Rng, r: f32| if r > 0.0 { rng.gen_range(-r..=r) } else { 0.0 };

        let theta = symmetric(rng, c.rotation_degrees).to_radians();
        let shift_x = symmetric(rng, c.width_shift) * width as f32;
        let shift_y = symmetric(rng, c.height_shift) * height as f32;
        let shear = symmetric(rng, c.shear_degrees).to_radians();
        let (zoom_x, zoom_y) = if c.zoom > 0.0 {
            (
                rng.gen_range(1.0 - c.zoom..=1.0 + c.zoom),
                rng.gen_range(1.0 - c.zoom..=1.0 + c.zoom),
            )
        } else {
            (1.0, 1.0)
        };

        AffineParams {
            theta,
            shift_x,
            shift_y,
            shear,
            zoom_x,
            zoom_y,
        }
    }
}

/// Inverse-map every output pixel through `params` and sample the source
pub fn apply_affine(img: &RgbImage, params: &AffineParams) -> RgbImage {
    let (width, height) = img.dimensions();
    let cx = (width as f32 - 1.0) / 2.0;
    let cy = (height as f32 - 1.0) / 2.0;
    let [a, b, c, d] = params.matrix();

    RgbImage::from_fn(width, height, |x, y| {
        let dx = x as f32 - cx;
        let dy = y as f32 - cy;
        let src_x = a * dx + b * dy + cx + params.shift_x;
        let src_y = c * dx + d * dy + cy + params.shift_y;
        bilinear_sample_clamped(img, src_x, src_y)
    })
}

/// Bilinear sample with edge clamping ("nearest" fill outside the image)
pub fn bilinear_sample_clamped(img: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (width, height) = img.dimensions();
    let max_x = (width - 1) as f32;
    let max_y = (height - 1) as f32;
    let x = x.clamp(0.0, max_x);
    let y = y.clamp(0.0, max_y);

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

    let mut result = [0u8; 3];
    for ch in 0..3 {
        let v = p00[ch] as f32 * (1.0 - fx) * (1.0 - fy)
            + p10[ch] as f32 * fx * (1.0 - fy)
            + p01[ch] as f32 * (1.0 - fx) * fy
            + p11[ch] as f32 * fx * fy;
        result[ch] = v.round().clamp(0.0, 255.0) as u8;
    }

    Rgb(result)
}

/// Add `shift` to every channel, clipped to that channel's original min/max
/// (Keras `apply_channel_shift`), not to [0, 255]: a channel of constant
/// value is left untouched
pub fn channel_shift(img: &mut RgbImage, shift: f32) {
    let mut lo = [255u8; 3];
    let mut hi = [0u8; 3];
    for pixel in img.pixels() {
        for ch in 0..3 {
            lo[ch] = lo[ch].min(pixel[ch]);
            hi[ch] = hi[ch].max(pixel[ch]);
        }
    }

    for pixel in img.pixels_mut() {
        for ch in 0..3 {
            let v = (pixel[ch] as f32 + shift).clamp(lo[ch] as f32, hi[ch] as f32);
            pixel[ch] = v.round() as u8;
        }
    }
}

/// Scale all pixel values by `factor`
pub fn adjust_brightness(img: &mut RgbImage, factor: f32) {
    for pixel in img.pixels_mut() {
        for ch in 0..3 {
            pixel[ch] = (pixel[ch] as f32 * factor).round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// Convert an image to CHW float data in the raw 0..255 range
pub fn to_chw_data(img: &RgbImage) -> Vec<f32> {
    let (width, height) = img.dimensions();
    let plane = (width * height) as usize;
    let mut data = vec![0.0f32; 3 * plane];

    for (i, pixel) in img.pixels().enumerate() {
        data[i] = pixel[0] as f32;
        data[plane + i] = pixel[1] as f32;
        data[2 * plane + i] = pixel[2] as f32;
    }

    data
}
