//! Post-training quantization helpers
//!
//! Weights use symmetric int8 per output channel. Activations at the graph
//! boundary use asymmetric int8 parameters calibrated from observed ranges.

use std::path::PathBuf;

use half::f16;
use tracing::debug;

use crate::dataset::burn_dataset::load_resized;
use crate::utils::error::{Result, TrashSortError};

/// Affine int8 quantization parameters: `real = scale * (q - zero_point)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantParams {
    pub scale: f32,
    pub zero_point: i8,
}

impl QuantParams {
    /// Parameters covering `[min, max]` (widened to include zero)
    pub fn from_range(min: f32, max: f32) -> Self {
        let min = min.min(0.0);
        let max = max.max(0.0);
        let range = if (max - min).abs() < 1e-7 { 1e-7 } else { max - min };

        let scale = range / 255.0;
        let zero_point = (-128.0 - min / scale).round().clamp(-128.0, 127.0) as i8;
        Self { scale, zero_point }
    }

    /// Fixed output parameters for probabilities in [0, 1]
    pub fn probabilities() -> Self {
        Self {
            scale: 1.0 / 256.0,
            zero_point: -128,
        }
    }

    pub fn quantize(&self, value: f32) -> i8 {
        (value / self.scale + self.zero_point as f32).round().clamp(-128.0, 127.0) as i8
    }

    pub fn dequantize(&self, q: i8) -> f32 {
        self.scale * (q as i32 - self.zero_point as i32) as f32
    }
}

/// Running min/max over calibration data
#[derive(Debug, Clone, Default)]
pub struct RangeObserver {
    min: Option<f32>,
    max: Option<f32>,
    count: usize,
}

impl RangeObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, values: impl IntoIterator<Item = f32>) {
        for v in values {
            self.min = Some(self.min.map_or(v, |m| m.min(v)));
            self.max = Some(self.max.map_or(v, |m| m.max(v)));
        }
        self.count += 1;
    }

    pub fn min_max(&self) -> Option<(f32, f32)> {
        self.min.zip(self.max)
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

/// Calibrate input quantization from the representative images after resize
pub fn calibrate_input(samples: &[(PathBuf, usize)], image_size: usize) -> Result<QuantParams> {
    let mut observer = RangeObserver::new();
    for (path, _) in samples {
        match load_resized(path, image_size) {
            Ok(img) => observer.observe(img.as_raw().iter().map(|&p| p as f32)),
            Err(e) => debug!("Calibration skipped {:?}: {}", path, e),
        }
    }

    let (min, max) = observer
        .min_max()
        .ok_or_else(|| TrashSortError::Export("representative set is empty".to_string()))?;
    let params = QuantParams::from_range(min, max);
    debug!(
        "Calibrated input over {} images: range [{}, {}] -> scale {} zero point {}",
        observer.count(),
        min,
        max,
        params.scale,
        params.zero_point
    );
    Ok(params)
}

/// Symmetric int8 quantization per slice along `axis`.
///
/// Returns the quantized values (same layout) and one scale per slice.
pub fn quantize_per_channel(data: &[f32], dims: &[usize], axis: usize) -> (Vec<i8>, Vec<f32>) {
    let channels = dims.get(axis).copied().unwrap_or(1).max(1);
    let inner: usize = dims.iter().skip(axis + 1).product();
    let channel_of = |i: usize| (i / inner.max(1)) % channels;

    let mut max_abs = vec![0.0f32; channels];
    for (i, v) in data.iter().enumerate() {
        let c = channel_of(i);
        max_abs[c] = max_abs[c].max(v.abs());
    }
    let scales: Vec<f32> = max_abs
        .iter()
        .map(|&m| if m > 0.0 { m / 127.0 } else { 1.0 })
        .collect();

    let quantized = data
        .iter()
        .enumerate()
        .map(|(i, v)| (v / scales[channel_of(i)]).round().clamp(-127.0, 127.0) as i8)
        .collect();

    (quantized, scales)
}

pub fn to_f16_bytes(data: &[f32]) -> Vec<u8> {
    data.iter().flat_map(|&v| f16::from_f32(v).to_le_bytes()).collect()
}

pub fn to_f32_bytes(data: &[f32]) -> Vec<u8> {
    data.iter().flat_map(|v| v.to_le_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn test_range_params_cover_pixels() {
        let params = QuantParams::from_range(0.0, 255.0);
        assert_eq!(params.zero_point, -128);
        assert_eq!(params.quantize(0.0), -128);
        assert_eq!(params.quantize(255.0), 127);
        assert!((params.dequantize(params.quantize(128.0)) - 128.0).abs() <= params.scale);
    }

    #[test]
    fn test_probability_params() {
        let params = QuantParams::probabilities();
        assert_eq!(params.quantize(0.0), -128);
        assert_eq!(params.quantize(1.0), 127);
        assert!((params.dequantize(0) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_per_channel_scales() {
        // two output channels of two values each
        let data = [1.0, -0.5, 0.0, 0.25];
        let (q, scales) = quantize_per_channel(&data, &[2, 2], 0);
        assert!((scales[0] - 1.0 / 127.0).abs() < 1e-9);
        assert!((scales[1] - 0.25 / 127.0).abs() < 1e-9);
        assert_eq!(q, vec![127, -64, 0, 127]);
    }

    #[test]
    fn test_per_channel_last_axis() {
        // [in=2, out=2], channels along axis 1
        let data = [2.0, 0.1, -1.0, -0.2];
        let (_, scales) = quantize_per_channel(&data, &[2, 2], 1);
        assert!((scales[0] - 2.0 / 127.0).abs() < 1e-9);
        assert!((scales[1] - 0.2 / 127.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_channel_gets_unit_scale() {
        let (q, scales) = quantize_per_channel(&[0.0, 0.0], &[1, 2], 0);
        assert_eq!(scales, vec![1.0]);
        assert_eq!(q, vec![0, 0]);
    }

    #[test]
    fn test_calibrate_input_from_images() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.png");
        let mut img = RgbImage::from_pixel(4, 4, Rgb([40, 40, 40]));
        img.put_pixel(0, 0, Rgb([200, 10, 90]));
        img.save(&path).unwrap();

        let params = calibrate_input(&[(path, 0)], 4).unwrap();
        assert!(params.scale > 0.0);
        assert!(calibrate_input(&[], 4).is_err());
    }
}
