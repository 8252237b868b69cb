//! Joint HSV colour histogram extractor.
//!
//! Pixels are converted to hue/saturation/value with the 8-bit conventions
//! common to image-processing libraries (hue in `[0, 180)`, saturation and
//! value in `[0, 255]`), binned into a 3-D histogram, flattened hue-major and
//! L2-normalized.

use image::{DynamicImage, RgbImage};

use super::{ExtractionError, FeatureExtractor, ImageDecoder, ModelLoadError, Result};
use crate::vector::{FeatureVector, normalize_l2_in_place};

const HUE_RANGE: u32 = 180;
const CHANNEL_RANGE: u32 = 256;

/// Colour histogram extractor over (hue, saturation, value).
#[derive(Debug, Clone)]
pub struct HsvHistogramExtractor {
    bins: [u32; 3],
    id: String,
    decoder: ImageDecoder,
}

impl HsvHistogramExtractor {
    /// 8 bins per channel, 512 dimensions.
    pub const DEFAULT_BINS: [u32; 3] = [8, 8, 8];

    /// Create an extractor with the given (hue, saturation, value) bin counts.
    ///
    /// Each count must be non-zero and no larger than its channel range.
    pub fn new(bins: [u32; 3]) -> std::result::Result<Self, ModelLoadError> {
        let ranges = [HUE_RANGE, CHANNEL_RANGE, CHANNEL_RANGE];
        let names = ["hue", "saturation", "value"];
        for ((count, range), name) in bins.iter().zip(ranges).zip(names) {
            if *count == 0 || *count > range {
                return Err(ModelLoadError::InvalidConfig(format!(
                    "{} bins must be between 1 and {}, got {}",
                    name, range, count
                )));
            }
        }

        Ok(Self {
            bins,
            id: format!("hsv-histogram-{}x{}x{}", bins[0], bins[1], bins[2]),
            decoder: ImageDecoder::default(),
        })
    }

    pub fn with_decoder(mut self, decoder: ImageDecoder) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn bins(&self) -> [u32; 3] {
        self.bins
    }

    /// Normalized, flattened histogram of an RGB image.
    pub fn histogram(&self, rgb: &RgbImage) -> Vec<f32> {
        let [h_bins, s_bins, v_bins] = self.bins;
        let mut counts = vec![0_u64; (h_bins * s_bins * v_bins) as usize];

        for pixel in rgb.pixels() {
            let (h, s, v) = rgb_to_hsv(pixel[0], pixel[1], pixel[2]);
            let h_idx = bin_index(h as u32, HUE_RANGE, h_bins);
            let s_idx = bin_index(s as u32, CHANNEL_RANGE, s_bins);
            let v_idx = bin_index(v as u32, CHANNEL_RANGE, v_bins);
            counts[((h_idx * s_bins + s_idx) * v_bins + v_idx) as usize] += 1;
        }

        // f32 stops counting at 2^24, so convert only once the counts are final.
        let mut values: Vec<f32> = counts.iter().map(|&c| c as f32).collect();
        normalize_l2_in_place(&mut values);
        values
    }
}

impl Default for HsvHistogramExtractor {
    fn default() -> Self {
        Self {
            bins: Self::DEFAULT_BINS,
            id: "hsv-histogram-8x8x8".to_string(),
            decoder: ImageDecoder::default(),
        }
    }
}

impl FeatureExtractor for HsvHistogramExtractor {
    fn id(&self) -> &str {
        &self.id
    }

    fn dimension(&self) -> usize {
        self.bins.iter().map(|b| *b as usize).product()
    }

    fn decoder(&self) -> &ImageDecoder {
        &self.decoder
    }

    fn extract_image(&self, image: &DynamicImage) -> Result<FeatureVector> {
        if image.width() == 0 || image.height() == 0 {
            return Err(ExtractionError::EmptyImage);
        }
        Ok(FeatureVector::new(self.histogram(&image.to_rgb8())))
    }
}

fn bin_index(value: u32, range: u32, bins: u32) -> u32 {
    (value * bins / range).min(bins - 1)
}

/// Convert one 8-bit RGB pixel to 8-bit HSV.
///
/// Hue is degrees halved so it fits a byte, taken modulo 180.
pub fn rgb_to_hsv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let (rf, gf, bf) = (f32::from(r), f32::from(g), f32::from(b));
    let max = rf.max(gf).max(bf);
    let min = rf.min(gf).min(bf);
    let delta = max - min;

    let s = if max == 0.0 { 0.0 } else { delta * 255.0 / max };

    let h = if delta == 0.0 {
        0.0
    } else if max == rf {
        60.0 * (gf - bf) / delta
    } else if max == gf {
        120.0 + 60.0 * (bf - rf) / delta
    } else {
        240.0 + 60.0 * (rf - gf) / delta
    };
    let h = if h < 0.0 { h + 360.0 } else { h };
    let h = ((h / 2.0).round() as u32) % HUE_RANGE;

    (h as u8, s.round() as u8, max as u8)
}
