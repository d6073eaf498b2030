use image::{GrayImage, ImageBuffer, Luma};

use crate::error::Result;
use crate::mask::ProbabilityMap;

/// Image normalized the way the networks were trained: `(x - 128) / 128`.
pub type NormalizedImage = ImageBuffer<Luma<f32>, Vec<f32>>;

pub const DATASET_MEAN: f32 = 128.0;
pub const DATASET_STD: f32 = 128.0;

pub fn normalize(image: &GrayImage) -> NormalizedImage {
    NormalizedImage::from_fn(image.width(), image.height(), |x, y| {
        Luma([(image.get_pixel(x, y)[0] as f32 - DATASET_MEAN) / DATASET_STD])
    })
}

/// Patch classification model boundary.
///
/// Implementations receive raw 8-bit patches of `input_size × input_size`
/// pixels and return one score vector per patch. Score vectors are indexed
/// by class id; index 0 is background and is never selected.
pub trait PatchClassifier: Send {
    /// Backend identifier.
    fn name(&self) -> &str;

    /// Side length of the square patches the model expects.
    fn input_size(&self) -> u32;

    /// Score a batch of patches.
    fn classify(&mut self, patches: &[GrayImage]) -> Result<Vec<Vec<f32>>>;
}

/// Segmentation model boundary.
///
/// Consumes a normalized image and returns a foreground probability per
/// pixel. Thresholding is left to the caller.
pub trait Segmenter: Send {
    fn name(&self) -> &str;

    fn segment(&mut self, image: &NormalizedImage) -> Result<ProbabilityMap>;
}

/// Softmax over a score vector, in place.
pub fn softmax(scores: &mut [f32]) {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return;
    }
    let mut sum = 0.0;
    for s in scores.iter_mut() {
        *s = (*s - max).exp();
        sum += *s;
    }
    if sum > 0.0 {
        for s in scores.iter_mut() {
            *s /= sum;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_matches_training_stats() {
        let img = GrayImage::from_raw(3, 1, vec![0, 128, 255]).unwrap();
        let n = normalize(&img);
        assert_eq!(n.get_pixel(0, 0)[0], -1.0);
        assert_eq!(n.get_pixel(1, 0)[0], 0.0);
        assert!((n.get_pixel(2, 0)[0] - 127.0 / 128.0).abs() < 1e-6);
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let mut scores = vec![1.0, 2.0, 3.0];
        softmax(&mut scores);
        let sum: f32 = scores.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(scores[2] > scores[1] && scores[1] > scores[0]);
    }
}
