use image::{GrayImage, Luma};

use crate::classes::ClassId;
use crate::error::{AnalysisError, Result};
use crate::mask::ProbabilityMap;
use crate::models::backend::{NormalizedImage, PatchClassifier, Segmenter};

/// Classifier that gives every patch the same class and confidence.
///
/// The remaining probability mass is spread evenly over the other classes.
pub struct StubClassifier {
    class_id: ClassId,
    confidence: f32,
    num_scores: usize,
    input_size: u32,
}

impl StubClassifier {
    /// `num_scores` is the score vector length, usually `registry.max_id() + 1`.
    pub fn constant(class_id: ClassId, confidence: f32, num_scores: usize) -> Self {
        Self {
            class_id,
            confidence,
            num_scores: num_scores.max(class_id as usize + 1),
            input_size: 28,
        }
    }

    pub fn with_input_size(mut self, input_size: u32) -> Self {
        self.input_size = input_size;
        self
    }
}

impl PatchClassifier for StubClassifier {
    fn name(&self) -> &str {
        "stub"
    }

    fn input_size(&self) -> u32 {
        self.input_size
    }

    fn classify(&mut self, patches: &[GrayImage]) -> Result<Vec<Vec<f32>>> {
        let others = (self.num_scores - 1).saturating_sub(1).max(1) as f32;
        let rest = (1.0 - self.confidence).max(0.0) / others;
        Ok(patches
            .iter()
            .map(|_| {
                let mut scores = vec![rest; self.num_scores];
                scores[0] = 0.0;
                scores[self.class_id as usize] = self.confidence;
                scores
            })
            .collect())
    }
}

/// Intensity segmenter: dark particles on a bright background.
///
/// Maps normalized intensity `[-1, 1]` linearly to a foreground probability.
/// With `invert` set, bright structures are foreground instead.
pub struct IntensitySegmenter {
    pub invert: bool,
}

impl IntensitySegmenter {
    pub fn new() -> Self {
        Self { invert: false }
    }
}

impl Default for IntensitySegmenter {
    fn default() -> Self {
        Self::new()
    }
}

impl Segmenter for IntensitySegmenter {
    fn name(&self) -> &str {
        "intensity"
    }

    fn segment(&mut self, image: &NormalizedImage) -> Result<ProbabilityMap> {
        if image.width() == 0 || image.height() == 0 {
            return Err(AnalysisError::input("cannot segment an empty image"));
        }
        Ok(ProbabilityMap::from_fn(image.width(), image.height(), |x, y| {
            let v = image.get_pixel(x, y)[0];
            let p = if self.invert { (v + 1.0) / 2.0 } else { (1.0 - v) / 2.0 };
            Luma([p.clamp(0.0, 1.0)])
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::backend::normalize;

    #[test]
    fn test_stub_scores_put_confidence_on_class() {
        let mut stub = StubClassifier::constant(2, 0.9, 4);
        let patches = vec![GrayImage::new(28, 28); 3];
        let scores = stub.classify(&patches).unwrap();
        assert_eq!(scores.len(), 3);
        assert_eq!(scores[0].len(), 4);
        assert_eq!(scores[0][2], 0.9);
        assert_eq!(scores[0][0], 0.0);
        assert!((scores[0][1] - 0.05).abs() < 1e-6);
    }

    #[test]
    fn test_intensity_segmenter_prefers_dark_pixels() {
        let img = GrayImage::from_raw(2, 1, vec![0, 255]).unwrap();
        let mut seg = IntensitySegmenter::new();
        let prob = seg.segment(&normalize(&img)).unwrap();
        assert!(prob.get_pixel(0, 0)[0] > 0.99);
        assert!(prob.get_pixel(1, 0)[0] < 0.01);
    }
}
