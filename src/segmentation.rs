//! Raw image → labelled particle mask.

use std::path::Path;

use image::{GrayImage, Luma};

use crate::config::SegmentationOptions;
use crate::error::{AnalysisError, Result};
use crate::mask::{self, Mask, ProbabilityMap};
use crate::report::ensure_parent_dir;
use crate::models::{normalize, Segmenter};
use crate::regions::{extract_regions, ExtractOptions};

/// Segmenter output before and after post-processing.
#[derive(Debug, Clone)]
pub struct Segmentation {
    pub probabilities: ProbabilityMap,
    pub mask: Mask,
}

/// Segment `image` into a mask of densely numbered particles.
///
/// The segmenter's probability map is thresholded, holes below
/// `hole_area_threshold` are filled and particles below
/// `min_particle_size` are removed before labelling.
pub fn segment_image(
    image: &GrayImage,
    segmenter: &mut dyn Segmenter,
    options: &SegmentationOptions,
) -> Result<Mask> {
    Ok(segment_with_probabilities(image, segmenter, options)?.mask)
}

/// Like [`segment_image`], keeping the raw probability map.
pub fn segment_with_probabilities(
    image: &GrayImage,
    segmenter: &mut dyn Segmenter,
    options: &SegmentationOptions,
) -> Result<Segmentation> {
    let normalized = normalize(image);
    let prob = segmenter.segment(&normalized)?;
    if prob.dimensions() != image.dimensions() {
        return Err(AnalysisError::model(format!(
            "segmenter {} returned a {}x{} map for a {}x{} image",
            segmenter.name(),
            prob.width(),
            prob.height(),
            image.width(),
            image.height()
        )));
    }

    let mut mask = mask::threshold(&prob, options.threshold);
    let extraction = extract_regions(
        &mut mask,
        &ExtractOptions {
            hole_area_threshold: options.hole_area_threshold,
            min_object_size: options.min_particle_size,
            ..ExtractOptions::default()
        },
    );
    log::info!(
        "Segmenter {} found {} particles ({} foreground pixels)",
        segmenter.name(),
        extraction.regions.len(),
        mask::foreground_count(&mask)
    );
    Ok(Segmentation { probabilities: prob, mask })
}

/// Probabilities scaled to 0..=255.
pub fn probability_image(prob: &ProbabilityMap) -> GrayImage {
    GrayImage::from_fn(prob.width(), prob.height(), |x, y| {
        let p = prob.get_pixel(x, y)[0];
        let p = if p.is_nan() { 0.0 } else { p.clamp(0.0, 1.0) };
        Luma([(p * 255.0).round() as u8])
    })
}

pub fn save_probability_map(prob: &ProbabilityMap, path: &Path) -> Result<()> {
    ensure_parent_dir(path)?;
    probability_image(prob).save(path)?;
    log::info!("Probability map saved to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IntensitySegmenter;
    use image::Luma;

    #[test]
    fn test_dark_particles_become_labels() {
        let mut image = GrayImage::from_pixel(64, 64, Luma([230]));
        for y in 10..20 {
            for x in 10..20 {
                image.put_pixel(x, y, Luma([20]));
            }
        }
        // Too small to survive.
        image.put_pixel(50, 50, Luma([20]));
        // Hole inside a particle is filled.
        for y in 30..45 {
            for x in 30..45 {
                image.put_pixel(x, y, Luma([20]));
            }
        }
        image.put_pixel(37, 37, Luma([230]));

        let mut segmenter = IntensitySegmenter::new();
        let mask = segment_image(&image, &mut segmenter, &SegmentationOptions::default()).unwrap();
        assert_eq!(mask.get_pixel(15, 15)[0], 1);
        assert_eq!(mask.get_pixel(37, 37)[0], 2);
        assert_eq!(mask.get_pixel(50, 50)[0], 0);
        assert_eq!(mask.get_pixel(0, 0)[0], 0);
    }

    #[test]
    fn test_probability_map_is_kept_and_saved() {
        let mut image = GrayImage::from_pixel(64, 64, Luma([255]));
        for y in 20..44 {
            for x in 20..44 {
                image.put_pixel(x, y, Luma([0]));
            }
        }
        let mut segmenter = IntensitySegmenter::new();
        let seg = segment_with_probabilities(&image, &mut segmenter, &SegmentationOptions::default())
            .unwrap();
        assert_eq!(seg.probabilities.dimensions(), (64, 64));
        assert_eq!(seg.mask.get_pixel(32, 32)[0], 1);
        assert_eq!(seg.mask.get_pixel(0, 0)[0], 0);

        let gray = probability_image(&seg.probabilities);
        assert_eq!(gray.get_pixel(32, 32)[0], 255);
        assert!(gray.get_pixel(0, 0)[0] < 5);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cell_probmap.png");
        save_probability_map(&seg.probabilities, &path).unwrap();
        assert!(path.exists());
        assert!(save_probability_map(&seg.probabilities, &dir.path().join("nope").join("p.png")).is_err());
    }

    #[test]
    fn test_blank_image_gives_empty_mask() {
        let image = GrayImage::from_pixel(16, 16, Luma([255]));
        let mut segmenter = IntensitySegmenter::new();
        let mask = segment_image(&image, &mut segmenter, &SegmentationOptions::default()).unwrap();
        assert!(mask::is_empty(&mask));
    }
}
