//! Pixel-level comparison of a segmentation with ground-truth labels.

use std::fs::File;
use std::path::{Path, PathBuf};

use image::{GrayImage, Luma, RgbImage};
use serde::Serialize;

use crate::classes::ClassColors;
use crate::error::{AnalysisError, Result};
use crate::mask::{self, Mask, ProbabilityMap};
use crate::overlay::{export_overlay, render_overlay};
use crate::report::ensure_parent_dir;
use crate::segmentation::Segmentation;

const TRUTH_COLOR: [u8; 3] = [255, 0, 0];
const PREDICTION_COLOR: [u8; 3] = [0, 255, 0];
const ERROR_COLOR: [u8; 3] = [255, 0, 255];

/// Confusion counts over foreground/background pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PixelCounts {
    pub true_positive: u64,
    pub false_positive: u64,
    pub false_negative: u64,
    pub true_negative: u64,
}

impl PixelCounts {
    /// 0 when nothing was predicted as foreground.
    pub fn precision(&self) -> f64 {
        ratio(self.true_positive, self.true_positive + self.false_positive)
    }

    /// 0 when the ground truth has no foreground.
    pub fn recall(&self) -> f64 {
        ratio(self.true_positive, self.true_positive + self.false_negative)
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

fn check_dimensions(found: (u32, u32), truth: &Mask, what: &str) -> Result<()> {
    if found != truth.dimensions() {
        return Err(AnalysisError::input(format!(
            "{} is {}x{} but ground truth is {}x{}",
            what,
            found.0,
            found.1,
            truth.width(),
            truth.height()
        )));
    }
    Ok(())
}

/// Count agreement between predicted and true foreground.
pub fn compare_masks(prediction: &Mask, truth: &Mask) -> Result<PixelCounts> {
    check_dimensions(prediction.dimensions(), truth, "prediction")?;
    let mut counts = PixelCounts::default();
    for (p, t) in prediction.pixels().zip(truth.pixels()) {
        match (p[0] != 0, t[0] != 0) {
            (true, true) => counts.true_positive += 1,
            (true, false) => counts.false_positive += 1,
            (false, true) => counts.false_negative += 1,
            (false, false) => counts.true_negative += 1,
        }
    }
    Ok(counts)
}

/// Binary (0/1) masks of the wrongly segmented pixels.
#[derive(Debug, Clone)]
pub struct ErrorMaps {
    /// Foreground disagreement of either kind.
    pub error: Mask,
    pub false_positive: Mask,
    pub false_negative: Mask,
}

pub fn error_maps(prediction: &Mask, truth: &Mask) -> Result<ErrorMaps> {
    check_dimensions(prediction.dimensions(), truth, "prediction")?;
    let (width, height) = truth.dimensions();
    let flag = |cond: bool| Luma([cond as u32]);
    let fg = |m: &Mask, x, y| m.get_pixel(x, y)[0] != 0;
    Ok(ErrorMaps {
        error: Mask::from_fn(width, height, |x, y| flag(fg(prediction, x, y) != fg(truth, x, y))),
        false_positive: Mask::from_fn(width, height, |x, y| {
            flag(fg(prediction, x, y) && !fg(truth, x, y))
        }),
        false_negative: Mask::from_fn(width, height, |x, y| {
            flag(!fg(prediction, x, y) && fg(truth, x, y))
        }),
    })
}

/// Blend `color` into `image` on the foreground of `flagged`.
pub fn highlight(image: &GrayImage, flagged: &Mask, color: [u8; 3]) -> Result<RgbImage> {
    let binary = Mask::from_fn(flagged.width(), flagged.height(), |x, y| {
        Luma([(flagged.get_pixel(x, y)[0] != 0) as u32])
    });
    let mut colors = ClassColors::default();
    colors.insert(1, color);
    render_overlay(image, &binary, &colors)
}

/// One operating point of a thresholded probability map.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PrPoint {
    pub threshold: f32,
    pub precision: f64,
    pub recall: f64,
}

const CURVE_LEVELS: usize = 256;

/// Precision and recall of `prob > k / 255` for each level `k`.
///
/// Points are ordered by rising threshold. Levels that predict no
/// foreground are skipped. NaN probabilities count as background.
pub fn precision_recall_curve(prob: &ProbabilityMap, truth: &Mask) -> Result<Vec<PrPoint>> {
    check_dimensions(prob.dimensions(), truth, "probability map")?;

    // level(p) = ceil(255 p), so `p > k / 255` holds exactly when level(p) > k.
    let mut positives = [0u64; CURVE_LEVELS];
    let mut negatives = [0u64; CURVE_LEVELS];
    for (p, t) in prob.pixels().zip(truth.pixels()) {
        let p = if p[0].is_nan() { 0.0 } else { p[0].clamp(0.0, 1.0) };
        let level = ((p * 255.0).ceil() as usize).min(CURVE_LEVELS - 1);
        if t[0] != 0 {
            positives[level] += 1;
        } else {
            negatives[level] += 1;
        }
    }
    let total_positive: u64 = positives.iter().sum();

    let mut points = Vec::new();
    let (mut tp, mut fp) = (0u64, 0u64);
    for k in (0..CURVE_LEVELS - 1).rev() {
        tp += positives[k + 1];
        fp += negatives[k + 1];
        if tp + fp == 0 {
            continue;
        }
        points.push(PrPoint {
            threshold: k as f32 / 255.0,
            precision: ratio(tp, tp + fp),
            recall: ratio(tp, total_positive),
        });
    }
    points.reverse();
    Ok(points)
}

/// Curve point whose threshold is closest to `threshold`.
pub fn nearest_point(points: &[PrPoint], threshold: f32) -> Option<PrPoint> {
    points.iter().copied().min_by(|a, b| {
        let da = (a.threshold - threshold).abs();
        let db = (b.threshold - threshold).abs();
        da.total_cmp(&db)
    })
}

pub fn save_pr_curve(points: &[PrPoint], marker: Option<PrPoint>, path: &Path) -> Result<()> {
    ensure_parent_dir(path)?;
    draw_pr_curve(points, marker, path).map_err(|e| {
        AnalysisError::io_at(path, std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    })?;
    log::info!("Precision-recall curve saved to {}", path.display());
    Ok(())
}

fn draw_pr_curve(
    points: &[PrPoint],
    marker: Option<PrPoint>,
    path: &Path,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    use plotters::prelude::*;

    if points.is_empty() {
        return Err("No curve points to plot".into());
    }

    let root = BitMapBackend::new(path, (600, 600)).into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .caption("Pixel precision-recall", ("sans-serif", 24).into_font())
        .margin(15)
        .x_label_area_size(50)
        .y_label_area_size(60)
        .build_cartesian_2d(0f64..1f64, 0f64..1f64)?;

    chart
        .configure_mesh()
        .x_desc("Recall")
        .y_desc("Precision")
        .draw()?;

    chart.draw_series(LineSeries::new(
        points.iter().map(|p| (p.recall, p.precision)),
        BLUE.stroke_width(2),
    ))?;

    if let Some(m) = marker {
        chart.draw_series(std::iter::once(Circle::new((m.recall, m.precision), 5, RED.filled())))?;
        chart.draw_series(std::iter::once(Text::new(
            format!("(r={:.2}, p={:.2})", m.recall, m.precision),
            ((m.recall - 0.35).max(0.0), (m.precision - 0.08).max(0.02)),
            ("sans-serif", 16).into_font(),
        )))?;
    }

    root.present()?;
    Ok(())
}

/// Scores written next to the error maps.
#[derive(Debug, Clone, Serialize)]
pub struct SegmentationScores {
    pub threshold: f32,
    pub counts: PixelCounts,
    pub precision: f64,
    pub recall: f64,
}

/// Write error maps and truth/prediction overlays as `<stem>_*.png` into `output_dir`.
///
/// Returns the written paths.
pub fn write_error_images(
    image: &GrayImage,
    prediction: &Mask,
    truth: &Mask,
    output_dir: &Path,
    stem: &str,
) -> Result<Vec<PathBuf>> {
    check_dimensions(image.dimensions(), truth, "image")?;
    let maps = error_maps(prediction, truth)?;
    let path = |suffix: &str| output_dir.join(format!("{}_{}.png", stem, suffix));
    let mut written = Vec::new();

    for (suffix, map) in [
        ("error", &maps.error),
        ("fp_error", &maps.false_positive),
        ("fn_error", &maps.false_negative),
    ] {
        let p = path(suffix);
        ensure_parent_dir(&p)?;
        mask::binarize(map).save(&p)?;
        written.push(p);
    }

    for (suffix, flagged, color) in [
        ("fp_error_overlay", &maps.false_positive, ERROR_COLOR),
        ("fn_error_overlay", &maps.false_negative, ERROR_COLOR),
        ("overlay_lab", truth, TRUTH_COLOR),
        ("overlay_pred", prediction, PREDICTION_COLOR),
    ] {
        let p = path(suffix);
        export_overlay(&highlight(image, flagged, color)?, &p)?;
        written.push(p);
    }
    Ok(written)
}

/// Full ground-truth evaluation of one segmented image.
///
/// Writes the error images, `<stem>_prcurve.png` and `<stem>_scores.json`.
pub fn evaluate_segmentation(
    image: &GrayImage,
    segmentation: &Segmentation,
    truth: &Mask,
    threshold: f32,
    output_dir: &Path,
    stem: &str,
) -> Result<SegmentationScores> {
    let counts = compare_masks(&segmentation.mask, truth)?;
    let scores = SegmentationScores {
        threshold,
        counts,
        precision: counts.precision(),
        recall: counts.recall(),
    };

    write_error_images(image, &segmentation.mask, truth, output_dir, stem)?;

    let curve = precision_recall_curve(&segmentation.probabilities, truth)?;
    if curve.is_empty() {
        log::warn!("No foreground at any threshold, skipping precision-recall curve");
    } else {
        let marker = nearest_point(&curve, threshold);
        save_pr_curve(&curve, marker, &output_dir.join(format!("{}_prcurve.png", stem)))?;
    }

    let json_path = output_dir.join(format!("{}_scores.json", stem));
    ensure_parent_dir(&json_path)?;
    let file = File::create(&json_path).map_err(|e| AnalysisError::io_at(&json_path, e))?;
    serde_json::to_writer_pretty(file, &scores)?;

    log::info!(
        "Segmentation vs ground truth: precision {:.3}, recall {:.3}",
        scores.precision,
        scores.recall
    );
    Ok(scores)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Every pixel outcome at least once, with two true positives.
    fn pair() -> (Mask, Mask) {
        let prediction = Mask::from_raw(5, 1, vec![1, 1, 1, 0, 0]).unwrap();
        let truth = Mask::from_raw(5, 1, vec![1, 1, 0, 1, 0]).unwrap();
        (prediction, truth)
    }

    #[test]
    fn test_pixel_counts_and_scores() {
        let (prediction, truth) = pair();
        let counts = compare_masks(&prediction, &truth).unwrap();
        assert_eq!(
            counts,
            PixelCounts { true_positive: 2, false_positive: 1, false_negative: 1, true_negative: 1 }
        );
        assert!((counts.precision() - 2.0 / 3.0).abs() < 1e-9);
        assert!((counts.recall() - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(PixelCounts::default().precision(), 0.0);
    }

    #[test]
    fn test_error_maps() {
        let (prediction, truth) = pair();
        let maps = error_maps(&prediction, &truth).unwrap();
        assert_eq!(maps.error.as_raw(), &vec![0, 0, 1, 1, 0]);
        assert_eq!(maps.false_positive.as_raw(), &vec![0, 0, 1, 0, 0]);
        assert_eq!(maps.false_negative.as_raw(), &vec![0, 0, 0, 1, 0]);
    }

    #[test]
    fn test_dimension_mismatch_is_input_error() {
        let err = compare_masks(&Mask::new(3, 3), &Mask::new(4, 3)).unwrap_err();
        assert!(matches!(err, AnalysisError::Input(_)));
    }

    #[test]
    fn test_precision_recall_curve() {
        let prob = ProbabilityMap::from_raw(4, 1, vec![0.9, 0.6, 0.3, 0.1]).unwrap();
        let truth = Mask::from_raw(4, 1, vec![1, 0, 1, 0]).unwrap();
        let curve = precision_recall_curve(&prob, &truth).unwrap();

        assert!(curve.windows(2).all(|w| w[0].threshold < w[1].threshold));
        let at_half = nearest_point(&curve, 0.5).unwrap();
        // Only 0.9 and 0.6 exceed 0.5.
        assert!((at_half.precision - 0.5).abs() < 1e-9);
        assert!((at_half.recall - 0.5).abs() < 1e-9);
        // Lowest threshold predicts everything.
        assert!((curve[0].recall - 1.0).abs() < 1e-9);
        assert!((curve[0].precision - 0.5).abs() < 1e-9);
        // Highest surviving threshold keeps only the 0.9 pixel.
        let last = curve.last().unwrap();
        assert_eq!(last.precision, 1.0);
        assert_eq!(last.recall, 0.5);
    }

    #[test]
    fn test_write_error_images() {
        let dir = tempfile::tempdir().unwrap();
        let (prediction, truth) = pair();
        let image = GrayImage::from_pixel(5, 1, Luma([100]));
        let written = write_error_images(&image, &prediction, &truth, dir.path(), "cell").unwrap();
        assert_eq!(written.len(), 7);
        assert!(written.iter().all(|p| p.exists()));

        let fp = image::open(dir.path().join("cell_fp_error.png")).unwrap().to_luma8();
        assert_eq!(fp.get_pixel(2, 0)[0], 255);
        assert_eq!(fp.get_pixel(0, 0)[0], 0);

        let overlay = image::open(dir.path().join("cell_fn_error_overlay.png")).unwrap().to_rgb8();
        assert_eq!(overlay.get_pixel(3, 0).0, [178, 50, 178]);
        assert_eq!(overlay.get_pixel(0, 0).0, [100, 100, 100]);
    }

    #[test]
    fn test_missing_output_directory() {
        let dir = tempfile::tempdir().unwrap();
        let (prediction, truth) = pair();
        let image = GrayImage::new(5, 1);
        let missing = dir.path().join("absent");
        assert!(write_error_images(&image, &prediction, &truth, &missing, "cell").is_err());
    }
}
