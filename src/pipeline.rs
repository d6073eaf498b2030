//! Region analysis entry point: extract, filter, classify, report.

use std::fmt;
use std::path::{Path, PathBuf};

use image::{GrayImage, RgbImage};

use crate::classes::{ClassColors, ClassRegistry};
use crate::classify::{classify_regions, ClassifyOptions, PatchOptions};
use crate::config::{Neighbourhood, OutOfSetPolicy, RegionAnalysisOptions, ShapeKind};
use crate::error::{AnalysisError, Result};
use crate::mask::Mask;
use crate::models::ModelRegistry;
use crate::overlay::{export_overlay, render_overlay, ShapeLayer};
use crate::regions::{extract_regions, filter_regions, ExtractOptions, FilterBounds};
use crate::report::AnalysisReport;
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// One-line outcome of an operation, for a status bar or the console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
    pub severity: Severity,
    pub text: String,
}

impl StatusMessage {
    pub fn info(text: impl Into<String>) -> Self {
        Self { severity: Severity::Info, text: text.into() }
    }

    pub fn warning(text: impl Into<String>) -> Self {
        Self { severity: Severity::Warning, text: text.into() }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self { severity: Severity::Error, text: text.into() }
    }
}

impl From<&AnalysisError> for StatusMessage {
    fn from(err: &AnalysisError) -> Self {
        if err.is_user_facing() {
            StatusMessage::warning(err.to_string())
        } else {
            StatusMessage::error(err.to_string())
        }
    }
}

impl fmt::Display for StatusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
        };
        write!(f, "[{}] {}", tag, self.text)
    }
}

/// What a viewer should display after an analysis.
#[derive(Debug, Clone)]
pub enum LayerData {
    /// Class-labelled mask with the colors to paint it.
    Labels { mask: Mask, colors: ClassColors },
    /// Region outlines.
    Shapes(ShapeLayer),
    /// Pre-rendered RGB image.
    Image(RgbImage),
}

/// Named parameters of one region analysis call.
#[derive(Debug, Clone)]
pub struct RegionAnalysisParams {
    pub classifier_variant: String,
    /// Class or group names; empty means all classes.
    pub allowed_classes: Vec<String>,
    pub policy: OutOfSetPolicy,
    pub min_size: u32,
    pub max_size: u32,
    pub min_circularity: f64,
    pub shape_kind: ShapeKind,
    pub relabel_inplace: bool,
    pub erase_background: bool,
    pub mask_dilation: u8,
    pub connectivity: Neighbourhood,
    /// Background holes smaller than this are filled before measuring.
    pub hole_area_threshold: u32,
    /// Components smaller than this are removed before measuring.
    pub min_object_size: u32,
    /// Report path; `None` uses the session default.
    pub output_path: Option<PathBuf>,
}

impl From<&RegionAnalysisOptions> for RegionAnalysisParams {
    fn from(o: &RegionAnalysisOptions) -> Self {
        Self {
            classifier_variant: o.classifier_variant.clone(),
            allowed_classes: o.allowed_classes.clone(),
            policy: o.out_of_set_policy,
            min_size: o.min_size,
            max_size: o.max_size,
            min_circularity: o.min_circularity,
            shape_kind: o.shape_type,
            relabel_inplace: o.relabel_inplace,
            erase_background: o.erase_background,
            mask_dilation: o.mask_dilation,
            connectivity: o.connectivity,
            hole_area_threshold: o.hole_area_threshold,
            min_object_size: o.min_object_size,
            output_path: None,
        }
    }
}

impl RegionAnalysisParams {
    pub fn filter_bounds(&self) -> FilterBounds {
        FilterBounds {
            min_area: self.min_size,
            max_area: self.max_size,
            min_circularity: self.min_circularity,
        }
    }
}

impl Default for RegionAnalysisParams {
    fn default() -> Self {
        Self::from(&RegionAnalysisOptions::default())
    }
}

/// Everything one analysis produced.
///
/// A failed report write does not discard the results: the error lands in
/// `write_error` and the report stays available for another attempt.
#[derive(Debug)]
pub struct AnalysisOutcome {
    pub report: AnalysisReport,
    pub layer: LayerData,
    pub status: StatusMessage,
    pub report_path: Option<PathBuf>,
    pub write_error: Option<AnalysisError>,
    /// Regions skipped because no patch could be built.
    pub dropped: usize,
    /// Regions skipped because their class was not allowed.
    pub excluded: usize,
}

impl AnalysisOutcome {
    /// Write the class overlay of a label layer to `path`.
    ///
    /// Returns `Ok(None)` for shape layers and empty reports. When the
    /// overlay fails after the report already failed, the report error is
    /// returned and the overlay error is only logged.
    pub fn write_overlay(&mut self, image: &GrayImage, path: &Path) -> Result<Option<PathBuf>> {
        let LayerData::Labels { mask, colors } = &self.layer else {
            return Ok(None);
        };
        if self.report.is_empty() {
            return Ok(None);
        }
        let written = render_overlay(image, mask, colors).and_then(|rgb| export_overlay(&rgb, path));
        match written {
            Ok(()) => Ok(Some(path.to_path_buf())),
            Err(err) => {
                log::error!("Overlay not saved: {}", err);
                Err(self.write_error.take().unwrap_or(err))
            }
        }
    }
}

pub struct RegionAnalysis {
    params: RegionAnalysisParams,
}

impl RegionAnalysis {
    pub fn new(params: RegionAnalysisParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &RegionAnalysisParams {
        &self.params
    }

    /// Analyse the regions of `mask` on `image`.
    ///
    /// With `relabel_inplace` the mask ends up holding class ids. A mask
    /// without regions is not an error: the outcome is empty, nothing is
    /// written and the status says so.
    pub fn run(
        &self,
        image: &GrayImage,
        mask: Option<&mut Mask>,
        models: &ModelRegistry,
        classes: &ClassRegistry,
        session: &Session,
    ) -> Result<AnalysisOutcome> {
        let p = &self.params;
        let mask = mask.ok_or_else(|| AnalysisError::input("no mask supplied for region analysis"))?;
        if image.dimensions() != mask.dimensions() {
            return Err(AnalysisError::input(format!(
                "image is {}x{} but mask is {}x{}",
                image.width(),
                image.height(),
                mask.width(),
                mask.height()
            )));
        }
        let allowed = classes.resolve_allowed(&p.allowed_classes)?;
        let classifier = models.classifier(&p.classifier_variant)?;
        let colors = ClassColors::for_registry(classes);

        let extraction = extract_regions(
            mask,
            &ExtractOptions {
                connectivity: p.connectivity.into(),
                relabel: p.relabel_inplace,
                hole_area_threshold: p.hole_area_threshold,
                min_object_size: p.min_object_size,
            },
        );
        let kept = filter_regions(&extraction.regions, &p.filter_bounds());
        log::info!(
            "{} of {} regions within size [{}, {}] and circularity >= {}",
            kept.len(),
            extraction.regions.len(),
            p.min_size,
            p.max_size,
            p.min_circularity
        );

        if kept.is_empty() {
            if p.relabel_inplace {
                mask.pixels_mut().for_each(|px| px[0] = 0);
            }
            return Ok(AnalysisOutcome {
                report: AnalysisReport::new(&[], &p.classifier_variant),
                layer: LayerData::Labels { mask: mask.clone(), colors },
                status: StatusMessage::warning("no regions found"),
                report_path: None,
                write_error: None,
                dropped: 0,
                excluded: 0,
            });
        }

        let options = ClassifyOptions {
            allowed,
            policy: p.policy,
            inplace_relabel: p.relabel_inplace,
            patch: PatchOptions {
                erase_background: p.erase_background,
                mask_dilation: p.mask_dilation,
            },
        };
        let classification = {
            let mut classifier = classifier.lock();
            classify_regions(
                image,
                mask,
                &extraction.labels,
                &kept,
                &mut *classifier,
                classes,
                &options,
            )?
        };

        let report = AnalysisReport::new(&classification.pairs, &p.classifier_variant);
        let layer = match p.shape_kind {
            ShapeKind::None => LayerData::Labels { mask: mask.clone(), colors },
            kind => LayerData::Shapes(ShapeLayer::new(kind, &classification.pairs)),
        };

        let path = p
            .output_path
            .clone()
            .unwrap_or_else(|| session.default_report_path());
        let write_error = report.write_csv(&path).err();

        let dropped = classification.dropped.len();
        let excluded = classification.excluded.len();
        let status = match &write_error {
            Some(err) => StatusMessage::from(err),
            None => summarize(&report, dropped, excluded),
        };
        if let Some(err) = &write_error {
            log::error!("Report not saved: {}", err);
        }

        Ok(AnalysisOutcome {
            report,
            layer,
            status,
            report_path: write_error.is_none().then_some(path),
            write_error,
            dropped,
            excluded,
        })
    }
}

fn summarize(report: &AnalysisReport, dropped: usize, excluded: usize) -> StatusMessage {
    let mut text = format!(
        "{} regions classified, majority class {}",
        report.len(),
        report.majority_class_name().unwrap_or("none")
    );
    if dropped > 0 {
        text.push_str(&format!(", {} dropped without a patch", dropped));
    }
    if excluded > 0 {
        text.push_str(&format!(", {} outside the allowed classes", excluded));
    }
    if dropped > 0 || report.is_empty() {
        StatusMessage::warning(text)
    } else {
        StatusMessage::info(text)
    }
}

/// Image layer with class colors blended into `image`.
pub fn overlay_layer(image: &GrayImage, mask: &Mask, classes: &ClassRegistry) -> Result<LayerData> {
    let overlay = render_overlay(image, mask, &ClassColors::for_registry(classes))?;
    Ok(LayerData::Image(overlay))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StubClassifier;
    use crate::regions::tests::draw_disk;

    fn setup() -> (ModelRegistry, ClassRegistry) {
        let models = ModelRegistry::new();
        models.register_classifier("stub", StubClassifier::constant(2, 0.7, 3).with_input_size(16));
        let classes = ClassRegistry::from_pairs([("A", 1), ("B", 2)]).unwrap();
        (models, classes)
    }

    fn params(dir: &std::path::Path) -> RegionAnalysisParams {
        RegionAnalysisParams {
            classifier_variant: "stub".to_string(),
            allowed_classes: Vec::new(),
            output_path: Some(dir.join("report.csv")),
            ..RegionAnalysisParams::default()
        }
    }

    #[test]
    fn test_missing_mask_is_input_error() {
        let (models, classes) = setup();
        let dir = tempfile::tempdir().unwrap();
        let analysis = RegionAnalysis::new(params(dir.path()));
        let image = GrayImage::new(10, 10);
        let err = analysis
            .run(&image, None, &models, &classes, &Session::new(dir.path()))
            .unwrap_err();
        assert!(matches!(err, AnalysisError::Input(_)));
    }

    #[test]
    fn test_unknown_variant_is_configuration_error() {
        let (models, classes) = setup();
        let dir = tempfile::tempdir().unwrap();
        let mut p = params(dir.path());
        p.classifier_variant = "missing".to_string();
        let image = GrayImage::new(60, 60);
        let mut mask = Mask::new(60, 60);
        draw_disk(&mut mask, 30, 30, 6, 1);
        let err = RegionAnalysis::new(p)
            .run(&image, Some(&mut mask), &models, &classes, &Session::new(dir.path()))
            .unwrap_err();
        assert!(matches!(err, AnalysisError::Configuration(_)));
    }

    #[test]
    fn test_unknown_variant_fails_on_empty_mask() {
        let (models, classes) = setup();
        let dir = tempfile::tempdir().unwrap();
        let mut p = params(dir.path());
        p.classifier_variant = "no_such_variant".to_string();
        let image = GrayImage::new(50, 50);
        let mut mask = Mask::new(50, 50);
        let err = RegionAnalysis::new(p)
            .run(&image, Some(&mut mask), &models, &classes, &Session::new(dir.path()))
            .unwrap_err();
        assert!(matches!(err, AnalysisError::Configuration(_)));
        assert!(!dir.path().join("report.csv").exists());
    }

    #[test]
    fn test_hole_threshold_fills_region_before_measuring() {
        let (models, classes) = setup();
        let dir = tempfile::tempdir().unwrap();
        let holed = || {
            let mut mask = Mask::new(60, 60);
            draw_disk(&mut mask, 30, 30, 6, 1);
            for (x, y) in [(30, 30), (31, 30), (30, 31), (31, 31)] {
                mask.put_pixel(x, y, image::Luma([0]));
            }
            mask
        };
        let image = GrayImage::new(60, 60);
        let mut p = params(dir.path());
        p.min_circularity = 0.0;

        let mut mask = holed();
        let outcome = RegionAnalysis::new(p.clone())
            .run(&image, Some(&mut mask), &models, &classes, &Session::new(dir.path()))
            .unwrap();
        assert_eq!(outcome.report.rows()[0].area, 109);
        assert_eq!(mask.get_pixel(30, 30)[0], 0);

        p.hole_area_threshold = 10;
        let mut mask = holed();
        let outcome = RegionAnalysis::new(p)
            .run(&image, Some(&mut mask), &models, &classes, &Session::new(dir.path()))
            .unwrap();
        assert_eq!(outcome.report.rows()[0].area, 113);
        assert_eq!(mask.get_pixel(30, 30)[0], 2);
    }

    #[test]
    fn test_shapes_layer_and_relabel() {
        let (models, classes) = setup();
        let dir = tempfile::tempdir().unwrap();
        let mut p = params(dir.path());
        p.shape_kind = ShapeKind::Rectangle;
        let image = GrayImage::new(60, 60);
        let mut mask = Mask::new(60, 60);
        draw_disk(&mut mask, 30, 30, 6, 9);

        let outcome = RegionAnalysis::new(p)
            .run(&image, Some(&mut mask), &models, &classes, &Session::new(dir.path()))
            .unwrap();
        assert_eq!(outcome.report.len(), 1);
        assert_eq!(outcome.status.severity, Severity::Info);
        assert_eq!(mask.get_pixel(30, 30)[0], 2);
        match outcome.layer {
            LayerData::Shapes(layer) => assert_eq!(layer.shapes[0].label, "B"),
            other => panic!("unexpected layer {:?}", other),
        }
        assert!(dir.path().join("report.csv").exists());
    }

    #[test]
    fn test_overlay_failure_keeps_report_error() {
        let (models, classes) = setup();
        let dir = tempfile::tempdir().unwrap();
        let mut p = params(dir.path());
        p.output_path = Some(dir.path().join("no_reports").join("report.csv"));
        let image = GrayImage::new(60, 60);
        let mut mask = Mask::new(60, 60);
        draw_disk(&mut mask, 30, 30, 6, 1);

        let mut outcome = RegionAnalysis::new(p)
            .run(&image, Some(&mut mask), &models, &classes, &Session::new(dir.path()))
            .unwrap();
        assert!(outcome.write_error.is_some());

        let err = outcome
            .write_overlay(&image, &dir.path().join("no_overlays").join("cls.png"))
            .unwrap_err();
        assert!(err.to_string().contains("no_reports"));
        assert!(outcome.write_error.is_none());
    }

    #[test]
    fn test_write_overlay_for_label_layer() {
        let (models, classes) = setup();
        let dir = tempfile::tempdir().unwrap();
        let image = GrayImage::new(60, 60);
        let mut mask = Mask::new(60, 60);
        draw_disk(&mut mask, 30, 30, 6, 1);

        let mut outcome = RegionAnalysis::new(params(dir.path()))
            .run(&image, Some(&mut mask), &models, &classes, &Session::new(dir.path()))
            .unwrap();
        let path = dir.path().join("cls.png");
        assert_eq!(outcome.write_overlay(&image, &path).unwrap(), Some(path.clone()));
        assert!(path.exists());
    }

    #[test]
    fn test_overlay_layer_is_image() {
        let (_, classes) = setup();
        let image = GrayImage::new(12, 12);
        let mut mask = Mask::new(12, 12);
        draw_disk(&mut mask, 6, 6, 2, 2);
        match overlay_layer(&image, &mask, &classes).unwrap() {
            LayerData::Image(rgb) => {
                assert_eq!(rgb.dimensions(), (12, 12));
                assert_ne!(rgb.get_pixel(6, 6), rgb.get_pixel(0, 0));
            }
            other => panic!("unexpected layer {:?}", other),
        }
    }

    #[test]
    fn test_status_from_error() {
        let status = StatusMessage::from(&AnalysisError::input("no regions found"));
        assert_eq!(status.severity, Severity::Warning);
        assert_eq!(status.to_string(), "[WARNING] no regions found");
        let status = StatusMessage::from(&AnalysisError::model("boom"));
        assert_eq!(status.severity, Severity::Error);
    }
}
