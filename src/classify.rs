//! Per-region patch classification and class relabeling.

use image::{GrayImage, Luma};
use imageproc::distance_transform::Norm;
use imageproc::morphology::dilate;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::classes::{ClassId, ClassRegistry};
use crate::config::OutOfSetPolicy;
use crate::error::{AnalysisError, Result};
use crate::mask::Mask;
use crate::models::PatchClassifier;
use crate::regions::Region;

/// Classifier output for one region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassPrediction {
    pub class_id: ClassId,
    pub class_name: String,
    /// Score of the chosen class.
    pub confidence: f32,
    /// Full score vector, indexed by class id.
    pub scores: Vec<f32>,
}

#[derive(Debug, Clone, Copy)]
pub struct PatchOptions {
    /// Zero pixels that do not belong to the region.
    pub erase_background: bool,
    /// Grow the region mask by this many pixels before erasing.
    pub mask_dilation: u8,
}

impl Default for PatchOptions {
    fn default() -> Self {
        Self {
            erase_background: true,
            mask_dilation: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClassifyOptions {
    /// Eligible class ids. Empty means every registered class.
    pub allowed: Vec<ClassId>,
    pub policy: OutOfSetPolicy,
    /// Rewrite region pixels in the caller's mask with the resolved class id.
    pub inplace_relabel: bool,
    pub patch: PatchOptions,
}

impl Default for ClassifyOptions {
    fn default() -> Self {
        Self {
            allowed: Vec::new(),
            policy: OutOfSetPolicy::Restrict,
            inplace_relabel: false,
            patch: PatchOptions::default(),
        }
    }
}

/// Classified regions plus the ones that fell out along the way.
#[derive(Debug, Clone, Default)]
pub struct Classification {
    pub pairs: Vec<(Region, ClassPrediction)>,
    /// Regions no patch could be built for.
    pub dropped: Vec<u32>,
    /// Regions whose prediction was outside the allowed classes.
    pub excluded: Vec<u32>,
}

/// Square `size × size` crop centred on the region centroid.
///
/// Parts of the window outside the image are zero-padded. Returns `None`
/// only when no patch can be built (zero size or an empty image).
pub fn extract_patch(
    image: &GrayImage,
    labels: &Mask,
    region: &Region,
    size: u32,
    options: &PatchOptions,
) -> Option<GrayImage> {
    if size == 0 || image.width() == 0 || image.height() == 0 {
        return None;
    }
    let half = (size / 2) as i64;
    let x0 = region.centroid.1.round() as i64 - half;
    let y0 = region.centroid.0.round() as i64 - half;
    let (width, height) = (image.width() as i64, image.height() as i64);
    let inside = |x: u32, y: u32| {
        let (ix, iy) = (x0 + x as i64, y0 + y as i64);
        (ix >= 0 && iy >= 0 && ix < width && iy < height).then_some((ix as u32, iy as u32))
    };

    let mut patch = GrayImage::from_fn(size, size, |x, y| match inside(x, y) {
        Some((ix, iy)) => *image.get_pixel(ix, iy),
        None => Luma([0]),
    });
    if !options.erase_background {
        return Some(patch);
    }

    let mut keep = GrayImage::from_fn(size, size, |x, y| match inside(x, y) {
        Some((ix, iy)) if labels.get_pixel(ix, iy)[0] == region.id => Luma([255]),
        _ => Luma([0]),
    });
    if options.mask_dilation > 0 {
        keep = dilate(&keep, Norm::LInf, options.mask_dilation);
    }
    for (px, k) in patch.pixels_mut().zip(keep.pixels()) {
        if k[0] == 0 {
            px[0] = 0;
        }
    }
    Some(patch)
}

/// Pick the class for a score vector.
///
/// Ties go to the lowest class id. Returns `None` when no eligible class
/// has a score or, under `Exclude`, when the best class is not allowed.
pub fn resolve_class(
    scores: &[f32],
    registry: &ClassRegistry,
    allowed: &[ClassId],
    policy: OutOfSetPolicy,
) -> Option<ClassId> {
    let is_allowed = |id: ClassId| allowed.is_empty() || allowed.contains(&id);
    let candidates = registry.ids().filter(|&id| (id as usize) < scores.len());

    match policy {
        OutOfSetPolicy::Restrict => argmax(scores, candidates.filter(|&id| is_allowed(id))),
        OutOfSetPolicy::Exclude => argmax(scores, candidates).filter(|&id| is_allowed(id)),
    }
}

fn argmax(scores: &[f32], ids: impl Iterator<Item = ClassId>) -> Option<ClassId> {
    let mut best: Option<(ClassId, f32)> = None;
    for id in ids {
        let s = scores[id as usize];
        if s.is_nan() {
            continue;
        }
        if best.map_or(true, |(_, b)| s > b) {
            best = Some((id, s));
        }
    }
    best.map(|(id, _)| id)
}

/// Classify each region's patch and optionally relabel the mask by class.
///
/// `labels` is the component map the region ids refer to. Regions whose
/// patch cannot be cut out are dropped with a warning; they never fail
/// the batch. With `inplace_relabel`, every pixel of `mask` ends up as
/// either background or the class id of a reported region.
pub fn classify_regions(
    image: &GrayImage,
    mask: &mut Mask,
    labels: &Mask,
    regions: &[Region],
    classifier: &mut dyn PatchClassifier,
    registry: &ClassRegistry,
    options: &ClassifyOptions,
) -> Result<Classification> {
    if image.dimensions() != mask.dimensions() || labels.dimensions() != mask.dimensions() {
        return Err(AnalysisError::input(format!(
            "image is {}x{} but mask is {}x{}",
            image.width(),
            image.height(),
            mask.width(),
            mask.height()
        )));
    }

    let size = classifier.input_size();
    let patches: Vec<(&Region, Option<GrayImage>)> = regions
        .par_iter()
        .map(|r| (r, extract_patch(image, labels, r, size, &options.patch)))
        .collect();

    let mut result = Classification::default();
    let mut batch_regions = Vec::new();
    let mut batch = Vec::new();
    for (region, patch) in patches {
        match patch {
            Some(p) => {
                batch_regions.push(region);
                batch.push(p);
            }
            None => {
                log::warn!(
                    "Dropping region {}: no {}x{} patch around ({:.1}, {:.1})",
                    region.id,
                    size,
                    size,
                    region.centroid.0,
                    region.centroid.1
                );
                result.dropped.push(region.id);
            }
        }
    }

    let scores = if batch.is_empty() {
        Vec::new()
    } else {
        classifier.classify(&batch)?
    };
    if scores.len() != batch.len() {
        return Err(AnalysisError::model(format!(
            "classifier {} returned {} score vectors for {} patches",
            classifier.name(),
            scores.len(),
            batch.len()
        )));
    }

    for (region, scores) in batch_regions.into_iter().zip(scores) {
        let Some(class_id) = resolve_class(&scores, registry, &options.allowed, options.policy)
        else {
            log::info!("Region {} excluded: prediction outside allowed classes", region.id);
            result.excluded.push(region.id);
            continue;
        };
        let class_name = registry.name(class_id).unwrap_or_default().to_string();
        let prediction = ClassPrediction {
            class_id,
            class_name,
            confidence: scores[class_id as usize],
            scores,
        };
        result.pairs.push((region.clone(), prediction));
    }

    if options.inplace_relabel {
        relabel_by_class(mask, labels, &result.pairs);
    }

    log::debug!(
        "Classified {} regions ({} dropped, {} excluded)",
        result.pairs.len(),
        result.dropped.len(),
        result.excluded.len()
    );
    Ok(result)
}

/// Overwrite `mask` with class ids; pixels of unreported components become background.
pub fn relabel_by_class(mask: &mut Mask, labels: &Mask, pairs: &[(Region, ClassPrediction)]) {
    let max_id = pairs.iter().map(|(r, _)| r.id).max().unwrap_or(0);
    let mut lookup = vec![0u32; max_id as usize + 1];
    for (region, prediction) in pairs {
        lookup[region.id as usize] = prediction.class_id;
    }
    for (px, l) in mask.pixels_mut().zip(labels.pixels()) {
        px[0] = lookup.get(l[0] as usize).copied().unwrap_or(0);
    }
}
