//! Patch classifier evaluation on a labelled patch directory.
//!
//! Layout: `<root>/<class name>/<image number>_<anything>.<ext>`.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use image::imageops::{self, FilterType};
use image::GrayImage;
use rayon::prelude::*;
use regex::Regex;

use crate::classes::{ClassId, ClassRegistry};
use crate::classify::resolve_class;
use crate::config::{Config, OutOfSetPolicy};
use crate::error::{AnalysisError, Result};
use crate::models::PatchClassifier;
use crate::report::{create_in_existing_dir, majority_class};

const BATCH_SIZE: usize = 64;

/// One labelled patch.
#[derive(Debug, Clone)]
pub struct PatchSample {
    pub path: PathBuf,
    pub target: ClassId,
    pub image_number: u32,
    pub image: GrayImage,
}

/// Majority vote over all patches cut from one source image.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageVote {
    pub image_number: u32,
    pub target: ClassId,
    pub predicted: Option<ClassId>,
    pub patches: usize,
}

#[derive(Debug, Clone)]
pub struct Evaluation {
    /// Class ids in matrix order.
    pub class_ids: Vec<ClassId>,
    pub class_names: Vec<String>,
    /// `matrix[target][predicted]` patch counts.
    pub matrix: Vec<Vec<usize>>,
    pub accuracy: f64,
    pub image_votes: Vec<ImageVote>,
    pub image_accuracy: f64,
    pub processing_time: std::time::Duration,
}

impl Evaluation {
    pub fn total(&self) -> usize {
        self.matrix.iter().flatten().sum()
    }

    /// Matrix with each predicted column scaled to sum to 1.
    pub fn column_normalized(&self) -> Vec<Vec<f64>> {
        let n = self.class_ids.len();
        let col_sums: Vec<usize> = (0..n)
            .map(|j| self.matrix.iter().map(|row| row[j]).sum())
            .collect();
        self.matrix
            .iter()
            .map(|row| {
                row.iter()
                    .zip(&col_sums)
                    .map(|(&v, &s)| if s == 0 { 0.0 } else { v as f64 / s as f64 })
                    .collect()
            })
            .collect()
    }
}

/// Load every patch below `root` whose directory names a known class.
pub fn load_patches(root: &Path, registry: &ClassRegistry, config: &Config) -> Result<Vec<PatchSample>> {
    if !root.is_dir() {
        return Err(AnalysisError::input(format!(
            "patch directory does not exist or is not a directory: {}",
            root.display()
        )));
    }
    let number = Regex::new(r"^(\d+)_").map_err(|e| AnalysisError::configuration(e.to_string()))?;

    let mut candidates: Vec<(PathBuf, ClassId, u32)> = Vec::new();
    for entry in fs::read_dir(root).map_err(|e| AnalysisError::io_at(root, e))? {
        let class_dir = entry.map_err(|e| AnalysisError::io_at(root, e))?.path();
        if !class_dir.is_dir() {
            continue;
        }
        let class_name = class_dir.file_name().unwrap_or_default().to_string_lossy().to_string();
        let Some(target) = registry.id(&class_name) else {
            log::warn!("Skipping {}: not a known class", class_dir.display());
            continue;
        };
        for file in fs::read_dir(&class_dir).map_err(|e| AnalysisError::io_at(&class_dir, e))? {
            let path = file.map_err(|e| AnalysisError::io_at(&class_dir, e))?.path();
            let supported = path
                .extension()
                .and_then(|e| e.to_str())
                .map_or(false, |e| config.is_supported_format(e));
            if !path.is_file() || !supported {
                continue;
            }
            let file_name = path.file_name().unwrap_or_default().to_string_lossy().to_string();
            let image_number = number
                .captures(&file_name)
                .and_then(|c| c[1].parse::<u32>().ok());
            match image_number {
                Some(n) => candidates.push((path, target, n)),
                None => log::warn!("Skipping {}: no image number prefix", path.display()),
            }
        }
    }
    candidates.sort_by(|a, b| a.0.cmp(&b.0));

    let samples: Vec<PatchSample> = candidates
        .into_par_iter()
        .filter_map(|(path, target, image_number)| match image::open(&path) {
            Ok(img) => Some(PatchSample { image: img.to_luma8(), path, target, image_number }),
            Err(e) => {
                log::warn!("Could not open patch {}: {}", path.display(), e);
                None
            }
        })
        .collect();

    if samples.is_empty() {
        return Err(AnalysisError::input(format!("no labelled patches found in {}", root.display())));
    }
    log::info!("Loaded {} patches from {}", samples.len(), root.display());
    Ok(samples)
}

/// Classify every sample and tabulate the results.
pub fn evaluate_patches(
    samples: &[PatchSample],
    classifier: &mut dyn PatchClassifier,
    registry: &ClassRegistry,
) -> Result<Evaluation> {
    let start = Instant::now();
    let class_ids: Vec<ClassId> = registry.ids().collect();
    let index: BTreeMap<ClassId, usize> = class_ids.iter().enumerate().map(|(i, &id)| (id, i)).collect();
    let n = class_ids.len();
    let mut matrix = vec![vec![0usize; n]; n];
    let size = classifier.input_size();

    let mut predictions: Vec<Option<ClassId>> = Vec::with_capacity(samples.len());
    for chunk in samples.chunks(BATCH_SIZE) {
        let batch: Vec<GrayImage> = chunk
            .par_iter()
            .map(|s| {
                if s.image.dimensions() == (size, size) {
                    s.image.clone()
                } else {
                    imageops::resize(&s.image, size, size, FilterType::Triangle)
                }
            })
            .collect();
        let scores = classifier.classify(&batch)?;
        if scores.len() != batch.len() {
            return Err(AnalysisError::model(format!(
                "classifier {} returned {} score vectors for {} patches",
                classifier.name(),
                scores.len(),
                batch.len()
            )));
        }
        predictions.extend(
            scores
                .iter()
                .map(|s| resolve_class(s, registry, &[], OutOfSetPolicy::Restrict)),
        );
    }

    let mut correct = 0usize;
    let mut per_image: BTreeMap<(u32, ClassId), Vec<ClassId>> = BTreeMap::new();
    for (sample, predicted) in samples.iter().zip(&predictions) {
        let votes = per_image.entry((sample.image_number, sample.target)).or_default();
        let Some(predicted) = *predicted else {
            continue;
        };
        votes.push(predicted);
        if let (Some(&t), Some(&p)) = (index.get(&sample.target), index.get(&predicted)) {
            matrix[t][p] += 1;
        }
        if predicted == sample.target {
            correct += 1;
        }
    }

    let image_votes: Vec<ImageVote> = per_image
        .into_iter()
        .map(|((image_number, target), votes)| ImageVote {
            image_number,
            target,
            predicted: majority_class(&votes),
            patches: votes.len(),
        })
        .collect();
    let image_correct = image_votes.iter().filter(|v| v.predicted == Some(v.target)).count();

    let ratio = |a: usize, b: usize| if b == 0 { 0.0 } else { a as f64 / b as f64 };
    Ok(Evaluation {
        class_names: class_ids
            .iter()
            .map(|&id| registry.name(id).unwrap_or_default().to_string())
            .collect(),
        class_ids,
        matrix,
        accuracy: ratio(correct, samples.len()),
        image_accuracy: ratio(image_correct, image_votes.len()),
        image_votes,
        processing_time: start.elapsed(),
    })
}

/// Confusion matrix as CSV, targets as rows.
pub fn save_confusion_csv(evaluation: &Evaluation, path: &Path) -> Result<()> {
    let mut file = create_in_existing_dir(path)?;
    let io = |e| AnalysisError::io_at(path, e);

    write!(file, "target").map_err(io)?;
    for name in &evaluation.class_names {
        write!(file, ",{}", name).map_err(io)?;
    }
    writeln!(file).map_err(io)?;
    for (name, row) in evaluation.class_names.iter().zip(&evaluation.matrix) {
        write!(file, "{}", name).map_err(io)?;
        for v in row {
            write!(file, ",{}", v).map_err(io)?;
        }
        writeln!(file).map_err(io)?;
    }
    file.flush().map_err(io)?;
    log::info!("Confusion matrix saved to {}", path.display());
    Ok(())
}

/// Per-image majority votes as CSV.
pub fn save_image_votes_csv(evaluation: &Evaluation, registry: &ClassRegistry, path: &Path) -> Result<()> {
    let mut file = create_in_existing_dir(path)?;
    let io = |e| AnalysisError::io_at(path, e);
    let name = |id: Option<ClassId>| id.and_then(|id| registry.name(id)).unwrap_or("").to_string();

    writeln!(file, "image_number,target,predicted,patches").map_err(io)?;
    for vote in &evaluation.image_votes {
        writeln!(
            file,
            "{},{},{},{}",
            vote.image_number,
            name(Some(vote.target)),
            name(vote.predicted),
            vote.patches
        )
        .map_err(io)?;
    }
    file.flush().map_err(io)?;
    Ok(())
}

/// Column-normalized confusion matrix heatmap.
pub fn save_confusion_heatmap(evaluation: &Evaluation, path: &Path) -> Result<()> {
    crate::report::ensure_parent_dir(path)?;
    draw_heatmap(evaluation, path).map_err(|e| {
        AnalysisError::io_at(path, std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    })?;
    log::info!("Confusion heatmap saved to {}", path.display());
    Ok(())
}

fn draw_heatmap(
    evaluation: &Evaluation,
    path: &Path,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    use plotters::prelude::*;

    let n = evaluation.class_ids.len();
    if n == 0 {
        return Err("No classes to plot".into());
    }
    let normalized = evaluation.column_normalized();
    let names = &evaluation.class_names;

    let side = std::cmp::max(600, 200 + n * 60) as u32;
    let root = BitMapBackend::new(path, (side, side)).into_drawing_area();
    root.fill(&WHITE)?;

    let label_area = std::cmp::max(60, names.iter().map(|s| s.len()).max().unwrap_or(10) * 7) as u32;
    let mut chart = ChartBuilder::on(&root)
        .caption(
            format!("Confusion matrix (accuracy {:.1}%)", evaluation.accuracy * 100.0),
            ("sans-serif", 24).into_font(),
        )
        .margin(10)
        .x_label_area_size(label_area)
        .y_label_area_size(label_area)
        .build_cartesian_2d(0..n, (0..n).into_segmented())?;

    chart
        .configure_mesh()
        .disable_mesh()
        .x_labels(n)
        .y_labels(n)
        .x_desc("Predicted")
        .y_desc("Target")
        .x_label_formatter(&|x| names.get(*x).cloned().unwrap_or_default())
        .y_label_formatter(&|y| match y {
            SegmentValue::Exact(y) => names.get(*y).cloned().unwrap_or_default(),
            _ => String::new(),
        })
        .x_label_style(("sans-serif", 12).into_font().transform(FontTransform::Rotate90))
        .draw()?;

    let gradient = colorous::VIRIDIS;
    for (i, row) in normalized.iter().enumerate() {
        for (j, &value) in row.iter().enumerate() {
            let color = gradient.eval_continuous(value);
            chart.draw_series(std::iter::once(Rectangle::new(
                [(j, SegmentValue::Exact(i)), (j + 1, SegmentValue::Exact(i + 1))],
                RGBColor(color.r, color.g, color.b).filled(),
            )))?;
        }
    }

    root.present()?;
    Ok(())
}

/// Load, evaluate and write all evaluation outputs into `output_dir`.
pub fn run_evaluation(
    root: &Path,
    classifier: &mut dyn PatchClassifier,
    registry: &ClassRegistry,
    config: &Config,
    output_dir: &Path,
) -> Result<Evaluation> {
    let samples = load_patches(root, registry, config)?;
    let evaluation = evaluate_patches(&samples, classifier, registry)?;

    fs::create_dir_all(output_dir).map_err(|e| AnalysisError::io_at(output_dir, e))?;
    save_confusion_csv(&evaluation, &output_dir.join("confusion_matrix.csv"))?;
    save_image_votes_csv(&evaluation, registry, &output_dir.join("image_votes.csv"))?;
    save_confusion_heatmap(&evaluation, &output_dir.join("confusion_matrix.png"))?;

    log::info!(
        "Evaluated {} patches in {:?}: accuracy {:.2}%, per-image accuracy {:.2}%",
        evaluation.total(),
        evaluation.processing_time,
        evaluation.accuracy * 100.0,
        evaluation.image_accuracy * 100.0
    );
    Ok(evaluation)
}
