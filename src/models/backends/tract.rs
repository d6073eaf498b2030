#![cfg(feature = "onnx")]

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use image::{GrayImage, Luma};
use tract_onnx::prelude::*;

use crate::error::{AnalysisError, Result};
use crate::mask::ProbabilityMap;
use crate::models::backend::{
    softmax, NormalizedImage, PatchClassifier, Segmenter, DATASET_MEAN, DATASET_STD,
};

type Plan = SimplePlan<TypedFact, Box<dyn TypedOp>>;

fn model_error(context: &str, path: &Path, e: impl std::fmt::Display) -> AnalysisError {
    AnalysisError::model(format!("{} ({}): {}", context, path.display(), e))
}

fn build_plan(path: &Path, height: usize, width: usize) -> Result<Plan> {
    tract_onnx::onnx()
        .model_for_path(path)
        .map_err(|e| model_error("failed to load ONNX model", path, e))?
        .with_input_fact(
            0,
            InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 1, height, width)),
        )
        .map_err(|e| model_error("failed to set input fact", path, e))?
        .into_optimized()
        .map_err(|e| model_error("failed to optimize ONNX model", path, e))?
        .into_runnable()
        .map_err(|e| model_error("failed to build runnable ONNX model", path, e))
}

/// ONNX patch classifier. Expects a `(1, 1, S, S)` input and a `(1, C)` output of logits.
pub struct TractClassifier {
    name: String,
    path: PathBuf,
    plan: Plan,
    input_size: u32,
}

impl TractClassifier {
    pub fn load<P: AsRef<Path>>(name: &str, path: P, input_size: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let plan = build_plan(&path, input_size as usize, input_size as usize)?;
        log::info!("Loaded classifier {} from {}", name, path.display());
        Ok(Self {
            name: name.to_string(),
            path,
            plan,
            input_size,
        })
    }
}

impl PatchClassifier for TractClassifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_size(&self) -> u32 {
        self.input_size
    }

    fn classify(&mut self, patches: &[GrayImage]) -> Result<Vec<Vec<f32>>> {
        let side = self.input_size as usize;
        let mut out = Vec::with_capacity(patches.len());
        for patch in patches {
            if patch.width() as usize != side || patch.height() as usize != side {
                return Err(AnalysisError::model(format!(
                    "patch is {}x{}, model expects {}x{}",
                    patch.width(),
                    patch.height(),
                    side,
                    side
                )));
            }
            let input = tract_ndarray::Array4::from_shape_fn((1, 1, side, side), |(_, _, y, x)| {
                (patch.get_pixel(x as u32, y as u32)[0] as f32 - DATASET_MEAN) / DATASET_STD
            });
            let outputs = self
                .plan
                .run(tvec!(input.into_tensor().into()))
                .map_err(|e| model_error("inference failed", &self.path, e))?;
            let output = outputs
                .first()
                .ok_or_else(|| AnalysisError::model("model produced no outputs"))?;
            let mut scores = output
                .as_slice::<f32>()
                .map_err(|e| model_error("output tensor was not f32", &self.path, e))?
                .to_vec();
            softmax(&mut scores);
            out.push(scores);
        }
        Ok(out)
    }
}

/// ONNX segmenter. Output is `(1, 2, H, W)` logits (channel 1 = foreground)
/// or `(1, 1, H, W)` logits passed through a sigmoid.
///
/// Runnable plans are built per input size and kept.
pub struct TractSegmenter {
    name: String,
    path: PathBuf,
    plans: HashMap<(u32, u32), Plan>,
}

impl TractSegmenter {
    pub fn load<P: AsRef<Path>>(name: &str, path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.is_file() {
            return Err(AnalysisError::configuration(format!(
                "segmenter model {} not found at {}",
                name,
                path.display()
            )));
        }
        Ok(Self {
            name: name.to_string(),
            path,
            plans: HashMap::new(),
        })
    }
}

impl Segmenter for TractSegmenter {
    fn name(&self) -> &str {
        &self.name
    }

    fn segment(&mut self, image: &NormalizedImage) -> Result<ProbabilityMap> {
        let (w, h) = image.dimensions();
        if !self.plans.contains_key(&(w, h)) {
            let plan = build_plan(&self.path, h as usize, w as usize)?;
            self.plans.insert((w, h), plan);
        }
        let plan = &self.plans[&(w, h)];

        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 1, h as usize, w as usize),
            |(_, _, y, x)| image.get_pixel(x as u32, y as u32)[0],
        );
        let outputs = plan
            .run(tvec!(input.into_tensor().into()))
            .map_err(|e| model_error("inference failed", &self.path, e))?;
        let output = outputs
            .first()
            .ok_or_else(|| AnalysisError::model("model produced no outputs"))?;
        let channels = output.shape().get(1).copied().unwrap_or(0);
        let data = output
            .as_slice::<f32>()
            .map_err(|e| model_error("output tensor was not f32", &self.path, e))?;
        let plane = (w * h) as usize;
        if data.len() != channels * plane || channels == 0 {
            return Err(AnalysisError::model(format!(
                "unexpected segmenter output shape {:?}",
                output.shape()
            )));
        }

        Ok(ProbabilityMap::from_fn(w, h, |x, y| {
            let i = (y * w + x) as usize;
            let p = if channels == 1 {
                1.0 / (1.0 + (-data[i]).exp())
            } else {
                let mut logits: Vec<f32> = (0..channels).map(|c| data[c * plane + i]).collect();
                softmax(&mut logits);
                logits[1]
            };
            Luma([p])
        }))
    }
}
