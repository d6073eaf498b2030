use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::config::{Config, ModelEntry};
use crate::error::{AnalysisError, Result};

use super::backend::{PatchClassifier, Segmenter};
use super::backends::IntensitySegmenter;

pub type SharedClassifier = Arc<Mutex<dyn PatchClassifier>>;
pub type SharedSegmenter = Arc<Mutex<dyn Segmenter>>;

/// Variant name → model lookup.
///
/// Configured entries are loaded on first use and cached; backends
/// registered in-process take precedence over configured entries.
pub struct ModelRegistry {
    classifier_entries: BTreeMap<String, ModelEntry>,
    segmenter_entries: BTreeMap<String, ModelEntry>,
    classifiers: DashMap<String, SharedClassifier>,
    segmenters: DashMap<String, SharedSegmenter>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            classifier_entries: BTreeMap::new(),
            segmenter_entries: BTreeMap::new(),
            classifiers: DashMap::new(),
            segmenters: DashMap::new(),
        }
    }

    /// Registry with the configured artifacts and the built-in intensity segmenter.
    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::new();
        registry.classifier_entries = config.classifier_models.clone();
        registry.segmenter_entries = config.segmenter_models.clone();
        registry.register_segmenter("intensity", IntensitySegmenter::new());
        registry
    }

    pub fn register_classifier<C: PatchClassifier + 'static>(&self, variant: &str, classifier: C) {
        self.classifiers
            .insert(variant.to_string(), Arc::new(Mutex::new(classifier)));
    }

    pub fn register_segmenter<S: Segmenter + 'static>(&self, variant: &str, segmenter: S) {
        self.segmenters
            .insert(variant.to_string(), Arc::new(Mutex::new(segmenter)));
    }

    /// Classifier for `variant`, loading it on first use.
    pub fn classifier(&self, variant: &str) -> Result<SharedClassifier> {
        if let Some(found) = self.classifiers.get(variant) {
            return Ok(found.clone());
        }
        let entry = self.classifier_entries.get(variant).ok_or_else(|| {
            AnalysisError::configuration(format!(
                "unknown classifier variant '{}' (known: {})",
                variant,
                self.classifier_variants().join(", ")
            ))
        })?;
        let loaded = load_classifier(variant, entry)?;
        self.classifiers.insert(variant.to_string(), loaded.clone());
        Ok(loaded)
    }

    /// Segmenter for `variant`, loading it on first use.
    pub fn segmenter(&self, variant: &str) -> Result<SharedSegmenter> {
        if let Some(found) = self.segmenters.get(variant) {
            return Ok(found.clone());
        }
        let entry = self.segmenter_entries.get(variant).ok_or_else(|| {
            AnalysisError::configuration(format!(
                "unknown segmenter variant '{}' (known: {})",
                variant,
                self.segmenter_variants().join(", ")
            ))
        })?;
        let loaded = load_segmenter(variant, entry)?;
        self.segmenters.insert(variant.to_string(), loaded.clone());
        Ok(loaded)
    }

    /// All selectable classifier variants, sorted.
    pub fn classifier_variants(&self) -> Vec<String> {
        let mut names: Vec<String> = self.classifier_entries.keys().cloned().collect();
        names.extend(self.classifiers.iter().map(|e| e.key().clone()));
        names.sort();
        names.dedup();
        names
    }

    /// All selectable segmenter variants, sorted.
    pub fn segmenter_variants(&self) -> Vec<String> {
        let mut names: Vec<String> = self.segmenter_entries.keys().cloned().collect();
        names.extend(self.segmenters.iter().map(|e| e.key().clone()));
        names.sort();
        names.dedup();
        names
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "onnx")]
fn load_classifier(variant: &str, entry: &ModelEntry) -> Result<SharedClassifier> {
    let backend = super::backends::TractClassifier::load(variant, &entry.path, entry.input_size)?;
    Ok(Arc::new(Mutex::new(backend)))
}

#[cfg(not(feature = "onnx"))]
fn load_classifier(variant: &str, entry: &ModelEntry) -> Result<SharedClassifier> {
    Err(AnalysisError::configuration(format!(
        "classifier {} ({}) needs ONNX support, rebuild with the 'onnx' feature enabled",
        variant, entry.path
    )))
}

#[cfg(feature = "onnx")]
fn load_segmenter(variant: &str, entry: &ModelEntry) -> Result<SharedSegmenter> {
    let backend = super::backends::TractSegmenter::load(variant, &entry.path)?;
    Ok(Arc::new(Mutex::new(backend)))
}

#[cfg(not(feature = "onnx"))]
fn load_segmenter(variant: &str, entry: &ModelEntry) -> Result<SharedSegmenter> {
    Err(AnalysisError::configuration(format!(
        "segmenter {} ({}) needs ONNX support, rebuild with the 'onnx' feature enabled",
        variant, entry.path
    )))
}
