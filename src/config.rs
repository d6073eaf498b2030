use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use imageproc::region_labelling::Connectivity;

use crate::error::{AnalysisError, Result};

pub const CONFIG_PATH: &str = "config.json";

/// Available run modes for the application
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Region analysis of an image and its mask
    #[default]
    Analyze,
    /// Segment an image into a particle mask
    Segment,
    /// Render a class overlay of an image and its mask
    Overlay,
    /// Evaluate a patch classifier on a labelled patch directory
    Evaluate,
}

/// Shape drawn around each analysed region in the shape layer
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ShapeKind {
    Ellipse,
    Rectangle,
    #[default]
    None,
}

/// What to do with a prediction outside the allowed classes
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutOfSetPolicy {
    /// Pick the best-scoring allowed class instead
    #[default]
    Restrict,
    /// Drop the region from the report
    Exclude,
}

/// Pixel neighbourhood used for connected components
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Neighbourhood {
    Four,
    #[default]
    Eight,
}

impl From<Neighbourhood> for Connectivity {
    fn from(n: Neighbourhood) -> Self {
        match n {
            Neighbourhood::Four => Connectivity::Four,
            Neighbourhood::Eight => Connectivity::Eight,
        }
    }
}

/// A model artifact selectable by variant name
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ModelEntry {
    pub path: String,
    /// Square patch side for classifiers; ignored for segmenters
    #[serde(default = "default_input_size")]
    pub input_size: u32,
}

/// Segmentation settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SegmentationOptions {
    #[serde(default = "default_segmenter_variant")]
    pub variant: String,
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    #[serde(default = "default_min_particle_size")]
    pub min_particle_size: u32,
    #[serde(default = "default_hole_area_threshold")]
    pub hole_area_threshold: u32,
    /// Also write the raw probability map as `<stem>_probmap.png`
    #[serde(default)]
    pub save_probability_map: bool,
}

impl Default for SegmentationOptions {
    fn default() -> Self {
        SegmentationOptions {
            variant: default_segmenter_variant(),
            threshold: default_threshold(),
            min_particle_size: default_min_particle_size(),
            hole_area_threshold: default_hole_area_threshold(),
            save_probability_map: false,
        }
    }
}

/// Region analysis settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RegionAnalysisOptions {
    #[serde(default = "default_classifier_variant")]
    pub classifier_variant: String,
    /// Class or class group names; empty means all classes
    #[serde(default = "default_allowed_classes")]
    pub allowed_classes: Vec<String>,
    #[serde(default)]
    pub out_of_set_policy: OutOfSetPolicy,
    #[serde(default = "default_min_particle_size")]
    pub min_size: u32,
    #[serde(default = "default_max_particle_size")]
    pub max_size: u32,
    #[serde(default = "default_min_circularity")]
    pub min_circularity: f64,
    #[serde(default)]
    pub shape_type: ShapeKind,
    #[serde(default = "default_true")]
    pub relabel_inplace: bool,
    #[serde(default = "default_true")]
    pub erase_background: bool,
    /// Region mask dilation (pixels) before erasing patch background
    #[serde(default = "default_mask_dilation")]
    pub mask_dilation: u8,
    #[serde(default)]
    pub connectivity: Neighbourhood,
    /// Holes filled in a supplied mask before measuring; 0 keeps the mask as given
    #[serde(default)]
    pub hole_area_threshold: u32,
    /// Components removed from a supplied mask before measuring; 0 keeps them all
    #[serde(default)]
    pub min_object_size: u32,
}

impl Default for RegionAnalysisOptions {
    fn default() -> Self {
        RegionAnalysisOptions {
            classifier_variant: default_classifier_variant(),
            allowed_classes: default_allowed_classes(),
            out_of_set_policy: OutOfSetPolicy::Restrict,
            min_size: default_min_particle_size(),
            max_size: default_max_particle_size(),
            min_circularity: default_min_circularity(),
            shape_type: ShapeKind::None,
            relabel_inplace: true,
            erase_background: true,
            mask_dilation: default_mask_dilation(),
            connectivity: Neighbourhood::Eight,
            hole_area_threshold: 0,
            min_object_size: 0,
        }
    }
}

/// Input paths for analyze and overlay modes
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ImageMaskOptions {
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub mask: String,
    /// Output path; empty means the session default
    #[serde(default)]
    pub output: String,
}

/// Input path for segment mode
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct SegmentModeOptions {
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub output: String,
    /// Ground-truth label image; empty skips the comparison
    #[serde(default)]
    pub ground_truth: String,
}

/// Options for evaluate mode
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EvaluateOptions {
    #[serde(default = "default_patch_directory")]
    pub patch_directory: String,
}

impl Default for EvaluateOptions {
    fn default() -> Self {
        EvaluateOptions {
            patch_directory: default_patch_directory(),
        }
    }
}

/// Holds all mode-specific configuration options
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ModeOptions {
    #[serde(default)]
    pub analyze: ImageMaskOptions,
    #[serde(default)]
    pub segment: SegmentModeOptions,
    #[serde(default)]
    pub overlay: ImageMaskOptions,
    #[serde(default)]
    pub evaluate: EvaluateOptions,
}

/// Application configuration structure that matches config.json
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    // Resources
    #[serde(default = "default_class_info_path")]
    pub class_info_path: String,
    #[serde(default = "default_output_directory")]
    pub output_directory: String,

    // Model variants
    #[serde(default = "default_classifier_models")]
    pub classifier_models: BTreeMap<String, ModelEntry>,
    #[serde(default)]
    pub segmenter_models: BTreeMap<String, ModelEntry>,

    // Processing settings
    #[serde(default)]
    pub segmentation: SegmentationOptions,
    #[serde(default)]
    pub region_analysis: RegionAnalysisOptions,

    #[serde(default = "default_supported_formats")]
    pub supported_formats: Vec<String>,

    // General settings
    #[serde(default = "default_log_level")]
    pub log_level: String,

    // Mode selection and options
    #[serde(default)]
    pub run_mode: RunMode,
    #[serde(default)]
    pub mode_options: ModeOptions,
}

// Default functions for parameters
fn default_true() -> bool {
    true
}

fn default_input_size() -> u32 {
    28
}

fn default_segmenter_variant() -> String {
    "intensity".to_string()
}

fn default_classifier_variant() -> String {
    "effnet_all_v15".to_string()
}

fn default_threshold() -> f32 {
    0.5
}

fn default_min_particle_size() -> u32 {
    60
}

fn default_max_particle_size() -> u32 {
    1000
}

fn default_hole_area_threshold() -> u32 {
    2000
}

fn default_min_circularity() -> f64 {
    0.8
}

fn default_mask_dilation() -> u8 {
    5
}

fn default_allowed_classes() -> Vec<String> {
    vec!["simple_hek".to_string()]
}

fn default_class_info_path() -> String {
    "class_info.json".to_string()
}

fn default_output_directory() -> String {
    std::env::temp_dir().to_string_lossy().to_string()
}

fn default_patch_directory() -> String {
    "data/patches".to_string()
}

fn default_classifier_models() -> BTreeMap<String, ModelEntry> {
    let mut models = BTreeMap::new();
    models.insert(
        default_classifier_variant(),
        ModelEntry {
            path: "models/effnet_all_v15.onnx".to_string(),
            input_size: default_input_size(),
        },
    );
    models
}

fn default_supported_formats() -> Vec<String> {
    vec![
        "png".to_string(),
        "tif".to_string(),
        "tiff".to_string(),
        "jpg".to_string(),
        "jpeg".to_string(),
    ]
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            class_info_path: default_class_info_path(),
            output_directory: default_output_directory(),
            classifier_models: default_classifier_models(),
            segmenter_models: BTreeMap::new(),
            segmentation: SegmentationOptions::default(),
            region_analysis: RegionAnalysisOptions::default(),
            supported_formats: default_supported_formats(),
            log_level: default_log_level(),
            run_mode: RunMode::Analyze,
            mode_options: ModeOptions::default(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| AnalysisError::io_at(path, e))?;
        let reader = BufReader::new(file);
        let config = serde_json::from_reader(reader)?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| AnalysisError::io_at(path, e))?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    /// Scratch directory for outputs without a source image
    pub fn get_output_dir(&self) -> PathBuf {
        PathBuf::from(&self.output_directory)
    }

    pub fn get_class_info_path(&self) -> PathBuf {
        PathBuf::from(&self.class_info_path)
    }

    /// Check if a file extension is supported
    pub fn is_supported_format(&self, extension: &str) -> bool {
        self.supported_formats
            .iter()
            .any(|format| format.eq_ignore_ascii_case(extension))
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        let ra = &self.region_analysis;
        if ra.min_size > ra.max_size {
            return Err(AnalysisError::configuration(format!(
                "min_size {} exceeds max_size {}",
                ra.min_size, ra.max_size
            )));
        }
        if !(0.0..=1.0).contains(&ra.min_circularity) {
            return Err(AnalysisError::configuration(
                "min_circularity must be between 0.0 and 1.0",
            ));
        }
        if !(0.0..=1.0).contains(&self.segmentation.threshold) {
            return Err(AnalysisError::configuration(
                "segmentation threshold must be between 0.0 and 1.0",
            ));
        }
        if let Some((name, _)) = self.classifier_models.iter().find(|(_, m)| m.input_size == 0) {
            return Err(AnalysisError::configuration(format!(
                "classifier {} has input_size 0",
                name
            )));
        }
        Ok(())
    }

    /// Modify a single setting by dotted key
    ///
    /// The change is validated on a copy; a rejected value leaves `self` untouched.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut updated = self.clone();
        updated.apply(key, value)?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        let bad = |e: &dyn std::fmt::Display| {
            AnalysisError::configuration(format!("invalid value for {}: {}", key, e))
        };
        match key {
            "class_info_path" => self.class_info_path = value.to_string(),
            "output_directory" => self.output_directory = value.to_string(),
            "log_level" => self.log_level = value.to_string(),
            "segmentation.variant" => self.segmentation.variant = value.to_string(),
            "segmentation.threshold" => {
                self.segmentation.threshold = value.parse::<f32>().map_err(|e| bad(&e))?
            }
            "segmentation.save_probability_map" => {
                self.segmentation.save_probability_map = value.parse::<bool>().map_err(|e| bad(&e))?
            }
            "segmentation.min_particle_size" => {
                self.segmentation.min_particle_size = value.parse::<u32>().map_err(|e| bad(&e))?
            }
            "region_analysis.classifier_variant" => {
                self.region_analysis.classifier_variant = value.to_string()
            }
            "region_analysis.allowed_classes" => {
                self.region_analysis.allowed_classes = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            }
            "region_analysis.min_size" => {
                self.region_analysis.min_size = value.parse::<u32>().map_err(|e| bad(&e))?
            }
            "region_analysis.max_size" => {
                self.region_analysis.max_size = value.parse::<u32>().map_err(|e| bad(&e))?
            }
            "region_analysis.min_circularity" => {
                self.region_analysis.min_circularity = value.parse::<f64>().map_err(|e| bad(&e))?
            }
            "region_analysis.hole_area_threshold" => {
                self.region_analysis.hole_area_threshold = value.parse::<u32>().map_err(|e| bad(&e))?
            }
            "region_analysis.min_object_size" => {
                self.region_analysis.min_object_size = value.parse::<u32>().map_err(|e| bad(&e))?
            }
            "region_analysis.relabel_inplace" => {
                self.region_analysis.relabel_inplace = value.parse::<bool>().map_err(|e| bad(&e))?
            }
            "region_analysis.shape_type" | "region_analysis.out_of_set_policy" | "run_mode" => {
                // Enum values go through serde so the accepted spellings match config.json.
                let json = serde_json::Value::String(value.to_string());
                match key {
                    "region_analysis.shape_type" => {
                        self.region_analysis.shape_type = serde_json::from_value(json)?
                    }
                    "region_analysis.out_of_set_policy" => {
                        self.region_analysis.out_of_set_policy = serde_json::from_value(json)?
                    }
                    _ => self.run_mode = serde_json::from_value(json)?,
                }
            }
            _ => {
                return Err(AnalysisError::configuration(format!(
                    "Unknown configuration key: {}",
                    key
                )))
            }
        }
        Ok(())
    }
}

/// Load the configuration, creating a default one if it doesn't exist
pub fn load_config_from<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        let default_config = Config::default();
        default_config.save_to_file(path)?;
        log::info!("Created default configuration file: {}", path.display());
    }

    let mut config = Config::from_file(path)?;

    // Validate and apply post-load logic
    if config.log_level.is_empty() {
        config.log_level = default_log_level();
    }
    config.validate()?;

    Ok(config)
}

pub fn load_config() -> Result<Config> {
    load_config_from(CONFIG_PATH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_region_widget() {
        let config = Config::default();
        let ra = &config.region_analysis;
        assert_eq!(ra.min_size, 60);
        assert_eq!(ra.max_size, 1000);
        assert_eq!(ra.min_circularity, 0.8);
        assert_eq!(ra.shape_type, ShapeKind::None);
        assert!(ra.relabel_inplace);
        assert_eq!(config.segmentation.threshold, 0.5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"region_analysis": {"min_size": 10, "shape_type": "ellipse"}}"#)
                .unwrap();
        assert_eq!(config.region_analysis.min_size, 10);
        assert_eq!(config.region_analysis.max_size, 1000);
        assert_eq!(config.region_analysis.shape_type, ShapeKind::Ellipse);
        assert_eq!(config.run_mode, RunMode::Analyze);
    }

    #[test]
    fn test_set_validates() {
        let mut config = Config::default();
        config.set("region_analysis.min_circularity", "0.5").unwrap();
        assert_eq!(config.region_analysis.min_circularity, 0.5);
        assert!(config.set("region_analysis.min_size", "5000").is_err());
        assert_eq!(config.region_analysis.min_size, 60);
        assert!(config.set("no.such.key", "1").is_err());
        config.set("region_analysis.shape_type", "rectangle").unwrap();
        assert_eq!(config.region_analysis.shape_type, ShapeKind::Rectangle);
        config.set("run_mode", "evaluate").unwrap();
        assert_eq!(config.run_mode, RunMode::Evaluate);
    }

    #[test]
    fn test_rejected_set_keeps_previous_value() {
        let mut config = Config::default();
        config.set("region_analysis.max_size", "500").unwrap();
        assert!(config.set("region_analysis.min_size", "800").is_err());
        assert_eq!(config.region_analysis.min_size, 60);
        assert!(config.set("region_analysis.min_circularity", "1.5").is_err());
        assert_eq!(config.region_analysis.min_circularity, 0.8);
        config.set("region_analysis.min_size", "100").unwrap();
        assert_eq!(config.region_analysis.min_size, 100);
        assert!(config.validate().is_ok());
    }
}
