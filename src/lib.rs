// Export modules
pub mod classes;
pub mod classify;
pub mod config;
pub mod error;
pub mod evaluate;
pub mod ground_truth;
pub mod mask;
pub mod models;
pub mod overlay;
pub mod pipeline;
pub mod regions;
pub mod report;
pub mod segmentation;
pub mod session;
pub mod worker;

// Re-export commonly used types
pub use classes::{ClassColors, ClassId, ClassRegistry};
pub use config::{Config, OutOfSetPolicy, RunMode, ShapeKind};
pub use error::{AnalysisError, Result};
pub use mask::Mask;
pub use pipeline::{AnalysisOutcome, LayerData, RegionAnalysis, RegionAnalysisParams, Severity, StatusMessage};
pub use regions::{Region, BoundingBox};
pub use report::AnalysisReport;
pub use session::Session;
pub use worker::{AnalysisWorker, ProgressIndicator};
