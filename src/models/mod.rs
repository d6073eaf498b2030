//! Model boundaries: patch classifiers, segmenters and the variant registry.

mod backend;
mod backends;
mod registry;

pub use backend::{normalize, softmax, NormalizedImage, PatchClassifier, Segmenter};
pub use backends::{IntensitySegmenter, StubClassifier};
pub use registry::{ModelRegistry, SharedClassifier, SharedSegmenter};

#[cfg(feature = "onnx")]
pub use backends::{TractClassifier, TractSegmenter};
