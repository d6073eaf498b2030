pub mod stub;

#[cfg(feature = "onnx")]
pub mod tract;

pub use stub::{IntensitySegmenter, StubClassifier};

#[cfg(feature = "onnx")]
pub use tract::{TractClassifier, TractSegmenter};
