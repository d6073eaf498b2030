use std::fmt;
use std::io;
use std::path::PathBuf;

/// Errors raised by the analysis pipeline.
#[derive(Debug)]
pub enum AnalysisError {
    /// Missing or malformed class registry, unknown model variant, bad settings.
    Configuration(String),
    /// Unusable user input (no mask, empty mask, mismatched dimensions).
    Input(String),
    /// Failure to read or write a file. The path is kept for the status message.
    Io { path: Option<PathBuf>, source: io::Error },
    /// Image decoding or encoding failure.
    Image(image::ImageError),
    /// Failure reported by a model backend.
    Model(String),
}

impl AnalysisError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        AnalysisError::Configuration(msg.into())
    }

    pub fn input(msg: impl Into<String>) -> Self {
        AnalysisError::Input(msg.into())
    }

    pub fn model(msg: impl Into<String>) -> Self {
        AnalysisError::Model(msg.into())
    }

    /// Attach a path to an I/O error.
    pub fn io_at(path: impl Into<PathBuf>, source: io::Error) -> Self {
        AnalysisError::Io {
            path: Some(path.into()),
            source,
        }
    }

    /// True for errors that come from what the user supplied rather than the setup.
    pub fn is_user_facing(&self) -> bool {
        matches!(self, AnalysisError::Input(_))
    }
}

impl fmt::Display for AnalysisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisError::Configuration(msg) => write!(f, "configuration error: {}", msg),
            AnalysisError::Input(msg) => write!(f, "{}", msg),
            AnalysisError::Io { path: Some(path), source } => {
                write!(f, "I/O error at {}: {}", path.display(), source)
            }
            AnalysisError::Io { path: None, source } => write!(f, "I/O error: {}", source),
            AnalysisError::Image(e) => write!(f, "image error: {}", e),
            AnalysisError::Model(msg) => write!(f, "model error: {}", msg),
        }
    }
}

impl std::error::Error for AnalysisError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AnalysisError::Io { source, .. } => Some(source),
            AnalysisError::Image(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for AnalysisError {
    fn from(source: io::Error) -> Self {
        AnalysisError::Io { path: None, source }
    }
}

impl From<image::ImageError> for AnalysisError {
    fn from(e: image::ImageError) -> Self {
        AnalysisError::Image(e)
    }
}

impl From<serde_json::Error> for AnalysisError {
    fn from(e: serde_json::Error) -> Self {
        AnalysisError::Configuration(format!("invalid JSON: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, AnalysisError>;
