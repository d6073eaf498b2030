use std::path::{Path, PathBuf};

use crate::config::Config;

const SCRATCH_STEM: &str = "ec-cls";

/// Per-run context that decides where outputs land when no path is given.
#[derive(Debug, Clone)]
pub struct Session {
    source_path: Option<PathBuf>,
    scratch_dir: PathBuf,
}

impl Session {
    pub fn new(scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_path: None,
            scratch_dir: scratch_dir.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.get_output_dir())
    }

    /// Remember the image the current analysis came from.
    pub fn open_source(&mut self, path: impl Into<PathBuf>) {
        self.source_path = Some(path.into());
    }

    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// `<source stem>_cls.csv` next to the source, else `ec-cls.csv` in the scratch dir.
    pub fn default_report_path(&self) -> PathBuf {
        self.default_path("csv")
    }

    /// `<source stem>_cls.png` next to the source, else `ec-cls.png` in the scratch dir.
    pub fn default_overlay_path(&self) -> PathBuf {
        self.default_path("png")
    }

    fn default_path(&self, extension: &str) -> PathBuf {
        let stem = self
            .source_path
            .as_deref()
            .and_then(|p| p.file_stem())
            .map(|s| s.to_string_lossy().to_string());
        match (stem, &self.source_path) {
            (Some(stem), Some(source)) => {
                source.with_file_name(format!("{}_cls.{}", stem, extension))
            }
            _ => self
                .scratch_dir
                .join(format!("{}.{}", SCRATCH_STEM, extension)),
        }
    }
}
