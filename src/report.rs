//! Majority voting and the per-image region report.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::classes::ClassId;
use crate::classify::ClassPrediction;
use crate::error::{AnalysisError, Result};
use crate::regions::{BoundingBox, Region};

pub const CSV_HEADER: &str = "region_id,bbox_min_row,bbox_min_col,bbox_max_row,bbox_max_col,\
area,circularity,centroid_row,centroid_col,class_id,class_name,confidence";

/// One report line: region geometry joined with its prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRow {
    pub region_id: u32,
    pub bbox: BoundingBox,
    pub area: u32,
    pub circularity: f64,
    pub centroid: (f64, f64),
    pub class_id: ClassId,
    pub class_name: String,
    pub confidence: f32,
}

impl ReportRow {
    pub fn new(region: &Region, prediction: &ClassPrediction) -> Self {
        Self {
            region_id: region.id,
            bbox: region.bbox,
            area: region.area,
            circularity: region.circularity,
            centroid: region.centroid,
            class_id: prediction.class_id,
            class_name: prediction.class_name.clone(),
            confidence: prediction.confidence,
        }
    }

    fn to_csv(&self) -> String {
        format!(
            "{},{},{},{},{},{},{:.2},{:.2},{:.2},{},{},{:.2}",
            self.region_id,
            self.bbox.min_row,
            self.bbox.min_col,
            self.bbox.max_row,
            self.bbox.max_col,
            self.area,
            self.circularity,
            self.centroid.0,
            self.centroid.1,
            self.class_id,
            self.class_name,
            self.confidence
        )
    }

    fn from_csv(line: &str, line_no: usize) -> Result<Self> {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != 12 {
            return Err(AnalysisError::input(format!(
                "report line {}: expected 12 fields, found {}",
                line_no,
                fields.len()
            )));
        }
        let bad = |name: &str| {
            AnalysisError::input(format!("report line {}: invalid {}", line_no, name))
        };
        let int = |i: usize, name: &str| fields[i].parse::<u32>().map_err(|_| bad(name));
        let float = |i: usize, name: &str| fields[i].parse::<f64>().map_err(|_| bad(name));

        Ok(Self {
            region_id: int(0, "region_id")?,
            bbox: BoundingBox {
                min_row: int(1, "bbox_min_row")?,
                min_col: int(2, "bbox_min_col")?,
                max_row: int(3, "bbox_max_row")?,
                max_col: int(4, "bbox_max_col")?,
            },
            area: int(5, "area")?,
            circularity: float(6, "circularity")?,
            centroid: (float(7, "centroid_row")?, float(8, "centroid_col")?),
            class_id: int(9, "class_id")?,
            class_name: fields[10].to_string(),
            confidence: float(11, "confidence")? as f32,
        })
    }
}

/// Most frequent class id; ties go to the lowest id. `None` for no predictions.
pub fn majority_class(class_ids: &[ClassId]) -> Option<ClassId> {
    let mut counts: BTreeMap<ClassId, usize> = BTreeMap::new();
    for &id in class_ids {
        *counts.entry(id).or_insert(0) += 1;
    }
    // BTreeMap iterates ascending, so the first maximum wins ties.
    let mut best: Option<(ClassId, usize)> = None;
    for (id, count) in counts {
        if best.map_or(true, |(_, c)| count > c) {
            best = Some((id, count));
        }
    }
    best.map(|(id, _)| id)
}

/// Region analysis result for one image. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisReport {
    rows: Vec<ReportRow>,
    majority_class_id: Option<ClassId>,
    majority_class_name: Option<String>,
    classifier_variant: String,
    created: DateTime<Local>,
}

impl AnalysisReport {
    pub fn new(pairs: &[(Region, ClassPrediction)], classifier_variant: &str) -> Self {
        let rows: Vec<ReportRow> = pairs.iter().map(|(r, p)| ReportRow::new(r, p)).collect();
        Self::from_rows(rows, classifier_variant)
    }

    fn from_rows(rows: Vec<ReportRow>, classifier_variant: &str) -> Self {
        let ids: Vec<ClassId> = rows.iter().map(|r| r.class_id).collect();
        let majority_class_id = majority_class(&ids);
        let majority_class_name = majority_class_id.and_then(|id| {
            rows.iter()
                .find(|r| r.class_id == id)
                .map(|r| r.class_name.clone())
        });
        Self {
            rows,
            majority_class_id,
            majority_class_name,
            classifier_variant: classifier_variant.to_string(),
            created: Local::now(),
        }
    }

    pub fn rows(&self) -> &[ReportRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn majority_class_id(&self) -> Option<ClassId> {
        self.majority_class_id
    }

    pub fn majority_class_name(&self) -> Option<&str> {
        self.majority_class_name.as_deref()
    }

    pub fn classifier_variant(&self) -> &str {
        &self.classifier_variant
    }

    pub fn created(&self) -> DateTime<Local> {
        self.created
    }

    /// Write the rows as CSV. The parent directory must already exist.
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut writer = create_in_existing_dir(path)?;
        let io = |e| AnalysisError::io_at(path, e);
        writeln!(writer, "{}", CSV_HEADER).map_err(io)?;
        for row in &self.rows {
            writeln!(writer, "{}", row.to_csv()).map_err(io)?;
        }
        writer.flush().map_err(io)?;
        log::info!("Report with {} rows saved to {}", self.rows.len(), path.display());
        Ok(())
    }

    /// Write the full report, including majority class and timestamp, as JSON.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let writer = create_in_existing_dir(path)?;
        serde_json::to_writer_pretty(writer, self)
            .map_err(|e| AnalysisError::io_at(path, e.into()))?;
        Ok(())
    }

    /// Read a report written by [`AnalysisReport::write_csv`]. The majority
    /// class is recomputed from the rows.
    pub fn read_csv(path: &Path, classifier_variant: &str) -> Result<Self> {
        let file = File::open(path).map_err(|e| AnalysisError::io_at(path, e))?;
        let mut rows = Vec::new();
        for (i, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| AnalysisError::io_at(path, e))?;
            if i == 0 || line.trim().is_empty() {
                continue;
            }
            rows.push(ReportRow::from_csv(&line, i + 1)?);
        }
        Ok(Self::from_rows(rows, classifier_variant))
    }
}

/// Fail with an I/O error naming the directory when `path`'s parent is missing.
pub(crate) fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if !parent.is_dir() {
            return Err(AnalysisError::io_at(
                path,
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("output directory {} does not exist", parent.display()),
                ),
            ));
        }
    }
    Ok(())
}

/// Create `path` for writing without ever creating directories.
pub(crate) fn create_in_existing_dir(path: &Path) -> Result<BufWriter<File>> {
    ensure_parent_dir(path)?;
    let file = File::create(path).map_err(|e| AnalysisError::io_at(path, e))?;
    Ok(BufWriter::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(id: u32, class_id: ClassId, name: &str) -> (Region, ClassPrediction) {
        (
            Region {
                id,
                bbox: BoundingBox { min_row: id, min_col: 2, max_row: id + 10, max_col: 12 },
                area: 80 + id,
                perimeter: 31.4,
                circularity: 0.912345,
                centroid: (id as f64 + 4.5, 7.25),
            },
            ClassPrediction {
                class_id,
                class_name: name.to_string(),
                confidence: 0.876,
                scores: vec![0.0, 0.876],
            },
        )
    }

    #[test]
    fn test_majority_class() {
        assert_eq!(majority_class(&[2, 2, 3, 3, 3, 5]), Some(3));
        assert_eq!(majority_class(&[2, 2, 3, 3]), Some(2));
        assert_eq!(majority_class(&[3, 3, 2, 2]), Some(2));
        assert_eq!(majority_class(&[]), None);
    }

    #[test]
    fn test_report_majority_name() {
        let pairs = vec![pair(1, 2, "QtEnc"), pair(2, 1, "MxEnc"), pair(3, 2, "QtEnc")];
        let report = AnalysisReport::new(&pairs, "stub");
        assert_eq!(report.len(), 3);
        assert_eq!(report.majority_class_id(), Some(2));
        assert_eq!(report.majority_class_name(), Some("QtEnc"));
    }

    #[test]
    fn test_csv_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img_cls.csv");
        let pairs = vec![pair(1, 2, "QtEnc"), pair(2, 1, "MxEnc")];
        let report = AnalysisReport::new(&pairs, "stub");
        report.write_csv(&path).unwrap();

        let back = AnalysisReport::read_csv(&path, "stub").unwrap();
        assert_eq!(back.len(), report.len());
        let ids = |r: &AnalysisReport| -> Vec<(u32, u32)> {
            r.rows().iter().map(|row| (row.region_id, row.class_id)).collect()
        };
        assert_eq!(ids(&back), ids(&report));
        assert_eq!(back.rows()[0].circularity, 0.91);
        assert_eq!(back.rows()[0].confidence, 0.88);
        assert_eq!(back.rows()[0].bbox, report.rows()[0].bbox);
    }

    #[test]
    fn test_missing_parent_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("out.csv");
        let report = AnalysisReport::new(&[pair(1, 1, "A")], "stub");
        let err = report.write_csv(&path).unwrap_err();
        assert!(matches!(err, AnalysisError::Io { .. }));
        assert!(err.to_string().contains("does not exist"));
        assert!(!path.exists());
    }

    #[test]
    fn test_json_has_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        AnalysisReport::new(&[pair(1, 1, "A")], "effnet").write_json(&path).unwrap();
        let value: serde_json::Value =
            serde_json::from_reader(File::open(&path).unwrap()).unwrap();
        assert_eq!(value["majority_class_name"], "A");
        assert_eq!(value["classifier_variant"], "effnet");
        assert_eq!(value["rows"].as_array().unwrap().len(), 1);
    }
}
