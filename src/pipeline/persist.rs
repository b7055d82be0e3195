//! Result persistence.
//!
//! [`FileSink`] writes the deduplicated records as one JSON document plus
//! three CSV tables, each with a leading 1-based `id` column. Every file is
//! written to a `.tmp` sibling first and renamed into place, on tokio's
//! blocking pool.

use crate::error::DongyError;
use crate::output::{AggregateResult, FormulaLine, Herb, Prescription};
use std::future::Future;
use std::path::{Path, PathBuf};
use tracing::info;

pub const JSON_FILE: &str = "thuoc_dong_y.json";
pub const HERB_CSV: &str = "vi_thuoc.csv";
pub const PRESCRIPTION_CSV: &str = "bai_thuoc.csv";
pub const FORMULA_CSV: &str = "cong_thuc.csv";

const HERB_COLUMNS: [&str; 11] = [
    "ten_vi_thuoc",
    "ten_khoa_hoc",
    "ten_khac",
    "ho",
    "bo_phan_dung",
    "tinh_vi",
    "quy_kinh",
    "cong_nang",
    "chu_tri",
    "lieu_dung",
    "kieng_ky",
];

const PRESCRIPTION_COLUMNS: [&str; 6] = [
    "ten_bai_thuoc",
    "nguon_goc",
    "cong_dung",
    "chu_tri",
    "cach_dung",
    "ghi_chu",
];

const FORMULA_COLUMNS: [&str; 4] = ["ten_bai_thuoc", "ten_vi_thuoc", "lieu_luong", "vai_tro"];

/// Receives the final, deduplicated result of a run.
pub trait ResultSink: Send + Sync {
    /// Persist `result`; returns the paths written.
    fn persist(
        &self,
        result: &AggregateResult,
    ) -> impl Future<Output = Result<Vec<PathBuf>, DongyError>> + Send;
}

/// Writes JSON and CSV exports into one directory.
#[derive(Debug, Clone)]
pub struct FileSink {
    dir: PathBuf,
}

impl FileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ResultSink for FileSink {
    async fn persist(&self, result: &AggregateResult) -> Result<Vec<PathBuf>, DongyError> {
        let dir = self.dir.clone();
        let result = result.clone();
        tokio::task::spawn_blocking(move || write_exports(&dir, &result))
            .await
            .map_err(|e| DongyError::Internal(format!("export task failed: {}", e)))?
    }
}

fn write_exports(dir: &Path, result: &AggregateResult) -> Result<Vec<PathBuf>, DongyError> {
    std::fs::create_dir_all(dir).map_err(|e| DongyError::OutputWriteFailed {
        path: dir.to_path_buf(),
        source: e,
    })?;

    let json_path = dir.join(JSON_FILE);
    let json = serde_json::to_vec_pretty(result)
        .map_err(|e| DongyError::Internal(format!("result serialisation: {}", e)))?;
    write_atomic(&json_path, &json)?;

    let herb_path = dir.join(HERB_CSV);
    write_table(&herb_path, &HERB_COLUMNS, result.vi_thuoc.iter().map(herb_row))?;

    let prescription_path = dir.join(PRESCRIPTION_CSV);
    write_table(
        &prescription_path,
        &PRESCRIPTION_COLUMNS,
        result.bai_thuoc.iter().map(prescription_row),
    )?;

    let formula_path = dir.join(FORMULA_CSV);
    write_table(&formula_path, &FORMULA_COLUMNS, result.cong_thuc.iter().map(formula_row))?;

    info!(
        "Saved {} herbs, {} prescriptions, {} formula lines to {}",
        result.vi_thuoc.len(),
        result.bai_thuoc.len(),
        result.cong_thuc.len(),
        dir.display()
    );
    Ok(vec![json_path, herb_path, prescription_path, formula_path])
}

fn herb_row(h: &Herb) -> Vec<&str> {
    let mut row = vec![h.name.as_str(), h.scientific_name.as_str()];
    row.extend(h.attributes().into_iter().map(String::as_str));
    row
}

fn prescription_row(p: &Prescription) -> Vec<&str> {
    let mut row = vec![p.name.as_str()];
    row.extend(p.attributes().into_iter().map(String::as_str));
    row
}

fn formula_row(f: &FormulaLine) -> Vec<&str> {
    vec![
        f.prescription.as_str(),
        f.herb.as_str(),
        f.dosage.as_str(),
        f.role.as_str(),
    ]
}

fn write_table<'a>(
    path: &Path,
    columns: &[&str],
    rows: impl Iterator<Item = Vec<&'a str>>,
) -> Result<(), DongyError> {
    let csv_error = |detail: String| DongyError::CsvWriteFailed {
        path: path.to_path_buf(),
        detail,
    };
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(std::iter::once("id").chain(columns.iter().copied()))
        .map_err(|e| csv_error(e.to_string()))?;
    for (idx, row) in rows.enumerate() {
        let id = (idx + 1).to_string();
        writer
            .write_record(std::iter::once(id.as_str()).chain(row))
            .map_err(|e| csv_error(e.to_string()))?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| csv_error(e.to_string()))?;
    write_atomic(path, &bytes)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), DongyError> {
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, bytes)
        .and_then(|()| std::fs::rename(&tmp_path, path))
        .map_err(|e| DongyError::OutputWriteFailed {
            path: path.to_path_buf(),
            source: e,
        })
}
