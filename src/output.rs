//! Record types produced by an extraction run.
//!
//! Serialized field names are the Vietnamese column names used by the JSON
//! export, the CSV tables and the checkpoint file, so a checkpoint written by
//! one version can be resumed by another and downstream notebooks keep
//! working. Rust-side names are English.
//!
//! Identity fields default to `""`. Every other field defaults to
//! [`NO_INFO`]: the merger distinguishes "the model said nothing" from
//! "the model said something" by comparing against that sentinel, so an
//! attribute is never absent.

use crate::config::NO_INFO;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;

fn no_info() -> String {
    NO_INFO.to_string()
}

/// Lenient field deserializers: models emit numbers, nulls and lists where
/// text was asked for.
mod lenient {
    use super::*;
    use serde_json::Value;

    fn flatten(value: Value) -> String {
        match value {
            Value::Null => String::new(),
            Value::String(s) => s.trim().to_string(),
            Value::Array(items) => items
                .into_iter()
                .map(flatten)
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(", "),
            other => other.to_string(),
        }
    }

    /// Identity text: missing or null becomes `""`.
    pub fn text<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        Ok(flatten(Value::deserialize(d)?))
    }

    /// Attribute text: missing, null or blank becomes the sentinel.
    pub fn info<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        let s = flatten(Value::deserialize(d)?);
        Ok(if s.is_empty() { no_info() } else { s })
    }
}

/// True when a field carries no usable information.
pub fn is_uninformative(value: &str) -> bool {
    let v = value.trim();
    v.is_empty() || v == NO_INFO
}

/// Case-folded, whitespace-collapsed key used for identity comparisons.
pub fn normalize_key(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// One medicinal herb (*vị thuốc*).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Herb {
    #[serde(rename = "ten_vi_thuoc", default, deserialize_with = "lenient::text")]
    pub name: String,
    #[serde(rename = "ten_khoa_hoc", default, deserialize_with = "lenient::text")]
    pub scientific_name: String,
    #[serde(rename = "ten_khac", default = "no_info", deserialize_with = "lenient::info")]
    pub other_names: String,
    #[serde(rename = "ho", default = "no_info", deserialize_with = "lenient::info")]
    pub family: String,
    #[serde(rename = "bo_phan_dung", default = "no_info", deserialize_with = "lenient::info")]
    pub part_used: String,
    #[serde(rename = "tinh_vi", default = "no_info", deserialize_with = "lenient::info")]
    pub nature_flavor: String,
    #[serde(rename = "quy_kinh", default = "no_info", deserialize_with = "lenient::info")]
    pub meridians: String,
    #[serde(rename = "cong_nang", default = "no_info", deserialize_with = "lenient::info")]
    pub actions: String,
    #[serde(rename = "chu_tri", default = "no_info", deserialize_with = "lenient::info")]
    pub indications: String,
    #[serde(rename = "lieu_dung", default = "no_info", deserialize_with = "lenient::info")]
    pub dosage: String,
    #[serde(rename = "kieng_ky", default = "no_info", deserialize_with = "lenient::info")]
    pub contraindications: String,
}

impl Herb {
    /// A herb with the given identity and every attribute set to the sentinel.
    pub fn new(name: impl Into<String>, scientific_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scientific_name: scientific_name.into(),
            other_names: no_info(),
            family: no_info(),
            part_used: no_info(),
            nature_flavor: no_info(),
            meridians: no_info(),
            actions: no_info(),
            indications: no_info(),
            dosage: no_info(),
            contraindications: no_info(),
        }
    }

    pub fn attributes_mut(&mut self) -> [&mut String; 9] {
        [
            &mut self.other_names,
            &mut self.family,
            &mut self.part_used,
            &mut self.nature_flavor,
            &mut self.meridians,
            &mut self.actions,
            &mut self.indications,
            &mut self.dosage,
            &mut self.contraindications,
        ]
    }

    pub fn attributes(&self) -> [&String; 9] {
        [
            &self.other_names,
            &self.family,
            &self.part_used,
            &self.nature_flavor,
            &self.meridians,
            &self.actions,
            &self.indications,
            &self.dosage,
            &self.contraindications,
        ]
    }
}

/// One prescription (*bài thuốc*).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prescription {
    #[serde(rename = "ten_bai_thuoc", default, deserialize_with = "lenient::text")]
    pub name: String,
    #[serde(rename = "nguon_goc", default = "no_info", deserialize_with = "lenient::info")]
    pub source: String,
    #[serde(rename = "cong_dung", default = "no_info", deserialize_with = "lenient::info")]
    pub effects: String,
    #[serde(rename = "chu_tri", default = "no_info", deserialize_with = "lenient::info")]
    pub indications: String,
    #[serde(rename = "cach_dung", default = "no_info", deserialize_with = "lenient::info")]
    pub usage: String,
    #[serde(rename = "ghi_chu", default = "no_info", deserialize_with = "lenient::info")]
    pub notes: String,
}

impl Prescription {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: no_info(),
            effects: no_info(),
            indications: no_info(),
            usage: no_info(),
            notes: no_info(),
        }
    }

    pub fn attributes_mut(&mut self) -> [&mut String; 5] {
        [
            &mut self.source,
            &mut self.effects,
            &mut self.indications,
            &mut self.usage,
            &mut self.notes,
        ]
    }

    pub fn attributes(&self) -> [&String; 5] {
        [
            &self.source,
            &self.effects,
            &self.indications,
            &self.usage,
            &self.notes,
        ]
    }
}

/// One ingredient line of a prescription (*công thức*).
///
/// Links a prescription and a herb by name only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormulaLine {
    #[serde(rename = "ten_bai_thuoc", default, deserialize_with = "lenient::text")]
    pub prescription: String,
    #[serde(rename = "ten_vi_thuoc", default, deserialize_with = "lenient::text")]
    pub herb: String,
    #[serde(rename = "lieu_luong", default, deserialize_with = "lenient::text")]
    pub dosage: String,
    #[serde(rename = "vai_tro", default = "no_info", deserialize_with = "lenient::info")]
    pub role: String,
}

impl FormulaLine {
    pub fn new(
        prescription: impl Into<String>,
        herb: impl Into<String>,
        dosage: impl Into<String>,
    ) -> Self {
        Self {
            prescription: prescription.into(),
            herb: herb.into(),
            dosage: dosage.into(),
            role: no_info(),
        }
    }

    /// Normalized identity triple.
    pub fn key(&self) -> (String, String, String) {
        (
            normalize_key(&self.prescription),
            normalize_key(&self.herb),
            normalize_key(&self.dosage),
        )
    }
}

/// Where a partial result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub start_page: usize,
    pub end_page: usize,
    pub position: usize,
}

/// Records extracted from one text slice.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    #[serde(default)]
    pub vi_thuoc: Vec<Herb>,
    #[serde(default)]
    pub bai_thuoc: Vec<Prescription>,
    #[serde(default)]
    pub cong_thuc: Vec<FormulaLine>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<ChunkInfo>,
}

impl ExtractionResult {
    pub fn is_empty(&self) -> bool {
        self.vi_thuoc.is_empty() && self.bai_thuoc.is_empty() && self.cong_thuc.is_empty()
    }
}

/// All records of a run, in processing order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    #[serde(default)]
    pub vi_thuoc: Vec<Herb>,
    #[serde(default)]
    pub bai_thuoc: Vec<Prescription>,
    #[serde(default)]
    pub cong_thuc: Vec<FormulaLine>,
}

impl AggregateResult {
    /// Append a partial result. Never merges: dedup runs once at the end.
    pub fn append(&mut self, partial: ExtractionResult) {
        self.vi_thuoc.extend(partial.vi_thuoc);
        self.bai_thuoc.extend(partial.bai_thuoc);
        self.cong_thuc.extend(partial.cong_thuc);
    }

    pub fn counts(&self) -> RecordCounts {
        RecordCounts {
            herbs: self.vi_thuoc.len(),
            prescriptions: self.bai_thuoc.len(),
            formula_lines: self.cong_thuc.len(),
        }
    }
}

/// Record totals per table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordCounts {
    pub herbs: usize,
    pub prescriptions: usize,
    pub formula_lines: usize,
}

/// Final report of one document run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    /// Sub-documents in the document.
    pub total_chunks: usize,
    /// Sub-documents already done by an earlier run and skipped.
    pub resumed_chunks: usize,
    /// Sub-documents processed successfully in this run.
    pub successful_chunks: usize,
    /// Sub-documents that failed in this run.
    pub failed_chunks: usize,
    pub accepted_slices: usize,
    pub duplicate_slices: usize,
    pub short_slices: usize,
    pub repetitive_slices: usize,
    pub failed_slices: usize,
    pub structured_failures: usize,
    /// Totals before the dedup pass.
    pub raw_counts: RecordCounts,
    /// Totals after the dedup pass.
    pub final_counts: RecordCounts,
    /// Records removed by dedup (duplicates plus unusable rows).
    pub removed_records: usize,
    /// Files written by the sink.
    pub outputs: Vec<PathBuf>,
    /// Whether the checkpoint was deleted (every sub-document succeeded).
    pub checkpoint_cleared: bool,
    pub total_duration_ms: u64,
}
