//! Terminal deduplication and merge pass.
//!
//! Runs exactly once, over everything a run accumulated, so every merge
//! decision sees all candidate values for a field.
//!
//! Herb identity, first match wins:
//! 1. same Vietnamese name (case-insensitive, whitespace-collapsed)
//! 2. same scientific name, when both sides carry one
//! 3. best fuzzy Vietnamese-name match at or above the similarity threshold
//!
//! An empty or sentinel Vietnamese name, prescription name or formula-line
//! name is no identity: such records are discarded, never merged.
//!
//! Identity fields of the canonical record are never rewritten, which keeps
//! the pass idempotent: a second run over its own output finds no matches.

use crate::config::{ExtractionConfig, MergePolicy, NO_INFO};
use crate::output::{
    is_uninformative, normalize_key, AggregateResult, FormulaLine, Herb, Prescription,
};
use std::collections::HashMap;
use strsim::normalized_levenshtein;
use tracing::debug;

/// Per-table bookkeeping of one dedup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupReport {
    pub herbs_merged: usize,
    pub herbs_discarded: usize,
    pub prescriptions_merged: usize,
    pub prescriptions_discarded: usize,
    pub formula_lines_merged: usize,
    pub formula_lines_discarded: usize,
}

impl DedupReport {
    /// Records removed from the input, merged or discarded.
    pub fn removed(&self) -> usize {
        self.herbs_merged
            + self.herbs_discarded
            + self.prescriptions_merged
            + self.prescriptions_discarded
            + self.formula_lines_merged
            + self.formula_lines_discarded
    }
}

/// Fold `incoming` into `existing`.
///
/// Uninformative incoming values never overwrite. An uninformative existing
/// value is always replaced. Two informative values that differ are settled
/// by `policy`.
pub fn merge_field(existing: &mut String, incoming: &str, policy: MergePolicy) {
    if is_uninformative(incoming) {
        return;
    }
    if is_uninformative(existing) {
        *existing = incoming.to_string();
        return;
    }
    if existing.as_str() == incoming {
        return;
    }
    match policy {
        MergePolicy::PreferLonger => {
            if incoming.chars().count() > existing.chars().count() {
                *existing = incoming.to_string();
            }
        }
        MergePolicy::KeepExisting => {}
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Deduplicator {
    pub similarity_threshold: f64,
    pub use_fuzzy_matching: bool,
    pub policy: MergePolicy,
}

impl Deduplicator {
    pub fn from_config(config: &ExtractionConfig) -> Self {
        Self {
            similarity_threshold: config.similarity_threshold,
            use_fuzzy_matching: config.use_fuzzy_matching,
            policy: config.merge_policy,
        }
    }

    pub fn dedup(&self, input: AggregateResult) -> (AggregateResult, DedupReport) {
        let mut report = DedupReport::default();
        let vi_thuoc = self.dedup_herbs(input.vi_thuoc, &mut report);
        let bai_thuoc = self.dedup_prescriptions(input.bai_thuoc, &mut report);
        let cong_thuc = self.dedup_formula_lines(input.cong_thuc, &mut report);
        debug!("Dedup: {:?}", report);
        (
            AggregateResult {
                vi_thuoc,
                bai_thuoc,
                cong_thuc,
            },
            report,
        )
    }

    fn dedup_herbs(&self, herbs: Vec<Herb>, report: &mut DedupReport) -> Vec<Herb> {
        let mut canonical: Vec<Herb> = Vec::new();
        let mut keys: Vec<String> = Vec::new();
        let mut by_name: HashMap<String, usize> = HashMap::new();
        let mut by_scientific: HashMap<String, usize> = HashMap::new();

        for herb in herbs {
            if is_uninformative(&herb.name) || herb.scientific_name.trim().is_empty() {
                report.herbs_discarded += 1;
                continue;
            }
            let name_key = normalize_key(&herb.name);
            let sci_key = scientific_key(&herb.scientific_name);

            let found = by_name
                .get(&name_key)
                .or_else(|| sci_key.as_ref().and_then(|k| by_scientific.get(k)))
                .copied()
                .or_else(|| self.fuzzy_match(&name_key, &keys));

            match found {
                Some(idx) => {
                    merge_herb(&mut canonical[idx], &herb, self.policy);
                    report.herbs_merged += 1;
                }
                None => {
                    let idx = canonical.len();
                    by_name.insert(name_key.clone(), idx);
                    if let Some(k) = sci_key {
                        by_scientific.entry(k).or_insert(idx);
                    }
                    keys.push(name_key);
                    canonical.push(herb);
                }
            }
        }
        canonical
    }

    /// Index of the most similar canonical name, if any reaches the threshold.
    fn fuzzy_match(&self, name_key: &str, keys: &[String]) -> Option<usize> {
        if !self.use_fuzzy_matching {
            return None;
        }
        keys.iter()
            .enumerate()
            .map(|(idx, key)| (idx, normalized_levenshtein(name_key, key)))
            .filter(|(_, score)| *score >= self.similarity_threshold)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(idx, _)| idx)
    }

    fn dedup_prescriptions(
        &self,
        prescriptions: Vec<Prescription>,
        report: &mut DedupReport,
    ) -> Vec<Prescription> {
        let mut canonical: Vec<Prescription> = Vec::new();
        let mut by_name: HashMap<String, usize> = HashMap::new();
        for incoming in prescriptions {
            if is_uninformative(&incoming.name) {
                report.prescriptions_discarded += 1;
                continue;
            }
            match by_name.get(&normalize_key(&incoming.name)) {
                Some(&idx) => {
                    let target = &mut canonical[idx];
                    for (field, value) in target
                        .attributes_mut()
                        .into_iter()
                        .zip(incoming.attributes())
                    {
                        merge_field(field, value, self.policy);
                    }
                    report.prescriptions_merged += 1;
                }
                None => {
                    by_name.insert(normalize_key(&incoming.name), canonical.len());
                    canonical.push(incoming);
                }
            }
        }
        canonical
    }

    fn dedup_formula_lines(
        &self,
        lines: Vec<FormulaLine>,
        report: &mut DedupReport,
    ) -> Vec<FormulaLine> {
        let mut canonical: Vec<FormulaLine> = Vec::new();
        let mut by_key: HashMap<(String, String, String), usize> = HashMap::new();
        for line in lines {
            if is_uninformative(&line.prescription) || is_uninformative(&line.herb) {
                report.formula_lines_discarded += 1;
                continue;
            }
            let key = line.key();
            match by_key.get(&key) {
                Some(&idx) => {
                    merge_field(&mut canonical[idx].role, &line.role, self.policy);
                    report.formula_lines_merged += 1;
                }
                None => {
                    by_key.insert(key, canonical.len());
                    canonical.push(line);
                }
            }
        }
        canonical
    }
}

/// Scientific names only identify a herb when actually given.
fn scientific_key(value: &str) -> Option<String> {
    if value.trim() == NO_INFO {
        None
    } else {
        Some(normalize_key(value))
    }
}

fn merge_herb(target: &mut Herb, incoming: &Herb, policy: MergePolicy) {
    for (field, value) in target.attributes_mut().into_iter().zip(incoming.attributes()) {
        merge_field(field, value, policy);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dedup() -> Deduplicator {
        Deduplicator::from_config(&ExtractionConfig::default())
    }

    fn herb(name: &str, sci: &str, family: &str) -> Herb {
        let mut h = Herb::new(name, sci);
        h.family = family.to_string();
        h
    }

    #[test]
    fn sentinel_is_filled_by_information() {
        let mut x = NO_INFO.to_string();
        merge_field(&mut x, "abc", MergePolicy::PreferLonger);
        assert_eq!(x, "abc");
    }

    #[test]
    fn longer_value_wins() {
        let mut x = "ab".to_string();
        merge_field(&mut x, "abcdef", MergePolicy::PreferLonger);
        assert_eq!(x, "abcdef");
        merge_field(&mut x, NO_INFO, MergePolicy::PreferLonger);
        assert_eq!(x, "abcdef");
    }

    #[test]
    fn keep_existing_only_fills_gaps() {
        let mut x = "ab".to_string();
        merge_field(&mut x, "abcdef", MergePolicy::KeepExisting);
        assert_eq!(x, "ab");
        let mut y = String::new();
        merge_field(&mut y, "abcdef", MergePolicy::KeepExisting);
        assert_eq!(y, "abcdef");
    }

    #[test]
    fn herbs_merge_by_name_then_scientific_name() {
        let input = AggregateResult {
            vi_thuoc: vec![
                herb("Cam thảo", "Glycyrrhiza uralensis", NO_INFO),
                herb("CAM  THẢO", NO_INFO, "Fabaceae"),
                herb("Quốc lão", "glycyrrhiza uralensis", "Họ Đậu (Fabaceae)"),
            ],
            ..Default::default()
        };
        let (out, report) = dedup().dedup(input);
        assert_eq!(out.vi_thuoc.len(), 1);
        assert_eq!(out.vi_thuoc[0].name, "Cam thảo");
        assert_eq!(out.vi_thuoc[0].family, "Họ Đậu (Fabaceae)");
        assert_eq!(report.herbs_merged, 2);
    }

    #[test]
    fn sentinel_scientific_names_do_not_match() {
        let input = AggregateResult {
            vi_thuoc: vec![herb("Ngải cứu", NO_INFO, NO_INFO), herb("Bạc hà", NO_INFO, NO_INFO)],
            ..Default::default()
        };
        let (out, _) = dedup().dedup(input);
        assert_eq!(out.vi_thuoc.len(), 2);
    }

    #[test]
    fn fuzzy_match_picks_closest_name() {
        let input = AggregateResult {
            vi_thuoc: vec![
                herb("Hoàng liên", "Coptis chinensis", NO_INFO),
                herb("Hoàng liên gai", "Berberis wallichiana", NO_INFO),
                herb("Hoàng liên.", "Coptis sp.", "Ranunculaceae"),
            ],
            ..Default::default()
        };
        let (out, _) = dedup().dedup(input);
        assert_eq!(out.vi_thuoc.len(), 2);
        assert_eq!(out.vi_thuoc[0].family, "Ranunculaceae");

        let strict = Deduplicator {
            use_fuzzy_matching: false,
            ..dedup()
        };
        let input = AggregateResult {
            vi_thuoc: vec![herb("Hoàng liên", "a", NO_INFO), herb("Hoàng liên.", "b", NO_INFO)],
            ..Default::default()
        };
        assert_eq!(strict.dedup(input).0.vi_thuoc.len(), 2);
    }

    #[test]
    fn herbs_missing_identity_are_discarded() {
        let input = AggregateResult {
            vi_thuoc: vec![herb("", "Zingiber officinale", NO_INFO), herb("Gừng", " ", NO_INFO)],
            ..Default::default()
        };
        let (out, report) = dedup().dedup(input);
        assert!(out.vi_thuoc.is_empty());
        assert_eq!(report.herbs_discarded, 2);
    }

    #[test]
    fn sentinel_herb_names_are_not_an_identity() {
        let input = AggregateResult {
            vi_thuoc: vec![
                herb(NO_INFO, "Coptis chinensis", "Ranunculaceae"),
                herb(NO_INFO, "Zingiber officinale", "Zingiberaceae"),
                herb("Gừng", "Zingiber officinale", NO_INFO),
            ],
            ..Default::default()
        };
        let (out, report) = dedup().dedup(input);
        assert_eq!(out.vi_thuoc.len(), 1);
        assert_eq!(out.vi_thuoc[0].name, "Gừng");
        assert_eq!(out.vi_thuoc[0].family, NO_INFO);
        assert_eq!(report.herbs_discarded, 2);
        assert_eq!(report.herbs_merged, 0);
    }

    #[test]
    fn sentinel_prescription_and_formula_names_are_dropped() {
        let input = AggregateResult {
            bai_thuoc: vec![Prescription::new(NO_INFO), Prescription::new(format!(" {NO_INFO} "))],
            cong_thuc: vec![
                FormulaLine::new(NO_INFO, "Đương quy", "12g"),
                FormulaLine::new("Tứ vật thang", NO_INFO, "12g"),
                FormulaLine::new("Tứ vật thang", "Thục địa", "16g"),
            ],
            ..Default::default()
        };
        let (out, report) = dedup().dedup(input);
        assert!(out.bai_thuoc.is_empty());
        assert_eq!(report.prescriptions_discarded, 2);
        assert_eq!(out.cong_thuc.len(), 1);
        assert_eq!(out.cong_thuc[0].herb, "Thục địa");
        assert_eq!(report.formula_lines_discarded, 2);
    }

    #[test]
    fn prescriptions_and_formula_lines() {
        let mut p2 = Prescription::new("tứ vật thang");
        p2.effects = "Bổ huyết, điều kinh".into();
        let mut f2 = FormulaLine::new("Tứ vật thang", "Đương quy", "12g");
        f2.role = "Quân".into();
        let input = AggregateResult {
            bai_thuoc: vec![Prescription::new("Tứ vật thang"), p2, Prescription::new("  ")],
            cong_thuc: vec![
                FormulaLine::new("Tứ vật thang", "Đương quy", "12g"),
                f2,
                FormulaLine::new("Tứ vật thang", "Đương quy", "8g"),
                FormulaLine::new("", "Xuyên khung", "6g"),
            ],
            ..Default::default()
        };
        let (out, report) = dedup().dedup(input);
        assert_eq!(out.bai_thuoc.len(), 1);
        assert_eq!(out.bai_thuoc[0].name, "Tứ vật thang");
        assert_eq!(out.bai_thuoc[0].effects, "Bổ huyết, điều kinh");
        assert_eq!(out.cong_thuc.len(), 2);
        assert_eq!(out.cong_thuc[0].role, "Quân");
        assert_eq!(report.prescriptions_discarded, 1);
        assert_eq!(report.formula_lines_discarded, 1);
        assert_eq!(report.removed(), 4);
    }

    #[test]
    fn second_pass_is_a_no_op() {
        let input = AggregateResult {
            vi_thuoc: vec![
                herb("Hoàng kỳ", "Astragalus membranaceus", NO_INFO),
                herb("Hoàng kì", "Astragalus propinquus", "Fabaceae"),
                herb("Bạch truật", NO_INFO, "Asteraceae"),
                herb("Bạch truật", "Atractylodes macrocephala", "Họ Cúc"),
                herb("Đảng sâm", "Codonopsis pilosula", NO_INFO),
            ],
            bai_thuoc: vec![Prescription::new("Tứ quân tử thang"), Prescription::new("TỨ QUÂN TỬ THANG")],
            cong_thuc: vec![
                FormulaLine::new("Tứ quân tử thang", "Bạch truật", "12g"),
                FormulaLine::new("Tứ quân tử thang", "bạch truật", "12G"),
            ],
        };
        let (once, _) = dedup().dedup(input);
        let (twice, report) = dedup().dedup(once.clone());
        assert_eq!(once, twice);
        assert_eq!(report, DedupReport::default());
    }
}
