//! Structured extraction: one accepted text slice → typed records.
//!
//! The first attempt runs at temperature 0. When it keeps failing (bad JSON,
//! looping output) later attempts raise the temperature by a fixed step up
//! to a cap, so the model stops reproducing the same broken answer.

use super::backoff::{BackoffPolicy, RetryClass};
use super::postprocess::{preview, strip_json_fences};
use super::quality::{Quality, QualityGate};
use super::rate::RateLimiter;
use super::remote::{
    GenerateOptions, GenerateRequest, RemoteInput, RemoteModel, RemoteResponse, ResponseFormat,
};
use super::retry::{retry_call, RetryExhausted};
use super::slice::TextSlice;
use crate::config::ExtractionConfig;
use crate::error::RemoteError;
use crate::output::{
    is_uninformative, ChunkInfo, ExtractionResult, FormulaLine, Herb, Prescription,
};
use crate::prompts::{structured_prompt, STRUCTURED_SYSTEM_PROMPT};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

const PREVIEW_CHARS: usize = 200;

/// Why a structured attempt was rejected.
#[derive(Debug, Error)]
pub enum StructuredError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("repetitive response (similarity {score:.2})")]
    Repetitive { score: f64 },
    #[error("response is not valid JSON: {detail}")]
    Parse { detail: String },
}

impl StructuredError {
    fn retry_class(&self) -> RetryClass {
        match self {
            StructuredError::Remote(e) => RetryClass::for_remote(e.kind),
            StructuredError::Repetitive { .. } | StructuredError::Parse { .. } => RetryClass::Quick,
        }
    }
}

/// Turns text slices into [`ExtractionResult`]s.
pub struct StructuredExtractor<'a, M: RemoteModel> {
    model: &'a M,
    config: &'a ExtractionConfig,
    limiter: &'a RateLimiter,
    policy: &'a BackoffPolicy,
    gate: QualityGate,
}

impl<'a, M: RemoteModel> StructuredExtractor<'a, M> {
    pub fn new(
        model: &'a M,
        config: &'a ExtractionConfig,
        limiter: &'a RateLimiter,
        policy: &'a BackoffPolicy,
    ) -> Self {
        Self {
            model,
            config,
            limiter,
            policy,
            gate: QualityGate::from_config(config),
        }
    }

    /// Temperature for the 0-based `attempt`.
    pub fn temperature(&self, attempt: u32) -> f32 {
        (attempt as f32 * self.config.structured_temperature_step)
            .min(self.config.structured_temperature_cap)
    }

    /// Extract records from one slice. Exhausted retries are returned to the
    /// caller, which counts and skips the slice.
    pub async fn extract(
        &self,
        slice: &TextSlice,
    ) -> Result<ExtractionResult, RetryExhausted<StructuredError>> {
        let label = format!("extract p{}-{}", slice.start_page, slice.end_page);
        let mut result = retry_call(
            &label,
            self.config.max_retries,
            self.policy,
            self.limiter,
            StructuredError::retry_class,
            move |attempt| self.attempt(slice, attempt),
        )
        .await?;
        result.chunk = Some(ChunkInfo {
            start_page: slice.start_page,
            end_page: slice.end_page,
            position: slice.position,
        });
        debug!(
            "{}: {} herbs, {} prescriptions, {} formula lines",
            label,
            result.vi_thuoc.len(),
            result.bai_thuoc.len(),
            result.cong_thuc.len()
        );
        Ok(result)
    }

    async fn attempt(
        &self,
        slice: &TextSlice,
        attempt: u32,
    ) -> Result<ExtractionResult, StructuredError> {
        let prompt = structured_prompt(slice.start_page, slice.end_page);
        let request = GenerateRequest {
            model: &self.config.text_model,
            input: RemoteInput::Text(&slice.text),
            system: Some(STRUCTURED_SYSTEM_PROMPT),
            prompt: &prompt,
            options: GenerateOptions {
                temperature: self.temperature(attempt),
                max_output_tokens: self.config.max_output_tokens,
                stop_sequences: Vec::new(),
                response_format: ResponseFormat::Json,
            },
        };
        let value: Value = match self.model.generate(request).await {
            RemoteResponse::Error(e) => return Err(e.into()),
            RemoteResponse::Structured(value) => value,
            RemoteResponse::Text(raw) => match serde_json::from_str(strip_json_fences(&raw)) {
                Ok(value) => value,
                Err(e) => {
                    self.check_repetition(&raw)?;
                    warn!(
                        "Unparseable JSON on attempt {} ({}): {}",
                        attempt + 1,
                        e,
                        preview(&raw, PREVIEW_CHARS)
                    );
                    return Err(StructuredError::Parse {
                        detail: e.to_string(),
                    });
                }
            },
        };
        self.check_repetition(&informative_text(&value))?;
        validate_extraction(value)
    }

    fn check_repetition(&self, text: &str) -> Result<(), StructuredError> {
        match self.gate.assess_repetition(text) {
            Quality::Repetitive { score } => Err(StructuredError::Repetitive { score }),
            _ => Ok(()),
        }
    }
}

/// The informative string values of a response, space-joined.
///
/// Keys, punctuation and sentinel values are left out: a page of sparse
/// records repeats them on every entry without the model looping.
pub fn informative_text(value: &Value) -> String {
    fn collect<'v>(value: &'v Value, out: &mut Vec<&'v str>) {
        match value {
            Value::String(s) if !is_uninformative(s) => out.push(s.trim()),
            Value::Array(items) => items.iter().for_each(|v| collect(v, out)),
            Value::Object(map) => map.values().for_each(|v| collect(v, out)),
            _ => {}
        }
    }
    let mut parts = Vec::new();
    collect(value, &mut parts);
    parts.join(" ")
}

/// Coerce a parsed response into an [`ExtractionResult`].
///
/// Missing or non-array tables become empty, entries that are not objects
/// are skipped, and herbs with neither a Vietnamese nor a scientific name
/// are dropped. Field-level defaults come from the record types.
pub fn validate_extraction(value: Value) -> Result<ExtractionResult, StructuredError> {
    let Value::Object(mut map) = value else {
        return Err(StructuredError::Parse {
            detail: "expected a JSON object at the top level".to_string(),
        });
    };
    let vi_thuoc = records::<Herb>(map.remove("vi_thuoc"), "vi_thuoc")
        .into_iter()
        .filter(|h| !(is_uninformative(&h.name) && is_uninformative(&h.scientific_name)))
        .collect();
    Ok(ExtractionResult {
        vi_thuoc,
        bai_thuoc: records::<Prescription>(map.remove("bai_thuoc"), "bai_thuoc"),
        cong_thuc: records::<FormulaLine>(map.remove("cong_thuc"), "cong_thuc"),
        chunk: None,
    })
}

fn records<T: DeserializeOwned>(table: Option<Value>, name: &str) -> Vec<T> {
    let Some(Value::Array(items)) = table else {
        return Vec::new();
    };
    items
        .into_iter()
        .filter(Value::is_object)
        .filter_map(|item| match serde_json::from_value(item) {
            Ok(record) => Some(record),
            Err(e) => {
                debug!("Skipping malformed {} entry: {}", name, e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NO_INFO;
    use crate::pipeline::testing::{looping_text, ScriptedModel};
    use serde_json::json;

    fn slice() -> TextSlice {
        TextSlice {
            start_page: 8,
            end_page: 14,
            position: 1,
            text: "BÀI THUỐC TỨ VẬT THANG ...".into(),
            fingerprint: String::new(),
        }
    }

    fn body() -> String {
        json!({
            "vi_thuoc": [{"ten_vi_thuoc": "Đương quy", "ten_khoa_hoc": "Angelica sinensis"}],
            "bai_thuoc": [{"ten_bai_thuoc": "Tứ vật thang", "cong_dung": "Bổ huyết"}],
            "cong_thuc": [{"ten_bai_thuoc": "Tứ vật thang", "ten_vi_thuoc": "Đương quy", "lieu_luong": "12g"}]
        })
        .to_string()
    }

    async fn run(model: &ScriptedModel) -> Result<ExtractionResult, RetryExhausted<StructuredError>> {
        let config = ExtractionConfig::builder().max_retries(3).build().unwrap();
        let limiter = RateLimiter::new(config.requests_per_minute, config.min_request_delay);
        let policy = BackoffPolicy::from_config(&config);
        StructuredExtractor::new(model, &config, &limiter, &policy)
            .extract(&slice())
            .await
    }

    #[test]
    fn validator_fills_defaults() {
        let r = validate_extraction(json!({
            "vi_thuoc": [
                {"ten_vi_thuoc": "Bạch truật"},
                {"ten_vi_thuoc": "", "ten_khoa_hoc": null},
                "not an object",
                {"ten_khoa_hoc": "Paeonia lactiflora"}
            ]
        }))
        .unwrap();
        assert_eq!(r.vi_thuoc.len(), 2);
        assert_eq!(r.vi_thuoc[0].family, NO_INFO);
        assert!(r.bai_thuoc.is_empty());
        assert!(r.cong_thuc.is_empty());
    }

    #[test]
    fn validator_rejects_non_objects() {
        assert!(matches!(
            validate_extraction(json!([1, 2])),
            Err(StructuredError::Parse { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn parses_fenced_text_and_tags_chunk() {
        let model = ScriptedModel::new().text(format!("```json\n{}\n```", body()));
        let r = run(&model).await.unwrap();
        assert_eq!(r.vi_thuoc[0].name, "Đương quy");
        assert_eq!(r.cong_thuc[0].dosage, "12g");
        assert_eq!(
            r.chunk,
            Some(ChunkInfo {
                start_page: 8,
                end_page: 14,
                position: 1
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn bad_json_and_loops_are_retried() {
        let model = ScriptedModel::new()
            .text("{\"vi_thuoc\": [")
            .text(looping_text())
            .reply(RemoteResponse::Structured(serde_json::from_str(&body()).unwrap()));
        let r = run(&model).await.unwrap();
        assert_eq!(r.bai_thuoc[0].effects, "Bổ huyết");
        assert_eq!(model.calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_is_reported() {
        let model = ScriptedModel::new()
            .text("không phải JSON")
            .text("không phải JSON")
            .text("không phải JSON")
            .text("không phải JSON");
        let err = run(&model).await.unwrap_err();
        assert_eq!(err.attempts, 4);
        assert!(matches!(err.last, StructuredError::Parse { .. }));
    }

    fn sparse_herbs() -> Vec<Herb> {
        [
            ("Cam thảo", "Glycyrrhiza uralensis"),
            ("Đương quy", "Angelica sinensis"),
            ("Hoàng liên", "Coptis chinensis"),
            ("Gừng", "Zingiber officinale"),
            ("Bạc hà", "Mentha arvensis"),
            ("Ngải cứu", "Artemisia vulgaris"),
            ("Đảng sâm", "Codonopsis pilosula"),
            ("Bạch truật", "Atractylodes macrocephala"),
            ("Xuyên khung", "Ligusticum chuanxiong"),
            ("Thục địa", "Rehmannia glutinosa"),
            ("Quế chi", "Cinnamomum cassia"),
            ("Ma hoàng", "Ephedra sinica"),
        ]
        .into_iter()
        .map(|(name, sci)| Herb::new(name, sci))
        .collect()
    }

    #[test]
    fn informative_text_skips_keys_and_sentinels() {
        let value = json!({
            "vi_thuoc": [{"ten_vi_thuoc": "Gừng", "ho": NO_INFO, "tinh_vi": "  cay  "}],
            "bai_thuoc": [],
            "cong_thuc": [{"ten_bai_thuoc": "", "lieu_luong": 12}]
        });
        let text = informative_text(&value);
        let mut words: Vec<&str> = text.split_whitespace().collect();
        words.sort();
        assert_eq!(words, ["Gừng", "cay"]);
    }

    #[tokio::test(start_paused = true)]
    async fn sparse_multi_herb_page_is_accepted() {
        let herbs = sparse_herbs();
        let body = serde_json::to_string_pretty(&json!({
            "vi_thuoc": herbs,
            "bai_thuoc": [],
            "cong_thuc": []
        }))
        .unwrap();
        assert!(QualityGate::from_config(&ExtractionConfig::default()).is_repetitive(&body));

        let model = ScriptedModel::new().text(body);
        let r = run(&model).await.unwrap();
        assert_eq!(r.vi_thuoc, herbs);
        assert_eq!(model.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn looping_records_are_retried() {
        let looping: Vec<Herb> = (0..12)
            .map(|_| {
                let mut h = Herb::new("Cam thảo", "Glycyrrhiza uralensis");
                h.actions = "Bổ trung ích khí, nhuận phế chỉ khái".into();
                h
            })
            .collect();
        let model = ScriptedModel::new()
            .reply(RemoteResponse::Structured(json!({ "vi_thuoc": looping })))
            .text(body());
        let r = run(&model).await.unwrap();
        assert_eq!(r.vi_thuoc[0].name, "Đương quy");
        assert_eq!(model.calls().len(), 2);
    }

    #[test]
    fn temperature_ramps_to_cap() {
        let config = ExtractionConfig::default();
        let limiter = RateLimiter::new(15, std::time::Duration::ZERO);
        let policy = BackoffPolicy::default();
        let model = ScriptedModel::new();
        let s = StructuredExtractor::new(&model, &config, &limiter, &policy);
        assert_eq!(s.temperature(0), 0.0);
        assert!((s.temperature(2) - 0.2).abs() < 1e-6);
        assert_eq!(s.temperature(9), 0.4);
    }
}
