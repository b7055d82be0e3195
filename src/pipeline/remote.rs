//! The remote extraction capability, as seen by the pipeline.
//!
//! Providers return loosely structured answers: sometimes text, sometimes
//! JSON, sometimes an error whose only description is a message string.
//! Adapters decode all of that once into [`RemoteResponse`]; nothing past
//! this boundary inspects raw provider output to decide what happened.

use super::split::{PageWindow, SubDocument};
use crate::error::RemoteError;
use std::future::Future;
use std::path::Path;

/// Identifier of an uploaded sub-document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteHandle(pub String);

/// Processing state of an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadState {
    Processing,
    Ready,
    Failed(String),
}

/// What a generate call reads.
#[derive(Debug, Clone, Copy)]
pub enum RemoteInput<'a> {
    /// A page window of an uploaded sub-document.
    Document {
        handle: &'a RemoteHandle,
        window: PageWindow,
    },
    /// Plain text (already transcribed pages).
    Text(&'a str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseFormat {
    #[default]
    Text,
    Json,
}

/// Sampling and output controls for one call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateOptions {
    pub temperature: f32,
    pub max_output_tokens: usize,
    pub stop_sequences: Vec<String>,
    pub response_format: ResponseFormat,
}

/// One generate call.
#[derive(Debug, Clone)]
pub struct GenerateRequest<'a> {
    pub model: &'a str,
    pub input: RemoteInput<'a>,
    pub system: Option<&'a str>,
    pub prompt: &'a str,
    pub options: GenerateOptions,
}

/// A decoded provider answer.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteResponse {
    Text(String),
    Structured(serde_json::Value),
    Error(RemoteError),
}

impl RemoteResponse {
    /// Decode a raw provider answer.
    ///
    /// `Json` requests whose body parses are returned as `Structured`; empty
    /// bodies become `Malformed` errors; anything else is `Text`.
    pub fn decode(raw: Result<String, String>, format: ResponseFormat) -> Self {
        match raw {
            Err(message) => RemoteResponse::Error(RemoteError::from_message(message)),
            Ok(body) if body.trim().is_empty() => {
                RemoteResponse::Error(RemoteError::malformed("empty response body"))
            }
            Ok(body) => match format {
                ResponseFormat::Json => {
                    match serde_json::from_str(super::postprocess::strip_json_fences(&body)) {
                        Ok(value) => RemoteResponse::Structured(value),
                        Err(_) => RemoteResponse::Text(body),
                    }
                }
                ResponseFormat::Text => RemoteResponse::Text(body),
            },
        }
    }

    /// The response as text, or the error.
    pub fn into_text(self) -> Result<String, RemoteError> {
        match self {
            RemoteResponse::Text(t) => Ok(t),
            RemoteResponse::Structured(v) => Ok(v.to_string()),
            RemoteResponse::Error(e) => Err(e),
        }
    }
}

/// A remote model able to read uploaded page ranges and plain text.
///
/// Implementations must be usable from one task at a time; the pipeline
/// never issues concurrent calls.
pub trait RemoteModel: Send + Sync {
    /// Upload the pages of `sub` from the PDF at `source`.
    fn upload(
        &self,
        source: &Path,
        sub: &SubDocument,
    ) -> impl Future<Output = Result<RemoteHandle, RemoteError>> + Send;

    /// Current processing state of an upload.
    fn status(
        &self,
        handle: &RemoteHandle,
    ) -> impl Future<Output = Result<UploadState, RemoteError>> + Send;

    /// Run one generation.
    fn generate(&self, request: GenerateRequest<'_>) -> impl Future<Output = RemoteResponse> + Send;

    /// Free an upload. Failures are ignored by the pipeline.
    fn release(&self, handle: &RemoteHandle) -> impl Future<Output = ()> + Send {
        let _ = handle;
        async {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteErrorKind;

    #[test]
    fn decode_classifies_errors_once() {
        let r = RemoteResponse::decode(Err("429 quota exceeded".into()), ResponseFormat::Text);
        match r {
            RemoteResponse::Error(e) => assert_eq!(e.kind, RemoteErrorKind::QuotaExceeded),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn decode_empty_body_is_malformed() {
        let r = RemoteResponse::decode(Ok("  \n".into()), ResponseFormat::Json);
        assert!(matches!(
            r,
            RemoteResponse::Error(RemoteError { kind: RemoteErrorKind::Malformed, .. })
        ));
    }

    #[test]
    fn decode_json_with_fences() {
        let r = RemoteResponse::decode(
            Ok("```json\n{\"vi_thuoc\": []}\n```".into()),
            ResponseFormat::Json,
        );
        assert_eq!(r, RemoteResponse::Structured(serde_json::json!({"vi_thuoc": []})));
    }

    #[test]
    fn decode_unparseable_json_stays_text() {
        let r = RemoteResponse::decode(Ok("{\"vi_thuoc\": [".into()), ResponseFormat::Json);
        assert!(matches!(r, RemoteResponse::Text(_)));
        assert_eq!(r.into_text().unwrap(), "{\"vi_thuoc\": [");
    }
}
