//! [`RemoteModel`] over `edgequake-llm` chat providers.
//!
//! Chat-completion APIs have no document store, so an "upload" only records
//! which file and page range a handle stands for. Each OCR request renders
//! the pages of its window, attaches them as PNG images and sends one chat
//! call; text requests send the slice inline.
//!
//! Stop sequences and JSON mode go to the provider as `stop` and
//! `response_format`. Not every backend honours them, so the stop marker is
//! also cut client-side (see [`super::postprocess::clean_ocr_text`]) and JSON
//! is also requested in the prompt and decoded by [`RemoteResponse::decode`].

use super::encode::encode_page;
use super::remote::{
    GenerateOptions, GenerateRequest, RemoteHandle, RemoteInput, RemoteModel, RemoteResponse,
    ResponseFormat, UploadState,
};
use super::render::{render_range, RenderOptions};
use super::split::{PageWindow, SubDocument};
use crate::config::ExtractionConfig;
use crate::error::{DongyError, RemoteError, RemoteErrorKind};
use crate::prompts::with_text_input;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

const JSON_INSTRUCTION: &str = "Respond with a single JSON object and nothing else.";

#[derive(Debug, Clone)]
struct Upload {
    source: PathBuf,
    start_page: usize,
    end_page: usize,
}

/// Chat providers keyed by model name.
pub struct EdgequakeModel {
    providers: HashMap<String, Arc<dyn LLMProvider>>,
    uploads: Mutex<HashMap<String, Upload>>,
    render: RenderOptions,
}

impl EdgequakeModel {
    /// Resolve one provider per configured model (OCR, fallback, text).
    pub fn from_config(config: &ExtractionConfig) -> Result<Self, DongyError> {
        let mut providers = HashMap::new();
        let models = [
            Some(config.ocr_model.as_str()),
            config.active_fallback(),
            Some(config.text_model.as_str()),
        ];
        for model in models.into_iter().flatten() {
            if !providers.contains_key(model) {
                providers.insert(model.to_string(), resolve_provider(config, model)?);
            }
        }
        Ok(Self::with_providers(providers, config))
    }

    /// Serve every model name with the same provider.
    pub fn with_provider(provider: Arc<dyn LLMProvider>, config: &ExtractionConfig) -> Self {
        let mut providers = HashMap::new();
        providers.insert(String::new(), provider);
        Self::with_providers(providers, config)
    }

    fn with_providers(
        providers: HashMap<String, Arc<dyn LLMProvider>>,
        config: &ExtractionConfig,
    ) -> Self {
        Self {
            providers,
            uploads: Mutex::new(HashMap::new()),
            render: RenderOptions {
                dpi: config.dpi,
                max_pixels: config.max_rendered_pixels,
            },
        }
    }

    fn provider_for(&self, model: &str) -> Result<Arc<dyn LLMProvider>, RemoteError> {
        self.providers
            .get(model)
            .or_else(|| self.providers.get(""))
            .cloned()
            .ok_or_else(|| {
                RemoteError::new(
                    RemoteErrorKind::Fatal,
                    format!("no provider configured for model '{}'", model),
                )
            })
    }

    fn lookup(&self, handle: &RemoteHandle) -> Result<Upload, RemoteError> {
        let uploads = self
            .uploads
            .lock()
            .map_err(|_| RemoteError::new(RemoteErrorKind::Fatal, "upload table poisoned"))?;
        uploads.get(&handle.0).cloned().ok_or_else(|| {
            RemoteError::new(
                RemoteErrorKind::Fatal,
                format!("unknown upload handle '{}'", handle.0),
            )
        })
    }

    async fn window_images(
        &self,
        handle: &RemoteHandle,
        window: PageWindow,
    ) -> Result<Vec<ImageData>, RemoteError> {
        let upload = self.lookup(handle)?;
        if window.start_page < upload.start_page || window.end_page > upload.end_page {
            return Err(RemoteError::new(
                RemoteErrorKind::Fatal,
                format!(
                    "window p{}-{} outside upload p{}-{}",
                    window.start_page, window.end_page, upload.start_page, upload.end_page
                ),
            ));
        }
        let fatal = |e: DongyError| RemoteError::new(RemoteErrorKind::Fatal, e.to_string());
        let rendered = render_range(&upload.source, window.start_page, window.end_page, self.render)
            .await
            .map_err(fatal)?;
        rendered
            .iter()
            .map(|(page_num, img)| encode_page(*page_num, img).map_err(fatal))
            .collect()
    }

    async fn build_messages(
        &self,
        request: &GenerateRequest<'_>,
    ) -> Result<Vec<ChatMessage>, RemoteError> {
        let mut messages = Vec::new();
        if let Some(system) = request.system {
            messages.push(ChatMessage::system(system));
        }
        let prompt = user_prompt(request.prompt, request.options.response_format);
        match request.input {
            RemoteInput::Document { handle, window } => {
                let images = self.window_images(handle, window).await?;
                messages.push(ChatMessage::user_with_images(&prompt, images));
            }
            RemoteInput::Text(text) => {
                messages.push(ChatMessage::user_with_images(
                    &with_text_input(&prompt, text),
                    vec![],
                ));
            }
        }
        Ok(messages)
    }
}

impl RemoteModel for EdgequakeModel {
    async fn upload(&self, source: &Path, sub: &SubDocument) -> Result<RemoteHandle, RemoteError> {
        tokio::fs::metadata(source).await.map_err(|e| {
            RemoteError::new(
                RemoteErrorKind::Fatal,
                format!("{}: {}", source.display(), e),
            )
        })?;
        let upload = Upload {
            source: source.to_path_buf(),
            start_page: sub.start_page,
            end_page: sub.end_page,
        };
        self.uploads
            .lock()
            .map_err(|_| RemoteError::new(RemoteErrorKind::Fatal, "upload table poisoned"))?
            .insert(sub.id.clone(), upload);
        debug!("Registered {} (p{}-{})", sub.id, sub.start_page, sub.end_page);
        Ok(RemoteHandle(sub.id.clone()))
    }

    async fn status(&self, handle: &RemoteHandle) -> Result<UploadState, RemoteError> {
        self.lookup(handle).map(|_| UploadState::Ready)
    }

    async fn generate(&self, request: GenerateRequest<'_>) -> RemoteResponse {
        let provider = match self.provider_for(request.model) {
            Ok(p) => p,
            Err(e) => return RemoteResponse::Error(e),
        };
        let messages = match self.build_messages(&request).await {
            Ok(m) => m,
            Err(e) => return RemoteResponse::Error(e),
        };
        let options = build_options(&request.options);
        let raw = match provider.chat(&messages, Some(&options)).await {
            Ok(response) => {
                debug!(
                    "{}: {} input tokens, {} output tokens",
                    request.model, response.prompt_tokens, response.completion_tokens
                );
                Ok(response.content)
            }
            Err(e) => Err(e.to_string()),
        };
        RemoteResponse::decode(raw, request.options.response_format)
    }

    async fn release(&self, handle: &RemoteHandle) {
        if let Ok(mut uploads) = self.uploads.lock() {
            uploads.remove(&handle.0);
        }
    }
}

fn build_options(options: &GenerateOptions) -> CompletionOptions {
    let base = match options.response_format {
        ResponseFormat::Json => CompletionOptions::json_mode(),
        ResponseFormat::Text => CompletionOptions::default(),
    };
    CompletionOptions {
        temperature: Some(options.temperature),
        max_tokens: Some(options.max_output_tokens),
        stop: (!options.stop_sequences.is_empty()).then(|| options.stop_sequences.clone()),
        ..base
    }
}

fn user_prompt(prompt: &str, format: ResponseFormat) -> String {
    match format {
        ResponseFormat::Json => format!("{}\n\n{}", prompt, JSON_INSTRUCTION),
        ResponseFormat::Text => prompt.to_string(),
    }
}

/// Resolve the provider for `model`, from most to least specific:
///
/// 1. `config.provider_name`
/// 2. `EDGEQUAKE_LLM_PROVIDER` from the environment
/// 3. `gemini` when `GEMINI_API_KEY` is set (the default models are Gemini)
/// 4. full auto-detection via [`ProviderFactory::from_env`]; the model name
///    cannot be honoured in that case
fn resolve_provider(
    config: &ExtractionConfig,
    model: &str,
) -> Result<Arc<dyn LLMProvider>, DongyError> {
    if let Some(ref name) = config.provider_name {
        return create_provider(name, model);
    }

    if let Ok(name) = std::env::var("EDGEQUAKE_LLM_PROVIDER") {
        if !name.is_empty() {
            return create_provider(&name, model);
        }
    }

    if std::env::var("GEMINI_API_KEY").is_ok_and(|k| !k.is_empty()) {
        return create_provider("gemini", model);
    }

    let (provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| DongyError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set GEMINI_API_KEY or pass --provider.\n\
                Error: {}",
                e
            ),
        })?;
    warn!(
        "Provider auto-detected from environment; model '{}' may not be honoured",
        model
    );
    Ok(provider)
}

fn create_provider(name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, DongyError> {
    info!("Using provider '{}' for model '{}'", name, model);
    ProviderFactory::create_llm_provider(name, model).map_err(|e| {
        DongyError::ProviderNotConfigured {
            provider: name.to_string(),
            hint: format!("{e}"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_map_to_completion_options() {
        let opts = build_options(&GenerateOptions {
            temperature: 0.2,
            max_output_tokens: 8192,
            stop_sequences: vec!["<<<HET_TRANG>>>".into()],
            response_format: ResponseFormat::Json,
        });
        assert_eq!(opts.temperature, Some(0.2));
        assert_eq!(opts.max_tokens, Some(8192));
        assert_eq!(opts.stop, Some(vec!["<<<HET_TRANG>>>".to_string()]));
        assert_eq!(opts.response_format.as_deref(), Some("json_object"));
    }

    #[test]
    fn text_requests_send_no_response_format() {
        let opts = build_options(&GenerateOptions {
            temperature: 0.0,
            max_output_tokens: 4096,
            stop_sequences: vec![],
            response_format: ResponseFormat::Text,
        });
        assert_eq!(opts.stop, None);
        assert_eq!(opts.response_format, None);
    }

    #[test]
    fn json_requests_carry_instruction() {
        assert!(user_prompt("Extract.", ResponseFormat::Json).ends_with(JSON_INSTRUCTION));
        assert_eq!(user_prompt("Transcribe.", ResponseFormat::Text), "Transcribe.");
    }

    #[test]
    fn named_provider_error_is_reported() {
        let config = ExtractionConfig::builder()
            .provider_name("no-such-provider")
            .build()
            .unwrap();
        match EdgequakeModel::from_config(&config) {
            Err(DongyError::ProviderNotConfigured { provider, .. }) => {
                assert_eq!(provider, "no-such-provider")
            }
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("unknown provider must not resolve"),
        }
    }
}
