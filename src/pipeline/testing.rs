//! Scripted [`RemoteModel`] for stage tests.

use super::remote::{GenerateRequest, RemoteHandle, RemoteModel, RemoteResponse, UploadState};
use super::split::SubDocument;
use crate::error::{RemoteError, RemoteErrorKind};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;

/// Replies to `generate` in script order and records which model was asked.
#[derive(Default)]
pub(crate) struct ScriptedModel {
    replies: Mutex<VecDeque<RemoteResponse>>,
    states: Mutex<VecDeque<UploadState>>,
    stuck: bool,
    calls: Mutex<Vec<String>>,
    released: Mutex<Vec<RemoteHandle>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(self, body: impl Into<String>) -> Self {
        self.reply(RemoteResponse::Text(body.into()))
    }

    pub fn error(self, message: &str) -> Self {
        self.reply(RemoteResponse::Error(RemoteError::from_message(message)))
    }

    pub fn reply(self, response: RemoteResponse) -> Self {
        self.replies.lock().unwrap().push_back(response);
        self
    }

    /// Status answers before the upload reports ready.
    pub fn states(self, states: Vec<UploadState>) -> Self {
        self.states.lock().unwrap().extend(states);
        self
    }

    /// Every status poll answers `Processing`.
    pub fn stuck(mut self) -> Self {
        self.stuck = true;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn released(&self) -> usize {
        self.released.lock().unwrap().len()
    }
}

impl RemoteModel for ScriptedModel {
    async fn upload(&self, _source: &Path, sub: &SubDocument) -> Result<RemoteHandle, RemoteError> {
        Ok(RemoteHandle(sub.id.clone()))
    }

    async fn status(&self, _handle: &RemoteHandle) -> Result<UploadState, RemoteError> {
        if self.stuck {
            return Ok(UploadState::Processing);
        }
        Ok(self
            .states
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(UploadState::Ready))
    }

    async fn generate(&self, request: GenerateRequest<'_>) -> RemoteResponse {
        self.calls.lock().unwrap().push(request.model.to_string());
        self.replies.lock().unwrap().pop_front().unwrap_or_else(|| {
            RemoteResponse::Error(RemoteError::new(RemoteErrorKind::Fatal, "script exhausted"))
        })
    }

    async fn release(&self, handle: &RemoteHandle) {
        self.released.lock().unwrap().push(handle.clone());
    }
}

/// Forty distinct words: long enough to pass the length floor, never repetitive.
pub(crate) fn page_text(tag: &str) -> String {
    (0..40)
        .map(|i| format!("{tag}{i}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// The same sentence three times over.
pub(crate) fn looping_text() -> String {
    let group = "Cam thảo vị ngọt tính bình quy kinh Tâm Phế Tỳ Vị có tác dụng bổ trung ích khí";
    [group, group, group].join(" ")
}
