use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

use crate::classify::{FailClass, StageError};
use crate::config::AudioConfig;

/// Client for the HTTP speech-to-text backend consumed by the audio stage.
///
/// Built on its own HTTP client: the backend is first-party, so requests
/// egress directly instead of through the job's proxy, and the timeout is
/// sized for transcription rather than page fetches.
pub struct SpeechClient {
    endpoint: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: Option<String>,
}

impl SpeechClient {
    /// Build from config; None when no backend endpoint is configured.
    pub fn from_config(config: &AudioConfig) -> anyhow::Result<Option<Self>> {
        let Some(endpoint) = config.transcription_url.clone() else {
            return Ok(None);
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Some(Self {
            endpoint,
            api_key: config.api_key.clone(),
            client,
        }))
    }

    /// Send an audio file and return the plain transcript text.
    pub async fn transcribe_file(&self, path: &Path) -> Result<String, StageError> {
        let content_type = content_type_for(path);
        debug!(path = %path.display(), content_type, "sending audio for transcription");

        let bytes = tokio::fs::read(path).await.map_err(|e| {
            StageError::new(
                FailClass::ExtractionError,
                format!("failed to read audio file {}: {}", path.display(), e),
            )
        })?;

        let mut request = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await.map_err(|e| {
            StageError::classified(format!(
                "transcription request failed: {:#}",
                anyhow::Error::from(e)
            ))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(500).collect();
            // Some backends reflect the Authorization header into 401 bodies.
            return Err(StageError::classified(format!(
                "transcription backend returned HTTP {}: {}",
                status.as_u16(),
                self.redact(&snippet)
            )));
        }

        let parsed: TranscriptionResponse = response.json().await.map_err(|e| {
            StageError::new(
                FailClass::ExtractionError,
                format!("failed to parse transcription response: {}", e),
            )
        })?;

        match parsed.text {
            Some(text) if !text.trim().is_empty() => {
                info!(chars = text.len(), "transcription backend returned text");
                Ok(text.trim().to_string())
            }
            _ => Err(StageError::new(
                FailClass::ExtractionError,
                "transcription backend returned an empty transcript".to_string(),
            )),
        }
    }

    /// Keep the bearer token out of quoted response bodies.
    fn redact(&self, text: &str) -> String {
        match self.api_key.as_deref() {
            Some(key) if !key.is_empty() => text.replace(key, "[redacted]"),
            _ => text.to_string(),
        }
    }
}

/// Content type by audio container. Getting this wrong degrades
/// transcription quality silently instead of failing, so unknown
/// containers fall back to the generic byte type rather than guessing.
pub(crate) fn content_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("m4a") | Some("mp4") => "audio/mp4",
        Some("mp3") => "audio/mpeg",
        _ => "application/octet-stream",
    }
}
