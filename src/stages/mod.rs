use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::classify::{FailClass, StageError};
use crate::cookies::CookieContext;
use crate::proxy::ProxySession;

pub mod audio;
pub mod captions;
pub mod player;
pub mod timedtext;

pub use audio::AudioPipelineStage;
pub use captions::CaptionsApiStage;
pub use player::PlayerScrapeStage;
pub use timedtext::TimedtextStage;

/// One extraction strategy in the fallback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Stage {
    #[serde(rename = "captions_api")]
    CaptionsApi,
    #[serde(rename = "timedtext")]
    Timedtext,
    #[serde(rename = "player")]
    PlayerScrape,
    #[serde(rename = "audio")]
    AudioPipeline,
}

impl Stage {
    pub fn label(&self) -> &'static str {
        match self {
            Stage::CaptionsApi => "captions_api",
            Stage::Timedtext => "timedtext",
            Stage::PlayerScrape => "player",
            Stage::AudioPipeline => "audio",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Record of one strategy invocation, immutable once completed.
#[derive(Debug, Clone, Serialize)]
pub struct StageAttempt {
    pub stage: Stage,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    pub fail_class: Option<FailClass>,
    pub proxy_used: bool,
    pub cookies_used: bool,
}

/// Everything one stage attempt needs: the job-scoped HTTP client (already
/// carrying the proxy), the proxy session itself for subprocess wiring, and
/// the cookie context when the attempt is meant to use one.
#[derive(Clone)]
pub struct AttemptContext {
    pub video_id: String,
    pub languages: Vec<String>,
    pub http: reqwest::Client,
    pub proxy: ProxySession,
    pub cookies: Option<Arc<CookieContext>>,
}

impl AttemptContext {
    pub fn without_cookies(&self) -> Self {
        let mut ctx = self.clone();
        ctx.cookies = None;
        ctx
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExtractionStage: Send + Sync {
    /// Which chain position this runner implements.
    fn stage(&self) -> Stage;

    /// Make exactly one attempt and return transcript text or a classified
    /// failure. Runners never retry internally; that is pipeline policy.
    async fn attempt(&self, ctx: &AttemptContext) -> Result<String, StageError>;
}

/// Run one attempt with timing and return the outcome together with its
/// immutable attempt record.
pub async fn run_attempt(
    runner: &dyn ExtractionStage,
    ctx: &AttemptContext,
) -> (Result<String, StageError>, StageAttempt) {
    let stage = runner.stage();
    debug!(stage = %stage, video = %ctx.video_id, proxy = %ctx.proxy, "attempting stage");

    let started_at = Utc::now();
    let started = Instant::now();
    let outcome = runner.attempt(ctx).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    match &outcome {
        Ok(text) => info!(
            stage = %stage,
            video = %ctx.video_id,
            duration_ms,
            chars = text.len(),
            "stage succeeded"
        ),
        Err(e) => warn!(
            stage = %stage,
            video = %ctx.video_id,
            duration_ms,
            class = %e.class,
            error = %e.message,
            "stage failed"
        ),
    }

    let attempt = StageAttempt {
        stage,
        started_at,
        duration_ms,
        success: outcome.is_ok(),
        fail_class: outcome.as_ref().err().map(|e| e.class),
        proxy_used: !ctx.proxy.is_direct(),
        cookies_used: ctx.cookies.is_some(),
    };
    (outcome, attempt)
}

/// One caption track advertised by the player response.
#[derive(Debug, Clone)]
pub struct CaptionTrack {
    pub base_url: String,
    pub language_code: String,
    pub kind: Option<String>,
    pub name: Option<String>,
}

impl CaptionTrack {
    /// Auto-generated (speech-recognition) tracks carry kind `asr`.
    pub fn is_generated(&self) -> bool {
        self.kind.as_deref() == Some("asr")
    }
}

/// Pull the caption track list out of a player response.
pub(crate) fn parse_caption_tracks(player_response: &serde_json::Value) -> Vec<CaptionTrack> {
    let tracks = player_response
        .pointer("/captions/playerCaptionsTracklistRenderer/captionTracks")
        .and_then(|v| v.as_array());

    let mut out = Vec::new();
    if let Some(tracks) = tracks {
        for track in tracks {
            let base_url = track.get("baseUrl").and_then(|v| v.as_str());
            let language_code = track.get("languageCode").and_then(|v| v.as_str());
            if let (Some(base_url), Some(language_code)) = (base_url, language_code) {
                out.push(CaptionTrack {
                    base_url: base_url.to_string(),
                    language_code: language_code.to_string(),
                    kind: track
                        .get("kind")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string()),
                    name: track
                        .pointer("/name/simpleText")
                        .or_else(|| track.pointer("/name/runs/0/text"))
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string()),
                });
            }
        }
    }
    out
}

/// Pick the best track: manually-authored captions in a preferred language
/// beat generated ones, preference order beats list order, and anything
/// beats nothing.
pub(crate) fn select_caption_track<'a>(
    tracks: &'a [CaptionTrack],
    languages: &[String],
) -> Option<&'a CaptionTrack> {
    let matches_lang = |track: &CaptionTrack, lang: &str| {
        track.language_code == lang || track.language_code.starts_with(&format!("{}-", lang))
    };

    for lang in languages {
        if let Some(track) = tracks
            .iter()
            .find(|t| !t.is_generated() && matches_lang(t, lang))
        {
            return Some(track);
        }
    }
    for lang in languages {
        if let Some(track) = tracks.iter().find(|t| matches_lang(t, lang)) {
            return Some(track);
        }
    }
    tracks
        .iter()
        .find(|t| !t.is_generated())
        .or_else(|| tracks.first())
}

/// Map a playability status to a classified failure, or Ok for playable
/// videos. Reasons are kept verbatim in the message.
pub(crate) fn check_playability(player_response: &serde_json::Value) -> Result<(), StageError> {
    let status = player_response
        .pointer("/playabilityStatus/status")
        .and_then(|v| v.as_str())
        .unwrap_or("UNKNOWN");
    if status == "OK" {
        return Ok(());
    }

    let reason = player_response
        .pointer("/playabilityStatus/reason")
        .and_then(|v| v.as_str())
        .unwrap_or("no reason given");
    let message = format!("playability {}: {}", status, reason);
    let reason_lower = reason.to_lowercase();

    // Reason text is more specific than the status, so it is checked first:
    // LOGIN_REQUIRED covers both bot challenges and age gates.
    let class = if reason_lower.contains("confirm your age")
        || reason_lower.contains("inappropriate for some users")
        || reason_lower.contains("age-restricted")
    {
        FailClass::AgeRestricted
    } else if reason_lower.contains("in your country") || reason_lower.contains("in your region") {
        FailClass::GeoBlocked
    } else if status == "LOGIN_REQUIRED" {
        FailClass::CookieInvalid
    } else if reason_lower.contains("unavailable") || reason_lower.contains("private") {
        FailClass::VideoUnavailable
    } else {
        return Err(StageError::classified(message));
    };
    Err(StageError::new(class, message))
}

/// Rewrite a track base URL to request the json3 transcript format.
pub(crate) fn track_json3_url(base_url: &str) -> String {
    let cleaned = base_url.replace("&fmt=srv3", "");
    if cleaned.contains("fmt=json3") {
        cleaned
    } else {
        format!("{}&fmt=json3", cleaned)
    }
}

/// Fetch a caption track and reduce it to plain text.
pub(crate) async fn download_track(
    client: &reqwest::Client,
    track: &CaptionTrack,
    video_id: &str,
) -> Result<String, StageError> {
    if track.base_url.contains("&exp=xpe") {
        return Err(StageError::new(
            FailClass::PoTokenRequired,
            format!(
                "caption track for {} requires a po_token (exp=xpe marker present)",
                video_id
            ),
        ));
    }

    let url = track_json3_url(&track.base_url);
    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| request_failure("caption track fetch", e))?;

    if !response.status().is_success() {
        return Err(http_failure(response.status(), "caption track fetch"));
    }

    let body = response
        .text()
        .await
        .map_err(|e| request_failure("caption track read", e))?;
    parse_json3_transcript(&body, video_id)
}

/// Flatten a json3 caption document into whitespace-normalized text.
pub(crate) fn parse_json3_transcript(body: &str, video_id: &str) -> Result<String, StageError> {
    if body.trim().is_empty() {
        return Err(StageError::new(
            FailClass::ExtractionError,
            format!("no caption data returned for {}", video_id),
        ));
    }

    let doc: serde_json::Value = serde_json::from_str(body).map_err(|e| {
        StageError::new(
            FailClass::ExtractionError,
            format!("failed to parse caption json for {}: {}", video_id, e),
        )
    })?;

    let mut text = String::new();
    if let Some(events) = doc.get("events").and_then(|v| v.as_array()) {
        for event in events {
            let Some(segs) = event.get("segs").and_then(|v| v.as_array()) else {
                continue;
            };
            for seg in segs {
                if let Some(utf8) = seg.get("utf8").and_then(|v| v.as_str()) {
                    text.push_str(utf8);
                }
            }
            text.push(' ');
        }
    }

    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.is_empty() {
        return Err(StageError::new(
            FailClass::ExtractionError,
            format!("caption track for {} contained no transcript text", video_id),
        ));
    }
    Ok(normalized)
}

/// Classified failure for a non-success HTTP status.
pub(crate) fn http_failure(status: reqwest::StatusCode, context: &str) -> StageError {
    let message = format!("HTTP {} during {}", status.as_u16(), context);
    if status.is_server_error() {
        StageError::new(FailClass::NetworkError, message)
    } else {
        StageError::classified(message)
    }
}

/// Classified failure for a transport-level request error.
pub(crate) fn request_failure(context: &str, e: reqwest::Error) -> StageError {
    StageError::classified(format!("{} failed: {:#}", context, anyhow::Error::from(e)))
}
