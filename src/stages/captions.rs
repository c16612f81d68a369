use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use crate::classify::{FailClass, StageError};
use crate::stages::{
    check_playability, download_track, http_failure, parse_caption_tracks, request_failure,
    select_caption_track, AttemptContext, ExtractionStage, Stage,
};

const WATCH_URL: &str = "https://www.youtube.com/watch?v=";
const INNERTUBE_PLAYER_URL: &str = "https://www.youtube.com/youtubei/v1/player?key=";

/// Client identity presented on the InnerTube player call. The ANDROID
/// client still serves caption tracks without sign-in for most videos.
const ANDROID_CLIENT_VERSION: &str = "20.10.38";

/// Official caption route: watch page, InnerTube key, player call, track
/// download. Two round trips, but the least likely to be challenged.
pub struct CaptionsApiStage;

impl CaptionsApiStage {
    pub fn new() -> Self {
        Self
    }

    async fn fetch_watch_html(&self, ctx: &AttemptContext) -> Result<String, StageError> {
        let url = format!("{}{}", WATCH_URL, ctx.video_id);
        let response = ctx
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| request_failure("watch page fetch", e))?;
        if !response.status().is_success() {
            return Err(http_failure(response.status(), "watch page fetch"));
        }
        let html = response
            .text()
            .await
            .map_err(|e| request_failure("watch page read", e))?;

        if !needs_consent(&html) {
            return Ok(html);
        }

        // A consent interstitial was interposed. Repeat the request with an
        // explicit consent cookie derived from the form value.
        let consent_value = extract_consent_value(&html).ok_or_else(|| {
            StageError::new(
                FailClass::ExtractionError,
                format!(
                    "failed to parse consent form while fetching watch page for {}",
                    ctx.video_id
                ),
            )
        })?;
        debug!(video = %ctx.video_id, "retrying watch page with consent cookie");

        let response = ctx
            .http
            .get(&url)
            .header(
                reqwest::header::COOKIE,
                format!("CONSENT=YES+{}", consent_value),
            )
            .send()
            .await
            .map_err(|e| request_failure("watch page fetch after consent", e))?;
        if !response.status().is_success() {
            return Err(http_failure(response.status(), "watch page fetch after consent"));
        }
        let html = response
            .text()
            .await
            .map_err(|e| request_failure("watch page read after consent", e))?;
        if needs_consent(&html) {
            return Err(StageError::new(
                FailClass::ExtractionError,
                format!("consent interstitial persisted for {}", ctx.video_id),
            ));
        }
        Ok(html)
    }

    async fn fetch_player_response(
        &self,
        ctx: &AttemptContext,
        api_key: &str,
    ) -> Result<serde_json::Value, StageError> {
        let url = format!("{}{}", INNERTUBE_PLAYER_URL, api_key);
        let body = serde_json::json!({
            "context": {
                "client": {
                    "clientName": "ANDROID",
                    "clientVersion": ANDROID_CLIENT_VERSION
                }
            },
            "videoId": ctx.video_id
        });

        let response = ctx
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| request_failure("player api call", e))?;
        if !response.status().is_success() {
            return Err(http_failure(response.status(), "player api call"));
        }
        response
            .json()
            .await
            .map_err(|e| request_failure("player api decode", e))
    }
}

impl Default for CaptionsApiStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExtractionStage for CaptionsApiStage {
    fn stage(&self) -> Stage {
        Stage::CaptionsApi
    }

    async fn attempt(&self, ctx: &AttemptContext) -> Result<String, StageError> {
        let html = self.fetch_watch_html(ctx).await?;
        let api_key = extract_api_key(&html, &ctx.video_id)?;
        let player_response = self.fetch_player_response(ctx, &api_key).await?;
        check_playability(&player_response)?;

        let tracks = parse_caption_tracks(&player_response);
        if tracks.is_empty() {
            return Err(StageError::new(
                FailClass::ExtractionError,
                format!("no caption tracks listed for {}", ctx.video_id),
            ));
        }
        let track = select_caption_track(&tracks, &ctx.languages).ok_or_else(|| {
            StageError::new(
                FailClass::ExtractionError,
                format!("no caption track usable for {}", ctx.video_id),
            )
        })?;
        debug!(
            video = %ctx.video_id,
            language = %track.language_code,
            generated = track.is_generated(),
            "selected caption track"
        );
        download_track(&ctx.http, track, &ctx.video_id).await
    }
}

fn needs_consent(html: &str) -> bool {
    html.contains("action=\"https://consent.youtube.com/s\"")
}

fn extract_consent_value(html: &str) -> Option<String> {
    let re = Regex::new(r#"name="v" value="(.*?)""#).ok()?;
    re.captures(html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

fn extract_api_key(html: &str, video_id: &str) -> Result<String, StageError> {
    // A recaptcha interstitial means the egress IP is being challenged.
    if html.contains("g-recaptcha") {
        return Err(StageError::new(
            FailClass::HttpThrottling,
            format!("recaptcha challenge served for {}", video_id),
        ));
    }

    let re = Regex::new(r#""INNERTUBE_API_KEY":\s*"([a-zA-Z0-9_-]+)""#).map_err(|e| {
        StageError::new(
            FailClass::ExtractionError,
            format!("api key pattern failed to compile: {}", e),
        )
    })?;
    re.captures(html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| {
            StageError::new(
                FailClass::ExtractionError,
                format!("unable to extract InnerTube api key for {}", video_id),
            )
        })
}
