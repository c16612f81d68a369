use async_trait::async_trait;
use tracing::debug;

use crate::classify::{FailClass, StageError};
use crate::stages::{
    http_failure, parse_json3_transcript, request_failure, AttemptContext, ExtractionStage, Stage,
};

const TIMEDTEXT_URL: &str = "https://www.youtube.com/api/timedtext";

/// Lightweight scrape: hit the caption endpoint directly per preferred
/// language, once for manual tracks and once for generated ones. No player
/// call, no key extraction; the endpoint simply answers an empty body when
/// the requested track does not exist.
pub struct TimedtextStage;

impl TimedtextStage {
    pub fn new() -> Self {
        Self
    }

    async fn fetch_language(
        &self,
        ctx: &AttemptContext,
        lang: &str,
        generated: bool,
    ) -> Result<Option<String>, StageError> {
        let mut url = format!(
            "{}?v={}&lang={}&fmt=json3",
            TIMEDTEXT_URL,
            urlencoding::encode(&ctx.video_id),
            urlencoding::encode(lang)
        );
        if generated {
            url.push_str("&kind=asr");
        }

        let response = ctx
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| request_failure("timedtext fetch", e))?;
        if !response.status().is_success() {
            // Throttling or blocking applies to every language equally, so
            // the whole stage fails rather than iterating on.
            return Err(http_failure(response.status(), "timedtext fetch"));
        }

        let body = response
            .text()
            .await
            .map_err(|e| request_failure("timedtext read", e))?;
        if body.trim().is_empty() {
            debug!(video = %ctx.video_id, lang, generated, "timedtext returned no track");
            return Ok(None);
        }

        match parse_json3_transcript(&body, &ctx.video_id) {
            Ok(text) => Ok(Some(text)),
            // A well-formed but caption-less document counts as a miss for
            // this language, not a stage failure.
            Err(e) if e.class == FailClass::ExtractionError => {
                debug!(video = %ctx.video_id, lang, generated, "timedtext track was empty");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

impl Default for TimedtextStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExtractionStage for TimedtextStage {
    fn stage(&self) -> Stage {
        Stage::Timedtext
    }

    async fn attempt(&self, ctx: &AttemptContext) -> Result<String, StageError> {
        let fallback = ["en".to_string()];
        let languages: &[String] = if ctx.languages.is_empty() {
            &fallback
        } else {
            &ctx.languages
        };

        for lang in languages {
            if let Some(text) = self.fetch_language(ctx, lang, false).await? {
                return Ok(text);
            }
            if let Some(text) = self.fetch_language(ctx, lang, true).await? {
                return Ok(text);
            }
        }

        Err(StageError::new(
            FailClass::ExtractionError,
            format!(
                "no captions available via timedtext for {} (languages: {})",
                ctx.video_id,
                languages.join(", ")
            ),
        ))
    }
}
