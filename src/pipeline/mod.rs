use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::breaker::CircuitBreaker;
use crate::classify::{FailClass, StageError};
use crate::config::{Config, HttpConfig};
use crate::cookies::{CookieLookup, CookieResolver};
use crate::metrics::{MetricsRecorder, MetricsSnapshot};
use crate::proxy::{build_job_client, ProxySessionProvider};
use crate::retry::RetryEngine;
use crate::stages::{
    run_attempt, AttemptContext, AudioPipelineStage, CaptionsApiStage, ExtractionStage,
    PlayerScrapeStage, Stage, StageAttempt, TimedtextStage,
};
use crate::transcribe::SpeechClient;

/// One transcript acquisition, fully described up front.
#[derive(Debug, Clone)]
pub struct AcquisitionRequest {
    pub video_id: String,
    pub user_id: Option<String>,
    pub job_id: Uuid,
    pub language_preferences: Vec<String>,
    /// Discovery's verdict on whether the video has caption tracks.
    /// `Some(false)` routes the job straight to the audio stage.
    pub has_captions_hint: Option<bool>,
}

/// A successful acquisition: the text, which stage produced it, and the
/// full attempt history for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptResult {
    pub text: String,
    pub source_stage: Stage,
    pub attempts: Vec<StageAttempt>,
}

/// Terminal failure after the chain is exhausted (or before it could start).
#[derive(Debug, thiserror::Error)]
#[error("{class}: {message}")]
pub struct PipelineError {
    pub class: FailClass,
    pub message: String,
    pub attempts: Vec<StageAttempt>,
}

impl PipelineError {
    fn setup(error: StageError) -> Self {
        Self {
            class: error.class,
            message: error.message,
            attempts: Vec::new(),
        }
    }

    fn exhausted(error: StageError, tried: &[Stage], attempts: Vec<StageAttempt>) -> Self {
        let stages = tried
            .iter()
            .map(|stage| stage.label())
            .collect::<Vec<_>>()
            .join(", ");
        Self {
            class: error.class,
            message: format!("{} (stages tried: {})", error.message, stages),
            attempts,
        }
    }
}

/// The fixed-order extraction chain: caption stages tried first, the audio
/// pipeline always last. Order is fixed at construction and never adapted.
pub struct StageChain {
    pub caption_stages: Vec<Arc<dyn ExtractionStage>>,
    pub audio: Arc<dyn ExtractionStage>,
}

impl StageChain {
    pub fn production(config: &Config, speech: Option<SpeechClient>) -> Self {
        Self {
            caption_stages: vec![
                Arc::new(CaptionsApiStage::new()),
                Arc::new(TimedtextStage::new()),
                Arc::new(PlayerScrapeStage::new()),
            ],
            audio: Arc::new(AudioPipelineStage::new(config.audio.clone(), speech)),
        }
    }
}

/// Orchestrates one acquisition through the fallback chain.
///
/// Stages run sequentially within a job; concurrent jobs only share the
/// breaker and the metrics recorder, both of which synchronize internally.
pub struct TranscriptPipeline {
    http: HttpConfig,
    proxy: Arc<ProxySessionProvider>,
    cookies: Arc<CookieResolver>,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<MetricsRecorder>,
    retry: RetryEngine,
    chain: StageChain,
}

impl TranscriptPipeline {
    pub fn new(
        http: HttpConfig,
        proxy: Arc<ProxySessionProvider>,
        cookies: Arc<CookieResolver>,
        breaker: Arc<CircuitBreaker>,
        metrics: Arc<MetricsRecorder>,
        retry: RetryEngine,
        chain: StageChain,
    ) -> Self {
        Self {
            http,
            proxy,
            cookies,
            breaker,
            metrics,
            retry,
            chain,
        }
    }

    /// Production wiring from configuration: real stage runners, one breaker
    /// on the player stage, one shared metrics recorder.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let metrics = Arc::new(MetricsRecorder::new());
        let breaker = Arc::new(CircuitBreaker::new(
            Stage::PlayerScrape,
            config.breaker.clone(),
            Arc::clone(&metrics),
        ));
        let speech = SpeechClient::from_config(&config.audio)?;

        Ok(Self::new(
            config.http.clone(),
            Arc::new(ProxySessionProvider::new(config.proxy.clone())),
            Arc::new(CookieResolver::new(config.cookies.clone()).await),
            breaker,
            metrics,
            RetryEngine::new(config.retry.clone()),
            StageChain::production(config, speech),
        ))
    }

    pub fn proxy_provider(&self) -> &ProxySessionProvider {
        &self.proxy
    }

    pub fn cookie_resolver(&self) -> &CookieResolver {
        &self.cookies
    }

    /// Point-in-time metrics report, including current breaker state.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics
            .snapshot(self.breaker.state(), self.breaker.failure_count())
    }

    /// Acquire a transcript by walking the stage chain until one succeeds.
    ///
    /// Every attempt is recorded in metrics. A breaker-skipped stage leaves
    /// no attempt record; the breaker emits its own skip event. A geo block
    /// makes the remaining caption stages pointless (same egress, same
    /// verdict), so only the audio stage runs after one is seen.
    pub async fn acquire(
        &self,
        request: AcquisitionRequest,
    ) -> Result<TranscriptResult, PipelineError> {
        info!(
            video = %request.video_id,
            job = %request.job_id,
            hint = ?request.has_captions_hint,
            "acquiring transcript"
        );

        let session = self
            .proxy
            .session_for(request.job_id)
            .map_err(PipelineError::setup)?;
        let client = build_job_client(&session, &self.http).map_err(PipelineError::setup)?;

        let cookie_ctx = match self.cookies.resolve(request.user_id.as_deref()).await {
            CookieLookup::Found(context) => {
                debug!(
                    video = %request.video_id,
                    age_secs = context.age.as_secs(),
                    temporary = context.is_temporary,
                    "cookies resolved for audio stage"
                );
                Some(Arc::new(context))
            }
            CookieLookup::Absent(reason) => {
                info!(
                    video = %request.video_id,
                    reason = reason.label(),
                    "no usable cookies, audio stage will run cookie-less"
                );
                None
            }
        };

        let languages = if request.language_preferences.is_empty() {
            vec!["en".to_string()]
        } else {
            request.language_preferences.clone()
        };
        let base_ctx = AttemptContext {
            video_id: request.video_id.clone(),
            languages,
            http: client,
            proxy: session,
            cookies: None,
        };

        let mut attempts: Vec<StageAttempt> = Vec::new();
        let mut tried: Vec<Stage> = Vec::new();

        if request.has_captions_hint != Some(false) {
            for runner in &self.chain.caption_stages {
                let stage = runner.stage();
                let guarded = stage == self.breaker.guarded_stage();
                if guarded && !self.breaker.should_allow() {
                    continue;
                }

                tried.push(stage);
                let (outcome, attempt) = run_attempt(runner.as_ref(), &base_ctx).await;
                self.metrics.record_stage(&request.video_id, &attempt);
                if guarded {
                    self.breaker.record_outcome(attempt.success);
                }
                attempts.push(attempt);

                match outcome {
                    Ok(text) => {
                        return Ok(TranscriptResult {
                            text,
                            source_stage: stage,
                            attempts,
                        });
                    }
                    Err(error) => {
                        let geo_blocked = error.class.short_circuits_proxy_stages();
                        if geo_blocked {
                            info!(
                                video = %request.video_id,
                                stage = %stage,
                                "geo block reported, skipping remaining caption stages"
                            );
                            break;
                        }
                    }
                }
            }
        } else {
            info!(
                video = %request.video_id,
                "discovery marked video captionless, going straight to audio"
            );
        }

        tried.push(Stage::AudioPipeline);
        let audio_ctx = AttemptContext {
            cookies: cookie_ctx,
            ..base_ctx
        };
        let (outcome, audio_attempts) = self.retry.run(self.chain.audio.as_ref(), &audio_ctx).await;
        for attempt in &audio_attempts {
            self.metrics.record_stage(&request.video_id, attempt);
        }
        attempts.extend(audio_attempts);

        match outcome {
            Ok(text) => Ok(TranscriptResult {
                text,
                source_stage: Stage::AudioPipeline,
                attempts,
            }),
            Err(error) => Err(PipelineError::exhausted(error, &tried, attempts)),
        }
    }
}
