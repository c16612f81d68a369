use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

use crate::classify::FailClass;
use crate::pipeline::{AcquisitionRequest, PipelineError, TranscriptPipeline, TranscriptResult};

/// Outcome for one video of a batch.
pub struct VideoOutcome {
    pub video_id: String,
    pub result: Result<TranscriptResult, PipelineError>,
}

/// Everything a batch produced, in input order.
pub struct JobReport {
    pub job_id: Uuid,
    pub outcomes: Vec<VideoOutcome>,
}

impl JobReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }
}

/// Runs a batch of videos through the pipeline under a concurrency bound.
///
/// All videos of one batch share a job id, and with it one sticky proxy
/// session, so challenge state solved early in the batch keeps helping the
/// later videos.
pub struct JobRunner {
    pipeline: Arc<TranscriptPipeline>,
    semaphore: Arc<Semaphore>,
}

impl JobRunner {
    pub fn new(pipeline: Arc<TranscriptPipeline>, max_concurrent: usize) -> Self {
        Self {
            pipeline,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub async fn run(
        &self,
        user_id: Option<String>,
        video_ids: Vec<String>,
        languages: Vec<String>,
        has_captions_hint: Option<bool>,
    ) -> JobReport {
        let job_id = Uuid::new_v4();
        info!(job = %job_id, videos = video_ids.len(), "starting batch");

        let mut handles = Vec::with_capacity(video_ids.len());
        for video_id in video_ids {
            let semaphore = Arc::clone(&self.semaphore);
            let pipeline = Arc::clone(&self.pipeline);
            let request = AcquisitionRequest {
                video_id: video_id.clone(),
                user_id: user_id.clone(),
                job_id,
                language_preferences: languages.clone(),
                has_captions_hint,
            };

            let handle = tokio::spawn(async move {
                let video_id = request.video_id.clone();
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return VideoOutcome {
                            video_id,
                            result: Err(PipelineError {
                                class: FailClass::Unknown,
                                message: "job pool shut down before the video could run"
                                    .to_string(),
                                attempts: Vec::new(),
                            }),
                        };
                    }
                };
                let result = pipeline.acquire(request).await;
                VideoOutcome { video_id, result }
            });
            handles.push((video_id, handle));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (video_id, handle) in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    warn!(video = %video_id, error = %e, "batch worker crashed");
                    outcomes.push(VideoOutcome {
                        video_id,
                        result: Err(PipelineError {
                            class: FailClass::Unknown,
                            message: format!("worker task failed: {}", e),
                            attempts: Vec::new(),
                        }),
                    });
                }
            }
        }

        let report = JobReport { job_id, outcomes };
        info!(
            job = %job_id,
            succeeded = report.succeeded(),
            failed = report.failed(),
            "batch finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreaker;
    use crate::classify::StageError;
    use crate::config::{Config, RetryConfig};
    use crate::cookies::CookieResolver;
    use crate::metrics::MetricsRecorder;
    use crate::proxy::ProxySessionProvider;
    use crate::retry::RetryEngine;
    use crate::stages::{MockExtractionStage, Stage};
    use crate::pipeline::StageChain;
    use std::sync::Mutex;

    async fn audio_only_pipeline(audio: MockExtractionStage) -> Arc<TranscriptPipeline> {
        let metrics = Arc::new(MetricsRecorder::new());
        let breaker = Arc::new(CircuitBreaker::new(
            Stage::PlayerScrape,
            Config::default().breaker,
            Arc::clone(&metrics),
        ));
        Arc::new(TranscriptPipeline::new(
            Config::default().http,
            Arc::new(ProxySessionProvider::new(Config::default().proxy)),
            Arc::new(CookieResolver::new(Config::default().cookies).await),
            breaker,
            metrics,
            RetryEngine::new(RetryConfig {
                backoff_min_ms: 0,
                backoff_max_ms: 1,
            }),
            StageChain {
                caption_stages: vec![],
                audio: Arc::new(audio),
            },
        ))
    }

    #[tokio::test]
    async fn test_batch_shares_one_proxy_session() {
        let profiles: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&profiles);

        let mut audio = MockExtractionStage::new();
        audio.expect_stage().return_const(Stage::AudioPipeline);
        audio.expect_attempt().returning(move |ctx| {
            seen.lock().unwrap().push(ctx.proxy.profile.clone());
            Ok("text".to_string())
        });

        let runner = JobRunner::new(audio_only_pipeline(audio).await, 2);
        let report = runner
            .run(
                None,
                vec![
                    "vid00000001".to_string(),
                    "vid00000002".to_string(),
                    "vid00000003".to_string(),
                ],
                vec!["en".to_string()],
                None,
            )
            .await;

        assert_eq!(report.succeeded(), 3);
        assert_eq!(report.failed(), 0);

        let profiles = profiles.lock().unwrap();
        assert_eq!(profiles.len(), 3);
        assert!(profiles.iter().all(|p| p == &profiles[0]));
    }

    #[tokio::test]
    async fn test_batch_reports_failures_in_input_order() {
        let mut audio = MockExtractionStage::new();
        audio.expect_stage().return_const(Stage::AudioPipeline);
        audio
            .expect_attempt()
            .withf(|ctx| ctx.video_id == "vid0000_bad")
            .returning(|_| {
                Err(StageError::new(
                    FailClass::VideoUnavailable,
                    "Video unavailable",
                ))
            });
        audio
            .expect_attempt()
            .returning(|_| Ok("text".to_string()));

        let runner = JobRunner::new(audio_only_pipeline(audio).await, 1);
        let report = runner
            .run(
                None,
                vec![
                    "vid00000001".to_string(),
                    "vid0000_bad".to_string(),
                    "vid00000003".to_string(),
                ],
                vec!["en".to_string()],
                None,
            )
            .await;

        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.failed(), 1);
        let order: Vec<&str> = report
            .outcomes
            .iter()
            .map(|o| o.video_id.as_str())
            .collect();
        assert_eq!(order, ["vid00000001", "vid0000_bad", "vid00000003"]);
        assert!(report.outcomes[1].result.is_err());
        assert!(report.outcomes[0].result.is_ok());
        assert!(report.outcomes[2].result.is_ok());
    }

    #[tokio::test]
    async fn test_batch_survives_a_panicking_worker() {
        let mut audio = MockExtractionStage::new();
        audio.expect_stage().return_const(Stage::AudioPipeline);
        audio
            .expect_attempt()
            .withf(|ctx| ctx.video_id == "vid0000_bad")
            .returning(|_| panic!("decoder crashed mid-download"));
        audio
            .expect_attempt()
            .returning(|_| Ok("text".to_string()));

        let runner = JobRunner::new(audio_only_pipeline(audio).await, 1);
        let report = runner
            .run(
                None,
                vec![
                    "vid00000001".to_string(),
                    "vid0000_bad".to_string(),
                    "vid00000003".to_string(),
                ],
                vec!["en".to_string()],
                None,
            )
            .await;

        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.outcomes[1].video_id, "vid0000_bad");
        let err = report.outcomes[1].result.as_ref().unwrap_err();
        assert_eq!(err.class, FailClass::Unknown);
        assert!(err.message.contains("worker task failed"));
    }
}
