use std::time::Duration;

use rand::Rng;
use tracing::info;

use crate::classify::{self, FailClass, StageError};
use crate::config::RetryConfig;
use crate::stages::{run_attempt, AttemptContext, ExtractionStage, StageAttempt};

/// Appended when both audio attempts fail. Points operators at the usual
/// culprit instead of leaving them to guess from the combined error text.
const RETRY_EXHAUSTED_HINT: &str =
    "hint: persistent audio failures usually mean yt-dlp needs an update";

/// A/B retry policy for the audio stage: attempt once as configured, and on
/// a qualifying failure make exactly one more attempt without cookies after
/// a jittered pause. Never more than two attempts.
pub struct RetryEngine {
    config: RetryConfig,
}

impl RetryEngine {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Drive a runner through the policy. Returns the final outcome together
    /// with every attempt made, in order.
    pub async fn run(
        &self,
        runner: &dyn ExtractionStage,
        ctx: &AttemptContext,
    ) -> (Result<String, StageError>, Vec<StageAttempt>) {
        let (outcome, first) = run_attempt(runner, ctx).await;
        let first_error = match outcome {
            Ok(text) => return (Ok(text), vec![first]),
            Err(e) => e,
        };

        if !should_retry(first_error.class, first.cookies_used) {
            return (Err(first_error), vec![first]);
        }

        let delay = self.jitter();
        info!(
            stage = %runner.stage(),
            class = %first_error.class,
            delay_ms = delay.as_millis() as u64,
            "audio attempt failed, retrying without cookies"
        );
        tokio::time::sleep(delay).await;

        let retry_ctx = ctx.without_cookies();
        let (outcome, second) = run_attempt(runner, &retry_ctx).await;
        match outcome {
            Ok(text) => (Ok(text), vec![first, second]),
            Err(second_error) => {
                let combined = classify::combine(&first_error.message, &second_error.message);
                let message = format!("{} ({})", combined, RETRY_EXHAUSTED_HINT);
                (
                    Err(StageError::new(second_error.class, message)),
                    vec![first, second],
                )
            }
        }
    }

    fn jitter(&self) -> Duration {
        let min = self.config.backoff_min_ms.min(self.config.backoff_max_ms);
        let max = self.config.backoff_min_ms.max(self.config.backoff_max_ms);
        let ms = rand::thread_rng().gen_range(min..=max);
        Duration::from_millis(ms)
    }
}

/// Retry only when the second, cookie-less attempt could plausibly turn out
/// differently: cookie-tainted extraction failures, rejected cookies, and
/// throttling that a pause may clear.
pub(crate) fn should_retry(class: FailClass, cookies_used: bool) -> bool {
    match class {
        FailClass::CookieInvalid | FailClass::HttpThrottling => true,
        FailClass::ExtractionError => cookies_used,
        _ => false,
    }
}
