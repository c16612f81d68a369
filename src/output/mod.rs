use anyhow::Result;
use std::path::Path;

use crate::cli::OutputFormat;
use crate::metrics::MetricsSnapshot;
use crate::pipeline::TranscriptResult;

/// Render an acquisition result in the requested format. JSON keeps the full
/// attempt history for diagnostics; text is just the transcript.
pub fn render(result: &TranscriptResult, format: &OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Text => Ok(result.text.clone()),
        OutputFormat::Json => Ok(serde_json::to_string_pretty(result)?),
    }
}

/// Save an acquisition result to file
pub async fn save_to_file(
    result: &TranscriptResult,
    path: &Path,
    format: &OutputFormat,
) -> Result<()> {
    let content = render(result, format)?;
    fs_err::write(path, content)?;
    Ok(())
}

/// Print an acquisition result to console
pub fn print_to_console(result: &TranscriptResult, format: &OutputFormat) -> Result<()> {
    println!("{}", render(result, format)?);
    Ok(())
}

/// Human-readable metrics report for `--stats`.
pub fn format_stats(snapshot: &MetricsSnapshot) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Pipeline stats at {}\n",
        snapshot.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    out.push_str(&format!(
        "Breaker: {} ({} consecutive failures, {} recent events)\n",
        snapshot.breaker.state,
        snapshot.breaker.consecutive_failures,
        snapshot.breaker.recent_events.len()
    ));

    for report in &snapshot.stages {
        let p50 = report
            .p50_ms
            .map(|v| format!("{}ms", v))
            .unwrap_or_else(|| "-".to_string());
        let p95 = report
            .p95_ms
            .map(|v| format!("{}ms", v))
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "  {:<12} {:>5} attempts {:>5} ok {:>5} failed   p50 {:>8}   p95 {:>8}\n",
            report.stage.label(),
            report.attempts,
            report.successes,
            report.failures,
            p50,
            p95
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerState;
    use crate::metrics::MetricsRecorder;
    use crate::stages::{Stage, StageAttempt};

    fn sample_result() -> TranscriptResult {
        TranscriptResult {
            text: "hello world".to_string(),
            source_stage: Stage::CaptionsApi,
            attempts: vec![StageAttempt {
                stage: Stage::CaptionsApi,
                started_at: chrono::Utc::now(),
                duration_ms: 412,
                success: true,
                fail_class: None,
                proxy_used: false,
                cookies_used: false,
            }],
        }
    }

    #[test]
    fn test_render_text_is_bare_transcript() {
        let rendered = render(&sample_result(), &OutputFormat::Text).unwrap();
        assert_eq!(rendered, "hello world");
    }

    #[test]
    fn test_render_json_carries_attempts() {
        let rendered = render(&sample_result(), &OutputFormat::Json).unwrap();
        assert!(rendered.contains("\"source_stage\": \"captions_api\""));
        assert!(rendered.contains("\"attempts\""));
        assert!(rendered.contains("\"duration_ms\": 412"));
    }

    #[tokio::test]
    async fn test_save_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transcript.txt");
        save_to_file(&sample_result(), &path, &OutputFormat::Text)
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello world");
    }

    #[test]
    fn test_format_stats_lists_stages_and_breaker() {
        let metrics = MetricsRecorder::new();
        let snapshot = metrics.snapshot(BreakerState::Closed, 0);

        let stats = format_stats(&snapshot);
        assert!(stats.contains("Breaker: CLOSED"));
        assert!(stats.contains("captions_api"));
        assert!(stats.contains("timedtext"));
        assert!(stats.contains("player"));
        assert!(stats.contains("audio"));
    }
}
