use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::classify::{FailClass, StageError};
use crate::config::AudioConfig;
use crate::transcribe::SpeechClient;
use crate::utils;

use super::{AttemptContext, ExtractionStage, Stage};

/// Lowest-bitrate audio that still transcribes well; m4a preferred because
/// the speech backend handles it natively.
const AUDIO_FORMAT: &str = "worstaudio[ext=m4a]/worstaudio/worst";

const OUTPUT_STEM: &str = "audio";

/// Last-resort stage: download the audio with yt-dlp and send it to the
/// speech-to-text backend. The only stage that consumes cookies, and the only
/// one that works for videos with no caption tracks at all.
pub struct AudioPipelineStage {
    config: AudioConfig,
    speech: Option<SpeechClient>,
}

impl AudioPipelineStage {
    pub fn new(config: AudioConfig, speech: Option<SpeechClient>) -> Self {
        Self { config, speech }
    }

    async fn download_audio(
        &self,
        ctx: &AttemptContext,
        dir: &Path,
    ) -> Result<PathBuf, StageError> {
        let output_template = dir.join(format!("{}.%(ext)s", OUTPUT_STEM));
        let args = build_args(ctx, &self.config, &output_template);

        // Args carry the proxy URL with credentials, so they are never logged.
        debug!(
            video_id = %ctx.video_id,
            proxied = !ctx.proxy.is_direct(),
            cookies = ctx.cookies.is_some(),
            "running yt-dlp"
        );

        let output = Command::new(&self.config.yt_dlp_path)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                StageError::new(
                    FailClass::ExtractionError,
                    format!("failed to launch yt-dlp: {}", e),
                )
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // yt-dlp echoes its --proxy argument into some error messages.
            return Err(StageError::classified(format!(
                "yt-dlp failed: {}",
                ctx.proxy.redact(&salient_stderr(&stderr))
            )));
        }

        find_downloaded_file(dir)
    }
}

#[async_trait]
impl ExtractionStage for AudioPipelineStage {
    fn stage(&self) -> Stage {
        Stage::AudioPipeline
    }

    async fn attempt(&self, ctx: &AttemptContext) -> Result<String, StageError> {
        let Some(speech) = &self.speech else {
            return Err(StageError::new(
                FailClass::ExtractionError,
                "transcription backend not configured (audio.transcription_url)".to_string(),
            ));
        };

        let workdir = tempfile::tempdir().map_err(|e| {
            StageError::new(
                FailClass::ExtractionError,
                format!("failed to create download directory: {}", e),
            )
        })?;

        let audio_path = self.download_audio(ctx, workdir.path()).await?;
        if let Ok(metadata) = fs_err::metadata(&audio_path) {
            info!(
                video_id = %ctx.video_id,
                size = %utils::format_file_size(metadata.len()),
                "audio downloaded"
            );
        }

        // The workdir and its audio file are removed when this returns.
        speech.transcribe_file(&audio_path).await
    }
}

/// Argument list for one yt-dlp invocation. Proxy and cookies are appended
/// only when the attempt context carries them, which is what makes the
/// cookie-less retry a genuinely different attempt.
fn build_args(ctx: &AttemptContext, config: &AudioConfig, output_template: &Path) -> Vec<String> {
    let mut args = vec![
        "--output".to_string(),
        output_template.display().to_string(),
        "--format".to_string(),
        AUDIO_FORMAT.to_string(),
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
        "--socket-timeout".to_string(),
        config.socket_timeout_secs.to_string(),
    ];

    if let Some(endpoint) = ctx.proxy.authority_url() {
        args.push("--proxy".to_string());
        args.push(endpoint.as_str().to_string());
    }

    if let Some(cookies) = &ctx.cookies {
        args.push("--cookies".to_string());
        args.push(cookies.path().display().to_string());
    }

    args.push(format!("https://www.youtube.com/watch?v={}", ctx.video_id));
    args
}

/// Reduce yt-dlp stderr to the part worth classifying: ERROR: lines when
/// present, otherwise the last non-empty line.
fn salient_stderr(stderr: &str) -> String {
    let errors: Vec<&str> = stderr
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("ERROR:"))
        .collect();
    if !errors.is_empty() {
        return errors.join("; ");
    }

    stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .unwrap_or("yt-dlp exited with a failure status and empty stderr")
        .to_string()
}

/// Locate the file yt-dlp produced. The extension is whatever format the
/// selector landed on, so match on the stem.
fn find_downloaded_file(dir: &Path) -> Result<PathBuf, StageError> {
    let entries = fs_err::read_dir(dir).map_err(|e| {
        StageError::new(
            FailClass::ExtractionError,
            format!("failed to scan download directory: {}", e),
        )
    })?;

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_file() && path.file_stem().and_then(|s| s.to_str()) == Some(OUTPUT_STEM) {
            return Ok(path);
        }
    }

    Err(StageError::new(
        FailClass::ExtractionError,
        "yt-dlp reported success but produced no audio file".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ProxyConfig};
    use crate::cookies::CookieContext;
    use crate::proxy::ProxySessionProvider;
    use std::sync::Arc;
    use std::time::Duration;
    use uuid::Uuid;

    fn direct_ctx() -> AttemptContext {
        let provider = ProxySessionProvider::new(Config::default().proxy);
        AttemptContext {
            video_id: "dQw4w9WgXcQ".to_string(),
            languages: vec!["en".to_string()],
            http: reqwest::Client::new(),
            proxy: provider.session_for(Uuid::new_v4()).unwrap(),
            cookies: None,
        }
    }

    fn proxied_ctx() -> AttemptContext {
        let provider = ProxySessionProvider::new(ProxyConfig {
            provider: Some("resi".to_string()),
            host: Some("gate.example.net".to_string()),
            port: Some(7000),
            username: Some("customer42".to_string()),
            password: Some("hunter2".to_string()),
            protocol: "http".to_string(),
            geo_enabled: false,
            country: None,
            allow_direct_fallback: false,
            preflight_ttl_secs: 30,
        });
        let mut ctx = direct_ctx();
        ctx.proxy = provider.session_for(Uuid::new_v4()).unwrap();
        ctx
    }

    fn audio_config() -> AudioConfig {
        Config::default().audio
    }

    #[test]
    fn test_build_args_direct_without_cookies() {
        let ctx = direct_ctx();
        let args = build_args(&ctx, &audio_config(), Path::new("/tmp/dl/audio.%(ext)s"));

        assert!(args.contains(&"--no-playlist".to_string()));
        assert!(args.contains(&"--socket-timeout".to_string()));
        assert!(!args.contains(&"--proxy".to_string()));
        assert!(!args.contains(&"--cookies".to_string()));
        assert_eq!(
            args.last().unwrap(),
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ"
        );
    }

    #[test]
    fn test_build_args_with_proxy_and_cookies() {
        let mut ctx = proxied_ctx();
        ctx.cookies = Some(Arc::new(CookieContext::local(
            PathBuf::from("/var/cookies/alice.txt"),
            Duration::from_secs(60),
        )));

        let args = build_args(&ctx, &audio_config(), Path::new("/tmp/dl/audio.%(ext)s"));

        let proxy_pos = args.iter().position(|a| a == "--proxy").unwrap();
        assert!(args[proxy_pos + 1].contains("gate.example.net:7000"));

        let cookie_pos = args.iter().position(|a| a == "--cookies").unwrap();
        assert_eq!(args[cookie_pos + 1], "/var/cookies/alice.txt");
    }

    #[test]
    fn test_cookieless_retry_context_drops_cookie_arg() {
        let mut ctx = direct_ctx();
        ctx.cookies = Some(Arc::new(CookieContext::local(
            PathBuf::from("/var/cookies/alice.txt"),
            Duration::from_secs(60),
        )));

        let with = build_args(&ctx, &audio_config(), Path::new("/tmp/dl/audio.%(ext)s"));
        let without = build_args(
            &ctx.without_cookies(),
            &audio_config(),
            Path::new("/tmp/dl/audio.%(ext)s"),
        );

        assert!(with.contains(&"--cookies".to_string()));
        assert!(!without.contains(&"--cookies".to_string()));
    }

    #[test]
    fn test_salient_stderr_prefers_error_lines() {
        let stderr = "\
[youtube] dQw4w9WgXcQ: Downloading webpage
WARNING: unable to fetch PO token
ERROR: Sign in to confirm you're not a bot
[download] giving up";
        assert_eq!(
            salient_stderr(stderr),
            "ERROR: Sign in to confirm you're not a bot"
        );
    }

    #[test]
    fn test_salient_stderr_joins_multiple_errors() {
        let stderr = "ERROR: first\nsome noise\nERROR: second\n";
        assert_eq!(salient_stderr(stderr), "ERROR: first; ERROR: second");
    }

    #[test]
    fn test_salient_stderr_falls_back_to_last_line() {
        let stderr = "[youtube] downloading\nConnection reset by peer\n\n";
        assert_eq!(salient_stderr(stderr), "Connection reset by peer");
        assert!(salient_stderr("").contains("empty stderr"));
    }

    #[test]
    fn test_stderr_quoting_hides_proxy_credentials() {
        let ctx = proxied_ctx();
        let endpoint = ctx.proxy.authority_url().unwrap().to_string();
        let stderr = format!("ERROR: Unable to connect to proxy {}\n", endpoint);

        let quoted = ctx.proxy.redact(&salient_stderr(&stderr));
        assert!(quoted.starts_with("ERROR:"));
        assert!(!quoted.contains("hunter2"));
        assert!(!quoted.contains("customer42"));
    }

    #[test]
    fn test_find_downloaded_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("audio.m4a"), b"data").unwrap();
        std::fs::write(dir.path().join("other.txt"), b"noise").unwrap();

        let found = find_downloaded_file(dir.path()).unwrap();
        assert_eq!(found.file_name().unwrap(), "audio.m4a");
    }

    #[test]
    fn test_find_downloaded_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = find_downloaded_file(dir.path()).unwrap_err();
        assert_eq!(err.class, FailClass::ExtractionError);
        assert!(err.message.contains("no audio file"));
    }

    #[tokio::test]
    async fn test_missing_backend_is_extraction_error() {
        let stage = AudioPipelineStage::new(audio_config(), None);
        let err = stage.attempt(&direct_ctx()).await.unwrap_err();
        assert_eq!(err.class, FailClass::ExtractionError);
        assert!(err.message.contains("transcription backend not configured"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_extraction_error() {
        let mut config = audio_config();
        config.yt_dlp_path = "/nonexistent/yt-dlp-missing".to_string();
        config.transcription_url = Some("https://speech.example.com/v1".to_string());

        let speech = SpeechClient::from_config(&config).unwrap();
        let stage = AudioPipelineStage::new(config, speech);

        let err = stage.attempt(&direct_ctx()).await.unwrap_err();
        assert_eq!(err.class, FailClass::ExtractionError);
        assert!(err.message.contains("failed to launch yt-dlp"));
    }
}
