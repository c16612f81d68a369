use url::Url;

/// Length of a canonical video identifier.
const VIDEO_ID_LEN: usize = 11;

/// Check whether a string is a well-formed 11-character video id.
pub fn is_valid_video_id(candidate: &str) -> bool {
    candidate.len() == VIDEO_ID_LEN
        && candidate
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Extract a video id from a bare id or any of the common URL shapes
/// (`watch?v=`, `youtu.be/`, `/shorts/`, `/embed/`, `/live/`, `/v/`).
pub fn extract_video_id(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if is_valid_video_id(trimmed) {
        return Some(trimmed.to_string());
    }

    let url = Url::parse(trimmed).ok()?;
    let host = url.host_str()?;
    let host = host.strip_prefix("www.").unwrap_or(host);

    let candidate = if host == "youtu.be" {
        url.path_segments()?.next().map(|s| s.to_string())
    } else if host.ends_with("youtube.com") || host.ends_with("youtube-nocookie.com") {
        if let Some((_, v)) = url.query_pairs().find(|(k, _)| k == "v") {
            Some(v.into_owned())
        } else {
            let mut segments = url.path_segments()?;
            match segments.next() {
                Some("shorts") | Some("embed") | Some("live") | Some("v") => {
                    segments.next().map(|s| s.to_string())
                }
                _ => None,
            }
        }
    } else {
        None
    };

    candidate.filter(|id| is_valid_video_id(id))
}

/// Mask a username for log output, keeping only a short recognizable prefix.
pub fn mask_username(username: &str) -> String {
    let visible: String = username.chars().take(2).collect();
    format!("{}***", visible)
}

/// Normalize a human-entered language into a caption language code. Region
/// variants like `pt-BR` pass through unchanged since the caption endpoints
/// treat them case-sensitively.
pub fn normalize_language_code(lang: &str) -> String {
    let trimmed = lang.trim();
    match trimmed.to_lowercase().as_str() {
        "english" => "en".to_string(),
        "spanish" => "es".to_string(),
        "french" => "fr".to_string(),
        "german" => "de".to_string(),
        "italian" => "it".to_string(),
        "portuguese" => "pt".to_string(),
        "japanese" => "ja".to_string(),
        "korean" => "ko".to_string(),
        "chinese" => "zh".to_string(),
        "arabic" => "ar".to_string(),
        "hindi" => "hi".to_string(),
        "russian" => "ru".to_string(),
        _ => trimmed.to_string(),
    }
}

/// Format file size in human-readable form.
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    const THRESHOLD: f64 = 1024.0;

    if bytes == 0 {
        return "0 B".to_string();
    }

    let bytes_f = bytes as f64;
    let unit_index = (bytes_f.log10() / THRESHOLD.log10()).floor() as usize;
    let unit_index = unit_index.min(UNITS.len() - 1);

    let size = bytes_f / THRESHOLD.powi(unit_index as i32);

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

/// Check if the current environment has the tools the audio stage needs.
pub async fn check_dependencies(yt_dlp_path: &str) -> Vec<String> {
    let mut missing = Vec::new();

    if !check_command_available(yt_dlp_path).await {
        missing.push(format!(
            "{} - required for the audio fallback stage",
            yt_dlp_path
        ));
    }

    missing
}

/// Check if a command is available in PATH.
async fn check_command_available(command: &str) -> bool {
    use tokio::process::Command;

    Command::new(command)
        .arg("--version")
        .output()
        .await
        .map(|output| output.status.success())
        .unwrap_or(false)
}
