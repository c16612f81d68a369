use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use aws_sdk_s3::Client as S3Client;
use tempfile::TempPath;
use tracing::{debug, info, warn};

use crate::config::CookieConfig;

/// A resolved cookie file ready for the audio stage.
///
/// Temporary files (remote downloads staged locally) are deleted when the
/// context is dropped, which covers every exit path including timeouts.
pub struct CookieContext {
    path: PathBuf,
    // Dropping the TempPath removes the staged file.
    _temp: Option<TempPath>,
    pub is_temporary: bool,
    pub age: Duration,
}

impl CookieContext {
    pub(crate) fn local(path: PathBuf, age: Duration) -> Self {
        Self {
            path,
            _temp: None,
            is_temporary: false,
            age,
        }
    }

    fn temporary(temp: TempPath, age: Duration) -> Self {
        Self {
            path: temp.to_path_buf(),
            _temp: Some(temp),
            is_temporary: true,
            age,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Why no cookie context was produced. The label feeds attempt logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieAbsence {
    Stale,
    Disabled,
    NotFound,
}

impl CookieAbsence {
    pub fn label(&self) -> &'static str {
        match self {
            CookieAbsence::Stale => "stale",
            CookieAbsence::Disabled => "disabled",
            CookieAbsence::NotFound => "none",
        }
    }
}

/// Outcome of cookie resolution. Staleness and missing files are ordinary
/// outcomes here, never errors; the pipeline simply proceeds cookie-less.
pub enum CookieLookup {
    Found(CookieContext),
    Absent(CookieAbsence),
}

impl CookieLookup {
    pub fn absence_label(&self) -> Option<&'static str> {
        match self {
            CookieLookup::Found(_) => None,
            CookieLookup::Absent(reason) => Some(reason.label()),
        }
    }
}

/// Locates a user's cookie file: local store first, then the remote object
/// store, first hit wins. Files older than the freshness threshold are
/// treated as absent.
pub struct CookieResolver {
    config: CookieConfig,
    s3: Option<S3Client>,
    disabled: AtomicBool,
}

impl CookieResolver {
    pub async fn new(config: CookieConfig) -> Self {
        let s3 = if config.s3_bucket.is_some() {
            let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
                .load()
                .await;
            Some(S3Client::new(&aws_config))
        } else {
            None
        };

        let disabled = AtomicBool::new(config.disabled);
        Self {
            config,
            s3,
            disabled,
        }
    }

    /// Process-wide kill switch for mass credential incidents.
    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::Relaxed);
        if disabled {
            warn!("cookie resolution disabled via kill switch");
        } else {
            info!("cookie resolution re-enabled");
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    pub async fn resolve(&self, user_id: Option<&str>) -> CookieLookup {
        if self.is_disabled() {
            debug!("cookie resolution skipped, kill switch is on");
            return CookieLookup::Absent(CookieAbsence::Disabled);
        }

        let user_id = match user_id.and_then(safe_user_id) {
            Some(id) => id,
            None => return CookieLookup::Absent(CookieAbsence::NotFound),
        };

        let mut saw_stale = false;

        if let Some(context) = self.resolve_local(user_id, &mut saw_stale) {
            return CookieLookup::Found(context);
        }

        if let Some(context) = self.resolve_remote(user_id, &mut saw_stale).await {
            return CookieLookup::Found(context);
        }

        if saw_stale {
            info!(user = user_id, "cookie file exists but exceeded the freshness threshold");
            CookieLookup::Absent(CookieAbsence::Stale)
        } else {
            debug!(user = user_id, "no cookie file found");
            CookieLookup::Absent(CookieAbsence::NotFound)
        }
    }

    fn resolve_local(&self, user_id: &str, saw_stale: &mut bool) -> Option<CookieContext> {
        let dir = self.config.dir.as_ref()?;
        let path = dir.join(format!("{}.txt", user_id));
        if !path.is_file() {
            return None;
        }

        let age = file_age(&path)?;
        if self.is_stale(age) {
            info!(
                path = %path.display(),
                age_hours = age.as_secs() / 3600,
                "local cookie file is stale, treating as absent"
            );
            *saw_stale = true;
            return None;
        }

        self.check_format(&path);
        debug!(path = %path.display(), "using local cookie file");
        Some(CookieContext::local(path, age))
    }

    async fn resolve_remote(&self, user_id: &str, saw_stale: &mut bool) -> Option<CookieContext> {
        let s3 = self.s3.as_ref()?;
        let bucket = self.config.s3_bucket.as_deref()?;
        let key = format!("{}{}.txt", self.config.s3_key_prefix, user_id);

        let response = match s3.get_object().bucket(bucket).key(&key).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!(bucket, key, error = %e, "remote cookie lookup missed");
                return None;
            }
        };

        let age = response
            .last_modified
            .map(|modified| {
                let age_secs = chrono::Utc::now().timestamp() - modified.secs();
                Duration::from_secs(age_secs.max(0) as u64)
            })
            .unwrap_or_default();
        if self.is_stale(age) {
            info!(
                bucket,
                key,
                age_hours = age.as_secs() / 3600,
                "remote cookie object is stale, treating as absent"
            );
            *saw_stale = true;
            return None;
        }

        let data = match response.body.collect().await {
            Ok(data) => data.into_bytes(),
            Err(e) => {
                warn!(bucket, key, error = %e, "failed to read remote cookie object body");
                return None;
            }
        };

        let temp = match stage_to_temp(&data) {
            Ok(temp) => temp,
            Err(e) => {
                warn!(error = %e, "failed to stage remote cookie file");
                return None;
            }
        };

        self.check_format(&temp);
        debug!(bucket, key, "staged remote cookie file");
        Some(CookieContext::temporary(temp, age))
    }

    fn is_stale(&self, age: Duration) -> bool {
        age.as_secs() > self.config.freshness_hours * 3600
    }

    fn check_format(&self, path: &Path) {
        match fs_err::read(path) {
            Ok(bytes) => {
                let content = String::from_utf8_lossy(&bytes);
                if !looks_like_netscape(&content) {
                    warn!(
                        path = %path.display(),
                        "cookie file does not look like Netscape format, using it anyway"
                    );
                }
            }
            Err(e) => warn!(path = %path.display(), error = %e, "could not inspect cookie file"),
        }
    }
}

/// Path- and key-safe user ids only; anything else is treated as absent.
fn safe_user_id(user_id: &str) -> Option<&str> {
    let trimmed = user_id.trim();
    if trimmed.is_empty() {
        return None;
    }
    let ok = trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'));
    if !ok {
        warn!(user = trimmed, "refusing cookie lookup for unsafe user id");
        return None;
    }
    Some(trimmed)
}

fn file_age(path: &Path) -> Option<Duration> {
    let metadata = match fs_err::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "could not stat cookie file");
            return None;
        }
    };
    let modified = match metadata.modified() {
        Ok(modified) => modified,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cookie file has no modification time");
            return None;
        }
    };
    // A clock-skewed future mtime counts as brand new.
    Some(modified.elapsed().unwrap_or_default())
}

fn stage_to_temp(data: &[u8]) -> std::io::Result<TempPath> {
    let mut file = tempfile::Builder::new()
        .prefix("ytscript-cookies-")
        .suffix(".txt")
        .tempfile()?;
    file.write_all(data)?;
    Ok(file.into_temp_path())
}

/// Netscape cookie files are tab-separated with at least seven fields per
/// entry line.
fn looks_like_netscape(content: &str) -> bool {
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        return line.split('\t').count() >= 7;
    }
    content.contains("Netscape HTTP Cookie File")
}
