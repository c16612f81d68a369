use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::utils::mask_username;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Proxy egress settings
    pub proxy: ProxyConfig,

    /// Cookie store settings
    pub cookies: CookieConfig,

    /// Circuit breaker tuning for the player scrape stage
    pub breaker: BreakerConfig,

    /// Audio pipeline retry tuning
    pub retry: RetryConfig,

    /// Audio download and transcription backend settings
    pub audio: AudioConfig,

    /// HTTP client settings
    pub http: HttpConfig,

    /// Application settings
    pub app: AppConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Provider label used in session profile names
    pub provider: Option<String>,

    /// Proxy gateway host
    pub host: Option<String>,

    /// Proxy gateway port
    pub port: Option<u16>,

    /// Account username (session suffixes are appended per job)
    pub username: Option<String>,

    /// Account password
    pub password: Option<String>,

    /// Proxy scheme: http, https or socks5
    pub protocol: String,

    /// Request geo-targeted egress
    pub geo_enabled: bool,

    /// Two-letter country code for geo-targeted egress
    pub country: Option<String>,

    /// Permit direct (proxy-less) egress when no proxy is configured
    pub allow_direct_fallback: bool,

    /// How long a preflight probe result stays cached
    pub preflight_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CookieConfig {
    /// Local cookie store directory ({dir}/{user_id}.txt)
    pub dir: Option<PathBuf>,

    /// S3 bucket holding the remote cookie store
    pub s3_bucket: Option<String>,

    /// Key prefix inside the bucket
    pub s3_key_prefix: String,

    /// Cookie files older than this are treated as absent
    pub freshness_hours: u64,

    /// Kill switch: skip cookie resolution entirely
    pub disabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens
    pub failure_threshold: u32,

    /// Seconds the breaker stays open before admitting a probe
    pub cooldown_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Lower bound of the jitter window before the cookie-less retry
    pub backoff_min_ms: u64,

    /// Upper bound of the jitter window
    pub backoff_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Path to the yt-dlp binary
    pub yt_dlp_path: String,

    /// Speech-to-text backend endpoint
    pub transcription_url: Option<String>,

    /// Bearer token for the speech-to-text backend
    pub api_key: Option<String>,

    /// Timeout for one transcription request
    pub request_timeout_secs: u64,

    /// Socket timeout passed to yt-dlp
    pub socket_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Per-request timeout for the caption stages
    pub timeout_secs: u64,

    /// User agent presented to the upstream
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Maximum concurrent video acquisitions in a batch
    pub max_concurrent_jobs: usize,

    /// Preferred caption languages, in order
    pub language_preferences: Vec<String>,

    /// Default output format
    pub default_output_format: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxy: ProxyConfig {
                provider: None,
                host: None,
                port: None,
                username: None,
                password: None,
                protocol: "http".to_string(),
                geo_enabled: false,
                country: None,
                allow_direct_fallback: true,
                preflight_ttl_secs: 30,
            },
            cookies: CookieConfig {
                dir: None,
                s3_bucket: None,
                s3_key_prefix: "cookies/".to_string(),
                freshness_hours: 12,
                disabled: false,
            },
            breaker: BreakerConfig {
                failure_threshold: 5,
                cooldown_secs: 60,
            },
            retry: RetryConfig {
                backoff_min_ms: 500,
                backoff_max_ms: 2500,
            },
            audio: AudioConfig {
                yt_dlp_path: "yt-dlp".to_string(),
                transcription_url: None,
                api_key: None,
                request_timeout_secs: 300,
                socket_timeout_secs: 30,
            },
            http: HttpConfig {
                timeout_secs: 30,
                user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                             (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
                    .to_string(),
            },
            app: AppConfig {
                max_concurrent_jobs: 3,
                language_preferences: vec!["en".to_string()],
                default_output_format: "text".to_string(),
            },
        }
    }
}

impl Config {
    /// Load configuration from file or create default
    pub async fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            let content =
                fs_err::read_to_string(&config_path).context("Failed to read config file")?;

            let config: Config =
                serde_yaml::from_str(&content).context("Failed to parse config file")?;

            config.validate()?;
            Ok(config)
        } else {
            let config = Self::default();
            config.save().await?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub async fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            fs_err::create_dir_all(parent)?;
        }

        let content = serde_yaml::to_string(self).context("Failed to serialize config")?;

        fs_err::write(&config_path, content).context("Failed to write config file")?;

        Ok(())
    }

    /// Get configuration file path
    pub fn config_path() -> Result<PathBuf> {
        // First try current directory for easy testing
        let local_config = PathBuf::from("config.yaml");
        if local_config.exists() {
            return Ok(local_config);
        }

        let config_dir = dirs::config_dir().context("Could not determine config directory")?;

        Ok(config_dir.join("ytscript").join("config.yaml"))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.proxy.protocol.as_str(), "http" | "https" | "socks5") {
            anyhow::bail!(
                "Unsupported proxy protocol '{}' (expected http, https or socks5)",
                self.proxy.protocol
            );
        }

        if self.proxy.geo_enabled
            && self
                .proxy
                .country
                .as_deref()
                .map(str::is_empty)
                .unwrap_or(true)
        {
            anyhow::bail!("Geo-targeted proxy egress requires a country code");
        }

        let secret_parts = [
            self.proxy.host.as_deref().map_or(false, |v| !v.is_empty()),
            self.proxy.port.is_some(),
            self.proxy.username.as_deref().map_or(false, |v| !v.is_empty()),
            self.proxy.password.as_deref().map_or(false, |v| !v.is_empty()),
        ];
        if secret_parts.iter().any(|set| *set) && !secret_parts.iter().all(|set| *set) {
            anyhow::bail!(
                "Proxy secret is incomplete: host, port, username and password must either all be set or all be left empty"
            );
        }

        if self.retry.backoff_min_ms > self.retry.backoff_max_ms {
            anyhow::bail!("retry.backoff_min_ms must not exceed retry.backoff_max_ms");
        }

        if self.breaker.failure_threshold == 0 {
            anyhow::bail!("breaker.failure_threshold must be at least 1");
        }

        if self.cookies.freshness_hours == 0 {
            anyhow::bail!("cookies.freshness_hours must be at least 1");
        }

        if self.app.max_concurrent_jobs == 0 {
            anyhow::bail!("app.max_concurrent_jobs must be at least 1");
        }

        if !matches!(self.app.default_output_format.as_str(), "text" | "json") {
            anyhow::bail!("app.default_output_format must be 'text' or 'json'");
        }

        if let Some(endpoint) = &self.audio.transcription_url {
            url::Url::parse(endpoint).context("audio.transcription_url is not a valid URL")?;
        }

        Ok(())
    }

    /// Display current configuration with credentials masked
    pub fn display(&self) {
        println!("Current Configuration:");
        match (&self.proxy.host, &self.proxy.port) {
            (Some(host), Some(port)) => {
                let user = self
                    .proxy
                    .username
                    .as_deref()
                    .map(mask_username)
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "  Proxy: {}://{}:{} (user {}, geo {})",
                    self.proxy.protocol,
                    host,
                    port,
                    user,
                    if self.proxy.geo_enabled {
                        self.proxy.country.as_deref().unwrap_or("?")
                    } else {
                        "off"
                    }
                );
            }
            _ => println!(
                "  Proxy: not configured (direct fallback {})",
                if self.proxy.allow_direct_fallback {
                    "allowed"
                } else {
                    "denied"
                }
            ),
        }
        match &self.cookies.dir {
            Some(dir) => println!("  Cookie Dir: {}", dir.display()),
            None => println!("  Cookie Dir: not configured"),
        }
        if let Some(bucket) = &self.cookies.s3_bucket {
            println!("  Cookie Bucket: {}", bucket);
        }
        println!("  Cookie Freshness: {}h", self.cookies.freshness_hours);
        println!(
            "  Breaker: {} failures / {}s cooldown",
            self.breaker.failure_threshold, self.breaker.cooldown_secs
        );
        println!(
            "  Transcription Backend: {}",
            self.audio
                .transcription_url
                .as_deref()
                .unwrap_or("not configured")
        );
        println!("  Languages: {}", self.app.language_preferences.join(", "));
        println!("  Default Format: {}", self.app.default_output_format);
    }
}
