use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::classify::{FailClass, StageError};
use crate::config::{HttpConfig, ProxyConfig};

/// Length of the sticky session id appended to the proxy username.
const SESSION_ID_LEN: usize = 12;

/// Proxy egress bound to one job. Repeated lookups for the same job id yield
/// the same endpoint, so consent or challenge state accumulated by one stage
/// is still valid for the next stage of the same job.
#[derive(Clone)]
pub struct ProxySession {
    pub job_id: Uuid,
    endpoint: Option<Url>,
    pub sanitized_host: String,
    pub profile: String,
}

impl ProxySession {
    /// Whether this session egresses directly, without a proxy.
    pub fn is_direct(&self) -> bool {
        self.endpoint.is_none()
    }

    /// Raw endpoint including credentials. For client construction only;
    /// anything destined for logs goes through `Display` instead.
    pub fn authority_url(&self) -> Option<&Url> {
        self.endpoint.as_ref()
    }

    /// Strip this session's credential material out of third-party text, so
    /// subprocess stderr and response bodies can be quoted in errors.
    pub fn redact(&self, text: &str) -> String {
        let Some(url) = &self.endpoint else {
            return text.to_string();
        };
        let mut out = text.replace(url.as_str(), "[proxy]");
        if let Some(password) = url.password() {
            if !password.is_empty() {
                out = out.replace(password, "[redacted]");
            }
        }
        if !url.username().is_empty() {
            out = out.replace(url.username(), "[redacted]");
        }
        out
    }
}

impl fmt::Display for ProxySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.profile, self.sanitized_host)
    }
}

// Hand-written so a stray {:?} can never leak the credential-bearing URL.
impl fmt::Debug for ProxySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxySession")
            .field("job_id", &self.job_id)
            .field("host", &self.sanitized_host)
            .field("profile", &self.profile)
            .finish()
    }
}

/// Hands out per-job proxy sessions and answers health probes.
pub struct ProxySessionProvider {
    config: ProxyConfig,
    preflight_cache: Mutex<Option<(Instant, bool)>>,
}

impl ProxySessionProvider {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            preflight_cache: Mutex::new(None),
        }
    }

    /// Return the proxy session for a job. The sticky session id is derived
    /// from the job id, so this is deterministic: same job, same endpoint.
    ///
    /// Direct egress is reserved for a fully absent secret with the operator
    /// override set. A partially configured secret always fails closed.
    pub fn session_for(&self, job_id: Uuid) -> Result<ProxySession, StageError> {
        let sid = session_id(job_id);

        let host = self.config.host.as_deref().filter(|v| !v.is_empty());
        let username = self.config.username.as_deref().filter(|v| !v.is_empty());
        let password = self.config.password.as_deref().filter(|v| !v.is_empty());
        let port = self.config.port;

        if host.is_none() && port.is_none() && username.is_none() && password.is_none() {
            if self.config.allow_direct_fallback {
                debug!(job_id = %job_id, "no proxy secret configured, using direct egress");
                return Ok(ProxySession {
                    job_id,
                    endpoint: None,
                    sanitized_host: "direct".to_string(),
                    profile: format!("direct-{}", sid),
                });
            }
            warn!(job_id = %job_id, "no proxy secret and direct egress disabled, failing closed");
            return Err(StageError::new(
                FailClass::ProxyUnavailable,
                "no proxy secret configured and direct egress is disabled",
            ));
        }

        let (Some(host), Some(port), Some(username), Some(password)) =
            (host, port, username, password)
        else {
            warn!(job_id = %job_id, "proxy secret is incomplete, failing closed");
            return Err(StageError::new(
                FailClass::ProxyUnavailable,
                "proxy secret is incomplete (host, port, username and password must all be set)",
            ));
        };

        let mut session_user = username.to_string();
        if self.config.geo_enabled {
            if let Some(country) = self.config.country.as_deref() {
                session_user.push_str("-cc-");
                session_user.push_str(country);
            }
        }
        session_user.push_str("-session-");
        session_user.push_str(&sid);

        let endpoint = format!(
            "{}://{}:{}@{}:{}",
            self.config.protocol,
            urlencoding::encode(&session_user),
            urlencoding::encode(password),
            host,
            port
        );
        let endpoint = Url::parse(&endpoint).map_err(|e| {
            StageError::new(
                FailClass::ProxyUnavailable,
                format!("proxy endpoint for {}:{} is malformed: {}", host, port, e),
            )
        })?;

        let provider = self.config.provider.as_deref().unwrap_or("proxy");
        Ok(ProxySession {
            job_id,
            endpoint: Some(endpoint),
            sanitized_host: format!("{}:{}", host, port),
            profile: format!("{}-{}", provider, sid),
        })
    }

    /// Cheap connectivity probe against the proxy gateway. Results are
    /// cached for `preflight_ttl_secs` so liveness polls do not produce a
    /// network round-trip each time. Direct egress reports healthy.
    pub async fn preflight(&self, timeout: Duration) -> bool {
        let ttl = Duration::from_secs(self.config.preflight_ttl_secs);
        {
            let cache = self
                .preflight_cache
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some((checked_at, healthy)) = *cache {
                if checked_at.elapsed() < ttl {
                    return healthy;
                }
            }
        }

        let healthy = match (self.config.host.as_deref(), self.config.port) {
            (Some(host), Some(port)) => {
                match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
                    Ok(Ok(_)) => true,
                    Ok(Err(e)) => {
                        debug!(host, port, error = %e, "proxy preflight connect failed");
                        false
                    }
                    Err(_) => {
                        debug!(host, port, "proxy preflight timed out");
                        false
                    }
                }
            }
            _ => self.config.allow_direct_fallback,
        };

        let mut cache = self
            .preflight_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *cache = Some((Instant::now(), healthy));
        healthy
    }
}

/// Build the per-job HTTP client: shared cookie jar for consent state,
/// bounded timeout, and the job's proxy endpoint when one exists.
pub fn build_job_client(
    session: &ProxySession,
    http: &HttpConfig,
) -> Result<reqwest::Client, StageError> {
    let mut builder = reqwest::Client::builder()
        .user_agent(http.user_agent.clone())
        .timeout(Duration::from_secs(http.timeout_secs))
        .cookie_store(true);

    if let Some(endpoint) = session.authority_url() {
        let proxy = reqwest::Proxy::all(endpoint.as_str()).map_err(|e| {
            StageError::new(
                FailClass::ProxyUnavailable,
                format!("proxy endpoint rejected by http client: {}", e),
            )
        })?;
        builder = builder.proxy(proxy);
    }

    builder.build().map_err(|e| {
        StageError::new(
            FailClass::NetworkError,
            format!("failed to build http client: {}", e),
        )
    })
}

fn session_id(job_id: Uuid) -> String {
    let hex = job_id.simple().to_string();
    hex[..SESSION_ID_LEN].to_string()
}
