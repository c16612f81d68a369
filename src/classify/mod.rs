use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum length of a combined error message, separator and trailer included.
pub const MAX_COMBINED_LEN: usize = 4096;

/// Separator used when joining two attempt errors into one message.
const COMBINE_SEPARATOR: &str = " | ";

/// Trailer appended whenever combined content had to be cut.
const TRUNCATION_MARKER: &str = "…[truncated]";

/// Coarse failure category assigned to a stage error.
///
/// Classification routes retry and short-circuit decisions, so the set is
/// deliberately small; anything unrecognized falls to `Unknown` and is still
/// surfaced to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailClass {
    ExtractionError,
    CookieInvalid,
    HttpThrottling,
    VideoUnavailable,
    GeoBlocked,
    AgeRestricted,
    NetworkError,
    ProxyUnavailable,
    PoTokenRequired,
    Unknown,
}

impl FailClass {
    /// Stable snake_case label used in logs and serialized reports.
    pub fn label(&self) -> &'static str {
        match self {
            FailClass::ExtractionError => "extraction_error",
            FailClass::CookieInvalid => "cookie_invalid",
            FailClass::HttpThrottling => "http_throttling",
            FailClass::VideoUnavailable => "video_unavailable",
            FailClass::GeoBlocked => "geo_blocked",
            FailClass::AgeRestricted => "age_restricted",
            FailClass::NetworkError => "network_error",
            FailClass::ProxyUnavailable => "proxy_unavailable",
            FailClass::PoTokenRequired => "po_token_required",
            FailClass::Unknown => "unknown",
        }
    }

    /// Whether this failure makes the remaining proxy-bound HTTP stages
    /// pointless for the current job. A region lock looks the same from
    /// every stage sharing the proxy egress, so only the audio pipeline
    /// (different egress path) is still worth attempting.
    pub fn short_circuits_proxy_stages(&self) -> bool {
        matches!(self, FailClass::GeoBlocked)
    }
}

impl fmt::Display for FailClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A classified stage failure. The message keeps the raw upstream text
/// verbatim so operators can correlate it with upstream incidents.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{class}: {message}")]
pub struct StageError {
    pub class: FailClass,
    pub message: String,
}

impl StageError {
    pub fn new(class: FailClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    /// Build an error whose class is derived from the message text itself.
    pub fn classified(message: impl Into<String>) -> Self {
        let message = message.into();
        let class = classify(&message);
        Self { class, message }
    }
}

/// Known substrings per class, checked in priority order. Specific causes
/// (cookie invalidation, extraction failure) come before generic wrappers
/// (network errors), since upstream text routinely contains both.
const CLASS_PATTERNS: &[(FailClass, &[&str])] = &[
    (
        FailClass::CookieInvalid,
        &[
            "not a bot",
            "cookies are no longer valid",
            "invalid cookie",
            "login_required",
            "login required",
        ],
    ),
    (
        FailClass::PoTokenRequired,
        &["po_token", "po token", "exp=xpe"],
    ),
    (
        FailClass::AgeRestricted,
        &[
            "age-restricted",
            "age restricted",
            "inappropriate for some users",
            "confirm your age",
        ],
    ),
    (
        FailClass::GeoBlocked,
        &[
            "in your country",
            "in your region",
            "geo-restricted",
            "geo restriction",
            "geoblock",
        ],
    ),
    (
        FailClass::VideoUnavailable,
        &[
            "video unavailable",
            "video is unavailable",
            "private video",
            "video is private",
            "has been removed",
            "no longer available",
            "account associated with this video",
        ],
    ),
    (
        FailClass::HttpThrottling,
        &["too many requests", "rate limit", "rate-limit", "throttl"],
    ),
    (
        FailClass::ProxyUnavailable,
        &["proxy", "tunnel connection", "socks"],
    ),
    (
        FailClass::ExtractionError,
        &[
            "unable to extract",
            "failed to extract",
            "failed to parse",
            "no caption",
            "no transcript",
            "empty transcript",
            "unsupported url",
            "no suitable extractor",
        ],
    ),
    (
        FailClass::NetworkError,
        &[
            "timed out",
            "timeout",
            "connection refused",
            "connection reset",
            "connection aborted",
            "connection closed",
            "broken pipe",
            "unreachable",
            "dns error",
            "name or service not known",
            "error sending request",
            "network",
        ],
    ),
];

/// Bare status codes are matched as whole tokens so that an id like
/// `dQw403w9WgX` never classifies as throttling.
const THROTTLE_TOKENS: &[&str] = &["429", "403"];

/// Assign a failure class to raw error text via case-insensitive matching.
pub fn classify(err_text: &str) -> FailClass {
    let lower = err_text.to_lowercase();
    for (class, patterns) in CLASS_PATTERNS {
        if patterns.iter().any(|p| lower.contains(p)) {
            return *class;
        }
        if *class == FailClass::HttpThrottling
            && THROTTLE_TOKENS.iter().any(|t| contains_token(&lower, t))
        {
            return *class;
        }
    }
    FailClass::Unknown
}

/// Join two attempt errors under the global length cap.
///
/// When the cap forces truncation the remaining budget is split between both
/// messages (slack from a short one flows to the other), so a cause present
/// only in the second message still survives into the combined text. The
/// separator and truncation trailer themselves are never cut.
pub fn combine(first: &str, second: &str) -> String {
    if first.is_empty() {
        return cap_single(second);
    }
    if second.is_empty() {
        return cap_single(first);
    }

    let joined_len = first.len() + COMBINE_SEPARATOR.len() + second.len();
    if joined_len <= MAX_COMBINED_LEN {
        return format!("{first}{COMBINE_SEPARATOR}{second}");
    }

    let budget = MAX_COMBINED_LEN - COMBINE_SEPARATOR.len() - TRUNCATION_MARKER.len();
    let half = budget / 2;
    let (first_take, second_take) = if first.len() <= half {
        (first.len(), budget - first.len())
    } else if second.len() <= half {
        (budget - second.len(), second.len())
    } else {
        (half, budget - half)
    };

    format!(
        "{}{}{}{}",
        truncate_to_boundary(first, first_take),
        COMBINE_SEPARATOR,
        truncate_to_boundary(second, second_take),
        TRUNCATION_MARKER
    )
}

fn cap_single(message: &str) -> String {
    if message.len() <= MAX_COMBINED_LEN {
        return message.to_string();
    }
    let budget = MAX_COMBINED_LEN - TRUNCATION_MARKER.len();
    format!(
        "{}{}",
        truncate_to_boundary(message, budget),
        TRUNCATION_MARKER
    )
}

/// Cut `s` to at most `max_bytes`, backing up to a char boundary.
fn truncate_to_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Substring match requiring non-alphanumeric (or string) boundaries on
/// both sides of the needle.
fn contains_token(haystack: &str, token: &str) -> bool {
    let bytes = haystack.as_bytes();
    let mut search_from = 0;
    while let Some(pos) = haystack[search_from..].find(token) {
        let begin = search_from + pos;
        let end = begin + token.len();
        let left_ok = begin == 0 || !bytes[begin - 1].is_ascii_alphanumeric();
        let right_ok = end == bytes.len() || !bytes[end].is_ascii_alphanumeric();
        if left_ok && right_ok {
            return true;
        }
        search_from = begin + 1;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_cookie_invalid() {
        assert_eq!(
            classify("ERROR: Sign in to confirm you're not a bot"),
            FailClass::CookieInvalid
        );
        assert_eq!(
            classify("The provided account cookies are no longer valid"),
            FailClass::CookieInvalid
        );
        assert_eq!(classify("playability: LOGIN_REQUIRED"), FailClass::CookieInvalid);
    }

    #[test]
    fn test_classify_specific_cause_beats_generic_wrapper() {
        // A wrapped message carries both the network wrapper and the real cause.
        let msg = "request failed: network error while fetching: Sign in to confirm you're not a bot";
        assert_eq!(classify(msg), FailClass::CookieInvalid);

        let msg = "connection closed before message completed; unable to extract player response";
        assert_eq!(classify(msg), FailClass::ExtractionError);
    }

    #[test]
    fn test_classify_po_token_required() {
        assert_eq!(
            classify("caption url contains &exp=xpe marker"),
            FailClass::PoTokenRequired
        );
        assert_eq!(
            classify("This client requires a PO Token to continue"),
            FailClass::PoTokenRequired
        );
    }

    #[test]
    fn test_classify_age_before_geo() {
        assert_eq!(
            classify("This video may be inappropriate for some users"),
            FailClass::AgeRestricted
        );
        assert_eq!(
            classify("Sign in to confirm your age"),
            FailClass::AgeRestricted
        );
        assert_eq!(
            classify("The uploader has not made this video available in your country"),
            FailClass::GeoBlocked
        );
    }

    #[test]
    fn test_classify_video_unavailable() {
        assert_eq!(classify("Video unavailable"), FailClass::VideoUnavailable);
        assert_eq!(
            classify("This video has been removed by the uploader"),
            FailClass::VideoUnavailable
        );
    }

    #[test]
    fn test_classify_throttling_requires_token_boundary() {
        assert_eq!(classify("HTTP Error 429: Too Many Requests"), FailClass::HttpThrottling);
        assert_eq!(classify("upstream returned 403"), FailClass::HttpThrottling);
        // Digits embedded in an identifier must not trip the matcher.
        assert_eq!(classify("video dQw403w9WgX failed strangely"), FailClass::Unknown);
        assert_eq!(classify("received 14290 bytes then stalled oddly"), FailClass::Unknown);
    }

    #[test]
    fn test_classify_throttling_beats_proxy() {
        assert_eq!(
            classify("HTTP 429 received via proxy gate-1.example.net"),
            FailClass::HttpThrottling
        );
    }

    #[test]
    fn test_classify_proxy_and_network() {
        assert_eq!(
            classify("tunnel connection failed: 407 Proxy Authentication Required"),
            FailClass::ProxyUnavailable
        );
        assert_eq!(classify("connection refused"), FailClass::NetworkError);
        assert_eq!(
            classify("operation timed out after 30s"),
            FailClass::NetworkError
        );
    }

    #[test]
    fn test_classify_unknown_fallback() {
        assert_eq!(classify("something inexplicable happened"), FailClass::Unknown);
        assert_eq!(classify(""), FailClass::Unknown);
    }

    #[test]
    fn test_combine_under_cap_joins_verbatim() {
        let combined = combine("first failure", "second failure");
        assert_eq!(combined, "first failure | second failure");
    }

    #[test]
    fn test_combine_empty_side_passes_through() {
        assert_eq!(combine("", "only error"), "only error");
        assert_eq!(combine("only error", ""), "only error");
    }

    #[test]
    fn test_combine_over_cap_keeps_both_halves() {
        let first = "A".repeat(6000);
        let second = "B".repeat(6000);
        let combined = combine(&first, &second);
        assert!(combined.len() <= MAX_COMBINED_LEN);
        assert!(combined.contains("…[truncated]"));
        assert!(combined.contains("AAA"));
        assert!(combined.contains("BBB"));
        assert!(combined.contains(" | "));
    }

    #[test]
    fn test_combine_slack_flows_to_longer_message() {
        let short = "short cause";
        let long = "C".repeat(8000);
        let combined = combine(short, &long);
        assert!(combined.len() <= MAX_COMBINED_LEN);
        assert!(combined.starts_with(short));
        // The long side gets everything the short side did not use.
        assert!(combined.matches('C').count() > MAX_COMBINED_LEN / 2);
    }

    #[test]
    fn test_combine_then_classify_detects_second_half() {
        let first = "x".repeat(6000);
        let second = format!("Sign in to confirm you're not a bot{}", "y".repeat(6000));
        let combined = combine(&first, &second);
        assert!(combined.len() <= MAX_COMBINED_LEN);
        assert_eq!(classify(&combined), FailClass::CookieInvalid);
    }

    #[test]
    fn test_combine_then_classify_detects_first_half() {
        let first = format!("HTTP Error 429: Too Many Requests{}", "x".repeat(6000));
        let second = "y".repeat(6000);
        let combined = combine(&first, &second);
        assert_eq!(classify(&combined), FailClass::HttpThrottling);
    }

    #[test]
    fn test_stage_error_display_carries_label() {
        let err = StageError::new(FailClass::GeoBlocked, "not available in your country");
        assert_eq!(
            err.to_string(),
            "geo_blocked: not available in your country"
        );
    }

    #[test]
    fn test_stage_error_classified() {
        let err = StageError::classified("ERROR: unable to extract video data");
        assert_eq!(err.class, FailClass::ExtractionError);
    }

    #[test]
    fn test_label_round_trip() {
        for class in [
            FailClass::ExtractionError,
            FailClass::CookieInvalid,
            FailClass::HttpThrottling,
            FailClass::VideoUnavailable,
            FailClass::GeoBlocked,
            FailClass::AgeRestricted,
            FailClass::NetworkError,
            FailClass::ProxyUnavailable,
            FailClass::PoTokenRequired,
            FailClass::Unknown,
        ] {
            let json = serde_json::to_string(&class).unwrap();
            assert_eq!(json, format!("\"{}\"", class.label()));
        }
    }
}
