// Failure diagnostics - identifies why yt-dlp refused or failed a request
//
// Analyzes stderr to determine:
// - Type of failure (throttling, private media, network, etc.)
// - Whether a retry with the same settings might help
// - The most useful line to show to the user

use serde::{Deserialize, Serialize};

/// Reasons why the platform might refuse a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockingReason {
    /// HTTP 403 Forbidden - general access denied
    Http403Forbidden,

    /// Age-restricted content requiring login
    AgeRestricted,

    /// Geographic restriction
    GeoBlocked,

    /// Timeout, reset or unreachable host
    NetworkTimeout,

    /// Server-side error (HTTP 5xx)
    ServerError,

    /// Rate limiting (429 or similar)
    RateLimited,

    /// Bot detection triggered
    BotDetection,

    /// Private video requiring authorization
    PrivateVideo,

    /// Video deleted or unavailable
    VideoUnavailable,

    /// DRM-protected content; permanent, not an error
    DrmProtected,

    /// Member-only content (requires channel membership)
    MembersOnly,

    /// Generic/unknown blocking
    Unknown,
}

impl BlockingReason {
    /// Check if retrying the same request later might succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Http403Forbidden | Self::NetworkTimeout | Self::ServerError | Self::RateLimited
        )
    }

    /// Check if this is a permanent restriction (no workaround)
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::DrmProtected | Self::VideoUnavailable)
    }

    /// Check if the media exists but this client may not fetch it
    pub fn blocks_access(&self) -> bool {
        matches!(
            self,
            Self::AgeRestricted
                | Self::GeoBlocked
                | Self::PrivateVideo
                | Self::MembersOnly
                | Self::BotDetection
        )
    }

    /// Human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            Self::Http403Forbidden => "Access denied (HTTP 403)",
            Self::AgeRestricted => "Age-restricted content",
            Self::GeoBlocked => "Geographic restriction",
            Self::NetworkTimeout => "Network timeout or unreachable host",
            Self::ServerError => "Server error",
            Self::RateLimited => "Rate limited",
            Self::BotDetection => "Bot detection triggered",
            Self::PrivateVideo => "Private video",
            Self::VideoUnavailable => "Video unavailable",
            Self::DrmProtected => "DRM-protected content",
            Self::MembersOnly => "Members-only content",
            Self::Unknown => "Unknown failure",
        }
    }
}

/// Analyze error message and return blocking reason
pub fn diagnose_error(error: &str) -> Option<BlockingReason> {
    let lower = error.to_lowercase();

    // Check patterns in order of specificity

    if lower.contains("drm")
        || lower.contains("widevine")
        || lower.contains("playready")
        || lower.contains("fairplay")
        || lower.contains("requires purchase")
        || lower.contains("this video requires payment")
    {
        return Some(BlockingReason::DrmProtected);
    }

    if lower.contains("members only")
        || lower.contains("members-only")
        || lower.contains("join this channel")
        || lower.contains("available to members")
    {
        return Some(BlockingReason::MembersOnly);
    }

    if lower.contains("age-restricted")
        || lower.contains("sign in to confirm your age")
        || lower.contains("age_verification")
    {
        return Some(BlockingReason::AgeRestricted);
    }

    if lower.contains("private video")
        || lower.contains("video is private")
        || lower.contains("sign in if you've been granted access")
    {
        return Some(BlockingReason::PrivateVideo);
    }

    if lower.contains("video unavailable")
        || lower.contains("video has been removed")
        || lower.contains("this video is no longer available")
        || lower.contains("video is unavailable")
    {
        return Some(BlockingReason::VideoUnavailable);
    }

    if lower.contains("not available in your country")
        || lower.contains("blocked in your country")
        || lower.contains("geo restricted")
        || lower.contains("geo-restricted")
    {
        return Some(BlockingReason::GeoBlocked);
    }

    if lower.contains("429") || lower.contains("rate limit") || lower.contains("too many requests") {
        return Some(BlockingReason::RateLimited);
    }

    if lower.contains("not a bot") || lower.contains("captcha") || lower.contains("unusual traffic") {
        return Some(BlockingReason::BotDetection);
    }

    if lower.contains("403") || lower.contains("forbidden") {
        return Some(BlockingReason::Http403Forbidden);
    }

    if lower.contains("http error 500")
        || lower.contains("http error 502")
        || lower.contains("http error 503")
        || lower.contains("http error 504")
    {
        return Some(BlockingReason::ServerError);
    }

    if lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("connection refused")
        || lower.contains("connection reset")
        || lower.contains("network unreachable")
        || lower.contains("network is unreachable")
        || lower.contains("temporary failure in name resolution")
        || lower.contains("name or service not known")
        || lower.contains("getaddrinfo failed")
        || lower.contains("incompleteread")
        || lower.contains("incomplete read")
    {
        return Some(BlockingReason::NetworkTimeout);
    }

    if !error.trim().is_empty() {
        return Some(BlockingReason::Unknown);
    }

    None
}

/// Pick the line of a stderr dump that best explains the failure
pub fn error_context(error: &str) -> String {
    let lines: Vec<&str> = error
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    lines
        .iter()
        .rev()
        .find(|line| line.to_lowercase().starts_with("error:"))
        .or_else(|| lines.last())
        .map(|line| line.to_string())
        .unwrap_or_else(|| "no error output".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_403_detection() {
        let error = "ERROR: HTTP Error 403: Forbidden";
        assert_eq!(diagnose_error(error), Some(BlockingReason::Http403Forbidden));
    }

    #[test]
    fn test_age_restricted_detection() {
        let error = "Sign in to confirm your age";
        assert_eq!(diagnose_error(error), Some(BlockingReason::AgeRestricted));
    }

    #[test]
    fn test_timeout_detection() {
        let error = "Timed out after 30s";
        assert_eq!(diagnose_error(error), Some(BlockingReason::NetworkTimeout));
    }

    #[test]
    fn test_dns_failure_is_network() {
        let error = "ERROR: Unable to download webpage: <urlopen error [Errno -3] Temporary failure in name resolution>";
        assert_eq!(diagnose_error(error), Some(BlockingReason::NetworkTimeout));
        assert!(BlockingReason::NetworkTimeout.is_retryable());
    }

    #[test]
    fn test_server_error_detection() {
        let error = "ERROR: unable to download video data: HTTP Error 503: Service Unavailable";
        assert_eq!(diagnose_error(error), Some(BlockingReason::ServerError));
    }

    #[test]
    fn test_members_only_detection() {
        let error = "This video is available to members only";
        assert_eq!(diagnose_error(error), Some(BlockingReason::MembersOnly));
        assert!(BlockingReason::MembersOnly.blocks_access());
    }

    #[test]
    fn test_permanent_reasons() {
        assert!(BlockingReason::DrmProtected.is_permanent());
        assert!(BlockingReason::VideoUnavailable.is_permanent());
        assert!(!BlockingReason::Http403Forbidden.is_permanent());
    }

    #[test]
    fn test_empty_error_has_no_reason() {
        assert_eq!(diagnose_error("   "), None);
    }

    #[test]
    fn test_context_prefers_last_error_line() {
        let stderr = "WARNING: something odd\nERROR: first\n[info] noise\nERROR: the real one\n";
        assert_eq!(error_context(stderr), "ERROR: the real one");
        assert_eq!(error_context("just a line"), "just a line");
        assert_eq!(error_context(""), "no error output");
    }
}
