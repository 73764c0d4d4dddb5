//! Image provider error types with retry classification.

use std::time::Duration;

/// Error from an image provider call.
#[derive(Debug)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    /// HTTP status code, if applicable
    pub status_code: Option<u16>,
    pub message: String,
    /// Delay requested by the provider via `Retry-After`
    pub retry_after: Option<Duration>,
}

impl ProviderError {
    pub fn from_status(status_code: u16, message: String, retry_after: Option<Duration>) -> Self {
        Self {
            kind: classify_http_status(status_code),
            status_code: Some(status_code),
            message,
            retry_after,
        }
    }

    pub fn network_error(message: String) -> Self {
        Self {
            kind: ProviderErrorKind::NetworkError,
            status_code: None,
            message,
            retry_after: None,
        }
    }

    pub fn parse_error(message: String) -> Self {
        Self {
            kind: ProviderErrorKind::ParseError,
            status_code: None,
            message,
            retry_after: None,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    /// Delay before the next try: `Retry-After` if given, else exponential from a per-kind base.
    pub fn suggested_delay(&self, attempt: u32) -> Duration {
        if let Some(retry_after) = self.retry_after {
            return retry_after;
        }
        let base_ms: u64 = match self.kind {
            ProviderErrorKind::RateLimited => 5_000,
            ProviderErrorKind::ServerError => 2_000,
            _ => 1_000,
        };
        let delay_ms = base_ms.saturating_mul(2u64.saturating_pow(attempt));
        Duration::from_millis(delay_ms.min(30_000))
    }

    /// Short reason recorded as the sub-job failure.
    pub fn reason(&self) -> String {
        match self.status_code {
            Some(code) => format!("{} (HTTP {})", self.kind, code),
            None => self.kind.to_string(),
        }
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{} (HTTP {}): {}", self.kind, code, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for ProviderError {}

/// Classification of provider errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// 429 - transient
    RateLimited,
    /// 5xx - transient
    ServerError,
    /// 4xx other than 429 - permanent
    ClientError,
    /// Connection failed or dropped - transient
    NetworkError,
    /// Response had no usable image
    ParseError,
}

impl ProviderErrorKind {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderErrorKind::RateLimited
                | ProviderErrorKind::ServerError
                | ProviderErrorKind::NetworkError
        )
    }
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderErrorKind::RateLimited => write!(f, "Rate limited"),
            ProviderErrorKind::ServerError => write!(f, "Server error"),
            ProviderErrorKind::ClientError => write!(f, "Client error"),
            ProviderErrorKind::NetworkError => write!(f, "Network error"),
            ProviderErrorKind::ParseError => write!(f, "Parse error"),
        }
    }
}

/// Parse HTTP status code into error kind.
pub fn classify_http_status(status: u16) -> ProviderErrorKind {
    match status {
        429 => ProviderErrorKind::RateLimited,
        400..=499 => ProviderErrorKind::ClientError,
        _ => ProviderErrorKind::ServerError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_classification() {
        assert_eq!(classify_http_status(429), ProviderErrorKind::RateLimited);
        assert_eq!(classify_http_status(503), ProviderErrorKind::ServerError);
        assert_eq!(classify_http_status(401), ProviderErrorKind::ClientError);
        assert!(!classify_http_status(400).is_transient());
        assert!(classify_http_status(502).is_transient());
    }

    #[test]
    fn test_backoff_grows_and_is_capped() {
        let error = ProviderError::from_status(503, "busy".to_string(), None);
        assert!(error.suggested_delay(1) > error.suggested_delay(0));
        assert_eq!(error.suggested_delay(10), Duration::from_secs(30));
    }

    #[test]
    fn test_retry_after_respected() {
        let error = ProviderError::from_status(
            429,
            "slow down".to_string(),
            Some(Duration::from_secs(3)),
        );
        assert_eq!(error.suggested_delay(4), Duration::from_secs(3));
        assert_eq!(error.reason(), "Rate limited (HTTP 429)");
    }
}
