//! Per-record failure taxonomy.
//!
//! None of these escape the pipeline: each is written onto the affected record as a
//! marker. Infrastructure failures (database, config, discovery) use `anyhow` instead.

use thiserror::Error;

/// Scrape-stage failure. Always retryable by `retry-scrape`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("network error: {0}")]
    Network(String),

    #[error("http status {0}")]
    Status(u16),

    #[error("no text could be extracted")]
    Empty,

    #[error("unsupported content: {0}")]
    Unsupported(String),
}

/// Model backend failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Backend overloaded or unreachable (timeout, 429, 5xx). Retried with backoff.
    #[error("backend unavailable: {0}")]
    Transient(String),

    /// Backend answered, but unusably (malformed JSON, missing fields, rejected request).
    #[error("unusable backend response: {0}")]
    Permanent(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }

    /// Classify an HTTP status from a provider endpoint.
    pub fn from_status(status: u16, body: &str) -> Self {
        let snippet: String = body.chars().take(300).collect();
        if status == 429 || status == 408 || (500..600).contains(&status) {
            ProviderError::Transient(format!("HTTP {}: {}", status, snippet))
        } else {
            ProviderError::Permanent(format!("HTTP {}: {}", status, snippet))
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ProviderError::Permanent(e.to_string())
        } else {
            ProviderError::Transient(e.to_string())
        }
    }
}

impl From<reqwest::Error> for ExtractionError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => ExtractionError::Status(status.as_u16()),
            None => ExtractionError::Network(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(ProviderError::from_status(429, "slow down").is_transient());
        assert!(ProviderError::from_status(503, "").is_transient());
        assert!(!ProviderError::from_status(400, "bad request").is_transient());
        assert!(!ProviderError::from_status(401, "").is_transient());
    }
}
