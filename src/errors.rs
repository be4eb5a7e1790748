// =============================================================================
// Error taxonomy for the feed pipeline
// =============================================================================
//
// Errors are handled at the lowest scope that can make a decision: parse
// errors locally, network errors at the connector, invariant violations at
// the owning engine. The supervisor only needs to distinguish transient
// failures (retry with backoff) from fatal ones (stop retrying), which it
// does by downcasting the worker's `anyhow::Error` to `FeedError`.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    /// Malformed frame. Logged at debug; the message is dropped or kept
    /// as a `Raw` event.
    #[error("parse error: {0}")]
    Parse(String),

    /// Connector I/O, HTTP 5xx, timeout. Retried with backoff.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// Bad DNS, unresolvable host, persistent rejection. Moves the worker
    /// to `failed` once retries are exhausted.
    #[error("fatal network error: {0}")]
    FatalNetwork(String),

    /// Sequence gap or checksum mismatch. Triggers a snapshot resync.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Book-state inconsistency (e.g. negative size). The owning engine
    /// resets the book and requests a snapshot.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Bounded queue overflow. Dropped per policy, counted, continue.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Missing or invalid required configuration. Fatal at startup.
    #[error("config error: {0}")]
    Config(String),
}

impl FeedError {
    /// Whether the supervisor should stop retrying a worker that failed
    /// with this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalNetwork(_) | Self::Config(_))
    }
}

/// Classify a WebSocket/HTTP connect failure by message shape.
///
/// DNS and TLS-identity failures do not heal with retries; everything else
/// is assumed transient.
pub fn classify_connect_error(err: &anyhow::Error) -> FeedError {
    let msg = format!("{err:#}");
    let lower = msg.to_lowercase();
    if lower.contains("dns")
        || lower.contains("failed to lookup")
        || lower.contains("no such host")
        || lower.contains("invalid dnsname")
    {
        FeedError::FatalNetwork(msg)
    } else {
        FeedError::TransientNetwork(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatality_split() {
        assert!(FeedError::FatalNetwork("x".into()).is_fatal());
        assert!(FeedError::Config("x".into()).is_fatal());
        assert!(!FeedError::TransientNetwork("x".into()).is_fatal());
        assert!(!FeedError::Protocol("x".into()).is_fatal());
        assert!(!FeedError::ResourceExhausted("x".into()).is_fatal());
    }

    #[test]
    fn connect_error_classification() {
        let dns = anyhow::anyhow!("failed to lookup address information");
        assert!(matches!(
            classify_connect_error(&dns),
            FeedError::FatalNetwork(_)
        ));

        let reset = anyhow::anyhow!("connection reset by peer");
        assert!(matches!(
            classify_connect_error(&reset),
            FeedError::TransientNetwork(_)
        ));
    }

    #[test]
    fn downcast_through_anyhow() {
        let err: anyhow::Error = FeedError::FatalNetwork("bad host".into()).into();
        let fatal = err
            .downcast_ref::<FeedError>()
            .map(FeedError::is_fatal)
            .unwrap_or(false);
        assert!(fatal);
    }
}
