use thiserror::Error;

/// Structured outcome of a delivery attempt. Callers map the kind to exit
/// codes or HTTP statuses; the dead-letter queue records the reason string.
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// Target is not in the registry. Configuration error, never retried.
    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    /// Circuit breaker short-circuited the send; envelope dead-lettered.
    #[error("circuit open for {0}")]
    CircuitOpen(String),

    /// Connect failure, timeout or 5xx after exhausting retries.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Permanent HTTP client error; never retried.
    #[error("client error: HTTP {0}")]
    ClientError(u16),

    /// Envelope outlived its TTL before an attempt could start.
    #[error("envelope expired before delivery")]
    Expired,

    /// Body encryption failed while strict mode is on.
    #[error("encryption failure: {0}")]
    Encryption(String),

    /// Local configuration or serialization problem.
    #[error("{0}")]
    Internal(String),
}

impl DeliveryError {
    /// Stable kind tag used in control responses and audit lines.
    pub fn kind(&self) -> &'static str {
        match self {
            DeliveryError::UnknownPeer(_) => "unknown_peer",
            DeliveryError::CircuitOpen(_) => "circuit_open",
            DeliveryError::Transport(_) => "transport",
            DeliveryError::ClientError(_) => "client_error",
            DeliveryError::Expired => "expired",
            DeliveryError::Encryption(_) => "encryption_failure",
            DeliveryError::Internal(_) => "internal",
        }
    }

    /// Dead-letter `failReason` string, e.g. `client_error_404`.
    pub fn fail_reason(&self) -> String {
        match self {
            DeliveryError::ClientError(code) => format!("client_error_{code}"),
            other => other.kind().to_string(),
        }
    }

    /// Permanent failures are not worth queueing for replay against the same
    /// peer; they are dead-lettered for audit only.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            DeliveryError::UnknownPeer(_) | DeliveryError::ClientError(_) | DeliveryError::Expired
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_and_reasons() {
        assert_eq!(DeliveryError::ClientError(404).fail_reason(), "client_error_404");
        assert_eq!(DeliveryError::CircuitOpen("b".into()).fail_reason(), "circuit_open");
        assert_eq!(DeliveryError::Transport("refused".into()).kind(), "transport");
    }

    #[test]
    fn permanence() {
        assert!(DeliveryError::ClientError(400).is_permanent());
        assert!(DeliveryError::UnknownPeer("x".into()).is_permanent());
        assert!(!DeliveryError::Transport("timeout".into()).is_permanent());
        assert!(!DeliveryError::CircuitOpen("b".into()).is_permanent());
    }
}
