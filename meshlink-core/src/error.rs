use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the transport layer.
///
/// Steady-state I/O problems (polling, background sends) are absorbed into
/// connection-state transitions by the transports themselves; this type is
/// what the direct caller of an operation sees.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,

    #[error("scan already in progress")]
    AlreadyScanning,

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("authentication or pairing failed: {0}")]
    AuthenticationFailed(String),

    #[error("link lost: {0}")]
    LinkLost(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport disposed")]
    Disposed,

    #[error("bluetooth error: {0}")]
    Ble(#[from] btleplug::Error),

    #[error("serial error: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether this error indicates an authentication/pairing problem.
    ///
    /// Prefer matching on `AuthenticationFailed`; the keyword fallback covers
    /// platform stacks that only surface pairing cancellation as a generic
    /// error string.
    pub fn is_auth_failure(&self) -> bool {
        match self {
            TransportError::AuthenticationFailed(_) => true,
            TransportError::Ble(e) => is_auth_failure_text(&e.to_string()),
            _ => false,
        }
    }
}

/// Keyword heuristic for authentication/encryption/pairing failures.
///
/// Known gap: the list does not match every driver's wording. It exists to
/// classify the generic I/O errors a cancelled pairing prompt produces.
pub(crate) fn is_auth_failure_text(message: &str) -> bool {
    const KEYWORDS: [&str; 5] = ["auth", "encrypt", "pair", "bond", "insufficient"];
    let lower = message.to_lowercase();
    KEYWORDS.iter().any(|k| lower.contains(k))
}

/// Whether an error message indicates the underlying link dropped.
///
/// Used at write time so consumers observe a `Disconnected` transition
/// instead of having to infer it from a failed send.
pub(crate) fn is_link_dropped_text(message: &str) -> bool {
    const KEYWORDS: [&str; 5] = [
        "disconnect",
        "not connected",
        "no such device",
        "connection reset",
        "broken pipe",
    ];
    let lower = message.to_lowercase();
    KEYWORDS.iter().any(|k| lower.contains(k))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_keyword_classification() {
        assert!(is_auth_failure_text("ATT error: insufficient authentication"));
        assert!(is_auth_failure_text("Pairing rejected by remote"));
        assert!(is_auth_failure_text("encryption required"));
        assert!(!is_auth_failure_text("read timed out"));
        assert!(!is_auth_failure_text("device busy"));
    }

    #[test]
    fn test_link_dropped_classification() {
        assert!(is_link_dropped_text("Peripheral is not connected"));
        assert!(is_link_dropped_text("Connection reset by peer"));
        assert!(!is_link_dropped_text("characteristic not found"));
    }

    #[test]
    fn test_typed_auth_failure() {
        let err = TransportError::AuthenticationFailed("cancelled".to_string());
        assert!(err.is_auth_failure());
        assert!(!TransportError::NotConnected.is_auth_failure());
    }
}
