use thiserror::Error;

/// Error taxonomy exposed to callers (spec §7). Kinds, not wire details.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// Per-task deadline expired and the message carried a TTL, or an RPC reply
    /// didn't arrive before the deadline even though the send was ACCEPTED.
    #[error("timed out waiting for a terminal response")]
    Timeout,

    #[error("delivery failed: {0}")]
    DeliveryFailure(#[from] DeliveryFailureKind),

    #[error("authentication failed: {0}")]
    AuthenticationFailure(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryFailureKind {
    /// Deadline expired for a message with no TTL; the broker would otherwise
    /// have queued it forever.
    #[error("undeliverable")]
    Undeliverable,
    /// Terminal disposition other than ACCEPTED.
    #[error("rejected: {0}")]
    Rejected(String),
    /// `retry` counter reached zero across link/connection resets.
    #[error("send retries exhausted")]
    RetriesExhausted,
    /// In-flight send aborted by local teardown (link or connection reset).
    #[error("link closed: {0}")]
    LinkClosed(String),
}
