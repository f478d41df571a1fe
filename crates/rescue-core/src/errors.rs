/// Failures the relay can report about a connection or an inbound envelope.
///
/// Admission errors are answered at the HTTP layer; every other variant is
/// reported to the sender as an `ERROR` envelope and leaves the connection open.
/// Liveness and delivery failures are never errors: the sweep closes dead
/// sockets and broadcasts skip unreachable peers.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    // Admission
    #[error("origin not allowed: {}", origin.as_deref().unwrap_or("<none>"))]
    OriginRejected { origin: Option<String> },

    // Protocol
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
    #[error("userId is required")]
    MissingUserId,
    #[error("unknown message type: {0}")]
    UnknownType(String),

    // Authorization
    #[error("unauthorized or invalid location data")]
    Unauthorized,
}

impl RelayError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::OriginRejected { .. } => "origin_rejected",
            Self::InvalidFormat(_) => "invalid_format",
            Self::MissingUserId => "missing_user_id",
            Self::UnknownType(_) => "unknown_type",
            Self::Unauthorized => "unauthorized",
        }
    }

    /// Text placed in the `message` field of the `ERROR` envelope (or the
    /// HTTP rejection reason for admission failures).
    pub fn client_message(&self) -> String {
        match self {
            Self::OriginRejected { .. } => "Invalid origin".into(),
            Self::InvalidFormat(_) => "Invalid message format".into(),
            Self::MissingUserId => "userId is required".into(),
            Self::UnknownType(kind) => format!("Unknown message type: {kind}"),
            Self::Unauthorized => "Unauthorized or invalid location data".into(),
        }
    }

    pub fn is_admission(&self) -> bool {
        matches!(self, Self::OriginRejected { .. })
    }
}
