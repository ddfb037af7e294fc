use thiserror::Error;

/// Failures a live voice session can run into.
///
/// Only the first three ever change the session state; `DecodeAnomaly`
/// is logged and the offending chunk skipped.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Microphone or speaker could not be opened.
    #[error("audio device access denied: {0}")]
    PermissionDenied(String),

    #[error("failed to open live channel: {0}")]
    ChannelOpenFailure(String),

    /// Transport failure while the session was live.
    #[error("live channel error: {0}")]
    ChannelError(String),

    #[error("live channel closed by peer")]
    PeerClosed,

    #[error("malformed inbound audio chunk: {0}")]
    DecodeAnomaly(String),
}

impl SessionError {
    /// Status line shown to the user when a session ends with this error.
    pub fn status_text(&self) -> &'static str {
        match self {
            SessionError::PermissionDenied(_) => "Permission Denied",
            SessionError::ChannelOpenFailure(_) => "Connection Failed",
            SessionError::PeerClosed => "Disconnected",
            SessionError::ChannelError(_) | SessionError::DecodeAnomaly(_) => "Error",
        }
    }
}
