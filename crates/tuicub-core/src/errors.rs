use crate::ids::ConnectionId;
use crate::topic::TopicError;

/// Failure taxonomy of the relay. Every variant is contained to the request
/// or connection it arose on; none is fatal to the process.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Bad or missing session token or shared secret. No state change.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// Undecodable frame. The request is dropped, the connection survives.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Socket read/write error or idle timeout on one connection.
    #[error("connection fault: {0}")]
    ConnectionFault(String),

    /// Disconnect callback transport failure after retries.
    #[error("callback failed: {0}")]
    CallbackFailed(String),

    /// A connection's outbound queue was full.
    #[error("outbound queue overflow on {0}")]
    QueueOverflow(ConnectionId),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Short classification string for logs and publisher acks.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthRejected(_) => "auth_rejected",
            Self::MalformedFrame(_) => "malformed_frame",
            Self::ConnectionFault(_) => "connection_fault",
            Self::CallbackFailed(_) => "callback_failed",
            Self::QueueOverflow(_) => "queue_overflow",
            Self::Io(_) => "io",
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::MalformedFrame(e.to_string())
    }
}

impl From<TopicError> for RelayError {
    fn from(e: TopicError) -> Self {
        RelayError::MalformedFrame(e.to_string())
    }
}
