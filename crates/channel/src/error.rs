/// Transport-level failures. None of these are specific to a job.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// The channel was closed; no further publish or subscribe is possible.
    #[error("Channel is closed")]
    Closed,

    /// The broker URL names a transport this build does not provide.
    #[error("Unsupported broker URL: {0}")]
    Unsupported(String),

    /// Connecting to the broker failed.
    #[error("Failed to connect to broker: {0}")]
    Connect(String),

    /// A topic or subscription pattern is malformed.
    #[error("Invalid topic \"{topic}\": {reason}")]
    InvalidTopic { topic: String, reason: &'static str },
}
