/// Caller-supplied job identifier. Opaque, but restricted to characters that
/// are safe as a single topic token.
pub type JobId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
