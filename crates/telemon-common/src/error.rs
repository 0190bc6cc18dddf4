use crate::types::MetricKind;

/// A metric that cannot be stored as given.
///
/// # Examples
///
/// ```
/// use telemon_common::types::Metric;
/// use telemon_common::error::MetricError;
///
/// let m = Metric { id: String::new(), ..Metric::gauge("x", 1.0) };
/// assert_eq!(m.validate(), Err(MetricError::EmptyId));
/// ```
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MetricError {
    #[error("Metric: id must not be empty")]
    EmptyId,

    #[error("Metric: unknown kind '{0}'")]
    UnknownKind(String),

    #[error("Metric: gauge '{0}' has no value")]
    MissingValue(String),

    #[error("Metric: counter '{0}' has no delta")]
    MissingDelta(String),

    /// A gauge carrying `delta` or a counter carrying `value`.
    #[error("Metric: {kind} '{id}' must not carry a {field}")]
    UnexpectedField {
        id: String,
        kind: MetricKind,
        field: &'static str,
    },

    #[error("Metric: '{raw}' is not a valid {kind} value")]
    InvalidValue { kind: MetricKind, raw: String },

    #[error("Metric: batch is empty")]
    EmptyBatch,
}

/// Failures of the transport framing: integrity, confidentiality,
/// compression and origin checks.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("Wire: signature is not valid base64")]
    MalformedSignature,

    #[error("Wire: signature mismatch")]
    SignatureMismatch,

    #[error("Wire: invalid key: {0}")]
    InvalidKey(String),

    #[error("Wire: encryption failed: {0}")]
    Encrypt(String),

    #[error("Wire: decryption failed: {0}")]
    Decrypt(String),

    #[error("Wire: gzip: {0}")]
    Compression(#[from] std::io::Error),

    #[error("Wire: inflated body exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("Wire: origin '{0}' is not trusted")]
    UntrustedOrigin(String),
}
