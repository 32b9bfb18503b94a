/// Errors raised by transport operations.
///
/// # Examples
///
/// ```rust
/// use oxprobe_transport::error::TransportError;
///
/// let err = TransportError::UnsupportedNetwork("unix".to_string());
/// assert!(err.to_string().contains("unix"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Local I/O failure: file not found, connection refused, timeouts.
    #[error("Transport: I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The requested network is not available on this transport.
    #[error("Transport: unsupported network '{0}'")]
    UnsupportedNetwork(String),

    /// Dial address could not be split into host and port.
    #[error("Transport: invalid address '{0}'")]
    InvalidAddress(String),

    /// A command ran but exited with a non-zero status.
    #[error("Transport: '{command}' exited with status {code}: {stderr}")]
    ExitStatus {
        command: String,
        code: i32,
        stderr: String,
    },

    /// A command did not finish in time and was killed.
    #[error("Transport: '{command}' timed out after {after:?}")]
    Timeout {
        command: String,
        after: std::time::Duration,
    },

    /// A command produced output that could not be interpreted.
    #[error("Transport: unexpected output from '{command}': {detail}")]
    UnexpectedOutput { command: String, detail: String },

    /// libssh2 session or channel failure.
    #[error("Transport: SSH error: {0}")]
    Ssh(#[from] ssh2::Error),

    /// SSH authentication did not succeed with any configured method.
    #[error("Transport: SSH authentication failed for {username}@{host}")]
    AuthFailed { username: String, host: String },

    /// Transport parameters did not match the expected schema.
    #[error("Transport: invalid parameters: {0}")]
    InvalidParams(#[from] serde_json::Error),

    /// The capability is not implemented on this platform.
    #[error("Transport: {0} is not supported on this platform")]
    Unsupported(&'static str),
}

/// libssh2 codes for a refused channel on an otherwise healthy session.
const CHANNEL_FAILURE: i32 = -21;
const CHANNEL_REQUEST_DENIED: i32 = -22;

impl TransportError {
    /// True when the SSH session itself is unusable, as opposed to a single
    /// channel on it being refused by the remote side.
    pub fn is_session_failure(&self) -> bool {
        match self {
            TransportError::AuthFailed { .. } => true,
            TransportError::Ssh(e) => !matches!(
                e.code(),
                ssh2::ErrorCode::Session(CHANNEL_FAILURE | CHANNEL_REQUEST_DENIED)
            ),
            _ => false,
        }
    }
}

/// Convenience `Result` alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
