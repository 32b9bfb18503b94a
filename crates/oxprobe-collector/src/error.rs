/// Errors raised by the plugin [`Registry`](crate::Registry).
///
/// # Examples
///
/// ```rust
/// use oxprobe_collector::error::RegistryError;
///
/// let err = RegistryError::NotFound { kind: "agent", name: "redis".to_string() };
/// assert_eq!(err.to_string(), "Registry: unknown agent 'redis'");
/// ```
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No constructor is registered under this name.
    #[error("Registry: unknown {kind} '{name}'")]
    NotFound { kind: &'static str, name: String },

    /// The plugin exists but rejected its configuration.
    #[error("Registry: invalid parameters for {kind} '{name}': {reason}")]
    InvalidParams {
        kind: &'static str,
        name: String,
        reason: String,
    },
}

/// Convenience `Result` alias for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;
