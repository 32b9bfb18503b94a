use oxprobe_collector::error::RegistryError;

/// Errors returned by [`Store`](crate::Store) implementations.
///
/// # Examples
///
/// ```rust
/// use oxprobe_storage::error::StorageError;
///
/// let err = StorageError::NotFound {
///     entity: "probe",
///     id: "42".to_string(),
/// };
/// assert_eq!(err.to_string(), "Storage: probe not found (id=42)");
/// ```
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// No record with this id exists.
    #[error("Storage: {entity} not found (id={id})")]
    NotFound { entity: &'static str, id: String },

    /// The record exists but belongs to another account.
    #[error("Storage: access denied to {entity} (id={id})")]
    AccessDenied { entity: &'static str, id: String },

    /// An insert collided with an existing id.
    #[error("Storage: {entity} already exists (id={id})")]
    AlreadyExists { entity: &'static str, id: String },

    /// A stored record names an agent or transport the registry cannot build.
    #[error("Storage: {0}")]
    Registry(#[from] RegistryError),

    #[error("Storage: JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience `Result` alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
