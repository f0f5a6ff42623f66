use thiserror::Error;

/// Mistakes in how a layer was configured. These are the only errors the
/// engine hands back to its caller, and only at construction time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("storage key must not be empty")]
    EmptyKey,
    #[error("unknown merge strategy `{0}` (expected `replace` or `merge`)")]
    UnknownMergeStrategy(String),
    #[error("persisted field list for `{0}` is empty")]
    NoPersistedFields(String),
}

/// Failures reported by the host's storage partition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("storage is not available in this context")]
    Unavailable,
    #[error("storage quota exceeded while writing `{key}`")]
    QuotaExceeded { key: String },
    #[error("storage error: {0}")]
    Other(String),
}

/// Returned by a custom merge function that cannot combine two records.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("merge failed: {0}")]
pub struct MergeError(pub String);

/// Whatever a mutation hook fails with. Hooks are written by the application,
/// so any error type is accepted.
pub type HookError = Box<dyn std::error::Error>;
