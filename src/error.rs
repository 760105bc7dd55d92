//! Error types for the coordination core.

use thiserror::Error;

/// Errors raised by the coordination core.
///
/// Generic over `E`, the storage implementation's own error type, so a
/// storage error is carried without being erased or downcast.
#[derive(Error, Debug)]
pub enum CoreError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Both `at` and `before` were supplied to `open`, or `before` lies in
    /// the future of the storage's last transaction, or a duplicate
    /// `database_name` was registered.
    #[error("argument error: {0}")]
    Argument(String),

    /// The operation (currently, only undo) is not supported by the
    /// configured storage.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// The storage layer reported a failure.
    #[error("storage error: {0}")]
    Storage(#[source] E),

    /// A connection resource failed to release during reaping or close.
    /// Carries the first failure seen; others are logged and dropped.
    #[error("failed to release connection resources: {0}")]
    Release(String),
}

impl<E> CoreError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn argument(msg: impl Into<String>) -> Self {
        CoreError::Argument(msg.into())
    }

    pub fn not_supported(msg: impl Into<String>) -> Self {
        CoreError::NotSupported(msg.into())
    }
}

pub type CoreResult<T, E> = Result<T, CoreError<E>>;
