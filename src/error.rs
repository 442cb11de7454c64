use thiserror::Error;

/// Errors returned by [`Pool`](crate::Pool) operations.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
  /// The raw-memory provider could not satisfy a request.
  ///
  /// Raised by pool construction, block growth, large allocations and the
  /// allocation of registry records. Nothing is retried.
  #[error("allocation failure: provider could not supply {size} bytes")]
  AllocationFailure {
    /// Bytes requested from the provider.
    size: usize,
  },
}

/// Result type alias for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;
