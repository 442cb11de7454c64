//! Pool sizing knobs.

use libc::{_SC_PAGESIZE, sysconf};

/// Page size assumed when the OS cannot be asked.
pub const FALLBACK_PAGE_SIZE: usize = 4096;

/// Default total extent of a pool block (16 KiB).
pub const DEFAULT_POOL_SIZE: usize = 16 * 1024;

/// Alignment requested from the provider for every block.
pub const POOL_ALIGNMENT: usize = 16;

/// Returns the OS page size, or [`FALLBACK_PAGE_SIZE`] if `sysconf` fails.
pub fn page_size() -> usize {
  let size = unsafe { sysconf(_SC_PAGESIZE) };

  if size <= 0 {
    FALLBACK_PAGE_SIZE
  } else {
    size as usize
  }
}

/// Largest request ever served from a block by default: one page minus one byte.
pub fn default_max_alloc_from_pool() -> usize {
  page_size() - 1
}

/// Configuration for a [`Pool`](crate::Pool).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
  /// Total extent of the first block, header included. Growth blocks copy it.
  pub size: usize,
  /// Upper bound for the small/large threshold.
  pub max_alloc_from_pool: usize,
  /// Alignment requested from the provider for blocks. Power of two, at least a word.
  pub pool_alignment: usize,
}

impl Default for PoolConfig {
  fn default() -> Self {
    Self {
      size: DEFAULT_POOL_SIZE,
      max_alloc_from_pool: default_max_alloc_from_pool(),
      pool_alignment: POOL_ALIGNMENT,
    }
  }
}

impl PoolConfig {
  pub fn with_size(
    mut self,
    size: usize,
  ) -> Self {
    self.size = size;
    self
  }

  pub fn with_max_alloc_from_pool(
    mut self,
    max: usize,
  ) -> Self {
    self.max_alloc_from_pool = max;
    self
  }

  pub fn with_pool_alignment(
    mut self,
    alignment: usize,
  ) -> Self {
    self.pool_alignment = alignment;
    self
  }
}
