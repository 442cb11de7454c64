use std::ptr::NonNull;

use crate::align::{WORD, align_ptr};

/// Bytes reserved at the front of every growth block: cursor, end, next link
/// and fail counter.
pub const BLOCK_HEADER_SIZE: usize = 4 * WORD;

/// Bytes reserved at the front of the first block: a block header plus the
/// threshold, current pointer and both registry heads.
pub const POOL_HEADER_SIZE: usize = BLOCK_HEADER_SIZE + 4 * WORD;

/// One contiguous region handed out by bumping a cursor.
///
/// ```text
///   ┌──────────┬─────────────────────────┬──────────────────────┐
///   │  header  │   handed out (used)     │   free (remaining)   │
///   └──────────┴─────────────────────────┴──────────────────────┘
///   ▲ start                              ▲ cursor               ▲ end
/// ```
///
/// The block does not own its memory: the pool that created it hands it back
/// to the provider.
#[derive(Debug)]
pub struct Block {
  start: NonNull<u8>,
  end: *mut u8,
  cursor: *mut u8,
  header: usize,
  pub failed: usize,
}

impl Block {
  /// # Safety
  ///
  /// `start` must point to `size` writable bytes that outlive the block, and
  /// `header <= size`.
  pub unsafe fn new(
    start: NonNull<u8>,
    size: usize,
    header: usize,
  ) -> Self {
    debug_assert!(header <= size);

    let base = start.as_ptr();

    Self {
      start,
      end: base.wrapping_add(size),
      cursor: base.wrapping_add(header),
      header,
      failed: 0,
    }
  }

  /// Claims `size` bytes at the cursor, rounded up to a word boundary first
  /// when `aligned` is set. Returns `None` if the block has no room.
  pub fn alloc(
    &mut self,
    size: usize,
    aligned: bool,
  ) -> Option<NonNull<u8>> {
    let candidate = if aligned { align_ptr(self.cursor, WORD) } else { self.cursor };

    let room = (self.end as usize).checked_sub(candidate as usize)?;
    if room < size {
      return None;
    }

    self.cursor = candidate.wrapping_add(size);

    NonNull::new(candidate)
  }

  /// Rewinds the cursor to just past the header and clears the fail counter.
  pub fn reset(&mut self) {
    self.cursor = self.start.as_ptr().wrapping_add(self.header);
    self.failed = 0;
  }

  pub fn start(&self) -> NonNull<u8> {
    self.start
  }

  /// Total extent, header included.
  pub fn size(&self) -> usize {
    self.end as usize - self.start.as_ptr() as usize
  }

  /// Bytes usable for allocations.
  pub fn capacity(&self) -> usize {
    self.size() - self.header
  }

  pub fn used(&self) -> usize {
    self.cursor as usize - self.start.as_ptr() as usize - self.header
  }

  pub fn remaining(&self) -> usize {
    self.end as usize - self.cursor as usize
  }

  /// Whether `[ptr, ptr + len)` lies inside the data area of this block.
  pub fn contains(
    &self,
    ptr: *const u8,
    len: usize,
  ) -> bool {
    let data_start = self.start.as_ptr() as usize + self.header;
    let addr = ptr as usize;

    addr >= data_start && addr.saturating_add(len) <= self.end as usize
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn block_over(
    buffer: &mut [usize],
    header: usize,
  ) -> Block {
    let size = buffer.len() * WORD;
    let start = NonNull::new(buffer.as_mut_ptr() as *mut u8).unwrap();

    unsafe { Block::new(start, size, header) }
  }

  #[test]
  fn test_alloc_bumps_cursor() {
    let mut buffer = [0usize; 32];
    let mut block = block_over(&mut buffer, BLOCK_HEADER_SIZE);

    let first = block.alloc(10, true).unwrap();
    let second = block.alloc(10, true).unwrap();

    assert_eq!(first.as_ptr() as usize % WORD, 0);
    assert_eq!(second.as_ptr() as usize % WORD, 0);
    assert_eq!(second.as_ptr() as usize - first.as_ptr() as usize, crate::align!(10));
    assert!(block.contains(first.as_ptr(), 10));
    assert!(block.contains(second.as_ptr(), 10));
  }

  #[test]
  fn test_unaligned_packs_bytes() {
    let mut buffer = [0usize; 32];
    let mut block = block_over(&mut buffer, BLOCK_HEADER_SIZE);

    let first = block.alloc(3, false).unwrap();
    let second = block.alloc(3, false).unwrap();

    assert_eq!(second.as_ptr() as usize - first.as_ptr() as usize, 3);
    assert_eq!(block.used(), 6);
  }

  #[test]
  fn test_exhaustion() {
    let mut buffer = [0usize; 16];
    let mut block = block_over(&mut buffer, BLOCK_HEADER_SIZE);
    let capacity = block.capacity();

    assert!(block.alloc(capacity + 1, false).is_none());
    assert!(block.alloc(capacity, false).is_some());
    assert_eq!(block.remaining(), 0);
    assert!(block.alloc(1, false).is_none());
    assert!(block.alloc(0, false).is_some());
  }

  #[test]
  fn test_alignment_padding_counts_against_room() {
    let mut buffer = [0usize; 16];
    let mut block = block_over(&mut buffer, BLOCK_HEADER_SIZE);
    let capacity = block.capacity();

    block.alloc(1, false).unwrap();

    // One byte used, the aligned candidate skips to the next word.
    assert!(block.alloc(capacity - WORD + 1, true).is_none());
    assert!(block.alloc(capacity - WORD, true).is_some());
  }

  #[test]
  fn test_reset() {
    let mut buffer = [0usize; 16];
    let mut block = block_over(&mut buffer, POOL_HEADER_SIZE);

    let first = block.alloc(8, true).unwrap();
    block.failed = 3;
    block.reset();

    assert_eq!(block.used(), 0);
    assert_eq!(block.failed, 0);
    assert_eq!(block.alloc(8, true).unwrap(), first);
    assert_eq!(first.as_ptr() as usize - block.start().as_ptr() as usize, POOL_HEADER_SIZE);
  }
}
