use std::{
  alloc::Layout,
  ffi::CString,
  fmt,
  os::fd::RawFd,
  ptr::{self, NonNull},
};

use tracing::{debug, trace, warn};

use crate::{
  align::WORD,
  align_to,
  block::{BLOCK_HEADER_SIZE, Block, POOL_HEADER_SIZE},
  cleanup::{CLEANUP_RECORD_SIZE, Cleanup, CleanupRegistry, close_file, delete_file},
  config::{POOL_ALIGNMENT, PoolConfig},
  error::{PoolError, Result},
  large::{LARGE_RECORD_SIZE, LargeRegistry},
  provider::{LibcMemory, RawMemory},
};

/// Smallest accepted pool size: the pool header plus room for two large records.
pub const MIN_POOL_SIZE: usize = align_to!(POOL_HEADER_SIZE + 2 * LARGE_RECORD_SIZE, POOL_ALIGNMENT);

/// A block that has sat through more growth events than this is no longer probed.
pub const MAX_FAILED: usize = 5;

/// Region-based memory pool.
///
/// Small requests (`size <= max()`) are bumped out of a chain of equally sized
/// blocks and only come back on [`reset`](Pool::reset) or when the pool is
/// dropped. Larger requests go straight to the provider and are tracked so
/// they can be released individually with [`free_large`](Pool::free_large).
///
/// ```text
///   Pool
///   ├── blocks:  [ block 0 ]──[ block 1 ]──[ block 2 ]      (creation order)
///   │                              ▲
///   │                           current                     (first block probed)
///   ├── large:   record ─▶ record ─▶ record                 (newest first)
///   └── cleanup: record ─▶ record                           (newest first)
/// ```
///
/// The pool is single-owner and neither `Send` nor `Sync`.
pub struct Pool<M: RawMemory = LibcMemory> {
  memory: M,
  config: PoolConfig,
  blocks: Vec<Block>,
  current: usize,
  max: usize,
  large: LargeRegistry,
  cleanup: CleanupRegistry,
}

/// Snapshot of one block, see [`Pool::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockStats {
  pub size: usize,
  pub capacity: usize,
  pub used: usize,
  pub remaining: usize,
  pub failed: usize,
}

/// Snapshot of a pool's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
  pub blocks: Vec<BlockStats>,
  pub current: usize,
  pub max: usize,
  pub large_records: usize,
  pub large_held: usize,
  pub cleanups: usize,
}

impl Pool<LibcMemory> {
  /// Creates a pool whose blocks are `size` bytes, header included.
  ///
  /// `size` is raised to [`MIN_POOL_SIZE`] if smaller.
  pub fn new(size: usize) -> Result<Self> {
    Self::with_config(PoolConfig::default().with_size(size))
  }

  pub fn with_config(config: PoolConfig) -> Result<Self> {
    Self::with_provider(config, LibcMemory)
  }
}

impl<M: RawMemory> Pool<M> {
  /// Creates a pool drawing its memory from `memory`.
  pub fn with_provider(
    config: PoolConfig,
    memory: M,
  ) -> Result<Self> {
    let config = PoolConfig {
      size: config.size.max(MIN_POOL_SIZE),
      pool_alignment: config.pool_alignment.max(WORD).next_power_of_two(),
      ..config
    };

    let Some(start) = memory.request(config.size, config.pool_alignment) else {
      warn!(size = config.size, "pool creation failed");
      return Err(PoolError::AllocationFailure { size: config.size });
    };

    let first = unsafe { Block::new(start, config.size, POOL_HEADER_SIZE) };
    let max = (config.size - POOL_HEADER_SIZE).min(config.max_alloc_from_pool);

    debug!(size = config.size, max, "pool created");

    Ok(Self {
      memory,
      config,
      blocks: vec![first],
      current: 0,
      max,
      large: LargeRegistry::default(),
      cleanup: CleanupRegistry::default(),
    })
  }

  /// Allocates `size` bytes aligned to the platform word.
  pub fn allocate(
    &mut self,
    size: usize,
  ) -> Result<NonNull<u8>> {
    if size <= self.max {
      return self.alloc_small(size, true);
    }

    self.alloc_large(size)
  }

  /// Allocates `size` bytes with no alignment on the small path.
  pub fn allocate_raw(
    &mut self,
    size: usize,
  ) -> Result<NonNull<u8>> {
    if size <= self.max {
      return self.alloc_small(size, false);
    }

    self.alloc_large(size)
  }

  /// Like [`allocate`](Pool::allocate), then fills the bytes with zero.
  pub fn allocate_zeroed(
    &mut self,
    size: usize,
  ) -> Result<NonNull<u8>> {
    let ptr = self.allocate(size)?;

    unsafe { ptr::write_bytes(ptr.as_ptr(), 0, size) };

    Ok(ptr)
  }

  /// Allocates `size` bytes aligned to `alignment` straight from the provider.
  ///
  /// Always served as a large allocation, whatever its size, and always
  /// tracked by a fresh record. `alignment` must be a power of two.
  pub fn allocate_aligned(
    &mut self,
    size: usize,
    alignment: usize,
  ) -> Result<NonNull<u8>> {
    debug_assert!(alignment.is_power_of_two());

    let payload = self.request(size, alignment.max(WORD))?;
    self.track_large(payload, size)
  }

  /// Moves `value` into the pool.
  ///
  /// The value is never dropped by the pool; register a cleanup if it owns
  /// resources.
  pub fn alloc<T>(
    &mut self,
    value: T,
  ) -> Result<NonNull<T>> {
    let ptr = self.alloc_layout(Layout::new::<T>())?.cast::<T>();

    unsafe { ptr.as_ptr().write(value) };

    Ok(ptr)
  }

  /// Copies `src` into the pool.
  pub fn alloc_slice_copy<T: Copy>(
    &mut self,
    src: &[T],
  ) -> Result<NonNull<[T]>> {
    let layout = Layout::for_value(src);
    let ptr = self.alloc_layout(layout)?.cast::<T>();

    unsafe { ptr::copy_nonoverlapping(src.as_ptr(), ptr.as_ptr(), src.len()) };

    Ok(NonNull::slice_from_raw_parts(ptr, src.len()))
  }

  /// Releases a large allocation now.
  ///
  /// Returns `false`, and does nothing, if `ptr` is not a payload tracked by
  /// this pool (small allocations included). The record stays linked and may
  /// be reused by a later large allocation.
  pub fn free_large<T: ?Sized>(
    &mut self,
    ptr: NonNull<T>,
  ) -> bool {
    let Some(payload) = self.large.take(ptr.cast::<u8>().as_ptr()) else {
      return false;
    };

    debug!(ptr = ?payload, "large free");
    unsafe { self.memory.release(payload) };

    true
  }

  /// Registers a cleanup record.
  ///
  /// With `size > 0` the record's data points at `size` fresh bytes from the
  /// pool; with `size == 0` it is null and the caller sets it. The record is
  /// linked only once every allocation has succeeded. Its handler starts
  /// unbound.
  pub fn cleanup_add(
    &mut self,
    size: usize,
  ) -> Result<&mut Cleanup> {
    self.alloc_small(CLEANUP_RECORD_SIZE, true)?;

    let data = if size > 0 { self.allocate(size)?.as_ptr() } else { ptr::null_mut() };

    Ok(self.cleanup.push(Cleanup::new(data)))
  }

  /// Registers a cleanup that closes `fd` when the pool is torn down.
  pub fn cleanup_file(
    &mut self,
    fd: RawFd,
  ) -> Result<&mut Cleanup> {
    let record = self.cleanup_add(0)?;
    record.set_file(fd);
    record.set_handler(move |_| close_file(fd));

    Ok(record)
  }

  /// Registers a cleanup that unlinks `path` and closes `fd` when the pool is torn down.
  pub fn cleanup_delete_file(
    &mut self,
    fd: RawFd,
    path: CString,
  ) -> Result<&mut Cleanup> {
    let record = self.cleanup_add(0)?;
    record.set_file(fd);
    record.set_handler(move |_| delete_file(fd, &path));

    Ok(record)
  }

  /// Runs the file cleanup registered for `fd` now instead of at teardown.
  ///
  /// Returns `false` if no bound file cleanup exists for `fd`.
  pub fn run_cleanup_file(
    &mut self,
    fd: RawFd,
  ) -> bool {
    match self.cleanup.find_file(fd) {
      Some(record) => record.run(),
      None => false,
    }
  }

  /// Releases every large payload and rewinds every block.
  ///
  /// Every pointer handed out before the reset is invalid afterwards. Blocks
  /// are kept. Cleanup records are neither run nor removed: a record whose
  /// data lives in a block sees that memory reused by later allocations.
  pub fn reset(&mut self) {
    let mut released = 0;
    for payload in self.large.drain() {
      unsafe { self.memory.release(payload) };
      released += 1;
    }

    for block in &mut self.blocks {
      block.reset();
    }
    self.current = 0;

    debug!(blocks = self.blocks.len(), released, "pool reset");
  }

  /// Runs the cleanups and releases all memory. Same as dropping the pool.
  pub fn destroy(self) {
    drop(self);
  }

  /// Largest size served from the blocks.
  pub fn max(&self) -> usize {
    self.max
  }

  pub fn config(&self) -> &PoolConfig {
    &self.config
  }

  pub fn block_count(&self) -> usize {
    self.blocks.len()
  }

  /// Large records, emptied ones included.
  pub fn large_count(&self) -> usize {
    self.large.len()
  }

  pub fn cleanup_count(&self) -> usize {
    self.cleanup.len()
  }

  /// Whether `[ptr, ptr + len)` lies inside one of the pool's blocks.
  pub fn contains(
    &self,
    ptr: *const u8,
    len: usize,
  ) -> bool {
    self.blocks.iter().any(|block| block.contains(ptr, len))
  }

  pub fn stats(&self) -> PoolStats {
    PoolStats {
      blocks: self
        .blocks
        .iter()
        .map(|block| BlockStats {
          size: block.size(),
          capacity: block.capacity(),
          used: block.used(),
          remaining: block.remaining(),
          failed: block.failed,
        })
        .collect(),
      current: self.current,
      max: self.max,
      large_records: self.large.len(),
      large_held: self.large.held(),
      cleanups: self.cleanup.len(),
    }
  }

  fn alloc_layout(
    &mut self,
    layout: Layout,
  ) -> Result<NonNull<u8>> {
    if layout.align() <= WORD {
      return self.allocate(layout.size());
    }

    self.allocate_aligned(layout.size(), layout.align())
  }

  fn alloc_small(
    &mut self,
    size: usize,
    aligned: bool,
  ) -> Result<NonNull<u8>> {
    for (index, block) in self.blocks.iter_mut().enumerate().skip(self.current) {
      if let Some(ptr) = block.alloc(size, aligned) {
        trace!(size, aligned, block = index, ?ptr, "small alloc");
        return Ok(ptr);
      }
    }

    self.alloc_block(size)
  }

  /// Appends a block as large as the first one and serves `size` from it.
  fn alloc_block(
    &mut self,
    size: usize,
  ) -> Result<NonNull<u8>> {
    let block_size = self.blocks[0].size();

    let start = self.request(block_size, self.config.pool_alignment)?;
    let mut block = unsafe { Block::new(start, block_size, BLOCK_HEADER_SIZE) };

    let Some(ptr) = block.alloc(size, true) else {
      unsafe { self.memory.release(start) };
      return Err(PoolError::AllocationFailure { size });
    };

    let tail = self.blocks.len() - 1;
    for index in self.current..tail {
      let probed = &mut self.blocks[index];
      probed.failed += 1;

      if probed.failed > MAX_FAILED {
        self.current = index + 1;
      }
    }

    self.blocks.push(block);

    debug!(
      size,
      blocks = self.blocks.len(),
      current = self.current,
      "block appended"
    );

    Ok(ptr)
  }

  fn alloc_large(
    &mut self,
    size: usize,
  ) -> Result<NonNull<u8>> {
    let payload = self.request(size, self.config.pool_alignment)?;

    if self.large.reuse_empty(payload) {
      debug!(size, ptr = ?payload, "large alloc, slot reused");
      return Ok(payload);
    }

    self.track_large(payload, size)
  }

  /// Links a new record for `payload`, releasing it if the record cannot be carved.
  fn track_large(
    &mut self,
    payload: NonNull<u8>,
    size: usize,
  ) -> Result<NonNull<u8>> {
    if let Err(err) = self.alloc_small(LARGE_RECORD_SIZE, true) {
      unsafe { self.memory.release(payload) };
      return Err(err);
    }

    self.large.push(payload);
    debug!(size, ptr = ?payload, records = self.large.len(), "large alloc");

    Ok(payload)
  }

  fn request(
    &self,
    size: usize,
    alignment: usize,
  ) -> Result<NonNull<u8>> {
    self.memory.request(size, alignment).ok_or_else(|| {
      warn!(size, alignment, "provider exhausted");
      PoolError::AllocationFailure { size }
    })
  }
}

impl<M: RawMemory> Drop for Pool<M> {
  fn drop(&mut self) {
    let cleanups = self.cleanup.run_all();

    let mut released = 0;
    for payload in self.large.drain() {
      unsafe { self.memory.release(payload) };
      released += 1;
    }

    let blocks = self.blocks.len();
    for block in self.blocks.drain(..) {
      unsafe { self.memory.release(block.start()) };
    }

    debug!(cleanups, large = released, blocks, "pool destroyed");
  }
}

impl<M: RawMemory> fmt::Debug for Pool<M> {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    f.debug_struct("Pool")
      .field("config", &self.config)
      .field("blocks", &self.blocks.len())
      .field("current", &self.current)
      .field("max", &self.max)
      .field("large", &self.large.len())
      .field("cleanup", &self.cleanup.len())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use std::{cell::RefCell, rc::Rc};

  use rstest::rstest;

  use super::*;
  use crate::{large::LARGE_REUSE_WINDOW, provider::CountingMemory};

  fn counting_pool(size: usize) -> (Pool<CountingMemory>, CountingMemory) {
    let memory = CountingMemory::new();
    let pool = Pool::with_provider(PoolConfig::default().with_size(size), memory.clone()).unwrap();

    (pool, memory)
  }

  #[test]
  fn test_threshold() {
    let pool = Pool::new(512).unwrap();
    assert_eq!(pool.max(), 512 - POOL_HEADER_SIZE);

    let pool = Pool::new(1024 * 1024).unwrap();
    assert_eq!(pool.max(), pool.config().max_alloc_from_pool);
  }

  #[test]
  fn test_tiny_size_is_clamped() {
    let pool = Pool::new(1).unwrap();

    assert_eq!(pool.config().size, MIN_POOL_SIZE);
    assert_eq!(pool.max(), MIN_POOL_SIZE - POOL_HEADER_SIZE);
  }

  #[test]
  fn test_creation_failure() {
    let memory = CountingMemory::new();
    memory.fail_after(0);

    let err = Pool::with_provider(PoolConfig::default().with_size(512), memory).unwrap_err();

    assert_eq!(err, PoolError::AllocationFailure { size: 512 });
  }

  #[rstest]
  #[case(1)]
  #[case(3)]
  #[case(7)]
  #[case(13)]
  fn test_allocate_is_word_aligned(
    #[case] size: usize,
  ) {
    let mut pool = Pool::new(1024).unwrap();

    for _ in 0..8 {
      let ptr = pool.allocate(size).unwrap();
      assert_eq!(ptr.as_ptr() as usize % WORD, 0);
    }
  }

  #[test]
  fn test_allocate_raw_packs() {
    let mut pool = Pool::new(1024).unwrap();

    let first = pool.allocate_raw(3).unwrap();
    let second = pool.allocate_raw(5).unwrap();

    assert_eq!(second.as_ptr() as usize - first.as_ptr() as usize, 3);
  }

  #[test]
  fn test_first_fit_from_current() {
    let (mut pool, _memory) = counting_pool(512);
    let max = pool.max();

    pool.allocate(max).unwrap();
    pool.allocate(max).unwrap();
    assert_eq!(pool.block_count(), 2);

    // The first block still has no room, the second one does.
    let ptr = pool.allocate(8).unwrap();
    assert!(pool.blocks[1].contains(ptr.as_ptr(), 8));
  }

  #[test]
  fn test_growth_failure_keeps_chain() {
    let (mut pool, memory) = counting_pool(512);
    let max = pool.max();

    pool.allocate(max).unwrap();
    memory.fail_after(0);

    assert_eq!(pool.allocate(max), Err(PoolError::AllocationFailure { size: 512 }));
    assert_eq!(pool.block_count(), 1);
  }

  #[test]
  fn test_current_advances_past_exhausted_blocks() {
    let (mut pool, _memory) = counting_pool(512);
    let max = pool.max();

    // Each request fills a whole block. From the second one on, every request
    // grows the chain and charges a failure to every probed block but the tail.
    for _ in 0..MAX_FAILED + 2 {
      pool.allocate(max).unwrap();
    }
    assert_eq!(pool.blocks[0].failed, MAX_FAILED);
    assert_eq!(pool.current, 0);

    pool.allocate(max).unwrap();
    assert_eq!(pool.blocks[0].failed, MAX_FAILED + 1);
    assert_eq!(pool.current, 1);

    pool.allocate(max).unwrap();
    assert_eq!(pool.blocks[0].failed, MAX_FAILED + 1);
    assert_eq!(pool.current, 2);
  }

  #[test]
  fn test_small_success_does_not_touch_failed() {
    let (mut pool, _memory) = counting_pool(512);
    let max = pool.max();

    pool.allocate(max - 64).unwrap();
    pool.allocate(max).unwrap();
    assert_eq!(pool.blocks[0].failed, 0);

    pool.allocate(max).unwrap();
    assert_eq!(pool.blocks[0].failed, 1);

    // Fits the leftover in block 0.
    pool.allocate(16).unwrap();
    assert_eq!(pool.blocks[0].failed, 1);
  }

  #[test]
  fn test_large_record_failure_releases_payload() {
    let (mut pool, memory) = counting_pool(512);
    let max = pool.max();

    pool.allocate(max).unwrap();
    // Payload succeeds, the block needed for its record does not.
    memory.fail_after(1);

    assert!(pool.allocate(max + 1).is_err());
    assert_eq!(pool.large_count(), 0);
    assert_eq!(memory.outstanding(), 1);
  }

  #[test]
  fn test_reuse_window() {
    let (mut pool, _memory) = counting_pool(4096);
    let size = pool.max() + 1;

    let oldest = pool.allocate(size).unwrap();
    for _ in 1..LARGE_REUSE_WINDOW {
      pool.allocate(size).unwrap();
    }

    assert!(pool.free_large(oldest));
    pool.allocate(size).unwrap();
    assert_eq!(pool.large_count(), LARGE_REUSE_WINDOW);
  }

  #[test]
  fn test_allocate_aligned() {
    let (mut pool, memory) = counting_pool(4096);

    let ptr = pool.allocate_aligned(10, 256).unwrap();
    assert_eq!(ptr.as_ptr() as usize % 256, 0);
    assert_eq!(pool.large_count(), 1);

    assert!(pool.free_large(ptr));
    // Aligned allocations never take an emptied slot.
    pool.allocate_aligned(10, 64).unwrap();
    assert_eq!(pool.large_count(), 2);

    drop(pool);
    assert_eq!(memory.outstanding(), 0);
  }

  #[test]
  fn test_alloc_value() {
    #[derive(Debug, PartialEq)]
    #[repr(align(64))]
    struct Wide(u64);

    let mut pool = Pool::new(1024).unwrap();

    let small = pool.alloc(0xDEADBEEFu64).unwrap();
    let wide = pool.alloc(Wide(7)).unwrap();

    unsafe {
      assert_eq!(*small.as_ptr(), 0xDEADBEEF);
      assert_eq!(*wide.as_ptr(), Wide(7));
    }
    assert!(pool.contains(small.as_ptr() as *const u8, 8));
    assert_eq!(wide.as_ptr() as usize % 64, 0);
  }

  #[test]
  fn test_alloc_slice_copy() {
    let mut pool = Pool::new(1024).unwrap();

    let copy = pool.alloc_slice_copy(b"hello world").unwrap();

    assert_eq!(unsafe { copy.as_ref() }, b"hello world");
  }

  #[test]
  fn test_cleanup_add_payload() {
    let mut pool = Pool::new(1024).unwrap();

    let data = pool.cleanup_add(32).unwrap().data();
    assert!(pool.contains(data, 32));

    let data = pool.cleanup_add(0).unwrap().data();
    assert!(data.is_null());
    assert_eq!(pool.cleanup_count(), 2);
  }

  #[test]
  fn test_cleanup_add_failure_links_nothing() {
    let (mut pool, memory) = counting_pool(512);
    let max = pool.max();

    // Leave exactly enough for the record but not for its payload.
    pool.allocate(max - CLEANUP_RECORD_SIZE).unwrap();
    memory.fail_after(0);

    assert!(pool.cleanup_add(64).is_err());
    assert_eq!(pool.cleanup_count(), 0);
  }

  #[test]
  fn test_cleanups_survive_reset() {
    let calls = Rc::new(RefCell::new(0));
    let memory = CountingMemory::new();

    {
      let mut pool = Pool::with_provider(PoolConfig::default().with_size(512), memory.clone()).unwrap();

      let seen = calls.clone();
      pool.cleanup_add(0).unwrap().set_handler(move |_| *seen.borrow_mut() += 1);

      pool.reset();
      assert_eq!(*calls.borrow(), 0);
      assert_eq!(pool.cleanup_count(), 1);
    }

    assert_eq!(*calls.borrow(), 1);
    assert_eq!(memory.outstanding(), 0);
  }
}
