//! Raw-memory providers.
//!
//! The pool never talks to the system allocator directly. Blocks and large
//! payloads come from a [`RawMemory`] implementation: [`LibcMemory`] in
//! production, [`CountingMemory`] when a caller wants to check that every
//! request was handed back.

use std::{
  cell::{Cell, RefCell},
  collections::HashSet,
  mem,
  ptr::{self, NonNull},
  rc::Rc,
};

use libc::{c_void, free, posix_memalign};

/// Supplier of naturally aligned raw memory.
pub trait RawMemory {
  /// Returns `size` bytes aligned to at least `alignment`, or `None` when exhausted.
  ///
  /// `alignment` is a power of two.
  fn request(
    &self,
    size: usize,
    alignment: usize,
  ) -> Option<NonNull<u8>>;

  /// Hands memory back.
  ///
  /// # Safety
  ///
  /// `ptr` must come from [`RawMemory::request`] on this provider and must not
  /// be released twice.
  unsafe fn release(
    &self,
    ptr: NonNull<u8>,
  );
}

/// Provider backed by `posix_memalign(3)` and `free(3)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LibcMemory;

impl RawMemory for LibcMemory {
  fn request(
    &self,
    size: usize,
    alignment: usize,
  ) -> Option<NonNull<u8>> {
    // posix_memalign wants a multiple of sizeof(void *).
    let alignment = alignment.max(mem::size_of::<*mut c_void>());
    let mut address: *mut c_void = ptr::null_mut();

    let rc = unsafe { posix_memalign(&mut address, alignment, size.max(1)) };

    if rc != 0 {
      tracing::warn!(size, alignment, rc, "posix_memalign failed");
      return None;
    }

    NonNull::new(address as *mut u8)
  }

  unsafe fn release(
    &self,
    ptr: NonNull<u8>,
  ) {
    unsafe { free(ptr.as_ptr() as *mut c_void) }
  }
}

#[derive(Debug, Default)]
struct Counters {
  requests: Cell<usize>,
  releases: Cell<usize>,
  budget: Cell<Option<usize>>,
  live: RefCell<HashSet<usize>>,
}

/// Wraps another provider and keeps books on it.
///
/// Clones share the same counters, so a test can keep one handle while the
/// pool owns another. A request budget makes the provider fail on demand.
#[derive(Debug, Default, Clone)]
pub struct CountingMemory<M: RawMemory = LibcMemory> {
  inner: M,
  counters: Rc<Counters>,
}

impl CountingMemory<LibcMemory> {
  pub fn new() -> Self {
    Self::wrap(LibcMemory)
  }
}

impl<M: RawMemory> CountingMemory<M> {
  pub fn wrap(inner: M) -> Self {
    Self {
      inner,
      counters: Rc::new(Counters::default()),
    }
  }

  /// Lets the next `requests` requests through, then fails every later one.
  pub fn fail_after(
    &self,
    requests: usize,
  ) {
    self.counters.budget.set(Some(requests));
  }

  /// Removes any request budget.
  pub fn unlimited(&self) {
    self.counters.budget.set(None);
  }

  /// Successful requests so far.
  pub fn requests(&self) -> usize {
    self.counters.requests.get()
  }

  /// Releases so far.
  pub fn releases(&self) -> usize {
    self.counters.releases.get()
  }

  /// Requests not yet released.
  pub fn outstanding(&self) -> usize {
    self.counters.live.borrow().len()
  }

  /// Whether `ptr` was handed out and not yet released.
  pub fn is_live(
    &self,
    ptr: *const u8,
  ) -> bool {
    self.counters.live.borrow().contains(&(ptr as usize))
  }
}

impl<M: RawMemory> RawMemory for CountingMemory<M> {
  fn request(
    &self,
    size: usize,
    alignment: usize,
  ) -> Option<NonNull<u8>> {
    if let Some(budget) = self.counters.budget.get() {
      if budget == 0 {
        return None;
      }
      self.counters.budget.set(Some(budget - 1));
    }

    let ptr = self.inner.request(size, alignment)?;

    self.counters.requests.set(self.counters.requests.get() + 1);
    self.counters.live.borrow_mut().insert(ptr.as_ptr() as usize);

    Some(ptr)
  }

  unsafe fn release(
    &self,
    ptr: NonNull<u8>,
  ) {
    let known = self.counters.live.borrow_mut().remove(&(ptr.as_ptr() as usize));
    debug_assert!(known, "release of {:?} which is not live", ptr);

    self.counters.releases.set(self.counters.releases.get() + 1);

    unsafe { self.inner.release(ptr) }
  }
}
