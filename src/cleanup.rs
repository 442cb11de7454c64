//! Deferred finalizers run when a pool is torn down.
//!
//! Each record pairs an optional handler with a `data` address. Handlers run
//! at most once, newest first, and never on reset.

use std::{ffi::CStr, fmt, io, os::fd::RawFd, ptr};

use libc::{close, unlink};

use crate::align::WORD;

/// Footprint of one cleanup record carved from the block chain: handler, data and next link.
pub const CLEANUP_RECORD_SIZE: usize = 3 * WORD;

/// Finalizer bound to a cleanup record. Receives the record's `data`.
pub type CleanupHandler = Box<dyn FnOnce(*mut u8)>;

/// A registered cleanup.
///
/// Returned by [`Pool::cleanup_add`](crate::Pool::cleanup_add) with no
/// handler; bind one with [`Cleanup::set_handler`] or it is skipped.
pub struct Cleanup {
  handler: Option<CleanupHandler>,
  data: *mut u8,
  file: Option<RawFd>,
}

impl Cleanup {
  pub(crate) fn new(data: *mut u8) -> Self {
    Self {
      handler: None,
      data,
      file: None,
    }
  }

  /// Address passed to the handler. Null when registered with size zero
  /// and not assigned since.
  pub fn data(&self) -> *mut u8 {
    self.data
  }

  /// Points the record at externally owned data.
  pub fn set_data(
    &mut self,
    data: *mut u8,
  ) {
    self.data = data;
  }

  pub fn set_handler<F>(
    &mut self,
    handler: F,
  ) where
    F: FnOnce(*mut u8) + 'static,
  {
    self.handler = Some(Box::new(handler));
  }

  pub fn has_handler(&self) -> bool {
    self.handler.is_some()
  }

  /// File descriptor this record closes, if it was registered as a file cleanup.
  pub fn file(&self) -> Option<RawFd> {
    self.file
  }

  pub(crate) fn set_file(
    &mut self,
    fd: RawFd,
  ) {
    self.file = Some(fd);
  }

  /// Runs and unbinds the handler. Returns `false` if none was bound.
  pub(crate) fn run(&mut self) -> bool {
    match self.handler.take() {
      Some(handler) => {
        handler(self.data);
        true
      }
      None => false,
    }
  }
}

impl Default for Cleanup {
  fn default() -> Self {
    Self::new(ptr::null_mut())
  }
}

impl fmt::Debug for Cleanup {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    f.debug_struct("Cleanup")
      .field("handler", &self.handler.is_some())
      .field("data", &self.data)
      .field("file", &self.file)
      .finish()
  }
}

/// Cleanup records, most recently registered first.
#[derive(Debug, Default)]
pub struct CleanupRegistry {
  // Head is the last element.
  records: Vec<Cleanup>,
}

impl CleanupRegistry {
  /// Links `record` at the head and hands it back for wiring.
  pub fn push(
    &mut self,
    record: Cleanup,
  ) -> &mut Cleanup {
    self.records.push(record);

    let head = self.records.len() - 1;
    &mut self.records[head]
  }

  /// Runs every bound handler from the head. Returns how many ran.
  pub fn run_all(&mut self) -> usize {
    self.records.iter_mut().rev().map(Cleanup::run).filter(|ran| *ran).count()
  }

  /// Nearest-to-head file cleanup for `fd` whose handler is still bound.
  pub fn find_file(
    &mut self,
    fd: RawFd,
  ) -> Option<&mut Cleanup> {
    self
      .records
      .iter_mut()
      .rev()
      .find(|record| record.file == Some(fd) && record.has_handler())
  }

  pub fn len(&self) -> usize {
    self.records.len()
  }

  pub fn is_empty(&self) -> bool {
    self.records.is_empty()
  }
}

/// Closes `fd`, logging instead of failing.
pub fn close_file(fd: RawFd) {
  tracing::debug!(fd, "cleanup: closing file");

  if unsafe { close(fd) } == -1 {
    tracing::warn!(fd, error = %io::Error::last_os_error(), "close() failed");
  }
}

/// Unlinks `path`, then closes `fd`, logging instead of failing.
pub fn delete_file(
  fd: RawFd,
  path: &CStr,
) {
  tracing::debug!(fd, path = ?path, "cleanup: deleting file");

  if unsafe { unlink(path.as_ptr()) } == -1 {
    let error = io::Error::last_os_error();
    if error.kind() != io::ErrorKind::NotFound {
      tracing::warn!(path = ?path, %error, "unlink() failed");
    }
  }

  close_file(fd);
}
