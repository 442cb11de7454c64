use std::ptr::NonNull;

use crate::align::WORD;

/// Footprint of one large record carved from the block chain: next link and payload.
pub const LARGE_RECORD_SIZE: usize = 2 * WORD;

/// How many records, counted from the head, are probed for an emptied slot.
pub const LARGE_REUSE_WINDOW: usize = 3;

/// Records of large payloads, most recently added first.
///
/// A slot holding `None` had its payload freed and may take a new one.
#[derive(Debug, Default)]
pub struct LargeRegistry {
  // Head is the last element.
  slots: Vec<Option<NonNull<u8>>>,
}

impl LargeRegistry {
  /// Stores `payload` in the first empty slot within [`LARGE_REUSE_WINDOW`]
  /// records of the head. Returns `false` if there is none.
  pub fn reuse_empty(
    &mut self,
    payload: NonNull<u8>,
  ) -> bool {
    let slot = self
      .slots
      .iter_mut()
      .rev()
      .take(LARGE_REUSE_WINDOW)
      .find(|slot| slot.is_none());

    match slot {
      Some(slot) => {
        *slot = Some(payload);
        true
      }
      None => false,
    }
  }

  /// Links a new record at the head.
  pub fn push(
    &mut self,
    payload: NonNull<u8>,
  ) {
    self.slots.push(Some(payload));
  }

  /// Empties the slot holding `ptr` and returns the payload so it can be released.
  pub fn take(
    &mut self,
    ptr: *const u8,
  ) -> Option<NonNull<u8>> {
    self
      .slots
      .iter_mut()
      .rev()
      .find(|slot| matches!(slot, Some(payload) if payload.as_ptr() as *const u8 == ptr))
      .and_then(Option::take)
  }

  /// Unlinks every record, yielding the payloads still held.
  pub fn drain(&mut self) -> impl Iterator<Item = NonNull<u8>> + '_ {
    self.slots.drain(..).rev().flatten()
  }

  /// Number of records, emptied ones included.
  pub fn len(&self) -> usize {
    self.slots.len()
  }

  /// Number of records currently holding a payload.
  pub fn held(&self) -> usize {
    self.slots.iter().filter(|slot| slot.is_some()).count()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn fake(addr: usize) -> NonNull<u8> {
    NonNull::new(addr as *mut u8).unwrap()
  }

  #[test]
  fn test_take_empties_slot() {
    let mut registry = LargeRegistry::default();
    registry.push(fake(0x1000));
    registry.push(fake(0x2000));

    assert_eq!(registry.take(0x1000 as *const u8), Some(fake(0x1000)));
    assert_eq!(registry.take(0x1000 as *const u8), None);
    assert_eq!(registry.take(0x3000 as *const u8), None);
    assert_eq!(registry.len(), 2);
    assert_eq!(registry.held(), 1);
  }

  #[test]
  fn test_reuse_within_window() {
    let mut registry = LargeRegistry::default();
    for addr in [0x1000, 0x2000, 0x3000] {
      registry.push(fake(addr));
    }

    // Oldest record is third from the head.
    registry.take(0x1000 as *const u8);

    assert!(registry.reuse_empty(fake(0x4000)));
    assert_eq!(registry.len(), 3);
    assert_eq!(registry.held(), 3);
  }

  #[test]
  fn test_no_reuse_past_window() {
    let mut registry = LargeRegistry::default();
    for addr in [0x1000, 0x2000, 0x3000, 0x4000] {
      registry.push(fake(addr));
    }

    // Fourth from the head: outside the window.
    registry.take(0x1000 as *const u8);

    assert!(!registry.reuse_empty(fake(0x5000)));
    assert_eq!(registry.held(), 3);
  }

  #[test]
  fn test_drain_skips_empty() {
    let mut registry = LargeRegistry::default();
    for addr in [0x1000, 0x2000, 0x3000] {
      registry.push(fake(addr));
    }
    registry.take(0x2000 as *const u8);

    let drained: Vec<_> = registry.drain().collect();

    assert_eq!(drained, vec![fake(0x3000), fake(0x1000)]);
    assert_eq!(registry.len(), 0);
  }
}
