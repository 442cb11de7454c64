use std::mem;

/// Size of a platform word. Aligned small allocations start on a multiple of it.
pub const WORD: usize = mem::size_of::<usize>();

/// Rounds `value` up to the next multiple of `alignment`.
///
/// `alignment` must be a power of two.
///
/// # Examples
///
/// ```rust
/// use rpool::align_to;
///
/// assert_eq!(align_to!(13, 16), 16);
/// assert_eq!(align_to!(32, 16), 32);
/// assert_eq!(align_to!(0, 8), 0);
/// ```
#[macro_export]
macro_rules! align_to {
  ($value:expr, $alignment:expr) => {
    (($value) + ($alignment) - 1) & !(($alignment) - 1)
  };
}

/// Rounds `value` up to the machine word alignment.
///
/// # Examples
///
/// ```rust
/// use std::mem;
/// use rpool::align;
///
/// match mem::size_of::<usize>() {
///     8 => assert_eq!(align!(13), 16), // 64 bit machine.
///     4 => assert_eq!(align!(11), 12), // 32 bit machine.
///     _ => {},
/// };
/// ```
#[macro_export]
macro_rules! align {
  ($value:expr) => {
    $crate::align_to!($value, $crate::align::WORD)
  };
}

/// Moves `ptr` forward to the next address that is a multiple of `alignment`.
///
/// The result keeps the provenance of `ptr`; it is only dereferenceable if it
/// still lies inside the allocation `ptr` came from.
#[inline]
pub fn align_ptr(
  ptr: *mut u8,
  alignment: usize,
) -> *mut u8 {
  debug_assert!(alignment.is_power_of_two());

  let addr = ptr as usize;
  ptr.wrapping_add(align_to!(addr, alignment) - addr)
}
