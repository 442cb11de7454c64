//! # rpool - A Region-Based Memory Pool
//!
//! This crate provides a **memory pool** (also known as a region or arena)
//! that hands out many small, short-lived allocations from large blocks and
//! takes them all back at once.
//!
//! ## Overview
//!
//! ```text
//!   Pool Concept:
//!
//!   ┌──────────────────────────────────────────────────────────────────────┐
//!   │                          BLOCK CHAIN                                 │
//!   │                                                                      │
//!   │   ┌────────┬────┬────┬────┬──────────┐     ┌────────┬────┬────────┐  │
//!   │   │ header │ A1 │ A2 │ A3 │   free   │ ──▶ │ header │ A4 │  free  │  │
//!   │   └────────┴────┴────┴────┴──────────┘     └────────┴────┴────────┘  │
//!   │                           ▲                          ▲               │
//!   │                         cursor                     cursor            │
//!   │                                                                      │
//!   │   LARGE:    [ L2 ] ──▶ [ empty ] ──▶ [ L1 ]    (provider memory)      │
//!   │   CLEANUP:  [ close(fd) ] ──▶ [ free(buf) ]    (run at teardown)      │
//!   └──────────────────────────────────────────────────────────────────────┘
//!
//!   Small requests bump a cursor: O(1), never freed one by one.
//!   Large requests go to the provider and can be freed individually.
//! ```
//!
//! ## Crate Structure
//!
//! ```text
//!   rpool
//!   ├── align      - Alignment macros (align!, align_to!) and align_ptr
//!   ├── block      - Block: one region with a bump cursor (internal)
//!   ├── cleanup    - Cleanup records and file finalizers
//!   ├── config     - PoolConfig and sizing constants
//!   ├── error      - PoolError
//!   ├── large      - Registry of large allocations (internal)
//!   ├── pool       - Pool implementation
//!   └── provider   - RawMemory trait, LibcMemory, CountingMemory
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use rpool::Pool;
//!
//! let mut pool = Pool::new(4096).unwrap();
//!
//! // Served from the first block.
//! let small = pool.allocate(128).unwrap();
//!
//! // Above the threshold: served by the provider and freeable on its own.
//! let large = pool.allocate(pool.max() + 1).unwrap();
//! assert!(pool.free_large(large));
//!
//! // Runs when the pool goes away.
//! let buffer = Box::into_raw(vec![0u8; 64].into_boxed_slice());
//! let cleanup = pool.cleanup_add(0).unwrap();
//! cleanup.set_data(buffer as *mut u8);
//! cleanup.set_handler(move |_| drop(unsafe { Box::from_raw(buffer) }));
//!
//! # let _ = small;
//! drop(pool);
//! ```
//!
//! ## How It Works
//!
//! A request of `size <= pool.max()` is small. Blocks are probed in creation
//! order starting from the *current* block, and the first one with room wins.
//! When none has room a new block, as large as the first, is appended.
//!
//! ```text
//!   Growth:
//!
//!   current
//!      ▼
//!   [ B0 failed=6 ]──[ B1 failed=2 ]──[ B2 failed=0 ]──[ B3 new ]
//!
//!   Every growth event charges one failure to each probed block except the
//!   tail. A block charged more than 5 times stops being probed: current
//!   moves past it. It is still reset and released with the others.
//! ```
//!
//! A larger request is served by the provider. Its payload is tracked by a
//! record whose own footprint comes from the blocks. A freed record is reused
//! by a later large request if it sits within the three records nearest the
//! head.
//!
//! Teardown runs the cleanups newest first, releases the large payloads, then
//! the blocks.
//!
//! ## Limitations
//!
//! - **Single-threaded only**: No synchronization primitives
//! - **No individual free of small allocations**: only reset or teardown reclaim them
//! - **Cleanups survive reset**: a cleanup whose data lives in a block may see
//!   that memory reused after [`Pool::reset`]
//!
//! ## Safety
//!
//! Allocation calls are safe and return raw pointers. Reading or writing
//! through them is `unsafe` and only valid until the next reset or teardown
//! (or, for large allocations, until [`Pool::free_large`]).

pub mod align;
mod block;
pub mod cleanup;
pub mod config;
pub mod error;
mod large;
mod pool;
pub mod provider;

pub use block::{BLOCK_HEADER_SIZE, POOL_HEADER_SIZE};
pub use cleanup::{CLEANUP_RECORD_SIZE, Cleanup, CleanupHandler};
pub use config::{DEFAULT_POOL_SIZE, PoolConfig};
pub use error::{PoolError, Result};
pub use large::{LARGE_RECORD_SIZE, LARGE_REUSE_WINDOW};
pub use pool::{BlockStats, MAX_FAILED, MIN_POOL_SIZE, Pool, PoolStats};
pub use provider::{CountingMemory, LibcMemory, RawMemory};
