//! # sharedkit
//!
//! Lock-free, multi-process data structures over POSIX shared memory.
//!
//! This library provides two structures whose backing storage is a single
//! named shared-memory object per instance: a durable FIFO
//! [`SharedQueue`](queue::SharedQueue) and an unordered key/value
//! [`SharedMap`](map::SharedMap). Independent OS processes open the same
//! name and operate concurrently; coordination is single-word CAS and
//! 16-byte double-word CAS over a flat array of machine words, with POSIX
//! process-shared semaphores used only for producer/consumer blocking and
//! real-time signals for asynchronous notification.
//!
//! ## Module Organization
//!
//! ### Foundation
//! - [`cc`] - Bit operations and size-class math
//! - [`error`] - Status codes for every public operation
//!
//! ### Core Primitives
//! - [`pr`] - Slot atomics and the double-word compare-exchange
//! - [`mod@backoff`] - Contention backoff for retry loops
//!
//! ### Substrate
//! - [`shm`] - Shared-memory objects and the per-process extent chain
//! - [`sem`] - Embedded process-shared semaphores
//! - [`arena`] - Arena allocator over the slot array
//! - [`list`] - Lock-free linked-list primitive
//!
//! ### Structures
//! - [`hash`] - Seeded Murmur3 for map keys
//! - [`value`] - Typed value segments and timestamps
//! - [`event`] - Queue event stream and signal delivery
//! - [`queue`] - The shared FIFO queue
//! - [`map`] - The shared hash map
//!
//! ## Platform
//!
//! Linux on x86-64 or aarch64 (a 16-byte compare-exchange and POSIX shared
//! memory are required). Handles are `Send + Sync` within a process; after a
//! `fork` the child must re-open the instance.
//!
//! ## Example
//!
//! ```no_run
//! use sharedkit::{Mode, SharedQueue};
//!
//! let q = SharedQueue::create("/jobs", 1024, Mode::ReadWrite)?;
//! q.add(b"first job")?;
//! let item = q.remove()?;
//! assert_eq!(item.value, b"first job");
//! # Ok::<(), sharedkit::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// =============================================================================
// Tier 0: Foundation
// =============================================================================

pub mod cc;

pub mod error;

// =============================================================================
// Tier 1: Core Primitives
// =============================================================================

pub mod pr;

/// Contention backoff for retry loops.
pub mod backoff;

// =============================================================================
// Tier 2: Substrate
// =============================================================================

/// Shared-memory objects and the per-process extent chain.
pub(crate) mod shm;

/// Embedded process-shared semaphores.
pub(crate) mod sem;

/// Arena allocator over the slot array.
pub(crate) mod arena;

/// Lock-free linked-list primitive.
pub(crate) mod list;

// =============================================================================
// Tier 3: Structures
// =============================================================================

pub mod hash;

pub mod value;

pub mod event;

pub mod queue;

pub mod map;

// =============================================================================
// Re-exports for convenience
// =============================================================================

pub use error::Error;
pub use event::Event;
pub use map::{Entry, EntryAttr, SharedMap};
pub use queue::{Item, Mode, SharedQueue};
pub use value::{Segment, Timespec, ValueKind};
