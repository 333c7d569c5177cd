#![warn(missing_docs)]
#![doc = include_str!("../README.md")]
#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

/// Memory capabilities a table can be backed by.
///
/// This module provides the [`Allocator`] trait every table threads its
/// allocations through, and the [`Global`] allocator used by default.
pub mod allocator;

mod error;
mod hash;

/// The chained hash table, its iterator, and its capacity constants.
pub mod hash_table;

mod node;

pub use allocator::Allocator;
pub use allocator::Global;
pub use error::Error;
pub use hash::hashcode;
#[cfg(any(test, feature = "stats"))]
pub use hash_table::DebugStats;
pub use hash_table::HashTable;
pub use hash_table::MIN_CAPACITY;
pub use node::EntryRef;
