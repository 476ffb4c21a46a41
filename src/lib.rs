//! # massmap
//!
//! A concurrent, ordered, in-memory key-value index: a trie of
//! B+tree-like layers in the Masstree design.
//!
//! Keys are variable-length byte strings consumed in 8-byte slices.
//! Each slice is resolved by one tree layer; keys sharing a full slice
//! continue into a deeper layer reached through a link entry. Within a
//! layer, interior nodes route on slices and border nodes store the
//! entries, with a packed permutation giving sorted order without
//! moving data.
//!
//! ## Concurrency
//!
//! - **Lookups take no locks.** Readers capture a stable node version,
//!   read optimistically, and revalidate; a racing split is absorbed by
//!   walking the border sibling links forward.
//! - **Writers lock single nodes.** Inserts lock one border node;
//!   splits propagate upward hand-over-hand holding at most three
//!   locks.
//! - **Reclamation is deferred.** Displaced entry payloads are retired
//!   through [`seize`] so readers never observe freed memory.
//!
//! ## Example
//!
//! ```rust
//! use massmap::{MassMap, PutResult};
//!
//! let map: MassMap<String> = MassMap::new();
//!
//! assert_eq!(map.put(b"greeting", "hello".to_string()), PutResult::Inserted);
//! assert_eq!(map.get(b"greeting").as_deref().map(String::as_str), Some("hello"));
//!
//! // First writer wins; the stored value is untouched.
//! assert_eq!(map.put(b"greeting", "late".to_string()), PutResult::AlreadyPresent);
//! ```

pub mod key;
pub mod nodeversion;
pub mod permuter;

mod border;
mod interior;
mod ordering;
mod trace;
mod tree;

pub use tree::{MassMap, PutResult};

/// Keyslice capacity of every node, border and interior alike.
pub const FANOUT: usize = 15;
