//! # avlfile - Embedded Multi-Key Record Store
//!
//! avlfile keeps a collection of fixed-length records in a single file,
//! ordered under any number of host-defined keys at once. Each key is a
//! threaded AVL tree; all trees share one slot arena, so a record is
//! inserted, found and deleted under every ordering without ever being
//! copied. The file is the whole database: iteration state, free slots and
//! per-opener cursors all live inside it, and cooperative byte-range locks
//! make it safe to share between processes.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::cmp::Ordering;
//! use avlfile::AvlFile;
//!
//! // 16-byte records: a native-endian u32 id, then a 12-byte name.
//! fn cmp(key: usize, a: &[u8], b: &[u8]) -> Ordering {
//!     match key {
//!         0 => a[..4].cmp(&b[..4]),
//!         _ => a[4..].cmp(&b[4..]),
//!     }
//! }
//!
//! let db = AvlFile::open("users.avl", 16, 2, cmp)?;
//! db.insert(&record)?;
//!
//! let mut buf = probe.clone();
//! let mut found = db.startge(&mut buf, 0)?;
//! while found {
//!     // ... use buf ...
//!     found = db.next(&mut buf, 0)?;
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │        Public API (AvlFile)         │
//! ├──────────────┬──────────────────────┤
//! │ Cursor       │  Threaded AVL trees  │
//! │ registry     │  (one per key)       │
//! ├──────────────┴──────────────────────┤
//! │  Sequential / free / cursor lists   │
//! ├─────────────────────────────────────┤
//! │  Slot arena (header + fixed slots)  │
//! ├─────────────────────────────────────┤
//! │  Positional file I/O + fcntl locks  │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! ```text
//! offset 0:  header    magic, geometry, live count, number counter,
//! │                    tree roots, list heads
//! ├─ slot 0             ┐
//! ├─ slot 1             │ fixed-size slots: live records, per-opener
//! ├─ ...                │ cursors, and free slots, interspersed
//! └─ slot n             ┘
//! ```
//!
//! Every slot carries one AVL node per key (balance plus threaded child
//! links), the sequential-list links, and the payload. Ordered iteration
//! follows the threads; unordered iteration follows the sequential list;
//! deleted slots chain on the free list until reuse or compaction.
//!
//! ## Concurrency
//!
//! Every operation runs under an exclusive advisory lock on byte 0 of the
//! file, so operations are atomic and totally ordered across processes. A
//! second advisory lock on byte 1 is exposed as [`AvlFile::lock`] /
//! [`AvlFile::unlock`] for multi-call transactions. Threads sharing one
//! handle are serialised by an in-process mutex. Each opener also holds a
//! byte-range lock over its own cursor slot for as long as it is open;
//! cursor slots whose owner died are detected that way and recycled.
//!
//! ## Durability
//!
//! Writes go straight to the file with no journal: a crash in the middle
//! of a mutation can corrupt the store, by design. Detected corruption
//! (a pointer past end-of-file, an impossible balance factor, a scan
//! mismatch) aborts the process after recording a diagnostic retrievable
//! with [`last_error`].

mod arena;
mod cmp;
mod cursor;
mod emsg;
mod layout;
mod slot;
mod squash;
mod store;
mod tree;

pub use cmp::KeyComparator;
pub use emsg::last_error;
pub use store::{AvlFile, ScanReport};
