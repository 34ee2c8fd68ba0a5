//! # Undine - MVCC Storage Engine Core
//!
//! Undine implements the core of an MVCC storage engine that keeps row
//! versions in-place in data pages and rollback/version information in
//! separate, append-only **undo logs** addressed by a 64-bit pointer. Two
//! tightly coupled subsystems form the core:
//!
//! - **Undo log subsystem**: allocates, buffers, formats and recycles undo
//!   records; maintains per-log discard/insert pointers and a chain of
//!   transaction headers linking consecutive top-level transactions.
//! - **Undo-aware redo**: deterministically reconstructs both data pages and
//!   undo pages from a write-ahead log stream, reproducing during replay the
//!   exact undo record pointers that the foreground path produced.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │       Heap Operations (insert/delete/...)    │
//! ├──────────────────────┬───────────────────────┤
//! │  Prepared-Undo       │   WAL Record Model    │
//! │  Staging             │   + Redo Dispatcher   │
//! ├──────────────────────┼───────────────────────┤
//! │  Undo Log Registry   │   Heap Pages + TPD    │
//! │  + Allocator + Fetch │   + Prune             │
//! ├──────────────────────┴───────────────────────┤
//! │    Buffer Pool / Pages / FSM / Visibility    │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Undo Addressing
//!
//! Every undo record is addressed by a `UndoRecPtr`: the top 24 bits name an
//! undo log, the low 40 bits are a byte offset within that log. The offset
//! space is page-oriented and includes page headers; consumers skip the
//! headers when walking record bytes. Logs grow in 1MB segment files and are
//! reclaimed from the front by advancing a discard pointer.
//!
//! ## Write Protocol
//!
//! A modification prepares one or more undo records (pinning buffers and
//! reserving undo address space outside any critical section), emits a WAL
//! record carrying both the data-page delta and the undo location, then
//! inside the critical section writes the undo bytes and mutates the page.
//! On replay the dispatcher rebuilds the same undo records, reserves
//! identical address space, and checks that the computed undo pointer equals
//! the one embedded in the WAL record.
//!
//! ## File Layout
//!
//! ```text
//! database_dir/
//! ├── base/undo/             # Permanent undo segments (default tablespace)
//! │   └── 000001.0000000000  # 1MB segment: log number . starting offset
//! ├── pg_tblspc/<tsid>/undo/ # Per-tablespace undo segments
//! └── pg_undo/               # Checkpoint snapshots of the log registry
//!     └── 000000000000002A
//! ```
//!
//! ## Module Overview
//!
//! - [`storage`]: pages, buffer pool, free-space and visibility maps
//! - [`undo`]: undo record codec, log registry/allocator, staging, fetch
//! - [`heap`]: heap page layout, transaction slots, TPD overflow, operations
//! - [`wal`]: WAL record model, opcodes, redo dispatcher and handlers

pub mod heap;
pub mod storage;
pub mod undo;
pub mod wal;

pub use storage::{BufferPool, FreeSpaceMap, VisibilityMap, PAGE_SIZE};
pub use undo::{UndoPersistence, UndoRecPtr, UndoRecord, UndoRecordType};
