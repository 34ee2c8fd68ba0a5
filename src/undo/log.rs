//! # Undo Log Metadata and Control
//!
//! Each undo log is a numbered, append-only byte stream materialized as 1MB
//! segment files. This module defines the log's metadata, the shared control
//! structure guarding it, and the segment file naming scheme.
//!
//! ## Metadata
//!
//! ```text
//! discard          <= insert <= end      (all move forward only)
//! last_xact_start  offset of the owning top transaction's header, or 0
//! prevlen          length of the most recently inserted record
//! ```
//!
//! `discard` only advances when no live snapshot or rollback can need the
//! bytes below it. `insert` advances by exactly the expected size of each
//! record (page headers skipped). Record boundaries never cross `end`; a new
//! segment is created first.
//!
//! ## Locking
//!
//! Metadata fields are guarded by a per-log mutex. The discard pointer has
//! its own shared/exclusive lock: the discard worker takes it exclusively to
//! advance `discard`, while fetches and the transaction-chain update hold it
//! shared across their reads so bytes cannot be recycled underneath them.
//! `last_xact_start` and `prevlen` can be read without the mutex by the
//! attached backend, because only that backend (or the single replayer)
//! writes them.
//!
//! ## Segment Files
//!
//! A segment is named by the log number and the 40-bit offset at which it
//! starts, both in hex:
//!
//! ```text
//! base/undo/000001.0000100000    # log 1, offsets 1MB..2MB
//! ```
//!
//! A segment file is removed once the discard pointer passes its end.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use eyre::{Result, WrapErr};
use parking_lot::{Mutex, RwLock};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::storage::{ForkNumber, RelFileNode};

use super::{
    UndoLogNumber, UndoLogOffset, UndoPersistence, UndoRecPtr, UNDO_LOG_FIRST_OFFSET,
};

pub const UNDO_SEGMENT_SIZE: u64 = 1024 * 1024;
pub const UNDO_SEGMENT_PAGES: u64 = UNDO_SEGMENT_SIZE / crate::storage::PAGE_SIZE as u64;

/// Mutable per-log state, guarded by the control structure's mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UndoLogMeta {
    pub logno: UndoLogNumber,
    pub tsid: u32,
    pub persistence: UndoPersistence,
    pub insert: UndoLogOffset,
    pub discard: UndoLogOffset,
    pub end: UndoLogOffset,
    pub last_xact_start: UndoLogOffset,
    pub prevlen: u16,
}

impl UndoLogMeta {
    pub fn new(logno: UndoLogNumber, tsid: u32, persistence: UndoPersistence) -> Self {
        Self {
            logno,
            tsid,
            persistence,
            insert: UNDO_LOG_FIRST_OFFSET,
            discard: UNDO_LOG_FIRST_OFFSET,
            end: 0,
            last_xact_start: 0,
            prevlen: 0,
        }
    }
}

/// Fixed-layout image of a log's metadata, embedded in WAL records (once per
/// log and checkpoint) and in the checkpoint snapshot file.
#[repr(C)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned,
)]
pub struct UndoLogMetaImage {
    logno: U32,
    tsid: U32,
    persistence: u8,
    reserved1: [u8; 3],
    insert: U64,
    discard: U64,
    end: U64,
    last_xact_start: U64,
    prevlen: U16,
    reserved2: [u8; 6],
}

pub const UNDO_LOG_META_IMAGE_SIZE: usize = 52;
const _: () = assert!(std::mem::size_of::<UndoLogMetaImage>() == UNDO_LOG_META_IMAGE_SIZE);

impl UndoLogMetaImage {
    pub fn from_meta(meta: &UndoLogMeta) -> Self {
        Self {
            logno: U32::new(meta.logno),
            tsid: U32::new(meta.tsid),
            persistence: meta.persistence as u8,
            reserved1: [0; 3],
            insert: U64::new(meta.insert),
            discard: U64::new(meta.discard),
            end: U64::new(meta.end),
            last_xact_start: U64::new(meta.last_xact_start),
            prevlen: U16::new(meta.prevlen),
            reserved2: [0; 6],
        }
    }

    pub fn to_meta(&self) -> UndoLogMeta {
        UndoLogMeta {
            logno: self.logno.get(),
            tsid: self.tsid.get(),
            persistence: UndoPersistence::from_byte(self.persistence),
            insert: self.insert.get(),
            discard: self.discard.get(),
            end: self.end.get(),
            last_xact_start: self.last_xact_start.get(),
            prevlen: self.prevlen.get(),
        }
    }
}

/// Shared control structure for one undo log.
pub struct UndoLogControl {
    pub logno: UndoLogNumber,
    pub tsid: u32,
    pub persistence: UndoPersistence,
    meta: Mutex<UndoLogMeta>,
    /// Shared for readers of not-yet-discarded bytes, exclusive for the
    /// discard worker.
    pub discard_lock: RwLock<()>,
    /// Oldest undo pointer still readable; readers below this get nothing.
    oldest_data: AtomicU64,
    attached: AtomicBool,
    /// Cleared at each checkpoint; the first allocation afterwards embeds a
    /// meta image in its WAL record so recovery sees consistent state.
    meta_logged: AtomicBool,
}

impl UndoLogControl {
    pub fn new(meta: UndoLogMeta) -> Self {
        Self {
            logno: meta.logno,
            tsid: meta.tsid,
            persistence: meta.persistence,
            meta: Mutex::new(meta),
            discard_lock: RwLock::new(()),
            oldest_data: AtomicU64::new(0),
            attached: AtomicBool::new(false),
            meta_logged: AtomicBool::new(false),
        }
    }

    pub fn meta(&self) -> UndoLogMeta {
        *self.meta.lock()
    }

    pub fn update_meta<R>(&self, f: impl FnOnce(&mut UndoLogMeta) -> R) -> R {
        f(&mut self.meta.lock())
    }

    /// Pseudo-relation whose pages hold this log's bytes.
    pub fn rnode(&self) -> RelFileNode {
        RelFileNode::new(self.tsid, self.logno)
    }

    pub fn fork(&self) -> ForkNumber {
        ForkNumber::Undo
    }

    pub fn try_attach(&self) -> bool {
        !self.attached.swap(true, Ordering::AcqRel)
    }

    pub fn detach(&self) {
        self.attached.store(false, Ordering::Release);
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    pub fn oldest_data(&self) -> UndoRecPtr {
        self.oldest_data.load(Ordering::Acquire)
    }

    pub fn set_oldest_data(&self, urp: UndoRecPtr) {
        self.oldest_data.store(urp, Ordering::Release);
    }

    /// Returns true exactly once per checkpoint cycle: the caller must embed
    /// the log's meta image in the WAL record it is building.
    pub fn take_meta_image_due(&self) -> bool {
        !self.meta_logged.swap(true, Ordering::AcqRel)
    }

    pub fn reset_meta_logged(&self) {
        self.meta_logged.store(false, Ordering::Release);
    }
}

/// Name of the segment file covering offsets `[segstart, segstart + 1MB)`.
pub fn undo_segment_file_name(logno: UndoLogNumber, segstart: UndoLogOffset) -> String {
    format!("{:06X}.{:010X}", logno, segstart)
}

/// Directory holding a log's segment files, relative to the database dir.
pub fn undo_segment_dir(base: &Path, tsid: u32) -> PathBuf {
    if tsid == crate::storage::DEFAULT_TABLESPACE_ID {
        base.join("base").join("undo")
    } else {
        base.join("pg_tblspc").join(tsid.to_string()).join("undo")
    }
}

/// Creates (zero-filled) the segment file starting at `segstart`.
pub fn create_undo_segment(
    base: &Path,
    logno: UndoLogNumber,
    tsid: u32,
    segstart: UndoLogOffset,
) -> Result<PathBuf> {
    let dir = undo_segment_dir(base, tsid);
    std::fs::create_dir_all(&dir)
        .wrap_err_with(|| format!("failed to create undo directory {:?}", dir))?;

    let path = dir.join(undo_segment_file_name(logno, segstart));
    let file = std::fs::File::create(&path)
        .wrap_err_with(|| format!("failed to create undo segment {:?}", path))?;
    file.set_len(UNDO_SEGMENT_SIZE)
        .wrap_err_with(|| format!("failed to size undo segment {:?}", path))?;
    file.sync_all()
        .wrap_err_with(|| format!("failed to sync undo segment {:?}", path))?;

    Ok(path)
}

/// Removes segment files wholly below the discard pointer.
pub fn remove_discarded_segments(
    base: &Path,
    logno: UndoLogNumber,
    tsid: u32,
    old_segstart: UndoLogOffset,
    discard: UndoLogOffset,
) -> Result<u32> {
    let dir = undo_segment_dir(base, tsid);
    let mut removed = 0;
    let mut segstart = old_segstart;
    while segstart + UNDO_SEGMENT_SIZE <= discard {
        let path = dir.join(undo_segment_file_name(logno, segstart));
        if path.exists() {
            std::fs::remove_file(&path)
                .wrap_err_with(|| format!("failed to remove undo segment {:?}", path))?;
            removed += 1;
        }
        segstart += UNDO_SEGMENT_SIZE;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn new_meta_starts_at_first_usable_byte() {
        let meta = UndoLogMeta::new(3, 0, UndoPersistence::Permanent);
        assert_eq!(meta.insert, UNDO_LOG_FIRST_OFFSET);
        assert_eq!(meta.discard, UNDO_LOG_FIRST_OFFSET);
        assert_eq!(meta.end, 0);
        assert_eq!(meta.last_xact_start, 0);
        assert_eq!(meta.prevlen, 0);
    }

    #[test]
    fn meta_image_roundtrip() {
        let meta = UndoLogMeta {
            logno: 7,
            tsid: 2,
            persistence: UndoPersistence::Unlogged,
            insert: 0x12345,
            discard: 0x100,
            end: UNDO_SEGMENT_SIZE,
            last_xact_start: 0x5000,
            prevlen: 61,
        };
        let image = UndoLogMetaImage::from_meta(&meta);
        assert_eq!(image.to_meta(), meta);
    }

    #[test]
    fn meta_image_is_fixed_size() {
        assert_eq!(
            std::mem::size_of::<UndoLogMetaImage>(),
            UNDO_LOG_META_IMAGE_SIZE
        );
    }

    #[test]
    fn attach_is_exclusive() {
        let log = UndoLogControl::new(UndoLogMeta::new(1, 0, UndoPersistence::Permanent));
        assert!(log.try_attach());
        assert!(!log.try_attach());
        log.detach();
        assert!(log.try_attach());
    }

    #[test]
    fn meta_image_due_once_per_checkpoint() {
        let log = UndoLogControl::new(UndoLogMeta::new(1, 0, UndoPersistence::Permanent));
        assert!(log.take_meta_image_due());
        assert!(!log.take_meta_image_due());
        log.reset_meta_logged();
        assert!(log.take_meta_image_due());
    }

    #[test]
    fn segment_file_name_format() {
        assert_eq!(undo_segment_file_name(1, 0), "000001.0000000000");
        assert_eq!(
            undo_segment_file_name(0xABC, UNDO_SEGMENT_SIZE),
            "000ABC.0000100000"
        );
    }

    #[test]
    fn segment_dir_layout() {
        let base = Path::new("/db");
        assert_eq!(
            undo_segment_dir(base, 0),
            PathBuf::from("/db/base/undo")
        );
        assert_eq!(
            undo_segment_dir(base, 5),
            PathBuf::from("/db/pg_tblspc/5/undo")
        );
    }

    #[test]
    fn create_and_remove_segments() {
        let dir = tempdir().unwrap();
        let base = dir.path();

        let p0 = create_undo_segment(base, 1, 0, 0).unwrap();
        let p1 = create_undo_segment(base, 1, 0, UNDO_SEGMENT_SIZE).unwrap();
        assert!(p0.exists());
        assert!(p1.exists());
        assert_eq!(std::fs::metadata(&p0).unwrap().len(), UNDO_SEGMENT_SIZE);

        // Discard past the first segment removes exactly that one.
        let removed =
            remove_discarded_segments(base, 1, 0, 0, UNDO_SEGMENT_SIZE + 100).unwrap();
        assert_eq!(removed, 1);
        assert!(!p0.exists());
        assert!(p1.exists());
    }
}
