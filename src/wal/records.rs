//! # WAL Record Headers
//!
//! Fixed-layout headers carried in the main data of heap WAL records. Every
//! undo-aware operation leads with `XlUndoHeader`, which binds the record to
//! the undo space it consumed:
//!
//! ```text
//! +---------------+----------------+------------------------+
//! | XlUndoHeader  | op header      | op extras (tpd slot,   |
//! | (24 bytes)    | (XlInsert,...) | ranges, old tuple, ...)|
//! +---------------+----------------+------------------------+
//! ```
//!
//! `urec_ptr` inside the undo header is the pointer the foreground path got
//! from its prepare step. Replay re-runs the same prepare and requires the
//! two to be equal; a mismatch means the undo space diverged and recovery
//! cannot be trusted.
//!
//! All headers are `zerocopy` unaligned little-endian structs so they can
//! be read in place from the record buffer.

use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const XLOG_OPMASK: u8 = 0x0F;
/// The record reinitializes its target page from scratch.
pub const XLOG_INIT_PAGE: u8 = 0x80;

pub const XLOG_HEAP_INSERT: u8 = 0x00;
pub const XLOG_HEAP_DELETE: u8 = 0x01;
pub const XLOG_HEAP_UPDATE: u8 = 0x02;
pub const XLOG_HEAP_MULTI_INSERT: u8 = 0x03;
pub const XLOG_HEAP_LOCK: u8 = 0x04;
pub const XLOG_HEAP_CLEAN: u8 = 0x05;
pub const XLOG_HEAP_UNUSED: u8 = 0x06;
pub const XLOG_HEAP_CONFIRM: u8 = 0x07;
pub const XLOG_HEAP_FREEZE_SLOT: u8 = 0x08;
pub const XLOG_HEAP_INVALIDATE_SLOT: u8 = 0x09;

/// Binds a WAL record to the undo space its operation consumed.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct XlUndoHeader {
    pub relfilenode: U32,
    pub tsid: U32,
    pub blkprev: U64,
    pub urec_ptr: U64,
}

pub const SIZE_OF_UNDO_HEADER: usize = 24;
const _: () = assert!(std::mem::size_of::<XlUndoHeader>() == SIZE_OF_UNDO_HEADER);

impl XlUndoHeader {
    pub fn new(relfilenode: u32, tsid: u32, blkprev: u64, urec_ptr: u64) -> Self {
        Self {
            relfilenode: U32::new(relfilenode),
            tsid: U32::new(tsid),
            blkprev: U64::new(blkprev),
            urec_ptr: U64::new(urec_ptr),
        }
    }

    pub fn relfilenode(&self) -> u32 {
        self.relfilenode.get()
    }

    pub fn tsid(&self) -> u32 {
        self.tsid.get()
    }

    pub fn blkprev(&self) -> u64 {
        self.blkprev.get()
    }

    pub fn urec_ptr(&self) -> u64 {
        self.urec_ptr.get()
    }
}

pub const XLZ_INSERT_ALL_VISIBLE_CLEARED: u8 = 0x01;
pub const XLZ_INSERT_IS_SPECULATIVE: u8 = 0x02;
pub const XLZ_INSERT_CONTAINS_TPD_SLOT: u8 = 0x04;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct XlHeapInsert {
    pub offnum: U16,
    pub flags: u8,
}

pub const SIZE_OF_HEAP_INSERT: usize = 3;
const _: () = assert!(std::mem::size_of::<XlHeapInsert>() == SIZE_OF_HEAP_INSERT);

pub const XLZ_DELETE_ALL_VISIBLE_CLEARED: u8 = 0x01;
pub const XLZ_HAS_DELETE_UNDOTUPLE: u8 = 0x02;
pub const XLZ_DELETE_CONTAINS_TPD_SLOT: u8 = 0x04;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct XlHeapDelete {
    pub offnum: U16,
    pub prev_xid: U32,
    pub infomask: U16,
    pub trans_slot_id: u8,
    pub flags: u8,
}

pub const SIZE_OF_HEAP_DELETE: usize = 10;
const _: () = assert!(std::mem::size_of::<XlHeapDelete>() == SIZE_OF_HEAP_DELETE);

pub const XLZ_UPDATE_OLD_ALL_VISIBLE_CLEARED: u8 = 0x01;
pub const XLZ_UPDATE_NEW_ALL_VISIBLE_CLEARED: u8 = 0x02;
pub const XLZ_NON_INPLACE_UPDATE: u8 = 0x04;
pub const XLZ_HAS_UPDATE_UNDOTUPLE: u8 = 0x08;
pub const XLZ_UPDATE_PREFIX_FROM_OLD: u8 = 0x10;
pub const XLZ_UPDATE_SUFFIX_FROM_OLD: u8 = 0x20;
pub const XLZ_UPDATE_OLD_CONTAINS_TPD_SLOT: u8 = 0x40;
pub const XLZ_UPDATE_NEW_CONTAINS_TPD_SLOT: u8 = 0x80;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct XlHeapUpdate {
    pub old_offnum: U16,
    pub new_offnum: U16,
    pub prev_xid: U32,
    pub old_infomask: U16,
    pub old_trans_slot_id: u8,
    pub flags: u8,
}

pub const SIZE_OF_HEAP_UPDATE: usize = 12;
const _: () = assert!(std::mem::size_of::<XlHeapUpdate>() == SIZE_OF_HEAP_UPDATE);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct XlHeapMultiInsert {
    pub ntuples: U16,
    pub flags: u8,
}

pub const SIZE_OF_HEAP_MULTI_INSERT: usize = 3;
const _: () = assert!(std::mem::size_of::<XlHeapMultiInsert>() == SIZE_OF_HEAP_MULTI_INSERT);

pub const XLZ_LOCK_TRANS_SLOT_FOR_UREC: u8 = 0x01;
pub const XLZ_LOCK_CONTAINS_TPD_SLOT: u8 = 0x02;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct XlHeapLock {
    pub offnum: U16,
    pub prev_xid: U32,
    pub infomask: U16,
    pub trans_slot_id: u8,
    pub flags: u8,
}

pub const SIZE_OF_HEAP_LOCK: usize = 10;
const _: () = assert!(std::mem::size_of::<XlHeapLock>() == SIZE_OF_HEAP_LOCK);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct XlHeapClean {
    pub latest_removed_xid: U32,
    pub ndeleted: U16,
    pub ndead: U16,
}

pub const SIZE_OF_HEAP_CLEAN: usize = 8;
const _: () = assert!(std::mem::size_of::<XlHeapClean>() == SIZE_OF_HEAP_CLEAN);

pub const XLZ_UNUSED_CONTAINS_TPD_SLOT: u8 = 0x01;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct XlHeapUnused {
    pub latest_removed_xid: U32,
    pub nunused: U16,
    pub trans_slot_id: u8,
    pub flags: u8,
}

pub const SIZE_OF_HEAP_UNUSED: usize = 8;
const _: () = assert!(std::mem::size_of::<XlHeapUnused>() == SIZE_OF_HEAP_UNUSED);

pub const XLZ_SPEC_INSERT_SUCCESS: u8 = 0x00;
pub const XLZ_SPEC_INSERT_FAILED: u8 = 0x01;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct XlHeapConfirm {
    pub offnum: U16,
    pub flags: u8,
}

pub const SIZE_OF_HEAP_CONFIRM: usize = 3;
const _: () = assert!(std::mem::size_of::<XlHeapConfirm>() == SIZE_OF_HEAP_CONFIRM);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct XlHeapFreezeSlots {
    pub latest_frozen_xid: U32,
    pub nfrozen: U16,
}

pub const SIZE_OF_HEAP_FREEZE_SLOTS: usize = 6;
const _: () = assert!(std::mem::size_of::<XlHeapFreezeSlots>() == SIZE_OF_HEAP_FREEZE_SLOTS);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct XlHeapInvalidateSlots {
    pub nslots: U16,
}

pub const SIZE_OF_HEAP_INVALIDATE_SLOTS: usize = 2;
const _: () =
    assert!(std::mem::size_of::<XlHeapInvalidateSlots>() == SIZE_OF_HEAP_INVALIDATE_SLOTS);

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes;

    #[test]
    fn undo_header_roundtrip() {
        let hdr = XlUndoHeader::new(12, 0, 0x18, 0x1_0000_0018);
        let bytes = hdr.as_bytes();
        assert_eq!(bytes.len(), SIZE_OF_UNDO_HEADER);

        let parsed = XlUndoHeader::read_from_bytes(bytes).unwrap();
        assert_eq!(parsed.relfilenode(), 12);
        assert_eq!(parsed.blkprev(), 0x18);
        assert_eq!(parsed.urec_ptr(), 0x1_0000_0018);
    }

    #[test]
    fn opcodes_fit_in_opmask() {
        for op in [
            XLOG_HEAP_INSERT,
            XLOG_HEAP_DELETE,
            XLOG_HEAP_UPDATE,
            XLOG_HEAP_MULTI_INSERT,
            XLOG_HEAP_LOCK,
            XLOG_HEAP_CLEAN,
            XLOG_HEAP_UNUSED,
            XLOG_HEAP_CONFIRM,
            XLOG_HEAP_FREEZE_SLOT,
            XLOG_HEAP_INVALIDATE_SLOT,
        ] {
            assert_eq!(op & XLOG_OPMASK, op);
        }
        assert_eq!(XLOG_INIT_PAGE & XLOG_OPMASK, 0);
    }

    #[test]
    fn header_sizes_are_packed() {
        assert_eq!(std::mem::size_of::<XlHeapInsert>(), 3);
        assert_eq!(std::mem::size_of::<XlHeapDelete>(), 10);
        assert_eq!(std::mem::size_of::<XlHeapUpdate>(), 12);
        assert_eq!(std::mem::size_of::<XlHeapLock>(), 10);
    }
}
