//! # Undo Record Codec
//!
//! This module defines the unpacked undo record and the codec that writes it
//! into page-oriented undo storage, splitting across page boundaries when
//! needed.
//!
//! ## Record Framing
//!
//! A record is a fixed header followed by optional sub-headers in a strict
//! order, selected by bits in the `info` byte:
//!
//! ```text
//! +--------------------+  always              20 bytes
//! | header             |  type, info, prevlen, relfilenode,
//! |                    |  prev_xid, xid, cid
//! +--------------------+  UREC_INFO_RELATION_DETAILS   5 bytes
//! | relation details   |  tsid, fork
//! +--------------------+  UREC_INFO_BLOCK             14 bytes
//! | block              |  blkprev, block, offset
//! +--------------------+  UREC_INFO_TRANSACTION       12 bytes
//! | transaction        |  next, xid_epoch
//! +--------------------+  UREC_INFO_PAYLOAD            4 bytes
//! | payload lengths    |  payload_len, tuple_len
//! +--------------------+
//! | payload bytes      |  variable
//! +--------------------+
//! | tuple bytes        |  variable
//! +--------------------+
//! ```
//!
//! All integers are little-endian. The `info` byte is derived from which
//! optional fields are populated: a non-default tablespace or fork selects
//! relation details, a valid block number selects the block sub-header, a
//! valid `next` pointer selects the transaction sub-header, and a non-empty
//! payload or tuple selects the payload sub-header.
//!
//! ## Page Splitting
//!
//! Records may span pages. The writer is called once per page with the byte
//! at which to begin and a running count of bytes already emitted; it stops
//! when the page ends and the caller resumes on the next page at the first
//! byte past the page header. On the first call the codec copies all scalar
//! fields into a fixed-size workspace so that continuation calls see a
//! stable, pre-converted image; continuation calls assert that the caller
//! passed the same record again.
//!
//! The reader mirrors this: lengths become known as soon as the payload
//! sub-header has been decoded, at which point owned buffers are sized and
//! filled incrementally.

use eyre::{bail, Result};

use crate::storage::{
    BlockNumber, CommandId, ForkNumber, OffsetNumber, TransactionId, DEFAULT_TABLESPACE_ID,
    INVALID_BLOCK_NUMBER, PAGE_SIZE,
};

use super::{UndoRecPtr, INVALID_UNDO_REC_PTR};

pub const UREC_INFO_RELATION_DETAILS: u8 = 0x01;
pub const UREC_INFO_BLOCK: u8 = 0x02;
pub const UREC_INFO_TRANSACTION: u8 = 0x04;
pub const UREC_INFO_PAYLOAD: u8 = 0x08;

pub const UNDO_RECORD_HEADER_SIZE: usize = 20;
pub const UNDO_RECORD_RELATION_DETAILS_SIZE: usize = 5;
pub const UNDO_RECORD_BLOCK_SIZE: usize = 14;
pub const UNDO_RECORD_TRANSACTION_SIZE: usize = 12;
pub const UNDO_RECORD_PAYLOAD_SIZE: usize = 4;

/// Byte offset of the `next` pointer inside the transaction sub-header.
pub const UREC_NEXT_POS: usize = 0;
pub const SIZE_OF_UREC_NEXT: usize = 8;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UndoRecordType {
    #[default]
    Insert = 0,
    Delete = 1,
    InplaceUpdate = 2,
    Update = 3,
    MultiInsert = 4,
    XidLockOnly = 5,
    XidMultiLockOnly = 6,
    ItemIdUnused = 7,
}

impl UndoRecordType {
    pub fn from_byte(b: u8) -> Result<Self> {
        Ok(match b {
            0 => UndoRecordType::Insert,
            1 => UndoRecordType::Delete,
            2 => UndoRecordType::InplaceUpdate,
            3 => UndoRecordType::Update,
            4 => UndoRecordType::MultiInsert,
            5 => UndoRecordType::XidLockOnly,
            6 => UndoRecordType::XidMultiLockOnly,
            7 => UndoRecordType::ItemIdUnused,
            _ => bail!("invalid undo record type: {:#04x}", b),
        })
    }
}

/// The in-memory form of an undo record, produced and consumed by callers.
/// Once staged and inserted it lives only as bytes until fetched again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoRecord {
    pub rec_type: UndoRecordType,
    pub info: u8,
    pub prevlen: u16,
    pub relfilenode: u32,
    pub prev_xid: TransactionId,
    pub xid: TransactionId,
    pub cid: CommandId,
    pub tsid: u32,
    pub fork: ForkNumber,
    pub blkprev: UndoRecPtr,
    pub block: BlockNumber,
    pub offset: OffsetNumber,
    pub next: UndoRecPtr,
    pub xid_epoch: u32,
    pub payload: Vec<u8>,
    pub tuple: Vec<u8>,
}

impl Default for UndoRecord {
    fn default() -> Self {
        Self {
            rec_type: UndoRecordType::Insert,
            info: 0,
            prevlen: 0,
            relfilenode: 0,
            prev_xid: 0,
            xid: 0,
            cid: 0,
            tsid: DEFAULT_TABLESPACE_ID,
            fork: ForkNumber::Main,
            blkprev: INVALID_UNDO_REC_PTR,
            block: INVALID_BLOCK_NUMBER,
            offset: 0,
            next: INVALID_UNDO_REC_PTR,
            xid_epoch: 0,
            payload: Vec::new(),
            tuple: Vec::new(),
        }
    }
}

impl UndoRecord {
    /// Derives `info` bits from which optional fields are populated.
    pub fn set_info(&mut self) {
        if self.tsid != DEFAULT_TABLESPACE_ID || self.fork != ForkNumber::Main {
            self.info |= UREC_INFO_RELATION_DETAILS;
        }
        if self.block != INVALID_BLOCK_NUMBER {
            self.info |= UREC_INFO_BLOCK;
        }
        if self.next != INVALID_UNDO_REC_PTR {
            self.info |= UREC_INFO_TRANSACTION;
        }
        if !self.payload.is_empty() || !self.tuple.is_empty() {
            self.info |= UREC_INFO_PAYLOAD;
        }
    }
}

/// Computes the on-page size of a record, deriving its `info` bits first.
pub fn expected_undo_record_size(rec: &mut UndoRecord) -> usize {
    rec.set_info();

    let mut size = UNDO_RECORD_HEADER_SIZE;
    if rec.info & UREC_INFO_RELATION_DETAILS != 0 {
        size += UNDO_RECORD_RELATION_DETAILS_SIZE;
    }
    if rec.info & UREC_INFO_BLOCK != 0 {
        size += UNDO_RECORD_BLOCK_SIZE;
    }
    if rec.info & UREC_INFO_TRANSACTION != 0 {
        size += UNDO_RECORD_TRANSACTION_SIZE;
    }
    if rec.info & UREC_INFO_PAYLOAD != 0 {
        size += UNDO_RECORD_PAYLOAD_SIZE;
        size += rec.payload.len();
        size += rec.tuple.len();
    }
    size
}

/// Fixed-size workspace holding the little-endian images of a record's
/// sub-headers across the page-split calls of one serialization.
#[derive(Debug, Default)]
pub struct PackWork {
    hdr: [u8; UNDO_RECORD_HEADER_SIZE],
    rd: [u8; UNDO_RECORD_RELATION_DETAILS_SIZE],
    blk: [u8; UNDO_RECORD_BLOCK_SIZE],
    txn: [u8; UNDO_RECORD_TRANSACTION_SIZE],
    pay: [u8; UNDO_RECORD_PAYLOAD_SIZE],
}

impl PackWork {
    pub fn new() -> Self {
        Self::default()
    }

    fn fill_from(&mut self, rec: &UndoRecord) {
        self.hdr[0] = rec.rec_type as u8;
        self.hdr[1] = rec.info;
        self.hdr[2..4].copy_from_slice(&rec.prevlen.to_le_bytes());
        self.hdr[4..8].copy_from_slice(&rec.relfilenode.to_le_bytes());
        self.hdr[8..12].copy_from_slice(&rec.prev_xid.to_le_bytes());
        self.hdr[12..16].copy_from_slice(&rec.xid.to_le_bytes());
        self.hdr[16..20].copy_from_slice(&rec.cid.to_le_bytes());

        self.rd[0..4].copy_from_slice(&rec.tsid.to_le_bytes());
        self.rd[4] = rec.fork as u8;

        self.blk[0..8].copy_from_slice(&rec.blkprev.to_le_bytes());
        self.blk[8..12].copy_from_slice(&rec.block.to_le_bytes());
        self.blk[12..14].copy_from_slice(&rec.offset.to_le_bytes());

        self.txn[0..8].copy_from_slice(&rec.next.to_le_bytes());
        self.txn[8..12].copy_from_slice(&rec.xid_epoch.to_le_bytes());

        self.pay[0..2].copy_from_slice(&(rec.payload.len() as u16).to_le_bytes());
        self.pay[2..4].copy_from_slice(&(rec.tuple.len() as u16).to_le_bytes());
    }
}

/// Writes source bytes to the page, but only those not written on earlier
/// pages and only as many as fit.
///
/// `my_written` counts previously-written bytes from this and following
/// structures of the record; bytes belonging to earlier structures have
/// already been subtracted out. `total_written` counts all bytes of the
/// record written so far. Returns false when the page filled up first.
fn insert_undo_bytes(
    src: &[u8],
    page: &mut [u8],
    cursor: &mut usize,
    my_written: &mut usize,
    total_written: &mut usize,
) -> bool {
    if *my_written >= src.len() {
        *my_written -= src.len();
        return true;
    }

    let remaining = src.len() - *my_written;
    let can_write = remaining.min(page.len() - *cursor);
    if can_write == 0 {
        return false;
    }

    page[*cursor..*cursor + can_write].copy_from_slice(&src[*my_written..*my_written + can_write]);

    *cursor += can_write;
    *total_written += can_write;
    *my_written = 0;

    can_write == remaining
}

/// Reads bytes into `dest`, resuming at the position recorded by earlier
/// partial reads. With `nocopy` the bytes are skipped but fully accounted.
pub(crate) fn read_undo_bytes(
    dest: &mut [u8],
    readlen: usize,
    page: &[u8],
    cursor: &mut usize,
    my_read: &mut usize,
    total_read: &mut usize,
    nocopy: bool,
) -> bool {
    if *my_read >= readlen {
        *my_read -= readlen;
        return true;
    }

    let remaining = readlen - *my_read;
    let can_read = remaining.min(page.len() - *cursor);
    if can_read == 0 {
        return false;
    }

    if !nocopy {
        dest[*my_read..*my_read + can_read].copy_from_slice(&page[*cursor..*cursor + can_read]);
    }

    *cursor += can_read;
    *total_read += can_read;
    *my_read = 0;

    can_read == remaining
}

/// Writes as much of `rec` as fits on `page` starting at `starting_byte`.
///
/// `already_written` is the number of bytes emitted to earlier pages of the
/// same record; the function updates it. Returns true once the whole record
/// has been written. The same record and workspace must be passed on every
/// continuation call.
pub fn insert_undo_record(
    rec: &UndoRecord,
    page: &mut [u8],
    starting_byte: usize,
    already_written: &mut usize,
    work: &mut PackWork,
) -> bool {
    debug_assert_eq!(page.len(), PAGE_SIZE);

    let mut cursor = starting_byte;
    let mut my_written = *already_written;

    if *already_written == 0 {
        work.fill_from(rec);
    } else {
        // The caller must pass the same record on continuation calls.
        #[cfg(debug_assertions)]
        {
            let mut check = PackWork::new();
            check.fill_from(rec);
            debug_assert_eq!(check.hdr, work.hdr, "record changed between pack calls");
            debug_assert_eq!(check.pay, work.pay, "record changed between pack calls");
        }
    }

    if !insert_undo_bytes(&work.hdr, page, &mut cursor, &mut my_written, already_written) {
        return false;
    }

    if rec.info & UREC_INFO_RELATION_DETAILS != 0
        && !insert_undo_bytes(&work.rd, page, &mut cursor, &mut my_written, already_written)
    {
        return false;
    }

    if rec.info & UREC_INFO_BLOCK != 0
        && !insert_undo_bytes(&work.blk, page, &mut cursor, &mut my_written, already_written)
    {
        return false;
    }

    if rec.info & UREC_INFO_TRANSACTION != 0
        && !insert_undo_bytes(&work.txn, page, &mut cursor, &mut my_written, already_written)
    {
        return false;
    }

    if rec.info & UREC_INFO_PAYLOAD != 0 {
        if !insert_undo_bytes(&work.pay, page, &mut cursor, &mut my_written, already_written) {
            return false;
        }

        if !rec.payload.is_empty()
            && !insert_undo_bytes(
                &rec.payload,
                page,
                &mut cursor,
                &mut my_written,
                already_written,
            )
        {
            return false;
        }

        if !rec.tuple.is_empty()
            && !insert_undo_bytes(
                &rec.tuple,
                page,
                &mut cursor,
                &mut my_written,
                already_written,
            )
        {
            return false;
        }
    }

    true
}

/// Fixed-size workspace for the page-split calls of one deserialization.
#[derive(Debug, Default)]
pub struct UnpackWork {
    pub(crate) hdr: [u8; UNDO_RECORD_HEADER_SIZE],
    pub(crate) rd: [u8; UNDO_RECORD_RELATION_DETAILS_SIZE],
    pub(crate) blk: [u8; UNDO_RECORD_BLOCK_SIZE],
    pub(crate) txn: [u8; UNDO_RECORD_TRANSACTION_SIZE],
    pub(crate) pay: [u8; UNDO_RECORD_PAYLOAD_SIZE],
}

impl UnpackWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn hdr_info(&self) -> u8 {
        self.hdr[1]
    }
}

/// Decodes a record from `page` starting at `starting_byte`, resuming a
/// record split across pages when `already_decoded` is non-zero. Returns
/// true once the record is complete; the caller re-invokes with the next
/// page and `starting_byte` set to the first byte past the page header.
pub fn unpack_undo_record(
    rec: &mut UndoRecord,
    page: &[u8],
    starting_byte: usize,
    already_decoded: &mut usize,
    work: &mut UnpackWork,
) -> Result<bool> {
    debug_assert_eq!(page.len(), PAGE_SIZE);

    let mut cursor = starting_byte;
    let mut my_read = *already_decoded;
    let was_split = *already_decoded > 0;

    if !read_undo_bytes(
        &mut work.hdr,
        UNDO_RECORD_HEADER_SIZE,
        page,
        &mut cursor,
        &mut my_read,
        already_decoded,
        false,
    ) {
        return Ok(false);
    }

    rec.rec_type = UndoRecordType::from_byte(work.hdr[0])?;
    rec.info = work.hdr[1];
    rec.prevlen = u16::from_le_bytes(work.hdr[2..4].try_into().unwrap()); // INVARIANT: fixed-size workspace
    rec.relfilenode = u32::from_le_bytes(work.hdr[4..8].try_into().unwrap());
    rec.prev_xid = u32::from_le_bytes(work.hdr[8..12].try_into().unwrap());
    rec.xid = u32::from_le_bytes(work.hdr[12..16].try_into().unwrap());
    rec.cid = u32::from_le_bytes(work.hdr[16..20].try_into().unwrap());

    if rec.info & UREC_INFO_RELATION_DETAILS != 0 {
        if !read_undo_bytes(
            &mut work.rd,
            UNDO_RECORD_RELATION_DETAILS_SIZE,
            page,
            &mut cursor,
            &mut my_read,
            already_decoded,
            false,
        ) {
            return Ok(false);
        }
        rec.tsid = u32::from_le_bytes(work.rd[0..4].try_into().unwrap());
        rec.fork = ForkNumber::from_byte(work.rd[4]);
    }

    if rec.info & UREC_INFO_BLOCK != 0 {
        if !read_undo_bytes(
            &mut work.blk,
            UNDO_RECORD_BLOCK_SIZE,
            page,
            &mut cursor,
            &mut my_read,
            already_decoded,
            false,
        ) {
            return Ok(false);
        }
        rec.blkprev = u64::from_le_bytes(work.blk[0..8].try_into().unwrap());
        rec.block = u32::from_le_bytes(work.blk[8..12].try_into().unwrap());
        rec.offset = u16::from_le_bytes(work.blk[12..14].try_into().unwrap());
    }

    if rec.info & UREC_INFO_TRANSACTION != 0 {
        if !read_undo_bytes(
            &mut work.txn,
            UNDO_RECORD_TRANSACTION_SIZE,
            page,
            &mut cursor,
            &mut my_read,
            already_decoded,
            false,
        ) {
            return Ok(false);
        }
        rec.next = u64::from_le_bytes(work.txn[0..8].try_into().unwrap());
        rec.xid_epoch = u32::from_le_bytes(work.txn[8..12].try_into().unwrap());
    }

    if rec.info & UREC_INFO_PAYLOAD != 0 {
        if !read_undo_bytes(
            &mut work.pay,
            UNDO_RECORD_PAYLOAD_SIZE,
            page,
            &mut cursor,
            &mut my_read,
            already_decoded,
            false,
        ) {
            return Ok(false);
        }

        let payload_len = u16::from_le_bytes(work.pay[0..2].try_into().unwrap()) as usize;
        let tuple_len = u16::from_le_bytes(work.pay[2..4].try_into().unwrap()) as usize;

        if rec.payload.len() != payload_len {
            rec.payload = vec![0u8; payload_len];
        }
        if rec.tuple.len() != tuple_len {
            rec.tuple = vec![0u8; tuple_len];
        }

        if !was_split && payload_len + tuple_len <= page.len() - cursor {
            rec.payload.copy_from_slice(&page[cursor..cursor + payload_len]);
            cursor += payload_len;
            rec.tuple.copy_from_slice(&page[cursor..cursor + tuple_len]);
            *already_decoded += payload_len + tuple_len;
        } else {
            let mut payload = std::mem::take(&mut rec.payload);
            let done = read_undo_bytes(
                &mut payload,
                payload_len,
                page,
                &mut cursor,
                &mut my_read,
                already_decoded,
                false,
            );
            rec.payload = payload;
            if !done {
                return Ok(false);
            }

            let mut tuple = std::mem::take(&mut rec.tuple);
            let done = read_undo_bytes(
                &mut tuple,
                tuple_len,
                page,
                &mut cursor,
                &mut my_read,
                already_decoded,
                false,
            );
            rec.tuple = tuple;
            if !done {
                return Ok(false);
            }
        }
    }

    Ok(true)
}
