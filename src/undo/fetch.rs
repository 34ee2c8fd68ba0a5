//! # Undo Fetch
//!
//! Walks a tuple's undo chain. Starting from some record pointer, each
//! record is read and handed to a caller-supplied visibility callback; when
//! the callback declines, the walk follows the record's `blkprev` link to
//! the previous record that touched the same block.
//!
//! ## Termination
//!
//! The walk stops when:
//! - the callback accepts a record (it is returned together with its
//!   pointer),
//! - the pointer falls below the log's discard horizon (nothing to return),
//! - the caller passed an invalid block number, meaning it wants the first
//!   record unconditionally, or
//! - the chain ends.
//!
//! ## Buffer Reuse
//!
//! To amortize I/O the fetcher keeps the current buffer pinned across hops
//! as long as the next pointer stays on the same block of the same log;
//! otherwise the pin is dropped and the next block is read. Records split
//! across pages are assembled into owned buffers.
//!
//! ## Discard Safety
//!
//! The per-log discard lock is held shared across the record read, so the
//! discard worker cannot recycle the bytes mid-read. A pointer below
//! `oldest_data` simply yields no record; the caller treats the version as
//! all-visible or rolled back, which is exactly what discard guarantees.

use eyre::Result;

use crate::storage::{
    BlockNumber, Buffer, BufferPool, BufferTag, LockMode, OffsetNumber, ReadMode, TransactionId,
    INVALID_BLOCK_NUMBER, PAGE_HEADER_SIZE,
};

use super::record::{unpack_undo_record, UndoRecord, UnpackWork};
use super::registry::UndoLogRegistry;
use super::{
    is_valid_undo_rec_ptr, make_undo_rec_ptr, offset_block_number, offset_page_byte, urp_log_number,
    urp_offset, UndoRecPtr,
};

/// Pointer to the record immediately before `urp` in the same log, given
/// the later record's stored `prevlen`.
pub fn prev_record_ptr(urp: UndoRecPtr, prevlen: u16) -> UndoRecPtr {
    make_undo_rec_ptr(urp_log_number(urp), urp_offset(urp) - prevlen as u64)
}

/// Reads the record at `urp`, continuing onto following pages when it is
/// split. `keep` carries a pinned buffer between calls; it stays pinned
/// only when the whole record came from that single buffer.
fn undo_get_one_record(
    rec: &mut UndoRecord,
    pool: &mut BufferPool,
    tag_template: BufferTag,
    starting_byte: usize,
    keep: &mut Option<Buffer>,
) -> Result<()> {
    let mut cur_blk = tag_template.block;
    let mut starting_byte = starting_byte;
    let mut already_decoded = 0usize;
    let mut work = UnpackWork::new();
    let mut is_split = false;

    let mut buffer = match *keep {
        Some(buf) => buf,
        None => pool.read_buffer(
            BufferTag::new(tag_template.rnode, tag_template.fork, cur_blk),
            ReadMode::Normal,
        )?,
    };
    *keep = Some(buffer);

    loop {
        pool.lock_buffer(buffer, LockMode::Shared);
        let done = {
            let page = pool.page(buffer);
            unpack_undo_record(rec, page, starting_byte, &mut already_decoded, &mut work)?
        };
        if done {
            break;
        }

        starting_byte = PAGE_HEADER_SIZE;
        is_split = true;

        // The record continues on the next block; this buffer is done.
        pool.unlock_release(buffer);
        *keep = None;

        cur_blk += 1;
        buffer = pool.read_buffer(
            BufferTag::new(tag_template.rnode, tag_template.fork, cur_blk),
            ReadMode::Normal,
        )?;
    }

    if is_split {
        pool.unlock_release(buffer);
        *keep = None;
    } else {
        pool.unlock_buffer(buffer);
        *keep = Some(buffer);
    }

    Ok(())
}

/// Fetches the first record in the chain starting at `urp` that satisfies
/// `callback`, following `blkprev` links. Matching on xid as well as block
/// and offset lets callers skip records written by transactions that later
/// reused the same slot. Returns the record and its pointer, or `None` when
/// the chain is discarded or exhausted.
pub fn fetch_undo_record(
    pool: &mut BufferPool,
    registry: &UndoLogRegistry,
    mut urp: UndoRecPtr,
    block: BlockNumber,
    offset: OffsetNumber,
    xid: TransactionId,
    mut callback: impl FnMut(&UndoRecord, BlockNumber, OffsetNumber, TransactionId) -> bool,
) -> Result<Option<(UndoRecord, UndoRecPtr)>> {
    let mut rec = UndoRecord::default();
    let mut keep: Option<Buffer> = None;
    let mut prev_logno = None;

    loop {
        if !is_valid_undo_rec_ptr(urp) {
            if let Some(buf) = keep {
                pool.release(buf);
            }
            return Ok(None);
        }

        let logno = urp_log_number(urp);
        let Some(log) = registry.get(logno) else {
            if let Some(buf) = keep {
                pool.release(buf);
            }
            return Ok(None);
        };

        // Reuse the pinned buffer only when the next record lives on the
        // same block of the same log.
        if let Some(buf) = keep {
            if offset_block_number(urp_offset(urp)) != pool.block_number(buf)
                || prev_logno != Some(logno)
            {
                pool.release(buf);
                keep = None;
            }
        }
        prev_logno = Some(logno);

        // Reset the reusable record before decoding into it; a record
        // without a payload must not inherit the previous hop's bytes.
        rec.payload.clear();
        rec.tuple.clear();

        // Hold off the discard worker while reading.
        let guard = log.discard_lock.read();
        if urp < log.oldest_data() {
            drop(guard);
            if let Some(buf) = keep {
                pool.release(buf);
            }
            return Ok(None);
        }

        let tag = BufferTag::new(
            log.rnode(),
            log.fork(),
            offset_block_number(urp_offset(urp)),
        );
        let starting_byte = offset_page_byte(urp_offset(urp));
        undo_get_one_record(&mut rec, pool, tag, starting_byte, &mut keep)?;
        drop(guard);

        if block == INVALID_BLOCK_NUMBER {
            break;
        }

        if callback(&rec, block, offset, xid) {
            break;
        }

        urp = rec.blkprev;
    }

    if let Some(buf) = keep {
        pool.release(buf);
    }
    Ok(Some((rec, urp)))
}
