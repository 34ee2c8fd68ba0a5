//! # Prepared Undo Insertion
//!
//! Two-phase API for writing undo records. Everything that can fail or do
//! I/O (allocating address space, creating segments, pinning buffers)
//! happens in the *prepare* step, outside any critical section. The *insert*
//! step then only locks the already-pinned buffers, writes bytes, and marks
//! them dirty; it is safe to run between WAL insertion and the data-page
//! mutation.
//!
//! ```text
//! set_prepare_size(n)        (optional, when more than 2 records)
//! prepare(...) -> urp        (repeat per record)
//! ... build WAL record, enter critical section ...
//! insert(...)
//! stamp_lsn(...)
//! ... exit critical section ...
//! unlock_release(...)
//! ```
//!
//! ## Transaction Chaining
//!
//! The first record a top-level transaction writes to a log gets a
//! transaction sub-header whose `next` field starts as a placeholder. When
//! the *following* transaction prepares its own first record, it locates the
//! placeholder inside the previous transaction's first record (scanning
//! forward from `last_xact_start`, skipping sub-headers as the info bits
//! dictate) and schedules an in-place patch. The patch is a buffer handle:
//! the pinned buffer indices plus the byte position of the field, computed
//! here and consumed inside the critical section. Temporary logs skip the
//! chain entirely, since no other session can read their buffers.
//!
//! ## Single Writer
//!
//! Between `prepare` returning a pointer and `insert` completing, no other
//! writer can advance the log's insert pointer past that point: the session
//! is the log's only attached writer (the lone replayer, in recovery).
//!
//! ## Staging Bounds
//!
//! By default staging holds 2 records of up to 2 buffers each, plus 2
//! buffers for the chain patch. Multi-record operations raise the limit with
//! `set_prepare_size`; `unlock_release` shrinks it back.

use std::sync::Arc;

use eyre::{ensure, Result};
use smallvec::SmallVec;

use crate::storage::{
    page_init, BlockNumber, Buffer, BufferPool, BufferTag, LockMode, ReadMode, TransactionId,
    INVALID_TRANSACTION_ID, PAGE_HEADER_SIZE, PAGE_SIZE,
};

use super::record::{
    expected_undo_record_size, insert_undo_record, read_undo_bytes, PackWork, UndoRecord,
    UnpackWork, SIZE_OF_UREC_NEXT, UNDO_RECORD_BLOCK_SIZE, UNDO_RECORD_HEADER_SIZE,
    UNDO_RECORD_RELATION_DETAILS_SIZE, UREC_INFO_BLOCK, UREC_INFO_RELATION_DETAILS,
    UREC_INFO_TRANSACTION, UREC_NEXT_POS,
};
use super::registry::UndoLogRegistry;
use super::{
    is_valid_undo_rec_ptr, make_undo_rec_ptr, offset_block_number, offset_page_byte, urp_log_number,
    urp_offset, UndoLogControl, UndoLogMetaImage, UndoPersistence, UndoRecPtr,
    INVALID_UNDO_REC_PTR, SPECIAL_UNDO_REC_PTR, UNDO_LOG_FIRST_OFFSET, UNDO_PERSISTENCE_LEVELS,
};

/// Maximum records that can be prepared before inserting, by default.
pub const MAX_PREPARED_UNDO: usize = 2;

/// An undo record spans at most this many buffers; tuples are page-bounded.
pub const MAX_BUFFER_PER_UNDO: usize = 2;

/// One extra buffer pair for patching the previous transaction's header.
pub const MAX_UNDO_BUFFERS: usize = (MAX_PREPARED_UNDO + 1) * MAX_BUFFER_PER_UNDO;

#[derive(Debug, Clone, Copy)]
struct UndoBufferSlot {
    blk: BlockNumber,
    buf: Buffer,
}

struct PreparedSpace {
    rec: UndoRecord,
    urp: UndoRecPtr,
    buffer_idx: SmallVec<[usize; MAX_BUFFER_PER_UNDO]>,
}

struct TransChainPatch {
    new_urp: UndoRecPtr,
    prev_urp: UndoRecPtr,
    starting_pos: usize,
    buffer_idx: SmallVec<[usize; MAX_BUFFER_PER_UNDO]>,
}

/// Session staging state for prepared undo insertion. One per backend (and
/// one for the replayer); not shared across threads.
pub struct PreparedUndo {
    prepared: SmallVec<[PreparedSpace; MAX_PREPARED_UNDO]>,
    buffers: SmallVec<[UndoBufferSlot; MAX_UNDO_BUFFERS]>,
    patch: Option<TransChainPatch>,
    max_prepared: usize,
    in_recovery: bool,
    /// Top transaction that last inserted undo, per persistence level.
    prev_txid: [TransactionId; UNDO_PERSISTENCE_LEVELS],
    last_inserted: UndoRecPtr,
}

impl PreparedUndo {
    pub fn new() -> Self {
        Self::with_mode(false)
    }

    pub fn new_for_recovery() -> Self {
        Self::with_mode(true)
    }

    fn with_mode(in_recovery: bool) -> Self {
        Self {
            prepared: SmallVec::new(),
            buffers: SmallVec::new(),
            patch: None,
            max_prepared: MAX_PREPARED_UNDO,
            in_recovery,
            prev_txid: [INVALID_TRANSACTION_ID; UNDO_PERSISTENCE_LEVELS],
            last_inserted: INVALID_UNDO_REC_PTR,
        }
    }

    /// Raises the number of records that may be prepared before inserting.
    pub fn set_prepare_size(&mut self, max_prepare: usize) {
        if max_prepare > MAX_PREPARED_UNDO {
            self.max_prepared = max_prepare;
            self.prepared.reserve(max_prepare);
            self.buffers
                .reserve((max_prepare + 1) * MAX_BUFFER_PER_UNDO);
        }
    }

    /// Forgets which transaction last wrote undo; called when the session
    /// attaches to a different log.
    pub fn on_log_change(&mut self, persistence: UndoPersistence) {
        self.prev_txid[persistence.index()] = INVALID_TRANSACTION_ID;
    }

    /// The most recently inserted record's pointer; the rollback path walks
    /// backwards from here.
    pub fn last_inserted(&self) -> UndoRecPtr {
        self.last_inserted
    }

    pub fn prepared_count(&self) -> usize {
        self.prepared.len()
    }

    fn find_buffer_slot(
        &mut self,
        pool: &mut BufferPool,
        tag: BufferTag,
        mode: ReadMode,
    ) -> Result<usize> {
        for (i, slot) in self.buffers.iter().enumerate() {
            if slot.blk == tag.block && pool.tag(slot.buf) == tag {
                return Ok(i);
            }
        }

        let buf = pool.read_buffer(tag, mode)?;
        self.buffers.push(UndoBufferSlot {
            blk: tag.block,
            buf,
        });
        Ok(self.buffers.len() - 1)
    }

    /// Tells the undo subsystem about a record the caller intends to insert.
    /// On return the necessary undo buffers are pinned and the address space
    /// reserved. Must be called before any critical section, since it can
    /// fail. Returns the record's pointer plus, on the first allocation
    /// after a checkpoint, the log meta image to embed in the WAL record.
    ///
    /// Returns an invalid pointer when the staging limit is reached; the
    /// caller must insert or raise the limit first.
    pub fn prepare(
        &mut self,
        pool: &mut BufferPool,
        registry: &UndoLogRegistry,
        attached: Option<&Arc<UndoLogControl>>,
        mut rec: UndoRecord,
        persistence: UndoPersistence,
        xid: TransactionId,
        xid_epoch: u32,
    ) -> Result<(UndoRecPtr, Option<UndoLogMetaImage>)> {
        if self.prepared.len() == self.max_prepared {
            return Ok((INVALID_UNDO_REC_PTR, None));
        }

        let first_rec = if self.in_recovery {
            registry.is_transaction_first_rec(xid)
        } else {
            self.prev_txid[persistence.index()] != xid
        };
        let mut need_start_undo = first_rec;
        let mut saved_image: Option<UndoLogMetaImage> = None;

        let (urp, size, log) = loop {
            if need_start_undo {
                rec.next = SPECIAL_UNDO_REC_PTR;
                rec.xid_epoch = xid_epoch;
            } else {
                rec.next = INVALID_UNDO_REC_PTR;
            }

            let size = expected_undo_record_size(&mut rec);

            let urp = if self.in_recovery {
                registry.allocate_in_recovery(xid, size, persistence)?
            } else {
                let log = attached.expect("a log must be attached outside recovery");
                let (urp, image) = registry.allocate(log, size)?;
                saved_image = saved_image.or(image);
                urp
            };

            let log = registry
                .get(urp_log_number(urp))
                .expect("allocated from an unregistered log");

            // If rolling back the first subtransaction rewound us to the
            // very start of the transaction, the record needs a transaction
            // header after all; recompute the size.
            let meta = log.meta();
            if !need_start_undo && meta.insert == meta.last_xact_start {
                need_start_undo = true;
                rec.info = 0;
                continue;
            }

            break (urp, size, log);
        };

        if need_start_undo && first_rec {
            let meta = log.meta();
            // Don't patch our own start header.
            if meta.last_xact_start != meta.insert {
                self.prepare_update_trans_info(pool, &log, urp)?;
            }

            self.prev_txid[persistence.index()] = xid;
            log.update_meta(|m| m.last_xact_start = urp_offset(urp));
        }

        registry.advance_insert(&log, urp, size);

        let rnode = log.rnode();
        let fork = log.fork();
        let mut cur_blk = offset_block_number(urp_offset(urp));
        let starting_byte = offset_page_byte(urp_offset(urp));

        // Writing the very first byte of a page means nothing useful can
        // follow on it; skip reading the old contents.
        let mut rbm = if starting_byte == PAGE_HEADER_SIZE {
            ReadMode::Zero
        } else {
            ReadMode::Normal
        };

        let mut buffer_idx: SmallVec<[usize; MAX_BUFFER_PER_UNDO]> = SmallVec::new();
        let mut cur_size = 0usize;
        loop {
            let bufidx =
                self.find_buffer_slot(pool, BufferTag::new(rnode, fork, cur_blk), rbm)?;

            if cur_size == 0 {
                cur_size = PAGE_SIZE - starting_byte;
            } else {
                cur_size += PAGE_SIZE - PAGE_HEADER_SIZE;
            }

            ensure!(
                buffer_idx.len() < MAX_BUFFER_PER_UNDO,
                "undo record of {} bytes spans more than {} buffers",
                size,
                MAX_BUFFER_PER_UNDO
            );
            buffer_idx.push(bufidx);

            cur_blk += 1;
            // Any further pages are brand new.
            rbm = ReadMode::Zero;

            if cur_size >= size {
                break;
            }
        }

        self.prepared.push(PreparedSpace {
            rec,
            urp,
            buffer_idx,
        });

        Ok((urp, saved_image))
    }

    /// Locates the `next` field inside the previous transaction's first
    /// record and schedules an in-place patch pointing it at `new_urp`.
    /// Silently skips when the record is already discarded.
    fn prepare_update_trans_info(
        &mut self,
        pool: &mut BufferPool,
        log: &Arc<UndoLogControl>,
        new_urp: UndoRecPtr,
    ) -> Result<()> {
        // The chain is not built for temporary logs: another backend may
        // have used this log and its buffers are not accessible to us.
        if log.persistence == UndoPersistence::Temp {
            return Ok(());
        }

        let last_xact_start = log.meta().last_xact_start;
        if last_xact_start == 0 {
            return Ok(());
        }
        let prev_urp = make_undo_rec_ptr(log.logno, last_xact_start);
        if !is_valid_undo_rec_ptr(prev_urp) {
            return Ok(());
        }

        let _guard = log.discard_lock.read();
        if prev_urp < log.oldest_data() {
            return Ok(());
        }

        let rnode = log.rnode();
        let fork = log.fork();
        let mut cur_blk = offset_block_number(last_xact_start);
        let mut starting_byte = offset_page_byte(last_xact_start);

        let mut work = UnpackWork::new();
        let mut already_decoded = 0usize;
        let mut my_read;

        'scan: loop {
            if already_decoded != 0 {
                starting_byte = PAGE_HEADER_SIZE;
                cur_blk += 1;
            }
            my_read = already_decoded;

            let tag = BufferTag::new(rnode, fork, cur_blk);
            let buffer = pool.read_buffer(tag, ReadMode::Normal)?;
            pool.lock_buffer(buffer, LockMode::Exclusive);
            let mut cursor = starting_byte;

            {
                let page = pool.page(buffer);
                let mut hdr = [0u8; UNDO_RECORD_HEADER_SIZE];
                if !read_undo_bytes(
                    &mut hdr,
                    UNDO_RECORD_HEADER_SIZE,
                    page,
                    &mut cursor,
                    &mut my_read,
                    &mut already_decoded,
                    false,
                ) {
                    pool.unlock_release(buffer);
                    continue 'scan;
                }
                work.hdr = hdr;

                let info = work.hdr_info();

                if info & UREC_INFO_RELATION_DETAILS != 0 {
                    let mut skip = [0u8; UNDO_RECORD_RELATION_DETAILS_SIZE];
                    if !read_undo_bytes(
                        &mut skip,
                        UNDO_RECORD_RELATION_DETAILS_SIZE,
                        page,
                        &mut cursor,
                        &mut my_read,
                        &mut already_decoded,
                        true,
                    ) {
                        pool.unlock_release(buffer);
                        continue 'scan;
                    }
                }

                if info & UREC_INFO_BLOCK != 0 {
                    let mut skip = [0u8; UNDO_RECORD_BLOCK_SIZE];
                    if !read_undo_bytes(
                        &mut skip,
                        UNDO_RECORD_BLOCK_SIZE,
                        page,
                        &mut cursor,
                        &mut my_read,
                        &mut already_decoded,
                        true,
                    ) {
                        pool.unlock_release(buffer);
                        continue 'scan;
                    }
                }

                // A transaction's first record always carries the header.
                ensure!(
                    info & UREC_INFO_TRANSACTION != 0,
                    "transaction chain target at {:#x} has no transaction header",
                    prev_urp
                );
            }

            if cursor == PAGE_SIZE {
                pool.unlock_release(buffer);
                continue 'scan;
            }
            cursor += UREC_NEXT_POS;
            if cursor >= PAGE_SIZE {
                let from_start = cursor - PAGE_SIZE;
                starting_byte = PAGE_HEADER_SIZE + from_start;
                pool.unlock_release(buffer);
                cur_blk += 1;
                cursor = starting_byte;
            } else {
                pool.unlock_release(buffer);
            }

            let bufidx =
                self.find_buffer_slot(pool, BufferTag::new(rnode, fork, cur_blk), ReadMode::Normal)?;

            let mut patch = TransChainPatch {
                new_urp,
                prev_urp,
                starting_pos: cursor,
                buffer_idx: SmallVec::new(),
            };
            patch.buffer_idx.push(bufidx);

            if PAGE_SIZE - cursor < SIZE_OF_UREC_NEXT {
                let bufidx = self.find_buffer_slot(
                    pool,
                    BufferTag::new(rnode, fork, cur_blk + 1),
                    ReadMode::Normal,
                )?;
                patch.buffer_idx.push(bufidx);
            }

            self.patch = Some(patch);
            break;
        }

        Ok(())
    }

    /// Writes `new_urp` over the previous transaction header's `next` field
    /// through the buffers recorded by the prepare step.
    fn update_trans_info(
        &mut self,
        pool: &mut BufferPool,
        registry: &UndoLogRegistry,
        patch: &TransChainPatch,
    ) -> Result<()> {
        let log = registry
            .get(urp_log_number(patch.new_urp))
            .expect("patch target log unregistered");

        let _guard = log.discard_lock.read();
        if patch.prev_urp < log.oldest_data() {
            return Ok(());
        }

        let src = patch.new_urp.to_le_bytes();
        let mut starting_byte = patch.starting_pos;
        let mut my_written = 0usize;
        let mut total_written = 0usize;

        for &bufidx in &patch.buffer_idx {
            let buffer = self.buffers[bufidx].buf;
            let mut cursor = starting_byte;
            let done = insert_undo_bytes_into(
                pool.page_mut(buffer),
                &src,
                &mut cursor,
                &mut my_written,
                &mut total_written,
            );
            pool.mark_dirty(buffer);
            if done {
                debug_assert_eq!(total_written, SIZE_OF_UREC_NEXT);
                return Ok(());
            }
            my_written = total_written;
            starting_byte = PAGE_HEADER_SIZE;
        }

        unreachable!("transaction chain patch ran out of buffers");
    }

    /// Inserts every prepared record. Locks the buffers pinned during
    /// prepare (in pin order), computes each record's `prevlen` from the
    /// log, serialises the bytes, and marks the buffers dirty. Call inside
    /// the critical section; for persistent undo this never fails.
    pub fn insert(&mut self, pool: &mut BufferPool, registry: &UndoLogRegistry) -> Result<()> {
        ensure!(self.prepared.len() > 0, "no prepared undo to insert");

        for slot in &self.buffers {
            pool.lock_buffer(slot.buf, LockMode::Exclusive);
        }

        let patch = self.patch.take();
        let mut patch_applied = false;

        for idx in 0..self.prepared.len() {
            let urp = self.prepared[idx].urp;
            let offset = urp_offset(urp);
            let mut starting_byte = offset_page_byte(offset);

            let log = registry
                .get(urp_log_number(urp))
                .expect("prepared record on unregistered log");

            // Reading prevlen without the mutex is fine: only we write it.
            let prev_undolen = log.meta().prevlen;

            {
                let rec = &mut self.prepared[idx].rec;
                rec.prevlen = prev_undolen;
                if offset == UNDO_LOG_FIRST_OFFSET {
                    // Starting a new log: there is no previous record.
                    rec.prevlen = 0;
                } else if starting_byte == PAGE_HEADER_SIZE {
                    // Starting at a page boundary: the gap back to the
                    // previous record includes the page header.
                    rec.prevlen += PAGE_HEADER_SIZE as u16;
                }
            }

            let mut undo_len = 0usize;
            let mut already_written = 0usize;
            let mut work = PackWork::new();
            let mut bufseq = 0usize;

            loop {
                let buffer = self.buffers[self.prepared[idx].buffer_idx[bufseq]].buf;
                let page = pool.page_mut(buffer);

                // Writing at the first usable byte means this page is fresh.
                if starting_byte == PAGE_HEADER_SIZE {
                    page_init(page, 0)?;
                }

                let done = insert_undo_record(
                    &self.prepared[idx].rec,
                    page,
                    starting_byte,
                    &mut already_written,
                    &mut work,
                );
                pool.mark_dirty(buffer);

                if done {
                    undo_len += already_written;
                    break;
                }

                starting_byte = PAGE_HEADER_SIZE;
                bufseq += 1;
                // Crossing into the next page adds its header to the
                // distance back to this record's start.
                undo_len += PAGE_HEADER_SIZE;
                debug_assert!(bufseq < self.prepared[idx].buffer_idx.len());
            }

            log.update_meta(|m| m.prevlen = undo_len as u16);

            if let Some(patch) = patch.as_ref() {
                if !patch_applied {
                    self.update_trans_info(pool, registry, patch)?;
                    patch_applied = true;
                }
            }

            self.last_inserted = urp;
        }

        Ok(())
    }

    /// Stamps every staged undo buffer with the WAL record's position. Both
    /// the foreground path and replay call this with the same LSN, keeping
    /// undo pages byte-identical across a crash.
    pub fn stamp_lsn(&self, pool: &mut BufferPool, lsn: u64) {
        for slot in &self.buffers {
            pool.set_page_lsn(slot.buf, lsn);
        }
    }

    /// Unlocks and unpins everything and resets the staging arrays back to
    /// their default size. Call after exiting the critical section.
    pub fn unlock_release(&mut self, pool: &mut BufferPool) {
        for slot in &self.buffers {
            pool.unlock_release(slot.buf);
        }
        self.buffers.clear();
        self.prepared.clear();
        self.patch = None;

        if self.max_prepared > MAX_PREPARED_UNDO {
            self.max_prepared = MAX_PREPARED_UNDO;
            self.buffers.shrink_to_fit();
            self.prepared.shrink_to_fit();
        }
    }
}

impl Default for PreparedUndo {
    fn default() -> Self {
        Self::new()
    }
}

/// Page-slice variant of the codec's partial byte writer, used for the
/// transaction chain patch.
fn insert_undo_bytes_into(
    page: &mut [u8],
    src: &[u8],
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

    page[*cursor..*cursor + can_write]
        .copy_from_slice(&src[*my_written..*my_written + can_write]);
    *cursor += can_write;
    *total_written += can_write;
    *my_written = 0;

    can_write == remaining
}
