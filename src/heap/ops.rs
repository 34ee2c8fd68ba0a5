//! # Heap Write Path
//!
//! The foreground half of every heap operation. Each op follows the same
//! protocol:
//!
//! 1. pin and lock the data buffer (and the TPD buffer, if the transaction
//!    holds an overflow slot)
//! 2. build the undo record(s), reading `blkprev` from the page's slot
//! 3. prepare the undo insertion (reserves address space, pins undo
//!    buffers; may fail, so it happens before the critical section)
//! 4. emit the WAL record carrying both the page delta and the undo
//!    pointer (plus the log's meta image when one is due)
//! 5. inside the critical section: insert the prepared undo, mutate the
//!    page, stamp the record's LSN on the data and undo buffers
//! 6. release everything; update the free-space map when the page fell
//!    below a fifth of its size
//!
//! The page mutations here are the same primitive sequences the redo
//! handlers run, which is what makes replay reproduce pages byte for byte.

use std::sync::Arc;

use eyre::{ensure, Result};

use crate::storage::{
    BlockNumber, Buffer, BufferPool, BufferTag, ForkNumber, FreeSpaceMap, LockMode, OffsetNumber,
    PageHeader, ReadMode, RelFileNode, TransactionId, VisibilityMap, FIRST_COMMAND_ID,
    PAGE_SIZE,
};
use crate::undo::{
    PreparedUndo, UndoLogControl, UndoLogRegistry, UndoPersistence, UndoRecPtr, UndoRecord,
    UndoRecordType,
};
use crate::wal::records::*;
use crate::wal::{WalBlockRef, WalRecord, WalStream};
use zerocopy::IntoBytes;

use super::page::{
    heap_page_init, item_id, max_offset_number, page_add_item, page_free_space, page_get_item,
    page_replace_item, page_set_undo, set_item_id, trans_slot as page_trans_slot,
    PAGE_TRANS_SLOTS,
};
use super::prune::prune_execute;
use super::tpd::{tpd_page_set_undo, tpd_slot};
use super::{
    compose_tuple, TupleHeader, FROZEN_SLOT, TUPLE_DELETED, TUPLE_INVALID_XACT_SLOT,
    TUPLE_MULTI_LOCKERS, TUPLE_SPECULATIVE_INSERT, TUPLE_UPDATED, TUPLE_XID_LOCK_ONLY,
};

/// Free-space threshold below which operations report the page to the FSM.
pub const FSM_THRESHOLD: usize = PAGE_SIZE / 5;

/// Per-backend write context: one attached undo log, one staging area.
pub struct HeapSession<'a> {
    pub pool: &'a mut BufferPool,
    pub registry: &'a UndoLogRegistry,
    pub staging: &'a mut PreparedUndo,
    pub wal: &'a mut WalStream,
    pub fsm: &'a mut FreeSpaceMap,
    pub vm: &'a mut VisibilityMap,
    pub log: Arc<UndoLogControl>,
    pub xid: TransactionId,
    pub xid_epoch: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InsertOptions {
    pub init_page: bool,
    pub speculative: bool,
    pub tpd_block: Option<BlockNumber>,
}

/// Stamps FROZEN_SLOT on (or the invalid-slot bit into) every tuple whose
/// slot is being frozen or invalidated. Shared by the write path and redo.
pub fn freeze_or_invalidate_tuples(page: &mut [u8], slots: &[u8], freeze: bool) -> Result<()> {
    for offnum in 1..=max_offset_number(page) {
        let item = item_id(page, offnum)?;
        if !item.is_normal() {
            continue;
        }
        let off = item.off as usize;
        let mut hdr = TupleHeader::from_bytes(&page[off..]);
        if !slots.contains(&hdr.trans_slot) {
            continue;
        }
        if freeze {
            hdr.trans_slot = FROZEN_SLOT;
        } else {
            hdr.infomask |= TUPLE_INVALID_XACT_SLOT;
        }
        hdr.write_to(&mut page[off..]);
    }
    Ok(())
}

/// Reads the slot's current undo pointer from the page or its TPD page.
fn slot_urec_ptr(
    pool: &BufferPool,
    data_buf: Buffer,
    tpd_buf: Option<Buffer>,
    slot: u8,
) -> Result<UndoRecPtr> {
    if slot < PAGE_TRANS_SLOTS {
        Ok(page_trans_slot(pool.page(data_buf), slot)?.urec_ptr)
    } else {
        let tpd_buf = tpd_buf.expect("overflow slot requires a TPD buffer");
        Ok(tpd_slot(pool.page(tpd_buf), slot)?.urec_ptr)
    }
}

/// Stamps `(epoch, xid, urp)` into the slot, on the page or its TPD page.
fn set_slot_undo(
    pool: &mut BufferPool,
    data_buf: Buffer,
    tpd_buf: Option<Buffer>,
    slot: u8,
    xid_epoch: u32,
    xid: TransactionId,
    urp: UndoRecPtr,
    lsn: u64,
) -> Result<()> {
    if slot < PAGE_TRANS_SLOTS {
        page_set_undo(pool.page_mut(data_buf), slot, xid_epoch, xid, urp)?;
    } else {
        let buf = tpd_buf.expect("overflow slot requires a TPD buffer");
        tpd_page_set_undo(pool.page_mut(buf), slot, xid_epoch, xid, urp)?;
        pool.set_page_lsn(buf, lsn);
        pool.mark_dirty(buf);
    }
    Ok(())
}

impl<'a> HeapSession<'a> {
    fn read_locked(&mut self, rnode: RelFileNode, block: BlockNumber) -> Result<Buffer> {
        let buf = self
            .pool
            .read_buffer(BufferTag::new(rnode, ForkNumber::Main, block), ReadMode::Normal)?;
        self.pool.lock_buffer(buf, LockMode::Exclusive);
        Ok(buf)
    }

    fn read_tpd(&mut self, rnode: RelFileNode, block: Option<BlockNumber>) -> Result<Option<Buffer>> {
        match block {
            None => Ok(None),
            Some(block) => {
                let buf = self
                    .pool
                    .read_buffer(BufferTag::new(rnode, ForkNumber::Main, block), ReadMode::Normal)?;
                self.pool.lock_buffer(buf, LockMode::Exclusive);
                Ok(Some(buf))
            }
        }
    }

    /// Clears the all-visible state for the block if set; returns whether
    /// the WAL record must carry the cleared flag.
    fn clear_all_visible(&mut self, rnode: RelFileNode, block: BlockNumber) -> bool {
        if self.vm.is_all_visible(rnode, block) {
            self.vm.clear_all_visible(rnode, block);
            true
        } else {
            false
        }
    }

    fn base_undo_record(
        &self,
        rec_type: UndoRecordType,
        rnode: RelFileNode,
        prev_xid: TransactionId,
        blkprev: UndoRecPtr,
        block: BlockNumber,
        offset: OffsetNumber,
    ) -> UndoRecord {
        UndoRecord {
            rec_type,
            relfilenode: rnode.relnode,
            tsid: rnode.tsid,
            prev_xid,
            xid: self.xid,
            cid: FIRST_COMMAND_ID,
            blkprev,
            block,
            offset,
            ..Default::default()
        }
    }

    fn new_record(&self, info: u8) -> WalRecord {
        let mut record = WalRecord::new(info, self.xid);
        record.xid_epoch = self.xid_epoch;
        record
    }

    fn finish(&mut self, record: &mut WalRecord, buffers: &[Buffer], with_undo: bool) -> Result<u64> {
        let lsn = self.wal.append(record);
        if with_undo {
            self.staging.insert(self.pool, self.registry)?;
        }
        for &buf in buffers {
            self.pool.set_page_lsn(buf, lsn);
            self.pool.mark_dirty(buf);
        }
        Ok(lsn)
    }

    fn release(&mut self, buffers: &[Buffer], with_undo: bool) {
        if with_undo {
            self.staging.unlock_release(self.pool);
        }
        for &buf in buffers {
            self.pool.unlock_release(buf);
        }
    }

    fn maybe_record_free_space(&mut self, rnode: RelFileNode, block: BlockNumber, buf: Buffer) {
        let freespace = page_free_space(self.pool.page(buf));
        if freespace < FSM_THRESHOLD {
            self.fsm.record_page_free_space(rnode, block, freespace);
        }
    }

    /// Inserts one tuple, returning its offset and the undo pointer.
    pub fn insert(
        &mut self,
        rnode: RelFileNode,
        block: BlockNumber,
        body: &[u8],
        offnum: OffsetNumber,
        trans_slot: u8,
        opts: InsertOptions,
    ) -> Result<(OffsetNumber, UndoRecPtr)> {
        let buf = self.read_locked(rnode, block)?;
        if opts.init_page {
            heap_page_init(self.pool.page_mut(buf))?;
        }
        let tpd_buf = self.read_tpd(rnode, opts.tpd_block)?;

        let maxoff = max_offset_number(self.pool.page(buf));
        let offnum = if offnum == 0 { maxoff + 1 } else { offnum };

        let blkprev = slot_urec_ptr(self.pool, buf, tpd_buf, trans_slot)?;
        let mut undorecord = self.base_undo_record(
            UndoRecordType::Insert,
            rnode,
            self.xid,
            blkprev,
            block,
            offnum,
        );
        // A speculative token rides in the payload so the record's size (and
        // hence the undo pointer) is identical whether or not replay cares.
        if opts.speculative {
            undorecord.payload = 1u32.to_le_bytes().to_vec();
        }

        let (urp, meta) = self.staging.prepare(
            self.pool,
            self.registry,
            Some(&self.log),
            undorecord,
            UndoPersistence::Permanent,
            self.xid,
            self.xid_epoch,
        )?;

        let mut flags = 0u8;
        if self.clear_all_visible(rnode, block) {
            flags |= XLZ_INSERT_ALL_VISIBLE_CLEARED;
        }
        if opts.speculative {
            flags |= XLZ_INSERT_IS_SPECULATIVE;
        }

        let mut info = XLOG_HEAP_INSERT;
        if opts.init_page {
            info |= XLOG_INIT_PAGE;
        }
        let mut record = self.new_record(info);
        record.undo_meta = meta;
        record
            .main_data
            .extend_from_slice(XlUndoHeader::new(rnode.relnode, rnode.tsid, blkprev, urp).as_bytes());
        let mut hdr = TupleHeader::new(trans_slot);
        if opts.speculative {
            hdr.infomask |= TUPLE_SPECULATIVE_INSERT;
        }
        let tuple = compose_tuple(hdr, body);

        if opts.tpd_block.is_some() {
            flags |= XLZ_INSERT_CONTAINS_TPD_SLOT;
        }
        record.main_data.extend_from_slice(
            XlHeapInsert {
                offnum: offnum.into(),
                flags,
            }
            .as_bytes(),
        );
        if opts.tpd_block.is_some() {
            record
                .main_data
                .extend_from_slice(&(trans_slot as u32).to_le_bytes());
        }
        record.add_block(
            WalBlockRef::new(rnode, ForkNumber::Main, block).with_data(tuple.clone()),
        );
        if let Some(tpd_block) = opts.tpd_block {
            record.add_block(WalBlockRef::new(rnode, ForkNumber::Main, tpd_block));
        }

        let lsn = self.finish(&mut record, &[buf], true)?;
        page_add_item(self.pool.page_mut(buf), &tuple, offnum, true)?;
        set_slot_undo(
            self.pool,
            buf,
            tpd_buf,
            trans_slot,
            self.xid_epoch,
            self.xid,
            urp,
            lsn,
        )?;
        if flags & XLZ_INSERT_ALL_VISIBLE_CLEARED != 0 {
            PageHeader::from_bytes_mut(self.pool.page_mut(buf))?.clear_all_visible();
        }
        self.staging.stamp_lsn(self.pool, lsn);

        let mut bufs = vec![buf];
        bufs.extend(tpd_buf);
        self.release(&bufs, true);
        Ok((offnum, urp))
    }

    /// Deletes the tuple at `offnum`. The undo record carries the full old
    /// tuple image so rollback (and lagging snapshots) can restore it.
    pub fn delete(
        &mut self,
        rnode: RelFileNode,
        block: BlockNumber,
        offnum: OffsetNumber,
        trans_slot: u8,
        tpd_block: Option<BlockNumber>,
    ) -> Result<UndoRecPtr> {
        let buf = self.read_locked(rnode, block)?;
        let tpd_buf = self.read_tpd(rnode, tpd_block)?;

        let (old_tuple, prev_xid) = {
            let page = self.pool.page(buf);
            let item = item_id(page, offnum)?;
            ensure!(item.is_normal(), "cannot delete item {} at {:?}", offnum, rnode);
            let bytes = page_get_item(page, &item).to_vec();
            let hdr = TupleHeader::from_bytes(&bytes);
            let prev_xid = if hdr.trans_slot < PAGE_TRANS_SLOTS {
                page_trans_slot(page, hdr.trans_slot)?.xid
            } else {
                self.xid
            };
            (bytes, prev_xid)
        };

        let blkprev = slot_urec_ptr(self.pool, buf, tpd_buf, trans_slot)?;
        let mut undorecord = self.base_undo_record(
            UndoRecordType::Delete,
            rnode,
            prev_xid,
            blkprev,
            block,
            offnum,
        );
        undorecord.tuple = old_tuple.clone();
        if tpd_block.is_some() {
            undorecord.payload = (trans_slot as u32).to_le_bytes().to_vec();
        }

        let (urp, meta) = self.staging.prepare(
            self.pool,
            self.registry,
            Some(&self.log),
            undorecord,
            UndoPersistence::Permanent,
            self.xid,
            self.xid_epoch,
        )?;

        let mut new_hdr = TupleHeader::from_bytes(&old_tuple);
        new_hdr.set_vis_status(TUPLE_DELETED);
        new_hdr.trans_slot = trans_slot;

        let mut flags = XLZ_HAS_DELETE_UNDOTUPLE;
        if self.clear_all_visible(rnode, block) {
            flags |= XLZ_DELETE_ALL_VISIBLE_CLEARED;
        }
        if tpd_block.is_some() {
            flags |= XLZ_DELETE_CONTAINS_TPD_SLOT;
        }

        let mut record = self.new_record(XLOG_HEAP_DELETE);
        record.undo_meta = meta;
        record
            .main_data
            .extend_from_slice(XlUndoHeader::new(rnode.relnode, rnode.tsid, blkprev, urp).as_bytes());
        record.main_data.extend_from_slice(
            XlHeapDelete {
                offnum: offnum.into(),
                prev_xid: prev_xid.into(),
                infomask: new_hdr.infomask.into(),
                trans_slot_id: trans_slot,
                flags,
            }
            .as_bytes(),
        );
        if tpd_block.is_some() {
            record
                .main_data
                .extend_from_slice(&(trans_slot as u32).to_le_bytes());
        }
        record.main_data.extend_from_slice(&old_tuple);
        record.add_block(WalBlockRef::new(rnode, ForkNumber::Main, block));
        if let Some(tpd_block) = tpd_block {
            record.add_block(WalBlockRef::new(rnode, ForkNumber::Main, tpd_block));
        }

        let lsn = self.finish(&mut record, &[buf], true)?;
        {
            let page = self.pool.page_mut(buf);
            let item = item_id(page, offnum)?;
            let off = item.off as usize;
            new_hdr.write_to(&mut page[off..]);
            PageHeader::from_bytes_mut(page)?.set_prunable(self.xid);
            if flags & XLZ_DELETE_ALL_VISIBLE_CLEARED != 0 {
                PageHeader::from_bytes_mut(page)?.clear_all_visible();
            }
        }
        set_slot_undo(
            self.pool,
            buf,
            tpd_buf,
            trans_slot,
            self.xid_epoch,
            self.xid,
            urp,
            lsn,
        )?;
        self.staging.stamp_lsn(self.pool, lsn);

        let mut bufs = vec![buf];
        bufs.extend(tpd_buf);
        self.release(&bufs, true);
        Ok(urp)
    }

    /// Updates the tuple at `(old_block, old_offnum)`. In-place when the new
    /// version targets the same item; otherwise the old tuple is marked
    /// updated and the new version inserted at `(new_block, new_offnum)`,
    /// producing an update and an insert undo record.
    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &mut self,
        rnode: RelFileNode,
        old_block: BlockNumber,
        old_offnum: OffsetNumber,
        new_block: BlockNumber,
        new_offnum: OffsetNumber,
        new_body: &[u8],
        trans_slot: u8,
        inplace: bool,
    ) -> Result<(OffsetNumber, UndoRecPtr)> {
        ensure!(
            !inplace || new_block == old_block,
            "in-place updates never cross pages"
        );
        // No TPD reference travels with an update record.
        ensure!(
            trans_slot < PAGE_TRANS_SLOTS,
            "update requires an inline transaction slot, got overflow slot {}",
            trans_slot
        );

        let old_buf = self.read_locked(rnode, old_block)?;
        let new_buf = if new_block == old_block {
            old_buf
        } else {
            self.read_locked(rnode, new_block)?
        };

        let (old_tuple, prev_xid) = {
            let page = self.pool.page(old_buf);
            let item = item_id(page, old_offnum)?;
            ensure!(item.is_normal(), "cannot update item {}", old_offnum);
            let bytes = page_get_item(page, &item).to_vec();
            let hdr = TupleHeader::from_bytes(&bytes);
            let prev_xid = if hdr.trans_slot < PAGE_TRANS_SLOTS {
                page_trans_slot(page, hdr.trans_slot)?.xid
            } else {
                self.xid
            };
            (bytes, prev_xid)
        };

        let old_hdr = TupleHeader::from_bytes(&old_tuple);
        let mut new_hdr = TupleHeader::new(trans_slot);
        new_hdr.hoff = old_hdr.hoff;
        if inplace {
            // The surviving tuple must still point readers at the chain.
            new_hdr.infomask |= super::TUPLE_INPLACE_UPDATED;
        }
        let new_tuple = compose_tuple(new_hdr, new_body);

        // Prefix/suffix compression against the old tuple, same page only.
        let old_body = &old_tuple[old_hdr.hoff as usize..];
        let (prefixlen, suffixlen) = if new_block == old_block {
            common_prefix_suffix(old_body, new_body)
        } else {
            (0, 0)
        };
        let mid_body = &new_body[prefixlen..new_body.len() - suffixlen];

        let blkprev = slot_urec_ptr(self.pool, old_buf, None, trans_slot)?;
        let mut undorecord = self.base_undo_record(
            if inplace {
                UndoRecordType::InplaceUpdate
            } else {
                UndoRecordType::Update
            },
            rnode,
            prev_xid,
            blkprev,
            old_block,
            old_offnum,
        );
        undorecord.tuple = old_tuple.clone();
        if !inplace {
            // The new version's location, so rollback can find and kill it.
            let mut payload = Vec::with_capacity(6);
            payload.extend_from_slice(&new_block.to_le_bytes());
            payload.extend_from_slice(&new_offnum.to_le_bytes());
            undorecord.payload = payload;
        }

        let (urp, meta) = self.staging.prepare(
            self.pool,
            self.registry,
            Some(&self.log),
            undorecord,
            UndoPersistence::Permanent,
            self.xid,
            self.xid_epoch,
        )?;

        let (new_urp, new_blkprev) = if inplace {
            (urp, 0)
        } else {
            let new_blkprev = if new_block == old_block {
                urp
            } else {
                slot_urec_ptr(self.pool, new_buf, None, trans_slot)?
            };
            let new_undorecord = self.base_undo_record(
                UndoRecordType::Insert,
                rnode,
                self.xid,
                new_blkprev,
                new_block,
                new_offnum,
            );
            let (new_urp, _) = self.staging.prepare(
                self.pool,
                self.registry,
                Some(&self.log),
                new_undorecord,
                UndoPersistence::Permanent,
                self.xid,
                self.xid_epoch,
            )?;
            (new_urp, new_blkprev)
        };

        let mut updated_old_hdr = old_hdr;
        updated_old_hdr.set_vis_status(if inplace {
            super::TUPLE_INPLACE_UPDATED
        } else {
            TUPLE_UPDATED
        });
        updated_old_hdr.trans_slot = trans_slot;

        let mut flags = XLZ_HAS_UPDATE_UNDOTUPLE;
        if !inplace {
            flags |= XLZ_NON_INPLACE_UPDATE;
        }
        if prefixlen > 0 {
            flags |= XLZ_UPDATE_PREFIX_FROM_OLD;
        }
        if suffixlen > 0 {
            flags |= XLZ_UPDATE_SUFFIX_FROM_OLD;
        }
        if self.clear_all_visible(rnode, old_block) {
            flags |= XLZ_UPDATE_OLD_ALL_VISIBLE_CLEARED;
        }
        if new_block != old_block && self.clear_all_visible(rnode, new_block) {
            flags |= XLZ_UPDATE_NEW_ALL_VISIBLE_CLEARED;
        }

        let mut record = self.new_record(XLOG_HEAP_UPDATE);
        record.undo_meta = meta;
        record
            .main_data
            .extend_from_slice(XlUndoHeader::new(rnode.relnode, rnode.tsid, blkprev, urp).as_bytes());
        record.main_data.extend_from_slice(
            XlHeapUpdate {
                old_offnum: old_offnum.into(),
                new_offnum: new_offnum.into(),
                prev_xid: prev_xid.into(),
                old_infomask: updated_old_hdr.infomask.into(),
                old_trans_slot_id: trans_slot,
                flags,
            }
            .as_bytes(),
        );
        if !inplace {
            record.main_data.extend_from_slice(
                XlUndoHeader::new(rnode.relnode, rnode.tsid, new_blkprev, new_urp).as_bytes(),
            );
        }
        record.main_data.extend_from_slice(&old_tuple);

        // Block 0 carries the new tuple, prefix/suffix-compressed.
        let mut block_data = Vec::new();
        if prefixlen > 0 {
            block_data.extend_from_slice(&(prefixlen as u16).to_le_bytes());
        }
        if suffixlen > 0 {
            block_data.extend_from_slice(&(suffixlen as u16).to_le_bytes());
        }
        block_data.extend_from_slice(&new_tuple[..TupleHeader::SIZE]);
        block_data.extend_from_slice(mid_body);

        record.add_block(
            WalBlockRef::new(rnode, ForkNumber::Main, new_block).with_data(block_data),
        );
        if new_block != old_block {
            record.add_block(WalBlockRef::new(rnode, ForkNumber::Main, old_block));
        }

        let bufs: Vec<Buffer> = if new_buf == old_buf {
            vec![old_buf]
        } else {
            vec![old_buf, new_buf]
        };
        let lsn = self.finish(&mut record, &bufs, true)?;

        // Old side first.
        {
            let page = self.pool.page_mut(old_buf);
            let item = item_id(page, old_offnum)?;
            let off = item.off as usize;
            updated_old_hdr.write_to(&mut page[off..]);
            if !inplace {
                PageHeader::from_bytes_mut(page)?.set_prunable(self.xid);
            }
        }
        if new_block != old_block {
            set_slot_undo(
                self.pool,
                old_buf,
                None,
                trans_slot,
                self.xid_epoch,
                self.xid,
                urp,
                lsn,
            )?;
        }

        // Then the new version.
        if inplace {
            let page = self.pool.page_mut(new_buf);
            let shrank = new_tuple.len() < old_tuple.len();
            page_replace_item(page, old_offnum, &new_tuple)?;
            if shrank {
                PageHeader::from_bytes_mut(page)?.set_prunable(self.xid);
            }
        } else {
            page_add_item(self.pool.page_mut(new_buf), &new_tuple, new_offnum, true)?;
        }
        set_slot_undo(
            self.pool,
            new_buf,
            None,
            trans_slot,
            self.xid_epoch,
            self.xid,
            new_urp,
            lsn,
        )?;
        self.staging.stamp_lsn(self.pool, lsn);

        let freespace = page_free_space(self.pool.page(new_buf));
        self.release(&bufs, true);

        if !inplace && freespace < FSM_THRESHOLD {
            self.fsm.record_page_free_space(rnode, new_block, freespace);
        }
        Ok((if inplace { old_offnum } else { new_offnum }, new_urp))
    }

    /// Inserts a batch of tuples at the offsets covered by `ranges`,
    /// producing one undo record per range, chained through `blkprev`.
    pub fn multi_insert(
        &mut self,
        rnode: RelFileNode,
        block: BlockNumber,
        bodies: &[&[u8]],
        ranges: &[(OffsetNumber, OffsetNumber)],
        trans_slot: u8,
        init_page: bool,
    ) -> Result<UndoRecPtr> {
        ensure!(!ranges.is_empty(), "multi-insert needs at least one range");
        ensure!(
            trans_slot < PAGE_TRANS_SLOTS,
            "multi-insert requires an inline transaction slot, got overflow slot {}",
            trans_slot
        );
        let covered: usize = ranges
            .iter()
            .map(|&(s, e)| (e - s) as usize + 1)
            .sum();
        ensure!(
            covered == bodies.len(),
            "offset ranges cover {} slots for {} tuples",
            covered,
            bodies.len()
        );

        let buf = self.read_locked(rnode, block)?;
        if init_page {
            heap_page_init(self.pool.page_mut(buf))?;
        }

        let slot_prev = slot_urec_ptr(self.pool, buf, None, trans_slot)?;

        self.staging.set_prepare_size(ranges.len());
        let mut urecptr = slot_prev;
        let mut meta = None;
        for &(start, end) in ranges {
            let mut undorecord = self.base_undo_record(
                UndoRecordType::MultiInsert,
                rnode,
                self.xid,
                urecptr,
                block,
                0,
            );
            let mut payload = Vec::with_capacity(4);
            payload.extend_from_slice(&start.to_le_bytes());
            payload.extend_from_slice(&end.to_le_bytes());
            undorecord.payload = payload;

            let (urp, m) = self.staging.prepare(
                self.pool,
                self.registry,
                Some(&self.log),
                undorecord,
                UndoPersistence::Permanent,
                self.xid,
                self.xid_epoch,
            )?;
            meta = meta.or(m);
            urecptr = urp;
        }

        let mut flags = 0u8;
        if self.clear_all_visible(rnode, block) {
            flags |= XLZ_INSERT_ALL_VISIBLE_CLEARED;
        }

        let mut info = XLOG_HEAP_MULTI_INSERT;
        if init_page {
            info |= XLOG_INIT_PAGE;
        }
        let mut record = self.new_record(info);
        record.undo_meta = meta;
        record.main_data.extend_from_slice(
            XlUndoHeader::new(rnode.relnode, rnode.tsid, slot_prev, urecptr).as_bytes(),
        );
        record.main_data.extend_from_slice(
            XlHeapMultiInsert {
                ntuples: (bodies.len() as u16).into(),
                flags,
            }
            .as_bytes(),
        );
        record
            .main_data
            .extend_from_slice(&(ranges.len() as u32).to_le_bytes());
        for &(start, end) in ranges {
            record.main_data.extend_from_slice(&start.to_le_bytes());
            record.main_data.extend_from_slice(&end.to_le_bytes());
        }

        let hdr = TupleHeader::new(trans_slot);
        let mut block_data = Vec::new();
        let mut tuples = Vec::with_capacity(bodies.len());
        for body in bodies {
            let tuple = compose_tuple(hdr, body);
            block_data.extend_from_slice(&(tuple.len() as u16).to_le_bytes());
            block_data.extend_from_slice(&tuple);
            tuples.push(tuple);
        }
        record.add_block(
            WalBlockRef::new(rnode, ForkNumber::Main, block).with_data(block_data),
        );

        let lsn = self.finish(&mut record, &[buf], true)?;
        {
            let mut idx = 0usize;
            for &(start, end) in ranges {
                for offnum in start..=end {
                    let offnum = if init_page {
                        // Reinitialized pages fill from the first offset.
                        idx as OffsetNumber + 1
                    } else {
                        offnum
                    };
                    page_add_item(self.pool.page_mut(buf), &tuples[idx], offnum, true)?;
                    idx += 1;
                }
            }
        }
        set_slot_undo(
            self.pool,
            buf,
            None,
            trans_slot,
            self.xid_epoch,
            self.xid,
            urecptr,
            lsn,
        )?;
        if flags & XLZ_INSERT_ALL_VISIBLE_CLEARED != 0 {
            PageHeader::from_bytes_mut(self.pool.page_mut(buf))?.clear_all_visible();
        }
        self.staging.stamp_lsn(self.pool, lsn);
        self.release(&[buf], true);
        Ok(urecptr)
    }

    /// Locks the tuple at `offnum` without changing its contents. The undo
    /// record keeps the old tuple header so rollback can restore it.
    pub fn lock_tuple(
        &mut self,
        rnode: RelFileNode,
        block: BlockNumber,
        offnum: OffsetNumber,
        lock_mode: u8,
        multi: bool,
        trans_slot: u8,
    ) -> Result<UndoRecPtr> {
        ensure!(
            trans_slot < PAGE_TRANS_SLOTS,
            "lock requires an inline transaction slot, got overflow slot {}",
            trans_slot
        );
        let buf = self.read_locked(rnode, block)?;

        let (old_hdr_bytes, prev_xid) = {
            let page = self.pool.page(buf);
            let item = item_id(page, offnum)?;
            ensure!(item.is_normal(), "cannot lock item {}", offnum);
            let bytes = page_get_item(page, &item);
            let hdr = TupleHeader::from_bytes(bytes);
            let prev_xid = if hdr.trans_slot < PAGE_TRANS_SLOTS {
                page_trans_slot(page, hdr.trans_slot)?.xid
            } else {
                self.xid
            };
            (bytes[..TupleHeader::SIZE].to_vec(), prev_xid)
        };

        let blkprev = slot_urec_ptr(self.pool, buf, None, trans_slot)?;
        let mut undorecord = self.base_undo_record(
            if multi {
                UndoRecordType::XidMultiLockOnly
            } else {
                UndoRecordType::XidLockOnly
            },
            rnode,
            prev_xid,
            blkprev,
            block,
            offnum,
        );
        undorecord.tuple = old_hdr_bytes.clone();
        undorecord.payload = vec![lock_mode];

        let (urp, meta) = self.staging.prepare(
            self.pool,
            self.registry,
            Some(&self.log),
            undorecord,
            UndoPersistence::Permanent,
            self.xid,
            self.xid_epoch,
        )?;

        let mut new_hdr = TupleHeader::from_bytes(&old_hdr_bytes);
        new_hdr.set_vis_status(TUPLE_XID_LOCK_ONLY);
        if multi {
            new_hdr.infomask |= TUPLE_MULTI_LOCKERS;
        }
        new_hdr.trans_slot = trans_slot;

        let mut record = self.new_record(XLOG_HEAP_LOCK);
        record.undo_meta = meta;
        record
            .main_data
            .extend_from_slice(XlUndoHeader::new(rnode.relnode, rnode.tsid, blkprev, urp).as_bytes());
        record.main_data.extend_from_slice(
            XlHeapLock {
                offnum: offnum.into(),
                prev_xid: prev_xid.into(),
                infomask: new_hdr.infomask.into(),
                trans_slot_id: trans_slot,
                flags: 0,
            }
            .as_bytes(),
        );
        record.main_data.extend_from_slice(&old_hdr_bytes);
        record.main_data.push(lock_mode);
        record.add_block(WalBlockRef::new(rnode, ForkNumber::Main, block));

        let lsn = self.finish(&mut record, &[buf], true)?;
        {
            let page = self.pool.page_mut(buf);
            let item = item_id(page, offnum)?;
            let off = item.off as usize;
            new_hdr.write_to(&mut page[off..]);
        }
        set_slot_undo(
            self.pool,
            buf,
            None,
            trans_slot,
            self.xid_epoch,
            self.xid,
            urp,
            lsn,
        )?;
        self.staging.stamp_lsn(self.pool, lsn);
        self.release(&[buf], true);
        Ok(urp)
    }

    /// Prunes the page: deleted -> dead -> unused transitions plus
    /// defragmentation. No undo; the WAL record alone replays it.
    pub fn prune(
        &mut self,
        rnode: RelFileNode,
        block: BlockNumber,
        deleted: &[(OffsetNumber, u8)],
        nowdead: &[OffsetNumber],
        nowunused: &[OffsetNumber],
        latest_removed_xid: TransactionId,
    ) -> Result<()> {
        let buf = self.read_locked(rnode, block)?;

        let mut record = self.new_record(XLOG_HEAP_CLEAN);
        record.main_data.extend_from_slice(
            XlHeapClean {
                latest_removed_xid: latest_removed_xid.into(),
                ndeleted: (deleted.len() as u16).into(),
                ndead: (nowdead.len() as u16).into(),
            }
            .as_bytes(),
        );

        let mut block_data = Vec::new();
        for &(offnum, slot) in deleted {
            block_data.extend_from_slice(&offnum.to_le_bytes());
            block_data.extend_from_slice(&(slot as u16).to_le_bytes());
        }
        for &offnum in nowdead {
            block_data.extend_from_slice(&offnum.to_le_bytes());
        }
        for &offnum in nowunused {
            block_data.extend_from_slice(&offnum.to_le_bytes());
        }
        record.add_block(
            WalBlockRef::new(rnode, ForkNumber::Main, block).with_data(block_data),
        );

        let _lsn = self.finish(&mut record, &[buf], false)?;
        prune_execute(self.pool.page_mut(buf), deleted, nowdead, nowunused)?;

        self.maybe_record_free_space(rnode, block, buf);
        self.release(&[buf], false);
        Ok(())
    }

    /// Marks item ids unused (parking the slot for rollback), with one undo
    /// record carrying the offset array.
    pub fn mark_unused(
        &mut self,
        rnode: RelFileNode,
        block: BlockNumber,
        offsets: &[OffsetNumber],
        trans_slot: u8,
        latest_removed_xid: TransactionId,
    ) -> Result<UndoRecPtr> {
        ensure!(!offsets.is_empty(), "no offsets to mark unused");
        ensure!(
            trans_slot < PAGE_TRANS_SLOTS,
            "mark-unused requires an inline transaction slot, got overflow slot {}",
            trans_slot
        );
        let buf = self.read_locked(rnode, block)?;

        let blkprev = slot_urec_ptr(self.pool, buf, None, trans_slot)?;
        let mut undorecord = self.base_undo_record(
            UndoRecordType::ItemIdUnused,
            rnode,
            self.xid,
            blkprev,
            block,
            0,
        );
        let mut payload = Vec::with_capacity(offsets.len() * 2);
        for &offnum in offsets {
            payload.extend_from_slice(&offnum.to_le_bytes());
        }
        undorecord.payload = payload;

        let (urp, meta) = self.staging.prepare(
            self.pool,
            self.registry,
            Some(&self.log),
            undorecord,
            UndoPersistence::Permanent,
            self.xid,
            self.xid_epoch,
        )?;

        let mut record = self.new_record(XLOG_HEAP_UNUSED);
        record.undo_meta = meta;
        record
            .main_data
            .extend_from_slice(XlUndoHeader::new(rnode.relnode, rnode.tsid, blkprev, urp).as_bytes());
        record.main_data.extend_from_slice(
            XlHeapUnused {
                latest_removed_xid: latest_removed_xid.into(),
                nunused: (offsets.len() as u16).into(),
                trans_slot_id: trans_slot,
                flags: 0,
            }
            .as_bytes(),
        );
        for &offnum in offsets {
            record.main_data.extend_from_slice(&offnum.to_le_bytes());
        }
        record.add_block(WalBlockRef::new(rnode, ForkNumber::Main, block));

        let lsn = self.finish(&mut record, &[buf], true)?;
        {
            let page = self.pool.page_mut(buf);
            for &offnum in offsets {
                let mut item = item_id(page, offnum)?;
                item.set_unused_extended(trans_slot);
                set_item_id(page, offnum, item)?;
            }
        }
        set_slot_undo(
            self.pool,
            buf,
            None,
            trans_slot,
            self.xid_epoch,
            self.xid,
            urp,
            lsn,
        )?;
        super::page::repair_fragmentation(self.pool.page_mut(buf))?;
        self.staging.stamp_lsn(self.pool, lsn);

        self.maybe_record_free_space(rnode, block, buf);
        self.release(&[buf], true);
        Ok(urp)
    }

    /// Resolves a speculative insertion: confirm it, or kill the tuple.
    pub fn confirm(
        &mut self,
        rnode: RelFileNode,
        block: BlockNumber,
        offnum: OffsetNumber,
        success: bool,
    ) -> Result<()> {
        let buf = self.read_locked(rnode, block)?;

        let mut record = self.new_record(XLOG_HEAP_CONFIRM);
        record.main_data.extend_from_slice(
            XlHeapConfirm {
                offnum: offnum.into(),
                flags: if success {
                    XLZ_SPEC_INSERT_SUCCESS
                } else {
                    XLZ_SPEC_INSERT_FAILED
                },
            }
            .as_bytes(),
        );
        record.add_block(WalBlockRef::new(rnode, ForkNumber::Main, block));

        let _lsn = self.finish(&mut record, &[buf], false)?;
        {
            let page = self.pool.page_mut(buf);
            let item = item_id(page, offnum)?;
            ensure!(item.is_normal(), "cannot confirm item {}", offnum);
            if success {
                let off = item.off as usize;
                let mut hdr = TupleHeader::from_bytes(&page[off..]);
                hdr.infomask &= !TUPLE_SPECULATIVE_INSERT;
                hdr.write_to(&mut page[off..]);
            } else {
                let mut item = item;
                item.set_dead();
                set_item_id(page, offnum, item)?;
                PageHeader::from_bytes_mut(page)?.set_prunable(self.xid);
            }
        }
        self.release(&[buf], false);
        Ok(())
    }

    /// Frees transaction slots whose owners are all-visible: tuples lose
    /// their slot reference and the slot array entries are cleared.
    pub fn freeze_slots(
        &mut self,
        rnode: RelFileNode,
        block: BlockNumber,
        slots: &[u8],
        latest_frozen_xid: TransactionId,
    ) -> Result<()> {
        ensure!(!slots.is_empty(), "no slots to freeze");
        let buf = self.read_locked(rnode, block)?;

        let mut record = self.new_record(XLOG_HEAP_FREEZE_SLOT);
        record.main_data.extend_from_slice(
            XlHeapFreezeSlots {
                latest_frozen_xid: latest_frozen_xid.into(),
                nfrozen: (slots.len() as u16).into(),
            }
            .as_bytes(),
        );
        record.add_block(
            WalBlockRef::new(rnode, ForkNumber::Main, block).with_data(slots.to_vec()),
        );

        let _lsn = self.finish(&mut record, &[buf], false)?;
        {
            let page = self.pool.page_mut(buf);
            freeze_or_invalidate_tuples(page, slots, true)?;
            for &slot in slots {
                page_set_undo(page, slot, 0, 0, 0)?;
            }
        }
        self.release(&[buf], false);
        Ok(())
    }

    /// Invalidates slots of committed transactions: tuples are flagged, the
    /// slot xid is reset, but the undo pointer stays for chain walks.
    pub fn invalidate_slots(
        &mut self,
        rnode: RelFileNode,
        block: BlockNumber,
        slots: &[u8],
    ) -> Result<()> {
        ensure!(!slots.is_empty(), "no slots to invalidate");
        let buf = self.read_locked(rnode, block)?;

        let mut record = self.new_record(XLOG_HEAP_INVALIDATE_SLOT);
        record.main_data.extend_from_slice(
            XlHeapInvalidateSlots {
                nslots: (slots.len() as u16).into(),
            }
            .as_bytes(),
        );
        record.add_block(
            WalBlockRef::new(rnode, ForkNumber::Main, block).with_data(slots.to_vec()),
        );

        let _lsn = self.finish(&mut record, &[buf], false)?;
        {
            let page = self.pool.page_mut(buf);
            freeze_or_invalidate_tuples(page, slots, false)?;
            for &slot in slots {
                let old = page_trans_slot(page, slot)?;
                page_set_undo(page, slot, 0, 0, old.urec_ptr)?;
            }
        }
        self.release(&[buf], false);
        Ok(())
    }
}

/// Longest shared prefix and suffix between the old and new tuple bodies,
/// bounded so they never overlap.
pub fn common_prefix_suffix(old: &[u8], new: &[u8]) -> (usize, usize) {
    let max = old.len().min(new.len());
    let mut prefix = 0;
    while prefix < max && old[prefix] == new[prefix] {
        prefix += 1;
    }
    let mut suffix = 0;
    while suffix < max - prefix
        && old[old.len() - 1 - suffix] == new[new.len() - 1 - suffix]
    {
        suffix += 1;
    }
    (prefix, suffix)
}
