//! # Redo Dispatcher and Operation Handlers
//!
//! Replays heap WAL records, reconstructing data pages *and* undo pages.
//! Every undo-aware handler follows the same skeleton:
//!
//! 1. parse the record: undo header, op header, variable payloads
//! 2. fix the visibility map if the op cleared an all-visible bit, even
//!    when the data page itself is already up to date
//! 3. rebuild the undo record exactly as the foreground path did and run
//!    the same prepare/insert steps against the recovery allocator
//! 4. check the computed undo pointer against the WAL-embedded one; a
//!    mismatch means undo space diverged and recovery must abort
//! 5. acquire the data buffer; when it needs redo, apply the same page
//!    mutations as the foreground path, stamp the slot and the LSN
//! 6. replay the TPD block reference, when present
//! 7. release buffers and feed the free-space map where the op calls for it
//!
//! Corrupt records (bad offsets, oversized tuples, pointer mismatches) are
//! fatal: the error propagates out of `redo` and aborts recovery. A missing
//! page is not: the relation was dropped or truncated later in the WAL, and
//! the handler skips the page mutation while still consuming undo space.
//!
//! In hot standby, record types that remove or freeze versions first
//! resolve snapshot conflicts; the affected xid and relation are surfaced
//! through the context for the startup process to act on.

use eyre::{bail, ensure, Result};
use zerocopy::FromBytes;

use crate::heap::ops::freeze_or_invalidate_tuples;
use crate::heap::page::{
    heap_page_init, item_id, max_offset_number, page_add_item, page_free_space, page_replace_item,
    page_set_undo, repair_fragmentation, set_item_id, trans_slot as page_trans_slot,
    PAGE_TRANS_SLOTS,
};
use crate::heap::prune::prune_execute;
use crate::heap::tpd::tpd_page_set_undo;
use crate::heap::{TupleHeader, TUPLE_DELETED, TUPLE_SPECULATIVE_INSERT};
use crate::storage::{
    Buffer, BufferPool, BufferTag, FreeSpaceMap, OffsetNumber, PageHeader, RedoAction,
    RelFileNode, TransactionId, VisibilityMap, FIRST_COMMAND_ID, INVALID_TRANSACTION_ID,
};
use crate::undo::{
    PreparedUndo, UndoLogRegistry, UndoPersistence, UndoRecPtr, UndoRecord, UndoRecordType,
};

use super::records::*;
use super::{WalBlockRef, WalRecord};

/// Replay-side environment: buffer pool, recovery allocator state, staging
/// and the maintenance maps, plus hot-standby bookkeeping.
pub struct RedoContext<'a> {
    pub pool: &'a mut BufferPool,
    pub registry: &'a UndoLogRegistry,
    pub staging: &'a mut PreparedUndo,
    pub fsm: &'a mut FreeSpaceMap,
    pub vm: &'a mut VisibilityMap,
    pub in_hot_standby: bool,
    /// `(xid, relation)` pairs whose snapshot conflicts were resolved.
    pub resolved_conflicts: Vec<(TransactionId, RelFileNode)>,
}

impl<'a> RedoContext<'a> {
    pub fn new(
        pool: &'a mut BufferPool,
        registry: &'a UndoLogRegistry,
        staging: &'a mut PreparedUndo,
        fsm: &'a mut FreeSpaceMap,
        vm: &'a mut VisibilityMap,
    ) -> Self {
        Self {
            pool,
            registry,
            staging,
            fsm,
            vm,
            in_hot_standby: false,
            resolved_conflicts: Vec::new(),
        }
    }

    fn resolve_snapshot_conflict(&mut self, xid: TransactionId, rnode: RelFileNode) {
        if self.in_hot_standby && xid != INVALID_TRANSACTION_ID {
            self.resolved_conflicts.push((xid, rnode));
        }
    }

    fn prepare_undo(
        &mut self,
        rec: UndoRecord,
        xid: TransactionId,
        xid_epoch: u32,
    ) -> Result<UndoRecPtr> {
        let (urp, _) = self.staging.prepare(
            self.pool,
            self.registry,
            None,
            rec,
            UndoPersistence::Permanent,
            xid,
            xid_epoch,
        )?;
        Ok(urp)
    }
}

/// Cursor over a record's main data.
struct MainData<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> MainData<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        ensure!(
            self.pos + n <= self.buf.len(),
            "WAL main data truncated: need {} bytes at {}, have {}",
            n,
            self.pos,
            self.buf.len()
        );
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read<T: FromBytes + Copy>(&mut self) -> Result<T> {
        let bytes = self.take(std::mem::size_of::<T>())?;
        T::read_from_bytes(bytes)
            .map_err(|e| eyre::eyre!("malformed WAL header: {:?}", e))
    }

    fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }
}

fn data_tag(blk: &WalBlockRef) -> BufferTag {
    BufferTag::new(blk.rnode, blk.fork, blk.block)
}

/// Dispatches one WAL record to its operation handler. Restores the undo
/// log's metadata first when the record carries an image.
pub fn redo(ctx: &mut RedoContext, record: &WalRecord) -> Result<()> {
    if let Some(meta) = &record.undo_meta {
        ctx.registry.restore_recovery_meta(meta);
    }

    match record.opcode() {
        XLOG_HEAP_INSERT => redo_insert(ctx, record),
        XLOG_HEAP_DELETE => redo_delete(ctx, record),
        XLOG_HEAP_UPDATE => redo_update(ctx, record),
        XLOG_HEAP_MULTI_INSERT => redo_multi_insert(ctx, record),
        XLOG_HEAP_LOCK => redo_lock(ctx, record),
        XLOG_HEAP_CLEAN => redo_clean(ctx, record),
        XLOG_HEAP_UNUSED => redo_unused(ctx, record),
        XLOG_HEAP_CONFIRM => redo_confirm(ctx, record),
        XLOG_HEAP_FREEZE_SLOT => redo_freeze_slots(ctx, record),
        XLOG_HEAP_INVALIDATE_SLOT => redo_invalidate_slots(ctx, record),
        other => bail!("heap redo: unknown op code {:#04x}", other),
    }
}

/// Replays a stream of records in order, returning how many were applied.
pub fn replay_all(ctx: &mut RedoContext, records: &[WalRecord]) -> Result<usize> {
    if records.len() > 1 {
        eprintln!("[recovery] replaying {} heap records", records.len());
    }
    for record in records {
        redo(ctx, record)?;
    }
    if records.len() > 1 {
        eprintln!(
            "[recovery] done, {} snapshot conflicts resolved",
            ctx.resolved_conflicts.len()
        );
    }
    Ok(records.len())
}

fn base_undo_record(
    rec_type: UndoRecordType,
    undohdr: &XlUndoHeader,
    xid: TransactionId,
    prev_xid: TransactionId,
    block: u32,
    offset: OffsetNumber,
) -> UndoRecord {
    UndoRecord {
        rec_type,
        relfilenode: undohdr.relfilenode(),
        tsid: undohdr.tsid(),
        prev_xid,
        xid,
        cid: FIRST_COMMAND_ID,
        blkprev: undohdr.blkprev(),
        block,
        offset,
        ..Default::default()
    }
}

fn set_slot_undo(
    ctx: &mut RedoContext,
    data_buf: Buffer,
    tpd_buf: Option<Buffer>,
    slot: u8,
    xid_epoch: u32,
    xid: TransactionId,
    urp: UndoRecPtr,
    lsn: u64,
) -> Result<()> {
    if slot < PAGE_TRANS_SLOTS {
        page_set_undo(ctx.pool.page_mut(data_buf), slot, xid_epoch, xid, urp)?;
    } else {
        let buf = tpd_buf.expect("overflow slot requires a TPD buffer");
        tpd_page_set_undo(ctx.pool.page_mut(buf), slot, xid_epoch, xid, urp)?;
        ctx.pool.set_page_lsn(buf, lsn);
        ctx.pool.mark_dirty(buf);
    }
    Ok(())
}

/// Replays the TPD block reference, if the record carries one. TPD pages
/// have no independent redo stream at this layer; a page not seen yet in
/// this replay starts out zeroed, exactly as the foreground path found it.
fn read_tpd_for_redo(
    ctx: &mut RedoContext,
    record: &WalRecord,
    idx: usize,
) -> Result<Option<Buffer>> {
    if !record.has_block_ref(idx) {
        return Ok(None);
    }
    let blk = record.block_ref(idx)?;
    let tag = data_tag(blk);
    let (action, buf) = ctx
        .pool
        .read_buffer_for_redo(tag, record.lsn, blk.image.as_deref())?;
    if action == RedoAction::NotFound {
        let buf = ctx.pool.read_buffer(tag, crate::storage::ReadMode::Normal)?;
        ctx.pool.lock_buffer(buf, crate::storage::LockMode::Exclusive);
        return Ok(Some(buf));
    }
    Ok(Some(buf))
}

fn redo_insert(ctx: &mut RedoContext, record: &WalRecord) -> Result<()> {
    let lsn = record.lsn;
    let xid = record.xid;

    let mut main = MainData::new(&record.main_data);
    let undohdr: XlUndoHeader = main.read()?;
    let xlrec: XlHeapInsert = main.read()?;
    let tpd_slot = if xlrec.flags & XLZ_INSERT_CONTAINS_TPD_SLOT != 0 {
        Some(main.read_u32()? as u8)
    } else {
        None
    };

    let blkref = record.block_ref(0)?.clone();
    let rnode = blkref.rnode;
    let blkno = blkref.block;
    let offnum = xlrec.offnum.get();

    // The visibility map may need fixing even if the page is up to date.
    if xlrec.flags & XLZ_INSERT_ALL_VISIBLE_CLEARED != 0 {
        ctx.vm.clear_all_visible(rnode, blkno);
    }

    let mut undorecord = base_undo_record(UndoRecordType::Insert, &undohdr, xid, xid, blkno, offnum);
    // The dummy speculative token keeps the record size, and therefore the
    // undo pointer, identical to the foreground insertion.
    if xlrec.flags & XLZ_INSERT_IS_SPECULATIVE != 0 {
        undorecord.payload = 1u32.to_le_bytes().to_vec();
    }

    let urp = ctx.prepare_undo(undorecord, xid, record.xid_epoch)?;
    ensure!(
        urp == undohdr.urec_ptr(),
        "undo pointer diverged during replay: {:#x} != {:#x}",
        urp,
        undohdr.urec_ptr()
    );
    ctx.staging.insert(ctx.pool, ctx.registry)?;

    let (action, buffer) = if record.is_init_page() {
        let buffer = ctx.pool.init_buffer_for_redo(data_tag(&blkref))?;
        heap_page_init(ctx.pool.page_mut(buffer))?;
        (RedoAction::NeedsRedo, buffer)
    } else {
        ctx.pool
            .read_buffer_for_redo(data_tag(&blkref), lsn, blkref.image.as_deref())?
    };

    let tpd_buf = read_tpd_for_redo(ctx, record, 1)?;

    if action == RedoAction::NeedsRedo {
        ensure!(
            max_offset_number(ctx.pool.page(buffer)) + 1 >= offnum,
            "invalid max offset number for insert at {}",
            offnum
        );

        let tuple = &blkref.data;
        let tuple_hdr = TupleHeader::from_bytes(tuple);
        page_add_item(ctx.pool.page_mut(buffer), tuple, offnum, true)?;

        let trans_slot = tpd_slot.unwrap_or(tuple_hdr.trans_slot);
        set_slot_undo(ctx, buffer, tpd_buf, trans_slot, record.xid_epoch, xid, urp, lsn)?;
        ctx.pool.set_page_lsn(buffer, lsn);
        if xlrec.flags & XLZ_INSERT_ALL_VISIBLE_CLEARED != 0 {
            PageHeader::from_bytes_mut(ctx.pool.page_mut(buffer))?.clear_all_visible();
        }
        ctx.pool.mark_dirty(buffer);
    }

    if buffer.is_valid() {
        ctx.pool.unlock_release(buffer);
    }
    if let Some(buf) = tpd_buf {
        ctx.pool.unlock_release(buf);
    }
    ctx.staging.stamp_lsn(ctx.pool, lsn);
    ctx.staging.unlock_release(ctx.pool);
    Ok(())
}

fn redo_delete(ctx: &mut RedoContext, record: &WalRecord) -> Result<()> {
    let lsn = record.lsn;
    let xid = record.xid;

    let mut main = MainData::new(&record.main_data);
    let undohdr: XlUndoHeader = main.read()?;
    let xlrec: XlHeapDelete = main.read()?;
    let tpd_slot = if xlrec.flags & XLZ_DELETE_CONTAINS_TPD_SLOT != 0 {
        Some(main.read_u32()? as u8)
    } else {
        None
    };
    let old_tuple = if xlrec.flags & XLZ_HAS_DELETE_UNDOTUPLE != 0 {
        main.rest().to_vec()
    } else {
        Vec::new()
    };

    let blkref = record.block_ref(0)?.clone();
    let rnode = blkref.rnode;
    let blkno = blkref.block;
    let offnum = xlrec.offnum.get();

    if xlrec.flags & XLZ_DELETE_ALL_VISIBLE_CLEARED != 0 {
        ctx.vm.clear_all_visible(rnode, blkno);
    }

    let mut undorecord = base_undo_record(
        UndoRecordType::Delete,
        &undohdr,
        xid,
        xlrec.prev_xid.get(),
        blkno,
        offnum,
    );
    undorecord.tuple = old_tuple;
    if let Some(slot) = tpd_slot {
        undorecord.payload = (slot as u32).to_le_bytes().to_vec();
    }

    let urp = ctx.prepare_undo(undorecord, xid, record.xid_epoch)?;
    ensure!(
        urp == undohdr.urec_ptr(),
        "undo pointer diverged during replay: {:#x} != {:#x}",
        urp,
        undohdr.urec_ptr()
    );
    ctx.staging.insert(ctx.pool, ctx.registry)?;

    let (action, buffer) =
        ctx.pool
            .read_buffer_for_redo(data_tag(&blkref), lsn, blkref.image.as_deref())?;
    let tpd_buf = read_tpd_for_redo(ctx, record, 1)?;

    if action == RedoAction::NeedsRedo {
        let page = ctx.pool.page_mut(buffer);
        let item = item_id(page, offnum)?;
        ensure!(item.is_normal(), "delete replay found no tuple at {}", offnum);

        let off = item.off as usize;
        let mut hdr = TupleHeader::from_bytes(&page[off..]);
        hdr.set_vis_status(TUPLE_DELETED);
        hdr.infomask = xlrec.infomask.get();
        hdr.trans_slot = xlrec.trans_slot_id;
        hdr.write_to(&mut page[off..]);

        PageHeader::from_bytes_mut(page)?.set_prunable(xid);
        if xlrec.flags & XLZ_DELETE_ALL_VISIBLE_CLEARED != 0 {
            PageHeader::from_bytes_mut(page)?.clear_all_visible();
        }

        set_slot_undo(
            ctx,
            buffer,
            tpd_buf,
            xlrec.trans_slot_id,
            record.xid_epoch,
            xid,
            urp,
            lsn,
        )?;
        ctx.pool.set_page_lsn(buffer, lsn);
        ctx.pool.mark_dirty(buffer);
    }

    if buffer.is_valid() {
        ctx.pool.unlock_release(buffer);
    }
    if let Some(buf) = tpd_buf {
        ctx.pool.unlock_release(buf);
    }
    ctx.staging.stamp_lsn(ctx.pool, lsn);
    ctx.staging.unlock_release(ctx.pool);
    Ok(())
}

fn redo_update(ctx: &mut RedoContext, record: &WalRecord) -> Result<()> {
    let lsn = record.lsn;
    let xid = record.xid;

    let mut main = MainData::new(&record.main_data);
    let undohdr: XlUndoHeader = main.read()?;
    let xlrec: XlHeapUpdate = main.read()?;
    let inplace = xlrec.flags & XLZ_NON_INPLACE_UPDATE == 0;
    // Update records never carry a TPD reference.
    ensure!(
        xlrec.old_trans_slot_id < PAGE_TRANS_SLOTS,
        "update record references overflow slot {}",
        xlrec.old_trans_slot_id
    );
    let newundohdr: Option<XlUndoHeader> = if inplace { None } else { Some(main.read()?) };
    ensure!(
        xlrec.flags & XLZ_HAS_UPDATE_UNDOTUPLE != 0,
        "update record without the old tuple image"
    );
    let old_tuple = main.rest().to_vec();

    let new_blkref = record.block_ref(0)?.clone();
    let rnode = new_blkref.rnode;
    let new_blkno = new_blkref.block;
    let (old_blkno, old_blkref_idx) = if record.has_block_ref(1) {
        ensure!(!inplace, "in-place updates never cross pages");
        (record.block_ref(1)?.block, 1)
    } else {
        (new_blkno, 0)
    };
    let old_offnum = xlrec.old_offnum.get();
    let new_offnum = xlrec.new_offnum.get();

    if xlrec.flags & XLZ_UPDATE_OLD_ALL_VISIBLE_CLEARED != 0 {
        ctx.vm.clear_all_visible(rnode, old_blkno);
    }
    if xlrec.flags & XLZ_UPDATE_NEW_ALL_VISIBLE_CLEARED != 0 {
        ctx.vm.clear_all_visible(rnode, new_blkno);
    }

    // Undo for the old version.
    let mut undorecord = base_undo_record(
        if inplace {
            UndoRecordType::InplaceUpdate
        } else {
            UndoRecordType::Update
        },
        &undohdr,
        xid,
        xlrec.prev_xid.get(),
        old_blkno,
        old_offnum,
    );
    undorecord.tuple = old_tuple.clone();
    if !inplace {
        let mut payload = Vec::with_capacity(6);
        payload.extend_from_slice(&new_blkno.to_le_bytes());
        payload.extend_from_slice(&new_offnum.to_le_bytes());
        undorecord.payload = payload;
    }
    let urp = ctx.prepare_undo(undorecord, xid, record.xid_epoch)?;
    ensure!(
        urp == undohdr.urec_ptr(),
        "undo pointer diverged during replay: {:#x} != {:#x}",
        urp,
        undohdr.urec_ptr()
    );

    // And for the new version, when it goes to a new location.
    let new_urp = match &newundohdr {
        None => urp,
        Some(newundohdr) => {
            let new_undorecord = base_undo_record(
                UndoRecordType::Insert,
                newundohdr,
                xid,
                xid,
                new_blkno,
                new_offnum,
            );
            let new_urp = ctx.prepare_undo(new_undorecord, xid, record.xid_epoch)?;
            ensure!(
                new_urp == newundohdr.urec_ptr(),
                "undo pointer diverged during replay: {:#x} != {:#x}",
                new_urp,
                newundohdr.urec_ptr()
            );
            new_urp
        }
    };

    ctx.staging.insert(ctx.pool, ctx.registry)?;

    let old_blkref = record.block_ref(old_blkref_idx)?.clone();
    let (old_action, old_buffer) =
        ctx.pool
            .read_buffer_for_redo(data_tag(&old_blkref), lsn, old_blkref.image.as_deref())?;

    // Old side first.
    if old_action == RedoAction::NeedsRedo {
        let page = ctx.pool.page_mut(old_buffer);
        let item = item_id(page, old_offnum)?;
        ensure!(item.is_normal(), "update replay found no tuple at {}", old_offnum);

        let off = item.off as usize;
        let mut hdr = TupleHeader::from_bytes(&page[off..]);
        hdr.infomask = xlrec.old_infomask.get();
        hdr.trans_slot = xlrec.old_trans_slot_id;
        hdr.write_to(&mut page[off..]);

        if !inplace {
            PageHeader::from_bytes_mut(page)?.set_prunable(xid);
        }
        if old_blkno != new_blkno {
            set_slot_undo(
                ctx,
                old_buffer,
                None,
                xlrec.old_trans_slot_id,
                record.xid_epoch,
                xid,
                urp,
                lsn,
            )?;
        }
        if xlrec.flags & XLZ_UPDATE_OLD_ALL_VISIBLE_CLEARED != 0 {
            PageHeader::from_bytes_mut(ctx.pool.page_mut(old_buffer))?.clear_all_visible();
        }
        ctx.pool.set_page_lsn(old_buffer, lsn);
        ctx.pool.mark_dirty(old_buffer);
    }

    // Then the page the new version goes to, if different.
    let (new_action, new_buffer) = if old_blkno == new_blkno {
        (old_action, old_buffer)
    } else if record.is_init_page() {
        let buffer = ctx.pool.init_buffer_for_redo(data_tag(&new_blkref))?;
        heap_page_init(ctx.pool.page_mut(buffer))?;
        (RedoAction::NeedsRedo, buffer)
    } else {
        ctx.pool
            .read_buffer_for_redo(data_tag(&new_blkref), lsn, new_blkref.image.as_deref())?
    };

    let mut freespace = 0;
    if new_action == RedoAction::NeedsRedo {
        ensure!(
            max_offset_number(ctx.pool.page(new_buffer)) + 1 >= new_offnum,
            "invalid max offset number for update at {}",
            new_offnum
        );

        // Reassemble the new tuple from the WAL fragment plus prefix and
        // suffix taken from the old image.
        let mut block_data = MainData::new(&new_blkref.data);
        let prefixlen = if xlrec.flags & XLZ_UPDATE_PREFIX_FROM_OLD != 0 {
            block_data.read_u16()? as usize
        } else {
            0
        };
        let suffixlen = if xlrec.flags & XLZ_UPDATE_SUFFIX_FROM_OLD != 0 {
            block_data.read_u16()? as usize
        } else {
            0
        };
        let hdr_bytes = block_data.take(TupleHeader::SIZE)?;
        let mid_body = block_data.rest();

        let old_hdr = TupleHeader::from_bytes(&old_tuple);
        let old_body = &old_tuple[old_hdr.hoff as usize..];
        ensure!(
            prefixlen + suffixlen <= old_body.len(),
            "update prefix/suffix exceed old tuple"
        );

        let mut new_tuple =
            Vec::with_capacity(TupleHeader::SIZE + prefixlen + mid_body.len() + suffixlen);
        new_tuple.extend_from_slice(hdr_bytes);
        new_tuple.extend_from_slice(&old_body[..prefixlen]);
        new_tuple.extend_from_slice(mid_body);
        new_tuple.extend_from_slice(&old_body[old_body.len() - suffixlen..]);

        if inplace {
            let shrank = new_tuple.len() < old_tuple.len();
            page_replace_item(ctx.pool.page_mut(new_buffer), old_offnum, &new_tuple)?;
            if shrank {
                PageHeader::from_bytes_mut(ctx.pool.page_mut(new_buffer))?.set_prunable(xid);
            }
        } else {
            page_add_item(ctx.pool.page_mut(new_buffer), &new_tuple, new_offnum, true)?;
        }

        let new_hdr = TupleHeader::from_bytes(&new_tuple);
        ensure!(
            new_hdr.trans_slot < PAGE_TRANS_SLOTS,
            "updated tuple references overflow slot {}",
            new_hdr.trans_slot
        );
        set_slot_undo(
            ctx,
            new_buffer,
            None,
            new_hdr.trans_slot,
            record.xid_epoch,
            xid,
            new_urp,
            lsn,
        )?;

        if xlrec.flags & XLZ_UPDATE_NEW_ALL_VISIBLE_CLEARED != 0 {
            PageHeader::from_bytes_mut(ctx.pool.page_mut(new_buffer))?.clear_all_visible();
        }

        freespace = page_free_space(ctx.pool.page(new_buffer));
        ctx.pool.set_page_lsn(new_buffer, lsn);
        ctx.pool.mark_dirty(new_buffer);
    }

    if new_buffer != old_buffer && new_buffer.is_valid() {
        ctx.pool.unlock_release(new_buffer);
    }
    if old_buffer.is_valid() {
        ctx.pool.unlock_release(old_buffer);
    }
    ctx.staging.stamp_lsn(ctx.pool, lsn);
    ctx.staging.unlock_release(ctx.pool);

    if new_action == RedoAction::NeedsRedo && !inplace && freespace < crate::heap::ops::FSM_THRESHOLD
    {
        ctx.fsm.record_page_free_space(rnode, new_blkno, freespace);
    }
    Ok(())
}

fn redo_multi_insert(ctx: &mut RedoContext, record: &WalRecord) -> Result<()> {
    let lsn = record.lsn;
    let xid = record.xid;
    let isinit = record.is_init_page();

    let mut main = MainData::new(&record.main_data);
    let undohdr: XlUndoHeader = main.read()?;
    let xlrec: XlHeapMultiInsert = main.read()?;
    let nranges = main.read_u32()? as usize;
    ensure!(nranges > 0, "multi-insert record without offset ranges");
    let mut ranges = Vec::with_capacity(nranges);
    for _ in 0..nranges {
        let start = main.read_u16()?;
        let end = main.read_u16()?;
        ranges.push((start, end));
    }

    let blkref = record.block_ref(0)?.clone();
    let rnode = blkref.rnode;
    let blkno = blkref.block;

    if xlrec.flags & XLZ_INSERT_ALL_VISIBLE_CLEARED != 0 {
        ctx.vm.clear_all_visible(rnode, blkno);
    }

    // One undo record per range, chained through blkprev.
    ctx.staging.set_prepare_size(nranges);
    let mut urecptr = undohdr.blkprev();
    for &(start, end) in &ranges {
        let mut undorecord =
            base_undo_record(UndoRecordType::MultiInsert, &undohdr, xid, xid, blkno, 0);
        undorecord.blkprev = urecptr;
        let mut payload = Vec::with_capacity(4);
        payload.extend_from_slice(&start.to_le_bytes());
        payload.extend_from_slice(&end.to_le_bytes());
        undorecord.payload = payload;

        urecptr = ctx.prepare_undo(undorecord, xid, record.xid_epoch)?;
    }
    ensure!(
        urecptr == undohdr.urec_ptr(),
        "undo pointer diverged during replay: {:#x} != {:#x}",
        urecptr,
        undohdr.urec_ptr()
    );
    ctx.staging.insert(ctx.pool, ctx.registry)?;

    let (action, buffer) = if isinit {
        let buffer = ctx.pool.init_buffer_for_redo(data_tag(&blkref))?;
        heap_page_init(ctx.pool.page_mut(buffer))?;
        (RedoAction::NeedsRedo, buffer)
    } else {
        ctx.pool
            .read_buffer_for_redo(data_tag(&blkref), lsn, blkref.image.as_deref())?
    };

    if action == RedoAction::NeedsRedo {
        let mut tuples = MainData::new(&blkref.data);
        let mut range_idx = 0usize;
        let mut offnum = ranges[0].0;
        let mut trans_slot = 0u8;

        for i in 0..xlrec.ntuples.get() {
            if isinit {
                offnum = i + 1;
            } else if offnum > ranges[range_idx].1 {
                range_idx += 1;
                ensure!(range_idx < ranges.len(), "tuples overflow declared ranges");
                offnum = ranges[range_idx].0;
            }

            ensure!(
                max_offset_number(ctx.pool.page(buffer)) + 1 >= offnum,
                "invalid max offset number for multi-insert at {}",
                offnum
            );

            let len = tuples.read_u16()? as usize;
            let tuple = tuples.take(len)?;
            page_add_item(ctx.pool.page_mut(buffer), tuple, offnum, true)?;

            trans_slot = TupleHeader::from_bytes(tuple).trans_slot;
            offnum += 1;
        }
        ensure!(tuples.rest().is_empty(), "total tuple length mismatch");

        // Multi-insert records never carry a TPD reference.
        ensure!(
            trans_slot < PAGE_TRANS_SLOTS,
            "multi-insert tuple references overflow slot {}",
            trans_slot
        );
        set_slot_undo(ctx, buffer, None, trans_slot, record.xid_epoch, xid, urecptr, lsn)?;
        ctx.pool.set_page_lsn(buffer, lsn);
        if xlrec.flags & XLZ_INSERT_ALL_VISIBLE_CLEARED != 0 {
            PageHeader::from_bytes_mut(ctx.pool.page_mut(buffer))?.clear_all_visible();
        }
        ctx.pool.mark_dirty(buffer);
    }

    if buffer.is_valid() {
        ctx.pool.unlock_release(buffer);
    }
    ctx.staging.stamp_lsn(ctx.pool, lsn);
    ctx.staging.unlock_release(ctx.pool);
    Ok(())
}

fn redo_lock(ctx: &mut RedoContext, record: &WalRecord) -> Result<()> {
    let lsn = record.lsn;
    let xid = record.xid;

    let mut main = MainData::new(&record.main_data);
    let undohdr: XlUndoHeader = main.read()?;
    let xlrec: XlHeapLock = main.read()?;
    // Lock records never carry a TPD reference.
    ensure!(
        xlrec.trans_slot_id < PAGE_TRANS_SLOTS,
        "lock record references overflow slot {}",
        xlrec.trans_slot_id
    );
    let old_hdr_bytes = main.take(TupleHeader::SIZE)?.to_vec();
    let lock_mode = main.take(1)?[0];

    let blkref = record.block_ref(0)?.clone();
    let blkno = blkref.block;
    let offnum = xlrec.offnum.get();

    let multi = xlrec.infomask.get() & crate::heap::TUPLE_MULTI_LOCKERS != 0;
    let mut undorecord = base_undo_record(
        if multi {
            UndoRecordType::XidMultiLockOnly
        } else {
            UndoRecordType::XidLockOnly
        },
        &undohdr,
        xid,
        xlrec.prev_xid.get(),
        blkno,
        offnum,
    );
    undorecord.tuple = old_hdr_bytes;
    undorecord.payload = vec![lock_mode];

    let urp = ctx.prepare_undo(undorecord, xid, record.xid_epoch)?;
    ensure!(
        urp == undohdr.urec_ptr(),
        "undo pointer diverged during replay: {:#x} != {:#x}",
        urp,
        undohdr.urec_ptr()
    );
    ctx.staging.insert(ctx.pool, ctx.registry)?;

    let (action, buffer) =
        ctx.pool
            .read_buffer_for_redo(data_tag(&blkref), lsn, blkref.image.as_deref())?;

    if action == RedoAction::NeedsRedo {
        let page = ctx.pool.page_mut(buffer);
        let item = item_id(page, offnum)?;
        ensure!(item.is_normal(), "lock replay found no tuple at {}", offnum);

        let off = item.off as usize;
        let mut hdr = TupleHeader::from_bytes(&page[off..]);
        hdr.infomask = xlrec.infomask.get();
        hdr.trans_slot = xlrec.trans_slot_id;
        hdr.write_to(&mut page[off..]);

        set_slot_undo(
            ctx,
            buffer,
            None,
            xlrec.trans_slot_id,
            record.xid_epoch,
            xid,
            urp,
            lsn,
        )?;
        ctx.pool.set_page_lsn(buffer, lsn);
        ctx.pool.mark_dirty(buffer);
    }

    if buffer.is_valid() {
        ctx.pool.unlock_release(buffer);
    }
    ctx.staging.stamp_lsn(ctx.pool, lsn);
    ctx.staging.unlock_release(ctx.pool);
    Ok(())
}

fn redo_clean(ctx: &mut RedoContext, record: &WalRecord) -> Result<()> {
    let lsn = record.lsn;

    let mut main = MainData::new(&record.main_data);
    let xlrec: XlHeapClean = main.read()?;

    let blkref = record.block_ref(0)?.clone();
    let rnode = blkref.rnode;
    let blkno = blkref.block;

    // Removed versions may still be visible to standby queries.
    ctx.resolve_snapshot_conflict(xlrec.latest_removed_xid.get(), rnode);

    let (action, buffer) =
        ctx.pool
            .read_buffer_for_redo(data_tag(&blkref), lsn, blkref.image.as_deref())?;

    let mut freespace = 0;
    if action == RedoAction::NeedsRedo {
        let mut data = MainData::new(&blkref.data);
        let ndeleted = xlrec.ndeleted.get() as usize;
        let ndead = xlrec.ndead.get() as usize;

        let mut deleted = Vec::with_capacity(ndeleted);
        for _ in 0..ndeleted {
            let offnum = data.read_u16()?;
            let slot = data.read_u16()? as u8;
            deleted.push((offnum, slot));
        }
        let mut nowdead = Vec::with_capacity(ndead);
        for _ in 0..ndead {
            nowdead.push(data.read_u16()?);
        }
        let rest = data.rest();
        ensure!(rest.len() % 2 == 0, "odd unused-offset payload");
        let nowunused: Vec<OffsetNumber> = rest
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes(c.try_into().unwrap()))
            .collect();

        prune_execute(ctx.pool.page_mut(buffer), &deleted, &nowdead, &nowunused)?;

        freespace = page_free_space(ctx.pool.page(buffer));
        ctx.pool.set_page_lsn(buffer, lsn);
        ctx.pool.mark_dirty(buffer);
    }
    if buffer.is_valid() {
        ctx.pool.unlock_release(buffer);
    }

    if action == RedoAction::NeedsRedo && freespace < crate::heap::ops::FSM_THRESHOLD {
        ctx.fsm.record_page_free_space(rnode, blkno, freespace);
    }
    Ok(())
}

fn redo_unused(ctx: &mut RedoContext, record: &WalRecord) -> Result<()> {
    let lsn = record.lsn;
    let xid = record.xid;

    let mut main = MainData::new(&record.main_data);
    let undohdr: XlUndoHeader = main.read()?;
    let xlrec: XlHeapUnused = main.read()?;
    // Unused records never carry a TPD reference.
    ensure!(
        xlrec.trans_slot_id < PAGE_TRANS_SLOTS,
        "unused record references overflow slot {}",
        xlrec.trans_slot_id
    );
    let nunused = xlrec.nunused.get() as usize;
    let mut offsets = Vec::with_capacity(nunused);
    for _ in 0..nunused {
        offsets.push(main.read_u16()?);
    }

    let blkref = record.block_ref(0)?.clone();
    let rnode = blkref.rnode;
    let blkno = blkref.block;

    ctx.resolve_snapshot_conflict(xlrec.latest_removed_xid.get(), rnode);

    let mut undorecord =
        base_undo_record(UndoRecordType::ItemIdUnused, &undohdr, xid, xid, blkno, 0);
    let mut payload = Vec::with_capacity(offsets.len() * 2);
    for &offnum in &offsets {
        payload.extend_from_slice(&offnum.to_le_bytes());
    }
    undorecord.payload = payload;

    let urp = ctx.prepare_undo(undorecord, xid, record.xid_epoch)?;
    ensure!(
        urp == undohdr.urec_ptr(),
        "undo pointer diverged during replay: {:#x} != {:#x}",
        urp,
        undohdr.urec_ptr()
    );
    ctx.staging.insert(ctx.pool, ctx.registry)?;

    let (action, buffer) =
        ctx.pool
            .read_buffer_for_redo(data_tag(&blkref), lsn, blkref.image.as_deref())?;

    let mut freespace = 0;
    if action == RedoAction::NeedsRedo {
        {
            let page = ctx.pool.page_mut(buffer);
            for &offnum in &offsets {
                let mut item = item_id(page, offnum)?;
                item.set_unused_extended(xlrec.trans_slot_id);
                set_item_id(page, offnum, item)?;
            }
        }
        set_slot_undo(
            ctx,
            buffer,
            None,
            xlrec.trans_slot_id,
            record.xid_epoch,
            xid,
            urp,
            lsn,
        )?;
        repair_fragmentation(ctx.pool.page_mut(buffer))?;

        freespace = page_free_space(ctx.pool.page(buffer));
        ctx.pool.set_page_lsn(buffer, lsn);
        ctx.pool.mark_dirty(buffer);
    }

    if buffer.is_valid() {
        ctx.pool.unlock_release(buffer);
    }
    ctx.staging.stamp_lsn(ctx.pool, lsn);
    ctx.staging.unlock_release(ctx.pool);

    if action == RedoAction::NeedsRedo && freespace < crate::heap::ops::FSM_THRESHOLD {
        ctx.fsm.record_page_free_space(rnode, blkno, freespace);
    }
    Ok(())
}

fn redo_confirm(ctx: &mut RedoContext, record: &WalRecord) -> Result<()> {
    let lsn = record.lsn;

    let mut main = MainData::new(&record.main_data);
    let xlrec: XlHeapConfirm = main.read()?;
    let offnum = xlrec.offnum.get();

    let blkref = record.block_ref(0)?.clone();
    let (action, buffer) =
        ctx.pool
            .read_buffer_for_redo(data_tag(&blkref), lsn, blkref.image.as_deref())?;

    if action == RedoAction::NeedsRedo {
        let page = ctx.pool.page_mut(buffer);
        let item = item_id(page, offnum)?;
        ensure!(item.is_normal(), "confirm replay found no tuple at {}", offnum);

        if xlrec.flags == XLZ_SPEC_INSERT_SUCCESS {
            let off = item.off as usize;
            let mut hdr = TupleHeader::from_bytes(&page[off..]);
            hdr.infomask &= !TUPLE_SPECULATIVE_INSERT;
            hdr.write_to(&mut page[off..]);
        } else {
            ensure!(
                xlrec.flags == XLZ_SPEC_INSERT_FAILED,
                "unknown confirm flags {:#04x}",
                xlrec.flags
            );
            let mut item = item;
            item.set_dead();
            set_item_id(page, offnum, item)?;
            PageHeader::from_bytes_mut(page)?.set_prunable(record.xid);
        }

        ctx.pool.set_page_lsn(buffer, lsn);
        ctx.pool.mark_dirty(buffer);
    }
    if buffer.is_valid() {
        ctx.pool.unlock_release(buffer);
    }
    Ok(())
}

fn redo_freeze_slots(ctx: &mut RedoContext, record: &WalRecord) -> Result<()> {
    let lsn = record.lsn;

    let mut main = MainData::new(&record.main_data);
    let xlrec: XlHeapFreezeSlots = main.read()?;
    ensure!(xlrec.nfrozen.get() > 0, "freeze record without slots");

    let blkref = record.block_ref(0)?.clone();

    // Standby queries may still see the frozen transactions.
    // FIXME: wraparound of latest_frozen_xid is not handled here.
    ctx.resolve_snapshot_conflict(xlrec.latest_frozen_xid.get(), blkref.rnode);

    let (action, buffer) =
        ctx.pool
            .read_buffer_for_redo(data_tag(&blkref), lsn, blkref.image.as_deref())?;

    if action == RedoAction::NeedsRedo {
        let slots = blkref.data.clone();
        ensure!(
            slots.len() == xlrec.nfrozen.get() as usize,
            "freeze slot count mismatch"
        );
        let page = ctx.pool.page_mut(buffer);
        freeze_or_invalidate_tuples(page, &slots, true)?;
        for &slot in &slots {
            page_set_undo(page, slot, 0, INVALID_TRANSACTION_ID, 0)?;
        }
        ctx.pool.set_page_lsn(buffer, lsn);
        ctx.pool.mark_dirty(buffer);
    }
    if buffer.is_valid() {
        ctx.pool.unlock_release(buffer);
    }
    Ok(())
}

fn redo_invalidate_slots(ctx: &mut RedoContext, record: &WalRecord) -> Result<()> {
    let lsn = record.lsn;

    let mut main = MainData::new(&record.main_data);
    let xlrec: XlHeapInvalidateSlots = main.read()?;
    ensure!(xlrec.nslots.get() > 0, "invalidate record without slots");

    let blkref = record.block_ref(0)?.clone();
    let (action, buffer) =
        ctx.pool
            .read_buffer_for_redo(data_tag(&blkref), lsn, blkref.image.as_deref())?;

    if action == RedoAction::NeedsRedo {
        let slots = blkref.data.clone();
        ensure!(
            slots.len() == xlrec.nslots.get() as usize,
            "invalidate slot count mismatch"
        );
        let page = ctx.pool.page_mut(buffer);
        freeze_or_invalidate_tuples(page, &slots, false)?;
        for &slot in &slots {
            let old = page_trans_slot(page, slot)?;
            page_set_undo(page, slot, 0, INVALID_TRANSACTION_ID, old.urec_ptr)?;
        }
        ctx.pool.set_page_lsn(buffer, lsn);
        ctx.pool.mark_dirty(buffer);
    }
    if buffer.is_valid() {
        ctx.pool.unlock_release(buffer);
    }
    Ok(())
}
