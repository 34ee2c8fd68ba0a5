//! # Redo Replay Tests
//!
//! End-to-end scenarios driving the heap write path, then replaying the
//! produced WAL stream into a fresh buffer pool and registry. The two hard
//! guarantees exercised here:
//!
//! - every undo pointer computed during replay equals the one the
//!   foreground path embedded in the WAL record (the handlers abort
//!   recovery on a mismatch, so a successful replay is itself the check)
//! - replayed data pages and undo pages are byte-for-byte identical to the
//!   pre-crash images

use std::sync::Arc;

use tempfile::{tempdir, TempDir};

use undine::heap::ops::{HeapSession, InsertOptions};
use undine::heap::page::{
    item_id, max_offset_number, page_get_item, trans_slot, LP_UNUSED, PAGE_TRANS_SLOTS,
};
use undine::heap::{TupleHeader, TUPLE_DELETED, TUPLE_UPDATED};
use undine::storage::{
    BufferPool, BufferTag, ForkNumber, FreeSpaceMap, ReadMode, RelFileNode, VisibilityMap,
    INVALID_BLOCK_NUMBER,
};
use undine::undo::{
    fetch_undo_record, urp_offset, PreparedUndo, UndoLogControl, UndoLogRegistry,
    UndoLogRegistryOptions, UndoPersistence, UndoRecordType, SPECIAL_UNDO_REC_PTR,
    UREC_INFO_BLOCK, UREC_INFO_RELATION_DETAILS, UREC_INFO_TRANSACTION,
};
use undine::wal::{redo, replay_all, RedoContext, WalStream};

struct Harness {
    _dir: TempDir,
    registry: UndoLogRegistry,
    pool: BufferPool,
    staging: PreparedUndo,
    wal: WalStream,
    fsm: FreeSpaceMap,
    vm: VisibilityMap,
    log: Arc<UndoLogControl>,
}

impl Harness {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let registry = UndoLogRegistry::create(UndoLogRegistryOptions::new(dir.path()));
        let log = registry.attach(UndoPersistence::Permanent, 0).unwrap();
        Self {
            _dir: dir,
            registry,
            pool: BufferPool::new(),
            staging: PreparedUndo::new(),
            wal: WalStream::new(),
            fsm: FreeSpaceMap::new(),
            vm: VisibilityMap::new(),
            log,
        }
    }

    fn session(&mut self, xid: u32) -> HeapSession<'_> {
        HeapSession {
            pool: &mut self.pool,
            registry: &self.registry,
            staging: &mut self.staging,
            wal: &mut self.wal,
            fsm: &mut self.fsm,
            vm: &mut self.vm,
            log: self.log.clone(),
            xid,
            xid_epoch: 0,
        }
    }

    fn fetch_at(&mut self, urp: u64) -> undine::UndoRecord {
        fetch_undo_record(
            &mut self.pool,
            &self.registry,
            urp,
            INVALID_BLOCK_NUMBER,
            0,
            0,
            |_, _, _, _| true,
        )
        .unwrap()
        .unwrap()
        .0
    }

    fn page_copy(&mut self, rnode: RelFileNode, fork: ForkNumber, block: u32) -> Vec<u8> {
        let buf = self
            .pool
            .read_buffer(BufferTag::new(rnode, fork, block), ReadMode::Normal)
            .unwrap();
        let page = self.pool.page(buf).to_vec();
        self.pool.release(buf);
        page
    }
}

struct Replayed {
    _dir: TempDir,
    pool: BufferPool,
    registry: UndoLogRegistry,
    fsm: FreeSpaceMap,
}

fn replay(wal: &WalStream) -> Replayed {
    let dir = tempdir().unwrap();
    let registry = UndoLogRegistry::create(UndoLogRegistryOptions::new(dir.path()));
    let mut pool = BufferPool::new();
    let mut staging = PreparedUndo::new_for_recovery();
    let mut fsm = FreeSpaceMap::new();
    let mut vm = VisibilityMap::new();

    let records = wal.records().unwrap();
    {
        let mut ctx = RedoContext::new(&mut pool, &registry, &mut staging, &mut fsm, &mut vm);
        replay_all(&mut ctx, &records).unwrap();
    }

    Replayed {
        _dir: dir,
        pool,
        registry,
        fsm,
    }
}

fn replayed_page(replayed: &mut Replayed, rnode: RelFileNode, fork: ForkNumber, block: u32) -> Vec<u8> {
    let buf = replayed
        .pool
        .read_buffer(BufferTag::new(rnode, fork, block), ReadMode::Normal)
        .unwrap();
    let page = replayed.pool.page(buf).to_vec();
    replayed.pool.release(buf);
    page
}

fn assert_pages_match(
    harness: &mut Harness,
    replayed: &mut Replayed,
    rnode: RelFileNode,
    fork: ForkNumber,
    block: u32,
) {
    let original = harness.page_copy(rnode, fork, block);
    let recovered = replayed_page(replayed, rnode, fork, block);
    assert_eq!(
        original, recovered,
        "page {:?}/{:?}/{} diverged after replay",
        rnode, fork, block
    );
}

// A relation in a non-default tablespace, so undo records carry their
// relation details.
fn test_rel() -> RelFileNode {
    RelFileNode::new(1, 50)
}

#[test]
fn single_insert_first_in_transaction() {
    let mut harness = Harness::new();
    let rnode = test_rel();

    let (offnum, urp) = harness
        .session(100)
        .insert(
            rnode,
            0,
            b"a",
            1,
            0,
            InsertOptions {
                init_page: true,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(offnum, 1);

    let rec = harness.fetch_at(urp);
    assert_eq!(rec.rec_type, UndoRecordType::Insert);
    assert_ne!(rec.info & UREC_INFO_TRANSACTION, 0);
    assert_ne!(rec.info & UREC_INFO_BLOCK, 0);
    assert_ne!(rec.info & UREC_INFO_RELATION_DETAILS, 0);
    assert_eq!(rec.next, SPECIAL_UNDO_REC_PTR);
    assert_eq!(rec.blkprev, 0);
    assert_eq!(rec.prevlen, 0);
    assert_eq!(rec.xid, 100);
    assert_eq!(rec.block, 0);
    assert_eq!(rec.offset, 1);

    // The page holds the tuple and slot 0 references the undo record.
    let page = harness.page_copy(rnode, ForkNumber::Main, 0);
    assert_eq!(max_offset_number(&page), 1);
    let item = item_id(&page, 1).unwrap();
    let tuple = page_get_item(&page, &item);
    let hdr = TupleHeader::from_bytes(tuple);
    assert_eq!(hdr.trans_slot, 0);
    assert_eq!(&tuple[TupleHeader::SIZE..], b"a");

    let slot = trans_slot(&page, 0).unwrap();
    assert_eq!(slot.xid, 100);
    assert_eq!(slot.urec_ptr, urp);
}

#[test]
fn insert_then_delete_same_transaction() {
    let mut harness = Harness::new();
    let rnode = test_rel();

    let (_, insert_urp) = harness
        .session(100)
        .insert(
            rnode,
            0,
            b"row one",
            1,
            0,
            InsertOptions {
                init_page: true,
                ..Default::default()
            },
        )
        .unwrap();

    let delete_urp = harness.session(100).delete(rnode, 0, 1, 0, None).unwrap();

    let rec = harness.fetch_at(delete_urp);
    assert_eq!(rec.rec_type, UndoRecordType::Delete);
    assert_eq!(rec.blkprev, insert_urp);
    assert_eq!(rec.prev_xid, 100);
    // The full old tuple rides in the undo record.
    let old_hdr = TupleHeader::from_bytes(&rec.tuple);
    assert_eq!(&rec.tuple[TupleHeader::SIZE..], b"row one");
    assert_eq!(old_hdr.trans_slot, 0);

    // Same log, delete undo did not start a new transaction header.
    assert_eq!(rec.info & UREC_INFO_TRANSACTION, 0);

    let page = harness.page_copy(rnode, ForkNumber::Main, 0);
    let item = item_id(&page, 1).unwrap();
    let tuple = page_get_item(&page, &item);
    let hdr = TupleHeader::from_bytes(tuple);
    assert_ne!(hdr.infomask & TUPLE_DELETED, 0);

    let slot = trans_slot(&page, 0).unwrap();
    assert_eq!(slot.urec_ptr, delete_urp);
}

#[test]
fn two_transaction_chain_patches_previous_header() {
    let mut harness = Harness::new();
    let rnode = test_rel();

    let (_, urp1) = harness
        .session(100)
        .insert(
            rnode,
            0,
            b"first",
            1,
            0,
            InsertOptions {
                init_page: true,
                ..Default::default()
            },
        )
        .unwrap();

    let (_, urp2) = harness
        .session(101)
        .insert(rnode, 0, b"second", 2, 1, InsertOptions::default())
        .unwrap();

    // Transaction 101's first record has its own transaction header...
    let rec2 = harness.fetch_at(urp2);
    assert_ne!(rec2.info & UREC_INFO_TRANSACTION, 0);
    assert_eq!(rec2.next, SPECIAL_UNDO_REC_PTR);

    // ...and transaction 100's header now points at it.
    let rec1 = harness.fetch_at(urp1);
    assert_eq!(rec1.next, urp2);

    assert_eq!(harness.log.meta().last_xact_start, urp_offset(urp2));
}

#[test]
fn crash_recovery_reproduces_insert_delete() {
    let mut harness = Harness::new();
    let rnode = test_rel();

    harness
        .session(100)
        .insert(
            rnode,
            0,
            b"row one",
            1,
            0,
            InsertOptions {
                init_page: true,
                ..Default::default()
            },
        )
        .unwrap();
    harness.session(100).delete(rnode, 0, 1, 0, None).unwrap();

    // Replay succeeds, which already asserts the undo pointers matched.
    let mut replayed = replay(&harness.wal);

    // Data page and undo page are byte-for-byte identical.
    assert_pages_match(&mut harness, &mut replayed, rnode, ForkNumber::Main, 0);
    let undo_rnode = RelFileNode::new(0, harness.log.logno);
    assert_pages_match(&mut harness, &mut replayed, undo_rnode, ForkNumber::Undo, 0);

    // The replay registry's allocator state matches the original.
    let replay_log = replayed.registry.get(harness.log.logno).unwrap();
    assert_eq!(replay_log.meta().insert, harness.log.meta().insert);
    assert_eq!(replay_log.meta().prevlen, harness.log.meta().prevlen);
    assert_eq!(
        replay_log.meta().last_xact_start,
        harness.log.meta().last_xact_start
    );
}

#[test]
fn crash_recovery_reproduces_transaction_chain() {
    let mut harness = Harness::new();
    let rnode = test_rel();

    harness
        .session(100)
        .insert(
            rnode,
            0,
            b"first",
            1,
            0,
            InsertOptions {
                init_page: true,
                ..Default::default()
            },
        )
        .unwrap();
    harness
        .session(101)
        .insert(rnode, 0, b"second", 2, 1, InsertOptions::default())
        .unwrap();

    let mut replayed = replay(&harness.wal);
    assert_pages_match(&mut harness, &mut replayed, rnode, ForkNumber::Main, 0);
    let undo_rnode = RelFileNode::new(0, harness.log.logno);
    assert_pages_match(&mut harness, &mut replayed, undo_rnode, ForkNumber::Undo, 0);
}

#[test]
fn non_inplace_update_across_pages() {
    let mut harness = Harness::new();
    let rnode = test_rel();

    // Row to update on page 0; a filler row sets up page 1.
    let (_, _) = harness
        .session(100)
        .insert(
            rnode,
            0,
            b"short value",
            1,
            0,
            InsertOptions {
                init_page: true,
                ..Default::default()
            },
        )
        .unwrap();
    harness
        .session(100)
        .insert(
            rnode,
            1,
            b"filler",
            1,
            0,
            InsertOptions {
                init_page: true,
                ..Default::default()
            },
        )
        .unwrap();

    let long_value = vec![0x61u8; 300];
    let (new_offnum, new_urp) = harness
        .session(100)
        .update(rnode, 0, 1, 1, 2, &long_value, 0, false)
        .unwrap();
    assert_eq!(new_offnum, 2);

    // Two undo records: UNDO_UPDATE on the old block...
    let new_rec = harness.fetch_at(new_urp);
    assert_eq!(new_rec.rec_type, UndoRecordType::Insert);
    assert_eq!(new_rec.block, 1);

    let old_page = harness.page_copy(rnode, ForkNumber::Main, 0);
    let old_slot = trans_slot(&old_page, 0).unwrap();
    let old_rec = harness.fetch_at(old_slot.urec_ptr);
    assert_eq!(old_rec.rec_type, UndoRecordType::Update);
    assert_eq!(old_rec.block, 0);
    assert_eq!(&old_rec.tuple[TupleHeader::SIZE..], b"short value");

    // The update record's payload names the new version's location.
    assert_eq!(&old_rec.payload[0..4], &1u32.to_le_bytes());
    assert_eq!(&old_rec.payload[4..6], &2u16.to_le_bytes());

    // Old tuple wears the updated bit; new page has the new version.
    let item = item_id(&old_page, 1).unwrap();
    let hdr = TupleHeader::from_bytes(page_get_item(&old_page, &item));
    assert_ne!(hdr.infomask & TUPLE_UPDATED, 0);

    let new_page = harness.page_copy(rnode, ForkNumber::Main, 1);
    let item = item_id(&new_page, 2).unwrap();
    let tuple = page_get_item(&new_page, &item);
    assert_eq!(&tuple[TupleHeader::SIZE..], &long_value[..]);
    assert_eq!(trans_slot(&new_page, 0).unwrap().urec_ptr, new_urp);

    // Replay reproduces both pages and the undo space.
    let mut replayed = replay(&harness.wal);
    assert_pages_match(&mut harness, &mut replayed, rnode, ForkNumber::Main, 0);
    assert_pages_match(&mut harness, &mut replayed, rnode, ForkNumber::Main, 1);
    let undo_rnode = RelFileNode::new(0, harness.log.logno);
    assert_pages_match(&mut harness, &mut replayed, undo_rnode, ForkNumber::Undo, 0);
}

#[test]
fn inplace_update_reconstructs_from_prefix_and_suffix() {
    let mut harness = Harness::new();
    let rnode = test_rel();

    harness
        .session(100)
        .insert(
            rnode,
            0,
            b"shared-prefix MIDDLE shared-suffix",
            1,
            0,
            InsertOptions {
                init_page: true,
                ..Default::default()
            },
        )
        .unwrap();

    let new_body = b"shared-prefix CENTER shared-suffix";
    harness
        .session(100)
        .update(rnode, 0, 1, 0, 1, new_body, 0, true)
        .unwrap();

    let page = harness.page_copy(rnode, ForkNumber::Main, 0);
    let item = item_id(&page, 1).unwrap();
    let tuple = page_get_item(&page, &item);
    assert_eq!(&tuple[TupleHeader::SIZE..], new_body);

    let slot = trans_slot(&page, 0).unwrap();
    let rec = harness.fetch_at(slot.urec_ptr);
    assert_eq!(rec.rec_type, UndoRecordType::InplaceUpdate);
    assert_eq!(
        &rec.tuple[TupleHeader::SIZE..],
        b"shared-prefix MIDDLE shared-suffix"
    );

    let mut replayed = replay(&harness.wal);
    assert_pages_match(&mut harness, &mut replayed, rnode, ForkNumber::Main, 0);
    let undo_rnode = RelFileNode::new(0, harness.log.logno);
    assert_pages_match(&mut harness, &mut replayed, undo_rnode, ForkNumber::Undo, 0);
}

#[test]
fn multi_insert_three_ranges() {
    let mut harness = Harness::new();
    let rnode = test_rel();

    // Lay down 15 rows, then free the offsets the ranges will refill.
    let bodies: Vec<Vec<u8>> = (0..15u8).map(|i| vec![i; 8]).collect();
    let body_refs: Vec<&[u8]> = bodies.iter().map(|b| b.as_slice()).collect();
    harness
        .session(100)
        .multi_insert(rnode, 0, &body_refs, &[(1, 15)], 0, true)
        .unwrap();

    let freed: Vec<u16> = vec![5, 6, 8, 9, 12, 13, 14, 15];
    harness
        .session(100)
        .prune(rnode, 0, &[], &[], &freed, 100)
        .unwrap();

    let page = harness.page_copy(rnode, ForkNumber::Main, 0);
    for &offnum in &freed {
        assert_eq!(item_id(&page, offnum).unwrap().flags, LP_UNUSED);
    }

    // Refill through three declared ranges.
    let new_bodies: Vec<Vec<u8>> = (0..8u8).map(|i| vec![0xF0 | i; 8]).collect();
    let new_refs: Vec<&[u8]> = new_bodies.iter().map(|b| b.as_slice()).collect();
    let ranges = [(5u16, 6u16), (8, 9), (12, 15)];
    let last_urp = harness
        .session(101)
        .multi_insert(rnode, 0, &new_refs, &ranges, 1, false)
        .unwrap();

    // Three undo records, each carrying its offset pair, chained backwards.
    let rec3 = harness.fetch_at(last_urp);
    assert_eq!(rec3.rec_type, UndoRecordType::MultiInsert);
    assert_eq!(&rec3.payload[0..2], &12u16.to_le_bytes());
    assert_eq!(&rec3.payload[2..4], &15u16.to_le_bytes());

    let rec2 = harness.fetch_at(rec3.blkprev);
    assert_eq!(&rec2.payload[0..2], &8u16.to_le_bytes());
    assert_eq!(&rec2.payload[2..4], &9u16.to_le_bytes());

    let rec1 = harness.fetch_at(rec2.blkprev);
    assert_eq!(&rec1.payload[0..2], &5u16.to_le_bytes());
    assert_eq!(&rec1.payload[2..4], &6u16.to_le_bytes());

    // Tuples landed exactly at the declared offsets.
    let page = harness.page_copy(rnode, ForkNumber::Main, 0);
    let mut idx = 0usize;
    for &(start, end) in &ranges {
        for offnum in start..=end {
            let item = item_id(&page, offnum).unwrap();
            assert!(item.is_normal(), "offset {} not filled", offnum);
            let tuple = page_get_item(&page, &item);
            assert_eq!(&tuple[TupleHeader::SIZE..], new_refs[idx]);
            idx += 1;
        }
    }
    // Slot 1 points at the last record of the chain.
    assert_eq!(trans_slot(&page, 1).unwrap().urec_ptr, last_urp);

    let mut replayed = replay(&harness.wal);
    assert_pages_match(&mut harness, &mut replayed, rnode, ForkNumber::Main, 0);
    let undo_rnode = RelFileNode::new(0, harness.log.logno);
    assert_pages_match(&mut harness, &mut replayed, undo_rnode, ForkNumber::Undo, 0);
}

#[test]
fn lock_confirm_unused_freeze_invalidate_replay() {
    let mut harness = Harness::new();
    let rnode = test_rel();

    // Speculative insert, confirmed; a second row locked; a third marked
    // unused; then slots frozen and invalidated.
    harness
        .session(100)
        .insert(
            rnode,
            0,
            b"speculative",
            1,
            0,
            InsertOptions {
                init_page: true,
                speculative: true,
                ..Default::default()
            },
        )
        .unwrap();
    harness.session(100).confirm(rnode, 0, 1, true).unwrap();

    harness
        .session(100)
        .insert(rnode, 0, b"to lock", 2, 0, InsertOptions::default())
        .unwrap();
    harness
        .session(101)
        .lock_tuple(rnode, 0, 2, 3, false, 1)
        .unwrap();

    harness
        .session(101)
        .insert(rnode, 0, b"to free", 3, 1, InsertOptions::default())
        .unwrap();
    harness
        .session(102)
        .mark_unused(rnode, 0, &[3], 2, 101)
        .unwrap();

    harness.session(102).freeze_slots(rnode, 0, &[0], 100).unwrap();
    harness.session(102).invalidate_slots(rnode, 0, &[1]).unwrap();

    // The speculative bit is gone; the frozen slot is cleared.
    let page = harness.page_copy(rnode, ForkNumber::Main, 0);
    let item = item_id(&page, 1).unwrap();
    let hdr = TupleHeader::from_bytes(page_get_item(&page, &item));
    assert_eq!(hdr.infomask & undine::heap::TUPLE_SPECULATIVE_INSERT, 0);
    assert_eq!(hdr.trans_slot, undine::heap::FROZEN_SLOT);
    assert_eq!(trans_slot(&page, 0).unwrap().urec_ptr, 0);

    // Invalidated slot keeps its undo pointer but forgets the xid.
    let slot1 = trans_slot(&page, 1).unwrap();
    assert_eq!(slot1.xid, 0);
    assert_ne!(slot1.urec_ptr, 0);

    let mut replayed = replay(&harness.wal);
    assert_pages_match(&mut harness, &mut replayed, rnode, ForkNumber::Main, 0);
    let undo_rnode = RelFileNode::new(0, harness.log.logno);
    assert_pages_match(&mut harness, &mut replayed, undo_rnode, ForkNumber::Undo, 0);
}

#[test]
fn ops_without_tpd_reference_reject_overflow_slots() {
    let mut harness = Harness::new();
    let rnode = test_rel();

    harness
        .session(100)
        .insert(
            rnode,
            0,
            b"row",
            1,
            0,
            InsertOptions {
                init_page: true,
                ..Default::default()
            },
        )
        .unwrap();

    // These operations carry no TPD block reference, so an overflow slot
    // must be refused up front rather than panicking mid-operation.
    let overflow = PAGE_TRANS_SLOTS;
    assert!(harness
        .session(100)
        .update(rnode, 0, 1, 0, 1, b"new", overflow, true)
        .is_err());
    assert!(harness
        .session(100)
        .lock_tuple(rnode, 0, 1, 1, false, overflow)
        .is_err());
    assert!(harness
        .session(100)
        .multi_insert(rnode, 0, &[b"x".as_slice()], &[(2, 2)], overflow, false)
        .is_err());
    assert!(harness
        .session(100)
        .mark_unused(rnode, 0, &[1], overflow, 100)
        .is_err());

    // The page is untouched and the stream still replays cleanly.
    let mut replayed = replay(&harness.wal);
    assert_pages_match(&mut harness, &mut replayed, rnode, ForkNumber::Main, 0);
}

#[test]
fn replay_is_idempotent_on_current_pages() {
    let mut harness = Harness::new();
    let rnode = test_rel();

    harness
        .session(100)
        .insert(
            rnode,
            0,
            b"once",
            1,
            0,
            InsertOptions {
                init_page: true,
                ..Default::default()
            },
        )
        .unwrap();

    let mut replayed = replay(&harness.wal);
    let first = replayed_page(&mut replayed, rnode, ForkNumber::Main, 0);

    // Replaying again on the same pool skips pages already at the LSN; only
    // the undo side is rebuilt, and it rewrites identical bytes.
    let records = harness.wal.records().unwrap();
    {
        let dir = tempdir().unwrap();
        let registry = UndoLogRegistry::create(UndoLogRegistryOptions::new(dir.path()));
        let mut staging = PreparedUndo::new_for_recovery();
        let mut fsm = FreeSpaceMap::new();
        let mut vm = VisibilityMap::new();
        let mut ctx = RedoContext::new(
            &mut replayed.pool,
            &registry,
            &mut staging,
            &mut fsm,
            &mut vm,
        );
        for record in &records {
            redo(&mut ctx, record).unwrap();
        }
    }

    let second = replayed_page(&mut replayed, rnode, ForkNumber::Main, 0);
    assert_eq!(first, second);
}

#[test]
fn update_reports_free_space_when_page_runs_low() {
    let mut harness = Harness::new();
    let rnode = test_rel();

    harness
        .session(100)
        .insert(
            rnode,
            0,
            b"seed",
            1,
            0,
            InsertOptions {
                init_page: true,
                ..Default::default()
            },
        )
        .unwrap();
    harness
        .session(100)
        .insert(
            rnode,
            1,
            &vec![7u8; 12000],
            1,
            0,
            InsertOptions {
                init_page: true,
                ..Default::default()
            },
        )
        .unwrap();

    // Non-in-place update into the nearly-full page 1.
    harness
        .session(100)
        .update(rnode, 0, 1, 1, 2, &vec![8u8; 1200], 0, false)
        .unwrap();

    let free = harness.fsm.free_space(rnode, 1);
    assert!(free.is_some(), "FSM must learn about the shrunken page");
    assert!(free.unwrap() < undine::heap::ops::FSM_THRESHOLD);

    // Replay feeds the standby FSM the same way.
    let replayed = replay(&harness.wal);
    assert_eq!(replayed.fsm.free_space(rnode, 1), free);
}

#[test]
fn slot_references_survive_crash_for_every_trans_slot() {
    let mut harness = Harness::new();
    let rnode = test_rel();

    harness
        .session(100)
        .insert(
            rnode,
            0,
            b"s0",
            1,
            0,
            InsertOptions {
                init_page: true,
                ..Default::default()
            },
        )
        .unwrap();
    for slot in 1..PAGE_TRANS_SLOTS {
        harness
            .session(100 + slot as u32)
            .insert(
                rnode,
                0,
                &[slot; 4],
                slot as u16 + 1,
                slot,
                InsertOptions::default(),
            )
            .unwrap();
    }

    let mut replayed = replay(&harness.wal);
    assert_pages_match(&mut harness, &mut replayed, rnode, ForkNumber::Main, 0);

    let page = harness.page_copy(rnode, ForkNumber::Main, 0);
    for slot in 0..PAGE_TRANS_SLOTS {
        let entry = trans_slot(&page, slot).unwrap();
        assert_eq!(entry.xid, 100 + slot as u32);
        assert_ne!(entry.urec_ptr, 0);
    }
}
