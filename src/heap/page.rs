//! # Heap Page Layout
//!
//! A heap page is the shared 24-byte page header, an item id array growing
//! upward, tuple storage growing downward, and a special area at the end
//! holding the transaction slot array:
//!
//! ```text
//! +--------------------+
//! | PageHeader (24B)   |
//! +--------------------+
//! | ItemId array       |   <- grows up from `lower`
//! | (4 bytes each)     |
//! +--------------------+
//! | free space         |
//! +--------------------+
//! | tuple storage      |   <- grows down from `upper`
//! +--------------------+
//! | TransSlot[4] (64B) |   <- special area
//! +--------------------+
//! ```
//!
//! ## Item Ids
//!
//! Each item id packs a 15-bit offset, 2-bit flags and 15-bit length into
//! 4 bytes:
//!
//! ```text
//! Bits 0-14   offset of the tuple within the page
//! Bits 15-16  flags: 0 unused, 1 normal, 2 deleted, 3 dead
//! Bits 17-31  tuple length
//! ```
//!
//! Deleted items give up their storage but keep the transaction slot that
//! deleted them in the length field, so visibility checks can still find
//! the deleting transaction. Dead and unused items carry nothing.
//!
//! ## Transaction Slots
//!
//! Each of the four inline slots stores `(xid_epoch, xid, urec_ptr)`: the
//! last undo record pointer created by that transaction on this page.
//! Tuples name their slot by index. When every inline slot is held by a
//! live transaction, additional slots spill to a TPD overflow page.

use eyre::{bail, ensure, Result};

use crate::storage::{
    page_init, OffsetNumber, PageHeader, TransactionId, PAGE_HEADER_SIZE,
};
use crate::undo::UndoRecPtr;

pub const ITEM_ID_SIZE: usize = 4;

pub const LP_UNUSED: u8 = 0;
pub const LP_NORMAL: u8 = 1;
pub const LP_DELETED: u8 = 2;
pub const LP_DEAD: u8 = 3;

pub const PAGE_TRANS_SLOTS: u8 = 4;
pub const TRANS_SLOT_SIZE: usize = 16;
pub const TRANS_SLOTS_AREA_SIZE: usize = PAGE_TRANS_SLOTS as usize * TRANS_SLOT_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemId {
    pub off: u16,
    pub flags: u8,
    pub len: u16,
}

impl ItemId {
    pub fn unused() -> Self {
        Self {
            off: 0,
            flags: LP_UNUSED,
            len: 0,
        }
    }

    pub fn normal(off: u16, len: u16) -> Self {
        Self {
            off,
            flags: LP_NORMAL,
            len,
        }
    }

    fn from_word(word: u32) -> Self {
        Self {
            off: (word & 0x7FFF) as u16,
            flags: ((word >> 15) & 0x3) as u8,
            len: ((word >> 17) & 0x7FFF) as u16,
        }
    }

    fn to_word(self) -> u32 {
        (self.off as u32 & 0x7FFF)
            | ((self.flags as u32 & 0x3) << 15)
            | ((self.len as u32 & 0x7FFF) << 17)
    }

    pub fn is_used(&self) -> bool {
        self.flags != LP_UNUSED
    }

    pub fn is_normal(&self) -> bool {
        self.flags == LP_NORMAL
    }

    pub fn is_dead(&self) -> bool {
        self.flags == LP_DEAD
    }

    pub fn is_deleted(&self) -> bool {
        self.flags == LP_DELETED
    }

    pub fn set_dead(&mut self) {
        *self = Self {
            off: 0,
            flags: LP_DEAD,
            len: 0,
        };
    }

    /// Marks the item deleted: storage is forfeit, but the transaction slot
    /// that deleted it is parked in the length field for visibility checks.
    pub fn set_deleted(&mut self, trans_slot: u8) {
        *self = Self {
            off: 0,
            flags: LP_DELETED,
            len: trans_slot as u16,
        };
    }

    pub fn set_unused(&mut self) {
        *self = Self::unused();
    }

    /// Marks the item unused while parking the transaction slot that freed
    /// it in the offset field, so a rollback can reconnect it.
    pub fn set_unused_extended(&mut self, trans_slot: u8) {
        *self = Self {
            off: trans_slot as u16,
            flags: LP_UNUSED,
            len: 0,
        };
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransSlot {
    pub xid_epoch: u32,
    pub xid: TransactionId,
    pub urec_ptr: UndoRecPtr,
}

impl TransSlot {
    fn from_bytes(slice: &[u8]) -> Self {
        debug_assert!(slice.len() >= TRANS_SLOT_SIZE);
        Self {
            xid_epoch: u32::from_le_bytes(slice[0..4].try_into().unwrap()),
            xid: u32::from_le_bytes(slice[4..8].try_into().unwrap()),
            urec_ptr: u64::from_le_bytes(slice[8..16].try_into().unwrap()),
        }
    }

    fn write_to(&self, slice: &mut [u8]) {
        debug_assert!(slice.len() >= TRANS_SLOT_SIZE);
        slice[0..4].copy_from_slice(&self.xid_epoch.to_le_bytes());
        slice[4..8].copy_from_slice(&self.xid.to_le_bytes());
        slice[8..16].copy_from_slice(&self.urec_ptr.to_le_bytes());
    }
}

/// Initializes a heap page with an empty item array and zeroed slots.
pub fn heap_page_init(page: &mut [u8]) -> Result<()> {
    page_init(page, TRANS_SLOTS_AREA_SIZE)
}

pub fn max_offset_number(page: &[u8]) -> OffsetNumber {
    let header = match PageHeader::from_bytes(page) {
        Ok(h) => h,
        Err(_) => return 0,
    };
    let lower = header.lower() as usize;
    if lower <= PAGE_HEADER_SIZE {
        0
    } else {
        ((lower - PAGE_HEADER_SIZE) / ITEM_ID_SIZE) as OffsetNumber
    }
}

fn item_id_pos(offnum: OffsetNumber) -> usize {
    debug_assert!(offnum >= 1);
    PAGE_HEADER_SIZE + (offnum as usize - 1) * ITEM_ID_SIZE
}

pub fn item_id(page: &[u8], offnum: OffsetNumber) -> Result<ItemId> {
    ensure!(
        offnum >= 1 && offnum <= max_offset_number(page),
        "item offset {} out of range (max {})",
        offnum,
        max_offset_number(page)
    );
    let pos = item_id_pos(offnum);
    let word = u32::from_le_bytes(page[pos..pos + 4].try_into().unwrap());
    Ok(ItemId::from_word(word))
}

pub fn set_item_id(page: &mut [u8], offnum: OffsetNumber, item: ItemId) -> Result<()> {
    ensure!(
        offnum >= 1 && offnum <= max_offset_number(page),
        "item offset {} out of range (max {})",
        offnum,
        max_offset_number(page)
    );
    let pos = item_id_pos(offnum);
    page[pos..pos + 4].copy_from_slice(&item.to_word().to_le_bytes());
    Ok(())
}

pub fn page_get_item<'a>(page: &'a [u8], item: &ItemId) -> &'a [u8] {
    &page[item.off as usize..item.off as usize + item.len as usize]
}

/// Free bytes between the item array and tuple storage.
pub fn page_free_space(page: &[u8]) -> usize {
    PageHeader::from_bytes(page)
        .map(|h| h.free_space())
        .unwrap_or(0)
}

/// Adds a tuple at `offnum` (or the next free offset when zero), placing
/// the bytes at the top of the free space. With `overwrite`, an existing
/// unused item id at that offset is reused.
pub fn page_add_item(
    page: &mut [u8],
    data: &[u8],
    offnum: OffsetNumber,
    overwrite: bool,
) -> Result<OffsetNumber> {
    ensure!(!data.is_empty(), "cannot add an empty tuple");
    ensure!(
        data.len() <= super::MAX_TUPLE_SIZE,
        "tuple of {} bytes exceeds maximum {}",
        data.len(),
        super::MAX_TUPLE_SIZE
    );

    let maxoff = max_offset_number(page);
    let offnum = if offnum == 0 { maxoff + 1 } else { offnum };
    ensure!(
        offnum <= maxoff + 1,
        "item offset {} beyond end of item array (max {})",
        offnum,
        maxoff
    );

    let needs_new_item = offnum == maxoff + 1;
    if !needs_new_item {
        let existing = item_id(page, offnum)?;
        ensure!(
            overwrite && !existing.is_used(),
            "item offset {} already in use",
            offnum
        );
    }

    let header = PageHeader::from_bytes_mut(page)?;
    let lower = header.lower() as usize;
    let upper = header.upper() as usize;

    let needed = data.len() + if needs_new_item { ITEM_ID_SIZE } else { 0 };
    if upper.saturating_sub(lower) < needed {
        bail!(
            "page full: need {} bytes, have {}",
            needed,
            upper.saturating_sub(lower)
        );
    }

    let new_upper = upper - data.len();
    header.set_upper(new_upper as u16);
    if needs_new_item {
        header.set_lower((lower + ITEM_ID_SIZE) as u16);
    }

    page[new_upper..new_upper + data.len()].copy_from_slice(data);
    set_item_id(
        page,
        offnum,
        ItemId::normal(new_upper as u16, data.len() as u16),
    )?;

    Ok(offnum)
}

/// Replaces the storage of an existing normal item in place. Growing takes
/// the extra bytes from the free space; shrinking leaves a reclaimable gap.
pub fn page_replace_item(
    page: &mut [u8],
    offnum: OffsetNumber,
    data: &[u8],
) -> Result<()> {
    let mut item = item_id(page, offnum)?;
    ensure!(item.is_normal(), "cannot replace a non-normal item");
    ensure!(
        data.len() <= super::MAX_TUPLE_SIZE,
        "tuple of {} bytes exceeds maximum {}",
        data.len(),
        super::MAX_TUPLE_SIZE
    );

    let old_len = item.len as usize;
    if data.len() > old_len {
        let header = PageHeader::from_bytes_mut(page)?;
        let lower = header.lower() as usize;
        let upper = header.upper() as usize;
        ensure!(
            upper - lower >= data.len(),
            "page full: in-place growth needs {} bytes, have {}",
            data.len(),
            upper - lower
        );

        // Move the tuple to freshly carved space; the old storage becomes a
        // hole for the next defragmentation pass.
        let new_off = upper - data.len();
        header.set_upper(new_off as u16);
        page[new_off..new_off + data.len()].copy_from_slice(data);
        item.off = new_off as u16;
        item.len = data.len() as u16;
    } else {
        let off = item.off as usize;
        page[off..off + data.len()].copy_from_slice(data);
        item.len = data.len() as u16;
    }
    set_item_id(page, offnum, item)?;
    Ok(())
}

fn trans_slot_pos(page: &[u8], slot: u8) -> Result<usize> {
    ensure!(
        slot < PAGE_TRANS_SLOTS,
        "transaction slot {} beyond inline array",
        slot
    );
    let header = PageHeader::from_bytes(page)?;
    Ok(header.special() as usize + slot as usize * TRANS_SLOT_SIZE)
}

pub fn trans_slot(page: &[u8], slot: u8) -> Result<TransSlot> {
    let pos = trans_slot_pos(page, slot)?;
    Ok(TransSlot::from_bytes(&page[pos..pos + TRANS_SLOT_SIZE]))
}

pub fn set_trans_slot(page: &mut [u8], slot: u8, value: TransSlot) -> Result<()> {
    let pos = trans_slot_pos(page, slot)?;
    value.write_to(&mut page[pos..pos + TRANS_SLOT_SIZE]);
    Ok(())
}

/// Stamps the slot with the transaction and its newest undo pointer; this
/// is how a page remembers where its rollback information lives.
pub fn page_set_undo(
    page: &mut [u8],
    slot: u8,
    xid_epoch: u32,
    xid: TransactionId,
    urec_ptr: UndoRecPtr,
) -> Result<()> {
    set_trans_slot(
        page,
        slot,
        TransSlot {
            xid_epoch,
            xid,
            urec_ptr,
        },
    )
}

/// Compacts tuple storage so all free space is contiguous. Item offsets are
/// updated; item order is unchanged.
pub fn repair_fragmentation(page: &mut [u8]) -> Result<()> {
    let maxoff = max_offset_number(page);
    let special = PageHeader::from_bytes(page)?.special() as usize;

    // Gather live storage, highest offset first, and slide it to the end.
    let mut live: Vec<(OffsetNumber, ItemId)> = Vec::new();
    for offnum in 1..=maxoff {
        let item = item_id(page, offnum)?;
        if item.is_normal() {
            live.push((offnum, item));
        }
    }
    live.sort_by(|a, b| b.1.off.cmp(&a.1.off));

    let mut upper = special;
    for (offnum, mut item) in live {
        let len = item.len as usize;
        upper -= len;
        let old = item.off as usize;
        page.copy_within(old..old + len, upper);
        item.off = upper as u16;
        set_item_id(page, offnum, item)?;
    }

    let header = PageHeader::from_bytes_mut(page)?;
    header.set_upper(upper as u16);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PAGE_SIZE;

    fn fresh_page() -> Vec<u8> {
        let mut page = vec![0u8; PAGE_SIZE];
        heap_page_init(&mut page).unwrap();
        page
    }

    #[test]
    fn item_id_word_roundtrip() {
        let item = ItemId {
            off: 0x7ABC,
            flags: LP_DELETED,
            len: 0x1234,
        };
        assert_eq!(ItemId::from_word(item.to_word()), item);
    }

    #[test]
    fn init_leaves_slot_area() {
        let page = fresh_page();
        let header = PageHeader::from_bytes(&page).unwrap();
        assert_eq!(
            header.special() as usize,
            PAGE_SIZE - TRANS_SLOTS_AREA_SIZE
        );
        assert_eq!(max_offset_number(&page), 0);
        for slot in 0..PAGE_TRANS_SLOTS {
            assert_eq!(trans_slot(&page, slot).unwrap(), TransSlot::default());
        }
    }

    #[test]
    fn add_item_at_first_offset() {
        let mut page = fresh_page();
        let offnum = page_add_item(&mut page, b"hello tuple", 1, false).unwrap();
        assert_eq!(offnum, 1);
        assert_eq!(max_offset_number(&page), 1);

        let item = item_id(&page, 1).unwrap();
        assert!(item.is_normal());
        assert_eq!(page_get_item(&page, &item), b"hello tuple");
    }

    #[test]
    fn add_item_appends_when_offnum_zero() {
        let mut page = fresh_page();
        page_add_item(&mut page, b"a", 0, false).unwrap();
        let second = page_add_item(&mut page, b"b", 0, false).unwrap();
        assert_eq!(second, 2);
    }

    #[test]
    fn add_item_rejects_gap_beyond_max() {
        let mut page = fresh_page();
        let result = page_add_item(&mut page, b"x", 5, false).unwrap_err();
        assert!(result.to_string().contains("beyond end"));
    }

    #[test]
    fn add_item_rejects_used_offset() {
        let mut page = fresh_page();
        page_add_item(&mut page, b"x", 1, false).unwrap();
        assert!(page_add_item(&mut page, b"y", 1, true).is_err());
    }

    #[test]
    fn add_item_reuses_unused_offset_with_overwrite() {
        let mut page = fresh_page();
        page_add_item(&mut page, b"x", 1, false).unwrap();
        page_add_item(&mut page, b"y", 2, false).unwrap();

        let mut item = item_id(&page, 1).unwrap();
        item.set_unused();
        set_item_id(&mut page, 1, item).unwrap();

        let offnum = page_add_item(&mut page, b"z", 1, true).unwrap();
        assert_eq!(offnum, 1);
        let item = item_id(&page, 1).unwrap();
        assert_eq!(page_get_item(&page, &item), b"z");
    }

    #[test]
    fn add_item_fails_when_page_full() {
        let mut page = fresh_page();
        let big = vec![7u8; 8000];
        page_add_item(&mut page, &big, 0, false).unwrap();
        page_add_item(&mut page, &big, 0, false).unwrap();
        let result = page_add_item(&mut page, &big, 0, false);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("page full"));
    }

    #[test]
    fn replace_item_in_place_same_size() {
        let mut page = fresh_page();
        page_add_item(&mut page, b"aaaa", 1, false).unwrap();
        page_replace_item(&mut page, 1, b"bbbb").unwrap();
        let item = item_id(&page, 1).unwrap();
        assert_eq!(page_get_item(&page, &item), b"bbbb");
    }

    #[test]
    fn replace_item_growing_moves_storage() {
        let mut page = fresh_page();
        page_add_item(&mut page, b"aaaa", 1, false).unwrap();
        let before = item_id(&page, 1).unwrap();

        page_replace_item(&mut page, 1, b"cccccccc").unwrap();
        let after = item_id(&page, 1).unwrap();
        assert_eq!(after.len, 8);
        assert!(after.off < before.off);
        assert_eq!(page_get_item(&page, &after), b"cccccccc");
    }

    #[test]
    fn replace_item_shrinking_keeps_offset() {
        let mut page = fresh_page();
        page_add_item(&mut page, b"dddddddd", 1, false).unwrap();
        let before = item_id(&page, 1).unwrap();

        page_replace_item(&mut page, 1, b"dd").unwrap();
        let after = item_id(&page, 1).unwrap();
        assert_eq!(after.off, before.off);
        assert_eq!(after.len, 2);
    }

    #[test]
    fn trans_slot_roundtrip() {
        let mut page = fresh_page();
        let slot = TransSlot {
            xid_epoch: 1,
            xid: 100,
            urec_ptr: 0xDEAD_BEEF,
        };
        set_trans_slot(&mut page, 2, slot).unwrap();
        assert_eq!(trans_slot(&page, 2).unwrap(), slot);
        assert_eq!(trans_slot(&page, 0).unwrap(), TransSlot::default());
    }

    #[test]
    fn trans_slot_out_of_range() {
        let page = fresh_page();
        assert!(trans_slot(&page, PAGE_TRANS_SLOTS).is_err());
    }

    #[test]
    fn page_set_undo_updates_slot() {
        let mut page = fresh_page();
        page_set_undo(&mut page, 0, 1, 100, 0x42).unwrap();
        let slot = trans_slot(&page, 0).unwrap();
        assert_eq!(slot.xid, 100);
        assert_eq!(slot.urec_ptr, 0x42);
    }

    #[test]
    fn repair_fragmentation_compacts_storage() {
        let mut page = fresh_page();
        page_add_item(&mut page, &[1u8; 100], 1, false).unwrap();
        page_add_item(&mut page, &[2u8; 100], 2, false).unwrap();
        page_add_item(&mut page, &[3u8; 100], 3, false).unwrap();
        let free_before = page_free_space(&page);

        // Kill the middle tuple and defragment.
        let mut item = item_id(&page, 2).unwrap();
        item.set_dead();
        set_item_id(&mut page, 2, item).unwrap();
        repair_fragmentation(&mut page).unwrap();

        assert_eq!(page_free_space(&page), free_before + 100);
        let i1 = item_id(&page, 1).unwrap();
        let i3 = item_id(&page, 3).unwrap();
        assert_eq!(page_get_item(&page, &i1), &[1u8; 100]);
        assert_eq!(page_get_item(&page, &i3), &[3u8; 100]);
    }

    #[test]
    fn deleted_item_parks_slot_in_len() {
        let mut item = ItemId::normal(100, 50);
        item.set_deleted(3);
        assert!(item.is_deleted());
        assert_eq!(item.len, 3);
        assert_eq!(item.off, 0);
    }
}
