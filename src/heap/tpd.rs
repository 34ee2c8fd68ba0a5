//! # TPD Overflow Pages
//!
//! When every inline transaction slot on a heap page is held by a still-live
//! transaction, additional slots spill to a *transaction page directory*
//! (TPD) page. A TPD slot is addressed by a slot id at or above the inline
//! array size; the heap page's WAL records carry the TPD page as an extra
//! block reference so replay can update it alongside the data page.
//!
//! ## Layout
//!
//! A TPD page is the shared page header followed by a dense array of
//! 16-byte slot entries, identical in shape to the inline slots. Slot id
//! `PAGE_TRANS_SLOTS + i` maps to entry `i`.
//!
//! The production directory also maintains a per-offset map from tuples to
//! overflow slots; down here the tuple header's slot byte carries that
//! mapping, so the page stores only the slot entries themselves.

use eyre::{ensure, Result};

use crate::storage::{page_init, PageHeader, TransactionId, PAGE_HEADER_SIZE, PAGE_SIZE};
use crate::undo::UndoRecPtr;

use super::page::{TransSlot, PAGE_TRANS_SLOTS, TRANS_SLOT_SIZE};

/// Overflow slots one TPD page can hold.
pub const TPD_PAGE_SLOTS: usize = (PAGE_SIZE - PAGE_HEADER_SIZE) / TRANS_SLOT_SIZE;

pub fn tpd_page_init(page: &mut [u8]) -> Result<()> {
    page_init(page, 0)?;
    let header = PageHeader::from_bytes_mut(page)?;
    header.set_upper(PAGE_SIZE as u16);
    header.set_lower(PAGE_HEADER_SIZE as u16);
    Ok(())
}

fn entry_pos(slot: u8) -> Result<usize> {
    ensure!(
        slot >= PAGE_TRANS_SLOTS,
        "slot {} is an inline slot, not a TPD slot",
        slot
    );
    let idx = (slot - PAGE_TRANS_SLOTS) as usize;
    ensure!(idx < TPD_PAGE_SLOTS, "TPD slot {} out of range", slot);
    Ok(PAGE_HEADER_SIZE + idx * TRANS_SLOT_SIZE)
}

pub fn tpd_slot(page: &[u8], slot: u8) -> Result<TransSlot> {
    let pos = entry_pos(slot)?;
    let slice = &page[pos..pos + TRANS_SLOT_SIZE];
    Ok(TransSlot {
        xid_epoch: u32::from_le_bytes(slice[0..4].try_into().unwrap()),
        xid: u32::from_le_bytes(slice[4..8].try_into().unwrap()),
        urec_ptr: u64::from_le_bytes(slice[8..16].try_into().unwrap()),
    })
}

pub fn tpd_set_slot(page: &mut [u8], slot: u8, value: TransSlot) -> Result<()> {
    let pos = entry_pos(slot)?;
    let slice = &mut page[pos..pos + TRANS_SLOT_SIZE];
    slice[0..4].copy_from_slice(&value.xid_epoch.to_le_bytes());
    slice[4..8].copy_from_slice(&value.xid.to_le_bytes());
    slice[8..16].copy_from_slice(&value.urec_ptr.to_le_bytes());
    Ok(())
}

/// Stamps an overflow slot with the transaction and its newest undo
/// pointer, the TPD counterpart of the heap page's slot update.
pub fn tpd_page_set_undo(
    page: &mut [u8],
    slot: u8,
    xid_epoch: u32,
    xid: TransactionId,
    urec_ptr: UndoRecPtr,
) -> Result<()> {
    tpd_set_slot(
        page,
        slot,
        TransSlot {
            xid_epoch,
            xid,
            urec_ptr,
        },
    )
}
