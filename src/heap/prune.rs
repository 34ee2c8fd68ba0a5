//! # Page Pruning
//!
//! Executes the deleted -> dead -> unused transitions on a heap page and
//! repairs fragmentation afterwards. Pruning itself emits no undo: the
//! transitions only apply to tuples whose fate is already decided, so the
//! operation is replayed purely from the WAL record's offset arrays.
//!
//! A tuple's storage can be reclaimed as soon as its deletion is all
//! visible; the item id then parks the deleting transaction's slot so
//! lagging snapshots can still reach the undo chain. Dead items await index
//! cleanup; unused items are free for reuse.

use eyre::Result;

use crate::storage::OffsetNumber;

use super::page::{item_id, repair_fragmentation, set_item_id};

/// Applies the three transition classes to the page and defragments it.
///
/// - `deleted`: `(offset, trans_slot)` pairs whose storage is reclaimed,
///   parking the slot in the item id
/// - `nowdead`: items that become dead stubs
/// - `nowunused`: items freed entirely
pub fn prune_execute(
    page: &mut [u8],
    deleted: &[(OffsetNumber, u8)],
    nowdead: &[OffsetNumber],
    nowunused: &[OffsetNumber],
) -> Result<()> {
    for &(offnum, trans_slot) in deleted {
        let mut item = item_id(page, offnum)?;
        item.set_deleted(trans_slot);
        set_item_id(page, offnum, item)?;
    }

    for &offnum in nowdead {
        let mut item = item_id(page, offnum)?;
        item.set_dead();
        set_item_id(page, offnum, item)?;
    }

    for &offnum in nowunused {
        let mut item = item_id(page, offnum)?;
        item.set_unused();
        set_item_id(page, offnum, item)?;
    }

    repair_fragmentation(page)
}
