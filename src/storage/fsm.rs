//! # Free-Space Map and Visibility Map
//!
//! Thin service interfaces consumed by the heap operations and the redo
//! handlers. The production engine backs these with their own page-oriented
//! structures; this layer needs only the contract:
//!
//! - the FSM learns about a page's free space when an operation leaves it
//!   below a fifth of the page size, so future inserts can find room
//! - the visibility map's all-visible bit must be cleared by any
//!   modification, even when the data page itself is already up to date
//!   during replay
//!
//! Both are keyed by `(RelFileNode, BlockNumber)`.

use hashbrown::{HashMap, HashSet};

use super::{BlockNumber, RelFileNode};

#[derive(Debug, Default)]
pub struct FreeSpaceMap {
    entries: HashMap<(RelFileNode, BlockNumber), usize>,
}

impl FreeSpaceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_page_free_space(
        &mut self,
        rnode: RelFileNode,
        block: BlockNumber,
        freespace: usize,
    ) {
        self.entries.insert((rnode, block), freespace);
    }

    pub fn free_space(&self, rnode: RelFileNode, block: BlockNumber) -> Option<usize> {
        self.entries.get(&(rnode, block)).copied()
    }
}

#[derive(Debug, Default)]
pub struct VisibilityMap {
    all_visible: HashSet<(RelFileNode, BlockNumber)>,
}

impl VisibilityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_all_visible(&mut self, rnode: RelFileNode, block: BlockNumber) {
        self.all_visible.insert((rnode, block));
    }

    pub fn is_all_visible(&self, rnode: RelFileNode, block: BlockNumber) -> bool {
        self.all_visible.contains(&(rnode, block))
    }

    pub fn clear_all_visible(&mut self, rnode: RelFileNode, block: BlockNumber) {
        self.all_visible.remove(&(rnode, block));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fsm_records_and_reads_back() {
        let mut fsm = FreeSpaceMap::new();
        let rnode = RelFileNode::new(0, 7);
        assert_eq!(fsm.free_space(rnode, 3), None);

        fsm.record_page_free_space(rnode, 3, 1200);
        assert_eq!(fsm.free_space(rnode, 3), Some(1200));

        fsm.record_page_free_space(rnode, 3, 800);
        assert_eq!(fsm.free_space(rnode, 3), Some(800));
    }

    #[test]
    fn visibility_map_set_and_clear() {
        let mut vm = VisibilityMap::new();
        let rnode = RelFileNode::new(0, 7);

        assert!(!vm.is_all_visible(rnode, 0));
        vm.set_all_visible(rnode, 0);
        assert!(vm.is_all_visible(rnode, 0));
        vm.clear_all_visible(rnode, 0);
        assert!(!vm.is_all_visible(rnode, 0));
    }
}
