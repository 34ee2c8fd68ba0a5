//! # Buffer Pool
//!
//! This module implements the buffer access layer the engine runs on: pages
//! are pinned, locked, read, dirtied and released through opaque `Buffer`
//! handles. The pool models storage as sparse: a page that has never been
//! written reads as zeroes, matching the behavior of freshly created segment
//! files.
//!
//! ## Access Protocol
//!
//! ```text
//! read_buffer(tag, mode)  -> Buffer      (pins the page)
//! lock_buffer(buf, mode)                 (share or exclusive)
//! page(buf) / page_mut(buf)              (raw 16KB slice)
//! mark_dirty(buf)
//! unlock_buffer(buf) / release(buf)      (or unlock_release in one step)
//! ```
//!
//! Undo insertion is append-only, so a caller that knows it is writing the
//! first byte of a page passes `ReadMode::Zero` and skips a useless read of
//! the old page contents.
//!
//! ## Redo Reads
//!
//! Replay acquires buffers through dedicated entry points that compare the
//! page LSN against the WAL record being replayed:
//!
//! - `read_buffer_for_redo`: returns `NeedsRedo` when the page is older than
//!   the record, `Restored` when the page already carries the change (or was
//!   restored from a full-page image), and `NotFound` when the page was never
//!   created.
//! - `init_buffer_for_redo`: zeroes the page unconditionally; used when the
//!   record carries an init-page flag.
//!
//! ## Lock Discipline
//!
//! The pool runs single-threaded per session (and single-threaded in
//! recovery), so locks do not block; they track state and enforce the
//! pin -> lock -> unlock -> release protocol with debug assertions. Buffers
//! staged for undo insertion are always locked in pin order, which keeps
//! concurrent writers (on distinct logs) deadlock-free.

use eyre::{ensure, Result};
use hashbrown::HashMap;

use super::{BlockNumber, ForkNumber, PageHeader, RelFileNode, PAGE_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferTag {
    pub rnode: RelFileNode,
    pub fork: ForkNumber,
    pub block: BlockNumber,
}

impl BufferTag {
    pub fn new(rnode: RelFileNode, fork: ForkNumber, block: BlockNumber) -> Self {
        Self { rnode, fork, block }
    }
}

/// Opaque handle to a pinned page frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Buffer(u32);

impl Buffer {
    pub const INVALID: Buffer = Buffer(u32::MAX);

    pub fn is_valid(&self) -> bool {
        *self != Buffer::INVALID
    }

    fn index(&self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Read the current page contents.
    Normal,
    /// The caller will overwrite from the first byte; skip reading.
    Zero,
}

/// Outcome of preparing a buffer for replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedoAction {
    NeedsRedo,
    Restored,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockState {
    Unlocked,
    Shared(u32),
    Exclusive,
}

struct Frame {
    tag: BufferTag,
    page: Vec<u8>,
    pin_count: u32,
    lock: LockState,
    dirty: bool,
}

pub struct BufferPool {
    frames: Vec<Frame>,
    tag_map: HashMap<BufferTag, usize>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            frames: Vec::new(),
            tag_map: HashMap::new(),
        }
    }

    pub fn contains(&self, tag: BufferTag) -> bool {
        self.tag_map.contains_key(&tag)
    }

    /// Pins the page identified by `tag`, creating a zeroed frame if the
    /// page has never been written.
    pub fn read_buffer(&mut self, tag: BufferTag, mode: ReadMode) -> Result<Buffer> {
        let idx = match self.tag_map.get(&tag) {
            Some(&idx) => {
                if mode == ReadMode::Zero {
                    self.frames[idx].page.fill(0);
                }
                idx
            }
            None => {
                let idx = self.frames.len();
                self.frames.push(Frame {
                    tag,
                    page: vec![0u8; PAGE_SIZE],
                    pin_count: 0,
                    lock: LockState::Unlocked,
                    dirty: false,
                });
                self.tag_map.insert(tag, idx);
                idx
            }
        };
        self.frames[idx].pin_count += 1;
        Ok(Buffer(idx as u32))
    }

    pub fn lock_buffer(&mut self, buf: Buffer, mode: LockMode) {
        let frame = &mut self.frames[buf.index()];
        debug_assert!(frame.pin_count > 0, "locking an unpinned buffer");
        frame.lock = match (frame.lock, mode) {
            (LockState::Unlocked, LockMode::Shared) => LockState::Shared(1),
            (LockState::Shared(n), LockMode::Shared) => LockState::Shared(n + 1),
            (LockState::Unlocked, LockMode::Exclusive) => LockState::Exclusive,
            (state, _) => {
                debug_assert!(false, "lock conflict on buffer {:?}: {:?}", buf, state);
                state
            }
        };
    }

    pub fn unlock_buffer(&mut self, buf: Buffer) {
        let frame = &mut self.frames[buf.index()];
        frame.lock = match frame.lock {
            LockState::Shared(n) if n > 1 => LockState::Shared(n - 1),
            _ => LockState::Unlocked,
        };
    }

    pub fn release(&mut self, buf: Buffer) {
        let frame = &mut self.frames[buf.index()];
        debug_assert!(frame.pin_count > 0, "releasing an unpinned buffer");
        frame.pin_count -= 1;
    }

    pub fn unlock_release(&mut self, buf: Buffer) {
        self.unlock_buffer(buf);
        self.release(buf);
    }

    pub fn mark_dirty(&mut self, buf: Buffer) {
        self.frames[buf.index()].dirty = true;
    }

    pub fn is_dirty(&self, buf: Buffer) -> bool {
        self.frames[buf.index()].dirty
    }

    pub fn tag(&self, buf: Buffer) -> BufferTag {
        self.frames[buf.index()].tag
    }

    pub fn block_number(&self, buf: Buffer) -> BlockNumber {
        self.frames[buf.index()].tag.block
    }

    pub fn page(&self, buf: Buffer) -> &[u8] {
        &self.frames[buf.index()].page
    }

    pub fn page_mut(&mut self, buf: Buffer) -> &mut [u8] {
        &mut self.frames[buf.index()].page
    }

    pub fn page_lsn(&self, buf: Buffer) -> u64 {
        PageHeader::from_bytes(self.page(buf))
            .map(|h| h.lsn())
            .unwrap_or(0)
    }

    pub fn set_page_lsn(&mut self, buf: Buffer, lsn: u64) {
        if let Ok(header) = PageHeader::from_bytes_mut(self.page_mut(buf)) {
            header.set_lsn(lsn);
        }
    }

    /// Acquires a buffer for replay of a WAL record stamped `rec_lsn`. If
    /// `image` carries a full-page image it is restored when the page is
    /// behind the record. Returns `NotFound` for pages that were never
    /// created (the relation was truncated or dropped later in the WAL).
    pub fn read_buffer_for_redo(
        &mut self,
        tag: BufferTag,
        rec_lsn: u64,
        image: Option<&[u8]>,
    ) -> Result<(RedoAction, Buffer)> {
        if !self.contains(tag) && image.is_none() {
            return Ok((RedoAction::NotFound, Buffer::INVALID));
        }

        let buf = self.read_buffer(tag, ReadMode::Normal)?;
        self.lock_buffer(buf, LockMode::Exclusive);

        if let Some(image) = image {
            ensure!(
                image.len() == PAGE_SIZE,
                "full-page image has wrong size: {}",
                image.len()
            );
            if self.page_lsn(buf) < rec_lsn {
                self.page_mut(buf).copy_from_slice(image);
                self.set_page_lsn(buf, rec_lsn);
                self.mark_dirty(buf);
                return Ok((RedoAction::Restored, buf));
            }
            return Ok((RedoAction::Restored, buf));
        }

        if self.page_lsn(buf) >= rec_lsn {
            return Ok((RedoAction::Restored, buf));
        }

        Ok((RedoAction::NeedsRedo, buf))
    }

    /// Acquires a buffer for replay of a record that reinitializes the page.
    pub fn init_buffer_for_redo(&mut self, tag: BufferTag) -> Result<Buffer> {
        let buf = self.read_buffer(tag, ReadMode::Zero)?;
        self.lock_buffer(buf, LockMode::Exclusive);
        Ok(buf)
    }

    #[cfg(test)]
    pub fn pin_count(&self, buf: Buffer) -> u32 {
        self.frames[buf.index()].pin_count
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page_init;

    fn tag(block: BlockNumber) -> BufferTag {
        BufferTag::new(RelFileNode::new(0, 1), ForkNumber::Main, block)
    }

    #[test]
    fn read_buffer_creates_zeroed_frame() {
        let mut pool = BufferPool::new();
        let buf = pool.read_buffer(tag(0), ReadMode::Normal).unwrap();
        assert!(pool.page(buf).iter().all(|&b| b == 0));
        assert_eq!(pool.pin_count(buf), 1);
    }

    #[test]
    fn read_buffer_same_tag_same_frame() {
        let mut pool = BufferPool::new();
        let buf1 = pool.read_buffer(tag(5), ReadMode::Normal).unwrap();
        let buf2 = pool.read_buffer(tag(5), ReadMode::Normal).unwrap();
        assert_eq!(buf1, buf2);
        assert_eq!(pool.pin_count(buf1), 2);
    }

    #[test]
    fn zero_mode_clears_existing_contents() {
        let mut pool = BufferPool::new();
        let buf = pool.read_buffer(tag(0), ReadMode::Normal).unwrap();
        pool.page_mut(buf)[100] = 0xAB;
        pool.release(buf);

        let buf = pool.read_buffer(tag(0), ReadMode::Zero).unwrap();
        assert_eq!(pool.page(buf)[100], 0);
    }

    #[test]
    fn release_drops_pin() {
        let mut pool = BufferPool::new();
        let buf = pool.read_buffer(tag(0), ReadMode::Normal).unwrap();
        pool.release(buf);
        assert_eq!(pool.pin_count(buf), 0);
    }

    #[test]
    fn dirty_tracking() {
        let mut pool = BufferPool::new();
        let buf = pool.read_buffer(tag(0), ReadMode::Normal).unwrap();
        assert!(!pool.is_dirty(buf));
        pool.mark_dirty(buf);
        assert!(pool.is_dirty(buf));
    }

    #[test]
    fn page_lsn_roundtrip() {
        let mut pool = BufferPool::new();
        let buf = pool.read_buffer(tag(0), ReadMode::Normal).unwrap();
        page_init(pool.page_mut(buf), 0).unwrap();
        pool.set_page_lsn(buf, 12345);
        assert_eq!(pool.page_lsn(buf), 12345);
    }

    #[test]
    fn redo_read_missing_page_is_not_found() {
        let mut pool = BufferPool::new();
        let (action, buf) = pool.read_buffer_for_redo(tag(9), 100, None).unwrap();
        assert_eq!(action, RedoAction::NotFound);
        assert!(!buf.is_valid());
    }

    #[test]
    fn redo_read_stale_page_needs_redo() {
        let mut pool = BufferPool::new();
        let buf = pool.read_buffer(tag(0), ReadMode::Normal).unwrap();
        page_init(pool.page_mut(buf), 0).unwrap();
        pool.set_page_lsn(buf, 50);
        pool.release(buf);

        let (action, buf) = pool.read_buffer_for_redo(tag(0), 100, None).unwrap();
        assert_eq!(action, RedoAction::NeedsRedo);
        assert!(buf.is_valid());
        pool.unlock_release(buf);
    }

    #[test]
    fn redo_read_current_page_is_restored() {
        let mut pool = BufferPool::new();
        let buf = pool.read_buffer(tag(0), ReadMode::Normal).unwrap();
        page_init(pool.page_mut(buf), 0).unwrap();
        pool.set_page_lsn(buf, 200);
        pool.release(buf);

        let (action, buf) = pool.read_buffer_for_redo(tag(0), 100, None).unwrap();
        assert_eq!(action, RedoAction::Restored);
        pool.unlock_release(buf);
    }

    #[test]
    fn redo_read_applies_full_page_image() {
        let mut pool = BufferPool::new();
        let mut image = vec![0u8; PAGE_SIZE];
        page_init(&mut image, 0).unwrap();
        image[4096] = 0x7E;

        let (action, buf) = pool.read_buffer_for_redo(tag(3), 77, Some(&image)).unwrap();
        assert_eq!(action, RedoAction::Restored);
        assert_eq!(pool.page(buf)[4096], 0x7E);
        assert_eq!(pool.page_lsn(buf), 77);
        pool.unlock_release(buf);
    }

    #[test]
    fn init_buffer_for_redo_zeroes_page() {
        let mut pool = BufferPool::new();
        let buf = pool.read_buffer(tag(0), ReadMode::Normal).unwrap();
        pool.page_mut(buf)[0] = 0xFF;
        pool.release(buf);

        let buf = pool.init_buffer_for_redo(tag(0)).unwrap();
        assert!(pool.page(buf).iter().all(|&b| b == 0));
        pool.unlock_release(buf);
    }
}
