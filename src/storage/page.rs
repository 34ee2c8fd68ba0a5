//! # Page Header Layout
//!
//! Every 16KB page begins with a 24-byte header shared by heap pages, undo
//! pages and TPD overflow pages.
//!
//! ## Page Header Layout (24 bytes)
//!
//! ```text
//! Offset  Size  Field      Description
//! ------  ----  ---------  ----------------------------------------
//! 0       8     lsn        WAL position of the last change to this page
//! 8       2     checksum   Page checksum (computed at flush time)
//! 10      2     flags      Page status bits (prunable, all-visible)
//! 12      2     lower      Offset to start of free space
//! 14      2     upper      Offset to end of free space
//! 16      2     special    Offset to start of the special area
//! 18      2     version    Page layout version
//! 20      4     prune_xid  Oldest xid with deleted storage on this page
//! ```
//!
//! Heap pages grow an item-id array upward from `lower` and tuple storage
//! downward from `upper`; the special area at the end of the page holds the
//! transaction slot array. Undo pages have no item ids: records are framed
//! byte streams starting at the end of the header, and `lower`/`upper` are
//! unused there.
//!
//! ## Flags
//!
//! - `PD_PRUNABLE`: at least one item on this page has deleted storage and a
//!   prune pass may reclaim space (`prune_xid` holds the oldest such xid)
//! - `PD_ALL_VISIBLE`: every tuple on the page is visible to all snapshots;
//!   cleared by any modification
//!
//! ## Zero-Copy Access
//!
//! The header uses `zerocopy` little-endian wrapper types so it can be read
//! and updated directly inside an unaligned page buffer.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{parse_zerocopy, parse_zerocopy_mut, TransactionId, PAGE_HEADER_SIZE, PAGE_SIZE};

pub const PAGE_LAYOUT_VERSION: u16 = 1;

pub const PD_PRUNABLE: u16 = 0x0001;
pub const PD_ALL_VISIBLE: u16 = 0x0002;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PageHeader {
    lsn: U64,
    checksum: U16,
    flags: U16,
    lower: U16,
    upper: U16,
    special: U16,
    version: U16,
    prune_xid: U32,
}

const _: () = assert!(std::mem::size_of::<PageHeader>() == PAGE_HEADER_SIZE);

impl PageHeader {
    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        parse_zerocopy(data, "PageHeader")
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        parse_zerocopy_mut(data, "PageHeader")
    }

    pub fn lsn(&self) -> u64 {
        self.lsn.get()
    }

    pub fn set_lsn(&mut self, lsn: u64) {
        self.lsn = U64::new(lsn);
    }

    pub fn checksum(&self) -> u16 {
        self.checksum.get()
    }

    pub fn set_checksum(&mut self, checksum: u16) {
        self.checksum = U16::new(checksum);
    }

    pub fn lower(&self) -> u16 {
        self.lower.get()
    }

    pub fn set_lower(&mut self, offset: u16) {
        self.lower = U16::new(offset);
    }

    pub fn upper(&self) -> u16 {
        self.upper.get()
    }

    pub fn set_upper(&mut self, offset: u16) {
        self.upper = U16::new(offset);
    }

    pub fn special(&self) -> u16 {
        self.special.get()
    }

    pub fn set_special(&mut self, offset: u16) {
        self.special = U16::new(offset);
    }

    pub fn version(&self) -> u16 {
        self.version.get()
    }

    pub fn set_version(&mut self, version: u16) {
        self.version = U16::new(version);
    }

    pub fn prune_xid(&self) -> u32 {
        self.prune_xid.get()
    }

    pub fn free_space(&self) -> usize {
        (self.upper.get() as usize).saturating_sub(self.lower.get() as usize)
    }

    pub fn is_prunable(&self) -> bool {
        self.flags.get() & PD_PRUNABLE != 0
    }

    /// Records that this page has reclaimable storage left behind by `xid`.
    /// Keeps the oldest such xid so a prune pass knows when it may run.
    pub fn set_prunable(&mut self, xid: TransactionId) {
        let current = self.prune_xid.get();
        if self.flags.get() & PD_PRUNABLE == 0 || xid < current {
            self.prune_xid = U32::new(xid);
        }
        self.flags = U16::new(self.flags.get() | PD_PRUNABLE);
    }

    pub fn clear_prunable(&mut self) {
        self.flags = U16::new(self.flags.get() & !PD_PRUNABLE);
        self.prune_xid = U32::new(0);
    }

    pub fn is_all_visible(&self) -> bool {
        self.flags.get() & PD_ALL_VISIBLE != 0
    }

    pub fn set_all_visible(&mut self) {
        self.flags = U16::new(self.flags.get() | PD_ALL_VISIBLE);
    }

    pub fn clear_all_visible(&mut self) {
        self.flags = U16::new(self.flags.get() & !PD_ALL_VISIBLE);
    }
}

/// Initializes a page: zeroes it and writes a fresh header whose free space
/// spans everything between the header and the special area.
pub fn page_init(page: &mut [u8], special_size: usize) -> Result<()> {
    ensure!(
        page.len() == PAGE_SIZE,
        "invalid page size: {} != {}",
        page.len(),
        PAGE_SIZE
    );
    ensure!(
        special_size <= PAGE_SIZE - PAGE_HEADER_SIZE,
        "special area too large: {}",
        special_size
    );

    page.fill(0);

    let special = (PAGE_SIZE - special_size) as u16;
    let header = PageHeader::from_bytes_mut(page)?;
    header.set_lower(PAGE_HEADER_SIZE as u16);
    header.set_upper(special);
    header.set_special(special);
    header.set_version(PAGE_LAYOUT_VERSION);
    Ok(())
}

pub fn validate_page(data: &[u8]) -> Result<()> {
    ensure!(
        data.len() == PAGE_SIZE,
        "invalid page size: {} != {}",
        data.len(),
        PAGE_SIZE
    );

    let header = PageHeader::from_bytes(data)?;

    let is_zeroed = header.lower() == 0 && header.upper() == 0 && header.special() == 0;
    if is_zeroed {
        return Ok(());
    }

    ensure!(
        header.lower() >= PAGE_HEADER_SIZE as u16,
        "lower {} < PAGE_HEADER_SIZE {}",
        header.lower(),
        PAGE_HEADER_SIZE
    );

    ensure!(
        header.lower() <= header.upper(),
        "lower {} > upper {}",
        header.lower(),
        header.upper()
    );

    ensure!(
        header.upper() <= header.special(),
        "upper {} > special {}",
        header.upper(),
        header.special()
    );

    ensure!(
        header.special() as usize <= PAGE_SIZE,
        "special {} > PAGE_SIZE {}",
        header.special(),
        PAGE_SIZE
    );

    Ok(())
}
