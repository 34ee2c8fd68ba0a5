//! # Storage Module
//!
//! This module provides the page and buffer layer that both the heap access
//! method and the undo log subsystem are built on. Everything in Undine is
//! page-oriented: data files, undo segments and TPD overflow pages use the
//! same 16KB page with the same 24-byte header.
//!
//! ## Page Addressing
//!
//! A page is identified by a `BufferTag`:
//!
//! ```text
//! (RelFileNode, ForkNumber, BlockNumber)
//! ```
//!
//! `RelFileNode` pairs a tablespace id with a file node number. Undo logs
//! reuse the same addressing: an undo log's pages live in the pseudo-relation
//! whose node number is the log number, under the undo fork.
//!
//! ## Safety Model
//!
//! On-disk structs with a fixed layout use `zerocopy` for safe transmutation
//! from page bytes. Variable-layout structures (undo records) instead use
//! manual little-endian parsing on length-validated slices, which is safe on
//! architectures that require alignment.
//!
//! ## Module Organization
//!
//! - `page`: the shared 24-byte page header and initialization helpers
//! - `bufpool`: pin/lock/dirty buffer pool with redo read modes
//! - `fsm`: free-space map and visibility map service interfaces
//!
//! ## Thread Safety
//!
//! `BufferPool` is `Send` but not `Sync`; concurrent access goes through a
//! session layer that owns the pool behind its own synchronization. The
//! recovery path is single-threaded by design.

mod bufpool;
mod fsm;
mod page;

pub use bufpool::{Buffer, BufferPool, BufferTag, LockMode, ReadMode, RedoAction};
pub use fsm::{FreeSpaceMap, VisibilityMap};
pub use page::{page_init, validate_page, PageHeader, PD_PRUNABLE};

use eyre::{ensure, Result};
use zerocopy::{FromBytes, Immutable, KnownLayout};

pub const PAGE_SIZE: usize = 16384;
pub const PAGE_HEADER_SIZE: usize = 24;
pub const PAGE_USABLE_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

pub type BlockNumber = u32;
pub type OffsetNumber = u16;
pub type TransactionId = u32;
pub type CommandId = u32;

pub const INVALID_BLOCK_NUMBER: BlockNumber = u32::MAX;
pub const INVALID_OFFSET_NUMBER: OffsetNumber = 0;
pub const FIRST_OFFSET_NUMBER: OffsetNumber = 1;
pub const INVALID_TRANSACTION_ID: TransactionId = 0;
pub const FIRST_COMMAND_ID: CommandId = 0;

pub const DEFAULT_TABLESPACE_ID: u32 = 0;

/// Identifies the physical file a page belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RelFileNode {
    pub tsid: u32,
    pub relnode: u32,
}

impl RelFileNode {
    pub fn new(tsid: u32, relnode: u32) -> Self {
        Self { tsid, relnode }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ForkNumber {
    #[default]
    Main = 0,
    Undo = 1,
}

impl ForkNumber {
    pub fn from_byte(b: u8) -> Self {
        match b {
            1 => ForkNumber::Undo,
            _ => ForkNumber::Main,
        }
    }
}

/// Parses a zerocopy struct from a byte slice with size validation.
#[inline]
pub fn parse_zerocopy<'a, T: FromBytes + KnownLayout + Immutable>(
    bytes: &'a [u8],
    type_name: &str,
) -> Result<&'a T> {
    let size = std::mem::size_of::<T>();
    ensure!(
        bytes.len() >= size,
        "buffer too small for {}: {} < {}",
        type_name,
        bytes.len(),
        size
    );
    T::ref_from_bytes(&bytes[..size])
        .map_err(|e| eyre::eyre!("failed to parse {}: {:?}", type_name, e))
}

/// Parses a mutable zerocopy struct from a byte slice with size validation.
#[inline]
pub fn parse_zerocopy_mut<'a, T: FromBytes + KnownLayout + zerocopy::IntoBytes>(
    bytes: &'a mut [u8],
    type_name: &str,
) -> Result<&'a mut T> {
    let size = std::mem::size_of::<T>();
    ensure!(
        bytes.len() >= size,
        "buffer too small for {}: {} < {}",
        type_name,
        bytes.len(),
        size
    );
    T::mut_from_bytes(&mut bytes[..size])
        .map_err(|e| eyre::eyre!("failed to parse {}: {:?}", type_name, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fork_number_from_byte() {
        assert_eq!(ForkNumber::from_byte(0), ForkNumber::Main);
        assert_eq!(ForkNumber::from_byte(1), ForkNumber::Undo);
        assert_eq!(ForkNumber::from_byte(7), ForkNumber::Main);
    }

    #[test]
    fn rel_file_node_equality() {
        let a = RelFileNode::new(0, 42);
        let b = RelFileNode::new(0, 42);
        let c = RelFileNode::new(1, 42);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn usable_size_excludes_header() {
        assert_eq!(PAGE_USABLE_SIZE, PAGE_SIZE - PAGE_HEADER_SIZE);
    }
}
