//! # WAL Record Model
//!
//! The write-ahead log stream consumed by the redo dispatcher. Each record
//! carries an opcode, the acting transaction, opaque main data (the undo
//! header plus op-specific headers), and up to four block references with
//! per-block payloads. Records that are a log's first after a checkpoint
//! additionally embed the undo log's metadata image so recovery can rebuild
//! allocator state.
//!
//! ## Frame Format
//!
//! ```text
//! Offset  Size  Field
//! 0       4     total_len (bytes from `info` through checksum)
//! 4       1     info (opcode | flags)
//! 5       4     xid
//! 9       1     n_blocks
//! 10      1     has_undo_meta
//! 11      4     main_len
//! 15      ...   main data
//!         per block:
//!           4   tsid, 4 relnode, 1 fork, 1 has_image, 4 block, 4 data_len,
//!           ... data, [16384-byte full-page image]
//!         [52]  undo log meta image
//! end     8     CRC-64/ECMA over everything from `info`
//! ```
//!
//! A record's LSN is its end position in the stream, mirroring how the page
//! stamping side identifies "the WAL position of the last change".
//!
//! ## Scope
//!
//! The production WAL writer (group commit, segment switching, torn-write
//! protection) lives a layer below; this model pins down the record
//! *contents* both sides must agree on, and `WalStream` provides the
//! in-order append/replay surface the engine and its tests run against.

pub mod records;
pub mod redo;

pub use redo::{redo, replay_all, RedoContext};

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{bail, ensure, Result};
use smallvec::SmallVec;

use crate::storage::{BlockNumber, ForkNumber, RelFileNode, TransactionId, PAGE_SIZE};
use crate::undo::UndoLogMetaImage;
use zerocopy::IntoBytes;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

pub const MAX_WAL_BLOCK_REFS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalBlockRef {
    pub rnode: RelFileNode,
    pub fork: ForkNumber,
    pub block: BlockNumber,
    pub data: Vec<u8>,
    /// Full-page image; replay restores it instead of re-running the op.
    pub image: Option<Vec<u8>>,
}

impl WalBlockRef {
    pub fn new(rnode: RelFileNode, fork: ForkNumber, block: BlockNumber) -> Self {
        Self {
            rnode,
            fork,
            block,
            data: Vec::new(),
            image: None,
        }
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WalRecord {
    pub info: u8,
    pub xid: TransactionId,
    /// Epoch of `xid`; replay stamps it into transaction slots.
    pub xid_epoch: u32,
    /// End position of the record in the stream; assigned on append.
    pub lsn: u64,
    pub main_data: Vec<u8>,
    pub blocks: SmallVec<[WalBlockRef; MAX_WAL_BLOCK_REFS]>,
    pub undo_meta: Option<UndoLogMetaImage>,
}

impl WalRecord {
    pub fn new(info: u8, xid: TransactionId) -> Self {
        Self {
            info,
            xid,
            xid_epoch: 0,
            lsn: 0,
            main_data: Vec::new(),
            blocks: SmallVec::new(),
            undo_meta: None,
        }
    }

    pub fn opcode(&self) -> u8 {
        self.info & records::XLOG_OPMASK
    }

    pub fn is_init_page(&self) -> bool {
        self.info & records::XLOG_INIT_PAGE != 0
    }

    pub fn add_block(&mut self, block: WalBlockRef) -> usize {
        debug_assert!(self.blocks.len() < MAX_WAL_BLOCK_REFS);
        self.blocks.push(block);
        self.blocks.len() - 1
    }

    pub fn has_block_ref(&self, idx: usize) -> bool {
        idx < self.blocks.len()
    }

    pub fn block_ref(&self, idx: usize) -> Result<&WalBlockRef> {
        self.blocks
            .get(idx)
            .ok_or_else(|| eyre::eyre!("WAL record has no block reference {}", idx))
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.extend_from_slice(&0u32.to_le_bytes()); // patched below

        let body_start = out.len();
        out.push(self.info);
        out.extend_from_slice(&self.xid.to_le_bytes());
        out.extend_from_slice(&self.xid_epoch.to_le_bytes());
        out.push(self.blocks.len() as u8);
        out.push(self.undo_meta.is_some() as u8);
        out.extend_from_slice(&(self.main_data.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.main_data);

        for blk in &self.blocks {
            out.extend_from_slice(&blk.rnode.tsid.to_le_bytes());
            out.extend_from_slice(&blk.rnode.relnode.to_le_bytes());
            out.push(blk.fork as u8);
            out.push(blk.image.is_some() as u8);
            out.extend_from_slice(&blk.block.to_le_bytes());
            out.extend_from_slice(&(blk.data.len() as u32).to_le_bytes());
            out.extend_from_slice(&blk.data);
            if let Some(image) = &blk.image {
                debug_assert_eq!(image.len(), PAGE_SIZE);
                out.extend_from_slice(image);
            }
        }

        if let Some(meta) = &self.undo_meta {
            out.extend_from_slice(meta.as_bytes());
        }

        let checksum = CRC64.checksum(&out[body_start..]);
        out.extend_from_slice(&checksum.to_le_bytes());

        let total_len = (out.len() - body_start) as u32;
        out[start..start + 4].copy_from_slice(&total_len.to_le_bytes());
    }

    fn decode_from(buf: &[u8], pos: usize) -> Result<(WalRecord, usize)> {
        ensure!(buf.len() >= pos + 4, "WAL stream truncated at {}", pos);
        let total_len =
            u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
        let body_start = pos + 4;
        let end = body_start + total_len;
        ensure!(buf.len() >= end, "WAL record at {} extends past stream end", pos);

        let stored = u64::from_le_bytes(buf[end - 8..end].try_into().unwrap());
        let computed = CRC64.checksum(&buf[body_start..end - 8]);
        ensure!(
            stored == computed,
            "WAL record checksum mismatch at {}: {:#x} != {:#x}",
            pos,
            computed,
            stored
        );

        fn take<'a>(
            buf: &'a [u8],
            cursor: &mut usize,
            limit: usize,
            n: usize,
        ) -> Result<&'a [u8]> {
            ensure!(*cursor + n <= limit, "WAL record truncated at {}", *cursor);
            let slice = &buf[*cursor..*cursor + n];
            *cursor += n;
            Ok(slice)
        }

        let mut cur = body_start;
        let limit = end - 8;
        let mut take = |n: usize| take(buf, &mut cur, limit, n);

        let info = take(1)?[0];
        let xid = u32::from_le_bytes(take(4)?.try_into().unwrap());
        let xid_epoch = u32::from_le_bytes(take(4)?.try_into().unwrap());
        let n_blocks = take(1)?[0] as usize;
        ensure!(
            n_blocks <= MAX_WAL_BLOCK_REFS,
            "WAL record claims {} block refs",
            n_blocks
        );
        let has_meta = take(1)?[0] != 0;
        let main_len = u32::from_le_bytes(take(4)?.try_into().unwrap()) as usize;
        let main_data = take(main_len)?.to_vec();

        let mut blocks = SmallVec::new();
        for _ in 0..n_blocks {
            let tsid = u32::from_le_bytes(take(4)?.try_into().unwrap());
            let relnode = u32::from_le_bytes(take(4)?.try_into().unwrap());
            let fork = ForkNumber::from_byte(take(1)?[0]);
            let has_image = take(1)?[0] != 0;
            let block = u32::from_le_bytes(take(4)?.try_into().unwrap());
            let data_len = u32::from_le_bytes(take(4)?.try_into().unwrap()) as usize;
            let data = take(data_len)?.to_vec();
            let image = if has_image {
                Some(take(PAGE_SIZE)?.to_vec())
            } else {
                None
            };
            blocks.push(WalBlockRef {
                rnode: RelFileNode::new(tsid, relnode),
                fork,
                block,
                data,
                image,
            });
        }

        let undo_meta = if has_meta {
            let image: &UndoLogMetaImage = crate::storage::parse_zerocopy(
                take(crate::undo::UNDO_LOG_META_IMAGE_SIZE)?,
                "UndoLogMetaImage",
            )?;
            Some(*image)
        } else {
            None
        };

        drop(take);
        if cur != limit {
            bail!("WAL record at {} has {} trailing bytes", pos, limit - cur);
        }

        Ok((
            WalRecord {
                info,
                xid,
                xid_epoch,
                lsn: end as u64,
                main_data,
                blocks,
                undo_meta,
            },
            end,
        ))
    }
}

/// Append-only record stream: the WAL writer surface the engine runs
/// against. Appending assigns the record's LSN (its end position).
#[derive(Debug, Default)]
pub struct WalStream {
    buf: Vec<u8>,
}

impl WalStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, record: &mut WalRecord) -> u64 {
        record.encode_into(&mut self.buf);
        record.lsn = self.buf.len() as u64;
        record.lsn
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Decodes the whole stream back into records, LSNs included.
    pub fn records(&self) -> Result<Vec<WalRecord>> {
        let mut records = Vec::new();
        let mut pos = 0;
        while pos < self.buf.len() {
            let (record, next) = WalRecord::decode_from(&self.buf, pos)?;
            records.push(record);
            pos = next;
        }
        Ok(records)
    }
}
