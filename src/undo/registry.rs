//! # Undo Log Registry and Allocator
//!
//! Process-wide table of active undo logs. Sessions attach to a log of the
//! persistence class they are writing (gaining exclusive write access),
//! reserve address space record by record, and detach when done. At each
//! checkpoint the full registry is written to a snapshot file so that crash
//! recovery starts from consistent log metadata.
//!
//! ## Allocation Protocol
//!
//! ```text
//! attach(persistence)            -> exclusive writer on some log
//! allocate(log, size)            -> UndoRecPtr (+ meta image, first time
//!                                   after a checkpoint)
//! ... pin buffers, write WAL ...
//! advance_insert(log, urp, size) -> commits the reservation
//! ```
//!
//! `allocate` never moves `insert`; it only reserves the space and extends
//! the log with new 1MB segment files when the record would cross `end`.
//! Between `allocate` and `advance_insert` no other writer can touch the log
//! (single writer per log), so the reservation cannot be overtaken.
//!
//! ## Recovery
//!
//! During replay there is exactly one writer: the replayer. It reproduces
//! the foreground allocations through `allocate_in_recovery`, which consults
//! a map from xid to log number. The map is seeded by the log meta images
//! embedded in WAL records (one per log and checkpoint) and extended as new
//! xids appear; this reproduces the exact undo addresses of the original
//! run, which redo handlers verify against the WAL-embedded pointers.
//!
//! ## Checkpoint Snapshot Format
//!
//! ```text
//! Offset  Size  Field
//! 0       8     Magic "UNDOMETA"
//! 8       4     Version
//! 12      4     Log count
//! 16      52*n  UndoLogMetaImage per log
//! end     8     CRC-64/ECMA checksum of all preceding bytes
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{bail, ensure, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use zerocopy::IntoBytes;

use crate::storage::TransactionId;

use super::log::{
    create_undo_segment, remove_discarded_segments, UndoLogControl, UndoLogMeta, UndoLogMetaImage,
    UNDO_LOG_META_IMAGE_SIZE, UNDO_SEGMENT_SIZE,
};
use super::{
    make_undo_rec_ptr, offset_physical_end, offset_plus_usable_bytes, urp_offset, UndoLogNumber,
    UndoPersistence, UndoRecPtr, MAX_UNDO_LOG_OFFSET, UNDO_PERSISTENCE_LEVELS,
};

const SNAPSHOT_MAGIC: &[u8; 8] = b"UNDOMETA";
const SNAPSHOT_VERSION: u32 = 1;
const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

#[derive(Debug, Clone)]
pub struct UndoLogRegistryOptions {
    pub dir: PathBuf,
}

impl UndoLogRegistryOptions {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

struct RegistryInner {
    logs: HashMap<UndoLogNumber, Arc<UndoLogControl>>,
    next_logno: UndoLogNumber,
}

struct RecoveryState {
    xid_to_log: HashMap<TransactionId, UndoLogNumber>,
    active_log: [Option<UndoLogNumber>; UNDO_PERSISTENCE_LEVELS],
}

pub struct UndoLogRegistry {
    options: UndoLogRegistryOptions,
    inner: RwLock<RegistryInner>,
    recovery: Mutex<RecoveryState>,
}

impl UndoLogRegistry {
    pub fn create(options: UndoLogRegistryOptions) -> Self {
        Self {
            options,
            inner: RwLock::new(RegistryInner {
                logs: HashMap::new(),
                next_logno: 1,
            }),
            recovery: Mutex::new(RecoveryState {
                xid_to_log: HashMap::new(),
                active_log: [None; UNDO_PERSISTENCE_LEVELS],
            }),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.options.dir
    }

    pub fn get(&self, logno: UndoLogNumber) -> Option<Arc<UndoLogControl>> {
        self.inner.read().logs.get(&logno).cloned()
    }

    pub fn log_count(&self) -> usize {
        self.inner.read().logs.len()
    }

    fn all_logs(&self) -> Vec<Arc<UndoLogControl>> {
        let mut logs: Vec<_> = self.inner.read().logs.values().cloned().collect();
        logs.sort_by_key(|l| l.logno);
        logs
    }

    /// Attaches the calling session to a log it may exclusively write,
    /// creating one if every suitable log is taken or exhausted.
    pub fn attach(
        &self,
        persistence: UndoPersistence,
        tsid: u32,
    ) -> Result<Arc<UndoLogControl>> {
        {
            let inner = self.inner.read();
            for log in inner.logs.values() {
                if log.persistence == persistence
                    && log.tsid == tsid
                    && !log.is_attached()
                    && log.meta().insert < MAX_UNDO_LOG_OFFSET - UNDO_SEGMENT_SIZE
                    && log.try_attach()
                {
                    return Ok(log.clone());
                }
            }
        }

        let mut inner = self.inner.write();
        let logno = inner.next_logno;
        inner.next_logno += 1;

        let meta = UndoLogMeta::new(logno, tsid, persistence);
        let log = Arc::new(UndoLogControl::new(meta));
        log.set_oldest_data(make_undo_rec_ptr(logno, meta.discard));
        let attached = log.try_attach();
        debug_assert!(attached);
        inner.logs.insert(logno, log.clone());
        Ok(log)
    }

    pub fn detach(&self, log: &UndoLogControl) {
        log.detach();
    }

    /// Reserves `size` usable bytes at the log's insert pointer, creating
    /// segment files first if the record would cross `end`. Returns the undo
    /// record pointer and, on the first allocation after a checkpoint, the
    /// log's meta image for the caller to embed in its WAL record.
    pub fn allocate(
        &self,
        log: &UndoLogControl,
        size: usize,
    ) -> Result<(UndoRecPtr, Option<UndoLogMetaImage>)> {
        let (urp, segments_needed) = log.update_meta(|meta| {
            let physical_end = offset_physical_end(meta.insert, size);
            let mut segments = Vec::new();
            let mut end = meta.end;
            while end < physical_end {
                segments.push(end);
                end += UNDO_SEGMENT_SIZE;
            }
            (make_undo_rec_ptr(meta.logno, meta.insert), segments)
        });

        ensure!(
            urp_offset(urp) + size as u64 <= MAX_UNDO_LOG_OFFSET,
            "undo log {} exhausted",
            log.logno
        );

        for segstart in segments_needed {
            create_undo_segment(&self.options.dir, log.logno, log.tsid, segstart)
                .wrap_err("failed to extend undo log")?;
            log.update_meta(|meta| meta.end = segstart + UNDO_SEGMENT_SIZE);
        }

        let image = if log.persistence == UndoPersistence::Permanent && log.take_meta_image_due()
        {
            Some(UndoLogMetaImage::from_meta(&log.meta()))
        } else {
            None
        };

        Ok((urp, image))
    }

    /// Commits a reservation made by `allocate` once the caller has pinned
    /// every buffer the record will span.
    pub fn advance_insert(&self, log: &UndoLogControl, urp: UndoRecPtr, size: usize) {
        log.update_meta(|meta| {
            debug_assert_eq!(meta.insert, urp_offset(urp), "allocation overtaken");
            meta.insert = offset_plus_usable_bytes(urp_offset(urp), size);
        });
    }

    /// True when replay has not yet seen an allocation for `xid`.
    pub fn is_transaction_first_rec(&self, xid: TransactionId) -> bool {
        !self.recovery.lock().xid_to_log.contains_key(&xid)
    }

    /// Restores a log's metadata from a WAL-embedded image during replay and
    /// makes that log the replay target for its persistence class.
    pub fn restore_recovery_meta(&self, image: &UndoLogMetaImage) {
        let meta = image.to_meta();
        let mut inner = self.inner.write();

        match inner.logs.get(&meta.logno) {
            Some(log) => {
                log.update_meta(|m| *m = meta);
                log.set_oldest_data(make_undo_rec_ptr(meta.logno, meta.discard));
            }
            None => {
                let log = Arc::new(UndoLogControl::new(meta));
                log.set_oldest_data(make_undo_rec_ptr(meta.logno, meta.discard));
                inner.logs.insert(meta.logno, log);
            }
        }
        if inner.next_logno <= meta.logno {
            inner.next_logno = meta.logno + 1;
        }
        drop(inner);

        let mut recovery = self.recovery.lock();
        recovery.active_log[meta.persistence.index()] = Some(meta.logno);
    }

    /// Mirrors `allocate` during replay, consulting the xid-to-log map so
    /// that the same undo addresses are reproduced.
    pub fn allocate_in_recovery(
        &self,
        xid: TransactionId,
        size: usize,
        persistence: UndoPersistence,
    ) -> Result<UndoRecPtr> {
        let logno = {
            let mut recovery = self.recovery.lock();
            match recovery.xid_to_log.get(&xid) {
                Some(&logno) => logno,
                None => {
                    let Some(logno) = recovery.active_log[persistence.index()] else {
                        bail!(
                            "no undo log known for persistence {:?} during recovery",
                            persistence
                        );
                    };
                    recovery.xid_to_log.insert(xid, logno);
                    logno
                }
            }
        };

        let Some(log) = self.get(logno) else {
            bail!("undo log {} vanished during recovery", logno);
        };
        let (urp, _) = self.allocate(&log, size)?;
        Ok(urp)
    }

    /// The log the replayer would currently allocate from for `xid`.
    pub fn recovery_log_for_xid(
        &self,
        xid: TransactionId,
        persistence: UndoPersistence,
    ) -> Option<Arc<UndoLogControl>> {
        let recovery = self.recovery.lock();
        let logno = recovery
            .xid_to_log
            .get(&xid)
            .copied()
            .or(recovery.active_log[persistence.index()])?;
        drop(recovery);
        self.get(logno)
    }

    /// Advances the discard pointer, reclaiming whole segments behind it.
    /// Callers guarantee no live snapshot or rollback needs the bytes.
    pub fn discard(&self, log: &UndoLogControl, new_discard: UndoRecPtr) -> Result<u32> {
        let _guard = log.discard_lock.write();

        let new_offset = urp_offset(new_discard);
        let old_offset = log.update_meta(|meta| {
            let old = meta.discard;
            meta.discard = meta.discard.max(new_offset.min(meta.insert));
            old
        });
        log.set_oldest_data(make_undo_rec_ptr(log.logno, log.meta().discard));

        let old_segstart = (old_offset / UNDO_SEGMENT_SIZE) * UNDO_SEGMENT_SIZE;
        remove_discarded_segments(
            &self.options.dir,
            log.logno,
            log.tsid,
            old_segstart,
            log.meta().discard,
        )
    }

    fn snapshot_path(&self, lsn: u64) -> PathBuf {
        self.options.dir.join("pg_undo").join(format!("{:016X}", lsn))
    }

    /// Writes the checkpoint snapshot of every log's metadata and re-arms
    /// the once-per-checkpoint WAL meta images.
    pub fn checkpoint(&self, lsn: u64) -> Result<PathBuf> {
        let logs = self.all_logs();

        let mut buf = Vec::with_capacity(16 + logs.len() * UNDO_LOG_META_IMAGE_SIZE + 8);
        buf.extend_from_slice(SNAPSHOT_MAGIC);
        buf.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        buf.extend_from_slice(&(logs.len() as u32).to_le_bytes());
        for log in &logs {
            let image = UndoLogMetaImage::from_meta(&log.meta());
            buf.extend_from_slice(image.as_bytes());
        }
        let checksum = CRC64.checksum(&buf);
        buf.extend_from_slice(&checksum.to_le_bytes());

        let path = self.snapshot_path(lsn);
        let dir = path.parent().unwrap();
        std::fs::create_dir_all(dir)
            .wrap_err_with(|| format!("failed to create snapshot directory {:?}", dir))?;
        std::fs::write(&path, &buf)
            .wrap_err_with(|| format!("failed to write undo meta snapshot {:?}", path))?;

        for log in &logs {
            log.reset_meta_logged();
        }
        Ok(path)
    }

    /// Loads the registry from the snapshot taken at `lsn`, making each
    /// restored log the replay target for its persistence class.
    pub fn load_checkpoint(&self, lsn: u64) -> Result<usize> {
        let path = self.snapshot_path(lsn);
        let buf = std::fs::read(&path)
            .wrap_err_with(|| format!("failed to read undo meta snapshot {:?}", path))?;

        ensure!(buf.len() >= 24, "undo meta snapshot truncated: {}", buf.len());
        ensure!(
            &buf[0..8] == SNAPSHOT_MAGIC,
            "invalid magic in undo meta snapshot"
        );
        let version = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        ensure!(
            version == SNAPSHOT_VERSION,
            "unsupported undo meta snapshot version: {}",
            version
        );

        let payload_end = buf.len() - 8;
        let stored = u64::from_le_bytes(buf[payload_end..].try_into().unwrap());
        let computed = CRC64.checksum(&buf[..payload_end]);
        ensure!(
            stored == computed,
            "undo meta snapshot checksum mismatch: {:#x} != {:#x}",
            computed,
            stored
        );

        let count = u32::from_le_bytes(buf[12..16].try_into().unwrap()) as usize;
        ensure!(
            payload_end == 16 + count * UNDO_LOG_META_IMAGE_SIZE,
            "undo meta snapshot length mismatch"
        );

        for i in 0..count {
            let start = 16 + i * UNDO_LOG_META_IMAGE_SIZE;
            let image: &UndoLogMetaImage = crate::storage::parse_zerocopy(
                &buf[start..start + UNDO_LOG_META_IMAGE_SIZE],
                "UndoLogMetaImage",
            )?;
            self.restore_recovery_meta(image);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{PAGE_HEADER_SIZE, PAGE_SIZE};
    use crate::undo::UNDO_LOG_FIRST_OFFSET;
    use tempfile::tempdir;

    fn registry(dir: &Path) -> UndoLogRegistry {
        UndoLogRegistry::create(UndoLogRegistryOptions::new(dir))
    }

    #[test]
    fn attach_creates_log_and_is_exclusive() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path());

        let log = reg.attach(UndoPersistence::Permanent, 0).unwrap();
        assert_eq!(log.logno, 1);
        assert!(log.is_attached());

        // A second session cannot share the log.
        let other = reg.attach(UndoPersistence::Permanent, 0).unwrap();
        assert_eq!(other.logno, 2);

        reg.detach(&log);
        let third = reg.attach(UndoPersistence::Permanent, 0).unwrap();
        assert_eq!(third.logno, 1);
    }

    #[test]
    fn attach_separates_persistence_classes() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path());

        let perm = reg.attach(UndoPersistence::Permanent, 0).unwrap();
        let temp = reg.attach(UndoPersistence::Temp, 0).unwrap();
        assert_ne!(perm.logno, temp.logno);
    }

    #[test]
    fn allocate_reserves_without_moving_insert() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path());
        let log = reg.attach(UndoPersistence::Permanent, 0).unwrap();

        let (urp, _) = reg.allocate(&log, 100).unwrap();
        assert_eq!(urp_offset(urp), UNDO_LOG_FIRST_OFFSET);
        assert_eq!(log.meta().insert, UNDO_LOG_FIRST_OFFSET);

        reg.advance_insert(&log, urp, 100);
        assert_eq!(log.meta().insert, UNDO_LOG_FIRST_OFFSET + 100);
    }

    #[test]
    fn insert_advances_by_exact_expected_size() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path());
        let log = reg.attach(UndoPersistence::Permanent, 0).unwrap();

        for size in [1usize, 57, 200, 4000] {
            let before = log.meta().insert;
            let (urp, _) = reg.allocate(&log, size).unwrap();
            reg.advance_insert(&log, urp, size);
            let after = log.meta().insert;
            assert_eq!(after, offset_plus_usable_bytes(before, size));
        }
    }

    #[test]
    fn allocate_creates_first_segment() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path());
        let log = reg.attach(UndoPersistence::Permanent, 0).unwrap();

        let (_, _) = reg.allocate(&log, 64).unwrap();
        assert_eq!(log.meta().end, UNDO_SEGMENT_SIZE);
        let seg = dir.path().join("base/undo/000001.0000000000");
        assert!(seg.exists());
    }

    #[test]
    fn allocate_extends_across_segment_boundary() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path());
        let log = reg.attach(UndoPersistence::Permanent, 0).unwrap();

        // Fill most of the first segment, then allocate something that
        // cannot fit in the remainder.
        let big = (UNDO_SEGMENT_SIZE - 2 * PAGE_SIZE as u64) as usize;
        let (urp, _) = reg.allocate(&log, big).unwrap();
        reg.advance_insert(&log, urp, big);

        let (urp, _) = reg.allocate(&log, 3 * PAGE_SIZE).unwrap();
        reg.advance_insert(&log, urp, 3 * PAGE_SIZE);

        assert_eq!(log.meta().end, 2 * UNDO_SEGMENT_SIZE);
        assert!(dir
            .path()
            .join("base/undo/000001.0000100000")
            .exists());
    }

    #[test]
    fn meta_image_emitted_once_per_checkpoint() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path());
        let log = reg.attach(UndoPersistence::Permanent, 0).unwrap();

        let (_, image) = reg.allocate(&log, 10).unwrap();
        assert!(image.is_some());
        let (_, image) = reg.allocate(&log, 10).unwrap();
        assert!(image.is_none());

        reg.checkpoint(0x1000).unwrap();
        let (_, image) = reg.allocate(&log, 10).unwrap();
        assert!(image.is_some());
    }

    #[test]
    fn recovery_reproduces_allocations() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path());
        let log = reg.attach(UndoPersistence::Permanent, 0).unwrap();

        let (urp1, image) = reg.allocate(&log, 80).unwrap();
        reg.advance_insert(&log, urp1, 80);
        let (urp2, _) = reg.allocate(&log, 120).unwrap();
        reg.advance_insert(&log, urp2, 120);
        let image = image.unwrap();

        // Replay into a fresh registry.
        let dir2 = tempdir().unwrap();
        let replay = registry(dir2.path());
        replay.restore_recovery_meta(&image);

        assert!(replay.is_transaction_first_rec(100));
        let r1 = replay
            .allocate_in_recovery(100, 80, UndoPersistence::Permanent)
            .unwrap();
        let log2 = replay.get(1).unwrap();
        replay.advance_insert(&log2, r1, 80);
        assert!(!replay.is_transaction_first_rec(100));

        let r2 = replay
            .allocate_in_recovery(100, 120, UndoPersistence::Permanent)
            .unwrap();
        replay.advance_insert(&log2, r2, 120);

        assert_eq!(r1, urp1);
        assert_eq!(r2, urp2);
    }

    #[test]
    fn discard_advances_and_reclaims_segments() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path());
        let log = reg.attach(UndoPersistence::Permanent, 0).unwrap();

        let big = (2 * UNDO_SEGMENT_SIZE) as usize;
        let (urp, _) = reg.allocate(&log, big).unwrap();
        reg.advance_insert(&log, urp, big);

        let target = make_undo_rec_ptr(1, UNDO_SEGMENT_SIZE + PAGE_HEADER_SIZE as u64);
        let removed = reg.discard(&log, target).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(
            log.meta().discard,
            UNDO_SEGMENT_SIZE + PAGE_HEADER_SIZE as u64
        );
        assert!(!dir.path().join("base/undo/000001.0000000000").exists());
        assert!(dir.path().join("base/undo/000001.0000100000").exists());
    }

    #[test]
    fn discard_never_moves_backwards_or_past_insert() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path());
        let log = reg.attach(UndoPersistence::Permanent, 0).unwrap();

        let (urp, _) = reg.allocate(&log, 500).unwrap();
        reg.advance_insert(&log, urp, 500);

        reg.discard(&log, make_undo_rec_ptr(1, 100 + PAGE_HEADER_SIZE as u64))
            .unwrap();
        let discard = log.meta().discard;

        // Backwards request is a no-op.
        reg.discard(&log, make_undo_rec_ptr(1, PAGE_HEADER_SIZE as u64))
            .unwrap();
        assert_eq!(log.meta().discard, discard);

        // Past-insert request clamps to insert.
        reg.discard(&log, make_undo_rec_ptr(1, MAX_UNDO_LOG_OFFSET))
            .unwrap();
        assert_eq!(log.meta().discard, log.meta().insert);
    }

    #[test]
    fn checkpoint_snapshot_roundtrip() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path());
        let log = reg.attach(UndoPersistence::Permanent, 0).unwrap();
        let (urp, _) = reg.allocate(&log, 300).unwrap();
        reg.advance_insert(&log, urp, 300);
        log.update_meta(|m| m.last_xact_start = urp_offset(urp));

        let path = reg.checkpoint(0x2A).unwrap();
        assert!(path.ends_with("pg_undo/000000000000002A"));

        let reloaded = registry(dir.path());
        let count = reloaded.load_checkpoint(0x2A).unwrap();
        assert_eq!(count, 1);

        let restored = reloaded.get(1).unwrap();
        assert_eq!(restored.meta(), log.meta());
    }

    #[test]
    fn load_checkpoint_rejects_corruption() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path());
        reg.attach(UndoPersistence::Permanent, 0).unwrap();
        let path = reg.checkpoint(7).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[20] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let reloaded = registry(dir.path());
        assert!(reloaded.load_checkpoint(7).is_err());
    }
}
