//! Durable, append-only log of local mutations awaiting push.
//!
//! Each entry is one [`FrameKind::Entry`] frame. Truncation is logical
//! first: a [`FrameKind::Truncate`] frame records the new floor. The
//! backend is rewritten as a floor marker plus the live entries once the log
//! is drained or the acknowledged prefix grows past the compaction
//! threshold.
//!
//! The floor is also supplied by the caller on open (the checkpoint
//! watermark), so a crash between committing a checkpoint and recording
//! the truncation still never hands back an acknowledged entry.

use crate::error::{SyncError, SyncResult};
use cloudsync_protocol::ChangeEntry;
use cloudsync_storage::frame::{self, Frame, FrameKind, FrameReader, FrameWriter};
use cloudsync_storage::StorageBackend;
use tracing::{debug, warn};

/// Acknowledged bytes ahead of the first live entry that trigger a rewrite.
pub const DEFAULT_COMPACT_THRESHOLD: u64 = 1 << 20;

/// Position of one live entry in the backend.
#[derive(Debug, Clone, Copy)]
struct IndexSlot {
    seq: u64,
    offset: u64,
}

/// The change log.
pub struct ChangeLog {
    backend: Box<dyn StorageBackend>,
    /// Live entries in log order.
    index: Vec<IndexSlot>,
    /// Entries at or below this seq are acknowledged.
    floor: u64,
    /// Highest seq ever assigned.
    last_seq: u64,
    max_entries: Option<usize>,
    sync_on_write: bool,
    compact_threshold: u64,
}

impl ChangeLog {
    /// Opens a log over `backend`, skipping everything at or below `floor`.
    ///
    /// A torn trailing frame is dropped from the backend.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::StorageCorruption`] if a complete frame fails
    /// validation or an entry fails to decode.
    pub fn open(mut backend: Box<dyn StorageBackend>, floor: u64) -> SyncResult<Self> {
        let frames = frame::recover(backend.as_mut())?;

        let mut index = Vec::new();
        let mut recorded_floor = floor;
        let mut last_seq = floor;

        for frame in frames {
            match frame.kind {
                FrameKind::Entry => {
                    let entry = ChangeEntry::decode(&frame.payload).map_err(|e| {
                        SyncError::StorageCorruption(format!(
                            "change log entry at offset {}: {e}",
                            frame.offset
                        ))
                    })?;
                    last_seq = last_seq.max(entry.seq);
                    index.push(IndexSlot {
                        seq: entry.seq,
                        offset: frame.offset,
                    });
                }
                FrameKind::Truncate => {
                    let marker = decode_floor(&frame.payload).ok_or_else(|| {
                        SyncError::StorageCorruption(format!(
                            "truncate marker at offset {} is malformed",
                            frame.offset
                        ))
                    })?;
                    recorded_floor = recorded_floor.max(marker);
                    last_seq = last_seq.max(marker);
                }
                other => {
                    return Err(SyncError::StorageCorruption(format!(
                        "unexpected {other:?} frame in change log at offset {}",
                        frame.offset
                    )));
                }
            }
        }

        index.retain(|slot| slot.seq > recorded_floor);
        debug!(
            live = index.len(),
            floor = recorded_floor,
            last_seq,
            "opened change log"
        );

        Ok(Self {
            backend,
            index,
            floor: recorded_floor,
            last_seq,
            max_entries: None,
            sync_on_write: true,
            compact_threshold: DEFAULT_COMPACT_THRESHOLD,
        })
    }

    /// Sets how many acknowledged bytes may precede the first live entry
    /// before [`ChangeLog::truncate`] rewrites the backend.
    pub fn with_compact_threshold(mut self, bytes: u64) -> Self {
        self.compact_threshold = bytes;
        self
    }

    /// Bounds the number of live entries.
    pub fn with_max_entries(mut self, max: Option<usize>) -> Self {
        self.max_entries = max;
        self
    }

    /// Sets whether each append is synced before returning.
    pub fn with_sync_on_write(mut self, sync: bool) -> Self {
        self.sync_on_write = sync;
        self
    }

    /// Appends `entry`, assigning it the next seq, and returns that seq.
    ///
    /// The entry is durable when this returns.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::StorageFull`] when the entry limit or backend
    /// capacity would be exceeded. Nothing is written in that case.
    pub fn append(&mut self, mut entry: ChangeEntry) -> SyncResult<u64> {
        if let Some(max) = self.max_entries {
            if self.index.len() >= max {
                return Err(SyncError::StorageFull(format!(
                    "change log holds {max} unacknowledged entries"
                )));
            }
        }

        let seq = self.last_seq + 1;
        entry.seq = seq;
        let payload = entry.encode()?;
        let written = FrameWriter::new(self.backend.as_mut())
            .with_sync(self.sync_on_write)
            .append(FrameKind::Entry, &payload);
        // Seqs are never reused, even when a failed frame could not be cut off.
        self.last_seq = seq;
        let offset = written?;

        self.index.push(IndexSlot { seq, offset });
        Ok(seq)
    }

    /// Re-appends entries under fresh seqs, keeping their contents.
    ///
    /// # Errors
    ///
    /// Returns the first append failure; earlier entries stay appended.
    pub fn requeue(&mut self, entries: impl IntoIterator<Item = ChangeEntry>) -> SyncResult<usize> {
        let mut count = 0;
        for entry in entries {
            self.append(entry)?;
            count += 1;
        }
        Ok(count)
    }

    /// Lazily yields entries with `seq > watermark` in log order.
    ///
    /// Each call starts from the same place; nothing is consumed.
    pub fn entries_since(&self, watermark: u64) -> Entries<'_> {
        let floor = watermark.max(self.floor);
        let start = self.index.partition_point(|slot| slot.seq <= floor);
        Entries {
            backend: self.backend.as_ref(),
            slots: &self.index[start..],
        }
    }

    /// Drops every entry with `seq <= up_to`.
    ///
    /// The in-memory floor moves first and always. Errors only concern
    /// persisting the marker or compacting the backend; the checkpoint
    /// watermark covers both on the next open.
    ///
    /// # Errors
    ///
    /// Returns the storage error from writing the marker or compacting.
    pub fn truncate(&mut self, up_to: u64) -> SyncResult<()> {
        if up_to <= self.floor {
            return Ok(());
        }
        let up_to = up_to.min(self.last_seq);
        self.floor = up_to;
        self.index.retain(|slot| slot.seq > up_to);

        let dead = self.index.first().map_or(u64::MAX, |slot| slot.offset);
        if dead >= self.compact_threshold {
            self.compact()?;
        } else {
            FrameWriter::new(self.backend.as_mut())
                .with_sync(self.sync_on_write)
                .append(FrameKind::Truncate, &up_to.to_le_bytes())?;
        }
        debug!(floor = up_to, live = self.index.len(), "truncated change log");
        Ok(())
    }

    /// Rewrites the backend as a floor marker followed by the live entries.
    ///
    /// The swap is atomic; on error the old contents and index stay.
    ///
    /// # Errors
    ///
    /// Returns the error from reading a live entry or replacing the backend.
    pub fn compact(&mut self) -> SyncResult<()> {
        let mut image = frame::encode_frame(FrameKind::Truncate, &self.floor.to_le_bytes())?;
        let mut index = Vec::with_capacity(self.index.len());
        for slot in &self.index {
            let entry = read_slot(self.backend.as_ref(), slot)?;
            index.push(IndexSlot {
                seq: slot.seq,
                offset: image.len() as u64,
            });
            image.extend(frame::encode_frame(FrameKind::Entry, &entry.payload)?);
        }

        let before = self.backend.size()?;
        self.backend.replace(&image)?;
        self.index = index;
        debug!(
            before,
            after = image.len(),
            live = self.index.len(),
            "compacted change log"
        );
        Ok(())
    }

    /// Number of unacknowledged entries.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Returns true if nothing awaits push.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Seq the next append will receive.
    pub fn next_seq(&self) -> u64 {
        self.last_seq + 1
    }

    /// Highest seq assigned so far.
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Acknowledged floor.
    pub fn floor(&self) -> u64 {
        self.floor
    }

    /// Bytes used in the backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be read.
    pub fn size_bytes(&self) -> SyncResult<u64> {
        Ok(self.backend.size()?)
    }
}

impl std::fmt::Debug for ChangeLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeLog")
            .field("live", &self.index.len())
            .field("floor", &self.floor)
            .field("last_seq", &self.last_seq)
            .finish()
    }
}

/// Iterator returned by [`ChangeLog::entries_since`].
///
/// Reads and decodes one frame per step.
pub struct Entries<'a> {
    backend: &'a dyn StorageBackend,
    slots: &'a [IndexSlot],
}

impl Iterator for Entries<'_> {
    type Item = SyncResult<ChangeEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        let (slot, rest) = self.slots.split_first()?;
        self.slots = rest;

        let result = read_slot(self.backend, slot).and_then(|frame| {
            ChangeEntry::decode(&frame.payload).map_err(|e| {
                SyncError::StorageCorruption(format!(
                    "change log entry {} at offset {}: {e}",
                    slot.seq, slot.offset
                ))
            })
        });

        if let Err(e) = &result {
            warn!(seq = slot.seq, error = %e, "failed to read change log entry");
        }
        Some(result)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.slots.len(), Some(self.slots.len()))
    }
}

fn read_slot(backend: &dyn StorageBackend, slot: &IndexSlot) -> SyncResult<Frame> {
    let mut reader = FrameReader::new(backend, slot.offset)?;
    match reader.next() {
        Some(Ok(frame)) if frame.kind == FrameKind::Entry => Ok(frame),
        Some(Ok(frame)) => Err(SyncError::StorageCorruption(format!(
            "change log entry {} at offset {} is a {:?} frame",
            slot.seq, slot.offset, frame.kind
        ))),
        Some(Err(e)) => Err(e.into()),
        None => Err(SyncError::StorageCorruption(format!(
            "change log entry {} missing at offset {}",
            slot.seq, slot.offset
        ))),
    }
}

fn decode_floor(payload: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = payload.try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudsync_protocol::{OperationKind, ReplicaId, Version};
    use cloudsync_storage::InMemoryBackend;
    use proptest::prelude::*;

    fn entry(key: &str, version: u64) -> ChangeEntry {
        ChangeEntry::put(
            key.into(),
            format!("{key}@{version}").into_bytes(),
            Version(version),
            OperationKind::Update,
            ReplicaId::from_bytes([9; 16]),
            1_000 + version,
        )
    }

    fn collect(log: &ChangeLog, watermark: u64) -> Vec<ChangeEntry> {
        log.entries_since(watermark)
            .collect::<SyncResult<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn append_assigns_increasing_seqs() {
        let mut log = ChangeLog::open(Box::new(InMemoryBackend::new()), 0).unwrap();
        assert_eq!(log.append(entry("a", 1)).unwrap(), 1);
        assert_eq!(log.append(entry("b", 1)).unwrap(), 2);
        assert_eq!(log.append(entry("a", 2)).unwrap(), 3);
        assert_eq!(log.len(), 3);
        assert_eq!(log.next_seq(), 4);
    }

    #[test]
    fn entries_since_is_restartable() {
        let mut log = ChangeLog::open(Box::new(InMemoryBackend::new()), 0).unwrap();
        for v in 1..=4 {
            log.append(entry("k", v)).unwrap();
        }

        let first = collect(&log, 1);
        let second = collect(&log, 1);
        assert_eq!(first, second);
        assert_eq!(
            first.iter().map(|e| e.seq).collect::<Vec<_>>(),
            vec![2, 3, 4]
        );
        assert_eq!(log.entries_since(0).size_hint(), (4, Some(4)));
    }

    #[test]
    fn entries_survive_reopen() {
        let backend = InMemoryBackend::new();
        {
            let mut log = ChangeLog::open(Box::new(backend.clone()), 0).unwrap();
            log.append(entry("a", 1)).unwrap();
            log.append(entry("b", 1)).unwrap();
        }

        let log = ChangeLog::open(Box::new(backend), 0).unwrap();
        let entries = collect(&log, 0);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].key.as_bytes(), b"b");
        assert_eq!(log.next_seq(), 3);
    }

    #[test]
    fn entry_limit_reports_storage_full() {
        let mut log = ChangeLog::open(Box::new(InMemoryBackend::new()), 0)
            .unwrap()
            .with_max_entries(Some(2));
        log.append(entry("a", 1)).unwrap();
        log.append(entry("b", 1)).unwrap();

        assert!(matches!(
            log.append(entry("c", 1)),
            Err(SyncError::StorageFull(_))
        ));
        assert_eq!(log.len(), 2);
        assert_eq!(log.next_seq(), 3);
    }

    #[test]
    fn backend_capacity_reports_storage_full() {
        let backend = InMemoryBackend::with_capacity(512);
        let mut log = ChangeLog::open(Box::new(backend.clone()), 0).unwrap();

        let mut appended = 0;
        let err = loop {
            match log.append(entry("key", appended + 1)) {
                Ok(_) => appended += 1,
                Err(e) => break e,
            }
        };
        assert!(matches!(err, SyncError::StorageFull(_)));
        assert_eq!(log.len() as u64, appended);

        // The failed append left nothing behind.
        drop(log);
        let reopened = ChangeLog::open(Box::new(backend), 0).unwrap();
        assert_eq!(reopened.len() as u64, appended);
    }

    #[test]
    fn truncate_keeps_later_entries() {
        let backend = InMemoryBackend::new();
        let mut log = ChangeLog::open(Box::new(backend.clone()), 0).unwrap();
        for v in 1..=5 {
            log.append(entry("k", v)).unwrap();
        }

        log.truncate(3).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(
            collect(&log, 0).iter().map(|e| e.seq).collect::<Vec<_>>(),
            vec![4, 5]
        );

        drop(log);
        let reopened = ChangeLog::open(Box::new(backend), 0).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.floor(), 3);
    }

    #[test]
    fn full_truncate_compacts_and_keeps_numbering() {
        let backend = InMemoryBackend::new();
        let mut log = ChangeLog::open(Box::new(backend.clone()), 0).unwrap();
        log.append(entry("a", 1)).unwrap();
        log.append(entry("b", 1)).unwrap();
        let before = backend.size().unwrap();

        log.truncate(2).unwrap();
        assert!(log.is_empty());
        assert!(backend.size().unwrap() < before);

        drop(log);
        let mut reopened = ChangeLog::open(Box::new(backend), 0).unwrap();
        assert_eq!(reopened.append(entry("c", 1)).unwrap(), 3);
    }

    #[test]
    fn open_floor_hides_acknowledged_entries() {
        let backend = InMemoryBackend::new();
        {
            let mut log = ChangeLog::open(Box::new(backend.clone()), 0).unwrap();
            for v in 1..=3 {
                log.append(entry("k", v)).unwrap();
            }
        }

        // The checkpoint says 2 was acknowledged but the marker never landed.
        let mut log = ChangeLog::open(Box::new(backend), 2).unwrap();
        assert_eq!(collect(&log, 0).len(), 1);
        assert_eq!(log.append(entry("k", 4)).unwrap(), 4);
    }

    #[test]
    fn empty_log_resumes_above_floor() {
        let mut log = ChangeLog::open(Box::new(InMemoryBackend::new()), 17).unwrap();
        assert!(log.is_empty());
        assert_eq!(log.append(entry("a", 1)).unwrap(), 18);
    }

    #[test]
    fn torn_tail_is_dropped_on_open() {
        let backend = InMemoryBackend::new();
        {
            let mut log = ChangeLog::open(Box::new(backend.clone()), 0).unwrap();
            log.append(entry("a", 1)).unwrap();
        }
        let good = backend.size().unwrap();
        let mut raw = backend.clone();
        raw.append(&[b'C', b'S', b'F']).unwrap();

        let log = ChangeLog::open(Box::new(backend.clone()), 0).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(backend.size().unwrap(), good);
    }

    #[test]
    fn corrupt_entry_is_reported() {
        let backend = InMemoryBackend::new();
        {
            let mut log = ChangeLog::open(Box::new(backend.clone()), 0).unwrap();
            log.append(entry("a", 1)).unwrap();
        }
        backend.corrupt_byte(14);

        assert!(matches!(
            ChangeLog::open(Box::new(backend), 0),
            Err(SyncError::StorageCorruption(_))
        ));
    }

    #[test]
    fn requeue_gives_fresh_seqs() {
        let mut log = ChangeLog::open(Box::new(InMemoryBackend::new()), 0).unwrap();
        log.append(entry("a", 1)).unwrap();
        let old = collect(&log, 0);
        log.truncate(1).unwrap();

        assert_eq!(log.requeue(old).unwrap(), 1);
        let requeued = collect(&log, 0);
        assert_eq!(requeued[0].seq, 2);
        assert_eq!(requeued[0].key.as_bytes(), b"a");
    }

    #[test]
    fn failed_sync_never_duplicates_a_seq() {
        let backend = InMemoryBackend::new();
        let mut log = ChangeLog::open(Box::new(backend.clone()), 0).unwrap();
        log.append(entry("a", 1)).unwrap();

        backend.fail_syncs(true);
        assert!(log.append(entry("lost", 1)).is_err());
        backend.fail_syncs(false);
        let seq = log.append(entry("b", 1)).unwrap();
        assert!(seq > 1);
        drop(log);

        let reopened = ChangeLog::open(Box::new(backend), 0).unwrap();
        let entries = collect(&reopened, 0);
        let keys: Vec<_> = entries.iter().map(|e| e.key.as_bytes().to_vec()).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(entries[1].seq, seq);
    }

    #[test]
    fn acknowledged_prefix_is_compacted_away() {
        let backend = InMemoryBackend::new();
        let mut log = ChangeLog::open(Box::new(backend.clone()), 0)
            .unwrap()
            .with_compact_threshold(256);
        for v in 1..=20 {
            log.append(entry("k", v)).unwrap();
        }
        let before = backend.size().unwrap();

        log.truncate(18).unwrap();
        assert!(backend.size().unwrap() < before / 4);
        assert_eq!(
            collect(&log, 0).iter().map(|e| e.seq).collect::<Vec<_>>(),
            vec![19, 20]
        );
        assert_eq!(log.append(entry("k", 21)).unwrap(), 21);
        drop(log);

        let reopened = ChangeLog::open(Box::new(backend), 0).unwrap();
        assert_eq!(reopened.floor(), 18);
        assert_eq!(
            collect(&reopened, 0).iter().map(|e| e.seq).collect::<Vec<_>>(),
            vec![19, 20, 21]
        );
    }

    #[test]
    fn failed_compaction_keeps_old_contents() {
        let backend = InMemoryBackend::new();
        let mut log = ChangeLog::open(Box::new(backend.clone()), 0)
            .unwrap()
            .with_compact_threshold(0);
        for v in 1..=3 {
            log.append(entry("k", v)).unwrap();
        }
        let image = backend.data();

        backend.fail_writes(true);
        assert!(log.truncate(1).is_err());
        backend.fail_writes(false);
        assert_eq!(backend.data(), image);
        assert_eq!(collect(&log, 0).len(), 2);

        // The checkpoint watermark supplies the floor the marker missed.
        drop(log);
        let reopened = ChangeLog::open(Box::new(backend), 1).unwrap();
        assert_eq!(
            collect(&reopened, 0).iter().map(|e| e.seq).collect::<Vec<_>>(),
            vec![2, 3]
        );
    }

    proptest! {
        #[test]
        fn per_key_versions_stay_ordered(keys in prop::collection::vec(0u8..4, 1..40)) {
            let mut log = ChangeLog::open(Box::new(InMemoryBackend::new()), 0).unwrap();
            let mut versions = [0u64; 4];
            for k in &keys {
                versions[*k as usize] += 1;
                log.append(entry(&format!("k{k}"), versions[*k as usize])).unwrap();
            }

            let mut last = std::collections::HashMap::new();
            for e in collect(&log, 0) {
                if let Some(prev) = last.insert(e.key.clone(), e.version) {
                    prop_assert!(prev < e.version);
                }
            }
        }

        #[test]
        fn truncate_then_reopen_matches_live_view(count in 1u64..20, cut in 0u64..25) {
            let backend = InMemoryBackend::new();
            let mut log = ChangeLog::open(Box::new(backend.clone()), 0).unwrap();
            for v in 1..=count {
                log.append(entry("k", v)).unwrap();
            }
            log.truncate(cut).unwrap();
            let live = collect(&log, 0);
            drop(log);

            let reopened = ChangeLog::open(Box::new(backend), 0).unwrap();
            prop_assert_eq!(collect(&reopened, 0), live);
        }
    }
}
