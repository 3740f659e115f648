//! Named, growable shared memory segments guarded by named mutexes.
//!
//! A segment is a POSIX shared memory object (`/nvxmem_<name>`) holding an
//! append-only log of length-prefixed records. Every access goes through a
//! [`ScopedAccess`], which holds an exclusive `flock` on the segment's mutex
//! file (`<tmp>/nvxmtx_<name>.lock`) for its whole lifetime and maps the object
//! with `memmap2`. Values are read straight out of the mapping. Mutations are
//! staged and appended to the log when the access is committed or dropped.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! 0..8      magic (all zeros for a freshly created object)
//! 8..12     layout version
//! 16..56    log slot A: sequence | epoch | log start | log end | checksum
//! 64..104   log slot B
//! 128..     log entries: key_len u32 | key | value_len u32 | value
//! ```
//!
//! A `value_len` of `u32::MAX` marks a removed key. A commit writes its entries
//! past the log end, then publishes them by writing the slot that is not in
//! use. A process dying mid-commit leaves a slot with a bad checksum and the
//! previous state stays readable. When the log runs out of room the live
//! records are copied to a region that does not overlap the published log
//! before the slot switch.
//!
//! Each handle keeps the key index of the log it last read and only scans the
//! entries appended since, so an access costs what changed, not what is stored.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{Ordering, fence};
use std::sync::{Arc, Mutex};

use memmap2::{MmapMut, MmapOptions};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg, OFlag};
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, trace, warn};
use twox_hash::XxHash3_64;
use uuid::Uuid;

use super::garbage_collector::GarbageCollector;
use super::queue::SharedQueue;
use crate::error::{NavindexError, Result};

/// Longest segment name accepted before OS object names are formed.
pub const MAX_NAME_LEN: usize = 18;

/// Size of the fixed segment header.
pub const HEADER_SIZE: usize = 128;

const MEMORY_PREFIX: &str = "nvxmem_";
const MUTEX_PREFIX: &str = "nvxmtx_";
const MAGIC: [u8; 8] = *b"NVXSHM\0\x02";
const LAYOUT_VERSION: u32 = 2;

const SLOT_OFFSETS: [usize; 2] = [16, 64];
const SLOT_LEN: usize = 40;

/// Value length marking a removed key.
const TOMBSTONE: u32 = u32::MAX;

/// Per-record overhead: two u32 length prefixes.
const RECORD_OVERHEAD: usize = 8;

/// How a [`SharedMemory`] handle relates to the OS objects it names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Replace any stale object, create a fresh one and delete it on drop.
    CreateAndDelete,
    /// Open an existing object; fail if it is absent.
    OpenOnly,
    /// Open an existing object or create it; never delete it on drop.
    OpenOrCreate,
}

/// Handle to a named shared memory segment.
pub struct SharedMemory {
    name: String,
    initial_size: usize,
    mode: AccessMode,
    collector: Option<Arc<GarbageCollector>>,
    /// Key index of the log as of this handle's last access.
    index: Mutex<RecordIndex>,
}

impl SharedMemory {
    /// Open or create the segment `name` according to `mode`.
    ///
    /// Segments created with [`AccessMode::CreateAndDelete`] are registered with
    /// `collector`, so they are reclaimed if this process dies without
    /// dropping the handle.
    pub fn new(
        name: &str,
        initial_size: usize,
        mode: AccessMode,
        collector: Option<Arc<GarbageCollector>>,
    ) -> Result<Self> {
        let name = check_name(name);
        let initial_size = initial_size.max(HEADER_SIZE);

        match mode {
            AccessMode::CreateAndDelete => {
                Self::delete_shared_memory(&name)?;
                let _lock = lock_mutex(&name, true)?;
                let file = open_segment(&name, OFlag::O_CREAT | OFlag::O_EXCL)?;
                resize(&name, &file, initial_size)?;
            }
            AccessMode::OpenOnly => {
                let _lock = lock_mutex(&name, false)?;
                open_segment(&name, OFlag::empty())?;
            }
            AccessMode::OpenOrCreate => {
                let _lock = lock_mutex(&name, true)?;
                let file = open_segment(&name, OFlag::O_CREAT)?;
                if segment_len(&file)? < HEADER_SIZE {
                    resize(&name, &file, initial_size)?;
                }
            }
        }

        debug!(segment = %name, initial_size, mode = ?mode, "Opened shared memory");

        let memory = Self {
            name,
            initial_size,
            mode,
            collector,
            index: Mutex::new(RecordIndex::default()),
        };

        if mode == AccessMode::CreateAndDelete
            && let Some(collector) = &memory.collector
        {
            collector.register_shared_memory(&memory.name);
        }

        Ok(memory)
    }

    /// The (truncated) segment name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn initial_size(&self) -> usize {
        self.initial_size
    }

    /// Lock the segment and bring this handle's key index up to date.
    ///
    /// Blocks until no other access (in this or any other process) holds the
    /// segment's mutex.
    pub fn access(&self) -> Result<ScopedAccess<'_>> {
        let create = self.mode == AccessMode::OpenOrCreate;
        let lock = lock_mutex(&self.name, create)?;
        let flags = if create {
            OFlag::O_CREAT
        } else {
            OFlag::empty()
        };
        let file = open_segment(&self.name, flags)?;

        let mut size = segment_len(&file)?;
        if size < HEADER_SIZE {
            resize(&self.name, &file, self.initial_size)?;
            size = self.initial_size;
        }

        let map = map_segment(&self.name, &file, size)?;
        let (state, active_slot) = read_log_state(&self.name, &map)?;

        // Taken out for the access; a failed scan leaves an empty index behind,
        // which forces a full scan next time.
        let mut index = std::mem::take(&mut *self.index.lock().unwrap());
        if !index.continues(&state) {
            index = RecordIndex::at(&state);
        }
        let from = index.scanned;
        index.scan(&self.name, &map, state.end)?;
        let used = HEADER_SIZE + index.live;
        trace!(
            segment = %self.name,
            size,
            used,
            scanned_bytes = state.end - from,
            "Acquired shared memory access"
        );

        Ok(ScopedAccess {
            memory: self,
            _lock: lock,
            file,
            map: Some(map),
            size,
            state,
            active_slot,
            index,
            staged: BTreeMap::new(),
            used,
        })
    }

    /// Remove the OS objects backing `name`.
    ///
    /// Returns whether anything existed. Handles that are still open elsewhere
    /// keep working on the unlinked objects until they are dropped.
    pub fn delete_shared_memory(name: &str) -> Result<bool> {
        let name = check_name(name);
        let mut removed = false;

        match shm_unlink(segment_os_name(&name).as_str()) {
            Ok(()) => removed = true,
            Err(Errno::ENOENT) => {}
            Err(errno) => return Err(errno.into()),
        }

        match fs::remove_file(mutex_path(&name)) {
            Ok(()) => removed = true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if removed {
            debug!(segment = %name, "Deleted shared memory");
        }
        Ok(removed)
    }

    /// Whether a segment object named `name` currently exists.
    pub fn exists(name: &str) -> bool {
        let name = check_name(name);
        shm_open(
            segment_os_name(&name).as_str(),
            OFlag::O_RDONLY,
            Mode::empty(),
        )
        .is_ok()
    }

    /// Create, write, read back and destroy a small test segment.
    ///
    /// Used to verify that the platform supports named shared memory before
    /// starting an indexing run.
    pub fn check_shared_memory(name: &str) -> Result<()> {
        let test_name = format!("test_{name}");
        let memory = SharedMemory::new(&test_name, 65536, AccessMode::CreateAndDelete, None)?;

        let mut access = memory.access()?;
        access.set_value("check", &42u32)?;
        access.commit()?;

        let access = memory.access()?;
        match access.value::<u32>("check")? {
            Some(42) => {
                info!(segment = %memory.name, "Shared memory check passed");
                Ok(())
            }
            other => Err(NavindexError::shared_memory(
                memory.name.clone(),
                format!("check value mismatch: {other:?}"),
            )),
        }
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        if self.mode != AccessMode::CreateAndDelete {
            return;
        }

        if let Some(collector) = &self.collector {
            collector.unregister_shared_memory(&self.name);
        }

        if let Err(e) = Self::delete_shared_memory(&self.name) {
            warn!(segment = %self.name, error = %e, "Failed to delete shared memory");
        }
    }
}

/// Published extent of a segment's log, as stored in a header slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LogState {
    sequence: u64,
    /// Changes whenever the log moves; appends keep it.
    epoch: u64,
    start: usize,
    end: usize,
}

impl LogState {
    fn empty() -> Self {
        Self {
            sequence: 0,
            epoch: 0,
            start: HEADER_SIZE,
            end: HEADER_SIZE,
        }
    }

    fn encode(&self) -> [u8; SLOT_LEN] {
        let mut slot = [0u8; SLOT_LEN];
        slot[0..8].copy_from_slice(&self.sequence.to_le_bytes());
        slot[8..16].copy_from_slice(&self.epoch.to_le_bytes());
        slot[16..24].copy_from_slice(&(self.start as u64).to_le_bytes());
        slot[24..32].copy_from_slice(&(self.end as u64).to_le_bytes());
        let checksum = XxHash3_64::oneshot(&slot[0..32]);
        slot[32..40].copy_from_slice(&checksum.to_le_bytes());
        slot
    }

    /// `None` for a slot that was never written or was torn mid-write.
    fn decode(slot: &[u8]) -> Option<Self> {
        if read_u64(slot, 32) != XxHash3_64::oneshot(&slot[0..32]) {
            return None;
        }
        Some(Self {
            sequence: read_u64(slot, 0),
            epoch: read_u64(slot, 8),
            start: read_u64(slot, 16) as usize,
            end: read_u64(slot, 24) as usize,
        })
    }
}

/// Where a live value sits in the mapping.
#[derive(Debug, Clone, Copy)]
struct Span {
    offset: usize,
    len: usize,
}

/// Key index of a published log.
#[derive(Debug, Default)]
struct RecordIndex {
    epoch: u64,
    start: usize,
    /// Log bytes before this offset are reflected in `records`.
    scanned: usize,
    records: BTreeMap<String, Span>,
    /// Record bytes of all live keys.
    live: usize,
}

impl RecordIndex {
    fn at(state: &LogState) -> Self {
        Self {
            epoch: state.epoch,
            start: state.start,
            scanned: state.start,
            ..Self::default()
        }
    }

    /// Whether `state` is this index's log with (possibly) more entries.
    fn continues(&self, state: &LogState) -> bool {
        self.epoch == state.epoch
            && self.start == state.start
            && (state.start..=state.end).contains(&self.scanned)
    }

    fn apply(&mut self, key: &str, value: Option<Span>) {
        let previous = match value {
            Some(span) => self.records.insert(key.to_string(), span),
            None => self.records.remove(key),
        };
        if let Some(old) = previous {
            self.live -= record_len(key, old.len);
        }
        if let Some(span) = value {
            self.live += record_len(key, span.len);
        }
    }

    /// Index the entries between `scanned` and `end`.
    fn scan(&mut self, name: &str, map: &[u8], end: usize) -> Result<()> {
        let corrupt = |reason: &str| NavindexError::CorruptSegment {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        let mut offset = self.scanned;
        while offset < end {
            let key = take_field(map, &mut offset, end).ok_or_else(|| corrupt("truncated key"))?;
            let key = std::str::from_utf8(key).map_err(|_| corrupt("key is not UTF-8"))?;
            if offset + 4 > end {
                return Err(corrupt("truncated value"));
            }

            let len = read_u32(map, offset);
            offset += 4;
            if len == TOMBSTONE {
                self.apply(key, None);
                continue;
            }

            let len = len as usize;
            if offset + len > end {
                return Err(corrupt("truncated value"));
            }
            self.apply(key, Some(Span { offset, len }));
            offset += len;
        }

        self.scanned = end;
        Ok(())
    }
}

/// Where a compaction may place the live records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    /// Wherever they fit without growing the segment.
    Anywhere,
    /// Such that a following compaction can move them to the front.
    Front,
}

/// Exclusive access to a segment's contents.
///
/// The mutex is released when the access is dropped. Staged mutations are
/// written back into the segment by [`ScopedAccess::commit`], or on drop if
/// they were not committed explicitly.
pub struct ScopedAccess<'a> {
    memory: &'a SharedMemory,
    _lock: Flock<File>,
    file: File,
    map: Option<MmapMut>,
    size: usize,
    state: LogState,
    /// Header slot holding `state`, if any was ever written.
    active_slot: Option<usize>,
    index: RecordIndex,
    /// Changes since the last commit; `None` removes the key.
    staged: BTreeMap<String, Option<Vec<u8>>>,
    used: usize,
}

impl<'a> ScopedAccess<'a> {
    pub fn name(&self) -> &str {
        &self.memory.name
    }

    /// Current capacity in bytes.
    pub fn memory_size(&self) -> usize {
        self.size
    }

    /// Bytes occupied by the header and all live records.
    pub fn used_memory_size(&self) -> usize {
        self.used
    }

    /// Capacity left for live records.
    ///
    /// Removed records stop counting right away. The log may still need to be
    /// compacted, and the segment grown, when the changes are committed.
    pub fn free_memory_size(&self) -> usize {
        self.size.saturating_sub(self.used)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.lookup(key).is_some()
    }

    /// Decode the value stored under `key`, if any.
    pub fn value<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.lookup(key) {
            Some(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
            None => Ok(None),
        }
    }

    /// Decode the value stored under `key`, or `T::default()` when absent.
    pub fn value_or_default<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T> {
        Ok(self.value(key)?.unwrap_or_default())
    }

    /// Store `value` under `key`.
    ///
    /// Fails with [`NavindexError::OutOfSharedMemory`] and leaves the segment
    /// untouched when the encoded record does not fit into free memory.
    pub fn set_value<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.insert_bytes(key, bytes)
    }

    /// Remove the value stored under `key`. Returns whether it existed.
    pub fn remove_value(&mut self, key: &str) -> bool {
        let Some(len) = self.lookup(key).map(<[u8]>::len) else {
            return false;
        };

        self.used -= record_len(key, len);
        if self.index.records.contains_key(key) {
            self.staged.insert(key.to_string(), None);
        } else {
            self.staged.remove(key);
        }
        true
    }

    /// Remove every value whose key starts with `prefix`.
    pub fn remove_prefixed(&mut self, prefix: &str) -> usize {
        self.keys_with_prefix(prefix)
            .into_iter()
            .filter(|key| self.remove_value(key))
            .count()
    }

    /// Live keys starting with `prefix`, in order.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let committed = self
            .index
            .records
            .range(prefix.to_string()..)
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(prefix));
        let staged = self
            .staged
            .range(prefix.to_string()..)
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(prefix));

        committed
            .chain(staged)
            .filter(|key| self.contains_key(key))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// FIFO view over the queue stored under `key`.
    pub fn queue<T>(&mut self, key: &str) -> Result<SharedQueue<'_, 'a, T>>
    where
        T: Serialize + DeserializeOwned,
    {
        SharedQueue::open(self, key)
    }

    /// Grow the segment by `delta` bytes.
    ///
    /// The mapping is dropped, the OS object extended and the segment
    /// remapped, all while the mutex stays held.
    pub fn grow_memory(&mut self, delta: usize) -> Result<()> {
        if delta == 0 {
            return Ok(());
        }

        let new_size = self.size.checked_add(delta).ok_or_else(|| {
            NavindexError::shared_memory(self.name(), format!("cannot grow by {delta} bytes"))
        })?;

        debug!(
            segment = %self.memory.name,
            size = self.size,
            free = self.free_memory_size(),
            delta,
            "Growing shared memory"
        );

        if let Err(e) = self.remap(new_size) {
            error!(
                segment = %self.memory.name,
                size = self.size,
                free = self.free_memory_size(),
                delta,
                error = %e,
                "Failed to grow shared memory"
            );
            return Err(e);
        }
        Ok(())
    }

    /// Shrink the segment to its used size, but never below its initial size.
    ///
    /// Staged changes are committed on the way, since the live records have to
    /// be compacted to the front of the segment before it is truncated.
    pub fn shrink_to_fit(&mut self) -> Result<()> {
        let target = self.used.max(self.memory.initial_size);
        if target >= self.size {
            return Ok(());
        }

        debug!(
            segment = %self.memory.name,
            size = self.size,
            target,
            "Shrinking shared memory"
        );

        let compacted = self.staged.is_empty()
            && self.state.start == HEADER_SIZE
            && self.state.end == self.used;
        if !compacted {
            let staged = std::mem::take(&mut self.staged);
            let mut result = self.compact(staged, Placement::Front);
            if result.is_ok() && self.state.start != HEADER_SIZE {
                result = self.compact(BTreeMap::new(), Placement::Front);
            }
            if let Err(e) = result {
                self.index = RecordIndex::default();
                return Err(e);
            }
        }

        self.remap(target)
    }

    /// One-line size and utilization summary.
    pub fn log_string(&self) -> String {
        let used_pct = if self.size == 0 {
            0.0
        } else {
            self.used as f64 * 100.0 / self.size as f64
        };
        format!(
            "{} - size: {} free: {} used: {} used pct: {:.1}",
            self.memory.name,
            self.size,
            self.free_memory_size(),
            self.used,
            used_pct
        )
    }

    /// Write staged mutations into the segment and release the mutex.
    pub fn commit(mut self) -> Result<()> {
        self.flush()
    }

    pub(crate) fn insert_bytes(&mut self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let previous = self
            .lookup(key)
            .map(|old| record_len(key, old.len()))
            .unwrap_or(0);
        let required = record_len(key, bytes.len());
        let used = self.used - previous + required;

        if used > self.size {
            warn!(
                segment = %self.memory.name,
                requested = required,
                free = self.free_memory_size(),
                size = self.size,
                "Shared memory write does not fit"
            );
            return Err(NavindexError::OutOfSharedMemory {
                name: self.memory.name.clone(),
                requested: required,
                free: self.free_memory_size(),
                size: self.size,
            });
        }

        self.staged.insert(key.to_string(), Some(bytes));
        self.used = used;
        Ok(())
    }

    pub(crate) fn raw_value(&self, key: &str) -> Option<&[u8]> {
        self.lookup(key)
    }

    fn lookup(&self, key: &str) -> Option<&[u8]> {
        match self.staged.get(key) {
            Some(staged) => staged.as_deref(),
            None => {
                let span = self.index.records.get(key)?;
                self.map.as_ref()?.get(span.offset..span.offset + span.len)
            }
        }
    }

    fn map_mut(&mut self) -> Result<&mut MmapMut> {
        let name = &self.memory.name;
        self.map
            .as_mut()
            .ok_or_else(|| NavindexError::shared_memory(name.clone(), "segment is not mapped"))
    }

    fn remap(&mut self, new_size: usize) -> Result<()> {
        self.map = None;
        if let Err(e) = resize(&self.memory.name, &self.file, new_size) {
            self.map = Some(map_segment(&self.memory.name, &self.file, self.size)?);
            return Err(e);
        }
        self.map = Some(map_segment(&self.memory.name, &self.file, new_size)?);
        self.size = new_size;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.staged.is_empty() {
            return Ok(());
        }

        let staged = std::mem::take(&mut self.staged);
        let append_len: usize = staged
            .iter()
            .map(|(key, value)| entry_len(key, value.as_deref()))
            .sum();

        // Appending must leave room for a compacted copy of the live records.
        let live = self.used - HEADER_SIZE;
        let result = if self.state.end + append_len + live <= self.size {
            self.append(staged)
        } else {
            self.compact(staged, Placement::Anywhere)
        };

        match result {
            Ok(()) => {
                trace!(segment = %self.memory.name, used = self.used, "Committed shared memory");
                Ok(())
            }
            Err(e) => {
                self.index = RecordIndex::default();
                Err(e)
            }
        }
    }

    /// Write `staged` past the log end and publish the longer log.
    fn append(&mut self, staged: BTreeMap<String, Option<Vec<u8>>>) -> Result<()> {
        let mut offset = self.state.end;
        let mut applied = Vec::with_capacity(staged.len());
        {
            let map = self.map_mut()?;
            for (key, value) in &staged {
                offset = put_bytes(map, offset, key.as_bytes());
                match value {
                    Some(bytes) => {
                        let span = Span {
                            offset: offset + 4,
                            len: bytes.len(),
                        };
                        offset = put_bytes(map, offset, bytes);
                        applied.push((key, Some(span)));
                    }
                    None => {
                        map[offset..offset + 4].copy_from_slice(&TOMBSTONE.to_le_bytes());
                        offset += 4;
                        applied.push((key, None));
                    }
                }
            }
        }

        let epoch = if self.state.epoch == 0 {
            new_epoch()
        } else {
            self.state.epoch
        };
        self.publish(LogState {
            sequence: self.state.sequence + 1,
            epoch,
            start: self.state.start,
            end: offset,
        })?;

        self.index.epoch = epoch;
        for (key, span) in applied {
            self.index.apply(key, span);
        }
        self.index.scanned = offset;
        self.used = HEADER_SIZE + self.index.live;
        Ok(())
    }

    /// Copy the live records, with `staged` applied, into a fresh log.
    fn compact(
        &mut self,
        mut staged: BTreeMap<String, Option<Vec<u8>>>,
        placement: Placement,
    ) -> Result<()> {
        enum Source {
            Log(Span),
            Staged(Vec<u8>),
        }

        let mut live: Vec<(String, Source)> = self
            .index
            .records
            .iter()
            .filter(|(key, _)| !staged.contains_key(*key))
            .map(|(key, span)| (key.clone(), Source::Log(*span)))
            .collect();
        live.extend(
            std::mem::take(&mut staged)
                .into_iter()
                .filter_map(|(key, value)| value.map(|bytes| (key, Source::Staged(bytes)))),
        );
        let live_len: usize = live
            .iter()
            .map(|(key, source)| match source {
                Source::Log(span) => record_len(key, span.len),
                Source::Staged(bytes) => record_len(key, bytes.len()),
            })
            .sum();

        let old = self.state;
        let start = if old.start == old.end || HEADER_SIZE + live_len <= old.start {
            HEADER_SIZE
        } else {
            match placement {
                Placement::Anywhere => old.end,
                Placement::Front => old.end.max(HEADER_SIZE + live_len),
            }
        };
        if start + live_len > self.size {
            debug!(
                segment = %self.memory.name,
                size = self.size,
                required = start + live_len,
                "Growing shared memory for compaction"
            );
            self.remap(start + live_len)?;
        }

        let mut records = BTreeMap::new();
        let mut offset = start;
        {
            let map = self.map_mut()?;
            for (key, source) in live {
                offset = put_bytes(map, offset, key.as_bytes());
                let value_offset = offset + 4;
                let len = match source {
                    Source::Staged(bytes) => {
                        offset = put_bytes(map, offset, &bytes);
                        bytes.len()
                    }
                    Source::Log(span) => {
                        map[offset..value_offset].copy_from_slice(&(span.len as u32).to_le_bytes());
                        map.copy_within(span.offset..span.offset + span.len, value_offset);
                        offset = value_offset + span.len;
                        span.len
                    }
                };
                records.insert(
                    key,
                    Span {
                        offset: value_offset,
                        len,
                    },
                );
            }
        }

        self.publish(LogState {
            sequence: old.sequence + 1,
            epoch: new_epoch(),
            start,
            end: offset,
        })?;
        self.index = RecordIndex {
            records,
            live: live_len,
            ..RecordIndex::at(&self.state)
        };
        self.index.scanned = offset;
        self.used = HEADER_SIZE + live_len;

        debug!(
            segment = %self.memory.name,
            from = old.start,
            to = start,
            live = live_len,
            reclaimed = (old.end - old.start).saturating_sub(live_len),
            "Compacted shared memory log"
        );
        Ok(())
    }

    /// Make `next` the published log by writing the slot not in use.
    fn publish(&mut self, next: LogState) -> Result<()> {
        let slot = match self.active_slot {
            Some(0) => 1,
            _ => 0,
        };
        let offset = SLOT_OFFSETS[slot];

        let map = self.map_mut()?;
        fence(Ordering::SeqCst);
        map[offset..offset + SLOT_LEN].copy_from_slice(&next.encode());
        if map[0..8] != MAGIC {
            map[8..12].copy_from_slice(&LAYOUT_VERSION.to_le_bytes());
            fence(Ordering::SeqCst);
            map[0..8].copy_from_slice(&MAGIC);
        }

        self.state = next;
        self.active_slot = Some(slot);
        Ok(())
    }
}

impl Drop for ScopedAccess<'_> {
    fn drop(&mut self) {
        match self.flush() {
            Ok(()) => {
                *self.memory.index.lock().unwrap() = std::mem::take(&mut self.index);
            }
            Err(e) => error!(
                segment = %self.memory.name,
                error = %e,
                "Failed to write back shared memory"
            ),
        }
    }
}

/// Truncate `name` to [`MAX_NAME_LEN`] characters.
pub fn check_name(name: &str) -> String {
    name.chars().take(MAX_NAME_LEN).collect()
}

fn segment_os_name(name: &str) -> String {
    format!("/{MEMORY_PREFIX}{name}")
}

fn mutex_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{MUTEX_PREFIX}{name}.lock"))
}

fn record_len(key: &str, value_len: usize) -> usize {
    RECORD_OVERHEAD + key.len() + value_len
}

/// Bytes a log entry takes; removals carry no value.
fn entry_len(key: &str, value: Option<&[u8]>) -> usize {
    record_len(key, value.map_or(0, <[u8]>::len))
}

/// Random, nonzero tag for a freshly written log.
fn new_epoch() -> u64 {
    Uuid::new_v4().as_u64_pair().0 | 1
}

/// Open the mutex file with a fresh file description and lock it.
///
/// `flock` locks belong to open file descriptions, so opening per access
/// excludes threads of the same process as well as other processes.
fn lock_mutex(name: &str, create: bool) -> Result<Flock<File>> {
    let path = mutex_path(name);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(create)
        .truncate(false)
        .open(&path)
        .map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => NavindexError::SegmentNotFound(name.to_string()),
            _ => NavindexError::Io(e),
        })?;

    Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| {
        error!(segment = %name, error = %errno, "Failed to lock shared memory mutex");
        NavindexError::Os(errno)
    })
}

fn open_segment(name: &str, flags: OFlag) -> Result<File> {
    let mode = Mode::S_IRUSR | Mode::S_IWUSR;
    match shm_open(segment_os_name(name).as_str(), OFlag::O_RDWR | flags, mode) {
        Ok(fd) => Ok(File::from(fd)),
        Err(Errno::ENOENT) => Err(NavindexError::SegmentNotFound(name.to_string())),
        Err(errno) => {
            error!(segment = %name, error = %errno, "Failed to open shared memory");
            Err(NavindexError::shared_memory(
                name,
                format!("shm_open failed: {errno}"),
            ))
        }
    }
}

fn segment_len(file: &File) -> Result<usize> {
    Ok(file.metadata()?.len() as usize)
}

fn resize(name: &str, file: &File, size: usize) -> Result<()> {
    file.set_len(size as u64).map_err(|e| {
        error!(segment = %name, size, error = %e, "Failed to resize shared memory");
        NavindexError::shared_memory(name, format!("resize to {size} bytes failed: {e}"))
    })
}

fn map_segment(name: &str, file: &File, size: usize) -> Result<MmapMut> {
    // SAFETY: the object is only written while its mutex file is flocked, and
    // the mapping never outlives the ScopedAccess holding that lock.
    unsafe { MmapOptions::new().len(size).map_mut(file) }.map_err(|e| {
        error!(segment = %name, size, error = %e, "Failed to map shared memory");
        NavindexError::shared_memory(name, format!("mmap of {size} bytes failed: {e}"))
    })
}

fn put_bytes(map: &mut [u8], offset: usize, bytes: &[u8]) -> usize {
    let start = offset + 4;
    map[offset..start].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
    map[start..start + bytes.len()].copy_from_slice(bytes);
    start + bytes.len()
}

fn read_u32(map: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&map[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(map: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&map[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

/// Read one length-prefixed field ending no later than `end`.
fn take_field<'m>(map: &'m [u8], offset: &mut usize, end: usize) -> Option<&'m [u8]> {
    if *offset + 4 > end {
        return None;
    }
    let len = read_u32(map, *offset) as usize;
    let start = *offset + 4;
    let stop = start.checked_add(len).filter(|&stop| stop <= end)?;
    *offset = stop;
    Some(&map[start..stop])
}

/// Read the published log extent and the slot it came from.
fn read_log_state(name: &str, map: &[u8]) -> Result<(LogState, Option<usize>)> {
    let corrupt = |reason: &str| NavindexError::CorruptSegment {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if map[0..8] == [0u8; 8] {
        return Ok((LogState::empty(), None));
    }
    if map[0..8] != MAGIC {
        return Err(corrupt("bad magic"));
    }

    let version = read_u32(map, 8);
    if version != LAYOUT_VERSION {
        return Err(corrupt(&format!("unsupported layout version {version}")));
    }

    let slots = SLOT_OFFSETS.map(|offset| LogState::decode(&map[offset..offset + SLOT_LEN]));
    let (slot, state) = match slots {
        [Some(a), Some(b)] if b.sequence > a.sequence => (1, b),
        [Some(a), _] => (0, a),
        [None, Some(b)] => (1, b),
        [None, None] => return Err(corrupt("no valid log slot")),
    };

    if state.start < HEADER_SIZE || state.start > state.end || state.end > map.len() {
        return Err(corrupt("log exceeds segment"));
    }
    Ok((state, Some(slot)))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::thread;
    use uuid::Uuid;

    /// Unique segment name for one test.
    pub(crate) fn unique_name(prefix: &str) -> String {
        format!("{prefix}{}", Uuid::new_v4().simple())
    }

    /// Zero both log slots of `memory`, leaving it unreadable.
    pub(crate) fn clear_log_slots(memory: &SharedMemory) {
        let mut access = memory.access().unwrap();
        let map = access.map.as_mut().unwrap();
        for offset in SLOT_OFFSETS {
            map[offset..offset + SLOT_LEN].fill(0);
        }
    }

    fn create(prefix: &str, size: usize) -> SharedMemory {
        SharedMemory::new(&unique_name(prefix), size, AccessMode::CreateAndDelete, None).unwrap()
    }

    #[test]
    fn test_check_name_truncates() {
        assert_eq!(check_name("short"), "short");
        let long = "icmd_0123456789abcdef0123";
        assert_eq!(check_name(long).len(), MAX_NAME_LEN);
        assert_eq!(check_name(long), "icmd_0123456789abc");
    }

    #[test]
    fn test_values_visible_through_second_handle() {
        let owner = create("tv_", 4096);
        let mut access = owner.access().unwrap();
        access.set_value("answer", &42u64).unwrap();
        access.set_value("name", "segment").unwrap();
        access.commit().unwrap();

        let reader = SharedMemory::new(owner.name(), 4096, AccessMode::OpenOnly, None).unwrap();
        let access = reader.access().unwrap();
        assert_eq!(access.value::<u64>("answer").unwrap(), Some(42));
        assert_eq!(access.value::<String>("name").unwrap().as_deref(), Some("segment"));
        assert_eq!(access.value::<u64>("missing").unwrap(), None);
        assert_eq!(access.value_or_default::<u64>("missing").unwrap(), 0);
    }

    #[test]
    fn test_drop_writes_back_uncommitted_changes() {
        let memory = create("td_", 4096);
        {
            let mut access = memory.access().unwrap();
            access.set_value("flag", &true).unwrap();
        }
        let access = memory.access().unwrap();
        assert_eq!(access.value::<bool>("flag").unwrap(), Some(true));
    }

    #[test]
    fn test_open_only_missing_segment_fails() {
        let result = SharedMemory::new(&unique_name("tm_"), 4096, AccessMode::OpenOnly, None);
        assert!(matches!(result, Err(NavindexError::SegmentNotFound(_))));
    }

    #[test]
    fn test_create_and_delete_removes_objects_on_drop() {
        let memory = create("tr_", 4096);
        let name = memory.name().to_string();
        assert!(SharedMemory::exists(&name));

        drop(memory);

        assert!(!SharedMemory::exists(&name));
        assert!(!mutex_path(&name).exists());
        let reopened = SharedMemory::new(&name, 4096, AccessMode::OpenOnly, None);
        assert!(matches!(reopened, Err(NavindexError::SegmentNotFound(_))));
    }

    #[test]
    fn test_create_and_delete_replaces_stale_segment() {
        let name = unique_name("ts_");
        let stale = SharedMemory::new(&name, 4096, AccessMode::OpenOrCreate, None).unwrap();
        let mut access = stale.access().unwrap();
        access.set_value("old", &1u8).unwrap();
        access.commit().unwrap();

        let fresh = SharedMemory::new(&name, 4096, AccessMode::CreateAndDelete, None).unwrap();
        let access = fresh.access().unwrap();
        assert!(!access.contains_key("old"));
        assert_eq!(access.used_memory_size(), HEADER_SIZE);
    }

    #[test]
    fn test_out_of_memory_leaves_segment_untouched() {
        let memory = create("to_", 256);
        let mut access = memory.access().unwrap();
        access.set_value("small", &1u8).unwrap();
        let used = access.used_memory_size();

        let big = "x".repeat(1024);
        let err = access.set_value("big", &big).unwrap_err();
        assert!(err.is_out_of_memory());
        assert_eq!(access.used_memory_size(), used);
        assert!(!access.contains_key("big"));
        assert_eq!(access.value::<u8>("small").unwrap(), Some(1));
    }

    #[test]
    fn test_grow_memory_preserves_contents() {
        let memory = create("tg_", 256);
        let mut access = memory.access().unwrap();
        access.set_value("keep", "me").unwrap();

        let big = "x".repeat(1024);
        assert!(access.set_value("big", &big).is_err());

        let before = access.memory_size();
        access.grow_memory(2048).unwrap();
        assert_eq!(access.memory_size(), before + 2048);
        access.set_value("big", &big).unwrap();
        access.commit().unwrap();

        let access = memory.access().unwrap();
        assert_eq!(access.memory_size(), before + 2048);
        assert_eq!(access.value::<String>("keep").unwrap().as_deref(), Some("me"));
        assert_eq!(access.value::<String>("big").unwrap(), Some(big));
    }

    #[test]
    fn test_grow_memory_never_shrinks() {
        let memory = create("tn_", 4096);
        let mut access = memory.access().unwrap();
        let before = access.memory_size();
        access.grow_memory(0).unwrap();
        assert_eq!(access.memory_size(), before);
        access.grow_memory(16).unwrap();
        assert!(access.memory_size() >= before);
    }

    #[test]
    fn test_shrink_to_fit_respects_initial_size() {
        let memory = create("tk_", 1024);
        let mut access = memory.access().unwrap();
        access.grow_memory(8192).unwrap();
        access.set_value("value", &"y".repeat(2000)).unwrap();
        access.shrink_to_fit().unwrap();
        assert_eq!(access.memory_size(), access.used_memory_size());
        access.remove_value("value");
        access.shrink_to_fit().unwrap();
        assert_eq!(access.memory_size(), 1024);
        access.commit().unwrap();

        let access = memory.access().unwrap();
        assert_eq!(access.memory_size(), 1024);
        assert!(!access.contains_key("value"));
    }

    #[test]
    fn test_remove_value_and_prefixed() {
        let memory = create("tp_", 4096);
        let mut access = memory.access().unwrap();
        access.set_value("q/1", &1).unwrap();
        access.set_value("q/2", &2).unwrap();
        access.set_value("r", &3).unwrap();

        assert_eq!(access.remove_prefixed("q/"), 2);
        assert!(access.remove_value("r"));
        assert!(!access.remove_value("r"));
        assert_eq!(access.used_memory_size(), HEADER_SIZE);
    }

    #[test]
    fn test_log_string_format() {
        let memory = create("tl_", 1000);
        let access = memory.access().unwrap();
        let line = access.log_string();
        assert!(line.starts_with(memory.name()));
        assert!(line.contains("size: 1000"));
        assert!(line.contains(&format!("free: {}", 1000 - HEADER_SIZE)));
        assert!(line.contains("used pct: 12.8"));
    }

    #[test]
    fn test_corrupt_magic_is_detected() {
        let memory = create("tc_", 4096);
        {
            let mut access = memory.access().unwrap();
            access.map.as_mut().unwrap()[0..8].copy_from_slice(b"garbage!");
        }
        let result = memory.access();
        assert!(matches!(result, Err(NavindexError::CorruptSegment { .. })));
    }

    #[test]
    fn test_access_serializes_threads() {
        let memory = Arc::new(create("tx_", 65536));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let memory = Arc::clone(&memory);
                thread::spawn(move || {
                    for _ in 0..25 {
                        let mut access = memory.access().unwrap();
                        let count: u64 = access.value_or_default("count").unwrap();
                        access.set_value("count", &(count + 1)).unwrap();
                        access.commit().unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let access = memory.access().unwrap();
        assert_eq!(access.value::<u64>("count").unwrap(), Some(100));
    }

    #[test]
    fn test_commit_appends_only_changed_records() {
        let memory = create("ta_", 1 << 20);
        {
            let mut access = memory.access().unwrap();
            for i in 0..1000 {
                access.set_value(&format!("file/{i:04}"), &i).unwrap();
            }
            access.commit().unwrap();
        }

        let mut access = memory.access().unwrap();
        let end = access.state.end;
        access.set_value("file/0500", &-1).unwrap();
        access.commit().unwrap();

        let access = memory.access().unwrap();
        assert_eq!(access.state.end, end + entry_len("file/0500", Some(b"-1")));
        assert_eq!(access.value::<i32>("file/0500").unwrap(), Some(-1));
        assert_eq!(access.value::<i32>("file/0999").unwrap(), Some(999));
    }

    #[test]
    fn test_reader_follows_appends_and_compactions() {
        let owner = create("tf_", 4096);
        let reader = SharedMemory::new(owner.name(), 4096, AccessMode::OpenOnly, None).unwrap();
        {
            let mut access = owner.access().unwrap();
            access.set_value("fixed", "kept").unwrap();
            access.commit().unwrap();
        }

        let mut epochs = BTreeSet::new();
        for i in 0..500u32 {
            let counter = format!("{i:04}");
            let mut access = owner.access().unwrap();
            access.set_value("counter", &counter).unwrap();
            access.commit().unwrap();

            let access = reader.access().unwrap();
            epochs.insert(access.state.epoch);
            assert_eq!(access.value::<String>("counter").unwrap(), Some(counter));
            assert_eq!(access.value::<String>("fixed").unwrap().as_deref(), Some("kept"));
        }

        // The log was compacted several times without growing the segment.
        assert!(epochs.len() > 2);
        assert_eq!(owner.access().unwrap().memory_size(), 4096);
    }

    #[test]
    fn test_torn_commit_keeps_previous_state() {
        let memory = create("tt_", 4096);
        {
            let mut access = memory.access().unwrap();
            access.set_value("stable", &1u8).unwrap();
            access.commit().unwrap();
        }

        // A writer that died after appending and halfway through the slot switch.
        {
            let mut access = memory.access().unwrap();
            let end = access.state.end;
            let inactive = match access.active_slot {
                Some(0) => SLOT_OFFSETS[1],
                _ => SLOT_OFFSETS[0],
            };
            let map = access.map.as_mut().unwrap();
            put_bytes(map, end, b"stable");
            map[end + 10..end + 20].copy_from_slice(&[0xAB; 10]);
            let torn = LogState {
                sequence: u64::MAX,
                epoch: 7,
                start: HEADER_SIZE,
                end: end + 20,
            }
            .encode();
            map[inactive..inactive + SLOT_LEN / 2].copy_from_slice(&torn[..SLOT_LEN / 2]);
        }

        let reader = SharedMemory::new(memory.name(), 4096, AccessMode::OpenOnly, None).unwrap();
        let mut access = reader.access().unwrap();
        assert_eq!(access.value::<u8>("stable").unwrap(), Some(1));

        access.set_value("next", &2u8).unwrap();
        access.commit().unwrap();
        let access = memory.access().unwrap();
        assert_eq!(access.value::<u8>("stable").unwrap(), Some(1));
        assert_eq!(access.value::<u8>("next").unwrap(), Some(2));
    }

    #[test]
    fn test_missing_log_slots_are_detected() {
        let memory = create("tz_", 4096);
        {
            let mut access = memory.access().unwrap();
            access.set_value("a", &1u8).unwrap();
            access.commit().unwrap();
        }
        clear_log_slots(&memory);
        let result = memory.access();
        assert!(matches!(result, Err(NavindexError::CorruptSegment { .. })));
    }

    #[test]
    fn test_keys_with_prefix_merges_staged_changes() {
        let memory = create("tw_", 4096);
        {
            let mut access = memory.access().unwrap();
            access.set_value("p/1", &1).unwrap();
            access.set_value("p/2", &2).unwrap();
            access.commit().unwrap();
        }

        let mut access = memory.access().unwrap();
        access.remove_value("p/1");
        access.set_value("p/3", &3).unwrap();
        access.set_value("q/1", &4).unwrap();
        assert_eq!(access.keys_with_prefix("p/"), vec!["p/2", "p/3"]);
    }

    #[test]
    fn test_check_shared_memory() {
        SharedMemory::check_shared_memory(&Uuid::new_v4().simple().to_string()).unwrap();
    }
}
