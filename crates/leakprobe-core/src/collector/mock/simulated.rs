//! Deterministic in-memory process for exercising the detector.
//!
//! Targets call the mutators (`allocate`, `open_fd`, `start_native_thread`,
//! ...) on a clone of the handle; the detector captures snapshots of the
//! same shared state. Nothing touches the real OS, so results do not depend
//! on allocator noise or on other tests running in parallel.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use crate::provider::{ProviderError, SnapshotProvider};
use crate::snapshot::{Capabilities, IdSet, Platform, ResourceId, Snapshot};

/// First descriptor handed out by `open_fd`, after stdio.
const FIRST_FD: u64 = 3;
const FIRST_HANDLE: u64 = 0x40;
const FIRST_TID: u64 = 1000;

#[derive(Debug)]
struct SimState {
    platform: Platform,
    managed_threads: bool,
    cycle_collector: bool,

    heap_used: u64,
    mmap_used: u64,
    heap_count: Option<u64>,
    uss: u64,
    rss: u64,
    vms: u64,

    descriptors: IdSet,
    handles: IdSet,
    /// Native thread id -> remaining captures before it exits on its own
    /// (`None` = runs until stopped).
    native_threads: BTreeMap<u64, Option<usize>>,
    managed_threads_live: BTreeMap<u64, Option<usize>>,
    next_tid: u64,
    next_handle: u64,

    /// Cyclic objects awaiting a collection cycle.
    pending_cycles: Vec<ResourceId>,
    uncollectable: IdSet,

    fail_after: Option<usize>,
    captures: usize,
    collections: usize,
    trims: usize,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            platform: Platform::Linux,
            managed_threads: true,
            cycle_collector: true,
            heap_used: 1 << 20,
            mmap_used: 4 << 20,
            heap_count: None,
            uss: 8 << 20,
            rss: 10 << 20,
            vms: 64 << 20,
            descriptors: (0..FIRST_FD).map(ResourceId).collect(),
            handles: IdSet::new(),
            native_threads: BTreeMap::from([(FIRST_TID, None)]),
            managed_threads_live: BTreeMap::new(),
            next_tid: FIRST_TID + 1,
            next_handle: FIRST_HANDLE,
            pending_cycles: Vec::new(),
            uncollectable: IdSet::new(),
            fail_after: None,
            captures: 0,
            collections: 0,
            trims: 0,
        }
    }
}

/// Shared handle to a simulated process. Clones observe and mutate the
/// same state.
#[derive(Debug, Clone, Default)]
pub struct SimulatedProcess {
    state: Arc<Mutex<SimState>>,
}

fn tick(threads: &mut BTreeMap<u64, Option<usize>>) {
    threads.retain(|_, remaining| match remaining {
        Some(0) => false,
        Some(n) => {
            *n -= 1;
            true
        }
        None => true,
    });
}

impl SimulatedProcess {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates a Windows process: kernel handles instead of descriptors
    /// and a private-heap count.
    pub fn windows() -> Self {
        let sim = Self::default();
        {
            let mut s = sim.lock();
            s.platform = Platform::Windows;
            s.descriptors.clear();
            s.handles = (1..=FIRST_HANDLE / 4).map(|h| ResourceId(h * 4)).collect();
            s.heap_count = Some(1);
        }
        sim
    }

    /// Drops the thread-registry capability.
    pub fn without_thread_registry(self) -> Self {
        self.lock().managed_threads = false;
        self
    }

    /// Drops the cycle-collector capability.
    pub fn without_cycle_collector(self) -> Self {
        self.lock().cycle_collector = false;
        self
    }

    /// Makes every capture after the first `n` fail.
    pub fn fail_after_captures(&self, n: usize) {
        self.lock().fail_after = Some(n);
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ---- memory ----

    /// Heap allocation that is never freed.
    pub fn allocate(&self, bytes: u64) {
        let mut s = self.lock();
        s.heap_used += bytes;
        s.uss += bytes;
        s.rss += bytes;
        s.vms += bytes;
    }

    pub fn free(&self, bytes: u64) {
        let mut s = self.lock();
        s.heap_used = s.heap_used.saturating_sub(bytes);
        s.uss = s.uss.saturating_sub(bytes);
        s.rss = s.rss.saturating_sub(bytes);
        s.vms = s.vms.saturating_sub(bytes);
    }

    /// Large allocation served by a dedicated mapping.
    pub fn map(&self, bytes: u64) {
        let mut s = self.lock();
        s.mmap_used += bytes;
        s.vms += bytes;
    }

    /// Resident-set growth with no heap counterpart, like a page-cache or
    /// allocator-fragmentation blip.
    pub fn grow_rss(&self, bytes: u64) {
        self.lock().rss += bytes;
    }

    pub fn create_heap(&self) {
        if let Some(count) = self.lock().heap_count.as_mut() {
            *count += 1;
        }
    }

    // ---- descriptors and handles ----

    /// Opens the lowest free descriptor, like `open(2)`.
    pub fn open_fd(&self) -> ResourceId {
        let mut s = self.lock();
        let fd = (FIRST_FD..)
            .map(ResourceId)
            .find(|fd| !s.descriptors.contains(fd))
            .unwrap_or(ResourceId(u64::MAX));
        s.descriptors.insert(fd);
        fd
    }

    pub fn close_fd(&self, fd: ResourceId) {
        self.lock().descriptors.remove(&fd);
    }

    pub fn open_handle(&self) -> ResourceId {
        let mut s = self.lock();
        let handle = ResourceId(s.next_handle);
        s.next_handle += 4;
        s.handles.insert(handle);
        handle
    }

    pub fn close_handle(&self, handle: ResourceId) {
        self.lock().handles.remove(&handle);
    }

    // ---- threads ----

    fn next_tid(s: &mut SimState) -> u64 {
        let tid = s.next_tid;
        s.next_tid += 1;
        tid
    }

    /// Starts an OS thread outside the registry that runs until stopped.
    pub fn start_native_thread(&self) -> ResourceId {
        self.start_native_thread_exiting_after(None)
    }

    /// Starts an OS thread that exits by itself once `captures` more
    /// snapshots have been taken (`None`: never).
    pub fn start_native_thread_exiting_after(&self, captures: Option<usize>) -> ResourceId {
        let mut s = self.lock();
        let tid = Self::next_tid(&mut s);
        s.native_threads.insert(tid, captures);
        ResourceId(tid)
    }

    /// Joins a native thread.
    pub fn join_native_thread(&self, tid: ResourceId) {
        self.lock().native_threads.remove(&tid.0);
    }

    /// Starts a thread through the registry.
    pub fn start_managed_thread(&self) -> ResourceId {
        self.start_managed_thread_exiting_after(None)
    }

    pub fn start_managed_thread_exiting_after(&self, captures: Option<usize>) -> ResourceId {
        let mut s = self.lock();
        let id = Self::next_tid(&mut s);
        s.managed_threads_live.insert(id, captures);
        ResourceId(id)
    }

    pub fn join_managed_thread(&self, id: ResourceId) {
        self.lock().managed_threads_live.remove(&id.0);
    }

    // ---- garbage ----

    /// Creates a reference cycle the collector will find uncollectable.
    pub fn create_cycle(&self) -> ResourceId {
        let mut s = self.lock();
        let id = ResourceId(0xC000 + (s.pending_cycles.len() + s.uncollectable.len()) as u64);
        s.pending_cycles.push(id);
        id
    }

    // ---- observation counters ----

    pub fn captures(&self) -> usize {
        self.lock().captures
    }

    pub fn collections(&self) -> usize {
        self.lock().collections
    }

    pub fn trims(&self) -> usize {
        self.lock().trims
    }
}

impl SnapshotProvider for SimulatedProcess {
    fn capture(&mut self) -> Result<Snapshot, ProviderError> {
        let mut s = self.lock();
        if s.fail_after.is_some_and(|n| s.captures >= n) {
            return Err(ProviderError::Other("simulated metrics failure".into()));
        }
        s.captures += 1;
        tick(&mut s.native_threads);
        tick(&mut s.managed_threads_live);

        let managed = s.managed_threads;
        let mut native_thread_ids: IdSet = s.native_threads.keys().map(|t| ResourceId(*t)).collect();
        let live_threads: IdSet = s
            .managed_threads_live
            .keys()
            .map(|t| ResourceId(*t))
            .collect();
        if !managed {
            // Without a registry every OS thread is native.
            native_thread_ids.extend(live_threads.iter().copied());
        }

        Ok(Snapshot {
            heap_used: s.heap_used,
            mmap_used: s.mmap_used,
            heap_count: s.heap_count,
            uss: s.uss,
            rss: s.rss,
            vms: s.vms,
            open_descriptors: s.descriptors.clone(),
            open_handles: s.handles.clone(),
            live_threads: if managed { live_threads } else { IdSet::new() },
            native_thread_ids,
            uncollectable_count: s.uncollectable.len() as u64,
            uncollectable_ids: s.uncollectable.clone(),
            timestamp: Instant::now(),
        })
    }

    fn capabilities(&self) -> Capabilities {
        let s = self.lock();
        Capabilities {
            platform: s.platform,
            managed_threads: s.managed_threads,
            cycle_collector: s.cycle_collector,
        }
    }

    fn force_collection(&mut self) {
        let mut s = self.lock();
        s.collections += 1;
        let found = std::mem::take(&mut s.pending_cycles);
        s.uncollectable.extend(found);
    }

    fn release_free_memory(&mut self) {
        self.lock().trims += 1;
    }
}
