//! Snapshot provider reading the current process from `/proc/self`.

use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::trace;

use crate::collector::gc::CycleCollector;
use crate::collector::heap::HeapStats;
use crate::collector::procfs::parser::{
    parse_numeric_entry, parse_proc_status, parse_smaps_rollup_uss,
};
use crate::collector::threads::ThreadRegistry;
use crate::collector::traits::FileSystem;
use crate::provider::{ProviderError, SnapshotProvider};
use crate::snapshot::{Capabilities, IdSet, Platform, ResourceId, Snapshot};

/// Captures snapshots of the calling process from procfs.
///
/// Memory counters come from `status` and `smaps_rollup`, descriptors from
/// `fd/`, OS threads from `task/`, heap counters from a [`HeapStats`]
/// source. Attach a [`ThreadRegistry`] to split managed threads from
/// native ones, and a [`CycleCollector`] to enable the garbage checker.
pub struct ProcessProbe<F: FileSystem, H: HeapStats> {
    fs: F,
    proc_self: PathBuf,
    heap: H,
    threads: Option<ThreadRegistry>,
    collector: Option<Box<dyn CycleCollector>>,
}

#[cfg(all(feature = "jemalloc", not(target_env = "msvc")))]
impl ProcessProbe<crate::collector::RealFs, crate::collector::JemallocHeap> {
    /// Probe for the running process using jemalloc heap statistics.
    pub fn current() -> Self {
        Self::new(
            crate::collector::RealFs::new(),
            "/proc/self",
            crate::collector::JemallocHeap,
        )
    }
}

impl<F: FileSystem, H: HeapStats> ProcessProbe<F, H> {
    /// Creates a probe.
    ///
    /// # Arguments
    /// * `fs` - Filesystem implementation (real or mock)
    /// * `proc_self` - Path of the process directory (usually "/proc/self")
    /// * `heap` - Allocator statistics source
    pub fn new(fs: F, proc_self: impl Into<PathBuf>, heap: H) -> Self {
        Self {
            fs,
            proc_self: proc_self.into(),
            heap,
            threads: None,
            collector: None,
        }
    }

    /// Tracks managed threads through `registry`.
    pub fn with_thread_registry(mut self, registry: ThreadRegistry) -> Self {
        self.threads = Some(registry);
        self
    }

    /// Inspects `collector` for uncollectable garbage.
    pub fn with_cycle_collector(mut self, collector: impl CycleCollector + 'static) -> Self {
        self.collector = Some(Box::new(collector));
        self
    }

    /// Returns a reference to the filesystem.
    pub fn fs(&self) -> &F {
        &self.fs
    }

    /// Returns a mutable reference to the filesystem.
    pub fn fs_mut(&mut self) -> &mut F {
        &mut self.fs
    }

    fn read(&self, name: &str) -> Result<String, ProviderError> {
        let path = self.proc_self.join(name);
        self.fs
            .read_to_string(&path)
            .map_err(|error| ProviderError::Io {
                source_name: path.display().to_string(),
                error,
            })
    }

    fn list(&self, name: &str) -> Result<Vec<PathBuf>, ProviderError> {
        let path = self.proc_self.join(name);
        self.fs.read_dir(&path).map_err(|error| ProviderError::Io {
            source_name: path.display().to_string(),
            error,
        })
    }

    /// Open descriptors, minus the one used to list them: it is closed by
    /// the time the listing returns, so its entry no longer resolves.
    fn open_descriptors(&self) -> Result<IdSet, ProviderError> {
        Ok(self
            .list("fd")?
            .iter()
            .filter(|path| self.fs.exists(path))
            .filter_map(|path| parse_numeric_entry(path))
            .map(ResourceId)
            .collect())
    }

    fn os_threads(&self) -> Result<IdSet, ProviderError> {
        Ok(self
            .list("task")?
            .iter()
            .filter_map(|path| parse_numeric_entry(path))
            .map(ResourceId)
            .collect())
    }
}

fn parse_failure(path: &Path, message: String) -> ProviderError {
    ProviderError::Parse {
        source_name: path.display().to_string(),
        message,
    }
}

impl<F: FileSystem, H: HeapStats> SnapshotProvider for ProcessProbe<F, H> {
    fn capture(&mut self) -> Result<Snapshot, ProviderError> {
        let status = parse_proc_status(&self.read("status")?)
            .map_err(|e| parse_failure(&self.proc_self.join("status"), e.message))?;
        let uss = parse_smaps_rollup_uss(&self.read("smaps_rollup")?)
            .map_err(|e| parse_failure(&self.proc_self.join("smaps_rollup"), e.message))?;
        let heap = self.heap.read()?;
        let open_descriptors = self.open_descriptors()?;

        let mut native_thread_ids = self.os_threads()?;
        let live_threads = match &self.threads {
            Some(registry) => {
                for tid in registry.native_ids() {
                    native_thread_ids.remove(&tid);
                }
                registry.live_threads()
            }
            None => IdSet::new(),
        };

        let uncollectable_ids: IdSet = self
            .collector
            .as_ref()
            .map(|c| c.uncollectable().into_iter().collect())
            .unwrap_or_default();

        trace!(
            rss = status.vm_rss,
            fds = open_descriptors.len(),
            native_threads = native_thread_ids.len(),
            os_threads = status.threads,
            "captured /proc/self snapshot"
        );

        Ok(Snapshot {
            heap_used: heap.heap_used,
            mmap_used: heap.mmap_used,
            heap_count: heap.heap_count,
            uss,
            rss: status.vm_rss,
            vms: status.vm_size,
            open_descriptors,
            open_handles: IdSet::new(),
            live_threads,
            native_thread_ids,
            uncollectable_count: uncollectable_ids.len() as u64,
            uncollectable_ids,
            timestamp: Instant::now(),
        })
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            platform: Platform::Linux,
            managed_threads: self.threads.is_some(),
            cycle_collector: self.collector.is_some(),
        }
    }

    fn force_collection(&mut self) {
        if let Some(collector) = self.collector.as_mut() {
            collector.collect();
        }
    }

    fn release_free_memory(&mut self) {
        self.heap.trim();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::heap::HeapInfo;
    use crate::collector::mock::MockFs;

    fn probe(fs: MockFs) -> ProcessProbe<MockFs, HeapInfo> {
        let heap = HeapInfo {
            heap_used: 4096,
            mmap_used: 1 << 20,
            heap_count: None,
        };
        ProcessProbe::new(fs, "/proc/self", heap)
    }

    #[test]
    fn test_capture_typical_process() {
        let mut probe = probe(MockFs::typical_self());
        let snap = probe.capture().unwrap();

        assert_eq!(snap.rss, 8000 * 1024);
        assert_eq!(snap.vms, 18000 * 1024);
        assert_eq!(snap.uss, 6400 * 1024);
        assert_eq!(snap.heap_used, 4096);
        assert_eq!(snap.mmap_used, 1 << 20);
        assert_eq!(snap.heap_count, None);
        assert_eq!(snap.open_descriptors.len(), 4);
        assert_eq!(snap.native_thread_ids.len(), 2);
        assert!(snap.open_handles.is_empty());
        assert!(snap.live_threads.is_empty());
    }

    #[test]
    fn test_status_thread_count_matches_task_listing() {
        let fs = MockFs::typical_self();
        let status = parse_proc_status(&fs.read_to_string(Path::new("/proc/self/status")).unwrap())
            .unwrap();
        let snap = probe(fs).capture().unwrap();
        assert_eq!(status.threads, snap.native_thread_ids.len() as u64);
    }

    #[test]
    fn test_listing_descriptor_is_excluded() {
        let mut fs = MockFs::typical_self();
        fs.add_transient_entry("/proc/self/fd/4");
        let mut probe = probe(fs);

        let snap = probe.capture().unwrap();
        assert!(!snap.open_descriptors.contains(&ResourceId(4)));
    }

    #[test]
    fn test_consecutive_captures_are_identical() {
        let mut probe = probe(MockFs::typical_self());
        let a = probe.capture().unwrap();
        let b = probe.capture().unwrap();
        assert_eq!(a.open_descriptors, b.open_descriptors);
        assert_eq!(a.native_thread_ids, b.native_thread_ids);
        assert_eq!(a.rss, b.rss);
    }

    #[test]
    fn test_descriptor_opened_between_captures() {
        let mut probe = probe(MockFs::typical_self());
        let before = probe.capture().unwrap();
        probe.fs_mut().open_fd(9);
        let after = probe.capture().unwrap();

        let leaked: Vec<_> = after
            .open_descriptors
            .difference(&before.open_descriptors)
            .collect();
        assert_eq!(leaked, vec![&ResourceId(9)]);
    }

    #[test]
    fn test_missing_status_is_unavailable() {
        let mut probe = probe(MockFs::new());
        let err = probe.capture().unwrap_err();
        assert!(matches!(err, ProviderError::Io { .. }));
        assert!(err.to_string().contains("/proc/self/status"));
    }

    #[test]
    fn test_malformed_status_is_parse_error() {
        let mut fs = MockFs::typical_self();
        fs.add_file("/proc/self/status", "Name:\tbroken\n");
        let err = probe(fs).capture().unwrap_err();
        assert!(matches!(err, ProviderError::Parse { .. }));
    }

    struct FakeCollector {
        pending: Vec<ResourceId>,
        found: Vec<ResourceId>,
    }

    impl CycleCollector for FakeCollector {
        fn collect(&mut self) {
            self.found.append(&mut self.pending);
        }

        fn uncollectable(&self) -> Vec<ResourceId> {
            self.found.clone()
        }
    }

    #[test]
    fn test_uncollectable_garbage_after_collection() {
        let mut probe = probe(MockFs::typical_self()).with_cycle_collector(FakeCollector {
            pending: vec![ResourceId(0xA0), ResourceId(0xB0)],
            found: Vec::new(),
        });
        assert!(probe.capabilities().cycle_collector);
        assert_eq!(probe.capture().unwrap().uncollectable_count, 0);

        probe.force_collection();
        let snap = probe.capture().unwrap();
        assert_eq!(snap.uncollectable_count, 2);
        assert!(snap.uncollectable_ids.contains(&ResourceId(0xB0)));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_registry_threads_are_not_native() {
        use std::sync::mpsc;

        let registry = ThreadRegistry::new();
        let (ready_tx, ready_rx) = mpsc::channel();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let handle = registry
            .spawn("worker", move || {
                ready_tx.send(()).unwrap();
                let _ = stop_rx.recv();
            })
            .unwrap();
        ready_rx.recv().unwrap();

        let tid = *registry.native_ids().first().unwrap();
        let mut fs = MockFs::typical_self();
        fs.add_dir(format!("/proc/self/task/{}", tid));
        let mut probe = probe(fs).with_thread_registry(registry.clone());

        let snap = probe.capture().unwrap();
        assert!(!snap.native_thread_ids.contains(&tid));
        assert_eq!(snap.native_thread_ids.len(), 2);
        assert_eq!(snap.live_threads.len(), 1);

        drop(stop_tx);
        handle.join().unwrap();
        assert!(registry.live_threads().is_empty());
    }

    #[test]
    fn test_capabilities_follow_attachments() {
        let probe = probe(MockFs::typical_self());
        assert!(!probe.capabilities().managed_threads);

        let probe = probe.with_thread_registry(ThreadRegistry::new());
        let caps = probe.capabilities();
        assert!(caps.managed_threads);
        assert!(!caps.cycle_collector);
        assert_eq!(caps.platform, Platform::Linux);
    }
}
