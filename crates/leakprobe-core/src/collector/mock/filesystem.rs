//! In-memory mock filesystem for testing the probe without real `/proc`.

use crate::collector::traits::FileSystem;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};

/// In-memory filesystem for testing.
///
/// Stores files and directories in memory, allowing tests to simulate
/// `/proc/self` states on any platform.
#[derive(Debug, Clone, Default)]
pub struct MockFs {
    /// Map from path to file contents.
    files: HashMap<PathBuf, String>,
    /// Set of directories (for read_dir support).
    directories: HashSet<PathBuf>,
    /// Entries reported by `read_dir` that no longer exist afterwards,
    /// like the descriptor `read_dir` itself uses on `/proc/self/fd`.
    transient: HashSet<PathBuf>,
}

impl MockFs {
    /// Creates a new empty mock filesystem.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a file with the given content.
    ///
    /// Parent directories are automatically created.
    pub fn add_file(&mut self, path: impl AsRef<Path>, content: impl Into<String>) {
        let path = path.as_ref().to_path_buf();
        self.add_parents(&path);
        self.files.insert(path, content.into());
    }

    /// Adds an empty directory.
    pub fn add_dir(&mut self, path: impl AsRef<Path>) {
        let path = path.as_ref().to_path_buf();
        self.add_parents(&path);
        self.directories.insert(path);
    }

    /// Removes a file, e.g. to simulate closing a descriptor.
    pub fn remove_file(&mut self, path: impl AsRef<Path>) {
        self.files.remove(path.as_ref());
        self.transient.remove(path.as_ref());
    }

    /// Adds an entry that shows up in its parent's listing but reports
    /// as missing when checked with `exists`.
    pub fn add_transient_entry(&mut self, path: impl AsRef<Path>) {
        let path = path.as_ref().to_path_buf();
        self.add_parents(&path);
        self.transient.insert(path);
    }

    /// Lays out `/proc/self` for a process with the given memory files,
    /// open descriptors and OS threads.
    pub fn add_self_process(
        &mut self,
        status: &str,
        smaps_rollup: &str,
        fds: &[u32],
        tasks: &[u32],
    ) {
        self.add_file("/proc/self/status", status);
        self.add_file("/proc/self/smaps_rollup", smaps_rollup);
        self.add_dir("/proc/self/fd");
        self.add_dir("/proc/self/task");
        for fd in fds {
            self.open_fd(*fd);
        }
        for tid in tasks {
            self.add_dir(format!("/proc/self/task/{}", tid));
        }
    }

    /// Simulates opening descriptor `fd`.
    pub fn open_fd(&mut self, fd: u32) {
        self.add_file(format!("/proc/self/fd/{}", fd), "");
    }

    /// Simulates closing descriptor `fd`.
    pub fn close_fd(&mut self, fd: u32) {
        self.remove_file(format!("/proc/self/fd/{}", fd));
    }

    fn add_parents(&mut self, path: &Path) {
        let mut parent = path.parent();
        while let Some(p) = parent {
            if !p.as_os_str().is_empty() {
                self.directories.insert(p.to_path_buf());
            }
            parent = p.parent();
        }
    }
}

impl FileSystem for MockFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        self.files.get(path).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("file not found: {:?}", path),
            )
        })
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.contains_key(path) || self.directories.contains(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        if !self.directories.contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("directory not found: {:?}", path),
            ));
        }

        let mut entries = HashSet::new();

        for child in self
            .files
            .keys()
            .chain(self.directories.iter())
            .chain(self.transient.iter())
        {
            if child.parent().is_some_and(|parent| parent == path) && child != path {
                entries.insert(child.clone());
            }
        }

        Ok(entries.into_iter().collect())
    }
}
