//! Abstractions for filesystem access to enable testing and mocking.
//!
//! The `FileSystem` trait lets the process probe read the real `/proc/self`
//! on Linux or a mock tree in tests on any platform.

use std::io;
use std::path::{Path, PathBuf};

/// Abstraction for filesystem operations.
pub trait FileSystem {
    /// Reads the entire contents of a file as a string.
    fn read_to_string(&self, path: &Path) -> io::Result<String>;

    /// Checks if a path exists.
    ///
    /// For `/proc/self/fd/N` this follows the magic link, so it answers
    /// whether descriptor `N` is still open.
    fn exists(&self, path: &Path) -> bool;

    /// Lists entries in a directory.
    ///
    /// The directory handle used for the listing must be closed before
    /// this returns.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;
}

/// Real filesystem implementation that delegates to `std::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealFs;

impl RealFs {
    pub fn new() -> Self {
        Self
    }
}

impl FileSystem for RealFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let entries = std::fs::read_dir(path)?;
        let mut paths = Vec::new();
        for entry in entries {
            paths.push(entry?.path());
        }
        Ok(paths)
    }
}
