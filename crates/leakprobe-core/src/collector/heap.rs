//! Allocator-level heap statistics.

use crate::provider::ProviderError;

/// Heap counters reported by the allocator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapInfo {
    /// Bytes currently allocated by the application.
    pub heap_used: u64,
    /// Bytes held in allocator mappings.
    pub mmap_used: u64,
    /// Number of private heaps (Windows only).
    pub heap_count: Option<u64>,
}

/// Source of allocator statistics.
pub trait HeapStats {
    /// Reads fresh counters.
    fn read(&self) -> Result<HeapInfo, ProviderError>;

    /// Returns unused allocator memory to the OS.
    fn trim(&self) {}
}

/// Fixed counters. Useful when the allocator exposes no statistics and in
/// tests.
impl HeapStats for HeapInfo {
    fn read(&self) -> Result<HeapInfo, ProviderError> {
        Ok(*self)
    }
}

/// Heap statistics from jemalloc.
///
/// Only meaningful when jemalloc is the global allocator of the process
/// (`#[global_allocator] static GLOBAL: Jemalloc = Jemalloc;`); otherwise
/// the counters stay flat and heap growth goes unnoticed.
#[cfg(all(feature = "jemalloc", not(target_env = "msvc")))]
#[derive(Debug, Default, Clone, Copy)]
pub struct JemallocHeap;

#[cfg(all(feature = "jemalloc", not(target_env = "msvc")))]
mod jemalloc {
    use super::{HeapInfo, HeapStats, JemallocHeap};
    use crate::provider::ProviderError;
    use std::ffi::CStr;
    use std::ptr;

    /// `MALLCTL_ARENAS_ALL`: purge dirty pages from every arena, not only
    /// the one of the calling thread.
    const PURGE_ALL_ARENAS: &CStr = c"arena.4096.purge";

    fn ctl_name(name: &'static CStr) -> &'static str {
        name.to_str().unwrap_or("<invalid>")
    }

    /// Statistics are cached by jemalloc until the epoch is advanced.
    fn advance_epoch() -> Result<(), ProviderError> {
        let mut epoch: u64 = 1;
        // SAFETY: "epoch" takes a u64 as new value; we pass a valid pointer
        // and its exact size.
        let code = unsafe {
            tikv_jemalloc_sys::mallctl(
                c"epoch".as_ptr(),
                ptr::null_mut(),
                ptr::null_mut(),
                (&mut epoch as *mut u64).cast(),
                size_of::<u64>(),
            )
        };
        if code != 0 {
            return Err(ProviderError::Allocator {
                name: "epoch",
                code,
            });
        }
        Ok(())
    }

    fn read_size(name: &'static CStr) -> Result<u64, ProviderError> {
        let mut value: usize = 0;
        let mut len = size_of::<usize>();
        // SAFETY: "stats.*" size counters are size_t; `value` and `len`
        // describe a buffer of exactly that size.
        let code = unsafe {
            tikv_jemalloc_sys::mallctl(
                name.as_ptr(),
                (&mut value as *mut usize).cast(),
                &mut len,
                ptr::null_mut(),
                0,
            )
        };
        if code != 0 {
            return Err(ProviderError::Allocator {
                name: ctl_name(name),
                code,
            });
        }
        Ok(value as u64)
    }

    impl HeapStats for JemallocHeap {
        fn read(&self) -> Result<HeapInfo, ProviderError> {
            advance_epoch()?;
            Ok(HeapInfo {
                heap_used: read_size(c"stats.allocated")?,
                mmap_used: read_size(c"stats.mapped")?,
                heap_count: None,
            })
        }

        fn trim(&self) {
            // SAFETY: purge takes no arguments.
            unsafe {
                tikv_jemalloc_sys::mallctl(
                    PURGE_ALL_ARENAS.as_ptr(),
                    ptr::null_mut(),
                    ptr::null_mut(),
                    ptr::null_mut(),
                    0,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_heap_info() {
        let info = HeapInfo {
            heap_used: 10,
            mmap_used: 20,
            heap_count: Some(1),
        };
        assert_eq!(info.read().unwrap(), info);
    }

    #[cfg(all(feature = "jemalloc", not(target_env = "msvc")))]
    #[test]
    fn test_jemalloc_stats_readable() {
        let heap = JemallocHeap;
        heap.trim();
        assert!(heap.read().is_ok());
    }
}
