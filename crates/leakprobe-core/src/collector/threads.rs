//! Registry of managed threads.
//!
//! Threads started through [`ThreadRegistry::spawn`] are tracked from the
//! moment they are spawned until their closure returns. The registry is the
//! bookkeeping the managed-thread checker diffs, and it lets the probe tell
//! managed threads apart from native ones that show up only in the OS
//! thread list.

use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use crate::snapshot::{IdSet, ResourceId};

#[derive(Debug, Default)]
struct RegistryState {
    next_id: u64,
    /// Registry id -> OS thread id, filled in once the thread runs.
    live: BTreeMap<u64, Option<u64>>,
}

/// Shared handle to a thread registry. Cloning yields another handle to
/// the same registry.
#[derive(Debug, Clone, Default)]
pub struct ThreadRegistry {
    state: Arc<Mutex<RegistryState>>,
}

/// Removes the thread from the registry when its closure finishes,
/// including by unwinding.
struct Registration {
    state: Arc<Mutex<RegistryState>>,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        lock(&self.state).live.remove(&self.id);
    }
}

fn lock(state: &Mutex<RegistryState>) -> MutexGuard<'_, RegistryState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// OS-level id of the calling thread.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn current_native_tid() -> Option<u64> {
    u64::try_from(nix::unistd::gettid().as_raw()).ok()
}

/// OS-level id of the calling thread.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn current_native_tid() -> Option<u64> {
    None
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns a named thread that stays registered while `f` runs.
    pub fn spawn<F, T>(&self, name: impl Into<String>, f: F) -> io::Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let id = {
            let mut state = lock(&self.state);
            let id = state.next_id;
            state.next_id += 1;
            state.live.insert(id, None);
            id
        };

        let state = Arc::clone(&self.state);
        let spawned = thread::Builder::new().name(name.into()).spawn(move || {
            if let Some(tid) = lock(&state).live.get_mut(&id) {
                *tid = current_native_tid();
            }
            let _registration = Registration { state, id };
            f()
        });

        if spawned.is_err() {
            lock(&self.state).live.remove(&id);
        }
        spawned
    }

    /// Registry ids of threads that are spawned and still running.
    pub fn live_threads(&self) -> IdSet {
        lock(&self.state).live.keys().map(|id| ResourceId(*id)).collect()
    }

    /// OS thread ids of the live registered threads.
    pub fn native_ids(&self) -> IdSet {
        lock(&self.state)
            .live
            .values()
            .flatten()
            .map(|tid| ResourceId(*tid))
            .collect()
    }
}
