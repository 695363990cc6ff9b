//! A thread joined before the call returns is not a leak.

#![cfg(all(target_os = "linux", not(target_env = "msvc")))]

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use std::thread;

use leakprobe_core::collector::ProcessProbe;
use leakprobe_core::{CheckerConfig, LeakConfig, LeakDetector, ResourceCategory};

#[test]
fn joined_thread_passes() {
    let config = LeakConfig::new()
        .with_verbosity(0)
        .with_checkers(CheckerConfig::only(["native_threads"]).unwrap());

    let verdict = LeakDetector::new(ProcessProbe::current(), config)
        .execute(|| {
            thread::spawn(|| 42).join().unwrap();
        })
        .unwrap();
    assert_eq!(verdict.resources_checked, vec![ResourceCategory::NativeThread]);
}
