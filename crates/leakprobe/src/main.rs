//! leakprobe - leak detector self-check.
//!
//! Prints what the probe sees in the current process and runs the detector
//! against built-in targets with known behaviour, to verify detection works
//! on this host.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;
#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::fs::File;
use std::hint::black_box;
use std::process::ExitCode;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Local;
use clap::{Parser, Subcommand};
use tracing::{Level, debug, error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

#[cfg(not(target_env = "msvc"))]
use leakprobe_core::collector::JemallocHeap;
#[cfg(target_env = "msvc")]
use leakprobe_core::collector::HeapInfo;
use leakprobe_core::collector::{ProcessProbe, RealFs};
use leakprobe_core::fmt::{FmtStyle, format_bytes};
use leakprobe_core::{
    CheckerConfig, LeakConfig, LeakDetector, LeakError, Snapshot, SnapshotProvider, Tolerance,
};

/// Leak detector self-check.
#[derive(Parser)]
#[command(name = "leakprobe", about = "Leak detector self-check", version)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Print machine-readable JSON instead of text.
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Capture and print one snapshot of this process.
    Snapshot,
    /// Run the detector against targets with known leaks.
    Selftest(SelftestArgs),
}

#[derive(clap::Args)]
struct SelftestArgs {
    /// JSON file with detection parameters. Flags below override it.
    #[arg(long, value_name = "PATH")]
    config: Option<String>,

    /// Calls per round.
    #[arg(long)]
    times: Option<u32>,

    /// Maximum number of rounds.
    #[arg(long)]
    retries: Option<u32>,

    /// Calls before the baseline.
    #[arg(long)]
    warmup: Option<u32>,

    /// Growth tolerated for every memory metric (e.g., "1M", "64K", "4096").
    #[arg(long, default_value = "1M", value_parser = parse_size)]
    tolerance: u64,

    /// Milliseconds spawned threads get to exit after the checked call.
    #[arg(long)]
    thread_grace_ms: Option<u64>,
}

/// Parses a human-readable size string (e.g., "1G", "500M", "1024K") into bytes.
fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size string".to_string());
    }

    let (num_str, multiplier) = if let Some(num) = s.strip_suffix('G') {
        (num, 1024 * 1024 * 1024)
    } else if let Some(num) = s.strip_suffix('M') {
        (num, 1024 * 1024)
    } else if let Some(num) = s.strip_suffix('K') {
        (num, 1024)
    } else {
        (s, 1)
    };

    num_str
        .trim()
        .parse::<u64>()
        .map_err(|e| format!("invalid size '{}': {}", s, e))?
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size '{}' is too large", s))
}

/// Initializes the tracing subscriber with the appropriate log level.
/// Default level is INFO. Use -q for quiet mode (errors only).
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[cfg(not(target_env = "msvc"))]
fn current_probe() -> ProcessProbe<RealFs, JemallocHeap> {
    ProcessProbe::current()
}

#[cfg(target_env = "msvc")]
fn current_probe() -> ProcessProbe<RealFs, HeapInfo> {
    ProcessProbe::new(RealFs::new(), "/proc/self", HeapInfo::default())
}

/// Human-readable multi-line summary of a snapshot.
fn describe_snapshot(snapshot: &Snapshot) -> String {
    let bytes = |b: u64| format_bytes(b, FmtStyle::Detail);
    let mut lines = vec![
        format!(
            "memory: heap={} mmap={} uss={} rss={} vms={}",
            bytes(snapshot.heap_used),
            bytes(snapshot.mmap_used),
            bytes(snapshot.uss),
            bytes(snapshot.rss),
            bytes(snapshot.vms)
        ),
        format!("descriptors: {}", snapshot.open_descriptors.len()),
        format!(
            "threads: {} native, {} managed",
            snapshot.native_thread_ids.len(),
            snapshot.live_threads.len()
        ),
    ];
    if let Some(heaps) = snapshot.heap_count {
        lines.push(format!("heaps: {}", heaps));
    }
    if !snapshot.open_handles.is_empty() {
        lines.push(format!("handles: {}", snapshot.open_handles.len()));
    }
    lines.join("\n")
}

fn run_snapshot(json: bool) -> ExitCode {
    let mut probe = current_probe();
    let snapshot = match probe.capture() {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to capture snapshot: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if json {
        match serde_json::to_string_pretty(&snapshot) {
            Ok(out) => println!("{}", out),
            Err(e) => {
                error!("Failed to serialize snapshot: {}", e);
                return ExitCode::FAILURE;
            }
        }
    } else {
        println!("{}", Local::now().format("%Y-%m-%d %H:%M:%S"));
        println!("{}", describe_snapshot(&snapshot));
    }
    ExitCode::SUCCESS
}

fn build_config(args: &SelftestArgs, verbose: u8, quiet: bool) -> Result<LeakConfig, LeakError> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| LeakError::InvalidConfig(format!("cannot read {}: {}", path, e)))?;
            LeakConfig::from_json(&text)?
        }
        None => LeakConfig::new().with_tolerance(Tolerance::Uniform(args.tolerance)),
    };
    if let Some(times) = args.times {
        config = config.with_times(times);
    }
    if let Some(retries) = args.retries {
        config = config.with_retries(retries);
    }
    if let Some(warmup) = args.warmup {
        config = config.with_warmup_times(warmup);
    }
    if let Some(ms) = args.thread_grace_ms {
        config = config.with_thread_grace(Duration::from_millis(ms));
    }
    let verbosity = if quiet { 0 } else { 1 + verbose.min(1) };
    config = config.with_verbosity(verbosity);
    config.validate()?;
    Ok(config)
}

/// Kind of leak a self-test target is built to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Clean,
    Descriptor,
    NativeThread,
    Memory,
}

impl Expect {
    fn name(self) -> &'static str {
        match self {
            Expect::Clean => "no leak",
            Expect::Descriptor => "descriptor leak",
            Expect::NativeThread => "native thread leak",
            Expect::Memory => "memory leak",
        }
    }

    fn matches(self, result: &Result<leakprobe_core::Verdict, LeakError>) -> bool {
        use leakprobe_core::Leak;
        match (self, result) {
            (Expect::Clean, Ok(_)) => true,
            (Expect::Descriptor, Err(e)) => {
                e.leaks().len() == 1 && matches!(e.leaks()[0], Leak::Descriptor(_))
            }
            (Expect::NativeThread, Err(e)) => {
                e.leaks().len() == 1 && matches!(e.leaks()[0], Leak::NativeThread(_))
            }
            (Expect::Memory, Err(e)) => e.report().and_then(|r| r.memory()).is_some(),
            _ => false,
        }
    }
}

struct Outcome {
    expect: Expect,
    passed: bool,
    detail: String,
}

fn describe_result(result: &Result<leakprobe_core::Verdict, LeakError>) -> String {
    match result {
        Ok(verdict) => format!("passed after {} round(s)", verdict.records.len()),
        Err(e) => e.to_string(),
    }
}

fn check(
    expect: Expect,
    config: &LeakConfig,
    checkers: &[&str],
    target: impl FnMut(),
) -> Result<Outcome, LeakError> {
    let config = config
        .clone()
        .with_checkers(CheckerConfig::only(checkers.iter().copied())?);
    info!("Checking {}", expect.name());
    let result = match LeakDetector::new(current_probe(), config).execute(target) {
        Err(LeakError::MetricsUnavailable(e)) => return Err(LeakError::MetricsUnavailable(e)),
        other => other,
    };
    let passed = expect.matches(&result);
    debug!(passed, "Finished {}", expect.name());
    Ok(Outcome {
        expect,
        passed,
        detail: describe_result(&result),
    })
}

fn run_selftest(config: &LeakConfig) -> Result<Vec<Outcome>, LeakError> {
    let mut outcomes = Vec::new();

    outcomes.push(check(Expect::Clean, config, &["fds", "native_threads", "memory"], || {
        drop(black_box(vec![0u8; 4096]));
    })?);

    let mut files: Vec<File> = Vec::new();
    let descriptor = check(Expect::Descriptor, config, &["fds"], || {
        if let Ok(f) = File::open("/proc/self/status") {
            files.push(f);
        }
    });
    drop(files);
    outcomes.push(descriptor?);

    let mut parked: Vec<(mpsc::Sender<()>, JoinHandle<()>)> = Vec::new();
    let threads = check(Expect::NativeThread, config, &["native_threads"], || {
        let (tx, rx) = mpsc::channel::<()>();
        let handle = thread::spawn(move || {
            let _ = rx.recv();
        });
        parked.push((tx, handle));
    });
    for (tx, handle) in parked {
        drop(tx);
        let _ = handle.join();
    }
    outcomes.push(threads?);

    let mut retained: Vec<Vec<u8>> = Vec::new();
    let memory = check(Expect::Memory, config, &["memory"], || {
        retained.push(vec![1u8; 64 * 1024]);
    });
    drop(retained);
    outcomes.push(memory?);

    Ok(outcomes)
}

fn print_outcomes(outcomes: &[Outcome], json: bool) {
    if json {
        let values: Vec<serde_json::Value> = outcomes
            .iter()
            .map(|o| {
                serde_json::json!({
                    "expect": o.expect.name(),
                    "passed": o.passed,
                    "detail": o.detail,
                })
            })
            .collect();
        println!("{}", serde_json::Value::Array(values));
        return;
    }
    for o in outcomes {
        let status = if o.passed { "ok  " } else { "FAIL" };
        println!("{} {}", status, o.expect.name());
        if !o.passed || o.expect != Expect::Clean {
            for line in o.detail.lines() {
                println!("       {}", line);
            }
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);
    debug!("leakprobe {} starting", env!("CARGO_PKG_VERSION"));

    match &args.command {
        Command::Snapshot => run_snapshot(args.json),
        Command::Selftest(selftest) => {
            let config = match build_config(selftest, args.verbose, args.quiet) {
                Ok(c) => c,
                Err(e) => {
                    error!("{}", e);
                    return ExitCode::FAILURE;
                }
            };
            info!(
                "Config: times={}, retries={}, warmup={}",
                config.times, config.retries, config.warmup_times
            );
            match run_selftest(&config) {
                Ok(outcomes) => {
                    print_outcomes(&outcomes, args.json);
                    if outcomes.iter().all(|o| o.passed) {
                        ExitCode::SUCCESS
                    } else {
                        ExitCode::FAILURE
                    }
                }
                Err(e) => {
                    error!("Self-test aborted: {}", e);
                    ExitCode::FAILURE
                }
            }
        }
    }
}
