//! Parsers for `/proc/self` files.

use std::collections::HashMap;
use std::path::Path;

/// Error type for parse failures.
#[derive(Debug, Clone)]
pub struct ParseError {
    pub message: String,
}

impl ParseError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            message: msg.into(),
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "parse error: {}", self.message)
    }
}

impl std::error::Error for ParseError {}

/// Memory fields from `/proc/self/status`, in bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcStatus {
    pub vm_size: u64,
    pub vm_rss: u64,
    pub threads: u64,
}

/// Splits `key: value` lines into a map.
fn parse_fields(content: &str) -> HashMap<&str, &str> {
    content
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim(), value.trim()))
        .collect()
}

/// Reads a `"12345 kB"` field as bytes.
fn kb_field(fields: &HashMap<&str, &str>, key: &str) -> Option<u64> {
    fields
        .get(key)
        .and_then(|s| s.split_whitespace().next())
        .and_then(|s| s.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

/// Parses `/proc/self/status` content.
///
/// `VmSize` and `VmRSS` are mandatory; a kernel thread or a truncated read
/// that lacks them is an error rather than a zero.
pub fn parse_proc_status(content: &str) -> Result<ProcStatus, ParseError> {
    let fields = parse_fields(content);

    let vm_size = kb_field(&fields, "VmSize").ok_or_else(|| ParseError::new("missing VmSize"))?;
    let vm_rss = kb_field(&fields, "VmRSS").ok_or_else(|| ParseError::new("missing VmRSS"))?;
    let threads = fields
        .get("Threads")
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

    Ok(ProcStatus {
        vm_size,
        vm_rss,
        threads,
    })
}

/// Parses `/proc/self/smaps_rollup` and returns the unique set size in
/// bytes: private clean, private dirty and private hugetlb pages.
pub fn parse_smaps_rollup_uss(content: &str) -> Result<u64, ParseError> {
    let fields = parse_fields(content);

    let clean = kb_field(&fields, "Private_Clean");
    let dirty = kb_field(&fields, "Private_Dirty");
    if clean.is_none() && dirty.is_none() {
        return Err(ParseError::new("missing Private_Clean/Private_Dirty"));
    }

    Ok(clean.unwrap_or(0)
        + dirty.unwrap_or(0)
        + kb_field(&fields, "Private_Hugetlb").unwrap_or(0))
}

/// Parses the numeric file name of a `/proc/self/fd/N` or
/// `/proc/self/task/N` entry.
pub fn parse_numeric_entry(path: &Path) -> Option<u64> {
    path.file_name()?.to_str()?.parse().ok()
}
