//! Shared formatting helpers for diagnostics.
//!
//! Functions that differ between the compact round table and verbose
//! snapshot dumps are parameterized via [`FmtStyle`].

/// Controls compact (round table) vs verbose (snapshot dump) output.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum FmtStyle {
    /// Compact: integer values, short suffixes ("928B", "1K", "3M")
    Compact,
    /// Detail: one decimal, full suffixes ("1.5 GiB", "512 B")
    Detail,
}

const UNITS: [(u64, &str, &str); 4] = [
    (1 << 40, "T", " TiB"),
    (1 << 30, "G", " GiB"),
    (1 << 20, "M", " MiB"),
    (1 << 10, "K", " KiB"),
];

/// Format byte count as human-readable size.
///
/// Compact: `"1G"`, `"100M"`, `"50K"`, `"512B"` (values truncated)
/// Detail:  `"1.5 GiB"`, `"100.3 MiB"`, `"50.0 KiB"`, `"512 B"`
pub fn format_bytes(bytes: u64, style: FmtStyle) -> String {
    for (size, compact, detail) in UNITS {
        if bytes >= size {
            return match style {
                FmtStyle::Compact => format!("{}{}", bytes / size, compact),
                FmtStyle::Detail => format!("{:.1}{}", bytes as f64 / size as f64, detail),
            };
        }
    }
    match style {
        FmtStyle::Compact => format!("{}B", bytes),
        FmtStyle::Detail => format!("{} B", bytes),
    }
}

/// Format a signed byte delta for the round table: `"+928B"`, `"+1K"`, `"-2M"`.
pub fn format_bytes_delta(delta: i64) -> String {
    let sign = if delta < 0 { "-" } else { "+" };
    format!("{}{}", sign, format_bytes(delta.unsigned_abs(), FmtStyle::Compact))
}

/// Format a signed object-count delta: `"+3"`, `"-1"`.
pub fn format_count_delta(delta: i64) -> String {
    format!("{:+}", delta)
}
