//! Formatting helpers for CLI output.

use comfy_table::{ContentArrangement, Table};
use dockboot_core::ProgressUpdate;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;
const TIB: u64 = 1024 * GIB;

/// Create a two-column key/value table.
pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.load_preset(comfy_table::presets::NOTHING);
    table.set_header(headers);
    table
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= TIB {
        format!("{:.1} TiB", bytes as f64 / TIB as f64)
    } else if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Parse a disk size like "512M", "2GiB", "1t" into bytes.
///
/// Suffixes are binary and case-insensitive: `k`/`kib`, `m`/`mib`, `g`/`gib`,
/// `t`/`tib`, with an optional trailing `b` on the short forms. No suffix means bytes.
pub fn parse_size_bytes(s: &str) -> Result<u64, String> {
    let s = s.trim().to_lowercase();
    if s.is_empty() {
        return Err("empty size value".to_string());
    }

    let suffixes: [(&str, u64); 12] = [
        ("tib", TIB),
        ("tb", TIB),
        ("t", TIB),
        ("gib", GIB),
        ("gb", GIB),
        ("g", GIB),
        ("mib", MIB),
        ("mb", MIB),
        ("m", MIB),
        ("kib", KIB),
        ("kb", KIB),
        ("k", KIB),
    ];
    let (num_str, multiplier) = suffixes
        .iter()
        .find_map(|(suffix, mult)| s.strip_suffix(suffix).map(|n| (n, *mult)))
        .or_else(|| s.strip_suffix('b').map(|n| (n, 1)))
        .unwrap_or((s.as_str(), 1));

    let num: u64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("invalid size value: {s}"))?;

    num.checked_mul(multiplier)
        .ok_or_else(|| format!("size too large: {s}"))
}

/// Render one progress update as a single status line.
pub fn render_progress(update: &ProgressUpdate) -> String {
    format!(
        "[{:>3}%] {:<10} {}",
        (update.fraction * 100.0).round() as u32,
        update.phase.name(),
        update.message
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use dockboot_core::Phase;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(512 * MIB), "512.0 MiB");
        assert_eq!(format_bytes(2 * GIB), "2.0 GiB");
        assert_eq!(format_bytes(3 * TIB), "3.0 TiB");
    }

    #[test]
    fn test_parse_size_short_suffixes() {
        assert_eq!(parse_size_bytes("512M").unwrap(), 512 * MIB);
        assert_eq!(parse_size_bytes("2G").unwrap(), 2 * GIB);
        assert_eq!(parse_size_bytes("1t").unwrap(), TIB);
        assert_eq!(parse_size_bytes("64k").unwrap(), 64 * KIB);
    }

    #[test]
    fn test_parse_size_binary_suffixes() {
        assert_eq!(parse_size_bytes("512MiB").unwrap(), 512 * MIB);
        assert_eq!(parse_size_bytes("4GiB").unwrap(), 4 * GIB);
        assert_eq!(parse_size_bytes("1TiB").unwrap(), TIB);
        assert_eq!(parse_size_bytes("3gb").unwrap(), 3 * GIB);
    }

    #[test]
    fn test_parse_size_plain_bytes() {
        assert_eq!(parse_size_bytes("536870912").unwrap(), 512 * MIB);
        assert_eq!(parse_size_bytes("4096b").unwrap(), 4096);
        assert_eq!(parse_size_bytes(" 2G ").unwrap(), 2 * GIB);
    }

    #[test]
    fn test_parse_size_invalid() {
        assert!(parse_size_bytes("").is_err());
        assert!(parse_size_bytes("abc").is_err());
        assert!(parse_size_bytes("1.5G").is_err());
        assert!(parse_size_bytes("-1G").is_err());
        assert!(parse_size_bytes("99999999999T").is_err());
    }

    #[test]
    fn test_render_progress() {
        let update = ProgressUpdate {
            phase: Phase::Populate,
            fraction: 0.7,
            message: "Copying 12 entries".to_string(),
            timestamp: chrono::Utc::now(),
        };
        assert_eq!(render_progress(&update), "[ 70%] populate   Copying 12 entries");
    }
}
