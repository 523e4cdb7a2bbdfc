use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. Logs go to stderr so that
/// command output stays pipeable.
pub fn configure_logging(verbose: bool) {
    let default = if verbose { "fanout=debug" } else { "fanout=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Short hex digest used for name randomness and node identifiers.
pub fn hash_value(s: impl AsRef<[u8]>, characters: usize) -> String {
    let digest = Sha256::digest(s.as_ref());
    let mut out = hex::encode(digest);
    out.truncate(characters);
    out
}

/// Seconds since the unix epoch.
pub fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Whole seconds since the unix epoch, for use in blob names.
pub fn epoch_seconds_int() -> u64 {
    epoch_seconds() as u64
}

pub fn human_readable_size(num: u64) -> String {
    let mut num = num as f64;
    for unit in ["", "Ki", "Mi", "Gi", "Ti", "Pi", "Ei", "Zi"] {
        if num.abs() < 1024.0 {
            return format!("{:.1} {}B", num, unit);
        }
        num /= 1024.0;
    }
    format!("{:.1} YiB", num)
}

pub fn truncate(s: &str, max_length: usize) -> String {
    if s.len() < max_length {
        s.to_string()
    } else {
        let cut = s
            .char_indices()
            .map(|(i, _)| i)
            .take_while(|i| *i <= max_length)
            .last()
            .unwrap_or(0);
        format!("{}...", &s[..cut])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_value() {
        let h = hash_value("hello", 8);
        assert_eq!(h.len(), 8);
        assert_eq!(h, hash_value("hello", 8));
        assert_ne!(h, hash_value("world", 8));
    }

    #[test]
    fn test_human_readable_size() {
        assert_eq!(human_readable_size(512), "512.0 B");
        assert_eq!(human_readable_size(2048), "2.0 KiB");
        assert_eq!(human_readable_size(5 * 1024 * 1024), "5.0 MiB");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("0123456789abcdef", 4), "0123...");
    }
}
