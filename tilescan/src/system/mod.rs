//! System introspection.
//!
//! Only the total-memory lookup survives here; it feeds the admission-time
//! memory estimate in [`crate::estimate`].

/// Fallback when the platform offers no reliable detection.
const DEFAULT_TOTAL_MEMORY: u64 = 16 * 1024 * 1024 * 1024; // 16 GiB

/// Detects total system memory in bytes.
///
/// - **Linux**: parses `/proc/meminfo`
/// - **Other platforms**: returns a conservative 16 GiB default
#[cfg(target_os = "linux")]
pub fn total_memory() -> u64 {
    use std::fs;

    if let Ok(content) = fs::read_to_string("/proc/meminfo") {
        for line in content.lines() {
            if let Some(rest) = line.strip_prefix("MemTotal:") {
                let kb: Option<u64> = rest
                    .trim()
                    .trim_end_matches("kB")
                    .trim()
                    .parse()
                    .ok();
                if let Some(kb) = kb {
                    return kb * 1024;
                }
            }
        }
    }
    DEFAULT_TOTAL_MEMORY
}

/// Detects total system memory in bytes (non-Linux fallback).
#[cfg(not(target_os = "linux"))]
pub fn total_memory() -> u64 {
    DEFAULT_TOTAL_MEMORY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_memory_returns_positive() {
        let memory = total_memory();
        assert!(memory > 0);
        // Any real machine has at least 1 GiB
        assert!(memory >= 1024 * 1024 * 1024);
    }
}
