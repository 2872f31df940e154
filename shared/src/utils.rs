//! Utility functions shared by the master and worker binaries
//!
//! Hashing, timestamp, encoding, and validation helpers used on both sides
//! of the master/worker boundary.

use base64::{engine::general_purpose::STANDARD as B64_STANDARD, Engine as _};
use blake3::Hasher;
use std::time::{SystemTime, UNIX_EPOCH};

/// Calculate BLAKE3 checksum of a string, hex-encoded.
pub fn calculate_string_checksum(content: &str) -> String {
    let mut hasher = Hasher::new();
    hasher.update(content.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Validate a worker or task id.
///
/// Ids must be non-empty, no longer than 64 characters, and contain only
/// alphanumeric characters, hyphens, and underscores.
pub fn validate_id(label: &str, id: &str) -> crate::Result<()> {
    if id.is_empty() {
        return Err(crate::SchedulerError::Validation(format!("{label} cannot be empty")).into());
    }
    if id.len() > 64 {
        return Err(crate::SchedulerError::Validation(format!(
            "{label} cannot be longer than 64 characters"
        ))
        .into());
    }
    if !id.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_') {
        return Err(crate::SchedulerError::Validation(format!(
            "{label} can only contain alphanumeric characters, hyphens, and underscores"
        ))
        .into());
    }
    Ok(())
}

/// Get current Unix timestamp in seconds.
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Encode bytes to base64.
pub fn encode_base64(content: &[u8]) -> String {
    B64_STANDARD.encode(content)
}

/// Decode a base64 string into bytes.
pub fn decode_base64(encoded: &str) -> crate::Result<Vec<u8>> {
    B64_STANDARD
        .decode(encoded)
        .map_err(|e| crate::SchedulerError::Validation(format!("invalid base64 sequence: {e}")).into())
}

/// Reject relative-path escapes and absolute paths in a file's relative path.
///
/// Used at the upload/extraction API boundary (see on-disk layout rules);
/// a path containing `..` or starting with `/` is never written to disk.
pub fn validate_relative_path(path: &str) -> crate::Result<()> {
    if path.is_empty() {
        return Err(crate::SchedulerError::Validation("file path cannot be empty".into()).into());
    }
    if path.starts_with('/') || path.starts_with('\\') {
        return Err(crate::SchedulerError::Validation(format!(
            "file path '{path}' must not be absolute"
        ))
        .into());
    }
    if path.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(crate::SchedulerError::Validation(format!(
            "file path '{path}' must not contain '..' segments"
        ))
        .into());
    }
    Ok(())
}

/// Derive an auto-generated task name from its docker image, per the data
/// model's `<image>-<unix-ts>` convention.
pub fn auto_task_name(image: &str, submitted_at: u64) -> String {
    let sanitized: String = image
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect();
    format!("{sanitized}-{submitted_at}")
}

/// Truncate a string to a maximum byte length, appending a marker.
pub fn truncate_with_marker(s: &str, max_len: usize, marker: &str) -> (String, bool) {
    if s.len() <= max_len {
        return (s.to_string(), false);
    }
    let mut end = max_len;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    (format!("{marker}{}", &s[s.len() - end..]), true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_stable() {
        assert_eq!(
            calculate_string_checksum("hello"),
            calculate_string_checksum("hello")
        );
        assert_ne!(
            calculate_string_checksum("hello"),
            calculate_string_checksum("world")
        );
    }

    #[test]
    fn validate_id_rejects_bad_input() {
        assert!(validate_id("worker id", "").is_err());
        assert!(validate_id("worker id", &"a".repeat(65)).is_err());
        assert!(validate_id("worker id", "has space").is_err());
        assert!(validate_id("worker id", "w1-ok_1").is_ok());
    }

    #[test]
    fn relative_path_rejects_traversal_and_absolute() {
        assert!(validate_relative_path("../etc/passwd").is_err());
        assert!(validate_relative_path("/etc/passwd").is_err());
        assert!(validate_relative_path("a/../b").is_err());
        assert!(validate_relative_path("out/result.txt").is_ok());
    }

    #[test]
    fn auto_task_name_is_deterministic() {
        assert_eq!(auto_task_name("alpine:latest", 100), "alpine-latest-100");
    }

    #[test]
    fn truncate_marks_overflow() {
        let (out, truncated) = truncate_with_marker("abcdef", 3, "[...]");
        assert!(truncated);
        assert_eq!(out, "[...]def");
        let (out, truncated) = truncate_with_marker("ab", 3, "[...]");
        assert!(!truncated);
        assert_eq!(out, "ab");
    }
}
