//! Capped in-memory ring buffer for a task's combined stdout/stderr stream.
//!
//! Feeds both the local `StreamTaskLogs` RPC and the eventual `Result.logs`
//! field. Overflow truncates the oldest bytes and marks the buffer as
//! truncated rather than growing without bound (spec §9: "avoid unbounded
//! buffers even for long-lived tasks").

use std::collections::VecDeque;
use std::sync::Mutex;

struct Inner {
    data: VecDeque<u8>,
    truncated: bool,
}

pub struct RingBuffer {
    cap_bytes: usize,
    marker: String,
    inner: Mutex<Inner>,
}

impl RingBuffer {
    pub fn new(cap_bytes: usize, marker: String) -> Self {
        Self {
            cap_bytes: cap_bytes.max(1),
            marker,
            inner: Mutex::new(Inner {
                data: VecDeque::new(),
                truncated: false,
            }),
        }
    }

    /// Appends a chunk, dropping the oldest bytes if the cap is exceeded.
    pub fn push(&self, chunk: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        inner.data.extend(chunk.iter().copied());
        if inner.data.len() > self.cap_bytes {
            let overflow = inner.data.len() - self.cap_bytes;
            inner.data.drain(..overflow);
            inner.truncated = true;
        }
    }

    /// Returns the accumulated logs as lossy UTF-8, prefixed with the
    /// truncation marker when bytes were dropped, and whether truncation
    /// occurred.
    pub fn snapshot(&self) -> (String, bool) {
        let inner = self.inner.lock().unwrap();
        let bytes: Vec<u8> = inner.data.iter().copied().collect();
        let text = String::from_utf8_lossy(&bytes).into_owned();
        if inner.truncated {
            (format!("{}{}", self.marker, text), true)
        } else {
            (text, false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_under_cap_is_not_truncated() {
        let rb = RingBuffer::new(1024, "[...]".to_string());
        rb.push(b"hello ");
        rb.push(b"world");
        let (text, truncated) = rb.snapshot();
        assert_eq!(text, "hello world");
        assert!(!truncated);
    }

    #[test]
    fn overflow_drops_oldest_and_marks_truncated() {
        let rb = RingBuffer::new(5, "[T]".to_string());
        rb.push(b"abcdefgh");
        let (text, truncated) = rb.snapshot();
        assert!(truncated);
        assert_eq!(text, "[T]defgh");
    }
}
