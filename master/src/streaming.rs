//! Log & File Streaming (component G).
//!
//! Two log-retrieval behaviors behind one `LogChunk` stream, keyed by task
//! status (§4.7): a running task is relayed live from its worker; a terminal
//! task replays its stored `Result.logs`. Output-file upload reassembly
//! shares the path-traversal guard with the rest of the API boundary
//! (`shared::utils::validate_relative_path`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use flate2::read::GzDecoder;
use futures_util::{Stream, StreamExt};
use shared::api::{headers, worker_endpoints, LogChunk};
use shared::model::{FileMetadata, TaskResult, TaskStatus};
use shared::utils::{current_timestamp, validate_relative_path};
use shared::SchedulerError;
use tracing::warn;

pub type LogStream = Pin<Box<dyn Stream<Item = anyhow::Result<LogChunk>> + Send>>;

/// Terminal-task path: split the stored transcript on newlines and emit one
/// chunk per line with small pacing, so a client renders it progressively
/// instead of receiving one enormous chunk.
pub fn replay_terminal_logs(result: TaskResult, pacing_ms: u64) -> LogStream {
    let lines: Vec<String> = result.logs.lines().map(|l| l.to_string()).collect();
    let total = lines.len();
    let status = result.status;
    let stream = futures_util::stream::unfold((0usize, lines), move |(idx, lines)| async move {
        if idx >= lines.len() {
            return None;
        }
        if idx > 0 && pacing_ms > 0 {
            tokio::time::sleep(Duration::from_millis(pacing_ms)).await;
        }
        let is_last = idx + 1 == lines.len();
        let chunk = LogChunk {
            bytes: format!("{}\n", lines[idx]),
            is_complete: is_last,
            terminal_status: if is_last { Some(status) } else { None },
        };
        Some((Ok(chunk), (idx + 1, lines)))
    });
    if total == 0 {
        let chunk = LogChunk { bytes: String::new(), is_complete: true, terminal_status: Some(status) };
        return Box::pin(futures_util::stream::once(async { Ok(chunk) }));
    }
    Box::pin(stream)
}

/// Running-task path: opens the worker's `StreamTaskLogs` route and relays
/// newline-delimited JSON `LogChunk`s as they arrive.
pub async fn relay_running_logs(
    http: &reqwest::Client,
    api_key: &str,
    worker_address: &str,
    task_id: &str,
) -> anyhow::Result<LogStream> {
    let path = worker_endpoints::STREAM_TASK_LOGS.replace("{task_id}", task_id);
    let url = format!("{worker_address}{path}");
    let mut req = http.get(&url);
    if !api_key.is_empty() {
        req = req.header(headers::API_KEY, api_key);
    }
    let resp = req.send().await?.error_for_status()?;
    let byte_stream = resp.bytes_stream();

    let stream = futures_util::stream::unfold((byte_stream, Vec::<u8>::new()), |(mut bytes, mut buf)| async move {
        loop {
            if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                let line = &line[..line.len() - 1];
                if line.is_empty() {
                    continue;
                }
                return match serde_json::from_slice::<LogChunk>(line) {
                    Ok(chunk) => Some((Ok(chunk), (bytes, buf))),
                    Err(e) => Some((Err(anyhow::anyhow!("malformed log chunk: {e}")), (bytes, buf))),
                };
            }
            match bytes.next().await {
                Some(Ok(b)) => buf.extend_from_slice(&b),
                Some(Err(e)) => return Some((Err(e.into()), (bytes, buf))),
                None => return None,
            }
        }
    });
    Ok(Box::pin(stream))
}

/// Buffers in-flight output-file uploads per task until the final chunk
/// arrives (worker → master, §4.7: "chunks ≤ 1 MB").
pub struct FileUploadAssembler {
    buffers: Mutex<HashMap<String, Vec<u8>>>,
}

impl FileUploadAssembler {
    pub fn new() -> Self {
        Self { buffers: Mutex::new(HashMap::new()) }
    }

    /// Appends one chunk. Returns the fully reassembled tar bytes once
    /// `is_last` arrives, consuming the buffer.
    pub fn ingest(&self, task_id: &str, chunk_bytes: &[u8], is_last: bool) -> Option<Vec<u8>> {
        let mut buffers = self.buffers.lock().expect("upload buffer lock poisoned");
        let buf = buffers.entry(task_id.to_string()).or_default();
        buf.extend_from_slice(chunk_bytes);
        if is_last {
            buffers.remove(task_id)
        } else {
            None
        }
    }
}

impl Default for FileUploadAssembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Extracts a gzip-tarred `/output` directory to
/// `<base>/<user>/<task_name>/<submitted_at>/<task_id>/`, rejecting any
/// entry whose path escapes that directory (§6: "path-traversal substrings
/// and absolute paths are rejected at the API boundary").
pub fn extract_output_tar(
    tar_gz_bytes: &[u8],
    base_dir: &Path,
    user: &str,
    task_name: &str,
    submitted_at: u64,
    task_id: &str,
) -> anyhow::Result<FileMetadata> {
    let dest = base_dir.join(user).join(task_name).join(submitted_at.to_string()).join(task_id);
    std::fs::create_dir_all(&dest)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o700))?;
    }

    let decoder = GzDecoder::new(tar_gz_bytes);
    let mut archive = tar::Archive::new(decoder);
    let mut relative_paths = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_path_buf();
        let rel = path.to_string_lossy().to_string();
        if validate_relative_path(&rel).is_err() {
            warn!(task_id, path = %rel, "rejecting path-traversal entry in output upload");
            continue;
        }
        let out_path: PathBuf = dest.join(&path);
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry.unpack(&out_path)?;
        if entry.header().entry_type().is_file() {
            relative_paths.push(rel);
        }
    }

    Ok(FileMetadata {
        task_id: task_id.to_string(),
        user: user.to_string(),
        task_name: task_name.to_string(),
        submitted_at,
        relative_paths,
        storage_path: dest.to_string_lossy().to_string(),
        uploaded_at: current_timestamp(),
    })
}

/// Picks which log path applies for the task's current status (§4.7).
pub fn is_running_path(status: TaskStatus) -> bool {
    status == TaskStatus::Running
}

pub fn require_terminal_result(
    status: TaskStatus,
    result: Option<TaskResult>,
) -> anyhow::Result<TaskResult> {
    result.ok_or_else(|| {
        SchedulerError::NotFound(format!("no stored result for task in terminal status {status}")).into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replay_terminal_logs_emits_one_chunk_per_line_with_final_status() {
        let result = TaskResult {
            task_id: "t1".to_string(),
            worker_id: "w1".to_string(),
            status: TaskStatus::Completed,
            logs: "line one\nline two".to_string(),
            logs_truncated: false,
            exit_code: Some(0),
            completed_at: 100,
        };
        let mut stream = replay_terminal_logs(result, 0);
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.bytes, "line one\n");
        assert!(!first.is_complete);
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.bytes, "line two\n");
        assert!(second.is_complete);
        assert_eq!(second.terminal_status, Some(TaskStatus::Completed));
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn file_upload_assembler_only_returns_bytes_on_last_chunk() {
        let assembler = FileUploadAssembler::new();
        assert!(assembler.ingest("t1", b"abc", false).is_none());
        let full = assembler.ingest("t1", b"def", true).unwrap();
        assert_eq!(full, b"abcdef");
    }

    #[test]
    fn extract_output_tar_rejects_path_traversal_entries() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut tar_bytes = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut tar_bytes);
            let mut header = tar::Header::new_gnu();
            header.set_size(5);
            header.set_cksum();
            builder.append_data(&mut header, "../escape.txt", &b"bad!!"[..]).unwrap();
            builder.finish().unwrap();
        }
        let mut gz = Vec::new();
        {
            use flate2::write::GzEncoder;
            use std::io::Write;
            let mut encoder = GzEncoder::new(&mut gz, flate2::Compression::default());
            encoder.write_all(&tar_bytes).unwrap();
            encoder.finish().unwrap();
        }

        let meta = extract_output_tar(&gz, dir.path(), "alice", "job", 100, "t1").unwrap();
        assert!(meta.relative_paths.is_empty());
        assert!(!dir.path().join("escape.txt").exists());
    }
}
