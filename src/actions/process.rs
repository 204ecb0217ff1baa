// src/actions/process.rs

//! Child-process supervision for build actions
//!
//! [`run_process`] captures the full output of short-lived helpers;
//! [`BuildProcessSession`] streams the output of build tools into a per-action
//! log file using pooled fixed-size buffers, optionally feeding an inline
//! [`BufferSearch`]. Aborted actions terminate their children with SIGTERM
//! and escalate to SIGKILL after a grace period.

use crate::actions::AbortHandle;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

/// Grace period between SIGTERM and SIGKILL
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(10);

const BUFFER_SIZE: usize = 4096;

/// Outcome of a supervised child process
#[derive(Debug, Default)]
pub struct ProcessResult {
    pub exit_code: Option<i32>,
    /// Message when the process could not be spawned or was signalled
    pub error: String,
    /// Captured output; only populated by [`run_process`]
    pub output: String,
}

impl ProcessResult {
    pub fn succeeded(&self) -> bool {
        self.error.is_empty() && self.exit_code == Some(0)
    }
}

/// Pool of fixed-size capture buffers shared by the log pumps
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
        }
    }

    pub fn acquire(&self) -> Vec<u8> {
        let mut buffers = self.buffers.lock().expect("buffer pool mutex poisoned");
        buffers.pop().unwrap_or_else(|| vec![0u8; BUFFER_SIZE])
    }

    pub fn release(&self, buffer: Vec<u8>) {
        let mut buffers = self.buffers.lock().expect("buffer pool mutex poisoned");
        if buffers.len() < 32 {
            buffers.push(buffer);
        }
    }
}

/// Incremental matcher over streamed process output
///
/// Reports the string between the end of `start_pattern` and the first
/// termination byte exactly once; encountering `give_up_pattern` before the
/// start pattern stops the search for good.
pub struct BufferSearch {
    start_pattern: Vec<u8>,
    termination_bytes: Vec<u8>,
    give_up_pattern: Vec<u8>,
    matched_start: usize,
    matched_give_up: usize,
    collected: Option<Vec<u8>>,
    done: bool,
    callback: Box<dyn FnMut(String) + Send>,
}

impl BufferSearch {
    pub fn new(
        start_pattern: impl Into<String>,
        termination_bytes: impl Into<String>,
        give_up_pattern: impl Into<String>,
        callback: impl FnMut(String) + Send + 'static,
    ) -> Self {
        Self {
            start_pattern: start_pattern.into().into_bytes(),
            termination_bytes: termination_bytes.into().into_bytes(),
            give_up_pattern: give_up_pattern.into().into_bytes(),
            matched_start: 0,
            matched_give_up: 0,
            collected: None,
            done: false,
            callback: Box::new(callback),
        }
    }

    /// Feed the next chunk of output into the search
    pub fn feed(&mut self, data: &[u8]) {
        if self.done {
            return;
        }
        for &byte in data {
            if self.done {
                return;
            }
            if let Some(collected) = &mut self.collected {
                if self.termination_bytes.contains(&byte) {
                    let result = String::from_utf8_lossy(collected).into_owned();
                    self.done = true;
                    self.collected = None;
                    (self.callback)(result);
                } else {
                    collected.push(byte);
                }
                continue;
            }

            // give-up pattern ends the search before a match was found
            if !self.give_up_pattern.is_empty() {
                self.matched_give_up = next_match_len(&self.give_up_pattern, self.matched_give_up, byte);
                if self.matched_give_up == self.give_up_pattern.len() {
                    self.done = true;
                    return;
                }
            }

            self.matched_start = next_match_len(&self.start_pattern, self.matched_start, byte);
            if self.matched_start == self.start_pattern.len() {
                self.collected = Some(Vec::new());
            }
        }
    }
}

fn next_match_len(pattern: &[u8], matched: usize, byte: u8) -> usize {
    if pattern[matched] == byte {
        return matched + 1;
    }
    // restart; re-check the current byte against the pattern start
    if pattern[0] == byte {
        1
    } else {
        0
    }
}

/// Run a short-lived process to completion, capturing its combined output
pub async fn run_process(
    program: impl AsRef<str>,
    args: &[&str],
    working_dir: Option<&Path>,
) -> ProcessResult {
    let mut command = Command::new(program.as_ref());
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = working_dir {
        command.current_dir(dir);
    }
    match command.output().await {
        Ok(output) => {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            ProcessResult {
                exit_code: output.status.code(),
                error: String::new(),
                output: combined,
            }
        }
        Err(e) => ProcessResult {
            exit_code: None,
            error: format!("unable to launch {}: {e}", program.as_ref()),
            output: String::new(),
        },
    }
}

/// A build process whose output is tailed into a log file
pub struct BuildProcessSession {
    /// Short display name, e.g. "repo-add"
    pub display_name: String,
    pub log_path: PathBuf,
    pub working_dir: Option<PathBuf>,
    pub abort: AbortHandle,
    pub kill_grace: Duration,
    buffer_pool: Arc<BufferPool>,
}

impl BuildProcessSession {
    pub fn new(
        display_name: impl Into<String>,
        log_path: impl Into<PathBuf>,
        abort: AbortHandle,
    ) -> Self {
        Self {
            display_name: display_name.into(),
            log_path: log_path.into(),
            working_dir: None,
            abort,
            kill_grace: DEFAULT_KILL_GRACE,
            buffer_pool: Arc::new(BufferPool::new()),
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Launch the process and stream its output into the log file
    ///
    /// `search` receives every stdout chunk. Returns `Err(Error::Aborted)`
    /// when the action was aborted while the child was running.
    pub async fn run(
        &self,
        program: &str,
        args: &[String],
        mut search: Option<&mut BufferSearch>,
    ) -> Result<ProcessResult> {
        if let Some(parent) = self.log_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Io(format!("Unable to create log directory: {e}")))?;
        }
        let log_file = tokio::fs::File::create(&self.log_path)
            .await
            .map_err(|e| Error::Io(format!("Unable to create log file: {e}")))?;
        let log_file = Arc::new(tokio::sync::Mutex::new(log_file));

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return Ok(ProcessResult {
                    exit_code: None,
                    error: format!("unable to launch {program}: {e}"),
                    output: String::new(),
                })
            }
        };
        debug!(
            "{} PID: {}",
            self.display_name,
            child.id().unwrap_or_default()
        );

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let stderr_log = Arc::clone(&log_file);
        let stderr_pool = Arc::clone(&self.buffer_pool);
        let stderr_pump = tokio::spawn(async move {
            if let Some(stderr) = stderr.as_mut() {
                let mut buffer = stderr_pool.acquire();
                loop {
                    match stderr.read(&mut buffer).await {
                        Ok(0) | Err(_) => break,
                        Ok(read) => {
                            let mut file = stderr_log.lock().await;
                            let _ = file.write_all(&buffer[..read]).await;
                        }
                    }
                }
                stderr_pool.release(buffer);
            }
        });

        // stdout is pumped inline so the buffer search sees the data in order
        let mut buffer = self.buffer_pool.acquire();
        loop {
            tokio::select! {
                read = read_stream(stdout.as_mut(), &mut buffer) => {
                    match read {
                        Some(read) if read > 0 => {
                            if let Some(search) = search.as_deref_mut() {
                                search.feed(&buffer[..read]);
                            }
                            let mut file = log_file.lock().await;
                            let _ = file.write_all(&buffer[..read]).await;
                        }
                        _ => break, // EOF or read error
                    }
                }
                _ = self.abort.aborted() => {
                    self.buffer_pool.release(buffer);
                    self.terminate(&mut child).await;
                    let _ = stderr_pump.await;
                    return Err(Error::Aborted);
                }
            }
        }
        self.buffer_pool.release(buffer);

        let status = tokio::select! {
            status = child.wait() => status,
            _ = self.abort.aborted() => {
                self.terminate(&mut child).await;
                let _ = stderr_pump.await;
                return Err(Error::Aborted);
            }
        };
        let _ = stderr_pump.await;

        let mut file = log_file.lock().await;
        let _ = file.flush().await;
        drop(file);

        match status {
            Ok(status) => Ok(ProcessResult {
                exit_code: status.code(),
                error: if status.code().is_none() {
                    format!("{} terminated by signal", self.display_name)
                } else {
                    String::new()
                },
                output: String::new(),
            }),
            Err(e) => Ok(ProcessResult {
                exit_code: None,
                error: format!("unable to await {}: {e}", self.display_name),
                output: String::new(),
            }),
        }
    }

    /// SIGTERM, then SIGKILL after the grace period
    async fn terminate(&self, child: &mut tokio::process::Child) {
        if let Some(pid) = child.id() {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            match tokio::time::timeout(self.kill_grace, child.wait()).await {
                Ok(_) => return,
                Err(_) => {
                    warn!(
                        "{} did not react to SIGTERM within {:?}; sending SIGKILL",
                        self.display_name, self.kill_grace
                    );
                }
            }
        }
        let _ = child.kill().await;
        let _ = child.wait().await;
    }
}

async fn read_stream(
    stream: Option<&mut tokio::process::ChildStdout>,
    buffer: &mut [u8],
) -> Option<usize> {
    match stream {
        Some(stream) => stream.read(buffer).await.ok(),
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_process_captures_output() {
        let result = run_process("echo", &["-n", "line1\nline2"], None).await;
        assert!(result.succeeded());
        assert_eq!(result.output, "line1\nline2");
    }

    #[tokio::test]
    async fn test_run_process_spawn_failure() {
        let result = run_process("/nonexistent/binary", &[], None).await;
        assert!(!result.succeeded());
        assert!(result.error.contains("unable to launch"));
        assert_eq!(result.exit_code, None);
    }

    #[tokio::test]
    async fn test_build_process_session_writes_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("logs/echo.log");
        let session = BuildProcessSession::new("echo", &log_path, AbortHandle::default());
        let result = session
            .run("sh", &["-c".to_string(), "echo out; echo err >&2".to_string()], None)
            .await
            .unwrap();
        assert!(result.succeeded());
        let content = std::fs::read_to_string(&log_path).unwrap();
        assert!(content.contains("out"));
        assert!(content.contains("err"));
    }

    #[tokio::test]
    async fn test_build_process_session_nonzero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let session = BuildProcessSession::new(
            "false",
            dir.path().join("false.log"),
            AbortHandle::default(),
        );
        let result = session.run("false", &[], None).await.unwrap();
        assert_eq!(result.exit_code, Some(1));
        assert!(!result.succeeded());
    }

    #[tokio::test]
    async fn test_abort_terminates_child() {
        let dir = tempfile::tempdir().unwrap();
        let abort = AbortHandle::default();
        let mut session =
            BuildProcessSession::new("sleep", dir.path().join("sleep.log"), abort.clone());
        session.kill_grace = Duration::from_millis(200);

        let abort_trigger = abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            abort_trigger.abort();
        });
        let started = std::time::Instant::now();
        let result = session.run("sleep", &["30".to_string()], None).await;
        assert!(matches!(result, Err(Error::Aborted)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_buffer_search_across_chunks() {
        let mut results = Vec::new();
        let collected = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&collected);
        let mut search = BufferSearch::new(
            "Updated version: ",
            "\u{1b}\n",
            "Starting build",
            move |result| sink.lock().unwrap().push(result),
        );

        search.feed(b"Starting Updated");
        search.feed(b" version: some ");
        search.feed(b"version number\x1bmore chars");
        search.feed(b"... Starting build ...");
        results.extend(collected.lock().unwrap().iter().cloned());

        assert_eq!(results, vec!["some version number".to_string()]);
    }

    #[test]
    fn test_buffer_search_gives_up() {
        let hits = std::sync::Arc::new(std::sync::Mutex::new(0usize));
        let sink = Arc::clone(&hits);
        let mut search = BufferSearch::new("Updated version: ", "\n", "Starting build", move |_| {
            *sink.lock().unwrap() += 1;
        });
        search.feed(b"Starting build\nUpdated version: 1.0\n");
        assert_eq!(*hits.lock().unwrap(), 0);
    }

    #[test]
    fn test_buffer_search_fires_once() {
        let hits = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&hits);
        let mut search = BufferSearch::new("v: ", "\n", "", move |result| {
            sink.lock().unwrap().push(result);
        });
        search.feed(b"v: 1\nv: 2\n");
        assert_eq!(*hits.lock().unwrap(), vec!["1".to_string()]);
    }
}
