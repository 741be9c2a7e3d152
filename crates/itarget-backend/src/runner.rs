//! External process execution
//!
//! Two execution modes over the same spawning primitive:
//!
//! - [`exec`] spawns, waits for exit, and resolves with the full captured
//!   output. Non-zero exit or spawn failure is a typed error.
//! - [`exec_streaming`] / [`exec_streaming_lines`] spawn and surface stdout
//!   incrementally -- as parsed JSON objects or as raw lines -- on an mpsc
//!   receiver, with a cancellation handle that kills the child.
//!
//! The streaming child is owned by a dedicated wait task that calls
//! `child.wait()`, so the real exit status is captured even when the child is
//! killed. Killing a child surfaces as an ordinary non-zero-exit failure from
//! [`ExecStream::wait`]; there is no separate cancelled state.

use std::ffi::OsStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use itarget_core::prelude::*;

/// Captured output of a buffered execution.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Handle that kills a streaming child process. Cloneable; the first call to
/// [`CancelHandle::cancel`] wins, later calls are no-ops.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    kill_tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl CancelHandle {
    fn new(kill_tx: oneshot::Sender<()>) -> Self {
        Self {
            kill_tx: Arc::new(Mutex::new(Some(kill_tx))),
        }
    }

    /// Request termination of the underlying child process.
    pub fn cancel(&self) {
        let tx = self.kill_tx.lock().expect("kill channel lock poisoned").take();
        if let Some(tx) = tx {
            // Ignore send error: the wait task may have already exited.
            let _ = tx.send(());
        }
    }
}

/// Caller-side cancellation token for long-running operations.
///
/// The caller keeps a clone and calls [`CancelToken::cancel`] from its own
/// cancellation signal (e.g. a UI cancel button or ctrl-c). The backend arms
/// the token with the child's [`CancelHandle`] once the process is spawned;
/// cancelling before the token is armed kills the process as soon as it is.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Mutex<CancelState>>,
}

#[derive(Debug, Default)]
struct CancelState {
    cancelled: bool,
    handle: Option<CancelHandle>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the operation, killing the armed child process if any.
    pub fn cancel(&self) {
        let handle = {
            let mut state = self.inner.lock().expect("cancel token lock poisoned");
            state.cancelled = true;
            state.handle.take()
        };
        if let Some(handle) = handle {
            handle.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner
            .lock()
            .expect("cancel token lock poisoned")
            .cancelled
    }

    /// Attach the child's kill handle. If the token was cancelled before the
    /// child was spawned, the child is killed immediately.
    pub(crate) fn arm(&self, handle: CancelHandle) {
        let cancelled = {
            let mut state = self.inner.lock().expect("cancel token lock poisoned");
            if !state.cancelled {
                state.handle = Some(handle.clone());
            }
            state.cancelled
        };
        if cancelled {
            handle.cancel();
        }
    }
}

/// Exit information delivered by the wait task.
#[derive(Debug)]
struct ExitReport {
    success: bool,
    code: Option<i32>,
    stderr: String,
}

/// A running child process whose stdout is surfaced as a stream of `T`.
#[derive(Debug)]
pub struct ExecStream<T> {
    events: Option<mpsc::Receiver<T>>,
    done: Option<oneshot::Receiver<ExitReport>>,
    cancel: CancelHandle,
    exited: Arc<AtomicBool>,
    pid: Option<u32>,
    command: String,
    detached: bool,
}

/// Streaming execution yielding parsed JSON objects.
pub type JsonStream = ExecStream<serde_json::Value>;

/// Streaming execution yielding raw stdout lines.
pub type LineStream = ExecStream<String>;

/// Handle to a child process left running beyond its event stream, e.g. a
/// started debugserver. Killing goes through the wait task so the OS reaps
/// the process correctly.
#[derive(Debug)]
pub struct ProcessHandle {
    cancel: CancelHandle,
    exited: Arc<AtomicBool>,
    pid: Option<u32>,
}

impl ProcessHandle {
    pub fn kill(&self) {
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.exited.load(Ordering::Acquire)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl<T> ExecStream<T> {
    /// Receive the next stdout item, or `None` once the pipe closes.
    pub async fn next(&mut self) -> Option<T> {
        match self.events.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Handle that kills the child when invoked.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Wait for the child to exit. Resolves `Ok(())` on a zero exit and a
    /// typed failure otherwise -- including when the child was killed via the
    /// cancel handle.
    pub async fn wait(&mut self) -> Result<()> {
        let Some(done) = self.done.take() else {
            return if self.exited.load(Ordering::Acquire) {
                Ok(())
            } else {
                Err(Error::protocol("process already being awaited"))
            };
        };

        let report = done
            .await
            .map_err(|_| Error::spawn("process wait task dropped"))?;

        if report.success {
            Ok(())
        } else {
            Err(Error::CommandFailed {
                command: self.command.clone(),
                code: report.code,
                stderr: report.stderr,
            })
        }
    }

    /// Detach the event stream and keep the child running, returning a handle
    /// for later lifetime management. Remaining stdout is drained in the
    /// background so the child never blocks on a full pipe.
    pub fn into_handle(mut self) -> ProcessHandle
    where
        T: Send + 'static,
    {
        self.detached = true;
        if let Some(mut events) = self.events.take() {
            tokio::spawn(async move { while events.recv().await.is_some() {} });
        }
        ProcessHandle {
            cancel: self.cancel.clone(),
            exited: Arc::clone(&self.exited),
            pid: self.pid,
        }
    }
}

impl<T> Drop for ExecStream<T> {
    fn drop(&mut self) {
        // A dropped stream without a detached handle means nobody can wait on
        // or cancel the child anymore; kill it rather than leak it.
        if !self.detached && !self.exited.load(Ordering::Acquire) {
            self.cancel.cancel();
        }
    }
}

fn display_command(program: &OsStr, args: &[String]) -> String {
    let mut command = program.to_string_lossy().into_owned();
    for arg in args {
        command.push(' ');
        command.push_str(arg);
    }
    command
}

fn tool_name(program: &OsStr) -> String {
    std::path::Path::new(program)
        .file_name()
        .unwrap_or(program)
        .to_string_lossy()
        .into_owned()
}

fn build_command(program: &OsStr, args: &[String], envs: &[(String, String)]) -> Command {
    let mut command = Command::new(program);
    command.args(args);
    for (key, value) in envs {
        command.env(key, value);
    }
    command.stdin(std::process::Stdio::null());
    command
}

fn map_spawn_error(program: &OsStr, e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        Error::tool_not_found(tool_name(program))
    } else {
        Error::spawn(e.to_string())
    }
}

/// Run a command to completion and capture its output.
pub async fn exec(
    program: impl AsRef<OsStr>,
    args: &[String],
    envs: &[(String, String)],
) -> Result<ExecOutput> {
    let program = program.as_ref();
    let command = display_command(program, args);
    debug!("Executing: {}", command);

    let output = build_command(program, args, envs)
        .output()
        .await
        .map_err(|e| map_spawn_error(program, e))?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if !output.status.success() {
        return Err(Error::CommandFailed {
            command,
            code: output.status.code(),
            stderr,
        });
    }

    Ok(ExecOutput { stdout, stderr })
}

/// Spawn a command and surface stdout as parsed JSON objects.
///
/// The deployment tool emits one JSON object per event, sometimes with no
/// separator between adjacent objects; the scanner handles `}{` boundaries
/// and objects split across reads.
pub fn exec_streaming(
    program: impl AsRef<OsStr>,
    args: &[String],
    envs: &[(String, String)],
) -> Result<JsonStream> {
    spawn_streaming(program.as_ref(), args, envs, |stdout, tx| {
        json_reader(stdout, tx)
    })
}

/// Spawn a command and surface stdout line by line.
pub fn exec_streaming_lines(
    program: impl AsRef<OsStr>,
    args: &[String],
    envs: &[(String, String)],
) -> Result<LineStream> {
    spawn_streaming(program.as_ref(), args, envs, |stdout, tx| {
        line_reader(stdout, tx)
    })
}

fn spawn_streaming<T, R, Fut>(
    program: &OsStr,
    args: &[String],
    envs: &[(String, String)],
    reader: R,
) -> Result<ExecStream<T>>
where
    T: Send + 'static,
    R: FnOnce(ChildStdout, mpsc::Sender<T>) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let command = display_command(program, args);
    debug!("Spawning: {}", command);

    let mut child = build_command(program, args, envs)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| map_spawn_error(program, e))?;

    let pid = child.id();

    let stdout = child.stdout.take().expect("stdout was configured");
    let (event_tx, event_rx) = mpsc::channel::<T>(64);
    tokio::spawn(reader(stdout, event_tx));

    let stderr = child.stderr.take().expect("stderr was configured");
    let stderr_task = tokio::spawn(collect_stderr(stderr));

    let exited = Arc::new(AtomicBool::new(false));
    let (kill_tx, kill_rx) = oneshot::channel::<()>();
    let (done_tx, done_rx) = oneshot::channel::<ExitReport>();

    tokio::spawn(wait_for_exit(
        child,
        kill_rx,
        stderr_task,
        done_tx,
        Arc::clone(&exited),
    ));

    Ok(ExecStream {
        events: Some(event_rx),
        done: Some(done_rx),
        cancel: CancelHandle::new(kill_tx),
        exited,
        pid,
        command,
        detached: false,
    })
}

/// Background task: owns the child, waits for it to exit, reports the real
/// exit status. Two ways out: the child exits naturally, or the kill channel
/// fires (cancel handle invoked, or every handle dropped) and we kill first.
async fn wait_for_exit(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    stderr_task: JoinHandle<String>,
    done_tx: oneshot::Sender<ExitReport>,
    exited: Arc<AtomicBool>,
) {
    let status = tokio::select! {
        result = child.wait() => match result {
            Ok(status) => Some(status),
            Err(e) => {
                error!("Error waiting for child process: {}", e);
                None
            }
        },
        // Resolves on an explicit cancel, and also when every CancelHandle
        // clone is dropped -- an unreachable child is killed, not leaked.
        _ = kill_rx => {
            debug!("Kill requested, terminating child process");
            if let Err(e) = child.kill().await {
                error!("Failed to kill child process: {}", e);
            }
            child.wait().await.ok()
        }
    };

    let stderr = stderr_task.await.unwrap_or_default();

    exited.store(true, Ordering::Release);

    let _ = done_tx.send(ExitReport {
        success: status.map(|s| s.success()).unwrap_or(false),
        code: status.and_then(|s| s.code()),
        stderr,
    });
}

/// Read stdout chunks and emit complete JSON objects as they form.
async fn json_reader(mut stdout: ChildStdout, tx: mpsc::Sender<serde_json::Value>) {
    let mut scanner = JsonObjectScanner::default();
    let mut buf = [0u8; 4096];

    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for value in scanner.push(&buf[..n]) {
                    if tx.send(value).await.is_err() {
                        debug!("event channel closed");
                        return;
                    }
                }
            }
            Err(e) => {
                debug!("stdout read error: {}", e);
                break;
            }
        }
    }
}

/// Read stdout lines and emit them verbatim.
async fn line_reader(stdout: ChildStdout, tx: mpsc::Sender<String>) {
    let mut reader = BufReader::new(stdout).lines();

    while let Ok(Some(line)) = reader.next_line().await {
        trace!("stdout: {}", line);
        if tx.send(line).await.is_err() {
            debug!("line channel closed");
            break;
        }
    }
}

/// Collect stderr for inclusion in the failure report.
async fn collect_stderr(stderr: ChildStderr) -> String {
    let mut reader = BufReader::new(stderr).lines();
    let mut collected = String::new();

    while let Ok(Some(line)) = reader.next_line().await {
        trace!("stderr: {}", line);
        if !collected.is_empty() {
            collected.push('\n');
        }
        collected.push_str(&line);
    }

    collected
}

/// Incremental scanner extracting complete top-level JSON objects from a byte
/// stream. Tracks brace depth and string/escape state, so objects split
/// across reads, glued together (`}{`), or surrounded by non-JSON noise are
/// all handled. Content outside objects is discarded.
#[derive(Debug, Default)]
pub struct JsonObjectScanner {
    buf: Vec<u8>,
    pos: usize,
    depth: u32,
    in_string: bool,
    escaped: bool,
    start: Option<usize>,
}

impl JsonObjectScanner {
    /// Feed a chunk of bytes; returns every object completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<serde_json::Value> {
        self.buf.extend_from_slice(chunk);

        let mut out = Vec::new();
        let mut i = self.pos;
        while i < self.buf.len() {
            let b = self.buf[i];
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
            } else {
                match b {
                    b'"' if self.depth > 0 => self.in_string = true,
                    b'{' => {
                        if self.depth == 0 {
                            self.start = Some(i);
                        }
                        self.depth += 1;
                    }
                    b'}' if self.depth > 0 => {
                        self.depth -= 1;
                        if self.depth == 0 {
                            if let Some(start) = self.start.take() {
                                match serde_json::from_slice(&self.buf[start..=i]) {
                                    Ok(value) => out.push(value),
                                    Err(e) => debug!("discarding unparsable object: {}", e),
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
            i += 1;
        }
        self.pos = self.buf.len();

        // Discard consumed bytes, keeping any object still in progress.
        match self.start {
            None => {
                self.buf.clear();
                self.pos = 0;
            }
            Some(start) if start > 0 => {
                self.buf.drain(..start);
                self.pos -= start;
                self.start = Some(0);
            }
            Some(_) => {}
        }

        out
    }
}

/// Repair the deployment tool's concatenated `--json` output for buffered
/// parsing: adjacent objects are emitted as `...\n}{\n...` with no separator,
/// so insert commas and wrap the whole thing in an array.
pub fn repair_concatenated_json(stdout: &str) -> String {
    format!("[{}]", stdout.replace("\n}{\n", "\n},{\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn no_env() -> Vec<(String, String)> {
        Vec::new()
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_exec_captures_stdout() {
        let output = exec("sh", &args(&["-c", "echo hello"]), &no_env())
            .await
            .unwrap();
        assert_eq!(output.stdout.trim(), "hello");
        assert!(output.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_exec_nonzero_exit_is_failure() {
        let err = exec("sh", &args(&["-c", "echo oops >&2; exit 3"]), &no_env())
            .await
            .unwrap_err();

        let Error::CommandFailed {
            code, stderr, ..
        } = err
        else {
            panic!("expected CommandFailed, got {:?}", err);
        };
        assert_eq!(code, Some(3));
        assert!(stderr.contains("oops"));
    }

    #[tokio::test]
    async fn test_exec_missing_tool() {
        let err = exec("definitely-not-a-real-tool-4e1a", &args(&[]), &no_env())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ToolNotFound { .. }));
    }

    #[tokio::test]
    async fn test_exec_env_is_passed() {
        let envs = vec![("ITARGET_TEST_VAR".to_string(), "present".to_string())];
        let output = exec("sh", &args(&["-c", "echo $ITARGET_TEST_VAR"]), &envs)
            .await
            .unwrap();
        assert_eq!(output.stdout.trim(), "present");
    }

    #[tokio::test]
    async fn test_streaming_json_events() {
        // Two objects with no separator, like the deployment tool emits
        let script = r#"printf '{"Event":"One"}{"Event":"Two"}\n'"#;
        let mut stream = exec_streaming("sh", &args(&["-c", script]), &no_env()).unwrap();

        assert_eq!(stream.next().await.unwrap(), json!({"Event": "One"}));
        assert_eq!(stream.next().await.unwrap(), json!({"Event": "Two"}));
        assert!(stream.next().await.is_none());
        stream.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_streaming_cancel_is_nonzero_exit() {
        let script = r#"printf '{"Event":"Started"}'; sleep 30"#;
        let mut stream = exec_streaming("sh", &args(&["-c", script]), &no_env()).unwrap();

        assert_eq!(stream.next().await.unwrap(), json!({"Event": "Started"}));
        stream.cancel_handle().cancel();

        let err = stream.wait().await.unwrap_err();
        assert!(matches!(err, Error::CommandFailed { .. }));
    }

    #[tokio::test]
    async fn test_streaming_lines() {
        let mut stream =
            exec_streaming_lines("sh", &args(&["-c", "printf 'one\\ntwo\\n'"]), &no_env())
                .unwrap();

        assert_eq!(stream.next().await.unwrap(), "one");
        assert_eq!(stream.next().await.unwrap(), "two");
        assert!(stream.next().await.is_none());
        stream.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_streaming_spawn_failure() {
        let result = exec_streaming("definitely-not-a-real-tool-4e1a", &args(&[]), &no_env());
        assert!(matches!(result, Err(Error::ToolNotFound { .. })));
    }

    #[tokio::test]
    async fn test_into_handle_keeps_process_running() {
        let mut stream =
            exec_streaming_lines("sh", &args(&["-c", "echo up; sleep 30"]), &no_env()).unwrap();
        assert_eq!(stream.next().await.unwrap(), "up");

        let handle = stream.into_handle();
        assert!(handle.is_running());

        handle.kill();
        // Give the wait task a moment to reap the child
        for _ in 0..50 {
            if !handle.is_running() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_cancel_token_before_spawn_kills_immediately() {
        let token = CancelToken::new();
        token.cancel();

        let mut stream =
            exec_streaming_lines("sh", &args(&["-c", "sleep 30"]), &no_env()).unwrap();
        token.arm(stream.cancel_handle());

        let err = stream.wait().await.unwrap_err();
        assert!(matches!(err, Error::CommandFailed { .. }));
    }

    #[tokio::test]
    async fn test_cancel_token_after_arm() {
        let token = CancelToken::new();
        let mut stream =
            exec_streaming_lines("sh", &args(&["-c", "sleep 30"]), &no_env()).unwrap();
        token.arm(stream.cancel_handle());
        assert!(!token.is_cancelled());

        token.cancel();
        assert!(token.is_cancelled());
        assert!(stream.wait().await.is_err());
    }

    #[test]
    fn test_scanner_object_split_across_chunks() {
        let mut scanner = JsonObjectScanner::default();
        assert!(scanner.push(br#"{"Event":"Bundle"#).is_empty());
        let values = scanner.push(br#"Copy","Percent":5}"#);
        assert_eq!(values, vec![json!({"Event": "BundleCopy", "Percent": 5})]);
    }

    #[test]
    fn test_scanner_adjacent_objects() {
        let mut scanner = JsonObjectScanner::default();
        let values = scanner.push(br#"{"a":1}{"b":2}"#);
        assert_eq!(values, vec![json!({"a": 1}), json!({"b": 2})]);
    }

    #[test]
    fn test_scanner_braces_inside_strings() {
        let mut scanner = JsonObjectScanner::default();
        let values = scanner.push(br#"{"path":"weird{na}me","n":1}"#);
        assert_eq!(values, vec![json!({"path": "weird{na}me", "n": 1})]);
    }

    #[test]
    fn test_scanner_escaped_quote_in_string() {
        let mut scanner = JsonObjectScanner::default();
        let values = scanner.push(br#"{"name":"say \"hi\" {now}"}"#);
        assert_eq!(values, vec![json!({"name": "say \"hi\" {now}"})]);
    }

    #[test]
    fn test_scanner_ignores_noise_between_objects() {
        let mut scanner = JsonObjectScanner::default();
        let values = scanner.push(b"[....] Waiting for device...\n{\"ok\":true}\ndone\n");
        assert_eq!(values, vec![json!({"ok": true})]);
    }

    #[test]
    fn test_scanner_nested_objects() {
        let mut scanner = JsonObjectScanner::default();
        let values = scanner.push(br#"{"Device":{"Name":"iPhone"},"Event":"DeviceDetected"}"#);
        assert_eq!(values.len(), 1);
        assert_eq!(values[0]["Device"]["Name"], "iPhone");
    }

    #[test]
    fn test_repair_concatenated_json() {
        let raw = "{\n  \"Event\" : \"DeviceDetected\"\n}{\n  \"Event\" : \"DeviceDetected\"\n}";
        let repaired = repair_concatenated_json(raw);
        let values: Vec<serde_json::Value> = serde_json::from_str(&repaired).unwrap();
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn test_repair_empty_output() {
        let values: Vec<serde_json::Value> =
            serde_json::from_str(&repair_concatenated_json("")).unwrap();
        assert!(values.is_empty());
    }
}
