//! Subprocess execution with streamed, captured output.

use super::RollingTail;
use crate::cancellation::CancellationToken;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write as _;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, info, warn, Instrument};

/// Shared deadline for draining both output pipes after the process is gone.
/// Grandchildren that inherited the pipes may keep them open.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Time between SIGTERM and SIGKILL when stopping a process group.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Longest output line kept; the rest of the line is dropped.
pub const MAX_LINE_BYTES: usize = 4096;

/// A fully rendered command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    /// Label used in logs (the stage or service name).
    pub label: String,
    /// Program to execute.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Working directory.
    pub workdir: Option<PathBuf>,
    /// Extra environment variables.
    pub env: BTreeMap<String, String>,
    /// Wall-clock timeout.
    pub timeout: Option<Duration>,
    /// File receiving every output line.
    pub log_path: Option<PathBuf>,
    /// Lines kept in memory.
    pub tail_lines: usize,
}

impl CommandSpec {
    /// Builds a spec from a rendered argv. Returns `None` for an empty argv.
    #[must_use]
    pub fn from_argv(label: impl Into<String>, argv: Vec<String>) -> Option<Self> {
        let mut argv = argv.into_iter();
        let program = argv.next()?;
        Some(Self {
            label: label.into(),
            program,
            args: argv.collect(),
            tail_lines: 40,
            ..Self::default()
        })
    }

    /// The command line, for logs.
    #[must_use]
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// How a command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandExit {
    /// The process exited; `None` when killed by a signal.
    Exited(Option<i32>),
    /// The wall-clock timeout elapsed and the process was killed.
    TimedOut,
    /// The run was cancelled and the process was killed.
    Cancelled,
}

impl CommandExit {
    /// Returns true for a zero exit status.
    #[must_use]
    pub const fn success(self) -> bool {
        matches!(self, Self::Exited(Some(0)))
    }
}

/// Result of running a command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    /// How it ended.
    pub exit: CommandExit,
    /// The last captured output lines.
    pub tail: Vec<String>,
    /// Wall time in milliseconds.
    pub duration_ms: f64,
}

/// Runs external commands.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `spec` to completion, timeout or cancellation.
    ///
    /// # Errors
    ///
    /// Returns an error only if the process could not be started or its log
    /// file could not be opened.
    async fn run(&self, spec: &CommandSpec, cancel: &CancellationToken) -> std::io::Result<CommandResult>;
}

/// Output stream of a child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// Fans output lines out to the log, a log file and a rolling tail.
#[derive(Debug)]
pub struct OutputCapture {
    label: String,
    tail: Mutex<RollingTail>,
    log: Mutex<Option<std::fs::File>>,
}

impl OutputCapture {
    /// Creates a capture, appending to `log_path` if given.
    pub fn open(label: impl Into<String>, log_path: Option<&PathBuf>, tail_lines: usize) -> std::io::Result<Self> {
        let log = match log_path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                Some(
                    std::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(path)?,
                )
            }
            None => None,
        };
        Ok(Self {
            label: label.into(),
            tail: Mutex::new(RollingTail::new(tail_lines)),
            log: Mutex::new(log),
        })
    }

    /// Writes a header line to the log file.
    pub fn header(&self, text: &str) {
        if let Some(file) = self.log.lock().as_mut() {
            let _ = writeln!(file, "==> {} {text}", crate::utils::iso_timestamp());
        }
    }

    /// Records one output line.
    pub fn line(&self, stream: OutputStream, line: &str) {
        match stream {
            OutputStream::Stdout => debug!(target: "geoflow::tool", label = %self.label, %stream, "{line}"),
            OutputStream::Stderr => info!(target: "geoflow::tool", label = %self.label, %stream, "{line}"),
        }
        if let Some(file) = self.log.lock().as_mut() {
            let _ = writeln!(file, "[{stream}] {line}");
        }
        self.tail.lock().push(line);
    }

    /// The retained tail.
    #[must_use]
    pub fn tail(&self) -> Vec<String> {
        self.tail.lock().lines()
    }
}

/// Runs commands as local subprocesses.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    /// Creates a process runner.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec, cancel: &CancellationToken) -> std::io::Result<CommandResult> {
        let span = tracing::info_span!("command", label = %spec.label, program = %spec.program);

        async {
            let capture = Arc::new(OutputCapture::open(
                spec.label.clone(),
                spec.log_path.as_ref(),
                spec.tail_lines,
            )?);
            capture.header(&spec.display());

            let mut cmd = tokio::process::Command::new(&spec.program);
            cmd.args(&spec.args)
                .envs(&spec.env)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            #[cfg(unix)]
            cmd.process_group(0);
            if let Some(dir) = &spec.workdir {
                cmd.current_dir(dir);
            }

            let start = Instant::now();
            let mut child = cmd.spawn()?;
            info!(pid = child.id(), command = %spec.display(), "started");

            let mut pumps = Vec::with_capacity(2);
            if let Some(stdout) = child.stdout.take() {
                pumps.push(tokio::spawn(pump(stdout, OutputStream::Stdout, Arc::clone(&capture))));
            }
            if let Some(stderr) = child.stderr.take() {
                pumps.push(tokio::spawn(pump(stderr, OutputStream::Stderr, Arc::clone(&capture))));
            }

            let exit = tokio::select! {
                status = child.wait() => CommandExit::Exited(status?.code()),
                () = sleep_for(spec.timeout) => {
                    warn!(timeout_secs = spec.timeout.map_or(0, |t| t.as_secs()), "timed out; killing");
                    kill(&mut child).await;
                    CommandExit::TimedOut
                }
                () = cancel.cancelled() => {
                    warn!("cancelled; killing");
                    kill(&mut child).await;
                    CommandExit::Cancelled
                }
            };

            let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
            for mut pump in pumps {
                if tokio::time::timeout_at(deadline, &mut pump).await.is_err() {
                    debug!("output pipe still open after exit; not waiting");
                    pump.abort();
                }
            }

            let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
            capture.header(&format!("exit: {exit:?} after {:.1}s", duration_ms / 1000.0));
            info!(?exit, duration_ms, "finished");

            Ok(CommandResult {
                exit,
                tail: capture.tail(),
                duration_ms,
            })
        }
        .instrument(span)
        .await
    }
}

async fn sleep_for(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

/// Stops the child and everything it spawned.
///
/// The child leads its own process group, so the group gets SIGTERM, then
/// SIGKILL once [`KILL_GRACE`] has passed.
#[cfg(unix)]
async fn kill(child: &mut tokio::process::Child) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pgid) = child.id().and_then(|pid| i32::try_from(pid).ok()).map(Pid::from_raw) else {
        return;
    };

    if let Err(e) = killpg(pgid, Signal::SIGTERM) {
        if e != Errno::ESRCH {
            warn!(pgid = %pgid, error = %e, "SIGTERM to process group failed");
        }
    }
    if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
        debug!(pgid = %pgid, "process group ignored SIGTERM");
    }
    // Descendants may outlive the leader; the group id stays valid while any remain.
    if let Err(e) = killpg(pgid, Signal::SIGKILL) {
        if e != Errno::ESRCH {
            warn!(pgid = %pgid, error = %e, "SIGKILL to process group failed");
        }
    }
    if let Err(e) = child.wait().await {
        warn!(error = %e, "failed to reap child process");
    }
}

#[cfg(not(unix))]
async fn kill(child: &mut tokio::process::Child) {
    if let Err(e) = child.kill().await {
        warn!(error = %e, "failed to kill child process");
    }
}

/// Splits raw tool output into lines.
///
/// Both `\n` and `\r` end a line, so carriage-return progress bars become
/// one entry per redraw. Lines longer than the cap are cut.
#[derive(Debug)]
struct LineSplitter {
    buf: Vec<u8>,
    cap: usize,
    truncated: bool,
    after_cr: bool,
}

impl LineSplitter {
    fn new(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap.min(256)),
            cap,
            truncated: false,
            after_cr: false,
        }
    }

    fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in bytes {
            match byte {
                // Second half of a CRLF.
                b'\n' if self.after_cr && self.buf.is_empty() && !self.truncated => {
                    self.after_cr = false;
                }
                b'\n' | b'\r' => {
                    lines.push(self.take());
                    self.after_cr = byte == b'\r';
                }
                _ => {
                    self.after_cr = false;
                    if self.buf.len() < self.cap {
                        self.buf.push(byte);
                    } else {
                        self.truncated = true;
                    }
                }
            }
        }
        lines
    }

    fn finish(mut self) -> Option<String> {
        (!self.buf.is_empty() || self.truncated).then(|| self.take())
    }

    fn take(&mut self) -> String {
        let mut line = String::from_utf8_lossy(&self.buf).into_owned();
        if self.truncated {
            line.push_str(" [truncated]");
        }
        self.buf.clear();
        self.truncated = false;
        line
    }
}

async fn pump<R>(reader: R, stream: OutputStream, capture: Arc<OutputCapture>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut splitter = LineSplitter::new(MAX_LINE_BYTES);
    loop {
        let chunk = match reader.fill_buf().await {
            Ok(chunk) if chunk.is_empty() => break,
            Ok(chunk) => chunk,
            Err(e) => {
                debug!(%stream, error = %e, "output pipe read failed");
                break;
            }
        };
        let consumed = chunk.len();
        for line in splitter.feed(chunk) {
            capture.line(stream, &line);
        }
        reader.consume(consumed);
    }
    if let Some(line) = splitter.finish() {
        capture.line(stream, &line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(label: &str, script: &str) -> CommandSpec {
        CommandSpec::from_argv(label, vec!["sh".into(), "-c".into(), script.into()]).unwrap()
    }

    #[tokio::test]
    async fn test_captures_exit_code_and_tail() {
        let runner = ProcessRunner::new();
        let mut spec = sh("extract", "for i in 1 2 3 4 5; do echo line $i; done; echo oops >&2; exit 3");
        spec.tail_lines = 4;

        let result = runner.run(&spec, &CancellationToken::new()).await.unwrap();
        assert_eq!(result.exit, CommandExit::Exited(Some(3)));
        assert_eq!(result.tail.len(), 4);
        assert!(result.tail.contains(&"oops".to_string()));
        assert!(!result.tail.contains(&"line 1".to_string()));
    }

    #[tokio::test]
    async fn test_writes_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("logs/extract.log");
        let mut spec = sh("extract", "echo hello; echo warn >&2");
        spec.log_path = Some(log.clone());

        let result = ProcessRunner::new().run(&spec, &CancellationToken::new()).await.unwrap();
        assert!(result.exit.success());

        let contents = std::fs::read_to_string(&log).unwrap();
        assert!(contents.contains("[stdout] hello"));
        assert!(contents.contains("[stderr] warn"));
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let mut spec = sh("slow", "sleep 30");
        spec.timeout = Some(Duration::from_millis(200));

        let start = Instant::now();
        let result = ProcessRunner::new().run(&spec, &CancellationToken::new()).await.unwrap();
        assert_eq!(result.exit, CommandExit::TimedOut);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_timeout_kills_whole_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = sh("import", "(sleep 2; echo late > graph.bin) & sleep 30");
        spec.workdir = Some(dir.path().to_path_buf());
        spec.timeout = Some(Duration::from_millis(200));

        let start = Instant::now();
        let result = ProcessRunner::new().run(&spec, &CancellationToken::new()).await.unwrap();
        assert_eq!(result.exit, CommandExit::TimedOut);
        assert!(start.elapsed() < Duration::from_secs(4));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!dir.path().join("graph.bin").exists());
    }

    #[tokio::test]
    async fn test_carriage_return_progress_stays_bounded() {
        let mut spec = sh(
            "import",
            r#"i=0; while [ $i -lt 2000 ]; do printf '\rProcessed %d nodes' $i; i=$((i+1)); done; printf '\n'"#,
        );
        spec.tail_lines = 5;

        let result = ProcessRunner::new().run(&spec, &CancellationToken::new()).await.unwrap();
        assert!(result.exit.success());
        assert_eq!(result.tail.len(), 5);
        assert_eq!(result.tail.last().map(String::as_str), Some("Processed 1999 nodes"));
        assert!(result.tail.iter().all(|line| line.len() < 64));
    }

    #[test]
    fn test_line_splitter_handles_crlf_and_long_lines() {
        let mut splitter = LineSplitter::new(8);
        assert_eq!(splitter.feed(b"a\r\nb\n\rc"), vec!["a", "b", ""]);
        assert_eq!(splitter.feed(&[b'x'; 100]), Vec::<String>::new());
        let last = splitter.finish().unwrap();
        assert_eq!(last, "cxxxxxxx [truncated]");
    }

    #[tokio::test]
    async fn test_cancellation_kills_process() {
        let cancel = Arc::new(CancellationToken::new());
        let trigger = Arc::clone(&cancel);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel("ctrl-c");
        });

        let result = ProcessRunner::new().run(&sh("slow", "sleep 30"), &cancel).await.unwrap();
        assert_eq!(result.exit, CommandExit::Cancelled);
    }

    #[tokio::test]
    async fn test_workdir_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = sh("env", "pwd; echo $GEOFLOW_REGION");
        spec.workdir = Some(dir.path().to_path_buf());
        spec.env.insert("GEOFLOW_REGION".into(), "monaco".into());

        let result = ProcessRunner::new().run(&spec, &CancellationToken::new()).await.unwrap();
        assert_eq!(result.tail.last().map(String::as_str), Some("monaco"));
    }

    #[tokio::test]
    async fn test_missing_program_is_an_error() {
        let spec = CommandSpec::from_argv("x", vec!["/definitely/not/a/program".into()]).unwrap();
        assert!(ProcessRunner::new().run(&spec, &CancellationToken::new()).await.is_err());
    }

    #[test]
    fn test_from_argv() {
        assert!(CommandSpec::from_argv("x", Vec::new()).is_none());
        let spec = CommandSpec::from_argv("x", vec!["osmium".into(), "fileinfo".into()]).unwrap();
        assert_eq!(spec.display(), "osmium fileinfo");
    }
}
