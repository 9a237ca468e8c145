//! Scripted command runner for tests.

use crate::cancellation::CancellationToken;
use crate::stages::{CommandExit, CommandResult, CommandRunner, CommandSpec};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::time::Duration;

/// Where a scripted command writes a file.
#[derive(Debug, Clone, PartialEq, Eq)]
enum FileTarget {
    /// A fixed path.
    Path(PathBuf),
    /// The path found at this index of the rendered arguments.
    Arg(usize),
}

/// What one invocation of a scripted command does.
#[derive(Debug, Clone)]
pub struct Script {
    code: Option<i32>,
    writes: Vec<(FileTarget, usize)>,
    output: Vec<String>,
    hang: bool,
    spawn_error: bool,
    delay: Option<Duration>,
}

impl Script {
    /// Exits with `code`.
    #[must_use]
    pub fn exit(code: i32) -> Self {
        Self {
            code: Some(code),
            writes: Vec::new(),
            output: Vec::new(),
            hang: false,
            spawn_error: false,
            delay: None,
        }
    }

    /// Exits 0.
    #[must_use]
    pub fn success() -> Self {
        Self::exit(0)
    }

    /// Never exits on its own; ends on timeout or cancellation.
    #[must_use]
    pub fn hang() -> Self {
        Self {
            hang: true,
            ..Self::success()
        }
    }

    /// Fails to start.
    #[must_use]
    pub fn spawn_error() -> Self {
        Self {
            spawn_error: true,
            ..Self::success()
        }
    }

    /// Writes `len` bytes to the path passed as argument `index`.
    #[must_use]
    pub fn write_arg(mut self, index: usize, len: usize) -> Self {
        self.writes.push((FileTarget::Arg(index), len));
        self
    }

    /// Writes `len` bytes to `path`.
    #[must_use]
    pub fn write_file(mut self, path: impl Into<PathBuf>, len: usize) -> Self {
        self.writes.push((FileTarget::Path(path.into()), len));
        self
    }

    /// Prints a line of output.
    #[must_use]
    pub fn print(mut self, line: impl Into<String>) -> Self {
        self.output.push(line.into());
        self
    }

    /// Sleeps before exiting.
    #[must_use]
    pub const fn after(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// A [`CommandRunner`] that plays back scripts instead of spawning processes.
///
/// Scripts are queued per command label; the last script for a label repeats.
/// Unscripted labels exit 0 without writing anything. Every invocation is
/// recorded.
#[derive(Debug)]
pub struct ScriptedRunner {
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl Default for ScriptedRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedRunner {
    /// Creates a runner with no scripts.
    #[must_use]
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queues a script for commands labelled `label`.
    #[must_use]
    pub fn on(self, label: impl Into<String>, script: Script) -> Self {
        self.push(label, script);
        self
    }

    /// Queues a script after construction.
    pub fn push(&self, label: impl Into<String>, script: Script) {
        self.scripts
            .lock()
            .entry(label.into())
            .or_default()
            .push_back(script);
    }

    /// Replaces every queued script for `label`.
    pub fn set(&self, label: impl Into<String>, script: Script) {
        self.scripts
            .lock()
            .insert(label.into(), VecDeque::from([script]));
    }

    /// All recorded invocations, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().clone()
    }

    /// Labels of all recorded invocations, in order.
    #[must_use]
    pub fn labels(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c.label.clone()).collect()
    }

    /// Number of invocations for `label`.
    #[must_use]
    pub fn call_count(&self, label: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.label == label).count()
    }

    /// Forgets recorded invocations.
    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    fn next_script(&self, label: &str) -> Script {
        let mut scripts = self.scripts.lock();
        match scripts.get_mut(label) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_else(Script::success),
            Some(queue) => queue.front().cloned().unwrap_or_else(Script::success),
            None => Script::success(),
        }
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: &CommandSpec, cancel: &CancellationToken) -> std::io::Result<CommandResult> {
        self.calls.lock().push(spec.clone());
        let script = self.next_script(&spec.label);

        if script.spawn_error {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{}: command not found", spec.program),
            ));
        }

        if script.hang {
            let exit = tokio::select! {
                () = async {
                    match spec.timeout {
                        Some(t) => tokio::time::sleep(t).await,
                        None => std::future::pending().await,
                    }
                } => CommandExit::TimedOut,
                () = cancel.cancelled() => CommandExit::Cancelled,
            };
            return Ok(CommandResult {
                exit,
                tail: script.output,
                duration_ms: 0.0,
            });
        }

        if let Some(delay) = script.delay {
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => {
                    return Ok(CommandResult {
                        exit: CommandExit::Cancelled,
                        tail: script.output,
                        duration_ms: 0.0,
                    });
                }
            }
        }

        for (target, len) in &script.writes {
            let path = match target {
                FileTarget::Path(path) => path.clone(),
                FileTarget::Arg(index) => match spec.args.get(*index) {
                    Some(arg) => PathBuf::from(arg),
                    None => continue,
                },
            };
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let body: Vec<u8> = (0..*len).map(|i| (i % 251) as u8).collect();
            tokio::fs::write(&path, body).await?;
        }

        let mut tail = script.output;
        if spec.tail_lines > 0 && tail.len() > spec.tail_lines {
            tail.drain(..tail.len() - spec.tail_lines);
        }

        Ok(CommandResult {
            exit: CommandExit::Exited(script.code),
            tail,
            duration_ms: 0.0,
        })
    }
}
