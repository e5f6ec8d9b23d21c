//! External command execution
//!
//! Launchers never touch `tokio::process` directly. Everything that starts
//! an OS process (spawning an engine, calling `qsub`, running `ssh`) goes
//! through a [`CommandRunner`], so tests and dry runs can swap in the
//! [`RecordingRunner`](super::RecordingRunner).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};

/// Signals a launcher can deliver to the processes it tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Interrupt,
    Terminate,
    Kill,
    Hangup,
}

impl Signal {
    /// Name understood by `kill -<NAME>`
    pub fn name(&self) -> &'static str {
        match self {
            Signal::Interrupt => "INT",
            Signal::Terminate => "TERM",
            Signal::Kill => "KILL",
            Signal::Hangup => "HUP",
        }
    }

    #[cfg(unix)]
    fn to_nix(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal as NixSignal;
        match self {
            Signal::Interrupt => NixSignal::SIGINT,
            Signal::Terminate => NixSignal::SIGTERM,
            Signal::Kill => NixSignal::SIGKILL,
            Signal::Hangup => NixSignal::SIGHUP,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIG{}", self.name())
    }
}

/// A short-lived command whose output is captured
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Data written to the command's stdin
    pub stdin: Option<String>,
    pub working_dir: Option<PathBuf>,
}

impl CommandSpec {
    /// Build from an argv whose first element is the program
    pub fn from_argv<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut iter = argv.into_iter().map(Into::into);
        let program = iter.next().unwrap_or_default();
        Self {
            program,
            args: iter.collect(),
            stdin: None,
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn with_working_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.working_dir = dir;
        self
    }

    /// Full argv, program first
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        if self.stdin.is_some() {
            write!(f, " < (stdin)")?;
        }
        Ok(())
    }
}

/// Captured result of a [`CommandSpec`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when terminated by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given exit code and stderr
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stdout followed by stderr, for pattern matching on either
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }

    /// Short description for error messages
    pub fn summary(&self) -> String {
        let text = self.combined();
        let text = text.trim();
        match self.code {
            Some(code) if text.is_empty() => format!("exit code {code}"),
            Some(code) => format!("exit code {code}: {text}"),
            None if text.is_empty() => "terminated by signal".to_string(),
            None => format!("terminated by signal: {text}"),
        }
    }
}

/// Configuration for spawning a long-running process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessConfig {
    /// Process name (for logging)
    pub name: String,
    /// Executable path
    pub executable: String,
    /// Command line arguments
    pub args: Vec<String>,
    /// Environment variables
    pub env: HashMap<String, String>,
    /// Working directory
    pub working_dir: Option<PathBuf>,
}

/// A spawned child the launcher can signal and wait on
#[async_trait]
pub trait ChildProcess: Send + Sync {
    /// OS process id, if known
    fn pid(&self) -> Option<u32>;

    /// Deliver a signal
    fn signal(&self, signal: Signal) -> std::io::Result<()>;

    /// Exit code without blocking: `None` while running, `Some(code)` after exit
    fn exit_code(&self) -> Option<Option<i32>>;

    /// Wait for the process to exit. Safe to call from several tasks.
    async fn wait(&self) -> Option<i32>;
}

/// The capability launchers use to run external commands
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion and capture its output
    async fn run(&self, command: &CommandSpec) -> std::io::Result<CommandOutput>;

    /// Spawn a long-running process
    async fn spawn(&self, config: &ProcessConfig) -> std::io::Result<Box<dyn ChildProcess>>;
}

/// Runs commands as real OS processes through `tokio::process`
#[derive(Debug, Clone)]
pub struct SystemRunner {
    timeout: Duration,
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new(Duration::from_millis(
            crate::config::DEFAULT_COMMAND_TIMEOUT_MS,
        ))
    }
}

impl SystemRunner {
    /// Runner that gives up on commands after `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, command: &CommandSpec) -> std::io::Result<CommandOutput> {
        log::debug!("Running: {}", command);

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(if command.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn()?;

        let completion = async move {
            if let Some(input) = &command.stdin {
                if let Some(mut stdin) = child.stdin.take() {
                    stdin.write_all(input.as_bytes()).await?;
                    stdin.shutdown().await?;
                }
            }
            child.wait_with_output().await
        };

        let output = tokio::time::timeout(self.timeout, completion)
            .await
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("'{}' did not finish within {:?}", command.program, self.timeout),
                )
            })??;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn spawn(&self, config: &ProcessConfig) -> std::io::Result<Box<dyn ChildProcess>> {
        let mut cmd = Command::new(&config.executable);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn()?;
        Ok(Box::new(SystemChild::watch(config.name.clone(), child)))
    }
}

/// A real child process.
///
/// A background task owns the `tokio::process::Child` and publishes its exit
/// code; signals go through `nix` on Unix and through the task elsewhere.
/// Dropping the handle kills the process.
pub struct SystemChild {
    pid: Option<u32>,
    exit_rx: watch::Receiver<Option<Option<i32>>>,
    #[cfg_attr(unix, allow(dead_code))]
    kill_tx: mpsc::UnboundedSender<()>,
}

impl SystemChild {
    fn watch(name: String, mut child: tokio::process::Child) -> Self {
        let pid = child.id();
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, mut kill_rx) = mpsc::unbounded_channel::<()>();

        tokio::spawn(async move {
            let status = loop {
                tokio::select! {
                    status = child.wait() => break status,
                    request = kill_rx.recv() => {
                        if request.is_none() {
                            log::debug!("[{}] Handle dropped, killing process", name);
                        }
                        if let Err(e) = child.start_kill() {
                            log::warn!("[{}] Failed to kill process: {}", name, e);
                        }
                        if request.is_none() {
                            break child.wait().await;
                        }
                    }
                }
            };

            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    log::error!("[{}] Error waiting for process: {}", name, e);
                    None
                }
            };
            exit_tx.send_replace(Some(code));
        });

        Self {
            pid,
            exit_rx,
            kill_tx,
        }
    }
}

#[async_trait]
impl ChildProcess for SystemChild {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn signal(&self, signal: Signal) -> std::io::Result<()> {
        if self.exit_code().is_some() {
            return Ok(());
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::kill;
            use nix::unistd::Pid;

            let pid = self.pid.ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "process has no pid")
            })?;
            kill(Pid::from_raw(pid as i32), signal.to_nix())
                .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
        }

        #[cfg(not(unix))]
        {
            // Only a hard kill is available here
            let _ = signal;
            self.kill_tx.send(()).map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "process monitor is gone")
            })
        }
    }

    fn exit_code(&self) -> Option<Option<i32>> {
        *self.exit_rx.borrow()
    }

    async fn wait(&self) -> Option<i32> {
        let mut rx = self.exit_rx.clone();
        let code = match rx.wait_for(|code| code.is_some()).await {
            Ok(code) => code.flatten(),
            Err(_) => None,
        };
        code
    }
}
