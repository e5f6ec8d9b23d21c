//! Managed process abstraction

use super::exec::{ChildProcess, CommandRunner, ProcessConfig, Signal};
use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Process status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Process is running
    Running,
    /// Process has stopped with exit code
    Stopped(Option<i32>),
}

impl ProcessStatus {
    /// Check if process is running
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessStatus::Running)
    }

    /// Check if process has stopped
    pub fn is_stopped(&self) -> bool {
        matches!(self, ProcessStatus::Stopped(_))
    }
}

/// A managed child process
pub struct ManagedProcess {
    /// Process configuration
    pub config: ProcessConfig,
    /// Start time
    pub started_at: Instant,
    child: Box<dyn ChildProcess>,
}

impl ManagedProcess {
    /// Spawn a process through the given runner
    pub async fn spawn(
        runner: &dyn CommandRunner,
        config: ProcessConfig,
    ) -> Result<Self, ProcessError> {
        log::info!(
            "[{}] Starting: {} {}",
            config.name,
            config.executable,
            config.args.join(" ")
        );

        match runner.spawn(&config).await {
            Ok(child) => {
                log::debug!("[{}] Spawned pid {:?}", config.name, child.pid());
                Ok(Self {
                    config,
                    started_at: Instant::now(),
                    child,
                })
            }
            Err(e) => {
                log::error!("[{}] Failed to spawn process: {}", config.name, e);
                Err(ProcessError::SpawnFailed {
                    name: config.name,
                    executable: config.executable,
                    source: e,
                })
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Process ID, if the OS reported one
    pub fn pid(&self) -> Option<u32> {
        self.child.pid()
    }

    /// Current status without blocking
    pub fn status(&self) -> ProcessStatus {
        match self.child.exit_code() {
            Some(code) => ProcessStatus::Stopped(code),
            None => ProcessStatus::Running,
        }
    }

    /// Deliver a signal; a process that already exited is left alone
    pub fn signal(&self, signal: Signal) -> Result<(), ProcessError> {
        if self.status().is_stopped() {
            return Ok(());
        }
        self.child
            .signal(signal)
            .map_err(|e| ProcessError::SignalFailed {
                name: self.config.name.clone(),
                signal,
                source: e,
            })
    }

    /// Wait for the process to exit
    pub async fn wait(&self) -> Option<i32> {
        self.child.wait().await
    }

    /// Stop the process gracefully (`signal`, then `Kill` after `timeout`)
    pub async fn stop(&self, signal: Signal, timeout: Duration) -> Option<i32> {
        if let ProcessStatus::Stopped(code) = self.status() {
            return code;
        }

        log::info!("[{}] Stopping process with {}", self.config.name, signal);
        if let Err(e) = self.signal(signal) {
            log::warn!("{}", e);
        }

        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(code) => {
                log::info!(
                    "[{}] Process exited with code {:?} after {:?}",
                    self.config.name,
                    code,
                    self.uptime()
                );
                code
            }
            Err(_) => {
                log::warn!(
                    "[{}] Process did not exit within {:?}, forcing kill",
                    self.config.name,
                    timeout
                );
                if let Err(e) = self.signal(Signal::Kill) {
                    log::warn!("{}", e);
                }
                // A killed process may still need a moment to be reaped
                tokio::time::timeout(timeout.max(Duration::from_millis(500)), self.wait())
                    .await
                    .unwrap_or(None)
            }
        }
    }

    /// Get uptime duration
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// A set of processes started together and stopped together
#[derive(Default, Clone)]
pub struct ProcessGroup {
    processes: Vec<Arc<ManagedProcess>>,
}

impl ProcessGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, process: ManagedProcess) -> Arc<ManagedProcess> {
        let process = Arc::new(process);
        self.processes.push(process.clone());
        process
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ManagedProcess>> {
        self.processes.iter()
    }

    pub fn pids(&self) -> Vec<u32> {
        self.processes.iter().filter_map(|p| p.pid()).collect()
    }

    /// Number of processes that have not exited yet
    pub fn live_count(&self) -> usize {
        self.processes
            .iter()
            .filter(|p| p.status().is_running())
            .count()
    }

    /// Send a signal to every live process, returning the first failure
    pub fn signal_all(&self, signal: Signal) -> Result<(), ProcessError> {
        let mut first_error = None;
        for process in &self.processes {
            if let Err(e) = process.signal(signal) {
                log::warn!("{}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Wait for every process and collect exit codes in start order
    pub async fn wait_all(&self) -> Vec<Option<i32>> {
        join_all(self.processes.iter().map(|p| p.wait())).await
    }

    /// Stop every process concurrently, escalating to `Kill` after `timeout`
    pub async fn stop_all(&self, signal: Signal, timeout: Duration) -> Vec<Option<i32>> {
        join_all(self.processes.iter().map(|p| p.stop(signal, timeout))).await
    }
}

/// Errors that can occur with managed processes
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn process '{name}' ({executable}): {source}")]
    SpawnFailed {
        name: String,
        executable: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to send {signal} to '{name}': {source}")]
    SignalFailed {
        name: String,
        signal: Signal,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RecordingRunner;

    fn config(name: &str) -> ProcessConfig {
        ProcessConfig {
            name: name.to_string(),
            executable: "ipengine".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_spawn_and_stop() {
        let runner = RecordingRunner::new();
        let process = ManagedProcess::spawn(&runner, config("engine-0"))
            .await
            .unwrap();

        assert!(process.status().is_running());
        process.stop(Signal::Terminate, Duration::from_millis(100)).await;
        assert!(process.status().is_stopped());
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let runner = RecordingRunner::new();
        runner.fail_spawn("ipengine");

        let result = ManagedProcess::spawn(&runner, config("engine-0")).await;
        assert!(matches!(result, Err(ProcessError::SpawnFailed { .. })));
    }

    #[tokio::test]
    async fn test_stop_escalates_to_kill() {
        let runner = RecordingRunner::new();
        runner.stubborn_children(true);

        let process = ManagedProcess::spawn(&runner, config("engine-0"))
            .await
            .unwrap();
        process.stop(Signal::Terminate, Duration::from_millis(50)).await;

        assert!(process.status().is_stopped());
        let pid = process.pid().unwrap();
        assert_eq!(
            runner.signals_for(pid),
            vec![Signal::Terminate, Signal::Kill]
        );
    }

    #[tokio::test]
    async fn test_group_wait_all() {
        let runner = RecordingRunner::new();
        let mut group = ProcessGroup::new();
        for i in 0..3 {
            let process = ManagedProcess::spawn(&runner, config(&format!("engine-{i}")))
                .await
                .unwrap();
            group.push(process);
        }
        assert_eq!(group.live_count(), 3);

        let pids = group.pids();
        runner.exit_child(pids[0], Some(0));
        runner.exit_child(pids[1], Some(1));
        runner.exit_child(pids[2], Some(0));

        assert_eq!(group.wait_all().await, vec![Some(0), Some(1), Some(0)]);
        assert_eq!(group.live_count(), 0);
    }
}
