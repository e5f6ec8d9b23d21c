//! Launchers: one lifecycle over local processes, batch schedulers and SSH
//!
//! Every backend implements [`Launcher`]. The provided `start`/`stop`
//! methods drive the shared [`LauncherCore`] state machine and call into
//! the backend through `launch` and `terminate`.

pub mod batch;
mod lifecycle;
pub mod process;
pub mod ssh;

pub use batch::BatchLauncher;
pub use lifecycle::{ExitNotice, ExitWatcher, LauncherCore, LauncherState};
pub use process::ProcessLauncher;
pub use ssh::SshLauncher;

use crate::config::{ArgumentList, Backend, ConfigError, LauncherConfig, Role};
use crate::error::{LaunchError, Result};
use crate::runtime::{CommandRunner, Signal};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Something a launcher started and can later stop
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobHandle {
    /// Local child process
    Pid(u32),
    /// Batch scheduler job id
    Job(String),
    /// Process started on a remote host
    Remote { host: String, pid: u32 },
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobHandle::Pid(pid) => write!(f, "pid {}", pid),
            JobHandle::Job(id) => write!(f, "job {}", id),
            JobHandle::Remote { host, pid } => write!(f, "{}:{}", host, pid),
        }
    }
}

/// Start, observe and stop a controller or engine set
#[async_trait]
pub trait Launcher: Send + Sync {
    fn core(&self) -> &Arc<LauncherCore>;

    /// Argument list the launcher would start with right now
    fn args(&self) -> Result<ArgumentList>;

    /// Currently tracked processes or jobs
    fn handles(&self) -> Vec<JobHandle>;

    /// Backend start; runs while the launcher is `Starting`
    async fn launch(&self, config: &LauncherConfig, n: usize) -> Result<()>;

    /// Backend stop; runs while the launcher is `Stopping` and must leave
    /// nothing tracked. Returns exit codes where known.
    async fn terminate(&self, config: &LauncherConfig) -> Vec<Option<i32>>;

    /// Deliver a signal to everything the launcher tracks
    async fn signal(&self, signal: Signal) -> Result<()>;

    fn name(&self) -> &str {
        self.core().name()
    }

    fn role(&self) -> Role {
        self.core().role()
    }

    fn state(&self) -> LauncherState {
        self.core().state()
    }

    fn subscribe(&self) -> ExitWatcher {
        self.core().subscribe()
    }

    fn cluster_id(&self) -> String {
        self.core().cluster_id()
    }

    fn set_cluster_id(&self, id: &str) -> Result<()> {
        self.core().set_cluster_id(id)
    }

    /// Start `n` processes (engines) or the controller.
    ///
    /// On error the launcher is `Failed` and the same error is delivered
    /// on the exit channel.
    async fn start(&self, n: usize) -> Result<()> {
        let config = self.core().begin_start()?;
        log::info!("[{}] Starting ({}, n={})", self.name(), config.backend.kind(), n);

        let result: Result<()> = async {
            if n == 0 {
                return Err(ConfigError::Invalid("n must be at least 1".to_string()).into());
            }
            config.check_profile_dir()?;
            self.launch(&config, n).await
        }
        .await;

        self.core().finish_start(result)
    }

    /// Stop everything; a no-op unless `Running`
    async fn stop(&self) -> Result<()> {
        if !self.core().begin_stop()? {
            return Ok(());
        }

        log::info!("[{}] Stopping...", self.name());
        let config = self.core().config();
        let exit_codes = self.terminate(&config).await;
        self.core().finish_stop(exit_codes);
        Ok(())
    }
}

/// Build the launcher for `role` selected by `config.backend`
pub fn build_launcher(
    role: Role,
    config: LauncherConfig,
    runner: Arc<dyn CommandRunner>,
) -> Result<Arc<dyn Launcher>> {
    config.validate()?;

    let launcher: Arc<dyn Launcher> = match &config.backend {
        Backend::Local(_) | Backend::Mpi(_) => Arc::new(ProcessLauncher::new(role, config, runner)),
        Backend::Pbs(_)
        | Backend::Sge(_)
        | Backend::Lsf(_)
        | Backend::Slurm(_)
        | Backend::HtCondor(_)
        | Backend::WindowsHpc(_) => Arc::new(BatchLauncher::new(role, config, runner)?),
        Backend::Ssh(_) | Backend::SshProxy(_) => Arc::new(SshLauncher::new(role, config, runner)?),
    };

    Ok(launcher)
}

/// Reject signals on launchers that are not running
pub(crate) fn require_running(core: &LauncherCore) -> Result<()> {
    core.require_state("signal", &[LauncherState::Running])
}

/// Error for a signal the backend cannot deliver
pub(crate) fn unsupported_signal(backend: &str, signal: Signal) -> LaunchError {
    ConfigError::Invalid(format!("{}: unsupported signal {}", backend, signal)).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocalOptions;
    use crate::runtime::RecordingRunner;

    #[test]
    fn test_build_rejects_invalid_config() {
        let config = LauncherConfig::for_role(Role::Engines).with_cmd(Vec::<String>::new());
        let result = build_launcher(Role::Engines, config, Arc::new(RecordingRunner::new()));
        assert!(matches!(result, Err(LaunchError::Config(_))));
    }

    #[test]
    fn test_build_local_launcher() {
        let config = LauncherConfig::for_role(Role::Controller)
            .with_profile_dir("/tmp/profile")
            .with_backend(Backend::Local(LocalOptions::default()));
        let launcher =
            build_launcher(Role::Controller, config, Arc::new(RecordingRunner::new())).unwrap();

        assert_eq!(launcher.name(), "controller");
        assert_eq!(launcher.state(), LauncherState::Idle);
        assert!(launcher.handles().is_empty());
    }

    #[test]
    fn test_job_handle_display() {
        assert_eq!(JobHandle::Pid(42).to_string(), "pid 42");
        assert_eq!(JobHandle::Job("123.server".into()).to_string(), "job 123.server");
        assert_eq!(
            JobHandle::Remote { host: "node1".into(), pid: 7 }.to_string(),
            "node1:7"
        );
    }
}
