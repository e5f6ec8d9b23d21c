//! Launchers that spawn OS processes directly: local and MPI

use super::{require_running, JobHandle, Launcher, LauncherCore, LauncherState};
use crate::config::{ArgumentBuilder, ArgumentList, Backend, LauncherConfig, Role};
use crate::error::Result;
use crate::runtime::{CommandRunner, ManagedProcess, ProcessConfig, ProcessGroup, Signal};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Starts the controller or an engine set as local child processes,
/// either one by one or through a single MPI front-end process.
pub struct ProcessLauncher {
    core: Arc<LauncherCore>,
    runner: Arc<dyn CommandRunner>,
    group: Mutex<ProcessGroup>,
}

impl ProcessLauncher {
    pub fn new(role: Role, config: LauncherConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            core: Arc::new(LauncherCore::new(role.as_str(), role, config)),
            runner,
            group: Mutex::new(ProcessGroup::new()),
        }
    }

    fn group(&self) -> ProcessGroup {
        self.group
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_group(&self, group: ProcessGroup) {
        *self.group.lock().unwrap_or_else(PoisonError::into_inner) = group;
    }

    /// Command lines to spawn: one per engine locally, a single one for MPI
    pub fn command_lines(&self, config: &LauncherConfig, n: usize) -> Result<Vec<Vec<String>>> {
        let args = ArgumentBuilder::new(config, self.core.role()).program_args()?;
        let count = match self.core.role() {
            Role::Controller => 1,
            Role::Engines => n,
        };

        let lines = match &config.backend {
            Backend::Mpi(opts) => {
                let mut argv = opts.mpi_cmd.clone();
                argv.push("-n".to_string());
                argv.push(count.to_string());
                argv.extend(opts.mpi_args.iter().cloned());
                argv.extend(args.into_vec());
                vec![argv]
            }
            _ => vec![args.into_vec(); count],
        };
        Ok(lines)
    }

    fn process_config(&self, config: &LauncherConfig, index: usize, argv: Vec<String>) -> ProcessConfig {
        let name = match self.core.role() {
            Role::Controller => self.core.name().to_string(),
            Role::Engines => format!("{}-{}", self.core.name(), index),
        };
        let mut argv = argv.into_iter();

        ProcessConfig {
            name,
            executable: argv.next().unwrap_or_default(),
            args: argv.collect(),
            env: config.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            working_dir: config.work_dir.clone(),
        }
    }

    /// Watch the group until every process has exited
    fn monitor(&self, group: ProcessGroup) {
        let core = self.core.clone();
        let handle = tokio::spawn(async move {
            let exit_codes = group.wait_all().await;
            let failed = exit_codes.iter().any(|code| matches!(code, Some(c) if *c != 0));
            let state = if failed {
                LauncherState::Failed
            } else {
                LauncherState::Stopped
            };
            core.mark_exited(state, exit_codes, None).await;
        });
        self.core.track(handle);
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    fn core(&self) -> &Arc<LauncherCore> {
        &self.core
    }

    fn args(&self) -> Result<ArgumentList> {
        let config = self.core.config();
        Ok(ArgumentBuilder::new(&config, self.core.role()).program_args()?)
    }

    fn handles(&self) -> Vec<JobHandle> {
        self.group()
            .iter()
            .filter(|p| p.status().is_running())
            .filter_map(|p| p.pid())
            .map(JobHandle::Pid)
            .collect()
    }

    async fn launch(&self, config: &LauncherConfig, n: usize) -> Result<()> {
        let delay = match &config.backend {
            Backend::Local(opts) => Duration::from_millis(opts.delay_ms),
            _ => Duration::ZERO,
        };
        if self.core.role() == Role::Controller && n > 1 {
            log::info!("[{}] Controller always starts one process, ignoring n={}", self.core.name(), n);
        }

        let mut group = ProcessGroup::new();
        for (index, argv) in self.command_lines(config, n)?.into_iter().enumerate() {
            if index > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let process_config = self.process_config(config, index, argv);
            match ManagedProcess::spawn(self.runner.as_ref(), process_config).await {
                Ok(process) => {
                    group.push(process);
                }
                Err(e) => {
                    if !group.is_empty() {
                        log::warn!(
                            "[{}] Stopping {} already started process(es)",
                            self.core.name(),
                            group.len()
                        );
                        group
                            .stop_all(config.stop_signal, Duration::from_millis(config.grace_period_ms))
                            .await;
                    }
                    return Err(e.into());
                }
            }
        }

        log::info!("[{}] Started {} process(es)", self.core.name(), group.len());
        self.set_group(group.clone());
        self.monitor(group);
        Ok(())
    }

    async fn terminate(&self, config: &LauncherConfig) -> Vec<Option<i32>> {
        let group = self.group();
        let exit_codes = group
            .stop_all(config.stop_signal, Duration::from_millis(config.grace_period_ms))
            .await;
        self.set_group(ProcessGroup::new());
        exit_codes
    }

    async fn signal(&self, signal: Signal) -> Result<()> {
        require_running(&self.core)?;
        log::info!("[{}] Sending {}", self.core.name(), signal);
        self.group().signal_all(signal)?;
        Ok(())
    }
}
