//! Batch scheduler launchers: PBS, SGE, LSF, SLURM, HTCondor, Windows HPC
//!
//! A start renders a submission artifact into the profile directory,
//! submits it and keeps the job id. A background task polls the scheduler
//! until the job disappears; stop cancels the job and escalates to the
//! scheduler's forced cancel once the grace period is over.

mod scheduler;
pub mod winhpc;

pub use scheduler::{JobStatus, Scheduler};

use super::{require_running, unsupported_signal, JobHandle, Launcher, LauncherCore, LauncherState};
use crate::config::{
    load_template, ArgumentBuilder, ArgumentList, Backend, BatchOptions, ConfigError,
    LauncherConfig, Role, TemplateContext, WinHpcOptions,
};
use crate::error::{LaunchError, Result};
use crate::runtime::{CommandRunner, CommandSpec, Signal};
use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Scheduler-specific options
#[derive(Debug, Clone)]
enum JobOptions {
    Script(BatchOptions),
    WinHpc(WinHpcOptions),
}

impl JobOptions {
    fn template(&self) -> Option<&str> {
        match self {
            JobOptions::Script(opts) => opts.template.as_deref(),
            JobOptions::WinHpc(opts) => opts.template.as_deref(),
        }
    }

    fn template_file(&self) -> Option<&Path> {
        match self {
            JobOptions::Script(opts) => opts.template_file.as_deref(),
            JobOptions::WinHpc(opts) => opts.template_file.as_deref(),
        }
    }

    fn job_name(&self) -> Option<&str> {
        match self {
            JobOptions::Script(opts) => opts.job_name.as_deref(),
            JobOptions::WinHpc(opts) => opts.job_name.as_deref(),
        }
    }
}

/// Resolved commands and options for one scheduler
#[derive(Debug)]
struct BatchSettings {
    scheduler: Scheduler,
    submit: Vec<String>,
    delete: Vec<String>,
    kill: Option<Vec<String>>,
    status: Vec<String>,
    /// Appended after the job id (Windows HPC `/scheduler:<head node>`)
    suffix: Vec<String>,
    job_id_pattern: Option<Regex>,
    options: JobOptions,
}

impl BatchSettings {
    fn from_backend(backend: &Backend) -> std::result::Result<Self, ConfigError> {
        let scheduler = Scheduler::from_backend(backend).ok_or_else(|| {
            ConfigError::Invalid(format!("'{}' is not a batch backend", backend.kind()))
        })?;

        match backend {
            Backend::WindowsHpc(opts) => {
                let with = |verb: &str| {
                    let mut cmd = opts.job_cmd.clone();
                    cmd.push(verb.to_string());
                    cmd
                };
                Ok(Self {
                    scheduler,
                    submit: with("submit"),
                    delete: with("cancel"),
                    kill: None,
                    status: with("view"),
                    suffix: opts
                        .scheduler
                        .iter()
                        .map(|s| format!("/scheduler:{}", s))
                        .collect(),
                    job_id_pattern: None,
                    options: JobOptions::WinHpc(opts.clone()),
                })
            }
            Backend::Pbs(opts)
            | Backend::Sge(opts)
            | Backend::Lsf(opts)
            | Backend::Slurm(opts)
            | Backend::HtCondor(opts) => {
                let job_id_pattern = opts
                    .job_id_regexp
                    .as_deref()
                    .map(Regex::new)
                    .transpose()
                    .map_err(|e| ConfigError::Invalid(format!("invalid job_id_regexp: {}", e)))?;

                Ok(Self {
                    scheduler,
                    submit: opts
                        .submit_command
                        .clone()
                        .unwrap_or_else(|| scheduler.default_submit_command()),
                    delete: opts
                        .delete_command
                        .clone()
                        .unwrap_or_else(|| scheduler.default_delete_command()),
                    kill: opts
                        .kill_command
                        .clone()
                        .or_else(|| scheduler.default_kill_command()),
                    status: opts
                        .status_command
                        .clone()
                        .unwrap_or_else(|| scheduler.default_status_command()),
                    suffix: Vec::new(),
                    job_id_pattern,
                    options: JobOptions::Script(opts.clone()),
                })
            }
            _ => Err(ConfigError::Invalid(format!(
                "'{}' is not a batch backend",
                backend.kind()
            ))),
        }
    }

    fn job_command(&self, base: &[String], job_id: &str) -> CommandSpec {
        let mut spec = CommandSpec::from_argv(base.iter().cloned()).arg(job_id);
        spec.args.extend(self.suffix.iter().cloned());
        spec
    }

    /// One status poll.
    ///
    /// `Err` is a failed poll (command failed or unrecognised error output);
    /// ambiguous output from a successful command is `Ok(Unknown)`.
    async fn poll(&self, runner: &dyn CommandRunner, job_id: &str) -> std::result::Result<JobStatus, String> {
        let spec = self.job_command(&self.status, job_id);
        let output = runner
            .run(&spec)
            .await
            .map_err(|e| format!("{}: {}", spec.program, e))?;

        match self.scheduler.parse_status(&output) {
            JobStatus::Unknown if !output.success() => {
                Err(format!("{}: {}", spec.program, output.summary()))
            }
            status => Ok(status),
        }
    }

    /// Cancel a job. `Ok(true)` when the scheduler says it was already gone.
    async fn cancel(&self, runner: &dyn CommandRunner, job_id: &str) -> std::result::Result<bool, String> {
        let spec = self.job_command(&self.delete, job_id);
        let output = runner
            .run(&spec)
            .await
            .map_err(|e| format!("{}: {}", spec.program, e))?;

        if self.scheduler.job_already_gone(&output) {
            return Ok(true);
        }
        if !output.success() {
            return Err(format!("{}: {}", spec.program, output.summary()));
        }
        Ok(false)
    }

    /// Forced cancel, falling back to the normal cancel where none exists
    async fn force_cancel(&self, runner: &dyn CommandRunner, job_id: &str) -> std::result::Result<(), String> {
        let Some(kill) = &self.kill else {
            return self.cancel(runner, job_id).await.map(|_| ());
        };

        let spec = self.job_command(kill, job_id);
        let output = runner
            .run(&spec)
            .await
            .map_err(|e| format!("{}: {}", spec.program, e))?;

        if output.success() || self.scheduler.job_already_gone(&output) {
            Ok(())
        } else {
            Err(format!("{}: {}", spec.program, output.summary()))
        }
    }
}

/// Launcher for every batch scheduler backend
pub struct BatchLauncher {
    core: Arc<LauncherCore>,
    runner: Arc<dyn CommandRunner>,
    settings: Arc<BatchSettings>,
    job: Arc<Mutex<Option<String>>>,
}

impl BatchLauncher {
    pub fn new(role: Role, config: LauncherConfig, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        let settings = BatchSettings::from_backend(&config.backend)?;
        Ok(Self {
            core: Arc::new(LauncherCore::new(role.as_str(), role, config)),
            runner,
            settings: Arc::new(settings),
            job: Arc::new(Mutex::new(None)),
        })
    }

    /// Current job id, if a job is tracked
    pub fn job_id(&self) -> Option<String> {
        self.job.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_job(&self, job_id: Option<String>) {
        *self.job.lock().unwrap_or_else(PoisonError::into_inner) = job_id;
    }

    /// `{profile_dir}/{role}_{cluster_id}.{ext}`
    pub fn artifact_path(&self) -> Result<PathBuf> {
        self.artifact_path_for(&self.core.config())
    }

    fn artifact_path_for(&self, config: &LauncherConfig) -> Result<PathBuf> {
        let file_name = format!(
            "{}_{}.{}",
            self.core.role(),
            config.cluster_id,
            self.settings.scheduler.extension()
        );
        Ok(config.require_profile_dir()?.join(file_name))
    }

    /// Render the submission artifact for `n` processes without writing it
    pub fn render_artifact(&self, n: usize) -> Result<String> {
        self.render(&self.core.config(), n)
    }

    fn render(&self, config: &LauncherConfig, n: usize) -> Result<String> {
        let role = self.core.role();
        let args = ArgumentBuilder::new(config, role).program_args()?;
        let template = self.template_text(config)?;

        let template = match &self.settings.options {
            JobOptions::Script(opts) => self.settings.scheduler.insert_directives(&template, role, opts),
            JobOptions::WinHpc(_) => template,
        };

        let ctx = self.context(config, &args, n)?;
        Ok(ctx.render(&template)?)
    }

    fn template_text(&self, config: &LauncherConfig) -> Result<String> {
        if let Some(template) = self.settings.options.template() {
            return Ok(template.to_string());
        }

        if let Some(file) = self.settings.options.template_file() {
            let path = if file.is_absolute() {
                file.to_path_buf()
            } else {
                config.require_profile_dir()?.join(file)
            };
            return Ok(load_template(&path)?);
        }

        Ok(self.settings.scheduler.default_template(self.core.role()).to_string())
    }

    fn context(&self, config: &LauncherConfig, args: &ArgumentList, n: usize) -> Result<TemplateContext> {
        let role = self.core.role();
        let profile_dir = config.require_profile_dir()?.display().to_string();
        let work_dir = config
            .work_dir
            .as_ref()
            .map(|d| d.display().to_string())
            .unwrap_or_else(|| profile_dir.clone());
        let job_name = self
            .settings
            .options
            .job_name()
            .unwrap_or(role.program_name())
            .to_string();

        let mut ctx = TemplateContext::new()
            .with_var("n", n.to_string())
            .with_var("role", role.as_str())
            .with_var("profile_dir", profile_dir)
            .with_var("cluster_id", config.cluster_id.clone())
            .with_var("program", args.program().unwrap_or_default())
            .with_var("program_and_args", args.shell_join())
            .with_var("work_dir", work_dir)
            .with_var("job_name", job_name);

        match &self.settings.options {
            JobOptions::Script(opts) => {
                ctx.set_opt("queue", opts.queue.as_ref());
                ctx.set_opt("account", opts.account.as_ref());
                ctx.set_opt("walltime", opts.walltime.as_ref());
                ctx.set_opt("nodes", opts.nodes);
                if self.settings.scheduler == Scheduler::HtCondor {
                    ctx.set("condor_arguments", condor_arguments(args.tail()));
                }
                Ok(ctx.with_vars(opts.context.clone()))
            }
            JobOptions::WinHpc(opts) => {
                let mut ctx = ctx.with_vars(opts.context.clone());
                winhpc::extend_context(&mut ctx, opts, role, args, n);
                Ok(ctx)
            }
        }
    }

    async fn submit(&self, config: &LauncherConfig, path: &Path, script: &str) -> Result<String> {
        let settings = &self.settings;
        let spec = CommandSpec::from_argv(settings.submit.iter().cloned());
        let spec = if settings.scheduler.submits_on_stdin() {
            spec.with_stdin(script)
        } else if settings.scheduler == Scheduler::WindowsHpc {
            let mut spec = spec.arg(format!("/jobfile:{}", path.display()));
            spec.args.extend(settings.suffix.iter().cloned());
            spec
        } else {
            spec.arg(path.display().to_string())
        };
        let spec = spec.with_working_dir(config.work_dir.clone());

        log::info!("[{}] Submitting: {}", self.core.name(), spec);
        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| LaunchError::Submission(format!("{}: {}", spec.program, e)))?;

        if !output.success() {
            return Err(LaunchError::Submission(format!(
                "{}: {}",
                spec.program,
                output.summary()
            )));
        }

        settings
            .scheduler
            .parse_job_id(&output.stdout, settings.job_id_pattern.as_ref())
            .ok_or_else(|| {
                LaunchError::Submission(format!(
                    "{}: no job id in output {:?}",
                    spec.program,
                    output.stdout.trim()
                ))
            })
    }

    /// Poll the scheduler until the job is gone or the launcher stops
    fn watch_job(&self, config: &LauncherConfig, job_id: String) {
        let core = self.core.clone();
        let runner = self.runner.clone();
        let settings = self.settings.clone();
        let job = self.job.clone();
        let interval = Duration::from_millis(config.poll_interval_ms);
        let budget = config.poll_retry_budget;

        let handle = tokio::spawn(async move {
            core.wait_started().await;
            let mut state_rx = core.watch_state();
            let mut failures: u32 = 0;
            let release = || {
                *job.lock().unwrap_or_else(PoisonError::into_inner) = None;
            };

            loop {
                if *state_rx.borrow_and_update() != LauncherState::Running {
                    return;
                }

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        continue;
                    }
                }

                match settings.poll(runner.as_ref(), &job_id).await {
                    Ok(JobStatus::Active) | Ok(JobStatus::Unknown) => failures = 0,
                    Ok(JobStatus::Finished) => {
                        log::info!("[{}] Job {} is gone", core.name(), job_id);
                        core.mark_exited_with(LauncherState::Stopped, Vec::new(), None, release)
                            .await;
                        return;
                    }
                    Ok(JobStatus::Failed(reason)) => {
                        log::error!("[{}] Job {} failed: {}", core.name(), job_id, reason);
                        core.mark_exited_with(LauncherState::Failed, Vec::new(), None, release)
                            .await;
                        return;
                    }
                    Err(reason) => {
                        failures += 1;
                        log::warn!(
                            "[{}] Status poll for job {} failed ({} in a row): {}",
                            core.name(),
                            job_id,
                            failures,
                            reason
                        );
                        if budget.is_some_and(|limit| failures >= limit) {
                            let error = LaunchError::Unreachable {
                                target: format!("{} job {}", settings.scheduler, job_id),
                                attempts: failures,
                                reason,
                            };
                            core.mark_exited_with(LauncherState::Failed, Vec::new(), Some(error), release)
                                .await;
                            return;
                        }
                    }
                }
            }
        });
        self.core.track(handle);
    }

    /// Re-check the job until it is gone or `grace` runs out
    async fn wait_gone(&self, job_id: &str, grace: Duration, interval: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            if let Ok(JobStatus::Finished | JobStatus::Failed(_)) =
                self.settings.poll(self.runner.as_ref(), job_id).await
            {
                return true;
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(interval.min(deadline - now)).await;
        }
    }
}

/// HTCondor `arguments` value in the quoted syntax
fn condor_arguments(args: &[String]) -> String {
    let joined = args
        .iter()
        .map(|arg| {
            if arg.is_empty() || arg.contains([' ', '\t', '\'', '"']) {
                format!("'{}'", arg.replace('\'', "''"))
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ");
    format!("\"{}\"", joined.replace('"', "\"\""))
}

#[async_trait]
impl Launcher for BatchLauncher {
    fn core(&self) -> &Arc<LauncherCore> {
        &self.core
    }

    fn args(&self) -> Result<ArgumentList> {
        let config = self.core.config();
        Ok(ArgumentBuilder::new(&config, self.core.role()).program_args()?)
    }

    fn handles(&self) -> Vec<JobHandle> {
        self.job_id().into_iter().map(JobHandle::Job).collect()
    }

    async fn launch(&self, config: &LauncherConfig, n: usize) -> Result<()> {
        let script = self.render(config, n)?;
        let path = self.artifact_path_for(config)?;
        tokio::fs::write(&path, &script).await?;
        log::info!("[{}] Wrote {}", self.core.name(), path.display());

        let job_id = self.submit(config, &path, &script).await?;
        log::info!(
            "[{}] Submitted {} job {}",
            self.core.name(),
            self.settings.scheduler,
            job_id
        );

        self.set_job(Some(job_id.clone()));
        self.watch_job(config, job_id);
        Ok(())
    }

    async fn terminate(&self, config: &LauncherConfig) -> Vec<Option<i32>> {
        let Some(job_id) = self.job_id() else {
            return Vec::new();
        };
        let name = self.core.name();
        let runner = self.runner.as_ref();

        let gone = match self.settings.cancel(runner, &job_id).await {
            Ok(gone) => gone,
            Err(e) => {
                log::warn!("[{}] Cancel of job {} failed: {}", name, job_id, e);
                false
            }
        };

        let grace = Duration::from_millis(config.grace_period_ms);
        let interval = Duration::from_millis(config.poll_interval_ms);
        if !gone && !self.wait_gone(&job_id, grace, interval).await {
            log::warn!(
                "[{}] Job {} still present after {:?}, forcing cancel",
                name,
                job_id,
                grace
            );
            if let Err(e) = self.settings.force_cancel(runner, &job_id).await {
                log::warn!("[{}] Forced cancel of job {} failed: {}", name, job_id, e);
            }
        }

        self.set_job(None);
        Vec::new()
    }

    async fn signal(&self, signal: Signal) -> Result<()> {
        require_running(&self.core)?;
        if signal != Signal::Kill {
            return Err(unsupported_signal(self.settings.scheduler.name(), signal));
        }

        let Some(job_id) = self.job_id() else {
            return Ok(());
        };
        log::info!("[{}] Force cancelling job {}", self.core.name(), job_id);
        self.settings
            .force_cancel(self.runner.as_ref(), &job_id)
            .await
            .map_err(LaunchError::Submission)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{CommandOutput, RecordingRunner};

    fn launcher(backend: Backend, role: Role) -> (BatchLauncher, Arc<RecordingRunner>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let config = LauncherConfig::for_role(role)
            .with_profile_dir(dir.path())
            .with_backend(backend)
            .with_poll_interval_ms(10)
            .with_grace_period_ms(50);
        (
            BatchLauncher::new(role, config, runner.clone()).unwrap(),
            runner,
            dir,
        )
    }

    #[test]
    fn test_condor_arguments_quoting() {
        let args = vec!["--profile-dir".to_string(), "/a b".to_string(), "it's".to_string()];
        assert_eq!(condor_arguments(&args), r#""--profile-dir '/a b' 'it''s'""#);
    }

    #[test]
    fn test_engine_script_contents() {
        let opts = BatchOptions {
            queue: Some("debug".into()),
            ..Default::default()
        };
        let (launcher, _runner, dir) = launcher(Backend::Pbs(opts), Role::Engines);
        let script = launcher.render_artifact(8).unwrap();

        assert!(script.starts_with("#!/bin/sh\n#PBS -q debug\n"));
        assert!(script.contains("#PBS -t 1-8\n"));
        assert!(script.contains(&format!("ipengine --profile-dir {}", dir.path().display())));
    }

    #[test]
    fn test_template_file_relative_to_profile() {
        let opts = BatchOptions {
            template_file: Some("my.slurm".into()),
            ..Default::default()
        };
        let (launcher, _runner, dir) = launcher(Backend::Slurm(opts), Role::Controller);
        std::fs::write(dir.path().join("my.slurm"), "#!/bin/bash\n# {cluster_id}\n{program}\n").unwrap();

        let script = launcher.render_artifact(1).unwrap();
        assert_eq!(script, "#!/bin/bash\n# \nipcontroller\n");
    }

    #[test]
    fn test_undefined_placeholder_in_template() {
        let opts = BatchOptions {
            template: Some("#!/bin/sh\n#PBS -q {queue}\n".into()),
            ..Default::default()
        };
        let (launcher, _runner, _dir) = launcher(Backend::Pbs(opts), Role::Controller);
        assert!(matches!(
            launcher.render_artifact(1),
            Err(LaunchError::Template(_))
        ));
    }

    #[tokio::test]
    async fn test_lsf_submits_on_stdin() {
        let (launcher, runner, _dir) = launcher(Backend::Lsf(BatchOptions::default()), Role::Engines);
        runner.reply("bsub", CommandOutput::ok("Job <881> is submitted to queue <normal>."));
        runner.reply("bjobs", CommandOutput::ok("RUN"));

        launcher.start(2).await.unwrap();

        let submit = &runner.commands()[0];
        assert_eq!(submit.program, "bsub");
        assert!(submit.args.is_empty());
        assert!(submit.stdin.as_deref().unwrap().contains("#BSUB -J ipengine[1-2]"));
        assert_eq!(launcher.handles(), vec![JobHandle::Job("881".into())]);
    }

    #[tokio::test]
    async fn test_submit_failure() {
        let (launcher, runner, _dir) = launcher(Backend::Slurm(BatchOptions::default()), Role::Controller);
        runner.reply("sbatch", CommandOutput::failed(1, "sbatch: error: invalid partition"));

        let err = launcher.start(1).await.unwrap_err();
        assert!(matches!(err, LaunchError::Submission(_)));
        assert_eq!(launcher.state(), LauncherState::Failed);
        assert!(launcher.handles().is_empty());
    }

    #[tokio::test]
    async fn test_unparseable_submit_output() {
        let (launcher, runner, _dir) = launcher(Backend::Sge(BatchOptions::default()), Role::Controller);
        runner.reply("qsub", CommandOutput::ok("submitted"));

        assert!(matches!(
            launcher.start(1).await,
            Err(LaunchError::Submission(_))
        ));
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        runner.reply("sbatch", CommandOutput::ok("Submitted batch job 7"));
        runner.reply("squeue", CommandOutput::failed(1, "slurm_load_jobs error: Socket timed out"));

        let config = LauncherConfig::for_role(Role::Engines)
            .with_profile_dir(dir.path())
            .with_backend(Backend::Slurm(BatchOptions::default()))
            .with_poll_interval_ms(5)
            .with_poll_retry_budget(Some(3));
        let launcher = BatchLauncher::new(Role::Engines, config, runner.clone()).unwrap();
        launcher.start(2).await.unwrap();

        let notice = tokio::time::timeout(Duration::from_secs(5), launcher.subscribe().wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notice.state, LauncherState::Failed);
        assert!(matches!(
            notice.error.as_deref(),
            Some(LaunchError::Unreachable { attempts: 3, .. })
        ));
        assert_eq!(launcher.job_id(), None);
        assert!(launcher.handles().is_empty());
    }

    #[tokio::test]
    async fn test_stop_escalates_to_forced_cancel() {
        let (launcher, runner, _dir) = launcher(Backend::Pbs(BatchOptions::default()), Role::Controller);
        runner.reply("qsub", CommandOutput::ok("99.server"));
        runner.reply("qstat", CommandOutput::ok("Job Id: 99.server\n    job_state = R\n"));

        launcher.start(1).await.unwrap();
        launcher.stop().await.unwrap();

        let lines = runner.command_lines();
        assert!(lines.contains(&"qdel 99".to_string()));
        assert!(lines.contains(&"qdel -W force 99".to_string()));
        assert_eq!(launcher.state(), LauncherState::Stopped);
        assert!(launcher.handles().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_of_gone_job_is_success() {
        let (launcher, runner, _dir) = launcher(Backend::Slurm(BatchOptions::default()), Role::Controller);
        runner.reply("sbatch", CommandOutput::ok("Submitted batch job 5"));
        runner.reply("squeue", CommandOutput::ok("RUNNING"));
        runner.reply("scancel", CommandOutput::failed(1, "scancel: error: Invalid job id specified"));

        launcher.start(1).await.unwrap();
        launcher.stop().await.unwrap();

        assert_eq!(launcher.state(), LauncherState::Stopped);
        assert!(!runner.command_lines().iter().any(|l| l.starts_with("scancel -s KILL")));
    }

    #[tokio::test]
    async fn test_only_kill_signal_forwarded() {
        let (launcher, runner, _dir) = launcher(Backend::Slurm(BatchOptions::default()), Role::Engines);
        runner.reply("sbatch", CommandOutput::ok("Submitted batch job 12"));
        runner.reply("squeue", CommandOutput::ok("RUNNING"));
        launcher.start(3).await.unwrap();

        assert!(matches!(
            launcher.signal(Signal::Interrupt).await,
            Err(LaunchError::Config(_))
        ));
        launcher.signal(Signal::Kill).await.unwrap();
        assert!(runner.command_lines().contains(&"scancel -s KILL 12".to_string()));
    }

    #[tokio::test]
    async fn test_winhpc_submit_command() {
        let opts = WinHpcOptions {
            scheduler: Some("HEADNODE".into()),
            ..Default::default()
        };
        let (launcher, runner, dir) = launcher(Backend::WindowsHpc(opts), Role::Engines);
        runner.reply("job", CommandOutput::ok("Job has been submitted. ID: 42."));
        runner.reply_matching("job view", CommandOutput::ok("State : Running"));

        launcher.start(2).await.unwrap();

        let path = dir.path().join("engines_.xml");
        let xml = std::fs::read_to_string(&path).unwrap();
        assert_eq!(xml.matches("<Task ").count(), 2);
        assert_eq!(
            runner.command_lines()[0],
            format!("job submit /jobfile:{} /scheduler:HEADNODE", path.display())
        );
        assert_eq!(launcher.handles(), vec![JobHandle::Job("42".into())]);
    }
}
