//! SSH and SSH-proxy launchers
//!
//! Processes are started detached on the remote side with `nohup ... &`
//! and tracked by pid. Liveness is polled with `kill -0`; stopping sends
//! `kill -<SIG>` and escalates to `kill -KILL` after the grace period.
//! Started processes never receive `--cluster-id`.

use super::{require_running, JobHandle, Launcher, LauncherCore, LauncherState};
use crate::config::{
    sh_escape, shell_join, ArgumentBuilder, ArgumentList, Backend, ConfigError, LauncherConfig,
    Role, SshOptions,
};
use crate::error::{LaunchError, Result};
use crate::runtime::{CommandOutput, CommandRunner, CommandSpec, Signal};
use async_trait::async_trait;
use futures::future::join_all;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// `[user@]host`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub user: Option<String>,
    pub host: String,
}

impl SshTarget {
    /// Parse `user@host`; `default_user` applies when no user is given
    pub fn parse(spec: &str, default_user: Option<&str>) -> Self {
        match spec.split_once('@') {
            Some((user, host)) => Self {
                user: Some(user.to_string()),
                host: host.to_string(),
            },
            None => Self {
                user: default_user.map(str::to_string),
                host: spec.to_string(),
            },
        }
    }

    /// Destination argument for ssh/scp
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }
}

impl fmt::Display for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.destination())
    }
}

/// How remote commands are reached: directly or through a proxy host
#[derive(Debug, Clone)]
struct Route {
    ssh: Vec<String>,
    proxy: Option<SshTarget>,
}

impl Route {
    fn direct(&self, target: &SshTarget, script: &str) -> Vec<String> {
        let mut argv = self.ssh.clone();
        argv.push(target.destination());
        argv.push("--".to_string());
        argv.push(script.to_string());
        argv
    }

    /// `ssh target -- script`, nested as `ssh proxy -- ssh target -- script`
    /// when `via_proxy` is set
    fn command(&self, target: &SshTarget, via_proxy: bool, script: &str) -> CommandSpec {
        let inner = self.direct(target, script);
        match (&self.proxy, via_proxy) {
            (Some(proxy), true) => CommandSpec::from_argv(self.direct(proxy, &shell_join(&inner))),
            _ => CommandSpec::from_argv(inner),
        }
    }
}

/// Where a group of identical processes is started
#[derive(Debug, Clone)]
struct Placement {
    target: SshTarget,
    via_proxy: bool,
    args: ArgumentList,
    count: usize,
}

/// A process started on a remote host
#[derive(Debug, Clone, PartialEq, Eq)]
struct RemoteProcess {
    target: SshTarget,
    via_proxy: bool,
    pid: u32,
}

impl RemoteProcess {
    fn handle(&self) -> JobHandle {
        JobHandle::Remote {
            host: self.target.host.clone(),
            pid: self.pid,
        }
    }
}

/// Launcher for kinds `ssh` and `sshproxy`
pub struct SshLauncher {
    core: Arc<LauncherCore>,
    runner: Arc<dyn CommandRunner>,
    opts: SshOptions,
    route: Route,
    processes: Arc<Mutex<Vec<RemoteProcess>>>,
}

impl SshLauncher {
    pub fn new(role: Role, config: LauncherConfig, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        let (opts, proxied) = match &config.backend {
            Backend::Ssh(opts) => (opts.clone(), false),
            Backend::SshProxy(opts) => (opts.clone(), true),
            other => {
                return Err(LaunchError::invalid(format!(
                    "'{}' is not an ssh backend",
                    other.kind()
                )))
            }
        };

        let needs_hostname = role == Role::Controller || opts.engines.is_empty();
        if !proxied && needs_hostname && opts.hostname.is_none() {
            return Err(ConfigError::Missing("ssh: hostname".to_string()).into());
        }

        let route = Route {
            ssh: opts.ssh_cmd.iter().chain(&opts.ssh_args).cloned().collect(),
            proxy: opts
                .proxy_host
                .as_deref()
                .map(|host| SshTarget::parse(host, None)),
        };

        Ok(Self {
            core: Arc::new(LauncherCore::new(role.as_str(), role, config)),
            runner,
            opts,
            route,
            processes: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Profile directory as seen on the remote host
    pub fn remote_profile_dir(&self) -> Result<String> {
        self.remote_profile_dir_for(&self.core.config())
    }

    fn remote_profile_dir_for(&self, config: &LauncherConfig) -> Result<String> {
        match &self.opts.remote_profile_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(config.require_profile_dir()?.display().to_string()),
        }
    }

    fn processes(&self) -> Vec<RemoteProcess> {
        self.processes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn take_processes(&self) -> Vec<RemoteProcess> {
        std::mem::take(&mut *self.processes.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Controller host, or the proxy itself for an `sshproxy` without one
    fn primary_target(&self) -> Result<(SshTarget, bool)> {
        match (&self.opts.hostname, &self.route.proxy) {
            (Some(host), proxy) => Ok((
                SshTarget::parse(host, self.opts.user.as_deref()),
                proxy.is_some(),
            )),
            (None, Some(proxy)) => Ok((proxy.clone(), false)),
            (None, None) => Err(ConfigError::Missing("ssh: hostname".to_string()).into()),
        }
    }

    fn placements(&self, config: &LauncherConfig, n: usize) -> Result<Vec<Placement>> {
        let role = self.core.role();
        let remote_dir = self.remote_profile_dir_for(config)?;
        let program_args = |role_args: Option<&[String]>| {
            ArgumentBuilder::new(config, role)
                .with_profile_dir(remote_dir.clone())
                .with_role_args(role_args)
                .program_args()
        };

        if role == Role::Controller {
            let (target, via_proxy) = self.primary_target()?;
            return Ok(vec![Placement {
                target,
                via_proxy,
                args: program_args(None)?,
                count: 1,
            }]);
        }

        if self.opts.engines.is_empty() {
            if let Some(proxy) = &self.route.proxy {
                let mut argv = self.opts.ipcluster_cmd.clone();
                argv.extend([
                    "engines".to_string(),
                    format!("--n={}", n),
                    "--profile-dir".to_string(),
                    remote_dir.clone(),
                ]);
                return Ok(vec![Placement {
                    target: proxy.clone(),
                    via_proxy: false,
                    args: ArgumentList::new(argv),
                    count: 1,
                }]);
            }

            let (target, via_proxy) = self.primary_target()?;
            return Ok(vec![Placement {
                target,
                via_proxy,
                args: program_args(None)?,
                count: n,
            }]);
        }

        let total: usize = self.opts.engines.values().map(|spec| spec.count()).sum();
        if total != n {
            log::info!(
                "[{}] Using per-host engine counts ({} total), ignoring n={}",
                self.core.name(),
                total,
                n
            );
        }

        self.opts
            .engines
            .iter()
            .map(|(host, spec)| {
                Ok(Placement {
                    target: SshTarget::parse(host, self.opts.user.as_deref()),
                    via_proxy: self.route.proxy.is_some(),
                    args: program_args(spec.args())?,
                    count: spec.count(),
                })
            })
            .collect()
    }

    fn launch_script(&self, config: &LauncherConfig, remote_dir: &str, args: &ArgumentList, log_file: &str) -> String {
        let log_dir = format!("{}/log", remote_dir.trim_end_matches('/'));
        let mut script = format!("mkdir -p {} && ", sh_escape(&log_dir));
        if let Some(dir) = &self.opts.remote_work_dir {
            script.push_str(&format!("cd {} && ", sh_escape(dir)));
        }

        script.push_str("nohup ");
        if !config.env.is_empty() {
            let vars: Vec<String> = config.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            script.push_str(&format!("env {} ", shell_join(&vars)));
        }
        script.push_str(&format!(
            "{} > {} 2>&1 < /dev/null & echo $!",
            args.shell_join(),
            sh_escape(log_file)
        ));
        script
    }

    async fn start_one(&self, config: &LauncherConfig, placement: &Placement, index: usize) -> Result<RemoteProcess> {
        let remote_dir = self.remote_profile_dir_for(config)?;
        let program = placement
            .args
            .program()
            .and_then(|p| p.rsplit('/').next())
            .unwrap_or("process");
        let log_file = format!(
            "{}/log/{}-{}-{}.log",
            remote_dir.trim_end_matches('/'),
            program,
            placement.target.host,
            index
        );

        let script = self.launch_script(config, &remote_dir, &placement.args, &log_file);
        let spec = self.route.command(&placement.target, placement.via_proxy, &script);
        log::info!(
            "[{}] Starting on {}: {}",
            self.core.name(),
            placement.target,
            placement.args
        );

        let output = self.run_checked(&placement.target, &spec).await?;
        let pid = parse_pid(&output.stdout).ok_or_else(|| LaunchError::RemoteConnection {
            host: placement.target.to_string(),
            reason: format!("no pid in output {:?}", output.stdout.trim()),
        })?;

        log::debug!("[{}] {} started as pid {}", self.core.name(), placement.target, pid);
        Ok(RemoteProcess {
            target: placement.target.clone(),
            via_proxy: placement.via_proxy,
            pid,
        })
    }

    /// Run a command, mapping failure to `RemoteConnection`
    async fn run_checked(&self, target: &SshTarget, spec: &CommandSpec) -> Result<CommandOutput> {
        let output = self
            .runner
            .run(spec)
            .await
            .map_err(|e| LaunchError::RemoteConnection {
                host: target.to_string(),
                reason: format!("{}: {}", spec.program, e),
            })?;

        if !output.success() {
            return Err(LaunchError::RemoteConnection {
                host: target.to_string(),
                reason: format!("{}: {}", spec.program, output.summary()),
            });
        }
        Ok(output)
    }

    fn scp(&self, from: String, to: String) -> CommandSpec {
        CommandSpec::from_argv(self.opts.scp_cmd.iter().cloned())
            .arg(from)
            .arg(to)
    }

    async fn send_files(&self, targets: &[SshTarget]) -> Result<()> {
        for target in targets {
            for file in &self.opts.to_send {
                log::info!(
                    "[{}] Sending {} to {}:{}",
                    self.core.name(),
                    file.local.display(),
                    target,
                    file.remote
                );
                let spec = self.scp(
                    file.local.display().to_string(),
                    format!("{}:{}", target.destination(), file.remote),
                );
                self.run_checked(target, &spec).await?;
            }
        }
        Ok(())
    }

    /// Wait for each remote file to appear, then copy it back
    async fn fetch_files(&self, config: &LauncherConfig, target: &SshTarget) -> Result<()> {
        let timeout = Duration::from_millis(self.opts.fetch_timeout_ms);
        let interval = Duration::from_millis(config.poll_interval_ms);

        for file in &self.opts.to_fetch {
            let deadline = tokio::time::Instant::now() + timeout;
            let check = self
                .route
                .command(target, false, &format!("test -e {}", sh_escape(&file.remote)));

            loop {
                if matches!(self.runner.run(&check).await, Ok(output) if output.success()) {
                    break;
                }
                let now = tokio::time::Instant::now();
                if now >= deadline {
                    return Err(LaunchError::RemoteConnection {
                        host: target.to_string(),
                        reason: format!("timed out after {:?} waiting for {}", timeout, file.remote),
                    });
                }
                tokio::time::sleep(interval.min(deadline - now)).await;
            }

            log::info!(
                "[{}] Fetching {}:{} to {}",
                self.core.name(),
                target,
                file.remote,
                file.local.display()
            );
            let spec = self.scp(
                format!("{}:{}", target.destination(), file.remote),
                file.local.display().to_string(),
            );
            self.run_checked(target, &spec).await?;
        }
        Ok(())
    }

    /// Signal, wait up to `grace`, then `kill -KILL` whatever is left
    async fn stop_processes(&self, processes: &[RemoteProcess], signal: Signal, grace: Duration, interval: Duration) {
        let name = self.core.name();
        let results = join_all(processes.iter().map(|p| send_signal(&*self.runner, &self.route, p, signal))).await;
        for (process, result) in processes.iter().zip(results) {
            if let Err(e) = result {
                log::warn!("[{}] Failed to signal {}: {}", name, process.handle(), e);
            }
        }

        let deadline = tokio::time::Instant::now() + grace;
        let mut remaining = processes.to_vec();
        loop {
            let alive = join_all(remaining.iter().map(|p| is_alive(&*self.runner, &self.route, p))).await;
            // Processes we cannot reach are kept for the forced kill
            remaining = remaining
                .into_iter()
                .zip(alive)
                .filter(|(_, alive)| !matches!(alive, Ok(false)))
                .map(|(p, _)| p)
                .collect();

            let now = tokio::time::Instant::now();
            if remaining.is_empty() || now >= deadline {
                break;
            }
            tokio::time::sleep(interval.min(deadline - now)).await;
        }

        if remaining.is_empty() {
            return;
        }
        log::warn!(
            "[{}] {} remote process(es) still alive after {:?}, sending SIGKILL",
            name,
            remaining.len(),
            grace
        );
        for process in &remaining {
            if let Err(e) = send_signal(&*self.runner, &self.route, process, Signal::Kill).await {
                log::warn!("[{}] Failed to kill {}: {}", name, process.handle(), e);
            }
        }
    }

    /// Poll remote pids until all are gone or the launcher leaves `Running`
    fn watch_remote(&self, config: &LauncherConfig) {
        let core = self.core.clone();
        let runner = self.runner.clone();
        let route = self.route.clone();
        let processes = self.processes.clone();
        let interval = Duration::from_millis(config.poll_interval_ms);
        let budget = config.poll_retry_budget;

        let handle = tokio::spawn(async move {
            core.wait_started().await;
            let mut state_rx = core.watch_state();
            let started = processes.lock().unwrap_or_else(PoisonError::into_inner).len();
            let mut failures: u32 = 0;

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

                let snapshot = processes.lock().unwrap_or_else(PoisonError::into_inner).clone();
                let results = join_all(snapshot.iter().map(|p| is_alive(&*runner, &route, p))).await;

                let mut unreachable = None;
                let mut gone = Vec::new();
                for (process, result) in snapshot.iter().zip(results) {
                    match result {
                        Ok(true) => {}
                        Ok(false) => {
                            log::info!("[{}] {} exited", core.name(), process.handle());
                            gone.push(process.clone());
                        }
                        Err(reason) => unreachable = Some((process.target.clone(), reason)),
                    }
                }

                let live = {
                    let mut list = processes.lock().unwrap_or_else(PoisonError::into_inner);
                    list.retain(|p| !gone.contains(p));
                    list.len()
                };
                if live == 0 {
                    core.mark_exited(LauncherState::Stopped, vec![None; started], None)
                        .await;
                    return;
                }

                let Some((target, reason)) = unreachable else {
                    failures = 0;
                    continue;
                };
                failures += 1;
                log::warn!(
                    "[{}] Liveness check on {} failed ({} in a row): {}",
                    core.name(),
                    target,
                    failures,
                    reason
                );
                if budget.is_some_and(|limit| failures >= limit) {
                    let error = LaunchError::Unreachable {
                        target: target.to_string(),
                        attempts: failures,
                        reason,
                    };
                    core.mark_exited(LauncherState::Failed, vec![None; started], Some(error))
                        .await;
                    return;
                }
            }
        });
        self.core.track(handle);
    }
}

/// Last non-empty output line as a pid
fn parse_pid(stdout: &str) -> Option<u32> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())?
        .parse()
        .ok()
}

async fn send_signal(runner: &dyn CommandRunner, route: &Route, process: &RemoteProcess, signal: Signal) -> Result<()> {
    let spec = route.command(
        &process.target,
        process.via_proxy,
        &format!("kill -{} {}", signal.name(), process.pid),
    );
    let output = runner
        .run(&spec)
        .await
        .map_err(|e| LaunchError::RemoteConnection {
            host: process.target.to_string(),
            reason: e.to_string(),
        })?;

    if !output.success() {
        return Err(LaunchError::RemoteConnection {
            host: process.target.to_string(),
            reason: format!("kill -{} {}: {}", signal.name(), process.pid, output.summary()),
        });
    }
    Ok(())
}

/// `kill -0`: exit 0 alive, exit 1 gone, anything else is a failed check
async fn is_alive(runner: &dyn CommandRunner, route: &Route, process: &RemoteProcess) -> std::result::Result<bool, String> {
    let spec = route.command(&process.target, process.via_proxy, &format!("kill -0 {}", process.pid));
    let output = runner.run(&spec).await.map_err(|e| e.to_string())?;
    match output.code {
        Some(0) => Ok(true),
        Some(1) => Ok(false),
        _ => Err(output.summary()),
    }
}

#[async_trait]
impl Launcher for SshLauncher {
    fn core(&self) -> &Arc<LauncherCore> {
        &self.core
    }

    fn args(&self) -> Result<ArgumentList> {
        let config = self.core.config();
        Ok(ArgumentBuilder::new(&config, self.core.role())
            .with_profile_dir(self.remote_profile_dir_for(&config)?)
            .program_args()?)
    }

    fn handles(&self) -> Vec<JobHandle> {
        self.processes().iter().map(RemoteProcess::handle).collect()
    }

    fn set_cluster_id(&self, id: &str) -> Result<()> {
        self.core.set_cluster_id(id)?;
        log::warn!(
            "[{}] Cluster id '{}' is not passed to processes started over SSH",
            self.core.name(),
            id
        );
        Ok(())
    }

    async fn launch(&self, config: &LauncherConfig, n: usize) -> Result<()> {
        let placements = self.placements(config, n)?;

        let mut targets: Vec<SshTarget> = Vec::new();
        for placement in &placements {
            if !targets.contains(&placement.target) {
                targets.push(placement.target.clone());
            }
        }
        self.send_files(&targets).await?;

        let grace = Duration::from_millis(config.grace_period_ms);
        let interval = Duration::from_millis(config.poll_interval_ms);
        let mut started = Vec::new();
        let mut result = Ok(());

        'outer: for placement in &placements {
            for index in 0..placement.count {
                match self.start_one(config, placement, index).await {
                    Ok(process) => started.push(process),
                    Err(e) => {
                        result = Err(e);
                        break 'outer;
                    }
                }
            }
        }

        if result.is_ok() {
            if let Some(first) = targets.first() {
                result = self.fetch_files(config, first).await;
            }
        }

        if let Err(e) = result {
            if !started.is_empty() {
                log::warn!(
                    "[{}] Stopping {} already started remote process(es)",
                    self.core.name(),
                    started.len()
                );
                self.stop_processes(&started, config.stop_signal, grace, interval)
                    .await;
            }
            return Err(e);
        }

        log::info!("[{}] Started {} remote process(es)", self.core.name(), started.len());
        *self.processes.lock().unwrap_or_else(PoisonError::into_inner) = started;
        self.watch_remote(config);
        Ok(())
    }

    async fn terminate(&self, config: &LauncherConfig) -> Vec<Option<i32>> {
        let processes = self.take_processes();
        if processes.is_empty() {
            return Vec::new();
        }

        self.stop_processes(
            &processes,
            config.stop_signal,
            Duration::from_millis(config.grace_period_ms),
            Duration::from_millis(config.poll_interval_ms),
        )
        .await;
        vec![None; processes.len()]
    }

    async fn signal(&self, signal: Signal) -> Result<()> {
        require_running(&self.core)?;
        log::info!("[{}] Sending {}", self.core.name(), signal);

        let processes = self.processes();
        let results = join_all(processes.iter().map(|p| send_signal(&*self.runner, &self.route, p, signal))).await;
        results.into_iter().collect::<Result<Vec<()>>>()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineHostSpec;
    use crate::runtime::RecordingRunner;
    use indexmap::IndexMap;

    fn launcher(role: Role, backend: Backend) -> (SshLauncher, Arc<RecordingRunner>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let config = LauncherConfig::for_role(role)
            .with_profile_dir(dir.path())
            .with_backend(backend)
            .with_poll_interval_ms(10)
            .with_grace_period_ms(50);
        (
            SshLauncher::new(role, config, runner.clone()).unwrap(),
            runner,
            dir,
        )
    }

    fn ssh(hostname: &str) -> SshOptions {
        SshOptions {
            hostname: Some(hostname.into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_target_parsing() {
        assert_eq!(
            SshTarget::parse("alice@node1", Some("bob")).destination(),
            "alice@node1"
        );
        assert_eq!(SshTarget::parse("node1", Some("bob")).destination(), "bob@node1");
        assert_eq!(SshTarget::parse("node1", None).destination(), "node1");
    }

    #[test]
    fn test_pid_from_last_line() {
        assert_eq!(parse_pid("motd\n4242\n"), Some(4242));
        assert_eq!(parse_pid("no pid"), None);
    }

    #[test]
    fn test_proxy_nests_command() {
        let route = Route {
            ssh: vec!["ssh".into()],
            proxy: Some(SshTarget::parse("gateway", None)),
        };
        let spec = route.command(&SshTarget::parse("node1", None), true, "kill -0 7");
        assert_eq!(spec.argv(), vec!["ssh", "gateway", "--", "ssh node1 -- 'kill -0 7'"]);
    }

    #[test]
    fn test_hostname_required() {
        let config = LauncherConfig::for_role(Role::Controller)
            .with_backend(Backend::Ssh(SshOptions::default()));
        let result = SshLauncher::new(Role::Controller, config, Arc::new(RecordingRunner::new()));
        assert!(matches!(result, Err(LaunchError::Config(ConfigError::Missing(_)))));
    }

    #[test]
    fn test_args_use_remote_profile_dir() {
        let opts = SshOptions {
            remote_profile_dir: Some("/home/me/.ipython/profile_default".into()),
            ..ssh("node1")
        };
        let (launcher, _runner, _dir) = launcher(Role::Engines, Backend::Ssh(opts));
        launcher.set_cluster_id("abc").unwrap();

        let args = launcher.args().unwrap();
        assert_eq!(args.value_of("--profile-dir"), Some("/home/me/.ipython/profile_default"));
        assert!(!args.contains(&"--cluster-id".to_string()));
    }

    #[tokio::test]
    async fn test_launch_script() {
        let (launcher, runner, dir) = launcher(Role::Controller, Backend::Ssh(ssh("me@head")));
        runner.reply("ssh", CommandOutput::ok("4242\n"));
        runner.reply_matching("kill -0", CommandOutput::ok(""));

        launcher.start(1).await.unwrap();

        let profile = dir.path().display().to_string();
        let launch = &runner.commands()[0];
        assert_eq!(&launch.args[..2], &["me@head".to_string(), "--".to_string()]);
        assert_eq!(
            launch.args[2],
            format!(
                "mkdir -p {p}/log && nohup ipcontroller --profile-dir {p} --log-to-file --log-level=20 > {p}/log/ipcontroller-head-0.log 2>&1 < /dev/null & echo $!",
                p = profile
            )
        );
        assert_eq!(
            launcher.handles(),
            vec![JobHandle::Remote {
                host: "head".into(),
                pid: 4242
            }]
        );
    }

    #[tokio::test]
    async fn test_engines_per_host() {
        let mut engines = IndexMap::new();
        engines.insert("node1".to_string(), EngineHostSpec::Count(2));
        engines.insert("node2".to_string(), EngineHostSpec::Count(1));
        let opts = SshOptions {
            engines,
            ..Default::default()
        };
        let (launcher, runner, _dir) = launcher(Role::Engines, Backend::Ssh(opts));
        runner.reply_matching("echo $!", CommandOutput::ok("100"));
        runner.reply_matching("kill -0", CommandOutput::ok(""));

        launcher.start(10).await.unwrap();

        let hosts: Vec<String> = runner.commands().iter().map(|c| c.args[0].clone()).collect();
        assert_eq!(&hosts[..3], &["node1", "node1", "node2"]);
        assert_eq!(launcher.handles().len(), 3);
    }

    #[tokio::test]
    async fn test_ssh_failure_is_remote_connection_error() {
        let (launcher, runner, _dir) = launcher(Role::Engines, Backend::Ssh(ssh("node1")));
        runner.reply("ssh", CommandOutput::failed(255, "ssh: connect to host node1 port 22: Connection refused"));

        let err = launcher.start(2).await.unwrap_err();
        assert!(matches!(err, LaunchError::RemoteConnection { ref host, .. } if host == "node1"));
        assert_eq!(launcher.state(), LauncherState::Failed);
    }

    #[tokio::test]
    async fn test_exit_detected_by_poll() {
        let (launcher, runner, _dir) = launcher(Role::Engines, Backend::Ssh(ssh("node1")));
        runner.reply_matching("echo $!", CommandOutput::ok("4242"));
        runner.reply_matching("kill -0", CommandOutput::failed(1, ""));

        launcher.start(1).await.unwrap();
        let notice = tokio::time::timeout(Duration::from_secs(5), launcher.subscribe().wait())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(notice.state, LauncherState::Stopped);
        assert!(!notice.requested);
        assert!(launcher.handles().is_empty());
    }

    #[tokio::test]
    async fn test_stop_escalates_to_kill() {
        let (launcher, runner, _dir) = launcher(Role::Controller, Backend::Ssh(ssh("node1")));
        runner.reply_matching("echo $!", CommandOutput::ok("4242"));
        runner.reply_matching("kill -0", CommandOutput::ok(""));

        launcher.start(1).await.unwrap();
        launcher.stop().await.unwrap();

        let scripts: Vec<String> = runner.commands().iter().map(|c| c.args[2].clone()).collect();
        assert!(scripts.contains(&"kill -TERM 4242".to_string()));
        assert!(scripts.contains(&"kill -KILL 4242".to_string()));
        assert_eq!(launcher.state(), LauncherState::Stopped);
        assert!(launcher.handles().is_empty());
    }

    #[tokio::test]
    async fn test_proxy_without_engines_runs_ipcluster() {
        let opts = SshOptions {
            proxy_host: Some("gateway".into()),
            remote_profile_dir: Some("/remote/profile".into()),
            ..Default::default()
        };
        let (launcher, runner, _dir) = launcher(Role::Engines, Backend::SshProxy(opts));
        runner.reply_matching("echo $!", CommandOutput::ok("55"));
        runner.reply_matching("kill -0", CommandOutput::ok(""));

        launcher.start(8).await.unwrap();

        let launch = &runner.commands()[0];
        assert_eq!(launch.args[0], "gateway");
        assert!(launch.args[2].contains("nohup ipcluster engines --n=8 --profile-dir /remote/profile >"));
    }

    #[tokio::test]
    async fn test_files_sent_and_fetched() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let local = dir.path().join("engine.json");
        let opts = SshOptions {
            to_send: vec![crate::config::FileTransfer {
                local: dir.path().join("ipcontroller.json"),
                remote: "/remote/ipcontroller.json".into(),
            }],
            to_fetch: vec![crate::config::FileTransfer {
                local: local.clone(),
                remote: "/remote/engine.json".into(),
            }],
            ..ssh("head")
        };
        let config = LauncherConfig::for_role(Role::Controller)
            .with_profile_dir(dir.path())
            .with_backend(Backend::Ssh(opts))
            .with_poll_interval_ms(10);
        let launcher = SshLauncher::new(Role::Controller, config, runner.clone()).unwrap();
        runner.reply_matching("echo $!", CommandOutput::ok("9"));
        runner.reply_matching("test -e", CommandOutput::failed(1, ""));
        runner.reply_matching("test -e", CommandOutput::ok(""));

        launcher.start(1).await.unwrap();

        let lines = runner.command_lines();
        assert_eq!(
            lines[0],
            format!("scp {} head:/remote/ipcontroller.json", dir.path().join("ipcontroller.json").display())
        );
        assert!(lines.contains(&format!("scp head:/remote/engine.json {}", local.display())));
        assert_eq!(lines.iter().filter(|l| l.contains("test -e")).count(), 2);
    }
}
