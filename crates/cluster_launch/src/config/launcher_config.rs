//! Launcher configuration schema

use crate::runtime::Signal;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Which half of a cluster a launcher starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The single coordinating process
    Controller,
    /// A set of worker processes
    Engines,
}

impl Role {
    /// Name used in artifact file names and log prefixes
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Controller => "controller",
            Role::Engines => "engines",
        }
    }

    /// Executable started for this role when `cmd` is not configured
    pub fn default_cmd(&self) -> Vec<String> {
        match self {
            Role::Controller => vec!["ipcontroller".to_string()],
            Role::Engines => vec!["ipengine".to_string()],
        }
    }

    /// Program name used for job names and remote log files
    pub fn program_name(&self) -> &'static str {
        match self {
            Role::Controller => "ipcontroller",
            Role::Engines => "ipengine",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_role_args() -> Vec<String> {
    vec!["--log-to-file".to_string(), "--log-level=20".to_string()]
}

/// Default grace period between a stop request and a forced kill
pub const DEFAULT_GRACE_PERIOD_MS: u64 = 2_000;

/// Default interval between scheduler or remote liveness polls
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;

/// Default bound on a single external command
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 30_000;

/// Fully resolved configuration for one launcher
#[derive(Debug, Clone, PartialEq)]
pub struct LauncherConfig {
    /// Local profile directory (must exist before `start`)
    pub profile_dir: Option<PathBuf>,
    /// Cluster identity; empty means no disambiguation
    pub cluster_id: String,
    /// Working directory for spawned processes and batch jobs
    pub work_dir: Option<PathBuf>,
    /// Program (and any fixed leading arguments) to run
    pub cmd: Vec<String>,
    /// Role-specific arguments appended after the cluster arguments
    pub args: Vec<String>,
    /// Default worker count, used by `args()` before `start`
    pub n: usize,
    /// Time allowed between a stop request and a forced kill
    pub grace_period_ms: u64,
    /// Interval between status polls
    pub poll_interval_ms: u64,
    /// Consecutive failed polls tolerated before giving up (None = forever)
    pub poll_retry_budget: Option<u32>,
    /// Upper bound for a single submit/cancel/poll/ssh command
    pub command_timeout_ms: u64,
    /// Signal sent first when stopping
    pub stop_signal: Signal,
    /// Extra environment for spawned processes
    pub env: IndexMap<String, String>,
    /// Backend selection and its options
    pub backend: Backend,
}

impl LauncherConfig {
    /// Configuration with every default for the given role
    pub fn for_role(role: Role) -> Self {
        Self {
            profile_dir: None,
            cluster_id: String::new(),
            work_dir: None,
            cmd: role.default_cmd(),
            args: default_role_args(),
            n: 1,
            grace_period_ms: DEFAULT_GRACE_PERIOD_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            poll_retry_budget: None,
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
            stop_signal: Signal::Terminate,
            env: IndexMap::new(),
            backend: Backend::default(),
        }
    }

    pub fn with_profile_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.profile_dir = Some(dir.into());
        self
    }

    pub fn with_cluster_id(mut self, id: impl Into<String>) -> Self {
        self.cluster_id = id.into();
        self
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_cmd<I, S>(mut self, cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cmd = cmd.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_grace_period_ms(mut self, ms: u64) -> Self {
        self.grace_period_ms = ms;
        self
    }

    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_poll_retry_budget(mut self, budget: Option<u32>) -> Self {
        self.poll_retry_budget = budget;
        self
    }

    /// The profile directory, or a `ConfigError` when unset
    pub fn require_profile_dir(&self) -> Result<&Path, ConfigError> {
        self.profile_dir
            .as_deref()
            .ok_or_else(|| ConfigError::Missing("profile_dir".to_string()))
    }

    /// Check that the profile directory is set and exists on disk
    pub fn check_profile_dir(&self) -> Result<&Path, ConfigError> {
        let dir = self.require_profile_dir()?;
        if !dir.is_dir() {
            return Err(ConfigError::Invalid(format!(
                "profile_dir '{}' does not exist",
                dir.display()
            )));
        }
        Ok(dir)
    }

    /// Validate options that serde cannot check on its own
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cmd.is_empty() {
            return Err(ConfigError::Invalid("cmd must not be empty".to_string()));
        }
        if self.n == 0 {
            return Err(ConfigError::Invalid("n must be at least 1".to_string()));
        }
        if let Some(dir) = &self.profile_dir {
            if !dir.is_absolute() {
                return Err(ConfigError::Invalid(format!(
                    "profile_dir '{}' must be an absolute path",
                    dir.display()
                )));
            }
        }
        self.backend.validate()
    }
}

/// Backend selection, tagged by `kind` in YAML
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Backend {
    Local(LocalOptions),
    Mpi(MpiOptions),
    Pbs(BatchOptions),
    Sge(BatchOptions),
    Lsf(BatchOptions),
    Slurm(BatchOptions),
    #[serde(rename = "htcondor")]
    HtCondor(BatchOptions),
    #[serde(rename = "winhpc")]
    WindowsHpc(WinHpcOptions),
    Ssh(SshOptions),
    #[serde(rename = "sshproxy")]
    SshProxy(SshOptions),
}

impl Default for Backend {
    fn default() -> Self {
        Backend::Local(LocalOptions::default())
    }
}

impl Backend {
    /// The `kind` tag for this backend
    pub fn kind(&self) -> &'static str {
        match self {
            Backend::Local(_) => "local",
            Backend::Mpi(_) => "mpi",
            Backend::Pbs(_) => "pbs",
            Backend::Sge(_) => "sge",
            Backend::Lsf(_) => "lsf",
            Backend::Slurm(_) => "slurm",
            Backend::HtCondor(_) => "htcondor",
            Backend::WindowsHpc(_) => "winhpc",
            Backend::Ssh(_) => "ssh",
            Backend::SshProxy(_) => "sshproxy",
        }
    }

    /// Whether `--cluster-id` is passed to started processes
    pub fn supports_cluster_id(&self) -> bool {
        !matches!(self, Backend::Ssh(_) | Backend::SshProxy(_))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Backend::Local(_) => Ok(()),
            Backend::Mpi(opts) => {
                if opts.mpi_cmd.is_empty() {
                    return Err(ConfigError::Invalid("mpi_cmd must not be empty".to_string()));
                }
                Ok(())
            }
            Backend::Pbs(opts)
            | Backend::Sge(opts)
            | Backend::Lsf(opts)
            | Backend::Slurm(opts)
            | Backend::HtCondor(opts) => opts.validate(self.kind()),
            Backend::WindowsHpc(opts) => {
                if opts.template.is_some() && opts.template_file.is_some() {
                    return Err(ConfigError::Invalid(
                        "winhpc: 'template' and 'template_file' are mutually exclusive".to_string(),
                    ));
                }
                if opts.job_cmd.is_empty() {
                    return Err(ConfigError::Invalid("winhpc: job_cmd must not be empty".to_string()));
                }
                Ok(())
            }
            Backend::Ssh(opts) => {
                if opts.proxy_host.is_some() {
                    return Err(ConfigError::Invalid(
                        "ssh: 'proxy_host' is only valid for kind 'sshproxy'".to_string(),
                    ));
                }
                opts.validate("ssh")
            }
            Backend::SshProxy(opts) => {
                if opts.proxy_host.as_deref().unwrap_or_default().is_empty() {
                    return Err(ConfigError::Missing("sshproxy: proxy_host".to_string()));
                }
                if !opts.to_send.is_empty() || !opts.to_fetch.is_empty() {
                    return Err(ConfigError::Invalid(
                        "sshproxy: file transfer is not supported through a proxy hop".to_string(),
                    ));
                }
                opts.validate("sshproxy")
            }
        }
    }
}

/// Options for directly spawned local processes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LocalOptions {
    /// Delay between consecutive engine spawns
    pub delay_ms: u64,
}

impl Default for LocalOptions {
    fn default() -> Self {
        Self { delay_ms: 100 }
    }
}

/// Options for launching through an MPI front-end
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MpiOptions {
    /// MPI launcher command
    pub mpi_cmd: Vec<String>,
    /// Extra arguments placed between `-n N` and the program
    pub mpi_args: Vec<String>,
}

impl Default for MpiOptions {
    fn default() -> Self {
        Self {
            mpi_cmd: vec!["mpiexec".to_string()],
            mpi_args: Vec::new(),
        }
    }
}

/// Options shared by the script-based batch schedulers
///
/// Commands left unset fall back to the scheduler's defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchOptions {
    pub submit_command: Option<Vec<String>>,
    pub delete_command: Option<Vec<String>>,
    pub kill_command: Option<Vec<String>>,
    pub status_command: Option<Vec<String>>,
    /// Regex extracting the job id from the submit output
    pub job_id_regexp: Option<String>,
    pub queue: Option<String>,
    pub account: Option<String>,
    pub walltime: Option<String>,
    pub nodes: Option<u32>,
    pub job_name: Option<String>,
    /// Extra directive lines inserted after the shebang
    pub options: Vec<String>,
    /// Script template overriding the scheduler default
    pub template: Option<String>,
    /// Template file, relative paths resolve against the profile dir
    pub template_file: Option<PathBuf>,
    /// Extra template variables
    pub context: IndexMap<String, String>,
}

impl BatchOptions {
    fn validate(&self, kind: &str) -> Result<(), ConfigError> {
        if self.template.is_some() && self.template_file.is_some() {
            return Err(ConfigError::Invalid(format!(
                "{kind}: 'template' and 'template_file' are mutually exclusive"
            )));
        }
        if let Some(pattern) = &self.job_id_regexp {
            regex::Regex::new(pattern).map_err(|e| {
                ConfigError::Invalid(format!("{kind}: invalid job_id_regexp: {e}"))
            })?;
        }
        for (name, cmd) in [
            ("submit_command", &self.submit_command),
            ("delete_command", &self.delete_command),
            ("status_command", &self.status_command),
        ] {
            if cmd.as_ref().is_some_and(|c| c.is_empty()) {
                return Err(ConfigError::Invalid(format!("{kind}: {name} must not be empty")));
            }
        }
        Ok(())
    }
}

/// Options for Windows HPC Server job descriptions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WinHpcOptions {
    /// The `job` command line tool
    pub job_cmd: Vec<String>,
    /// Head node passed as `/scheduler:<name>`
    pub scheduler: Option<String>,
    pub job_name: Option<String>,
    pub project: String,
    pub username: Option<String>,
    pub priority: String,
    /// XML template overriding the default job description
    pub template: Option<String>,
    pub template_file: Option<PathBuf>,
    pub context: IndexMap<String, String>,
}

impl Default for WinHpcOptions {
    fn default() -> Self {
        Self {
            job_cmd: vec!["job".to_string()],
            scheduler: None,
            job_name: None,
            project: "IPython".to_string(),
            username: None,
            priority: "Highest".to_string(),
            template: None,
            template_file: None,
            context: IndexMap::new(),
        }
    }
}

/// Engine placement for one SSH host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EngineHostSpec {
    /// Just a count: `host: 4`
    Count(usize),
    /// Count plus host-specific engine arguments
    Detailed(EngineHost),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineHost {
    pub n: usize,
    #[serde(default)]
    pub args: Vec<String>,
}

impl EngineHostSpec {
    pub fn count(&self) -> usize {
        match self {
            EngineHostSpec::Count(n) => *n,
            EngineHostSpec::Detailed(host) => host.n,
        }
    }

    /// Arguments replacing the role args for this host, if any
    pub fn args(&self) -> Option<&[String]> {
        match self {
            EngineHostSpec::Count(_) => None,
            EngineHostSpec::Detailed(host) if host.args.is_empty() => None,
            EngineHostSpec::Detailed(host) => Some(&host.args),
        }
    }
}

/// A file copied between the local and remote profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileTransfer {
    pub local: PathBuf,
    pub remote: String,
}

/// Options for the SSH family
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SshOptions {
    /// Target host for controller and single-host engine sets (`[user@]host`)
    pub hostname: Option<String>,
    /// Login user when `hostname` does not carry one
    pub user: Option<String>,
    pub ssh_cmd: Vec<String>,
    pub ssh_args: Vec<String>,
    pub scp_cmd: Vec<String>,
    /// Profile directory on the remote side; defaults to the local path
    pub remote_profile_dir: Option<String>,
    /// Directory the remote command is started from
    pub remote_work_dir: Option<String>,
    /// Engines per host (`[user@]host: n`)
    pub engines: IndexMap<String, EngineHostSpec>,
    /// Files copied to the remote host before launch
    pub to_send: Vec<FileTransfer>,
    /// Remote files awaited and copied back after launch
    pub to_fetch: Vec<FileTransfer>,
    pub fetch_timeout_ms: u64,
    /// Intermediate host (kind `sshproxy` only)
    pub proxy_host: Option<String>,
    /// Command run on the proxy when no target hosts are configured
    pub ipcluster_cmd: Vec<String>,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            hostname: None,
            user: None,
            ssh_cmd: vec!["ssh".to_string()],
            ssh_args: Vec::new(),
            scp_cmd: vec!["scp".to_string()],
            remote_profile_dir: None,
            remote_work_dir: None,
            engines: IndexMap::new(),
            to_send: Vec::new(),
            to_fetch: Vec::new(),
            fetch_timeout_ms: 30_000,
            proxy_host: None,
            ipcluster_cmd: vec!["ipcluster".to_string()],
        }
    }
}

impl SshOptions {
    fn validate(&self, kind: &str) -> Result<(), ConfigError> {
        if self.ssh_cmd.is_empty() {
            return Err(ConfigError::Invalid(format!("{kind}: ssh_cmd must not be empty")));
        }
        for (host, spec) in &self.engines {
            if spec.count() == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{kind}: engine count for host '{host}' must be at least 1"
                )));
            }
        }
        Ok(())
    }
}

/// Per-role section of a cluster file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RoleSection {
    pub cmd: Option<Vec<String>>,
    pub args: Option<Vec<String>>,
    pub n: Option<usize>,
    pub grace_period_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub poll_retry_budget: Option<u32>,
    pub command_timeout_ms: Option<u64>,
    pub stop_signal: Option<Signal>,
    pub env: IndexMap<String, String>,
    pub backend: Backend,
}

/// A cluster file: shared settings plus one section per role
///
/// ```yaml
/// profile_dir: /home/u/.ipython/profile_default
/// cluster_id: ""
/// controller:
///   backend: { kind: local }
/// engines:
///   n: 4
///   backend:
///     kind: slurm
///     queue: debug
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterFile {
    #[serde(default)]
    pub profile_dir: Option<PathBuf>,
    #[serde(default)]
    pub cluster_id: String,
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    #[serde(default)]
    pub controller: RoleSection,
    #[serde(default)]
    pub engines: RoleSection,
}

impl ClusterFile {
    /// Load a cluster file from disk
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: Arc::new(e),
        })?;
        Self::from_yaml(&content)
    }

    /// Parse a cluster file from YAML
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let file: ClusterFile = serde_yaml::from_str(content)?;
        file.validate()?;
        Ok(file)
    }

    /// Validate both role sections
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.launcher_config(Role::Controller).validate()?;
        self.launcher_config(Role::Engines).validate()
    }

    fn section(&self, role: Role) -> &RoleSection {
        match role {
            Role::Controller => &self.controller,
            Role::Engines => &self.engines,
        }
    }

    /// Merge shared settings into the configuration for one role
    pub fn launcher_config(&self, role: Role) -> LauncherConfig {
        let section = self.section(role);
        let defaults = LauncherConfig::for_role(role);

        LauncherConfig {
            profile_dir: self.profile_dir.clone(),
            cluster_id: self.cluster_id.clone(),
            work_dir: self.work_dir.clone(),
            cmd: section.cmd.clone().unwrap_or(defaults.cmd),
            args: section.args.clone().unwrap_or(defaults.args),
            n: section.n.unwrap_or(defaults.n),
            grace_period_ms: section.grace_period_ms.unwrap_or(defaults.grace_period_ms),
            poll_interval_ms: section.poll_interval_ms.unwrap_or(defaults.poll_interval_ms),
            poll_retry_budget: section.poll_retry_budget.or(defaults.poll_retry_budget),
            command_timeout_ms: section
                .command_timeout_ms
                .unwrap_or(defaults.command_timeout_ms),
            stop_signal: section.stop_signal.unwrap_or(defaults.stop_signal),
            env: section.env.clone(),
            backend: section.backend.clone(),
        }
    }
}

/// Errors raised while loading or checking configuration
///
/// Cloneable; sources are shared behind `Arc`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[source] Arc<serde_yaml::Error>),

    #[error("Missing required option: {0}")]
    Missing(String),

    #[error("Invalid option: {0}")]
    Invalid(String),
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(e: serde_yaml::Error) -> Self {
        ConfigError::Parse(Arc::new(e))
    }
}
