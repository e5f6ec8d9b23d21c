//! Cluster Launch
//!
//! Starts, monitors and stops the two halves of a parallel computing
//! cluster, a single controller and a set of engines, on one of several
//! backends.
//!
//! # Overview
//!
//! - Local child processes, or one `mpiexec` front-end
//! - Batch schedulers: PBS, SGE, LSF, SLURM, HTCondor, Windows HPC
//! - Remote hosts over SSH, optionally through a proxy host
//!
//! Every backend implements [`Launcher`]: `start(n)`, `stop()`,
//! `signal()`, `args()` and an exit watcher that fires exactly once.
//! External commands go through a [`CommandRunner`], so everything can be
//! exercised against a [`RecordingRunner`] without touching a cluster.
//!
//! # Example Cluster File
//!
//! ```yaml
//! profile_dir: /home/me/.ipython/profile_default
//! cluster_id: run1
//!
//! controller:
//!   backend:
//!     kind: local
//!
//! engines:
//!   n: 16
//!   backend:
//!     kind: slurm
//!     queue: debug
//!     walltime: "01:00:00"
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod launcher;
pub mod runtime;

pub use cli::LaunchArgs;
pub use config::{
    ArgumentBuilder, ArgumentList, Backend, ClusterFile, ConfigError, LauncherConfig, Role,
    TemplateContext, TemplateError,
};
pub use error::{LaunchError, Result};
pub use launcher::{
    build_launcher, BatchLauncher, ExitNotice, ExitWatcher, JobHandle, Launcher, LauncherState,
    ProcessLauncher, SshLauncher,
};
pub use runtime::{
    CommandOutput, CommandRunner, CommandSpec, ManagedProcess, ProcessConfig, ProcessError,
    ProcessStatus, RecordingRunner, Signal, SystemRunner,
};
