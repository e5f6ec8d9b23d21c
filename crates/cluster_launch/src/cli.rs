//! Command-line interface for cluster_launch

use crate::config::{LauncherConfig, Role};
use argh::FromArgs;
use std::path::PathBuf;

/// Start a controller and an engine set from a cluster file
#[derive(FromArgs, Debug)]
pub struct LaunchArgs {
    /// path to the cluster file (default: cluster.yaml)
    #[argh(positional, default = "String::from(\"cluster.yaml\")")]
    pub cluster_file: String,

    /// number of engines (overrides the cluster file)
    #[argh(option, short = 'n')]
    pub n: Option<usize>,

    /// cluster id (overrides the cluster file)
    #[argh(option)]
    pub cluster_id: Option<String>,

    /// profile directory (overrides the cluster file)
    #[argh(option)]
    pub profile_dir: Option<PathBuf>,

    /// start only one role: controller or engines
    #[argh(option, from_str_fn(parse_role))]
    pub only: Option<Role>,

    /// print the commands that would run without running them
    #[argh(switch)]
    pub dry_run: bool,

    /// print exit notices as JSON lines
    #[argh(switch)]
    pub json: bool,

    /// log level (error, warn, info, debug, trace)
    #[argh(option, short = 'l', default = "String::from(\"info\")")]
    pub log_level: String,
}

/// Parse a role name
fn parse_role(s: &str) -> Result<Role, String> {
    match s.trim().to_lowercase().as_str() {
        "controller" => Ok(Role::Controller),
        "engines" | "engine" => Ok(Role::Engines),
        other => Err(format!(
            "Invalid role '{}'. Expected 'controller' or 'engines'",
            other
        )),
    }
}

impl LaunchArgs {
    /// Roles to start, in start order
    pub fn roles(&self) -> Vec<Role> {
        match self.only {
            Some(role) => vec![role],
            None => vec![Role::Controller, Role::Engines],
        }
    }

    /// Apply command-line overrides to a role's configuration
    pub fn apply(&self, mut config: LauncherConfig) -> LauncherConfig {
        if let Some(id) = &self.cluster_id {
            config.cluster_id = id.clone();
        }
        if let Some(dir) = &self.profile_dir {
            config.profile_dir = Some(dir.clone());
        }
        if let Some(n) = self.n {
            config.n = n;
        }
        config
    }

    /// Filter for env_logger; unknown levels fall back to `info`
    pub fn log_filter(&self) -> &'static str {
        match self.log_level.to_lowercase().as_str() {
            "error" => "error",
            "warn" => "warn",
            "debug" => "debug",
            "trace" => "trace",
            _ => "info",
        }
    }
}
