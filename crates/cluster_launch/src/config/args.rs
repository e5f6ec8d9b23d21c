//! Common argument lists for controller and engine processes

use super::launcher_config::{ConfigError, LauncherConfig, Role};
use std::fmt;
use std::ops::Deref;

/// Quote a token for a POSIX shell.
///
/// Tokens made only of safe characters pass through unchanged; everything
/// else is wrapped in single quotes with embedded quotes escaped.
pub fn sh_escape(token: &str) -> String {
    let safe = !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:,@%+".contains(c));
    if safe {
        return token.to_string();
    }

    let mut out = String::from("'");
    out.push_str(&token.replace('\'', r"'\''"));
    out.push('\'');
    out
}

/// Ordered command line for a started process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArgumentList(Vec<String>);

impl ArgumentList {
    pub fn new(args: Vec<String>) -> Self {
        Self(args)
    }

    pub fn into_vec(self) -> Vec<String> {
        self.0
    }

    /// Program name (first token)
    pub fn program(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// Arguments after the program
    pub fn tail(&self) -> &[String] {
        self.0.get(1..).unwrap_or_default()
    }

    /// The token following `flag`, if present
    pub fn value_of(&self, flag: &str) -> Option<&str> {
        self.0
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.0.get(i + 1))
            .map(String::as_str)
    }

    /// Single shell command line with every token quoted as needed
    pub fn shell_join(&self) -> String {
        shell_join(&self.0)
    }
}

/// Join tokens into one shell-safe command line
pub fn shell_join<S: AsRef<str>>(tokens: &[S]) -> String {
    tokens
        .iter()
        .map(|t| sh_escape(t.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

impl Deref for ArgumentList {
    type Target = [String];

    fn deref(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for ArgumentList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(" "))
    }
}

/// Builds `[program...] --profile-dir P [--cluster-id C] [role args...]`.
///
/// `--cluster-id` is left out for backends that cannot tell clusters apart
/// on one host (the SSH family).
#[derive(Debug, Clone)]
pub struct ArgumentBuilder<'a> {
    config: &'a LauncherConfig,
    role: Role,
    include_cluster_id: bool,
    profile_dir_override: Option<String>,
    role_args_override: Option<&'a [String]>,
}

impl<'a> ArgumentBuilder<'a> {
    pub fn new(config: &'a LauncherConfig, role: Role) -> Self {
        Self {
            config,
            role,
            include_cluster_id: config.backend.supports_cluster_id(),
            profile_dir_override: None,
            role_args_override: None,
        }
    }

    /// Use a different `--profile-dir` value (the remote path for SSH)
    pub fn with_profile_dir(mut self, dir: impl Into<String>) -> Self {
        self.profile_dir_override = Some(dir.into());
        self
    }

    /// Replace the configured role arguments
    pub fn with_role_args(mut self, args: Option<&'a [String]>) -> Self {
        self.role_args_override = args;
        self
    }

    /// `--profile-dir P [--cluster-id C]`
    pub fn cluster_args(&self) -> Result<Vec<String>, ConfigError> {
        let profile_dir = match &self.profile_dir_override {
            Some(dir) => dir.clone(),
            None => self.config.require_profile_dir()?.display().to_string(),
        };

        let mut args = vec!["--profile-dir".to_string(), profile_dir];
        if self.include_cluster_id {
            args.push("--cluster-id".to_string());
            args.push(self.config.cluster_id.clone());
        }
        Ok(args)
    }

    /// The full program command line
    pub fn program_args(&self) -> Result<ArgumentList, ConfigError> {
        let role_args = self.role_args_override.unwrap_or(&self.config.args);

        let args: Vec<String> = self
            .config
            .cmd
            .iter()
            .cloned()
            .chain(self.cluster_args()?)
            .chain(role_args.iter().cloned())
            .collect();

        if args.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "{}: empty command line",
                self.role
            )));
        }

        for token in &args {
            if token.contains(['\0', '\n', '\r']) {
                return Err(ConfigError::Invalid(format!(
                    "{}: argument {:?} contains a control character",
                    self.role, token
                )));
            }
        }

        Ok(ArgumentList(args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Backend, SshOptions};

    fn config() -> LauncherConfig {
        LauncherConfig::for_role(Role::Engines)
            .with_profile_dir("/home/u/.ipython/profile_default")
            .with_cluster_id("abc")
            .with_args(["--debug"])
    }

    #[test]
    fn test_argument_order() {
        let config = config();
        let args = ArgumentBuilder::new(&config, Role::Engines)
            .program_args()
            .unwrap();

        assert_eq!(
            args.into_vec(),
            vec![
                "ipengine",
                "--profile-dir",
                "/home/u/.ipython/profile_default",
                "--cluster-id",
                "abc",
                "--debug"
            ]
        );
    }

    #[test]
    fn test_empty_cluster_id_still_passed() {
        let config = config().with_cluster_id("");
        let args = ArgumentBuilder::new(&config, Role::Engines)
            .program_args()
            .unwrap();

        assert_eq!(args.value_of("--cluster-id"), Some(""));
    }

    #[test]
    fn test_ssh_backend_omits_cluster_id() {
        let config = config().with_backend(Backend::Ssh(SshOptions::default()));
        let args = ArgumentBuilder::new(&config, Role::Engines)
            .with_profile_dir("/scratch/profile")
            .program_args()
            .unwrap();

        assert_eq!(args.value_of("--profile-dir"), Some("/scratch/profile"));
        assert_eq!(args.value_of("--cluster-id"), None);
    }

    #[test]
    fn test_missing_profile_dir() {
        let config = LauncherConfig::for_role(Role::Controller);
        let result = ArgumentBuilder::new(&config, Role::Controller).program_args();
        assert!(matches!(result, Err(ConfigError::Missing(_))));
    }

    #[test]
    fn test_newline_rejected() {
        let config = config().with_cluster_id("a\nb");
        let result = ArgumentBuilder::new(&config, Role::Engines).program_args();
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_sh_escape() {
        assert_eq!(sh_escape("plain"), "plain");
        assert_eq!(sh_escape("--log-level=20"), "--log-level=20");
        assert_eq!(sh_escape(""), "''");
        assert_eq!(sh_escape("with space"), "'with space'");
        assert_eq!(sh_escape("a'b"), "'a'\\''b'");
    }

    #[test]
    fn test_shell_join() {
        let args = ArgumentList::new(vec!["ipengine".into(), "--cluster-id".into(), "".into()]);
        assert_eq!(args.shell_join(), "ipengine --cluster-id ''");
    }
}
