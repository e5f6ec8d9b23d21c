//! Test helpers for launcher integration tests

#![allow(dead_code)]

use cluster_launch::{
    build_launcher, Backend, ExitNotice, Launcher, LauncherConfig, RecordingRunner, Role,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::timeout;

/// A profile directory plus a recording runner shared by every launcher
pub struct TestCluster {
    pub dir: TempDir,
    pub runner: Arc<RecordingRunner>,
}

impl TestCluster {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("create profile dir"),
            runner: Arc::new(RecordingRunner::new()),
        }
    }

    /// Profile directory as a string
    pub fn profile_dir(&self) -> String {
        self.dir.path().display().to_string()
    }

    /// Configuration with short poll and grace intervals
    pub fn config(&self, role: Role, backend: Backend) -> LauncherConfig {
        LauncherConfig::for_role(role)
            .with_profile_dir(self.dir.path())
            .with_backend(backend)
            .with_poll_interval_ms(10)
            .with_grace_period_ms(100)
    }

    pub fn launcher(&self, role: Role, backend: Backend) -> Arc<dyn Launcher> {
        self.build(role, self.config(role, backend))
    }

    pub fn build(&self, role: Role, config: LauncherConfig) -> Arc<dyn Launcher> {
        build_launcher(role, config, self.runner.clone()).expect("build launcher")
    }
}

/// Wait for the exit notice, failing the test after five seconds
pub async fn wait_notice(launcher: &Arc<dyn Launcher>) -> ExitNotice {
    timeout(Duration::from_secs(5), launcher.subscribe().wait())
        .await
        .expect("exit notice within timeout")
        .expect("exit notice published")
}
