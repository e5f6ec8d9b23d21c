//! Lifecycle state shared by every launcher backend

use crate::config::{LauncherConfig, Role};
use crate::error::{LaunchError, Result};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Launcher lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LauncherState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl LauncherState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LauncherState::Idle => "idle",
            LauncherState::Starting => "starting",
            LauncherState::Running => "running",
            LauncherState::Stopping => "stopping",
            LauncherState::Stopped => "stopped",
            LauncherState::Failed => "failed",
        }
    }
}

impl fmt::Display for LauncherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivered once when a launcher reaches `Stopped` or `Failed`
#[derive(Debug, Clone)]
pub struct ExitNotice {
    /// Name of the launcher that exited
    pub launcher: String,
    /// Final state
    pub state: LauncherState,
    /// Exit codes of tracked processes, where known
    pub exit_codes: Vec<Option<i32>>,
    /// The error that caused a failure, if any
    pub error: Option<Arc<LaunchError>>,
    /// Whether the exit followed a `stop()` request
    pub requested: bool,
}

impl ExitNotice {
    pub fn is_failure(&self) -> bool {
        self.state == LauncherState::Failed
    }

    /// JSON form used by the CLI
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "launcher": self.launcher,
            "state": self.state,
            "exit_codes": self.exit_codes,
            "error": self.error.as_ref().map(|e| e.to_string()),
            "requested": self.requested,
        })
    }
}

impl fmt::Display for ExitNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.launcher, self.state)?;
        if !self.exit_codes.is_empty() {
            write!(f, " (exit codes: {:?})", self.exit_codes)?;
        }
        if let Some(error) = &self.error {
            write!(f, ": {}", error)?;
        }
        Ok(())
    }
}

/// Receives a launcher's exit notice
#[derive(Clone)]
pub struct ExitWatcher {
    rx: watch::Receiver<Option<ExitNotice>>,
}

impl ExitWatcher {
    /// The notice, if the launcher has already exited
    pub fn get(&self) -> Option<ExitNotice> {
        self.rx.borrow().clone()
    }

    /// Wait for the notice. Returns `None` only if the launcher was dropped
    /// without ever exiting.
    pub async fn wait(&mut self) -> Option<ExitNotice> {
        let result = self
            .rx
            .wait_for(Option::is_some)
            .await
            .map(|notice| (*notice).clone());
        match result {
            Ok(notice) => notice,
            Err(_) => self.rx.borrow().clone(),
        }
    }
}

/// State machine, configuration and exit channel of one launcher
pub struct LauncherCore {
    name: String,
    role: Role,
    config: Mutex<LauncherConfig>,
    state_tx: watch::Sender<LauncherState>,
    exit_tx: watch::Sender<Option<ExitNotice>>,
    /// Opens once `start` has returned; monitors wait on it before publishing
    started_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LauncherCore {
    pub fn new(name: impl Into<String>, role: Role, config: LauncherConfig) -> Self {
        Self {
            name: name.into(),
            role,
            config: Mutex::new(config),
            state_tx: watch::channel(LauncherState::Idle).0,
            exit_tx: watch::channel(None).0,
            started_tx: watch::channel(false).0,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> LauncherState {
        *self.state_tx.borrow()
    }

    /// Follow state changes
    pub fn watch_state(&self) -> watch::Receiver<LauncherState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe(&self) -> ExitWatcher {
        ExitWatcher {
            rx: self.exit_tx.subscribe(),
        }
    }

    /// Snapshot of the current configuration
    pub fn config(&self) -> LauncherConfig {
        lock(&self.config).clone()
    }

    pub fn cluster_id(&self) -> String {
        lock(&self.config).cluster_id.clone()
    }

    /// Change the cluster id; only allowed while `Idle`
    pub fn set_cluster_id(&self, id: &str) -> Result<()> {
        let mut config = lock(&self.config);
        self.require_state("set cluster id", &[LauncherState::Idle])?;
        config.cluster_id = id.to_string();
        log::debug!("[{}] cluster id set to '{}'", self.name, id);
        Ok(())
    }

    /// Fail with `InvalidState` unless the state is one of `allowed`
    pub fn require_state(&self, operation: &'static str, allowed: &[LauncherState]) -> Result<()> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(LaunchError::InvalidState { operation, state })
        }
    }

    /// Atomically move `from` -> `to`; returns the observed state on mismatch
    fn transition(&self, from: &[LauncherState], to: LauncherState) -> std::result::Result<(), LauncherState> {
        let mut observed = to;
        let changed = self.state_tx.send_if_modified(|state| {
            if from.contains(state) {
                observed = *state;
                *state = to;
                true
            } else {
                observed = *state;
                false
            }
        });

        if changed {
            log::debug!("[{}] {} -> {}", self.name, observed, to);
            Ok(())
        } else {
            Err(observed)
        }
    }

    /// `Idle -> Starting`, returning the configuration to start with
    pub fn begin_start(&self) -> Result<LauncherConfig> {
        let config = lock(&self.config);
        self.transition(&[LauncherState::Idle], LauncherState::Starting)
            .map_err(|state| LaunchError::InvalidState {
                operation: "start",
                state,
            })?;
        Ok(config.clone())
    }

    /// Complete a start attempt: `Running` on success, `Failed` plus an exit
    /// notice on error. The error is handed back to the caller either way.
    ///
    /// The start gate opens before any notice is published.
    pub fn finish_start(&self, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => {
                if let Err(state) = self.transition(&[LauncherState::Starting], LauncherState::Running) {
                    log::warn!("[{}] start finished while {}", self.name, state);
                }
                self.started_tx.send_replace(true);
                Ok(())
            }
            Err(e) => {
                log::error!("[{}] Start failed: {}", self.name, e);
                self.abort_tasks();
                let _ = self.transition(&[LauncherState::Starting], LauncherState::Failed);
                self.started_tx.send_replace(true);
                self.publish(LauncherState::Failed, Vec::new(), Some(e.clone()), false);
                Err(e)
            }
        }
    }

    /// `Running -> Stopping`.
    ///
    /// Returns `false` when there is nothing to stop and fails while
    /// `Starting`.
    pub fn begin_stop(&self) -> Result<bool> {
        match self.transition(&[LauncherState::Running], LauncherState::Stopping) {
            Ok(()) => {
                self.abort_tasks();
                Ok(true)
            }
            Err(LauncherState::Starting) => Err(LaunchError::InvalidState {
                operation: "stop",
                state: LauncherState::Starting,
            }),
            Err(state) => {
                log::debug!("[{}] stop ignored while {}", self.name, state);
                Ok(false)
            }
        }
    }

    /// `Stopping -> Stopped` and the requested exit notice
    pub fn finish_stop(&self, exit_codes: Vec<Option<i32>>) {
        if self
            .transition(&[LauncherState::Stopping], LauncherState::Stopped)
            .is_ok()
        {
            log::info!("[{}] Stopped", self.name);
            self.publish(LauncherState::Stopped, exit_codes, None, true);
        }
    }

    /// Record an exit noticed by a monitor task.
    ///
    /// Waits until `start` has returned, then moves `Running` to `state`.
    /// Returns `false` if the launcher had already left `Running` (a stop
    /// in progress owns the exit).
    pub async fn mark_exited(
        &self,
        state: LauncherState,
        exit_codes: Vec<Option<i32>>,
        error: Option<LaunchError>,
    ) -> bool {
        self.mark_exited_with(state, exit_codes, error, || {}).await
    }

    /// Like [`mark_exited`](Self::mark_exited), running `release` after the
    /// transition and before the notice goes out
    pub async fn mark_exited_with(
        &self,
        state: LauncherState,
        exit_codes: Vec<Option<i32>>,
        error: Option<LaunchError>,
        release: impl FnOnce() + Send,
    ) -> bool {
        self.wait_started().await;

        if self.transition(&[LauncherState::Running], state).is_err() {
            return false;
        }
        release();

        match &error {
            Some(e) => log::error!("[{}] Exited: {}", self.name, e),
            None if state == LauncherState::Failed => {
                log::error!("[{}] Exited with codes {:?}", self.name, exit_codes)
            }
            None => log::info!("[{}] Exited", self.name),
        }
        self.publish(state, exit_codes, error, false);
        true
    }

    /// Resolves once `start` has returned
    pub async fn wait_started(&self) {
        let mut rx = self.started_tx.subscribe();
        let _ = rx.wait_for(|started| *started).await;
    }

    fn publish(
        &self,
        state: LauncherState,
        exit_codes: Vec<Option<i32>>,
        error: Option<LaunchError>,
        requested: bool,
    ) {
        let notice = ExitNotice {
            launcher: self.name.clone(),
            state,
            exit_codes,
            error: error.map(Arc::new),
            requested,
        };
        self.exit_tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(notice);
            true
        });
    }

    /// Keep a monitor task so it can be aborted when the launcher stops
    pub fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = lock(&self.tasks);
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    fn abort_tasks(&self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

impl Drop for LauncherCore {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core() -> Arc<LauncherCore> {
        Arc::new(LauncherCore::new(
            "engines",
            Role::Engines,
            LauncherConfig::for_role(Role::Engines),
        ))
    }

    #[test]
    fn test_start_only_from_idle() {
        let core = core();
        core.begin_start().unwrap();
        let err = core.begin_start().unwrap_err();
        assert!(matches!(
            err,
            LaunchError::InvalidState { operation: "start", state: LauncherState::Starting }
        ));
    }

    #[test]
    fn test_stop_while_starting_rejected() {
        let core = core();
        core.begin_start().unwrap();
        assert!(core.begin_stop().is_err());
    }

    #[test]
    fn test_stop_before_start_is_noop() {
        let core = core();
        assert!(!core.begin_stop().unwrap());
        assert_eq!(core.state(), LauncherState::Idle);
        assert!(core.subscribe().get().is_none());
    }

    #[test]
    fn test_failed_start_publishes_notice() {
        let core = core();
        core.begin_start().unwrap();
        let result = core.finish_start(Err(LaunchError::Submission("qsub: bad queue".into())));

        assert!(result.is_err());
        assert_eq!(core.state(), LauncherState::Failed);
        let notice = core.subscribe().get().unwrap();
        assert_eq!(notice.state, LauncherState::Failed);
        assert!(!notice.requested);
        assert!(notice.error.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_start_notice_sees_open_gate() {
        for _ in 0..50 {
            let core = core();
            core.begin_start().unwrap();

            let observer = {
                let core = core.clone();
                let mut exit_rx = core.exit_tx.subscribe();
                let started_rx = core.started_tx.subscribe();
                tokio::spawn(async move {
                    let _ = exit_rx.wait_for(Option::is_some).await;
                    *started_rx.borrow()
                })
            };

            tokio::task::yield_now().await;
            let _ = core.finish_start(Err(LaunchError::Submission("qsub: bad queue".into())));
            assert!(observer.await.unwrap());
        }
    }

    #[test]
    fn test_cluster_id_locked_after_start() {
        let core = core();
        core.set_cluster_id("abc").unwrap();
        core.begin_start().unwrap();
        assert!(core.set_cluster_id("def").is_err());
        assert_eq!(core.cluster_id(), "abc");
    }

    #[tokio::test]
    async fn test_exit_waits_for_start_to_return() {
        let core = core();
        core.begin_start().unwrap();

        let monitor = {
            let core = core.clone();
            tokio::spawn(async move {
                core.mark_exited(LauncherState::Stopped, vec![Some(0)], None)
                    .await
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(core.subscribe().get().is_none());

        core.finish_start(Ok(())).unwrap();
        assert!(monitor.await.unwrap());

        let notice = core.subscribe().wait().await.unwrap();
        assert_eq!(notice.state, LauncherState::Stopped);
        assert_eq!(notice.exit_codes, vec![Some(0)]);
    }

    #[tokio::test]
    async fn test_notice_delivered_once() {
        let core = core();
        core.begin_start().unwrap();
        core.finish_start(Ok(())).unwrap();

        assert!(core.mark_exited(LauncherState::Failed, vec![Some(1)], None).await);
        assert!(!core.mark_exited(LauncherState::Stopped, vec![], None).await);
        assert!(!core.begin_stop().unwrap());

        let notice = core.subscribe().get().unwrap();
        assert_eq!(notice.state, LauncherState::Failed);
    }
}
