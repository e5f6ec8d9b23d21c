//! cluster_launch CLI
//!
//! Usage:
//!   cluster_launch cluster.yaml
//!   cluster_launch cluster.yaml -n 16 --cluster-id run1
//!   cluster_launch cluster.yaml --only engines --dry-run

use cluster_launch::{
    build_launcher, ClusterFile, CommandRunner, ExitNotice, LaunchArgs, Launcher,
    RecordingRunner, Role, SystemRunner,
};
use futures::future::select_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

type Started = Vec<(Arc<dyn Launcher>, usize)>;

async fn wait_exit(launcher: Arc<dyn Launcher>) -> Option<ExitNotice> {
    launcher.subscribe().wait().await
}

/// Stop in reverse start order: engines before the controller
async fn stop_all(launchers: &Started) {
    for (launcher, _) in launchers.iter().rev() {
        if let Err(e) = launcher.stop().await {
            log::warn!("[{}] Stop failed: {}", launcher.name(), e);
        }
    }
}

/// Print one line per launcher; returns whether any failed
fn report(launchers: &Started, json: bool) -> bool {
    let mut failed = false;
    for (launcher, _) in launchers {
        let Some(notice) = launcher.subscribe().get() else {
            continue;
        };
        failed |= notice.is_failure();
        if json {
            println!("{}", notice.to_json());
        } else {
            println!("{}", notice);
        }
    }
    failed
}

#[tokio::main]
async fn main() {
    let args: LaunchArgs = argh::from_env();

    let env = env_logger::Env::default().default_filter_or(args.log_filter());
    env_logger::init_from_env(env);

    log::info!("Loading cluster file: {}", args.cluster_file);
    let cluster = match ClusterFile::from_file(&args.cluster_file) {
        Ok(file) => file,
        Err(e) => {
            log::error!("Failed to load cluster file: {}", e);
            std::process::exit(1);
        }
    };

    let recorder = args.dry_run.then(|| Arc::new(RecordingRunner::dry_run()));

    let mut launchers: Started = Vec::new();
    for role in args.roles() {
        let config = args.apply(cluster.launcher_config(role));
        let n = match role {
            Role::Controller => 1,
            Role::Engines => config.n,
        };
        let runner: Arc<dyn CommandRunner> = match &recorder {
            Some(recorder) => recorder.clone(),
            None => Arc::new(SystemRunner::new(Duration::from_millis(
                config.command_timeout_ms,
            ))),
        };

        match build_launcher(role, config, runner) {
            Ok(launcher) => launchers.push((launcher, n)),
            Err(e) => {
                log::error!("Failed to create {} launcher: {}", role, e);
                std::process::exit(1);
            }
        }
    }

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    if let Err(e) = ctrlc::set_handler(move || {
        log::info!("Received Ctrl+C, initiating shutdown...");
        shutdown_tx.send_replace(true);
    }) {
        log::error!("Failed to set Ctrl+C handler: {}", e);
        std::process::exit(1);
    }

    for (launcher, n) in &launchers {
        if let Err(e) = launcher.start(*n).await {
            log::error!("[{}] Start failed: {}", launcher.name(), e);
            stop_all(&launchers).await;
            report(&launchers, args.json);
            std::process::exit(1);
        }
        for handle in launcher.handles() {
            log::info!("[{}] Tracking {}", launcher.name(), handle);
        }
    }

    if let Some(recorder) = &recorder {
        recorder.assume_finished();
        stop_all(&launchers).await;
        for process in recorder.spawned() {
            println!("{} {}", process.executable, process.args.join(" "));
        }
        for line in recorder.command_lines() {
            println!("{}", line);
        }
        return;
    }

    let exits = select_all(
        launchers
            .iter()
            .map(|(launcher, _)| Box::pin(wait_exit(launcher.clone()))),
    );
    tokio::select! {
        _ = shutdown_rx.wait_for(|requested| *requested) => {}
        (notice, _, _) = exits => {
            if let Some(notice) = notice {
                log::info!("{}", notice);
            }
        }
    }

    stop_all(&launchers).await;
    let failed = report(&launchers, args.json);

    log::info!("cluster_launch exiting");
    if failed {
        std::process::exit(1);
    }
}
