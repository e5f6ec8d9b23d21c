//! In-memory command runner for dry runs and tests
//!
//! Nothing is executed. Commands are recorded and answered from scripted
//! replies; spawned processes are simulated and exit when signalled (or
//! when a test says so).

use super::exec::{ChildProcess, CommandOutput, CommandRunner, CommandSpec, ProcessConfig, Signal};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

/// First pid handed out to simulated children
const FIRST_FAKE_PID: u32 = 1000;

#[derive(Debug, Clone)]
enum Reply {
    Output(CommandOutput),
    Error(io::ErrorKind, String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Matcher {
    /// Exact program name
    Program(String),
    /// Substring of the full command line
    Fragment(String),
}

impl Matcher {
    fn matches(&self, command: &CommandSpec, line: &str) -> bool {
        match self {
            Matcher::Program(program) => &command.program == program,
            Matcher::Fragment(fragment) => line.contains(fragment.as_str()),
        }
    }
}

#[derive(Debug)]
struct Rule {
    matcher: Matcher,
    /// Replies consumed in order; the last one repeats
    replies: VecDeque<Reply>,
}

struct RecorderState {
    commands: Vec<CommandSpec>,
    rules: Vec<Rule>,
    default_reply: CommandOutput,
    spawned: Vec<ProcessConfig>,
    children: HashMap<u32, Arc<FakeChildState>>,
    failing_spawns: HashSet<String>,
    spawn_limit: Option<usize>,
    stubborn: bool,
    next_pid: u32,
}

/// A [`CommandRunner`] that records instead of executing
pub struct RecordingRunner {
    state: Mutex<RecorderState>,
    echo: bool,
}

impl Default for RecordingRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingRunner {
    /// Runner whose unscripted commands succeed with empty output
    pub fn new() -> Self {
        Self::with_default_reply(CommandOutput::ok(""))
    }

    /// Runner used by `--dry-run`: logs every command and answers with a
    /// plausible job id / pid so launchers get through their start path
    pub fn dry_run() -> Self {
        let mut runner = Self::with_default_reply(CommandOutput::ok(FIRST_FAKE_PID.to_string()));
        runner.echo = true;
        runner
    }

    /// Answer every later status query as if the job or remote process had
    /// exited, so a dry run can stop without waiting out the grace period
    pub fn assume_finished(&self) {
        let gone = [
            ("kill -0", CommandOutput::failed(1, "")),
            ("qstat -f", CommandOutput::failed(153, "qstat: Unknown Job Id")),
            ("qstat -j", CommandOutput::failed(1, "Following jobs do not exist")),
            ("bjobs", CommandOutput::failed(255, "Job is not found")),
            ("squeue", CommandOutput::ok("")),
            ("condor_q", CommandOutput::ok("")),
            ("job view", CommandOutput::ok("State : Finished")),
        ];

        let mut state = self.lock();
        for (fragment, output) in gone {
            let matcher = Matcher::Fragment(fragment.to_string());
            state.rules.retain(|rule| rule.matcher != matcher);
            state.rules.push(Rule {
                matcher,
                replies: VecDeque::from([Reply::Output(output)]),
            });
        }
    }

    pub fn with_default_reply(reply: CommandOutput) -> Self {
        Self {
            state: Mutex::new(RecorderState {
                commands: Vec::new(),
                rules: Vec::new(),
                default_reply: reply,
                spawned: Vec::new(),
                children: HashMap::new(),
                failing_spawns: HashSet::new(),
                spawn_limit: None,
                stubborn: false,
                next_pid: FIRST_FAKE_PID,
            }),
            echo: false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RecorderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push_rule(&self, matcher: Matcher, reply: Reply) {
        let mut state = self.lock();
        match state.rules.iter_mut().find(|r| r.matcher == matcher) {
            Some(rule) => rule.replies.push_back(reply),
            None => state.rules.push(Rule {
                matcher,
                replies: VecDeque::from([reply]),
            }),
        }
    }

    /// Queue a reply for every command running `program`
    pub fn reply(&self, program: &str, output: CommandOutput) {
        self.push_rule(Matcher::Program(program.to_string()), Reply::Output(output));
    }

    /// Queue a reply for commands whose command line contains `fragment`.
    ///
    /// Fragment rules are consulted before program rules.
    pub fn reply_matching(&self, fragment: &str, output: CommandOutput) {
        self.push_rule(Matcher::Fragment(fragment.to_string()), Reply::Output(output));
    }

    /// Make commands running `program` fail to execute at all
    pub fn reply_error(&self, program: &str, kind: io::ErrorKind, message: &str) {
        self.push_rule(
            Matcher::Program(program.to_string()),
            Reply::Error(kind, message.to_string()),
        );
    }

    /// Make spawns of `executable` fail with `NotFound`
    pub fn fail_spawn(&self, executable: &str) {
        self.lock().failing_spawns.insert(executable.to_string());
    }

    /// Let `count` spawns succeed, then fail every further one
    pub fn fail_spawns_after(&self, count: usize) {
        self.lock().spawn_limit = Some(count);
    }

    /// Simulated children ignore every signal but `Kill`
    pub fn stubborn_children(&self, stubborn: bool) {
        self.lock().stubborn = stubborn;
    }

    /// Every command run so far
    pub fn commands(&self) -> Vec<CommandSpec> {
        self.lock().commands.clone()
    }

    /// Every command run so far, rendered as a single line
    pub fn command_lines(&self) -> Vec<String> {
        self.lock().commands.iter().map(ToString::to_string).collect()
    }

    /// Every process spawned so far
    pub fn spawned(&self) -> Vec<ProcessConfig> {
        self.lock().spawned.clone()
    }

    /// Pids of simulated children that have not exited
    pub fn live_children(&self) -> Vec<u32> {
        let state = self.lock();
        let mut pids: Vec<u32> = state
            .children
            .iter()
            .filter(|(_, child)| child.exit_tx.borrow().is_none())
            .map(|(pid, _)| *pid)
            .collect();
        pids.sort_unstable();
        pids
    }

    /// Signals delivered to a simulated child
    pub fn signals_for(&self, pid: u32) -> Vec<Signal> {
        self.lock()
            .children
            .get(&pid)
            .map(|child| child.signals.lock().unwrap_or_else(PoisonError::into_inner).clone())
            .unwrap_or_default()
    }

    /// Make a simulated child exit with the given code
    pub fn exit_child(&self, pid: u32, code: Option<i32>) {
        if let Some(child) = self.lock().children.get(&pid) {
            child.exit(code);
        }
    }

    fn next_reply(state: &mut RecorderState, command: &CommandSpec) -> Reply {
        let line = command.to_string();
        let position = state
            .rules
            .iter()
            .position(|r| matches!(r.matcher, Matcher::Fragment(_)) && r.matcher.matches(command, &line))
            .or_else(|| state.rules.iter().position(|r| r.matcher.matches(command, &line)));

        let Some(rule) = position.and_then(|i| state.rules.get_mut(i)) else {
            return Reply::Output(state.default_reply.clone());
        };

        if rule.replies.len() > 1 {
            rule.replies.pop_front().unwrap_or_else(|| Reply::Output(CommandOutput::ok("")))
        } else {
            rule.replies
                .front()
                .cloned()
                .unwrap_or_else(|| Reply::Output(CommandOutput::ok("")))
        }
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, command: &CommandSpec) -> io::Result<CommandOutput> {
        if self.echo {
            log::info!("[dry-run] {}", command);
        }

        let reply = {
            let mut state = self.lock();
            state.commands.push(command.clone());
            Self::next_reply(&mut state, command)
        };

        match reply {
            Reply::Output(output) => Ok(output),
            Reply::Error(kind, message) => Err(io::Error::new(kind, message)),
        }
    }

    async fn spawn(&self, config: &ProcessConfig) -> io::Result<Box<dyn ChildProcess>> {
        if self.echo {
            log::info!(
                "[dry-run] spawn {} {}",
                config.executable,
                config.args.join(" ")
            );
        }

        let mut state = self.lock();
        state.spawned.push(config.clone());

        let over_limit = state
            .spawn_limit
            .is_some_and(|limit| state.children.len() >= limit);
        if over_limit || state.failing_spawns.contains(&config.executable) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{}: command not found", config.executable),
            ));
        }

        let pid = state.next_pid;
        state.next_pid += 1;

        let (exit_tx, exit_rx) = watch::channel(None);
        let child = Arc::new(FakeChildState {
            exit_tx,
            signals: Mutex::new(Vec::new()),
            stubborn: state.stubborn,
        });
        state.children.insert(pid, child.clone());

        Ok(Box::new(FakeChild {
            pid,
            state: child,
            exit_rx,
        }))
    }
}

struct FakeChildState {
    exit_tx: watch::Sender<Option<Option<i32>>>,
    signals: Mutex<Vec<Signal>>,
    stubborn: bool,
}

impl FakeChildState {
    fn exit(&self, code: Option<i32>) {
        self.exit_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(code);
            true
        });
    }
}

struct FakeChild {
    pid: u32,
    state: Arc<FakeChildState>,
    exit_rx: watch::Receiver<Option<Option<i32>>>,
}

#[async_trait]
impl ChildProcess for FakeChild {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn signal(&self, signal: Signal) -> io::Result<()> {
        self.state
            .signals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(signal);

        if signal == Signal::Kill || !self.state.stubborn {
            self.state.exit(None);
        }
        Ok(())
    }

    fn exit_code(&self) -> Option<Option<i32>> {
        *self.exit_rx.borrow()
    }

    async fn wait(&self) -> Option<i32> {
        let mut rx = self.exit_rx.clone();
        let code = match rx.wait_for(|code| code.is_some()).await {
            Ok(code) => code.flatten(),
            Err(_) => None,
        };
        code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replies_in_order_last_repeats() {
        let runner = RecordingRunner::new();
        runner.reply("qstat", CommandOutput::ok("job_state = R"));
        runner.reply("qstat", CommandOutput::ok("job_state = C"));

        let spec = CommandSpec::from_argv(["qstat", "-f", "1"]);
        assert_eq!(runner.run(&spec).await.unwrap().stdout, "job_state = R");
        assert_eq!(runner.run(&spec).await.unwrap().stdout, "job_state = C");
        assert_eq!(runner.run(&spec).await.unwrap().stdout, "job_state = C");
        assert_eq!(runner.commands().len(), 3);
    }

    #[tokio::test]
    async fn test_fragment_rules_take_precedence() {
        let runner = RecordingRunner::new();
        runner.reply("ssh", CommandOutput::ok("4242"));
        runner.reply_matching("kill -0", CommandOutput::failed(1, ""));

        let launch = CommandSpec::from_argv(["ssh", "node1", "--", "nohup ipengine & echo $!"]);
        let poll = CommandSpec::from_argv(["ssh", "node1", "--", "kill -0 4242"]);

        assert_eq!(runner.run(&launch).await.unwrap().stdout, "4242");
        assert_eq!(runner.run(&poll).await.unwrap().code, Some(1));
    }

    #[tokio::test]
    async fn test_reply_error() {
        let runner = RecordingRunner::new();
        runner.reply_error("sbatch", io::ErrorKind::NotFound, "sbatch: not found");

        let result = runner.run(&CommandSpec::from_argv(["sbatch", "x"])).await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_children_exit_on_signal() {
        let runner = RecordingRunner::new();
        let child = runner
            .spawn(&ProcessConfig {
                name: "engine".into(),
                executable: "ipengine".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let pid = child.pid().unwrap();
        assert_eq!(runner.live_children(), vec![pid]);

        child.signal(Signal::Interrupt).unwrap();
        assert_eq!(child.wait().await, None);
        assert!(runner.live_children().is_empty());
        assert_eq!(runner.signals_for(pid), vec![Signal::Interrupt]);
    }
}
