//! Per-scheduler commands, output parsers and script templates

use crate::config::{Backend, BatchOptions, Role};
use crate::runtime::CommandOutput;
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

static FIRST_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+").expect("job id pattern is valid"));

static CONDOR_CLUSTER_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\.?$").expect("condor job id pattern is valid"));

static PBS_JOB_STATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"job_state\s*=\s*(\w)").expect("qstat pattern is valid"));

static WINHPC_STATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*State\s*:\s*(\w+)").expect("job view pattern is valid"));

/// Scheduler messages meaning the job no longer exists
static JOB_GONE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)unknown job|invalid job id|do(es)? not exist|not found|no matching job|already finished|has finished|couldn't find",
    )
    .expect("job gone pattern is valid")
});

/// Scheduler state of a submitted job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    /// Queued or running
    Active,
    /// Completed, cancelled or no longer known to the scheduler
    Finished,
    /// The scheduler reports a failure
    Failed(String),
    /// Output could not be interpreted
    Unknown,
}

/// A directive a template gets when the matching option is set
struct Directive {
    /// Option names in the template context
    option: &'static str,
    /// Tokens that mark the directive as already present
    keys: &'static [&'static str],
    /// Line inserted when missing
    line: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheduler {
    Pbs,
    Sge,
    Lsf,
    Slurm,
    HtCondor,
    WindowsHpc,
}

impl Scheduler {
    pub fn from_backend(backend: &Backend) -> Option<Self> {
        match backend {
            Backend::Pbs(_) => Some(Scheduler::Pbs),
            Backend::Sge(_) => Some(Scheduler::Sge),
            Backend::Lsf(_) => Some(Scheduler::Lsf),
            Backend::Slurm(_) => Some(Scheduler::Slurm),
            Backend::HtCondor(_) => Some(Scheduler::HtCondor),
            Backend::WindowsHpc(_) => Some(Scheduler::WindowsHpc),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Scheduler::Pbs => "pbs",
            Scheduler::Sge => "sge",
            Scheduler::Lsf => "lsf",
            Scheduler::Slurm => "slurm",
            Scheduler::HtCondor => "htcondor",
            Scheduler::WindowsHpc => "winhpc",
        }
    }

    /// Artifact file extension
    pub fn extension(&self) -> &'static str {
        match self {
            Scheduler::Pbs => "pbs",
            Scheduler::Sge => "sge",
            Scheduler::Lsf => "lsf",
            Scheduler::Slurm => "slurm",
            Scheduler::HtCondor => "condor",
            Scheduler::WindowsHpc => "xml",
        }
    }

    /// LSF reads the script from stdin instead of a path argument
    pub fn submits_on_stdin(&self) -> bool {
        matches!(self, Scheduler::Lsf)
    }

    pub fn default_submit_command(&self) -> Vec<String> {
        let cmd: &[&str] = match self {
            Scheduler::Pbs | Scheduler::Sge => &["qsub"],
            Scheduler::Lsf => &["bsub"],
            Scheduler::Slurm => &["sbatch"],
            Scheduler::HtCondor => &["condor_submit"],
            Scheduler::WindowsHpc => &["job", "submit"],
        };
        argv(cmd)
    }

    pub fn default_delete_command(&self) -> Vec<String> {
        let cmd: &[&str] = match self {
            Scheduler::Pbs | Scheduler::Sge => &["qdel"],
            Scheduler::Lsf => &["bkill"],
            Scheduler::Slurm => &["scancel"],
            Scheduler::HtCondor => &["condor_rm"],
            Scheduler::WindowsHpc => &["job", "cancel"],
        };
        argv(cmd)
    }

    /// Forced cancel; Windows HPC has none
    pub fn default_kill_command(&self) -> Option<Vec<String>> {
        let cmd: &[&str] = match self {
            Scheduler::Pbs => &["qdel", "-W", "force"],
            Scheduler::Sge => &["qdel", "-f"],
            Scheduler::Lsf => &["bkill", "-s", "KILL"],
            Scheduler::Slurm => &["scancel", "-s", "KILL"],
            Scheduler::HtCondor => &["condor_rm", "-forcex"],
            Scheduler::WindowsHpc => return None,
        };
        Some(argv(cmd))
    }

    pub fn default_status_command(&self) -> Vec<String> {
        let cmd: &[&str] = match self {
            Scheduler::Pbs => &["qstat", "-f"],
            Scheduler::Sge => &["qstat", "-j"],
            Scheduler::Lsf => &["bjobs", "-noheader", "-o", "stat"],
            Scheduler::Slurm => &["squeue", "-h", "-o", "%T", "-j"],
            Scheduler::HtCondor => &["condor_q", "-af", "JobStatus"],
            Scheduler::WindowsHpc => &["job", "view"],
        };
        argv(cmd)
    }

    /// Extract the job id from submit output.
    ///
    /// A custom pattern returns its first group, or the whole match when it
    /// has no groups.
    pub fn parse_job_id(&self, output: &str, custom: Option<&Regex>) -> Option<String> {
        if let Some(pattern) = custom {
            return pattern
                .captures(output)
                .and_then(|caps| caps.get(1).or_else(|| caps.get(0)))
                .map(|m| m.as_str().to_string());
        }

        match self {
            Scheduler::HtCondor => {
                let last = output.lines().rev().find(|l| !l.trim().is_empty())?;
                CONDOR_CLUSTER_ID
                    .captures(last.trim())
                    .and_then(|caps| caps.get(1))
                    .map(|m| m.as_str().to_string())
            }
            _ => FIRST_NUMBER.find(output).map(|m| m.as_str().to_string()),
        }
    }

    /// Interpret the status command's output
    pub fn parse_status(&self, output: &CommandOutput) -> JobStatus {
        let combined = output.combined();
        let stdout = output.stdout.trim();

        match self {
            Scheduler::Pbs => {
                if let Some(caps) = PBS_JOB_STATE.captures(&combined) {
                    return match &caps[1] {
                        "C" | "F" => JobStatus::Finished,
                        _ => JobStatus::Active,
                    };
                }
                if combined.contains("Unknown Job Id") || combined.contains("Job has finished") {
                    return JobStatus::Finished;
                }
                JobStatus::Unknown
            }
            Scheduler::Sge => {
                if combined.contains("do not exist") {
                    JobStatus::Finished
                } else if combined.contains("error reason") {
                    JobStatus::Failed(first_line_with(&combined, "error reason"))
                } else if output.success() {
                    JobStatus::Active
                } else {
                    JobStatus::Unknown
                }
            }
            Scheduler::Lsf => {
                if stdout.is_empty() && combined.contains("not found") {
                    return JobStatus::Finished;
                }
                aggregate(task_lines(stdout).map(|line| {
                    let state = line.split_whitespace().next().unwrap_or_default();
                    match state {
                        "DONE" => JobStatus::Finished,
                        "EXIT" => JobStatus::Failed("EXIT".to_string()),
                        "PEND" | "RUN" | "PSUSP" | "USUSP" | "SSUSP" | "WAIT" | "PROV" => {
                            JobStatus::Active
                        }
                        _ => JobStatus::Unknown,
                    }
                }))
            }
            Scheduler::Slurm => {
                if combined.contains("Invalid job id") {
                    return JobStatus::Finished;
                }
                if output.success() && stdout.is_empty() {
                    return JobStatus::Finished;
                }
                aggregate(task_lines(stdout).map(|line| {
                    // squeue may print `CANCELLED by 123` or `CANCELLED+`
                    let state = line
                        .split(|c: char| c.is_whitespace() || c == '+')
                        .next()
                        .unwrap_or_default();
                    match state {
                        "COMPLETED" | "CANCELLED" => JobStatus::Finished,
                        "FAILED" | "TIMEOUT" | "NODE_FAIL" | "OUT_OF_MEMORY" | "BOOT_FAIL"
                        | "DEADLINE" | "PREEMPTED" => JobStatus::Failed(state.to_string()),
                        "PENDING" | "RUNNING" | "CONFIGURING" | "COMPLETING" | "SUSPENDED"
                        | "REQUEUED" | "RESIZING" | "STAGE_OUT" => JobStatus::Active,
                        _ => JobStatus::Unknown,
                    }
                }))
            }
            Scheduler::HtCondor => {
                if output.success() && stdout.is_empty() {
                    return JobStatus::Finished;
                }
                aggregate(task_lines(stdout).map(|line| match line {
                    "1" | "2" | "5" | "6" | "7" => JobStatus::Active,
                    "3" | "4" => JobStatus::Finished,
                    _ => JobStatus::Unknown,
                }))
            }
            Scheduler::WindowsHpc => {
                let Some(caps) = WINHPC_STATE.captures(&combined) else {
                    return JobStatus::Unknown;
                };
                match &caps[1] {
                    "Finished" | "Canceled" => JobStatus::Finished,
                    "Failed" => JobStatus::Failed("Failed".to_string()),
                    "Configuring" | "Submitted" | "Validating" | "ExternalValidation"
                    | "Queued" | "Running" | "Canceling" | "Finishing" => JobStatus::Active,
                    _ => JobStatus::Unknown,
                }
            }
        }
    }

    /// Whether cancel output says the job was already gone
    pub fn job_already_gone(&self, output: &CommandOutput) -> bool {
        JOB_GONE.is_match(&output.combined())
    }

    /// Built-in script for a role
    pub fn default_template(&self, role: Role) -> &'static str {
        match (self, role) {
            (Scheduler::Pbs, Role::Controller) => PBS_CONTROLLER_TEMPLATE,
            (Scheduler::Pbs, Role::Engines) => PBS_ENGINE_TEMPLATE,
            (Scheduler::Sge, Role::Controller) => SGE_CONTROLLER_TEMPLATE,
            (Scheduler::Sge, Role::Engines) => SGE_ENGINE_TEMPLATE,
            (Scheduler::Lsf, Role::Controller) => LSF_CONTROLLER_TEMPLATE,
            (Scheduler::Lsf, Role::Engines) => LSF_ENGINE_TEMPLATE,
            (Scheduler::Slurm, Role::Controller) => SLURM_CONTROLLER_TEMPLATE,
            (Scheduler::Slurm, Role::Engines) => SLURM_ENGINE_TEMPLATE,
            (Scheduler::HtCondor, Role::Controller) => CONDOR_CONTROLLER_TEMPLATE,
            (Scheduler::HtCondor, Role::Engines) => CONDOR_ENGINE_TEMPLATE,
            (Scheduler::WindowsHpc, _) => super::winhpc::DEFAULT_TEMPLATE,
        }
    }

    /// Prefix of directive lines in a batch script
    pub fn directive_prefix(&self) -> Option<&'static str> {
        match self {
            Scheduler::Pbs => Some("#PBS"),
            Scheduler::Sge => Some("#$"),
            Scheduler::Lsf => Some("#BSUB"),
            Scheduler::Slurm => Some("#SBATCH"),
            Scheduler::HtCondor | Scheduler::WindowsHpc => None,
        }
    }

    fn resource_directives(&self) -> &'static [Directive] {
        match self {
            Scheduler::Pbs => &[
                Directive { option: "queue", keys: &["-q"], line: "#PBS -q {queue}" },
                Directive { option: "account", keys: &["-A"], line: "#PBS -A {account}" },
                Directive { option: "walltime", keys: &["walltime"], line: "#PBS -l walltime={walltime}" },
                Directive { option: "nodes", keys: &["nodes", "select"], line: "#PBS -l nodes={nodes}" },
            ],
            Scheduler::Sge => &[
                Directive { option: "queue", keys: &["-q"], line: "#$ -q {queue}" },
                Directive { option: "account", keys: &["-A"], line: "#$ -A {account}" },
                Directive { option: "walltime", keys: &["h_rt"], line: "#$ -l h_rt={walltime}" },
            ],
            Scheduler::Lsf => &[
                Directive { option: "queue", keys: &["-q"], line: "#BSUB -q {queue}" },
                Directive { option: "account", keys: &["-P"], line: "#BSUB -P {account}" },
                Directive { option: "walltime", keys: &["-W"], line: "#BSUB -W {walltime}" },
            ],
            Scheduler::Slurm => &[
                Directive { option: "queue", keys: &["--partition", "-p"], line: "#SBATCH --partition={queue}" },
                Directive { option: "account", keys: &["--account", "-A"], line: "#SBATCH --account={account}" },
                Directive { option: "walltime", keys: &["--time", "-t"], line: "#SBATCH --time={walltime}" },
                Directive { option: "nodes", keys: &["--nodes", "-N"], line: "#SBATCH --nodes={nodes}" },
            ],
            Scheduler::HtCondor | Scheduler::WindowsHpc => &[],
        }
    }

    /// Directive that makes an engine script start `{n}` engines
    fn engine_count_directive(&self) -> Option<Directive> {
        match self {
            Scheduler::Pbs => Some(Directive { option: "n", keys: &["-t", "-J"], line: "#PBS -t 1-{n}" }),
            Scheduler::Sge => Some(Directive { option: "n", keys: &["-t"], line: "#$ -t 1-{n}" }),
            Scheduler::Slurm => Some(Directive {
                option: "n",
                keys: &["--ntasks", "-n", "--array", "-a"],
                line: "#SBATCH --ntasks={n}",
            }),
            _ => None,
        }
    }

    /// Add missing resource directives, the engine count directive and
    /// extra option lines right after the shebang.
    pub fn insert_directives(&self, template: &str, role: Role, opts: &BatchOptions) -> String {
        let mut lines: Vec<String> = Vec::new();

        if let Some(prefix) = self.directive_prefix() {
            let set = |option: &str| match option {
                "queue" => opts.queue.is_some(),
                "account" => opts.account.is_some(),
                "walltime" => opts.walltime.is_some(),
                "nodes" => opts.nodes.is_some(),
                _ => true,
            };

            let engine_count = match role {
                Role::Engines => self.engine_count_directive(),
                Role::Controller => None,
            };

            for directive in self.resource_directives().iter().chain(engine_count.as_ref()) {
                if set(directive.option) && !has_directive(template, prefix, directive.keys) {
                    lines.push(directive.line.to_string());
                }
            }
        }

        for option in &opts.options {
            if !template.lines().any(|l| l.trim() == option.trim()) {
                lines.push(option.clone());
            }
        }

        if lines.is_empty() {
            return template.to_string();
        }
        insert_after_shebang(template, &lines)
    }
}

impl fmt::Display for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Non-empty trimmed lines, one per task of an array job
fn task_lines(stdout: &str) -> impl Iterator<Item = &str> {
    stdout.lines().map(str::trim).filter(|line| !line.is_empty())
}

/// Combine the states of every task in a job.
///
/// Active while any task is active, then the first failure, then finished
/// once every task is.
fn aggregate(states: impl Iterator<Item = JobStatus>) -> JobStatus {
    let mut active = false;
    let mut failed = None;
    let mut unknown = false;
    let mut finished = false;

    for state in states {
        match state {
            JobStatus::Active => active = true,
            JobStatus::Failed(reason) => {
                failed.get_or_insert(reason);
            }
            JobStatus::Unknown => unknown = true,
            JobStatus::Finished => finished = true,
        }
    }

    match failed {
        _ if active => JobStatus::Active,
        Some(reason) => JobStatus::Failed(reason),
        None if unknown || !finished => JobStatus::Unknown,
        None => JobStatus::Finished,
    }
}

fn argv(tokens: &[&str]) -> Vec<String> {
    tokens.iter().map(|t| t.to_string()).collect()
}

fn first_line_with(text: &str, needle: &str) -> String {
    text.lines()
        .find(|l| l.contains(needle))
        .map(|l| l.trim().to_string())
        .unwrap_or_default()
}

/// Whether any `prefix` line carries one of `keys` as a token or `key=...`
fn has_directive(template: &str, prefix: &str, keys: &[&str]) -> bool {
    template
        .lines()
        .filter_map(|line| line.trim_start().strip_prefix(prefix))
        .flat_map(str::split_whitespace)
        .any(|token| {
            keys.iter().any(|key| {
                token == *key
                    || token
                        .strip_prefix(key)
                        .is_some_and(|rest| rest.starts_with('='))
            })
        })
}

fn insert_after_shebang(template: &str, lines: &[String]) -> String {
    let (head, body) = match template.split_once('\n') {
        Some((first, rest)) if first.starts_with("#!") => (Some(first), rest),
        None if template.starts_with("#!") => (Some(template), ""),
        _ => (None, template),
    };

    let mut out = String::new();
    if let Some(head) = head {
        out.push_str(head);
        out.push('\n');
    }
    for line in lines {
        out.push_str(line);
        out.push('\n');
    }
    out.push_str(body);
    out
}

pub const PBS_CONTROLLER_TEMPLATE: &str = "#!/bin/sh
#PBS -V
#PBS -N {job_name}
{program_and_args}
";

pub const PBS_ENGINE_TEMPLATE: &str = "#!/bin/sh
#PBS -V
#PBS -N {job_name}
#PBS -t 1-{n}
{program_and_args}
";

pub const SGE_CONTROLLER_TEMPLATE: &str = "#!/bin/sh
#$ -V
#$ -S /bin/sh
#$ -N {job_name}
{program_and_args}
";

pub const SGE_ENGINE_TEMPLATE: &str = "#!/bin/sh
#$ -V
#$ -S /bin/sh
#$ -N {job_name}
#$ -t 1-{n}
{program_and_args}
";

pub const LSF_CONTROLLER_TEMPLATE: &str = "#!/bin/sh
#BSUB -J {job_name}
#BSUB -oo {job_name}.%J.out
#BSUB -eo {job_name}.%J.err
{program_and_args}
";

pub const LSF_ENGINE_TEMPLATE: &str = "#!/bin/sh
#BSUB -J {job_name}[1-{n}]
#BSUB -oo {job_name}.%J.%I.out
#BSUB -eo {job_name}.%J.%I.err
{program_and_args}
";

pub const SLURM_CONTROLLER_TEMPLATE: &str = "#!/bin/sh
#SBATCH --job-name={job_name}
#SBATCH --ntasks=1
{program_and_args}
";

pub const SLURM_ENGINE_TEMPLATE: &str = "#!/bin/sh
#SBATCH --job-name={job_name}
#SBATCH --ntasks={n}
srun {program_and_args}
";

pub const CONDOR_CONTROLLER_TEMPLATE: &str = "universe = vanilla
executable = {program}
arguments = {condor_arguments}
initialdir = {work_dir}
getenv = True
queue
";

pub const CONDOR_ENGINE_TEMPLATE: &str = "universe = vanilla
executable = {program}
arguments = {condor_arguments}
initialdir = {work_dir}
getenv = True
queue {n}
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_first_number() {
        assert_eq!(
            Scheduler::Slurm.parse_job_id("Submitted batch job 4711\n", None),
            Some("4711".to_string())
        );
        assert_eq!(
            Scheduler::Pbs.parse_job_id("12345.pbsserver\n", None),
            Some("12345".to_string())
        );
        assert_eq!(
            Scheduler::Lsf.parse_job_id("Job <881> is submitted to queue <normal>.\n", None),
            Some("881".to_string())
        );
        assert_eq!(Scheduler::Sge.parse_job_id("qsub: error\n", None), None);
    }

    #[test]
    fn test_condor_job_id_from_last_line() {
        let output = "Submitting job(s)...\n3 job(s) submitted to cluster 42.\n";
        assert_eq!(
            Scheduler::HtCondor.parse_job_id(output, None),
            Some("42".to_string())
        );
    }

    #[test]
    fn test_custom_job_id_pattern() {
        let pattern = Regex::new(r"id=(\w+)").unwrap();
        assert_eq!(
            Scheduler::Pbs.parse_job_id("queued id=abc7", Some(&pattern)),
            Some("abc7".to_string())
        );
    }

    #[test]
    fn test_pbs_status() {
        let running = CommandOutput::ok("Job Id: 1.server\n    job_state = R\n");
        let done = CommandOutput::ok("Job Id: 1.server\n    job_state = C\n");
        let gone = CommandOutput::failed(153, "qstat: Unknown Job Id 1.server");

        assert_eq!(Scheduler::Pbs.parse_status(&running), JobStatus::Active);
        assert_eq!(Scheduler::Pbs.parse_status(&done), JobStatus::Finished);
        assert_eq!(Scheduler::Pbs.parse_status(&gone), JobStatus::Finished);
        assert_eq!(
            Scheduler::Pbs.parse_status(&CommandOutput::failed(1, "connection refused")),
            JobStatus::Unknown
        );
    }

    #[test]
    fn test_sge_status() {
        let gone = CommandOutput::failed(1, "Following jobs do not exist: 7");
        let error = CommandOutput::ok("job_number: 7\nerror reason    1: can't chdir");

        assert_eq!(Scheduler::Sge.parse_status(&gone), JobStatus::Finished);
        assert!(matches!(Scheduler::Sge.parse_status(&error), JobStatus::Failed(_)));
        assert_eq!(
            Scheduler::Sge.parse_status(&CommandOutput::ok("job_number: 7")),
            JobStatus::Active
        );
    }

    #[test]
    fn test_lsf_status() {
        assert_eq!(Scheduler::Lsf.parse_status(&CommandOutput::ok("RUN\n")), JobStatus::Active);
        assert_eq!(Scheduler::Lsf.parse_status(&CommandOutput::ok("DONE\n")), JobStatus::Finished);
        assert!(matches!(
            Scheduler::Lsf.parse_status(&CommandOutput::ok("EXIT\n")),
            JobStatus::Failed(_)
        ));
        assert_eq!(
            Scheduler::Lsf.parse_status(&CommandOutput::failed(255, "Job <9> is not found")),
            JobStatus::Finished
        );
    }

    #[test]
    fn test_slurm_status() {
        let slurm = Scheduler::Slurm;
        assert_eq!(slurm.parse_status(&CommandOutput::ok("")), JobStatus::Finished);
        assert_eq!(slurm.parse_status(&CommandOutput::ok("PENDING\n")), JobStatus::Active);
        assert_eq!(slurm.parse_status(&CommandOutput::ok("CANCELLED+\n")), JobStatus::Finished);
        assert!(matches!(
            slurm.parse_status(&CommandOutput::ok("TIMEOUT\n")),
            JobStatus::Failed(state) if state == "TIMEOUT"
        ));
        assert_eq!(
            slurm.parse_status(&CommandOutput::failed(1, "slurm_load_jobs error: Invalid job id specified")),
            JobStatus::Finished
        );
        assert_eq!(slurm.parse_status(&CommandOutput::ok("WEIRD\n")), JobStatus::Unknown);
    }

    #[test]
    fn test_condor_status() {
        let condor = Scheduler::HtCondor;
        assert_eq!(condor.parse_status(&CommandOutput::ok("2\n")), JobStatus::Active);
        assert_eq!(condor.parse_status(&CommandOutput::ok("4\n")), JobStatus::Finished);
        assert_eq!(condor.parse_status(&CommandOutput::ok("")), JobStatus::Finished);
    }

    #[test]
    fn test_multi_task_status_covers_every_line() {
        let lsf = Scheduler::Lsf;
        assert_eq!(lsf.parse_status(&CommandOutput::ok("DONE\nRUN\n")), JobStatus::Active);
        assert_eq!(lsf.parse_status(&CommandOutput::ok("DONE\nDONE\n")), JobStatus::Finished);
        assert!(matches!(
            lsf.parse_status(&CommandOutput::ok("DONE\nEXIT\n")),
            JobStatus::Failed(_)
        ));

        let condor = Scheduler::HtCondor;
        assert_eq!(condor.parse_status(&CommandOutput::ok("4\n2\n4\n")), JobStatus::Active);
        assert_eq!(condor.parse_status(&CommandOutput::ok("4\n3\n")), JobStatus::Finished);

        let slurm = Scheduler::Slurm;
        assert_eq!(slurm.parse_status(&CommandOutput::ok("COMPLETED\nRUNNING\n")), JobStatus::Active);
        assert!(matches!(
            slurm.parse_status(&CommandOutput::ok("COMPLETED\nFAILED\n")),
            JobStatus::Failed(state) if state == "FAILED"
        ));
        assert_eq!(slurm.parse_status(&CommandOutput::ok("COMPLETED\nWEIRD\n")), JobStatus::Unknown);
    }

    #[test]
    fn test_winhpc_status() {
        let hpc = Scheduler::WindowsHpc;
        let running = CommandOutput::ok("Id       : 42\nState    : Running\n");
        let failed = CommandOutput::ok("Id       : 42\nState    : Failed\n");
        assert_eq!(hpc.parse_status(&running), JobStatus::Active);
        assert!(matches!(hpc.parse_status(&failed), JobStatus::Failed(_)));
    }

    #[test]
    fn test_cancel_of_gone_job() {
        let output = CommandOutput::failed(1, "scancel: error: Kill job error on job id 5: Invalid job id specified");
        assert!(Scheduler::Slurm.job_already_gone(&output));
        assert!(!Scheduler::Slurm.job_already_gone(&CommandOutput::failed(1, "permission denied")));
    }

    #[test]
    fn test_queue_directive_inserted_when_missing() {
        let opts = BatchOptions {
            queue: Some("debug".into()),
            ..Default::default()
        };
        let script = Scheduler::Pbs.insert_directives(PBS_CONTROLLER_TEMPLATE, Role::Controller, &opts);

        let lines: Vec<&str> = script.lines().collect();
        assert_eq!(lines[0], "#!/bin/sh");
        assert_eq!(lines[1], "#PBS -q {queue}");
    }

    #[test]
    fn test_existing_directive_not_duplicated() {
        let opts = BatchOptions {
            queue: Some("debug".into()),
            walltime: Some("01:00:00".into()),
            ..Default::default()
        };
        let template = "#!/bin/sh\n#PBS -q {queue}\n#PBS -l walltime=02:00:00\nipcontroller\n";
        let script = Scheduler::Pbs.insert_directives(template, Role::Controller, &opts);

        assert_eq!(script, template);
    }

    #[test]
    fn test_engine_array_inserted_into_custom_template() {
        let opts = BatchOptions::default();
        let script = Scheduler::Sge.insert_directives("#!/bin/sh\n{program_and_args}\n", Role::Engines, &opts);
        assert_eq!(script, "#!/bin/sh\n#$ -t 1-{n}\n{program_and_args}\n");

        let script = Scheduler::Sge.insert_directives("#!/bin/sh\n{program_and_args}\n", Role::Controller, &opts);
        assert_eq!(script, "#!/bin/sh\n{program_and_args}\n");
    }

    #[test]
    fn test_slurm_flag_forms() {
        let opts = BatchOptions {
            queue: Some("gpu".into()),
            ..Default::default()
        };
        let template = "#!/bin/bash\n#SBATCH -p other\nsrun x\n";
        assert_eq!(Scheduler::Slurm.insert_directives(template, Role::Controller, &opts), template);

        let template = "#!/bin/bash\n#SBATCH --partition=other\nsrun x\n";
        assert_eq!(Scheduler::Slurm.insert_directives(template, Role::Controller, &opts), template);
    }

    #[test]
    fn test_extra_options_inserted() {
        let opts = BatchOptions {
            options: vec!["#SBATCH --mem=4G".into()],
            ..Default::default()
        };
        let script = Scheduler::Slurm.insert_directives(SLURM_CONTROLLER_TEMPLATE, Role::Controller, &opts);
        assert!(script.starts_with("#!/bin/sh\n#SBATCH --mem=4G\n"));
    }
}
