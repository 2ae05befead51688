use std::{
    io,
    os::{fd::RawFd, unix::process::ExitStatusExt},
    process::{ExitStatus, Stdio},
    time::Duration,
};

use tokio::{
    io::AsyncWriteExt,
    process::{Child, Command},
    time::Instant,
};

use crate::{
    constants::DEFAULT_PATH,
    core::{
        domain::{ResourceLimits, RunResult, Termination, TimeoutKind, Usage},
        env,
        output::CappedOutput,
        traits::sandbox::{Entrypoint, Sandbox, SandboxCommand, SandboxError},
    },
    native::{
        cgroup::{self, CgroupRoot},
        procfs,
    },
};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Runs commands as direct children of the service, confined with rlimits,
/// a per-run pids cgroup and a watchdog that samples the process group
/// through `/proc`.
#[derive(Clone, Debug)]
pub struct NativeSandbox {
    cgroups: CgroupRoot,
    max_output_size: usize,
}

impl NativeSandbox {
    pub fn new(cgroups: CgroupRoot, max_output_size: usize) -> Self {
        NativeSandbox {
            cgroups,
            max_output_size,
        }
    }
}

#[async_trait::async_trait]
impl Sandbox for NativeSandbox {
    #[tracing::instrument(skip(self, cmd), fields(workdir = %cmd.workdir.display()))]
    async fn run(&self, cmd: &SandboxCommand) -> Result<RunResult, SandboxError> {
        let cgroup = self
            .cgroups
            .create(cmd.limits.max_number_of_processes)
            .map_err(|e| SandboxError::Internal { msg: e.to_string() })?;
        let mut command = build_command(cmd, cgroup.procs_fd())?;
        let mut child = command
            .spawn()
            .map_err(|e| SandboxError::Launch { msg: e.to_string() })?;
        let pid = child.id().ok_or_else(|| SandboxError::Internal {
            msg: "spawned process has no pid".to_string(),
        })? as i32;
        let group = ProcessGroup(pid);
        let started = Instant::now();

        let stdin_task = child.stdin.take().map(|mut pipe| {
            let data = cmd.stdin.clone().unwrap_or_default();
            tokio::spawn(async move {
                // The program may exit without reading its input.
                let _ = pipe.write_all(&data).await;
            })
        });
        let stdout = CappedOutput::spawn(child.stdout.take(), self.max_output_size);
        let stderr = CappedOutput::spawn(child.stderr.take(), self.max_output_size);

        let watched = watch(&mut child, &group, &cmd.limits, started).await;
        group.kill();
        if let Some(task) = stdin_task {
            task.abort();
        }
        cgroup.remove().await;
        let (status, verdict, sampled) =
            watched.map_err(|e| SandboxError::Internal { msg: e.to_string() })?;

        let termination = verdict.unwrap_or_else(|| termination_of(status));
        let result = RunResult {
            stdout: stdout.finish().await,
            stderr: stderr.finish().await,
            termination,
            message: message_of(&termination),
            usage: Usage {
                cpu_time: Some(sampled.cpu_time),
                wall_time: Some(started.elapsed().as_secs_f64()),
                memory: Some(sampled.rss_kb),
            },
        };
        tracing::debug!("Sandboxed command finished: {:?}", result.termination);

        Ok(result)
    }
}

fn build_command(cmd: &SandboxCommand, cgroup_procs: RawFd) -> Result<Command, SandboxError> {
    let mut command = match &cmd.entrypoint {
        Entrypoint::Script(path) => Command::new(path),
        Entrypoint::Argv(argv) => {
            let (program, args) = argv.split_first().ok_or_else(|| SandboxError::Launch {
                msg: "empty command".to_string(),
            })?;
            let mut command = Command::new(program);
            command.args(args);
            command
        }
    };

    command.current_dir(&cmd.workdir).env_clear();
    if env::lookup(&cmd.env, "PATH").is_none() {
        command.env("PATH", DEFAULT_PATH);
    }
    command
        .envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(if cmd.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let rlimits = Rlimits::from(&cmd.limits);
    unsafe {
        command.pre_exec(move || {
            cgroup::enter(cgroup_procs)?;
            if libc::setsid() < 0 {
                return Err(io::Error::last_os_error());
            }
            rlimits.apply()
        });
    }

    Ok(command)
}

/// Polls until the child exits, killing the group on the first violated
/// limit. Returns the exit status, the violation if any, and the peak usage.
async fn watch(
    child: &mut Child,
    group: &ProcessGroup,
    limits: &ResourceLimits,
    started: Instant,
) -> io::Result<(ExitStatus, Option<Termination>, procfs::GroupUsage)> {
    let deadline = started + Duration::from_secs_f64(limits.wall_time);
    let cpu_budget = limits.cpu_time + limits.extra_time;
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    let mut peak = procfs::GroupUsage::default();

    let verdict = loop {
        tokio::select! {
            status = child.wait() => return Ok((status?, None, peak)),
            _ = tokio::time::sleep_until(deadline) => {
                break Termination::TimedOut(TimeoutKind::Wall);
            }
            _ = ticker.tick() => {
                let usage = procfs::group_usage(group.0)?;
                peak.cpu_time = peak.cpu_time.max(usage.cpu_time);
                peak.rss_kb = peak.rss_kb.max(usage.rss_kb);

                if usage.cpu_time > cpu_budget {
                    break Termination::TimedOut(TimeoutKind::Cpu);
                }
                if usage.rss_kb > limits.memory {
                    break Termination::Killed(libc::SIGKILL);
                }
            }
        }
    };

    tracing::debug!("Limit violated: {:?}", verdict);
    group.kill();
    let status = child.wait().await?;
    Ok((status, Some(verdict), peak))
}

fn termination_of(status: ExitStatus) -> Termination {
    match (status.code(), status.signal()) {
        (Some(code), _) => Termination::Exited(code),
        (None, Some(libc::SIGXCPU)) => Termination::TimedOut(TimeoutKind::Cpu),
        (None, Some(signal)) => Termination::Killed(signal),
        (None, None) => Termination::Killed(libc::SIGKILL),
    }
}

fn message_of(termination: &Termination) -> Option<String> {
    match termination {
        Termination::Exited(0) => None,
        Termination::Exited(code) => Some(format!("Exited with error status {}", code)),
        Termination::Killed(signal) => Some(format!("Caught fatal signal {}", signal)),
        Termination::TimedOut(TimeoutKind::Wall) => {
            Some("Time limit exceeded (wall clock)".to_string())
        }
        Termination::TimedOut(TimeoutKind::Cpu) => Some("Time limit exceeded".to_string()),
    }
}

/// Process group led by the sandboxed child. Killed on drop so nothing it
/// started outlives the request, including when the request is cancelled.
#[derive(Debug)]
struct ProcessGroup(i32);

impl ProcessGroup {
    fn kill(&self) {
        unsafe {
            libc::killpg(self.0, libc::SIGKILL);
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

#[derive(Clone, Copy, Debug)]
struct Rlimits {
    cpu_seconds: u64,
    file_size_bytes: u64,
    open_files: u64,
}

impl From<&ResourceLimits> for Rlimits {
    fn from(limits: &ResourceLimits) -> Self {
        Self {
            // Backstop only. The watchdog enforces the precise budget.
            cpu_seconds: (limits.cpu_time + limits.extra_time).ceil() as u64 + 1,
            file_size_bytes: limits.max_file_size.saturating_mul(1024),
            open_files: limits.max_open_files.into(),
        }
    }
}

impl Rlimits {
    /// Runs in the forked child, so it must stay async-signal-safe.
    fn apply(&self) -> io::Result<()> {
        set_rlimit(libc::RLIMIT_CPU, self.cpu_seconds, self.cpu_seconds + 1)?;
        set_rlimit(libc::RLIMIT_FSIZE, self.file_size_bytes, self.file_size_bytes)?;
        set_rlimit(libc::RLIMIT_NOFILE, self.open_files, self.open_files)?;
        set_rlimit(libc::RLIMIT_CORE, 0, 0)
    }
}

fn set_rlimit(resource: libc::__rlimit_resource_t, soft: u64, hard: u64) -> io::Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: soft as libc::rlim_t,
        rlim_max: hard as libc::rlim_t,
    };
    if unsafe { libc::setrlimit(resource, &rlim) } != 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{os::unix::fs::PermissionsExt, path::Path, path::PathBuf};

    use super::*;

    fn limits() -> ResourceLimits {
        ResourceLimits {
            wall_time: 5.0,
            cpu_time: 2.0,
            extra_time: 0.5,
            memory: 512 * 1024,
            max_open_files: 64,
            max_file_size: 1024,
            max_number_of_processes: 4096,
        }
    }

    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("run");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn sandbox(dir: &Path, max_output_size: usize) -> NativeSandbox {
        let root = dir.join("cgroup");
        std::fs::create_dir_all(&root).unwrap();
        NativeSandbox::new(cgroup::fake_root(&root), max_output_size)
    }

    fn command(dir: &Path, body: &str) -> SandboxCommand {
        let workdir = dir.join("work");
        std::fs::create_dir_all(&workdir).unwrap();
        SandboxCommand {
            workdir,
            entrypoint: Entrypoint::Script(script(dir, body)),
            stdin: None,
            env: vec![],
            limits: limits(),
        }
    }

    #[tokio::test]
    async fn test_echoes_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let mut cmd = command(dir.path(), "cat; echo err >&2");
        cmd.stdin = Some(b"hello\n".to_vec());

        let result = sandbox(dir.path(), 1024).run(&cmd).await.unwrap();

        assert_eq!(result.stdout, "hello\n");
        assert_eq!(result.stderr, "err\n");
        assert_eq!(result.termination, Termination::Exited(0));
        assert_eq!(result.message, None);
        assert!(result.usage.wall_time.is_some());
    }

    #[tokio::test]
    async fn test_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = command(dir.path(), "exit 3");

        let result = sandbox(dir.path(), 1024).run(&cmd).await.unwrap();

        assert_eq!(result.termination, Termination::Exited(3));
        assert_eq!(result.termination.status(), Some("RE"));
    }

    #[tokio::test]
    async fn test_runs_in_workdir_with_env() {
        let dir = tempfile::tempdir().unwrap();
        let mut cmd = command(dir.path(), "pwd; printf '%s' \"$MULTI\"");
        cmd.env = vec![("MULTI".to_string(), "first\nsecond  line".to_string())];

        let result = sandbox(dir.path(), 1024).run(&cmd).await.unwrap();

        let expected_dir = cmd.workdir.canonicalize().unwrap();
        assert_eq!(
            result.stdout,
            format!("{}\nfirst\nsecond  line", expected_dir.display())
        );
    }

    #[tokio::test]
    async fn test_wall_time_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut cmd = command(dir.path(), "sleep 10");
        cmd.limits.wall_time = 0.3;

        let started = std::time::Instant::now();
        let result = sandbox(dir.path(), 1024).run(&cmd).await.unwrap();

        assert_eq!(result.termination, Termination::TimedOut(TimeoutKind::Wall));
        assert_eq!(result.termination.status(), Some("TO"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cpu_time_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut cmd = command(dir.path(), "while :; do :; done");
        cmd.limits.cpu_time = 0.2;
        cmd.limits.extra_time = 0.1;

        let result = sandbox(dir.path(), 1024).run(&cmd).await.unwrap();

        assert_eq!(result.termination, Termination::TimedOut(TimeoutKind::Cpu));
    }

    #[tokio::test]
    async fn test_file_size_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut cmd = command(dir.path(), "exec head -c 20000 /dev/zero > out");
        cmd.limits.max_file_size = 1;

        let result = sandbox(dir.path(), 1024).run(&cmd).await.unwrap();

        assert_eq!(result.termination, Termination::Killed(libc::SIGXFSZ));
        let written = std::fs::metadata(cmd.workdir.join("out")).unwrap().len();
        assert!(written <= 1024);
    }

    #[tokio::test]
    async fn test_open_files_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut cmd = command(dir.path(), "exec 5>five && echo opened");
        cmd.limits.max_open_files = 4;

        let result = sandbox(dir.path(), 1024).run(&cmd).await.unwrap();

        assert_ne!(result.stdout, "opened\n");
        assert_ne!(result.termination, Termination::Exited(0));
    }

    fn allocate(bytes: usize) -> String {
        format!(
            "x=$(head -c {} /dev/zero | tr '\\0' a)\nsleep 0.5\necho ${{#x}}",
            bytes
        )
    }

    #[tokio::test]
    async fn test_memory_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut cmd = command(dir.path(), &allocate(100 << 20));
        cmd.limits.memory = 32 * 1024;

        let result = sandbox(dir.path(), 1024).run(&cmd).await.unwrap();

        assert_eq!(result.termination, Termination::Killed(libc::SIGKILL));
        assert_eq!(result.termination.status(), Some("SG"));
        assert!(result.usage.memory.unwrap() > 32 * 1024);
    }

    #[tokio::test]
    async fn test_memory_under_limit() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = command(dir.path(), &allocate(10 << 20));

        let result = sandbox(dir.path(), 1024).run(&cmd).await.unwrap();

        assert_eq!(result.termination, Termination::Exited(0));
        assert_eq!(result.stdout, "10485760\n");
    }

    #[tokio::test]
    async fn test_runs_inside_process_limited_cgroup() {
        let dir = tempfile::tempdir().unwrap();
        let mut cmd = command(dir.path(), "echo ok");
        cmd.limits.max_number_of_processes = 3;

        let result = sandbox(dir.path(), 1024).run(&cmd).await.unwrap();
        assert_eq!(result.stdout, "ok\n");

        let runs = std::fs::read_dir(dir.path().join("cgroup"))
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .filter(|path| path.is_dir())
            .collect::<Vec<_>>();
        assert_eq!(runs.len(), 1);
        assert_eq!(
            std::fs::read_to_string(runs[0].join("pids.max")).unwrap(),
            "3"
        );
        assert_eq!(
            std::fs::read_to_string(runs[0].join("cgroup.procs")).unwrap(),
            "0"
        );
    }

    /// Needs a delegated cgroup v2 directory in `ENVRUNNER_TEST_CGROUP`.
    #[tokio::test]
    async fn test_process_limit_stops_forks() {
        let Some(root) = std::env::var_os("ENVRUNNER_TEST_CGROUP") else {
            eprintln!("ENVRUNNER_TEST_CGROUP is not set, skipping");
            return;
        };
        let dir = tempfile::tempdir().unwrap();
        let sandbox = NativeSandbox::new(CgroupRoot::open(Path::new(&root)).unwrap(), 1024);
        let mut cmd = command(
            dir.path(),
            "for i in 1 2 3 4 5 6 7 8; do sleep 1 & done\necho done",
        );
        cmd.limits.max_number_of_processes = 3;

        let result = sandbox.run(&cmd).await.unwrap();

        assert!(!result.stdout.contains("done"), "{:?}", result);
        assert_ne!(result.termination, Termination::Exited(0));
    }

    #[tokio::test]
    async fn test_output_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = command(dir.path(), "head -c 100000 /dev/zero | tr '\\0' a");

        let result = sandbox(dir.path(), 10).run(&cmd).await.unwrap();

        assert_eq!(result.stdout, "aaaaaaaaaa");
        assert_eq!(result.termination, Termination::Exited(0));
    }

    #[tokio::test]
    async fn test_background_processes_are_killed() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = command(dir.path(), "sleep 30 &\necho started");

        let started = std::time::Instant::now();
        let result = sandbox(dir.path(), 1024).run(&cmd).await.unwrap();

        assert_eq!(result.stdout, "started\n");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_argv_entrypoint_uses_default_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut cmd = command(dir.path(), "");
        cmd.entrypoint = Entrypoint::Argv(vec!["echo".to_string(), "hi".to_string()]);

        let result = sandbox(dir.path(), 1024).run(&cmd).await.unwrap();

        assert_eq!(result.stdout, "hi\n");
    }

    #[tokio::test]
    async fn test_missing_program_is_a_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut cmd = command(dir.path(), "");
        cmd.entrypoint = Entrypoint::Script(dir.path().join("missing"));

        let err = sandbox(dir.path(), 1024).run(&cmd).await.unwrap_err();

        assert!(matches!(err, SandboxError::Launch { .. }));
    }
}
