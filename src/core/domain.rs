use std::path::PathBuf;

use crate::core::env::EnvVars;

pub type Seconds = f64;
pub type Kilobytes = u64;
pub type RuntimeId = u32;

/// Fully resolved limits a sandboxed command runs under.
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceLimits {
    pub wall_time: Seconds,
    pub cpu_time: Seconds,
    pub extra_time: Seconds,
    pub memory: Kilobytes,
    pub max_open_files: u32,
    pub max_file_size: Kilobytes,
    pub max_number_of_processes: u32,
}

/// Caller supplied limits. Absent fields fall back to the configured maxima.
#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize)]
pub struct LimitOverrides {
    pub wall_time: Option<Seconds>,
    pub cpu_time: Option<Seconds>,
    pub extra_time: Option<Seconds>,
    pub memory: Option<Kilobytes>,
    pub max_open_files: Option<u32>,
    pub max_file_size: Option<Kilobytes>,
    pub max_number_of_processes: Option<u32>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Runtime {
    pub id: RuntimeId,
    pub name: String,
    pub compile_script: String,
    pub run_script: String,
    pub source_file_name: String,
    pub env: EnvVars,
    pub installed_at: chrono::DateTime<chrono::Utc>,
    pub dir: PathBuf,
}

impl Runtime {
    pub fn is_compiled(&self) -> bool {
        !self.compile_script.is_empty()
    }

    pub fn compile_path(&self) -> PathBuf {
        self.dir.join("compile")
    }

    pub fn run_path(&self) -> PathBuf {
        self.dir.join("run")
    }
}

/// What a client asks to install.
#[derive(Clone, Debug, PartialEq)]
pub struct RuntimeDefinition {
    pub name: String,
    pub nix_shell: String,
    pub compile_script: String,
    pub run_script: String,
    pub source_file_name: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SourceCode {
    SingleFile(String),
    /// Decoded zip archive bytes.
    Project(Vec<u8>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Submission {
    pub runtime_id: RuntimeId,
    pub source: SourceCode,
    pub input: Option<String>,
    pub run_limits: LimitOverrides,
    pub compile_limits: LimitOverrides,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutKind {
    Wall,
    Cpu,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    Killed(i32),
    TimedOut(TimeoutKind),
}

impl Termination {
    pub fn is_success(&self) -> bool {
        matches!(self, Termination::Exited(0))
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Termination::Exited(code) => Some(*code),
            _ => None,
        }
    }

    pub fn exit_signal(&self) -> Option<i32> {
        match self {
            Termination::Killed(signal) => Some(*signal),
            _ => None,
        }
    }

    /// Short classification code: `RE`, `SG`, `TO`, none for a clean exit.
    pub fn status(&self) -> Option<&'static str> {
        match self {
            Termination::Exited(0) => None,
            Termination::Exited(_) => Some("RE"),
            Termination::Killed(_) => Some("SG"),
            Termination::TimedOut(_) => Some("TO"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Usage {
    pub cpu_time: Option<Seconds>,
    pub wall_time: Option<Seconds>,
    pub memory: Option<Kilobytes>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RunResult {
    pub stdout: String,
    pub stderr: String,
    pub termination: Termination,
    pub message: Option<String>,
    pub usage: Usage,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExecutionOutcome {
    pub extract: Option<RunResult>,
    pub compile: Option<RunResult>,
    pub run: Option<RunResult>,
}

/// A source file name must be a single segment that survives sanitizing unchanged.
pub fn is_valid_source_file_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && sanitize_filename::sanitize(name) == name
}

/// Appends a newline to non-empty text that doesn't end with one.
pub fn ensure_trailing_newline(text: &mut String) {
    if !text.is_empty() && !text.ends_with('\n') {
        text.push('\n');
    }
}
