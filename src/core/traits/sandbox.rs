use std::path::PathBuf;

use crate::core::{
    domain::{ResourceLimits, RunResult},
    env::EnvVars,
};

#[derive(Clone, Debug, PartialEq)]
pub enum Entrypoint {
    /// Executable script living outside the working directory.
    Script(PathBuf),
    /// Plain command resolved through `PATH`.
    Argv(Vec<String>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct SandboxCommand {
    pub workdir: PathBuf,
    pub entrypoint: Entrypoint,
    pub stdin: Option<Vec<u8>>,
    pub env: EnvVars,
    pub limits: ResourceLimits,
}

#[mockall::automock]
#[async_trait::async_trait]
pub trait Sandbox: std::fmt::Debug + Send + Sync {
    /// Runs one command to completion under `cmd.limits`.
    ///
    /// Limit violations, signals and non-zero exits are reported through
    /// the returned `RunResult`. Errors are reserved for failures of the
    /// sandbox machinery itself.
    async fn run(&self, cmd: &SandboxCommand) -> Result<RunResult, SandboxError>;
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SandboxError {
    #[error("failed to launch sandboxed command: {msg}")]
    Launch { msg: String },
    #[error("sandbox failure: {msg}")]
    Internal { msg: String },
}
