use std::path::PathBuf;

use crate::core::env::EnvVars;

#[derive(Clone, Debug, PartialEq)]
pub struct BuildRequest {
    /// Scratch directory the build may write into.
    pub workdir: PathBuf,
    pub nix_shell: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BuildLog {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BuildOutput {
    pub env: EnvVars,
    pub log: BuildLog,
}

#[mockall::automock]
#[async_trait::async_trait]
pub trait RuntimeBuilder: std::fmt::Debug + Send + Sync {
    /// Realises the environment described by a nix shell expression and
    /// returns the variables a program needs to run inside it.
    async fn build(&self, request: &BuildRequest) -> Result<BuildOutput, BuildError>;

    /// Refreshes the package manager itself.
    async fn update(&self) -> Result<BuildLog, BuildError>;
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BuildError {
    #[error("build failed")]
    Failed { log: BuildLog },
    #[error("builder failure: {msg}")]
    Internal { msg: String },
}
