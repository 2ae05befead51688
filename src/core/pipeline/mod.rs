//! Compile and run stages of one submission inside a private working
//! directory.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::fs;

use crate::core::{
    domain::{ExecutionOutcome, ResourceLimits, Runtime, SourceCode, ensure_trailing_newline},
    reaper::DirectoryReaper,
    traits::sandbox::{Sandbox, SandboxError},
};

pub mod compiling;
pub mod extracting;
pub mod running;
pub mod workdir;

use workdir::WorkDir;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    #[error("failed to prepare working directory: {msg}")]
    Workdir { msg: String },
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

#[derive(Clone, Debug, PartialEq)]
pub struct StageLimits {
    pub compile: ResourceLimits,
    pub run: ResourceLimits,
}

#[derive(Debug)]
pub struct Pipeline {
    sandbox: Arc<dyn Sandbox>,
    reaper: DirectoryReaper,
    temp_dir: PathBuf,
}

impl Pipeline {
    pub fn new<T: AsRef<Path>>(
        sandbox: Arc<dyn Sandbox>,
        reaper: DirectoryReaper,
        temp_dir: T,
    ) -> Self {
        Pipeline {
            sandbox,
            reaper,
            temp_dir: temp_dir.as_ref().into(),
        }
    }

    /// Runs extraction (projects only), compilation (compiled runtimes only)
    /// and the program itself, stopping at the first stage that doesn't exit
    /// cleanly. The working directory is gone by the time this returns.
    #[tracing::instrument(skip(self, runtime, source, input), fields(runtime = runtime.id))]
    pub async fn execute(
        &self,
        runtime: &Runtime,
        source: SourceCode,
        input: Option<String>,
        limits: &StageLimits,
    ) -> Result<ExecutionOutcome, PipelineError> {
        let workdir = WorkDir::create(&self.temp_dir, self.reaper.clone())
            .await
            .map_err(|e| PipelineError::Workdir { msg: e.to_string() })?;

        let outcome = self
            .run_stages(&workdir, runtime, source, input, limits)
            .await;

        if let Err(e) = workdir.reclaim().await {
            tracing::error!("Failed to reclaim working directory: {}", e);
        }
        outcome
    }

    async fn run_stages(
        &self,
        workdir: &WorkDir,
        runtime: &Runtime,
        source: SourceCode,
        input: Option<String>,
        limits: &StageLimits,
    ) -> Result<ExecutionOutcome, PipelineError> {
        let mut outcome = ExecutionOutcome::default();

        match source {
            SourceCode::SingleFile(mut code) => {
                ensure_trailing_newline(&mut code);
                fs::write(workdir.path().join(&runtime.source_file_name), code)
                    .await
                    .map_err(|e| PipelineError::Workdir { msg: e.to_string() })?;
            }
            SourceCode::Project(archive) => {
                let extracted = extracting::extract(
                    self.sandbox.as_ref(),
                    workdir,
                    &archive,
                    &limits.compile,
                )
                .await?;
                let success = extracted.termination.is_success();
                outcome.extract = Some(extracted);
                if !success {
                    return Ok(outcome);
                }
            }
        }

        if runtime.is_compiled() {
            let compiled =
                compiling::compile(self.sandbox.as_ref(), runtime, workdir, &limits.compile)
                    .await?;
            let success = compiled.termination.is_success();
            outcome.compile = Some(compiled);
            if !success {
                return Ok(outcome);
            }
        }

        let ran = running::run(self.sandbox.as_ref(), runtime, workdir, input, &limits.run).await?;
        outcome.run = Some(ran);

        Ok(outcome)
    }
}
