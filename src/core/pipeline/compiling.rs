use crate::core::{
    domain::{ResourceLimits, RunResult, Runtime},
    pipeline::{PipelineError, workdir::WorkDir},
    traits::sandbox::{Entrypoint, Sandbox, SandboxCommand},
};

#[tracing::instrument(skip(sandbox, runtime), fields(runtime = runtime.id))]
pub async fn compile(
    sandbox: &dyn Sandbox,
    runtime: &Runtime,
    workdir: &WorkDir,
    limits: &ResourceLimits,
) -> Result<RunResult, PipelineError> {
    let cmd = SandboxCommand {
        workdir: workdir.path().to_path_buf(),
        entrypoint: Entrypoint::Script(runtime.compile_path()),
        stdin: None,
        env: runtime.env.clone(),
        limits: limits.clone(),
    };

    tracing::debug!("Start compiling");
    let result = sandbox.run(&cmd).await?;
    tracing::debug!("Compilation result: {:?}", result.termination);

    Ok(result)
}
