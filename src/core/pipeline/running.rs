use crate::core::{
    domain::{ResourceLimits, RunResult, Runtime, ensure_trailing_newline},
    pipeline::{PipelineError, workdir::WorkDir},
    traits::sandbox::{Entrypoint, Sandbox, SandboxCommand},
};

#[tracing::instrument(skip(sandbox, runtime, input), fields(runtime = runtime.id))]
pub async fn run(
    sandbox: &dyn Sandbox,
    runtime: &Runtime,
    workdir: &WorkDir,
    input: Option<String>,
    limits: &ResourceLimits,
) -> Result<RunResult, PipelineError> {
    let stdin = input.map(|mut input| {
        ensure_trailing_newline(&mut input);
        input.into_bytes()
    });

    let cmd = SandboxCommand {
        workdir: workdir.path().to_path_buf(),
        entrypoint: Entrypoint::Script(runtime.run_path()),
        stdin,
        env: runtime.env.clone(),
        limits: limits.clone(),
    };

    tracing::debug!("Start running");
    let result = sandbox.run(&cmd).await?;
    tracing::debug!("Run result: {:?}", result.termination);

    Ok(result)
}
