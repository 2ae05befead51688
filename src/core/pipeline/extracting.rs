use tokio::fs;

use crate::{
    constants::{DEFAULT_PATH, SOURCE_ZIP_NAME},
    core::{
        domain::{ResourceLimits, RunResult},
        pipeline::{PipelineError, workdir::WorkDir},
        traits::sandbox::{Entrypoint, Sandbox, SandboxCommand},
    },
};

/// Unpacks a project archive into the working directory.
///
/// The archive is untrusted, so `unzip` runs inside the sandbox under the
/// compile limits. A non-zero exit is an ordinary outcome for the caller to
/// report. The archive itself is removed after a successful extraction.
#[tracing::instrument(skip(sandbox, archive))]
pub async fn extract(
    sandbox: &dyn Sandbox,
    workdir: &WorkDir,
    archive: &[u8],
    limits: &ResourceLimits,
) -> Result<RunResult, PipelineError> {
    let archive_path = workdir.path().join(SOURCE_ZIP_NAME);
    fs::write(&archive_path, archive)
        .await
        .map_err(|e| PipelineError::Workdir { msg: e.to_string() })?;

    let cmd = SandboxCommand {
        workdir: workdir.path().to_path_buf(),
        entrypoint: Entrypoint::Argv(vec![
            "unzip".to_string(),
            "-qq".to_string(),
            SOURCE_ZIP_NAME.to_string(),
        ]),
        stdin: None,
        env: vec![("PATH".to_string(), DEFAULT_PATH.to_string())],
        limits: limits.clone(),
    };

    tracing::debug!("Start extracting");
    let result = sandbox.run(&cmd).await?;
    tracing::debug!("Extraction result: {:?}", result.termination);

    if result.termination.is_success() {
        if let Err(e) = fs::remove_file(&archive_path).await {
            tracing::warn!("Failed to remove extracted archive: {}", e);
        }
    }
    Ok(result)
}
