use base64::{Engine as _, prelude::BASE64_STANDARD};

use crate::{
    core::{
        domain::{ExecutionOutcome, RunResult, RuntimeDefinition, SourceCode, Submission},
        registry::RuntimeSummary,
    },
    http::models::{
        ExecuteRequest, ExecuteResponse, InstallRequest, RuntimeResponse, StageResult,
    },
};

impl From<InstallRequest> for RuntimeDefinition {
    fn from(req: InstallRequest) -> Self {
        Self {
            name: req.name,
            nix_shell: req.nix_shell,
            compile_script: req.compile_script,
            run_script: req.run_script,
            source_file_name: req.source_file_name,
        }
    }
}

impl From<RuntimeSummary> for RuntimeResponse {
    fn from(summary: RuntimeSummary) -> Self {
        Self {
            id: summary.id,
            name: summary.name,
        }
    }
}

impl From<RunResult> for StageResult {
    fn from(result: RunResult) -> Self {
        Self {
            exit_code: result.termination.exit_code(),
            exit_signal: result.termination.exit_signal(),
            exit_status: result.termination.status(),
            exit_message: result.message,
            cpu_time: result.usage.cpu_time,
            wall_time: result.usage.wall_time,
            memory: result.usage.memory,
            stdout: result.stdout,
            stderr: result.stderr,
        }
    }
}

impl From<ExecutionOutcome> for ExecuteResponse {
    fn from(outcome: ExecutionOutcome) -> Self {
        Self {
            extract: outcome.extract.map(Into::into),
            compile: outcome.compile.map(Into::into),
            run: outcome.run.map(Into::into),
        }
    }
}

impl ExecuteRequest {
    /// Decodes the archive in project mode. Decoder messages are safe to show
    /// to the caller.
    pub fn into_submission(self, is_project: bool) -> Result<Submission, base64::DecodeError> {
        let source = if is_project {
            SourceCode::Project(BASE64_STANDARD.decode(&self.source_code)?)
        } else {
            SourceCode::SingleFile(self.source_code)
        };

        Ok(Submission {
            runtime_id: self.runtime_id,
            source,
            input: self.input,
            run_limits: self.run_limits.unwrap_or_default(),
            compile_limits: self.compile_limits.unwrap_or_default(),
        })
    }
}
