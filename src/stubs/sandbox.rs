use std::time::Duration;

use crate::core::{
    domain::RunResult,
    traits::sandbox::{Sandbox, SandboxCommand, SandboxError},
};

#[derive(Debug, Clone)]
pub struct SandboxStub {
    result: Result<RunResult, SandboxError>,
    delay: Duration,
}

impl SandboxStub {
    pub fn new(result: Result<RunResult, SandboxError>, delay: Duration) -> Self {
        Self { result, delay }
    }
}

#[async_trait::async_trait]
impl Sandbox for SandboxStub {
    #[tracing::instrument(skip(self))]
    async fn run(&self, cmd: &SandboxCommand) -> Result<RunResult, SandboxError> {
        tracing::debug!(
            "Start sandboxed command: entrypoint={:?}, limits={:?}",
            cmd.entrypoint,
            cmd.limits
        );
        tokio::time::sleep(self.delay).await;
        tracing::debug!("Sandbox result: {:?}", self.result);

        self.result.clone()
    }
}
