use std::time::Duration;

use crate::core::traits::builder::{
    BuildError, BuildLog, BuildOutput, BuildRequest, RuntimeBuilder,
};

#[derive(Debug, Clone)]
pub struct BuilderStub {
    result: Result<BuildOutput, BuildError>,
    delay: Duration,
}

impl BuilderStub {
    pub fn new(result: Result<BuildOutput, BuildError>, delay: Duration) -> Self {
        Self { result, delay }
    }
}

#[async_trait::async_trait]
impl RuntimeBuilder for BuilderStub {
    #[tracing::instrument(skip(self))]
    async fn build(&self, request: &BuildRequest) -> Result<BuildOutput, BuildError> {
        tracing::debug!("Start build in {:?}", request.workdir);
        tokio::time::sleep(self.delay).await;
        tracing::debug!("Build result: {:?}", self.result);

        self.result.clone()
    }

    async fn update(&self) -> Result<BuildLog, BuildError> {
        tokio::time::sleep(self.delay).await;
        self.result.clone().map(|output| output.log)
    }
}
