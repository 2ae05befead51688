use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::core::{
    domain::{
        ExecutionOutcome, LimitOverrides, ResourceLimits, Runtime, RuntimeDefinition, RuntimeId,
        Submission, ensure_trailing_newline,
    },
    gate::{GateError, SchedulingGate},
    limits::{self, LimitError, Stage},
    pipeline::{Pipeline, PipelineError, StageLimits, workdir::WorkDir},
    reaper::DirectoryReaper,
    registry::{Registry, RegistryError, RuntimeSummary},
    traits::builder::{BuildError, BuildLog, BuildRequest, RuntimeBuilder},
};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("Invalid {stage} limits: {source}")]
    InvalidLimits { stage: Stage, source: LimitError },
    #[error("Runtime with id: {0} does not exist")]
    UnknownRuntime(RuntimeId),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("runtime build failed")]
    BuildFailed { log: BuildLog },
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("{msg}")]
    Internal { msg: String },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Installed {
    pub runtime: Arc<Runtime>,
    pub log: BuildLog,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Maxima {
    pub run: ResourceLimits,
    pub compile: ResourceLimits,
}

/// Entry point for every request. Owns the admission gate and applies it
/// around the registry, the builder and the pipeline.
#[derive(Debug)]
pub struct Engine {
    gate: SchedulingGate,
    registry: Registry,
    pipeline: Pipeline,
    builder: Arc<dyn RuntimeBuilder>,
    reaper: DirectoryReaper,
    temp_dir: PathBuf,
    maxima: Maxima,
}

impl Engine {
    pub fn new<T: AsRef<Path>>(
        gate: SchedulingGate,
        registry: Registry,
        pipeline: Pipeline,
        builder: Arc<dyn RuntimeBuilder>,
        reaper: DirectoryReaper,
        temp_dir: T,
        maxima: Maxima,
    ) -> Self {
        Engine {
            gate,
            registry,
            pipeline,
            builder,
            reaper,
            temp_dir: temp_dir.as_ref().into(),
            maxima,
        }
    }

    pub fn gate(&self) -> &SchedulingGate {
        &self.gate
    }

    pub fn list(&self) -> Vec<RuntimeSummary> {
        self.registry.list()
    }

    /// Checks the requested limits without touching the gate, so an invalid
    /// request never waits for a slot.
    pub fn validate_limits(
        &self,
        run: &LimitOverrides,
        compile: &LimitOverrides,
    ) -> Result<(), EngineError> {
        limits::validate(compile, &self.maxima.compile).map_err(|source| {
            EngineError::InvalidLimits {
                stage: Stage::Compile,
                source,
            }
        })?;
        limits::validate(run, &self.maxima.run).map_err(|source| EngineError::InvalidLimits {
            stage: Stage::Run,
            source,
        })
    }

    fn resolve_limits(&self, submission: &Submission) -> Result<StageLimits, EngineError> {
        let compile = limits::resolve(&submission.compile_limits, &self.maxima.compile).map_err(
            |source| EngineError::InvalidLimits {
                stage: Stage::Compile,
                source,
            },
        )?;
        let run = limits::resolve(&submission.run_limits, &self.maxima.run).map_err(|source| {
            EngineError::InvalidLimits {
                stage: Stage::Run,
                source,
            }
        })?;

        Ok(StageLimits { compile, run })
    }

    #[tracing::instrument(skip(self, submission), fields(runtime = submission.runtime_id))]
    pub async fn execute(&self, submission: Submission) -> Result<ExecutionOutcome, EngineError> {
        let limits = self.resolve_limits(&submission)?;

        let slot = self.gate.acquire_execution_slot().await?;
        let runtime = self
            .registry
            .get(submission.runtime_id)
            .ok_or(EngineError::UnknownRuntime(submission.runtime_id))?;

        let outcome = self
            .pipeline
            .execute(&runtime, submission.source, submission.input, &limits)
            .await?;
        slot.release();

        Ok(outcome)
    }

    #[tracing::instrument(skip(self, definition), fields(name = %definition.name))]
    pub async fn install(&self, definition: RuntimeDefinition) -> Result<Installed, EngineError> {
        Registry::validate(&definition)?;

        tracing::debug!("Waiting for the installation barrier: {:?}", self.gate.state());
        let barrier = self.gate.acquire_installation_barrier().await?;
        if self.registry.contains_name(&definition.name) {
            return Err(RegistryError::DuplicateName.into());
        }

        let workdir = WorkDir::create(&self.temp_dir, self.reaper.clone())
            .await
            .map_err(|e| EngineError::Internal { msg: e.to_string() })?;
        let mut nix_shell = definition.nix_shell.clone();
        ensure_trailing_newline(&mut nix_shell);
        let built = self
            .builder
            .build(&BuildRequest {
                workdir: workdir.path().to_path_buf(),
                nix_shell,
            })
            .await;
        if let Err(e) = workdir.reclaim().await {
            tracing::error!("Failed to reclaim build directory: {}", e);
        }

        let output = match built {
            Ok(output) => output,
            Err(BuildError::Failed { log }) => return Err(EngineError::BuildFailed { log }),
            Err(BuildError::Internal { msg }) => return Err(EngineError::Internal { msg }),
        };

        let runtime = self
            .registry
            .install(&barrier, definition, output.env)
            .await?;
        barrier.release();

        Ok(Installed {
            runtime,
            log: output.log,
        })
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, id: RuntimeId) -> Result<(), EngineError> {
        let barrier = self.gate.acquire_installation_barrier().await?;
        self.registry.delete(&barrier, id).await?;
        barrier.release();
        Ok(())
    }

    /// Updates the package manager. Runs exclusively like an installation.
    #[tracing::instrument(skip(self))]
    pub async fn update(&self) -> Result<BuildLog, EngineError> {
        let barrier = self.gate.acquire_installation_barrier().await?;
        let res = self.builder.update().await;
        barrier.release();

        match res {
            Ok(log) => Ok(log),
            Err(BuildError::Failed { log }) => Err(EngineError::BuildFailed { log }),
            Err(BuildError::Internal { msg }) => Err(EngineError::Internal { msg }),
        }
    }

    /// Stops admitting new work.
    pub fn close(&self) {
        self.gate.close();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::Mutex;

    use super::*;
    use crate::{
        core::{
            domain::{RunResult, SourceCode, Termination, Usage},
            traits::{
                builder::{BuildOutput, MockRuntimeBuilder},
                sandbox::{MockSandbox, Sandbox},
            },
        },
        storage::json::JsonFileStore,
        stubs::{builder::BuilderStub, sandbox::SandboxStub},
    };

    fn maxima() -> Maxima {
        let run = ResourceLimits {
            wall_time: 3.0,
            cpu_time: 2.0,
            extra_time: 0.5,
            memory: 262144,
            max_open_files: 64,
            max_file_size: 10240,
            max_number_of_processes: 64,
        };
        Maxima {
            compile: ResourceLimits {
                wall_time: 10.0,
                cpu_time: 10.0,
                extra_time: 1.0,
                ..run.clone()
            },
            run,
        }
    }

    fn ok_result(stdout: &str) -> RunResult {
        RunResult {
            stdout: stdout.to_string(),
            stderr: "".to_string(),
            termination: Termination::Exited(0),
            message: None,
            usage: Usage::default(),
        }
    }

    fn definition(name: &str) -> RuntimeDefinition {
        RuntimeDefinition {
            name: name.to_string(),
            nix_shell: "{ pkgs ? import <nixpkgs> {} }: pkgs.mkShell {}".to_string(),
            compile_script: "".to_string(),
            run_script: "python3 main.py".to_string(),
            source_file_name: "main.py".to_string(),
        }
    }

    fn submission(runtime_id: RuntimeId) -> Submission {
        Submission {
            runtime_id,
            source: SourceCode::SingleFile("print('hi')".to_string()),
            input: None,
            run_limits: LimitOverrides::default(),
            compile_limits: LimitOverrides::default(),
        }
    }

    async fn engine(
        dir: &Path,
        capacity: usize,
        sandbox: Arc<dyn Sandbox>,
        builder: Arc<dyn RuntimeBuilder>,
    ) -> Engine {
        let store = Arc::new(JsonFileStore::new(dir.join("runtimes.json")));
        let registry = Registry::open(dir.join("runtimes"), "/bin/bash", store)
            .await
            .unwrap();
        let reaper = DirectoryReaper::default();
        let pipeline = Pipeline::new(sandbox, reaper.clone(), dir.join("tmp"));
        Engine::new(
            SchedulingGate::new(capacity),
            registry,
            pipeline,
            builder,
            reaper,
            dir.join("tmp"),
            maxima(),
        )
    }

    fn successful_builder() -> MockRuntimeBuilder {
        let mut builder = MockRuntimeBuilder::new();
        builder.expect_build().returning(|request| {
            assert!(request.workdir.exists());
            assert!(request.nix_shell.ends_with('\n'));
            Ok(BuildOutput {
                env: vec![("PATH".to_string(), "/nix/store/py/bin".to_string())],
                log: BuildLog {
                    stdout: "built".to_string(),
                    stderr: "".to_string(),
                },
            })
        });
        builder
    }

    #[tokio::test]
    async fn test_install_then_execute() {
        let dir = tempfile::tempdir().unwrap();
        let mut sandbox = MockSandbox::new();
        sandbox.expect_run().times(1).returning(|cmd| {
            assert_eq!(
                cmd.env,
                vec![("PATH".to_string(), "/nix/store/py/bin".to_string())]
            );
            Ok(ok_result("hi\n"))
        });
        let engine = engine(
            dir.path(),
            2,
            Arc::new(sandbox),
            Arc::new(successful_builder()),
        )
        .await;

        let installed = engine.install(definition("python")).await.unwrap();
        assert_eq!(installed.log.stdout, "built");
        assert_eq!(engine.list().len(), 1);

        let outcome = engine.execute(submission(installed.runtime.id)).await.unwrap();
        assert_eq!(outcome.run.unwrap().stdout, "hi\n");
        assert_eq!(std::fs::read_dir(dir.path().join("tmp")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_failed_build_registers_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = MockRuntimeBuilder::new();
        builder.expect_build().return_const(Err(BuildError::Failed {
            log: BuildLog {
                stdout: "".to_string(),
                stderr: "error: syntax error".to_string(),
            },
        }));
        let engine = engine(
            dir.path(),
            2,
            Arc::new(MockSandbox::new()),
            Arc::new(builder),
        )
        .await;

        let err = engine.install(definition("python")).await.unwrap_err();

        assert!(matches!(err, EngineError::BuildFailed { log } if log.stderr == "error: syntax error"));
        assert!(engine.list().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_install_skips_build() {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = MockRuntimeBuilder::new();
        builder.expect_build().times(1).returning(|_| {
            Ok(BuildOutput {
                env: vec![],
                log: BuildLog::default(),
            })
        });
        let engine = engine(
            dir.path(),
            2,
            Arc::new(MockSandbox::new()),
            Arc::new(builder),
        )
        .await;

        engine.install(definition("python")).await.unwrap();
        let err = engine.install(definition("python")).await.unwrap_err();

        assert_eq!(err.to_string(), "A runtime with this name already exists");
    }

    #[tokio::test]
    async fn test_invalid_limits_never_reach_sandbox() {
        let dir = tempfile::tempdir().unwrap();
        let mut sandbox = MockSandbox::new();
        sandbox.expect_run().times(0);
        let engine = engine(
            dir.path(),
            2,
            Arc::new(sandbox),
            Arc::new(successful_builder()),
        )
        .await;
        let runtime = engine.install(definition("python")).await.unwrap().runtime;

        let mut run_invalid = submission(runtime.id);
        run_invalid.run_limits.cpu_time = Some(3.0);
        let mut compile_invalid = submission(runtime.id);
        compile_invalid.compile_limits.memory = Some(262145);

        assert_eq!(
            engine.execute(run_invalid).await.unwrap_err().to_string(),
            "Invalid run limits: cpu_time can't exceed 2 seconds"
        );
        assert_eq!(
            engine.execute(compile_invalid).await.unwrap_err().to_string(),
            "Invalid compile limits: memory can't exceed 262144 kilobytes"
        );
    }

    #[tokio::test]
    async fn test_unknown_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(
            dir.path(),
            2,
            Arc::new(MockSandbox::new()),
            Arc::new(MockRuntimeBuilder::new()),
        )
        .await;

        let err = engine.execute(submission(99)).await.unwrap_err();

        assert_eq!(err, EngineError::UnknownRuntime(99));
        assert_eq!(err.to_string(), "Runtime with id: 99 does not exist");
        assert_eq!(engine.gate().state(), crate::core::gate::GateState::Idle);
    }

    #[tokio::test]
    async fn test_delete_unknown_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(
            dir.path(),
            2,
            Arc::new(MockSandbox::new()),
            Arc::new(MockRuntimeBuilder::new()),
        )
        .await;

        let err = engine.delete(5).await.unwrap_err();
        assert_eq!(err, EngineError::Registry(RegistryError::NotFound));
    }

    #[tokio::test]
    async fn test_install_waits_for_running_submissions() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = SandboxStub::new(Ok(ok_result("done")), Duration::from_millis(300));
        let builder = BuilderStub::new(
            Ok(BuildOutput {
                env: vec![],
                log: BuildLog::default(),
            }),
            Duration::from_millis(10),
        );
        let engine = Arc::new(engine(dir.path(), 4, Arc::new(sandbox), Arc::new(builder)).await);
        let runtime_id = engine.install(definition("python")).await.unwrap().runtime.id;
        let events = Arc::new(Mutex::new(Vec::new()));

        let executions = (0..3)
            .map(|_| {
                let engine = engine.clone();
                let events = events.clone();
                tokio::spawn(async move {
                    engine.execute(submission(runtime_id)).await.unwrap();
                    events.lock().await.push("executed");
                })
            })
            .collect::<Vec<_>>();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let install = {
            let engine = engine.clone();
            let events = events.clone();
            tokio::spawn(async move {
                engine.install(definition("ruby")).await.unwrap();
                events.lock().await.push("installed");
            })
        };

        for handle in executions {
            handle.await.unwrap();
        }
        install.await.unwrap();

        assert_eq!(
            *events.lock().await,
            vec!["executed", "executed", "executed", "installed"]
        );
    }

    #[tokio::test]
    async fn test_update_maps_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = MockRuntimeBuilder::new();
        builder.expect_update().return_const(Err(BuildError::Internal {
            msg: "nix-env not found".to_string(),
        }));
        let engine = engine(
            dir.path(),
            2,
            Arc::new(MockSandbox::new()),
            Arc::new(builder),
        )
        .await;

        let err = engine.update().await.unwrap_err();
        assert!(matches!(err, EngineError::Internal { .. }));
    }

    #[tokio::test]
    async fn test_closed_engine_rejects_work() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(
            dir.path(),
            2,
            Arc::new(MockSandbox::new()),
            Arc::new(MockRuntimeBuilder::new()),
        )
        .await;

        engine.close();

        assert_eq!(
            engine.execute(submission(1)).await.unwrap_err(),
            EngineError::Gate(GateError::Closed)
        );
    }
}
