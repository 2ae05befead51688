use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
};

use tokio::{fs, io::AsyncWriteExt, process::Command};

use crate::{
    constants::{BOX_RUNTIME_DIR, BOX_SUBMISSION_DIR},
    core::{
        domain::{ResourceLimits, RunResult},
        output::CappedOutput,
        traits::sandbox::{Entrypoint, Sandbox, SandboxCommand, SandboxError},
    },
    isolate::{
        boxes::{BoxLease, BoxPool},
        meta,
    },
};

/// Runs every command in a freshly initialised isolate box with control
/// group limits.
#[derive(Clone, Debug)]
pub struct IsolateSandbox {
    isolate: PathBuf,
    boxes: Arc<BoxPool>,
    /// Extra `--dir` rules, e.g. `/nix` so runtime closures are visible.
    mounts: Vec<String>,
    max_output_size: usize,
}

impl IsolateSandbox {
    pub fn new<T: AsRef<Path>>(
        isolate: T,
        boxes: Arc<BoxPool>,
        mounts: Vec<String>,
        max_output_size: usize,
    ) -> Self {
        IsolateSandbox {
            isolate: isolate.as_ref().into(),
            boxes,
            mounts,
            max_output_size,
        }
    }

    fn run_args(
        &self,
        box_id: u32,
        meta_path: &Path,
        cmd: &SandboxCommand,
    ) -> Result<Vec<String>, SandboxError> {
        let mut args = vec![
            "--run".to_string(),
            "--cg".to_string(),
            "--silent".to_string(),
            format!("-b{}", box_id),
            format!("--meta={}", meta_path.display()),
        ];
        args.extend(limit_args(&cmd.limits));
        args.push(format!(
            "--dir={}={}:rw",
            BOX_SUBMISSION_DIR,
            cmd.workdir.display()
        ));
        args.push(format!("--chdir={}", BOX_SUBMISSION_DIR));
        args.extend(self.mounts.iter().map(|m| format!("--dir={}", m)));

        let program = match &cmd.entrypoint {
            Entrypoint::Script(path) => {
                let (Some(dir), Some(name)) = (path.parent(), path.file_name()) else {
                    return Err(SandboxError::Launch {
                        msg: format!("invalid script path {}", path.display()),
                    });
                };
                args.push(format!("--dir={}={}", BOX_RUNTIME_DIR, dir.display()));
                vec![format!("{}/{}", BOX_RUNTIME_DIR, name.to_string_lossy())]
            }
            Entrypoint::Argv(argv) if !argv.is_empty() => argv.clone(),
            Entrypoint::Argv(_) => {
                return Err(SandboxError::Launch {
                    msg: "empty command".to_string(),
                });
            }
        };

        args.extend(cmd.env.iter().map(|(k, v)| format!("--env={}={}", k, v)));
        args.push("--".to_string());
        args.extend(program);
        Ok(args)
    }

    async fn isolate(&self, args: &[String]) -> Result<(), SandboxError> {
        let out = Command::new(&self.isolate)
            .args(args)
            .output()
            .await
            .map_err(|e| SandboxError::Internal {
                msg: format!("failed to run isolate: {}", e),
            })?;

        if !out.status.success() {
            return Err(SandboxError::Internal {
                msg: format!(
                    "isolate {} failed: {}",
                    args.join(" "),
                    String::from_utf8_lossy(&out.stderr)
                ),
            });
        }
        Ok(())
    }
}

fn limit_args(limits: &ResourceLimits) -> Vec<String> {
    vec![
        format!("--cg-mem={}", limits.memory),
        format!("--wall-time={}", limits.wall_time),
        format!("--time={}", limits.cpu_time),
        format!("--extra-time={}", limits.extra_time),
        format!("--open-files={}", limits.max_open_files),
        format!("--fsize={}", limits.max_file_size),
        format!("--processes={}", limits.max_number_of_processes),
    ]
}

/// Initialised box. Its id goes back to the pool only after cleanup.
struct InitializedBox {
    isolate: PathBuf,
    lease: Option<BoxLease>,
}

impl InitializedBox {
    async fn cleanup(mut self) {
        if let Some(lease) = self.lease.take() {
            cleanup_box(&self.isolate, lease.id()).await;
        }
    }
}

impl Drop for InitializedBox {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::error!("No runtime to clean up isolate box {}", lease.id());
            return;
        };
        let isolate = self.isolate.clone();
        handle.spawn(async move {
            cleanup_box(&isolate, lease.id()).await;
            drop(lease);
        });
    }
}

async fn cleanup_box(isolate: &Path, id: u32) {
    let res = Command::new(isolate)
        .args(["--cleanup", "--cg", &format!("-b{}", id)])
        .output()
        .await;
    match res {
        Ok(out) if !out.status.success() => tracing::error!(
            "isolate --cleanup of box {} failed: {}",
            id,
            String::from_utf8_lossy(&out.stderr)
        ),
        Err(e) => tracing::error!("Failed to run isolate --cleanup: {}", e),
        _ => {}
    }
}

#[async_trait::async_trait]
impl Sandbox for IsolateSandbox {
    #[tracing::instrument(skip(self, cmd), fields(workdir = %cmd.workdir.display()))]
    async fn run(&self, cmd: &SandboxCommand) -> Result<RunResult, SandboxError> {
        let lease = self.boxes.lease().await.ok_or_else(|| SandboxError::Internal {
            msg: "box pool is unavailable".to_string(),
        })?;
        let box_id = lease.id();

        self.isolate(&["--init".to_string(), "--cg".to_string(), format!("-b{}", box_id)])
            .await?;
        let initialized = InitializedBox {
            isolate: self.isolate.clone(),
            lease: Some(lease),
        };

        let result = self.run_in_box(box_id, cmd).await;
        initialized.cleanup().await;
        result
    }
}

impl IsolateSandbox {
    async fn run_in_box(
        &self,
        box_id: u32,
        cmd: &SandboxCommand,
    ) -> Result<RunResult, SandboxError> {
        let meta_path = cmd.workdir.with_extension("meta");
        let args = self.run_args(box_id, &meta_path, cmd)?;
        tracing::debug!("Running isolate with {:?}", args);

        let mut child = Command::new(&self.isolate)
            .args(&args)
            .stdin(if cmd.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::Launch { msg: e.to_string() })?;

        let stdin_task = child.stdin.take().map(|mut pipe| {
            let data = cmd.stdin.clone().unwrap_or_default();
            tokio::spawn(async move {
                let _ = pipe.write_all(&data).await;
            })
        });
        let stdout = CappedOutput::spawn(child.stdout.take(), self.max_output_size);
        let stderr = CappedOutput::spawn(child.stderr.take(), self.max_output_size);

        let status = child
            .wait()
            .await
            .map_err(|e| SandboxError::Internal { msg: e.to_string() })?;
        if let Some(task) = stdin_task {
            task.abort();
        }
        let stdout = stdout.finish().await;
        let stderr = stderr.finish().await;

        // Exit status 0 and 1 both mean the meta file describes the program.
        if !matches!(status.code(), Some(0) | Some(1)) {
            let _ = fs::remove_file(&meta_path).await;
            return Err(SandboxError::Internal {
                msg: format!("isolate exited with {}: {}", status, stderr),
            });
        }

        let raw = fs::read_to_string(&meta_path)
            .await
            .map_err(|e| SandboxError::Internal {
                msg: format!("failed to read {}: {}", meta_path.display(), e),
            });
        let _ = fs::remove_file(&meta_path).await;
        let meta = meta::parse(&raw?).map_err(|e| SandboxError::Internal { msg: e.to_string() })?;
        let termination = meta
            .termination()
            .map_err(|e| SandboxError::Internal { msg: e.to_string() })?;

        Ok(RunResult {
            stdout,
            stderr,
            termination,
            message: meta.message.clone(),
            usage: meta.usage(),
        })
    }
}
