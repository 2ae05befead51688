use std::{
    io,
    path::{Path, PathBuf},
    process::Output,
};

use tokio::{fs, process::Command};

use crate::{
    constants::{ENV_DUMP_FILE_NAME, NIX_SHELL_FILE_NAME},
    core::{
        env,
        traits::builder::{BuildError, BuildLog, BuildOutput, BuildRequest, RuntimeBuilder},
    },
};

/// Builds runtimes with `nix-shell` and updates nix with `nix-env`.
#[derive(Clone, Debug)]
pub struct NixBuilder {
    nix_bin: PathBuf,
    installation_timeout: u64,
    update_timeout: u64,
}

impl NixBuilder {
    pub fn new<T: AsRef<Path>>(
        nix_bin: T,
        installation_timeout: u64,
        update_timeout: u64,
    ) -> Self {
        NixBuilder {
            nix_bin: nix_bin.as_ref().into(),
            installation_timeout,
            update_timeout,
        }
    }
}

#[async_trait::async_trait]
impl RuntimeBuilder for NixBuilder {
    #[tracing::instrument(skip(self, request), fields(workdir = %request.workdir.display()))]
    async fn build(&self, request: &BuildRequest) -> Result<BuildOutput, BuildError> {
        fs::write(request.workdir.join(NIX_SHELL_FILE_NAME), &request.nix_shell)
            .await
            .map_err(internal)?;

        // A clean environment keeps the service's own variables out of the
        // captured runtime environment.
        let out = Command::new("env")
            .arg("-i")
            .arg("PATH=/bin")
            .arg(self.nix_bin.join("nix-shell"))
            .args(["--timeout", &self.installation_timeout.to_string()])
            .arg(NIX_SHELL_FILE_NAME)
            .args(["--run", &format!("env -0 > {}", ENV_DUMP_FILE_NAME)])
            .current_dir(&request.workdir)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(internal)?;
        let log = log_of(&out);

        if !out.status.success() {
            tracing::info!("nix-shell failed with {}", out.status);
            return Err(BuildError::Failed { log });
        }

        let raw = fs::read(request.workdir.join(ENV_DUMP_FILE_NAME))
            .await
            .map_err(internal)?;
        let env = env::parse_nul_separated(&raw);
        tracing::debug!("Captured {} environment variables", env.len());

        Ok(BuildOutput { env, log })
    }

    #[tracing::instrument(skip(self))]
    async fn update(&self) -> Result<BuildLog, BuildError> {
        let out = Command::new(self.nix_bin.join("nix-env"))
            .arg("--install")
            .args(["--file", "<nixpkgs>"])
            .args(["--attr", "nix", "cacert"])
            .args(["-I", "nixpkgs=channel:nixpkgs-unstable"])
            .args(["--timeout", &self.update_timeout.to_string()])
            .kill_on_drop(true)
            .output()
            .await
            .map_err(internal)?;
        let log = log_of(&out);

        if out.status.success() {
            Ok(log)
        } else {
            Err(BuildError::Failed { log })
        }
    }
}

fn log_of(out: &Output) -> BuildLog {
    BuildLog {
        stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
    }
}

fn internal(e: io::Error) -> BuildError {
    BuildError::Internal { msg: e.to_string() }
}
