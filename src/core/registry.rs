use std::{
    io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use dashmap::DashMap;
use itertools::Itertools;
use tokio::fs;

use crate::{
    constants::NIX_SHELL_FILE_NAME,
    core::{
        domain::{
            Runtime, RuntimeDefinition, RuntimeId, ensure_trailing_newline,
            is_valid_source_file_name,
        },
        env::EnvVars,
        gate::InstallationBarrier,
        traits::store::{Catalog, RuntimeRecord, RuntimeStore, StoreError},
    },
};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistryError {
    #[error("{0}")]
    MissingField(&'static str),
    #[error("Invalid source file name")]
    InvalidSourceFileName,
    #[error("A runtime with this name already exists")]
    DuplicateName,
    #[error("Could not find the specified runtime")]
    NotFound,
    #[error("failed to write runtime files: {msg}")]
    Io { msg: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeSummary {
    pub id: RuntimeId,
    pub name: String,
}

/// Installed runtimes, readable without any coordination.
///
/// Mutations take an [`InstallationBarrier`], so at most one of them runs at
/// a time and never while a submission is executing.
#[derive(Debug)]
pub struct Registry {
    runtimes: DashMap<RuntimeId, Arc<Runtime>>,
    next_id: AtomicU32,
    runtimes_dir: PathBuf,
    script_shell: String,
    store: Arc<dyn RuntimeStore>,
}

impl Registry {
    #[tracing::instrument(skip(store))]
    pub async fn open<T: AsRef<Path> + std::fmt::Debug>(
        runtimes_dir: T,
        script_shell: &str,
        store: Arc<dyn RuntimeStore>,
    ) -> Result<Self, RegistryError> {
        let runtimes_dir = runtimes_dir.as_ref().to_path_buf();
        let catalog = store.load().await?;

        let max_id = catalog.runtimes.iter().map(|r| r.id).max().unwrap_or(0);
        let next_id = catalog.next_id.max(max_id + 1).max(1);

        let runtimes = DashMap::new();
        for record in catalog.runtimes {
            let dir = runtimes_dir.join(record.id.to_string());
            runtimes.insert(record.id, Arc::new(into_runtime(record, dir)));
        }
        tracing::info!("Loaded {} runtimes", runtimes.len());

        Ok(Self {
            runtimes,
            next_id: AtomicU32::new(next_id),
            runtimes_dir,
            script_shell: script_shell.to_string(),
            store,
        })
    }

    /// Field checks that need no registry state.
    pub fn validate(definition: &RuntimeDefinition) -> Result<(), RegistryError> {
        if definition.name.is_empty() {
            Err(RegistryError::MissingField("Name can't be empty"))
        } else if definition.nix_shell.is_empty() {
            Err(RegistryError::MissingField("Nix shell can't be empty"))
        } else if definition.run_script.is_empty() {
            Err(RegistryError::MissingField("Run command can't be empty"))
        } else if definition.source_file_name.is_empty() {
            Err(RegistryError::MissingField("Source file name can't be empty"))
        } else if !is_valid_source_file_name(&definition.source_file_name) {
            Err(RegistryError::InvalidSourceFileName)
        } else {
            Ok(())
        }
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.runtimes.iter().any(|r| r.name == name)
    }

    pub fn get(&self, id: RuntimeId) -> Option<Arc<Runtime>> {
        self.runtimes.get(&id).map(|r| r.value().clone())
    }

    pub fn list(&self) -> Vec<RuntimeSummary> {
        self.runtimes
            .iter()
            .map(|r| RuntimeSummary {
                id: r.id,
                name: r.name.clone(),
            })
            .sorted_by_key(|r| r.id)
            .collect()
    }

    #[tracing::instrument(skip(self, _barrier, env))]
    pub async fn install(
        &self,
        _barrier: &InstallationBarrier,
        mut definition: RuntimeDefinition,
        env: EnvVars,
    ) -> Result<Arc<Runtime>, RegistryError> {
        Self::validate(&definition)?;
        if self.contains_name(&definition.name) {
            return Err(RegistryError::DuplicateName);
        }

        ensure_trailing_newline(&mut definition.nix_shell);
        ensure_trailing_newline(&mut definition.compile_script);
        ensure_trailing_newline(&mut definition.run_script);

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let runtime = Runtime {
            id,
            name: definition.name,
            compile_script: definition.compile_script,
            run_script: definition.run_script,
            source_file_name: definition.source_file_name,
            env,
            installed_at: chrono::Utc::now(),
            dir: self.runtimes_dir.join(id.to_string()),
        };

        if let Err(e) = self.write_files(&runtime, &definition.nix_shell).await {
            remove_dir_if_exists(&runtime.dir).await;
            return Err(RegistryError::Io { msg: e.to_string() });
        }

        let mut catalog = self.catalog();
        catalog.runtimes.push((&runtime).into());
        if let Err(e) = self.store.save(&catalog).await {
            tracing::error!("Rolling back installation of runtime {}: {}", id, e);
            remove_dir_if_exists(&runtime.dir).await;
            return Err(e.into());
        }

        let runtime = Arc::new(runtime);
        self.runtimes.insert(id, runtime.clone());
        tracing::info!("Installed runtime {} ({})", runtime.name, id);
        Ok(runtime)
    }

    #[tracing::instrument(skip(self, _barrier))]
    pub async fn delete(
        &self,
        _barrier: &InstallationBarrier,
        id: RuntimeId,
    ) -> Result<(), RegistryError> {
        let (_, runtime) = self.runtimes.remove(&id).ok_or(RegistryError::NotFound)?;

        if let Err(e) = self.store.save(&self.catalog()).await {
            self.runtimes.insert(id, runtime);
            return Err(e.into());
        }

        remove_dir_if_exists(&runtime.dir).await;
        tracing::info!("Deleted runtime {} ({})", runtime.name, id);
        Ok(())
    }

    fn catalog(&self) -> Catalog {
        Catalog {
            next_id: self.next_id.load(Ordering::SeqCst),
            runtimes: self
                .runtimes
                .iter()
                .map(|r| RuntimeRecord::from(r.value().as_ref()))
                .sorted_by_key(|r| r.id)
                .collect(),
        }
    }

    async fn write_files(&self, runtime: &Runtime, nix_shell: &str) -> io::Result<()> {
        remove_dir_if_exists(&runtime.dir).await;
        fs::create_dir_all(&runtime.dir).await?;

        if runtime.is_compiled() {
            self.write_script(&runtime.compile_path(), &runtime.compile_script)
                .await?;
        }
        self.write_script(&runtime.run_path(), &runtime.run_script)
            .await?;
        fs::write(runtime.dir.join(NIX_SHELL_FILE_NAME), nix_shell).await?;

        // The sandboxed user must be able to reach the scripts.
        fs::set_permissions(&runtime.dir, std::fs::Permissions::from_mode(0o755)).await
    }

    async fn write_script(&self, path: &Path, body: &str) -> io::Result<()> {
        fs::write(path, format!("#!{}\n\n{}", self.script_shell, body)).await?;
        fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await
    }
}

fn into_runtime(record: RuntimeRecord, dir: PathBuf) -> Runtime {
    Runtime {
        id: record.id,
        name: record.name,
        compile_script: record.compile_script,
        run_script: record.run_script,
        source_file_name: record.source_file_name,
        env: record.env,
        installed_at: record.installed_at,
        dir,
    }
}

async fn remove_dir_if_exists(dir: &Path) {
    match fs::remove_dir_all(dir).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => {
            tracing::warn!("Failed to remove {}: {}", dir.display(), e);
        }
        _ => {}
    }
}
