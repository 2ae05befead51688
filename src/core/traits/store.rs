use crate::core::{
    domain::{Runtime, RuntimeId},
    env::EnvVars,
};

/// Persisted form of a runtime. The on-disk directory is derived on load.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RuntimeRecord {
    pub id: RuntimeId,
    pub name: String,
    pub compile_script: String,
    pub run_script: String,
    pub source_file_name: String,
    pub env: EnvVars,
    pub installed_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Catalog {
    /// Next id to hand out. Never decreases, so ids are not reused.
    pub next_id: RuntimeId,
    pub runtimes: Vec<RuntimeRecord>,
}

impl From<&Runtime> for RuntimeRecord {
    fn from(runtime: &Runtime) -> Self {
        Self {
            id: runtime.id,
            name: runtime.name.clone(),
            compile_script: runtime.compile_script.clone(),
            run_script: runtime.run_script.clone(),
            source_file_name: runtime.source_file_name.clone(),
            env: runtime.env.clone(),
            installed_at: runtime.installed_at,
        }
    }
}

#[mockall::automock]
#[async_trait::async_trait]
pub trait RuntimeStore: std::fmt::Debug + Send + Sync {
    async fn load(&self) -> Result<Catalog, StoreError>;

    /// Replaces the stored catalog atomically.
    async fn save(&self, catalog: &Catalog) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("runtime catalog i/o failed: {msg}")]
    Io { msg: String },
    #[error("runtime catalog is corrupt: {msg}")]
    Corrupt { msg: String },
}
