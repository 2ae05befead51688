use std::{
    io,
    path::{Path, PathBuf},
};

use tokio::fs;

use crate::core::traits::store::{Catalog, RuntimeStore, StoreError};

/// Keeps the runtime catalog in a single JSON document.
#[derive(Clone, Debug)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new<T: AsRef<Path>>(path: T) -> Self {
        JsonFileStore {
            path: path.as_ref().into(),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait::async_trait]
impl RuntimeStore for JsonFileStore {
    #[tracing::instrument]
    async fn load(&self) -> Result<Catalog, StoreError> {
        let raw = match fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::info!("No runtime catalog at {}, starting empty", self.path.display());
                return Ok(Catalog::default());
            }
            Err(e) => return Err(StoreError::Io { msg: e.to_string() }),
        };

        serde_json::from_slice(&raw).map_err(|e| StoreError::Corrupt { msg: e.to_string() })
    }

    #[tracing::instrument(skip(catalog))]
    async fn save(&self, catalog: &Catalog) -> Result<(), StoreError> {
        let raw = serde_json::to_vec_pretty(catalog)
            .map_err(|e| StoreError::Corrupt { msg: e.to_string() })?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Io { msg: e.to_string() })?;
        }

        let temp = self.temp_path();
        fs::write(&temp, raw)
            .await
            .map_err(|e| StoreError::Io { msg: e.to_string() })?;
        fs::rename(&temp, &self.path)
            .await
            .map_err(|e| StoreError::Io { msg: e.to_string() })?;

        tracing::debug!("Saved {} runtimes", catalog.runtimes.len());
        Ok(())
    }
}
