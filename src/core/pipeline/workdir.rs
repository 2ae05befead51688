use std::{
    io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use tokio::fs;
use uuid::Uuid;

use crate::core::reaper::{DirectoryReaper, ReapError};

/// Uniquely named scratch directory for one submission.
///
/// [`WorkDir::reclaim`] removes it on the normal path. A directory dropped
/// without being reclaimed (error or cancellation) is removed in the
/// background.
#[derive(Debug)]
pub struct WorkDir {
    path: PathBuf,
    reaper: DirectoryReaper,
    reclaimed: bool,
}

impl WorkDir {
    pub async fn create<T: AsRef<Path>>(root: T, reaper: DirectoryReaper) -> io::Result<Self> {
        let path = root.as_ref().join(Uuid::new_v4().to_string());
        fs::create_dir_all(&path).await?;
        // Sandboxed programs may run under a different uid.
        fs::set_permissions(&path, std::fs::Permissions::from_mode(0o777)).await?;

        Ok(Self {
            path,
            reaper,
            reclaimed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn reclaim(mut self) -> Result<(), ReapError> {
        self.reclaimed = true;
        self.reaper.reclaim(&self.path).await
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if self.reclaimed {
            return;
        }

        let path = std::mem::take(&mut self.path);
        let reaper = self.reaper.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = reaper.reclaim(&path).await {
                        tracing::error!("Abandoned working directory was not removed: {}", e);
                    }
                });
            }
            Err(_) => tracing::error!(
                "No runtime to remove abandoned working directory {}",
                path.display()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_reclaim_removes_directory() {
        let root = tempfile::tempdir().unwrap();
        let workdir = WorkDir::create(root.path(), DirectoryReaper::default())
            .await
            .unwrap();
        let path = workdir.path().to_path_buf();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o777);

        workdir.reclaim().await.unwrap();

        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_dropped_directory_is_removed_in_background() {
        let root = tempfile::tempdir().unwrap();
        let workdir = WorkDir::create(root.path(), DirectoryReaper::default())
            .await
            .unwrap();
        let path = workdir.path().to_path_buf();
        std::fs::write(path.join("leftover"), "x").unwrap();

        drop(workdir);

        for _ in 0..100 {
            if !path.exists() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("working directory still exists");
    }
}
