use std::{
    fs, io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use futures::{StreamExt, stream::FuturesUnordered};
use tokio::{process::Command, task};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReapError {
    #[error("failed to remove {}: {msg}", path.display())]
    Failed { path: PathBuf, msg: String },
}

/// Removes sandbox working directories, including trees a sandboxed program
/// left without owner permissions.
#[derive(Clone, Debug, Default)]
pub struct DirectoryReaper {
    /// Privileged removal command, run as `<helper> <dir> <name>` when
    /// in-process removal fails.
    helper: Option<PathBuf>,
}

impl DirectoryReaper {
    pub fn new(helper: Option<PathBuf>) -> Self {
        Self { helper }
    }

    #[tracing::instrument(skip(self))]
    pub async fn reclaim(&self, path: &Path) -> Result<(), ReapError> {
        let owned = path.to_path_buf();
        let res = task::spawn_blocking(move || remove_tree(&owned))
            .await
            .map_err(|e| ReapError::Failed {
                path: path.to_path_buf(),
                msg: e.to_string(),
            })?;

        match (res, &self.helper) {
            (Ok(()), _) => Ok(()),
            (Err(e), Some(helper)) => {
                tracing::warn!("In-process removal of {} failed: {}", path.display(), e);
                self.run_helper(helper, path).await
            }
            (Err(e), None) => Err(ReapError::Failed {
                path: path.to_path_buf(),
                msg: e.to_string(),
            }),
        }
    }

    /// Removes every entry under `root` left over from a previous process.
    #[tracing::instrument(skip(self))]
    pub async fn sweep(&self, root: &Path) -> Result<usize, ReapError> {
        let mut entries = match tokio::fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(ReapError::Failed {
                    path: root.to_path_buf(),
                    msg: e.to_string(),
                });
            }
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| ReapError::Failed {
            path: root.to_path_buf(),
            msg: e.to_string(),
        })? {
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            paths.push((entry.path(), is_dir));
        }

        let mut removals = paths
            .into_iter()
            .map(|(path, is_dir)| async move {
                if is_dir {
                    self.reclaim(&path).await
                } else {
                    tokio::fs::remove_file(&path)
                        .await
                        .map_err(|e| ReapError::Failed {
                            path: path.clone(),
                            msg: e.to_string(),
                        })
                }
            })
            .collect::<FuturesUnordered<_>>();

        let mut removed = 0;
        while let Some(res) = removals.next().await {
            match res {
                Ok(()) => removed += 1,
                Err(e) => tracing::error!("Stale entry was not removed: {}", e),
            }
        }

        if removed > 0 {
            tracing::info!("Removed {} stale entries from {}", removed, root.display());
        }
        Ok(removed)
    }

    async fn run_helper(&self, helper: &Path, path: &Path) -> Result<(), ReapError> {
        let (Some(dir), Some(name)) = (path.parent(), path.file_name()) else {
            return Err(ReapError::Failed {
                path: path.to_path_buf(),
                msg: "path has no parent directory".to_string(),
            });
        };
        let out = Command::new(helper)
            .arg(dir)
            .arg(name)
            .output()
            .await
            .map_err(|e| ReapError::Failed {
                path: path.to_path_buf(),
                msg: format!("failed to run {}: {}", helper.display(), e),
            })?;

        if !out.status.success() {
            return Err(ReapError::Failed {
                path: path.to_path_buf(),
                msg: format!(
                    "{} exited with {}: {}",
                    helper.display(),
                    out.status,
                    String::from_utf8_lossy(&out.stderr)
                ),
            });
        }
        Ok(())
    }
}

fn remove_tree(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => return Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => tracing::debug!(
            "Removal of {} failed, restoring permissions: {}",
            path.display(),
            e
        ),
    }

    restore_owner_access(path)?;
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Grants the owner rwx on every directory of the tree. Symlinks are not
/// followed.
fn restore_owner_access(path: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if !meta.is_dir() {
        return Ok(());
    }

    let mode = meta.permissions().mode();
    if mode & 0o700 != 0o700 {
        fs::set_permissions(path, fs::Permissions::from_mode(mode | 0o700))?;
    }

    for entry in fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            restore_owner_access(&entry.path())?;
        }
    }
    Ok(())
}
