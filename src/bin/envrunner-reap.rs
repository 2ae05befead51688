//! Removes one envrunner working directory that the service itself can't,
//! typically because a sandboxed program running under another uid left it
//! without owner permissions.
//!
//! Install it setuid root and executable only by the service's group, then
//! point `DELETE_HELPER` at it.

use std::{
    fs, io,
    path::{Path, PathBuf},
    process::ExitCode,
};

use clap::Parser;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(version, about = "Removes an envrunner working directory")]
struct Args {
    /// Directory holding the working directories.
    dir: PathBuf,
    /// Working directory name, a hyphenated UUID.
    name: String,
}

#[derive(Debug, thiserror::Error)]
enum ReapError {
    #[error("{0:?} is not a working directory name")]
    InvalidName(String),
    #[error("{} is not a directory", .0.display())]
    NotADirectory(PathBuf),
    #[error(transparent)]
    Io(#[from] io::Error),
}

fn main() -> ExitCode {
    tracing_subscriber::fmt().with_writer(io::stderr).init();
    let args = Args::parse();

    match reap(&args.dir, &args.name) {
        Ok(()) => {
            tracing::info!("Removed {}", args.dir.join(&args.name).display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("Failed to remove {:?} from {}: {}", args.name, args.dir.display(), e);
            ExitCode::FAILURE
        }
    }
}

fn reap(dir: &Path, name: &str) -> Result<(), ReapError> {
    let is_workdir_name = Uuid::parse_str(name).is_ok_and(|id| id.to_string() == name);
    if !is_workdir_name {
        return Err(ReapError::InvalidName(name.to_string()));
    }

    let path = dir.join(name);
    let meta = match fs::symlink_metadata(&path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if !meta.is_dir() {
        return Err(ReapError::NotADirectory(path));
    }

    fs::remove_dir_all(&path)?;
    Ok(())
}
