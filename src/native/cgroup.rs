use std::{
    fs::{self, File, OpenOptions},
    io,
    os::fd::{AsRawFd, RawFd},
    path::{Path, PathBuf},
    time::Duration,
};

use uuid::Uuid;

const REMOVE_ATTEMPTS: usize = 50;
const REMOVE_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CgroupError {
    #[error("cgroup {} can't be used: {msg}", path.display())]
    Unavailable { path: PathBuf, msg: String },
    #[error("failed to set up cgroup {}: {msg}", path.display())]
    Setup { path: PathBuf, msg: String },
}

/// Delegated cgroup v2 directory. Every run gets a child cgroup whose
/// `pids.max` bounds the whole process tree, whatever uid it runs as.
///
/// The directory must not hold processes itself, so the service has to
/// live outside of it.
#[derive(Clone, Debug)]
pub struct CgroupRoot {
    path: PathBuf,
}

impl CgroupRoot {
    /// Checks that child cgroups with the pids controller can be created
    /// under `path`, creating `path` itself when missing.
    pub fn open(path: &Path) -> Result<Self, CgroupError> {
        let unavailable = |msg: String| CgroupError::Unavailable {
            path: path.to_path_buf(),
            msg,
        };

        match fs::create_dir(path) {
            Ok(()) => tracing::info!("Created cgroup {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(unavailable(e.to_string())),
        }

        let controllers = fs::read_to_string(path.join("cgroup.controllers"))
            .map_err(|e| unavailable(format!("not a cgroup v2 directory: {}", e)))?;
        if !has_controller(&controllers, "pids") {
            return Err(unavailable("pids controller is not delegated".to_string()));
        }

        let subtree = path.join("cgroup.subtree_control");
        let enabled = fs::read_to_string(&subtree).map_err(|e| unavailable(e.to_string()))?;
        if !has_controller(&enabled, "pids") {
            fs::write(&subtree, "+pids")
                .map_err(|e| unavailable(format!("failed to enable pids controller: {}", e)))?;
        }

        let trial = path.join(Uuid::new_v4().to_string());
        fs::create_dir(&trial)
            .and_then(|()| fs::remove_dir(&trial))
            .map_err(|e| unavailable(format!("child cgroups can't be created: {}", e)))?;

        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Creates a child cgroup that admits at most `max_processes` tasks.
    pub fn create(&self, max_processes: u32) -> Result<RunCgroup, CgroupError> {
        let path = self.path.join(Uuid::new_v4().to_string());
        let setup = |msg: String| CgroupError::Setup {
            path: path.clone(),
            msg,
        };

        fs::create_dir(&path).map_err(|e| setup(e.to_string()))?;
        let mut cgroup = RunCgroup {
            path: path.clone(),
            procs: None,
            removed: false,
        };

        fs::write(path.join("pids.max"), max_processes.to_string())
            .map_err(|e| setup(format!("failed to write pids.max: {}", e)))?;
        let procs = OpenOptions::new()
            .write(true)
            .create(true)
            .open(path.join("cgroup.procs"))
            .map_err(|e| setup(format!("failed to open cgroup.procs: {}", e)))?;
        cgroup.procs = Some(procs);

        Ok(cgroup)
    }
}

fn has_controller(list: &str, name: &str) -> bool {
    list.split_whitespace().any(|c| c == name)
}

/// Per-run cgroup. Removed by [`RunCgroup::remove`], or best effort on drop.
#[derive(Debug)]
pub struct RunCgroup {
    path: PathBuf,
    procs: Option<File>,
    removed: bool,
}

impl RunCgroup {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Descriptor of `cgroup.procs`, to be passed to [`enter`] in the child.
    pub fn procs_fd(&self) -> RawFd {
        self.procs.as_ref().map_or(-1, |f| f.as_raw_fd())
    }

    /// Kills whatever is left in the cgroup and removes it once empty.
    pub async fn remove(mut self) {
        self.removed = true;
        self.procs = None;
        self.kill();

        for _ in 0..REMOVE_ATTEMPTS {
            match fs::remove_dir(&self.path) {
                Ok(()) => return,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return,
                // Killed tasks leave the cgroup asynchronously.
                Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
                    tokio::time::sleep(REMOVE_BACKOFF).await;
                }
                Err(e) => {
                    tracing::warn!("Failed to remove cgroup {}: {}", self.path.display(), e);
                    return;
                }
            }
        }
        tracing::warn!("Cgroup {} is still busy, leaving it", self.path.display());
    }

    fn kill(&self) {
        // `cgroup.kill` needs Linux 5.14, the process group kill covers older kernels.
        let killed = OpenOptions::new()
            .write(true)
            .open(self.path.join("cgroup.kill"))
            .and_then(|mut f| io::Write::write_all(&mut f, b"1"));
        match killed {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to kill cgroup {}: {}", self.path.display(), e),
        }
    }
}

impl Drop for RunCgroup {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        self.procs = None;
        self.kill();
        if let Err(e) = fs::remove_dir(&self.path) {
            tracing::warn!("Abandoned cgroup {} was not removed: {}", self.path.display(), e);
        }
    }
}

/// Moves the calling process into the cgroup behind `procs`.
///
/// Runs in the forked child, so it must stay async-signal-safe.
pub fn enter(procs: RawFd) -> io::Result<()> {
    let own_pid = b"0";
    if unsafe { libc::write(procs, own_pid.as_ptr().cast(), own_pid.len()) } < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Directory shaped like a delegated cgroup, for tests that can't create
/// real ones.
#[cfg(test)]
pub fn fake_root(dir: &Path) -> CgroupRoot {
    fs::write(dir.join("cgroup.controllers"), "cpu memory pids\n").unwrap();
    fs::write(dir.join("cgroup.subtree_control"), "pids\n").unwrap();
    CgroupRoot::open(dir).unwrap()
}
