use std::{net::IpAddr, path::PathBuf};

use clap::{Parser, ValueEnum};

use crate::core::{
    domain::{Kilobytes, ResourceLimits, Seconds},
    engine::Maxima,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum SandboxBackend {
    /// Control groups through the `isolate` tool.
    Isolate,
    /// rlimits, a pids cgroup and a `/proc` watchdog, no external tooling.
    Native,
}

/// Every option can also be set through the environment or a `.env` file.
#[derive(Clone, Debug, Parser)]
#[command(version, about = "Sandboxed code execution service")]
pub struct Config {
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,
    #[arg(long, env = "PORT", default_value_t = 5000)]
    pub port: u16,
    #[arg(
        long,
        env = "MAX_CONCURRENT_SUBMISSIONS",
        default_value_t = 64,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub max_concurrent_submissions: u32,

    #[arg(long, env = "SANDBOX_BACKEND", value_enum, default_value_t = SandboxBackend::Isolate)]
    pub sandbox_backend: SandboxBackend,
    #[arg(long, env = "RUNTIMES_DIR", default_value = "/envrunner/runtimes")]
    pub runtimes_dir: PathBuf,
    /// Catalog of installed runtimes, `<runtimes dir>/runtimes.json` when unset.
    #[arg(long, env = "CATALOG_PATH")]
    pub catalog_path: Option<PathBuf>,
    #[arg(long, env = "TEMP_DIR", default_value = "/envrunner/tmp")]
    pub temp_dir: PathBuf,
    /// Interpreter written into the shebang of runtime scripts.
    #[arg(long, env = "SCRIPT_SHELL", default_value = "/bin/bash")]
    pub script_shell: String,
    /// Privileged program, run as `<helper> <dir> <name>`, for working
    /// directories the service can't remove itself.
    #[arg(long, env = "DELETE_HELPER")]
    pub delete_helper: Option<PathBuf>,
    #[arg(long, env = "MAX_OUTPUT_SIZE", default_value_t = 1 << 20)]
    pub max_output_size: usize,

    #[arg(long, env = "ISOLATE_PATH", default_value = "isolate")]
    pub isolate_path: PathBuf,
    #[arg(
        long,
        env = "MAX_BOX_ID",
        default_value_t = 900,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub max_box_id: u32,
    /// Extra `--dir` rules for every box.
    #[arg(long, env = "ISOLATE_MOUNTS", value_delimiter = ',', default_value = "/nix")]
    pub isolate_mounts: Vec<String>,

    /// Delegated cgroup v2 directory for the native backend's process limit.
    #[arg(long, env = "NATIVE_CGROUP_ROOT", default_value = "/sys/fs/cgroup/envrunner")]
    pub native_cgroup_root: PathBuf,

    #[arg(long, env = "NIX_BIN_PATH", default_value = "/home/envrunner/.nix-profile/bin")]
    pub nix_bin_path: PathBuf,
    /// Seconds a runtime build may take.
    #[arg(long, env = "INSTALLATION_TIMEOUT", default_value_t = 120)]
    pub installation_timeout: u64,
    /// Seconds a package manager update may take.
    #[arg(long, env = "UPDATE_TIMEOUT", default_value_t = 300)]
    pub update_timeout: u64,

    #[arg(long, env = "RUN_WALL_TIME", default_value_t = 3.0, value_parser = seconds)]
    pub run_wall_time: Seconds,
    #[arg(long, env = "RUN_CPU_TIME", default_value_t = 2.0, value_parser = seconds)]
    pub run_cpu_time: Seconds,
    #[arg(long, env = "RUN_EXTRA_TIME", default_value_t = 0.5, value_parser = seconds)]
    pub run_extra_time: Seconds,
    #[arg(long, env = "RUN_MEMORY", default_value_t = 262144)]
    pub run_memory: Kilobytes,
    #[arg(long, env = "RUN_MAX_OPEN_FILES", default_value_t = 64)]
    pub run_max_open_files: u32,
    #[arg(long, env = "RUN_MAX_FILE_SIZE", default_value_t = 10240)]
    pub run_max_file_size: Kilobytes,
    #[arg(long, env = "RUN_MAX_NUMBER_OF_PROCESSES", default_value_t = 64)]
    pub run_max_number_of_processes: u32,

    #[arg(long, env = "COMPILE_WALL_TIME", default_value_t = 10.0, value_parser = seconds)]
    pub compile_wall_time: Seconds,
    #[arg(long, env = "COMPILE_CPU_TIME", default_value_t = 10.0, value_parser = seconds)]
    pub compile_cpu_time: Seconds,
    #[arg(long, env = "COMPILE_EXTRA_TIME", default_value_t = 1.0, value_parser = seconds)]
    pub compile_extra_time: Seconds,
    #[arg(long, env = "COMPILE_MEMORY", default_value_t = 1048576)]
    pub compile_memory: Kilobytes,
    #[arg(long, env = "COMPILE_MAX_OPEN_FILES", default_value_t = 256)]
    pub compile_max_open_files: u32,
    #[arg(long, env = "COMPILE_MAX_FILE_SIZE", default_value_t = 65536)]
    pub compile_max_file_size: Kilobytes,
    #[arg(long, env = "COMPILE_MAX_NUMBER_OF_PROCESSES", default_value_t = 128)]
    pub compile_max_number_of_processes: u32,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("the isolate backend needs DELETE_HELPER when the service doesn't run as root")]
    MissingDeleteHelper,
}

fn seconds(raw: &str) -> Result<Seconds, String> {
    let value: Seconds = raw.parse().map_err(|e| format!("{}", e))?;
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err("must be a non-negative number of seconds".to_string())
    }
}

impl Config {
    pub fn catalog_path(&self) -> PathBuf {
        self.catalog_path
            .clone()
            .unwrap_or_else(|| self.runtimes_dir.join("runtimes.json"))
    }

    /// Boxes run under their own uid, so an unprivileged service can only
    /// remove what they leave behind through the delete helper.
    pub fn check_reclaim(&self, euid: u32) -> Result<(), ConfigError> {
        match (self.sandbox_backend, euid, &self.delete_helper) {
            (SandboxBackend::Isolate, 1.., None) => Err(ConfigError::MissingDeleteHelper),
            _ => Ok(()),
        }
    }

    pub fn maxima(&self) -> Maxima {
        Maxima {
            run: ResourceLimits {
                wall_time: self.run_wall_time,
                cpu_time: self.run_cpu_time,
                extra_time: self.run_extra_time,
                memory: self.run_memory,
                max_open_files: self.run_max_open_files,
                max_file_size: self.run_max_file_size,
                max_number_of_processes: self.run_max_number_of_processes,
            },
            compile: ResourceLimits {
                wall_time: self.compile_wall_time,
                cpu_time: self.compile_cpu_time,
                extra_time: self.compile_extra_time,
                memory: self.compile_memory,
                max_open_files: self.compile_max_open_files,
                max_file_size: self.compile_max_file_size,
                max_number_of_processes: self.compile_max_number_of_processes,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let config = Config::try_parse_from([
            "envrunner",
            "--port",
            "8080",
            "--sandbox-backend",
            "native",
            "--run-cpu-time",
            "0.5",
            "--isolate-mounts",
            "/nix,/etc/ssl:maybe",
            "--runtimes-dir",
            "/srv/runtimes",
        ])
        .unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.sandbox_backend, SandboxBackend::Native);
        assert_eq!(config.maxima().run.cpu_time, 0.5);
        assert_eq!(config.isolate_mounts, vec!["/nix", "/etc/ssl:maybe"]);
        assert_eq!(
            config.native_cgroup_root,
            PathBuf::from("/sys/fs/cgroup/envrunner")
        );
        assert_eq!(
            config.catalog_path(),
            PathBuf::from("/srv/runtimes/runtimes.json")
        );
    }

    #[test]
    fn test_unprivileged_isolate_needs_delete_helper() {
        let isolate = Config::try_parse_from(["envrunner"]).unwrap();
        assert_eq!(
            isolate.check_reclaim(1000),
            Err(ConfigError::MissingDeleteHelper)
        );
        assert_eq!(isolate.check_reclaim(0), Ok(()));

        let with_helper = Config::try_parse_from([
            "envrunner",
            "--delete-helper",
            "/usr/local/bin/envrunner-reap",
        ])
        .unwrap();
        assert_eq!(with_helper.check_reclaim(1000), Ok(()));

        let native = Config::try_parse_from(["envrunner", "--sandbox-backend", "native"]).unwrap();
        assert_eq!(native.check_reclaim(1000), Ok(()));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        for args in [
            ["envrunner", "--run-wall-time", "-1"],
            ["envrunner", "--compile-cpu-time", "NaN"],
            ["envrunner", "--max-concurrent-submissions", "0"],
            ["envrunner", "--sandbox-backend", "docker"],
        ] {
            assert!(Config::try_parse_from(args).is_err(), "{:?}", args);
        }
    }
}
