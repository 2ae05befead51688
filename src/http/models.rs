use serde::{Deserialize, Serialize};

use crate::core::domain::{Kilobytes, LimitOverrides, RuntimeId, Seconds};

#[derive(Debug, Serialize)]
pub struct Message {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct InstallRequest {
    pub name: String,
    pub nix_shell: String,
    #[serde(default)]
    pub compile_script: String,
    pub run_script: String,
    pub source_file_name: String,
}

#[derive(Debug, Serialize)]
pub struct InstallResponse {
    pub id: RuntimeId,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Serialize)]
pub struct BuildFailureResponse {
    pub message: String,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Serialize)]
pub struct RuntimeResponse {
    pub id: RuntimeId,
    pub name: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ExecuteQuery {
    #[serde(default)]
    pub is_project: bool,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub runtime_id: RuntimeId,
    /// Program text, or a base64 zip archive in project mode.
    pub source_code: String,
    pub input: Option<String>,
    pub run_limits: Option<LimitOverrides>,
    pub compile_limits: Option<LimitOverrides>,
}

/// Outcome of one sandboxed stage as clients see it.
#[derive(Debug, PartialEq, Serialize)]
pub struct StageResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<i32>,
    pub exit_status: Option<&'static str>,
    pub exit_message: Option<String>,
    pub cpu_time: Option<Seconds>,
    pub wall_time: Option<Seconds>,
    pub memory: Option<Kilobytes>,
}

#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    pub extract: Option<StageResult>,
    pub compile: Option<StageResult>,
    pub run: Option<StageResult>,
}

#[derive(Debug, Serialize)]
pub struct UpdateResponse {
    pub stdout: String,
    pub stderr: String,
}
