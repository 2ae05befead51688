use std::sync::Arc;

use axum::{
    Json,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, PathRejection, QueryRejection},
    },
    http::StatusCode,
};

use crate::{
    core::{
        domain::{LimitOverrides, RuntimeId},
        engine::{Engine, EngineError},
    },
    http::{
        errors::ApiError,
        models::{
            ExecuteQuery, ExecuteRequest, ExecuteResponse, InstallRequest, InstallResponse,
            RuntimeResponse, UpdateResponse,
        },
    },
};

#[tracing::instrument(skip(engine, payload))]
pub async fn install_runtime(
    State(engine): State<Arc<Engine>>,
    payload: Result<Json<InstallRequest>, JsonRejection>,
) -> Result<Json<InstallResponse>, ApiError> {
    let Json(req) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    tracing::info!("Received installation request for {:?}", req.name);

    let installed = engine.install(req.into()).await?;
    tracing::info!("Installed runtime {}", installed.runtime.id);

    Ok(Json(InstallResponse {
        id: installed.runtime.id,
        stdout: installed.log.stdout,
        stderr: installed.log.stderr,
    }))
}

pub async fn list_runtimes(State(engine): State<Arc<Engine>>) -> Json<Vec<RuntimeResponse>> {
    Json(engine.list().into_iter().map(Into::into).collect())
}

#[tracing::instrument(skip(engine))]
pub async fn delete_runtime(
    State(engine): State<Arc<Engine>>,
    id: Result<Path<RuntimeId>, PathRejection>,
) -> Result<StatusCode, ApiError> {
    let Path(id) = id.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    engine.delete(id).await?;
    tracing::info!("Deleted runtime {}", id);
    Ok(StatusCode::OK)
}

#[tracing::instrument(skip(engine, query, payload))]
pub async fn execute(
    State(engine): State<Arc<Engine>>,
    query: Result<Query<ExecuteQuery>, QueryRejection>,
    payload: Result<Json<ExecuteRequest>, JsonRejection>,
) -> Result<Json<ExecuteResponse>, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let Json(req) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    tracing::debug!(
        "Received submission for runtime {} (project: {})",
        req.runtime_id,
        query.is_project
    );

    let unset = LimitOverrides::default();
    engine.validate_limits(
        req.run_limits.as_ref().unwrap_or(&unset),
        req.compile_limits.as_ref().unwrap_or(&unset),
    )?;

    let is_project = query.is_project;
    let submission = tokio::task::spawn_blocking(move || req.into_submission(is_project))
        .await
        .map_err(|e| {
            tracing::error!("Failed to join decoding task: {}", e);
            ApiError::Internal
        })?
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let outcome = engine.execute(submission).await?;
    Ok(Json(outcome.into()))
}

#[tracing::instrument(skip(engine))]
pub async fn update(State(engine): State<Arc<Engine>>) -> Result<Json<UpdateResponse>, ApiError> {
    match engine.update().await {
        Ok(log) => Ok(Json(UpdateResponse {
            stdout: log.stdout,
            stderr: log.stderr,
        })),
        Err(EngineError::BuildFailed { log }) => Err(ApiError::UpdateFailed { log }),
        Err(e) => Err(e.into()),
    }
}
