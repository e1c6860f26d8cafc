//! API request handlers for the boot manager

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use nsboot_common::{
    Client, ClientView, ControlRequest, CreateClientRequest, CreateClientResponse,
    CreateSnapshotRequest, EditClientRequest, Error, MasterImage, MessageResponse,
};
use provisioner::Provisioner;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Shared application state
pub struct AppState {
    pub provisioner: Provisioner,
}

impl AppState {
    pub fn new(provisioner: Provisioner) -> Self {
        Self { provisioner }
    }
}

/// API Error type
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    /// Individual step failures of a partially successful operation
    pub errors: Vec<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = if self.errors.is_empty() {
            serde_json::json!({
                "error": self.message
            })
        } else {
            serde_json::json!({
                "message": self.message,
                "errors": self.errors
            })
        };

        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
            Error::PartialFailure { .. } => StatusCode::MULTI_STATUS,
            Error::Collaborator { .. }
            | Error::Storage(_)
            | Error::Io(_)
            | Error::JsonSerialization(_)
            | Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            error!(error = %err, "request failed");
        }

        match err {
            Error::PartialFailure { message, errors } => ApiError {
                status,
                message,
                errors,
            },
            other => ApiError {
                status,
                message: other.to_string(),
                errors: Vec::new(),
            },
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: err.to_string(),
            errors: Vec::new(),
        }
    }
}

/// A message together with the affected client record
#[derive(Debug, Serialize)]
pub struct ClientResponse {
    pub message: String,
    pub client: Client,
}

/// Health check endpoint
pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.provisioner.health_check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "healthy",
                "service": "boot-manager",
                "registry": "reachable"
            })),
        ),
        Err(err) => {
            warn!(error = %err, "registry health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "status": "unhealthy",
                    "service": "boot-manager",
                    "registry": err.to_string()
                })),
            )
        }
    }
}

/// List every client with its live status
pub async fn list_clients_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ClientView>>, ApiError> {
    let clients = state.provisioner.list().await?;
    Ok(Json(clients))
}

/// Get one client
pub async fn get_client_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ClientView>, ApiError> {
    let client = state.provisioner.get(&id).await?;
    Ok(Json(client))
}

/// Provision a new client
pub async fn create_client_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateClientRequest>,
) -> Result<(StatusCode, Json<CreateClientResponse>), ApiError> {
    info!("Creating client: {}", payload.name);

    let client = state.provisioner.create(payload).await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateClientResponse {
            message: format!("Client '{}' created", client.id),
            assigned_ip: client.ip,
        }),
    ))
}

/// Edit a client's addressing, identity or lineage
pub async fn edit_client_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<EditClientRequest>,
) -> Result<Json<ClientResponse>, ApiError> {
    info!("Editing client: {}", id);

    let client = state.provisioner.edit(&id, payload).await?;

    Ok(Json(ClientResponse {
        message: format!("Client '{}' updated", client.id),
        client,
    }))
}

/// Delete a client. Cleanup problems yield 207 with the failed steps.
pub async fn delete_client_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    info!("Deleting client: {}", id);

    state.provisioner.delete(&id).await?;

    Ok(Json(MessageResponse::new(format!(
        "Client '{}' deleted",
        id.trim().to_ascii_lowercase()
    ))))
}

/// Rebuild a client's clone and target from its recorded source
pub async fn reset_client_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ClientResponse>, ApiError> {
    info!("Resetting client: {}", id);

    let client = state.provisioner.reset(&id).await?;

    Ok(Json(ClientResponse {
        message: format!("Client '{}' reset", client.id),
        client,
    }))
}

/// Power and Super Client actions
pub async fn control_client_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<ControlRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    info!("Control action '{}' for client: {}", payload.action, id);

    let message = state.provisioner.control(&id, payload).await?;

    Ok(Json(MessageResponse::new(message)))
}

/// List master images with their checkpoints
pub async fn list_masters_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<MasterImage>>, ApiError> {
    let masters = state.provisioner.list_masters().await?;
    Ok(Json(masters))
}

/// Take a checkpoint of a master image
pub async fn create_snapshot_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateSnapshotRequest>,
) -> Result<(StatusCode, Json<MessageResponse>), ApiError> {
    info!("Creating snapshot: {}", payload.name);

    let message = state.provisioner.create_snapshot(&payload.name).await?;

    Ok((StatusCode::CREATED, Json(MessageResponse::new(message))))
}

/// Delete a checkpoint; the name is the rest of the path, e.g.
/// `nsboot0/win11-master@v2`
pub async fn delete_snapshot_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    info!("Deleting snapshot: {}", name);

    let message = state.provisioner.delete_snapshot(&name).await?;

    Ok(Json(MessageResponse::new(message)))
}
