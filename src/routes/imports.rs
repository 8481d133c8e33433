use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::import::{ErrorResponse, TaskView};
use crate::services::imports::{ImportError, UploadedFile};

const FILES_FIELD: &str = "files";
const OVERRIDE_FIELD: &str = "alternateFormatOverride";

impl IntoResponse for ImportError {
    fn into_response(self) -> Response {
        let status = match &self {
            ImportError::EmptyBatch
            | ImportError::InvalidFileName(_)
            | ImportError::DuplicateFileName(_) => StatusCode::BAD_REQUEST,
            ImportError::Conflict(_) | ImportError::InvalidState(_) => StatusCode::CONFLICT,
            ImportError::NotFound(_) => StatusCode::NOT_FOUND,
            ImportError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ImportError::Store(_) | ImportError::Io(_) => {
                tracing::error!(error = %self, "Import request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(ErrorResponse { error: self.to_string() })).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse { error: message.into() }),
    )
        .into_response()
}

/// Collect the `files` parts and the optional override flag.
async fn read_upload(mut multipart: Multipart) -> Result<(Vec<UploadedFile>, bool), Response> {
    let mut files = Vec::new();
    let mut alternate_format_override = false;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("Malformed upload: {e}")))?
    {
        match field.name() {
            Some(FILES_FIELD) => {
                let file_name = field
                    .file_name()
                    .map(str::to_string)
                    .ok_or_else(|| bad_request("File part is missing a file name"))?;
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| bad_request(format!("Malformed upload: {e}")))?;
                files.push(UploadedFile {
                    file_name,
                    data: data.to_vec(),
                });
            }
            Some(OVERRIDE_FIELD) => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| bad_request(format!("Malformed upload: {e}")))?;
                alternate_format_override = matches!(value.trim(), "true" | "1");
            }
            _ => {}
        }
    }

    Ok((files, alternate_format_override))
}

/// POST /api/v1/games/{game_id}/imports — upload a batch of media for a game.
pub async fn submit_game_import(
    State(state): State<AppState>,
    Path(game_id): Path<Uuid>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<TaskView>), Response> {
    submit(state, Some(game_id), multipart).await
}

/// POST /api/v1/imports — upload media for a game that is not saved yet.
pub async fn submit_import(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<TaskView>), Response> {
    submit(state, None, multipart).await
}

async fn submit(
    state: AppState,
    game_id: Option<Uuid>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<TaskView>), Response> {
    let (files, alternate_format_override) = read_upload(multipart).await?;
    let task = state
        .imports
        .submit(game_id, files, alternate_format_override)
        .await
        .map_err(IntoResponse::into_response)?;
    Ok((StatusCode::ACCEPTED, Json(TaskView::from(&task))))
}

/// GET /api/v1/imports/{task_id}
pub async fn get_import_status(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<TaskView>, ImportError> {
    let task = state.imports.status(task_id).await?;
    Ok(Json(TaskView::from(&task)))
}

/// GET /api/v1/games/{game_id}/imports/active — `null` when the game has no
/// running import.
pub async fn get_active_import(
    State(state): State<AppState>,
    Path(game_id): Path<Uuid>,
) -> Result<Json<Option<TaskView>>, ImportError> {
    let task = state.imports.active_for_game(game_id).await?;
    Ok(Json(task.as_ref().map(TaskView::from)))
}

/// POST /api/v1/imports/{task_id}/restart
pub async fn restart_import(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<(StatusCode, Json<TaskView>), ImportError> {
    let task = state.imports.restart(task_id).await?;
    Ok((StatusCode::ACCEPTED, Json(TaskView::from(&task))))
}
