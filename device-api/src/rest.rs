use crate::errors::{Error, ErrorKind};
use crate::facade::DeviceFacade;
use crate::model::{DeviceIdentity, PropertyPatch, TwinDocument, UpdateDeviceRequest};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

#[derive(Clone)]
struct AppState {
    facade: DeviceFacade,
    expose_backend_errors: bool,
}

impl AppState {
    fn fail(&self, error: Error, context: &'static str) -> AppError {
        AppError {
            error,
            context,
            expose: self.expose_backend_errors,
        }
    }
}

pub fn create_router(facade: DeviceFacade, expose_backend_errors: bool) -> Router {
    let state = AppState {
        facade,
        expose_backend_errors,
    };

    Router::new()
        .route("/health", get(health_check))
        .route(
            "/api/device/:device_id",
            post(create_device)
                .put(update_device)
                .get(get_device)
                .delete(delete_device),
        )
        .route("/api/device/telemetry/:device_id", post(send_telemetry))
        .route("/api/device/desired/:device_id", put(update_desired_properties))
        .route("/api/device/reported/:device_id", put(update_reported_properties))
        .route("/api/device/twin/:device_id", get(get_device_twin))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn create_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<String, AppError> {
    state
        .facade
        .create_device(&device_id)
        .await
        .map_err(|e| state.fail(e, "Error creating device"))?;
    Ok(format!("Device {} created.", device_id))
}

async fn send_telemetry(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Json(payload): Json<PropertyPatch>,
) -> Result<String, AppError> {
    state
        .facade
        .send_telemetry(&device_id, &payload)
        .await
        .map_err(|e| state.fail(e, "Error sending telemetry"))?;
    Ok("Telemetry sent successfully.".to_string())
}

/// The body is optional; without one the device is enabled.
async fn update_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    body: Bytes,
) -> Result<String, AppError> {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        UpdateDeviceRequest::default()
    } else {
        serde_json::from_slice::<UpdateDeviceRequest>(&body).map_err(|e| {
            state.fail(
                Error::InvalidInput(format!("invalid update body: {}", e)),
                "Error updating device",
            )
        })?
    };

    state
        .facade
        .update_device(&device_id, request.status)
        .await
        .map_err(|e| state.fail(e, "Error updating device"))?;
    Ok(format!("Device {} updated.", device_id))
}

async fn update_desired_properties(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Json(patch): Json<PropertyPatch>,
) -> Result<String, AppError> {
    state
        .facade
        .update_desired_properties(&device_id, &patch)
        .await
        .map_err(|e| state.fail(e, "Error updating desired properties"))?;
    Ok("Desired properties updated.".to_string())
}

async fn update_reported_properties(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Json(patch): Json<PropertyPatch>,
) -> Result<String, AppError> {
    state
        .facade
        .update_reported_properties(&device_id, &patch)
        .await
        .map_err(|e| state.fail(e, "Error updating reported properties"))?;
    Ok("Reported properties updated.".to_string())
}

async fn get_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<DeviceIdentity>, AppError> {
    let device = state
        .facade
        .get_device(&device_id)
        .await
        .map_err(|e| state.fail(e, "Error retrieving device"))?;
    Ok(Json(device))
}

async fn get_device_twin(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<TwinDocument>, AppError> {
    let twin = state
        .facade
        .get_device_twin(&device_id)
        .await
        .map_err(|e| state.fail(e, "Error retrieving twin"))?;
    Ok(Json(twin))
}

async fn delete_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<String, AppError> {
    state
        .facade
        .delete_device(&device_id)
        .await
        .map_err(|e| state.fail(e, "Error deleting device"))?;
    Ok(format!("Device {} deleted.", device_id))
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
}

struct AppError {
    error: Error,
    context: &'static str,
    expose: bool,
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Backend => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let kind = self.error.kind();
        let status = status_for(kind);

        // Client errors carry our own text; backend text stays in the log
        // unless exposure is switched on.
        let message = if status.is_client_error() || self.expose {
            format!("{}: {}", self.context, self.error)
        } else {
            format!("{}.", self.context)
        };

        if status.is_server_error() {
            error!("API error ({}): {}: {}", kind.as_str(), self.context, self.error);
        } else {
            warn!("API error ({}): {}: {}", kind.as_str(), self.context, self.error);
        }

        (
            status,
            Json(ErrorBody {
                error: kind.as_str(),
                message,
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn render(error: Error, expose: bool) -> (StatusCode, serde_json::Value) {
        let response = AppError {
            error,
            context: "Error sending telemetry",
            expose,
        }
        .into_response();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_backend_error_is_opaque_by_default() {
        let (status, body) = render(Error::Backend("secret host detail".into()), false).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "backend_error");
        assert_eq!(body["message"], "Error sending telemetry.");
    }

    #[tokio::test]
    async fn test_backend_error_exposed_when_enabled() {
        let (_, body) = render(Error::Backend("secret host detail".into()), true).await;

        assert!(body["message"]
            .as_str()
            .unwrap()
            .contains("secret host detail"));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorKind::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorKind::Conflict), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorKind::InvalidInput), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorKind::Timeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            status_for(ErrorKind::Backend),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
