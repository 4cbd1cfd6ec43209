use axum::{Json, http::StatusCode, response::IntoResponse};
use eyre::Report;
use serde::{Serialize, Serializer};
use uuid::Uuid;

use crate::services::randomness::RandomnessServiceError;

/// Body of every error response.
#[derive(Debug, Serialize)]
pub(crate) struct ApiError {
    pub message: String,
    #[serde(serialize_with = "serialize_status_code")]
    pub code: StatusCode,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.code, Json(self)).into_response()
    }
}

pub(crate) type ApiResult<T> = Result<T, ApiErrors>;

#[derive(Debug, thiserror::Error)]
pub(crate) enum ApiErrors {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    ServiceUnavailable(String),
    #[error(transparent)]
    InternalServerError(#[from] eyre::Report),
}

impl From<RandomnessServiceError> for ApiErrors {
    fn from(value: RandomnessServiceError) -> Self {
        tracing::debug!("{value:?}");
        match value {
            RandomnessServiceError::InstanceNotFound(_) => ApiErrors::NotFound(value.to_string()),
            RandomnessServiceError::NotReady(_) => ApiErrors::ServiceUnavailable(value.to_string()),
            RandomnessServiceError::InternalServerError(report) => {
                ApiErrors::InternalServerError(report)
            }
            RandomnessServiceError::EmptyBody
            | RandomnessServiceError::BadJson
            | RandomnessServiceError::NoPoints
            | RandomnessServiceError::TooManyPoints { .. }
            | RandomnessServiceError::DecodePoint
            | RandomnessServiceError::ParsePoint
            | RandomnessServiceError::BadEpoch(_) => ApiErrors::BadRequest(value.to_string()),
        }
    }
}

impl IntoResponse for ApiErrors {
    fn into_response(self) -> axum::response::Response {
        match self {
            ApiErrors::BadRequest(message) => ApiError {
                message,
                code: StatusCode::BAD_REQUEST,
            }
            .into_response(),
            ApiErrors::NotFound(message) => ApiError {
                message,
                code: StatusCode::NOT_FOUND,
            }
            .into_response(),
            ApiErrors::ServiceUnavailable(message) => ApiError {
                message,
                code: StatusCode::SERVICE_UNAVAILABLE,
            }
            .into_response(),
            ApiErrors::InternalServerError(inner) => {
                handle_internal_server_error(inner).into_response()
            }
        }
    }
}

fn serialize_status_code<S>(x: &StatusCode, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    s.serialize_u16(x.as_u16())
}

fn handle_internal_server_error(err: Report) -> ApiError {
    let error_id = Uuid::new_v4();
    tracing::error!("{error_id} - {err:?}");
    ApiError {
        message: format!("An internal server error has occurred. Error ID={error_id}"),
        code: StatusCode::INTERNAL_SERVER_ERROR,
    }
}
