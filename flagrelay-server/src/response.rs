use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use flagrelay_core::{FlagrelayError, Outcome};
use serde::Serialize;

/// Error body in the shape the Lambda runtime reports failures.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error_type: String,
    pub error_message: String,
}

impl From<&FlagrelayError> for ErrorBody {
    fn from(err: &FlagrelayError) -> Self {
        Self {
            error_type: err.kind().to_string(),
            error_message: err.to_string(),
        }
    }
}

/// HTTP rendering of an invocation outcome.
pub struct Relayed(pub Outcome);

impl IntoResponse for Relayed {
    fn into_response(self) -> Response {
        match self.0 {
            Outcome::Success(value) => (StatusCode::OK, Json(value)).into_response(),
            Outcome::Failure(err) => {
                (status_for(&err), Json(ErrorBody::from(&err))).into_response()
            }
        }
    }
}

pub fn status_for(err: &FlagrelayError) -> StatusCode {
    match err {
        FlagrelayError::MalformedInput(_) => StatusCode::BAD_REQUEST,
        FlagrelayError::TimedOut(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_status_for_errors() {
        assert_eq!(
            status_for(&FlagrelayError::MalformedInput("empty".to_string())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&FlagrelayError::TimedOut(Duration::from_secs(1))),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(status_for(&FlagrelayError::NoResults), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_error_body_serializes_camel_case() {
        let body = ErrorBody::from(&FlagrelayError::NoResults);
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"errorType": "SubprocessExited", "errorMessage": "No results"})
        );
    }
}
