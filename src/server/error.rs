use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

pub type AppResult<T> = Result<T, Error>;

/// relay error taxonomy - client input problems never reach upstream,
/// upstream problems surface with their diagnostic but never a stack trace
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    // non-2xx status, network error or timeout from the origin
    #[error("upstream fetch failed: {message}")]
    UpstreamFetch {
        status: Option<u16>,
        message: String,
    },

    #[error("download failed: {0}")]
    DownloadFailed(String),

    #[error("internal server error")]
    InternalServerError,

    #[error("{0}")]
    InternalServerErrorWithContext(String),
}

impl Error {
    /// map a reqwest failure into the upstream variant, keeping whatever
    /// status code the origin managed to send
    pub fn from_upstream(err: reqwest::Error) -> Self {
        Self::UpstreamFetch {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::UpstreamFetch { .. }
            | Self::DownloadFailed(_)
            | Self::InternalServerError
            | Self::InternalServerErrorWithContext(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status.is_server_error() {
            error!("request failed: {}", self);
        }

        // short json diagnostic, the message is everything the client gets
        let body = Json(json!({ "error": self.to_string() }));

        (status, body).into_response()
    }
}
