use axum::{
    http::{HeaderValue, StatusCode, header::CONTENT_TYPE},
    response::IntoResponse,
};
use common::api::StreamFrame;
use tracing::error;

use crate::error::AppError;
use crate::streaming;

pub(crate) fn map_service_error<E>(err: E) -> AppError
where
    E: Into<anyhow::Error>,
{
    err.into().into()
}

/// Plain-text `<message>\n`. `bound` errors become a 200 JSON stream with one
/// error frame.
pub(crate) fn into_response(err: AppError) -> axum::response::Response {
    let mut response = if err.code == "bound" {
        streaming::frames_response(&[StreamFrame::error(err.message.clone())])
    } else {
        if err.status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(code = err.code, message = %err.message, "request failed");
        }
        let mut response = (err.status, format!("{}\n", err.message)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    };
    if let Some(headers) = err.headers.as_deref() {
        for (name, value) in headers.iter() {
            response.headers_mut().insert(name.clone(), value.clone());
        }
    }
    response
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        into_response(self)
    }
}
