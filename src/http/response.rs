use bytes::Bytes;
use http_body_util::Full;
use hyper::{StatusCode, header};

use super::Response;


fn plain(status: StatusCode, body: impl Into<Bytes>) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=UTF-8")
        .body(Full::new(body.into()))
        .unwrap()
}

pub(super) fn json(status: StatusCode, body: Vec<u8>) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(body.into()))
        .unwrap()
}

pub(super) fn html(body: String) -> Response {
    Response::builder()
        .header(header::CONTENT_TYPE, "text/html; charset=UTF-8")
        .body(Full::new(body.into()))
        .unwrap()
}

pub(super) fn bad_request(msg: Option<String>) -> Response {
    plain(StatusCode::BAD_REQUEST, msg.unwrap_or_else(|| "Bad request".into()))
}

pub(super) fn not_found() -> Response {
    plain(StatusCode::NOT_FOUND, "Not found")
}

pub(super) fn method_not_allowed() -> Response {
    plain(StatusCode::METHOD_NOT_ALLOWED, "405 Method not allowed")
}

pub(super) fn internal_server_error() -> Response {
    plain(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
}
