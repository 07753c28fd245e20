//! Response Writer (spec §4, component table): copies headers (minus
//! `Content-Length`, which axum recomputes from the body) and streams the
//! body back to the client. Errors are mapped to HTTP 500 upstream by
//! `Error`'s `IntoResponse` impl (§7) rather than here.

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::Bytes;

pub fn write_response(status: StatusCode, headers: HeaderMap, body: Bytes) -> Response {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;

    let out_headers = response.headers_mut();
    for (name, value) in headers.iter() {
        if name == axum::http::header::CONTENT_LENGTH {
            continue;
        }
        out_headers.append(name.clone(), value.clone());
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_content_length_header() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::CONTENT_LENGTH, HeaderValue::from_static("42"));
        headers.insert(
            HeaderName::from_static("x-powered-by"),
            HeaderValue::from_static("qbittorrent"),
        );

        let response = write_response(StatusCode::OK, headers, Bytes::from_static(b"hi"));

        assert!(!response.headers().contains_key(axum::http::header::CONTENT_LENGTH));
        assert_eq!(
            response.headers().get("x-powered-by").unwrap(),
            "qbittorrent"
        );
    }

    #[test]
    fn preserves_status_code() {
        let response = write_response(StatusCode::NOT_FOUND, HeaderMap::new(), Bytes::new());
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
