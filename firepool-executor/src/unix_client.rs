//! Minimal HTTP client for the Firecracker API socket.
//!
//! Firecracker serves its management API on a Unix socket, which reqwest
//! cannot dial, so requests go through hyper over a `UnixStream`.

use std::path::Path;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, Response, Uri};
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;

use crate::ExecutorError;

/// Send a JSON request to a Firecracker API socket.
///
/// `uri_path` is the path component only (e.g. `/boot-source`).
///
/// # Errors
/// Returns [`ExecutorError::ApiError`] on connection errors and non-2xx
/// responses, with the response body included.
pub(crate) async fn api_request(
    socket_path: &Path,
    method: Method,
    uri_path: &str,
    body: Option<&serde_json::Value>,
) -> Result<String, ExecutorError> {
    let stream = UnixStream::connect(socket_path)
        .await
        .map_err(|e| ExecutorError::ApiError(format!("connect to {}: {e}", socket_path.display())))?;

    let io = TokioIo::new(stream);

    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| ExecutorError::ApiError(format!("HTTP handshake: {e}")))?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!(error = %e, "firecracker API connection closed");
        }
    });

    let body_bytes = body.map(|b| Bytes::from(b.to_string())).unwrap_or_default();
    let content_len = body_bytes.len();

    let uri: Uri = uri_path
        .parse()
        .map_err(|e| ExecutorError::ApiError(format!("invalid URI path {uri_path}: {e}")))?;

    let mut builder = Request::builder()
        .method(method.clone())
        .uri(uri)
        .header("Host", "localhost")
        .header("Accept", "application/json");

    if content_len > 0 {
        builder = builder.header("Content-Type", "application/json");
        builder = builder.header("Content-Length", content_len.to_string());
    }

    let req = builder
        .body(Full::new(body_bytes))
        .map_err(|e| ExecutorError::ApiError(format!("build request: {e}")))?;

    let resp: Response<_> = sender
        .send_request(req)
        .await
        .map_err(|e| ExecutorError::ApiError(format!("send request: {e}")))?;

    let status = resp.status();
    let body_bytes = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| ExecutorError::ApiError(format!("read response body: {e}")))?
        .to_bytes();

    let body_str = String::from_utf8_lossy(&body_bytes).into_owned();

    if !status.is_success() {
        return Err(ExecutorError::ApiError(format!(
            "{method} {uri_path}: HTTP {status}: {body_str}"
        )));
    }

    Ok(body_str)
}
