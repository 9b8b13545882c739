use anyhow::{Context, Result};
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, Method, Response};
use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, Stream, StreamExt};
use reqwest::{Client, Url};
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid target url: {0}")]
    InvalidTarget(String),
    #[error("upstream unreachable: {0}")]
    Unreachable(String),
    #[error("failed to build response: {0}")]
    Response(String),
}

/// Called once with everything that was streamed to the caller.
pub type CaptureFn = Box<dyn FnOnce(Bytes) + Send + 'static>;

/// Forwards authorized requests to the backend named by the caller.
#[derive(Debug, Clone)]
pub struct GatewayProxy {
    client: Client,
    timeout: Duration,
}

impl GatewayProxy {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("creating HTTP client")?;
        Ok(Self { client, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send the request upstream exactly once and stream the reply back.
    ///
    /// The response body is teed: every chunk delivered to the caller is also
    /// appended to a buffer which is handed to `on_complete` when the stream
    /// finishes or is dropped.
    pub async fn forward(
        &self,
        method: Method,
        target: &str,
        headers: &HeaderMap,
        body: Bytes,
        on_complete: CaptureFn,
    ) -> Result<Response<Body>, ProxyError> {
        let url = parse_target(target)?;
        debug!(%method, target = %url, body_len = body.len(), "forwarding request upstream");

        let upstream = self
            .client
            .request(method, url)
            .headers(outbound_headers(headers))
            .body(body)
            .send()
            .await
            .map_err(|e| {
                let reason = if e.is_timeout() {
                    format!("timed out after {}s", self.timeout.as_secs())
                } else {
                    e.to_string()
                };
                warn!(error = %reason, "upstream request failed");
                ProxyError::Unreachable(reason)
            })?;

        let mut builder = Response::builder().status(upstream.status());
        if let Some(out) = builder.headers_mut() {
            for (name, value) in upstream.headers() {
                if !is_hop_by_hop(name) {
                    out.append(name.clone(), value.clone());
                }
            }
        }

        let stream = TeeStream::new(upstream.bytes_stream().boxed(), on_complete);
        builder
            .body(Body::from_stream(stream))
            .map_err(|e| ProxyError::Response(e.to_string()))
    }
}

pub fn parse_target(target: &str) -> Result<Url, ProxyError> {
    let url = Url::parse(target).map_err(|e| ProxyError::InvalidTarget(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ProxyError::InvalidTarget(format!("unsupported scheme {other}"))),
    }
}

/// Inbound headers minus `Host` and the framing headers; the client
/// recomputes them for the target and the buffered body.
pub fn outbound_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    for name in [header::HOST, header::CONTENT_LENGTH, header::TRANSFER_ENCODING, header::CONNECTION] {
        out.remove(name);
    }
    out
}

// Framing headers describe the upstream connection, not the payload.
fn is_hop_by_hop(name: &HeaderName) -> bool {
    name == header::TRANSFER_ENCODING || name == header::CONNECTION
}

struct TeeStream {
    inner: BoxStream<'static, reqwest::Result<Bytes>>,
    captured: BytesMut,
    on_complete: Option<CaptureFn>,
}

impl TeeStream {
    fn new(inner: BoxStream<'static, reqwest::Result<Bytes>>, on_complete: CaptureFn) -> Self {
        Self {
            inner,
            captured: BytesMut::new(),
            on_complete: Some(on_complete),
        }
    }

    fn finish(&mut self) {
        if let Some(callback) = self.on_complete.take() {
            callback(self.captured.split().freeze());
        }
    }
}

impl Stream for TeeStream {
    type Item = reqwest::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.captured.extend_from_slice(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

impl Drop for TeeStream {
    fn drop(&mut self) {
        self.finish();
    }
}
