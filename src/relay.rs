//! Upstream fetches and fixed-size chunk relaying.
//!
//! Playlists are fetched whole (they are small and must be rewritten);
//! segments and direct video are streamed through without buffering, cut
//! into fixed-size chunks. Every request is bounded: segments by a timeout on
//! the whole transfer, direct video by a timeout on each wait for the next
//! body chunk. Nothing here retries; HLS players re-poll on their own.

use crate::cache::CachedPlaylist;
use crate::error::{ProxyError, Result};
use axum::body::Body;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::Response;
use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, BoxStream};
use futures_util::{Stream, StreamExt, TryStreamExt};
use reqwest::Client;
use reqwest::header::HeaderMap;
use std::convert::Infallible;
use std::io;
use std::time::Duration;
use tracing::{debug, warn};

/// Chunk size for playlist bodies and direct (non-HLS) video.
pub const PLAYLIST_CHUNK_SIZE: usize = 1024 * 1024;

/// Chunk size for media segments.
pub const SEGMENT_CHUNK_SIZE: usize = 512 * 1024;

/// Default timeout for playlist fetches.
pub const DEFAULT_PLAYLIST_TIMEOUT: Duration = Duration::from_secs(15);

/// Default timeout for segment transfers, body included.
pub const DEFAULT_SEGMENT_TIMEOUT: Duration = Duration::from_secs(20);

pub const HLS_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

/// Playlist text as served by the upstream.
#[derive(Debug, Clone)]
pub struct FetchedPlaylist {
    pub text: String,
    /// URL after redirects; relative references resolve against this
    pub final_url: String,
}

/// Fetch a playlist body with a bounded timeout.
///
/// # Errors
/// - [`ProxyError::UpstreamError`] on a non-2xx status
/// - [`ProxyError::UpstreamUnreachable`] on network failure or timeout
pub async fn fetch_playlist(
    client: &Client,
    headers: &HeaderMap,
    url: &str,
    timeout: Duration,
) -> Result<FetchedPlaylist> {
    debug!("Fetching playlist from upstream: {}", url);

    let response = client
        .get(url)
        .headers(headers.clone())
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| unreachable(url, e))?;

    let status = response.status();
    if !status.is_success() {
        warn!("Upstream playlist {} returned {}", url, status);
        return Err(ProxyError::UpstreamError {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    let final_url = response.url().to_string();
    let text = response.text().await.map_err(|e| unreachable(url, e))?;

    Ok(FetchedPlaylist { text, final_url })
}

/// How long an upstream stream may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTimeout {
    /// Cap on the whole transfer, body included (segments)
    Total(Duration),
    /// Cap on the response head and on every gap between body chunks
    /// (long-running direct video)
    Idle(Duration),
}

/// An upstream response whose body has not been read yet.
pub struct UpstreamStream {
    pub status: StatusCode,
    pub content_type: Option<HeaderValue>,
    pub content_length: Option<HeaderValue>,
    pub content_range: Option<HeaderValue>,
    body: BoxStream<'static, io::Result<Bytes>>,
}

impl std::fmt::Debug for UpstreamStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamStream")
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .field("content_range", &self.content_range)
            .finish_non_exhaustive()
    }
}

/// Open a streaming GET, forwarding the client's `Range` header verbatim.
///
/// Only 200 and 206 are relayed; anything else becomes an error before any
/// byte reaches the client. With [`StreamTimeout::Total`] the timeout also
/// covers the body; with [`StreamTimeout::Idle`] a body that stalls longer
/// than the limit ends with a `TimedOut` error.
pub async fn open_stream(
    client: &Client,
    headers: &HeaderMap,
    url: &str,
    range: Option<&HeaderValue>,
    timeout: StreamTimeout,
) -> Result<UpstreamStream> {
    let mut request = client.get(url).headers(headers.clone());
    if let Some(range) = range {
        request = request.header(header::RANGE, range.clone());
    }

    let response = match timeout {
        StreamTimeout::Total(limit) => request
            .timeout(limit)
            .send()
            .await
            .map_err(|e| unreachable(url, e))?,
        StreamTimeout::Idle(limit) => tokio::time::timeout(limit, request.send())
            .await
            .map_err(|_| {
                warn!("Upstream {} sent no response within {:?}", url, limit);
                ProxyError::UpstreamUnreachable {
                    url: url.to_string(),
                    reason: format!("no response within {:?}", limit),
                    timed_out: true,
                }
            })?
            .map_err(|e| unreachable(url, e))?,
    };
    let status = response.status();

    if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
        warn!("Upstream {} returned {}", url, status);
        return Err(ProxyError::UpstreamError {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    let upstream_headers = response.headers();
    let content_type = upstream_headers.get(header::CONTENT_TYPE).cloned();
    let content_length = upstream_headers.get(header::CONTENT_LENGTH).cloned();
    let content_range = upstream_headers.get(header::CONTENT_RANGE).cloned();

    let source = url.to_string();
    let body = response
        .bytes_stream()
        .inspect_err(move |e| warn!("Upstream body error for {}: {}", source, e))
        .map_err(io::Error::other)
        .boxed();
    let body = match timeout {
        StreamTimeout::Total(_) => body,
        StreamTimeout::Idle(limit) => idle_bounded(body, limit, url.to_string()),
    };

    Ok(UpstreamStream {
        status,
        content_type,
        content_length,
        content_range,
        body,
    })
}

impl UpstreamStream {
    /// Relay downstream in `chunk_size` chunks.
    ///
    /// `content_type` overrides the upstream type when set.
    pub fn into_response(self, content_type: Option<&'static str>, chunk_size: usize) -> Response {
        let content_type = match content_type {
            Some(ct) => HeaderValue::from_static(ct),
            None => self
                .content_type
                .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream")),
        };

        let mut response = Response::new(Body::from_stream(rechunk(self.body, chunk_size)));
        *response.status_mut() = self.status;

        let headers = response.headers_mut();
        headers.insert(header::CONTENT_TYPE, content_type);
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        if let Some(length) = self.content_length {
            headers.insert(header::CONTENT_LENGTH, length);
        }
        if let Some(range) = self.content_range {
            headers.insert(header::CONTENT_RANGE, range);
        }

        response
    }
}

/// Serve a cached playlist.
///
/// `Cache-Control` never lets a downstream cache keep the body past the
/// entry's own expiry, and `X-Cache-Buster` carries the fill generation.
pub fn playlist_response(entry: &CachedPlaylist) -> Response {
    let bytes = Bytes::copy_from_slice(entry.body.as_bytes());
    let length = bytes.len();
    let body = Body::from_stream(rechunk(
        stream::once(async move { Ok::<_, Infallible>(bytes) }),
        PLAYLIST_CHUNK_SIZE,
    ));

    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(HLS_CONTENT_TYPE));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(header::CACHE_CONTROL, max_age(entry.remaining()));
    headers.insert("x-cache-buster", HeaderValue::from(entry.generation));

    response
}

fn max_age(remaining: Duration) -> HeaderValue {
    HeaderValue::from_str(&format!("public, max-age={}", remaining.as_secs()))
        .unwrap_or_else(|_| HeaderValue::from_static("no-cache"))
}

/// Re-cut a byte stream into chunks of exactly `chunk_size` bytes.
///
/// Every chunk except the last is full-sized. An upstream error is passed
/// through once and ends the stream; buffered bytes before it are dropped.
pub fn rechunk<S, E>(stream: S, chunk_size: usize) -> impl Stream<Item = std::result::Result<Bytes, E>> + Send + 'static
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: Send + 'static,
{
    struct State<S> {
        inner: std::pin::Pin<Box<S>>,
        buffer: BytesMut,
        done: bool,
    }

    let chunk_size = chunk_size.max(1);
    let state = State {
        inner: Box::pin(stream),
        buffer: BytesMut::new(),
        done: false,
    };

    stream::unfold(state, move |mut state| async move {
        loop {
            if state.buffer.len() >= chunk_size {
                let chunk = state.buffer.split_to(chunk_size).freeze();
                return Some((Ok(chunk), state));
            }
            if state.done {
                if state.buffer.is_empty() {
                    return None;
                }
                let chunk = state.buffer.split().freeze();
                return Some((Ok(chunk), state));
            }
            match state.inner.next().await {
                Some(Ok(bytes)) => state.buffer.extend_from_slice(&bytes),
                Some(Err(e)) => {
                    state.done = true;
                    state.buffer.clear();
                    return Some((Err(e), state));
                }
                None => state.done = true,
            }
        }
    })
}

/// End `body` with a `TimedOut` error once a chunk takes longer than `idle`.
fn idle_bounded(
    body: BoxStream<'static, io::Result<Bytes>>,
    idle: Duration,
    url: String,
) -> BoxStream<'static, io::Result<Bytes>> {
    stream::unfold(Some(body), move |body| {
        let url = url.clone();
        async move {
            let mut body = body?;
            match tokio::time::timeout(idle, body.next()).await {
                Ok(Some(item)) => Some((item, Some(body))),
                Ok(None) => None,
                Err(_) => {
                    warn!("Upstream {} stalled for {:?}, closing relay", url, idle);
                    let stalled = io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no body data within {:?}", idle),
                    );
                    Some((Err(stalled), None))
                }
            }
        }
    })
    .boxed()
}

fn unreachable(url: &str, e: reqwest::Error) -> ProxyError {
    warn!("Upstream request to {} failed: {}", url, e);
    ProxyError::UpstreamUnreachable {
        url: url.to_string(),
        timed_out: e.is_timeout(),
        reason: e.to_string(),
    }
}
