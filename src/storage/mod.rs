mod local;
mod mount;

use std::path::{Path, PathBuf};

use hyper::body::{Body, Frame, SizeHint};
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderValue};
use hyper::{Method, Request, Response, StatusCode};

pub(crate) use local::{LocalStorage, init_cache_layout};
pub(crate) use mount::MountStorage;

use crate::NodeBody;
use crate::error::NodeError;

pub(crate) const MEASURE_CHUNK_SIZE: usize = 1024 * 1024;

/// One shared megabyte of zeros, the payload unit of every measurement
/// stream.
static MEASURE_CHUNK: [u8; MEASURE_CHUNK_SIZE] = [0; MEASURE_CHUNK_SIZE];

/// A source of file bytes and measurement streams. The variants share one
/// calling contract (see `serve_download`); dispatch is a plain match so the
/// set of supported backends is closed and visible in one place.
#[derive(Debug)]
pub(crate) enum Storage {
    Local(LocalStorage),
    Mount(MountStorage),
}

impl Storage {
    /// Stable name used in logs and per-request storage annotations.
    #[must_use]
    pub(crate) fn name(&self) -> &str {
        match self {
            Self::Local(s) => s.name(),
            Self::Mount(s) => s.name(),
        }
    }

    #[must_use]
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            Self::Mount(_) => "mount",
        }
    }

    /// Serves `hash` as a complete response.
    ///
    /// `Ok(Some((response, served)))` is a successful serve of `served`
    /// announced bytes. `Ok(None)` means the backend chose not to serve this
    /// hash and the caller should try the next one. `Err` is a hard failure;
    /// the caller may still fall back but keeps the error for diagnostics.
    pub(crate) async fn serve_download<B>(
        &self,
        req: &Request<B>,
        hash: &str,
        expected_size: i64,
    ) -> Result<Option<(Response<NodeBody>, i64)>, NodeError> {
        match self {
            Self::Local(s) => s.serve_download(req, hash, expected_size).await,
            Self::Mount(s) => s.serve_download(req, hash).await,
        }
    }

    /// Serves a measurement stream of `size_mb` one-MiB zero chunks.
    pub(crate) async fn serve_measure<B>(
        &self,
        req: &Request<B>,
        size_mb: i64,
    ) -> Result<Response<NodeBody>, NodeError> {
        match self {
            Self::Local(_) => measure_response(req, size_mb),
            Self::Mount(s) => s.serve_measure(req, size_mb),
        }
    }
}

/// Storage path of `hash` below `root`: a 256-way fan-out over the first two
/// hex digits.
#[must_use]
pub(crate) fn fan_out_path(root: &Path, hash: &str) -> PathBuf {
    root.join(&hash[..2]).join(hash)
}

/// Builds the Content-Disposition value for a user-supplied download name.
/// Names that do not survive header encoding are dropped rather than served
/// mangled.
#[must_use]
pub(crate) fn content_disposition(name: &str) -> Option<HeaderValue> {
    if name.is_empty() {
        return None;
    }
    let cleaned = name.replace(['"', '\r', '\n'], "");
    HeaderValue::try_from(format!("attachment; filename=\"{cleaned}\"")).ok()
}

pub(crate) fn measure_response<B>(
    req: &Request<B>,
    size_mb: i64,
) -> Result<Response<NodeBody>, NodeError> {
    let chunks = u64::try_from(size_mb).expect("measure size was validated as non-negative");
    let total = chunks * MEASURE_CHUNK_SIZE as u64;

    let body = if req.method() == Method::HEAD {
        crate::empty()
    } else {
        NodeBody::new(MeasureBody { chunks_left: chunks })
    };

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(
            CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        )
        .header(CONTENT_LENGTH, HeaderValue::from(total))
        .body(body)?;
    Ok(response)
}

struct MeasureBody {
    chunks_left: u64,
}

impl Body for MeasureBody {
    type Data = bytes::Bytes;
    type Error = NodeError;

    fn poll_frame(
        mut self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        if self.chunks_left == 0 {
            return std::task::Poll::Ready(None);
        }
        self.chunks_left -= 1;
        std::task::Poll::Ready(Some(Ok(Frame::data(bytes::Bytes::from_static(
            &MEASURE_CHUNK,
        )))))
    }

    fn is_end_stream(&self) -> bool {
        self.chunks_left == 0
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.chunks_left * MEASURE_CHUNK_SIZE as u64)
    }
}
