use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::header::USER_AGENT;
use hyper::{Method, Request, Response, StatusCode};
use log::{debug, info};
use pin_project::{pin_project, pinned_drop};
use tokio::sync::mpsc;

use crate::NodeBody;
use crate::cluster::Cluster;
use crate::humanfmt::HumanFmt;
use crate::stats::AccessMetric;

/// Marker extension: internal self-check requests set this so their hits are
/// kept out of the keepalive report.
#[derive(Clone, Copy, Debug)]
pub(crate) struct NoKeepaliveRecord;

/// Resolved client address, available to every handler.
#[derive(Clone, Debug)]
pub(crate) struct RealAddr(pub(crate) String);

/// Request path as received, before any prefix stripping.
#[derive(Clone, Debug)]
pub(crate) struct RealPath(pub(crate) String);

/// Per-request annotation map rendered into the access log line.
/// Cloned handles share one map; the map never outlives its request cycle.
#[derive(Clone, Debug, Default)]
pub(crate) struct AccessExtra {
    inner: Arc<Mutex<BTreeMap<String, String>>>,
}

impl AccessExtra {
    pub(crate) fn set(&self, key: &str, value: &str) {
        self.inner
            .lock()
            .expect("other users should not panic")
            .insert(key.to_string(), value.to_string());
    }

    #[must_use]
    pub(crate) fn snapshot(&self) -> BTreeMap<String, String> {
        self.inner
            .lock()
            .expect("other users should not panic")
            .clone()
    }
}

pub(crate) fn set_access_info<B>(req: &Request<B>, key: &str, value: &str) {
    if let Some(extra) = req.extensions().get::<AccessExtra>() {
        extra.set(key, value);
    }
}

/// First product token of a User-Agent line: `"curl/7.81.0 extra"` counts
/// as `"curl"`.
#[must_use]
pub(crate) fn ua_token(ua: &str) -> String {
    let first = ua.split(' ').next().unwrap_or("");
    let product = first.split('/').next().unwrap_or("");
    product.to_string()
}

/// Client address resolution: the first X-Forwarded-For hop when the proxy
/// in front of the node is trusted, the connection peer otherwise.
#[must_use]
pub(crate) fn resolve_addr(trusted_forwarded: bool, forwarded: Option<&str>, peer: IpAddr) -> String {
    if trusted_forwarded {
        if let Some(forwarded) = forwarded {
            let first = match forwarded.split_once(',') {
                Some((first, _)) => first,
                None => forwarded,
            };
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    peer.to_canonical().to_string()
}

struct PreAccessRecord<'a> {
    addr: &'a str,
    method: &'a Method,
    uri: &'a str,
    ua: &'a str,
}

impl std::fmt::Display for PreAccessRecord<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Serving {:<15} | {:<4} {} | {:?}",
            self.addr, self.method, self.uri, self.ua
        )
    }
}

struct AccessRecord {
    status: u16,
    used: Duration,
    content: u64,
    addr: String,
    proto: String,
    method: Method,
    uri: String,
    ua: String,
    extra: BTreeMap<String, String>,
}

impl std::fmt::Display for AccessRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Serve {:>3} | {:>10} | {:>7} | {:<15} | {} | {:<4} {} | {:?}",
            self.status,
            format!("{}", HumanFmt::Time(self.used)),
            format!("{}", HumanFmt::Bytes(self.content as f64)),
            self.addr,
            self.proto,
            self.method,
            self.uri,
            self.ua,
        )?;
        if !self.extra.is_empty() {
            let extra = serde_json::to_string(&self.extra)
                .expect("string map serializes to JSON");
            write!(f, " | {extra}")?;
        }
        Ok(())
    }
}

/// Wraps every request: resolves the client address, seeds the request
/// extensions, logs pre-access and access records, and reports served
/// downloads to the aggregator once the response body has been written out.
pub(crate) async fn record_middleware(
    cluster: &Arc<Cluster>,
    peer: SocketAddr,
    mut req: Request<Incoming>,
) -> Response<NodeBody> {
    let ua = req
        .headers()
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let addr = resolve_addr(
        cluster.config().trusted_x_forwarded_for,
        req.headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok()),
        peer.ip(),
    );

    let start = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().to_string();
    let path = req.uri().path().to_string();
    let proto = format!("{:?}", req.version());

    debug!(
        "{}",
        PreAccessRecord {
            addr: &addr,
            method: &method,
            uri: &uri,
            ua: &ua,
        }
    );

    let extra = AccessExtra::default();
    req.extensions_mut().insert(RealAddr(addr.clone()));
    req.extensions_mut().insert(RealPath(path.clone()));
    req.extensions_mut().insert(extra.clone());

    let response = crate::handler::route(cluster, req).await;

    let (parts, body) = response.into_parts();
    let body = RecordBody {
        inner: body,
        wrote: 0,
        state: Some(RecordState {
            status: parts.status,
            start,
            addr,
            proto,
            method,
            uri,
            ua,
            path,
            extra,
            record_tx: cluster.record_sender(),
        }),
    };
    Response::from_parts(parts, NodeBody::new(body))
}

struct RecordState {
    status: StatusCode,
    start: Instant,
    addr: String,
    proto: String,
    method: Method,
    uri: String,
    ua: String,
    path: String,
    extra: AccessExtra,
    record_tx: mpsc::Sender<AccessMetric>,
}

/// Counts response bytes as they are handed to the connection. The access
/// record is emitted when the body is done (or abandoned), so it reflects
/// what actually went over the wire.
#[pin_project(PinnedDrop)]
struct RecordBody {
    #[pin]
    inner: NodeBody,
    wrote: u64,
    state: Option<RecordState>,
}

impl Body for RecordBody {
    type Data = bytes::Bytes;
    type Error = crate::error::NodeError;

    fn poll_frame(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let polled = this.inner.poll_frame(cx);
        if let std::task::Poll::Ready(Some(Ok(frame))) = &polled {
            if let Some(data) = frame.data_ref() {
                *this.wrote += data.len() as u64;
            }
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[pinned_drop]
impl PinnedDrop for RecordBody {
    fn drop(self: std::pin::Pin<&mut Self>) {
        let this = self.project();
        let Some(state) = this.state.take() else {
            return;
        };
        let used = state.start.elapsed();
        let extra = state.extra.snapshot();

        let record = AccessRecord {
            status: state.status.as_u16(),
            used,
            content: *this.wrote,
            addr: state.addr,
            proto: state.proto,
            method: state.method,
            uri: state.uri,
            ua: state.ua.clone(),
            extra,
        };
        info!("{record}");

        /* Only served responses feed the aggregator. */
        if !(state.status.is_success() || state.status.is_redirection()) {
            return;
        }
        if !state.path.starts_with("/download/") {
            return;
        }
        #[expect(clippy::cast_precision_loss)]
        let metric = AccessMetric {
            used: used.as_secs_f64(),
            bytes: record.content as f64,
            ua: ua_token(&state.ua),
            is_range: record.extra.contains_key("skip-ua-count"),
        };
        /* Non-blocking: a full channel drops the record. */
        let _ = state.record_tx.try_send(metric);
    }
}
