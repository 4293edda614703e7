use std::sync::Arc;

use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::{Request, Response, StatusCode};
use log::debug;

use crate::access::RealPath;
use crate::cluster::Cluster;
use crate::sign::now_unix_millis;
use crate::{APP_VERSION, NodeBody, quick_response};

/// Minimal `/api/v0` surface: liveness and node status. The full management
/// API lives with the dashboard frontend collaborator, not in the core.
pub(crate) async fn serve(
    cluster: &Arc<Cluster>,
    req: &Request<Incoming>,
    sub: &str,
) -> Response<NodeBody> {
    match sub {
        "ping" => json_response(serde_json::json!({
            "version": APP_VERSION,
            "time": now_unix_millis(),
        })),
        "status" => {
            let (hits, hbts, stat_hits, stat_hbts) = cluster.counters();
            let accesses = cluster
                .stats
                .accesses
                .read()
                .expect("other users should not panic")
                .clone();
            let storages: Vec<serde_json::Value> = cluster
                .storages()
                .iter()
                .zip(cluster.storage_weights())
                .map(|(sto, weight)| {
                    serde_json::json!({
                        "name": sto.name(),
                        "type": sto.kind(),
                        "weight": weight,
                    })
                })
                .collect();
            json_response(serde_json::json!({
                "enabled": cluster.is_enabled(),
                "hits": hits,
                "bytes": hbts,
                "stat_hits": stat_hits,
                "stat_bytes": stat_hbts,
                "indexed_files": cluster.file_index.len(),
                "buf_slots_free": cluster.buf_slots().len(),
                "buf_slots": cluster.buf_slots().cap(),
                "accesses": accesses,
                "storages": storages,
            }))
        }
        _ => {
            if let Some(path) = req.extensions().get::<RealPath>() {
                debug!("Unknown api endpoint {}", path.0);
            }
            quick_response(StatusCode::NOT_FOUND, "404 page not found")
        }
    }
}

#[must_use]
fn json_response(value: serde_json::Value) -> Response<NodeBody> {
    let body = serde_json::to_vec(&value).expect("JSON value serializes");
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
        .body(crate::full(body))
        .expect("response is valid")
}
