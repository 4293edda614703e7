use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use hyper::header::{
    CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, ETAG, HeaderName,
    HeaderValue, RANGE,
};
use hyper::{Request, Response, StatusCode};
use log::debug;
use tokio::sync::{mpsc, watch};

use crate::NodeBody;
use crate::access::{NoKeepaliveRecord, RealAddr, set_access_info};
use crate::bufslots::BufSlots;
use crate::config::Config;
use crate::error::NodeError;
use crate::hashutil::{is_empty_hash, query_get};
use crate::http_range::parse_range_first_start;
use crate::quick_response;
use crate::randutil::weighted_order;
use crate::stats::{AccessMetric, RECORD_CHANNEL_CAPACITY, Stats};
use crate::storage::{Storage, content_disposition};

pub(crate) const HEADER_HASH: HeaderName = HeaderName::from_static("x-bmclapi-hash");

/// Known files of the federation, hash to size in bytes. Populated by the
/// authority-sync collaborator; the request path only reads it.
#[derive(Debug, Default)]
pub(crate) struct FileIndex {
    inner: RwLock<HashMap<String, i64>>,
}

impl FileIndex {
    #[must_use]
    pub(crate) fn cached_file_size(&self, hash: &str) -> Option<i64> {
        self.inner
            .read()
            .expect("other users should not panic")
            .get(hash)
            .copied()
    }

    pub(crate) fn apply<I: IntoIterator<Item = (String, i64)>>(&self, entries: I) {
        let mut inner = self.inner.write().expect("other users should not panic");
        inner.extend(entries);
    }

    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.inner
            .read()
            .expect("other users should not panic")
            .len()
    }
}

/// Best-effort fetch of a hash missing from the index, wired up by the hijack
/// downloader when one is configured. Resolves to the file size on success.
pub(crate) type FetchHook =
    Box<dyn Fn(String) -> Pin<Box<dyn Future<Output = Result<i64, NodeError>> + Send>> + Send + Sync>;

pub(crate) struct Cluster {
    config: &'static Config,
    storages: Vec<Storage>,
    storage_weights: Vec<u32>,
    storage_total_weight: u32,
    buf_slots: Arc<BufSlots>,

    pub(crate) file_index: FileIndex,
    pub(crate) stats: Stats,

    should_enable: AtomicBool,
    enabled_tx: watch::Sender<bool>,

    /* Served-download counters. The first pair feeds the keepalive report to
     * the authority, the second pair covers everything else. */
    hits: AtomicI64,
    hbts: AtomicI64,
    stat_hits: AtomicI64,
    stat_hbts: AtomicI64,

    record_tx: mpsc::Sender<AccessMetric>,
    fetch_hook: Option<FetchHook>,
}

impl Cluster {
    pub(crate) fn new(
        config: &'static Config,
        storages: Vec<Storage>,
        storage_weights: Vec<u32>,
        buf_slots: Arc<BufSlots>,
        fetch_hook: Option<FetchHook>,
    ) -> (Arc<Self>, mpsc::Receiver<AccessMetric>) {
        assert_eq!(
            storages.len(),
            storage_weights.len(),
            "every storage needs a weight"
        );
        let storage_total_weight = storage_weights.iter().sum();

        let (enabled_tx, _) = watch::channel(false);
        let (record_tx, record_rx) = mpsc::channel(RECORD_CHANNEL_CAPACITY);

        let cluster = Arc::new(Self {
            config,
            storages,
            storage_weights,
            storage_total_weight,
            buf_slots,
            file_index: FileIndex::default(),
            stats: Stats::default(),
            should_enable: AtomicBool::new(false),
            enabled_tx,
            hits: AtomicI64::new(0),
            hbts: AtomicI64::new(0),
            stat_hits: AtomicI64::new(0),
            stat_hbts: AtomicI64::new(0),
            record_tx,
            fetch_hook,
        });
        (cluster, record_rx)
    }

    #[must_use]
    pub(crate) fn config(&self) -> &'static Config {
        self.config
    }

    #[must_use]
    pub(crate) fn storages(&self) -> &[Storage] {
        &self.storages
    }

    #[must_use]
    pub(crate) fn storage_weights(&self) -> &[u32] {
        &self.storage_weights
    }

    #[must_use]
    pub(crate) fn buf_slots(&self) -> &Arc<BufSlots> {
        &self.buf_slots
    }

    pub(crate) fn enable(&self) {
        self.should_enable.store(true, Ordering::Release);
        self.enabled_tx.send_replace(true);
    }

    pub(crate) fn disable(&self) {
        self.should_enable.store(false, Ordering::Release);
        self.enabled_tx.send_replace(false);
    }

    #[must_use]
    pub(crate) fn is_enabled(&self) -> bool {
        self.should_enable.load(Ordering::Acquire)
    }

    #[must_use]
    pub(crate) fn subscribe_enabled(&self) -> watch::Receiver<bool> {
        self.enabled_tx.subscribe()
    }

    #[must_use]
    pub(crate) fn record_sender(&self) -> mpsc::Sender<AccessMetric> {
        self.record_tx.clone()
    }

    /// Snapshot of `(hits, hit_bytes, stat_hits, stat_hit_bytes)`.
    #[must_use]
    pub(crate) fn counters(&self) -> (i64, i64, i64, i64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.hbts.load(Ordering::Relaxed),
            self.stat_hits.load(Ordering::Relaxed),
            self.stat_hbts.load(Ordering::Relaxed),
        )
    }

    fn count_hit(&self, keepalive: bool, bytes: i64) {
        if keepalive {
            self.hits.fetch_add(1, Ordering::Relaxed);
            self.hbts.fetch_add(bytes, Ordering::Relaxed);
        } else {
            self.stat_hits.fetch_add(1, Ordering::Relaxed);
            self.stat_hbts.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    pub(crate) async fn handle_download<B>(&self, req: &Request<B>, hash: &str) -> Response<NodeBody> {
        let mut response = self.handle_download_inner(req, hash).await;
        response.headers_mut().insert(
            HEADER_HASH,
            HeaderValue::try_from(hash).expect("hash is hex"),
        );
        response
    }

    async fn handle_download_inner<B>(&self, req: &Request<B>, hash: &str) -> Response<NodeBody> {
        let keepalive = req.extensions().get::<NoKeepaliveRecord>().is_none();

        /* The well-known digests of empty input are answered inline. */
        if is_empty_hash(hash) {
            let mut builder = Response::builder()
                .status(StatusCode::OK)
                .header(
                    ETAG,
                    HeaderValue::try_from(format!("\"{hash}\"")).expect("hash is hex"),
                )
                .header(
                    CACHE_CONTROL,
                    HeaderValue::from_static("public, max-age=31536000, immutable"),
                )
                .header(
                    CONTENT_TYPE,
                    HeaderValue::from_static("application/octet-stream"),
                )
                .header(CONTENT_LENGTH, HeaderValue::from_static("0"));
            if let Some(name) = req.uri().query().and_then(|q| query_get(q, "name")) {
                if let Some(value) = content_disposition(&name) {
                    builder = builder.header(CONTENT_DISPOSITION, value);
                }
            }
            self.count_hit(keepalive, 0);
            return builder
                .body(crate::empty())
                .expect("response is valid");
        }

        if !self.is_enabled() {
            return quick_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "Cluster is not enabled yet",
            );
        }

        if let Some(range) = req.headers().get(RANGE).and_then(|v| v.to_str().ok()) {
            if let Some(start) = parse_range_first_start(range) {
                if start != 0 {
                    set_access_info(req, "skip-ua-count", "range");
                }
            }
        }

        let size = match self.file_index.cached_file_size(hash) {
            Some(size) => size,
            None => {
                let fetched = match &self.fetch_hook {
                    Some(hook) => hook(hash.to_string()).await,
                    None => Err(std::io::Error::from(std::io::ErrorKind::NotFound).into()),
                };
                match fetched {
                    Ok(size) => {
                        self.file_index.apply([(hash.to_string(), size)]);
                        size
                    }
                    Err(err) => {
                        let addr = req
                            .extensions()
                            .get::<RealAddr>()
                            .map_or("", |a| a.0.as_str());
                        debug!("Fetch of unindexed file {hash} for {addr} failed: {err}");
                        return quick_response(StatusCode::NOT_FOUND, "404 not found");
                    }
                }
            }
        };

        let mut first_err: Option<NodeError> = None;
        let mut attempted: Option<&Storage> = None;
        let mut served: Option<Response<NodeBody>> = None;
        for i in weighted_order(&self.storage_weights, self.storage_total_weight) {
            let sto = &self.storages[i];
            attempted = Some(sto);
            debug!("Checking {hash} on storage [{i}] {}", sto.name());

            match sto.serve_download(req, hash, size).await {
                Ok(Some((response, sz))) => {
                    if sz >= 0 {
                        self.count_hit(keepalive, sz);
                    }
                    served = Some(response);
                    break;
                }
                /* The backend chose not to serve this hash, try the next. */
                Ok(None) => {}
                Err(err) => {
                    debug!("File {hash} failed on storage [{i}] {}: {err}", sto.name());
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
        }
        if let Some(sto) = attempted {
            set_access_info(req, "storage", sto.name());
        }

        if let Some(response) = served {
            debug!("Download of {hash} served");
            return response;
        }
        match first_err {
            Some(err) => {
                debug!("Failed to serve download of {hash}: {err}");
                if err.is_not_exist() {
                    quick_response(StatusCode::NOT_FOUND, "404 Status Not Found")
                } else if matches!(err, NodeError::HttpStatus(_)) {
                    quick_response(StatusCode::BAD_GATEWAY, err.to_string())
                } else {
                    quick_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
                }
            }
            /* Every backend declined without an error. */
            None => quick_response(StatusCode::NOT_FOUND, "404 Status Not Found"),
        }
    }

    pub(crate) async fn handle_measure<B>(&self, req: &Request<B>, size_mb: i64) -> Response<NodeBody> {
        let Some(sto) = self.storages.first() else {
            return quick_response(StatusCode::INTERNAL_SERVER_ERROR, "no storage configured");
        };
        match sto.serve_measure(req, size_mb).await {
            Ok(response) => response,
            Err(err) => {
                log::error!("Could not serve measure {size_mb}: {err}");
                quick_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::access::AccessExtra;
    use crate::nonzero;
    use crate::storage::{LocalStorage, MountStorage, fan_out_path};

    const HASH: &str = "5d41402abc4b2a76b9719d911017c592";
    const EMPTY_MD5: &str = "d41d8cd98f00b204e9800998ecf8427e";

    fn leaked_config() -> &'static Config {
        Box::leak(Box::new(Config::default()))
    }

    fn pool() -> Arc<BufSlots> {
        Arc::new(BufSlots::new(nonzero!(2)))
    }

    fn scratch_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "bmclapi-node-cluster-{tag}-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&root);
        root
    }

    fn local_storage(root: &std::path::Path) -> Storage {
        Storage::Local(LocalStorage::new(
            "cache".to_string(),
            root.to_path_buf(),
            Arc::new(BufSlots::new(nonzero!(2))),
            CancellationToken::new(),
        ))
    }

    fn request(uri: &str) -> Request<()> {
        let mut req = Request::builder().uri(uri).body(()).unwrap();
        req.extensions_mut().insert(AccessExtra::default());
        req
    }

    #[tokio::test]
    async fn file_index_round_trip() {
        let index = FileIndex::default();
        assert_eq!(index.cached_file_size(HASH), None);
        index.apply([(HASH.to_string(), 5)]);
        assert_eq!(index.cached_file_size(HASH), Some(5));
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn empty_hash_is_served_inline() {
        let config = leaked_config();
        let (cluster, _rx) = Cluster::new(config, Vec::new(), Vec::new(), pool(), None);

        let req = request(&format!("/download/{EMPTY_MD5}?name=empty.bin"));
        let resp = cluster.handle_download(&req, EMPTY_MD5).await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get(CONTENT_LENGTH).unwrap(), "0");
        assert_eq!(
            resp.headers().get(ETAG).unwrap().to_str().unwrap(),
            format!("\"{EMPTY_MD5}\"")
        );
        assert_eq!(
            resp.headers().get(CACHE_CONTROL).unwrap(),
            "public, max-age=31536000, immutable"
        );
        assert_eq!(
            resp.headers().get(HEADER_HASH).unwrap().to_str().unwrap(),
            EMPTY_MD5
        );
        assert_eq!(cluster.counters(), (1, 0, 0, 0));
    }

    #[tokio::test]
    async fn disabled_cluster_returns_503() {
        let config = leaked_config();
        let (cluster, _rx) = Cluster::new(config, Vec::new(), Vec::new(), pool(), None);

        let resp = cluster.handle_download(&request("/x"), HASH).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn unindexed_hash_is_404_without_fetch_hook() {
        let config = leaked_config();
        let (cluster, _rx) = Cluster::new(config, Vec::new(), Vec::new(), pool(), None);
        cluster.enable();

        let resp = cluster.handle_download(&request("/x"), HASH).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn served_download_counts_hit_and_bytes() {
        let config = leaked_config();
        let root = scratch_root("hit");
        std::fs::create_dir_all(root.join("5d")).unwrap();
        std::fs::write(fan_out_path(&root, HASH), b"hello").unwrap();

        let (cluster, _rx) = Cluster::new(
            config,
            vec![local_storage(&root)],
            vec![100],
            pool(),
            None,
        );
        cluster.enable();
        cluster.file_index.apply([(HASH.to_string(), 5)]);

        let req = request(&format!("/download/{HASH}"));
        let resp = cluster.handle_download(&req, HASH).await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(HEADER_HASH).unwrap().to_str().unwrap(),
            HASH
        );
        assert_eq!(cluster.counters(), (1, 5, 0, 0));
        let extra = req.extensions().get::<AccessExtra>().unwrap().snapshot();
        assert_eq!(extra.get("storage").map(String::as_str), Some("cache"));

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn keepalive_opt_out_uses_secondary_counters() {
        let config = leaked_config();
        let (cluster, _rx) = Cluster::new(config, Vec::new(), Vec::new(), pool(), None);

        let mut req = request(&format!("/download/{EMPTY_MD5}"));
        req.extensions_mut().insert(NoKeepaliveRecord);
        let resp = cluster.handle_download(&req, EMPTY_MD5).await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(cluster.counters(), (0, 0, 1, 0));
    }

    #[tokio::test]
    async fn soft_miss_falls_back_to_next_storage() {
        let config = leaked_config();
        let empty_mount = scratch_root("fallback-mount");
        std::fs::create_dir_all(&empty_mount).unwrap();
        let root = scratch_root("fallback-local");
        std::fs::create_dir_all(root.join("5d")).unwrap();
        std::fs::write(fan_out_path(&root, HASH), b"hello").unwrap();

        let storages = vec![
            Storage::Mount(MountStorage::new(
                "mnt".to_string(),
                empty_mount.clone(),
                "https://cdn.example.com/files".to_string(),
            )),
            local_storage(&root),
        ];
        /* Zero weight on the second keeps the walk starting at the mount. */
        let (cluster, _rx) = Cluster::new(config, storages, vec![10, 0], pool(), None);
        cluster.enable();
        cluster.file_index.apply([(HASH.to_string(), 5)]);

        let req = request(&format!("/download/{HASH}"));
        let resp = cluster.handle_download(&req, HASH).await;

        assert_eq!(resp.status(), StatusCode::OK);
        let extra = req.extensions().get::<AccessExtra>().unwrap().snapshot();
        assert_eq!(extra.get("storage").map(String::as_str), Some("cache"));
        assert_eq!(cluster.counters(), (1, 5, 0, 0));

        std::fs::remove_dir_all(&empty_mount).unwrap();
        std::fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn all_backends_missing_is_404() {
        let config = leaked_config();
        let root_a = scratch_root("miss-a");
        let root_b = scratch_root("miss-b");
        crate::storage::init_cache_layout(&root_a).unwrap();
        crate::storage::init_cache_layout(&root_b).unwrap();

        let storages = vec![
            local_storage(&root_a),
            local_storage(&root_b),
        ];
        let (cluster, _rx) = Cluster::new(config, storages, vec![1, 1], pool(), None);
        cluster.enable();
        cluster.file_index.apply([(HASH.to_string(), 5)]);

        let resp = cluster
            .handle_download(&request(&format!("/download/{HASH}")), HASH)
            .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(cluster.counters(), (0, 0, 0, 0));

        std::fs::remove_dir_all(&root_a).unwrap();
        std::fs::remove_dir_all(&root_b).unwrap();
    }

    #[tokio::test]
    async fn range_request_annotates_skip_ua_count() {
        let config = leaked_config();
        let root = scratch_root("range-extra");
        std::fs::create_dir_all(root.join("5d")).unwrap();
        std::fs::write(fan_out_path(&root, HASH), b"hello world").unwrap();

        let (cluster, _rx) = Cluster::new(
            config,
            vec![local_storage(&root)],
            vec![1],
            pool(),
            None,
        );
        cluster.enable();
        cluster.file_index.apply([(HASH.to_string(), 11)]);

        let mut req = request(&format!("/download/{HASH}"));
        req.headers_mut()
            .insert(RANGE, HeaderValue::from_static("bytes=100-200"));
        let _resp = cluster.handle_download(&req, HASH).await;

        let extra = req.extensions().get::<AccessExtra>().unwrap().snapshot();
        assert_eq!(
            extra.get("skip-ua-count").map(String::as_str),
            Some("range")
        );

        /* A range starting at zero still counts. */
        let mut req = request(&format!("/download/{HASH}"));
        req.headers_mut()
            .insert(RANGE, HeaderValue::from_static("bytes=0-4"));
        let _resp = cluster.handle_download(&req, HASH).await;
        let extra = req.extensions().get::<AccessExtra>().unwrap().snapshot();
        assert_eq!(extra.get("skip-ua-count"), None);

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn fetch_hook_supplies_missing_size() {
        let config = leaked_config();
        let root = scratch_root("hook");
        std::fs::create_dir_all(root.join("5d")).unwrap();
        std::fs::write(fan_out_path(&root, HASH), b"hello").unwrap();

        let hook: FetchHook = Box::new(|_hash| Box::pin(async { Ok(5) }));
        let (cluster, _rx) = Cluster::new(
            config,
            vec![local_storage(&root)],
            vec![1],
            pool(),
            Some(hook),
        );
        cluster.enable();

        let resp = cluster
            .handle_download(&request(&format!("/download/{HASH}")), HASH)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);

        std::fs::remove_dir_all(&root).unwrap();
    }
}
