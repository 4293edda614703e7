use std::cmp::min;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hyper::body::{Body, Frame, SizeHint};
use hyper::header::{
    ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, ETAG,
    HeaderValue, RANGE,
};
use hyper::{Method, Request, Response, StatusCode};
use tokio::io::{AsyncRead as _, AsyncSeekExt as _, ReadBuf};
use tokio_util::sync::CancellationToken;

use crate::NodeBody;
use crate::bufslots::{BufSlots, SLOT_BUF_SIZE, SlotGuard};
use crate::error::NodeError;
use crate::hashutil::query_get;
use crate::http_range::parse_range;
use crate::storage::{content_disposition, fan_out_path};

/// Creates the 256-way fan-out directories below a local storage root.
/// Existing directories are left alone; the layout is append-only.
pub(crate) fn init_cache_layout(root: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(root)?;
    for i in 0..0x100u32 {
        match std::fs::create_dir(root.join(format!("{i:02x}"))) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

#[derive(Debug)]
pub(crate) struct LocalStorage {
    name: String,
    root: PathBuf,
    slots: Arc<BufSlots>,
    shutdown: CancellationToken,
}

impl LocalStorage {
    #[must_use]
    pub(crate) fn new(
        name: String,
        root: PathBuf,
        slots: Arc<BufSlots>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            name,
            root,
            slots,
            shutdown,
        }
    }

    #[must_use]
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Serves a file from the fan-out layout. A missing file is a hard error
    /// so the dispatcher can answer 404 when no backend has the hash.
    pub(crate) async fn serve_download<B>(
        &self,
        req: &Request<B>,
        hash: &str,
        _expected_size: i64,
    ) -> Result<Option<(Response<NodeBody>, i64)>, NodeError> {
        let path = fan_out_path(&self.root, hash);
        let mut file = tokio::fs::File::open(&path).await?;
        let file_size = file.metadata().await?.len();

        let range = req.headers().get(RANGE).and_then(|v| v.to_str().ok());
        let (status, content_length, content_range) = match parse_range(range, file_size) {
            Some((content_range, start, length)) => {
                if start != 0 {
                    file.seek(SeekFrom::Start(start)).await?;
                }
                (StatusCode::PARTIAL_CONTENT, length, Some(content_range))
            }
            None => (StatusCode::OK, file_size, None),
        };

        let mut builder = Response::builder()
            .status(status)
            .header(
                CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            )
            .header(CONTENT_LENGTH, HeaderValue::from(content_length))
            .header(ACCEPT_RANGES, HeaderValue::from_static("bytes"))
            .header(
                ETAG,
                HeaderValue::try_from(format!("\"{hash}\"")).expect("hash is hex"),
            );
        if let Some(content_range) = content_range {
            builder = builder.header(
                CONTENT_RANGE,
                HeaderValue::try_from(content_range).expect("content range is ASCII"),
            );
        }
        if let Some(name) = req.uri().query().and_then(|q| query_get(q, "name")) {
            if let Some(value) = content_disposition(&name) {
                builder = builder.header(CONTENT_DISPOSITION, value);
            }
        }

        let served = i64::try_from(content_length).expect("file size fits in i64");

        if req.method() == Method::HEAD {
            return Ok(Some((builder.body(crate::empty())?, served)));
        }

        /* The slot both bounds concurrent copies node-wide and provides the
         * read buffer for this transfer. */
        let Some(slot) = self.slots.alloc(&self.shutdown).await else {
            return Err(std::io::Error::other("node is shutting down").into());
        };
        log::debug!("Streaming {hash} from {} through slot {}", self.name, slot.id());

        let body = SlotFileBody {
            file,
            remaining: content_length,
            slot,
        };
        Ok(Some((builder.body(NodeBody::new(body))?, served)))
    }
}

/// Streams a file through a pooled slot buffer, one read per frame.
/// Dropping the body (client gone, stream finished) releases the slot.
struct SlotFileBody {
    file: tokio::fs::File,
    remaining: u64,
    slot: SlotGuard,
}

impl Body for SlotFileBody {
    type Data = bytes::Bytes;
    type Error = NodeError;

    fn poll_frame(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.remaining == 0 {
            return std::task::Poll::Ready(None);
        }

        #[expect(clippy::cast_possible_truncation)]
        let want = min(this.remaining, SLOT_BUF_SIZE as u64) as usize;
        let mut read_buf = ReadBuf::new(&mut this.slot.buf_mut()[..want]);
        match std::pin::Pin::new(&mut this.file).poll_read(cx, &mut read_buf) {
            std::task::Poll::Pending => std::task::Poll::Pending,
            std::task::Poll::Ready(Err(err)) => std::task::Poll::Ready(Some(Err(err.into()))),
            std::task::Poll::Ready(Ok(())) => {
                let filled = read_buf.filled();
                if filled.is_empty() {
                    /* File ended before the announced length. */
                    return std::task::Poll::Ready(Some(Err(std::io::Error::from(
                        std::io::ErrorKind::UnexpectedEof,
                    )
                    .into())));
                }
                this.remaining -= filled.len() as u64;
                std::task::Poll::Ready(Some(Ok(Frame::data(bytes::Bytes::copy_from_slice(
                    filled,
                )))))
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.remaining == 0
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.remaining)
    }
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt as _;

    use super::*;
    use crate::nonzero;

    fn scratch_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "bmclapi-node-rs-test-{tag}-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&root);
        root
    }

    fn storage(root: &Path) -> LocalStorage {
        LocalStorage::new(
            "cache".to_string(),
            root.to_path_buf(),
            Arc::new(BufSlots::new(nonzero!(2))),
            CancellationToken::new(),
        )
    }

    const HASH: &str = "5d41402abc4b2a76b9719d911017c592";

    #[test]
    fn cache_layout_creates_fan_out() {
        let root = scratch_root("layout");
        init_cache_layout(&root).unwrap();
        assert!(root.join("00").is_dir());
        assert!(root.join("ff").is_dir());
        /* idempotent */
        init_cache_layout(&root).unwrap();
        std::fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn serves_whole_file_with_headers() {
        let root = scratch_root("serve");
        std::fs::create_dir_all(root.join("5d")).unwrap();
        std::fs::write(fan_out_path(&root, HASH), b"hello").unwrap();

        let sto = storage(&root);
        let req = Request::builder()
            .uri(format!("/download/{HASH}?name=client.jar"))
            .body(())
            .unwrap();
        let (resp, served) = sto.serve_download(&req, HASH, 5).await.unwrap().unwrap();

        assert_eq!(served, 5);
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(ETAG).unwrap().to_str().unwrap(),
            format!("\"{HASH}\"")
        );
        assert_eq!(
            resp.headers().get(CONTENT_DISPOSITION).unwrap(),
            "attachment; filename=\"client.jar\""
        );
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"hello");

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn serves_partial_content() {
        let root = scratch_root("range");
        std::fs::create_dir_all(root.join("5d")).unwrap();
        std::fs::write(fan_out_path(&root, HASH), b"hello world").unwrap();

        let sto = storage(&root);
        let req = Request::builder()
            .uri(format!("/download/{HASH}"))
            .header(RANGE, "bytes=6-10")
            .body(())
            .unwrap();
        let (resp, served) = sto.serve_download(&req, HASH, 11).await.unwrap().unwrap();

        assert_eq!(served, 5);
        assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            resp.headers().get(CONTENT_RANGE).unwrap(),
            "bytes 6-10/11"
        );
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"world");

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn missing_file_is_a_hard_error() {
        let root = scratch_root("missing");
        init_cache_layout(&root).unwrap();

        let sto = storage(&root);
        let req = Request::builder().uri("/").body(()).unwrap();
        let err = sto.serve_download(&req, HASH, 5).await.unwrap_err();
        assert!(err.is_not_exist());

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn body_releases_slot_on_drop() {
        let root = scratch_root("slots");
        std::fs::create_dir_all(root.join("5d")).unwrap();
        std::fs::write(fan_out_path(&root, HASH), b"hello").unwrap();

        let slots = Arc::new(BufSlots::new(nonzero!(1)));
        let sto = LocalStorage::new(
            "cache".to_string(),
            root.clone(),
            Arc::clone(&slots),
            CancellationToken::new(),
        );
        let req = Request::builder().uri("/").body(()).unwrap();
        let (resp, _) = sto.serve_download(&req, HASH, 5).await.unwrap().unwrap();
        assert_eq!(slots.len(), 0);

        drop(resp);
        assert_eq!(slots.len(), 1);

        std::fs::remove_dir_all(&root).unwrap();
    }
}
