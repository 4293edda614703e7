use std::path::PathBuf;

use hyper::header::{CONTENT_LENGTH, ETAG, HeaderValue, LOCATION};
use hyper::{Request, Response, StatusCode};

use crate::NodeBody;
use crate::error::NodeError;
use crate::hashutil::query_get;
use crate::storage::fan_out_path;

/// A storage mounted from elsewhere (NFS, object-store gateway, a sibling
/// node's export). The node only checks that the file is present below the
/// mount and redirects the client to the mount's own public URL; a missing
/// file is a soft miss so the dispatcher falls through to the next backend.
#[derive(Debug)]
pub(crate) struct MountStorage {
    name: String,
    root: PathBuf,
    /// Base URL the mount is reachable under, without a trailing slash.
    public_url: String,
}

impl MountStorage {
    #[must_use]
    pub(crate) fn new(name: String, root: PathBuf, public_url: String) -> Self {
        Self {
            name,
            root,
            public_url,
        }
    }

    #[must_use]
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) async fn serve_download<B>(
        &self,
        req: &Request<B>,
        hash: &str,
    ) -> Result<Option<(Response<NodeBody>, i64)>, NodeError> {
        let path = fan_out_path(&self.root, hash);
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let mut location = format!("{}/{}/{}", self.public_url, &hash[..2], hash);
        if let Some(name) = req.uri().query().and_then(|q| query_get(q, "name")) {
            if !name.is_empty() {
                location.push_str("?name=");
                location.push_str(&urlencoding::encode(&name));
            }
        }

        let served = i64::try_from(metadata.len()).expect("file size fits in i64");
        let response = Response::builder()
            .status(StatusCode::FOUND)
            .header(
                LOCATION,
                HeaderValue::try_from(location).expect("redirect URL is ASCII"),
            )
            .header(CONTENT_LENGTH, HeaderValue::from_static("0"))
            .header(
                ETAG,
                HeaderValue::try_from(format!("\"{hash}\"")).expect("hash is hex"),
            )
            .body(crate::empty())?;
        Ok(Some((response, served)))
    }

    /// Measurement over a mount prefers a pre-created `.measure/{n}` file so
    /// the probe exercises the mount's own delivery path; without one the
    /// node streams the zeros itself.
    pub(crate) fn serve_measure<B>(
        &self,
        req: &Request<B>,
        size_mb: i64,
    ) -> Result<Response<NodeBody>, NodeError> {
        let measure_file = self.root.join(".measure").join(size_mb.to_string());
        if measure_file.is_file() {
            let location = format!("{}/.measure/{size_mb}", self.public_url);
            let response = Response::builder()
                .status(StatusCode::FOUND)
                .header(
                    LOCATION,
                    HeaderValue::try_from(location).expect("redirect URL is ASCII"),
                )
                .header(CONTENT_LENGTH, HeaderValue::from_static("0"))
                .body(crate::empty())?;
            return Ok(response);
        }
        crate::storage::measure_response(req, size_mb)
    }
}
