use hyper::StatusCode;

#[derive(Debug)]
#[non_exhaustive]
pub(crate) enum NodeError {
    Io(std::io::Error),
    Http(hyper::http::Error),
    /// An upstream collaborator answered with an unexpected HTTP status.
    /// Surfaced to clients as 502 with this message.
    HttpStatus(StatusCode),
}

impl NodeError {
    /// Whether this error means the requested file does not exist on the
    /// backend that produced it.
    #[must_use]
    pub(crate) fn is_not_exist(&self) -> bool {
        match self {
            Self::Io(err) => err.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => e.fmt(f),
            Self::Http(e) => e.fmt(f),
            Self::HttpStatus(code) => {
                write!(
                    f,
                    "Unexpected http status {} {}",
                    code.as_u16(),
                    code.canonical_reason().unwrap_or("")
                )
            }
        }
    }
}

impl std::error::Error for NodeError {}

impl From<std::io::Error> for NodeError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<hyper::http::Error> for NodeError {
    fn from(value: hyper::http::Error) -> Self {
        Self::Http(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_exist_classification() {
        let err = NodeError::Io(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(err.is_not_exist());

        let err = NodeError::Io(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert!(!err.is_not_exist());

        let err = NodeError::HttpStatus(StatusCode::BAD_GATEWAY);
        assert!(!err.is_not_exist());
    }

    #[test]
    fn status_display() {
        let err = NodeError::HttpStatus(StatusCode::NOT_FOUND);
        assert_eq!(format!("{err}"), "Unexpected http status 404 Not Found");
    }
}
