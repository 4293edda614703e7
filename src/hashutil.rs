use std::borrow::Cow;
use std::sync::LazyLock;

use md5::Md5;
use sha1::{Digest, Sha1};

/// Hex digests of the empty input for every hash algorithm the federation
/// uses. Requests for these are answered without consulting any backend.
static EMPTY_HASHES: LazyLock<[String; 2]> = LazyLock::new(|| {
    [
        hex_string(&Md5::digest(b"")),
        hex_string(&Sha1::digest(b"")),
    ]
});

#[must_use]
pub(crate) fn hex_string(bytes: &[u8]) -> String {
    use std::fmt::Write as _;

    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(out, "{b:02x}").expect("writing to a String cannot fail");
    }
    out
}

#[must_use]
pub(crate) fn is_empty_hash(hash: &str) -> bool {
    EMPTY_HASHES.iter().any(|h| h == hash)
}

/// A valid file hash is lowercase hex of length 32 (MD5) or 40 (SHA-1).
#[must_use]
pub(crate) fn is_hex_hash(hash: &str) -> bool {
    (hash.len() == 32 || hash.len() == 40)
        && hash
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Returns the first value of `key` in a raw query string, percent-decoded.
/// Malformed encodings are treated as absent.
#[must_use]
pub(crate) fn query_get<'a>(query: &'a str, key: &str) -> Option<Cow<'a, str>> {
    for pair in query.split('&') {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        if k == key {
            if !v.contains('%') && !v.contains('+') {
                return Some(Cow::Borrowed(v));
            }
            let replaced = v.replace('+', " ");
            return match urlencoding::decode(&replaced) {
                Ok(decoded) => Some(Cow::Owned(decoded.into_owned())),
                Err(_) => None,
            };
        }
    }
    None
}
