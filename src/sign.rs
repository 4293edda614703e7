use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha1::{Digest, Sha1};

use crate::hashutil::query_get;

#[must_use]
pub(crate) fn now_unix_millis() -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is after the unix epoch");
    i64::try_from(now.as_millis()).expect("milliseconds since epoch fit in i64")
}

/// Verifies the `s`/`e` query parameters of a signed URL.
///
/// `subject` is the signed payload: the lowercased hex hash for downloads,
/// the full request path for measurements. `e` is the expiry in milliseconds
/// since epoch, base-36 encoded; `s` is the unpadded base64url encoding of
/// `SHA1(secret || subject || e)` over the raw `e` string.
#[must_use]
pub(crate) fn check_query_sign(subject: &str, secret: &str, query: &str) -> bool {
    let Some(sign) = query_get(query, "s") else {
        return false;
    };
    let Some(expire) = query_get(query, "e") else {
        return false;
    };
    if sign.is_empty() || expire.is_empty() {
        return false;
    }

    let Ok(before) = i64::from_str_radix(&expire, 36) else {
        return false;
    };

    let mut hs = Sha1::new();
    hs.update(secret.as_bytes());
    hs.update(subject.as_bytes());
    hs.update(expire.as_bytes());
    if URL_SAFE_NO_PAD.encode(hs.finalize()) != *sign {
        return false;
    }

    now_unix_millis() < before
}
