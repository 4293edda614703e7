use std::cmp::min;

use crate::warn_once_or_info;

/// Computes the requested byte range for an immutable mirror file.
/// Returns the formatted Content-Range header, the start byte, and the
/// number of bytes to serve. `None` means the whole file is served with 200.
///
/// See RFC 7233 Section 2.1. Only the first range of a multi-range request
/// would be meaningful here; multi-range requests fall back to a full serve.
#[must_use]
pub(crate) fn parse_range(range: Option<&str>, file_size: u64) -> Option<(String, u64, u64)> {
    if file_size == 0 {
        return None;
    }

    let byte_range = range?.strip_prefix("bytes=")?;
    if byte_range.contains(',') {
        warn_once_or_info!(
            "HTTP range requests with multiple ranges are not supported (`{byte_range}`)"
        );
        return None;
    }
    let (start, end) = byte_range.split_once('-')?;

    let start = if start.is_empty() {
        None
    } else {
        Some(start.parse::<u64>().ok()?)
    };
    let end = if end.is_empty() {
        None
    } else {
        Some(end.parse::<u64>().ok()?)
    };

    let (start, end) = match (start, end) {
        (None, None) => return None,
        (Some(s), Some(e)) => {
            if s > e || s >= file_size {
                return None;
            }
            (s, min(e, file_size - 1))
        }
        (Some(s), None) => {
            if s >= file_size {
                return None;
            }
            (s, file_size - 1)
        }
        (None, Some(e)) => {
            if e == 0 {
                return None;
            }
            (file_size.saturating_sub(e), file_size - 1)
        }
    };

    Some((
        format!("bytes {start}-{end}/{file_size}"),
        start,
        end + 1 - start,
    ))
}

/// Fast extraction of the first range's start byte, used only to decide
/// whether a request counts towards per-UA statistics. Does not validate the
/// range as a whole. An empty start (`bytes=-N` suffix form) reports -1.
#[must_use]
pub(crate) fn parse_range_first_start(range: &str) -> Option<i64> {
    let rest = range.strip_prefix("bytes=")?;
    let first = match rest.split_once(',') {
        Some((first, _)) => first,
        None => rest,
    };
    let (start, _) = first.split_once('-')?;
    let start = start.trim();
    if start.is_empty() {
        return Some(-1);
    }
    start.parse::<i64>().ok()
}
