//! `Range` request header parsing and resolution against a known
//! resource length.

use crate::error::HttpError;

/// A byte range resolved against the resource length. Both bounds are
/// inclusive, matching the `Content-Range` wire form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRange {
    pub start: u64,
    pub end: u64,
}

impl ResolvedRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Parse a `Range: bytes=...` header value and resolve it against
/// `total` resource bytes.
///
/// Supported forms are `bytes=s-e`, `bytes=s-` and the suffix form
/// `bytes=-n`. Multi-range requests and ranges that do not overlap the
/// resource resolve to [`HttpError::RangeNotSatisfiable`], which the
/// response layer turns into a 416 with `Content-Range: bytes */total`.
pub fn parse_range(value: &str, total: u64) -> Result<ResolvedRange, HttpError> {
    let spec = value
        .strip_prefix("bytes=")
        .ok_or(HttpError::RangeNotSatisfiable)?
        .trim();
    // A comma means multiple ranges, which are not served.
    if spec.contains(',') {
        return Err(HttpError::RangeNotSatisfiable);
    }
    let (start, end) = spec.split_once('-').ok_or(HttpError::RangeNotSatisfiable)?;
    let (start, end) = (start.trim(), end.trim());

    if start.is_empty() {
        // Suffix form: the final n bytes.
        let n: u64 = end.parse().map_err(|_| HttpError::RangeNotSatisfiable)?;
        if n == 0 || total == 0 {
            return Err(HttpError::RangeNotSatisfiable);
        }
        let n = n.min(total);
        return Ok(ResolvedRange {
            start: total - n,
            end: total - 1,
        });
    }

    let start: u64 = start.parse().map_err(|_| HttpError::RangeNotSatisfiable)?;
    if start >= total {
        return Err(HttpError::RangeNotSatisfiable);
    }
    let end = if end.is_empty() {
        total - 1
    } else {
        let end: u64 = end.parse().map_err(|_| HttpError::RangeNotSatisfiable)?;
        if end < start {
            return Err(HttpError::RangeNotSatisfiable);
        }
        end.min(total - 1)
    };
    Ok(ResolvedRange { start, end })
}
