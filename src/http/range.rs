//! `Range` header parsing and `Content-Range` formatting.

use crate::error::ProxyError;

/// A byte range resolved against a known file size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub off: u64,
    pub len: u64,
    /// True when the request carried a satisfiable `Range` header and the
    /// response should be `206 Partial Content`.
    pub partial: bool,
}

impl ByteRange {
    pub fn whole(size: u64) -> Self {
        Self {
            off: 0,
            len: size,
            partial: false,
        }
    }

    pub fn end(&self) -> u64 {
        self.off + self.len
    }

    /// `Content-Range` value for a 206 response.
    pub fn content_range(&self, size: u64) -> String {
        format!("bytes {}-{}/{size}", self.off, self.off + self.len - 1)
    }
}

/// Interpret an optional `Range` header against `size` bytes.
///
/// Supported forms: `bytes=a-b`, `bytes=a-` and `bytes=-suffix`. A suffix
/// longer than the file clamps to the whole file; a first-byte position at
/// or past the end is unsatisfiable; multiple ranges are not supported.
pub fn parse_range(header: Option<&str>, size: u64) -> Result<ByteRange, ProxyError> {
    let Some(header) = header else {
        return Ok(ByteRange::whole(size));
    };

    let spec = header
        .strip_prefix("bytes=")
        .ok_or_else(|| ProxyError::BadRequest(format!("unsupported range unit: {header}")))?
        .trim();

    if spec.contains(',') {
        return Err(ProxyError::BadRequest(
            "multiple byte ranges are not supported".into(),
        ));
    }

    let (start, end) = spec
        .split_once('-')
        .ok_or_else(|| ProxyError::BadRequest(format!("malformed range: {header}")))?;

    let parse = |part: &str| -> Result<u64, ProxyError> {
        part.parse()
            .map_err(|_| ProxyError::BadRequest(format!("malformed range: {header}")))
    };

    match (start.is_empty(), end.is_empty()) {
        // bytes=-suffix
        (true, false) => {
            let suffix = parse(end)?;
            if suffix == 0 {
                return Err(ProxyError::RangeNotSatisfiable(header.to_string()));
            }
            let len = suffix.min(size);
            Ok(ByteRange {
                off: size - len,
                len,
                partial: true,
            })
        }
        // bytes=a-
        (false, true) => {
            let off = parse(start)?;
            if off >= size {
                return Err(ProxyError::RangeNotSatisfiable(header.to_string()));
            }
            Ok(ByteRange {
                off,
                len: size - off,
                partial: true,
            })
        }
        // bytes=a-b
        (false, false) => {
            let off = parse(start)?;
            let last = parse(end)?;
            if last < off {
                return Err(ProxyError::BadRequest(format!("inverted range: {header}")));
            }
            if off >= size {
                return Err(ProxyError::RangeNotSatisfiable(header.to_string()));
            }
            let last = last.min(size - 1);
            Ok(ByteRange {
                off,
                len: last - off + 1,
                partial: true,
            })
        }
        (true, true) => Err(ProxyError::BadRequest(format!("malformed range: {header}"))),
    }
}
