//! HTTP byte-range parsing (RFC 7233, single range only).

/// Outcome of interpreting a `Range` header against an entity length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// Serve the whole entity with `200 OK`.
    Full,
    /// Serve `start..=end` with `206 Partial Content`.
    Partial { start: u64, end: u64 },
    /// Respond `416` with `Content-Range: bytes */total`.
    Unsatisfiable,
}

impl RangeSpec {
    /// Number of bytes in a partial response.
    pub fn len(&self) -> Option<u64> {
        match self {
            RangeSpec::Partial { start, end } => Some(end - start + 1),
            _ => None,
        }
    }
}

/// Interprets a `Range` header value for an entity of `total` bytes.
///
/// Supported forms are `bytes=start-end`, `bytes=start-` and the suffix form
/// `bytes=-n`. An end beyond the entity is clamped to the last byte.
/// Absent, malformed and multi-range headers fall back to the full entity;
/// only a syntactically valid range that starts past the end is unsatisfiable.
///
/// ```
/// use demotape_core::streaming::range::{RangeSpec, parse_range};
///
/// assert_eq!(
///     parse_range(Some("bytes=100-199"), 1000),
///     RangeSpec::Partial { start: 100, end: 199 }
/// );
/// assert_eq!(parse_range(Some("bytes=1000-"), 1000), RangeSpec::Unsatisfiable);
/// assert_eq!(parse_range(Some("items=0-1"), 1000), RangeSpec::Full);
/// ```
pub fn parse_range(header: Option<&str>, total: u64) -> RangeSpec {
    let Some(header) = header else {
        return RangeSpec::Full;
    };

    let Some((unit, spec)) = header.trim().split_once('=') else {
        return RangeSpec::Full;
    };
    if !unit.trim().eq_ignore_ascii_case("bytes") || spec.contains(',') {
        return RangeSpec::Full;
    }

    let Some((first, last)) = spec.trim().split_once('-') else {
        return RangeSpec::Full;
    };
    let (first, last) = (first.trim(), last.trim());

    if first.is_empty() {
        // Suffix range: the final `n` bytes.
        let Ok(suffix) = last.parse::<u64>() else {
            return RangeSpec::Full;
        };
        if suffix == 0 || total == 0 {
            return RangeSpec::Unsatisfiable;
        }
        return RangeSpec::Partial {
            start: total.saturating_sub(suffix),
            end: total - 1,
        };
    }

    let Ok(start) = first.parse::<u64>() else {
        return RangeSpec::Full;
    };

    let end = if last.is_empty() {
        None
    } else {
        match last.parse::<u64>() {
            Ok(end) if end >= start => Some(end),
            _ => return RangeSpec::Full,
        }
    };

    if start >= total {
        return RangeSpec::Unsatisfiable;
    }

    let last_byte = total - 1;
    RangeSpec::Partial {
        start,
        end: end.map_or(last_byte, |end| end.min(last_byte)),
    }
}
