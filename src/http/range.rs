//! `Range:` header parsing. Only a single byte range is supported;
//! multi-range requests are rejected.

use std::io;

/// A parsed `Range:` header value.
///
/// * `Proper(a, b)` — `bytes=a-b`, both offsets inclusive.
/// * `Prefix(a)` — `bytes=a-`, from offset `a` to the end.
/// * `Suffix(n)` — `bytes=-n`, the last `n` bytes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Range {
    Proper(u64, u64),
    Prefix(u64),
    Suffix(u64),
}

/// The byte span a range selects within a resource of `size` bytes, as an
/// inclusive `(from, to)` pair; `None` when the range is unsatisfiable.
impl Range {
    pub fn resolve(self, size: u64) -> Option<(u64, u64)> {
        match self {
            Range::Proper(from, to) => {
                if to >= size || from > to {
                    None
                } else {
                    Some((from, to))
                }
            }
            Range::Prefix(from) => {
                if from >= size {
                    None
                } else {
                    Some((from, size - 1))
                }
            }
            Range::Suffix(n) => {
                if n >= size || n == 0 {
                    None
                } else {
                    Some((size - n, size - 1))
                }
            }
        }
    }
}

fn bad() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "malformed range")
}

/// Parses a `Range:` header value like `bytes=0-499`, `bytes=500-` or
/// `bytes=-200`.
pub fn parse_range(s: &str) -> io::Result<Range> {
    let s = s.trim();
    let spec = s.strip_prefix("bytes=").ok_or_else(bad)?;
    if spec.contains(',') {
        // Multi-range is out.
        return Err(bad());
    }
    let (from, to) = spec.split_once('-').ok_or_else(bad)?;
    let from = from.trim();
    let to = to.trim();
    match (from.is_empty(), to.is_empty()) {
        (true, true) => Err(bad()),
        (true, false) => Ok(Range::Suffix(to.parse().map_err(|_| bad())?)),
        (false, true) => Ok(Range::Prefix(from.parse().map_err(|_| bad())?)),
        (false, false) => {
            let a: u64 = from.parse().map_err(|_| bad())?;
            let b: u64 = to.parse().map_err(|_| bad())?;
            if a > b {
                return Err(bad());
            }
            Ok(Range::Proper(a, b))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forms() {
        assert_eq!(parse_range("bytes=0-499").unwrap(), Range::Proper(0, 499));
        assert_eq!(parse_range("bytes=500-").unwrap(), Range::Prefix(500));
        assert_eq!(parse_range("bytes=-200").unwrap(), Range::Suffix(200));
        assert!(parse_range("bytes=-").is_err());
        assert!(parse_range("bytes=1-2,3-4").is_err());
        assert!(parse_range("lines=1-2").is_err());
        assert!(parse_range("bytes=5-2").is_err());
    }

    #[test]
    fn resolve_against_1000() {
        assert_eq!(Range::Proper(0, 499).resolve(1000), Some((0, 499)));
        assert_eq!(Range::Prefix(500).resolve(1000), Some((500, 999)));
        assert_eq!(Range::Suffix(200).resolve(1000), Some((800, 999)));
        assert_eq!(Range::Proper(500, 1500).resolve(1000), None);
        assert_eq!(Range::Prefix(1000).resolve(1000), None);
        assert_eq!(Range::Suffix(1000).resolve(1000), None);
    }
}
