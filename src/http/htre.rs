//! The HTTP message record produced by the incremental parser: request
//! line or status line, headers, trailers, framing attributes and body.

use crate::http::percent::perdec_to_string;
use crate::http::{Method, Version};

/// Transfer-Encoding is chunked.
pub const ATTR_CHUNKED: u32 = 1 << 0;
/// An explicit `Content-Length` was present.
pub const ATTR_LENGTH: u32 = 1 << 1;
/// The connection should be kept alive after this message.
pub const ATTR_KEEPALIVE: u32 = 1 << 2;
/// An `Expect:` header was present.
pub const ATTR_EXPECT: u32 = 1 << 3;
/// The `Expect:` header asked for `100-continue`.
pub const ATTR_EXPECT100: u32 = 1 << 4;
/// The request path has been percent-decoded in place.
pub const ATTR_QPATH_PERDEC: u32 = 1 << 5;

/// Ordered mapping from header name to its values. Lookups are
/// case-insensitive; duplicates are preserved per key in arrival order and
/// iteration follows first-insertion order.
#[derive(Default, Clone, Debug)]
pub struct HeaderTable {
    entries: Vec<(String, Vec<String>)>,
}

impl HeaderTable {
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn put(&mut self, key: &str, value: String) {
        for (k, vals) in self.entries.iter_mut() {
            if k.eq_ignore_ascii_case(key) {
                vals.push(value);
                return;
            }
        }
        self.entries.push((key.to_string(), vec![value]));
    }

    /// All values recorded for `key`, oldest first.
    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, vals)| vals.as_slice())
    }

    /// The first value recorded for `key`.
    pub fn get_first(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|vals| vals.first()).map(|s| s.as_str())
    }

    /// Iterates `(name, values)` in first-insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(k, vals)| (k.as_str(), vals.as_slice()))
    }
}

/// Whether the record is a request or a response.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReKind {
    Request,
    Response,
}

/// A decoded HTTP message.
pub struct Htre {
    pub(crate) kind: ReKind,
    pub(crate) version: Version,
    pub(crate) flags: u32,

    // Request line.
    pub(crate) method: Method,
    pub(crate) qmethod_name: String,
    pub(crate) qpath: String,
    pub(crate) orig_qpath: Option<String>,
    pub(crate) qparam: Option<String>,

    // Status line.
    pub(crate) scode: u16,
    pub(crate) smesg: String,

    pub(crate) hdrs: HeaderTable,
    pub(crate) trailers: HeaderTable,

    /// Value of `Content-Length` when `ATTR_LENGTH` is set.
    pub(crate) attr_content_length: u64,
    /// Value of a CGI `Status:` pseudo-header, verbatim.
    pub(crate) attr_status: Option<String>,

    /// Body bytes accumulated when no content callback consumes them.
    pub(crate) content: Vec<u8>,
    pub(crate) completed: bool,
}

impl Htre {
    pub(crate) fn new(kind: ReKind) -> Htre {
        Htre {
            kind,
            version: Version::V1_1,
            flags: 0,
            method: Method::Other,
            qmethod_name: String::new(),
            qpath: String::new(),
            orig_qpath: None,
            qparam: None,
            scode: 0,
            smesg: String::new(),
            hdrs: HeaderTable::default(),
            trailers: HeaderTable::default(),
            attr_content_length: 0,
            attr_status: None,
            content: Vec::new(),
            completed: false,
        }
    }

    pub(crate) fn clear(&mut self) {
        let kind = self.kind;
        *self = Htre::new(kind);
    }

    pub fn kind(&self) -> ReKind {
        self.kind
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn qmethod_name(&self) -> &str {
        &self.qmethod_name
    }

    /// The request URI path. Call [`perdec_qpath`](Htre::perdec_qpath) to
    /// percent-decode it in place.
    pub fn qpath(&self) -> &str {
        &self.qpath
    }

    /// The path as received, before percent-decoding.
    pub fn orig_qpath(&self) -> &str {
        self.orig_qpath.as_deref().unwrap_or(&self.qpath)
    }

    /// The query string, without the leading `?` and without any anchor.
    pub fn qparam(&self) -> Option<&str> {
        self.qparam.as_deref()
    }

    /// Status code of a response record.
    pub fn scode(&self) -> u16 {
        self.scode
    }

    /// Status text of a response record.
    pub fn smesg(&self) -> &str {
        &self.smesg
    }

    pub fn headers(&self) -> &HeaderTable {
        &self.hdrs
    }

    pub fn trailers(&self) -> &HeaderTable {
        &self.trailers
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.hdrs.get_first(key)
    }

    /// Body bytes retained on the record (empty when a content callback
    /// consumed them).
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn keep_alive(&self) -> bool {
        self.flags & ATTR_KEEPALIVE != 0
    }

    /// The declared request content length: `None` when the length is
    /// unbounded (chunked transfer), `Some(n)` otherwise.
    pub fn req_content_len(&self) -> Option<u64> {
        if self.flags & ATTR_CHUNKED != 0 {
            None
        } else if self.flags & ATTR_LENGTH != 0 {
            Some(self.attr_content_length)
        } else {
            Some(0)
        }
    }

    /// The CGI `Status:` pseudo-header of a response record.
    pub fn attr_status(&self) -> Option<&str> {
        self.attr_status.as_deref()
    }

    /// Percent-decodes the request path in place. Tracked by a flag, so
    /// repeated calls do not decode twice.
    pub fn perdec_qpath(&mut self) -> &str {
        if self.flags & ATTR_QPATH_PERDEC == 0 {
            let (decoded, ndecs) = perdec_to_string(&self.qpath);
            if ndecs > 0 {
                self.orig_qpath = Some(std::mem::replace(&mut self.qpath, decoded));
            }
            self.flags |= ATTR_QPATH_PERDEC;
        }
        &self.qpath
    }
}

/// Splits a CGI `Status: 200 OK`-style value into code and message.
pub fn parse_status_header_value(value: &str) -> (u16, Option<&str>) {
    let value = value.trim();
    let (code, rest) = match value.split_once(char::is_whitespace) {
        Some((code, rest)) => (code, Some(rest.trim())),
        None => (value, None),
    };
    let code = code.parse().unwrap_or(super::status::OK);
    (code, rest.filter(|r| !r.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_table_order_and_case() {
        let mut t = HeaderTable::default();
        t.put("Host", "a".into());
        t.put("Accept", "x".into());
        t.put("HOST", "b".into());
        assert_eq!(t.get("host").unwrap(), &["a".to_string(), "b".to_string()]);
        let keys: Vec<_> = t.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["Host", "Accept"]);
        assert_eq!(t.get_first("accept"), Some("x"));
        assert_eq!(t.get("missing"), None);
    }

    #[test]
    fn perdec_qpath_idempotent() {
        let mut re = Htre::new(ReKind::Request);
        re.qpath = "/a%2520b".to_string();
        assert_eq!(re.perdec_qpath(), "/a%20b");
        // Flagged as decoded; a second call must not decode again.
        assert_eq!(re.perdec_qpath(), "/a%20b");
        assert_eq!(re.orig_qpath(), "/a%2520b");
    }

    #[test]
    fn status_header_value() {
        assert_eq!(parse_status_header_value("200"), (200, None));
        assert_eq!(parse_status_header_value("404 Not Found"), (404, Some("Not Found")));
        assert_eq!(parse_status_header_value(" 301  Moved "), (301, Some("Moved")));
    }
}
