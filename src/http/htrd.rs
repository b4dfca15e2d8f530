//! The incremental HTTP message parser. Bytes are fed in arbitrary
//! chunks; the parser fires `peek` when the header block completes,
//! `push_content` for each body fragment, and `poke` when the whole
//! message has been seen.

use std::cell::{Cell, RefCell};
use std::io;
use std::rc::Rc;

use log::trace;

use crate::http::htre::{
    Htre, ReKind, ATTR_CHUNKED, ATTR_EXPECT, ATTR_EXPECT100, ATTR_KEEPALIVE, ATTR_LENGTH,
};
use crate::http::{Method, Version};

/// Parse request records.
pub const OPT_REQUEST: u32 = 1 << 0;
/// Parse response records.
pub const OPT_RESPONSE: u32 = 1 << 1;
/// The peer omits the initial line and starts with headers (CGI output:
/// an optional `Status:` pseudo-header takes the status line's place).
pub const OPT_SKIP_INITIAL_LINE: u32 = 1 << 2;
/// Store trailers apart from headers instead of merging them in.
pub const OPT_TRAILERS: u32 = 1 << 3;

/// Headers may not grow beyond this many bytes per line.
const MAX_LINE: usize = 65536;

pub type HtrdCb = Rc<dyn Fn(&Htrd, &mut Htre) -> io::Result<()>>;
pub type HtrdContentCb = Rc<dyn Fn(&Htrd, &mut Htre, &[u8]) -> io::Result<()>>;

/// The parser's callback set. All three are optional; a missing
/// `push_content` accumulates the body on the record instead.
#[derive(Clone, Default)]
pub struct Recbs {
    pub peek: Option<HtrdCb>,
    pub poke: Option<HtrdCb>,
    pub push_content: Option<HtrdContentCb>,
}

#[derive(Copy, Clone, PartialEq, Debug)]
enum State {
    InitialLine,
    Headers,
    /// Fixed-length body; the remaining count lives in `rem`.
    Body,
    /// Close-delimited response body: everything until EOF.
    BodyToEof,
    ChunkSize,
    ChunkData,
    ChunkCrlf,
    Trailers,
    Done,
}

/// An incremental request/response decoder.
pub struct Htrd {
    opts: Cell<u32>,
    recbs: RefCell<Recbs>,
    re: RefCell<Htre>,
    state: Cell<State>,
    lbuf: RefCell<Vec<u8>>,
    /// Remaining bytes of the current fixed-length body or chunk.
    rem: Cell<u64>,
    conn_seen: Cell<bool>,
}

impl Htrd {
    pub fn new(opts: u32) -> Htrd {
        let kind = if opts & OPT_RESPONSE != 0 {
            ReKind::Response
        } else {
            ReKind::Request
        };
        Htrd {
            opts: Cell::new(opts),
            recbs: RefCell::new(Recbs::default()),
            re: RefCell::new(Htre::new(kind)),
            state: Cell::new(initial_state(opts)),
            lbuf: RefCell::new(Vec::new()),
            rem: Cell::new(0),
            conn_seen: Cell::new(false),
        }
    }

    pub fn opts(&self) -> u32 {
        self.opts.get()
    }

    pub fn set_opts(&self, opts: u32) {
        self.opts.set(opts);
        if self.state.get() == State::InitialLine && opts & OPT_SKIP_INITIAL_LINE != 0 {
            self.state.set(State::Headers);
        }
    }

    /// Replaces the callback set, returning the previous one so a caller
    /// can restore it later.
    pub fn set_recbs(&self, recbs: Recbs) -> Recbs {
        std::mem::replace(&mut *self.recbs.borrow_mut(), recbs)
    }

    pub fn recbs(&self) -> Recbs {
        self.recbs.borrow().clone()
    }

    /// Runs `f` over the current record.
    pub fn with_re<R>(&self, f: impl FnOnce(&mut Htre) -> R) -> R {
        f(&mut self.re.borrow_mut())
    }

    /// Whether the parser sits between messages (nothing half-parsed).
    pub fn is_quiescent(&self) -> bool {
        matches!(self.state.get(), State::Done)
            || (self.state.get() == initial_state(self.opts.get())
                && self.lbuf.borrow().is_empty()
                && !self.re.borrow().is_completed())
    }

    /// Feeds bytes. Returns how many were consumed; bytes past a completed
    /// message are left to the caller to buffer and replay.
    pub fn feed(&self, data: &[u8]) -> io::Result<usize> {
        if self.state.get() == State::Done {
            // Start over for the next message on the connection.
            self.reset();
        }
        let mut i = 0;
        while i < data.len() {
            match self.state.get() {
                State::InitialLine
                | State::Headers
                | State::ChunkSize
                | State::ChunkCrlf
                | State::Trailers => {
                    let nl = data[i..].iter().position(|&b| b == b'\n');
                    match nl {
                        None => {
                            let mut lbuf = self.lbuf.borrow_mut();
                            lbuf.extend_from_slice(&data[i..]);
                            if lbuf.len() > MAX_LINE {
                                return Err(perr("header line too long"));
                            }
                            i = data.len();
                        }
                        Some(nl) => {
                            let line = {
                                let mut lbuf = self.lbuf.borrow_mut();
                                lbuf.extend_from_slice(&data[i..i + nl]);
                                if lbuf.len() > MAX_LINE {
                                    return Err(perr("header line too long"));
                                }
                                let mut line = std::mem::take(&mut *lbuf);
                                if line.last() == Some(&b'\r') {
                                    line.pop();
                                }
                                line
                            };
                            i += nl + 1;
                            self.take_line(&line)?;
                        }
                    }
                }
                State::Body | State::ChunkData => {
                    let want = self.rem.get().min((data.len() - i) as u64) as usize;
                    self.push_content(&data[i..i + want])?;
                    i += want;
                    self.rem.set(self.rem.get() - want as u64);
                    if self.rem.get() == 0 {
                        if self.state.get() == State::ChunkData {
                            self.state.set(State::ChunkCrlf);
                        } else {
                            self.complete()?;
                        }
                    }
                }
                State::BodyToEof => {
                    self.push_content(&data[i..])?;
                    i = data.len();
                }
                State::Done => break,
            }
            if self.state.get() == State::Done {
                break;
            }
        }
        Ok(i)
    }

    fn reset(&self) {
        self.re.borrow_mut().clear();
        self.lbuf.borrow_mut().clear();
        self.rem.set(0);
        self.conn_seen.set(false);
        self.state.set(initial_state(self.opts.get()));
    }

    fn take_line(&self, line: &[u8]) -> io::Result<()> {
        match self.state.get() {
            State::InitialLine => {
                if line.is_empty() {
                    // Tolerate blank lines ahead of the initial line.
                    return Ok(());
                }
                let text = std::str::from_utf8(line).map_err(|_| perr("non-ascii initial line"))?;
                if self.opts.get() & OPT_RESPONSE != 0 {
                    self.parse_status_line(text)?;
                } else {
                    self.parse_request_line(text)?;
                }
                self.state.set(State::Headers);
                Ok(())
            }
            State::Headers => {
                if line.is_empty() {
                    self.end_of_headers()
                } else {
                    self.parse_header_line(line, false)
                }
            }
            State::ChunkSize => {
                let text = std::str::from_utf8(line).map_err(|_| perr("bad chunk size"))?;
                let size_part = text.split(';').next().unwrap_or("").trim();
                if size_part.is_empty() {
                    // The CRLF terminating the previous chunk.
                    return Ok(());
                }
                let size = u64::from_str_radix(size_part, 16).map_err(|_| perr("bad chunk size"))?;
                if size == 0 {
                    self.state.set(State::Trailers);
                } else {
                    self.rem.set(size);
                    self.state.set(State::ChunkData);
                }
                Ok(())
            }
            State::ChunkCrlf => {
                if !line.is_empty() {
                    return Err(perr("missing chunk terminator"));
                }
                self.state.set(State::ChunkSize);
                Ok(())
            }
            State::Trailers => {
                if line.is_empty() {
                    self.complete()
                } else {
                    self.parse_header_line(line, true)
                }
            }
            _ => unreachable!("line fed in a body state"),
        }
    }

    fn parse_request_line(&self, text: &str) -> io::Result<()> {
        let mut parts = text.split(' ').filter(|p| !p.is_empty());
        let method = parts.next().ok_or_else(|| perr("missing method"))?;
        let target = parts.next().ok_or_else(|| perr("missing request target"))?;
        let verstr = parts.next().ok_or_else(|| perr("missing version"))?;
        let version = parse_version(verstr)?;

        // The anchor is never part of the server-side URL.
        let target = target.split('#').next().unwrap_or(target);
        let (path, param) = match target.split_once('?') {
            Some((p, q)) => (p, Some(q.to_string())),
            None => (target, None),
        };

        let mut re = self.re.borrow_mut();
        re.method = Method::from_name(method);
        re.qmethod_name = method.to_string();
        re.qpath = path.to_string();
        re.qparam = param;
        re.version = version;
        trace!("request line: {} {} {}", method, path, version);
        Ok(())
    }

    fn parse_status_line(&self, text: &str) -> io::Result<()> {
        let mut parts = text.splitn(3, ' ');
        let verstr = parts.next().ok_or_else(|| perr("missing version"))?;
        let version = parse_version(verstr)?;
        let code = parts
            .next()
            .and_then(|c| c.parse::<u16>().ok())
            .ok_or_else(|| perr("missing status code"))?;
        let mesg = parts.next().unwrap_or("").to_string();

        let mut re = self.re.borrow_mut();
        re.version = version;
        re.scode = code;
        re.smesg = mesg;
        Ok(())
    }

    fn parse_header_line(&self, line: &[u8], trailer: bool) -> io::Result<()> {
        let text = String::from_utf8_lossy(line);
        let (key, value) = text
            .split_once(':')
            .ok_or_else(|| perr("malformed header"))?;
        let key = key.trim();
        let value = value.trim();
        if key.is_empty() {
            return Err(perr("empty header name"));
        }

        let mut re = self.re.borrow_mut();
        if !trailer {
            if key.eq_ignore_ascii_case("Content-Length") {
                let n: u64 = value.parse().map_err(|_| perr("bad content-length"))?;
                re.attr_content_length = n;
                re.flags |= ATTR_LENGTH;
            } else if key.eq_ignore_ascii_case("Transfer-Encoding") {
                if value
                    .split(',')
                    .any(|t| t.trim().eq_ignore_ascii_case("chunked"))
                {
                    re.flags |= ATTR_CHUNKED;
                }
            } else if key.eq_ignore_ascii_case("Connection") {
                self.conn_seen.set(true);
                if value.eq_ignore_ascii_case("close") {
                    re.flags &= !ATTR_KEEPALIVE;
                } else if value.eq_ignore_ascii_case("keep-alive") {
                    re.flags |= ATTR_KEEPALIVE;
                }
            } else if key.eq_ignore_ascii_case("Expect") {
                re.flags |= ATTR_EXPECT;
                if value.eq_ignore_ascii_case("100-continue") {
                    re.flags |= ATTR_EXPECT100;
                }
            } else if key.eq_ignore_ascii_case("Status") {
                re.attr_status = Some(value.to_string());
            }
        }

        let table = if trailer && self.opts.get() & OPT_TRAILERS != 0 {
            &mut re.trailers
        } else {
            &mut re.hdrs
        };
        table.put(key, value.to_string());
        Ok(())
    }

    fn end_of_headers(&self) -> io::Result<()> {
        {
            let mut re = self.re.borrow_mut();
            if !self.conn_seen.get() && re.version.cmp_numbers(1, 1).is_ge() {
                re.flags |= ATTR_KEEPALIVE;
            }
        }

        self.call_peek()?;

        let (chunked, length, kind) = {
            let re = self.re.borrow();
            (
                re.flags & ATTR_CHUNKED != 0,
                if re.flags & ATTR_LENGTH != 0 {
                    re.attr_content_length
                } else {
                    0
                },
                re.kind,
            )
        };

        if chunked {
            self.state.set(State::ChunkSize);
        } else if length > 0 {
            self.rem.set(length);
            self.state.set(State::Body);
        } else if kind == ReKind::Response && self.re.borrow().flags & ATTR_LENGTH == 0 {
            // No framing on a response: the body runs to connection close.
            self.state.set(State::BodyToEof);
        } else {
            self.complete()?;
        }
        Ok(())
    }

    fn push_content(&self, data: &[u8]) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let cb = self.recbs.borrow().push_content.clone();
        match cb {
            Some(cb) => {
                let mut re = self.re.borrow_mut();
                cb(self, &mut re, data)
            }
            None => {
                self.re.borrow_mut().content.extend_from_slice(data);
                Ok(())
            }
        }
    }

    fn call_peek(&self) -> io::Result<()> {
        let cb = self.recbs.borrow().peek.clone();
        if let Some(cb) = cb {
            let mut re = self.re.borrow_mut();
            cb(self, &mut re)?;
        }
        Ok(())
    }

    fn complete(&self) -> io::Result<()> {
        self.re.borrow_mut().completed = true;
        self.state.set(State::Done);
        let cb = self.recbs.borrow().poke.clone();
        if let Some(cb) = cb {
            let mut re = self.re.borrow_mut();
            cb(self, &mut re)?;
        }
        Ok(())
    }

    /// Signals connection EOF to a close-delimited response body, firing
    /// `poke` for the message the EOF terminates. No-op in other states.
    pub fn eof(&self) -> io::Result<()> {
        if self.state.get() == State::BodyToEof {
            self.complete()?;
        }
        Ok(())
    }
}

fn initial_state(opts: u32) -> State {
    if opts & OPT_SKIP_INITIAL_LINE != 0 {
        State::Headers
    } else {
        State::InitialLine
    }
}

fn parse_version(verstr: &str) -> io::Result<Version> {
    let num = verstr
        .strip_prefix("HTTP/")
        .ok_or_else(|| perr("bad version"))?;
    let (major, minor) = num.split_once('.').ok_or_else(|| perr("bad version"))?;
    Ok(Version {
        major: major.parse().map_err(|_| perr("bad version"))?,
        minor: minor.parse().map_err(|_| perr("bad version"))?,
    })
}

fn perr(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("parse error: {}", msg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;

    /// Records the callback sequence for comparison across feeds.
    #[derive(Default)]
    struct Trace {
        events: Rc<StdRefCell<Vec<String>>>,
    }

    impl Trace {
        fn recbs(&self) -> Recbs {
            let ev1 = self.events.clone();
            let ev2 = self.events.clone();
            let ev3 = self.events.clone();
            Recbs {
                peek: Some(Rc::new(move |_, re| {
                    ev1.borrow_mut()
                        .push(format!("peek {} {}", re.qmethod_name(), re.qpath()));
                    Ok(())
                })),
                poke: Some(Rc::new(move |_, _| {
                    ev2.borrow_mut().push("poke".to_string());
                    Ok(())
                })),
                push_content: Some(Rc::new(move |_, _, data| {
                    ev3.borrow_mut()
                        .push(format!("content {}", String::from_utf8_lossy(data)));
                    Ok(())
                })),
            }
        }

        fn take(&self) -> Vec<String> {
            std::mem::take(&mut self.events.borrow_mut())
        }
    }

    const REQ: &[u8] = b"POST /submit?x=1 HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\n\r\nhello";

    #[test]
    fn whole_buffer() {
        let trace = Trace::default();
        let htrd = Htrd::new(OPT_REQUEST);
        htrd.set_recbs(trace.recbs());
        let n = htrd.feed(REQ).unwrap();
        assert_eq!(n, REQ.len());
        assert_eq!(
            trace.take(),
            vec!["peek POST /submit", "content hello", "poke"]
        );
        htrd.with_re(|re| {
            assert_eq!(re.qparam(), Some("x=1"));
            assert_eq!(re.version(), Version::V1_1);
            assert!(re.keep_alive());
            assert_eq!(re.req_content_len(), Some(5));
        });
    }

    #[test]
    fn byte_at_a_time_matches_whole_buffer() {
        let whole = Trace::default();
        let htrd = Htrd::new(OPT_REQUEST);
        htrd.set_recbs(whole.recbs());
        htrd.feed(REQ).unwrap();
        let expected = whole.take();

        for chunk in [1usize, 2, 3, 7, 11] {
            let trace = Trace::default();
            let htrd = Htrd::new(OPT_REQUEST);
            htrd.set_recbs(trace.recbs());
            for piece in REQ.chunks(chunk) {
                let n = htrd.feed(piece).unwrap();
                assert_eq!(n, piece.len());
            }
            // Content events may split differently; splice them together.
            assert_eq!(join_content(trace.take()), join_content(expected.clone()));
        }
    }

    fn join_content(events: Vec<String>) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for ev in events {
            match (ev.strip_prefix("content "), out.last_mut()) {
                (Some(frag), Some(last)) if last.starts_with("content ") => {
                    last.push_str(frag);
                }
                _ => out.push(ev),
            }
        }
        out
    }

    #[test]
    fn chunked_request() {
        let trace = Trace::default();
        let htrd = Htrd::new(OPT_REQUEST);
        htrd.set_recbs(trace.recbs());
        let data = b"PUT /u HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let n = htrd.feed(data).unwrap();
        assert_eq!(n, data.len());
        assert_eq!(
            join_content(trace.take()),
            vec!["peek PUT /u", "content hello world", "poke"]
        );
        htrd.with_re(|re| assert_eq!(re.req_content_len(), None));
    }

    #[test]
    fn pipelined_leftover_stays_unconsumed() {
        let htrd = Htrd::new(OPT_REQUEST);
        let two = b"GET /a HTTP/1.1\r\nHost: h\r\n\r\nGET /b HTTP/1.1\r\nHost: h\r\n\r\n";
        let n = htrd.feed(two).unwrap();
        assert!(n < two.len());
        htrd.with_re(|re| {
            assert!(re.is_completed());
            assert_eq!(re.qpath(), "/a");
        });
        // Replaying the leftover parses the second request.
        let n2 = htrd.feed(&two[n..]).unwrap();
        assert_eq!(n2, two.len() - n);
        htrd.with_re(|re| assert_eq!(re.qpath(), "/b"));
    }

    #[test]
    fn cgi_response_with_status_line_skipped() {
        let events = Rc::new(StdRefCell::new(Vec::<String>::new()));
        let ev = events.clone();
        let htrd = Htrd::new(OPT_RESPONSE | OPT_SKIP_INITIAL_LINE);
        htrd.set_recbs(Recbs {
            peek: Some(Rc::new(move |_, re| {
                ev.borrow_mut().push(format!(
                    "peek status={:?} ct={:?}",
                    re.attr_status(),
                    re.header("Content-Type")
                ));
                Ok(())
            })),
            poke: None,
            push_content: None,
        });
        let data = b"Status: 404 Not Found\r\nContent-Type: text/plain\r\n\r\nnope";
        htrd.feed(data).unwrap();
        assert_eq!(
            events.borrow().as_slice(),
            &["peek status=Some(\"404 Not Found\") ct=Some(\"text/plain\")".to_string()]
        );
        // Close-delimited body: EOF completes the record.
        htrd.with_re(|re| assert!(!re.is_completed()));
        htrd.eof().unwrap();
        htrd.with_re(|re| {
            assert!(re.is_completed());
            assert_eq!(re.content(), b"nope");
        });
    }

    #[test]
    fn response_status_line() {
        let htrd = Htrd::new(OPT_RESPONSE);
        let data = b"HTTP/1.0 301 Moved Permanently\r\nLocation: /x\r\nContent-Length: 0\r\n\r\n";
        htrd.feed(data).unwrap();
        htrd.with_re(|re| {
            assert_eq!(re.scode(), 301);
            assert_eq!(re.smesg(), "Moved Permanently");
            assert_eq!(re.version(), Version::V1_0);
            assert!(!re.keep_alive());
            assert!(re.is_completed());
        });
    }

    #[test]
    fn trailers_kept_apart() {
        let htrd = Htrd::new(OPT_REQUEST | OPT_TRAILERS);
        let data =
            b"POST /t HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\nX-Sum: 9\r\n\r\n";
        htrd.feed(data).unwrap();
        htrd.with_re(|re| {
            assert_eq!(re.trailers().get_first("X-Sum"), Some("9"));
            assert!(re.headers().get("X-Sum").is_none());
        });
    }

    #[test]
    fn connection_close_overrides_default() {
        let htrd = Htrd::new(OPT_REQUEST);
        htrd.feed(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").unwrap();
        htrd.with_re(|re| assert!(!re.keep_alive()));

        let htrd = Htrd::new(OPT_REQUEST);
        htrd.feed(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        htrd.with_re(|re| assert!(re.keep_alive()));

        let htrd = Htrd::new(OPT_REQUEST);
        htrd.feed(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        htrd.with_re(|re| assert!(!re.keep_alive()));
    }

    #[test]
    fn expect_header_flags() {
        let htrd = Htrd::new(OPT_REQUEST);
        htrd.feed(b"PUT /f HTTP/1.1\r\nContent-Length: 1\r\nExpect: 100-continue\r\n\r\nx")
            .unwrap();
        htrd.with_re(|re| {
            assert!(re.flags() & ATTR_EXPECT != 0);
            assert!(re.flags() & ATTR_EXPECT100 != 0);
        });
    }

    #[test]
    fn garbage_is_rejected() {
        let htrd = Htrd::new(OPT_REQUEST);
        assert!(htrd.feed(b"NONSENSE\r\n\r\n").is_err());
        let htrd = Htrd::new(OPT_REQUEST);
        assert!(htrd
            .feed(b"GET / HTTP/1.1\r\nContent-Length: banana\r\n\r\n")
            .is_err());
    }
}
