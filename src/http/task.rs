//! The per-request task framework shared by all response strategies.
//!
//! A task binds to the client socket for one request/response cycle and
//! coordinates four half-duplex flows: client-to-task, task-to-client, and
//! both directions toward its peer (a child process, a FastCGI session, a
//! worker thread, or a file descriptor). Each half completes exactly once;
//! when all four are over the task unbinds, keeping the connection alive
//! when it may.

use std::cell::{Cell, RefCell};
use std::io;
use std::rc::{Rc, Weak};

use log::debug;

use crate::http::date::fmt_http_time;
use crate::http::htrd::Recbs;
use crate::http::htre::{Htre, ATTR_EXPECT, ATTR_EXPECT100, ATTR_KEEPALIVE};
use crate::http::svr::{Cli, Htts};
use crate::http::{status, status_text, Method, Version};
use crate::sck::{DevSck, SHUTDOWN_WRITE};

/// Client-to-task flow has completed.
pub const OVER_READ_FROM_CLIENT: u8 = 1 << 0;
/// Peer-to-task flow has completed.
pub const OVER_READ_FROM_PEER: u8 = 1 << 1;
/// Task-to-client flow has completed.
pub const OVER_WRITE_TO_CLIENT: u8 = 1 << 2;
/// Task-to-peer flow has completed.
pub const OVER_WRITE_TO_PEER: u8 = 1 << 3;
pub const OVER_ALL: u8 =
    OVER_READ_FROM_CLIENT | OVER_READ_FROM_PEER | OVER_WRITE_TO_CLIENT | OVER_WRITE_TO_PEER;

/// Outstanding writes on one side beyond which the other side's read
/// interest is paused.
pub const PENDING_IO_THRESHOLD: usize = 5;

/// Write context marking responses written by the task framework.
pub(crate) const SVR_WRCTX: usize = 1;

/// State common to every task kind.
pub struct TaskCore {
    htts: Weak<Htts>,
    cli: RefCell<Weak<Cli>>,
    csck: RefCell<Option<Rc<DevSck>>>,

    // Snapshot of the request, surviving the request record itself.
    pub method: Method,
    pub qmethod_name: String,
    pub qpath: String,
    pub qparam: Option<String>,
    pub version: Version,
    pub req_flags: u32,
    /// `None` when the request body length is unbounded (chunked).
    pub req_conlen: Option<u64>,
    qpath_ends_with_slash: bool,

    pub keep_alive: Cell<bool>,
    over: Cell<u8>,
    pub res_started: Cell<bool>,
    pub res_ended: Cell<bool>,
    pub res_chunked: Cell<bool>,
    pub res_ever_sent: Cell<bool>,
    pub res_pending_writes: Cell<usize>,
    pub status_code: Cell<u16>,
    pub client_eof: Cell<bool>,
    pub client_disconnected: Cell<bool>,
    unbound: Cell<bool>,
    org_recbs: RefCell<Option<Recbs>>,
}

impl Drop for TaskCore {
    fn drop(&mut self) {
        if let Some(htts) = self.htts.upgrade() {
            htts.ntasks.set(htts.ntasks.get().saturating_sub(1));
        }
    }
}

impl TaskCore {
    /// Captures the request essentials and links the task to its client.
    pub fn new(htts: &Rc<Htts>, cli: &Rc<Cli>, req: &Htre) -> TaskCore {
        htts.ntasks.set(htts.ntasks.get() + 1);
        let qpath = req.qpath().to_string();
        TaskCore {
            htts: Rc::downgrade(htts),
            cli: RefCell::new(Rc::downgrade(cli)),
            csck: RefCell::new(Some(cli.sck().clone())),
            method: req.method(),
            qmethod_name: req.qmethod_name().to_string(),
            qpath_ends_with_slash: qpath.ends_with('/'),
            qpath,
            qparam: req.qparam().map(|s| s.to_string()),
            version: req.version(),
            req_flags: req.flags(),
            req_conlen: req.req_content_len(),
            keep_alive: Cell::new(req.flags() & ATTR_KEEPALIVE != 0),
            over: Cell::new(0),
            res_started: Cell::new(false),
            res_ended: Cell::new(false),
            res_chunked: Cell::new(false),
            res_ever_sent: Cell::new(false),
            res_pending_writes: Cell::new(0),
            status_code: Cell::new(0),
            client_eof: Cell::new(false),
            client_disconnected: Cell::new(false),
            unbound: Cell::new(false),
            org_recbs: RefCell::new(None),
        }
    }

    pub fn htts(&self) -> Option<Rc<Htts>> {
        self.htts.upgrade()
    }

    pub fn cli(&self) -> Option<Rc<Cli>> {
        self.cli.borrow().upgrade()
    }

    pub fn csck(&self) -> Option<Rc<DevSck>> {
        self.csck.borrow().clone()
    }

    pub fn over(&self) -> u8 {
        self.over.get()
    }

    pub fn is_over(&self, bits: u8) -> bool {
        self.over.get() & bits == bits
    }

    /// Whether there is a request body to expect from the client.
    pub fn have_req_content(&self) -> bool {
        match self.req_conlen {
            None => true,
            Some(n) => n > 0,
        }
    }

    /// Remembers the parser callbacks replaced by this task so unbinding
    /// can restore them.
    pub fn save_recbs(&self, recbs: Recbs) {
        *self.org_recbs.borrow_mut() = Some(recbs);
    }

    // --- writing toward the client -----------------------------------------

    /// Queues raw bytes on the client socket, tracked by the pending-write
    /// counter.
    pub fn write_to_client(&self, data: &[u8]) -> io::Result<()> {
        let csck = match self.csck() {
            Some(csck) => csck,
            None => return Ok(()),
        };
        self.res_ever_sent.set(true);
        self.res_pending_writes
            .set(self.res_pending_writes.get() + 1);
        if let Err(e) = csck.write(data, SVR_WRCTX, None) {
            self.res_pending_writes
                .set(self.res_pending_writes.get() - 1);
            return Err(e);
        }
        Ok(())
    }

    /// Queues one chunked-framed body fragment.
    fn write_chunk_to_client(&self, data: &[u8]) -> io::Result<()> {
        let csck = match self.csck() {
            Some(csck) => csck,
            None => return Ok(()),
        };
        let head = format!("{:X}\r\n", data.len());
        self.res_ever_sent.set(true);
        self.res_pending_writes
            .set(self.res_pending_writes.get() + 1);
        if let Err(e) = csck.writev(&[head.as_bytes(), data, b"\r\n"], SVR_WRCTX, None) {
            self.res_pending_writes
                .set(self.res_pending_writes.get() - 1);
            return Err(e);
        }
        Ok(())
    }

    /// Queues the EOF marker toward the client.
    pub fn write_eof_to_client(&self) -> io::Result<()> {
        let csck = match self.csck() {
            Some(csck) => csck,
            None => return Ok(()),
        };
        self.res_pending_writes
            .set(self.res_pending_writes.get() + 1);
        if let Err(e) = csck.write_eof(SVR_WRCTX) {
            self.res_pending_writes
                .set(self.res_pending_writes.get() - 1);
            return Err(e);
        }
        Ok(())
    }

    // --- response composition ----------------------------------------------

    /// Begins a streamed response: status line plus the connection-owned
    /// headers, buffered in the client scratch until `endreshdr`.
    pub fn startreshdr(
        &self,
        status_code: u16,
        status_desc: Option<&str>,
        chunked: bool,
    ) -> io::Result<()> {
        let cli = match self.cli() {
            Some(cli) => cli,
            None => return Ok(()),
        };
        debug_assert!(!self.res_started.get() && !self.res_ended.get());
        let server_name = self.htts().map(|h| h.server_name()).unwrap_or_default();
        let mut sbuf = cli.sbuf_mut();
        sbuf.clear();
        sbuf.push_str(&format!(
            "HTTP/{}.{} {} {}\r\nServer: {}\r\nDate: {}\r\n",
            self.version.major,
            self.version.minor,
            status_code,
            status_desc.unwrap_or_else(|| status_text(status_code)),
            server_name,
            fmt_http_time(std::time::SystemTime::now()),
        ));
        if chunked {
            sbuf.push_str("Transfer-Encoding: chunked\r\n");
        }
        sbuf.push_str(if self.keep_alive.get() {
            "Connection: keep-alive\r\n"
        } else {
            "Connection: close\r\n"
        });
        drop(sbuf);
        self.res_chunked.set(chunked);
        self.res_started.set(true);
        self.status_code.set(status_code);
        Ok(())
    }

    /// Appends one passthrough header unless it belongs to the
    /// connection-owned set.
    pub fn addreshdr(&self, key: &str, value: &str) -> io::Result<()> {
        if !is_res_header_acceptable(key) {
            return Ok(());
        }
        if let Some(cli) = self.cli() {
            cli.sbuf_mut()
                .push_str(&format!("{}: {}\r\n", key, value));
        }
        Ok(())
    }

    /// Appends every value recorded for one header key.
    pub fn addreshdrs(&self, key: &str, values: &[String]) -> io::Result<()> {
        if !is_res_header_acceptable(key) {
            return Ok(());
        }
        if let Some(cli) = self.cli() {
            let mut sbuf = cli.sbuf_mut();
            for value in values {
                sbuf.push_str(&format!("{}: {}\r\n", key, value));
            }
        }
        Ok(())
    }

    /// Terminates the header block and flushes it to the client.
    pub fn endreshdr(&self) -> io::Result<()> {
        let cli = match self.cli() {
            Some(cli) => cli,
            None => return Ok(()),
        };
        let buf = {
            let mut sbuf = cli.sbuf_mut();
            sbuf.push_str("\r\n");
            std::mem::take(&mut *sbuf)
        };
        self.write_to_client(buf.as_bytes())
    }

    /// Writes one body fragment in the framing chosen at `startreshdr`.
    pub fn addresbody(&self, data: &[u8]) -> io::Result<()> {
        if self.csck().is_none() {
            return Ok(());
        }
        if self.res_chunked.get() {
            self.write_chunk_to_client(data)
        } else {
            self.write_to_client(data)
        }
    }

    /// Streams a file span to the client with `sendfile`.
    pub fn addresbody_from_file(&self, fd: i32, foff: u64, len: usize) -> io::Result<()> {
        let csck = match self.csck() {
            Some(csck) => csck,
            None => return Ok(()),
        };
        self.res_ever_sent.set(true);
        self.res_pending_writes
            .set(self.res_pending_writes.get() + 1);
        if let Err(e) = csck.sendfile(fd, foff, len, SVR_WRCTX) {
            self.res_pending_writes
                .set(self.res_pending_writes.get() - 1);
            return Err(e);
        }
        Ok(())
    }

    /// Ends the response body: the terminating zero chunk for chunked
    /// framing, a last-resort 500 when nothing was ever sent, and the EOF
    /// marker when the connection is closing.
    pub fn endbody(&self) -> io::Result<()> {
        if self.res_ended.replace(true) {
            return Ok(());
        }
        if !self.res_ever_sent.get() {
            self.sendfinalres(status::INTERNAL_SERVER_ERROR, None, None, false)?;
        } else if self.res_chunked.get() && self.csck().is_some() {
            self.write_to_client(b"0\r\n\r\n")?;
        }
        if !self.keep_alive.get() && self.csck().is_some() {
            self.write_eof_to_client()?;
        }
        Ok(())
    }

    /// Emits a complete minimal response. The body defaults to the status
    /// text; redirects carry a `Location` and no body; HEAD suppresses the
    /// body bytes.
    pub fn sendfinalres(
        &self,
        status_code: u16,
        content_type: Option<&str>,
        content_text: Option<&str>,
        force_close: bool,
    ) -> io::Result<()> {
        let cli = match self.cli() {
            Some(cli) => cli,
            None => return Ok(()),
        };
        let status_msg = status_text(status_code);
        let force_close = force_close || !self.keep_alive.get();
        if force_close {
            self.keep_alive.set(false);
        }
        let server_name = self.htts().map(|h| h.server_name()).unwrap_or_default();

        let mut res = format!(
            "HTTP/{}.{} {} {}\r\nServer: {}\r\nDate: {}\r\nConnection: {}\r\n",
            self.version.major,
            self.version.minor,
            status_code,
            status_msg,
            server_name,
            fmt_http_time(std::time::SystemTime::now()),
            if force_close { "close" } else { "keep-alive" },
        );

        let mut content_text = content_text.unwrap_or(status_msg);
        if let Some(ct) = content_type {
            res.push_str(&format!("Content-Type: {}\r\n", ct));
        }

        let mut content_len = content_text.len();
        if self.method == Method::Head {
            // The length is retained for a plain 200; the bytes never go
            // out either way.
            if status_code != status::OK {
                content_len = 0;
            }
            content_text = "";
        }

        if matches!(
            status_code,
            status::MOVED_PERMANENTLY
                | status::MOVED_TEMPORARILY
                | status::TEMPORARY_REDIRECT
                | status::PERMANENT_REDIRECT
        ) {
            res.push_str(&format!(
                "Content-Length: 0\r\nLocation: {}{}\r\n\r\n",
                self.qpath,
                if self.qpath_ends_with_slash { "" } else { "/" }
            ));
        } else {
            res.push_str(&format!(
                "Content-Length: {}\r\n\r\n{}",
                content_len, content_text
            ));
        }

        self.status_code.set(status_code);
        drop(cli);
        self.write_to_client(res.as_bytes())?;
        if force_close {
            self.write_eof_to_client()?;
        }
        Ok(())
    }

    /// Handles `Expect:` on the request: an intermediate `100 Continue`
    /// when honored, `417` (and an error return) otherwise. `no_100`
    /// suppresses the interim response without failing the expectation.
    pub fn handle_expect100(&self, no_100: bool) -> io::Result<()> {
        if self.req_flags & ATTR_EXPECT100 != 0 {
            if !no_100
                && self.version.cmp_numbers(1, 1).is_ge()
                && self.have_req_content()
                && self.method != Method::Get
                && self.method != Method::Head
            {
                let msg = format!(
                    "HTTP/{}.{} {} {}\r\n\r\n",
                    self.version.major,
                    self.version.minor,
                    status::CONTINUE,
                    status_text(status::CONTINUE)
                );
                if self.csck().is_some() {
                    self.write_to_client(msg.as_bytes())?;
                }
                // An interim response doesn't count as the real one.
                self.res_ever_sent.set(false);
            }
        } else if self.req_flags & ATTR_EXPECT != 0 {
            self.sendfinalres(status::EXPECTATION_FAILED, None, None, true)?;
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unsupported expectation",
            ));
        }
        Ok(())
    }
}

/// The task interface the client plumbing drives. The default peer hooks
/// fit tasks without a live peer device.
pub trait Task {
    fn core(&self) -> &TaskCore;

    /// Halts whatever peer device the task holds.
    fn halt_peer(&self) {}

    /// Toggles read interest on the peer.
    fn set_peer_read(&self, _enabled: bool) -> io::Result<()> {
        Ok(())
    }

    /// Body bytes arriving from the client, to be routed to the peer.
    fn on_client_body(&self, _data: &[u8]) -> io::Result<()> {
        Ok(())
    }

    /// The client request has been fully received (or cut short by EOF);
    /// tasks signal EOF toward their peer here.
    fn on_client_req_end(self: Rc<Self>, _eof: bool) -> io::Result<()> {
        Ok(())
    }

    /// A write toward the client was acknowledged; streaming tasks pump
    /// their next fragment here.
    fn on_client_write_ack(self: Rc<Self>) -> io::Result<()> {
        Ok(())
    }

    /// The client socket is gone for good.
    fn on_client_gone(&self) {}
}

/// Halts the client socket and the peer; the four-halves cascade tears the
/// rest down.
pub fn halt_participating_devices(task: &Rc<dyn Task>) {
    if let Some(csck) = task.core().csck() {
        csck.halt();
    }
    task.halt_peer();
}

/// Records completion of one or more flow halves and drives the cascade:
/// read interest drops on a completed source, and when all four halves
/// are over the peer is halted and the client is either recycled
/// (keep-alive) or shut down.
pub fn mark_over(task: &Rc<dyn Task>, bits: u8) {
    let core = task.core();
    let old = core.over.get();
    core.over.set(old | bits);
    let new = core.over.get();
    if old == new {
        return;
    }
    debug!(
        "task over-mask {:04b} | {:04b} -> {:04b}",
        old, bits, new
    );

    if old & OVER_READ_FROM_CLIENT == 0 && new & OVER_READ_FROM_CLIENT != 0 {
        if let Some(csck) = core.csck() {
            if csck.read(false).is_err() {
                csck.halt();
            }
        }
    }

    if old & OVER_READ_FROM_PEER == 0 && new & OVER_READ_FROM_PEER != 0 {
        if task.set_peer_read(false).is_err() {
            task.halt_peer();
        }
    }

    if old != OVER_ALL && new == OVER_ALL {
        task.halt_peer();
        let keep = core.keep_alive.get() && !core.client_eof.get() && !core.client_disconnected.get();
        if keep {
            unbind_task_from_client(task, false);
        } else if let Some(csck) = core.csck() {
            let _ = csck.shutdown(SHUTDOWN_WRITE);
            csck.halt();
        }
    }
}

/// Detaches the task from its client: restores the parser callbacks,
/// clears the mutual links, re-enables reading for keep-alive, and replays
/// any bytes that arrived beyond the request. Dropping the client's strong
/// reference here is what ultimately frees the task.
pub fn unbind_task_from_client(task: &Rc<dyn Task>, disconnected: bool) {
    let core = task.core();
    if core.unbound.replace(true) {
        return;
    }
    let cli = core.cli();
    let csck = core.csck.borrow_mut().take();
    *core.cli.borrow_mut() = Weak::new();

    if let Some(cli) = &cli {
        if let Some(recbs) = core.org_recbs.borrow_mut().take() {
            cli.htrd().set_recbs(recbs);
        }
        // Only drop the binding if it is still ours.
        if let Some(bound) = cli.task() {
            if Rc::ptr_eq(&bound, task) {
                cli.clear_task();
            }
        }
        if !disconnected {
            if core.keep_alive.get() {
                match csck {
                    Some(csck) if csck.read(true).is_ok() => {
                        cli.touch();
                        cli.replay_pending();
                    }
                    Some(csck) => csck.halt(),
                    None => {}
                }
            } else if let Some(csck) = csck {
                csck.halt();
            }
        }
    }
}

/// Routes the client request body into the task: `push_content` forwards
/// fragments, `poke` ends the client flow. The dispatcher's `peek` stays
/// in place for the next request on the connection.
pub(crate) fn setup_content_routing(task: &Rc<dyn Task>, cli: &Rc<Cli>) {
    let org = cli.htrd().recbs();
    task.core().save_recbs(org.clone());
    let w_poke = Rc::downgrade(task);
    let w_push = Rc::downgrade(task);
    cli.htrd().set_recbs(Recbs {
        peek: org.peek,
        poke: Some(Rc::new(move |_htrd, _re| {
            if let Some(task) = w_poke.upgrade() {
                let r = task.clone().on_client_req_end(false);
                mark_over(&task, OVER_READ_FROM_CLIENT);
                r?;
            }
            Ok(())
        })),
        push_content: Some(Rc::new(move |_htrd, _re, data| match w_push.upgrade() {
            Some(task) => task.on_client_body(data),
            None => Ok(()),
        })),
    });
}

/// Links a constructed task to its client and service and arranges for
/// the request body (or its absence) to flow.
pub(crate) fn bind_task(htts: &Rc<Htts>, cli: &Rc<Cli>, task: &Rc<dyn Task>) -> io::Result<()> {
    if htts.ntasks.get() > htts.task_max.get() {
        return Err(io::Error::new(io::ErrorKind::Other, "too many tasks"));
    }
    cli.set_task(task.clone())?;
    htts.add_task(task);
    if task.core().have_req_content() {
        setup_content_routing(task, cli);
    } else {
        // Nothing to upload: indicate EOF to the peer right away and stop
        // watching the client's input.
        task.clone().on_client_req_end(false)?;
        mark_over(task, OVER_READ_FROM_CLIENT | OVER_WRITE_TO_PEER);
    }
    if !task.core().is_over(OVER_READ_FROM_CLIENT) {
        if let Some(csck) = task.core().csck() {
            csck.read(true)?;
        }
    }
    Ok(())
}

fn is_res_header_acceptable(key: &str) -> bool {
    !(key.eq_ignore_ascii_case("Status")
        || key.eq_ignore_ascii_case("Connection")
        || key.eq_ignore_ascii_case("Transfer-Encoding")
        || key.eq_ignore_ascii_case("Server")
        || key.eq_ignore_ascii_case("Date"))
}
