//! FastCGI: a shared client service multiplexing request sessions over
//! persistent upstream connections, and the task that speaks it on behalf
//! of an HTTP request.

use std::cell::{Cell, RefCell};
use std::io;
use std::rc::{Rc, Weak};

use log::{debug, warn};

use crate::http::cgi::choose_framing;
use crate::http::htrd::{Htrd, Recbs, OPT_RESPONSE, OPT_SKIP_INITIAL_LINE};
use crate::http::htre::Htre;
use crate::http::svr::{Cli, Htts};
use crate::http::task::{
    bind_task, halt_participating_devices, mark_over, unbind_task_from_client, Task, TaskCore,
    OVER_READ_FROM_PEER, OVER_WRITE_TO_PEER,
};
use crate::http::{merge_paths, status};
use crate::sck::{DevSck, SckCbs, SckConnect, SckMake, SckType};
use crate::skad::SkAd;
use crate::svc::Svc;
use crate::util::Slab;
use crate::Hio;

const FCGI_VERSION: u8 = 1;

const FCGI_BEGIN_REQUEST: u8 = 1;
const FCGI_END_REQUEST: u8 = 3;
const FCGI_PARAMS: u8 = 4;
const FCGI_STDIN: u8 = 5;
const FCGI_STDOUT: u8 = 6;
const FCGI_STDERR: u8 = 7;

const FCGI_ROLE_RESPONDER: u16 = 1;

const RECORD_HEADER_LEN: usize = 8;

fn encode_record(typ: u8, id: u16, content: &[u8]) -> Vec<u8> {
    debug_assert!(content.len() <= u16::MAX as usize);
    let mut out = Vec::with_capacity(RECORD_HEADER_LEN + content.len());
    out.push(FCGI_VERSION);
    out.push(typ);
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&(content.len() as u16).to_be_bytes());
    out.push(0); // no padding
    out.push(0); // reserved
    out.extend_from_slice(content);
    out
}

/// Appends one name/value pair in FastCGI encoding: lengths below 128 take
/// one byte, larger ones four with the top bit set.
fn encode_nv(out: &mut Vec<u8>, key: &[u8], value: &[u8]) {
    for len in [key.len(), value.len()] {
        if len < 128 {
            out.push(len as u8);
        } else {
            out.extend_from_slice(&((len as u32) | 0x8000_0000).to_be_bytes());
        }
    }
    out.extend_from_slice(key);
    out.extend_from_slice(value);
}

type SessOnRead = Rc<dyn Fn(&Rc<FcgiSess>, io::Result<&[u8]>) -> io::Result<()>>;
type SessOnUntie = Rc<dyn Fn(&Rc<FcgiSess>)>;

/// One request session multiplexed on an upstream connection. The record
/// id on the wire is the slab slot plus one.
pub struct FcgiSess {
    conn: RefCell<Weak<FcgiConn>>,
    sid: Cell<usize>,
    active: Cell<bool>,
    on_read: SessOnRead,
    on_untie: SessOnUntie,
}

impl FcgiSess {
    fn record_id(&self) -> u16 {
        (self.sid.get() + 1) as u16
    }

    fn conn(&self) -> io::Result<Rc<FcgiConn>> {
        self.conn
            .borrow()
            .upgrade()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "upstream gone"))
    }

    /// Starts the request on the wire: `BEGIN_REQUEST` with the RESPONDER
    /// role.
    pub fn begin_request(&self) -> io::Result<()> {
        let mut body = Vec::with_capacity(8);
        body.extend_from_slice(&FCGI_ROLE_RESPONDER.to_be_bytes());
        body.push(0); // flags: the server may close after this request
        body.extend_from_slice(&[0u8; 5]);
        self.conn()?
            .send(&encode_record(FCGI_BEGIN_REQUEST, self.record_id(), &body))
    }

    pub fn write_param(&self, key: &str, value: &str) -> io::Result<()> {
        let mut body = Vec::with_capacity(key.len() + value.len() + 8);
        encode_nv(&mut body, key.as_bytes(), value.as_bytes());
        self.conn()?
            .send(&encode_record(FCGI_PARAMS, self.record_id(), &body))
    }

    /// The empty `PARAMS` record terminating the parameter stream.
    pub fn end_params(&self) -> io::Result<()> {
        self.conn()?
            .send(&encode_record(FCGI_PARAMS, self.record_id(), &[]))
    }

    /// Forwards request body bytes; an empty slice ends the stream.
    pub fn write_stdin(&self, data: &[u8]) -> io::Result<()> {
        let conn = self.conn()?;
        if data.is_empty() {
            return conn.send(&encode_record(FCGI_STDIN, self.record_id(), &[]));
        }
        for chunk in data.chunks(0xFFF8) {
            conn.send(&encode_record(FCGI_STDIN, self.record_id(), chunk))?;
        }
        Ok(())
    }

    /// Releases the session. The untie callback does not fire for a
    /// self-initiated untie.
    pub fn untie(self: &Rc<Self>) {
        if !self.active.replace(false) {
            return;
        }
        if let Some(conn) = self.conn.borrow().upgrade() {
            conn.sess.borrow_mut().remove(self.sid.get());
        }
        *self.conn.borrow_mut() = Weak::new();
    }
}

/// State of one upstream connection: the socket device, the live
/// sessions, and the inbound record assembly buffer.
pub(crate) struct FcgiConn {
    addr: SkAd,
    dev: RefCell<Option<Rc<DevSck>>>,
    sess: RefCell<Slab<Rc<FcgiSess>>>,
    rbuf: RefCell<Vec<u8>>,
    broken: Cell<bool>,
}

impl FcgiConn {
    fn send(&self, record: &[u8]) -> io::Result<()> {
        match self.dev.borrow().clone() {
            Some(dev) => dev.write(record, 0, None),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "upstream connection is down",
            )),
        }
    }

    /// Parses complete records out of the assembly buffer and routes
    /// `STDOUT`/`END_REQUEST` to their sessions.
    fn take_records(self: &Rc<Self>, data: &[u8]) {
        let mut rbuf = self.rbuf.borrow_mut();
        rbuf.extend_from_slice(data);
        loop {
            if rbuf.len() < RECORD_HEADER_LEN {
                return;
            }
            let clen = u16::from_be_bytes([rbuf[4], rbuf[5]]) as usize;
            let plen = rbuf[6] as usize;
            let total = RECORD_HEADER_LEN + clen + plen;
            if rbuf.len() < total {
                return;
            }
            let typ = rbuf[1];
            let id = u16::from_be_bytes([rbuf[2], rbuf[3]]);
            let content: Vec<u8> = rbuf[RECORD_HEADER_LEN..RECORD_HEADER_LEN + clen].to_vec();
            rbuf.drain(..total);

            let sess = if id > 0 {
                self.sess.borrow().get(id as usize - 1).cloned()
            } else {
                None
            };
            match typ {
                FCGI_STDOUT => {
                    if let Some(sess) = sess {
                        if (sess.on_read)(&sess, Ok(&content[..])).is_err() {
                            sess.untie();
                        }
                    }
                }
                FCGI_STDERR => {
                    if !content.is_empty() {
                        warn!(
                            "fcgi upstream stderr: {}",
                            String::from_utf8_lossy(&content)
                        );
                    }
                }
                FCGI_END_REQUEST => {
                    if let Some(sess) = sess {
                        // Make sure the output stream has ended before the
                        // session goes away.
                        let _ = (sess.on_read)(&sess, Ok(&[][..]));
                        sess.untie();
                    }
                }
                _ => debug!("ignoring fcgi record type {}", typ),
            }
        }
    }

    /// Tears the connection down, untying every session.
    fn breakdown(self: &Rc<Self>) {
        if self.broken.replace(true) {
            return;
        }
        let sessions: Vec<_> = self
            .sess
            .borrow()
            .iter()
            .map(|(_, s)| s.clone())
            .collect();
        for sess in sessions {
            if sess.active.replace(false) {
                *sess.conn.borrow_mut() = Weak::new();
                (sess.on_untie)(&sess);
            }
        }
        if let Some(dev) = self.dev.borrow_mut().take() {
            dev.halt();
        }
    }
}

/// The FastCGI client service: owns upstream connections keyed by
/// address and hands out sessions.
pub struct FcgiClient {
    hio: Weak<Hio>,
    conns: RefCell<Vec<Rc<FcgiConn>>>,
}

impl FcgiClient {
    pub fn start(hio: &Rc<Hio>) -> Rc<FcgiClient> {
        let fcgic = Rc::new(FcgiClient {
            hio: Rc::downgrade(hio),
            conns: RefCell::new(Vec::new()),
        });
        hio.register_svc(fcgic.clone());
        fcgic
    }

    pub fn stop(self: &Rc<Self>) {
        let conns: Vec<_> = self.conns.borrow_mut().drain(..).collect();
        for conn in conns {
            conn.breakdown();
        }
        if let Some(hio) = self.hio.upgrade() {
            let svc: Rc<dyn Svc> = self.clone();
            hio.unregister_svc(&svc);
        }
    }

    /// Allocates a session toward the server at `addr`, reusing or
    /// establishing the connection.
    pub fn tie(
        self: &Rc<Self>,
        addr: &SkAd,
        on_read: SessOnRead,
        on_untie: SessOnUntie,
    ) -> io::Result<Rc<FcgiSess>> {
        let conn = self.conn_for(addr)?;
        let sess = Rc::new(FcgiSess {
            conn: RefCell::new(Rc::downgrade(&conn)),
            sid: Cell::new(0),
            active: Cell::new(true),
            on_read,
            on_untie,
        });
        sess.sid.set(conn.sess.borrow_mut().insert(sess.clone()));
        Ok(sess)
    }

    fn conn_for(self: &Rc<Self>, addr: &SkAd) -> io::Result<Rc<FcgiConn>> {
        if let Some(conn) = self
            .conns
            .borrow()
            .iter()
            .find(|c| c.addr == *addr && !c.broken.get())
        {
            return Ok(conn.clone());
        }

        let hio = self
            .hio
            .upgrade()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "loop gone"))?;
        let typ = match addr.family() as libc::c_int {
            libc::AF_INET => SckType::Tcp4,
            libc::AF_INET6 => SckType::Tcp6,
            libc::AF_UNIX => SckType::Unix,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "unsupported upstream address family",
                ))
            }
        };

        let conn = Rc::new(FcgiConn {
            addr: *addr,
            dev: RefCell::new(None),
            sess: RefCell::new(Slab::new()),
            rbuf: RefCell::new(Vec::new()),
            broken: Cell::new(false),
        });

        let w_read = Rc::downgrade(&conn);
        let w_disc = Rc::downgrade(&conn);
        let dev = DevSck::make(
            &hio,
            SckMake {
                typ,
                options: 0,
                cbs: SckCbs {
                    on_read: Rc::new(move |_sck, res, _src| {
                        let conn = match w_read.upgrade() {
                            Some(conn) => conn,
                            None => return Ok(()),
                        };
                        match res {
                            Ok(data) if !data.is_empty() => conn.take_records(data),
                            _ => conn.breakdown(),
                        }
                        Ok(())
                    }),
                    on_disconnect: Rc::new(move |_sck| {
                        if let Some(conn) = w_disc.upgrade() {
                            conn.breakdown();
                        }
                    }),
                    ..Default::default()
                },
            },
        )?;
        dev.connect(&SckConnect {
            addr: *addr,
            connect_tmout: None,
        })?;

        *conn.dev.borrow_mut() = Some(dev);
        self.conns.borrow_mut().push(conn.clone());
        debug!("fcgi upstream connection to {} started", addr);
        Ok(conn)
    }
}

impl Svc for FcgiClient {
    fn svc_stop(self: Rc<Self>) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------

struct FcgiTask {
    core: TaskCore,
    peer: RefCell<Option<Rc<FcgiSess>>>,
    peer_htrd: RefCell<Option<Rc<Htrd>>>,
}

impl Task for FcgiTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn halt_peer(&self) {
        if let Some(sess) = self.peer.borrow_mut().take() {
            sess.untie();
        }
    }

    fn on_client_body(&self, data: &[u8]) -> io::Result<()> {
        match self.peer.borrow().clone() {
            Some(sess) => sess.write_stdin(data),
            None => Ok(()),
        }
    }

    fn on_client_req_end(self: Rc<Self>, _eof: bool) -> io::Result<()> {
        let r = match self.peer.borrow().clone() {
            Some(sess) => sess.write_stdin(&[]),
            None => Ok(()),
        };
        // The writes ride on the shared upstream connection; once the end
        // marker is queued the task-to-peer flow is done.
        let task: Rc<dyn Task> = self.clone();
        mark_over(&task, OVER_WRITE_TO_PEER);
        r
    }
}

impl Drop for FcgiTask {
    fn drop(&mut self) {
        if let Some(sess) = self.peer.borrow_mut().take() {
            sess.untie();
        }
    }
}

impl Htts {
    /// Makes the FastCGI client service available; tasks started with
    /// [`dofcgi`](Htts::dofcgi) require it.
    pub fn enable_fcgic(self: &Rc<Self>) -> io::Result<()> {
        if self.fcgic.borrow().is_some() {
            return Ok(());
        }
        let hio = self
            .hio()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "loop gone"))?;
        *self.fcgic.borrow_mut() = Some(FcgiClient::start(&hio));
        Ok(())
    }

    /// Forwards the request to the FastCGI server at `fcgis_addr`.
    pub fn dofcgi(
        self: &Rc<Self>,
        cli: &Rc<Cli>,
        req: &Htre,
        fcgis_addr: &SkAd,
        docroot: &str,
        script: &str,
    ) -> io::Result<()> {
        let fcgic = self.fcgic.borrow().clone().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::Other,
                "fcgi client service not enabled",
            )
        })?;
        debug!(
            "fcgi task for client {}: [{}] {} via {}",
            cli.addr_str(),
            req.qmethod_name(),
            script,
            fcgis_addr
        );

        if cli.task().is_some() {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "duplicate task request prohibited",
            ));
        }
        let fcgi = Rc::new(FcgiTask {
            core: TaskCore::new(self, cli, req),
            peer: RefCell::new(None),
            peer_htrd: RefCell::new(None),
        });
        let task: Rc<dyn Task> = fcgi.clone();

        let r = (|| -> io::Result<()> {
            let peer_htrd = Rc::new(Htrd::new(OPT_RESPONSE | OPT_SKIP_INITIAL_LINE));
            install_peer_htrd_recbs(&peer_htrd, Rc::downgrade(&fcgi));

            let w_read = Rc::downgrade(&fcgi);
            let w_untie = Rc::downgrade(&fcgi);
            let sess = fcgic.tie(
                fcgis_addr,
                Rc::new(move |_sess, res| {
                    let fcgi = match w_read.upgrade() {
                        Some(fcgi) => fcgi,
                        None => return Ok(()),
                    };
                    fcgi_peer_on_read(&fcgi, res);
                    Ok(())
                }),
                Rc::new(move |_sess| {
                    let fcgi = match w_untie.upgrade() {
                        Some(fcgi) => fcgi,
                        None => return,
                    };
                    // The upstream went away; whatever has been sent is
                    // all the client will get.
                    fcgi.peer.borrow_mut().take();
                    let task: Rc<dyn Task> = fcgi.clone();
                    let _ = fcgi.core.endbody();
                    halt_participating_devices(&task);
                }),
            )?;
            *fcgi.peer.borrow_mut() = Some(sess.clone());
            *fcgi.peer_htrd.borrow_mut() = Some(peer_htrd);

            sess.begin_request()?;
            write_params(&fcgi, cli, req, docroot, script)?;
            sess.end_params()?;

            bind_task(self, cli, &task)?;
            fcgi.core.handle_expect100(false)?;
            Ok(())
        })();

        if let Err(e) = r {
            debug!("fcgi task setup failed: {}", e);
            let _ = fcgi
                .core
                .sendfinalres(status::INTERNAL_SERVER_ERROR, None, None, true);
            halt_participating_devices(&task);
            unbind_task_from_client(&task, false);
            return Err(e);
        }
        Ok(())
    }
}

fn fcgi_peer_on_read(fcgi: &Rc<FcgiTask>, res: io::Result<&[u8]>) {
    let task: Rc<dyn Task> = fcgi.clone();
    match res {
        Err(e) => {
            debug!("read failure from fcgi upstream: {}", e);
            halt_participating_devices(&task);
        }
        Ok(data) if data.is_empty() => {
            if !fcgi.core.is_over(OVER_READ_FROM_PEER) {
                let r = fcgi.core.endbody();
                mark_over(&task, OVER_READ_FROM_PEER);
                if r.is_err() {
                    halt_participating_devices(&task);
                }
            }
        }
        Ok(data) => {
            let htrd = fcgi.peer_htrd.borrow().clone();
            let htrd = match htrd {
                Some(htrd) => htrd,
                None => return,
            };
            if let Err(e) = htrd.feed(data) {
                debug!("unable to parse fcgi upstream output: {}", e);
                if !fcgi.core.res_started.get() {
                    let _ = fcgi
                        .core
                        .sendfinalres(status::BAD_GATEWAY, None, None, true);
                }
                halt_participating_devices(&task);
            }
        }
    }
}

fn install_peer_htrd_recbs(htrd: &Rc<Htrd>, weak: Weak<FcgiTask>) {
    let w_peek = weak.clone();
    let w_poke = weak.clone();
    let w_push = weak;
    htrd.set_recbs(Recbs {
        peek: Some(Rc::new(move |_htrd, re| {
            let fcgi = match w_peek.upgrade() {
                Some(fcgi) => fcgi,
                None => return Ok(()),
            };
            if fcgi.core.cli().is_none() {
                return Ok(());
            }
            let (status_code, status_desc, chunked) =
                choose_framing(fcgi.core.keep_alive.get(), re);
            if !chunked && re.flags() & crate::http::htre::ATTR_LENGTH == 0 {
                fcgi.core.keep_alive.set(false);
            }
            fcgi.core
                .startreshdr(status_code, status_desc.as_deref(), chunked)?;
            for (key, values) in re.headers().iter() {
                fcgi.core.addreshdrs(key, values)?;
            }
            fcgi.core.endreshdr()
        })),
        poke: Some(Rc::new(move |_htrd, _re| {
            let fcgi = match w_poke.upgrade() {
                Some(fcgi) => fcgi,
                None => return Ok(()),
            };
            let task: Rc<dyn Task> = fcgi.clone();
            let r = fcgi.core.endbody();
            mark_over(&task, OVER_READ_FROM_PEER);
            r
        })),
        push_content: Some(Rc::new(move |_htrd, _re, data| {
            let fcgi = match w_push.upgrade() {
                Some(fcgi) => fcgi,
                None => return Ok(()),
            };
            // No per-record flow control upstream; the client-side
            // pending-write counter alone paces this path.
            fcgi.core.addresbody(data)
        })),
    });
}

/// Streams the request parameters: the same variable set the CGI task
/// exports, as FastCGI name/value pairs.
fn write_params(fcgi: &Rc<FcgiTask>, cli: &Rc<Cli>, req: &Htre, docroot: &str, script: &str) -> io::Result<()> {
    let sess = match fcgi.peer.borrow().clone() {
        Some(sess) => sess,
        None => return Ok(()),
    };
    let htts = fcgi
        .core
        .htts()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "service gone"))?;
    let actual_script = merge_paths(docroot, script);

    sess.write_param("GATEWAY_INTERFACE", "FCGI/1.1")?;
    sess.write_param(
        "SERVER_PROTOCOL",
        &format!("HTTP/{}.{}", req.version().major, req.version().minor),
    )?;
    sess.write_param("DOCUMENT_ROOT", docroot)?;
    sess.write_param("SCRIPT_NAME", script)?;
    sess.write_param("SCRIPT_FILENAME", &actual_script)?;
    sess.write_param("REQUEST_METHOD", req.qmethod_name())?;
    sess.write_param("REQUEST_URI", req.qpath())?;
    if let Some(qparam) = req.qparam() {
        sess.write_param("QUERY_STRING", qparam)?;
    }
    if let Some(n) = req.req_content_len() {
        sess.write_param("CONTENT_LENGTH", &n.to_string())?;
    }
    sess.write_param("SERVER_SOFTWARE", &htts.server_name())?;
    if let Ok(local) = cli.sck().getsockaddr() {
        sess.write_param("SERVER_ADDR", &local.ip_string())?;
        sess.write_param("SERVER_NAME", &local.ip_string())?;
        sess.write_param("SERVER_PORT", &local.port().to_string())?;
    }
    if let Ok(remote) = cli.sck().getpeeraddr() {
        sess.write_param("REMOTE_ADDR", &remote.ip_string())?;
        sess.write_param("REMOTE_PORT", &remote.port().to_string())?;
    }
    for (key, values) in req.headers().iter() {
        if key.eq_ignore_ascii_case("Connection")
            || key.eq_ignore_ascii_case("Transfer-Encoding")
            || key.eq_ignore_ascii_case("Content-Length")
            || key.eq_ignore_ascii_case("Expect")
        {
            continue;
        }
        let mut name = String::with_capacity(key.len() + 5);
        name.push_str("HTTP_");
        for ch in key.chars() {
            name.push(match ch {
                '-' => '_',
                ch => ch.to_ascii_uppercase(),
            });
        }
        sess.write_param(&name, &values.join(","))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_layout() {
        let rec = encode_record(FCGI_BEGIN_REQUEST, 1, &[0, 1, 0, 0, 0, 0, 0, 0]);
        assert_eq!(rec.len(), 16);
        assert_eq!(rec[0], 1); // version
        assert_eq!(rec[1], FCGI_BEGIN_REQUEST);
        assert_eq!(u16::from_be_bytes([rec[2], rec[3]]), 1);
        assert_eq!(u16::from_be_bytes([rec[4], rec[5]]), 8);
        assert_eq!(rec[6], 0);
    }

    #[test]
    fn nv_lengths() {
        let mut out = Vec::new();
        encode_nv(&mut out, b"K", b"V");
        assert_eq!(out, vec![1, 1, b'K', b'V']);

        let mut out = Vec::new();
        let long = vec![b'x'; 200];
        encode_nv(&mut out, b"K", &long);
        assert_eq!(out[0], 1);
        assert_eq!(&out[1..5], &(200u32 | 0x8000_0000).to_be_bytes());
        assert_eq!(out.len(), 1 + 4 + 1 + 200);
    }
}
