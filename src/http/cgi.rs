//! The CGI task: forks a script with the classic CGI/1.1 environment,
//! feeds it the request body, and parses its reply back into the
//! client-facing response.

use std::cell::{Cell, RefCell};
use std::ffi::{CString, OsString};
use std::io;
use std::rc::{Rc, Weak};

use log::debug;

use crate::http::htrd::{Htrd, Recbs, OPT_RESPONSE, OPT_SKIP_INITIAL_LINE};
use crate::http::htre::{parse_status_header_value, Htre, ATTR_LENGTH};
use crate::http::svr::{Cli, Htts};
use crate::http::task::{
    bind_task, halt_participating_devices, mark_over, unbind_task_from_client, Task, TaskCore,
    OVER_READ_FROM_CLIENT, OVER_READ_FROM_PEER, OVER_WRITE_TO_PEER, PENDING_IO_THRESHOLD,
};
use crate::http::status;
use crate::pro::{DevPro, ProMake, ProSid, PRO_ERRTONUL, PRO_READOUT, PRO_WRITEIN};
use crate::Hio;

/// Never answer `Expect: 100-continue` with an interim response.
pub const CGI_NO_100_CONTINUE: u32 = 1 << 0;

struct CgiTask {
    core: TaskCore,
    peer: RefCell<Option<Rc<DevPro>>>,
    peer_htrd: RefCell<Option<Rc<Htrd>>>,
    peer_pending_writes: Cell<usize>,
    ntask_inced: Cell<bool>,
}

impl CgiTask {
    fn write_to_peer(&self, data: &[u8]) -> io::Result<()> {
        let peer = match self.peer.borrow().clone() {
            Some(peer) => peer,
            None => return Ok(()),
        };
        self.peer_pending_writes
            .set(self.peer_pending_writes.get() + 1);
        if let Err(e) = peer.write(data, 0) {
            self.peer_pending_writes
                .set(self.peer_pending_writes.get() - 1);
            return Err(e);
        }
        if self.peer_pending_writes.get() > PENDING_IO_THRESHOLD {
            // The child is not draining its input; pause the client.
            if let Some(csck) = self.core.csck() {
                csck.read(false)?;
            }
        }
        Ok(())
    }

    fn dec_cgi_count(&self) {
        if self.ntask_inced.replace(false) {
            if let Some(htts) = self.core.htts() {
                htts.ntask_cgis.set(htts.ntask_cgis.get() - 1);
            }
        }
    }
}

impl Task for CgiTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn halt_peer(&self) {
        if let Some(peer) = self.peer.borrow().clone() {
            peer.halt();
        }
    }

    fn set_peer_read(&self, enabled: bool) -> io::Result<()> {
        match self.peer.borrow().clone() {
            Some(peer) => peer.read(ProSid::Out, enabled),
            None => Ok(()),
        }
    }

    fn on_client_body(&self, data: &[u8]) -> io::Result<()> {
        self.write_to_peer(data)
    }

    fn on_client_req_end(self: Rc<Self>, _eof: bool) -> io::Result<()> {
        // Indicate EOF on the child's stdin.
        self.write_to_peer(&[])
    }

    fn on_client_gone(&self) {
        // With the client gone nothing reads the child's output and
        // nothing feeds its input; close both pipes so the child sees EOF
        // instead of blocking.
        if let Some(peer) = self.peer.borrow().clone() {
            peer.close_sid(ProSid::In);
            peer.close_sid(ProSid::Out);
        }
    }
}

impl Drop for CgiTask {
    fn drop(&mut self) {
        self.dec_cgi_count();
        if let Some(peer) = self.peer.borrow().clone() {
            peer.halt();
        }
    }
}

impl Htts {
    /// Executes `script` under `docroot` as a CGI program for the request.
    pub fn docgi(
        self: &Rc<Self>,
        cli: &Rc<Cli>,
        req: &Htre,
        docroot: &str,
        script: &str,
        options: u32,
    ) -> io::Result<()> {
        let hio = self
            .hio()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "loop gone"))?;
        let actual_script = crate::http::merge_paths(docroot, script);
        debug!(
            "cgi task for client {}: [{}] {}",
            cli.addr_str(),
            req.qmethod_name(),
            actual_script
        );

        if cli.task().is_some() {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "duplicate task request prohibited",
            ));
        }
        let cgi = Rc::new(CgiTask {
            core: TaskCore::new(self, cli, req),
            peer: RefCell::new(None),
            peer_htrd: RefCell::new(None),
            peer_pending_writes: Cell::new(0),
            ntask_inced: Cell::new(false),
        });
        let task: Rc<dyn Task> = cgi.clone();

        let mut fail_status = status::INTERNAL_SERVER_ERROR;
        let r = (|| -> io::Result<()> {
            if self.ntask_cgis.get() >= self.task_cgi_max.get() {
                fail_status = status::SERVICE_UNAVAILABLE;
                return Err(io::Error::new(io::ErrorKind::Other, "too many cgi tasks"));
            }
            self.ntask_cgis.set(self.ntask_cgis.get() + 1);
            cgi.ntask_inced.set(true);

            let cpath = CString::new(actual_script.as_str())
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
            if unsafe { libc::access(cpath.as_ptr(), libc::X_OK) } == -1 {
                fail_status = status::FORBIDDEN;
                return Err(io::Error::last_os_error());
            }

            bind_task_to_peer(&hio, self, cli, &cgi, req, docroot, script, &actual_script)?;
            bind_task(self, cli, &task)?;
            cgi.core
                .handle_expect100(options & CGI_NO_100_CONTINUE != 0)?;
            Ok(())
        })();

        if let Err(e) = r {
            debug!("cgi task setup failed: {}", e);
            let _ = cgi.core.sendfinalres(fail_status, None, None, true);
            halt_participating_devices(&task);
            unbind_task_from_client(&task, false);
            return Err(e);
        }
        Ok(())
    }
}

/// Creates the child process and the response parser for its output, and
/// wires both back into the task through weak references.
#[allow(clippy::too_many_arguments)]
fn bind_task_to_peer(
    hio: &Rc<Hio>,
    htts: &Rc<Htts>,
    cli: &Rc<Cli>,
    cgi: &Rc<CgiTask>,
    req: &Htre,
    docroot: &str,
    script: &str,
    actual_script: &str,
) -> io::Result<()> {
    let envs = build_cgi_env(htts, cli, req, docroot, script, actual_script);

    let peer_htrd = Rc::new(Htrd::new(OPT_RESPONSE | OPT_SKIP_INITIAL_LINE));
    install_peer_htrd_recbs(&peer_htrd, Rc::downgrade(cgi));

    let w_read = Rc::downgrade(cgi);
    let w_write = Rc::downgrade(cgi);
    let w_close = Rc::downgrade(cgi);
    let peer = DevPro::make(
        hio,
        ProMake {
            flags: PRO_READOUT | PRO_ERRTONUL | PRO_WRITEIN,
            cmd: actual_script.to_string(),
            args: Vec::new(),
            envs,
            on_read: Rc::new(move |_pro, _sid, res| {
                let cgi = match w_read.upgrade() {
                    Some(cgi) => cgi,
                    None => return Ok(()),
                };
                cgi_peer_on_read(&cgi, res);
                Ok(())
            }),
            on_write: Rc::new(move |_pro, res, _wrctx| {
                let cgi = match w_write.upgrade() {
                    Some(cgi) => cgi,
                    None => return Ok(()),
                };
                cgi_peer_on_write(&cgi, res);
                Ok(())
            }),
            on_close: Rc::new(move |_pro, sid| {
                let cgi = match w_close.upgrade() {
                    Some(cgi) => cgi,
                    None => return,
                };
                cgi_peer_on_close(&cgi, sid);
            }),
        },
    )?;

    *cgi.peer.borrow_mut() = Some(peer);
    *cgi.peer_htrd.borrow_mut() = Some(peer_htrd);
    Ok(())
}

fn cgi_peer_on_read(cgi: &Rc<CgiTask>, res: io::Result<&[u8]>) {
    let task: Rc<dyn Task> = cgi.clone();
    match res {
        Err(e) => {
            debug!("read failure from cgi peer: {}", e);
            halt_participating_devices(&task);
        }
        Ok(data) if data.is_empty() => {
            if !cgi.core.is_over(OVER_READ_FROM_PEER) {
                // The script may exit without completing its framing;
                // whatever was chosen gets terminated here.
                let r = cgi.core.endbody();
                mark_over(&task, OVER_READ_FROM_PEER);
                if r.is_err() {
                    halt_participating_devices(&task);
                }
            }
        }
        Ok(data) => {
            let htrd = cgi.peer_htrd.borrow().clone();
            let htrd = match htrd {
                Some(htrd) => htrd,
                None => return,
            };
            if let Err(e) = htrd.feed(data) {
                debug!("unable to parse cgi peer output: {}", e);
                if !cgi.core.res_started.get() {
                    let _ = cgi
                        .core
                        .sendfinalres(status::BAD_GATEWAY, None, None, true);
                }
                halt_participating_devices(&task);
            }
        }
    }
}

fn cgi_peer_on_write(cgi: &Rc<CgiTask>, res: io::Result<usize>) {
    let task: Rc<dyn Task> = cgi.clone();
    match res {
        Err(e) => {
            debug!("write failure to cgi peer: {}", e);
            halt_participating_devices(&task);
        }
        Ok(0) => {
            cgi.peer_pending_writes
                .set(cgi.peer_pending_writes.get().saturating_sub(1));
            mark_over(&task, OVER_WRITE_TO_PEER);
        }
        Ok(_n) => {
            cgi.peer_pending_writes
                .set(cgi.peer_pending_writes.get().saturating_sub(1));
            if cgi.peer_pending_writes.get() == PENDING_IO_THRESHOLD
                && !cgi.core.is_over(OVER_READ_FROM_CLIENT)
            {
                if let Some(csck) = cgi.core.csck() {
                    if csck.read(true).is_err() {
                        halt_participating_devices(&task);
                        return;
                    }
                }
            }
            if cgi.core.is_over(OVER_READ_FROM_CLIENT) && cgi.peer_pending_writes.get() == 0 {
                mark_over(&task, OVER_WRITE_TO_PEER);
            }
        }
    }
}

fn cgi_peer_on_close(cgi: &Rc<CgiTask>, sid: ProSid) {
    let task: Rc<dyn Task> = cgi.clone();
    match sid {
        ProSid::Master => {
            cgi.peer.borrow_mut().take();
            cgi.peer_htrd.borrow_mut().take();
        }
        ProSid::Out => {
            // Child output is finished; the response toward the client
            // must end too.
            if !cgi.core.is_over(OVER_READ_FROM_PEER) {
                let r = cgi.core.endbody();
                mark_over(&task, OVER_READ_FROM_PEER);
                if r.is_err() {
                    halt_participating_devices(&task);
                }
            }
        }
        ProSid::In => {
            mark_over(&task, OVER_WRITE_TO_PEER);
        }
        ProSid::Err => {}
    }
}

/// Routes the script's reply: `peek` converts the CGI preamble into the
/// status line and forwarded headers and picks the response framing;
/// `push_content` streams the body with backpressure; `poke` finishes.
fn install_peer_htrd_recbs(htrd: &Rc<Htrd>, weak: Weak<CgiTask>) {
    let w_peek = weak.clone();
    let w_poke = weak.clone();
    let w_push = weak;
    htrd.set_recbs(Recbs {
        peek: Some(Rc::new(move |_htrd, re| {
            let cgi = match w_peek.upgrade() {
                Some(cgi) => cgi,
                None => return Ok(()),
            };
            peer_htrd_peek(&cgi, re)
        })),
        poke: Some(Rc::new(move |_htrd, _re| {
            let cgi = match w_poke.upgrade() {
                Some(cgi) => cgi,
                None => return Ok(()),
            };
            let task: Rc<dyn Task> = cgi.clone();
            let r = cgi.core.endbody();
            mark_over(&task, OVER_READ_FROM_PEER);
            r
        })),
        push_content: Some(Rc::new(move |_htrd, _re, data| {
            let cgi = match w_push.upgrade() {
                Some(cgi) => cgi,
                None => return Ok(()),
            };
            cgi.core.addresbody(data)?;
            if cgi.core.res_pending_writes.get() > PENDING_IO_THRESHOLD {
                cgi.set_peer_read(false)?;
            }
            Ok(())
        })),
    });
}

pub(crate) fn choose_framing(keep_alive: bool, re: &Htre) -> (u16, Option<String>, bool) {
    let (status_code, status_desc) = match re.attr_status() {
        Some(value) => {
            let (code, desc) = parse_status_header_value(value);
            (code, desc.map(|d| d.to_string()))
        }
        None => {
            if re.scode() != 0 {
                (re.scode(), Some(re.smesg().to_string()))
            } else {
                (status::OK, None)
            }
        }
    };
    // Length framing when the peer names one; otherwise chunked under
    // keep-alive, close-delimited as the last resort.
    let chunked = keep_alive && re.flags() & ATTR_LENGTH == 0;
    (status_code, status_desc, chunked)
}

fn peer_htrd_peek(cgi: &Rc<CgiTask>, re: &mut Htre) -> io::Result<()> {
    if cgi.core.cli().is_none() {
        return Ok(());
    }
    let (status_code, status_desc, chunked) = choose_framing(cgi.core.keep_alive.get(), re);
    if !chunked && re.flags() & ATTR_LENGTH == 0 {
        // Close-delimited: the connection cannot be reused.
        cgi.core.keep_alive.set(false);
    }
    cgi.core
        .startreshdr(status_code, status_desc.as_deref(), chunked)?;
    for (key, values) in re.headers().iter() {
        cgi.core.addreshdrs(key, values)?;
    }
    cgi.core.endreshdr()
}

/// Builds the complete CGI/1.1 environment for the child: `PATH` and
/// `LANG` survive from the server's own environment, everything else is
/// synthesized from the request.
fn build_cgi_env(
    htts: &Rc<Htts>,
    cli: &Rc<Cli>,
    req: &Htre,
    docroot: &str,
    script: &str,
    actual_script: &str,
) -> Vec<(OsString, OsString)> {
    let mut envs: Vec<(OsString, OsString)> = Vec::new();

    // The parent environment is discarded except for these two.
    if let Some(path) = std::env::var_os("PATH") {
        envs.push((OsString::from("PATH"), path));
    }
    if let Some(lang) = std::env::var_os("LANG") {
        envs.push((OsString::from("LANG"), lang));
    }

    let mut put = |k: &str, v: &str| envs.push((OsString::from(k), OsString::from(v)));

    put("GATEWAY_INTERFACE", "CGI/1.1");
    put(
        "SERVER_PROTOCOL",
        &format!("HTTP/{}.{}", req.version().major, req.version().minor),
    );
    put("DOCUMENT_ROOT", docroot);
    put("SCRIPT_NAME", script);
    put("SCRIPT_FILENAME", actual_script);
    put("REQUEST_METHOD", req.qmethod_name());
    put("REQUEST_URI", req.qpath());
    if let Some(qparam) = req.qparam() {
        put("QUERY_STRING", qparam);
    }
    match req.req_content_len() {
        Some(n) => put("CONTENT_LENGTH", &n.to_string()),
        // Unknown in advance; nonstandard but better than lying.
        None => put("CONTENT_LENGTH", "-1"),
    }
    put("SERVER_SOFTWARE", &htts.server_name());

    let local = cli.sck().getsockaddr().ok();
    let remote = cli.sck().getpeeraddr().ok();
    if let Some(local) = &local {
        put("SERVER_ADDR", &local.ip_string());
        put("SERVER_PORT", &local.port().to_string());
    }
    put(
        "SERVER_NAME",
        &hostname().unwrap_or_else(|| local.map(|l| l.ip_string()).unwrap_or_default()),
    );
    if let Some(remote) = &remote {
        put("REMOTE_ADDR", &remote.ip_string());
        put("REMOTE_PORT", &remote.port().to_string());
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
        put(&name, &values.join(","));
    }

    envs
}

fn hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    let r = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if r != 0 {
        return None;
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    std::str::from_utf8(&buf[..end]).ok().map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::htre::ReKind;

    #[test]
    fn framing_choice() {
        // A Status pseudo-header and no length: chunked under keep-alive.
        let mut re = Htre::new(ReKind::Response);
        re.attr_status = Some("201 Created".to_string());
        let (code, desc, chunked) = choose_framing(true, &re);
        assert_eq!(code, 201);
        assert_eq!(desc.as_deref(), Some("Created"));
        assert!(chunked);

        // No keep-alive: close-delimited.
        let (_, _, chunked) = choose_framing(false, &re);
        assert!(!chunked);

        // An explicit length wins over chunking.
        re.flags |= ATTR_LENGTH;
        re.attr_content_length = 5;
        let (_, _, chunked) = choose_framing(true, &re);
        assert!(!chunked);

        // Without any status indication the reply is a plain 200.
        let re = Htre::new(ReKind::Response);
        let (code, desc, _) = choose_framing(true, &re);
        assert_eq!(code, status::OK);
        assert!(desc.is_none());
    }
}
