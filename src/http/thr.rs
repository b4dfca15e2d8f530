//! The thread task: delegates a request to a worker thread through a pipe
//! pair. The worker writes a CGI-style reply preamble followed by the
//! body; the loop side parses it with the same framing selection CGI
//! uses.

use std::cell::{Cell, RefCell};
use std::io;
use std::rc::{Rc, Weak};

use log::debug;

use crate::http::cgi::choose_framing;
use crate::http::htrd::{Htrd, Recbs, OPT_RESPONSE, OPT_SKIP_INITIAL_LINE};
use crate::http::htre::{Htre, ATTR_LENGTH};
use crate::http::svr::{Cli, Htts};
use crate::http::task::{
    bind_task, halt_participating_devices, mark_over, unbind_task_from_client, Task, TaskCore,
    OVER_READ_FROM_CLIENT, OVER_READ_FROM_PEER, OVER_WRITE_TO_PEER, PENDING_IO_THRESHOLD,
};
use crate::http::{status, Method, Version};
use crate::skad::SkAd;
use crate::thr::{DevThr, ThrIoPair, ThrMake};

/// Never answer `Expect: 100-continue` with an interim response.
pub const THR_NO_100_CONTINUE: u32 = 1 << 0;

/// The request snapshot handed to the worker thread. Owned by the thread
/// for its whole lifetime, independent of the service that spawned it.
pub struct ThrFuncInfo {
    pub method: Method,
    pub method_name: String,
    pub version: Version,
    pub path: String,
    pub param: Option<String>,
    pub client_addr: Option<SkAd>,
    pub server_addr: Option<SkAd>,
    /// Method named by an `X-HTTP-Method-Override` header, if any.
    pub method_override: Option<Method>,
}

/// The worker body: consume the request from the pair, write a CGI-style
/// reply into it.
pub type ThrFunc = Box<dyn FnOnce(&ThrFuncInfo, ThrIoPair) + Send>;

struct ThrTask {
    core: TaskCore,
    peer: RefCell<Option<Rc<DevThr>>>,
    peer_htrd: RefCell<Option<Rc<Htrd>>>,
    peer_pending_writes: Cell<usize>,
}

impl ThrTask {
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
            if let Some(csck) = self.core.csck() {
                csck.read(false)?;
            }
        }
        Ok(())
    }
}

impl Task for ThrTask {
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
            Some(peer) => peer.read(enabled),
            None => Ok(()),
        }
    }

    fn on_client_body(&self, data: &[u8]) -> io::Result<()> {
        self.write_to_peer(data)
    }

    fn on_client_req_end(self: Rc<Self>, _eof: bool) -> io::Result<()> {
        self.write_to_peer(&[])
    }
}

impl Drop for ThrTask {
    fn drop(&mut self) {
        if let Some(peer) = self.peer.borrow().clone() {
            peer.halt();
        }
    }
}

impl Htts {
    /// Hands the request to `func` on a dedicated worker thread.
    pub fn dothr(
        self: &Rc<Self>,
        cli: &Rc<Cli>,
        req: &Htre,
        func: ThrFunc,
        options: u32,
    ) -> io::Result<()> {
        let hio = self
            .hio()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "loop gone"))?;
        debug!(
            "thread task for client {}: [{}] {}",
            cli.addr_str(),
            req.qmethod_name(),
            req.qpath()
        );

        let tfi = ThrFuncInfo {
            method: req.method(),
            method_name: req.qmethod_name().to_string(),
            version: req.version(),
            path: req.qpath().to_string(),
            param: req.qparam().map(|s| s.to_string()),
            client_addr: cli.sck().getpeeraddr().ok(),
            server_addr: cli.sck().getsockaddr().ok(),
            method_override: req
                .header("X-HTTP-Method-Override")
                .map(Method::from_name),
        };

        if cli.task().is_some() {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "duplicate task request prohibited",
            ));
        }
        let thr = Rc::new(ThrTask {
            core: TaskCore::new(self, cli, req),
            peer: RefCell::new(None),
            peer_htrd: RefCell::new(None),
            peer_pending_writes: Cell::new(0),
        });
        let task: Rc<dyn Task> = thr.clone();

        let r = (|| -> io::Result<()> {
            let peer_htrd = Rc::new(Htrd::new(OPT_RESPONSE | OPT_SKIP_INITIAL_LINE));
            install_peer_htrd_recbs(&peer_htrd, Rc::downgrade(&thr));

            let w_read = Rc::downgrade(&thr);
            let w_write = Rc::downgrade(&thr);
            let w_close = Rc::downgrade(&thr);
            let peer = DevThr::make(
                &hio,
                ThrMake {
                    func: Box::new(move |iop: ThrIoPair| {
                        // The start info lives and dies with the body.
                        func(&tfi, iop);
                    }),
                    on_read: Rc::new(move |_dev, res| {
                        let thr = match w_read.upgrade() {
                            Some(thr) => thr,
                            None => return Ok(()),
                        };
                        thr_peer_on_read(&thr, res);
                        Ok(())
                    }),
                    on_write: Rc::new(move |_dev, res, _wrctx| {
                        let thr = match w_write.upgrade() {
                            Some(thr) => thr,
                            None => return Ok(()),
                        };
                        thr_peer_on_write(&thr, res);
                        Ok(())
                    }),
                    on_close: Rc::new(move |_dev| {
                        if let Some(thr) = w_close.upgrade() {
                            let task: Rc<dyn Task> = thr.clone();
                            if !thr.core.is_over(OVER_READ_FROM_PEER) {
                                let r = thr.core.endbody();
                                mark_over(&task, OVER_READ_FROM_PEER);
                                if r.is_err() {
                                    halt_participating_devices(&task);
                                }
                            }
                            thr.peer.borrow_mut().take();
                            thr.peer_htrd.borrow_mut().take();
                        }
                    }),
                },
            )?;
            *thr.peer.borrow_mut() = Some(peer);
            *thr.peer_htrd.borrow_mut() = Some(peer_htrd);

            bind_task(self, cli, &task)?;
            thr.core
                .handle_expect100(options & THR_NO_100_CONTINUE != 0)?;
            Ok(())
        })();

        if let Err(e) = r {
            debug!("thread task setup failed: {}", e);
            let _ = thr
                .core
                .sendfinalres(status::INTERNAL_SERVER_ERROR, None, None, true);
            halt_participating_devices(&task);
            unbind_task_from_client(&task, false);
            return Err(e);
        }
        Ok(())
    }
}

fn thr_peer_on_read(thr: &Rc<ThrTask>, res: io::Result<&[u8]>) {
    let task: Rc<dyn Task> = thr.clone();
    match res {
        Err(e) => {
            debug!("read failure from worker thread: {}", e);
            halt_participating_devices(&task);
        }
        Ok(data) if data.is_empty() => {
            if !thr.core.is_over(OVER_READ_FROM_PEER) {
                let r = thr.core.endbody();
                mark_over(&task, OVER_READ_FROM_PEER);
                if r.is_err() {
                    halt_participating_devices(&task);
                }
            }
        }
        Ok(data) => {
            let htrd = thr.peer_htrd.borrow().clone();
            let htrd = match htrd {
                Some(htrd) => htrd,
                None => return,
            };
            if let Err(e) = htrd.feed(data) {
                debug!("unable to parse worker thread output: {}", e);
                if !thr.core.res_started.get() {
                    let _ = thr
                        .core
                        .sendfinalres(status::BAD_GATEWAY, None, None, true);
                }
                halt_participating_devices(&task);
            }
        }
    }
}

fn thr_peer_on_write(thr: &Rc<ThrTask>, res: io::Result<usize>) {
    let task: Rc<dyn Task> = thr.clone();
    match res {
        Err(e) => {
            debug!("write failure to worker thread: {}", e);
            halt_participating_devices(&task);
        }
        Ok(0) => {
            thr.peer_pending_writes
                .set(thr.peer_pending_writes.get().saturating_sub(1));
            mark_over(&task, OVER_WRITE_TO_PEER);
        }
        Ok(_n) => {
            thr.peer_pending_writes
                .set(thr.peer_pending_writes.get().saturating_sub(1));
            if thr.peer_pending_writes.get() == PENDING_IO_THRESHOLD
                && !thr.core.is_over(OVER_READ_FROM_CLIENT)
            {
                if let Some(csck) = thr.core.csck() {
                    if csck.read(true).is_err() {
                        halt_participating_devices(&task);
                        return;
                    }
                }
            }
            if thr.core.is_over(OVER_READ_FROM_CLIENT) && thr.peer_pending_writes.get() == 0 {
                mark_over(&task, OVER_WRITE_TO_PEER);
            }
        }
    }
}

fn install_peer_htrd_recbs(htrd: &Rc<Htrd>, weak: Weak<ThrTask>) {
    let w_peek = weak.clone();
    let w_poke = weak.clone();
    let w_push = weak;
    htrd.set_recbs(Recbs {
        peek: Some(Rc::new(move |_htrd, re| {
            let thr = match w_peek.upgrade() {
                Some(thr) => thr,
                None => return Ok(()),
            };
            if thr.core.cli().is_none() {
                return Ok(());
            }
            let (status_code, status_desc, chunked) =
                choose_framing(thr.core.keep_alive.get(), re);
            if !chunked && re.flags() & ATTR_LENGTH == 0 {
                thr.core.keep_alive.set(false);
            }
            thr.core
                .startreshdr(status_code, status_desc.as_deref(), chunked)?;
            for (key, values) in re.headers().iter() {
                thr.core.addreshdrs(key, values)?;
            }
            thr.core.endreshdr()
        })),
        poke: Some(Rc::new(move |_htrd, _re| {
            let thr = match w_poke.upgrade() {
                Some(thr) => thr,
                None => return Ok(()),
            };
            let task: Rc<dyn Task> = thr.clone();
            let r = thr.core.endbody();
            mark_over(&task, OVER_READ_FROM_PEER);
            r
        })),
        push_content: Some(Rc::new(move |_htrd, _re, data| {
            let thr = match w_push.upgrade() {
                Some(thr) => thr,
                None => return Ok(()),
            };
            thr.core.addresbody(data)?;
            if thr.core.res_pending_writes.get() > PENDING_IO_THRESHOLD {
                thr.set_peer_read(false)?;
            }
            Ok(())
        })),
    });
}
