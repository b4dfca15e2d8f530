//! The HTTP server service: listening sockets, per-client state, the idle
//! scanner, and the side-channel handoff of pre-accepted connections.

use std::cell::{Cell, RefCell};
use std::io;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::http::htrd::{Htrd, Recbs, OPT_REQUEST};
use crate::http::htre::Htre;
use crate::http::task::{
    halt_participating_devices, mark_over, unbind_task_from_client, Task, OVER_READ_FROM_CLIENT,
    OVER_READ_FROM_PEER, OVER_WRITE_TO_CLIENT, PENDING_IO_THRESHOLD, SVR_WRCTX,
};
use crate::sck::{
    DevSck, QxMsg, SckBind, SckCbs, SckListen, SckMake, SckType, SideChanHandle, QXMSG_NEWCONN,
    STATE_ACCEPTED, STATE_LENIENT,
};
use crate::skad::SkAd;
use crate::svc::Svc;
use crate::timer::new_tmridx;
use crate::timer::TmrIdx;
use crate::util::Slab;
use crate::Hio;

/// Fixed listen backlog for every HTTP listener.
const LISTENER_BACKLOG: i32 = 4096;
/// Ceiling for the TLS collaborator's accept handshake.
const SSL_ACCEPT_TMOUT: Duration = Duration::from_secs(5);
/// A client with no bound task older than this is evicted.
const MAX_CLIENT_IDLE: Duration = Duration::from_secs(10);

/// Invoked from the parser's peek once request headers are in; inspects
/// the method and path and starts one of the task constructors.
pub type ProcReq = Box<dyn Fn(&Rc<Htts>, &Rc<Cli>, &mut Htre) -> io::Result<()>>;

/// One listening address for [`Htts::start`].
pub struct HttsBind {
    pub addr: SkAd,
    /// TLS material handed to the socket for the TLS collaborator.
    pub ssl_certfile: Option<String>,
    pub ssl_keyfile: Option<String>,
}

impl From<SkAd> for HttsBind {
    fn from(addr: SkAd) -> HttsBind {
        HttsBind {
            addr,
            ssl_certfile: None,
            ssl_keyfile: None,
        }
    }
}

/// The HTTP server service.
pub struct Htts {
    hio: Weak<Hio>,
    proc_req: ProcReq,
    listeners: RefCell<Vec<Option<Rc<DevSck>>>>,
    clis: RefCell<Slab<Rc<Cli>>>,
    tasks: RefCell<Vec<Weak<dyn Task>>>,
    idle_tmridx: TmrIdx,
    server_name: RefCell<String>,
    stopping: Cell<bool>,
    /// Live task count; incremented on task creation, decremented when a
    /// task is freed.
    pub(crate) ntasks: Cell<usize>,
    pub(crate) task_max: Cell<usize>,
    pub(crate) task_cgi_max: Cell<usize>,
    pub(crate) ntask_cgis: Cell<usize>,
    pub(crate) fcgic: RefCell<Option<Rc<crate::http::fcgi::FcgiClient>>>,
}

/// Per-client state: the socket, the request parser, the scratch buffer
/// for response formatting, and the task bound for the request in flight.
pub struct Cli {
    htts: Weak<Htts>,
    id: Cell<usize>,
    sck: Rc<DevSck>,
    addr_str: String,
    htrd: Rc<Htrd>,
    sbuf: RefCell<String>,
    task: RefCell<Option<Rc<dyn Task>>>,
    last_active: Cell<Instant>,
    /// Bytes received beyond the request in flight, replayed when the
    /// task unbinds.
    pending: RefCell<Vec<u8>>,
    pub(crate) eof: Cell<bool>,
}

impl Cli {
    pub fn sck(&self) -> &Rc<DevSck> {
        &self.sck
    }

    /// The peer address in `ip:port` form (or the path / `qx` marker).
    pub fn addr_str(&self) -> &str {
        &self.addr_str
    }

    pub fn htrd(&self) -> &Rc<Htrd> {
        &self.htrd
    }

    pub fn task(&self) -> Option<Rc<dyn Task>> {
        self.task.borrow().clone()
    }

    /// Binds a task for the request in flight. At most one may be bound.
    pub fn set_task(&self, task: Rc<dyn Task>) -> io::Result<()> {
        let mut slot = self.task.borrow_mut();
        if slot.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "duplicate task request prohibited",
            ));
        }
        *slot = Some(task);
        Ok(())
    }

    pub(crate) fn clear_task(&self) {
        self.task.borrow_mut().take();
    }

    pub(crate) fn touch(&self) {
        self.last_active.set(Instant::now());
    }

    pub(crate) fn sbuf_mut(&self) -> std::cell::RefMut<'_, String> {
        self.sbuf.borrow_mut()
    }

    /// Buffers bytes past a completed request for later replay.
    pub(crate) fn push_pending(&self, data: &[u8]) {
        self.pending.borrow_mut().extend_from_slice(data);
    }

    /// Replays buffered bytes into the parser after a task unbind. May
    /// bind the next task.
    pub(crate) fn replay_pending(self: &Rc<Self>) {
        let data = std::mem::take(&mut *self.pending.borrow_mut());
        if !data.is_empty() {
            debug!("replaying {} buffered bytes on client {}", data.len(), self.addr_str);
            feed_client(self, &data);
        }
    }
}

/// Runs client bytes through the parser, buffering any tail that belongs
/// to a later request. Halts the participants on a parse failure.
fn feed_client(cli: &Rc<Cli>, mut data: &[u8]) {
    loop {
        match cli.htrd.feed(data) {
            Err(e) => {
                debug!("parse failure from client {}: {}", cli.addr_str, e);
                match cli.task() {
                    Some(task) => halt_participating_devices(&task),
                    None => cli.sck.halt(),
                }
                return;
            }
            Ok(n) => {
                if n == data.len() {
                    return;
                }
                data = &data[n..];
                if cli.task().is_some() {
                    // A task owns the connection now; keep the tail for
                    // replay once it unbinds.
                    cli.push_pending(data);
                    return;
                }
                // No task in action (the request completed without one);
                // feed the next message directly.
            }
        }
    }
}

impl Htts {
    /// Starts the service with one listener per bind. Individual binds
    /// may fail as long as at least one listener comes up.
    pub fn start(hio: &Rc<Hio>, binds: Vec<HttsBind>, proc_req: ProcReq) -> io::Result<Rc<Htts>> {
        if binds.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "no binds"));
        }

        let htts = Rc::new(Htts {
            hio: Rc::downgrade(hio),
            proc_req,
            listeners: RefCell::new(Vec::new()),
            clis: RefCell::new(Slab::new()),
            tasks: RefCell::new(Vec::new()),
            idle_tmridx: new_tmridx(),
            server_name: RefCell::new(format!("hio-{}", env!("CARGO_PKG_VERSION"))),
            stopping: Cell::new(false),
            ntasks: Cell::new(0),
            task_max: Cell::new(usize::MAX),
            task_cgi_max: Cell::new(usize::MAX),
            ntask_cgis: Cell::new(0),
            fcgic: RefCell::new(None),
        });

        let mut noks = 0usize;
        for (idx, bind) in binds.iter().enumerate() {
            htts.listeners.borrow_mut().push(None);
            let typ = match SckType::from_skad(&bind.addr) {
                Some(typ) => typ,
                None => {
                    debug!("unsupported bind address family at {}", idx);
                    continue;
                }
            };
            let sck = match DevSck::make(
                hio,
                SckMake {
                    typ,
                    options: STATE_LENIENT,
                    cbs: listener_cbs(Rc::downgrade(&htts), idx),
                },
            ) {
                Ok(sck) => sck,
                Err(e) => {
                    debug!("unable to create listener {}: {}", idx, e);
                    continue;
                }
            };

            if typ != SckType::Qx {
                let bi = SckBind {
                    addr: Some(bind.addr),
                    reuseaddr: true,
                    reuseport: true,
                    ssl_certfile: bind.ssl_certfile.clone(),
                    ssl_keyfile: bind.ssl_keyfile.clone(),
                    ..Default::default()
                };
                if let Err(e) = sck.bind(&bi) {
                    debug!("unable to bind listener {} to {}: {}", idx, bind.addr, e);
                    sck.kill();
                    continue;
                }
                if let Err(e) = sck.listen(&SckListen {
                    backlogs: LISTENER_BACKLOG,
                    accept_tmout: Some(SSL_ACCEPT_TMOUT),
                }) {
                    debug!("unable to listen on {}: {}", bind.addr, e);
                    sck.kill();
                    continue;
                }
            } else {
                let _ = sck.listen(&SckListen {
                    backlogs: 0,
                    accept_tmout: None,
                });
            }

            debug!("listening on {}", bind.addr);
            htts.listeners.borrow_mut()[idx] = Some(sck);
            noks += 1;
        }

        if noks == 0 {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "no listener could be started",
            ));
        }

        hio.register_svc(htts.clone());
        sched_idle_scan(&htts);
        Ok(htts)
    }

    pub fn hio(&self) -> Option<Rc<Hio>> {
        self.hio.upgrade()
    }

    pub fn server_name(&self) -> String {
        self.server_name.borrow().clone()
    }

    pub fn set_server_name(&self, name: &str) {
        *self.server_name.borrow_mut() = name.to_string();
    }

    /// Ceiling on concurrently running tasks of any kind.
    pub fn set_task_max(&self, max: usize) {
        self.task_max.set(max);
    }

    /// Ceiling on concurrently running CGI tasks.
    pub fn set_task_cgi_max(&self, max: usize) {
        self.task_cgi_max.set(max);
    }

    /// Number of tasks currently in flight.
    pub fn ntasks(&self) -> usize {
        self.ntasks.get()
    }

    pub fn nlisteners(&self) -> usize {
        self.listeners.borrow().len()
    }

    /// The local address of the listener at `idx`.
    pub fn getsockaddr(&self, idx: usize) -> io::Result<SkAd> {
        match self.listeners.borrow().get(idx).and_then(|l| l.clone()) {
            Some(sck) => sck.getsockaddr(),
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no listener at the given index",
            )),
        }
    }

    /// Cross-thread handle to the side channel of the listener at `idx`.
    pub fn side_chan_handle(&self, idx: usize) -> Option<SideChanHandle> {
        self.listeners
            .borrow()
            .get(idx)
            .and_then(|l| l.clone())
            .and_then(|sck| sck.side_chan_handle())
    }

    /// Writes a message to the side channel of the listener at `idx`; a
    /// `QxMsg` makes the owning loop adopt a pre-accepted connection.
    pub fn writetosidechan(&self, idx: usize, data: &[u8]) -> io::Result<usize> {
        match self.listeners.borrow().get(idx).and_then(|l| l.clone()) {
            Some(sck) => sck.writetosidechan(data),
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no listener at the given index",
            )),
        }
    }

    pub(crate) fn add_task(&self, task: &Rc<dyn Task>) {
        let mut tasks = self.tasks.borrow_mut();
        tasks.retain(|w| w.upgrade().is_some());
        tasks.push(Rc::downgrade(task));
    }

    pub(crate) fn remove_cli(&self, cli: &Cli) {
        self.clis.borrow_mut().remove(cli.id.get());
    }

    /// Stops the service: every listener, client and task goes down.
    pub fn stop(self: &Rc<Self>) {
        if self.stopping.replace(true) {
            return;
        }
        debug!(
            "stopping http service with {} clients attached",
            self.clis.borrow().len()
        );

        if let Some(fcgic) = self.fcgic.borrow_mut().take() {
            fcgic.stop();
        }

        let listeners: Vec<_> = self
            .listeners
            .borrow_mut()
            .iter_mut()
            .filter_map(|l| l.take())
            .collect();
        for sck in listeners {
            sck.halt();
        }

        let clis: Vec<_> = self.clis.borrow().iter().map(|(_, c)| c.clone()).collect();
        for cli in clis {
            cli.sck.halt();
        }

        let tasks: Vec<_> = self
            .tasks
            .borrow_mut()
            .drain(..)
            .filter_map(|w| w.upgrade())
            .collect();
        for task in tasks {
            halt_participating_devices(&task);
            unbind_task_from_client(&task, true);
        }

        if let Some(hio) = self.hio() {
            hio.del_tmrjob(&self.idle_tmridx);
        }
    }
}

impl Svc for Htts {
    fn svc_stop(self: Rc<Self>) {
        self.stop();
    }
}

fn sched_idle_scan(htts: &Rc<Htts>) {
    let hio = match htts.hio() {
        Some(hio) => hio,
        None => return,
    };
    let weak = Rc::downgrade(htts);
    let r = hio.sched_tmrjob_after(
        MAX_CLIENT_IDLE,
        &htts.idle_tmridx,
        Box::new(move |_hio, now| {
            let htts = match weak.upgrade() {
                Some(htts) => htts,
                None => return,
            };
            let idle: Vec<_> = htts
                .clis
                .borrow()
                .iter()
                .filter(|(_, cli)| {
                    cli.task.borrow().is_none()
                        && now.duration_since(cli.last_active.get()) >= MAX_CLIENT_IDLE
                })
                .map(|(_, cli)| cli.clone())
                .collect();
            for cli in idle {
                debug!("halting idle client {}", cli.addr_str);
                cli.sck.halt();
            }
            sched_idle_scan(&htts);
        }),
    );
    if r.is_err() {
        warn!("unable to schedule the idle client scan");
    }
}

/// The callback set installed on every listener. The accepted client
/// sockets inherit it until `init_client` swaps in the client set, so the
/// only interesting entry points are `on_connect` (accept) and, for `Qx`
/// listeners, `on_read` (side-channel messages).
fn listener_cbs(htts: Weak<Htts>, idx: usize) -> SckCbs {
    let qxbuf: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));

    let h_conn = htts.clone();
    let h_read = htts.clone();
    let h_disc = htts;

    SckCbs {
        on_connect: Rc::new(move |sck| {
            if sck.state() & STATE_ACCEPTED != 0 {
                if let Some(htts) = h_conn.upgrade() {
                    if let Err(e) = init_client(&htts, sck) {
                        debug!("halting client: initialization failed: {}", e);
                        sck.halt();
                    }
                }
            }
        }),
        on_read: Rc::new(move |sck, res, _src| {
            // Only a Qx listener reads here: fixed-layout side-channel
            // messages, possibly split or batched by the pipe.
            let data = res?;
            if sck.typ() != SckType::Qx {
                return Ok(());
            }
            let htts = match h_read.upgrade() {
                Some(htts) => htts,
                None => return Ok(()),
            };
            let mut buf = qxbuf.borrow_mut();
            buf.extend_from_slice(data);
            while buf.len() >= std::mem::size_of::<QxMsg>() {
                let msg = QxMsg::from_bytes(&buf).unwrap();
                buf.drain(..std::mem::size_of::<QxMsg>());
                if msg.cmd != QXMSG_NEWCONN {
                    continue;
                }
                let typ = msg.scktype().unwrap_or(SckType::Tcp4);
                let hio = match htts.hio() {
                    Some(hio) => hio,
                    None => break,
                };
                let cbs = listener_cbs(Rc::downgrade(&htts), idx);
                if let Err(e) =
                    DevSck::adopt(&hio, msg.syshnd, typ, msg.remoteaddr, cbs, true)
                {
                    warn!("unable to adopt side-channel connection: {}", e);
                }
            }
            Ok(())
        }),
        on_write: Rc::new(|_, _, _| Ok(())),
        on_disconnect: Rc::new(move |sck| {
            if let Some(htts) = h_disc.upgrade() {
                let mut listeners = htts.listeners.borrow_mut();
                if let Some(slot) = listeners.get_mut(idx) {
                    if let Some(l) = slot {
                        if Rc::ptr_eq(l, sck) {
                            *slot = None;
                        }
                    }
                }
            }
        }),
        on_raw_accept: None,
    }
}

/// Sets a freshly accepted socket up as a client: allocates the request
/// parser and scratch, links the record into the service, and installs the
/// client-side callbacks.
fn init_client(htts: &Rc<Htts>, sck: &Rc<DevSck>) -> io::Result<()> {
    let addr_str = sck
        .getpeeraddr()
        .map(|ad| ad.to_string())
        .unwrap_or_default();

    let htrd = Rc::new(Htrd::new(OPT_REQUEST));
    let cli = Rc::new(Cli {
        htts: Rc::downgrade(htts),
        id: Cell::new(usize::MAX),
        sck: sck.clone(),
        addr_str,
        htrd,
        sbuf: RefCell::new(String::with_capacity(2048)),
        task: RefCell::new(None),
        last_active: Cell::new(Instant::now()),
        pending: RefCell::new(Vec::new()),
        eof: Cell::new(false),
    });
    cli.id.set(htts.clis.borrow_mut().insert(cli.clone()));

    // Route completed request headers into the caller's dispatcher.
    let peek_htts = Rc::downgrade(htts);
    let peek_cli = Rc::downgrade(&cli);
    cli.htrd.set_recbs(Recbs {
        peek: Some(Rc::new(move |_htrd, re| {
            let htts = peek_htts
                .upgrade()
                .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "service gone"))?;
            let cli = peek_cli
                .upgrade()
                .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "client gone"))?;
            (htts.proc_req)(&htts, &cli, re)
        })),
        poke: None,
        push_content: None,
    });

    install_client_handlers(&cli);
    debug!("initialized client {}", cli.addr_str);
    Ok(())
}

fn install_client_handlers(cli: &Rc<Cli>) {
    let sck = cli.sck.clone();

    let w_read = Rc::downgrade(cli);
    sck.set_on_read(Rc::new(move |sck, res, _src| {
        let cli = match w_read.upgrade() {
            Some(cli) => cli,
            None => return Ok(()),
        };
        match res {
            Err(e) => {
                debug!("read failure on client {}: {}", cli.addr_str, e);
                if let Some(task) = cli.task() {
                    task.core().keep_alive.set(false);
                    halt_participating_devices(&task);
                }
                // The device halts itself on a fatal read.
            }
            Ok(data) if data.is_empty() => {
                debug!("eof from client {}", cli.addr_str);
                cli.eof.set(true);
                match cli.task() {
                    Some(task) => {
                        let core = task.core();
                        core.client_eof.set(true);
                        core.keep_alive.set(false);
                        if !core.is_over(OVER_READ_FROM_CLIENT) {
                            let r = task.clone().on_client_req_end(true);
                            mark_over(&task, OVER_READ_FROM_CLIENT);
                            if r.is_err() {
                                halt_participating_devices(&task);
                            }
                        }
                    }
                    None => sck.halt(),
                }
            }
            Ok(data) => {
                if cli.eof.get() {
                    return Ok(());
                }
                cli.touch();
                if let Some(task) = cli.task() {
                    if task.core().is_over(OVER_READ_FROM_CLIENT) {
                        // Reads are disabled past this point; drop a stray
                        // burst instead of corrupting the parser.
                        return Ok(());
                    }
                }
                feed_client(&cli, data);
            }
        }
        Ok(())
    }));

    let w_write = Rc::downgrade(cli);
    sck.set_on_write(Rc::new(move |_sck, res, wrctx| {
        let cli = match w_write.upgrade() {
            Some(cli) => cli,
            None => return Ok(()),
        };
        let task = match cli.task() {
            Some(task) => task,
            None => return Ok(()),
        };
        match res {
            Err(e) => {
                debug!("write failure on client {}: {}", cli.addr_str, e);
                halt_participating_devices(&task);
            }
            Ok(0) => {
                if wrctx == SVR_WRCTX {
                    let core = task.core();
                    core.res_pending_writes
                        .set(core.res_pending_writes.get().saturating_sub(1));
                }
                // EOF has been indicated; nothing further goes out.
                mark_over(&task, OVER_WRITE_TO_CLIENT);
            }
            Ok(_n) => {
                if wrctx == SVR_WRCTX {
                    let core = task.core();
                    core.res_pending_writes
                        .set(core.res_pending_writes.get().saturating_sub(1));
                }
                if task.clone().on_client_write_ack().is_err() {
                    halt_participating_devices(&task);
                    return Ok(());
                }
                let core = task.core();
                if core.res_pending_writes.get() == PENDING_IO_THRESHOLD
                    && !core.is_over(OVER_READ_FROM_PEER)
                {
                    // Backpressure released; resume the peer.
                    if task.set_peer_read(true).is_err() {
                        halt_participating_devices(&task);
                        return Ok(());
                    }
                }
                if core.is_over(OVER_READ_FROM_PEER) && core.res_pending_writes.get() == 0 {
                    mark_over(&task, OVER_WRITE_TO_CLIENT);
                }
            }
        }
        Ok(())
    }));

    let w_disc = Rc::downgrade(cli);
    sck.set_on_disconnect(Rc::new(move |_sck| {
        let cli = match w_disc.upgrade() {
            Some(cli) => cli,
            None => return,
        };
        debug!("client {} disconnected", cli.addr_str);
        if let Some(task) = cli.task() {
            let core = task.core();
            core.client_disconnected.set(true);
            core.keep_alive.set(false);
            task.on_client_gone();
            unbind_task_from_client(&task, true);
        }
        if let Some(htts) = cli.htts.upgrade() {
            htts.remove_cli(&cli);
        }
    }));
}
