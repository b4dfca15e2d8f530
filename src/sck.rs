use std::cell::{Cell, RefCell};
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

use log::{debug, warn};

use crate::dev::{would_block, Dev, DevCore, EofMode, Payload, WriteDone, WriteJob};
use crate::skad::SkAd;
use crate::sys;
use crate::timer::{new_tmridx, TmrIdx, TMRIDX_INVALID};
use crate::Hio;

/// Progress/state bits of a socket device.
pub const STATE_CONNECTING: u32 = 1 << 0;
pub const STATE_CONNECTING_SSL: u32 = 1 << 1;
pub const STATE_CONNECTED: u32 = 1 << 2;
pub const STATE_LISTENING: u32 = 1 << 3;
pub const STATE_ACCEPTING_SSL: u32 = 1 << 4;
pub const STATE_ACCEPTED: u32 = 1 << 5;
/// Accept failures do not take the listener down.
pub const STATE_LENIENT: u32 = 1 << 6;
/// The handle was handed over from elsewhere (side channel adoption).
pub const STATE_INTERCEPTED: u32 = 1 << 7;

const PROGRESS_MASK: u32 = STATE_CONNECTING
    | STATE_CONNECTING_SSL
    | STATE_CONNECTED
    | STATE_LISTENING
    | STATE_ACCEPTING_SSL
    | STATE_ACCEPTED;

/// Socket kind. Determines the `(domain, type, protocol)` triple and the
/// read/write syscall family used by the device.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SckType {
    /// In-process pipe-backed transport with a side channel.
    Qx,
    Unix,
    Tcp4,
    Tcp6,
    Udp4,
    Udp6,
    Sctp4,
    Sctp6,
    Icmp4,
    Icmp6,
    Arp,
    Packet,
}

impl SckType {
    fn sockinfo(self) -> io::Result<(libc::c_int, libc::c_int, libc::c_int)> {
        use SckType::*;
        Ok(match self {
            Tcp4 => (libc::AF_INET, libc::SOCK_STREAM, 0),
            Tcp6 => (libc::AF_INET6, libc::SOCK_STREAM, 0),
            Udp4 => (libc::AF_INET, libc::SOCK_DGRAM, 0),
            Udp6 => (libc::AF_INET6, libc::SOCK_DGRAM, 0),
            Sctp4 => (libc::AF_INET, libc::SOCK_STREAM, libc::IPPROTO_SCTP),
            Sctp6 => (libc::AF_INET6, libc::SOCK_STREAM, libc::IPPROTO_SCTP),
            Icmp4 => (libc::AF_INET, libc::SOCK_RAW, libc::IPPROTO_ICMP),
            Icmp6 => (libc::AF_INET6, libc::SOCK_RAW, libc::IPPROTO_ICMPV6),
            Unix => (libc::AF_UNIX, libc::SOCK_STREAM, 0),
            Arp => (libc::AF_PACKET, libc::SOCK_RAW, (libc::ETH_P_ARP as u16).to_be() as libc::c_int),
            Packet => (libc::AF_PACKET, libc::SOCK_RAW, (libc::ETH_P_ALL as u16).to_be() as libc::c_int),
            Qx => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "qx sockets are pipe-backed",
                ))
            }
        })
    }

    /// Connection-oriented byte stream, as opposed to a datagram or raw
    /// packet socket.
    pub fn is_stream(self) -> bool {
        matches!(
            self,
            SckType::Tcp4 | SckType::Tcp6 | SckType::Sctp4 | SckType::Sctp6 | SckType::Unix
        )
    }

    /// The socket kind matching an address family for a server bind.
    pub fn from_skad(addr: &SkAd) -> Option<SckType> {
        if addr.is_qx() {
            return Some(SckType::Qx);
        }
        match addr.family() as libc::c_int {
            libc::AF_INET => Some(SckType::Tcp4),
            libc::AF_INET6 => Some(SckType::Tcp6),
            libc::AF_UNIX => Some(SckType::Unix),
            _ => None,
        }
    }
}

pub type SckOnRead = Rc<dyn Fn(&Rc<DevSck>, io::Result<&[u8]>, Option<&SkAd>) -> io::Result<()>>;
pub type SckOnWrite = Rc<dyn Fn(&Rc<DevSck>, io::Result<usize>, usize) -> io::Result<()>>;
pub type SckOnConnect = Rc<dyn Fn(&Rc<DevSck>)>;
pub type SckOnDisconnect = Rc<dyn Fn(&Rc<DevSck>)>;
pub type SckOnRawAccept = Rc<dyn Fn(&Rc<DevSck>, RawFd, &SkAd)>;

/// User-facing callback set of a socket device.
///
/// `on_read` receives `Ok(&[])` on EOF and `Err` on failure or timeout;
/// `on_write` acknowledges exactly one write request per call, with `Ok(0)`
/// for a drained EOF marker. A callback returning an error halts the
/// device.
#[derive(Clone)]
pub struct SckCbs {
    pub on_read: SckOnRead,
    pub on_write: SckOnWrite,
    pub on_connect: SckOnConnect,
    pub on_disconnect: SckOnDisconnect,
    pub on_raw_accept: Option<SckOnRawAccept>,
}

impl Default for SckCbs {
    fn default() -> SckCbs {
        SckCbs {
            on_read: Rc::new(|_, _, _| Ok(())),
            on_write: Rc::new(|_, _, _| Ok(())),
            on_connect: Rc::new(|_| {}),
            on_disconnect: Rc::new(|_| {}),
            on_raw_accept: None,
        }
    }
}

/// Parameters for [`DevSck::make`].
pub struct SckMake {
    pub typ: SckType,
    /// `STATE_LENIENT` is the only bit honored here.
    pub options: u32,
    pub cbs: SckCbs,
}

/// Parameters for [`DevSck::bind`].
#[derive(Default)]
pub struct SckBind {
    pub addr: Option<SkAd>,
    pub reuseaddr: bool,
    pub reuseport: bool,
    pub transparent: bool,
    /// Ignore soft option failures (transparent, broadcast).
    pub ignerr: bool,
    pub broadcast: bool,
    /// TLS material for a subsequent listen; stored for the TLS
    /// collaborator, unused by the core.
    pub ssl_certfile: Option<String>,
    pub ssl_keyfile: Option<String>,
}

/// Parameters for [`DevSck::listen`].
pub struct SckListen {
    pub backlogs: i32,
    /// Ceiling for the TLS collaborator's accept handshake.
    pub accept_tmout: Option<Duration>,
}

/// Parameters for [`DevSck::connect`].
pub struct SckConnect {
    pub addr: SkAd,
    pub connect_tmout: Option<Duration>,
}

/// Shutdown direction bits.
pub const SHUTDOWN_READ: u32 = 1 << 0;
pub const SHUTDOWN_WRITE: u32 = 1 << 1;

/// Command code of a side-channel message.
pub const QXMSG_NEWCONN: u32 = 0;

/// Fixed-layout message understood by `Qx` listeners: instructs the
/// receiving loop to adopt `syshnd` as an already-accepted client socket.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct QxMsg {
    pub cmd: u32,
    pub scktype: u32,
    pub syshnd: RawFd,
    pub remoteaddr: SkAd,
}

impl QxMsg {
    pub fn newconn(typ: SckType, syshnd: RawFd, remoteaddr: SkAd) -> QxMsg {
        QxMsg {
            cmd: QXMSG_NEWCONN,
            scktype: typ as u32,
            syshnd,
            remoteaddr,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(self as *const QxMsg as *const u8, mem::size_of::<QxMsg>())
        }
    }

    pub fn from_bytes(data: &[u8]) -> Option<QxMsg> {
        if data.len() < mem::size_of::<QxMsg>() {
            return None;
        }
        let mut msg = mem::MaybeUninit::<QxMsg>::uninit();
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                msg.as_mut_ptr() as *mut u8,
                mem::size_of::<QxMsg>(),
            );
            Some(msg.assume_init())
        }
    }

    pub fn scktype(&self) -> Option<SckType> {
        use SckType::*;
        [Qx, Unix, Tcp4, Tcp6, Udp4, Udp6, Sctp4, Sctp6, Icmp4, Icmp6, Arp, Packet]
            .into_iter()
            .find(|t| *t as u32 == self.scktype)
    }
}

/// Cross-thread handle to a `Qx` socket's side channel. Writing enqueues
/// bytes that the owning loop reads back through the device's `on_read`.
#[derive(Clone, Copy, Debug)]
pub struct SideChanHandle {
    fd: RawFd,
}

// The handle is only a pipe write end; writes of one QxMsg are atomic.
unsafe impl Send for SideChanHandle {}

impl SideChanHandle {
    pub fn write(&self, data: &[u8]) -> io::Result<usize> {
        sys::cvt(unsafe {
            libc::write(self.fd, data.as_ptr() as *const libc::c_void, data.len())
        })
        .map(|n| n as usize)
    }
}

/// A socket device.
pub struct DevSck {
    core: DevCore,
    typ: SckType,
    state: Cell<u32>,
    cbs: RefCell<SckCbs>,
    localaddr: RefCell<Option<SkAd>>,
    remoteaddr: RefCell<Option<SkAd>>,
    /// Write end of the internal pipe (`Qx` only).
    side_chan: Cell<RawFd>,
    /// Timer slot for connect/ssl-accept deadlines.
    ctmridx: TmrIdx,
    accept_tmout: Cell<Option<Duration>>,
    ssl_certfile: RefCell<Option<String>>,
    ssl_keyfile: RefCell<Option<String>>,
}

impl DevSck {
    /// Creates a socket device and makes it visible to the loop with
    /// initial read interest.
    pub fn make(hio: &Rc<Hio>, mk: SckMake) -> io::Result<Rc<DevSck>> {
        let (fd, side_chan) = if mk.typ == SckType::Qx {
            let (r, w) = sys::pipe_pair()?;
            (r, w)
        } else {
            let (domain, ty, proto) = mk.typ.sockinfo()?;
            let fd = sys::cvt(unsafe {
                libc::socket(domain, ty | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, proto)
            })?;
            (fd, -1)
        };

        let dev = Rc::new(DevSck {
            core: DevCore::new(hio, fd, EofMode::ShutdownWrite),
            typ: mk.typ,
            state: Cell::new(mk.options & STATE_LENIENT),
            cbs: RefCell::new(mk.cbs),
            localaddr: RefCell::new(None),
            remoteaddr: RefCell::new(None),
            side_chan: Cell::new(side_chan),
            ctmridx: new_tmridx(),
            accept_tmout: Cell::new(None),
            ssl_certfile: RefCell::new(None),
            ssl_keyfile: RefCell::new(None),
        });

        if let Err(e) = hio.install_dev(dev.clone() as Rc<dyn Dev>) {
            dev.core.close_hnd();
            if side_chan >= 0 {
                sys::close_fd(side_chan);
            }
            return Err(e);
        }
        Ok(dev)
    }

    /// Wraps an already-accepted handle (from `accept` elsewhere or a
    /// side-channel handoff) as a connected client device.
    pub fn adopt(
        hio: &Rc<Hio>,
        fd: RawFd,
        typ: SckType,
        remoteaddr: SkAd,
        cbs: SckCbs,
        intercepted: bool,
    ) -> io::Result<Rc<DevSck>> {
        sys::set_nonblock(fd)?;
        sys::set_cloexec(fd)?;
        let mut state = STATE_ACCEPTED;
        if intercepted {
            state |= STATE_INTERCEPTED;
        }
        let dev = Rc::new(DevSck {
            core: DevCore::new(hio, fd, EofMode::ShutdownWrite),
            typ,
            state: Cell::new(state),
            cbs: RefCell::new(cbs),
            localaddr: RefCell::new(None),
            remoteaddr: RefCell::new(Some(remoteaddr)),
            side_chan: Cell::new(-1),
            ctmridx: new_tmridx(),
            accept_tmout: Cell::new(None),
            ssl_certfile: RefCell::new(None),
            ssl_keyfile: RefCell::new(None),
        });
        hio.install_dev(dev.clone() as Rc<dyn Dev>)?;
        let on_connect = dev.cbs.borrow().on_connect.clone();
        on_connect(&dev);
        Ok(dev)
    }

    pub fn hio(&self) -> io::Result<Rc<Hio>> {
        self.core.hio()
    }

    pub fn typ(&self) -> SckType {
        self.typ
    }

    pub fn hnd(&self) -> RawFd {
        self.core.hnd()
    }

    pub fn state(&self) -> u32 {
        self.state.get()
    }

    fn set_progress(&self, bits: u32) {
        self.state
            .set((self.state.get() & !PROGRESS_MASK) | bits);
    }

    pub fn is_lenient(&self) -> bool {
        self.state.get() & STATE_LENIENT != 0
    }

    pub fn is_halted(&self) -> bool {
        self.core.is_halted()
    }

    // --- callback plumbing -------------------------------------------------

    pub fn on_read(&self) -> SckOnRead {
        self.cbs.borrow().on_read.clone()
    }

    pub fn on_write(&self) -> SckOnWrite {
        self.cbs.borrow().on_write.clone()
    }

    pub fn on_disconnect(&self) -> SckOnDisconnect {
        self.cbs.borrow().on_disconnect.clone()
    }

    pub fn set_on_read(&self, cb: SckOnRead) {
        self.cbs.borrow_mut().on_read = cb;
    }

    pub fn set_on_write(&self, cb: SckOnWrite) {
        self.cbs.borrow_mut().on_write = cb;
    }

    pub fn set_on_disconnect(&self, cb: SckOnDisconnect) {
        self.cbs.borrow_mut().on_disconnect = cb;
    }

    // --- setup -------------------------------------------------------------

    pub fn bind(&self, info: &SckBind) -> io::Result<()> {
        let fd = self.core.hnd();
        if self.typ == SckType::Qx {
            // No OS-level binding for the in-process transport.
            return Ok(());
        }
        if info.reuseaddr {
            set_int_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
        }
        if info.reuseport {
            set_int_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, 1)?;
        }
        if info.transparent {
            let r = set_int_opt(fd, libc::SOL_IP, libc::IP_TRANSPARENT, 1);
            if r.is_err() && !info.ignerr {
                return r;
            }
        }
        if info.broadcast {
            let r = set_int_opt(fd, libc::SOL_SOCKET, libc::SO_BROADCAST, 1);
            if r.is_err() && !info.ignerr {
                return r;
            }
        }
        *self.ssl_certfile.borrow_mut() = info.ssl_certfile.clone();
        *self.ssl_keyfile.borrow_mut() = info.ssl_keyfile.clone();

        if let Some(addr) = &info.addr {
            if self.typ == SckType::Unix {
                if let Some(path) = addr.unix_path() {
                    let _ = std::fs::remove_file(path);
                }
            }
            sys::cvt(unsafe { libc::bind(fd, addr.as_ptr(), addr.len()) })?;
            *self.localaddr.borrow_mut() = Some(*addr);
        }
        Ok(())
    }

    pub fn listen(&self, info: &SckListen) -> io::Result<()> {
        if self.typ != SckType::Qx {
            sys::cvt(unsafe { libc::listen(self.core.hnd(), info.backlogs) })?;
        }
        self.accept_tmout.set(info.accept_tmout);
        self.set_progress(STATE_LISTENING);
        Ok(())
    }

    /// The handshake ceiling configured at listen time, for the TLS
    /// collaborator.
    pub fn accept_tmout(&self) -> Option<Duration> {
        self.accept_tmout.get()
    }

    /// Starts a non-blocking connect. `on_connect` fires when the progress
    /// state reaches `CONNECTED`; a timeout or failure halts the device and
    /// surfaces through `on_disconnect`.
    pub fn connect(self: &Rc<Self>, info: &SckConnect) -> io::Result<()> {
        let hio = self.core.hio()?;
        let addr = info.addr;
        let res = sys::cvt(unsafe { libc::connect(self.core.hnd(), addr.as_ptr(), addr.len()) });
        *self.remoteaddr.borrow_mut() = Some(addr);
        match res {
            Ok(_) => {
                // Completed synchronously; still report through the OUT
                // event path for a single code path.
                self.set_progress(STATE_CONNECTING);
                self.core.set_force_out(true)?;
            }
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {
                self.set_progress(STATE_CONNECTING);
                self.core.set_force_out(true)?;
                if let Some(tmout) = info.connect_tmout {
                    let weak = Rc::downgrade(self);
                    hio.sched_tmrjob_after(
                        tmout,
                        &self.ctmridx,
                        Box::new(move |_hio, _now| {
                            if let Some(dev) = weak.upgrade() {
                                debug!("connect timed out on fd {}", dev.hnd());
                                dev.halt();
                            }
                        }),
                    )?;
                }
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    // --- I/O ---------------------------------------------------------------

    /// Toggles read interest. While disabled there is no `on_read`
    /// delivery.
    pub fn read(&self, enabled: bool) -> io::Result<()> {
        if !enabled && self.core.rtmridx.get() != TMRIDX_INVALID {
            self.core.hio()?.del_tmrjob(&self.core.rtmridx);
        }
        self.core.set_reading(enabled)
    }

    /// Like [`read`](DevSck::read) but arms a timer; expiry delivers
    /// `on_read(Err(TimedOut))`.
    pub fn timedread(self: &Rc<Self>, enabled: bool, tmout: Duration) -> io::Result<()> {
        let hio = self.core.hio()?;
        if self.core.rtmridx.get() != TMRIDX_INVALID {
            hio.del_tmrjob(&self.core.rtmridx);
        }
        self.core.set_reading(enabled)?;
        if enabled {
            let weak = Rc::downgrade(self);
            hio.sched_tmrjob_after(
                tmout,
                &self.core.rtmridx,
                Box::new(move |_hio, _now| {
                    if let Some(dev) = weak.upgrade() {
                        dev.deliver_read(
                            Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out")),
                            None,
                        );
                    }
                }),
            )?;
        }
        Ok(())
    }

    /// Enqueues a write. `dstaddr` selects the target for datagram
    /// sockets. Completion is acknowledged through `on_write` with the
    /// same `wrctx`.
    pub fn write(&self, data: &[u8], wrctx: usize, dstaddr: Option<&SkAd>) -> io::Result<()> {
        self.enqueue_bytes(data.to_vec(), wrctx, dstaddr, None)
    }

    /// Gather-write: the buffers are sent as one contiguous request and
    /// acknowledged once.
    pub fn writev(&self, bufs: &[&[u8]], wrctx: usize, dstaddr: Option<&SkAd>) -> io::Result<()> {
        let total = bufs.iter().map(|b| b.len()).sum();
        let mut data = Vec::with_capacity(total);
        for buf in bufs {
            data.extend_from_slice(buf);
        }
        self.enqueue_bytes(data, wrctx, dstaddr, None)
    }

    /// Write with a deadline; expiry removes the request and delivers
    /// `on_write(Err(TimedOut), wrctx)`.
    pub fn timedwrite(
        self: &Rc<Self>,
        data: &[u8],
        tmout: Duration,
        wrctx: usize,
        dstaddr: Option<&SkAd>,
    ) -> io::Result<()> {
        let hio = self.core.hio()?;
        let idx = new_tmridx();
        let weak = Rc::downgrade(self);
        let idx2 = idx.clone();
        hio.sched_tmrjob_after(
            tmout,
            &idx,
            Box::new(move |_hio, _now| {
                if let Some(dev) = weak.upgrade() {
                    if let Some(wrctx) = dev.core.abort_timed_write(&idx2) {
                        let cb = dev.on_write();
                        let r = cb(
                            &dev,
                            Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out")),
                            wrctx,
                        );
                        if r.is_err() {
                            dev.halt();
                        }
                    }
                }
            }),
        )?;
        self.enqueue_bytes(data.to_vec(), wrctx, dstaddr, Some(idx))
    }

    /// Enqueues a zero-copy transfer from `in_fd`.
    pub fn sendfile(&self, in_fd: RawFd, foff: u64, len: usize, wrctx: usize) -> io::Result<()> {
        self.core.enqueue(WriteJob {
            pl: Payload::File { fd: in_fd, off: foff },
            pos: 0,
            len,
            wrctx,
            dst: None,
            tmridx: None,
        })
    }

    /// Enqueues an EOF marker: once every write before it has drained, the
    /// write side shuts down and `on_write(Ok(0), wrctx)` is delivered.
    pub fn write_eof(&self, wrctx: usize) -> io::Result<()> {
        self.core.enqueue(WriteJob {
            pl: Payload::Eof,
            pos: 0,
            len: 0,
            wrctx,
            dst: None,
            tmridx: None,
        })
    }

    fn enqueue_bytes(
        &self,
        data: Vec<u8>,
        wrctx: usize,
        dstaddr: Option<&SkAd>,
        tmridx: Option<TmrIdx>,
    ) -> io::Result<()> {
        let len = data.len();
        if len == 0 {
            // A zero-length write is the EOF indication.
            return self.core.enqueue(WriteJob {
                pl: Payload::Eof,
                pos: 0,
                len: 0,
                wrctx,
                dst: None,
                tmridx,
            });
        }
        self.core.enqueue(WriteJob {
            pl: Payload::Bytes(data),
            pos: 0,
            len,
            wrctx,
            dst: dstaddr.copied(),
            tmridx,
        })
    }

    /// Graceful half-close of either or both directions.
    pub fn shutdown(&self, how: u32) -> io::Result<()> {
        let flag = match (how & SHUTDOWN_READ != 0, how & SHUTDOWN_WRITE != 0) {
            (true, true) => libc::SHUT_RDWR,
            (true, false) => libc::SHUT_RD,
            (false, true) => libc::SHUT_WR,
            (false, false) => return Ok(()),
        };
        sys::cvt(unsafe { libc::shutdown(self.core.hnd(), flag) })?;
        Ok(())
    }

    /// Whether `sendfile` works on this socket.
    pub fn sendfileok(&self) -> bool {
        self.typ.is_stream()
    }

    /// Marks the device to be killed; finalization and `on_disconnect`
    /// happen at the end of the current tick.
    pub fn halt(self: &Rc<Self>) {
        if let Ok(hio) = self.core.hio() {
            hio.halt_dev(self.clone() as Rc<dyn Dev>);
        }
    }

    /// Finalizes immediately. Only legal before the device produced any
    /// events (e.g. a listener whose bind failed).
    pub fn kill(self: &Rc<Self>) {
        if let Ok(hio) = self.core.hio() {
            hio.kill_dev(self.clone() as Rc<dyn Dev>);
        }
    }

    // --- addresses and options ---------------------------------------------

    pub fn getsockaddr(&self) -> io::Result<SkAd> {
        if self.typ == SckType::Qx {
            return Ok(SkAd::qx());
        }
        let mut ad = SkAd::zeroed();
        sys::cvt(unsafe { libc::getsockname(self.core.hnd(), ad.as_mut_ptr(), ad.len_mut()) })?;
        *self.localaddr.borrow_mut() = Some(ad);
        Ok(ad)
    }

    pub fn getpeeraddr(&self) -> io::Result<SkAd> {
        if let Some(ad) = *self.remoteaddr.borrow() {
            return Ok(ad);
        }
        let mut ad = SkAd::zeroed();
        sys::cvt(unsafe { libc::getpeername(self.core.hnd(), ad.as_mut_ptr(), ad.len_mut()) })?;
        *self.remoteaddr.borrow_mut() = Some(ad);
        Ok(ad)
    }

    pub fn set_tcp_cork(&self, on: bool) {
        let _ = set_int_opt(
            self.core.hnd(),
            libc::SOL_TCP,
            libc::TCP_CORK,
            on as libc::c_int,
        );
    }

    pub fn set_tcp_nodelay(&self, on: bool) {
        let _ = set_int_opt(
            self.core.hnd(),
            libc::SOL_TCP,
            libc::TCP_NODELAY,
            on as libc::c_int,
        );
    }

    // --- side channel ------------------------------------------------------

    /// The cross-thread writer for a `Qx` socket's side channel.
    pub fn side_chan_handle(&self) -> Option<SideChanHandle> {
        let fd = self.side_chan.get();
        if fd >= 0 {
            Some(SideChanHandle { fd })
        } else {
            None
        }
    }

    /// Writes raw bytes into the side channel; the loop thread reads them
    /// back through `on_read`.
    pub fn writetosidechan(&self, data: &[u8]) -> io::Result<usize> {
        match self.side_chan_handle() {
            Some(h) => h.write(data),
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "device has no side channel",
            )),
        }
    }

    // --- dispatch ----------------------------------------------------------

    fn deliver_read(self: &Rc<Self>, res: io::Result<&[u8]>, src: Option<&SkAd>) {
        if self.core.rtmridx.get() != TMRIDX_INVALID {
            if let Ok(hio) = self.core.hio() {
                hio.del_tmrjob(&self.core.rtmridx);
            }
        }
        let fatal = res.is_err();
        let cb = self.on_read();
        if cb(self, res, src).is_err() || fatal {
            self.halt();
        }
    }

    fn accept_pass(self: &Rc<Self>) {
        loop {
            let mut ad = SkAd::zeroed();
            let res = sys::cvt(unsafe {
                libc::accept4(
                    self.core.hnd(),
                    ad.as_mut_ptr(),
                    ad.len_mut(),
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            });
            let fd = match res {
                Ok(fd) => fd,
                Err(ref e) if would_block(e) => return,
                Err(e) => {
                    warn!("accept failed on fd {}: {}", self.core.hnd(), e);
                    if !self.is_lenient() {
                        self.halt();
                    }
                    return;
                }
            };

            let raw_cb = self.cbs.borrow().on_raw_accept.clone();
            if let Some(raw_cb) = raw_cb {
                // The callee owns the handle from here on.
                raw_cb(self, fd, &ad);
                continue;
            }

            let hio = match self.core.hio() {
                Ok(hio) => hio,
                Err(_) => {
                    sys::close_fd(fd);
                    return;
                }
            };
            let cbs = self.cbs.borrow().clone();
            match DevSck::adopt(&hio, fd, self.typ, ad, cbs, false) {
                Ok(_dev) => {}
                Err(e) => {
                    warn!("unable to set up accepted socket: {}", e);
                    if !self.is_lenient() {
                        self.halt();
                        return;
                    }
                }
            }
        }
    }

    fn connect_pass(self: &Rc<Self>) {
        let mut err: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        let res = sys::cvt(unsafe {
            libc::getsockopt(
                self.core.hnd(),
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut _ as *mut libc::c_void,
                &mut len,
            )
        });
        if res.is_err() || err != 0 {
            debug!("connect failed on fd {}: errno {}", self.core.hnd(), err);
            self.halt();
            return;
        }
        if let Ok(hio) = self.core.hio() {
            if self.ctmridx.get() != TMRIDX_INVALID {
                hio.del_tmrjob(&self.ctmridx);
            }
        }
        let _ = self.core.set_force_out(false);
        self.set_progress(STATE_CONNECTED);
        let _ = self.getsockaddr();
        let cb = self.cbs.borrow().on_connect.clone();
        cb(self);
    }
}

impl Dev for DevSck {
    fn core(&self) -> &DevCore {
        &self.core
    }

    fn dispatch_readable(self: Rc<Self>) {
        if self.state.get() & STATE_LISTENING != 0 && self.typ != SckType::Qx {
            self.accept_pass();
            return;
        }
        if !self.core.is_reading() {
            return;
        }
        let hio = match self.core.hio() {
            Ok(hio) => hio,
            Err(_) => return,
        };
        let mut buf = hio.rdbuf.borrow_mut();
        let fd = self.core.hnd();
        let is_stream = self.typ.is_stream() || self.typ == SckType::Qx;
        if is_stream {
            let res = sys::cvt(unsafe {
                libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            });
            match res {
                Ok(n) => {
                    let data = buf[..n as usize].to_vec();
                    drop(buf);
                    self.deliver_read(Ok(&data[..]), None);
                }
                Err(ref e) if would_block(e) => {}
                Err(e) => {
                    drop(buf);
                    self.deliver_read(Err(e), None);
                }
            }
        } else {
            let mut src = SkAd::zeroed();
            let res = sys::cvt(unsafe {
                libc::recvfrom(
                    fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                    src.as_mut_ptr(),
                    src.len_mut(),
                )
            });
            match res {
                Ok(n) => {
                    let data = buf[..n as usize].to_vec();
                    drop(buf);
                    self.deliver_read(Ok(&data[..]), Some(&src));
                }
                Err(ref e) if would_block(e) => {}
                Err(e) => {
                    drop(buf);
                    self.deliver_read(Err(e), None);
                }
            }
        }
    }

    fn dispatch_writable(self: Rc<Self>) {
        if self.state.get() & STATE_CONNECTING != 0 {
            self.connect_pass();
            return;
        }
        for done in self.core.flush_wq() {
            if self.core.is_halted() {
                break;
            }
            let cb = self.on_write();
            let (res, wrctx, fatal) = match done {
                WriteDone::Wrote(len, ctx) => (Ok(len), ctx, false),
                WriteDone::EofMark(ctx) => (Ok(0), ctx, false),
                WriteDone::Failed(e, ctx) => (Err(e), ctx, true),
            };
            if cb(&self, res, wrctx).is_err() || fatal {
                self.halt();
            }
        }
    }

    fn finalize(self: Rc<Self>) {
        if !self.core.mark_finalized() {
            return;
        }
        self.core.unwatch();
        // A final status queued right before the halt still gets its one
        // shot at the kernel; completions are not reported.
        let _ = self.core.flush_wq();
        let cb = self.cbs.borrow().on_disconnect.clone();
        cb(&self);
        let sc = self.side_chan.replace(-1);
        if sc >= 0 {
            sys::close_fd(sc);
        }
        self.core.close_hnd();
    }
}

fn set_int_opt(
    fd: RawFd,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> io::Result<()> {
    sys::cvt(unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    })?;
    Ok(())
}
