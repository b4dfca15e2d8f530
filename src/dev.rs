use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

use log::trace;

use crate::skad::SkAd;
use crate::sys;
use crate::timer::{new_tmridx, TmrIdx, TMRIDX_INVALID};
use crate::{Hio, Interest, Token};

pub(crate) const TOKEN_INVALID: usize = usize::MAX;

/// What draining an EOF write marker does to the handle.
#[derive(Copy, Clone, PartialEq)]
pub(crate) enum EofMode {
    /// `shutdown(SHUT_WR)` and keep the handle open for reading.
    ShutdownWrite,
    /// The write side is the whole handle (a pipe): report and let the
    /// owner halt.
    Mark,
}

pub(crate) enum Payload {
    Bytes(Vec<u8>),
    File { fd: RawFd, off: u64 },
    Eof,
}

pub(crate) struct WriteJob {
    pub pl: Payload,
    /// Bytes of the payload already handed to the kernel.
    pub pos: usize,
    /// Total payload length; reported to `on_write` on completion.
    pub len: usize,
    pub wrctx: usize,
    pub dst: Option<SkAd>,
    pub tmridx: Option<TmrIdx>,
}

/// One completed (or failed) write request, to be reported through the
/// owning device's `on_write`.
pub(crate) enum WriteDone {
    Wrote(usize, usize),
    EofMark(usize),
    Failed(io::Error, usize),
}

/// State shared by every device kind: the OS handle, the multiplexer
/// bookkeeping, the pending-write queue and the timed-op timer slots.
pub(crate) struct DevCore {
    hio: Weak<Hio>,
    token: Cell<usize>,
    hnd: Cell<RawFd>,
    wq: RefCell<VecDeque<WriteJob>>,
    reading: Cell<bool>,
    /// Forces OUT interest regardless of the write queue; used while a
    /// connect is in flight.
    force_out: Cell<bool>,
    watched: Cell<bool>,
    halted: Cell<bool>,
    finalized: Cell<bool>,
    eof_mode: EofMode,
    /// Timer slot for a pending timed read.
    pub rtmridx: TmrIdx,
}

impl DevCore {
    pub fn new(hio: &Rc<Hio>, hnd: RawFd, eof_mode: EofMode) -> DevCore {
        DevCore {
            hio: Rc::downgrade(hio),
            token: Cell::new(TOKEN_INVALID),
            hnd: Cell::new(hnd),
            wq: RefCell::new(VecDeque::new()),
            reading: Cell::new(true),
            force_out: Cell::new(false),
            watched: Cell::new(false),
            halted: Cell::new(false),
            finalized: Cell::new(false),
            eof_mode,
            rtmridx: new_tmridx(),
        }
    }

    pub fn hio(&self) -> io::Result<Rc<Hio>> {
        self.hio.upgrade().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "event loop is gone")
        })
    }

    pub fn hnd(&self) -> RawFd {
        self.hnd.get()
    }

    pub fn set_hnd(&self, fd: RawFd) {
        self.hnd.set(fd);
    }

    pub fn token(&self) -> Token {
        Token(self.token.get())
    }

    pub fn set_token(&self, token: Token) {
        self.token.set(token.0);
    }

    pub fn installed(&self) -> bool {
        self.token.get() != TOKEN_INVALID
    }

    pub fn is_halted(&self) -> bool {
        self.halted.get()
    }

    pub fn mark_halted(&self) -> bool {
        let old = self.halted.get();
        self.halted.set(true);
        !old
    }

    pub fn mark_finalized(&self) -> bool {
        let old = self.finalized.get();
        self.finalized.set(true);
        !old
    }

    pub fn is_reading(&self) -> bool {
        self.reading.get()
    }

    pub fn have_pending_writes(&self) -> bool {
        !self.wq.borrow().is_empty()
    }

    pub fn set_force_out(&self, on: bool) -> io::Result<()> {
        if self.force_out.get() != on {
            self.force_out.set(on);
            self.update_watch()?;
        }
        Ok(())
    }

    fn interests(&self) -> Option<Interest> {
        let r = self.reading.get();
        let w = self.have_pending_writes() || self.force_out.get();
        match (r, w) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    /// Brings the multiplexer registration in line with the current read
    /// flag and write queue. An empty interest set drops the registration
    /// entirely so a disabled device produces no callbacks at all.
    pub fn update_watch(&self) -> io::Result<()> {
        if self.halted.get() || !self.installed() {
            return Ok(());
        }
        let hio = self.hio()?;
        let fd = self.hnd.get();
        match (self.watched.get(), self.interests()) {
            (false, Some(i)) => {
                hio.poller().register(fd, self.token(), i)?;
                self.watched.set(true);
            }
            (true, Some(i)) => hio.poller().reregister(fd, self.token(), i)?,
            (true, None) => {
                hio.poller().deregister(fd)?;
                self.watched.set(false);
            }
            (false, None) => {}
        }
        Ok(())
    }

    /// Drops the registration unconditionally (finalization path).
    pub fn unwatch(&self) {
        if self.watched.get() {
            if let Ok(hio) = self.hio() {
                let _ = hio.poller().deregister(self.hnd.get());
            }
            self.watched.set(false);
        }
    }

    pub fn set_reading(&self, enabled: bool) -> io::Result<()> {
        if self.reading.get() != enabled {
            self.reading.set(enabled);
            self.update_watch()?;
        }
        Ok(())
    }

    pub fn enqueue(&self, job: WriteJob) -> io::Result<()> {
        if self.halted.get() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "device is halted",
            ));
        }
        self.wq.borrow_mut().push_back(job);
        self.update_watch()
    }

    /// Cancels every timer attached to this device: the timed-read slot and
    /// any per-write timers.
    pub fn cancel_timers(&self, hio: &Rc<Hio>) {
        if self.rtmridx.get() != TMRIDX_INVALID {
            hio.del_tmrjob(&self.rtmridx);
        }
        for job in self.wq.borrow().iter() {
            if let Some(idx) = &job.tmridx {
                if idx.get() != TMRIDX_INVALID {
                    hio.del_tmrjob(idx);
                }
            }
        }
    }

    /// Removes a timed write whose timer fired. Returns its context for the
    /// timeout report.
    pub fn abort_timed_write(&self, idx: &TmrIdx) -> Option<usize> {
        let mut wq = self.wq.borrow_mut();
        let pos = wq.iter().position(|job| {
            job.tmridx
                .as_ref()
                .map(|t| Rc::ptr_eq(t, idx))
                .unwrap_or(false)
        })?;
        let job = wq.remove(pos).unwrap();
        drop(wq);
        let _ = self.update_watch();
        Some(job.wrctx)
    }

    /// Pushes queued writes into the kernel until it pushes back. Each
    /// fully dispatched request produces exactly one completion record.
    pub fn flush_wq(&self) -> Vec<WriteDone> {
        let mut done = Vec::new();
        loop {
            let mut wq = self.wq.borrow_mut();
            let job = match wq.front_mut() {
                Some(job) => job,
                None => break,
            };
            let fd = self.hnd.get();
            match &job.pl {
                Payload::Eof => {
                    let wrctx = job.wrctx;
                    let tmridx = job.tmridx.clone();
                    wq.pop_front();
                    drop(wq);
                    self.clear_write_timer(tmridx);
                    if self.eof_mode == EofMode::ShutdownWrite {
                        unsafe { libc::shutdown(fd, libc::SHUT_WR) };
                    }
                    done.push(WriteDone::EofMark(wrctx));
                    continue;
                }
                Payload::Bytes(data) => {
                    let res = match &job.dst {
                        Some(dst) => sys::cvt(unsafe {
                            libc::sendto(
                                fd,
                                data[job.pos..].as_ptr() as *const libc::c_void,
                                data.len() - job.pos,
                                libc::MSG_NOSIGNAL,
                                dst.as_ptr(),
                                dst.len(),
                            )
                        }),
                        None => sys::cvt(unsafe {
                            libc::write(
                                fd,
                                data[job.pos..].as_ptr() as *const libc::c_void,
                                data.len() - job.pos,
                            )
                        }),
                    };
                    match res {
                        Ok(n) => {
                            job.pos += n as usize;
                            if job.pos >= job.len {
                                let wrctx = job.wrctx;
                                let len = job.len;
                                let tmridx = job.tmridx.clone();
                                wq.pop_front();
                                drop(wq);
                                self.clear_write_timer(tmridx);
                                done.push(WriteDone::Wrote(len, wrctx));
                                continue;
                            }
                            // Partial write; wait for the next OUT event.
                            break;
                        }
                        Err(e) if would_block(&e) => break,
                        Err(e) => {
                            let wrctx = job.wrctx;
                            let tmridx = job.tmridx.clone();
                            wq.pop_front();
                            drop(wq);
                            self.clear_write_timer(tmridx);
                            done.push(WriteDone::Failed(e, wrctx));
                            break;
                        }
                    }
                }
                Payload::File { fd: in_fd, off } => {
                    let mut offset = (*off + job.pos as u64) as libc::off_t;
                    let want = job.len - job.pos;
                    let res = sys::cvt(unsafe {
                        libc::sendfile(fd, *in_fd, &mut offset, want)
                    });
                    match res {
                        Ok(n) => {
                            job.pos += n as usize;
                            if job.pos >= job.len {
                                let wrctx = job.wrctx;
                                let len = job.len;
                                let tmridx = job.tmridx.clone();
                                wq.pop_front();
                                drop(wq);
                                self.clear_write_timer(tmridx);
                                done.push(WriteDone::Wrote(len, wrctx));
                                continue;
                            }
                            break;
                        }
                        Err(e) if would_block(&e) => break,
                        Err(e) => {
                            let wrctx = job.wrctx;
                            let tmridx = job.tmridx.clone();
                            wq.pop_front();
                            drop(wq);
                            self.clear_write_timer(tmridx);
                            done.push(WriteDone::Failed(e, wrctx));
                            break;
                        }
                    }
                }
            }
        }
        let _ = self.update_watch();
        done
    }

    fn clear_write_timer(&self, tmridx: Option<TmrIdx>) {
        if let Some(idx) = tmridx {
            if idx.get() != TMRIDX_INVALID {
                if let Ok(hio) = self.hio() {
                    hio.del_tmrjob(&idx);
                }
            }
        }
    }

    /// Closes the OS handle. Safe to call more than once.
    pub fn close_hnd(&self) {
        let fd = self.hnd.replace(-1);
        if fd >= 0 {
            trace!("closing fd {}", fd);
            sys::close_fd(fd);
        }
    }
}

pub(crate) fn would_block(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// The loop-facing face of a device. Implementations translate raw
/// readiness into the user-facing callback set of their kind.
pub(crate) trait Dev {
    fn core(&self) -> &DevCore;

    /// The handle reported readable by the multiplexer.
    fn dispatch_readable(self: Rc<Self>);

    /// The handle reported writable by the multiplexer.
    fn dispatch_writable(self: Rc<Self>);

    /// End-of-tick finalization after a halt: tear the registration down,
    /// deliver `on_disconnect` exactly once, close the handle.
    fn finalize(self: Rc<Self>);
}
