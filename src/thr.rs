use std::cell::{Cell, RefCell};
use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::thread::JoinHandle;

use log::{debug, warn};

use crate::dev::{would_block, Dev, DevCore, EofMode, Payload, WriteDone, WriteJob};
use crate::sys;
use crate::Hio;

/// The worker side of the pipe pair. `read` yields bytes the loop wrote to
/// the device; `write` feeds bytes back that the loop reads through
/// `on_read`. Both ends are blocking and are closed when the pair drops,
/// so the start context is released however the thread body exits.
pub struct ThrIoPair {
    rfd: RawFd,
    wfd: RawFd,
}

impl ThrIoPair {
    /// Signals end-of-output to the loop while keeping the read side open.
    pub fn close_write(&mut self) {
        let fd = self.wfd;
        if fd >= 0 {
            self.wfd = -1;
            sys::close_fd(fd);
        }
    }
}

impl Read for ThrIoPair {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        sys::cvt(unsafe {
            libc::read(self.rfd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
        })
        .map(|n| n as usize)
    }
}

impl Write for ThrIoPair {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        sys::cvt(unsafe {
            libc::write(self.wfd, buf.as_ptr() as *const libc::c_void, buf.len())
        })
        .map(|n| n as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for ThrIoPair {
    fn drop(&mut self) {
        sys::close_fd(self.rfd);
        if self.wfd >= 0 {
            sys::close_fd(self.wfd);
        }
    }
}

pub type ThrOnRead = Rc<dyn Fn(&Rc<DevThr>, io::Result<&[u8]>) -> io::Result<()>>;
pub type ThrOnWrite = Rc<dyn Fn(&Rc<DevThr>, io::Result<usize>, usize) -> io::Result<()>>;
pub type ThrOnClose = Rc<dyn Fn(&Rc<DevThr>)>;

/// Parameters for [`DevThr::make`].
pub struct ThrMake {
    /// Runs on the worker thread. Terminate on pipe EOF; there is no
    /// cooperative cancellation.
    pub func: Box<dyn FnOnce(ThrIoPair) + Send>,
    pub on_read: ThrOnRead,
    pub on_write: ThrOnWrite,
    pub on_close: ThrOnClose,
}

/// A worker thread sharing a bidirectional pipe pair with the loop.
pub struct DevThr {
    hio: Weak<Hio>,
    slaves: RefCell<[Option<Rc<ThrSlave>>; 2]>,
    nslaves: Cell<usize>,
    closed: Cell<bool>,
    join: RefCell<Option<JoinHandle<()>>>,
    on_read: ThrOnRead,
    on_write: ThrOnWrite,
    on_close: ThrOnClose,
}

#[derive(Copy, Clone, PartialEq)]
enum ThrSid {
    In,
    Out,
}

struct ThrSlave {
    core: DevCore,
    sid: ThrSid,
    master: RefCell<Weak<DevThr>>,
}

impl DevThr {
    pub fn make(hio: &Rc<Hio>, mk: ThrMake) -> io::Result<Rc<DevThr>> {
        // Loop-to-thread pipe: the loop writes nonblocking, the thread
        // reads blocking.
        let mut down = [0 as libc::c_int; 2];
        sys::cvt(unsafe { libc::pipe2(down.as_mut_ptr(), libc::O_CLOEXEC) })?;
        // Thread-to-loop pipe: the thread writes blocking, the loop reads
        // nonblocking.
        let mut up = [0 as libc::c_int; 2];
        if let Err(e) = sys::cvt(unsafe { libc::pipe2(up.as_mut_ptr(), libc::O_CLOEXEC) }) {
            sys::close_fd(down[0]);
            sys::close_fd(down[1]);
            return Err(e);
        }
        sys::set_nonblock(down[1])?;
        sys::set_nonblock(up[0])?;

        let iop = ThrIoPair {
            rfd: down[0],
            wfd: up[1],
        };

        let thr = Rc::new(DevThr {
            hio: Rc::downgrade(hio),
            slaves: RefCell::new([None, None]),
            nslaves: Cell::new(0),
            closed: Cell::new(false),
            join: RefCell::new(None),
            on_read: mk.on_read,
            on_write: mk.on_write,
            on_close: mk.on_close,
        });

        let func = mk.func;
        let handle = std::thread::Builder::new()
            .name("hio-thr".to_string())
            .spawn(move || func(iop))
            .map_err(|e| {
                sys::close_fd(down[1]);
                sys::close_fd(up[0]);
                e
            })?;
        *thr.join.borrow_mut() = Some(handle);

        for (fd, sid) in [(down[1], ThrSid::In), (up[0], ThrSid::Out)] {
            let slave = Rc::new(ThrSlave {
                core: DevCore::new(hio, fd, EofMode::Mark),
                sid,
                master: RefCell::new(Rc::downgrade(&thr)),
            });
            if sid == ThrSid::In {
                slave.core.set_reading(false)?;
            }
            if let Err(e) = hio.install_dev(slave.clone() as Rc<dyn Dev>) {
                thr.halt();
                return Err(e);
            }
            thr.slaves.borrow_mut()[sid as usize] = Some(slave);
            thr.nslaves.set(thr.nslaves.get() + 1);
        }
        Ok(thr)
    }

    /// Toggles read interest on the thread's output pipe.
    pub fn read(&self, enabled: bool) -> io::Result<()> {
        match &self.slaves.borrow()[ThrSid::Out as usize] {
            Some(slave) => slave.core.set_reading(enabled),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "output closed")),
        }
    }

    /// Enqueues bytes toward the thread. A zero-length write closes the
    /// thread's input once drained.
    pub fn write(&self, data: &[u8], wrctx: usize) -> io::Result<()> {
        let slave = match &self.slaves.borrow()[ThrSid::In as usize] {
            Some(slave) => slave.clone(),
            None => return Err(io::Error::new(io::ErrorKind::BrokenPipe, "input closed")),
        };
        if data.is_empty() {
            slave.core.enqueue(WriteJob {
                pl: Payload::Eof,
                pos: 0,
                len: 0,
                wrctx,
                dst: None,
                tmridx: None,
            })
        } else {
            slave.core.enqueue(WriteJob {
                pl: Payload::Bytes(data.to_vec()),
                pos: 0,
                len: data.len(),
                wrctx,
                dst: None,
                tmridx: None,
            })
        }
    }

    pub fn halt(self: &Rc<Self>) {
        let slaves: Vec<_> = self
            .slaves
            .borrow()
            .iter()
            .filter_map(|s| s.clone())
            .collect();
        if slaves.is_empty() {
            self.master_close();
            return;
        }
        for slave in slaves {
            if let Ok(hio) = slave.core.hio() {
                hio.halt_dev(slave.clone() as Rc<dyn Dev>);
            }
        }
    }

    fn slave_gone(self: &Rc<Self>, sid: ThrSid) {
        self.slaves.borrow_mut()[sid as usize] = None;
        let left = self.nslaves.get() - 1;
        self.nslaves.set(left);
        if left == 0 {
            self.master_close();
        }
    }

    fn master_close(self: &Rc<Self>) {
        if self.closed.replace(true) {
            return;
        }
        if let Some(handle) = self.join.borrow_mut().take() {
            // Both pipe ends are closed by now, so a well-behaved worker
            // is exiting. Never block the loop on one that is not.
            if handle.is_finished() {
                let _ = handle.join();
                debug!("worker thread joined");
            } else {
                warn!("worker thread still running; detaching");
            }
        }
        (self.on_close)(self);
    }
}

impl Dev for ThrSlave {
    fn core(&self) -> &DevCore {
        &self.core
    }

    fn dispatch_readable(self: Rc<Self>) {
        let master = match self.master.borrow().upgrade() {
            Some(master) => master,
            None => return,
        };
        if !self.core.is_reading() {
            return;
        }
        let hio = match self.core.hio() {
            Ok(hio) => hio,
            Err(_) => return,
        };
        let mut buf = hio.rdbuf.borrow_mut();
        let res = sys::cvt(unsafe {
            libc::read(
                self.core.hnd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        });
        match res {
            Ok(n) => {
                let data = buf[..n as usize].to_vec();
                drop(buf);
                let r = (master.on_read)(&master, Ok(&data[..]));
                if n == 0 || r.is_err() {
                    self.halt_self();
                }
            }
            Err(ref e) if would_block(e) => {}
            Err(e) => {
                drop(buf);
                let _ = (master.on_read)(&master, Err(e));
                self.halt_self();
            }
        }
    }

    fn dispatch_writable(self: Rc<Self>) {
        let master = match self.master.borrow().upgrade() {
            Some(master) => master,
            None => return,
        };
        for done in self.core.flush_wq() {
            if self.core.is_halted() {
                break;
            }
            match done {
                WriteDone::Wrote(len, ctx) => {
                    if (master.on_write)(&master, Ok(len), ctx).is_err() {
                        self.halt_self();
                    }
                }
                WriteDone::EofMark(ctx) => {
                    let _ = (master.on_write)(&master, Ok(0), ctx);
                    self.halt_self();
                }
                WriteDone::Failed(e, ctx) => {
                    let _ = (master.on_write)(&master, Err(e), ctx);
                    self.halt_self();
                }
            }
        }
    }

    fn finalize(self: Rc<Self>) {
        if !self.core.mark_finalized() {
            return;
        }
        self.core.unwatch();
        // Give queued bytes one last shot at the pipe before it closes.
        let _ = self.core.flush_wq();
        self.core.close_hnd();
        let master = std::mem::take(&mut *self.master.borrow_mut());
        if let Some(master) = master.upgrade() {
            master.slave_gone(self.sid);
        }
    }
}

impl ThrSlave {
    fn halt_self(self: &Rc<Self>) {
        if let Ok(hio) = self.core.hio() {
            hio.halt_dev(self.clone() as Rc<dyn Dev>);
        }
    }
}
