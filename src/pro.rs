use std::cell::{Cell, RefCell};
use std::ffi::OsString;
use std::io;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::process::{Child, Command, Stdio};
use std::rc::{Rc, Weak};

use log::{debug, warn};

use crate::dev::{would_block, Dev, DevCore, EofMode, Payload, WriteDone, WriteJob};
use crate::sys;
use crate::Hio;

/// Wire a pipe to the child's stdin and expose it for writing.
pub const PRO_WRITEIN: u32 = 1 << 0;
/// Wire a pipe to the child's stdout and expose it for reading.
pub const PRO_READOUT: u32 = 1 << 1;
/// Wire a pipe to the child's stderr and expose it for reading.
pub const PRO_READERR: u32 = 1 << 2;
/// Redirect the child's stdin from /dev/null.
pub const PRO_INTONUL: u32 = 1 << 5;
/// Redirect the child's stdout to /dev/null.
pub const PRO_OUTTONUL: u32 = 1 << 6;
/// Redirect the child's stderr to /dev/null.
pub const PRO_ERRTONUL: u32 = 1 << 7;
/// Perform no reaping of the child when the device is destroyed.
pub const PRO_FORGET_CHILD: u32 = 1 << 14;

/// Identifies which stream of the child an event belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProSid {
    /// The device as a whole; used only with `on_close`.
    Master,
    /// The child's standard input.
    In,
    /// The child's standard output.
    Out,
    /// The child's standard error.
    Err,
}

pub type ProOnRead = Rc<dyn Fn(&Rc<DevPro>, ProSid, io::Result<&[u8]>) -> io::Result<()>>;
pub type ProOnWrite = Rc<dyn Fn(&Rc<DevPro>, io::Result<usize>, usize) -> io::Result<()>>;
pub type ProOnClose = Rc<dyn Fn(&Rc<DevPro>, ProSid)>;

/// Parameters for [`DevPro::make`].
pub struct ProMake {
    pub flags: u32,
    /// Program to execute.
    pub cmd: String,
    pub args: Vec<String>,
    /// The complete environment of the child. The parent environment is
    /// never inherited and never mutated.
    pub envs: Vec<(OsString, OsString)>,
    pub on_read: ProOnRead,
    pub on_write: ProOnWrite,
    pub on_close: ProOnClose,
}

/// A child process with up to three inherited pipes, each wrapped as a
/// slave device sharing the master's lifetime.
pub struct DevPro {
    flags: u32,
    child: RefCell<Option<Child>>,
    child_pid: libc::pid_t,
    slaves: RefCell<[Option<Rc<ProSlave>>; 3]>,
    nslaves: Cell<usize>,
    closed: Cell<bool>,
    on_read: ProOnRead,
    on_write: ProOnWrite,
    on_close: ProOnClose,
    pub(crate) cmd: String,
}

struct ProSlave {
    core: DevCore,
    sid: ProSid,
    master: RefCell<Weak<DevPro>>,
}

fn sid_slot(sid: ProSid) -> usize {
    match sid {
        ProSid::In => 0,
        ProSid::Out => 1,
        ProSid::Err => 2,
        ProSid::Master => unreachable!("master has no slot"),
    }
}

impl DevPro {
    pub fn make(hio: &Rc<Hio>, mk: ProMake) -> io::Result<Rc<DevPro>> {
        let mut cmd = Command::new(&mk.cmd);
        cmd.args(&mk.args);
        cmd.env_clear();
        for (k, v) in &mk.envs {
            cmd.env(k, v);
        }

        cmd.stdin(if mk.flags & PRO_WRITEIN != 0 {
            Stdio::piped()
        } else if mk.flags & PRO_INTONUL != 0 {
            Stdio::null()
        } else {
            Stdio::inherit()
        });
        cmd.stdout(if mk.flags & PRO_READOUT != 0 {
            Stdio::piped()
        } else if mk.flags & PRO_OUTTONUL != 0 {
            Stdio::null()
        } else {
            Stdio::inherit()
        });
        cmd.stderr(if mk.flags & PRO_READERR != 0 {
            Stdio::piped()
        } else if mk.flags & PRO_ERRTONUL != 0 {
            Stdio::null()
        } else {
            Stdio::inherit()
        });

        let mut child = cmd.spawn()?;
        let child_pid = child.id() as libc::pid_t;
        debug!("forked child {} for {}", child_pid, mk.cmd);

        let stdin_fd = child.stdin.take().map(|p| p.into_raw_fd());
        let stdout_fd = child.stdout.take().map(|p| p.into_raw_fd());
        let stderr_fd = child.stderr.take().map(|p| p.into_raw_fd());

        let pro = Rc::new(DevPro {
            flags: mk.flags,
            child: RefCell::new(Some(child)),
            child_pid,
            slaves: RefCell::new([None, None, None]),
            nslaves: Cell::new(0),
            closed: Cell::new(false),
            on_read: mk.on_read,
            on_write: mk.on_write,
            on_close: mk.on_close,
            cmd: mk.cmd,
        });

        let mut res = Ok(());
        for (fd, sid) in [
            (stdin_fd, ProSid::In),
            (stdout_fd, ProSid::Out),
            (stderr_fd, ProSid::Err),
        ] {
            let fd = match fd {
                Some(fd) => fd,
                None => continue,
            };
            if let Err(e) = pro.make_slave(hio, fd, sid) {
                res = Err(e);
                break;
            }
        }
        if let Err(e) = res {
            pro.halt();
            return Err(e);
        }
        Ok(pro)
    }

    fn make_slave(self: &Rc<Self>, hio: &Rc<Hio>, fd: RawFd, sid: ProSid) -> io::Result<()> {
        sys::set_nonblock(fd)?;
        let slave = Rc::new(ProSlave {
            core: DevCore::new(hio, fd, EofMode::Mark),
            sid,
            master: RefCell::new(Rc::downgrade(self)),
        });
        // The child-stdin pipe is write-only on this side.
        if sid == ProSid::In {
            slave.core.set_reading(false)?;
        }
        hio.install_dev(slave.clone() as Rc<dyn Dev>)?;
        self.slaves.borrow_mut()[sid_slot(sid)] = Some(slave);
        self.nslaves.set(self.nslaves.get() + 1);
        Ok(())
    }

    pub fn child_pid(&self) -> libc::pid_t {
        self.child_pid
    }

    /// Toggles read interest on the given output stream.
    pub fn read(&self, sid: ProSid, enabled: bool) -> io::Result<()> {
        match &self.slaves.borrow()[sid_slot(sid)] {
            Some(slave) => slave.core.set_reading(enabled),
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "stream not wired",
            )),
        }
    }

    /// Enqueues bytes for the child's stdin. A zero-length write is the
    /// EOF indication and closes the pipe once drained.
    pub fn write(&self, data: &[u8], wrctx: usize) -> io::Result<()> {
        let slave = match &self.slaves.borrow()[sid_slot(ProSid::In)] {
            Some(slave) => slave.clone(),
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "stdin not wired",
                ))
            }
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

    /// Closes one of the child's streams ahead of the whole device.
    pub fn close_sid(&self, sid: ProSid) {
        let slave = self.slaves.borrow()[sid_slot(sid)].clone();
        if let Some(slave) = slave {
            slave.halt();
        }
    }

    /// Halts every slave; the master close fires when the last one is
    /// finalized.
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
            slave.halt();
        }
    }

    fn slave_gone(self: &Rc<Self>, sid: ProSid) {
        self.slaves.borrow_mut()[sid_slot(sid)] = None;
        (self.on_close)(self, sid);
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
        debug!("closing process device for {}", self.cmd);
        if let Some(mut child) = self.child.borrow_mut().take() {
            if self.flags & PRO_FORGET_CHILD == 0 {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        debug!("child {} exited with {}", self.child_pid, status)
                    }
                    Ok(None) => {
                        // Still running with all its pipes gone; reap it.
                        let _ = child.kill();
                        let _ = child.wait();
                        debug!("reaped lingering child {}", self.child_pid);
                    }
                    Err(e) => warn!("unable to wait for child {}: {}", self.child_pid, e),
                }
            }
        }
        (self.on_close)(self, ProSid::Master);
    }
}

impl ProSlave {
    fn master(&self) -> Option<Rc<DevPro>> {
        self.master.borrow().upgrade()
    }

    fn halt(self: &Rc<Self>) {
        if let Ok(hio) = self.core.hio() {
            hio.halt_dev(self.clone() as Rc<dyn Dev>);
        }
    }
}

impl Dev for ProSlave {
    fn core(&self) -> &DevCore {
        &self.core
    }

    fn dispatch_readable(self: Rc<Self>) {
        let master = match self.master() {
            Some(master) => master,
            None => {
                self.halt();
                return;
            }
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
                let r = (master.on_read)(&master, self.sid, Ok(&data[..]));
                if n == 0 {
                    // Pipe EOF: the stream is finished for good.
                    self.halt();
                } else if r.is_err() {
                    self.halt();
                }
            }
            Err(ref e) if would_block(e) => {}
            Err(e) => {
                drop(buf);
                let _ = (master.on_read)(&master, self.sid, Err(e));
                self.halt();
            }
        }
    }

    fn dispatch_writable(self: Rc<Self>) {
        let master = match self.master() {
            Some(master) => master,
            None => {
                self.halt();
                return;
            }
        };
        for done in self.core.flush_wq() {
            if self.core.is_halted() {
                break;
            }
            match done {
                WriteDone::Wrote(len, ctx) => {
                    if (master.on_write)(&master, Ok(len), ctx).is_err() {
                        self.halt();
                    }
                }
                WriteDone::EofMark(ctx) => {
                    let _ = (master.on_write)(&master, Ok(0), ctx);
                    // Closing our end is what delivers EOF to the child.
                    self.halt();
                }
                WriteDone::Failed(e, ctx) => {
                    let _ = (master.on_write)(&master, Err(e), ctx);
                    self.halt();
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
