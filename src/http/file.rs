//! The file task: serves and mutates local files. GET/HEAD support
//! ranged reads, entity tags and zero-copy transfer; POST/PUT route the
//! request body into the file; DELETE unlinks.

use std::cell::{Cell, RefCell};
use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use log::debug;

use crate::http::htre::Htre;
use crate::http::range::parse_range;
use crate::http::svr::{Cli, Htts};
use crate::http::task::{
    bind_task, halt_participating_devices, mark_over, Task, TaskCore, OVER_READ_FROM_PEER,
    OVER_WRITE_TO_PEER,
};
use crate::http::{merge_paths, mime, status, Method};
use crate::sys;
use crate::timer::{new_tmridx, TmrIdx, TMRIDX_INVALID};

/// Never answer `Expect: 100-continue` with an interim response.
pub const FILE_NO_100_CONTINUE: u32 = 1 << 0;
/// Reject methods that would create, overwrite or delete files.
pub const FILE_READ_ONLY: u32 = 1 << 1;
/// Serve a generated listing for directories without an index file.
pub const FILE_LIST_DIR: u32 = 1 << 2;

/// Where a directory-listing fragment goes in the generated document.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DirFmtPhase {
    Header,
    Entry,
    Footer,
}

/// Formats one piece of a directory listing into the temporary file
/// backing the response. `name` is the entry name during
/// [`DirFmtPhase::Entry`].
pub type DirFmt = Box<dyn Fn(&mut dyn io::Write, &str, DirFmtPhase, Option<&str>) -> io::Result<()>>;

/// Upper bound for one sendfile request.
const SENDFILE_SPAN: u64 = 0x7FFF_0000;
/// Read size of the buffered fallback path.
const PEER_BUF: usize = 8192;

struct FileTask {
    core: TaskCore,
    options: u32,
    peer: Cell<RawFd>,
    sendfile_ok: bool,
    // Signed so an empty file yields an end offset of -1.
    total_size: Cell<i64>,
    start_offset: Cell<i64>,
    end_offset: Cell<i64>,
    cur_offset: Cell<i64>,
    etag: RefCell<String>,
    etag_match: Cell<bool>,
    /// Timer slot for retrying a read that came back EAGAIN/EINTR.
    peer_tmridx: TmrIdx,
}

impl FileTask {
    fn close_peer(&self) {
        if self.peer_tmridx.get() != TMRIDX_INVALID {
            if let Some(htts) = self.core.htts() {
                if let Some(hio) = htts.hio() {
                    hio.del_tmrjob(&self.peer_tmridx);
                }
            }
        }
        let fd = self.peer.replace(-1);
        if fd >= 0 {
            sys::close_fd(fd);
        }
    }

    fn write_to_peer(&self, data: &[u8]) -> io::Result<()> {
        if self.core.method == Method::Get || self.peer.get() < 0 {
            return Ok(());
        }
        let mut pos = 0;
        while pos < data.len() {
            let n = sys::cvt(unsafe {
                libc::write(
                    self.peer.get(),
                    data[pos..].as_ptr() as *const libc::c_void,
                    data.len() - pos,
                )
            })?;
            pos += n as usize;
        }
        Ok(())
    }

    /// Pushes the next span of the file toward the client: one sendfile
    /// request, or one buffered read, per invocation. Rescheduled by the
    /// write acknowledgements until the range is exhausted.
    fn send_contents_to_client(self: &Rc<Self>) -> io::Result<()> {
        if self.cur_offset.get() > self.end_offset.get() {
            let task: Rc<dyn Task> = self.clone();
            mark_over(&task, OVER_READ_FROM_PEER);
            return Ok(());
        }
        let lim = (self.end_offset.get() - self.cur_offset.get() + 1) as u64;
        if self.sendfile_ok {
            let span = lim.min(SENDFILE_SPAN);
            self.core.addresbody_from_file(
                self.peer.get(),
                self.cur_offset.get() as u64,
                span as usize,
            )?;
            self.cur_offset.set(self.cur_offset.get() + span as i64);
        } else {
            let mut buf = [0u8; PEER_BUF];
            let want = (lim as usize).min(PEER_BUF);
            let res = sys::cvt(unsafe {
                libc::pread(
                    self.peer.get(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    want,
                    self.cur_offset.get() as libc::off_t,
                )
            });
            match res {
                Ok(0) => {
                    // The file shrank while open.
                    let task: Rc<dyn Task> = self.clone();
                    mark_over(&task, OVER_READ_FROM_PEER);
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "file truncated while being served",
                    ));
                }
                Ok(n) => {
                    self.core.write_to_client(&buf[..n as usize])?;
                    self.cur_offset.set(self.cur_offset.get() + n as i64);
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) =>
                {
                    // Try again off a zero-delay timer.
                    if self.peer_tmridx.get() == TMRIDX_INVALID {
                        let htts = self
                            .core
                            .htts()
                            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "service gone"))?;
                        let hio = htts
                            .hio()
                            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "loop gone"))?;
                        let weak = Rc::downgrade(self);
                        hio.sched_tmrjob_after(
                            std::time::Duration::ZERO,
                            &self.peer_tmridx,
                            Box::new(move |_hio, _now| {
                                if let Some(file) = weak.upgrade() {
                                    if file.send_contents_to_client().is_err() {
                                        let task: Rc<dyn Task> = file.clone();
                                        halt_participating_devices(&task);
                                    }
                                }
                            }),
                        )?;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn send_header_to_client(&self, mime_type: Option<&str>) -> io::Result<()> {
        let content_length = self.end_offset.get() - self.start_offset.get() + 1;
        let status_code = if content_length != self.total_size.get() {
            status::PARTIAL_CONTENT
        } else {
            status::OK
        };
        self.core.startreshdr(status_code, None, false)?;
        self.core.addreshdr("Accept-Ranges", "bytes")?;
        if let Some(mt) = mime_type.filter(|mt| !mt.is_empty()) {
            self.core.addreshdr("Content-Type", mt)?;
        }
        if !self.etag.borrow().is_empty() {
            self.core.addreshdr("ETag", &self.etag.borrow())?;
        }
        if status_code == status::PARTIAL_CONTENT {
            self.core.addreshdr(
                "Content-Ranges",
                &format!(
                    "bytes {}-{}/{}",
                    self.start_offset.get(),
                    self.end_offset.get(),
                    self.total_size.get()
                ),
            )?;
        }
        self.core.addreshdr("Access-Control-Allow-Origin", "*")?;
        self.core
            .addreshdr("Content-Length", &content_length.to_string())?;
        self.core.endreshdr()
    }

    /// Stat the open file, compute the entity tag, and honor
    /// `If-None-Match` and `Range`. A `Some` return is the error status
    /// to send instead of content.
    fn process_range_header(&self, req: &Htre) -> Option<u16> {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if sys::cvt(unsafe { libc::fstat(self.peer.get(), &mut st) }).is_err() {
            return Some(errno_to_status(io::Error::last_os_error()));
        }
        if st.st_mode & libc::S_IFMT != libc::S_IFREG {
            return Some(status::FORBIDDEN);
        }

        if self.core.method == Method::Get || self.core.method == Method::Head {
            let etag = format!(
                "{:x}-{:x}-{:x}-{:x}-{:x}",
                st.st_mtime, st.st_mtime_nsec, st.st_size, st.st_ino, st.st_dev
            );
            if let Some(inm) = req.header("If-None-Match") {
                if inm == etag {
                    self.etag_match.set(true);
                }
            }
            *self.etag.borrow_mut() = etag;
        }

        let size = st.st_size as u64;
        match req.header("Range") {
            Some(r) => {
                let span = parse_range(r).ok().and_then(|rg| rg.resolve(size));
                match span {
                    Some((from, to)) => {
                        self.start_offset.set(from as i64);
                        self.end_offset.set(to as i64);
                    }
                    None => return Some(status::RANGE_NOT_SATISFIABLE),
                }
            }
            None => {
                self.start_offset.set(0);
                self.end_offset.set(size as i64 - 1);
            }
        }
        self.cur_offset.set(self.start_offset.get());
        self.total_size.set(size as i64);
        None
    }

    /// Opens the target for reading. Directories fall back to their index
    /// file or, with `FILE_LIST_DIR`, to a generated listing in an
    /// unlinked temporary file.
    fn open_peer_for_read(
        &self,
        actual_file: &str,
        qpath: &str,
        dir_fmt: Option<&DirFmt>,
    ) -> Result<String, u16> {
        let fd = open_nonblock(actual_file, libc::O_RDONLY)
            .map_err(errno_to_status)?;
        self.peer.set(fd);

        let mut opened = actual_file.to_string();
        if is_dir(fd) {
            let index_file = merge_paths(actual_file, "index.html");
            match open_nonblock(&index_file, libc::O_RDONLY) {
                Ok(alt) => {
                    sys::close_fd(self.peer.replace(alt));
                    opened = index_file;
                }
                Err(_) if self.options & FILE_LIST_DIR != 0 => {
                    let alt = make_dir_listing(actual_file, qpath, dir_fmt)
                        .map_err(errno_to_status)?;
                    sys::close_fd(self.peer.replace(alt));
                    // Listings are synthesized HTML-ish text; don't let
                    // the directory path pick a type.
                    opened = String::new();
                }
                Err(_) => return Err(status::FORBIDDEN),
            }
        }
        Ok(opened)
    }
}

impl Task for FileTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn halt_peer(&self) {
        // The peer is a plain file descriptor, not a device; dropping the
        // cork matters for the keep-alive path.
        if let Some(csck) = self.core.csck() {
            csck.set_tcp_cork(false);
        }
        self.close_peer();
    }

    fn on_client_body(&self, data: &[u8]) -> io::Result<()> {
        self.write_to_peer(data)
    }

    fn on_client_req_end(self: Rc<Self>, eof: bool) -> io::Result<()> {
        let task: Rc<dyn Task> = self.clone();
        mark_over(&task, OVER_WRITE_TO_PEER);
        if !eof && self.core.method != Method::Get && self.core.method != Method::Head {
            self.core.sendfinalres(status::OK, None, None, false)?;
        }
        Ok(())
    }

    fn on_client_write_ack(self: Rc<Self>) -> io::Result<()> {
        if self.core.method == Method::Get && !self.core.is_over(OVER_READ_FROM_PEER) {
            self.send_contents_to_client()
        } else {
            Ok(())
        }
    }
}

impl Drop for FileTask {
    fn drop(&mut self) {
        let fd = self.peer.replace(-1);
        if fd >= 0 {
            sys::close_fd(fd);
        }
    }
}

impl Htts {
    /// Serves the request from the local filesystem under `docroot`.
    #[allow(clippy::too_many_arguments)]
    pub fn dofile(
        self: &Rc<Self>,
        cli: &Rc<Cli>,
        req: &Htre,
        docroot: &str,
        filepath: &str,
        mime_type: Option<&str>,
        options: u32,
        dir_fmt: Option<DirFmt>,
    ) -> io::Result<()> {
        let actual_file = merge_paths(docroot, filepath);
        debug!(
            "file task for client {}: [{}] {}",
            cli.addr_str(),
            req.qmethod_name(),
            actual_file
        );

        if cli.task().is_some() {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "duplicate task request prohibited",
            ));
        }
        let file = Rc::new(FileTask {
            core: TaskCore::new(self, cli, req),
            options,
            peer: Cell::new(-1),
            sendfile_ok: cli.sck().sendfileok(),
            total_size: Cell::new(0),
            start_offset: Cell::new(0),
            end_offset: Cell::new(0),
            cur_offset: Cell::new(0),
            etag: RefCell::new(String::new()),
            etag_match: Cell::new(false),
            peer_tmridx: new_tmridx(),
        });
        let task: Rc<dyn Task> = file.clone();

        let r = (|| -> io::Result<()> {
            bind_task(self, cli, &task)?;
            file.core
                .handle_expect100(options & FILE_NO_100_CONTINUE != 0)?;

            let qpath = file.core.qpath.clone();
            let mut done_status: Option<u16> = None;
            match file.core.method {
                Method::Get | Method::Head => {
                    match file.open_peer_for_read(&actual_file, &qpath, dir_fmt.as_ref()) {
                        Err(status) => done_status = Some(status),
                        Ok(opened) => {
                            if let Some(status) = file.process_range_header(req) {
                                done_status = Some(status);
                            } else if file.etag_match.get() {
                                done_status = Some(status::NOT_MODIFIED);
                            } else {
                                let actual_mime = mime_type.or_else(|| mime::by_path(&opened));
                                let _ = unsafe {
                                    libc::posix_fadvise(
                                        file.peer.get(),
                                        file.start_offset.get() as libc::off_t,
                                        (file.end_offset.get() - file.start_offset.get() + 1)
                                            as libc::off_t,
                                        libc::POSIX_FADV_SEQUENTIAL,
                                    )
                                };
                                cli.sck().set_tcp_cork(true);
                                file.send_header_to_client(actual_mime)?;
                                if file.core.method == Method::Get {
                                    file.send_contents_to_client()?;
                                } else {
                                    mark_over(&task, OVER_READ_FROM_PEER);
                                }
                            }
                        }
                    }
                }
                Method::Post | Method::Put => {
                    if options & FILE_READ_ONLY != 0 {
                        done_status = Some(status::METHOD_NOT_ALLOWED);
                    } else {
                        match open_nonblock(
                            &actual_file,
                            libc::O_WRONLY | libc::O_TRUNC | libc::O_CREAT,
                        ) {
                            Ok(fd) => {
                                file.peer.set(fd);
                                // No bytes ever come back from the file.
                                mark_over(&task, OVER_READ_FROM_PEER);
                            }
                            Err(e) => done_status = Some(errno_to_status(e)),
                        }
                    }
                }
                Method::Delete => {
                    if options & FILE_READ_ONLY != 0 {
                        done_status = Some(status::METHOD_NOT_ALLOWED);
                    } else {
                        done_status = Some(delete_path(&actual_file));
                    }
                }
                _ => done_status = Some(status::METHOD_NOT_ALLOWED),
            }

            if let Some(status) = done_status {
                file.core.sendfinalres(status, None, None, false)?;
                mark_over(&task, OVER_READ_FROM_PEER | OVER_WRITE_TO_PEER);
            }
            Ok(())
        })();

        if let Err(e) = r {
            debug!("file task setup failed: {}", e);
            halt_participating_devices(&task);
            return Err(e);
        }
        Ok(())
    }
}

fn open_nonblock(path: &str, flags: libc::c_int) -> io::Result<RawFd> {
    let cpath = CString::new(path)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
    let fd = sys::cvt(unsafe {
        libc::open(
            cpath.as_ptr(),
            flags | libc::O_NONBLOCK | libc::O_CLOEXEC | libc::O_LARGEFILE,
            0o644,
        )
    })?;
    Ok(fd)
}

fn is_dir(fd: RawFd) -> bool {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    unsafe { libc::fstat(fd, &mut st) == 0 && st.st_mode & libc::S_IFMT == libc::S_IFDIR }
}

fn delete_path(path: &str) -> u16 {
    match std::fs::remove_file(path) {
        Ok(()) => status::OK,
        Err(e) if e.raw_os_error() == Some(libc::EISDIR) => match std::fs::remove_dir(path) {
            Ok(()) => status::OK,
            Err(e) => errno_to_status(e),
        },
        Err(e) => errno_to_status(e),
    }
}

/// Generates a directory listing into an unlinked temporary file and
/// returns its descriptor, positioned at the start.
fn make_dir_listing(dir: &str, qpath: &str, dir_fmt: Option<&DirFmt>) -> io::Result<RawFd> {
    use std::io::{Seek, SeekFrom, Write};
    use std::os::unix::io::{FromRawFd, IntoRawFd};

    let template = CString::new("/tmp/.hiofileXXXXXX").unwrap();
    let raw = template.into_raw();
    let fd = unsafe {
        let fd = libc::mkstemp(raw);
        let template = CString::from_raw(raw);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        libc::unlink(template.as_ptr());
        fd
    };

    let mut out = unsafe { std::fs::File::from_raw_fd(fd) };
    let result = (|| -> io::Result<()> {
        match dir_fmt {
            Some(fmt) => {
                fmt(&mut out, qpath, DirFmtPhase::Header, None)?;
                for entry in std::fs::read_dir(dir)? {
                    let entry = entry?;
                    let name = entry.file_name();
                    let name = name.to_string_lossy();
                    if name == "." {
                        continue;
                    }
                    fmt(&mut out, qpath, DirFmtPhase::Entry, Some(&name))?;
                }
                fmt(&mut out, qpath, DirFmtPhase::Footer, None)?;
            }
            None => {
                for entry in std::fs::read_dir(dir)? {
                    let entry = entry?;
                    let name = entry.file_name();
                    let name = name.to_string_lossy();
                    if name == "." {
                        continue;
                    }
                    out.write_all(name.as_bytes())?;
                    out.write_all(b"\n")?;
                }
            }
        }
        out.seek(SeekFrom::Start(0))?;
        Ok(())
    })();
    match result {
        Ok(()) => Ok(out.into_raw_fd()),
        Err(e) => Err(e),
    }
}

fn errno_to_status(e: io::Error) -> u16 {
    match e.raw_os_error() {
        Some(libc::ENOENT) => status::NOT_FOUND,
        Some(libc::EPERM) | Some(libc::EACCES) => status::FORBIDDEN,
        _ => status::INTERNAL_SERVER_ERROR,
    }
}
