use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use std::{cmp, io};

use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP};

use super::cvt;
use crate::{Interest, Token};

/// Thin wrapper over the host readiness notifier.
///
/// Watched handles carry an `(IN, OUT)` interest mask and come back as a
/// batch of ready events per call to [`select`]. Registration is
/// level-triggered: a handle stays ready until the condition is drained.
///
/// [`select`]: Selector::select
#[derive(Debug)]
pub(crate) struct Selector {
    epfd: RawFd,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        let epfd = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        Ok(Selector { epfd })
    }

    /// Wait for events from the OS, for at most `timeout`.
    pub fn select(&self, evts: &mut SysEvents, timeout: Option<Duration>) -> io::Result<()> {
        let timeout_ms = timeout
            .map(|to| cmp::min(millis(to), i32::MAX as u64) as i32)
            .unwrap_or(-1);

        evts.events.clear();
        let cnt = cvt(unsafe {
            libc::epoll_wait(
                self.epfd,
                evts.events.as_mut_ptr(),
                evts.events.capacity() as i32,
                timeout_ms,
            )
        })?;
        unsafe { evts.events.set_len(cnt as usize) };
        Ok(())
    }

    pub fn register(&self, fd: RawFd, token: Token, interests: Interest) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: interests_to_epoll(interests),
            u64: usize::from(token) as u64,
        };
        cvt(unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut ev) })?;
        Ok(())
    }

    pub fn reregister(&self, fd: RawFd, token: Token, interests: Interest) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: interests_to_epoll(interests),
            u64: usize::from(token) as u64,
        };
        cvt(unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut ev) })?;
        Ok(())
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        // The event argument is ignored on deletion but very old kernels
        // required it to be non-null.
        let mut ev = libc::epoll_event { events: 0, u64: 0 };
        cvt(unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut ev) })?;
        Ok(())
    }
}

fn interests_to_epoll(interests: Interest) -> u32 {
    let mut kind = EPOLLRDHUP;
    if interests.is_readable() {
        kind |= EPOLLIN;
    }
    if interests.is_writable() {
        kind |= EPOLLOUT;
    }
    kind as u32
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        super::close_fd(self.epfd);
    }
}

/// One readiness notification. Error and hang-up conditions are folded into
/// readable|writable so every condition surfaces through an I/O attempt.
#[derive(Copy, Clone)]
pub(crate) struct SysEvent(libc::epoll_event);

impl SysEvent {
    pub fn token(&self) -> Token {
        Token(self.0.u64 as usize)
    }

    pub fn is_readable(&self) -> bool {
        let e = self.0.events as libc::c_int;
        (e & EPOLLIN) != 0 || (e & EPOLLRDHUP) != 0 || (e & EPOLLHUP) != 0 || (e & EPOLLERR) != 0
    }

    pub fn is_writable(&self) -> bool {
        let e = self.0.events as libc::c_int;
        (e & EPOLLOUT) != 0 || (e & EPOLLERR) != 0
    }
}

pub(crate) struct SysEvents {
    events: Vec<libc::epoll_event>,
}

impl SysEvents {
    pub fn with_capacity(capacity: usize) -> SysEvents {
        SysEvents {
            events: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn get(&self, idx: usize) -> Option<SysEvent> {
        self.events.get(idx).map(|raw| SysEvent(*raw))
    }
}

const NANOS_PER_MILLI: u32 = 1_000_000;
const MILLIS_PER_SEC: u64 = 1_000;

/// Convert a `Duration` to milliseconds, rounding up and saturating at
/// `u64::MAX`.
fn millis(duration: Duration) -> u64 {
    let millis = (duration.subsec_nanos() + NANOS_PER_MILLI - 1) / NANOS_PER_MILLI;
    duration
        .as_secs()
        .saturating_mul(MILLIS_PER_SEC)
        .saturating_add(millis as u64)
}
