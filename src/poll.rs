use std::os::unix::io::RawFd;
use std::time::Duration;
use std::{fmt, io};

use log::trace;

use crate::sys::{Selector, SysEvents};
use crate::{Interest, Token};

/// Polls for readiness events on all registered handles.
///
/// A handle is registered with a [`Token`] and an [`Interest`] mask; each
/// call to [`poll`] blocks until at least one registered handle is ready or
/// the timeout elapses, and fills the supplied [`Events`] batch.
///
/// Registration is level-triggered: once a readiness event has been
/// received, the corresponding operation should be performed until it
/// returns [`WouldBlock`], or the event will simply be delivered again.
///
/// [`poll`]: Poll::poll
/// [`WouldBlock`]: std::io::ErrorKind::WouldBlock
pub struct Poll {
    selector: Selector,
}

/// A batch of readiness events as returned by [`Poll::poll`].
pub struct Events {
    sys: SysEvents,
}

/// A single readiness event.
#[derive(Copy, Clone)]
pub struct Event {
    token: Token,
    readable: bool,
    writable: bool,
}

impl Poll {
    pub fn new() -> io::Result<Poll> {
        Ok(Poll {
            selector: Selector::new()?,
        })
    }

    /// Wait for readiness events, blocking for at most `timeout` (forever
    /// when `None`).
    ///
    /// An interrupted wait is retried transparently with the timeout
    /// shortened by the time already spent.
    pub fn poll(&self, events: &mut Events, mut timeout: Option<Duration>) -> io::Result<usize> {
        loop {
            let now = std::time::Instant::now();
            match self.selector.select(&mut events.sys, timeout) {
                Ok(()) => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                    if let Some(to) = timeout {
                        let elapsed = now.elapsed();
                        if elapsed >= to {
                            break;
                        }
                        timeout = Some(to - elapsed);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(events.sys.len())
    }

    pub fn register(&self, fd: RawFd, token: Token, interests: Interest) -> io::Result<()> {
        trace!("registering fd {} with {:?} as {:?}", fd, interests, token);
        self.selector.register(fd, token, interests)
    }

    pub fn reregister(&self, fd: RawFd, token: Token, interests: Interest) -> io::Result<()> {
        trace!("reregistering fd {} with {:?}", fd, interests);
        self.selector.reregister(fd, token, interests)
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        trace!("deregistering fd {}", fd);
        self.selector.deregister(fd)
    }
}

impl fmt::Debug for Poll {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Poll").finish()
    }
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Events {
        Events {
            sys: SysEvents::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.sys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sys.len() == 0
    }

    pub fn get(&self, idx: usize) -> Option<Event> {
        self.sys.get(idx).map(|ev| Event {
            token: ev.token(),
            readable: ev.is_readable(),
            writable: ev.is_writable(),
        })
    }
}

impl Event {
    pub fn token(&self) -> Token {
        self.token
    }

    pub fn is_readable(&self) -> bool {
        self.readable
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Event")
            .field("token", &self.token)
            .field("readable", &self.readable)
            .field("writable", &self.writable)
            .finish()
    }
}
