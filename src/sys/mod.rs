//! Raw OS plumbing. Everything that talks to the kernel directly lives
//! under here; the rest of the crate goes through these wrappers.

#[cfg(unix)]
pub(crate) mod unix;

#[cfg(unix)]
pub(crate) use unix::{
    close_fd, cvt, pipe_pair, set_cloexec, set_nonblock, Selector, SysEvent, SysEvents,
};
