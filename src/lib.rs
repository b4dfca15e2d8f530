//! A single-threaded readiness-driven I/O runtime with an embeddable
//! HTTP/1.x server.
//!
//! The core multiplexes sockets, child processes, worker threads and timers
//! atop one event loop ([`Hio`]). Devices wrap OS handles with a pending
//! write queue, timed reads and writes, per-direction half-close and
//! scatter/gather output; callbacks deliver I/O completions on the loop's
//! thread. The [`http`] module layers the HTTP server service on top,
//! serving local files, CGI scripts, FastCGI upstreams, worker threads and
//! synthesized responses.
//!
//! # Example
//!
//! ```no_run
//! use hio::{Hio, StopReason};
//! use std::time::Duration;
//!
//! let hio = Hio::open(256).unwrap();
//! let idx = hio::new_tmridx();
//! hio.sched_tmrjob_after(
//!     Duration::from_millis(10),
//!     &idx,
//!     Box::new(|hio, _now| hio.stop(StopReason::Demand)),
//! )
//! .unwrap();
//! hio.run().unwrap();
//! ```
#![cfg(unix)]

mod dev;
mod interest;
mod poll;
mod rt;
mod skad;
mod svc;
mod sys;
mod timer;
mod token;
mod util;

pub mod http;
pub mod pro;
pub mod sck;
pub mod thr;

pub use interest::Interest;
pub use poll::{Event, Events, Poll};
pub use rt::{Hio, StopReason};
pub use skad::{SkAd, AF_QX};
pub use svc::Svc;
pub use timer::{new_tmridx, TmrIdx, TMRIDX_INVALID};
pub use token::Token;
