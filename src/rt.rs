use std::cell::{Cell, RefCell};
use std::io;
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::dev::Dev;
use crate::poll::{Events, Poll};
use crate::svc::Svc;
use crate::timer::{after, TmrHandler, TmrHeap, TmrIdx, TmrJob, TMRIDX_INVALID};
use crate::util::Slab;
use crate::Token;

/// Why [`Hio::run`] returned.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// `stop` was called.
    Demand,
    /// An unrecoverable poller failure.
    Fatal,
}

/// Size of the shared read scratch buffer. One read syscall per readiness
/// event lands here before the bytes are handed to `on_read`.
const RDBUF_CAPA: usize = 65536;

/// The event loop.
///
/// A single-threaded cooperative scheduler owning a set of devices, a timer
/// heap and a service registry. Each tick polls the multiplexer with a
/// timeout equal to the earliest timer deadline, dispatches I/O events (one
/// device callback per event), fires due timers, and finalizes devices
/// halted during the tick.
///
/// All callbacks run on the loop's thread and must not block; long-running
/// work belongs in a worker thread exposed as a thread device.
pub struct Hio {
    poll: Poll,
    events: RefCell<Events>,
    devs: RefCell<Slab<Rc<dyn Dev>>>,
    tmr: RefCell<TmrHeap>,
    /// Devices halted during the current tick, finalized at tick end so
    /// callbacks holding a device within the tick never observe a corpse.
    zombies: RefCell<Vec<Rc<dyn Dev>>>,
    svcs: RefCell<Vec<Rc<dyn Svc>>>,
    stopreq: Cell<Option<StopReason>>,
    pub(crate) rdbuf: RefCell<Vec<u8>>,
}

impl Hio {
    /// Creates a loop able to harvest up to `capacity` events per tick.
    pub fn open(capacity: usize) -> io::Result<Rc<Hio>> {
        Ok(Rc::new(Hio {
            poll: Poll::new()?,
            events: RefCell::new(Events::with_capacity(capacity)),
            devs: RefCell::new(Slab::new()),
            tmr: RefCell::new(TmrHeap::new()),
            zombies: RefCell::new(Vec::new()),
            svcs: RefCell::new(Vec::new()),
            stopreq: Cell::new(None),
            rdbuf: RefCell::new(vec![0u8; RDBUF_CAPA]),
        }))
    }

    pub fn now(&self) -> Instant {
        Instant::now()
    }

    pub(crate) fn poller(&self) -> &Poll {
        &self.poll
    }

    /// Requests loop termination after the current tick.
    pub fn stop(&self, reason: StopReason) {
        self.stopreq.set(Some(reason));
    }

    /// Runs ticks until stopped.
    pub fn run(self: &Rc<Self>) -> io::Result<StopReason> {
        self.stopreq.set(None);
        loop {
            if let Some(reason) = self.stopreq.get() {
                return Ok(reason);
            }
            if let Err(e) = self.run_once(None) {
                self.stop(StopReason::Fatal);
                return Err(e);
            }
        }
    }

    /// Executes a single tick. `max_wait` caps the poll timeout on top of
    /// the timer-derived deadline; tests use it to bound a tick.
    pub fn run_once(self: &Rc<Self>, max_wait: Option<Duration>) -> io::Result<usize> {
        let now = self.now();

        let mut timeout = max_wait;
        if !self.zombies.borrow().is_empty() {
            // Halted devices await finalization; don't sleep on them.
            timeout = Some(Duration::ZERO);
        } else if let Some(deadline) = self.tmr.borrow().next_deadline() {
            let until = deadline.saturating_duration_since(now);
            timeout = Some(match timeout {
                Some(cap) if cap < until => cap,
                _ => until,
            });
        }

        let nevs = {
            let mut events = self.events.borrow_mut();
            let n = self.poll.poll(&mut events, timeout)?;
            trace!("tick: {} events", n);
            n
        };

        for i in 0..nevs {
            let ev = match self.events.borrow().get(i) {
                Some(ev) => ev,
                None => break,
            };
            let dev = self.devs.borrow().get(ev.token().0).cloned();
            let dev = match dev {
                Some(dev) => dev,
                None => continue,
            };
            if ev.is_readable() && !dev.core().is_halted() {
                dev.clone().dispatch_readable();
            }
            if ev.is_writable() && !dev.core().is_halted() {
                dev.clone().dispatch_writable();
            }
        }

        self.fire_due_timers();
        self.reap_zombies();
        Ok(nevs)
    }

    fn fire_due_timers(self: &Rc<Self>) {
        let now = self.now();
        let due = self.tmr.borrow_mut().take_due(now);
        for job in due {
            (job.handler)(self, now);
        }
    }

    fn reap_zombies(self: &Rc<Self>) {
        // Finalizers may halt further devices; keep draining.
        loop {
            let batch: Vec<_> = self.zombies.borrow_mut().drain(..).collect();
            if batch.is_empty() {
                break;
            }
            for dev in batch {
                let token = dev.core().token();
                dev.finalize();
                self.devs.borrow_mut().remove(token.0);
            }
        }
    }

    /// Makes a device visible to the loop and starts watching it.
    pub(crate) fn install_dev(self: &Rc<Self>, dev: Rc<dyn Dev>) -> io::Result<Token> {
        let token = Token(self.devs.borrow_mut().insert(dev.clone()));
        dev.core().set_token(token);
        if let Err(e) = dev.core().update_watch() {
            self.devs.borrow_mut().remove(token.0);
            return Err(e);
        }
        debug!("installed device as {:?}", token);
        Ok(token)
    }

    /// Marks a device as to-be-killed; actual finalization happens at the
    /// end of the current tick (or at the start of the next one).
    pub(crate) fn halt_dev(self: &Rc<Self>, dev: Rc<dyn Dev>) {
        if !dev.core().mark_halted() {
            return;
        }
        debug!("halting device {:?}", dev.core().token());
        dev.core().cancel_timers(self);
        dev.core().unwatch();
        self.zombies.borrow_mut().push(dev);
    }

    /// Finalizes a device immediately. Only legal while the device has not
    /// yet produced any events, i.e. right after a failed setup.
    pub(crate) fn kill_dev(self: &Rc<Self>, dev: Rc<dyn Dev>) {
        if !dev.core().mark_halted() {
            return;
        }
        dev.core().cancel_timers(self);
        dev.core().unwatch();
        let token = dev.core().token();
        dev.finalize();
        if token.0 != crate::dev::TOKEN_INVALID {
            self.devs.borrow_mut().remove(token.0);
        }
    }

    /// Schedules a timer job firing at the absolute instant `when`. The
    /// owner's `idx` slot tracks the job's heap position until it fires or
    /// is cancelled.
    pub fn sched_tmrjob_at(
        &self,
        when: Instant,
        idx: &TmrIdx,
        handler: TmrHandler,
    ) -> io::Result<()> {
        if idx.get() != TMRIDX_INVALID {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "timer slot already scheduled",
            ));
        }
        self.tmr.borrow_mut().insert(TmrJob {
            when,
            handler,
            idx: idx.clone(),
        });
        Ok(())
    }

    /// Schedules a timer job firing `delay` from now.
    pub fn sched_tmrjob_after(
        &self,
        delay: Duration,
        idx: &TmrIdx,
        handler: TmrHandler,
    ) -> io::Result<()> {
        self.sched_tmrjob_at(after(self.now(), delay), idx, handler)
    }

    /// Cancels the job tracked by `idx`, if scheduled.
    pub fn del_tmrjob(&self, idx: &TmrIdx) -> bool {
        self.tmr.borrow_mut().cancel(idx)
    }

    /// Number of timer jobs currently scheduled.
    pub fn ntmrjobs(&self) -> usize {
        self.tmr.borrow().len()
    }

    /// Adds a service to the active list. Services are stopped in reverse
    /// order on [`close`](Hio::close).
    pub fn register_svc(&self, svc: Rc<dyn Svc>) {
        self.svcs.borrow_mut().push(svc);
    }

    pub fn unregister_svc(&self, svc: &Rc<dyn Svc>) {
        self.svcs
            .borrow_mut()
            .retain(|s| !Rc::ptr_eq(s, svc));
    }

    /// Stops every service (reverse start order), then finalizes every
    /// remaining device.
    pub fn close(self: &Rc<Self>) {
        loop {
            let svc = self.svcs.borrow_mut().pop();
            match svc {
                Some(svc) => svc.svc_stop(),
                None => break,
            }
        }
        let devs: Vec<_> = self.devs.borrow().iter().map(|(_, d)| d.clone()).collect();
        for dev in devs {
            self.halt_dev(dev);
        }
        self.reap_zombies();
    }
}
