//! The event loop: an edge-triggered, single-threaded reactor that drives
//! [`EventSource`]s in priority order.
//!
//! One turn of the loop waits for kernel readiness (blocking only while no
//! work is queued), folds the new events into a priority-ordered pending
//! batch, then services exactly one batch entry before polling again. That
//! one-entry cadence keeps freshly arrived high-priority work ahead of an
//! older low-priority backlog.
//!
//! The loop itself is not `Send`; cross-thread coordination goes through
//! [`Waker`], which is backed by an eventfd the loop owns an internal source
//! for.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;

use mio::unix::SourceFd as MioSourceFd;
use mio::{Events, Poll, Registry, Token};

use crate::error::Result;
use crate::event::Ready;
use crate::source::{EventSource, SourceFd};
use crate::sys::EventFd;

const EVENTS_CAPACITY: usize = 256;

struct PendingFd {
    fd: SourceFd,
    /// Captured when the entry is queued; a later `set_priority` does not
    /// reorder work already in the batch.
    priority: i32,
}

pub(crate) struct LoopInner {
    poll: RefCell<Poll>,
    registry: Registry,
    running: Cell<bool>,
    sources: RefCell<Vec<EventSource>>,
    pending: RefCell<VecDeque<PendingFd>>,
    tokens: RefCell<HashMap<Token, SourceFd>>,
    next_token: Cell<usize>,
    wake_fd: Arc<EventFd>,
}

impl LoopInner {
    pub(crate) fn register_fd(&self, fd: &SourceFd) -> Result<()> {
        let interest = fd
            .interest()
            .to_interest()
            .ok_or(crate::Error::InvalidInterest)?;
        let token = Token(self.next_token.get());
        self.next_token.set(self.next_token.get().wrapping_add(1));
        let raw = fd.raw_fd();
        self.registry.register(&mut MioSourceFd(&raw), token, interest)?;
        fd.inner.token.set(Some(token));
        self.tokens.borrow_mut().insert(token, fd.clone());
        Ok(())
    }

    pub(crate) fn deregister_fd(&self, fd: &SourceFd) -> Result<()> {
        let Some(token) = fd.inner.token.take() else {
            return Ok(());
        };
        self.tokens.borrow_mut().remove(&token);
        let raw = fd.raw_fd();
        self.registry.deregister(&mut MioSourceFd(&raw))?;
        Ok(())
    }

    fn attach(this: &Rc<Self>, source: &EventSource) -> Result<bool> {
        if source.owner().is_some() {
            return Ok(false);
        }
        source.set_owner(Rc::downgrade(this));
        let fds = source.fds_snapshot();
        for (done, sfd) in fds.iter().enumerate() {
            if let Err(e) = this.register_fd(sfd) {
                for sfd in &fds[..done] {
                    let _ = this.deregister_fd(sfd);
                }
                source.clear_owner();
                return Err(e);
            }
        }
        this.sources.borrow_mut().push(source.clone());
        source.prepare();
        Ok(true)
    }

    fn add_source(this: &Rc<Self>, source: &EventSource) -> bool {
        match Self::attach(this, source) {
            Ok(added) => added,
            Err(e) => {
                log::warn!("failed to attach source: {}", e);
                false
            }
        }
    }

    /// Detaches `source`. Its descriptors leave the kernel instance at once;
    /// any batch entries it still has are dropped when they reach the head.
    fn del_source(this: &Rc<Self>, source: &EventSource) -> bool {
        if !source.attached_to(this) {
            return false;
        }
        for sfd in source.fds_snapshot() {
            if let Err(e) = this.deregister_fd(&sfd) {
                log::warn!("failed to deregister fd {}: {}", sfd.raw_fd(), e);
            }
            sfd.reset_ready();
        }
        source.clear_owner();
        let mut sources = this.sources.borrow_mut();
        if let Some(pos) = sources.iter().position(|s| s == source) {
            sources.remove(pos);
        }
        true
    }

    fn stop(&self) {
        self.running.set(false);
        // Nudge the poll in case the requester is not the loop thread.
        if let Err(e) = self.wake_fd.write(1) {
            log::warn!("failed to wake event loop: {}", e);
        }
    }

    /// Queues `fd` behind every entry of greater or equal priority, so equal
    /// priorities are serviced in arrival order.
    fn push_pending(&self, fd: &SourceFd) {
        let priority = fd.source().map_or(0, |s| s.priority());
        let mut pending = self.pending.borrow_mut();
        let pos = pending
            .iter()
            .position(|p| priority > p.priority)
            .unwrap_or(pending.len());
        pending.insert(
            pos,
            PendingFd {
                fd: fd.clone(),
                priority,
            },
        );
    }

    /// Services the head of the pending batch: validate, check, dispatch,
    /// then either re-arm the source or evict the entry. At most one entry
    /// is touched per call.
    ///
    /// The head is cloned out before any hook runs, so a callback deleting
    /// descriptors or whole sources (its own included) cannot invalidate
    /// what this frame is holding.
    fn dispatch_pending(this: &Rc<Self>) {
        let head = {
            let pending = this.pending.borrow();
            match pending.front() {
                Some(entry) => entry.fd.clone(),
                None => return,
            }
        };

        if let Some(source) = head.source() {
            if source.attached_to(this) && source.check(&head) {
                let keep = source.dispatch(&head);
                // The callback may have detached the descriptor or the
                // source; only a still-live pairing gets acted on.
                if head.has_source() && source.attached_to(this) {
                    if keep {
                        source.prepare();
                    } else {
                        Self::del_source(this, &source);
                    }
                }
            }
        }

        let evict = match head.source() {
            None => true,
            Some(source) => {
                !source.attached_to(this) || !head.ready().intersects(head.interest())
            }
        };
        if evict {
            let mut pending = this.pending.borrow_mut();
            if let Some(pos) = pending.iter().position(|p| p.fd == head) {
                pending.remove(pos);
            }
            drop(pending);
            head.reset_ready();
        }
    }

    fn turn(this: &Rc<Self>, events: &mut Events) -> Result<()> {
        let timeout = if this.pending.borrow().is_empty() {
            None
        } else {
            Some(Duration::ZERO)
        };
        match this.poll.borrow_mut().poll(events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => {
                log::error!("event loop poll failed: {}", e);
                return Err(e.into());
            }
        }
        for event in events.iter() {
            let fd = this.tokens.borrow().get(&event.token()).cloned();
            if let Some(fd) = fd {
                let was_idle = fd.ready().is_empty();
                fd.merge_ready(Ready::from(event));
                // Already-queued descriptors just accumulate readiness.
                if was_idle && !fd.ready().is_empty() {
                    this.push_pending(&fd);
                }
            }
        }
        Self::dispatch_pending(this);
        Ok(())
    }
}

impl Drop for LoopInner {
    fn drop(&mut self) {
        for source in self.sources.borrow().iter() {
            for sfd in source.fds_snapshot() {
                sfd.inner.token.set(None);
                sfd.reset_ready();
            }
            source.clear_owner();
        }
    }
}

/// A single-threaded, priority-ordered reactor.
///
/// Attached sources are serviced in descending priority within each batch,
/// with ties broken by arrival order. The loop owns strong references to its
/// sources; dropping the loop detaches everything.
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

impl EventLoop {
    pub fn new() -> Result<EventLoop> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let wake_fd = Arc::new(EventFd::new()?);
        let inner = Rc::new(LoopInner {
            poll: RefCell::new(poll),
            registry,
            running: Cell::new(false),
            sources: RefCell::new(Vec::new()),
            pending: RefCell::new(VecDeque::new()),
            tokens: RefCell::new(HashMap::new()),
            next_token: Cell::new(0),
            wake_fd: Arc::clone(&wake_fd),
        });

        // Internal stop source: outranks all user work so a requested stop
        // is honored before the rest of the batch.
        let weak = Rc::downgrade(&inner);
        let stop = EventSource::wakeup(wake_fd, move || {
            if let Some(inner) = weak.upgrade() {
                inner.running.set(false);
            }
            true
        })?;
        LoopInner::attach(&inner, &stop)?;

        Ok(EventLoop { inner })
    }

    /// Runs until [`quit`](Self::quit), a [`Waker`], or a [`LoopHandle`]
    /// stops the loop. Blocks only while no dispatchable work is queued.
    /// Returns an error only when waiting on the kernel itself fails.
    pub fn run(&self) -> Result<()> {
        self.inner.running.set(true);
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        while self.inner.running.get() {
            LoopInner::turn(&self.inner, &mut events)?;
        }
        Ok(())
    }

    /// Stops the loop after the current batch entry finishes. Safe to call
    /// from within a callback; for other threads use a [`Waker`].
    pub fn quit(&self) {
        self.inner.stop();
    }

    /// Attaches `source`, registering its descriptors edge-triggered and
    /// arming variant state. Returns `false` when the source is already
    /// attached to a loop or registration fails (the failure is logged and
    /// the source is left fully detached).
    pub fn add_source(&self, source: &EventSource) -> bool {
        LoopInner::add_source(&self.inner, source)
    }

    /// Detaches `source` from this loop. Returns `false` when the source is
    /// not attached here. Safe to call from a callback, even mid-batch: the
    /// source's queued work is discarded instead of dispatched.
    pub fn del_source(&self, source: &EventSource) -> bool {
        LoopInner::del_source(&self.inner, source)
    }

    /// A cheap, cloneable handle callbacks can own without keeping the loop
    /// alive. All its operations no-op once the loop is gone.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// A thread-safe stop handle for this loop.
    pub fn waker(&self) -> Waker {
        Waker {
            fd: Arc::clone(&self.inner.wake_fd),
        }
    }
}

/// Non-owning, same-thread handle to an [`EventLoop`], meant to be captured
/// by source callbacks.
#[derive(Clone)]
pub struct LoopHandle {
    inner: Weak<LoopInner>,
}

impl LoopHandle {
    pub fn add_source(&self, source: &EventSource) -> bool {
        self.inner
            .upgrade()
            .map_or(false, |inner| LoopInner::add_source(&inner, source))
    }

    pub fn del_source(&self, source: &EventSource) -> bool {
        self.inner
            .upgrade()
            .map_or(false, |inner| LoopInner::del_source(&inner, source))
    }

    pub fn quit(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.stop();
        }
    }
}

/// Requests a running [`EventLoop`] to stop, from any thread.
///
/// Backed by an eventfd the loop polls; `wake` is a single descriptor write,
/// so it is safe from signal handlers as well.
#[derive(Clone)]
pub struct Waker {
    fd: Arc<EventFd>,
}

impl Waker {
    pub fn wake(&self) -> Result<()> {
        self.fd.write(1)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys;
    use std::io::{IoSliceMut, Read, Write};
    use std::os::fd::{AsRawFd, RawFd};
    use std::thread;
    use std::time::{Duration, Instant};

    use crate::ring_buffer::RingBuffer;

    fn counting_source(
        prio: i32,
        log: Rc<RefCell<Vec<&'static str>>>,
        label: &'static str,
        on_done: impl Fn() + 'static,
    ) -> (EventSource, Rc<EventFd>) {
        let efd = Rc::new(EventFd::new().unwrap());
        let raw = efd.as_raw_fd();
        let drain = Rc::clone(&efd);
        let source = EventSource::fds(move |sfd| {
            let _ = drain.read();
            sfd.clear_ready(Ready::READABLE);
            log.borrow_mut().push(label);
            on_done();
            true
        });
        source.set_priority(prio);
        source.add_fd(raw, Ready::READABLE).unwrap();
        (source, efd)
    }

    #[test]
    fn add_and_del_are_idempotent() {
        let el = EventLoop::new().unwrap();
        let source = EventSource::idle(|| true).unwrap();
        assert!(el.add_source(&source));
        assert!(!el.add_source(&source));
        assert!(el.del_source(&source));
        assert!(!el.del_source(&source));
    }

    #[test]
    fn a_source_belongs_to_at_most_one_loop() {
        let first = EventLoop::new().unwrap();
        let second = EventLoop::new().unwrap();
        let source = EventSource::idle(|| true).unwrap();
        assert!(first.add_source(&source));
        assert!(!second.add_source(&source));
        assert!(!second.del_source(&source));
        assert!(first.del_source(&source));
        assert!(second.add_source(&source));
    }

    #[test]
    fn pending_batch_orders_by_priority_with_stable_ties() {
        let el = EventLoop::new().unwrap();
        let mk = |prio: i32, fd: RawFd| {
            let s = EventSource::fds(|_| true);
            s.set_priority(prio);
            let sfd = s.add_fd(fd, Ready::READABLE).unwrap();
            (s, sfd)
        };
        let (_a, fa) = mk(0, 10);
        let (_b, fb) = mk(0, 11);
        let (_c, fc) = mk(5, 12);
        let (_d, fd) = mk(-3, 13);
        el.inner.push_pending(&fa);
        el.inner.push_pending(&fb);
        el.inner.push_pending(&fc);
        el.inner.push_pending(&fd);
        let order: Vec<RawFd> = el
            .inner
            .pending
            .borrow()
            .iter()
            .map(|p| p.fd.raw_fd())
            .collect();
        assert_eq!(order, vec![12, 10, 11, 13]);
    }

    #[test]
    fn batch_is_serviced_in_descending_priority() {
        let el = EventLoop::new().unwrap();
        let handle = el.handle();
        let log = Rc::new(RefCell::new(Vec::new()));
        let remaining = Rc::new(Cell::new(3usize));

        let mut keep = Vec::new();
        for (prio, label) in [(-5, "lo"), (5, "hi"), (0, "mid")] {
            let handle = handle.clone();
            let remaining = Rc::clone(&remaining);
            let (source, efd) = counting_source(prio, Rc::clone(&log), label, move || {
                remaining.set(remaining.get() - 1);
                if remaining.get() == 0 {
                    handle.quit();
                }
            });
            assert!(el.add_source(&source));
            efd.write(1).unwrap();
            keep.push((source, efd));
        }

        el.run().unwrap();
        assert_eq!(*log.borrow(), vec!["hi", "mid", "lo"]);
    }

    #[test]
    fn idle_work_runs_after_ready_descriptors() {
        let el = EventLoop::new().unwrap();
        let handle = el.handle();
        let log = Rc::new(RefCell::new(Vec::new()));

        let (fd_source, efd) = counting_source(0, Rc::clone(&log), "fd", || {});
        assert!(el.add_source(&fd_source));
        efd.write(1).unwrap();

        let idle_log = Rc::clone(&log);
        let idle = EventSource::idle(move || {
            idle_log.borrow_mut().push("idle");
            handle.quit();
            false
        })
        .unwrap();
        assert!(el.add_source(&idle));

        el.run().unwrap();
        assert_eq!(*log.borrow(), vec!["fd", "idle"]);
    }

    #[test]
    fn timer_fires_until_its_callback_declines() {
        let el = EventLoop::new().unwrap();
        let count = Rc::new(Cell::new(0u32));

        let fired = Rc::clone(&count);
        let timer = EventSource::timeout(20, move || {
            fired.set(fired.get() + 1);
            fired.get() < 3
        })
        .unwrap();
        assert!(el.add_source(&timer));

        let waker = el.waker();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            waker.wake().unwrap();
        });

        let start = Instant::now();
        el.run().unwrap();
        stopper.join().unwrap();

        assert_eq!(count.get(), 3);
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn blocked_signal_reaches_its_source() {
        sys::block_signal(libc::SIGUSR1).unwrap();

        let el = EventLoop::new().unwrap();
        let handle = el.handle();
        let caught = Rc::new(Cell::new(0u32));
        let idle_runs = Rc::new(Cell::new(0u32));

        let hits = Rc::clone(&caught);
        let sig = EventSource::signal(libc::SIGUSR1, move || {
            hits.set(hits.get() + 1);
            handle.quit();
            false
        })
        .unwrap();
        sig.set_priority(3);
        assert!(el.add_source(&sig));

        let idles = Rc::clone(&idle_runs);
        let idle = EventSource::idle(move || {
            idles.set(idles.get() + 1);
            true
        })
        .unwrap();
        assert!(el.add_source(&idle));

        unsafe { libc::raise(libc::SIGUSR1) };
        el.run().unwrap();

        assert_eq!(caught.get(), 1);
        // Stop lands before the lower-priority batch entries are reached.
        assert_eq!(idle_runs.get(), 0);
    }

    #[test]
    fn deleting_a_source_mid_batch_discards_its_queued_work() {
        let el = EventLoop::new().unwrap();
        let handle = el.handle();
        let log = Rc::new(RefCell::new(Vec::new()));
        let b_runs = Rc::new(Cell::new(0u32));

        let runs = Rc::clone(&b_runs);
        let (b, b_efd) = counting_source(0, Rc::clone(&log), "b", move || {
            runs.set(runs.get() + 1);
        });

        let victim = b.clone();
        let a_handle = handle.clone();
        let (a, a_efd) = counting_source(1, Rc::clone(&log), "a", move || {
            a_handle.del_source(&victim);
        });

        // Lowest priority, so it runs only once the real entries (b's
        // discarded one included) have left the batch.
        let idle = EventSource::idle(move || {
            handle.quit();
            false
        })
        .unwrap();

        assert!(el.add_source(&a));
        assert!(el.add_source(&b));
        assert!(el.add_source(&idle));
        a_efd.write(1).unwrap();
        b_efd.write(1).unwrap();

        el.run().unwrap();
        assert_eq!(*log.borrow(), vec!["a"]);
        assert_eq!(b_runs.get(), 0);
    }

    #[test]
    fn two_strike_sweep_removes_a_silent_source_on_the_second_pass() {
        let el = EventLoop::new().unwrap();
        let handle = el.handle();

        // A session that never produces traffic.
        let session = EventSource::fds(|_| true);
        assert!(el.add_source(&session));

        let sweeps = Rc::new(Cell::new(0u32));
        let removed_at = Rc::new(Cell::new(0u32));
        let idle = Rc::new(Cell::new(false));

        let victim = session.clone();
        let pass = Rc::clone(&sweeps);
        let removed = Rc::clone(&removed_at);
        let marked = Rc::clone(&idle);
        let sweep = EventSource::timeout(40, move || {
            pass.set(pass.get() + 1);
            if marked.get() {
                if handle.del_source(&victim) {
                    removed.set(pass.get());
                }
                handle.quit();
                false
            } else {
                marked.set(true);
                true
            }
        })
        .unwrap();
        assert!(el.add_source(&sweep));

        el.run().unwrap();
        // Marked on the first pass, removed on the second.
        assert_eq!(removed_at.get(), 2);
        assert!(!el.del_source(&session));
    }

    #[test]
    fn a_callback_may_delete_its_own_source() {
        let el = EventLoop::new().unwrap();
        let handle = el.handle();
        let runs = Rc::new(Cell::new(0u32));

        let idle = Rc::new(RefCell::new(None::<EventSource>));
        let slot = Rc::clone(&idle);
        let count = Rc::clone(&runs);
        let source = EventSource::idle(move || {
            count.set(count.get() + 1);
            if let Some(me) = slot.borrow().as_ref() {
                handle.del_source(me);
            }
            handle.quit();
            true
        })
        .unwrap();
        *idle.borrow_mut() = Some(source.clone());

        assert!(el.add_source(&source));
        el.run().unwrap();
        assert_eq!(runs.get(), 1);
        assert!(el.add_source(&source));
    }

    fn ring_read(mut stream: &mio::net::TcpStream, ring: &mut RingBuffer) -> io::Result<usize> {
        let (a, b) = ring.writing_view();
        let mut iovs = [IoSliceMut::new(a), IoSliceMut::new(b)];
        let n = stream.read_vectored(&mut iovs)?;
        ring.write_finish(n);
        Ok(n)
    }

    fn ring_write(mut stream: &mio::net::TcpStream, ring: &mut RingBuffer) -> io::Result<usize> {
        let (a, _) = ring.reading_view();
        if a.is_empty() {
            return Ok(0);
        }
        let n = stream.write(a)?;
        ring.read_finish(n);
        Ok(n)
    }

    #[test]
    fn echo_round_trip_through_a_ring_buffer() {
        let listener = mio::net::TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        let el = EventLoop::new().unwrap();
        let handle = el.handle();

        let conn = Rc::new(RefCell::new(None::<mio::net::TcpStream>));
        let ring = Rc::new(RefCell::new(RingBuffer::new(64)));
        let echoed = Rc::new(Cell::new(0usize));

        let conn_slot = Rc::clone(&conn);
        let conn_source = EventSource::fds(move |sfd| {
            let slot = conn_slot.borrow();
            let Some(stream) = slot.as_ref() else {
                return true;
            };
            let mut ring = ring.borrow_mut();
            if sfd.ready().is_readable() {
                loop {
                    match ring_read(stream, &mut ring) {
                        Ok(0) => break,
                        Ok(_) => {}
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            sfd.clear_ready(Ready::READABLE);
                            break;
                        }
                        Err(_) => break,
                    }
                }
            }
            loop {
                match ring_write(stream, &mut ring) {
                    Ok(0) => break,
                    Ok(n) => echoed.set(echoed.get() + n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        sfd.clear_ready(Ready::WRITABLE);
                        break;
                    }
                    Err(_) => break,
                }
            }
            if echoed.get() >= 4 {
                handle.quit();
            }
            true
        });
        assert!(el.add_source(&conn_source));

        let accept_slot = Rc::clone(&conn);
        let accept_into = conn_source.clone();
        let listen_raw = listener.as_raw_fd();
        let listen_source = EventSource::fds(move |sfd| {
            loop {
                match listener.accept() {
                    Ok((stream, _)) => {
                        let raw = stream.as_raw_fd();
                        *accept_slot.borrow_mut() = Some(stream);
                        accept_into
                            .add_fd(raw, Ready::READABLE | Ready::WRITABLE)
                            .unwrap();
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        sfd.clear_ready(Ready::READABLE);
                        break;
                    }
                    Err(_) => break,
                }
            }
            true
        });
        listen_source.set_priority(1);
        listen_source.add_fd(listen_raw, Ready::READABLE).unwrap();
        assert!(el.add_source(&listen_source));

        let client = thread::spawn(move || {
            let mut stream = std::net::TcpStream::connect(addr).unwrap();
            stream.write_all(b"ping").unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).unwrap();
            buf
        });

        el.run().unwrap();
        assert_eq!(&client.join().unwrap(), b"ping");
    }
}
