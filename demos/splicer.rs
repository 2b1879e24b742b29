//! TCP splicer: accepts a client, opens a nonblocking connection to a
//! target, and relays bytes both ways through a pair of ring buffers. Each
//! session owns one descriptor-set source holding both ends.
//!
//! Run with `RUST_LOG=info cargo run --example splicer [listen-addr] [target-addr]`.

use std::cell::{Cell, RefCell};
use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::rc::Rc;

use mio::net::{TcpListener, TcpStream};
use sluice_io::{sys, EventLoop, EventSource, LoopHandle, Ready, RingBuffer, SourceFd};

const CLIENT_IN: u8 = 1 << 3;
const CLIENT_OUT: u8 = 1 << 2;
const REMOTE_IN: u8 = 1 << 1;
const REMOTE_OUT: u8 = 1 << 0;

struct Session {
    source: EventSource,
    client: TcpStream,
    remote: TcpStream,
    client_fd: SourceFd,
    remote_fd: SourceFd,
    /// Client bytes awaiting the remote.
    forward: RefCell<RingBuffer>,
    /// Remote bytes awaiting the client.
    backward: RefCell<RingBuffer>,
    /// Sticky direction flags, surviving across dispatches so a transfer
    /// stalled on one end resumes when the other end progresses.
    flags: Cell<u8>,
    idle: Cell<bool>,
}

type SessionList = Rc<RefCell<Vec<Rc<Session>>>>;

fn read_into(mut stream: &TcpStream, ring: &mut RingBuffer) -> io::Result<Option<usize>> {
    if ring.is_full() {
        return Ok(None);
    }
    let (a, b) = ring.writing_view();
    let mut iovs = [IoSliceMut::new(a), IoSliceMut::new(b)];
    let n = stream.read_vectored(&mut iovs)?;
    ring.write_finish(n);
    Ok(Some(n))
}

fn write_from(mut stream: &TcpStream, ring: &mut RingBuffer) -> io::Result<Option<usize>> {
    if ring.is_empty() {
        return Ok(None);
    }
    let (a, b) = ring.reading_view();
    let iovs = [IoSlice::new(a), IoSlice::new(b)];
    let n = stream.write_vectored(&iovs)?;
    ring.read_finish(n);
    Ok(Some(n))
}

fn unlink_session(sessions: &SessionList, session: &Rc<Session>) {
    log::info!(
        "session ({}, {}) closed",
        session.client_fd.raw_fd(),
        session.remote_fd.raw_fd()
    );
    session.client_fd.set_data(None);
    session.remote_fd.set_data(None);
    sessions.borrow_mut().retain(|s| !Rc::ptr_eq(s, session));
}

/// Relay step for either end of a session. Returns `false` to have the loop
/// tear the whole session source down.
fn session_handler(sessions: &SessionList, sfd: &SourceFd) -> bool {
    let Some(data) = sfd.data() else { return true };
    let Ok(session) = data.downcast::<Session>() else {
        return true;
    };

    if sfd.ready().intersects(Ready::ERROR | Ready::HANGUP) {
        unlink_session(sessions, &session);
        return false;
    }

    let is_client = *sfd == session.client_fd;
    let mut flags = session.flags.get();
    if sfd.ready().is_readable() {
        flags |= if is_client { CLIENT_IN } else { REMOTE_IN };
    }
    if sfd.ready().is_writable() {
        flags |= if is_client { CLIENT_OUT } else { REMOTE_OUT };
    }

    let mut dead = false;

    if flags & CLIENT_OUT != 0 {
        match write_from(&session.client, &mut session.backward.borrow_mut()) {
            Ok(Some(_)) => {}
            Ok(None) => session.client_fd.clear_ready(Ready::WRITABLE),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                flags &= !CLIENT_OUT;
                session.client_fd.clear_ready(Ready::WRITABLE);
            }
            Err(_) => dead = true,
        }
    }

    if !dead && flags & REMOTE_OUT != 0 {
        match write_from(&session.remote, &mut session.forward.borrow_mut()) {
            Ok(Some(_)) => {}
            Ok(None) => session.remote_fd.clear_ready(Ready::WRITABLE),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                flags &= !REMOTE_OUT;
                session.remote_fd.clear_ready(Ready::WRITABLE);
            }
            Err(_) => dead = true,
        }
    }

    if !dead && flags & CLIENT_IN != 0 {
        match read_into(&session.client, &mut session.forward.borrow_mut()) {
            Ok(Some(0)) => dead = true,
            Ok(Some(_)) => {}
            Ok(None) => session.client_fd.clear_ready(Ready::READABLE),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                flags &= !CLIENT_IN;
                session.client_fd.clear_ready(Ready::READABLE);
            }
            Err(_) => dead = true,
        }
    }

    if !dead && flags & REMOTE_IN != 0 {
        match read_into(&session.remote, &mut session.backward.borrow_mut()) {
            Ok(Some(0)) => dead = true,
            Ok(Some(_)) => {}
            Ok(None) => session.remote_fd.clear_ready(Ready::READABLE),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                flags &= !REMOTE_IN;
                session.remote_fd.clear_ready(Ready::READABLE);
            }
            Err(_) => dead = true,
        }
    }

    if dead {
        unlink_session(sessions, &session);
        return false;
    }

    session.flags.set(flags);
    session.idle.set(false);
    true
}

fn start_session(
    handle: &LoopHandle,
    sessions: &SessionList,
    client: TcpStream,
    target: SocketAddr,
) -> anyhow::Result<()> {
    let list = Rc::clone(sessions);
    let source = EventSource::fds(move |sfd| session_handler(&list, sfd));

    let remote = TcpStream::connect(target)?;
    let client_fd = source.add_fd(client.as_raw_fd(), Ready::READABLE | Ready::WRITABLE)?;
    let remote_fd = source.add_fd(remote.as_raw_fd(), Ready::READABLE | Ready::WRITABLE)?;

    let session = Rc::new(Session {
        source: source.clone(),
        client,
        remote,
        client_fd: client_fd.clone(),
        remote_fd: remote_fd.clone(),
        forward: RefCell::new(RingBuffer::new(2000)),
        backward: RefCell::new(RingBuffer::new(2000)),
        flags: Cell::new(0),
        idle: Cell::new(false),
    });
    client_fd.set_data(Some(session.clone()));
    remote_fd.set_data(Some(session.clone()));

    if !handle.add_source(&source) {
        session.client_fd.set_data(None);
        session.remote_fd.set_data(None);
        anyhow::bail!("failed to attach session source");
    }
    sessions.borrow_mut().push(session);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let listen: SocketAddr = args
        .next()
        .unwrap_or_else(|| "0.0.0.0:8000".into())
        .parse()?;
    let target: SocketAddr = args
        .next()
        .unwrap_or_else(|| "127.0.0.1:22".into())
        .parse()?;

    sys::block_signal(libc::SIGINT)?;
    sys::block_signal(libc::SIGPIPE)?;

    let listener = TcpListener::bind(listen)?;
    log::info!("splicing {} -> {}", listen, target);

    let event_loop = EventLoop::new()?;
    let handle = event_loop.handle();
    let sessions: SessionList = Rc::new(RefCell::new(Vec::new()));

    let accept_handle = handle.clone();
    let list = Rc::clone(&sessions);
    let listener_fd = listener.as_raw_fd();
    let listener_source = EventSource::fds(move |sfd| {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = start_session(&accept_handle, &list, stream, target) {
                    log::warn!("failed to start session for {}: {}", peer, e);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                sfd.clear_ready(Ready::READABLE);
            }
            Err(e) => log::warn!("accept failed: {}", e),
        }
        true
    });
    listener_source.set_priority(2);
    listener_source.add_fd(listener_fd, Ready::READABLE)?;
    event_loop.add_source(&listener_source);

    let sweep_handle = handle.clone();
    let list = Rc::clone(&sessions);
    let sweep = EventSource::timeout(10_000, move || {
        list.borrow_mut().retain(|session| {
            if session.idle.get() {
                log::info!(
                    "dropping idle session ({}, {})",
                    session.client_fd.raw_fd(),
                    session.remote_fd.raw_fd()
                );
                sweep_handle.del_source(&session.source);
                session.client_fd.set_data(None);
                session.remote_fd.set_data(None);
                false
            } else {
                session.idle.set(true);
                true
            }
        });
        true
    })?;
    sweep.set_priority(-1);
    event_loop.add_source(&sweep);

    let stop = handle.clone();
    let sigint = EventSource::signal(libc::SIGINT, move || {
        log::info!("quitting");
        stop.quit();
        true
    })?;
    sigint.set_priority(3);
    event_loop.add_source(&sigint);

    let sigpipe = EventSource::signal(libc::SIGPIPE, || true)?;
    event_loop.add_source(&sigpipe);

    event_loop.run()?;

    for session in sessions.borrow_mut().drain(..) {
        session.client_fd.set_data(None);
        session.remote_fd.set_data(None);
    }
    Ok(())
}
