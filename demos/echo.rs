//! TCP echo server: one shared descriptor-set source for every connection,
//! with per-connection state hung off the descriptor, a periodic two-strike
//! idle sweep, and SIGINT-driven shutdown.
//!
//! Run with `RUST_LOG=info cargo run --example echo [listen-addr]`.

use std::cell::{Cell, RefCell};
use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::rc::Rc;

use mio::net::{TcpListener, TcpStream};
use sluice_io::{sys, EventLoop, EventSource, Ready, RingBuffer, SourceFd};

struct Client {
    stream: TcpStream,
    sfd: SourceFd,
    buffer: RefCell<RingBuffer>,
    idle: Cell<bool>,
}

type ClientList = Rc<RefCell<Vec<Rc<Client>>>>;

/// Receives into the ring's free region with one vectored read. `None`
/// means the ring had no room, so nothing was attempted.
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

/// Sends from the ring's occupied region with one vectored write. `None`
/// means the ring was empty.
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

fn drop_client(clients: &ClientList, client: &Rc<Client>) {
    log::info!("client {} left", client.sfd.raw_fd());
    if let Some(source) = client.sfd.source() {
        source.del_fd(client.sfd.raw_fd());
    }
    // The payload link is the last cycle member; clearing it lets the
    // stream drop and close once the list entry goes.
    client.sfd.set_data(None);
    clients.borrow_mut().retain(|c| !Rc::ptr_eq(c, client));
}

fn client_handler(clients: &ClientList, sfd: &SourceFd) {
    let Some(data) = sfd.data() else { return };
    let Ok(client) = data.downcast::<Client>() else {
        return;
    };

    let mut failed = false;
    let mut try_write = false;
    {
        let mut ring = client.buffer.borrow_mut();
        if sfd.ready().is_readable() {
            match read_into(&client.stream, &mut ring) {
                Ok(Some(0)) => failed = true,
                Ok(_) => try_write = true,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    sfd.clear_ready(Ready::READABLE);
                    try_write = true;
                }
                Err(_) => failed = true,
            }
        }
        if !failed && (sfd.ready().is_writable() || try_write) {
            match write_from(&client.stream, &mut ring) {
                Ok(Some(_)) => {}
                Ok(None) => sfd.clear_ready(Ready::WRITABLE),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(_) => failed = true,
            }
        }
    }

    if failed || sfd.ready().intersects(Ready::ERROR | Ready::HANGUP) {
        drop_client(clients, &client);
    } else {
        client.idle.set(false);
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "0.0.0.0:8000".into())
        .parse()?;

    sys::block_signal(libc::SIGINT)?;
    sys::block_signal(libc::SIGPIPE)?;

    let listener = TcpListener::bind(addr)?;
    log::info!("listening on {}", addr);

    let event_loop = EventLoop::new()?;
    let handle = event_loop.handle();
    let clients: ClientList = Rc::new(RefCell::new(Vec::new()));

    let list = Rc::clone(&clients);
    let client_source = EventSource::fds(move |sfd| {
        client_handler(&list, sfd);
        true
    });
    event_loop.add_source(&client_source);

    // One accept per dispatch; the listener entry stays queued until accept
    // reports WouldBlock, so bursts drain without starving other sources.
    let list = Rc::clone(&clients);
    let conns = client_source.clone();
    let listener_fd = listener.as_raw_fd();
    let listener_source = EventSource::fds(move |sfd| {
        match listener.accept() {
            Ok((stream, peer)) => {
                match conns.add_fd(stream.as_raw_fd(), Ready::READABLE | Ready::WRITABLE) {
                    Ok(csfd) => {
                        log::info!("new client {} from {}", csfd.raw_fd(), peer);
                        let client = Rc::new(Client {
                            stream,
                            sfd: csfd.clone(),
                            buffer: RefCell::new(RingBuffer::new(1024)),
                            idle: Cell::new(false),
                        });
                        csfd.set_data(Some(client.clone()));
                        list.borrow_mut().push(client);
                    }
                    Err(e) => log::warn!("failed to register client: {}", e),
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

    // Two-strike sweep: a client silent across two consecutive periods is
    // dropped.
    let list = Rc::clone(&clients);
    let sweep = EventSource::timeout(30_000, move || {
        list.borrow_mut().retain(|client| {
            if client.idle.get() {
                log::info!("dropping idle client {}", client.sfd.raw_fd());
                if let Some(source) = client.sfd.source() {
                    source.del_fd(client.sfd.raw_fd());
                }
                client.sfd.set_data(None);
                false
            } else {
                client.idle.set(true);
                true
            }
        });
        true
    })?;
    sweep.set_priority(1);
    event_loop.add_source(&sweep);

    let stop = handle.clone();
    let sigint = EventSource::signal(libc::SIGINT, move || {
        log::info!("quitting");
        stop.quit();
        true
    })?;
    sigint.set_priority(3);
    event_loop.add_source(&sigint);

    // Swallow SIGPIPE so writes to a closed peer surface as EPIPE instead.
    let sigpipe = EventSource::signal(libc::SIGPIPE, || true)?;
    event_loop.add_source(&sigpipe);

    event_loop.run()?;

    for client in clients.borrow_mut().drain(..) {
        client.sfd.set_data(None);
    }
    Ok(())
}
