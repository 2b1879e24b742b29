//! A minimal, single-threaded, priority-ordered event reactor for Linux.
//!
//! `sluice-io` drives callback-based [`EventSource`]s off one edge-triggered
//! epoll instance. Sources carry a priority; when several descriptors become
//! ready together, the loop services them highest-priority first, breaking
//! ties by arrival order, and re-polls between entries so urgent work can
//! overtake a queued backlog. A companion [`RingBuffer`] provides the
//! scatter-gather byte queue that proxy-style programs built on the loop
//! tend to need.
//!
//! # Architecture
//!
//! - [`EventLoop`] — the reactor. Owns the poll instance, the attached
//!   sources and the priority-ordered pending batch. Strictly one thread.
//! - [`EventSource`] — a readiness producer: a caller-populated descriptor
//!   set, a periodic timer, an OS signal, or always-ready idle work. Its
//!   callback returns `true` to stay armed, `false` to be removed.
//! - [`SourceFd`] — one registered descriptor: interest mask, accumulated
//!   readiness, optional per-descriptor payload. The framework registers
//!   and deregisters descriptors but never closes them.
//! - [`LoopHandle`] / [`Waker`] — non-owning control handles; the first for
//!   callbacks on the loop thread, the second for stopping the loop from
//!   any other thread (or a signal handler).
//! - [`RingBuffer`] — fixed-capacity FIFO exposing its readable and
//!   writable regions as at most two slices for vectored I/O.
//!
//! All registration is edge-triggered: a callback must consume until
//! `WouldBlock` and then clear the relevant readiness flags with
//! [`SourceFd::clear_ready`], or the loop will keep re-dispatching the
//! descriptor.
//!
//! # Quick start
//!
//! ```no_run
//! use sluice_io::{EventLoop, EventSource};
//!
//! fn main() -> sluice_io::Result<()> {
//!     let event_loop = EventLoop::new()?;
//!     let handle = event_loop.handle();
//!
//!     let mut ticks = 0;
//!     let timer = EventSource::timeout(1_000, move || {
//!         ticks += 1;
//!         println!("tick {ticks}");
//!         if ticks == 3 {
//!             handle.quit();
//!         }
//!         true
//!     })?;
//!     event_loop.add_source(&timer);
//!
//!     event_loop.run()
//! }
//! ```

pub mod error;
pub mod event;
pub mod reactor;
pub mod ring_buffer;
pub mod source;
pub mod sys;

pub use error::{Error, Result};
pub use event::Ready;
pub use reactor::{EventLoop, LoopHandle, Waker};
pub use ring_buffer::RingBuffer;
pub use source::{EventSource, SourceFd};

/// One-line import for the common surface.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::event::Ready;
    pub use crate::reactor::{EventLoop, LoopHandle, Waker};
    pub use crate::ring_buffer::RingBuffer;
    pub use crate::source::{EventSource, SourceFd};
}
