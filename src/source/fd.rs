use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};

use mio::Token;

use crate::event::Ready;
use crate::source::{EventSource, SourceInner};

/// One native descriptor bound to an [`EventSource`].
///
/// The handle is reference-counted: the owning source's set holds one
/// reference, and the loop's pending batch holds one more for every turn the
/// descriptor spends in it. That transient reference is what keeps the entry
/// alive when its source is deleted mid-batch.
///
/// The framework never closes the underlying descriptor; it only registers
/// and deregisters it with the polling instance. Closing is the caller's job.
#[derive(Clone)]
pub struct SourceFd {
    pub(crate) inner: Rc<FdInner>,
}

pub(crate) struct FdInner {
    fd: RawFd,
    interest: Cell<Ready>,
    ready: Cell<Ready>,
    pub(crate) token: Cell<Option<Token>>,
    source: RefCell<Weak<SourceInner>>,
    data: RefCell<Option<Rc<dyn Any>>>,
}

impl SourceFd {
    pub(crate) fn new(source: &Rc<SourceInner>, fd: RawFd, interest: Ready) -> Self {
        Self {
            inner: Rc::new(FdInner {
                fd,
                interest: Cell::new(interest),
                ready: Cell::new(Ready::EMPTY),
                token: Cell::new(None),
                source: RefCell::new(Rc::downgrade(source)),
                data: RefCell::new(None),
            }),
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.inner.fd
    }

    /// The readiness kinds this descriptor was registered for.
    pub fn interest(&self) -> Ready {
        self.inner.interest.get()
    }

    /// Readiness observed since the flags were last cleared.
    pub fn ready(&self) -> Ready {
        self.inner.ready.get()
    }

    /// Clears observed readiness flags. Callbacks use this to mark an
    /// edge-triggered condition as exhausted (e.g. after a `WouldBlock`
    /// read) so the loop stops redelivering the descriptor until the kernel
    /// reports a new edge.
    pub fn clear_ready(&self, flags: Ready) {
        self.inner.ready.set(self.inner.ready.get().remove(flags));
    }

    pub(crate) fn merge_ready(&self, flags: Ready) {
        self.inner.ready.set(self.inner.ready.get() | flags);
    }

    pub(crate) fn reset_ready(&self) {
        self.inner.ready.set(Ready::EMPTY);
    }

    /// The source that owns this descriptor, if it is still attached.
    pub fn source(&self) -> Option<EventSource> {
        self.inner
            .source
            .borrow()
            .upgrade()
            .map(|inner| EventSource { inner })
    }

    pub(crate) fn has_source(&self) -> bool {
        self.inner.source.borrow().strong_count() > 0
    }

    pub(crate) fn detach(&self) {
        *self.inner.source.borrow_mut() = Weak::new();
        self.reset_ready();
    }

    /// Attaches an opaque payload, letting one multi-descriptor source
    /// demultiplex per-descriptor state inside its callback.
    pub fn set_data(&self, data: Option<Rc<dyn Any>>) {
        *self.inner.data.borrow_mut() = data;
    }

    pub fn data(&self) -> Option<Rc<dyn Any>> {
        self.inner.data.borrow().clone()
    }
}

impl PartialEq for SourceFd {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for SourceFd {}

impl fmt::Debug for SourceFd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceFd")
            .field("fd", &self.inner.fd)
            .field("interest", &self.interest())
            .field("ready", &self.ready())
            .finish()
    }
}
