//! Socket jobs: the unit of work the multiplexer services.

use mio::event::Source;
use mio::Interest;

/// What the poll reported for a socket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

impl Readiness {
    pub(crate) fn from_event(event: &mio::event::Event) -> Self {
        Self {
            readable: event.is_readable() || event.is_read_closed(),
            writable: event.is_writable() || event.is_write_closed(),
            error: event.is_error(),
        }
    }

    pub(crate) fn merge(&mut self, other: Self) {
        self.readable |= other.readable;
        self.writable |= other.writable;
        self.error |= other.error;
    }

    pub fn is_empty(&self) -> bool {
        !(self.readable || self.writable || self.error)
    }
}

/// A socket plus the callback that services it.
///
/// The multiplexer owns jobs exclusively.  [`run`](SocketJob::run) consumes
/// the job and returns what should stay registered for the socket: the same
/// job, a replacement (for example a connected stream replacing a pending
/// connect), or `None` to remove the socket.
///
/// Jobs run on the multiplexer thread and must not call back into the
/// multiplexer; they communicate by adding events to the event queue.
pub trait SocketJob: Send {
    fn source(&mut self) -> &mut dyn Source;

    /// Readiness to wait for.  `None` parks the job without polling it.
    fn interest(&self) -> Option<Interest>;

    fn run(self: Box<Self>, ready: Readiness) -> Option<Box<dyn SocketJob>>;
}

/// Outcome of a [`CallbackJob`] invocation.
pub enum JobAction {
    Keep,
    SetInterest(Option<Interest>),
    Replace(Box<dyn SocketJob>),
    Remove,
}

type JobCallback<S> = Box<dyn FnMut(&mut S, Readiness) -> JobAction + Send>;

/// A job built from a source and a closure.
pub struct CallbackJob<S> {
    source: S,
    interest: Option<Interest>,
    callback: JobCallback<S>,
}

impl<S> CallbackJob<S>
where
    S: Source + Send + 'static,
{
    pub fn new<F>(source: S, interest: Interest, callback: F) -> Box<Self>
    where
        F: FnMut(&mut S, Readiness) -> JobAction + Send + 'static,
    {
        Box::new(Self {
            source,
            interest: Some(interest),
            callback: Box::new(callback),
        })
    }
}

impl<S> SocketJob for CallbackJob<S>
where
    S: Source + Send + 'static,
{
    fn source(&mut self) -> &mut dyn Source {
        &mut self.source
    }

    fn interest(&self) -> Option<Interest> {
        self.interest
    }

    fn run(mut self: Box<Self>, ready: Readiness) -> Option<Box<dyn SocketJob>> {
        let this = &mut *self;
        match (this.callback)(&mut this.source, ready) {
            JobAction::Keep => Some(self),
            JobAction::SetInterest(interest) => {
                self.interest = interest;
                Some(self)
            }
            JobAction::Replace(job) => Some(job),
            JobAction::Remove => None,
        }
    }
}
