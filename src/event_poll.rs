//! poll based multiplexor backend (portable Unix).
//!
//! The kernel keeps no per-handle state, so registration hooks are no-ops;
//! instead a pollfd array is rebuilt from the source registry before every
//! wait. Dispatch matches pollfd entries to registry entries by index,
//! which is why the loop must not reorder the first N registry entries
//! while a readiness batch is being handled: removal only marks entries
//! and physical cleanup runs at loop quiescence.

use std::os::unix::io::BorrowedFd;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::error::Result;
use crate::event::{Events, EventSource, Multiplexor};

/// [`Multiplexor`] implementation on top of `poll`.
pub struct PollMultiplexor {
    _private: (),
}

fn poll_flags(source: &EventSource) -> PollFlags {
    // A source marked removed stays in the array to preserve index parity
    // but no longer asks for any events.
    if source.is_removed() {
        return PollFlags::empty();
    }

    let mut flags = PollFlags::empty();

    if source.events().contains(Events::READ) {
        flags |= PollFlags::POLLIN;
    }

    if source.events().contains(Events::WRITE) {
        flags |= PollFlags::POLLOUT;
    }

    flags
}

fn received_events(flags: PollFlags) -> Events {
    let mut events = Events::empty();

    if flags.intersects(PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP) {
        events |= Events::READ;
    }

    if flags.intersects(PollFlags::POLLOUT | PollFlags::POLLERR | PollFlags::POLLHUP) {
        events |= Events::WRITE;
    }

    events
}

impl PollMultiplexor {
    /// Create the backend; holds no OS resources of its own.
    #[must_use]
    pub const fn new() -> Self {
        Self { _private: () }
    }
}

impl Default for PollMultiplexor {
    fn default() -> Self {
        Self::new()
    }
}

impl Multiplexor for PollMultiplexor {
    fn register(&mut self, _source: &EventSource) -> Result<()> {
        Ok(())
    }

    fn reconfigure(&mut self, _source: &EventSource) -> Result<()> {
        Ok(())
    }

    fn deregister(&mut self, _source: &EventSource) -> Result<()> {
        Ok(())
    }

    fn wait(&mut self, sources: &[EventSource], ready: &mut Vec<(usize, Events)>) -> Result<()> {
        let mut pollfds: Vec<PollFd<'_>> = sources
            .iter()
            .map(|source| {
                // SAFETY: the registry guarantees the handle is live for
                // the duration of the wait.
                let fd = unsafe { BorrowedFd::borrow_raw(source.handle()) };

                PollFd::new(fd, poll_flags(source))
            })
            .collect();

        match poll(&mut pollfds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => return Ok(()),
            Err(errno) => return Err(errno.into()),
        }

        for (index, pollfd) in pollfds.iter().enumerate() {
            let Some(revents) = pollfd.revents() else {
                continue;
            };

            let events = received_events(revents);

            if !events.is_empty() {
                ready.push((index, events));
            }
        }

        Ok(())
    }
}
