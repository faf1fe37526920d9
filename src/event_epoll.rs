//! epoll based multiplexor backend (Linux).
//!
//! Each registered handle's epoll subscription carries the raw handle in
//! its payload; readiness reports are resolved against the source registry
//! at dispatch time, so no pointers cross the kernel boundary and dispatch
//! cost is proportional to the number of ready handles.

use std::os::unix::io::BorrowedFd;

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

use crate::error::Result;
use crate::event::{Events, EventSource, Multiplexor};
use crate::{log_debug, log_source, log_warn};

log_source!(group: Event);

/// [`Multiplexor`] implementation on top of `epoll`.
pub struct EpollMultiplexor {
    epoll: Epoll,
    received: Vec<EpollEvent>,
    subscription_count: usize,
}

fn epoll_flags(events: Events) -> EpollFlags {
    let mut flags = EpollFlags::empty();

    if events.contains(Events::READ) {
        flags |= EpollFlags::EPOLLIN;
    }

    if events.contains(Events::WRITE) {
        flags |= EpollFlags::EPOLLOUT;
    }

    flags
}

fn received_events(flags: EpollFlags) -> Events {
    let mut events = Events::empty();

    // Error and hang-up conditions are delivered through whichever
    // direction the source requested, so its owner observes the failure on
    // the next read or write.
    if flags.intersects(EpollFlags::EPOLLIN | EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP) {
        events |= Events::READ;
    }

    if flags.intersects(EpollFlags::EPOLLOUT | EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP) {
        events |= Events::WRITE;
    }

    events
}

impl EpollMultiplexor {
    /// Create the epoll instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel refuses to create it.
    pub fn new() -> Result<Self> {
        Ok(Self {
            epoll: Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?,
            received: Vec::new(),
            subscription_count: 0,
        })
    }
}

impl Multiplexor for EpollMultiplexor {
    fn register(&mut self, source: &EventSource) -> Result<()> {
        // SAFETY: the registry guarantees the handle is live for the
        // duration of the call.
        let fd = unsafe { BorrowedFd::borrow_raw(source.handle()) };
        let event = EpollEvent::new(epoll_flags(source.events()), source.handle() as u64);

        self.epoll.add(fd, event)?;
        self.subscription_count += 1;

        Ok(())
    }

    fn reconfigure(&mut self, source: &EventSource) -> Result<()> {
        // SAFETY: see register.
        let fd = unsafe { BorrowedFd::borrow_raw(source.handle()) };
        let mut event = EpollEvent::new(epoll_flags(source.events()), source.handle() as u64);

        self.epoll.modify(fd, &mut event)?;

        Ok(())
    }

    fn deregister(&mut self, source: &EventSource) -> Result<()> {
        // SAFETY: see register.
        let fd = unsafe { BorrowedFd::borrow_raw(source.handle()) };

        self.epoll.delete(fd)?;
        self.subscription_count -= 1;

        Ok(())
    }

    fn wait(&mut self, sources: &[EventSource], ready: &mut Vec<(usize, Events)>) -> Result<()> {
        self.received
            .resize(self.subscription_count.max(1), EpollEvent::empty());

        let count = match self.epoll.wait(&mut self.received, EpollTimeout::NONE) {
            Ok(count) => count,
            Err(nix::errno::Errno::EINTR) => return Ok(()),
            Err(errno) => return Err(errno.into()),
        };

        for received in &self.received[..count] {
            let handle = received.data() as crate::io::IoHandle;

            let Some(index) = sources.iter().position(|source| source.handle() == handle) else {
                log_warn!(
                    "Ready handle {} does not resolve to an event source",
                    handle
                );

                continue;
            };

            let events = received_events(received.events());

            if events.is_empty() {
                log_debug!("Ready handle {} reported no usable events", handle);

                continue;
            }

            ready.push((index, events));
        }

        Ok(())
    }
}
