//! The event loop: level-triggered readiness multiplexing over I/O handles.
//!
//! Sources are identified by `(handle, type)` pairs and carry independent
//! read and write callbacks. Registry mutations requested while a dispatch
//! iteration is in progress are deferred: [`remove_source`]
//! (EventLoop::remove_source) only *marks* an entry, and
//! [`cleanup_sources`](EventLoop::cleanup_sources) performs the physical
//! registry and OS-multiplexor changes once the loop is quiescent. This
//! keeps registry indices stable within an iteration, which the poll
//! backend's index-parity dispatch relies on, and makes it safe for a
//! callback to add, modify or remove sources (including itself) or to stop
//! the loop.
//!
//! The OS multiplexor is abstracted behind [`Multiplexor`]; see
//! [`EpollMultiplexor`](crate::event_epoll::EpollMultiplexor) (Linux) and
//! [`PollMultiplexor`](crate::event_poll::PollMultiplexor) (portable Unix).

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::io::IoHandle;
use crate::pipe::{Pipe, PipeFlags};
use crate::{log_debug, log_error, log_source};

log_source!(group: Event);

bitflags! {
    /// Readiness directions of an event source.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Events: u8 {
        /// The handle is (or should be monitored for becoming) readable.
        const READ = 1;
        /// The handle is (or should be monitored for becoming) writable.
        const WRITE = 2;
    }
}

/// Distinguishes plain handles from USB subsystem handles with otherwise
/// identical numeric values; part of a source's identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    /// An ordinary file, pipe or socket handle.
    Generic,
    /// A handle owned by a USB transport layer.
    Usb,
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Generic => f.write_str("generic"),
            Self::Usb => f.write_str("USB"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceState {
    Normal,
    Added,
    Removed,
    Readded,
    Modified,
}

/// A callback invoked when a direction of a source becomes ready.
///
/// Callbacks receive the event loop so they can mutate the registry or stop
/// the loop; sharing state with the rest of the application goes through
/// the closure's captures (by `Rc`, since the loop is single-threaded).
pub type EventCallback = Rc<RefCell<dyn FnMut(&mut EventLoop)>>;

/// Wrap a closure as an [`EventCallback`].
pub fn callback<F: FnMut(&mut EventLoop) + 'static>(function: F) -> EventCallback {
    Rc::new(RefCell::new(function))
}

/// A registered event source.
pub struct EventSource {
    handle: IoHandle,
    source_type: SourceType,
    events: Events,
    state: SourceState,
    registered: bool,
    read: Option<EventCallback>,
    write: Option<EventCallback>,
}

impl EventSource {
    /// The OS handle this source monitors.
    #[must_use]
    pub const fn handle(&self) -> IoHandle {
        self.handle
    }

    /// The type tag of this source.
    #[must_use]
    pub const fn source_type(&self) -> SourceType {
        self.source_type
    }

    /// The currently requested readiness directions.
    #[must_use]
    pub const fn events(&self) -> Events {
        self.events
    }

    /// True once the source has been logically removed; it stays in the
    /// registry (and is skipped by dispatch) until the next cleanup.
    #[must_use]
    pub fn is_removed(&self) -> bool {
        self.state == SourceState::Removed
    }
}

/// OS readiness-multiplexor backend.
///
/// `wait` blocks until at least one source is ready and appends
/// `(registry index, received events)` pairs to `ready`, already resolved
/// against the registry, so dispatch does not depend on how the backend
/// identifies handles. An interrupted wait returns `Ok` with `ready` left
/// empty.
pub trait Multiplexor {
    /// A source entered the registry; mirror it into the OS multiplexor.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS rejects the subscription; the loop drops
    /// the source.
    fn register(&mut self, source: &EventSource) -> Result<()>;

    /// A source's requested events changed; reconfigure the subscription.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS rejects the change.
    fn reconfigure(&mut self, source: &EventSource) -> Result<()>;

    /// A source left the registry; drop the OS subscription.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS rejects the removal; the registry entry
    /// is deleted regardless.
    fn deregister(&mut self, source: &EventSource) -> Result<()>;

    /// Block until readiness and resolve it against `sources`.
    ///
    /// # Errors
    ///
    /// Returns an error on unrecoverable wait failure; `EINTR` is not an
    /// error.
    fn wait(&mut self, sources: &[EventSource], ready: &mut Vec<(usize, Events)>) -> Result<()>;
}

/// Cloneable handle that stops a running event loop from any thread.
#[derive(Clone)]
pub struct StopHandle {
    running: Arc<AtomicBool>,
    wake_pipe: Arc<Pipe>,
}

impl StopHandle {
    /// Clear the running flag and wake the loop's wait call.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);

        if let Err(error) = self.wake_pipe.write(&[0]) {
            if !error.is_would_block() {
                log_error!("Could not write to wake pipe: {}", error);
            }
        }
    }
}

/// The event loop. See the [module documentation](self) for the dispatch
/// and deferred-removal contract.
pub struct EventLoop {
    sources: Vec<EventSource>,
    multiplexor: Box<dyn Multiplexor>,
    running: Arc<AtomicBool>,
    wake_pipe: Arc<Pipe>,
}

impl EventLoop {
    /// Create an event loop on the platform's default multiplexor (epoll on
    /// Linux, poll on other Unix systems).
    ///
    /// # Errors
    ///
    /// Returns an error if the multiplexor or the internal wake pipe cannot
    /// be created.
    pub fn new() -> Result<Self> {
        #[cfg(target_os = "linux")]
        let multiplexor = Box::new(crate::event_epoll::EpollMultiplexor::new()?);

        #[cfg(all(unix, not(target_os = "linux")))]
        let multiplexor = Box::new(crate::event_poll::PollMultiplexor::new());

        Self::with_multiplexor(multiplexor)
    }

    /// Create an event loop on an explicit multiplexor backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal wake pipe cannot be created.
    pub fn with_multiplexor(multiplexor: Box<dyn Multiplexor>) -> Result<Self> {
        let wake_pipe = Arc::new(Pipe::new(
            PipeFlags::NON_BLOCKING_READ | PipeFlags::NON_BLOCKING_WRITE,
        )?);

        let mut event_loop = Self {
            sources: Vec::new(),
            multiplexor,
            running: Arc::new(AtomicBool::new(false)),
            wake_pipe: Arc::clone(&wake_pipe),
        };

        let drain_pipe = Arc::clone(&wake_pipe);

        event_loop.add_source(
            wake_pipe.read_handle(),
            SourceType::Generic,
            Events::READ,
            Some(callback(move |_event_loop| {
                let mut scratch = [0u8; 32];

                loop {
                    match drain_pipe.read(&mut scratch) {
                        Ok(0) => break,
                        Ok(_) => {}
                        Err(error) if error.is_would_block() => break,
                        Err(error) => {
                            log_error!("Could not drain wake pipe: {}", error);
                            break;
                        }
                    }
                }
            })),
            None,
        )?;

        Ok(event_loop)
    }

    /// A handle for stopping the loop from another thread.
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            running: Arc::clone(&self.running),
            wake_pipe: Arc::clone(&self.wake_pipe),
        }
    }

    /// True while [`run`](Self::run) is executing and has not been stopped.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The requested events of the live source `(handle, source_type)`,
    /// if any.
    #[must_use]
    pub fn requested_events(&self, handle: IoHandle, source_type: SourceType) -> Option<Events> {
        self.find(handle, source_type)
            .map(|index| self.sources[index].events)
    }

    fn find(&self, handle: IoHandle, source_type: SourceType) -> Option<usize> {
        self.sources.iter().position(|source| {
            source.handle == handle
                && source.source_type == source_type
                && source.state != SourceState::Removed
        })
    }

    /// Register a new source.
    ///
    /// A direction present in `events` requires the matching callback. The
    /// source participates in dispatch from the next loop iteration. Adding
    /// over a source that is marked removed resurrects the entry with the
    /// new callbacks; adding a duplicate live `(handle, type)` pair is an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns an error for a duplicate source or a direction bit without a
    /// callback.
    pub fn add_source(
        &mut self,
        handle: IoHandle,
        source_type: SourceType,
        events: Events,
        read: Option<EventCallback>,
        write: Option<EventCallback>,
    ) -> Result<()> {
        if events.contains(Events::READ) && read.is_none() {
            return Err(Error::io(format!(
                "read events requested for {source_type} event source (handle: {handle}) \
                 without a read callback"
            )));
        }

        if events.contains(Events::WRITE) && write.is_none() {
            return Err(Error::io(format!(
                "write events requested for {source_type} event source (handle: {handle}) \
                 without a write callback"
            )));
        }

        let removed = self.sources.iter().position(|source| {
            source.handle == handle
                && source.source_type == source_type
                && source.state == SourceState::Removed
        });

        if let Some(index) = removed {
            let source = &mut self.sources[index];

            source.state = SourceState::Readded;
            source.events = events;
            source.read = read;
            source.write = write;

            log_debug!(
                "Readded {} event source (handle: {}, events: {:?})",
                source_type,
                handle,
                events
            );

            return Ok(());
        }

        if self.find(handle, source_type).is_some() {
            return Err(Error::io(format!(
                "{source_type} event source (handle: {handle}) is already added"
            )));
        }

        self.sources.push(EventSource {
            handle,
            source_type,
            events,
            state: SourceState::Added,
            registered: false,
            read,
            write,
        });

        log_debug!(
            "Added {} event source (handle: {}, events: {:?})",
            source_type,
            handle,
            events
        );

        Ok(())
    }

    /// Change the requested events of an existing source.
    ///
    /// Directions in `remove` are cleared along with their callbacks;
    /// directions in `add` are set and receive `callback`. A source still
    /// in state `added` stays pending-addition; otherwise it is marked
    /// modified and reconfigured at the next cleanup.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::NotFound`](crate::ErrorKind) for an unknown
    /// source, or an error if `add` is non-empty and no callback was
    /// supplied.
    pub fn modify_source(
        &mut self,
        handle: IoHandle,
        source_type: SourceType,
        remove: Events,
        add: Events,
        callback: Option<EventCallback>,
    ) -> Result<()> {
        if !add.is_empty() && callback.is_none() {
            return Err(Error::io(format!(
                "events added to {source_type} event source (handle: {handle}) without a callback"
            )));
        }

        let Some(index) = self.find(handle, source_type) else {
            return Err(Error::not_found(format!(
                "{source_type} event source (handle: {handle}) is not added"
            )));
        };

        let source = &mut self.sources[index];

        source.events -= remove;
        source.events |= add;

        if remove.contains(Events::READ) {
            source.read = None;
        }

        if remove.contains(Events::WRITE) {
            source.write = None;
        }

        if add.contains(Events::READ) {
            source.read.clone_from(&callback);
        }

        if add.contains(Events::WRITE) {
            source.write = callback;
        }

        // A source that the OS multiplexor has not seen yet keeps its
        // pending-addition state; it will be registered with the updated
        // events in one step.
        if source.state == SourceState::Normal || source.state == SourceState::Modified {
            source.state = SourceState::Modified;
        }

        log_debug!(
            "Modified {} event source (handle: {}, events: {:?})",
            source_type,
            handle,
            source.events
        );

        Ok(())
    }

    /// Mark a source as removed.
    ///
    /// The entry stays in the registry, excluded from dispatch, until the
    /// next [`cleanup_sources`](Self::cleanup_sources) physically removes
    /// it. Removing an unknown source is a no-op.
    pub fn remove_source(&mut self, handle: IoHandle, source_type: SourceType) {
        let Some(index) = self.find(handle, source_type) else {
            log_debug!(
                "Ignoring removal of unknown {} event source (handle: {})",
                source_type,
                handle
            );

            return;
        };

        let source = &mut self.sources[index];

        source.state = SourceState::Removed;
        source.read = None;
        source.write = None;

        log_debug!(
            "Marked {} event source (handle: {}) as removed",
            source_type,
            handle
        );
    }

    /// Apply all pending registry changes to the OS multiplexor.
    ///
    /// Pending additions are processed first, then modifications, then
    /// removals; afterwards every surviving entry is in the normal state.
    /// Runs automatically around every dispatch iteration; calling it from
    /// outside [`run`](Self::run) is only needed when registering sources
    /// before the loop starts matters to a test or a backend.
    pub fn cleanup_sources(&mut self) {
        for index in 0..self.sources.len() {
            match self.sources[index].state {
                SourceState::Added | SourceState::Readded => {
                    let source = &self.sources[index];

                    // A resurrected source is usually still known to the OS
                    // multiplexor, in which case only its subscription is
                    // updated.
                    let result = if source.registered {
                        self.multiplexor.reconfigure(source)
                    } else {
                        self.multiplexor.register(source)
                    };

                    match result {
                        Ok(()) => {
                            self.sources[index].registered = true;
                            self.sources[index].state = SourceState::Normal;
                        }
                        Err(error) => {
                            log_error!(
                                "Could not register {} event source (handle: {}): {}",
                                self.sources[index].source_type,
                                self.sources[index].handle,
                                error
                            );

                            self.sources[index].state = SourceState::Removed;
                        }
                    }
                }
                SourceState::Normal | SourceState::Modified | SourceState::Removed => {}
            }
        }

        for index in 0..self.sources.len() {
            if self.sources[index].state == SourceState::Modified {
                if let Err(error) = self.multiplexor.reconfigure(&self.sources[index]) {
                    log_error!(
                        "Could not reconfigure {} event source (handle: {}): {}",
                        self.sources[index].source_type,
                        self.sources[index].handle,
                        error
                    );
                }

                self.sources[index].state = SourceState::Normal;
            }
        }

        for index in 0..self.sources.len() {
            if self.sources[index].state == SourceState::Removed && self.sources[index].registered {
                if let Err(error) = self.multiplexor.deregister(&self.sources[index]) {
                    log_error!(
                        "Could not deregister {} event source (handle: {}): {}",
                        self.sources[index].source_type,
                        self.sources[index].handle,
                        error
                    );
                }
            }
        }

        self.sources
            .retain(|source| source.state != SourceState::Removed);
    }

    /// Run the loop until [`stop`](Self::stop) or a [`StopHandle`] clears
    /// the running flag.
    ///
    /// `cleanup` is invoked before every wait, ahead of
    /// [`cleanup_sources`](Self::cleanup_sources), so the application can
    /// release objects whose sources were removed during dispatch.
    ///
    /// # Errors
    ///
    /// Returns an error if the loop is already running or the multiplexor
    /// wait fails unrecoverably.
    pub fn run<F: FnMut(&mut Self)>(&mut self, mut cleanup: F) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::io("event loop is already running"));
        }

        cleanup(self);
        self.cleanup_sources();

        let mut ready: Vec<(usize, Events)> = Vec::new();

        while self.running.load(Ordering::SeqCst) {
            log_debug!("Starting to wait on {} event source(s)", self.sources.len());

            ready.clear();
            self.multiplexor.wait(&self.sources, &mut ready)?;

            if ready.is_empty() {
                log_debug!("Wait got interrupted");

                continue;
            }

            log_debug!("Wait returned {} event source(s) as ready", ready.len());

            // Dispatch relies on registry indices staying valid: additions
            // during a callback only append, removals only mark.
            for &(index, received) in &ready {
                if !self.running.load(Ordering::SeqCst) {
                    break;
                }

                self.dispatch(index, received);
            }

            log_debug!("Handled all ready event sources");

            cleanup(self);
            self.cleanup_sources();
        }

        Ok(())
    }

    // A source takes part in dispatch only in the normal and modified
    // states: removed sources are dead, and (re)added ones join from the
    // next iteration.
    fn is_dispatchable(&self, index: usize) -> bool {
        matches!(
            self.sources[index].state,
            SourceState::Normal | SourceState::Modified
        )
    }

    fn dispatch(&mut self, index: usize, received: Events) {
        if !self.is_dispatchable(index) {
            return;
        }

        // Read before write when both directions are ready.
        let source = &self.sources[index];

        if received.contains(Events::READ) && source.events.contains(Events::READ) {
            if let Some(callback) = source.read.clone() {
                (callback.borrow_mut())(self);
            }
        }

        // The read callback may have removed or modified this source (or
        // grown the registry); re-evaluate before delivering the write
        // direction.
        if !self.is_dispatchable(index) {
            return;
        }

        let source = &self.sources[index];

        if received.contains(Events::WRITE) && source.events.contains(Events::WRITE) {
            if let Some(callback) = source.write.clone() {
                (callback.borrow_mut())(self);
            }
        }
    }

    /// Clear the running flag; the current dispatch iteration finishes and
    /// [`run`](Self::run) returns. Safe to call from a callback. From
    /// another thread, use a [`StopHandle`] instead so the wait is woken.
    pub fn stop(&mut self) {
        log_debug!("Stopping the event loop");

        self.running.store(false, Ordering::SeqCst);
    }
}
