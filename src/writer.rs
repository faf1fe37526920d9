//! Buffered packet writer for connection handles.
//!
//! A [`Writer`] first attempts a direct write. When the handle is not
//! ready the packet is queued in a bounded backlog and the handle is
//! registered for write readiness with the event loop; the drain callback
//! sends one queued packet per readiness report and deregisters once the
//! backlog is empty. Under sustained backpressure the oldest packets are
//! dropped, counted in [`dropped_count`](Writer::dropped_count) and
//! reported with a single aggregated warning per congestion episode. Hard
//! I/O errors invoke the recipient's disconnect hook; the writer's owner is
//! expected to destroy the writer from there.
//!
//! The writer lives on the event thread; its state is shared with the
//! drain callback through `Rc<RefCell<…>>`.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::error::Result;
use crate::event::{callback, EventCallback, EventLoop, Events, SourceType};
use crate::io::{Io, IoHandle};
use crate::packet::Packet;
use crate::{log_debug, log_error, log_source, log_warn};

log_source!();

/// Upper bound on queued packets per writer.
pub const MAX_BACKLOG: usize = 32_768;

/// Renders a packet for diagnostics.
pub type PacketSignatureFn = fn(&Packet) -> String;

/// Renders the recipient for diagnostics.
pub type RecipientSignatureFn = Box<dyn Fn() -> String>;

/// Invoked when the connection is beyond recovery; the owner should
/// destroy the writer (and typically the connection object) here.
pub type RecipientDisconnectFn = Box<dyn FnMut()>;

/// Outcome of a successful [`Writer::write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The packet went out directly.
    Written,
    /// The packet was queued for event-driven draining.
    Enqueued,
}

struct WriterState {
    io: Box<dyn Io>,
    backlog: VecDeque<Packet>,
    packet_type: &'static str,
    packet_signature: PacketSignatureFn,
    recipient_signature: RecipientSignatureFn,
    dropped: u64,
    overflow_warned: bool,
}

impl WriterState {
    fn send_head(&mut self) -> Option<Result<()>> {
        let packet = *self.backlog.front()?;
        let bytes = packet.to_bytes();

        match self.io.write(&bytes[..packet.total_length()]) {
            Ok(_) => {
                self.backlog.pop_front();
                self.overflow_warned = false;

                log_debug!(
                    "Sent queued {} ({}) to {}, {} {}(s) left in write backlog",
                    self.packet_type,
                    (self.packet_signature)(&packet),
                    (self.recipient_signature)(),
                    self.backlog.len(),
                    self.packet_type
                );

                Some(Ok(()))
            }
            Err(error) => {
                log_error!(
                    "Could not send queued {} ({}) to {}, disconnecting recipient: {}",
                    self.packet_type,
                    (self.packet_signature)(&packet),
                    (self.recipient_signature)(),
                    error
                );

                Some(Err(error))
            }
        }
    }
}

/// Per-connection outbound packet queue with backpressure handling.
pub struct Writer {
    state: Rc<RefCell<WriterState>>,
    disconnect: Rc<RefCell<RecipientDisconnectFn>>,
    drain: EventCallback,
    handle: IoHandle,
}

impl Writer {
    /// Create a writer for `io`.
    ///
    /// The handle behind `io` must already be registered with the event
    /// loop (typically for read readiness by the connection's owner); the
    /// writer only toggles the write direction of that source.
    #[must_use]
    pub fn new(
        io: Box<dyn Io>,
        packet_type: &'static str,
        packet_signature: PacketSignatureFn,
        recipient_signature: RecipientSignatureFn,
        recipient_disconnect: RecipientDisconnectFn,
    ) -> Self {
        let handle = io.handle();

        let state = Rc::new(RefCell::new(WriterState {
            io,
            backlog: VecDeque::new(),
            packet_type,
            packet_signature,
            recipient_signature,
            dropped: 0,
            overflow_warned: false,
        }));

        let disconnect = Rc::new(RefCell::new(recipient_disconnect));

        let drain_state = Rc::clone(&state);
        let drain_disconnect = Rc::clone(&disconnect);

        let drain = callback(move |event_loop: &mut EventLoop| {
            let mut state = drain_state.borrow_mut();

            let result = match state.send_head() {
                Some(result) => result,
                None => return,
            };

            match result {
                Ok(()) => {
                    if state.backlog.is_empty() {
                        // Last queued packet handled; stop asking for write
                        // readiness.
                        drop(state);

                        if let Err(error) = event_loop.modify_source(
                            handle,
                            SourceType::Generic,
                            Events::WRITE,
                            Events::empty(),
                            None,
                        ) {
                            log_error!(
                                "Could not deregister write events (handle: {}): {}",
                                handle,
                                error
                            );
                        }
                    }
                }
                Err(_) => {
                    // The disconnect hook usually destroys this writer, so
                    // the state borrow must be released first.
                    drop(state);

                    (drain_disconnect.borrow_mut())();
                }
            }
        });

        Self {
            state,
            disconnect,
            drain,
            handle,
        }
    }

    /// Send `packet`, directly if possible, queueing it otherwise.
    ///
    /// # Errors
    ///
    /// Returns the I/O error after invoking the recipient's disconnect
    /// hook when the handle fails with anything other than would-block,
    /// or the registration error if write readiness cannot be requested.
    pub fn write(&mut self, event_loop: &mut EventLoop, packet: &Packet) -> Result<WriteOutcome> {
        let mut state = self.state.borrow_mut();

        if state.backlog.is_empty() {
            let bytes = packet.to_bytes();

            match state.io.write(&bytes[..packet.total_length()]) {
                Ok(_) => return Ok(WriteOutcome::Written),
                Err(error) if error.is_would_block() => {}
                Err(error) => {
                    log_error!(
                        "Could not send {} ({}) to {}, disconnecting recipient: {}",
                        state.packet_type,
                        (state.packet_signature)(packet),
                        (state.recipient_signature)(),
                        error
                    );

                    drop(state);

                    (self.disconnect.borrow_mut())();

                    return Err(error);
                }
            }
        }

        log_debug!(
            "{} is not ready to receive, pushing {} to write backlog (count: {} +1)",
            (state.recipient_signature)(),
            state.packet_type,
            state.backlog.len()
        );

        if state.backlog.len() >= MAX_BACKLOG {
            let overflow = state.backlog.len() - MAX_BACKLOG + 1;

            for _ in 0..overflow {
                state.backlog.pop_front();
            }

            state.dropped += overflow as u64;

            if !state.overflow_warned {
                state.overflow_warned = true;

                log_warn!(
                    "Write backlog for {} is full, dropping {} queued {}(s), {} dropped in total",
                    (state.recipient_signature)(),
                    overflow,
                    state.packet_type,
                    state.dropped
                );
            }
        }

        state.backlog.push_back(*packet);

        if state.backlog.len() == 1 {
            // First queued packet; start asking for write readiness.
            drop(state);

            event_loop.modify_source(
                self.handle,
                SourceType::Generic,
                Events::empty(),
                Events::WRITE,
                Some(self.drain.clone()),
            )?;
        }

        Ok(WriteOutcome::Enqueued)
    }

    /// Number of packets currently queued.
    #[must_use]
    pub fn backlog_length(&self) -> usize {
        self.state.borrow().backlog.len()
    }

    /// Total packets dropped due to backlog overflow.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.state.borrow().dropped
    }

    /// Release the writer.
    ///
    /// Queued packets are discarded with a warning and write readiness is
    /// deregistered; the recipient's disconnect hook is *not* invoked.
    pub fn destroy(self, event_loop: &mut EventLoop) {
        let state = self.state.borrow();

        if !state.backlog.is_empty() {
            log_warn!(
                "Destroying writer for {} while {} {}(s) have not been sent",
                (state.recipient_signature)(),
                state.backlog.len(),
                state.packet_type
            );

            drop(state);

            let _ = event_loop.modify_source(
                self.handle,
                SourceType::Generic,
                Events::WRITE,
                Events::empty(),
                None,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{callback, EventLoop};
    use crate::event_poll::PollMultiplexor;
    use crate::packet::PacketHeader;
    use crate::pipe::{Pipe, PipeFlags};
    use crate::Error;

    fn test_packet(uid: u32) -> Packet {
        let header = PacketHeader {
            uid,
            length: 0,
            function_id: 1,
            sequence_number_and_options: 1 << 4,
            error_code_and_future_use: 0,
        };

        Packet::new(header, &[0xAA; 8]).unwrap()
    }

    /// An [`Io`] stub whose write behavior is scripted from the outside.
    struct ScriptedIo {
        handle: IoHandle,
        results: Rc<RefCell<VecDeque<Result<usize>>>>,
        default_would_block: bool,
    }

    impl Io for ScriptedIo {
        fn handle(&self) -> IoHandle {
            self.handle
        }

        fn read(&mut self, _buffer: &mut [u8]) -> Result<usize> {
            Ok(0)
        }

        fn write(&mut self, buffer: &[u8]) -> Result<usize> {
            match self.results.borrow_mut().pop_front() {
                Some(result) => result,
                None if self.default_would_block => {
                    Err(Error::would_block("scripted handle is congested"))
                }
                None => Ok(buffer.len()),
            }
        }
    }

    struct Fixture {
        event_loop: EventLoop,
        _pipe: Pipe,
        results: Rc<RefCell<VecDeque<Result<usize>>>>,
        disconnects: Rc<RefCell<u32>>,
    }

    impl Fixture {
        fn new(default_would_block: bool) -> (Self, Writer) {
            let mut event_loop =
                EventLoop::with_multiplexor(Box::new(PollMultiplexor::new())).unwrap();

            // A real handle backs the stub so the poll backend can include
            // it; a pipe's write end is permanently writable.
            let pipe = Pipe::new(PipeFlags::empty()).unwrap();
            let handle = pipe.write_handle();

            event_loop
                .add_source(
                    handle,
                    SourceType::Generic,
                    Events::empty(),
                    None,
                    None,
                )
                .unwrap();

            let results: Rc<RefCell<VecDeque<Result<usize>>>> =
                Rc::new(RefCell::new(VecDeque::new()));
            let disconnects = Rc::new(RefCell::new(0u32));

            let io = ScriptedIo {
                handle,
                results: Rc::clone(&results),
                default_would_block,
            };

            let disconnects_hook = Rc::clone(&disconnects);

            let writer = Writer::new(
                Box::new(io),
                "response",
                Packet::signature,
                Box::new(|| "test client".to_string()),
                Box::new(move || {
                    *disconnects_hook.borrow_mut() += 1;
                }),
            );

            (
                Self {
                    event_loop,
                    _pipe: pipe,
                    results,
                    disconnects,
                },
                writer,
            )
        }

        fn write_registered(&self, writer: &Writer) -> bool {
            self.event_loop
                .requested_events(writer.handle, SourceType::Generic)
                .is_some_and(|events| events.contains(Events::WRITE))
        }
    }

    #[test]
    fn test_direct_write_when_idle() {
        let _logger_guard = crate::log::test_support::LOGGER_TEST_GUARD.lock();
        let (fixture, mut writer) = Fixture::new(false);
        let mut event_loop = fixture.event_loop;

        let outcome = writer.write(&mut event_loop, &test_packet(1)).unwrap();

        assert_eq!(outcome, WriteOutcome::Written);
        assert_eq!(writer.backlog_length(), 0);
        assert_eq!(writer.dropped_count(), 0);
    }

    #[test]
    fn test_would_block_enqueues_and_registers() {
        let _logger_guard = crate::log::test_support::LOGGER_TEST_GUARD.lock();
        let (mut fixture, mut writer) = Fixture::new(true);

        let outcome = writer
            .write(&mut fixture.event_loop, &test_packet(1))
            .unwrap();

        assert_eq!(outcome, WriteOutcome::Enqueued);
        assert_eq!(writer.backlog_length(), 1);
        assert!(fixture.write_registered(&writer));

        // A second packet joins the backlog without re-registering.
        writer
            .write(&mut fixture.event_loop, &test_packet(2))
            .unwrap();
        assert_eq!(writer.backlog_length(), 2);
        assert!(fixture.write_registered(&writer));
    }

    #[test]
    fn test_hard_error_disconnects_recipient() {
        let _logger_guard = crate::log::test_support::LOGGER_TEST_GUARD.lock();
        let (mut fixture, mut writer) = Fixture::new(false);

        fixture
            .results
            .borrow_mut()
            .push_back(Err(Error::io("connection reset")));

        let error = writer
            .write(&mut fixture.event_loop, &test_packet(1))
            .unwrap_err();

        assert_eq!(error.kind(), crate::ErrorKind::Io);
        assert_eq!(*fixture.disconnects.borrow(), 1);
        assert_eq!(writer.backlog_length(), 0);
    }

    #[test]
    fn test_backlog_overflow_drops_oldest_with_one_warning() {
        let _logger_guard = crate::log::test_support::LOGGER_TEST_GUARD.lock();
        let (mut fixture, mut writer) = Fixture::new(true);

        for uid in 0..(MAX_BACKLOG as u32 + 2) {
            writer
                .write(&mut fixture.event_loop, &test_packet(uid))
                .unwrap();
        }

        assert_eq!(writer.backlog_length(), MAX_BACKLOG);
        assert_eq!(writer.dropped_count(), 2);
        assert!(fixture.write_registered(&writer));

        // The two oldest packets are the dropped ones.
        assert_eq!(writer.state.borrow().backlog.front().unwrap().header.uid, 2);
    }

    #[test]
    fn test_drain_sends_backlog_and_deregisters() {
        let _logger_guard = crate::log::test_support::LOGGER_TEST_GUARD.lock();
        let (mut fixture, mut writer) = Fixture::new(true);

        writer
            .write(&mut fixture.event_loop, &test_packet(1))
            .unwrap();
        writer
            .write(&mut fixture.event_loop, &test_packet(2))
            .unwrap();
        assert_eq!(writer.backlog_length(), 2);

        // From now on the scripted handle accepts everything.
        {
            let mut results = fixture.results.borrow_mut();
            results.push_back(Ok(80));
            results.push_back(Ok(80));
        }

        // A permanently-ready control pipe stops the loop once the backlog
        // has drained.
        let control = Pipe::new(PipeFlags::empty()).unwrap();
        control.write(b"x").unwrap();

        let writer_state = Rc::clone(&writer.state);

        fixture
            .event_loop
            .add_source(
                control.read_handle(),
                SourceType::Generic,
                Events::READ,
                Some(callback(move |event_loop| {
                    if writer_state.borrow().backlog.is_empty() {
                        event_loop.stop();
                    }
                })),
                None,
            )
            .unwrap();

        fixture.event_loop.run(|_| {}).unwrap();

        assert_eq!(writer.backlog_length(), 0);
        assert!(!fixture.write_registered(&writer));

        writer.destroy(&mut fixture.event_loop);
    }
}
