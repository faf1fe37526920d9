//! Async-signal-safe bridge from OS signals into the event loop.
//!
//! Signal handlers may only touch async-signal-safe state, so each handler
//! does exactly one thing: write the signal number to a process-wide pipe.
//! The pipe's read end is an ordinary event source; its callback runs on
//! the event thread with no restrictions and dispatches the signal:
//! `SIGINT` and `SIGTERM` stop the loop, `SIGUSR1` invokes a caller-
//! supplied hook (typically toggling the log debug override), anything
//! else is logged and ignored. `SIGPIPE` is swallowed so that writes to
//! closed connections surface as errors instead of killing the process.

use std::rc::Rc;

use signal_hook::SigId;

use crate::error::Result;
use crate::event::{callback, EventLoop, Events, SourceType};
use crate::pipe::{Pipe, PipeFlags};
use crate::{log_error, log_info, log_source, log_warn};

log_source!(group: Event);

fn forward_signal(write_handle: crate::io::IoHandle, signal_number: i32) {
    let bytes = signal_number.to_ne_bytes();

    // SAFETY: write(2) is async-signal-safe and the pipe outlives the
    // handler registration. There is nothing useful to do on failure here.
    unsafe {
        libc::write(write_handle, bytes.as_ptr().cast(), bytes.len());
    }
}

/// Installed signal handlers plus the pipe that feeds the event loop.
pub struct SignalBridge {
    pipe: Rc<Pipe>,
    registrations: Vec<(SigId, libc::c_int)>,
}

impl SignalBridge {
    /// Create the pipe, register its read end with the event loop and
    /// install handlers for `SIGINT`, `SIGTERM` and `SIGUSR1`; `SIGPIPE`
    /// is ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipe cannot be created or a handler cannot
    /// be installed; partial installation is rolled back.
    pub fn new(
        event_loop: &mut EventLoop,
        mut sigusr1: Option<Box<dyn FnMut()>>,
    ) -> Result<Self> {
        let pipe = Rc::new(Pipe::new(PipeFlags::empty())?);
        let reader = Rc::clone(&pipe);

        event_loop.add_source(
            pipe.read_handle(),
            SourceType::Generic,
            Events::READ,
            Some(callback(move |event_loop| {
                let mut bytes = [0u8; 4];

                match reader.read(&mut bytes) {
                    Ok(n) if n == bytes.len() => {}
                    Ok(n) => {
                        log_error!("Short read of {} byte(s) from signal pipe", n);

                        return;
                    }
                    Err(error) => {
                        log_error!("Could not read from signal pipe: {}", error);

                        return;
                    }
                }

                let signal_number = i32::from_ne_bytes(bytes);

                match signal_number {
                    libc::SIGINT => {
                        log_info!("Received SIGINT");

                        event_loop.stop();
                    }
                    libc::SIGTERM => {
                        log_info!("Received SIGTERM");

                        event_loop.stop();
                    }
                    libc::SIGUSR1 => {
                        log_info!("Received SIGUSR1");

                        if let Some(hook) = sigusr1.as_mut() {
                            hook();
                        }
                    }
                    _ => {
                        log_warn!("Received unexpected signal {}", signal_number);
                    }
                }
            })),
            None,
        )?;

        let mut bridge = Self {
            pipe,
            registrations: Vec::new(),
        };

        for signal_number in [libc::SIGINT, libc::SIGTERM, libc::SIGUSR1] {
            let write_handle = bridge.pipe.write_handle();

            // SAFETY: the handler only calls write(2); see forward_signal.
            let registration = unsafe {
                signal_hook::low_level::register(signal_number, move || {
                    forward_signal(write_handle, signal_number);
                })
            };

            match registration {
                Ok(id) => bridge.registrations.push((id, signal_number)),
                Err(error) => {
                    bridge.unwind(event_loop);

                    return Err(error.into());
                }
            }
        }

        // An installed no-op handler keeps SIGPIPE from terminating the
        // process; writes to dead peers then fail with EPIPE.
        // SAFETY: the handler does nothing at all.
        match unsafe { signal_hook::low_level::register(libc::SIGPIPE, || {}) } {
            Ok(id) => bridge.registrations.push((id, libc::SIGPIPE)),
            Err(error) => {
                bridge.unwind(event_loop);

                return Err(error.into());
            }
        }

        Ok(bridge)
    }

    fn unwind(&mut self, event_loop: &mut EventLoop) {
        for (id, signal_number) in self.registrations.drain(..) {
            signal_hook::low_level::unregister(id);

            // Unregistering only detaches the action; the process-level
            // handler installed behind it stays. Reset the kernel
            // disposition to the default for every signal this bridge
            // touched.
            // SAFETY: SIG_DFL installs no handler code.
            unsafe {
                libc::signal(signal_number, libc::SIG_DFL);
            }
        }

        event_loop.remove_source(self.pipe.read_handle(), SourceType::Generic);
    }

    /// Uninstall the handlers, restore the default signal dispositions and
    /// remove the pipe from the event loop.
    pub fn exit(mut self, event_loop: &mut EventLoop) {
        self.unwind(event_loop);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_poll::PollMultiplexor;
    use std::cell::RefCell;
    use std::time::Duration;

    #[test]
    fn test_sigusr1_invokes_hook_and_sigterm_stops_loop() {
        let _logger_guard = crate::log::test_support::LOGGER_TEST_GUARD.lock();
        let mut event_loop =
            EventLoop::with_multiplexor(Box::new(PollMultiplexor::new())).unwrap();

        let usr1_count = Rc::new(RefCell::new(0u32));
        let usr1_count_hook = Rc::clone(&usr1_count);

        let bridge = SignalBridge::new(
            &mut event_loop,
            Some(Box::new(move || {
                *usr1_count_hook.borrow_mut() += 1;
            })),
        )
        .unwrap();

        signal_hook::low_level::raise(libc::SIGUSR1).unwrap();
        signal_hook::low_level::raise(libc::SIGTERM).unwrap();

        let started = std::time::Instant::now();
        event_loop.run(|_| {}).unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(*usr1_count.borrow(), 1);

        bridge.exit(&mut event_loop);
    }
}
