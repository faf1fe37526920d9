//! Monotonic one-shot and periodic timers, exposed as event sources.
//!
//! A timer raises read readiness on an internal handle whenever it
//! expires; the event callback drains the pending expiration count and
//! invokes the user callback exactly once per batch, so a loop that fell
//! behind sees one invocation, not a burst.
//!
//! On Linux the handle is a `timerfd`; on other Unix systems a worker
//! thread sleeps until the next deadline and raises readiness through a
//! pipe. [`configure`](Timer::configure) with a zero delay disarms the
//! timer in both implementations.

use std::time::Duration;

use crate::error::Result;
use crate::event::{callback, EventLoop, Events, SourceType};
use crate::io::IoHandle;

/// Callback invoked on the event thread when the timer expires.
pub type TimerCallback = Box<dyn FnMut()>;

#[cfg(target_os = "linux")]
mod platform {
    use super::{callback, Duration, EventLoop, Events, IoHandle, Result, SourceType,
                TimerCallback};
    use crate::{log_debug, log_error, log_source};

    use std::os::fd::{AsFd, AsRawFd};

    log_source!();

    use nix::sys::time::TimeSpec;
    use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};

    /// A timerfd backed monotonic timer.
    pub struct Timer {
        timer_fd: TimerFd,
    }

    fn drain_expirations(handle: IoHandle) -> bool {
        let mut bytes = [0u8; 8];

        loop {
            // SAFETY: bytes is valid for 8 bytes; timerfd reads are exactly
            // 8 bytes.
            let rc = unsafe { libc::read(handle, bytes.as_mut_ptr().cast(), bytes.len()) };

            match nix::errno::Errno::result(rc) {
                Ok(_) => return true,
                Err(nix::errno::Errno::EINTR) => {}
                Err(nix::errno::Errno::EWOULDBLOCK) => return false,
                Err(errno) => {
                    log_error!(
                        "Could not read from timerfd (handle: {}): {}",
                        handle,
                        errno
                    );

                    return false;
                }
            }
        }
    }

    impl Timer {
        /// Create a disarmed timer and register it with the event loop.
        ///
        /// # Errors
        ///
        /// Returns an error if the timerfd cannot be created or registered.
        pub fn new(event_loop: &mut EventLoop, mut function: TimerCallback) -> Result<Self> {
            let timer_fd = TimerFd::new(
                ClockId::CLOCK_MONOTONIC,
                TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
            )?;

            let handle = timer_fd.as_fd().as_raw_fd();

            event_loop.add_source(
                handle,
                SourceType::Generic,
                Events::READ,
                Some(callback(move |_event_loop| {
                    if drain_expirations(handle) {
                        function();
                    }
                })),
                None,
            )?;

            log_debug!("Created timerfd (handle: {})", handle);

            Ok(Self { timer_fd })
        }

        /// The timer's event-source handle.
        #[must_use]
        pub fn handle(&self) -> IoHandle {
            self.timer_fd.as_fd().as_raw_fd()
        }

        /// Arm the timer: first expiration after `delay`, then every
        /// `interval` (a zero interval makes it one-shot). A zero `delay`
        /// disarms the timer.
        ///
        /// # Errors
        ///
        /// Returns an error if the kernel rejects the configuration.
        pub fn configure(&self, delay: Duration, interval: Duration) -> Result<()> {
            if delay.is_zero() {
                self.timer_fd.unset()?;

                return Ok(());
            }

            let expiration = if interval.is_zero() {
                Expiration::OneShot(TimeSpec::from_duration(delay))
            } else {
                Expiration::IntervalDelayed(
                    TimeSpec::from_duration(delay),
                    TimeSpec::from_duration(interval),
                )
            };

            self.timer_fd.set(expiration, TimerSetTimeFlags::empty())?;

            Ok(())
        }

        /// Remove the timer from the event loop and release the handle.
        pub fn destroy(self, event_loop: &mut EventLoop) {
            log_debug!("Destroying timerfd (handle: {})", self.handle());

            event_loop.remove_source(self.handle(), SourceType::Generic);
        }
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
mod platform {
    use super::{callback, Duration, EventLoop, Events, IoHandle, Result, SourceType,
                TimerCallback};
    use crate::{log_debug, log_error, log_source};

    use std::sync::Arc;
    use std::time::Instant;

    log_source!();

    use crate::pipe::{Pipe, PipeFlags};
    use crate::sync::{Condvar, Mutex, Thread};

    struct WorkerState {
        next: Option<Instant>,
        interval: Duration,
        shutdown: bool,
    }

    struct Worker {
        state: Mutex<WorkerState>,
        changed: Condvar,
    }

    /// A worker-thread backed monotonic timer.
    pub struct Timer {
        pipe: Arc<Pipe>,
        worker: Arc<Worker>,
        thread: Option<Thread>,
    }

    fn worker_main(worker: &Worker, pipe: &Pipe) {
        let mut state = worker.state.lock();

        loop {
            if state.shutdown {
                return;
            }

            let Some(next) = state.next else {
                worker.changed.wait(&mut state);

                continue;
            };

            let now = Instant::now();

            if now < next {
                worker.changed.wait_for(&mut state, next - now);

                continue;
            }

            if state.interval.is_zero() {
                state.next = None;
            } else {
                let mut following = next + state.interval;

                while following <= now {
                    following += state.interval;
                }

                state.next = Some(following);
            }

            if let Err(error) = pipe.write(&[1]) {
                if !error.is_would_block() {
                    log_error!("Could not raise timer readiness: {}", error);
                }
            }
        }
    }

    impl Timer {
        /// Create a disarmed timer and register it with the event loop.
        ///
        /// # Errors
        ///
        /// Returns an error if the pipe cannot be created or registered.
        pub fn new(event_loop: &mut EventLoop, mut function: TimerCallback) -> Result<Self> {
            let pipe = Arc::new(Pipe::new(
                PipeFlags::NON_BLOCKING_READ | PipeFlags::NON_BLOCKING_WRITE,
            )?);

            let worker = Arc::new(Worker {
                state: Mutex::new(WorkerState {
                    next: None,
                    interval: Duration::ZERO,
                    shutdown: false,
                }),
                changed: Condvar::new(),
            });

            let drain_pipe = Arc::clone(&pipe);

            event_loop.add_source(
                pipe.read_handle(),
                SourceType::Generic,
                Events::READ,
                Some(callback(move |_event_loop| {
                    let mut scratch = [0u8; 32];
                    let mut expired = false;

                    loop {
                        match drain_pipe.read(&mut scratch) {
                            Ok(0) => break,
                            Ok(_) => expired = true,
                            Err(error) if error.is_would_block() => break,
                            Err(error) => {
                                log_error!("Could not drain timer pipe: {}", error);

                                break;
                            }
                        }
                    }

                    if expired {
                        function();
                    }
                })),
                None,
            )?;

            let thread_worker = Arc::clone(&worker);
            let thread_pipe = Arc::clone(&pipe);
            let thread = Thread::spawn("timer", move || {
                worker_main(&thread_worker, &thread_pipe);
            });

            log_debug!("Created timer (handle: {})", pipe.read_handle());

            Ok(Self {
                pipe,
                worker,
                thread: Some(thread),
            })
        }

        /// The timer's event-source handle.
        #[must_use]
        pub fn handle(&self) -> IoHandle {
            self.pipe.read_handle()
        }

        /// Arm the timer: first expiration after `delay`, then every
        /// `interval` (a zero interval makes it one-shot). A zero `delay`
        /// disarms the timer.
        ///
        /// # Errors
        ///
        /// Currently infallible; mirrors the timerfd implementation.
        pub fn configure(&self, delay: Duration, interval: Duration) -> Result<()> {
            let mut state = self.worker.state.lock();

            state.next = if delay.is_zero() {
                None
            } else {
                Some(Instant::now() + delay)
            };
            state.interval = interval;

            self.worker.changed.notify_all();

            Ok(())
        }

        /// Remove the timer from the event loop and stop the worker.
        pub fn destroy(mut self, event_loop: &mut EventLoop) {
            log_debug!("Destroying timer (handle: {})", self.handle());

            {
                let mut state = self.worker.state.lock();
                state.shutdown = true;
                self.worker.changed.notify_all();
            }

            if let Some(thread) = self.thread.take() {
                thread.join();
            }

            event_loop.remove_source(self.pipe.read_handle(), SourceType::Generic);
        }
    }

    impl Drop for Timer {
        fn drop(&mut self) {
            if self.thread.is_some() {
                let mut state = self.worker.state.lock();
                state.shutdown = true;
                self.worker.changed.notify_all();
                drop(state);

                if let Some(thread) = self.thread.take() {
                    thread.join();
                }
            }
        }
    }
}

pub use platform::Timer;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_poll::PollMultiplexor;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_periodic_timer_fires_and_stops_loop() {
        let _logger_guard = crate::log::test_support::LOGGER_TEST_GUARD.lock();
        let mut event_loop =
            EventLoop::with_multiplexor(Box::new(PollMultiplexor::new())).unwrap();

        let expirations = Rc::new(RefCell::new(0u32));
        let expirations_cb = Rc::clone(&expirations);
        let stop_handle = event_loop.stop_handle();

        let timer = Timer::new(
            &mut event_loop,
            Box::new(move || {
                let mut count = expirations_cb.borrow_mut();
                *count += 1;

                if *count >= 3 {
                    stop_handle.stop();
                }
            }),
        )
        .unwrap();

        timer
            .configure(Duration::from_millis(5), Duration::from_millis(5))
            .unwrap();

        event_loop.run(|_| {}).unwrap();

        assert!(*expirations.borrow() >= 3);
        timer.destroy(&mut event_loop);
    }

    #[test]
    fn test_zero_delay_disarms() {
        let _logger_guard = crate::log::test_support::LOGGER_TEST_GUARD.lock();
        let mut event_loop =
            EventLoop::with_multiplexor(Box::new(PollMultiplexor::new())).unwrap();

        let fired = Rc::new(RefCell::new(false));
        let fired_cb = Rc::clone(&fired);

        let timer = Timer::new(
            &mut event_loop,
            Box::new(move || {
                *fired_cb.borrow_mut() = true;
            }),
        )
        .unwrap();

        timer
            .configure(Duration::from_millis(5), Duration::from_millis(5))
            .unwrap();
        timer.configure(Duration::ZERO, Duration::ZERO).unwrap();

        // Give a disarmed timer a chance to (incorrectly) fire, then stop.
        let stop_handle = event_loop.stop_handle();
        let stopper = crate::sync::Thread::spawn("stopper", move || {
            std::thread::sleep(Duration::from_millis(40));
            stop_handle.stop();
        });

        event_loop.run(|_| {}).unwrap();
        stopper.join();

        assert!(!*fired.borrow());
        timer.destroy(&mut event_loop);
    }
}
