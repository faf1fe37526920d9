//! # daemonlib: Building Blocks for Long-Running Services
//!
//! A foundation library for background services that must multiplex many
//! I/O handles, absorb OS signals, run timers and emit structured logs
//! without blocking the hot path. daemonlib is not itself a daemon; it
//! provides the primitives a daemon composes.
//!
//! ## Key Pieces
//!
//! - **Event loop**: level-triggered readiness multiplexing over `epoll`
//!   (Linux) or `poll` (other Unix), with a registry that tolerates
//!   adding, modifying and removing sources from inside callbacks
//! - **Asynchronous logger**: per-source debug filtering that can be
//!   reconfigured at runtime, a ring-buffer transport and a forward
//!   thread, so logging never blocks on the output device
//! - **FIFO**: a bounded, blocking-or-non-blocking, shutdown-aware byte
//!   ring buffer
//! - **Writer**: a per-connection outbound packet queue that converts
//!   would-block into event-driven draining, with a drop policy under
//!   backpressure
//! - **Signal bridge**: async-signal-safe delivery of `SIGINT`,
//!   `SIGTERM` and `SIGUSR1` into the event loop
//! - **Timer**: monotonic one-shot and periodic timers as event sources
//!
//! ## Quick Start
//!
//! ```no_run
//! use daemonlib::{log_source, log_info, EventLoop, SignalBridge};
//!
//! log_source!();
//!
//! fn main() -> daemonlib::Result<()> {
//!     daemonlib::log::init(&daemonlib::log::Config::default())?;
//!
//!     let mut event_loop = EventLoop::new()?;
//!     let signals = SignalBridge::new(
//!         &mut event_loop,
//!         Some(Box::new(|| {
//!             daemonlib::log::toggle_debug_override();
//!         })),
//!     )?;
//!
//!     log_info!("Service started");
//!
//!     // Register connection handles, timers etc., then:
//!     event_loop.run(|_event_loop| {})?;
//!
//!     signals.exit(&mut event_loop);
//!     daemonlib::log::exit();
//!
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod conf_file;
pub mod event;
#[cfg(target_os = "linux")]
pub mod event_epoll;
pub mod event_poll;
pub mod fifo;
pub mod io;
pub mod log;
pub mod packet;
pub mod pipe;
pub mod signal;
pub mod sync;
pub mod timer;
pub mod writer;

mod error;

pub use conf_file::{ConfFile, ConfFileWarning};
pub use error::{Error, ErrorKind, Result};
pub use event::{EventLoop, Events, SourceType, StopHandle};
pub use fifo::Fifo;
pub use io::{Io, IoHandle, IoStatus};
pub use log::{DebugGroups, LogLevel, LogSource};
pub use packet::{Packet, PacketHeader};
pub use pipe::{Pipe, PipeFlags};
pub use signal::SignalBridge;
pub use timer::Timer;
pub use writer::{WriteOutcome, Writer};

/// Version of the daemonlib library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
