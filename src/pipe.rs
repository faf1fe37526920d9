//! Pipes for injecting events into the event loop.
//!
//! A [`Pipe`] wraps a POSIX pipe. The read end is registered as an event
//! source; writing to the write end wakes the loop. The signal bridge and
//! the cross-thread [`StopHandle`](crate::event::StopHandle) are built on
//! this.

use std::os::unix::io::{AsRawFd, OwnedFd};

use bitflags::bitflags;
use nix::fcntl::OFlag;

use crate::error::Result;
use crate::io::{Io, IoHandle};

bitflags! {
    /// Creation flags for [`Pipe::new`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PipeFlags: u32 {
        /// Make the read end non-blocking.
        const NON_BLOCKING_READ = 1;
        /// Make the write end non-blocking.
        const NON_BLOCKING_WRITE = 2;
    }
}

/// A unidirectional pipe with optionally non-blocking ends.
pub struct Pipe {
    read_end: OwnedFd,
    write_end: OwnedFd,
}

fn set_non_blocking(fd: IoHandle) -> Result<()> {
    // SAFETY: fcntl on a descriptor we own; no memory is passed.
    let flags = nix::errno::Errno::result(unsafe { libc::fcntl(fd, libc::F_GETFL, 0) })?;
    nix::errno::Errno::result(unsafe {
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK)
    })?;

    Ok(())
}

impl Pipe {
    /// Create a pipe; both ends are close-on-exec.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Io`](crate::ErrorKind) if the pipe cannot be
    /// created or a non-blocking flag cannot be applied.
    pub fn new(flags: PipeFlags) -> Result<Self> {
        let (read_end, write_end) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;

        if flags.contains(PipeFlags::NON_BLOCKING_READ) {
            set_non_blocking(read_end.as_raw_fd())?;
        }

        if flags.contains(PipeFlags::NON_BLOCKING_WRITE) {
            set_non_blocking(write_end.as_raw_fd())?;
        }

        Ok(Self {
            read_end,
            write_end,
        })
    }

    /// The raw handle of the read end, for event-loop registration.
    #[must_use]
    pub fn read_handle(&self) -> IoHandle {
        self.read_end.as_raw_fd()
    }

    /// The raw handle of the write end.
    #[must_use]
    pub fn write_handle(&self) -> IoHandle {
        self.write_end.as_raw_fd()
    }

    /// Read from the read end, retrying on interruption.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::WouldBlock`](crate::ErrorKind) on an empty
    /// non-blocking read end, [`ErrorKind::Io`](crate::ErrorKind) otherwise.
    pub fn read(&self, buffer: &mut [u8]) -> Result<usize> {
        read_retrying(self.read_end.as_raw_fd(), buffer)
    }

    /// Write to the write end, retrying on interruption.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::WouldBlock`](crate::ErrorKind) on a full
    /// non-blocking write end, [`ErrorKind::Io`](crate::ErrorKind)
    /// otherwise.
    pub fn write(&self, buffer: &[u8]) -> Result<usize> {
        loop {
            // SAFETY: buffer is valid for buffer.len() bytes.
            let rc = unsafe {
                libc::write(
                    self.write_end.as_raw_fd(),
                    buffer.as_ptr().cast(),
                    buffer.len(),
                )
            };

            match nix::errno::Errno::result(rc) {
                Ok(n) => return Ok(usize::try_from(n).unwrap_or(0)),
                Err(nix::errno::Errno::EINTR) => {}
                Err(errno) => return Err(errno.into()),
            }
        }
    }
}

pub(crate) fn read_retrying(fd: IoHandle, buffer: &mut [u8]) -> Result<usize> {
    loop {
        // SAFETY: buffer is valid for buffer.len() bytes.
        let rc = unsafe { libc::read(fd, buffer.as_mut_ptr().cast(), buffer.len()) };

        match nix::errno::Errno::result(rc) {
            Ok(n) => return Ok(usize::try_from(n).unwrap_or(0)),
            Err(nix::errno::Errno::EINTR) => {}
            Err(errno) => return Err(errno.into()),
        }
    }
}

impl Io for Pipe {
    fn handle(&self) -> IoHandle {
        self.read_handle()
    }

    fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        Pipe::read(self, buffer)
    }

    fn write(&mut self, buffer: &[u8]) -> Result<usize> {
        Pipe::write(self, buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let pipe = Pipe::new(PipeFlags::empty()).unwrap();
        pipe.write(b"wake").unwrap();

        let mut buffer = [0u8; 8];
        let n = pipe.read(&mut buffer).unwrap();
        assert_eq!(&buffer[..n], b"wake");
    }

    #[test]
    fn test_non_blocking_read_on_empty_pipe() {
        let pipe = Pipe::new(PipeFlags::NON_BLOCKING_READ).unwrap();

        let mut buffer = [0u8; 8];
        let err = pipe.read(&mut buffer).unwrap_err();
        assert!(err.is_would_block());
    }
}
