//! Uniform I/O handle abstraction.
//!
//! Everything the core reads from or writes to (files, pipes, sockets and
//! the logger's output sink) goes through the [`Io`] trait: a raw OS
//! [`IoHandle`] for the event loop, `read`/`write` with the crate's error
//! mapping, and an optional [`status`](Io::status) report used by the log
//! rotation trigger.

use std::fs;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;

use crate::error::Result;

/// Raw OS handle of an I/O object, as consumed by the event loop.
pub type IoHandle = RawFd;

/// Status report of an I/O object that can describe itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoStatus {
    /// Current size in bytes (for regular files, the file length).
    pub size: u64,
}

/// A readable and writable OS object with a raw handle.
pub trait Io {
    /// The raw handle, suitable for event-loop registration.
    fn handle(&self) -> IoHandle;

    /// Read up to `buffer.len()` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::WouldBlock`](crate::ErrorKind) if the object is
    /// non-blocking and no data is available, or
    /// [`ErrorKind::Io`](crate::ErrorKind) on hard failure.
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize>;

    /// Write up to `buffer.len()` bytes, returning how many were accepted.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::WouldBlock`](crate::ErrorKind) if the object is
    /// non-blocking and cannot accept data right now, or
    /// [`ErrorKind::Io`](crate::ErrorKind) on hard failure.
    fn write(&mut self, buffer: &[u8]) -> Result<usize>;

    /// Current status, if the object can report one.
    ///
    /// The default implementation reports nothing; regular files report
    /// their size so the log rotation trigger can watch it.
    fn status(&self) -> Option<IoStatus> {
        None
    }
}

/// A regular file.
#[derive(Debug)]
pub struct File {
    inner: fs::File,
}

impl File {
    /// Open an existing file for reading and writing.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::NotFound`](crate::ErrorKind) if the file does
    /// not exist, [`ErrorKind::Io`](crate::ErrorKind) otherwise.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let inner = fs::OpenOptions::new().read(true).write(true).open(path)?;

        Ok(Self { inner })
    }

    /// Create a file if needed and open it for appending output, e.g. as a
    /// log sink.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Io`](crate::ErrorKind) if the file cannot be
    /// created.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let inner = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;

        Ok(Self { inner })
    }
}

impl Io for File {
    fn handle(&self) -> IoHandle {
        self.inner.as_raw_fd()
    }

    fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        Ok(self.inner.read(buffer)?)
    }

    fn write(&mut self, buffer: &[u8]) -> Result<usize> {
        Ok(self.inner.write(buffer)?)
    }

    fn status(&self) -> Option<IoStatus> {
        self.inner
            .metadata()
            .ok()
            .map(|metadata| IoStatus {
                size: metadata.len(),
            })
    }
}

/// The process's standard error stream, the default log sink.
pub struct Stderr;

impl Io for Stderr {
    fn handle(&self) -> IoHandle {
        std::io::stderr().as_raw_fd()
    }

    fn read(&mut self, _buffer: &mut [u8]) -> Result<usize> {
        Ok(0)
    }

    fn write(&mut self, buffer: &[u8]) -> Result<usize> {
        let mut stderr = std::io::stderr().lock();
        let written = stderr.write(buffer)?;
        stderr.flush()?;

        Ok(written)
    }
}

impl Io for TcpStream {
    fn handle(&self) -> IoHandle {
        self.as_raw_fd()
    }

    fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        Ok(Read::read(self, buffer)?)
    }

    fn write(&mut self, buffer: &[u8]) -> Result<usize> {
        Ok(Write::write(self, buffer)?)
    }
}

impl Io for UnixStream {
    fn handle(&self) -> IoHandle {
        self.as_raw_fd()
    }

    fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        Ok(Read::read(self, buffer)?)
    }

    fn write(&mut self, buffer: &[u8]) -> Result<usize> {
        Ok(Write::write(self, buffer)?)
    }
}

/// True if `handle` refers to a terminal.
#[must_use]
pub fn is_tty(handle: IoHandle) -> bool {
    // SAFETY: isatty inspects the descriptor without touching memory.
    unsafe { libc::isatty(handle) == 1 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn test_file_round_trip_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("io.bin");

        let mut file = File::create(&path).unwrap();
        assert_eq!(file.write(b"abcdef").unwrap(), 6);
        assert_eq!(file.status().unwrap().size, 6);

        let mut reopened = File::open(&path).unwrap();
        let mut buffer = [0u8; 16];
        let n = reopened.read(&mut buffer).unwrap();
        assert_eq!(&buffer[..n], b"abcdef");
    }

    #[test]
    fn test_open_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = File::open(dir.path().join("absent")).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::NotFound);
    }

    #[test]
    fn test_socket_would_block_maps_to_would_block() {
        let (mut local, mut peer) = UnixStream::pair().unwrap();
        local.set_nonblocking(true).unwrap();

        let mut buffer = [0u8; 4];
        let err = Io::read(&mut local, &mut buffer).unwrap_err();
        assert!(err.is_would_block());

        peer.write_all(b"ping").unwrap();
        let n = Io::read(&mut local, &mut buffer).unwrap();
        assert_eq!(&buffer[..n], b"ping");
    }
}
