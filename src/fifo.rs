//! A bounded, thread-safe byte FIFO with blocking and non-blocking access.
//!
//! The FIFO is a ring buffer of fixed length `L` holding at most `L - 1`
//! bytes; one slot is sacrificed to distinguish a full ring from an empty
//! one. Writes never short-write: a blocking [`write`](Fifo::write) loops
//! until the whole buffer has been copied in, waking readers every time
//! bytes become available. Reads may short-read.
//!
//! [`shutdown`](Fifo::shutdown) releases every blocked thread: blocked
//! readers drain what is left and then observe end-of-stream (a read of 0),
//! blocked writers fail with [`ErrorKind::BrokenPipe`](crate::ErrorKind).

use crate::error::{Error, Result};
use crate::sync::{Condvar, Mutex};

struct Ring {
    buffer: Box<[u8]>,
    begin: usize,
    end: usize,
    shutdown: bool,
}

impl Ring {
    fn writable_at_all(&self) -> usize {
        if self.begin <= self.end {
            self.buffer.len() - (self.end - self.begin) - 1
        } else {
            self.begin - self.end - 1
        }
    }

    // Contiguous writable region at `end`; a write may have to be split in
    // two when the free space wraps around the end of the buffer.
    fn writable_at_once(&self) -> usize {
        if self.begin <= self.end {
            if self.begin == 0 {
                self.buffer.len() - self.end - 1
            } else {
                self.buffer.len() - self.end
            }
        } else {
            self.begin - self.end - 1
        }
    }

    fn readable_at_all(&self) -> usize {
        if self.begin <= self.end {
            self.end - self.begin
        } else {
            self.buffer.len() - (self.begin - self.end)
        }
    }

    fn readable_at_once(&self) -> usize {
        if self.begin <= self.end {
            self.end - self.begin
        } else {
            self.buffer.len() - self.begin
        }
    }
}

/// A bounded blocking/non-blocking byte ring buffer shared between threads.
pub struct Fifo {
    ring: Mutex<Ring>,
    writable: Condvar,
    readable: Condvar,
}

impl Fifo {
    /// Create a FIFO with a ring of `length` bytes, holding up to
    /// `length - 1` bytes of data.
    ///
    /// # Panics
    ///
    /// Panics if `length < 2`; such a ring could not hold any data.
    #[must_use]
    pub fn new(length: usize) -> Self {
        assert!(length >= 2, "FIFO ring must be at least 2 bytes long");

        Self {
            ring: Mutex::new(Ring {
                buffer: vec![0; length].into_boxed_slice(),
                begin: 0,
                end: 0,
                shutdown: false,
            }),
            writable: Condvar::new(),
            readable: Condvar::new(),
        }
    }

    /// Number of bytes this FIFO can hold (`length - 1`).
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.ring.lock().buffer.len() - 1
    }

    /// Write all of `buffer`, blocking while the ring is full.
    ///
    /// Readers are woken every time bytes are copied in, so a buffer larger
    /// than the current free space is delivered incrementally. Returns the
    /// number of bytes written, which equals `buffer.len()`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::BrokenPipe`](crate::ErrorKind) if the FIFO is or
    /// becomes shut down; bytes copied in before the shutdown remain
    /// readable, but the write as a whole has failed.
    pub fn write(&self, buffer: &[u8]) -> Result<usize> {
        self.write_impl(buffer, true)
    }

    /// Write all of `buffer` without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::TooBig`](crate::ErrorKind) if `buffer` exceeds
    /// the FIFO capacity, [`ErrorKind::WouldBlock`](crate::ErrorKind) if the
    /// free space is currently insufficient, and
    /// [`ErrorKind::BrokenPipe`](crate::ErrorKind) after a shutdown.
    pub fn try_write(&self, buffer: &[u8]) -> Result<usize> {
        self.write_impl(buffer, false)
    }

    fn write_impl(&self, buffer: &[u8], blocking: bool) -> Result<usize> {
        let mut ring = self.ring.lock();

        if ring.shutdown {
            return Err(Error::broken_pipe("FIFO is shut down"));
        }

        if buffer.is_empty() {
            return Ok(0);
        }

        if !blocking {
            if buffer.len() > ring.buffer.len() - 1 {
                return Err(Error::too_big(format!(
                    "write of {} bytes exceeds FIFO capacity of {} bytes",
                    buffer.len(),
                    ring.buffer.len() - 1
                )));
            }

            if buffer.len() > ring.writable_at_all() {
                return Err(Error::would_block("FIFO has insufficient free space"));
            }
        }

        let mut written = 0;

        while written < buffer.len() {
            if blocking {
                while ring.writable_at_all() == 0 {
                    self.writable.wait(&mut ring);

                    // No point in writing any remaining data now. Depending
                    // on thread scheduling a reader might already have
                    // returned 0 (end-of-stream) between the writable
                    // condition being signalled and this thread acting on
                    // it, so give up here.
                    if ring.shutdown {
                        return Err(Error::broken_pipe("FIFO was shut down during write"));
                    }
                }
            }

            let writable = ring.writable_at_once().min(buffer.len() - written);
            let end = ring.end;

            ring.buffer[end..end + writable].copy_from_slice(&buffer[written..written + writable]);

            ring.end = (end + writable) % ring.buffer.len();
            written += writable;

            self.readable.notify_all();
        }

        Ok(written)
    }

    /// Read up to `buffer.len()` bytes, blocking while the ring is empty.
    ///
    /// May short-read: returns as soon as any bytes are available. Returns
    /// `Ok(0)` (end-of-stream) once the FIFO is shut down and drained.
    ///
    /// # Errors
    ///
    /// Currently infallible in blocking mode; the `Result` mirrors
    /// [`try_read`](Self::try_read).
    pub fn read(&self, buffer: &mut [u8]) -> Result<usize> {
        self.read_impl(buffer, true)
    }

    /// Read up to `buffer.len()` bytes without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::WouldBlock`](crate::ErrorKind) if the ring is
    /// empty and not shut down.
    pub fn try_read(&self, buffer: &mut [u8]) -> Result<usize> {
        self.read_impl(buffer, false)
    }

    fn read_impl(&self, buffer: &mut [u8], blocking: bool) -> Result<usize> {
        let mut ring = self.ring.lock();

        if buffer.is_empty() {
            return Ok(0);
        }

        if ring.readable_at_all() == 0 {
            if ring.shutdown {
                return Ok(0);
            }

            if !blocking {
                return Err(Error::would_block("FIFO is empty"));
            }
        }

        if blocking {
            while ring.readable_at_all() == 0 {
                self.readable.wait(&mut ring);

                if ring.shutdown {
                    break;
                }
            }
        }

        let mut read = 0;

        while ring.readable_at_all() > 0 && read < buffer.len() {
            let readable = ring.readable_at_once().min(buffer.len() - read);
            let begin = ring.begin;

            buffer[read..read + readable].copy_from_slice(&ring.buffer[begin..begin + readable]);

            ring.begin = (begin + readable) % ring.buffer.len();
            read += readable;

            self.writable.notify_all();
        }

        Ok(read)
    }

    /// Shut the FIFO down, waking all blocked readers and writers.
    ///
    /// Subsequent writes fail with
    /// [`ErrorKind::BrokenPipe`](crate::ErrorKind); reads drain the
    /// remaining bytes and then return 0.
    pub fn shutdown(&self) {
        let mut ring = self.ring.lock();

        ring.shutdown = true;

        self.writable.notify_all();
        self.readable.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::sync::Thread;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_round_trip() {
        let fifo = Fifo::new(16);
        let payload = b"hello ring";

        assert_eq!(fifo.try_write(payload).unwrap(), payload.len());

        let mut readback = [0u8; 16];
        let n = fifo.try_read(&mut readback).unwrap();
        assert_eq!(&readback[..n], payload);
    }

    #[test]
    fn test_capacity_is_length_minus_one() {
        let fifo = Fifo::new(8);
        assert_eq!(fifo.capacity(), 7);

        assert!(fifo.try_write(&[0u8; 7]).is_ok());
        let err = fifo.try_write(&[0u8; 1]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);
    }

    #[test]
    fn test_oversized_non_blocking_write_is_too_big() {
        let fifo = Fifo::new(8);
        let err = fifo.try_write(&[0u8; 8]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TooBig);
    }

    #[test]
    fn test_empty_non_blocking_read_would_block() {
        let fifo = Fifo::new(8);
        let mut buffer = [0u8; 4];
        let err = fifo.try_read(&mut buffer).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);
    }

    #[test]
    fn test_wrap_around_two_region_copy() {
        // Advance begin/end so that a subsequent write straddles the end of
        // the ring and has to be split into two copies.
        let fifo = Fifo::new(8);
        let mut scratch = [0u8; 8];

        assert_eq!(fifo.try_write(&[1, 2, 3, 4, 5]).unwrap(), 5);
        assert_eq!(fifo.try_read(&mut scratch).unwrap(), 5);
        assert_eq!(&scratch[..5], &[1, 2, 3, 4, 5]);

        let payload = [10, 20, 30, 40, 50, 60];
        assert_eq!(fifo.try_write(&payload).unwrap(), 6);

        let n = fifo.try_read(&mut scratch).unwrap();
        assert_eq!(&scratch[..n], &payload);
    }

    #[test]
    fn test_write_on_shut_down_fifo_is_broken_pipe() {
        let fifo = Fifo::new(8);
        fifo.shutdown();

        let err = fifo.write(&[1]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BrokenPipe);

        let err = fifo.try_write(&[1]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_read_on_shut_down_fifo_drains_then_eof() {
        let fifo = Fifo::new(8);
        fifo.try_write(&[9, 8, 7]).unwrap();
        fifo.shutdown();

        let mut buffer = [0u8; 8];
        assert_eq!(fifo.read(&mut buffer).unwrap(), 3);
        assert_eq!(&buffer[..3], &[9, 8, 7]);
        assert_eq!(fifo.read(&mut buffer).unwrap(), 0);
    }

    #[test]
    fn test_blocked_reader_released_by_writer() {
        let fifo = Arc::new(Fifo::new(8));

        let reader = {
            let fifo = Arc::clone(&fifo);
            Thread::spawn("fifo-reader", move || {
                let mut buffer = [0u8; 4];
                let n = fifo.read(&mut buffer).unwrap();
                assert_eq!(&buffer[..n], &[42]);
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        fifo.write(&[42]).unwrap();
        reader.join();
    }

    #[test]
    fn test_blocked_reader_released_by_shutdown() {
        let fifo = Arc::new(Fifo::new(8));

        let reader = {
            let fifo = Arc::clone(&fifo);
            Thread::spawn("fifo-reader", move || {
                let mut buffer = [0u8; 4];
                assert_eq!(fifo.read(&mut buffer).unwrap(), 0);
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        fifo.shutdown();
        reader.join();
    }

    #[test]
    fn test_blocked_writer_released_by_shutdown() {
        let fifo = Arc::new(Fifo::new(8));
        fifo.try_write(&[0u8; 7]).unwrap();

        let writer = {
            let fifo = Arc::clone(&fifo);
            Thread::spawn("fifo-writer", move || {
                let err = fifo.write(&[1, 2, 3]).unwrap_err();
                assert_eq!(err.kind(), ErrorKind::BrokenPipe);
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        fifo.shutdown();
        writer.join();
    }

    #[test]
    fn test_blocking_write_larger_than_capacity_is_delivered_incrementally() {
        let fifo = Arc::new(Fifo::new(8));
        let payload: Vec<u8> = (0..32).collect();

        let writer = {
            let fifo = Arc::clone(&fifo);
            let payload = payload.clone();
            Thread::spawn("fifo-writer", move || {
                assert_eq!(fifo.write(&payload).unwrap(), payload.len());
            })
        };

        let mut collected = Vec::new();
        let mut buffer = [0u8; 4];

        while collected.len() < payload.len() {
            let n = fifo.read(&mut buffer).unwrap();
            collected.extend_from_slice(&buffer[..n]);
        }

        writer.join();
        assert_eq!(collected, payload);
    }
}
