//! Byte transport abstraction.
//!
//! The protocol layers are I/O-agnostic: everything they need from the link
//! is "send these bytes" and "fill this buffer or time out". Serial ports get
//! a blanket implementation via the [`Port`](crate::port::Port) trait;
//! [`pair`] builds two in-process endpoints over shared ring buffers for
//! loopback transfers and tests.

use std::io::{Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::ringbuf::SharedRing;

/// Poll interval for the ring-buffer transport.
const POLL_INTERVAL: Duration = Duration::from_micros(200);

/// Safety ceiling for a blocking send into a full ring.
const SEND_STALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Blocking byte transport with per-call receive timeouts.
pub trait Transport {
    /// Send all bytes of `buf`.
    fn send(&mut self, buf: &[u8]) -> Result<()>;

    /// Fill `buf` completely, or fail with [`Error::Timeout`] once `timeout`
    /// elapses without the full count arriving.
    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<()>;

    /// Receive a single byte.
    fn recv_byte(&mut self, timeout: Duration) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.recv(&mut buf, timeout)?;
        Ok(buf[0])
    }
}

impl<P: crate::port::Port> Transport for P {
    fn send(&mut self, buf: &[u8]) -> Result<()> {
        self.write_all(buf)?;
        self.flush()?;
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<()> {
        self.set_timeout(timeout)?;
        match self.read_exact(buf) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Err(Error::Timeout(format!(
                "no data within {} ms",
                timeout.as_millis()
            ))),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

/// One endpoint of an in-process loopback link.
///
/// Each endpoint owns a receive ring filled by the peer; the serial reader
/// thread on a real deployment plays the role the peer's `send` plays here.
#[derive(Debug, Clone)]
pub struct RingTransport {
    tx: SharedRing,
    rx: SharedRing,
}

/// Create a connected pair of loopback endpoints, each direction buffered by
/// a ring of `capacity` bytes.
pub fn pair(capacity: usize) -> Result<(RingTransport, RingTransport)> {
    let a_to_b = SharedRing::new(capacity)?;
    let b_to_a = SharedRing::new(capacity)?;
    let a = RingTransport {
        tx: a_to_b.clone(),
        rx: b_to_a.clone(),
    };
    let b = RingTransport {
        tx: b_to_a,
        rx: a_to_b,
    };
    Ok((a, b))
}

impl Transport for RingTransport {
    fn send(&mut self, buf: &[u8]) -> Result<()> {
        let start = Instant::now();
        let mut sent = 0;
        while sent < buf.len() {
            sent += self.tx.write(&buf[sent..]);
            if sent < buf.len() {
                if start.elapsed() > SEND_STALL_TIMEOUT {
                    return Err(Error::Timeout("peer not draining ring".into()));
                }
                thread::park_timeout(POLL_INTERVAL);
            }
        }
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut got = 0;
        loop {
            got += self.rx.read(&mut buf[got..]);
            if got == buf.len() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "{got}/{} bytes within {} ms",
                    buf.len(),
                    timeout.as_millis()
                )));
            }
            thread::park_timeout(POLL_INTERVAL);
        }
    }
}

impl RingTransport {
    /// Drop any bytes already queued for this endpoint.
    pub fn drain(&mut self) {
        let mut sink = [0u8; 64];
        while self.rx.read(&mut sink) > 0 {}
    }
}
