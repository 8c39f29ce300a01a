//! Runtime update channel frame codec.
//!
//! Once the device has booted into application firmware, updates are not
//! pushed over YModem; the application speaks this simpler request/reply
//! framing instead. The host asks the device to mark an upgrade as pending,
//! the device stamps a flag word in flash, replies, and resets into the
//! bootloader which then runs the YModem transfer.
//!
//! ## Frame format
//!
//! ```text
//! +--------+-----+------+-----+-----+---------+-------+
//! | magic  | num | ~num | len (LE)  | payload | crc16 |
//! +--------+-----+------+-----------+---------+-------+
//! | 2      | 1   | 1    | 2         | len     | 2     |
//! +--------+-----+------+-----------+---------+-------+
//! | 0xAC6D |                          cmd+body        |
//! +--------+-------------------------------------------+
//! ```
//!
//! The CRC16 covers the payload only and is seeded with 0xA28C so that a
//! frame body cannot masquerade as a YModem packet trailer. Any validation
//! failure discards the frame whole; the link resyncs on the next magic byte
//! pair.

use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, trace};

use crate::error::{Error, Result};
use crate::flash::{Flash, layout};
use crate::protocol::crc::crc16;
use crate::transport::Transport;

/// Frame magic, transmitted little-endian (0x6D, 0xAC).
pub const FRAME_MAGIC: u16 = 0xAC6D;

/// CRC16 initial value for this channel.
pub const CRC_INIT: u16 = 0xA28C;

/// Minimum payload length (the command byte).
pub const MIN_PAYLOAD: usize = 1;

/// Maximum payload length (command byte + 1024-byte body + address word).
pub const MAX_PAYLOAD: usize = 1 + 1024 + 4;

/// Reply result code for success.
pub const RESULT_OK: u8 = 0x00;

/// Reply result code for failure.
pub const RESULT_ERR: u8 = 0x01;

/// Commands understood by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Link probe, no side effect.
    Handshake = 0x01,
    /// Write the upgrade-pending flag word and reset into the bootloader.
    ScheduleUpgrade = 0x02,
}

impl TryFrom<u8> for Command {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Handshake),
            0x02 => Ok(Self::ScheduleUpgrade),
            other => Err(Error::Protocol(format!("unknown command {other:#04x}"))),
        }
    }
}

/// One frame on the runtime update channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Sequence byte; replies echo the request's sequence.
    pub seq: u8,
    /// Command.
    pub cmd: Command,
    /// Command body (result byte, address, data).
    pub body: Vec<u8>,
}

impl Frame {
    /// Create a frame.
    pub fn new(seq: u8, cmd: Command, body: Vec<u8>) -> Self {
        Self { seq, cmd, body }
    }

    /// Handshake request.
    pub fn handshake(seq: u8) -> Self {
        Self::new(seq, Command::Handshake, Vec::new())
    }

    /// Upgrade request.
    pub fn schedule_upgrade(seq: u8) -> Self {
        Self::new(seq, Command::ScheduleUpgrade, Vec::new())
    }

    /// Serialize to wire bytes.
    #[allow(clippy::cast_possible_truncation)] // payload length is bounded
    pub fn build(&self) -> Vec<u8> {
        let payload_len = 1 + self.body.len();
        debug_assert!((MIN_PAYLOAD..=MAX_PAYLOAD).contains(&payload_len));

        let mut buf = Vec::with_capacity(8 + payload_len);
        buf.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
        buf.push(self.seq);
        buf.push(!self.seq);

        let mut len_bytes = [0u8; 2];
        LittleEndian::write_u16(&mut len_bytes, payload_len as u16);
        buf.extend_from_slice(&len_bytes);

        buf.push(self.cmd as u8);
        buf.extend_from_slice(&self.body);

        let crc = crc16(CRC_INIT, &buf[6..6 + payload_len]);
        let mut crc_bytes = [0u8; 2];
        LittleEndian::write_u16(&mut crc_bytes, crc);
        buf.extend_from_slice(&crc_bytes);

        buf
    }

    /// Parse a complete frame buffer.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 8 + MIN_PAYLOAD {
            return Err(Error::Protocol("frame too short".into()));
        }
        if LittleEndian::read_u16(&bytes[0..2]) != FRAME_MAGIC {
            return Err(Error::Protocol("bad frame magic".into()));
        }
        let seq = bytes[2];
        if seq.wrapping_add(bytes[3]) != 0xFF {
            return Err(Error::Protocol("sequence complement mismatch".into()));
        }
        let len = LittleEndian::read_u16(&bytes[4..6]) as usize;
        if !(MIN_PAYLOAD..=MAX_PAYLOAD).contains(&len) {
            return Err(Error::Protocol(format!("payload length {len} out of range")));
        }
        if bytes.len() != 8 + len {
            return Err(Error::Protocol("frame length mismatch".into()));
        }

        let payload = &bytes[6..6 + len];
        let expected = LittleEndian::read_u16(&bytes[6 + len..8 + len]);
        let actual = crc16(CRC_INIT, payload);
        if actual != expected {
            return Err(Error::CrcMismatch { expected, actual });
        }

        Ok(Self {
            seq,
            cmd: Command::try_from(payload[0])?,
            body: payload[1..].to_vec(),
        })
    }
}

/// Read one frame off the transport, resynchronizing on the magic pair.
///
/// `byte_timeout` bounds each blocking read and also caps the magic hunt as
/// a whole, so a link streaming garbage returns [`Error::Timeout`] instead of
/// stalling the caller; the caller can then check its inactivity window.
pub fn read_frame<T: Transport>(transport: &mut T, byte_timeout: Duration) -> Result<Frame> {
    let magic = FRAME_MAGIC.to_le_bytes();
    let hunt_deadline = Instant::now() + byte_timeout;

    // Hunt for the magic byte pair. A failed second byte may itself be the
    // lead of the real pair, so it stays a candidate instead of being
    // discarded.
    let mut byte = transport.recv_byte(byte_timeout)?;
    loop {
        if byte == magic[0] {
            let second = transport.recv_byte(byte_timeout)?;
            if second == magic[1] {
                break;
            }
            trace!("resync: {second:#04x} after magic lead byte");
            byte = second;
        } else {
            byte = transport.recv_byte(byte_timeout)?;
        }
        if Instant::now() >= hunt_deadline {
            return Err(Error::Timeout(format!(
                "no frame magic within {} ms",
                byte_timeout.as_millis()
            )));
        }
    }

    let mut head = [0u8; 4];
    transport.recv(&mut head, byte_timeout)?;
    let seq = head[0];
    if seq.wrapping_add(head[1]) != 0xFF {
        return Err(Error::Protocol("sequence complement mismatch".into()));
    }
    let len = LittleEndian::read_u16(&head[2..4]) as usize;
    if !(MIN_PAYLOAD..=MAX_PAYLOAD).contains(&len) {
        return Err(Error::Protocol(format!("payload length {len} out of range")));
    }

    let mut rest = vec![0u8; len + 2];
    transport.recv(&mut rest, byte_timeout)?;

    let payload = &rest[..len];
    let expected = LittleEndian::read_u16(&rest[len..]);
    let actual = crc16(CRC_INIT, payload);
    if actual != expected {
        return Err(Error::CrcMismatch { expected, actual });
    }

    Ok(Frame {
        seq,
        cmd: Command::try_from(payload[0])?,
        body: payload[1..].to_vec(),
    })
}

/// Send a request and wait for the matching reply, returning the result byte.
pub fn send_request<T: Transport>(
    transport: &mut T,
    request: &Frame,
    timeout: Duration,
) -> Result<u8> {
    transport.send(&request.build())?;
    let reply = read_frame(transport, timeout)?;
    if reply.seq != request.seq {
        return Err(Error::Protocol(format!(
            "reply sequence {} does not match request {}",
            reply.seq, request.seq
        )));
    }
    reply
        .body
        .first()
        .copied()
        .ok_or_else(|| Error::Protocol("reply carries no result byte".into()))
}

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct ModemConfig {
    /// Absolute address of the upgrade-pending flag word.
    pub upgrade_flag_addr: u32,
    /// Per-read timeout while hunting for a frame.
    pub byte_timeout: Duration,
    /// Inactivity window: no valid frame within this span ends the loop.
    pub window: Duration,
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            upgrade_flag_addr: layout::DEFAULT_UPGRADE_FLAG_ADDR,
            byte_timeout: Duration::from_millis(100),
            window: Duration::from_secs(10),
        }
    }
}

/// Runtime update channel dispatcher (device side).
pub struct Modem<'a, T: Transport, F: Flash> {
    transport: &'a mut T,
    flash: &'a mut F,
    config: ModemConfig,
    reset: Option<Box<dyn FnMut() + 'a>>,
}

impl<'a, T: Transport, F: Flash> Modem<'a, T, F> {
    /// Create a dispatcher over the given transport and flash.
    pub fn new(transport: &'a mut T, flash: &'a mut F, config: ModemConfig) -> Self {
        Self {
            transport,
            flash,
            config,
            reset: None,
        }
    }

    /// Install the system reset hook invoked after a successful upgrade
    /// command.
    #[must_use]
    pub fn with_reset(mut self, reset: impl FnMut() + 'a) -> Self {
        self.reset = Some(Box::new(reset));
        self
    }

    /// Run the receive/execute/reply loop.
    ///
    /// Returns `Ok(())` once an upgrade has been scheduled (after invoking
    /// the reset hook), or [`Error::Timeout`] when no valid frame arrives
    /// within the inactivity window. Invalid frames are discarded and do not
    /// refresh the window.
    pub fn process(&mut self) -> Result<()> {
        let window = self.config.window;
        let mut deadline = Instant::now() + window;

        loop {
            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "no valid frame within {} ms",
                    window.as_millis()
                )));
            }

            match read_frame(self.transport, self.config.byte_timeout) {
                Ok(frame) => {
                    deadline = Instant::now() + window;
                    let (result, upgrade) = self.execute(&frame);
                    let reply = Frame::new(frame.seq, frame.cmd, vec![result]);
                    self.transport.send(&reply.build())?;

                    if upgrade {
                        debug!("upgrade scheduled, resetting");
                        if let Some(reset) = self.reset.as_mut() {
                            reset();
                        }
                        return Ok(());
                    }
                },
                // Garbage or a half frame: drop it and resync
                Err(Error::Timeout(_)) | Err(Error::Protocol(_)) | Err(Error::CrcMismatch { .. }) => {},
                Err(e) => return Err(e),
            }
        }
    }

    /// Execute a command, returning (result byte, upgrade-scheduled).
    fn execute(&mut self, frame: &Frame) -> (u8, bool) {
        match frame.cmd {
            Command::Handshake => {
                trace!("handshake from peer (seq {})", frame.seq);
                (RESULT_OK, false)
            },
            Command::ScheduleUpgrade => {
                let word = layout::UPGRADE_PENDING_MAGIC.to_le_bytes();
                match self.flash.write(self.config.upgrade_flag_addr, &word) {
                    Ok(()) => (RESULT_OK, true),
                    Err(e) => {
                        debug!("upgrade flag write failed: {e}");
                        (RESULT_ERR, false)
                    },
                }
            },
        }
    }
}
