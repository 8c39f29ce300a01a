//! YModem file transfer engine.
//!
//! Implements both sides of the YModem protocol used to push firmware images
//! over a UART link. The receiver drives the [`Flash`] capability to persist
//! data as packets arrive; the transmitter streams a byte buffer.
//!
//! ## Packet format
//!
//! ```text
//! +------+-----+------+----------------------+--------+--------+
//! | type | seq | ~seq |  payload (128|1024)  | crc_hi | crc_lo |
//! +------+-----+------+----------------------+--------+--------+
//! ```
//!
//! SOH carries a 128-byte payload, STX 1024 bytes. Packet 0 is the header:
//! `filename NUL size-string SP`, zero padded; an empty header closes the
//! session. The CRC16-XMODEM trailer covers the payload only.

use std::time::Duration;

use log::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::flash::{Flash, layout};
use crate::protocol::crc::crc16_xmodem;
use crate::transport::Transport;
use crate::util::{format_size, parse_size_bytes};

/// YModem control characters.
pub mod control {
    /// Start of Header (128-byte payload).
    pub const SOH: u8 = 0x01;
    /// Start of Text (1024-byte payload).
    pub const STX: u8 = 0x02;
    /// End of Transmission.
    pub const EOT: u8 = 0x04;
    /// Acknowledge.
    pub const ACK: u8 = 0x06;
    /// Not Acknowledge.
    pub const NAK: u8 = 0x15;
    /// Cancel.
    pub const CAN: u8 = 0x18;
    /// CRC16 mode request character.
    pub const C: u8 = 0x43;
    /// User abort character ('A').
    pub const ABORT1: u8 = 0x41;
    /// User abort character ('a').
    pub const ABORT2: u8 = 0x61;
    /// Payload padding for the tail of the last data packet.
    pub const PAD: u8 = 0x1A;
}

/// Payload size of an SOH packet.
pub const SOH_PAYLOAD: usize = 128;

/// Payload size of an STX packet.
pub const STX_PAYLOAD: usize = 1024;

/// Maximum filename length accepted from a header packet.
pub const MAX_FILENAME: usize = 256;

/// Consecutive-error budget shared by both sides.
pub const MAX_ERRORS: u32 = 5;

/// Build a raw packet: type, sequence pair, padded payload, CRC trailer.
fn build_packet(seq: u8, data: &[u8], use_stx: bool, pad: u8) -> Vec<u8> {
    let payload_size = if use_stx { STX_PAYLOAD } else { SOH_PAYLOAD };
    debug_assert!(data.len() <= payload_size);

    let mut packet = Vec::with_capacity(3 + payload_size + 2);
    packet.push(if use_stx { control::STX } else { control::SOH });
    packet.push(seq);
    packet.push(!seq);
    packet.extend_from_slice(data);
    packet.resize(3 + payload_size, pad);

    let crc = crc16_xmodem(&packet[3..3 + payload_size]);
    packet.push((crc >> 8) as u8);
    packet.push((crc & 0xFF) as u8);
    packet
}

/// Name and declared size of a received file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Filename from the header packet.
    pub name: String,
    /// Size declared in the header packet.
    pub size: u64,
}

/// Parse the header payload into filename and declared size.
///
/// Returns `Ok(None)` for the empty header that terminates the session.
fn parse_header(payload: &[u8]) -> Result<Option<FileInfo>> {
    if payload.first() == Some(&0) {
        return Ok(None);
    }

    let name_end = payload
        .iter()
        .take(MAX_FILENAME)
        .position(|&b| b == 0)
        .ok_or_else(|| Error::Protocol("header filename not terminated".into()))?;
    let name = String::from_utf8_lossy(&payload[..name_end]).into_owned();

    let size = parse_size_bytes(&payload[name_end + 1..])
        .ok_or_else(|| Error::Protocol(format!("header for '{name}' has no parsable size")))?;

    Ok(Some(FileInfo { name, size }))
}

/// Build the header payload: `filename NUL size SP`, zero padded to 128.
fn build_header(name: &str, size: u64) -> Vec<u8> {
    let size_str = format_size(size);
    // Leave room for NUL, size string, and the space terminator
    let name_max = SOH_PAYLOAD - size_str.len() - 2;
    let name_bytes = &name.as_bytes()[..name.len().min(name_max)];

    let mut payload = Vec::with_capacity(SOH_PAYLOAD);
    payload.extend_from_slice(name_bytes);
    payload.push(0);
    payload.extend_from_slice(size_str.as_bytes());
    payload.push(b' ');
    payload.resize(SOH_PAYLOAD, 0);
    payload
}

// ---------------------------------------------------------------------------
// Receiver
// ---------------------------------------------------------------------------

/// Receiver configuration.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Base address of the target flash region.
    pub base_addr: u32,
    /// Capacity of the target flash region in bytes.
    pub capacity: u64,
    /// Flash word stamped with the image-present magic after a complete
    /// file; `None` skips the marker.
    pub marker_addr: Option<u32>,
    /// Timeout for each blocking receive.
    pub packet_timeout: Duration,
    /// Consecutive transport-error budget once the session has begun.
    pub max_errors: u32,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            base_addr: layout::DEFAULT_APP_BASE,
            capacity: 0,
            marker_addr: Some(layout::DEFAULT_MARKER_ADDR),
            packet_timeout: Duration::from_millis(1000),
            max_errors: MAX_ERRORS,
        }
    }
}

/// Outcome of one attempt to read a packet off the wire.
enum Received {
    /// Validated packet.
    Packet { seq: u8, payload: Vec<u8> },
    /// End of transmission marker.
    Eot,
    /// Peer cancelled with a double CAN.
    PeerAbort,
    /// User abort character.
    UserAbort,
    /// Sequence or CRC mismatch, or stray byte. Discarded without reply.
    Garbage,
}

/// YModem receiver: accepts a file over `transport` and writes it into
/// `flash` at the configured region.
pub struct YmodemReceiver<'a, T: Transport, F: Flash> {
    transport: &'a mut T,
    flash: &'a mut F,
    config: ReceiverConfig,
}

impl<'a, T: Transport, F: Flash> YmodemReceiver<'a, T, F> {
    /// Create a receiver over the given transport and flash region.
    pub fn new(transport: &'a mut T, flash: &'a mut F, config: ReceiverConfig) -> Self {
        Self {
            transport,
            flash,
            config,
        }
    }

    /// Run a full receive session.
    ///
    /// Accepts files until the sender closes the session with an empty
    /// header, returning the last file's header info. A session that closes
    /// without transferring any file is a protocol error.
    pub fn receive(&mut self) -> Result<FileInfo> {
        let mut last = None;
        loop {
            match self.receive_file()? {
                Some(info) => last = Some(info),
                None => break,
            }
        }
        last.ok_or_else(|| Error::Protocol("session closed without a file".into()))
    }

    /// Receive one file; `Ok(None)` means the session terminator arrived.
    fn receive_file(&mut self) -> Result<Option<FileInfo>> {
        let mut info: Option<FileInfo> = None;
        let mut begun = false;
        let mut errors: u32 = 0;
        let mut expected_seq: u8 = 1;
        let mut cursor = self.config.base_addr;
        let mut remaining: u64 = 0;

        // Invite the sender into CRC16 mode
        self.transport.send(&[control::C])?;

        loop {
            match self.read_packet() {
                Err(Error::Timeout(_)) | Err(Error::Io(_)) => {
                    if begun {
                        errors += 1;
                        if errors > self.config.max_errors {
                            self.cancel()?;
                            return Err(Error::Protocol(format!(
                                "receive retry budget exhausted after {errors} errors"
                            )));
                        }
                    }
                    trace!("receive timeout, re-requesting CRC16 mode");
                    self.transport.send(&[control::C])?;
                },
                Err(e) => return Err(e),
                Ok(Received::Garbage) => {
                    // Silent discard: the sender retransmits on its own timeout
                    trace!("discarding invalid packet");
                },
                Ok(Received::UserAbort) => {
                    debug!("user abort character received");
                    return Err(Error::UserAbort);
                },
                Ok(Received::PeerAbort) => {
                    self.transport.send(&[control::ACK])?;
                    return Err(Error::PeerAbort);
                },
                Ok(Received::Eot) => {
                    self.transport.send(&[control::ACK])?;
                    if let Some(addr) = self.config.marker_addr {
                        self.flash
                            .write(addr, &layout::IMAGE_PRESENT_MAGIC.to_le_bytes())?;
                    }
                    debug!("EOT, file complete");
                    return Ok(info);
                },
                Ok(Received::Packet { seq, payload }) => {
                    if info.is_none() {
                        // Expecting the header packet
                        if seq != 0 {
                            trace!("data packet {seq} before header, NAK");
                            self.transport.send(&[control::NAK])?;
                            continue;
                        }
                        match parse_header(&payload)? {
                            None => {
                                self.transport.send(&[control::ACK])?;
                                debug!("empty header, session closed");
                                return Ok(None);
                            },
                            Some(header) => {
                                if header.size > self.config.capacity {
                                    warn!(
                                        "declared size {} exceeds region capacity {}",
                                        header.size, self.config.capacity
                                    );
                                    self.cancel()?;
                                    return Err(Error::SizeLimit {
                                        declared: header.size,
                                        capacity: self.config.capacity,
                                    });
                                }
                                debug!("receiving '{}' ({} bytes)", header.name, header.size);
                                self.flash.check_aligned(self.config.base_addr)?;
                                if let Err(e) = self
                                    .flash
                                    .erase(self.config.base_addr, header.size as usize)
                                {
                                    self.cancel()?;
                                    return Err(e);
                                }
                                remaining = header.size;
                                info = Some(header);
                                self.transport.send(&[control::ACK, control::C])?;
                            },
                        }
                    } else if seq != expected_seq {
                        trace!("sequence {seq}, expected {expected_seq}, NAK");
                        self.transport.send(&[control::NAK])?;
                    } else {
                        // Truncate the final packet's padding to the declared size
                        let take = (payload.len() as u64).min(remaining) as usize;
                        if take > 0 {
                            if let Err(e) = self.flash.write(cursor, &payload[..take]) {
                                self.cancel()?;
                                return Err(e);
                            }
                            cursor += take as u32;
                            remaining -= take as u64;
                        }
                        expected_seq = expected_seq.wrapping_add(1);
                        begun = true;
                        errors = 0;
                        self.transport.send(&[control::ACK])?;
                    }
                },
            }
        }
    }

    /// Read and validate one packet.
    fn read_packet(&mut self) -> Result<Received> {
        let timeout = self.config.packet_timeout;
        let first = self.transport.recv_byte(timeout)?;

        let payload_size = match first {
            control::SOH => SOH_PAYLOAD,
            control::STX => STX_PAYLOAD,
            control::EOT => return Ok(Received::Eot),
            control::ABORT1 | control::ABORT2 => return Ok(Received::UserAbort),
            control::CAN => {
                return match self.transport.recv_byte(timeout) {
                    Ok(control::CAN) => Ok(Received::PeerAbort),
                    _ => Ok(Received::Garbage),
                };
            },
            other => {
                trace!("unexpected packet type byte {other:#04x}");
                return Ok(Received::Garbage);
            },
        };

        let mut header = [0u8; 2];
        self.transport.recv(&mut header, timeout)?;
        let mut payload = vec![0u8; payload_size];
        self.transport.recv(&mut payload, timeout)?;
        let mut trailer = [0u8; 2];
        self.transport.recv(&mut trailer, timeout)?;

        let [seq, nseq] = header;
        if seq.wrapping_add(nseq) != 0xFF {
            trace!("sequence complement mismatch: {seq:#04x}/{nseq:#04x}");
            return Ok(Received::Garbage);
        }

        let expected = u16::from_be_bytes(trailer);
        let actual = crc16_xmodem(&payload);
        if actual != expected {
            trace!("CRC mismatch: expected {expected:#06x}, got {actual:#06x}");
            return Ok(Received::Garbage);
        }

        Ok(Received::Packet { seq, payload })
    }

    /// Abort the session with a double CAN.
    fn cancel(&mut self) -> Result<()> {
        self.transport.send(&[control::CAN, control::CAN])
    }
}

// ---------------------------------------------------------------------------
// Transmitter
// ---------------------------------------------------------------------------

/// Transmitter configuration.
#[derive(Debug, Clone)]
pub struct TransmitterConfig {
    /// Ceiling on the number of data packets, derived from the target region
    /// capacity divided by the 1024-byte packet size.
    pub max_packets: u32,
    /// Timeout for each acknowledgment wait.
    pub ack_timeout: Duration,
    /// Consecutive-error budget per packet.
    pub max_errors: u32,
}

impl Default for TransmitterConfig {
    fn default() -> Self {
        Self {
            max_packets: 1024,
            ack_timeout: Duration::from_millis(1000),
            max_errors: MAX_ERRORS,
        }
    }
}

/// Response to a sent packet.
enum Reply {
    Ack,
    Retry,
}

/// YModem transmitter: streams a byte buffer to a receiver over `transport`.
pub struct YmodemTransmitter<'a, T: Transport> {
    transport: &'a mut T,
    config: TransmitterConfig,
}

impl<'a, T: Transport> YmodemTransmitter<'a, T> {
    /// Create a transmitter over the given transport.
    pub fn new(transport: &'a mut T, config: TransmitterConfig) -> Self {
        Self { transport, config }
    }

    /// Transmit `data` as file `name`.
    ///
    /// Blocks until the receiver requests CRC16 mode, then sends the header,
    /// the data packets, EOT, and the empty closing header. `progress` is
    /// called with (bytes sent, total) after each acknowledged data packet.
    pub fn transmit<F>(&mut self, name: &str, data: &[u8], mut progress: F) -> Result<()>
    where
        F: FnMut(usize, usize),
    {
        let packets = data.len().div_ceil(STX_PAYLOAD) as u32;
        if packets > self.config.max_packets {
            return Err(Error::PacketLimit {
                packets,
                max: self.config.max_packets,
            });
        }

        debug!("transmitting '{}' ({} bytes)", name, data.len());
        self.wait_for_crc_request()?;

        // Header packet, then the receiver's follow-up 'C'
        let header = build_header(name, data.len() as u64);
        self.send_with_retry(&build_packet(0, &header, false, 0))?;
        self.consume_crc_request();

        let mut seq: u8 = 1;
        let mut offset = 0;
        let total = data.len();
        while offset < total {
            let remaining = total - offset;
            let use_stx = remaining > SOH_PAYLOAD;
            let chunk_len = remaining.min(if use_stx { STX_PAYLOAD } else { SOH_PAYLOAD });
            let chunk = &data[offset..offset + chunk_len];

            self.send_with_retry(&build_packet(seq, chunk, use_stx, control::PAD))?;
            offset += chunk_len;
            seq = seq.wrapping_add(1);
            progress(offset, total);
        }

        self.send_with_retry(&[control::EOT])?;
        self.consume_crc_request();

        self.send_closing(&build_packet(0, &[], false, 0))?;

        debug!("transmit complete");
        Ok(())
    }

    /// Block until the receiver's CRC16 mode request arrives.
    fn wait_for_crc_request(&mut self) -> Result<()> {
        debug!("waiting for receiver");
        loop {
            match self.transport.recv_byte(self.config.ack_timeout) {
                Ok(control::C) => return Ok(()),
                Ok(control::CAN) => {
                    if let Ok(control::CAN) = self.transport.recv_byte(self.config.ack_timeout) {
                        return Err(Error::PeerAbort);
                    }
                },
                Ok(other) => trace!("ignoring {other:#04x} while waiting for 'C'"),
                Err(Error::Timeout(_)) => {},
                Err(e) => return Err(e),
            }
        }
    }

    /// Swallow the 'C' the receiver sends after the header and after EOT.
    ///
    /// Absence is tolerated: some receivers go straight to data mode.
    fn consume_crc_request(&mut self) {
        match self.transport.recv_byte(self.config.ack_timeout) {
            Ok(control::C) => {},
            Ok(other) => trace!("expected 'C', got {other:#04x}"),
            Err(_) => {},
        }
    }

    /// Send `packet`, retrying until acknowledged or the error budget runs
    /// out.
    fn send_with_retry(&mut self, packet: &[u8]) -> Result<()> {
        let mut errors: u32 = 0;
        loop {
            self.transport.send(packet)?;
            match self.wait_reply()? {
                Reply::Ack => return Ok(()),
                Reply::Retry => {
                    errors += 1;
                    if errors > self.config.max_errors {
                        return Err(Error::Protocol(format!(
                            "no acknowledgment after {errors} attempts"
                        )));
                    }
                    trace!("retrying packet ({errors}/{})", self.config.max_errors);
                },
            }
        }
    }

    /// Send the empty header that closes the session.
    ///
    /// The data has all been acknowledged at this point, so any CAN in reply
    /// is a late abort rather than a request to retransmit.
    fn send_closing(&mut self, packet: &[u8]) -> Result<()> {
        let mut errors: u32 = 0;
        loop {
            self.transport.send(packet)?;
            match self.transport.recv_byte(self.config.ack_timeout) {
                Ok(control::ACK) => return Ok(()),
                Ok(control::CAN) => return Err(Error::PeerAbort),
                Ok(other) => trace!("unexpected reply {other:#04x} to closing header"),
                Err(Error::Timeout(_)) => {},
                Err(e) => return Err(e),
            }
            errors += 1;
            if errors > self.config.max_errors {
                return Err(Error::Protocol(format!(
                    "no acknowledgment after {errors} attempts"
                )));
            }
        }
    }

    /// Wait for the single-byte reply to a packet.
    fn wait_reply(&mut self) -> Result<Reply> {
        match self.transport.recv_byte(self.config.ack_timeout) {
            Ok(control::ACK) => Ok(Reply::Ack),
            Ok(control::CAN) => match self.transport.recv_byte(self.config.ack_timeout) {
                Ok(control::CAN) => Err(Error::PeerAbort),
                _ => Ok(Reply::Retry),
            },
            Ok(other) => {
                trace!("unexpected reply {other:#04x}");
                Ok(Reply::Retry)
            },
            Err(Error::Timeout(_)) => Ok(Reply::Retry),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::{FlashOp, MemFlash};
    use std::collections::VecDeque;

    /// Scripted transport: replies come from a byte queue, everything sent
    /// is recorded. An empty queue times out.
    struct ScriptedLink {
        rx: VecDeque<u8>,
        tx: Vec<u8>,
    }

    impl ScriptedLink {
        fn new() -> Self {
            Self {
                rx: VecDeque::new(),
                tx: Vec::new(),
            }
        }

        fn queue(&mut self, bytes: &[u8]) {
            self.rx.extend(bytes);
        }

        fn queue_packet(&mut self, seq: u8, data: &[u8], use_stx: bool) {
            // Header packets pad with NUL, data packets with 0x1A
            let pad = if seq == 0 { 0 } else { control::PAD };
            let packet = build_packet(seq, data, use_stx, pad);
            self.rx.extend(packet);
        }

        fn sent_tail(&self, n: usize) -> &[u8] {
            &self.tx[self.tx.len().saturating_sub(n)..]
        }
    }

    impl Transport for ScriptedLink {
        fn send(&mut self, buf: &[u8]) -> Result<()> {
            self.tx.extend_from_slice(buf);
            Ok(())
        }

        fn recv(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<()> {
            if self.rx.len() < buf.len() {
                return Err(Error::Timeout("script exhausted".into()));
            }
            for b in buf.iter_mut() {
                *b = self.rx.pop_front().unwrap();
            }
            Ok(())
        }
    }

    fn header_payload(name: &str, size: u64) -> Vec<u8> {
        build_header(name, size)
    }

    fn receiver_config(capacity: u64) -> ReceiverConfig {
        ReceiverConfig {
            base_addr: 0x1000,
            capacity,
            marker_addr: None,
            ..ReceiverConfig::default()
        }
    }

    #[test]
    fn test_build_packet_layout() {
        let packet = build_packet(1, &[0xAB; 3], false, control::PAD);
        assert_eq!(packet.len(), 3 + SOH_PAYLOAD + 2);
        assert_eq!(packet[0], control::SOH);
        assert_eq!(packet[1], 1);
        assert_eq!(packet[2], 0xFE);
        assert_eq!(packet[6], control::PAD);

        let crc = crc16_xmodem(&packet[3..3 + SOH_PAYLOAD]);
        assert_eq!(packet[3 + SOH_PAYLOAD], (crc >> 8) as u8);
        assert_eq!(packet[3 + SOH_PAYLOAD + 1], (crc & 0xFF) as u8);

        let stx = build_packet(5, &[0u8; 1024], true, control::PAD);
        assert_eq!(stx.len(), 3 + STX_PAYLOAD + 2);
        assert_eq!(stx[0], control::STX);
        assert_eq!(stx[2], 0xFA);
    }

    #[test]
    fn test_header_build_parse_round_trip() {
        let payload = build_header("fw.bin", 2000);
        let info = parse_header(&payload).unwrap().unwrap();
        assert_eq!(info.name, "fw.bin");
        assert_eq!(info.size, 2000);

        assert_eq!(parse_header(&[0u8; 128]).unwrap(), None);
    }

    #[test]
    fn test_receive_single_file() {
        let mut link = ScriptedLink::new();
        let body: Vec<u8> = (0..200u8).collect();
        link.queue_packet(0, &header_payload("fw.bin", 200), false);
        link.queue_packet(1, &body[..128], false);
        link.queue_packet(2, &body[128..], false);
        link.queue(&[control::EOT]);
        link.queue_packet(0, &[], false); // session terminator

        let mut flash = MemFlash::new(0x1000, 1024);
        let info = YmodemReceiver::new(&mut link, &mut flash, receiver_config(1024))
            .receive()
            .unwrap();

        assert_eq!(info, FileInfo { name: "fw.bin".into(), size: 200 });
        assert_eq!(flash.bytes_written(), 200);
        assert_eq!(&flash.data()[..200], &body[..]);
        // Erase of the declared size precedes the writes
        assert_eq!(flash.ops()[0], FlashOp::Erase { addr: 0x1000, len: 200 });
    }

    #[test]
    fn test_receive_truncates_padded_final_packet() {
        let mut link = ScriptedLink::new();
        link.queue_packet(0, &header_payload("fw.bin", 100), false);
        link.queue_packet(1, &[0x77; 100], false); // 28 bytes of PAD follow
        link.queue(&[control::EOT]);
        link.queue_packet(0, &[], false);

        let mut flash = MemFlash::new(0x1000, 1024);
        YmodemReceiver::new(&mut link, &mut flash, receiver_config(1024))
            .receive()
            .unwrap();

        assert_eq!(flash.bytes_written(), 100);
    }

    #[test]
    fn test_bad_sequence_complement_never_written_or_acked() {
        let mut link = ScriptedLink::new();
        link.queue_packet(0, &header_payload("fw.bin", 64), false);
        // Corrupt complement byte on a data packet
        let mut packet = build_packet(1, &[0x11; 64], false, control::PAD);
        packet[2] = 0x00;
        link.queue(&packet);
        // The sender's timeout-driven retransmission
        link.queue_packet(1, &[0x11; 64], false);
        link.queue(&[control::EOT]);
        link.queue_packet(0, &[], false);

        let mut flash = MemFlash::new(0x1000, 1024);
        YmodemReceiver::new(&mut link, &mut flash, receiver_config(1024))
            .receive()
            .unwrap();

        // The corrupt copy was neither written nor answered; only the valid
        // retransmission landed.
        assert_eq!(flash.bytes_written(), 64);
        assert!(!link.tx.contains(&control::NAK));
        assert_eq!(link.tx.iter().filter(|&&b| b == control::ACK).count(), 4);
    }

    #[test]
    fn test_corrupt_crc_silently_discarded() {
        let mut link = ScriptedLink::new();
        link.queue_packet(0, &header_payload("fw.bin", 64), false);
        let mut packet = build_packet(1, &[0x22; 64], false, control::PAD);
        let last = packet.len() - 1;
        packet[last] ^= 0xFF;
        link.queue(&packet);
        // The retransmitted, valid copy
        link.queue_packet(1, &[0x22; 64], false);
        link.queue(&[control::EOT]);
        link.queue_packet(0, &[], false);

        let mut flash = MemFlash::new(0x1000, 1024);
        YmodemReceiver::new(&mut link, &mut flash, receiver_config(1024))
            .receive()
            .unwrap();

        assert_eq!(flash.bytes_written(), 64);
        assert!(!link.tx.contains(&control::NAK));
    }

    #[test]
    fn test_wrong_sequence_gets_nak_without_write() {
        let mut link = ScriptedLink::new();
        link.queue_packet(0, &header_payload("fw.bin", 300), false);
        link.queue_packet(1, &[0x33; 128], false);
        link.queue_packet(1, &[0x33; 128], false); // duplicate
        link.queue_packet(2, &[0x44; 128], false);
        link.queue_packet(3, &[0x55; 44], false);
        link.queue(&[control::EOT]);
        link.queue_packet(0, &[], false);

        let mut flash = MemFlash::new(0x1000, 1024);
        YmodemReceiver::new(&mut link, &mut flash, receiver_config(1024))
            .receive()
            .unwrap();

        assert_eq!(flash.bytes_written(), 300);
        assert_eq!(link.tx.iter().filter(|&&b| b == control::NAK).count(), 1);
    }

    #[test]
    fn test_oversize_header_rejected_before_any_flash_op() {
        let mut link = ScriptedLink::new();
        link.queue_packet(0, &header_payload("huge.bin", 4096), false);

        let mut flash = MemFlash::new(0x1000, 1024);
        let err = YmodemReceiver::new(&mut link, &mut flash, receiver_config(1024))
            .receive()
            .unwrap_err();

        assert!(matches!(
            err,
            Error::SizeLimit { declared: 4096, capacity: 1024 }
        ));
        assert!(flash.ops().is_empty());
        assert_eq!(link.sent_tail(2), &[control::CAN, control::CAN]);
    }

    #[test]
    fn test_double_can_aborts() {
        let mut link = ScriptedLink::new();
        link.queue_packet(0, &header_payload("fw.bin", 256), false);
        link.queue_packet(1, &[0x66; 128], false);
        link.queue(&[control::CAN, control::CAN]);

        let mut flash = MemFlash::new(0x1000, 1024);
        let err = YmodemReceiver::new(&mut link, &mut flash, receiver_config(1024))
            .receive()
            .unwrap_err();

        assert!(matches!(err, Error::PeerAbort));
        // Only the first data packet landed
        assert_eq!(flash.bytes_written(), 128);
        // The abort was acknowledged
        assert_eq!(link.sent_tail(1), &[control::ACK]);
    }

    #[test]
    fn test_user_abort_returns_without_ack() {
        let mut link = ScriptedLink::new();
        link.queue(&[control::ABORT1]);

        let mut flash = MemFlash::new(0x1000, 1024);
        let err = YmodemReceiver::new(&mut link, &mut flash, receiver_config(1024))
            .receive()
            .unwrap_err();

        assert!(matches!(err, Error::UserAbort));
        // Only the CRC16 request went out, no ACK
        assert_eq!(link.tx, vec![control::C]);
    }

    #[test]
    fn test_retry_exhaustion_after_session_begin() {
        let mut link = ScriptedLink::new();
        link.queue_packet(0, &header_payload("fw.bin", 256), false);
        link.queue_packet(1, &[0x12; 128], false);
        // Script ends: every further receive attempt times out

        let mut flash = MemFlash::new(0x1000, 1024);
        let err = YmodemReceiver::new(&mut link, &mut flash, receiver_config(1024))
            .receive()
            .unwrap_err();

        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(link.sent_tail(2), &[control::CAN, control::CAN]);
        // The C request was re-sent once per tolerated error
        let c_count = link.tx.iter().filter(|&&b| b == control::C).count();
        assert_eq!(c_count as u32, 2 + MAX_ERRORS);
    }

    #[test]
    fn test_flash_write_failure_cancels() {
        let mut link = ScriptedLink::new();
        link.queue_packet(0, &header_payload("fw.bin", 256), false);
        link.queue_packet(1, &[0x12; 128], false);

        let mut flash = MemFlash::new(0x1000, 1024);
        flash.fail_next_write();
        let err = YmodemReceiver::new(&mut link, &mut flash, receiver_config(1024))
            .receive()
            .unwrap_err();

        assert!(matches!(err, Error::Flash(_)));
        assert_eq!(link.sent_tail(2), &[control::CAN, control::CAN]);
    }

    #[test]
    fn test_marker_written_on_eot() {
        let mut link = ScriptedLink::new();
        link.queue_packet(0, &header_payload("fw.bin", 8), false);
        link.queue_packet(1, &[0x01; 8], false);
        link.queue(&[control::EOT]);
        link.queue_packet(0, &[], false);

        let mut flash = MemFlash::new(0x1000, 1024);
        let config = ReceiverConfig {
            marker_addr: Some(0x1100),
            ..receiver_config(1024)
        };
        YmodemReceiver::new(&mut link, &mut flash, config)
            .receive()
            .unwrap();

        let mut word = [0u8; 4];
        flash.read(0x1100, &mut word).unwrap();
        assert_eq!(u32::from_le_bytes(word), layout::IMAGE_PRESENT_MAGIC);
    }

    #[test]
    fn test_transmit_packet_sizes_and_padding() {
        let mut link = ScriptedLink::new();
        // C, ACK(header), C, ACK(1024), ACK(976 in STX), ACK(EOT), C, ACK(close)
        link.queue(&[control::C, control::ACK, control::C]);
        link.queue(&[control::ACK, control::ACK, control::ACK, control::C, control::ACK]);

        let data = vec![0xEE; 2000];
        let mut tx = YmodemTransmitter::new(&mut link, TransmitterConfig::default());
        tx.transmit("fw.bin", &data, |_, _| {}).unwrap();

        // Header(SOH) + two STX data packets + EOT + closing SOH header
        let soh_len = 3 + SOH_PAYLOAD + 2;
        let stx_len = 3 + STX_PAYLOAD + 2;
        assert_eq!(link.tx.len(), soh_len + 2 * stx_len + 1 + soh_len);

        // Second data packet carries 976 bytes plus 0x1A padding
        let second = &link.tx[soh_len + stx_len..soh_len + 2 * stx_len];
        assert_eq!(second[0], control::STX);
        assert_eq!(second[1], 2);
        assert_eq!(second[3 + 976], control::PAD);
        assert!(second[3..3 + 976].iter().all(|&b| b == 0xEE));
    }

    #[test]
    fn test_transmit_small_file_uses_soh() {
        let mut link = ScriptedLink::new();
        link.queue(&[control::C, control::ACK, control::C]);
        link.queue(&[control::ACK, control::ACK, control::C, control::ACK]);

        let data = vec![0x11; 100];
        let mut tx = YmodemTransmitter::new(&mut link, TransmitterConfig::default());
        tx.transmit("small.bin", &data, |_, _| {}).unwrap();

        let soh_len = 3 + SOH_PAYLOAD + 2;
        // Header + one SOH data packet + EOT + closing header
        assert_eq!(link.tx.len(), 3 * soh_len + 1);
    }

    #[test]
    fn test_transmit_packet_limit() {
        let mut link = ScriptedLink::new();
        let config = TransmitterConfig {
            max_packets: 1,
            ..TransmitterConfig::default()
        };
        let data = vec![0u8; 3000]; // needs 3 packets
        let err = YmodemTransmitter::new(&mut link, config)
            .transmit("big.bin", &data, |_, _| {})
            .unwrap_err();

        assert!(matches!(err, Error::PacketLimit { packets: 3, max: 1 }));
        // Nothing was put on the wire
        assert!(link.tx.is_empty());
    }

    #[test]
    fn test_transmit_double_can_aborts() {
        let mut link = ScriptedLink::new();
        link.queue(&[control::C, control::CAN, control::CAN]);

        let data = vec![0u8; 10];
        let err = YmodemTransmitter::new(&mut link, TransmitterConfig::default())
            .transmit("fw.bin", &data, |_, _| {})
            .unwrap_err();

        assert!(matches!(err, Error::PeerAbort));
    }

    #[test]
    fn test_can_after_closing_header_is_late_abort() {
        let mut link = ScriptedLink::new();
        // C, ACK(header), C, ACK(data), ACK(EOT), C, then CAN for the
        // closing header
        link.queue(&[control::C, control::ACK, control::C]);
        link.queue(&[control::ACK, control::ACK, control::C, control::CAN]);

        let data = vec![0x9A; 10];
        let err = YmodemTransmitter::new(&mut link, TransmitterConfig::default())
            .transmit("fw.bin", &data, |_, _| {})
            .unwrap_err();

        assert!(matches!(err, Error::PeerAbort));
    }

    #[test]
    fn test_transmit_error_budget_exhaustion() {
        let mut link = ScriptedLink::new();
        // One NAK per attempt, then silence; every retry fails
        link.queue(&[control::C]);
        link.queue(&[control::NAK; 6]);

        let data = vec![0u8; 10];
        let err = YmodemTransmitter::new(&mut link, TransmitterConfig::default())
            .transmit("fw.bin", &data, |_, _| {})
            .unwrap_err();

        assert!(matches!(err, Error::Protocol(_)));
        // The header packet went out the initial time plus five retries
        let soh_len = 3 + SOH_PAYLOAD + 2;
        assert_eq!(link.tx.len(), 6 * soh_len);
    }
}
