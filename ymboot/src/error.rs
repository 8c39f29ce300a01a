//! Error types for ymboot.

use std::io;
use thiserror::Error;

/// Result type for ymboot operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for ymboot operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Bad caller input, checked at entry and never retried.
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Communication timeout on a blocking transport call.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// CRC checksum mismatch.
    #[error("CRC mismatch: expected {expected:#06x}, got {actual:#06x}")]
    CrcMismatch {
        /// Expected CRC value.
        expected: u16,
        /// Actual CRC value.
        actual: u16,
    },

    /// Protocol error (malformed frame, retry budget exhausted).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Remote peer cancelled the transfer with a double-CAN.
    #[error("Transfer cancelled by peer")]
    PeerAbort,

    /// Remote user typed an abort character into the link.
    #[error("Transfer aborted by user")]
    UserAbort,

    /// Declared file size exceeds the target region capacity.
    #[error("File size {declared} exceeds region capacity {capacity}")]
    SizeLimit {
        /// Size declared in the header packet.
        declared: u64,
        /// Capacity of the target flash region.
        capacity: u64,
    },

    /// Transfer would exceed the configured packet-count ceiling.
    #[error("Packet count {packets} exceeds limit {max}")]
    PacketLimit {
        /// Packets the transfer would need.
        packets: u32,
        /// Configured ceiling.
        max: u32,
    },

    /// Flash erase/write/read failure, fatal to the current transfer.
    #[error("Flash error: {0}")]
    Flash(String),
}
