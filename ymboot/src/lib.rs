//! # ymboot
//!
//! YModem-over-UART firmware transfer engine and runtime update channel.
//!
//! This crate provides the protocol core of a firmware update pipeline:
//!
//! - YModem receiver and transmitter state machines (SOH/STX/EOT/CAN framing,
//!   CRC16 verification, retry/abort handling)
//! - The runtime update frame codec used after the device has booted into
//!   application firmware
//! - A fixed-capacity SPSC ring buffer decoupling byte reception from the
//!   protocol parser
//! - CRC16-XMODEM checksum calculation
//!
//! The engines are I/O-agnostic: they speak to a [`Transport`], and the
//! receiver persists data through a [`Flash`] capability. Native serial port
//! support comes from the `serialport` crate behind the `native` feature
//! (default).
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use ymboot::{NativePort, SerialConfig, TransmitterConfig, YmodemTransmitter};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut port = NativePort::open(&SerialConfig::new("/dev/ttyUSB0", 115200))?;
//!
//!     let config = TransmitterConfig {
//!         ack_timeout: Duration::from_millis(1000),
//!         ..TransmitterConfig::default()
//!     };
//!     let firmware = std::fs::read("firmware.bin")?;
//!     let mut tx = YmodemTransmitter::new(&mut port, config);
//!     tx.transmit("firmware.bin", &firmware, |sent, total| {
//!         println!("{sent}/{total}");
//!     })?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod flash;
pub mod port;
pub mod protocol;
pub mod ringbuf;
pub mod transport;
pub mod util;

// Re-exports for convenience
// Native-specific re-exports
#[cfg(feature = "native")]
pub use port::NativePort;
pub use {
    error::{Error, Result},
    flash::{Flash, FlashOp, MemFlash, layout},
    port::{Port, SerialConfig},
    protocol::frame::{Command, Frame, Modem, ModemConfig, read_frame, send_request},
    protocol::ymodem::{
        FileInfo, ReceiverConfig, TransmitterConfig, YmodemReceiver, YmodemTransmitter,
    },
    ringbuf::{RingBuffer, SharedRing},
    transport::{RingTransport, Transport, pair},
    util::{format_size, parse_size},
};
