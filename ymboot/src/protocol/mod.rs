//! Protocol implementations.

pub mod crc;
pub mod frame;
pub mod ymodem;

// Re-export common types
pub use frame::{Command, Frame, Modem, ModemConfig};
pub use ymodem::{FileInfo, ReceiverConfig, TransmitterConfig, YmodemReceiver, YmodemTransmitter};
