//! Flash capability consumed by the transfer engine.
//!
//! The engine never touches flash hardware directly; it drives this trait.
//! On a device the implementation wraps the vendor's erase/write primitives.
//! [`MemFlash`] is the in-memory implementation used by the CLI (receive to a
//! file) and by tests, and records every erase/write for inspection.

use crate::error::{Error, Result};

/// Well-known flash words written by the engine.
pub mod layout {
    /// Magic word recorded once a complete image has been received.
    pub const IMAGE_PRESENT_MAGIC: u32 = 0xAA55_A55A;

    /// Magic word the runtime update channel writes to request an upgrade on
    /// the next boot.
    pub const UPGRADE_PENDING_MAGIC: u32 = 0x5A5A_A5A5;

    /// Default application region base address.
    pub const DEFAULT_APP_BASE: u32 = 0x0800_8000;

    /// Default offset of the image-present marker word, relative to nothing:
    /// an absolute address in the reserved configuration sector.
    pub const DEFAULT_MARKER_ADDR: u32 = 0x0800_7000;

    /// Default absolute address of the upgrade-pending flag word.
    pub const DEFAULT_UPGRADE_FLAG_ADDR: u32 = 0x0800_7004;
}

/// Flash erase/write/read capability.
pub trait Flash {
    /// Erase `len` bytes starting at `addr`.
    fn erase(&mut self, addr: u32, len: usize) -> Result<()>;

    /// Write `data` at `addr`.
    fn write(&mut self, addr: u32, data: &[u8]) -> Result<()>;

    /// Read `buf.len()` bytes from `addr`.
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<()>;

    /// Check that `addr` is aligned to the device's write unit.
    fn check_aligned(&self, addr: u32) -> Result<()>;
}

/// One recorded flash operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashOp {
    /// Erase of `len` bytes at `addr`.
    Erase {
        /// Start address.
        addr: u32,
        /// Length in bytes.
        len: usize,
    },
    /// Write of `len` bytes at `addr`.
    Write {
        /// Start address.
        addr: u32,
        /// Length in bytes.
        len: usize,
    },
}

/// In-memory flash region with an operation log.
#[derive(Debug)]
pub struct MemFlash {
    base: u32,
    data: Vec<u8>,
    write_align: u32,
    ops: Vec<FlashOp>,
    /// When set, the next write fails. Used to exercise fault paths.
    fail_next_write: bool,
}

impl MemFlash {
    /// Create a region of `capacity` bytes starting at `base`, filled with
    /// the erased pattern 0xFF.
    pub fn new(base: u32, capacity: usize) -> Self {
        Self {
            base,
            data: vec![0xFF; capacity],
            write_align: 4,
            ops: Vec::new(),
            fail_next_write: false,
        }
    }

    /// Region base address.
    pub fn base(&self) -> u32 {
        self.base
    }

    /// Region capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Region contents.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Recorded erase/write operations, in order.
    pub fn ops(&self) -> &[FlashOp] {
        &self.ops
    }

    /// Total bytes written so far.
    pub fn bytes_written(&self) -> usize {
        self.ops
            .iter()
            .filter_map(|op| match op {
                FlashOp::Write { len, .. } => Some(len),
                FlashOp::Erase { .. } => None,
            })
            .sum()
    }

    /// Make the next write fail with [`Error::Flash`].
    pub fn fail_next_write(&mut self) {
        self.fail_next_write = true;
    }

    fn range(&self, addr: u32, len: usize) -> Result<std::ops::Range<usize>> {
        let start = addr
            .checked_sub(self.base)
            .ok_or_else(|| Error::Flash(format!("address {addr:#010x} below region base")))?
            as usize;
        let end = start
            .checked_add(len)
            .filter(|&e| e <= self.data.len())
            .ok_or_else(|| Error::Flash(format!("range {addr:#010x}+{len} beyond region end")))?;
        Ok(start..end)
    }
}

impl Flash for MemFlash {
    fn erase(&mut self, addr: u32, len: usize) -> Result<()> {
        let range = self.range(addr, len)?;
        self.data[range].fill(0xFF);
        self.ops.push(FlashOp::Erase { addr, len });
        Ok(())
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        if self.fail_next_write {
            self.fail_next_write = false;
            return Err(Error::Flash("injected write failure".into()));
        }
        let range = self.range(addr, data.len())?;
        self.data[range].copy_from_slice(data);
        self.ops.push(FlashOp::Write {
            addr,
            len: data.len(),
        });
        Ok(())
    }

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        let range = self.range(addr, buf.len())?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn check_aligned(&self, addr: u32) -> Result<()> {
        if addr % self.write_align != 0 {
            return Err(Error::Flash(format!(
                "address {addr:#010x} not aligned to {}",
                self.write_align
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_erase_write_read() {
        let mut flash = MemFlash::new(0x1000, 64);
        flash.erase(0x1000, 64).unwrap();
        flash.write(0x1010, &[1, 2, 3, 4]).unwrap();

        let mut buf = [0u8; 6];
        flash.read(0x100F, &mut buf).unwrap();
        assert_eq!(buf, [0xFF, 1, 2, 3, 4, 0xFF]);

        assert_eq!(
            flash.ops(),
            &[
                FlashOp::Erase { addr: 0x1000, len: 64 },
                FlashOp::Write { addr: 0x1010, len: 4 },
            ]
        );
        assert_eq!(flash.bytes_written(), 4);
    }

    #[test]
    fn test_out_of_range_rejected() {
        let mut flash = MemFlash::new(0x1000, 16);
        assert!(flash.write(0x0FFF, &[0]).is_err());
        assert!(flash.write(0x100F, &[0, 0]).is_err());
        assert!(flash.erase(0x1000, 17).is_err());
    }

    #[test]
    fn test_alignment_check() {
        let flash = MemFlash::new(0x1000, 16);
        assert!(flash.check_aligned(0x1004).is_ok());
        assert!(flash.check_aligned(0x1002).is_err());
    }

    #[test]
    fn test_injected_write_failure_is_one_shot() {
        let mut flash = MemFlash::new(0, 16);
        flash.fail_next_write();
        assert!(flash.write(0, &[1]).is_err());
        assert!(flash.write(0, &[1]).is_ok());
    }
}
