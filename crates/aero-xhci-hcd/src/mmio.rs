//! Register access boundary.
//!
//! The controller's register block is handed to the ring engine as an owned
//! `Arc<dyn Mmio>`; nothing in this crate aliases hardware through a global pointer, so tests can
//! substitute a fake register file.

use std::sync::Arc;

/// Memory-mapped register access at byte offsets from the controller's MMIO base.
pub trait Mmio: Send + Sync {
    fn read32(&self, offset: u64) -> u32;

    fn write32(&self, offset: u64, value: u32);

    fn read64(&self, offset: u64) -> u64 {
        u64::from(self.read32(offset)) | (u64::from(self.read32(offset + 4)) << 32)
    }

    /// 64-bit registers are written low dword first; xHCI latches the value on the high write.
    fn write64(&self, offset: u64, value: u64) {
        self.write32(offset, value as u32);
        self.write32(offset + 4, (value >> 32) as u32);
    }
}

pub type MmioHandle = Arc<dyn Mmio>;
