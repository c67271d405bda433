//! Event Ring Segment Table.
//!
//! One DMA page of 16-byte entries, each describing a contiguous event ring segment:
//!
//! | bytes | field |
//! |-------|-------|
//! | 0..8  | segment base (64-byte aligned) |
//! | 8..10 | segment size in TRBs |
//! | 10..16 | reserved |
//!
//! The table address is programmed into `ERSTBA` and the entry count into `ERSTSZ`.

use tracing::debug;

use crate::dma::{self, BusTransactionInitiator, DmaAllocator, DmaBuffer};
use crate::error::{Result, XhciError};

/// Size of one ERST entry in bytes.
pub const ERST_ENTRY_LEN: usize = 16;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ErstEntry {
    pub base: u64,
    pub size_trbs: u16,
}

impl ErstEntry {
    pub fn to_bytes(self) -> [u8; ERST_ENTRY_LEN] {
        let mut bytes = [0u8; ERST_ENTRY_LEN];
        bytes[0..8].copy_from_slice(&(self.base & !0x3f).to_le_bytes());
        bytes[8..10].copy_from_slice(&self.size_trbs.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: [u8; ERST_ENTRY_LEN]) -> Self {
        let mut base = [0u8; 8];
        base.copy_from_slice(&bytes[0..8]);
        Self {
            base: u64::from_le_bytes(base),
            size_trbs: u16::from_le_bytes([bytes[8], bytes[9]]),
        }
    }
}

pub struct EventRingSegmentTable {
    buffer: Box<dyn DmaBuffer>,
    capacity: usize,
    entries: Vec<ErstEntry>,
}

impl EventRingSegmentTable {
    /// Allocates the table page. Capacity is as many entries as fit in the page, clamped to the
    /// controller's `ERST Max`.
    pub fn init(
        page_size: usize,
        bti: &BusTransactionInitiator,
        is_32bit: bool,
        erst_max: u32,
        dma: &dyn DmaAllocator,
    ) -> Result<Self> {
        let buffer = dma::alloc_zeroed(dma, bti, page_size, is_32bit)?;
        let capacity = (page_size / ERST_ENTRY_LEN).min(erst_max as usize);
        debug!(phys = buffer.phys(), capacity, "event ring segment table allocated");
        Ok(Self {
            buffer,
            capacity,
            entries: Vec::with_capacity(capacity),
        })
    }

    /// Appends an entry for a segment of `trbs` event TRBs at `base`.
    pub fn add_segment(&mut self, base: u64, trbs: u16) -> Result<()> {
        if self.entries.len() >= self.capacity {
            return Err(XhciError::OutOfMemory);
        }
        let entry = ErstEntry {
            base,
            size_trbs: trbs,
        };
        let offset = self.entries.len() * ERST_ENTRY_LEN;
        self.buffer.write(offset, &entry.to_bytes());
        self.entries.push(entry);
        Ok(())
    }

    /// Bus address of the table, as programmed into `ERSTBA`.
    pub fn phys(&self) -> u64 {
        self.buffer.phys()
    }

    /// Number of populated entries, as programmed into `ERSTSZ`.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn entry(&self, index: usize) -> Option<ErstEntry> {
        self.entries.get(index).copied()
    }
}
