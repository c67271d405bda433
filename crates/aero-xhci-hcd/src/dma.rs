//! DMA collaborator boundary.
//!
//! The ring engine never allocates bus-visible memory itself. A [`DmaAllocator`] hands out pinned,
//! page-aligned buffers that are already mapped for the controller identified by a
//! [`BusTransactionInitiator`]; [`DmaBuffer::phys`] is the only source of bus addresses.

use std::sync::atomic::{fence, Ordering};

use crate::error::{Result, XhciError};
use crate::trb::{Trb, TRB_LEN};

/// Capability authorising DMA mappings for one hardware device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BusTransactionInitiator {
    pub id: u32,
}

impl BusTransactionInitiator {
    pub const fn new(id: u32) -> Self {
        Self { id }
    }
}

/// A pinned, bus-translatable buffer.
pub trait DmaBuffer: Send {
    /// Bus address of byte 0.
    fn phys(&self) -> u64;

    fn size(&self) -> usize;

    fn read(&self, offset: usize, buf: &mut [u8]);

    fn write(&mut self, offset: usize, data: &[u8]);
}

pub trait DmaAllocator: Send + Sync {
    /// Allocates `size` bytes of page-aligned memory mapped for `bti`.
    fn create_paged(
        &self,
        bti: &BusTransactionInitiator,
        size: usize,
        enable_cache: bool,
    ) -> Result<Box<dyn DmaBuffer>>;
}

/// Allocates a zeroed paged buffer and checks it is reachable by a controller that may only
/// generate 32-bit addresses.
pub(crate) fn alloc_zeroed(
    dma: &dyn DmaAllocator,
    bti: &BusTransactionInitiator,
    size: usize,
    is_32bit: bool,
) -> Result<Box<dyn DmaBuffer>> {
    let mut buffer = dma.create_paged(bti, size, false)?;
    if is_32bit {
        let end = buffer
            .phys()
            .checked_add(buffer.size() as u64)
            .ok_or(XhciError::Capability("buffer end overflows the bus address space"))?;
        if end > 1u64 << 32 {
            return Err(XhciError::Capability(
                "buffer lies above 4GiB on a 32-bit controller",
            ));
        }
    }
    let zero = vec![0u8; buffer.size()];
    buffer.write(0, &zero);
    Ok(buffer)
}

/// Writes a TRB so hardware can never observe it half-written: parameter and status land first,
/// the control dword (which carries the cycle bit) lands last.
pub(crate) fn write_trb(buffer: &mut dyn DmaBuffer, offset: usize, trb: &Trb) {
    let bytes = trb.to_bytes();
    buffer.write(offset, &bytes[..12]);
    fence(Ordering::Release);
    buffer.write(offset + 12, &bytes[12..TRB_LEN]);
}

/// Mirror of [`write_trb`] for the consumer side: the control dword is read first so the rest of
/// the TRB is only trusted once its cycle bit has been observed.
pub(crate) fn read_trb(buffer: &dyn DmaBuffer, offset: usize) -> Trb {
    let mut bytes = [0u8; TRB_LEN];
    buffer.read(offset + 12, &mut bytes[12..TRB_LEN]);
    fence(Ordering::Acquire);
    buffer.read(offset, &mut bytes[..12]);
    Trb::from_bytes(bytes)
}
