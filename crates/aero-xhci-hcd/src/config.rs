//! Ring and transfer configuration.

use crate::dma::BusTransactionInitiator;
use crate::mmio::Mmio;
use crate::regs::CapabilityRegisters;

/// Work limits that keep a single interrupt from monopolising the service thread.
pub mod budget {
    /// Maximum number of event TRBs consumed per interrupt before ERDP is written back and the
    /// scheduler runs. Remaining events are picked up on the next wake.
    pub const EVENT_DRAIN_BUDGET_PER_IRQ: usize = 256;

    /// DMA segments (one page each) backing a transfer or command ring.
    pub const TRANSFER_RING_SEGMENTS: usize = 1;

    /// DMA segments (one page each) backing the event ring.
    pub const EVENT_RING_SEGMENTS: usize = 1;
}

/// Parameters shared by every ring a controller owns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingParams {
    /// Controller page size; every ring segment is exactly one page.
    pub page_size: usize,
    pub bti: BusTransactionInitiator,
    /// The controller cannot generate addresses above 4GiB (`HCCPARAMS1.AC64 == 0`).
    pub is_32bit: bool,
    pub segments: usize,
}

impl Default for RingParams {
    fn default() -> Self {
        Self {
            page_size: 4096,
            bti: BusTransactionInitiator::new(0),
            is_32bit: false,
            segments: budget::TRANSFER_RING_SEGMENTS,
        }
    }
}

impl RingParams {
    pub fn from_registers(
        caps: &CapabilityRegisters,
        mmio: &dyn Mmio,
        bti: BusTransactionInitiator,
    ) -> Self {
        Self {
            page_size: caps.page_size(mmio),
            bti,
            is_32bit: !caps.hcc_params_1.ac64(),
            ..Self::default()
        }
    }

    /// TRB slots per segment, including the trailing Link TRB.
    pub fn trbs_per_segment(&self) -> usize {
        self.page_size / crate::trb::TRB_LEN
    }
}

/// Per-controller settings for building transfer TRBs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferConfig {
    /// Interrupter that receives completion events for queued transfers.
    pub interrupter: u16,
    /// Set No Snoop on data TRBs; used when the controller's DMA is not cache coherent and buffers
    /// are flushed by software.
    pub no_snoop: bool,
    pub page_size: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            interrupter: 0,
            no_snoop: true,
            page_size: 4096,
        }
    }
}
