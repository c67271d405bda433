//! Host-side ring engine for USB xHCI controllers.
//!
//! The driver talks to an xHCI controller through rings of 16-byte Transfer Request Blocks in
//! DMA memory. This crate owns that machinery:
//!
//! - [`TransferRing`]: producer side of a transfer or command ring, with ordered completion
//!   bookkeeping and generation tokens that reject work built against a torn-down ring
//! - [`EventRing`]: consumer side of an interrupter's event ring, routing completions back to the
//!   originating request and running continuations on a private scheduler
//! - [`Interrupter`]: the service thread that drains an event ring when its interrupt fires
//! - [`CommandRing`] and [`enumerate_device`]: command submission and device addressing
//! - [`queue_control`] / [`queue_normal`]: turning a [`UsbRequest`] into TRBs and a doorbell
//!
//! Hardware is reached only through injected collaborators ([`DmaAllocator`], [`Mmio`],
//! [`HostController`], [`InterruptObject`], [`DeviceContexts`]).

mod command_ring;
pub mod config;
mod context;
mod controller;
mod dma;
mod enumeration;
mod erst;
mod error;
mod event_ring;
mod executor;
mod interrupter;
mod mmio;
pub mod regs;
mod request;
mod transfer;
mod transfer_ring;
pub mod trb;

pub use command_ring::CommandRing;
pub use config::{budget, RingParams, TransferConfig};
pub use context::{TrbContext, TrbFuture};
pub use controller::HostController;
pub use dma::{BusTransactionInitiator, DmaAllocator, DmaBuffer};
pub use enumeration::{enumerate_device, DeviceContexts, HubInfo};
pub use erst::{ErstEntry, EventRingSegmentTable, ERST_ENTRY_LEN};
pub use error::{Result, XhciError};
pub use event_ring::{EventRing, EventRingBindings};
pub use executor::{TaskId, TaskQueue};
pub use interrupter::{InterruptObject, Interrupter};
pub use mmio::{Mmio, MmioHandle};
pub use request::{
    RequestCallback, RequestOutcome, SetupPacket, UsbRequest, USB_DIR_IN, USB_ENDPOINT_DIR_IN,
};
pub use transfer::{page_chunks, queue_control, queue_normal};
pub use transfer_ring::{RingState, TransferRing, TrbHandle};
pub use trb::{CompletionCode, TransferType, Trb, TrbFlags, TrbType, TRB_LEN};
