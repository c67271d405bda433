//! Command ring: a [`TransferRing`] consumed by the controller itself, announced through
//! doorbell 0.

use tracing::{debug, warn};

use crate::config::RingParams;
use crate::context::{TrbContext, TrbFuture};
use crate::dma::DmaAllocator;
use crate::error::{Result, XhciError};
use crate::regs::{Crcr, Doorbells};
use crate::transfer_ring::TransferRing;
use crate::trb::Trb;

/// Doorbell index and target that announce new command TRBs.
const COMMAND_DOORBELL: u8 = 0;
const COMMAND_DOORBELL_TARGET: u8 = 0;

pub struct CommandRing {
    ring: TransferRing,
    doorbells: Doorbells,
}

impl CommandRing {
    pub fn new(doorbells: Doorbells) -> Self {
        Self {
            ring: TransferRing::new(),
            doorbells,
        }
    }

    pub fn init(&self, params: &RingParams, dma: &dyn DmaAllocator) -> Result<()> {
        self.ring.init(params, dma)
    }

    pub fn ring(&self) -> &TransferRing {
        &self.ring
    }

    /// Value to program into `CRCR` before the controller is started.
    pub fn crcr(&self) -> Result<Crcr> {
        self.ring.crcr()
    }

    /// Queues one command TRB and rings the command doorbell.
    ///
    /// The returned future resolves with the Command Completion Event for this TRB.
    pub fn submit(&self, command: &Trb) -> Result<TrbFuture> {
        let (context, future) = TrbContext::with_future(self.ring.token());
        let handle = {
            let _producer = self.ring.lock_producer();
            self.ring.add_trb(command, Some(context))?
        };
        debug!(
            command = ?command.trb_type(),
            phys = self.ring.phys(handle).unwrap_or_default(),
            "command queued"
        );
        self.doorbells.ring(COMMAND_DOORBELL, COMMAND_DOORBELL_TARGET, 0);
        Ok(future)
    }

    /// Resolves the command a Command Completion Event points at.
    pub fn complete(&self, event: &Trb) -> Result<()> {
        let Some(handle) = self.ring.handle_for_phys(event.parameter) else {
            warn!(phys = event.parameter, "command completion for an unknown TRB");
            return Err(XhciError::Canceled);
        };
        let context = self.ring.complete_trb(handle)?;
        context.resolve(event);
        Ok(())
    }

    /// Fails every queued command with [`XhciError::Canceled`] and releases the ring.
    pub fn deinit(&self) -> Result<()> {
        self.ring.deinit_if_active()
    }
}
