//! Boundary to the device enumeration state machine.
//!
//! Slot and endpoint context tables are owned elsewhere; this module only sequences the commands
//! that bring a newly attached device to the Addressed state.

use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, warn};

use crate::command_ring::CommandRing;
use crate::context::TrbFuture;
use crate::error::Result;
use crate::trb::Trb;

/// Where a device hangs off the bus, for route string and TT setup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HubInfo {
    /// Slot of the parent hub.
    pub hub_slot: u8,
    /// Downstream port of the parent hub (1-based).
    pub hub_port: u8,
    /// USB speed of the device, as encoded in PORTSC.
    pub speed: u8,
}

/// Owner of the device context tables.
pub trait DeviceContexts: Send + Sync {
    /// Builds the Input Context for addressing the device now occupying `slot` and returns its bus
    /// address. `hub` is `None` for devices on a root hub port.
    fn prepare_address_device(&self, slot: u8, port: u8, hub: Option<HubInfo>) -> Result<u64>;
}

/// Enable Slot, then Address Device with the input context `devices` prepares.
///
/// Resolves with the Address Device completion event; its slot ID identifies the new device.
/// Run it through [`EventRing::schedule_task`](crate::event_ring::EventRing::schedule_task) so a
/// hardware-fatal failure halts the controller.
pub fn enumerate_device(
    command_ring: Arc<CommandRing>,
    devices: Arc<dyn DeviceContexts>,
    port: u8,
    hub: Option<HubInfo>,
) -> TrbFuture {
    async move {
        let enabled = command_ring.submit(&Trb::enable_slot())?.await?;
        let slot = enabled.slot_id();
        debug!(slot, port, "slot enabled");

        let addressed = match devices.prepare_address_device(slot, port, hub) {
            Ok(input_context) => {
                let command = Trb::address_device(input_context, slot, false);
                match command_ring.submit(&command) {
                    Ok(future) => future.await,
                    Err(err) => Err(err),
                }
            }
            Err(err) => Err(err),
        };

        if let Err(err) = &addressed {
            warn!(slot, port, %err, "address device failed, releasing slot");
            // Release the slot; its completion is of no further interest.
            if let Err(err) = command_ring.submit(&Trb::disable_slot(slot)) {
                warn!(slot, %err, "could not queue disable slot");
            }
        } else {
            debug!(slot, port, "device addressed");
        }
        addressed
    }
    .boxed()
}
