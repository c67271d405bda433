//! xHCI Event Ring consumer.
//!
//! The controller produces Event TRBs into segments described by the Event Ring Segment Table and
//! signals an interrupter. Software consumes every TRB whose cycle bit matches its consumer cycle
//! state (CCS), wraps through the segments (toggling CCS after the last one), and reports progress
//! by writing the dequeue pointer back to `ERDP`.
//!
//! Completions are dispatched from here to the ring that owns the completed TRB. Waiters are never
//! run inline: futures resolved by a completion are polled by the ring's private [`TaskQueue`],
//! drained at the end of every [`EventRing::handle_irq`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::channel::oneshot;
use futures::FutureExt;
use tracing::{debug, error, trace, warn};

use crate::command_ring::CommandRing;
use crate::config::{budget, RingParams};
use crate::context::TrbFuture;
use crate::controller::HostController;
use crate::dma::{self, DmaAllocator, DmaBuffer};
use crate::erst::EventRingSegmentTable;
use crate::error::{Result, XhciError};
use crate::executor::TaskQueue;
use crate::mmio::MmioHandle;
use crate::regs::{DoorbellOffset, Erdp, HccParams1, InterrupterRegisters};
use crate::transfer_ring::TransferRing;
use crate::trb::{CompletionCode, Trb, TrbType, TRB_LEN};

/// Collaborators and controller facts an event ring is bound to.
pub struct EventRingBindings {
    pub mmio: MmioHandle,
    pub interrupter: InterrupterRegisters,
    /// `HCSPARAMS2.ERST Max`, in entries.
    pub erst_max: u32,
    pub command_ring: Option<Arc<CommandRing>>,
    pub doorbell_offset: DoorbellOffset,
    pub hci: Arc<dyn HostController>,
    pub hcc_params_1: HccParams1,
    /// Bus address of the Device Context Base Address Array.
    pub dcbaa: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct RingPos {
    seg: usize,
    idx: usize,
}

struct Consumer {
    erst: EventRingSegmentTable,
    segments: Vec<Box<dyn DmaBuffer>>,
    trbs_per_segment: usize,
    pos: RingPos,
    ccs: bool,
}

impl Consumer {
    fn current(&self) -> Trb {
        dma::read_trb(
            self.segments[self.pos.seg].as_ref(),
            self.pos.idx * TRB_LEN,
        )
    }

    fn advance(&mut self) {
        self.pos.idx += 1;
        if self.pos.idx < self.trbs_per_segment {
            return;
        }
        self.pos.idx = 0;
        self.pos.seg += 1;
        if self.pos.seg == self.segments.len() {
            self.pos.seg = 0;
            self.ccs = !self.ccs;
        }
    }

    fn erdp(&self) -> Erdp {
        let dequeue = self.segments[self.pos.seg].phys() + (self.pos.idx * TRB_LEN) as u64;
        Erdp::new(dequeue, self.pos.seg as u8)
    }
}

pub struct EventRing {
    mmio: MmioHandle,
    interrupter: InterrupterRegisters,
    hci: Arc<dyn HostController>,
    command_ring: Option<Arc<CommandRing>>,
    doorbell_offset: DoorbellOffset,
    hcc_params_1: HccParams1,
    dcbaa: u64,
    erdp_phys: u64,
    consumer: Mutex<Consumer>,
    transfer_rings: Mutex<HashMap<(u8, u8), Arc<TransferRing>>>,
    tasks: TaskQueue,
}

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl EventRing {
    /// Builds the segment table and the first event segments, then programs the interrupter:
    /// `ERSTSZ`, `ERSTBA`, `ERDP`, in that order.
    pub fn init(
        params: &RingParams,
        dma: &dyn DmaAllocator,
        bindings: EventRingBindings,
    ) -> Result<Self> {
        let mut erst = EventRingSegmentTable::init(
            params.page_size,
            &params.bti,
            params.is_32bit,
            bindings.erst_max,
            dma,
        )?;

        let trbs_per_segment = params.page_size / TRB_LEN;
        let size_trbs = u16::try_from(trbs_per_segment)
            .map_err(|_| XhciError::NotSupported("event ring segment larger than 65535 TRBs"))?;
        let count = budget::EVENT_RING_SEGMENTS.min(erst.capacity());
        if count == 0 {
            return Err(XhciError::NotSupported("controller reports no ERST entries"));
        }

        let mut segments = Vec::with_capacity(count);
        for _ in 0..count {
            let segment = dma::alloc_zeroed(dma, &params.bti, params.page_size, params.is_32bit)?;
            erst.add_segment(segment.phys(), size_trbs)?;
            segments.push(segment);
        }

        let consumer = Consumer {
            erst,
            segments,
            trbs_per_segment,
            pos: RingPos::default(),
            ccs: true,
        };

        let EventRingBindings {
            mmio,
            interrupter,
            erst_max: _,
            command_ring,
            doorbell_offset,
            hci,
            hcc_params_1,
            dcbaa,
        } = bindings;

        let erdp = consumer.erdp();
        interrupter.set_erstsz(mmio.as_ref(), consumer.erst.len() as u16);
        interrupter.set_erstba(mmio.as_ref(), consumer.erst.phys());
        interrupter.set_erdp(mmio.as_ref(), erdp);
        debug!(
            interrupter = interrupter.index(),
            erst = consumer.erst.phys(),
            phys = erdp.pointer(),
            segments = consumer.segments.len(),
            "event ring initialized"
        );

        Ok(Self {
            mmio,
            interrupter,
            hci,
            command_ring,
            doorbell_offset,
            hcc_params_1,
            dcbaa,
            erdp_phys: erdp.0,
            consumer: Mutex::new(consumer),
            transfer_rings: Mutex::new(HashMap::new()),
            tasks: TaskQueue::new(),
        })
    }

    /// The `ERDP` value programmed at init: the first event TRB's bus address with EHB set.
    pub fn erdp_phys(&self) -> u64 {
        self.erdp_phys
    }

    pub fn erst_phys(&self) -> u64 {
        relock(&self.consumer).erst.phys()
    }

    pub fn interrupter(&self) -> InterrupterRegisters {
        self.interrupter
    }

    pub fn mmio(&self) -> &MmioHandle {
        &self.mmio
    }

    pub fn host_controller(&self) -> &Arc<dyn HostController> {
        &self.hci
    }

    pub fn command_ring(&self) -> Option<&Arc<CommandRing>> {
        self.command_ring.as_ref()
    }

    pub fn doorbell_offset(&self) -> DoorbellOffset {
        self.doorbell_offset
    }

    pub fn hcc_params_1(&self) -> HccParams1 {
        self.hcc_params_1
    }

    pub fn dcbaa(&self) -> u64 {
        self.dcbaa
    }

    /// Routes Transfer Events for (`slot`, endpoint DCI `endpoint`) to `ring`.
    pub fn register_transfer_ring(&self, slot: u8, endpoint: u8, ring: Arc<TransferRing>) {
        debug!(slot, endpoint, token = ring.token(), "transfer ring registered");
        relock(&self.transfer_rings).insert((slot, endpoint), ring);
    }

    pub fn unregister_transfer_ring(&self, slot: u8, endpoint: u8) -> Option<Arc<TransferRing>> {
        relock(&self.transfer_rings).remove(&(slot, endpoint))
    }

    /// Consumes pending events, up to [`budget::EVENT_DRAIN_BUDGET_PER_IRQ`], then runs the
    /// continuations they resolved. Returns the number of events consumed.
    pub fn handle_irq(&self) -> usize {
        let events = {
            let mut consumer = relock(&self.consumer);
            let mut events = Vec::new();
            while events.len() < budget::EVENT_DRAIN_BUDGET_PER_IRQ {
                let trb = consumer.current();
                if trb.cycle() != consumer.ccs {
                    break;
                }
                events.push(trb);
                consumer.advance();
            }
            // Writing ERDP with EHB set also clears Event Handler Busy when nothing was consumed.
            self.interrupter
                .set_erdp(self.mmio.as_ref(), consumer.erdp());
            events
        };

        for event in &events {
            self.dispatch(event);
        }
        self.run_until_idle();
        events.len()
    }

    fn dispatch(&self, event: &Trb) {
        match event.trb_type() {
            TrbType::TransferEvent => self.complete_transfer(event),
            TrbType::CommandCompletionEvent => match &self.command_ring {
                Some(command_ring) => {
                    if let Err(err) = command_ring.complete(event) {
                        warn!(phys = event.parameter, %err, "dropping command completion");
                    }
                }
                None => warn!(
                    phys = event.parameter,
                    "command completion without a command ring"
                ),
            },
            TrbType::PortStatusChangeEvent => {
                trace!(port = event.port_id(), "port status change");
                self.hci.port_status_changed(event.port_id());
            }
            other => trace!(kind = ?other, "ignoring event"),
        }
    }

    fn complete_transfer(&self, event: &Trb) {
        let slot = event.slot_id();
        let endpoint = event.endpoint_id();
        let phys = event.parameter;
        let Some(ring) = relock(&self.transfer_rings).get(&(slot, endpoint)).cloned() else {
            warn!(slot, endpoint, phys, "transfer event for an unregistered endpoint");
            return;
        };
        let Some(handle) = ring.handle_for_phys(phys) else {
            warn!(slot, endpoint, phys, "transfer event outside the endpoint's ring");
            return;
        };

        if event.completion_code() == CompletionCode::ShortPacket
            && ring.is_inside_oldest_td(handle)
        {
            // ISP on an inner TRB; the TD's last TRB still reports completion.
            trace!(slot, endpoint, phys, "short packet inside a TD");
            return;
        }

        match ring.complete_trb(handle) {
            Ok(context) => context.resolve(event),
            Err(XhciError::Canceled) => {
                warn!(slot, endpoint, phys, "stale completion with nothing pending");
            }
            Err(err @ XhciError::Io { .. }) => {
                error!(slot, endpoint, phys, %err, "tearing down transfer ring");
                for context in ring.take_pending_trbs() {
                    context.fail(err.clone());
                }
                if let Err(err) = ring.deinit_if_active() {
                    error!(slot, endpoint, %err, "transfer ring teardown failed");
                }
            }
            Err(err) => warn!(slot, endpoint, phys, %err, "transfer completion rejected"),
        }
    }

    /// Runs `future` on this ring's scheduler.
    ///
    /// The result is passed through unchanged. A hardware-fatal error additionally shuts the
    /// controller down before the caller observes it.
    pub fn schedule_task(&self, future: TrbFuture) -> TrbFuture {
        let (tx, rx) = oneshot::channel();
        let hci = Arc::clone(&self.hci);
        self.tasks.spawn(
            async move {
                let result = future.await;
                if let Err(err) = &result {
                    if err.is_hardware_fatal() {
                        error!(%err, "hardware-fatal completion, shutting controller down");
                        hci.shutdown(err.clone());
                    }
                }
                // The receiver may already be gone; the shutdown above still happened.
                let _ = tx.send(result);
            }
            .boxed(),
        );
        rx.map(|res| res.unwrap_or(Err(XhciError::Canceled))).boxed()
    }

    /// Drives every runnable continuation to its next suspension point.
    pub fn run_until_idle(&self) -> usize {
        self.tasks.run_until_idle()
    }
}
