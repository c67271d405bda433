//! Producer side of a transfer (or command) ring.
//!
//! A ring is a chain of one-page DMA segments. The last slot of every segment holds a Link TRB to
//! the next segment; the Link TRB closing the last segment points back to the first and toggles the
//! consumer cycle state. Software hands a slot to hardware by writing it with the producer cycle
//! state (PCS); everything else in the ring carries the opposite cycle bit and is ignored by the
//! controller.
//!
//! Descriptors are identified by [`TrbHandle`], an opaque slot index. [`TransferRing::phys`] is the
//! single translation from a handle to the bus address hardware reports in events, and
//! [`TransferRing::handle_for_phys`] is its inverse.
//!
//! Each in-flight request is represented by a [`TrbContext`] queued in submission order. Hardware
//! completes descriptors of one ring strictly in order, so [`TransferRing::complete_trb`] always
//! pops the oldest context and verifies it belongs to the completed descriptor.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, error};

use crate::config::RingParams;
use crate::context::TrbContext;
use crate::dma::{self, DmaAllocator, DmaBuffer};
use crate::error::{Result, XhciError};
use crate::regs::Crcr;
use crate::trb::{Trb, TrbFlags, TRB_LEN};

/// Opaque identity of one descriptor slot in a ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrbHandle(u32);

impl TrbHandle {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Producer state snapshot used to roll back a partially built transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingState {
    pcs: bool,
    enqueue: TrbHandle,
    token: u64,
}

impl RingState {
    /// Producer cycle state at the time of the snapshot.
    pub fn pcs(&self) -> bool {
        self.pcs
    }

    /// Slot the next enqueue would have used.
    pub fn enqueue(&self) -> TrbHandle {
        self.enqueue
    }

    /// Generation of the ring the snapshot was taken from.
    pub fn token(&self) -> u64 {
        self.token
    }
}

struct RingInner {
    segments: Vec<Box<dyn DmaBuffer>>,
    trbs_per_segment: usize,
    pcs: bool,
    enqueue: usize,
    /// Oldest slot hardware may still own.
    dequeue: usize,
    last_completed: Option<TrbHandle>,
    pending: VecDeque<TrbContext>,
    token: u64,
    /// Set once completion ordering was violated; cleared by teardown.
    faulted: bool,
    /// The token counter overflowed; the ring can never be brought up again.
    exhausted: bool,
}

impl RingInner {
    fn is_live(&self) -> bool {
        !self.segments.is_empty()
    }

    fn ensure_live(&self) -> Result<()> {
        if !self.is_live() || self.faulted {
            return Err(XhciError::BadState);
        }
        Ok(())
    }

    fn check_token(&self, context: &TrbContext) -> Result<()> {
        if context.token != self.token {
            return Err(XhciError::InvalidToken {
                context: context.token,
                ring: self.token,
            });
        }
        Ok(())
    }

    fn state(&self) -> RingState {
        RingState {
            pcs: self.pcs,
            enqueue: TrbHandle(self.enqueue as u32),
            token: self.token,
        }
    }

    fn check_state(&self, state: &RingState) -> Result<()> {
        let stale = state.token != self.token;
        if !self.is_live() || stale || !self.is_data_slot(state.enqueue.index()) {
            return Err(XhciError::BadState);
        }
        Ok(())
    }

    /// Slots claimed since `state`, oldest first. A snapshot that is not behind the tail (it would
    /// have to pass the consumer to get there) is rejected.
    fn claimed_since(&self, state: &RingState) -> Result<Vec<usize>> {
        let mut claimed = Vec::new();
        let mut index = state.enqueue.index();
        while index != self.enqueue {
            let passes_consumer = index == self.dequeue && !claimed.is_empty();
            if passes_consumer || claimed.len() >= self.slot_count() {
                return Err(XhciError::BadState);
            }
            claimed.push(index);
            index = self.next_slot(index);
        }
        if state.enqueue.index() == self.enqueue && state.pcs != self.pcs {
            return Err(XhciError::BadState);
        }
        Ok(claimed)
    }

    /// Moves the producer back to `state`, re-staling every slot (and Link TRB) claimed since.
    /// Returns the pending contexts that were bound to those slots, newest first.
    fn rewind(&mut self, state: &RingState) -> Result<Vec<TrbContext>> {
        let claimed = self.claimed_since(state)?;
        let mut pcs = state.pcs;
        for &index in &claimed {
            let mut stale = Trb::default();
            stale.set_cycle(!pcs);
            self.write(index, &stale);
            if self.next_slot(index) != index + 1 {
                let segment = index / self.trbs_per_segment;
                self.write_link(segment, false, !pcs);
                if segment + 1 == self.segments.len() {
                    pcs = !pcs;
                }
            }
        }
        self.enqueue = state.enqueue.index();
        self.pcs = state.pcs;

        let mut withdrawn = Vec::new();
        while let Some(context) = self.pending.back() {
            let bound = context
                .trb
                .is_some_and(|trb| claimed.contains(&trb.index()));
            if !bound {
                break;
            }
            withdrawn.extend(self.pending.pop_back());
        }
        Ok(withdrawn)
    }

    /// Whether `trb` lies inside the oldest pending TD, before the descriptor its context waits on.
    fn inside_oldest_td(&self, trb: TrbHandle) -> bool {
        let Some(context) = self.pending.front() else {
            return false;
        };
        let Some(last) = context.trb else {
            return false;
        };
        let mut index = context.first_trb.unwrap_or(last).index();
        if !self.is_data_slot(index) || !self.is_data_slot(last.index()) {
            return false;
        }
        for _ in 0..self.slot_count() {
            if index == last.index() {
                return false;
            }
            if index == trb.index() {
                return true;
            }
            index = self.next_slot(index);
        }
        false
    }

    fn link_slot(&self) -> usize {
        self.trbs_per_segment - 1
    }

    fn slot_count(&self) -> usize {
        self.segments.len() * self.trbs_per_segment
    }

    /// Whether `index` names a slot that can carry a transfer/command TRB.
    fn is_data_slot(&self, index: usize) -> bool {
        index < self.slot_count() && index % self.trbs_per_segment != self.link_slot()
    }

    /// Slot following `index`, skipping over the Link TRB at the end of a segment.
    fn next_slot(&self, index: usize) -> usize {
        let next = index + 1;
        if next % self.trbs_per_segment != self.link_slot() {
            return next;
        }
        let segment = index / self.trbs_per_segment;
        ((segment + 1) % self.segments.len()) * self.trbs_per_segment
    }

    fn locate(&self, index: usize) -> (usize, usize) {
        (
            index / self.trbs_per_segment,
            (index % self.trbs_per_segment) * TRB_LEN,
        )
    }

    fn phys(&self, index: usize) -> u64 {
        let (segment, offset) = self.locate(index);
        self.segments[segment].phys() + offset as u64
    }

    fn write(&mut self, index: usize, trb: &Trb) {
        let (segment, offset) = self.locate(index);
        dma::write_trb(self.segments[segment].as_mut(), offset, trb);
    }

    /// Claims the slot at the tail and advances the enqueue cursor.
    ///
    /// When the cursor crosses a Link TRB the link is handed to hardware with the current PCS
    /// (inheriting `chain` so a TD may span segments), and PCS flips when the link closes the ring.
    fn reserve(&mut self, chain: bool) -> Result<usize> {
        let index = self.enqueue;
        let next = self.next_slot(index);
        if next == self.dequeue {
            return Err(XhciError::RingFull);
        }

        if next != index + 1 {
            let segment = index / self.trbs_per_segment;
            self.write_link(segment, chain, self.pcs);
            if segment + 1 == self.segments.len() {
                self.pcs = !self.pcs;
            }
        }

        self.enqueue = next;
        Ok(index)
    }

    fn write_link(&mut self, segment: usize, chain: bool, cycle: bool) {
        let last = segment + 1 == self.segments.len();
        let target = self.segments[(segment + 1) % self.segments.len()].phys();
        let mut link = Trb::link(target, last);
        if chain {
            link.insert_flags(TrbFlags::CHAIN);
        }
        link.set_cycle(cycle);
        self.write(segment * self.trbs_per_segment + self.link_slot(), &link);
    }

    /// Whether the slot right after `index` is a segment's Link TRB.
    fn precedes_link(&self, index: usize) -> bool {
        (index + 1) % self.trbs_per_segment == self.link_slot()
    }

    fn reset_cursor(&mut self) {
        self.pcs = true;
        self.enqueue = 0;
        self.dequeue = 0;
        self.last_completed = None;
    }
}

/// Thread-safe circular descriptor buffer for one endpoint (or the command ring).
pub struct TransferRing {
    inner: Mutex<RingInner>,
    /// Serialises multi-descriptor transaction builders so their contexts enter the pending FIFO in
    /// ring order. Never held while the ring lock is waited on by the interrupt path.
    producer: Mutex<()>,
}

impl Default for TransferRing {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferRing {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RingInner {
                segments: Vec::new(),
                trbs_per_segment: 0,
                pcs: true,
                enqueue: 0,
                dequeue: 0,
                last_completed: None,
                pending: VecDeque::new(),
                token: 0,
                faulted: false,
                exhausted: false,
            }),
            producer: Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RingInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Serialises transaction builders on this ring; hold the guard from the first
    /// [`allocate_trb`](Self::allocate_trb) until the closing context is queued.
    pub fn lock_producer(&self) -> MutexGuard<'_, ()> {
        match self.producer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Allocates the segment chain and anchors the ring at its first descriptor.
    pub fn init(&self, params: &RingParams, dma: &dyn DmaAllocator) -> Result<()> {
        let mut inner = self.lock();
        if inner.is_live() {
            return Err(XhciError::AlreadyInitialized);
        }
        if inner.exhausted {
            return Err(XhciError::BadState);
        }
        let trbs_per_segment = params.trbs_per_segment();
        if !params.page_size.is_power_of_two() || trbs_per_segment < 2 {
            return Err(XhciError::NotSupported("page size too small for a TRB segment"));
        }
        if params.segments == 0 || params.segments * trbs_per_segment > u32::MAX as usize {
            return Err(XhciError::NotSupported("transfer ring segment count"));
        }

        let mut segments = Vec::with_capacity(params.segments);
        for _ in 0..params.segments {
            segments.push(dma::alloc_zeroed(
                dma,
                &params.bti,
                params.page_size,
                params.is_32bit,
            )?);
        }

        inner.segments = segments;
        inner.trbs_per_segment = trbs_per_segment;
        inner.faulted = false;
        inner.reset_cursor();
        debug!(
            token = inner.token,
            segments = params.segments,
            phys = inner.phys(0),
            "transfer ring initialized"
        );
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.lock().is_live()
    }

    /// Current generation token. Contexts must carry this value to be accepted.
    pub fn token(&self) -> u64 {
        self.lock().token
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Reserves the tail descriptor without handing it to hardware.
    ///
    /// The slot is cleared and written with a stale cycle bit, so the controller stops in front of
    /// it. The returned snapshot is the producer state *before* the reservation: restoring it
    /// releases the slot again, and its PCS is the cycle bit [`publish_trb`](Self::publish_trb)
    /// must give the descriptor.
    pub fn allocate_trb(&self) -> Result<(TrbHandle, RingState)> {
        let mut inner = self.lock();
        inner.ensure_live()?;
        let state = inner.state();
        let index = inner.reserve(false)?;
        let mut empty = Trb::default();
        empty.set_cycle(!state.pcs);
        inner.write(index, &empty);
        Ok((TrbHandle(index as u32), state))
    }

    /// Writes `trb` at the tail with the ring's cycle bit and optionally queues `context` for it.
    ///
    /// A context that closes a multi-descriptor TD should carry the TD's first descriptor (see
    /// [`TrbContext::starting_at`]); otherwise the TD is taken to be `trb` alone.
    ///
    /// A context built against another generation is failed with
    /// [`XhciError::InvalidToken`] and nothing is written.
    pub fn add_trb(&self, trb: &Trb, context: Option<TrbContext>) -> Result<TrbHandle> {
        let mut inner = self.lock();
        let checked = inner.ensure_live().and_then(|()| match &context {
            Some(context) => inner.check_token(context),
            None => Ok(()),
        });
        if let Err(err) = checked {
            drop(inner);
            if let Some(context) = context {
                context.fail(err.clone());
            }
            return Err(err);
        }

        let pcs = inner.pcs;
        let index = match inner.reserve(trb.flags().contains(TrbFlags::CHAIN)) {
            Ok(index) => index,
            Err(err) => {
                drop(inner);
                if let Some(context) = context {
                    context.fail(err.clone());
                }
                return Err(err);
            }
        };
        let mut contents = *trb;
        contents.set_cycle(pcs);
        inner.write(index, &contents);

        let handle = TrbHandle(index as u32);
        if let Some(mut context) = context {
            context.trb = Some(handle);
            context.first_trb.get_or_insert(handle);
            inner.pending.push_back(context);
        }
        Ok(handle)
    }

    /// Binds `context` to a descriptor reserved with [`allocate_trb`](Self::allocate_trb).
    ///
    /// `first` is the first descriptor of the transaction the context closes.
    pub fn assign_context(
        &self,
        trb: TrbHandle,
        mut context: TrbContext,
        first: TrbHandle,
    ) -> Result<()> {
        let mut inner = self.lock();
        let checked = inner.ensure_live().and_then(|()| {
            inner.check_token(&context)?;
            if !inner.is_data_slot(trb.index()) || !inner.is_data_slot(first.index()) {
                return Err(XhciError::BadState);
            }
            Ok(())
        });
        if let Err(err) = checked {
            drop(inner);
            context.fail(err.clone());
            return Err(err);
        }
        context.trb = Some(trb);
        context.first_trb = Some(first);
        inner.pending.push_back(context);
        Ok(())
    }

    /// Writes the final contents of a reserved descriptor and hands it to hardware.
    ///
    /// `state` must be the snapshot returned with `trb`; its PCS becomes the descriptor's cycle
    /// bit, and the control dword is written last. Publishing the first descriptor of a
    /// transaction after all later ones exposes the whole transaction at once.
    pub fn publish_trb(&self, trb: TrbHandle, contents: &Trb, state: &RingState) -> Result<()> {
        let mut inner = self.lock();
        inner.ensure_live()?;
        inner.check_state(state)?;
        if state.enqueue != trb {
            return Err(XhciError::BadState);
        }
        let mut contents = *contents;
        contents.set_cycle(state.pcs);
        if inner.precedes_link(trb.index()) {
            // Hardware stops in front of `trb`, so the link it guards can still be rewritten.
            let segment = trb.index() / inner.trbs_per_segment;
            let chain = contents.flags().contains(TrbFlags::CHAIN);
            inner.write_link(segment, chain, state.pcs);
        }
        inner.write(trb.index(), &contents);
        Ok(())
    }

    /// Pops the oldest pending context, which must belong to `trb`.
    ///
    /// Fails with [`XhciError::Canceled`] when nothing is pending (a spurious or stale event). If
    /// the oldest context belongs to another descriptor the ring's ordering can no longer be
    /// trusted: the popped context is failed and discarded, the ring is marked faulted and
    /// [`XhciError::Io`] is returned. The caller must tear the ring down.
    pub fn complete_trb(&self, trb: TrbHandle) -> Result<TrbContext> {
        let mut inner = self.lock();
        let Some(context) = inner.pending.pop_front() else {
            return Err(XhciError::Canceled);
        };
        inner.last_completed = Some(trb);

        if context.trb != Some(trb) {
            inner.faulted = true;
            let phys_of = |handle: Option<TrbHandle>| match handle {
                Some(handle) if inner.is_data_slot(handle.index()) => inner.phys(handle.index()),
                _ => 0,
            };
            let err = XhciError::Io {
                expected: phys_of(context.trb),
                completed: phys_of(Some(trb)),
            };
            error!(token = inner.token, %err, "transfer ring completion out of order");
            drop(inner);
            context.fail(err.clone());
            return Err(err);
        }

        if inner.is_data_slot(trb.index()) {
            inner.dequeue = inner.next_slot(trb.index());
        }
        Ok(context)
    }

    pub fn save_state(&self) -> RingState {
        self.lock().state()
    }

    /// Rolls the producer back to `state`.
    ///
    /// Every slot claimed since the snapshot is rewritten with a stale cycle bit, and Link TRBs
    /// crossed since are taken back from hardware, so nothing a failed transaction wrote stays
    /// executable. Contexts queued for those slots are failed with [`XhciError::Canceled`].
    /// A snapshot from another generation is rejected with [`XhciError::BadState`].
    pub fn restore(&self, state: &RingState) -> Result<()> {
        self.rollback(state, XhciError::Canceled)
    }

    /// [`restore`](Self::restore), failing the withdrawn contexts with `err`.
    pub fn rollback(&self, state: &RingState, err: XhciError) -> Result<()> {
        let mut inner = self.lock();
        inner.check_state(state)?;
        let withdrawn = inner.rewind(state)?;
        drop(inner);
        for context in withdrawn {
            context.fail(err.clone());
        }
        Ok(())
    }

    /// Hook for doorbell batching policies. Descriptors are visible as soon as they are written,
    /// so there is nothing to finalise.
    pub fn commit_transaction(&self, _start: &RingState) {}

    /// Detaches every pending context, e.g. to fail outstanding requests during teardown.
    pub fn take_pending_trbs(&self) -> VecDeque<TrbContext> {
        std::mem::take(&mut self.lock().pending)
    }

    /// Tears the ring down and moves to the next generation. Contexts still pending are failed
    /// with [`XhciError::Canceled`].
    pub fn deinit(&self) -> Result<()> {
        self.teardown(true)
    }

    /// Like [`deinit`](Self::deinit), but a ring that is already down is not an error.
    pub fn deinit_if_active(&self) -> Result<()> {
        self.teardown(false)
    }

    fn teardown(&self, strict: bool) -> Result<()> {
        let mut inner = self.lock();
        if !inner.is_live() {
            return if strict { Err(XhciError::BadState) } else { Ok(()) };
        }
        inner.segments.clear();
        inner.trbs_per_segment = 0;
        inner.faulted = false;
        inner.reset_cursor();
        let bumped = match inner.token.checked_add(1) {
            Some(token) => {
                inner.token = token;
                Ok(())
            }
            None => {
                inner.exhausted = true;
                Err(XhciError::BadState)
            }
        };
        let pending = std::mem::take(&mut inner.pending);
        debug!(
            token = inner.token,
            pending = pending.len(),
            "transfer ring torn down"
        );
        drop(inner);

        for context in pending {
            context.fail(XhciError::Canceled);
        }
        bumped
    }

    /// Bus address of a descriptor, as written into link/pointer fields and reported in events.
    pub fn phys(&self, trb: TrbHandle) -> Result<u64> {
        let inner = self.lock();
        if !inner.is_live() || !inner.is_data_slot(trb.index()) {
            return Err(XhciError::BadState);
        }
        Ok(inner.phys(trb.index()))
    }

    /// Maps a bus address reported by hardware back to the descriptor at that address.
    pub fn handle_for_phys(&self, phys: u64) -> Option<TrbHandle> {
        let inner = self.lock();
        let page = (inner.trbs_per_segment * TRB_LEN) as u64;
        inner
            .segments
            .iter()
            .enumerate()
            .find_map(|(segment, buffer)| {
                let offset = phys.checked_sub(buffer.phys())?;
                if offset >= page || offset % TRB_LEN as u64 != 0 {
                    return None;
                }
                Some(segment * inner.trbs_per_segment + (offset / TRB_LEN as u64) as usize)
            })
            .filter(|&index| inner.is_data_slot(index))
            .map(|index| TrbHandle(index as u32))
    }

    /// Reads back a descriptor as currently stored in DMA memory.
    pub fn read(&self, trb: TrbHandle) -> Result<Trb> {
        let inner = self.lock();
        if !inner.is_live() || !inner.is_data_slot(trb.index()) {
            return Err(XhciError::BadState);
        }
        let (segment, offset) = inner.locate(trb.index());
        Ok(dma::read_trb(inner.segments[segment].as_ref(), offset))
    }

    /// Descriptor following `trb` in ring order.
    pub fn next(&self, trb: TrbHandle) -> Result<TrbHandle> {
        let inner = self.lock();
        if !inner.is_live() || !inner.is_data_slot(trb.index()) {
            return Err(XhciError::BadState);
        }
        Ok(TrbHandle(inner.next_slot(trb.index()) as u32))
    }

    /// Whether `trb` belongs to the oldest pending TD without being the descriptor that completes
    /// it. Events for such descriptors (Short Packet with ISP) precede the TD's completion.
    pub fn is_inside_oldest_td(&self, trb: TrbHandle) -> bool {
        self.lock().inside_oldest_td(trb)
    }

    /// The descriptor most recently passed to [`complete_trb`](Self::complete_trb).
    pub fn last_completed(&self) -> Option<TrbHandle> {
        self.lock().last_completed
    }

    /// First descriptor of the ring with the initial cycle state in bit 0, as programmed into an
    /// Endpoint Context TR Dequeue Pointer.
    pub fn dequeue_pointer(&self) -> Result<u64> {
        let inner = self.lock();
        if !inner.is_live() {
            return Err(XhciError::BadState);
        }
        Ok(inner.phys(inner.dequeue) | u64::from(inner.pcs))
    }

    /// CRCR value pointing the controller at this ring (command ring use).
    pub fn crcr(&self) -> Result<Crcr> {
        let inner = self.lock();
        if !inner.is_live() {
            return Err(XhciError::BadState);
        }
        Ok(Crcr::new(inner.phys(0), inner.pcs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::BusTransactionInitiator;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct PageBuffer {
        phys: u64,
        data: Vec<u8>,
    }

    impl DmaBuffer for PageBuffer {
        fn phys(&self) -> u64 {
            self.phys
        }

        fn size(&self) -> usize {
            self.data.len()
        }

        fn read(&self, offset: usize, buf: &mut [u8]) {
            buf.copy_from_slice(&self.data[offset..offset + buf.len()]);
        }

        fn write(&mut self, offset: usize, data: &[u8]) {
            self.data[offset..offset + data.len()].copy_from_slice(data);
        }
    }

    struct PageAllocator {
        next: AtomicU64,
    }

    impl PageAllocator {
        fn new() -> Self {
            Self {
                next: AtomicU64::new(0x10_0000),
            }
        }
    }

    impl DmaAllocator for PageAllocator {
        fn create_paged(
            &self,
            _bti: &BusTransactionInitiator,
            size: usize,
            _enable_cache: bool,
        ) -> Result<Box<dyn DmaBuffer>> {
            let phys = self.next.fetch_add(size as u64, Ordering::Relaxed);
            Ok(Box::new(PageBuffer {
                phys,
                data: vec![0xa5; size],
            }))
        }
    }

    fn small_ring(segments: usize) -> TransferRing {
        let ring = TransferRing::new();
        let params = RingParams {
            page_size: 64,
            segments,
            ..RingParams::default()
        };
        ring.init(&params, &PageAllocator::new()).unwrap();
        ring
    }

    #[test]
    fn init_writes_nothing_hardware_would_consume() {
        let ring = small_ring(1);
        let (first, state) = ring.allocate_trb().unwrap();
        assert!(state.pcs());
        assert!(!ring.read(first).unwrap().cycle());
        assert_eq!(ring.dequeue_pointer().unwrap(), ring.phys(first).unwrap() | 1);
    }

    #[test]
    fn wrapping_the_last_segment_toggles_pcs_and_writes_a_live_link() {
        // 4 slots per segment: three usable slots and a link.
        let ring = small_ring(2);
        let mut handles = Vec::new();
        for _ in 0..3 {
            let handle = ring.add_trb(&Trb::noop_command(), Some(TrbContext::new(0))).unwrap();
            handles.push(handle);
        }
        assert!(ring.save_state().pcs());

        // Free the slots so the producer can wrap.
        for handle in &handles {
            ring.complete_trb(*handle).unwrap();
        }
        for _ in 0..4 {
            let handle = ring.add_trb(&Trb::noop_command(), Some(TrbContext::new(0))).unwrap();
            ring.complete_trb(handle).unwrap();
        }
        let state = ring.save_state();
        assert!(!state.pcs());
        assert_eq!(ring.phys(state.enqueue()).unwrap(), ring.phys(handles[0]).unwrap() + 16);
    }

    #[test]
    fn restore_takes_back_descriptors_and_links_written_since_the_snapshot() {
        let ring = small_ring(2);
        let start = ring.save_state();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let chained = Trb::normal(0x8000, 8, 0, 0, TrbFlags::CHAIN);
                ring.add_trb(&chained, None).unwrap()
            })
            .collect();
        let link = |ring: &TransferRing| {
            let inner = ring.lock();
            dma::read_trb(inner.segments[0].as_ref(), 3 * TRB_LEN)
        };
        assert!(link(&ring).cycle());

        ring.restore(&start).unwrap();
        assert_eq!(ring.save_state(), start);
        for handle in handles {
            assert!(!ring.read(handle).unwrap().cycle());
        }
        assert!(!link(&ring).cycle());
    }

    #[test]
    fn restore_rejects_a_snapshot_ahead_of_the_tail() {
        let ring = small_ring(1);
        ring.add_trb(&Trb::noop_command(), None).unwrap();
        let tail = ring.save_state();
        let ahead = RingState {
            enqueue: ring.next(tail.enqueue()).unwrap(),
            ..tail
        };
        assert_eq!(ring.restore(&ahead), Err(XhciError::BadState));
        assert_eq!(ring.save_state(), tail);
        ring.restore(&tail).unwrap();
    }

    #[test]
    fn producer_refuses_to_overrun_the_consumer() {
        let ring = small_ring(1);
        ring.add_trb(&Trb::noop_command(), None).unwrap();
        ring.add_trb(&Trb::noop_command(), None).unwrap();
        assert_eq!(
            ring.add_trb(&Trb::noop_command(), None),
            Err(XhciError::RingFull)
        );
    }

    #[test]
    fn handle_for_phys_ignores_link_slots_and_foreign_addresses() {
        let ring = small_ring(1);
        let handle = ring.add_trb(&Trb::noop_command(), None).unwrap();
        let phys = ring.phys(handle).unwrap();
        assert_eq!(ring.handle_for_phys(phys), Some(handle));
        assert_eq!(ring.handle_for_phys(phys + 3 * 16), None);
        assert_eq!(ring.handle_for_phys(phys + 8), None);
        assert_eq!(ring.handle_for_phys(0x1000), None);
    }

    #[test]
    fn faulted_ring_rejects_work_until_reinitialised() {
        let ring = small_ring(1);
        ring.add_trb(&Trb::noop_command(), Some(TrbContext::new(0))).unwrap();
        let b = ring.add_trb(&Trb::noop_command(), Some(TrbContext::new(0))).unwrap();
        assert!(matches!(ring.complete_trb(b), Err(XhciError::Io { .. })));
        assert_eq!(ring.allocate_trb().unwrap_err(), XhciError::BadState);
        assert_eq!(ring.pending_count(), 1);

        ring.deinit().unwrap();
        let params = RingParams {
            page_size: 64,
            ..RingParams::default()
        };
        ring.init(&params, &PageAllocator::new()).unwrap();
        assert_eq!(ring.token(), 1);
        ring.add_trb(&Trb::noop_command(), Some(TrbContext::new(1))).unwrap();
    }
}
