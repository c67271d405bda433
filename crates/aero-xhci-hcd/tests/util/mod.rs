#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use aero_xhci_hcd::regs::{cap, op, CapabilityRegisters};
use aero_xhci_hcd::{
    BusTransactionInitiator, CommandRing, DmaAllocator, DmaBuffer, EventRing, EventRingBindings,
    HostController, InterruptObject, Mmio, MmioHandle, RequestOutcome, Result, RingParams, Trb,
    UsbRequest, XhciError, TRB_LEN,
};

pub const PAGE_SIZE: usize = 4096;

/// Routes crate logs to the test harness output; visible with `--nocapture`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

// Register layout of the fake controller.
pub const CAP_LENGTH: u32 = 0x20;
pub const DBOFF: u32 = 0x2000;
pub const RTSOFF: u32 = 0x3000;
/// HCSPARAMS1: 32 slots, 4 interrupters, 4 ports.
pub const HCSPARAMS1: u32 = 32 | (4 << 8) | (4 << 24);
/// HCSPARAMS2: ERST Max = 2^1 entries.
pub const HCSPARAMS2: u32 = 1 << 4;
/// HCCPARAMS1: 64-bit addressing.
pub const HCCPARAMS1: u32 = 1;

/// Flat little-endian physical memory starting at `base`.
#[derive(Clone)]
pub struct PhysMemory {
    base: u64,
    data: Arc<Mutex<Vec<u8>>>,
}

impl PhysMemory {
    pub fn new(base: u64, size: usize) -> Self {
        Self {
            base,
            data: Arc::new(Mutex::new(vec![0; size])),
        }
    }

    pub fn read(&self, addr: u64, buf: &mut [u8]) {
        let start = (addr - self.base) as usize;
        let data = self.data.lock().unwrap();
        buf.copy_from_slice(&data[start..start + buf.len()]);
    }

    pub fn write(&self, addr: u64, buf: &[u8]) {
        let start = (addr - self.base) as usize;
        let mut data = self.data.lock().unwrap();
        data[start..start + buf.len()].copy_from_slice(buf);
    }

    pub fn read_u64(&self, addr: u64) -> u64 {
        let mut bytes = [0u8; 8];
        self.read(addr, &mut bytes);
        u64::from_le_bytes(bytes)
    }

    pub fn read_u16(&self, addr: u64) -> u16 {
        let mut bytes = [0u8; 2];
        self.read(addr, &mut bytes);
        u16::from_le_bytes(bytes)
    }

    pub fn read_trb(&self, addr: u64) -> Trb {
        let mut bytes = [0u8; TRB_LEN];
        self.read(addr, &mut bytes);
        Trb::from_bytes(bytes)
    }

    pub fn write_trb(&self, addr: u64, trb: &Trb) {
        self.write(addr, &trb.to_bytes());
    }
}

pub struct FakeBuffer {
    mem: PhysMemory,
    phys: u64,
    size: usize,
}

impl DmaBuffer for FakeBuffer {
    fn phys(&self) -> u64 {
        self.phys
    }

    fn size(&self) -> usize {
        self.size
    }

    fn read(&self, offset: usize, buf: &mut [u8]) {
        self.mem.read(self.phys + offset as u64, buf);
    }

    fn write(&mut self, offset: usize, data: &[u8]) {
        self.mem.write(self.phys + offset as u64, data);
    }
}

/// Bump allocator handing out pages of [`PhysMemory`].
pub struct FakeDma {
    pub mem: PhysMemory,
    next: AtomicU64,
    end: u64,
    allocations: AtomicUsize,
}

impl FakeDma {
    pub fn new() -> Self {
        Self::at(0x10_0000, 1 << 20)
    }

    /// Memory that lies above the 4GiB boundary.
    pub fn high() -> Self {
        Self::at(0x1_0000_0000, 1 << 20)
    }

    pub fn at(base: u64, size: usize) -> Self {
        Self {
            mem: PhysMemory::new(base, size),
            next: AtomicU64::new(base),
            end: base + size as u64,
            allocations: AtomicUsize::new(0),
        }
    }

    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }
}

impl DmaAllocator for FakeDma {
    fn create_paged(
        &self,
        _bti: &BusTransactionInitiator,
        size: usize,
        _enable_cache: bool,
    ) -> Result<Box<dyn DmaBuffer>> {
        let size = size.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let phys = self.next.fetch_add(size as u64, Ordering::SeqCst);
        if phys + size as u64 > self.end {
            return Err(XhciError::OutOfMemory);
        }
        self.allocations.fetch_add(1, Ordering::SeqCst);
        let mut buffer = FakeBuffer {
            mem: self.mem.clone(),
            phys,
            size,
        };
        // Fresh pages are not guaranteed to be clean.
        buffer.write(0, &vec![0xa5; size]);
        Ok(Box::new(buffer))
    }
}

/// Register file with a write log; unwritten registers read as zero.
#[derive(Default)]
pub struct FakeMmio {
    regs: Mutex<HashMap<u64, u32>>,
    writes: Mutex<Vec<(u64, u32)>>,
}

impl FakeMmio {
    /// A controller with the capability layout described by the constants in this module.
    pub fn controller() -> Arc<Self> {
        let mmio = Arc::new(Self::default());
        mmio.preset(cap::CAPLENGTH, CAP_LENGTH);
        mmio.preset(cap::HCSPARAMS1, HCSPARAMS1);
        mmio.preset(cap::HCSPARAMS2, HCSPARAMS2);
        mmio.preset(cap::HCCPARAMS1, HCCPARAMS1);
        mmio.preset(cap::DBOFF, DBOFF);
        mmio.preset(cap::RTSOFF, RTSOFF);
        mmio.preset(u64::from(CAP_LENGTH) + op::PAGESIZE, 1);
        mmio
    }

    /// Sets a register without logging a write.
    pub fn preset(&self, offset: u64, value: u32) {
        self.regs.lock().unwrap().insert(offset, value);
    }

    pub fn writes(&self) -> Vec<(u64, u32)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn clear_writes(&self) {
        self.writes.lock().unwrap().clear();
    }

    pub fn value(&self, offset: u64) -> u32 {
        self.read32(offset)
    }

    pub fn value64(&self, offset: u64) -> u64 {
        self.read64(offset)
    }

    /// Doorbell writes as `(doorbell index, value)`.
    pub fn doorbells(&self) -> Vec<(u64, u32)> {
        let start = u64::from(DBOFF);
        self.writes()
            .into_iter()
            .filter(|&(offset, _)| (start..start + 256 * 4).contains(&offset))
            .map(|(offset, value)| ((offset - start) / 4, value))
            .collect()
    }
}

impl Mmio for FakeMmio {
    fn read32(&self, offset: u64) -> u32 {
        self.regs.lock().unwrap().get(&offset).copied().unwrap_or(0)
    }

    fn write32(&self, offset: u64, value: u32) {
        self.regs.lock().unwrap().insert(offset, value);
        self.writes.lock().unwrap().push((offset, value));
    }
}

#[derive(Default)]
struct IrqState {
    pending: usize,
    destroyed: bool,
    acks: usize,
}

#[derive(Default)]
pub struct FakeInterrupt {
    state: Mutex<IrqState>,
    cond: Condvar,
}

impl FakeInterrupt {
    pub fn trigger(&self) {
        self.state.lock().unwrap().pending += 1;
        self.cond.notify_all();
    }

    pub fn acks(&self) -> usize {
        self.state.lock().unwrap().acks
    }

    /// Blocks until at least `count` interrupts have been acknowledged.
    pub fn wait_for_acks(&self, count: usize) {
        let mut state = self.state.lock().unwrap();
        while state.acks < count {
            state = self.cond.wait(state).unwrap();
        }
    }
}

impl InterruptObject for FakeInterrupt {
    fn wait(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.destroyed {
                return Err(XhciError::Canceled);
            }
            if state.pending > 0 {
                state.pending -= 1;
                return Ok(());
            }
            state = self.cond.wait(state).unwrap();
        }
    }

    fn ack(&self) {
        self.state.lock().unwrap().acks += 1;
        self.cond.notify_all();
    }

    fn destroy(&self) {
        self.state.lock().unwrap().destroyed = true;
        self.cond.notify_all();
    }
}

#[derive(Default)]
pub struct RecordingHostController {
    pub shutdowns: Mutex<Vec<XhciError>>,
    pub exited: Mutex<Vec<u16>>,
    pub port_changes: Mutex<Vec<u8>>,
}

impl RecordingHostController {
    pub fn shutdowns(&self) -> Vec<XhciError> {
        self.shutdowns.lock().unwrap().clone()
    }

    pub fn exited(&self) -> Vec<u16> {
        self.exited.lock().unwrap().clone()
    }

    pub fn port_changes(&self) -> Vec<u8> {
        self.port_changes.lock().unwrap().clone()
    }
}

impl HostController for RecordingHostController {
    fn shutdown(&self, reason: XhciError) {
        self.shutdowns.lock().unwrap().push(reason);
    }

    fn interrupter_exited(&self, index: u16) {
        self.exited.lock().unwrap().push(index);
    }

    fn port_status_changed(&self, port: u8) {
        self.port_changes.lock().unwrap().push(port);
    }
}

/// Plays the controller's side of the event ring: reads ERSTBA from the register file and posts
/// event TRBs with the producer cycle state.
pub struct FakeHardware {
    mem: PhysMemory,
    segments: Vec<(u64, u16)>,
    seg: usize,
    idx: usize,
    cycle: bool,
}

impl FakeHardware {
    pub fn attach(mem: &PhysMemory, mmio: &FakeMmio, erstsz: u64, erstba: u64) -> Self {
        let count = mmio.value(erstsz) as usize;
        let table = mmio.value64(erstba);
        let segments = (0..count as u64)
            .map(|i| {
                let entry = table + i * 16;
                (mem.read_u64(entry), mem.read_u16(entry + 8))
            })
            .collect();
        Self {
            mem: mem.clone(),
            segments,
            seg: 0,
            idx: 0,
            cycle: true,
        }
    }

    pub fn post(&mut self, event: Trb) {
        let (base, size) = self.segments[self.seg];
        let mut event = event;
        event.set_cycle(self.cycle);
        self.mem.write_trb(base + (self.idx * TRB_LEN) as u64, &event);
        self.idx += 1;
        if self.idx == size as usize {
            self.idx = 0;
            self.seg += 1;
            if self.seg == self.segments.len() {
                self.seg = 0;
                self.cycle = !self.cycle;
            }
        }
    }
}

/// Everything a test needs to drive one interrupter's event ring end to end.
pub struct Harness {
    pub dma: FakeDma,
    pub mmio: Arc<FakeMmio>,
    pub caps: CapabilityRegisters,
    pub params: RingParams,
    pub hci: Arc<RecordingHostController>,
    pub command_ring: Arc<CommandRing>,
    pub event_ring: Arc<EventRing>,
    pub hw: FakeHardware,
}

impl Harness {
    pub fn new() -> Self {
        init_tracing();
        let dma = FakeDma::new();
        let mmio = FakeMmio::controller();
        let handle: MmioHandle = mmio.clone();
        let caps = CapabilityRegisters::read(mmio.as_ref());
        let bti = BusTransactionInitiator::new(7);
        let params = RingParams::from_registers(&caps, mmio.as_ref(), bti);
        let hci = Arc::new(RecordingHostController::default());

        let doorbells = aero_xhci_hcd::regs::Doorbells::new(handle.clone(), caps.doorbell_offset);
        let command_ring = Arc::new(CommandRing::new(doorbells));
        command_ring.init(&params, &dma).unwrap();

        let interrupter = caps.interrupter(0);
        let event_ring = EventRing::init(
            &params,
            &dma,
            EventRingBindings {
                mmio: handle,
                interrupter,
                erst_max: caps.hcs_params_2.erst_max(),
                command_ring: Some(command_ring.clone()),
                doorbell_offset: caps.doorbell_offset,
                hci: hci.clone(),
                hcc_params_1: caps.hcc_params_1,
                dcbaa: 0,
            },
        )
        .unwrap();

        let hw = FakeHardware::attach(
            &dma.mem,
            &mmio,
            interrupter.erstsz_offset(),
            interrupter.erstba_offset(),
        );

        Self {
            dma,
            mmio,
            caps,
            params,
            hci,
            command_ring,
            event_ring: Arc::new(event_ring),
            hw,
        }
    }

    pub fn doorbells(&self) -> aero_xhci_hcd::regs::Doorbells {
        let handle: MmioHandle = self.mmio.clone();
        aero_xhci_hcd::regs::Doorbells::new(handle, self.caps.doorbell_offset)
    }
}

/// Collects request outcomes delivered to completion callbacks.
#[derive(Clone, Default)]
pub struct Outcomes(Arc<Mutex<Vec<RequestOutcome>>>);

impl Outcomes {
    pub fn request(&self, endpoint: u8, length: u64, phys_list: Vec<u64>) -> UsbRequest {
        let sink = self.0.clone();
        UsbRequest::new(1, endpoint, length, phys_list, move |_request, outcome| {
            sink.lock().unwrap().push(outcome);
        })
    }

    pub fn take(&self) -> Vec<RequestOutcome> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}
