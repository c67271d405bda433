//! xHCI register offsets, bit definitions and typed register values.
//!
//! Offsets and layouts follow xHCI 1.2 chapter 5. Values read from or written to the controller
//! through these helpers are register-exact; nothing here caches hardware state.

use bitflags::bitflags;

use crate::mmio::{Mmio, MmioHandle};

/// Capability registers (base of MMIO region).
pub mod cap {
    /// CAPLENGTH (u8): Capability register length (offset to operational registers).
    pub const CAPLENGTH: u64 = 0x00;
    /// HCIVERSION (u16): Interface version number.
    pub const HCIVERSION: u64 = 0x02;
    pub const HCSPARAMS1: u64 = 0x04;
    pub const HCSPARAMS2: u64 = 0x08;
    pub const HCSPARAMS3: u64 = 0x0c;
    pub const HCCPARAMS1: u64 = 0x10;
    /// DBOFF (u32): Doorbell array offset.
    pub const DBOFF: u64 = 0x14;
    /// RTSOFF (u32): Runtime registers offset.
    pub const RTSOFF: u64 = 0x18;
    pub const HCCPARAMS2: u64 = 0x1c;
}

/// Operational registers (base at `CAPLENGTH`).
pub mod op {
    pub const USBCMD: u64 = 0x00;
    pub const USBSTS: u64 = 0x04;
    pub const PAGESIZE: u64 = 0x08;
    pub const DNCTRL: u64 = 0x14;
    pub const CRCR: u64 = 0x18;
    pub const DCBAAP: u64 = 0x30;
    pub const CONFIG: u64 = 0x38;
}

/// Runtime registers (base at `RTSOFF`).
pub mod runtime {
    /// Microframe Index register.
    pub const MFINDEX: u64 = 0x00;

    /// Offset of interrupter register set 0.
    pub const INTERRUPTER_BASE: u64 = 0x20;
    /// Interrupter register block stride in bytes.
    pub const INTERRUPTER_STRIDE: u64 = 0x20;

    // Offsets within one interrupter register set.
    pub const IMAN: u64 = 0x00;
    pub const IMOD: u64 = 0x04;
    pub const ERSTSZ: u64 = 0x08;
    pub const ERSTBA: u64 = 0x10;
    pub const ERDP: u64 = 0x18;
}

/// Doorbell register array (base at `DBOFF`).
pub mod doorbell {
    /// Doorbell register stride in bytes.
    pub const DOORBELL_STRIDE: u64 = 0x04;
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct UsbCmd: u32 {
        const RUN_STOP = 1 << 0;
        const HCRST = 1 << 1;
        const INTE = 1 << 2;
        const HSEE = 1 << 3;
        const EWE = 1 << 10;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct UsbSts: u32 {
        const HCH = 1 << 0;
        const HSE = 1 << 2;
        const EINT = 1 << 3;
        const PCD = 1 << 4;
        const CNR = 1 << 11;
        const HCE = 1 << 12;
    }
}

bitflags! {
    /// Interrupter Management register.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Iman: u32 {
        /// Interrupt Pending (RW1C).
        const IP = 1 << 0;
        /// Interrupt Enable.
        const IE = 1 << 1;
    }
}

/// HCSPARAMS1: structural parameters 1.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HcsParams1(pub u32);

/// Device IDs past the slot range taken by the USB 2 and USB 3 root hubs.
pub const ROOT_HUB_DEVICE_COUNT: usize = 2;

impl HcsParams1 {
    pub fn max_slots(self) -> u8 {
        self.0 as u8
    }

    /// Number of device IDs the bus layer must provide: one per slot plus the root hubs.
    pub fn max_device_count(self) -> usize {
        usize::from(self.max_slots()) + ROOT_HUB_DEVICE_COUNT
    }

    pub fn max_intrs(self) -> u16 {
        ((self.0 >> 8) & 0x7ff) as u16
    }

    pub fn max_ports(self) -> u8 {
        (self.0 >> 24) as u8
    }
}

/// HCSPARAMS2: structural parameters 2.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HcsParams2(pub u32);

impl HcsParams2 {
    /// Maximum number of Event Ring Segment Table entries (`2^ERST Max`).
    pub fn erst_max(self) -> u32 {
        1 << ((self.0 >> 4) & 0xf)
    }

    pub fn max_scratchpad_buffers(self) -> u32 {
        let hi = (self.0 >> 21) & 0x1f;
        let lo = (self.0 >> 27) & 0x1f;
        (hi << 5) | lo
    }
}

/// HCCPARAMS1: capability parameters 1.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HccParams1(pub u32);

impl HccParams1 {
    /// 64-bit addressing capability.
    pub fn ac64(self) -> bool {
        self.0 & 1 != 0
    }

    /// Context size: `true` for 64-byte contexts.
    pub fn csz(self) -> bool {
        self.0 & (1 << 2) != 0
    }

    /// Extended capabilities pointer, in dwords from the MMIO base.
    pub fn xecp(self) -> u16 {
        (self.0 >> 16) as u16
    }
}

/// ERDP value: dequeue pointer plus segment index (DESI) and Event Handler Busy (EHB, RW1C).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Erdp(pub u64);

impl Erdp {
    pub const EHB: u64 = 1 << 3;

    /// Builds the value software writes after consuming events. EHB is always written as 1 so the
    /// busy flag is cleared.
    pub fn new(dequeue: u64, segment_index: u8) -> Self {
        Self((dequeue & !0x0f) | u64::from(segment_index & 0x7) | Self::EHB)
    }

    pub fn pointer(self) -> u64 {
        self.0 & !0x0f
    }

    pub fn segment_index(self) -> u8 {
        (self.0 & 0x7) as u8
    }
}

/// Command Ring Control Register value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Crcr(pub u64);

impl Crcr {
    pub fn new(ring_start: u64, cycle_state: bool) -> Self {
        Self((ring_start & !0x3f) | u64::from(cycle_state))
    }

    pub fn pointer(self) -> u64 {
        self.0 & !0x3f
    }

    /// Ring Cycle State.
    pub fn rcs(self) -> bool {
        self.0 & 1 != 0
    }
}

/// DBOFF register: doorbell array offset from the MMIO base.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DoorbellOffset(pub u32);

impl DoorbellOffset {
    pub fn read(mmio: &dyn Mmio) -> Self {
        Self(mmio.read32(cap::DBOFF))
    }

    pub fn offset(self) -> u64 {
        u64::from(self.0 & !0x3)
    }

    /// Byte offset of doorbell register `index` (0 = command ring, n = slot n).
    pub fn doorbell(self, index: u8) -> u64 {
        self.offset() + u64::from(index) * doorbell::DOORBELL_STRIDE
    }
}

/// RTSOFF register: runtime register space offset from the MMIO base.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RuntimeRegisterOffset(pub u32);

impl RuntimeRegisterOffset {
    pub fn read(mmio: &dyn Mmio) -> Self {
        Self(mmio.read32(cap::RTSOFF))
    }

    pub fn offset(self) -> u64 {
        u64::from(self.0 & !0x1f)
    }
}

/// Doorbell register value: DB Target in bits 7:0, DB Stream ID in bits 31:16.
pub fn doorbell_value(target: u8, stream_id: u16) -> u32 {
    u32::from(target) | (u32::from(stream_id) << 16)
}

/// Capability register snapshot taken once at controller bring-up.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CapabilityRegisters {
    pub cap_length: u8,
    pub hcs_params_1: HcsParams1,
    pub hcs_params_2: HcsParams2,
    pub hcc_params_1: HccParams1,
    pub doorbell_offset: DoorbellOffset,
    pub runtime_offset: RuntimeRegisterOffset,
}

impl CapabilityRegisters {
    pub fn read(mmio: &dyn Mmio) -> Self {
        Self {
            cap_length: mmio.read32(cap::CAPLENGTH) as u8,
            hcs_params_1: HcsParams1(mmio.read32(cap::HCSPARAMS1)),
            hcs_params_2: HcsParams2(mmio.read32(cap::HCSPARAMS2)),
            hcc_params_1: HccParams1(mmio.read32(cap::HCCPARAMS1)),
            doorbell_offset: DoorbellOffset::read(mmio),
            runtime_offset: RuntimeRegisterOffset::read(mmio),
        }
    }

    /// Byte offset of operational register `reg` (see [`op`]).
    pub fn op(&self, reg: u64) -> u64 {
        u64::from(self.cap_length) + reg
    }

    /// Controller page size in bytes, from the PAGESIZE register.
    pub fn page_size(&self, mmio: &dyn Mmio) -> usize {
        let bits = mmio.read32(self.op(op::PAGESIZE)) & 0xffff;
        if bits == 0 {
            return 4096;
        }
        4096usize << bits.trailing_zeros()
    }

    pub fn interrupter(&self, index: u16) -> InterrupterRegisters {
        InterrupterRegisters::new(self.runtime_offset, index)
    }
}

/// Register view over one interrupter register set (IMAN, IMOD, ERSTSZ, ERSTBA, ERDP).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InterrupterRegisters {
    base: u64,
    index: u16,
}

impl InterrupterRegisters {
    pub fn new(runtime: RuntimeRegisterOffset, index: u16) -> Self {
        Self {
            base: runtime.offset()
                + runtime::INTERRUPTER_BASE
                + u64::from(index) * runtime::INTERRUPTER_STRIDE,
            index,
        }
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn iman_offset(&self) -> u64 {
        self.base + runtime::IMAN
    }

    pub fn erstsz_offset(&self) -> u64 {
        self.base + runtime::ERSTSZ
    }

    pub fn erstba_offset(&self) -> u64 {
        self.base + runtime::ERSTBA
    }

    pub fn erdp_offset(&self) -> u64 {
        self.base + runtime::ERDP
    }

    pub fn iman(&self, mmio: &dyn Mmio) -> Iman {
        Iman::from_bits_retain(mmio.read32(self.iman_offset()))
    }

    pub fn set_iman(&self, mmio: &dyn Mmio, value: Iman) {
        mmio.write32(self.iman_offset(), value.bits());
    }

    /// Acknowledges a pending interrupt (IP is write-1-to-clear) while keeping it enabled.
    pub fn rearm(&self, mmio: &dyn Mmio) {
        self.set_iman(mmio, Iman::IP | Iman::IE);
    }

    pub fn set_erstsz(&self, mmio: &dyn Mmio, segments: u16) {
        mmio.write32(self.erstsz_offset(), u32::from(segments));
    }

    pub fn set_erstba(&self, mmio: &dyn Mmio, table: u64) {
        mmio.write64(self.erstba_offset(), table & !0x3f);
    }

    pub fn erdp(&self, mmio: &dyn Mmio) -> Erdp {
        Erdp(mmio.read64(self.erdp_offset()))
    }

    pub fn set_erdp(&self, mmio: &dyn Mmio, erdp: Erdp) {
        mmio.write64(self.erdp_offset(), erdp.0);
    }
}

/// Doorbell array writer.
#[derive(Clone)]
pub struct Doorbells {
    mmio: MmioHandle,
    offset: DoorbellOffset,
}

impl Doorbells {
    pub fn new(mmio: MmioHandle, offset: DoorbellOffset) -> Self {
        Self { mmio, offset }
    }

    /// Rings doorbell `index` for `target`. Callers must have finished writing every TRB the
    /// doorbell announces and must not hold a ring lock.
    pub fn ring(&self, index: u8, target: u8, stream_id: u16) {
        self.mmio
            .write32(self.offset.doorbell(index), doorbell_value(target, stream_id));
    }
}
