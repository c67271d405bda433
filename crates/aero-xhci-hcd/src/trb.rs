//! Transfer Request Block (TRB) encoding.
//!
//! Every descriptor exchanged with the controller is a 16-byte TRB:
//!
//! ```text
//!  0x00  parameter (u64, little-endian)   data buffer pointer / immediate data / command pointer
//!  0x08  status    (u32)                  transfer length, TD size, interrupter target
//!  0x0c  control   (u32)                  cycle (bit 0), per-type flags, TRB type (bits 15:10)
//! ```
//!
//! Bit positions follow xHCI 1.2 §6.4. [`Trb`] is a plain value type; the transfer ring is the only
//! place that decides the cycle bit of a TRB that hardware will see.

use bitflags::bitflags;

use crate::request::SetupPacket;

/// Size of a TRB in bytes.
pub const TRB_LEN: usize = 16;

const TRB_TYPE_SHIFT: u32 = 10;
const TRB_TYPE_MASK: u32 = 0x3f << TRB_TYPE_SHIFT;

const STATUS_LENGTH_MASK: u32 = 0x1_ffff;
const STATUS_TD_SIZE_SHIFT: u32 = 17;
const STATUS_TD_SIZE_MAX: u32 = 0x1f;
const STATUS_INTERRUPTER_SHIFT: u32 = 22;
const STATUS_INTERRUPTER_MASK: u32 = 0x3ff;

const EVENT_RESIDUAL_MASK: u32 = 0x00ff_ffff;
const COMPLETION_CODE_SHIFT: u32 = 24;

const SLOT_ID_SHIFT: u32 = 24;
const ENDPOINT_ID_SHIFT: u32 = 16;
const ENDPOINT_ID_MASK: u32 = 0x1f;

const SETUP_TRT_SHIFT: u32 = 16;
const ADDRESS_DEVICE_BSR: u32 = 1 << 9;

bitflags! {
    /// Per-type flag bits in the TRB control dword.
    ///
    /// Not every flag is meaningful for every TRB type; the builders on [`Trb`] only set the ones
    /// the hardware protocol defines for that type.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct TrbFlags: u32 {
        const CYCLE = 1 << 0;
        /// Link TRB: toggle the consumer cycle state when following the link.
        const TOGGLE_CYCLE = 1 << 1;
        /// Interrupt on short packet.
        const ISP = 1 << 2;
        const NO_SNOOP = 1 << 3;
        const CHAIN = 1 << 4;
        /// Interrupt on completion.
        const IOC = 1 << 5;
        /// Immediate data (Setup Stage).
        const IDT = 1 << 6;
        /// Block event interrupt.
        const BEI = 1 << 9;
        /// Data/Status Stage direction: set for device-to-host.
        const DIR_IN = 1 << 16;
    }
}

/// TRB type tag (control bits 15:10).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TrbType {
    Normal,
    SetupStage,
    DataStage,
    StatusStage,
    Isoch,
    Link,
    EventData,
    NoOp,
    EnableSlotCommand,
    DisableSlotCommand,
    AddressDeviceCommand,
    ConfigureEndpointCommand,
    EvaluateContextCommand,
    ResetEndpointCommand,
    StopEndpointCommand,
    SetTrDequeuePointerCommand,
    ResetDeviceCommand,
    NoOpCommand,
    TransferEvent,
    CommandCompletionEvent,
    PortStatusChangeEvent,
    BandwidthRequestEvent,
    DoorbellEvent,
    HostControllerEvent,
    DeviceNotificationEvent,
    MfindexWrapEvent,
    /// A type value this crate does not name. The raw 6-bit value is preserved.
    Unknown(u8),
}

impl TrbType {
    pub fn raw(self) -> u8 {
        match self {
            TrbType::Normal => 1,
            TrbType::SetupStage => 2,
            TrbType::DataStage => 3,
            TrbType::StatusStage => 4,
            TrbType::Isoch => 5,
            TrbType::Link => 6,
            TrbType::EventData => 7,
            TrbType::NoOp => 8,
            TrbType::EnableSlotCommand => 9,
            TrbType::DisableSlotCommand => 10,
            TrbType::AddressDeviceCommand => 11,
            TrbType::ConfigureEndpointCommand => 12,
            TrbType::EvaluateContextCommand => 13,
            TrbType::ResetEndpointCommand => 14,
            TrbType::StopEndpointCommand => 15,
            TrbType::SetTrDequeuePointerCommand => 16,
            TrbType::ResetDeviceCommand => 17,
            TrbType::NoOpCommand => 23,
            TrbType::TransferEvent => 32,
            TrbType::CommandCompletionEvent => 33,
            TrbType::PortStatusChangeEvent => 34,
            TrbType::BandwidthRequestEvent => 35,
            TrbType::DoorbellEvent => 36,
            TrbType::HostControllerEvent => 37,
            TrbType::DeviceNotificationEvent => 38,
            TrbType::MfindexWrapEvent => 39,
            TrbType::Unknown(raw) => raw & 0x3f,
        }
    }

    pub fn from_raw(raw: u8) -> Self {
        match raw & 0x3f {
            1 => TrbType::Normal,
            2 => TrbType::SetupStage,
            3 => TrbType::DataStage,
            4 => TrbType::StatusStage,
            5 => TrbType::Isoch,
            6 => TrbType::Link,
            7 => TrbType::EventData,
            8 => TrbType::NoOp,
            9 => TrbType::EnableSlotCommand,
            10 => TrbType::DisableSlotCommand,
            11 => TrbType::AddressDeviceCommand,
            12 => TrbType::ConfigureEndpointCommand,
            13 => TrbType::EvaluateContextCommand,
            14 => TrbType::ResetEndpointCommand,
            15 => TrbType::StopEndpointCommand,
            16 => TrbType::SetTrDequeuePointerCommand,
            17 => TrbType::ResetDeviceCommand,
            23 => TrbType::NoOpCommand,
            32 => TrbType::TransferEvent,
            33 => TrbType::CommandCompletionEvent,
            34 => TrbType::PortStatusChangeEvent,
            35 => TrbType::BandwidthRequestEvent,
            36 => TrbType::DoorbellEvent,
            37 => TrbType::HostControllerEvent,
            38 => TrbType::DeviceNotificationEvent,
            39 => TrbType::MfindexWrapEvent,
            other => TrbType::Unknown(other),
        }
    }
}

/// Completion code carried in bits 31:24 of an event TRB's status dword.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompletionCode {
    Invalid,
    Success,
    DataBufferError,
    BabbleDetected,
    UsbTransactionError,
    TrbError,
    StallError,
    ResourceError,
    BandwidthError,
    NoSlotsAvailable,
    SlotNotEnabled,
    EndpointNotEnabled,
    ShortPacket,
    ParameterError,
    ContextStateError,
    EventRingFull,
    CommandRingStopped,
    CommandAborted,
    Stopped,
    Other(u8),
}

impl CompletionCode {
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            0 => CompletionCode::Invalid,
            1 => CompletionCode::Success,
            2 => CompletionCode::DataBufferError,
            3 => CompletionCode::BabbleDetected,
            4 => CompletionCode::UsbTransactionError,
            5 => CompletionCode::TrbError,
            6 => CompletionCode::StallError,
            7 => CompletionCode::ResourceError,
            8 => CompletionCode::BandwidthError,
            9 => CompletionCode::NoSlotsAvailable,
            11 => CompletionCode::SlotNotEnabled,
            12 => CompletionCode::EndpointNotEnabled,
            13 => CompletionCode::ShortPacket,
            17 => CompletionCode::ParameterError,
            19 => CompletionCode::ContextStateError,
            21 => CompletionCode::EventRingFull,
            24 => CompletionCode::CommandRingStopped,
            25 => CompletionCode::CommandAborted,
            26 => CompletionCode::Stopped,
            other => CompletionCode::Other(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            CompletionCode::Invalid => 0,
            CompletionCode::Success => 1,
            CompletionCode::DataBufferError => 2,
            CompletionCode::BabbleDetected => 3,
            CompletionCode::UsbTransactionError => 4,
            CompletionCode::TrbError => 5,
            CompletionCode::StallError => 6,
            CompletionCode::ResourceError => 7,
            CompletionCode::BandwidthError => 8,
            CompletionCode::NoSlotsAvailable => 9,
            CompletionCode::SlotNotEnabled => 11,
            CompletionCode::EndpointNotEnabled => 12,
            CompletionCode::ShortPacket => 13,
            CompletionCode::ParameterError => 17,
            CompletionCode::ContextStateError => 19,
            CompletionCode::EventRingFull => 21,
            CompletionCode::CommandRingStopped => 24,
            CompletionCode::CommandAborted => 25,
            CompletionCode::Stopped => 26,
            CompletionCode::Other(raw) => raw,
        }
    }

    /// Success and short packets both complete the request normally.
    pub fn is_success(self) -> bool {
        matches!(self, CompletionCode::Success | CompletionCode::ShortPacket)
    }
}

/// Transfer Type (TRT) field of a Setup Stage TRB.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferType {
    NoData,
    Out,
    In,
}

impl TransferType {
    pub fn raw(self) -> u32 {
        match self {
            TransferType::NoData => 0,
            TransferType::Out => 2,
            TransferType::In => 3,
        }
    }
}

/// A raw 16-byte TRB.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Trb {
    pub parameter: u64,
    pub status: u32,
    pub control: u32,
}

impl Trb {
    pub const fn new(parameter: u64, status: u32, control: u32) -> Self {
        Self {
            parameter,
            status,
            control,
        }
    }

    pub fn from_bytes(bytes: [u8; TRB_LEN]) -> Self {
        let mut parameter = [0u8; 8];
        parameter.copy_from_slice(&bytes[0..8]);
        Self {
            parameter: u64::from_le_bytes(parameter),
            status: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            control: u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; TRB_LEN] {
        let mut out = [0u8; TRB_LEN];
        out[0..8].copy_from_slice(&self.parameter.to_le_bytes());
        out[8..12].copy_from_slice(&self.status.to_le_bytes());
        out[12..16].copy_from_slice(&self.control.to_le_bytes());
        out
    }

    // ---- control dword ----

    pub fn cycle(&self) -> bool {
        self.control & TrbFlags::CYCLE.bits() != 0
    }

    pub fn set_cycle(&mut self, cycle: bool) {
        if cycle {
            self.control |= TrbFlags::CYCLE.bits();
        } else {
            self.control &= !TrbFlags::CYCLE.bits();
        }
    }

    pub fn flags(&self) -> TrbFlags {
        TrbFlags::from_bits_truncate(self.control)
    }

    pub fn insert_flags(&mut self, flags: TrbFlags) {
        self.control |= flags.bits();
    }

    pub fn remove_flags(&mut self, flags: TrbFlags) {
        self.control &= !flags.bits();
    }

    pub fn trb_type_raw(&self) -> u8 {
        ((self.control & TRB_TYPE_MASK) >> TRB_TYPE_SHIFT) as u8
    }

    pub fn trb_type(&self) -> TrbType {
        TrbType::from_raw(self.trb_type_raw())
    }

    pub fn set_trb_type_raw(&mut self, raw: u8) {
        self.control =
            (self.control & !TRB_TYPE_MASK) | ((u32::from(raw) & 0x3f) << TRB_TYPE_SHIFT);
    }

    pub fn set_trb_type(&mut self, ty: TrbType) {
        self.set_trb_type_raw(ty.raw());
    }

    pub fn slot_id(&self) -> u8 {
        (self.control >> SLOT_ID_SHIFT) as u8
    }

    pub fn set_slot_id(&mut self, slot_id: u8) {
        self.control = (self.control & 0x00ff_ffff) | (u32::from(slot_id) << SLOT_ID_SHIFT);
    }

    pub fn endpoint_id(&self) -> u8 {
        ((self.control >> ENDPOINT_ID_SHIFT) & ENDPOINT_ID_MASK) as u8
    }

    pub fn set_endpoint_id(&mut self, endpoint_id: u8) {
        self.control = (self.control & !(ENDPOINT_ID_MASK << ENDPOINT_ID_SHIFT))
            | ((u32::from(endpoint_id) & ENDPOINT_ID_MASK) << ENDPOINT_ID_SHIFT);
    }

    /// Data/Status Stage direction (DIR), `true` for device-to-host.
    pub fn direction_in(&self) -> bool {
        self.flags().contains(TrbFlags::DIR_IN)
    }

    /// Setup Stage Transfer Type (TRT) raw value.
    pub fn transfer_type_raw(&self) -> u32 {
        (self.control >> SETUP_TRT_SHIFT) & 0x3
    }

    // ---- status dword (transfer TRBs) ----

    pub fn transfer_length(&self) -> u32 {
        self.status & STATUS_LENGTH_MASK
    }

    pub fn td_size(&self) -> u32 {
        (self.status >> STATUS_TD_SIZE_SHIFT) & STATUS_TD_SIZE_MAX
    }

    pub fn interrupter_target(&self) -> u16 {
        ((self.status >> STATUS_INTERRUPTER_SHIFT) & STATUS_INTERRUPTER_MASK) as u16
    }

    // ---- status dword (event TRBs) ----

    pub fn completion_code_raw(&self) -> u8 {
        (self.status >> COMPLETION_CODE_SHIFT) as u8
    }

    pub fn completion_code(&self) -> CompletionCode {
        CompletionCode::from_u8(self.completion_code_raw())
    }

    /// Transfer Event TRB Transfer Length: the number of bytes *not* transferred.
    pub fn event_residual(&self) -> u32 {
        self.status & EVENT_RESIDUAL_MASK
    }

    /// Port Status Change Event: root hub port number.
    pub fn port_id(&self) -> u8 {
        (self.parameter >> 24) as u8
    }

    // ---- builders ----

    /// Status dword shared by Normal/Data/Status TRBs. TD size saturates at 31.
    pub fn transfer_status(length: u32, td_size: u32, interrupter: u16) -> u32 {
        (length & STATUS_LENGTH_MASK)
            | (td_size.min(STATUS_TD_SIZE_MAX) << STATUS_TD_SIZE_SHIFT)
            | ((u32::from(interrupter) & STATUS_INTERRUPTER_MASK) << STATUS_INTERRUPTER_SHIFT)
    }

    fn typed(ty: TrbType, parameter: u64, status: u32, flags: TrbFlags) -> Self {
        let mut trb = Trb::new(parameter, status, flags.bits());
        trb.set_trb_type(ty);
        trb
    }

    /// Setup Stage TRB: the 8-byte setup packet travels as immediate data.
    pub fn setup_stage(setup: &SetupPacket, trt: TransferType, interrupter: u16) -> Self {
        let mut trb = Self::typed(
            TrbType::SetupStage,
            setup.to_parameter(),
            Self::transfer_status(8, 0, interrupter),
            TrbFlags::IDT,
        );
        trb.control |= trt.raw() << SETUP_TRT_SHIFT;
        trb
    }

    pub fn data_stage(
        buffer: u64,
        length: u32,
        td_size: u32,
        interrupter: u16,
        flags: TrbFlags,
    ) -> Self {
        Self::typed(
            TrbType::DataStage,
            buffer,
            Self::transfer_status(length, td_size, interrupter),
            flags,
        )
    }

    /// Status Stage TRB, always interrupting on completion.
    pub fn status_stage(direction_in: bool, interrupter: u16) -> Self {
        let mut flags = TrbFlags::IOC;
        flags.set(TrbFlags::DIR_IN, direction_in);
        Self::typed(
            TrbType::StatusStage,
            0,
            Self::transfer_status(0, 0, interrupter),
            flags,
        )
    }

    pub fn normal(buffer: u64, length: u32, td_size: u32, interrupter: u16, flags: TrbFlags) -> Self {
        Self::typed(
            TrbType::Normal,
            buffer,
            Self::transfer_status(length, td_size, interrupter),
            flags,
        )
    }

    pub fn link(target: u64, toggle_cycle: bool) -> Self {
        let mut flags = TrbFlags::empty();
        flags.set(TrbFlags::TOGGLE_CYCLE, toggle_cycle);
        Self::typed(TrbType::Link, target & !0x0f, 0, flags)
    }

    pub fn enable_slot() -> Self {
        Self::typed(TrbType::EnableSlotCommand, 0, 0, TrbFlags::empty())
    }

    pub fn disable_slot(slot_id: u8) -> Self {
        let mut trb = Self::typed(TrbType::DisableSlotCommand, 0, 0, TrbFlags::empty());
        trb.set_slot_id(slot_id);
        trb
    }

    /// Address Device command. `block_set_address` suppresses the SET_ADDRESS request (BSR).
    pub fn address_device(input_context: u64, slot_id: u8, block_set_address: bool) -> Self {
        let mut trb = Self::typed(
            TrbType::AddressDeviceCommand,
            input_context & !0x0f,
            0,
            TrbFlags::empty(),
        );
        if block_set_address {
            trb.control |= ADDRESS_DEVICE_BSR;
        }
        trb.set_slot_id(slot_id);
        trb
    }

    pub fn noop_command() -> Self {
        Self::typed(TrbType::NoOpCommand, 0, 0, TrbFlags::empty())
    }

    /// Transfer Event TRB, as the controller would post it.
    pub fn transfer_event(
        trb_pointer: u64,
        residual: u32,
        code: CompletionCode,
        slot_id: u8,
        endpoint_id: u8,
    ) -> Self {
        let mut trb = Self::typed(
            TrbType::TransferEvent,
            trb_pointer,
            (residual & EVENT_RESIDUAL_MASK) | (u32::from(code.as_u8()) << COMPLETION_CODE_SHIFT),
            TrbFlags::empty(),
        );
        trb.set_slot_id(slot_id);
        trb.set_endpoint_id(endpoint_id);
        trb
    }

    /// Command Completion Event TRB, as the controller would post it.
    pub fn command_completion_event(command_pointer: u64, code: CompletionCode, slot_id: u8) -> Self {
        let mut trb = Self::typed(
            TrbType::CommandCompletionEvent,
            command_pointer,
            u32::from(code.as_u8()) << COMPLETION_CODE_SHIFT,
            TrbFlags::empty(),
        );
        trb.set_slot_id(slot_id);
        trb
    }

    pub fn port_status_change_event(port: u8) -> Self {
        Self::typed(
            TrbType::PortStatusChangeEvent,
            u64::from(port) << 24,
            u32::from(CompletionCode::Success.as_u8()) << COMPLETION_CODE_SHIFT,
            TrbFlags::empty(),
        )
    }
}
