//! Transfer Request Block layout and the TRB subtypes the driver core uses.
//!
//! [USB xHCI spec](https://www.intel.com/content/dam/www/public/us/en/documents/technical-specifications/extensible-host-controler-interface-usb-xhci.pdf#page=466)

use core::fmt;
use core::fmt::{Display, Formatter};
use x86_64::PhysAddr;

/// A 16-byte TRB as the controller sees it: 8-byte parameter, 4-byte status,
/// 4-byte control. The control word carries the cycle bit, the 6-bit type and
/// type-specific flags.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct Trb {
    pub parameter: u64,
    pub status: u32,
    pub control: u32,
}

pub const TRB_SIZE: usize = 16;

const CYCLE: u32 = 1 << 0;
const EVALUATE_NEXT: u32 = 1 << 1;
const TOGGLE_CYCLE: u32 = 1 << 1;
const EVENT_DATA_FLAG: u32 = 1 << 2;
const CHAIN: u32 = 1 << 4;
const IOC: u32 = 1 << 5;
const IMMEDIATE_DATA: u32 = 1 << 6;
const BLOCK_SET_ADDRESS: u32 = 1 << 9;
const DATA_DIRECTION_IN: u32 = 1 << 16;

const TYPE_SHIFT: u32 = 10;
const TYPE_MASK: u32 = 0x3f << TYPE_SHIFT;
const TRANSFER_TYPE_SHIFT: u32 = 16;
const SLOT_ID_SHIFT: u32 = 24;
const ENDPOINT_ID_SHIFT: u32 = 16;
const COMPLETION_CODE_SHIFT: u32 = 24;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum TrbType {
    Normal = 1,
    SetupStage = 2,
    DataStage = 3,
    StatusStage = 4,
    Link = 6,
    EventData = 7,
    NoOp = 8,
    EnableSlot = 9,
    AddressDevice = 11,
    EvaluateContext = 13,
    NoOpCommand = 23,
    TransferEvent = 32,
    CommandCompletionEvent = 33,
    PortStatusChangeEvent = 34,
}

impl TrbType {
    pub fn from_raw(raw: u8) -> Option<TrbType> {
        Some(match raw {
            1 => Self::Normal,
            2 => Self::SetupStage,
            3 => Self::DataStage,
            4 => Self::StatusStage,
            6 => Self::Link,
            7 => Self::EventData,
            8 => Self::NoOp,
            9 => Self::EnableSlot,
            11 => Self::AddressDevice,
            13 => Self::EvaluateContext,
            23 => Self::NoOpCommand,
            32 => Self::TransferEvent,
            33 => Self::CommandCompletionEvent,
            34 => Self::PortStatusChangeEvent,
            _ => return None,
        })
    }
}

/// Transfer Type field of a Setup Stage TRB.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum TransferType {
    NoDataStage = 0,
    OutDataStage = 2,
    InDataStage = 3,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DataDirection {
    Out,
    In,
}

/// The 8-byte USB setup packet carried immediately in a Setup Stage TRB.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    fn to_parameter(self) -> u64 {
        u64::from(self.request_type)
            | u64::from(self.request) << 8
            | u64::from(self.value) << 16
            | u64::from(self.index) << 32
            | u64::from(self.length) << 48
    }

    pub fn from_parameter(parameter: u64) -> SetupPacket {
        SetupPacket {
            request_type: parameter as u8,
            request: (parameter >> 8) as u8,
            value: (parameter >> 16) as u16,
            index: (parameter >> 32) as u16,
            length: (parameter >> 48) as u16,
        }
    }
}

impl Trb {
    pub fn trb_type(&self) -> Option<TrbType> {
        TrbType::from_raw(((self.control & TYPE_MASK) >> TYPE_SHIFT) as u8)
    }

    pub fn cycle(&self) -> bool {
        self.control & CYCLE != 0
    }

    pub fn set_cycle(&mut self, cycle: bool) {
        if cycle {
            self.control |= CYCLE;
        } else {
            self.control &= !CYCLE;
        }
    }

    fn with_type(trb_type: TrbType) -> Trb {
        Trb {
            parameter: 0,
            status: 0,
            control: u32::from(trb_type as u8) << TYPE_SHIFT,
        }
    }

    /// A Link TRB pointing back at `segment_base`. `toggle_cycle` flips the
    /// producer cycle state when the controller follows the link.
    pub fn link(segment_base: PhysAddr, toggle_cycle: bool) -> Trb {
        let mut trb = Trb::with_type(TrbType::Link);
        trb.parameter = segment_base.as_u64() & !0xf;
        if toggle_cycle {
            trb.control |= TOGGLE_CYCLE;
        }
        trb
    }

    pub fn toggles_cycle(&self) -> bool {
        self.control & TOGGLE_CYCLE != 0
    }

    pub fn no_op_command() -> Trb {
        Trb::with_type(TrbType::NoOpCommand)
    }

    pub fn enable_slot() -> Trb {
        Trb::with_type(TrbType::EnableSlot)
    }

    /// An Address Device command referencing the slot's input context. With
    /// `block_set_address` the controller skips the SET_ADDRESS request on
    /// the bus.
    pub fn address_device(input_context: PhysAddr, slot_id: u8, block_set_address: bool) -> Trb {
        let mut trb = Trb::with_type(TrbType::AddressDevice);
        trb.parameter = input_context.as_u64() & !0xf;
        trb.control |= u32::from(slot_id) << SLOT_ID_SHIFT;
        if block_set_address {
            trb.control |= BLOCK_SET_ADDRESS;
        }
        trb
    }

    pub fn evaluate_context(input_context: PhysAddr, slot_id: u8) -> Trb {
        let mut trb = Trb::with_type(TrbType::EvaluateContext);
        trb.parameter = input_context.as_u64() & !0xf;
        trb.control |= u32::from(slot_id) << SLOT_ID_SHIFT;
        trb
    }

    pub fn block_set_address(&self) -> bool {
        self.control & BLOCK_SET_ADDRESS != 0
    }

    /// A Setup Stage TRB carrying `packet` as immediate data.
    pub fn setup_stage(packet: SetupPacket, transfer_type: TransferType) -> Trb {
        let mut trb = Trb::with_type(TrbType::SetupStage);
        trb.parameter = packet.to_parameter();
        trb.status = 8;
        trb.control |= IMMEDIATE_DATA;
        trb.control |= u32::from(transfer_type as u8) << TRANSFER_TYPE_SHIFT;
        trb
    }

    pub fn data_stage(
        buffer: PhysAddr,
        length: u32,
        direction: DataDirection,
        chain: bool,
        evaluate_next: bool,
    ) -> Trb {
        let mut trb = Trb::with_type(TrbType::DataStage);
        trb.parameter = buffer.as_u64();
        trb.status = length & 0x1_ffff;
        if direction == DataDirection::In {
            trb.control |= DATA_DIRECTION_IN;
        }
        if chain {
            trb.control |= CHAIN;
        }
        if evaluate_next {
            trb.control |= EVALUATE_NEXT;
        }
        trb
    }

    pub fn status_stage(direction: DataDirection, interrupt_on_completion: bool) -> Trb {
        let mut trb = Trb::with_type(TrbType::StatusStage);
        if direction == DataDirection::In {
            trb.control |= DATA_DIRECTION_IN;
        }
        if interrupt_on_completion {
            trb.control |= IOC;
        }
        trb
    }

    /// An Event Data TRB. `data` is reflected verbatim in the parameter of
    /// the Transfer Event the controller generates for it.
    pub fn event_data(data: PhysAddr) -> Trb {
        let mut trb = Trb::with_type(TrbType::EventData);
        trb.parameter = data.as_u64();
        trb.control |= IOC;
        trb
    }

    pub fn command_completion_event(
        command_trb: PhysAddr,
        code: CompletionCode,
        slot_id: u8,
    ) -> Trb {
        let mut trb = Trb::with_type(TrbType::CommandCompletionEvent);
        trb.parameter = command_trb.as_u64() & !0xf;
        trb.status = u32::from(code.raw()) << COMPLETION_CODE_SHIFT;
        trb.control |= u32::from(slot_id) << SLOT_ID_SHIFT;
        trb
    }

    pub fn transfer_event(
        trb_pointer: u64,
        code: CompletionCode,
        slot_id: u8,
        endpoint_id: u8,
        transfer_length: u32,
        event_data: bool,
    ) -> Trb {
        let mut trb = Trb::with_type(TrbType::TransferEvent);
        trb.parameter = trb_pointer;
        trb.status = (transfer_length & 0xff_ffff) | u32::from(code.raw()) << COMPLETION_CODE_SHIFT;
        trb.control |= u32::from(slot_id) << SLOT_ID_SHIFT;
        trb.control |= u32::from(endpoint_id & 0x1f) << ENDPOINT_ID_SHIFT;
        if event_data {
            trb.control |= EVENT_DATA_FLAG;
        }
        trb
    }

    pub fn port_status_change_event(port_id: u8) -> Trb {
        let mut trb = Trb::with_type(TrbType::PortStatusChangeEvent);
        trb.parameter = u64::from(port_id) << 24;
        trb
    }
}

/// View over a Command Completion Event TRB.
#[derive(Debug, Copy, Clone)]
pub struct CommandCompletion(Trb);

impl CommandCompletion {
    pub fn completion_code(&self) -> CompletionCode {
        CompletionCode::from_raw((self.0.status >> COMPLETION_CODE_SHIFT) as u8)
    }

    pub fn slot_id(&self) -> u8 {
        (self.0.control >> SLOT_ID_SHIFT) as u8
    }

    pub fn command_trb_pointer(&self) -> PhysAddr {
        PhysAddr::new(self.0.parameter & !0xf)
    }
}

/// View over a Transfer Event TRB.
#[derive(Debug, Copy, Clone)]
pub struct TransferEvent(Trb);

impl TransferEvent {
    pub fn completion_code(&self) -> CompletionCode {
        CompletionCode::from_raw((self.0.status >> COMPLETION_CODE_SHIFT) as u8)
    }

    pub fn slot_id(&self) -> u8 {
        (self.0.control >> SLOT_ID_SHIFT) as u8
    }

    pub fn endpoint_id(&self) -> u8 {
        ((self.0.control >> ENDPOINT_ID_SHIFT) & 0x1f) as u8
    }

    /// Physical address of the transfer TRB, or the Event Data parameter if
    /// [`Self::is_event_data`].
    pub fn trb_pointer(&self) -> u64 {
        self.0.parameter
    }

    pub fn is_event_data(&self) -> bool {
        self.0.control & EVENT_DATA_FLAG != 0
    }

    pub fn transfer_length(&self) -> u32 {
        self.0.status & 0xff_ffff
    }
}

/// View over a Port Status Change Event TRB.
#[derive(Debug, Copy, Clone)]
pub struct PortStatusChange(Trb);

impl PortStatusChange {
    pub fn port_id(&self) -> u8 {
        (self.0.parameter >> 24) as u8
    }
}

/// The event TRB types the driver core reacts to. Anything else is passed
/// through raw so the caller can at least log it.
#[derive(Debug, Copy, Clone)]
pub enum Event {
    CommandCompletion(CommandCompletion),
    Transfer(TransferEvent),
    PortStatusChange(PortStatusChange),
    Other(Trb),
}

impl Event {
    pub fn parse(trb: Trb) -> Event {
        match trb.trb_type() {
            Some(TrbType::CommandCompletionEvent) => Event::CommandCompletion(CommandCompletion(trb)),
            Some(TrbType::TransferEvent) => Event::Transfer(TransferEvent(trb)),
            Some(TrbType::PortStatusChangeEvent) => Event::PortStatusChange(PortStatusChange(trb)),
            _ => Event::Other(trb),
        }
    }
}

macro_rules! completion_codes {
    ($($name:ident = $value:expr, $label:expr;)*) => {
        /// Completion code carried in the status word of event TRBs.
        ///
        /// [USB xHCI spec](https://www.intel.com/content/dam/www/public/us/en/documents/technical-specifications/extensible-host-controler-interface-usb-xhci.pdf#page=507)
        #[derive(Debug, Copy, Clone, Eq, PartialEq)]
        pub enum CompletionCode {
            $($name,)*
            Unknown(u8),
        }

        impl CompletionCode {
            pub fn from_raw(raw: u8) -> CompletionCode {
                match raw {
                    $($value => Self::$name,)*
                    other => Self::Unknown(other),
                }
            }

            pub fn raw(&self) -> u8 {
                match self {
                    $(Self::$name => $value,)*
                    Self::Unknown(other) => *other,
                }
            }

            pub fn name(&self) -> &'static str {
                match self {
                    $(Self::$name => $label,)*
                    Self::Unknown(_) => "UNKNOWN_COMPLETION_CODE",
                }
            }
        }
    };
}

completion_codes! {
    Invalid = 0, "INVALID";
    Success = 1, "SUCCESS";
    DataBufferError = 2, "DATA_BUFFER_ERROR";
    BabbleDetectedError = 3, "BABBLE_DETECTED_ERROR";
    UsbTransactionError = 4, "USB_TRANSACTION_ERROR";
    TrbError = 5, "TRB_ERROR";
    StallError = 6, "STALL_ERROR";
    ResourceError = 7, "RESOURCE_ERROR";
    BandwidthError = 8, "BANDWIDTH_ERROR";
    NoSlotsAvailableError = 9, "NO_SLOTS_AVAILABLE";
    InvalidStreamTypeError = 10, "INVALID_STREAM_TYPE";
    SlotNotEnabledError = 11, "SLOT_NOT_ENABLED";
    EndpointNotEnabledError = 12, "ENDPOINT_NOT_ENABLED";
    ShortPacket = 13, "SHORT_PACKET";
    RingUnderrun = 14, "RING_UNDERRUN";
    RingOverrun = 15, "RING_OVERRUN";
    VfEventRingFullError = 16, "VF_EVENT_RING_FULL";
    ParameterError = 17, "PARAMETER_ERROR";
    BandwidthOverrunError = 18, "BANDWIDTH_OVERRUN";
    ContextStateError = 19, "CONTEXT_STATE_ERROR";
    NoPingResponseError = 20, "NO_PING_RESPONSE";
    EventRingFullError = 21, "EVENT_RING_FULL";
    IncompatibleDeviceError = 22, "INCOMPATIBLE_DEVICE";
    MissedServiceError = 23, "MISSED_SERVICE";
    CommandRingStopped = 24, "COMMAND_RING_STOPPED";
    CommandAborted = 25, "COMMAND_ABORTED";
    Stopped = 26, "STOPPED";
    StoppedLengthInvalid = 27, "STOPPED_LENGTH_INVALID";
    StoppedShortPacket = 28, "STOPPED_SHORT_PACKET";
    MaxExitLatencyTooLargeError = 29, "MAX_EXIT_LATENCY_ERROR";
}

impl Display for CompletionCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.raw())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_stage_encoding() {
        let packet = SetupPacket {
            request_type: 0x80,
            request: 6,
            value: 0x0100,
            index: 0,
            length: 8,
        };
        let trb = Trb::setup_stage(packet, TransferType::InDataStage);

        assert_eq!(trb.parameter, 0x0008_0000_0100_0680);
        assert_eq!(trb.status, 8);
        assert_eq!(trb.trb_type(), Some(TrbType::SetupStage));
        // IDT and TRT=3, no cycle bit yet
        assert_eq!(trb.control & IMMEDIATE_DATA, IMMEDIATE_DATA);
        assert_eq!((trb.control >> TRANSFER_TYPE_SHIFT) & 0x3, 3);
        assert!(!trb.cycle());

        assert_eq!(SetupPacket::from_parameter(trb.parameter), packet);
    }

    #[test]
    fn test_data_stage_encoding() {
        let trb = Trb::data_stage(PhysAddr::new(0x3_0000), 8, DataDirection::In, true, true);
        assert_eq!(trb.parameter, 0x3_0000);
        assert_eq!(trb.status, 8);
        assert!(trb.control & DATA_DIRECTION_IN != 0);
        assert!(trb.control & CHAIN != 0);
        assert!(trb.control & EVALUATE_NEXT != 0);
    }

    #[test]
    fn test_link_toggles_cycle() {
        let trb = Trb::link(PhysAddr::new(0x1000), true);
        assert_eq!(trb.trb_type(), Some(TrbType::Link));
        assert_eq!(trb.parameter, 0x1000);
        assert!(trb.toggles_cycle());
        assert!(!Trb::link(PhysAddr::new(0x1000), false).toggles_cycle());
    }

    #[test]
    fn test_address_device_fields() {
        let trb = Trb::address_device(PhysAddr::new(0x1_0000), 3, false);
        assert_eq!(trb.parameter, 0x1_0000);
        assert_eq!((trb.control >> SLOT_ID_SHIFT) as u8, 3);
        assert!(!trb.block_set_address());
        assert!(Trb::address_device(PhysAddr::new(0x1_0000), 3, true).block_set_address());
    }

    #[test]
    fn test_event_parsing() {
        let raw = Trb::command_completion_event(PhysAddr::new(0x2000), CompletionCode::Success, 3);
        match Event::parse(raw) {
            Event::CommandCompletion(completion) => {
                assert_eq!(completion.slot_id(), 3);
                assert_eq!(completion.completion_code(), CompletionCode::Success);
                assert_eq!(completion.command_trb_pointer(), PhysAddr::new(0x2000));
            }
            other => panic!("parsed as {other:?}"),
        }

        let raw = Trb::transfer_event(0x3_1000, CompletionCode::Success, 3, 1, 8, true);
        match Event::parse(raw) {
            Event::Transfer(event) => {
                assert_eq!(event.slot_id(), 3);
                assert_eq!(event.endpoint_id(), 1);
                assert_eq!(event.trb_pointer(), 0x3_1000);
                assert_eq!(event.transfer_length(), 8);
                assert!(event.is_event_data());
            }
            other => panic!("parsed as {other:?}"),
        }

        match Event::parse(Trb::port_status_change_event(4)) {
            Event::PortStatusChange(event) => assert_eq!(event.port_id(), 4),
            other => panic!("parsed as {other:?}"),
        }
    }

    #[test]
    fn test_completion_code_round_trip() {
        for raw in 0..=255u8 {
            assert_eq!(CompletionCode::from_raw(raw).raw(), raw);
        }
        assert_eq!(CompletionCode::from_raw(9), CompletionCode::NoSlotsAvailableError);
        assert_eq!(CompletionCode::Success.name(), "SUCCESS");
    }
}
