//! Device, input and control contexts plus the Device Context Base Address
//! Array and its scratchpad buffers.
//!
//! Context entries are 32 or 64 bytes wide depending on HCCPARAMS1.CSZ; the
//! field layout is identical, the 64-byte variant is padded. The wrappers
//! below index by entry size so both variants share one set of accessors.
//!
//! [USB xHCI spec](https://www.intel.com/content/dam/www/public/us/en/documents/technical-specifications/extensible-host-controler-interface-usb-xhci.pdf#page=442)

use crate::dma::{
    DEVICE_CONTEXT_ALIGNMENT, DEVICE_CONTEXT_BOUNDARY, DmaAllocator, DmaBuf,
    INPUT_CONTEXT_ALIGNMENT, INPUT_CONTEXT_BOUNDARY, PAGE_SIZE, SCRATCHPAD_ARRAY_ALIGNMENT,
    SCRATCHPAD_ARRAY_BOUNDARY, SCRATCHPAD_BUFFER_ALIGNMENT, SCRATCHPAD_BUFFER_BOUNDARY,
};
use crate::error::XhciError;
use alloc::vec::Vec;
use core::num::NonZeroU8;
use x86_64::PhysAddr;
use xhci_memapi::MemoryApi;

/// Endpoint Type field values.
pub const ENDPOINT_TYPE_CONTROL: u8 = 4;

/// The DCI of the default control endpoint.
pub const CONTROL_ENDPOINT_DCI: u8 = 1;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SlotState {
    DisabledOrEnabled,
    Default,
    Addressed,
    Configured,
    Reserved(u8),
}

impl SlotState {
    pub fn from_raw(raw: u8) -> SlotState {
        match raw {
            0 => Self::DisabledOrEnabled,
            1 => Self::Default,
            2 => Self::Addressed,
            3 => Self::Configured,
            other => Self::Reserved(other),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::DisabledOrEnabled => "Disabled/Enabled",
            Self::Default => "Default",
            Self::Addressed => "Addressed",
            Self::Configured => "Configured",
            Self::Reserved(_) => "Reserved",
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EndpointState {
    Disabled,
    Running,
    Halted,
    Stopped,
    Error,
    Reserved(u8),
}

impl EndpointState {
    pub fn from_raw(raw: u8) -> EndpointState {
        match raw {
            0 => Self::Disabled,
            1 => Self::Running,
            2 => Self::Halted,
            3 => Self::Stopped,
            4 => Self::Error,
            other => Self::Reserved(other),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Disabled => "Disabled",
            Self::Running => "Running",
            Self::Halted => "Halted",
            Self::Stopped => "Stopped",
            Self::Error => "Error",
            Self::Reserved(_) => "Reserved",
        }
    }
}

fn set_bits(word: &mut u32, shift: u32, width: u32, value: u32) {
    let mask = ((1u64 << width) - 1) as u32;
    debug_assert!(value <= mask);
    *word = (*word & !(mask << shift)) | ((value & mask) << shift);
}

fn get_bits(word: u32, shift: u32, width: u32) -> u32 {
    (word >> shift) & ((1u64 << width) - 1) as u32
}

/// Slot context: the first entry of a device or input context.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct SlotContext {
    words: [u32; 8],
}

impl SlotContext {
    pub fn set_route_string(&mut self, route: u32) {
        set_bits(&mut self.words[0], 0, 20, route);
    }

    /// The raw PORTSC port speed value of the attached device.
    pub fn set_speed(&mut self, speed: u8) {
        set_bits(&mut self.words[0], 20, 4, u32::from(speed));
    }

    /// Index of the last valid endpoint context within this device context.
    pub fn set_context_entries(&mut self, entries: u8) {
        set_bits(&mut self.words[0], 27, 5, u32::from(entries));
    }

    /// 1-based root hub port the device hangs off.
    pub fn set_root_hub_port_number(&mut self, port: u8) {
        set_bits(&mut self.words[1], 16, 8, u32::from(port));
    }

    pub fn set_interrupter_target(&mut self, target: u16) {
        set_bits(&mut self.words[2], 22, 10, u32::from(target));
    }

    /// Address assigned by the controller; valid once the slot is addressed.
    pub fn device_address(&self) -> u8 {
        get_bits(self.words[3], 0, 8) as u8
    }

    pub fn slot_state(&self) -> SlotState {
        SlotState::from_raw(get_bits(self.words[3], 27, 5) as u8)
    }
}

/// Endpoint context. DCI 1 is the default control endpoint.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct EndpointContext {
    words: [u32; 8],
}

impl EndpointContext {
    pub fn endpoint_state(&self) -> EndpointState {
        EndpointState::from_raw(get_bits(self.words[0], 0, 3) as u8)
    }

    pub fn set_interval(&mut self, interval: u8) {
        set_bits(&mut self.words[0], 16, 8, u32::from(interval));
    }

    pub fn set_error_count(&mut self, count: u8) {
        set_bits(&mut self.words[1], 1, 2, u32::from(count));
    }

    pub fn set_endpoint_type(&mut self, endpoint_type: u8) {
        set_bits(&mut self.words[1], 3, 3, u32::from(endpoint_type));
    }

    pub fn set_max_burst_size(&mut self, size: u8) {
        set_bits(&mut self.words[1], 8, 8, u32::from(size));
    }

    pub fn set_max_packet_size(&mut self, size: u16) {
        set_bits(&mut self.words[1], 16, 16, u32::from(size));
    }

    pub fn max_packet_size(&self) -> u16 {
        get_bits(self.words[1], 16, 16) as u16
    }

    /// Transfer ring dequeue pointer plus the Dequeue Cycle State in bit 0.
    pub fn set_tr_dequeue_pointer(&mut self, ring_base: PhysAddr, cycle: bool) {
        let value = (ring_base.as_u64() & !0xf) | u64::from(cycle);
        self.words[2] = value as u32;
        self.words[3] = (value >> 32) as u32;
    }

    pub fn tr_dequeue_pointer(&self) -> u64 {
        u64::from(self.words[2]) | u64::from(self.words[3]) << 32
    }

    pub fn set_average_trb_length(&mut self, length: u16) {
        set_bits(&mut self.words[4], 0, 16, u32::from(length));
    }
}

/// Input control context: the add/drop bitmaps selecting which entries of
/// the embedded device context a command evaluates.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct InputControlContext {
    words: [u32; 8],
}

impl InputControlContext {
    pub fn set_add_flags(&mut self, flags: u32) {
        self.words[1] = flags;
    }

    pub fn set_drop_flags(&mut self, flags: u32) {
        self.words[0] = flags;
    }
}

/// Flag bit selecting context entry `dci` (0 = slot context) in the input
/// control context bitmaps.
pub fn context_flag(dci: u8) -> u32 {
    1 << dci
}

/// An Input Context: input control context followed by a full device
/// context, proposed to the controller via Address Device or Evaluate
/// Context.
#[derive(Debug)]
pub struct InputContext {
    buf: DmaBuf,
    entry_size: usize,
}

impl InputContext {
    pub fn new<M: MemoryApi>(
        dma: &mut DmaAllocator,
        mem: &mut M,
        entry_size: usize,
    ) -> Result<InputContext, XhciError> {
        let buf = dma.alloc(
            mem,
            entry_size * 33,
            INPUT_CONTEXT_ALIGNMENT,
            INPUT_CONTEXT_BOUNDARY,
        )?;
        Ok(InputContext { buf, entry_size })
    }

    pub fn phys(&self) -> PhysAddr {
        self.buf.phys()
    }

    fn entry_ptr(&self, index: usize) -> *mut u8 {
        debug_assert!((index + 1) * self.entry_size <= self.buf.len());
        unsafe { self.buf.as_mut_ptr::<u8>().add(index * self.entry_size) }
    }

    pub fn control_mut(&mut self) -> &mut InputControlContext {
        unsafe { &mut *(self.entry_ptr(0) as *mut InputControlContext) }
    }

    pub fn slot_mut(&mut self) -> &mut SlotContext {
        unsafe { &mut *(self.entry_ptr(1) as *mut SlotContext) }
    }

    pub fn endpoint_mut(&mut self, dci: u8) -> &mut EndpointContext {
        debug_assert!((1..=31).contains(&dci));
        unsafe { &mut *(self.entry_ptr(1 + usize::from(dci)) as *mut EndpointContext) }
    }
}

/// A slot's output device context. The controller owns its contents once
/// the slot's DCBAA entry is published, so reads go through volatile copies.
#[derive(Debug)]
pub struct DeviceContext {
    buf: DmaBuf,
    entry_size: usize,
}

impl DeviceContext {
    pub fn new<M: MemoryApi>(
        dma: &mut DmaAllocator,
        mem: &mut M,
        entry_size: usize,
    ) -> Result<DeviceContext, XhciError> {
        let buf = dma.alloc(
            mem,
            entry_size * 32,
            DEVICE_CONTEXT_ALIGNMENT,
            DEVICE_CONTEXT_BOUNDARY,
        )?;
        Ok(DeviceContext { buf, entry_size })
    }

    pub fn phys(&self) -> PhysAddr {
        self.buf.phys()
    }

    pub fn slot(&self) -> SlotContext {
        unsafe { (self.buf.as_ptr::<u8>() as *const SlotContext).read_volatile() }
    }

    pub fn endpoint(&self, dci: u8) -> EndpointContext {
        debug_assert!((1..=31).contains(&dci));
        unsafe {
            (self.buf.as_ptr::<u8>().add(usize::from(dci) * self.entry_size)
                as *const EndpointContext)
                .read_volatile()
        }
    }
}

/// The DCBAA plus the scratchpad storage the controller parks behind entry
/// 0.
#[derive(Debug)]
pub struct DeviceContextBaseAddressArray {
    dcbaa: DmaBuf,
    _scratchpad_array: Option<DmaBuf>,
    _scratchpad_pages: Vec<DmaBuf>,
}

impl DeviceContextBaseAddressArray {
    pub fn new<M: MemoryApi>(
        dma: &mut DmaAllocator,
        mem: &mut M,
        max_slots: u8,
        scratchpad_count: u16,
        entry_size: usize,
    ) -> Result<DeviceContextBaseAddressArray, XhciError> {
        let size = (usize::from(max_slots) + 1) * entry_size;
        let dcbaa = dma.alloc(mem, size, DEVICE_CONTEXT_ALIGNMENT, DEVICE_CONTEXT_BOUNDARY)?;

        let mut scratchpad_array = None;
        let mut scratchpad_pages = Vec::new();
        if scratchpad_count > 0 {
            let array = dma.alloc(
                mem,
                usize::from(scratchpad_count) * 8,
                SCRATCHPAD_ARRAY_ALIGNMENT,
                SCRATCHPAD_ARRAY_BOUNDARY,
            )?;
            for i in 0..usize::from(scratchpad_count) {
                let page = dma.alloc(
                    mem,
                    PAGE_SIZE,
                    SCRATCHPAD_BUFFER_ALIGNMENT,
                    SCRATCHPAD_BUFFER_BOUNDARY,
                )?;
                unsafe {
                    array
                        .as_mut_ptr::<u64>()
                        .add(i)
                        .write_volatile(page.phys().as_u64())
                };
                scratchpad_pages.push(page);
            }
            unsafe {
                dcbaa
                    .as_mut_ptr::<u64>()
                    .write_volatile(array.phys().as_u64())
            };
            scratchpad_array = Some(array);
        }

        Ok(DeviceContextBaseAddressArray {
            dcbaa,
            _scratchpad_array: scratchpad_array,
            _scratchpad_pages: scratchpad_pages,
        })
    }

    pub fn phys(&self) -> PhysAddr {
        self.dcbaa.phys()
    }

    /// Publishes `context` as the device context of `slot`.
    pub fn set(&mut self, slot: NonZeroU8, context: PhysAddr) {
        unsafe {
            self.dcbaa
                .as_mut_ptr::<u64>()
                .add(usize::from(slot.get()))
                .write_volatile(context.as_u64())
        };
    }

    pub fn get(&self, slot: NonZeroU8) -> PhysAddr {
        let raw = unsafe {
            self.dcbaa
                .as_ptr::<u64>()
                .add(usize::from(slot.get()))
                .read_volatile()
        };
        PhysAddr::new(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeMemory;

    #[test]
    fn test_slot_context_fields() {
        let mut slot = SlotContext::default();
        slot.set_route_string(0);
        slot.set_speed(2);
        slot.set_context_entries(1);
        slot.set_root_hub_port_number(5);
        slot.set_interrupter_target(0);

        assert_eq!(slot.words[0], 2 << 20 | 1 << 27);
        assert_eq!(slot.words[1], 5 << 16);

        let mut addressed = SlotContext::default();
        addressed.words[3] = 2 << 27 | 7;
        assert_eq!(addressed.slot_state(), SlotState::Addressed);
        assert_eq!(addressed.device_address(), 7);
    }

    #[test]
    fn test_endpoint_context_fields() {
        let mut ep = EndpointContext::default();
        ep.set_endpoint_type(ENDPOINT_TYPE_CONTROL);
        ep.set_error_count(3);
        ep.set_max_packet_size(64);
        ep.set_average_trb_length(8);
        ep.set_tr_dequeue_pointer(PhysAddr::new(0x1234_5000), true);

        assert_eq!(ep.words[1], 64 << 16 | 3 << 1 | u32::from(ENDPOINT_TYPE_CONTROL) << 3);
        assert_eq!(ep.tr_dequeue_pointer(), 0x1234_5001);
        assert_eq!(ep.words[4], 8);
        assert_eq!(ep.max_packet_size(), 64);
    }

    #[test]
    fn test_input_context_entry_offsets() {
        let mut mem = FakeMemory::new();
        let mut dma = DmaAllocator::new();

        for entry_size in [32usize, 64] {
            let mut input = InputContext::new(&mut dma, &mut mem, entry_size).unwrap();
            let base = input.buf.virt().as_u64();

            assert_eq!(input.control_mut() as *mut _ as u64, base);
            assert_eq!(input.slot_mut() as *mut _ as u64, base + entry_size as u64);
            assert_eq!(
                input.endpoint_mut(1) as *mut _ as u64,
                base + 2 * entry_size as u64
            );
            assert_eq!(
                input.endpoint_mut(31) as *mut _ as u64,
                base + 32 * entry_size as u64
            );
        }
    }

    #[test]
    fn test_dcbaa_scratchpad_wiring() {
        let mut mem = FakeMemory::new();
        let mut dma = DmaAllocator::new();
        let dcbaa =
            DeviceContextBaseAddressArray::new(&mut dma, &mut mem, 8, 3, 32).unwrap();

        // Entry 0 points at the scratchpad array, whose entries point at
        // page-aligned scratchpad pages.
        let array_phys = unsafe { dcbaa.dcbaa.as_ptr::<u64>().read_volatile() };
        assert_ne!(array_phys, 0);
        assert_eq!(array_phys % SCRATCHPAD_ARRAY_ALIGNMENT, 0);

        let array = array_phys as *const u64;
        for i in 0..3 {
            let page = unsafe { array.add(i).read_volatile() };
            assert_ne!(page, 0);
            assert_eq!(page % SCRATCHPAD_BUFFER_ALIGNMENT, 0);
        }
    }

    #[test]
    fn test_dcbaa_without_scratchpads_leaves_entry_zero_clear() {
        let mut mem = FakeMemory::new();
        let mut dma = DmaAllocator::new();
        let mut dcbaa =
            DeviceContextBaseAddressArray::new(&mut dma, &mut mem, 8, 0, 64).unwrap();

        assert_eq!(unsafe { dcbaa.dcbaa.as_ptr::<u64>().read_volatile() }, 0);

        let slot = NonZeroU8::new(3).unwrap();
        dcbaa.set(slot, PhysAddr::new(0x2_0000));
        assert_eq!(dcbaa.get(slot), PhysAddr::new(0x2_0000));
    }
}
