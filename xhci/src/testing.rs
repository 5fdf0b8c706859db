//! Test doubles: an identity-mapped host memory fake and a scripted xHC
//! model the driver can be brought up against on the host, without
//! hardware.
//!
//! Physical addresses are identity-mapped host addresses, so the model can
//! parse the rings and contexts the driver builds by following the very
//! pointers it programmed into the registers.
//!
//! The model advances one tick per simulated millisecond (driven by
//! [`TimeApi::msleep`]). Each tick it latches register writes, applies RW1C
//! semantics, runs command/transfer/port state machines, publishes events
//! into the driver's event ring segments and republishes register state.
//! Register cells the driver only ever writes carry sentinel or marker bits
//! so the model can tell a write from its own published value.

use crate::trb::{CompletionCode, SetupPacket, TRB_SIZE, Trb, TrbType};
use crate::{PciAddress, PciDeviceInfo};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::alloc::Layout;
use core::ptr::NonNull;
use spin::Mutex;
use x86_64::{PhysAddr, VirtAddr};
use xhci_memapi::{DmaRegion, MemoryApi, TimeApi};

const PAGE: usize = 4096;

/// A page-aligned, zeroed host allocation standing in for device-reachable
/// memory.
struct RawChunk {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl RawChunk {
    fn new(size: usize, align: usize) -> RawChunk {
        let layout = Layout::from_size_align(size, align).unwrap();
        let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
        RawChunk {
            ptr: NonNull::new(ptr).expect("host allocation failed"),
            layout,
        }
    }

    fn base(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }
}

impl Drop for RawChunk {
    fn drop(&mut self) {
        unsafe { alloc::alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

unsafe impl Send for RawChunk {}

/// Identity-mapped [`MemoryApi`]/[`TimeApi`] with no controller behind it.
/// Enough for the allocator, ring and context unit tests.
#[derive(Default)]
pub struct FakeMemory {
    chunks: Vec<RawChunk>,
}

impl FakeMemory {
    pub fn new() -> FakeMemory {
        FakeMemory { chunks: Vec::new() }
    }
}

impl MemoryApi for FakeMemory {
    fn alloc_contiguous(&mut self, pages: usize) -> Option<DmaRegion> {
        let chunk = RawChunk::new(pages * PAGE, PAGE);
        let region = DmaRegion {
            virt: VirtAddr::new(chunk.base()),
            phys: PhysAddr::new(chunk.base()),
            pages,
        };
        self.chunks.push(chunk);
        Some(region)
    }

    fn map_mmio(&mut self, phys: PhysAddr, _size: usize) -> Option<VirtAddr> {
        Some(VirtAddr::new(phys.as_u64()))
    }

    fn phys_to_virt(&self, phys: PhysAddr) -> VirtAddr {
        VirtAddr::new(phys.as_u64())
    }

    fn virt_to_phys(&self, virt: VirtAddr) -> PhysAddr {
        PhysAddr::new(virt.as_u64())
    }
}

impl TimeApi for FakeMemory {
    fn msleep(&mut self, _ms: u64) {}
}

// MMIO window layout of the model.
const MMIO_SIZE: usize = 0x4000;
const CAP_LENGTH: usize = 0x80;
const EXT_CAPS: usize = 0x40;
const OP_BASE: usize = CAP_LENGTH;
const PORT_BASE: usize = OP_BASE + 0x400;
const RT_BASE: usize = 0x2000;
const INT0: usize = RT_BASE + 0x20;
const DB_BASE: usize = 0x3000;

/// Operational register offsets within the fake's MMIO window, for use
/// with [`FakeXhc::mmio_read32`]/[`FakeXhc::mmio_read64`].
pub const OP_USBCMD: usize = OP_BASE;
pub const OP_USBSTS: usize = OP_BASE + 0x04;
const OP_PAGESIZE: usize = OP_BASE + 0x08;
pub const OP_DNCTRL: usize = OP_BASE + 0x14;
pub const OP_CRCR: usize = OP_BASE + 0x18;
pub const OP_DCBAAP: usize = OP_BASE + 0x30;
pub const OP_CONFIG: usize = OP_BASE + 0x38;

const INT0_IMAN: usize = INT0;
const INT0_IMOD: usize = INT0 + 0x04;
const INT0_ERSTSZ: usize = INT0 + 0x08;
const INT0_ERSTBA: usize = INT0 + 0x10;
const INT0_ERDP: usize = INT0 + 0x18;

// USBCMD / USBSTS bits as the model sees them.
const C_RS: u32 = 1 << 0;
const C_HCRST: u32 = 1 << 1;
const S_HCH: u32 = 1 << 0;
const S_HSE: u32 = 1 << 2;
const S_EINT: u32 = 1 << 3;
const S_PCD: u32 = 1 << 4;
const S_SRE: u32 = 1 << 10;
const S_RW1C: u32 = S_HSE | S_EINT | S_PCD | S_SRE;

// PORTSC bits.
const P_CCS: u32 = 1 << 0;
const P_PED: u32 = 1 << 1;
const P_PR: u32 = 1 << 4;
const P_PP: u32 = 1 << 9;
const P_CSC: u32 = 1 << 17;
const P_PEC: u32 = 1 << 18;
const P_WRC: u32 = 1 << 19;
const P_OCC: u32 = 1 << 20;
const P_PRC: u32 = 1 << 21;
const P_PLC: u32 = 1 << 22;
const P_CEC: u32 = 1 << 23;
const P_WPR: u32 = 1u32 << 31;
const P_RW1C: u32 = P_CSC | P_PEC | P_WRC | P_OCC | P_PRC | P_PLC | P_CEC;
const P_RW: u32 = P_PP | 0x3 << 14 | 0x7 << 25;

/// Published in reserved bits of USBSTS, PORTSC and IMAN (bit 13, bit 28
/// and bit 31 respectively). Driver writes never carry these bits, which is
/// how the model tells a fresh write from its own published value.
pub const USBSTS_MARKER: u32 = 1 << 13;
pub const PORTSC_MARKER: u32 = 1 << 28;
pub const IMAN_MARKER: u32 = 1u32 << 31;

/// Doorbell cells are republished with this value; any other content is a
/// doorbell ring (the command doorbell rings with 0).
pub const DOORBELL_SENTINEL: u32 = 0xffff_ffff;

#[derive(Debug, Copy, Clone)]
pub struct FakePortConfig {
    /// 1-based port number.
    pub port: u8,
    /// Raw PORTSC port speed value.
    pub speed: u8,
    pub powered: bool,
    /// Extra PORTSC bits present from the start (e.g. a sticky OCC).
    pub sticky_bits: u32,
}

impl FakePortConfig {
    pub fn connected(port: u8, speed: u8) -> FakePortConfig {
        FakePortConfig {
            port,
            speed,
            powered: true,
            sticky_bits: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FakeXhcConfig {
    pub max_slots: u8,
    pub max_ports: u8,
    /// Ports at or above this number are advertised as USB3 via a
    /// Supported Protocol capability. Set above `max_ports` for a pure
    /// USB2 controller.
    pub first_usb3_port: u8,
    pub scratchpad_buffers: u16,
    pub csz: bool,
    /// The slot id the next Enable Slot command hands out.
    pub first_slot: u8,
    /// Ticks HCRST stays set before the reset completes.
    pub reset_latency_ticks: u64,
    /// Ticks between PR/WPR and PRC/WRC.
    pub port_reset_ticks: u64,
    pub connected: Vec<FakePortConfig>,
    /// Served byte-for-byte on GET_DESCRIPTOR(DEVICE).
    pub device_descriptor: [u8; 18],
    /// Ports whose reset never completes.
    pub failing_ports: Vec<u8>,
}

impl Default for FakeXhcConfig {
    fn default() -> FakeXhcConfig {
        FakeXhcConfig {
            max_slots: 32,
            max_ports: 4,
            first_usb3_port: 3,
            scratchpad_buffers: 2,
            csz: false,
            first_slot: 1,
            reset_latency_ticks: 0,
            port_reset_ticks: 5,
            connected: Vec::new(),
            device_descriptor: [
                0x12, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x40, 0x8a, 0x2e, 0x0c, 0x00, 0x00,
                0x01, 0x01, 0x02, 0x03, 0x01,
            ],
            failing_ports: Vec::new(),
        }
    }
}

#[derive(Debug, Default, Copy, Clone)]
struct FakeSlot {
    tr_dequeue: u64,
    tr_cycle: bool,
    max_packet_size: u16,
    last_data_len: u32,
}

/// The scripted controller model.
pub struct FakeXhc {
    config: FakeXhcConfig,
    mmio: RawChunk,
    dma_chunks: Vec<RawChunk>,

    sts: u32,
    iman_ie: bool,
    iman_ip: bool,
    portsc: Vec<u32>,
    published_usbcmd: u32,

    reset_countdown: Option<u64>,
    port_reset: Vec<Option<u64>>,
    warm_used: Vec<Option<bool>>,

    cmd_dequeue: u64,
    cmd_cycle: bool,
    cmd_active: bool,

    ev_segment: usize,
    ev_index: usize,
    ev_cycle: bool,

    next_slot: u8,
    slots: BTreeMap<u8, FakeSlot>,
    pending_events: Vec<Trb>,

    command_log: Vec<Trb>,
    setup_log: Vec<SetupPacket>,
    doorbell_log: Vec<(u8, u32)>,
    ticks: u64,
}

impl FakeXhc {
    fn new(config: FakeXhcConfig) -> FakeXhc {
        let ports = usize::from(config.max_ports);
        let mut xhc = FakeXhc {
            mmio: RawChunk::new(MMIO_SIZE, PAGE),
            dma_chunks: Vec::new(),
            sts: S_HCH,
            iman_ie: false,
            iman_ip: false,
            portsc: vec![P_PP; ports],
            published_usbcmd: 0,
            reset_countdown: None,
            port_reset: vec![None; ports],
            warm_used: vec![None; ports],
            cmd_dequeue: 0,
            cmd_cycle: true,
            cmd_active: false,
            ev_segment: 0,
            ev_index: 0,
            ev_cycle: true,
            next_slot: config.first_slot,
            slots: BTreeMap::new(),
            pending_events: Vec::new(),
            command_log: Vec::new(),
            setup_log: Vec::new(),
            doorbell_log: Vec::new(),
            ticks: 0,
            config,
        };

        for p in xhc.config.connected.clone() {
            let mut state = P_CCS | u32::from(p.speed) << 10 | p.sticky_bits;
            if p.powered {
                state |= P_PP;
            }
            xhc.portsc[usize::from(p.port - 1)] = state;
        }

        xhc.write_capabilities();
        xhc.publish();
        xhc
    }

    pub fn bar(&self) -> PhysAddr {
        PhysAddr::new(self.mmio.base())
    }

    /// Advances the model by one millisecond.
    pub fn tick(&mut self) {
        self.ticks += 1;
        self.latch_usbcmd();
        self.latch_usbsts();
        self.latch_iman();
        self.latch_portsc();
        self.advance_port_resets();
        self.latch_doorbells();
        self.deliver_events();
        self.publish();
    }

    // ---- inspection for assertions ----

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn commands(&self) -> &[Trb] {
        &self.command_log
    }

    pub fn setup_packets(&self) -> &[SetupPacket] {
        &self.setup_log
    }

    pub fn doorbell_writes(&self) -> &[(u8, u32)] {
        &self.doorbell_log
    }

    /// The model's authoritative USBSTS state (without the marker bit).
    pub fn status(&self) -> u32 {
        self.sts
    }

    pub fn set_status_bits(&mut self, bits: u32) {
        self.sts |= bits;
    }

    pub fn interrupt_enable(&self) -> bool {
        self.iman_ie
    }

    pub fn interrupt_pending(&self) -> bool {
        self.iman_ip
    }

    /// The model's authoritative PORTSC state of a 1-based port.
    pub fn portsc_state(&self, port: u8) -> u32 {
        self.portsc[usize::from(port - 1)]
    }

    pub fn set_portsc_bits(&mut self, port: u8, bits: u32) {
        self.portsc[usize::from(port - 1)] |= bits;
    }

    /// Whether the last reset of `port` used WPR (USB3) or PR (USB2).
    pub fn warm_reset_used(&self, port: u8) -> Option<bool> {
        self.warm_used[usize::from(port - 1)]
    }

    /// Puts the model into the running state (R/S set, HCH clear), as if
    /// firmware left the controller going.
    pub fn force_running(&mut self) {
        self.w32(OP_USBCMD, C_RS);
        self.published_usbcmd = C_RS;
        self.sts &= !S_HCH;
        self.publish();
    }

    pub fn mmio_read32(&self, offset: usize) -> u32 {
        self.r32(offset)
    }

    pub fn mmio_read64(&self, offset: usize) -> u64 {
        self.r64(offset)
    }

    /// Physical base of the output device context of `slot`, as reachable
    /// through DCBAAP.
    pub fn output_context(&self, slot: u8) -> u64 {
        let dcbaap = self.r64(OP_DCBAAP) & !0x3f;
        if dcbaap == 0 {
            return 0;
        }
        mem_r64(dcbaap + 8 * u64::from(slot))
    }

    // ---- MMIO window ----

    fn r32(&self, offset: usize) -> u32 {
        debug_assert!(offset + 4 <= MMIO_SIZE);
        unsafe { ((self.mmio.base() as usize + offset) as *const u32).read_volatile() }
    }

    fn w32(&self, offset: usize, value: u32) {
        debug_assert!(offset + 4 <= MMIO_SIZE);
        unsafe { ((self.mmio.base() as usize + offset) as *mut u32).write_volatile(value) }
    }

    fn r64(&self, offset: usize) -> u64 {
        u64::from(self.r32(offset)) | u64::from(self.r32(offset + 4)) << 32
    }

    fn w64(&self, offset: usize, value: u64) {
        self.w32(offset, value as u32);
        self.w32(offset + 4, (value >> 32) as u32);
    }

    fn write_capabilities(&mut self) {
        let slots = u32::from(self.config.max_slots);
        let ports = u32::from(self.config.max_ports);
        let scratch = u32::from(self.config.scratchpad_buffers);

        self.w32(0x00, 0x0110 << 16 | CAP_LENGTH as u32);
        self.w32(0x04, ports << 24 | 1 << 8 | slots);
        self.w32(0x08, (scratch & 0x1f) << 27 | (scratch >> 5) << 21 | 4 << 4);
        self.w32(
            0x10,
            (EXT_CAPS as u32 >> 2) << 16 | u32::from(self.config.csz) << 2 | 1,
        );
        self.w32(0x14, DB_BASE as u32);
        self.w32(0x18, RT_BASE as u32);
        self.w32(OP_PAGESIZE, 1);

        // Supported Protocol capabilities: a USB2 node for the low ports
        // and a USB3 node for the rest.
        let first_usb3 = self.config.first_usb3_port;
        let supported_protocol = |major: u32, next: u32| major << 24 | next << 8 | 2;
        if first_usb3 > self.config.max_ports {
            self.w32(EXT_CAPS, supported_protocol(2, 0));
            self.w32(EXT_CAPS + 8, ports << 8 | 1);
        } else if first_usb3 <= 1 {
            self.w32(EXT_CAPS, supported_protocol(3, 0));
            self.w32(EXT_CAPS + 8, ports << 8 | 1);
        } else {
            let usb2_count = u32::from(first_usb3 - 1);
            self.w32(EXT_CAPS, supported_protocol(2, 4));
            self.w32(EXT_CAPS + 8, usb2_count << 8 | 1);
            self.w32(EXT_CAPS + 0x10, supported_protocol(3, 0));
            self.w32(
                EXT_CAPS + 0x18,
                (ports - usb2_count) << 8 | u32::from(first_usb3),
            );
        }
    }

    fn port_offset(index: usize) -> usize {
        PORT_BASE + 0x10 * index
    }

    fn publish(&mut self) {
        self.w32(OP_USBSTS, self.sts | USBSTS_MARKER);

        let iman = u32::from(self.iman_ip) | u32::from(self.iman_ie) << 1;
        self.w32(INT0_IMAN, iman | IMAN_MARKER);

        for i in 0..self.portsc.len() {
            self.w32(Self::port_offset(i), self.portsc[i] | PORTSC_MARKER);
        }

        for i in 0..=usize::from(self.config.max_slots) {
            self.w32(DB_BASE + 4 * i, DOORBELL_SENTINEL);
        }
    }

    // ---- register latches ----

    fn latch_usbcmd(&mut self) {
        let raw = self.r32(OP_USBCMD);
        self.published_usbcmd = raw;

        if raw & C_HCRST != 0 {
            let remaining = self
                .reset_countdown
                .unwrap_or(self.config.reset_latency_ticks);
            if remaining == 0 {
                self.complete_reset();
            } else {
                self.reset_countdown = Some(remaining - 1);
            }
        } else if raw & C_RS != 0 {
            self.sts &= !S_HCH;
        } else {
            self.sts |= S_HCH;
        }
    }

    fn complete_reset(&mut self) {
        self.reset_countdown = None;

        self.w32(OP_USBCMD, 0);
        self.published_usbcmd = 0;
        self.w32(OP_DNCTRL, 0);
        self.w64(OP_CRCR, 0);
        self.w64(OP_DCBAAP, 0);
        self.w32(OP_CONFIG, 0);
        self.w32(INT0_IMOD, 0);
        self.w32(INT0_ERSTSZ, 0);
        self.w64(INT0_ERSTBA, 0);
        self.w64(INT0_ERDP, 0);

        self.sts = S_HCH;
        self.iman_ie = false;
        self.iman_ip = false;
        self.cmd_active = false;
        self.cmd_cycle = true;
        self.ev_segment = 0;
        self.ev_index = 0;
        self.ev_cycle = true;
        self.next_slot = self.config.first_slot;
        self.slots.clear();
        self.pending_events.clear();
    }

    fn latch_usbsts(&mut self) {
        let raw = self.r32(OP_USBSTS);
        if raw & USBSTS_MARKER == 0 {
            self.sts &= !(raw & S_RW1C);
        }
    }

    fn latch_iman(&mut self) {
        let raw = self.r32(INT0_IMAN);
        if raw & IMAN_MARKER == 0 {
            self.iman_ie = raw & 0b10 != 0;
            if raw & 0b01 != 0 {
                self.iman_ip = false;
            }
        }
    }

    fn latch_portsc(&mut self) {
        for i in 0..self.portsc.len() {
            let raw = self.r32(Self::port_offset(i));
            if raw & PORTSC_MARKER != 0 {
                continue;
            }

            let mut state = self.portsc[i];
            state = (state & !P_RW) | (raw & P_RW);
            state &= !(raw & P_RW1C);
            if raw & P_PED != 0 {
                state &= !P_PED;
            }
            if raw & P_PR != 0 && self.port_reset[i].is_none() {
                state |= P_PR;
                self.start_port_reset(i, false);
            }
            if raw & P_WPR != 0 && self.port_reset[i].is_none() {
                self.start_port_reset(i, true);
            }
            self.portsc[i] = state;
        }
    }

    fn start_port_reset(&mut self, index: usize, warm: bool) {
        self.warm_used[index] = Some(warm);
        let port = (index + 1) as u8;
        if !self.config.failing_ports.contains(&port) {
            self.port_reset[index] = Some(self.config.port_reset_ticks);
        }
    }

    fn advance_port_resets(&mut self) {
        for i in 0..self.port_reset.len() {
            let Some(remaining) = self.port_reset[i] else {
                continue;
            };
            if remaining > 1 {
                self.port_reset[i] = Some(remaining - 1);
                continue;
            }

            self.port_reset[i] = None;
            let mut state = self.portsc[i] & !P_PR;
            let warm = self.warm_used[i].unwrap_or(false);
            state |= if warm { P_WRC } else { P_PRC };
            if state & P_CCS != 0 {
                state |= P_PED;
                self.pending_events
                    .push(Trb::port_status_change_event((i + 1) as u8));
            }
            self.portsc[i] = state;
        }
    }

    fn latch_doorbells(&mut self) {
        for i in 0..=usize::from(self.config.max_slots) {
            let raw = self.r32(DB_BASE + 4 * i);
            if raw == DOORBELL_SENTINEL {
                continue;
            }
            self.doorbell_log.push((i as u8, raw));
            if i == 0 {
                self.run_commands();
            } else {
                self.run_transfers(i as u8, (raw & 0xff) as u8);
            }
        }
    }

    // ---- command execution ----

    fn run_commands(&mut self) {
        if !self.cmd_active {
            let crcr = self.r64(OP_CRCR);
            if crcr & !0x3f == 0 {
                return;
            }
            self.cmd_dequeue = crcr & !0x3f;
            self.cmd_cycle = crcr & 1 != 0;
            self.cmd_active = true;
        }

        loop {
            let trb = read_trb(self.cmd_dequeue);
            if trb.cycle() != self.cmd_cycle {
                break;
            }
            if trb.trb_type() == Some(TrbType::Link) {
                if trb.toggles_cycle() {
                    self.cmd_cycle = !self.cmd_cycle;
                }
                self.cmd_dequeue = trb.parameter & !0xf;
                continue;
            }

            let addr = self.cmd_dequeue;
            self.cmd_dequeue += TRB_SIZE as u64;
            self.command_log.push(trb);
            let completion = self.execute_command(addr, trb);
            self.pending_events.push(completion);
        }
    }

    fn execute_command(&mut self, addr: u64, trb: Trb) -> Trb {
        let completion = |code, slot| Trb::command_completion_event(PhysAddr::new(addr), code, slot);
        let slot_id = (trb.control >> 24) as u8;
        let entry = if self.config.csz { 64u64 } else { 32 };

        match trb.trb_type() {
            Some(TrbType::EnableSlot) => {
                if self.next_slot == 0 || self.next_slot > self.config.max_slots {
                    return completion(CompletionCode::NoSlotsAvailableError, 0);
                }
                let slot = self.next_slot;
                self.next_slot += 1;
                self.slots.insert(slot, FakeSlot::default());
                completion(CompletionCode::Success, slot)
            }
            Some(TrbType::AddressDevice) => {
                let input = trb.parameter & !0xf;
                let ep0 = input + 2 * entry;
                let max_packet_size = (mem_r32(ep0 + 4) >> 16) as u16;
                let tr_dequeue = mem_r64(ep0 + 8);

                let slot = self.slots.entry(slot_id).or_default();
                slot.tr_dequeue = tr_dequeue & !0xf;
                slot.tr_cycle = tr_dequeue & 1 != 0;
                slot.max_packet_size = max_packet_size;

                let context = self.output_context(slot_id);
                if context != 0 {
                    let (state, address) = if trb.block_set_address() {
                        (1u32, 0u32)
                    } else {
                        (2u32, u32::from(slot_id))
                    };
                    mem_w32(context + 12, state << 27 | address);
                    mem_w32(context + entry, 1); // EP0 running
                    mem_w32(context + entry + 4, u32::from(max_packet_size) << 16 | 4 << 3);
                    mem_w64(context + entry + 8, tr_dequeue);
                }
                completion(CompletionCode::Success, slot_id)
            }
            Some(TrbType::EvaluateContext) => {
                let input = trb.parameter & !0xf;
                let add_flags = mem_r32(input + 4);
                if add_flags & 0b10 != 0 {
                    let ep0 = input + 2 * entry;
                    let max_packet_size = (mem_r32(ep0 + 4) >> 16) as u16;
                    if let Some(slot) = self.slots.get_mut(&slot_id) {
                        slot.max_packet_size = max_packet_size;
                    }
                    let context = self.output_context(slot_id);
                    if context != 0 {
                        let word = mem_r32(context + entry + 4);
                        mem_w32(
                            context + entry + 4,
                            (word & 0xffff) | u32::from(max_packet_size) << 16,
                        );
                    }
                }
                completion(CompletionCode::Success, slot_id)
            }
            Some(TrbType::NoOpCommand) => completion(CompletionCode::Success, 0),
            _ => completion(CompletionCode::TrbError, 0),
        }
    }

    // ---- transfer execution ----

    fn run_transfers(&mut self, slot_id: u8, dci: u8) {
        if dci != 1 {
            return;
        }
        let Some(mut slot) = self.slots.get(&slot_id).copied() else {
            return;
        };

        loop {
            let trb = read_trb(slot.tr_dequeue);
            if trb.cycle() != slot.tr_cycle {
                break;
            }
            if trb.trb_type() == Some(TrbType::Link) {
                if trb.toggles_cycle() {
                    slot.tr_cycle = !slot.tr_cycle;
                }
                slot.tr_dequeue = trb.parameter & !0xf;
                continue;
            }

            let addr = slot.tr_dequeue;
            slot.tr_dequeue += TRB_SIZE as u64;

            match trb.trb_type() {
                Some(TrbType::SetupStage) => {
                    self.setup_log.push(SetupPacket::from_parameter(trb.parameter));
                }
                Some(TrbType::DataStage) => {
                    let len = (trb.status & 0x1_ffff) as usize;
                    let in_direction = trb.control & 1 << 16 != 0;
                    if in_direction {
                        let n = len.min(self.config.device_descriptor.len());
                        for (k, byte) in self.config.device_descriptor[..n].iter().enumerate() {
                            mem_w8(trb.parameter + k as u64, *byte);
                        }
                    }
                    slot.last_data_len = len as u32;
                }
                Some(TrbType::EventData) => {
                    self.pending_events.push(Trb::transfer_event(
                        trb.parameter,
                        CompletionCode::Success,
                        slot_id,
                        dci,
                        slot.last_data_len,
                        true,
                    ));
                }
                Some(TrbType::StatusStage) => {
                    self.pending_events.push(Trb::transfer_event(
                        addr,
                        CompletionCode::Success,
                        slot_id,
                        dci,
                        0,
                        false,
                    ));
                }
                _ => {}
            }
        }

        self.slots.insert(slot_id, slot);
    }

    // ---- event delivery ----

    fn deliver_events(&mut self) {
        if self.pending_events.is_empty() {
            return;
        }
        let erstba = self.r64(INT0_ERSTBA) & !0x3f;
        let erst_size = self.r32(INT0_ERSTSZ) as usize;
        if erstba == 0 || erst_size == 0 {
            return;
        }

        let events: Vec<Trb> = core::mem::take(&mut self.pending_events);
        for mut trb in events {
            let entry = erstba + (self.ev_segment * 16) as u64;
            let segment_base = mem_r64(entry);
            let segment_size = mem_r32(entry + 8) as usize;

            trb.set_cycle(self.ev_cycle);
            write_trb(segment_base + (self.ev_index * TRB_SIZE) as u64, trb);

            self.ev_index += 1;
            if self.ev_index >= segment_size {
                self.ev_index = 0;
                self.ev_segment += 1;
                if self.ev_segment >= erst_size {
                    self.ev_segment = 0;
                    self.ev_cycle = !self.ev_cycle;
                }
            }
        }

        self.sts |= S_EINT;
        self.iman_ip = true;
    }
}

// Identity-mapped "DMA" accessors used by the model to follow pointers the
// driver programmed.
fn mem_r32(phys: u64) -> u32 {
    unsafe { (phys as *const u32).read_volatile() }
}

fn mem_w32(phys: u64, value: u32) {
    unsafe { (phys as *mut u32).write_volatile(value) }
}

fn mem_r64(phys: u64) -> u64 {
    u64::from(mem_r32(phys)) | u64::from(mem_r32(phys + 4)) << 32
}

fn mem_w64(phys: u64, value: u64) {
    mem_w32(phys, value as u32);
    mem_w32(phys + 4, (value >> 32) as u32);
}

fn mem_w8(phys: u64, value: u8) {
    unsafe { (phys as *mut u8).write_volatile(value) }
}

fn read_trb(phys: u64) -> Trb {
    Trb {
        parameter: mem_r64(phys),
        status: mem_r32(phys + 8),
        control: mem_r32(phys + 12),
    }
}

fn write_trb(phys: u64, trb: Trb) {
    mem_w64(phys, trb.parameter);
    mem_w32(phys + 8, trb.status);
    mem_w32(phys + 12, trb.control);
}

/// The [`xhci_memapi::HostApi`] implementation wrapping a [`FakeXhc`].
/// Cloned handles share the model, so tests keep one for assertions while
/// the driver owns another.
#[derive(Clone)]
pub struct FakeHost {
    xhc: Arc<Mutex<FakeXhc>>,
}

impl FakeHost {
    pub fn new(config: FakeXhcConfig) -> FakeHost {
        FakeHost {
            xhc: Arc::new(Mutex::new(FakeXhc::new(config))),
        }
    }

    pub fn bar(&self) -> PhysAddr {
        self.xhc.lock().bar()
    }

    pub fn device_info(&self) -> PciDeviceInfo {
        PciDeviceInfo {
            address: PciAddress::new(0, 5, 0),
            bar: self.bar(),
            msix_capability: None,
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut FakeXhc) -> R) -> R {
        f(&mut self.xhc.lock())
    }

    /// Runs one tick so writes issued right before an assertion get
    /// latched.
    pub fn settle(&self) {
        self.xhc.lock().tick();
    }
}

impl MemoryApi for FakeHost {
    fn alloc_contiguous(&mut self, pages: usize) -> Option<DmaRegion> {
        let chunk = RawChunk::new(pages * PAGE, PAGE);
        let region = DmaRegion {
            virt: VirtAddr::new(chunk.base()),
            phys: PhysAddr::new(chunk.base()),
            pages,
        };
        self.xhc.lock().dma_chunks.push(chunk);
        Some(region)
    }

    fn map_mmio(&mut self, phys: PhysAddr, _size: usize) -> Option<VirtAddr> {
        Some(VirtAddr::new(phys.as_u64()))
    }

    fn phys_to_virt(&self, phys: PhysAddr) -> VirtAddr {
        VirtAddr::new(phys.as_u64())
    }

    fn virt_to_phys(&self, virt: VirtAddr) -> PhysAddr {
        PhysAddr::new(virt.as_u64())
    }
}

impl TimeApi for FakeHost {
    fn msleep(&mut self, ms: u64) {
        let mut xhc = self.xhc.lock();
        for _ in 0..ms {
            xhc.tick();
        }
    }
}
