//! Controller lifecycle: bring-up, reset, configuration, start, and the
//! poll-based command/event plumbing everything else is built on.

use crate::PciDeviceInfo;
use crate::context::DeviceContextBaseAddressArray;
use crate::device::Device;
use crate::dma::DmaAllocator;
use crate::error::XhciError;
use crate::event::{EVENT_RING_SEGMENT_COUNT, EVENT_RING_TRB_COUNT, EventRing};
use crate::extended::identify_usb3_ports;
use crate::operational::*;
use crate::port::reset_port;
use crate::portsc::PortSc;
use crate::registers::*;
use crate::ring::CommandRing;
use crate::runtime::*;
use crate::trb::{CommandCompletion, CompletionCode, Event, TransferEvent, Trb};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::num::NonZeroU8;
use log::{debug, error, info, warn};
use xhci_memapi::{HostApi, TimeApi};

/// Everything below the doorbell array lives in the first 64 KiB of the
/// window; the BAR size probe is the PCI layer's business.
const MMIO_WINDOW_SIZE: usize = 0x1_0000;

const HALT_TIMEOUT_MS: u64 = 20;
const RESET_TIMEOUT_MS: u64 = 100;
const START_TIMEOUT_MS: u64 = 100;
const POST_RESET_SETTLE_MS: u64 = 50;

/// Settle delay between ringing a doorbell and polling the event ring.
pub(crate) const COMMAND_COMPLETION_DELAY_MS: u64 = 40;
pub(crate) const TRANSFER_COMPLETION_DELAY_MS: u64 = 400;

/// The HCSPARAMS/HCCPARAMS-derived maxima, read once at bring-up.
#[derive(Debug, Copy, Clone)]
pub(crate) struct CapabilityInfo {
    pub max_slots: u8,
    pub max_interrupters: u16,
    pub max_ports: u8,
    pub ist: u8,
    pub erst_max: u8,
    pub max_scratchpad_buffers: u16,
    pub ac64: bool,
    pub csz: bool,
}

impl CapabilityInfo {
    fn read(regs: &Registers) -> CapabilityInfo {
        let caps = regs.capabilities();
        let hcs1 = caps.hcsparams1().read();
        let hcs2 = caps.hcsparams2().read();
        let hcc1 = caps.hccparams1().read();

        CapabilityInfo {
            max_slots: hcs1.max_device_slots(),
            max_interrupters: hcs1.max_interrupters(),
            max_ports: hcs1.max_ports(),
            ist: hcs2.ist(),
            erst_max: hcs2.erst_max(),
            max_scratchpad_buffers: hcs2.max_scratchpad_bufs(),
            ac64: hcc1.ac64(),
            csz: hcc1.csz(),
        }
    }

    /// 64-byte context entries when CSZ is set, 32-byte otherwise.
    pub fn context_entry_size(&self) -> usize {
        if self.csz { 64 } else { 32 }
    }

    fn log(&self) {
        info!("capability registers:");
        info!("    max device slots      : {}", self.max_slots);
        info!("    max interrupters      : {}", self.max_interrupters);
        info!("    max ports             : {}", self.max_ports);
        info!("    IST                   : {}", self.ist);
        info!("    ERST max              : {}", self.erst_max);
        info!("    scratchpad buffers    : {}", self.max_scratchpad_buffers);
        info!("    64-bit addressing     : {}", self.ac64);
        info!("    64-byte context size  : {}", self.csz);
    }
}

/// One xHCI controller instance. Owns the MMIO window views and every
/// DMA-resident structure shared with the hardware; runs entirely on one
/// worker and reaps events by polling.
pub struct Xhci<H: HostApi> {
    pub(crate) host: H,
    pub(crate) regs: Registers,
    pub(crate) caps: CapabilityInfo,
    pub(crate) dma: DmaAllocator,
    usb3_ports: Vec<u8>,
    pub(crate) command_ring: CommandRing,
    pub(crate) event_ring: EventRing,
    pub(crate) dcbaa: DeviceContextBaseAddressArray,
    pub(crate) devices: BTreeMap<NonZeroU8, Device>,
}

impl<H: HostApi> Xhci<H> {
    /// Brings the controller up to the running state: map, parse, reset,
    /// allocate the DMA structures, program the operational registers,
    /// start, and reset every root hub port.
    ///
    /// Controller-level failures abort initialization; port-level failures
    /// only skip the port.
    pub fn init(mut host: H, device_info: PciDeviceInfo) -> Result<Xhci<H>, XhciError> {
        info!("initializing xHCI controller at {}", device_info.address);

        let mmio = host
            .map_mmio(device_info.bar, MMIO_WINDOW_SIZE)
            .ok_or(XhciError::MmioMapFailed)?;
        let regs = unsafe { Registers::new(mmio) };

        let caps = CapabilityInfo::read(&regs);
        caps.log();

        let usb3_ports = identify_usb3_ports(&regs);

        reset_controller(&regs, &mut host)?;

        let mut dma = DmaAllocator::new();
        let command_ring = CommandRing::new(&mut dma, &mut host)?;
        let event_ring = EventRing::new(
            &mut dma,
            &mut host,
            EVENT_RING_SEGMENT_COUNT,
            EVENT_RING_TRB_COUNT,
        )?;
        let dcbaa = DeviceContextBaseAddressArray::new(
            &mut dma,
            &mut host,
            caps.max_slots,
            caps.max_scratchpad_buffers,
            caps.context_entry_size(),
        )?;

        configure_operational(&regs, &caps, &command_ring, &event_ring, &dcbaa);
        start_controller(&regs, &mut host)?;

        let mut controller = Xhci {
            host,
            regs,
            caps,
            dma,
            usb3_ports,
            command_ring,
            event_ring,
            dcbaa,
            devices: BTreeMap::new(),
        };

        controller.reset_all_ports();

        // The reset pass leaves stale port change events behind; discard
        // them so device setup starts from a clean ring.
        let flushed = controller.event_ring.flush_unprocessed_events();
        if flushed > 0 {
            debug!("flushed {flushed} stale events after port resets");
            controller
                .regs
                .update_event_dequeue(0, controller.event_ring.dequeue_pointer());
        }
        controller.regs.clear_interrupt_pending(0);

        Ok(controller)
    }

    /// Re-runs the halt/reset sequence. Only meaningful before devices have
    /// been set up; the DMA structures are re-published by the next
    /// configure.
    pub fn reset(&mut self) -> Result<(), XhciError> {
        reset_controller(&self.regs, &mut self.host)
    }

    pub fn max_ports(&self) -> u8 {
        self.caps.max_ports
    }

    pub fn is_usb3_port(&self, port: NonZeroU8) -> bool {
        self.usb3_ports.contains(&port.get())
    }

    /// Resets every root hub port, logging the outcome per port. Failures
    /// are contained to the port.
    pub fn reset_all_ports(&mut self) {
        for number in 1..=self.caps.max_ports {
            let port = NonZeroU8::new(number).unwrap();
            let usb3 = self.is_usb3_port(port);
            let kind = if usb3 { "USB3" } else { "USB2" };
            match reset_port(&self.regs, &mut self.host, port, usb3) {
                Ok(()) => info!("reset {kind} port {port}"),
                Err(_) => warn!("failed to reset {kind} port {port}"),
            }
        }
    }

    /// Runs device setup for every port with a connected device. Returns
    /// how many devices reached the descriptor-fetched state.
    pub fn setup_connected_devices(&mut self) -> usize {
        let mut ready = 0;
        for number in 1..=self.caps.max_ports {
            let port = NonZeroU8::new(number).unwrap();
            if !self.regs.portsc(port).read().contains(PortSc::CCS) {
                continue;
            }
            match self.setup_device(port) {
                Ok(slot) => {
                    info!("device on port {port} ready at slot {slot}");
                    ready += 1;
                }
                Err(err) => warn!("device setup on port {port} failed: {err}"),
            }
        }
        ready
    }

    pub fn device(&self, slot: NonZeroU8) -> Option<&Device> {
        self.devices.get(&slot)
    }

    /// Enqueues a command, rings the command doorbell and polls for its
    /// Command Completion Event.
    pub(crate) fn send_command(&mut self, trb: Trb) -> Result<CommandCompletion, XhciError> {
        let slot_addr = self.command_ring.enqueue(trb);
        self.regs.ring_command_doorbell();
        self.host.msleep(COMMAND_COMPLETION_DELAY_MS);

        let mut matched = None;
        let mut fallback = None;
        for event in self.reap_events() {
            match Event::parse(event) {
                Event::CommandCompletion(completion) => {
                    if completion.command_trb_pointer() == slot_addr {
                        matched = Some(completion);
                    } else if fallback.is_none() {
                        fallback = Some(completion);
                    }
                }
                Event::PortStatusChange(change) => {
                    debug!("port status change on port {}", change.port_id());
                }
                other => debug!("ignoring event {other:?}"),
            }
        }

        let completion = matched
            .or(fallback)
            .ok_or(XhciError::Timeout("command completion event"))?;
        match completion.completion_code() {
            CompletionCode::Success => Ok(completion),
            CompletionCode::NoSlotsAvailableError => Err(XhciError::NoSlotsAvailable),
            code => {
                error!("command failed: {code}");
                self.log_usbsts();
                Err(XhciError::CommandFailed(code))
            }
        }
    }

    /// Polls for the Transfer Event of a transfer whose doorbell was just
    /// rung.
    pub(crate) fn wait_for_transfer_event(&mut self) -> Result<TransferEvent, XhciError> {
        self.host.msleep(TRANSFER_COMPLETION_DELAY_MS);

        let mut found = None;
        for event in self.reap_events() {
            match Event::parse(event) {
                Event::Transfer(transfer) => found = Some(transfer),
                other => debug!("ignoring event {other:?}"),
            }
        }

        let transfer = found.ok_or(XhciError::Timeout("transfer event"))?;
        match transfer.completion_code() {
            CompletionCode::Success | CompletionCode::ShortPacket => Ok(transfer),
            code => {
                error!("transfer failed: {code}");
                self.log_usbsts();
                Err(XhciError::TransferFailed(code))
            }
        }
    }

    /// Drains the event ring, publishes the new dequeue pointer and
    /// acknowledges the interrupt-pending flags.
    fn reap_events(&mut self) -> Vec<Trb> {
        let mut events = Vec::new();
        if self.event_ring.has_unprocessed_events() {
            self.event_ring.dequeue_events(&mut events);
            self.regs
                .update_event_dequeue(0, self.event_ring.dequeue_pointer());
            self.regs.clear_interrupt_pending(0);
        }
        events
    }

    pub(crate) fn log_usbsts(&self) {
        let sts = self.regs.operational().usbsts().read();
        error!("USBSTS: {sts:?}");
    }
}

fn reset_controller<H: HostApi>(regs: &Registers, host: &mut H) -> Result<(), XhciError> {
    let op = regs.operational();

    let mut cmd = op.usbcmd().read();
    cmd.remove(UsbCmd::RS);
    op.usbcmd().write(cmd);

    poll_until(host, HALT_TIMEOUT_MS, || {
        op.usbsts().read().contains(UsbSts::HCH)
    })
    .map_err(|()| XhciError::Timeout("controller halt"))?;

    let mut cmd = op.usbcmd().read();
    cmd.insert(UsbCmd::HCRST);
    op.usbcmd().write(cmd);

    poll_until(host, RESET_TIMEOUT_MS, || {
        !op.usbcmd().read().contains(UsbCmd::HCRST) && !op.usbsts().read().contains(UsbSts::CNR)
    })
    .map_err(|()| XhciError::Timeout("controller reset"))?;

    host.msleep(POST_RESET_SETTLE_MS);

    let at_defaults = op.usbcmd().read().bits() == 0
        && op.dnctrl().read() == 0
        && op.crcr().read() == 0
        && op.dcbaap().read() == 0
        && op.config().read() == 0;
    if !at_defaults {
        error!("USBSTS after failed reset: {:?}", op.usbsts().read());
        return Err(XhciError::ResetFailed);
    }

    debug!("controller reset complete");
    Ok(())
}

fn configure_operational(
    regs: &Registers,
    caps: &CapabilityInfo,
    command_ring: &CommandRing,
    event_ring: &EventRing,
    dcbaa: &DeviceContextBaseAddressArray,
) {
    let op = regs.operational();

    let page_size = op.pagesize().read().size();
    debug!("controller page size: {page_size} bytes");

    op.dnctrl().write(0xffff);
    op.config().write(u32::from(caps.max_slots));
    op.dcbaap().write(dcbaa.phys().as_u64());

    let mut crcr = command_ring.base().as_u64();
    if command_ring.cycle() {
        crcr |= CRCR_RING_CYCLE_STATE;
    }
    op.crcr().write(crcr);

    event_ring.install(regs.interrupter(0));

    // Events are reaped by polling, but IE lets an interrupt handler be
    // interposed later without reprogramming.
    regs.interrupter(0).iman().write(Iman::IE);
    regs.clear_interrupt_pending(0);

    debug!(
        "operational registers programmed: DCBAAP {:#x}, CRCR {:#x}, ERSTBA {:#x}",
        dcbaa.phys().as_u64(),
        command_ring.base().as_u64(),
        event_ring.erst_phys().as_u64(),
    );
}

fn start_controller<H: HostApi>(regs: &Registers, host: &mut H) -> Result<(), XhciError> {
    let op = regs.operational();

    let mut cmd = op.usbcmd().read();
    cmd.insert(UsbCmd::RS | UsbCmd::INTE | UsbCmd::HSEE);
    op.usbcmd().write(cmd);

    poll_until(host, START_TIMEOUT_MS, || {
        !op.usbsts().read().contains(UsbSts::HCH)
    })
    .map_err(|()| XhciError::Timeout("controller start"))?;

    info!("controller running");
    Ok(())
}

/// Polls `condition` once per millisecond of budget, sleeping before each
/// check so the hardware gets a chance to make progress first.
fn poll_until<T: TimeApi>(
    time: &mut T,
    budget_ms: u64,
    mut condition: impl FnMut() -> bool,
) -> Result<(), ()> {
    let mut waited = 0;
    while waited < budget_ms {
        time.msleep(1);
        waited += 1;
        if condition() {
            return Ok(());
        }
    }
    Err(())
}
