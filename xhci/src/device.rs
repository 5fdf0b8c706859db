//! Device setup: slot enable, context preparation, Address Device and the
//! first control transfers.
//!
//! A port's device walks Disconnected -> SlotEnabled -> Addressed ->
//! DescriptorFetched; this module drives those transitions and keeps the
//! per-slot state.

use crate::context::{
    CONTROL_ENDPOINT_DCI, DeviceContext, ENDPOINT_TYPE_CONTROL, InputContext, context_flag,
};
use crate::controller::Xhci;
use crate::dma::DmaBuf;
use crate::error::XhciError;
use crate::portsc::PortSpeed;
use crate::ring::TransferRing;
use crate::trb::{DataDirection, SetupPacket, TransferType, Trb};
use core::num::NonZeroU8;
use log::{debug, info, warn};
use xhci_memapi::{HostApi, MemoryApi};

pub const REQUEST_GET_DESCRIPTOR: u8 = 6;
pub const DESCRIPTOR_TYPE_DEVICE: u8 = 1;

/// Device-to-host, standard, device-recipient.
const REQUEST_TYPE_DEVICE_IN: u8 = 0x80;

/// An addressed device on a root hub port. Owns the slot's contexts and the
/// control endpoint transfer ring for the driver session.
pub struct Device {
    port: NonZeroU8,
    slot: NonZeroU8,
    speed: PortSpeed,
    pub(crate) input_context: InputContext,
    pub(crate) output_context: DeviceContext,
    pub(crate) control_ring: TransferRing,
    descriptor: Option<DeviceDescriptor>,
}

impl Device {
    pub fn port(&self) -> NonZeroU8 {
        self.port
    }

    pub fn slot(&self) -> NonZeroU8 {
        self.slot
    }

    pub fn speed(&self) -> PortSpeed {
        self.speed
    }

    /// The parsed device descriptor, present once setup has completed.
    pub fn descriptor(&self) -> Option<&DeviceDescriptor> {
        self.descriptor.as_ref()
    }
}

impl<H: HostApi> Xhci<H> {
    /// Runs the full setup sequence for the device connected to `port` and
    /// returns its slot id.
    pub fn setup_device(&mut self, port: NonZeroU8) -> Result<NonZeroU8, XhciError> {
        let speed = self.regs.portsc(port).read().port_speed();
        info!("setting up {} device on port {port}", speed.label());

        let slot = self.enable_slot()?;
        debug!("port {port}: slot {slot} enabled");

        let entry_size = self.caps.context_entry_size();
        let output_context = DeviceContext::new(&mut self.dma, &mut self.host, entry_size)?;
        self.dcbaa.set(slot, output_context.phys());

        let control_ring = TransferRing::new(&mut self.dma, &mut self.host, CONTROL_ENDPOINT_DCI)?;
        let mut input_context = InputContext::new(&mut self.dma, &mut self.host, entry_size)?;
        configure_input_context(&mut input_context, port, speed, &control_ring);

        let mut device = Device {
            port,
            slot,
            speed,
            input_context,
            output_context,
            control_ring,
            descriptor: None,
        };

        self.address_device(&device)?;
        self.log_output_context(&device);

        self.fetch_device_descriptor(&mut device)?;

        self.devices.insert(slot, device);
        Ok(slot)
    }

    fn enable_slot(&mut self) -> Result<NonZeroU8, XhciError> {
        let completion = self.send_command(Trb::enable_slot())?;
        NonZeroU8::new(completion.slot_id()).ok_or(XhciError::NoSlotsAvailable)
    }

    /// Issues Address Device with BSR=0, so the controller sends
    /// SET_ADDRESS on the bus and moves the slot to Addressed.
    fn address_device(&mut self, device: &Device) -> Result<(), XhciError> {
        self.send_command(Trb::address_device(
            device.input_context.phys(),
            device.slot.get(),
            false,
        ))?;
        Ok(())
    }

    /// Reads back the slot's authoritative context through the DCBAA entry,
    /// as a sanity check that the controller accepted it.
    fn log_output_context(&self, device: &Device) {
        let phys = self.dcbaa.get(device.slot);
        if phys.as_u64() == 0 {
            warn!("slot {}: empty DCBAA entry after Address Device", device.slot);
            return;
        }
        if phys != device.output_context.phys() {
            warn!(
                "slot {}: DCBAA entry {:#x} does not match the allocated device context",
                device.slot,
                phys.as_u64()
            );
        }
        let virt = self.host.phys_to_virt(phys);
        let entry_size = self.caps.context_entry_size();

        let slot_ctx =
            unsafe { virt.as_ptr::<crate::context::SlotContext>().read_volatile() };
        let ep0 = unsafe {
            (virt + entry_size as u64)
                .as_ptr::<crate::context::EndpointContext>()
                .read_volatile()
        };
        debug!(
            "slot {}: state {}, address {}, ep0 {} (max packet size {})",
            device.slot,
            slot_ctx.slot_state().label(),
            slot_ctx.device_address(),
            ep0.endpoint_state().label(),
            ep0.max_packet_size(),
        );
    }

    /// Two-phase descriptor fetch: probe the first 8 bytes to learn
    /// `bMaxPacketSize0`, fix up EP0 if the assumption was wrong, then read
    /// the full 18 bytes.
    fn fetch_device_descriptor(&mut self, device: &mut Device) -> Result<(), XhciError> {
        let data = self.dma.alloc(&mut self.host, 64, 64, 4096)?;
        let status = self.dma.alloc(&mut self.host, 64, 64, 4096)?;

        self.get_device_descriptor(device, &data, &status, 8)?;

        let b_max_packet_size0 = unsafe { data.as_ptr::<u8>().add(7).read_volatile() };
        let actual = if device.speed.packet_size_is_exponent() {
            1u16 << u32::from(b_max_packet_size0).min(15)
        } else {
            u16::from(b_max_packet_size0)
        };
        let assumed = device.speed.initial_max_packet_size();
        if actual != 0 && actual != assumed {
            debug!(
                "slot {}: adjusting EP0 max packet size {assumed} -> {actual}",
                device.slot
            );
            self.update_control_packet_size(device, actual)?;
        }

        self.get_device_descriptor(device, &data, &status, 18)?;

        let mut bytes = [0u8; 18];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = unsafe { data.as_ptr::<u8>().add(i).read_volatile() };
        }
        let descriptor = DeviceDescriptor::from_bytes(&bytes);
        if descriptor.descriptor_type != DESCRIPTOR_TYPE_DEVICE {
            warn!(
                "slot {}: unexpected descriptor type {}",
                device.slot, descriptor.descriptor_type
            );
        }
        descriptor.log();
        device.descriptor = Some(descriptor);
        Ok(())
    }

    /// One GET_DESCRIPTOR(DEVICE) control transfer of `length` bytes into
    /// `data`: Setup Stage, IN Data Stage chained into an Event Data TRB
    /// whose parameter is `status`'s address, then the endpoint doorbell.
    fn get_device_descriptor(
        &mut self,
        device: &mut Device,
        data: &DmaBuf,
        status: &DmaBuf,
        length: u16,
    ) -> Result<(), XhciError> {
        let setup = SetupPacket {
            request_type: REQUEST_TYPE_DEVICE_IN,
            request: REQUEST_GET_DESCRIPTOR,
            value: u16::from(DESCRIPTOR_TYPE_DEVICE) << 8,
            index: 0,
            length,
        };

        let ring = &mut device.control_ring;
        ring.enqueue(Trb::setup_stage(setup, TransferType::InDataStage));
        ring.enqueue(Trb::data_stage(
            data.phys(),
            u32::from(length),
            DataDirection::In,
            true,
            true,
        ));
        ring.enqueue(Trb::event_data(status.phys()));

        self.regs
            .ring_endpoint_doorbell(device.slot.get(), device.control_ring.dci());

        let transfer = self.wait_for_transfer_event()?;
        if transfer.is_event_data() && transfer.trb_pointer() != status.phys().as_u64() {
            debug!(
                "slot {}: transfer event for unexpected buffer {:#x}",
                device.slot,
                transfer.trb_pointer()
            );
        }
        Ok(())
    }

    /// Proposes a new EP0 max packet size via Evaluate Context.
    fn update_control_packet_size(
        &mut self,
        device: &mut Device,
        max_packet_size: u16,
    ) -> Result<(), XhciError> {
        let input = &mut device.input_context;
        input.control_mut().set_drop_flags(0);
        input
            .control_mut()
            .set_add_flags(context_flag(CONTROL_ENDPOINT_DCI));
        input
            .endpoint_mut(CONTROL_ENDPOINT_DCI)
            .set_max_packet_size(max_packet_size);

        self.send_command(Trb::evaluate_context(input.phys(), device.slot.get()))?;
        Ok(())
    }
}

/// Fills the input context for Address Device: add the slot context and the
/// default control endpoint, nothing else.
fn configure_input_context(
    input: &mut InputContext,
    port: NonZeroU8,
    speed: PortSpeed,
    control_ring: &TransferRing,
) {
    let control = input.control_mut();
    control.set_add_flags(context_flag(0) | context_flag(CONTROL_ENDPOINT_DCI));
    control.set_drop_flags(0);

    let slot = input.slot_mut();
    slot.set_route_string(0);
    slot.set_speed(speed.raw());
    slot.set_context_entries(1);
    slot.set_root_hub_port_number(port.get());
    slot.set_interrupter_target(0);

    let ep0 = input.endpoint_mut(CONTROL_ENDPOINT_DCI);
    ep0.set_endpoint_type(ENDPOINT_TYPE_CONTROL);
    ep0.set_error_count(3);
    ep0.set_max_packet_size(speed.initial_max_packet_size());
    ep0.set_tr_dequeue_pointer(control_ring.base(), control_ring.cycle());
    ep0.set_average_trb_length(8);
}

/// The standard 18-byte USB device descriptor.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DeviceDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub bcd_usb: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub max_packet_size0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: u16,
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_number_index: u8,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    pub fn from_bytes(bytes: &[u8; 18]) -> DeviceDescriptor {
        DeviceDescriptor {
            length: bytes[0],
            descriptor_type: bytes[1],
            bcd_usb: u16::from_le_bytes([bytes[2], bytes[3]]),
            device_class: bytes[4],
            device_subclass: bytes[5],
            device_protocol: bytes[6],
            max_packet_size0: bytes[7],
            vendor_id: u16::from_le_bytes([bytes[8], bytes[9]]),
            product_id: u16::from_le_bytes([bytes[10], bytes[11]]),
            bcd_device: u16::from_le_bytes([bytes[12], bytes[13]]),
            manufacturer_index: bytes[14],
            product_index: bytes[15],
            serial_number_index: bytes[16],
            num_configurations: bytes[17],
        }
    }

    fn log(&self) {
        info!("device descriptor:");
        info!("    bLength            : {}", self.length);
        info!("    bDescriptorType    : {}", self.descriptor_type);
        info!("    bcdUSB             : {:#06x}", self.bcd_usb);
        info!("    bDeviceClass       : {}", self.device_class);
        info!("    bDeviceSubClass    : {}", self.device_subclass);
        info!("    bDeviceProtocol    : {}", self.device_protocol);
        info!("    bMaxPacketSize0    : {}", self.max_packet_size0);
        info!("    idVendor           : {:#06x}", self.vendor_id);
        info!("    idProduct          : {:#06x}", self.product_id);
        info!("    bcdDevice          : {:#06x}", self.bcd_device);
        info!("    iManufacturer      : {}", self.manufacturer_index);
        info!("    iProduct           : {}", self.product_index);
        info!("    iSerialNumber      : {}", self.serial_number_index);
        info!("    bNumConfigurations : {}", self.num_configurations);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::DmaAllocator;
    use crate::testing::FakeMemory;

    #[test]
    fn test_device_descriptor_parsing() {
        let bytes: [u8; 18] = [
            0x12, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x40, 0x8a, 0x2e, 0x01, 0x00, 0x34, 0x12,
            1, 2, 3, 1,
        ];
        let descriptor = DeviceDescriptor::from_bytes(&bytes);

        assert_eq!(descriptor.length, 18);
        assert_eq!(descriptor.descriptor_type, DESCRIPTOR_TYPE_DEVICE);
        assert_eq!(descriptor.bcd_usb, 0x0200);
        assert_eq!(descriptor.max_packet_size0, 64);
        assert_eq!(descriptor.vendor_id, 0x2e8a);
        assert_eq!(descriptor.product_id, 0x0001);
        assert_eq!(descriptor.bcd_device, 0x1234);
        assert_eq!(descriptor.num_configurations, 1);
    }

    #[test]
    fn test_input_context_for_address_device() {
        let mut mem = FakeMemory::new();
        let mut dma = DmaAllocator::new();

        let ring = TransferRing::new(&mut dma, &mut mem, CONTROL_ENDPOINT_DCI).unwrap();
        let mut input = InputContext::new(&mut dma, &mut mem, 32).unwrap();
        let port = NonZeroU8::new(4).unwrap();

        configure_input_context(&mut input, port, PortSpeed::LowSpeed, &ring);

        // add flags select slot + EP0, nothing is dropped
        let base = input.phys().as_u64() as *const u32;
        let drop_flags = unsafe { base.read_volatile() };
        let add_flags = unsafe { base.add(1).read_volatile() };
        assert_eq!(drop_flags, 0);
        assert_eq!(add_flags, 0b11);

        let ep0 = input.endpoint_mut(CONTROL_ENDPOINT_DCI);
        assert_eq!(ep0.max_packet_size(), 8);
        assert_eq!(
            ep0.tr_dequeue_pointer(),
            ring.base().as_u64() | 1,
            "dequeue pointer carries the ring's cycle state"
        );
    }
}
