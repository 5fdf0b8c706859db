//! End-to-end bring-up against the scripted controller model: reset,
//! configuration, port resets, slot enable, Address Device and the initial
//! GET_DESCRIPTOR control transfer.

use core::num::NonZeroU8;
use xhci::testing::{
    FakeHost, FakePortConfig, FakeXhcConfig, OP_CONFIG, OP_CRCR, OP_DCBAAP, OP_DNCTRL, OP_USBCMD,
};
use xhci::{PortSc, TrbType, UsbCmd, UsbSts, Xhci};

const USB2_LOW_SPEED: u8 = 2;
const USB2_HIGH_SPEED: u8 = 3;
const USB3_SUPER_SPEED: u8 = 4;

fn init(host: &FakeHost) -> Xhci<FakeHost> {
    Xhci::init(host.clone(), host.device_info()).expect("bring-up failed")
}

#[test]
fn test_cold_reset_of_running_controller() {
    let host = FakeHost::new(FakeXhcConfig::default());
    host.with(|xhc| xhc.force_running());

    let _controller = init(&host);

    host.with(|xhc| {
        let usbcmd = UsbCmd::from_bits_retain(xhc.mmio_read32(OP_USBCMD));
        assert!(usbcmd.contains(UsbCmd::RS | UsbCmd::INTE | UsbCmd::HSEE));
        assert!(!usbcmd.contains(UsbCmd::HCRST));
        assert_eq!(xhc.status() & UsbSts::HCH.bits(), 0, "controller running");
    });
}

#[test]
fn test_double_reset_leaves_registers_at_defaults() {
    let host = FakeHost::new(FakeXhcConfig::default());
    let mut controller = init(&host);

    controller.reset().expect("first reset");
    controller.reset().expect("second reset");

    host.with(|xhc| {
        assert_eq!(xhc.mmio_read32(OP_USBCMD), 0);
        assert_eq!(xhc.mmio_read32(OP_DNCTRL), 0);
        assert_eq!(xhc.mmio_read64(OP_CRCR), 0);
        assert_eq!(xhc.mmio_read64(OP_DCBAAP), 0);
        assert_eq!(xhc.mmio_read32(OP_CONFIG), 0);
    });
}

#[test]
fn test_configure_publishes_ring_addresses() {
    let host = FakeHost::new(FakeXhcConfig::default());
    let _controller = init(&host);

    host.with(|xhc| {
        assert_eq!(xhc.mmio_read32(OP_DNCTRL), 0xffff);
        assert_eq!(xhc.mmio_read32(OP_CONFIG), 32);
        assert_ne!(xhc.mmio_read64(OP_DCBAAP), 0);
        let crcr = xhc.mmio_read64(OP_CRCR);
        assert_ne!(crcr & !0x3f, 0);
        assert_eq!(crcr & 1, 1, "command ring cycle state starts at 1");
        assert!(xhc.interrupt_enable());
    });
}

#[test]
fn test_enable_slot_returns_controller_assigned_slot() {
    let config = FakeXhcConfig {
        first_slot: 3,
        connected: vec![FakePortConfig::connected(1, USB2_HIGH_SPEED)],
        ..FakeXhcConfig::default()
    };
    let host = FakeHost::new(config);
    let mut controller = init(&host);

    assert_eq!(controller.setup_connected_devices(), 1);

    let slot = NonZeroU8::new(3).unwrap();
    let device = controller.device(slot).expect("device at slot 3");
    assert_eq!(device.slot(), slot);
    assert_eq!(device.port().get(), 1);

    host.with(|xhc| {
        let commands = xhc.commands();
        assert_eq!(commands[0].trb_type(), Some(TrbType::EnableSlot));
        assert!(
            xhc.doorbell_writes().contains(&(0, 0)),
            "command doorbell rung with target 0"
        );
    });
}

#[test]
fn test_address_device_carries_input_context_and_slot() {
    let config = FakeXhcConfig {
        first_slot: 3,
        connected: vec![FakePortConfig::connected(2, USB2_HIGH_SPEED)],
        ..FakeXhcConfig::default()
    };
    let host = FakeHost::new(config);
    let mut controller = init(&host);
    assert_eq!(controller.setup_connected_devices(), 1);

    host.with(|xhc| {
        let address_device = xhc
            .commands()
            .iter()
            .find(|trb| trb.trb_type() == Some(TrbType::AddressDevice))
            .copied()
            .expect("an Address Device command was issued");

        assert_ne!(address_device.parameter, 0, "input context pointer");
        assert_eq!(address_device.parameter % 64, 0, "input context alignment");
        assert_eq!((address_device.control >> 24) as u8, 3, "slot id");
        assert!(!address_device.block_set_address(), "BSR is 0");

        // The controller wrote the output context reachable through
        // DCBAA[3].
        assert_ne!(xhc.output_context(3), 0);
    });
}

#[test]
fn test_get_descriptor_two_phase_fetch() {
    // High-speed device whose EP0 max packet size (8) differs from the
    // assumed 64, forcing the Evaluate Context pass.
    let mut descriptor = FakeXhcConfig::default().device_descriptor;
    descriptor[7] = 8;
    let config = FakeXhcConfig {
        connected: vec![FakePortConfig::connected(1, USB2_HIGH_SPEED)],
        device_descriptor: descriptor,
        ..FakeXhcConfig::default()
    };
    let host = FakeHost::new(config);
    let mut controller = init(&host);
    assert_eq!(controller.setup_connected_devices(), 1);

    let slot = NonZeroU8::new(1).unwrap();
    let fetched = *controller
        .device(slot)
        .and_then(|device| device.descriptor())
        .expect("descriptor fetched");
    assert_eq!(fetched, xhci::DeviceDescriptor::from_bytes(&descriptor));
    assert_eq!(fetched.max_packet_size0, 8);

    host.with(|xhc| {
        let setups = xhc.setup_packets();
        assert_eq!(setups.len(), 2, "8-byte probe then full fetch");
        for setup in setups {
            assert_eq!(setup.request_type, 0x80);
            assert_eq!(setup.request, 6);
            assert_eq!(setup.value, 0x0100);
            assert_eq!(setup.index, 0);
        }
        assert_eq!(setups[0].length, 8);
        assert_eq!(setups[1].length, 18);

        assert!(
            xhc.commands()
                .iter()
                .any(|trb| trb.trb_type() == Some(TrbType::EvaluateContext)),
            "EP0 max packet size was re-evaluated"
        );
        assert!(
            xhc.doorbell_writes().iter().filter(|w| **w == (1, 1)).count() >= 2,
            "control endpoint doorbell rung with DCI 1"
        );
    });
}

#[test]
fn test_matching_packet_size_skips_evaluate_context() {
    // Default descriptor already reports 64, matching the high-speed
    // assumption.
    let config = FakeXhcConfig {
        connected: vec![FakePortConfig::connected(1, USB2_HIGH_SPEED)],
        ..FakeXhcConfig::default()
    };
    let host = FakeHost::new(config);
    let mut controller = init(&host);
    assert_eq!(controller.setup_connected_devices(), 1);

    host.with(|xhc| {
        assert!(
            !xhc.commands()
                .iter()
                .any(|trb| trb.trb_type() == Some(TrbType::EvaluateContext))
        );
    });
}

#[test]
fn test_port_reset_selects_pr_or_wpr_by_protocol() {
    // Ports 1-2 are USB2, ports 3-4 USB3. Port 2 starts unpowered with a
    // pending connect status change; port 3 is a connected USB3 device.
    let mut usb2 = FakePortConfig::connected(2, USB2_LOW_SPEED);
    usb2.powered = false;
    usb2.sticky_bits = PortSc::CSC.raw();
    let mut descriptor = FakeXhcConfig::default().device_descriptor;
    descriptor[7] = 9; // 2^9 = 512 for the SuperSpeed device
    let config = FakeXhcConfig {
        first_usb3_port: 3,
        connected: vec![usb2, FakePortConfig::connected(3, USB3_SUPER_SPEED)],
        device_descriptor: descriptor,
        ..FakeXhcConfig::default()
    };
    let host = FakeHost::new(config);
    let _controller = init(&host);
    host.settle();

    host.with(|xhc| {
        assert_eq!(xhc.warm_reset_used(2), Some(false), "USB2 port used PR");
        assert_eq!(xhc.warm_reset_used(3), Some(true), "USB3 port used WPR");

        let port2 = xhc.portsc_state(2);
        assert_ne!(port2 & PortSc::PP.raw(), 0, "port was powered on");
        assert_ne!(port2 & PortSc::PED.raw(), 0, "port enabled after reset");
        assert_eq!(port2 & PortSc::CSC.raw(), 0, "connect change acknowledged");

        assert_ne!(xhc.portsc_state(3) & PortSc::PED.raw(), 0);
    });
}

#[test]
fn test_failed_port_reset_is_contained() {
    let config = FakeXhcConfig {
        connected: vec![FakePortConfig::connected(2, USB2_HIGH_SPEED)],
        failing_ports: vec![1],
        ..FakeXhcConfig::default()
    };
    let host = FakeHost::new(config);

    // Port 1 never completes its reset; bring-up and the device on port 2
    // must not care.
    let mut controller = init(&host);
    assert_eq!(controller.setup_connected_devices(), 1);

    host.with(|xhc| {
        assert_eq!(xhc.portsc_state(1) & PortSc::PED.raw(), 0);
    });
}

#[test]
fn test_rw1c_acknowledgements_do_not_disturb_other_bits() {
    let mut port = FakePortConfig::connected(1, USB2_HIGH_SPEED);
    port.sticky_bits = PortSc::OCC.raw();
    let config = FakeXhcConfig {
        connected: vec![port],
        ..FakeXhcConfig::default()
    };
    let host = FakeHost::new(config);
    let mut controller = init(&host);

    host.with(|xhc| xhc.set_status_bits(UsbSts::HSE.bits()));

    assert_eq!(controller.setup_connected_devices(), 1);
    host.settle();

    host.with(|xhc| {
        assert_ne!(
            xhc.status() & UsbSts::HSE.bits(),
            0,
            "HSE survived every EINT acknowledgement"
        );
        assert_eq!(
            xhc.status() & UsbSts::EINT.bits(),
            0,
            "EINT was acknowledged"
        );
        assert_ne!(
            xhc.portsc_state(1) & PortSc::OCC.raw(),
            0,
            "OCC survived the CSC acknowledgements"
        );
        assert!(xhc.interrupt_enable(), "IMAN.IE survived IP acknowledgement");
        assert!(!xhc.interrupt_pending());
    });
}

#[test]
fn test_slot_exhaustion_aborts_device_only() {
    let config = FakeXhcConfig {
        first_slot: 33, // beyond MaxSlots, Enable Slot fails
        connected: vec![FakePortConfig::connected(1, USB2_HIGH_SPEED)],
        ..FakeXhcConfig::default()
    };
    let host = FakeHost::new(config);
    let mut controller = init(&host);

    assert_eq!(controller.setup_connected_devices(), 0);
    assert!(controller.device(NonZeroU8::new(1).unwrap()).is_none());
}
