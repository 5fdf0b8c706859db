//! Root hub port reset.
//!
//! USB2 and USB3 ports reset differently: USB2 ports use PR and complete
//! with PRC, USB3 ports use the warm reset pair WPR/WRC. Port failures are
//! reported, never fatal.

use crate::error::XhciError;
use crate::portsc::PortSc;
use crate::registers::Registers;
use core::num::NonZeroU8;
use xhci_memapi::TimeApi;

const PORT_POWER_SETTLE_MS: u64 = 20;
const PORT_RESET_TIMEOUT_MS: u64 = 100;
const PORT_RESET_SETTLE_MS: u64 = 3;

pub(crate) fn reset_port<T: TimeApi>(
    regs: &Registers,
    time: &mut T,
    port: NonZeroU8,
    usb3: bool,
) -> Result<(), XhciError> {
    let portsc = regs.portsc(port);
    let mut value = portsc.read();

    if !value.contains(PortSc::PP) {
        let mut on = value.for_update();
        on.set(PortSc::PP, true);
        portsc.write(on);
        time.msleep(PORT_POWER_SETTLE_MS);

        value = portsc.read();
        if !value.contains(PortSc::PP) {
            log::warn!("port {port}: port power did not come up");
            return Err(XhciError::PortResetFailed(port.get()));
        }
    }

    // Acknowledge a pending connect status change up front so the one we
    // look for afterwards is the reset's.
    let mut ack = value.for_update();
    ack.set(PortSc::CSC, true);
    portsc.write(ack);

    // PED is written as 0 (writing 1 would disable the port); for_update
    // already guarantees that.
    let mut reset = value.for_update();
    reset.set(if usb3 { PortSc::WPR } else { PortSc::PR }, true);
    portsc.write(reset);

    let change = if usb3 { PortSc::WRC } else { PortSc::PRC };
    let mut waited = 0;
    loop {
        time.msleep(1);
        if portsc.read().contains(change) {
            break;
        }
        waited += 1;
        if waited >= PORT_RESET_TIMEOUT_MS {
            log::warn!("port {port}: reset change did not assert");
            return Err(XhciError::PortResetFailed(port.get()));
        }
    }

    time.msleep(PORT_RESET_SETTLE_MS);
    let value = portsc.read();
    if !value.contains(PortSc::PED) {
        log::warn!("port {port}: not enabled after reset");
        return Err(XhciError::PortResetFailed(port.get()));
    }

    let mut ack = value.for_update();
    ack.set(PortSc::CSC, true);
    portsc.write(ack);
    Ok(())
}
