//! Runtime (interrupter) register sets and doorbell helpers.

use crate::operational::*;
use crate::registers::Registers;
use bitflags::bitflags;
use volatile::VolatileFieldAccess;
use volatile::access::{NoAccess, ReadWrite};
use x86_64::PhysAddr;

/// One interrupter register set, 0x20 bytes, at runtime base + 0x20 * (1 +
/// index).
///
/// [USB xHCI spec](https://www.intel.com/content/dam/www/public/us/en/documents/technical-specifications/extensible-host-controler-interface-usb-xhci.pdf#page=424)
#[repr(C)]
#[derive(Debug, Copy, Clone, VolatileFieldAccess)]
pub struct InterrupterRegs {
    #[access(ReadWrite)]
    pub iman: Iman,
    #[access(ReadWrite)]
    pub imod: u32,
    /// Event Ring Segment Table Size: number of valid ERST entries.
    #[access(ReadWrite)]
    pub erstsz: u32,
    #[access(NoAccess)]
    _rsvd: u32,
    /// Event Ring Segment Table Base Address, 64-byte aligned.
    #[access(ReadWrite)]
    pub erstba: u64,
    /// Event Ring Dequeue Pointer plus the DESI/EHB low bits.
    #[access(ReadWrite)]
    pub erdp: u64,
}

/// Event Handler Busy, bit 3 of ERDP. RW1C; written as 1 together with the
/// new dequeue pointer after an event batch has been consumed.
pub const ERDP_EVENT_HANDLER_BUSY: u64 = 1 << 3;

bitflags! {
    /// Interrupter Management register.
    ///
    /// IP is RW1C, so acknowledging must write the register with IP set and
    /// every other bit exactly as read.
    #[repr(transparent)]
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct Iman: u32 {
        /// Interrupt Pending - RW1C
        const IP = 1 << 0;
        /// Interrupt Enable - RW
        const IE = 1 << 1;
    }
}

impl Registers {
    /// Rings the command doorbell (entry 0, target 0).
    pub fn ring_command_doorbell(&self) {
        self.doorbell(0).write(0);
    }

    /// Rings the doorbell of `slot_id` for the endpoint identified by `dci`.
    pub fn ring_endpoint_doorbell(&self, slot_id: u8, dci: u8) {
        self.doorbell(slot_id).write(u32::from(dci));
    }

    /// Clears the interrupt pending flag of `interrupter` and the EINT flag
    /// in USBSTS. Only IP (and the observed IE) is written back; reserved
    /// IMAN bits are written as 0, and USBSTS gets exactly the EINT bit.
    pub fn clear_interrupt_pending(&self, interrupter: u16) {
        let ir = self.interrupter(interrupter);
        let iman = ir.iman().read();
        ir.iman().write((iman & Iman::IE) | Iman::IP);

        self.operational().usbsts().write(UsbSts::EINT);
    }

    /// Publishes the consumer position `dequeue` to the controller.
    pub fn update_event_dequeue(&self, interrupter: u16, dequeue: PhysAddr) {
        self.interrupter(interrupter)
            .erdp()
            .write(dequeue.as_u64() | ERDP_EVENT_HANDLER_BUSY);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupter_register_offsets() {
        assert_eq!(core::mem::offset_of!(InterrupterRegs, iman), 0x00);
        assert_eq!(core::mem::offset_of!(InterrupterRegs, imod), 0x04);
        assert_eq!(core::mem::offset_of!(InterrupterRegs, erstsz), 0x08);
        assert_eq!(core::mem::offset_of!(InterrupterRegs, erstba), 0x10);
        assert_eq!(core::mem::offset_of!(InterrupterRegs, erdp), 0x18);
        assert_eq!(core::mem::size_of::<InterrupterRegs>(), 0x20);
    }
}
