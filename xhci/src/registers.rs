//! xHCI capability register definitions and the handle tying the five
//! register windows together.
//!
//! [USB xHCI spec](https://www.intel.com/content/dam/www/public/us/en/documents/technical-specifications/extensible-host-controler-interface-usb-xhci.pdf#page=380)

use crate::operational::Operational;
use crate::portsc::PortSc;
use crate::runtime::InterrupterRegs;
use bitfield::bitfield;
use core::num::NonZeroU8;
use core::ptr::NonNull;
use volatile::access::{NoAccess, ReadOnly};
use volatile::{VolatileFieldAccess, VolatilePtr};
use x86_64::VirtAddr;

/// The read-only capability register block at the start of the MMIO window.
#[repr(C)]
#[derive(Debug, Copy, Clone, VolatileFieldAccess)]
pub struct Capabilities {
    /// Offset to add to the base to find the operational registers.
    #[access(ReadOnly)]
    pub caplength: u8,
    #[access(NoAccess)]
    _rsvd: u8,
    /// BCD encoding of the supported xHCI revision, e.g. 0x0110 for 1.1.0.
    #[access(ReadOnly)]
    pub hciversion: u16,
    #[access(ReadOnly)]
    pub hcsparams1: HcsParams1,
    #[access(ReadOnly)]
    pub hcsparams2: HcsParams2,
    #[access(ReadOnly)]
    pub hcsparams3: HcsParams3,
    #[access(ReadOnly)]
    pub hccparams1: HccParams1,
    /// Byte offset of the doorbell array from the base; bits 1:0 are
    /// reserved.
    #[access(ReadOnly)]
    pub dboff: u32,
    /// Byte offset of the runtime registers from the base; bits 4:0 are
    /// reserved.
    #[access(ReadOnly)]
    pub rtsoff: u32,
}

bitfield! {
    /// # Structural Parameters 1
    ///
    /// [USB xHCI spec](https://www.intel.com/content/dam/www/public/us/en/documents/technical-specifications/extensible-host-controler-interface-usb-xhci.pdf#page=382)
    #[repr(transparent)]
    #[derive(Copy, Clone)]
    pub struct HcsParams1(u32);
    impl Debug;

    pub u8, max_device_slots, _: 7, 0;
    pub u16, max_interrupters, _: 18, 8;
    pub u8, max_ports, _: 31, 24;
}

bitfield! {
    /// # Structural Parameters 2
    ///
    /// [USB xHCI spec](https://www.intel.com/content/dam/www/public/us/en/documents/technical-specifications/extensible-host-controler-interface-usb-xhci.pdf#page=383)
    #[repr(transparent)]
    #[derive(Copy, Clone)]
    pub struct HcsParams2(u32);
    impl Debug;

    /// Isochronous scheduling threshold
    pub u8, ist, _: 3, 0;
    /// log2 of the maximum number of event ring segment table entries
    pub u8, erst_max, _: 7, 4;
    pub u8, max_scratchpad_bufs_hi, _: 25, 21;
    pub bool, scratchpad_restore, _: 26;
    pub u8, max_scratchpad_bufs_lo, _: 31, 27;
}

impl HcsParams2 {
    /// Number of scratchpad buffers software must reserve for the
    /// controller.
    pub fn max_scratchpad_bufs(&self) -> u16 {
        u16::from(self.max_scratchpad_bufs_hi()) << 5 | u16::from(self.max_scratchpad_bufs_lo())
    }
}

bitfield! {
    /// # Structural Parameters 3
    ///
    /// [USB xHCI spec](https://www.intel.com/content/dam/www/public/us/en/documents/technical-specifications/extensible-host-controler-interface-usb-xhci.pdf#page=384)
    #[repr(transparent)]
    #[derive(Copy, Clone)]
    pub struct HcsParams3(u32);
    impl Debug;

    pub u8, u1_device_exit_latency, _: 7, 0;
    pub u16, u2_device_exit_latency, _: 31, 16;
}

bitfield! {
    /// # Capability Parameters 1
    ///
    /// [USB xHCI spec](https://www.intel.com/content/dam/www/public/us/en/documents/technical-specifications/extensible-host-controler-interface-usb-xhci.pdf#page=385)
    #[repr(transparent)]
    #[derive(Copy, Clone)]
    pub struct HccParams1(u32);
    impl Debug;

    /// 64-bit addressing capability
    pub bool, ac64, _: 0;
    /// Bandwidth negotiation capability
    pub bool, bnc, _: 1;
    /// Context size: set means 64-byte context entries, clear means 32-byte.
    pub bool, csz, _: 2;
    /// Port power control
    pub bool, ppc, _: 3;
    /// Port indicators
    pub bool, pind, _: 4;
    /// Light HC reset capability
    pub bool, lhrc, _: 5;
    pub u8, max_psa_size, _: 15, 12;
    /// Offset of the first extended capability, in 32-bit words from the
    /// base. Zero means there are none.
    pub u16, xecp, _: 31, 16;
}

/// Typed views onto the five register windows of one controller, derived
/// from the MMIO base once at construction.
#[derive(Debug, Copy, Clone)]
pub struct Registers {
    base: VirtAddr,
    operational_base: VirtAddr,
    runtime_base: VirtAddr,
    doorbell_base: VirtAddr,
}

impl Registers {
    /// # Safety
    ///
    /// `base` must be the virtual base of a mapped xHCI MMIO window that
    /// stays mapped for the lifetime of the returned value.
    pub unsafe fn new(base: VirtAddr) -> Registers {
        let capabilities =
            unsafe { VolatilePtr::new(NonNull::new(base.as_mut_ptr::<Capabilities>()).unwrap()) };
        let caplength = capabilities.caplength().read();
        let dboff = capabilities.dboff().read() & !0x3;
        let rtsoff = capabilities.rtsoff().read() & !0x1f;

        Registers {
            base,
            operational_base: base + u64::from(caplength),
            runtime_base: base + u64::from(rtsoff),
            doorbell_base: base + u64::from(dboff),
        }
    }

    pub fn base(&self) -> VirtAddr {
        self.base
    }

    pub fn capabilities(&self) -> VolatilePtr<'_, Capabilities> {
        unsafe { VolatilePtr::new(NonNull::new(self.base.as_mut_ptr::<Capabilities>()).unwrap()) }
    }

    pub fn operational(&self) -> VolatilePtr<'_, Operational> {
        unsafe {
            VolatilePtr::new(NonNull::new(self.operational_base.as_mut_ptr::<Operational>()).unwrap())
        }
    }

    /// The port register set of `port` (1-based, as in port status change
    /// events).
    pub fn portsc(&self, port: NonZeroU8) -> VolatilePtr<'_, PortSc> {
        let addr = self.operational_base + 0x400u64 + 0x10u64 * u64::from(port.get() - 1);
        unsafe { VolatilePtr::new(NonNull::new(addr.as_mut_ptr::<PortSc>()).unwrap()) }
    }

    /// The interrupter register set `index` in the runtime window.
    pub fn interrupter(&self, index: u16) -> VolatilePtr<'_, InterrupterRegs> {
        let addr = self.runtime_base + 0x20u64 + 0x20u64 * u64::from(index);
        unsafe { VolatilePtr::new(NonNull::new(addr.as_mut_ptr::<InterrupterRegs>()).unwrap()) }
    }

    /// Doorbell register `index`: 0 is the command doorbell, 1..=MaxSlots
    /// are the per-slot endpoint doorbells.
    pub fn doorbell(&self, index: u8) -> VolatilePtr<'_, u32> {
        let addr = self.doorbell_base + 4u64 * u64::from(index);
        unsafe { VolatilePtr::new(NonNull::new(addr.as_mut_ptr::<u32>()).unwrap()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_register_window_discovery() {
        let mut mmio = vec![0u32; 0x4000 / 4];
        mmio[0] = 0x0110_0080; // caplength 0x80, hciversion 0x0110
        mmio[1] = 8 << 24 | 4 << 8 | 32; // hcsparams1: 8 ports, 4 interrupters, 32 slots
        mmio[2] = 2 << 27 | 1 << 21 | 3 << 4; // hcsparams2: 2+32 scratchpads, erst max 3
        mmio[4] = 0x40 << 16 | 1 << 2 | 1; // hccparams1: xecp 0x40, csz, ac64
        mmio[5] = 0x3000; // dboff
        mmio[6] = 0x2003; // rtsoff (low bits reserved)

        let base = VirtAddr::new(mmio.as_ptr() as u64);
        let regs = unsafe { Registers::new(base) };

        let caps = regs.capabilities();
        assert_eq!(caps.caplength().read(), 0x80);
        assert_eq!(caps.hciversion().read(), 0x0110);

        let hcs1 = caps.hcsparams1().read();
        assert_eq!(hcs1.max_device_slots(), 32);
        assert_eq!(hcs1.max_interrupters(), 4);
        assert_eq!(hcs1.max_ports(), 8);

        let hcs2 = caps.hcsparams2().read();
        assert_eq!(hcs2.erst_max(), 3);
        assert_eq!(hcs2.max_scratchpad_bufs(), (1 << 5) | 2);

        let hcc1 = caps.hccparams1().read();
        assert!(hcc1.ac64());
        assert!(hcc1.csz());
        assert_eq!(hcc1.xecp(), 0x40);

        assert_eq!(regs.operational().as_raw_ptr().as_ptr() as u64, base.as_u64() + 0x80);
        assert_eq!(
            regs.interrupter(0).as_raw_ptr().as_ptr() as u64,
            base.as_u64() + 0x2000 + 0x20
        );
        assert_eq!(
            regs.interrupter(1).as_raw_ptr().as_ptr() as u64,
            base.as_u64() + 0x2000 + 0x40
        );
        assert_eq!(regs.doorbell(0).as_raw_ptr().as_ptr() as u64, base.as_u64() + 0x3000);
        assert_eq!(regs.doorbell(3).as_raw_ptr().as_ptr() as u64, base.as_u64() + 0x300c);
        assert_eq!(
            regs.portsc(NonZeroU8::new(1).unwrap()).as_raw_ptr().as_ptr() as u64,
            base.as_u64() + 0x80 + 0x400
        );
        assert_eq!(
            regs.portsc(NonZeroU8::new(5).unwrap()).as_raw_ptr().as_ptr() as u64,
            base.as_u64() + 0x80 + 0x400 + 4 * 0x10
        );
    }
}
