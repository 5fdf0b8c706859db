use bitflags::bitflags;
use core::fmt;
use core::fmt::{Debug, Formatter};
use volatile::VolatileFieldAccess;
use volatile::access::{NoAccess, ReadOnly, ReadWrite};

/// # Host Controller Operational Registers
///
/// Located at capability base + CAPLENGTH. The port register sets follow at
/// offset 0x400, 0x10 apart; they are not part of this struct because their
/// count is discovered at runtime.
///
/// | Offset | Mnemonic |
/// |--------|----------|
/// | 00h | USBCMD |
/// | 04h | USBSTS |
/// | 08h | PAGESIZE |
/// | 14h | DNCTRL |
/// | 18h | CRCR |
/// | 30h | DCBAAP |
/// | 38h | CONFIG |
///
/// [USB xHCI spec](https://www.intel.com/content/dam/www/public/us/en/documents/technical-specifications/extensible-host-controler-interface-usb-xhci.pdf#page=391)
#[repr(C)]
#[derive(Debug, Copy, Clone, VolatileFieldAccess)]
pub struct Operational {
    #[access(ReadWrite)]
    pub usbcmd: UsbCmd,
    #[access(ReadWrite)]
    pub usbsts: UsbSts,
    #[access(ReadOnly)]
    pub pagesize: Pagesize,
    #[access(NoAccess)]
    _rsvd0: [u32; 2],
    #[access(ReadWrite)]
    pub dnctrl: u32,
    #[access(ReadWrite)]
    pub crcr: u64,
    #[access(NoAccess)]
    _rsvd1: [u32; 4],
    #[access(ReadWrite)]
    pub dcbaap: u64,
    #[access(ReadWrite)]
    pub config: u32,
}

/// CRCR bit 0: the consumer cycle state the controller starts the command
/// ring with.
pub const CRCR_RING_CYCLE_STATE: u64 = 1 << 0;

bitflags! {
    /// # USB Command Register
    ///
    /// [USB xHCI spec](https://www.intel.com/content/dam/www/public/us/en/documents/technical-specifications/extensible-host-controler-interface-usb-xhci.pdf#page=393)
    #[repr(transparent)]
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct UsbCmd: u32 {
        /// Run/Stop - RW. The controller halts (USBSTS.HCH) after this is
        /// cleared.
        const RS = 1 << 0;

        /// Host Controller Reset - RW. Set to reset; cleared by the
        /// controller when the reset process completes. No operational or
        /// runtime register may be written while this reads 1.
        const HCRST = 1 << 1;

        /// Interrupter Enable - RW
        const INTE = 1 << 2;

        /// Host System Error Enable - RW
        const HSEE = 1 << 3;

        /// Light Host Controller Reset - RO or RW
        const LHCRST = 1 << 7;

        /// Controller Save State - RW
        const CSS = 1 << 8;

        /// Controller Restore State - RW
        const CRS = 1 << 9;

        /// Enable Wrap Event - RW
        const EWE = 1 << 10;

        /// Enable U3 MFINDEX Stop - RW
        const EU3S = 1 << 11;
    }
}

bitflags! {
    /// # USB Status Register
    ///
    /// Software clears a bit by writing 1 to it (RW1C); never write back a
    /// value read from this register.
    ///
    /// [USB xHCI spec](https://www.intel.com/content/dam/www/public/us/en/documents/technical-specifications/extensible-host-controler-interface-usb-xhci.pdf#page=397)
    #[repr(transparent)]
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct UsbSts: u32 {
        /// HCHalted - RO. Set once the controller has stopped executing
        /// after R/S was cleared.
        const HCH = 1 << 0;

        /// Host System Error - RW1C
        const HSE = 1 << 2;

        /// Event Interrupt - RW1C. Set when any interrupter's IP bit
        /// transitions to 1.
        const EINT = 1 << 3;

        /// Port Change Detect - RW1C
        const PCD = 1 << 4;

        /// Save State Status - RO
        const SSS = 1 << 8;

        /// Restore State Status - RO
        const RSS = 1 << 9;

        /// Save/Restore Error - RW1C
        const SRE = 1 << 10;

        /// Controller Not Ready - RO. No doorbell or operational register
        /// other than USBSTS may be written while this reads 1.
        const CNR = 1 << 11;

        /// Host Controller Error - RO
        const HCE = 1 << 12;
    }
}

/// # Page Size - RO
///
/// The controller supports a page size of 2^(n+12) if bit n is set.
///
/// [USB xHCI spec](https://www.intel.com/content/dam/www/public/us/en/documents/technical-specifications/extensible-host-controler-interface-usb-xhci.pdf#page=399)
#[repr(transparent)]
#[derive(Copy, Clone)]
pub struct Pagesize(u32);

impl Pagesize {
    pub fn size_raw(&self) -> u32 {
        self.0 & ((1 << 16) - 1)
    }

    /// The smallest supported page size in bytes.
    pub fn size(&self) -> u64 {
        1 << (self.size_raw().trailing_zeros() + 12)
    }
}

impl Debug for Pagesize {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pagesize")
            .field("size", &self.size())
            .finish()
    }
}
