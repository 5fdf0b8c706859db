//! xHCI host controller driver core.
//!
//! Brings a controller from PCI discovery to the first fetched device
//! descriptor: MMIO register windows, the DMA-resident ring and context
//! structures shared with the hardware, controller and port state machines,
//! and poll-based event reaping. The host kernel supplies memory and time
//! services through the [`xhci_memapi`] traits and calls [`Xhci::init`].
//!
//! [USB xHCI spec](https://www.intel.com/content/dam/www/public/us/en/documents/technical-specifications/extensible-host-controler-interface-usb-xhci.pdf)

#![no_std]
extern crate alloc;

use core::fmt::Display;
use x86_64::PhysAddr;

pub use context::*;
pub use controller::Xhci;
pub use device::*;
pub use dma::*;
pub use error::XhciError;
pub use event::*;
pub use extended::*;
pub use operational::*;
pub use portsc::*;
pub use registers::*;
pub use ring::*;
pub use runtime::*;
pub use trb::*;

mod context;
mod controller;
mod device;
mod dma;
mod error;
mod event;
mod extended;
mod operational;
mod port;
mod portsc;
mod registers;
mod ring;
mod runtime;
pub mod testing;
mod trb;

/// The description of a pci address consisting of bus, device and function.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PciAddress {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciAddress {
    pub fn new(bus: u8, device: u8, function: u8) -> Self {
        Self {
            bus,
            device,
            function,
        }
    }
}

impl Display for PciAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}.{:01x}",
            self.bus, self.device, self.function
        )
    }
}

/// What the PCI layer hands the driver after enumeration: where the device
/// sits, where its register window lives, and its MSI-X capability pointer
/// if it has one (unused while the core is poll-driven).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PciDeviceInfo {
    pub address: PciAddress,
    pub bar: PhysAddr,
    pub msix_capability: Option<u8>,
}
