//! Extended capability list walker.
//!
//! The list starts at capability base + HCCPARAMS1.xECP * 4; each node's
//! next pointer is an 8-bit offset in 4-byte units relative to the node
//! itself, 0 terminating the list.

use crate::registers::{CapabilitiesVolatileFieldAccess, Registers};
use alloc::vec::Vec;
use bitfield::bitfield;
use x86_64::VirtAddr;

bitfield! {
    /// First dword of every extended capability node.
    #[repr(transparent)]
    #[derive(Copy, Clone)]
    pub struct ExtendedCapabilityHeader(u32);
    impl Debug;

    pub u8, id, _: 7, 0;
    pub u8, next_raw, _: 15, 8;
    pub u16, capability_specific, _: 31, 16;
}

pub const CAP_ID_USB_LEGACY_SUPPORT: u8 = 1;
pub const CAP_ID_SUPPORTED_PROTOCOL: u8 = 2;

bitfield! {
    /// Third dword of a Supported Protocol capability.
    #[repr(transparent)]
    #[derive(Copy, Clone)]
    struct SupportedProtocolPorts(u32);
    impl Debug;

    u8, compatible_port_offset, _: 7, 0;
    u8, compatible_port_count, _: 15, 8;
}

/// Decoded xHCI Supported Protocol capability.
///
/// [USB xHCI spec](https://www.intel.com/content/dam/www/public/us/en/documents/technical-specifications/extensible-host-controler-interface-usb-xhci.pdf#page=556)
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SupportedProtocol {
    pub revision_major: u8,
    pub revision_minor: u8,
    /// 1-based number of the first port this capability describes.
    pub compatible_port_offset: u8,
    pub compatible_port_count: u8,
}

impl SupportedProtocol {
    /// # Safety
    ///
    /// `node` must point at a Supported Protocol extended capability inside
    /// a mapped MMIO window.
    pub unsafe fn read(node: VirtAddr) -> SupportedProtocol {
        let header = unsafe { core::ptr::read_volatile(node.as_ptr::<u32>()) };
        let ports = unsafe { core::ptr::read_volatile((node + 8u64).as_ptr::<u32>()) };
        let ports = SupportedProtocolPorts(ports);

        SupportedProtocol {
            revision_major: (header >> 24) as u8,
            revision_minor: (header >> 16) as u8,
            compatible_port_offset: ports.compatible_port_offset(),
            compatible_port_count: ports.compatible_port_count(),
        }
    }
}

impl Registers {
    pub fn extended_capabilities(&self) -> ExtendedCapabilitiesIter<'_> {
        let xecp = self.capabilities().hccparams1().read().xecp();
        ExtendedCapabilitiesIter {
            _regs: self,
            next: (xecp != 0).then(|| self.base() + (u64::from(xecp) << 2)),
        }
    }
}

pub struct ExtendedCapabilitiesIter<'a> {
    _regs: &'a Registers,
    next: Option<VirtAddr>,
}

impl Iterator for ExtendedCapabilitiesIter<'_> {
    type Item = (VirtAddr, ExtendedCapabilityHeader);

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.next.take()?;
        let header =
            ExtendedCapabilityHeader(unsafe { core::ptr::read_volatile(node.as_ptr::<u32>()) });
        if header.next_raw() != 0 {
            self.next = Some(node + (u64::from(header.next_raw()) << 2));
        }
        Some((node, header))
    }
}

/// The set of 1-based port numbers governed by a major revision 3 Supported
/// Protocol capability.
pub(crate) fn identify_usb3_ports(regs: &Registers) -> Vec<u8> {
    let mut ports = Vec::new();
    for (node, header) in regs.extended_capabilities() {
        if header.id() != CAP_ID_SUPPORTED_PROTOCOL {
            continue;
        }
        let protocol = unsafe { SupportedProtocol::read(node) };
        log::debug!(
            "supported protocol: USB {}.{}, ports {}..={}",
            protocol.revision_major,
            protocol.revision_minor,
            protocol.compatible_port_offset,
            protocol.compatible_port_offset + protocol.compatible_port_count.saturating_sub(1),
        );
        if protocol.revision_major == 3 {
            for i in 0..protocol.compatible_port_count {
                ports.push(protocol.compatible_port_offset + i);
            }
        }
    }
    ports
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_walk_and_classify() {
        // Capability block with xECP pointing at a two-node list:
        // USB2 covering ports 1..=2, then USB3 covering ports 3..=4.
        let mut mmio = vec![0u32; 0x1000 / 4];
        mmio[0] = 0x20; // caplength
        mmio[4] = 0x10 << 16; // hccparams1: xecp = 0x10 dwords = offset 0x40

        let node0 = 0x40 / 4;
        mmio[node0] = 2 << 24 | 4 << 8 | u32::from(CAP_ID_SUPPORTED_PROTOCOL);
        mmio[node0 + 2] = 2 << 8 | 1;

        let node1 = node0 + 4; // next_raw = 4 dwords
        mmio[node1] = 3 << 24 | 0x10 << 16 | u32::from(CAP_ID_SUPPORTED_PROTOCOL);
        mmio[node1 + 2] = 2 << 8 | 3;

        let base = VirtAddr::new(mmio.as_ptr() as u64);
        let regs = unsafe { Registers::new(base) };

        let nodes: Vec<_> = regs.extended_capabilities().collect();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].1.id(), CAP_ID_SUPPORTED_PROTOCOL);

        let usb2 = unsafe { SupportedProtocol::read(nodes[0].0) };
        assert_eq!(usb2.revision_major, 2);
        assert_eq!(usb2.compatible_port_offset, 1);
        assert_eq!(usb2.compatible_port_count, 2);

        let usb3 = unsafe { SupportedProtocol::read(nodes[1].0) };
        assert_eq!(usb3.revision_major, 3);
        assert_eq!(usb3.revision_minor, 0x10);

        assert_eq!(identify_usb3_ports(&regs), vec![3, 4]);
    }
}
