//! Producer rings: the command ring and the per-endpoint transfer rings.
//!
//! The cycle bit is the ownership token. A TRB belongs to the controller
//! once its cycle bit equals the producer cycle state, so the body of a TRB
//! is written with the inverted cycle bit first and the final cycle-bit
//! store publishes it behind a release fence.

use crate::dma::{DmaAllocator, RING_SEGMENT_ALIGNMENT, RING_SEGMENT_BOUNDARY, DmaBuf};
use crate::error::XhciError;
use crate::trb::{TRB_SIZE, Trb};
use core::sync::atomic::{Ordering, fence};
use x86_64::PhysAddr;
use xhci_memapi::MemoryApi;

pub const COMMAND_RING_TRB_COUNT: usize = 256;
pub const TRANSFER_RING_TRB_COUNT: usize = 256;

/// A single-segment producer ring whose last slot is reserved for the Link
/// TRB back to the base.
#[derive(Debug)]
pub struct ProducerRing {
    trbs: DmaBuf,
    capacity: usize,
    enqueue_index: usize,
    cycle: bool,
}

impl ProducerRing {
    pub fn new<M: MemoryApi>(
        dma: &mut DmaAllocator,
        mem: &mut M,
        capacity: usize,
    ) -> Result<ProducerRing, XhciError> {
        debug_assert!(capacity >= 2 && capacity.is_power_of_two());
        let trbs = dma.alloc(
            mem,
            capacity * TRB_SIZE,
            RING_SEGMENT_ALIGNMENT,
            RING_SEGMENT_BOUNDARY,
        )?;
        Ok(ProducerRing {
            trbs,
            capacity,
            enqueue_index: 0,
            cycle: true,
        })
    }

    pub fn base(&self) -> PhysAddr {
        self.trbs.phys()
    }

    /// The current producer cycle state. Mirrored into CRCR.RCS and the
    /// endpoint context's DCS field.
    pub fn cycle(&self) -> bool {
        self.cycle
    }

    pub fn enqueue_index(&self) -> usize {
        self.enqueue_index
    }

    /// Hands `trb` to the controller and returns the physical address of
    /// the slot it landed in (the address completion events refer to).
    pub fn enqueue(&mut self, trb: Trb) -> PhysAddr {
        if self.enqueue_index == self.capacity - 1 {
            let link = Trb::link(self.base(), true);
            self.publish(self.enqueue_index, link);
            self.cycle = !self.cycle;
            self.enqueue_index = 0;
        }

        let slot = self.publish(self.enqueue_index, trb);
        self.enqueue_index += 1;
        slot
    }

    fn publish(&mut self, index: usize, mut trb: Trb) -> PhysAddr {
        let base = unsafe { self.trbs.as_mut_ptr::<u8>().add(index * TRB_SIZE) };

        // Keep the slot owned by software while the body is written.
        trb.set_cycle(!self.cycle);
        unsafe {
            (base as *mut u64).write_volatile(trb.parameter);
            (base.add(8) as *mut u32).write_volatile(trb.status);
            (base.add(12) as *mut u32).write_volatile(trb.control);
        }

        fence(Ordering::Release);
        trb.set_cycle(self.cycle);
        unsafe { (base.add(12) as *mut u32).write_volatile(trb.control) };

        self.base() + (index * TRB_SIZE) as u64
    }

    #[cfg(test)]
    pub(crate) fn read_slot(&self, index: usize) -> Trb {
        unsafe { self.trbs.as_ptr::<Trb>().add(index).read_volatile() }
    }
}

/// The controller's single command ring.
#[derive(Debug)]
pub struct CommandRing {
    ring: ProducerRing,
}

impl CommandRing {
    pub fn new<M: MemoryApi>(
        dma: &mut DmaAllocator,
        mem: &mut M,
    ) -> Result<CommandRing, XhciError> {
        Ok(CommandRing {
            ring: ProducerRing::new(dma, mem, COMMAND_RING_TRB_COUNT)?,
        })
    }

    pub fn enqueue(&mut self, trb: Trb) -> PhysAddr {
        self.ring.enqueue(trb)
    }

    pub fn base(&self) -> PhysAddr {
        self.ring.base()
    }

    pub fn cycle(&self) -> bool {
        self.ring.cycle()
    }
}

/// A transfer ring plus the doorbell coordinates it is reached through.
#[derive(Debug)]
pub struct TransferRing {
    ring: ProducerRing,
    dci: u8,
}

impl TransferRing {
    pub fn new<M: MemoryApi>(
        dma: &mut DmaAllocator,
        mem: &mut M,
        dci: u8,
    ) -> Result<TransferRing, XhciError> {
        Ok(TransferRing {
            ring: ProducerRing::new(dma, mem, TRANSFER_RING_TRB_COUNT)?,
            dci,
        })
    }

    pub fn enqueue(&mut self, trb: Trb) -> PhysAddr {
        self.ring.enqueue(trb)
    }

    pub fn base(&self) -> PhysAddr {
        self.ring.base()
    }

    pub fn cycle(&self) -> bool {
        self.ring.cycle()
    }

    /// The Device Context Index the doorbell is rung with.
    pub fn dci(&self) -> u8 {
        self.dci
    }
}
