//! The event ring: the consumer side of the TRB protocol, described to the
//! controller by the Event Ring Segment Table.

use crate::dma::{
    DmaAllocator, DmaBuf, ERST_ALIGNMENT, ERST_BOUNDARY, RING_SEGMENT_ALIGNMENT,
    RING_SEGMENT_BOUNDARY,
};
use crate::error::XhciError;
use crate::runtime::*;
use crate::trb::{TRB_SIZE, Trb};
use alloc::vec::Vec;
use core::sync::atomic::{Ordering, fence};
use volatile::VolatilePtr;
use x86_64::PhysAddr;
use xhci_memapi::MemoryApi;

pub const EVENT_RING_SEGMENT_COUNT: usize = 1;
pub const EVENT_RING_TRB_COUNT: usize = 256;

/// Event Ring Segment Table entry.
///
/// [USB xHCI spec](https://www.intel.com/content/dam/www/public/us/en/documents/technical-specifications/extensible-host-controler-interface-usb-xhci.pdf#page=515)
#[repr(C)]
#[derive(Debug, Copy, Clone)]
struct ErstEntry {
    base: u64,
    size: u32,
    _rsvd: u32,
}

/// The consumer ring. A TRB at the dequeue position belongs to software iff
/// its cycle bit equals the consumer cycle state; the state toggles when the
/// dequeue position wraps past the last segment of the table.
#[derive(Debug)]
pub struct EventRing {
    segments: Vec<DmaBuf>,
    erst: DmaBuf,
    segment_trb_count: usize,
    dequeue_segment: usize,
    dequeue_index: usize,
    cycle: bool,
}

impl EventRing {
    pub fn new<M: MemoryApi>(
        dma: &mut DmaAllocator,
        mem: &mut M,
        segment_count: usize,
        segment_trb_count: usize,
    ) -> Result<EventRing, XhciError> {
        debug_assert!(segment_count >= 1);

        let mut segments = Vec::with_capacity(segment_count);
        for _ in 0..segment_count {
            segments.push(dma.alloc(
                mem,
                segment_trb_count * TRB_SIZE,
                RING_SEGMENT_ALIGNMENT,
                RING_SEGMENT_BOUNDARY,
            )?);
        }

        let erst = dma.alloc(
            mem,
            segment_count * core::mem::size_of::<ErstEntry>(),
            ERST_ALIGNMENT,
            ERST_BOUNDARY,
        )?;
        for (i, segment) in segments.iter().enumerate() {
            let entry = ErstEntry {
                base: segment.phys().as_u64(),
                size: segment_trb_count as u32,
                _rsvd: 0,
            };
            unsafe { erst.as_mut_ptr::<ErstEntry>().add(i).write_volatile(entry) };
        }

        Ok(EventRing {
            segments,
            erst,
            segment_trb_count,
            dequeue_segment: 0,
            dequeue_index: 0,
            cycle: true,
        })
    }

    /// Programs the interrupter's ERSTSZ, ERDP and ERSTBA registers for this
    /// ring. Writing ERSTBA last arms the interrupter.
    pub fn install(&self, interrupter: VolatilePtr<'_, InterrupterRegs>) {
        interrupter.erstsz().write(self.segments.len() as u32);
        interrupter.erdp().write(self.dequeue_pointer().as_u64());
        interrupter.erstba().write(self.erst.phys().as_u64());
    }

    pub fn erst_phys(&self) -> PhysAddr {
        self.erst.phys()
    }

    /// Physical address of the current dequeue position, as written to ERDP.
    pub fn dequeue_pointer(&self) -> PhysAddr {
        self.segments[self.dequeue_segment].phys() + (self.dequeue_index * TRB_SIZE) as u64
    }

    fn current(&self) -> Trb {
        let segment = &self.segments[self.dequeue_segment];
        unsafe {
            segment
                .as_ptr::<Trb>()
                .add(self.dequeue_index)
                .read_volatile()
        }
    }

    fn advance(&mut self) {
        self.dequeue_index += 1;
        if self.dequeue_index == self.segment_trb_count {
            self.dequeue_index = 0;
            self.dequeue_segment += 1;
            if self.dequeue_segment == self.segments.len() {
                self.dequeue_segment = 0;
                self.cycle = !self.cycle;
            }
        }
    }

    pub fn has_unprocessed_events(&self) -> bool {
        self.current().cycle() == self.cycle
    }

    /// Drains every event the controller has published, in ERST order, into
    /// `out`. The caller acknowledges the batch by writing the new dequeue
    /// pointer (with the busy flag) afterwards.
    pub fn dequeue_events(&mut self, out: &mut Vec<Trb>) {
        fence(Ordering::Acquire);
        while self.has_unprocessed_events() {
            out.push(self.current());
            self.advance();
        }
    }

    /// Advances over everything currently published without acting on it.
    /// Used to discard the spurious port change events after the initial
    /// port reset pass. Returns how many events were discarded.
    pub fn flush_unprocessed_events(&mut self) -> usize {
        fence(Ordering::Acquire);
        let mut flushed = 0;
        while self.has_unprocessed_events() {
            self.advance();
            flushed += 1;
        }
        flushed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeMemory;
    use crate::trb::CompletionCode;

    /// Writes `trb` into the ring the way the controller would, tracking the
    /// producer side's position and cycle across the whole table.
    struct FakeProducer {
        segment: usize,
        index: usize,
        cycle: bool,
    }

    impl FakeProducer {
        fn new() -> FakeProducer {
            FakeProducer {
                segment: 0,
                index: 0,
                cycle: true,
            }
        }

        fn push(&mut self, ring: &EventRing, mut trb: Trb) {
            trb.set_cycle(self.cycle);
            let segment = &ring.segments[self.segment];
            unsafe { segment.as_mut_ptr::<Trb>().add(self.index).write_volatile(trb) };
            self.index += 1;
            if self.index == ring.segment_trb_count {
                self.index = 0;
                self.segment += 1;
                if self.segment == ring.segments.len() {
                    self.segment = 0;
                    self.cycle = !self.cycle;
                }
            }
        }
    }

    fn event(tag: u64) -> Trb {
        Trb::transfer_event(tag, CompletionCode::Success, 1, 1, 0, false)
    }

    #[test]
    fn test_dequeue_preserves_order_across_segments() {
        let mut mem = FakeMemory::new();
        let mut dma = DmaAllocator::new();
        let mut ring = EventRing::new(&mut dma, &mut mem, 2, 4).unwrap();
        let mut producer = FakeProducer::new();

        assert!(!ring.has_unprocessed_events());

        // Six events span both segments.
        for tag in 0..6 {
            producer.push(&ring, event(tag));
        }

        let mut out = Vec::new();
        ring.dequeue_events(&mut out);
        assert_eq!(out.len(), 6);
        for (i, trb) in out.iter().enumerate() {
            assert_eq!(trb.parameter, i as u64);
        }
        assert!(!ring.has_unprocessed_events());
    }

    #[test]
    fn test_cycle_toggles_on_table_wrap() {
        let mut mem = FakeMemory::new();
        let mut dma = DmaAllocator::new();
        let mut ring = EventRing::new(&mut dma, &mut mem, 1, 4).unwrap();
        let mut producer = FakeProducer::new();

        let mut out = Vec::new();
        // Two full laps: the second lap is published with the cycle bit
        // inverted and must still be consumed.
        for lap in 0..2 {
            for tag in 0..4 {
                producer.push(&ring, event(lap * 10 + tag));
            }
            ring.dequeue_events(&mut out);
        }

        assert_eq!(out.len(), 8);
        assert_eq!(out[4].parameter, 10);
        assert!(!ring.has_unprocessed_events());

        // Stale TRBs from the previous lap are not owned by the consumer.
        producer.push(&ring, event(99));
        assert!(ring.has_unprocessed_events());
        out.clear();
        ring.dequeue_events(&mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].parameter, 99);
    }

    #[test]
    fn test_flush_discards_without_reporting() {
        let mut mem = FakeMemory::new();
        let mut dma = DmaAllocator::new();
        let mut ring = EventRing::new(&mut dma, &mut mem, 1, 8).unwrap();
        let mut producer = FakeProducer::new();

        for tag in 0..3 {
            producer.push(&ring, event(tag));
        }
        assert_eq!(ring.flush_unprocessed_events(), 3);
        assert!(!ring.has_unprocessed_events());

        let expected = ring.segments[0].phys() + (3 * TRB_SIZE) as u64;
        assert_eq!(ring.dequeue_pointer(), expected);
    }

    #[test]
    fn test_erst_entries_describe_segments() {
        let mut mem = FakeMemory::new();
        let mut dma = DmaAllocator::new();
        let ring = EventRing::new(&mut dma, &mut mem, 2, 16).unwrap();

        for i in 0..2 {
            let entry = unsafe { ring.erst.as_ptr::<ErstEntry>().add(i).read_volatile() };
            assert_eq!(entry.base, ring.segments[i].phys().as_u64());
            assert_eq!(entry.size, 16);
        }
    }
}
