//! DMA memory for the controller's rings, contexts and scratchpads.
//!
//! Every structure the controller reads has both an alignment and a
//! boundary it must not cross. The allocator bump-allocates out of
//! physically contiguous page runs obtained from the host and re-places a
//! request past the next boundary when the straightforward spot would cross
//! it.

use crate::error::XhciError;
use alloc::vec::Vec;
use x86_64::{PhysAddr, VirtAddr, align_up};
use xhci_memapi::MemoryApi;

pub const PAGE_SIZE: usize = 4096;

pub const DEVICE_CONTEXT_ALIGNMENT: u64 = 64;
pub const DEVICE_CONTEXT_BOUNDARY: u64 = 4096;
pub const INPUT_CONTEXT_ALIGNMENT: u64 = 64;
pub const INPUT_CONTEXT_BOUNDARY: u64 = 4096;
pub const RING_SEGMENT_ALIGNMENT: u64 = 64;
pub const RING_SEGMENT_BOUNDARY: u64 = 65536;
pub const ERST_ALIGNMENT: u64 = 64;
pub const ERST_BOUNDARY: u64 = 4096;
pub const SCRATCHPAD_ARRAY_ALIGNMENT: u64 = 64;
pub const SCRATCHPAD_ARRAY_BOUNDARY: u64 = 4096;
pub const SCRATCHPAD_BUFFER_ALIGNMENT: u64 = 4096;
pub const SCRATCHPAD_BUFFER_BOUNDARY: u64 = 4096;

/// A DMA-reachable buffer. `virt` is what the driver dereferences, `phys`
/// is what gets published to the controller; both describe the same bytes
/// for the rest of the session.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DmaBuf {
    virt: VirtAddr,
    phys: PhysAddr,
    size: usize,
}

impl DmaBuf {
    pub fn virt(&self) -> VirtAddr {
        self.virt
    }

    pub fn phys(&self) -> PhysAddr {
        self.phys
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn as_ptr<T>(&self) -> *const T {
        self.virt.as_ptr()
    }

    pub fn as_mut_ptr<T>(&self) -> *mut T {
        self.virt.as_mut_ptr()
    }
}

#[derive(Debug)]
struct Chunk {
    virt: VirtAddr,
    phys: PhysAddr,
    size: usize,
    offset: usize,
}

impl Chunk {
    fn try_place(&mut self, size: usize, alignment: u64, boundary: u64) -> Option<DmaBuf> {
        let candidate = self.phys.as_u64() + self.offset as u64;
        let limit = self.phys.as_u64() + self.size as u64;
        let start = place(candidate, limit, size as u64, alignment, boundary)?;

        let chunk_offset = (start - self.phys.as_u64()) as usize;
        self.offset = chunk_offset + size;
        Some(DmaBuf {
            virt: self.virt + chunk_offset as u64,
            phys: PhysAddr::new(start),
            size,
        })
    }
}

/// Places a request of `size` bytes at or after `candidate`, honoring
/// `alignment` and never crossing a multiple of `boundary`, within
/// `[candidate, limit)`.
fn place(candidate: u64, limit: u64, size: u64, alignment: u64, boundary: u64) -> Option<u64> {
    if size == 0 || size > boundary {
        return None;
    }

    let mut start = align_up(candidate, alignment);
    if crosses(start, size, boundary) {
        // Boundaries are multiples of every alignment in use, so the next
        // boundary is itself a valid start.
        start = (start / boundary + 1) * boundary;
    }
    (start.checked_add(size)? <= limit).then_some(start)
}

fn crosses(start: u64, size: u64, boundary: u64) -> bool {
    start / boundary != (start + size - 1) / boundary
}

/// Bump allocator over host-provided DMA page runs. Buffers are owned for
/// the driver session; there is no free path.
#[derive(Debug, Default)]
pub struct DmaAllocator {
    chunks: Vec<Chunk>,
}

impl DmaAllocator {
    pub fn new() -> DmaAllocator {
        DmaAllocator { chunks: Vec::new() }
    }

    pub fn alloc<M: MemoryApi>(
        &mut self,
        mem: &mut M,
        size: usize,
        alignment: u64,
        boundary: u64,
    ) -> Result<DmaBuf, XhciError> {
        if size == 0 || size as u64 > boundary {
            return Err(XhciError::AllocationFailed(size));
        }

        for chunk in &mut self.chunks {
            if let Some(buf) = chunk.try_place(size, alignment, boundary) {
                return Ok(zeroed(buf));
            }
        }

        // A fresh page run is page-aligned, which satisfies the common case
        // directly; fall back to a run with enough slack to skip one
        // boundary.
        let pages = size.div_ceil(PAGE_SIZE);
        if let Some(buf) = self.grow(mem, pages)?.try_place(size, alignment, boundary) {
            return Ok(zeroed(buf));
        }

        let slack = (size as u64 + alignment + boundary) as usize;
        let buf = self
            .grow(mem, slack.div_ceil(PAGE_SIZE))?
            .try_place(size, alignment, boundary)
            .ok_or(XhciError::AllocationFailed(size))?;
        Ok(zeroed(buf))
    }

    fn grow<M: MemoryApi>(&mut self, mem: &mut M, pages: usize) -> Result<&mut Chunk, XhciError> {
        let region = mem
            .alloc_contiguous(pages)
            .ok_or(XhciError::AllocationFailed(pages * PAGE_SIZE))?;
        debug_assert_eq!(mem.virt_to_phys(region.virt), region.phys);

        self.chunks.push(Chunk {
            virt: region.virt,
            phys: region.phys,
            size: region.len(),
            offset: 0,
        });
        Ok(self.chunks.last_mut().unwrap())
    }
}

fn zeroed(buf: DmaBuf) -> DmaBuf {
    unsafe { core::ptr::write_bytes(buf.as_mut_ptr::<u8>(), 0, buf.len()) };
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeMemory;

    #[test]
    fn test_place_respects_alignment() {
        assert_eq!(place(0x1001, 0x2000, 0x10, 64, 4096), Some(0x1040));
        assert_eq!(place(0x1000, 0x2000, 0x10, 64, 4096), Some(0x1000));
    }

    #[test]
    fn test_place_skips_boundary() {
        // 0x1fc0..0x20c0 would cross the 4 KiB line at 0x2000.
        assert_eq!(place(0x1fc0, 0x3000, 0x100, 64, 4096), Some(0x2000));
        // Fits exactly up to the boundary.
        assert_eq!(place(0x1f00, 0x3000, 0x100, 64, 4096), Some(0x1f00));
    }

    #[test]
    fn test_place_rejects_oversized_and_overflow() {
        assert_eq!(place(0x1000, 0x10000, 0x2000, 64, 4096), None);
        assert_eq!(place(0x1fc0, 0x2000, 0x100, 64, 4096), None);
    }

    #[test]
    fn test_allocations_satisfy_contract() {
        let mut mem = FakeMemory::new();
        let mut dma = DmaAllocator::new();

        let cases: &[(usize, u64, u64)] = &[
            (4096, RING_SEGMENT_ALIGNMENT, RING_SEGMENT_BOUNDARY),
            (2112, DEVICE_CONTEXT_ALIGNMENT, DEVICE_CONTEXT_BOUNDARY),
            (16, ERST_ALIGNMENT, ERST_BOUNDARY),
            (4096, SCRATCHPAD_BUFFER_ALIGNMENT, SCRATCHPAD_BUFFER_BOUNDARY),
            (64, SCRATCHPAD_ARRAY_ALIGNMENT, SCRATCHPAD_ARRAY_BOUNDARY),
            (33, 32, 4096),
        ];

        for &(size, alignment, boundary) in cases {
            let buf = dma.alloc(&mut mem, size, alignment, boundary).unwrap();
            assert_eq!(buf.len(), size);
            assert_eq!(buf.phys().as_u64() % alignment, 0, "alignment for {size}");
            assert!(
                !crosses(buf.phys().as_u64(), size as u64, boundary),
                "boundary crossing for {size}"
            );
            // Identity-mapped fake: the buffer must be dereferencable.
            unsafe { buf.as_mut_ptr::<u8>().write(0xa5) };
        }
    }

    #[test]
    fn test_distinct_allocations_do_not_overlap() {
        let mut mem = FakeMemory::new();
        let mut dma = DmaAllocator::new();

        let a = dma.alloc(&mut mem, 256, 64, 4096).unwrap();
        let b = dma.alloc(&mut mem, 256, 64, 4096).unwrap();
        let (a0, a1) = (a.phys().as_u64(), a.phys().as_u64() + 256);
        let (b0, b1) = (b.phys().as_u64(), b.phys().as_u64() + 256);
        assert!(a1 <= b0 || b1 <= a0);
    }

    #[test]
    fn test_zero_sized_allocation_fails() {
        let mut mem = FakeMemory::new();
        let mut dma = DmaAllocator::new();
        assert_eq!(
            dma.alloc(&mut mem, 0, 64, 4096),
            Err(XhciError::AllocationFailed(0))
        );
    }
}
