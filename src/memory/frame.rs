//! The physical frame allocator (C2): hands out and reclaims 4 KiB physical
//! frames. The core only depends on the [`FrameAllocator`] trait; this
//! bump-allocator-with-free-list is one concrete implementation seeded from
//! the boot-time memory map, in the style of the teacher crate's
//! `BootInfoFrameAllocator`.

use alloc::vec::Vec;

use bootloader::bootinfo::{MemoryMap, MemoryRegionType};
use x86_64::{
    structures::paging::{PhysFrame, Size4KiB},
    PhysAddr,
};

/// Collaborator contract the virtual memory core depends on: hand out a
/// fresh 4 KiB frame, or take one back.
pub trait FrameAllocator {
    /// Returns a free frame, or `None` if physical memory is exhausted.
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>>;

    /// Returns a frame to the pool. The caller must not use the frame again.
    fn free_frame(&mut self, frame: PhysFrame<Size4KiB>);
}

/// A frame allocator that returns usable frames from the bootloader's memory
/// map, preferring previously freed frames before advancing the bump cursor.
pub struct BootInfoFrameAllocator {
    memory_map: &'static MemoryMap,
    next: usize,
    freed: Vec<PhysFrame<Size4KiB>>,
}

impl BootInfoFrameAllocator {
    /// Create a `BootInfoFrameAllocator` from the passed memory map.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that the passed memory map is valid and
    /// that its `Usable` regions are not used by anything else.
    #[must_use]
    pub const unsafe fn new(memory_map: &'static MemoryMap) -> Self {
        Self {
            memory_map,
            next: 0,
            freed: Vec::new(),
        }
    }

    fn usable_frames(&self) -> impl Iterator<Item = PhysFrame<Size4KiB>> + '_ {
        let regions = self.memory_map.iter();
        let usable_regions = regions.filter(|r| r.region_type == MemoryRegionType::Usable);
        let addr_ranges = usable_regions.map(|r| r.range.start_addr()..r.range.end_addr());
        let frame_addresses = addr_ranges.flat_map(|r| r.step_by(4096));
        frame_addresses.map(|addr| PhysFrame::containing_address(PhysAddr::new(addr)))
    }
}

impl FrameAllocator for BootInfoFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        if let Some(frame) = self.freed.pop() {
            return Some(frame);
        }
        let frame = self.usable_frames().nth(self.next);
        self.next += 1;
        frame
    }

    fn free_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        self.freed.push(frame);
    }
}

// Blanket impl so `BootInfoFrameAllocator` can still be handed to APIs in the
// wider ecosystem (e.g. `linked_list_allocator`'s bootstrap path) that expect
// the `x86_64` crate's own `FrameAllocator` trait.
// SAFETY: `allocate_frame` only ever returns frames from the usable region
// list, each exactly once (either fresh or previously returned via `free_frame`).
unsafe impl x86_64::structures::paging::FrameAllocator<Size4KiB> for BootInfoFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        FrameAllocator::allocate_frame(self)
    }
}
