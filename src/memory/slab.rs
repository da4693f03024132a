//! The kernel heap slab allocator (C4): object caches over VMM-mapped
//! regions, general-purpose and DMA size-class pools.
//!
//! The original kernel bootstraps a chain of caches (a cache of
//! `ObjectCache` structs, a cache of `Slab` structs, off-slab buffer-node
//! caches, ...) purely to avoid a circular dependency: it has *no* general
//! allocator until the slab allocator exists. This crate already has a
//! working general allocator (`linked_list_allocator`, wired up in
//! [`crate::allocator`]) before the slab heap is brought up, so cache/slab
//! bookkeeping (`Vec`, free-lists) can simply live in that heap; only the
//! object *storage* pages are carved out of VMM-managed virtual memory, as
//! the spec requires. See `DESIGN.md` for the full rationale.

use alloc::vec::Vec;

use x86_64::{PhysAddr, VirtAddr};

use crate::config::{MAX_SIZE_POWER, MIN_SIZE_POWER, NUM_SIZE_CLASSES};

use super::{
    frame::FrameAllocator,
    paging::PageFlags,
    vmm::VirtualMemoryManager,
};

/// Whether a slab's metadata (its free list) lives inside the slab itself or
/// in a separate bookkeeping structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabLayout {
    /// Free list lives at the tail of the slab's own pages.
    OnSlab,
    /// Free list lives in heap-allocated bookkeeping (spec's off-slab buffer nodes).
    OffSlab,
}

/// Errors the slab heap can report (spec.md §4.3/§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// The kernel heap's virtual region has not been mapped yet.
    HeapNotMapped,
    /// Growing a general-purpose size class failed.
    GpCacheError,
    /// Growing a DMA size class failed.
    DmaCacheError,
    /// `allocate` could not satisfy the request from either pool.
    AllocGpOrDmaCacheError,
}

/// One contiguous run of pages carved into `object_count` equal slots.
struct Slab {
    base: VirtAddr,
    object_size: usize,
    object_count: usize,
    allocated_count: usize,
    /// Indices of free slots, used as a stack. On-slab and off-slab layouts
    /// both reduce to "a set of free slot indices" once pages are mapped.
    free: Vec<u32>,
}

impl Slab {
    fn new(base: VirtAddr, object_size: usize, page_count: usize) -> Self {
        let object_count = (page_count * 4096) / object_size;
        let object_count = object_count.min(usize::from(crate::config::MAX_OBJECT_COUNT));
        Self {
            base,
            object_size,
            object_count,
            allocated_count: 0,
            free: (0..u32::try_from(object_count).unwrap_or(0)).rev().collect(),
        }
    }

    fn is_empty_of_objects(&self) -> bool {
        self.allocated_count == 0
    }

    fn is_full(&self) -> bool {
        self.allocated_count == self.object_count
    }

    fn alloc(&mut self) -> Option<VirtAddr> {
        let idx = self.free.pop()?;
        self.allocated_count += 1;
        Some(self.base + u64::from(idx) * self.object_size as u64)
    }

    fn free(&mut self, addr: VirtAddr) -> bool {
        let offset = addr.as_u64().checked_sub(self.base.as_u64());
        let Some(offset) = offset else { return false };
        if offset >= (self.object_count as u64) * self.object_size as u64 {
            return false;
        }
        #[expect(
            clippy::cast_possible_truncation,
            reason = "object_count is bounded by MAX_OBJECT_COUNT (u8::MAX)"
        )]
        let idx = (offset / self.object_size as u64) as u32;
        self.free.push(idx);
        self.allocated_count -= 1;
        true
    }

    fn owns(&self, addr: VirtAddr) -> bool {
        let region_size = (self.object_count as u64) * self.object_size as u64;
        addr.as_u64() >= self.base.as_u64() && addr.as_u64() < self.base.as_u64() + region_size
    }
}

/// An object cache: a pool of fixed-size slots backed by one or more slabs,
/// partitioned into full/partial/empty lists so allocation can always start
/// from the list most likely to have room.
pub struct ObjectCache {
    object_size: usize,
    layout: SlabLayout,
    page_flags: PageFlags,
    full: Vec<Slab>,
    partial: Vec<Slab>,
    empty: Vec<Slab>,
    /// Next free virtual address within this cache's reserved region.
    growth_cursor: VirtAddr,
    region_end: VirtAddr,
}

const PAGE_SIZE: u64 = 4096;

impl ObjectCache {
    fn new(object_size: usize, page_flags: PageFlags, region: VirtAddr, region_size: u64) -> Self {
        let layout = if (object_size as u64) < PAGE_SIZE / 8 {
            SlabLayout::OnSlab
        } else {
            SlabLayout::OffSlab
        };
        Self {
            object_size,
            layout,
            page_flags,
            full: Vec::new(),
            partial: Vec::new(),
            empty: Vec::new(),
            growth_cursor: region,
            region_end: region + region_size,
        }
    }

    /// Whether this cache uses on-slab or off-slab metadata (testable property 4).
    #[must_use]
    pub const fn layout(&self) -> SlabLayout {
        self.layout
    }

    fn grow(
        &mut self,
        base_pt: PhysAddr,
        vmm: &VirtualMemoryManager,
        frame_alloc: &mut dyn FrameAllocator,
    ) -> Result<(), HeapError> {
        let pages_needed = ((self.object_size as u64 * 8).max(PAGE_SIZE) + PAGE_SIZE - 1) / PAGE_SIZE;
        let region_size = pages_needed * PAGE_SIZE;
        if self.growth_cursor + region_size > self.region_end {
            return Err(HeapError::HeapNotMapped);
        }

        let mut phys_pages = Vec::with_capacity(pages_needed as usize);
        for _ in 0..pages_needed {
            let Some(frame) = frame_alloc.allocate_frame() else {
                for frame in &phys_pages {
                    frame_alloc.free_frame(*frame);
                }
                return Err(HeapError::HeapNotMapped);
            };
            phys_pages.push(frame);
        }
        let phys_addrs: Vec<PhysAddr> = phys_pages.iter().map(|f| f.start_address()).collect();
        if vmm
            .allocate(base_pt, self.growth_cursor, &phys_addrs, self.page_flags, frame_alloc)
            .is_err()
        {
            return Err(HeapError::HeapNotMapped);
        }

        let slab = Slab::new(self.growth_cursor, self.object_size, pages_needed as usize);
        self.growth_cursor += region_size;
        self.empty.push(slab);
        Ok(())
    }

    /// Allocate one object, preferring partial slabs, then empty slabs, then
    /// growing by mapping fresh pages.
    pub fn allocate(
        &mut self,
        base_pt: PhysAddr,
        vmm: &VirtualMemoryManager,
        frame_alloc: &mut dyn FrameAllocator,
    ) -> Result<VirtAddr, HeapError> {
        if let Some(mut slab) = self.partial.pop() {
            let addr = slab.alloc().expect("partial slab must have free slots");
            if slab.is_full() {
                self.full.push(slab);
            } else {
                self.partial.push(slab);
            }
            return Ok(addr);
        }
        if let Some(mut slab) = self.empty.pop() {
            let addr = slab.alloc().expect("freshly emptied slab must have free slots");
            self.partial.push(slab);
            return Ok(addr);
        }
        self.grow(base_pt, vmm, frame_alloc)?;
        self.allocate(base_pt, vmm, frame_alloc)
    }

    /// Returns `true` if `addr` belongs to this cache and was released.
    pub fn free(&mut self, addr: VirtAddr) -> bool {
        if let Some(pos) = self.full.iter().position(|s| s.owns(addr)) {
            let mut slab = self.full.remove(pos);
            slab.free(addr);
            if slab.is_empty_of_objects() {
                self.empty.push(slab);
            } else {
                self.partial.push(slab);
            }
            return true;
        }
        if let Some(pos) = self.partial.iter().position(|s| s.owns(addr)) {
            let mut slab = self.partial.remove(pos);
            slab.free(addr);
            if slab.is_empty_of_objects() {
                self.empty.push(slab);
            } else {
                self.partial.push(slab);
            }
            return true;
        }
        // An empty slab cannot own a live allocation; this indicates a
        // double free. Reject it rather than corrupting bookkeeping.
        false
    }

    fn owns_region(&self, addr: VirtAddr) -> bool {
        self.full.iter().any(|s| s.owns(addr))
            || self.partial.iter().any(|s| s.owns(addr))
            || self.empty.iter().any(|s| s.owns(addr))
    }

    /// Sum of `allocated_count` across every slab (testable property 3).
    #[cfg(test)]
    fn live_objects(&self) -> usize {
        self.full.iter().map(|s| s.allocated_count).sum::<usize>()
            + self.partial.iter().map(|s| s.allocated_count).sum::<usize>()
            + self.empty.iter().map(|s| s.allocated_count).sum::<usize>()
    }
}

fn size_class_index(size: usize) -> usize {
    let size = size.max(1 << MIN_SIZE_POWER);
    let power = (usize::BITS - (size - 1).leading_zeros()).max(MIN_SIZE_POWER);
    (power - MIN_SIZE_POWER) as usize
}

/// Owns the general-purpose and DMA size-class pools (16 B .. 64 KiB).
pub struct SlabHeap {
    general: Vec<ObjectCache>,
    dma: Vec<ObjectCache>,
}

impl SlabHeap {
    /// Build the thirteen general-purpose and thirteen DMA size classes over
    /// two disjoint virtual regions.
    #[must_use]
    pub fn new(general_region: VirtAddr, dma_region: VirtAddr, region_size_each: u64) -> Self {
        let class_span = region_size_each / NUM_SIZE_CLASSES as u64;
        let mut general = Vec::with_capacity(NUM_SIZE_CLASSES);
        let mut dma = Vec::with_capacity(NUM_SIZE_CLASSES);
        for power in MIN_SIZE_POWER..=MAX_SIZE_POWER {
            let object_size = 1usize << power;
            let idx = (power - MIN_SIZE_POWER) as u64;
            general.push(ObjectCache::new(
                object_size,
                PageFlags::PRESENT | PageFlags::WRITABLE,
                general_region + idx * class_span,
                class_span,
            ));
            dma.push(ObjectCache::new(
                object_size,
                PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::CACHE_DISABLE | PageFlags::WRITE_THROUGH,
                dma_region + idx * class_span,
                class_span,
            ));
        }
        Self { general, dma }
    }

    /// Allocate `n` bytes from the general-purpose pool, rounding up to the
    /// next power-of-two size class.
    pub fn allocate(
        &mut self,
        base_pt: PhysAddr,
        vmm: &VirtualMemoryManager,
        frame_alloc: &mut dyn FrameAllocator,
        n: usize,
    ) -> Result<VirtAddr, HeapError> {
        let idx = size_class_index(n);
        self.general
            .get_mut(idx)
            .ok_or(HeapError::AllocGpOrDmaCacheError)?
            .allocate(base_pt, vmm, frame_alloc)
            .map_err(|_| HeapError::GpCacheError)
    }

    /// Allocate `n` bytes from the DMA pool (cache-disabled, write-through).
    pub fn allocate_dma(
        &mut self,
        base_pt: PhysAddr,
        vmm: &VirtualMemoryManager,
        frame_alloc: &mut dyn FrameAllocator,
        n: usize,
    ) -> Result<VirtAddr, HeapError> {
        let idx = size_class_index(n);
        self.dma
            .get_mut(idx)
            .ok_or(HeapError::AllocGpOrDmaCacheError)?
            .allocate(base_pt, vmm, frame_alloc)
            .map_err(|_| HeapError::DmaCacheError)
    }

    /// Release `addr` back to whichever cache owns it. A no-op, not a crash,
    /// if no active cache claims the address.
    pub fn free(&mut self, addr: VirtAddr) {
        for cache in self.general.iter_mut().chain(self.dma.iter_mut()) {
            if cache.owns_region(addr) {
                cache.free(addr);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::size_class_index;

    #[test_case]
    fn size_class_rounds_up_to_power_of_two() {
        assert_eq!(size_class_index(1), 0); // 16
        assert_eq!(size_class_index(16), 0);
        assert_eq!(size_class_index(17), 1); // 32
        assert_eq!(size_class_index(64), 2); // 64
        assert_eq!(size_class_index(65), 3); // 128
    }
}
