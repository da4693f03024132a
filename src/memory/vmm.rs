//! The virtual memory manager (C3): per-address-space allocation of virtual
//! ranges on top of [`paging`], and VAS creation/load/free.

use x86_64::{
    registers::control::{Cr3, Cr3Flags},
    structures::paging::{PageTable, PhysFrame},
    PhysAddr, VirtAddr,
};

use super::{
    frame::FrameAllocator,
    paging::{self, PageFlags, PagingError},
};

/// A `{start, size, type}` region from the boot memory map (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionType {
    /// Unused, available for allocation.
    Free,
    /// Occupied by kernel code/data.
    KernelCode,
    /// Reserved for the kernel heap.
    KernelHeap,
    /// Usable general-purpose memory.
    Usable,
}

/// A contiguous range of memory, physical or virtual depending on context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Start address of the region.
    pub start: u64,
    /// Size of the region in bytes.
    pub size: u64,
    /// What this region is used for.
    pub region_type: RegionType,
}

/// The kernel-space layout shared identically across every VAS.
#[derive(Debug, Clone, Copy)]
pub struct KernelSpaceLayout {
    /// Region holding kernel `.text`/`.rodata`/`.data`.
    pub kernel_code: MemoryRegion,
    /// Region reserved for the slab-backed kernel heap.
    pub kernel_heap: MemoryRegion,
    /// Offset of the higher-half direct map.
    pub higher_half_direct_map: VirtAddr,
}

/// Owns the kernel-space layout and exposes per-VAS allocate/free plus
/// VAS lifecycle operations, all built on [`paging`].
pub struct VirtualMemoryManager {
    layout: KernelSpaceLayout,
}

impl VirtualMemoryManager {
    /// Construct the manager from the boot-time kernel layout.
    #[must_use]
    pub const fn new(layout: KernelSpaceLayout) -> Self {
        Self { layout }
    }

    /// The shared kernel-space layout (identical across every VAS).
    #[must_use]
    pub const fn layout(&self) -> &KernelSpaceLayout {
        &self.layout
    }

    /// Map `page_count` pages starting at `virt`, each with `flags`.
    ///
    /// On the first failure, every page mapped by this call so far is rolled
    /// back before returning the paging error of the failing page.
    pub fn allocate(
        &self,
        base_pt: PhysAddr,
        virt: VirtAddr,
        phys_pages: &[PhysAddr],
        flags: PageFlags,
        frame_alloc: &mut dyn FrameAllocator,
    ) -> Result<(), PagingError> {
        for (i, &phys) in phys_pages.iter().enumerate() {
            let page_virt = virt + (i as u64) * 4096;
            if let Err(err) = paging::allocate_page(base_pt, page_virt, phys, flags, frame_alloc) {
                for j in 0..i {
                    let rollback_virt = virt + (j as u64) * 4096;
                    let _ = paging::free_page(base_pt, rollback_virt, frame_alloc);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Unmap `page_count` pages starting at `virt`.
    pub fn free(
        &self,
        base_pt: PhysAddr,
        virt: VirtAddr,
        page_count: u64,
        frame_alloc: &mut dyn FrameAllocator,
    ) -> Result<(), PagingError> {
        for i in 0..page_count {
            paging::free_page(base_pt, virt + i * 4096, frame_alloc)?;
        }
        Ok(())
    }

    /// Allocate a fresh L4 table, copy the kernel half of the currently
    /// active L4 table into it, and zero the user half.
    ///
    /// Returns the physical address of the new table (the VAS identifier).
    pub fn allocate_virtual_address_space(
        &self,
        frame_alloc: &mut dyn FrameAllocator,
    ) -> Option<PhysAddr> {
        let new_frame = frame_alloc.allocate_frame()?;
        let offset = self.layout.higher_half_direct_map;

        let current_phys = Cr3::read().0.start_address();
        // SAFETY: `current_phys` is the currently active L4 table, reachable
        // through the direct map; `new_frame` was just allocated and is not
        // aliased anywhere else.
        unsafe {
            let current: *const PageTable = (offset + current_phys.as_u64()).as_ptr();
            let new_table: *mut PageTable = (offset + new_frame.start_address().as_u64()).as_mut_ptr();
            (*new_table).zero();
            for i in 256..512 {
                (*new_table)[i] = (*current)[i].clone();
            }
        }
        Some(new_frame.start_address())
    }

    /// Activate `phys` as the current address space by loading it into CR3.
    pub fn load_virtual_address_space(&self, phys: PhysAddr) {
        let frame = PhysFrame::containing_address(phys);
        // SAFETY: `phys` is the physical address of a valid L4 table produced
        // by `allocate_virtual_address_space`, which shares the kernel half.
        unsafe {
            Cr3::write(frame, Cr3Flags::empty());
        }
    }

    /// Free the L4 table frame backing `phys`. The caller must have already
    /// freed every user-half mapping with [`free`](Self::free).
    pub fn free_virtual_address_space(&self, phys: PhysAddr, frame_alloc: &mut dyn FrameAllocator) {
        frame_alloc.free_frame(PhysFrame::containing_address(phys));
    }

    /// The physical address of the L4 table currently loaded in CR3.
    #[must_use]
    pub fn current_address_space(&self) -> PhysAddr {
        Cr3::read().0.start_address()
    }
}
