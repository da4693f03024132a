//! Virtual memory core: paging (C1), the physical frame allocator (C2),
//! the virtual memory manager (C3) and the slab allocator (C4).

pub mod frame;
pub mod paging;
pub mod slab;
pub mod vmm;

pub use frame::BootInfoFrameAllocator;
pub use paging::PagingError;
pub use vmm::VirtualMemoryManager;

use bootloader::bootinfo::MemoryMap;
use x86_64::{
    registers::control::Cr3,
    structures::paging::PageTable,
    VirtAddr,
};

/// Returns a mutable reference to the currently active level-4 table.
///
/// # Safety
/// The caller must guarantee that `physical_memory_offset` maps all of
/// physical memory, and that this is not called concurrently with another
/// mutable borrow of the same table.
unsafe fn active_level_4_table(physical_memory_offset: VirtAddr) -> &'static mut PageTable {
    let (level_4_table_frame, _) = Cr3::read();

    let phys = level_4_table_frame.start_address();
    let virt = physical_memory_offset + phys.as_u64();
    let page_table_ptr: *mut PageTable = virt.as_mut_ptr();

    // SAFETY: caller guarantees `physical_memory_offset` maps physical memory.
    unsafe { &mut *page_table_ptr }
}

/// Bring up the paging core: records the higher-half direct-map offset so
/// that [`paging`] and [`vmm`] can translate between physical and virtual
/// addresses, and returns the boot-time level-4 table for inspection.
///
/// # Safety
/// The caller must guarantee that `physical_memory_offset` maps all of
/// physical memory and that this runs exactly once.
pub unsafe fn init(physical_memory_offset: VirtAddr) -> &'static mut PageTable {
    paging::init(physical_memory_offset);
    // SAFETY: forwarded from caller.
    unsafe { active_level_4_table(physical_memory_offset) }
}

/// Build a frame allocator from the boot-time memory map.
///
/// # Safety
/// The caller must guarantee that `memory_map` lists only memory that is
/// actually unused by anything else (the bootloader promises this for
/// `MemoryRegionType::Usable` regions).
pub unsafe fn frame_allocator(memory_map: &'static MemoryMap) -> BootInfoFrameAllocator {
    // SAFETY: forwarded from caller.
    unsafe { BootInfoFrameAllocator::new(memory_map) }
}
