//! The kernel's general-purpose `alloc` backing store, using the
//! `linked_list_allocator` crate. This is the ordinary Rust global
//! allocator every `Vec`/`Box`/`BTreeMap` in this crate ultimately goes
//! through; it is distinct from [`crate::memory::slab`], which is the
//! spec's own object-cache heap for kernel data structures that must be
//! carved directly out of VMM-managed pages.

use linked_list_allocator::LockedHeap;
use x86_64::{PhysAddr, VirtAddr};

use crate::{
    config::{HEAP_SIZE, HEAP_START},
    memory::{
        frame::FrameAllocator,
        paging::{self, PageFlags},
    },
};

/// Map and initialize the global allocator's backing heap region.
///
/// Maps one page at a time with [`paging::allocate_page`] rather than going
/// through [`crate::memory::vmm::VirtualMemoryManager::allocate`], since that
/// call collects its physical pages into a `Vec` first — and nothing can
/// allocate on this crate's global heap before this function returns.
///
/// # Errors
/// Returns `Err(())` if a physical frame could not be allocated for some
/// page in the heap range, or if mapping a page failed. Pages already
/// mapped before the failure are left mapped; this only runs once at boot
/// and a failure here is fatal to the kernel anyway.
pub fn init_heap(base_pt: PhysAddr, frame_alloc: &mut dyn FrameAllocator) -> Result<(), ()> {
    let heap_start = VirtAddr::new(HEAP_START as u64);
    let page_count = (HEAP_SIZE as u64).div_ceil(4096);

    for i in 0..page_count {
        let frame = frame_alloc.allocate_frame().ok_or(())?;
        paging::allocate_page(
            base_pt,
            heap_start + i * 4096,
            frame.start_address(),
            PageFlags::PRESENT | PageFlags::WRITABLE,
            frame_alloc,
        )
        .map_err(|_| ())?;
    }

    // SAFETY: `heap_start..heap_start+HEAP_SIZE` was just mapped {Present,
    // Writable} above, and this function runs exactly once at boot.
    unsafe {
        ALLOCATOR.lock().init(HEAP_START, HEAP_SIZE);
    }
    Ok(())
}

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();
