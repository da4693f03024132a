//! 4-level page table manipulation (C1).
//!
//! The `x86_64` crate's [`Mapper`](x86_64::structures::paging::Mapper) trait
//! is deliberately not used here: it has no notion of the partial-failure
//! rollback or parent-refcounting that `allocate_page`/`free_page` require.
//! Instead this module walks the hierarchy by hand, the way
//! `Arch/x86_64/Memory/Paging.cpp` in the original kernel does.

use conquer_once::spin::OnceCell;
use x86_64::{
    structures::paging::{Page, PageTable, PageTableFlags as RawFlags, PhysFrame, Size4KiB},
    PhysAddr, VirtAddr,
};

use super::frame::FrameAllocator;

bitflags::bitflags! {
    /// Page table entry flags, bit positions per the 4-level paging wire format.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        /// Bit 0 — the entry points at a present frame/table.
        const PRESENT = 1 << 0;
        /// Bit 1 — the mapped page is writable.
        const WRITABLE = 1 << 1;
        /// Bit 2 — the mapped page is accessible from Ring 3.
        const USER = 1 << 2;
        /// Bit 3 — write-through caching.
        const WRITE_THROUGH = 1 << 3;
        /// Bit 4 — caching disabled.
        const CACHE_DISABLE = 1 << 4;
        /// Bit 5 — the CPU has accessed this page.
        const ACCESSED = 1 << 5;
        /// Bit 6 — the CPU has written to this page.
        const DIRTY = 1 << 6;
    }
}

/// Flags used for every newly allocated intermediate (non-leaf) table.
const INTERMEDIATE_FLAGS: RawFlags =
    RawFlags::from_bits_truncate(RawFlags::PRESENT.bits() | RawFlags::WRITABLE.bits() | RawFlags::USER_ACCESSIBLE.bits());

/// Paging failure kinds (spec.md §4.1/§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingError {
    /// An intermediate or leaf frame could not be obtained; `level` is the
    /// deepest page-table level reached before giving up (0 = leaf already present).
    AllocError {
        /// Deepest level reached (4=L4 .. 0=leaf).
        level: u8,
    },
    /// A frame could not be returned to the allocator while freeing; `level`
    /// is the level at which the free failed. Partial frees are already applied.
    FreeError {
        /// Level at which the free failed.
        level: u8,
    },
}

/// Outcome of a read-only walk ([`find_page`]) or a successful mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessStatus {
    /// The leaf entry is present; `physical_address` is valid.
    Okay,
    /// Some entry along the path to the leaf is not present.
    Missing,
}

/// Result of walking the page table hierarchy for a virtual address.
#[derive(Debug, Clone, Copy)]
pub struct PageAccess {
    /// Whether the leaf was found.
    pub status: AccessStatus,
    /// The level at which the walk stopped (0 on success).
    pub level: u8,
    /// The resolved physical address (only meaningful when `status == Okay`).
    pub physical_address: PhysAddr,
    /// Flags on the leaf entry (only meaningful when `status == Okay`).
    pub flags: PageFlags,
}

static PHYS_MEM_OFFSET: OnceCell<VirtAddr> = OnceCell::uninit();

/// Record the higher-half direct-map offset used to translate physical
/// addresses of page tables into virtual addresses the CPU can dereference.
///
/// Must run once, before any other function in this module.
pub fn init(physical_memory_offset: VirtAddr) {
    PHYS_MEM_OFFSET
        .try_init_once(|| physical_memory_offset)
        .ok();
}

fn phys_offset() -> VirtAddr {
    *PHYS_MEM_OFFSET
        .get()
        .expect("memory::paging::init must run before any page-table access")
}

/// Sign-extend bit 47 into bits 48..64, per the canonical-address rule.
#[must_use]
pub fn canonicalize(addr: u64) -> u64 {
    if (addr >> 47) & 1 == 1 {
        addr | 0xFFFF_0000_0000_0000
    } else {
        addr & 0x0000_FFFF_FFFF_FFFF
    }
}

/// Translate a physical address of a page table frame into a pointer this
/// core can dereference, via the higher-half direct map.
fn table_ptr(phys: PhysAddr) -> *mut PageTable {
    (phys_offset() + phys.as_u64()).as_mut_ptr()
}

fn to_raw_flags(flags: PageFlags) -> RawFlags {
    let mut raw = RawFlags::empty();
    if flags.contains(PageFlags::PRESENT) {
        raw |= RawFlags::PRESENT;
    }
    if flags.contains(PageFlags::WRITABLE) {
        raw |= RawFlags::WRITABLE;
    }
    if flags.contains(PageFlags::USER) {
        raw |= RawFlags::USER_ACCESSIBLE;
    }
    if flags.contains(PageFlags::WRITE_THROUGH) {
        raw |= RawFlags::WRITE_THROUGH;
    }
    if flags.contains(PageFlags::CACHE_DISABLE) {
        raw |= RawFlags::NO_CACHE;
    }
    raw
}

fn from_raw_flags(raw: RawFlags) -> PageFlags {
    let mut flags = PageFlags::empty();
    if raw.contains(RawFlags::PRESENT) {
        flags |= PageFlags::PRESENT;
    }
    if raw.contains(RawFlags::WRITABLE) {
        flags |= PageFlags::WRITABLE;
    }
    if raw.contains(RawFlags::USER_ACCESSIBLE) {
        flags |= PageFlags::USER;
    }
    if raw.contains(RawFlags::WRITE_THROUGH) {
        flags |= PageFlags::WRITE_THROUGH;
    }
    if raw.contains(RawFlags::NO_CACHE) {
        flags |= PageFlags::CACHE_DISABLE;
    }
    if raw.contains(RawFlags::ACCESSED) {
        flags |= PageFlags::ACCESSED;
    }
    if raw.contains(RawFlags::DIRTY) {
        flags |= PageFlags::DIRTY;
    }
    flags
}

fn page_indices(virt: VirtAddr) -> [usize; 4] {
    let page = Page::<Size4KiB>::containing_address(VirtAddr::new(canonicalize(virt.as_u64())));
    [
        usize::from(page.p4_index()),
        usize::from(page.p3_index()),
        usize::from(page.p2_index()),
        usize::from(page.p1_index()),
    ]
}

/// Read-only walk of the page table hierarchy rooted at `base_pt`.
#[must_use]
pub fn find_page(base_pt: PhysAddr, virt: VirtAddr) -> PageAccess {
    let indices = page_indices(virt);
    let mut table_phys = base_pt;
    for (i, &idx) in indices.iter().enumerate() {
        // SAFETY: `table_phys` is a Present table frame reached by walking from
        // `base_pt`, which the caller guarantees is a valid L4 table.
        let table = unsafe { &*table_ptr(table_phys) };
        let entry = &table[idx];
        if !entry.flags().contains(RawFlags::PRESENT) {
            return PageAccess {
                status: AccessStatus::Missing,
                level: 4 - u8::try_from(i).unwrap_or(4),
                physical_address: PhysAddr::zero(),
                flags: PageFlags::empty(),
            };
        }
        if i == indices.len() - 1 {
            let offset = virt.as_u64() & 0xFFF;
            return PageAccess {
                status: AccessStatus::Okay,
                level: 0,
                physical_address: entry.addr() + offset,
                flags: from_raw_flags(entry.flags()),
            };
        }
        table_phys = entry.addr();
    }
    unreachable!("page_indices always yields exactly 4 levels")
}

/// Install a mapping `virt -> phys` with `flags`, allocating any missing
/// intermediate page tables along the way.
///
/// On failure, every frame this call obtained (intermediate tables, not the
/// caller-supplied leaf frame) is freed before returning.
pub fn allocate_page(
    base_pt: PhysAddr,
    virt: VirtAddr,
    phys: PhysAddr,
    flags: PageFlags,
    frame_alloc: &mut dyn FrameAllocator,
) -> Result<PageAccess, PagingError> {
    let indices = page_indices(virt);
    let mut table_phys = base_pt;
    let mut allocated: [Option<PhysFrame<Size4KiB>>; 3] = [None, None, None];

    for (i, &idx) in indices.iter().enumerate() {
        let is_leaf = i == indices.len() - 1;
        // SAFETY: `table_phys` is Present (checked at the previous iteration, or
        // it is `base_pt`, which the caller guarantees is a valid L4 table).
        let table = unsafe { &mut *table_ptr(table_phys) };
        let entry = &mut table[idx];

        if entry.flags().contains(RawFlags::PRESENT) {
            if is_leaf {
                rollback(&allocated, frame_alloc);
                return Err(PagingError::AllocError { level: 0 });
            }
            table_phys = entry.addr();
            continue;
        }

        if is_leaf {
            entry.set_addr(phys, to_raw_flags(flags));
            return Ok(PageAccess {
                status: AccessStatus::Okay,
                level: 0,
                physical_address: phys,
                flags,
            });
        }

        let Some(frame) = frame_alloc.allocate_frame() else {
            rollback(&allocated, frame_alloc);
            return Err(PagingError::AllocError {
                level: 4 - u8::try_from(i).unwrap_or(4),
            });
        };
        allocated[i] = Some(frame);
        // SAFETY: `frame` was just allocated and is not aliased anywhere else;
        // `table_ptr` is valid for the whole frame via the direct map.
        unsafe {
            table_ptr(frame.start_address()).write_bytes(0u8, 1);
        }
        entry.set_addr(frame.start_address(), INTERMEDIATE_FLAGS);
        table_phys = frame.start_address();
    }
    unreachable!("the leaf iteration above always returns")
}

fn rollback(allocated: &[Option<PhysFrame<Size4KiB>>], frame_alloc: &mut dyn FrameAllocator) {
    for frame in allocated.iter().flatten() {
        frame_alloc.free_frame(*frame);
    }
}

/// Tear down the mapping for `virt`. Frees the leaf frame and, recursively,
/// any parent table that becomes empty as a result — but never the L4 table.
pub fn free_page(
    base_pt: PhysAddr,
    virt: VirtAddr,
    frame_alloc: &mut dyn FrameAllocator,
) -> Result<PageAccess, PagingError> {
    let indices = page_indices(virt);
    let mut path = [base_pt; 4];
    for i in 0..3 {
        // SAFETY: `path[i]` was validated Present in the previous iteration, or
        // is `base_pt` (caller-guaranteed valid).
        let table = unsafe { &*table_ptr(path[i]) };
        let entry = &table[indices[i]];
        if !entry.flags().contains(RawFlags::PRESENT) {
            return Err(PagingError::FreeError {
                level: 4 - u8::try_from(i).unwrap_or(4),
            });
        }
        path[i + 1] = entry.addr();
    }

    // SAFETY: `path[3]` (the L1 table) was validated Present above.
    let l1_table = unsafe { &mut *table_ptr(path[3]) };
    let leaf = &mut l1_table[indices[3]];
    if !leaf.flags().contains(RawFlags::PRESENT) {
        return Err(PagingError::FreeError { level: 0 });
    }
    let leaf_frame = PhysFrame::<Size4KiB>::containing_address(leaf.addr());
    leaf.set_unused();
    frame_alloc.free_frame(leaf_frame);

    // Walk back up freeing empty parents (L1, L2, L3 — never L4).
    let mut child_phys = path[3];
    for lvl in 0..3 {
        // SAFETY: `child_phys` is a table this walk already validated Present.
        let child_table = unsafe { &*table_ptr(child_phys) };
        if child_table.iter().any(|e| e.flags().contains(RawFlags::PRESENT)) {
            break;
        }
        let parent_phys = path[2 - lvl];
        let parent_idx = indices[2 - lvl];
        frame_alloc.free_frame(PhysFrame::containing_address(child_phys));
        // SAFETY: `parent_phys` is a table this walk already validated Present.
        let parent_table = unsafe { &mut *table_ptr(parent_phys) };
        parent_table[parent_idx].set_unused();
        child_phys = parent_phys;
    }

    Ok(PageAccess {
        status: AccessStatus::Okay,
        level: 0,
        physical_address: leaf_frame.start_address(),
        flags: PageFlags::empty(),
    })
}

/// Flip the given bits on the leaf entry only, leaving intermediate tables untouched.
pub fn modify_page_flags(
    base_pt: PhysAddr,
    virt: VirtAddr,
    flags: PageFlags,
    set: bool,
) -> Result<PageAccess, PagingError> {
    let indices = page_indices(virt);
    let mut table_phys = base_pt;
    for i in 0..3 {
        // SAFETY: see `find_page`; same walk invariant.
        let table = unsafe { &*table_ptr(table_phys) };
        let entry = &table[indices[i]];
        if !entry.flags().contains(RawFlags::PRESENT) {
            return Err(PagingError::AllocError {
                level: 4 - u8::try_from(i).unwrap_or(4),
            });
        }
        table_phys = entry.addr();
    }
    // SAFETY: `table_phys` now points at the validated L1 table.
    let l1_table = unsafe { &mut *table_ptr(table_phys) };
    let leaf = &mut l1_table[indices[3]];
    if !leaf.flags().contains(RawFlags::PRESENT) {
        return Err(PagingError::AllocError { level: 0 });
    }
    let raw_flags = to_raw_flags(flags);
    let new_flags = if set {
        leaf.flags() | raw_flags
    } else {
        leaf.flags() & !raw_flags
    };
    let addr = leaf.addr();
    leaf.set_addr(addr, new_flags);
    Ok(PageAccess {
        status: AccessStatus::Okay,
        level: 0,
        physical_address: addr,
        flags: from_raw_flags(new_flags),
    })
}

/// Translate a virtual address to a physical one, taking the higher-half
/// direct-map fast path when possible and falling back to a page walk.
#[must_use]
pub fn virt_to_phys(base_pt: PhysAddr, virt: VirtAddr) -> Option<PhysAddr> {
    let offset = phys_offset();
    if virt.as_u64() >= offset.as_u64() {
        return Some(PhysAddr::new(virt.as_u64() - offset.as_u64()));
    }
    let access = find_page(base_pt, virt);
    match access.status {
        AccessStatus::Okay => Some(access.physical_address),
        AccessStatus::Missing => None,
    }
}

#[cfg(test)]
mod tests {
    use super::canonicalize;

    #[test_case]
    fn canonicalize_sign_extends_bit_47() {
        assert_eq!(canonicalize(0x0000_8000_0000_0000), 0xFFFF_8000_0000_0000);
    }

    #[test_case]
    fn canonicalize_clears_high_bits_when_bit_47_unset() {
        assert_eq!(canonicalize(0xFFFF_0000_1234_5678), 0x0000_0000_1234_5678);
    }
}
