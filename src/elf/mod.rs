//! ELF64 loader (C12): validate a loaded executable image's headers,
//! allocate and copy its segments into a target address space, and lay
//! down the bootstrap argument block a freshly started thread expects to
//! find at the top of its stack.

use alloc::{
    string::{String, ToString},
    vec::Vec,
};

use log::warn;
use x86_64::{
    registers::control::Cr3,
    structures::paging::{PhysFrame, Size4KiB},
    PhysAddr, VirtAddr,
};
use xmas_elf::{
    header::Data,
    program::{ProgramHeader, Type as SegmentType},
    ElfFile,
};

use crate::{
    config::{DEFAULT_USER_STACK_SIZE, USER_SPACE_END, USER_STACK_TOP},
    memory::{frame::FrameAllocator, paging::PageFlags, vmm::VirtualMemoryManager},
};

const PAGE_SIZE: u64 = 4096;

/// Why loading an executable image failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    /// Reading the backing file/buffer failed.
    IoError,
    /// The ELF header is not a valid, supported executable.
    BadHeader,
    /// A program header described an invalid or out-of-bounds segment.
    BadSegment,
    /// The vendor/version NOTE segment was malformed.
    BadVendorInfo,
    /// Frame or virtual-address allocation failed while building the image.
    MemoryError,
    /// Standard stream setup failed for this app (see `app` module).
    BadStdio,
}

/// Descriptor of the stack region placed in the new address space.
#[derive(Debug, Clone, Copy)]
pub struct StackDescriptor {
    /// Lowest addressable byte of the stack.
    pub bottom: VirtAddr,
    /// Initial stack pointer (top of the stack).
    pub top: VirtAddr,
}

/// The bootstrap block placed below the stack, in user memory, for the new
/// thread to read on first instructions.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct StartInfo {
    /// Argument count.
    pub argc: u64,
    /// Pointer to the null-terminated `argv` array.
    pub argv: u64,
    /// Pointer to the packed copy of the program headers.
    pub program_header_address: u64,
    /// Size of a single program header entry.
    pub program_header_size: u64,
    /// Number of program header entries.
    pub program_header_count: u64,
    /// Low 64 bits of a deterministic-but-nonzero random seed.
    pub random_low: u64,
    /// High 64 bits of the random seed.
    pub random_high: u64,
    /// Entry point of the loaded image.
    pub main: u64,
}

/// Version triple carried by an optional PT_NOTE segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    /// Major version.
    pub major: u32,
    /// Minor version.
    pub minor: u32,
    /// Patch version.
    pub patch: u32,
}

/// Everything the App manager needs to schedule the loaded image's first
/// thread.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    /// Entry point virtual address.
    pub entry: VirtAddr,
    /// Physical address of the L4 table for the new address space.
    pub base_page_table_address: PhysAddr,
    /// First unused virtual address past every LOAD segment.
    pub heap_start: VirtAddr,
    /// The stack region reserved for the first thread.
    pub stack: StackDescriptor,
    /// Virtual address of the `StartInfo` block.
    pub start_info_addr: VirtAddr,
    /// Vendor name from the optional PT_NOTE segment, if present.
    pub vendor: Option<String>,
    /// Version triple from the optional PT_NOTE segment, if present.
    pub version: Option<Version>,
}

/// A simple xorshift64 PRNG seeded from the CPU timestamp counter, used to
/// fill `StartInfo.random`. The original codebase left this as a
/// placeholder constant; we seed from `RDTSC` so repeated loads differ.
fn seed_random() -> u64 {
    let tsc = unsafe { core::arch::x86_64::_rdtsc() };
    let mut x = tsc ^ 0x9E37_79B9_7F4A_7C15;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x | 1
}

/// Validate and load `image` into `target_pt` (a fresh, not-yet-activated
/// address space), returning everything needed to schedule its first
/// thread. `target_pt` may equal the caller's current VAS (the system
/// loader reuses the kernel VAS); the previous VAS is always restored
/// before returning.
pub fn load(
    image: &[u8],
    argv: &[&str],
    target_pt: PhysAddr,
    vmm: &VirtualMemoryManager,
    frame_alloc: &mut dyn FrameAllocator,
) -> Result<LoadedImage, LoadError> {
    let elf = ElfFile::new(image).map_err(|_| LoadError::BadHeader)?;
    validate_header(&elf)?;

    let load_headers: Vec<ProgramHeader> = elf
        .program_iter()
        .filter(|ph| matches!(ph.get_type(), Ok(SegmentType::Load)))
        .collect();
    if load_headers.is_empty() {
        return Err(LoadError::BadSegment);
    }
    for ph in &load_headers {
        if segment_intersects_kernel(ph) {
            return Err(LoadError::BadSegment);
        }
    }

    let (vendor, version) = parse_vendor_note(&elf, image)?;

    let previous_pt = vmm.current_address_space();
    if previous_pt != target_pt {
        vmm.load_virtual_address_space(target_pt);
    }

    let result = load_into_current_vas(&elf, &load_headers, image, argv, target_pt, vmm, frame_alloc)
        .map(|mut loaded| {
            loaded.vendor = vendor;
            loaded.version = version;
            loaded
        });

    if previous_pt != target_pt {
        vmm.load_virtual_address_space(previous_pt);
    }
    result
}

/// Classify and parse the optional PT_NOTE segment (spec.md §6's ELF64 input
/// format): `{vendor_name, major, minor, patch}`, byte order driven by the
/// header's data-encoding field. Absent entirely is fine; present-but-malformed
/// is [`LoadError::BadVendorInfo`].
fn parse_vendor_note(elf: &ElfFile, image: &[u8]) -> Result<(Option<String>, Option<Version>), LoadError> {
    let Some(ph) = elf.program_iter().find(|ph| matches!(ph.get_type(), Ok(SegmentType::Note))) else {
        return Ok((None, None));
    };
    let big_endian = matches!(elf.header.pt1.data(), Data::BigEndian);
    let offset = ph.offset() as usize;
    let size = ph.file_size() as usize;
    let bytes = image.get(offset..offset + size).ok_or(LoadError::BadVendorInfo)?;
    let (vendor, version) = parse_note_record(bytes, big_endian)?;
    Ok((Some(vendor), Some(version)))
}

fn read_u32(bytes: &[u8], big_endian: bool) -> Option<u32> {
    let arr: [u8; 4] = bytes.try_into().ok()?;
    Some(if big_endian { u32::from_be_bytes(arr) } else { u32::from_le_bytes(arr) })
}

/// One ELF note record: `namesz:u32, descsz:u32, type:u32`, then `name`
/// padded to 4 bytes, then `desc` padded to 4 bytes. This note's `desc` is
/// the vendor name (the last 12 bytes of it reserved for `major`/`minor`/
/// `patch`, so the name itself is `descsz - 12` bytes, null-padded).
fn parse_note_record(bytes: &[u8], big_endian: bool) -> Result<(String, Version), LoadError> {
    if bytes.len() < 12 {
        return Err(LoadError::BadVendorInfo);
    }
    let namesz = read_u32(&bytes[0..4], big_endian).ok_or(LoadError::BadVendorInfo)? as usize;
    let descsz = read_u32(&bytes[4..8], big_endian).ok_or(LoadError::BadVendorInfo)? as usize;
    if descsz < 12 {
        return Err(LoadError::BadVendorInfo);
    }
    let name_padded = namesz.div_ceil(4) * 4;
    let desc_start = 12 + name_padded;
    let desc = bytes.get(desc_start..desc_start + descsz).ok_or(LoadError::BadVendorInfo)?;

    let vendor_region = &desc[..descsz - 12];
    let vendor_name_len = vendor_region.iter().position(|&b| b == 0).unwrap_or(vendor_region.len());
    let vendor = core::str::from_utf8(&vendor_region[..vendor_name_len])
        .map_err(|_| LoadError::BadVendorInfo)?
        .to_string();

    let version_bytes = &desc[descsz - 12..descsz];
    let major = read_u32(&version_bytes[0..4], big_endian).ok_or(LoadError::BadVendorInfo)?;
    let minor = read_u32(&version_bytes[4..8], big_endian).ok_or(LoadError::BadVendorInfo)?;
    let patch = read_u32(&version_bytes[8..12], big_endian).ok_or(LoadError::BadVendorInfo)?;
    Ok((vendor, Version { major, minor, patch }))
}

fn validate_header(elf: &ElfFile) -> Result<(), LoadError> {
    use xmas_elf::header::{Class, Type as HeaderType};

    if elf.header.pt1.magic != [0x7f, b'E', b'L', b'F'] {
        return Err(LoadError::BadHeader);
    }
    if elf.header.pt1.class() != Class::SixtyFour {
        return Err(LoadError::BadHeader);
    }
    let Ok(HeaderType::Executable) = elf.header.pt2.type_().as_type() else {
        return Err(LoadError::BadHeader);
    };
    if elf.header.pt2.entry_point() >= USER_SPACE_END {
        return Err(LoadError::BadHeader);
    }
    Ok(())
}

fn segment_intersects_kernel(ph: &ProgramHeader) -> bool {
    let start = ph.virtual_addr();
    let end = start.saturating_add(ph.mem_size());
    end > USER_SPACE_END
}

fn load_into_current_vas(
    elf: &ElfFile,
    load_headers: &[ProgramHeader],
    image: &[u8],
    argv: &[&str],
    target_pt: PhysAddr,
    vmm: &VirtualMemoryManager,
    frame_alloc: &mut dyn FrameAllocator,
) -> Result<LoadedImage, LoadError> {
    let mut heap_start = VirtAddr::new(0);
    let mut allocated_ranges: Vec<(VirtAddr, u64)> = Vec::new();

    for ph in load_headers {
        let page_start = VirtAddr::new(ph.virtual_addr()).align_down(PAGE_SIZE);
        let page_end = VirtAddr::new(ph.virtual_addr() + ph.mem_size()).align_up(PAGE_SIZE);
        let page_count = (page_end - page_start) / PAGE_SIZE;

        match allocate_segment(target_pt, page_start, page_count, vmm, frame_alloc) {
            Ok(()) => allocated_ranges.push((page_start, page_count)),
            Err(()) => {
                for (start, count) in &allocated_ranges {
                    let _ = vmm.free(target_pt, *start, *count, frame_alloc);
                }
                return Err(LoadError::MemoryError);
            }
        }

        let file_bytes = segment_bytes(elf, ph, image)?;
        copy_segment(ph.virtual_addr(), file_bytes, ph.mem_size());

        let downgraded_flags = leaf_flags_for(ph);
        for i in 0..page_count {
            let _ = crate::memory::paging::modify_page_flags(target_pt, page_start + i * PAGE_SIZE, downgraded_flags, true);
        }

        let top = VirtAddr::new(ph.virtual_addr() + ph.mem_size());
        if top > heap_start {
            heap_start = top;
        }
    }
    heap_start = heap_start.align_up(PAGE_SIZE);

    let stack_top = VirtAddr::new(USER_STACK_TOP);
    let stack_pages = DEFAULT_USER_STACK_SIZE / PAGE_SIZE;
    let stack_bottom = stack_top - DEFAULT_USER_STACK_SIZE;
    allocate_segment(
        target_pt,
        stack_bottom,
        stack_pages,
        vmm,
        frame_alloc,
    )
    .map_err(|()| LoadError::MemoryError)?;

    let start_info_addr = build_bootstrap_area(elf, image, argv, stack_bottom, target_pt, vmm, frame_alloc)?;

    Ok(LoadedImage {
        entry: VirtAddr::new(elf.header.pt2.entry_point()),
        base_page_table_address: target_pt,
        heap_start,
        stack: StackDescriptor {
            bottom: stack_bottom,
            top: stack_top,
        },
        start_info_addr,
        vendor: None,
        version: None,
    })
}

fn allocate_segment(
    target_pt: PhysAddr,
    page_start: VirtAddr,
    page_count: u64,
    vmm: &VirtualMemoryManager,
    frame_alloc: &mut dyn FrameAllocator,
) -> Result<(), ()> {
    let mut phys_pages = Vec::with_capacity(page_count as usize);
    for _ in 0..page_count {
        match frame_alloc.allocate_frame() {
            Some(frame) => phys_pages.push(frame.start_address()),
            None => {
                for frame in phys_pages.iter().map(|p: &PhysAddr| PhysFrame::<Size4KiB>::containing_address(*p)) {
                    frame_alloc.free_frame(frame);
                }
                return Err(());
            }
        }
    }
    let flags = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER;
    vmm.allocate(target_pt, page_start, &phys_pages, flags, frame_alloc)
        .map_err(|_| ())
}

fn segment_bytes<'a>(_elf: &ElfFile<'a>, ph: &ProgramHeader, image: &'a [u8]) -> Result<&'a [u8], LoadError> {
    let offset = ph.offset() as usize;
    let size = ph.file_size() as usize;
    image.get(offset..offset + size).ok_or(LoadError::IoError)
}

fn copy_segment(virt: u64, file_bytes: &[u8], memory_size: u64) {
    // SAFETY: `virt..virt+memory_size` was just mapped {Present, Writable,
    // User} by `allocate_segment` in the currently active address space.
    unsafe {
        let dest = core::slice::from_raw_parts_mut(virt as *mut u8, memory_size as usize);
        dest[..file_bytes.len()].copy_from_slice(file_bytes);
        dest[file_bytes.len()..].fill(0);
    }
}

fn leaf_flags_for(ph: &ProgramHeader) -> PageFlags {
    let mut flags = PageFlags::PRESENT | PageFlags::USER;
    if ph.flags().is_write() {
        flags |= PageFlags::WRITABLE;
    }
    flags
}

/// Lays down, in order, the `StartInfo` block, the null-terminated `argv`
/// pointer array, the packed `argv` strings those pointers target, and a
/// packed copy of the program header table.
fn build_bootstrap_area(
    elf: &ElfFile,
    image: &[u8],
    argv: &[&str],
    stack_bottom: VirtAddr,
    target_pt: PhysAddr,
    vmm: &VirtualMemoryManager,
    frame_alloc: &mut dyn FrameAllocator,
) -> Result<VirtAddr, LoadError> {
    let ph_entry_size = u64::from(elf.header.pt2.ph_entry_size());
    let ph_count = u64::from(elf.header.pt2.ph_count());
    let ph_offset = elf.header.pt2.ph_offset();
    let ph_bytes_len = ph_entry_size * ph_count;
    let raw_ph_table = image
        .get(ph_offset as usize..(ph_offset + ph_bytes_len) as usize)
        .ok_or(LoadError::BadSegment)?;

    let start_info_size = core::mem::size_of::<StartInfo>() as u64;
    let argv_ptr_array_size = (argv.len() as u64 + 1) * 8;
    let mut string_offsets = Vec::with_capacity(argv.len());
    let mut strings_len = 0u64;
    for arg in argv {
        string_offsets.push(strings_len);
        strings_len += arg.len() as u64 + 1;
    }
    let argv_ptr_array_offset = start_info_size;
    let strings_offset = argv_ptr_array_offset + argv_ptr_array_size;
    let ph_copy_offset = (strings_offset + strings_len).div_ceil(8) * 8;
    let bootstrap_bytes = ph_copy_offset + ph_bytes_len;
    let bootstrap_pages = bootstrap_bytes.div_ceil(PAGE_SIZE).max(1);
    let bootstrap_base = stack_bottom - bootstrap_pages * PAGE_SIZE;

    allocate_segment(target_pt, bootstrap_base, bootstrap_pages, vmm, frame_alloc)
        .map_err(|()| LoadError::MemoryError)?;

    let start_info_addr = bootstrap_base;
    let argv_ptr_array_addr = start_info_addr + argv_ptr_array_offset;
    let strings_addr = start_info_addr + strings_offset;
    let ph_copy_addr = start_info_addr + ph_copy_offset;

    let seed = seed_random();
    let start_info = StartInfo {
        argc: argv.len() as u64,
        argv: argv_ptr_array_addr.as_u64(),
        program_header_address: ph_copy_addr.as_u64(),
        program_header_size: ph_entry_size,
        program_header_count: ph_count,
        random_low: seed,
        random_high: seed.rotate_left(32),
        main: elf.header.pt2.entry_point(),
    };

    // SAFETY: `bootstrap_base..bootstrap_base+bootstrap_bytes` was just
    // mapped {Present, Writable, User} in the currently active VAS.
    unsafe {
        core::ptr::write(start_info_addr.as_mut_ptr::<StartInfo>(), start_info);
        for (i, arg) in argv.iter().enumerate() {
            let str_addr = strings_addr + string_offsets[i];
            let ptr_slot = (argv_ptr_array_addr + i as u64 * 8).as_mut_ptr::<u64>();
            core::ptr::write(ptr_slot, str_addr.as_u64());
            let dest = core::slice::from_raw_parts_mut(str_addr.as_mut_ptr::<u8>(), arg.len() + 1);
            dest[..arg.len()].copy_from_slice(arg.as_bytes());
            dest[arg.len()] = 0;
        }
        let null_slot = (argv_ptr_array_addr + argv.len() as u64 * 8).as_mut_ptr::<u64>();
        core::ptr::write(null_slot, 0);
        let ph_dest = core::slice::from_raw_parts_mut(ph_copy_addr.as_mut_ptr::<u8>(), ph_bytes_len as usize);
        ph_dest.copy_from_slice(raw_ph_table);
    }

    Ok(start_info_addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn random_seed_is_never_zero() {
        assert_ne!(seed_random(), 0);
    }
}
