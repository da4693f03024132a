//! GDT and TSS setup (C5).
//!
//! Fixed layout: null, kernel code, kernel data, user data, user code, TSS.
//! `RSP0` (and the double-fault/page-fault IST entries) are (re)written on
//! every context switch to the incoming thread's kernel stack, generalizing
//! the teacher crate's one-shot `gdt.rs` which only ever sets it at boot.

use core::cell::UnsafeCell;

use lazy_static::lazy_static;
use x86_64::{
    instructions::{segmentation::Segment, tables::load_tss},
    registers::segmentation::CS,
    structures::{
        gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
        tss::TaskStateSegment,
    },
    VirtAddr,
};

use crate::config::{DOUBLE_FAULT_STACK_SIZE, PAGE_FAULT_STACK_SIZE};

/// IST index used for the double-fault handler's dedicated stack.
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;
/// IST index used for the page-fault handler's dedicated stack.
pub const PAGE_FAULT_IST_INDEX: u16 = 1;

/// Wrapper giving us a `'static` mutable TSS without a lock: the TSS is
/// mutated only by `set_kernel_stack`, which runs with interrupts disabled
/// as part of a context switch on a single core.
struct TssCell(UnsafeCell<TaskStateSegment>);
// SAFETY: single-core kernel; all writers hold the scheduler lock.
unsafe impl Sync for TssCell {}

lazy_static! {
    static ref TSS: TssCell = {
        let mut tss = TaskStateSegment::new();
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] =
            static_stack_top(DOUBLE_FAULT_STACK_SIZE);
        tss.interrupt_stack_table[PAGE_FAULT_IST_INDEX as usize] =
            static_stack_top(PAGE_FAULT_STACK_SIZE);
        TssCell(UnsafeCell::new(tss))
    };
}

fn static_stack_top(size: usize) -> VirtAddr {
    // A fixed-size static is used instead of a heap allocation because this
    // runs before the kernel heap exists.
    const MAX_STACK: usize = 4096 * 8;
    assert!(size <= MAX_STACK, "requested IST stack exceeds static reservation");
    static mut STACK: [u8; MAX_STACK] = [0; MAX_STACK];
    // SAFETY: each call site uses a disjoint IST slot at boot, single-threaded.
    let start = VirtAddr::from_ptr(&raw const STACK);
    start + size as u64
}

struct Selectors {
    code_selector: SegmentSelector,
    tss_selector: SegmentSelector,
    user_code_selector: SegmentSelector,
    user_data_selector: SegmentSelector,
}

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let code_selector = gdt.add_entry(Descriptor::kernel_code_segment());
        let _kernel_data = gdt.add_entry(Descriptor::kernel_data_segment());
        let user_data_entry = gdt.add_entry(Descriptor::user_data_segment());
        let user_code_entry = gdt.add_entry(Descriptor::user_code_segment());
        // SAFETY: `TSS` outlives the GDT; both are boot-time statics.
        let tss_selector = gdt.add_entry(Descriptor::tss_segment(unsafe { &*TSS.0.get() }));

        let user_data_selector = SegmentSelector(user_data_entry.0 | 3);
        let user_code_selector = SegmentSelector(user_code_entry.0 | 3);

        (
            gdt,
            Selectors {
                code_selector,
                tss_selector,
                user_code_selector,
                user_data_selector,
            },
        )
    };
}

/// Load the GDT and TSS, and set `CS` to the kernel code selector.
pub fn init() {
    GDT.0.load();
    // SAFETY: `GDT` and `TSS` are both initialized above; the selectors
    // reference valid entries in the just-loaded table.
    unsafe {
        CS::set_reg(GDT.1.code_selector);
        load_tss(GDT.1.tss_selector);
    }
}

/// The user code segment selector (Ring 3).
#[must_use]
pub fn user_code_selector() -> SegmentSelector {
    GDT.1.user_code_selector
}

/// The user data segment selector (Ring 3).
#[must_use]
pub fn user_data_selector() -> SegmentSelector {
    GDT.1.user_data_selector
}

/// The kernel code segment selector (Ring 0), used to build `STAR` for the
/// `syscall`/`sysret` transport (C10).
#[must_use]
pub fn kernel_code_selector() -> SegmentSelector {
    GDT.1.code_selector
}

/// Overwrite the TSS's `RSP0` (the stack loaded on a Ring3->Ring0 transition)
/// with the incoming thread's kernel stack top. Called on every context switch,
/// which always happens with interrupts disabled under the scheduler lock.
pub fn set_kernel_stack(top: VirtAddr) {
    // SAFETY: single writer at a time (scheduler lock held), single core.
    unsafe {
        (*TSS.0.get()).privilege_stack_table[0] = top;
    }
}
