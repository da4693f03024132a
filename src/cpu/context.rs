//! Platform-specific primitives isolated behind a small set of functions
//! (spec.md §9's "platform handoff via inline assembly" design note): the
//! context-switch trampoline, `swapgs`, and the MSRs the scheduler and
//! syscall transport need. Everything above this module is portable.

use core::arch::naked_asm;

use x86_64::{
    registers::{
        control::{Cr3, Cr3Flags},
        model_specific::Msr,
    },
    structures::paging::PhysFrame,
    PhysAddr, VirtAddr,
};

const MSR_KERNEL_GS_BASE: u32 = 0xC000_0102;

/// The block `KERNEL_GS_BASE` points at for the lifetime of the kernel
/// (single-core, so there is exactly one). `user_rsp` is scratch space the
/// syscall trampoline stashes the user stack pointer in across the swap;
/// `kernel_stack_top` is updated on every context switch.
#[repr(C)]
pub struct PerCpuScratch {
    /// Scratch slot the syscall entry trampoline uses to stash `RSP`.
    pub user_rsp: u64,
    /// Kernel stack top to switch to on the next `syscall`/interrupt entry.
    pub kernel_stack_top: u64,
}

static mut PER_CPU_SCRATCH: PerCpuScratch = PerCpuScratch {
    user_rsp: 0,
    kernel_stack_top: 0,
};

/// Point `KERNEL_GS_BASE` at the single per-core scratch block. Must run
/// once at boot, before interrupts or `syscall` can fire.
pub fn init_per_cpu_scratch() {
    // SAFETY: single core, called once before any interrupt/syscall entry
    // can race with this write.
    unsafe {
        let addr = &raw const PER_CPU_SCRATCH as u64;
        Msr::new(MSR_KERNEL_GS_BASE).write(addr);
    }
}

/// Saved machine state of a thread not currently running: just enough to
/// resume it. The full general-purpose register snapshot lives on the
/// thread's kernel stack, pushed by [`switch_stack`] on the way out.
#[derive(Debug, Clone, Copy)]
pub struct SavedContext {
    /// Top of the kernel stack to resume on (installed as TSS `RSP0`).
    pub kernel_stack_top: VirtAddr,
    /// Physical address of this thread's L4 page table.
    pub base_page_table: PhysAddr,
    /// Kernel `RSP` to resume this thread on, previously saved by
    /// [`switch_stack`] (or fabricated by [`prime_new_thread_stack`] for a
    /// thread that has never run).
    pub resume_rsp: VirtAddr,
}

/// Perform a full context switch: load the incoming VAS, swap the kernel
/// stack pointer used on the next interrupt/syscall entry, and actually
/// alternate kernel stacks so the outgoing thread's call frame is preserved
/// and the incoming thread resumes exactly where it left off.
///
/// `outgoing_rsp_slot` is a pointer to the currently running thread's own
/// `kernel_rsp` field, or null if there is no outgoing thread to save (only
/// possible before the very first switch). Generalizes the teacher crate's
/// boot-time-only GDT/TSS setup into a per-switch operation.
pub fn switch_address_space(outgoing_rsp_slot: *mut VirtAddr, target: &SavedContext) {
    let current = Cr3::read().0.start_address();
    if current != target.base_page_table {
        let frame = PhysFrame::containing_address(target.base_page_table);
        // SAFETY: `target.base_page_table` is a VAS created by the VMM and
        // shares the kernel half with every other VAS.
        unsafe {
            Cr3::write(frame, Cr3Flags::empty());
        }
    }
    crate::cpu::gdt::set_kernel_stack(target.kernel_stack_top);
    // SAFETY: single core; the scratch block is not concurrently accessed
    // because interrupts are disabled for the whole scheduler-lock window.
    unsafe {
        PER_CPU_SCRATCH.kernel_stack_top = target.kernel_stack_top.as_u64();
    }
    // SAFETY: `outgoing_rsp_slot` is either null or a pointer into the
    // outgoing thread's own `Thread::kernel_rsp` field; the caller
    // (`scheduler::perform_switch`) holds it stable across this call by
    // having already dropped the scheduler lock with interrupts disabled on
    // a single core, so nothing else can mutate the thread table in the
    // meantime. `target.resume_rsp` was either saved by a previous call to
    // this function or fabricated by `prime_new_thread_stack`.
    unsafe {
        switch_stack(outgoing_rsp_slot.cast::<u64>(), target.resume_rsp.as_u64());
    }
}

/// Fabricate the resume point for a thread that has never run: the
/// callee-saved registers [`switch_stack`] expects to pop, followed by a
/// return address of `entry`, so the first switch into this thread "returns"
/// into `entry` instead of the caller of `switch_stack`.
pub fn prime_new_thread_stack(stack_top: VirtAddr, entry: extern "C" fn() -> !) -> VirtAddr {
    let mut sp = stack_top.as_u64();
    let mut push = |value: u64| {
        sp -= 8;
        // SAFETY: `sp` lies within the kernel stack just reserved for this
        // thread, which has not started running and so cannot race this write.
        unsafe {
            (sp as *mut u64).write(value);
        }
    };
    push(entry as usize as u64); // return address for switch_stack's `ret`
    push(0); // rbp
    push(0); // rbx
    push(0); // r12
    push(0); // r13
    push(0); // r14
    push(0); // r15
    VirtAddr::new(sp)
}

/// Save the outgoing thread's callee-saved registers and `RSP` to
/// `*save_rsp` (skipped if null), load `RSP` from `new_rsp`, restore the
/// incoming thread's callee-saved registers, and `ret` into wherever that
/// thread left off (or into its primed entry trampoline, the first time).
#[unsafe(naked)]
unsafe extern "C" fn switch_stack(save_rsp: *mut u64, new_rsp: u64) {
    // SAFETY: standard two-stack context switch. `rdi`/`rsi` hold the
    // incoming arguments per the System V calling convention; every push
    // here is matched by a pop on the other side of some future call to
    // this same function.
    unsafe {
        naked_asm!(
            "push rbp",
            "push rbx",
            "push r12",
            "push r13",
            "push r14",
            "push r15",
            "test rdi, rdi",
            "jz 2f",
            "mov [rdi], rsp",
            "2:",
            "mov rsp, rsi",
            "pop r15",
            "pop r14",
            "pop r13",
            "pop r12",
            "pop rbx",
            "pop rbp",
            "ret",
        );
    }
}

/// Transition from Ring 0 to Ring 3 via `iretq`. Never returns: a thread
/// exits back to the kernel through the syscall transport or a fault, never
/// by unwinding this call.
///
/// # Safety
///
/// `entry` and `user_stack_top` must be mapped `{Present, User}` in the
/// currently active address space, and `user_cs`/`user_ds` must be valid
/// Ring-3 selectors in the GDT.
#[unsafe(naked)]
pub unsafe extern "C" fn enter_user_mode(entry: u64, user_stack_top: u64, user_cs: u64, user_ds: u64) -> ! {
    // SAFETY: builds the five-word iretq frame (SS, RSP, RFLAGS, CS, RIP)
    // Intel's architecture manual documents for a Ring 0 -> Ring 3 return.
    unsafe {
        naked_asm!(
            "mov ax, cx",
            "mov ds, ax",
            "mov es, ax",
            "mov fs, ax",
            "mov gs, ax",
            "push rcx", // SS = user data selector
            "push rsi", // RSP = user stack top
            "pushfq",
            "pop r11",
            "or r11, 0x200", // set IF so interrupts fire in user mode
            "push r11",      // RFLAGS
            "push rdx",      // CS = user code selector
            "push rdi",      // RIP = entry point
            "iretq",
        );
    }
}

/// Halt with interrupts enabled until the next interrupt, used by the idle
/// thread (spec.md §4.6).
pub fn halt_until_interrupt() {
    x86_64::instructions::interrupts::enable_and_hlt();
}
