//! System-call transport (C10): `syscall`/`sysret` MSR setup and a dispatch
//! table keyed by numeric ID. Generalizes the teacher crate's old
//! `int 0x80` naked-entry convention onto the MSR-based transport, keeping
//! the same save-everything/call/restore structure.

use alloc::collections::BTreeMap;
use core::arch::naked_asm;

use log::warn;
use spin::Mutex;
use x86_64::registers::{
    model_specific::{Efer, EferFlags, Msr},
    rflags::RFlags,
};

use crate::cpu::gdt;

const MSR_STAR: u32 = 0xC000_0081;
const MSR_LSTAR: u32 = 0xC000_0082;
const MSR_FMASK: u32 = 0xC000_0084;

/// Value returned by [`dispatch`] when `id` has no installed handler.
pub const STATUS_UNKNOWN_SYSCALL: i64 = -1;

/// Registers available to a handler: the six argument registers plus the
/// user return address, matching what the entry trampoline captures.
#[derive(Debug, Clone, Copy)]
pub struct SyscallArgs {
    /// First argument (`rdi` at the call site).
    pub a1: u64,
    /// Second argument (`rsi`).
    pub a2: u64,
    /// Third argument (`rdx`).
    pub a3: u64,
    /// Fourth argument (`r10`, since `rcx` is clobbered by `syscall`).
    pub a4: u64,
    /// Fifth argument (`r8`).
    pub a5: u64,
    /// Sixth argument (`r9`).
    pub a6: u64,
}

/// A syscall handler. Runs with interrupts disabled (the `syscall`
/// instruction clears `RFLAGS.IF` via `FMASK`); a handler that must block
/// re-enables interrupts explicitly before doing so.
pub type SyscallHandler = fn(SyscallArgs) -> i64;

static HANDLERS: Mutex<BTreeMap<u64, SyscallHandler>> = Mutex::new(BTreeMap::new());

/// Install the handler for syscall number `id`, replacing any prior one.
pub fn install_handler(id: u64, handler: SyscallHandler) {
    HANDLERS.lock().insert(id, handler);
}

/// Remove the handler for syscall number `id`.
pub fn uninstall_handler(id: u64) {
    HANDLERS.lock().remove(&id);
}

/// Look up and invoke the handler for `id`. Returns [`STATUS_UNKNOWN_SYSCALL`]
/// if none is installed.
fn dispatch(id: u64, args: SyscallArgs) -> i64 {
    let handler = HANDLERS.lock().get(&id).copied();
    match handler {
        Some(h) => h(args),
        None => {
            warn!(target: "syscall", "unknown syscall id {id}");
            STATUS_UNKNOWN_SYSCALL
        }
    }
}

/// The seven syscall words the trampoline pushes before calling out to
/// Rust, in push order (lowest address first): `id`, then `a1..a6`.
#[repr(C)]
struct RawSyscallRegs {
    id: u64,
    a1: u64,
    a2: u64,
    a3: u64,
    a4: u64,
    a5: u64,
    a6: u64,
}

/// Called from the naked entry trampoline; `regs` points at the pushed
/// [`RawSyscallRegs`] block on the (now kernel) stack.
extern "C" fn dispatch_from_asm(regs: *const RawSyscallRegs) -> i64 {
    // SAFETY: `regs` was just constructed by `entry_trampoline` via seven
    // `push`es of exactly this shape, still on the stack and in scope.
    let regs = unsafe { &*regs };
    dispatch(
        regs.id,
        SyscallArgs {
            a1: regs.a1,
            a2: regs.a2,
            a3: regs.a3,
            a4: regs.a4,
            a5: regs.a5,
            a6: regs.a6,
        },
    )
}

/// Program `STAR`/`LSTAR`/`FMASK` and set `EFER.SCE` so that user-mode
/// `syscall` instructions land in [`entry_trampoline`].
pub fn init() {
    let kernel_cs = gdt::kernel_code_selector().0;
    // STAR[47:32] = kernel CS (SS = kernel_cs+8 on entry);
    // STAR[63:48] = user CS base (CS = base+16, SS = base+8 on sysretq,
    // per the Intel-documented `sysret` selector arithmetic).
    let star = (u64::from(kernel_cs) << 32) | (u64::from(gdt::user_data_selector().0 - 8) << 48);
    // SAFETY: writing STAR/LSTAR/FMASK only takes effect on the next
    // `syscall` instruction; no currently running code is affected.
    unsafe {
        Msr::new(MSR_STAR).write(star);
        Msr::new(MSR_LSTAR).write(entry_trampoline as u64);
        Msr::new(MSR_FMASK).write(RFlags::INTERRUPT_FLAG.bits());
        Efer::update(|flags| flags.insert(EferFlags::SYSTEM_CALL_EXTENSIONS));
    }
}

/// Naked entry point loaded into `LSTAR`. On entry: `rcx` holds the return
/// `RIP`, `r11` holds the caller's `RFLAGS`, and the stack is still the
/// user stack. We `swapgs` to pick up the cached kernel stack, switch to
/// it, save every general-purpose register, dispatch, restore, and
/// `sysretq` back to user mode.
#[unsafe(naked)]
extern "C" fn entry_trampoline() {
    // SAFETY: this is the MSR-installed `syscall` target; the register
    // layout on entry is exactly as documented by the `syscall`
    // instruction, and every push/pop below is paired.
    unsafe {
        naked_asm!(
            "swapgs",
            // `gs:[0]` is PerCpuScratch.user_rsp, `gs:[8]` is .kernel_stack_top.
            "mov gs:[0], rsp",
            "mov rsp, gs:[8]",
            "push rcx", // user return RIP
            "push r11", // user RFLAGS
            "push rbp",
            "push rbx",
            "push r12",
            "push r13",
            "push r14",
            "push r15",
            // Build a RawSyscallRegs{id, a1..a6} block below the callee-saved
            // context, lowest field first. `syscall` delivers the syscall
            // number in rax, the 4th argument in r10 (rcx is clobbered by
            // the instruction itself), and the rest in the usual Linux
            // syscall slots rdi,rsi,rdx,r8,r9.
            "push r9",
            "push r8",
            "push r10",
            "push rdx",
            "push rsi",
            "push rdi",
            "push rax",
            "mov rdi, rsp",
            "call {dispatch}",
            "add rsp, 56", // discard the RawSyscallRegs block
            "pop r15",
            "pop r14",
            "pop r13",
            "pop r12",
            "pop rbx",
            "pop rbp",
            "pop r11",
            "pop rcx",
            "mov rsp, gs:[0]",
            "swapgs",
            "sysretq",
            dispatch = sym dispatch_from_asm,
        );
    }
}
