//! Interrupt/IRQ dispatch (C6).
//!
//! Vectors 0..31 are exceptions (an optional handler each); vectors 32..255
//! are IRQs, each line holding an ordered list of handlers tried in
//! insertion order until one reports [`IrqResult::Handled`].

use alloc::{string::String, vec::Vec};

use lazy_static::lazy_static;
use log::{error, trace, warn};
use spin::Mutex;
use x86_64::{
    set_general_handler,
    structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode},
};

use crate::cpu::gdt;

/// First vector after the 32 CPU exception vectors.
pub const IRQ_BASE: u8 = 32;

/// Outcome of a single handler's attempt to service an IRQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqResult {
    /// This handler serviced the interrupt; stop trying further handlers.
    Handled,
    /// This handler did not recognize the interrupt; try the next one.
    Pending,
}

/// A driver capability for a Programmable Interrupt Controller.
///
/// The core depends only on this contract (spec.md §4.5); concrete PIC
/// hardware drivers (e.g. an 8259-based one) are out of scope collaborators.
pub trait PICDriver: Send {
    /// Human-readable name, for logging/diagnostics.
    fn name(&self) -> &str;
    /// Attempt to bring this PIC online. Returns `false` if not present.
    fn start(&mut self) -> bool;
    /// Unmask (enable) the given IRQ line.
    fn unmask(&mut self, line: u8);
    /// Mask (disable) the given IRQ line.
    fn mask(&mut self, line: u8);
    /// Send End-Of-Interrupt for the given IRQ line.
    fn end_of_interrupt(&mut self, line: u8);
}

struct IrqHandlerEntry {
    device_handle: u32,
    device_name: String,
    handler: fn(u8) -> IrqResult,
}

struct IrqLine {
    handlers: Vec<IrqHandlerEntry>,
    pending_count: u64,
    manual_eoi_sent: bool,
}

impl IrqLine {
    const fn new() -> Self {
        Self {
            handlers: Vec::new(),
            pending_count: 0,
            manual_eoi_sent: false,
        }
    }
}

type ExceptionHandler = fn(u8);

struct Dispatch {
    exceptions: [Option<ExceptionHandler>; 32],
    irqs: Vec<IrqLine>,
    active_pic: Option<alloc::boxed::Box<dyn PICDriver>>,
}

impl Dispatch {
    const fn new() -> Self {
        Self {
            exceptions: [None; 32],
            irqs: Vec::new(),
            active_pic: None,
        }
    }
}

lazy_static! {
    static ref DISPATCH: Mutex<Dispatch> = Mutex::new(Dispatch::new());
}

/// Probe each registered PIC driver in order; the first to start successfully
/// becomes the active PIC. Returns `false` if none could be started.
pub fn irq_init(drivers: Vec<alloc::boxed::Box<dyn PICDriver>>) -> bool {
    let mut dispatch = DISPATCH.lock();
    dispatch.irqs.resize_with(224, IrqLine::new);
    for mut driver in drivers {
        if driver.start() {
            trace!(target: "irq", "{} initialized as the active PIC", driver.name());
            dispatch.active_pic = Some(driver);
            return true;
        }
    }
    error!(target: "irq", "no PIC device could be detected");
    false
}

/// Install a handler for IRQ `line`. Unmasks the line on the active PIC if
/// this is the first handler installed for it.
pub fn install_irq_handler(line: u8, device_handle: u32, device_name: &str, handler: fn(u8) -> IrqResult) {
    let mut dispatch = DISPATCH.lock();
    let was_empty = dispatch.irqs[line as usize].handlers.is_empty();
    dispatch.irqs[line as usize].handlers.push(IrqHandlerEntry {
        device_handle,
        device_name: String::from(device_name),
        handler,
    });
    if was_empty {
        if let Some(pic) = dispatch.active_pic.as_mut() {
            pic.unmask(line);
        }
    }
}

/// Uninstall `device_handle`'s handler for IRQ `line`. Masks the line on the
/// active PIC if this was the last handler.
pub fn uninstall_irq_handler(line: u8, device_handle: u32) {
    let mut dispatch = DISPATCH.lock();
    dispatch.irqs[line as usize]
        .handlers
        .retain(|e| e.device_handle != device_handle);
    if dispatch.irqs[line as usize].handlers.is_empty() {
        if let Some(pic) = dispatch.active_pic.as_mut() {
            pic.mask(line);
        }
    }
}

/// Mark that the currently dispatching handler already sent EOI manually, so
/// the dispatcher does not send a second one.
pub fn mark_manual_eoi(line: u8) {
    DISPATCH.lock().irqs[line as usize].manual_eoi_sent = true;
}

/// Install an exception handler for vector `vector` (0..32).
pub fn install_exception_handler(vector: u8, handler: ExceptionHandler) {
    DISPATCH.lock().exceptions[vector as usize] = Some(handler);
}

/// Dispatch vector `vector` (32..256) to its IRQ line's handler list.
pub fn dispatch_irq(vector: u8) {
    let line = vector - IRQ_BASE;
    let mut dispatch = DISPATCH.lock();
    dispatch.irqs[line as usize].manual_eoi_sent = false;

    let mut handled = false;
    // Cloning function pointers (Copy) avoids holding the lock across handler calls.
    let handlers: Vec<fn(u8) -> IrqResult> = dispatch.irqs[line as usize]
        .handlers
        .iter()
        .map(|e| e.handler)
        .collect();
    drop(dispatch);

    for handler in handlers {
        if handler(line) == IrqResult::Handled {
            handled = true;
            break;
        }
    }

    let mut dispatch = DISPATCH.lock();
    if !handled {
        dispatch.irqs[line as usize].pending_count += 1;
    }
    if !dispatch.irqs[line as usize].manual_eoi_sent {
        if let Some(pic) = dispatch.active_pic.as_mut() {
            pic.end_of_interrupt(line);
        }
    }
}

/// Dispatch exception `vector` (0..32) to its installed handler, if any. An
/// unhandled exception is fatal: dump state and halt forever.
pub fn dispatch_exception(vector: u8) {
    let handler = DISPATCH.lock().exceptions[vector as usize];
    match handler {
        Some(h) => h(vector),
        None => {
            error!(target: "idt", "unhandled exception vector {vector}, halting");
            crate::hlt_loop();
        }
    }
}

lazy_static! {
    static ref IDT: InterruptDescriptorTable = build_idt();
}

fn build_idt() -> InterruptDescriptorTable {
    let mut idt = InterruptDescriptorTable::new();
    // `set_general_handler!` generates the 256 ISR stubs (vector push + jump
    // to a shared trampoline) that spec.md §4.5 calls for; we then overlay
    // the two vectors that need their own dedicated stack.
    set_general_handler!(&mut idt, exception_trampoline, 0..IRQ_BASE);
    set_general_handler!(&mut idt, irq_trampoline, IRQ_BASE..=255);

    idt.breakpoint.set_handler_fn(breakpoint_handler);
    // SAFETY: the double-fault IST index is a valid, dedicated stack set up in `gdt::init`.
    unsafe {
        idt.double_fault
            .set_handler_fn(double_fault_handler)
            .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
        idt.page_fault
            .set_handler_fn(page_fault_handler)
            .set_stack_index(gdt::PAGE_FAULT_IST_INDEX);
    }
    idt
}

fn exception_trampoline(_stack_frame: InterruptStackFrame, index: u8, _error_code: Option<u64>) {
    dispatch_exception(index);
}

fn irq_trampoline(_stack_frame: InterruptStackFrame, index: u8, _error_code: Option<u64>) {
    dispatch_irq(index);
}

/// Load the IDT. Must run after [`gdt::init`] (double-fault IST depends on the TSS).
pub fn init_idt() {
    IDT.load();
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    warn!(target: "idt", "breakpoint\n{stack_frame:#?}");
}

extern "x86-interrupt" fn double_fault_handler(stack_frame: InterruptStackFrame, _error_code: u64) -> ! {
    error!(target: "idt", "double fault\n{stack_frame:#?}");
    panic!("double fault");
}

extern "x86-interrupt" fn page_fault_handler(stack_frame: InterruptStackFrame, error_code: PageFaultErrorCode) {
    // Delegate to the installed application-level handler if one exists
    // (the App manager installs one that kills only the faulting app); an
    // unhandled page fault is fatal per spec.md §7.
    let handled = crate::app::handle_page_fault(error_code.bits());
    if !handled {
        error!(target: "idt", "unhandled page fault\n{stack_frame:#?}\nerror={error_code:?}");
        crate::hlt_loop();
    }
}
