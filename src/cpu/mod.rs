//! CPU-facing subsystems: GDT/TSS (C5), interrupt/IRQ dispatch (C6), the
//! scheduler (C7), kernel mutex (C8), and the periodic timer (C9).

pub mod context;
pub mod gdt;
pub mod idt;
pub mod mutex;
pub mod pic;
pub mod scheduler;
pub mod timer;

use alloc::{boxed::Box, vec};

/// Bring up every CPU subsystem in dependency order: GDT/TSS, then the IDT
/// (whose double-fault gate needs the TSS's IST), then the legacy PIC, then
/// the timer, then interrupts are finally enabled.
pub fn init() {
    gdt::init();
    idt::init_idt();
    idt::irq_init(vec![Box::new(pic::Pic8259Driver::new())]);
    context::init_per_cpu_scratch();
    timer::init();
    x86_64::instructions::interrupts::enable();
}
