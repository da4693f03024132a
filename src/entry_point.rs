//! Kernel entry point: hands a `BootInfo` from the bootloader crate to
//! [`rune_kernel::init`], bootstraps the scheduler's three special threads,
//! installs the App manager, and hands off to the system loader.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(rune_kernel::test_runner)]
#![reexport_test_harness_main = "test_main"]

use bootloader::{bootinfo::BootInfo, entry_point};
use core::panic::PanicInfo;
use log::info;
use rune_kernel::{
    app,
    config::{DEFAULT_QUANTUM_TICKS, KERNEL_STACK_SIZE},
    cpu::scheduler::{self, SchedulingPolicy, StackRegion},
    hlt_loop,
    memory::{frame::FrameAllocator, paging::PageFlags},
};
use x86_64::VirtAddr;

entry_point!(kernel_main);

/// Base of the idle thread's dedicated kernel stack, carved out of an
/// otherwise-unused slice of kernel address space.
const IDLE_STACK_BASE: u64 = 0x_5555_5555_0000;
/// Base of the terminator thread's dedicated kernel stack.
const TERMINATOR_STACK_BASE: u64 = 0x_5555_5556_0000;

fn kernel_main(boot_info: &'static BootInfo) -> ! {
    // SAFETY: called exactly once, as early as possible, with the
    // bootloader-supplied `BootInfo`.
    let mut ctx = unsafe { rune_kernel::init(boot_info) };

    let idle_stack = map_kernel_stack(IDLE_STACK_BASE, &mut ctx.frame_alloc, ctx.base_page_table);
    let terminator_stack = map_kernel_stack(TERMINATOR_STACK_BASE, &mut ctx.frame_alloc, ctx.base_page_table);
    let main_stack = StackRegion {
        bottom: VirtAddr::new(0),
        top: VirtAddr::new(0),
        size: 0,
    };

    let idle = scheduler::schedule_new_thread(
        "idle",
        SchedulingPolicy::Normal,
        None,
        ctx.base_page_table,
        idle_stack,
        None,
        None,
        u32::MAX,
    );
    let terminator = scheduler::schedule_new_thread(
        "terminator",
        SchedulingPolicy::LowLatency,
        None,
        ctx.base_page_table,
        terminator_stack,
        None,
        None,
        u32::MAX,
    );
    let main = scheduler::schedule_new_thread(
        "main",
        SchedulingPolicy::Normal,
        None,
        ctx.base_page_table,
        main_stack,
        None,
        None,
        DEFAULT_QUANTUM_TICKS,
    );
    scheduler::register_special_threads(idle, terminator, main);

    app::install_kernel_app(idle, terminator, main);
    app::install_memory_manager(ctx.vmm, ctx.frame_alloc);
    app::install_event_hooks();

    info!(target: "boot", "kernel core initialized, entering idle loop");

    #[cfg(test)]
    test_main();

    hlt_loop();
}

/// Map a fresh [`KERNEL_STACK_SIZE`]-byte kernel stack starting at `base`,
/// returning its bounds. Used for the idle and terminator threads, which
/// (unlike the boot thread) have no stack of their own yet.
fn map_kernel_stack(
    base: u64,
    frame_alloc: &mut dyn FrameAllocator,
    base_page_table: x86_64::PhysAddr,
) -> StackRegion {
    let page_count = (KERNEL_STACK_SIZE as u64).div_ceil(4096);
    let bottom = VirtAddr::new(base);

    for i in 0..page_count {
        let frame = frame_alloc
            .allocate_frame()
            .unwrap_or_else(|| panic!("out of physical memory mapping a kernel stack"));
        rune_kernel::memory::paging::allocate_page(
            base_page_table,
            bottom + i * 4096,
            frame.start_address(),
            PageFlags::PRESENT | PageFlags::WRITABLE,
            frame_alloc,
        )
        .unwrap_or_else(|_| panic!("failed to map kernel stack page"));
    }

    StackRegion {
        bottom,
        top: bottom + KERNEL_STACK_SIZE as u64,
        size: KERNEL_STACK_SIZE as u64,
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    use rune_kernel::serial_println;
    serial_println!("KERNEL PANIC: {info}");
    hlt_loop();
}

#[cfg(test)]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    rune_kernel::test_panic_handler(info);
}
