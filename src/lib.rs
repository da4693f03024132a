//! Self-hosted x86_64 kernel core.
//!
//! Bring-up order (see [`init`]): paging and the frame allocator, the
//! general-purpose heap, GDT/IDT/IRQ/timer, and the syscall MSRs. The
//! scheduler bootstrap and App manager installation are the entry point's
//! job, since they need the boot thread's own stack bounds. See
//! `DESIGN.md` for how each part is grounded and why.

#![no_std]
#![cfg_attr(test, no_main)]
#![feature(custom_test_frameworks)]
#![feature(abi_x86_interrupt)]
#![test_runner(crate::test_runner)]
#![reexport_test_harness_main = "test_main"]

extern crate alloc;

use core::panic::PanicInfo;

use bootloader::bootinfo::BootInfo;
use x86_64::{PhysAddr, VirtAddr};

pub mod allocator;
pub mod app;
pub mod config;
pub mod cpu;
pub mod elf;
pub mod events;
pub mod log_sink;
pub mod memory;
pub mod serial;
pub mod syscall;
pub mod vfs;
pub mod vga_buffer;

use memory::{frame::BootInfoFrameAllocator, vmm::VirtualMemoryManager};

const QEMU_EXIT_PORT: u16 = 0xf4;

/// Test entry point for cargo test.
#[cfg(test)]
#[unsafe(no_mangle)]
pub extern "C" fn _start() -> ! {
    test_main();
    hlt_loop();
}

/// Define possible exit code for qemu.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    /// Define a successfull exit status
    Success = 0x10,
    /// Define a failure exit status
    Failure = 0x11,
}

/// Exit qemu with a specific exit code.
/// Connect to an IO Port to exit qemu.
/// Configuration for the exit port is in the config.toml file.
pub fn exit_qemu(exit_code: QemuExitCode) {
    use x86_64::instructions::port::Port;

    // SAFETY: the isa-debug-exit device is wired to `QEMU_EXIT_PORT` by the
    // bootimage test harness; writing to it is the documented way to exit.
    unsafe {
        let mut port = Port::new(QEMU_EXIT_PORT);
        port.write(exit_code as u32);
    }
}

/// Panic handler for external (functional) tests.
pub fn test_panic_handler(info: &PanicInfo) -> ! {
    serial_println!("[failed]\n");
    serial_println!("Error: {}\n", info);
    exit_qemu(QemuExitCode::Failure);

    #[expect(
        clippy::empty_loop,
        reason = "Endless loop if a test panics. It should not be possible as we exit_qemu before."
    )]
    loop {}
}

/// Custom test runner for `no_std` testing.
pub fn test_runner(tests: &[&dyn Testable]) {
    println!("Running {} tests", tests.len());
    for test in tests {
        test.run();
    }

    exit_qemu(QemuExitCode::Success);
}

/// Panic handler for unit tests.
#[cfg(test)]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    serial_println!("[failed]\n");
    serial_println!("Error: {}\n", info);
    exit_qemu(QemuExitCode::Failure);
    loop {}
}

/// Trait to generalize tests cases.
/// Encapsulate the prints
pub trait Testable {
    /// Function that encapsulate the test run function.
    fn run(&self);
}

impl<T> Testable for T
where
    T: Fn(),
{
    fn run(&self) {
        use core::any::type_name;

        serial_print!("{}...\t", type_name::<T>());
        self();
        serial_println!("[ok]");
    }
}

/// Spin forever with interrupts enabled, waiting for the next interrupt.
/// Used by the idle thread and as the tail of every entry point.
pub fn hlt_loop() -> ! {
    loop {
        x86_64::instructions::hlt();
    }
}

/// Result of [`init`]: everything the entry point needs to bootstrap the
/// scheduler and load the system loader.
pub struct BootContext {
    /// The virtual memory manager, constructed from the boot memory map.
    pub vmm: VirtualMemoryManager,
    /// The physical frame allocator, seeded from the boot memory map's
    /// usable regions.
    pub frame_alloc: BootInfoFrameAllocator,
    /// Physical address of the boot-time level-4 page table (the kernel's
    /// own address space).
    pub base_page_table: PhysAddr,
}

/// Bring up logging, paging, the frame allocator, the kernel heap, every
/// CPU subsystem (GDT/IDT/IRQ/timer), and the syscall transport, in that
/// order. Returns the pieces the entry point needs to bootstrap the
/// scheduler's special threads and hand off to the App manager.
///
/// # Safety
/// Must be called exactly once, as early as possible, with a `boot_info`
/// supplied by the bootloader crate this kernel was linked against.
pub unsafe fn init(boot_info: &'static BootInfo) -> BootContext {
    log_sink::init();

    let phys_mem_offset = VirtAddr::new(boot_info.physical_memory_offset);
    // SAFETY: forwarded from caller; the bootloader guarantees the full
    // physical address space is mapped starting at `phys_mem_offset`.
    unsafe {
        memory::init(phys_mem_offset);
    }
    // SAFETY: forwarded from caller; the bootloader's `Usable` regions are
    // guaranteed free for the kernel to claim.
    let mut frame_alloc = unsafe { memory::frame_allocator(&boot_info.memory_map) };

    let base_page_table = x86_64::registers::control::Cr3::read().0.start_address();

    let layout = memory::vmm::KernelSpaceLayout {
        kernel_code: memory::vmm::MemoryRegion {
            start: 0,
            size: 0,
            region_type: memory::vmm::RegionType::KernelCode,
        },
        kernel_heap: memory::vmm::MemoryRegion {
            start: config::HEAP_START as u64,
            size: config::HEAP_SIZE as u64,
            region_type: memory::vmm::RegionType::KernelHeap,
        },
        higher_half_direct_map: phys_mem_offset,
    };
    let vmm = VirtualMemoryManager::new(layout);

    allocator::init_heap(base_page_table, &mut frame_alloc)
        .unwrap_or_else(|()| panic!("kernel heap initialization failed"));

    cpu::init();
    syscall::init();

    BootContext {
        vmm,
        frame_alloc,
        base_page_table,
    }
}
