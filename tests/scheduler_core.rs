//! Integration test for the preemptive scheduler's thread lifecycle,
//! exercised against a fully booted kernel rather than in isolation.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(rune_kernel::test_runner)]
#![reexport_test_harness_main = "test_main"]
#![allow(missing_docs)]

extern crate alloc;

use bootloader::{bootinfo::BootInfo, entry_point};
use core::panic::PanicInfo;
use rune_kernel::cpu::scheduler::{self, SchedulingPolicy, StackRegion};
use x86_64::VirtAddr;

entry_point!(test_kernel_main);

fn test_kernel_main(boot_info: &'static BootInfo) -> ! {
    // SAFETY: called exactly once, as early as possible, with the
    // bootloader-supplied `BootInfo`.
    let _ctx = unsafe { rune_kernel::init(boot_info) };

    test_main();

    rune_kernel::hlt_loop();
}

fn dummy_stack(base: u64) -> StackRegion {
    StackRegion {
        bottom: VirtAddr::new(base),
        top: VirtAddr::new(base + 4096),
        size: 4096,
    }
}

/// Registering the three boot threads must make the main thread the one
/// reported as currently running.
#[test_case]
fn registering_special_threads_makes_main_the_running_thread() {
    let base_pt = x86_64::registers::control::Cr3::read().0.start_address();

    let idle = scheduler::schedule_new_thread(
        "test-idle",
        SchedulingPolicy::Normal,
        None,
        base_pt,
        dummy_stack(0x_6000_0000_0000),
        None,
        None,
        u32::MAX,
    );
    let terminator = scheduler::schedule_new_thread(
        "test-terminator",
        SchedulingPolicy::LowLatency,
        None,
        base_pt,
        dummy_stack(0x_6000_0001_0000),
        None,
        None,
        u32::MAX,
    );
    let main = scheduler::schedule_new_thread(
        "test-main",
        SchedulingPolicy::Normal,
        None,
        base_pt,
        dummy_stack(0x_6000_0002_0000),
        None,
        None,
        10,
    );

    scheduler::register_special_threads(idle, terminator, main);

    assert_eq!(scheduler::running_thread(), Some(main));
}

/// A freshly scheduled, not-yet-running thread can be terminated directly
/// and is then handed to the terminator via `next_terminated`.
#[test_case]
fn a_ready_thread_can_be_terminated_before_it_ever_runs() {
    let base_pt = x86_64::registers::control::Cr3::read().0.start_address();

    let worker = scheduler::schedule_new_thread(
        "test-worker",
        SchedulingPolicy::Normal,
        None,
        base_pt,
        dummy_stack(0x_6000_0003_0000),
        None,
        None,
        10,
    );

    assert!(scheduler::terminate_thread(worker));

    let mut found = false;
    while let Some(handle) = scheduler::next_terminated() {
        if handle == worker {
            found = true;
        }
        scheduler::retire(handle);
    }
    assert!(found, "terminated worker thread should surface via next_terminated");
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    rune_kernel::test_panic_handler(info)
}
