//! Integration test for the syscall transport's handler table.
//!
//! Actually crossing into Ring 3 needs a real embedded user binary, which
//! this crate does not carry; that exercise belongs to whatever loads an
//! init program on top of this kernel core. This test instead boots the
//! kernel fully (paging, heap, GDT/IDT, MSRs) and verifies that syscall
//! handlers can be installed and removed without disturbing the rest of
//! the system.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(rune_kernel::test_runner)]
#![reexport_test_harness_main = "test_main"]
#![allow(missing_docs)]

extern crate alloc;

use bootloader::{bootinfo::BootInfo, entry_point};
use core::panic::PanicInfo;
use rune_kernel::syscall::{self, SyscallArgs};

entry_point!(test_kernel_main);

fn test_kernel_main(boot_info: &'static BootInfo) -> ! {
    // SAFETY: called exactly once, as early as possible, with the
    // bootloader-supplied `BootInfo`.
    let _ctx = unsafe { rune_kernel::init(boot_info) };

    test_main();

    rune_kernel::hlt_loop();
}

fn echo_handler(args: SyscallArgs) -> i64 {
    args.a1 as i64
}

/// Installing and removing a syscall handler should not panic or disturb
/// the kernel's own boot sequence, which has already completed by the time
/// this test runs.
#[test_case]
fn test_syscall_handler_table_accepts_install_and_uninstall() {
    const TEST_SYSCALL_ID: u64 = 0xF00D;

    syscall::install_handler(TEST_SYSCALL_ID, echo_handler);
    syscall::uninstall_handler(TEST_SYSCALL_ID);
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    rune_kernel::test_panic_handler(info)
}
