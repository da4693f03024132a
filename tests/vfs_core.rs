//! Integration test for the VFS core, exercised against a fully booted
//! kernel with a trivial in-memory driver registered and mounted at `/`.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(rune_kernel::test_runner)]
#![reexport_test_harness_main = "test_main"]
#![allow(missing_docs)]

extern crate alloc;

use alloc::{boxed::Box, collections::BTreeMap, string::{String, ToString}, vec::Vec};
use bootloader::{bootinfo::BootInfo, entry_point};
use core::panic::PanicInfo;
use rune_kernel::vfs::{
    self,
    driver::{Driver, DriverDirStream, DriverNode, FormatStatus, IOStatus, MountStatus, NodeAttributes, NodeInfo, OnClose, OpenMode},
};

entry_point!(test_kernel_main);

fn test_kernel_main(boot_info: &'static BootInfo) -> ! {
    // SAFETY: called exactly once, as early as possible, with the
    // bootloader-supplied `BootInfo`.
    let _ctx = unsafe { rune_kernel::init(boot_info) };

    vfs::register_driver("memfs-integration", Box::new(MemDriver::new()));
    vfs::mount("/", "memfs-integration", 0);

    test_main();

    rune_kernel::hlt_loop();
}

struct MemDriver {
    files: BTreeMap<String, Vec<u8>>,
}

impl MemDriver {
    fn new() -> Self {
        Self { files: BTreeMap::new() }
    }
}

impl Driver for MemDriver {
    fn name(&self) -> &str {
        "memfs-integration"
    }

    fn format(&mut self, _device: u64) -> FormatStatus {
        FormatStatus::Ok
    }

    fn mount(&mut self, _device: u64) -> MountStatus {
        MountStatus::Ok
    }

    fn unmount(&mut self, _device: u64) -> MountStatus {
        MountStatus::Ok
    }

    fn is_valid_file_path(&self, _relative: &str) -> bool {
        true
    }

    fn create(&mut self, _device: u64, relative: &str, _attrs: NodeAttributes) -> IOStatus {
        if self.files.contains_key(relative) {
            return IOStatus::AlreadyExists;
        }
        self.files.insert(relative.to_string(), Vec::new());
        IOStatus::Ok
    }

    fn open(
        &mut self,
        _device: u64,
        relative: &str,
        _mode: OpenMode,
        _on_close: OnClose,
    ) -> Result<DriverNode, IOStatus> {
        if self.files.contains_key(relative) {
            Ok(DriverNode { private: Box::new(()) })
        } else {
            Err(IOStatus::NotFound)
        }
    }

    fn find_node(&mut self, _device: u64, relative: &str) -> Result<NodeInfo, IOStatus> {
        if self.files.contains_key(relative) {
            Ok(NodeInfo {
                name: relative.to_string(),
                attributes: NodeAttributes::FILE,
                size: 0,
            })
        } else {
            Err(IOStatus::NotFound)
        }
    }

    fn delete_node(&mut self, _device: u64, relative: &str) -> IOStatus {
        if self.files.remove(relative).is_some() {
            IOStatus::Ok
        } else {
            IOStatus::NotFound
        }
    }

    fn open_directory_stream(
        &mut self,
        _device: u64,
        _relative: &str,
        _on_close: OnClose,
    ) -> Result<DriverDirStream, IOStatus> {
        Ok(DriverDirStream { private: Box::new(()) })
    }
}

#[test_case]
fn create_then_open_then_close_round_trips() {
    assert_eq!(vfs::create("/greeting.txt", NodeAttributes::FILE), IOStatus::Ok);
    let handle = vfs::open("/greeting.txt", OpenMode::Read).expect("open should succeed");
    assert!(vfs::close(handle));
}

#[test_case]
fn deleting_a_node_with_no_open_references_runs_immediately() {
    assert_eq!(vfs::create("/throwaway.txt", NodeAttributes::FILE), IOStatus::Ok);
    assert_eq!(vfs::delete_node("/throwaway.txt"), IOStatus::Ok);
    assert!(vfs::find_node("/throwaway.txt").is_err());
}

#[test_case]
fn the_root_mount_cannot_be_created_over() {
    assert_eq!(vfs::create("/", NodeAttributes::DIRECTORY), IOStatus::Found);
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    rune_kernel::test_panic_handler(info)
}
