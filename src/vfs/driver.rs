//! The contract the VFS core depends on (spec.md §4.10): everything the
//! core needs from a concrete filesystem driver, and nothing more.

use alloc::{boxed::Box, string::String};

use bitflags::bitflags;

bitflags! {
    /// Attribute flags a node can be created or reported with.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeAttributes: u32 {
        /// A regular file.
        const FILE = 1 << 0;
        /// A directory.
        const DIRECTORY = 1 << 1;
        /// Read-only; writes are rejected by the driver.
        const READONLY = 1 << 2;
        /// Hidden from ordinary directory listings.
        const HIDDEN = 1 << 3;
        /// Owned by the system, not meant for user deletion.
        const SYSTEM = 1 << 4;
    }
}

/// The mode a node is opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read-only.
    Read,
    /// Write-only, truncating existing content.
    Write,
    /// Read and write without truncation.
    ReadWrite,
    /// Write, appending past the current end.
    Append,
}

/// Per-operation failure reported by a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IOStatus {
    /// Operation succeeded.
    Ok,
    /// No such path.
    NotFound,
    /// Path already exists.
    AlreadyExists,
    /// Caller is not permitted to perform this operation.
    AccessDenied,
    /// The node-handle counter is exhausted.
    OutOfHandles,
    /// The underlying storage device reported an error.
    Io,
    /// Expected a directory, found a file (or vice versa).
    WrongNodeType,
    /// The path syntax is not valid for this driver.
    InvalidPath,
    /// The target is already a mount point.
    Found,
}

/// Result of mounting or unmounting a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountStatus {
    /// Operation succeeded.
    Ok,
    /// The device does not contain a filesystem this driver recognizes.
    NotFormatted,
    /// The underlying storage device reported an error.
    Io,
}

/// Result of formatting a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatStatus {
    /// Operation succeeded.
    Ok,
    /// The underlying storage device reported an error.
    Io,
}

/// Metadata about a node, as returned by `find_node`.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    /// Node name (final path component).
    pub name: String,
    /// Attribute flags.
    pub attributes: NodeAttributes,
    /// Size in bytes (0 for directories).
    pub size: u64,
}

/// A driver's private handle to an open node. Opaque to the VFS core.
pub struct DriverNode {
    /// Driver-private state, boxed so drivers can store arbitrary data.
    pub private: Box<dyn core::any::Any + Send>,
}

/// A driver's private iterator over directory entries.
pub struct DriverDirStream {
    /// Driver-private state.
    pub private: Box<dyn core::any::Any + Send>,
}

/// Called when the VFS core drops the last reference to a node, so the
/// driver can flush/release any resources it holds for it.
pub type OnClose = Box<dyn FnOnce() + Send>;

/// The capability contract a concrete filesystem driver implements. The
/// VFS core depends only on this trait (spec.md §4.10).
pub trait Driver: Send {
    /// This driver's registered name (e.g. `"fat32"`, `"devfs"`).
    fn name(&self) -> &str;

    /// Write a fresh, empty filesystem onto `device`.
    fn format(&mut self, device: u64) -> FormatStatus;

    /// Bring `device` online for this driver.
    fn mount(&mut self, device: u64) -> MountStatus;

    /// Take `device` back offline.
    fn unmount(&mut self, device: u64) -> MountStatus;

    /// Whether `relative` is syntactically acceptable to this driver.
    fn is_valid_file_path(&self, relative: &str) -> bool;

    /// Create a node at `relative` with the given attributes.
    fn create(&mut self, device: u64, relative: &str, attrs: NodeAttributes) -> IOStatus;

    /// Open the node at `relative`. `on_close` is invoked exactly once,
    /// when the VFS core's last reference to the returned node is dropped.
    fn open(
        &mut self,
        device: u64,
        relative: &str,
        mode: OpenMode,
        on_close: OnClose,
    ) -> Result<DriverNode, IOStatus>;

    /// Look up metadata for `relative` without opening it.
    fn find_node(&mut self, device: u64, relative: &str) -> Result<NodeInfo, IOStatus>;

    /// Remove the node at `relative`.
    fn delete_node(&mut self, device: u64, relative: &str) -> IOStatus;

    /// Open a directory-entry iterator for `relative`.
    fn open_directory_stream(
        &mut self,
        device: u64,
        relative: &str,
        on_close: OnClose,
    ) -> Result<DriverDirStream, IOStatus>;
}
