//! Virtual filesystem core (C11): a driver table, mount-point table,
//! node-ref-count table, open-node table, and directory-stream table, tied
//! together by longest-prefix mount resolution and ref-counted deletion.

pub mod driver;

use alloc::{
    boxed::Box,
    collections::BTreeMap,
    string::{String, ToString},
    vec::Vec,
};

use log::trace;
use spin::Mutex;

use driver::{Driver, DriverDirStream, DriverNode, IOStatus, NodeAttributes, NodeInfo, OnClose, OpenMode};

/// Opaque handle to an open node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct NodeHandle(u64);

/// Opaque handle to an open directory stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DirStreamHandle(u64);

/// A registered mount: `absolute path -> (driver, device)`.
struct MountPoint {
    driver_name: String,
    storage_device_id: u64,
}

/// Tracks how many open nodes currently reference a path, and whether a
/// delete was requested while references remained.
struct NodeRefCount {
    ref_count: u64,
    delete_pending: bool,
}

/// An open node as seen by VFS clients.
pub struct Node {
    /// This node's handle.
    pub handle: NodeHandle,
    /// Absolute path this node was opened from.
    pub absolute_path: String,
    /// Mode it was opened with.
    pub io_mode: OpenMode,
    driver_node: DriverNode,
    on_close: Option<OnClose>,
}

/// An open directory-entry iterator as seen by VFS clients.
pub struct DirectoryStream {
    /// This stream's handle.
    pub handle: DirStreamHandle,
    /// Absolute path this stream was opened from.
    pub absolute_path: String,
    driver_stream: DriverDirStream,
}

struct HandleCounter {
    next: u64,
}

impl HandleCounter {
    const fn new() -> Self {
        Self { next: 1 }
    }

    fn has_more(&self) -> bool {
        self.next != u64::MAX
    }

    fn take(&mut self) -> Option<u64> {
        if !self.has_more() {
            return None;
        }
        let h = self.next;
        self.next += 1;
        Some(h)
    }
}

struct Inner {
    drivers: BTreeMap<String, Box<dyn Driver>>,
    mounts: BTreeMap<String, MountPoint>,
    ref_counts: BTreeMap<String, NodeRefCount>,
    open_nodes: BTreeMap<NodeHandle, Node>,
    dir_streams: BTreeMap<DirStreamHandle, DirectoryStream>,
    node_handles: HandleCounter,
    stream_handles: HandleCounter,
}

impl Inner {
    const fn new() -> Self {
        Self {
            drivers: BTreeMap::new(),
            mounts: BTreeMap::new(),
            ref_counts: BTreeMap::new(),
            open_nodes: BTreeMap::new(),
            dir_streams: BTreeMap::new(),
            node_handles: HandleCounter::new(),
            stream_handles: HandleCounter::new(),
        }
    }

    /// Longest-prefix mount resolution: among every registered mount path
    /// that is a component-wise prefix of `path`, pick the longest. The root
    /// is always mounted, so this never fails once `register_driver`/
    /// `mount_root` have run.
    fn resolve(&self, path: &str) -> Option<(&str, &MountPoint)> {
        self.mounts
            .iter()
            .filter(|(mount_path, _)| is_mount_prefix(mount_path, path))
            .max_by_key(|(mount_path, _)| mount_path.len())
            .map(|(mount_path, mp)| (mount_path.as_str(), mp))
    }
}

/// Whether `mount_path` is a component-wise prefix of `path`: a raw
/// `str::starts_with` would let a mount at `/ab` match a query of `/abc`.
fn is_mount_prefix(mount_path: &str, path: &str) -> bool {
    mount_path == "/" || path == mount_path || path.strip_prefix(mount_path).is_some_and(|rest| rest.starts_with('/'))
}

static VFS: Mutex<Inner> = Mutex::new(Inner::new());

/// Register a driver implementation under `name`.
pub fn register_driver(name: &str, driver: Box<dyn Driver>) {
    VFS.lock().drivers.insert(name.to_string(), driver);
}

/// Mount `driver_name`'s filesystem on `storage_device_id` at
/// `mount_path`. The first call must mount `"/"` (spec.md §3 invariant).
pub fn mount(mount_path: &str, driver_name: &str, storage_device_id: u64) -> driver::MountStatus {
    let mut inner = VFS.lock();
    let Some(driver) = inner.drivers.get_mut(driver_name) else {
        return driver::MountStatus::Io;
    };
    let status = driver.mount(storage_device_id);
    if status == driver::MountStatus::Ok {
        inner.mounts.insert(
            mount_path.to_string(),
            MountPoint {
                driver_name: driver_name.to_string(),
                storage_device_id,
            },
        );
        trace!(target: "vfs", "mounted {driver_name} at {mount_path}");
    }
    status
}

fn relative_path<'a>(mount_path: &str, absolute: &'a str) -> &'a str {
    absolute.strip_prefix(mount_path).unwrap_or(absolute)
}

/// Create a node at `path` with the given attributes. Rejects if `path` is
/// itself a mount point (`FOUND`).
pub fn create(path: &str, attrs: NodeAttributes) -> IOStatus {
    let mut inner = VFS.lock();
    if inner.mounts.contains_key(path) {
        return IOStatus::Found;
    }
    let Some((mount_path, mp)) = inner.resolve(path) else {
        return IOStatus::NotFound;
    };
    let mount_path = mount_path.to_string();
    let driver_name = mp.driver_name.clone();
    let device = mp.storage_device_id;
    let relative = relative_path(&mount_path, path).to_string();
    let Some(driver) = inner.drivers.get_mut(&driver_name) else {
        return IOStatus::NotFound;
    };
    driver.create(device, &relative, attrs)
}

/// Open `path` in `mode`. On success, inserts the node into the open-node
/// table, bumps its ref-count (creating one at 1 if absent), and fires
/// `NODE_OPENED`.
pub fn open(path: &str, mode: OpenMode) -> Result<NodeHandle, IOStatus> {
    let mut inner = VFS.lock();
    let Some((mount_path, mp)) = inner.resolve(path) else {
        return Err(IOStatus::NotFound);
    };
    let mount_path = mount_path.to_string();
    let driver_name = mp.driver_name.clone();
    let device = mp.storage_device_id;
    let relative = relative_path(&mount_path, path).to_string();
    let path_owned = path.to_string();

    let Some(driver) = inner.drivers.get_mut(&driver_name) else {
        return Err(IOStatus::NotFound);
    };

    // The driver's closure is for its own resource bookkeeping; it must not
    // touch the ref-count table. The core's own closure (stored on `Node`,
    // run from `close`) is the sole decrementor, so `open_node count ==
    // ref_count` holds regardless of whether a driver ever calls its copy.
    let driver_on_close: OnClose = Box::new(|| {});
    let core_close_path = path_owned.clone();
    let core_on_close: OnClose = Box::new(move || on_node_closed(&core_close_path));

    match driver.open(device, &relative, mode, driver_on_close) {
        Ok(driver_node) => {
            let Some(handle_num) = inner.node_handles.take() else {
                return Err(IOStatus::OutOfHandles);
            };
            let handle = NodeHandle(handle_num);
            inner.open_nodes.insert(
                handle,
                Node {
                    handle,
                    absolute_path: path_owned.clone(),
                    io_mode: mode,
                    driver_node,
                    on_close: Some(core_on_close),
                },
            );
            inner
                .ref_counts
                .entry(path_owned.clone())
                .and_modify(|rc| rc.ref_count += 1)
                .or_insert(NodeRefCount {
                    ref_count: 1,
                    delete_pending: false,
                });
            drop(inner);
            crate::events::fire_node_opened(&path_owned);
            Ok(handle)
        }
        Err(status) => Err(status),
    }
}

/// Close an open node: removes it from the open-node table and runs its
/// `on_close`, which decrements (and possibly removes) its ref-count entry
/// and fires `NODE_CLOSED`.
pub fn close(handle: NodeHandle) -> bool {
    let node = VFS.lock().open_nodes.remove(&handle);
    match node {
        Some(mut node) => {
            if let Some(on_close) = node.on_close.take() {
                on_close();
            }
            true
        }
        None => false,
    }
}

fn on_node_closed(path: &str) {
    let mut inner = VFS.lock();
    let remove_entry = if let Some(rc) = inner.ref_counts.get_mut(path) {
        rc.ref_count = rc.ref_count.saturating_sub(1);
        rc.ref_count == 0
    } else {
        false
    };
    let deferred_delete = remove_entry
        && inner
            .ref_counts
            .get(path)
            .is_some_and(|rc| rc.delete_pending);
    if remove_entry {
        inner.ref_counts.remove(path);
    }
    drop(inner);
    crate::events::fire_node_closed(path);
    if deferred_delete {
        let _ = delete_node(path);
    }
}

/// Delete the node at `path`. If any open node has `path` as a prefix, or
/// `path` is itself a mount point, this fails with `AccessDenied`. If no
/// references remain, the delete runs immediately; otherwise it is deferred
/// until the last reference closes.
pub fn delete_node(path: &str) -> IOStatus {
    let mut inner = VFS.lock();
    if inner.mounts.contains_key(path) {
        return IOStatus::AccessDenied;
    }
    let has_open_descendant = inner
        .open_nodes
        .values()
        .any(|n| n.absolute_path.starts_with(path));
    if has_open_descendant {
        return IOStatus::AccessDenied;
    }

    let ref_count = inner.ref_counts.get(path).map_or(0, |rc| rc.ref_count);
    if ref_count > 0 {
        if let Some(rc) = inner.ref_counts.get_mut(path) {
            rc.delete_pending = true;
        }
        return IOStatus::Ok;
    }

    let Some((mount_path, mp)) = inner.resolve(path) else {
        return IOStatus::NotFound;
    };
    let mount_path = mount_path.to_string();
    let driver_name = mp.driver_name.clone();
    let device = mp.storage_device_id;
    let relative = relative_path(&mount_path, path).to_string();
    let Some(driver) = inner.drivers.get_mut(&driver_name) else {
        return IOStatus::NotFound;
    };
    driver.delete_node(device, &relative)
}

/// Look up metadata for `path` without opening it.
pub fn find_node(path: &str) -> Result<NodeInfo, IOStatus> {
    let mut inner = VFS.lock();
    let Some((mount_path, mp)) = inner.resolve(path) else {
        return Err(IOStatus::NotFound);
    };
    let mount_path = mount_path.to_string();
    let driver_name = mp.driver_name.clone();
    let device = mp.storage_device_id;
    let relative = relative_path(&mount_path, path).to_string();
    let Some(driver) = inner.drivers.get_mut(&driver_name) else {
        return Err(IOStatus::NotFound);
    };
    driver.find_node(device, &relative)
}

/// Open a directory-entry iterator for `path`.
pub fn open_directory_stream(path: &str) -> Result<DirStreamHandle, IOStatus> {
    let mut inner = VFS.lock();
    let Some(handle_num) = inner.stream_handles.take() else {
        return Err(IOStatus::OutOfHandles);
    };
    let Some((mount_path, mp)) = inner.resolve(path) else {
        return Err(IOStatus::NotFound);
    };
    let mount_path = mount_path.to_string();
    let driver_name = mp.driver_name.clone();
    let device = mp.storage_device_id;
    let relative = relative_path(&mount_path, path).to_string();
    let path_owned = path.to_string();
    let Some(driver) = inner.drivers.get_mut(&driver_name) else {
        return Err(IOStatus::NotFound);
    };
    let on_close: OnClose = Box::new(|| {});
    match driver.open_directory_stream(device, &relative, on_close) {
        Ok(driver_stream) => {
            let handle = DirStreamHandle(handle_num);
            inner.dir_streams.insert(
                handle,
                DirectoryStream {
                    handle,
                    absolute_path: path_owned,
                    driver_stream,
                },
            );
            Ok(handle)
        }
        Err(status) => Err(status),
    }
}

/// Close a directory stream.
pub fn close_directory_stream(handle: DirStreamHandle) -> bool {
    VFS.lock().dir_streams.remove(&handle).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use driver::{DriverDirStream, DriverNode, FormatStatus, MountStatus};

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
            "memfs"
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

    fn with_mounted_memfs<F: FnOnce()>(f: F) {
        register_driver("memfs-test", Box::new(MemDriver::new()));
        mount("/", "memfs-test", 0);
        f();
    }

    #[test_case]
    fn create_then_open_succeeds() {
        with_mounted_memfs(|| {
            assert_eq!(create("/hello.txt", NodeAttributes::FILE), IOStatus::Ok);
            assert!(open("/hello.txt", OpenMode::Read).is_ok());
        });
    }

    #[test_case]
    fn delete_with_open_reference_is_deferred_then_runs_on_close() {
        with_mounted_memfs(|| {
            assert_eq!(create("/deferred.txt", NodeAttributes::FILE), IOStatus::Ok);
            let handle = open("/deferred.txt", OpenMode::Read).expect("open should succeed");
            assert_eq!(delete_node("/deferred.txt"), IOStatus::Ok);
            assert!(close(handle));
            assert!(find_node("/deferred.txt").is_err());
        });
    }

    #[test_case]
    fn mount_point_itself_cannot_be_created_over() {
        with_mounted_memfs(|| {
            assert_eq!(create("/", NodeAttributes::DIRECTORY), IOStatus::Found);
        });
    }
}
