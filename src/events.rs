//! Cross-module event hooks (spec.md §4.12/§4.13): the scheduler and VFS
//! fire these; the App manager is the sole subscriber, registered once at
//! boot. Keeping the hook surface here (instead of having `cpu`/`vfs` call
//! into `app` directly) avoids a dependency cycle between the three.

use spin::Mutex;

type ThreadEventHandler = fn(u64);
type NodeEventHandler = fn(&str);

struct Hooks {
    thread_created: Option<ThreadEventHandler>,
    thread_terminated: Option<ThreadEventHandler>,
    context_switch: Option<ThreadEventHandler>,
    node_opened: Option<NodeEventHandler>,
    node_closed: Option<NodeEventHandler>,
}

static HOOKS: Mutex<Hooks> = Mutex::new(Hooks {
    thread_created: None,
    thread_terminated: None,
    context_switch: None,
    node_opened: None,
    node_closed: None,
});

/// Register the App manager's callbacks. Replaces any previously installed
/// callbacks; intended to be called exactly once, at boot.
pub fn install(
    thread_created: ThreadEventHandler,
    thread_terminated: ThreadEventHandler,
    context_switch: ThreadEventHandler,
    node_opened: NodeEventHandler,
    node_closed: NodeEventHandler,
) {
    let mut hooks = HOOKS.lock();
    hooks.thread_created = Some(thread_created);
    hooks.thread_terminated = Some(thread_terminated);
    hooks.context_switch = Some(context_switch);
    hooks.node_opened = Some(node_opened);
    hooks.node_closed = Some(node_closed);
}

pub(crate) fn fire_thread_created(handle: u64) {
    if let Some(f) = HOOKS.lock().thread_created {
        f(handle);
    }
}

pub(crate) fn fire_thread_terminated(handle: u64) {
    if let Some(f) = HOOKS.lock().thread_terminated {
        f(handle);
    }
}

pub(crate) fn fire_context_switch(handle: u64) {
    if let Some(f) = HOOKS.lock().context_switch {
        f(handle);
    }
}

pub(crate) fn fire_node_opened(path: &str) {
    if let Some(f) = HOOKS.lock().node_opened {
        f(path);
    }
}

pub(crate) fn fire_node_closed(path: &str) {
    if let Some(f) = HOOKS.lock().node_closed {
        f(path);
    }
}
