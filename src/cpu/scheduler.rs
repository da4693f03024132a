//! Preemptive scheduler (C7): thread state machine, ready/sleep/terminated
//! queues, and the lock/unlock discipline that brackets every scheduling
//! decision.

use alloc::{collections::VecDeque, string::String, vec::Vec};

use log::trace;
use spin::Mutex;
use x86_64::{instructions::interrupts, PhysAddr, VirtAddr};

use super::context::{self, SavedContext};

/// Opaque handle identifying a thread, unique for the kernel's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadHandle(u64);

impl ThreadHandle {
    /// Reconstruct a handle from the raw value carried by an event payload.
    /// Only meaningful for values this module itself handed out.
    #[must_use]
    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

/// A thread's position in the state machine (spec.md §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Allocated but not yet handed to the scheduler.
    None,
    /// Waiting in the ready queue for its turn to run.
    Ready,
    /// Currently executing on the core.
    Running,
    /// Blocked on a mutex or a join target.
    Waiting,
    /// Blocked until a wake-up tick in the timer's sleep queue.
    Sleeping,
    /// Finished; resources pending reclamation by the terminator thread.
    Terminated,
}

/// Scheduling priority. A `LowLatency` thread preempts a `Normal` one that
/// is chosen next, even if it arrived in the ready queue later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingPolicy {
    /// Default policy for most threads.
    Normal,
    /// Preempts `Normal` threads; used for the terminator and drivers that
    /// must react quickly.
    LowLatency,
}

/// Bounds of a stack region.
#[derive(Debug, Clone, Copy)]
pub struct StackRegion {
    /// Lowest addressable byte.
    pub bottom: VirtAddr,
    /// Address one past the highest usable byte.
    pub top: VirtAddr,
    /// Size in bytes, `top - bottom`.
    pub size: u64,
}

/// A schedulable thread of execution.
pub struct Thread {
    /// This thread's handle.
    pub handle: ThreadHandle,
    /// Human-readable name, for diagnostics.
    pub name: String,
    /// Current state machine position.
    pub state: ThreadState,
    /// Scheduling priority.
    pub policy: SchedulingPolicy,
    /// The app (process) this thread belongs to.
    pub app_handle: Option<u64>,
    /// Physical address of this thread's L4 page table.
    pub base_page_table_address: PhysAddr,
    /// This thread's kernel-mode stack.
    pub kernel_stack: StackRegion,
    /// This thread's user-mode stack, if it has one.
    pub user_stack: Option<StackRegion>,
    /// Pointer to the `StartInfo` block, if this thread owns a fresh app.
    pub start_info_ptr: Option<VirtAddr>,
    /// The handle another thread is waiting to `join` on, if any.
    pub join_target: Option<ThreadHandle>,
    /// The mutex this thread is waiting on, if `state == Waiting`.
    pub mutex_id: Option<u64>,
    /// Ticks remaining in the current quantum.
    pub quantum: u32,
    /// Kernel `RSP` to resume this thread on. Meaningless until either this
    /// thread has run at least once (saved live by the context switch on
    /// the way out) or `first_run_entry` below has been consumed to prime it.
    kernel_rsp: VirtAddr,
    /// Entry trampoline to fabricate this thread's first resume point with,
    /// taken (and the stack primed) the first time it is switched into.
    /// `None` for the boot thread, which is already running on its own live
    /// stack and never needs priming.
    first_run_entry: Option<extern "C" fn() -> !>,
}

struct Inner {
    threads: alloc::collections::BTreeMap<ThreadHandle, Thread>,
    ready: VecDeque<ThreadHandle>,
    sleeping: Vec<(u64, ThreadHandle)>,
    terminated: VecDeque<ThreadHandle>,
    join_waiters: alloc::collections::BTreeMap<ThreadHandle, Vec<ThreadHandle>>,
    running: Option<ThreadHandle>,
    next_handle: u64,
    idle: Option<ThreadHandle>,
    terminator: Option<ThreadHandle>,
    main: Option<ThreadHandle>,
    pending_switch: Option<ThreadHandle>,
}

impl Inner {
    const fn new() -> Self {
        Self {
            threads: alloc::collections::BTreeMap::new(),
            ready: VecDeque::new(),
            sleeping: Vec::new(),
            terminated: VecDeque::new(),
            join_waiters: alloc::collections::BTreeMap::new(),
            running: None,
            next_handle: 1,
            idle: None,
            terminator: None,
            main: None,
            pending_switch: None,
        }
    }

    fn fresh_handle(&mut self) -> ThreadHandle {
        let h = ThreadHandle(self.next_handle);
        self.next_handle += 1;
        h
    }

    /// Choose the next thread to run: a `LowLatency` thread anywhere in the
    /// queue preempts the head if the head is only `Normal`.
    fn pick_next(&mut self) -> Option<ThreadHandle> {
        let preempt_pos = self.ready.iter().position(|h| {
            self.threads
                .get(h)
                .is_some_and(|t| t.policy == SchedulingPolicy::LowLatency)
        });
        match preempt_pos {
            Some(0) | None => self.ready.pop_front(),
            Some(pos) => self.ready.remove(pos),
        }
    }
}

static SCHEDULER: Mutex<Inner> = Mutex::new(Inner::new());

/// RAII guard held between `lock()` and `unlock()`. Interrupts are disabled
/// for the guard's lifetime; dropping it without an explicit `unlock()`
/// simply re-enables interrupts without triggering a context switch.
pub struct SchedulerGuard {
    interrupts_were_enabled: bool,
}

/// Acquire the scheduler lock, disabling interrupts for its duration.
#[must_use]
pub fn lock() -> SchedulerGuard {
    let interrupts_were_enabled = interrupts::are_enabled();
    interrupts::disable();
    SchedulerGuard {
        interrupts_were_enabled,
    }
}

/// Release the scheduler lock. If a scheduling decision made while the lock
/// was held selected a different thread to run, perform the context switch
/// now (spec.md §4.6's ordering guarantee).
impl SchedulerGuard {
    pub fn unlock(self) {
        let next = {
            let mut inner = SCHEDULER.lock();
            inner.pending_switch.take()
        };
        if let Some(next_handle) = next {
            perform_switch(next_handle);
        }
        if self.interrupts_were_enabled {
            interrupts::enable();
        }
    }
}

fn perform_switch(next_handle: ThreadHandle) {
    let (target, outgoing_rsp_slot) = {
        let mut inner = SCHEDULER.lock();
        let previous = inner.running.replace(next_handle);
        let mut outgoing_rsp_slot: *mut VirtAddr = core::ptr::null_mut();
        if let Some(prev) = previous {
            if let Some(t) = inner.threads.get_mut(&prev) {
                let was_running = t.state == ThreadState::Running;
                if was_running {
                    t.state = ThreadState::Ready;
                }
                outgoing_rsp_slot = &raw mut t.kernel_rsp;
                if was_running {
                    inner.ready.push_back(prev);
                }
            }
        }
        let Some(t) = inner.threads.get_mut(&next_handle) else {
            return;
        };
        t.state = ThreadState::Running;
        if let Some(entry) = t.first_run_entry.take() {
            t.kernel_rsp = context::prime_new_thread_stack(t.kernel_stack.top, entry);
        }
        let target = SavedContext {
            kernel_stack_top: t.kernel_stack.top,
            base_page_table: t.base_page_table_address,
            resume_rsp: t.kernel_rsp,
        };
        (target, outgoing_rsp_slot)
    };
    // SAFETY: `outgoing_rsp_slot` points at the outgoing thread's own
    // `kernel_rsp` field in the (now-unlocked) thread table; the scheduler
    // lock was held with interrupts disabled for the whole bookkeeping
    // section above and this is a single core, so nothing moves that entry
    // before `switch_address_space` writes through it.
    context::switch_address_space(outgoing_rsp_slot, &target);
    crate::events::fire_context_switch(next_handle.0);
}

/// First-run entry for a thread with no user stack (idle, terminator, and
/// other kernel-only threads): park it in the halt loop.
extern "C" fn kernel_thread_entry_trampoline() -> ! {
    loop {
        context::halt_until_interrupt();
    }
}

/// First-run entry for a freshly loaded app's thread: read its `main` entry
/// back out of the `StartInfo` block the ELF loader wrote, then drop to
/// Ring 3 there on its own user stack.
extern "C" fn user_thread_entry_trampoline() -> ! {
    let handle = running_thread().expect("a thread must be current when its own trampoline runs");
    let (main, user_stack_top) = {
        let inner = SCHEDULER.lock();
        let thread = inner.threads.get(&handle).expect("current thread must still be registered");
        let start_info_ptr = thread.start_info_ptr.expect("user trampoline requires a start_info_ptr");
        let user_stack_top = thread.user_stack.expect("user trampoline requires a user stack").top;
        // SAFETY: `start_info_ptr` was written by the ELF loader into this
        // thread's own address space, which is the one currently active.
        let main = unsafe { (*start_info_ptr.as_ptr::<crate::elf::StartInfo>()).main };
        (main, user_stack_top.as_u64())
    };
    let user_cs = u64::from(super::gdt::user_code_selector().0);
    let user_ds = u64::from(super::gdt::user_data_selector().0);
    // SAFETY: `main` and `user_stack_top` were mapped Present|User by the
    // ELF loader in this thread's own address space, which is now active.
    unsafe { context::enter_user_mode(main, user_stack_top, user_cs, user_ds) }
}

/// Create and enqueue a new thread as `Ready`. Returns its handle.
#[expect(clippy::too_many_arguments, reason = "mirrors the Thread data model 1:1")]
pub fn schedule_new_thread(
    name: &str,
    policy: SchedulingPolicy,
    app_handle: Option<u64>,
    base_page_table_address: PhysAddr,
    kernel_stack: StackRegion,
    user_stack: Option<StackRegion>,
    start_info_ptr: Option<VirtAddr>,
    quantum: u32,
) -> ThreadHandle {
    let mut inner = SCHEDULER.lock();
    let handle = inner.fresh_handle();
    // A zero-sized kernel stack is the boot thread's sentinel (entry_point.rs):
    // it is already running on its own live stack and must never be primed.
    let first_run_entry = if kernel_stack.size == 0 {
        None
    } else if user_stack.is_some() && start_info_ptr.is_some() {
        Some(user_thread_entry_trampoline as extern "C" fn() -> !)
    } else {
        Some(kernel_thread_entry_trampoline as extern "C" fn() -> !)
    };
    let thread = Thread {
        handle,
        name: String::from(name),
        state: ThreadState::Ready,
        policy,
        app_handle,
        base_page_table_address,
        kernel_stack,
        user_stack,
        start_info_ptr,
        join_target: None,
        mutex_id: None,
        quantum,
        kernel_rsp: kernel_stack.top,
        first_run_entry,
    };
    inner.threads.insert(handle, thread);
    inner.ready.push_back(handle);
    trace!(target: "scheduler", "thread {} ({name}) scheduled", handle.0);
    crate::events::fire_thread_created(handle.0);
    handle
}

/// Register the three special threads created at boot. Must be called once.
pub fn register_special_threads(idle: ThreadHandle, terminator: ThreadHandle, main: ThreadHandle) {
    let mut inner = SCHEDULER.lock();
    inner.idle = Some(idle);
    inner.terminator = Some(terminator);
    inner.main = Some(main);
    inner.running = Some(main);
    if let Some(t) = inner.threads.get_mut(&main) {
        t.state = ThreadState::Running;
    }
}

/// Move `handle` to the terminated queue from wherever it currently sits.
/// Terminating the currently running thread is a no-op that succeeds; it
/// will terminate naturally on its next exit.
pub fn terminate_thread(handle: ThreadHandle) -> bool {
    let mut inner = SCHEDULER.lock();
    if inner.running == Some(handle) {
        return true;
    }
    let Some(thread) = inner.threads.get(&handle) else {
        return false;
    };
    match thread.state {
        ThreadState::Ready => {
            inner.ready.retain(|h| *h != handle);
        }
        ThreadState::Sleeping => {
            inner.sleeping.retain(|(_, h)| *h != handle);
        }
        ThreadState::Waiting | ThreadState::None | ThreadState::Running | ThreadState::Terminated => {}
    }
    if let Some(t) = inner.threads.get_mut(&handle) {
        t.state = ThreadState::Terminated;
    }
    inner.terminated.push_back(handle);
    true
}

/// Pop the next terminated thread for the terminator thread to reclaim.
pub fn next_terminated() -> Option<ThreadHandle> {
    SCHEDULER.lock().terminated.pop_front()
}

/// Fully remove a thread's bookkeeping after the terminator has freed its
/// kernel stack.
pub fn retire(handle: ThreadHandle) {
    let mut inner = SCHEDULER.lock();
    inner.threads.remove(&handle);
    crate::events::fire_thread_terminated(handle.0);
}

/// Move the running thread to `Waiting` (used by mutex/join blocking) and
/// schedule a switch away from it. Must be called under the scheduler lock;
/// the switch itself happens on `unlock()`.
pub fn block_running_thread(mutex_id: Option<u64>) {
    let mut inner = SCHEDULER.lock();
    if let Some(running) = inner.running {
        if let Some(t) = inner.threads.get_mut(&running) {
            t.state = ThreadState::Waiting;
            t.mutex_id = mutex_id;
        }
    }
    execute_next_thread_locked(&mut inner);
}

/// Move `handle` from `Waiting`/`Sleeping` back to `Ready`.
pub fn wake(handle: ThreadHandle) {
    let mut inner = SCHEDULER.lock();
    if let Some(t) = inner.threads.get_mut(&handle) {
        if t.state == ThreadState::Waiting || t.state == ThreadState::Sleeping {
            t.state = ThreadState::Ready;
            inner.ready.push_back(handle);
        }
    }
}

/// Put the running thread to sleep until `wake_tick`.
pub fn sleep_running_thread(wake_tick: u64) {
    let mut inner = SCHEDULER.lock();
    if let Some(running) = inner.running {
        if let Some(t) = inner.threads.get_mut(&running) {
            t.state = ThreadState::Sleeping;
        }
        inner.sleeping.push((wake_tick, running));
    }
    execute_next_thread_locked(&mut inner);
}

/// Called by the timer on every tick: decrement the running thread's
/// quantum and wake any sleepers whose wake tick has arrived. Returns
/// `true` if the running thread's quantum just hit zero (preemption due).
pub fn on_timer_tick(current_tick: u64) -> bool {
    let mut inner = SCHEDULER.lock();
    let mut expired = Vec::new();
    inner.sleeping.retain(|(wake, handle)| {
        if *wake <= current_tick {
            expired.push(*handle);
            false
        } else {
            true
        }
    });
    for handle in expired {
        if let Some(t) = inner.threads.get_mut(&handle) {
            t.state = ThreadState::Ready;
        }
        inner.ready.push_back(handle);
    }

    let Some(running) = inner.running else {
        return false;
    };
    let quantum_expired = if let Some(t) = inner.threads.get_mut(&running) {
        if t.quantum > 0 {
            t.quantum -= 1;
        }
        t.quantum == 0
    } else {
        false
    };
    if quantum_expired {
        if let Some(t) = inner.threads.get_mut(&running) {
            t.quantum = crate::config::DEFAULT_QUANTUM_TICKS;
        }
        inner.ready.push_back(running);
        execute_next_thread_locked(&mut inner);
    }
    quantum_expired
}

/// Pick the next ready thread and mark it as the pending switch target,
/// falling back to the idle thread if the ready queue is empty.
pub fn execute_next_thread() {
    let mut inner = SCHEDULER.lock();
    execute_next_thread_locked(&mut inner);
}

fn execute_next_thread_locked(inner: &mut Inner) {
    let next = inner.pick_next().or(inner.idle);
    inner.pending_switch = next;
}

/// The currently running thread's handle, if any.
#[must_use]
pub fn running_thread() -> Option<ThreadHandle> {
    SCHEDULER.lock().running
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_stack() -> StackRegion {
        StackRegion {
            bottom: VirtAddr::new(0x1000),
            top: VirtAddr::new(0x2000),
            size: 0x1000,
        }
    }

    #[test_case]
    fn new_thread_starts_ready_and_queued() {
        let handle = schedule_new_thread(
            "test-thread",
            SchedulingPolicy::Normal,
            None,
            PhysAddr::new(0x1000),
            dummy_stack(),
            None,
            None,
            crate::config::DEFAULT_QUANTUM_TICKS,
        );
        let inner = SCHEDULER.lock();
        let thread = inner.threads.get(&handle).expect("thread should exist");
        assert_eq!(thread.state, ThreadState::Ready);
        assert!(inner.ready.contains(&handle));
    }

    #[test_case]
    fn low_latency_thread_preempts_normal_at_head() {
        let mut inner = SCHEDULER.lock();
        inner.ready.clear();
        drop(inner);

        let normal = schedule_new_thread(
            "normal",
            SchedulingPolicy::Normal,
            None,
            PhysAddr::new(0x1000),
            dummy_stack(),
            None,
            None,
            1,
        );
        let urgent = schedule_new_thread(
            "urgent",
            SchedulingPolicy::LowLatency,
            None,
            PhysAddr::new(0x1000),
            dummy_stack(),
            None,
            None,
            1,
        );

        let mut inner = SCHEDULER.lock();
        let picked = inner.pick_next();
        assert_eq!(picked, Some(urgent));
        assert!(inner.ready.contains(&normal));
    }

    #[test_case]
    fn terminating_running_thread_is_a_no_op_success() {
        let handle = schedule_new_thread(
            "running",
            SchedulingPolicy::Normal,
            None,
            PhysAddr::new(0x1000),
            dummy_stack(),
            None,
            None,
            1,
        );
        SCHEDULER.lock().running = Some(handle);
        assert!(terminate_thread(handle));
        assert_eq!(SCHEDULER.lock().threads.get(&handle).unwrap().state, ThreadState::Ready);
    }
}
