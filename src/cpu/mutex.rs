//! Kernel mutex (C8): an owner slot plus a strict-FIFO wait queue,
//! integrated with the scheduler rather than spinning.

use alloc::{collections::VecDeque, string::String};

use spin::Mutex as InnerLock;

use super::scheduler::{self, ThreadHandle};

/// Opaque handle identifying a kernel mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MutexHandle(u64);

struct State {
    owner: Option<ThreadHandle>,
    wait_queue: VecDeque<ThreadHandle>,
}

/// A kernel-level mutex. Blocking acquisition hands the waiting thread to
/// the scheduler instead of busy-spinning.
pub struct KernelMutex {
    /// This mutex's handle.
    pub handle: MutexHandle,
    /// Human-readable name, for diagnostics.
    pub name: String,
    state: InnerLock<State>,
}

static NEXT_HANDLE: InnerLock<u64> = InnerLock::new(1);

impl KernelMutex {
    /// Create a new, initially unowned mutex.
    #[must_use]
    pub fn new(name: &str) -> Self {
        let mut next = NEXT_HANDLE.lock();
        let handle = MutexHandle(*next);
        *next += 1;
        Self {
            handle,
            name: String::from(name),
            state: InnerLock::new(State {
                owner: None,
                wait_queue: VecDeque::new(),
            }),
        }
    }

    /// Acquire the mutex. If already owned, the calling thread is enqueued
    /// FIFO, moved to `Waiting`, and the scheduler switches away; this
    /// function returns only once the mutex has actually been acquired.
    pub fn lock(&self) {
        let Some(caller) = scheduler::running_thread() else {
            return;
        };
        loop {
            if self.state.lock().owner == Some(caller) {
                return;
            }
            let guard = scheduler::lock();
            let mut state = self.state.lock();
            if state.owner.is_none() {
                state.owner = Some(caller);
                drop(state);
                guard.unlock();
                return;
            }
            state.wait_queue.push_back(caller);
            drop(state);
            scheduler::block_running_thread(Some(self.handle.0));
            guard.unlock();
            // Resumes here once `unlock()` has handed us ownership (or, in
            // principle, on a spurious wake) — the loop re-checks either way.
        }
    }

    /// Release the mutex. Fails if the caller is not the current owner.
    /// If the wait queue is non-empty, the head becomes the new owner and
    /// is handed to the scheduler as `Ready`, preserving strict FIFO order.
    pub fn unlock(&self) -> bool {
        let guard = scheduler::lock();
        let mut state = self.state.lock();
        let Some(caller) = scheduler::running_thread() else {
            return false;
        };
        if state.owner != Some(caller) {
            return false;
        }
        state.owner = state.wait_queue.pop_front();
        let woken = state.owner;
        drop(state);
        if let Some(next_owner) = woken {
            scheduler::wake(next_owner);
        }
        guard.unlock();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn unlock_without_ownership_fails() {
        let mutex = KernelMutex::new("test");
        assert!(!mutex.unlock());
    }

    #[test_case]
    fn fresh_mutex_has_no_owner() {
        let mutex = KernelMutex::new("test");
        assert!(mutex.state.lock().owner.is_none());
    }
}
