//! Compile-time tunables for the kernel core.
//!
//! Every magic number that shows up in more than one module lives here
//! instead of being re-typed at each call site.

/// Size of a kernel thread's stack, including the reserved null frame.
pub const KERNEL_STACK_SIZE: usize = 4096 * 8;

/// Size of the double-fault handler's dedicated IST stack.
pub const DOUBLE_FAULT_STACK_SIZE: usize = 4096 * 5;

/// Size of the page-fault handler's dedicated IST stack.
pub const PAGE_FAULT_STACK_SIZE: usize = 4096 * 5;

/// Size of a freshly loaded user program's stack (spec.md ELF loader bootstrap area).
pub const DEFAULT_USER_STACK_SIZE: u64 = 4096 * 4; // 16 KiB

/// Start address of the kernel heap backing the slab allocator's bootstrap caches.
pub const HEAP_START: usize = 0x_4444_4444_0000;

/// Size of the kernel heap in bytes.
pub const HEAP_SIZE: usize = 1000 * 1024; // 1 MiB

/// Default periodic timer frequency, in Hz.
pub const TIMER_FREQUENCY_HZ: u32 = 1000;

/// Default quantum given to a `NORMAL` policy thread, in ticks.
pub const DEFAULT_QUANTUM_TICKS: u32 = 10;

/// Smallest slab size class exponent (2^4 = 16 bytes).
pub const MIN_SIZE_POWER: u32 = 4;

/// Largest slab size class exponent (2^16 = 65536 bytes).
pub const MAX_SIZE_POWER: u32 = 16;

/// Number of size classes between [`MIN_SIZE_POWER`] and [`MAX_SIZE_POWER`] inclusive.
pub const NUM_SIZE_CLASSES: usize = (MAX_SIZE_POWER - MIN_SIZE_POWER + 1) as usize;

/// Sentinel marking the end of an on-slab free list.
pub const MAX_OBJECT_COUNT: u8 = u8::MAX;

/// End of canonical user-space addresses (exclusive), used by the ELF loader
/// to reject segments that would intersect kernel memory.
pub const USER_SPACE_END: u64 = 0x0000_7FFF_FFFF_FFFF;

/// Top of the bootstrap area / user stack for a freshly loaded app (stack grows down from here).
pub const USER_STACK_TOP: u64 = 0x0000_7FFF_0000_0000;
