//! Common library

#![no_std]

pub mod print;

pub const SYS_PUTBYTE: usize = 1;
pub const SYS_GETCHAR: usize = 2;
pub const SYS_EXIT: usize = 3;
pub const SYS_READFILE: usize = 4;
pub const SYS_WRITEFILE: usize = 5;
pub const SYS_SBRK: usize = 6;
pub const SYS_MEMSTAT: usize = 7;
pub const SYS_FORK: usize = 8;
pub const SYS_WAIT: usize = 9;
pub const SYS_KILL: usize = 10;
pub const SYS_PAUSE: usize = 11;
pub const SYS_GETPID: usize = 12;
pub const SYS_UPTIME: usize = 13;

/// Page size in bytes. Every frame, resident-set entry and swap slot is
/// exactly one page.
pub const PGSIZE: usize = 4096;

/// Upper bound on the number of pages a single process can hold resident
/// at once. A plain array field on `Process`, not a heap `Vec`.
pub const RESIDENT_MAX: usize = 64;

/// Upper bound on the number of swap slots a single process can own.
pub const MAX_SWAP_SLOTS: usize = 128;

/// Upper bound on the number of page records `memstat` can report.
pub const MAX_PAGES_INFO: usize = 256;

/// Virtual address of the top of the initial user stack, shared between
/// the kernel's process bring-up and the user crate's `start` trampoline
/// (and `user.ld`'s own `__user_stack_top`, which must agree with this).
/// Fixed rather than derived from a given executable's size, so the
/// kernel can map the stack before it has any reason to care how big the
/// exec image is.
pub const USER_STACK_TOP: usize = 0x0080_0000;

/// Requested growth mode for `sbrk`, carried alongside the requested byte
/// delta.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum SbrkMode {
    /// Map and zero every new page immediately.
    Eager = 0,
    /// Only extend `sz`; pages fault in on first touch.
    Lazy = 1,
}

impl SbrkMode {
    pub fn from_usize(v: usize) -> Self {
        match v {
            0 => SbrkMode::Eager,
            _ => SbrkMode::Lazy,
        }
    }
}

/// Per-page classification reported by `memstat`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum PageState {
    Unmapped = 0,
    Resident = 1,
    Swapped = 2,
}

/// One entry of the `memstat` page array.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct PageInfo {
    pub va: usize,
    pub state: PageState,
    pub is_dirty: bool,
    pub seq: u64,
    pub swap_slot: usize,
}

impl PageInfo {
    pub const fn empty() -> Self {
        Self {
            va: 0,
            state: PageState::Unmapped,
            is_dirty: false,
            seq: 0,
            swap_slot: usize::MAX,
        }
    }
}

/// The `memstat` record handed back to user space.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct MemStat {
    pub pid: usize,
    pub next_fifo_seq: u64,
    pub num_pages_total: usize,
    pub num_resident_pages: usize,
    pub num_swapped_pages: usize,
    pub pages: [PageInfo; MAX_PAGES_INFO],
}

impl MemStat {
    pub const fn empty(pid: usize) -> Self {
        Self {
            pid,
            next_fifo_seq: 0,
            num_pages_total: 0,
            num_resident_pages: 0,
            num_swapped_pages: 0,
            pages: [PageInfo::empty(); MAX_PAGES_INFO],
        }
    }
}
