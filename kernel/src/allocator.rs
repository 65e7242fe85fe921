//! Wires the Frame Allocator in as the kernel's `#[global_allocator]`,
//! and exposes the separate pool the VM subsystem draws user frames
//! from.
//!
//! The free RAM left over after the kernel image is split into two
//! halves at first use: one backs `#[global_allocator]` and serves
//! kernel metadata only (`Box<PageTable>` for `page::walk`'s
//! intermediate tables), the other is the user frame pool that
//! `mem::fault`/`process::Process` allocate and evict against. Splitting
//! them avoids a reentrant lock: resolving a page fault holds the user
//! pool's lock for the duration of the call, and `page::walk` along the
//! way may allocate an intermediate table through the global allocator.
//! If both drew from the same pool behind the same lock, that second
//! allocation would deadlock against itself. Kernel metadata exhaustion
//! just panics: there is no user resident page whose eviction would ever
//! free a page table frame, so retrying via the Replacement Policy here
//! would not help.

// Under `cargo test` the crate links against std, which brings its own
// global allocator; the frame-backed one below would fight it for the
// `__free_ram`/`__free_ram_end` symbols that only the kernel's own
// linker script provides. Everything here is therefore kernel-only.
#[cfg(not(test))]
mod imp {
    use core::alloc::{GlobalAlloc, Layout};

    use crate::address::{align_down, PAddr};
    use crate::mem::frame::FramePool;
    use crate::page::PAGE_SIZE;
    use crate::spinlock::SpinLock;

    // Safety: symbols created by the linker script, spanning the RAM left
    // over after the kernel image.
    unsafe extern "C" {
        static __free_ram: u8;
        static __free_ram_end: u8;
    }

    struct FrameAllocator(SpinLock<Option<FramePool>>);

    #[global_allocator]
    static ALLOCATOR: FrameAllocator = FrameAllocator(SpinLock::new(None));

    static USER_POOL: SpinLock<Option<FramePool>> = SpinLock::new(None);

    fn split_point() -> PAddr {
        let start = &raw const __free_ram as usize;
        let end = &raw const __free_ram_end as usize;
        PAddr::new(align_down(start + (end - start) / 2, PAGE_SIZE))
    }

    fn init_kernel_pool() -> FramePool {
        let start = PAddr::new(&raw const __free_ram as usize);
        let mid = split_point();
        // Safety: the linker script reserves [__free_ram, __free_ram_end) for
        // exactly this purpose; the lower half belongs to this pool alone.
        unsafe { FramePool::new(start, mid) }
    }

    fn init_user_pool() -> FramePool {
        let mid = split_point();
        let end = PAddr::new(&raw const __free_ram_end as usize);
        // Safety: the upper half of [__free_ram, __free_ram_end) belongs to
        // this pool alone.
        unsafe { FramePool::new(mid, end) }
    }

    /// The frame pool the VM subsystem draws user-page frames from and
    /// evicts into. Lazily carved out of the upper half of free RAM on first
    /// use.
    pub fn user_frames() -> &'static SpinLock<Option<FramePool>> {
        USER_POOL.lock().get_or_insert_with(init_user_pool);
        &USER_POOL
    }

    unsafe impl GlobalAlloc for FrameAllocator {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            assert!(layout.size() > 0 && layout.size() <= PAGE_SIZE, "allocation larger than one frame");
            assert!(layout.align() <= PAGE_SIZE, "alignment larger than one frame");

            let mut guard = self.0.lock();
            let pool = guard.get_or_insert_with(init_kernel_pool);

            match pool.alloc() {
                Some(frame) => frame.as_usize() as *mut u8,
                None => panic!("out of memory: kernel metadata frame pool exhausted"),
            }
        }

        unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
            let mut guard = self.0.lock();
            let pool = guard.as_mut().expect("dealloc before any alloc");
            // Safety: `ptr` came from a prior `alloc` on this same pool.
            unsafe { pool.free(PAddr::new(ptr as usize)) };
        }
    }
}

#[cfg(not(test))]
pub use imp::user_frames;
