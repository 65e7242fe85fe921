//! Process VM State: per-process size, executable end, swap area,
//! resident set and FIFO counter, plus the exec/sbrk/fork/exit lifecycle
//! methods that own them. The scheduling fields (`sp`, `stack`,
//! `page_table`) and the actual context switch stay close to the
//! original layout; `switch_context` and `create_process`'s use of
//! `user_entry` are asm-dependent and excluded from host test builds.

use alloc::boxed::Box;
use core::fmt;

use common::{SbrkMode, PGSIZE};

use crate::address::{align_up, PAddr, VAddr};
use crate::mem::frame::FramePool;
use crate::mem::replace::{self, EvictionRecord};
use crate::mem::resident::ResidentSet;
use crate::mem::swap::{BlockDevice, SwapStore};
use crate::page::{self, PageTable, PAGE_R, PAGE_SIZE, PAGE_U, PAGE_W};
use crate::spinlock::SpinLock;

pub const PROCS_MAX: usize = 8; // Maximum number of processes

// The base virtual address of an application image. Every process's
// address space starts at 0 so the exec/heap/stack range checks in
// `mem::fault::classify_fresh` stay simple absolute comparisons; this
// needs to match the starting address defined in `user.ld`.
pub const USER_BASE: usize = 0x0;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum State {
    Unused,   // Unused process control structure
    Runnable, // Runnable process
    Exited,
}

/// Index into the boot filesystem's file table backing this process's
/// text/data, retained so on-demand exec-segment reads and `fork` can
/// find it again.
pub type ExeHandle = usize;

#[derive(Clone, Debug)]
pub struct Process {
    pub pid: usize,
    pub state: State,
    pub sp: VAddr,
    pub page_table: Option<Box<PageTable>>,
    pub stack: [u8; 8192],

    /// Highest mapped byte of the heap/data segment; `sbrk` target.
    pub sz: usize,
    /// End of the text+data image, computed from ELF program headers at
    /// exec time; the boundary between exec and heap in fault
    /// classification.
    pub exe_end: usize,
    /// Bottom of the fixed stack-fault window, i.e. the top of the
    /// user stack region at exec time.
    pub stack_bottom: usize,
    pub exe_file: Option<ExeHandle>,

    pub resident: ResidentSet,
    pub swap: SwapStore,
    pub next_fifo_seq: u64,
}

impl Process {
    const fn empty() -> Self {
        Self {
            pid: 0,
            state: State::Unused,
            sp: VAddr::new(0),
            page_table: None,
            stack: [0; 8192],
            sz: 0,
            exe_end: 0,
            stack_bottom: 0,
            exe_file: None,
            resident: ResidentSet::new(),
            swap: SwapStore::new(0),
            next_fifo_seq: 0,
        }
    }

    pub fn table_mut(&mut self) -> &mut PageTable {
        self.page_table.as_mut().expect("process has no page table")
    }

    /// Resets VM state for a fresh exec: drops the old page table,
    /// resident set and swap region, then maps only the top stack page.
    /// `exe_end` becomes the page-aligned image size: the boundary
    /// between exec and heap in fault classification. Text and data are
    /// not read off the boot filesystem here — `exe_file` is retained so
    /// the Fault Handler can read segment bytes out of it on first touch,
    /// the same way heap and stack pages are demanded.
    pub fn exec_reset(&mut self, exe_file: ExeHandle, image: &[u8], stack_top: VAddr, frames: &mut FramePool) {
        self.page_table = Some(Box::new(PageTable::new()));
        self.resident.clear();
        self.swap.reset();
        self.swap.ensure_region();
        self.next_fifo_seq = 0;
        self.exe_file = Some(exe_file);

        let exe_end = USER_BASE + align_up(image.len(), PAGE_SIZE);
        self.exe_end = exe_end;
        self.sz = exe_end;
        self.stack_bottom = stack_top.as_usize() + PGSIZE;

        let frame = frames.alloc().expect("stack page must be available at exec");
        page::map_page(self.table_mut(), stack_top, frame, PAGE_R | PAGE_W | PAGE_U);
        let seq = self.next_fifo_seq;
        self.next_fifo_seq += 1;
        self.resident.insert(stack_top, seq);
    }

    /// Grows or shrinks `sz` by `delta` bytes. In `Eager` mode, newly
    /// added pages are mapped and zeroed immediately; in `Lazy` mode only
    /// `sz` moves and the pages fault in later. Shrinking always frees
    /// resident and swapped pages in the vacated range immediately,
    /// regardless of mode.
    pub fn sbrk(
        &mut self,
        delta: isize,
        mode: SbrkMode,
        frames: &mut FramePool,
        dev: &mut impl BlockDevice,
    ) -> Option<usize> {
        let old_sz = self.sz;
        let new_sz = old_sz.checked_add_signed(delta)?;

        if delta < 0 {
            self.free_range(new_sz, old_sz, frames);
        } else if delta > 0 && mode == SbrkMode::Eager {
            let mut va = old_sz.next_multiple_of(PAGE_SIZE);
            while va < new_sz {
                let frame = match frames.alloc() {
                    Some(f) => f,
                    None => {
                        self.evict_one_page(frames, dev);
                        frames.alloc()?
                    }
                };
                page::map_page(self.table_mut(), VAddr::new(va), frame, PAGE_R | PAGE_W | PAGE_U);
                let seq = self.next_fifo_seq;
                self.next_fifo_seq += 1;
                self.resident.insert(VAddr::new(va), seq);
                va += PAGE_SIZE;
            }
        }

        self.sz = new_sz;
        Some(new_sz)
    }

    /// Frees every resident page and swap slot whose page starts in
    /// `[from, to)`. Used by the shrinking half of `sbrk` and by `exit`.
    fn free_range(&mut self, from: usize, to: usize, frames: &mut FramePool) {
        let from_page = from.next_multiple_of(PAGE_SIZE);
        let mut va = from_page;
        while va < to {
            let vaddr = VAddr::new(va);
            if let Some(pte) = page::walk(self.table_mut(), vaddr, false).copied() {
                if page::pte_is_present(pte) {
                    if let Some(paddr) = page::unmap_page(self.table_mut(), vaddr) {
                        // Safety: no longer referenced by any PTE.
                        unsafe { frames.free(paddr) };
                    }
                    self.resident.remove(vaddr);
                } else if page::pte_is_swapped(pte) {
                    self.swap.free_slot(page::pte_swap_slot(pte));
                    if let Some(pte_ref) = page::walk(self.table_mut(), vaddr, false) {
                        *pte_ref = 0;
                    }
                }
            }
            va += PAGE_SIZE;
        }
    }

    /// Resolves a page fault against this process's VM state, building a
    /// `FaultContext` borrow out of its own fields. `exec_image` is this
    /// process's executable bytes (from its boot-filesystem inode),
    /// needed only when the fault classifies as `Exec`.
    pub fn handle_fault(
        &mut self,
        dev: &mut impl BlockDevice,
        frames: &mut FramePool,
        fault_va: usize,
        access: crate::mem::fault::FaultAccess,
        exec_image: Option<&[u8]>,
    ) -> crate::mem::fault::FaultOutcome {
        let mut ctx = crate::mem::fault::FaultContext {
            table: self.page_table.as_mut().expect("process has no page table"),
            resident: &mut self.resident,
            swap: &mut self.swap,
            frames,
            sz: self.sz,
            exe_end: self.exe_end,
            stack_bottom: self.stack_bottom,
            next_fifo_seq: &mut self.next_fifo_seq,
        };
        crate::mem::fault::handle_page_fault(&mut ctx, dev, fault_va, access, exec_image)
    }

    /// Evicts this process's own oldest resident page. Used by the
    /// global allocator's retry path when the shared frame pool is
    /// exhausted by a kernel-metadata allocation rather than a user
    /// fault.
    pub fn evict_one_page(
        &mut self,
        frames: &mut FramePool,
        dev: &mut impl BlockDevice,
    ) -> Option<EvictionRecord> {
        replace::evict_oldest(
            &mut self.resident,
            self.page_table.as_mut()?,
            &mut self.swap,
            frames,
            dev,
        )
    }

    /// Releases every resident page, every swap slot, and the executable
    /// file handle. Called from `SYS_EXIT` and from kill delivery.
    pub fn exit(&mut self, frames: &mut FramePool) {
        self.free_range(0, self.sz.max(self.stack_bottom), frames);
        self.resident.clear();
        self.swap.reset();
        self.exe_file = None;
        self.page_table = None;
    }

    /// Deep-copies resident and swapped page contents into a fresh child
    /// process. No shared pages are supported, so every page the parent
    /// owns gets its own frame or slot in the child.
    pub fn fork_into(
        &mut self,
        child: &mut Process,
        frames: &mut FramePool,
        dev: &mut impl BlockDevice,
    ) {
        child.page_table = Some(Box::new(PageTable::new()));
        child.resident.clear();
        child.swap.reset();
        child.swap.ensure_region();
        child.sz = self.sz;
        child.exe_end = self.exe_end;
        child.stack_bottom = self.stack_bottom;
        child.exe_file = self.exe_file;
        child.next_fifo_seq = self.next_fifo_seq;

        for entry in self.resident.iter() {
            let va = VAddr::new(entry.va);
            let pte = *page::walk(self.table_mut(), va, false).expect("resident entry has a PTE");
            let perms = page::pte_perm_bits(pte);
            let src = PAddr::from_ppn(pte);

            let frame = frames.alloc().expect("frame pool exhausted during fork");
            unsafe {
                core::ptr::copy_nonoverlapping(
                    src.as_usize() as *const u8,
                    frame.as_usize() as *mut u8,
                    PAGE_SIZE,
                );
            }
            page::map_page(child.table_mut(), va, frame, perms);
            child.resident.insert(va, entry.seq);
        }

        let mut va = 0usize;
        while va < self.sz.max(self.stack_bottom) {
            let vaddr = VAddr::new(va);
            if let Some(pte) = page::walk(self.table_mut(), vaddr, false).copied() {
                if page::pte_is_swapped(pte) {
                    let src_slot = page::pte_swap_slot(pte);
                    let mut buf = [0u8; PAGE_SIZE];
                    self.swap.read_slot(dev, src_slot, &mut buf);

                    let dst_slot = child.swap.alloc_slot().expect("swap region exhausted during fork");
                    child.swap.write_slot(dev, dst_slot, &buf);

                    let child_pte = page::encode_swap(pte, dst_slot);
                    if let Some(pte_ref) = page::walk(child.table_mut(), vaddr, true) {
                        *pte_ref = child_pte;
                    }
                }
            }
            va += PAGE_SIZE;
        }
    }
}

pub struct Procs(pub SpinLock<[Process; PROCS_MAX]>);

impl Procs {
    const fn new() -> Self {
        Self(SpinLock::new([const { Process::empty() }; PROCS_MAX]))
    }

    pub fn try_get_index(&self, pid: usize) -> Option<usize> {
        self.0.lock().iter().position(|p| p.pid == pid)
    }
}

// Vital for debugging if you want to print the contents of PROCS.
impl fmt::Display for Procs {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let procs = PROCS.0.lock();
        for (i, process) in procs.iter().enumerate() {
            writeln!(
                f,
                "PROC[{i}] pid={} state={:?} sz={:#x} resident={} next_fifo_seq={}",
                process.pid,
                process.state,
                process.sz,
                process.resident.len(),
                process.next_fifo_seq
            )?;
        }
        Ok(())
    }
}

pub static PROCS: Procs = Procs::new(); // All process control structures.

#[cfg(not(test))]
mod target {
    use super::*;
    use core::arch::{asm, naked_asm};

    use crate::page::PAGE_X;

    unsafe extern "C" {
        static __kernel_base: u8;
        static __free_ram_end: u8;
    }

    const SSTATUS_SPIE: usize = 1 << 5; // Enable interrupts after sret
    const SSTATUS_SUM: usize = 1 << 18; // Let S-mode touch U-mapped pages (syscall buffers)

    fn user_entry() {
        unsafe {
            asm!(
                "csrw sepc, {sepc}",
                "csrw sstatus, {sstatus}",
                "sret",
                sepc = in(reg) USER_BASE,
                sstatus = in(reg) SSTATUS_SPIE | SSTATUS_SUM,
            )
        }
    }

    /// Maps the kernel's own text/data 1:1 into a fresh page table so
    /// trap handling keeps working after the satp switch, and stacks the
    /// callee-saved registers `switch_context` expects to find on first
    /// switch into this process.
    fn stack_and_map_kernel(process: &mut Process, entry_ra: usize) {
        let callee_saved_regs: [usize; 13] = [
            entry_ra, // ra
            0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
        ];

        let callee_saved_regs_start = process.stack.len() - callee_saved_regs.len() * size_of::<usize>();
        let mut offset = callee_saved_regs_start;
        for reg in &callee_saved_regs {
            let bytes = reg.to_ne_bytes();
            process.stack[offset..offset + size_of::<usize>()].copy_from_slice(&bytes);
            offset += size_of::<usize>();
        }

        let mut page_table = process.page_table.take().unwrap_or_else(|| Box::new(PageTable::new()));
        let kernel_base = &raw const __kernel_base as usize;
        let free_ram_end = &raw const __free_ram_end as usize;
        for paddr in (kernel_base..free_ram_end).step_by(PAGE_SIZE) {
            page::map_page(&mut page_table, VAddr::new(paddr), PAddr::new(paddr), PAGE_R | PAGE_W | PAGE_X);
        }
        // virtio-blk's MMIO window sits far below the kernel image, so it
        // needs its own identity mapping: trap handlers read/write it with
        // this process's page table active whenever a syscall touches the
        // boot filesystem.
        let virtio_base = crate::address::align_down(crate::virtio::VIRTIO_BLK_PADDR as usize, PAGE_SIZE);
        page::map_page(&mut page_table, VAddr::new(virtio_base), PAddr::new(virtio_base), PAGE_R | PAGE_W);
        process.page_table = Some(page_table);

        process.sp = VAddr::new(&raw const process.stack[callee_saved_regs_start] as usize);
    }

    /// Brings up a process that runs entirely in kernel mode from a plain
    /// function pointer, with no user page table of its own beyond the
    /// kernel's 1:1 mapping. Used only for the idle process: it never
    /// touches user memory, so it never faults and never needs a `Process`
    /// with VM state.
    pub fn create_kernel_proc(entry: fn()) -> usize {
        let mut procs = PROCS.0.lock();
        let (i, process) = procs
            .iter_mut()
            .enumerate()
            .find(|(_, p)| p.state == State::Unused)
            .expect("no free process slots");

        stack_and_map_kernel(process, entry as usize);
        process.pid = i + 1;
        process.state = State::Runnable;
        process.pid
    }

    /// Brings up a fresh user process from an executable image taken
    /// straight from the boot filesystem: maps the kernel 1:1, then
    /// delegates the user-half mapping to `Process::exec_reset` using
    /// frames drawn from the shared user frame pool.
    pub fn create_process(exe_file: ExeHandle, image: &[u8]) -> usize {
        let mut procs = PROCS.0.lock();
        let (i, process) = procs
            .iter_mut()
            .enumerate()
            .find(|(_, p)| p.state == State::Unused)
            .expect("no free process slots");

        stack_and_map_kernel(process, user_entry as usize);

        let stack_top = VAddr::new(common::USER_STACK_TOP - PAGE_SIZE);
        let mut guard = crate::allocator::user_frames().lock();
        let frames = guard.as_mut().expect("user frame pool initialized by user_frames()");
        process.exec_reset(exe_file, image, stack_top, frames);

        process.pid = i + 1;
        process.state = State::Runnable;

        common::println!(
            "[pid {}] INIT-LAZYMAP text=[0x0,{:#x}) data=[{:#x},{:#x}) heap_start={:#x} stack_top={:#x}",
            process.pid, process.exe_end, process.exe_end, process.sz, process.exe_end, stack_top.as_usize()
        );

        process.pid
    }

    #[unsafe(naked)]
    pub unsafe extern "C" fn switch_context(prev_sp: *mut usize, next_sp: *mut usize) {
        naked_asm!(
            ".align 2",
            // Save callee-saved registers onto the current process's stack.
            "addi sp, sp, -13 * 4",
            "sw ra,  0  * 4(sp)",
            "sw s0,  1  * 4(sp)",
            "sw s1,  2  * 4(sp)",
            "sw s2,  3  * 4(sp)",
            "sw s3,  4  * 4(sp)",
            "sw s4,  5  * 4(sp)",
            "sw s5,  6  * 4(sp)",
            "sw s6,  7  * 4(sp)",
            "sw s7,  8  * 4(sp)",
            "sw s8,  9  * 4(sp)",
            "sw s9,  10 * 4(sp)",
            "sw s10, 11 * 4(sp)",
            "sw s11, 12 * 4(sp)",
            // Switch the stack pointer.
            "sw sp, (a0)",
            "lw sp, (a1)",
            // Restore callee-saved registers from the next process's stack.
            "lw ra,  0  * 4(sp)",
            "lw s0,  1  * 4(sp)",
            "lw s1,  2  * 4(sp)",
            "lw s2,  3  * 4(sp)",
            "lw s3,  4  * 4(sp)",
            "lw s4,  5  * 4(sp)",
            "lw s5,  6  * 4(sp)",
            "lw s6,  7  * 4(sp)",
            "lw s7,  8  * 4(sp)",
            "lw s8,  9  * 4(sp)",
            "lw s9,  10 * 4(sp)",
            "lw s10, 11 * 4(sp)",
            "lw s11, 12 * 4(sp)",
            "addi sp, sp, 13 * 4",
            "ret",
        )
    }
}

#[cfg(not(test))]
pub use target::{create_kernel_proc, create_process, switch_context};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtio::SECTOR_SIZE;
    use alloc::alloc::{alloc_zeroed, Layout};
    use alloc::collections::BTreeMap;

    struct FakeDisk(BTreeMap<u64, [u8; SECTOR_SIZE]>);

    impl BlockDevice for FakeDisk {
        fn read_sector(&mut self, sector: u64, buf: &mut [u8; SECTOR_SIZE]) {
            *buf = *self.0.get(&sector).unwrap_or(&[0u8; SECTOR_SIZE]);
        }
        fn write_sector(&mut self, sector: u64, buf: &[u8; SECTOR_SIZE]) {
            self.0.insert(sector, *buf);
        }
    }

    fn pool(pages: usize) -> FramePool {
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) } as usize;
        unsafe { FramePool::new(PAddr::new(ptr), PAddr::new(ptr + pages * PAGE_SIZE)) }
    }

    fn fresh_process(pid: usize) -> Process {
        let mut p = Process::empty();
        p.pid = pid;
        p.swap = SwapStore::new(pid);
        p
    }

    #[test]
    fn exec_reset_maps_top_stack_page_only() {
        let mut p = fresh_process(1);
        let mut frames = pool(4);
        let image = [0u8; 0x2000];
        p.exec_reset(0, &image, VAddr::new(0x8000_0000 - PGSIZE), &mut frames);

        assert_eq!(p.sz, 0x2000);
        assert_eq!(p.exe_end, 0x2000);
        assert_eq!(p.resident.len(), 1);
        assert!(page::pte_is_present(
            *page::walk(p.table_mut(), VAddr::new(0x8000_0000 - PGSIZE), false).unwrap()
        ));
    }

    #[test]
    fn eager_sbrk_maps_every_new_page() {
        let mut p = fresh_process(2);
        let mut frames = pool(8);
        let mut disk = FakeDisk(BTreeMap::new());
        let image = [0u8; 0x1000];
        p.exec_reset(0, &image, VAddr::new(0x8000_0000 - PGSIZE), &mut frames);

        let new_sz = p.sbrk(2 * PGSIZE as isize, SbrkMode::Eager, &mut frames, &mut disk).unwrap();
        assert_eq!(new_sz, 0x1000 + 2 * PGSIZE);
        assert!(page::pte_is_present(*page::walk(p.table_mut(), VAddr::new(0x1000), false).unwrap()));
        assert!(page::pte_is_present(*page::walk(p.table_mut(), VAddr::new(0x2000), false).unwrap()));
    }

    #[test]
    fn lazy_sbrk_only_moves_sz() {
        let mut p = fresh_process(3);
        let mut frames = pool(4);
        let mut disk = FakeDisk(BTreeMap::new());
        let image = [0u8; 0x1000];
        p.exec_reset(0, &image, VAddr::new(0x8000_0000 - PGSIZE), &mut frames);

        let new_sz = p.sbrk(PGSIZE as isize, SbrkMode::Lazy, &mut frames, &mut disk).unwrap();
        assert_eq!(new_sz, 0x1000 + PGSIZE);
        assert!(page::walk(p.table_mut(), VAddr::new(0x1000), false).is_none());
    }

    #[test]
    fn shrinking_sbrk_frees_resident_pages() {
        let mut p = fresh_process(4);
        let mut frames = pool(4);
        let mut disk = FakeDisk(BTreeMap::new());
        let image = [0u8; 0x1000];
        p.exec_reset(0, &image, VAddr::new(0x8000_0000 - PGSIZE), &mut frames);
        p.sbrk(PGSIZE as isize, SbrkMode::Eager, &mut frames, &mut disk).unwrap();
        let free_before = frames.num_free();

        p.sbrk(-(PGSIZE as isize), SbrkMode::Eager, &mut frames, &mut disk).unwrap();
        assert_eq!(frames.num_free(), free_before + 1);
        assert!(!p.resident.contains(VAddr::new(0x1000)));
    }

    #[test]
    fn exit_frees_every_resident_page() {
        let mut p = fresh_process(5);
        let mut frames = pool(4);
        let mut disk = FakeDisk(BTreeMap::new());
        let image = [0u8; 0x1000];
        p.exec_reset(0, &image, VAddr::new(0x8000_0000 - PGSIZE), &mut frames);
        p.sbrk(PGSIZE as isize, SbrkMode::Eager, &mut frames, &mut disk).unwrap();

        let free_before = frames.num_free();
        p.exit(&mut frames);
        assert!(frames.num_free() > free_before);
        assert_eq!(p.resident.len(), 0);
        assert!(p.exe_file.is_none());
    }

    #[test]
    fn fork_copies_resident_pages_into_distinct_frames() {
        let mut parent = fresh_process(6);
        let mut child = fresh_process(7);
        let mut frames = pool(8);
        let mut disk = FakeDisk(BTreeMap::new());

        let image = [0u8; 0x1000];
        parent.exec_reset(0, &image, VAddr::new(0x8000_0000 - PGSIZE), &mut frames);
        parent.sbrk(PGSIZE as isize, SbrkMode::Eager, &mut frames, &mut disk).unwrap();
        unsafe {
            let pte = *page::walk(parent.table_mut(), VAddr::new(0x1000), false).unwrap();
            *(PAddr::from_ppn(pte).as_usize() as *mut u8) = 7;
        }

        parent.fork_into(&mut child, &mut frames, &mut disk);

        let parent_pte = *page::walk(parent.table_mut(), VAddr::new(0x1000), false).unwrap();
        let child_pte = *page::walk(child.table_mut(), VAddr::new(0x1000), false).unwrap();
        assert_ne!(
            PAddr::from_ppn(parent_pte).as_usize(),
            PAddr::from_ppn(child_pte).as_usize()
        );
        let child_byte = unsafe { *(PAddr::from_ppn(child_pte).as_usize() as *const u8) };
        assert_eq!(child_byte, 7);
    }
}
