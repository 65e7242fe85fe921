//! Fault Handler: classifies a faulting virtual address and dispatches to
//! zero-fill, swap-in, or kill.
//!
//! Grounded on the original source's `usertrap()` page-fault branch: a
//! present PTE that still faults is an invalid access (kill); a PTE with
//! `V=0, S=1` is a swap-in; everything else is a fresh-demand fault,
//! classified by address range into heap, stack, or exec, and refused
//! outside `[0, sz)` plus the stack window.

use crate::address::{align_down, PAddr, VAddr};
use crate::mem::frame::FramePool;
use crate::mem::replace::{self, EvictionRecord};
use crate::mem::resident::ResidentSet;
use crate::mem::swap::{BlockDevice, SwapStore};
use crate::page::{self, PageTable, PAGE_R, PAGE_SIZE, PAGE_U, PAGE_W, PAGE_X};

/// Why a fresh-demand fault is being resolved — drives the permission
/// bits the new mapping gets and which `PAGEFAULT cause=` token is logged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultCause {
    Heap,
    Stack,
    Exec,
    Swap,
    Invalid,
}

/// Which kind of access trapped — derived from `scause` (instruction,
/// load, or store page fault) and carried through to the `PAGEFAULT`/
/// `KILL` log lines' `access=` token.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultAccess {
    Read,
    Write,
    Exec,
}

#[derive(Debug)]
pub enum FaultOutcome {
    /// A page became resident: zero-filled (`Heap`/`Stack`/`Exec`) or read
    /// back from a swap slot (`Swap`, with `slot` set to where it came
    /// from).
    Resolved {
        va: usize,
        seq: u64,
        cause: FaultCause,
        access: FaultAccess,
        slot: Option<usize>,
        eviction: Option<EvictionRecord>,
    },
    /// The access cannot be resolved; the process must be killed.
    Killed { access: FaultAccess },
}

/// Everything the Fault Handler needs about the faulting process. Kept as
/// a plain struct of borrows rather than threading `Process` itself
/// through, so the handler only depends on what it actually touches.
pub struct FaultContext<'a> {
    pub table: &'a mut PageTable,
    pub resident: &'a mut ResidentSet,
    pub swap: &'a mut SwapStore,
    pub frames: &'a mut FramePool,
    pub sz: usize,
    pub exe_end: usize,
    pub stack_bottom: usize,
    pub next_fifo_seq: &'a mut u64,
}

const STACK_WINDOW: usize = PAGE_SIZE * 16;

/// Classifies a fault address for a process that has no existing PTE
/// (i.e. not swap, not invalid-access-on-a-present-page). Mirrors the
/// original source's range checks in `usertrap()`: exec text/data is
/// `[0, exe_end)`, heap is `[exe_end, sz)`, stack is a fixed window below
/// the stack pointer that was mapped at exec time.
pub fn classify_fresh(va: usize, sz: usize, exe_end: usize, stack_bottom: usize) -> FaultCause {
    if va < exe_end {
        FaultCause::Exec
    } else if va < sz {
        FaultCause::Heap
    } else if va >= stack_bottom.saturating_sub(STACK_WINDOW) && va < stack_bottom {
        FaultCause::Stack
    } else {
        FaultCause::Invalid
    }
}

/// Ensures a frame is available for a page about to become resident,
/// evicting via the Replacement Policy if either the frame pool is
/// exhausted or the process's own resident set is already at
/// `RESIDENT_MAX` (spec's two eviction triggers — an empty allocator and
/// an at-capacity resident set are independent conditions, since
/// `RESIDENT_MAX` can be reached with frames still free in the shared
/// pool). Returns the frame and, if an eviction happened, the record of
/// what got evicted (for the `MEMFULL`/`VICTIM`/`EVICT` log lines).
fn ensure_frame(
    frames: &mut FramePool,
    resident: &mut ResidentSet,
    table: &mut PageTable,
    swap: &mut SwapStore,
    dev: &mut impl BlockDevice,
) -> (PAddr, Option<EvictionRecord>) {
    if !resident.is_full() {
        if let Some(frame) = frames.alloc() {
            return (frame, None);
        }
    }

    let record = replace::evict_oldest(resident, table, swap, frames, dev)
        .expect("resident set must be non-empty when forced to evict");
    let frame = frames
        .alloc()
        .expect("evicting a resident page must free exactly one frame");
    (frame, Some(record))
}

/// Resolves a fault whose faulting address has no PTE at all yet (or an
/// unmapped-but-in-range one): zeroes a fresh frame, then for an `Exec`
/// cause additionally copies in whatever segment bytes the executable
/// image covers at this offset (`memsz` may exceed `filesz`; bytes past
/// `exec_image`'s length stay zero), and maps it with permissions
/// appropriate to `cause`.
pub fn resolve_zero_fill(
    ctx: &mut FaultContext,
    dev: &mut impl BlockDevice,
    va: VAddr,
    cause: FaultCause,
    access: FaultAccess,
    exec_image: Option<&[u8]>,
) -> FaultOutcome {
    debug_assert!(matches!(cause, FaultCause::Heap | FaultCause::Stack | FaultCause::Exec));

    let (frame, evicted) = ensure_frame(ctx.frames, ctx.resident, ctx.table, ctx.swap, dev);

    // Safety: `frame` was just allocated and is exclusively ours.
    unsafe { core::ptr::write_bytes(frame.as_usize() as *mut u8, 0, PAGE_SIZE) };

    if cause == FaultCause::Exec {
        if let Some(image) = exec_image {
            let offset = va.as_usize();
            if offset < image.len() {
                let len = core::cmp::min(PAGE_SIZE, image.len() - offset);
                let src = &image[offset..offset + len];
                // Safety: `frame` holds a full zeroed page and len <= PAGE_SIZE.
                let dst = unsafe { core::slice::from_raw_parts_mut(frame.as_usize() as *mut u8, len) };
                dst.copy_from_slice(src);
            }
        }
    }

    let perms = match cause {
        FaultCause::Exec => PAGE_R | PAGE_X | PAGE_U,
        _ => PAGE_R | PAGE_W | PAGE_U,
    };
    page::map_page(ctx.table, va, frame, perms);

    let seq = *ctx.next_fifo_seq;
    *ctx.next_fifo_seq += 1;
    ctx.resident.insert(va, seq);

    FaultOutcome::Resolved { va: va.as_usize(), seq, cause, access, slot: None, eviction: evicted }
}

/// Resolves a fault against a PTE tagged as swapped out: allocates a
/// frame, reads the slot back, restores the saved permissions, frees the
/// slot, and re-inserts the page into the resident set with a fresh FIFO
/// sequence number (the page is being re-admitted, not un-evicted in
/// place, matching the original source's `SWAPIN` handling).
pub fn resolve_swap_in(ctx: &mut FaultContext, dev: &mut impl BlockDevice, va: VAddr, access: FaultAccess) -> FaultOutcome {
    let pte = *page::walk(ctx.table, va, false).expect("swapped PTE must have a leaf entry");
    assert!(page::pte_is_swapped(pte), "resolve_swap_in called on a non-swapped PTE");

    let slot = page::pte_swap_slot(pte);
    let perms = page::pte_perm_bits(pte);

    let (frame, evicted) =
        ensure_frame(ctx.frames, ctx.resident, ctx.table, ctx.swap, dev);

    let mut page_buf = [0u8; PAGE_SIZE];
    ctx.swap.read_slot(dev, slot, &mut page_buf);
    unsafe {
        core::ptr::copy_nonoverlapping(page_buf.as_ptr(), frame.as_usize() as *mut u8, PAGE_SIZE);
    }
    ctx.swap.free_slot(slot);

    page::map_page(ctx.table, va, frame, perms);

    let seq = *ctx.next_fifo_seq;
    *ctx.next_fifo_seq += 1;
    ctx.resident.insert(va, seq);

    FaultOutcome::Resolved { va: va.as_usize(), seq, cause: FaultCause::Swap, access, slot: Some(slot), eviction: evicted }
}

/// Top-level entry point mirroring `usertrap()`'s page-fault branch:
/// looks at the existing PTE (if any) to decide swap-in vs invalid-access
/// vs fresh-demand, then dispatches. `exec_image` is the faulting
/// process's executable bytes, used only when a fresh-demand fault
/// classifies as `Exec`.
pub fn handle_page_fault(
    ctx: &mut FaultContext,
    dev: &mut impl BlockDevice,
    fault_va: usize,
    access: FaultAccess,
    exec_image: Option<&[u8]>,
) -> FaultOutcome {
    let va = VAddr::new(align_down(fault_va, PAGE_SIZE));
    let existing = page::walk(ctx.table, va, false).copied();

    match existing {
        Some(pte) if page::pte_is_swapped(pte) => resolve_swap_in(ctx, dev, va, access),
        Some(pte) if page::pte_is_present(pte) => FaultOutcome::Killed { access },
        _ => {
            let cause = classify_fresh(va.as_usize(), ctx.sz, ctx.exe_end, ctx.stack_bottom);
            if cause == FaultCause::Invalid {
                FaultOutcome::Killed { access }
            } else {
                resolve_zero_fill(ctx, dev, va, cause, access, exec_image)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::swap::SwapStore;
    use crate::virtio::SECTOR_SIZE;
    use alloc::alloc::{alloc_zeroed, Layout};
    use alloc::boxed::Box;
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

    #[test]
    fn classify_fresh_partitions_address_space() {
        let sz = 0x3000;
        let exe_end = 0x1000;
        let stack_bottom = 0x8000_0000;
        assert_eq!(classify_fresh(0x500, sz, exe_end, stack_bottom), FaultCause::Exec);
        assert_eq!(classify_fresh(0x1500, sz, exe_end, stack_bottom), FaultCause::Heap);
        assert_eq!(
            classify_fresh(stack_bottom - 0x1000, sz, exe_end, stack_bottom),
            FaultCause::Stack
        );
        assert_eq!(classify_fresh(0x5000_0000, sz, exe_end, stack_bottom), FaultCause::Invalid);
    }

    #[test]
    fn zero_fill_maps_and_tracks_resident_seq() {
        let mut table = Box::new(PageTable::new());
        let mut resident = ResidentSet::new();
        let mut swap = SwapStore::new(1);
        let mut frames = pool(2);
        let mut seq = 0u64;
        let mut disk = FakeDisk(BTreeMap::new());

        let mut ctx = FaultContext {
            table: &mut table,
            resident: &mut resident,
            swap: &mut swap,
            frames: &mut frames,
            sz: 0x10000,
            exe_end: 0x1000,
            stack_bottom: 0x8000_0000,
            next_fifo_seq: &mut seq,
        };

        let outcome = handle_page_fault(&mut ctx, &mut disk, 0x4000, FaultAccess::Write, None);
        match outcome {
            FaultOutcome::Resolved { va, seq, cause, slot, .. } => {
                assert_eq!(va, 0x4000);
                assert_eq!(seq, 0);
                assert_eq!(cause, FaultCause::Heap);
                assert_eq!(slot, None);
            }
            other => panic!("expected a resolved fault, got {:?}", other),
        }
        assert!(resident.contains(VAddr::new(0x4000)));
        assert_eq!(seq, 1);
    }

    #[test]
    fn exec_cause_loads_segment_bytes_and_zero_fills_tail() {
        let mut table = Box::new(PageTable::new());
        let mut resident = ResidentSet::new();
        let mut swap = SwapStore::new(1);
        let mut frames = pool(1);
        let mut seq = 0u64;
        let mut disk = FakeDisk(BTreeMap::new());

        let mut ctx = FaultContext {
            table: &mut table,
            resident: &mut resident,
            swap: &mut swap,
            frames: &mut frames,
            sz: 0x1000,
            exe_end: 0x1000,
            stack_bottom: 0x8000_0000,
            next_fifo_seq: &mut seq,
        };

        let mut image = [0u8; 0x100];
        image[0] = 0x13; // a real exec image would start with an instruction
        image[0xff] = 0x7f;

        let outcome = handle_page_fault(&mut ctx, &mut disk, 0x0, FaultAccess::Exec, Some(&image));
        assert!(matches!(outcome, FaultOutcome::Resolved { cause: FaultCause::Exec, .. }));

        let pte = *page::walk(&mut table, VAddr::new(0x0), false).unwrap();
        let frame = PAddr::from_ppn(pte).as_usize();
        let page_bytes = unsafe { core::slice::from_raw_parts(frame as *const u8, PAGE_SIZE) };
        assert_eq!(page_bytes[0], 0x13);
        assert_eq!(page_bytes[0xff], 0x7f);
        assert!(page_bytes[0x100..].iter().all(|&b| b == 0));
    }

    #[test]
    fn out_of_range_access_is_killed() {
        let mut table = Box::new(PageTable::new());
        let mut resident = ResidentSet::new();
        let mut swap = SwapStore::new(1);
        let mut frames = pool(1);
        let mut seq = 0u64;
        let mut disk = FakeDisk(BTreeMap::new());

        let mut ctx = FaultContext {
            table: &mut table,
            resident: &mut resident,
            swap: &mut swap,
            frames: &mut frames,
            sz: 0x2000,
            exe_end: 0x1000,
            stack_bottom: 0x8000_0000,
            next_fifo_seq: &mut seq,
        };

        let outcome = handle_page_fault(&mut ctx, &mut disk, 0x1234_5678, FaultAccess::Read, None);
        assert!(matches!(outcome, FaultOutcome::Killed { access: FaultAccess::Read }));
    }

    #[test]
    fn present_page_refault_is_invalid_access() {
        let mut table = Box::new(PageTable::new());
        let mut resident = ResidentSet::new();
        let mut swap = SwapStore::new(1);
        let mut frames = pool(2);
        let mut seq = 0u64;
        let mut disk = FakeDisk(BTreeMap::new());

        let mut ctx = FaultContext {
            table: &mut table,
            resident: &mut resident,
            swap: &mut swap,
            frames: &mut frames,
            sz: 0x10000,
            exe_end: 0x1000,
            stack_bottom: 0x8000_0000,
            next_fifo_seq: &mut seq,
        };
        let _ = handle_page_fault(&mut ctx, &mut disk, 0x4000, FaultAccess::Write, None);
        let outcome = handle_page_fault(&mut ctx, &mut disk, 0x4000, FaultAccess::Write, None);
        assert!(matches!(outcome, FaultOutcome::Killed { .. }));
    }

    #[test]
    fn swap_in_restores_contents_and_permissions() {
        let mut table = Box::new(PageTable::new());
        let mut resident = ResidentSet::new();
        let mut swap = SwapStore::new(2);
        let mut frames = pool(1);
        let mut seq = 0u64;
        let mut disk = FakeDisk(BTreeMap::new());

        let mut ctx = FaultContext {
            table: &mut table,
            resident: &mut resident,
            swap: &mut swap,
            frames: &mut frames,
            sz: 0x10000,
            exe_end: 0x1000,
            stack_bottom: 0x8000_0000,
            next_fifo_seq: &mut seq,
        };

        let _ = handle_page_fault(&mut ctx, &mut disk, 0x4000, FaultAccess::Write, None);
        let pte = *page::walk(&mut table, VAddr::new(0x4000), false).unwrap();
        unsafe {
            *(PAddr::from_ppn(pte).as_usize() as *mut u8) = 0x42;
        }

        // Force eviction of the only resident page by demanding a second one.
        let outcome = handle_page_fault(&mut ctx, &mut disk, 0x5000, FaultAccess::Write, None);
        assert!(matches!(outcome, FaultOutcome::Resolved { cause: FaultCause::Heap, .. }));
        assert!(resident.contains(VAddr::new(0x5000)));
        assert!(!resident.contains(VAddr::new(0x4000)));

        let pte = *page::walk(&mut table, VAddr::new(0x4000), false).unwrap();
        assert!(page::pte_is_swapped(pte));

        let outcome = handle_page_fault(&mut ctx, &mut disk, 0x4000, FaultAccess::Read, None);
        match outcome {
            FaultOutcome::Resolved { va, cause, slot, .. } => {
                assert_eq!(va, 0x4000);
                assert_eq!(cause, FaultCause::Swap);
                assert!(slot.is_some());
            }
            other => panic!("expected swap-in, got {:?}", other),
        }
        let pte = *page::walk(&mut table, VAddr::new(0x4000), false).unwrap();
        assert!(page::pte_is_present(pte));
        let restored = unsafe { *(PAddr::from_ppn(pte).as_usize() as *const u8) };
        assert_eq!(restored, 0x42);
    }

    #[test]
    fn resident_set_at_capacity_evicts_even_with_frames_free() {
        let mut table = Box::new(PageTable::new());
        let mut resident = ResidentSet::new();
        let mut swap = SwapStore::new(1);
        let mut frames = pool(common::RESIDENT_MAX + 4); // plenty of physical frames
        let mut seq = 0u64;
        let mut disk = FakeDisk(BTreeMap::new());

        let mut ctx = FaultContext {
            table: &mut table,
            resident: &mut resident,
            swap: &mut swap,
            frames: &mut frames,
            sz: 0x1000 + (common::RESIDENT_MAX + 2) * PAGE_SIZE,
            exe_end: 0x1000,
            stack_bottom: 0x8000_0000,
            next_fifo_seq: &mut seq,
        };

        for i in 0..common::RESIDENT_MAX {
            let va = 0x1000 + i * PAGE_SIZE;
            let outcome = handle_page_fault(&mut ctx, &mut disk, va, FaultAccess::Write, None);
            assert!(matches!(outcome, FaultOutcome::Resolved { eviction: None, .. }));
        }
        assert_eq!(ctx.resident.len(), common::RESIDENT_MAX);
        assert!(ctx.frames.num_free() > 0, "plenty of frames should still be free");

        let one_more = 0x1000 + common::RESIDENT_MAX * PAGE_SIZE;
        let outcome = handle_page_fault(&mut ctx, &mut disk, one_more, FaultAccess::Write, None);
        match outcome {
            FaultOutcome::Resolved { eviction: Some(record), .. } => {
                assert_eq!(record.va, 0x1000);
            }
            other => panic!("expected an eviction once the resident set was full, got {:?}", other),
        }
        assert_eq!(ctx.resident.len(), common::RESIDENT_MAX);
    }
}
