//! Replacement Policy: per-process FIFO page eviction.
//!
//! Invoked by the Frame Allocator's caller when the free list is
//! exhausted. Selects the oldest resident page (lowest FIFO `seq`),
//! writes its contents to a freshly allocated swap slot, rewrites its PTE
//! to the swapped tagged encoding, drops it from the resident set, and
//! returns the freed frame to the pool — mirroring the original source's
//! `do_page_replacement` → `kfree` retry loop in `kalloc()`.

use crate::address::{PAddr, VAddr};
use crate::mem::frame::FramePool;
use crate::mem::resident::ResidentSet;
use crate::mem::swap::{BlockDevice, SwapStore};
use crate::page::{self, PageTable, PAGE_SIZE};

/// What got evicted, for the caller to turn into `VICTIM`/`EVICT`
/// diagnostic log lines.
#[derive(Clone, Copy, Debug)]
pub struct EvictionRecord {
    pub va: usize,
    pub seq: u64,
    pub slot: usize,
}

/// Evicts the oldest resident page, if any. Returns `None` only when the
/// resident set is empty — an empty resident set with an exhausted frame
/// pool means the process itself owns no reclaimable memory, which the
/// caller must turn into a `MEMFULL`-with-no-victim condition.
pub fn evict_oldest(
    resident: &mut ResidentSet,
    table: &mut PageTable,
    swap: &mut SwapStore,
    frames: &mut FramePool,
    dev: &mut impl BlockDevice,
) -> Option<EvictionRecord> {
    let victim = resident.oldest()?;
    let va = VAddr::new(victim.va);

    let pte_ref = page::walk(table, va, false)
        .expect("resident entry must have a leaf PTE");
    let pte = *pte_ref;
    assert!(page::pte_is_present(pte), "resident entry PTE not present");

    let paddr = PAddr::from_ppn(pte);
    let page_bytes = unsafe {
        &*(paddr.as_usize() as *const [u8; PAGE_SIZE])
    };

    let slot = swap
        .alloc_slot()
        .expect("swap region exhausted for a process within its resident bound");
    swap.write_slot(dev, slot, page_bytes);

    *pte_ref = page::encode_swap(pte, slot);

    resident.remove(va);

    // Safety: the frame is no longer referenced by any present PTE; its
    // contents were just persisted to `slot`.
    unsafe { frames.free(paddr) };

    Some(EvictionRecord {
        va: victim.va,
        seq: victim.seq,
        slot,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::swap::SwapStore;
    use crate::page::{map_page, PAGE_R, PAGE_W};
    use alloc::alloc::{alloc_zeroed, Layout};
    use alloc::boxed::Box;
    use alloc::collections::BTreeMap;
    use common::MAX_SWAP_SLOTS;
    use crate::virtio::SECTOR_SIZE;

    struct FakeDisk(BTreeMap<u64, [u8; SECTOR_SIZE]>);

    impl BlockDevice for FakeDisk {
        fn read_sector(&mut self, sector: u64, buf: &mut [u8; SECTOR_SIZE]) {
            *buf = *self.0.get(&sector).unwrap_or(&[0u8; SECTOR_SIZE]);
        }

        fn write_sector(&mut self, sector: u64, buf: &[u8; SECTOR_SIZE]) {
            self.0.insert(sector, *buf);
        }
    }

    fn host_frame(byte: u8) -> PAddr {
        let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        unsafe { core::ptr::write_bytes(ptr, byte, PAGE_SIZE) };
        PAddr::new(ptr as usize)
    }

    #[test]
    fn evicts_lowest_seq_and_preserves_contents() {
        let mut table = Box::new(PageTable::new());
        let mut resident = ResidentSet::new();
        let mut swap = SwapStore::new(7);
        let mut disk = FakeDisk(BTreeMap::new());
        let _ = MAX_SWAP_SLOTS;

        let frame_a = host_frame(0xAA);
        let frame_b = host_frame(0xBB);

        map_page(&mut table, VAddr::new(0x1000), frame_a, PAGE_R | PAGE_W);
        map_page(&mut table, VAddr::new(0x2000), frame_b, PAGE_R | PAGE_W);
        resident.insert(VAddr::new(0x1000), 5);
        resident.insert(VAddr::new(0x2000), 2);

        // Frame pool content is irrelevant to eviction; give it a small
        // backing region so `free` has somewhere harmless to land.
        let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) } as usize;
        let mut frames = unsafe { FramePool::new(PAddr::new(ptr), PAddr::new(ptr + PAGE_SIZE)) };
        let _ = frames.alloc(); // drain it so num_free reflects post-evict addition

        let record = evict_oldest(&mut resident, &mut table, &mut swap, &mut frames, &mut disk)
            .expect("resident set is non-empty");

        assert_eq!(record.va, 0x2000);
        assert_eq!(record.seq, 2);
        assert!(!resident.contains(VAddr::new(0x2000)));
        assert!(resident.contains(VAddr::new(0x1000)));
        assert_eq!(frames.num_free(), 1);

        let mut back = [0u8; PAGE_SIZE];
        swap.read_slot(&mut disk, record.slot, &mut back);
        assert!(back.iter().all(|&b| b == 0xBB));

        let pte = *page::walk(&mut table, VAddr::new(0x2000), false).unwrap();
        assert!(page::pte_is_swapped(pte));
        assert_eq!(page::pte_swap_slot(pte), record.slot);
    }
}
