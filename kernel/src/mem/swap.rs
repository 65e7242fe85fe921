//! Swap Store: a per-process fixed-size region of swap slots on the block
//! device.
//!
//! No writable filesystem exists in this kernel (the tar filesystem is a
//! read-only boot image, replayed whole). Rather than invent one, each
//! process's swap area is a directly-addressed window of sectors on the
//! virtio-blk device, carved out past the boot filesystem's region:
//!
//!   sector = SWAP_REGION_BASE + pid * MAX_SWAP_SLOTS * SECTORS_PER_PAGE
//!            + slot * SECTORS_PER_PAGE
//!
//! `BlockDevice` is the seam between this pure slot-bookkeeping logic and
//! the real virtio-blk driver, so the allocate/free bitmap and the
//! round-trip contract can be unit tested without hardware.

use common::MAX_SWAP_SLOTS;

use crate::page::PAGE_SIZE;
use crate::virtio::SECTOR_SIZE;

pub const SECTORS_PER_PAGE: u64 = (PAGE_SIZE / SECTOR_SIZE) as u64;
pub const SWAP_REGION_BASE: u64 = 4096; // sectors; past the tar boot image

pub trait BlockDevice {
    fn read_sector(&mut self, sector: u64, buf: &mut [u8; SECTOR_SIZE]);
    fn write_sector(&mut self, sector: u64, buf: &[u8; SECTOR_SIZE]);
}

#[derive(Debug)]
pub struct SwapStore {
    pid: usize,
    occupied: [bool; MAX_SWAP_SLOTS],
    region_ready: bool,
}

impl SwapStore {
    pub const fn new(pid: usize) -> Self {
        Self {
            pid,
            occupied: [false; MAX_SWAP_SLOTS],
            region_ready: false,
        }
    }

    /// Idempotent: a directly-addressed region needs no on-disk allocation
    /// step, just a marker that it's in use so double-init is a no-op.
    pub fn ensure_region(&mut self) {
        self.region_ready = true;
    }

    fn base_sector(&self) -> u64 {
        SWAP_REGION_BASE + self.pid as u64 * MAX_SWAP_SLOTS as u64 * SECTORS_PER_PAGE
    }

    fn sector_of(&self, slot: usize) -> u64 {
        self.base_sector() + slot as u64 * SECTORS_PER_PAGE
    }

    /// Claims the first free slot.
    pub fn alloc_slot(&mut self) -> Option<usize> {
        let slot = self.occupied.iter().position(|&used| !used)?;
        self.occupied[slot] = true;
        Some(slot)
    }

    pub fn free_slot(&mut self, slot: usize) {
        assert!(self.occupied[slot], "double free of swap slot {}", slot);
        self.occupied[slot] = false;
    }

    pub fn num_free(&self) -> usize {
        self.occupied.iter().filter(|&&used| !used).count()
    }

    /// Writes one page out to `slot`, `PAGE_SIZE` bytes in `SECTOR_SIZE`
    /// chunks.
    pub fn write_slot(&self, dev: &mut impl BlockDevice, slot: usize, page: &[u8; PAGE_SIZE]) {
        assert!(self.occupied[slot], "write to unallocated swap slot {}", slot);
        let base = self.sector_of(slot);
        for i in 0..SECTORS_PER_PAGE {
            let off = (i as usize) * SECTOR_SIZE;
            let mut buf = [0u8; SECTOR_SIZE];
            buf.copy_from_slice(&page[off..off + SECTOR_SIZE]);
            dev.write_sector(base + i, &buf);
        }
    }

    /// Reads one page back from `slot`.
    pub fn read_slot(&self, dev: &mut impl BlockDevice, slot: usize, page: &mut [u8; PAGE_SIZE]) {
        assert!(self.occupied[slot], "read of unallocated swap slot {}", slot);
        let base = self.sector_of(slot);
        for i in 0..SECTORS_PER_PAGE {
            let off = (i as usize) * SECTOR_SIZE;
            let mut buf = [0u8; SECTOR_SIZE];
            dev.read_sector(base + i, &mut buf);
            page[off..off + SECTOR_SIZE].copy_from_slice(&buf);
        }
    }

    pub fn reset(&mut self) {
        self.occupied = [false; MAX_SWAP_SLOTS];
        self.region_ready = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    #[test]
    fn alloc_free_round_trips_bitmap() {
        let mut store = SwapStore::new(3);
        let a = store.alloc_slot().unwrap();
        let b = store.alloc_slot().unwrap();
        assert_ne!(a, b);
        assert_eq!(store.num_free(), MAX_SWAP_SLOTS - 2);

        store.free_slot(a);
        assert_eq!(store.num_free(), MAX_SWAP_SLOTS - 1);
        let c = store.alloc_slot().unwrap();
        assert_eq!(c, a);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let mut store = SwapStore::new(0);
        let slot = store.alloc_slot().unwrap();
        store.free_slot(slot);
        store.free_slot(slot);
    }

    #[test]
    fn write_then_read_round_trips_page_contents() {
        let mut disk = FakeDisk(BTreeMap::new());
        let mut store = SwapStore::new(1);
        let slot = store.alloc_slot().unwrap();

        let mut page = [0u8; PAGE_SIZE];
        for (i, b) in page.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        store.write_slot(&mut disk, slot, &page);

        let mut back = [0u8; PAGE_SIZE];
        store.read_slot(&mut disk, slot, &mut back);
        assert_eq!(page, back);
    }

    #[test]
    fn distinct_processes_get_disjoint_sector_windows() {
        let a = SwapStore::new(1);
        let b = SwapStore::new(2);
        let a_end = a.sector_of(MAX_SWAP_SLOTS - 1) + SECTORS_PER_PAGE;
        assert!(a_end <= b.sector_of(0));
    }
}
