//! `memstat` record construction: walks a process's address space and
//! classifies every page-sized slot as resident, swapped, or unmapped.
//! Grounded on the original source's `sys_memstat`.

use common::{MemStat, PageInfo, PageState, MAX_PAGES_INFO};

use crate::address::VAddr;
use crate::mem::resident::ResidentSet;
use crate::page::{self, PageTable, PAGE_SIZE};

pub fn build_memstat(
    pid: usize,
    next_fifo_seq: u64,
    sz: usize,
    table: &mut PageTable,
    resident: &ResidentSet,
) -> MemStat {
    let mut stat = MemStat::empty(pid);
    stat.next_fifo_seq = next_fifo_seq;

    let num_pages = (sz / PAGE_SIZE).min(MAX_PAGES_INFO);
    stat.num_pages_total = num_pages;

    for i in 0..num_pages {
        let va = VAddr::new(i * PAGE_SIZE);
        let pte = page::walk(table, va, false).map_or(0, |p| *p);

        let info = if page::pte_is_present(pte) {
            stat.num_resident_pages += 1;
            PageInfo {
                va: va.as_usize(),
                state: PageState::Resident,
                is_dirty: page::pte_is_dirty(pte),
                seq: resident.seq_of(va).unwrap_or(0),
                swap_slot: usize::MAX,
            }
        } else if page::pte_is_swapped(pte) {
            stat.num_swapped_pages += 1;
            PageInfo {
                va: va.as_usize(),
                state: PageState::Swapped,
                is_dirty: false,
                seq: 0,
                swap_slot: page::pte_swap_slot(pte),
            }
        } else {
            PageInfo {
                va: va.as_usize(),
                state: PageState::Unmapped,
                is_dirty: false,
                seq: 0,
                swap_slot: usize::MAX,
            }
        };

        stat.pages[i] = info;
    }

    stat
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::PAddr;
    use crate::page::{map_page, PAGE_R, PAGE_W};
    use alloc::boxed::Box;

    #[test]
    fn counts_resident_and_swapped_pages() {
        let mut table = Box::new(PageTable::new());
        let mut resident = ResidentSet::new();

        map_page(&mut table, VAddr::new(0), PAddr::new(0x9000), PAGE_R | PAGE_W);
        resident.insert(VAddr::new(0), 3);

        let stat = build_memstat(1, 4, 0x3000, &mut table, &resident);
        assert_eq!(stat.pid, 1);
        assert_eq!(stat.next_fifo_seq, 4);
        assert_eq!(stat.num_pages_total, 3);
        assert_eq!(stat.num_resident_pages, 1);
        assert_eq!(stat.pages[0].state as usize, PageState::Resident as usize);
        assert_eq!(stat.pages[0].seq, 3);
        assert_eq!(stat.pages[1].state as usize, PageState::Unmapped as usize);
    }
}
