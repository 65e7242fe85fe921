//! Allocates more pages than the resident set can hold, dirties each one,
//! then reads them back in allocation order. Exercises FIFO eviction on
//! the way up and swap-in on the way back down; the interesting part is
//! the kernel's own MEMFULL/VICTIM/EVICT/SWAPOUT/SWAPIN log lines, not
//! this process's own output.

#![no_std]
#![no_main]

use common::{PGSIZE, RESIDENT_MAX, SbrkMode};
use user::{exit, println, sbrk};

// Only the heap pages this process allocates count against its own
// resident set, so PAGES has to clear RESIDENT_MAX on its own -- with
// exec no longer preloading the image, a process starts with just its
// top stack page resident.
const PAGES: usize = RESIDENT_MAX + 3;

#[unsafe(no_mangle)]
fn main() {
    println!("swapdemo: allocating and dirtying {} pages", PAGES);

    let Some(base) = sbrk(0, SbrkMode::Lazy) else {
        println!("swapdemo: FAILED (could not read current break)");
        exit();
    };

    for i in 0..PAGES {
        if sbrk(PGSIZE as isize, SbrkMode::Lazy).is_none() {
            println!("swapdemo: FAILED (sbrk rejected at page {})", i);
            exit();
        }

        let page = (base + i * PGSIZE) as *mut u8;
        // Safety: page i was just granted by the sbrk call above.
        unsafe { page.write_volatile(b'A' + (i % 26) as u8) };
    }

    println!("swapdemo: re-reading pages in allocation order");
    for i in 0..PAGES {
        let page = (base + i * PGSIZE) as *const u8;
        // Safety: page i was granted and written above; it may have been
        // evicted since, in which case this read drives a swap-in.
        let byte = unsafe { page.read_volatile() };
        if byte != b'A' + (i % 26) as u8 {
            println!("swapdemo: FAILED (page {} read back {:#x})", i, byte);
            exit();
        }
    }

    println!("swapdemo: PASSED ({} pages round-tripped through eviction/swap-in)", PAGES);
    exit();
}
