//! Demonstrates lazy `sbrk`: growing the heap should not itself fault in
//! any pages, only touching the new memory does.

#![no_std]
#![no_main]

use common::{PGSIZE, SbrkMode};
use user::{exit, get_char, println, sbrk};

#[unsafe(no_mangle)]
fn main() {
    println!("sbrklazy: press a key to grow the heap by 10 pages");
    get_char();

    let Some(old_brk) = sbrk(0, SbrkMode::Lazy) else {
        println!("sbrklazy: FAILED (could not read current break)");
        exit();
    };

    let Some(new_brk) = sbrk((10 * PGSIZE) as isize, SbrkMode::Lazy) else {
        println!("sbrklazy: FAILED (sbrk growth rejected)");
        exit();
    };
    println!("sbrklazy: grew break {:#x} -> {:#x}, no fault yet", old_brk, new_brk);

    println!("sbrklazy: press a key to touch page 5 of the new region");
    get_char();

    let p = (old_brk + 5 * PGSIZE) as *mut u8;
    // Safety: page 5 falls inside the region sbrk just granted.
    unsafe { p.write_volatile(1) };

    println!("sbrklazy: PASSED (page 5 write did not crash the process)");
    exit();
}
