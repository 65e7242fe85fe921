//! Touching an address far outside the heap and stack window must get
//! the process killed by the fault handler before it prints anything
//! after the access.

#![no_std]
#![no_main]

use user::{exit, println};

const BAD_ADDR: usize = 0x1000_0000;

#[unsafe(no_mangle)]
fn main() {
    println!("invalidaccess: writing to {:#x}, should not return", BAD_ADDR);

    let p = BAD_ADDR as *mut u8;
    // Safety: none — this address is intentionally outside every mapped
    // region so the fault handler kills the process here.
    unsafe { p.write_volatile(1) };

    println!("invalidaccess: FAILED (write to unmapped page did not kill the process)");
    exit();
}
