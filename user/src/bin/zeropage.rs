//! Verifies demand-zero fill: a freshly sbrk'd page must read back as all
//! zero bytes even though the kernel never copied anything into it.

#![no_std]
#![no_main]

use common::{PGSIZE, SbrkMode};
use user::{exit, println, sbrk};

#[unsafe(no_mangle)]
fn main() {
    let Some(old_brk) = sbrk(PGSIZE as isize, SbrkMode::Lazy) else {
        println!("zeropage: FAILED (sbrk rejected)");
        exit();
    };

    let page = old_brk as *const u8;
    for i in 0..PGSIZE {
        // Safety: the page was just granted by sbrk above.
        let byte = unsafe { page.add(i).read_volatile() };
        if byte != 0 {
            println!("zeropage: FAILED (byte {} was {:#x}, expected 0)", i, byte);
            exit();
        }
    }

    println!("zeropage: PASSED (all {} bytes were zero)", PGSIZE);
    exit();
}
