//! Deep recursion exercises on-demand stack growth: each frame touches a
//! local buffer on a fresh page, forcing the fault handler to extend the
//! stack region downward one page at a time.

#![no_std]
#![no_main]

use user::{exit, println};

const DEPTH: usize = 500;

#[inline(never)]
fn deep_recursion(count: usize) {
    let mut buffer = [0u8; 256];
    // Safety: volatile write keeps the compiler from optimizing the frame away.
    unsafe { core::ptr::write_volatile(&mut buffer[0], count as u8) };

    if count > 0 {
        deep_recursion(count - 1);
    }
}

#[unsafe(no_mangle)]
fn main() {
    println!("stackgrowth: recursing {} frames deep", DEPTH);
    deep_recursion(DEPTH);
    println!("stackgrowth: PASSED (stack grew to depth {} without crashing)", DEPTH);
    exit();
}
