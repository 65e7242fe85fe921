//! Panic for os1k
//!
//! Under `cargo test` the crate links std, which installs its own panic
//! handler; a second `#[panic_handler]` would conflict with it.

#![cfg(not(test))]

use core::arch::asm;
use core::panic::PanicInfo;

use crate::println;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    println!("⚠️ Panic: {}", info);

    loop {
        unsafe {asm!("wfi")};
    }
}
