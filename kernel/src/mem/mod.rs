//! The demand-paged virtual memory subsystem: Frame Allocator, Swap
//! Store, Resident Set, Fault Handler and Replacement Policy. Every
//! module here is pure logic with no inline assembly, so it compiles and
//! runs unit tests on the host under `cargo test` even though the kernel
//! binary as a whole is `no_std`/`no_main`.

pub mod fault;
pub mod frame;
pub mod replace;
pub mod resident;
pub mod stat;
pub mod swap;
