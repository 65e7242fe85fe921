//! Kernel entry: the trap trampoline, page-fault dispatch and syscall
//! table. Everything here only makes sense with a real trap vector and
//! `satp`-switched address spaces behind it, so the whole module is
//! excluded from host test builds.

#[cfg(not(test))]
mod imp {
use alloc::slice;
use core::arch::naked_asm;

use common::{
    MemStat, SbrkMode, SYS_EXIT, SYS_FORK, SYS_GETCHAR, SYS_GETPID, SYS_KILL, SYS_MEMSTAT,
    SYS_PAUSE, SYS_PUTBYTE, SYS_READFILE, SYS_SBRK, SYS_UPTIME, SYS_WAIT, SYS_WRITEFILE,
};

use crate::address::VAddr;
use crate::allocator::user_frames;
use crate::mem::fault::{FaultAccess, FaultCause, FaultOutcome};
use crate::process::{Process, PROCS, State};
use crate::sbi::{put_byte, get_char};
use crate::scheduler::{yield_now, CURRENT_PROC};
use crate::tar::{FILES, fs_flush};
use crate::virtio::VirtioBlockDevice;
use crate::{println, read_csr, write_csr};

const SCAUSE_ECALL: usize = 8;
const SCAUSE_INSN_PAGE_FAULT: usize = 12;
const SCAUSE_LOAD_PAGE_FAULT: usize = 13;
const SCAUSE_STORE_PAGE_FAULT: usize = 15;

#[repr(C, packed)]
struct TrapFrame{
    ra: usize,
    gp: usize,
    tp: usize,
    t0: usize,
    t1: usize,
    t2: usize,
    t3: usize,
    t4: usize,
    t5: usize,
    t6: usize,
    a0: usize,
    a1: usize,
    a2: usize,
    a3: usize,
    a4: usize,
    a5: usize,
    a6: usize,
    a7: usize,
    s0: usize,
    s1: usize,
    s2: usize,
    s3: usize,
    s4: usize,
    s5: usize,
    s6: usize,
    s7: usize,
    s8: usize,
    s9: usize,
    s10: usize,
    s11: usize,
    sp: usize,
}

// Byte offset of the trap frame kernel_entry pushes onto a process's own
// stack, from the end of the stack array: 31 saved words.
const TRAPFRAME_BYTES: usize = 4 * 31;

/// Wires up a forked child's kernel stack so its first context switch
/// resumes user execution at `resume_pc` with `a0 = 0`, instead of going
/// through `user_entry`. The trap frame `kernel_entry` pushed for the
/// parent's fork syscall was copied byte-for-byte into the child's stack
/// (same registers, same stack pointer, since the child's address space
/// is a full copy at the same virtual addresses); this only patches `a0`
/// and stashes `resume_pc` for `fork_child_entry` to pick up, then points
/// `switch_context`'s restore slot at that frame instead of a fresh
/// bootstrap block.
fn setup_fork_child(child: &mut Process, resume_pc: usize) {
    let stack_len = child.stack.len();
    let frame_base = stack_len - TRAPFRAME_BYTES;
    let a0_off = frame_base + TRAPFRAME_A0_WORD * 4;
    child.stack[a0_off..a0_off + 4].copy_from_slice(&0u32.to_ne_bytes());

    let resume_pc_off = frame_base - 4;
    child.stack[resume_pc_off..resume_pc_off + 4].copy_from_slice(&(resume_pc as u32).to_ne_bytes());

    let bootstrap_off = resume_pc_off - 13 * 4;
    let frame_base_addr = &raw const child.stack[frame_base] as usize;
    let mut regs = [0usize; 13];
    regs[0] = fork_child_entry as usize; // ra
    regs[12] = frame_base_addr; // sp, read back by switch_context into the live sp register
    let mut off = bootstrap_off;
    for reg in &regs {
        child.stack[off..off + 4].copy_from_slice(&reg.to_ne_bytes());
        off += 4;
    }

    child.sp = VAddr::new(&raw const child.stack[bootstrap_off] as usize);
}

const TRAPFRAME_A0_WORD: usize = 10;

#[unsafe(naked)]
unsafe extern "C" fn fork_child_entry() {
    naked_asm!(
        ".align 2",
        "lw t0, -4(sp)",
        "csrw sepc, t0",
        "lw ra,  4 * 0(sp)",
        "lw gp,  4 * 1(sp)",
        "lw tp,  4 * 2(sp)",
        "lw t0,  4 * 3(sp)",
        "lw t1,  4 * 4(sp)",
        "lw t2,  4 * 5(sp)",
        "lw t3,  4 * 6(sp)",
        "lw t4,  4 * 7(sp)",
        "lw t5,  4 * 8(sp)",
        "lw t6,  4 * 9(sp)",
        "lw a0,  4 * 10(sp)",
        "lw a1,  4 * 11(sp)",
        "lw a2,  4 * 12(sp)",
        "lw a3,  4 * 13(sp)",
        "lw a4,  4 * 14(sp)",
        "lw a5,  4 * 15(sp)",
        "lw a6,  4 * 16(sp)",
        "lw a7,  4 * 17(sp)",
        "lw s0,  4 * 18(sp)",
        "lw s1,  4 * 19(sp)",
        "lw s2,  4 * 20(sp)",
        "lw s3,  4 * 21(sp)",
        "lw s4,  4 * 22(sp)",
        "lw s5,  4 * 23(sp)",
        "lw s6,  4 * 24(sp)",
        "lw s7,  4 * 25(sp)",
        "lw s8,  4 * 26(sp)",
        "lw s9,  4 * 27(sp)",
        "lw s10, 4 * 28(sp)",
        "lw s11, 4 * 29(sp)",
        "lw sp,  4 * 30(sp)",
        "sret",
    )
}

#[unsafe(naked)]
pub unsafe extern "C" fn kernel_entry() {
    naked_asm!(
        ".align 2",
        // Retrieve the kernel stack of the running process from sscratch.
        "csrrw sp, sscratch, sp",
        "addi sp, sp, -4 * 31",
        "sw ra,  4 * 0(sp)",
        "sw gp,  4 * 1(sp)",
        "sw tp,  4 * 2(sp)",
        "sw t0,  4 * 3(sp)",
        "sw t1,  4 * 4(sp)",
        "sw t2,  4 * 5(sp)",
        "sw t3,  4 * 6(sp)",
        "sw t4,  4 * 7(sp)",
        "sw t5,  4 * 8(sp)",
        "sw t6,  4 * 9(sp)",
        "sw a0,  4 * 10(sp)",
        "sw a1,  4 * 11(sp)",
        "sw a2,  4 * 12(sp)",
        "sw a3,  4 * 13(sp)",
        "sw a4,  4 * 14(sp)",
        "sw a5,  4 * 15(sp)",
        "sw a6,  4 * 16(sp)",
        "sw a7,  4 * 17(sp)",
        "sw s0,  4 * 18(sp)",
        "sw s1,  4 * 19(sp)",
        "sw s2,  4 * 20(sp)",
        "sw s3,  4 * 21(sp)",
        "sw s4,  4 * 22(sp)",
        "sw s5,  4 * 23(sp)",
        "sw s6,  4 * 24(sp)",
        "sw s7,  4 * 25(sp)",
        "sw s8,  4 * 26(sp)",
        "sw s9,  4 * 27(sp)",
        "sw s10, 4 * 28(sp)",
        "sw s11, 4 * 29(sp)",

        // Retrieve and save the sp at the time of exeception
        "csrr a0, sscratch",
        "sw a0, 4 * 30(sp)",

        // Reset the kernel stack.
        "addi a0, sp, 4 * 31",
        "csrw sscratch, a0",

        "mv a0, sp",
        "call handle_trap",

        "lw ra,  4 * 0(sp)",
        "lw gp,  4 * 1(sp)",
        "lw tp,  4 * 2(sp)",
        "lw t0,  4 * 3(sp)",
        "lw t1,  4 * 4(sp)",
        "lw t2,  4 * 5(sp)",
        "lw t3,  4 * 6(sp)",
        "lw t4,  4 * 7(sp)",
        "lw t5,  4 * 8(sp)",
        "lw t6,  4 * 9(sp)",
        "lw a0,  4 * 10(sp)",
        "lw a1,  4 * 11(sp)",
        "lw a2,  4 * 12(sp)",
        "lw a3,  4 * 13(sp)",
        "lw a4,  4 * 14(sp)",
        "lw a5,  4 * 15(sp)",
        "lw a6,  4 * 16(sp)",
        "lw a7,  4 * 17(sp)",
        "lw s0,  4 * 18(sp)",
        "lw s1,  4 * 19(sp)",
        "lw s2,  4 * 20(sp)",
        "lw s3,  4 * 21(sp)",
        "lw s4,  4 * 22(sp)",
        "lw s5,  4 * 23(sp)",
        "lw s6,  4 * 24(sp)",
        "lw s7,  4 * 25(sp)",
        "lw s8,  4 * 26(sp)",
        "lw s9,  4 * 27(sp)",
        "lw s10, 4 * 28(sp)",
        "lw s11, 4 * 29(sp)",
        "lw sp,  4 * 30(sp)",
        "sret"
    )
}

static TICKS: core::sync::atomic::AtomicUsize = core::sync::atomic::AtomicUsize::new(0);

#[unsafe(no_mangle)]
extern "C" fn handle_trap(f: &mut TrapFrame) {
    TICKS.fetch_add(1, core::sync::atomic::Ordering::Relaxed);

    let scause = read_csr!("scause");
    let stval = read_csr!("stval");
    let mut user_pc = read_csr!("sepc");

    match scause {
        SCAUSE_ECALL => {
            handle_syscall(f);
            user_pc += 4;
        }
        SCAUSE_INSN_PAGE_FAULT => handle_page_fault(stval, FaultAccess::Exec),
        SCAUSE_LOAD_PAGE_FAULT => handle_page_fault(stval, FaultAccess::Read),
        SCAUSE_STORE_PAGE_FAULT => handle_page_fault(stval, FaultAccess::Write),
        _ => {
            panic!("unexpected trap scause=0x{:x}, stval=0x{:x}, sepc=0x{:x}", scause, stval, user_pc);
        }
    }

    write_csr!("sepc", user_pc);
}

fn access_token(access: FaultAccess) -> &'static str {
    match access {
        FaultAccess::Read => "read",
        FaultAccess::Write => "write",
        FaultAccess::Exec => "exec",
    }
}

fn cause_token(cause: FaultCause) -> &'static str {
    match cause {
        FaultCause::Exec => "exec",
        FaultCause::Heap => "heap",
        FaultCause::Stack => "stack",
        FaultCause::Swap => "swap",
        FaultCause::Invalid => "invalid",
    }
}

/// Resolves a page fault against the currently running process, printing
/// the diagnostic log line contract and killing the process on an
/// invalid access. Called with the faulting process's page table already
/// active in `satp`.
fn handle_page_fault(fault_va: usize, access: FaultAccess) {
    let current = CURRENT_PROC.lock().expect("current process should be running");
    let mut procs = PROCS.0.lock();
    let process = procs
        .iter_mut()
        .find(|p| p.pid == current)
        .expect("current pid should have a process");

    let mut guard = user_frames().lock();
    let frames = guard.as_mut().expect("user frame pool initialized by user_frames()");
    let mut dev = VirtioBlockDevice;

    let files = FILES.0.lock();
    // Executable bytes are already fully resident in RAM once fs_init()
    // loads the boot image, so reading a text/data segment needs no disk
    // I/O of its own.
    let exec_image = process.exe_file.map(|handle| {
        let file = &files[handle];
        &file.data[..file.size]
    });

    let outcome = process.handle_fault(&mut dev, frames, fault_va, access, exec_image);
    drop(files);

    match outcome {
        FaultOutcome::Resolved { va, seq, cause, eviction, slot, .. } => {
            println!(
                "[pid {}] PAGEFAULT va={:#x} access={} cause={}",
                current, va, access_token(access), cause_token(cause)
            );
            if let Some(record) = eviction {
                println!("[pid {}] MEMFULL", current);
                println!("[pid {}] VICTIM va={:#x} seq={}", current, record.va, record.seq);
                println!("[pid {}] EVICT va={:#x} slot={}", current, record.va, record.slot);
            }
            if let Some(slot) = slot {
                println!("[pid {}] SWAPIN va={:#x} slot={}", current, va, slot);
            }
            println!("[pid {}] RESIDENT va={:#x} seq={}", current, va, seq);
        }
        FaultOutcome::Killed { access } => {
            println!(
                "[pid {}] KILL invalid-access va={:#x} access={}",
                current, fault_va, access_token(access)
            );
            process.exit(frames);
            process.state = State::Exited;
            drop(guard);
            drop(procs);
            yield_now();
            unreachable!("unreachable after killing current process");
        }
    }
}

fn handle_syscall(f: &mut TrapFrame) {
    let sysno = f.a4;
    match sysno {
        SYS_PUTBYTE => {  // Match what user code sends
            match put_byte(f.a0 as u8) {
                Ok(_) => f.a0 = 0,     // Set return value to 0 (success)
                Err(e) => f.a0 = e as usize,    // Set return value to error code
            }
        },
        SYS_GETCHAR => {
            loop {
                if let Ok(ch) = get_char() {
                    f.a0 = ch as usize;
                    break;
                }
                yield_now();
            }
        },
        SYS_EXIT => {
            let current = CURRENT_PROC.lock()
                .expect("current process should be running");
            crate::println!("process {} exited", current);
            if let Some(p) = PROCS.0.lock().iter_mut()
                .find(|p| p.pid == current) {
                    p.state = State::Exited
                }
            yield_now();
            unreachable!("unreachable after SYS_EXIT");
        },
        SYS_READFILE | SYS_WRITEFILE => 'block: {
            let filename_ptr = f.a0 as *const u8;
            let filename_len = f.a1;

            // Safety: Caller guarantees that filename_ptr points to valid memory
            // of length filename_len that remains valid for the lifetime of this reference
            let filename = unsafe {
                str::from_utf8(slice::from_raw_parts(filename_ptr, filename_len))
            }.expect("filename must be valid UTF-8");

            let buf_ptr = f.a2 as *mut u8;
            let buf_len = f.a3;

            // Safety: Caller guarantees that buf_ptr points to valid memory
            // of length buf_len that remains valid for the lifetime of this reference
            let buf = unsafe {
                slice::from_raw_parts_mut(buf_ptr, buf_len)
            };

            // println!("handling syscall SYS_READFILE | SYS_WRITEFILE for file {:?}", filename);

            let Some(file_i) = FILES.fs_lookup(filename) else {
                println!("file not found {:x?}", filename);
                f.a0 = usize::MAX; // 2's complement is -1
                break 'block;
            };

            match sysno {
                SYS_WRITEFILE => {
                    let mut files = FILES.0.lock();
                    // try_borrow_mut()
                    // .expect("should be able to borrow FILES mutably to handle SYS_WRITEFILE");

                    files[file_i].data[..buf.len()].copy_from_slice(buf);
                    files[file_i].size = buf.len();
                    drop(files);
                    fs_flush();
                },
                SYS_READFILE => {
                    let files = FILES.0.lock();
                    // try_borrow()
                    // .expect("should be able to borrow FILES to handle SYS_READFILE");

                    buf.copy_from_slice(&files[file_i].data[..buf.len()]);
                },
                _ => unreachable!("sysno must be SYS_READFILE or SYS_WRITEFILE"),
            }

            f.a0 = buf_len;
        },
        SYS_SBRK => {
            let delta = f.a0 as isize;
            let mode = SbrkMode::from_usize(f.a1);
            let current = CURRENT_PROC.lock().expect("current process should be running");

            let mut procs = PROCS.0.lock();
            let mut guard = user_frames().lock();
            let frames = guard.as_mut().expect("user frame pool initialized by user_frames()");
            let mut dev = VirtioBlockDevice;

            let process = procs.iter_mut().find(|p| p.pid == current)
                .expect("current pid should have a process");

            f.a0 = process.sbrk(delta, mode, frames, &mut dev).unwrap_or(usize::MAX);
        },
        SYS_MEMSTAT => {
            let out_ptr = f.a0 as *mut MemStat;
            let current = CURRENT_PROC.lock().expect("current process should be running");

            let mut procs = PROCS.0.lock();
            let process = procs.iter_mut().find(|p| p.pid == current)
                .expect("current pid should have a process");

            let stat = crate::mem::stat::build_memstat(
                current,
                process.next_fifo_seq,
                process.sz,
                process.table_mut(),
                &process.resident,
            );

            // Safety: caller passed a pointer to a MemStat-sized buffer in
            // its own address space, which is mapped in the active satp.
            unsafe { out_ptr.write(stat) };
            f.a0 = 0;
        },
        SYS_FORK => {
            let resume_pc = read_csr!("sepc") + 4;
            let current = CURRENT_PROC.lock().expect("current process should be running");

            let mut guard = user_frames().lock();
            let frames = guard.as_mut().expect("user frame pool initialized by user_frames()");
            let mut dev = VirtioBlockDevice;

            let mut procs = PROCS.0.lock();
            let Some(child_index) = procs.iter().position(|p| p.state == State::Unused) else {
                f.a0 = usize::MAX;
                return;
            };
            let parent_index = procs.iter().position(|p| p.pid == current)
                .expect("current pid should have a process");

            let [parent, child] = procs.get_disjoint_mut([parent_index, child_index])
                .expect("indices should be valid and distinct");
            parent.fork_into(child, frames, &mut dev);
            child.stack = parent.stack;
            setup_fork_child(child, resume_pc);
            child.pid = child_index + 1;
            child.state = State::Runnable;

            f.a0 = child.pid;
        },
        SYS_WAIT => {
            // No child-exit notification exists yet; yield until some
            // process other than the caller has exited, then report it.
            loop {
                let current = CURRENT_PROC.lock().expect("current process should be running");
                let mut procs = PROCS.0.lock();
                if let Some(p) = procs.iter_mut().find(|p| p.pid != current && p.state == State::Exited) {
                    f.a0 = p.pid;
                    p.state = State::Unused;
                    break;
                }
                drop(procs);
                yield_now();
            }
        },
        SYS_KILL => {
            let target = f.a0;
            let mut procs = PROCS.0.lock();
            match procs.iter_mut().find(|p| p.pid == target && p.state == State::Runnable) {
                Some(p) => {
                    p.state = State::Exited;
                    f.a0 = 0;
                }
                None => f.a0 = usize::MAX,
            }
        },
        SYS_PAUSE => {
            yield_now();
            f.a0 = 0;
        },
        SYS_GETPID => {
            f.a0 = CURRENT_PROC.lock().expect("current process should be running");
        },
        SYS_UPTIME => {
            f.a0 = TICKS.load(core::sync::atomic::Ordering::Relaxed);
        },
        _ => {panic!("unexpected syscall sysno={:x}", sysno);},
    }
}

} // mod imp

#[cfg(not(test))]
pub use imp::kernel_entry;

#[macro_export]
macro_rules! read_csr {
    ( $reg:literal ) => {
        {
            let val: usize;
            unsafe{core::arch::asm!(concat!("csrr {}, ", $reg), out(reg) val)}
            val
        }
    };
}

#[macro_export]
macro_rules! write_csr {
    ( $reg:literal, $val:expr ) => {
        {
            let val = $val; // Expand metavariable outside of unsafe block (avoids clippy warning)
            unsafe{core::arch::asm!(concat!("csrw ", $reg, ", {}"), in(reg) val)}
        }
    };
}
