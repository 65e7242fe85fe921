//! os1k shell

#![no_std]
#![no_main]

use core::ffi::CStr;

use common::SbrkMode;
use user::{
    exit,
    print,
    println,
    fork,
    get_char,
    getpid,
    kill,
    memstat,
    pause,
    put_byte,
    readfile,
    sbrk,
    uptime,
    wait,
    writefile,
};

#[unsafe(no_mangle)]
fn main() {
    loop {
        print!("> ");
        let mut cmdline = [b'\n'; 128];
        let mut pos = 0;
        loop {
            let Some(ch) = get_char() else {
                break;
            };
            let byte = ch as u8;
            match byte {
                b'\r' => { // On the debug console the newline is \r
                    println!();
                    break;
                },
                _ => {
                    let _ = put_byte(byte);
                    cmdline[pos] = byte;
                    pos += 1;
                }
            }
        }

        let cmdline_str = str::from_utf8(&cmdline)
        .expect("command line text valid UTF8")
        .trim();

        match cmdline_str {
            "hello" => {
                println!("Hello world from the shell! 🐚");
            },
            "exit" => {
                exit();
            },
            "readfile" => {
                let mut buf = [0u8; 128];
                readfile("hello.txt", &mut buf);
                CStr::from_bytes_until_nul(&buf)
                .ok()
                .and_then(|cstr| cstr.to_str().ok())
                .map(|s| println!("{}", s.trim_end()))
                .unwrap_or_else(|| println!("could not read file contents"));
            }
            "writefile" => {
                writefile(
                    "meow.txt",
                    b"Hello from the shell!");
            },
            "meminfo" => {
                let stat = memstat();
                println!(
                    "pid={} pages total={} resident={} swapped={}",
                    stat.pid, stat.num_pages_total, stat.num_resident_pages, stat.num_swapped_pages
                );
            },
            "pid" => {
                println!("{}", getpid());
            },
            "uptime" => {
                println!("{}", uptime());
            },
            "fork" => {
                match fork() {
                    Some(0) => println!("child here"),
                    Some(pid) => println!("forked child pid={}", pid),
                    None => println!("fork failed"),
                }
            },
            "wait" => {
                match wait() {
                    Some(pid) => println!("reaped pid={}", pid),
                    None => println!("no exited child"),
                }
            },
            "pause" => {
                pause();
            },
            _ if cmdline_str.starts_with("sbrk ") => {
                let arg = cmdline_str["sbrk ".len()..].trim();
                match arg.parse::<isize>() {
                    Ok(delta) => match sbrk(delta, SbrkMode::Lazy) {
                        Some(brk) => println!("new break: {:#x}", brk),
                        None => println!("sbrk failed"),
                    },
                    Err(_) => println!("usage: sbrk <signed byte count>"),
                }
            },
            _ if cmdline_str.starts_with("kill ") => {
                let arg = cmdline_str["kill ".len()..].trim();
                match arg.parse::<usize>() {
                    Ok(pid) => match kill(pid) {
                        Ok(()) => println!("killed pid={}", pid),
                        Err(()) => println!("no such runnable pid"),
                    },
                    Err(_) => println!("usage: kill <pid>"),
                }
            },
            _ => {
                println!("unknown command: {}", cmdline_str);
            },
        }
    }
}
