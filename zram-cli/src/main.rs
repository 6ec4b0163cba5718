//! Demonstration control surface over a single in-process zram device.
//!
//! Each argument is a command executed in order against one device, the
//! same sequence a shell script poking `/sys/block/zram0/...` attributes
//! would issue — but collapsed into one process since there is no real
//! sysfs here. Run `zramctl help` for the command list.

use std::path::PathBuf;
use std::process::ExitCode;

use zram_abi::PAGE_SIZE;
use zram_device::{IoOp, WritebackMode, ZramDevice};

fn print_usage() {
    println!(
        "usage: zramctl <command> [args...] [<command> [args...] ...]\n\n\
         commands:\n\
         \u{20} comp_algorithm <name>       set the compressor (pre-init only)\n\
         \u{20} use_dedup <on|off>          enable content dedup (pre-init only)\n\
         \u{20} backing_dev <path> <pages>  attach a file-backed writeback target\n\
         \u{20} disksize <bytes>            initialise the device\n\
         \u{20} mem_limit <pages|none>      cap total pool pages\n\
         \u{20} fill <index> <byte>         write one page of a repeated byte\n\
         \u{20} show <index>                print one page's leading bytes\n\
         \u{20} idle                        mark eligible slots idle\n\
         \u{20} new                         clear idle state on every slot\n\
         \u{20} writeback huge | idle [<max|none> [<min_idle>]]   run one writeback pass\n\
         \u{20} writeback_limit <pages>     set the remaining writeback quota\n\
         \u{20} writeback_limit_enable <on|off>  toggle quota enforcement\n\
         \u{20} compact                     trigger pool compaction\n\
         \u{20} mm_stat | io_stat | bd_stat | debug_stat\n\
         \u{20} idle_stat | new_stat       print the matching stats line\n\
         \u{20} reset                       tear the device down\n\
         \u{20} help                        print this message"
    );
}

fn run(device: &ZramDevice, args: &[String]) -> Result<usize, String> {
    match args[0].as_str() {
        "help" => {
            print_usage();
            Ok(1)
        }
        "comp_algorithm" => {
            let name = args.get(1).ok_or("comp_algorithm needs a name")?;
            device.set_comp_algorithm(name).map_err(|e| e.to_string())?;
            Ok(2)
        }
        "use_dedup" => {
            let flag = args.get(1).ok_or("use_dedup needs on/off")?;
            device
                .set_use_dedup(flag == "on")
                .map_err(|e| e.to_string())?;
            Ok(2)
        }
        "backing_dev" => {
            let path = args.get(1).ok_or("backing_dev needs a path")?;
            let pages: u64 = args
                .get(2)
                .ok_or("backing_dev needs a page count")?
                .parse()
                .map_err(|_| "bad page count".to_string())?;
            device
                .set_backing_dev(&PathBuf::from(path), pages)
                .map_err(|e| e.to_string())?;
            Ok(3)
        }
        "disksize" => {
            let bytes: u64 = args
                .get(1)
                .ok_or("disksize needs a byte count")?
                .parse()
                .map_err(|_| "bad byte count".to_string())?;
            device.set_disksize(bytes).map_err(|e| e.to_string())?;
            Ok(2)
        }
        "mem_limit" => {
            let raw = args.get(1).ok_or("mem_limit needs pages or none")?;
            let pages = if raw == "none" {
                None
            } else {
                Some(raw.parse().map_err(|_| "bad page count".to_string())?)
            };
            device.set_mem_limit(pages);
            Ok(2)
        }
        "fill" => {
            let index: u64 = args
                .get(1)
                .ok_or("fill needs an index")?
                .parse()
                .map_err(|_| "bad index".to_string())?;
            let byte: u8 = args
                .get(2)
                .ok_or("fill needs a byte value")?
                .parse()
                .map_err(|_| "bad byte value".to_string())?;
            let mut buf = vec![byte; PAGE_SIZE];
            device
                .dispatch(IoOp::Write, index * PAGE_SIZE as u64, PAGE_SIZE as u64, &mut buf)
                .map_err(|e| e.to_string())?;
            Ok(3)
        }
        "show" => {
            let index: u64 = args
                .get(1)
                .ok_or("show needs an index")?
                .parse()
                .map_err(|_| "bad index".to_string())?;
            let mut buf = vec![0u8; PAGE_SIZE];
            device
                .dispatch(IoOp::Read, index * PAGE_SIZE as u64, PAGE_SIZE as u64, &mut buf)
                .map_err(|e| e.to_string())?;
            println!("slot {index}: {:02x?}...", &buf[..16]);
            Ok(2)
        }
        "idle" => {
            device.mark_all_idle().map_err(|e| e.to_string())?;
            Ok(1)
        }
        "new" => {
            device.clear_all_idle().map_err(|e| e.to_string())?;
            Ok(1)
        }
        "writeback_limit" => {
            let pages: u64 = args
                .get(1)
                .ok_or("writeback_limit needs a page count")?
                .parse()
                .map_err(|_| "bad page count".to_string())?;
            device.set_writeback_limit(pages);
            Ok(2)
        }
        "writeback_limit_enable" => {
            let flag = args.get(1).ok_or("writeback_limit_enable needs on/off")?;
            device.set_writeback_limit_enable(flag == "on");
            Ok(2)
        }
        "writeback" => {
            let (mode, consumed) = match args.get(1).map(String::as_str) {
                Some("huge") => (WritebackMode::Huge, 2),
                Some("idle") => {
                    // Optional trailing `<max> <min_idle>`, matching
                    // `idle | idle <max> <min_idle>` from the control
                    // attribute grammar; `max` also accepts "none".
                    let max = match args.get(2) {
                        None => None,
                        Some(raw) if raw == "none" => None,
                        Some(raw) => Some(
                            raw.parse::<u64>()
                                .map_err(|_| "bad writeback max".to_string())?,
                        ),
                    };
                    let min_idle = match args.get(3) {
                        None => 0,
                        Some(raw) => raw
                            .parse::<u32>()
                            .map_err(|_| "bad writeback min_idle".to_string())?,
                    };
                    let consumed = 2 + args.get(2).is_some() as usize + args.get(3).is_some() as usize;
                    (WritebackMode::Idle { max, min_idle }, consumed)
                }
                other => return Err(format!("unknown writeback mode: {other:?}")),
            };
            let published = device.writeback(mode).map_err(|e| e.to_string())?;
            println!("writeback: {published} pages published");
            Ok(consumed)
        }
        "compact" => {
            let freed = device.compact().map_err(|e| e.to_string())?;
            println!("compact: {freed} pages reclaimed");
            Ok(1)
        }
        "mm_stat" => {
            print!("{}", device.mm_stat());
            Ok(1)
        }
        "io_stat" => {
            print!("{}", device.io_stat());
            Ok(1)
        }
        "bd_stat" => {
            print!("{}", device.bd_stat());
            Ok(1)
        }
        "debug_stat" => {
            print!("{}", device.debug_stat());
            Ok(1)
        }
        "idle_stat" => {
            print!("{}", device.idle_stat().map_err(|e| e.to_string())?);
            Ok(1)
        }
        "new_stat" => {
            print!("{}", device.new_stat().map_err(|e| e.to_string())?);
            Ok(1)
        }
        "reset" => {
            device.reset();
            Ok(1)
        }
        other => Err(format!("unknown command: {other}")),
    }
}


fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        print_usage();
        return ExitCode::SUCCESS;
    }

    let device = ZramDevice::new();
    let mut cursor = 0usize;
    while cursor < args.len() {
        match run(&device, &args[cursor..]) {
            Ok(consumed) => cursor += consumed,
            Err(message) => {
                eprintln!("zramctl: {message}");
                return ExitCode::FAILURE;
            }
        }
    }
    ExitCode::SUCCESS
}
