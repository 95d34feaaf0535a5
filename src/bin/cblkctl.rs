use std::env;
use std::process;

use audio_cblk::control::api::{self, CblkStatus};
use audio_cblk::control::ui::{self, Access};

fn print_status(status: &CblkStatus) {
    println!("Track       : {}", status.name);
    println!("Direction   : {:?}", status.direction);
    println!("State       : {:?}", status.state);
    println!("Sample Rate : {} Hz", status.sample_rate);
    println!(
        "Ring        : {} frames x {} bytes ({})",
        status.frame_count,
        status.frame_size,
        if status.inline_buffers { "inline" } else { "external" }
    );
    let p = &status.positions;
    println!(
        "Client      : counter={} base={} offset={} laps={}",
        p.user, p.user_base, status.user_offset, p.user_laps
    );
    println!(
        "Server      : counter={} base={} offset={} laps={}",
        p.server, p.server_base, status.server_offset, p.server_laps
    );
    match status.filled {
        Some(filled) => println!(
            "Filled      : {} frames ({:.1}%)",
            filled,
            status.fill_ratio().unwrap_or(0.0) * 100.0
        ),
        None => println!("Filled      : inconsistent"),
    }
    let l = &status.loop_state;
    println!("Loop        : start={} end={} count={}", l.start, l.end, l.count);
    println!(
        "Volume      : L={:.3} R={:.3} (0x{:08x})  send={:.3}",
        status.volume.left_gain(),
        status.volume.right_gain(),
        status.volume.bits(),
        status.send_level
    );
    println!(
        "Stall       : waited {} ms of {} ms",
        status.wait_time_ms, status.buffer_timeout_ms
    );
    println!("Flags       : {:#04x} {:?}", status.flags.bits(), status.flags);
    println!(
        "Lock        : {}  notify seq={}",
        if status.locked { "held" } else { "free" },
        status.notify_sequence
    );
}

fn usage() {
    println!(
        "Usage: cblkctl <region-file> [--status | --control]\n\n\
         Without --status a read-only console launches. --control enables the action keys\n\
         (force-ready, clear underrun, restart, volume, invalidate)."
    );
}

fn main() {
    let mut args = env::args().skip(1);
    let Some(path) = args.next() else {
        usage();
        process::exit(1);
    };
    if matches!(path.as_str(), "--help" | "-h") {
        usage();
        return;
    }

    let mut access = Access::ReadOnly;
    if let Some(arg) = args.next() {
        match arg.as_str() {
            "--status" | "-s" => {
                match api::inspect(&path) {
                    Ok(status) => print_status(&status),
                    Err(err) => {
                        eprintln!("cblkctl: {path}: {err}");
                        process::exit(1);
                    }
                }
                return;
            }
            "--control" => access = Access::Control,
            "--help" | "-h" => {
                usage();
                return;
            }
            other => {
                eprintln!("cblkctl: unknown argument '{other}'");
                process::exit(1);
            }
        }
    }

    audio_cblk::init_tracing();
    if let Err(err) = ui::run(&path, access) {
        eprintln!("cblkctl: {err}");
        process::exit(1);
    }
}
