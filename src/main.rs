use em3ds::memory::ConsoleModel;
use em3ds::{Configuration, EmuError, Emulator};
use log::error;
use std::env;
use std::fs;
use std::process::exit;

const USAGE: &str = "usage: ctr [--n3ds] [--frames N] <boot9.bin> <boot11.bin> [otp.bin]";

fn main() {
    env_logger::init();

    let mut model = ConsoleModel::Old3ds;
    let mut frames: u64 = 60;
    let mut files = Vec::new();

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--n3ds" => model = ConsoleModel::New3ds,
            "--frames" => {
                frames = args
                    .next()
                    .and_then(|n| n.parse().ok())
                    .unwrap_or_else(|| {
                        eprintln!("{}", USAGE);
                        exit(1);
                    });
            }
            _ => files.push(arg),
        }
    }

    if files.len() < 2 {
        eprintln!("{}", USAGE);
        exit(1);
    }

    let boot9 = match fs::read(&files[0]) {
        Ok(data) => data,
        Err(e) => {
            eprintln!("cannot read {}: {}", files[0], e);
            exit(1);
        }
    };
    let boot11 = match fs::read(&files[1]) {
        Ok(data) => data,
        Err(e) => {
            eprintln!("cannot read {}: {}", files[1], e);
            exit(1);
        }
    };
    let otp = files.get(2).map(|path| match fs::read(path) {
        Ok(data) => data,
        Err(e) => {
            eprintln!("cannot read {}: {}", path, e);
            exit(1);
        }
    });

    let config = Configuration { model, boot9, boot11, otp };
    let mut emulator = match Emulator::new(config) {
        Ok(emulator) => emulator,
        Err(e) => {
            eprintln!("startup failed: {}", e);
            exit(1);
        }
    };

    for frame in 0..frames {
        if let Err(e) = emulator.run_frame() {
            error!("frame {}: {}", frame, e);
            match e {
                EmuError::Fatal(_) => emulator.print_state(),
                _ => {}
            }
            exit(1);
        }
    }
}
