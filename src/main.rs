use std::env;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

// Use the library crate's modules
use xvm::cpu::CpuState;
use xvm::{EmulatorSession, SessionConfig};

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg)
}

fn parse_num(flag: &str, value: Option<&String>) -> io::Result<u64> {
    let value = value.ok_or_else(|| invalid(format!("{} needs a value", flag)))?;
    let parsed = match value.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|_| invalid(format!("invalid value for {}: {}", flag, value)))
}

/// Read a file, inflating it first if it is gzip-compressed
fn read_image(path: &str) -> io::Result<Vec<u8>> {
    let data = fs::read(path)?;
    if path.ends_with(".gz") {
        xvm::gunzip(&data)
    } else {
        Ok(data)
    }
}

/// Write the framebuffer as a binary PPM (alpha dropped)
fn write_ppm(path: &Path, pixels: &[u32], width: u32, height: u32) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    write!(out, "P6\n{} {}\n255\n", width, height)?;
    for p in pixels {
        out.write_all(&[(p >> 16) as u8, (p >> 8) as u8, *p as u8])?;
    }
    out.flush()
}

fn main() -> io::Result<()> {
    let args: Vec<String> = env::args().collect();
    let mut bios_path = String::new();
    let mut xbe_path = String::new();
    let mut dump_path = String::new();
    let mut state_path = String::new();
    let mut log_level = String::from("info");
    let mut frames = 60u64;
    let mut config = SessionConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bios" => {
                i += 1;
                bios_path = args.get(i).cloned().unwrap_or_default();
            }
            "--xbe" => {
                i += 1;
                xbe_path = args.get(i).cloned().unwrap_or_default();
            }
            "--frames" => {
                i += 1;
                frames = parse_num("--frames", args.get(i))?;
            }
            "--cycles" => {
                i += 1;
                config.cycles_per_frame = parse_num("--cycles", args.get(i))? as u32;
            }
            "--no-jit" => {
                config.cpu.jit_enabled = false;
            }
            "--no-vsync" => {
                config.gpu.vsync = false;
            }
            "--dump" => {
                i += 1;
                dump_path = args.get(i).cloned().unwrap_or_default();
            }
            "--save-state" => {
                i += 1;
                state_path = args.get(i).cloned().unwrap_or_default();
            }
            "--log" => {
                i += 1;
                log_level = args.get(i).cloned().unwrap_or_default();
            }
            arg if !arg.starts_with('-') && xbe_path.is_empty() => {
                xbe_path = arg.to_string();
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
            }
        }
        i += 1;
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if bios_path.is_empty() && xbe_path.is_empty() {
        eprintln!(
            "Usage: {} [--bios <image>] [--xbe <executable>] [--frames <n>] [--cycles <n>] \
             [--no-jit] [--no-vsync] [--dump <out.ppm>] [--save-state <file>] [--log <level>]",
            args[0]
        );
        std::process::exit(1);
    }

    let mut session = EmulatorSession::new(config).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    if !bios_path.is_empty() {
        info!("Loading BIOS: {}", bios_path);
        let data = read_image(&bios_path)?;
        session
            .load_bios_bytes(&data)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    }
    if !xbe_path.is_empty() {
        info!("Loading executable: {}", xbe_path);
        let data = read_image(&xbe_path)?;
        session
            .load_xbe(&data)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    }

    info!("Running {} frames", frames);
    let ran = match session.run(frames) {
        Ok(n) => n,
        Err(e) => {
            error!("emulation stopped: {}", e);
            session.frame()
        }
    };
    let cpu = session.cpu();
    info!(
        "{} frames, {} instructions, GPU frames {}",
        ran,
        cpu.instruction_count,
        session.gpu().frame_count()
    );
    if cpu.state() != CpuState::Running {
        println!("{}", cpu.dump_registers());
    }
    let stats = cpu.jit().stats;
    info!(
        "JIT: {} blocks, {} hits, {} compiles, {} flushes",
        cpu.jit().block_count(),
        stats.hits,
        stats.compiles,
        stats.flushes
    );

    if !dump_path.is_empty() {
        let (w, h) = session.framebuffer_size();
        write_ppm(Path::new(&dump_path), &session.framebuffer(), w, h)?;
        info!("Framebuffer written to {}", dump_path);
    }
    if !state_path.is_empty() {
        session
            .save_state_to(&state_path)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        info!("State saved to {}", state_path);
    }

    Ok(())
}
