//! dragon-sim: drive the buffer engine against a simulated board.
//!
//! Runs one acquisition session on `MockBoard`: configure, allocate, activate,
//! cycle buffers through submit → completion → consume, drain, and print the
//! engine counters as JSON.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use dragon_daq::hardware::mock::{parse_frame_header, MockBoard};
use dragon_daq::{DeviceManager, DragonConfig};
use dragon_regs::DeviceFamily;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "Simulated Dragon acquisition session", long_about = None)]
struct Cli {
    #[arg(long, help = "Configuration file", default_value = dragon_daq::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[arg(long, value_parser = parse_family, help = "Override the board family (legacy, packet120)")]
    family: Option<DeviceFamily>,
    #[arg(long, default_value_t = 8, help = "Buffers to allocate")]
    buffers: usize,
    #[arg(long, default_value_t = 64, help = "Buffers to acquire before stopping")]
    cycles: usize,
    #[arg(long, help = "Frame length in bytes")]
    frame_length: Option<u32>,
    #[arg(long, help = "Frames per buffer")]
    frames_per_buffer: Option<u32>,
    #[arg(long, default_value_t = 2, help = "Simulated time between completions (ms)")]
    interval_ms: u64,
}

fn parse_family(s: &str) -> Result<DeviceFamily, String> {
    match s {
        "legacy" => Ok(DeviceFamily::Legacy),
        "packet120" => Ok(DeviceFamily::Packet120),
        other => Err(format!("unknown family '{other}'")),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = DragonConfig::load_from(&cli.config).context("loading configuration")?;
    if let Some(family) = cli.family {
        config.family = family;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let board = Arc::new(MockBoard::new(config.family));
    let manager = DeviceManager::new(config.clone());
    let minor = manager.register(board.regs().clone(), board.dma().clone())?;
    let session = manager.open(minor)?;
    info!(name = session.name(), family = %config.family, "simulation started");

    let mut params = session.query_params();
    if let Some(fl) = cli.frame_length {
        params.frame_length = fl;
    }
    if let Some(fpb) = cli.frames_per_buffer {
        params.frames_per_buffer = fpb;
    }
    let params = session.set_params(&params)?;
    let allocated = session.request_buffers(cli.buffers)?;
    info!(
        allocated,
        frame_length = params.frame_length,
        frames_per_buffer = params.frames_per_buffer,
        "buffers ready"
    );

    session.activate()?;
    let initial = allocated.min(cli.cycles);
    for index in 0..initial {
        session.submit(index)?;
    }

    let stop = Arc::new(AtomicBool::new(false));
    let completer = {
        let (board, irq, stop) = (Arc::clone(&board), session.irq_handle(), Arc::clone(&stop));
        let (cycles, interval) = (cli.cycles, Duration::from_millis(cli.interval_ms));
        thread::spawn(move || {
            let mut done = 0;
            while done < cycles && !stop.load(Ordering::Acquire) {
                thread::sleep(interval);
                if board.complete_next(&irq).is_some() {
                    done += 1;
                }
            }
        })
    };

    let mut submitted = initial;
    let mut consumed = 0;
    let mut bad_headers = 0usize;
    while consumed < cli.cycles {
        if !session.wait_readable(Some(Duration::from_secs(1))) {
            stop.store(true, Ordering::Release);
            bail!("no buffer completed within 1s ({consumed} consumed)");
        }
        let desc = session.consume()?;
        consumed += 1;

        let mapping = session.map_buffer(desc.offset, 8)?;
        // SAFETY: the buffer was just consumed and is not resubmitted until
        // after this read.
        let header = parse_frame_header(unsafe { mapping.as_slice() });
        if header.map(|(_, addr)| u64::from(addr)) != Some(desc.device_address) {
            bad_headers += 1;
            warn!(index = desc.index, ?header, "unexpected frame header");
        }

        if submitted < cli.cycles {
            session.submit(desc.index)?;
            submitted += 1;
        }
    }

    session.deactivate()?;
    stop.store(true, Ordering::Release);
    if completer.join().is_err() {
        bail!("completion thread panicked");
    }

    let stats = session.stats();
    info!(consumed, bad_headers, "simulation finished");
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
