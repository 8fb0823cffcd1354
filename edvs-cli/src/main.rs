//! eDVS command line tool.
//!
//! Records event streams from one or more sensors, converts recordings to CSV
//! and checks recorded timestamps.

mod check;

use anyhow::{bail, Context, Result};
use check::TimestampCheck;
use clap::{Args, Parser, Subcommand, ValueEnum};
use edvs_core::output::CsvWriter;
use edvs_core::transport::DEFAULT_BAUD_RATE;
use edvs_core::{
    open_stream, ClockMode, DeviceConfig, EventFileReader, EventFileWriter, EventSource,
    FieldOrder, PlaybackConfig, PlaybackPace, RecordLayout, SourceSpec, StreamMerger, SyncRole,
    TimestampMode,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::File;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// eDVS event sensor tool.
///
/// Records events from network, serial or file sources into binary event
/// files, converts them to CSV and checks their timestamps.
#[derive(Parser, Debug)]
#[command(name = "edvs")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record one or more sources into a binary event file
    Record(RecordArgs),
    /// Convert a binary event file to CSV
    Convert(ConvertArgs),
    /// Report event count, timestamp order and inter-event statistics
    Check(CheckArgs),
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum ClockArg {
    /// Device timestamps as received
    Raw,
    /// Unwrapped device time, starting at zero
    Incremental,
    /// Device time rescaled to the host clock
    SystemTime,
}

impl From<ClockArg> for ClockMode {
    fn from(arg: ClockArg) -> Self {
        match arg {
            ClockArg::Raw => ClockMode::Raw,
            ClockArg::Incremental => ClockMode::Incremental,
            ClockArg::SystemTime => ClockMode::SystemTime,
        }
    }
}

#[derive(Args, Debug)]
struct RecordArgs {
    /// Network sensor address, e.g. 192.168.201.62:56000 (repeatable)
    #[arg(long = "tcp", value_name = "ADDR")]
    tcp: Vec<String>,

    /// Serial device node, e.g. /dev/ttyUSB0 (repeatable)
    #[arg(long = "serial", value_name = "PATH")]
    serial: Vec<PathBuf>,

    /// Baud rate of serial sensors (2000000 or 4000000 for eDVS boards)
    #[arg(long, env = "EDVS_BAUD_RATE", default_value_t = DEFAULT_BAUD_RATE)]
    baud_rate: u32,

    /// Recorded event file to replay (repeatable)
    #[arg(long = "file", value_name = "PATH")]
    file: Vec<PathBuf>,

    /// Output event file
    #[arg(short, long, value_name = "OUTPUT")]
    output: PathBuf,

    /// Timestamp width selected on the devices (0-3: none, 16, 24, 32 bit)
    #[arg(long, env = "EDVS_TIMESTAMP_MODE", default_value_t = 2)]
    timestamp_mode: u8,

    /// How device timestamps are turned into host timestamps
    #[arg(long, env = "EDVS_CLOCK", value_enum, default_value_t = ClockArg::Incremental)]
    clock: ClockArg,

    /// Synchronize live devices: the first one is master, the others slaves
    #[arg(long)]
    sync: bool,

    /// Skip the device reset on open
    #[arg(long, env = "EDVS_NO_RESET")]
    no_reset: bool,

    /// Wait for the device to acknowledge the start command
    #[arg(long)]
    await_echo: bool,

    /// Bytes requested per device read
    #[arg(long, env = "EDVS_BUFFER_SIZE", default_value_t = 8192)]
    buffer_size: usize,

    /// Replay speed factor for file sources
    #[arg(long, default_value_t = 1.0)]
    time_scale: f32,

    /// Advance file sources by a fixed step per poll instead of the wall clock
    #[arg(long, value_name = "MICROSECONDS")]
    step_us: Option<u64>,

    /// File sources use 16 byte padded records
    #[arg(long)]
    padded: bool,

    /// Stop after this many events
    #[arg(short, long)]
    limit: Option<u64>,

    /// Suppress progress output
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Args, Debug)]
struct ConvertArgs {
    /// Input event file
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Output CSV file
    #[arg(value_name = "OUTPUT")]
    output: PathBuf,

    /// Field order for CSV output.
    ///
    /// Comma-separated field names (x, y, p, t), e.g. "x,y,p,t" or "t,x,y,p".
    #[arg(short, long, default_value = "x,y,p,t")]
    format: String,

    /// Append the source id as a fifth column
    #[arg(long)]
    with_id: bool,

    /// Input uses 16 byte padded records
    #[arg(long)]
    padded: bool,
}

#[derive(Args, Debug)]
struct CheckArgs {
    /// Event files to check
    #[arg(value_name = "FILES", required = true)]
    files: Vec<PathBuf>,

    /// Maximum number of order violations to list per file
    #[arg(long, default_value_t = 20)]
    show: usize,

    /// Inputs use 16 byte padded records
    #[arg(long)]
    padded: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Record(args) => record(args),
        Command::Convert(args) => convert(args),
        Command::Check(args) => check(args),
    }
}

fn layout(padded: bool) -> RecordLayout {
    if padded {
        RecordLayout::Padded
    } else {
        RecordLayout::Packed
    }
}

fn spinner(quiet: bool, message: &str) -> Result<ProgressBar> {
    if quiet {
        return Ok(ProgressBar::hidden());
    }
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .context("Invalid progress template")?,
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

fn record(args: RecordArgs) -> Result<()> {
    let timestamp_mode = TimestampMode::from_u8(args.timestamp_mode)
        .with_context(|| format!("Invalid timestamp mode {}, use 0-3", args.timestamp_mode))?;
    let device = DeviceConfig {
        timestamp_mode,
        clock_mode: args.clock.into(),
        buffer_size: args.buffer_size,
        reset_on_open: !args.no_reset,
        await_start_echo: args.await_echo,
        ..DeviceConfig::default()
    };
    let pace = match args.step_us {
        Some(dt_us) => PlaybackPace::Fixed { dt_us },
        None => PlaybackPace::Realtime {
            time_scale: args.time_scale,
        },
    };
    let playback = PlaybackConfig {
        pace,
        layout: layout(args.padded),
    };
    let baud_rate = args.baud_rate;

    let live = args
        .tcp
        .into_iter()
        .map(|addr| SourceSpec::Network { addr })
        .chain(
            args.serial
                .into_iter()
                .map(|path| SourceSpec::Serial { path, baud_rate }),
        );
    let files = args
        .file
        .into_iter()
        .map(|path| SourceSpec::FileReplay { path, playback });
    let specs: Vec<SourceSpec> = live.chain(files).collect();
    if specs.is_empty() {
        bail!("No sources given. Use --tcp, --serial or --file");
    }
    if specs.len() > edvs_core::merge::MAX_SOURCES {
        bail!("Too many sources: {}", specs.len());
    }

    let mut sources = Vec::with_capacity(specs.len());
    let mut live_count = 0;
    for (i, spec) in specs.iter().enumerate() {
        let mut config = device.clone();
        if args.sync && !matches!(spec, SourceSpec::FileReplay { .. }) {
            config.sync_role = if live_count == 0 {
                SyncRole::Master
            } else {
                SyncRole::Slave
            };
            live_count += 1;
        }
        let source = open_stream(spec, &config, i as u8)
            .with_context(|| format!("Failed to open source {}", spec))?;
        sources.push(source);
    }
    let mut merger = StreamMerger::new(sources).context("Failed to set up merger")?;

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || running.store(false, Ordering::SeqCst))
            .context("Failed to install Ctrl-C handler")?;
    }

    let mut writer = EventFileWriter::create(&args.output)
        .with_context(|| format!("Failed to create {:?}", args.output))?;
    let progress = spinner(args.quiet, "Recording... press Ctrl-C to stop")?;
    let start_time = Instant::now();

    merger.start().context("Failed to start sources")?;
    info!(sources = specs.len(), "recording");

    let limit = args.limit.unwrap_or(u64::MAX);
    let mut specials = 0u64;
    let result = loop {
        if !running.load(Ordering::SeqCst) {
            info!("interrupted");
            break Ok(());
        }
        let mut events = match merger.poll() {
            Ok(events) => events,
            Err(e) => break Err(anyhow::Error::from(e).context("Source failed")),
        };
        for block in merger.take_specials() {
            debug!(
                id = block.id,
                device_timestamp = block.device_timestamp,
                payload = ?block.payload(),
                "special block"
            );
            specials += 1;
        }
        if events.is_empty() {
            if merger.is_exhausted() {
                info!("all sources exhausted");
                break Ok(());
            }
            std::thread::sleep(Duration::from_millis(1));
            continue;
        }
        let remaining = limit - writer.written();
        events.truncate(remaining.min(events.len() as u64) as usize);
        writer
            .write_events(&events)
            .context("Failed to write events")?;
        progress.set_message(format!("Recorded {} events", writer.written()));
        if writer.written() >= limit {
            info!(limit, "event limit reached");
            break Ok(());
        }
    };

    if let Err(e) = merger.stop() {
        warn!(error = %e, "failed to stop sources cleanly");
    }
    writer.flush().context("Failed to flush event file")?;
    result?;

    let duration = start_time.elapsed();
    progress.finish_with_message(format!(
        "Done! Recorded {} events in {:.2}s",
        writer.written(),
        duration.as_secs_f64()
    ));

    if !args.quiet {
        eprintln!();
        eprintln!("Summary:");
        eprintln!("  Sources:      {}", specs.len());
        eprintln!("  Output:       {:?}", args.output);
        eprintln!("  Events:       {}", writer.written());
        eprintln!("  Specials:     {}", specials);
        eprintln!("  Duration:     {:.3}s", duration.as_secs_f64());
        eprintln!(
            "  Rate:         {:.0} events/s",
            writer.written() as f64 / duration.as_secs_f64()
        );
    }
    Ok(())
}

fn convert(args: ConvertArgs) -> Result<()> {
    let field_order = FieldOrder::from_str(&args.format)
        .context("Invalid field format. Use comma-separated: x,y,p,t")?;

    let mut reader = EventFileReader::open(&args.input)
        .with_context(|| format!("Failed to open {:?}", args.input))?
        .with_layout(layout(args.padded));
    let file = File::create(&args.output)
        .with_context(|| format!("Failed to create {:?}", args.output))?;
    let mut writer = CsvWriter::new(file, field_order).with_id(args.with_id);
    writer.write_header().context("Failed to write CSV header")?;

    let mut total = 0u64;
    let mut chunk = Vec::with_capacity(65536);
    loop {
        chunk.clear();
        let n = reader
            .read_chunk(&mut chunk, 65536)
            .context("Failed to read event file")?;
        if n == 0 {
            break;
        }
        writer
            .write_events(&chunk)
            .context("Failed to write CSV output")?;
        total += n as u64;
    }
    writer.flush().context("Failed to flush CSV output")?;

    info!(events = total, output = ?args.output, "converted");
    Ok(())
}

fn check(args: CheckArgs) -> Result<()> {
    for path in &args.files {
        let mut reader = EventFileReader::open(path)
            .with_context(|| format!("Failed to open {:?}", path))?
            .with_layout(layout(args.padded));
        let mut check = TimestampCheck::new();
        let mut chunk = Vec::with_capacity(65536);
        loop {
            chunk.clear();
            let n = reader
                .read_chunk(&mut chunk, 65536)
                .with_context(|| format!("Failed to read {:?}", path))?;
            if n == 0 {
                break;
            }
            check.add(&chunk);
        }

        println!("{}", path.display());
        println!("  Events:       {}", check.count());
        println!("  Order violations: {}", check.violations().len());
        for v in check.violations().iter().take(args.show) {
            println!("    event {}: {} -> {}", v.index, v.previous, v.timestamp);
        }
        match check.summary() {
            Some(summary) => println!("{}", summary),
            None => println!("  No increasing timestamps"),
        }
    }
    Ok(())
}
