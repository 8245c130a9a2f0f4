mod config;
mod decoder;
mod encoder;
mod error;
mod extract;
mod frame;
mod index;
mod pipe;
mod plan;
mod pool;
mod progress;
mod recognize;
mod util;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use config::{DecodeConfig, EncodeConfig, ErrorCorrection, ModuleSize, Preset, Upscale};
use progress::{format_duration, DecodeSummary, EncodeSummary, ProgressConfig, ProgressMode, Unit};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "qrvid",
    version,
    about = "Byte-perfect file<->video codec (bytes->QR frames->video segments)"
)]
struct Cli {
    /// Debug-level diagnostics on stderr (RUST_LOG takes precedence).
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode a file (or every file under a directory) into QR-code videos
    Encode {
        input: PathBuf,

        /// QR error-correction level: 0=L, 1=M, 2=Q, 3=H.
        #[arg(short = 'q', long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=3))]
        error_correction: u8,

        /// Negative: auto size with |n|-pixel modules. Positive: fixed frame side in pixels.
        #[arg(short = 's', long, default_value_t = -8, allow_negative_numbers = true)]
        module_size: i32,

        /// Bytes of the file carried by each data frame (50-1500).
        #[arg(short = 'd', long, default_value_t = 350)]
        slice_len: usize,

        /// Frames per second of the output video (1-60).
        #[arg(short = 'p', long, default_value_t = 24)]
        fps: u32,

        /// Maximum seconds per video segment before the file is split.
        #[arg(short = 'l', long, default_value_t = 35_999)]
        segment_seconds: u64,

        /// x264 preset.
        #[arg(short = 'm', long, value_enum, default_value_t = Preset::Ultrafast)]
        preset: Preset,

        /// Parent directory for output_<name> directories. Default: beside each input file.
        #[arg(long)]
        output: Option<PathBuf>,

        /// Replace an existing output directory.
        #[arg(long, default_value_t = false)]
        force: bool,

        /// Frame rendering threads. Default: auto.
        #[arg(long)]
        workers: Option<usize>,

        /// Progress display mode: auto (TTY-aware), rich, plain, quiet.
        #[arg(long, value_enum, default_value_t = ProgressMode::Auto)]
        progress: ProgressMode,
    },

    /// Rebuild files from QR-code videos (input can be a directory or a single video)
    Decode {
        input: PathBuf,

        /// Scale applied to frames before recognition; -1 derives it from the recorded module size.
        #[arg(short = 'x', long, default_value_t = -1.0, allow_negative_numbers = true)]
        upscale: f32,

        /// Numerator of the automatic scale (numerator / module size).
        #[arg(long, default_value_t = 4.0)]
        upscale_numerator: f32,

        /// Only rebuild the file with this content hash (repeatable). Default: all.
        #[arg(long = "hash")]
        hashes: Vec<String>,

        /// Directory for output_<name> files. Default: the input directory.
        #[arg(long)]
        output: Option<PathBuf>,

        /// Ask on the console for frames no recognizer can read.
        #[arg(long, default_value_t = false)]
        interactive: bool,

        /// Script run as `<interpreter> <script> <frame.png>` for unreadable frames.
        /// Default: qrvid_fallback.py next to the executable, if present.
        #[arg(long)]
        fallback_script: Option<PathBuf>,

        /// Interpreter for the fallback script.
        #[arg(long, default_value_t = config::default_interpreter().to_string())]
        fallback_interpreter: String,

        /// Frame recognition threads. Default: auto.
        #[arg(long)]
        workers: Option<usize>,

        /// Progress display mode: auto (TTY-aware), rich, plain, quiet.
        #[arg(long, value_enum, default_value_t = ProgressMode::Auto)]
        progress: ProgressMode,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    util::ensure_tool_available("ffmpeg").context("ffmpeg not found in PATH")?;
    util::ensure_tool_available("ffprobe").context("ffprobe not found in PATH")?;

    match cli.cmd {
        Commands::Encode {
            input,
            error_correction,
            module_size,
            slice_len,
            fps,
            segment_seconds,
            preset,
            output,
            force,
            workers,
            progress,
        } => {
            let cfg = EncodeConfig {
                error_correction: ErrorCorrection::from_level(error_correction)?,
                module_size: ModuleSize::from_wire(module_size)?,
                slice_len,
                fps,
                segment_seconds,
                preset,
                output_root: output,
                force,
                workers: workers.unwrap_or_else(config::default_workers),
                ..EncodeConfig::default()
            };
            let summary = encoder::encode_path(&input, &cfg, ProgressConfig::new(progress))?;
            print_encode_summary(&summary);
            if !summary.failed.is_empty() {
                bail!(
                    "{} of {} file(s) failed to encode",
                    summary.failed.len(),
                    summary.failed.len() + summary.files.len()
                );
            }
        }

        Commands::Decode {
            input,
            upscale,
            upscale_numerator,
            hashes,
            output,
            interactive,
            fallback_script,
            fallback_interpreter,
            workers,
            progress,
        } => {
            let cfg = DecodeConfig {
                upscale: Upscale::from_flag(upscale)?,
                upscale_numerator,
                hashes,
                output_dir: output,
                interactive,
                fallback_script,
                fallback_interpreter,
                workers: workers.unwrap_or_else(config::default_workers),
            };
            let summary = decoder::decode_path(&input, &cfg, ProgressConfig::new(progress))?;
            print_decode_summary(&summary);
            if summary.files.is_empty() {
                bail!("no segment video could be read under {}", input.display());
            }
            if !summary.all_ok() {
                bail!(
                    "{} of {} file(s) were not restored intact",
                    summary.files.len() - summary.verified(),
                    summary.files.len()
                );
            }
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if verbose {
            "qrvid=debug".to_string()
        } else {
            "qrvid=warn".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(&env_filter)
        .init();
}

fn print_encode_summary(summary: &EncodeSummary) {
    println!(
        "Encode summary: input={} duration={} throughput={} bytes={} / {} files={} failed={} segments={} frames={} workers={} warnings={}",
        summary.input.display(),
        format_duration(summary.elapsed),
        Unit::Bytes.rate(summary.avg_bytes_per_sec),
        Unit::Bytes.amount(summary.processed_bytes),
        Unit::Bytes.amount(summary.total_bytes),
        summary.files.len(),
        summary.failed.len(),
        summary.segment_count(),
        summary.frame_count(),
        summary.workers,
        summary.warning_count,
    );
    for file in &summary.files {
        println!(
            "  encoded: {} hash={} segments={} output={}",
            file.source.display(),
            file.hash,
            file.segments.len(),
            file.output_dir.display()
        );
    }
    for (path, why) in &summary.failed {
        println!("  failed: {}: {}", path.display(), why);
    }
    for warning in &summary.warnings {
        println!("  warning: {}", warning);
    }
}

fn print_decode_summary(summary: &DecodeSummary) {
    println!(
        "Decode summary: input={} output={} duration={} throughput={} bytes={} frames={} videos={} skipped={} entries={} requested={} verified={} workers={} warnings={}",
        summary.input.display(),
        summary.output_dir.display(),
        format_duration(summary.elapsed),
        Unit::Bytes.rate(summary.avg_bytes_per_sec),
        Unit::Bytes.amount(summary.processed_bytes),
        summary.frames_decoded,
        summary.candidates,
        summary.skipped,
        summary.entries,
        summary.files.len(),
        summary.verified(),
        summary.workers,
        summary.warning_count,
    );
    for file in &summary.files {
        println!(
            "  {}: hash={} name={} bytes={} output={} detail={}",
            file.status.label(),
            file.hash,
            if file.name.is_empty() { "-" } else { &file.name },
            file.bytes,
            file.output
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "-".to_string()),
            file.status.detail(),
        );
    }
    for warning in &summary.warnings {
        println!("  warning: {}", warning);
    }
}
