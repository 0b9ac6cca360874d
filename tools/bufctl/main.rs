// tools/bufctl/main.rs
//
// Command-line front end for the buffer engine: preview and import CSV
// captures, or frame a raw serial capture. Results are printed as JSON.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use wiretap_buffers::buffers::{self, PaginatedFramesResponse};
use wiretap_buffers::io::{CsvImportOptions, TimestampUnit};
use wiretap_buffers::{
    logging, settings, BackendFramingConfig, BufferRegistry, FramingModeConfig, FramingResult, StoreSettings,
};

#[derive(Parser)]
#[command(name = "bufctl")]
#[command(about = "Inspect, import and frame capture files")]
#[command(version)]
struct Cli {
    /// Settings file (TOML); defaults to settings.toml in the user data dir
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show detected header, column roles and timestamp unit for a CSV file
    Preview {
        file: PathBuf,

        /// Data rows to sample
        #[arg(short, long)]
        rows: Option<usize>,
    },
    /// Import a CSV file using the suggested (or overridden) interpretation
    Import {
        file: PathBuf,

        /// Timestamp unit, overriding the suggestion
        #[arg(long, value_enum)]
        unit: Option<UnitArg>,

        /// Take the absolute value of negative timestamps
        #[arg(long)]
        negate: Option<bool>,

        /// Frames to print from the imported buffer
        #[arg(long, default_value = "10")]
        show: usize,
    },
    /// Frame a raw serial capture file
    Frame {
        file: PathBuf,

        #[arg(long, value_enum, default_value = "slip")]
        mode: ModeArg,

        /// Raw mode delimiter as hex (e.g. 0D0A)
        #[arg(long)]
        delimiter: Option<String>,

        /// Raw mode forced split length
        #[arg(long)]
        max_length: Option<usize>,

        /// Modbus: keep frames whose CRC does not match
        #[arg(long)]
        no_crc: bool,

        /// Frames shorter than this go to the filtered buffer
        #[arg(long)]
        min_length: Option<usize>,

        /// Bus number stamped on every byte
        #[arg(long)]
        bus: Option<u8>,

        /// Microseconds between consecutive bytes
        #[arg(long, default_value = "1")]
        byte_interval_us: u64,

        /// Frames to print from the result
        #[arg(long, default_value = "10")]
        show: usize,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum UnitArg {
    S,
    Ms,
    Us,
    Ns,
}

impl From<UnitArg> for TimestampUnit {
    fn from(unit: UnitArg) -> Self {
        match unit {
            UnitArg::S => TimestampUnit::Seconds,
            UnitArg::Ms => TimestampUnit::Milliseconds,
            UnitArg::Us => TimestampUnit::Microseconds,
            UnitArg::Ns => TimestampUnit::Nanoseconds,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Raw,
    Slip,
    Modbus,
}

#[derive(serde::Serialize)]
struct ImportOutput {
    summary: wiretap_buffers::io::CsvImportSummary,
    frames: PaginatedFramesResponse,
}

#[derive(serde::Serialize)]
struct FrameOutput {
    result: FramingResult,
    frames: PaginatedFramesResponse,
}

fn load_settings(path: Option<&Path>) -> Result<StoreSettings, String> {
    match path {
        Some(path) => StoreSettings::load(path).map_err(|e| e.to_string()),
        None => match settings::default_settings_path() {
            Some(path) => StoreSettings::load_or_default(&path).map_err(|e| e.to_string()),
            None => Ok(StoreSettings::default()),
        },
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), String> {
    let json = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    println!("{}", json);
    Ok(())
}

async fn run(cli: Cli) -> Result<(), String> {
    let mut settings = load_settings(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        settings.log_level = level;
    }
    let _log_guard = logging::init_from_settings(&settings).map_err(|e| e.to_string())?;
    let registry = Arc::new(BufferRegistry::from_settings(&settings).map_err(|e| e.to_string())?);

    match cli.command {
        Commands::Preview { file, rows } => {
            let preview = buffers::preview_csv(&settings, file.to_string_lossy().into_owned(), rows).await?;
            print_json(&preview)
        }
        Commands::Import {
            file,
            unit,
            negate,
            show,
        } => {
            let path = file.to_string_lossy().into_owned();
            let preview = buffers::preview_csv(&settings, path.clone(), None).await?;
            let mut options = CsvImportOptions::from_preview(&preview);
            if let Some(unit) = unit {
                options.timestamp_unit = unit.into();
            }
            if let Some(negate) = negate {
                options.negate_timestamps = negate;
            }

            let summary = buffers::import_csv_with_mapping(
                &registry,
                path,
                options.mappings,
                options.skip_first_row,
                options.timestamp_unit,
                options.negate_timestamps,
            )
            .await?;
            let frames =
                buffers::get_buffer_frames_paginated_by_id(&registry, summary.metadata.id.clone(), 0, show).await?;
            print_json(&ImportOutput { summary, frames })
        }
        Commands::Frame {
            file,
            mode,
            delimiter,
            max_length,
            no_crc,
            min_length,
            bus,
            byte_interval_us,
            show,
        } => {
            let source = buffers::import_binary_to_buffer(
                &registry,
                file.to_string_lossy().into_owned(),
                bus,
                None,
                Some(byte_interval_us),
            )
            .await?;

            let mode = match mode {
                ModeArg::Raw => FramingModeConfig::Raw { delimiter, max_length },
                ModeArg::Slip => FramingModeConfig::Slip,
                ModeArg::Modbus => FramingModeConfig::ModbusRtu { validate_crc: !no_crc },
            };
            let config = BackendFramingConfig {
                mode,
                min_length,
                frame_id_config: None,
                source_address_config: None,
                per_interface: None,
                keep_filtered: None,
            };

            let result = wiretap_buffers::framing::apply_framing_to_buffer(
                &registry,
                &settings,
                Some(source.id),
                config,
                None,
                None,
            )
            .await?;
            let frames = buffers::get_buffer_frames_paginated_by_id(&registry, result.buffer_id.clone(), 0, show).await?;
            print_json(&FrameOutput { result, frames })
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("bufctl: {}", e);
        process::exit(1);
    }
}
