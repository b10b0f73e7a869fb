use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use rwkv_flow::{convert, ConvertOptions, Precision};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Float {
    Fp32,
    Fp16,
}

impl From<Float> for Precision {
    fn from(value: Float) -> Self {
        match value {
            Float::Fp32 => Precision::Fp32,
            Float::Fp16 => Precision::Fp16,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Level {
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<Level> for log::LevelFilter {
    fn from(value: Level) -> Self {
        match value {
            Level::Warn => log::LevelFilter::Warn,
            Level::Info => log::LevelFilter::Info,
            Level::Debug => log::LevelFilter::Debug,
            Level::Trace => log::LevelFilter::Trace,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Model directory holding `config.json` and the checkpoint.
    #[arg(value_name = "DIR")]
    model: PathBuf,
    /// Checkpoint name inside the model directory.
    #[arg(short, long, value_name = "FILE", default_value = "pytorch_model.pt")]
    input: String,
    /// Dump name inside the model directory.
    #[arg(short, long, value_name = "FILE", default_value = "model.bin")]
    output: String,
    /// Replace an existing dump.
    #[arg(long, action)]
    overwrite: bool,
    /// Storage precision of weight matrices.
    #[arg(short, long, value_enum, default_value_t = Float::Fp32)]
    precision: Float,
    #[arg(long, value_enum, default_value_t = Level::Info)]
    log: Level,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = cli.log.into();
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Warn)
        .with_module_level("rwkv_flow", level)
        .with_module_level("rwkv_flow_converter", level)
        .init()?;

    let options = ConvertOptions::new(&cli.model)
        .with_input_name(cli.input)
        .with_output_name(cli.output)
        .with_overwrite(cli.overwrite)
        .with_precision(cli.precision.into());
    let report = convert(&options)?;

    match report.skipped {
        true => log::info!("{:?} already exists, pass --overwrite to convert again", report.output),
        false => log::info!("model written to {:?}", report.output),
    }
    if !report.unused.is_empty() {
        log::warn!("{} parameters were not used", report.unused.len());
    }
    Ok(())
}
