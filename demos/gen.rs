use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use futures::StreamExt;
use rwkv_flow::{DecodingOptions, Pipeline};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Converted model directory.
    #[arg(short, long, value_name = "DIR")]
    model: PathBuf,
    /// Prompt as comma-separated token ids.
    #[arg(short, long, value_delimiter = ',', default_value = "1,2,3")]
    prompt: Vec<u32>,
    #[arg(long, default_value_t = 64)]
    max_len: usize,
    #[arg(long, default_value_t = 1.0)]
    temperature: f32,
    #[arg(long, default_value_t = 0)]
    top_k: usize,
    #[arg(long, default_value_t = 1.0)]
    top_p: f32,
    /// Sample instead of taking the most likely token.
    #[arg(short, long, action)]
    sample: bool,
    #[arg(long)]
    seed: Option<u64>,
    /// Cancel after this many tokens.
    #[arg(long)]
    cancel_after: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Warn)
        .with_module_level("rwkv_flow", log::LevelFilter::Debug)
        .with_module_level("gen", log::LevelFilter::Info)
        .init()?;
    let cli = Cli::parse();

    let pipeline = Pipeline::load(&cli.model)?;
    let options = DecodingOptions {
        max_len: cli.max_len,
        temperature: cli.temperature,
        top_k: cli.top_k,
        top_p: cli.top_p,
        use_sampling: cli.sample,
        seed: cli.seed,
        ..Default::default()
    };

    let instant = std::time::Instant::now();
    let generation = pipeline.generate(cli.prompt, options)?;
    let mut stream = generation.stream().enumerate();
    while let Some((index, token)) = stream.next().await {
        let token = token?;
        println!("{}\t{:.4}", token.token, token.score);
        if cli.cancel_after == Some(index + 1) {
            generation.cancel();
        }
    }
    drop(stream);

    let outcome = generation.handle.await??;
    let duration = instant.elapsed();
    log::info!(
        "{:?}: {} tokens in {duration:?}",
        outcome.status,
        outcome.tokens.len()
    );
    Ok(())
}
