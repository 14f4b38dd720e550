/*
Extract AudioSep encoder embeddings for LibriSpeech test-clean:

cargo run --release -- extract \
    --checkpoint checkpoint/audiosep_base_4M_steps.ckpt \
    --manifest LibriSpeech/metadata/test-clean.csv \
    --audio-dir LibriSpeech

Interrupt at any time; running the same command again continues after the
last part file. Once done:

cargo run --release -- merge
*/

use audiosep_features::ExtractOptions;
use clap::{Args, Parser, Subcommand};
use eyre::Result;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract embeddings, resuming after the last part file
    Extract(ExtractArgs),
    /// Report how much of the corpus is extracted
    Status(CorpusArgs),
    /// Concatenate all parts into a single file
    Merge(CorpusArgs),
}

#[derive(Args, Debug)]
struct CorpusArgs {
    /// CSV with origin_path and speaker_ID columns
    #[arg(long, default_value = "LibriSpeech/metadata/test-clean.csv")]
    manifest: PathBuf,

    /// Root the manifest's origin_path entries are relative to
    #[arg(long, default_value = "LibriSpeech")]
    audio_dir: PathBuf,

    /// Part files are written next to this path
    #[arg(long, default_value = "speaker_recognition/librispeech_testclean_features")]
    output: PathBuf,
}

#[derive(Args, Debug)]
struct ExtractArgs {
    #[command(flatten)]
    corpus: CorpusArgs,

    /// Pretrained AudioSep checkpoint (.ckpt, .pt or .safetensors)
    #[arg(long, env = "AUDIOSEP_CHECKPOINT")]
    checkpoint: PathBuf,

    /// Utterances per part file
    #[arg(long, default_value = "1")]
    save_interval: usize,

    /// Chain pooled block outputs instead of pre-pool activations
    #[arg(long)]
    pool_between_blocks: bool,
}

impl CorpusArgs {
    fn options(self) -> ExtractOptions {
        ExtractOptions {
            manifest: self.manifest,
            audio_dir: self.audio_dir,
            output: self.output,
            ..Default::default()
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Extract(args) => {
            let options = ExtractOptions {
                checkpoint: Some(args.checkpoint),
                save_interval: args.save_interval,
                pool_between_blocks: args.pool_between_blocks,
                ..args.corpus.options()
            };
            let summary = options.run()?;
            println!(
                "{} utterances: resumed at {}, {} parts written",
                summary.total, summary.resumed_from, summary.written
            );
        }
        Command::Status(args) => {
            let options = args.options();
            let total = options.dataset()?.len();
            let status = options.store()?.status(total)?;
            println!("{}/{} utterances extracted", status.completed, status.total);
            for gap in &status.gaps {
                println!("missing {}..{}", gap.start, gap.end);
            }
        }
        Command::Merge(args) => {
            let options = args.options();
            let total = options.dataset()?.len();
            let path = options.store()?.merge(total)?;
            println!("wrote {}", path.display());
        }
    }
    Ok(())
}
