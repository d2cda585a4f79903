//! CORTEX: byte-level hybrid SSM / attention / MoE model.
//!
//! This is the CLI binary entry point: build a model, run one forward pass
//! over a batch of bytes and report the result.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

use cortex_hybrid::{ByteBatch, Config, HybridModel};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Preset {
    Tiny,
    Cortex1,
}

/// CORTEX forward-pass CLI.
#[derive(Parser, Debug)]
#[command(
    name = "cortex",
    about = "CORTEX: byte-level hybrid state-space / attention / MoE model",
    version
)]
struct Cli {
    /// JSON config file. Overrides --preset.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Built-in configuration.
    #[arg(short, long, value_enum, default_value_t = Preset::Tiny)]
    preset: Preset,

    /// Parameter initialisation seed.
    #[arg(short, long, default_value_t = 0)]
    seed: u64,

    /// Sequences per batch.
    #[arg(short, long, default_value_t = 2)]
    batch_size: usize,

    /// Bytes per sequence.
    #[arg(short = 'l', long, default_value_t = 32)]
    seq_len: usize,

    /// Read bytes from this file instead of generating random ones.
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Enable dropout for the forward pass.
    #[arg(long, default_value_t = false)]
    train_mode: bool,
}

/// Level used when `RUST_LOG` is unset or unparsable.
const DEFAULT_LOG_LEVEL: &str = "info";

fn log_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_LEVEL))
}

fn main() -> Result<()> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(rust_log.as_deref()))
        .init();

    let cli = Cli::parse();

    tracing::info!("CORTEX v{}", env!("CARGO_PKG_VERSION"));

    let config = match &cli.config {
        Some(path) => Config::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => match cli.preset {
            Preset::Tiny => Config::tiny(),
            Preset::Cortex1 => Config::cortex1(),
        },
    };

    let mut rng = StdRng::seed_from_u64(cli.seed);
    let corpus = match &cli.input {
        Some(path) => {
            std::fs::read(path).with_context(|| format!("reading input {}", path.display()))?
        }
        None => {
            tracing::warn!("No input file provided. Using random bytes.");
            (0..cli.batch_size * cli.seq_len + 1).map(|_| rng.gen()).collect()
        }
    };
    tracing::info!("Corpus: {} bytes", corpus.len());

    let batch = ByteBatch::next_byte_windows(&corpus, cli.seq_len, cli.batch_size, 0)?;
    let model = HybridModel::new(config, cli.seed)?;

    tracing::info!("Layer plan: {}", model.layer_kinds().join(" → "));
    tracing::info!("Parameters: {}", model.param_count());

    let output = if cli.train_mode {
        model.forward_train(&batch.inputs, batch.targets.as_ref(), &mut rng)?
    } else {
        model.forward(&batch.inputs, batch.targets.as_ref())?
    };

    tracing::info!("Logits shape: {:?}", output.logits.dim());
    if let Some(loss) = output.loss {
        tracing::info!("Loss: {:.4} (uniform baseline {:.4})", loss, (256f32).ln());
    }

    let stats = &output.routing;
    tracing::info!("Expert load: {:?}", stats.counts);
    tracing::info!(
        "  mean {:.1}, variance {:.1}, min {}, max {}, gini {:.3}, idle {}",
        stats.mean,
        stats.variance,
        stats.min_count,
        stats.max_count,
        stats.gini,
        stats.idle_experts(),
    );

    tracing::info!("Done.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_filter_defaults_to_info() {
        assert_eq!(log_filter(None).to_string(), "info");
    }

    #[test]
    fn test_log_filter_honours_directives() {
        assert_eq!(log_filter(Some("debug")).to_string(), "debug");
        assert_eq!(log_filter(Some("warn")).to_string(), "warn");
    }
}
