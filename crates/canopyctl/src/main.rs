//! canopyctl - offline tooling for configuration stores.
//!
//! Validates, dumps, and converts transaction logs and snapshot
//! documents without a running orchestrator.

use canopy_core::{ConfigStore, ReplayOptions, StoreConfig};
use clap::{Parser, Subcommand, ValueEnum};
use eyre::{eyre, WrapErr};
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, EnvFilter};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Inspection tooling for canopy configuration stores.
#[derive(Parser)]
#[command(name = "canopyctl")]
#[command(about = "Validate, dump, and convert configuration tlogs and snapshots")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check a tlog for corruption (exit 1 if corrupt)
    Validate {
        /// Path to the tlog
        tlog: PathBuf,
    },

    /// Load an input (.tlog/.yaml/.yml/.json) and print the effective
    /// configuration
    Dump {
        /// Input file
        input: PathBuf,

        /// Output format
        #[arg(long, value_enum, default_value = "yaml")]
        format: Format,

        /// Recreate structure but blank every value (tlog inputs only)
        #[arg(long)]
        skeleton: bool,
    },

    /// Re-serialise an input into another representation, chosen by the
    /// output suffix (.tlog, .yaml, .json)
    Convert {
        /// Input file
        input: PathBuf,

        /// Output file
        output: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Yaml,
    Json,
}

fn main() -> eyre::Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")?;
    runtime.block_on(run(cli.command))
}

async fn run(command: Command) -> eyre::Result<()> {
    match command {
        Command::Validate { tlog } => match canopy_core::validate(&tlog) {
            Ok(()) => {
                println!("ok: {}", tlog.display());
                Ok(())
            }
            Err(e) => {
                eprintln!("corrupt: {e}");
                std::process::exit(1);
            }
        },
        Command::Dump { input, format, skeleton } => {
            let (store, _scratch) = scratch_store(&input, skeleton).await?;
            let doc = store.dump().await?;
            match format {
                Format::Yaml => print!("{}", serde_yaml::to_string(&doc)?),
                Format::Json => println!("{}", serde_json::to_string_pretty(&doc)?),
            }
            store.close().await?;
            Ok(())
        }
        Command::Convert { input, output } => {
            let (store, _scratch) = scratch_store(&input, false).await?;
            let suffix = output
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("")
                .to_ascii_lowercase();
            match suffix.as_str() {
                "tlog" => store.write_effective_config_as_tlog(&output).await?,
                "yaml" | "yml" => {
                    let file = std::fs::File::create(&output)?;
                    store.write_effective_config(std::io::BufWriter::new(file)).await?;
                }
                "json" => {
                    let doc = store.dump().await?;
                    std::fs::write(&output, serde_json::to_string_pretty(&doc)?)?;
                }
                other => {
                    store.close().await?;
                    return Err(eyre!("unsupported output suffix: {other:?}"));
                }
            }
            store.close().await?;
            println!("wrote {}", output.display());
            Ok(())
        }
    }
}

/// Load an input into a throwaway store rooted in a temp directory.
/// The returned guard removes the directory once the store is closed.
async fn scratch_store(
    input: &Path,
    skeleton: bool,
) -> eyre::Result<(ConfigStore, tempfile::TempDir)> {
    let scratch = tempfile::tempdir().wrap_err("failed to create scratch directory")?;
    let store = ConfigStore::open(StoreConfig::at(scratch.path()))
        .await
        .wrap_err("failed to open scratch store")?;
    if skeleton {
        let suffix = input.extension().and_then(|e| e.to_str()).unwrap_or("");
        if !suffix.eq_ignore_ascii_case("tlog") {
            return Err(eyre!("--skeleton applies to tlog inputs only"));
        }
        let options = ReplayOptions {
            skeleton: true,
            ..ReplayOptions::default()
        };
        store
            .read_tlog(input, options)
            .await
            .wrap_err_with(|| format!("failed to load {}", input.display()))?;
    } else {
        store
            .read(input, true)
            .await
            .wrap_err_with(|| format!("failed to load {}", input.display()))?;
    }
    Ok((store, scratch))
}
