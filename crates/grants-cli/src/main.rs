use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use grants_sync::SyncConfig;

#[derive(Debug, Parser)]
#[command(name = "grants-cli")]
#[command(about = "Fetch the grants opportunity export and write a cleaned copy")]
struct Cli {
    /// Fallback filter when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, save the raw response, clean it and save the cleaned export.
    Sync(SyncArgs),
    /// Clean an already saved raw export.
    Clean {
        #[arg(long)]
        input: PathBuf,
        /// Defaults to `<input stem>_cleaned.json` next to the input.
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    #[arg(long)]
    out_dir: Option<PathBuf>,
    #[arg(long)]
    url: Option<String>,
    #[arg(long)]
    read_timeout_secs: Option<u64>,
    #[arg(long)]
    rows: Option<u32>,
    #[arg(long)]
    keyword: Option<String>,
}

impl SyncArgs {
    fn apply(self, mut config: SyncConfig) -> SyncConfig {
        if let Some(out_dir) = self.out_dir {
            config.out_dir = out_dir;
        }
        if let Some(url) = self.url {
            config.api_url = url;
        }
        if let Some(secs) = self.read_timeout_secs {
            config.read_timeout_secs = secs;
        }
        if let Some(rows) = self.rows {
            config.rows = rows;
        }
        if self.keyword.is_some() {
            config.keyword = self.keyword;
        }
        config
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli.command.unwrap_or(Commands::Sync(SyncArgs::default()))).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Failed: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Sync(args) => {
            let config = args.apply(SyncConfig::from_env());
            let summary = grants_sync::run_sync_once(config).await?;
            println!(
                "sync complete: raw={} kept={} dropped={}",
                summary.raw_path.display(),
                summary.report.kept_records,
                summary.report.dropped_records
            );
            println!("Saved to {}", summary.cleaned_path.display());
        }
        Commands::Clean { input, output } => {
            let (path, report) = grants_sync::clean_export(&input, output).await?;
            println!(
                "clean complete: kept={} dropped={}",
                report.kept_records, report.dropped_records
            );
            println!("Saved to {}", path.display());
        }
    }

    Ok(())
}
