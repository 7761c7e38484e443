use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use proxy_sieve::{
    config::{Config, Settings, DEFAULT_CONFIG_PATH},
    init_logger,
    proxy::ProxyParser,
    Pipeline, RunStatus,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use tracing::{info, warn};

/// Log file used while the live view owns the terminal
const TUI_LOG_FILE: &str = "proxy-sieve.log";

/// Validate proxy lists by probing every proxy for reachability and speed
#[derive(Parser)]
#[command(name = "proxy-sieve", version)]
#[command(about = "Validate proxy lists by probing every proxy for reachability and speed")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Settings file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log filter, e.g. `debug` or `proxy_sieve=trace` (overrides RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe every proxy in the input directory and write reports (default)
    Check(CheckArgs),
    /// Parse the input directory and print the proxies found, without probing
    Parse {
        /// Directory of `.txt` proxy lists
        #[arg(short, long)]
        input: Option<PathBuf>,
    },
    /// Write a settings file with every default filled in
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args, Default)]
struct CheckArgs {
    /// Directory of `.txt` proxy lists
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Directory for report files
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Number of concurrent probes
    #[arg(short = 'n', long)]
    concurrency: Option<i64>,

    /// Reachability timeout in seconds
    #[arg(long)]
    timeout: Option<i64>,

    /// URL downloaded to measure throughput
    #[arg(long)]
    speed_test_url: Option<String>,

    /// Show the live terminal view while probing
    #[arg(long)]
    tui: bool,
}

impl CheckArgs {
    fn apply(&self, settings: &mut Settings) {
        if let Some(input) = &self.input {
            settings.fdip_dir = input.clone();
        }
        if let Some(output) = &self.output {
            settings.output_dir = output.clone();
        }
        if let Some(concurrency) = self.concurrency {
            settings.max_concurrent = concurrency;
        }
        if let Some(timeout) = self.timeout {
            settings.check_timeout = timeout;
        }
        if let Some(url) = &self.speed_test_url {
            settings.speed_test_url = url.clone();
        }
    }
}

fn load_config(path: &Path) -> Result<Config> {
    Config::load(path).with_context(|| format!("failed to load {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let command = cli
        .command
        .unwrap_or_else(|| Commands::Check(CheckArgs::default()));

    match command {
        Commands::InitConfig { force } => {
            init_logger(cli.log_level.as_deref(), None)?;
            if cli.config.exists() && !force {
                bail!(
                    "{} already exists, pass --force to overwrite it",
                    cli.config.display()
                );
            }
            Config::default().save_to_file(&cli.config)?;
            println!("Wrote default settings to {:?}", cli.config);
        }
        Commands::Parse { input } => {
            init_logger(cli.log_level.as_deref(), None)?;
            let config = load_config(&cli.config)?;
            let dir = input.unwrap_or(config.settings.fdip_dir);

            let mut scan = ProxyParser::scan_dir(&dir, 256)?;
            let rejected = scan.rejected_counter();
            let mut count = 0usize;
            while let Some(descriptor) = scan.descriptors.recv().await {
                println!("{} {}", descriptor.url, descriptor.protocol);
                count += 1;
            }

            println!(
                "\nParsed {} proxies from {:?} ({} lines rejected)",
                count,
                dir,
                rejected.load(Ordering::SeqCst)
            );
        }
        Commands::Check(args) => {
            let log_file = args.tui.then(|| PathBuf::from(TUI_LOG_FILE));
            init_logger(cli.log_level.as_deref(), log_file.as_deref())?;

            let mut config = load_config(&cli.config)?;
            args.apply(&mut config.settings);
            for applied in config.normalize() {
                warn!("config default applied: {}", applied);
            }

            let pipeline = Pipeline::from_config(&config).with_live_view(args.tui);
            match pipeline.run().await? {
                RunStatus::Completed(report) => {
                    info!(
                        valid = report.valid_count(),
                        output = %config.settings.output_dir.display(),
                        "done"
                    );
                }
                RunStatus::InputDirMissing(_) | RunStatus::NoDescriptors(_) => {
                    return Ok(ExitCode::from(2));
                }
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
