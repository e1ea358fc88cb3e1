use clap::{Parser, Subcommand};
use respimg::imaging::RustTranscoder;
use respimg::journal::Journal;
use respimg::pipeline::{Pipeline, PipelineError, RunOptions, RunSummary};
use respimg::{config, output};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Shared flags for commands that process images.
#[derive(clap::Args, Clone)]
struct CacheArgs {
    /// Ignore the derivation cache and re-encode every output
    #[arg(long)]
    no_cache: bool,
}

#[derive(Parser)]
#[command(name = "respimg")]
#[command(about = "Incremental responsive image builder")]
#[command(long_about = "\
Incremental responsive image builder

Derives resized and re-encoded variants of every source image for each
configured task, records what was produced in a cache file next to the
output, and on the next run only encodes what is missing or stale.

Output layout:

  static/
  ├── .derivations.json            # Derivation cache
  └── images/                      # base_url
      ├── <token>_480.jpg          # One file per task and width
      ├── <token>_480.avif
      ├── <token>.jpg              # Fallback task (single width, no suffix)
      ├── photo.json               # Info record: srcset, sizes, inline data
      └── 2024-03-09-070502.log    # Run journal

Run 'respimg gen-config' to generate a documented respimg.toml.")]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = config::CONFIG_FILENAME, global = true)]
    config: PathBuf,

    /// Print every event and raise the log level
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Encode missing and stale outputs, then write info records
    Run(CacheArgs),
    /// Show every planned output and whether it would be encoded
    Plan(CacheArgs),
    /// List cache records whose outputs are missing or malformed
    Verify {
        /// Drop the listed records and regenerate their outputs
        #[arg(long)]
        rebuild: bool,
    },
    /// Print a stock respimg.toml with all options documented
    GenConfig,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Command::GenConfig = cli.command {
        print!("{}", config::stock_config_toml());
        return Ok(());
    }

    let config = config::load_or_default(&cli.config)?;
    let verbose = cli.verbose || config.verbose;
    init_tracing(verbose);
    init_thread_pool(&config);

    let transcoder = RustTranscoder::new();
    let pipeline = Pipeline::new(&config, &transcoder);

    let result = match cli.command {
        Command::Run(cache_args) => {
            let options = RunOptions {
                use_cache: !cache_args.no_cache,
                ..RunOptions::default()
            };
            with_printer(verbose, |journal| pipeline.run(&options, journal))
                .map(|summary| output::print_summary(&summary))
        }
        Command::Plan(cache_args) => {
            let options = RunOptions {
                use_cache: !cache_args.no_cache,
                ..RunOptions::default()
            };
            let mut journal = Journal::new();
            pipeline
                .plan(&options, &mut journal)
                .map(|report| output::print_plan(&report))
        }
        Command::Verify { rebuild: false } => pipeline
            .verify()
            .map(|invalid| output::print_verify(&invalid)),
        Command::Verify { rebuild: true } => {
            with_printer(verbose, |journal| {
                pipeline.rebuild(&RunOptions::default(), journal)
            })
            .map(|summary| output::print_summary(&summary))
        }
        Command::GenConfig => Ok(()),
    };

    match result {
        Err(PipelineError::DiscoveryEmpty) => {
            println!("No source images found in {:?}", config.search_paths);
            Ok(())
        }
        other => Ok(other?),
    }
}

/// Run `f` with a journal whose events are printed as they happen.
fn with_printer<F>(verbose: bool, f: F) -> Result<RunSummary, PipelineError>
where
    F: FnOnce(&mut Journal) -> Result<RunSummary, PipelineError>,
{
    let (tx, rx) = std::sync::mpsc::channel();
    let printer = std::thread::spawn(move || {
        for event in rx {
            for line in output::format_event(&event, verbose) {
                println!("{}", line);
            }
        }
    });
    let mut journal = Journal::with_listener(tx);
    let result = f(&mut journal);
    journal.detach();
    printer.join().ok();
    result
}

/// `RUST_LOG` wins; otherwise errors only (journal problems are already
/// printed as warnings), debug with `--verbose`.
fn init_tracing(verbose: bool) {
    let default = if verbose { "respimg=debug,warn" } else { "error" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Initialize the rayon thread pool based on the worker setting.
///
/// Caps at the number of available CPU cores; the setting can lower it, not raise it.
fn init_thread_pool(config: &config::Config) {
    let threads = config::effective_workers(config);
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()
        .ok();
}
