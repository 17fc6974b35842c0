use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::prelude::*;
use xmlforge::config::{self, CONFIG_FILE};
use xmlforge::output;
use xmlforge::params::Params;
use xmlforge::site::{BuildOptions, Site, StateOverrides};

#[derive(Parser)]
#[command(name = "xmlforge")]
#[command(about = "Incremental XML site builder")]
#[command(long_about = "\
Incremental XML site builder

Scanners walk source trees and hand matching files to rules. A rule picks a
transform program by the document's root element, writes the result only
when the source is newer than the target, and extracts dated state records.
After every scanner has run, the records are published as paginated
chronological and per-tag listings.

  xmlforge.toml
  ├── [rules.page]         # transform programs, output naming, post-passes
  └── [scanners.site]      # source → target, patterns, suffix → rule

Run 'xmlforge gen-config' to generate a documented xmlforge.toml.")]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = CONFIG_FILE, global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct BuildArgs {
    /// Profile selecting which scanners run
    #[arg(long, default_value = "default")]
    profile: String,

    /// Only run these scanners (repeatable)
    #[arg(long = "scanner")]
    scanners: Vec<String>,

    /// Override the source directory (needs exactly one scanner)
    #[arg(long)]
    source: Option<PathBuf>,

    /// Override the target directory (needs exactly one scanner)
    #[arg(long)]
    target: Option<PathBuf>,

    /// Publish state into this directory
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Entries per state page
    #[arg(long)]
    state_pagination: Option<usize>,

    /// Base name of the chronological state stream
    #[arg(long)]
    state_recent_name: Option<String>,

    /// Base name of the tag index
    #[arg(long)]
    state_tags_name: Option<String>,

    /// Write a JSON build report
    #[arg(long)]
    report: Option<PathBuf>,

    /// Transform parameters as NAME=VALUE
    params: Vec<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scanners and publish state
    Build(BuildArgs),
    /// Validate the configuration and compile every transform program
    Check,
    /// Print a stock xmlforge.toml with all options documented
    GenConfig,
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "xmlforge=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {}", error_chain(err.as_ref()));
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Build(args) => {
            let config = config::load_config(&cli.config)?;
            init_thread_pool(&config.build);
            let site = Site::new(config)?;
            let options = BuildOptions {
                profile: args.profile,
                scanners: args.scanners,
                source: args.source,
                target: args.target,
                state: StateOverrides {
                    dir: args.state_dir,
                    pagination: args.state_pagination,
                    recent: args.state_recent_name,
                    tags: args.state_tags_name,
                },
                params: Params::from_assignments(&args.params),
            };

            let (tx, rx) = std::sync::mpsc::channel();
            let printer = std::thread::spawn(move || {
                for event in rx {
                    for line in output::format_build_event(&event) {
                        println!("{}", line);
                    }
                }
            });
            let result = site.build(&options, Some(&tx));
            drop(tx);
            printer.join().ok();
            let report = result?;

            output::print_build_summary(&report);
            if let Some(path) = args.report {
                let json = serde_json::to_string_pretty(&report)?;
                std::fs::write(&path, json)?;
            }
        }
        Command::Check => {
            let config = config::load_config(&cli.config)?;
            let site = Site::new(config)?;
            let programs = site.check()?;
            output::print_check_output(site.config(), programs);
        }
        Command::GenConfig => {
            print!("{}", config::stock_config_toml());
        }
    }

    Ok(())
}

/// Initialize the rayon thread pool based on build config.
///
/// Capped at the number of available CPU cores: users can constrain down, not up.
/// Workers run transforms, so they get a transform-sized stack.
fn init_thread_pool(build: &config::BuildConfig) {
    let threads = config::effective_jobs(build);
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .stack_size(xmlforge::transform::STACK_SIZE)
        .build_global()
        .ok();
}

/// `outer: inner: innermost`, skipping sources whose message the outer error
/// already repeats.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.ends_with(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}
