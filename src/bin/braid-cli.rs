//! Braid CLI - Command-line interface for the Braid engine
//!
//! Runs compiled programs, validates them and writes default configs.

use anyhow::{Context, Result};
use braid::runtime::storage;
use braid::runtime::trace::{JsonLinesSink, TraceSink};
use braid::{EngineBuilder, EngineConfig, HaltReason, StdoutHandler};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "braid")]
#[command(about = "Work-stealing engine for structured concurrent orchestration", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a compiled program
    Run {
        /// Program file (JSON)
        program: PathBuf,

        /// Engine config file (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Worker threads (overrides config)
        #[arg(long)]
        workers: Option<usize>,

        /// Live token limit, negative for unbounded (overrides config)
        #[arg(long, allow_hyphen_values = true)]
        token_limit: Option<i64>,

        /// Stop after this many publications (overrides config)
        #[arg(long)]
        max_pubs: Option<u64>,

        /// Write lifecycle events as JSON lines
        #[arg(long)]
        trace: Option<PathBuf>,

        /// Terminate the run after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Validate a program and print its fingerprint
    Check {
        /// Program file (JSON)
        program: PathBuf,
    },

    /// Write the default engine config
    InitConfig {
        /// Destination file
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            program,
            config,
            workers,
            token_limit,
            max_pubs,
            trace,
            timeout_ms,
        } => {
            let program = storage::load_program(&program)?;
            let mut config = match config {
                Some(path) => storage::load_config(&path)?,
                None => EngineConfig::default(),
            };
            if let Some(workers) = workers {
                config.worker_threads = workers;
            }
            if let Some(limit) = token_limit {
                config.token_pool_size = limit;
            }
            if max_pubs.is_some() {
                config.max_publications = max_pubs;
            }

            let mut builder = EngineBuilder::new(program)
                .with_config(config)
                .with_handler(Arc::new(StdoutHandler));
            let writer = match trace {
                Some(path) => {
                    let (sink, writer) = JsonLinesSink::create(&path)?;
                    let sink: Arc<dyn TraceSink> = Arc::new(sink);
                    builder = builder.with_trace_sink(sink);
                    Some(writer)
                }
                None => None,
            };

            let mut engine = builder.build().context("Failed to create engine")?;
            engine.start()?;
            let reason = match timeout_ms {
                Some(ms) => match engine.wait_timeout(Duration::from_millis(ms)) {
                    Some(reason) => reason,
                    None => {
                        eprintln!("timeout after {} ms, terminating", ms);
                        engine.terminate();
                        engine.wait()
                    }
                },
                None => engine.wait(),
            };
            let publications = engine.publications();
            engine.shutdown();

            if let Some(writer) = writer {
                let events = writer.finish()?;
                eprintln!("wrote {} trace events", events);
            }
            eprintln!("halted ({}) after {} publications", reason, publications);
            if reason == HaltReason::Terminated {
                std::process::exit(2);
            }
        }

        Commands::Check { program } => {
            let program = storage::load_program(&program)?;
            println!("Program: {}", program.name);
            println!("Nodes: {}", program.len());
            println!("Sites: {}", program.site_names().into_iter().collect::<Vec<_>>().join(", "));
            println!("Fingerprint: {}", program.fingerprint());
        }

        Commands::InitConfig { path } => {
            storage::write_config(&path, &EngineConfig::default())?;
            println!("Wrote default config to {:?}", path);
        }
    }

    Ok(())
}
