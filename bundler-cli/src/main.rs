//! tsbundle CLI - thin front end over bundler-core.
//!
//! Wires a `BundleConfig` (loaded from a config file or built from
//! command-line flags for a single entry point) and the default
//! `ParserEngine`/`ModuleResolver` pair into `BundleAssembler::bundle`.
//! The invocation surface deliberately stops there: no watch-loop event
//! pump, no daemon mode. A caller that wants watch behaviour drives
//! `BundleAssembler::watch_handle` itself and calls `bundle()` again.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;

use bundler_core::prelude::*;

#[derive(Parser, Debug)]
#[command(author, version, about = "Incremental module bundler")]
struct Cli {
    /// Entry point to bundle. Ignored if --config is given.
    #[arg(default_value = "src/index.ts")]
    entry: PathBuf,

    /// Output bundle path. Ignored if --config is given.
    #[arg(short, long, default_value = "dist/bundle.js")]
    output: PathBuf,

    /// Path to a bundle.toml config file. When given, `entry`/`output`
    /// are ignored in favour of the file's contents.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory the refinement cache and id registry are persisted under.
    #[arg(long, default_value = ".tsbundle-cache")]
    cache_dir: PathBuf,

    /// Emit verbose structured logging regardless of RUST_LOG.
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    std::panic::set_hook(Box::new(|info| {
        eprintln!("[PANIC] tsbundle internal error: {}", info);
        eprintln!("[PANIC] the process will exit with code 2.");
    }));

    init_structured_logging();

    match run().await {
        Ok(output) if output.error_count == 0 => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(err) => {
            log_error(&format!("bundle failed: {err:#}"));
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<BundleOutput> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            BundleConfig::load(path).with_context(|| format!("loading config {}", path.display()))?
        }
        None => BundleConfig::for_entry(cli.entry.clone(), cli.output.clone())
            .with_context(|| "building config from CLI flags")?,
    };

    if cli.verbose || config.verbose {
        log_info(&format!(
            "bundling {} entr{} into {}",
            config.entry.len(),
            if config.entry.len() == 1 { "y" } else { "ies" },
            config.output.display()
        ));
    }

    let assembler = BundleAssembler::new(
        config,
        cli.cache_dir,
        Box::new(StaticImportParserEngine::new()),
        Box::new(NodeModuleResolver::new()),
    )
    .await;

    let result = assembler.bundle().await;

    // `Drop` can't run async code, so the registry's cache map is flushed
    // synchronously here regardless of whether the bundle succeeded.
    if let Err(e) = assembler.save_cache_sync() {
        log_warn(&format!("failed to persist cache map on exit: {e}"));
    }

    let output = result.with_context(|| "bundle failed")?;

    if output.error_count > 0 {
        log_warn(&format!(
            "bundle completed with {} per-module error(s)",
            output.error_count
        ));
    } else {
        log_info(&format!("bundle written to {}", output.output_path.display()));
    }

    Ok(output)
}
