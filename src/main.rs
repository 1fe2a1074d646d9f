// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the metershim project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

// Main entry point for the energy compensation controller

use anyhow::Result;
use clap::Parser;
use log::info;
use std::path::PathBuf;
use tokio::signal;

use metershim::config::Config;
use metershim::daemon::Daemon;

/// Site-local energy compensation controller
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file (YAML format)
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Serial port of the physical meter (overrides the config file)
    #[arg(long)]
    meter_port: Option<String>,

    /// Serial port the inverter reads (overrides the config file)
    #[arg(long)]
    inverter_port: Option<String>,

    /// Write the default configuration to the config path and exit
    #[arg(long, default_value_t = false)]
    write_default_config: bool,

    /// Enable verbose logging (debug level)
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Disable all logging output
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.quiet {
        log::LevelFilter::Off
    } else if args.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if args.write_default_config {
        Config::default().save_to_file(&args.config)?;
        println!("Default configuration written to {:?}", args.config);
        return Ok(());
    }

    let mut config = Config::from_file(&args.config)?;
    config.apply_args(args.meter_port.clone(), args.inverter_port.clone());

    // one shared worker pool runs every periodic job; named threads make
    // a wedged worker identifiable in thread dumps
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.scheduler.workers)
        .thread_name("shim-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        info!("starting daemon");
        let mut daemon = Daemon::new();
        daemon.launch(config)?;

        match signal::ctrl_c().await {
            Ok(()) => {
                info!("received shutdown signal, terminating daemon");
                daemon.shutdown();
                daemon.join().await;
            }
            Err(err) => {
                eprintln!("Error waiting for shutdown signal: {}", err);
            }
        }
        Ok(())
    })
}
