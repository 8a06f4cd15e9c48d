//! Bulk reporter.
//!
//! Reads request metrics from standard input, one JSON object per line, and ships them in compressed batches to the
//! configured sink.

#![deny(missing_docs)]
use std::path::PathBuf;

use clap::Parser as _;
use courier_app::prelude::*;
use courier_bulk::{BulkConfiguration, BulkProcessor, JsonLinesTransformer, RequestMetrics, StandardCompressor};
use courier_config::{ConfigurationLoader, GenericError};
use tokio::{
    io::{AsyncBufReadExt as _, BufReader},
    select,
};
use tracing::{error, info, warn};

mod sink;
use self::sink::{Sink, SinkKind};

/// Ships request metrics read from standard input in bulk.
#[derive(clap::Parser)]
#[command(version)]
struct Cli {
    /// Path to a YAML configuration file.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Where flushed batches are sent.
    #[arg(long, value_enum, default_value_t = SinkKind::Blackhole)]
    sink: SinkKind,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = initialize_logging(None) {
        fatal_and_exit(format!("failed to initialize logging: {}", e));
    }

    match run(cli).await {
        Ok(()) => info!("Bulk reporter stopped."),
        Err(e) => {
            error!("{:?}", e);
            std::process::exit(1);
        }
    }
}

fn load_configuration(config_path: Option<&PathBuf>) -> Result<BulkConfiguration, GenericError> {
    let mut loader = ConfigurationLoader::default();
    if let Some(path) = config_path {
        loader = loader.from_yaml(path)?;
    }
    let configuration = loader.from_environment("COURIER")?.into_generic();

    BulkConfiguration::from_configuration(&configuration)
}

async fn run(cli: Cli) -> Result<(), GenericError> {
    let config = load_configuration(cli.config.as_ref())?;
    let compressor = StandardCompressor::new(config.compression_scheme()?);

    let sink = Sink::from_kind(cli.sink);
    let blackhole = sink.blackhole();

    let processor = BulkProcessor::new(config, JsonLinesTransformer, compressor, sink)?;
    processor.start()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_number: u64 = 0;

    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    loop {
        select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    line_number += 1;
                    if line.trim().is_empty() {
                        continue;
                    }

                    match serde_json::from_str::<RequestMetrics>(&line) {
                        Ok(record) => processor.process(record),
                        Err(e) => warn!(line_number, error = %e, "Skipping malformed record."),
                    }
                }
                None => {
                    info!(lines = line_number, "Reached end of input.");
                    break;
                }
            },
            _ = &mut interrupt => {
                info!("Received interrupt signal.");
                break;
            }
        }
    }

    processor.stop().await;

    if let Some(blackhole) = blackhole {
        info!(
            batches = blackhole.batches(),
            records = blackhole.records(),
            bytes = blackhole.bytes(),
            "Blackhole sink totals."
        );
    }

    Ok(())
}
