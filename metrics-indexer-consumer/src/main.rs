use anyhow::{Context, Result};
use clap::Parser;
use metrics_indexer_consumer::batch::DropReason;
use metrics_indexer_consumer::{MessageProcessor, MetricsIngestConfiguration, OutputMessage};
use metrics_indexer_core::{BrokerMeta, RawMessage};
use serde_json::json;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "metrics-indexer")]
#[command(about = "Replay newline-delimited ingest metrics through the string indexer")]
#[command(version)]
struct Cli {
    /// Configuration file; defaults to CONFIG_PATH or config/indexer.yaml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Input file with one ingest payload per line; stdin when omitted
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Output file for indexed messages as JSON lines; stdout when omitted
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Messages per batch
    #[arg(short, long, default_value_t = 1000)]
    batch_size: usize,

    /// Partition number assigned to replayed messages
    #[arg(long, default_value_t = 0)]
    partition: u32,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Print Prometheus metrics to stderr on exit
    #[arg(long)]
    dump_metrics: bool,
}

fn init_tracing(json_logs: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);

    if json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<MetricsIngestConfiguration> {
    match path {
        Some(path) => {
            let mut config = MetricsIngestConfiguration::load_from_file(path)?;
            config.apply_env_overrides(|name| std::env::var(name).ok())?;
            config.validate()?;
            Ok(config)
        }
        None => MetricsIngestConfiguration::load(),
    }
}

fn output_line(message: &OutputMessage) -> serde_json::Value {
    let headers: BTreeMap<&str, String> = message
        .headers
        .iter()
        .map(|h| (h.name.as_str(), String::from_utf8_lossy(&h.value).into_owned()))
        .collect();

    json!({
        "partition": message.meta.partition,
        "offset": message.meta.offset,
        "routing": message.routing,
        "headers": headers,
        "payload": message.payload,
    })
}

#[derive(Default)]
struct Totals {
    received: usize,
    emitted: usize,
    invalid: usize,
    dropped: BTreeMap<DropReason, u64>,
}

async fn flush(
    processor: &mut MessageProcessor,
    pending: &mut Vec<RawMessage>,
    writer: &mut dyn Write,
    totals: &mut Totals,
) -> Result<()> {
    if pending.is_empty() {
        return Ok(());
    }

    let messages = std::mem::take(pending);
    totals.received += messages.len();

    let processed = processor
        .process_batch(messages)
        .await
        .context("Failed to process batch")?;

    for message in processed.output.messages() {
        serde_json::to_writer(&mut *writer, &output_line(message))?;
        writer.write_all(b"\n")?;
    }

    totals.emitted += processed.output.len();
    totals.invalid += processed.invalid_msg_meta.len();
    for (reason, count) in processed.drops.iter() {
        *totals.dropped.entry(reason).or_insert(0) += count;
    }
    for meta in &processed.invalid_msg_meta {
        warn!("Undecodable message at {}", meta);
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    if cli.batch_size == 0 {
        return Err(anyhow::anyhow!("Batch size must be greater than 0"));
    }

    let config = load_config(cli.config.as_ref())?;
    info!("Loaded configuration: {:?}", config);

    let mut processor = MessageProcessor::from_config(config)?;

    let reader: Box<dyn BufRead> = match &cli.input {
        Some(path) => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(io::stdin())),
    };
    let mut writer: Box<dyn Write> = match &cli.output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("Failed to create {}", path.display()))?,
        )),
        None => Box::new(BufWriter::new(io::stdout())),
    };

    let mut totals = Totals::default();
    let mut pending = Vec::with_capacity(cli.batch_size);

    for (offset, line) in reader.lines().enumerate() {
        let line = line.context("Failed to read input")?;
        if line.trim().is_empty() {
            continue;
        }

        pending.push(RawMessage::new(
            BrokerMeta::new(cli.partition, offset as u64),
            line.into_bytes(),
        ));

        if pending.len() >= cli.batch_size {
            flush(&mut processor, &mut pending, writer.as_mut(), &mut totals).await?;
        }
    }
    flush(&mut processor, &mut pending, writer.as_mut(), &mut totals).await?;
    writer.flush()?;

    if cli.dump_metrics {
        eprintln!("{}", processor.metrics().render()?);
    }
    processor.shutdown().await?;

    info!(
        "Replay complete: {} received, {} emitted, {} undecodable, dropped {:?}",
        totals.received, totals.emitted, totals.invalid, totals.dropped
    );

    Ok(())
}
