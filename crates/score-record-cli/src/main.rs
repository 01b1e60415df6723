use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use score_record_api::{derive_record, read_events_json};
use score_record_core::reconcile_references;
use serde_json::Value;
use ulid::Ulid;

const CLI_CONTRACT_VERSION: &str = "srec.v1";

#[derive(Debug, Parser)]
#[command(name = "srec")]
#[command(about = "Score record derivation CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Assemble one course record from an ordered event stream.
    Derive(DeriveArgs),
    /// Reconcile a course record's reference-id collection.
    Reconcile(ReconcileArgs),
}

#[derive(Debug, Args)]
struct DeriveArgs {
    /// Path to a JSON array of event records, in processing order.
    #[arg(long)]
    events: PathBuf,
    /// Skip the bottom-up assessment rollup after reconstruction.
    #[arg(long, default_value_t = false)]
    no_rollup: bool,
}

#[derive(Debug, Args)]
struct ReconcileArgs {
    /// Currently stored reference ids.
    #[arg(long = "current", value_name = "ID")]
    current: Vec<String>,
    /// Ids explicitly invalidated by newer events.
    #[arg(long = "invalidate", value_name = "ID")]
    invalidate: Vec<String>,
    /// Newly introduced replacement ids.
    #[arg(long = "introduce", value_name = "ID")]
    introduce: Vec<String>,
    /// Mint this many fresh reference ids into the result.
    #[arg(long, default_value_t = 0)]
    mint: usize,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Derive(args) => run_derive(&args),
        Command::Reconcile(args) => run_reconcile(&args),
    }
}

fn run_derive(args: &DeriveArgs) -> Result<()> {
    let input = fs::read_to_string(&args.events)
        .with_context(|| format!("failed to read events file {}", args.events.display()))?;
    let events = read_events_json(&input)?;
    let event_count = events.len();

    match derive_record(&events, !args.no_rollup)? {
        Some(record) => emit_json(serde_json::json!({
            "events": event_count,
            "record": record,
        })),
        None => emit_json(serde_json::json!({
            "events": event_count,
            "record": null,
        })),
    }
}

fn run_reconcile(args: &ReconcileArgs) -> Result<()> {
    let mut introduced = args.introduce.clone();
    let minted = (0..args.mint).map(|_| Ulid::new().to_string()).collect::<Vec<_>>();
    introduced.extend(minted.iter().cloned());

    let merged = reconcile_references(&args.current, &args.invalidate, &introduced);
    emit_json(serde_json::json!({
        "reference_ids": merged.into_iter().collect::<Vec<_>>(),
        "minted": minted,
    }))
}
