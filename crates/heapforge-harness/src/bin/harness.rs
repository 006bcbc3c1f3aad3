//! CLI entrypoint for the heapforge harness.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use heapforge_core::HeapConfig;
use heapforge_core::config::parse_size;
use heapforge_harness::{HarnessError, StormConfig, StormType, logging, parse_seed};

/// Storm and scenario runner for heapforge.
#[derive(Debug, Parser)]
#[command(name = "heapforge-harness")]
#[command(about = "Deterministic allocation workloads for heapforge")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run fragmentation storms and emit a JSON report.
    Storm {
        /// Storm to run; all storms when omitted.
        #[arg(long)]
        kind: Option<StormType>,
        /// Root seed (decimal or 0x...). Defaults to a fixed seed per storm.
        #[arg(long)]
        seed: Option<String>,
        /// Operations per storm.
        #[arg(long, default_value_t = 20_000)]
        ops: usize,
        /// Live slot table size.
        #[arg(long)]
        slots: Option<usize>,
        /// Initially committed arena bytes (accepts k/m/g suffixes).
        #[arg(long, default_value = "64k", value_parser = size_arg)]
        initial_size: usize,
        /// Reserved arena ceiling.
        #[arg(long, default_value = "1m", value_parser = size_arg)]
        max_size: usize,
        /// Minimum growth increment.
        #[arg(long, default_value = "16k", value_parser = size_arg)]
        growth_step: usize,
        /// Output JSON path; stdout when omitted.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Run the reference scenarios.
    Scenarios {
        /// Output JSON path; stdout when omitted.
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn size_arg(raw: &str) -> Result<usize, HarnessError> {
    parse_size(raw).ok_or_else(|| HarnessError::InvalidSize(raw.to_string()))
}

fn emit(output: Option<&Path>, json: &str) -> Result<(), HarnessError> {
    match output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, json)?;
            eprintln!("Wrote {}", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Storm {
            kind,
            seed,
            ops,
            slots,
            initial_size,
            max_size,
            growth_step,
            output,
        } => {
            let seed = seed.as_deref().map(parse_seed).transpose()?;
            let heap = HeapConfig::default()
                .with_initial_size(initial_size)
                .with_max_size(max_size)
                .with_growth_step(growth_step)
                .with_log_capacity(0);
            heap.validate()?;

            let kinds = kind.map_or_else(|| StormType::all().to_vec(), |kind| vec![kind]);
            let mut reports = Vec::with_capacity(kinds.len());
            for kind in kinds {
                let mut config = StormConfig::new(kind).with_ops(ops).with_heap(heap.clone());
                if let Some(seed) = seed {
                    config = config.with_seed(seed);
                }
                if let Some(slots) = slots {
                    config = config.with_slots(slots);
                }
                reports.push(heapforge_harness::run_storm(&config)?);
            }

            emit(output.as_deref(), &serde_json::to_string_pretty(&reports)?)?;
            if let Some(failed) = reports.iter().find(|report| !report.passed()) {
                return Err(HarnessError::Integrity {
                    storm: failed.storm_type.as_str(),
                    detail: format!(
                        "{} violations, integrity {}, clean teardown {}",
                        failed.violations,
                        failed.integrity_check_passed,
                        failed.clean_after_teardown
                    ),
                }
                .into());
            }
        }
        Command::Scenarios { output } => {
            let outcomes = heapforge_harness::run_scenarios();
            emit(output.as_deref(), &serde_json::to_string_pretty(&outcomes)?)?;
            let failed = outcomes.iter().filter(|outcome| !outcome.passed).count();
            if failed > 0 {
                return Err(HarnessError::ScenariosFailed {
                    failed,
                    total: outcomes.len(),
                }
                .into());
            }
        }
    }

    Ok(())
}
