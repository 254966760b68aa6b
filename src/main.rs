use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use backbone_match::error::ResolveError;
use backbone_match::orchestrator::{
    self, MatchMode, RunConfig, DEFAULT_BATCH_SIZE, DEFAULT_ENGINE_TIMEOUT_SECS,
};
use backbone_match::progress;
use backbone_match::similarity::DEFAULT_FUZZY_THRESHOLD;

#[derive(Parser)]
#[command(name = "backbone-match")]
#[command(about = "Resolve raw plant names against the taxonomic backbone")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Match unresolved registry names and fill in backbone identifiers
    Resolve {
        /// Species registry database (read-write)
        #[arg(long)]
        registry: PathBuf,

        /// Backbone database (read-only; required in sql mode)
        #[arg(long)]
        backbone: Option<PathBuf>,

        #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
        batch_size: usize,

        #[arg(long, value_enum, default_value_t = Mode::Sql)]
        mode: Mode,

        /// External engine command, whitespace-split (external-process mode)
        #[arg(long)]
        engine_cmd: Option<String>,

        /// Minimum trigram similarity for a fuzzy match
        #[arg(long, default_value_t = DEFAULT_FUZZY_THRESHOLD)]
        threshold: f64,

        /// Per-invocation engine timeout
        #[arg(long, default_value_t = DEFAULT_ENGINE_TIMEOUT_SECS)]
        timeout_secs: u64,

        /// Hide progress bars, emit plain log lines (for nohup/cron)
        #[arg(long)]
        log_only: bool,

        /// Write unmatched names as JSON lines
        #[arg(long)]
        unmatched_out: Option<PathBuf>,

        /// Write run statistics as JSON
        #[arg(long)]
        stats_out: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Sql,
    ExternalProcess,
}

/// Reports must never land on top of a source database.
fn validate_report_path(output: &Path, sources: &[&Path]) -> Result<(), ResolveError> {
    for source in sources {
        if output == *source {
            return Err(ResolveError::UnsafeOutputPath(output.to_path_buf()));
        }
    }
    Ok(())
}

fn write_unmatched(
    path: &Path,
    entries: &[backbone_match::models::UnmatchedEntry],
) -> Result<()> {
    let mut out = String::new();
    for entry in entries {
        out.push_str(&serde_json::to_string(entry)?);
        out.push('\n');
    }
    std::fs::write(path, out).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

static CANCELLED: AtomicBool = AtomicBool::new(false);

fn main() -> Result<()> {
    let args = Args::parse();

    let Command::Resolve {
        registry,
        backbone,
        batch_size,
        mode,
        engine_cmd,
        threshold,
        timeout_secs,
        log_only,
        unmatched_out,
        stats_out,
    } = args.command;

    progress::set_log_only(log_only);
    if !(0.0..=1.0).contains(&threshold) {
        bail!("threshold must be between 0 and 1, got {}", threshold);
    }

    let mut sources: Vec<&Path> = vec![registry.as_path()];
    if let Some(ref b) = backbone {
        sources.push(b.as_path());
    }
    if let Some(ref path) = unmatched_out {
        validate_report_path(path, &sources)?;
    }
    if let Some(ref path) = stats_out {
        validate_report_path(path, &sources)?;
    }

    let run_mode = match mode {
        Mode::Sql => MatchMode::Sql,
        Mode::ExternalProcess => {
            let cmd = engine_cmd
                .as_deref()
                .context("--engine-cmd is required in external-process mode")?;
            let command: Vec<String> = cmd.split_whitespace().map(str::to_string).collect();
            if command.is_empty() {
                bail!("--engine-cmd must not be empty");
            }
            MatchMode::ExternalProcess { command }
        }
    };

    ctrlc::set_handler(|| {
        eprintln!("interrupt received; finishing the current batch");
        CANCELLED.store(true, Ordering::Relaxed);
    })
    .context("installing interrupt handler")?;

    eprintln!("Opening registry database: {}", registry.display());
    let mut registry_conn = Connection::open(&registry)
        .with_context(|| format!("opening registry {}", registry.display()))?;
    registry_conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA cache_size = -64000;
         PRAGMA temp_store = MEMORY;",
    )?;

    let backbone_conn = match (&run_mode, &backbone) {
        (MatchMode::Sql, Some(path)) => {
            eprintln!("Opening backbone database: {}", path.display());
            let conn = Connection::open(path)
                .map_err(|e| ResolveError::BackboneUnavailable(e.to_string()))?;
            conn.execute_batch(
                "PRAGMA mmap_size = 8589934592;
                 PRAGMA cache_size = -1000000;
                 PRAGMA temp_store = MEMORY;",
            )?;
            Some(conn)
        }
        (MatchMode::Sql, None) => {
            return Err(
                ResolveError::BackboneUnavailable("--backbone is required in sql mode".to_string())
                    .into(),
            )
        }
        (MatchMode::ExternalProcess { .. }, _) => None,
    };

    let config = RunConfig {
        batch_size,
        threshold,
        engine_timeout: Duration::from_secs(timeout_secs),
        mode: run_mode,
    };

    let outcome = orchestrator::run(&mut registry_conn, backbone_conn, &config, &CANCELLED)?;

    if let Some(path) = unmatched_out {
        write_unmatched(&path, &outcome.unmatched)?;
        eprintln!(
            "wrote {} unmatched names to {}",
            outcome.unmatched.len(),
            path.display()
        );
    }
    if let Some(path) = stats_out {
        outcome.stats.write_to_file(&path)?;
    }

    eprintln!(
        "match rate: {:.1}% over {} batches in {}",
        outcome.stats.match_rate(),
        outcome.stats.batches,
        progress::format_duration(Duration::from_secs_f64(outcome.stats.elapsed_seconds)),
    );
    println!("{}", outcome.stats.summary());
    Ok(())
}
