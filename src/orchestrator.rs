//! Batch orchestration of the matching cascade.
//!
//! One run walks every unresolved registry row through the cascade stages
//! in priority order, writing each batch back before starting the next, so
//! an interrupted run loses at most one batch of work. Stage failures
//! degrade: the affected candidates carry forward to the next stage and the
//! run continues. Only a missing or empty primary backbone is fatal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rusqlite::Connection;

use crate::backbone::{BackboneSession, SqlBackbone};
use crate::error::ResolveError;
use crate::matcher::{EngineMatcher, ExactMatcher, FuzzyMatcher, Matcher};
use crate::models::{
    CandidateName, DisambiguationStats, MatchResult, MatchSource, UnmatchedEntry,
};
use crate::progress;
use crate::registry;
use crate::similarity::DEFAULT_FUZZY_THRESHOLD;

pub const DEFAULT_BATCH_SIZE: usize = 5000;
pub const DEFAULT_ENGINE_TIMEOUT_SECS: u64 = 300;

/// How the primary backbone passes are executed.
pub enum MatchMode {
    /// In-process lookups against the backbone database.
    Sql,
    /// Delegate both primary passes to an external engine command.
    ExternalProcess { command: Vec<String> },
}

pub struct RunConfig {
    pub batch_size: usize,
    pub threshold: f64,
    pub engine_timeout: Duration,
    pub mode: MatchMode,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            batch_size: DEFAULT_BATCH_SIZE,
            threshold: DEFAULT_FUZZY_THRESHOLD,
            engine_timeout: Duration::from_secs(DEFAULT_ENGINE_TIMEOUT_SECS),
            mode: MatchMode::Sql,
        }
    }
}

/// Run lifecycle. `Failed` is only entered on a fatal backbone error;
/// everything else ends in `Done`, cancelled runs included.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RunState {
    Init,
    LoadingCandidates,
    Matching,
    Aggregating,
    Done,
    Failed,
}

impl RunState {
    fn as_str(self) -> &'static str {
        match self {
            RunState::Init => "INIT",
            RunState::LoadingCandidates => "LOADING_CANDIDATES",
            RunState::Matching => "MATCHING",
            RunState::Aggregating => "AGGREGATING",
            RunState::Done => "DONE",
            RunState::Failed => "FAILED",
        }
    }
}

fn enter(state: &mut RunState, next: RunState) {
    *state = next;
    eprintln!("[state] {}", next.as_str());
}

#[derive(Debug)]
pub struct RunOutcome {
    pub stats: DisambiguationStats,
    pub unmatched: Vec<UnmatchedEntry>,
    /// True when a cancellation request stopped the run early. Work already
    /// committed stays committed.
    pub cancelled: bool,
}

/// Execute one disambiguation run.
///
/// `backbone` must be `Some` in SQL mode; external-process mode leaves the
/// backbone to the engine and ignores it. `cancel` is checked at batch
/// boundaries only — a batch in flight always completes and commits.
pub fn run(
    registry_conn: &mut Connection,
    backbone: Option<Connection>,
    config: &RunConfig,
    cancel: &AtomicBool,
) -> Result<RunOutcome, ResolveError> {
    let started = Instant::now();
    let mut state = RunState::Init;
    enter(&mut state, RunState::Init);

    let mut stages = match build_stages(registry_conn, backbone, config) {
        Ok(stages) => stages,
        Err(e) => {
            enter(&mut state, RunState::Failed);
            return Err(e);
        }
    };

    enter(&mut state, RunState::LoadingCandidates);
    let candidates = registry::load_candidates(registry_conn)?;
    let mut stats = DisambiguationStats {
        total: candidates.len(),
        ..Default::default()
    };
    eprintln!("{} unresolved names to process", candidates.len());

    enter(&mut state, RunState::Matching);
    let pb = progress::phase_bar("Matching", candidates.len() as u64);
    let mut unmatched = Vec::new();
    let mut cancelled = false;
    let mut processed = 0u64;

    for chunk in candidates.chunks(config.batch_size.max(1)) {
        if cancel.load(Ordering::Relaxed) {
            eprintln!(
                "cancellation requested; stopping after {} committed batches",
                stats.batches
            );
            cancelled = true;
            break;
        }

        let resolved = match match_chunk(&mut stages, chunk, &mut stats, &mut unmatched) {
            Ok(resolved) => resolved,
            Err(e) => {
                pb.finish_and_clear();
                enter(&mut state, RunState::Failed);
                return Err(e);
            }
        };
        for result in &resolved {
            stats.record(result);
        }
        stats.updated_rows += registry::apply(registry_conn, &resolved)?;
        stats.batches += 1;

        processed += chunk.len() as u64;
        pb.inc(chunk.len() as u64);
        progress::log_progress("matching", processed, candidates.len() as u64, 10_000);
    }
    let matched = stats.matched_exact + stats.matched_fuzzy + stats.matched_fallback;
    progress::finish_phase(&pb, format!("Matched {} of {} names", matched, stats.total));

    enter(&mut state, RunState::Aggregating);
    stats.elapsed_seconds = started.elapsed().as_secs_f64();
    stats.log_phase("run");

    enter(&mut state, RunState::Done);
    Ok(RunOutcome {
        stats,
        unmatched,
        cancelled,
    })
}

/// Walk one batch through the cascade. Candidates a stage cannot resolve
/// (or that a failed stage never saw) carry forward; whatever survives the
/// last stage is recorded as unmatched.
fn match_chunk(
    stages: &mut [Box<dyn Matcher>],
    chunk: &[CandidateName],
    stats: &mut DisambiguationStats,
    unmatched: &mut Vec<UnmatchedEntry>,
) -> Result<Vec<MatchResult>, ResolveError> {
    let mut pending: Vec<CandidateName> = chunk.to_vec();
    let mut resolved: Vec<MatchResult> = Vec::with_capacity(chunk.len());

    for stage in stages.iter_mut() {
        if pending.is_empty() {
            break;
        }
        match stage.match_batch(&pending) {
            Ok(results) => {
                debug_assert_eq!(results.len(), pending.len());
                let mut carry = Vec::new();
                for (candidate, result) in pending.iter().zip(results) {
                    if result.matched {
                        resolved.push(result);
                    } else {
                        carry.push(candidate.clone());
                    }
                }
                pending = carry;
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                eprintln!("[{}] batch failed, continuing cascade: {}", stage.label(), e);
                stats.errors += 1;
            }
        }
    }

    for candidate in &pending {
        unmatched.push(UnmatchedEntry {
            registry_id: candidate.registry_id,
            name: candidate.raw.clone(),
        });
        resolved.push(MatchResult::unmatched(candidate, MatchSource::FallbackFuzzy));
    }
    Ok(resolved)
}

/// Assemble the cascade in priority order: primary exact, primary fuzzy,
/// fallback exact, fallback fuzzy. The fallback stages are skipped when the
/// registry carries no previously-resolved reference table.
fn build_stages(
    registry_conn: &Connection,
    backbone: Option<Connection>,
    config: &RunConfig,
) -> Result<Vec<Box<dyn Matcher>>, ResolveError> {
    let mut stages: Vec<Box<dyn Matcher>> = Vec::with_capacity(4);

    match &config.mode {
        MatchMode::Sql => {
            let conn = backbone.ok_or_else(|| {
                ResolveError::BackboneUnavailable("no backbone database supplied".to_string())
            })?;
            // BackboneSession::load draws its own phase bar.
            let session = Arc::new(BackboneSession::load(&conn)?);

            stages.push(Box::new(ExactMatcher::new(
                SqlBackbone::open(conn)?,
                MatchSource::PrimaryExact,
                "primary-exact",
            )));
            stages.push(Box::new(FuzzyMatcher::new(
                session,
                config.threshold,
                MatchSource::PrimaryFuzzy,
                "primary-fuzzy",
            )));
        }
        MatchMode::ExternalProcess { command } => {
            stages.push(Box::new(EngineMatcher::new(
                command.clone(),
                config.engine_timeout,
            )));
        }
    }

    match BackboneSession::load_fallback(registry_conn) {
        Some(fallback) => {
            eprintln!("fallback reference loaded: {} records", fallback.len());
            let fallback = Arc::new(fallback);
            stages.push(Box::new(ExactMatcher::new(
                fallback.clone(),
                MatchSource::FallbackExact,
                "fallback-exact",
            )));
            stages.push(Box::new(FuzzyMatcher::new(
                fallback,
                config.threshold,
                MatchSource::FallbackFuzzy,
                "fallback-fuzzy",
            )));
        }
        None => eprintln!("no fallback reference present; skipping fallback stages"),
    }

    Ok(stages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backbone::testutil::{backbone_conn, insert_backbone_row};

    fn registry_with(names: &[&str]) -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE species (
                id INTEGER PRIMARY KEY,
                canonical_name TEXT NOT NULL,
                wfo_id TEXT,
                taxonomic_status TEXT,
                family TEXT,
                genus TEXT,
                updated_at TEXT
            );",
        )
        .unwrap();
        for (i, name) in names.iter().enumerate() {
            conn.execute(
                "INSERT INTO species (id, canonical_name) VALUES (?1, ?2)",
                rusqlite::params![i as i64 + 1, name],
            )
            .unwrap();
        }
        conn
    }

    fn add_fallback(conn: &Connection, rows: &[(&str, &str)]) {
        conn.execute_batch(
            "CREATE TABLE resolved_names (
                name TEXT PRIMARY KEY,
                wfo_id TEXT,
                taxonomic_status TEXT,
                family TEXT,
                genus TEXT
            );",
        )
        .unwrap();
        for (name, wfo_id) in rows {
            conn.execute(
                "INSERT INTO resolved_names (name, wfo_id, taxonomic_status, family, genus)
                 VALUES (?1, ?2, 'accepted', 'Fabaceae', 'Vicia')",
                rusqlite::params![name, wfo_id],
            )
            .unwrap();
        }
    }

    fn small_backbone() -> Connection {
        let conn = backbone_conn();
        insert_backbone_row(
            &conn,
            "wfo-0000213248",
            "Vicia faba",
            "Vicia",
            "faba",
            "Fabaceae",
            "accepted",
            Some(2974951),
        );
        insert_backbone_row(
            &conn,
            "wfo-0000832390",
            "Araucaria angustifolia",
            "Araucaria",
            "angustifolia",
            "Araucariaceae",
            "accepted",
            Some(2684246),
        );
        conn
    }

    fn no_cancel() -> AtomicBool {
        AtomicBool::new(false)
    }

    #[test]
    fn exact_primary_match_updates_registry() {
        let mut registry = registry_with(&["Vicia faba"]);
        let outcome = run(
            &mut registry,
            Some(small_backbone()),
            &RunConfig::default(),
            &no_cancel(),
        )
        .unwrap();

        assert_eq!(outcome.stats.total, 1);
        assert_eq!(outcome.stats.matched_exact, 1);
        assert_eq!(outcome.stats.unmatched, 0);
        assert!(outcome.unmatched.is_empty());
        assert!(!outcome.cancelled);

        let wfo_id: String = registry
            .query_row("SELECT wfo_id FROM species WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(wfo_id, "wfo-0000213248");
    }

    #[test]
    fn misspelled_name_resolves_via_primary_fuzzy() {
        let mut registry = registry_with(&["Araucaria angustifola"]);
        let outcome = run(
            &mut registry,
            Some(small_backbone()),
            &RunConfig::default(),
            &no_cancel(),
        )
        .unwrap();

        assert_eq!(outcome.stats.matched_fuzzy, 1);
        assert_eq!(outcome.stats.matched_exact, 0);
        let wfo_id: String = registry
            .query_row("SELECT wfo_id FROM species WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(wfo_id, "wfo-0000832390");
    }

    #[test]
    fn primary_fuzzy_wins_over_fallback_exact() {
        // The fallback carries the literal misspelling; the primary fuzzy
        // stage still runs first and claims the candidate.
        let mut registry = registry_with(&["Araucaria angustifola"]);
        add_fallback(&registry, &[("Araucaria angustifola", "wfo-9999999999")]);

        let outcome = run(
            &mut registry,
            Some(small_backbone()),
            &RunConfig::default(),
            &no_cancel(),
        )
        .unwrap();

        assert_eq!(outcome.stats.matched_fuzzy, 1);
        assert_eq!(outcome.stats.matched_fallback, 0);
        let wfo_id: String = registry
            .query_row("SELECT wfo_id FROM species WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(wfo_id, "wfo-0000832390");
    }

    #[test]
    fn fallback_resolves_names_the_primary_misses() {
        let mut registry = registry_with(&["Dracaena trifasciata"]);
        add_fallback(&registry, &[("Dracaena trifasciata", "wfo-0000651568")]);

        let outcome = run(
            &mut registry,
            Some(small_backbone()),
            &RunConfig::default(),
            &no_cancel(),
        )
        .unwrap();

        assert_eq!(outcome.stats.matched_fallback, 1);
        assert_eq!(outcome.stats.unmatched, 0);
        let wfo_id: String = registry
            .query_row("SELECT wfo_id FROM species WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(wfo_id, "wfo-0000651568");
    }

    #[test]
    fn unknown_name_ends_unmatched_and_untouched() {
        let mut registry = registry_with(&["Invalid species name"]);
        let outcome = run(
            &mut registry,
            Some(small_backbone()),
            &RunConfig::default(),
            &no_cancel(),
        )
        .unwrap();

        assert_eq!(outcome.stats.unmatched, 1);
        assert_eq!(outcome.unmatched.len(), 1);
        assert_eq!(outcome.unmatched[0].name, "Invalid species name");

        let wfo_id: Option<String> = registry
            .query_row("SELECT wfo_id FROM species WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        assert!(wfo_id.is_none());
    }

    #[test]
    fn empty_backbone_is_fatal() {
        let mut registry = registry_with(&["Vicia faba"]);
        let err = run(
            &mut registry,
            Some(backbone_conn()),
            &RunConfig::default(),
            &no_cancel(),
        )
        .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn cancellation_stops_before_the_next_batch() {
        let mut registry = registry_with(&["Vicia faba", "Araucaria angustifolia"]);
        let cancel = AtomicBool::new(true);
        let outcome = run(
            &mut registry,
            Some(small_backbone()),
            &RunConfig {
                batch_size: 1,
                ..Default::default()
            },
            &cancel,
        )
        .unwrap();

        assert!(outcome.cancelled);
        assert_eq!(outcome.stats.batches, 0);
        let resolved: i64 = registry
            .query_row(
                "SELECT COUNT(*) FROM species WHERE wfo_id IS NOT NULL",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(resolved, 0);
    }

    #[test]
    fn engine_failure_degrades_to_fallback() {
        let mut registry = registry_with(&["Vicia faba"]);
        add_fallback(&registry, &[("Vicia faba", "wfo-0000213248")]);

        let outcome = run(
            &mut registry,
            None,
            &RunConfig {
                mode: MatchMode::ExternalProcess {
                    command: vec!["/nonexistent/matching-engine".to_string()],
                },
                ..Default::default()
            },
            &no_cancel(),
        )
        .unwrap();

        assert!(outcome.stats.errors >= 1);
        assert_eq!(outcome.stats.matched_fallback, 1);
        assert_eq!(outcome.stats.unmatched, 0);
    }

    #[test]
    fn external_engine_results_flow_through() {
        // Stand-in engine: reads the name file handed as its argument and
        // claims an exact match for every line.
        let script = r#"while IFS= read -r name; do
            printf '{"original":"%s","matched":true,"scientificName":"%s","taxonID":"wfo-0000213248","taxonomicStatus":"Accepted","family":"Fabaceae","genus":"Vicia","Fuzzy":false}\n' "$name" "$name"
        done < "$0""#;
        let mut registry = registry_with(&["Vicia faba"]);
        let outcome = run(
            &mut registry,
            None,
            &RunConfig {
                mode: MatchMode::ExternalProcess {
                    command: vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
                },
                ..Default::default()
            },
            &no_cancel(),
        )
        .unwrap();

        assert_eq!(outcome.stats.matched_exact, 1);
        let wfo_id: String = registry
            .query_row("SELECT wfo_id FROM species WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(wfo_id, "wfo-0000213248");
    }

    #[test]
    fn rerun_is_idempotent() {
        let mut registry = registry_with(&["Vicia faba"]);
        let first = run(
            &mut registry,
            Some(small_backbone()),
            &RunConfig::default(),
            &no_cancel(),
        )
        .unwrap();
        assert_eq!(first.stats.matched_exact, 1);

        let second = run(
            &mut registry,
            Some(small_backbone()),
            &RunConfig::default(),
            &no_cancel(),
        )
        .unwrap();
        assert_eq!(second.stats.total, 0);
        assert_eq!(second.stats.batches, 0);
    }
}
