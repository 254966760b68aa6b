//! Matcher cascade stages.
//!
//! Each stage implements [`Matcher`]: given a batch of candidates it returns
//! one [`MatchResult`] per candidate, unmatched results standing in for
//! misses. The orchestrator depends only on this interface — in-database
//! lookups and the out-of-process engine are interchangeable behind it.

use std::io::{Read, Seek, SeekFrom, Write};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::Deserialize;

use crate::backbone::{BackboneSession, BackboneStore};
use crate::error::ResolveError;
use crate::models::{CandidateName, MatchResult, MatchSource, TaxonomicStatus};
use crate::normalize::{canonical_binomial, clean};

/// A cascade stage. Implementations are pure reads against their backing
/// store; failure of a whole batch is reported as an error so the
/// orchestrator can degrade and continue.
pub trait Matcher {
    /// Stage label for logs.
    fn label(&self) -> &'static str;

    /// Resolve a batch. The returned vector has exactly one result per
    /// candidate, in input order.
    fn match_batch(&mut self, batch: &[CandidateName]) -> Result<Vec<MatchResult>, ResolveError>;
}

/// Exact lookup against a candidate: trimmed full name first, then the
/// canonical genus + epithet split.
fn lookup_candidate<S: BackboneStore + ?Sized>(
    store: &S,
    candidate: &CandidateName,
) -> Result<Option<crate::models::BackboneRecord>, ResolveError> {
    let trimmed = clean(&candidate.raw);
    if let Some(record) = store.lookup_exact(&trimmed)? {
        return Ok(Some(record));
    }
    if let Some((genus, epithet)) = canonical_binomial(&trimmed) {
        return store.lookup_by_genus_epithet(&genus, &epithet);
    }
    Ok(None)
}

// ============================================================================
// Exact matcher
// ============================================================================

/// Exact-match stage over any backbone store variant.
pub struct ExactMatcher<S: BackboneStore> {
    store: S,
    source: MatchSource,
    label: &'static str,
}

impl<S: BackboneStore> ExactMatcher<S> {
    pub fn new(store: S, source: MatchSource, label: &'static str) -> Self {
        ExactMatcher {
            store,
            source,
            label,
        }
    }
}

impl<S: BackboneStore> Matcher for ExactMatcher<S> {
    fn label(&self) -> &'static str {
        self.label
    }

    fn match_batch(&mut self, batch: &[CandidateName]) -> Result<Vec<MatchResult>, ResolveError> {
        let mut results = Vec::with_capacity(batch.len());
        for candidate in batch {
            let result = match lookup_candidate(&self.store, candidate)? {
                Some(record) => MatchResult::exact(candidate, &record, self.source),
                None => MatchResult::unmatched(candidate, self.source),
            };
            results.push(result);
        }
        Ok(results)
    }
}

// ============================================================================
// Fuzzy matcher
// ============================================================================

/// Similarity stage over an in-memory session. An exact-equality pass runs
/// before the similarity pass: some fallback sources contain the literal
/// name without needing fuzzy comparison.
pub struct FuzzyMatcher {
    session: Arc<BackboneSession>,
    threshold: f64,
    source: MatchSource,
    label: &'static str,
}

impl FuzzyMatcher {
    pub fn new(
        session: Arc<BackboneSession>,
        threshold: f64,
        source: MatchSource,
        label: &'static str,
    ) -> Self {
        FuzzyMatcher {
            session,
            threshold,
            source,
            label,
        }
    }

    fn match_one(&self, candidate: &CandidateName) -> MatchResult {
        // Exact pass. Errors are impossible against a session store.
        if let Ok(Some(record)) = lookup_candidate(self.session.as_ref(), candidate) {
            return MatchResult::exact(candidate, &record, self.source);
        }

        let trimmed = clean(&candidate.raw);
        let query = canonical_binomial(&trimmed)
            .map(|(genus, epithet)| format!("{} {}", genus, epithet))
            .unwrap_or(trimmed);
        match self.session.fuzzy_best(&query, self.threshold) {
            Some((record, score)) => MatchResult::fuzzy(candidate, record, score, self.source),
            None => MatchResult::unmatched(candidate, self.source),
        }
    }
}

impl Matcher for FuzzyMatcher {
    fn label(&self) -> &'static str {
        self.label
    }

    fn match_batch(&mut self, batch: &[CandidateName]) -> Result<Vec<MatchResult>, ResolveError> {
        // Similarity scoring dominates the batch cost; fan out across it.
        // Pure reads only — stats and registry writes stay on the caller.
        Ok(batch.par_iter().map(|c| self.match_one(c)).collect())
    }
}

// ============================================================================
// External engine matcher
// ============================================================================

/// One JSON record per name on the engine's stdout.
#[derive(Debug, Deserialize)]
struct EngineRecord {
    original: String,
    matched: bool,
    #[serde(default, rename = "scientificName")]
    scientific_name: Option<String>,
    #[serde(default, rename = "taxonID")]
    taxon_id: Option<String>,
    #[serde(default, rename = "taxonomicStatus")]
    taxonomic_status: Option<String>,
    #[serde(default, rename = "acceptedNameUsageID")]
    #[allow(dead_code)]
    accepted_name_usage_id: Option<String>,
    #[serde(default)]
    family: Option<String>,
    #[serde(default)]
    genus: Option<String>,
    #[serde(default, rename = "specificEpithet")]
    #[allow(dead_code)]
    specific_epithet: Option<String>,
    #[serde(default, rename = "Fuzzy")]
    fuzzy: bool,
    #[serde(default, rename = "Fuzzy.dist")]
    fuzzy_dist: Option<f64>,
}

/// Out-of-process matching engine stage. The engine is handed a temp file
/// of newline-delimited names as its last argument and must print one JSON
/// object per line. Covers both the exact and fuzzy primary passes in a
/// single invocation — the `Fuzzy` flag in each record tells them apart.
pub struct EngineMatcher {
    command: Vec<String>,
    timeout: Duration,
}

impl EngineMatcher {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        EngineMatcher { command, timeout }
    }

    fn invoke(&self, batch: &[CandidateName]) -> Result<Vec<EngineRecord>, ResolveError> {
        let program = self
            .command
            .first()
            .ok_or_else(|| ResolveError::MatcherUnavailable("empty engine command".to_string()))?;

        let mut request = tempfile::NamedTempFile::new()?;
        for candidate in batch {
            writeln!(request, "{}", clean(&candidate.raw))?;
        }
        request.flush()?;

        // Replies can exceed the pipe buffer long before the child exits,
        // which would deadlock a polled pipe. Collect stdout in a scratch
        // file instead, mirroring the request side.
        let mut reply = tempfile::tempfile()?;
        let mut child = Command::new(program)
            .args(&self.command[1..])
            .arg(request.path())
            .stdin(Stdio::null())
            .stdout(Stdio::from(reply.try_clone()?))
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                ResolveError::MatcherUnavailable(format!("cannot start engine {}: {}", program, e))
            })?;

        // The engine call is not interruptible mid-batch; poll with a
        // bounded deadline and kill on overrun.
        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait()? {
                Some(status) => break status,
                None if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ResolveError::EngineTimeout {
                        timeout_secs: self.timeout.as_secs(),
                    });
                }
                None => std::thread::sleep(Duration::from_millis(50)),
            }
        };

        if !status.success() {
            return Err(ResolveError::MatcherUnavailable(format!(
                "engine {} exited with {}",
                program, status
            )));
        }

        reply.seek(SeekFrom::Start(0))?;
        let mut output = String::new();
        reply.read_to_string(&mut output)?;

        let mut records = Vec::with_capacity(batch.len());
        for line in output.lines().filter(|l| !l.trim().is_empty()) {
            records.push(serde_json::from_str::<EngineRecord>(line)?);
        }
        Ok(records)
    }
}

impl Matcher for EngineMatcher {
    fn label(&self) -> &'static str {
        "primary-engine"
    }

    fn match_batch(&mut self, batch: &[CandidateName]) -> Result<Vec<MatchResult>, ResolveError> {
        let records = self.invoke(batch)?;
        let mut by_original: FxHashMap<&str, &EngineRecord> = FxHashMap::default();
        for record in &records {
            by_original.entry(record.original.as_str()).or_insert(record);
        }

        let results = batch
            .iter()
            .map(|candidate| {
                let cleaned = clean(&candidate.raw);
                match by_original.get(cleaned.as_str()) {
                    Some(record) if record.matched => engine_result(candidate, record),
                    _ => MatchResult::unmatched(candidate, MatchSource::PrimaryExact),
                }
            })
            .collect();
        Ok(results)
    }
}

/// Convert an engine record into the common result shape. A record claiming
/// a match without a name or identifier violates the result invariant and
/// is treated as unmatched.
fn engine_result(candidate: &CandidateName, record: &EngineRecord) -> MatchResult {
    let (name, id) = match (&record.scientific_name, &record.taxon_id) {
        (Some(name), Some(id)) => (name.clone(), id.clone()),
        _ => return MatchResult::unmatched(candidate, MatchSource::PrimaryExact),
    };

    let source = if record.fuzzy {
        MatchSource::PrimaryFuzzy
    } else {
        MatchSource::PrimaryExact
    };
    MatchResult {
        original: candidate.raw.clone(),
        registry_id: candidate.registry_id,
        matched: true,
        fuzzy: record.fuzzy,
        fuzzy_distance: if record.fuzzy { record.fuzzy_dist } else { None },
        accepted_name: Some(name),
        backbone_id: Some(id),
        status: record.taxonomic_status.as_deref().map(TaxonomicStatus::parse),
        family: record.family.clone(),
        genus: record.genus.clone(),
        source,
    }
}
