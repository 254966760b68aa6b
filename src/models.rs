//! Core data models for taxonomic disambiguation.
//!
//! This module contains the struct definitions and enums shared by the
//! backbone store, the matchers, the orchestrator, and the registry updater.

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Candidate Names
// ============================================================================

/// A raw scientific name awaiting resolution, pulled from the species
/// registry where no backbone identifier has been assigned yet.
#[derive(Clone, Debug)]
pub struct CandidateName {
    /// Originating registry row id.
    pub registry_id: i64,
    /// Raw name text as collected from the source (may carry authorship,
    /// infraspecific markers, stray whitespace).
    pub raw: String,
}

// ============================================================================
// Backbone Records
// ============================================================================

/// Taxonomic status of a backbone record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaxonomicStatus {
    Accepted,
    Synonym,
    Unresolved,
}

impl TaxonomicStatus {
    /// Lenient parse from backbone status strings. The reference data uses
    /// several synonym variants ("homotypic synonym", "heterotypic synonym")
    /// which all collapse to `Synonym`.
    pub fn parse(s: &str) -> Self {
        let lower = s.trim().to_lowercase();
        if lower == "accepted" {
            TaxonomicStatus::Accepted
        } else if lower.contains("synonym") {
            TaxonomicStatus::Synonym
        } else {
            TaxonomicStatus::Unresolved
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaxonomicStatus::Accepted => "accepted",
            TaxonomicStatus::Synonym => "synonym",
            TaxonomicStatus::Unresolved => "unresolved",
        }
    }
}

impl fmt::Display for TaxonomicStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Taxonomic rank of a backbone record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaxonRank {
    Species,
    Subspecies,
    Variety,
    Form,
    Genus,
    Other,
}

impl TaxonRank {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "species" => TaxonRank::Species,
            "subspecies" | "subsp." | "ssp." => TaxonRank::Subspecies,
            "variety" | "var." => TaxonRank::Variety,
            "form" | "f." => TaxonRank::Form,
            "genus" => TaxonRank::Genus,
            _ => TaxonRank::Other,
        }
    }
}

/// One row of the canonical taxonomic reference. Immutable for the duration
/// of a disambiguation run; owned by the external backbone import process.
#[derive(Clone, Debug)]
pub struct BackboneRecord {
    /// Opaque canonical key (WFO taxon id in the source data).
    pub backbone_id: String,
    /// Full scientific name, with or without authorship.
    pub scientific_name: String,
    /// Normalized genus token.
    pub genus: String,
    /// Normalized specific epithet token.
    pub epithet: String,
    pub family: String,
    pub status: TaxonomicStatus,
    /// Backbone id of the accepted name when `status` is non-accepted.
    pub accepted_id: Option<String>,
    pub rank: TaxonRank,
    /// Cross-reference key into the secondary nomenclator (GBIF usage key).
    /// Fuzzy matching only targets records where this is present.
    pub secondary_id: Option<i64>,
}

impl BackboneRecord {
    /// The name a match resolves to: the record's own scientific name.
    /// Synonym redirection to the accepted record happens via `accepted_id`
    /// downstream and is not the matcher's concern.
    pub fn accepted_name(&self) -> &str {
        &self.scientific_name
    }
}

// ============================================================================
// Match Results
// ============================================================================

/// Which cascade stage produced a match result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchSource {
    PrimaryExact,
    PrimaryFuzzy,
    FallbackExact,
    FallbackFuzzy,
}

impl MatchSource {
    pub fn is_fallback(&self) -> bool {
        matches!(self, MatchSource::FallbackExact | MatchSource::FallbackFuzzy)
    }
}

/// Outcome of attempting to resolve one candidate against one matcher.
///
/// Invariants: if `matched` is false all resolution fields are `None`;
/// if `matched` is true both `accepted_name` and `backbone_id` are present.
#[derive(Clone, Debug, Serialize)]
pub struct MatchResult {
    pub original: String,
    pub registry_id: i64,
    pub matched: bool,
    /// True when resolved via similarity rather than exact equality.
    pub fuzzy: bool,
    /// `1 - similarity`, present only when `fuzzy` is true.
    pub fuzzy_distance: Option<f64>,
    pub accepted_name: Option<String>,
    pub backbone_id: Option<String>,
    pub status: Option<TaxonomicStatus>,
    pub family: Option<String>,
    pub genus: Option<String>,
    pub source: MatchSource,
}

impl MatchResult {
    /// An unmatched result for `candidate` at cascade stage `source`.
    pub fn unmatched(candidate: &CandidateName, source: MatchSource) -> Self {
        MatchResult {
            original: candidate.raw.clone(),
            registry_id: candidate.registry_id,
            matched: false,
            fuzzy: false,
            fuzzy_distance: None,
            accepted_name: None,
            backbone_id: None,
            status: None,
            family: None,
            genus: None,
            source,
        }
    }

    /// An exact match of `candidate` against `record`.
    pub fn exact(candidate: &CandidateName, record: &BackboneRecord, source: MatchSource) -> Self {
        MatchResult {
            original: candidate.raw.clone(),
            registry_id: candidate.registry_id,
            matched: true,
            fuzzy: false,
            fuzzy_distance: None,
            accepted_name: Some(record.accepted_name().to_string()),
            backbone_id: Some(record.backbone_id.clone()),
            status: Some(record.status),
            family: Some(record.family.clone()),
            genus: Some(record.genus.clone()),
            source,
        }
    }

    /// A similarity match of `candidate` against `record` with score
    /// `similarity` on a 0-1 scale.
    pub fn fuzzy(
        candidate: &CandidateName,
        record: &BackboneRecord,
        similarity: f64,
        source: MatchSource,
    ) -> Self {
        MatchResult {
            original: candidate.raw.clone(),
            registry_id: candidate.registry_id,
            matched: true,
            fuzzy: true,
            fuzzy_distance: Some(1.0 - similarity),
            accepted_name: Some(record.accepted_name().to_string()),
            backbone_id: Some(record.backbone_id.clone()),
            status: Some(record.status),
            family: Some(record.family.clone()),
            genus: Some(record.genus.clone()),
            source,
        }
    }
}

// ============================================================================
// Run Statistics
// ============================================================================

/// Running counters for one orchestration run. Created at run start,
/// incremented throughout, returned to the caller at run end.
///
/// `errors` counts matcher-level failures (engine unavailable, timeout) and
/// may double-count against `unmatched` when a whole batch degrades.
#[derive(Default, Debug, Clone, Serialize)]
pub struct DisambiguationStats {
    /// Candidates seen across all batches.
    pub total: usize,
    /// Matched exactly by the primary backbone.
    pub matched_exact: usize,
    /// Matched fuzzily by the primary backbone.
    pub matched_fuzzy: usize,
    /// Matched (exactly or fuzzily) by the secondary fallback reference.
    pub matched_fallback: usize,
    /// Exhausted the cascade without a match.
    pub unmatched: usize,
    /// Matcher-level errors.
    pub errors: usize,
    /// Registry rows actually written.
    pub updated_rows: usize,
    /// Batches processed.
    pub batches: usize,
    pub elapsed_seconds: f64,
}

impl DisambiguationStats {
    /// Record the terminal outcome of one candidate.
    pub fn record(&mut self, result: &MatchResult) {
        if !result.matched {
            self.unmatched += 1;
        } else if result.source.is_fallback() {
            self.matched_fallback += 1;
        } else if result.fuzzy {
            self.matched_fuzzy += 1;
        } else {
            self.matched_exact += 1;
        }
    }

    /// Match rate as a percentage of all candidates.
    pub fn match_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            let matched = self.matched_exact + self.matched_fuzzy + self.matched_fallback;
            100.0 * matched as f64 / self.total as f64
        }
    }

    /// Log stats to stderr in JSON format, tagged with a phase label.
    pub fn log_phase(&self, phase: &str) {
        if let Ok(json) = serde_json::to_string_pretty(self) {
            eprintln!("[STATS:{}]\n{}", phase, json);
        }
    }

    /// Write stats to a JSON file.
    pub fn write_to_file(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Fixed human-readable summary for stdout.
    pub fn summary(&self) -> String {
        format!(
            "total: {}\nmatched-exact: {}\nmatched-fuzzy: {}\nfallback-matched: {}\nunmatched: {}\nerrors: {}",
            self.total,
            self.matched_exact,
            self.matched_fuzzy,
            self.matched_fallback,
            self.unmatched,
            self.errors,
        )
    }
}

// ============================================================================
// Unmatched-Name Report
// ============================================================================

/// Entry for the unmatched-name report (`--unmatched-out`). One entry per
/// candidate that exhausted every cascade stage.
#[derive(Clone, Debug, Serialize)]
pub struct UnmatchedEntry {
    pub registry_id: i64,
    pub name: String,
}
