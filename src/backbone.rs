//! Reference backbone store.
//!
//! Two read-only variants over the canonical taxonomic reference:
//! [`BackboneSession`], which loads the whole table once per run into
//! in-memory indexes (the default for bulk matching), and [`SqlBackbone`],
//! which issues one query per candidate for memory-constrained runs. Both
//! expose the same lookups through [`BackboneStore`].

use rusqlite::{Connection, OptionalExtension, Row};
use rustc_hash::FxHashMap;

use crate::error::ResolveError;
use crate::models::{BackboneRecord, TaxonRank, TaxonomicStatus};
use crate::normalize::{canonical_binomial, fold_key};
use crate::progress;
use crate::similarity::TrigramIndex;

const BACKBONE_COLUMNS: &str = "wfo_id, scientific_name, genus, specific_epithet, family, \
     taxonomic_status, accepted_name_usage_id, taxon_rank, gbif_id";

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<BackboneRecord> {
    let status: String = row.get(5)?;
    let rank: String = row.get(7)?;
    Ok(BackboneRecord {
        backbone_id: row.get(0)?,
        scientific_name: row.get(1)?,
        genus: row.get(2)?,
        epithet: row.get(3)?,
        family: row.get(4)?,
        status: TaxonomicStatus::parse(&status),
        accepted_id: row.get(6)?,
        rank: TaxonRank::parse(&rank),
        secondary_id: row.get(8)?,
    })
}

/// Uniform read interface over a backbone variant. Lookups are pure reads;
/// the session variant cannot fail after construction, the SQL variant can
/// surface per-query errors.
pub trait BackboneStore {
    /// Case-sensitive exact match on the full scientific name.
    fn lookup_exact(&self, name: &str) -> Result<Option<BackboneRecord>, ResolveError>;

    /// Match on the two canonical tokens; tolerant of authorship suffixes
    /// that make full-string matching brittle.
    fn lookup_by_genus_epithet(
        &self,
        genus: &str,
        epithet: &str,
    ) -> Result<Option<BackboneRecord>, ResolveError>;
}

// ============================================================================
// In-memory session
// ============================================================================

/// Bulk-indexed backbone loaded once per run and shared by every matcher
/// invocation. Reload semantics are explicit: build a new session.
#[derive(Debug)]
pub struct BackboneSession {
    records: Vec<BackboneRecord>,
    by_name: FxHashMap<String, u32>,
    by_binomial: FxHashMap<(String, String), u32>,
    /// Trigram index over fuzzy-eligible records (non-null secondary id).
    fuzzy_index: TrigramIndex,
    /// Maps fuzzy index slots back to `records` positions.
    fuzzy_targets: Vec<u32>,
}

impl BackboneSession {
    /// Load the `backbone` table. An absent or empty table is the fatal
    /// run precondition.
    pub fn load(conn: &Connection) -> Result<Self, ResolveError> {
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM backbone", [], |row| row.get(0))
            .map_err(|e| ResolveError::BackboneUnavailable(e.to_string()))?;
        if count == 0 {
            return Err(ResolveError::BackboneUnavailable(
                "backbone table has no records".to_string(),
            ));
        }

        let pb = progress::phase_bar("Loading backbone", count as u64);

        let sql = format!(
            "SELECT {} FROM backbone ORDER BY wfo_id",
            BACKBONE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;

        let mut session = BackboneSession {
            records: Vec::with_capacity(count as usize),
            by_name: FxHashMap::default(),
            by_binomial: FxHashMap::default(),
            fuzzy_index: TrigramIndex::new(),
            fuzzy_targets: Vec::new(),
        };

        while let Some(row) = rows.next()? {
            session.insert(record_from_row(row)?);
            pb.inc(1);
        }

        progress::finish_phase(
            &pb,
            format!("Loaded {} backbone records", session.records.len()),
        );
        Ok(session)
    }

    /// Build a session from the `resolved_names` fallback table in the
    /// registry database: previously curated name-to-identity mappings.
    /// Returns `None` when the table is absent or empty — the fallback
    /// stages are then skipped, which is not fatal.
    pub fn load_fallback(conn: &Connection) -> Option<Self> {
        let mut stmt = conn
            .prepare(
                "SELECT name, wfo_id, taxonomic_status, family, genus
                 FROM resolved_names WHERE wfo_id IS NOT NULL ORDER BY wfo_id",
            )
            .ok()?;
        let mut rows = stmt.query([]).ok()?;

        let mut session = BackboneSession {
            records: Vec::new(),
            by_name: FxHashMap::default(),
            by_binomial: FxHashMap::default(),
            fuzzy_index: TrigramIndex::new(),
            fuzzy_targets: Vec::new(),
        };

        while let Ok(Some(row)) = rows.next() {
            let name: String = row.get(0).ok()?;
            let status: Option<String> = row.get(2).ok()?;
            let (genus, epithet) = canonical_binomial(&name).unwrap_or_default();
            session.insert(BackboneRecord {
                backbone_id: row.get(1).ok()?,
                scientific_name: name,
                genus: row
                    .get::<_, Option<String>>(4)
                    .ok()?
                    .unwrap_or(genus),
                epithet,
                family: row
                    .get::<_, Option<String>>(3)
                    .ok()?
                    .unwrap_or_default(),
                status: status
                    .as_deref()
                    .map(TaxonomicStatus::parse)
                    .unwrap_or(TaxonomicStatus::Unresolved),
                accepted_id: None,
                rank: TaxonRank::Other,
                // Curated rows are always fuzzy-eligible.
                secondary_id: Some(0),
            });
        }

        if session.records.is_empty() {
            None
        } else {
            Some(session)
        }
    }

    fn insert(&mut self, record: BackboneRecord) {
        let idx = self.records.len() as u32;

        // First record wins for duplicate names; load order is fixed by
        // the ORDER BY, so re-runs see the same winner.
        self.by_name
            .entry(record.scientific_name.clone())
            .or_insert(idx);
        if !record.genus.is_empty() && !record.epithet.is_empty() {
            self.by_binomial
                .entry((record.genus.to_lowercase(), record.epithet.to_lowercase()))
                .or_insert(idx);
        }
        if record.secondary_id.is_some() {
            self.fuzzy_index.push(&record.scientific_name);
            self.fuzzy_targets.push(idx);
        }

        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The highest-similarity fuzzy-eligible record at or above `threshold`.
    ///
    /// Tie-break at equal score is deterministic: lower edit distance to
    /// the candidate first, then lowest backbone identifier.
    pub fn fuzzy_best(&self, name: &str, threshold: f64) -> Option<(&BackboneRecord, f64)> {
        let hits = self.fuzzy_index.best_matches(name, threshold);
        if hits.is_empty() {
            return None;
        }
        let score = hits[0].score;
        let folded = fold_key(name);
        let best = hits
            .into_iter()
            .map(|hit| &self.records[self.fuzzy_targets[hit.target as usize] as usize])
            .min_by_key(|record| {
                (
                    strsim::levenshtein(&folded, &fold_key(&record.scientific_name)),
                    record.backbone_id.clone(),
                )
            })?;
        Some((best, score))
    }
}

impl BackboneStore for BackboneSession {
    fn lookup_exact(&self, name: &str) -> Result<Option<BackboneRecord>, ResolveError> {
        Ok(self
            .by_name
            .get(name)
            .map(|&idx| self.records[idx as usize].clone()))
    }

    fn lookup_by_genus_epithet(
        &self,
        genus: &str,
        epithet: &str,
    ) -> Result<Option<BackboneRecord>, ResolveError> {
        Ok(self
            .by_binomial
            .get(&(genus.to_lowercase(), epithet.to_lowercase()))
            .map(|&idx| self.records[idx as usize].clone()))
    }
}

// A session is shared between an exact stage and a fuzzy stage.
impl<S: BackboneStore> BackboneStore for std::sync::Arc<S> {
    fn lookup_exact(&self, name: &str) -> Result<Option<BackboneRecord>, ResolveError> {
        self.as_ref().lookup_exact(name)
    }

    fn lookup_by_genus_epithet(
        &self,
        genus: &str,
        epithet: &str,
    ) -> Result<Option<BackboneRecord>, ResolveError> {
        self.as_ref().lookup_by_genus_epithet(genus, epithet)
    }
}

// ============================================================================
// Query-per-candidate variant
// ============================================================================

/// Backbone variant that queries the table per candidate. Acceptable for
/// small batches or memory-constrained hosts.
#[derive(Debug)]
pub struct SqlBackbone {
    conn: Connection,
}

impl SqlBackbone {
    /// Wrap an open backbone database, verifying the fatal precondition
    /// up front so the orchestrator can refuse to start.
    pub fn open(conn: Connection) -> Result<Self, ResolveError> {
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM backbone", [], |row| row.get(0))
            .map_err(|e| ResolveError::BackboneUnavailable(e.to_string()))?;
        if count == 0 {
            return Err(ResolveError::BackboneUnavailable(
                "backbone table has no records".to_string(),
            ));
        }
        Ok(SqlBackbone { conn })
    }
}

impl BackboneStore for SqlBackbone {
    fn lookup_exact(&self, name: &str) -> Result<Option<BackboneRecord>, ResolveError> {
        let sql = format!(
            "SELECT {} FROM backbone WHERE scientific_name = ?1 ORDER BY wfo_id LIMIT 1",
            BACKBONE_COLUMNS
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        Ok(stmt.query_row([name], record_from_row).optional()?)
    }

    fn lookup_by_genus_epithet(
        &self,
        genus: &str,
        epithet: &str,
    ) -> Result<Option<BackboneRecord>, ResolveError> {
        let sql = format!(
            "SELECT {} FROM backbone
             WHERE LOWER(genus) = LOWER(?1) AND LOWER(specific_epithet) = LOWER(?2)
             ORDER BY wfo_id LIMIT 1",
            BACKBONE_COLUMNS
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        Ok(stmt.query_row([genus, epithet], record_from_row).optional()?)
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use rusqlite::{params, Connection};

    pub const BACKBONE_SCHEMA: &str = "CREATE TABLE backbone (
        wfo_id TEXT PRIMARY KEY,
        scientific_name TEXT NOT NULL,
        genus TEXT NOT NULL,
        specific_epithet TEXT NOT NULL,
        family TEXT NOT NULL,
        taxonomic_status TEXT NOT NULL,
        accepted_name_usage_id TEXT,
        taxon_rank TEXT NOT NULL,
        gbif_id INTEGER
    )";

    #[allow(clippy::too_many_arguments)]
    pub fn insert_backbone_row(
        conn: &Connection,
        wfo_id: &str,
        scientific_name: &str,
        genus: &str,
        epithet: &str,
        family: &str,
        status: &str,
        gbif_id: Option<i64>,
    ) {
        conn.execute(
            "INSERT INTO backbone (wfo_id, scientific_name, genus, specific_epithet,
                family, taxonomic_status, accepted_name_usage_id, taxon_rank, gbif_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, 'species', ?7)",
            params![wfo_id, scientific_name, genus, epithet, family, status, gbif_id],
        )
        .unwrap();
    }

    pub fn backbone_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute(BACKBONE_SCHEMA, []).unwrap();
        conn
    }
}
