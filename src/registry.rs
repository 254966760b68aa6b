//! Species registry access: candidate selection and fill-only updates.

use rusqlite::{params, Connection};

use crate::error::ResolveError;
use crate::models::{CandidateName, MatchResult};

/// Rows still missing a backbone identifier, in deterministic order so that
/// batch boundaries line up across re-runs.
pub fn load_candidates(conn: &Connection) -> Result<Vec<CandidateName>, ResolveError> {
    let mut stmt = conn.prepare(
        "SELECT id, canonical_name FROM species
         WHERE wfo_id IS NULL
         ORDER BY canonical_name, id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(CandidateName {
            registry_id: row.get(0)?,
            raw: row.get(1)?,
        })
    })?;
    let mut candidates = Vec::new();
    for row in rows {
        candidates.push(row?);
    }
    Ok(candidates)
}

/// Write one batch of match results back into the registry.
///
/// Updates are keyed by canonical name rather than row id, so every registry
/// row carrying the same name is enriched at once. Each taxonomic column is
/// filled only when currently NULL; hand-curated values are never clobbered.
/// Unmatched results are skipped. A failure on one record is logged and does
/// not abort the rest of the batch.
pub fn apply(conn: &mut Connection, results: &[MatchResult]) -> Result<usize, ResolveError> {
    let tx = conn.transaction()?;
    let mut updated = 0usize;
    {
        let mut stmt = tx.prepare_cached(
            "UPDATE species SET
                wfo_id = COALESCE(wfo_id, ?2),
                taxonomic_status = COALESCE(taxonomic_status, ?3),
                family = COALESCE(family, ?4),
                genus = COALESCE(genus, ?5),
                updated_at = datetime('now')
             WHERE canonical_name = ?1",
        )?;
        for result in results.iter().filter(|r| r.matched) {
            let status = result.status.map(|s| s.as_str());
            match stmt.execute(params![
                result.original,
                result.backbone_id,
                status,
                result.family,
                result.genus,
            ]) {
                Ok(n) => updated += n,
                Err(e) => {
                    eprintln!("registry update failed for '{}': {}", result.original, e);
                }
            }
        }
    }
    tx.commit()?;
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BackboneRecord, MatchSource, TaxonRank, TaxonomicStatus};

    pub(crate) const REGISTRY_SCHEMA: &str = "
        CREATE TABLE species (
            id INTEGER PRIMARY KEY,
            canonical_name TEXT NOT NULL,
            wfo_id TEXT,
            taxonomic_status TEXT,
            family TEXT,
            genus TEXT,
            updated_at TEXT
        );
    ";

    fn registry_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(REGISTRY_SCHEMA).unwrap();
        conn
    }

    fn record(id: &str, name: &str, genus: &str, family: &str) -> BackboneRecord {
        BackboneRecord {
            backbone_id: id.to_string(),
            scientific_name: name.to_string(),
            genus: genus.to_string(),
            epithet: name.split_whitespace().nth(1).unwrap_or("").to_string(),
            family: family.to_string(),
            status: TaxonomicStatus::Accepted,
            accepted_id: None,
            rank: TaxonRank::Species,
            secondary_id: None,
        }
    }

    #[test]
    fn candidates_are_rows_without_backbone_id() {
        let conn = registry_conn();
        conn.execute_batch(
            "INSERT INTO species (id, canonical_name, wfo_id) VALUES
                (1, 'Vicia faba', NULL),
                (2, 'Quercus robur', 'wfo-0000292858'),
                (3, 'Abies alba', NULL);",
        )
        .unwrap();

        let candidates = load_candidates(&conn).unwrap();
        assert_eq!(candidates.len(), 2);
        // Ordered by name, so re-runs see identical batches.
        assert_eq!(candidates[0].raw, "Abies alba");
        assert_eq!(candidates[1].raw, "Vicia faba");
    }

    #[test]
    fn apply_fills_only_empty_columns() {
        let mut conn = registry_conn();
        conn.execute_batch(
            "INSERT INTO species (id, canonical_name, wfo_id, family) VALUES
                (1, 'Vicia faba', NULL, 'Fabaceae');",
        )
        .unwrap();

        let candidate = CandidateName {
            registry_id: 1,
            raw: "Vicia faba".to_string(),
        };
        let result = MatchResult::exact(
            &candidate,
            &record("wfo-0000213248", "Vicia faba", "Vicia", "Leguminosae"),
            MatchSource::PrimaryExact,
        );
        let updated = apply(&mut conn, &[result]).unwrap();
        assert_eq!(updated, 1);

        let (wfo_id, family): (String, String) = conn
            .query_row(
                "SELECT wfo_id, family FROM species WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(wfo_id, "wfo-0000213248");
        // The curated family survives the conflicting backbone value.
        assert_eq!(family, "Fabaceae");
    }

    #[test]
    fn apply_updates_all_rows_sharing_a_name() {
        let mut conn = registry_conn();
        conn.execute_batch(
            "INSERT INTO species (id, canonical_name) VALUES
                (1, 'Vicia faba'),
                (2, 'Vicia faba');",
        )
        .unwrap();

        let candidate = CandidateName {
            registry_id: 1,
            raw: "Vicia faba".to_string(),
        };
        let result = MatchResult::exact(
            &candidate,
            &record("wfo-0000213248", "Vicia faba", "Vicia", "Fabaceae"),
            MatchSource::PrimaryExact,
        );
        let updated = apply(&mut conn, &[result]).unwrap();
        assert_eq!(updated, 2);
    }

    #[test]
    fn apply_skips_unmatched_results() {
        let mut conn = registry_conn();
        conn.execute_batch("INSERT INTO species (id, canonical_name) VALUES (1, 'Mystery plant');")
            .unwrap();

        let candidate = CandidateName {
            registry_id: 1,
            raw: "Mystery plant".to_string(),
        };
        let result = MatchResult::unmatched(&candidate, MatchSource::FallbackFuzzy);
        let updated = apply(&mut conn, &[result]).unwrap();
        assert_eq!(updated, 0);

        let wfo_id: Option<String> = conn
            .query_row("SELECT wfo_id FROM species WHERE id = 1", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert!(wfo_id.is_none());
    }

    #[test]
    fn second_run_finds_no_candidates_for_applied_rows() {
        let mut conn = registry_conn();
        conn.execute_batch("INSERT INTO species (id, canonical_name) VALUES (1, 'Vicia faba');")
            .unwrap();

        let candidates = load_candidates(&conn).unwrap();
        assert_eq!(candidates.len(), 1);

        let result = MatchResult::exact(
            &candidates[0],
            &record("wfo-0000213248", "Vicia faba", "Vicia", "Fabaceae"),
            MatchSource::PrimaryExact,
        );
        apply(&mut conn, &[result]).unwrap();

        assert!(load_candidates(&conn).unwrap().is_empty());
    }
}
