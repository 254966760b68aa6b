//! Trigram string similarity for fuzzy name matching.
//!
//! Scores are compatible with the in-database trigram `similarity()` the
//! original matching pipeline relied on: names are folded to lowercase
//! ASCII, split into alphanumeric words, each word padded with two leading
//! spaces and one trailing space, and the score is the Jaccard ratio of the
//! two trigram sets. Distance reported upstream is `1 - score`.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::normalize::fold_key;

/// Default acceptance threshold on the 0-1 similarity scale. Scores exactly
/// at the threshold are accepted.
pub const DEFAULT_FUZZY_THRESHOLD: f64 = 0.70;

type Trigram = [u8; 3];

/// Extract the padded word trigram set of a name.
pub fn trigram_set(s: &str) -> FxHashSet<Trigram> {
    let folded = fold_key(s);
    let mut set = FxHashSet::default();
    for word in folded
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let mut padded = Vec::with_capacity(word.len() + 3);
        padded.extend_from_slice(b"  ");
        padded.extend_from_slice(word.as_bytes());
        padded.push(b' ');
        for w in padded.windows(3) {
            set.insert([w[0], w[1], w[2]]);
        }
    }
    set
}

/// Pairwise trigram similarity (0.0 to 1.0).
pub fn similarity(a: &str, b: &str) -> f64 {
    let ta = trigram_set(a);
    let tb = trigram_set(b);
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let shared = ta.intersection(&tb).count();
    let union = ta.len() + tb.len() - shared;
    shared as f64 / union as f64
}

/// A fuzzy hit: index of the target in insertion order plus its score.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FuzzyHit {
    pub target: u32,
    pub score: f64,
}

/// Inverted trigram index over a set of target names.
///
/// Candidates are scored against every target sharing at least one trigram,
/// which is exactly the set of targets with a non-zero score, so results
/// are identical to a full scan at a fraction of the cost.
#[derive(Debug)]
pub struct TrigramIndex {
    postings: FxHashMap<Trigram, Vec<u32>>,
    /// Trigram set size per target, indexed by insertion order.
    sizes: Vec<u32>,
}

impl TrigramIndex {
    pub fn new() -> Self {
        TrigramIndex {
            postings: FxHashMap::default(),
            sizes: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    /// Add a target name, returning its index.
    pub fn push(&mut self, name: &str) -> u32 {
        let id = self.sizes.len() as u32;
        let set = trigram_set(name);
        self.sizes.push(set.len() as u32);
        for t in set {
            self.postings.entry(t).or_default().push(id);
        }
        id
    }

    /// All targets tied at the maximum similarity to `name`, provided that
    /// maximum meets `threshold`. A score exactly at the threshold is
    /// accepted. The caller applies the deterministic tie-break.
    pub fn best_matches(&self, name: &str, threshold: f64) -> Vec<FuzzyHit> {
        let query = trigram_set(name);
        if query.is_empty() || self.sizes.is_empty() {
            return Vec::new();
        }

        let mut shared: FxHashMap<u32, u32> = FxHashMap::default();
        for t in &query {
            if let Some(ids) = self.postings.get(t) {
                for &id in ids {
                    *shared.entry(id).or_insert(0) += 1;
                }
            }
        }

        let query_len = query.len() as f64;
        let mut best = f64::NEG_INFINITY;
        let mut hits: Vec<FuzzyHit> = Vec::new();
        for (id, count) in shared {
            let union = query_len + self.sizes[id as usize] as f64 - count as f64;
            let score = count as f64 / union;
            if score > best {
                best = score;
                hits.clear();
                hits.push(FuzzyHit { target: id, score });
            } else if score == best {
                hits.push(FuzzyHit { target: id, score });
            }
        }

        if best >= threshold {
            hits
        } else {
            Vec::new()
        }
    }
}

impl Default for TrigramIndex {
    fn default() -> Self {
        Self::new()
    }
}
