//! Scientific-name normalization.
//!
//! Raw names arrive from crawlers with authorship strings, infraspecific
//! rank markers, hybrid signs, cultivar quotes and stray whitespace. The
//! matchers compare either the trimmed full string or the canonical
//! genus + epithet binomial derived here.

use any_ascii::any_ascii;
use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

// ============================================================================
// REGEX PATTERNS
// ============================================================================

/// Cultivar names in single quotes: "Rosa 'Peace'" → "Rosa".
static CULTIVAR_QUOTES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*'[^']*'\s*").unwrap());

/// Uncertainty qualifiers that precede the epithet: "Quercus aff. robur",
/// "Salvia cf. officinalis". The qualifier token is dropped, the epithet kept.
static UNCERTAINTY_QUALIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s+(?:aff|cf)\.?\s+").unwrap());

/// Infraspecific rank markers; everything from the marker onward is ignored
/// when deriving the canonical binomial.
static RANK_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\s+(?:var|subvar|subsp|ssp|subf|f|forma|cv)\.?\s+.*$").unwrap()
});

/// Any whitespace run, tabs and newlines included, collapses to one space.
static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

/// Check if a character is a Unicode combining mark (diacritical mark).
fn is_combining_mark(c: char) -> bool {
    matches!(c as u32, 0x0300..=0x036F | 0x1AB0..=0x1AFF | 0x1DC0..=0x1DFF | 0xFE20..=0xFE2F)
}

/// Fold text to lowercase ASCII: NFKD decomposition, combining marks
/// removed, then transliteration of anything left (stray ligatures flatten
/// out). The hybrid sign `×` is mapped to `x` up front — transliteration
/// would turn it into `*`, splitting trigram keys for hybrid names.
pub fn fold_key(s: &str) -> String {
    let stripped: String = s
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .map(|c| if c == '×' { 'x' } else { c })
        .collect();
    any_ascii(&stripped).to_lowercase()
}

/// Trim and collapse internal whitespace. Exact backbone lookups run on
/// this form of the raw name.
pub fn clean(raw: &str) -> String {
    WHITESPACE_RUN.replace_all(raw.trim(), " ").to_string()
}

/// A token is a plausible specific epithet when it is purely alphabetic
/// (hyphens allowed, e.g. "uva-ursi"). Authorship abbreviations carry dots
/// or parentheses ("L.", "(Bertol.)") and are rejected.
fn is_epithet_token(token: &str) -> bool {
    !token.is_empty() && token.chars().all(|c| c.is_alphabetic() || c == '-')
}

/// A standalone hybrid marker between genus and epithet: "Citrus × aurantium",
/// sometimes typed as a bare "x".
fn is_hybrid_marker(token: &str) -> bool {
    token == "×" || token == "x" || token == "X"
}

// ============================================================================
// CANONICAL BINOMIAL
// ============================================================================

/// Derive the canonical (genus, epithet) pair from a raw name, stripping
/// authorship, infraspecific parts, hybrid signs, qualifiers and cultivar
/// quotes. Returns `None` for genus-only or unparseable names.
///
/// "Araucaria angustifolia (Bertol.) Kuntze" → ("Araucaria", "angustifolia")
pub fn canonical_binomial(raw: &str) -> Option<(String, String)> {
    let mut name = clean(raw);
    name = CULTIVAR_QUOTES.replace_all(&name, " ").to_string();
    name = UNCERTAINTY_QUALIFIER.replace_all(&name, " ").to_string();
    name = RANK_MARKER.replace(&name, "").to_string();
    name = clean(&name);

    let mut tokens = name.split_whitespace().filter(|t| !is_hybrid_marker(t));

    let genus_raw = tokens.next()?;
    if !genus_raw.chars().next()?.is_alphabetic() {
        return None;
    }
    // Strict two-token split: the token right after the genus must look like
    // an epithet, otherwise this is a genus-only or authorship-first name.
    let epithet_raw = tokens.next().filter(|t| is_epithet_token(t))?;

    // Title-case the genus, lowercase the epithet. Epithets are compared
    // case-insensitively throughout.
    let mut genus_chars = genus_raw.chars();
    let genus = match genus_chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + &genus_chars.as_str().to_lowercase(),
        None => return None,
    };
    let epithet = epithet_raw.to_lowercase();

    Some((genus, epithet))
}

/// Canonical two-token form, "Genus epithet", or `None` when no epithet can
/// be derived.
pub fn canonical_name(raw: &str) -> Option<String> {
    canonical_binomial(raw).map(|(genus, epithet)| format!("{} {}", genus, epithet))
}
