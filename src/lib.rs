//! Taxonomic name disambiguation against a canonical plant backbone.
//!
//! Resolves raw scientific names from the species registry through a
//! cascade of matching stages (exact, trigram-fuzzy, secondary fallback)
//! and writes the resulting identifiers back, filling only columns that
//! are still empty.

pub mod backbone;
pub mod error;
pub mod matcher;
pub mod models;
pub mod normalize;
pub mod orchestrator;
pub mod progress;
pub mod registry;
pub mod similarity;
