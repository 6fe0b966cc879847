//! Domain models for the annotation store.
//!
//! # Core Concepts
//!
//! - [`Assembly`]: a genome build, owning a set of reference sequences.
//! - [`RefSeq`]: a named reference sequence; bases live in [`RefSeqChunk`]s.
//! - [`AnnotationFeature`]: a node of the annotation hierarchy in nested form,
//!   positioned by a half-open `[min, max)` interval on its reference sequence.
//! - [`ChangeRecord`]: append-only log of every accepted change, used for audit
//!   and undo.
//!
//! None of these are mutated directly; every write goes through a
//! [`crate::changes::Change`] executed against a backend.

mod assembly;
mod change_log;
mod feature;

pub use assembly::*;
pub use change_log::*;
pub use feature::*;
