//! Readers for uploaded sequence and annotation files.

mod fasta;
mod gff3;

pub use fasta::{read_fasta, FastaSequence};
pub use gff3::{read_gff3, write_gff3, Gff3Document, SequenceRegion};
