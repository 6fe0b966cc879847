use std::io::Read;

use bio::io::fasta;

use crate::error::{ChangeError, Result};

/// One record of a FASTA file.
#[derive(Debug, Clone, PartialEq)]
pub struct FastaSequence {
    pub name: String,
    pub description: Option<String>,
    pub sequence: String,
}

pub fn read_fasta(reader: impl Read) -> Result<Vec<FastaSequence>> {
    let mut sequences = Vec::new();
    for (index, record) in fasta::Reader::new(reader).records().enumerate() {
        let record = record.map_err(|e| ChangeError::Parse {
            format: "FASTA",
            line: index + 1,
            message: e.to_string(),
        })?;
        record.check().map_err(|message| ChangeError::Parse {
            format: "FASTA",
            line: index + 1,
            message: message.to_string(),
        })?;
        sequences.push(FastaSequence {
            name: record.id().to_string(),
            description: record.desc().map(str::to_string),
            sequence: String::from_utf8_lossy(record.seq()).into_owned(),
        });
    }
    if sequences.is_empty() {
        return Err(ChangeError::Parse {
            format: "FASTA",
            line: 1,
            message: "no sequences found".to_string(),
        });
    }
    Ok(sequences)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_multi_line_records() {
        let input = b">ctgA first contig\nACGT\nAC\n>ctgB\nTTTT\n";
        let sequences = read_fasta(&input[..]).unwrap();
        assert_eq!(sequences.len(), 2);
        assert_eq!(sequences[0].name, "ctgA");
        assert_eq!(sequences[0].description.as_deref(), Some("first contig"));
        assert_eq!(sequences[0].sequence, "ACGTAC");
        assert_eq!(sequences[1].sequence, "TTTT");
    }

    #[test]
    fn empty_input_is_an_error() {
        assert!(matches!(read_fasta(&b""[..]), Err(ChangeError::Parse { .. })));
    }
}
