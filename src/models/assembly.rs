use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sequence payloads are stored in fixed-size chunks of this many bases.
pub const DEFAULT_CHUNK_SIZE: u64 = 262_144;

/// A genome build: a named collection of reference sequences.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Assembly {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Free-text annotations attached to the assembly.
    #[serde(default)]
    pub comments: Vec<String>,
    pub user: String,
    pub created_at: DateTime<Utc>,
}

/// A named reference sequence belonging to exactly one [`Assembly`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RefSeq {
    pub id: Uuid,
    pub assembly: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub length: u64,
    /// Alternate names; attaching them never changes identity.
    #[serde(default)]
    pub aliases: Vec<String>,
    pub chunk_size: u64,
}

/// Reference sequence ids are derived from the assembly id and the sequence
/// name, so every backend that replays an assembly creation agrees on them.
pub fn ref_seq_id(assembly: Uuid, name: &str) -> Uuid {
    Uuid::new_v5(&assembly, name.as_bytes())
}

impl RefSeq {
    pub fn new(assembly: Uuid, name: impl Into<String>, length: u64) -> Self {
        let name = name.into();
        Self {
            id: ref_seq_id(assembly, &name),
            assembly,
            name,
            description: None,
            length,
            aliases: Vec::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn matches_name(&self, name: &str) -> bool {
        self.name == name || self.aliases.iter().any(|alias| alias == name)
    }
}

/// One slice of a reference sequence's bases: chunk `n` covers
/// `[n * chunk_size, (n + 1) * chunk_size)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RefSeqChunk {
    pub ref_seq: Uuid,
    pub n: u64,
    pub sequence: String,
}

/// Split a sequence into chunks of `chunk_size` bases.
pub fn chunk_sequence(ref_seq: Uuid, sequence: &str, chunk_size: u64) -> Vec<RefSeqChunk> {
    let size = chunk_size.max(1) as usize;
    sequence
        .as_bytes()
        .chunks(size)
        .enumerate()
        .map(|(n, bytes)| RefSeqChunk {
            ref_seq,
            n: n as u64,
            sequence: String::from_utf8_lossy(bytes).into_owned(),
        })
        .collect()
}

/// Reassemble `[start, end)` from chunks ordered by `n`.
pub fn stitch_sequence(chunks: &[RefSeqChunk], chunk_size: u64, start: u64, end: u64) -> String {
    let mut out = String::new();
    for chunk in chunks {
        let chunk_start = chunk.n * chunk_size;
        let chunk_end = chunk_start + chunk.sequence.len() as u64;
        if chunk_end <= start || chunk_start >= end {
            continue;
        }
        let from = start.saturating_sub(chunk_start) as usize;
        let to = (end.min(chunk_end) - chunk_start) as usize;
        out.push_str(&chunk.sequence[from..to]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_and_stitches_across_boundaries() {
        let id = Uuid::new_v4();
        let chunks = chunk_sequence(id, "ACGTACGTAC", 4);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].sequence, "AC");
        assert_eq!(stitch_sequence(&chunks, 4, 2, 9), "GTACGTA");
        assert_eq!(stitch_sequence(&chunks, 4, 0, 100), "ACGTACGTAC");
    }

    #[test]
    fn ref_seq_ids_are_stable_per_assembly() {
        let assembly = Uuid::new_v4();
        assert_eq!(RefSeq::new(assembly, "ctgA", 10).id, ref_seq_id(assembly, "ctgA"));
        assert_ne!(ref_seq_id(assembly, "ctgA"), ref_seq_id(assembly, "ctgB"));
        assert_ne!(ref_seq_id(assembly, "ctgA"), ref_seq_id(Uuid::new_v4(), "ctgA"));
    }

    #[test]
    fn aliases_match_names() {
        let ref_seq = RefSeq {
            id: Uuid::new_v4(),
            assembly: Uuid::new_v4(),
            name: "ctgA".to_string(),
            description: None,
            length: 10,
            aliases: vec!["chrA".to_string()],
            chunk_size: DEFAULT_CHUNK_SIZE,
        };
        assert!(ref_seq.matches_name("ctgA"));
        assert!(ref_seq.matches_name("chrA"));
        assert!(!ref_seq.matches_name("ctgB"));
    }
}
