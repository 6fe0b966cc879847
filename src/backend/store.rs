use uuid::Uuid;

use crate::error::Result;
use crate::models::{AnnotationFeature, Assembly, RefSeq, RefSeqChunk};

/// A transactional document store holding assemblies, reference sequences,
/// sequence chunks and top-level feature documents.
///
/// Implementations run inside one transaction for the lifetime of the value;
/// [`DocumentStore::checkpoint`] commits what has been written so far and
/// opens a new transaction.
pub trait DocumentStore {
    fn find_assembly(&self, id: Uuid) -> Result<Option<Assembly>>;
    fn find_assembly_by_name(&self, name: &str) -> Result<Option<Assembly>>;
    fn find_assemblies(&self) -> Result<Vec<Assembly>>;
    fn create_assembly(&mut self, assembly: &Assembly) -> Result<()>;
    /// Removes the assembly with its reference sequences, chunks and features.
    fn delete_assembly(&mut self, id: Uuid) -> Result<()>;

    fn find_ref_seq(&self, id: Uuid) -> Result<Option<RefSeq>>;
    fn find_ref_seqs(&self, assembly: Uuid) -> Result<Vec<RefSeq>>;
    fn create_ref_seq(&mut self, ref_seq: &RefSeq) -> Result<()>;
    fn update_ref_seq(&mut self, ref_seq: &RefSeq) -> Result<()>;

    fn create_chunk(&mut self, chunk: &RefSeqChunk) -> Result<()>;
    /// Chunks `first..=last` of a reference sequence, ordered by index.
    fn find_chunks(&self, ref_seq: Uuid, first: u64, last: u64) -> Result<Vec<RefSeqChunk>>;

    /// The top-level feature whose subtree contains `feature_id`.
    fn find_top_level_feature(&self, feature_id: Uuid) -> Result<Option<AnnotationFeature>>;
    /// Top-level features overlapping `[start, end)`, ordered by `min`.
    fn find_features_in_range(
        &self,
        ref_seq: Uuid,
        start: u64,
        end: u64,
    ) -> Result<Vec<AnnotationFeature>>;
    /// Top-level features of an assembly whose type or attribute values
    /// contain `term`, ignoring case.
    fn search_features(&self, assembly: Uuid, term: &str) -> Result<Vec<AnnotationFeature>>;
    fn create_feature(&mut self, feature: &AnnotationFeature) -> Result<()>;
    fn update_feature(&mut self, feature: &AnnotationFeature) -> Result<()>;
    fn delete_feature(&mut self, id: Uuid) -> Result<()>;

    fn checkpoint(&mut self) -> Result<()>;
}
