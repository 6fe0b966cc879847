//! A GFF3 document held in memory as feature trees.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use indexmap::IndexMap;
use uuid::Uuid;

use super::FeatureTarget;
use crate::error::{ChangeError, Result};
use crate::models::{ref_seq_id, AnnotationFeature, Assembly, RefSeq};
use crate::parse::{read_gff3, write_gff3, SequenceRegion};
use crate::tree::FeatureTree;

#[derive(Debug, Clone)]
pub struct FlatFileStore {
    pub assembly: Assembly,
    ref_seqs: IndexMap<Uuid, RefSeq>,
    features: IndexMap<Uuid, FeatureTree>,
}

impl FlatFileStore {
    pub fn new(assembly: Assembly) -> Self {
        Self {
            assembly,
            ref_seqs: IndexMap::new(),
            features: IndexMap::new(),
        }
    }

    /// Parse a GFF3 document. Sequence regions become reference sequences and
    /// every feature must sit on one of them.
    pub fn from_gff3(assembly: Assembly, reader: impl Read) -> Result<Self> {
        let assembly_id = assembly.id;
        let mut store = Self::new(assembly);
        let document = read_gff3(BufReader::new(reader), |name| Ok(ref_seq_id(assembly_id, name)))?;
        for region in &document.sequence_regions {
            store.add_ref_seq(RefSeq::new(assembly_id, region.name.clone(), region.length));
        }
        for feature in &document.features {
            if !store.ref_seqs.contains_key(&feature.ref_seq) {
                return Err(ChangeError::RefSeqNotFound(feature.ref_seq.to_string()));
            }
            store.add_top_level(feature)?;
        }
        Ok(store)
    }

    pub fn open(assembly: Assembly, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let store = Self::from_gff3(assembly, file)?;
        tracing::debug!(
            path = %path.display(),
            features = store.features.len(),
            "loaded flat file"
        );
        Ok(store)
    }

    pub fn ref_seq(&self, id: Uuid) -> Option<&RefSeq> {
        self.ref_seqs.get(&id)
    }

    pub fn add_ref_seq(&mut self, ref_seq: RefSeq) {
        self.ref_seqs.insert(ref_seq.id, ref_seq);
    }

    pub fn ref_seqs(&self) -> impl Iterator<Item = &RefSeq> {
        self.ref_seqs.values()
    }

    pub fn features(&self) -> Vec<AnnotationFeature> {
        self.features.values().map(FeatureTree::to_feature).collect()
    }

    pub fn feature(&self, id: Uuid) -> Option<AnnotationFeature> {
        self.features
            .values()
            .find_map(|tree| tree.find(id).map(|node| tree.subtree(node)))
    }

    /// Top-level features of `ref_seq` overlapping `[start, end)`, ordered by `min`.
    pub fn features_in_range(&self, ref_seq: Uuid, start: u64, end: u64) -> Vec<AnnotationFeature> {
        let mut found: Vec<AnnotationFeature> = self
            .features
            .values()
            .filter(|tree| tree.ref_seq() == ref_seq)
            .filter(|tree| {
                let root = tree.node(tree.root());
                root.min < end && root.max > start
            })
            .map(FeatureTree::to_feature)
            .collect();
        found.sort_by_key(|f| f.min);
        found
    }

    /// Top-level features whose type or any attribute value within their
    /// subtree contains `term`, ignoring case.
    pub fn search(&self, term: &str) -> Vec<AnnotationFeature> {
        let term = term.to_lowercase();
        self.features
            .values()
            .filter(|tree| {
                tree.iter().any(|node| {
                    let node = tree.node(node);
                    node.feature_type.to_lowercase().contains(&term)
                        || node
                            .attributes
                            .values()
                            .flatten()
                            .any(|value| value.to_lowercase().contains(&term))
                })
            })
            .map(FeatureTree::to_feature)
            .collect()
    }

    pub fn write_gff3(&self, writer: impl Write) -> Result<()> {
        let regions: Vec<SequenceRegion> = self
            .ref_seqs
            .values()
            .map(|r| SequenceRegion {
                name: r.name.clone(),
                length: r.length,
            })
            .collect();
        write_gff3(writer, &regions, &self.features(), |id| {
            self.ref_seqs
                .get(&id)
                .map(|r| r.name.clone())
                .unwrap_or_else(|| id.to_string())
        })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = File::create(path.as_ref())?;
        self.write_gff3(BufWriter::new(file))
    }
}

impl FeatureTarget for FlatFileStore {
    fn backend_name(&self) -> &'static str {
        "flat file"
    }

    fn tree_containing(&mut self, feature_id: Uuid) -> Result<Option<&mut FeatureTree>> {
        Ok(self.features.values_mut().find(|tree| tree.contains(feature_id)))
    }

    fn add_top_level(&mut self, feature: &AnnotationFeature) -> Result<()> {
        if let Some(existing) = feature
            .all_ids()
            .into_iter()
            .find(|id| self.features.values().any(|tree| tree.contains(*id)))
        {
            return Err(ChangeError::AlreadyExists(format!("feature {}", existing)));
        }
        let tree = FeatureTree::from_feature(feature);
        tree.validate()?;
        self.features.insert(feature.id, tree);
        Ok(())
    }

    fn remove_top_level(&mut self, feature_id: Uuid) -> Result<AnnotationFeature> {
        self.features
            .shift_remove(&feature_id)
            .map(|tree| tree.to_feature())
            .ok_or(ChangeError::FeatureNotFound(feature_id))
    }

    fn mark_modified(&mut self, _top_level_id: Uuid) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::changes::{Change, StrandChange, StrandChangeDetails};
    use crate::models::Strand;
    use pretty_assertions::assert_eq;

    fn assembly() -> Assembly {
        Assembly {
            id: Uuid::new_v4(),
            name: "vv1".into(),
            aliases: vec![],
            comments: vec![],
            user: "tester".into(),
            created_at: chrono::Utc::now(),
        }
    }

    const GFF: &str = "##gff-version 3
##sequence-region ctgA 1 50000
ctgA\texample\tgene\t1000\t9000\t.\t+\t.\tID=gene00001;Name=EDEN
ctgA\texample\tmRNA\t1050\t9000\t.\t+\t.\tID=mRNA00001;Parent=gene00001;Name=EDEN.1
ctgA\texample\tgene\t20000\t21000\t.\t-\t.\tID=gene00002;Name=Other
";

    #[test]
    fn loads_regions_and_features() {
        let assembly = assembly();
        let ctg_a = ref_seq_id(assembly.id, "ctgA");
        let store = FlatFileStore::from_gff3(assembly, GFF.as_bytes()).unwrap();
        assert_eq!(store.ref_seqs().map(|r| r.length).collect::<Vec<_>>(), vec![50000]);
        let found = store.features_in_range(ctg_a, 0, 10_000);
        assert_eq!(found.len(), 1);
        assert_eq!((found[0].min, found[0].max), (999, 9000));
        assert_eq!(found[0].children.len(), 1);
    }

    #[test]
    fn search_matches_nested_attributes() {
        let store = FlatFileStore::from_gff3(assembly(), GFF.as_bytes()).unwrap();
        let found = store.search("eden.1");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].feature_type, "gene");
        assert!(store.search("nothing").is_empty());
    }

    #[test]
    fn feature_changes_apply_to_the_document() {
        let mut store = FlatFileStore::from_gff3(assembly(), GFF.as_bytes()).unwrap();
        let gene = store.search("Other")[0].id;
        let change: Change = StrandChange::new(
            store.assembly.id,
            StrandChangeDetails {
                feature_id: gene,
                old_strand: Some(Strand::Reverse),
                new_strand: Some(Strand::Forward),
            },
        )
        .into();
        change.execute(Backend::FlatFile(&mut store)).unwrap();
        assert_eq!(store.feature(gene).unwrap().strand, Some(Strand::Forward));

        let mut out = Vec::new();
        store.write_gff3(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("ctgA\texample\tgene\t20000\t21000\t.\t+\t.\tID=gene00002"));
    }

    #[test]
    fn failed_batches_leave_the_document_untouched() {
        let mut store = FlatFileStore::from_gff3(assembly(), GFF.as_bytes()).unwrap();
        let gene = store.search("Other")[0].id;
        let change: Change = StrandChange::batch(
            store.assembly.id,
            vec![
                StrandChangeDetails {
                    feature_id: gene,
                    old_strand: Some(Strand::Reverse),
                    new_strand: Some(Strand::Forward),
                },
                StrandChangeDetails {
                    feature_id: Uuid::new_v4(),
                    old_strand: None,
                    new_strand: Some(Strand::Forward),
                },
            ],
        )
        .unwrap()
        .into();

        let result = change.execute(Backend::FlatFile(&mut store));

        assert!(matches!(result, Err(ChangeError::FeatureNotFound(_))));
        assert_eq!(store.feature(gene).unwrap().strand, Some(Strand::Reverse));
    }

    #[test]
    fn saved_files_reopen_with_the_same_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("annotations.gff3");
        let assembly = assembly();
        let store = FlatFileStore::from_gff3(assembly.clone(), GFF.as_bytes()).unwrap();
        store.save(&path).unwrap();

        let reopened = FlatFileStore::open(assembly, &path).unwrap();
        let shape = |s: &FlatFileStore| {
            s.features()
                .iter()
                .map(|f| (f.feature_type.clone(), f.min, f.max, f.children.len()))
                .collect::<Vec<_>>()
        };
        assert_eq!(shape(&reopened), shape(&store));
    }

    #[test]
    fn unknown_seqid_is_rejected() {
        let gff = "ctgB\t.\tgene\t1\t10\t.\t+\t.\tID=g1\n";
        assert!(matches!(
            FlatFileStore::from_gff3(assembly(), gff.as_bytes()),
            Err(ChangeError::RefSeqNotFound(_))
        ));
    }
}
