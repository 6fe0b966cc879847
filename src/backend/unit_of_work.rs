use std::collections::{BTreeSet, HashMap};

use uuid::Uuid;

use super::DocumentStore;
use crate::error::{ChangeError, Result};
use crate::models::{AnnotationFeature, Assembly, RefSeq, RefSeqChunk};
use crate::tree::FeatureTree;

enum PendingWrite {
    CreateAssembly(Assembly),
    DeleteAssembly(Uuid),
    CreateRefSeq(RefSeq),
    UpdateRefSeq(RefSeq),
    CreateChunk(RefSeqChunk),
}

/// Buffers every write a change makes and applies them to the store in one
/// go when the change has finished executing.
///
/// Feature trees are loaded on first touch and edited in memory. Reads of
/// assemblies and reference sequences go straight to the store and do not see
/// buffered writes. Dropping a unit of work without flushing discards
/// everything.
pub struct UnitOfWork<'s> {
    store: &'s mut dyn DocumentStore,
    trees: HashMap<Uuid, FeatureTree>,
    created: BTreeSet<Uuid>,
    modified: BTreeSet<Uuid>,
    removed: BTreeSet<Uuid>,
    writes: Vec<PendingWrite>,
}

impl<'s> UnitOfWork<'s> {
    pub fn new(store: &'s mut dyn DocumentStore) -> Self {
        Self {
            store,
            trees: HashMap::new(),
            created: BTreeSet::new(),
            modified: BTreeSet::new(),
            removed: BTreeSet::new(),
            writes: Vec::new(),
        }
    }

    /// Read access to the underlying store.
    pub fn store(&self) -> &dyn DocumentStore {
        &*self.store
    }

    pub fn find_assembly(&self, id: Uuid) -> Result<Option<Assembly>> {
        self.store.find_assembly(id)
    }

    pub fn find_assembly_by_name(&self, name: &str) -> Result<Option<Assembly>> {
        self.store.find_assembly_by_name(name)
    }

    pub fn find_ref_seqs(&self, assembly: Uuid) -> Result<Vec<RefSeq>> {
        self.store.find_ref_seqs(assembly)
    }

    /// A reference sequence of `assembly` by name or alias.
    pub fn find_ref_seq_by_name(&self, assembly: Uuid, name: &str) -> Result<Option<RefSeq>> {
        Ok(self
            .store
            .find_ref_seqs(assembly)?
            .into_iter()
            .find(|ref_seq| ref_seq.matches_name(name)))
    }

    pub fn create_assembly(&mut self, assembly: Assembly) {
        self.writes.push(PendingWrite::CreateAssembly(assembly));
    }

    pub fn delete_assembly(&mut self, id: Uuid) {
        self.writes.push(PendingWrite::DeleteAssembly(id));
    }

    pub fn create_ref_seq(&mut self, ref_seq: RefSeq) {
        self.writes.push(PendingWrite::CreateRefSeq(ref_seq));
    }

    pub fn update_ref_seq(&mut self, ref_seq: RefSeq) {
        self.writes.push(PendingWrite::UpdateRefSeq(ref_seq));
    }

    pub fn create_chunk(&mut self, chunk: RefSeqChunk) {
        self.writes.push(PendingWrite::CreateChunk(chunk));
    }

    pub fn tree_containing(&mut self, feature_id: Uuid) -> Result<Option<&mut FeatureTree>> {
        let cached = self
            .trees
            .iter()
            .find(|(_, tree)| tree.contains(feature_id))
            .map(|(root, _)| *root);
        let root = match cached {
            Some(root) => root,
            None => {
                let Some(document) = self.store.find_top_level_feature(feature_id)? else {
                    return Ok(None);
                };
                // A cached or removed tree is newer than the stored document.
                if self.trees.contains_key(&document.id) || self.removed.contains(&document.id) {
                    return Ok(None);
                }
                let root = document.id;
                self.trees.insert(root, FeatureTree::from_feature(&document));
                root
            }
        };
        Ok(self.trees.get_mut(&root))
    }

    pub fn add_top_level(&mut self, feature: &AnnotationFeature) -> Result<()> {
        for id in feature.all_ids() {
            if self.tree_containing(id)?.is_some() {
                return Err(ChangeError::AlreadyExists(format!("feature {}", id)));
            }
        }
        if self.store.find_ref_seq(feature.ref_seq)?.is_none() {
            return Err(ChangeError::RefSeqNotFound(feature.ref_seq.to_string()));
        }
        let tree = FeatureTree::from_feature(feature);
        tree.validate()?;
        let root = tree.root_id();
        self.trees.insert(root, tree);
        if !self.removed.remove(&root) {
            self.created.insert(root);
        } else {
            // Deleted and re-added within one change: persist as an update.
            self.modified.insert(root);
        }
        Ok(())
    }

    pub fn remove_top_level(&mut self, feature_id: Uuid) -> Result<AnnotationFeature> {
        let is_root = self
            .tree_containing(feature_id)?
            .map(|tree| tree.root_id() == feature_id)
            .ok_or(ChangeError::FeatureNotFound(feature_id))?;
        if !is_root {
            return Err(ChangeError::malformed(format!(
                "feature {} is not a top-level feature",
                feature_id
            )));
        }
        let tree = self
            .trees
            .remove(&feature_id)
            .ok_or(ChangeError::FeatureNotFound(feature_id))?;
        self.modified.remove(&feature_id);
        if !self.created.remove(&feature_id) {
            self.removed.insert(feature_id);
        }
        Ok(tree.to_feature())
    }

    pub fn mark_modified(&mut self, top_level_id: Uuid) {
        if !self.created.contains(&top_level_id) {
            self.modified.insert(top_level_id);
        }
    }

    /// Apply all buffered writes to the store and start afresh.
    pub fn flush(&mut self) -> Result<()> {
        let writes = std::mem::take(&mut self.writes);
        let write_count = writes.len();
        for write in writes {
            match write {
                PendingWrite::CreateAssembly(assembly) => self.store.create_assembly(&assembly)?,
                PendingWrite::DeleteAssembly(id) => self.store.delete_assembly(id)?,
                PendingWrite::CreateRefSeq(ref_seq) => self.store.create_ref_seq(&ref_seq)?,
                PendingWrite::UpdateRefSeq(ref_seq) => self.store.update_ref_seq(&ref_seq)?,
                PendingWrite::CreateChunk(chunk) => self.store.create_chunk(&chunk)?,
            }
        }
        for id in std::mem::take(&mut self.removed) {
            self.store.delete_feature(id)?;
        }
        for id in std::mem::take(&mut self.created) {
            if let Some(tree) = self.trees.get(&id) {
                self.store.create_feature(&tree.to_feature())?;
            }
        }
        for id in std::mem::take(&mut self.modified) {
            if let Some(tree) = self.trees.get(&id) {
                self.store.update_feature(&tree.to_feature())?;
            }
        }
        tracing::debug!(
            writes = write_count,
            trees = self.trees.len(),
            "flushed unit of work"
        );
        self.trees.clear();
        Ok(())
    }

    /// Flush, then commit the store's transaction so far.
    pub fn checkpoint(&mut self) -> Result<()> {
        self.flush()?;
        self.store.checkpoint()
    }
}
