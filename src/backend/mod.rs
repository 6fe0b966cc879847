//! Execution targets for changes and operations.
//!
//! There are three kinds of target:
//!
//! - the authoritative store, reached through a [`ServerTarget`] that wraps a
//!   [`UnitOfWork`] over a transactional [`DocumentStore`];
//! - the optimistic in-memory [`ClientDataStore`];
//! - the [`FlatFileStore`], a GFF3 document held in memory.
//!
//! Feature-level changes are written once against [`FeatureTarget`], which all
//! three implement.

mod blob;
mod client;
mod flat_file;
mod store;
mod unit_of_work;

pub use blob::{BlobStore, DirectoryBlobStore, MemoryBlobStore};
pub use client::{ClientAssembly, ClientDataStore, ClientRefSeq, ClientSession, SyncStatus};
pub use flat_file::FlatFileStore;
pub use store::DocumentStore;
pub use unit_of_work::UnitOfWork;

use uuid::Uuid;

use crate::error::{ChangeError, Result};
use crate::models::AnnotationFeature;
use crate::tree::{FeatureTree, NodeId};

/// A backend selected for one execution.
pub enum Backend<'b, 'a> {
    Server(&'b mut ServerTarget<'a>),
    Client(&'b mut ClientDataStore),
    FlatFile(&'b mut FlatFileStore),
}

impl Backend<'_, '_> {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Server(_) => "server",
            Self::Client(_) => "client",
            Self::FlatFile(_) => "flat file",
        }
    }
}

/// Storage of top-level feature trees, as seen by feature-level changes.
pub trait FeatureTarget {
    fn backend_name(&self) -> &'static str;

    /// The tree whose root or descendants include `feature_id`.
    fn tree_containing(&mut self, feature_id: Uuid) -> Result<Option<&mut FeatureTree>>;

    /// Index a new top-level feature under its reference sequence.
    fn add_top_level(&mut self, feature: &AnnotationFeature) -> Result<()>;

    /// Drop a top-level feature and return its final state.
    fn remove_top_level(&mut self, feature_id: Uuid) -> Result<AnnotationFeature>;

    /// Record that the tree rooted at `top_level_id` must be persisted.
    fn mark_modified(&mut self, top_level_id: Uuid);
}

/// Run `edit` on the node for `feature_id`. The edit returns whether it
/// changed anything; only then is the owning tree marked modified.
pub(crate) fn edit_feature<T, F>(target: &mut T, feature_id: Uuid, edit: F) -> Result<()>
where
    T: FeatureTarget + ?Sized,
    F: FnOnce(&mut FeatureTree, NodeId) -> Result<bool>,
{
    let tree = target
        .tree_containing(feature_id)?
        .ok_or(ChangeError::FeatureNotFound(feature_id))?;
    let node = tree.locate(feature_id)?;
    let root = tree.root_id();
    if edit(tree, node)? {
        target.mark_modified(root);
    }
    Ok(())
}

/// The authoritative store for one change execution.
pub struct ServerTarget<'a> {
    pub uow: UnitOfWork<'a>,
    pub blobs: &'a dyn BlobStore,
    pub user: String,
}

impl<'a> ServerTarget<'a> {
    pub fn new(
        store: &'a mut dyn DocumentStore,
        blobs: &'a dyn BlobStore,
        user: impl Into<String>,
    ) -> Self {
        Self {
            uow: UnitOfWork::new(store),
            blobs,
            user: user.into(),
        }
    }

    /// Flush everything buffered to the store.
    pub fn finish(mut self) -> Result<()> {
        self.uow.flush()
    }
}

impl FeatureTarget for ServerTarget<'_> {
    fn backend_name(&self) -> &'static str {
        "server"
    }

    fn tree_containing(&mut self, feature_id: Uuid) -> Result<Option<&mut FeatureTree>> {
        self.uow.tree_containing(feature_id)
    }

    fn add_top_level(&mut self, feature: &AnnotationFeature) -> Result<()> {
        self.uow.add_top_level(feature)
    }

    fn remove_top_level(&mut self, feature_id: Uuid) -> Result<AnnotationFeature> {
        self.uow.remove_top_level(feature_id)
    }

    fn mark_modified(&mut self, top_level_id: Uuid) {
        self.uow.mark_modified(top_level_id)
    }
}
