use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::wire;
use super::{Change, ChangeType};
use crate::backend::{edit_feature, FeatureTarget};
use crate::error::{ChangeError, Result};
use crate::models::AnnotationFeature;
use crate::tree::FeatureTree;

/// Inserts a feature with its subtree, either at the top level of its
/// reference sequence or under an existing parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddFeatureChange {
    pub assembly: Uuid,
    pub added_feature: AnnotationFeature,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_feature_id: Option<Uuid>,
    /// Position among the parent's children; appended when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
}

impl AddFeatureChange {
    pub fn new(
        assembly: Uuid,
        added_feature: AnnotationFeature,
        parent_feature_id: Option<Uuid>,
        index: Option<usize>,
    ) -> Self {
        Self {
            assembly,
            added_feature,
            parent_feature_id,
            index,
        }
    }

    fn apply<T: FeatureTarget + ?Sized>(&self, target: &mut T) -> Result<()> {
        match self.parent_feature_id {
            Some(parent) => edit_feature(target, parent, |tree, node| {
                tree.insert_child(node, &self.added_feature, self.index)?;
                Ok(true)
            }),
            None => target.add_top_level(&self.added_feature),
        }
    }
}

impl ChangeType for AddFeatureChange {
    const TYPE_NAME: &'static str = "AddFeatureChange";

    fn assembly(&self) -> Uuid {
        self.assembly
    }

    fn changed_ids(&self) -> Vec<Uuid> {
        vec![self.added_feature.id]
    }

    fn to_payload(&self) -> Result<Map<String, Value>> {
        let mut fields = wire::encode(self)?;
        fields.insert("changedIds".to_string(), serde_json::to_value(self.changed_ids())?);
        Ok(fields)
    }

    fn from_payload(fields: Map<String, Value>) -> Result<Self> {
        wire::decode(fields)
    }

    execute_on_feature_targets!();

    fn inverse(&self) -> Result<Change> {
        Ok(DeleteFeatureChange {
            assembly: self.assembly,
            deleted_feature: self.added_feature.clone(),
            parent_feature_id: self.parent_feature_id,
            index: self.index,
            force: false,
        }
        .into())
    }
}

/// Removes a feature and its subtree. The change carries a snapshot of what
/// it removes so it can be undone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteFeatureChange {
    pub assembly: Uuid,
    pub deleted_feature: AnnotationFeature,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_feature_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    /// A missing target is a success instead of `FeatureNotFound`.
    #[serde(default)]
    pub force: bool,
}

impl DeleteFeatureChange {
    /// Snapshot `feature_id` from `tree` (its subtree, parent and position).
    pub fn from_tree(assembly: Uuid, tree: &FeatureTree, feature_id: Uuid) -> Result<Self> {
        let node = tree.locate(feature_id)?;
        let parent = tree.node(node).parent();
        Ok(Self {
            assembly,
            deleted_feature: tree.subtree(node),
            parent_feature_id: parent.map(|p| tree.node(p).id),
            index: parent.map(|_| tree.position(node)),
            force: false,
        })
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    fn apply<T: FeatureTarget + ?Sized>(&self, target: &mut T) -> Result<()> {
        let id = self.deleted_feature.id;
        let Some(tree) = target.tree_containing(id)? else {
            if self.force {
                tracing::debug!(feature_id = %id, "feature already gone, forced delete is a no-op");
                return Ok(());
            }
            return Err(ChangeError::FeatureNotFound(id));
        };
        if tree.root_id() == id {
            target.remove_top_level(id)?;
            return Ok(());
        }
        edit_feature(target, id, |tree, node| {
            tree.remove(node)?;
            Ok(true)
        })
    }
}

impl ChangeType for DeleteFeatureChange {
    const TYPE_NAME: &'static str = "DeleteFeatureChange";

    fn assembly(&self) -> Uuid {
        self.assembly
    }

    fn changed_ids(&self) -> Vec<Uuid> {
        vec![self.deleted_feature.id]
    }

    fn to_payload(&self) -> Result<Map<String, Value>> {
        let mut fields = wire::encode(self)?;
        fields.insert("changedIds".to_string(), serde_json::to_value(self.changed_ids())?);
        Ok(fields)
    }

    fn from_payload(fields: Map<String, Value>) -> Result<Self> {
        wire::decode(fields)
    }

    execute_on_feature_targets!();

    fn inverse(&self) -> Result<Change> {
        Ok(AddFeatureChange {
            assembly: self.assembly,
            added_feature: self.deleted_feature.clone(),
            parent_feature_id: self.parent_feature_id,
            index: self.index,
        }
        .into())
    }

    fn is_idempotent(&self) -> bool {
        self.force
    }
}
