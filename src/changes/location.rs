//! Interval edits.
//!
//! A location change records a whole propagation chain: the requested edit
//! first, followed by every parent or child bound it forces to move. The
//! chain is computed once, when the change is built against the caller's
//! tree, and replayed verbatim on every backend. Each recorded old bound must
//! still match (otherwise the change is stale) and the tree invariants are
//! checked only after the whole batch has been applied.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::wire::{self, Envelope};
use super::{Change, ChangeType};
use crate::backend::FeatureTarget;
use crate::error::{ChangeError, Result};
use crate::tree::{propagate, Bound, BoundEdit, FeatureTree};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationStartChangeDetails {
    pub feature_id: Uuid,
    pub old_start: u64,
    pub new_start: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationEndChangeDetails {
    pub feature_id: Uuid,
    pub old_end: u64,
    pub new_end: u64,
}

/// Moves the `min` of one or more features.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationStartChange {
    pub assembly: Uuid,
    pub changes: Vec<LocationStartChangeDetails>,
}

/// Moves the `max` of one or more features.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationEndChange {
    pub assembly: Uuid,
    pub changes: Vec<LocationEndChangeDetails>,
}

impl From<&LocationStartChangeDetails> for BoundEdit {
    fn from(d: &LocationStartChangeDetails) -> Self {
        BoundEdit {
            feature_id: d.feature_id,
            old: d.old_start,
            new: d.new_start,
        }
    }
}

impl From<BoundEdit> for LocationStartChangeDetails {
    fn from(e: BoundEdit) -> Self {
        Self {
            feature_id: e.feature_id,
            old_start: e.old,
            new_start: e.new,
        }
    }
}

impl From<&LocationEndChangeDetails> for BoundEdit {
    fn from(d: &LocationEndChangeDetails) -> Self {
        BoundEdit {
            feature_id: d.feature_id,
            old: d.old_end,
            new: d.new_end,
        }
    }
}

impl From<BoundEdit> for LocationEndChangeDetails {
    fn from(e: BoundEdit) -> Self {
        Self {
            feature_id: e.feature_id,
            old_end: e.old,
            new_end: e.new,
        }
    }
}

fn reversed(edits: impl DoubleEndedIterator<Item = BoundEdit>) -> Vec<BoundEdit> {
    edits
        .rev()
        .map(|e| BoundEdit {
            feature_id: e.feature_id,
            old: e.new,
            new: e.old,
        })
        .collect()
}

/// Apply recorded bound edits, then validate every tree they touched.
fn apply_bound_edits<T, I>(target: &mut T, bound: Bound, edits: I) -> Result<()>
where
    T: FeatureTarget + ?Sized,
    I: IntoIterator<Item = BoundEdit>,
{
    let mut touched = BTreeSet::new();
    for edit in edits {
        let tree = target
            .tree_containing(edit.feature_id)?
            .ok_or(ChangeError::FeatureNotFound(edit.feature_id))?;
        tree.apply_bound_edit(bound, &edit)?;
        touched.insert(tree.root_id());
    }
    for root in touched {
        if let Some(tree) = target.tree_containing(root)? {
            tree.validate()?;
        }
        target.mark_modified(root);
    }
    Ok(())
}

fn plan(
    tree: &FeatureTree,
    feature_id: Uuid,
    bound: Bound,
    new_value: u64,
    shrink_parent: bool,
) -> Result<Vec<BoundEdit>> {
    let edits = propagate(tree, feature_id, bound, new_value, shrink_parent)?;
    if edits.is_empty() {
        return Err(ChangeError::malformed(format!(
            "feature {} already has {} {}",
            feature_id,
            bound.as_str(),
            new_value
        )));
    }
    Ok(edits)
}

impl LocationStartChange {
    pub fn batch(assembly: Uuid, changes: Vec<LocationStartChangeDetails>) -> Result<Self> {
        if changes.is_empty() {
            return Err(ChangeError::malformed("a batch needs at least one change"));
        }
        Ok(Self { assembly, changes })
    }

    /// Build the change moving `feature_id`'s start to `new_start` together
    /// with every edit it propagates to in `tree`.
    pub fn propagated(
        assembly: Uuid,
        tree: &FeatureTree,
        feature_id: Uuid,
        new_start: u64,
        shrink_parent: bool,
    ) -> Result<Self> {
        let edits = plan(tree, feature_id, Bound::Min, new_start, shrink_parent)?;
        Self::batch(assembly, edits.into_iter().map(Into::into).collect())
    }

    fn apply<T: FeatureTarget + ?Sized>(&self, target: &mut T) -> Result<()> {
        apply_bound_edits(target, Bound::Min, self.changes.iter().map(BoundEdit::from))
    }
}

impl LocationEndChange {
    pub fn batch(assembly: Uuid, changes: Vec<LocationEndChangeDetails>) -> Result<Self> {
        if changes.is_empty() {
            return Err(ChangeError::malformed("a batch needs at least one change"));
        }
        Ok(Self { assembly, changes })
    }

    /// Build the change moving `feature_id`'s end to `new_end` together with
    /// every edit it propagates to in `tree`.
    pub fn propagated(
        assembly: Uuid,
        tree: &FeatureTree,
        feature_id: Uuid,
        new_end: u64,
        shrink_parent: bool,
    ) -> Result<Self> {
        let edits = plan(tree, feature_id, Bound::Max, new_end, shrink_parent)?;
        Self::batch(assembly, edits.into_iter().map(Into::into).collect())
    }

    fn apply<T: FeatureTarget + ?Sized>(&self, target: &mut T) -> Result<()> {
        apply_bound_edits(target, Bound::Max, self.changes.iter().map(BoundEdit::from))
    }
}

impl ChangeType for LocationStartChange {
    const TYPE_NAME: &'static str = "LocationStartChange";

    fn assembly(&self) -> Uuid {
        self.assembly
    }

    fn changed_ids(&self) -> Vec<Uuid> {
        self.changes.iter().map(|d| d.feature_id).collect()
    }

    fn to_payload(&self) -> Result<Map<String, Value>> {
        let envelope = Envelope {
            assembly: self.assembly,
            changed_ids: self.changed_ids(),
        };
        wire::encode_batched(&envelope, &self.changes)
    }

    fn from_payload(fields: Map<String, Value>) -> Result<Self> {
        let (envelope, changes) = wire::decode_batched(fields)?;
        Ok(Self {
            assembly: envelope.assembly,
            changes,
        })
    }

    execute_on_feature_targets!();

    fn inverse(&self) -> Result<Change> {
        let edits = reversed(self.changes.iter().map(BoundEdit::from));
        Ok(LocationStartChange {
            assembly: self.assembly,
            changes: edits.into_iter().map(Into::into).collect(),
        }
        .into())
    }
}

impl ChangeType for LocationEndChange {
    const TYPE_NAME: &'static str = "LocationEndChange";

    fn assembly(&self) -> Uuid {
        self.assembly
    }

    fn changed_ids(&self) -> Vec<Uuid> {
        self.changes.iter().map(|d| d.feature_id).collect()
    }

    fn to_payload(&self) -> Result<Map<String, Value>> {
        let envelope = Envelope {
            assembly: self.assembly,
            changed_ids: self.changed_ids(),
        };
        wire::encode_batched(&envelope, &self.changes)
    }

    fn from_payload(fields: Map<String, Value>) -> Result<Self> {
        let (envelope, changes) = wire::decode_batched(fields)?;
        Ok(Self {
            assembly: envelope.assembly,
            changes,
        })
    }

    execute_on_feature_targets!();

    fn inverse(&self) -> Result<Change> {
        let edits = reversed(self.changes.iter().map(BoundEdit::from));
        Ok(LocationEndChange {
            assembly: self.assembly,
            changes: edits.into_iter().map(Into::into).collect(),
        }
        .into())
    }
}
