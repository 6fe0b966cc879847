use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::wire;
use super::{Change, ChangeType};
use crate::backend::{edit_feature, FeatureTarget};
use crate::error::{ChangeError, Result};
use crate::models::{AnnotationFeature, Location};
use crate::tree::{FeatureTree, NodeId};

/// The transcript obtained by merging `second` into `first`.
///
/// The interval is the union of both; attribute values are `first`'s followed
/// by `second`'s, without repeats; discontinuous locations (a transcript
/// without any counts as one spanning its interval) are unioned and sorted;
/// `second`'s children follow `first`'s. The result keeps `first`'s id.
pub fn merge_transcripts(first: &AnnotationFeature, second: &AnnotationFeature) -> AnnotationFeature {
    let mut merged = first.clone();
    merged.min = first.min.min(second.min);
    merged.max = first.max.max(second.max);

    for (key, values) in &second.attributes {
        merged
            .attributes
            .entry(key.clone())
            .or_default()
            .extend(values.iter().cloned());
    }
    for values in merged.attributes.values_mut() {
        let mut seen = Vec::with_capacity(values.len());
        values.retain(|v| {
            if seen.contains(v) {
                false
            } else {
                seen.push(v.clone());
                true
            }
        });
    }

    merged.discontinuous_locations = union_locations(first, second);
    for (id, child) in &second.children {
        merged.children.insert(*id, child.clone());
    }
    merged
}

fn spans(feature: &AnnotationFeature) -> Vec<Location> {
    if feature.discontinuous_locations.is_empty() {
        vec![Location {
            start: feature.min,
            end: feature.max,
        }]
    } else {
        feature.discontinuous_locations.clone()
    }
}

fn union_locations(first: &AnnotationFeature, second: &AnnotationFeature) -> Vec<Location> {
    if first.discontinuous_locations.is_empty() && second.discontinuous_locations.is_empty() {
        return Vec::new();
    }
    let mut all = spans(first);
    all.extend(spans(second));
    all.sort();
    let mut union: Vec<Location> = Vec::with_capacity(all.len());
    for location in all {
        match union.last_mut() {
            Some(last) if location.start < last.end => last.end = last.end.max(location.end),
            _ => union.push(location),
        }
    }
    union
}

fn check_siblings(tree: &FeatureTree, first: NodeId, second: NodeId) -> Result<NodeId> {
    let (a, b) = (tree.node(first), tree.node(second));
    let parent = match (a.parent(), b.parent()) {
        (Some(pa), Some(pb)) if pa == pb => pa,
        _ => {
            return Err(ChangeError::malformed(format!(
                "transcripts {} and {} do not share a parent",
                a.id, b.id
            )))
        }
    };
    if a.feature_type != b.feature_type {
        return Err(ChangeError::malformed(format!(
            "cannot merge a {} with a {}",
            a.feature_type, b.feature_type
        )));
    }
    Ok(parent)
}

fn check_snapshot(tree: &FeatureTree, node: NodeId, snapshot: &AnnotationFeature) -> Result<()> {
    if tree.subtree(node) != *snapshot {
        return Err(ChangeError::StaleSnapshot(snapshot.id));
    }
    Ok(())
}

/// Merges the second transcript into the first and removes the second.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeTranscriptsChange {
    pub assembly: Uuid,
    pub first_transcript: AnnotationFeature,
    pub second_transcript: AnnotationFeature,
    /// Position of the second transcript among its siblings, for undo.
    pub second_index: usize,
}

impl MergeTranscriptsChange {
    pub fn from_tree(assembly: Uuid, tree: &FeatureTree, first: Uuid, second: Uuid) -> Result<Self> {
        let (first_node, second_node) = (tree.locate(first)?, tree.locate(second)?);
        check_siblings(tree, first_node, second_node)?;
        Ok(Self {
            assembly,
            first_transcript: tree.subtree(first_node),
            second_transcript: tree.subtree(second_node),
            second_index: tree.position(second_node),
        })
    }

    fn apply<T: FeatureTarget + ?Sized>(&self, target: &mut T) -> Result<()> {
        let first_id = self.first_transcript.id;
        let second_id = self.second_transcript.id;
        edit_feature(target, first_id, |tree, first| {
            let second = tree.locate(second_id)?;
            check_siblings(tree, first, second)?;
            check_snapshot(tree, first, &self.first_transcript)?;
            check_snapshot(tree, second, &self.second_transcript)?;

            let merged = merge_transcripts(&self.first_transcript, &self.second_transcript);
            tree.remove(second)?;
            let first = tree.locate(first_id)?;
            tree.replace(first, &merged)?;
            tree.validate()?;
            Ok(true)
        })
    }
}

impl ChangeType for MergeTranscriptsChange {
    const TYPE_NAME: &'static str = "MergeTranscriptsChange";

    fn assembly(&self) -> Uuid {
        self.assembly
    }

    fn changed_ids(&self) -> Vec<Uuid> {
        vec![self.first_transcript.id, self.second_transcript.id]
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
        Ok(SplitTranscriptsChange {
            assembly: self.assembly,
            first_transcript: self.first_transcript.clone(),
            second_transcript: self.second_transcript.clone(),
            second_index: self.second_index,
        }
        .into())
    }
}

/// Undoes a merge: the merged transcript goes back to the first snapshot and
/// the second is re-inserted at its old position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitTranscriptsChange {
    pub assembly: Uuid,
    pub first_transcript: AnnotationFeature,
    pub second_transcript: AnnotationFeature,
    pub second_index: usize,
}

impl SplitTranscriptsChange {
    fn apply<T: FeatureTarget + ?Sized>(&self, target: &mut T) -> Result<()> {
        edit_feature(target, self.first_transcript.id, |tree, node| {
            let merged = merge_transcripts(&self.first_transcript, &self.second_transcript);
            check_snapshot(tree, node, &merged)?;
            let parent = tree.node(node).parent().ok_or_else(|| {
                ChangeError::malformed("a merged transcript always has a parent")
            })?;
            tree.replace(node, &self.first_transcript)?;
            tree.insert_child(parent, &self.second_transcript, Some(self.second_index))?;
            Ok(true)
        })
    }
}

impl ChangeType for SplitTranscriptsChange {
    const TYPE_NAME: &'static str = "SplitTranscriptsChange";

    fn assembly(&self) -> Uuid {
        self.assembly
    }

    fn changed_ids(&self) -> Vec<Uuid> {
        vec![self.first_transcript.id, self.second_transcript.id]
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
        Ok(MergeTranscriptsChange {
            assembly: self.assembly,
            first_transcript: self.first_transcript.clone(),
            second_transcript: self.second_transcript.clone(),
            second_index: self.second_index,
        }
        .into())
    }
}
