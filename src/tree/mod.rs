//! Arena-backed feature trees.
//!
//! A [`FeatureTree`] holds one top-level feature and all of its descendants in
//! a slab. Each record stores its parent index, its ordered child indices and
//! its `all_ids` set (own id plus every descendant id), which is kept current
//! on every structural change and used to prune subtree searches.
//!
//! Mutation goes through a handful of primitives (insert child, remove
//! subtree, rewrite type/strand/attributes/bounds/locations). Primitives that
//! can be batched do not validate; callers run [`FeatureTree::validate`] once
//! the whole edit has been applied.

mod propagation;

pub use propagation::{propagate, Bound, BoundEdit};

use std::collections::BTreeSet;

use indexmap::IndexMap;
use slab::Slab;
use uuid::Uuid;

use crate::error::{ChangeError, Result};
use crate::models::{AnnotationFeature, Attributes, Location, Strand};

pub type NodeId = usize;

#[derive(Debug, Clone)]
pub struct FeatureNode {
    pub id: Uuid,
    pub ref_seq: Uuid,
    pub min: u64,
    pub max: u64,
    pub feature_type: String,
    pub strand: Option<Strand>,
    pub attributes: Attributes,
    pub discontinuous_locations: Vec<Location>,
    pub status: i32,
    pub user: Option<String>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    all_ids: BTreeSet<Uuid>,
}

impl FeatureNode {
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn all_ids(&self) -> &BTreeSet<Uuid> {
        &self.all_ids
    }

    pub fn bound(&self, bound: Bound) -> u64 {
        match bound {
            Bound::Min => self.min,
            Bound::Max => self.max,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeatureTree {
    nodes: Slab<FeatureNode>,
    root: NodeId,
}

impl FeatureTree {
    pub fn from_feature(feature: &AnnotationFeature) -> Self {
        let mut nodes = Slab::new();
        let root = Self::insert_recursive(&mut nodes, feature, None);
        let mut tree = Self { nodes, root };
        tree.rebuild_all_ids(root);
        tree
    }

    fn insert_recursive(
        nodes: &mut Slab<FeatureNode>,
        feature: &AnnotationFeature,
        parent: Option<NodeId>,
    ) -> NodeId {
        let key = nodes.insert(FeatureNode {
            id: feature.id,
            ref_seq: feature.ref_seq,
            min: feature.min,
            max: feature.max,
            feature_type: feature.feature_type.clone(),
            strand: feature.strand,
            attributes: feature.attributes.clone(),
            discontinuous_locations: feature.discontinuous_locations.clone(),
            status: feature.status,
            user: feature.user.clone(),
            parent,
            children: Vec::new(),
            all_ids: BTreeSet::new(),
        });
        for child in feature.children.values() {
            let child_key = Self::insert_recursive(nodes, child, Some(key));
            nodes[key].children.push(child_key);
        }
        key
    }

    /// Recompute `all_ids` for a whole subtree, bottom-up.
    fn rebuild_all_ids(&mut self, node: NodeId) -> BTreeSet<Uuid> {
        let children = self.nodes[node].children.clone();
        let mut ids = BTreeSet::from([self.nodes[node].id]);
        for child in children {
            ids.extend(self.rebuild_all_ids(child));
        }
        self.nodes[node].all_ids = ids.clone();
        ids
    }

    /// Recompute `all_ids` from `from` up to the root, trusting the children's sets.
    fn refresh_ancestors(&mut self, from: NodeId) {
        let mut current = Some(from);
        while let Some(node) = current {
            let mut ids = BTreeSet::from([self.nodes[node].id]);
            for &child in &self.nodes[node].children {
                ids.extend(self.nodes[child].all_ids.iter().copied());
            }
            self.nodes[node].all_ids = ids;
            current = self.nodes[node].parent;
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn root_id(&self) -> Uuid {
        self.nodes[self.root].id
    }

    pub fn ref_seq(&self) -> Uuid {
        self.nodes[self.root].ref_seq
    }

    pub fn node(&self, node: NodeId) -> &FeatureNode {
        &self.nodes[node]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether `id` is the root or any descendant of this tree.
    pub fn contains(&self, id: Uuid) -> bool {
        self.nodes[self.root].all_ids.contains(&id)
    }

    /// Depth-first search that skips every subtree whose `all_ids` lacks `id`.
    pub fn find(&self, id: Uuid) -> Option<NodeId> {
        let mut stack = vec![self.root];
        while let Some(node) = stack.pop() {
            let record = &self.nodes[node];
            if !record.all_ids.contains(&id) {
                continue;
            }
            if record.id == id {
                return Some(node);
            }
            stack.extend(record.children.iter().rev().copied());
        }
        None
    }

    pub fn locate(&self, id: Uuid) -> Result<NodeId> {
        self.find(id).ok_or(ChangeError::FeatureNotFound(id))
    }

    /// Index of `node` among its siblings (0 for the root).
    pub fn position(&self, node: NodeId) -> usize {
        self.nodes[node]
            .parent
            .and_then(|parent| {
                self.nodes[parent]
                    .children
                    .iter()
                    .position(|&child| child == node)
            })
            .unwrap_or(0)
    }

    /// Node ids in depth-first pre-order.
    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        let mut stack = vec![self.root];
        std::iter::from_fn(move || {
            let node = stack.pop()?;
            stack.extend(self.nodes[node].children.iter().rev().copied());
            Some(node)
        })
    }

    pub fn to_feature(&self) -> AnnotationFeature {
        self.subtree(self.root)
    }

    /// The nested form of the subtree rooted at `node`.
    pub fn subtree(&self, node: NodeId) -> AnnotationFeature {
        let record = &self.nodes[node];
        let children: IndexMap<Uuid, AnnotationFeature> = record
            .children
            .iter()
            .map(|&child| (self.nodes[child].id, self.subtree(child)))
            .collect();
        AnnotationFeature {
            id: record.id,
            ref_seq: record.ref_seq,
            min: record.min,
            max: record.max,
            feature_type: record.feature_type.clone(),
            strand: record.strand,
            attributes: record.attributes.clone(),
            children,
            discontinuous_locations: record.discontinuous_locations.clone(),
            status: record.status,
            user: record.user.clone(),
        }
    }

    /// Insert `feature` (with its subtree) under `parent`, at `index` among the
    /// existing children or at the end.
    pub fn insert_child(
        &mut self,
        parent: NodeId,
        feature: &AnnotationFeature,
        index: Option<usize>,
    ) -> Result<NodeId> {
        if let Some(existing) = feature.all_ids().into_iter().find(|id| self.contains(*id)) {
            return Err(ChangeError::AlreadyExists(format!("feature {}", existing)));
        }
        let outer = &self.nodes[parent];
        if feature.min < outer.min || feature.max > outer.max {
            return Err(ChangeError::OutOfBounds {
                feature_id: feature.id,
                min: feature.min,
                max: feature.max,
                outer_min: outer.min,
                outer_max: outer.max,
            });
        }
        FeatureTree::from_feature(feature).validate()?;

        let node = Self::insert_recursive(&mut self.nodes, feature, Some(parent));
        let siblings = &mut self.nodes[parent].children;
        let at = index.unwrap_or(siblings.len()).min(siblings.len());
        siblings.insert(at, node);
        self.rebuild_all_ids(node);
        self.refresh_ancestors(parent);
        Ok(node)
    }

    /// Remove `node` and its descendants. Returns the removed subtree and the
    /// index it occupied among its siblings.
    pub fn remove(&mut self, node: NodeId) -> Result<(AnnotationFeature, usize)> {
        let Some(parent) = self.nodes[node].parent else {
            return Err(ChangeError::malformed(
                "a top-level feature is removed from its reference sequence, not from its tree",
            ));
        };
        let snapshot = self.subtree(node);
        let position = self.position(node);
        self.nodes[parent].children.remove(position);
        self.drop_subtree(node);
        self.refresh_ancestors(parent);
        Ok((snapshot, position))
    }

    fn drop_subtree(&mut self, node: NodeId) {
        let record = self.nodes.remove(node);
        for child in record.children {
            self.drop_subtree(child);
        }
    }

    /// Replace the subtree at `node` with `feature`, keeping its position.
    pub fn replace(&mut self, node: NodeId, feature: &AnnotationFeature) -> Result<NodeId> {
        let Some(parent) = self.nodes[node].parent else {
            return Err(ChangeError::malformed("the root of a feature tree cannot be replaced in place"));
        };
        let (_, position) = self.remove(node)?;
        self.insert_child(parent, feature, Some(position))
    }

    pub fn set_type(&mut self, node: NodeId, feature_type: impl Into<String>) {
        self.nodes[node].feature_type = feature_type.into();
    }

    pub fn set_strand(&mut self, node: NodeId, strand: Option<Strand>) {
        self.nodes[node].strand = strand;
    }

    pub fn set_attributes(&mut self, node: NodeId, attributes: Attributes) {
        self.nodes[node].attributes = attributes;
    }

    pub fn set_discontinuous_locations(&mut self, node: NodeId, locations: Vec<Location>) {
        self.nodes[node].discontinuous_locations = locations;
    }

    /// Move one bound. Discontinuous locations span their feature exactly, so
    /// the first location's start (or last location's end) moves with it.
    pub fn set_bound(&mut self, node: NodeId, bound: Bound, value: u64) {
        let record = &mut self.nodes[node];
        match bound {
            Bound::Min => {
                record.min = value;
                if let Some(first) = record.discontinuous_locations.first_mut() {
                    first.start = value;
                }
            }
            Bound::Max => {
                record.max = value;
                if let Some(last) = record.discontinuous_locations.last_mut() {
                    last.end = value;
                }
            }
        }
    }

    /// Apply one recorded bound edit, refusing it if the feature has moved on.
    pub fn apply_bound_edit(&mut self, bound: Bound, edit: &BoundEdit) -> Result<()> {
        let node = self.locate(edit.feature_id)?;
        let found = self.nodes[node].bound(bound);
        if found != edit.old {
            return Err(ChangeError::LocationMismatch {
                feature_id: edit.feature_id,
                bound: bound.as_str(),
                expected: edit.old,
                found,
            });
        }
        self.set_bound(node, bound, edit.new);
        Ok(())
    }

    /// Check every structural invariant of the tree: `min < max` everywhere,
    /// children contained in their parents, and discontinuous locations
    /// ordered, non-overlapping and spanning their feature.
    pub fn validate(&self) -> Result<()> {
        for (_, node) in self.nodes.iter() {
            if node.min >= node.max {
                return Err(ChangeError::InvalidInterval {
                    feature_id: node.id,
                    min: node.min,
                    max: node.max,
                });
            }
        }
        for (_, node) in self.nodes.iter() {
            if let Some(parent) = node.parent {
                let outer = &self.nodes[parent];
                if node.min < outer.min || node.max > outer.max {
                    return Err(ChangeError::OutOfBounds {
                        feature_id: node.id,
                        min: node.min,
                        max: node.max,
                        outer_min: outer.min,
                        outer_max: outer.max,
                    });
                }
            }
            validate_locations(node)?;
        }
        Ok(())
    }
}

fn validate_locations(node: &FeatureNode) -> Result<()> {
    let locations = &node.discontinuous_locations;
    let (Some(first), Some(last)) = (locations.first(), locations.last()) else {
        return Ok(());
    };
    for location in locations {
        if location.start >= location.end {
            return Err(ChangeError::InvalidInterval {
                feature_id: node.id,
                min: location.start,
                max: location.end,
            });
        }
    }
    if locations.windows(2).any(|pair| pair[1].start < pair[0].end) {
        return Err(ChangeError::InvalidLocations {
            feature_id: node.id,
            reason: "locations overlap or are out of order",
        });
    }
    if first.start != node.min || last.end != node.max {
        return Err(ChangeError::InvalidLocations {
            feature_id: node.id,
            reason: "locations must start at the feature's min and end at its max",
        });
    }
    Ok(())
}
