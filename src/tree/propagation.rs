//! Bound propagation through a feature tree.
//!
//! Moving one bound of a feature can force other features to move:
//!
//! - expanding pushes the parent outward when the new bound escapes it, and so
//!   on up to the root;
//! - shrinking pulls in every child that would stick out, recursively;
//! - with `shrink_parent`, a shrink also tightens the parent to the tightest
//!   bound of its children (the edited feature's new bound included) and
//!   keeps going upward.
//!
//! A feature whose bound already equals the value being pushed to it is a
//! fixed point and stops propagation along that path. The planner does not
//! touch the tree; it returns the edits in application order so they can be
//! recorded in a change and replayed on any backend.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{FeatureTree, NodeId};
use crate::error::{ChangeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bound {
    Min,
    Max,
}

impl Bound {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Min => "min",
            Self::Max => "max",
        }
    }

    fn expands(self, old: u64, new: u64) -> bool {
        match self {
            Self::Min => new < old,
            Self::Max => new > old,
        }
    }

    /// Whether `value` lies beyond `limit` in this bound's outward direction.
    fn exceeds(self, value: u64, limit: u64) -> bool {
        match self {
            Self::Min => value < limit,
            Self::Max => value > limit,
        }
    }

    fn outermost(self, a: u64, b: u64) -> u64 {
        match self {
            Self::Min => a.min(b),
            Self::Max => a.max(b),
        }
    }
}

/// One bound rewrite of one feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundEdit {
    pub feature_id: Uuid,
    pub old: u64,
    pub new: u64,
}

/// Plan the edits needed to move `bound` of `feature_id` to `new_value`.
///
/// The first edit is always the requested one (unless it is a no-op, in which
/// case the plan is empty). Fails with `InvalidInterval` if any planned edit
/// would leave a feature with `min >= max`.
pub fn propagate(
    tree: &FeatureTree,
    feature_id: Uuid,
    bound: Bound,
    new_value: u64,
    shrink_parent: bool,
) -> Result<Vec<BoundEdit>> {
    let node = tree.locate(feature_id)?;
    let mut planner = Planner {
        tree,
        bound,
        planned: HashMap::new(),
        edits: Vec::new(),
    };
    planner.visit(node, new_value, shrink_parent);
    planner.check_intervals()?;
    tracing::debug!(
        feature_id = %feature_id,
        bound = bound.as_str(),
        edits = planner.edits.len(),
        "planned bound propagation"
    );
    Ok(planner.edits)
}

struct Planner<'t> {
    tree: &'t FeatureTree,
    bound: Bound,
    planned: HashMap<NodeId, u64>,
    edits: Vec<BoundEdit>,
}

impl Planner<'_> {
    fn current(&self, node: NodeId) -> u64 {
        self.planned
            .get(&node)
            .copied()
            .unwrap_or_else(|| self.tree.node(node).bound(self.bound))
    }

    fn visit(&mut self, node: NodeId, new: u64, shrink_parent: bool) {
        let old = self.current(node);
        if old == new {
            return;
        }
        self.planned.insert(node, new);
        self.edits.push(BoundEdit {
            feature_id: self.tree.node(node).id,
            old,
            new,
        });

        let parent = self.tree.node(node).parent();
        if self.bound.expands(old, new) {
            if let Some(parent) = parent {
                if self.bound.exceeds(new, self.current(parent)) {
                    self.visit(parent, new, false);
                }
            }
            return;
        }

        for &child in self.tree.node(node).children() {
            if self.bound.exceeds(self.current(child), new) {
                self.visit(child, new, false);
            }
        }

        if !shrink_parent {
            return;
        }
        if let Some(parent) = parent {
            let tightest = self
                .tree
                .node(parent)
                .children()
                .iter()
                .filter(|&&sibling| sibling != node)
                .fold(new, |acc, &sibling| {
                    self.bound.outermost(acc, self.current(sibling))
                });
            self.visit(parent, tightest, true);
        }
    }

    fn check_intervals(&self) -> Result<()> {
        for (&node, &value) in &self.planned {
            let record = self.tree.node(node);
            let (min, max) = match self.bound {
                Bound::Min => (value, record.max),
                Bound::Max => (record.min, value),
            };
            if min >= max {
                return Err(ChangeError::InvalidInterval {
                    feature_id: record.id,
                    min,
                    max,
                });
            }
        }
        Ok(())
    }
}
