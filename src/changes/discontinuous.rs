use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::wire::{self, Envelope};
use super::{Change, ChangeType};
use crate::backend::{edit_feature, FeatureTarget};
use crate::error::{ChangeError, Result};
use crate::models::Location;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscontinuousLocationChangeDetails {
    pub feature_id: Uuid,
    pub index: usize,
    pub old_location: Location,
    pub new_location: Location,
}

/// Rewrites one sub-interval of a spliced feature. Moving the first
/// sub-interval's start moves the feature's `min`; moving the last one's end
/// moves its `max`.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscontinuousLocationChange {
    pub assembly: Uuid,
    pub changes: Vec<DiscontinuousLocationChangeDetails>,
}

impl DiscontinuousLocationChange {
    pub fn new(assembly: Uuid, details: DiscontinuousLocationChangeDetails) -> Self {
        Self {
            assembly,
            changes: vec![details],
        }
    }

    pub fn batch(assembly: Uuid, changes: Vec<DiscontinuousLocationChangeDetails>) -> Result<Self> {
        if changes.is_empty() {
            return Err(ChangeError::malformed("a batch needs at least one change"));
        }
        Ok(Self { assembly, changes })
    }

    fn apply<T: FeatureTarget + ?Sized>(&self, target: &mut T) -> Result<()> {
        for details in &self.changes {
            edit_feature(target, details.feature_id, |tree, node| {
                let record = tree.node(node);
                let mut locations = record.discontinuous_locations.clone();
                let last = locations.len().checked_sub(1).ok_or_else(|| {
                    ChangeError::malformed(format!(
                        "feature {} has no discontinuous locations",
                        details.feature_id
                    ))
                })?;
                let current = *locations.get(details.index).ok_or_else(|| {
                    ChangeError::malformed(format!(
                        "feature {} has no location at index {}",
                        details.feature_id, details.index
                    ))
                })?;
                for (bound, expected, found) in [
                    ("location start", details.old_location.start, current.start),
                    ("location end", details.old_location.end, current.end),
                ] {
                    if expected != found {
                        return Err(ChangeError::LocationMismatch {
                            feature_id: details.feature_id,
                            bound,
                            expected,
                            found,
                        });
                    }
                }

                let (mut min, mut max) = (record.min, record.max);
                locations[details.index] = details.new_location;
                if details.index == 0 {
                    min = details.new_location.start;
                }
                if details.index == last {
                    max = details.new_location.end;
                }
                tree.set_discontinuous_locations(node, locations);
                tree.set_bound(node, crate::tree::Bound::Min, min);
                tree.set_bound(node, crate::tree::Bound::Max, max);
                tree.validate()?;
                Ok(true)
            })?;
        }
        Ok(())
    }
}

impl ChangeType for DiscontinuousLocationChange {
    const TYPE_NAME: &'static str = "DiscontinuousLocationChange";

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
        let changes = self
            .changes
            .iter()
            .rev()
            .map(|d| DiscontinuousLocationChangeDetails {
                feature_id: d.feature_id,
                index: d.index,
                old_location: d.new_location,
                new_location: d.old_location,
            })
            .collect();
        Ok(DiscontinuousLocationChange {
            assembly: self.assembly,
            changes,
        }
        .into())
    }
}
