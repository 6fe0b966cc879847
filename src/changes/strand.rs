use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::wire::{self, Envelope};
use super::{Change, ChangeType};
use crate::backend::{edit_feature, FeatureTarget};
use crate::error::{ChangeError, Result};
use crate::models::Strand;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrandChangeDetails {
    pub feature_id: Uuid,
    pub old_strand: Option<Strand>,
    pub new_strand: Option<Strand>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StrandChange {
    pub assembly: Uuid,
    pub changes: Vec<StrandChangeDetails>,
}

impl StrandChange {
    pub fn new(assembly: Uuid, details: StrandChangeDetails) -> Self {
        Self {
            assembly,
            changes: vec![details],
        }
    }

    pub fn batch(assembly: Uuid, changes: Vec<StrandChangeDetails>) -> Result<Self> {
        if changes.is_empty() {
            return Err(ChangeError::malformed("a batch needs at least one change"));
        }
        Ok(Self { assembly, changes })
    }

    fn apply<T: FeatureTarget + ?Sized>(&self, target: &mut T) -> Result<()> {
        for details in &self.changes {
            edit_feature(target, details.feature_id, |tree, node| {
                let current = tree.node(node).strand;
                if current != details.old_strand {
                    return Err(ChangeError::value_mismatch(
                        format!("feature {}", details.feature_id),
                        "strand",
                        details.old_strand,
                        current,
                    ));
                }
                if details.old_strand == details.new_strand {
                    return Ok(false);
                }
                tree.set_strand(node, details.new_strand);
                Ok(true)
            })?;
        }
        Ok(())
    }
}

impl ChangeType for StrandChange {
    const TYPE_NAME: &'static str = "StrandChange";

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
            .map(|d| StrandChangeDetails {
                feature_id: d.feature_id,
                old_strand: d.new_strand,
                new_strand: d.old_strand,
            })
            .collect();
        Ok(StrandChange {
            assembly: self.assembly,
            changes,
        }
        .into())
    }
}
