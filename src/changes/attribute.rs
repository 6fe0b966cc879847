use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::wire::{self, Envelope};
use super::{Change, ChangeType};
use crate::backend::{edit_feature, FeatureTarget};
use crate::error::{ChangeError, Result};
use crate::models::Attributes;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureAttributeChangeDetails {
    pub feature_id: Uuid,
    pub old_attributes: Attributes,
    pub new_attributes: Attributes,
}

/// Replaces a feature's whole attribute map.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureAttributeChange {
    pub assembly: Uuid,
    pub changes: Vec<FeatureAttributeChangeDetails>,
}

impl FeatureAttributeChange {
    pub fn new(assembly: Uuid, details: FeatureAttributeChangeDetails) -> Self {
        Self {
            assembly,
            changes: vec![details],
        }
    }

    pub fn batch(assembly: Uuid, changes: Vec<FeatureAttributeChangeDetails>) -> Result<Self> {
        if changes.is_empty() {
            return Err(ChangeError::malformed("a batch needs at least one change"));
        }
        Ok(Self { assembly, changes })
    }

    fn apply<T: FeatureTarget + ?Sized>(&self, target: &mut T) -> Result<()> {
        for details in &self.changes {
            edit_feature(target, details.feature_id, |tree, node| {
                let current = &tree.node(node).attributes;
                if *current != details.old_attributes {
                    return Err(ChangeError::value_mismatch(
                        format!("feature {}", details.feature_id),
                        "attributes",
                        &details.old_attributes,
                        current,
                    ));
                }
                if details.old_attributes == details.new_attributes {
                    return Ok(false);
                }
                tree.set_attributes(node, details.new_attributes.clone());
                Ok(true)
            })?;
        }
        Ok(())
    }
}

impl ChangeType for FeatureAttributeChange {
    const TYPE_NAME: &'static str = "FeatureAttributeChange";

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
            .map(|d| FeatureAttributeChangeDetails {
                feature_id: d.feature_id,
                old_attributes: d.new_attributes.clone(),
                new_attributes: d.old_attributes.clone(),
            })
            .collect();
        Ok(FeatureAttributeChange {
            assembly: self.assembly,
            changes,
        }
        .into())
    }
}
