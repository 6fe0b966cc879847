use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::wire::{self, Envelope};
use super::{Change, ChangeType};
use crate::backend::{edit_feature, FeatureTarget};
use crate::error::{ChangeError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeChangeDetails {
    pub feature_id: Uuid,
    pub old_type: String,
    pub new_type: String,
}

/// Rewrites the `type` of one or more features. Each feature must still have
/// its recorded old type; a detail whose old and new types are equal succeeds
/// without touching the store.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeChange {
    pub assembly: Uuid,
    pub changes: Vec<TypeChangeDetails>,
}

impl TypeChange {
    pub fn new(assembly: Uuid, details: TypeChangeDetails) -> Self {
        Self {
            assembly,
            changes: vec![details],
        }
    }

    pub fn batch(assembly: Uuid, changes: Vec<TypeChangeDetails>) -> Result<Self> {
        if changes.is_empty() {
            return Err(ChangeError::malformed("a batch needs at least one change"));
        }
        Ok(Self { assembly, changes })
    }

    fn apply<T: FeatureTarget + ?Sized>(&self, target: &mut T) -> Result<()> {
        for details in &self.changes {
            edit_feature(target, details.feature_id, |tree, node| {
                let current = &tree.node(node).feature_type;
                if *current != details.old_type {
                    return Err(ChangeError::value_mismatch(
                        format!("feature {}", details.feature_id),
                        "type",
                        &details.old_type,
                        current,
                    ));
                }
                if details.old_type == details.new_type {
                    return Ok(false);
                }
                tree.set_type(node, details.new_type.clone());
                Ok(true)
            })?;
        }
        Ok(())
    }
}

impl ChangeType for TypeChange {
    const TYPE_NAME: &'static str = "TypeChange";

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
            .map(|d| TypeChangeDetails {
                feature_id: d.feature_id,
                old_type: d.new_type.clone(),
                new_type: d.old_type.clone(),
            })
            .collect();
        Ok(TypeChange {
            assembly: self.assembly,
            changes,
        }
        .into())
    }
}
