//! JSON field codecs shared by the concrete change types.
//!
//! Batched changes have two wire shapes. A batch of one is flattened into the
//! single-object form (shared fields and detail fields side by side); larger
//! batches carry the details in a `changes` array next to the shared fields.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{ChangeError, Result};

/// Fields every batched change carries alongside its details.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Envelope {
    pub assembly: Uuid,
    /// Emitted for consumers of the log; recomputed from details on decode.
    #[serde(default, skip_deserializing)]
    pub changed_ids: Vec<Uuid>,
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Map<String, Value>> {
    match serde_json::to_value(value)? {
        Value::Object(fields) => Ok(fields),
        other => Err(ChangeError::malformed(format!(
            "expected an object payload, got {}",
            other
        ))),
    }
}

pub(crate) fn decode<T: DeserializeOwned>(fields: Map<String, Value>) -> Result<T> {
    serde_json::from_value(Value::Object(fields)).map_err(|e| ChangeError::malformed(e.to_string()))
}

pub(crate) fn encode_batched<D: Serialize>(
    envelope: &Envelope,
    details: &[D],
) -> Result<Map<String, Value>> {
    let mut fields = encode(envelope)?;
    match details {
        [] => return Err(ChangeError::malformed("a batch needs at least one change")),
        [single] => fields.extend(encode(single)?),
        many => {
            let encoded = many
                .iter()
                .map(|detail| encode(detail).map(Value::Object))
                .collect::<Result<Vec<_>>>()?;
            fields.insert("changes".to_string(), Value::Array(encoded));
        }
    }
    Ok(fields)
}

pub(crate) fn decode_batched<D: DeserializeOwned>(
    mut fields: Map<String, Value>,
) -> Result<(Envelope, Vec<D>)> {
    let Some(batch) = fields.remove("changes") else {
        let envelope = decode(fields.clone())?;
        let detail = decode(fields)?;
        return Ok((envelope, vec![detail]));
    };
    let Value::Array(entries) = batch else {
        return Err(ChangeError::malformed("changes must be an array"));
    };
    if entries.is_empty() {
        return Err(ChangeError::malformed("changes must not be empty"));
    }
    let envelope = decode(fields)?;
    let details = entries
        .into_iter()
        .map(|entry| match entry {
            Value::Object(detail) => decode(detail),
            _ => Err(ChangeError::malformed("each batched change must be an object")),
        })
        .collect::<Result<Vec<D>>>()?;
    Ok((envelope, details))
}
