//! Tag → decoder tables for changes and operations.
//!
//! Registries are built explicitly at process start and handed around by
//! reference (or `Arc`). A tag can be registered once; decoding an unknown tag
//! fails with the error matching the registry's kind.

use std::collections::HashMap;
use std::fmt;

use serde_json::{Map, Value};

use crate::changes::Change;
use crate::error::{ChangeError, Result};
use crate::operations::Operation;

pub type Decoder<T> = fn(Map<String, Value>) -> Result<T>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryKind {
    Change,
    Operation,
}

pub struct Registry<T> {
    kind: RegistryKind,
    decoders: HashMap<String, Decoder<T>>,
}

pub type ChangeRegistry = Registry<Change>;
pub type OperationRegistry = Registry<Operation>;

impl<T> Registry<T> {
    pub fn new(kind: RegistryKind) -> Self {
        Self {
            kind,
            decoders: HashMap::new(),
        }
    }

    pub fn register(&mut self, type_name: &str, decoder: Decoder<T>) -> Result<()> {
        if self.decoders.contains_key(type_name) {
            return Err(ChangeError::DuplicateRegistration(type_name.to_string()));
        }
        self.decoders.insert(type_name.to_string(), decoder);
        Ok(())
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.decoders.contains_key(type_name)
    }

    /// Registered tags, sorted.
    pub fn type_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.decoders.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Decode a serialized command: read its `typeName`, find the decoder and
    /// hand it the remaining fields.
    pub fn decode(&self, payload: Value) -> Result<T> {
        let Value::Object(mut fields) = payload else {
            return Err(ChangeError::malformed("expected a JSON object"));
        };
        let type_name = match fields.remove("typeName") {
            Some(Value::String(name)) => name,
            Some(_) => return Err(ChangeError::malformed("typeName must be a string")),
            None => return Err(ChangeError::malformed("missing typeName")),
        };
        let decoder = self.decoders.get(&type_name).ok_or_else(|| match self.kind {
            RegistryKind::Change => ChangeError::UnknownChangeType(type_name.clone()),
            RegistryKind::Operation => ChangeError::UnknownOperationType(type_name.clone()),
        })?;
        decoder(fields)
    }
}

impl<T> fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("kind", &self.kind)
            .field("types", &self.type_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo(fields: Map<String, Value>) -> Result<Value> {
        Ok(Value::Object(fields))
    }

    #[test]
    fn duplicate_tags_are_refused() {
        let mut registry = Registry::<Value>::new(RegistryKind::Change);
        registry.register("EchoChange", echo).unwrap();
        assert!(matches!(
            registry.register("EchoChange", echo),
            Err(ChangeError::DuplicateRegistration(name)) if name == "EchoChange"
        ));
    }

    #[test]
    fn unknown_tags_follow_the_registry_kind() {
        let changes = Registry::<Value>::new(RegistryKind::Change);
        let operations = Registry::<Value>::new(RegistryKind::Operation);
        let payload = json!({ "typeName": "Nope" });
        assert!(matches!(
            changes.decode(payload.clone()),
            Err(ChangeError::UnknownChangeType(_))
        ));
        assert!(matches!(
            operations.decode(payload),
            Err(ChangeError::UnknownOperationType(_))
        ));
    }

    #[test]
    fn decoders_receive_fields_without_the_tag() {
        let mut registry = Registry::<Value>::new(RegistryKind::Operation);
        registry.register("EchoOperation", echo).unwrap();
        let decoded = registry
            .decode(json!({ "typeName": "EchoOperation", "x": 1 }))
            .unwrap();
        assert_eq!(decoded, json!({ "x": 1 }));
    }

    #[test]
    fn payload_shape_is_checked() {
        let registry = Registry::<Value>::new(RegistryKind::Change);
        assert!(matches!(registry.decode(json!([1])), Err(ChangeError::MalformedOperation(_))));
        assert!(matches!(registry.decode(json!({})), Err(ChangeError::MalformedOperation(_))));
        assert!(matches!(
            registry.decode(json!({ "typeName": 7 })),
            Err(ChangeError::MalformedOperation(_))
        ));
    }
}
