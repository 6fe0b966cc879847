//! Read-only operations.
//!
//! Operations share the wire format and registry machinery of changes but
//! never mutate anything. They run against the authoritative store and the
//! flat-file store; a client answers reads from its own copy and has no use
//! for them.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::backend::{Backend, DocumentStore, FlatFileStore};
use crate::changes::wire;
use crate::error::{ChangeError, Result};
use crate::models::{stitch_sequence, AnnotationFeature, Assembly, RefSeq};
use crate::registry::{OperationRegistry, RegistryKind};

/// What an operation returns. Serialized untagged, so each variant is the
/// plain JSON value a caller expects.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OperationOutput {
    Assemblies(Vec<Assembly>),
    RefSeqs(Vec<RefSeq>),
    Features(Vec<AnnotationFeature>),
    Sequence(String),
}

pub trait OperationType: Sized + Serialize + DeserializeOwned {
    const TYPE_NAME: &'static str;

    fn from_payload(fields: Map<String, Value>) -> Result<Self> {
        wire::decode(fields)
    }

    fn execute_on_server(&self, store: &dyn DocumentStore) -> Result<OperationOutput>;

    fn execute_on_flat_file(&self, store: &FlatFileStore) -> Result<OperationOutput>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetAssembliesOperation {}

impl OperationType for GetAssembliesOperation {
    const TYPE_NAME: &'static str = "GetAssembliesOperation";

    fn execute_on_server(&self, store: &dyn DocumentStore) -> Result<OperationOutput> {
        Ok(OperationOutput::Assemblies(store.find_assemblies()?))
    }

    fn execute_on_flat_file(&self, store: &FlatFileStore) -> Result<OperationOutput> {
        Ok(OperationOutput::Assemblies(vec![store.assembly.clone()]))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetRefSeqsOperation {
    pub assembly: Uuid,
}

impl OperationType for GetRefSeqsOperation {
    const TYPE_NAME: &'static str = "GetRefSeqsOperation";

    fn execute_on_server(&self, store: &dyn DocumentStore) -> Result<OperationOutput> {
        if store.find_assembly(self.assembly)?.is_none() {
            return Err(ChangeError::AssemblyNotFound(self.assembly.to_string()));
        }
        Ok(OperationOutput::RefSeqs(store.find_ref_seqs(self.assembly)?))
    }

    fn execute_on_flat_file(&self, store: &FlatFileStore) -> Result<OperationOutput> {
        if store.assembly.id != self.assembly {
            return Err(ChangeError::AssemblyNotFound(self.assembly.to_string()));
        }
        Ok(OperationOutput::RefSeqs(store.ref_seqs().cloned().collect()))
    }
}

/// Checks a `[start, end)` window and clamps its end to the sequence length.
fn window(ref_seq: &RefSeq, start: u64, end: u64) -> Result<(u64, u64)> {
    if start >= end {
        return Err(ChangeError::malformed(format!(
            "window start {} must be less than end {}",
            start, end
        )));
    }
    Ok((start, end.min(ref_seq.length)))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetRefSeqFeaturesOperation {
    pub ref_seq: Uuid,
    pub start: u64,
    pub end: u64,
}

impl OperationType for GetRefSeqFeaturesOperation {
    const TYPE_NAME: &'static str = "GetRefSeqFeaturesOperation";

    fn execute_on_server(&self, store: &dyn DocumentStore) -> Result<OperationOutput> {
        let ref_seq = store
            .find_ref_seq(self.ref_seq)?
            .ok_or_else(|| ChangeError::RefSeqNotFound(self.ref_seq.to_string()))?;
        let (start, end) = window(&ref_seq, self.start, self.end)?;
        Ok(OperationOutput::Features(
            store.find_features_in_range(ref_seq.id, start, end)?,
        ))
    }

    fn execute_on_flat_file(&self, store: &FlatFileStore) -> Result<OperationOutput> {
        let ref_seq = store
            .ref_seq(self.ref_seq)
            .ok_or_else(|| ChangeError::RefSeqNotFound(self.ref_seq.to_string()))?;
        let (start, end) = window(ref_seq, self.start, self.end)?;
        Ok(OperationOutput::Features(
            store.features_in_range(ref_seq.id, start, end),
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetSequenceOperation {
    pub ref_seq: Uuid,
    pub start: u64,
    pub end: u64,
}

impl OperationType for GetSequenceOperation {
    const TYPE_NAME: &'static str = "GetSequenceOperation";

    fn execute_on_server(&self, store: &dyn DocumentStore) -> Result<OperationOutput> {
        let ref_seq = store
            .find_ref_seq(self.ref_seq)?
            .ok_or_else(|| ChangeError::RefSeqNotFound(self.ref_seq.to_string()))?;
        let (start, end) = window(&ref_seq, self.start, self.end)?;
        if start >= end {
            return Ok(OperationOutput::Sequence(String::new()));
        }
        let size = ref_seq.chunk_size.max(1);
        let chunks = store.find_chunks(ref_seq.id, start / size, (end - 1) / size)?;
        Ok(OperationOutput::Sequence(stitch_sequence(
            &chunks, size, start, end,
        )))
    }

    fn execute_on_flat_file(&self, _store: &FlatFileStore) -> Result<OperationOutput> {
        Err(ChangeError::unsupported(Self::TYPE_NAME, "flat file"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchFeaturesOperation {
    pub assembly: Uuid,
    pub term: String,
}

impl OperationType for SearchFeaturesOperation {
    const TYPE_NAME: &'static str = "SearchFeaturesOperation";

    fn execute_on_server(&self, store: &dyn DocumentStore) -> Result<OperationOutput> {
        if self.term.is_empty() {
            return Err(ChangeError::malformed("search term must not be empty"));
        }
        Ok(OperationOutput::Features(
            store.search_features(self.assembly, &self.term)?,
        ))
    }

    fn execute_on_flat_file(&self, store: &FlatFileStore) -> Result<OperationOutput> {
        if self.term.is_empty() {
            return Err(ChangeError::malformed("search term must not be empty"));
        }
        if store.assembly.id != self.assembly {
            return Err(ChangeError::AssemblyNotFound(self.assembly.to_string()));
        }
        Ok(OperationOutput::Features(store.search(&self.term)))
    }
}

macro_rules! operation_types {
    ($($variant:ident($ty:ty)),+ $(,)?) => {
        #[derive(Debug, Clone, PartialEq)]
        pub enum Operation {
            $($variant($ty)),+
        }

        $(
            impl From<$ty> for Operation {
                fn from(operation: $ty) -> Self {
                    Operation::$variant(operation)
                }
            }
        )+

        impl Operation {
            pub fn type_name(&self) -> &'static str {
                match self {
                    $(Operation::$variant(_) => <$ty as OperationType>::TYPE_NAME),+
                }
            }

            fn payload(&self) -> Result<Map<String, Value>> {
                match self {
                    $(Operation::$variant(operation) => wire::encode(operation)),+
                }
            }

            /// Run against the authoritative store directly.
            pub fn execute_on_store(&self, store: &dyn DocumentStore) -> Result<OperationOutput> {
                match self {
                    $(Operation::$variant(operation) => operation.execute_on_server(store)),+
                }
            }

            fn execute_on_flat_file(&self, store: &FlatFileStore) -> Result<OperationOutput> {
                match self {
                    $(Operation::$variant(operation) => operation.execute_on_flat_file(store)),+
                }
            }
        }

        impl OperationRegistry {
            /// A registry holding every shipped operation type.
            pub fn with_builtin_operations() -> Result<Self> {
                let mut registry = OperationRegistry::new(RegistryKind::Operation);
                $(
                    registry.register(<$ty as OperationType>::TYPE_NAME, |fields| {
                        <$ty as OperationType>::from_payload(fields).map(Operation::$variant)
                    })?;
                )+
                Ok(registry)
            }
        }
    };
}

operation_types! {
    GetAssemblies(GetAssembliesOperation),
    GetRefSeqs(GetRefSeqsOperation),
    GetRefSeqFeatures(GetRefSeqFeaturesOperation),
    GetSequence(GetSequenceOperation),
    SearchFeatures(SearchFeaturesOperation),
}

impl Operation {
    pub fn from_serialized(registry: &OperationRegistry, payload: Value) -> Result<Operation> {
        registry.decode(payload)
    }

    pub fn to_json(&self) -> Result<Value> {
        let mut fields = self.payload()?;
        fields.insert(
            "typeName".to_string(),
            Value::String(self.type_name().to_string()),
        );
        Ok(Value::Object(fields))
    }

    pub fn execute(&self, backend: Backend<'_, '_>) -> Result<OperationOutput> {
        tracing::debug!(
            type_name = self.type_name(),
            backend = backend.name(),
            "executing operation"
        );
        match backend {
            Backend::Server(target) => self.execute_on_store(target.uow.store()),
            Backend::FlatFile(store) => self.execute_on_flat_file(store),
            Backend::Client(_) => Err(ChangeError::unsupported(self.type_name(), "client")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ClientDataStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn registry() -> OperationRegistry {
        OperationRegistry::with_builtin_operations().unwrap()
    }

    fn flat_file() -> FlatFileStore {
        let assembly = Assembly {
            id: Uuid::new_v4(),
            name: "vv1".into(),
            aliases: vec![],
            comments: vec![],
            user: "tester".into(),
            created_at: chrono::Utc::now(),
        };
        let gff = "##sequence-region ctgA 1 1000\n\
                   ctgA\t.\tgene\t101\t200\t.\t+\t.\tID=g1;Name=EDEN\n\
                   ctgA\t.\tgene\t501\t600\t.\t-\t.\tID=g2\n";
        FlatFileStore::from_gff3(assembly, gff.as_bytes()).unwrap()
    }

    #[test]
    fn decodes_through_the_registry() {
        let id = Uuid::new_v4();
        let operation = Operation::from_serialized(
            &registry(),
            json!({ "typeName": "GetRefSeqFeaturesOperation", "refSeq": id, "start": 0, "end": 10 }),
        )
        .unwrap();
        assert_eq!(
            operation,
            Operation::GetRefSeqFeatures(GetRefSeqFeaturesOperation {
                ref_seq: id,
                start: 0,
                end: 10
            })
        );
        assert_eq!(
            Operation::from_serialized(&registry(), operation.to_json().unwrap()).unwrap(),
            operation
        );
    }

    #[test]
    fn unknown_tags_are_unknown_operations() {
        let err = Operation::from_serialized(&registry(), json!({ "typeName": "DropEverything" }))
            .unwrap_err();
        assert!(matches!(err, ChangeError::UnknownOperationType(name) if name == "DropEverything"));
    }

    #[test]
    fn missing_fields_are_malformed() {
        let err = Operation::from_serialized(
            &registry(),
            json!({ "typeName": "GetSequenceOperation", "start": 1 }),
        )
        .unwrap_err();
        assert!(matches!(err, ChangeError::MalformedOperation(_)));
    }

    #[test]
    fn flat_file_windows_and_search() {
        let mut store = flat_file();
        let ref_seq = store.ref_seqs().next().unwrap().id;
        let window: Operation = GetRefSeqFeaturesOperation {
            ref_seq,
            start: 150,
            end: 520,
        }
        .into();
        let OperationOutput::Features(found) = window.execute(Backend::FlatFile(&mut store)).unwrap()
        else {
            panic!("expected features");
        };
        assert_eq!(found.iter().map(|f| f.min).collect::<Vec<_>>(), vec![100, 500]);

        let search: Operation = SearchFeaturesOperation {
            assembly: store.assembly.id,
            term: "eden".into(),
        }
        .into();
        let OperationOutput::Features(found) = search.execute(Backend::FlatFile(&mut store)).unwrap()
        else {
            panic!("expected features");
        };
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn sequence_is_not_available_from_flat_files() {
        let mut store = flat_file();
        let ref_seq = store.ref_seqs().next().unwrap().id;
        let operation: Operation = GetSequenceOperation {
            ref_seq,
            start: 0,
            end: 10,
        }
        .into();
        assert!(matches!(
            operation.execute(Backend::FlatFile(&mut store)),
            Err(ChangeError::UnsupportedBackend { backend: "flat file", .. })
        ));
    }

    #[test]
    fn clients_do_not_run_operations() {
        let mut store = ClientDataStore::new();
        let operation: Operation = GetAssembliesOperation {}.into();
        assert!(matches!(
            operation.execute(Backend::Client(&mut store)),
            Err(ChangeError::UnsupportedBackend { backend: "client", .. })
        ));
    }
}
