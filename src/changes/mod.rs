//! Serializable mutation commands.
//!
//! Every concrete change type implements [`ChangeType`]: a wire tag, payload
//! codecs, one execution method per backend kind and an inverse. The closed
//! set of shipped types is declared once in the `change_types!` list below,
//! which generates the [`Change`] enum, its dispatch methods and the builtin
//! registry entries.
//!
//! # Wire format
//!
//! A serialized change is a JSON object with a `typeName` tag and the type's
//! camelCase fields. Types that edit several features at once accept either a
//! single-object form or a `changes` array next to the shared `assembly` and
//! `changedIds` fields; a batch of one is always written in the single form.

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::backend::{Backend, ClientDataStore, FlatFileStore, ServerTarget};
use crate::error::Result;
use crate::registry::{ChangeRegistry, RegistryKind};

/// Implements the three backend methods of a feature-level change by
/// delegating to its `apply` over [`crate::backend::FeatureTarget`].
macro_rules! execute_on_feature_targets {
    () => {
        fn execute_on_server(
            &self,
            target: &mut crate::backend::ServerTarget<'_>,
        ) -> crate::error::Result<()> {
            self.apply(target)
        }

        fn execute_on_client(
            &self,
            store: &mut crate::backend::ClientDataStore,
        ) -> crate::error::Result<()> {
            self.apply(store)
        }

        fn execute_on_flat_file(
            &self,
            store: &mut crate::backend::FlatFileStore,
        ) -> crate::error::Result<()> {
            self.apply(store)
        }
    };
}

mod assembly;
mod attribute;
mod discontinuous;
mod feature;
mod location;
mod merge;
mod strand;
mod type_change;
pub(crate) mod wire;

pub use assembly::{
    AddAssemblyChange, AddAssemblyFromFileChange, AddFeaturesFromFileChange,
    AddRefSeqAliasesChange, DeleteAssemblyChange, RefSeqAliases,
};
pub use attribute::{FeatureAttributeChange, FeatureAttributeChangeDetails};
pub use discontinuous::{DiscontinuousLocationChange, DiscontinuousLocationChangeDetails};
pub use feature::{AddFeatureChange, DeleteFeatureChange};
pub use location::{
    LocationEndChange, LocationEndChangeDetails, LocationStartChange, LocationStartChangeDetails,
};
pub use merge::{merge_transcripts, MergeTranscriptsChange, SplitTranscriptsChange};
pub use strand::{StrandChange, StrandChangeDetails};
pub use type_change::{TypeChange, TypeChangeDetails};

/// Behaviour shared by every concrete change type.
pub trait ChangeType: Sized {
    const TYPE_NAME: &'static str;

    fn assembly(&self) -> Uuid;

    /// Ids of the features this change touches, for the change log.
    fn changed_ids(&self) -> Vec<Uuid>;

    /// Type-specific fields, without `typeName`.
    fn to_payload(&self) -> Result<Map<String, Value>>;

    fn from_payload(fields: Map<String, Value>) -> Result<Self>;

    fn execute_on_server(&self, target: &mut ServerTarget<'_>) -> Result<()>;

    fn execute_on_client(&self, store: &mut ClientDataStore) -> Result<()>;

    fn execute_on_flat_file(&self, store: &mut FlatFileStore) -> Result<()>;

    /// A change that, run right after this one, restores the prior state.
    fn inverse(&self) -> Result<Change>;

    /// Whether applying this change twice is a success rather than a conflict.
    fn is_idempotent(&self) -> bool {
        false
    }
}

macro_rules! change_types {
    ($($variant:ident($ty:ty)),+ $(,)?) => {
        #[derive(Debug, Clone, PartialEq)]
        pub enum Change {
            $($variant($ty)),+
        }

        $(
            impl From<$ty> for Change {
                fn from(change: $ty) -> Self {
                    Change::$variant(change)
                }
            }
        )+

        impl Change {
            pub fn type_name(&self) -> &'static str {
                match self {
                    $(Change::$variant(_) => <$ty as ChangeType>::TYPE_NAME),+
                }
            }

            pub fn assembly(&self) -> Uuid {
                match self {
                    $(Change::$variant(change) => change.assembly()),+
                }
            }

            pub fn changed_ids(&self) -> Vec<Uuid> {
                match self {
                    $(Change::$variant(change) => change.changed_ids()),+
                }
            }

            fn payload(&self) -> Result<Map<String, Value>> {
                match self {
                    $(Change::$variant(change) => change.to_payload()),+
                }
            }

            fn execute_on_server(&self, target: &mut ServerTarget<'_>) -> Result<()> {
                match self {
                    $(Change::$variant(change) => change.execute_on_server(target)),+
                }
            }

            fn execute_on_client(&self, store: &mut ClientDataStore) -> Result<()> {
                match self {
                    $(Change::$variant(change) => change.execute_on_client(store)),+
                }
            }

            fn execute_on_flat_file(&self, store: &mut FlatFileStore) -> Result<()> {
                match self {
                    $(Change::$variant(change) => change.execute_on_flat_file(store)),+
                }
            }

            pub fn inverse(&self) -> Result<Change> {
                match self {
                    $(Change::$variant(change) => change.inverse()),+
                }
            }

            pub fn is_idempotent(&self) -> bool {
                match self {
                    $(Change::$variant(change) => change.is_idempotent()),+
                }
            }
        }

        impl ChangeRegistry {
            /// A registry holding every shipped change type.
            pub fn with_builtin_changes() -> Result<Self> {
                let mut registry = ChangeRegistry::new(RegistryKind::Change);
                $(
                    registry.register(<$ty as ChangeType>::TYPE_NAME, |fields| {
                        <$ty as ChangeType>::from_payload(fields).map(Change::$variant)
                    })?;
                )+
                Ok(registry)
            }
        }
    };
}

change_types! {
    AddAssembly(AddAssemblyChange),
    AddAssemblyFromFile(AddAssemblyFromFileChange),
    DeleteAssembly(DeleteAssemblyChange),
    AddRefSeqAliases(AddRefSeqAliasesChange),
    AddFeaturesFromFile(AddFeaturesFromFileChange),
    AddFeature(AddFeatureChange),
    DeleteFeature(DeleteFeatureChange),
    LocationStart(LocationStartChange),
    LocationEnd(LocationEndChange),
    DiscontinuousLocation(DiscontinuousLocationChange),
    Type(TypeChange),
    Strand(StrandChange),
    FeatureAttribute(FeatureAttributeChange),
    MergeTranscripts(MergeTranscriptsChange),
    SplitTranscripts(SplitTranscriptsChange),
}

impl Change {
    /// Decode a serialized change through `registry`.
    pub fn from_serialized(registry: &ChangeRegistry, payload: Value) -> Result<Change> {
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

    /// Run the change on `backend`. Flat files are edited through a draft
    /// copy, so a failing batch leaves the document as it was.
    pub fn execute(&self, backend: Backend<'_, '_>) -> Result<()> {
        tracing::debug!(
            type_name = self.type_name(),
            backend = backend.name(),
            "executing change"
        );
        match backend {
            Backend::Server(target) => self.execute_on_server(target),
            Backend::Client(store) => self.execute_on_client(store),
            Backend::FlatFile(store) => {
                let mut draft = store.clone();
                self.execute_on_flat_file(&mut draft)?;
                *store = draft;
                Ok(())
            }
        }
    }
}

impl Serialize for Change {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json()
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}
