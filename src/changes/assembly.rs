//! Assembly-level changes: creating and deleting assemblies, attaching
//! reference sequence aliases and bulk-importing features.
//!
//! Changes that read an uploaded file only run on the server; a client does
//! not hold the file and re-fetches once the change is broadcast, so their
//! client execution does nothing.

use std::io::BufReader;

use chrono::Utc;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::wire;
use super::{Change, ChangeType};
use crate::backend::{ClientAssembly, ClientDataStore, FeatureTarget, FlatFileStore, ServerTarget};
use crate::error::{ChangeError, Result};
use crate::models::{chunk_sequence, Assembly, RefSeq};
use crate::parse::{read_fasta, read_gff3};

fn new_assembly(id: Uuid, name: &str, user: &str) -> Assembly {
    Assembly {
        id,
        name: name.to_string(),
        aliases: Vec::new(),
        comments: Vec::new(),
        user: user.to_string(),
        created_at: Utc::now(),
    }
}

fn ensure_new_assembly(target: &ServerTarget<'_>, id: Uuid, name: &str) -> Result<()> {
    if target.uow.find_assembly(id)?.is_some() {
        return Err(ChangeError::AlreadyExists(format!("assembly {}", id)));
    }
    if target.uow.find_assembly_by_name(name)?.is_some() {
        return Err(ChangeError::AlreadyExists(format!("assembly \"{}\"", name)));
    }
    Ok(())
}

fn with_changed_ids<T: Serialize>(change: &T, ids: Vec<Uuid>) -> Result<Map<String, Value>> {
    let mut fields = wire::encode(change)?;
    fields.insert("changedIds".to_string(), serde_json::to_value(ids)?);
    Ok(fields)
}

/// Creates an assembly whose reference sequences are given inline as
/// `name → length`, with no sequence payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddAssemblyChange {
    pub assembly: Uuid,
    #[serde(alias = "name")]
    pub assembly_name: String,
    pub sequences: IndexMap<String, u64>,
}

impl AddAssemblyChange {
    pub fn new(
        assembly: Uuid,
        name: impl Into<String>,
        sequences: impl IntoIterator<Item = (String, u64)>,
    ) -> Self {
        Self {
            assembly,
            assembly_name: name.into(),
            sequences: sequences.into_iter().collect(),
        }
    }

    fn ref_seqs(&self) -> Vec<RefSeq> {
        self.sequences
            .iter()
            .map(|(name, length)| RefSeq::new(self.assembly, name.clone(), *length))
            .collect()
    }
}

impl ChangeType for AddAssemblyChange {
    const TYPE_NAME: &'static str = "AddAssemblyChange";

    fn assembly(&self) -> Uuid {
        self.assembly
    }

    fn changed_ids(&self) -> Vec<Uuid> {
        Vec::new()
    }

    fn to_payload(&self) -> Result<Map<String, Value>> {
        with_changed_ids(self, Vec::new())
    }

    fn from_payload(fields: Map<String, Value>) -> Result<Self> {
        wire::decode(fields)
    }

    fn execute_on_server(&self, target: &mut ServerTarget<'_>) -> Result<()> {
        ensure_new_assembly(target, self.assembly, &self.assembly_name)?;
        let assembly = new_assembly(self.assembly, &self.assembly_name, &target.user);
        target.uow.create_assembly(assembly);
        for ref_seq in self.ref_seqs() {
            target.uow.create_ref_seq(ref_seq);
        }
        Ok(())
    }

    fn execute_on_client(&self, store: &mut ClientDataStore) -> Result<()> {
        let assembly = new_assembly(self.assembly, &self.assembly_name, "");
        store.insert_assembly(ClientAssembly::new(assembly, self.ref_seqs()))
    }

    fn execute_on_flat_file(&self, _store: &mut FlatFileStore) -> Result<()> {
        Err(ChangeError::unsupported(Self::TYPE_NAME, "flat file"))
    }

    fn inverse(&self) -> Result<Change> {
        Ok(DeleteAssemblyChange {
            assembly: self.assembly,
        }
        .into())
    }
}

/// Creates an assembly from an uploaded FASTA file, storing each sequence in
/// fixed-size chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddAssemblyFromFileChange {
    pub assembly: Uuid,
    pub assembly_name: String,
    pub file_id: String,
}

impl ChangeType for AddAssemblyFromFileChange {
    const TYPE_NAME: &'static str = "AddAssemblyFromFileChange";

    fn assembly(&self) -> Uuid {
        self.assembly
    }

    fn changed_ids(&self) -> Vec<Uuid> {
        Vec::new()
    }

    fn to_payload(&self) -> Result<Map<String, Value>> {
        with_changed_ids(self, Vec::new())
    }

    fn from_payload(fields: Map<String, Value>) -> Result<Self> {
        wire::decode(fields)
    }

    fn execute_on_server(&self, target: &mut ServerTarget<'_>) -> Result<()> {
        ensure_new_assembly(target, self.assembly, &self.assembly_name)?;
        let sequences = read_fasta(target.blobs.open(&self.file_id)?)?;
        let assembly = new_assembly(self.assembly, &self.assembly_name, &target.user);
        target.uow.create_assembly(assembly);
        for fasta in sequences {
            let mut ref_seq = RefSeq::new(self.assembly, fasta.name, fasta.sequence.len() as u64);
            ref_seq.description = fasta.description;
            let chunks = chunk_sequence(ref_seq.id, &fasta.sequence, ref_seq.chunk_size);
            tracing::debug!(
                ref_seq = %ref_seq.name,
                length = ref_seq.length,
                chunks = chunks.len(),
                "imported sequence"
            );
            target.uow.create_ref_seq(ref_seq);
            for chunk in chunks {
                target.uow.create_chunk(chunk);
            }
        }
        Ok(())
    }

    fn execute_on_client(&self, _store: &mut ClientDataStore) -> Result<()> {
        Ok(())
    }

    fn execute_on_flat_file(&self, _store: &mut FlatFileStore) -> Result<()> {
        Err(ChangeError::unsupported(Self::TYPE_NAME, "flat file"))
    }

    fn inverse(&self) -> Result<Change> {
        Ok(DeleteAssemblyChange {
            assembly: self.assembly,
        }
        .into())
    }
}

/// Removes an assembly with everything it owns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteAssemblyChange {
    pub assembly: Uuid,
}

impl ChangeType for DeleteAssemblyChange {
    const TYPE_NAME: &'static str = "DeleteAssemblyChange";

    fn assembly(&self) -> Uuid {
        self.assembly
    }

    fn changed_ids(&self) -> Vec<Uuid> {
        Vec::new()
    }

    fn to_payload(&self) -> Result<Map<String, Value>> {
        with_changed_ids(self, Vec::new())
    }

    fn from_payload(fields: Map<String, Value>) -> Result<Self> {
        wire::decode(fields)
    }

    fn execute_on_server(&self, target: &mut ServerTarget<'_>) -> Result<()> {
        if target.uow.find_assembly(self.assembly)?.is_none() {
            return Err(ChangeError::AssemblyNotFound(self.assembly.to_string()));
        }
        target.uow.delete_assembly(self.assembly);
        Ok(())
    }

    fn execute_on_client(&self, store: &mut ClientDataStore) -> Result<()> {
        store.remove_assembly(self.assembly)
    }

    fn execute_on_flat_file(&self, _store: &mut FlatFileStore) -> Result<()> {
        Err(ChangeError::unsupported(Self::TYPE_NAME, "flat file"))
    }

    fn inverse(&self) -> Result<Change> {
        Err(ChangeError::InverseNotImplemented(Self::TYPE_NAME))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefSeqAliases {
    pub ref_name: String,
    pub aliases: Vec<String>,
    pub old_aliases: Vec<String>,
}

impl RefSeqAliases {
    fn replace_on(&self, ref_seq: &mut RefSeq) -> Result<()> {
        if ref_seq.aliases != self.old_aliases {
            return Err(ChangeError::value_mismatch(
                format!("reference sequence {}", self.ref_name),
                "aliases",
                &self.old_aliases,
                &ref_seq.aliases,
            ));
        }
        ref_seq.aliases = self.aliases.clone();
        Ok(())
    }
}

/// Replaces the alias lists of reference sequences, found by name. Each list
/// must still equal its recorded `oldAliases`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddRefSeqAliasesChange {
    pub assembly: Uuid,
    pub ref_seq_aliases: Vec<RefSeqAliases>,
}

impl ChangeType for AddRefSeqAliasesChange {
    const TYPE_NAME: &'static str = "AddRefSeqAliasesChange";

    fn assembly(&self) -> Uuid {
        self.assembly
    }

    fn changed_ids(&self) -> Vec<Uuid> {
        Vec::new()
    }

    fn to_payload(&self) -> Result<Map<String, Value>> {
        with_changed_ids(self, Vec::new())
    }

    fn from_payload(fields: Map<String, Value>) -> Result<Self> {
        wire::decode(fields)
    }

    fn execute_on_server(&self, target: &mut ServerTarget<'_>) -> Result<()> {
        if target.uow.find_assembly(self.assembly)?.is_none() {
            return Err(ChangeError::AssemblyNotFound(self.assembly.to_string()));
        }
        for entry in &self.ref_seq_aliases {
            let mut ref_seq = target
                .uow
                .find_ref_seq_by_name(self.assembly, &entry.ref_name)?
                .ok_or_else(|| ChangeError::RefSeqNotFound(entry.ref_name.clone()))?;
            entry.replace_on(&mut ref_seq)?;
            target.uow.update_ref_seq(ref_seq);
        }
        Ok(())
    }

    fn execute_on_client(&self, store: &mut ClientDataStore) -> Result<()> {
        let assembly = store
            .assembly_mut(self.assembly)
            .ok_or_else(|| ChangeError::AssemblyNotFound(self.assembly.to_string()))?;
        for entry in &self.ref_seq_aliases {
            let ref_seq = assembly
                .ref_seqs
                .values_mut()
                .find(|r| r.ref_seq.matches_name(&entry.ref_name))
                .ok_or_else(|| ChangeError::RefSeqNotFound(entry.ref_name.clone()))?;
            entry.replace_on(&mut ref_seq.ref_seq)?;
        }
        Ok(())
    }

    fn execute_on_flat_file(&self, _store: &mut FlatFileStore) -> Result<()> {
        Err(ChangeError::unsupported(Self::TYPE_NAME, "flat file"))
    }

    fn inverse(&self) -> Result<Change> {
        let ref_seq_aliases = self
            .ref_seq_aliases
            .iter()
            .rev()
            .map(|entry| RefSeqAliases {
                ref_name: entry.ref_name.clone(),
                aliases: entry.old_aliases.clone(),
                old_aliases: entry.aliases.clone(),
            })
            .collect();
        Ok(AddRefSeqAliasesChange {
            assembly: self.assembly,
            ref_seq_aliases,
        }
        .into())
    }
}

/// Imports every feature of an uploaded GFF3 file.
///
/// Features are inserted one top-level feature at a time and each insert is
/// committed on its own, so a failure part-way leaves the earlier features
/// in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddFeaturesFromFileChange {
    pub assembly: Uuid,
    pub file_id: String,
}

impl ChangeType for AddFeaturesFromFileChange {
    const TYPE_NAME: &'static str = "AddFeaturesFromFileChange";

    fn assembly(&self) -> Uuid {
        self.assembly
    }

    fn changed_ids(&self) -> Vec<Uuid> {
        Vec::new()
    }

    fn to_payload(&self) -> Result<Map<String, Value>> {
        with_changed_ids(self, Vec::new())
    }

    fn from_payload(fields: Map<String, Value>) -> Result<Self> {
        wire::decode(fields)
    }

    fn execute_on_server(&self, target: &mut ServerTarget<'_>) -> Result<()> {
        if target.uow.find_assembly(self.assembly)?.is_none() {
            return Err(ChangeError::AssemblyNotFound(self.assembly.to_string()));
        }
        let ref_seqs = target.uow.find_ref_seqs(self.assembly)?;
        let reader = BufReader::new(target.blobs.open(&self.file_id)?);
        let document = read_gff3(reader, |name| {
            ref_seqs
                .iter()
                .find(|r| r.matches_name(name))
                .map(|r| r.id)
                .ok_or_else(|| ChangeError::RefSeqNotFound(name.to_string()))
        })?;

        let total = document.features.len();
        for (committed, feature) in document.features.iter().enumerate() {
            if let Err(e) = target
                .add_top_level(feature)
                .and_then(|()| target.uow.checkpoint())
            {
                // Features before this one stay committed and are not logged.
                tracing::warn!(
                    assembly = %self.assembly,
                    file_id = %self.file_id,
                    committed,
                    total,
                    error = %e,
                    "feature import stopped part way"
                );
                return Err(e);
            }
        }
        tracing::info!(
            assembly = %self.assembly,
            file_id = %self.file_id,
            features = total,
            "imported features"
        );
        Ok(())
    }

    fn execute_on_client(&self, _store: &mut ClientDataStore) -> Result<()> {
        Ok(())
    }

    fn execute_on_flat_file(&self, _store: &mut FlatFileStore) -> Result<()> {
        Err(ChangeError::unsupported(Self::TYPE_NAME, "flat file"))
    }

    fn inverse(&self) -> Result<Change> {
        Err(ChangeError::InverseNotImplemented(Self::TYPE_NAME))
    }
}
