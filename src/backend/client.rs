//! The optimistic client-side copy of the annotation data.
//!
//! A [`ClientDataStore`] holds whatever assemblies, reference sequences and
//! feature trees a client has fetched. Changes are applied copy-then-mutate:
//! execution runs against a draft and the draft replaces the live state only
//! if it succeeds, so a failed change leaves nothing behind.
//!
//! A [`ClientSession`] wraps a store with the bookkeeping needed to follow the
//! broadcast stream: the last per-channel sequence applied, the local changes
//! waiting for their echo, and an undo/redo history.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;
use uuid::Uuid;

use super::{Backend, FeatureTarget};
use crate::changes::Change;
use crate::error::{ChangeError, Result};
use crate::models::{AnnotationFeature, Assembly, ChangeMessage, RefSeq};
use crate::registry::ChangeRegistry;
use crate::tree::FeatureTree;
use crate::validation::ValidationSet;

#[derive(Debug, Clone)]
pub struct ClientRefSeq {
    pub ref_seq: RefSeq,
    /// Top-level feature trees keyed by root id, in load order.
    pub features: IndexMap<Uuid, FeatureTree>,
}

#[derive(Debug, Clone)]
pub struct ClientAssembly {
    pub assembly: Assembly,
    pub ref_seqs: IndexMap<Uuid, ClientRefSeq>,
}

impl ClientAssembly {
    pub fn new(assembly: Assembly, ref_seqs: Vec<RefSeq>) -> Self {
        let ref_seqs = ref_seqs
            .into_iter()
            .map(|ref_seq| {
                (
                    ref_seq.id,
                    ClientRefSeq {
                        ref_seq,
                        features: IndexMap::new(),
                    },
                )
            })
            .collect();
        Self { assembly, ref_seqs }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClientDataStore {
    assemblies: IndexMap<Uuid, ClientAssembly>,
}

impl ClientDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or replace) an assembly and its reference sequences, without features.
    pub fn load_assembly(&mut self, assembly: Assembly, ref_seqs: Vec<RefSeq>) {
        self.assemblies
            .insert(assembly.id, ClientAssembly::new(assembly, ref_seqs));
    }

    /// Replace every feature of a reference sequence with freshly fetched ones.
    pub fn load_features(&mut self, ref_seq: Uuid, features: Vec<AnnotationFeature>) -> Result<()> {
        let target = self
            .ref_seq_mut(ref_seq)
            .ok_or_else(|| ChangeError::RefSeqNotFound(ref_seq.to_string()))?;
        target.features = features
            .iter()
            .map(|feature| (feature.id, FeatureTree::from_feature(feature)))
            .collect();
        Ok(())
    }

    /// Forget the features of a reference sequence.
    pub fn discard_features(&mut self, ref_seq: Uuid) {
        if let Some(target) = self.ref_seq_mut(ref_seq) {
            target.features.clear();
        }
    }

    pub fn insert_assembly(&mut self, assembly: ClientAssembly) -> Result<()> {
        if self.assemblies.contains_key(&assembly.assembly.id) {
            return Err(ChangeError::AlreadyExists(format!(
                "assembly {}",
                assembly.assembly.id
            )));
        }
        self.assemblies.insert(assembly.assembly.id, assembly);
        Ok(())
    }

    pub fn remove_assembly(&mut self, id: Uuid) -> Result<()> {
        self.assemblies
            .shift_remove(&id)
            .map(|_| ())
            .ok_or_else(|| ChangeError::AssemblyNotFound(id.to_string()))
    }

    pub fn assembly(&self, id: Uuid) -> Option<&ClientAssembly> {
        self.assemblies.get(&id)
    }

    pub fn assembly_mut(&mut self, id: Uuid) -> Option<&mut ClientAssembly> {
        self.assemblies.get_mut(&id)
    }

    pub fn assemblies(&self) -> impl Iterator<Item = &ClientAssembly> {
        self.assemblies.values()
    }

    pub fn ref_seq(&self, id: Uuid) -> Option<&ClientRefSeq> {
        self.assemblies.values().find_map(|a| a.ref_seqs.get(&id))
    }

    fn ref_seq_mut(&mut self, id: Uuid) -> Option<&mut ClientRefSeq> {
        self.assemblies
            .values_mut()
            .find_map(|a| a.ref_seqs.get_mut(&id))
    }

    fn trees(&self) -> impl Iterator<Item = &FeatureTree> {
        self.assemblies
            .values()
            .flat_map(|a| a.ref_seqs.values())
            .flat_map(|r| r.features.values())
    }

    /// Current state of a feature and its subtree.
    pub fn feature(&self, id: Uuid) -> Option<AnnotationFeature> {
        self.trees().find_map(|tree| tree.find(id).map(|node| tree.subtree(node)))
    }

    /// The tree holding `id`, by reference.
    pub fn tree(&self, id: Uuid) -> Option<&FeatureTree> {
        self.trees().find(|tree| tree.contains(id))
    }

    /// Apply a change to a draft copy and keep the draft only on success.
    pub fn apply(&mut self, change: &Change) -> Result<()> {
        self.apply_validated(change, &ValidationSet::new())
    }

    pub fn apply_validated(&mut self, change: &Change, validations: &ValidationSet) -> Result<()> {
        validations.before_client(change)?;
        let mut draft = self.clone();
        change.execute(Backend::Client(&mut draft))?;
        let features: Vec<AnnotationFeature> = change
            .changed_ids()
            .into_iter()
            .filter_map(|id| draft.feature(id))
            .collect();
        validations.after_client(change, &features)?;
        *self = draft;
        Ok(())
    }

    fn locate_tree(&self, id: Uuid) -> Option<(Uuid, Uuid, Uuid)> {
        for (assembly_id, assembly) in &self.assemblies {
            for (ref_seq_id, ref_seq) in &assembly.ref_seqs {
                for (root, tree) in &ref_seq.features {
                    if tree.contains(id) {
                        return Some((*assembly_id, *ref_seq_id, *root));
                    }
                }
            }
        }
        None
    }
}

impl FeatureTarget for ClientDataStore {
    fn backend_name(&self) -> &'static str {
        "client"
    }

    fn tree_containing(&mut self, feature_id: Uuid) -> Result<Option<&mut FeatureTree>> {
        let Some((assembly, ref_seq, root)) = self.locate_tree(feature_id) else {
            return Ok(None);
        };
        Ok(self
            .assemblies
            .get_mut(&assembly)
            .and_then(|a| a.ref_seqs.get_mut(&ref_seq))
            .and_then(|r| r.features.get_mut(&root)))
    }

    fn add_top_level(&mut self, feature: &AnnotationFeature) -> Result<()> {
        if let Some(existing) = feature.all_ids().into_iter().find(|id| self.locate_tree(*id).is_some()) {
            return Err(ChangeError::AlreadyExists(format!("feature {}", existing)));
        }
        let tree = FeatureTree::from_feature(feature);
        tree.validate()?;
        let ref_seq = self
            .ref_seq_mut(feature.ref_seq)
            .ok_or_else(|| ChangeError::RefSeqNotFound(feature.ref_seq.to_string()))?;
        ref_seq.features.insert(feature.id, tree);
        Ok(())
    }

    fn remove_top_level(&mut self, feature_id: Uuid) -> Result<AnnotationFeature> {
        let (assembly, ref_seq, root) = self
            .locate_tree(feature_id)
            .ok_or(ChangeError::FeatureNotFound(feature_id))?;
        if root != feature_id {
            return Err(ChangeError::malformed(format!(
                "feature {} is not a top-level feature",
                feature_id
            )));
        }
        self.assemblies
            .get_mut(&assembly)
            .and_then(|a| a.ref_seqs.get_mut(&ref_seq))
            .and_then(|r| r.features.shift_remove(&root))
            .map(|tree| tree.to_feature())
            .ok_or(ChangeError::FeatureNotFound(feature_id))
    }

    fn mark_modified(&mut self, _top_level_id: Uuid) {}
}

/// Outcome of feeding one broadcast message to a [`ClientSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// A remote change was replayed locally.
    Applied,
    /// The echo of a change this session already applied optimistically.
    Confirmed,
    /// The change concerns data this session has not loaded.
    NotLoaded,
    /// The message was seen before.
    Duplicate,
    /// A message was missed or could not be replayed; the channel must be
    /// re-fetched and then [`ClientSession::resync`]ed.
    Diverged,
}

pub struct ClientSession {
    user: String,
    store: ClientDataStore,
    registry: Arc<ChangeRegistry>,
    validations: Arc<ValidationSet>,
    last_seen: HashMap<String, i64>,
    diverged: BTreeSet<String>,
    pending: VecDeque<Value>,
    undo_stack: Vec<Change>,
    redo_stack: Vec<Change>,
}

impl ClientSession {
    pub fn new(
        user: impl Into<String>,
        registry: Arc<ChangeRegistry>,
        validations: Arc<ValidationSet>,
    ) -> Self {
        Self {
            user: user.into(),
            store: ClientDataStore::new(),
            registry,
            validations,
            last_seen: HashMap::new(),
            diverged: BTreeSet::new(),
            pending: VecDeque::new(),
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn store(&self) -> &ClientDataStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ClientDataStore {
        &mut self.store
    }

    /// Apply a change made by this session's user. Returns the payload to
    /// submit to the server.
    pub fn apply_local(&mut self, change: Change) -> Result<Value> {
        let payload = self.apply_optimistic(&change)?;
        self.undo_stack.push(change);
        self.redo_stack.clear();
        Ok(payload)
    }

    /// Apply the inverse of the most recent local change. Returns the inverse
    /// and its payload, or `None` if there is nothing to undo.
    pub fn undo(&mut self) -> Result<Option<(Change, Value)>> {
        let Some(change) = self.undo_stack.pop() else {
            return Ok(None);
        };
        let inverse = match change.inverse().and_then(|inverse| {
            let payload = self.apply_optimistic(&inverse)?;
            Ok((inverse, payload))
        }) {
            Ok(applied) => applied,
            Err(e) => {
                self.undo_stack.push(change);
                return Err(e);
            }
        };
        self.redo_stack.push(change);
        Ok(Some(inverse))
    }

    /// Re-apply the most recently undone change.
    pub fn redo(&mut self) -> Result<Option<(Change, Value)>> {
        let Some(change) = self.redo_stack.pop() else {
            return Ok(None);
        };
        match self.apply_optimistic(&change) {
            Ok(payload) => {
                self.undo_stack.push(change.clone());
                Ok(Some((change, payload)))
            }
            Err(e) => {
                self.redo_stack.push(change);
                Err(e)
            }
        }
    }

    fn apply_optimistic(&mut self, change: &Change) -> Result<Value> {
        self.store.apply_validated(change, &self.validations)?;
        let payload = change.to_json()?;
        self.pending.push_back(payload.clone());
        Ok(payload)
    }

    /// The server refused a change this session applied optimistically. The
    /// local copy of its channel can no longer be trusted.
    pub fn reject(&mut self, payload: &Value) {
        if let Some(position) = self.pending.iter().position(|p| p == payload) {
            self.pending.remove(position);
        }
        if let Some(channel) = payload.get("assembly").and_then(Value::as_str) {
            self.diverged.insert(channel.to_string());
        }
    }

    /// Feed one broadcast message.
    pub fn receive(&mut self, message: &ChangeMessage) -> SyncStatus {
        let channel = message.channel.as_str();
        if self.diverged.contains(channel) {
            return SyncStatus::Diverged;
        }
        if let Some(&last) = self.last_seen.get(channel) {
            if message.sequence <= last {
                return SyncStatus::Duplicate;
            }
            if message.sequence != last + 1 {
                tracing::warn!(
                    channel,
                    expected = last + 1,
                    received = message.sequence,
                    "missed broadcast messages"
                );
                return self.diverge(channel);
            }
        }

        let status = if message.user == self.user && self.pending.front() == Some(&message.change) {
            self.pending.pop_front();
            SyncStatus::Confirmed
        } else {
            let replayed = self
                .registry
                .decode(message.change.clone())
                .and_then(|change| self.store.apply_validated(&change, &self.validations));
            match replayed {
                Ok(()) => SyncStatus::Applied,
                Err(
                    ChangeError::FeatureNotFound(_)
                    | ChangeError::RefSeqNotFound(_)
                    | ChangeError::AssemblyNotFound(_),
                ) => SyncStatus::NotLoaded,
                Err(e) => {
                    tracing::warn!(channel, error = %e, "could not replay remote change");
                    return self.diverge(channel);
                }
            }
        };
        self.last_seen.insert(channel.to_string(), message.sequence);
        status
    }

    fn diverge(&mut self, channel: &str) -> SyncStatus {
        self.diverged.insert(channel.to_string());
        SyncStatus::Diverged
    }

    pub fn is_diverged(&self, channel: &str) -> bool {
        self.diverged.contains(channel)
    }

    pub fn last_seen(&self, channel: &str) -> Option<i64> {
        self.last_seen.get(channel).copied()
    }

    /// Mark a channel as re-fetched up to `sequence`.
    pub fn resync(&mut self, channel: &str, sequence: i64) {
        self.diverged.remove(channel);
        self.last_seen.insert(channel.to_string(), sequence);
        let channel_pending = |p: &Value| p.get("assembly").and_then(Value::as_str) == Some(channel);
        self.pending.retain(|p| !channel_pending(p));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changes::{TypeChange, TypeChangeDetails};
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    struct Fixture {
        session: ClientSession,
        assembly: Uuid,
        mrna: Uuid,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ChangeRegistry::with_builtin_changes().unwrap());
        let mut session = ClientSession::new("alice", registry, Arc::new(ValidationSet::new()));
        let assembly = Assembly {
            id: Uuid::new_v4(),
            name: "vv1".into(),
            aliases: vec![],
            comments: vec![],
            user: "alice".into(),
            created_at: Utc::now(),
        };
        let ref_seq = RefSeq::new(assembly.id, "ctgA", 1000);
        let mrna = AnnotationFeature::new(ref_seq.id, "mRNA", 10, 100);
        let (assembly_id, ref_seq_id, mrna_id) = (assembly.id, ref_seq.id, mrna.id);
        session.store_mut().load_assembly(assembly, vec![ref_seq]);
        session.store_mut().load_features(ref_seq_id, vec![mrna]).unwrap();
        Fixture {
            session,
            assembly: assembly_id,
            mrna: mrna_id,
        }
    }

    fn retype(assembly: Uuid, feature: Uuid, old: &str, new: &str) -> Change {
        TypeChange::new(
            assembly,
            TypeChangeDetails {
                feature_id: feature,
                old_type: old.into(),
                new_type: new.into(),
            },
        )
        .into()
    }

    fn message(assembly: Uuid, sequence: i64, user: &str, change: &Change) -> ChangeMessage {
        ChangeMessage {
            channel: assembly.to_string(),
            sequence,
            user: user.into(),
            change: change.to_json().unwrap(),
        }
    }

    fn feature_type(f: &Fixture) -> String {
        f.session.store().feature(f.mrna).unwrap().feature_type
    }

    #[test]
    fn failed_batch_leaves_state_untouched() {
        let f = fixture();
        let mut store = f.session.store().clone();
        let change: Change = TypeChange::batch(
            f.assembly,
            vec![
                TypeChangeDetails {
                    feature_id: f.mrna,
                    old_type: "mRNA".into(),
                    new_type: "ncRNA".into(),
                },
                TypeChangeDetails {
                    feature_id: Uuid::new_v4(),
                    old_type: "gene".into(),
                    new_type: "pseudogene".into(),
                },
            ],
        )
        .unwrap()
        .into();
        assert!(matches!(store.apply(&change), Err(ChangeError::FeatureNotFound(_))));
        assert_eq!(store.feature(f.mrna).unwrap().feature_type, "mRNA");
    }

    #[test]
    fn remote_changes_replay_in_order() {
        let mut f = fixture();
        let change = retype(f.assembly, f.mrna, "mRNA", "ncRNA");
        assert_eq!(f.session.receive(&message(f.assembly, 1, "bob", &change)), SyncStatus::Applied);
        assert_eq!(feature_type(&f), "ncRNA");
        assert_eq!(f.session.receive(&message(f.assembly, 1, "bob", &change)), SyncStatus::Duplicate);
        assert_eq!(f.session.last_seen(&f.assembly.to_string()), Some(1));
    }

    #[test]
    fn gaps_mark_the_channel_diverged() {
        let mut f = fixture();
        let change = retype(f.assembly, f.mrna, "mRNA", "ncRNA");
        f.session.receive(&message(f.assembly, 1, "bob", &change));
        let back = retype(f.assembly, f.mrna, "ncRNA", "mRNA");
        assert_eq!(f.session.receive(&message(f.assembly, 3, "bob", &back)), SyncStatus::Diverged);
        assert!(f.session.is_diverged(&f.assembly.to_string()));
        assert_eq!(feature_type(&f), "ncRNA");

        f.session.resync(&f.assembly.to_string(), 3);
        assert_eq!(f.session.receive(&message(f.assembly, 4, "bob", &back)), SyncStatus::Applied);
    }

    #[test]
    fn own_echo_is_confirmed_not_reapplied() {
        let mut f = fixture();
        let change = retype(f.assembly, f.mrna, "mRNA", "ncRNA");
        f.session.apply_local(change.clone()).unwrap();
        assert_eq!(feature_type(&f), "ncRNA");
        assert_eq!(
            f.session.receive(&message(f.assembly, 1, "alice", &change)),
            SyncStatus::Confirmed
        );
        assert_eq!(feature_type(&f), "ncRNA");
    }

    #[test]
    fn changes_to_unloaded_data_are_skipped() {
        let mut f = fixture();
        let change = retype(f.assembly, Uuid::new_v4(), "gene", "pseudogene");
        assert_eq!(f.session.receive(&message(f.assembly, 1, "bob", &change)), SyncStatus::NotLoaded);
        assert!(!f.session.is_diverged(&f.assembly.to_string()));
    }

    #[test]
    fn discarded_ref_seqs_skip_remote_changes() {
        let mut f = fixture();
        let ref_seq = f.session.store().tree(f.mrna).unwrap().ref_seq();
        f.session.store_mut().discard_features(ref_seq);
        assert!(f.session.store().feature(f.mrna).is_none());

        let change = retype(f.assembly, f.mrna, "mRNA", "ncRNA");
        assert_eq!(f.session.receive(&message(f.assembly, 1, "bob", &change)), SyncStatus::NotLoaded);
        assert_eq!(f.session.last_seen(&f.assembly.to_string()), Some(1));
    }

    #[test]
    fn undo_and_redo_walk_the_local_history() {
        let mut f = fixture();
        f.session
            .apply_local(retype(f.assembly, f.mrna, "mRNA", "ncRNA"))
            .unwrap();
        let (inverse, _) = f.session.undo().unwrap().unwrap();
        assert_eq!(inverse.type_name(), "TypeChange");
        assert_eq!(feature_type(&f), "mRNA");
        f.session.redo().unwrap().unwrap();
        assert_eq!(feature_type(&f), "ncRNA");
        assert!(f.session.redo().unwrap().is_none());
    }

    #[test]
    fn rejection_marks_the_channel_diverged() {
        let mut f = fixture();
        let payload = f
            .session
            .apply_local(retype(f.assembly, f.mrna, "mRNA", "ncRNA"))
            .unwrap();
        f.session.reject(&payload);
        assert!(f.session.is_diverged(&f.assembly.to_string()));
    }
}
