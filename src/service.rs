//! The submission pipeline: decode, execute in a transaction, log, broadcast.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::backend::{Backend, BlobStore, DocumentStore, ServerTarget};
use crate::broadcast::BroadcastHub;
use crate::changes::Change;
use crate::db::Database;
use crate::error::{ChangeError, Result};
use crate::models::{AnnotationFeature, ChangeMessage, ChangeRecord, NewChangeRecord};
use crate::operations::{Operation, OperationOutput};
use crate::registry::{ChangeRegistry, OperationRegistry};
use crate::validation::ValidationSet;

/// Accepts changes for the authoritative store.
///
/// Submissions are serialized by one lock held from execution through
/// publication, so the change log, the per-channel sequence numbers and the
/// broadcast order all agree.
pub struct ChangeService {
    db: Database,
    changes: Arc<ChangeRegistry>,
    operations: Arc<OperationRegistry>,
    validations: Arc<ValidationSet>,
    hub: Arc<BroadcastHub>,
    blobs: Arc<dyn BlobStore>,
    submit_lock: Mutex<()>,
}

impl ChangeService {
    pub fn new(db: Database, blobs: Arc<dyn BlobStore>, hub: Arc<BroadcastHub>) -> Result<Self> {
        Ok(Self {
            db,
            changes: Arc::new(ChangeRegistry::with_builtin_changes()?),
            operations: Arc::new(OperationRegistry::with_builtin_operations()?),
            validations: Arc::new(ValidationSet::new()),
            hub,
            blobs,
            submit_lock: Mutex::new(()),
        })
    }

    pub fn with_validations(mut self, validations: ValidationSet) -> Self {
        self.validations = Arc::new(validations);
        self
    }

    pub fn registry(&self) -> &Arc<ChangeRegistry> {
        &self.changes
    }

    pub fn validations(&self) -> &Arc<ValidationSet> {
        &self.validations
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn subscribe(&self, assembly: Uuid) -> broadcast::Receiver<ChangeMessage> {
        self.hub.subscribe(&assembly.to_string())
    }

    /// Decode a serialized change and submit it.
    pub fn submit(&self, payload: Value, user: &str) -> Result<ChangeRecord> {
        let change = Change::from_serialized(&self.changes, payload).inspect_err(|e| {
            tracing::warn!(error = %e, "rejected undecodable change");
        })?;
        self.submit_change(&change, user, None)
    }

    /// Execute `change` against the store, append it to the log and publish it.
    pub fn submit_change(
        &self,
        change: &Change,
        user: &str,
        reverts: Option<i64>,
    ) -> Result<ChangeRecord> {
        let _guard = self.submit_lock.lock().expect("submit lock poisoned");
        let payload = change.to_json()?;

        let record = self
            .validations
            .before_server(change)
            .and_then(|()| {
                self.db.transaction(|store| {
                    let mut target = ServerTarget::new(store, self.blobs.as_ref(), user);
                    change.execute(Backend::Server(&mut target))?;
                    let features = changed_features(&mut target, change)?;
                    self.validations.after_server(change, &features)?;
                    target.finish()?;
                    store.append_change(NewChangeRecord {
                        type_name: change.type_name().to_string(),
                        assembly: change.assembly(),
                        changed_ids: change.changed_ids(),
                        change: payload,
                        user: user.to_string(),
                        reverts,
                    })
                })
            })
            .map_err(|e| {
                tracing::warn!(
                    type_name = change.type_name(),
                    user,
                    error = %e,
                    "change aborted"
                );
                ChangeError::aborted(e)
            })?;

        tracing::info!(
            type_name = %record.type_name,
            assembly = %record.assembly,
            sequence = record.sequence,
            channel_sequence = record.channel_sequence,
            user = %record.user,
            "change accepted"
        );
        self.hub.publish(ChangeMessage::from_record(&record));
        Ok(record)
    }

    /// Submit the inverse of the logged change `sequence`.
    pub fn undo(&self, sequence: i64, user: &str) -> Result<ChangeRecord> {
        let record = self
            .db
            .read(|store| store.find_change(sequence))?
            .ok_or(ChangeError::ChangeNotFound(sequence))?;
        if self.db.read(|store| store.is_reverted(sequence))? {
            return Err(ChangeError::AlreadyExists(format!("an undo of change {}", sequence)));
        }
        let change = Change::from_serialized(&self.changes, record.change)?;
        let inverse = change.inverse()?;
        self.submit_change(&inverse, user, Some(sequence))
    }

    /// Decode and run a read-only operation against the store.
    pub fn run_operation(&self, payload: Value) -> Result<OperationOutput> {
        let operation = Operation::from_serialized(&self.operations, payload)?;
        self.db.read(|store| operation.execute_on_store(store))
    }

    pub fn changes_since(&self, assembly: Uuid, since: i64) -> Result<Vec<ChangeRecord>> {
        self.db.read(|store| store.find_changes_since(assembly, since))
    }

    /// The current state of one feature and its subtree.
    pub fn feature(&self, id: Uuid) -> Result<Option<AnnotationFeature>> {
        let top_level = self.db.read(|store| store.find_top_level_feature(id))?;
        Ok(top_level.and_then(|feature| feature.find(id).cloned()))
    }
}

fn changed_features(target: &mut ServerTarget<'_>, change: &Change) -> Result<Vec<AnnotationFeature>> {
    let mut features = Vec::new();
    for id in change.changed_ids() {
        if let Some(tree) = target.uow.tree_containing(id)? {
            if let Some(node) = tree.find(id) {
                features.push(tree.subtree(node));
            }
        }
    }
    Ok(features)
}
