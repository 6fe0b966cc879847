use std::sync::Arc;

use annotation_sync::backend::{ClientSession, DocumentStore, MemoryBlobStore, SyncStatus};
use annotation_sync::broadcast::BroadcastHub;
use annotation_sync::changes::*;
use annotation_sync::db::Database;
use annotation_sync::models::*;
use annotation_sync::operations::OperationOutput;
use annotation_sync::service::ChangeService;
use annotation_sync::tree::FeatureTree;
use annotation_sync::validation::{Validation, ValidationSet};
use annotation_sync::ChangeError;
use serde_json::json;
use speculate2::speculate;
use uuid::Uuid;

const FASTA: &str = ">ctgA first contig
ACGTACGTAC
GTTT
>ctgB
GGGG
";

const GFF3: &str = "##gff-version 3
##sequence-region ctgA 1 1000
ctgA\texample\tgene\t101\t400\t.\t+\t.\tID=EDEN;Name=EDEN
ctgA\texample\tmRNA\t101\t400\t.\t+\t.\tID=EDEN.1;Parent=EDEN
ctgA\texample\texon\t101\t200\t.\t+\t.\tParent=EDEN.1
ctgA\texample\tgene\t601\t700\t.\t-\t.\tID=APC;Name=APC
###
";

struct NoPseudogenes;

impl Validation for NoPseudogenes {
    fn name(&self) -> &str {
        "no-pseudogenes"
    }

    fn after_server(&self, _change: &Change, features: &[AnnotationFeature]) -> Result<(), String> {
        if features.iter().any(|f| f.feature_type == "pseudogene") {
            return Err("pseudogenes are not annotated here".to_string());
        }
        Ok(())
    }
}

fn service_with(blobs: Arc<MemoryBlobStore>) -> ChangeService {
    let db = Database::open_memory().expect("Failed to create in-memory database");
    db.migrate().expect("Failed to run migrations");
    ChangeService::new(db, blobs, Arc::new(BroadcastHub::default()))
        .expect("Failed to build service")
}

/// Submit `AddAssemblyChange{vv1, ctgA:1000}` and return the assembly and ctgA ids.
fn add_assembly(service: &ChangeService, assembly: Uuid) -> Uuid {
    let change: Change =
        AddAssemblyChange::new(assembly, "vv1", vec![("ctgA".to_string(), 1000)]).into();
    service
        .submit_change(&change, "alice", None)
        .expect("Failed to add assembly");
    ref_seq_id(assembly, "ctgA")
}

/// gene [100, 200) with a single exon [120, 150).
fn gene_with_exon(ref_seq: Uuid) -> (AnnotationFeature, Uuid) {
    let exon = AnnotationFeature::new(ref_seq, "exon", 120, 150);
    let exon_id = exon.id;
    (
        AnnotationFeature::new(ref_seq, "gene", 100, 200).with_child(exon),
        exon_id,
    )
}

fn add_feature(service: &ChangeService, assembly: Uuid, feature: &AnnotationFeature) -> ChangeRecord {
    let change: Change = AddFeatureChange::new(assembly, feature.clone(), None, None).into();
    service
        .submit_change(&change, "alice", None)
        .expect("Failed to add feature")
}

fn current(service: &ChangeService, id: Uuid) -> AnnotationFeature {
    service
        .feature(id)
        .expect("Query failed")
        .expect("Feature should exist")
}

fn aliases_change(assembly: Uuid, aliases: &[&str], old_aliases: &[&str]) -> Change {
    let owned = |names: &[&str]| names.iter().map(|n| n.to_string()).collect::<Vec<_>>();
    AddRefSeqAliasesChange {
        assembly,
        ref_seq_aliases: vec![RefSeqAliases {
            ref_name: "ctgA".to_string(),
            aliases: owned(aliases),
            old_aliases: owned(old_aliases),
        }],
    }
    .into()
}

fn stored_aliases(service: &ChangeService, assembly: Uuid) -> Vec<String> {
    service
        .db()
        .read(|s| s.find_ref_seq(ref_seq_id(assembly, "ctgA")))
        .expect("Query failed")
        .expect("RefSeq should exist")
        .aliases
}

fn log_len(service: &ChangeService, assembly: Uuid) -> usize {
    service.changes_since(assembly, 0).expect("Query failed").len()
}

speculate! {
    before {
        let blobs = Arc::new(MemoryBlobStore::new());
        let service = service_with(blobs.clone());
        let assembly = Uuid::new_v4();
    }

    describe "adding an assembly" {
        it "creates the assembly with its reference sequences" {
            let ctg_a = add_assembly(&service, assembly);

            let output = service
                .run_operation(json!({ "typeName": "GetRefSeqsOperation", "assembly": assembly }))
                .expect("Operation failed");
            let OperationOutput::RefSeqs(ref_seqs) = output else {
                panic!("expected reference sequences");
            };
            assert_eq!(ref_seqs.len(), 1);
            assert_eq!(ref_seqs[0].id, ctg_a);
            assert_eq!(ref_seqs[0].name, "ctgA");
            assert_eq!(ref_seqs[0].length, 1000);
        }

        it "refuses a second assembly with the same name" {
            add_assembly(&service, assembly);
            let again: Change =
                AddAssemblyChange::new(Uuid::new_v4(), "vv1", vec![("ctgA".to_string(), 10)]).into();

            let err = service.submit_change(&again, "alice", None).unwrap_err();
            assert!(matches!(err.innermost(), ChangeError::AlreadyExists(_)));
            assert_eq!(log_len(&service, assembly), 1);
        }

        it "imports sequences from an uploaded FASTA file" {
            blobs.insert("genome.fa", FASTA);
            let change: Change = AddAssemblyFromFileChange {
                assembly,
                assembly_name: "vv2".to_string(),
                file_id: "genome.fa".to_string(),
            }
            .into();
            service.submit_change(&change, "alice", None).expect("Import failed");

            let output = service
                .run_operation(json!({
                    "typeName": "GetSequenceOperation",
                    "refSeq": ref_seq_id(assembly, "ctgA"),
                    "start": 8,
                    "end": 12
                }))
                .expect("Operation failed");
            assert_eq!(output, OperationOutput::Sequence("ACGT".to_string()));
        }

        it "reports a missing upload" {
            let change: Change = AddAssemblyFromFileChange {
                assembly,
                assembly_name: "vv2".to_string(),
                file_id: "missing.fa".to_string(),
            }
            .into();
            let err = service.submit_change(&change, "alice", None).unwrap_err();
            assert!(matches!(err.innermost(), ChangeError::FileNotFound(_)));
        }

        it "attaches aliases that lookups by name then honour" {
            add_assembly(&service, assembly);
            let change: Change = AddRefSeqAliasesChange {
                assembly,
                ref_seq_aliases: vec![RefSeqAliases {
                    ref_name: "ctgA".to_string(),
                    aliases: vec!["chrA".to_string()],
                    old_aliases: vec![],
                }],
            }
            .into();
            service.submit_change(&change, "alice", None).expect("Failed to add aliases");

            let ref_seq = service
                .db()
                .read(|s| s.find_ref_seq(ref_seq_id(assembly, "ctgA")))
                .expect("Query failed")
                .expect("RefSeq should exist");
            assert!(ref_seq.matches_name("chrA"));
        }

        it "restores the previous aliases on undo" {
            add_assembly(&service, assembly);
            service
                .submit_change(&aliases_change(assembly, &["chrA"], &[]), "alice", None)
                .expect("Failed to add aliases");
            let second = service
                .submit_change(&aliases_change(assembly, &["chr1"], &["chrA"]), "alice", None)
                .expect("Failed to replace aliases");

            service.undo(second.sequence, "alice").expect("Undo failed");

            assert_eq!(stored_aliases(&service, assembly), vec!["chrA".to_string()]);
        }

        it "refuses aliases recorded against a stale list" {
            add_assembly(&service, assembly);
            service
                .submit_change(&aliases_change(assembly, &["chrA"], &[]), "alice", None)
                .expect("Failed to add aliases");

            let err = service
                .submit_change(&aliases_change(assembly, &["chr1"], &[]), "alice", None)
                .unwrap_err();

            assert!(matches!(err.innermost(), ChangeError::ValueMismatch { field: "aliases", .. }));
            assert_eq!(stored_aliases(&service, assembly), vec!["chrA".to_string()]);
        }

        it "requires the previous aliases in the wire form" {
            add_assembly(&service, assembly);
            let err = service
                .submit(
                    json!({
                        "typeName": "AddRefSeqAliasesChange",
                        "assembly": assembly,
                        "refSeqAliases": [{ "refName": "ctgA", "aliases": ["chrA"] }]
                    }),
                    "alice",
                )
                .unwrap_err();
            assert!(matches!(err, ChangeError::MalformedOperation(_)));
        }
    }

    describe "importing features from a file" {
        it "keeps features committed before a failing one" {
            let ctg_a = add_assembly(&service, assembly);
            blobs.insert(
                "broken.gff3",
                "##gff-version 3
ctgA\texample\tgene\t101\t400\t.\t+\t.\tID=EDEN
ctgA\texample\tgene\t601\t700\t.\t-\t.\tID=APC
ctgA\texample\texon\t801\t900\t.\t-\t.\tParent=APC
",
            );
            let change: Change = AddFeaturesFromFileChange {
                assembly,
                file_id: "broken.gff3".to_string(),
            }
            .into();

            let err = service.submit_change(&change, "alice", None).unwrap_err();

            assert!(matches!(err.innermost(), ChangeError::OutOfBounds { .. }));
            let features = service
                .db()
                .read(|s| s.find_features_in_range(ctg_a, 0, 1000))
                .expect("Query failed");
            assert_eq!(features.len(), 1);
            assert_eq!((features[0].min, features[0].max), (100, 400));
            let logged: Vec<String> = service
                .changes_since(assembly, 0)
                .expect("Query failed")
                .into_iter()
                .map(|r| r.type_name)
                .collect();
            assert_eq!(logged, vec!["AddAssemblyChange".to_string()]);
        }

        it "adds every top-level feature with its children" {
            let ctg_a = add_assembly(&service, assembly);
            blobs.insert("genes.gff3", GFF3);
            let change: Change = AddFeaturesFromFileChange {
                assembly,
                file_id: "genes.gff3".to_string(),
            }
            .into();
            service.submit_change(&change, "alice", None).expect("Import failed");

            let features = service
                .db()
                .read(|s| s.find_features_in_range(ctg_a, 0, 1000))
                .expect("Query failed");
            let types: Vec<&str> = features.iter().map(|f| f.feature_type.as_str()).collect();
            assert_eq!(types, vec!["gene", "gene"]);
            assert_eq!((features[0].min, features[0].max), (100, 400));
            assert_eq!(features[0].all_ids().len(), 3);
            assert_eq!(features[1].strand, Some(Strand::Reverse));
        }
    }

    describe "moving a feature boundary" {
        it "expands the parent and records the whole chain" {
            let ctg_a = add_assembly(&service, assembly);
            let (gene, exon) = gene_with_exon(ctg_a);
            add_feature(&service, assembly, &gene);

            let tree = FeatureTree::from_feature(&current(&service, gene.id));
            let change = LocationEndChange::propagated(assembly, &tree, exon, 250, false)
                .expect("Failed to plan");
            assert_eq!(
                change.changes[0],
                LocationEndChangeDetails { feature_id: exon, old_end: 150, new_end: 250 }
            );
            service.submit_change(&change.into(), "alice", None).expect("Change failed");

            let stored = current(&service, gene.id);
            assert_eq!(stored.max, 250);
            assert_eq!(stored.find(exon).map(|e| e.max), Some(250));
        }

        it "leaves the store untouched when one edit breaks containment" {
            let ctg_a = add_assembly(&service, assembly);
            let (gene, exon) = gene_with_exon(ctg_a);
            add_feature(&service, assembly, &gene);
            let before = log_len(&service, assembly);

            let change: Change = LocationEndChange::batch(
                assembly,
                vec![LocationEndChangeDetails { feature_id: exon, old_end: 150, new_end: 250 }],
            )
            .expect("Failed to build batch")
            .into();
            let err = service.submit_change(&change, "alice", None).unwrap_err();

            assert!(matches!(err, ChangeError::TransactionAborted(_)));
            assert!(matches!(err.innermost(), ChangeError::OutOfBounds { .. }));
            assert_eq!(current(&service, gene.id), gene);
            assert_eq!(log_len(&service, assembly), before);
        }

        it "is reverted by its inverse" {
            let ctg_a = add_assembly(&service, assembly);
            let (gene, exon) = gene_with_exon(ctg_a);
            add_feature(&service, assembly, &gene);

            let tree = FeatureTree::from_feature(&gene);
            let change: Change = LocationEndChange::propagated(assembly, &tree, exon, 250, false)
                .expect("Failed to plan")
                .into();
            service.submit_change(&change, "alice", None).expect("Change failed");
            service
                .submit_change(&change.inverse().expect("No inverse"), "alice", None)
                .expect("Inverse failed");

            assert_eq!(current(&service, gene.id), gene);
        }
    }

    describe "deleting features" {
        it "lets a forced delete run twice" {
            let ctg_a = add_assembly(&service, assembly);
            let (gene, exon) = gene_with_exon(ctg_a);
            add_feature(&service, assembly, &gene);

            let tree = FeatureTree::from_feature(&gene);
            let change: Change = DeleteFeatureChange::from_tree(assembly, &tree, exon)
                .expect("Failed to snapshot")
                .forced()
                .into();
            service.submit_change(&change, "alice", None).expect("First delete failed");
            service.submit_change(&change, "alice", None).expect("Second delete failed");

            assert!(current(&service, gene.id).children.is_empty());
        }

        it "reports a missing feature without force" {
            let ctg_a = add_assembly(&service, assembly);
            let (gene, _) = gene_with_exon(ctg_a);
            add_feature(&service, assembly, &gene);

            let tree = FeatureTree::from_feature(&gene);
            let change: Change = DeleteFeatureChange::from_tree(assembly, &tree, gene.id)
                .expect("Failed to snapshot")
                .into();
            service.submit_change(&change, "alice", None).expect("First delete failed");

            let err = service.submit_change(&change, "alice", None).unwrap_err();
            assert!(matches!(err.innermost(), ChangeError::FeatureNotFound(id) if *id == gene.id));
            assert!(service.feature(gene.id).expect("Query failed").is_none());
        }
    }

    describe "changing types" {
        it "succeeds when one element of the batch is already current" {
            let ctg_a = add_assembly(&service, assembly);
            let (gene, exon) = gene_with_exon(ctg_a);
            add_feature(&service, assembly, &gene);

            let change: Change = TypeChange::batch(
                assembly,
                vec![
                    TypeChangeDetails {
                        feature_id: gene.id,
                        old_type: "gene".to_string(),
                        new_type: "gene".to_string(),
                    },
                    TypeChangeDetails {
                        feature_id: exon,
                        old_type: "exon".to_string(),
                        new_type: "CDS".to_string(),
                    },
                ],
            )
            .expect("Failed to build batch")
            .into();
            let record = service.submit_change(&change, "alice", None).expect("Change failed");

            let stored = current(&service, gene.id);
            assert_eq!(stored.feature_type, "gene");
            assert_eq!(stored.find(exon).map(|e| e.feature_type.as_str()), Some("CDS"));
            assert_eq!(record.changed_ids, vec![gene.id, exon]);
        }

        it "refuses a stale old type and leaves undo history sound" {
            let ctg_a = add_assembly(&service, assembly);
            let (gene, _) = gene_with_exon(ctg_a);
            add_feature(&service, assembly, &gene);

            let stale: Change = TypeChange::new(
                assembly,
                TypeChangeDetails {
                    feature_id: gene.id,
                    old_type: "pseudogene".to_string(),
                    new_type: "ncRNA_gene".to_string(),
                },
            )
            .into();
            let err = service.submit_change(&stale, "alice", None).unwrap_err();

            assert!(matches!(err.innermost(), ChangeError::ValueMismatch { field: "type", .. }));
            assert_eq!(current(&service, gene.id).feature_type, "gene");
            assert_eq!(log_len(&service, assembly), 2);
        }

        it "is undone back to the recorded old type" {
            let ctg_a = add_assembly(&service, assembly);
            let (gene, _) = gene_with_exon(ctg_a);
            add_feature(&service, assembly, &gene);
            let change: Change = TypeChange::new(
                assembly,
                TypeChangeDetails {
                    feature_id: gene.id,
                    old_type: "gene".to_string(),
                    new_type: "ncRNA_gene".to_string(),
                },
            )
            .into();
            let record = service.submit_change(&change, "alice", None).expect("Change failed");

            service.undo(record.sequence, "alice").expect("Undo failed");

            assert_eq!(current(&service, gene.id), gene);
        }

        it "is refused by a registered validation" {
            let service = service_with(blobs.clone())
                .with_validations(ValidationSet::new().with(NoPseudogenes));
            let ctg_a = add_assembly(&service, assembly);
            let (gene, _) = gene_with_exon(ctg_a);
            add_feature(&service, assembly, &gene);

            let change: Change = TypeChange::new(
                assembly,
                TypeChangeDetails {
                    feature_id: gene.id,
                    old_type: "gene".to_string(),
                    new_type: "pseudogene".to_string(),
                },
            )
            .into();
            let err = service.submit_change(&change, "alice", None).unwrap_err();

            assert!(matches!(err.innermost(), ChangeError::ValidationFailed { .. }));
            assert_eq!(current(&service, gene.id).feature_type, "gene");
        }
    }

    describe "editing attributes" {
        it "is reverted by its inverse" {
            let ctg_a = add_assembly(&service, assembly);
            let gene = AnnotationFeature::new(ctg_a, "gene", 100, 200).with_attribute("Name", "EDEN");
            add_feature(&service, assembly, &gene);

            let mut new_attributes = gene.attributes.clone();
            new_attributes.insert("Note".to_string(), vec!["kinase".to_string()]);
            let change: Change = FeatureAttributeChange::new(
                assembly,
                FeatureAttributeChangeDetails {
                    feature_id: gene.id,
                    old_attributes: gene.attributes.clone(),
                    new_attributes,
                },
            )
            .into();
            service.submit_change(&change, "alice", None).expect("Change failed");
            assert_eq!(current(&service, gene.id).attributes.len(), 2);

            service
                .submit_change(&change.inverse().expect("No inverse"), "alice", None)
                .expect("Inverse failed");
            assert_eq!(current(&service, gene.id), gene);
        }

        it "refuses stale old attributes" {
            let ctg_a = add_assembly(&service, assembly);
            let gene = AnnotationFeature::new(ctg_a, "gene", 100, 200).with_attribute("Name", "EDEN");
            add_feature(&service, assembly, &gene);

            let change: Change = FeatureAttributeChange::new(
                assembly,
                FeatureAttributeChangeDetails {
                    feature_id: gene.id,
                    old_attributes: Attributes::new(),
                    new_attributes: Attributes::new(),
                },
            )
            .into();
            let err = service.submit_change(&change, "alice", None).unwrap_err();

            assert!(matches!(err.innermost(), ChangeError::ValueMismatch { field: "attributes", .. }));
            assert_eq!(current(&service, gene.id), gene);
        }
    }

    describe "undo" {
        it "submits the inverse and links it to the undone record" {
            let ctg_a = add_assembly(&service, assembly);
            let (gene, _) = gene_with_exon(ctg_a);
            let added = add_feature(&service, assembly, &gene);

            let undo = service.undo(added.sequence, "bob").expect("Undo failed");

            assert_eq!(undo.type_name, "DeleteFeatureChange");
            assert_eq!(undo.reverts, Some(added.sequence));
            assert_eq!(undo.user, "bob");
            assert!(service.feature(gene.id).expect("Query failed").is_none());
        }

        it "refuses to undo the same change twice" {
            let ctg_a = add_assembly(&service, assembly);
            let (gene, _) = gene_with_exon(ctg_a);
            let added = add_feature(&service, assembly, &gene);
            service.undo(added.sequence, "bob").expect("Undo failed");

            let err = service.undo(added.sequence, "bob").unwrap_err();
            assert!(matches!(err, ChangeError::AlreadyExists(_)));
        }

        it "reports an unknown record" {
            assert!(matches!(service.undo(42, "bob"), Err(ChangeError::ChangeNotFound(42))));
        }

        it "reports a change with no inverse" {
            add_assembly(&service, assembly);
            let deleted = service
                .submit_change(&DeleteAssemblyChange { assembly }.into(), "alice", None)
                .expect("Delete failed");

            let err = service.undo(deleted.sequence, "alice").unwrap_err();
            assert!(matches!(err, ChangeError::InverseNotImplemented("DeleteAssemblyChange")));
        }
    }

    describe "serialized submission" {
        it "decodes the wire form and logs it unchanged" {
            let ctg_a = add_assembly(&service, assembly);
            let (gene, exon) = gene_with_exon(ctg_a);
            add_feature(&service, assembly, &gene);

            let payload = json!({
                "typeName": "StrandChange",
                "assembly": assembly,
                "featureId": exon,
                "oldStrand": null,
                "newStrand": "forward"
            });
            let record = service.submit(payload, "alice").expect("Change failed");

            assert_eq!(record.type_name, "StrandChange");
            assert_eq!(record.change["featureId"], json!(exon));
            assert_eq!(
                current(&service, gene.id).find(exon).and_then(|e| e.strand),
                Some(Strand::Forward)
            );
        }

        it "rejects an unknown type name" {
            let err = service
                .submit(json!({ "typeName": "RenameChange", "assembly": assembly }), "alice")
                .unwrap_err();
            assert!(matches!(err, ChangeError::UnknownChangeType(name) if name == "RenameChange"));
        }
    }

    describe "broadcast" {
        it "publishes accepted changes in channel order" {
            let mut receiver = service.subscribe(assembly);
            let ctg_a = add_assembly(&service, assembly);
            let (gene, _) = gene_with_exon(ctg_a);
            add_feature(&service, assembly, &gene);

            let first = receiver.try_recv().expect("Missing first message");
            let second = receiver.try_recv().expect("Missing second message");
            assert_eq!((first.sequence, second.sequence), (1, 2));
            assert_eq!(second.channel, assembly.to_string());
            assert_eq!(second.user, "alice");
            assert_eq!(second.change["typeName"], "AddFeatureChange");
        }

        it "publishes nothing for a rejected change" {
            add_assembly(&service, assembly);
            let mut receiver = service.subscribe(assembly);

            let change: Change = DeleteFeatureChange {
                assembly,
                deleted_feature: AnnotationFeature::new(ref_seq_id(assembly, "ctgA"), "gene", 1, 2),
                parent_feature_id: None,
                index: None,
                force: false,
            }
            .into();
            assert!(service.submit_change(&change, "alice", None).is_err());
            assert!(receiver.try_recv().is_err());
        }

        it "replays into a client session to the same state" {
            let mut receiver = service.subscribe(assembly);
            let ctg_a = add_assembly(&service, assembly);
            let (gene, exon) = gene_with_exon(ctg_a);
            add_feature(&service, assembly, &gene);
            let tree = FeatureTree::from_feature(&gene);
            let change = LocationEndChange::propagated(assembly, &tree, exon, 250, false)
                .expect("Failed to plan");
            service.submit_change(&change.into(), "alice", None).expect("Change failed");

            let mut session = ClientSession::new(
                "bob",
                service.registry().clone(),
                service.validations().clone(),
            );
            while let Ok(message) = receiver.try_recv() {
                assert_eq!(session.receive(&message), SyncStatus::Applied);
            }

            assert_eq!(session.last_seen(&assembly.to_string()), Some(3));
            assert_eq!(session.store().feature(gene.id), Some(current(&service, gene.id)));
        }
    }
}
