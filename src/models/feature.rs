use std::collections::{BTreeMap, BTreeSet};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Attribute values keyed by attribute name. Values keep their source order.
pub type Attributes = BTreeMap<String, Vec<String>>;

/// The strand a feature is annotated on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Strand {
    Forward,
    Reverse,
}

impl Strand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Forward => "forward",
            Self::Reverse => "reverse",
        }
    }

    /// GFF3 column 7 symbol.
    pub fn symbol(&self) -> char {
        match self {
            Self::Forward => '+',
            Self::Reverse => '-',
        }
    }

    pub fn from_symbol(s: &str) -> Option<Self> {
        match s {
            "+" => Some(Self::Forward),
            "-" => Some(Self::Reverse),
            _ => None,
        }
    }
}

/// A half-open sub-interval of a feature, e.g. one exon of a spliced CDS.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location {
    pub start: u64,
    pub end: u64,
}

/// A node of the annotation hierarchy in its nested (document) form.
///
/// This is the shape features take on the wire, in the document store and in
/// change payloads. Children are owned exclusively and kept in insertion
/// order; equality is structural and order-sensitive for children. For
/// editing, a top-level feature is loaded into a [`crate::tree::FeatureTree`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationFeature {
    pub id: Uuid,
    pub ref_seq: Uuid,
    pub min: u64,
    pub max: u64,
    #[serde(rename = "type")]
    pub feature_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strand: Option<Strand>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: Attributes,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub children: IndexMap<Uuid, AnnotationFeature>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub discontinuous_locations: Vec<Location>,
    #[serde(default)]
    pub status: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl AnnotationFeature {
    pub fn new(ref_seq: Uuid, feature_type: impl Into<String>, min: u64, max: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            ref_seq,
            min,
            max,
            feature_type: feature_type.into(),
            strand: None,
            attributes: Attributes::new(),
            children: IndexMap::new(),
            discontinuous_locations: Vec::new(),
            status: 0,
            user: None,
        }
    }

    pub fn with_strand(mut self, strand: Strand) -> Self {
        self.strand = Some(strand);
        self
    }

    pub fn with_child(mut self, child: AnnotationFeature) -> Self {
        self.children.insert(child.id, child);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes
            .entry(key.into())
            .or_default()
            .push(value.into());
        self
    }

    /// This feature's id plus the ids of every descendant.
    pub fn all_ids(&self) -> BTreeSet<Uuid> {
        let mut ids = BTreeSet::new();
        self.collect_ids(&mut ids);
        ids
    }

    fn collect_ids(&self, ids: &mut BTreeSet<Uuid>) {
        ids.insert(self.id);
        for child in self.children.values() {
            child.collect_ids(ids);
        }
    }

    /// Depth-first lookup of a descendant (or self) by id.
    pub fn find(&self, id: Uuid) -> Option<&AnnotationFeature> {
        if self.id == id {
            return Some(self);
        }
        self.children.values().find_map(|child| child.find(id))
    }
}

impl PartialEq for AnnotationFeature {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.ref_seq == other.ref_seq
            && self.min == other.min
            && self.max == other.max
            && self.feature_type == other.feature_type
            && self.strand == other.strand
            && self.attributes == other.attributes
            && self.discontinuous_locations == other.discontinuous_locations
            && self.status == other.status
            && self.user == other.user
            && self.children.len() == other.children.len()
            && self.children.iter().eq(other.children.iter())
    }
}
