//! Error taxonomy for the change engine.
//!
//! Every failure a caller can observe is one of these variants. Storage and
//! codec failures from lower layers are wrapped so the submission boundary
//! can still report a stable message.

use thiserror::Error;
use uuid::Uuid;

pub type Result<T, E = ChangeError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ChangeError {
    #[error("unknown operation type \"{0}\"")]
    UnknownOperationType(String),

    #[error("unknown change type \"{0}\"")]
    UnknownChangeType(String),

    #[error("malformed operation: {0}")]
    MalformedOperation(String),

    #[error("\"{0}\" is already registered")]
    DuplicateRegistration(String),

    #[error("feature {0} not found")]
    FeatureNotFound(Uuid),

    #[error("assembly {0} not found")]
    AssemblyNotFound(String),

    #[error("reference sequence {0} not found")]
    RefSeqNotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("change {0} not found")]
    ChangeNotFound(i64),

    #[error("invalid interval on feature {feature_id}: min {min} must be less than max {max}")]
    InvalidInterval { feature_id: Uuid, min: u64, max: u64 },

    #[error("feature {feature_id} [{min}, {max}) lies outside [{outer_min}, {outer_max})")]
    OutOfBounds {
        feature_id: Uuid,
        min: u64,
        max: u64,
        outer_min: u64,
        outer_max: u64,
    },

    #[error("feature {feature_id} has {bound} {found}, change expected {expected}")]
    LocationMismatch {
        feature_id: Uuid,
        bound: &'static str,
        expected: u64,
        found: u64,
    },

    #[error("discontinuous locations of feature {feature_id} are invalid: {reason}")]
    InvalidLocations {
        feature_id: Uuid,
        reason: &'static str,
    },

    #[error("{target} has {field} {found}, change expected {expected}")]
    ValueMismatch {
        target: String,
        field: &'static str,
        expected: String,
        found: String,
    },

    #[error("feature {0} changed after the change was created")]
    StaleSnapshot(Uuid),

    #[error("inverse is not implemented for {0}")]
    InverseNotImplemented(&'static str),

    #[error("{type_name} cannot be executed on the {backend} backend")]
    UnsupportedBackend {
        type_name: &'static str,
        backend: &'static str,
    },

    #[error("validation \"{name}\" rejected the change: {reason}")]
    ValidationFailed { name: String, reason: String },

    #[error("file {0} not found")]
    FileNotFound(String),

    #[error("could not parse {format} input at line {line}: {message}")]
    Parse {
        format: &'static str,
        line: usize,
        message: String,
    },

    #[error("transaction aborted: {0}")]
    TransactionAborted(#[source] Box<ChangeError>),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChangeError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedOperation(message.into())
    }

    /// A recorded old value that no longer matches what is stored.
    pub fn value_mismatch(
        target: impl std::fmt::Display,
        field: &'static str,
        expected: impl std::fmt::Debug,
        found: impl std::fmt::Debug,
    ) -> Self {
        Self::ValueMismatch {
            target: target.to_string(),
            field,
            expected: format!("{:?}", expected),
            found: format!("{:?}", found),
        }
    }

    pub fn unsupported(type_name: &'static str, backend: &'static str) -> Self {
        Self::UnsupportedBackend { type_name, backend }
    }

    /// Wrap an execution failure. Already-aborted errors are not wrapped twice.
    pub fn aborted(inner: ChangeError) -> Self {
        match inner {
            aborted @ Self::TransactionAborted(_) => aborted,
            other => Self::TransactionAborted(Box::new(other)),
        }
    }

    /// The error underneath any `TransactionAborted` wrappers.
    pub fn innermost(&self) -> &ChangeError {
        match self {
            Self::TransactionAborted(inner) => inner.innermost(),
            other => other,
        }
    }

    /// Human-readable message sourced from the innermost error.
    pub fn user_message(&self) -> String {
        self.innermost().to_string()
    }

    /// Stable machine-readable kind, used in HTTP error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownOperationType(_) => "UnknownOperationType",
            Self::UnknownChangeType(_) => "UnknownChangeType",
            Self::MalformedOperation(_) => "MalformedOperation",
            Self::DuplicateRegistration(_) => "DuplicateRegistration",
            Self::FeatureNotFound(_) => "FeatureNotFound",
            Self::AssemblyNotFound(_) => "AssemblyNotFound",
            Self::RefSeqNotFound(_) => "RefSeqNotFound",
            Self::AlreadyExists(_) => "AlreadyExists",
            Self::ChangeNotFound(_) => "ChangeNotFound",
            Self::InvalidInterval { .. } => "InvalidInterval",
            Self::OutOfBounds { .. } => "OutOfBounds",
            Self::LocationMismatch { .. } => "LocationMismatch",
            Self::InvalidLocations { .. } => "InvalidLocations",
            Self::ValueMismatch { .. } => "ValueMismatch",
            Self::StaleSnapshot(_) => "StaleSnapshot",
            Self::InverseNotImplemented(_) => "InverseNotImplemented",
            Self::UnsupportedBackend { .. } => "UnsupportedBackend",
            Self::ValidationFailed { .. } => "ValidationFailed",
            Self::FileNotFound(_) => "FileNotFound",
            Self::Parse { .. } => "Parse",
            Self::TransactionAborted(_) => "TransactionAborted",
            Self::Storage(_) => "Storage",
            Self::Serialization(_) => "Serialization",
            Self::Io(_) => "Io",
        }
    }
}
