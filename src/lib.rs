//! Collaborative genome-annotation change engine.
//!
//! Edits to nested annotation features are expressed as serializable
//! [`changes::Change`] values. The same change runs against the authoritative
//! SQLite store inside a transaction, against a client's optimistic copy, or
//! against a GFF3 flat file, and can produce its own inverse for undo.
//! Accepted changes are logged and broadcast per assembly in acceptance order.

pub mod api;
pub mod backend;
pub mod broadcast;
pub mod changes;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod operations;
pub mod parse;
pub mod registry;
pub mod service;
pub mod tree;
pub mod validation;

pub use error::{ChangeError, Result};
