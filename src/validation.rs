//! Pluggable checks run around change execution.
//!
//! A [`ValidationSet`] is built explicitly and shared by reference. Hooks run
//! before and after execution on the server and on the client; the "after"
//! hooks see the current state of every changed feature that still exists.
//! Any refusal aborts the change.

use std::sync::Arc;

use crate::changes::Change;
use crate::error::{ChangeError, Result};
use crate::models::AnnotationFeature;

pub trait Validation: Send + Sync {
    fn name(&self) -> &str;

    fn before_server(&self, _change: &Change) -> Result<(), String> {
        Ok(())
    }

    fn after_server(&self, _change: &Change, _features: &[AnnotationFeature]) -> Result<(), String> {
        Ok(())
    }

    fn before_client(&self, _change: &Change) -> Result<(), String> {
        Ok(())
    }

    fn after_client(&self, _change: &Change, _features: &[AnnotationFeature]) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
enum Hook {
    BeforeServer,
    AfterServer,
    BeforeClient,
    AfterClient,
}

#[derive(Clone, Default)]
pub struct ValidationSet {
    validations: Vec<Arc<dyn Validation>>,
}

impl ValidationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, validation: impl Validation + 'static) -> Self {
        self.register(validation);
        self
    }

    pub fn register(&mut self, validation: impl Validation + 'static) {
        self.validations.push(Arc::new(validation));
    }

    pub fn len(&self) -> usize {
        self.validations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validations.is_empty()
    }

    pub fn before_server(&self, change: &Change) -> Result<()> {
        self.run(Hook::BeforeServer, change, &[])
    }

    pub fn after_server(&self, change: &Change, features: &[AnnotationFeature]) -> Result<()> {
        self.run(Hook::AfterServer, change, features)
    }

    pub fn before_client(&self, change: &Change) -> Result<()> {
        self.run(Hook::BeforeClient, change, &[])
    }

    pub fn after_client(&self, change: &Change, features: &[AnnotationFeature]) -> Result<()> {
        self.run(Hook::AfterClient, change, features)
    }

    fn run(&self, hook: Hook, change: &Change, features: &[AnnotationFeature]) -> Result<()> {
        for validation in &self.validations {
            let outcome = match hook {
                Hook::BeforeServer => validation.before_server(change),
                Hook::AfterServer => validation.after_server(change, features),
                Hook::BeforeClient => validation.before_client(change),
                Hook::AfterClient => validation.after_client(change, features),
            };
            if let Err(reason) = outcome {
                tracing::warn!(
                    validation = validation.name(),
                    hook = ?hook,
                    type_name = change.type_name(),
                    %reason,
                    "validation refused change"
                );
                return Err(ChangeError::ValidationFailed {
                    name: validation.name().to_string(),
                    reason,
                });
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for ValidationSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.validations.iter().map(|v| v.name()).collect();
        f.debug_struct("ValidationSet").field("validations", &names).finish()
    }
}
