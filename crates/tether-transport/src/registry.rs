//! Ordered transport registry
//!
//! Each connection engine owns one registry. There is no process-wide table,
//! so independent clients can register different factories side by side.

use crate::traits::TransportFactory;
use std::fmt;
use std::sync::Arc;
use tether_core::TransportKind;

/// Transport factories keyed by kind, in registration order
#[derive(Clone, Default)]
pub struct TransportRegistry {
    factories: Vec<Arc<dyn TransportFactory>>,
}

impl TransportRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory, replacing any earlier factory of the same kind
    pub fn register(&mut self, factory: Arc<dyn TransportFactory>) -> &mut Self {
        let kind = factory.kind();
        self.factories.retain(|existing| existing.kind() != kind);
        self.factories.push(factory);
        self
    }

    /// Builder form of [`TransportRegistry::register`]
    pub fn with(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.register(factory);
        self
    }

    /// Factory for `kind`
    pub fn get(&self, kind: TransportKind) -> Option<Arc<dyn TransportFactory>> {
        self.factories
            .iter()
            .find(|factory| factory.kind() == kind)
            .cloned()
    }

    /// Registered kinds in registration order
    pub fn kinds(&self) -> Vec<TransportKind> {
        self.factories.iter().map(|factory| factory.kind()).collect()
    }

    /// Kinds from `priority` that are registered and available, in that order
    pub fn viable(&self, priority: &[TransportKind]) -> Vec<TransportKind> {
        priority
            .iter()
            .copied()
            .filter(|kind| self.get(*kind).is_some_and(|factory| factory.is_available()))
            .collect()
    }

    /// Whether no factory is registered
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
