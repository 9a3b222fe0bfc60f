use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{EventRouter, RouteError};
use crate::domain::models::envelope::Envelope;

/// Router that stores every envelope it receives
///
/// Clones share the same storage, so a test can keep one handle while the
/// nozzle owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryRouter {
    events: Arc<RwLock<Vec<Envelope>>>,
    failing: bool,
}

impl MemoryRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// A router that refuses every envelope
    pub fn failing() -> Self {
        Self {
            events: Arc::default(),
            failing: true,
        }
    }

    /// Returns a snapshot of the envelopes routed so far
    pub fn events(&self) -> Vec<Envelope> {
        self.events.read().clone()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

#[async_trait]
impl EventRouter for MemoryRouter {
    async fn route(&self, envelope: Envelope) -> Result<(), RouteError> {
        if self.failing {
            return Err(RouteError::Delivery("memory router is failing".to_string()));
        }
        self.events.write().push(envelope);
        Ok(())
    }
}
