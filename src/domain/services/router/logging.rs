use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::debug;

use super::{EventRouter, RouteError};
use crate::domain::models::envelope::Envelope;

/// Router writing each envelope as JSON to the trace log
#[derive(Debug, Default)]
pub struct LoggingRouter {
    routed: AtomicU64,
}

impl LoggingRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of envelopes routed so far
    pub fn routed(&self) -> u64 {
        self.routed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventRouter for LoggingRouter {
    async fn route(&self, envelope: Envelope) -> Result<(), RouteError> {
        let json = serde_json::to_string(&envelope).map_err(|e| RouteError::Encode(e.to_string()))?;
        let seq = self.routed.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(seq, origin = %envelope.origin, "routed envelope: {}", json);
        Ok(())
    }
}
