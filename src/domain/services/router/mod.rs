//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// This module defines the sink side of the nozzle. A router accepts one envelope at a
// time; whatever it does with it (batching, filtering, delivery) is its own business.
//
// | Component       | Description                                                  |
// |-----------------|--------------------------------------------------------------|
// | EventRouter     | Trait for components accepting envelopes from the nozzle     |
// | RouteError      | Failure reported by a router for a single envelope           |
// | MemoryRouter    | Router keeping every envelope in memory                      |
// | LoggingRouter   | Router writing every envelope to the trace log               |
//--------------------------------------------------------------------------------------------------

pub mod logging;
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::models::envelope::Envelope;

pub use logging::LoggingRouter;
pub use memory::MemoryRouter;

/// Errors a router can report for a single envelope
#[derive(Debug, Clone, Error)]
pub enum RouteError {
    /// The envelope could not be encoded for the sink
    #[error("Failed to encode envelope: {0}")]
    Encode(String),

    /// The sink refused or failed to take the envelope
    #[error("Failed to deliver envelope: {0}")]
    Delivery(String),
}

/// Sink for envelopes pulled off the firehose
///
/// `route` is awaited before the next envelope is read, so a router that
/// blocks becomes the nozzle's backpressure point.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventRouter: Send + Sync {
    /// Accepts one envelope
    async fn route(&self, envelope: Envelope) -> Result<(), RouteError>;
}
