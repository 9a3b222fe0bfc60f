// Expose the modules
pub mod config;
pub mod domain;

// Re-export key types for easier usage
pub use config::Config;
pub use domain::models::close::{CloseCode, CloseError};
pub use domain::models::envelope::{Envelope, EventType};
pub use domain::services::nozzle::{CloseHandle, Nozzle, NozzleError, TerminationCause};
pub use domain::services::router::{EventRouter, LoggingRouter, MemoryRouter, RouteError};
pub use domain::services::source::{
    CloseBehavior, EventSource, EventStream, MemoryEventSource, SourceError, TransportError,
};
