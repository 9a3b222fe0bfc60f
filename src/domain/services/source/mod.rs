//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// This module defines the port through which the nozzle pulls events off the firehose.
// A source hands out two channels: one for envelopes, one for the error that ended the
// stream. Closing the source tears the connection down and lets both channels drain.
//
// | Component         | Description                                                |
// |-------------------|------------------------------------------------------------|
// | EventSource       | Trait implemented by firehose connections                  |
// | EventStream       | Envelope and error receivers returned by `read`            |
// | SourceError       | Everything a source can report                             |
// | TransportError    | Opaque, identity-preserving wrapper for transport faults   |
// | MemoryEventSource | In-memory source producing synthetic envelopes             |
//--------------------------------------------------------------------------------------------------

pub mod memory;

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc::Receiver;

use crate::domain::models::close::CloseError;
use crate::domain::models::envelope::Envelope;

pub use memory::{CloseBehavior, MemoryEventSource};

/// An opaque failure surfaced while reading from the firehose.
///
/// The wrapped error is shared, never rebuilt: cloning a `TransportError`
/// yields a handle to the very same error value, which `same_as` checks.
#[derive(Clone)]
pub struct TransportError(Arc<dyn StdError + Send + Sync + 'static>);

impl TransportError {
    pub fn new<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self(Arc::new(err))
    }

    /// Wraps a plain message, for sources that only have text to report
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(Message(message.into()))
    }

    /// Returns true when both handles point to the same underlying error
    pub fn same_as(&self, other: &TransportError) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TransportError").field(&self.0).finish()
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl StdError for TransportError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.0.source()
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
struct Message(String);

/// Errors reported by an event source
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    /// The connection was closed with a structured status
    #[error(transparent)]
    Close(#[from] CloseError),

    /// The source retried internally and gave up; wraps the last failure
    #[error("gave up after retries: {0}")]
    Retry(Box<SourceError>),

    /// Any other read failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The source was opened twice
    #[error("event source is already open")]
    AlreadyOpen,

    /// `read` was called on a source that was never opened
    #[error("event source is not open")]
    NotOpen,

    /// `read` was called twice on the same connection
    #[error("event source is already streaming")]
    AlreadyReading,
}

impl SourceError {
    pub fn retry(inner: SourceError) -> Self {
        SourceError::Retry(Box::new(inner))
    }

    /// Strips any number of retry wrappers
    pub fn into_innermost(self) -> SourceError {
        match self {
            SourceError::Retry(inner) => inner.into_innermost(),
            other => other,
        }
    }
}

/// Receivers handed out by [`EventSource::read`]
///
/// `events` ending means the stream is over. `errors` yields the failure that
/// ended it, if any; a source reports at most one terminal error per stream.
#[derive(Debug)]
pub struct EventStream {
    pub events: Receiver<Envelope>,
    pub errors: Receiver<SourceError>,
}

/// A long-lived connection to the platform firehose
///
/// Implementations must let `close` run while a consumer is waiting on the
/// channels returned by `read`: closing drops the producer side so both
/// receivers complete, after the terminal error (if any) has been queued.
/// A source that ends on its own queues its terminal error before it stops
/// producing envelopes, and produces nothing after it.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Establishes the connection
    async fn open(&self) -> Result<(), SourceError>;

    /// Starts streaming and returns the envelope and error receivers
    fn read(&self) -> Result<EventStream, SourceError>;

    /// Tears the connection down
    async fn close(&self) -> Result<(), SourceError>;
}
