//! In-memory event source producing synthetic firehose envelopes.
//!
//! Used by the demo binary and by tests to drive the nozzle deterministically:
//! the number of envelopes, their rate and the way the connection reports its
//! own closure are all configurable.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::{
    select,
    sync::mpsc::{self, Sender},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{EventSource, EventStream, SourceError, TransportError};
use crate::domain::models::close::{CloseCode, CloseError};
use crate::domain::models::envelope::{Envelope, EventType};

const CHANNEL_CAPACITY: usize = 1024;
const ORIGIN: &str = "memory-source";

/// What the source reports on its error channel when it is closed
#[derive(Debug, Clone)]
pub enum CloseBehavior {
    /// Close without reporting anything
    Silent,
    /// Report a structured close with the given status
    CloseCode(CloseCode),
    /// Report an unstructured transport failure
    Transport(TransportError),
}

impl CloseBehavior {
    fn into_error(self) -> Option<SourceError> {
        match self {
            CloseBehavior::Silent => None,
            CloseBehavior::CloseCode(code) => Some(SourceError::Close(CloseError::new(
                code,
                code.name().unwrap_or("closed by peer"),
            ))),
            CloseBehavior::Transport(err) => Some(SourceError::Transport(err)),
        }
    }
}

#[derive(Default)]
struct State {
    opened: bool,
    reading: bool,
    errors_tx: Option<Sender<SourceError>>,
    producer: Option<(JoinHandle<()>, CancellationToken)>,
}

/// Event source backed by a tokio task generating envelopes
pub struct MemoryEventSource {
    eps: Option<u32>,
    total: Option<u64>,
    end_of_stream: bool,
    close_behavior: CloseBehavior,
    state: Mutex<State>,
}

impl MemoryEventSource {
    /// Creates a new in-memory source
    ///
    /// # Arguments
    /// * `eps` - Envelopes per second, `None` for unthrottled
    /// * `total` - Envelopes to produce, `None` for an endless stream
    /// * `close_behavior` - What `close` reports on the error channel
    pub fn new(eps: Option<u32>, total: Option<u64>, close_behavior: CloseBehavior) -> Self {
        Self {
            eps,
            total,
            end_of_stream: false,
            close_behavior,
            state: Mutex::new(State::default()),
        }
    }

    /// Ends the stream on its own once `total` envelopes were produced.
    /// Without this the connection stays open until closed.
    pub fn with_end_of_stream(mut self) -> Self {
        self.end_of_stream = true;
        self
    }

    /// Ends the stream from the source side without reporting an error
    pub fn finish(&self) {
        let mut state = self.state.lock();
        Self::stop(&mut state, None);
        debug!("memory source finished");
    }

    /// Ends the stream from the source side, reporting `err` as the cause
    pub fn fail(&self, err: SourceError) {
        let mut state = self.state.lock();
        debug!("memory source failing with {}", err);
        Self::stop(&mut state, Some(err));
    }

    /// Queues the terminal error (if any), then drops both producer sides
    fn stop(state: &mut State, err: Option<SourceError>) {
        if let Some(errors_tx) = state.errors_tx.take() {
            if let Some(err) = err {
                if errors_tx.try_send(err).is_err() {
                    warn!("memory source could not queue its terminal error");
                }
            }
        }

        if let Some((_handle, token)) = state.producer.take() {
            token.cancel();
        }
    }

    fn spawn_producer(&self, events_tx: Sender<Envelope>, token: CancellationToken) -> JoinHandle<()> {
        let eps = self.eps;
        let total = self.total;
        let end_of_stream = self.end_of_stream;

        tokio::spawn(async move {
            let mut ticker = eps.filter(|eps| *eps > 0).map(|eps| {
                tokio::time::interval(Duration::from_secs_f64(1.0 / f64::from(eps)))
            });

            let mut produced: u64 = 0;
            while total.is_none_or(|total| produced < total) {
                if let Some(ticker) = ticker.as_mut() {
                    select! {
                        _ = token.cancelled() => return,
                        _ = ticker.tick() => {}
                    }
                }

                let envelope = Envelope::new(
                    ORIGIN,
                    EventType::ValueMetric,
                    json!({ "name": "sequence", "value": produced }),
                );

                select! {
                    _ = token.cancelled() => return,
                    sent = events_tx.send(envelope) => {
                        if sent.is_err() {
                            debug!("memory source consumer went away");
                            return;
                        }
                    }
                }
                produced += 1;
            }

            debug!("memory source produced {} envelopes", produced);
            if !end_of_stream {
                // Hold the connection open until it is closed
                token.cancelled().await;
            }
        })
    }
}

#[async_trait]
impl EventSource for MemoryEventSource {
    async fn open(&self) -> Result<(), SourceError> {
        let mut state = self.state.lock();
        if state.opened {
            return Err(SourceError::AlreadyOpen);
        }
        state.opened = true;
        info!("memory source opened");
        Ok(())
    }

    fn read(&self) -> Result<EventStream, SourceError> {
        let mut state = self.state.lock();
        if !state.opened {
            return Err(SourceError::NotOpen);
        }
        if state.reading {
            return Err(SourceError::AlreadyReading);
        }
        state.reading = true;

        let (events_tx, events) = mpsc::channel(CHANNEL_CAPACITY);
        let (errors_tx, errors) = mpsc::channel(1);
        let token = CancellationToken::new();
        let handle = self.spawn_producer(events_tx, token.clone());

        state.errors_tx = if self.end_of_stream && self.total.is_some() {
            // The stream ends by itself and never reports an error
            drop(errors_tx);
            None
        } else {
            Some(errors_tx)
        };
        state.producer = Some((handle, token));

        Ok(EventStream { events, errors })
    }

    async fn close(&self) -> Result<(), SourceError> {
        let mut state = self.state.lock();
        let err = self.close_behavior.clone().into_error();
        Self::stop(&mut state, err);
        info!("memory source closed");
        Ok(())
    }
}
