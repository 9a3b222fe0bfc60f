//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// This module implements the nozzle: the loop pulling envelopes off an event source and
// handing them, one at a time and in order, to an event router. A run ends when the
// source ends its stream, reports an error, or when `close` is called, whichever is
// observed first. That first signal alone decides what `start` returns.
//
// | Component          | Description                                                  |
// |--------------------|--------------------------------------------------------------|
// | Nozzle             | Owns the source and router, runs the pump loop               |
// | CloseHandle        | Cloneable handle requesting shutdown from another task       |
// | NozzleError        | Error form of a termination cause, plus lifecycle errors     |
// | TerminationCause   | Tagged union of the ways a run can end                       |
//--------------------------------------------------------------------------------------------------

mod termination;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use thiserror::Error;
use tokio::{select, sync::mpsc::Receiver};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::Config;
use crate::domain::models::close::{CloseCode, CloseError};
use crate::domain::models::envelope::Envelope;
use crate::domain::services::router::EventRouter;
use crate::domain::services::source::{EventSource, EventStream, SourceError, TransportError};

pub use termination::TerminationCause;

/// Errors returned by [`Nozzle::start`]
#[derive(Debug, Error)]
pub enum NozzleError {
    /// `start` was called more than once on the same nozzle
    #[error("Nozzle has already been started")]
    AlreadyStarted,

    /// The event source could not be opened
    #[error("Failed to open event source: {0}")]
    Open(SourceError),

    /// The event source refused to stream
    #[error("Failed to read from event source: {0}")]
    Read(SourceError),

    /// The connection was closed with a status code
    #[error(transparent)]
    Closed(CloseError),

    /// The connection failed without a status code
    #[error(transparent)]
    Transport(TransportError),
}

impl NozzleError {
    /// Close status carried by the error, if any
    pub fn close_code(&self) -> Option<CloseCode> {
        match self {
            NozzleError::Closed(close) => Some(close.code()),
            _ => None,
        }
    }
}

/// Requests shutdown of the nozzle it was taken from
///
/// Calling `close` more than once, or after the run has ended, does nothing.
#[derive(Debug, Clone)]
pub struct CloseHandle {
    closing: CancellationToken,
}

impl CloseHandle {
    pub fn close(&self) {
        self.closing.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closing.is_cancelled()
    }
}

/// Forwards envelopes from an event source to an event router
///
/// ## Lifecycle
///
/// A nozzle runs once. `start` blocks (asynchronously) until the run ends and
/// a second `start` fails with [`NozzleError::AlreadyStarted`]. `close` may be
/// called from any task, any number of times, before, during or after the run.
/// To reconnect, build a new nozzle.
///
/// ## Shutdown
///
/// `close` only trips a cancellation token, it never waits. The loop races
/// every read against that token, so a pending read is abandoned immediately.
/// The loop then closes the source and collects whatever error the source
/// reported while going down: a structured close or transport error is
/// returned as-is, otherwise the run ended cleanly.
///
/// However the run ends, the source is closed exactly once before `start`
/// returns, including when the source ended the stream itself.
pub struct Nozzle<S, R> {
    id: Uuid,
    source: S,
    router: R,
    config: Config,
    closing: CancellationToken,
    started: AtomicBool,
    routed: AtomicU64,
}

impl<S, R> Nozzle<S, R>
where
    S: EventSource,
    R: EventRouter,
{
    pub fn new(source: S, router: R, config: Config) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            router,
            config,
            closing: CancellationToken::new(),
            started: AtomicBool::new(false),
            routed: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn router(&self) -> &R {
        &self.router
    }

    /// Number of envelopes handed to the router so far
    pub fn routed(&self) -> u64 {
        self.routed.load(Ordering::SeqCst)
    }

    /// Runs the pump until it terminates
    ///
    /// # Returns
    /// `Ok(())` when stopped by `close` (or a clean end of stream), otherwise the
    /// close status or transport error that ended the stream
    ///
    /// # Errors
    /// Also fails if the nozzle was already started or the source cannot be opened
    pub async fn start(&self) -> Result<(), NozzleError> {
        self.run().await?.into_result()
    }

    /// Same as [`Nozzle::start`], returning the termination cause as a value
    pub async fn run(&self) -> Result<TerminationCause, NozzleError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(NozzleError::AlreadyStarted);
        }

        let span = info_span!(
            "nozzle",
            id = %self.id,
            subscription_id = %self.config.subscription_id
        );
        self.pump().instrument(span).await
    }

    /// Requests shutdown; never blocks
    pub fn close(&self) {
        if !self.closing.is_cancelled() {
            debug!(id = %self.id, "nozzle close requested");
        }
        self.closing.cancel();
    }

    /// Returns a handle that can close this nozzle from another task
    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            closing: self.closing.clone(),
        }
    }

    async fn pump(&self) -> Result<TerminationCause, NozzleError> {
        if self.closing.is_cancelled() {
            info!("Nozzle closed before it started, not connecting");
            return Ok(TerminationCause::Clean);
        }

        info!("Opening firehose connection");
        select! {
            biased;
            _ = self.closing.cancelled() => {
                info!("Nozzle closed while connecting");
                self.close_source().await;
                return Ok(TerminationCause::Clean);
            }
            opened = self.source.open() => opened.map_err(NozzleError::Open)?,
        }

        let EventStream {
            mut events,
            mut errors,
        } = match self.source.read() {
            Ok(stream) => stream,
            Err(err) => {
                self.close_source().await;
                return Err(NozzleError::Read(err));
            }
        };

        info!("Nozzle started, forwarding events");

        let mut errors_open = true;
        let mut source_closed = false;
        let cause = loop {
            select! {
                biased;
                _ = self.closing.cancelled() => {
                    source_closed = true;
                    break self.shutdown(&mut errors).await;
                }
                envelope = events.recv() => match envelope {
                    Some(envelope) => self.forward(envelope).await,
                    None => {
                        info!("Firehose stream ended");
                        break match errors.try_recv() {
                            Ok(err) => TerminationCause::classify(err),
                            Err(_) => TerminationCause::Clean,
                        };
                    }
                },
                reported = errors.recv(), if errors_open => match reported {
                    Some(err) => break TerminationCause::classify(err),
                    // No error will be reported; keep reading until the stream ends
                    None => errors_open = false,
                },
            }
        };

        if !source_closed {
            // The source ended the run; release the connection, the cause is already decided
            self.close_source().await;
        }

        cause.log();
        info!(routed = self.routed(), "Nozzle stopped");
        Ok(cause)
    }

    async fn forward(&self, envelope: Envelope) {
        let result = self.router.route(envelope).await;
        self.routed.fetch_add(1, Ordering::SeqCst);

        if let Err(err) = result {
            if self.config.log_route_errors {
                error!("Failed to route event: {}", err);
            }
        }
    }

    async fn close_source(&self) {
        if let Err(err) = self.source.close().await {
            warn!("Failed to close event source: {}", err);
        }
    }

    /// Closes the source and collects the error it reported while closing
    async fn shutdown(&self, errors: &mut Receiver<SourceError>) -> TerminationCause {
        info!("Closing firehose connection");

        let mut reported = Vec::new();
        match self.source.close().await {
            Ok(()) => {
                while let Some(err) = errors.recv().await {
                    reported.push(err);
                }
            }
            Err(err) => {
                warn!("Failed to close event source: {}", err);
                // The source may never release its error channel; take what is queued
                while let Ok(queued) = errors.try_recv() {
                    reported.push(queued);
                }
                reported.push(err);
            }
        }

        let mut reported = reported.into_iter();
        let cause = match reported.next() {
            Some(err) => TerminationCause::classify(err),
            None => TerminationCause::Clean,
        };
        for late in reported {
            debug!("Ignoring error reported after termination: {}", late);
        }
        cause
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use mockall::Sequence;
    use parking_lot::Mutex;
    use serde_json::json;
    use tokio::sync::mpsc::{self, Sender};

    use super::*;
    use crate::domain::models::envelope::EventType;
    use crate::domain::services::router::{MemoryRouter, MockEventRouter, RouteError};
    use crate::domain::services::source::{CloseBehavior, MemoryEventSource};

    fn envelope_value(envelope: &Envelope) -> u64 {
        envelope.payload["value"].as_u64().unwrap()
    }

    enum Script {
        /// Streams nothing until closed
        Idle,
        /// Queues a terminal error and keeps the envelope channel open
        QueuedError(SourceError),
        /// Delivers one envelope, then ends both channels
        EndOfStream,
        /// `read` is refused
        ReadFails,
        /// `open` never completes
        OpenHangs,
    }

    /// Source that follows a fixed script and counts `close` calls
    struct ScriptedSource {
        script: Script,
        closes: AtomicUsize,
        senders: Mutex<Option<(Sender<Envelope>, Sender<SourceError>)>>,
    }

    impl ScriptedSource {
        fn new(script: Script) -> Self {
            Self {
                script,
                closes: AtomicUsize::new(0),
                senders: Mutex::new(None),
            }
        }

        fn closes(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EventSource for ScriptedSource {
        async fn open(&self) -> Result<(), SourceError> {
            if matches!(self.script, Script::OpenHangs) {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        fn read(&self) -> Result<EventStream, SourceError> {
            let (events_tx, events) = mpsc::channel(8);
            let (errors_tx, errors) = mpsc::channel(1);

            match &self.script {
                Script::Idle => {
                    *self.senders.lock() = Some((events_tx, errors_tx));
                }
                Script::QueuedError(err) => {
                    errors_tx.try_send(err.clone()).unwrap();
                    *self.senders.lock() = Some((events_tx, errors_tx));
                }
                Script::EndOfStream => {
                    let envelope = Envelope::new("scripted", EventType::LogMessage, json!({ "value": 0 }));
                    events_tx.try_send(envelope).unwrap();
                }
                Script::ReadFails => {
                    return Err(SourceError::Transport(TransportError::msg("stream refused")));
                }
                Script::OpenHangs => return Err(SourceError::NotOpen),
            }

            Ok(EventStream { events, errors })
        }

        async fn close(&self) -> Result<(), SourceError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.senders.lock().take();
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_routes_in_order_and_ends_cleanly() {
        let source = MemoryEventSource::new(None, Some(25), CloseBehavior::Silent).with_end_of_stream();
        let router = MemoryRouter::new();
        let nozzle = Nozzle::new(source, router.clone(), Config::default());

        nozzle.start().await.expect("clean end of stream");

        let values: Vec<u64> = router.events().iter().map(envelope_value).collect();
        assert_eq!(values, (0..25).collect::<Vec<_>>());
        assert_eq!(nozzle.routed(), 25);
    }

    #[tokio::test]
    async fn test_close_before_start_never_opens_source() {
        let source = MemoryEventSource::new(None, Some(5), CloseBehavior::Silent);
        let nozzle = Nozzle::new(source, MemoryRouter::new(), Config::default());

        nozzle.close();
        let cause = nozzle.run().await.unwrap();

        assert!(cause.is_clean());
        assert!(nozzle.router().is_empty());
        // Never opened, so reading still fails
        assert!(matches!(nozzle.source().read(), Err(SourceError::NotOpen)));
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let source = MemoryEventSource::new(None, Some(1), CloseBehavior::Silent).with_end_of_stream();
        let nozzle = Nozzle::new(source, MemoryRouter::new(), Config::default());

        nozzle.start().await.unwrap();
        assert!(matches!(nozzle.start().await, Err(NozzleError::AlreadyStarted)));
    }

    #[tokio::test]
    async fn test_open_failure_is_reported() {
        let source = MemoryEventSource::new(None, Some(1), CloseBehavior::Silent);
        source.open().await.unwrap();
        let nozzle = Nozzle::new(source, MemoryRouter::new(), Config::default());

        match nozzle.start().await {
            Err(NozzleError::Open(SourceError::AlreadyOpen)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_route_failure_does_not_stop_the_pump() {
        let mut router = MockEventRouter::new();
        let mut seq = Sequence::new();
        router
            .expect_route()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(RouteError::Delivery("sink unavailable".to_string())));
        router
            .expect_route()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let source = MemoryEventSource::new(None, Some(3), CloseBehavior::Silent).with_end_of_stream();
        let nozzle = Nozzle::new(source, router, Config::default());

        nozzle.start().await.unwrap();
        assert_eq!(nozzle.routed(), 3);
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_read() {
        // Endless, slow source: the loop spends its time waiting for the next envelope
        let source = MemoryEventSource::new(Some(1), None, CloseBehavior::Silent);
        let nozzle = Arc::new(Nozzle::new(source, MemoryRouter::new(), Config::default()));

        let running = Arc::clone(&nozzle);
        let handle = tokio::spawn(async move { running.start().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        nozzle.close_handle().close();

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("start returns promptly after close")
            .unwrap();
        assert!(result.is_ok());

        let routed = nozzle.routed();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(nozzle.routed(), routed);
    }

    #[tokio::test]
    async fn test_source_error_wins_over_later_close() {
        let source = MemoryEventSource::new(None, Some(2), CloseBehavior::CloseCode(CloseCode::GOING_AWAY));
        let nozzle = Arc::new(Nozzle::new(source, MemoryRouter::new(), Config::default()));

        let running = Arc::clone(&nozzle);
        let handle = tokio::spawn(async move { running.run().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        nozzle
            .source()
            .fail(SourceError::Close(CloseError::new(CloseCode::POLICY_VIOLATION, "slow consumer")));

        let cause = handle.await.unwrap().unwrap();
        nozzle.close();
        nozzle.close();

        assert_eq!(cause.close_code(), Some(CloseCode::POLICY_VIOLATION));
        assert_eq!(nozzle.router().len(), 2);
    }

    #[tokio::test]
    async fn test_envelopes_before_source_error_are_delivered() {
        let source = MemoryEventSource::new(None, Some(10), CloseBehavior::Silent);
        let router = MemoryRouter::new();
        let nozzle = Arc::new(Nozzle::new(source, router.clone(), Config::default()));

        let running = Arc::clone(&nozzle);
        let handle = tokio::spawn(async move { running.run().await });

        while router.len() < 10 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let transport = TransportError::msg("connection reset by peer");
        nozzle.source().fail(SourceError::Transport(transport.clone()));

        match handle.await.unwrap().unwrap() {
            TerminationCause::TransportError(err) => assert!(err.same_as(&transport)),
            other => panic!("unexpected cause: {other:?}"),
        }
        assert_eq!(router.len(), 10);
    }

    #[test]
    fn test_close_handle_is_shared() {
        let source = MemoryEventSource::new(None, None, CloseBehavior::Silent);
        let nozzle = Nozzle::new(source, MemoryRouter::new(), Config::default());
        let handle = nozzle.close_handle();

        assert!(!handle.is_closed());
        nozzle.close();
        assert!(handle.is_closed());
        handle.close();
    }

    #[tokio::test]
    async fn test_mock_router_receives_each_envelope_once() {
        let mut router = MockEventRouter::new();
        router
            .expect_route()
            .withf(|envelope| envelope.event_type == EventType::ValueMetric)
            .times(4)
            .returning(|_| Ok(()));

        let source = MemoryEventSource::new(None, Some(4), CloseBehavior::Silent).with_end_of_stream();
        let nozzle = Nozzle::new(source, router, Config::default());
        nozzle.start().await.unwrap();
    }

    #[tokio::test]
    async fn test_source_error_closes_source_once() {
        let err = SourceError::Close(CloseError::new(CloseCode::POLICY_VIOLATION, "slow consumer"));
        let nozzle = Nozzle::new(ScriptedSource::new(Script::QueuedError(err)), MemoryRouter::new(), Config::default());

        let cause = nozzle.run().await.unwrap();
        assert_eq!(cause.close_code(), Some(CloseCode::POLICY_VIOLATION));
        assert_eq!(nozzle.source().closes(), 1);

        // Closing after the run has ended does not touch the source again
        nozzle.close();
        assert_eq!(nozzle.source().closes(), 1);
    }

    #[tokio::test]
    async fn test_end_of_stream_closes_source_once() {
        let nozzle = Nozzle::new(ScriptedSource::new(Script::EndOfStream), MemoryRouter::new(), Config::default());

        let cause = nozzle.run().await.unwrap();
        assert!(cause.is_clean());
        assert_eq!(nozzle.routed(), 1);
        assert_eq!(nozzle.source().closes(), 1);
    }

    #[tokio::test]
    async fn test_read_failure_closes_source() {
        let nozzle = Nozzle::new(ScriptedSource::new(Script::ReadFails), MemoryRouter::new(), Config::default());

        match nozzle.start().await {
            Err(NozzleError::Read(SourceError::Transport(_))) => {}
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(nozzle.source().closes(), 1);
    }

    #[tokio::test]
    async fn test_close_request_closes_source_once() {
        let nozzle = Arc::new(Nozzle::new(ScriptedSource::new(Script::Idle), MemoryRouter::new(), Config::default()));

        let running = Arc::clone(&nozzle);
        let handle = tokio::spawn(async move { running.run().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        nozzle.close();
        nozzle.close();

        let cause = handle.await.unwrap().unwrap();
        assert!(cause.is_clean());
        assert_eq!(nozzle.source().closes(), 1);
    }

    #[tokio::test]
    async fn test_close_while_opening_abandons_open() {
        let nozzle = Arc::new(Nozzle::new(ScriptedSource::new(Script::OpenHangs), MemoryRouter::new(), Config::default()));

        let running = Arc::clone(&nozzle);
        let handle = tokio::spawn(async move { running.run().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        nozzle.close_handle().close();

        let cause = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("run returns promptly while open is pending")
            .unwrap()
            .unwrap();
        assert!(cause.is_clean());
        assert_eq!(nozzle.source().closes(), 1);
        assert!(nozzle.router().is_empty());
    }
}
