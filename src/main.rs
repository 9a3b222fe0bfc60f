use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use firehose_nozzle::{
    CloseBehavior, CloseCode, Config, LoggingRouter, MemoryEventSource, Nozzle, TerminationCause,
    TransportError,
};

/// Forwards a synthetic firehose to the trace log until interrupted
#[derive(Parser, Debug)]
#[command(name = "firehose-nozzle", version)]
struct Args {
    /// Envelopes to produce; endless when omitted
    #[arg(long)]
    events: Option<u64>,

    /// Envelopes per second; unthrottled when omitted
    #[arg(long)]
    eps: Option<u32>,

    /// Close status the source reports when the nozzle closes it
    #[arg(long, conflicts_with = "transport_error")]
    close_code: Option<u16>,

    /// Make the source report a transport error when closed
    #[arg(long)]
    transport_error: Option<String>,

    /// Close the nozzle after this many seconds instead of waiting for Ctrl-C
    #[arg(long)]
    duration_secs: Option<u64>,

    /// End the stream from the source side once all envelopes were produced
    #[arg(long, requires = "events")]
    end_of_stream: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = Config::try_from_env().map_err(anyhow::Error::msg)?;

    let close_behavior = match (args.close_code, args.transport_error) {
        (Some(code), _) => CloseBehavior::CloseCode(CloseCode::from(code)),
        (None, Some(message)) => CloseBehavior::Transport(TransportError::msg(message)),
        (None, None) => CloseBehavior::Silent,
    };

    let mut source = MemoryEventSource::new(args.eps, args.events, close_behavior);
    if args.end_of_stream {
        source = source.with_end_of_stream();
    }

    let nozzle = Arc::new(Nozzle::new(source, LoggingRouter::new(), config));
    let closer = nozzle.close_handle();
    info!(id = %nozzle.id(), "Starting firehose nozzle");

    let running = Arc::clone(&nozzle);
    let mut run = tokio::spawn(async move { running.run().await });

    let result = match args.duration_secs {
        Some(secs) => {
            tokio::select! {
                result = &mut run => result,
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                    info!("Run time elapsed, closing nozzle");
                    closer.close();
                    run.await
                }
            }
        }
        None => {
            tokio::select! {
                result = &mut run => result,
                signal = tokio::signal::ctrl_c() => {
                    signal.context("failed to listen for Ctrl-C")?;
                    info!("Interrupted, closing nozzle");
                    closer.close();
                    run.await
                }
            }
        }
    };

    let cause = result.context("nozzle task panicked")??;
    info!(routed = nozzle.router().routed(), "Firehose nozzle finished");

    match cause {
        TerminationCause::Clean => Ok(()),
        TerminationCause::NormalClosure(close) => {
            info!("Connection closed normally ({}), safe to reconnect", close.code());
            Ok(())
        }
        TerminationCause::AbnormalClosure(close) => {
            warn!("Connection closed abnormally with {}", close.code());
            Err(close.into())
        }
        TerminationCause::TransportError(err) => {
            error!("Connection failed: {}", err);
            Err(err.into())
        }
    }
}
