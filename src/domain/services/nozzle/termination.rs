//--------------------------------------------------------------------------------------------------
// ENUMS
//--------------------------------------------------------------------------------------------------
// | Name               | Description                                       | Variants            |
// |--------------------|---------------------------------------------------|---------------------|
// | TerminationCause   | Why a nozzle run ended                            | Clean               |
// |                    |                                                   | NormalClosure       |
// |                    |                                                   | AbnormalClosure     |
// |                    |                                                   | TransportError      |
//--------------------------------------------------------------------------------------------------

use tracing::{error, info};

use super::NozzleError;
use crate::domain::models::close::{CloseCode, CloseError};
use crate::domain::services::source::{SourceError, TransportError};

/// Why a nozzle run ended
///
/// Callers match on this to decide whether to build a new nozzle and
/// reconnect. Close codes are carried exactly as the source reported them.
#[derive(Debug, Clone)]
pub enum TerminationCause {
    /// Stopped by `close` with no error reported by the source
    Clean,
    /// The connection was closed with status 1000
    NormalClosure(CloseError),
    /// The connection was closed with any other status
    AbnormalClosure(CloseError),
    /// Any failure that did not come with a close status
    TransportError(TransportError),
}

impl TerminationCause {
    /// Maps whatever the source reported when the stream ended
    pub fn classify(err: SourceError) -> Self {
        match err.into_innermost() {
            SourceError::Close(close) if close.code().is_normal() => {
                TerminationCause::NormalClosure(close)
            }
            SourceError::Close(close) => TerminationCause::AbnormalClosure(close),
            SourceError::Transport(err) => TerminationCause::TransportError(err),
            // Lifecycle errors are not expected mid-stream; keep them opaque
            other => TerminationCause::TransportError(TransportError::new(other)),
        }
    }

    /// Close status of the connection, if it was closed with one
    pub fn close_code(&self) -> Option<CloseCode> {
        match self {
            TerminationCause::NormalClosure(close) | TerminationCause::AbnormalClosure(close) => {
                Some(close.code())
            }
            _ => None,
        }
    }

    pub fn is_clean(&self) -> bool {
        matches!(self, TerminationCause::Clean)
    }

    /// Converts to the value returned by `Nozzle::start`
    pub fn into_result(self) -> Result<(), NozzleError> {
        match self {
            TerminationCause::Clean => Ok(()),
            TerminationCause::NormalClosure(close) | TerminationCause::AbnormalClosure(close) => {
                Err(NozzleError::Closed(close))
            }
            TerminationCause::TransportError(err) => Err(NozzleError::Transport(err)),
        }
    }

    /// Writes the cause to the log the way operators expect to read it
    pub(crate) fn log(&self) {
        match self {
            TerminationCause::Clean => return,
            TerminationCause::NormalClosure(close) => {
                info!(code = close.code().as_u16(), "Normal websocket closure: {}", close);
            }
            TerminationCause::AbnormalClosure(close) if close.code() == CloseCode::POLICY_VIOLATION => {
                error!(
                    code = close.code().as_u16(),
                    reason = close.reason(),
                    "Error while reading from the firehose: {}",
                    close
                );
                error!("Disconnected because nozzle couldn't keep up. Please try scaling up the nozzle.");
            }
            TerminationCause::AbnormalClosure(close) => {
                error!(code = close.code().as_u16(), "Error while reading from the firehose: {}", close);
            }
            TerminationCause::TransportError(err) => {
                error!("Error while reading from the firehose: {}", err);
            }
        }
        info!("Closing connection with traffic controller due to error");
    }
}
