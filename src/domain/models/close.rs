//--------------------------------------------------------------------------------------------------
// STRUCTS
//--------------------------------------------------------------------------------------------------
// | Name          | Description                                       | Key Methods           |
// |---------------|---------------------------------------------------|-----------------------|
// | CloseCode     | Numeric websocket close status                    | name, is_normal       |
// | CloseError    | Structured close reported by an event source      | new, code, reason     |
//--------------------------------------------------------------------------------------------------

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Numeric close status carried by a websocket close frame.
///
/// Any `u16` is representable; the constants cover the statuses registered in
/// RFC 6455 §7.4.1 that a firehose connection can report. Codes outside that
/// list are kept as-is so callers can still branch on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CloseCode(pub u16);

impl CloseCode {
    pub const NORMAL_CLOSURE: CloseCode = CloseCode(1000);
    pub const GOING_AWAY: CloseCode = CloseCode(1001);
    pub const PROTOCOL_ERROR: CloseCode = CloseCode(1002);
    pub const UNSUPPORTED_DATA: CloseCode = CloseCode(1003);
    pub const NO_STATUS_RECEIVED: CloseCode = CloseCode(1005);
    pub const ABNORMAL_CLOSURE: CloseCode = CloseCode(1006);
    pub const INVALID_FRAME_PAYLOAD: CloseCode = CloseCode(1007);
    pub const POLICY_VIOLATION: CloseCode = CloseCode(1008);
    pub const MESSAGE_TOO_BIG: CloseCode = CloseCode(1009);
    pub const MANDATORY_EXTENSION: CloseCode = CloseCode(1010);
    pub const INTERNAL_SERVER_ERROR: CloseCode = CloseCode(1011);
    pub const SERVICE_RESTART: CloseCode = CloseCode(1012);
    pub const TRY_AGAIN_LATER: CloseCode = CloseCode(1013);
    pub const TLS_HANDSHAKE: CloseCode = CloseCode(1015);

    /// Returns the raw status number
    pub fn as_u16(self) -> u16 {
        self.0
    }

    /// Returns true for 1000, the only status meaning an expected shutdown
    pub fn is_normal(self) -> bool {
        self == Self::NORMAL_CLOSURE
    }

    /// Human readable name of a registered status, `None` for anything else
    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            Self::NORMAL_CLOSURE => "normal closure",
            Self::GOING_AWAY => "going away",
            Self::PROTOCOL_ERROR => "protocol error",
            Self::UNSUPPORTED_DATA => "unsupported data",
            Self::NO_STATUS_RECEIVED => "no status received",
            Self::ABNORMAL_CLOSURE => "abnormal closure",
            Self::INVALID_FRAME_PAYLOAD => "invalid payload data",
            Self::POLICY_VIOLATION => "policy violation",
            Self::MESSAGE_TOO_BIG => "message too big",
            Self::MANDATORY_EXTENSION => "mandatory extension missing",
            Self::INTERNAL_SERVER_ERROR => "internal server error",
            Self::SERVICE_RESTART => "service restart",
            Self::TRY_AGAIN_LATER => "try again later",
            Self::TLS_HANDSHAKE => "TLS handshake",
            _ => return None,
        };
        Some(name)
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        CloseCode(code)
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        code.0
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({})", self.0, name),
            None => write!(f, "{}", self.0),
        }
    }
}

/// A structured close status reported by the event source
///
/// The code is never translated: whatever number the peer sent is what
/// the nozzle hands back to its caller.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("websocket: close {code}: {reason}")]
pub struct CloseError {
    code: CloseCode,
    reason: String,
}

impl CloseError {
    pub fn new(code: impl Into<CloseCode>, reason: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> CloseCode {
        self.code
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}
