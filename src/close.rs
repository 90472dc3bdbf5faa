//! Close status codes and close events (RFC 6455 section 7.4).

use std::fmt;

/// Status code carried in a close frame.
///
/// The named variants cover the registry in RFC 6455 section 7.4.1.
/// Codes in the 3000-3999 range are registered for libraries and
/// frameworks ([`CloseCode::Library`]); 4000-4999 are private-use
/// ([`CloseCode::Private`]). Everything else that can appear in a 16-bit
/// field but is not assignable ends up as [`CloseCode::Reserved`], which
/// [`CloseCode::is_allowed`] rejects.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CloseCode {
    /// 1000: the purpose for which the connection was established has
    /// been fulfilled.
    Normal,
    /// 1001: the endpoint is going away (server shutdown, page navigated
    /// away).
    Away,
    /// 1002: the endpoint terminated the connection due to a protocol
    /// error.
    Protocol,
    /// 1003: the endpoint received a type of data it cannot accept.
    Unsupported,
    /// 1005: no status code was present. Never sent on the wire; only
    /// used to report a bodiless close frame to the application.
    NoStatus,
    /// 1006: the connection was closed abnormally, without a close frame.
    /// Never sent on the wire.
    Abnormal,
    /// 1007: a message payload was inconsistent with its type (e.g.
    /// non-UTF-8 data in a text message).
    Invalid,
    /// 1008: a message violated the endpoint's policy.
    Policy,
    /// 1009: a message was too big to process.
    Size,
    /// 1010: the client expected the server to negotiate an extension.
    Extension,
    /// 1011: the server encountered an unexpected condition.
    Error,
    /// 1012: the server is restarting.
    Restart,
    /// 1013: try again later.
    Again,
    /// 3000-3999: registered for use by libraries and frameworks.
    Library(u16),
    /// 4000-4999: private use.
    Private(u16),
    /// Any other value; not allowed on the wire.
    Reserved(u16),
}

impl CloseCode {
    /// Whether the code may legally appear in a close frame on the wire.
    pub fn is_allowed(&self) -> bool {
        !matches!(
            self,
            CloseCode::NoStatus | CloseCode::Abnormal | CloseCode::Reserved(_)
        )
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::NoStatus => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::Invalid => 1007,
            CloseCode::Policy => 1008,
            CloseCode::Size => 1009,
            CloseCode::Extension => 1010,
            CloseCode::Error => 1011,
            CloseCode::Restart => 1012,
            CloseCode::Again => 1013,
            CloseCode::Library(code) | CloseCode::Private(code) | CloseCode::Reserved(code) => code,
        }
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> CloseCode {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::Away,
            1002 => CloseCode::Protocol,
            1003 => CloseCode::Unsupported,
            1005 => CloseCode::NoStatus,
            1006 => CloseCode::Abnormal,
            1007 => CloseCode::Invalid,
            1008 => CloseCode::Policy,
            1009 => CloseCode::Size,
            1010 => CloseCode::Extension,
            1011 => CloseCode::Error,
            1012 => CloseCode::Restart,
            1013 => CloseCode::Again,
            3000..=3999 => CloseCode::Library(code),
            4000..=4999 => CloseCode::Private(code),
            _ => CloseCode::Reserved(code),
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u16::from(*self))
    }
}

/// Status code and reason text from a completed close handshake.
///
/// A peer that closed without a body is reported with
/// [`CloseCode::NoStatus`] and an empty reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    /// The status code, as received or as sent.
    pub code: CloseCode,
    /// The UTF-8 reason text, possibly empty.
    pub reason: String,
}

impl CloseEvent {
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for CloseEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "code {}", self.code)
        } else {
            write!(f, "code {} ({})", self.code, self.reason)
        }
    }
}
