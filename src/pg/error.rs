//! Error types for the PostgreSQL protocol implementation.

use std::fmt;
use std::io;

use serde::Serialize;
use thiserror::Error;

/// Result type for PostgreSQL operations.
pub type PgResult<T> = Result<T, PgError>;

/// Errors that can occur during PostgreSQL operations.
#[derive(Error, Debug)]
pub enum PgError {
    /// I/O error during communication.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed envelope: bad length field or a read past the end of a message.
    #[error("Framing error: {0}")]
    Framing(String),

    /// Unexpected message for the current state, unknown discriminant, etc.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Authentication handshake failed on the client side.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Server refused the login with an ErrorResponse.
    #[error("Authentication failed: {0}")]
    AuthRejected(ServerError),

    /// Request arguments the wire format cannot carry.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Server returned an ErrorResponse.
    #[error("{0}")]
    Server(ServerError),

    /// Invalid connection settings.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A request was issued while another one is still outstanding.
    #[error("Another request is already in flight on this connection")]
    RequestInFlight,

    /// The session has not finished its startup handshake.
    #[error("Connection is not ready for queries")]
    NotReady,

    /// Connection is closed or unusable after a fatal error.
    #[error("Connection is closed")]
    ConnectionClosed,
}

impl PgError {
    /// Whether the connection can keep serving requests after this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            PgError::Server(_)
                | PgError::RequestInFlight
                | PgError::NotReady
                | PgError::Config(_)
                | PgError::InvalidRequest(_)
        )
    }

    /// The structured server error, if this is one.
    pub fn as_server(&self) -> Option<&ServerError> {
        match self {
            PgError::Server(e) | PgError::AuthRejected(e) => Some(e),
            _ => None,
        }
    }
}

// `io::Error` is not `Clone`; a fatal error has to reach both the caller and
// the outstanding request, so the I/O case is rebuilt from its kind and text.
impl Clone for PgError {
    fn clone(&self) -> Self {
        match self {
            PgError::Io(e) => PgError::Io(io::Error::new(e.kind(), e.to_string())),
            PgError::Framing(m) => PgError::Framing(m.clone()),
            PgError::Protocol(m) => PgError::Protocol(m.clone()),
            PgError::Auth(m) => PgError::Auth(m.clone()),
            PgError::AuthRejected(e) => PgError::AuthRejected(e.clone()),
            PgError::Server(e) => PgError::Server(e.clone()),
            PgError::InvalidRequest(m) => PgError::InvalidRequest(m.clone()),
            PgError::Config(m) => PgError::Config(m.clone()),
            PgError::RequestInFlight => PgError::RequestInFlight,
            PgError::NotReady => PgError::NotReady,
            PgError::ConnectionClosed => PgError::ConnectionClosed,
        }
    }
}

// ============================================================================
// Server errors
// ============================================================================

/// Field codes of ErrorResponse / NoticeResponse.
pub mod field {
    pub const SEVERITY: u8 = b'S';
    /// Non-localized severity (protocol 3.0, 9.6+).
    pub const SEVERITY_NONLOCALIZED: u8 = b'V';
    pub const CODE: u8 = b'C';
    pub const MESSAGE: u8 = b'M';
    pub const DETAIL: u8 = b'D';
    pub const HINT: u8 = b'H';
    pub const POSITION: u8 = b'P';
}

/// One `{code, message}` entry of an ErrorResponse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorField {
    /// Single-byte field code (`S`, `C`, `M`, ...)
    pub code: u8,
    pub message: String,
}

/// An ErrorResponse (or NoticeResponse) body, fields kept in wire order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServerError {
    pub fields: Vec<ErrorField>,
}

impl ServerError {
    pub fn new(fields: Vec<ErrorField>) -> Self {
        Self { fields }
    }

    /// First value carried under `code`.
    pub fn field(&self, code: u8) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.code == code)
            .map(|f| f.message.as_str())
    }

    pub fn severity(&self) -> &str {
        self.field(field::SEVERITY)
            .or_else(|| self.field(field::SEVERITY_NONLOCALIZED))
            .unwrap_or_default()
    }

    /// SQLSTATE code, e.g. `28P01`.
    pub fn code(&self) -> &str {
        self.field(field::CODE).unwrap_or_default()
    }

    pub fn message(&self) -> &str {
        self.field(field::MESSAGE).unwrap_or_default()
    }

    pub fn detail(&self) -> Option<&str> {
        self.field(field::DETAIL)
    }

    pub fn hint(&self) -> Option<&str> {
        self.field(field::HINT)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.severity(), self.message(), self.code())?;
        if let Some(d) = self.detail() {
            write!(f, "\nDetail: {}", d)?;
        }
        if let Some(h) = self.hint() {
            write!(f, "\nHint: {}", h)?;
        }
        Ok(())
    }
}
