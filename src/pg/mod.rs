//! Custom PostgreSQL wire protocol implementation.
//!
//! The protocol engine is sans-IO: a [`Session`] consumes inbound bytes and
//! produces outbound bytes, events and request outcomes. [`PgConnection`]
//! runs a session over a tokio stream.
//!
//! Architecture:
//! - `cursor`: Bounds-checked reader/writer over byte buffers
//! - `protocol`: Framing and backend message decoding
//! - `frontend` / `extended`: Client message constructors
//! - `auth` / `scram`: Login handshake (cleartext, MD5, SCRAM-SHA-256)
//! - `session`: Per-connection state and request correlation
//! - `result`: Row accumulation and query results
//! - `connection`: Configuration and the async driver

pub mod auth;
pub mod connection;
pub mod cursor;
pub mod error;
pub mod extended;
pub mod frontend;
pub mod protocol;
pub mod result;
pub mod scram;
pub mod session;
pub mod types;

#[cfg(test)]
mod tests;

// Public API re-exports for library consumers
pub use auth::AuthenticationState;
pub use connection::{PgConfig, PgConnection};
pub use error::{PgError, PgResult, ServerError};
pub use extended::{ExecuteOutcome, ExtendedQuery, ExtendedResult, PortalFetch};
pub use protocol::{BackendKeyData, TransactionStatus};
pub use result::{ColumnDescriptor, QueryResult, Row, SharedColumns};
pub use session::{Credentials, Event, Pending, PendingExtended, PendingQuery, Session};
pub use types::{Format, Oid};
