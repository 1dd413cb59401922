//! Frontend (client -> server) messages for startup, authentication and
//! the simple query path. Extended-query messages live in `extended`.

use bytes::BytesMut;

use super::protocol::{encode_message, PROTOCOL_VERSION};

/// Frontend message type bytes.
pub mod frontend_tag {
    /// Password and every SASL response share 'p'
    pub const PASSWORD: u8 = b'p';
    pub const QUERY: u8 = b'Q';
    pub const PARSE: u8 = b'P';
    pub const BIND: u8 = b'B';
    pub const DESCRIBE: u8 = b'D';
    pub const EXECUTE: u8 = b'E';
    pub const CLOSE: u8 = b'C';
    pub const SYNC: u8 = b'S';
    pub const FLUSH: u8 = b'H';
    pub const TERMINATE: u8 = b'X';
}

/// Trait for encoding frontend messages
pub trait FrontendMessage {
    /// Produce the complete wire bytes, envelope included.
    fn encode(&self) -> BytesMut;
}

/// Startup message sent at connection start
#[derive(Debug, Clone)]
pub struct StartupMessage {
    pub user: String,
    pub database: Option<String>,
    pub options: Vec<(String, String)>,
}

impl FrontendMessage for StartupMessage {
    fn encode(&self) -> BytesMut {
        // No type byte: the startup packet predates the tagged envelope
        encode_message(None, |w| {
            w.put_i32(PROTOCOL_VERSION);

            w.put_cstr("user").put_cstr(&self.user);
            if let Some(ref db) = self.database {
                w.put_cstr("database").put_cstr(db);
            }
            for (key, value) in &self.options {
                w.put_cstr(key).put_cstr(value);
            }

            // Terminator
            w.put_u8(0);
        })
    }
}

/// Password message (for MD5 or plaintext auth)
#[derive(Debug, Clone)]
pub struct PasswordMessage {
    pub password: String,
}

impl FrontendMessage for PasswordMessage {
    fn encode(&self) -> BytesMut {
        encode_message(Some(frontend_tag::PASSWORD), |w| {
            w.put_cstr(&self.password);
        })
    }
}

/// Simple query message ('Q')
#[derive(Debug, Clone)]
pub struct QueryMessage {
    pub query: String,
}

impl FrontendMessage for QueryMessage {
    fn encode(&self) -> BytesMut {
        encode_message(Some(frontend_tag::QUERY), |w| {
            w.put_cstr(&self.query);
        })
    }
}

/// SASL Initial Response message ('p') - First SCRAM message
#[derive(Debug, Clone)]
pub struct SaslInitialResponseMessage {
    /// SASL mechanism name (e.g., "SCRAM-SHA-256")
    pub mechanism: String,
    /// Initial client response data
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslInitialResponseMessage {
    fn encode(&self) -> BytesMut {
        encode_message(Some(frontend_tag::PASSWORD), |w| {
            w.put_cstr(&self.mechanism);
            w.put_i32(self.data.len() as i32);
            w.put_slice(&self.data);
        })
    }
}

/// SASL Response message ('p') - Subsequent SCRAM messages
#[derive(Debug, Clone)]
pub struct SaslResponseMessage {
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslResponseMessage {
    fn encode(&self) -> BytesMut {
        encode_message(Some(frontend_tag::PASSWORD), |w| {
            w.put_slice(&self.data);
        })
    }
}

/// Flush message ('H') - Request server to flush output buffer
#[derive(Debug, Clone, Copy)]
pub struct FlushMessage;

impl FrontendMessage for FlushMessage {
    fn encode(&self) -> BytesMut {
        encode_message(Some(frontend_tag::FLUSH), |_| {})
    }
}

/// Terminate message ('X') - Close the connection
#[derive(Debug, Clone, Copy)]
pub struct TerminateMessage;

impl FrontendMessage for TerminateMessage {
    fn encode(&self) -> BytesMut {
        encode_message(Some(frontend_tag::TERMINATE), |_| {})
    }
}
