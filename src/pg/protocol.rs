//! PostgreSQL wire protocol framing and backend message decoding.
//!
//! This module implements the PostgreSQL v3 protocol envelope and the
//! server-to-client messages.
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use bytes::{Bytes, BytesMut};

use super::cursor::{Reader, Writer};
use super::error::{ErrorField, PgError, PgResult, ServerError};
use super::result::{ColumnDescriptor, Row};
use super::types::{Format, Oid};

// ============================================================================
// Protocol Constants
// ============================================================================

/// PostgreSQL protocol version 3.0
pub const PROTOCOL_VERSION: i32 = 196608; // (3 << 16) | 0

/// Type byte + length field
pub const HEADER_LEN: usize = 5;

/// Upper bound on a single backend message, matching libpq's 1 GiB cap.
pub const MAX_MESSAGE_LEN: usize = 1 << 30;

/// Backend message type bytes.
pub mod backend_tag {
    pub const AUTHENTICATION: u8 = b'R';
    pub const BACKEND_KEY_DATA: u8 = b'K';
    pub const BIND_COMPLETE: u8 = b'2';
    pub const CLOSE_COMPLETE: u8 = b'3';
    pub const COMMAND_COMPLETE: u8 = b'C';
    pub const DATA_ROW: u8 = b'D';
    pub const EMPTY_QUERY_RESPONSE: u8 = b'I';
    pub const ERROR_RESPONSE: u8 = b'E';
    pub const NO_DATA: u8 = b'n';
    pub const NOTICE_RESPONSE: u8 = b'N';
    pub const NOTIFICATION_RESPONSE: u8 = b'A';
    pub const PARAMETER_DESCRIPTION: u8 = b't';
    pub const PARAMETER_STATUS: u8 = b'S';
    pub const PARSE_COMPLETE: u8 = b'1';
    pub const PORTAL_SUSPENDED: u8 = b's';
    pub const READY_FOR_QUERY: u8 = b'Z';
    pub const ROW_DESCRIPTION: u8 = b'T';
}

/// Transaction status indicators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionStatus {
    /// Idle (not in a transaction block)
    #[default]
    Idle,
    /// In a transaction block
    InTransaction,
    /// In a failed transaction block; queries are rejected until rollback
    InFailedTransaction,
}

impl TryFrom<u8> for TransactionStatus {
    type Error = PgError;

    fn try_from(b: u8) -> PgResult<Self> {
        match b {
            b'I' => Ok(TransactionStatus::Idle),
            b'T' => Ok(TransactionStatus::InTransaction),
            b'E' => Ok(TransactionStatus::InFailedTransaction),
            other => Err(PgError::Protocol(format!(
                "Unknown transaction status: {:?}",
                other as char
            ))),
        }
    }
}

impl TransactionStatus {
    pub fn as_byte(self) -> u8 {
        match self {
            TransactionStatus::Idle => b'I',
            TransactionStatus::InTransaction => b'T',
            TransactionStatus::InFailedTransaction => b'E',
        }
    }
}

// ============================================================================
// Framing
// ============================================================================

/// A complete, framed message: type tag plus payload (length excluded).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub tag: u8,
    pub payload: Bytes,
}

impl Message {
    /// Value of the wire length field: payload plus the field itself.
    pub fn length(&self) -> u32 {
        4 + self.payload.len() as u32
    }
}

/// Build a message, backpatching the length once the body is written.
///
/// `tag` is `None` only for the startup family, which has no type byte.
pub fn encode_message(tag: Option<u8>, body: impl FnOnce(&mut Writer)) -> BytesMut {
    let mut w = Writer::with_capacity(64);
    if let Some(tag) = tag {
        w.put_u8(tag);
    }
    let len_at = w.len();
    w.put_i32(0);
    body(&mut w);
    let len = (w.len() - len_at) as i32;
    w.patch_i32(len_at, len);
    w.into_inner()
}

/// Wrap `payload` in the canonical `[type][length][payload]` envelope.
pub fn frame(tag: u8, payload: &[u8]) -> BytesMut {
    encode_message(Some(tag), |w| {
        w.put_slice(payload);
    })
}

/// Inspect the header at the front of `buf`.
///
/// Returns `(tag, total_len)` where `total_len` covers the type byte, or
/// `None` when fewer than [`HEADER_LEN`] bytes are available.
fn peek_header(buf: &[u8]) -> PgResult<Option<(u8, usize)>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let tag = buf[0];
    let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    if len < 4 {
        return Err(PgError::Framing(format!(
            "message {:?} has invalid length {}",
            tag as char, len
        )));
    }
    let len = len as usize;
    if len > MAX_MESSAGE_LEN {
        return Err(PgError::Framing(format!(
            "message {:?} length {} exceeds limit",
            tag as char, len
        )));
    }
    Ok(Some((tag, 1 + len)))
}

/// Parse one message from the front of `buf` without consuming it.
///
/// Returns the message and the number of bytes it occupied, or `None` when
/// `buf` does not yet hold a complete message.
pub fn try_parse_one(buf: &[u8]) -> PgResult<Option<(Message, usize)>> {
    match peek_header(buf)? {
        Some((tag, total)) if buf.len() >= total => {
            let payload = Bytes::copy_from_slice(&buf[HEADER_LEN..total]);
            Ok(Some((Message { tag, payload }, total)))
        }
        _ => Ok(None),
    }
}

/// Split one complete message off the front of `buf`, zero-copy.
pub fn split_message(buf: &mut BytesMut) -> PgResult<Option<Message>> {
    match peek_header(buf)? {
        Some((tag, total)) if buf.len() >= total => {
            let mut raw = buf.split_to(total);
            let payload = raw.split_off(HEADER_LEN).freeze();
            Ok(Some(Message { tag, payload }))
        }
        _ => Ok(None),
    }
}

// ============================================================================
// Backend (Server -> Client) Messages
// ============================================================================

/// Authentication request sub-types, keyed by the first payload word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthRequest {
    /// 0
    Ok,
    /// 3
    CleartextPassword,
    /// 5
    Md5Password { salt: [u8; 4] },
    /// 10
    Sasl { mechanisms: Vec<String> },
    /// 11
    SaslContinue { data: Bytes },
    /// 12
    SaslFinal { data: Bytes },
}

/// Secret used for out-of-band cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendKeyData {
    pub process_id: u32,
    pub secret_key: u32,
}

/// Backend message types
#[derive(Debug, Clone)]
pub enum BackendMessage {
    Authentication(AuthRequest),

    // Query responses
    RowDescription { columns: Vec<ColumnDescriptor> },
    DataRow { values: Row },
    CommandComplete { tag: String },
    EmptyQueryResponse,

    // Extended query protocol
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,
    ParameterDescription { type_oids: Vec<Oid> },

    // Status
    ReadyForQuery { status: TransactionStatus },
    ParameterStatus { name: String, value: String },
    BackendKeyData(BackendKeyData),

    // Errors and notices
    ErrorResponse(ServerError),
    NoticeResponse(ServerError),

    // Other
    NotificationResponse {
        process_id: u32,
        channel: String,
        payload: String,
    },
}

impl BackendMessage {
    /// Classify and decode a framed message.
    pub fn decode(msg: &Message) -> PgResult<Self> {
        use backend_tag::*;

        let body = &msg.payload;
        match msg.tag {
            AUTHENTICATION => decode_auth(body),
            ROW_DESCRIPTION => decode_row_description(body),
            DATA_ROW => decode_data_row(body),
            COMMAND_COMPLETE => {
                let tag = Reader::new(body).read_cstring()?;
                Ok(BackendMessage::CommandComplete { tag })
            }
            READY_FOR_QUERY => {
                let status = TransactionStatus::try_from(Reader::new(body).read_u8()?)?;
                Ok(BackendMessage::ReadyForQuery { status })
            }
            ERROR_RESPONSE => Ok(BackendMessage::ErrorResponse(read_error_fields(body)?)),
            NOTICE_RESPONSE => Ok(BackendMessage::NoticeResponse(read_error_fields(body)?)),
            PARAMETER_STATUS => {
                let mut r = Reader::new(body);
                let name = r.read_cstring()?;
                let value = r.read_cstring()?;
                Ok(BackendMessage::ParameterStatus { name, value })
            }
            BACKEND_KEY_DATA => {
                let mut r = Reader::new(body);
                Ok(BackendMessage::BackendKeyData(BackendKeyData {
                    process_id: r.read_u32()?,
                    secret_key: r.read_u32()?,
                }))
            }
            PARSE_COMPLETE => Ok(BackendMessage::ParseComplete),
            BIND_COMPLETE => Ok(BackendMessage::BindComplete),
            CLOSE_COMPLETE => Ok(BackendMessage::CloseComplete),
            EMPTY_QUERY_RESPONSE => Ok(BackendMessage::EmptyQueryResponse),
            NO_DATA => Ok(BackendMessage::NoData),
            PORTAL_SUSPENDED => Ok(BackendMessage::PortalSuspended),
            PARAMETER_DESCRIPTION => {
                let mut r = Reader::new(body);
                let count = r.read_u16()? as usize;
                let mut type_oids = Vec::with_capacity(count);
                for _ in 0..count {
                    type_oids.push(Oid(r.read_u32()?));
                }
                Ok(BackendMessage::ParameterDescription { type_oids })
            }
            NOTIFICATION_RESPONSE => {
                let mut r = Reader::new(body);
                Ok(BackendMessage::NotificationResponse {
                    process_id: r.read_u32()?,
                    channel: r.read_cstring()?,
                    payload: r.read_cstring()?,
                })
            }
            other => Err(PgError::Protocol(format!(
                "Unknown message type: {:?}",
                other as char
            ))),
        }
    }

    /// Short name for logs and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            BackendMessage::Authentication(_) => "Authentication",
            BackendMessage::RowDescription { .. } => "RowDescription",
            BackendMessage::DataRow { .. } => "DataRow",
            BackendMessage::CommandComplete { .. } => "CommandComplete",
            BackendMessage::EmptyQueryResponse => "EmptyQueryResponse",
            BackendMessage::ParseComplete => "ParseComplete",
            BackendMessage::BindComplete => "BindComplete",
            BackendMessage::CloseComplete => "CloseComplete",
            BackendMessage::NoData => "NoData",
            BackendMessage::PortalSuspended => "PortalSuspended",
            BackendMessage::ParameterDescription { .. } => "ParameterDescription",
            BackendMessage::ReadyForQuery { .. } => "ReadyForQuery",
            BackendMessage::ParameterStatus { .. } => "ParameterStatus",
            BackendMessage::BackendKeyData(_) => "BackendKeyData",
            BackendMessage::ErrorResponse(_) => "ErrorResponse",
            BackendMessage::NoticeResponse(_) => "NoticeResponse",
            BackendMessage::NotificationResponse { .. } => "NotificationResponse",
        }
    }
}

fn decode_auth(body: &Bytes) -> PgResult<BackendMessage> {
    let mut r = Reader::new(body);
    let auth_type = r.read_i32()?;

    let req = match auth_type {
        0 => AuthRequest::Ok,
        3 => AuthRequest::CleartextPassword,
        5 => {
            let mut salt = [0u8; 4];
            salt.copy_from_slice(r.read_bytes(4)?);
            AuthRequest::Md5Password { salt }
        }
        10 => {
            // NUL-separated list closed by an empty name
            let mut mechanisms = Vec::new();
            while !r.is_empty() {
                let mech = r.read_cstring()?;
                if mech.is_empty() {
                    break;
                }
                mechanisms.push(mech);
            }
            AuthRequest::Sasl { mechanisms }
        }
        11 => AuthRequest::SaslContinue {
            data: body.slice(r.position()..),
        },
        12 => AuthRequest::SaslFinal {
            data: body.slice(r.position()..),
        },
        _ => {
            return Err(PgError::Protocol(format!(
                "Unknown authentication type: {}",
                auth_type
            )))
        }
    };
    Ok(BackendMessage::Authentication(req))
}

fn decode_row_description(body: &Bytes) -> PgResult<BackendMessage> {
    let mut r = Reader::new(body);
    let num_fields = r.read_u16()? as usize;
    let mut columns = Vec::with_capacity(num_fields);

    for _ in 0..num_fields {
        columns.push(ColumnDescriptor {
            name: r.read_cstring()?,
            table_oid: r.read_u32()?,
            column_attr: r.read_i16()?,
            type_oid: Oid(r.read_u32()?),
            type_size: r.read_i16()?,
            type_modifier: r.read_i32()?,
            format: Format::try_from(r.read_i16()?)?,
        });
    }

    Ok(BackendMessage::RowDescription { columns })
}

fn decode_data_row(body: &Bytes) -> PgResult<BackendMessage> {
    let mut r = Reader::new(body);
    let num_cols = r.read_u16()? as usize;
    let mut values = Row::with_capacity(num_cols);

    for _ in 0..num_cols {
        let len = r.read_i32()?;
        if len < 0 {
            values.push(None);
        } else {
            // Zero-copy view into the message payload
            let raw = r.read_bytes(len as usize)?;
            values.push(Some(body.slice_ref(raw)));
        }
    }

    Ok(BackendMessage::DataRow { values })
}

/// Read error/notice response fields, preserving wire order.
fn read_error_fields(body: &[u8]) -> PgResult<ServerError> {
    let mut r = Reader::new(body);
    let mut fields = Vec::new();

    while !r.is_empty() {
        let code = r.read_u8()?;
        if code == 0 {
            break;
        }
        let message = r.read_cstring()?;
        fields.push(ErrorField { code, message });
    }

    Ok(ServerError::new(fields))
}
