//! Extended query protocol: Parse / Bind / Describe / Execute / Sync.
//!
//! The message types are pure constructors. [`ExtendedQuery`] bundles one
//! full Parse→Bind→Describe→Execute→Sync sequence for the session, and
//! [`ExtendedResult`] is what that sequence resolves to.

use bytes::{Bytes, BytesMut};

use super::error::{PgError, PgResult};
use super::frontend::{frontend_tag, FrontendMessage};
use super::protocol::encode_message;
use super::result::QueryResult;
use super::types::{Format, Oid};

/// Longest list an Int16 count field of Parse or Bind can describe.
pub const MAX_LIST_LEN: usize = u16::MAX as usize;

fn check_count(what: &str, len: usize) -> PgResult<()> {
    if len > MAX_LIST_LEN {
        return Err(PgError::InvalidRequest(format!(
            "{} {} exceed the limit of {}",
            len, what, MAX_LIST_LEN
        )));
    }
    Ok(())
}

/// Parse message ('P') - Creates a prepared statement
#[derive(Debug, Clone, Default)]
pub struct ParseMessage {
    /// Empty for the unnamed statement
    pub name: String,
    pub query: String,
    pub param_types: Vec<Oid>,
}

impl FrontendMessage for ParseMessage {
    fn encode(&self) -> BytesMut {
        encode_message(Some(frontend_tag::PARSE), |w| {
            w.put_cstr(&self.name);
            w.put_cstr(&self.query);
            w.put_u16(self.param_types.len() as u16);
            for oid in &self.param_types {
                w.put_u32(oid.as_u32());
            }
        })
    }
}

impl ParseMessage {
    /// Counts must fit their Int16 fields; `encode` assumes they do.
    pub fn validate(&self) -> PgResult<()> {
        check_count("parameter types", self.param_types.len())
    }
}

/// Bind message ('B') - Binds parameters to a prepared statement
///
/// Format code lists follow the protocol rule: empty means all text, a
/// single entry applies to every value, otherwise one entry per value.
#[derive(Debug, Clone, Default)]
pub struct BindMessage {
    pub portal: String,
    pub statement: String,
    pub param_formats: Vec<Format>,
    /// `None` is sent as NULL (length -1); `Some(empty)` is a zero-length value
    pub params: Vec<Option<Bytes>>,
    pub result_formats: Vec<Format>,
}

impl FrontendMessage for BindMessage {
    fn encode(&self) -> BytesMut {
        encode_message(Some(frontend_tag::BIND), |w| {
            w.put_cstr(&self.portal);
            w.put_cstr(&self.statement);

            w.put_u16(self.param_formats.len() as u16);
            for fmt in &self.param_formats {
                w.put_i16(*fmt as i16);
            }

            w.put_u16(self.params.len() as u16);
            for param in &self.params {
                match param {
                    Some(value) => {
                        w.put_i32(value.len() as i32);
                        w.put_slice(value);
                    }
                    None => {
                        w.put_i32(-1);
                    }
                }
            }

            w.put_u16(self.result_formats.len() as u16);
            for fmt in &self.result_formats {
                w.put_i16(*fmt as i16);
            }
        })
    }
}

impl BindMessage {
    /// Counts must fit their Int16 fields; `encode` assumes they do.
    pub fn validate(&self) -> PgResult<()> {
        check_count("parameter format codes", self.param_formats.len())?;
        check_count("parameters", self.params.len())?;
        check_count("result format codes", self.result_formats.len())
    }
}

/// What a Describe or Close message refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Portal,
    Statement,
}

impl Target {
    fn as_byte(self) -> u8 {
        match self {
            Target::Portal => b'P',
            Target::Statement => b'S',
        }
    }
}

/// Describe message ('D') - Request description of statement or portal
#[derive(Debug, Clone)]
pub struct DescribeMessage {
    pub target: Target,
    pub name: String,
}

impl FrontendMessage for DescribeMessage {
    fn encode(&self) -> BytesMut {
        encode_message(Some(frontend_tag::DESCRIBE), |w| {
            w.put_u8(self.target.as_byte());
            w.put_cstr(&self.name);
        })
    }
}

/// Execute message ('E') - Executes a bound portal
#[derive(Debug, Clone, Default)]
pub struct ExecuteMessage {
    pub portal: String,
    /// 0 = no limit
    pub max_rows: u32,
}

impl FrontendMessage for ExecuteMessage {
    fn encode(&self) -> BytesMut {
        encode_message(Some(frontend_tag::EXECUTE), |w| {
            w.put_cstr(&self.portal);
            w.put_u32(self.max_rows);
        })
    }
}

/// Close message ('C') - Releases a statement or portal
#[derive(Debug, Clone)]
pub struct CloseMessage {
    pub target: Target,
    pub name: String,
}

impl FrontendMessage for CloseMessage {
    fn encode(&self) -> BytesMut {
        encode_message(Some(frontend_tag::CLOSE), |w| {
            w.put_u8(self.target.as_byte());
            w.put_cstr(&self.name);
        })
    }
}

/// Sync message ('S') - Marks end of an extended query
#[derive(Debug, Clone, Copy)]
pub struct SyncMessage;

impl FrontendMessage for SyncMessage {
    fn encode(&self) -> BytesMut {
        encode_message(Some(frontend_tag::SYNC), |_| {})
    }
}

// ============================================================================
// Request / result
// ============================================================================

/// One Parse→Bind→Describe(portal)→Execute×n→Sync sequence.
#[derive(Debug, Clone)]
pub struct ExtendedQuery {
    pub statement: String,
    pub query: String,
    pub param_types: Vec<Oid>,
    pub portal: String,
    pub param_formats: Vec<Format>,
    pub params: Vec<Option<Bytes>>,
    pub result_formats: Vec<Format>,
    /// Row limit per Execute, 0 = unlimited
    pub max_rows: u32,
    /// Number of Execute messages pipelined against the portal
    pub executions: u32,
}

impl ExtendedQuery {
    /// Unnamed statement and portal, text formats, one unlimited Execute.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            statement: String::new(),
            query: query.into(),
            param_types: Vec::new(),
            portal: String::new(),
            param_formats: Vec::new(),
            params: Vec::new(),
            result_formats: Vec::new(),
            max_rows: 0,
            executions: 1,
        }
    }

    /// Append a text parameter; `None` binds NULL.
    pub fn bind_text(mut self, value: Option<&str>) -> Self {
        self.params
            .push(value.map(|v| Bytes::copy_from_slice(v.as_bytes())));
        self
    }

    pub fn param_types(mut self, types: Vec<Oid>) -> Self {
        self.param_types = types;
        self
    }

    /// Prepare under a statement name instead of the unnamed statement.
    pub fn statement(mut self, name: impl Into<String>) -> Self {
        self.statement = name.into();
        self
    }

    /// Bind into a named portal. Inside an open transaction it outlives the
    /// Sync, so a [`PortalFetch`] can continue it later.
    pub fn portal(mut self, name: impl Into<String>) -> Self {
        self.portal = name.into();
        self
    }

    /// Fetch at most `max_rows` per Execute, pipelining `executions` of them.
    pub fn fetch(mut self, max_rows: u32, executions: u32) -> Self {
        self.max_rows = max_rows;
        self.executions = executions.max(1);
        self
    }

    fn parse(&self) -> ParseMessage {
        ParseMessage {
            name: self.statement.clone(),
            query: self.query.clone(),
            param_types: self.param_types.clone(),
        }
    }

    fn bind(&self) -> BindMessage {
        BindMessage {
            portal: self.portal.clone(),
            statement: self.statement.clone(),
            param_formats: self.param_formats.clone(),
            params: self.params.clone(),
            result_formats: self.result_formats.clone(),
        }
    }

    pub fn validate(&self) -> PgResult<()> {
        self.parse().validate()?;
        self.bind().validate()
    }

    /// Encode the whole sequence into one contiguous buffer.
    pub fn encode(&self) -> BytesMut {
        let mut buf = self.parse().encode();
        buf.unsplit(self.bind().encode());

        buf.unsplit(
            DescribeMessage {
                target: Target::Portal,
                name: self.portal.clone(),
            }
            .encode(),
        );

        let execute = ExecuteMessage {
            portal: self.portal.clone(),
            max_rows: self.max_rows,
        };
        for _ in 0..self.executions.max(1) {
            buf.unsplit(execute.encode());
        }

        buf.unsplit(SyncMessage.encode());
        buf
    }
}

/// Continue a portal suspended by an earlier request: Execute, optionally
/// Close, then Sync.
///
/// The portal only survives the earlier Sync inside an explicit transaction;
/// otherwise the server answers with an ErrorResponse.
#[derive(Debug, Clone)]
pub struct PortalFetch {
    pub portal: String,
    /// Row limit for this Execute, 0 = unlimited
    pub max_rows: u32,
    /// Release the portal after this batch
    pub close: bool,
}

impl PortalFetch {
    pub fn new(portal: impl Into<String>, max_rows: u32) -> Self {
        Self {
            portal: portal.into(),
            max_rows,
            close: false,
        }
    }

    pub fn close_after(mut self) -> Self {
        self.close = true;
        self
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = ExecuteMessage {
            portal: self.portal.clone(),
            max_rows: self.max_rows,
        }
        .encode();
        if self.close {
            buf.unsplit(
                CloseMessage {
                    target: Target::Portal,
                    name: self.portal.clone(),
                }
                .encode(),
            );
        }
        buf.unsplit(SyncMessage.encode());
        buf
    }
}

/// How one Execute ended.
#[derive(Debug, Clone)]
pub enum ExecuteOutcome {
    /// Row limit reached; another Execute continues the portal
    Suspended(QueryResult),
    /// Portal exhausted; the result carries the command tag
    Complete(QueryResult),
}

impl ExecuteOutcome {
    pub fn result(&self) -> &QueryResult {
        match self {
            ExecuteOutcome::Suspended(r) | ExecuteOutcome::Complete(r) => r,
        }
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self, ExecuteOutcome::Suspended(_))
    }
}

/// Outcome of an [`ExtendedQuery`], delivered at the ReadyForQuery after Sync.
#[derive(Debug, Clone, Default)]
pub struct ExtendedResult {
    /// Parameter types reported by ParameterDescription, if any
    pub param_types: Vec<Oid>,
    /// One entry per Execute that produced output, in order
    pub outcomes: Vec<ExecuteOutcome>,
}

impl ExtendedResult {
    /// All rows across batches, in arrival order.
    pub fn rows(&self) -> impl Iterator<Item = &super::result::Row> {
        self.outcomes.iter().flat_map(|o| o.result().rows.iter())
    }

    pub fn row_count(&self) -> usize {
        self.outcomes.iter().map(|o| o.result().len()).sum()
    }

    /// Command tag of the completing Execute.
    pub fn command_tag(&self) -> Option<&str> {
        self.outcomes.iter().rev().find_map(|o| match o {
            ExecuteOutcome::Complete(r) => Some(r.command_tag.as_str()),
            ExecuteOutcome::Suspended(_) => None,
        })
    }

    /// True if the last batch stopped on the row limit.
    pub fn is_suspended(&self) -> bool {
        self.outcomes.last().is_some_and(ExecuteOutcome::is_suspended)
    }
}
