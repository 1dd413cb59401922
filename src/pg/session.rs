//! Sans-IO session: owns all per-connection protocol state and correlates
//! backend replies with the single in-flight request.
//!
//! The caller feeds whatever bytes arrive into [`Session::handle_inbound`]
//! and writes out whatever [`Session::take_outbound`] returns. Requests are
//! registered with [`Session::simple_query`] / [`Session::extended_query`],
//! which hand back a one-shot [`Pending`] handle.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::BytesMut;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use super::auth::{AuthenticationState, Authenticator};
use super::error::{PgError, PgResult, ServerError};
use super::extended::{ExecuteOutcome, ExtendedQuery, ExtendedResult, PortalFetch};
use super::frontend::{FrontendMessage, QueryMessage, StartupMessage, TerminateMessage};
use super::protocol::{split_message, BackendKeyData, BackendMessage, TransactionStatus};
use super::result::{PendingResult, QueryResult, Row, SharedColumns};
use super::types::Oid;

/// Login data for the startup message and the handshake.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub user: String,
    pub password: Option<String>,
    pub database: Option<String>,
    /// Extra startup parameters, e.g. `application_name`
    pub options: Vec<(String, String)>,
}

impl Credentials {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            ..Default::default()
        }
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.push((key.into(), value.into()));
        self
    }
}

/// Something observable that happened while processing inbound bytes.
#[derive(Debug, Clone)]
pub enum Event {
    Authenticated,
    ParameterStatus { name: String, value: String },
    BackendKeyData(BackendKeyData),
    ReadyForQuery(TransactionStatus),
    RowDescription(SharedColumns),
    DataRow(Row),
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    ParameterDescription(Vec<Oid>),
    /// Execute hit its row limit; `rows` is the size of the batch just closed
    PortalSuspended { rows: usize },
    CommandComplete { tag: String },
    EmptyQuery,
    ErrorResponse(ServerError),
    Notice(ServerError),
    Notification {
        process_id: u32,
        channel: String,
        payload: String,
    },
}

// ============================================================================
// Pending handles
// ============================================================================

/// One-shot handle resolving to exactly one outcome of a request.
///
/// Await it, or poll it with [`Pending::try_take`] when driving the session
/// by hand. A session dropped or torn down before answering resolves it to
/// [`PgError::ConnectionClosed`].
#[derive(Debug)]
pub struct Pending<T> {
    rx: oneshot::Receiver<PgResult<T>>,
}

pub type PendingQuery = Pending<QueryResult>;
pub type PendingExtended = Pending<ExtendedResult>;

impl<T> Pending<T> {
    /// Take the outcome if it has arrived. Only the first `Some` carries it.
    pub fn try_take(&mut self) -> Option<PgResult<T>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(PgError::ConnectionClosed)),
        }
    }
}

impl<T> Future for Pending<T> {
    type Output = PgResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|r| r.unwrap_or_else(|_| Err(PgError::ConnectionClosed)))
    }
}

/// What a simple query has produced so far. Only the first statement's
/// result is kept; any ErrorResponse before ReadyForQuery fails the request.
#[derive(Default)]
struct SimpleOutcome {
    result: Option<QueryResult>,
    error: Option<ServerError>,
}

impl SimpleOutcome {
    fn into_result(self) -> PgResult<QueryResult> {
        match self.error {
            Some(err) => Err(PgError::Server(err)),
            None => Ok(self.result.unwrap_or_else(QueryResult::empty)),
        }
    }
}

enum Request {
    Simple {
        tx: oneshot::Sender<PgResult<QueryResult>>,
        outcome: SimpleOutcome,
    },
    Extended {
        tx: oneshot::Sender<PgResult<ExtendedResult>>,
        result: ExtendedResult,
        portal: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Simple,
    Extended,
}

struct PendingRequest {
    /// ReadyForQuery messages owed to earlier requests before ours start
    skip_ready: usize,
    request: Request,
    /// Columns of the portal being continued, applied once the request is active
    resume: Option<SharedColumns>,
}

impl PendingRequest {
    fn reject(self, err: PgError) {
        // The receiver may already be gone; nothing to deliver to then
        match self.request {
            Request::Simple { tx, .. } => {
                let _ = tx.send(Err(err));
            }
            Request::Extended { tx, .. } => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// Per-connection protocol state.
pub struct Session {
    auth: Authenticator,
    parameters: HashMap<String, String>,
    backend_key: Option<BackendKeyData>,
    transaction_status: TransactionStatus,
    current: PendingResult,
    pending: Option<PendingRequest>,
    /// Portals left suspended in the current transaction
    portals: HashMap<String, SharedColumns>,
    /// Unconsumed tail of the inbound stream
    inbound: BytesMut,
    outbound: BytesMut,
    /// First ReadyForQuery after authentication seen
    startup_complete: bool,
    /// ReadyForQuery messages the server still owes us
    outstanding_ready: usize,
    broken: bool,
}

impl Session {
    /// Start a session, returning it with the startup message to send.
    pub fn connect(credentials: Credentials) -> (Self, BytesMut) {
        let startup = StartupMessage {
            user: credentials.user.clone(),
            database: credentials.database.clone(),
            options: credentials.options.clone(),
        }
        .encode();

        let mut auth = Authenticator::new(credentials.user, credentials.password);
        auth.startup_sent();
        trace!(len = startup.len(), "sending StartupMessage");

        let session = Self {
            auth,
            parameters: HashMap::new(),
            backend_key: None,
            transaction_status: TransactionStatus::Idle,
            current: PendingResult::new(),
            pending: None,
            portals: HashMap::new(),
            inbound: BytesMut::with_capacity(8192),
            outbound: BytesMut::new(),
            startup_complete: false,
            outstanding_ready: 0,
            broken: false,
        };
        (session, startup)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn auth_state(&self) -> &AuthenticationState {
        self.auth.state()
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth.is_authenticated()
    }

    /// Authenticated, startup finished and no request outstanding.
    pub fn is_ready(&self) -> bool {
        self.startup_complete && !self.broken && self.pending.is_none()
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Whether the server still owes ReadyForQuery for an earlier request.
    pub fn awaiting_ready(&self) -> bool {
        self.outstanding_ready > 0
    }

    pub fn parameters(&self) -> &HashMap<String, String> {
        &self.parameters
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(|s| s.as_str())
    }

    pub fn backend_key(&self) -> Option<BackendKeyData> {
        self.backend_key
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// The accumulator rows are currently decoded into.
    pub fn current_result(&self) -> &PendingResult {
        &self.current
    }

    /// Bytes queued for the server, if any.
    pub fn take_outbound(&mut self) -> Option<BytesMut> {
        if self.outbound.is_empty() {
            None
        } else {
            Some(self.outbound.split())
        }
    }

    // ========================================================================
    // Requests
    // ========================================================================

    fn check_can_register(&self) -> PgResult<()> {
        if self.broken {
            return Err(PgError::ConnectionClosed);
        }
        if !self.startup_complete {
            return Err(PgError::NotReady);
        }
        if self.pending.is_some() {
            return Err(PgError::RequestInFlight);
        }
        Ok(())
    }

    fn register(&mut self, request: Request, mut resume: Option<SharedColumns>, bytes: BytesMut) {
        let skip_ready = self.outstanding_ready;
        if skip_ready == 0 {
            self.begin(resume.take());
        }
        self.pending = Some(PendingRequest {
            skip_ready,
            request,
            resume,
        });
        self.outstanding_ready += 1;
        self.outbound.unsplit(bytes);
    }

    /// The pending request becomes the one replies belong to.
    fn begin(&mut self, resume: Option<SharedColumns>) {
        match resume {
            Some(columns) => self.current.resume(columns),
            None => self.current.reset(),
        }
    }

    /// Queue a Query message; resolves at its ReadyForQuery.
    ///
    /// The outcome is the first statement's result, or the first
    /// ErrorResponse if any statement of the string failed.
    pub fn simple_query(&mut self, query: &str) -> PgResult<PendingQuery> {
        self.check_can_register()?;

        let (tx, rx) = oneshot::channel();
        let bytes = QueryMessage {
            query: query.to_string(),
        }
        .encode();
        trace!(query, "sending Query");
        self.register(
            Request::Simple {
                tx,
                outcome: SimpleOutcome::default(),
            },
            None,
            bytes,
        );
        Ok(Pending { rx })
    }

    /// Queue a Parse/Bind/Describe/Execute/Sync sequence; resolves at the
    /// ReadyForQuery after Sync, or at the first ErrorResponse.
    pub fn extended_query(&mut self, query: &ExtendedQuery) -> PgResult<PendingExtended> {
        self.check_can_register()?;
        query.validate()?;

        trace!(
            query = %query.query,
            params = query.params.len(),
            executions = query.executions,
            "sending extended query"
        );
        // Bind replaces any earlier portal of the same name
        self.portals.remove(&query.portal);
        Ok(self.register_extended(query.portal.clone(), None, query.encode()))
    }

    /// Queue another Execute (and Sync) against a suspended portal.
    /// Resolves like [`Session::extended_query`].
    pub fn execute_portal(&mut self, fetch: &PortalFetch) -> PgResult<PendingExtended> {
        self.check_can_register()?;

        trace!(
            portal = %fetch.portal,
            max_rows = fetch.max_rows,
            close = fetch.close,
            "continuing portal"
        );
        let columns = if fetch.close {
            self.portals.remove(&fetch.portal)
        } else {
            self.portals.get(&fetch.portal).cloned()
        };
        Ok(self.register_extended(fetch.portal.clone(), columns, fetch.encode()))
    }

    fn register_extended(
        &mut self,
        portal: String,
        resume: Option<SharedColumns>,
        bytes: BytesMut,
    ) -> PendingExtended {
        let (tx, rx) = oneshot::channel();
        self.register(
            Request::Extended {
                tx,
                result: ExtendedResult::default(),
                portal,
            },
            resume,
            bytes,
        );
        Pending { rx }
    }

    /// Tear the session down, returning the Terminate message to send.
    pub fn terminate(&mut self) -> BytesMut {
        self.broken = true;
        if let Some(pending) = self.pending.take() {
            pending.reject(PgError::ConnectionClosed);
        }
        self.inbound.clear();
        trace!("sending Terminate");
        TerminateMessage.encode()
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Consume a chunk of the inbound stream, processing every complete
    /// message it finishes. Partial trailing bytes are kept for next time.
    ///
    /// An error here is fatal: the session is broken afterwards and the
    /// outstanding request, if any, is rejected with the same error.
    pub fn handle_inbound(&mut self, chunk: &[u8]) -> PgResult<Vec<Event>> {
        if self.broken {
            return Err(PgError::ConnectionClosed);
        }
        self.inbound.extend_from_slice(chunk);

        let mut events = Vec::new();
        loop {
            let msg = match split_message(&mut self.inbound) {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(e) => return Err(self.abort(e)),
            };
            let decoded = match BackendMessage::decode(&msg) {
                Ok(decoded) => decoded,
                Err(e) => return Err(self.abort(e)),
            };
            trace!(message = decoded.name(), len = msg.length(), "received");

            if let Err(e) = self.dispatch(decoded, &mut events) {
                return Err(self.abort(e));
            }
        }
        Ok(events)
    }

    fn abort(&mut self, err: PgError) -> PgError {
        debug!(error = %err, "session aborted");
        self.broken = true;
        self.inbound.clear();
        if let Some(pending) = self.pending.take() {
            pending.reject(err.clone());
        }
        err
    }

    fn dispatch(&mut self, msg: BackendMessage, events: &mut Vec<Event>) -> PgResult<()> {
        if !self.auth.state().is_terminal() {
            return self.dispatch_auth(msg, events);
        }

        match msg {
            BackendMessage::Authentication(req) => Err(PgError::Protocol(format!(
                "Authentication request {:?} after login",
                req
            ))),
            BackendMessage::ParameterStatus { name, value } => {
                debug!(%name, %value, "parameter status");
                self.parameters.insert(name.clone(), value.clone());
                events.push(Event::ParameterStatus { name, value });
                Ok(())
            }
            BackendMessage::BackendKeyData(key) => {
                if self.backend_key.is_some() {
                    return Err(PgError::Protocol(
                        "BackendKeyData received twice".to_string(),
                    ));
                }
                self.backend_key = Some(key);
                events.push(Event::BackendKeyData(key));
                Ok(())
            }
            BackendMessage::ReadyForQuery { status } => {
                self.on_ready(status);
                events.push(Event::ReadyForQuery(status));
                Ok(())
            }
            BackendMessage::RowDescription { columns } => {
                self.current.set_columns(columns);
                events.push(Event::RowDescription(self.current.columns.clone()));
                Ok(())
            }
            BackendMessage::DataRow { values } => {
                self.current.push_row(values.clone());
                events.push(Event::DataRow(values));
                Ok(())
            }
            BackendMessage::CommandComplete { tag } => {
                self.on_command_complete(tag.clone());
                events.push(Event::CommandComplete { tag });
                Ok(())
            }
            BackendMessage::EmptyQueryResponse => {
                self.on_empty_query();
                events.push(Event::EmptyQuery);
                Ok(())
            }
            BackendMessage::PortalSuspended => {
                let rows = self.on_portal_suspended();
                events.push(Event::PortalSuspended { rows });
                Ok(())
            }
            BackendMessage::ErrorResponse(err) if !self.startup_complete => {
                // e.g. FATAL 3D000 for a missing database, sent after AuthenticationOk
                debug!(code = err.code(), "startup rejected");
                Err(PgError::Server(err))
            }
            BackendMessage::ErrorResponse(err) => {
                self.on_error_response(err.clone());
                events.push(Event::ErrorResponse(err));
                Ok(())
            }
            BackendMessage::ParameterDescription { type_oids } => {
                if let Some(result) = self.extended_result() {
                    result.param_types = type_oids.clone();
                }
                events.push(Event::ParameterDescription(type_oids));
                Ok(())
            }
            BackendMessage::ParseComplete => {
                events.push(Event::ParseComplete);
                Ok(())
            }
            BackendMessage::BindComplete => {
                events.push(Event::BindComplete);
                Ok(())
            }
            BackendMessage::CloseComplete => {
                events.push(Event::CloseComplete);
                Ok(())
            }
            BackendMessage::NoData => {
                events.push(Event::NoData);
                Ok(())
            }
            BackendMessage::NoticeResponse(notice) => {
                warn!(notice = %notice, "server notice");
                events.push(Event::Notice(notice));
                Ok(())
            }
            BackendMessage::NotificationResponse {
                process_id,
                channel,
                payload,
            } => {
                debug!(process_id, %channel, "notification");
                events.push(Event::Notification {
                    process_id,
                    channel,
                    payload,
                });
                Ok(())
            }
        }
    }

    fn dispatch_auth(&mut self, msg: BackendMessage, events: &mut Vec<Event>) -> PgResult<()> {
        match msg {
            BackendMessage::Authentication(req) => {
                if let Some(response) = self.auth.handle(req)? {
                    trace!(len = response.len(), "sending authentication response");
                    self.outbound.unsplit(response);
                }
                if self.auth.is_authenticated() {
                    events.push(Event::Authenticated);
                }
                Ok(())
            }
            BackendMessage::ErrorResponse(err) => {
                self.auth.fail(err.to_string());
                Err(PgError::AuthRejected(err))
            }
            BackendMessage::NoticeResponse(notice) => {
                warn!(notice = %notice, "server notice during authentication");
                events.push(Event::Notice(notice));
                Ok(())
            }
            other => {
                let reason = format!(
                    "Unexpected {} during authentication in state {:?}",
                    other.name(),
                    self.auth.state()
                );
                self.auth.fail(reason.clone());
                Err(PgError::Protocol(reason))
            }
        }
    }

    // ========================================================================
    // Correlation
    // ========================================================================

    /// Kind of the pending request, once every earlier ReadyForQuery has arrived.
    fn active_kind(&self) -> Option<RequestKind> {
        match self.pending {
            Some(PendingRequest {
                skip_ready: 0,
                ref request,
                ..
            }) => Some(match request {
                Request::Simple { .. } => RequestKind::Simple,
                Request::Extended { .. } => RequestKind::Extended,
            }),
            _ => None,
        }
    }

    fn extended_result(&mut self) -> Option<&mut ExtendedResult> {
        match self.pending {
            Some(PendingRequest {
                skip_ready: 0,
                request: Request::Extended { ref mut result, .. },
                ..
            }) => Some(result),
            _ => None,
        }
    }

    fn active_portal(&self) -> Option<String> {
        match self.pending {
            Some(PendingRequest {
                skip_ready: 0,
                request: Request::Extended { ref portal, .. },
                ..
            }) => Some(portal.clone()),
            _ => None,
        }
    }

    fn simple_outcome(&mut self) -> Option<&mut SimpleOutcome> {
        match self.pending {
            Some(PendingRequest {
                skip_ready: 0,
                request: Request::Simple { ref mut outcome, .. },
                ..
            }) => Some(outcome),
            _ => None,
        }
    }

    fn on_ready(&mut self, status: TransactionStatus) {
        self.transaction_status = status;
        self.current.reset();
        if status == TransactionStatus::Idle {
            // Portals do not outlive their transaction
            self.portals.clear();
        }

        if !self.startup_complete {
            debug!(?status, "startup complete");
            self.startup_complete = true;
            return;
        }
        if self.outstanding_ready == 0 {
            warn!(?status, "unsolicited ReadyForQuery");
            return;
        }
        self.outstanding_ready -= 1;

        if let Some(pending) = self.pending.as_mut() {
            if pending.skip_ready > 0 {
                pending.skip_ready -= 1;
                if pending.skip_ready == 0 {
                    let resume = pending.resume.take();
                    self.begin(resume);
                }
                return;
            }
        }
        match self.pending.take().map(|p| p.request) {
            Some(Request::Simple { tx, outcome }) => {
                let outcome = outcome.into_result();
                debug!(ok = outcome.is_ok(), "simple query resolved");
                let _ = tx.send(outcome);
            }
            Some(Request::Extended { tx, result, .. }) => {
                debug!(batches = result.outcomes.len(), "extended query resolved");
                let _ = tx.send(Ok(result));
            }
            None => {}
        }
    }

    fn on_command_complete(&mut self, tag: String) {
        match self.active_kind() {
            Some(RequestKind::Simple) => {
                let result = self.current.finish(tag);
                if let Some(outcome) = self.simple_outcome() {
                    if outcome.result.is_none() {
                        trace!(
                            tag = %result.command_tag,
                            rows = result.len(),
                            "statement complete"
                        );
                        outcome.result = Some(result);
                    } else {
                        trace!(tag = %result.command_tag, "later statement complete");
                    }
                }
            }
            Some(RequestKind::Extended) => {
                let batch = self.current.finish(tag);
                if let Some(portal) = self.active_portal() {
                    self.portals.remove(&portal);
                }
                if let Some(result) = self.extended_result() {
                    result.outcomes.push(ExecuteOutcome::Complete(batch));
                }
            }
            None => {
                warn!(%tag, "unsolicited CommandComplete");
                self.current.reset();
            }
        }
    }

    fn on_empty_query(&mut self) {
        self.current.reset();
        match self.active_kind() {
            Some(RequestKind::Simple) => {
                if let Some(outcome) = self.simple_outcome() {
                    outcome.result.get_or_insert_with(QueryResult::empty);
                }
            }
            Some(RequestKind::Extended) => {
                if let Some(result) = self.extended_result() {
                    result
                        .outcomes
                        .push(ExecuteOutcome::Complete(QueryResult::empty()));
                }
            }
            None => warn!("unsolicited EmptyQueryResponse"),
        }
    }

    fn on_portal_suspended(&mut self) -> usize {
        let rows = self.current.row_count();
        if self.active_kind() == Some(RequestKind::Extended) {
            let batch = self.current.take_batch();
            trace!(rows, "portal suspended");
            if let Some(portal) = self.active_portal() {
                self.portals.insert(portal, batch.columns.clone());
            }
            if let Some(result) = self.extended_result() {
                result.outcomes.push(ExecuteOutcome::Suspended(batch));
            }
        } else {
            warn!(rows, "unsolicited PortalSuspended");
            self.current.reset();
        }
        rows
    }

    fn on_error_response(&mut self, err: ServerError) {
        self.current.reset();
        match self.active_kind() {
            // The server skips the rest of the string and still sends
            // ReadyForQuery, which delivers the failure
            Some(RequestKind::Simple) => {
                debug!(code = err.code(), "simple query failed");
                if let Some(outcome) = self.simple_outcome() {
                    outcome.error.get_or_insert(err);
                }
            }
            Some(RequestKind::Extended) => {
                debug!(code = err.code(), "extended query failed");
                if let Some(pending) = self.pending.take() {
                    pending.reject(PgError::Server(err));
                }
            }
            None => warn!(error = %err, "unsolicited ErrorResponse"),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("auth", self.auth.state())
            .field("transaction_status", &self.transaction_status)
            .field("startup_complete", &self.startup_complete)
            .field("pending", &self.pending.is_some())
            .field("outstanding_ready", &self.outstanding_ready)
            .field("broken", &self.broken)
            .finish()
    }
}
