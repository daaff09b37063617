//! the dispatch/drain engine.
//!
//! issue paths encode a request, flush it to the socket and return without
//! reading a reply. the drain loop consumes the reply stream and binds each
//! reply to the pending handle at the head of the queue, strictly in the
//! order requests were transmitted. every request is followed by a pipeline
//! sync boundary, so the reply stream is always consumed request by request
//! and the socket sits at a request boundary between drains.

use core::time::Duration;

use std::{io, sync::Arc};

use bytes::BytesMut;
use fallible_iterator::FallibleIterator;
use postgres_protocol::message::{backend, frontend};
use postgres_types::IsNull;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{
    column::Column,
    config::Config,
    deferred::{BindValue, DeferredCore},
    error::{
        self, ConnectionFailed, ConnectionReset, DbError, Error, InvalidParamCount,
        PreparedStatementCacheExpired, PriorQueryPipelineError,
    },
    outcome::QueryOutcome,
    queue::PendingQueue,
    row::{Row, RowSet},
    session::SessionInfo,
    statement::{Statement, StatementCache},
    transaction::{TransactionStatus, TxState},
    transport::{Connect, Transport},
    types::{ToSql, Type, TypeRegistry},
};

/// the drain loop logs a diagnostic when the backend produces no reply for
/// this long while handles are outstanding. an observation threshold, not a
/// deadline; the wait continues afterwards.
pub(crate) const STALL_WARN_SECONDS: u64 = 20;

/// per adapter state. the connection mutex serializes every pipeline
/// operation; the transaction bookkeeping has its own short lived lock so
/// guard drops can record a pending rollback without reaching the connection.
pub(crate) struct Shared {
    pub(crate) conn: tokio::sync::Mutex<Conn>,
    pub(crate) cfg: Config,
    pub(crate) connector: Arc<dyn Connect>,
    pub(crate) registry: TypeRegistry,
    pub(crate) tx: std::sync::Mutex<TxState>,
}

impl Shared {
    /// drain the connection until `core` is terminal. entry point for
    /// [Deferred::force].
    ///
    /// [Deferred::force]: crate::deferred::Deferred::force
    pub(crate) async fn drain_for(&self, core: &Arc<DeferredCore>) -> Result<(), Error> {
        let mut conn = self.conn.lock().await;
        conn.drain_until(&self.registry, Some(core)).await
    }
}

pub(crate) struct Conn {
    transport: Option<Transport>,
    pub(crate) queue: PendingQueue,
    pub(crate) statements: StatementCache,
    pub(crate) tx_status: TransactionStatus,
    pub(crate) session: Option<SessionInfo>,
    broken: bool,
}

/// the fully consumed reply of one request, read up to and including its sync
/// marker.
enum Reply {
    Ok(QueryOutcome),
    Db(DbError),
    /// the server skipped the request entirely and went straight to the sync
    /// marker. happens when an earlier request aborted the pipeline segment.
    Aborted,
}

impl Conn {
    pub(crate) fn new(transport: Transport, session: SessionInfo, statement_limit: usize) -> Self {
        Self {
            transport: Some(transport),
            queue: PendingQueue::new(),
            statements: StatementCache::new(statement_limit),
            tx_status: TransactionStatus::Idle,
            session: Some(session),
            broken: false,
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.transport.is_some() && !self.broken
    }

    pub(crate) fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// replace the transport after a reconnect. all connection scoped state
    /// starts over; server side prepared statements did not survive.
    pub(crate) fn replace(&mut self, transport: Transport, session: SessionInfo, statement_limit: usize) {
        self.transport = Some(transport);
        self.session = Some(session);
        self.statements = StatementCache::new(statement_limit);
        self.tx_status = TransactionStatus::Idle;
        self.broken = false;
    }

    pub(crate) fn close(&mut self) {
        self.transport = None;
        self.session = None;
        self.tx_status = TransactionStatus::Idle;
    }

    /// fail every handle still waiting on this connection. hooks run, so a
    /// caller installed hook can still observe the reset.
    pub(crate) fn abandon_queue(&mut self) {
        if !self.queue.is_empty() {
            warn!(pending = self.queue.len(), "discarding in-flight requests");
            self.queue.fail_all(|| ConnectionReset.into());
        }
    }

    fn transport_mut(&mut self) -> Result<&mut Transport, Error> {
        if self.broken {
            return Err(not_connected());
        }
        self.transport.as_mut().ok_or_else(not_connected)
    }

    /// send a best effort Terminate before dropping the stream.
    pub(crate) async fn send_terminate(&mut self) {
        if let Ok(t) = self.transport_mut() {
            frontend::terminate(&mut t.write_buf);
            let _ = t.send().await;
        }
    }

    // ------------------------------------------------------------------
    // issue paths. the caller holds the connection mutex; nothing here
    // waits on a reply.
    // ------------------------------------------------------------------

    /// encode an extended query through the unnamed statement and transmit it
    /// together with its sync boundary.
    pub(crate) async fn issue_unnamed(
        &mut self,
        core: &Arc<DeferredCore>,
        types: &[Type],
    ) -> Result<(), Error> {
        let t = self.transport_mut()?;
        let res = (|| {
            frontend::parse("", &core.sql, types.iter().map(Type::oid), &mut t.write_buf)?;
            encode_bind_raw("", &core.binds, &mut t.write_buf)?;
            frontend::describe(b'S', "", &mut t.write_buf)?;
            frontend::execute("", 0, &mut t.write_buf)?;
            frontend::sync(&mut t.write_buf);
            Ok::<_, Error>(())
        })();
        if let Err(e) = res {
            t.write_buf.clear();
            return Err(e);
        }
        self.transmit(core).await
    }

    /// encode the execution of an already prepared statement and transmit it
    /// together with its sync boundary.
    pub(crate) async fn issue_prepared(&mut self, core: &Arc<DeferredCore>, stmt: &Statement) -> Result<(), Error> {
        let t = self.transport_mut()?;
        if let Err(e) = encode_execute(stmt.name(), &core.binds, &mut t.write_buf) {
            t.write_buf.clear();
            return Err(e);
        }
        self.transmit(core).await
    }

    async fn transmit(&mut self, core: &Arc<DeferredCore>) -> Result<(), Error> {
        let t = self.transport_mut()?;
        if let Err(e) = t.send().await {
            self.broken = true;
            return Err(e);
        }
        self.queue.push(core.clone());
        Ok(())
    }

    // ------------------------------------------------------------------
    // drain loop
    // ------------------------------------------------------------------

    pub(crate) async fn drain_all(&mut self, registry: &TypeRegistry) -> Result<(), Error> {
        self.drain_until(registry, None).await
    }

    /// consume replies and resolve pending handles in FIFO order. with a
    /// target, stops once the target is terminal; without one, drains the
    /// whole queue. resolving a handle therefore resolves every handle issued
    /// before it as a side effect.
    pub(crate) async fn drain_until(
        &mut self,
        registry: &TypeRegistry,
        target: Option<&Arc<DeferredCore>>,
    ) -> Result<(), Error> {
        loop {
            if let Some(target) = target {
                if target.terminal().is_some() {
                    return Ok(());
                }
            }
            if self.queue.is_empty() {
                return Ok(());
            }
            if !self.is_open() {
                self.queue.fail_all(|| ConnectionReset.into());
                return Ok(());
            }

            self.drain_one(registry).await?;

            if self.tx_status == TransactionStatus::InError {
                debug!("transaction is in a failed state; ROLLBACK is required before further work succeeds");
            }
        }
    }

    /// resolve exactly the handle at the head of the queue.
    async fn drain_one(&mut self, registry: &TypeRegistry) -> Result<(), Error> {
        let Some(head) = self.queue.pop_front() else {
            return Ok(());
        };

        let mut expected = head.expected_columns.clone();
        let mut retried = false;

        loop {
            match self.read_reply(registry, expected.take()).await {
                Err(e) => {
                    self.broken = true;
                    head.assign_error(e);
                    self.queue.fail_all(|| ConnectionReset.into());
                    return Ok(());
                }
                Ok(Reply::Ok(outcome)) => {
                    debug!(name = &*head.name, sql = &*head.sql, "resolved");
                    head.assign(outcome);
                    return Ok(());
                }
                Ok(Reply::Aborted) => {
                    head.assign_error(PriorQueryPipelineError { db: None }.into());
                    return Ok(());
                }
                Ok(Reply::Db(db)) => {
                    if db.is_fatal() {
                        self.broken = true;
                        head.assign_error(error::translate_db(db, &head.sql));
                        self.queue.fail_all(|| ConnectionReset.into());
                        return Ok(());
                    }
                    if db.is_cached_plan_invalidated() && !retried && head.take_retry().is_some() {
                        if self.tx_status != TransactionStatus::Idle {
                            head.assign_error(PreparedStatementCacheExpired { db }.into());
                            return Ok(());
                        }
                        retried = true;
                        match self.replan(registry, &head).await {
                            Ok(stmt) => {
                                expected = Some(stmt.columns().clone());
                                continue;
                            }
                            Err(e) => {
                                head.assign_error(e);
                                return Ok(());
                            }
                        }
                    }
                    head.assign_error(error::translate_db(db, &head.sql));
                    return Ok(());
                }
            }
        }
    }

    /// read one request's reply, up to and including its sync marker.
    /// `Err` means the connection itself failed.
    async fn read_reply(
        &mut self,
        registry: &TypeRegistry,
        expected: Option<Arc<[Column]>>,
    ) -> Result<Reply, Error> {
        let mut columns = expected;
        let mut rows = Vec::new();
        let mut reply: Option<Reply> = None;

        loop {
            match self.recv_stalled().await? {
                backend::Message::ParseComplete
                | backend::Message::BindComplete
                | backend::Message::NoData
                | backend::Message::PortalSuspended
                | backend::Message::ParameterDescription(_)
                | backend::Message::ParameterStatus(_) => {}
                backend::Message::RowDescription(body) => {
                    columns = Some(build_columns(registry, &body)?);
                }
                backend::Message::DataRow(body) => {
                    if reply.is_none() {
                        let cols = columns.clone().ok_or_else(Error::unexpected)?;
                        rows.push(Row::try_new(cols, &body)?);
                    }
                }
                backend::Message::CommandComplete(body) => {
                    let tag = body.tag().map_err(|_| Error::unexpected())?;
                    let outcome = match columns.take() {
                        Some(cols) if !cols.is_empty() => {
                            QueryOutcome::RowSet(RowSet::new(cols, std::mem::take(&mut rows)))
                        }
                        _ => QueryOutcome::Affected(affected_rows(tag)),
                    };
                    reply.get_or_insert(Reply::Ok(outcome));
                }
                backend::Message::EmptyQueryResponse => {
                    reply.get_or_insert(Reply::Ok(QueryOutcome::Affected(0)));
                }
                backend::Message::ErrorResponse(body) => {
                    let db = DbError::parse(&mut body.fields())?;
                    if db.is_fatal() {
                        // the backend closes the connection without a sync marker
                        return Ok(Reply::Db(db));
                    }
                    reply = Some(Reply::Db(db));
                }
                backend::Message::ReadyForQuery(body) => {
                    self.tx_status = TransactionStatus::from_status_byte(body.status());
                    match reply {
                        Some(reply) => return Ok(reply),
                        None if self.tx_status == TransactionStatus::InError => return Ok(Reply::Aborted),
                        None => debug!("sync marker with no reply before it"),
                    }
                }
                backend::Message::NoticeResponse(body) => log_notice(&body),
                _ => return Err(Error::unexpected()),
            }
        }
    }

    /// wait for the next backend message, surfacing a diagnostic instead of
    /// spinning silently when no progress is made.
    async fn recv_stalled(&mut self) -> Result<backend::Message, Error> {
        if self.broken {
            return Err(not_connected());
        }
        let pending = self.queue.len();
        let Some(transport) = self.transport.as_mut() else {
            return Err(not_connected());
        };

        let res = loop {
            match timeout(Duration::from_secs(STALL_WARN_SECONDS), transport.recv()).await {
                Ok(Ok(msg)) => break Ok(msg),
                Ok(Err(e)) => break Err(e),
                Err(_) => warn!(
                    pending,
                    "backend produced no reply for {STALL_WARN_SECONDS}s; drain is still waiting"
                ),
            }
        };

        if res.is_err() {
            self.broken = true;
        }
        res
    }

    /// cached plan recovery. drains everything behind the failed request so
    /// the socket is at a boundary, deallocates the stale statement,
    /// re-prepares and re-issues the execute with the binds as originally
    /// sent. the caller keeps reading for the same head handle.
    async fn replan(&mut self, registry: &TypeRegistry, head: &Arc<DeferredCore>) -> Result<Statement, Error> {
        debug!(sql = &*head.sql, "cached plan invalidated; re-preparing");

        while !self.queue.is_empty() {
            Box::pin(self.drain_one(registry)).await?;
            if !self.is_open() {
                return Err(not_connected());
            }
        }

        if let Some(stale) = self.statements.remove(&head.sql) {
            if let Err(e) = self.close_statement(stale.name()).await {
                warn!(error = %e, statement = stale.name(), "failed to deallocate stale statement");
            }
        }

        let stmt = self.prepare_statement(registry, &head.sql).await?;
        if let Some(evicted) = self.statements.insert(&head.sql, stmt.clone()) {
            if let Err(e) = self.close_statement(evicted.name()).await {
                warn!(error = %e, statement = evicted.name(), "failed to deallocate evicted statement");
            }
        }

        let t = self.transport_mut()?;
        if let Err(e) = encode_execute(stmt.name(), &head.binds, &mut t.write_buf) {
            t.write_buf.clear();
            return Err(e);
        }
        if let Err(e) = t.send().await {
            self.broken = true;
            return Err(e);
        }
        log_issue(&head.name, &head.sql, head.binds.len(), Some(stmt.name()));
        Ok(stmt)
    }

    // ------------------------------------------------------------------
    // synchronous control statements. callers drain the queue first so these
    // never interleave with user handles.
    // ------------------------------------------------------------------

    /// PREPARE through the extended protocol: parse + describe + sync, reply
    /// consumed in place. parameter types and result columns come from the
    /// describe reply, resolved through the registry.
    pub(crate) async fn prepare_statement(&mut self, registry: &TypeRegistry, sql: &str) -> Result<Statement, Error> {
        debug_assert!(self.queue.is_empty());

        let name = self.statements.next_name();
        let t = self.transport_mut()?;
        let res = (|| {
            frontend::parse(&name, sql, core::iter::empty(), &mut t.write_buf)?;
            frontend::describe(b'S', &name, &mut t.write_buf)?;
            frontend::sync(&mut t.write_buf);
            Ok::<_, Error>(())
        })();
        if let Err(e) = res {
            t.write_buf.clear();
            return Err(e);
        }
        if let Err(e) = t.send().await {
            self.broken = true;
            return Err(e);
        }
        log_issue("PREPARE [SYNC]", sql, 0, Some(&name));

        let mut params = Vec::new();
        let mut columns = Vec::new();
        let mut err: Option<Error> = None;

        loop {
            match self.recv_stalled().await? {
                backend::Message::ParseComplete | backend::Message::NoData => {}
                backend::Message::ParameterDescription(body) => {
                    let mut iter = body.parameters();
                    while let Some(oid) = iter.next().map_err(Error::from)? {
                        params.push(registry.resolve(oid, -1, ""));
                    }
                }
                backend::Message::RowDescription(body) => {
                    let mut fields = body.fields();
                    while let Some(field) = fields.next()? {
                        let ty = registry.resolve(field.type_oid(), field.type_modifier(), field.name());
                        columns.push(Column::new(field.name(), ty, field.type_modifier()));
                    }
                }
                backend::Message::ErrorResponse(body) => {
                    let db = DbError::parse(&mut body.fields())?;
                    if db.is_fatal() {
                        self.broken = true;
                        return Err(error::translate_db(db, sql));
                    }
                    err = Some(error::translate_db(db, sql));
                }
                backend::Message::ReadyForQuery(body) => {
                    self.tx_status = TransactionStatus::from_status_byte(body.status());
                    return match err {
                        Some(e) => Err(e),
                        None => Ok(Statement::new(name, params, Arc::from(columns))),
                    };
                }
                backend::Message::NoticeResponse(body) => log_notice(&body),
                backend::Message::ParameterStatus(_) => {}
                _ => return Err(Error::unexpected()),
            }
        }
    }

    /// DEALLOCATE through the extended protocol: close + sync.
    pub(crate) async fn close_statement(&mut self, name: &str) -> Result<(), Error> {
        let t = self.transport_mut()?;
        if let Err(e) = frontend::close(b'S', name, &mut t.write_buf) {
            t.write_buf.clear();
            return Err(e.into());
        }
        frontend::sync(&mut t.write_buf);
        if let Err(e) = t.send().await {
            self.broken = true;
            return Err(e);
        }
        log_issue("DEALLOCATE [SYNC]", name, 0, None);

        let mut err: Option<Error> = None;
        loop {
            match self.recv_stalled().await? {
                backend::Message::CloseComplete => {}
                backend::Message::ErrorResponse(body) => {
                    let db = DbError::parse(&mut body.fields())?;
                    if db.is_fatal() {
                        self.broken = true;
                        return Err(db.into());
                    }
                    err = Some(db.into());
                }
                backend::Message::ReadyForQuery(body) => {
                    self.tx_status = TransactionStatus::from_status_byte(body.status());
                    return match err {
                        Some(e) => Err(e),
                        None => Ok(()),
                    };
                }
                backend::Message::NoticeResponse(body) => log_notice(&body),
                backend::Message::ParameterStatus(_) => {}
                _ => return Err(Error::unexpected()),
            }
        }
    }

    /// run raw statement text through the simple query protocol and consume
    /// the reply including its ready-for-query boundary. rows come back as
    /// text. multi statement strings accumulate into one outcome.
    pub(crate) async fn sync_simple(&mut self, sql: &str, name: &str) -> Result<QueryOutcome, Error> {
        debug_assert!(self.queue.is_empty());

        let t = self.transport_mut()?;
        if let Err(e) = frontend::query(sql, &mut t.write_buf) {
            t.write_buf.clear();
            return Err(e.into());
        }
        if let Err(e) = t.send().await {
            self.broken = true;
            return Err(e);
        }
        log_issue(&format!("{name} [SYNC]"), sql, 0, None);

        let mut saw_rows = false;
        let mut raw_rows: Vec<Vec<Option<String>>> = Vec::new();
        let mut affected = 0;
        let mut err: Option<Error> = None;

        loop {
            match self.recv_stalled().await? {
                backend::Message::RowDescription(_) => saw_rows = true,
                backend::Message::DataRow(body) => {
                    if err.is_none() {
                        raw_rows.push(decode_text_row(&body)?);
                    }
                }
                backend::Message::CommandComplete(body) => {
                    let tag = body.tag().map_err(|_| Error::unexpected())?;
                    affected = affected_rows(tag);
                }
                backend::Message::EmptyQueryResponse => {}
                backend::Message::ErrorResponse(body) => {
                    let db = DbError::parse(&mut body.fields())?;
                    if db.is_fatal() {
                        self.broken = true;
                        return Err(error::translate_db(db, sql));
                    }
                    err.get_or_insert(error::translate_db(db, sql));
                }
                backend::Message::ReadyForQuery(body) => {
                    self.tx_status = TransactionStatus::from_status_byte(body.status());
                    return match err {
                        Some(e) => Err(e),
                        None if saw_rows => Ok(QueryOutcome::Raw(raw_rows)),
                        None => Ok(QueryOutcome::Affected(affected)),
                    };
                }
                backend::Message::NoticeResponse(body) => log_notice(&body),
                backend::Message::ParameterStatus(_) => {}
                _ => return Err(Error::unexpected()),
            }
        }
    }
}

// ----------------------------------------------------------------------
// encoding helpers
// ----------------------------------------------------------------------

/// encode bind parameters from user values, capturing each encoded value so
/// the handle can show and re-issue its binds as sent.
pub(crate) fn encode_binds(params: &[&(dyn ToSql + Sync)], types: &[Type]) -> Result<Vec<BindValue>, Error> {
    if params.len() != types.len() {
        return Err(InvalidParamCount {
            expected: types.len(),
            params: params.len(),
        }
        .into());
    }

    params
        .iter()
        .zip(types)
        .map(|(p, ty)| {
            let mut buf = BytesMut::new();
            let is_null = p.to_sql_checked(ty, &mut buf).map_err(Error::from_boxed)?;
            Ok(BindValue {
                format: match p.encode_format(ty) {
                    postgres_types::Format::Text => 0,
                    postgres_types::Format::Binary => 1,
                },
                value: match is_null {
                    IsNull::No => Some(buf.to_vec()),
                    IsNull::Yes => None,
                },
            })
        })
        .collect()
}

fn encode_bind_raw(statement: &str, binds: &[BindValue], buf: &mut BytesMut) -> Result<(), Error> {
    frontend::bind(
        "",
        statement,
        binds.iter().map(|b| b.format),
        binds.iter(),
        |b, buf| {
            Ok::<_, Box<dyn std::error::Error + Sync + Send>>(match &b.value {
                Some(value) => {
                    buf.extend_from_slice(value);
                    postgres_protocol::IsNull::No
                }
                None => postgres_protocol::IsNull::Yes,
            })
        },
        Some(1),
        buf,
    )
    .map_err(|e| match e {
        frontend::BindError::Conversion(e) => Error::from_boxed(e),
        frontend::BindError::Serialization(e) => e.into(),
    })
}

fn encode_execute(statement: &str, binds: &[BindValue], buf: &mut BytesMut) -> Result<(), Error> {
    encode_bind_raw(statement, binds, buf)?;
    frontend::execute("", 0, buf)?;
    frontend::sync(buf);
    Ok(())
}

// ----------------------------------------------------------------------
// decoding helpers
// ----------------------------------------------------------------------

fn build_columns(registry: &TypeRegistry, body: &backend::RowDescriptionBody) -> Result<Arc<[Column]>, Error> {
    let mut fields = body.fields();
    let mut columns = Vec::new();
    while let Some(field) = fields.next()? {
        let ty = registry.resolve(field.type_oid(), field.type_modifier(), field.name());
        columns.push(Column::new(field.name(), ty, field.type_modifier()));
    }
    Ok(Arc::from(columns))
}

fn decode_text_row(body: &backend::DataRowBody) -> Result<Vec<Option<String>>, Error> {
    let buffer = body.buffer();
    let mut iter = body.ranges();
    let mut row = Vec::with_capacity(iter.size_hint().0);
    while let Some(range) = iter.next()? {
        row.push(range.map(|r| String::from_utf8_lossy(&buffer[r]).into_owned()));
    }
    Ok(row)
}

/// Extract the number of rows affected from a command tag.
fn affected_rows(tag: &str) -> u64 {
    tag.rsplit(' ').next().and_then(|n| n.parse().ok()).unwrap_or(0)
}

fn log_notice(body: &backend::NoticeResponseBody) {
    if let Ok(db) = DbError::parse(&mut body.fields()) {
        debug!(code = db.code().code(), "notice: {}", db.message());
    }
}

pub(crate) fn log_issue(name: &str, sql: &str, binds: usize, prepared: Option<&str>) {
    match prepared {
        Some(prepared) => debug!(target: "postgres_pipeline::sql", name, sql, binds, prepared, "issue"),
        None => debug!(target: "postgres_pipeline::sql", name, sql, binds, "issue"),
    }
}

#[cold]
#[inline(never)]
fn not_connected() -> Error {
    ConnectionFailed(io::Error::new(io::ErrorKind::NotConnected, "connection is closed")).into()
}
