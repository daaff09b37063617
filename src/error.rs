//! error types of the adapter. typed error handling is done through runtime
//! downcast of the public [Error] type.

mod sql_state;

pub use postgres_types::{WasNull, WrongType};

use core::{
    convert::Infallible,
    fmt,
    ops::{Deref, DerefMut},
};

use std::{error, io, sync::Arc};

use fallible_iterator::FallibleIterator;
use postgres_protocol::message::backend::ErrorFields;

pub use self::sql_state::SqlState;

/// public facing error type. providing basic format and display based error handling.
///
/// for typed based error handling runtime type cast is needed with the help of other
/// public error types offered by this module.
///
/// # Example
/// ```rust
/// use postgres_pipeline::error::{Error, PriorQueryPipelineError};
///
/// fn failed_because_of_earlier_request(e: &Error) -> bool {
///     e.downcast_ref::<PriorQueryPipelineError>().is_some()
/// }
/// ```
pub struct Error(Box<dyn error::Error + Send + Sync>);

impl Error {
    /// look up a typed error. unlike `dyn Error::downcast_ref` this follows the
    /// shared error produced by repeated forcing of a failed deferred handle.
    pub fn downcast_ref<T>(&self) -> Option<&T>
    where
        T: error::Error + 'static,
    {
        if let Some(e) = (*self.0).downcast_ref::<T>() {
            return Some(e);
        }
        (*self.0)
            .downcast_ref::<SharedError>()
            .and_then(|e| e.0.downcast_ref::<T>())
    }

    /// the backend error attached to this error, if any.
    pub fn db_error(&self) -> Option<&DbError> {
        if let Some(e) = self.downcast_ref::<DbError>() {
            return Some(e);
        }
        if let Some(e) = self.downcast_ref::<StatementInvalid>() {
            return Some(&e.db);
        }
        if let Some(e) = self.downcast_ref::<DataError>() {
            return Some(&e.db);
        }
        if let Some(e) = self.downcast_ref::<PriorQueryPipelineError>() {
            return e.db.as_ref();
        }
        self.downcast_ref::<PreparedStatementCacheExpired>().map(|e| &e.db)
    }

    /// true when the underlying connection is unusable after this error.
    pub fn is_connection_failed(&self) -> bool {
        self.downcast_ref::<ConnectionFailed>().is_some() || self.downcast_ref::<ConnectionReset>().is_some()
    }

    pub(crate) fn db(fields: &mut ErrorFields<'_>) -> Self {
        match DbError::parse(fields) {
            Ok(e) => e.into(),
            Err(e) => e.into(),
        }
    }

    pub(crate) fn unexpected() -> Self {
        Self(Box::new(UnexpectedMessage))
    }

    pub(crate) fn shared(e: Arc<Error>) -> Self {
        Self(Box::new(SharedError(e)))
    }

    pub(crate) fn from_boxed(e: Box<dyn error::Error + Send + Sync>) -> Self {
        Self(e)
    }
}

impl Deref for Error {
    type Target = dyn error::Error + Send + Sync;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl DerefMut for Error {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.0
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.0.source()
    }
}

impl From<Infallible> for Error {
    fn from(e: Infallible) -> Self {
        match e {}
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self(Box::new(ConnectionFailed(e)))
    }
}

macro_rules! from_impl {
    ($ty:ty) => {
        impl From<$ty> for Error {
            fn from(e: $ty) -> Self {
                Self(Box::new(e))
            }
        }
    };
}

from_impl!(WrongType);

/// a failure already observed through another clone of the same deferred handle.
pub struct SharedError(Arc<Error>);

impl fmt::Debug for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl error::Error for SharedError {}

/// backend rejected a statement. syntax, constraint and type failures end up here.
#[derive(Debug)]
pub struct StatementInvalid {
    pub(crate) db: DbError,
    pub(crate) sql: Box<str>,
}

impl StatementInvalid {
    pub fn db_error(&self) -> &DbError {
        &self.db
    }

    /// text of the statement the backend rejected.
    pub fn sql(&self) -> &str {
        &self.sql
    }
}

impl fmt::Display for StatementInvalid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.db.message(), self.sql)
    }
}

impl error::Error for StatementInvalid {}

from_impl!(StatementInvalid);

/// data-level backend rejection. SQLSTATE class 22, including value-too-long.
#[derive(Debug)]
pub struct DataError {
    pub(crate) db: DbError,
    pub(crate) sql: Box<str>,
}

impl DataError {
    pub fn db_error(&self) -> &DbError {
        &self.db
    }

    /// true for string-data-right-truncation (22001).
    pub fn is_value_too_long(&self) -> bool {
        *self.db.code() == SqlState::STRING_DATA_RIGHT_TRUNCATION
    }
}

impl fmt::Display for DataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.db.message(), self.sql)
    }
}

impl error::Error for DataError {}

from_impl!(DataError);

/// this request was aborted because an earlier request in the same pipeline failed.
/// roll back and retry the remaining work on a fresh sync boundary.
#[derive(Debug)]
pub struct PriorQueryPipelineError {
    pub(crate) db: Option<DbError>,
}

impl fmt::Display for PriorQueryPipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a prior query in the pipeline failed")?;
        if let Some(db) = &self.db {
            write!(f, ": {}", db.message())?;
        }
        Ok(())
    }
}

impl error::Error for PriorQueryPipelineError {}

from_impl!(PriorQueryPipelineError);

/// a cached plan was invalidated by a schema change while inside a transaction.
/// not recoverable without a rollback. outside of transactions the adapter
/// re-prepares and retries transparently instead of surfacing this error.
#[derive(Debug)]
pub struct PreparedStatementCacheExpired {
    pub(crate) db: DbError,
}

impl fmt::Display for PreparedStatementCacheExpired {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "prepared statement cache expired: {}", self.db.message())
    }
}

impl error::Error for PreparedStatementCacheExpired {}

from_impl!(PreparedStatementCacheExpired);

/// socket or protocol level failure. the connection is likely unusable and
/// [Adapter::active] will report false.
///
/// [Adapter::active]: crate::Adapter::active
#[derive(Debug)]
pub struct ConnectionFailed(pub(crate) io::Error);

impl fmt::Display for ConnectionFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connection failed: {}", self.0)
    }
}

impl error::Error for ConnectionFailed {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        Some(&self.0)
    }
}

from_impl!(ConnectionFailed);

/// the connection was reset or closed while this request was still in flight.
/// the request may or may not have executed on the server.
#[derive(Debug)]
pub struct ConnectionReset;

impl fmt::Display for ConnectionReset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("connection was reset with requests still in flight")
    }
}

impl error::Error for ConnectionReset {}

from_impl!(ConnectionReset);

/// a write statement was issued while the adapter is configured read only.
/// raised before anything is transmitted to the backend.
#[derive(Debug)]
pub struct ReadOnlyError {
    pub(crate) sql: Box<str>,
}

impl ReadOnlyError {
    pub fn sql(&self) -> &str {
        &self.sql
    }
}

impl fmt::Display for ReadOnlyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "write query attempted on a read only connection: {}", self.sql)
    }
}

impl error::Error for ReadOnlyError {}

from_impl!(ReadOnlyError);

/// library user failed to provide valid authentication info to database server.
#[derive(Debug)]
pub enum AuthenticationError {
    MissingUserName,
    MissingPassWord,
    WrongPassWord,
    UnsupportedMechanism,
}

impl fmt::Display for AuthenticationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::MissingUserName => f.write_str("username is missing")?,
            Self::MissingPassWord => f.write_str("password is missing")?,
            Self::WrongPassWord => f.write_str("password is wrong")?,
            Self::UnsupportedMechanism => f.write_str("no supported SASL mechanism offered")?,
        }
        f.write_str(" for authentication")
    }
}

impl error::Error for AuthenticationError {}

from_impl!(AuthenticationError);

/// connection configuration could not be parsed or is incomplete.
#[derive(Debug)]
pub struct ConfigError(pub(crate) Box<str>);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid configuration: {}", self.0)
    }
}

impl error::Error for ConfigError {}

from_impl!(ConfigError);

#[derive(Debug)]
pub struct UnexpectedMessage;

impl fmt::Display for UnexpectedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("unexpected message from database")
    }
}

impl error::Error for UnexpectedMessage {}

#[derive(Debug)]
pub struct InvalidParamCount {
    pub expected: usize,
    pub params: usize,
}

impl fmt::Display for InvalidParamCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "expected {} query parameters but got {}",
            self.expected, self.params
        )
    }
}

impl error::Error for InvalidParamCount {}

from_impl!(InvalidParamCount);

#[derive(Debug)]
pub struct InvalidColumnIndex(pub String);

impl fmt::Display for InvalidColumnIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid column index: {}", self.0)
    }
}

impl error::Error for InvalidColumnIndex {}

from_impl!(InvalidColumnIndex);

#[cold]
#[inline(never)]
pub(crate) fn unexpected_eof_err() -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "zero byte read. remote close connection unexpectedly",
    )
}

/// classify a backend error reply for the statement at the head of the pipeline.
pub(crate) fn translate_db(db: DbError, sql: &str) -> Error {
    let sql = Box::from(sql);
    if *db.code() == SqlState::IN_FAILED_SQL_TRANSACTION {
        return PriorQueryPipelineError { db: Some(db) }.into();
    }
    if db.code().code().starts_with("22") {
        return DataError { db, sql }.into();
    }
    StatementInvalid { db, sql }.into()
}

/// A Postgres error or notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbError {
    severity: String,
    parsed_severity: Option<Severity>,
    code: SqlState,
    message: String,
    detail: Option<String>,
    hint: Option<String>,
    position: Option<u32>,
    schema: Option<String>,
    table: Option<String>,
    column: Option<String>,
    constraint: Option<String>,
    routine: Option<String>,
}

impl DbError {
    #[cold]
    #[inline(never)]
    pub(crate) fn parse(fields: &mut ErrorFields<'_>) -> io::Result<DbError> {
        let mut severity = None;
        let mut parsed_severity = None;
        let mut code = None;
        let mut message = None;
        let mut detail = None;
        let mut hint = None;
        let mut position = None;
        let mut schema = None;
        let mut table = None;
        let mut column = None;
        let mut constraint = None;
        let mut routine = None;

        while let Some(field) = fields.next()? {
            let value = String::from_utf8_lossy(field.value_bytes());
            match field.type_() {
                b'S' => severity = Some(value.into_owned()),
                b'C' => code = Some(SqlState::from_code(&value)),
                b'M' => message = Some(value.into_owned()),
                b'D' => detail = Some(value.into_owned()),
                b'H' => hint = Some(value.into_owned()),
                b'P' => {
                    position = Some(value.parse::<u32>().map_err(|_| {
                        io::Error::new(io::ErrorKind::InvalidInput, "`P` field did not contain an integer")
                    })?);
                }
                b's' => schema = Some(value.into_owned()),
                b't' => table = Some(value.into_owned()),
                b'c' => column = Some(value.into_owned()),
                b'n' => constraint = Some(value.into_owned()),
                b'R' => routine = Some(value.into_owned()),
                b'V' => parsed_severity = Severity::from_str(&value),
                _ => {}
            }
        }

        let missing = |name| io::Error::new(io::ErrorKind::InvalidInput, format!("`{name}` field missing"));

        Ok(DbError {
            severity: severity.ok_or_else(|| missing("S"))?,
            parsed_severity,
            code: code.ok_or_else(|| missing("C"))?,
            message: message.ok_or_else(|| missing("M"))?,
            detail,
            hint,
            position,
            schema,
            table,
            column,
            constraint,
            routine,
        })
    }

    /// true when the backend reports a cached plan invalidated by a schema change.
    /// the statement must be re-prepared before it can run again.
    pub(crate) fn is_cached_plan_invalidated(&self) -> bool {
        self.code == SqlState::FEATURE_NOT_SUPPORTED
            && (self.message.contains("cached plan must not change result type")
                || self.routine.as_deref() == Some("RevalidateCachedQuery"))
    }

    /// true for errors the connection does not survive.
    pub(crate) fn is_fatal(&self) -> bool {
        matches!(self.parsed_severity, Some(Severity::Fatal | Severity::Panic))
    }

    /// The field contents are ERROR, FATAL, or PANIC, or a notice severity.
    pub fn severity(&self) -> &str {
        &self.severity
    }

    /// A parsed, nonlocalized version of `severity`.
    pub fn parsed_severity(&self) -> Option<Severity> {
        self.parsed_severity
    }

    /// The SQLSTATE code for the error.
    pub fn code(&self) -> &SqlState {
        &self.code
    }

    /// The primary human-readable error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// An optional secondary error message carrying more detail about the problem.
    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    /// An optional suggestion what to do about the problem.
    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    /// An optional error cursor position into the original query string.
    pub fn position(&self) -> Option<u32> {
        self.position
    }

    /// Name of the schema the error relates to, if any.
    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    /// Name of the table the error relates to, if any.
    pub fn table(&self) -> Option<&str> {
        self.table.as_deref()
    }

    /// Name of the column the error relates to, if any.
    pub fn column(&self) -> Option<&str> {
        self.column.as_deref()
    }

    /// Name of the constraint the error relates to, if any.
    pub fn constraint(&self) -> Option<&str> {
        self.constraint.as_deref()
    }

    /// The name of the source-code routine reporting the error.
    pub fn routine(&self) -> Option<&str> {
        self.routine.as_deref()
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}: {}", self.severity, self.message)?;
        if let Some(detail) = &self.detail {
            write!(fmt, "\nDETAIL: {detail}")?;
        }
        if let Some(hint) = &self.hint {
            write!(fmt, "\nHINT: {hint}")?;
        }
        Ok(())
    }
}

impl error::Error for DbError {}

from_impl!(DbError);

/// The severity of a Postgres error or notice.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Severity {
    Panic,
    Fatal,
    Error,
    Warning,
    Notice,
    Debug,
    Info,
    Log,
}

impl fmt::Display for Severity {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Severity::Panic => "PANIC",
            Severity::Fatal => "FATAL",
            Severity::Error => "ERROR",
            Severity::Warning => "WARNING",
            Severity::Notice => "NOTICE",
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Log => "LOG",
        };
        fmt.write_str(s)
    }
}

impl Severity {
    fn from_str(s: &str) -> Option<Severity> {
        match s {
            "PANIC" => Some(Severity::Panic),
            "FATAL" => Some(Severity::Fatal),
            "ERROR" => Some(Severity::Error),
            "WARNING" => Some(Severity::Warning),
            "NOTICE" => Some(Severity::Notice),
            "DEBUG" => Some(Severity::Debug),
            "INFO" => Some(Severity::Info),
            "LOG" => Some(Severity::Log),
            _ => None,
        }
    }
}
